//! UDP discovery of devices waiting in WiFi OTA mode

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::protocol::{DEFAULT_PORT, DISCOVERY_REPLY_PREFIX, DISCOVERY_REQUEST};

/// Broadcast a discovery request on the local network and collect replies
pub async fn discover_devices(wait: Duration) -> Vec<IpAddr> {
    let broadcast = SocketAddr::from(([255, 255, 255, 255], DEFAULT_PORT));
    discover_devices_at(broadcast, wait).await
}

/// Same as [`discover_devices`] with an explicit target (unicast or broadcast)
pub async fn discover_devices_at(target: SocketAddr, wait: Duration) -> Vec<IpAddr> {
    match probe(target, wait).await {
        Ok(devices) => devices,
        Err(e) => {
            log::error!("WiFi OTA: discovery failed: {:#}", e);
            Vec::new()
        }
    }
}

async fn probe(target: SocketAddr, wait: Duration) -> Result<Vec<IpAddr>> {
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .context("bind discovery socket")?;
    socket.set_broadcast(true).context("enable broadcast")?;
    socket
        .send_to(DISCOVERY_REQUEST, target)
        .await
        .with_context(|| format!("send discovery request to {}", target))?;
    log::debug!("WiFi OTA: sent discovery request to {}", target);

    let deadline = Instant::now() + wait;
    let mut devices = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                let reply = String::from_utf8_lossy(&buf[..n]);
                if reply.trim().starts_with(DISCOVERY_REPLY_PREFIX) && !devices.contains(&from.ip()) {
                    log::info!("WiFi OTA: discovered device at {}", from.ip());
                    devices.push(from.ip());
                }
            }
            Ok(Err(e)) => {
                log::warn!("WiFi OTA: discovery receive failed: {}", e);
                break;
            }
            Err(_) => break,
        }
    }
    Ok(devices)
}
