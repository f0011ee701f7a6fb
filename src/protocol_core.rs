//! Command encoding and response decoding for the line-based OTA protocol
//!
//! Both directions are newline-terminated ASCII text. Encoding is a pure
//! function of the command; decoding is a total function of one line and
//! never fails, unknown input degrades to [`Response::Error`].

use std::fmt;

pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the device for its diagnostic quartet
    Version,
    /// Announce an image of `size` bytes with the given content hash
    StartTransfer { size: u64, hash: String },
    /// Activate the freshly written image
    Reboot,
}

impl Command {
    pub fn start_transfer(size: u64, hash: impl Into<String>) -> Self {
        Command::StartTransfer {
            size,
            hash: hash.into(),
        }
    }

    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "VERSION",
            Command::StartTransfer { .. } => "OTA",
            Command::Reboot => "REBOOT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(encode(self).trim_end())
    }
}

/// Diagnostic detail a device may attach to `OK`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub hw_version: String,
    pub fw_version: String,
    pub reboot_count: u32,
    pub git_hash: String,
}

/// Inbound message decoded from one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Erasing,
    Ok(Option<DeviceInfo>),
    Error(String),
}

impl Response {
    pub fn is_ack_class(&self) -> bool {
        matches!(self, Response::Ack | Response::Ok(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ack => f.write_str("ACK"),
            Response::Erasing => f.write_str("ERASING"),
            Response::Ok(None) => f.write_str("OK"),
            Response::Ok(Some(info)) => write!(
                f,
                "OK {} {} {} {}",
                info.hw_version, info.fw_version, info.reboot_count, info.git_hash
            ),
            Response::Error(message) => write!(f, "ERR {}", message),
        }
    }
}

/// Render a command as its single wire frame
pub fn encode(command: &Command) -> String {
    match command {
        Command::Version => "VERSION\n".to_string(),
        Command::StartTransfer { size, hash } => format!("OTA {} {}\n", size, hash),
        Command::Reboot => "REBOOT\n".to_string(),
    }
}

/// Decode one received line
pub fn decode(line: &str) -> Response {
    let line = line.trim();
    match line {
        "ACK" => return Response::Ack,
        "ERASING" => return Response::Erasing,
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("OK") {
        return Response::Ok(parse_device_info(rest));
    }

    if let Some(rest) = line.strip_prefix("ERR") {
        let message = rest.strip_prefix(' ').unwrap_or(rest).trim();
        if message.is_empty() {
            return Response::Error(UNKNOWN_ERROR.to_string());
        }
        return Response::Error(message.to_string());
    }

    Response::Error(format!("Unknown response: {}", line))
}

// Exactly four tokens make a detailed OK; anything else is a bare OK.
fn parse_device_info(rest: &str) -> Option<DeviceInfo> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let [hw, fw, reboots, git] = tokens.as_slice() else {
        return None;
    };
    Some(DeviceInfo {
        hw_version: hw.to_string(),
        fw_version: fw.to_string(),
        reboot_count: reboots.parse().ok()?,
        git_hash: git.to_string(),
    })
}
