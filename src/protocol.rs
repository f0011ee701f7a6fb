//! Shared protocol constants for the ESP32 unified OTA transport

use uuid::Uuid;

// GATT layout of the OTA service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

// Command characteristic (write / write-without-response)
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x62ec0272_3ec5_11eb_b378_0242ac130005);

// Response characteristic (notify)
pub const RESPONSE_UUID: Uuid = Uuid::from_u128(0x62ec0272_3ec5_11eb_b378_0242ac130003);

// Recommended chunk sizes per link type
pub const BLE_CHUNK_SIZE: usize = 512;
pub const WIFI_CHUNK_SIZE: usize = 1024;

// TCP port the device listens on while in WiFi OTA mode (also used for discovery)
pub const DEFAULT_PORT: u16 = 3232;

// UDP discovery exchange
pub const DISCOVERY_REQUEST: &[u8] = b"MESHTASTIC_OTA_DISCOVERY\n";
pub const DISCOVERY_REPLY_PREFIX: &str = "MESHTASTIC_OTA";

// Response markers matched (case-insensitively) inside ERR messages
pub const HASH_REJECTED_MARKER: &str = "hash rejected";
pub const HASH_MISMATCH_MARKER: &str = "hash mismatch";

// Centralized timeout constants, overridable through OtaConfig
pub mod timeouts {
    // Waiting for the link to reach the connected state (ms)
    pub const CONNECT_MS: u64 = 10_000;

    // Plain command round trip: VERSION, REBOOT (ms)
    pub const COMMAND_MS: u64 = 5_000;

    // Start command; flash erase can take a while (ms)
    pub const ERASE_MS: u64 = 30_000;

    // Per-chunk acknowledgement (ms)
    pub const ACK_MS: u64 = 2_000;

    // Final verification after the last chunk (ms)
    pub const VERIFICATION_MS: u64 = 10_000;

    // Pause between connection attempts (ms)
    pub const RETRY_DELAY_MS: u64 = 2_000;

    // Default UDP discovery window (ms)
    pub const DISCOVERY_MS: u64 = 3_000;

    // Inter-chunk pacing when the link has no per-chunk ACK (ms)
    pub const WIFI_WRITE_DELAY_MS: u64 = 10;
}
