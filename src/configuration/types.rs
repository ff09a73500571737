use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 2000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_LOG_FILE: &str = "network.log";
/// Idle time before the first keep-alive probe (5 minutes).
pub const DEFAULT_KEEPALIVE_SECS: u64 = 300;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_MAX_PAYLOAD_CHARS: usize = 1024;
pub const DEFAULT_ACCEPT_ERROR_BACKOFF_MS: u64 = 0;

/// Contents of a TOML configuration file.
///
/// Every key is optional; missing keys fall back to the defaults above or to
/// whatever was given on the command line.
///
/// ```toml
/// bind_address = "127.0.0.1"
/// port = 2000
/// max_connections = 10
/// log_file = "/var/log/tollgate/network.log"
/// ```
#[derive(Debug, Default, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub log_file: Option<PathBuf>,
    pub keepalive_secs: Option<u64>,
    pub buffer_size: Option<usize>,
    pub max_payload_chars: Option<usize>,
    pub accept_error_backoff_ms: Option<u64>,
}
