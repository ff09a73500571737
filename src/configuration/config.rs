use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::debug;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments.
///
/// Every setting can also come from a `TOLLGATE_*` environment variable. Values
/// given here override the ones read from the configuration file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tollgate")]
#[command(version)]
#[command(about = "Admission-controlled TCP ingestion endpoint with an append-only telemetry log")]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the listener to
    #[arg(long, env = "TOLLGATE_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// TCP port to listen on
    #[arg(short, long, env = "TOLLGATE_PORT")]
    pub port: Option<u16>,

    /// Maximum number of connections serviced at the same time
    #[arg(long, env = "TOLLGATE_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Telemetry log file, opened in append mode
    #[arg(long, env = "TOLLGATE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Idle seconds before TCP keep-alive probes start
    #[arg(long, env = "TOLLGATE_KEEPALIVE_SECS")]
    pub keepalive_secs: Option<u64>,

    /// Size of the per-connection read buffer
    #[arg(long, env = "TOLLGATE_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,

    /// Longest payload excerpt written to the telemetry log, in characters
    #[arg(long, env = "TOLLGATE_MAX_PAYLOAD_CHARS")]
    pub max_payload_chars: Option<usize>,

    /// Pause after a failed accept, in milliseconds (0 retries immediately)
    #[arg(long, env = "TOLLGATE_ACCEPT_ERROR_BACKOFF_MS")]
    pub accept_error_backoff_ms: Option<u64>,
}

/// Resolved runtime configuration.
///
/// Built by layering, lowest priority first: built-in defaults, the TOML file,
/// then command-line flags / environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub max_connections: usize,
    pub log_file: PathBuf,
    pub keepalive_secs: u64,
    pub buffer_size: usize,
    pub max_payload_chars: usize,
    pub accept_error_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_payload_chars: DEFAULT_MAX_PAYLOAD_CHARS,
            accept_error_backoff_ms: DEFAULT_ACCEPT_ERROR_BACKOFF_MS,
        }
    }
}

impl Config {
    /// Loads the configuration described by `args`, reading the file it points
    /// to when there is one, and validates the result.
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file on top of the defaults. The result is not validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.bind_address {
            self.bind_address = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = file.log_file {
            self.log_file = v;
        }
        if let Some(v) = file.keepalive_secs {
            self.keepalive_secs = v;
        }
        if let Some(v) = file.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = file.max_payload_chars {
            self.max_payload_chars = v;
        }
        if let Some(v) = file.accept_error_backoff_ms {
            self.accept_error_backoff_ms = v;
        }
    }

    fn apply_args(&mut self, args: &CliArgs) {
        if let Some(v) = &args.bind_address {
            self.bind_address = v.clone();
        }
        if let Some(v) = args.port {
            self.port = v;
        }
        if let Some(v) = args.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = &args.log_file {
            self.log_file = v.clone();
        }
        if let Some(v) = args.keepalive_secs {
            self.keepalive_secs = v;
        }
        if let Some(v) = args.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = args.max_payload_chars {
            self.max_payload_chars = v;
        }
        if let Some(v) = args.accept_error_backoff_ms {
            self.accept_error_backoff_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::BadIPFormatting(format!("{}: {}", self.bind_address, e)))?;

        if self.max_connections == 0 {
            return Err(ConfigError::NotInRange(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::NotInRange(format!(
                "max_connections must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.keepalive_secs == 0 {
            return Err(ConfigError::NotInRange(
                "keepalive_secs must be at least 1".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::NotInRange(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if self.max_payload_chars == 0 {
            return Err(ConfigError::NotInRange(
                "max_payload_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .bind_address
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::BadIPFormatting(format!("{}: {}", self.bind_address, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn accept_error_backoff(&self) -> Option<Duration> {
        match self.accept_error_backoff_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args_under_test(extra: &[&str]) -> Result<CliArgs, clap::Error> {
        let mut argv = vec!["tollgate"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv)
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let config = Config::load(&args_under_test(&[]).unwrap()).unwrap();

        assert_eq!(config.port, 2000);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.log_file, PathBuf::from("network.log"));
        assert_eq!(config.keepalive(), Duration::from_secs(300));
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.accept_error_backoff(), None);
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:2000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    #[serial]
    fn test_file_then_args_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 4000\nmax_connections = 3\nlog_file = \"/tmp/ingest.log\"\nbind_address = \"127.0.0.1\""
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = args_under_test(&["--config", &path, "--port", "5000"]).unwrap();
        let config = Config::load(&args).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.log_file, PathBuf::from("/tmp/ingest.log"));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("TOLLGATE_MAX_CONNECTIONS", "7");
        let args = args_under_test(&[]);
        std::env::remove_var("TOLLGATE_MAX_CONNECTIONS");

        let config = Config::load(&args.unwrap()).unwrap();
        assert_eq!(config.max_connections, 7);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let res = Config::from_toml_str("prot = 2000");
        assert!(matches!(res, Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = Config::from_toml_str("max_connections = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_capacity_above_permit_limit_rejected() {
        let config = Config {
            max_connections: usize::MAX,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let config = Config {
            max_connections: Semaphore::MAX_PERMITS,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let config = Config::from_toml_str("keepalive_secs = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let config = Config::from_toml_str("bind_address = \"localhost:2000\"").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadIPFormatting(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let res = Config::from_file(Path::new("/nonexistent/tollgate.toml"));
        assert!(matches!(res, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_backoff_enabled() {
        let config = Config::from_toml_str("accept_error_backoff_ms = 250").unwrap();
        assert_eq!(
            config.accept_error_backoff(),
            Some(Duration::from_millis(250))
        );
    }
}
