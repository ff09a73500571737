use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

#[derive(Debug)]
pub enum TelemetryError {
    Open(std::path::PathBuf, std::io::Error),
    WriteFailed(std::io::Error),
    Poisoned,
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::Open(path, e) => {
                write!(f, "Error opening log file {}: {}", path.display(), e)
            }
            TelemetryError::WriteFailed(e) => write!(f, "Telemetry write failed: {}", e),
            TelemetryError::Poisoned => write!(f, "Telemetry sink lock poisoned"),
        }
    }
}

impl std::error::Error for TelemetryError {}

#[derive(Debug)]
pub enum AdmissionError {
    Closed,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Closed => write!(f, "admission controller closed"),
        }
    }
}

impl std::error::Error for AdmissionError {}

#[derive(Debug)]
pub enum NetworkError {
    BindError(std::net::SocketAddr, std::io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindError(addr, e) => write!(f, "Error listening on {}: {}", addr, e),
        }
    }
}

impl std::error::Error for NetworkError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    TelemetryError(TelemetryError),
    NetworkError(NetworkError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::TelemetryError(e) => write!(f, "Telemetry error: {}", e),
            ControllerError::NetworkError(e) => write!(f, "Network error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<TelemetryError> for ControllerError {
    fn from(err: TelemetryError) -> Self {
        ControllerError::TelemetryError(err)
    }
}

impl From<NetworkError> for ControllerError {
    fn from(err: NetworkError) -> Self {
        ControllerError::NetworkError(err)
    }
}
