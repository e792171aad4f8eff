use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadAddress(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadAddress(e) => write!(f, "Address error: {}", e),
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

#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "Storage connection failed"),
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum SecurityError {
    StorageError(StorageError),
    InvalidPattern(String),
    JudgeUnavailable(String),
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::StorageError(e) => write!(f, "Security storage error: {}", e),
            SecurityError::InvalidPattern(e) => write!(f, "Invalid security pattern: {}", e),
            SecurityError::JudgeUnavailable(e) => write!(f, "Semantic judge unavailable: {}", e),
        }
    }
}

impl std::error::Error for SecurityError {}

impl From<StorageError> for SecurityError {
    fn from(err: StorageError) -> Self {
        SecurityError::StorageError(err)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    BindError(std::io::Error),
    SockError(std::io::Error),
    ChannelFailed,
    NotConnected,
    AuthFailed,
    ProtocolViolation(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::BindError(e) => write!(f, "Listener bind error: {}", e),
            ConnectionError::SockError(e) => write!(f, "Socket error: {}", e),
            ConnectionError::ChannelFailed => write!(f, "Beacon channel failed"),
            ConnectionError::NotConnected => write!(f, "Beacon is not connected"),
            ConnectionError::AuthFailed => write!(f, "Beacon authentication failed"),
            ConnectionError::ProtocolViolation(e) => write!(f, "Protocol violation: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

#[derive(Debug)]
pub enum DispatchError {
    BeaconNotFound,
    NoAvailableBeacon,
    InvalidApprovalState,
    StorageError(StorageError),
    SecurityError(SecurityError),
    DeliveryError(ConnectionError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::BeaconNotFound => write!(f, "Target beacon not found"),
            DispatchError::NoAvailableBeacon => write!(f, "No healthy beacon available"),
            DispatchError::InvalidApprovalState => {
                write!(f, "Command is not awaiting an approval decision")
            }
            DispatchError::StorageError(e) => write!(f, "Dispatch storage error: {}", e),
            DispatchError::SecurityError(e) => write!(f, "Dispatch security error: {}", e),
            DispatchError::DeliveryError(e) => write!(f, "Delivery error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        DispatchError::StorageError(err)
    }
}

impl From<SecurityError> for DispatchError {
    fn from(err: SecurityError) -> Self {
        DispatchError::SecurityError(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    NetworkError(ConnectionError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
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

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::StorageError(err)
    }
}

impl From<ConnectionError> for ControllerError {
    fn from(err: ConnectionError) -> Self {
        ControllerError::NetworkError(err)
    }
}
