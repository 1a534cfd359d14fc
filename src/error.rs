use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors
    #[error("Invalid spec '{0}': {1}")]
    InvalidSpec(String, String),

    #[error("Missing required field in spec '{0}': {1}")]
    MissingField(String, String),

    #[error("Duplicate process name: {0}")]
    DuplicateName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Socket activation errors
    #[error("Failed to bind activation socket {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // Isolation errors
    #[error("Isolation setup failed for '{0}': {1}")]
    Setup(String, String),

    // Process lifecycle errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already exists: {0}")]
    ProcessAlreadyExists(String),

    #[error("Failed to spawn process '{0}': {1}")]
    Spawn(String, String),

    #[error("Failed to stop process '{0}': {1}")]
    Stop(String, String),

    #[error("Signal error: {0}")]
    Signal(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
