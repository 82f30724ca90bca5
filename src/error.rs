//! Error types shared by the composer's library modules.

/// Composer errors.
#[derive(Debug, thiserror::Error)]
pub enum ComposerError {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be loaded
    #[error("failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Container or image not present on the remote runtime
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote Docker API error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Topology could not be composed
    #[error("topology error: {0}")]
    Topology(String),

    /// Malformed seed or address
    #[error("keypair error: {0}")]
    Keypair(String),

    /// Node status probe failed
    #[error("probe failed: {0}")]
    Probe(String),

    /// A fan-out unit panicked or was cancelled
    #[error("task failed: {0}")]
    Task(String),

    /// A node container could not be created or started
    #[error("failed to launch {name}: {reason}")]
    Launch { name: String, reason: String },
}

impl ComposerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComposerError::NotFound(_))
    }
}

impl From<figment::Error> for ComposerError {
    fn from(e: figment::Error) -> Self {
        ComposerError::Figment(Box::new(e))
    }
}

/// Result type for composer operations.
pub type Result<T> = std::result::Result<T, ComposerError>;
