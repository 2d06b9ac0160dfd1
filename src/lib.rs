use thiserror::Error;

/// Expose all controller components used by main
pub mod resources;

/// Controller wiring and shared state
pub mod operator;

/// Translation between policy levels and backend policy documents
pub mod policy;

/// Everything that talks to the object-storage backend
pub mod storage;

/// The bucket lifecycle state machine
pub mod handler;

/// Operator settings read from the environment
pub mod config;

// Internal only
mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// A single key that the backend refused to delete
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDeletionError {
    pub key: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Illegal bucket '{0}': {1}")]
    IllegalBucket(String, String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Storage backend error during {operation}: {message}")]
    BackendError { operation: &'static str, message: String },

    #[error("could not allocate a free bucket name for '{name}' after {attempts} attempts")]
    NameAllocationExhausted { name: String, attempts: usize },

    #[error("failed to create bucket '{name}': {source}")]
    BucketCreationFailure {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("could not decode bucket policy: {0}")]
    DecodeError(#[source] serde_json::Error),

    #[error("failed to delete {} object(s) from bucket '{bucket}': {}{}", .failures.len(), join_failures(.failures), interruption(.interrupted))]
    ObjectDeletionFailure {
        bucket: String,
        failures: Vec<ObjectDeletionError>,
        /// Why the listing stopped before every object was seen, if it did
        #[source]
        interrupted: Option<Box<Error>>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}").to_lowercase();
        match label.find(['(', ' ', '{']) {
            Some(end) => label[..end].to_string(),
            None => label,
        }
    }
}

fn join_failures(failures: &[ObjectDeletionError]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.key, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn interruption(interrupted: &Option<Box<Error>>) -> String {
    match interrupted {
        Some(e) => format!(" (listing stopped early: {e})"),
        None => String::new(),
    }
}
