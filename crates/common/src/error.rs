//! Error types for Sightline

use thiserror::Error;

/// Result type alias using Sightline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sightline error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Malformed descriptor template: {0}")]
    Template(String),

    #[error("Image {target} not found within {timeout_secs:.1}s")]
    ImageNotFound { target: String, timeout_secs: f64 },

    #[error("{0}")]
    TestFailure(String),

    #[error("Test logic error: {0}")]
    TestLogic(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Image catalog error: {0}")]
    Catalog(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// How an error is treated by the run, independent of its concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The environment itself is broken; fatal to the run
    Infrastructure,
    /// A find/wait exhausted its timeout; the test failed
    ImageNotFound,
    /// The script declared the test failed
    TestFailure,
    /// Anything else the script ran into; the test errored
    TestLogic,
    /// A malformed automation call
    Usage,
}

impl Error {
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Error::Infrastructure(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Map this error onto the run-level taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Infrastructure(_)
            | Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::Template(_) => ErrorClass::Infrastructure,
            Error::ImageNotFound { .. } => ErrorClass::ImageNotFound,
            Error::TestFailure(_) => ErrorClass::TestFailure,
            Error::Usage(_) => ErrorClass::Usage,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Yaml(_)
            | Error::Toml(_)
            | Error::Image(_)
            | Error::TestLogic(_)
            | Error::Catalog(_)
            | Error::InvalidConfig(_) => ErrorClass::TestLogic,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}
