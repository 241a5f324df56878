use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapvaultError>;

/// Coarse classification used by the retry controller and the restore
/// fallback logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, throttling. Retried until the retry budget runs out.
    Transient,
    /// Auth/permission failures and anything else that retrying cannot fix.
    Fatal,
    /// The requested object does not exist.
    NotFound,
    /// Checksum or signature mismatch.
    Integrity,
    /// Bad configuration or arguments; raised before any job work starts.
    Input,
    /// The job was cancelled.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SnapvaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported destination prefix: '{0}'")]
    UnsupportedPrefix(String),

    #[error("invalid destination URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("{context}: transient error: {message}")]
    Transient { context: String, message: String },

    #[error("{context}: {message}")]
    Fatal { context: String, message: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("corrupted volume '{key}': expected checksum {expected}, got {actual}")]
    Corruption {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("snapshot chain for '{volume}' is broken at '{snapshot}': {reason}")]
    ChainBroken {
        volume: String,
        snapshot: String,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl SnapvaultError {
    pub fn transient(context: impl Into<String>, message: impl ToString) -> Self {
        SnapvaultError::Transient {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn fatal(context: impl Into<String>, message: impl ToString) -> Self {
        SnapvaultError::Fatal {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SnapvaultError::Transient { .. } => ErrorClass::Transient,
            SnapvaultError::NotFound(_) => ErrorClass::NotFound,
            SnapvaultError::Integrity(_) | SnapvaultError::Corruption { .. } => {
                ErrorClass::Integrity
            }
            SnapvaultError::InvalidInput(_)
            | SnapvaultError::UnsupportedPrefix(_)
            | SnapvaultError::InvalidUri { .. }
            | SnapvaultError::Config(_) => ErrorClass::Input,
            SnapvaultError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            SnapvaultError::transient("s3://b PUT k", "503").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SnapvaultError::fatal("s3://b PUT k", "403").class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SnapvaultError::NotFound("k".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            SnapvaultError::Corruption {
                key: "k".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            SnapvaultError::UnsupportedPrefix("ftp".into()).class(),
            ErrorClass::Input
        );
        assert_eq!(SnapvaultError::Cancelled.class(), ErrorClass::Cancelled);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(SnapvaultError::from(io).class(), ErrorClass::Fatal);
    }

    #[test]
    fn fatal_display_includes_context() {
        let err = SnapvaultError::fatal("file:///backups PUT pool|a|vol000001", "denied");
        assert_eq!(
            err.to_string(),
            "file:///backups PUT pool|a|vol000001: denied"
        );
    }
}
