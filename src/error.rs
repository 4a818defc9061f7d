//! Error types for the Hemmer provider bridge.

use thiserror::Error;

/// Errors returned by backends and by the bridge itself.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend does not implement the requested operation.
    ///
    /// The bridge reports this as `Unimplemented`, naming the operation.
    #[error("not yet implemented")]
    NotYetImplemented,

    /// An opaque backend failure; the message is passed through verbatim.
    #[error("{0}")]
    Backend(String),

    /// The operation was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A property payload could not be converted.
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl ProviderError {
    /// The error's message, without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Self::NotYetImplemented => "not yet implemented".to_string(),
            Self::Marshal(err) => err.to_string(),
            Self::Backend(msg) | Self::Cancelled(msg) => msg.clone(),
        }
    }

    /// Shorthand for an opaque backend failure.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Returns `true` for the not-yet-implemented sentinel.
    pub fn is_not_yet_implemented(&self) -> bool {
        matches!(self, Self::NotYetImplemented)
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotYetImplemented => tonic::Status::unimplemented("not yet implemented"),
            ProviderError::Backend(msg) => tonic::Status::unknown(msg),
            ProviderError::Cancelled(msg) => tonic::Status::cancelled(msg),
            ProviderError::Marshal(err) => err.into(),
        }
    }
}

/// Errors raised while converting property payloads between the wire and
/// native representations.
///
/// `label` names the payload being converted (for example `olds` or
/// `newState`) and `path` the property inside it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    /// A wire value carried no kind at all.
    #[error("{label}: property '{path}' has no value")]
    MissingKind {
        /// Payload label.
        label: String,
        /// Property path.
        path: String,
    },

    /// A signature-tagged object used a signature this bridge does not know.
    #[error("{label}: property '{path}' has unrecognized signature '{signature}'")]
    UnknownSignature {
        /// Payload label.
        label: String,
        /// Property path.
        path: String,
        /// The offending signature.
        signature: String,
    },

    /// A signature-tagged object was missing or had ill-typed fields.
    #[error("{label}: property '{path}' is a malformed {kind}: {reason}")]
    Malformed {
        /// Payload label.
        label: String,
        /// Property path.
        path: String,
        /// What the object claimed to be.
        kind: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A value that the wire cannot carry, such as a non-finite number.
    #[error("{label}: property '{path}' has unsupported value: {reason}")]
    Unsupported {
        /// Payload label.
        label: String,
        /// Property path.
        path: String,
        /// Why the value is unsupported.
        reason: String,
    },

    /// A configuration key was not of the form `<namespace>:<name>`.
    #[error(
        "could not parse '{key}' as a configuration key \
         (configuration keys should be of the form `<namespace>:<name>`)"
    )]
    InvalidConfigKey {
        /// The rejected key.
        key: String,
    },
}

impl From<MarshalError> for tonic::Status {
    fn from(err: MarshalError) -> Self {
        tonic::Status::invalid_argument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::backend("bucket-7 does not exist");
        assert_eq!(err.to_string(), "bucket-7 does not exist");

        let err = ProviderError::Cancelled("shutdown".to_string());
        assert_eq!(err.to_string(), "cancelled: shutdown");

        assert_eq!(
            ProviderError::NotYetImplemented.to_string(),
            "not yet implemented"
        );
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotYetImplemented.into();
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status: tonic::Status = ProviderError::Cancelled("shutdown".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Cancelled);
        assert_eq!(status.message(), "shutdown");
    }

    #[test]
    fn test_backend_error_passes_message_through() {
        let status: tonic::Status = ProviderError::backend("bucket quota reached").into();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert_eq!(status.message(), "bucket quota reached");
    }

    #[test]
    fn test_marshal_error_to_status() {
        let err = MarshalError::UnknownSignature {
            label: "news".to_string(),
            path: "tags".to_string(),
            signature: "bogus".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "news: property 'tags' has unrecognized signature 'bogus'"
        );

        let status: tonic::Status = ProviderError::from(err).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_message_strips_category() {
        let err = ProviderError::Cancelled("receiver dropped".to_string());
        assert_eq!(err.message(), "receiver dropped");

        assert!(ProviderError::NotYetImplemented.is_not_yet_implemented());
        assert!(!ProviderError::backend("x").is_not_yet_implemented());
    }
}
