//! Convenience types shared by the bridge and backends.
//!
//! These types provide a more ergonomic API over the raw protobuf types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A resource's logical identity (its URN).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Create a URN from any string.
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    /// Borrow the URN as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the URN is empty (for example, a missing parent).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the URN, returning the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Urn {
    fn from(urn: String) -> Self {
        Self(urn)
    }
}

impl From<&str> for Urn {
    fn from(urn: &str) -> Self {
        Self(urn.to_string())
    }
}

/// A semantic validation problem reported by Check-family operations.
///
/// Failures are returned alongside a successful response; they never fail
/// the call by themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    /// The offending property.
    pub property: String,
    /// Why the property was rejected.
    pub reason: String,
}

impl CheckFailure {
    /// Create a new check failure.
    pub fn new(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

impl From<crate::generated::CheckFailure> for CheckFailure {
    fn from(proto: crate::generated::CheckFailure) -> Self {
        Self {
            property: proto.property,
            reason: proto.reason,
        }
    }
}

impl From<CheckFailure> for crate::generated::CheckFailure {
    fn from(failure: CheckFailure) -> Self {
        Self {
            property: failure.property,
            reason: failure.reason,
        }
    }
}

/// Capability flags negotiated by `Configure`.
///
/// Every bridge starts unconfigured with all flags off. The flags are
/// recorded once, by the first successful `Configure`, and drive how every
/// later result is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderCapabilities {
    /// Whether `Configure` has completed.
    pub configured: bool,
    /// Whether the caller accepts secret-wrapped values in results.
    pub keep_secrets: bool,
    /// Whether the caller accepts resource references in results.
    pub keep_resources: bool,
}

impl ProviderCapabilities {
    /// Capabilities recorded from the caller's declared acceptance flags.
    pub fn configured(keep_secrets: bool, keep_resources: bool) -> Self {
        Self {
            configured: true,
            keep_secrets,
            keep_resources,
        }
    }
}

/// Static description of a backend, queried once when the bridge is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderDescriptor {
    /// The backend's name, used in logs.
    pub name: String,
    /// The backend's version, reported by `GetPluginInfo`.
    pub version: String,
    /// Whether the backend can be rebound to an out-of-process endpoint.
    pub supports_attach: bool,
}

impl ProviderDescriptor {
    /// Create a descriptor with the given name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            supports_attach: false,
        }
    }

    /// Declare support for `Attach`.
    pub fn with_attach(mut self) -> Self {
        self.supports_attach = true;
        self
    }
}

/// Convert a wire timeout in seconds into a duration.
///
/// Zero, negative and non-finite values mean "no timeout".
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

/// The protocol version for the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake prefix printed by the bridge on startup.
pub const HANDSHAKE_PREFIX: &str = "HEMMER_BRIDGE";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_failure_conversion() {
        let failure = CheckFailure::new("name", "must not be empty");

        let proto: crate::generated::CheckFailure = failure.clone().into();
        assert_eq!(proto.property, "name");
        assert_eq!(proto.reason, "must not be empty");

        let back: CheckFailure = proto.into();
        assert_eq!(back, failure);
    }

    #[test]
    fn test_capabilities_default_unconfigured() {
        let caps = ProviderCapabilities::default();
        assert!(!caps.configured);
        assert!(!caps.keep_secrets);
        assert!(!caps.keep_resources);

        let caps = ProviderCapabilities::configured(false, true);
        assert!(caps.configured);
        assert!(caps.keep_resources);
    }

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-1.0), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(90.0), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_urn_display() {
        let urn = Urn::from("urn:hemmer:dev::proj::pkg:mod:Bucket::b");
        assert_eq!(urn.to_string(), "urn:hemmer:dev::proj::pkg:mod:Bucket::b");
        assert!(!urn.is_empty());
        assert!(Urn::default().is_empty());
    }

    #[test]
    fn test_protocol_constants() {
        assert_eq!(PROTOCOL_VERSION, 1);
        assert_eq!(HANDSHAKE_PREFIX, "HEMMER_BRIDGE");
    }
}
