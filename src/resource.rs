//! Native property model used by backends.
//!
//! Backends never see the wire representation. Every request payload is
//! decoded into a [`PropertyMap`] of [`PropertyValue`]s, and every result is
//! encoded back by the bridge.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_bridge::resource::{PropertyMap, PropertyValue};
//!
//! let mut props = PropertyMap::new();
//! props.insert("name".to_string(), PropertyValue::from("bucket"));
//! props.insert(
//!     "password".to_string(),
//!     PropertyValue::secret(PropertyValue::secret(PropertyValue::from("hunter2"))),
//! );
//!
//! // Secret wrapping does not nest.
//! assert_eq!(
//!     props["password"],
//!     PropertyValue::secret(PropertyValue::from("hunter2"))
//! );
//! ```

use std::collections::BTreeMap;

use crate::types::Urn;

/// A mapping from property name to value.
///
/// Ordered so that anything derived from a map (diff paths, encoded output)
/// is deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A single property value.
#[derive(Debug, Clone, Default)]
pub enum PropertyValue {
    /// An explicit null.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. All numbers travel as 64-bit floats.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered list of values.
    Array(Vec<PropertyValue>),
    /// A nested object.
    Object(PropertyMap),
    /// A reference to a single blob.
    Asset(Asset),
    /// A reference to a collection of blobs.
    Archive(Archive),
    /// A reference to another resource.
    ResourceReference(ResourceReference),
    /// A value that is not known yet (during preview).
    Unknown,
    /// A value that must not be displayed or persisted in plain form.
    ///
    /// Construct with [`PropertyValue::secret`] so wrapping stays idempotent.
    Secret(Box<PropertyValue>),
}

impl PropertyValue {
    /// Mark a value as secret. Wrapping an already secret value is a no-op.
    pub fn secret(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Secret(_) => value,
            other => PropertyValue::Secret(Box::new(other)),
        }
    }

    /// Returns `true` if this value is secret.
    pub fn is_secret(&self) -> bool {
        matches!(self, PropertyValue::Secret(_))
    }

    /// Returns `true` if this value is unknown, including a secret unknown.
    pub fn is_unknown(&self) -> bool {
        match self {
            PropertyValue::Unknown => true,
            PropertyValue::Secret(inner) => inner.is_unknown(),
            _ => false,
        }
    }

    /// Returns `true` if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// The value under any number of secret markers.
    pub fn revealed(&self) -> &PropertyValue {
        match self {
            PropertyValue::Secret(inner) => inner.revealed(),
            other => other,
        }
    }

    /// Strip the secret marker, returning the underlying value.
    pub fn unsecret(self) -> Self {
        match self {
            PropertyValue::Secret(inner) => inner.unsecret(),
            other => other,
        }
    }

    /// Returns `true` if this value or anything nested in it is unknown.
    pub fn contains_unknowns(&self) -> bool {
        match self {
            PropertyValue::Unknown => true,
            PropertyValue::Secret(inner) => inner.contains_unknowns(),
            PropertyValue::Array(items) => items.iter().any(PropertyValue::contains_unknowns),
            PropertyValue::Object(map) => map.values().any(PropertyValue::contains_unknowns),
            PropertyValue::ResourceReference(r) => {
                r.id.as_deref().is_some_and(PropertyValue::contains_unknowns)
            },
            _ => false,
        }
    }

    /// Returns `true` if this value or anything nested in it is secret.
    pub fn contains_secrets(&self) -> bool {
        match self {
            PropertyValue::Secret(_) => true,
            PropertyValue::Array(items) => items.iter().any(PropertyValue::contains_secrets),
            PropertyValue::Object(map) => map.values().any(PropertyValue::contains_secrets),
            _ => false,
        }
    }

    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the number, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Return the boolean, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the nested object, if this is an object.
    pub fn as_object(&self) -> Option<&PropertyMap> {
        match self {
            PropertyValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// A short name for the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Number(_) => "number",
            PropertyValue::String(_) => "string",
            PropertyValue::Array(_) => "array",
            PropertyValue::Object(_) => "object",
            PropertyValue::Asset(_) => "asset",
            PropertyValue::Archive(_) => "archive",
            PropertyValue::ResourceReference(_) => "resource reference",
            PropertyValue::Unknown => "unknown",
            PropertyValue::Secret(_) => "secret",
        }
    }
}

// `Secret(Secret(x))` and `Secret(x)` are the same value.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        use PropertyValue::*;
        match (self, other) {
            (Secret(a), Secret(b)) => a.revealed() == b.revealed(),
            (Null, Null) | (Unknown, Unknown) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Asset(a), Asset(b)) => a == b,
            (Archive(a), Archive(b)) => a == b,
            (ResourceReference(a), ResourceReference(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n as f64)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(items: Vec<PropertyValue>) -> Self {
        PropertyValue::Array(items)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(map: PropertyMap) -> Self {
        PropertyValue::Object(map)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => PropertyValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => PropertyValue::String(s),
            serde_json::Value::Array(items) => {
                PropertyValue::Array(items.into_iter().map(Into::into).collect())
            },
            serde_json::Value::Object(map) => PropertyValue::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// A reference to a single blob: inline text, a local path or a remote URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Content hash, if computed.
    pub hash: Option<String>,
    /// Where the content comes from.
    pub source: AssetSource,
}

/// The content source of an [`Asset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// Inline text.
    Text(String),
    /// A path on the local file system.
    Path(String),
    /// A remote URI.
    Uri(String),
}

impl Asset {
    /// An asset with inline text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            hash: None,
            source: AssetSource::Text(text.into()),
        }
    }

    /// An asset read from a local path.
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            hash: None,
            source: AssetSource::Path(path.into()),
        }
    }

    /// An asset fetched from a URI.
    pub fn uri(uri: impl Into<String>) -> Self {
        Self {
            hash: None,
            source: AssetSource::Uri(uri.into()),
        }
    }

    /// Attach a content hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A reference to a collection of blobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    /// Content hash, if computed.
    pub hash: Option<String>,
    /// Where the content comes from.
    pub source: ArchiveSource,
}

/// The content source of an [`Archive`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveSource {
    /// Named members, each an asset or a nested archive.
    Assets(BTreeMap<String, ArchiveMember>),
    /// A path on the local file system.
    Path(String),
    /// A remote URI.
    Uri(String),
}

/// A member of an [`ArchiveSource::Assets`] archive.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveMember {
    /// A single blob.
    Asset(Asset),
    /// A nested archive.
    Archive(Archive),
}

impl Archive {
    /// An archive assembled from named members.
    pub fn assets(assets: BTreeMap<String, ArchiveMember>) -> Self {
        Self {
            hash: None,
            source: ArchiveSource::Assets(assets),
        }
    }

    /// An archive read from a local path.
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            hash: None,
            source: ArchiveSource::Path(path.into()),
        }
    }

    /// An archive fetched from a URI.
    pub fn uri(uri: impl Into<String>) -> Self {
        Self {
            hash: None,
            source: ArchiveSource::Uri(uri.into()),
        }
    }

    /// Attach a content hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A reference to another resource by identity.
///
/// Custom resources carry a physical `id`; component resources do not.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReference {
    /// The referenced resource's URN.
    pub urn: Urn,
    /// The physical id, a string or unknown. `None` for components.
    pub id: Option<Box<PropertyValue>>,
    /// Version of the package that registered the resource. An empty
    /// version is kept distinct from an absent one.
    pub package_version: Option<String>,
}

impl ResourceReference {
    /// A reference to a component resource.
    pub fn component(urn: impl Into<Urn>) -> Self {
        Self {
            urn: urn.into(),
            id: None,
            package_version: None,
        }
    }

    /// A reference to a custom resource with the given physical id.
    pub fn custom(urn: impl Into<Urn>, id: PropertyValue) -> Self {
        Self {
            urn: urn.into(),
            id: Some(Box::new(id)),
            package_version: None,
        }
    }

    /// Set the package version.
    pub fn with_package_version(mut self, version: impl Into<String>) -> Self {
        self.package_version = Some(version.into());
        self
    }

    /// The value that stands in for this reference when the receiver does
    /// not understand references: the id for custom resources (an empty id
    /// is treated as unknown), the URN for components.
    pub fn plain_value(&self) -> PropertyValue {
        match self.id.as_deref() {
            Some(PropertyValue::String(id)) if id.is_empty() => PropertyValue::Unknown,
            Some(id) => id.clone(),
            None => PropertyValue::String(self.urn.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_idempotent() {
        let once = PropertyValue::secret(PropertyValue::from("x"));
        let twice = PropertyValue::secret(once.clone());
        assert_eq!(once, twice);
        assert_eq!(twice.unsecret(), PropertyValue::from("x"));
    }

    #[test]
    fn test_directly_nested_secret_equals_single_secret() {
        let nested = PropertyValue::Secret(Box::new(PropertyValue::secret(PropertyValue::from("x"))));
        assert_eq!(nested, PropertyValue::secret(PropertyValue::from("x")));
        assert_eq!(nested.revealed(), &PropertyValue::from("x"));
        assert_ne!(nested, PropertyValue::from("x"));
    }

    #[test]
    fn test_unknown_detection() {
        assert!(PropertyValue::Unknown.is_unknown());
        assert!(PropertyValue::secret(PropertyValue::Unknown).is_unknown());
        assert!(!PropertyValue::from("x").is_unknown());

        let nested = PropertyValue::Array(vec![
            PropertyValue::from(1.0),
            PropertyValue::Object(PropertyMap::from([(
                "inner".to_string(),
                PropertyValue::Unknown,
            )])),
        ]);
        assert!(nested.contains_unknowns());
        assert!(!nested.contains_secrets());
    }

    #[test]
    fn test_from_json() {
        let value: PropertyValue = serde_json::json!({
            "name": "bucket",
            "count": 3,
            "tags": ["a", "b"],
            "enabled": true,
            "missing": null
        })
        .into();

        let map = value.as_object().unwrap();
        assert_eq!(map["name"], PropertyValue::from("bucket"));
        assert_eq!(map["count"], PropertyValue::Number(3.0));
        assert_eq!(
            map["tags"],
            PropertyValue::Array(vec!["a".into(), "b".into()])
        );
        assert_eq!(map["enabled"], PropertyValue::Bool(true));
        assert!(map["missing"].is_null());
    }

    #[test]
    fn test_reference_plain_value() {
        let component = ResourceReference::component("urn:hemmer:stack::proj::pkg:Comp::c");
        assert_eq!(
            component.plain_value(),
            PropertyValue::from("urn:hemmer:stack::proj::pkg:Comp::c")
        );

        let custom = ResourceReference::custom("urn:x", PropertyValue::from("i-123"));
        assert_eq!(custom.plain_value(), PropertyValue::from("i-123"));

        let pending = ResourceReference::custom("urn:x", PropertyValue::from(""));
        assert_eq!(pending.plain_value(), PropertyValue::Unknown);

        let unknown = ResourceReference::custom("urn:x", PropertyValue::Unknown);
        assert_eq!(unknown.plain_value(), PropertyValue::Unknown);
    }
}
