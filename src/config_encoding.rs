//! Provider configuration codec.
//!
//! Configuration travels through a restricted variant of the value codec:
//! unknowns are kept, while secrets and resource references are always
//! flattened to plain values. Configuration can also arrive in a legacy shape,
//! a flat map from namespaced key (`aws:region`) to a string, where each
//! string is parsed as a JSON literal when possible.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use hemmer_provider_bridge::config_encoding::ConfigEncoding;
//! use hemmer_provider_bridge::resource::PropertyValue;
//!
//! let variables = HashMap::from([
//!     ("aws:region".to_string(), "\"us-east-1\"".to_string()),
//!     ("aws:profile".to_string(), "not-json".to_string()),
//! ]);
//!
//! let config = ConfigEncoding::new().decode_legacy_variables(&variables).unwrap();
//! assert_eq!(config["region"], PropertyValue::from("us-east-1"));
//! assert_eq!(config["profile"], PropertyValue::from("not-json"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MarshalError;
use crate::marshal::{decode_properties, encode_properties, MarshalOptions};
use crate::resource::{PropertyMap, PropertyValue};

/// A namespaced configuration key such as `aws:region`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    /// The namespace, usually the package name.
    pub namespace: String,
    /// The unqualified key name.
    pub name: String,
}

impl ConfigKey {
    /// Create a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `<namespace>:<name>`, also accepting the older
    /// `<namespace>:config:<name>` form.
    pub fn parse(key: &str) -> Result<Self, MarshalError> {
        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            [namespace, name] => Ok(Self::new(*namespace, *name)),
            [namespace, "config", name] => Ok(Self::new(*namespace, *name)),
            _ => Err(MarshalError::InvalidConfigKey {
                key: key.to_string(),
            }),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// The configuration codec.
///
/// The policy is fixed: `{keep_unknowns: true, keep_secrets: false,
/// keep_resources: false}` for both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigEncoding;

impl ConfigEncoding {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }

    /// The options applied to every configuration payload.
    pub fn options(&self, label: &str) -> MarshalOptions {
        MarshalOptions::new(label)
            .keep_unknowns(true)
            .keep_secrets(false)
            .keep_resources(false)
    }

    /// Decode a structured configuration payload.
    pub fn decode_properties(
        &self,
        wire: Option<&prost_types::Struct>,
        label: &str,
    ) -> Result<PropertyMap, MarshalError> {
        decode_properties(wire, &self.options(label))
    }

    /// Encode a configuration payload.
    pub fn encode_properties(
        &self,
        props: &PropertyMap,
        label: &str,
    ) -> Result<prost_types::Struct, MarshalError> {
        encode_properties(props, &self.options(label))
    }

    /// Decode the legacy flat `namespace:key -> string` shape.
    ///
    /// Each value is parsed as a JSON literal, falling back to the raw string.
    /// Entries are stored under the key's unqualified name.
    pub fn decode_legacy_variables(
        &self,
        variables: &HashMap<String, String>,
    ) -> Result<PropertyMap, MarshalError> {
        let mut props = PropertyMap::new();
        for (key, raw) in variables {
            let key = ConfigKey::parse(key)?;
            let value = match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(parsed) => PropertyValue::from(parsed),
                Err(_) => PropertyValue::String(raw.clone()),
            };
            props.insert(key.name, value);
        }
        Ok(props)
    }

    /// Decode `Configure` inputs: structured `args` when present, otherwise
    /// the legacy variables.
    pub fn decode_configure_inputs(
        &self,
        args: Option<&prost_types::Struct>,
        variables: &HashMap<String, String>,
    ) -> Result<PropertyMap, MarshalError> {
        match args {
            Some(args) => self.decode_properties(Some(args), "args"),
            None => self.decode_legacy_variables(variables),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{encode_properties, MarshalOptions};
    use crate::resource::ResourceReference;

    #[test]
    fn test_parse_config_key() {
        assert_eq!(
            ConfigKey::parse("aws:region").unwrap(),
            ConfigKey::new("aws", "region")
        );
        assert_eq!(
            ConfigKey::parse("aws:config:region").unwrap(),
            ConfigKey::new("aws", "region")
        );
        assert_eq!(
            "gcp:project".parse::<ConfigKey>().unwrap().to_string(),
            "gcp:project"
        );
    }

    #[test]
    fn test_parse_config_key_rejects_malformed() {
        for bad in ["region", "a:b:c", "a:b:c:d"] {
            let err = ConfigKey::parse(bad).unwrap_err();
            assert!(matches!(err, MarshalError::InvalidConfigKey { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_legacy_string_literal_is_parsed() {
        let variables = HashMap::from([("aws:region".to_string(), "\"us-east-1\"".to_string())]);
        let props = ConfigEncoding::new()
            .decode_legacy_variables(&variables)
            .unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["region"], PropertyValue::from("us-east-1"));
    }

    #[test]
    fn test_legacy_non_json_falls_back_to_raw_string() {
        let variables = HashMap::from([("aws:region".to_string(), "not-json".to_string())]);
        let props = ConfigEncoding::new()
            .decode_legacy_variables(&variables)
            .unwrap();
        assert_eq!(props["region"], PropertyValue::from("not-json"));
    }

    #[test]
    fn test_legacy_structured_literals() {
        let variables = HashMap::from([
            ("aws:maxRetries".to_string(), "5".to_string()),
            ("aws:skipChecks".to_string(), "true".to_string()),
            ("aws:tags".to_string(), r#"{"team":"infra"}"#.to_string()),
        ]);
        let props = ConfigEncoding::new()
            .decode_legacy_variables(&variables)
            .unwrap();
        assert_eq!(props["maxRetries"], PropertyValue::Number(5.0));
        assert_eq!(props["skipChecks"], PropertyValue::Bool(true));
        assert_eq!(
            props["tags"],
            PropertyValue::Object(PropertyMap::from([(
                "team".to_string(),
                PropertyValue::from("infra")
            )]))
        );
    }

    #[test]
    fn test_legacy_rejects_malformed_key() {
        let variables = HashMap::from([("region".to_string(), "x".to_string())]);
        assert!(ConfigEncoding::new()
            .decode_legacy_variables(&variables)
            .is_err());
    }

    #[test]
    fn test_structured_config_drops_secrets_and_references() {
        let props = PropertyMap::from([
            (
                "token".to_string(),
                PropertyValue::secret(PropertyValue::from("abc")),
            ),
            (
                "network".to_string(),
                PropertyValue::ResourceReference(ResourceReference::custom(
                    "urn:net",
                    PropertyValue::from("net-1"),
                )),
            ),
            ("pending".to_string(), PropertyValue::Unknown),
        ]);
        let wire = encode_properties(&props, &MarshalOptions::keep_all("args")).unwrap();

        let config = ConfigEncoding::new()
            .decode_properties(Some(&wire), "args")
            .unwrap();
        assert_eq!(config["token"], PropertyValue::from("abc"));
        assert_eq!(config["network"], PropertyValue::from("net-1"));
        assert_eq!(config["pending"], PropertyValue::Unknown);
    }

    #[test]
    fn test_configure_inputs_prefer_args() {
        let args = encode_properties(
            &PropertyMap::from([("region".to_string(), PropertyValue::from("eu-west-1"))]),
            &MarshalOptions::new("args"),
        )
        .unwrap();
        let variables = HashMap::from([("aws:region".to_string(), "\"us-east-1\"".to_string())]);

        let encoding = ConfigEncoding::new();
        let from_args = encoding
            .decode_configure_inputs(Some(&args), &variables)
            .unwrap();
        assert_eq!(from_args["region"], PropertyValue::from("eu-west-1"));

        let from_variables = encoding.decode_configure_inputs(None, &variables).unwrap();
        assert_eq!(from_variables["region"], PropertyValue::from("us-east-1"));
    }
}
