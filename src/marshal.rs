//! Conversion between wire property payloads and [`PropertyMap`]s.
//!
//! On the wire, property maps are `google.protobuf.Struct`s. Values that a
//! plain struct cannot express are objects tagged with [`SIG_KEY`]:
//!
//! | Variant            | Signature           | Fields                                 |
//! |--------------------|---------------------|----------------------------------------|
//! | secret             | [`SECRET_SIG`]      | `value`                                |
//! | resource reference | [`RESOURCE_REF_SIG`]| `urn`, `id` (optional), `packageVersion`|
//! | asset              | [`ASSET_SIG`]       | `hash`, one of `text`/`path`/`uri`     |
//! | archive            | [`ARCHIVE_SIG`]     | `hash`, one of `assets`/`path`/`uri`   |
//!
//! Unknown values are the string [`UNKNOWN_VALUE`].
//!
//! What survives a conversion is governed by [`MarshalOptions`]. A secret
//! that is not kept is unwrapped to its plain value, a resource reference
//! that is not kept is replaced by [`ResourceReference::plain_value`], and
//! an unknown that is not kept is dropped from objects (and rendered as
//! null inside arrays).
//!
//! # Example
//!
//! ```
//! use hemmer_provider_bridge::marshal::{decode_properties, encode_properties, MarshalOptions};
//! use hemmer_provider_bridge::resource::{PropertyMap, PropertyValue};
//!
//! let mut props = PropertyMap::new();
//! props.insert("token".into(), PropertyValue::secret("s3cr3t".into()));
//!
//! // Secrets are unwrapped unless the receiver accepts them.
//! let plain = encode_properties(&props, &MarshalOptions::new("state")).unwrap();
//! let back = decode_properties(Some(&plain), &MarshalOptions::new("state").keep_secrets(true)).unwrap();
//! assert_eq!(back["token"], PropertyValue::from("s3cr3t"));
//! ```

use std::collections::BTreeMap;

use prost_types::value::Kind;

use crate::error::MarshalError;
use crate::resource::{
    Archive, ArchiveMember, ArchiveSource, Asset, AssetSource, PropertyMap, PropertyValue,
    ResourceReference,
};
use crate::types::Urn;

/// Key that marks an object as a special value.
pub const SIG_KEY: &str = "4dabf18193072939515e22adb298388d";
/// Signature of a secret value.
pub const SECRET_SIG: &str = "1b47061264138c4ac30d75fd1eb44270";
/// Signature of a resource reference.
pub const RESOURCE_REF_SIG: &str = "5cf8f73096256a8f31e491e813e4eb8e";
/// Signature of an asset.
pub const ASSET_SIG: &str = "c44067f5952c0a294b673a41bacd8c17";
/// Signature of an archive.
pub const ARCHIVE_SIG: &str = "0def7320c3a5731c473e5ecbe6d01bc7";
/// Sentinel string standing for a value that is not yet known.
pub const UNKNOWN_VALUE: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

/// Policy controlling which special values survive a conversion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarshalOptions {
    /// Names the payload in error messages.
    pub label: String,
    /// Preserve unknown values.
    pub keep_unknowns: bool,
    /// Preserve secret wrapping.
    pub keep_secrets: bool,
    /// Preserve resource references.
    pub keep_resources: bool,
}

impl MarshalOptions {
    /// Options that keep nothing special.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// Options that keep unknowns, secrets and resource references.
    pub fn keep_all(label: impl Into<String>) -> Self {
        Self::new(label)
            .keep_unknowns(true)
            .keep_secrets(true)
            .keep_resources(true)
    }

    /// Set whether unknowns survive.
    pub fn keep_unknowns(mut self, keep: bool) -> Self {
        self.keep_unknowns = keep;
        self
    }

    /// Set whether secrets survive.
    pub fn keep_secrets(mut self, keep: bool) -> Self {
        self.keep_secrets = keep;
        self
    }

    /// Set whether resource references survive.
    pub fn keep_resources(mut self, keep: bool) -> Self {
        self.keep_resources = keep;
        self
    }
}

// =========================================================================
// Decoding (wire -> native)
// =========================================================================

/// Decode a wire struct into a property map. A missing struct decodes to an
/// empty map.
pub fn decode_properties(
    wire: Option<&prost_types::Struct>,
    opts: &MarshalOptions,
) -> Result<PropertyMap, MarshalError> {
    let mut props = PropertyMap::new();
    let Some(wire) = wire else {
        return Ok(props);
    };
    for (key, value) in wire.fields.iter() {
        if let Some(decoded) = decode_at(value, key, opts)? {
            props.insert(key.clone(), decoded);
        }
    }
    Ok(props)
}

/// Decode a single wire value.
///
/// Returns `Ok(None)` when the value is dropped by `opts` (an unknown that
/// is not kept).
pub fn decode_value(
    value: &prost_types::Value,
    opts: &MarshalOptions,
) -> Result<Option<PropertyValue>, MarshalError> {
    decode_at(value, "", opts)
}

fn decode_at(
    value: &prost_types::Value,
    path: &str,
    opts: &MarshalOptions,
) -> Result<Option<PropertyValue>, MarshalError> {
    let kind = value.kind.as_ref().ok_or_else(|| MarshalError::MissingKind {
        label: opts.label.clone(),
        path: path.to_string(),
    })?;

    match kind {
        Kind::NullValue(_) => Ok(Some(PropertyValue::Null)),
        Kind::BoolValue(b) => Ok(Some(PropertyValue::Bool(*b))),
        Kind::NumberValue(n) => {
            if !n.is_finite() {
                return Err(unsupported(opts, path, format!("non-finite number {}", n)));
            }
            Ok(Some(PropertyValue::Number(*n)))
        },
        Kind::StringValue(s) if s == UNKNOWN_VALUE => Ok(unknown(opts)),
        Kind::StringValue(s) => Ok(Some(PropertyValue::String(s.clone()))),
        Kind::ListValue(list) => {
            let mut items = Vec::with_capacity(list.values.len());
            for (i, item) in list.values.iter().enumerate() {
                let item_path = index_path(path, i);
                items.push(decode_at(item, &item_path, opts)?.unwrap_or(PropertyValue::Null));
            }
            Ok(Some(PropertyValue::Array(items)))
        },
        Kind::StructValue(obj) => decode_object(obj, path, opts),
    }
}

fn decode_object(
    obj: &prost_types::Struct,
    path: &str,
    opts: &MarshalOptions,
) -> Result<Option<PropertyValue>, MarshalError> {
    let Some(sig) = obj.fields.get(SIG_KEY) else {
        let mut map = PropertyMap::new();
        for (key, value) in obj.fields.iter() {
            let field_path = key_path(path, key);
            if let Some(decoded) = decode_at(value, &field_path, opts)? {
                map.insert(key.clone(), decoded);
            }
        }
        return Ok(Some(PropertyValue::Object(map)));
    };

    let sig = match &sig.kind {
        Some(Kind::StringValue(s)) => s.as_str(),
        _ => return Err(malformed(opts, path, "special value", "signature is not a string")),
    };

    match sig {
        SECRET_SIG => {
            let inner = obj
                .fields
                .get("value")
                .ok_or_else(|| malformed(opts, path, "secret", "missing 'value'"))?;
            let Some(inner) = decode_at(inner, path, opts)? else {
                return Ok(None);
            };
            if opts.keep_secrets {
                Ok(Some(PropertyValue::secret(inner)))
            } else {
                Ok(Some(inner.unsecret()))
            }
        },
        RESOURCE_REF_SIG => {
            let reference = decode_reference(obj, path, opts)?;
            if opts.keep_resources {
                Ok(Some(PropertyValue::ResourceReference(reference)))
            } else {
                match reference.plain_value() {
                    PropertyValue::Unknown => Ok(unknown(opts)),
                    plain => Ok(Some(plain)),
                }
            }
        },
        ASSET_SIG => Ok(Some(PropertyValue::Asset(decode_asset(obj, path, opts)?))),
        ARCHIVE_SIG => Ok(Some(PropertyValue::Archive(decode_archive(obj, path, opts)?))),
        other => Err(MarshalError::UnknownSignature {
            label: opts.label.clone(),
            path: path.to_string(),
            signature: other.to_string(),
        }),
    }
}

fn decode_reference(
    obj: &prost_types::Struct,
    path: &str,
    opts: &MarshalOptions,
) -> Result<ResourceReference, MarshalError> {
    const KIND: &str = "resource reference";

    let urn = string_field(obj, "urn", path, KIND, opts)?
        .ok_or_else(|| malformed(opts, path, KIND, "missing 'urn'"))?;

    let id = match obj.fields.get("id").and_then(|v| v.kind.as_ref()) {
        None => None,
        Some(Kind::StringValue(s)) if s == UNKNOWN_VALUE => Some(Box::new(PropertyValue::Unknown)),
        Some(Kind::StringValue(s)) => Some(Box::new(PropertyValue::String(s.clone()))),
        Some(_) => return Err(malformed(opts, path, KIND, "'id' is not a string")),
    };

    let package_version = string_field(obj, "packageVersion", path, KIND, opts)?;

    Ok(ResourceReference {
        urn: Urn::from(urn),
        id,
        package_version,
    })
}

fn decode_asset(
    obj: &prost_types::Struct,
    path: &str,
    opts: &MarshalOptions,
) -> Result<Asset, MarshalError> {
    const KIND: &str = "asset";

    let hash = string_field(obj, "hash", path, KIND, opts)?;
    let source = if let Some(text) = string_field(obj, "text", path, KIND, opts)? {
        AssetSource::Text(text)
    } else if let Some(p) = string_field(obj, "path", path, KIND, opts)? {
        AssetSource::Path(p)
    } else if let Some(uri) = string_field(obj, "uri", path, KIND, opts)? {
        AssetSource::Uri(uri)
    } else {
        return Err(malformed(opts, path, KIND, "missing 'text', 'path' or 'uri'"));
    };

    Ok(Asset { hash, source })
}

fn decode_archive(
    obj: &prost_types::Struct,
    path: &str,
    opts: &MarshalOptions,
) -> Result<Archive, MarshalError> {
    const KIND: &str = "archive";

    let hash = string_field(obj, "hash", path, KIND, opts)?;

    if let Some(assets) = obj.fields.get("assets") {
        let Some(Kind::StructValue(members)) = &assets.kind else {
            return Err(malformed(opts, path, KIND, "'assets' is not an object"));
        };
        let mut decoded = BTreeMap::new();
        for (name, member) in members.fields.iter() {
            let member_path = key_path(path, name);
            let Some(Kind::StructValue(member_obj)) = &member.kind else {
                return Err(malformed(opts, &member_path, KIND, "member is not an asset or archive"));
            };
            let member_sig = member_obj.fields.get(SIG_KEY).and_then(|v| match &v.kind {
                Some(Kind::StringValue(s)) => Some(s.as_str()),
                _ => None,
            });
            let decoded_member = match member_sig {
                Some(ASSET_SIG) => ArchiveMember::Asset(decode_asset(member_obj, &member_path, opts)?),
                Some(ARCHIVE_SIG) => {
                    ArchiveMember::Archive(decode_archive(member_obj, &member_path, opts)?)
                },
                _ => {
                    return Err(malformed(
                        opts,
                        &member_path,
                        KIND,
                        "member is not an asset or archive",
                    ))
                },
            };
            decoded.insert(name.clone(), decoded_member);
        }
        return Ok(Archive {
            hash,
            source: ArchiveSource::Assets(decoded),
        });
    }

    let source = if let Some(p) = string_field(obj, "path", path, KIND, opts)? {
        ArchiveSource::Path(p)
    } else if let Some(uri) = string_field(obj, "uri", path, KIND, opts)? {
        ArchiveSource::Uri(uri)
    } else {
        return Err(malformed(opts, path, KIND, "missing 'assets', 'path' or 'uri'"));
    };

    Ok(Archive { hash, source })
}

fn string_field(
    obj: &prost_types::Struct,
    field: &str,
    path: &str,
    kind: &'static str,
    opts: &MarshalOptions,
) -> Result<Option<String>, MarshalError> {
    match obj.fields.get(field).and_then(|v| v.kind.as_ref()) {
        None => Ok(None),
        Some(Kind::StringValue(s)) => Ok(Some(s.clone())),
        Some(_) => Err(malformed(opts, path, kind, format!("'{}' is not a string", field))),
    }
}

fn unknown(opts: &MarshalOptions) -> Option<PropertyValue> {
    opts.keep_unknowns.then_some(PropertyValue::Unknown)
}

// =========================================================================
// Encoding (native -> wire)
// =========================================================================

/// Encode a property map into a wire struct.
pub fn encode_properties(
    props: &PropertyMap,
    opts: &MarshalOptions,
) -> Result<prost_types::Struct, MarshalError> {
    let mut fields = BTreeMap::new();
    for (key, value) in props {
        if let Some(encoded) = encode_at(value, key, opts)? {
            fields.insert(key.clone(), encoded);
        }
    }
    Ok(new_struct(fields))
}

/// Encode a single value.
///
/// Returns `Ok(None)` when the value is dropped by `opts` (an unknown that
/// is not kept).
pub fn encode_value(
    value: &PropertyValue,
    opts: &MarshalOptions,
) -> Result<Option<prost_types::Value>, MarshalError> {
    encode_at(value, "", opts)
}

fn encode_at(
    value: &PropertyValue,
    path: &str,
    opts: &MarshalOptions,
) -> Result<Option<prost_types::Value>, MarshalError> {
    let encoded = match value {
        PropertyValue::Null => null_value(),
        PropertyValue::Bool(b) => kind(Kind::BoolValue(*b)),
        PropertyValue::Number(n) => {
            if !n.is_finite() {
                return Err(unsupported(opts, path, format!("non-finite number {}", n)));
            }
            kind(Kind::NumberValue(*n))
        },
        PropertyValue::String(s) => string_value(s),
        PropertyValue::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_path = index_path(path, i);
                values.push(encode_at(item, &item_path, opts)?.unwrap_or_else(null_value));
            }
            kind(Kind::ListValue(prost_types::ListValue { values }))
        },
        PropertyValue::Object(map) => {
            let mut fields = BTreeMap::new();
            for (key, item) in map {
                let field_path = key_path(path, key);
                if let Some(encoded) = encode_at(item, &field_path, opts)? {
                    fields.insert(key.clone(), encoded);
                }
            }
            struct_value(fields)
        },
        PropertyValue::Asset(asset) => struct_value(encode_asset(asset)),
        PropertyValue::Archive(archive) => struct_value(encode_archive(archive)),
        PropertyValue::ResourceReference(reference) => {
            if !opts.keep_resources {
                return encode_at(&reference.plain_value(), path, opts);
            }
            let mut fields = signed(RESOURCE_REF_SIG);
            fields.insert("urn".to_string(), string_value(reference.urn.as_str()));
            match reference.id.as_deref() {
                None => {},
                // References keep their identity even when unknowns are dropped.
                Some(PropertyValue::Unknown) => {
                    fields.insert("id".to_string(), string_value(UNKNOWN_VALUE));
                },
                Some(PropertyValue::String(id)) => {
                    fields.insert("id".to_string(), string_value(id));
                },
                Some(other) => {
                    return Err(unsupported(
                        opts,
                        path,
                        format!("resource id must be a string, got {}", other.type_name()),
                    ))
                },
            }
            if let Some(version) = &reference.package_version {
                fields.insert("packageVersion".to_string(), string_value(version));
            }
            struct_value(fields)
        },
        PropertyValue::Unknown => {
            if !opts.keep_unknowns {
                return Ok(None);
            }
            string_value(UNKNOWN_VALUE)
        },
        PropertyValue::Secret(inner) => {
            let Some(encoded) = encode_at(inner.revealed(), path, opts)? else {
                return Ok(None);
            };
            if !opts.keep_secrets {
                return Ok(Some(encoded));
            }
            let mut fields = signed(SECRET_SIG);
            fields.insert("value".to_string(), encoded);
            struct_value(fields)
        },
    };
    Ok(Some(encoded))
}

fn encode_asset(asset: &Asset) -> BTreeMap<String, prost_types::Value> {
    let mut fields = signed(ASSET_SIG);
    if let Some(hash) = &asset.hash {
        fields.insert("hash".to_string(), string_value(hash));
    }
    let (key, value) = match &asset.source {
        AssetSource::Text(text) => ("text", text),
        AssetSource::Path(p) => ("path", p),
        AssetSource::Uri(uri) => ("uri", uri),
    };
    fields.insert(key.to_string(), string_value(value));
    fields
}

fn encode_archive(archive: &Archive) -> BTreeMap<String, prost_types::Value> {
    let mut fields = signed(ARCHIVE_SIG);
    if let Some(hash) = &archive.hash {
        fields.insert("hash".to_string(), string_value(hash));
    }
    match &archive.source {
        ArchiveSource::Assets(members) => {
            let encoded = members
                .iter()
                .map(|(name, member)| {
                    let member = match member {
                        ArchiveMember::Asset(asset) => encode_asset(asset),
                        ArchiveMember::Archive(nested) => encode_archive(nested),
                    };
                    (name.clone(), struct_value(member))
                })
                .collect();
            fields.insert("assets".to_string(), struct_value(encoded));
        },
        ArchiveSource::Path(p) => {
            fields.insert("path".to_string(), string_value(p));
        },
        ArchiveSource::Uri(uri) => {
            fields.insert("uri".to_string(), string_value(uri));
        },
    }
    fields
}

// =========================================================================
// Helpers
// =========================================================================

fn kind(kind: Kind) -> prost_types::Value {
    prost_types::Value { kind: Some(kind) }
}

fn null_value() -> prost_types::Value {
    kind(Kind::NullValue(prost_types::NullValue::NullValue as i32))
}

fn string_value(s: &str) -> prost_types::Value {
    kind(Kind::StringValue(s.to_string()))
}

fn new_struct(fields: BTreeMap<String, prost_types::Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: fields.into_iter().collect(),
    }
}

fn struct_value(fields: BTreeMap<String, prost_types::Value>) -> prost_types::Value {
    kind(Kind::StructValue(new_struct(fields)))
}

fn signed(sig: &str) -> BTreeMap<String, prost_types::Value> {
    BTreeMap::from([(SIG_KEY.to_string(), string_value(sig))])
}

fn key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

fn malformed(
    opts: &MarshalOptions,
    path: &str,
    kind: &'static str,
    reason: impl Into<String>,
) -> MarshalError {
    MarshalError::Malformed {
        label: opts.label.clone(),
        path: path.to_string(),
        kind,
        reason: reason.into(),
    }
}

fn unsupported(opts: &MarshalOptions, path: &str, reason: String) -> MarshalError {
    MarshalError::Unsupported {
        label: opts.label.clone(),
        path: path.to_string(),
        reason,
    }
}
