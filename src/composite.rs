//! Context and dependency marshaling for composite operations.
//!
//! `Construct` (component construction) and `Call` (method invocation) carry
//! stack context and per-property dependency graphs in addition to their
//! property payloads. This module converts those parts between the wire
//! messages and native records. No dependency computation happens here:
//! dependency lists pass through in their original order.

use std::collections::HashMap;

use crate::config_encoding::ConfigKey;
use crate::error::MarshalError;
use crate::resource::PropertyMap;
use crate::types::{CheckFailure, Urn};

/// Per-property upstream dependencies.
pub type PropertyDependencies = HashMap<String, Vec<Urn>>;

/// Stack context for a `Construct` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstructInfo {
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Stack configuration.
    pub config: HashMap<ConfigKey, String>,
    /// Which configuration keys hold secrets.
    pub config_secret_keys: Vec<ConfigKey>,
    /// Whether this is a preview.
    pub dry_run: bool,
    /// Requested degree of parallelism.
    pub parallel: i32,
    /// Address of the resource-registration endpoint.
    pub monitor_address: String,
}

/// Resource options for a `Construct` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstructOptions {
    /// Previous URNs of the component.
    pub aliases: Vec<Urn>,
    /// Explicit dependencies.
    pub dependencies: Vec<Urn>,
    /// Whether the component is protected from deletion.
    pub protect: bool,
    /// Provider references for nested resources, keyed by package.
    pub providers: HashMap<String, String>,
    /// Upstream dependencies of each input property.
    pub property_dependencies: PropertyDependencies,
}

/// A decoded `Construct` request, minus its inputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstructRequest {
    /// Component type token.
    pub type_token: String,
    /// Component name.
    pub name: String,
    /// Parent URN, empty for none.
    pub parent: Urn,
    /// Stack context.
    pub info: ConstructInfo,
    /// Resource options.
    pub options: ConstructOptions,
}

/// The outcome of a `Construct` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstructResult {
    /// URN of the constructed component.
    pub urn: Urn,
    /// Component outputs.
    pub outputs: PropertyMap,
    /// Upstream dependencies of each output property.
    pub output_dependencies: PropertyDependencies,
}

/// Stack context for a `Call`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallInfo {
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Stack configuration.
    pub config: HashMap<ConfigKey, String>,
    /// Which configuration keys hold secrets.
    pub config_secret_keys: Vec<ConfigKey>,
    /// Whether this is a preview.
    pub dry_run: bool,
    /// Requested degree of parallelism.
    pub parallel: i32,
    /// Address of the resource-registration endpoint.
    pub monitor_address: String,
}

/// Options for a `Call`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallOptions {
    /// Upstream dependencies of each argument.
    pub arg_dependencies: PropertyDependencies,
}

/// The outcome of a `Call`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallResult {
    /// The returned properties.
    pub return_value: PropertyMap,
    /// Upstream dependencies of each returned property.
    pub return_dependencies: PropertyDependencies,
    /// Argument validation failures.
    pub failures: Vec<CheckFailure>,
}

/// Decode the non-property parts of a wire `Construct` request.
pub fn construct_from_request(
    req: &crate::generated::ConstructRequest,
) -> Result<ConstructRequest, MarshalError> {
    let info = ConstructInfo {
        project: req.project.clone(),
        stack: req.stack.clone(),
        config: parse_config(&req.config)?,
        config_secret_keys: parse_secret_keys(&req.config_secret_keys)?,
        dry_run: req.dry_run,
        parallel: req.parallel,
        monitor_address: req.monitor_endpoint.clone(),
    };

    let options = ConstructOptions {
        aliases: urns(&req.aliases),
        dependencies: urns(&req.dependencies),
        protect: req.protect,
        providers: req.providers.clone(),
        property_dependencies: dependencies_from_wire(&req.input_dependencies),
    };

    Ok(ConstructRequest {
        type_token: req.r#type.clone(),
        name: req.name.clone(),
        parent: Urn::from(req.parent.as_str()),
        info,
        options,
    })
}

/// Decode the non-property parts of a wire `Call` request.
pub fn call_from_request(
    req: &crate::generated::CallRequest,
) -> Result<(CallInfo, CallOptions), MarshalError> {
    let info = CallInfo {
        project: req.project.clone(),
        stack: req.stack.clone(),
        config: parse_config(&req.config)?,
        config_secret_keys: parse_secret_keys(&req.config_secret_keys)?,
        dry_run: req.dry_run,
        parallel: req.parallel,
        monitor_address: req.monitor_endpoint.clone(),
    };
    let options = CallOptions {
        arg_dependencies: dependencies_from_wire(&req.arg_dependencies),
    };
    Ok((info, options))
}

/// Convert wire dependency lists into native ones.
pub fn dependencies_from_wire(
    wire: &HashMap<String, crate::generated::PropertyDependencies>,
) -> PropertyDependencies {
    wire.iter()
        .map(|(name, deps)| (name.clone(), urns(&deps.urns)))
        .collect()
}

/// Convert native dependency lists into wire ones.
pub fn dependencies_to_wire(
    deps: PropertyDependencies,
) -> HashMap<String, crate::generated::PropertyDependencies> {
    deps.into_iter()
        .map(|(name, urns)| {
            (
                name,
                crate::generated::PropertyDependencies {
                    urns: urns.into_iter().map(Urn::into_string).collect(),
                },
            )
        })
        .collect()
}

fn urns(raw: &[String]) -> Vec<Urn> {
    raw.iter().map(|u| Urn::from(u.as_str())).collect()
}

fn parse_config(raw: &HashMap<String, String>) -> Result<HashMap<ConfigKey, String>, MarshalError> {
    raw.iter()
        .map(|(k, v)| Ok((ConfigKey::parse(k)?, v.clone())))
        .collect()
}

fn parse_secret_keys(raw: &[String]) -> Result<Vec<ConfigKey>, MarshalError> {
    raw.iter().map(|k| ConfigKey::parse(k)).collect()
}
