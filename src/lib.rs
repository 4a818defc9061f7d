//! Hemmer Provider Bridge
//!
//! This crate serves a capability-based resource backend over the
//! resource-provider gRPC protocol. The backend works entirely with native
//! property values; the bridge owns the wire concerns.
//!
//! # Overview
//!
//! The bridge provides:
//!
//! - **Value codec**: Conversion between wire `Struct` payloads and [`PropertyMap`],
//!   including secrets, unknowns, assets, archives and resource references
//! - **Config codec**: Provider configuration from legacy `pkg:config:key` variables
//!   or structured arguments
//! - **Diff translation**: Backend diff results to the wire diff message
//! - **Lifecycle server**: [`Bridge`], which implements every RPC by decoding,
//!   delegating to the backend and re-encoding by the negotiated capabilities
//! - **Composite marshaling**: Stack context, options and dependency graphs for
//!   `Construct` and `Call`
//! - **Logging**: Integration with `tracing` for structured logging
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use hemmer_provider_bridge::{
//!     async_trait, serve, CallContext, CheckResult, CreateResult, DiffResult, PropertyMap,
//!     ProviderDescriptor, ProviderError, ProviderService, ReadResult, Urn,
//! };
//!
//! struct Buckets;
//!
//! #[async_trait]
//! impl ProviderService for Buckets {
//!     fn descriptor(&self) -> ProviderDescriptor {
//!         ProviderDescriptor::new("buckets", "0.3.1")
//!     }
//!
//!     async fn check(
//!         &self,
//!         _ctx: &CallContext,
//!         _urn: &Urn,
//!         _olds: PropertyMap,
//!         news: PropertyMap,
//!         _random_seed: &[u8],
//!     ) -> Result<CheckResult, ProviderError> {
//!         Ok(CheckResult::new(news))
//!     }
//!
//!     async fn diff(
//!         &self,
//!         _ctx: &CallContext,
//!         _urn: &Urn,
//!         _id: &str,
//!         olds: PropertyMap,
//!         news: PropertyMap,
//!         _ignore_changes: &[String],
//!     ) -> Result<DiffResult, ProviderError> {
//!         if olds == news {
//!             Ok(DiffResult::none())
//!         } else {
//!             Ok(DiffResult::some(["name"]).with_replace_keys(["name"]))
//!         }
//!     }
//!
//!     async fn create(
//!         &self,
//!         _ctx: &CallContext,
//!         _urn: &Urn,
//!         inputs: PropertyMap,
//!         _timeout: Option<Duration>,
//!         _preview: bool,
//!     ) -> Result<CreateResult, ProviderError> {
//!         Ok(CreateResult { id: "bucket-1".into(), outputs: inputs })
//!     }
//!
//!     // ... read, update, delete
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     serve(Buckets).await
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! When a bridge starts via [`serve`], it outputs a handshake string to stdout:
//!
//! ```text
//! HEMMER_BRIDGE|1|127.0.0.1:50051
//! ```
//!
//! Format: `HEMMER_BRIDGE|<protocol_version>|<address>`
//!
//! The engine spawns the bridge as a subprocess and connects to that address.
//!
//! # Resource-Provider Protocol
//!
//! - **GetSchema / GetPluginInfo**: Schema document and backend version
//! - **CheckConfig / DiffConfig / Configure**: Provider configuration and capability negotiation
//! - **Check / Diff**: Input validation and change detection
//! - **Create / Read / Update / Delete**: Resource lifecycle
//! - **Construct / Call**: Component resources and their methods
//! - **Invoke / StreamInvoke**: Stateless functions
//! - **GetMapping / GetMappings**: Opaque mapping data
//! - **Attach / Cancel**: Process control

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite;
pub mod config_encoding;
pub mod diff;
pub mod error;
pub mod logging;
pub mod marshal;
pub mod provider;
pub mod resource;
pub mod server;
pub mod testing;
pub mod types;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use composite::{
    CallInfo, CallOptions, CallResult, ConstructInfo, ConstructOptions, ConstructRequest,
    ConstructResult, PropertyDependencies,
};
pub use config_encoding::{ConfigEncoding, ConfigKey};
pub use diff::{DiffChanges, DiffKind, DiffResult, PropertyDiff};
pub use error::{MarshalError, ProviderError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use marshal::MarshalOptions;
pub use provider::{CallContext, CheckResult, CreateResult, ProviderService, ReadResult, StreamSink};
pub use resource::{Archive, Asset, PropertyMap, PropertyValue, ResourceReference};
pub use server::{serve, serve_on, serve_on_with_options, serve_with_options, Bridge, ServeOptions};
pub use types::{
    CheckFailure, ProviderCapabilities, ProviderDescriptor, Urn, HANDSHAKE_PREFIX,
    PROTOCOL_VERSION,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tokio_util::sync::CancellationToken;
pub use tonic;
pub use tracing;
