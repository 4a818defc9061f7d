//! The backend capability interface.
//!
//! A backend implements [`ProviderService`] using native types from
//! [`crate::resource`]; the bridge in [`crate::server`] handles every wire
//! concern. Check, Diff and the CRUD operations are required. Everything else
//! defaults to [`ProviderError::NotYetImplemented`], which the bridge reports
//! as `Unimplemented` naming the operation.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_bridge::{
//!     async_trait, CallContext, CheckResult, CreateResult, DiffResult, PropertyMap,
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
//!     // ... diff, create, read, update, delete
//! }
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::composite::{CallInfo, CallOptions, CallResult, ConstructRequest, ConstructResult};
use crate::diff::DiffResult;
use crate::error::ProviderError;
use crate::resource::PropertyMap;
use crate::types::{CheckFailure, ProviderDescriptor, Urn};

/// Per-call context handed to every backend operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
}

impl CallContext {
    /// Create a context observing the given token.
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// The token cancelled when this call should stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Receiver for the results of a streaming invoke.
///
/// A failed send means nobody is listening any more; backends must stop
/// producing and return the error.
#[async_trait::async_trait]
pub trait StreamSink: Send {
    /// Push one result.
    async fn send(&mut self, item: PropertyMap) -> Result<(), ProviderError>;
}

/// The outcome of Check or CheckConfig.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckResult {
    /// The checked inputs, with defaults applied.
    pub inputs: PropertyMap,
    /// Validation failures. A non-empty list does not fail the call.
    pub failures: Vec<CheckFailure>,
}

impl CheckResult {
    /// A result with no failures.
    pub fn new(inputs: PropertyMap) -> Self {
        Self {
            inputs,
            failures: Vec::new(),
        }
    }

    /// Add a failure.
    pub fn with_failure(mut self, property: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.push(CheckFailure::new(property, reason));
        self
    }
}

/// The outcome of Create.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateResult {
    /// The physical id of the new resource. Empty during preview.
    pub id: String,
    /// The resource's outputs.
    pub outputs: PropertyMap,
}

/// The outcome of Read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadResult {
    /// The physical id. An empty id means the resource no longer exists.
    pub id: String,
    /// The reconciled outputs.
    pub outputs: PropertyMap,
    /// The reconciled inputs.
    pub inputs: PropertyMap,
}

/// Trait that backends implement.
///
/// All methods receive owned, already-decoded payloads and return native
/// values; the bridge re-encodes them according to the negotiated
/// capabilities.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Metadata
    // =========================================================================

    /// Describe the backend. Called once when the bridge is built.
    fn descriptor(&self) -> ProviderDescriptor;

    /// Return the backend's schema document for the requested version.
    async fn get_schema(&self, ctx: &CallContext, version: i32) -> Result<String, ProviderError> {
        let _ = (ctx, version);
        Err(ProviderError::NotYetImplemented)
    }

    // =========================================================================
    // Provider configuration
    // =========================================================================

    /// Validate provider configuration and apply defaults.
    async fn check_config(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        olds: PropertyMap,
        news: PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        let _ = (ctx, urn, olds, news);
        Err(ProviderError::NotYetImplemented)
    }

    /// Compare two provider configurations.
    async fn diff_config(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        old_inputs: PropertyMap,
        olds: PropertyMap,
        news: PropertyMap,
        ignore_changes: &[String],
    ) -> Result<DiffResult, ProviderError> {
        let _ = (ctx, urn, old_inputs, olds, news, ignore_changes);
        Err(ProviderError::NotYetImplemented)
    }

    /// Apply provider configuration.
    async fn configure(&self, ctx: &CallContext, inputs: PropertyMap) -> Result<(), ProviderError> {
        let _ = (ctx, inputs);
        Ok(())
    }

    // =========================================================================
    // Resource lifecycle
    // =========================================================================

    /// Validate resource inputs and apply defaults. `random_seed` is opaque
    /// and makes generated defaults deterministic.
    async fn check(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        olds: PropertyMap,
        news: PropertyMap,
        random_seed: &[u8],
    ) -> Result<CheckResult, ProviderError>;

    /// Compare a resource's prior state with its new inputs.
    async fn diff(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        id: &str,
        olds: PropertyMap,
        news: PropertyMap,
        ignore_changes: &[String],
    ) -> Result<DiffResult, ProviderError>;

    /// Create a resource. In preview mode no side effects may happen.
    async fn create(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        inputs: PropertyMap,
        timeout: Option<Duration>,
        preview: bool,
    ) -> Result<CreateResult, ProviderError>;

    /// Reconcile recorded state with the live resource.
    async fn read(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        id: &str,
        inputs: PropertyMap,
        state: PropertyMap,
    ) -> Result<ReadResult, ProviderError>;

    /// Update a resource in place, returning its new outputs.
    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        id: &str,
        olds: PropertyMap,
        news: PropertyMap,
        timeout: Option<Duration>,
        ignore_changes: &[String],
        preview: bool,
    ) -> Result<PropertyMap, ProviderError>;

    /// Delete a resource.
    async fn delete(
        &self,
        ctx: &CallContext,
        urn: &Urn,
        id: &str,
        inputs: PropertyMap,
        outputs: PropertyMap,
        timeout: Option<Duration>,
    ) -> Result<(), ProviderError>;

    // =========================================================================
    // Components and functions
    // =========================================================================

    /// Construct a component resource.
    async fn construct(
        &self,
        ctx: &CallContext,
        request: ConstructRequest,
        inputs: PropertyMap,
    ) -> Result<ConstructResult, ProviderError> {
        let _ = (ctx, request, inputs);
        Err(ProviderError::NotYetImplemented)
    }

    /// Execute a stateless function.
    async fn invoke(
        &self,
        ctx: &CallContext,
        token: &str,
        args: PropertyMap,
    ) -> Result<(PropertyMap, Vec<CheckFailure>), ProviderError> {
        let _ = (ctx, token, args);
        Err(ProviderError::NotYetImplemented)
    }

    /// Execute a function producing a sequence of results, pushing each one
    /// through `sink`. Returned failures are sent after the last result.
    async fn stream_invoke(
        &self,
        ctx: &CallContext,
        token: &str,
        args: PropertyMap,
        sink: &mut dyn StreamSink,
    ) -> Result<Vec<CheckFailure>, ProviderError> {
        let _ = (ctx, token, args, sink);
        Err(ProviderError::NotYetImplemented)
    }

    /// Execute a method bound to a resource.
    async fn call(
        &self,
        ctx: &CallContext,
        token: &str,
        args: PropertyMap,
        info: CallInfo,
        options: CallOptions,
    ) -> Result<CallResult, ProviderError> {
        let _ = (ctx, token, args, info, options);
        Err(ProviderError::NotYetImplemented)
    }

    // =========================================================================
    // Mappings
    // =========================================================================

    /// Fetch opaque mapping data for `key`, optionally for one named
    /// provider. Returns the data and the name of the provider it came from.
    async fn get_mapping(
        &self,
        ctx: &CallContext,
        key: &str,
        provider: &str,
    ) -> Result<(Vec<u8>, String), ProviderError> {
        let _ = (ctx, key, provider);
        Err(ProviderError::NotYetImplemented)
    }

    /// List the providers that have mapping data for `key`.
    async fn get_mappings(&self, ctx: &CallContext, key: &str) -> Result<Vec<String>, ProviderError> {
        let _ = (ctx, key);
        Err(ProviderError::NotYetImplemented)
    }

    // =========================================================================
    // Process control
    // =========================================================================

    /// Rebind to a backend served at `address`. Only called when
    /// [`ProviderDescriptor::supports_attach`] is set.
    async fn attach(&self, address: &str) -> Result<(), ProviderError> {
        let _ = address;
        Err(ProviderError::NotYetImplemented)
    }

    /// Ask the backend to abandon all outstanding work.
    async fn signal_cancellation(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_builder() {
        let result = CheckResult::new(PropertyMap::new())
            .with_failure("name", "required")
            .with_failure("size", "must be positive");
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0], CheckFailure::new("name", "required"));
    }

    #[tokio::test]
    async fn test_call_context_cancellation() {
        let root = CancellationToken::new();
        let ctx = CallContext::new(root.child_token());
        assert!(!ctx.is_cancelled());

        root.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_cancelled_wakes_on_parent_cancel() {
        let root = CancellationToken::new();
        let ctx = CallContext::new(root.child_token());
        let mut cancelled = tokio_test::task::spawn(ctx.cancelled());
        tokio_test::assert_pending!(cancelled.poll());

        root.cancel();
        assert!(cancelled.is_woken());
        tokio_test::assert_ready!(cancelled.poll());
    }

    #[test]
    fn test_default_context_is_live() {
        assert!(!CallContext::default().is_cancelled());
    }
}
