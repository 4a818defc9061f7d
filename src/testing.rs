//! Testing utilities for backends served through the bridge.
//!
//! [`BridgeTester`] drives a [`Bridge`] in-process: every call is encoded to
//! its wire request, handled by the bridge exactly as it would be over gRPC,
//! and the response decoded again with everything kept, so tests can see
//! whether secrets and resource references survived.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_bridge::testing::BridgeTester;
//! use hemmer_provider_bridge::{PropertyMap, PropertyValue};
//!
//! #[tokio::test]
//! async fn test_create_bucket() {
//!     let tester = BridgeTester::new(Buckets::default());
//!     tester.configure(PropertyMap::new()).await.unwrap();
//!
//!     let inputs = PropertyMap::from([("name".to_string(), PropertyValue::from("logs"))]);
//!     let created = tester.create("urn:bucket", inputs).await.unwrap();
//!     assert!(!created.id.is_empty());
//! }
//! ```

use thiserror::Error;
use tokio_stream::StreamExt;

use crate::composite::CallResult;
use crate::error::MarshalError;
use crate::generated::diff_response::DiffChanges as WireDiffChanges;
use crate::generated::resource_provider_server::ResourceProvider;
use crate::marshal::{decode_properties, encode_properties, MarshalOptions};
use crate::provider::{CheckResult, CreateResult, ProviderService, ReadResult};
use crate::resource::{PropertyMap, PropertyValue};
use crate::server::Bridge;
use crate::types::CheckFailure;

/// Encode a property map to its wire form, keeping every special value.
pub fn to_wire(props: &PropertyMap) -> Result<prost_types::Struct, MarshalError> {
    encode_properties(props, &MarshalOptions::keep_all("test"))
}

/// Decode a wire struct, keeping every special value.
pub fn from_wire(wire: Option<&prost_types::Struct>) -> Result<PropertyMap, MarshalError> {
    decode_properties(wire, &MarshalOptions::keep_all("test"))
}

/// A test harness wrapping a [`Bridge`].
pub struct BridgeTester<P: ProviderService> {
    bridge: Bridge<P>,
}

impl<P: ProviderService> BridgeTester<P> {
    /// Create a tester for the given backend.
    pub fn new(provider: P) -> Self {
        Self::from_bridge(Bridge::new(provider))
    }

    /// Create a tester for an existing bridge.
    pub fn from_bridge(bridge: Bridge<P>) -> Self {
        Self { bridge }
    }

    /// The bridge under test.
    pub fn bridge(&self) -> &Bridge<P> {
        &self.bridge
    }

    /// The backend under test.
    pub fn provider(&self) -> &P {
        self.bridge.provider()
    }

    // =========================================================================
    // Provider configuration
    // =========================================================================

    /// Configure the bridge, accepting secrets and resource references.
    pub async fn configure(
        &self,
        config: PropertyMap,
    ) -> Result<crate::generated::ConfigureResponse, TestError> {
        self.configure_with(config, true, true).await
    }

    /// Configure the bridge with explicit acceptance flags.
    pub async fn configure_with(
        &self,
        config: PropertyMap,
        accept_secrets: bool,
        accept_resources: bool,
    ) -> Result<crate::generated::ConfigureResponse, TestError> {
        let response = self
            .bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                args: Some(to_wire(&config)?),
                accept_secrets,
                accept_resources,
                ..Default::default()
            }))
            .await?;
        Ok(response.into_inner())
    }

    /// Check provider configuration.
    pub async fn check_config(
        &self,
        urn: &str,
        olds: PropertyMap,
        news: PropertyMap,
    ) -> Result<CheckResult, TestError> {
        let response = self
            .bridge
            .check_config(tonic::Request::new(crate::generated::CheckRequest {
                urn: urn.to_string(),
                olds: Some(to_wire(&olds)?),
                news: Some(to_wire(&news)?),
                random_seed: Vec::new(),
            }))
            .await?
            .into_inner();
        check_result(response)
    }

    // =========================================================================
    // Resource lifecycle
    // =========================================================================

    /// Check resource inputs.
    pub async fn check(
        &self,
        urn: &str,
        olds: PropertyMap,
        news: PropertyMap,
    ) -> Result<CheckResult, TestError> {
        let response = self
            .bridge
            .check(tonic::Request::new(crate::generated::CheckRequest {
                urn: urn.to_string(),
                olds: Some(to_wire(&olds)?),
                news: Some(to_wire(&news)?),
                random_seed: Vec::new(),
            }))
            .await?
            .into_inner();
        check_result(response)
    }

    /// Diff a resource, returning the raw wire response.
    pub async fn diff(
        &self,
        urn: &str,
        id: &str,
        olds: PropertyMap,
        news: PropertyMap,
    ) -> Result<crate::generated::DiffResponse, TestError> {
        let response = self
            .bridge
            .diff(tonic::Request::new(crate::generated::DiffRequest {
                id: id.to_string(),
                urn: urn.to_string(),
                olds: Some(to_wire(&olds)?),
                news: Some(to_wire(&news)?),
                ..Default::default()
            }))
            .await?;
        Ok(response.into_inner())
    }

    /// Create a resource.
    pub async fn create(&self, urn: &str, inputs: PropertyMap) -> Result<CreateResult, TestError> {
        self.create_with(urn, inputs, false).await
    }

    /// Preview a resource creation.
    pub async fn preview_create(
        &self,
        urn: &str,
        inputs: PropertyMap,
    ) -> Result<CreateResult, TestError> {
        self.create_with(urn, inputs, true).await
    }

    async fn create_with(
        &self,
        urn: &str,
        inputs: PropertyMap,
        preview: bool,
    ) -> Result<CreateResult, TestError> {
        let response = self
            .bridge
            .create(tonic::Request::new(crate::generated::CreateRequest {
                urn: urn.to_string(),
                properties: Some(to_wire(&inputs)?),
                timeout: 0.0,
                preview,
            }))
            .await?
            .into_inner();
        Ok(CreateResult {
            id: response.id,
            outputs: from_wire(response.properties.as_ref())?,
        })
    }

    /// Read a resource.
    pub async fn read(
        &self,
        urn: &str,
        id: &str,
        state: PropertyMap,
        inputs: PropertyMap,
    ) -> Result<ReadResult, TestError> {
        let response = self
            .bridge
            .read(tonic::Request::new(crate::generated::ReadRequest {
                id: id.to_string(),
                urn: urn.to_string(),
                properties: Some(to_wire(&state)?),
                inputs: Some(to_wire(&inputs)?),
            }))
            .await?
            .into_inner();
        Ok(ReadResult {
            id: response.id,
            outputs: from_wire(response.properties.as_ref())?,
            inputs: from_wire(response.inputs.as_ref())?,
        })
    }

    /// Update a resource, returning its new outputs.
    pub async fn update(
        &self,
        urn: &str,
        id: &str,
        olds: PropertyMap,
        news: PropertyMap,
    ) -> Result<PropertyMap, TestError> {
        let response = self
            .bridge
            .update(tonic::Request::new(crate::generated::UpdateRequest {
                id: id.to_string(),
                urn: urn.to_string(),
                olds: Some(to_wire(&olds)?),
                news: Some(to_wire(&news)?),
                ..Default::default()
            }))
            .await?
            .into_inner();
        Ok(from_wire(response.properties.as_ref())?)
    }

    /// Delete a resource.
    pub async fn delete(&self, urn: &str, id: &str, outputs: PropertyMap) -> Result<(), TestError> {
        self.bridge
            .delete(tonic::Request::new(crate::generated::DeleteRequest {
                id: id.to_string(),
                urn: urn.to_string(),
                properties: Some(to_wire(&outputs)?),
                ..Default::default()
            }))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Invoke a function.
    pub async fn invoke(
        &self,
        token: &str,
        args: PropertyMap,
    ) -> Result<(PropertyMap, Vec<CheckFailure>), TestError> {
        let response = self
            .bridge
            .invoke(tonic::Request::new(crate::generated::InvokeRequest {
                tok: token.to_string(),
                args: Some(to_wire(&args)?),
            }))
            .await?
            .into_inner();
        Ok((
            from_wire(response.r#return.as_ref())?,
            response.failures.into_iter().map(Into::into).collect(),
        ))
    }

    /// Invoke a streaming function and collect every result. Failures sent
    /// after the last result are returned separately.
    pub async fn stream_invoke(
        &self,
        token: &str,
        args: PropertyMap,
    ) -> Result<(Vec<PropertyMap>, Vec<CheckFailure>), TestError> {
        let mut stream = self
            .bridge
            .stream_invoke(tonic::Request::new(crate::generated::InvokeRequest {
                tok: token.to_string(),
                args: Some(to_wire(&args)?),
            }))
            .await?
            .into_inner();

        let mut items = Vec::new();
        let mut failures = Vec::new();
        while let Some(response) = stream.next().await {
            let response = response?;
            failures.extend(response.failures.into_iter().map(CheckFailure::from));
            if let Some(ret) = response.r#return {
                items.push(from_wire(Some(&ret))?);
            }
        }
        Ok((items, failures))
    }

    /// Call a method with no dependencies or stack context.
    pub async fn call(&self, token: &str, args: PropertyMap) -> Result<CallResult, TestError> {
        let response = self
            .bridge
            .call(tonic::Request::new(crate::generated::CallRequest {
                tok: token.to_string(),
                args: Some(to_wire(&args)?),
                ..Default::default()
            }))
            .await?
            .into_inner();
        Ok(CallResult {
            return_value: from_wire(response.r#return.as_ref())?,
            return_dependencies: crate::composite::dependencies_from_wire(
                &response.return_dependencies,
            ),
            failures: response.failures.into_iter().map(Into::into).collect(),
        })
    }

    // =========================================================================
    // Lifecycle helpers
    // =========================================================================

    /// Run check → create → read, returning the created resource with the
    /// outputs reported by read.
    pub async fn lifecycle_create(
        &self,
        urn: &str,
        inputs: PropertyMap,
    ) -> Result<CreateResult, TestError> {
        let checked = self.check(urn, PropertyMap::new(), inputs).await?;
        if !checked.failures.is_empty() {
            return Err(TestError::Failures(checked.failures));
        }

        let created = self.create(urn, checked.inputs.clone()).await?;
        let read = self
            .read(urn, &created.id, created.outputs, checked.inputs)
            .await?;
        Ok(CreateResult {
            id: read.id,
            outputs: read.outputs,
        })
    }

    /// Run check → diff → update against an existing resource, returning the
    /// new outputs.
    pub async fn lifecycle_update(
        &self,
        urn: &str,
        id: &str,
        outputs: PropertyMap,
        news: PropertyMap,
    ) -> Result<PropertyMap, TestError> {
        let checked = self.check(urn, outputs.clone(), news).await?;
        if !checked.failures.is_empty() {
            return Err(TestError::Failures(checked.failures));
        }

        let diff = self
            .diff(urn, id, outputs.clone(), checked.inputs.clone())
            .await?;
        if diff.changes == WireDiffChanges::DiffNone as i32 {
            return Ok(outputs);
        }
        self.update(urn, id, outputs, checked.inputs).await
    }

    /// Run a full lifecycle: create → update → delete. Returns the outputs
    /// after the update.
    pub async fn lifecycle_crud(
        &self,
        urn: &str,
        initial: PropertyMap,
        updated: PropertyMap,
    ) -> Result<PropertyMap, TestError> {
        let created = self.lifecycle_create(urn, initial).await?;
        let outputs = self
            .lifecycle_update(urn, &created.id, created.outputs, updated)
            .await?;
        self.delete(urn, &created.id, outputs.clone()).await?;
        Ok(outputs)
    }
}

fn check_result(response: crate::generated::CheckResponse) -> Result<CheckResult, TestError> {
    Ok(CheckResult {
        inputs: from_wire(response.inputs.as_ref())?,
        failures: response.failures.into_iter().map(Into::into).collect(),
    })
}

/// Error type for test operations.
#[derive(Debug, Error)]
pub enum TestError {
    /// The bridge returned an error status.
    #[error("bridge returned {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    /// A payload could not be converted.
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Check reported validation failures.
    #[error("check reported {} failure(s): {}", .0.len(), describe_failures(.0))]
    Failures(Vec<CheckFailure>),
}

fn describe_failures(failures: &[CheckFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.property, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a diff reports no changes.
///
/// # Panics
///
/// Panics if the diff reports anything other than `DIFF_NONE`.
pub fn assert_diff_no_changes(diff: &crate::generated::DiffResponse) {
    assert_eq!(
        diff.changes,
        WireDiffChanges::DiffNone as i32,
        "Expected no changes, got diffs {:?}",
        diff.diffs
    );
}

/// Assert that a diff reports changes that can be applied in place.
///
/// # Panics
///
/// Panics if the diff reports no changes or any replacement.
pub fn assert_diff_updates_in_place(diff: &crate::generated::DiffResponse) {
    assert_eq!(
        diff.changes,
        WireDiffChanges::DiffSome as i32,
        "Expected changes"
    );
    assert!(
        diff.replaces.is_empty(),
        "Expected in-place update, but {:?} force replacement",
        diff.replaces
    );
}

/// Assert that a change at `path` forces replacement.
///
/// # Panics
///
/// Panics if `path` is not in the diff's replace list.
pub fn assert_diff_replaces(diff: &crate::generated::DiffResponse, path: &str) {
    assert!(
        diff.replaces.iter().any(|p| p == path),
        "Expected '{}' to force replacement. Replaces: {:?}",
        path,
        diff.replaces
    );
}

/// Assert that a check reported no failures.
///
/// # Panics
///
/// Panics listing the failures if there are any.
pub fn assert_no_failures(failures: &[CheckFailure]) {
    assert!(
        failures.is_empty(),
        "Expected no failures, got: {}",
        describe_failures(failures)
    );
}

/// Assert that a check reported a failure for `property`.
///
/// # Panics
///
/// Panics if no failure names `property`.
pub fn assert_failure_for(failures: &[CheckFailure], property: &str) {
    assert!(
        failures.iter().any(|f| f.property == property),
        "Expected a failure for '{}', got: {}",
        property,
        describe_failures(failures)
    );
}

/// Assert that a value arrived secret-wrapped.
///
/// # Panics
///
/// Panics if the value is not a secret.
pub fn assert_secret(value: &PropertyValue) {
    assert!(value.is_secret(), "Expected a secret, got {:?}", value);
}
