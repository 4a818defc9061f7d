//! The lifecycle server and the helpers that run it.
//!
//! [`Bridge`] implements the generated `ResourceProvider` service on top of
//! a [`ProviderService`] backend. It owns the capability flags negotiated by
//! `Configure`, decodes every request payload, dispatches to the backend and
//! re-encodes the results.
//!
//! # Signal Handling
//!
//! The `serve*` functions handle OS signals (SIGTERM, SIGINT) for graceful
//! shutdown. When a signal is received, the server:
//! 1. Stops accepting new connections
//! 2. Waits for in-flight requests to complete (with configurable timeout)
//! 3. Cancels outstanding backend work and calls `signal_cancellation`
//! 4. Exits cleanly

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::composite::{call_from_request, construct_from_request, dependencies_to_wire};
use crate::config_encoding::ConfigEncoding;
use crate::diff::translate_diff;
use crate::error::{MarshalError, ProviderError};
use crate::generated::resource_provider_server::{ResourceProvider, ResourceProviderServer};
use crate::marshal::{decode_properties, encode_properties, MarshalOptions};
use crate::provider::{CallContext, ProviderService, StreamSink};
use crate::resource::PropertyMap;
use crate::types::{
    timeout_from_secs, CheckFailure, ProviderCapabilities, ProviderDescriptor, Urn,
    HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};

type InvokeItem = Result<crate::generated::InvokeResponse, tonic::Status>;

/// Serves a backend over the resource-provider protocol.
pub struct Bridge<P: ProviderService> {
    provider: Arc<P>,
    descriptor: ProviderDescriptor,
    capabilities: OnceLock<ProviderCapabilities>,
    config_encoding: ConfigEncoding,
    // Cancelled only by shutdown.
    root: CancellationToken,
    // Child of `root` shared by calls started since the last Cancel.
    outstanding: Mutex<CancellationToken>,
    stream_buffer: usize,
}

impl<P: ProviderService> Bridge<P> {
    /// Wrap a backend. The backend's descriptor is read here, once.
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Wrap a shared backend.
    pub fn from_arc(provider: Arc<P>) -> Self {
        let descriptor = provider.descriptor();
        let root = CancellationToken::new();
        Self {
            provider,
            descriptor,
            capabilities: OnceLock::new(),
            config_encoding: ConfigEncoding::new(),
            outstanding: Mutex::new(root.child_token()),
            root,
            stream_buffer: ServeOptions::default().stream_buffer,
        }
    }

    /// Set how many StreamInvoke results may be buffered per call.
    pub fn with_stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size.max(1);
        self
    }

    /// The wrapped backend.
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// The backend's descriptor.
    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    /// The current capability flags.
    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.get().copied().unwrap_or_default()
    }

    /// The root token every per-call context derives from. It is only
    /// cancelled by [`Bridge::shutdown`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Cancel the calls currently in flight. Calls started afterwards get
    /// a live context.
    pub fn cancel_outstanding(&self) {
        let fresh = self.root.child_token();
        let previous = std::mem::replace(
            &mut *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        previous.cancel();
    }

    /// Cancel all outstanding and future work and tell the backend to stop.
    pub async fn shutdown(&self) {
        self.root.cancel();
        if let Err(e) = self.provider.signal_cancellation().await {
            warn!(error = %e, "Backend signal_cancellation returned error");
        }
    }

    fn context(&self) -> CallContext {
        let outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        CallContext::new(outstanding.child_token())
    }

    fn decode_options(label: &str) -> MarshalOptions {
        // Secrets are flattened on the way in: Configure declares that the
        // bridge does not accept them.
        MarshalOptions::new(label)
            .keep_unknowns(true)
            .keep_secrets(false)
            .keep_resources(true)
    }

    fn encode_options(&self, label: &str) -> MarshalOptions {
        let caps = self.capabilities();
        MarshalOptions::new(label)
            .keep_unknowns(true)
            .keep_secrets(caps.keep_secrets)
            .keep_resources(caps.keep_resources)
    }

    fn decode(
        &self,
        op: &str,
        label: &str,
        wire: Option<&prost_types::Struct>,
    ) -> Result<PropertyMap, tonic::Status> {
        decode_properties(wire, &Self::decode_options(label))
            .map_err(|e| unmarshal_failed(op, label, e))
    }

    fn encode(
        &self,
        op: &str,
        label: &str,
        props: &PropertyMap,
    ) -> Result<prost_types::Struct, tonic::Status> {
        encode_properties(props, &self.encode_options(label)).map_err(|e| marshal_failed(op, label, e))
    }

    fn decode_config(
        &self,
        op: &str,
        label: &str,
        wire: Option<&prost_types::Struct>,
    ) -> Result<PropertyMap, tonic::Status> {
        self.config_encoding
            .decode_properties(wire, label)
            .map_err(|e| unmarshal_failed(op, label, e))
    }
}

/// Translate a backend error, naming the operation when it is not
/// implemented.
fn check_nyi(op: &str, err: ProviderError) -> tonic::Status {
    if err.is_not_yet_implemented() {
        return tonic::Status::unimplemented(format!("{} is not yet implemented", op));
    }
    err.into()
}

fn backend_failed(op: &str, err: ProviderError) -> tonic::Status {
    if err.is_not_yet_implemented() {
        debug!("{} is not implemented by the backend", op);
    } else {
        error!(error = %err, "{} failed", op);
    }
    check_nyi(op, err)
}

fn unmarshal_failed(op: &str, label: &str, err: MarshalError) -> tonic::Status {
    error!(error = %err, "{} failed to unmarshal {}", op, label);
    tonic::Status::invalid_argument(format!("{} failed to unmarshal {}: {}", op, label, err))
}

fn marshal_failed(op: &str, label: &str, err: MarshalError) -> tonic::Status {
    error!(error = %err, "{} failed to marshal {}", op, label);
    tonic::Status::internal(format!("{} failed to marshal {}: {}", op, label, err))
}

fn failures_to_wire(failures: Vec<CheckFailure>) -> Vec<crate::generated::CheckFailure> {
    failures.into_iter().map(Into::into).collect()
}

#[tonic::async_trait]
impl<P: ProviderService> ResourceProvider for Bridge<P> {
    #[instrument(skip(self, request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        request: tonic::Request<crate::generated::GetSchemaRequest>,
    ) -> Result<tonic::Response<crate::generated::GetSchemaResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(version = req.version, "GetSchema called");
        let schema = self
            .provider
            .get_schema(&self.context(), req.version)
            .await
            .map_err(|e| backend_failed("GetSchema", e))?;
        info!(bytes = schema.len(), "GetSchema completed");
        Ok(tonic::Response::new(crate::generated::GetSchemaResponse { schema }))
    }

    #[instrument(skip(self, _request), name = "grpc.get_plugin_info")]
    async fn get_plugin_info(
        &self,
        _request: tonic::Request<()>,
    ) -> Result<tonic::Response<crate::generated::PluginInfo>, tonic::Status> {
        debug!("GetPluginInfo called");
        Ok(tonic::Response::new(crate::generated::PluginInfo {
            version: self.descriptor.version.clone(),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.check_config")]
    async fn check_config(
        &self,
        request: tonic::Request<crate::generated::CheckRequest>,
    ) -> Result<tonic::Response<crate::generated::CheckResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        debug!(urn = %urn, "CheckConfig called");

        let olds = self.decode_config("CheckConfig", "olds", req.olds.as_ref())?;
        let news = self.decode_config("CheckConfig", "news", req.news.as_ref())?;

        let result = self
            .provider
            .check_config(&self.context(), &urn, olds, news)
            .await
            .map_err(|e| backend_failed("CheckConfig", e))?;

        let inputs = self
            .config_encoding
            .encode_properties(&result.inputs, "updated news")
            .map_err(|e| marshal_failed("CheckConfig", "updated news", e))?;

        if result.failures.is_empty() {
            info!(urn = %urn, "CheckConfig completed successfully");
        } else {
            warn!(urn = %urn, failures = result.failures.len(), "CheckConfig completed with failures");
        }
        Ok(tonic::Response::new(crate::generated::CheckResponse {
            inputs: Some(inputs),
            failures: failures_to_wire(result.failures),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.diff_config")]
    async fn diff_config(
        &self,
        request: tonic::Request<crate::generated::DiffRequest>,
    ) -> Result<tonic::Response<crate::generated::DiffResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        debug!(urn = %urn, "DiffConfig called");

        let old_inputs = self.decode_config("DiffConfig", "old inputs", req.old_inputs.as_ref())?;
        let olds = self.decode_config("DiffConfig", "olds", req.olds.as_ref())?;
        let news = self.decode_config("DiffConfig", "news", req.news.as_ref())?;

        let diff = self
            .provider
            .diff_config(&self.context(), &urn, old_inputs, olds, news, &req.ignore_changes)
            .await
            .map_err(|e| backend_failed("DiffConfig", e))?;

        info!(urn = %urn, changes = ?diff.changes, "DiffConfig completed");
        Ok(tonic::Response::new(translate_diff(diff)))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<crate::generated::ConfigureRequest>,
    ) -> Result<tonic::Response<crate::generated::ConfigureResponse>, tonic::Status> {
        debug!("Configure called");
        if self.capabilities.get().is_some() {
            warn!("Configure called on an already configured provider");
            return Err(tonic::Status::failed_precondition(
                "provider is already configured",
            ));
        }

        let req = request.into_inner();
        let label = if req.args.is_some() { "args" } else { "variables" };
        let inputs = self
            .config_encoding
            .decode_configure_inputs(req.args.as_ref(), &req.variables)
            .map_err(|e| unmarshal_failed("Configure", label, e))?;

        self.provider
            .configure(&self.context(), inputs)
            .await
            .map_err(|e| backend_failed("Configure", e))?;

        // The response below never accepts secrets, so none are sent back
        // either, whatever the caller declared.
        let caps = ProviderCapabilities::configured(false, req.accept_resources);
        if self.capabilities.set(caps).is_err() {
            warn!("Configure raced with another Configure");
            return Err(tonic::Status::failed_precondition(
                "provider is already configured",
            ));
        }

        info!(
            accept_secrets = req.accept_secrets,
            accept_resources = req.accept_resources,
            "Configure completed successfully"
        );
        Ok(tonic::Response::new(crate::generated::ConfigureResponse {
            accept_secrets: false,
            supports_preview: true,
            accept_resources: true,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.check")]
    async fn check(
        &self,
        request: tonic::Request<crate::generated::CheckRequest>,
    ) -> Result<tonic::Response<crate::generated::CheckResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        debug!(urn = %urn, "Check called");

        let olds = self.decode("Check", "olds", req.olds.as_ref())?;
        let news = self.decode("Check", "news", req.news.as_ref())?;

        let result = self
            .provider
            .check(&self.context(), &urn, olds, news, &req.random_seed)
            .await
            .map_err(|e| backend_failed("Check", e))?;

        let inputs = self.encode("Check", "inputs", &result.inputs)?;

        if result.failures.is_empty() {
            info!(urn = %urn, "Check completed successfully");
        } else {
            warn!(urn = %urn, failures = result.failures.len(), "Check completed with failures");
        }
        Ok(tonic::Response::new(crate::generated::CheckResponse {
            inputs: Some(inputs),
            failures: failures_to_wire(result.failures),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.diff")]
    async fn diff(
        &self,
        request: tonic::Request<crate::generated::DiffRequest>,
    ) -> Result<tonic::Response<crate::generated::DiffResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        debug!(urn = %urn, id = %req.id, "Diff called");

        let olds = self.decode("Diff", "olds", req.olds.as_ref())?;
        let news = self.decode("Diff", "news", req.news.as_ref())?;

        let diff = self
            .provider
            .diff(&self.context(), &urn, &req.id, olds, news, &req.ignore_changes)
            .await
            .map_err(|e| backend_failed("Diff", e))?;

        info!(
            urn = %urn,
            changes = ?diff.changes,
            requires_replace = diff.requires_replace(),
            "Diff completed"
        );
        Ok(tonic::Response::new(translate_diff(diff)))
    }

    #[instrument(skip(self, request), name = "grpc.create")]
    async fn create(
        &self,
        request: tonic::Request<crate::generated::CreateRequest>,
    ) -> Result<tonic::Response<crate::generated::CreateResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        info!(urn = %urn, preview = req.preview, "Create called");

        let inputs = self.decode("Create", "properties", req.properties.as_ref())?;

        let result = self
            .provider
            .create(
                &self.context(),
                &urn,
                inputs,
                timeout_from_secs(req.timeout),
                req.preview,
            )
            .await
            .map_err(|e| backend_failed("Create", e))?;

        let properties = self.encode("Create", "newState", &result.outputs)?;

        info!(urn = %urn, id = %result.id, "Create completed successfully");
        Ok(tonic::Response::new(crate::generated::CreateResponse {
            id: result.id,
            properties: Some(properties),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.read")]
    async fn read(
        &self,
        request: tonic::Request<crate::generated::ReadRequest>,
    ) -> Result<tonic::Response<crate::generated::ReadResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        debug!(urn = %urn, id = %req.id, "Read called");

        let state = self.decode("Read", "properties", req.properties.as_ref())?;
        let inputs = self.decode("Read", "inputs", req.inputs.as_ref())?;

        let result = self
            .provider
            .read(&self.context(), &urn, &req.id, inputs, state)
            .await
            .map_err(|e| backend_failed("Read", e))?;

        let properties = self.encode("Read", "newState", &result.outputs)?;
        let inputs = self.encode("Read", "newInputs", &result.inputs)?;

        debug!(urn = %urn, id = %result.id, "Read completed successfully");
        Ok(tonic::Response::new(crate::generated::ReadResponse {
            id: result.id,
            properties: Some(properties),
            inputs: Some(inputs),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.update")]
    async fn update(
        &self,
        request: tonic::Request<crate::generated::UpdateRequest>,
    ) -> Result<tonic::Response<crate::generated::UpdateResponse>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        info!(urn = %urn, id = %req.id, preview = req.preview, "Update called");

        let olds = self.decode("Update", "olds", req.olds.as_ref())?;
        let news = self.decode("Update", "news", req.news.as_ref())?;

        let outputs = self
            .provider
            .update(
                &self.context(),
                &urn,
                &req.id,
                olds,
                news,
                timeout_from_secs(req.timeout),
                &req.ignore_changes,
                req.preview,
            )
            .await
            .map_err(|e| backend_failed("Update", e))?;

        let properties = self.encode("Update", "newState", &outputs)?;

        info!(urn = %urn, id = %req.id, "Update completed successfully");
        Ok(tonic::Response::new(crate::generated::UpdateResponse {
            properties: Some(properties),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.delete")]
    async fn delete(
        &self,
        request: tonic::Request<crate::generated::DeleteRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let req = request.into_inner();
        let urn = Urn::from(req.urn);
        info!(urn = %urn, id = %req.id, "Delete called");

        let inputs = self.decode("Delete", "old inputs", req.old_inputs.as_ref())?;
        let outputs = self.decode("Delete", "properties", req.properties.as_ref())?;

        self.provider
            .delete(
                &self.context(),
                &urn,
                &req.id,
                inputs,
                outputs,
                timeout_from_secs(req.timeout),
            )
            .await
            .map_err(|e| backend_failed("Delete", e))?;

        info!(urn = %urn, id = %req.id, "Delete completed successfully");
        Ok(tonic::Response::new(()))
    }

    #[instrument(skip(self, request), name = "grpc.construct")]
    async fn construct(
        &self,
        request: tonic::Request<crate::generated::ConstructRequest>,
    ) -> Result<tonic::Response<crate::generated::ConstructResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(type_token = %req.r#type, name = %req.name, "Construct called");

        let inputs = self.decode("Construct", "inputs", req.inputs.as_ref())?;
        let construct =
            construct_from_request(&req).map_err(|e| unmarshal_failed("Construct", "config", e))?;

        let result = self
            .provider
            .construct(&self.context(), construct, inputs)
            .await
            .map_err(|e| backend_failed("Construct", e))?;

        let state = self.encode("Construct", "outputs", &result.outputs)?;

        info!(urn = %result.urn, outputs = result.outputs.len(), "Construct completed successfully");
        Ok(tonic::Response::new(crate::generated::ConstructResponse {
            urn: result.urn.into_string(),
            state: Some(state),
            state_dependencies: dependencies_to_wire(result.output_dependencies),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.invoke")]
    async fn invoke(
        &self,
        request: tonic::Request<crate::generated::InvokeRequest>,
    ) -> Result<tonic::Response<crate::generated::InvokeResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(token = %req.tok, "Invoke called");

        let args = self.decode("Invoke", "args", req.args.as_ref())?;

        let (result, failures) = self
            .provider
            .invoke(&self.context(), &req.tok, args)
            .await
            .map_err(|e| backend_failed("Invoke", e))?;

        let ret = self.encode("Invoke", "result", &result)?;

        info!(token = %req.tok, failures = failures.len(), "Invoke completed");
        Ok(tonic::Response::new(crate::generated::InvokeResponse {
            r#return: Some(ret),
            failures: failures_to_wire(failures),
        }))
    }

    type StreamInvokeStream = ReceiverStream<InvokeItem>;

    #[instrument(skip(self, request), name = "grpc.stream_invoke")]
    async fn stream_invoke(
        &self,
        request: tonic::Request<crate::generated::InvokeRequest>,
    ) -> Result<tonic::Response<Self::StreamInvokeStream>, tonic::Status> {
        let req = request.into_inner();
        debug!(token = %req.tok, "StreamInvoke called");

        let args = self.decode("StreamInvoke", "args", req.args.as_ref())?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let provider = Arc::clone(&self.provider);
        let ctx = self.context();
        let options = self.encode_options("item");

        tokio::spawn(
            async move {
                let watch = tx.clone();
                let mut sender = tx;
                let outcome = tokio::select! {
                    result = run_stream_invoke(&*provider, &ctx, &req.tok, args, options, &mut sender) => Some(result),
                    _ = watch.closed() => None,
                };
                match outcome {
                    Some(Ok(())) => info!(token = %req.tok, "StreamInvoke completed"),
                    Some(Err(status)) => {
                        // Fails silently when the receiver is already gone.
                        let _ = watch.send(Err(status)).await;
                    }
                    None => {
                        ctx.cancellation().cancel();
                        warn!(token = %req.tok, "StreamInvoke receiver dropped, production stopped");
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );

        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }

    #[instrument(skip(self, request), name = "grpc.call")]
    async fn call(
        &self,
        request: tonic::Request<crate::generated::CallRequest>,
    ) -> Result<tonic::Response<crate::generated::CallResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(token = %req.tok, "Call called");

        let args = self.decode("Call", "args", req.args.as_ref())?;
        let (info, options) =
            call_from_request(&req).map_err(|e| unmarshal_failed("Call", "config", e))?;

        let result = self
            .provider
            .call(&self.context(), &req.tok, args, info, options)
            .await
            .map_err(|e| backend_failed("Call", e))?;

        // Call results keep everything, regardless of the negotiated flags.
        let ret = encode_properties(&result.return_value, &MarshalOptions::keep_all("result"))
            .map_err(|e| marshal_failed("Call", "result", e))?;

        info!(token = %req.tok, failures = result.failures.len(), "Call completed");
        Ok(tonic::Response::new(crate::generated::CallResponse {
            r#return: Some(ret),
            return_dependencies: dependencies_to_wire(result.return_dependencies),
            failures: failures_to_wire(result.failures),
        }))
    }

    #[instrument(skip(self, request), name = "grpc.get_mapping")]
    async fn get_mapping(
        &self,
        request: tonic::Request<crate::generated::GetMappingRequest>,
    ) -> Result<tonic::Response<crate::generated::GetMappingResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(key = %req.key, provider = %req.provider, "GetMapping called");

        let (data, provider) = self
            .provider
            .get_mapping(&self.context(), &req.key, &req.provider)
            .await
            .map_err(|e| backend_failed("GetMapping", e))?;

        debug!(key = %req.key, bytes = data.len(), "GetMapping completed");
        Ok(tonic::Response::new(crate::generated::GetMappingResponse {
            provider,
            data,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.get_mappings")]
    async fn get_mappings(
        &self,
        request: tonic::Request<crate::generated::GetMappingsRequest>,
    ) -> Result<tonic::Response<crate::generated::GetMappingsResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "GetMappings called");

        let providers = self
            .provider
            .get_mappings(&self.context(), &req.key)
            .await
            .map_err(|e| backend_failed("GetMappings", e))?;

        Ok(tonic::Response::new(crate::generated::GetMappingsResponse {
            providers,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.attach")]
    async fn attach(
        &self,
        request: tonic::Request<crate::generated::PluginAttach>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let req = request.into_inner();
        info!(address = %req.address, "Attach called");

        if !self.descriptor.supports_attach {
            return Err(tonic::Status::unimplemented("Attach is not yet implemented"));
        }

        self.provider
            .attach(&req.address)
            .await
            .map_err(|e| backend_failed("Attach", e))?;

        info!(address = %req.address, "Attach completed successfully");
        Ok(tonic::Response::new(()))
    }

    #[instrument(skip(self, _request), name = "grpc.cancel")]
    async fn cancel(
        &self,
        _request: tonic::Request<()>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        info!("Cancel called");
        self.cancel_outstanding();
        self.provider
            .signal_cancellation()
            .await
            .map_err(|e| backend_failed("Cancel", e))?;
        Ok(tonic::Response::new(()))
    }
}

// =========================================================================
// StreamInvoke plumbing
// =========================================================================

/// Destination for encoded StreamInvoke responses.
#[async_trait::async_trait]
trait ResponseSender: Send {
    async fn send_response(
        &mut self,
        response: crate::generated::InvokeResponse,
    ) -> Result<(), ProviderError>;
}

#[async_trait::async_trait]
impl ResponseSender for mpsc::Sender<InvokeItem> {
    async fn send_response(
        &mut self,
        response: crate::generated::InvokeResponse,
    ) -> Result<(), ProviderError> {
        self.send(Ok(response))
            .await
            .map_err(|_| ProviderError::Cancelled("StreamInvoke receiver dropped".to_string()))
    }
}

/// Encodes each backend result before handing it to a [`ResponseSender`].
struct EncodingSink<'a, S: ResponseSender> {
    sender: &'a mut S,
    options: MarshalOptions,
}

#[async_trait::async_trait]
impl<'a, S: ResponseSender> StreamSink for EncodingSink<'a, S> {
    async fn send(&mut self, item: PropertyMap) -> Result<(), ProviderError> {
        let encoded = encode_properties(&item, &self.options)?;
        self.sender
            .send_response(crate::generated::InvokeResponse {
                r#return: Some(encoded),
                failures: Vec::new(),
            })
            .await
    }
}

async fn run_stream_invoke<P, S>(
    provider: &P,
    ctx: &CallContext,
    token: &str,
    args: PropertyMap,
    options: MarshalOptions,
    sender: &mut S,
) -> Result<(), tonic::Status>
where
    P: ProviderService,
    S: ResponseSender,
{
    let mut sink = EncodingSink { sender, options };
    let failures = provider
        .stream_invoke(ctx, token, args, &mut sink)
        .await
        .map_err(|e| backend_failed("StreamInvoke", e))?;

    if failures.is_empty() {
        return Ok(());
    }
    sink.sender
        .send_response(crate::generated::InvokeResponse {
            r#return: None,
            failures: failures_to_wire(failures),
        })
        .await
        .map_err(|e| backend_failed("StreamInvoke", e))
}

// =========================================================================
// Serving
// =========================================================================

/// Options for configuring the bridge server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Timeout for graceful shutdown. After receiving a shutdown signal,
    /// the server will wait this long for in-flight requests to complete.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
    /// How many StreamInvoke results may be queued per call before the
    /// backend is made to wait. Default: 16.
    pub stream_buffer: usize,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            stream_buffer: 16,
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-call StreamInvoke buffer size.
    pub fn with_stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// On Unix, this waits for SIGTERM or SIGINT.
/// On Windows, this waits for CTRL+C.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return std::future::pending::<()>().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, initiating graceful shutdown"),
            Err(e) => {
                error!(error = %e, "Failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// Serve a backend over the resource-provider protocol.
///
/// This function:
/// 1. Finds an available port
/// 2. Starts the gRPC server
/// 3. Outputs the handshake string to stdout
/// 4. Handles shutdown signals (SIGTERM/SIGINT) gracefully
///
/// The handshake format is: `HEMMER_BRIDGE|<version>|<address>`
///
/// For custom configuration, use [`serve_with_options`].
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a backend with custom options.
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    serve_on_listener(provider, listener, addr, options).await
}

/// Serve a backend on a specific address.
///
/// Unlike [`serve`], this function binds to the specified address rather than
/// finding an available port.
pub async fn serve_on<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    serve_on_with_options(provider, addr, ServeOptions::default()).await
}

/// Serve a backend on a specific address with custom options.
pub async fn serve_on_with_options<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    serve_on_listener(provider, listener, actual_addr, options).await
}

async fn serve_on_listener<P: ProviderService>(
    provider: P,
    listener: TcpListener,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr);

    let bridge = Arc::new(Bridge::new(provider).with_stream_buffer(options.stream_buffer));
    info!(
        address = %addr,
        backend = %bridge.descriptor().name,
        version = %bridge.descriptor().version,
        "Bridge server starting"
    );

    let service = ResourceProviderServer::from_arc(Arc::clone(&bridge));
    let signalled = CancellationToken::new();
    let shutdown = {
        let signalled = signalled.clone();
        async move {
            wait_for_shutdown_signal().await;
            signalled.cancel();
        }
    };
    let server_future = Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            shutdown,
        );
    tokio::pin!(server_future);

    // The shutdown timeout only starts once a signal has been received.
    let finished = tokio::select! {
        result = &mut server_future => Some(result),
        _ = signalled.cancelled() => None,
    };
    let outcome = match finished {
        Some(result) => Ok(result),
        None => tokio::time::timeout(options.shutdown_timeout, &mut server_future).await,
    };

    match outcome {
        Ok(Ok(())) => {
            info!("Server shutdown complete");
        }
        Ok(Err(e)) => {
            error!(error = %e, "Server error during shutdown");
            return Err(e.into());
        }
        Err(_) => {
            warn!(
                timeout = ?options.shutdown_timeout,
                "Shutdown timeout exceeded, forcing shutdown"
            );
        }
    }

    debug!("Cancelling outstanding backend work");
    bridge.shutdown().await;

    info!("Bridge shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_stream::StreamExt;

    use super::*;
    use crate::composite::{CallInfo, CallOptions, CallResult, ConstructRequest, ConstructResult};
    use crate::diff::{DiffKind, DiffResult, PropertyDiff};
    use crate::marshal::SIG_KEY;
    use crate::provider::{CheckResult, CreateResult, ReadResult};
    use crate::resource::{PropertyValue, ResourceReference};

    #[derive(Default)]
    struct RecordingBackend {
        configured_with: Mutex<Option<PropertyMap>>,
        configure_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
    }

    fn outputs_with_specials(mut base: PropertyMap) -> PropertyMap {
        base.insert(
            "password".to_string(),
            PropertyValue::secret(PropertyValue::from("hunter2")),
        );
        base.insert(
            "network".to_string(),
            PropertyValue::ResourceReference(ResourceReference::custom(
                "urn:net",
                PropertyValue::from("net-1"),
            )),
        );
        base
    }

    #[async_trait::async_trait]
    impl ProviderService for RecordingBackend {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new("recording", "1.2.3")
        }

        async fn check_config(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _olds: PropertyMap,
            news: PropertyMap,
        ) -> Result<CheckResult, ProviderError> {
            Ok(CheckResult::new(news))
        }

        async fn configure(
            &self,
            _ctx: &CallContext,
            inputs: PropertyMap,
        ) -> Result<(), ProviderError> {
            self.configure_calls.fetch_add(1, Ordering::SeqCst);
            *self.configured_with.lock().unwrap() = Some(inputs);
            Ok(())
        }

        async fn check(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _olds: PropertyMap,
            mut news: PropertyMap,
            _random_seed: &[u8],
        ) -> Result<CheckResult, ProviderError> {
            let negative = news
                .get("size")
                .and_then(PropertyValue::as_f64)
                .is_some_and(|size| size < 0.0);
            news.entry("region".to_string())
                .or_insert_with(|| PropertyValue::from("us-east-1"));
            let result = CheckResult::new(news);
            if negative {
                return Ok(result.with_failure("size", "must not be negative"));
            }
            Ok(result)
        }

        async fn diff(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            olds: PropertyMap,
            news: PropertyMap,
            _ignore_changes: &[String],
        ) -> Result<DiffResult, ProviderError> {
            if olds.get("name") == news.get("name") {
                return Ok(DiffResult::none());
            }
            Ok(DiffResult::none()
                .with_detailed_diff("name", PropertyDiff::new(DiffKind::UpdateReplace)))
        }

        async fn create(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            inputs: PropertyMap,
            _timeout: Option<Duration>,
            preview: bool,
        ) -> Result<CreateResult, ProviderError> {
            Ok(CreateResult {
                id: if preview { String::new() } else { "res-1".to_string() },
                outputs: outputs_with_specials(inputs),
            })
        }

        async fn read(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            id: &str,
            inputs: PropertyMap,
            state: PropertyMap,
        ) -> Result<ReadResult, ProviderError> {
            Ok(ReadResult {
                id: id.to_string(),
                outputs: state,
                inputs,
            })
        }

        async fn update(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            _olds: PropertyMap,
            news: PropertyMap,
            _timeout: Option<Duration>,
            _ignore_changes: &[String],
            _preview: bool,
        ) -> Result<PropertyMap, ProviderError> {
            Ok(outputs_with_specials(news))
        }

        async fn delete(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            id: &str,
            _inputs: PropertyMap,
            _outputs: PropertyMap,
            _timeout: Option<Duration>,
        ) -> Result<(), ProviderError> {
            if id == "missing" {
                return Err(ProviderError::backend("resource missing was already deleted"));
            }
            Ok(())
        }

        async fn construct(
            &self,
            _ctx: &CallContext,
            request: ConstructRequest,
            inputs: PropertyMap,
        ) -> Result<ConstructResult, ProviderError> {
            Ok(ConstructResult {
                urn: Urn::new(format!("urn:component::{}", request.name)),
                outputs: inputs,
                output_dependencies: request.options.property_dependencies,
            })
        }

        async fn stream_invoke(
            &self,
            _ctx: &CallContext,
            token: &str,
            _args: PropertyMap,
            sink: &mut dyn StreamSink,
        ) -> Result<Vec<CheckFailure>, ProviderError> {
            for n in 0..3 {
                sink.send(PropertyMap::from([(
                    "n".to_string(),
                    PropertyValue::from(n as f64),
                )]))
                .await?;
            }
            if token == "pkg:index:withFailures" {
                return Ok(vec![CheckFailure::new("filter", "ignored")]);
            }
            Ok(Vec::new())
        }

        async fn call(
            &self,
            _ctx: &CallContext,
            _token: &str,
            _args: PropertyMap,
            _info: CallInfo,
            options: CallOptions,
        ) -> Result<CallResult, ProviderError> {
            Ok(CallResult {
                return_value: outputs_with_specials(PropertyMap::new()),
                return_dependencies: options.arg_dependencies,
                failures: Vec::new(),
            })
        }

        async fn signal_cancellation(&self) -> Result<(), ProviderError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wire(props: PropertyMap) -> prost_types::Struct {
        encode_properties(&props, &MarshalOptions::keep_all("test")).unwrap()
    }

    fn native(wire: Option<prost_types::Struct>) -> PropertyMap {
        decode_properties(wire.as_ref(), &MarshalOptions::keep_all("test")).unwrap()
    }

    async fn configure(bridge: &Bridge<RecordingBackend>, secrets: bool, resources: bool) {
        bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                args: Some(wire(PropertyMap::new())),
                accept_secrets: secrets,
                accept_resources: resources,
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[test]
    fn test_serve_options_default() {
        let options = ServeOptions::default();
        assert_eq!(options.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(options.stream_buffer, 16);
    }

    #[test]
    fn test_serve_options_builder() {
        let options = ServeOptions::new()
            .with_shutdown_timeout(Duration::from_secs(60))
            .with_stream_buffer(4);
        assert_eq!(options.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(options.stream_buffer, 4);
    }

    #[tokio::test]
    async fn test_configure_response_flags() {
        let bridge = Bridge::new(RecordingBackend::default());
        assert!(!bridge.capabilities().configured);

        let response = bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                args: Some(wire(PropertyMap::new())),
                accept_secrets: true,
                accept_resources: true,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.accept_secrets);
        assert!(response.supports_preview);
        assert!(response.accept_resources);
        assert_eq!(
            bridge.capabilities(),
            ProviderCapabilities::configured(false, true)
        );
    }

    #[tokio::test]
    async fn test_update_after_configure_keeps_resources_not_secrets() {
        let bridge = Bridge::new(RecordingBackend::default());
        configure(&bridge, true, true).await;

        let response = bridge
            .update(tonic::Request::new(crate::generated::UpdateRequest {
                id: "res-1".to_string(),
                urn: "urn:bucket".to_string(),
                news: Some(wire(PropertyMap::from([(
                    "name".to_string(),
                    PropertyValue::from("b"),
                )]))),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let state = native(response.properties);
        assert_eq!(state["password"], PropertyValue::from("hunter2"));
        assert!(matches!(
            state["network"],
            PropertyValue::ResourceReference(_)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_results_flatten_resources() {
        let bridge = Bridge::new(RecordingBackend::default());

        let response = bridge
            .create(tonic::Request::new(crate::generated::CreateRequest {
                urn: "urn:bucket".to_string(),
                properties: Some(wire(PropertyMap::new())),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.id, "res-1");
        let state = native(response.properties);
        assert_eq!(state["network"], PropertyValue::from("net-1"));
        assert_eq!(state["password"], PropertyValue::from("hunter2"));
    }

    #[tokio::test]
    async fn test_incoming_secrets_are_flattened() {
        let bridge = Bridge::new(RecordingBackend::default());

        let response = bridge
            .read(tonic::Request::new(crate::generated::ReadRequest {
                id: "res-1".to_string(),
                urn: "urn:bucket".to_string(),
                properties: Some(wire(PropertyMap::from([(
                    "token".to_string(),
                    PropertyValue::secret(PropertyValue::from("abc")),
                )]))),
                inputs: None,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.id, "res-1");
        assert_eq!(
            native(response.properties)["token"],
            PropertyValue::from("abc")
        );
    }

    #[tokio::test]
    async fn test_call_preserves_secrets_and_resources() {
        let bridge = Bridge::new(RecordingBackend::default());
        configure(&bridge, false, false).await;

        let response = bridge
            .call(tonic::Request::new(crate::generated::CallRequest {
                tok: "pkg:index:Cluster/getKubeconfig".to_string(),
                arg_dependencies: std::collections::HashMap::from([(
                    "__self__".to_string(),
                    crate::generated::PropertyDependencies {
                        urns: vec!["urn:cluster".to_string()],
                    },
                )]),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let ret = native(response.r#return);
        assert!(ret["password"].is_secret());
        assert!(matches!(ret["network"], PropertyValue::ResourceReference(_)));
        assert_eq!(
            response.return_dependencies["__self__"].urns,
            vec!["urn:cluster".to_string()]
        );
    }

    #[tokio::test]
    async fn test_check_failure_is_not_an_error() {
        let bridge = Bridge::new(RecordingBackend::default());

        let response = bridge
            .check(tonic::Request::new(crate::generated::CheckRequest {
                urn: "urn:bucket".to_string(),
                news: Some(wire(PropertyMap::from([(
                    "size".to_string(),
                    PropertyValue::Number(-1.0),
                )]))),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].property, "size");
        assert_eq!(
            native(response.inputs)["region"],
            PropertyValue::from("us-east-1")
        );
    }

    #[tokio::test]
    async fn test_check_config_decode_failure_names_step() {
        let bridge = Bridge::new(RecordingBackend::default());

        let bogus = prost_types::Struct {
            fields: [(
                "tags".to_string(),
                prost_types::Value {
                    kind: Some(prost_types::value::Kind::StructValue(prost_types::Struct {
                        fields: [(
                            SIG_KEY.to_string(),
                            prost_types::Value {
                                kind: Some(prost_types::value::Kind::StringValue(
                                    "bogus".to_string(),
                                )),
                            },
                        )]
                        .into_iter()
                        .collect(),
                    })),
                },
            )]
            .into_iter()
            .collect(),
        };

        let status = bridge
            .check_config(tonic::Request::new(crate::generated::CheckRequest {
                olds: Some(bogus),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status
            .message()
            .starts_with("CheckConfig failed to unmarshal olds"));
    }

    #[tokio::test]
    async fn test_not_yet_implemented_names_operation() {
        let bridge = Bridge::new(RecordingBackend::default());

        let status = bridge
            .get_schema(tonic::Request::new(crate::generated::GetSchemaRequest {
                version: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(status.message(), "GetSchema is not yet implemented");

        let status = bridge
            .invoke(tonic::Request::new(crate::generated::InvokeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.message(), "Invoke is not yet implemented");

        let status = bridge
            .get_mapping(tonic::Request::new(crate::generated::GetMappingRequest {
                key: "tf".to_string(),
                provider: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(status.message(), "GetMapping is not yet implemented");
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let bridge = Bridge::new(RecordingBackend::default());

        let status = bridge
            .delete(tonic::Request::new(crate::generated::DeleteRequest {
                id: "missing".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert_eq!(status.message(), "resource missing was already deleted");
    }

    #[tokio::test]
    async fn test_second_configure_is_rejected() {
        let bridge = Bridge::new(RecordingBackend::default());
        configure(&bridge, false, true).await;

        let status = bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                accept_resources: false,
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert_eq!(bridge.provider().configure_calls.load(Ordering::SeqCst), 1);
        assert!(bridge.capabilities().keep_resources);
    }

    #[tokio::test]
    async fn test_configure_legacy_variables() {
        let bridge = Bridge::new(RecordingBackend::default());

        bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                variables: std::collections::HashMap::from([
                    ("aws:region".to_string(), "\"us-east-1\"".to_string()),
                    ("aws:profile".to_string(), "not-json".to_string()),
                ]),
                ..Default::default()
            }))
            .await
            .unwrap();

        let seen = bridge
            .provider()
            .configured_with
            .lock()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(seen["region"], PropertyValue::from("us-east-1"));
        assert_eq!(seen["profile"], PropertyValue::from("not-json"));
    }

    #[tokio::test]
    async fn test_configure_rejects_malformed_legacy_key() {
        let bridge = Bridge::new(RecordingBackend::default());

        let status = bridge
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                variables: std::collections::HashMap::from([(
                    "region".to_string(),
                    "x".to_string(),
                )]),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(!bridge.capabilities().configured);
    }

    #[tokio::test]
    async fn test_attach_unsupported() {
        let bridge = Bridge::new(RecordingBackend::default());

        let status = bridge
            .attach(tonic::Request::new(crate::generated::PluginAttach {
                address: "127.0.0.1:1234".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(status.message(), "Attach is not yet implemented");
    }

    /// Supports Attach, and streams one item before waiting to be cancelled.
    #[derive(Default)]
    struct AttachableBackend {
        attached: Mutex<Vec<String>>,
        stream_token: Mutex<Option<CancellationToken>>,
    }

    #[async_trait::async_trait]
    impl ProviderService for AttachableBackend {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new("attachable", "0.1.0").with_attach()
        }

        async fn check(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _olds: PropertyMap,
            news: PropertyMap,
            _random_seed: &[u8],
        ) -> Result<CheckResult, ProviderError> {
            Ok(CheckResult::new(news))
        }

        async fn diff(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            _olds: PropertyMap,
            _news: PropertyMap,
            _ignore_changes: &[String],
        ) -> Result<DiffResult, ProviderError> {
            Ok(DiffResult::none())
        }

        async fn create(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _inputs: PropertyMap,
            _timeout: Option<Duration>,
            _preview: bool,
        ) -> Result<CreateResult, ProviderError> {
            Err(ProviderError::NotYetImplemented)
        }

        async fn read(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            _inputs: PropertyMap,
            _state: PropertyMap,
        ) -> Result<ReadResult, ProviderError> {
            Err(ProviderError::NotYetImplemented)
        }

        async fn update(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            _olds: PropertyMap,
            _news: PropertyMap,
            _timeout: Option<Duration>,
            _ignore_changes: &[String],
            _preview: bool,
        ) -> Result<PropertyMap, ProviderError> {
            Err(ProviderError::NotYetImplemented)
        }

        async fn delete(
            &self,
            _ctx: &CallContext,
            _urn: &Urn,
            _id: &str,
            _inputs: PropertyMap,
            _outputs: PropertyMap,
            _timeout: Option<Duration>,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::NotYetImplemented)
        }

        async fn stream_invoke(
            &self,
            ctx: &CallContext,
            _token: &str,
            _args: PropertyMap,
            sink: &mut dyn StreamSink,
        ) -> Result<Vec<CheckFailure>, ProviderError> {
            *self.stream_token.lock().unwrap() = Some(ctx.cancellation().clone());
            sink.send(PropertyMap::from([(
                "page".to_string(),
                PropertyValue::from(1.0),
            )]))
            .await?;
            ctx.cancelled().await;
            Err(ProviderError::Cancelled("stream abandoned".to_string()))
        }

        async fn attach(&self, address: &str) -> Result<(), ProviderError> {
            if address == "bad" {
                return Err(ProviderError::backend("nope"));
            }
            self.attached.lock().unwrap().push(address.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attach_reaches_backend_when_supported() {
        let bridge = Bridge::new(AttachableBackend::default());
        assert!(bridge.descriptor().supports_attach);

        bridge
            .attach(tonic::Request::new(crate::generated::PluginAttach {
                address: "127.0.0.1:4321".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(
            *bridge.provider().attached.lock().unwrap(),
            vec!["127.0.0.1:4321".to_string()]
        );
    }

    #[tokio::test]
    async fn test_attach_backend_error_passes_through() {
        let bridge = Bridge::new(AttachableBackend::default());

        let status = bridge
            .attach(tonic::Request::new(crate::generated::PluginAttach {
                address: "bad".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert_eq!(status.message(), "nope");
        assert!(bridge.provider().attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_invoke_disconnect_cancels_call() {
        let bridge = Bridge::new(AttachableBackend::default());

        let mut stream = bridge
            .stream_invoke(tonic::Request::new(crate::generated::InvokeRequest {
                tok: "pkg:index:pages".to_string(),
                args: None,
            }))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            native(first.r#return)["page"],
            PropertyValue::Number(1.0)
        );

        let token = bridge
            .provider()
            .stream_token
            .lock()
            .unwrap()
            .clone()
            .unwrap();
        assert!(!token.is_cancelled());

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(!bridge.context().is_cancelled());
    }

    #[tokio::test]
    async fn test_diff_update_replace() {
        let bridge = Bridge::new(RecordingBackend::default());

        let response = bridge
            .diff(tonic::Request::new(crate::generated::DiffRequest {
                id: "res-1".to_string(),
                urn: "urn:bucket".to_string(),
                olds: Some(wire(PropertyMap::from([(
                    "name".to_string(),
                    PropertyValue::from("a"),
                )]))),
                news: Some(wire(PropertyMap::from([(
                    "name".to_string(),
                    PropertyValue::from("b"),
                )]))),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            response.changes,
            crate::generated::diff_response::DiffChanges::DiffSome as i32
        );
        assert_eq!(response.replaces, vec!["name".to_string()]);
        assert_eq!(
            response.detailed_diff["name"].kind,
            crate::generated::property_diff::Kind::Update as i32
        );
    }

    #[tokio::test]
    async fn test_construct_passes_dependencies_through() {
        let bridge = Bridge::new(RecordingBackend::default());

        let response = bridge
            .construct(tonic::Request::new(crate::generated::ConstructRequest {
                r#type: "pkg:index:Cluster".to_string(),
                name: "main".to_string(),
                inputs: Some(wire(PropertyMap::from([(
                    "vpcId".to_string(),
                    PropertyValue::from("vpc-1"),
                )]))),
                input_dependencies: std::collections::HashMap::from([(
                    "vpcId".to_string(),
                    crate::generated::PropertyDependencies {
                        urns: vec!["urn:vpc".to_string(), "urn:igw".to_string()],
                    },
                )]),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.urn, "urn:component::main");
        assert_eq!(
            response.state_dependencies["vpcId"].urns,
            vec!["urn:vpc".to_string(), "urn:igw".to_string()]
        );
    }

    #[tokio::test]
    async fn test_plugin_info_reports_descriptor_version() {
        let bridge = Bridge::new(RecordingBackend::default());
        let info = bridge
            .get_plugin_info(tonic::Request::new(()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.version, "1.2.3");
    }

    #[tokio::test]
    async fn test_cancel_broadcasts() {
        let bridge = Bridge::new(RecordingBackend::default());
        let in_flight = bridge.context();

        bridge.cancel(tonic::Request::new(())).await.unwrap();

        assert!(in_flight.is_cancelled());
        assert!(!bridge.context().is_cancelled());
        assert!(!bridge.cancellation_token().is_cancelled());
        assert_eq!(bridge.provider().cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_twice_only_reaches_calls_in_flight() {
        let bridge = Bridge::new(RecordingBackend::default());
        let first = bridge.context();
        bridge.cancel(tonic::Request::new(())).await.unwrap();

        let second = bridge.context();
        bridge.cancel(tonic::Request::new(())).await.unwrap();
        let third = bridge.context();

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!third.is_cancelled());
        assert_eq!(bridge.provider().cancel_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_later_calls() {
        let bridge = Bridge::new(RecordingBackend::default());
        let in_flight = bridge.context();

        bridge.shutdown().await;

        assert!(in_flight.is_cancelled());
        assert!(bridge.context().is_cancelled());
        assert_eq!(bridge.provider().cancel_calls.load(Ordering::SeqCst), 1);
    }

    /// Accepts a fixed number of responses, then reports the receiver gone.
    struct LimitedSender {
        accept: usize,
        delivered: Vec<crate::generated::InvokeResponse>,
    }

    #[async_trait::async_trait]
    impl ResponseSender for LimitedSender {
        async fn send_response(
            &mut self,
            response: crate::generated::InvokeResponse,
        ) -> Result<(), ProviderError> {
            if self.delivered.len() == self.accept {
                return Err(ProviderError::Cancelled("receiver dropped".to_string()));
            }
            self.delivered.push(response);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_invoke_stops_after_failed_send() {
        let backend = RecordingBackend::default();
        let mut sender = LimitedSender {
            accept: 1,
            delivered: Vec::new(),
        };

        let result = run_stream_invoke(
            &backend,
            &CallContext::default(),
            "pkg:index:withFailures",
            PropertyMap::new(),
            MarshalOptions::new("item"),
            &mut sender,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sender.delivered.len(), 1);
        assert!(sender.delivered[0].failures.is_empty());
    }

    #[tokio::test]
    async fn test_stream_invoke_delivers_results_then_failures() {
        let bridge = Bridge::new(RecordingBackend::default()).with_stream_buffer(2);

        let stream = bridge
            .stream_invoke(tonic::Request::new(crate::generated::InvokeRequest {
                tok: "pkg:index:withFailures".to_string(),
                args: None,
            }))
            .await
            .unwrap()
            .into_inner();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 4);
        for (n, item) in items.iter().take(3).enumerate() {
            let item = item.as_ref().unwrap();
            assert_eq!(
                native(item.r#return.clone())["n"],
                PropertyValue::Number(n as f64)
            );
        }
        let last = items[3].as_ref().unwrap();
        assert!(last.r#return.is_none());
        assert_eq!(last.failures[0].property, "filter");
    }
}
