//! The request pipeline: decode, look up the gate, resolve, route, encode.
//!
//! Usage outcomes are handed to the [`UsageRecorder`] without waiting. For
//! streams, one spawned task pumps the routed stream into a bounded channel;
//! when the caller goes away the send fails, the task stops and the upstream
//! connection is dropped with it.

use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gate::{self, Gate};
use crate::providers::ResponseStream;
use crate::routing::Router;
use crate::store::{CachedGateStore, GateCache, GateStore, MemoryGateCache, MemoryGateStore};
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::translate::streaming::{AnthropicStreamEncoder, OpenAiStreamEncoder};
use crate::translate::{anthropic, openai};
use crate::unified::{UnifiedRequest, UnifiedResponse, OWNER_METADATA_KEY};
use crate::usage::{JsonlUsageLog, SpendLedger, SpendTracker, UsageOutcome, UsageRecorder, UsageSink};

const STREAM_BUFFER: usize = 8;

/// One server-sent event, ready for the host to frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

/// Error body for the native unified format.
pub fn error_body(err: &GatewayError) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "type": err.kind(),
            "message": err.to_string(),
        }
    })
}

pub struct Gateway {
    gates: Arc<dyn GateStore>,
    router: Router,
    usage: UsageRecorder,
}

impl Gateway {
    pub fn new(gates: Arc<dyn GateStore>, router: Router, usage: UsageRecorder) -> Self {
        Self { gates, router, usage }
    }

    /// Assemble a gateway from config: built-in adapters, env credentials,
    /// config gates behind the TTL cache, and the usage recorder.
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &GatewayConfig, client: reqwest::Client) -> Result<(Self, Arc<SpendLedger>)> {
        let router = Router::new(Arc::new(config.catalog()), Arc::new(config.credential_resolver()))
            .with_builtin_adapters(client, &config.base_urls());

        let store: Arc<dyn GateStore> = Arc::new(MemoryGateStore::from_gates(config.gates.clone()));
        let cache: Option<Arc<dyn GateCache>> = config.cache.enabled.then(|| {
            Arc::new(MemoryGateCache::new(
                Duration::from_secs(config.cache.ttl_secs),
                config.cache.max_entries,
            )) as Arc<dyn GateCache>
        });
        let gates = Arc::new(CachedGateStore::new(store, cache));

        let sink = match &config.usage.log_file {
            Some(path) => Some(Arc::new(JsonlUsageLog::open(path)?) as Arc<dyn UsageSink>),
            None => None,
        };
        let ledger = Arc::new(SpendLedger::new());
        let usage = UsageRecorder::spawn(sink, Some(ledger.clone() as Arc<dyn SpendTracker>));

        Ok((Self::new(gates, router, usage), ledger))
    }

    pub fn catalog(&self) -> &ModelCatalog {
        self.router.catalog()
    }

    /// Validate, look up the gate and merge it into the request.
    async fn prepare(&self, owner_id: &str, mut request: UnifiedRequest) -> Result<(Gate, UnifiedRequest)> {
        request.metadata.insert(
            OWNER_METADATA_KEY.to_string(),
            serde_json::Value::String(owner_id.to_string()),
        );
        request.validate()?;

        let gate = self
            .gates
            .get_gate(owner_id, &request.gate_id)
            .await?
            .ok_or_else(|| GatewayError::gate_not_found(&request.gate_id))?;

        let resolved = gate::resolve(&gate, request, self.router.catalog());
        debug!(gate = %gate.id, model = ?resolved.model, "Resolved request");
        Ok((gate, resolved))
    }

    fn provider_name(&self, model: &str) -> Option<&'static str> {
        self.router.catalog().provider_for(model).map(|p| p.as_str())
    }

    /// Run a unified request to completion.
    pub async fn execute(&self, owner_id: &str, request: UnifiedRequest) -> Result<UnifiedResponse> {
        let (gate, resolved) = self.prepare(owner_id, request).await?;

        match self.router.route(&gate, &resolved).await {
            Ok(response) => {
                info!(
                    gate = %gate.id,
                    model = %response.model,
                    cost = response.cost.unwrap_or(0.0),
                    latency_ms = response.latency_ms.unwrap_or(0),
                    "Completed"
                );
                self.usage.record(UsageOutcome::success(
                    Some(owner_id),
                    &gate.id,
                    self.provider_name(&response.model),
                    &response,
                ));
                Ok(response)
            }
            Err(e) => {
                self.usage.record(UsageOutcome::failure(Some(owner_id), &gate.id, &e));
                Err(e)
            }
        }
    }

    /// Run a unified chat request as a stream of chunks.
    pub async fn execute_stream(&self, owner_id: &str, request: UnifiedRequest) -> Result<ResponseStream> {
        let (gate, resolved) = self.prepare(owner_id, request).await?;

        let mut upstream = match self.router.route_stream(&gate, &resolved).await {
            Ok(stream) => stream,
            Err(e) => {
                self.usage.record(UsageOutcome::failure(Some(owner_id), &gate.id, &e));
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let usage = self.usage.clone();
        let catalog = self.router.catalog().clone();
        let owner = owner_id.to_string();
        let gate_id = gate.id.clone();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => {
                        debug!(gate = %gate_id, "Caller disconnected; dropping upstream stream");
                        break;
                    }
                    item = upstream.next() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                match &item {
                    Ok(chunk) if chunk.is_terminal() => {
                        let provider = catalog.provider_for(&chunk.model).map(|p| p.as_str());
                        usage.record(UsageOutcome::success(Some(&owner), &gate_id, provider, chunk));
                    }
                    Err(e) => {
                        warn!(gate = %gate_id, "Stream failed mid-way: {}", e);
                        usage.record(UsageOutcome::failure(Some(&owner), &gate_id, e));
                    }
                    Ok(_) => {}
                }
                if tx.send(item).await.is_err() {
                    debug!(gate = %gate_id, "Caller disconnected; dropping upstream stream");
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Native unified streaming, one JSON chunk per event.
    pub async fn execute_stream_events(&self, owner_id: &str, request: UnifiedRequest) -> Result<SseStream> {
        let mut chunks = self.execute_stream(owner_id, request).await?;
        let stream = async_stream::stream! {
            while let Some(item) = chunks.next().await {
                match item {
                    Ok(chunk) => {
                        if let Ok(json) = serde_json::to_string(&chunk) {
                            yield SseEvent::data(json);
                        }
                    }
                    Err(e) => {
                        yield SseEvent::data(error_body(&e).to_string());
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    // -----------------------------------------------------------------------
    // OpenAI Chat Completions
    // -----------------------------------------------------------------------

    pub async fn openai_chat(
        &self,
        owner_id: &str,
        gate_id: Option<&str>,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let request = openai::decode_request(req, gate_id)?;
        let response = self.execute(owner_id, request).await?;
        Ok(openai::encode_response(&response))
    }

    pub async fn openai_chat_stream(
        &self,
        owner_id: &str,
        gate_id: Option<&str>,
        req: ChatCompletionRequest,
    ) -> Result<SseStream> {
        let mut request = openai::decode_request(req, gate_id)?;
        if let Some(chat) = request.as_chat_mut() {
            chat.stream = true;
        }
        let model = request.model.clone().unwrap_or_default();
        let mut chunks = self.execute_stream(owner_id, request).await?;

        let stream = async_stream::stream! {
            let mut encoder = OpenAiStreamEncoder::new(&model);
            while let Some(item) = chunks.next().await {
                match item {
                    Ok(chunk) => {
                        for out in encoder.process(&chunk) {
                            if let Ok(json) = serde_json::to_string(&out) {
                                yield SseEvent::data(json);
                            }
                        }
                    }
                    Err(e) => {
                        if let Ok(json) = serde_json::to_string(&encoder.error(&e)) {
                            yield SseEvent::data(json);
                        }
                        break;
                    }
                }
            }
            for out in encoder.finish() {
                if let Ok(json) = serde_json::to_string(&out) {
                    yield SseEvent::data(json);
                }
            }
            yield SseEvent::data("[DONE]");
        };
        Ok(Box::pin(stream))
    }

    // -----------------------------------------------------------------------
    // Anthropic Messages
    // -----------------------------------------------------------------------

    pub async fn anthropic_messages(
        &self,
        owner_id: &str,
        gate_id: Option<&str>,
        req: MessagesRequest,
    ) -> Result<MessagesResponse> {
        let request = anthropic::decode_request(req, gate_id)?;
        let response = self.execute(owner_id, request).await?;
        Ok(anthropic::encode_response(&response))
    }

    pub async fn anthropic_messages_stream(
        &self,
        owner_id: &str,
        gate_id: Option<&str>,
        req: MessagesRequest,
    ) -> Result<SseStream> {
        let mut request = anthropic::decode_request(req, gate_id)?;
        if let Some(chat) = request.as_chat_mut() {
            chat.stream = true;
        }
        let model = request.model.clone().unwrap_or_default();
        let mut chunks = self.execute_stream(owner_id, request).await?;

        let stream = async_stream::stream! {
            let mut encoder = AnthropicStreamEncoder::new(&model);
            while let Some(item) = chunks.next().await {
                let events = match item {
                    Ok(chunk) => encoder.process(&chunk),
                    Err(e) => encoder.error(&e),
                };
                for event in events {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield SseEvent::named(event.event_name(), json);
                    }
                }
                if encoder.is_closed() {
                    break;
                }
            }
            for event in encoder.finish() {
                if let Ok(json) = serde_json::to_string(&event) {
                    yield SseEvent::named(event.event_name(), json);
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
