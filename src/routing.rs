//! The routing engine: picks the model(s) a gate allows and calls the adapter
//! serving each one.
//!
//! Fallback is strictly sequential and first-success. For streams, a fallback
//! is only possible before the first chunk of an attempt has been seen; once a
//! provider has produced output, its errors end the stream.

use futures::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::credentials::{Credential, CredentialResolver};
use crate::error::{GatewayError, Result};
use crate::gate::{Gate, RoutingStrategy};
use crate::providers::{
    AnthropicAdapter, GoogleAdapter, MistralAdapter, OpenAiAdapter, ProviderAdapter, ProviderKind,
    ResponseStream,
};
use crate::unified::{FinishReason, UnifiedRequest, UnifiedResponse, Usage};

pub struct Router {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    credentials: Arc<dyn CredentialResolver>,
    catalog: Arc<ModelCatalog>,
}

impl Router {
    pub fn new(catalog: Arc<ModelCatalog>, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            adapters: HashMap::new(),
            credentials,
            catalog,
        }
    }

    /// Register (or replace) the adapter for its provider.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Register the four built-in adapters, with per-provider base URL overrides.
    pub fn with_builtin_adapters(
        self,
        client: reqwest::Client,
        base_urls: &HashMap<ProviderKind, String>,
    ) -> Self {
        let url = |kind: ProviderKind| {
            base_urls
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| kind.preset().base_url.to_string())
        };
        self.with_adapter(Arc::new(OpenAiAdapter::new(client.clone(), url(ProviderKind::OpenAi))))
            .with_adapter(Arc::new(AnthropicAdapter::new(
                client.clone(),
                url(ProviderKind::Anthropic),
            )))
            .with_adapter(Arc::new(GoogleAdapter::new(client.clone(), url(ProviderKind::Google))))
            .with_adapter(Arc::new(MistralAdapter::new(client, url(ProviderKind::Mistral))))
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Models to attempt for a resolved request, in order.
    pub fn models_to_try(&self, gate: &Gate, request: &UnifiedRequest) -> Vec<String> {
        let resolved = request.model.clone().unwrap_or_else(|| gate.model.clone());
        match gate.routing_strategy {
            RoutingStrategy::Single => vec![resolved],
            RoutingStrategy::Fallback => std::iter::once(resolved)
                .chain(gate.fallback_models.iter().map(|m| self.canonical(m)))
                .collect(),
            RoutingStrategy::RoundRobin => {
                let pool: Vec<String> = std::iter::once(&gate.model)
                    .chain(gate.fallback_models.iter())
                    .map(|m| self.canonical(m))
                    .collect();
                let pick = rand::thread_rng().gen_range(0..pool.len());
                vec![pool[pick].clone()]
            }
        }
    }

    fn canonical(&self, model: &str) -> String {
        self.catalog.normalize(model).unwrap_or_else(|| model.to_string())
    }

    /// Look up the adapter for `model` and the credential to call it with.
    async fn prepare(
        &self,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<(Arc<dyn ProviderAdapter>, Credential, UnifiedRequest)> {
        let provider = self
            .catalog
            .provider_for(model)
            .ok_or_else(|| GatewayError::unknown_model(model))?;
        let adapter = self.adapters.get(&provider).cloned().ok_or_else(|| {
            GatewayError::config(format!("No adapter registered for provider {provider}"))
        })?;

        let request_type = request.request_type();
        if !adapter.supports(request_type) {
            return Err(GatewayError::unsupported(
                provider.as_str(),
                format!("{request_type} requests"),
            ));
        }

        let credential = self.credentials.resolve(provider, request.caller_id()).await?;

        let mut attempt = request.clone();
        attempt.model = Some(model.to_string());
        Ok((adapter, credential, attempt))
    }

    async fn call_model(&self, model: &str, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let (adapter, credential, attempt) = self.prepare(model, request).await?;
        debug!(model, provider = %adapter.kind(), "Calling provider");

        let start = Instant::now();
        let mut response = adapter.call(&attempt, &credential).await?;

        response.model = model.to_string();
        response.stream = false;
        response.latency_ms = Some(start.elapsed().as_millis() as u64);
        response.used_platform_key = credential.used_platform_key;
        response.cost = Some(
            response
                .usage
                .map(|u| self.catalog.cost_for_usage(model, &u))
                .unwrap_or(0.0),
        );
        Ok(response)
    }

    async fn stream_model(&self, model: &str, request: &UnifiedRequest) -> Result<ResponseStream> {
        let (adapter, credential, mut attempt) = self.prepare(model, request).await?;
        if let Some(chat) = attempt.as_chat_mut() {
            chat.stream = true;
        }
        debug!(model, provider = %adapter.kind(), "Opening provider stream");

        let start = Instant::now();
        let mut inner = adapter.call_stream(&attempt, &credential).await?;

        // An attempt only counts as started once it produces something.
        let first = match inner.next().await {
            Some(Err(e)) => return Err(e),
            first => first,
        };

        Ok(terminal_guard(
            first,
            inner,
            StreamFinish {
                model: model.to_string(),
                catalog: self.catalog.clone(),
                start,
                used_platform_key: credential.used_platform_key,
            },
        ))
    }

    /// Route a one-shot request.
    pub async fn route(&self, gate: &Gate, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let models = self.models_to_try(gate, request);
        info!(
            gate = %gate.id,
            strategy = gate.routing_strategy.as_str(),
            models = ?models,
            "Routing request"
        );

        let mut last_error = None;
        for (i, model) in models.iter().enumerate() {
            match self.call_model(model, request).await {
                Ok(response) => return Ok(response),
                Err(e) if aborts_fallback(&e) => return Err(e),
                Err(e) => {
                    warn!(gate = %gate.id, model = %model, attempt = i + 1, "Model failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(aggregate(models.len(), last_error))
    }

    /// Route a streaming chat request. The returned stream ends with exactly
    /// one terminal chunk, or with an error.
    pub async fn route_stream(&self, gate: &Gate, request: &UnifiedRequest) -> Result<ResponseStream> {
        let models = self.models_to_try(gate, request);
        info!(
            gate = %gate.id,
            strategy = gate.routing_strategy.as_str(),
            models = ?models,
            "Routing stream"
        );

        let mut last_error = None;
        for (i, model) in models.iter().enumerate() {
            match self.stream_model(model, request).await {
                Ok(stream) => return Ok(stream),
                Err(e) if aborts_fallback(&e) => return Err(e),
                Err(e) => {
                    warn!(gate = %gate.id, model = %model, attempt = i + 1, "Stream failed before output: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(aggregate(models.len(), last_error))
    }
}

/// Errors that no other model would fix.
fn aborts_fallback(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::InvalidRequest { .. } | GatewayError::Unsupported { .. }
    )
}

fn aggregate(attempted: usize, last: Option<GatewayError>) -> GatewayError {
    match last {
        Some(e) if attempted == 1 => e,
        Some(e) => GatewayError::AllModelsFailed {
            attempted,
            last: Box::new(e),
        },
        None => GatewayError::config("gate has no models to route to"),
    }
}

struct StreamFinish {
    model: String,
    catalog: Arc<ModelCatalog>,
    start: Instant,
    used_platform_key: bool,
}

impl StreamFinish {
    fn complete(&self, chunk: &mut UnifiedResponse) {
        let usage = chunk.usage.unwrap_or_default();
        chunk.usage = Some(usage);
        chunk.cost = Some(self.catalog.cost_for_usage(&self.model, &usage));
        chunk.latency_ms = Some(self.start.elapsed().as_millis() as u64);
        chunk.used_platform_key = self.used_platform_key;
    }
}

/// Enforce the stream shape whatever the adapter produced: usage only on the
/// terminal chunk, no content on it, nothing after it, and a synthesized
/// terminal chunk if the provider ended without one.
fn terminal_guard(
    first: Option<Result<UnifiedResponse>>,
    mut inner: ResponseStream,
    finish: StreamFinish,
) -> ResponseStream {
    let stream = async_stream::stream! {
        let mut pending = first;
        loop {
            let item = match pending.take() {
                Some(item) => Some(item),
                None => inner.next().await,
            };
            let Some(item) = item else { break };

            let mut chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            chunk.model = finish.model.clone();
            chunk.stream = true;

            if !chunk.is_terminal() {
                chunk.usage = None;
                chunk.cost = None;
                yield Ok(chunk);
                continue;
            }

            if chunk.content.as_deref().is_some_and(|c| !c.is_empty()) || !chunk.tool_calls.is_empty() {
                yield Ok(UnifiedResponse {
                    content: chunk.content.take(),
                    tool_calls: std::mem::take(&mut chunk.tool_calls),
                    model: finish.model.clone(),
                    stream: true,
                    ..UnifiedResponse::default()
                });
            }
            chunk.content = None;
            finish.complete(&mut chunk);
            yield Ok(chunk);
            return;
        }

        warn!(model = %finish.model, "Provider stream ended without a finish reason");
        let mut terminal = UnifiedResponse::terminal(&finish.model, FinishReason::Completed, Usage::default());
        finish.complete(&mut terminal);
        yield Ok(terminal);
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelInfo;
    use crate::credentials::StaticCredentialResolver;
    use crate::unified::{ChatRequest, Message, RequestType, ToolCall};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers per model: `Ok(content)` or `Err(message)`.
    struct ScriptedAdapter {
        kind: ProviderKind,
        script: HashMap<String, std::result::Result<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(kind: ProviderKind, script: &[(&str, std::result::Result<&str, &str>)]) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: script
                    .iter()
                    .map(|(m, r)| (m.to_string(), r.map(String::from).map_err(String::from)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn outcome(&self, request: &UnifiedRequest) -> Result<String> {
            let model = request.model.clone().unwrap_or_default();
            self.calls.lock().unwrap().push(model.clone());
            match self.script.get(&model) {
                Some(Ok(content)) => Ok(content.clone()),
                Some(Err(message)) => Err(GatewayError::provider_status(self.kind.as_str(), 503, message.clone())),
                None => Err(GatewayError::provider(self.kind.as_str(), "unscripted model")),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn supports(&self, request_type: RequestType) -> bool {
            request_type == RequestType::Chat
        }

        async fn call(&self, request: &UnifiedRequest, _credential: &Credential) -> Result<UnifiedResponse> {
            let content = self.outcome(request)?;
            Ok(UnifiedResponse::text("provider-echo", content).with_usage(Usage::new(5, 1)))
        }

        async fn call_stream(&self, request: &UnifiedRequest, _credential: &Credential) -> Result<ResponseStream> {
            let content = self.outcome(request)?;
            let chunks = vec![
                Ok(UnifiedResponse::content_delta("", content).with_usage(Usage::new(5, 0))),
                Ok(UnifiedResponse::tool_call_delta(
                    "",
                    ToolCall {
                        id: "c1".to_string(),
                        name: "lookup".to_string(),
                        arguments: "{}".to_string(),
                    },
                )),
                Ok(UnifiedResponse::terminal("", FinishReason::ToolCall, Usage::new(5, 3))),
                Ok(UnifiedResponse::content_delta("", "after the end")),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::empty()
                .with_model(ModelInfo::new("model-x", ProviderKind::OpenAi, 1.0, 2.0))
                .with_model(ModelInfo::new("model-y", ProviderKind::Anthropic, 1.0, 2.0))
                .with_model(ModelInfo::new("model-z", ProviderKind::Anthropic, 1.0, 2.0)),
        )
    }

    fn router(openai: Arc<ScriptedAdapter>, anthropic: Arc<ScriptedAdapter>) -> Router {
        let credentials = StaticCredentialResolver::new()
            .with_platform_key(ProviderKind::OpenAi, "k1")
            .with_platform_key(ProviderKind::Anthropic, "k2");
        Router::new(catalog(), Arc::new(credentials))
            .with_adapter(openai)
            .with_adapter(anthropic)
    }

    fn fallback_gate() -> Gate {
        let mut gate = Gate::new("g1", "support", "model-x");
        gate.routing_strategy = RoutingStrategy::Fallback;
        gate.fallback_models = vec!["model-y".to_string()];
        gate
    }

    fn request(model: &str) -> UnifiedRequest {
        let mut request = UnifiedRequest::chat(
            "g1",
            ChatRequest {
                messages: vec![Message::user("hello")],
                ..ChatRequest::default()
            },
        );
        request.model = Some(model.to_string());
        request
    }

    #[tokio::test]
    async fn test_text_only_fallback() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[("model-x", Err("down"))]);
        let anthropic = ScriptedAdapter::new(ProviderKind::Anthropic, &[("model-y", Ok("hi"))]);
        let router = router(openai.clone(), anthropic);

        let response = router.route(&fallback_gate(), &request("model-x")).await.unwrap();
        assert_eq!(response.model, "model-y");
        assert_eq!(response.content.as_deref(), Some("hi"));
        assert_eq!(response.usage, Some(Usage::new(5, 1)));
        assert!(response.used_platform_key);
        assert!(response.latency_ms.is_some());
        let cost = response.cost.unwrap();
        assert!((cost - 7.0 / 1_000_000.0).abs() < 1e-12);
        assert_eq!(*openai.calls.lock().unwrap(), vec!["model-x".to_string()]);
    }

    #[tokio::test]
    async fn test_all_fallbacks_fail_reports_last() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[("model-x", Err("x down"))]);
        let anthropic = ScriptedAdapter::new(
            ProviderKind::Anthropic,
            &[("model-y", Err("y down")), ("model-z", Err("z down"))],
        );
        let router = router(openai, anthropic);
        let mut gate = fallback_gate();
        gate.fallback_models.push("model-z".to_string());

        let err = router.route(&gate, &request("model-x")).await.unwrap_err();
        match err {
            GatewayError::AllModelsFailed { attempted, last } => {
                assert_eq!(attempted, 3);
                assert!(last.to_string().contains("z down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_single_propagates_untouched() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[("model-x", Err("x down"))]);
        let anthropic = ScriptedAdapter::new(ProviderKind::Anthropic, &[("model-y", Ok("hi"))]);
        let router = router(openai, anthropic.clone());
        let mut gate = fallback_gate();
        gate.routing_strategy = RoutingStrategy::Single;

        let err = router.route(&gate, &request("model-x")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Provider { status: Some(503), .. }));
        assert!(anthropic.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_aborts_fallback() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[]);
        let anthropic = ScriptedAdapter::new(ProviderKind::Anthropic, &[("model-y", Ok("hi"))]);
        let router = router(openai, anthropic.clone());

        let mut request = request("model-x");
        request.payload = crate::unified::RequestPayload::Embeddings(crate::unified::EmbeddingsRequest {
            input: vec!["a".to_string()],
            dimensions: None,
        });
        let err = router.route(&fallback_gate(), &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
        assert!(anthropic.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_round_robin_picks_from_gate_models() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[]);
        let anthropic = ScriptedAdapter::new(ProviderKind::Anthropic, &[]);
        let router = router(openai, anthropic);
        let mut gate = fallback_gate();
        gate.routing_strategy = RoutingStrategy::RoundRobin;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let models = router.models_to_try(&gate, &request("model-z"));
            assert_eq!(models.len(), 1);
            assert_ne!(models[0], "model-z");
            seen.insert(models[0].clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_terminal_guard() {
        let openai = ScriptedAdapter::new(ProviderKind::OpenAi, &[("model-x", Err("down"))]);
        let anthropic = ScriptedAdapter::new(ProviderKind::Anthropic, &[("model-y", Ok("Let me check"))]);
        let router = router(openai, anthropic);

        let stream = router.route_stream(&fallback_gate(), &request("model-x")).await.unwrap();
        let chunks: Vec<UnifiedResponse> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
        assert!(chunks[0].usage.is_none());
        assert!(chunks.iter().all(|c| c.model == "model-y" && c.stream));

        let terminal = chunks.last().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::ToolCall));
        assert_eq!(terminal.usage, Some(Usage::new(5, 3)));
        assert!(terminal.cost.is_some());
        assert!(terminal.content.is_none());
    }

    #[tokio::test]
    async fn test_guard_splits_content_and_synthesizes_terminal() {
        let finish = || StreamFinish {
            model: "m".to_string(),
            catalog: catalog(),
            start: Instant::now(),
            used_platform_key: false,
        };

        let mut last = UnifiedResponse::terminal("", FinishReason::Completed, Usage::new(1, 1));
        last.content = Some("tail".to_string());
        let inner: ResponseStream = Box::pin(futures::stream::iter(vec![Ok(last)]));
        let chunks: Vec<_> = terminal_guard(None, inner, finish()).collect().await;
        assert_eq!(chunks.len(), 2);
        let delta = chunks[0].as_ref().unwrap();
        assert_eq!(delta.content.as_deref(), Some("tail"));
        assert!(!delta.is_terminal());
        assert!(chunks[1].as_ref().unwrap().content.is_none());

        let inner: ResponseStream = Box::pin(futures::stream::iter(vec![Ok(UnifiedResponse::content_delta("", "x"))]));
        let chunks: Vec<_> = terminal_guard(None, inner, finish()).collect().await;
        let terminal = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Completed));
        assert_eq!(terminal.usage, Some(Usage::default()));
    }

    #[tokio::test]
    async fn test_mid_stream_error_ends_stream() {
        let finish = StreamFinish {
            model: "m".to_string(),
            catalog: catalog(),
            start: Instant::now(),
            used_platform_key: true,
        };
        let inner: ResponseStream = Box::pin(futures::stream::iter(vec![
            Ok(UnifiedResponse::content_delta("", "partial")),
            Err(GatewayError::stream("connection reset")),
            Ok(UnifiedResponse::content_delta("", "never")),
        ]));
        let chunks: Vec<_> = terminal_guard(None, inner, finish).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_err());
    }
}
