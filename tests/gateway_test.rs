use async_trait::async_trait;
use llm_gateway::catalog::{ModelCatalog, ModelInfo};
use llm_gateway::credentials::{Credential, StaticCredentialResolver};
use llm_gateway::gate::{Gate, RoutingStrategy};
use llm_gateway::providers::{ProviderAdapter, ProviderKind, ResponseStream};
use llm_gateway::unified::{FinishReason, RequestType, ToolCall, UnifiedRequest, UnifiedResponse, Usage};
use llm_gateway::{
    build_router, AppState, Gateway, GatewayConfig, GatewayError, MemoryGateStore, Router, UsageRecorder,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;

/// Fails every call; stands in for a provider that is down.
struct DownAdapter(ProviderKind);

#[async_trait]
impl ProviderAdapter for DownAdapter {
    fn kind(&self) -> ProviderKind {
        self.0
    }

    fn supports(&self, request_type: RequestType) -> bool {
        request_type == RequestType::Chat
    }

    async fn call(&self, _request: &UnifiedRequest, _credential: &Credential) -> llm_gateway::Result<UnifiedResponse> {
        Err(GatewayError::provider_status(self.0.as_str(), 503, "overloaded"))
    }

    async fn call_stream(
        &self,
        _request: &UnifiedRequest,
        _credential: &Credential,
    ) -> llm_gateway::Result<ResponseStream> {
        Err(GatewayError::provider_status(self.0.as_str(), 503, "overloaded"))
    }
}

/// Answers "hi", or streams a short text followed by a tool call.
struct ToolAdapter(ProviderKind);

#[async_trait]
impl ProviderAdapter for ToolAdapter {
    fn kind(&self) -> ProviderKind {
        self.0
    }

    fn supports(&self, request_type: RequestType) -> bool {
        request_type == RequestType::Chat
    }

    async fn call(&self, _request: &UnifiedRequest, _credential: &Credential) -> llm_gateway::Result<UnifiedResponse> {
        Ok(UnifiedResponse::text("upstream-name", "hi").with_usage(Usage::new(5, 1)))
    }

    async fn call_stream(
        &self,
        _request: &UnifiedRequest,
        _credential: &Credential,
    ) -> llm_gateway::Result<ResponseStream> {
        let chunks = vec![
            Ok(UnifiedResponse::content_delta("", "Let me check")),
            Ok(UnifiedResponse::tool_call_delta(
                "",
                ToolCall {
                    id: "c1".to_string(),
                    name: "get_weather".to_string(),
                    arguments: "{\"loc\":".to_string(),
                },
            )),
            Ok(UnifiedResponse::terminal("", FinishReason::ToolCall, Usage::new(12, 7))),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

fn mock_gateway() -> Gateway {
    let catalog = ModelCatalog::empty()
        .with_model(ModelInfo::new("model-x", ProviderKind::OpenAi, 1.0, 2.0))
        .with_model(ModelInfo::new("model-y", ProviderKind::Anthropic, 1.0, 2.0));
    let credentials = StaticCredentialResolver::new()
        .with_platform_key(ProviderKind::OpenAi, "k1")
        .with_platform_key(ProviderKind::Anthropic, "k2");
    let router = Router::new(Arc::new(catalog), Arc::new(credentials))
        .with_adapter(Arc::new(DownAdapter(ProviderKind::OpenAi)))
        .with_adapter(Arc::new(ToolAdapter(ProviderKind::Anthropic)));

    let mut gate = Gate::new("g-support", "support", "model-x");
    gate.owner_id = "acme".to_string();
    gate.routing_strategy = RoutingStrategy::Fallback;
    gate.fallback_models = vec!["model-y".to_string()];

    let store = Arc::new(MemoryGateStore::from_gates(vec![gate]));
    Gateway::new(store, router, UsageRecorder::disabled())
}

async fn serve(gateway: Gateway, default_owner: &str) -> String {
    let state = Arc::new(AppState {
        gateway,
        default_owner: default_owner.to_string(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

/// `(event name, data)` pairs of an SSE body.
fn parse_sse(body: &str) -> Vec<(Option<String>, String)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(d) = line.strip_prefix("data:") {
                    data = Some(d.trim().to_string());
                }
            }
            data.map(|d| (event, d))
        })
        .collect()
}

#[tokio::test]
async fn test_openai_endpoint_falls_back() {
    let base = serve(mock_gateway(), "acme").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "support",
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["model"], "model-y");
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 6);
}

#[tokio::test]
async fn test_anthropic_stream_tool_call_events() {
    let base = serve(mock_gateway(), "nobody").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-owner-id", "acme")
        .header("x-gate-id", "g-support")
        .json(&json!({
            "model": "model-y",
            "max_tokens": 100,
            "stream": true,
            "messages": [{"role": "user", "content": "weather in Paris?"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let events = parse_sse(&resp.text().await.unwrap());
    let names: Vec<&str> = events.iter().filter_map(|(e, _)| e.as_deref()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let tool_start: Value = serde_json::from_str(&events[4].1).unwrap();
    assert_eq!(tool_start["index"], 1);
    assert_eq!(tool_start["content_block"]["type"], "tool_use");
    assert_eq!(tool_start["content_block"]["id"], "c1");

    let message_delta: Value = serde_json::from_str(&events[7].1).unwrap();
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
    assert_eq!(message_delta["usage"]["output_tokens"], 7);
}

#[tokio::test]
async fn test_openai_stream_ends_with_done() {
    let base = serve(mock_gateway(), "acme").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "support",
            "stream": true,
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .send()
        .await
        .unwrap();

    let events = parse_sse(&resp.text().await.unwrap());
    assert_eq!(events.last().unwrap().1, "[DONE]");

    let first: Value = serde_json::from_str(&events[0].1).unwrap();
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(first["model"], "model-y");

    let finishes: Vec<Value> = events[..events.len() - 1]
        .iter()
        .map(|(_, d)| serde_json::from_str::<Value>(d).unwrap())
        .filter(|c| !c["choices"][0]["finish_reason"].is_null())
        .collect();
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0]["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn test_unified_endpoint() {
    let base = serve(mock_gateway(), "acme").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/gateway"))
        .json(&json!({
            "gateId": "support",
            "type": "chat",
            "data": {"messages": [{"role": "user", "content": "hello"}]}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"], "hi");
    assert_eq!(body["model"], "model-y");
    assert_eq!(body["finishReason"], "completed");
    assert_eq!(body["usedPlatformKey"], true);
}

#[tokio::test]
async fn test_errors_use_caller_wire_shape() {
    let base = serve(mock_gateway(), "acme").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "no-such-gate", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");

    let resp = client
        .post(format!("{base}/v1/messages"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_models_and_health() {
    let base = serve(mock_gateway(), "acme").await;
    let client = reqwest::Client::new();

    let models: Value = client
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["model-y", "model-x"]);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}

/// A fake OpenAI upstream: one-shot and SSE chat completions.
async fn fake_openai_upstream() -> String {
    use axum::http::header::CONTENT_TYPE;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Json;

    async fn completions(Json(req): Json<Value>) -> axum::response::Response {
        if req["stream"] == true {
            let body = [
                json!({"id": "u1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
                       "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}, "finish_reason": null}]}),
                json!({"id": "u1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
                       "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
                json!({"id": "u1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini",
                       "choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}}),
            ]
            .iter()
            .map(|c| format!("data: {c}\n\n"))
            .collect::<String>()
                + "data: [DONE]\n\n";
            return ([(CONTENT_TYPE, "text/event-stream")], body).into_response();
        }

        Json(json!({
            "id": "u1",
            "object": "chat.completion",
            "created": 1,
            "model": req["model"],
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": format!("temp={}", req["temperature"])},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 1000000, "completion_tokens": 0, "total_tokens": 1000000}
        }))
        .into_response()
    }

    let app = axum::Router::new().route("/v1/chat/completions", post(completions));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

#[tokio::test]
async fn test_config_driven_gateway_against_fake_upstream() {
    let upstream = fake_openai_upstream().await;
    std::env::set_var("LLM_GATEWAY_IT_OPENAI_KEY", "sk-test");

    let dir = tempfile::tempdir().unwrap();
    let usage_log = dir.path().join("usage.jsonl");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[providers.openai]
base_url = "{upstream}"
api_key_env = "LLM_GATEWAY_IT_OPENAI_KEY"

[usage]
log_file = "{}"

[[gates]]
id = "g1"
name = "cheap"
model = "gpt-4o-mini"
temperature = 0.2
allow_overrides = false
"#,
        usage_log.display()
    )
    .unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    let (gateway, ledger) = Gateway::from_config(&config, reqwest::Client::new()).unwrap();
    let base = serve(gateway, &config.default_owner).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "cheap",
            "temperature": 0.9,
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "temp=0.2");
    assert_eq!(body["choices"][0]["finish_reason"], "length");

    let text = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "cheap",
            "stream": true,
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = parse_sse(&text);
    let content: String = events
        .iter()
        .filter(|(_, d)| d != "[DONE]")
        .filter_map(|(_, d)| {
            let chunk: Value = serde_json::from_str(d).ok()?;
            chunk["choices"][0]["delta"]["content"].as_str().map(String::from)
        })
        .collect();
    assert_eq!(content, "Hello");

    // Outcomes are recorded in the background.
    for _ in 0..200 {
        let logged = std::fs::read_to_string(&usage_log).map(|s| s.lines().count()).unwrap_or(0);
        if logged >= 2 && ledger.total("default") > 0.15 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let lines = std::fs::read_to_string(&usage_log).unwrap();
    assert_eq!(lines.lines().count(), 2);
    // 1M prompt tokens of gpt-4o-mini at $0.15/M, plus the small streamed call.
    assert!(ledger.total("default") > 0.15);
}
