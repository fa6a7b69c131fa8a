//! Use the codecs without a server: decode an Anthropic request into the
//! unified model, then encode a unified response and stream both ways.
//!
//! Usage:
//!   `cargo run --example translate_only`

use llm_gateway::translate::anthropic_types::MessagesRequest;
use llm_gateway::translate::streaming::{AnthropicStreamEncoder, OpenAiStreamEncoder};
use llm_gateway::translate::{anthropic, openai};
use llm_gateway::unified::{FinishReason, ToolCall, UnifiedResponse, Usage};

fn main() -> anyhow::Result<()> {
    let wire: MessagesRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 1024,
        "system": "You are a geography expert. Be concise.",
        "messages": [
            {"role": "user", "content": "What is the capital of France?"},
            {"role": "assistant", "content": "The capital of France is Paris."},
            {"role": "user", "content": "And Germany?"}
        ],
        "stream": true
    }))?;

    // The gate id comes from a header here, so the wire model is an override.
    let unified = anthropic::decode_request(wire, Some("geography"))?;
    println!("=== Unified request ===");
    println!("{}", serde_json::to_string_pretty(&unified)?);

    let response = UnifiedResponse::text("gpt-4o", "The capital of Germany is Berlin.")
        .with_usage(Usage::new(42, 8));

    println!();
    println!("=== As Chat Completions ===");
    println!("{}", serde_json::to_string_pretty(&openai::encode_response(&response))?);

    println!();
    println!("=== As Anthropic Messages ===");
    println!("{}", serde_json::to_string_pretty(&anthropic::encode_response(&response))?);

    let chunks = vec![
        UnifiedResponse::content_delta("gpt-4o", "Checking"),
        UnifiedResponse::tool_call_delta(
            "gpt-4o",
            ToolCall {
                id: "call_1".to_string(),
                name: "lookup_capital".to_string(),
                arguments: "{\"country\":".to_string(),
            },
        ),
        UnifiedResponse::tool_call_delta(
            "gpt-4o",
            ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: "\"Germany\"}".to_string(),
            },
        ),
        UnifiedResponse::terminal("gpt-4o", FinishReason::ToolCall, Usage::new(42, 12)),
    ];

    println!();
    println!("=== Anthropic stream ===");
    let mut encoder = AnthropicStreamEncoder::new("gpt-4o");
    for (i, chunk) in chunks.iter().enumerate() {
        for event in encoder.process(chunk) {
            println!("  chunk {} -> {}", i, event.event_name());
        }
    }

    println!();
    println!("=== Chat Completions stream ===");
    let mut encoder = OpenAiStreamEncoder::new("gpt-4o");
    for chunk in &chunks {
        for out in encoder.process(chunk) {
            println!("  data: {}", serde_json::to_string(&out)?);
        }
    }
    println!("  data: [DONE]");

    Ok(())
}
