//! OpenAI-compatible adapter — the in-process HTTP Stream Reader's provider.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions wire format.

use std::collections::HashMap;

use cro_domain::capability::{LlmCapabilities, ToolSupport};
use cro_domain::config::ChatAgentConfig;
use cro_domain::error::{OrchestratorError, Result};
use cro_domain::stream::{BoxStream, StreamEvent, Usage};
use cro_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    extra_headers: HashMap<String, String>,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build a provider instance from an agent's chat configuration.
    pub fn from_config(id: impl Into<String>, cfg: &ChatAgentConfig) -> Result<Self> {
        let default_model = cfg.model.clone().unwrap_or_else(|| "gpt-4o".into());
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".into())
            .trim_end_matches('/')
            .to_string();

        let capabilities = LlmCapabilities {
            supports_tools: ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: true,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.into(),
            base_url,
            api_key: cfg.api_key.clone(),
            extra_headers: cfg.extra_headers.clone(),
            default_model,
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        for (k, v) in &self.extra_headers {
            builder = builder.header(k, v);
        }
        builder
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = Value::String("auto".into());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if let Some(ref level) = req.reasoning_level {
            body["reasoning_effort"] = serde_json::json!(level);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => {
            let text = msg.content.extract_all_text();
            serde_json::json!({
                "role": role_to_str(msg.role),
                "content": text,
            })
        }
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    let tool_call_id = msg.tool_call_id.clone().unwrap_or_default();
    serde_json::json!({
        "role": "tool",
        "tool_call_id": tool_call_id,
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| OrchestratorError::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| OrchestratorError::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming: one iteration's worth of normalized events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates per-iteration state across SSE chunks so the closure handed
/// to [`crate::sse::sse_response_stream`] can stay a plain `FnMut`.
#[derive(Default)]
struct IterationState {
    cumulative_text: String,
    thinking_text: String,
    thinking_started: bool,
    thinking_done: bool,
    /// tool_call fragment index → call_id, once the id has been seen.
    index_to_call_id: HashMap<u64, String>,
    /// call_id → cumulative arguments JSON text seen so far.
    call_args: HashMap<String, String>,
}

fn parse_openai_chunk(data: &str, state: &mut IterationState) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(OrchestratorError::Json(e))],
    };

    let choice = match v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        Some(c) => c,
        None => return Vec::new(),
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut events = Vec::new();

    // Reasoning content arrives before ordinary text; a transition to text
    // closes out the thinking phase.
    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            if !state.thinking_started {
                state.thinking_started = true;
                events.push(Ok(StreamEvent::ThinkingStart));
            }
            state.thinking_text.push_str(text);
            events.push(Ok(StreamEvent::ThinkingDelta {
                delta: text.to_string(),
            }));
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            if state.thinking_started && !state.thinking_done {
                state.thinking_done = true;
                events.push(Ok(StreamEvent::ThinkingDone {
                    text: state.thinking_text.clone(),
                }));
            }
            state.cumulative_text.push_str(text);
            events.push(Ok(StreamEvent::TextDelta {
                delta: text.to_string(),
                cumulative: state.cumulative_text.clone(),
            }));
        }
    }

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                if !state.index_to_call_id.contains_key(&index) {
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    state.index_to_call_id.insert(index, id.to_string());
                    state.call_args.insert(id.to_string(), String::new());
                    events.push(Ok(StreamEvent::ToolCallStart {
                        call_id: id.to_string(),
                        tool_name: name,
                        args_so_far: String::new(),
                    }));
                }
            }

            if let Some(args_delta) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if let Some(call_id) = state.index_to_call_id.get(&index).cloned() {
                    let cumulative = state.call_args.entry(call_id.clone()).or_default();
                    cumulative.push_str(args_delta);
                    let cumulative = cumulative.clone();
                    events.push(Ok(StreamEvent::ToolInputDelta {
                        call_id,
                        args_delta: args_delta.to_string(),
                        cumulative,
                    }));
                }
            }
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(OrchestratorError::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, true);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(OrchestratorError::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = IterationState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_openai_chunk(data, &mut state)
        }))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "text-embedding-3-small".into());
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": model, "input": req.input });

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(OrchestratorError::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let data = resp_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| OrchestratorError::Provider {
                provider: self.id.clone(),
                message: "missing 'data' array in embeddings response".into(),
            })?;

        let embeddings: Vec<Vec<f32>> = data
            .iter()
            .filter_map(|item| {
                let embedding = item.get("embedding")?.as_array()?;
                Some(
                    embedding
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect(),
                )
            })
            .collect();

        Ok(EmbeddingsResponse { embeddings })
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_tracks_cumulative() {
        let mut state = IterationState::default();
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": "hel"}}]
        })
        .to_string();
        let events = parse_openai_chunk(&chunk, &mut state);
        match &events[0] {
            Ok(StreamEvent::TextDelta { delta, cumulative }) => {
                assert_eq!(delta, "hel");
                assert_eq!(cumulative, "hel");
            }
            _ => panic!("expected TextDelta"),
        }

        let chunk2 = serde_json::json!({
            "choices": [{"delta": {"content": "lo"}}]
        })
        .to_string();
        let events2 = parse_openai_chunk(&chunk2, &mut state);
        match &events2[0] {
            Ok(StreamEvent::TextDelta { cumulative, .. }) => assert_eq!(cumulative, "hello"),
            _ => panic!("expected TextDelta"),
        }
    }

    #[test]
    fn tool_call_start_then_input_delta() {
        let mut state = IterationState::default();
        let first = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "exec", "arguments": ""}}
            ]}}]
        })
        .to_string();
        let events = parse_openai_chunk(&first, &mut state);
        assert!(matches!(events[0], Ok(StreamEvent::ToolCallStart { .. })));

        let second = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"cmd\":"}}
            ]}}]
        })
        .to_string();
        let events2 = parse_openai_chunk(&second, &mut state);
        match &events2[0] {
            Ok(StreamEvent::ToolInputDelta { call_id, cumulative, .. }) => {
                assert_eq!(call_id, "call_1");
                assert_eq!(cumulative, "{\"cmd\":");
            }
            _ => panic!("expected ToolInputDelta"),
        }
    }

    #[test]
    fn thinking_phase_closes_on_first_text() {
        let mut state = IterationState::default();
        let reasoning = serde_json::json!({
            "choices": [{"delta": {"reasoning_content": "pondering"}}]
        })
        .to_string();
        let events = parse_openai_chunk(&reasoning, &mut state);
        assert!(matches!(events[0], Ok(StreamEvent::ThinkingStart)));
        assert!(matches!(events[1], Ok(StreamEvent::ThinkingDelta { .. })));

        let text = serde_json::json!({
            "choices": [{"delta": {"content": "answer"}}]
        })
        .to_string();
        let events2 = parse_openai_chunk(&text, &mut state);
        assert!(matches!(events2[0], Ok(StreamEvent::ThinkingDone { .. })));
        assert!(matches!(events2[1], Ok(StreamEvent::TextDelta { .. })));
    }

    #[test]
    fn empty_choices_yields_no_events() {
        let mut state = IterationState::default();
        let chunk = serde_json::json!({"choices": []}).to_string();
        assert!(parse_openai_chunk(&chunk, &mut state).is_empty());
    }
}
