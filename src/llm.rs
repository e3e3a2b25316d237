// LLM 适配：统一封装三种线协议（OpenAI 兼容 / Anthropic Messages / Google Gemini）。
// 批量模式支持工具调用往返，流式模式只回调文本增量。
use crate::credentials::ResolvedCredential;
use crate::providers::{Provider, WireKind};
use crate::schemas::{ChatMessage, TokenUsage, ToolSpec};
use anyhow::{anyhow, Result};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::future::Future;
use uuid::Uuid;

/// 模型发起的一次工具调用，arguments 为 JSON 字符串。
#[derive(Debug, Clone)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<LlmToolCall>,
    pub usage: Option<TokenUsage>,
}

/// 跨协议的统一对话记录。各协议的 payload 构造器负责映射成自己的形状。
#[derive(Debug, Clone)]
pub enum TranscriptEntry {
    Message(ChatMessage),
    AssistantToolCalls {
        content: String,
        calls: Vec<LlmToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: Provider,
    credential: ResolvedCredential,
    params: GenerationParams,
}

impl LlmClient {
    pub fn new(
        http: Client,
        provider: Provider,
        credential: ResolvedCredential,
        params: GenerationParams,
    ) -> Self {
        Self {
            http,
            provider,
            credential,
            params,
        }
    }

    pub async fn complete(
        &self,
        transcript: &[TranscriptEntry],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse> {
        let wire = self.provider.wire_kind();
        let payload = build_payload(wire, &self.params, transcript, tools, false);
        let response = self
            .request(wire, false)
            .json(&payload)
            .send()
            .await
            .map_err(|err| anyhow!("模型请求失败: {err}"))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("模型请求失败: {status} {body}"));
        }
        parse_response(wire, &body)
    }

    /// 流式补全：逐段回调文本增量，返回合并后的完整响应。
    pub async fn stream_complete_with_callback<F, Fut>(
        &self,
        transcript: &[TranscriptEntry],
        mut on_delta: F,
    ) -> Result<LlmResponse>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let wire = self.provider.wire_kind();
        let payload = build_payload(wire, &self.params, transcript, &[], true);
        let response = self
            .request(wire, true)
            .json(&payload)
            .send()
            .await
            .map_err(|err| anyhow!("模型请求失败: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("模型流式请求失败: {status} {text}"));
        }
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut combined = String::new();
        let mut usage: Option<TokenUsage> = None;
        while let Some(item) = stream.next().await {
            let bytes = item?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer = buffer[pos + 1..].to_string();
                if !line.starts_with("data:") {
                    continue;
                }
                let data = line.trim_start_matches("data:").trim();
                if data == "[DONE]" {
                    return Ok(LlmResponse {
                        content: combined,
                        tool_calls: Vec::new(),
                        usage,
                    });
                }
                let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let (delta, chunk_usage) = extract_stream_delta(wire, &chunk);
                if let Some(new_usage) = chunk_usage {
                    usage = merge_usage(usage, new_usage);
                }
                if !delta.is_empty() {
                    combined.push_str(&delta);
                    on_delta(delta).await?;
                }
            }
        }
        Ok(LlmResponse {
            content: combined,
            tool_calls: Vec::new(),
            usage,
        })
    }

    fn request(&self, wire: WireKind, stream: bool) -> reqwest::RequestBuilder {
        let base = self.credential.base_url.trim_end_matches('/');
        match wire {
            WireKind::OpenAiCompatible => {
                let endpoint = if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                };
                self.http
                    .post(endpoint)
                    .bearer_auth(&self.credential.api_key)
            }
            WireKind::Anthropic => self
                .http
                .post(format!("{base}/v1/messages"))
                .header("x-api-key", self.credential.api_key.as_str())
                .header("anthropic-version", "2023-06-01"),
            WireKind::Google => {
                let action = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                let separator = if action.contains('?') { '&' } else { '?' };
                self.http.post(format!(
                    "{base}/models/{model}:{action}{separator}key={key}",
                    model = self.params.model,
                    key = self.credential.api_key,
                ))
            }
        }
    }
}

pub fn build_payload(
    wire: WireKind,
    params: &GenerationParams,
    transcript: &[TranscriptEntry],
    tools: &[ToolSpec],
    stream: bool,
) -> Value {
    match wire {
        WireKind::OpenAiCompatible => build_openai_payload(params, transcript, tools, stream),
        WireKind::Anthropic => build_anthropic_payload(params, transcript, tools, stream),
        WireKind::Google => build_gemini_payload(params, transcript, tools),
    }
}

fn build_openai_payload(
    params: &GenerationParams,
    transcript: &[TranscriptEntry],
    tools: &[ToolSpec],
    stream: bool,
) -> Value {
    let mut messages = Vec::new();
    for entry in transcript {
        match entry {
            TranscriptEntry::Message(message) => {
                messages.push(json!({ "role": message.role, "content": message.content }));
            }
            TranscriptEntry::AssistantToolCalls { content, calls } => {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect();
                messages.push(json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { json!(content) },
                    "tool_calls": tool_calls,
                }));
            }
            TranscriptEntry::ToolResult {
                call_id, content, ..
            } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": content,
                }));
            }
        }
    }
    let mut payload = json!({
        "model": params.model,
        "messages": messages,
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
        "stream": stream,
    });
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    },
                })
            })
            .collect();
        payload["tools"] = json!(declarations);
    }
    payload
}

fn build_anthropic_payload(
    params: &GenerationParams,
    transcript: &[TranscriptEntry],
    tools: &[ToolSpec],
    stream: bool,
) -> Value {
    // system 消息走顶层 system 字段，工具结果作为 user 侧 tool_result 块。
    let mut system = String::new();
    let mut messages: Vec<Value> = Vec::new();
    for entry in transcript {
        match entry {
            TranscriptEntry::Message(message) if message.role == "system" => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.content);
            }
            TranscriptEntry::Message(message) => {
                messages.push(json!({ "role": message.role, "content": message.content }));
            }
            TranscriptEntry::AssistantToolCalls { content, calls } => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": content }));
                }
                for call in calls {
                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            TranscriptEntry::ToolResult {
                call_id, content, ..
            } => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": content,
                    }],
                }));
            }
        }
    }
    let mut payload = json!({
        "model": params.model,
        "messages": messages,
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
        "stream": stream,
    });
    if !system.is_empty() {
        payload["system"] = json!(system);
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        payload["tools"] = json!(declarations);
    }
    payload
}

fn build_gemini_payload(
    params: &GenerationParams,
    transcript: &[TranscriptEntry],
    tools: &[ToolSpec],
) -> Value {
    let mut system = String::new();
    let mut contents: Vec<Value> = Vec::new();
    for entry in transcript {
        match entry {
            TranscriptEntry::Message(message) if message.role == "system" => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.content);
            }
            TranscriptEntry::Message(message) => {
                let role = if message.role == "assistant" {
                    "model"
                } else {
                    "user"
                };
                contents.push(json!({
                    "role": role,
                    "parts": [{ "text": message.content }],
                }));
            }
            TranscriptEntry::AssistantToolCalls { content, calls } => {
                let mut parts = Vec::new();
                if !content.is_empty() {
                    parts.push(json!({ "text": content }));
                }
                for call in calls {
                    let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                    parts.push(json!({
                        "functionCall": { "name": call.name, "args": args },
                    }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            TranscriptEntry::ToolResult { name, content, .. } => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": { "result": content },
                        },
                    }],
                }));
            }
        }
    }
    let mut payload = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": params.temperature,
            "maxOutputTokens": params.max_tokens,
        },
    });
    if !system.is_empty() {
        payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect();
        payload["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    payload
}

pub fn parse_response(wire: WireKind, body: &Value) -> Result<LlmResponse> {
    match wire {
        WireKind::OpenAiCompatible => parse_openai_response(body),
        WireKind::Anthropic => parse_anthropic_response(body),
        WireKind::Google => parse_gemini_response(body),
    }
}

fn parse_openai_response(body: &Value) -> Result<LlmResponse> {
    let message = body
        .get("choices")
        .and_then(|value| value.get(0))
        .and_then(|value| value.get("message"))
        .ok_or_else(|| anyhow!("响应缺少 choices[0].message: {body}"))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let mut tool_calls = Vec::new();
    if let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for raw in raw_calls {
            let function = raw.get("function").cloned().unwrap_or(Value::Null);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                continue;
            }
            tool_calls.push(LlmToolCall {
                id: raw
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                name,
                arguments: function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            });
        }
    }
    Ok(LlmResponse {
        content,
        tool_calls,
        usage: normalize_usage(body.get("usage")),
    })
}

fn parse_anthropic_response(body: &Value) -> Result<LlmResponse> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("响应缺少 content 块: {body}"))?;
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                content.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if name.is_empty() {
                    continue;
                }
                tool_calls.push(LlmToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    name,
                    arguments: block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                });
            }
            _ => {}
        }
    }
    Ok(LlmResponse {
        content,
        tool_calls,
        usage: normalize_usage(body.get("usage")),
    })
}

fn parse_gemini_response(body: &Value) -> Result<LlmResponse> {
    let parts = body
        .get("candidates")
        .and_then(|value| value.get(0))
        .and_then(|value| value.get("content"))
        .and_then(|value| value.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("响应缺少 candidates[0].content.parts: {body}"))?;
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            content.push_str(text);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                continue;
            }
            // Gemini 不下发调用 id，本地生成一个用于结果关联。
            tool_calls.push(LlmToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                name,
                arguments: call
                    .get("args")
                    .map(|args| args.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            });
        }
    }
    Ok(LlmResponse {
        content,
        tool_calls,
        usage: normalize_usage(body.get("usageMetadata")),
    })
}

/// 从单个 SSE 数据块里抽取文本增量与用量。
pub fn extract_stream_delta(wire: WireKind, chunk: &Value) -> (String, Option<TokenUsage>) {
    match wire {
        WireKind::OpenAiCompatible => {
            let delta = chunk
                .get("choices")
                .and_then(|value| value.get(0))
                .and_then(|value| value.get("delta"))
                .and_then(|value| value.get("content"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (delta, normalize_usage(chunk.get("usage")))
        }
        WireKind::Anthropic => match chunk.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = chunk
                    .get("delta")
                    .filter(|delta| {
                        delta.get("type").and_then(Value::as_str) == Some("text_delta")
                    })
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                (delta, None)
            }
            Some("message_start") => {
                let usage = chunk
                    .get("message")
                    .and_then(|message| message.get("usage"));
                (String::new(), normalize_usage(usage))
            }
            Some("message_delta") => (String::new(), normalize_usage(chunk.get("usage"))),
            _ => (String::new(), None),
        },
        WireKind::Google => {
            let delta = chunk
                .get("candidates")
                .and_then(|value| value.get(0))
                .and_then(|value| value.get("content"))
                .and_then(|value| value.get("parts"))
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .collect::<String>()
                })
                .unwrap_or_default();
            (delta, normalize_usage(chunk.get("usageMetadata")))
        }
    }
}

fn merge_usage(current: Option<TokenUsage>, incoming: TokenUsage) -> Option<TokenUsage> {
    // Anthropic 把 input/output 拆在不同事件里下发，按字段取最大值合并。
    let merged = match current {
        Some(existing) => TokenUsage {
            input: existing.input.max(incoming.input),
            output: existing.output.max(incoming.output),
            total: 0,
        },
        None => incoming,
    };
    Some(TokenUsage {
        total: if merged.total > 0 {
            merged.total
        } else {
            merged.input + merged.output
        },
        ..merged
    })
}

fn normalize_usage(raw: Option<&Value>) -> Option<TokenUsage> {
    let Some(Value::Object(map)) = raw else {
        return None;
    };
    let to_u64 = |value: Option<&Value>| -> Option<u64> {
        match value {
            Some(Value::Number(num)) => num.as_u64(),
            Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
            _ => None,
        }
    };
    let input = to_u64(map.get("input_tokens"))
        .or_else(|| to_u64(map.get("prompt_tokens")))
        .or_else(|| to_u64(map.get("promptTokenCount")))
        .unwrap_or(0);
    let output = to_u64(map.get("output_tokens"))
        .or_else(|| to_u64(map.get("completion_tokens")))
        .or_else(|| to_u64(map.get("candidatesTokenCount")))
        .unwrap_or(0);
    let total = to_u64(map.get("total_tokens"))
        .or_else(|| to_u64(map.get("totalTokenCount")))
        .unwrap_or(input + output);
    if input == 0 && output == 0 && total == 0 {
        return None;
    }
    Some(TokenUsage {
        input,
        output,
        total,
    })
}
