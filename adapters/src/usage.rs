//! Usage extraction and token estimation

use crate::types::RelayMode;
use quota_ledger::{BuiltInTool, ToolUsage, Usage};
use serde_json::Value;

/// Rough token count: one token per four characters
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Estimate prompt tokens from a client request body
///
/// Counts message contents, prompts and inputs for JSON bodies; any
/// other body is estimated from its byte length.
pub fn estimate_prompt_tokens(mode: RelayMode, body: &[u8]) -> u32 {
    if !mode.has_json_body() {
        return u32::try_from(body.len().div_ceil(4)).unwrap_or(u32::MAX);
    }
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return u32::try_from(body.len().div_ceil(4)).unwrap_or(u32::MAX),
    };

    let mut text = String::new();
    let mut messages = 0u32;
    if let Some(items) = value.get("messages").and_then(Value::as_array) {
        for message in items {
            messages += 1;
            if let Some(content) = message.get("content") {
                collect_text(content, &mut text);
            }
        }
    }
    for key in ["prompt", "input", "instructions", "system"] {
        if let Some(field) = value.get(key) {
            collect_text(field, &mut text);
        }
    }

    // per-message framing overhead
    estimate_tokens(&text).saturating_add(messages.saturating_mul(3))
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => items.iter().for_each(|item| collect_text(item, out)),
        Value::Object(map) => {
            for key in ["text", "content", "input_text"] {
                if let Some(inner) = map.get(key) {
                    collect_text(inner, out);
                }
            }
        }
        _ => {}
    }
}

fn count(value: Option<&Value>) -> u32 {
    value
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Usage block of a chat/completions/embeddings or Responses API body
pub fn parse_usage(body: &Value) -> Option<Usage> {
    let usage = body.get("usage").filter(|u| u.is_object())?;

    let prompt_tokens = count(usage.get("prompt_tokens").or_else(|| usage.get("input_tokens")));
    let completion_tokens =
        count(usage.get("completion_tokens").or_else(|| usage.get("output_tokens")));
    let mut total_tokens = count(usage.get("total_tokens"));
    if total_tokens == 0 {
        total_tokens = prompt_tokens.saturating_add(completion_tokens);
    }

    let prompt_details = usage
        .get("prompt_tokens_details")
        .or_else(|| usage.get("input_tokens_details"));
    let completion_details = usage
        .get("completion_tokens_details")
        .or_else(|| usage.get("output_tokens_details"));
    let detail = |details: Option<&Value>, key: &str| count(details.and_then(|d| d.get(key)));

    let mut parsed = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        ..Default::default()
    };
    parsed.prompt_tokens_details.cached_tokens = detail(prompt_details, "cached_tokens");
    parsed.prompt_tokens_details.image_tokens = detail(prompt_details, "image_tokens");
    parsed.prompt_tokens_details.audio_tokens = detail(prompt_details, "audio_tokens");
    parsed.completion_tokens_details.audio_tokens = detail(completion_details, "audio_tokens");
    parsed.completion_tokens_details.reasoning_tokens =
        detail(completion_details, "reasoning_tokens");

    Some(parsed)
}

/// Count Responses API built-in tool calls in `output`
pub fn count_tool_calls(body: &Value, context_size: Option<&str>, usage: &mut Usage) {
    let Some(output) = body.get("output").and_then(Value::as_array) else {
        return;
    };

    let mut web_search = 0u32;
    let mut file_search = 0u32;
    for item in output {
        match item.get("type").and_then(Value::as_str) {
            Some("web_search_call") => web_search += 1,
            Some("file_search_call") => file_search += 1,
            _ => {}
        }
    }

    if web_search > 0 {
        add_tool(usage, BuiltInTool::WebSearch, web_search, context_size);
    }
    if file_search > 0 {
        add_tool(usage, BuiltInTool::FileSearch, file_search, None);
    }
}

/// Record tool calls on a usage, merging with any already present
pub fn add_tool(usage: &mut Usage, tool: BuiltInTool, calls: u32, context_size: Option<&str>) {
    match usage.tool_calls.iter_mut().find(|t| t.tool == tool) {
        Some(existing) => existing.call_count += calls,
        None => usage.tool_calls.push(ToolUsage {
            tool,
            call_count: calls,
            search_context_size: context_size.map(str::to_string),
        }),
    }
}

/// Incremental `data:` line extractor for server-sent events
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
}

impl SseParser {
    /// Empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the payloads of every complete `data:` line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }

    /// Payload of an unterminated last line, if any
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest);
        rest.trim()
            .strip_prefix("data:")
            .map(|data| data.trim_start().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_chat_prompt() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "hello there"}]}
            ]
        });
        let tokens = estimate_prompt_tokens(RelayMode::ChatCompletions, body.to_string().as_bytes());
        // "be brief hello there " = 21 chars -> 6, plus 2 * 3
        assert_eq!(tokens, 12);
    }

    #[test]
    fn test_estimate_non_json_body() {
        assert_eq!(estimate_prompt_tokens(RelayMode::AudioTranscription, &[0u8; 40]), 10);
        assert_eq!(estimate_prompt_tokens(RelayMode::ChatCompletions, b"not json"), 2);
    }

    #[test]
    fn test_parse_chat_usage() {
        let body = json!({
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "total_tokens": 120,
                "prompt_tokens_details": {"cached_tokens": 64},
                "completion_tokens_details": {"reasoning_tokens": 5}
            }
        });
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 64);
        assert_eq!(usage.completion_tokens_details.reasoning_tokens, 5);
    }

    #[test]
    fn test_parse_responses_usage() {
        let body = json!({
            "usage": {
                "input_tokens": 30,
                "output_tokens": 12,
                "input_tokens_details": {"cached_tokens": 10}
            }
        });
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.total_tokens, 42);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 10);
    }

    #[test]
    fn test_null_usage_ignored() {
        assert!(parse_usage(&json!({"usage": null})).is_none());
        assert!(parse_usage(&json!({})).is_none());
    }

    #[test]
    fn test_count_tool_calls() {
        let body = json!({
            "output": [
                {"type": "web_search_call", "status": "completed"},
                {"type": "web_search_call", "status": "completed"},
                {"type": "file_search_call"},
                {"type": "message"}
            ]
        });
        let mut usage = Usage::new(1, 1);
        count_tool_calls(&body, Some("high"), &mut usage);

        let web = usage.tool(BuiltInTool::WebSearch).unwrap();
        assert_eq!(web.call_count, 2);
        assert_eq!(web.search_context_size.as_deref(), Some("high"));
        assert_eq!(usage.tool(BuiltInTool::FileSearch).unwrap().call_count, 1);
    }

    #[test]
    fn test_sse_parser_handles_split_lines() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"a\"").is_empty());
        assert_eq!(parser.push(b":1}\r\n\r\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
        assert!(parser.push(b": keep-alive\n").is_empty());
        parser.push(b"data: tail");
        assert_eq!(parser.finish().as_deref(), Some("tail"));
    }
}
