use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{Error, Result};

/// A remote tool advertised by the merchant endpoint, in the shape the
/// orchestrator translates into the model's function-calling schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub name: String,
    pub raw_text: String,
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<ToolResult>;
}

/// JSON-RPC 2.0 client for the merchant tool endpoint. Every call is a
/// single HTTP round trip; retry policy belongs to the caller.
pub struct RpcToolClient {
    client: Client,
    endpoint: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

impl RpcToolClient {
    pub fn new(endpoint: String, client: Client) -> Self {
        Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
        }
    }

    async fn post_rpc(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("tool endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::ToolCall(format!(
                "tool endpoint returned HTTP {}",
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| Error::ToolCall(format!("invalid tool response: {}", e)))?;
        unwrap_rpc(parsed)
    }
}

/// A JSON-RPC `error` member and a missing `result` both mean the server was
/// reachable but the call failed, which is distinct from a transport error.
fn unwrap_rpc(parsed: RpcResponse) -> Result<JsonValue> {
    if let Some(err) = parsed.error {
        return Err(Error::ToolCall(format!(
            "{} (code {})",
            err.message, err.code
        )));
    }
    parsed
        .result
        .ok_or_else(|| Error::ToolCall("tool response carried no result".to_string()))
}

/// Tool results arrive as a list of `{type: "text", text}` content blocks;
/// concatenate the text fields in order.
fn extract_text(result: &JsonValue) -> String {
    result
        .get("content")
        .and_then(JsonValue::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(JsonValue::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(JsonValue::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[async_trait]
impl ToolInvoker for RpcToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.post_rpc("tools/list", json!({})).await?;
        let listed: ToolListResult = serde_json::from_value(result)?;
        Ok(listed.tools)
    }

    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<ToolResult> {
        let result = self
            .post_rpc(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;

        if result.get("isError").and_then(JsonValue::as_bool) == Some(true) {
            return Err(Error::ToolCall(format!(
                "tool '{}' reported an error: {}",
                name,
                extract_text(&result)
            )));
        }

        Ok(ToolResult {
            name: name.to_string(),
            raw_text: extract_text(&result),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rpc_error_member_maps_to_tool_call_error() {
        let parsed: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32602, "message": "unknown tool" }
        }))
        .expect("deserialize");
        let err = unwrap_rpc(parsed).expect_err("error member must fail");
        assert!(matches!(err, Error::ToolCall(_)));
        assert!(err.to_string().contains("unknown tool"));
    }

    #[test]
    fn missing_result_is_a_tool_call_error() {
        let parsed: RpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 2 })).expect("deserialize");
        assert!(matches!(unwrap_rpc(parsed), Err(Error::ToolCall(_))));
    }

    #[test]
    fn text_blocks_are_concatenated_in_order() {
        let result = json!({
            "content": [
                { "type": "text", "text": "first" },
                { "type": "image", "data": "..." },
                { "type": "text", "text": "second" }
            ]
        });
        assert_eq!(extract_text(&result), "first\nsecond");
    }

    #[test]
    fn tool_specs_deserialize_from_the_list_result() {
        let listed: ToolListResult = serde_json::from_value(json!({
            "tools": [{
                "name": "search_shop_catalog",
                "description": "Search the product catalog",
                "inputSchema": { "type": "object", "properties": { "query": { "type": "string" } } }
            }]
        }))
        .expect("deserialize");
        assert_eq!(listed.tools.len(), 1);
        assert_eq!(listed.tools[0].name, "search_shop_catalog");
        assert!(listed.tools[0].input_schema.is_object());
    }
}
