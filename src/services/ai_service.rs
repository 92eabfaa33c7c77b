use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::conversation::Conversation;
use crate::services::conversation_service::ConversationStore;
use crate::services::tool_service::{ToolInvoker, ToolResult, ToolSpec};

/// How many prior messages are replayed into the model context.
const CONTEXT_WINDOW: i64 = 20;

/// Advisory classification of an inbound message. Logged for correlation and
/// used to pick the deterministic fallback reply; when tools are available
/// the model's own tool selection is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    ProductSearch,
    CartAction,
    PolicyQuestion,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::ProductSearch => "product_search",
            Self::CartAction => "cart_action",
            Self::PolicyQuestion => "policy_question",
            Self::General => "general",
        }
    }
}

pub fn classify_intent(text: &str) -> Intent {
    let lowered = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

    if has(&["refund", "return", "exchange", "shipping", "policy", "deliver", "warranty"]) {
        return Intent::PolicyQuestion;
    }
    if has(&["cart", "checkout", "order", "buy", "purchase", "add ", "remove "]) {
        return Intent::CartAction;
    }
    if has(&["do you have", "looking for", "find", "search", "stock", "price", "sell", "carry"]) {
        return Intent::ProductSearch;
    }
    let first_word = lowered
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric());
    if lowered.split_whitespace().count() <= 3
        && ["hi", "hello", "hey", "howdy", "morning", "evening"].contains(&first_word)
    {
        return Intent::Greeting;
    }
    Intent::General
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone)]
pub struct RequestedToolCall {
    pub name: String,
    pub arguments: JsonValue,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: Option<String>,
    pub tool_calls: Vec<RequestedToolCall>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome>;
}

/// Chat-completions client. Tool specs are translated into the model's
/// function-calling schema here, at the orchestrator boundary.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, client: Client) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(serde::Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatResponseToolCall>,
}

#[derive(serde::Deserialize)]
struct ChatResponseToolCall {
    function: ChatResponseFunction,
}

#[derive(serde::Deserialize)]
struct ChatResponseFunction {
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        for turn in &request.turns {
            messages.push(json!({ "role": turn.role, "content": turn.content }));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.7,
        });
        if !request.tools.is_empty() {
            let tools: Vec<JsonValue> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description.clone().unwrap_or_default(),
                            "parameters": if tool.input_schema.is_object() {
                                tool.input_schema.clone()
                            } else {
                                json!({ "type": "object", "properties": {} })
                            },
                        },
                    })
                })
                .collect();
            payload["tools"] = JsonValue::Array(tools);
            payload["tool_choice"] = json!("auto");
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("model unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Connection(format!(
                "model API error {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("invalid model response: {}", e)))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| Error::Connection("model returned no choices".to_string()))?;

        let tool_calls = message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                        warn!(tool = %call.function.name, error = %e, "unparseable tool arguments, substituting empty object");
                        json!({})
                    });
                RequestedToolCall {
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatOutcome {
            text: message.content,
            tool_calls,
        })
    }
}

/// The result of one agent turn. `response_text` is never empty: every
/// degradation path substitutes a fallback reply.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response_text: String,
    pub used_tools: bool,
    pub tools_executed: Vec<String>,
}

/// Drives one conversational turn: classify, build context, invoke the
/// model, execute any requested tools, then humanize the raw results.
pub struct AiOrchestrator {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolInvoker>,
    store: Arc<dyn ConversationStore>,
    model_timeout: Duration,
    tool_timeout: Duration,
}

impl AiOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolInvoker>,
        store: Arc<dyn ConversationStore>,
        model_timeout: Duration,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            tools,
            store,
            model_timeout,
            tool_timeout,
        }
    }

    /// Run a full turn for an inbound message. Infallible by design: any
    /// model or tool failure degrades to a fallback reply so the customer
    /// always hears back.
    pub async fn run_turn(&self, conversation: &Conversation, inbound_text: &str) -> AgentReply {
        let intent = classify_intent(inbound_text);
        info!(
            conversation_id = %conversation.id,
            intent = intent.as_str(),
            "running agent turn"
        );

        let turns = self.build_context(conversation, inbound_text).await;
        let tools = match timeout(self.tool_timeout, self.tools.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                warn!(conversation_id = %conversation.id, error = %e, "tool listing failed, continuing without tools");
                Vec::new()
            }
            Err(_) => {
                warn!(conversation_id = %conversation.id, "tool listing timed out, continuing without tools");
                Vec::new()
            }
        };

        let request = ChatRequest {
            system: self.system_prompt(conversation),
            turns,
            tools,
        };
        let outcome = match timeout(self.model_timeout, self.llm.chat(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(conversation_id = %conversation.id, error = %e, "model call failed, using fallback reply");
                return AgentReply {
                    response_text: fallback_reply(intent).to_string(),
                    used_tools: false,
                    tools_executed: Vec::new(),
                };
            }
            Err(_) => {
                warn!(conversation_id = %conversation.id, "model call timed out, using fallback reply");
                return AgentReply {
                    response_text: fallback_reply(intent).to_string(),
                    used_tools: false,
                    tools_executed: Vec::new(),
                };
            }
        };

        if outcome.tool_calls.is_empty() {
            let response_text = outcome
                .text
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| fallback_reply(intent).to_string());
            return AgentReply {
                response_text,
                used_tools: false,
                tools_executed: Vec::new(),
            };
        }

        let (results, tools_executed) = self
            .execute_tools(conversation, outcome.tool_calls)
            .await;
        if results.is_empty() {
            // Every requested tool failed; the raw question still deserves an
            // answer, just without pretending we looked anything up.
            return AgentReply {
                response_text: fallback_reply(intent).to_string(),
                used_tools: false,
                tools_executed,
            };
        }

        let response_text = self
            .humanize(conversation, inbound_text, &results)
            .await
            .unwrap_or_else(|| summary_reply(&results));

        AgentReply {
            response_text,
            used_tools: true,
            tools_executed,
        }
    }

    fn system_prompt(&self, conversation: &Conversation) -> String {
        let store_name = conversation
            .metadata
            .as_ref()
            .and_then(|m| m.get("store_name"))
            .and_then(JsonValue::as_str)
            .unwrap_or("this store");

        format!(
            "You are a friendly shopping assistant for {store} (store number {store_phone}, \
             tenant {tenant}). You are texting with the customer at {customer}. \
             Answer in 2-3 short sentences suitable for a text message. Use the available \
             tools to look up products, manage the cart, or check store policies before \
             answering questions about them. Never invent product details.",
            store = store_name,
            store_phone = conversation.store_phone,
            tenant = conversation.tenant_id,
            customer = conversation.customer_phone,
        )
    }

    /// Replay recent history as alternating turns. Missing or unreadable
    /// history degrades to just the current message, never a failure.
    async fn build_context(&self, conversation: &Conversation, inbound_text: &str) -> Vec<ChatTurn> {
        let history = match self
            .store
            .recent_messages(conversation.id, CONTEXT_WINDOW)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "history unavailable, using empty context");
                Vec::new()
            }
        };

        let mut turns: Vec<ChatTurn> = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| ChatTurn {
                role: if message.direction == "inbound" {
                    "user".to_string()
                } else {
                    "assistant".to_string()
                },
                content: message.content.clone(),
            })
            .collect();

        // The inbound message is usually already appended to history; only
        // add it when the window missed it.
        let already_last = turns
            .last()
            .map(|turn| turn.role == "user" && turn.content == inbound_text)
            .unwrap_or(false);
        if !already_last {
            turns.push(ChatTurn {
                role: "user".to_string(),
                content: inbound_text.to_string(),
            });
        }
        turns
    }

    /// Run requested tool calls sequentially. A failed call is logged and
    /// excluded from humanization; it never aborts the turn.
    async fn execute_tools(
        &self,
        conversation: &Conversation,
        calls: Vec<RequestedToolCall>,
    ) -> (Vec<ToolResult>, Vec<String>) {
        let mut results = Vec::new();
        let mut executed = Vec::new();

        for call in calls {
            executed.push(call.name.clone());
            match timeout(
                self.tool_timeout,
                self.tools.call_tool(&call.name, call.arguments),
            )
            .await
            {
                Ok(Ok(result)) => {
                    debug!(conversation_id = %conversation.id, tool = %result.name, "tool call succeeded");
                    results.push(result);
                }
                Ok(Err(e)) => {
                    warn!(conversation_id = %conversation.id, tool = %call.name, error = %e, "tool call failed");
                }
                Err(_) => {
                    warn!(conversation_id = %conversation.id, tool = %call.name, "tool call timed out");
                }
            }
        }
        (results, executed)
    }

    /// One extra model call turning raw tool output into a short reply; a
    /// failure here falls back to a templated summary.
    async fn humanize(
        &self,
        conversation: &Conversation,
        inbound_text: &str,
        results: &[ToolResult],
    ) -> Option<String> {
        let joined = results
            .iter()
            .map(|result| format!("[{}]\n{}", result.name, result.raw_text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let request = ChatRequest {
            system: "You summarize raw store-tool output into a warm, concise reply to a \
                     customer text message. Two to three sentences, no markdown, no raw JSON."
                .to_string(),
            turns: vec![ChatTurn {
                role: "user".to_string(),
                content: format!(
                    "The customer asked: {}\n\nTool output:\n{}",
                    inbound_text, joined
                ),
            }],
            tools: Vec::new(),
        };

        match timeout(self.model_timeout, self.llm.chat(request)).await {
            Ok(Ok(outcome)) => outcome.text.filter(|text| !text.trim().is_empty()),
            Ok(Err(e)) => {
                warn!(conversation_id = %conversation.id, error = %e, "humanization failed, using templated summary");
                None
            }
            Err(_) => {
                warn!(conversation_id = %conversation.id, "humanization timed out, using templated summary");
                None
            }
        }
    }
}

fn fallback_reply(intent: Intent) -> &'static str {
    match intent {
        Intent::Greeting => "Hi there! How can I help you today?",
        Intent::ProductSearch => {
            "Thanks for reaching out! Let me help you find that — I'm checking with the store and will get back to you shortly."
        }
        Intent::CartAction => {
            "Happy to help with your order! Could you tell me a little more about what you'd like to do?"
        }
        Intent::PolicyQuestion => {
            "Good question! Let me check the store's policy on that and get right back to you."
        }
        Intent::General => {
            "Thanks for your message! How can I help you today?"
        }
    }
}

fn summary_reply(results: &[ToolResult]) -> String {
    let first = results
        .iter()
        .map(|result| result.raw_text.trim())
        .find(|text| !text.is_empty())
        .unwrap_or("nothing yet");
    let mut snippet: String = first.chars().take(300).collect();
    if first.chars().count() > 300 {
        snippet.push('…');
    }
    format!("Here's what I found: {}", snippet)
}
