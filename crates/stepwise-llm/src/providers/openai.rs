use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Generator;
use stepwise_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat-completions generator.
///
/// Sends the bound step prompt as the system message, the thread history,
/// and the step's allowed actions as function tools. Every tool call in the
/// response comes back as a `RequestedAction`; choosing which one applies is
/// the runner's job.
pub struct OpenAiGenerator {
    http: Client,
    config: ModelConfig,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: ModelConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        Self {
            http: Client::new(),
            config,
            api_key,
        }
    }

    fn endpoint(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCall>,
}

#[derive(Deserialize, Debug)]
struct OaiToolCall {
    function: OaiFunction,
}

#[derive(Deserialize, Debug)]
struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

pub(crate) fn convert_tools(actions: &[ActionSpec]) -> Vec<OaiTool> {
    actions
        .iter()
        .map(|a| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: a.name.clone(),
                description: a.description.clone(),
                parameters: a.input_schema.clone(),
            },
        })
        .collect()
}

/// System prompt first, then history. Tool notes become system messages so
/// the model sees what was recorded without needing the original call ids.
pub(crate) fn convert_messages(system_prompt: &str, history: &[ChatMessage]) -> Vec<OaiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(OaiMessage {
        role: "system".to_string(),
        content: system_prompt.to_string(),
    });
    for msg in history {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "system",
        };
        if msg.role == Role::Assistant && msg.text.is_empty() {
            continue;
        }
        messages.push(OaiMessage {
            role: role.to_string(),
            content: msg.text.clone(),
        });
    }
    messages
}

fn build_request(config: &ModelConfig, request: &GenerationRequest) -> ChatRequest {
    let tools = convert_tools(&request.actions);
    ChatRequest {
        model: config.model_id.clone(),
        messages: convert_messages(&request.system_prompt, &request.history),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        parallel_tool_calls: if tools.is_empty() { None } else { Some(false) },
        tools,
    }
}

fn parse_response(body: &str) -> Result<Generation> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| StepwiseError::Generation(format!("malformed response: {}", e)))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| StepwiseError::Generation("response has no choices".into()))?;

    // Truncated or garbled arguments fail the whole generation so nothing
    // half-parsed can reach a transition.
    let actions = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let input = if call.function.arguments.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    warn!(action = %call.function.name, error = %e, "Tool arguments are not valid JSON");
                    StepwiseError::Generation(format!(
                        "malformed tool arguments for '{}': {}",
                        call.function.name, e
                    ))
                })?
            };
            Ok(RequestedAction::new(call.function.name, input))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Generation {
        reply: choice.message.content.unwrap_or_default(),
        actions,
    })
}

impl Generator for OpenAiGenerator {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let body = build_request(&self.config, &request);
            let mut req = self.http.post(self.endpoint()).json(&body);
            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| StepwiseError::Generation(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| StepwiseError::Generation(e.to_string()))?;
            if !status.is_success() {
                return Err(StepwiseError::Generation(format!("HTTP {}: {}", status, text)));
            }

            let generation = parse_response(&text)?;
            debug!(
                model = %self.config.model_id,
                reply_len = generation.reply.len(),
                actions = generation.actions.len(),
                "Generation received"
            );
            Ok(generation)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: "CURRENT STAGE: Warranty verification".into(),
            actions: vec![ActionSpec {
                name: "record_warranty_status".into(),
                description: "Record the warranty status.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"status": {"type": "string", "enum": ["in_warranty", "out_of_warranty"]}},
                    "required": ["status"]
                }),
            }],
            history: vec![
                ChatMessage::user("My screen is cracked"),
                ChatMessage::assistant("Is it under warranty?"),
                ChatMessage::tool("record_warranty_status", "warranty_status recorded as: in_warranty"),
                ChatMessage::user("Yes"),
            ],
        }
    }

    #[test]
    fn request_body_carries_prompt_history_and_tools() {
        let body = serde_json::to_value(build_request(&ModelConfig::default(), &request())).unwrap();
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "CURRENT STAGE: Warranty verification");
        assert_eq!(body["messages"][3]["role"], "system");
        assert_eq!(body["messages"][4]["content"], "Yes");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "record_warranty_status");
        assert_eq!(body["tools"][0]["function"]["parameters"]["required"], json!(["status"]));
        assert_eq!(body["parallel_tool_calls"], false);
    }

    #[test]
    fn no_tools_omits_tool_fields() {
        let mut req = request();
        req.actions.clear();
        let body = serde_json::to_value(build_request(&ModelConfig::default(), &req)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("parallel_tool_calls").is_none());
    }

    #[test]
    fn empty_assistant_turns_are_skipped() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("")];
        let messages = convert_messages("sys", &history);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn parses_reply_and_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Thanks, noted.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "record_warranty_status",
                            "arguments": "{\"status\": \"in_warranty\"}"
                        }
                    }]
                }
            }]
        })
        .to_string();
        let generation = parse_response(&body).unwrap();
        assert_eq!(generation.reply, "Thanks, noted.");
        assert_eq!(
            generation.actions,
            vec![RequestedAction::new("record_warranty_status", json!({"status": "in_warranty"}))]
        );
    }

    #[test]
    fn null_content_is_empty_reply() {
        let body = json!({"choices": [{"message": {"content": null}}]}).to_string();
        let generation = parse_response(&body).unwrap();
        assert_eq!(generation, Generation::default());
    }

    #[test]
    fn malformed_responses_are_generation_errors() {
        assert!(matches!(parse_response("not json"), Err(StepwiseError::Generation(_))));
        assert!(matches!(
            parse_response(r#"{"choices": []}"#),
            Err(StepwiseError::Generation(ref m)) if m.contains("no choices")
        ));
    }

    #[test]
    fn truncated_tool_arguments_fail_the_generation() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "Here is what to do.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "provide_solution",
                            "arguments": "{\"solution\": \"Book a rep"
                        }
                    }]
                }
            }]
        })
        .to_string();
        let err = parse_response(&body).unwrap_err();
        assert!(err.is_retryable());
        assert!(
            matches!(err, StepwiseError::Generation(ref m) if m.contains("malformed tool arguments for 'provide_solution'"))
        );
    }

    #[test]
    fn empty_tool_arguments_are_an_empty_object() {
        let body = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "escalate_to_human", "arguments": ""}
                    }]
                }
            }]
        })
        .to_string();
        let generation = parse_response(&body).unwrap();
        assert_eq!(generation.actions[0].input, json!({}));
    }

    #[test]
    fn base_url_overrides_endpoint() {
        let config = ModelConfig {
            base_url: Some("http://localhost:11434/v1/chat/completions".into()),
            ..ModelConfig::default()
        };
        let generator = OpenAiGenerator::new(config);
        assert_eq!(generator.endpoint(), "http://localhost:11434/v1/chat/completions");
    }
}
