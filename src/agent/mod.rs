//! Structured-output gateway to the Anthropic Messages API.
//!
//! A listener's `call_agent` becomes exactly one API call: the caller's JSON
//! schema is attached as the input schema of a single tool, the tool choice
//! is forced, and the tool_use block that comes back is validated against the
//! schema's required list. No retries; the reqwest timeout bounds wall time.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, WardenError};

const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_TOKENS: u32 = 1024;
const RESULT_TOOL_NAME: &str = "record_result";

/// Model selector exposed to listener rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentModel {
    #[default]
    Haiku,
    Sonnet,
    Opus,
}

impl AgentModel {
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::Haiku => "claude-haiku-4-5",
            Self::Sonnet => "claude-sonnet-5",
            Self::Opus => "claude-opus-5",
        }
    }
}

/// One structured classification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    /// JSON-Schema object type with named properties and a required list.
    pub schema: Value,
    #[serde(default)]
    pub model: AgentModel,
}

/// The call seam the dispatcher context depends on; tests substitute a
/// recording fake.
#[async_trait]
pub trait AgentCall: Send + Sync {
    async fn call(&self, request: &AgentRequest) -> Result<Value>;
}

pub struct AgentGateway {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl AgentGateway {
    pub fn new(api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url: API_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Build the Messages API request body: one user turn, one forced tool whose
/// input schema is the caller's schema.
fn build_request_body(request: &AgentRequest) -> Value {
    json!({
        "model": request.model.model_id(),
        "max_tokens": MAX_TOKENS,
        "tools": [{
            "name": RESULT_TOOL_NAME,
            "description": "Record the structured result for the request.",
            "input_schema": request.schema,
        }],
        "tool_choice": { "type": "tool", "name": RESULT_TOOL_NAME },
        "messages": [{ "role": "user", "content": request.prompt }],
    })
}

/// Pull the forced tool's input out of the response content, if present.
fn extract_structured_output(body: &Value) -> Option<Value> {
    body.get("content")?
        .as_array()?
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .and_then(|block| block.get("input"))
        .cloned()
}

/// Check the payload against the schema's `required` list and reject
/// non-object payloads. Full schema validation is the model's job via the
/// forced tool; this guards the contract the listener relies on.
fn validate_against_schema(payload: &Value, schema: &Value) -> Result<()> {
    if !payload.is_object() {
        return Err(WardenError::Validation(
            "structured response is not an object".to_string(),
        ));
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if payload.get(key).is_none() {
                return Err(WardenError::Validation(format!(
                    "structured response is missing required field '{}'",
                    key
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl AgentCall for AgentGateway {
    async fn call(&self, request: &AgentRequest) -> Result<Value> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            WardenError::Config("ANTHROPIC_API_KEY is not configured".to_string())
        })?;

        debug!(model = request.model.model_id(), "agent call");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&build_request_body(request))
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown API error");
            return Err(WardenError::Remote(format!(
                "agent call failed ({}): {}",
                status, message
            )));
        }

        let payload = extract_structured_output(&body).ok_or_else(|| {
            WardenError::Validation("no structured response block in agent reply".to_string())
        })?;
        validate_against_schema(&payload, &request.schema)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urgency_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "isUrgent": { "type": "boolean" },
                "reason": { "type": "string" }
            },
            "required": ["isUrgent", "reason"]
        })
    }

    #[test]
    fn request_body_forces_the_result_tool() {
        let request = AgentRequest {
            prompt: "Is this urgent?".to_string(),
            schema: urgency_schema(),
            model: AgentModel::Haiku,
        };
        let body = build_request_body(&request);

        assert_eq!(body["model"], "claude-haiku-4-5");
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], RESULT_TOOL_NAME);
        assert_eq!(body["tools"][0]["input_schema"], urgency_schema());
        assert_eq!(body["messages"][0]["content"], "Is this urgent?");
    }

    #[test]
    fn model_selector_maps_to_ids() {
        assert_eq!(AgentModel::Haiku.model_id(), "claude-haiku-4-5");
        assert_eq!(AgentModel::Sonnet.model_id(), "claude-sonnet-5");
        assert_eq!(AgentModel::Opus.model_id(), "claude-opus-5");
        assert_eq!(AgentModel::default(), AgentModel::Haiku);
    }

    #[test]
    fn extracts_tool_use_block() {
        let body = json!({
            "content": [
                { "type": "text", "text": "thinking out loud" },
                { "type": "tool_use", "name": RESULT_TOOL_NAME,
                  "input": { "isUrgent": true, "reason": "outage" } }
            ]
        });
        let payload = extract_structured_output(&body).unwrap();
        assert_eq!(payload["isUrgent"], true);
        assert_eq!(payload["reason"], "outage");
    }

    #[test]
    fn missing_structured_block_is_none() {
        let body = json!({ "content": [{ "type": "text", "text": "no tool call" }] });
        assert!(extract_structured_output(&body).is_none());
    }

    #[test]
    fn validation_enforces_required_fields() {
        let schema = urgency_schema();
        let complete = json!({ "isUrgent": false, "reason": "newsletter" });
        assert!(validate_against_schema(&complete, &schema).is_ok());

        let partial = json!({ "isUrgent": true });
        let err = validate_against_schema(&partial, &schema).unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));

        let not_object = json!("yes");
        assert!(validate_against_schema(&not_object, &schema).is_err());
    }

    #[tokio::test]
    async fn missing_api_key_fails_at_call_time() {
        let gateway = AgentGateway::new(None).with_base_url("http://127.0.0.1:0");
        let err = gateway
            .call(&AgentRequest {
                prompt: "hello".to_string(),
                schema: urgency_schema(),
                model: AgentModel::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
