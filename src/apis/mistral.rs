//! Mistral chat completion API.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::Api;
use crate::config::ClientConfig;
use crate::endpoint::{Call, EndpointSpec, HandlerInput};
use crate::error::{ApiError, Result};
use crate::runtime::Runtime;
use crate::settings::Settings;

pub const NAME: &str = "mistral";
pub const BASE_URL: &str = "https://api.mistral.ai";
pub const API_KEY_ENV: &str = "MISTRAL_API_KEY";
pub const API_KEY_SETTING: &str = "mistral_key";
pub const DEFAULT_MODEL: &str = "codestral-latest";

// Chat mentions that must not be echoed back to a channel.
static MENTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<@&?\d+>|@everyone|@here").expect("mention pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// `POST /v1/chat/completions`, yielding the first choice's content.
pub fn chat_completion() -> EndpointSpec<String> {
    EndpointSpec::post("chat_completion", "/v1/chat/completions", handle_chat)
}

fn handle_chat(input: HandlerInput<'_>) -> Result<String> {
    let data = input.json();
    match input.status {
        StatusCode::OK => {
            let content = data["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| ApiError::domain(200, "response has no message content"))?;
            Ok(sanitize_mentions(content))
        }
        StatusCode::UNPROCESSABLE_ENTITY => {
            let message = data["detail"]
                .as_array()
                .and_then(|details| details.last())
                .and_then(|detail| detail["msg"].as_str())
                .unwrap_or("validation error");
            Err(ApiError::domain(422, message))
        }
        status => {
            let message = data["message"].as_str().unwrap_or("Unknown error");
            Err(ApiError::domain(status.as_u16(), message))
        }
    }
}

pub fn sanitize_mentions(content: &str) -> String {
    MENTIONS.replace_all(content, "X").into_owned()
}

pub fn config(api_key: &str) -> ClientConfig {
    ClientConfig::new(NAME, BASE_URL).with_header("Authorization", format!("Bearer {}", api_key))
}

/// Builds the client, taking the key from `api_key`, else the environment, else settings.
pub fn setup<R: Runtime>(settings: &Settings<R>, api_key: Option<&str>) -> Result<Api> {
    let key = match api_key {
        Some(key) => key.to_string(),
        None => settings.secret(API_KEY_ENV, API_KEY_SETTING)?,
    };
    Ok(Api::new(config(&key)))
}

/// Sends `messages` to `model` and returns the sanitized answer.
pub async fn complete(api: &Api, model: &str, messages: &[ChatMessage]) -> Result<String> {
    let call = Call::new().kwarg(
        "json",
        json!({
            "model": model,
            "messages": messages,
            "stream": false,
        }),
    );
    api.call(&chat_completion(), &call).await
}
