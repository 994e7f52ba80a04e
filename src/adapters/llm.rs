use crate::domain::model::ChatRequest;
use crate::domain::ports::LanguageModel;
use crate::utils::error::{BatteryError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_OPENROUTER_MODEL_PREFIX: &str = "openai/";

/// 舊版別名，只有 chatgpt_3.5 會帶 frequency_penalty
const FREQUENCY_PENALTY_MODEL: &str = "chatgpt_3.5";

pub fn resolve_model_alias(model: &str) -> &str {
    match model {
        "chatgpt_3.5" => "gpt-3.5-turbo",
        "chatgpt_o1" => "o1-mini",
        "chatgpt_o3" => "o3-mini",
        "chatgpt_4o" => "gpt-4o-mini",
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub openrouter_model_prefix: String,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_base: OPENAI_API_BASE.to_string(),
            api_key: None,
            openrouter_model_prefix: DEFAULT_OPENROUTER_MODEL_PREFIX.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl LlmSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 依環境變數決定後端：明確指定的 base URL 優先，
    /// 只有 OPENROUTER_API_KEY 時預設使用 OpenRouter
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let openrouter_key = get("OPENROUTER_API_KEY");
        let api_base = [
            "OPENAI_API_BASE",
            "OPENAI_BASE_URL",
            "OPENROUTER_API_BASE",
            "OPENROUTER_BASE_URL",
        ]
        .iter()
        .find_map(|key| get(*key))
        .map(|base| base.trim_end_matches('/').to_string())
        .unwrap_or_else(|| {
            if openrouter_key.is_some() {
                OPENROUTER_API_BASE.to_string()
            } else {
                OPENAI_API_BASE.to_string()
            }
        });

        let mut prefix = get("CHATBATTERY_OPENROUTER_MODEL_PREFIX")
            .map(|p| p.trim().to_string())
            .unwrap_or_else(|| DEFAULT_OPENROUTER_MODEL_PREFIX.to_string());
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        Self {
            api_base,
            api_key: get("OPENAI_API_KEY").or(openrouter_key),
            openrouter_model_prefix: prefix,
            ..Self::default()
        }
    }

    pub fn is_openrouter(&self) -> bool {
        self.api_base.contains("openrouter.ai")
    }

    /// OpenRouter 需要 `provider/model` 形式的模型 ID
    pub fn resolve_model(&self, model: &str) -> String {
        let resolved = resolve_model_alias(model);
        if self.is_openrouter() && !resolved.contains('/') {
            format!("{}{}", self.openrouter_model_prefix, resolved)
        } else {
            resolved.to_string()
        }
    }
}

/// OpenAI Chat Completions 相容的 HTTP 用戶端
pub struct OpenAiCompatibleClient {
    client: Client,
    settings: LlmSettings,
}

impl OpenAiCompatibleClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let model = self.settings.resolve_model(&request.model);
        let url = format!("{}/chat/completions", self.settings.api_base);

        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        if request.model == FREQUENCY_PENALTY_MODEL {
            body["frequency_penalty"] = serde_json::json!(0.2);
        }

        tracing::debug!(
            "Sending {} messages to {} (model: {})",
            request.messages.len(),
            url,
            model
        );

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.settings.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message = match status.as_u16() {
                401 => format!("authentication failed: {}", message),
                429 => format!("rate limit exceeded: {}", message),
                _ => message,
            };
            return Err(BatteryError::LlmError {
                status: status.as_u16(),
                message,
            });
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = response_json
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| BatteryError::LlmError {
                status: status.as_u16(),
                message: "No content in response".to_string(),
            })?;

        tracing::debug!("LLM reply: {}", content.replace('\n', "\t"));
        Ok(content.to_string())
    }
}
