use crate::adapters::llm::LlmSettings;
use crate::adapters::materials_project::{api_key_from_env, MATERIALS_PROJECT_ENDPOINT};
use crate::config::resolved;
use crate::core::session::SessionSettings;
use crate::domain::model::BatteryTask;
use crate::utils::error::Result;
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number, validate_range,
    validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// chatbattery.toml，所有區段皆可省略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub materials_project: MaterialsProjectConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// 閒置多久 (分鐘) 後移除 session
    pub session_idle_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub candidates_per_round: Option<usize>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialsProjectConfig {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub li_db: Option<String>,
    pub na_db: Option<String>,
    pub tolerance: Option<f64>,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::config::from_file(path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        crate::config::from_toml_str(content)
    }

    /// 設定檔不存在時使用預設值
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            tracing::info!(
                "No config file at {}, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    pub fn host(&self) -> &str {
        self.server.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(8080)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.session_idle_minutes.unwrap_or(60) * 60)
    }

    pub fn model(&self) -> &str {
        self.llm.model.as_deref().unwrap_or("chatgpt_4o")
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_seconds.unwrap_or(120))
    }

    /// 設定檔的值優先，其次環境變數
    pub fn llm_settings(&self) -> LlmSettings {
        self.merge_llm_settings(LlmSettings::from_env())
    }

    pub fn merge_llm_settings(&self, base: LlmSettings) -> LlmSettings {
        LlmSettings {
            api_base: resolved(&self.llm.api_base)
                .map(|b| b.trim_end_matches('/').to_string())
                .unwrap_or(base.api_base),
            api_key: resolved(&self.llm.api_key).or(base.api_key),
            timeout: self.llm_timeout(),
            ..base
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            model: self.model().to_string(),
            temperature: self.llm.temperature.unwrap_or(defaults.temperature),
            max_attempts: self.llm.max_attempts.unwrap_or(defaults.max_attempts),
            retry_delay: self
                .llm
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            icsd_tolerance: self.retrieval.tolerance.unwrap_or(defaults.icsd_tolerance),
            candidates_per_round: self
                .llm
                .candidates_per_round
                .unwrap_or(defaults.candidates_per_round),
        }
    }

    pub fn materials_project_enabled(&self) -> bool {
        self.materials_project.enabled.unwrap_or(true)
    }

    pub fn materials_project_endpoint(&self) -> &str {
        self.materials_project
            .endpoint
            .as_deref()
            .unwrap_or(MATERIALS_PROJECT_ENDPOINT)
    }

    pub fn materials_project_api_key(&self) -> Option<String> {
        resolved(&self.materials_project.api_key).or_else(api_key_from_env)
    }

    pub fn materials_project_timeout(&self) -> Duration {
        Duration::from_secs(self.materials_project.timeout_seconds.unwrap_or(30))
    }

    pub fn retrieval_db_path(&self, task: BatteryTask) -> &str {
        let configured = match task {
            BatteryTask::Lithium => self.retrieval.li_db.as_deref(),
            BatteryTask::Sodium => self.retrieval.na_db.as_deref(),
        };
        configured.unwrap_or(task.default_db_path())
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        validate_non_empty_string("server.host", self.host())?;
        validate_positive_number("server.port", self.port() as usize, 1)?;
        if let Some(minutes) = self.server.session_idle_minutes {
            validate_positive_number("server.session_idle_minutes", minutes as usize, 1)?;
        }

        validate_non_empty_string("llm.model", self.model())?;
        let session = self.session_settings();
        validate_range("llm.temperature", session.temperature, 0.0, 2.0)?;
        validate_positive_number("llm.max_attempts", session.max_attempts as usize, 1)?;
        validate_positive_number("llm.candidates_per_round", session.candidates_per_round, 1)?;
        validate_positive_number("llm.timeout_seconds", self.llm_timeout().as_secs() as usize, 1)?;
        if let Some(api_base) = resolved(&self.llm.api_base) {
            validate_url("llm.api_base", &api_base)?;
        }

        if self.materials_project_enabled() {
            validate_url("materials_project.endpoint", self.materials_project_endpoint())?;
        }

        validate_path("retrieval.li_db", self.retrieval_db_path(BatteryTask::Lithium))?;
        validate_path("retrieval.na_db", self.retrieval_db_path(BatteryTask::Sodium))?;
        validate_range("retrieval.tolerance", session.icsd_tolerance, 0.0, 1.0)?;

        Ok(())
    }
}
