pub mod app_config;
pub mod ranking_config;

pub use app_config::AppConfig;
pub use ranking_config::{PassConfig, RankingConfig, ScorerConfig};

use crate::utils::error::{BatteryError, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;

/// 替換環境變數 (例如 ${OPENAI_API_KEY})，未設定的變數保留原樣
pub fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    })
    .into_owned()
}

/// 未被替換的 `${VAR}` 視為未設定
pub(crate) fn resolved(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && !(v.starts_with("${") && v.ends_with('}')))
        .map(str::to_string)
}

pub(crate) fn from_toml_str<T: DeserializeOwned>(content: &str) -> Result<T> {
    let processed_content = substitute_env_vars(content);

    toml::from_str(&processed_content).map_err(|e| BatteryError::ConfigError {
        message: format!("TOML parsing error: {}", e),
    })
}

pub(crate) fn from_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let content = std::fs::read_to_string(&path)?;
    from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("CHATBATTERY_TEST_SUBSTITUTION", "https://llm.example.com/v1");

        let content = "api_base = \"${CHATBATTERY_TEST_SUBSTITUTION}\"\nkey = \"${CHATBATTERY_TEST_UNSET_VAR}\"";
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("api_base = \"https://llm.example.com/v1\""));
        assert!(substituted.contains("${CHATBATTERY_TEST_UNSET_VAR}"));

        std::env::remove_var("CHATBATTERY_TEST_SUBSTITUTION");
    }

    #[test]
    fn test_resolved_ignores_placeholders() {
        assert_eq!(resolved(&Some("${OPENAI_API_KEY}".to_string())), None);
        assert_eq!(resolved(&Some("  ".to_string())), None);
        assert_eq!(resolved(&None), None);
        assert_eq!(resolved(&Some(" sk-1 ".to_string())), Some("sk-1".to_string()));
    }
}
