use crate::domain::ports::MaterialsDatabase;
use crate::utils::error::{BatteryError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const MATERIALS_PROJECT_ENDPOINT: &str = "https://api.materialsproject.org";

/// MP_API_KEY 優先，其次 MATERIALS_PROJECT_API_KEY
pub fn api_key_from_env() -> Option<String> {
    ["MP_API_KEY", "MATERIALS_PROJECT_API_KEY"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.trim().is_empty()))
}

/// Materials Project summary API 的精確化學式查詢
pub struct MaterialsProjectClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl MaterialsProjectClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl MaterialsDatabase for MaterialsProjectClient {
    async fn lookup(&self, formula: &str) -> Result<Option<String>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| BatteryError::MissingConfigError {
                field: "MP_API_KEY".to_string(),
            })?;

        let url = format!("{}/materials/summary/", self.endpoint);
        tracing::debug!("Looking up {} in Materials Project", formula);

        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", api_key)
            .query(&[("formula", formula), ("_fields", "material_id")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BatteryError::MaterialsDbError {
                message: format!("{} for formula {}", response.status(), formula),
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let data = payload
            .get("data")
            .and_then(|data| data.as_array())
            .ok_or_else(|| BatteryError::MaterialsDbError {
                message: "response has no 'data' array".to_string(),
            })?;

        Ok(data.first().map(|doc| {
            doc.get("material_id")
                .and_then(|id| id.as_str())
                .unwrap_or(formula)
                .to_string()
        }))
    }
}
