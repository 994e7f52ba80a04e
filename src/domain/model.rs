use crate::utils::error::{BatteryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 電池體系：決定載流子元素與預設檢索資料庫
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryTask {
    Lithium,
    Sodium,
}

impl BatteryTask {
    pub fn from_task_id(task_id: u32) -> Result<Self> {
        match task_id {
            101 => Ok(BatteryTask::Lithium),
            102 => Ok(BatteryTask::Sodium),
            other => Err(BatteryError::ValidationError {
                message: format!(
                    "Unsupported task id {}. Expected 101 (Li) or 102 (Na)",
                    other
                ),
            }),
        }
    }

    pub fn task_id(&self) -> u32 {
        match self {
            BatteryTask::Lithium => 101,
            BatteryTask::Sodium => 102,
        }
    }

    pub fn carrier_element(&self) -> &'static str {
        match self {
            BatteryTask::Lithium => "Li",
            BatteryTask::Sodium => "Na",
        }
    }

    pub fn default_db_path(&self) -> &'static str {
        match self {
            BatteryTask::Lithium => "data/Li_battery/preprocessed.csv",
            BatteryTask::Sodium => "data/Na_battery/preprocessed.csv",
        }
    }
}

impl fmt::Display for BatteryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryTask::Lithium => f.write_str("Li-ion"),
            BatteryTask::Sodium => f.write_str("Na-ion"),
        }
    }
}

impl FromStr for BatteryTask {
    type Err = BatteryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "101" | "li" | "li-ion" | "lithium" => Ok(BatteryTask::Lithium),
            "102" | "na" | "na-ion" | "sodium" => Ok(BatteryTask::Sodium),
            other => Err(BatteryError::ValidationError {
                message: format!("Unknown battery task '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一次 LLM 呼叫的參數
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
}

/// 排名階段的候選材料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub formula: String,
    pub score: Option<f64>,
}

impl Candidate {
    pub fn new(formula: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            score: None,
        }
    }

    pub fn scored(formula: impl Into<String>, score: f64) -> Self {
        Self {
            formula: formula.into(),
            score: Some(score),
        }
    }
}

/// 新穎性檢查結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Novelty {
    Novel,
    Known { matched: String },
    Unavailable { reason: String },
}

impl Novelty {
    pub fn is_known(&self) -> bool {
        matches!(self, Novelty::Known { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAssessment {
    pub formula: String,
    /// 無法解析的化學式為 None
    pub capacity: Option<f64>,
    pub input_capacity: f64,
    pub improved: bool,
    pub icsd: Novelty,
    pub materials_project: Novelty,
}

impl CandidateAssessment {
    pub fn accepted(&self) -> bool {
        self.improved && !self.icsd.is_known() && !self.materials_project.is_known()
    }

    /// 給 LLM 的拒絕原因，接受時為 None
    pub fn rejection_reason(&self) -> Option<String> {
        if self.capacity.is_none() {
            return Some("the formula is not a valid chemical formula".to_string());
        }
        if !self.improved {
            return Some(format!(
                "its theoretical capacity ({:.2} mAh/g) is not higher than the input ({:.2} mAh/g)",
                self.capacity.unwrap_or_default(),
                self.input_capacity
            ));
        }
        if let Novelty::Known { matched } = &self.icsd {
            return Some(format!("it matches the known material {} in ICSD", matched));
        }
        if let Novelty::Known { matched } = &self.materials_project {
            return Some(format!("it already exists in Materials Project ({})", matched));
        }
        None
    }
}
