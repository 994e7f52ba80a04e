use crate::adapters::scoring_tool::{CapacityScorer, CommandScorer};
use crate::core::ranking::{PassSequence, RankingPass};
use crate::domain::model::BatteryTask;
use crate::domain::ports::{Scorer, Storage};
use crate::utils::error::{BatteryError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SCORER_TIMEOUT_SECONDS: u64 = 300;

/// ranking.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    pub ranking: RankingSection,
    /// 省略時依 `ranking.task` 產生預設三輪
    #[serde(default)]
    pub passes: Vec<PassConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSection {
    pub input_file: String,
    pub output_dir: String,
    pub descending: Option<bool>,
    /// 預設輪次的容量評分所用的電池類型
    pub task: Option<BatteryTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    pub enabled: Option<bool>,
    /// 省略時為 output_XX.txt，XX 為輪次序號
    pub output: Option<String>,
    pub keep_top: Option<usize>,
    pub scorer: ScorerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScorerConfig {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        timeout_seconds: Option<u64>,
    },
    Capacity {
        task: BatteryTask,
    },
}

impl ScorerConfig {
    pub fn build(&self) -> Arc<dyn Scorer> {
        match self {
            ScorerConfig::Command {
                program,
                args,
                timeout_seconds,
            } => Arc::new(CommandScorer::new(
                program.clone(),
                args.clone(),
                Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_SCORER_TIMEOUT_SECONDS)),
            )),
            ScorerConfig::Capacity { task } => Arc::new(CapacityScorer::new(*task)),
        }
    }
}

/// 預設三輪，逐輪收斂候選數
pub fn default_passes(task: BatteryTask) -> Vec<PassConfig> {
    [("coarse", None), ("refine", Some(50)), ("final", Some(10))]
        .into_iter()
        .map(|(name, keep_top)| PassConfig {
            name: name.to_string(),
            enabled: None,
            output: None,
            keep_top,
            scorer: ScorerConfig::Capacity { task },
        })
        .collect()
}

impl PassConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn output_name(&self, index: usize) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("output_{:02}.txt", index + 1))
    }
}

impl RankingConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::config::from_file(path).map(Self::with_default_passes)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        crate::config::from_toml_str(content).map(Self::with_default_passes)
    }

    fn with_default_passes(mut self) -> Self {
        if self.passes.is_empty() {
            self.passes = default_passes(self.task());
        }
        self
    }

    pub fn task(&self) -> BatteryTask {
        self.ranking.task.unwrap_or(BatteryTask::Lithium)
    }

    pub fn descending(&self) -> bool {
        self.ranking.descending.unwrap_or(true)
    }

    /// 每一輪的輸出路徑相對於 `storage` 的根目錄 (output_dir)
    pub fn build_sequence<S>(&self, storage: S, execution_id: String) -> PassSequence
    where
        S: Storage + Clone + 'static,
    {
        let mut sequence = PassSequence::new(execution_id);
        for (index, pass) in self.passes.iter().enumerate() {
            let ranking_pass = RankingPass::new(
                pass.name.clone(),
                storage.clone(),
                pass.output_name(index),
                pass.scorer.build(),
            )
            .with_enabled(pass.is_enabled())
            .with_keep_top(pass.keep_top)
            .with_descending(self.descending());
            sequence.add_pass(Box::new(ranking_pass));
        }
        sequence
    }
}

impl Validate for RankingConfig {
    fn validate(&self) -> Result<()> {
        validate_path("ranking.input_file", &self.ranking.input_file)?;
        validate_path("ranking.output_dir", &self.ranking.output_dir)?;

        if self.passes.is_empty() {
            return Err(BatteryError::MissingConfigError {
                field: "passes".to_string(),
            });
        }

        let mut names = HashSet::new();
        let mut outputs = HashSet::new();
        for (index, pass) in self.passes.iter().enumerate() {
            validate_non_empty_string("passes.name", &pass.name)?;
            if !names.insert(pass.name.as_str()) {
                return Err(BatteryError::InvalidConfigValueError {
                    field: "passes.name".to_string(),
                    value: pass.name.clone(),
                    reason: "Pass names must be unique".to_string(),
                });
            }

            let output = pass.output_name(index);
            validate_path("passes.output", &output)?;
            if !outputs.insert(output.clone()) {
                return Err(BatteryError::InvalidConfigValueError {
                    field: "passes.output".to_string(),
                    value: output,
                    reason: "Two passes would write the same file".to_string(),
                });
            }

            if let Some(keep_top) = pass.keep_top {
                validate_positive_number("passes.keep_top", keep_top, 1)?;
            }

            if let ScorerConfig::Command {
                program,
                timeout_seconds,
                ..
            } = &pass.scorer
            {
                validate_non_empty_string("passes.scorer.program", program)?;
                if let Some(timeout) = timeout_seconds {
                    validate_positive_number("passes.scorer.timeout_seconds", *timeout as usize, 1)?;
                }
            }
        }

        Ok(())
    }
}
