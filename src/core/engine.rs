use crate::domain::ports::{Pipeline, StageReport};
use crate::utils::error::Result;
use std::time::{Duration, Instant};

/// 單一批次階段的執行結果
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub output_path: String,
    pub extracted: usize,
    pub kept: usize,
    pub rejected: usize,
    pub duration: Duration,
}

pub struct StageEngine<P: Pipeline> {
    name: String,
    pipeline: P,
}

impl<P: Pipeline> StageEngine<P> {
    pub fn new(name: impl Into<String>, pipeline: P) -> Self {
        Self {
            name: name.into(),
            pipeline,
        }
    }

    pub async fn run(&self) -> Result<StageOutcome> {
        let started = Instant::now();
        tracing::info!("🚀 Starting stage: {}", self.name);

        // Extract
        let raw = self.pipeline.extract().await?;
        let extracted = raw.len();
        tracing::info!("📥 Extracted {} entries", extracted);

        // Transform
        let report = self.pipeline.transform(raw).await?;
        let kept = report.kept();
        let rejected = report.rejected();
        tracing::info!("🔄 Kept {} entries, rejected {}", kept, rejected);

        // Load
        let output_path = self.pipeline.load(report).await?;
        tracing::info!("💾 Output saved to: {}", output_path);

        Ok(StageOutcome {
            output_path,
            extracted,
            kept,
            rejected,
            duration: started.elapsed(),
        })
    }
}
