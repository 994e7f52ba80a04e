use crate::core::dedup::read_lines;
use crate::domain::model::Candidate;
use crate::domain::ports::{Scorer, Storage};
use crate::utils::error::{BatteryError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 單一排名輪次的結果
#[derive(Debug, Clone)]
pub struct PassResult {
    pub pass_name: String,
    pub candidates: Vec<Candidate>,
    pub output_path: String,
    pub duration: Duration,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// 排名輪次間傳遞的上下文
#[derive(Debug, Clone)]
pub struct PassContext {
    pub initial: Vec<Candidate>,
    pub previous_results: Vec<PassResult>,
    pub execution_id: String,
}

impl PassContext {
    pub fn new(execution_id: String, initial: Vec<Candidate>) -> Self {
        Self {
            initial,
            previous_results: Vec::new(),
            execution_id,
        }
    }

    pub fn get_previous_result(&self) -> Option<&PassResult> {
        self.previous_results.last()
    }

    /// 上一輪留下的候選；第一輪為初始候選
    pub fn current_candidates(&self) -> Vec<Candidate> {
        match self.get_previous_result() {
            Some(result) => result.candidates.clone(),
            None => self.initial.clone(),
        }
    }

    pub fn add_result(&mut self, result: PassResult) {
        self.previous_results.push(result);
    }
}

/// 評分排序後的候選
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedBatch {
    pub candidates: Vec<Candidate>,
    pub dropped: usize,
}

#[async_trait::async_trait]
pub trait ContextualPass: Send + Sync {
    async fn extract_with_context(&self, context: &PassContext) -> Result<Vec<Candidate>>;
    async fn transform_with_context(
        &self,
        data: Vec<Candidate>,
        context: &PassContext,
    ) -> Result<RankedBatch>;
    async fn load_with_context(&self, batch: &RankedBatch, context: &PassContext) -> Result<String>;

    fn get_name(&self) -> &str;

    fn should_execute(&self, _context: &PassContext) -> bool {
        true
    }
}

/// 依輸入順序套用評分結果，評分器沒回傳的候選即無分數
pub fn apply_scores(input: &[Candidate], scored: Vec<Candidate>) -> Vec<Candidate> {
    let scores: HashMap<String, f64> = scored
        .into_iter()
        .filter_map(|c| c.score.map(|score| (c.formula, score)))
        .collect();
    input
        .iter()
        .map(|c| Candidate {
            formula: c.formula.clone(),
            score: scores.get(&c.formula).copied(),
        })
        .collect()
}

/// 去掉無分數 (或非有限值) 的候選後穩定排序，同分維持原順序
pub fn rank_candidates(candidates: Vec<Candidate>, descending: bool, keep_top: Option<usize>) -> RankedBatch {
    let total = candidates.len();
    let mut ranked: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.score.is_some_and(f64::is_finite))
        .collect();
    let dropped = total - ranked.len();

    ranked.sort_by(|a, b| {
        let (a, b) = (a.score.unwrap_or_default(), b.score.unwrap_or_default());
        if descending {
            b.total_cmp(&a)
        } else {
            a.total_cmp(&b)
        }
    });
    if let Some(keep_top) = keep_top {
        ranked.truncate(keep_top);
    }

    RankedBatch {
        candidates: ranked,
        dropped,
    }
}

/// 每行取第一欄為化學式，可直接讀取先前輸出的 `formula<TAB>score` 檔
pub fn parse_candidate_list(text: &str) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    read_lines(text)
        .into_iter()
        .filter_map(|line| line.text.split_whitespace().next().map(str::to_string))
        .filter(|formula| seen.insert(formula.clone()))
        .map(Candidate::new)
        .collect()
}

pub fn render_ranked(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| format!("{}\t{}\n", c.formula, c.score.unwrap_or_default()))
        .collect()
}

/// 第六階段的一輪：評分、排序、截取、寫檔
pub struct RankingPass<S: Storage> {
    name: String,
    enabled: bool,
    storage: S,
    output: String,
    scorer: Arc<dyn Scorer>,
    keep_top: Option<usize>,
    descending: bool,
}

impl<S: Storage> RankingPass<S> {
    pub fn new(name: impl Into<String>, storage: S, output: impl Into<String>, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            storage,
            output: output.into(),
            scorer,
            keep_top: None,
            descending: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_keep_top(mut self, keep_top: Option<usize>) -> Self {
        self.keep_top = keep_top;
        self
    }

    pub fn with_descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }
}

#[async_trait::async_trait]
impl<S: Storage + 'static> ContextualPass for RankingPass<S> {
    async fn extract_with_context(&self, context: &PassContext) -> Result<Vec<Candidate>> {
        Ok(context.current_candidates())
    }

    async fn transform_with_context(
        &self,
        data: Vec<Candidate>,
        _context: &PassContext,
    ) -> Result<RankedBatch> {
        if data.is_empty() {
            return Ok(RankedBatch::default());
        }
        tracing::debug!("Scoring with {}", self.scorer.describe());
        let scored = self.scorer.score(&data).await?;
        let batch = rank_candidates(apply_scores(&data, scored), self.descending, self.keep_top);
        if batch.dropped > 0 {
            tracing::warn!("⚠️ {}: {} candidates had no score", self.name, batch.dropped);
        }
        Ok(batch)
    }

    async fn load_with_context(&self, batch: &RankedBatch, _context: &PassContext) -> Result<String> {
        self.storage
            .write_file(&self.output, render_ranked(&batch.candidates).as_bytes())
            .await?;
        Ok(self.storage.location(&self.output))
    }

    fn get_name(&self) -> &str {
        &self.name
    }

    fn should_execute(&self, _context: &PassContext) -> bool {
        self.enabled
    }
}

/// 依序執行排名輪次，每輪以上一輪的結果為輸入
pub struct PassSequence {
    passes: Vec<Box<dyn ContextualPass>>,
    execution_id: String,
}

impl PassSequence {
    pub fn new(execution_id: String) -> Self {
        Self {
            passes: Vec::new(),
            execution_id,
        }
    }

    pub fn add_pass(&mut self, pass: Box<dyn ContextualPass>) {
        self.passes.push(pass);
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.get_name()).collect()
    }

    pub async fn execute_all(&self, initial: Vec<Candidate>) -> Result<Vec<PassResult>> {
        let mut results = Vec::new();
        let mut context = PassContext::new(self.execution_id.clone(), initial);
        tracing::info!(
            "🚀 Ranking run {}: {} passes, {} candidates",
            context.execution_id,
            self.passes.len(),
            context.initial.len()
        );

        for pass in &self.passes {
            let start_time = Instant::now();

            if !pass.should_execute(&context) {
                tracing::info!(
                    "⏭️ [{}] Skipping pass: {} (disabled)",
                    context.execution_id,
                    pass.get_name()
                );
                continue;
            }

            match Self::execute_pass(pass.as_ref(), &context).await {
                Ok((batch, output_path)) => {
                    let mut metadata = HashMap::new();
                    metadata.insert("dropped".to_string(), serde_json::Value::from(batch.dropped));
                    let result = PassResult {
                        pass_name: pass.get_name().to_string(),
                        candidates: batch.candidates,
                        output_path,
                        duration: start_time.elapsed(),
                        metadata,
                    };

                    tracing::info!(
                        "✅ [{}] Pass executed: {} (candidates: {}, duration: {:?})",
                        context.execution_id,
                        result.pass_name,
                        result.candidates.len(),
                        result.duration
                    );

                    context.add_result(result.clone());
                    results.push(result);
                }
                Err(e) => {
                    tracing::error!("❌ [{}] Pass execution failed: {}", context.execution_id, e);
                    return Err(BatteryError::RankingError {
                        pass: pass.get_name().to_string(),
                        details: e.to_string(),
                    });
                }
            }
        }

        Ok(results)
    }

    async fn execute_pass(pass: &dyn ContextualPass, context: &PassContext) -> Result<(RankedBatch, String)> {
        let candidates = pass.extract_with_context(context).await?;
        tracing::debug!("📥 {} candidates in", candidates.len());

        let batch = pass.transform_with_context(candidates, context).await?;
        tracing::debug!("🔄 {} candidates ranked", batch.candidates.len());

        let output_path = pass.load_with_context(&batch, context).await?;
        tracing::debug!("💾 Ranking written to: {}", output_path);

        Ok((batch, output_path))
    }

    pub fn execution_summary(&self, results: &[PassResult]) -> HashMap<String, serde_json::Value> {
        let mut summary = HashMap::new();

        summary.insert(
            "execution_id".to_string(),
            serde_json::Value::String(self.execution_id.clone()),
        );

        let total_candidates: usize = results.iter().map(|r| r.candidates.len()).sum();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();

        summary.insert("total_passes".to_string(), serde_json::Value::from(results.len()));
        summary.insert("total_candidates".to_string(), serde_json::Value::from(total_candidates));
        summary.insert(
            "total_duration_ms".to_string(),
            serde_json::Value::from(total_duration.as_millis() as u64),
        );
        summary.insert(
            "executed_passes".to_string(),
            serde_json::Value::Array(
                results
                    .iter()
                    .map(|r| serde_json::Value::String(r.pass_name.clone()))
                    .collect(),
            ),
        );
        if let Some(last) = results.last() {
            summary.insert("final_output".to_string(), serde_json::Value::String(last.output_path.clone()));
        }

        summary
    }
}
