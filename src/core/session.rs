use crate::core::capacity::{decide_against, theoretical_capacity};
use crate::core::extraction::CandidateExtractor;
use crate::core::search::{icsd_novelty, mp_search, RetrievalDb};
use crate::domain::formula::Formula;
use crate::domain::model::{
    BatteryTask, CandidateAssessment, ChatMessage, ChatRequest, ChatRole, Novelty,
};
use crate::domain::ports::{LanguageModel, MaterialsDatabase};
use crate::utils::error::{BatteryError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub model: String,
    pub temperature: f64,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub icsd_tolerance: f64,
    pub candidates_per_round: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "chatgpt_4o".to_string(),
            temperature: 0.0,
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
            icsd_tolerance: 0.01,
            candidates_per_round: 3,
        }
    }
}

/// 所有 session 共用的外部服務
pub struct SessionServices {
    pub llm: Arc<dyn LanguageModel>,
    /// None 表示停用 Materials Project 查詢
    pub materials: Option<Arc<dyn MaterialsDatabase>>,
    pub lithium_db: Arc<RetrievalDb>,
    pub sodium_db: Arc<RetrievalDb>,
}

impl SessionServices {
    pub fn retrieval_db(&self, task: BatteryTask) -> &RetrievalDb {
        match task {
            BatteryTask::Lithium => &self.lithium_db,
            BatteryTask::Sodium => &self.sodium_db,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankOutcome {
    pub raw_text: String,
    pub ordered: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub task: BatteryTask,
    pub input_formula: String,
    pub input_capacity: f64,
    pub model: String,
    pub round: u32,
    pub history: Vec<String>,
    pub last_proposals: Vec<String>,
    pub last_assessments: Vec<CandidateAssessment>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// 一次互動式材料探索：提案、評估、回饋、排名
pub struct ExplorationSession {
    id: Uuid,
    task: BatteryTask,
    input: Formula,
    input_capacity: f64,
    settings: SessionSettings,
    services: Arc<SessionServices>,
    extractor: CandidateExtractor,
    messages: Vec<ChatMessage>,
    history: Vec<String>,
    last_proposals: Vec<String>,
    last_assessments: Vec<CandidateAssessment>,
    round: u32,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl ExplorationSession {
    pub fn start(
        task: BatteryTask,
        input_formula: &str,
        settings: SessionSettings,
        services: Arc<SessionServices>,
    ) -> Result<Self> {
        let input = Formula::parse(input_formula)?;
        if !input.composition().contains(task.carrier_element()) {
            return Err(BatteryError::ValidationError {
                message: format!(
                    "Input formula {} contains no {} for a {} battery",
                    input,
                    task.carrier_element(),
                    task
                ),
            });
        }
        let input_capacity = theoretical_capacity(input.composition(), task);

        let messages = vec![
            ChatMessage::system(format!(
                "You are an expert in {} battery cathode materials.",
                task
            )),
            ChatMessage::user(format!(
                "The input {} battery cathode material is {} with a theoretical capacity of {:.2} mAh/g. \
                 Propose {} new materials with a higher theoretical capacity by substituting or doping elements. \
                 Write each chemical formula on its own line starting with '*'.",
                task,
                input,
                input_capacity,
                settings.candidates_per_round
            )),
        ];

        let session = Self {
            id: Uuid::new_v4(),
            task,
            input,
            input_capacity,
            settings,
            services,
            extractor: CandidateExtractor::new(),
            messages,
            history: Vec::new(),
            last_proposals: Vec::new(),
            last_assessments: Vec::new(),
            round: 0,
            created_at: Utc::now(),
            last_active: Utc::now(),
        };
        tracing::info!(
            "🔋 Session {} started: {} {} ({:.2} mAh/g)",
            session.id,
            task,
            session.input,
            input_capacity
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> BatteryTask {
        self.task
    }

    pub fn input_capacity(&self) -> f64 {
        self.input_capacity
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// 以 LLM 產生新候選；回覆只含已討論過的材料時，在最後一則使用者訊息後
    /// 附上排除清單再重試，最多 `max_attempts` 次
    pub async fn propose(&mut self) -> Result<Vec<String>> {
        if matches!(self.messages.last(), Some(m) if m.role == ChatRole::Assistant) {
            self.messages.push(ChatMessage::user(format!(
                "Please propose {} more {} battery materials with a higher theoretical capacity than {}.",
                self.settings.candidates_per_round, self.task, self.input
            )));
        }

        let attempts = self.settings.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 && !self.settings.retry_delay.is_zero() {
                tokio::time::sleep(self.settings.retry_delay).await;
            }

            let raw_text = match self.services.llm.chat(&self.request(&self.messages)).await {
                Ok(text) => text,
                Err(e @ BatteryError::LlmError { status: 401, .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("⚠️ LLM call failed (attempt {}/{}): {}", attempt, attempts, e);
                    last_error = Some(e);
                    continue;
                }
            };

            let proposals = self.extractor.parse_candidates(&raw_text, &self.history);
            tracing::debug!(
                "Round {} attempt {}: {} -> {:?}",
                self.round + 1,
                attempt,
                raw_text.replace('\n', "\t"),
                proposals
            );

            if proposals.is_empty() {
                let repeated = self.extractor.parse_candidates(&raw_text, &[]);
                tracing::warn!(
                    "⚠️ No new candidates (attempt {}/{}), repeated: {:?}",
                    attempt,
                    attempts,
                    repeated
                );
                if let Some(last) = self.messages.last_mut() {
                    last.content.push_str(&format!(
                        " Please do not generate batteries in this list [{}].",
                        repeated.join(", ")
                    ));
                }
                last_error = None;
                continue;
            }

            self.messages.push(ChatMessage::assistant(raw_text));
            self.history.extend(proposals.iter().cloned());
            self.last_proposals = proposals.clone();
            self.round += 1;
            tracing::info!(
                "💡 Session {} round {}: {} candidates",
                self.id,
                self.round,
                proposals.len()
            );
            return Ok(proposals);
        }

        Err(last_error.unwrap_or(BatteryError::NoNewCandidates { attempts }))
    }

    /// 未指定候選時評估上一輪提案
    pub async fn evaluate(&mut self, candidates: Option<Vec<String>>) -> Result<Vec<CandidateAssessment>> {
        let candidates: Vec<String> = match candidates {
            Some(list) => list
                .iter()
                .map(|c| self.extractor.clean(c))
                .filter(|c| !c.is_empty())
                .collect(),
            None => self.last_proposals.clone(),
        };
        if candidates.is_empty() {
            return Err(BatteryError::ValidationError {
                message: "No candidates to evaluate; call propose first".to_string(),
            });
        }

        let db = self.services.retrieval_db(self.task);
        let mut assessments = Vec::with_capacity(candidates.len());

        for formula in candidates {
            let decision = decide_against(self.input_capacity, &formula, self.task);
            let (icsd, materials_project) = match Formula::parse(&formula) {
                Ok(parsed) => {
                    let icsd = icsd_novelty(&parsed, db, self.settings.icsd_tolerance);
                    let materials_project = match &self.services.materials {
                        Some(materials) => mp_search(&formula, materials.as_ref()).await,
                        None => Novelty::Unavailable {
                            reason: "Materials Project lookup is disabled".to_string(),
                        },
                    };
                    (icsd, materials_project)
                }
                Err(e) => {
                    let reason = e.to_string();
                    (
                        Novelty::Unavailable {
                            reason: reason.clone(),
                        },
                        Novelty::Unavailable { reason },
                    )
                }
            };
            assessments.push(CandidateAssessment {
                formula,
                capacity: decision.output_capacity,
                input_capacity: decision.input_capacity,
                improved: decision.improved,
                icsd,
                materials_project,
            });
        }

        let accepted = assessments.iter().filter(|a| a.accepted()).count();
        tracing::info!(
            "🔍 Session {} evaluated {} candidates, {} accepted",
            self.id,
            assessments.len(),
            accepted
        );
        self.last_assessments = assessments.clone();
        Ok(assessments)
    }

    /// 將上一次評估結果整理成回饋訊息並請 LLM 重新提案
    pub async fn feedback(&mut self, message: Option<String>) -> Result<Vec<String>> {
        let operator_text = message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if self.last_assessments.is_empty() && operator_text.is_none() {
            return Err(BatteryError::ValidationError {
                message: "Nothing to give feedback on; evaluate candidates or provide a message"
                    .to_string(),
            });
        }

        let mut lines = Vec::new();
        let rejected: Vec<String> = self
            .last_assessments
            .iter()
            .filter_map(|a| a.rejection_reason().map(|reason| format!("- {}: {}", a.formula, reason)))
            .collect();
        if !rejected.is_empty() {
            lines.push("The following candidates were rejected:".to_string());
            lines.extend(rejected);
        }
        let accepted: Vec<&str> = self
            .last_assessments
            .iter()
            .filter(|a| a.accepted())
            .map(|a| a.formula.as_str())
            .collect();
        if !accepted.is_empty() {
            lines.push(format!("These candidates passed every check: {}.", accepted.join(", ")));
        }
        if let Some(text) = operator_text {
            lines.push(text);
        }
        lines.push(format!(
            "Please propose {} new {} battery materials with a higher theoretical capacity than {}. \
             Write each chemical formula on its own line starting with '*'.",
            self.settings.candidates_per_round, self.task, self.input
        ));

        self.messages.push(ChatMessage::user(lines.join("\n")));
        self.last_assessments.clear();
        self.propose().await
    }

    /// 請 LLM 依預期表現排序；未被提及的候選依原順序接在最後
    pub async fn rank(&mut self, candidates: Vec<String>) -> Result<RankOutcome> {
        let candidates: Vec<String> = candidates
            .iter()
            .map(|c| self.extractor.clean(c))
            .filter(|c| !c.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(BatteryError::ValidationError {
                message: "No candidates to rank".to_string(),
            });
        }

        let prompt = ChatMessage::user(format!(
            "Rank the following {} battery materials from best to worst expected performance. \
             Write each chemical formula on its own line starting with '*'.\n{}",
            self.task,
            candidates
                .iter()
                .map(|c| format!("* {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        ));
        let mut messages = self.messages.clone();
        messages.push(prompt.clone());

        let raw_text = self.chat_with_retry(&messages).await?;
        // 條列項目常帶說明文字，取清理後內容開頭最長的候選
        let mut ordered: Vec<String> = Vec::new();
        for bullet in self.extractor.bullet_texts(&raw_text) {
            let matched = candidates
                .iter()
                .filter(|c| bullet.starts_with(c.as_str()) && !ordered.contains(c))
                .max_by_key(|c| c.len());
            if let Some(candidate) = matched {
                ordered.push(candidate.clone());
            }
        }
        for candidate in &candidates {
            if !ordered.contains(candidate) {
                ordered.push(candidate.clone());
            }
        }

        self.messages.push(prompt);
        self.messages.push(ChatMessage::assistant(raw_text.clone()));
        tracing::info!("🏆 Session {} ranked {} candidates", self.id, ordered.len());
        Ok(RankOutcome { raw_text, ordered })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            task: self.task,
            input_formula: self.input.to_string(),
            input_capacity: self.input_capacity,
            model: self.settings.model.clone(),
            round: self.round,
            history: self.history.clone(),
            last_proposals: self.last_proposals.clone(),
            last_assessments: self.last_assessments.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    fn request(&self, messages: &[ChatMessage]) -> ChatRequest {
        ChatRequest {
            model: self.settings.model.clone(),
            messages: messages.to_vec(),
            temperature: self.settings.temperature,
        }
    }

    async fn chat_with_retry(&self, messages: &[ChatMessage]) -> Result<String> {
        let attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.services.llm.chat(&self.request(messages)).await {
                Ok(text) => return Ok(text),
                Err(e @ BatteryError::LlmError { status: 401, .. }) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!("⚠️ LLM call failed (attempt {}/{}): {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::search::DbEntry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 依序回傳預先準備的回覆，並記錄收到的請求
    pub(crate) struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String>>>,
        pub(crate) requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        pub(crate) fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        async fn chat(&self, request: &ChatRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    struct KnownMaterials(Vec<&'static str>);

    #[async_trait]
    impl MaterialsDatabase for KnownMaterials {
        async fn lookup(&self, formula: &str) -> Result<Option<String>> {
            Ok(self
                .0
                .iter()
                .find(|known| **known == formula)
                .map(|_| "mp-1".to_string()))
        }
    }

    fn lithium_db() -> RetrievalDb {
        let formula = Formula::parse("LiCoO2").unwrap();
        RetrievalDb::from_entries(vec![DbEntry {
            formula: "LiCoO2".to_string(),
            composition: formula.composition().clone(),
            capacity: 273.84,
        }])
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            retry_delay: Duration::ZERO,
            max_attempts: 3,
            ..SessionSettings::default()
        }
    }

    fn session_with(llm: Arc<ScriptedLlm>, known: Vec<&'static str>) -> ExplorationSession {
        let services = Arc::new(SessionServices {
            llm,
            materials: Some(Arc::new(KnownMaterials(known))),
            lithium_db: Arc::new(lithium_db()),
            sodium_db: Arc::new(RetrievalDb::default()),
        });
        ExplorationSession::start(BatteryTask::Lithium, "LiFePO4", settings(), services).unwrap()
    }

    #[test]
    fn test_start_rejects_bad_input() {
        let services = Arc::new(SessionServices {
            llm: Arc::new(ScriptedLlm::new(Vec::new())),
            materials: None,
            lithium_db: Arc::new(RetrievalDb::default()),
            sodium_db: Arc::new(RetrievalDb::default()),
        });
        assert!(matches!(
            ExplorationSession::start(BatteryTask::Lithium, "Li(Fe", settings(), services.clone()),
            Err(BatteryError::InvalidFormula { .. })
        ));
        assert!(matches!(
            ExplorationSession::start(BatteryTask::Sodium, "LiFePO4", settings(), services),
            Err(BatteryError::ValidationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_propose_records_history() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "* LiMnPO4\n* LiCoPO4".to_string()
        )]));
        let mut session = session_with(llm.clone(), Vec::new());

        let proposals = session.propose().await.unwrap();
        assert_eq!(proposals, vec!["LiMnPO4", "LiCoPO4"]);
        assert_eq!(session.history(), ["LiMnPO4", "LiCoPO4"]);
        assert_eq!(session.transcript().len(), 3);
        assert_eq!(session.snapshot().round, 1);
        assert_eq!(llm.requests.lock().unwrap()[0].model, "chatgpt_4o");
    }

    #[tokio::test]
    async fn test_propose_retries_with_exclusion_list() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("* LiMnPO4".to_string()),
            Ok("* LiMnPO4".to_string()),
            Ok("* LiNiPO4".to_string()),
        ]));
        let mut session = session_with(llm.clone(), Vec::new());
        session.propose().await.unwrap();

        let proposals = session.propose().await.unwrap();
        assert_eq!(proposals, vec!["LiNiPO4"]);

        let requests = llm.requests.lock().unwrap();
        let retry_prompt = &requests[2].messages.last().unwrap().content;
        assert!(retry_prompt.contains("Please do not generate batteries in this list [LiMnPO4]"));
    }

    #[tokio::test]
    async fn test_propose_gives_up_after_max_attempts() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("no bullets here".to_string()),
            Ok("still nothing".to_string()),
            Ok("* PO4".to_string()),
        ]));
        let mut session = session_with(llm, Vec::new());
        assert!(matches!(
            session.propose().await,
            Err(BatteryError::NoNewCandidates { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_propose_stops_on_auth_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(BatteryError::LlmError {
            status: 401,
            message: "authentication failed".to_string(),
        })]));
        let mut session = session_with(llm.clone(), Vec::new());
        assert!(matches!(
            session.propose().await,
            Err(BatteryError::LlmError { status: 401, .. })
        ));
        assert_eq!(llm.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_checks_capacity_and_novelty() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "* LiCoO2\n* LiMnO2\n* LiFe2PO4\n* Li2FePO4".to_string()
        )]));
        let mut session = session_with(llm, vec!["LiMnO2"]);
        session.propose().await.unwrap();

        let assessments = session.evaluate(None).await.unwrap();
        assert_eq!(assessments.len(), 4);

        assert!(assessments[0].improved);
        assert!(assessments[0].icsd.is_known());
        assert!(assessments[1].materials_project.is_known());
        assert!(!assessments[2].improved);
        assert!(assessments[3].accepted());
    }

    #[tokio::test]
    async fn test_evaluate_explicit_invalid_candidate() {
        let llm = Arc::new(ScriptedLlm::new(Vec::new()));
        let mut session = session_with(llm, Vec::new());

        let assessments = session
            .evaluate(Some(vec!["Li(Fe".to_string(), "$Li_2FePO_4$".to_string()]))
            .await
            .unwrap();
        assert!(assessments[0].capacity.is_none());
        assert_eq!(assessments[1].formula, "Li2FePO4");

        assert!(session.evaluate(Some(Vec::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_feedback_lists_rejections_and_reproposes() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("* LiCoO2".to_string()),
            Ok("* Li2MnPO4".to_string()),
        ]));
        let mut session = session_with(llm.clone(), Vec::new());
        session.propose().await.unwrap();
        session.evaluate(None).await.unwrap();

        let proposals = session
            .feedback(Some("Try manganese.".to_string()))
            .await
            .unwrap();
        assert_eq!(proposals, vec!["Li2MnPO4"]);

        let requests = llm.requests.lock().unwrap();
        let feedback = &requests[1].messages.last().unwrap().content;
        assert!(feedback.contains("- LiCoO2: it matches the known material LiCoO2 in ICSD"));
        assert!(feedback.contains("Try manganese."));
    }

    #[tokio::test]
    async fn test_rank_reads_bullets_with_commentary() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "* LiCoPO4 - highest voltage\n* LiNiPO4: good\n* LiMnPO4 (cheapest)".to_string(),
        )]));
        let mut session = session_with(llm, Vec::new());

        let outcome = session
            .rank(vec![
                "LiMnPO4".to_string(),
                "LiNiPO4".to_string(),
                "LiCoPO4".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.ordered, vec!["LiCoPO4", "LiNiPO4", "LiMnPO4"]);
    }

    #[tokio::test]
    async fn test_rank_appends_unmentioned_in_given_order() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("* LiCoPO4 is best".to_string())]));
        let mut session = session_with(llm, Vec::new());

        let outcome = session
            .rank(vec![
                "LiMnPO4".to_string(),
                "LiNiPO4".to_string(),
                "LiCoPO4".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.ordered, vec!["LiCoPO4", "LiMnPO4", "LiNiPO4"]);
    }

    #[tokio::test]
    async fn test_rank_uses_llm_order() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("* LiCoPO4\n* LiMnPO4".to_string())]));
        let mut session = session_with(llm, Vec::new());

        let outcome = session
            .rank(vec!["LiMnPO4".to_string(), "LiCoPO4".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.ordered, vec!["LiCoPO4", "LiMnPO4"]);
    }
}
