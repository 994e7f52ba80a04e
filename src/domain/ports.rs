use crate::domain::model::{Candidate, ChatRequest};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// 供日誌與回報使用的完整路徑
    fn location(&self, path: &str) -> String {
        path.to_string()
    }
}

/// OpenAI 相容的對話模型
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}

/// 外部材料資料庫 (Materials Project) 精確化學式查詢
#[async_trait]
pub trait MaterialsDatabase: Send + Sync {
    /// 找到時回傳第一筆材料 ID
    async fn lookup(&self, formula: &str) -> Result<Option<String>>;
}

/// 排名用的評分器，回傳的候選順序不需與輸入一致，缺少的即為無分數
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>>;

    fn describe(&self) -> String;
}

/// 批次階段的結果摘要
pub trait StageReport {
    fn kept(&self) -> usize;
    fn rejected(&self) -> usize;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    type Item: Send + 'static;
    type Report: StageReport + Send + 'static;

    async fn extract(&self) -> Result<Vec<Self::Item>>;
    async fn transform(&self, data: Vec<Self::Item>) -> Result<Self::Report>;
    async fn load(&self, report: Self::Report) -> Result<String>;
}
