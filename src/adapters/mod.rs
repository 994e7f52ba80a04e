// Adapters layer: concrete implementations of the domain ports (storage, http, processes).

pub mod llm;
pub mod materials_project;
pub mod scoring_tool;
pub mod storage;

pub use llm::{LlmSettings, OpenAiCompatibleClient};
pub use materials_project::MaterialsProjectClient;
pub use scoring_tool::{CapacityScorer, CommandScorer};
pub use storage::LocalStorage;
