pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::LocalStorage;
pub use core::{StageEngine, StageOutcome};
pub use domain::model::{BatteryTask, Candidate, CandidateAssessment, Novelty};
pub use utils::error::{BatteryError, Result};
