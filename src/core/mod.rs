pub mod capacity;
pub mod dedup;
pub mod engine;
pub mod extraction;
pub mod ranking;
pub mod retrieval;
pub mod search;
pub mod session;

pub use crate::domain::ports::{Pipeline, StageReport, Storage};
pub use crate::utils::error::Result;
pub use engine::{StageEngine, StageOutcome};
