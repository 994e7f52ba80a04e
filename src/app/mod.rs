pub mod web;

pub use web::{build_router, serve, AppState};
