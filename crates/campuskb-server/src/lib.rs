//! CampusKB server: axum routes over the retrieval pipeline.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::{AppState, Backends};
