// Paystream - pay-as-you-watch Lightning micropayment metering

pub mod config;
pub mod metering;
pub mod middleware;
pub mod models;
pub mod observer;
pub mod orchestrator;
pub mod payment;
pub mod progress;
pub mod routes;
pub mod session;
pub mod storage;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
