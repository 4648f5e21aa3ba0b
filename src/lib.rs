pub mod aggregation;
pub mod alerts;
pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod exchange;
pub mod harvest;
pub mod normalization;
pub mod orchestrator;
pub mod retry;
pub mod services;
pub mod sync;
pub mod tasks;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::AppConfig;
pub use error::{StoreError, UpstreamError};
pub use services::Services;
