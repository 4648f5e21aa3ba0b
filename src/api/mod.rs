// HTTP surface: public catalog reads, admin task control, sync webhook

pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use auth::{AdminGate, IdentityProvider, StaticIdentity, SupabaseIdentity};
pub use error::ApiError;
pub use server::ApiServer;
