//! service-core: Shared infrastructure for the SeeZee portal services.
pub mod config;
pub mod error;
pub mod grpc;
pub mod middleware;
pub mod observability;

pub use axum;
pub use tonic;
pub use tracing;
pub use validator;
