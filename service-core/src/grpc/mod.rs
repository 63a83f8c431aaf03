//! gRPC utilities shared by the portal services.
//!
//! - Error conversion between `AppError` and `tonic::Status`
//! - Interceptors for trace context propagation and tenant extraction

pub mod error;
pub mod interceptors;

pub use error::{GrpcResult, IntoStatus};
pub use interceptors::{
    REQUEST_ID_KEY, TENANT_ID_KEY, TRACEPARENT_KEY, extract_request_id, extract_tenant_id,
    trace_context_interceptor,
};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
