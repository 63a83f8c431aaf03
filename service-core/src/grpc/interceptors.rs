//! gRPC interceptors and metadata helpers.
//!
//! - W3C trace context propagation (traceparent/tracestate)
//! - Tenant and request id extraction

use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tonic::metadata::{KeyRef, MetadataMap};
use tonic::{Request, Status};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::error::AppError;

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// gRPC metadata key carrying the calling organization.
pub const TENANT_ID_KEY: &str = "x-tenant-id";

/// A text map extractor for gRPC metadata.
struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|k| match k {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

/// Interceptor that parents the current span on the caller's trace context.
///
/// ```ignore
/// let service = HoursServiceServer::with_interceptor(hours_service, trace_context_interceptor);
/// ```
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(request: Request<()>) -> Result<Request<()>, Status> {
    let propagator = TraceContextPropagator::new();
    let context = propagator.extract(&MetadataExtractor(request.metadata()));
    Span::current().set_parent(context);

    if tracing::enabled!(tracing::Level::DEBUG)
        && let Some(traceparent) = request.metadata().get(TRACEPARENT_KEY)
        && let Ok(value) = traceparent.to_str()
    {
        tracing::debug!(traceparent = %value, "gRPC request with trace context");
    }

    Ok(request)
}

/// Extract the tenant from the `x-tenant-id` metadata entry.
pub fn extract_tenant_id<T>(request: &Request<T>) -> Result<Uuid, AppError> {
    let raw = request
        .metadata()
        .get(TENANT_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing {}", TENANT_ID_KEY)))?;

    Uuid::parse_str(raw)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid {}: {}", TENANT_ID_KEY, raw)))
}

/// Extract request ID from incoming gRPC request metadata.
pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
