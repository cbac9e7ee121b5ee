use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 32 hex chars (128 bits).
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Create a named span for one orchestration, returning the span and its
/// trace ID for logging correlation.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span_id = generate_span_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    );
    (span, trace_id)
}

/// Create a child span for a single backend call under an existing trace.
pub fn create_backend_span(trace_id: &str, backend: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::debug_span!(
        "backend_call",
        trace_id = %trace_id,
        span_id = %span_id,
        backend = %backend,
    )
}
