use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::services::instrumentation::TraceContext;

/// Acquire the request's trace context — propagated `x-trace-id` or a fresh
/// one — and scope it into the task so every span created below inherits it.
/// The id is echoed back on the response.
pub async fn inject_trace_context(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-trace-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .unwrap_or_else(Uuid::new_v4);

    let ctx = TraceContext::new(trace_id);
    let mut response = ctx.scope(next.run(request)).await;

    if let Ok(header_value) = trace_id.to_string().parse() {
        response.headers_mut().insert("x-trace-id", header_value);
    }
    response
}
