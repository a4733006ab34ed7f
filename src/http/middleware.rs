//! Axum middleware placing the admission gate in front of an application.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, error, info, instrument, warn};

use crate::config::FailurePolicy;
use crate::error::SlomoError;
use crate::ratelimit::{Admission, Gate};

/// Wrap every route of `app` with the admission gate.
pub fn gated(app: Router, gate: Arc<Gate>) -> Router {
    app.layer(middleware::from_fn_with_state(gate, admission_gate))
}

/// Check admission before handing the request to the rest of the stack.
///
/// Admitted requests get the wrapped handler's response unchanged. Rejected
/// requests get a 429 and never reach the handler. When the store cannot be
/// consulted the configured [`FailurePolicy`] decides between a server error
/// and an unchecked pass-through. A log that cannot be decoded is always a
/// server error: it stays in the store, so passing requests through would
/// disable limiting until an operator repairs it.
#[instrument(
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn admission_gate(
    State(gate): State<Arc<Gate>>,
    request: Request,
    next: Next,
) -> Response {
    match gate.check().await {
        Ok(Admission::Admitted) => {
            debug!("Request admitted");
            next.run(request).await
        }
        Ok(Admission::Rejected { retry_after }) => {
            info!(
                retry_after_secs = retry_after.as_secs(),
                capacity = gate.policy().capacity,
                "Request rejected by rate limit"
            );
            rejection(retry_after)
        }
        Err(err) if may_fail_open(&err) && gate.failure_policy() == FailurePolicy::FailOpen => {
            warn!(error = %err, "Rate limiter failed, admitting request unchecked");
            next.run(request).await
        }
        Err(err) => {
            error!(error = %err, "Rate limiter failed, refusing request");
            failure(&err)
        }
    }
}

/// Failures a fail-open gate may wave through: the store could not be reached
/// in time, or writers kept racing.
fn may_fail_open(err: &SlomoError) -> bool {
    matches!(err, SlomoError::Store(_) | SlomoError::Contention { .. })
}

/// The 429 sent to a rejected caller.
pub fn rejection(retry_after: Duration) -> Response {
    let secs = retry_after.as_secs();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, secs.to_string())],
        format!("Rate limit exceeded. Try again in {} seconds", secs),
    )
        .into_response()
}

/// The server error sent when the gate cannot decide.
pub fn failure(err: &SlomoError) -> Response {
    let status = match err {
        SlomoError::Store(_) | SlomoError::Contention { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, "Rate limiter unavailable").into_response()
}
