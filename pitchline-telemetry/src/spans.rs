//! Span helpers for calls and relay pairs.

use tracing::Span;

/// Span covering one practice call.
///
/// # Example
/// ```
/// use pitchline_telemetry::call_span;
/// let span = call_span("3f1c", "price");
/// let _enter = span.enter();
/// ```
pub fn call_span(session_id: &str, scenario: &str) -> Span {
    tracing::info_span!("call", session_id = session_id, scenario = scenario)
}

/// Span covering one client/upstream relay pair.
pub fn relay_pair_span(pair_id: u64) -> Span {
    tracing::info_span!("relay.pair", pair_id = pair_id)
}
