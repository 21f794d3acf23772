//! Credential endpoint: mints short-lived client secrets so browsers and
//! CLI clients never see the long-lived key.

use axum::Json;
use axum::extract::State;
use pitchline_realtime::BrokerResponse;

use crate::error::{RelayError, Result};
use crate::server::RelayState;

/// `POST /api/realtime/secret`
pub(crate) async fn mint_secret(State(state): State<RelayState>) -> Result<Json<BrokerResponse>> {
    let broker = state.broker.as_ref().ok_or(RelayError::BrokerDisabled)?;
    let credential = broker.acquire().await.map_err(|e| {
        tracing::warn!(error = %e, "failed to mint client secret");
        RelayError::from(e)
    })?;
    tracing::info!(expires_at = %credential.expires_at, "client secret minted");
    Ok(Json(credential.to_response()))
}
