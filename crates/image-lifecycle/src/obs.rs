//! Structured lifecycle events.
//!
//! Stage boundaries and verifier transitions are logged with a stable
//! `event` field so CI log collectors can follow a run without parsing
//! free text.

use cloud_registry::ServerId;
use tracing::{info, warn};

use crate::verifier::VerifierState;

/// Span tagging every log line emitted while a stage runs.
///
/// Attach with `tracing::Instrument::instrument` rather than entering it,
/// so it is never held across an await point.
pub fn stage_span(stage: &str) -> tracing::Span {
    tracing::info_span!("imagectl.stage", stage = %stage)
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_verifier_state(state: VerifierState) {
    info!(event = "verify.state", state = ?state);
}

/// An instance handle went away without its delete having completed.
pub fn emit_instance_leaked(server_id: ServerId, name: &str) {
    warn!(
        event = "instance.leaked",
        server_id = server_id,
        name = %name,
        "test instance may still exist; delete it manually or let auto-cleanup reap it",
    );
}
