//! Hot-swap orchestration
//!
//! Replaces a running agent with a new version while carrying its in-memory
//! state across. Each attempt is recorded as a `SwapSession` whose status
//! walks `Initiating → CapturingState → Pausing → Verifying →
//! TransferringState` and ends in exactly one of `Completed`, `Failed` or
//! `RolledBack`.

pub mod coordinator;
pub mod session;

use thiserror::Error;

use crate::error::OrchestratorError;

pub use coordinator::HotSwapCoordinator;
pub use session::{StepStatus, SwapEvent, SwapSession, SwapStatus, SwapStep};

/// A failed `swap_agent` call.
///
/// `session` is `None` only when the swap never started (unknown old agent,
/// invalid names); otherwise it holds the terminal session explaining what
/// happened.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SwapError {
    pub session: Option<Box<SwapSession>>,
    pub source: OrchestratorError,
}

impl SwapError {
    pub(crate) fn before_start(source: OrchestratorError) -> Self {
        Self {
            session: None,
            source,
        }
    }

    pub(crate) fn with_session(session: SwapSession, source: OrchestratorError) -> Self {
        Self {
            session: Some(Box::new(session)),
            source,
        }
    }
}
