//! Interrupt/abort controller

use tracing::debug;

use super::events::AbortReason;
use super::manager::SessionManager;
use super::types::SessionRecord;

/// Record an abort reason on a processing session.
///
/// `UserStop` overrides whatever was recorded before; any other reason only
/// lands if the turn has none yet. Returns whether the backend should be
/// signalled.
pub(crate) fn record_abort(s: &mut SessionRecord, reason: AbortReason) -> bool {
    if !s.is_processing {
        return false;
    }
    match (s.pending_abort, reason) {
        (Some(AbortReason::UserStop), _) => return false,
        (Some(_), r) if r != AbortReason::UserStop => return false,
        _ => {}
    }

    s.pending_abort = Some(reason);
    match reason {
        AbortReason::UserStop => s.stop_requested = true,
        AbortReason::Redirect => s.was_interrupted = true,
        _ => {}
    }
    true
}

impl SessionManager {
    /// Ask the in-flight turn of `id` to stop for `reason`.
    ///
    /// The backend keeps delivering what it already produced; the turn's
    /// finish step decides what follows from the recorded reason.
    pub(crate) fn abort_turn(&self, id: &str, reason: AbortReason) -> bool {
        let signal = self.inner.registry.with_mut(id, |s| {
            if record_abort(s, reason) {
                Some(s.backend.clone())
            } else {
                None
            }
        });

        match signal.flatten() {
            Some(backend) => {
                debug!(session_id = id, reason = reason.as_str(), "Aborting turn");
                if let Some(backend) = backend {
                    backend.abort(reason);
                }
                true
            }
            None => false,
        }
    }
}
