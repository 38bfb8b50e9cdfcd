use std::time::Duration;

use portguard_process::ProcessState;

/// Failures surfaced by the supervisor's start/stop API.
///
/// Transient OS-facing noise (socket table reads, kill races) is absorbed at
/// the reconciler and never reaches this type.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Spawning the OS process failed (missing executable, permissions).
    /// Fatal to the attempt; the restart policy decides what happens next.
    #[error("failed to launch server process `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Reconciliation and the fallback search both failed to produce a
    /// bindable port.
    #[error("no free port within {window} ports of {port}")]
    PortConflict { port: u16, window: u16 },

    /// `start()` called while a previous child may still be live.
    #[error("supervisor is not stopped (state: {0:?})")]
    NotStopped(ProcessState),

    /// Graceful stop exceeded the grace period. Always recovered by
    /// escalating to SIGKILL; callers only ever see this in logs.
    #[error("graceful stop exceeded {0:?}, escalated to SIGKILL")]
    TerminationTimeout(Duration),
}

/// A remediation action step failed. Recorded in the ledger and not retried
/// automatically; an operator clears the ledger entry to force a retry.
#[derive(Debug, thiserror::Error)]
#[error("remediation step `{step}` failed: {reason}")]
pub struct RemediationActionError {
    pub step: String,
    pub reason: String,
}
