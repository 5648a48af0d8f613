//! Typed error kinds for the processor (§7). Distinct from the `anyhow`
//! errors used at I/O boundaries — these are matched on by callers to
//! decide ack/nack/log policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("device {0} is not registered")]
    UnregisteredDevice(String),

    #[error("device {0} has no assigned location")]
    MissingLocation(String),

    #[error("transient store error: {0}")]
    TransientStoreError(#[source] anyhow::Error),

    #[error("duplicate alert for {device_id}/{parameter}")]
    DuplicateAlert { device_id: String, parameter: String },

    #[error("circuit open: {0}")]
    CircuitOpen(&'static str),

    #[error("deadline exceeded")]
    Deadline,

    #[error("auth failure")]
    AuthFailure,
}

impl ProcessError {
    /// Whether the MQ message should be nacked (requeued) for this error,
    /// per the §7 propagation policy: only persistence failures ahead of
    /// Step 2 completion propagate.
    pub fn should_nack(&self) -> bool {
        matches!(
            self,
            ProcessError::TransientStoreError(_) | ProcessError::Deadline
        )
    }
}
