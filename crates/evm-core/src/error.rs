//! Fault-to-error mapping: turns a stage's raw fault into a [`VmError`], the
//! single error type the pipeline threads through, and applies the
//! per-evaluation recovery policy (nothrows/errorlog/warnlog) at pipeline
//! exit (spec §4.H, §7).

use evm_types::fault::{self, Fault};
use evm_hooks::HookFault;
use evm_store::StoreError;

/// The pipeline's single error type: a fault code plus a human-readable
/// reason, threaded via `?` through every stage.
#[derive(Debug, thiserror::Error)]
#[error("{fault}: {message}")]
pub struct VmError {
    /// The fault bits this error carries.
    pub fault: Fault,
    /// A human-readable reason, used in log lines.
    pub message: String,
}

impl VmError {
    /// Construct an error carrying `fault` and `message`.
    pub fn new(fault: Fault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }
}

impl From<HookFault> for VmError {
    /// A typed VM error carries its own fault code (spec §4.H): a hook
    /// that raises [`HookFault`] passes its fault straight through.
    fn from(f: HookFault) -> Self {
        VmError::new(f.fault, f.reason)
    }
}

/// Map a storage-layer failure onto fault `GENERAL` — the store's own
/// errors (I/O, serialization) are not part of the EVM's fault taxonomy,
/// so any other signaled error maps to `GENERAL` per spec §4.H.
pub fn store_fault(err: StoreError) -> VmError {
    VmError::new(Fault::from_bits(fault::GENERAL), err.to_string())
}

/// Map a canonical-serialization failure onto fault `INVALID`.
pub fn invalid_fault(err: serde_json::Error) -> VmError {
    VmError::new(Fault::from_bits(fault::INVALID), err.to_string())
}

/// Apply the per-evaluation recovery policy to a stage result, logging at
/// the configured level and deciding whether the fault is returned as a
/// value or propagated as an error (spec §4.H, §7).
pub fn apply_policy(
    nothrows: Fault,
    errorlog: Fault,
    warnlog: Fault,
    result: Result<(), VmError>,
) -> Result<Fault, VmError> {
    let err = match result {
        Ok(()) => return Ok(Fault::accept()),
        Err(err) => err,
    };

    if errorlog.bits() & err.fault.bits() != 0 {
        tracing::error!(fault = %err.fault, "{}", err.message);
    } else if warnlog.bits() & err.fault.bits() != 0 {
        tracing::warn!(fault = %err.fault, "{}", err.message);
    }

    if nothrows.bits() & err.fault.bits() != 0 {
        Ok(err.fault)
    } else {
        Err(err)
    }
}
