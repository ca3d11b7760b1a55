use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by ports, connectors, components and executor pools.
///
/// Contract violations and rejected submissions are deliberately distinct:
/// the former is a bug in the caller, the latter a runtime race (e.g. a pool
/// that is already shutting down) that a well-behaved caller may handle.
#[derive(Error, Debug)]
pub enum Error {
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("submission rejected by pool {pool}: {reason}")]
    Rejected { pool: String, reason: String },
    #[error("unable to resolve port {0}")]
    Unresolved(String),
    #[error("execution failed: {0:#}")]
    Execution(AnyError),
    #[error("cancelled before completion")]
    Cancelled,
    #[error("component {uri} failed to start: {cause:#}")]
    Start { uri: String, cause: AnyError },
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("executor pool {uri} could not be created: {cause:#}")]
    PoolCreation { uri: String, cause: AnyError },
}

impl Error {
    /// Builds a contract violation and reports it at `error` level.
    pub fn contract(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("contract violation: {msg}");
        Error::Contract(msg)
    }

    pub fn rejected(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        let pool = pool.into();
        let reason = reason.into();
        tracing::warn!("submission rejected by pool {pool}: {reason}");
        Error::Rejected { pool, reason }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Contract(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Returns early with a contract violation when the condition does not hold.
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::contract(format!($($arg)+)));
        }
    };
}

/// Builds a contract violation error from a format string.
macro_rules! contract_violation {
    ($($arg:tt)+) => {
        $crate::Error::contract(format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded(v: usize) -> Result<usize> {
        ensure_contract!(v > 0, "value must be positive, got {v}");
        Ok(v)
    }

    #[test]
    fn test_contract_and_rejection_are_distinct() {
        let err = guarded(0).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!err.is_rejected());
        assert_eq!(
            "contract violation: value must be positive, got 0",
            err.to_string()
        );

        let err = Error::rejected("pool-a", "shutting down");
        assert!(err.is_rejected());
        assert!(!err.is_contract_violation());
        assert_eq!(guarded(3).unwrap(), 3);
    }

    #[test]
    fn test_execution_keeps_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("saving snapshot");
        let err = Error::Execution(cause);
        assert_eq!("execution failed: saving snapshot: disk full", err.to_string());
        let err: Error = contract_violation!("port {} missing", "p1");
        assert!(err.is_contract_violation());
    }
}
