//! The machine-readable error taxonomy callers branch on (§7). Every
//! component boundary in this crate converts its underlying failure into
//! one of these variants; `anyhow` is left to the `captn-cli` binary
//! boundary, which has no callers of its own to hand a typed error back to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptnError {
    // -- Input/Config: surfaced immediately, run aborted.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("invalid rule {name:?}: {reason}")]
    RuleInvalid { name: String, reason: String },
    #[error("invalid credentials: {0}")]
    CredentialsInvalid(String),

    // -- Environment: run aborted.
    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("lock already held by pid {pid} since {since}")]
    LockHeld { pid: u32, since: String },
    #[error("insufficient access to host resource: {0}")]
    HostAccessDenied(String),

    // -- Registry: per-image scope, does not abort the run.
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),
    #[error("registry authentication failed: {0}")]
    AuthFailed(String),
    #[error("registry rate-limited the request")]
    RateLimited,
    #[error("tag list empty for image {0}")]
    TagListEmpty(String),
    #[error("registry protocol error: {0}")]
    ProtocolError(String),

    // -- Planning: benign per-container skip.
    #[error("reference tag is not parseable")]
    TagNotParseable,
    #[error("no update candidates available")]
    NoCandidates,
    #[error("rule forbids every available candidate")]
    RuleForbidsAll,
    #[error("candidate image is younger than minImageAge")]
    ImageTooYoung,

    // -- Execution: triggers rollback per §4.10 unless policy overrides.
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container name already in use: {0}")]
    ConflictName(String),
    #[error("container failed to start: {0}")]
    StartFailed(String),
    #[error("container did not stabilize in time")]
    DidNotStabilize,
    #[error("{0} hook failed with exit code {1:?}")]
    HookFailed(crate::types::ScriptType, Option<i32>),

    // -- Rollback: terminal for that container.
    #[error("rollback failed, container left under its backup name: {0}")]
    RollbackFailed(String),
}

impl CaptnError {
    /// Is this a per-image registry fault that should skip that image's
    /// containers rather than abort the whole run (§7 propagation policy)?
    pub fn is_registry_scoped(&self) -> bool {
        matches!(
            self,
            CaptnError::RegistryUnreachable(_)
                | CaptnError::AuthFailed(_)
                | CaptnError::RateLimited
                | CaptnError::TagListEmpty(_)
                | CaptnError::ProtocolError(_)
        )
    }

    /// Is this a benign per-container planning skip?
    pub fn is_planning_skip(&self) -> bool {
        matches!(
            self,
            CaptnError::TagNotParseable
                | CaptnError::NoCandidates
                | CaptnError::RuleForbidsAll
                | CaptnError::ImageTooYoung
        )
    }

    /// Is this a cross-cutting failure that should abort the whole run?
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            CaptnError::ConfigInvalid(_)
                | CaptnError::RuleInvalid { .. }
                | CaptnError::CredentialsInvalid(_)
                | CaptnError::DaemonUnavailable(_)
                | CaptnError::LockHeld { .. }
                | CaptnError::HostAccessDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_are_scoped_not_aborting() {
        let err = CaptnError::RateLimited;
        assert!(err.is_registry_scoped());
        assert!(!err.aborts_run());
    }

    #[test]
    fn config_errors_abort_the_run() {
        let err = CaptnError::ConfigInvalid("missing field".into());
        assert!(err.aborts_run());
        assert!(!err.is_registry_scoped());
        assert!(!err.is_planning_skip());
    }

    #[test]
    fn planning_skips_are_benign() {
        assert!(CaptnError::NoCandidates.is_planning_skip());
        assert!(!CaptnError::NoCandidates.aborts_run());
    }
}
