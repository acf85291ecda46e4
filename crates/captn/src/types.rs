//! Domain types shared across components (§3 of the design).
//!
//! Mirrors the reference stack's `types.rs`: small, mostly-`Copy`-free
//! structs with derived `Serialize`/`Deserialize`, manual `Default` impls
//! wherever the default isn't `Default::default()`, and duration fields
//! serialized via `humantime_serde` so config files can write `"30s"`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The shape class a tag parses into. Two versions may only be ordered
/// when their schemes match (§3 "Version").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Semantic,
    Date,
    Numeric,
}

/// The trailing `-<suffix>` after the numeric components. Numeric suffixes
/// participate in ordering like another component; opaque ones only ever
/// contribute a `build` diff (§4.1 edge cases).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSuffix {
    Numeric(u64),
    Opaque(String),
}

/// A parsed tag: optional literal prefix (`v`/`V`), a numeric component
/// sequence, an optional build suffix, and the scheme the shape matched.
///
/// `raw` retains the original tag string so callers can recover the exact
/// literal form (leading zeros and all) without re-rendering from parsed
/// integers, per §4.1's edge case about preserved leading zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub raw: String,
    pub prefix: Option<char>,
    pub scheme: Scheme,
    pub components: Vec<u64>,
    pub build: Option<BuildSuffix>,
}

/// The classification of a step from `old` to `new` (§3 "DiffKind").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    None,
    Digest,
    Build,
    Patch,
    Minor,
    Major,
    SchemeChange,
}

/// Which axis a `lagPolicy` entry restricts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagAxis {
    Major,
    Minor,
}

/// A condition entry: kind `k` is only permitted when one of `require` is
/// concurrently present among the candidate set (§3 "Rule").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub require: BTreeSet<DiffKind>,
}

/// The policy object deciding what kinds of steps a container may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, with = "humantime_serde")]
    pub min_image_age: Duration,
    #[serde(default)]
    pub progressive_upgrade: bool,
    #[serde(default)]
    pub allow: BTreeSet<DiffKind>,
    #[serde(default)]
    pub conditions: BTreeMap<DiffKind, Condition>,
    #[serde(default)]
    pub lag_policy: BTreeMap<LagAxis, u32>,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            min_image_age: Duration::ZERO,
            progressive_upgrade: false,
            allow: BTreeSet::new(),
            conditions: BTreeMap::new(),
            lag_policy: BTreeMap::new(),
        }
    }
}

/// Restart policy as reported/settable on a container (§3 "Container").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure { max_retries: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub nano_cpus: Option<i64>,
}

/// Daemon-reported lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
}

/// Healthcheck-reported state, if the container defines one (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// A running or stopped container as reported by the driver (§3 "Container").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub tag: String,
    pub digest: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub restart_policy: RestartPolicy,
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub state: ContainerState,
    pub health_state: HealthState,
}

/// A remote tag enriched with digest and push time; an input to planning
/// (§3 "Candidate").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub version: Version,
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    pub diff_kind_vs_current: DiffKind,
}

/// A single candidate-application within a Plan (§3 "UpdatePlan").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub target: Candidate,
    pub diff_kind: DiffKind,
}

/// Ordered, non-empty sequence of steps the executor applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub steps: Vec<Step>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Why a container was skipped rather than planned (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TagNotParseable,
    NoCandidates,
    RuleForbidsAll,
    ImageTooYoung,
}

/// The terminal disposition of a container's update attempt (§3 "UpdateOutcome").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalState {
    Updated,
    Noop,
    Skipped,
    RolledBack,
    Aborted,
    /// Terminal per §7 "Rollback": `RollbackFailed`, container left under
    /// its backup name with a loud warning in the report.
    AbortedInconsistent,
}

/// Captured output of a single hook invocation (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResult {
    pub script_type: ScriptType,
    pub path: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Pre,
    Post,
}

/// Per-step and total wall-clock durations recorded for the report (§4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Durations {
    pub total: Duration,
    pub per_step: Vec<Duration>,
}

/// `{ container, plan, stepsApplied, finalState, reason, durations, scriptResults }` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub container: String,
    pub plan: Option<UpdatePlan>,
    pub steps_applied: usize,
    pub final_state: FinalState,
    pub reason: Option<String>,
    pub durations: Durations,
    pub script_results: Vec<ScriptResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_kind_orders_none_below_scheme_change() {
        assert!(DiffKind::None < DiffKind::Digest);
        assert!(DiffKind::Patch < DiffKind::Major);
        assert!(DiffKind::Major < DiffKind::SchemeChange);
    }

    #[test]
    fn rule_default_allows_nothing() {
        let rule = Rule::default();
        assert!(rule.allow.is_empty());
        assert!(!rule.progressive_upgrade);
        assert_eq!(rule.min_image_age, Duration::ZERO);
    }

    #[test]
    fn update_plan_empty_reports_empty() {
        let plan = UpdatePlan { steps: vec![] };
        assert!(plan.is_empty());
    }

    #[test]
    fn rule_roundtrips_through_json() {
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Patch);
        rule.lag_policy.insert(LagAxis::Major, 1);
        rule.min_image_age = Duration::from_secs(3600);

        let json = serde_json::to_string(&rule).expect("serialize");
        let back: Rule = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rule, back);
    }
}
