//! Update Executor (C10): the per-container update state machine. See
//! SPEC_FULL.md §4.10 and the rollback protocol in §7.
//!
//! ```text
//! INIT -> PRE -> PULL -> STOP_OLD -> START_NEW -> VERIFY -> POST -> COMMIT -> DONE
//!                                        |            |       |
//!                                        v            v       v
//!                                     ROLLBACK ---------------+
//!                                        |
//!                                        +-> RESTORED | FAILED
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::container::{ContainerDriver, NewContainerSpec};
use crate::envfilter::{filter_env, EnvFilterConfig};
use crate::hooks::{hook_succeeded, run_hook};
use crate::types::{
    Container, Durations, FinalState, RestartPolicy, ScriptResult, ScriptType, Step, UpdatePlan,
    UpdateOutcome,
};
use crate::verify::{verify, VerifyOutcome, VerifyPolicy};
use crate::Reporter;

#[derive(Debug, Clone, Copy)]
pub struct PreHookPolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub continue_on_failure: bool,
}

impl Default for PreHookPolicy {
    fn default() -> Self {
        PreHookPolicy {
            enabled: true,
            timeout: Duration::from_secs(30),
            continue_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostHookPolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub rollback_on_failure: bool,
}

impl Default for PostHookPolicy {
    fn default() -> Self {
        PostHookPolicy {
            enabled: true,
            timeout: Duration::from_secs(30),
            rollback_on_failure: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub dry_run: bool,
    pub log_level: String,
    pub scripts_dir: PathBuf,
    pub config_dir: PathBuf,
    pub pre_hook: PreHookPolicy,
    pub post_hook: PostHookPolicy,
    pub verify_policy: VerifyPolicy,
    pub stop_timeout: Duration,
    pub delay_between_updates: Duration,
    pub env_filter: EnvFilterConfig,
    /// Authoritative re-check at pull time: an image can age past
    /// `minImageAge` between planning and execution on a long-running
    /// coordinator pass (§4.10).
    pub min_image_age: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            dry_run: false,
            log_level: "info".to_string(),
            scripts_dir: PathBuf::from("/etc/captn/scripts"),
            config_dir: PathBuf::from("/etc/captn"),
            pre_hook: PreHookPolicy::default(),
            post_hook: PostHookPolicy::default(),
            verify_policy: VerifyPolicy::default(),
            stop_timeout: Duration::from_secs(10),
            delay_between_updates: Duration::from_secs(0),
            env_filter: EnvFilterConfig::default(),
            min_image_age: Duration::ZERO,
        }
    }
}

fn backup_name(original: &str) -> String {
    format!("{original}_bak_cu_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Behavior for the self-update helper container (§4.10).
#[derive(Debug, Clone)]
pub struct SelfUpdateOptions {
    pub helper_image: String,
    pub remove_helper_container: bool,
}

impl Default for SelfUpdateOptions {
    fn default() -> Self {
        SelfUpdateOptions {
            helper_image: "docker:cli".to_string(),
            remove_helper_container: true,
        }
    }
}

/// Name of the disposable container that performs a self-update's
/// stop/start swap on the Updater's behalf.
fn helper_container_name(original: &str) -> String {
    format!("{original}_captn_self_helper")
}

/// The label that marks a helper container, so a crashed prior run's
/// leftover helper is recognizable (and prune-eligible) rather than
/// mistaken for a normal managed container.
pub const SELF_UPDATE_HELPER_LABEL: &str = "captn.selfUpdateHelper";

/// Render a `NewContainerSpec` into the flag list `docker create` expects,
/// for embedding in the helper's swap script. Mirrors the flag set
/// `CliDriver::create_container` builds directly against the daemon.
fn render_create_args(spec: &NewContainerSpec) -> Vec<String> {
    let mut args = vec!["--name".to_string(), spec.name.clone()];
    for (k, v) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    for (k, v) in &spec.labels {
        args.push("-l".to_string());
        args.push(format!("{k}={v}"));
    }
    for m in &spec.mounts {
        let ro = if m.read_only { ":ro" } else { "" };
        args.push("-v".to_string());
        args.push(format!("{}:{}{}", m.source, m.destination, ro));
    }
    for n in &spec.networks {
        args.push("--network".to_string());
        args.push(n.clone());
    }
    match &spec.restart_policy {
        RestartPolicy::No => {
            args.push("--restart".to_string());
            args.push("no".to_string());
        }
        RestartPolicy::Always => {
            args.push("--restart".to_string());
            args.push("always".to_string());
        }
        RestartPolicy::UnlessStopped => {
            args.push("--restart".to_string());
            args.push("unless-stopped".to_string());
        }
        RestartPolicy::OnFailure { max_retries } => {
            args.push("--restart".to_string());
            match max_retries {
                Some(n) => args.push(format!("on-failure:{n}")),
                None => args.push("on-failure".to_string()),
            }
        }
    }
    args.push(spec.image_ref.clone());
    args
}

/// Build the shell script a helper container runs to finish a self-update:
/// wait for the Updater's own container to exit, then perform exactly the
/// STOP_OLD/START_NEW swap `apply_step` would otherwise do in-process,
/// finally removing itself when `remove_helper_container` is set. Mounts
/// (and with them, the container engine socket) are inherited from the
/// original container, so this script only needs a shell and the engine's
/// CLI, both present in `helper_image`.
fn self_update_script(
    original: &Container,
    backup: &str,
    target_ref: &str,
    spec_args: &[String],
    helper_name: &str,
    remove_self: bool,
) -> Vec<String> {
    let mut script = String::new();
    script.push_str(&format!(
        "while docker inspect {id} >/dev/null 2>&1; do sleep 1; done\n",
        id = original.id
    ));
    script.push_str(&format!("docker rename {} {}\n", original.id, backup));
    script.push_str(&format!("docker stop {} || true\n", backup));
    script.push_str(&format!("docker pull {}\n", target_ref));
    script.push_str("docker create ");
    script.push_str(&spec_args.join(" "));
    script.push('\n');
    script.push_str(&format!("docker start {}\n", original.name));
    if remove_self {
        script.push_str(&format!("docker rm -f {}\n", helper_name));
    }
    vec!["sh".to_string(), "-c".to_string(), script]
}

enum StepFault {
    PullFailed(String),
    StartFailed(String),
    HookFailed(ScriptType, Option<i32>),
    DidNotStabilize,
}

impl StepFault {
    fn reason(&self) -> String {
        match self {
            StepFault::PullFailed(msg) => format!("image pull failed: {msg}"),
            StepFault::StartFailed(msg) => format!("container failed to start: {msg}"),
            StepFault::HookFailed(kind, code) => format!("{kind:?} hook failed with exit code {code:?}"),
            StepFault::DidNotStabilize => "container did not stabilize in time".to_string(),
        }
    }
}

struct StepRun {
    script_results: Vec<ScriptResult>,
    duration: Duration,
    outcome: StepOutcome,
}

enum StepOutcome {
    Applied,
    /// No mutation occurred (pre-hook abort, or the authoritative
    /// `minImageAge` re-check failing at pull time). §4.10 PRE: "ABORT (no
    /// changes made; state `skipped`)".
    Skipped(String),
    RolledBack,
    RollbackFailed(String),
}

/// Apply one plan step against `container`, running hooks, pull, swap, and
/// verification, rolling back on any fault per §7.
fn apply_step(
    driver: &dyn ContainerDriver,
    container: &Container,
    step: &Step,
    options: &ExecutorOptions,
    reporter: &mut dyn Reporter,
) -> StepRun {
    let start = Instant::now();
    let mut script_results = Vec::new();

    if options.dry_run {
        reporter.info(&format!(
            "[dry-run] would update {} to {}",
            container.name, step.target.version.raw
        ));
        return StepRun {
            script_results,
            duration: start.elapsed(),
            outcome: StepOutcome::Applied,
        };
    }

    let target_ref = format!("{}@{}", container.image, step.target.digest);

    // PRE
    if options.pre_hook.enabled {
        if let Some(result) = run_hook(
            &options.scripts_dir,
            &container.name,
            ScriptType::Pre,
            options.pre_hook.timeout,
            options.dry_run,
            &options.log_level,
            &options.config_dir,
        ) {
            let ok = hook_succeeded(&result);
            script_results.push(result);
            if !ok && !options.pre_hook.continue_on_failure {
                reporter.error(&format!("pre hook failed for {}, aborting step", container.name));
                return StepRun {
                    script_results,
                    duration: start.elapsed(),
                    outcome: StepOutcome::Skipped("pre hook failed, aborting step".to_string()),
                };
            } else if !ok {
                reporter.warn(&format!(
                    "pre hook failed for {} but continueOnFailure is set",
                    container.name
                ));
            }
        }
    }

    // PULL, with an authoritative minImageAge re-check.
    let age = Utc::now().signed_duration_since(step.target.pushed_at);
    if age.to_std().unwrap_or(Duration::ZERO) < options.min_image_age {
        reporter.warn(&format!(
            "{} aged out of minImageAge between planning and execution",
            step.target.version.raw
        ));
        return StepRun {
            script_results,
            duration: start.elapsed(),
            outcome: StepOutcome::Skipped("image aged out of minImageAge before pull".to_string()),
        };
    }

    if let Err(e) = driver.pull_image(&target_ref) {
        reporter.error(&format!("pull failed for {target_ref}: {e}"));
        return StepRun {
            script_results,
            duration: start.elapsed(),
            outcome: StepOutcome::RolledBack,
        };
    }

    let backup = backup_name(&container.name);

    // STOP_OLD: rename to backup, strip auto-restart so a host reboot
    // mid-update can't resurrect the old container, then stop.
    if let Err(e) = driver.rename(&container.id, &backup) {
        reporter.error(&format!("rename to backup failed: {e}"));
        return StepRun {
            script_results,
            duration: start.elapsed(),
            outcome: StepOutcome::RolledBack,
        };
    }
    let _ = driver.set_restart_policy(&container.id, &RestartPolicy::No);
    if let Err(e) = driver.stop(&container.id, options.stop_timeout) {
        reporter.error(&format!("stop failed: {e}"));
        let outcome = rollback(driver, container, &backup, None, options, reporter);
        return StepRun { script_results, duration: start.elapsed(), outcome };
    }

    // START_NEW. The new image's own default env isn't introspected here
    // (the driver abstraction only surfaces a digest from `pull_image`),
    // so only the old container's vars are subject to exclude/preserve.
    let env = filter_env(
        &container.name,
        &container.env,
        &std::collections::BTreeMap::new(),
        &options.env_filter,
    );
    let spec = NewContainerSpec::from_update(container, &target_ref, env);

    let new_id = match driver.create_container(&spec) {
        Ok(id) => id,
        Err(e) => {
            reporter.error(&format!("create failed: {e}"));
            let outcome = rollback(driver, container, &backup, None, options, reporter);
            return StepRun { script_results, duration: start.elapsed(), outcome };
        }
    };

    if let Err(e) = driver.start(&new_id) {
        reporter.error(&format!("start failed: {e}"));
        let outcome = rollback(driver, container, &backup, Some(&new_id), options, reporter);
        return StepRun { script_results, duration: start.elapsed(), outcome };
    }

    // VERIFY
    if verify(driver, &new_id, options.verify_policy) == VerifyOutcome::DidNotStabilize {
        reporter.error(&format!("{} did not stabilize", container.name));
        let outcome = rollback(driver, container, &backup, Some(&new_id), options, reporter);
        return StepRun { script_results, duration: start.elapsed(), outcome };
    }

    // POST
    if options.post_hook.enabled {
        if let Some(result) = run_hook(
            &options.scripts_dir,
            &container.name,
            ScriptType::Post,
            options.post_hook.timeout,
            options.dry_run,
            &options.log_level,
            &options.config_dir,
        ) {
            let ok = hook_succeeded(&result);
            script_results.push(result);
            if !ok && options.post_hook.rollback_on_failure {
                reporter.error(&format!("post hook failed for {}, rolling back", container.name));
                let outcome = rollback(driver, container, &backup, Some(&new_id), options, reporter);
                return StepRun { script_results, duration: start.elapsed(), outcome };
            } else if !ok {
                reporter.warn(&format!(
                    "post hook failed for {} but rollbackOnFailure is not set",
                    container.name
                ));
            }
        }
    }

    // COMMIT: the backup stays parked under its `_bak_cu_` name, exited,
    // for the post-run prune policy to reap (§4.10 "Prune policy").
    if !options.delay_between_updates.is_zero() {
        std::thread::sleep(options.delay_between_updates);
    }

    StepRun {
        script_results,
        duration: start.elapsed(),
        outcome: StepOutcome::Applied,
    }
}

/// ROLLBACK: stop+remove the new container if it was created, rename the
/// backup (still `original.id`, parked under its backup name) back to its
/// original name, restore its restart policy, start it, re-verify
/// best-effort (no hook re-run per §7).
fn rollback(
    driver: &dyn ContainerDriver,
    original: &Container,
    backup: &str,
    new_id: Option<&str>,
    options: &ExecutorOptions,
    reporter: &mut dyn Reporter,
) -> StepOutcome {
    reporter.warn(&format!("rolling back {} from backup {backup}", original.name));

    if let Some(new_id) = new_id {
        let _ = driver.stop(new_id, options.stop_timeout);
        let _ = driver.remove(new_id);
    }

    if let Err(e) = driver.rename(&original.id, &original.name) {
        reporter.error(&format!("rollback rename failed: {e}"));
        return StepOutcome::RollbackFailed(e.to_string());
    }

    if let Err(e) = driver.set_restart_policy(&original.id, &original.restart_policy) {
        reporter.warn(&format!("could not restore restart policy: {e}"));
    }

    if let Err(e) = driver.start(&original.id) {
        reporter.error(&format!("rollback start failed: {e}"));
        return StepOutcome::RollbackFailed(e.to_string());
    }

    if verify(driver, &original.id, options.verify_policy) == VerifyOutcome::DidNotStabilize {
        reporter.warn(&format!("{} did not re-stabilize after rollback", original.name));
    }

    StepOutcome::RolledBack
}

/// Execute a self-update: the container being updated is the Updater's
/// own. Everything up to and including the pre-hook still runs in-process
/// (the Updater's own container is still alive to run it), but the
/// stop/start swap itself is handed off to a helper container, since the
/// Updater stopping its own container would kill this function mid-step.
/// Only the chain's final target is applied — intermediate progressive
/// steps can't be observed once this process's container exits, so there
/// is nothing to verify them against.
pub fn execute_self_update(
    driver: &dyn ContainerDriver,
    container: &Container,
    plan: &UpdatePlan,
    options: &ExecutorOptions,
    self_update: &SelfUpdateOptions,
    reporter: &mut dyn Reporter,
) -> UpdateOutcome {
    if plan.is_empty() {
        return UpdateOutcome {
            container: container.name.clone(),
            plan: None,
            steps_applied: 0,
            final_state: FinalState::Skipped,
            reason: Some("empty plan".to_string()),
            durations: Durations::default(),
            script_results: Vec::new(),
        };
    }

    let total_start = Instant::now();
    let step = plan.steps.last().expect("non-empty plan");
    let mut script_results = Vec::new();

    if options.dry_run {
        reporter.info(&format!(
            "[dry-run] would self-update {} to {} via helper container",
            container.name, step.target.version.raw
        ));
        return UpdateOutcome {
            container: container.name.clone(),
            plan: Some(plan.clone()),
            steps_applied: plan.steps.len(),
            final_state: FinalState::Updated,
            reason: None,
            durations: Durations {
                total: total_start.elapsed(),
                per_step: Vec::new(),
            },
            script_results,
        };
    }

    if options.pre_hook.enabled {
        if let Some(result) = run_hook(
            &options.scripts_dir,
            &container.name,
            ScriptType::Pre,
            options.pre_hook.timeout,
            options.dry_run,
            &options.log_level,
            &options.config_dir,
        ) {
            let ok = hook_succeeded(&result);
            script_results.push(result);
            if !ok && !options.pre_hook.continue_on_failure {
                reporter.error(&format!(
                    "pre hook failed for {}, aborting self-update",
                    container.name
                ));
                return UpdateOutcome {
                    container: container.name.clone(),
                    plan: Some(plan.clone()),
                    steps_applied: 0,
                    final_state: FinalState::RolledBack,
                    reason: Some("pre hook failed".to_string()),
                    durations: Durations {
                        total: total_start.elapsed(),
                        per_step: Vec::new(),
                    },
                    script_results,
                };
            }
        }
    }

    let target_ref = format!("{}@{}", container.image, step.target.digest);
    let backup = backup_name(&container.name);
    let env = filter_env(
        &container.name,
        &container.env,
        &std::collections::BTreeMap::new(),
        &options.env_filter,
    );
    let spec = NewContainerSpec::from_update(container, &target_ref, env);
    let create_args = render_create_args(&spec);

    let helper_name = helper_container_name(&container.name);
    let script = self_update_script(
        container,
        &backup,
        &target_ref,
        &create_args,
        &helper_name,
        self_update.remove_helper_container,
    );

    let mut helper_spec = spec.clone();
    helper_spec.name = helper_name.clone();
    helper_spec.image_ref = self_update.helper_image.clone();
    helper_spec.restart_policy = RestartPolicy::No;
    helper_spec
        .labels
        .insert(SELF_UPDATE_HELPER_LABEL.to_string(), "true".to_string());
    helper_spec.command = Some(script);

    let helper_id = match driver.create_container(&helper_spec) {
        Ok(id) => id,
        Err(e) => {
            reporter.error(&format!(
                "failed to create self-update helper for {}: {e}",
                container.name
            ));
            return UpdateOutcome {
                container: container.name.clone(),
                plan: Some(plan.clone()),
                steps_applied: 0,
                final_state: FinalState::RolledBack,
                reason: Some(format!("helper container creation failed: {e}")),
                durations: Durations {
                    total: total_start.elapsed(),
                    per_step: Vec::new(),
                },
                script_results,
            };
        }
    };

    if let Err(e) = driver.start(&helper_id) {
        reporter.error(&format!("failed to start self-update helper: {e}"));
        return UpdateOutcome {
            container: container.name.clone(),
            plan: Some(plan.clone()),
            steps_applied: 0,
            final_state: FinalState::RolledBack,
            reason: Some(format!("helper container failed to start: {e}")),
            durations: Durations {
                total: total_start.elapsed(),
                per_step: Vec::new(),
            },
            script_results,
        };
    }

    reporter.info(&format!(
        "self-update for {} delegated to helper container {helper_name}",
        container.name
    ));

    UpdateOutcome {
        container: container.name.clone(),
        plan: Some(plan.clone()),
        steps_applied: plan.steps.len(),
        final_state: FinalState::Updated,
        reason: Some(format!("swap delegated to helper container {helper_name}")),
        durations: Durations {
            total: total_start.elapsed(),
            per_step: vec![total_start.elapsed()],
        },
        script_results,
    }
}

/// Execute an entire plan for `container`. Progressive chains roll back
/// independently per step: a later step's failure leaves earlier,
/// already-applied steps in place rather than unwinding the whole chain.
pub fn execute_plan(
    driver: &dyn ContainerDriver,
    container: &Container,
    plan: &UpdatePlan,
    options: &ExecutorOptions,
    reporter: &mut dyn Reporter,
) -> UpdateOutcome {
    if plan.is_empty() {
        return UpdateOutcome {
            container: container.name.clone(),
            plan: None,
            steps_applied: 0,
            final_state: FinalState::Skipped,
            reason: Some("empty plan".to_string()),
            durations: Durations::default(),
            script_results: Vec::new(),
        };
    }

    let total_start = Instant::now();
    let mut per_step = Vec::new();
    let mut script_results = Vec::new();
    let mut steps_applied = 0usize;
    let mut final_state = FinalState::Updated;
    let mut reason = None;

    for step in &plan.steps {
        let run = apply_step(driver, container, step, options, reporter);
        per_step.push(run.duration);
        script_results.extend(run.script_results);

        match run.outcome {
            StepOutcome::Applied => {
                steps_applied += 1;
            }
            StepOutcome::Skipped(msg) => {
                final_state = if steps_applied == 0 {
                    FinalState::Skipped
                } else {
                    FinalState::Updated
                };
                reason = Some(format!(
                    "chain stopped at step {} of {}: {}",
                    steps_applied + 1,
                    plan.steps.len(),
                    msg
                ));
                break;
            }
            StepOutcome::RolledBack => {
                final_state = if steps_applied == 0 {
                    FinalState::RolledBack
                } else {
                    FinalState::Updated
                };
                reason = Some(format!(
                    "chain stopped at step {} of {}: rolled back",
                    steps_applied + 1,
                    plan.steps.len()
                ));
                break;
            }
            StepOutcome::RollbackFailed(msg) => {
                final_state = FinalState::AbortedInconsistent;
                reason = Some(format!("rollback failed, container left inconsistent: {msg}"));
                break;
            }
        }
    }

    if reason.is_none() && steps_applied == plan.steps.len() {
        final_state = FinalState::Updated;
    }

    UpdateOutcome {
        container: container.name.clone(),
        plan: Some(plan.clone()),
        steps_applied,
        final_state,
        reason,
        durations: Durations {
            total: total_start.elapsed(),
            per_step,
        },
        script_results,
    }
}
