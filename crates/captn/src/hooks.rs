//! Hook Runner (C7): resolve and execute pre/post scripts around an update
//! step. See SPEC_FULL.md §4.7.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::run_command_with_timeout;
use crate::types::{ScriptResult, ScriptType};

/// Find the script to run for `container_name`/`script_type` under
/// `scripts_dir`: a container-specific script wins over the generic one;
/// absence of either is not an error (§4.7 "hooks are optional").
pub fn resolve_script(scripts_dir: &Path, container_name: &str, script_type: ScriptType) -> Option<PathBuf> {
    let suffix = match script_type {
        ScriptType::Pre => "pre",
        ScriptType::Post => "post",
    };

    let specific = scripts_dir.join(format!("{container_name}_{suffix}.sh"));
    if specific.is_file() {
        return Some(specific);
    }

    let generic = scripts_dir.join(format!("{suffix}.sh"));
    if generic.is_file() {
        return Some(generic);
    }

    None
}

/// Run the resolved script, if one exists, with the fixed hook-env
/// contract from §4.7: only `CAPTN_CONTAINER_NAME`, `CAPTN_SCRIPT_TYPE`,
/// `CAPTN_DRY_RUN`, `CAPTN_LOG_LEVEL`, `CAPTN_CONFIG_DIR`, and
/// `CAPTN_SCRIPTS_DIR` are injected. Returns `None` when no script exists
/// for this container/type.
#[allow(clippy::too_many_arguments)]
pub fn run_hook(
    scripts_dir: &Path,
    container_name: &str,
    script_type: ScriptType,
    timeout: Duration,
    dry_run: bool,
    log_level: &str,
    config_dir: &Path,
) -> Option<ScriptResult> {
    let script = resolve_script(scripts_dir, container_name, script_type)?;

    let mut env = BTreeMap::new();
    env.insert("CAPTN_CONTAINER_NAME".to_string(), container_name.to_string());
    env.insert(
        "CAPTN_SCRIPT_TYPE".to_string(),
        match script_type {
            ScriptType::Pre => "pre".to_string(),
            ScriptType::Post => "post".to_string(),
        },
    );
    env.insert(
        "CAPTN_DRY_RUN".to_string(),
        if dry_run { "1".to_string() } else { "0".to_string() },
    );
    env.insert("CAPTN_LOG_LEVEL".to_string(), log_level.to_string());
    env.insert(
        "CAPTN_CONFIG_DIR".to_string(),
        config_dir.display().to_string(),
    );
    env.insert(
        "CAPTN_SCRIPTS_DIR".to_string(),
        scripts_dir.display().to_string(),
    );

    let working_dir = script.parent().unwrap_or(scripts_dir);
    let output = run_command_with_timeout(
        script.to_string_lossy().as_ref(),
        &[],
        working_dir,
        &env,
        timeout,
    );

    match output {
        Ok(out) => Some(ScriptResult {
            script_type,
            path: script.display().to_string(),
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            stdout: out.stdout,
            stderr: out.stderr,
            duration: out.duration,
        }),
        Err(e) => Some(ScriptResult {
            script_type,
            path: script.display().to_string(),
            exit_code: None,
            timed_out: false,
            stdout: String::new(),
            stderr: format!("failed to spawn hook: {e}"),
            duration: Duration::ZERO,
        }),
    }
}

pub fn hook_succeeded(result: &ScriptResult) -> bool {
    result.exit_code == Some(0) && !result.timed_out
}
