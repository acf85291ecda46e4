//! Child-process execution with a wall-clock timeout. Generalizes the
//! reference stack's `process.rs`, which only has a hard `kill()` on
//! deadline; here the deadline escalates SIGTERM then SIGKILL after a
//! short grace period, as §4.7 requires for hook scripts (and §4.10 for
//! driver-level stop timeouts).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run `program` with `args` in `working_dir`, with additional `env` vars
/// merged on top of the inherited environment, bounded by `timeout`.
///
/// On timeout: sends SIGTERM to the process group, waits up to
/// `KILL_GRACE`, then SIGKILL if it hasn't exited.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    working_dir: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        // New process group so a hook that spawns children can be
        // terminated as a unit.
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;

    let deadline = start + timeout;
    let mut timed_out = false;

    loop {
        match child.try_wait()? {
            Some(_status) => break,
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    terminate_with_grace(&mut child)?;
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    let status = child.wait()?;
    let exit_code = status.code();

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

#[cfg(unix)]
fn terminate_with_grace(child: &mut Child) -> std::io::Result<()> {
    // Negative pid targets the whole process group created by
    // `process_group(0)` above.
    let pgid = -(child.id() as i32);
    unsafe {
        libc::kill(pgid, libc::SIGTERM);
    }

    let grace_deadline = Instant::now() + KILL_GRACE;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= grace_deadline {
            unsafe {
                libc::kill(pgid, libc::SIGKILL);
            }
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(not(unix))]
fn terminate_with_grace(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_normally_under_timeout() {
        let output = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            Path::new("/tmp"),
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .expect("spawn");

        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn preserves_non_zero_exit_code() {
        let output = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "exit 7".to_string()],
            Path::new("/tmp"),
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .expect("spawn");

        assert_eq!(output.exit_code, Some(7));
    }

    #[test]
    fn injects_environment_variables() {
        let mut env = BTreeMap::new();
        env.insert("CAPTN_TEST_VAR".to_string(), "hi".to_string());

        let output = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "echo $CAPTN_TEST_VAR".to_string()],
            Path::new("/tmp"),
            &env,
            Duration::from_secs(5),
        )
        .expect("spawn");

        assert_eq!(output.stdout.trim(), "hi");
    }

    #[test]
    fn kills_process_exceeding_timeout() {
        let output = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            Path::new("/tmp"),
            &BTreeMap::new(),
            Duration::from_millis(200),
        )
        .expect("spawn");

        assert!(output.timed_out);
    }
}
