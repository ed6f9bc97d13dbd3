//! Shell step executor: `bash -c <command>` in the repository directory.

use indexmap::IndexMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecError, ExecOutcome, Result};

/// Upper bound standing in for "no timeout".
const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Run `command` under `bash -c` with a controlled environment.
///
/// Only `PATH` and `HOME` carry over from the host; everything else the
/// step sees comes from `env`. Cancellation and timeout both terminate the
/// process.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &IndexMap<String, String>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<ExecOutcome> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for key in ["PATH", "HOME"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    debug!(command, cwd = %cwd.display(), "spawning shell step");
    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let deadline = timeout.unwrap_or(NO_TIMEOUT);
    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            warn!(command, "cancelling shell step");
            let _ = child.kill().await;
            return Err(ExecError::Cancelled);
        }
        () = tokio::time::sleep(deadline) => {
            warn!(command, timeout_sec = deadline.as_secs(), "shell step timed out");
            let _ = child.kill().await;
            return Err(ExecError::Timeout(deadline.as_secs()));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ExecOutcome {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (IndexMap<String, String>, CancellationToken) {
        (IndexMap::new(), CancellationToken::new())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (env, cancel) = ctx();
        let outcome = run_shell("echo output1", Path::new("/tmp"), &env, &cancel, None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "output1\n");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn captures_stderr_and_nonzero_exit() {
        let (env, cancel) = ctx();
        let outcome = run_shell(
            "echo broken >&2; exit 3",
            Path::new("/tmp"),
            &env,
            &cancel,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr, "broken\n");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn step_env_is_visible_and_host_env_is_not() {
        let (mut env, cancel) = ctx();
        env.insert("STEP_VAR".into(), "hello".into());
        std::env::set_var("TAKO_TEST_LEAK", "leaked");
        let outcome = run_shell(
            "echo \"${STEP_VAR:-missing} ${TAKO_TEST_LEAK:-clean}\"",
            Path::new("/tmp"),
            &env,
            &cancel,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "hello clean\n");
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let (env, cancel) = ctx();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = run_shell("sleep 30", Path::new("/tmp"), &env, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_terminates_process() {
        let (env, cancel) = ctx();
        let err = run_shell(
            "sleep 30",
            Path::new("/tmp"),
            &env,
            &cancel,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (env, cancel) = ctx();
        let outcome = run_shell("pwd", dir.path(), &env, &cancel, None)
            .await
            .unwrap();
        let printed = outcome.stdout.trim();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(printed).canonicalize().unwrap(),
            expected
        );
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let outcome = ExecOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "a\nb\nc\nd\n".into(),
            duration_ms: 0,
        };
        assert_eq!(outcome.stderr_tail(2), "c\nd");
    }
}
