//! Container step executor.
//!
//! Steps with an `image` run under docker or podman with a locked-down
//! default policy: non-root user, read-only root filesystem, all
//! capabilities dropped, no-new-privileges, no network. Each default can be
//! relaxed per step in the manifest.

use indexmap::IndexMap;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tako_core::manifest::ResourceLimits;

use super::{ExecError, ExecOutcome, Result};

/// UID containers run as unless the step relaxes it.
const DEFAULT_UID: &str = "1001";
/// Utilization fraction that triggers a warning.
const WARN_THRESHOLD: f64 = 90.0;
/// How often the resource sampler polls.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// What to do when a sampled limit is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreachAction {
    #[default]
    Warn,
    Kill,
    Queue,
}

/// A detected container runtime.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    pub name: String,
    pub binary: PathBuf,
}

/// Auto-detect docker, then podman.
pub fn detect_runtime() -> Result<ContainerRuntime> {
    for name in ["docker", "podman"] {
        if let Ok(binary) = which::which(name) {
            return Ok(ContainerRuntime {
                name: name.to_string(),
                binary,
            });
        }
    }
    Err(ExecError::RuntimeMissing)
}

/// Fully-resolved description of one container invocation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name, used for sampling and kill.
    pub name: String,
    pub image: String,
    /// Shell command run inside the container.
    pub command: String,
    pub network: Option<String>,
    pub capabilities: Vec<String>,
    pub security_profile: Option<String>,
    pub volumes: Vec<String>,
    pub env: IndexMap<String, String>,
    /// Host directory mounted read-write at `/workspace`.
    pub workspace: PathBuf,
    pub resources: ResourceLimits,
    pub breach_action: BreachAction,
}

fn image_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]*$").unwrap())
}

fn network_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]*$").unwrap())
}

pub fn validate_image(image: &str) -> Result<()> {
    let valid = image_regex().is_match(image)
        && !image.contains("..")
        && !image.starts_with('.')
        && !image.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(ExecError::InvalidImage(image.to_string()))
    }
}

pub fn validate_network(network: &str) -> Result<()> {
    if matches!(network, "none" | "host" | "bridge" | "default") {
        return Ok(());
    }
    if network_regex().is_match(network) {
        Ok(())
    } else {
        Err(ExecError::InvalidNetwork(network.to_string()))
    }
}

/// Validate a `host:container[:mode]` volume entry and default it to
/// read-only. Host paths must be absolute and free of `..` segments.
fn normalize_volume(raw: &str) -> Result<String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(ExecError::InvalidVolume(raw.to_string()));
    }
    let (host, container) = (parts[0], parts[1]);
    if !host.starts_with('/') || !container.starts_with('/') {
        return Err(ExecError::InvalidVolume(raw.to_string()));
    }
    if host.split('/').any(|seg| seg == "..") || container.split('/').any(|seg| seg == "..") {
        return Err(ExecError::InvalidVolume(raw.to_string()));
    }
    let mode = match parts.get(2) {
        Some(&"ro") | None => "ro",
        Some(&"rw") => "rw",
        Some(_) => return Err(ExecError::InvalidVolume(raw.to_string())),
    };
    Ok(format!("{host}:{container}:{mode}"))
}

/// Assemble the `run` argument vector. Pure, so policy is testable without
/// a runtime installed.
pub fn build_run_args(runtime: &ContainerRuntime, spec: &ContainerSpec) -> Result<Vec<String>> {
    validate_image(&spec.image)?;
    let network = spec.network.as_deref().unwrap_or("none");
    validate_network(network)?;

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        spec.name.clone(),
        "--user".into(),
        DEFAULT_UID.into(),
        "--read-only".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--network".into(),
        network.into(),
    ];

    for capability in &spec.capabilities {
        args.push("--cap-add".into());
        args.push(capability.clone());
    }
    if let Some(profile) = &spec.security_profile {
        args.push("--security-opt".into());
        args.push(format!("seccomp={profile}"));
    }

    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(normalize_volume(volume)?);
    }
    args.push("-v".into());
    args.push(format!("{}:/workspace:rw", spec.workspace.display()));
    args.push("-w".into());
    args.push("/workspace".into());

    args.push("-e".into());
    args.push("TAKO_CONTAINER=true".into());
    args.push("-e".into());
    args.push(format!("TAKO_RUNTIME={}", runtime.name));
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    if let Some(cpu) = &spec.resources.cpu_limit {
        args.push("--cpus".into());
        args.push(cpu.clone());
    }
    if let Some(memory) = &spec.resources.memory_limit {
        args.push("--memory".into());
        args.push(memory.clone());
    }

    args.push(spec.image.clone());
    args.push("/bin/sh".into());
    args.push("-c".into());
    args.push(spec.command.clone());
    Ok(args)
}

/// Run the container to completion, sampling resource usage on the side.
pub async fn run_container(
    runtime: &ContainerRuntime,
    spec: &ContainerSpec,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let args = build_run_args(runtime, spec)?;
    debug!(runtime = %runtime.name, image = %spec.image, "starting container step");

    let mut child = Command::new(&runtime.binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::RuntimeFailed(e.to_string()))?;

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

    let sampler_cancel = CancellationToken::new();
    let sampler = tokio::spawn(sample_usage(
        runtime.clone(),
        spec.name.clone(),
        spec.breach_action,
        sampler_cancel.clone(),
    ));

    let timeout = spec
        .resources
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60 * 60 * 24 * 30));
    let start = Instant::now();

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| ExecError::RuntimeFailed(e.to_string()))?
        }
        () = cancel.cancelled() => {
            warn!(container = %spec.name, "cancelling container step");
            stop_container(runtime, &spec.name).await;
            sampler_cancel.cancel();
            let _ = sampler.await;
            return Err(ExecError::Cancelled);
        }
        () = tokio::time::sleep(timeout) => {
            warn!(container = %spec.name, timeout_sec = timeout.as_secs(), "container step timed out");
            stop_container(runtime, &spec.name).await;
            sampler_cancel.cancel();
            let _ = sampler.await;
            return Err(ExecError::Timeout(timeout.as_secs()));
        }
    };

    sampler_cancel.cancel();
    let breached = sampler.await.unwrap_or(false);
    if breached && spec.breach_action == BreachAction::Kill {
        return Err(ExecError::ResourceLimit(format!(
            "container {} exceeded its resource limits",
            spec.name
        )));
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ExecOutcome {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// `stop` first for the grace period, then `kill` if the container is
/// still up.
async fn stop_container(runtime: &ContainerRuntime, name: &str) {
    let _ = Command::new(&runtime.binary)
        .args(["stop", "--time", "5", name])
        .output()
        .await;
    let _ = Command::new(&runtime.binary)
        .args(["kill", name])
        .output()
        .await;
}

/// Poll `stats` until cancelled. Returns whether a limit breach was seen.
async fn sample_usage(
    runtime: ContainerRuntime,
    name: String,
    breach_action: BreachAction,
    cancel: CancellationToken,
) -> bool {
    let mut breached = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return breached,
            () = tokio::time::sleep(SAMPLE_INTERVAL) => {}
        }
        let output = Command::new(&runtime.binary)
            .args(["stats", "--no-stream", "--format", "{{.CPUPerc}} {{.MemPerc}}", &name])
            .output()
            .await;
        let Ok(output) = output else { continue };
        if !output.status.success() {
            continue;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        if let Some((cpu, mem)) = parse_stats_line(text.trim()) {
            for (kind, pct) in [("cpu", cpu), ("memory", mem)] {
                if pct >= 100.0 {
                    breached = true;
                    match breach_action {
                        BreachAction::Kill => {
                            warn!(container = %name, kind, pct, "resource limit breached, killing");
                            stop_container(&runtime, &name).await;
                            return true;
                        }
                        BreachAction::Warn | BreachAction::Queue => {
                            warn!(container = %name, kind, pct, "resource limit breached");
                        }
                    }
                } else if pct >= WARN_THRESHOLD {
                    info!(container = %name, kind, pct, "resource utilization above 90%");
                }
            }
        }
    }
}

/// Parse `"12.34% 56.78%"` from `stats` output.
fn parse_stats_line(line: &str) -> Option<(f64, f64)> {
    let mut parts = line.split_whitespace();
    let cpu = parts.next()?.trim_end_matches('%').parse().ok()?;
    let mem = parts.next()?.trim_end_matches('%').parse().ok()?;
    Some((cpu, mem))
}
