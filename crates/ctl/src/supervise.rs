//! Process supervisor: keeps the control-plane daemon and collaborator
//! services alive under faults.
//!
//! Identity is derived from PID files and the services config, never from
//! in-memory state, so the watchdog itself can be restarted at any point and
//! adopt whatever is already running. It never touches run rows; data-level
//! repair belongs to the reconciliation engine inside the control plane.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crawlctl_core::ControlConfig;

use crate::pidfile;
use crate::services::ServiceSpec;

const HEALTH_TICK: Duration = Duration::from_secs(5);
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(2);

struct Unit {
    spec: ServiceSpec,
    pid_path: PathBuf,
    log_path: PathBuf,
    child: Option<tokio::process::Child>,
    adopted_pid: Option<u32>,
    ever_started: bool,
    restarts: VecDeque<Instant>,
    suspended: bool,
}

impl Unit {
    fn new(spec: ServiceSpec, data_root: &Path) -> Self {
        Self {
            pid_path: pidfile::pid_path(data_root, &spec.name),
            log_path: data_root.join("logs").join(format!("{}.log", spec.name)),
            spec,
            child: None,
            adopted_pid: None,
            ever_started: false,
            restarts: VecDeque::new(),
            suspended: false,
        }
    }

    fn current_pid(&mut self) -> Option<u32> {
        if let Some(child) = &mut self.child {
            // Reap if it exited so a dead child does not read as alive.
            if matches!(child.try_wait(), Ok(Some(_))) {
                self.child = None;
            } else {
                return child.id();
            }
        }
        self.adopted_pid.filter(|pid| pidfile::alive(*pid))
    }

    fn spawn(&mut self) -> std::io::Result<()> {
        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        let child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        pidfile::write(&self.pid_path, pid)?;

        info!(service = %self.spec.name, pid, "service started");
        self.child = Some(child);
        self.adopted_pid = None;
        self.ever_started = true;
        Ok(())
    }
}

pub async fn run(
    data_root: &Path,
    services: Vec<ServiceSpec>,
    cfg: &ControlConfig,
) -> anyhow::Result<i32> {
    let own_pid_path = pidfile::pid_path(data_root, "supervisor");
    pidfile::write(&own_pid_path, std::process::id())?;

    let http = reqwest::Client::builder()
        .timeout(HEALTH_PING_TIMEOUT)
        .build()?;

    let mut units: Vec<Unit> = services
        .into_iter()
        .filter(|s| s.enabled)
        .map(|s| Unit::new(s, data_root))
        .collect();

    // Adopt whatever a previous supervisor left running.
    for unit in &mut units {
        if let Some(pid) = pidfile::live_pid(&unit.pid_path) {
            info!(service = %unit.spec.name, pid, "adopted running service");
            unit.adopted_pid = Some(pid);
            unit.ever_started = true;
        }
    }

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut tick = tokio::time::interval(HEALTH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for unit in &mut units {
                    ensure_unit(unit, &http, cfg).await;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
        }
    }

    info!("supervisor stopping; shutting services down in reverse order");
    for unit in units.iter_mut().rev() {
        if let Some(pid) = unit.current_pid() {
            if stop_process_group(pid, cfg.shutdown_grace).await {
                info!(service = %unit.spec.name, pid, "service stopped");
            } else {
                warn!(service = %unit.spec.name, pid, "service survived SIGKILL");
            }
        }
        pidfile::remove(&unit.pid_path);
    }
    pidfile::remove(&own_pid_path);
    Ok(0)
}

async fn ensure_unit(unit: &mut Unit, http: &reqwest::Client, cfg: &ControlConfig) {
    if unit.suspended {
        return;
    }

    let pid = unit.current_pid();
    if let Some(pid) = pid {
        if http_healthy(unit, http).await {
            return;
        }
        warn!(service = %unit.spec.name, pid, "service unhealthy; recycling process group");
        stop_process_group(pid, cfg.shutdown_grace).await;
    }

    // Restart rate limit: the initial start is free, every respawn after a
    // death or recycle counts against the window.
    let now = Instant::now();
    if unit.ever_started {
        while let Some(front) = unit.restarts.front() {
            if now.duration_since(*front) > cfg.restart_window {
                unit.restarts.pop_front();
            } else {
                break;
            }
        }
        if unit.restarts.len() >= cfg.max_restarts as usize {
            unit.suspended = true;
            error!(
                service = %unit.spec.name,
                restarts = unit.restarts.len(),
                window_sec = cfg.restart_window.as_secs(),
                "StableFailure: restart budget exhausted; suspending until manual intervention"
            );
            return;
        }
        unit.restarts.push_back(now);
        warn!(service = %unit.spec.name, "restarting service");
    }

    if let Err(err) = unit.spawn() {
        error!(service = %unit.spec.name, error = %err, "service spawn failed");
    }
}

async fn http_healthy(unit: &Unit, http: &reqwest::Client) -> bool {
    let Some(url) = &unit.spec.health_url else {
        return true;
    };
    match http.get(url).send().await {
        Ok(res) => res.status().is_success(),
        Err(_) => false,
    }
}

/// SIGTERM the group, poll through the grace window, escalate to SIGKILL.
/// Returns whether the root process is gone.
pub async fn stop_process_group(pid: u32, grace: Duration) -> bool {
    signal_group(pid, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pidfile::alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    signal_group(pid, libc::SIGKILL);
    for _ in 0..20 {
        if !pidfile::alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pidfile::alive(pid)
}

fn signal_group(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        // Group first; fall back to the single pid when the group is gone
        // (adopted processes may not lead their own group).
        if libc::kill(-(pid as i32), signal) != 0 {
            libc::kill(pid as i32, signal);
        }
    }
}
