//! Implementations of the control CLI verbs. Exit codes: 0 success,
//! 1 partial failure, 2 bad arguments (clap handles its own usage errors).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crawlctl_core::{ControlConfig, RunState, Store};
use crawlctl_engine::{RunEvent, start_control_plane};

use crate::pidfile;
use crate::services::{ServiceSpec, load_services, select};
use crate::supervise::stop_process_group;

fn selected_services(data_root: &Path, filter: &[String]) -> anyhow::Result<Result<Vec<ServiceSpec>, String>> {
    Ok(select(load_services(data_root)?, filter))
}

/// `start`: launch the watchdog detached; it spawns and supervises the
/// services.
pub async fn start(data_root: &Path, filter: &[String]) -> anyhow::Result<i32> {
    let services = match selected_services(data_root, filter)? {
        Ok(services) => services,
        Err(msg) => {
            eprintln!("error: {msg}");
            return Ok(2);
        }
    };

    let supervisor_pid = pidfile::pid_path(data_root, "supervisor");
    if let Some(pid) = pidfile::live_pid(&supervisor_pid) {
        println!("supervisor already running (pid {pid})");
        return Ok(0);
    }

    let logs_dir = data_root.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("supervisor.log"))?;
    let log_err = log.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut command = tokio::process::Command::new(exe);
    command
        .arg("supervise")
        .arg("--data-root")
        .arg(data_root);
    if !filter.is_empty() {
        command.arg("--services").arg(filter.join(","));
    }
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()?;
    let pid = child.id().unwrap_or_default();
    pidfile::write(&supervisor_pid, pid)?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    if pidfile::alive(pid) {
        println!("supervisor started (pid {pid}), services: {}", names(&services));
        Ok(0)
    } else {
        eprintln!(
            "error: supervisor exited immediately; see {}",
            logs_dir.join("supervisor.log").display()
        );
        Ok(1)
    }
}

/// `stop`: watchdog first so nothing resurrects the units mid-stop, then any
/// units still alive, in reverse order.
pub async fn stop(data_root: &Path, filter: &[String]) -> anyhow::Result<i32> {
    let services = match selected_services(data_root, filter)? {
        Ok(services) => services,
        Err(msg) => {
            eprintln!("error: {msg}");
            return Ok(2);
        }
    };
    let cfg = ControlConfig::from_env(data_root)?;
    let full_stop = filter.is_empty();
    let mut failures = 0;

    let supervisor_pid_path = pidfile::pid_path(data_root, "supervisor");
    if let Some(pid) = pidfile::live_pid(&supervisor_pid_path) {
        if full_stop {
            // The supervisor tears its units down in reverse order itself.
            let budget = cfg.shutdown_grace * (services.len() as u32 + 2);
            if stop_process_group(pid, budget).await {
                pidfile::remove(&supervisor_pid_path);
                println!("supervisor stopped");
            } else {
                eprintln!("error: supervisor (pid {pid}) did not exit");
                failures += 1;
            }
        } else {
            eprintln!(
                "warning: supervisor is running and may restart the stopped services; \
                 run `crawlctl stop` without --services to stop everything"
            );
        }
    } else {
        pidfile::remove(&supervisor_pid_path);
    }

    for spec in services.iter().rev() {
        let path = pidfile::pid_path(data_root, &spec.name);
        match pidfile::live_pid(&path) {
            Some(pid) => {
                if stop_process_group(pid, cfg.shutdown_grace).await {
                    println!("{} stopped", spec.name);
                    pidfile::remove(&path);
                } else {
                    eprintln!("error: {} (pid {pid}) did not exit", spec.name);
                    failures += 1;
                }
            }
            None => pidfile::remove(&path),
        }
    }

    Ok(if failures > 0 { 1 } else { 0 })
}

pub async fn restart(data_root: &Path, filter: &[String]) -> anyhow::Result<i32> {
    let stop_code = stop(data_root, filter).await?;
    if stop_code == 2 {
        return Ok(2);
    }
    let start_code = start(data_root, filter).await?;
    Ok(stop_code.max(start_code))
}

/// `status`: one line per unit; exit 1 when an enabled unit is down.
pub async fn status(data_root: &Path, filter: &[String]) -> anyhow::Result<i32> {
    let services = match selected_services(data_root, filter)? {
        Ok(services) => services,
        Err(msg) => {
            eprintln!("error: {msg}");
            return Ok(2);
        }
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    println!("{:<16} {:>8}  {}", "SERVICE", "PID", "STATE");
    let supervisor_alive = report_unit(data_root, "supervisor", None, &http).await;
    let mut all_up = true;
    for spec in &services {
        let up = report_unit(
            data_root,
            &spec.name,
            spec.health_url.as_deref(),
            &http,
        )
        .await;
        if spec.enabled && !up {
            all_up = false;
        }
    }
    // The watchdog being down is a partial failure even with units still up.
    Ok(if all_up && supervisor_alive { 0 } else { 1 })
}

async fn report_unit(
    data_root: &Path,
    name: &str,
    health_url: Option<&str>,
    http: &reqwest::Client,
) -> bool {
    let path = pidfile::pid_path(data_root, name);
    match (pidfile::read(&path), pidfile::live_pid(&path)) {
        (_, Some(pid)) => {
            let state = match health_url {
                Some(url) => match http.get(url).send().await {
                    Ok(res) if res.status().is_success() => "running (healthy)".to_string(),
                    Ok(res) => format!("running (health: http {})", res.status().as_u16()),
                    Err(_) => "running (health: unreachable)".to_string(),
                },
                None => "running".to_string(),
            };
            println!("{name:<16} {pid:>8}  {state}");
            true
        }
        (Some(pid), None) => {
            println!("{name:<16} {pid:>8}  dead (stale pid file)");
            false
        }
        (None, _) => {
            println!("{name:<16} {:>8}  stopped", "-");
            false
        }
    }
}

/// `monitor`: poll the run store and print run lifecycle lines until
/// interrupted.
pub async fn monitor(data_root: &Path, interval_sec: u64) -> anyhow::Result<i32> {
    let cfg = ControlConfig::from_env(data_root)?;
    tokio::fs::create_dir_all(&cfg.data_root).await?;
    let store = Store::open(&cfg.db_path()).await?;
    let runs = store.runs();

    let interval = Duration::from_secs(interval_sec.max(1));
    let mut last_counters: HashMap<String, (RunState, i64, i64, i64)> = HashMap::new();
    let mut reported_terminal: HashSet<String> = HashSet::new();
    let started_watching = Utc::now();

    println!("watching runs under {} (ctrl-c to exit)", data_root.display());
    loop {
        for run in runs.list_active().await? {
            let entry = (run.state, run.items_count, run.requests_count, run.error_count);
            if last_counters.get(&run.id) != Some(&entry) {
                println!(
                    "{} run {} {} {} items={} requests={} errors={}",
                    Utc::now().format("%H:%M:%S"),
                    short(&run.id),
                    run.spider_name,
                    run.state,
                    run.items_count,
                    run.requests_count,
                    run.error_count,
                );
                last_counters.insert(run.id.clone(), entry);
            }
        }
        for run in runs.list_recent_terminal(started_watching).await? {
            if !reported_terminal.insert(run.id.clone()) {
                continue;
            }
            last_counters.remove(&run.id);
            let duration = run
                .duration()
                .map(|d| format!(" ({:.1}s)", d.num_milliseconds() as f64 / 1000.0))
                .unwrap_or_default();
            let error = run
                .error_message
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default();
            println!(
                "{} run {} {} {} items={} requests={}{duration}{error}",
                Utc::now().format("%H:%M:%S"),
                short(&run.id),
                run.spider_name,
                run.state,
                run.items_count,
                run.requests_count,
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(0)
}

/// `serve`: the execution control plane in the foreground. This is the unit
/// the supervisor watches.
pub async fn serve(data_root: &Path) -> anyhow::Result<i32> {
    let cfg = ControlConfig::from_env(data_root)?;
    tokio::fs::create_dir_all(&cfg.data_root).await?;
    let store = Store::open(&cfg.db_path()).await?;

    let own_pid_path = pidfile::pid_path(data_root, "engine");
    pidfile::write(&own_pid_path, std::process::id())?;

    let handle = start_control_plane(store, cfg);
    let mut events = handle.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    handle.request_stop();
    let result = handle.wait().await;
    event_log.abort();
    pidfile::remove(&own_pid_path);
    result?;
    Ok(0)
}

async fn shutdown_signal() {
    let term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
    match term {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable; ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn log_event(event: RunEvent) {
    match event {
        RunEvent::RunStarted { run_id, spider, pid, .. } => {
            info!(run_id = %short(&run_id), spider = %spider, pid, "run started");
        }
        RunEvent::RunProgress { run_id, items_count, error_count, .. } => {
            info!(run_id = %short(&run_id), items = items_count, errors = error_count, "progress");
        }
        RunEvent::RunFinished { run_id, state, items_count, duration_ms } => {
            info!(run_id = %short(&run_id), %state, items = items_count, duration_ms, "run finished");
        }
        RunEvent::RunStateChanged { run_id, state, error_message } => {
            info!(run_id = %short(&run_id), %state, error = error_message.as_deref().unwrap_or(""), "state change");
        }
        RunEvent::IngestDegraded { run_id } => {
            warn!(run_id = %short(&run_id), "ingest degraded; spilling to backup files");
        }
        RunEvent::OutputMissing { run_id } => {
            warn!(run_id = %short(&run_id), "no output file within wait window");
        }
        RunEvent::OutputVanished { run_id } => {
            warn!(run_id = %short(&run_id), "output file vanished");
        }
        RunEvent::ScheduleFired { schedule_id, spider_id, .. } => {
            info!(schedule_id = %short(&schedule_id), spider_id = %short(&spider_id), "schedule fired");
        }
        RunEvent::Warning { message } => warn!("{message}"),
        RunEvent::Error { message } => warn!("{message}"),
        RunEvent::Started | RunEvent::StopRequested | RunEvent::Stopped => {}
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn names(services: &[ServiceSpec]) -> String {
    services
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
