//! Per-run worker: spawns the crawl subprocess in its own process group,
//! wires the tailer and ingest pipeline to it, enforces wall-clock and
//! memory limits, and finalizes the run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crawlctl_core::fingerprint::FingerprintSpec;
use crawlctl_core::store::TransitionFields;
use crawlctl_core::{ControlConfig, Project, RecordStore, Run, RunState, RunStore};

use crate::api::StopReason;
use crate::broadcast::Update;
use crate::ingest::{IngestConfig, IngestPipeline};
use crate::proc::{command_fingerprint, rss_mb, signal_process_group};
use crate::stats::{read_stats, stats_path};
use crate::tailer::{TailerConfig, tail_file};

pub(crate) struct RunContext {
    pub run: Run,
    pub project: Project,
    pub cfg: ControlConfig,
    pub runs: RunStore,
    pub records: RecordStore,
    pub updates: mpsc::Sender<Update>,
    pub reconcile: mpsc::Sender<String>,
    pub cancel: watch::Receiver<Option<StopReason>>,
}

/// Drive one run from `PENDING` to a terminal state. Returns the run id for
/// supervisor bookkeeping; every failure path still finalizes the run row.
pub(crate) async fn run_worker(mut ctx: RunContext) -> String {
    let run_id = ctx.run.id.clone();
    let settings = ctx.run.settings.clone();

    let run_dir = ctx
        .run
        .output_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.cfg.runs_root().join(&run_id));
    if let Err(err) = tokio::fs::create_dir_all(&run_dir).await {
        fail_pending(&ctx, &format!("SpawnFailure: create run dir: {err}")).await;
        return run_id;
    }
    let log_path = run_dir.join("log.txt");

    // Argument vector, never a shell string.
    let tool = settings
        .crawl_tool
        .clone()
        .unwrap_or_else(|| PathBuf::from("crawl"));
    let tool = if tool.is_absolute() {
        tool
    } else {
        ctx.project.root_path.join(tool)
    };
    let mut argv: Vec<String> = vec![
        "crawl".to_string(),
        ctx.run.spider_name.clone(),
        "-o".to_string(),
        ctx.run.output_path.to_string_lossy().into_owned(),
        "--format".to_string(),
        "jsonlines".to_string(),
    ];
    for (key, value) in &settings.vars {
        argv.push("-s".to_string());
        argv.push(format!("{key}={value}"));
    }

    let mut audit = vec![tool.to_string_lossy().into_owned()];
    audit.extend(argv.iter().cloned());
    info!(
        run_id = %run_id,
        spider = %ctx.run.spider_name,
        command_sha256 = %command_fingerprint(&audit),
        "launching crawl subprocess"
    );

    let mut child = match spawn_crawler(&tool, &argv, &ctx.project, &log_path) {
        Ok(child) => child,
        Err(err) => {
            fail_pending(&ctx, &format!("SpawnFailure: {err}")).await;
            return run_id;
        }
    };
    let pid = child.id().unwrap_or_default();

    let started_at = Utc::now();
    match ctx
        .runs
        .transition(
            &run_id,
            RunState::Pending,
            RunState::Running,
            TransitionFields {
                started_at: Some(started_at),
                pid: Some(pid),
                ..Default::default()
            },
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(run_id = %run_id, "run left PENDING behind our back"),
        Err(err) => warn!(run_id = %run_id, error = %err, "RUNNING transition failed"),
    }
    let _ = ctx
        .updates
        .send(Update::Started {
            run_id: run_id.clone(),
            spider: ctx.run.spider_name.clone(),
            project_id: ctx.run.project_id.clone(),
            pid,
        })
        .await;
    let _ = ctx
        .updates
        .send(Update::State {
            run_id: run_id.clone(),
            state: RunState::Running,
            error_message: None,
        })
        .await;

    // Tailer -> ingest plumbing. Reads are capped at the byte high-water
    // mark and the channel is bounded: a slow store stalls reads, never the
    // subprocess.
    let (tail_tx, tail_rx) = mpsc::channel(8192);
    let (tail_stop_tx, tail_stop_rx) = watch::channel(false);
    let tail_handle = tokio::spawn(tail_file(
        ctx.run.output_path.clone(),
        TailerConfig {
            poll: settings
                .tail_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(ctx.cfg.tail_poll)
                .max(Duration::from_millis(100)),
            file_wait: ctx.cfg.file_wait,
            high_water_bytes: ctx.cfg.tail_high_water_bytes,
        },
        tail_stop_rx,
        tail_tx,
    ));
    let mut ingest_handle = tokio::spawn(
        IngestPipeline::new(
            run_id.clone(),
            FingerprintSpec::from_settings(&settings),
            ctx.runs.clone(),
            ctx.records.clone(),
            ctx.updates.clone(),
            run_dir.join("backup"),
            IngestConfig {
                batch_size: settings
                    .ingest_batch_size
                    .unwrap_or(ctx.cfg.ingest_batch_size)
                    .max(1),
                flush_interval: settings
                    .ingest_flush_sec
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.cfg.ingest_flush),
                retries: ctx.cfg.ingest_retries,
            },
        )
        .run(tail_rx),
    );

    let wall_limit = settings
        .wall_clock_limit_sec
        .map(Duration::from_secs)
        .unwrap_or(ctx.cfg.wall_clock_limit);
    let memory_limit_mb = settings.memory_limit_mb.unwrap_or(ctx.cfg.memory_limit_mb);

    let waited = monitor_child(
        &mut child,
        pid,
        wall_limit,
        memory_limit_mb,
        &mut ctx.cancel,
        ctx.cfg.shutdown_grace,
    )
    .await;

    // Let the tailer drain what the subprocess flushed on exit.
    let _ = tail_stop_tx.send(true);
    let drained = tokio::time::timeout(ctx.cfg.drain_grace, &mut ingest_handle).await;
    let summary = match drained {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(err)) => {
            warn!(run_id = %run_id, error = %err, "ingest task failed");
            None
        }
        Err(_) => {
            warn!(run_id = %run_id, "ingest drain timed out");
            tail_handle.abort();
            ingest_handle.abort();
            None
        }
    };
    tail_handle.abort();
    let summary = summary.unwrap_or_default();

    let stats = read_stats(&stats_path(&ctx.run.output_path)).await;
    let finished_at = Utc::now();
    let (final_state, error_message) = match &waited {
        Ok((status, None)) if status.success() => (RunState::Finished, None),
        Ok((status, None)) => {
            let tail = stderr_tail(&log_path).await;
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "killed by signal".to_string());
            (RunState::Failed, Some(format!("exit code {code}{tail}")))
        }
        Ok((_, Some(reason))) => (reason.terminal_state(), Some(reason.describe().to_string())),
        Err(err) => (
            RunState::Failed,
            Some(format!("subprocess wait failed: {err}")),
        ),
    };

    match ctx
        .runs
        .transition(
            &run_id,
            RunState::Running,
            final_state,
            TransitionFields {
                finished_at: Some(finished_at),
                observed_items: Some(summary.inserted),
                observed_requests: stats.as_ref().and_then(|s| s.request_count),
                error_message: error_message.clone(),
                ..Default::default()
            },
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(run_id = %run_id, "terminal transition lost; run was not RUNNING"),
        Err(err) => warn!(run_id = %run_id, error = %err, "terminal transition failed"),
    }

    let _ = ctx
        .updates
        .send(Update::State {
            run_id: run_id.clone(),
            state: final_state,
            error_message: error_message.clone(),
        })
        .await;
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
    let _ = ctx
        .updates
        .send(Update::Finished {
            run_id: run_id.clone(),
            state: final_state,
            items: summary.inserted,
            duration_ms,
        })
        .await;
    info!(
        run_id = %run_id,
        state = %final_state,
        items = summary.inserted,
        malformed = summary.malformed,
        degraded = summary.degraded,
        duration_ms,
        "run finalized"
    );

    // Post-hoc evaluation: counter repair, short-run rescue, backup replay.
    let _ = ctx.reconcile.send(run_id.clone()).await;
    run_id
}

fn spawn_crawler(
    tool: &Path,
    argv: &[String],
    project: &Project,
    log_path: &Path,
) -> std::io::Result<Child> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let log_err = log.try_clone()?;

    Command::new(tool)
        .args(argv)
        .current_dir(&project.root_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
}

/// Wait for the child while enforcing limits and honoring cancellation.
/// Breaches terminate the whole process group: SIGTERM, a grace period, then
/// SIGKILL.
async fn monitor_child(
    child: &mut Child,
    pid: u32,
    wall_limit: Duration,
    memory_limit_mb: u64,
    cancel: &mut watch::Receiver<Option<StopReason>>,
    grace: Duration,
) -> std::io::Result<(std::process::ExitStatus, Option<StopReason>)> {
    let mut breach = *cancel.borrow();

    if breach.is_none() {
        let deadline = tokio::time::sleep(wall_limit);
        tokio::pin!(deadline);
        let mut mem_tick = tokio::time::interval(Duration::from_secs(2));
        mem_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                status = child.wait() => return Ok((status?, None)),
                _ = &mut deadline => {
                    breach = Some(StopReason::WallClockExceeded);
                    break;
                }
                _ = mem_tick.tick() => {
                    if let Some(rss) = rss_mb(pid).await {
                        if rss > memory_limit_mb {
                            breach = Some(StopReason::MemoryExceeded);
                            break;
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() {
                        breach = Some(StopReason::Shutdown);
                        break;
                    }
                    if let Some(reason) = *cancel.borrow() {
                        breach = Some(reason);
                        break;
                    }
                }
            }
        }
    }

    signal_process_group(pid, libc::SIGTERM);
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::time::sleep(grace) => {
            signal_process_group(pid, libc::SIGKILL);
            child.wait().await?
        }
    };
    Ok((status, breach))
}

async fn fail_pending(ctx: &RunContext, message: &str) {
    let res = ctx
        .runs
        .transition(
            &ctx.run.id,
            RunState::Pending,
            RunState::Failed,
            TransitionFields {
                finished_at: Some(Utc::now()),
                error_message: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await;
    if let Err(err) = res {
        warn!(run_id = %ctx.run.id, error = %err, "failed to record spawn failure");
    }
    let _ = ctx
        .updates
        .send(Update::State {
            run_id: ctx.run.id.clone(),
            state: RunState::Failed,
            error_message: Some(message.to_string()),
        })
        .await;
    let _ = ctx.reconcile.send(ctx.run.id.clone()).await;
    warn!(run_id = %ctx.run.id, reason = message, "run failed before start");
}

/// Bounded tail of the run's combined stdout/stderr log, folded into the
/// terminal error message.
async fn stderr_tail(log_path: &Path) -> String {
    const TAIL_BYTES: usize = 1024;
    match tokio::fs::read(log_path).await {
        Ok(bytes) if !bytes.is_empty() => {
            let start = bytes.len().saturating_sub(TAIL_BYTES);
            let tail = String::from_utf8_lossy(&bytes[start..]);
            let tail = tail.trim();
            if tail.is_empty() {
                String::new()
            } else {
                format!("; log tail: {tail}")
            }
        }
        _ => String::new(),
    }
}
