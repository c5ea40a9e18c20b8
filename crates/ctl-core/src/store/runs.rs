use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

use crate::cron::CronExpr;
use crate::error::{StoreError, classify};
use crate::model::{Project, Run, RunOrigin, RunState, Schedule, Spider};
use crate::settings::RunSettings;
use crate::store::{dt_to_ms, ms_to_dt};

/// Run Store: durable metadata for projects, spiders, schedules, and runs.
///
/// Every lifecycle write is a conditional update returning whether it won;
/// callers branch on the bool instead of catching errors.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

/// Optional fields applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    /// Item total observed at finalization; merged as `max(existing, observed)`.
    pub observed_items: Option<i64>,
    pub observed_requests: Option<i64>,
    pub error_message: Option<String>,
}

/// How a terminal repair treats the persisted error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPatch {
    Keep,
    Clear,
    Set(String),
}

/// A schedule due for evaluation, joined with its spider's project for
/// dispatch capacity scoping.
#[derive(Debug, Clone)]
pub struct DueSchedule {
    pub schedule: Schedule,
    pub project_id: String,
}

impl RunStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- projects / spiders (owned by the API layer; exposed for it and for tests) ----

    pub async fn create_project(&self, name: &str, root_path: &Path) -> Result<Project, StoreError> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            root_path: root_path.to_path_buf(),
            pending_delete: false,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO projects (id, name, root_path, pending_delete, created_ms)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.root_path.to_string_lossy().into_owned())
        .bind(dt_to_ms(project.created_at))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        project_from_row(&row)
    }

    pub async fn mark_project_pending_delete(&self, id: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE projects SET pending_delete = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn create_spider(
        &self,
        project_id: &str,
        name: &str,
        settings: &RunSettings,
    ) -> Result<Spider, StoreError> {
        // Existence check first so a bad project id reads as NotFound rather
        // than a foreign-key failure.
        self.get_project(project_id).await?;
        let spider = Spider {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            settings: settings.clone(),
        };
        sqlx::query("INSERT INTO spiders (id, project_id, name, settings) VALUES (?, ?, ?, ?)")
            .bind(&spider.id)
            .bind(&spider.project_id)
            .bind(&spider.name)
            .bind(spider.settings.to_json())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(spider)
    }

    pub async fn get_spider(&self, id: &str) -> Result<Spider, StoreError> {
        let row = sqlx::query("SELECT * FROM spiders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| StoreError::NotFound(format!("spider {id}")))?;
        spider_from_row(&row)
    }

    // ---- schedules ----

    pub async fn create_schedule(
        &self,
        spider_id: &str,
        cron: &str,
        active: bool,
        overrides: &RunSettings,
    ) -> Result<Schedule, StoreError> {
        let expr = CronExpr::parse(cron)
            .map_err(|err| StoreError::Invalid(format!("cron {cron:?}: {err}")))?;
        self.get_spider(spider_id).await?;

        // Never fired: next is the first match after creation.
        let next_fire_time = expr.next_after(Utc::now());
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            spider_id: spider_id.to_string(),
            cron: cron.to_string(),
            active,
            last_fire_time: None,
            next_fire_time,
            overrides: overrides.clone(),
        };
        sqlx::query(
            "INSERT INTO schedules (id, spider_id, cron, active, last_fire_ms, next_fire_ms, overrides)
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&schedule.id)
        .bind(&schedule.spider_id)
        .bind(&schedule.cron)
        .bind(schedule.active)
        .bind(schedule.next_fire_time.map(dt_to_ms))
        .bind(schedule.overrides.to_json())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Schedule, StoreError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))?;
        schedule_from_row(&row)
    }

    pub async fn set_schedule_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE schedules SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    /// Active schedules whose `next_fire_time` has passed.
    pub async fn load_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<DueSchedule>, StoreError> {
        let rows = sqlx::query(
            "SELECT sch.*, sp.project_id AS project_id
             FROM schedules sch JOIN spiders sp ON sp.id = sch.spider_id
             WHERE sch.active = 1 AND sch.next_fire_ms IS NOT NULL AND sch.next_fire_ms <= ?
             ORDER BY sch.next_fire_ms",
        )
        .bind(dt_to_ms(now))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter()
            .map(|row| {
                Ok(DueSchedule {
                    schedule: schedule_from_row(row)?,
                    project_id: row.try_get("project_id").map_err(classify)?,
                })
            })
            .collect()
    }

    /// Compare-and-set on `last_fire_time`. At most one concurrent caller per
    /// fire observes `true`; everyone else lost the race and must not
    /// dispatch.
    pub async fn advance_schedule(
        &self,
        id: &str,
        prev_last_fire: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE schedules SET last_fire_ms = ?, next_fire_ms = ?
             WHERE id = ? AND last_fire_ms IS ?",
        )
        .bind(dt_to_ms(fired_at))
        .bind(next.map(dt_to_ms))
        .bind(id)
        .bind(prev_last_fire.map(dt_to_ms))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    // ---- runs ----

    /// Materialize a `PENDING` run for a spider. Fails with `NotFound` when
    /// the spider or its project is missing or marked for deletion.
    pub async fn create_run(
        &self,
        spider_id: &str,
        overrides: &RunSettings,
        origin: RunOrigin,
        runs_root: &Path,
    ) -> Result<Run, StoreError> {
        let row = sqlx::query(
            "SELECT sp.project_id, sp.name, sp.settings, p.pending_delete
             FROM spiders sp JOIN projects p ON p.id = sp.project_id
             WHERE sp.id = ?",
        )
        .bind(spider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?
        .ok_or_else(|| StoreError::NotFound(format!("spider {spider_id}")))?;

        if row.try_get::<bool, _>("pending_delete").map_err(classify)? {
            return Err(StoreError::NotFound(format!(
                "spider {spider_id}: project is marked for deletion"
            )));
        }

        let project_id: String = row.try_get("project_id").map_err(classify)?;
        let spider_name: String = row.try_get("name").map_err(classify)?;
        let spider_settings =
            RunSettings::from_json(&row.try_get::<String, _>("settings").map_err(classify)?)
                .map_err(|err| StoreError::Corrupt(format!("spider {spider_id} settings: {err}")))?;

        let id = Uuid::new_v4().to_string();
        let run = Run {
            output_path: runs_root.join(&id).join("output.jsonl"),
            id,
            project_id,
            spider_id: spider_id.to_string(),
            spider_name,
            schedule_id: origin.schedule_id().map(str::to_string),
            state: RunState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            items_count: 0,
            requests_count: 0,
            error_count: 0,
            settings: spider_settings.merged(overrides),
            pid: None,
            error_message: None,
        };

        sqlx::query(
            "INSERT INTO runs (id, project_id, spider_id, spider_name, schedule_id, state,
                               created_ms, output_path, settings)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.project_id)
        .bind(&run.spider_id)
        .bind(&run.spider_name)
        .bind(&run.schedule_id)
        .bind(run.state.as_str())
        .bind(dt_to_ms(run.created_at))
        .bind(run.output_path.to_string_lossy().into_owned())
        .bind(run.settings.to_json())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run_from_row(&row)
    }

    /// Conditional lifecycle transition. Succeeds only when the current state
    /// equals `from`; returns `false` on mismatch. The `from → to` pair must
    /// be a legal forward edge; terminal repairs go through
    /// [`RunStore::repair_terminal`] instead.
    pub async fn transition(
        &self,
        run_id: &str,
        from: RunState,
        to: RunState,
        fields: TransitionFields,
    ) -> Result<bool, StoreError> {
        if !from.can_transition(to) {
            return Err(StoreError::InvalidTransition(format!("{from} -> {to}")));
        }

        let res = sqlx::query(
            "UPDATE runs SET
                state = ?,
                started_ms = COALESCE(?, started_ms),
                finished_ms = COALESCE(?, finished_ms),
                pid = COALESCE(?, pid),
                items_count = MAX(items_count, COALESCE(?, items_count)),
                requests_count = MAX(requests_count, COALESCE(?, requests_count)),
                error_message = COALESCE(?, error_message)
             WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(fields.started_at.map(dt_to_ms))
        .bind(fields.finished_at.map(dt_to_ms))
        .bind(fields.pid.map(|p| p as i64))
        .bind(fields.observed_items)
        .bind(fields.observed_requests)
        .bind(&fields.error_message)
        .bind(run_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    /// Atomic additive counter update.
    pub async fn bump_counters(
        &self,
        run_id: &str,
        items: i64,
        requests: i64,
        errors: i64,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE runs SET
                items_count = items_count + ?,
                requests_count = requests_count + ?,
                error_count = error_count + ?
             WHERE id = ?",
        )
        .bind(items)
        .bind(requests)
        .bind(errors)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    /// Reconciliation's write path: counter repair and `FAILED ⇄ FINISHED`
    /// flips on terminal runs only.
    pub async fn repair_terminal(
        &self,
        run_id: &str,
        expected: RunState,
        new_state: RunState,
        items: i64,
        requests: i64,
        error: ErrorPatch,
    ) -> Result<bool, StoreError> {
        if !expected.is_terminal() || !new_state.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "repair {expected} -> {new_state}"
            )));
        }
        let (mode, value) = match error {
            ErrorPatch::Keep => (0i64, None),
            ErrorPatch::Clear => (1, None),
            ErrorPatch::Set(message) => (2, Some(message)),
        };
        let res = sqlx::query(
            "UPDATE runs SET
                state = ?,
                items_count = ?,
                requests_count = ?,
                error_message = CASE ? WHEN 1 THEN NULL WHEN 2 THEN ? ELSE error_message END
             WHERE id = ? AND state = ?",
        )
        .bind(new_state.as_str())
        .bind(items)
        .bind(requests)
        .bind(mode)
        .bind(value)
        .bind(run_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    /// Fail an orphaned `RUNNING` run whose process died with the platform.
    pub async fn mark_interrupted(&self, run_id: &str, message: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE runs SET state = ?, finished_ms = ?, error_message = ?
             WHERE id = ? AND state = ?",
        )
        .bind(RunState::Failed.as_str())
        .bind(dt_to_ms(Utc::now()))
        .bind(message)
        .bind(run_id)
        .bind(RunState::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn list_runs(&self, spider_id: &str, limit: i64) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE spider_id = ? ORDER BY created_ms DESC LIMIT ?",
        )
        .bind(spider_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE state IN ('PENDING', 'RUNNING') ORDER BY created_ms",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn running_runs(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query("SELECT * FROM runs WHERE state = 'RUNNING'")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(run_from_row).collect()
    }

    /// Terminal runs that finished at or after `cutoff`, newest first.
    pub async fn list_recent_terminal(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs
             WHERE state IN ('FINISHED', 'FAILED', 'CANCELLED') AND finished_ms >= ?
             ORDER BY finished_ms DESC",
        )
        .bind(dt_to_ms(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(run_from_row).collect()
    }

    /// GC: delete a terminal run's row. Refuses non-terminal runs.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let run = match self.get_run(run_id).await {
            Ok(run) => run,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if !run.state.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "run {run_id} is {}; only terminal runs can be deleted",
                run.state
            )));
        }
        let res = sqlx::query("DELETE FROM runs WHERE id = ? AND state = ?")
            .bind(run_id)
            .bind(run.state.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(res.rows_affected() > 0)
    }
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StoreError> {
    Ok(Project {
        id: row.try_get("id").map_err(classify)?,
        name: row.try_get("name").map_err(classify)?,
        root_path: PathBuf::from(row.try_get::<String, _>("root_path").map_err(classify)?),
        pending_delete: row.try_get("pending_delete").map_err(classify)?,
        created_at: ms_to_dt(row.try_get("created_ms").map_err(classify)?)?,
    })
}

fn spider_from_row(row: &SqliteRow) -> Result<Spider, StoreError> {
    let id: String = row.try_get("id").map_err(classify)?;
    let settings = RunSettings::from_json(&row.try_get::<String, _>("settings").map_err(classify)?)
        .map_err(|err| StoreError::Corrupt(format!("spider {id} settings: {err}")))?;
    Ok(Spider {
        project_id: row.try_get("project_id").map_err(classify)?,
        name: row.try_get("name").map_err(classify)?,
        settings,
        id,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule, StoreError> {
    let id: String = row.try_get("id").map_err(classify)?;
    let overrides =
        RunSettings::from_json(&row.try_get::<String, _>("overrides").map_err(classify)?)
            .map_err(|err| StoreError::Corrupt(format!("schedule {id} overrides: {err}")))?;
    Ok(Schedule {
        spider_id: row.try_get("spider_id").map_err(classify)?,
        cron: row.try_get("cron").map_err(classify)?,
        active: row.try_get("active").map_err(classify)?,
        last_fire_time: row
            .try_get::<Option<i64>, _>("last_fire_ms")
            .map_err(classify)?
            .map(ms_to_dt)
            .transpose()?,
        next_fire_time: row
            .try_get::<Option<i64>, _>("next_fire_ms")
            .map_err(classify)?
            .map(ms_to_dt)
            .transpose()?,
        overrides,
        id,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let id: String = row.try_get("id").map_err(classify)?;
    let state_text: String = row.try_get("state").map_err(classify)?;
    let state = RunState::parse(&state_text)
        .ok_or_else(|| StoreError::Corrupt(format!("run {id} state {state_text:?}")))?;
    let settings = RunSettings::from_json(&row.try_get::<String, _>("settings").map_err(classify)?)
        .map_err(|err| StoreError::Corrupt(format!("run {id} settings: {err}")))?;
    Ok(Run {
        project_id: row.try_get("project_id").map_err(classify)?,
        spider_id: row.try_get("spider_id").map_err(classify)?,
        spider_name: row.try_get("spider_name").map_err(classify)?,
        schedule_id: row.try_get("schedule_id").map_err(classify)?,
        state,
        created_at: ms_to_dt(row.try_get("created_ms").map_err(classify)?)?,
        started_at: row
            .try_get::<Option<i64>, _>("started_ms")
            .map_err(classify)?
            .map(ms_to_dt)
            .transpose()?,
        finished_at: row
            .try_get::<Option<i64>, _>("finished_ms")
            .map_err(classify)?
            .map(ms_to_dt)
            .transpose()?,
        items_count: row.try_get("items_count").map_err(classify)?,
        requests_count: row.try_get("requests_count").map_err(classify)?,
        error_count: row.try_get("error_count").map_err(classify)?,
        output_path: PathBuf::from(row.try_get::<String, _>("output_path").map_err(classify)?),
        settings,
        pid: row
            .try_get::<Option<i64>, _>("pid")
            .map_err(classify)?
            .map(|p| p as u32),
        error_message: row.try_get("error_message").map_err(classify)?,
        id,
    })
}
