//! Cron-driven backup scheduler
//!
//! One timer task per scheduled database, keyed by object identity. A timer
//! only records the tick and enqueues a `ScheduledBackup` key; the snapshot
//! itself is created by [`run_scheduled_backup`] on a worker, where the
//! at-most-one-running-backup check happens against the current cluster state.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::context::Context;
use crate::controller::events::{actions, reasons};
use crate::controller::queue::{ObjectKey, QueueKey, WorkKind, WorkQueue};
use crate::controller::worker::Action;
use crate::controller::{Error, Result};
use crate::crd::{DatabasePhase, MySQL, Snapshot, SnapshotSpec};
use crate::resources::job::snapshot_labels;

/// When a schedule fires
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron(Box<Schedule>),
    Every(Duration),
}

impl Cadence {
    /// Parse a 5-field cron expression, a `@daily`-style macro or `@every <duration>`
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if let Some(every) = expression.strip_prefix("@every") {
            let duration = parse_duration(every.trim())?;
            return Ok(Cadence::Every(duration));
        }

        let six_fields = match expression {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * SUN".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            other if other.split_whitespace().count() == 5 => {
                let fields: Vec<&str> = other.split_whitespace().collect();
                let day_of_week = cron_day_of_week(fields[4])?;
                format!("0 {} {day_of_week}", fields[..4].join(" "))
            }
            other => {
                return Err(Error::ValidationError(format!(
                    "cron expression {other:?} must have 5 fields"
                )));
            }
        };
        let schedule = Schedule::from_str(&six_fields).map_err(|e| {
            Error::ValidationError(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    /// First firing strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron(schedule) => schedule.after(&now).next(),
            Cadence::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| now + d)
            }
        }
    }
}

/// Renumber a standard day-of-week field (0-7, Sunday = 0 or 7) for the
/// `cron` crate, which counts 1-7 from Sunday. Names pass through unchanged.
fn cron_day_of_week(field: &str) -> Result<String> {
    let invalid = || Error::ValidationError(format!("invalid day-of-week field {field:?}"));
    let day = |value: &str| -> Result<Option<u32>> {
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        match value.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(Some(day)),
            _ => Err(invalid()),
        }
    };
    let shift = |value: &str| -> Result<String> {
        Ok(match day(value)? {
            Some(7) => "1".to_string(),
            Some(d) => (d + 1).to_string(),
            None => value.to_string(),
        })
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        let Some((start, end)) = range.split_once('-') else {
            if range == "*" || range == "?" {
                items.push(item.to_string());
            } else if step.is_some() && day(range)? == Some(7) {
                // Sunday onwards wraps to Sunday alone
                items.push("1".to_string());
            } else {
                items.push(format!("{}{suffix}", shift(range)?));
            }
            continue;
        };

        match (day(start)?, day(end)?) {
            (Some(7), Some(7)) => items.push("1".to_string()),
            (Some(first), Some(7)) => {
                // Saturday is the last day the crate knows; Sunday (7) wraps to 1
                items.push(format!("{}-7{suffix}", first + 1));
                let stride = match step {
                    Some(step) => step.parse::<u32>().map_err(|_| invalid())?,
                    None => 1,
                };
                if stride > 0 && (7 - first) % stride == 0 {
                    items.push("1".to_string());
                }
            }
            (Some(first), Some(last)) if first > last => return Err(invalid()),
            _ => items.push(format!("{}-{}{suffix}", shift(start)?, shift(end)?)),
        }
    }
    Ok(items.join(","))
}

/// Parse a humanised duration such as `20s`, `5m` or `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::ValidationError(format!("invalid duration {input:?}"));
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

struct Entry {
    expression: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type Ticks = Arc<Mutex<HashMap<ObjectKey, DateTime<Utc>>>>;

pub struct BackupScheduler {
    entries: Mutex<HashMap<ObjectKey, Entry>>,
    ticks: Ticks,
    queue: Arc<WorkQueue<QueueKey>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupScheduler {
    pub fn new(queue: Arc<WorkQueue<QueueKey>>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ticks: Arc::new(Mutex::new(HashMap::new())),
            queue,
            shutdown: CancellationToken::new(),
        }
    }

    /// Install or replace the schedule for `key`
    ///
    /// Returns `false` when an identical schedule is already running.
    pub fn ensure(&self, key: &ObjectKey, expression: &str) -> Result<bool> {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(key) {
            if entry.expression == expression && !entry.handle.is_finished() {
                return Ok(false);
            }
        }

        let cadence = Cadence::parse(expression)?;
        if let Some(old) = entries.remove(key) {
            old.token.cancel();
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(run_timer(
            key.clone(),
            cadence,
            token.clone(),
            self.ticks.clone(),
            self.queue.clone(),
        ));
        entries.insert(
            key.clone(),
            Entry {
                expression: expression.to_string(),
                token,
                handle,
            },
        );
        info!(key = %key, expression, "Backup schedule installed");
        Ok(true)
    }

    /// Cancel the timer for `key`; in-flight snapshots are left alone
    pub fn remove(&self, key: &ObjectKey) -> bool {
        let removed = lock(&self.entries).remove(key);
        lock(&self.ticks).remove(key);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                info!(key = %key, "Backup schedule removed");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &ObjectKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn expression(&self, key: &ObjectKey) -> Option<String> {
        lock(&self.entries).get(key).map(|e| e.expression.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the most recent unhandled tick for `key`
    pub fn take_tick(&self, key: &ObjectKey) -> Option<DateTime<Utc>> {
        lock(&self.ticks).remove(key)
    }

    /// Record a tick as if the timer had fired
    pub fn record_tick(&self, key: &ObjectKey, at: DateTime<Utc>) {
        lock(&self.ticks).insert(key.clone(), at);
    }

    /// Cancel every timer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.entries).clear();
    }
}

async fn run_timer(
    key: ObjectKey,
    cadence: Cadence,
    token: CancellationToken,
    ticks: Ticks,
    queue: Arc<WorkQueue<QueueKey>>,
) {
    loop {
        let now = Utc::now();
        let Some(next) = cadence.next_after(now) else {
            debug!(key = %key, "Schedule has no future firings");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        lock(&ticks).insert(key.clone(), next);
        queue.add(QueueKey {
            kind: WorkKind::ScheduledBackup,
            object: key.clone(),
        });
    }
}

/// Snapshot name for a tick, unique per database and second
pub fn scheduled_snapshot_name(db_name: &str, tick: DateTime<Utc>) -> String {
    format!("{db_name}-{}", tick.format("%Y%m%d-%H%M%S"))
}

/// Snapshot the scheduler creates for `mysql` at `tick`
pub fn scheduled_snapshot(mysql: &MySQL, tick: DateTime<Utc>) -> Option<Snapshot> {
    let schedule = mysql.spec.backup_schedule.as_ref()?;
    let name = mysql.name_any();
    Some(Snapshot {
        metadata: ObjectMeta {
            name: Some(scheduled_snapshot_name(&name, tick)),
            namespace: mysql.namespace(),
            labels: Some(snapshot_labels(&name)),
            ..Default::default()
        },
        spec: SnapshotSpec {
            database_name: name,
            backend: schedule.backend.clone(),
            storage_type: schedule.storage_type,
            pod_volume_claim_spec: schedule.pod_volume_claim_spec.clone(),
            pod_template: schedule.pod_template.clone(),
        },
        status: None,
    })
}

/// Handle a fired timer for the database at `key`
pub async fn run_scheduled_backup(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let Some(tick) = ctx.scheduler.take_tick(key) else {
        return Ok(Action::await_change());
    };
    let ns = key.namespace.as_str();

    let Some(mysql) = ctx.repos.mysqls.get(ns, &key.name).await? else {
        ctx.scheduler.remove(key);
        return Ok(Action::await_change());
    };

    let skip_reason = if mysql.spec.backup_schedule.is_none() {
        Some("backup schedule was removed".to_string())
    } else if mysql.phase() != Some(DatabasePhase::Running) {
        Some(format!(
            "database is {}",
            mysql
                .phase()
                .map_or_else(|| "not yet provisioned".to_string(), |p| p.to_string())
        ))
    } else {
        let in_flight = ctx
            .repos
            .snapshots
            .list(ns, &Default::default())
            .await?
            .into_iter()
            .find(|s| s.spec.database_name == key.name && s.is_in_flight());
        in_flight.map(|s| format!("snapshot {} is still in progress", s.name_any()))
    };

    if let Some(reason) = skip_reason {
        info!(key = %key, %reason, "Skipping scheduled backup");
        if let Some(metrics) = &ctx.metrics {
            metrics.metrics.record_scheduled_backup(ns, &key.name, true);
        }
        ctx.publish(
            &mysql,
            EventType::Normal,
            reasons::BACKUP_SKIPPED,
            actions::BACKUP,
            Some(reason),
        )
        .await;
        return Ok(Action::await_change());
    }

    let Some(snapshot) = scheduled_snapshot(&mysql, tick) else {
        return Ok(Action::await_change());
    };
    let snapshot_name = snapshot.name_any();
    match ctx.repos.snapshots.create(ns, &snapshot).await {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {
            debug!(key = %key, snapshot = %snapshot_name, "Scheduled snapshot already exists");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    }

    info!(key = %key, snapshot = %snapshot_name, "Created scheduled snapshot");
    if let Some(metrics) = &ctx.metrics {
        metrics.metrics.record_scheduled_backup(ns, &key.name, false);
    }
    ctx.publish(
        &mysql,
        EventType::Normal,
        reasons::BACKUP_SCHEDULED,
        actions::BACKUP,
        Some(format!("created snapshot {snapshot_name}")),
    )
    .await;
    Ok(Action::await_change())
}
