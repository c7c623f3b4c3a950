//! # Cron runner: scheduled workers multiplexed onto one daemon mount.
//!
//! The first registered cron worker brings the scheduler into the mount
//! set; every further cron worker joins the same scheduler. Two schedule
//! modes are supported, matching what scheduled services in the wild
//! actually configure:
//!
//! - `@every <duration>` fixed intervals (`@every 30s`, `@every 5m`)
//! - cron expressions parsed by the `cron` crate (seconds field first,
//!   e.g. `0 30 9 * * *`)
//!
//! ## Rules
//! - Parse failures are fatal at assembly time, before any mount runs.
//! - At most one invocation per job runs at a time: a firing that finds
//!   the previous body still running is skipped with a log line.
//! - The scheduler quits immediately on cancellation (no new firings);
//!   in-flight bodies drain under the supervisor's 5 s window.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::MountError;
use crate::mount::{wait_context, MountFn, MountFuture};

/// Re-invocable cron worker body.
pub(crate) type CronBody = Arc<dyn Fn(CancellationToken) -> MountFuture + Send + Sync>;

/// A parsed schedule.
pub(crate) enum CronSpec {
    /// Fire every fixed interval, first firing one interval after start.
    Every(Duration),
    /// Fire at the expression's upcoming wall-clock times.
    Expr(Box<cron::Schedule>),
}

impl CronSpec {
    /// Parses `@every <dur>` or a cron expression.
    pub(crate) fn parse(expr: &str) -> Result<Self, String> {
        if let Some(rest) = expr.strip_prefix("@every ") {
            return parse_duration(rest.trim())
                .map(CronSpec::Every)
                .ok_or_else(|| format!("invalid @every duration '{rest}'"));
        }
        cron::Schedule::from_str(expr)
            .map(|schedule| CronSpec::Expr(Box::new(schedule)))
            .map_err(|err| err.to_string())
    }

    /// Time until the next firing, `None` when the schedule is spent.
    fn until_next(&self) -> Option<Duration> {
        match self {
            CronSpec::Every(interval) => Some(*interval),
            CronSpec::Expr(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Durations of the form `250ms`, `30s`, `5m`, `2h`.
fn parse_duration(s: &str) -> Option<Duration> {
    let (value, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// One scheduled job: schedule, body, and the non-overlap guard.
pub(crate) struct CronJob {
    name: Cow<'static, str>,
    spec: CronSpec,
    body: CronBody,
    guard: Arc<tokio::sync::Mutex<()>>,
}

impl CronJob {
    pub(crate) fn new(name: impl Into<Cow<'static, str>>, spec: CronSpec, body: CronBody) -> Self {
        Self {
            name: name.into(),
            spec,
            body,
            guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Sleeps and fires until cancellation. Firings run detached so a
    /// long body never delays the next tick decision.
    async fn run_loop(self, token: CancellationToken) {
        loop {
            let delay = match self.spec.until_next() {
                Some(delay) => delay,
                None => {
                    tracing::warn!(worker = %self.name, "schedule has no upcoming firings");
                    return;
                }
            };
            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep(delay) => {}
            }

            match Arc::clone(&self.guard).try_lock_owned() {
                Ok(permit) => {
                    let name = self.name.clone();
                    let body = Arc::clone(&self.body);
                    let fire_token = token.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let child = fire_token.child_token();
                        match wait_context(fire_token, false, (body)(child)).await {
                            Ok(()) => {}
                            Err(err) if err.is_cancellation() => {}
                            Err(err) => {
                                tracing::error!(worker = %name, error = %err, "cron worker failed");
                            }
                        }
                    });
                }
                Err(_busy) => {
                    tracing::warn!(worker = %self.name, "still running, skipping firing");
                }
            }
        }
    }
}

/// The scheduler mount shared by all cron jobs.
pub(crate) fn scheduler_mount(jobs: Vec<CronJob>) -> MountFn {
    MountFn::daemon("cron-scheduler", move |token| async move {
        let mut loops = JoinSet::new();
        for job in jobs {
            loops.spawn(job.run_loop(token.clone()));
        }
        // Quit as soon as the token falls: no new firings. In-flight
        // firings are detached tasks draining under their own window.
        token.cancelled().await;
        loops.shutdown().await;
        Err(MountError::Canceled)
    })
}
