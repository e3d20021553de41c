//! Ingestion scheduler (C13).
//!
//! Parses the tiny schedule grammar agents are configured with,
//! decides whether a schedule is due given `last_run`, and drives a
//! one-second background tick loop that asks a [`ScheduledRunner`]
//! which agents are due and runs them. A shared "currently running"
//! set gives re-entrant protection: starting a run for an agent that's
//! already mid-run returns [`RagError::AlreadyRunning`] instead of
//! racing a second invocation against the first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{RagError, Result};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A parsed agent schedule (§4.13). `interval:<N><s|m|h|d>`,
/// `daily:HH:MM`, or `cron:<min> <hour> <day> <month> <dow>` with the
/// month field pinned to `*` — this scheduler drives exact
/// day-of-week/day-of-month matches but doesn't do calendar arithmetic
/// across months.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Interval(Duration),
    Daily { hour: u32, minute: u32 },
    Cron {
        minute: CronField,
        hour: CronField,
        day: CronField,
        dow: CronField,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Any,
    Value(u32),
}

impl CronField {
    fn matches(&self, actual: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Value(v) => *v == actual,
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        if raw == "*" {
            Ok(CronField::Any)
        } else {
            raw.parse::<u32>().map(CronField::Value).map_err(|_| RagError::ScheduleInvalid(format!("invalid cron field: {raw}")))
        }
    }
}

pub fn parse_schedule(raw: &str) -> Result<Schedule> {
    if let Some(rest) = raw.strip_prefix("interval:") {
        return parse_interval(rest);
    }
    if let Some(rest) = raw.strip_prefix("daily:") {
        return parse_daily(rest);
    }
    if let Some(rest) = raw.strip_prefix("cron:") {
        return parse_cron(rest);
    }
    Err(RagError::ScheduleInvalid(format!("unrecognized schedule grammar: {raw}")))
}

fn parse_interval(rest: &str) -> Result<Schedule> {
    if rest.len() < 2 {
        return Err(RagError::ScheduleInvalid(format!("invalid interval: {rest}")));
    }
    let (number, unit) = rest.split_at(rest.len() - 1);
    let n: u64 = number.parse().map_err(|_| RagError::ScheduleInvalid(format!("invalid interval magnitude: {rest}")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        other => return Err(RagError::ScheduleInvalid(format!("unknown interval unit: {other}"))),
    };
    if secs == 0 {
        return Err(RagError::ScheduleInvalid("interval must be greater than zero".to_string()));
    }
    Ok(Schedule::Interval(Duration::from_secs(secs)))
}

fn parse_daily(rest: &str) -> Result<Schedule> {
    let (hour, minute) = rest.split_once(':').ok_or_else(|| RagError::ScheduleInvalid(format!("invalid daily schedule: {rest}")))?;
    let hour: u32 = hour.parse().map_err(|_| RagError::ScheduleInvalid(format!("invalid daily hour: {hour}")))?;
    let minute: u32 = minute.parse().map_err(|_| RagError::ScheduleInvalid(format!("invalid daily minute: {minute}")))?;
    if hour > 23 || minute > 59 {
        return Err(RagError::ScheduleInvalid(format!("daily schedule out of range: {rest}")));
    }
    Ok(Schedule::Daily { hour, minute })
}

fn parse_cron(rest: &str) -> Result<Schedule> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(RagError::ScheduleInvalid(format!("cron schedule must have 5 fields: {rest}")));
    }
    if fields[3] != "*" {
        return Err(RagError::ScheduleInvalid("cron month field must be '*'; calendar-spanning schedules are not supported".to_string()));
    }
    Ok(Schedule::Cron {
        minute: CronField::parse(fields[0])?,
        hour: CronField::parse(fields[1])?,
        day: CronField::parse(fields[2])?,
        dow: CronField::parse(fields[4])?,
    })
}

/// Whether `schedule` is due to run now, given the agent's `last_run`.
pub fn is_due(schedule: &Schedule, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match schedule {
        Schedule::Interval(period) => match last_run {
            None => true,
            Some(last) => (now - last).to_std().map(|elapsed| elapsed >= *period).unwrap_or(true),
        },
        Schedule::Daily { hour, minute } => {
            let due_time_passed = now.hour() == *hour && now.minute() == *minute;
            due_time_passed && !already_ran_today(last_run, now)
        }
        Schedule::Cron { minute, hour, day, dow } => {
            let matches = minute.matches(now.minute()) && hour.matches(now.hour()) && day.matches(now.day()) && dow.matches(now.weekday().num_days_from_sunday());
            matches && !already_ran_this_minute(last_run, now)
        }
    }
}

fn already_ran_today(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_run.map(|last| last.date_naive() == now.date_naive() && last.hour() == now.hour() && last.minute() == now.minute()).unwrap_or(false)
}

fn already_ran_this_minute(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_run
        .map(|last| last.date_naive() == now.date_naive() && last.hour() == now.hour() && last.minute() == now.minute())
        .unwrap_or(false)
}

/// Bridges the scheduler's tick loop to whatever owns the agent
/// registry (the ingestion manager, C14).
#[async_trait]
pub trait ScheduledRunner: Send + Sync {
    /// Ids of agents whose schedule is due as of `now`.
    async fn due_agents(&self, now: DateTime<Utc>) -> Vec<String>;
    /// Execute one agent's full ingest pipeline.
    async fn run_agent(&self, agent_id: &str) -> Result<()>;
}

/// Owns the background tick task and the re-entrancy guard.
pub struct Scheduler {
    running: Arc<Mutex<HashSet<String>>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<tokio::sync::Notify>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            running: Arc::new(Mutex::new(HashSet::new())),
            handle: None,
            stop: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Start the one-second tick loop against `runner`.
    pub fn start<R: ScheduledRunner + 'static>(&mut self, runner: Arc<R>) {
        let running = self.running.clone();
        let stop = self.stop.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        for agent_id in runner.due_agents(now).await {
                            let running = running.clone();
                            let runner = runner.clone();
                            tokio::spawn(async move {
                                if !running.lock().await.insert(agent_id.clone()) {
                                    return;
                                }
                                let _ = runner.run_agent(&agent_id).await;
                                running.lock().await.remove(&agent_id);
                            });
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        }));
    }

    /// Manually trigger an agent run outside the tick loop (e.g. `ragctl
    /// sync`), rejecting re-entrant runs of the same agent.
    pub async fn run_now<R: ScheduledRunner>(&self, runner: &R, agent_id: &str) -> Result<()> {
        if !self.running.lock().await.insert(agent_id.to_string()) {
            return Err(RagError::AlreadyRunning(agent_id.to_string()));
        }
        let result = runner.run_agent(agent_id).await;
        self.running.lock().await.remove(agent_id);
        result
    }

    /// Advisory stop: signal the tick loop and wait up to a 2-second
    /// grace period for it to exit before giving up on the join.
    pub async fn stop(&mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, handle).await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_interval_schedule() {
        assert_eq!(parse_schedule("interval:30m").unwrap(), Schedule::Interval(Duration::from_secs(1800)));
        assert!(parse_schedule("interval:0s").is_err());
        assert!(parse_schedule("interval:5x").is_err());
    }

    #[test]
    fn parses_daily_schedule() {
        assert_eq!(parse_schedule("daily:09:30").unwrap(), Schedule::Daily { hour: 9, minute: 30 });
        assert!(parse_schedule("daily:24:00").is_err());
    }

    #[test]
    fn cron_requires_wildcard_month() {
        assert!(parse_schedule("cron:0 9 * * 1").is_ok());
        assert!(parse_schedule("cron:0 9 * 6 1").is_err());
        assert!(parse_schedule("cron:0 9 *").is_err());
    }

    #[test]
    fn interval_is_due_after_elapsed_period() {
        let schedule = Schedule::Interval(Duration::from_secs(60));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert!(is_due(&schedule, None, now));
        assert!(!is_due(&schedule, Some(now - chrono::Duration::seconds(30)), now));
        assert!(is_due(&schedule, Some(now - chrono::Duration::seconds(90)), now));
    }

    #[tokio::test]
    async fn run_now_rejects_reentrant_runs() {
        struct SlowRunner;
        #[async_trait]
        impl ScheduledRunner for SlowRunner {
            async fn due_agents(&self, _now: DateTime<Utc>) -> Vec<String> {
                Vec::new()
            }
            async fn run_agent(&self, _agent_id: &str) -> Result<()> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        }

        let scheduler = Arc::new(Scheduler::new());
        let runner = Arc::new(SlowRunner);

        let s1 = scheduler.clone();
        let r1 = runner.clone();
        let first = tokio::spawn(async move { s1.run_now(r1.as_ref(), "agent-1").await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = scheduler.run_now(runner.as_ref(), "agent-1").await;

        assert!(matches!(second, Err(RagError::AlreadyRunning(_))));
        first.await.unwrap().unwrap();
    }
}
