//! Cron job capability for timer steps.
//!
//! Only the cron spec string is part of the contract; workers hand over a
//! callback and get back a handle to cancel with.

use chrono::Utc;
use cron::Schedule;
use slog::{debug, warn, Logger};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;

pub type JobId = u64;

#[derive(Clone, Debug)]
pub struct SchedError(pub String);

impl std::fmt::Display for SchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cron error: {}", self.0)
    }
}

impl std::error::Error for SchedError {}

/// Cron scheduling capability.
pub trait Scheduler: Send + Sync {
    fn add_job(
        &self,
        spec: &str,
        f: Box<dyn Fn() + Send + Sync>,
    ) -> Result<JobId, SchedError>;

    fn remove_job(&self, id: JobId);
}

/// Parse a cron spec, accepting both 5-field and seconds-bearing forms.
pub fn parse_cron(spec: &str) -> Result<Schedule, SchedError> {
    let normalized = if spec.split_whitespace().count() == 5 {
        format!("0 {}", spec)
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| SchedError(format!("{}: {}", spec, e)))
}

/// Scheduler driving each job from its own tokio task.
pub struct CronScheduler {
    jobs: Mutex<HashMap<JobId, JoinHandle<()>>>,
    seq: AtomicU64,
    log: Logger,
}

impl CronScheduler {
    pub fn new(log: Logger) -> Self {
        CronScheduler {
            jobs: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            log,
        }
    }

    pub fn stop_all(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }
}

impl Scheduler for CronScheduler {
    fn add_job(
        &self,
        spec: &str,
        f: Box<dyn Fn() + Send + Sync>,
    ) -> Result<JobId, SchedError> {
        let schedule = parse_cron(spec)?;
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let log = self.log.clone();
        let spec = spec.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let next = match schedule.upcoming(Utc).next() {
                    Some(next) => next,
                    None => {
                        warn!(log, "cron spec has no future fire time"; "spec" => &spec);
                        return;
                    }
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                debug!(log, "cron job fired"; "spec" => &spec);
                f();
            }
        });

        self.jobs.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    fn remove_job(&self, id: JobId) {
        if let Some(handle) = self.jobs.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Drain};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn create_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    }

    #[test]
    fn test_parse_five_and_six_field_specs() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("*/2 * * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_fires_and_stops() {
        let sched = CronScheduler::new(create_logger());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        // Every second.
        let id = sched
            .add_job(
                "* * * * * *",
                Box::new(move || {
                    fired_clone.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(fired.load(Ordering::Relaxed) >= 1);

        sched.remove_job(id);
        let after = fired.load(Ordering::Relaxed);
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::Relaxed), after);
    }
}
