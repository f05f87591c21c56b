//! Named-job scheduler for the periodic sweeps.
//!
//! Each job owns a cron expression (seconds field included) and can also
//! be triggered independently via [`Scheduler::run_now`]. The sweep entry
//! points themselves take an explicit `now`, so tests drive them with a
//! fixed clock and never go through this module.

use std::{str::FromStr, sync::Arc};

use {
    chrono::Utc,
    futures::future::BoxFuture,
    tracing::{debug, warn},
};

use crate::engine::ReconcileEngine;

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: &'static str,
    schedule: cron::Schedule,
    run: JobFn,
}

/// Cron expressions for the three sweeps.
#[derive(Debug, Clone)]
pub struct SweepSchedules {
    pub expiry: String,
    pub near_expiry: String,
    pub health: String,
}

impl Default for SweepSchedules {
    fn default() -> Self {
        Self {
            expiry: "0 0 0 * * *".into(),
            near_expiry: "0 0 15 * * *".into(),
            health: "0 */5 * * * *".into(),
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Register a named job. Fails on an invalid cron expression.
    pub fn add(
        &mut self,
        name: &'static str,
        expr: &str,
        run: JobFn,
    ) -> anyhow::Result<()> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("job '{name}': invalid schedule '{expr}': {e}"))?;
        self.jobs.push(Job {
            name,
            schedule,
            run,
        });
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name).collect()
    }

    /// Trigger one job immediately, outside its schedule.
    pub async fn run_now(&self, name: &str) -> bool {
        match self.jobs.iter().find(|j| j.name == name) {
            Some(job) => {
                debug!(job = name, "manual trigger");
                (job.run)().await;
                true
            },
            None => false,
        }
    }

    /// Spawn one timer task per job. Tasks run until the process exits.
    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| {
                tokio::spawn(async move {
                    loop {
                        let Some(next) = job.schedule.upcoming(Utc).next() else {
                            warn!(job = job.name, "schedule produced no upcoming run, stopping");
                            break;
                        };
                        let wait = (next - Utc::now()).to_std().unwrap_or_default();
                        tokio::time::sleep(wait).await;
                        debug!(job = job.name, "scheduled run");
                        (job.run)().await;
                    }
                })
            })
            .collect()
    }
}

/// Wire the engine's three sweeps into a scheduler.
pub fn build_scheduler(
    engine: Arc<ReconcileEngine>,
    schedules: &SweepSchedules,
) -> anyhow::Result<Scheduler> {
    let mut scheduler = Scheduler::new();

    let e = Arc::clone(&engine);
    scheduler.add(
        "expiry",
        &schedules.expiry,
        Arc::new(move || {
            let e = Arc::clone(&e);
            Box::pin(async move {
                match e.expiry_sweep(Utc::now()).await {
                    Ok(closed) => debug!(closed, "expiry sweep done"),
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            })
        }),
    )?;

    let e = Arc::clone(&engine);
    scheduler.add(
        "near-expiry",
        &schedules.near_expiry,
        Arc::new(move || {
            let e = Arc::clone(&e);
            Box::pin(async move {
                match e.near_expiry_sweep(Utc::now()).await {
                    Ok(notified) => debug!(notified, "near-expiry sweep done"),
                    Err(err) => warn!(error = %err, "near-expiry sweep failed"),
                }
            })
        }),
    )?;

    scheduler.add(
        "health",
        &schedules.health,
        Arc::new(move || {
            let e = Arc::clone(&engine);
            Box::pin(async move {
                let down = e.health_sweep().await;
                debug!(down, "health sweep done");
            })
        }),
    )?;

    Ok(scheduler)
}
