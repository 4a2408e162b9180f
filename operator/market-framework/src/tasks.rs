//! The long-running loops of one service, watched until shutdown.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::health::HealthTracker;
use crate::shutdown::ShutdownTrigger;

type TaskExit = (&'static str, Result<()>);

/// Every loop here is expected to run until shutdown. One that returns
/// early, with or without an error, is logged when it happens and turns the
/// health report unhealthy.
pub struct ServiceTasks {
    set: JoinSet<TaskExit>,
    health: HealthTracker,
}

impl ServiceTasks {
    pub fn new(health: HealthTracker) -> Self {
        Self {
            set: JoinSet::new(),
            health,
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.set.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("panicked: {}", panic_message(&*panic))),
            };
            (name, result)
        });
    }

    /// Watches the tasks until `signal` resolves, then triggers shutdown and
    /// waits for the rest to wind down.
    pub async fn supervise(mut self, signal: impl Future<Output = ()>, trigger: ShutdownTrigger) {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                joined = self.set.join_next() => match joined {
                    Some(Ok((name, result))) => self.stopped_early(name, result),
                    Some(Err(err)) => {
                        error!(error = ?err, "Task was cancelled");
                        self.health.record_task_failure("unknown", err.to_string());
                    }
                    None => {
                        error!("Every service task has stopped, waiting for a shutdown signal");
                        signal.as_mut().await;
                        break;
                    }
                },
            }
        }

        trigger.trigger();
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(task = name, "Task stopped"),
                Ok((name, Err(err))) => error!(task = name, error = ?err, "Task exited with error"),
                Err(err) => error!(error = ?err, "Task was cancelled"),
            }
        }
    }

    fn stopped_early(&self, name: &'static str, result: Result<()>) {
        let reason = match result {
            Ok(()) => "exited before shutdown".to_string(),
            Err(err) => {
                error!(task = name, error = ?err, "Task failed before shutdown");
                format!("{err:#}")
            }
        };
        error!(task = name, %reason, "Task is no longer running, service is unhealthy");
        self.health.record_task_failure(name, reason);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::health::{HealthConfig, HealthReason, HealthStatus};
    use crate::shutdown;

    fn start(
        tasks: ServiceTasks,
        trigger: ShutdownTrigger,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let supervisor = tokio::spawn(tasks.supervise(
            async {
                signal_rx.await.ok();
            },
            trigger,
        ));
        (signal_tx, supervisor)
    }

    async fn wait_for_status(health: &HealthTracker, status: HealthStatus) {
        for _ in 0..50 {
            if health.get_report().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("health never reached {status:?}");
    }

    #[tokio::test]
    async fn test_failed_task_turns_service_unhealthy() {
        let health = HealthTracker::new("test", HealthConfig::for_range(100));
        let (trigger, stop) = shutdown::channel();
        let mut tasks = ServiceTasks::new(health.clone());

        let mut waiter = stop.clone();
        tasks.spawn("synchronizer", async move {
            waiter.wait().await;
            anyhow::Ok(())
        });
        tasks.spawn("responder", async { Err(anyhow!("subscription closed")) });

        let (signal, supervisor) = start(tasks, trigger);
        wait_for_status(&health, HealthStatus::Unhealthy).await;

        let report = health.get_report();
        assert_eq!(report.reason, Some(HealthReason::TaskStopped));
        assert_eq!(report.failed_tasks, vec!["responder".to_string()]);
        assert!(!stop.is_triggered());

        signal.send(()).unwrap();
        supervisor.await.unwrap();
        assert!(stop.is_triggered());
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let health = HealthTracker::new("test", HealthConfig::for_range(100));
        let (trigger, _stop) = shutdown::channel();
        let mut tasks = ServiceTasks::new(health.clone());
        tasks.spawn("sweeper", async {
            if true {
                panic!("sweep exploded");
            }
            anyhow::Ok(())
        });

        let (signal, supervisor) = start(tasks, trigger);
        wait_for_status(&health, HealthStatus::Unhealthy).await;
        let report = health.get_report();
        assert_eq!(report.failed_tasks, vec!["sweeper".to_string()]);
        assert!(report.last_error.unwrap().contains("sweep exploded"));

        signal.send(()).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_shutdown_stays_healthy() {
        let health = HealthTracker::new("test", HealthConfig::for_range(100));
        let (trigger, stop) = shutdown::channel();
        let mut tasks = ServiceTasks::new(health.clone());
        for name in ["synchronizer", "responder"] {
            let mut waiter = stop.clone();
            tasks.spawn(name, async move {
                waiter.wait().await;
                anyhow::Ok(())
            });
        }

        tasks.supervise(async {}, trigger).await;

        let report = health.get_report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.failed_tasks.is_empty());
    }
}
