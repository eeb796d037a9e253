//! Waiting on tasks, subscriptions and polls.
//!
//! Every blocking wait goes through [`Session::wait`], which races the wait
//! against the session's cancellation token and an optional deadline.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::vsphere::client::{retrieve_one, TaskRequest};
use crate::vsphere::mo::{self, ManagedObjectReference, TaskInfo, TaskState};
use crate::vsphere::Session;

impl Session {
    /// Run `fut` until it completes, the deadline passes or the session is
    /// cancelled.
    pub async fn wait<T, F>(&self, what: &str, deadline: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancel = self.cancellation_token();
        let bounded = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                    HypervisorError::Timeout(format!("{} after {:?}", what, limit))
                })?,
                None => fut.await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(HypervisorError::Cancelled(what.to_string())),
            result = bounded => result,
        }
    }

    /// Sleep for `period` unless the session is cancelled first.
    pub async fn sleep(&self, period: Duration) -> Result<()> {
        let cancel = self.cancellation_token();
        tokio::select! {
            _ = cancel.cancelled() => Err(HypervisorError::Cancelled("sleep".to_string())),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }

    /// Wait for a submitted task; a fault reported by the task is an error.
    #[instrument(skip(self, task), fields(task = %task))]
    pub async fn wait_task(&self, task: &ManagedObjectReference, deadline: Option<Duration>) -> Result<TaskInfo> {
        let info = self
            .wait("waiting for task", deadline, self.client().wait_for_task(task))
            .await?;

        match info.state {
            TaskState::Success => {
                debug!(elapsed_ms = ?info.elapsed().map(|d| d.num_milliseconds()), "Task completed");
                Ok(info)
            }
            TaskState::Error => Err(HypervisorError::TaskFault {
                task: task.to_string(),
                fault: info.error.unwrap_or_else(|| "unknown fault".to_string()),
            }),
            state => Err(HypervisorError::Internal(format!(
                "task {} returned in state {:?}",
                task, state
            ))),
        }
    }

    /// Submit `request` and wait for its task to finish.
    pub async fn run_task(&self, request: TaskRequest) -> Result<TaskInfo> {
        let operation = request.operation();
        let target = request.target().to_string();
        debug!(operation, target = %target, "Submitting task");

        let task = self
            .client()
            .submit(request)
            .await
            .map_err(|e| e.context(format!("error creating a {} task on {}", operation, target)))?;
        self.wait_task(&task, None)
            .await
            .map_err(|e| e.context(format!("{} task on {}", operation, target)))
    }

    /// Returns true if any recent task of `vm` is queued or running.
    ///
    /// Tasks whose info cannot be read are ignored.
    pub async fn has_active_task(&self, vm: &mo::VirtualMachine) -> bool {
        for task in &vm.recent_task {
            match retrieve_one::<mo::Task>(self.client(), task, &["info"]).await {
                Ok(t) if matches!(t.info.state, TaskState::Queued | TaskState::Running) => return true,
                Ok(_) => {}
                Err(e) => debug!(task = %task, error = %e, "Skipping unreadable task"),
            }
        }
        false
    }

    /// Wait for each task to finish; faults are logged, not returned.
    pub async fn wait_for_tasks(&self, tasks: &[ManagedObjectReference]) -> Result<()> {
        for task in tasks {
            match self.wait_task(task, None).await {
                Ok(_) => {}
                Err(HypervisorError::Cancelled(what)) => return Err(HypervisorError::Cancelled(what)),
                Err(e) => warn!(task = %task, error = %e, "Task finished with an error"),
            }
        }
        Ok(())
    }
}
