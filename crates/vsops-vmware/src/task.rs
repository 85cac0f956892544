//! Task driver: waits on server-side tasks with exponential backoff.
//!
//! The sleep before poll `n` is `min(2^n + uniform(0,1), 64)` seconds, cut
//! short by the remaining deadline. A task is never resubmitted. A deadline
//! breach returns [`TaskOutcome::TimedOut`] without cancelling server-side;
//! an explicit cancel posts `CancelTask` when the task allows it and then
//! waits one more poll cycle.

use crate::api::VimApi;
use crate::error::from_fault;
use crate::props::{bool_at, i64_at, str_at};
use crate::types::{MoRef, RetrieveSpec};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use vsops_core::{VsError, VsResult};

pub const MAX_BACKOFF: Duration = Duration::from_secs(64);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Task model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which poll method a task answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlavor {
    /// vim25 `Task`, polled through the property collector.
    Vim,
    /// Storage-monitoring `SmsTask`, polled with `QueryTaskInfo`.
    Storage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRef {
    pub moref: MoRef,
    pub flavor: TaskFlavor,
}

impl TaskRef {
    pub fn new(moref: MoRef, flavor: TaskFlavor) -> Self {
        Self { moref, flavor }
    }

    /// Read the task reference a `*_Task` method returned.
    pub fn from_value(v: &Value, flavor: TaskFlavor) -> VsResult<Self> {
        MoRef::from_value(v)
            .map(|moref| Self::new(moref, flavor))
            .ok_or_else(|| VsError::protocol(format!("expected a task reference, got {v}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn parse(s: &str) -> VsResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(VsError::protocol(format!("unknown task state '{other}'"))),
        }
    }
}

/// Normalized task fault.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFault {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl TaskFault {
    fn from_info(info: &Value) -> Self {
        let error = info.get("error").cloned().unwrap_or(Value::Null);
        let code = str_at(&error, "fault._type")
            .or_else(|| str_at(&error, "_type"))
            .unwrap_or("SystemError")
            .to_string();
        let message = str_at(&error, "localizedMessage")
            .or_else(|| str_at(&error, "fault.msg"))
            .unwrap_or_default()
            .to_string();
        Self {
            code,
            message,
            details: error.get("fault").cloned().unwrap_or(Value::Null),
        }
    }
}

/// One snapshot of a task's state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub result: Value,
    pub fault: Option<TaskFault>,
    pub progress: Option<i64>,
    pub cancelable: bool,
}

impl TaskInfo {
    pub fn from_value(info: &Value) -> VsResult<Self> {
        let state = TaskState::parse(
            str_at(info, "state").ok_or_else(|| VsError::protocol("task info has no state"))?,
        )?;
        Ok(Self {
            state,
            result: info.get("result").cloned().unwrap_or(Value::Null),
            fault: (state == TaskState::Error).then(|| TaskFault::from_info(info)),
            progress: i64_at(info, "progress"),
            cancelable: bool_at(info, "cancelable").unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Value),
    Failure(TaskFault),
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    /// Collapse into a result; `what` names the task in error messages.
    pub fn into_result(self, what: &str) -> VsResult<Value> {
        match self {
            Self::Success(v) => Ok(v),
            Self::Failure(f) => {
                let message = if f.message.is_empty() {
                    format!("{what} failed: {}", f.code)
                } else {
                    format!("{what} failed: {}", f.message)
                };
                Err(from_fault(&f.code, &message, Some(f.details)))
            }
            Self::TimedOut => Err(VsError::timed_out(format!(
                "{what} did not complete before the deadline"
            ))),
            Self::Cancelled => Err(VsError::cancelled(format!("{what} was cancelled"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caller-side trigger.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by long waits.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Backoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { max: MAX_BACKOFF }
    }
}

impl Backoff {
    /// `min(2^attempt + jitter, max)` seconds, `jitter` in `[0, 1)`.
    pub fn delay_with(&self, attempt: u32, jitter: f64) -> Duration {
        let base = 2f64.powi(attempt.min(30) as i32);
        Duration::from_secs_f64(base + jitter).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with(attempt, jitter)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskDriver {
    vim: Arc<dyn VimApi>,
    sms: Arc<dyn VimApi>,
    backoff: Backoff,
    cancel: CancelSignal,
}

impl TaskDriver {
    pub fn new(vim: Arc<dyn VimApi>, sms: Arc<dyn VimApi>, cancel: CancelSignal) -> Self {
        Self {
            vim,
            sms,
            backoff: Backoff::default(),
            cancel,
        }
    }

    /// Poll once.
    pub async fn poll(&self, task: &TaskRef) -> VsResult<TaskInfo> {
        let raw = match task.flavor {
            TaskFlavor::Vim => {
                let found = self
                    .vim
                    .retrieve(&RetrieveSpec::objects(vec![task.moref.clone()], "Task", &["info"]))
                    .await?;
                found
                    .into_iter()
                    .next()
                    .and_then(|oc| oc.props.get("info").cloned())
                    .ok_or_else(|| VsError::protocol(format!("task {} has no info", task.moref)))?
            }
            TaskFlavor::Storage => self.sms.invoke(&task.moref, "QueryTaskInfo", vec![]).await?,
        };
        TaskInfo::from_value(&raw)
    }

    /// Wait for `task` to reach a terminal state within `deadline`.
    pub async fn wait(&self, task: &TaskRef, deadline: Duration) -> VsResult<TaskOutcome> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut last: Option<TaskInfo> = None;
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::warn!(task = %task.moref, ?deadline, "task deadline reached");
                return Ok(TaskOutcome::TimedOut);
            }
            let delay = self.backoff.delay(attempt).min(remaining);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return self.cancel_task(task, last.as_ref(), delay).await;
                }
            }

            let info = self.poll(task).await?;
            tracing::debug!(task = %task.moref, state = ?info.state, progress = ?info.progress, "task poll");
            match info.state {
                TaskState::Queued | TaskState::Running => last = Some(info),
                TaskState::Success => return Ok(TaskOutcome::Success(info.result)),
                TaskState::Error => {
                    let fault = info.fault.unwrap_or_else(|| TaskFault {
                        code: "SystemError".into(),
                        message: String::new(),
                        details: Value::Null,
                    });
                    return Ok(TaskOutcome::Failure(fault));
                }
            }
        }
    }

    /// Request cancellation, wait one cycle, report what the server settled on.
    async fn cancel_task(
        &self,
        task: &TaskRef,
        last: Option<&TaskInfo>,
        cycle: Duration,
    ) -> VsResult<TaskOutcome> {
        let cancelable = last.map(|i| i.cancelable).unwrap_or(true);
        if task.flavor == TaskFlavor::Vim && cancelable {
            tracing::info!(task = %task.moref, "cancelling task");
            if let Err(e) = self.vim.invoke(&task.moref, "CancelTask", vec![]).await {
                tracing::warn!(task = %task.moref, error = %e, "CancelTask failed");
            }
        }
        tokio::time::sleep(cycle).await;
        match self.poll(task).await {
            Ok(info) if info.state == TaskState::Success => Ok(TaskOutcome::Success(info.result)),
            Ok(_) => Ok(TaskOutcome::Cancelled),
            Err(e) => {
                tracing::warn!(task = %task.moref, error = %e, "poll after cancel failed");
                Ok(TaskOutcome::Cancelled)
            }
        }
    }

    /// Wait and collapse the outcome into a result.
    pub async fn run(&self, task: &TaskRef, deadline: Duration, what: &str) -> VsResult<Value> {
        self.wait(task, deadline).await?.into_result(what)
    }
}
