//! The task (job) model: parsing of the JSON task envelope, completion state,
//! result publication and the bounded wait/revoke protocol.

use crate::error::WorkerError;
use crate::worker::Responder;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where a task is in its lifecycle. Every state but `InProgress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
    Revoked,
}

impl JobStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobStatus::InProgress,
            1 => JobStatus::Completed,
            2 => JobStatus::Failed,
            _ => JobStatus::Revoked,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobStatus::InProgress => 0,
            JobStatus::Completed => 1,
            JobStatus::Failed => 2,
            JobStatus::Revoked => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != JobStatus::InProgress
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::InProgress => "in progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// Wire shape of an incoming task message.
#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    id: String,
    task: String,
    #[serde(default)]
    args: Option<Vec<Value>>,
    #[serde(default)]
    kwargs: Option<Map<String, Value>>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    eta: Option<String>,
    #[serde(default)]
    expires: Option<String>,
}

/// Result document published for a finished task.
#[derive(Debug, Serialize)]
struct ResultMessage<'a> {
    task_id: &'a str,
    status: &'a str,
    result: Value,
    traceback: Option<String>,
    children: Vec<Value>,
}

/// One unit of work received from the queue.
///
/// Clones share the completion state, so the handler and anyone waiting on
/// the task observe the same transitions.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    name: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    retries: u32,
    eta: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    status: Arc<AtomicU8>,
    responder: Option<Responder>,
}

impl Task {
    /// Creates an in-progress task that is not attached to any worker.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            retries: 0,
            eta: None,
            expires: None,
            status: Arc::new(AtomicU8::new(JobStatus::InProgress.as_u8())),
            responder: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Parses a JSON task message.
    ///
    /// `id` and `task` are required and must not be blank; `args`, `kwargs`,
    /// `retries`, `eta` and `expires` are optional. Every failure comes back as
    /// [`WorkerError::MalformedTask`].
    pub fn from_json(body: &[u8]) -> Result<Self, WorkerError> {
        let envelope: TaskEnvelope =
            serde_json::from_slice(body).map_err(|e| WorkerError::malformed(e.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(WorkerError::malformed("task id is empty"));
        }
        if envelope.task.trim().is_empty() {
            return Err(WorkerError::malformed("task name is empty"));
        }

        let eta = envelope.eta.as_deref().map(parse_timestamp).transpose()?;
        let expires = envelope.expires.as_deref().map(parse_timestamp).transpose()?;

        Ok(Self {
            args: envelope.args.unwrap_or_default(),
            kwargs: envelope.kwargs.unwrap_or_default(),
            retries: envelope.retries.unwrap_or_default(),
            eta,
            expires,
            ..Self::new(envelope.id, envelope.task)
        })
    }

    pub(crate) fn attach(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The registered task name, e.g. `tasks.add`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.eta
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Whether `expires` lies before `now`. Expired tasks are revoked
    /// instead of run.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(false, |expires| expires < now)
    }

    /// Routing key responses for this task are published under.
    pub fn routing_key(&self) -> String {
        routing_key(&self.id)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_in_progress(&self) -> bool {
        self.status() == JobStatus::InProgress
    }

    pub fn is_revoked(&self) -> bool {
        self.status() == JobStatus::Revoked
    }

    /// Abandons the task. Returns `false` if it had already reached a terminal state.
    pub fn revoke(&self) -> bool {
        self.transition(JobStatus::Revoked)
    }

    pub(crate) fn mark_completed(&self) -> bool {
        self.transition(JobStatus::Completed)
    }

    pub(crate) fn mark_failed(&self) -> bool {
        self.transition(JobStatus::Failed)
    }

    fn transition(&self, to: JobStatus) -> bool {
        self.status
            .compare_exchange(
                JobStatus::InProgress.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Publishes a raw JSON payload for this task on the worker's response exchange.
    pub async fn respond(&self, payload: &str) {
        match &self.responder {
            Some(responder) => responder.respond(&self.id, payload).await,
            None => log::warn!(
                "Task {} is not attached to a worker, dropping response",
                self.id
            ),
        }
    }

    /// Marks the task completed and publishes a `SUCCESS` result.
    ///
    /// Does nothing and returns `false` if the task was already completed,
    /// failed or revoked.
    pub async fn complete(&self, result: Value) -> bool {
        if !self.transition(JobStatus::Completed) {
            log::debug!("Task {} is already {}, not completing it", self.id, self.status());
            return false;
        }
        self.publish_result("SUCCESS", result).await;
        true
    }

    /// Marks the task failed and publishes a `FAILURE` result carrying `error`.
    pub async fn fail(&self, error: impl fmt::Display) -> bool {
        if !self.transition(JobStatus::Failed) {
            log::debug!("Task {} is already {}, not failing it", self.id, self.status());
            return false;
        }
        let result = json!({ "exc_type": "TaskError", "exc_message": error.to_string() });
        self.publish_result("FAILURE", result).await;
        true
    }

    async fn publish_result(&self, status: &str, result: Value) {
        let message = ResultMessage {
            task_id: &self.id,
            status,
            result,
            traceback: None,
            children: Vec::new(),
        };
        match serde_json::to_string(&message) {
            Ok(payload) => self.respond(&payload).await,
            Err(e) => log::error!("Unable to encode result of task {}: {}", self.id, e),
        }
    }
}

/// Turns a task id into a routing key by dropping the hyphens.
pub fn routing_key(id: &str) -> String {
    id.replace('-', "")
}

/// Polls `task` every `poll_interval` until it leaves `InProgress` or
/// `timeout` elapses, revoking it in the latter case.
///
/// Never waits much longer than `timeout` and returns the final status.
pub async fn wait_until_completed(
    task: &Task,
    timeout: Duration,
    poll_interval: Duration,
) -> JobStatus {
    let finished = tokio::time::timeout(timeout, async {
        while task.is_in_progress() {
            tokio::time::sleep(poll_interval).await;
        }
    })
    .await;

    if finished.is_err() && task.revoke() {
        log::warn!(
            "Task {} did not complete within {:?}, revoked it",
            task.id(),
            timeout
        );
    }
    task.status()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, WorkerError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| WorkerError::malformed(format!("invalid timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    #[test]
    fn parses_a_full_envelope() {
        let body = br#"{
            "id": "5e5d5f2a-1c3a-4d0e-9a55-3f8f0c6b9d11",
            "task": "tasks.add",
            "args": [2, 3],
            "kwargs": {"round": true},
            "retries": 1,
            "eta": "2024-05-01T12:30:00+00:00",
            "expires": "2024-05-01T13:00:00.250000"
        }"#;

        let task = Task::from_json(body).unwrap();

        assert_eq!(task.id(), "5e5d5f2a-1c3a-4d0e-9a55-3f8f0c6b9d11");
        assert_eq!(task.name(), "tasks.add");
        assert_eq!(task.args(), &[json!(2), json!(3)]);
        assert_eq!(task.kwargs()["round"], json!(true));
        assert_eq!(task.retries(), 1);
        assert_eq!(task.eta(), Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()));
        assert!(task.expires().is_some());
        assert_eq!(task.status(), JobStatus::InProgress);
        assert_eq!(task.routing_key(), "5e5d5f2a1c3a4d0e9a553f8f0c6b9d11");
    }

    #[test]
    fn optional_fields_may_be_missing_or_null() {
        let task = Task::from_json(br#"{"id": "abc", "task": "ping", "args": null}"#).unwrap();
        assert!(task.args().is_empty());
        assert!(task.kwargs().is_empty());
        assert_eq!(task.eta(), None);
    }

    #[test]
    fn rejects_messages_that_are_not_tasks() {
        let cases: [&[u8]; 5] = [
            b"not json",
            br#"["tasks.add", 1]"#,
            br#"{"task": "tasks.add"}"#,
            br#"{"id": " ", "task": "tasks.add"}"#,
            br#"{"id": "abc", "task": "tasks.add", "eta": "tomorrow"}"#,
        ];

        for body in cases {
            let err = Task::from_json(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedInput, "{}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn routing_keys_drop_hyphens() {
        assert_eq!(routing_key("abc-123-xyz"), "abc123xyz");
        assert_eq!(routing_key("plain"), "plain");
    }

    #[test]
    fn terminal_states_are_final() {
        let task = Task::new("abc", "tasks.add");
        let waiter = task.clone();

        assert!(task.revoke());
        assert!(waiter.is_revoked());
        assert!(!task.revoke());
        assert!(!task.mark_failed());
        assert!(!task.mark_completed());
        assert_eq!(task.status(), JobStatus::Revoked);
    }

    #[test]
    fn expiry_is_checked_against_the_given_instant() {
        let body = br#"{"id": "abc", "task": "tasks.add", "expires": "2024-05-01T13:00:00Z"}"#;
        let task = Task::from_json(body).unwrap();

        assert!(!task.is_expired_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 59, 59).unwrap()));
        assert!(task.is_expired_at(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 1).unwrap()));
        assert!(!Task::new("forever", "tasks.add").is_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn completing_a_revoked_task_is_a_no_op() {
        let task = Task::new("abc", "tasks.add");
        task.revoke();

        assert!(!task.complete(json!(5)).await);
        assert_eq!(task.status(), JobStatus::Revoked);
    }

    #[tokio::test]
    async fn unattached_tasks_still_complete() {
        let task = Task::new("abc", "tasks.add");
        assert!(task.complete(json!(5)).await);
        assert_eq!(task.status(), JobStatus::Completed);
        assert!(!task.fail("late").await);
    }

    #[tokio::test]
    async fn wait_revokes_tasks_that_never_finish() {
        let task = Task::new("stuck", "tasks.sleep");
        let started = std::time::Instant::now();

        let status =
            wait_until_completed(&task, Duration::from_millis(50), Duration::from_millis(5)).await;

        assert_eq!(status, JobStatus::Revoked);
        assert!(task.is_revoked());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn wait_returns_once_the_task_completes() {
        let task = Task::new("quick", "tasks.add");
        let worker_side = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker_side.complete(json!(1)).await;
        });

        let status =
            wait_until_completed(&task, Duration::from_secs(5), Duration::from_millis(5)).await;

        assert_eq!(status, JobStatus::Completed);
    }
}
