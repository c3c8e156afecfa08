//! Progress reporting for conversations.
//!
//! Events are queued and published in order by a single worker; publishing
//! is best-effort and a failing monitor never affects the conversation.
//! [`ProgressTracker`] keeps one conversation's events in shape; the worker
//! enforces the same invariants per task id across every tracker, so two
//! conversations reporting under one id cannot make its percent go down or
//! send a second terminal event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Percent reported as soon as a request is accepted.
pub const BASELINE_PERCENT: u8 = 10;

/// Upper bound (exclusive) for percents derived from the iteration count.
pub const ITERATION_CEILING_PERCENT: u8 = 90;

/// Percent for tools that persist the final result.
pub const SAVING_PERCENT: u8 = 95;

/// Timeout for one POST to the progress endpoint.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the worker remembers a finished task id.
const FINISHED_TASK_RETENTION: Duration = Duration::from_secs(600);

/// Substrings that mark a tool as a persistence/final-write tool.
const PERSISTENCE_KEYWORDS: &[&str] = &[
    "insert",
    "update",
    "commit",
    "save",
    "add_or_update",
    "add_to",
    "write",
];

/// Stage names reported to the monitor.
pub mod stage {
    pub const RECEIVED: &str = "received";
    pub const THINKING: &str = "thinking";
    pub const FETCHING_JIRA: &str = "fetching_jira";
    pub const SEARCHING_KNOWLEDGE: &str = "searching_knowledge";
    pub const ANALYZING_STANDARDS: &str = "analyzing_standards";
    pub const ANALYZING_CODE: &str = "analyzing_code";
    pub const RUNNING_TOOL: &str = "running_tool";
    pub const SAVING_RESULTS: &str = "saving_results";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

// ─── Event Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One progress update, as posted to the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    pub stage: String,
    pub status: ProgressStatus,
    pub message: String,
    pub progress: u8,
    /// RFC 3339.
    pub timestamp: String,
}

/// Stage reported while a tool runs.
pub fn stage_for_tool(qualified_name: &str) -> &'static str {
    let name = qualified_name.to_lowercase();
    if is_persistence_tool(&name) {
        stage::SAVING_RESULTS
    } else if name.contains("jira") {
        stage::FETCHING_JIRA
    } else if name.contains("knowledge") || name.contains("search") {
        stage::SEARCHING_KNOWLEDGE
    } else if name.contains("standard") {
        stage::ANALYZING_STANDARDS
    } else if name.contains("code") || name.contains("svn") || name.contains("file") {
        stage::ANALYZING_CODE
    } else {
        stage::RUNNING_TOOL
    }
}

/// True for tools that write the final result somewhere.
pub fn is_persistence_tool(qualified_name: &str) -> bool {
    let name = qualified_name.to_lowercase();
    PERSISTENCE_KEYWORDS.iter().any(|k| name.contains(k))
}

/// Percent for a turn: monotone in `iteration`, always in `[10, 89]`.
pub fn iteration_percent(iteration: u32, max_iterations: u32) -> u8 {
    let max = u64::from(max_iterations.max(1));
    let iteration = u64::from(iteration.min(max_iterations.max(1)));
    let span = u64::from(ITERATION_CEILING_PERCENT - BASELINE_PERCENT);
    let percent = u64::from(BASELINE_PERCENT) + span * iteration / (max + 1);
    percent.min(u64::from(ITERATION_CEILING_PERCENT - 1)) as u8
}

// ─── Sinks ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress endpoint returned HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("progress request failed: {reason}")]
    RequestFailed { reason: String },
}

/// Where progress events go.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError>;
}

/// POSTs each event as JSON to `{endpoint}/api/progress`.
pub struct HttpProgressSink {
    http: HttpClient,
    url: String,
}

impl HttpProgressSink {
    pub fn new(endpoint: &str) -> Result<Self, ProgressError> {
        let http = HttpClient::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| ProgressError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: format!("{}/api/progress", endpoint.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProgressSink for HttpProgressSink {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let response = self
            .http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| ProgressError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProgressError::HttpError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Logs events; used when no monitor is configured.
pub struct LogProgressSink;

#[async_trait]
impl ProgressSink for LogProgressSink {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        tracing::info!(
            task_id = %event.task_id,
            stage = %event.stage,
            status = ?event.status,
            progress = event.progress,
            "{}",
            event.message
        );
        Ok(())
    }
}

// ─── Broadcaster ────────────────────────────────────────────────────────────

/// Fire-and-forget publisher. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressBroadcaster {
    /// Start the publishing worker.
    ///
    /// The worker ends once every clone of the broadcaster is dropped and
    /// the queue is drained.
    pub fn spawn(sink: Arc<dyn ProgressSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let worker = tokio::spawn(async move {
            let mut ledger = TaskLedger::default();
            while let Some(event) = rx.recv().await {
                let Some(event) = ledger.admit(event, Instant::now()) else {
                    continue;
                };
                if let Err(e) = sink.publish(&event).await {
                    tracing::warn!(
                        task_id = %event.task_id,
                        stage = %event.stage,
                        error = %e,
                        "failed to publish progress"
                    );
                }
            }
        });
        (Self { tx }, worker)
    }

    /// Queue an event. Never blocks, never fails.
    pub fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("progress worker stopped, event dropped");
        }
    }

    /// Tracker for one conversation.
    pub fn tracker(&self, task_id: &str) -> ProgressTracker {
        ProgressTracker {
            task_id: task_id.to_string(),
            broadcaster: self.clone(),
            last_percent: 0,
            finished: false,
        }
    }
}

// ─── Task Ledger ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TaskState {
    last_percent: u8,
    finished_at: Option<Instant>,
}

/// Published history per task id, owned by the worker.
#[derive(Debug, Default)]
struct TaskLedger {
    tasks: HashMap<String, TaskState>,
}

impl TaskLedger {
    /// Clamp `event` against its task's history.
    ///
    /// Returns `None` once the task has had its terminal event. Finished ids
    /// are forgotten after `FINISHED_TASK_RETENTION`.
    fn admit(&mut self, mut event: ProgressEvent, now: Instant) -> Option<ProgressEvent> {
        self.tasks.retain(|_, task| {
            task.finished_at
                .map_or(true, |at| now.duration_since(at) < FINISHED_TASK_RETENTION)
        });

        let task = self
            .tasks
            .entry(event.task_id.clone())
            .or_insert(TaskState {
                last_percent: 0,
                finished_at: None,
            });
        if task.finished_at.is_some() {
            tracing::debug!(
                task_id = %event.task_id,
                stage = %event.stage,
                "task already finished, progress dropped"
            );
            return None;
        }

        event.progress = event.progress.min(100).max(task.last_percent);
        task.last_percent = event.progress;
        if event.status.is_terminal() {
            task.finished_at = Some(now);
        }
        Some(event)
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

/// Per-task view of the broadcaster that keeps percents non-decreasing and
/// stops after the first terminal event.
pub struct ProgressTracker {
    task_id: String,
    broadcaster: ProgressBroadcaster,
    last_percent: u8,
    finished: bool,
}

impl ProgressTracker {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Emit an event, clamping the percent to `[last, 100]`.
    ///
    /// Returns the percent sent, or `None` after a terminal event.
    pub fn emit(
        &mut self,
        stage: &str,
        status: ProgressStatus,
        message: &str,
        percent: u8,
    ) -> Option<u8> {
        if self.finished {
            tracing::debug!(task_id = %self.task_id, stage, "progress after terminal event ignored");
            return None;
        }

        let percent = percent.min(100).max(self.last_percent);
        self.last_percent = percent;
        self.finished = status.is_terminal();

        self.broadcaster.emit(ProgressEvent {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            status,
            message: message.to_string(),
            progress: percent,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        Some(percent)
    }

    pub fn received(&mut self, message: &str) {
        self.emit(
            stage::RECEIVED,
            ProgressStatus::InProgress,
            message,
            BASELINE_PERCENT,
        );
    }

    pub fn completed(&mut self, message: &str) {
        self.emit(stage::COMPLETED, ProgressStatus::Completed, message, 100);
    }

    /// Terminal error event at the current percent.
    pub fn failed(&mut self, message: &str) {
        let percent = self.last_percent;
        self.emit(stage::FAILED, ProgressStatus::Error, message, percent);
    }
}

// ─── Test Support ───────────────────────────────────────────────────────────


// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl ProgressSink for FailingSink {
        async fn publish(&self, _event: &ProgressEvent) -> Result<(), ProgressError> {
            Err(ProgressError::RequestFailed {
                reason: "monitor down".into(),
            })
        }
    }

    #[test]
    fn test_iteration_percent_is_monotone_and_bounded() {
        for max in [1u32, 3, 10, 50] {
            let mut last = 0;
            for iteration in 0..=max + 2 {
                let p = iteration_percent(iteration, max);
                assert!((10..90).contains(&p), "max={max} iter={iteration} p={p}");
                assert!(p >= last);
                last = p;
            }
        }
        assert_eq!(iteration_percent(0, 10), 10);
        assert_eq!(iteration_percent(1, 10), 17);
    }

    #[test]
    fn test_stage_for_tool() {
        assert_eq!(stage_for_tool("devmind__get_jira_issue"), stage::FETCHING_JIRA);
        assert_eq!(stage_for_tool("kb__search_docs"), stage::SEARCHING_KNOWLEDGE);
        assert_eq!(stage_for_tool("std__get_oracle_standards"), stage::ANALYZING_STANDARDS);
        assert_eq!(stage_for_tool("svn__get_file"), stage::ANALYZING_CODE);
        assert_eq!(stage_for_tool("misc__ping"), stage::RUNNING_TOOL);
        assert_eq!(stage_for_tool("devmind__insert_jira_prompt"), stage::SAVING_RESULTS);
        assert!(is_persistence_tool("x__ADD_OR_UPDATE_entry"));
    }

    #[test]
    fn test_event_wire_format() {
        let event = ProgressEvent {
            task_id: "CMU-102".into(),
            stage: stage::THINKING.into(),
            status: ProgressStatus::InProgress,
            message: "Thinking".into(),
            progress: 17,
            timestamp: "2026-01-01T00:00:00+00:00".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["taskId"], "CMU-102");
        assert_eq!(json["status"], "in-progress");
        assert_eq!(json["progress"], 17);
    }

    #[tokio::test]
    async fn test_tracker_clamps_and_stops_after_terminal() {
        let sink = Arc::new(RecordingSink::default());
        let (broadcaster, worker) = ProgressBroadcaster::spawn(sink.clone());
        let mut tracker = broadcaster.tracker("T-1");
        drop(broadcaster);

        tracker.received("accepted");
        assert_eq!(
            tracker.emit(stage::THINKING, ProgressStatus::InProgress, "", 40),
            Some(40)
        );
        assert_eq!(
            tracker.emit(stage::THINKING, ProgressStatus::InProgress, "", 20),
            Some(40)
        );
        tracker.completed("done");
        assert!(tracker.is_finished());
        assert_eq!(tracker.emit(stage::THINKING, ProgressStatus::InProgress, "", 50), None);
        tracker.failed("late");
        drop(tracker);
        worker.await.unwrap();

        let events = sink.events();
        let percents: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert_eq!(percents, vec![10, 40, 40, 100]);
        assert_eq!(events.last().unwrap().status, ProgressStatus::Completed);
        assert!(chrono::DateTime::parse_from_rfc3339(&events[0].timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_failed_keeps_last_percent() {
        let sink = Arc::new(RecordingSink::default());
        let (broadcaster, worker) = ProgressBroadcaster::spawn(sink.clone());
        let mut tracker = broadcaster.tracker("T-2");
        drop(broadcaster);

        tracker.emit(stage::THINKING, ProgressStatus::InProgress, "", 33);
        tracker.failed("iteration limit");
        drop(tracker);
        worker.await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, ProgressStatus::Error);
        assert_eq!(events[1].progress, 33);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_propagated() {
        let (broadcaster, worker) = ProgressBroadcaster::spawn(Arc::new(FailingSink));
        let mut tracker = broadcaster.tracker("T-3");
        tracker.received("accepted");
        tracker.completed("done");
        drop(tracker);
        drop(broadcaster);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_task_id_stays_monotone_with_one_terminal() {
        let sink = Arc::new(RecordingSink::default());
        let (broadcaster, worker) = ProgressBroadcaster::spawn(sink.clone());
        let mut first = broadcaster.tracker("CMU-102");
        let mut second = broadcaster.tracker("CMU-102");
        drop(broadcaster);

        first.received("first accepted");
        first.emit(stage::FETCHING_JIRA, ProgressStatus::InProgress, "", 40);
        second.received("second accepted");
        second.emit(stage::THINKING, ProgressStatus::InProgress, "", 17);
        first.completed("first done");
        second.emit(stage::THINKING, ProgressStatus::InProgress, "", 50);
        second.failed("second stopped");
        drop((first, second));
        worker.await.unwrap();

        let events = sink.events();
        let percents: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert_eq!(percents, vec![10, 40, 40, 40, 100]);
        assert_eq!(events.iter().filter(|e| e.status.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().status, ProgressStatus::Completed);
    }

    fn event(task_id: &str, status: ProgressStatus, progress: u8) -> ProgressEvent {
        ProgressEvent {
            task_id: task_id.into(),
            stage: stage::THINKING.into(),
            status,
            message: String::new(),
            progress,
            timestamp: String::new(),
        }
    }

    #[test]
    fn test_ledger_forgets_finished_tasks_after_retention() {
        let mut ledger = TaskLedger::default();
        let start = Instant::now();

        assert!(ledger
            .admit(event("T-5", ProgressStatus::Completed, 100), start)
            .is_some());
        assert!(ledger
            .admit(event("T-5", ProgressStatus::InProgress, 10), start)
            .is_none());

        let later = start + FINISHED_TASK_RETENTION;
        let reopened = ledger
            .admit(event("T-5", ProgressStatus::InProgress, 10), later)
            .unwrap();
        assert_eq!(reopened.progress, 10);
        assert_eq!(
            ledger
                .admit(event("T-6", ProgressStatus::InProgress, 120), later)
                .unwrap()
                .progress,
            100
        );
    }

    #[test]
    fn test_http_sink_url() {
        let sink = HttpProgressSink::new("http://127.0.0.1:5002/").unwrap();
        assert_eq!(sink.url(), "http://127.0.0.1:5002/api/progress");
    }
}
