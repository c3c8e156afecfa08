//! Conversation orchestrator: the bounded agent loop.
//!
//! One request becomes a sequence of model turns. Each turn either answers
//! (no tool calls, the loop is done) or asks for tools, which are executed
//! and appended to the transcript before the next turn:
//!
//! ```text
//! AwaitingModelTurn ──(no calls)──▶ Done
//!        ▲    │
//!        │    └──(calls)──▶ ExecutingTools
//!        └──────────────────────┘
//! ```
//!
//! The iteration ceiling turns a loop that never settles into an explicit
//! `Incomplete` outcome. Tool failures never end the loop: they become error
//! text in the transcript and the model decides what to do next.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::agent_core::errors::AgentError;
use crate::agent_core::progress::{
    is_persistence_tool, iteration_percent, stage, stage_for_tool, ProgressBroadcaster,
    ProgressStatus, ProgressTracker, SAVING_PERCENT,
};
use crate::agent_core::tool_prefilter::ToolPrefilter;
use crate::agent_core::types::{
    truncate_utf8, ConversationOutcome, ConversationRequest, ToolResult, Transcript,
};
use crate::inference::client::ModelCapability;
use crate::inference::types::{InvalidToolCall, ModelFragment, ToolCall, ToolDefinition};
use crate::mcp_client::registry::capability_summary;
use crate::mcp_client::{ServerCatalog, ToolGateway};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default ceiling on model turns per request.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default number of tool calls of one turn that run at the same time.
pub const DEFAULT_MAX_PARALLEL_TOOLS: usize = 4;

/// Maximum bytes of a single tool result kept in the transcript.
///
/// One verbose result (a whole file, a long issue history) would otherwise
/// crowd every later turn out of the context window.
const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// Text recorded for a tool call that returned nothing (e.g. timed out).
const EMPTY_RESULT_TEXT: &str = "(no information returned)";

const SYSTEM_PROMPT_INTRO: &str = "\
You are a development assistant that answers questions about issues, code and \
team standards. You can call tools exposed by several tool servers.";

const SYSTEM_PROMPT_RULES: &str = "\
Rules:\n\
1. Call tools by their full name, `<server>__<tool>`, exactly as listed.\n\
2. Only report what tool results actually say. If a result is empty or an \
error, say so instead of guessing.\n\
3. When you have enough information, answer without calling more tools.";

/// System prompt for one turn: intro, capability summary, rules.
fn build_system_prompt(catalogs: &[ServerCatalog]) -> String {
    let capabilities = capability_summary(catalogs);
    format!("{SYSTEM_PROMPT_INTRO}\n\n{capabilities}\n\n{SYSTEM_PROMPT_RULES}")
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub max_parallel_tools: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_parallel_tools: DEFAULT_MAX_PARALLEL_TOOLS,
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// A tool call as the model issued it.
#[derive(Debug, Clone)]
enum PlannedCall {
    Valid(ToolCall),
    /// Never reaches the gateway; answered with an error result.
    Invalid(InvalidToolCall),
}

impl PlannedCall {
    fn id(&self) -> &str {
        match self {
            Self::Valid(call) => &call.id,
            Self::Invalid(call) => &call.id,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Valid(call) => &call.name,
            Self::Invalid(call) => &call.name,
        }
    }

    /// The call as recorded in the transcript. Unparsable arguments are
    /// recorded as `{}`; the raw text goes into the error result.
    fn into_transcript_call(self) -> ToolCall {
        match self {
            Self::Valid(call) => call,
            Self::Invalid(call) => ToolCall {
                id: call.id,
                name: call.name,
                arguments: serde_json::json!({}),
            },
        }
    }
}

/// Text and tool calls of one model turn.
#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    calls: Vec<PlannedCall>,
}

/// Runs conversations against a model and a tool gateway.
///
/// Shared by every connection; each `run` owns its own transcript.
pub struct Orchestrator {
    model: Arc<dyn ModelCapability>,
    gateway: Arc<dyn ToolGateway>,
    progress: ProgressBroadcaster,
    prefilter: ToolPrefilter,
    config: LoopConfig,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelCapability>,
        gateway: Arc<dyn ToolGateway>,
        progress: ProgressBroadcaster,
        config: LoopConfig,
    ) -> Self {
        Self {
            model,
            gateway,
            progress,
            prefilter: ToolPrefilter::default(),
            config,
        }
    }

    pub fn with_prefilter(mut self, prefilter: ToolPrefilter) -> Self {
        self.prefilter = prefilter;
        self
    }

    pub fn config(&self) -> LoopConfig {
        self.config
    }

    /// Run one conversation to completion.
    ///
    /// Returns `Done` or `Incomplete`; `Err` only when the conversation as a
    /// whole is impossible (no model, cancelled, invalid request). Exactly
    /// one terminal progress event is emitted for every accepted request.
    pub async fn run(
        &self,
        request: &ConversationRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversationOutcome, AgentError> {
        if request.prompt.trim().is_empty() {
            return Err(AgentError::InvalidRequest {
                reason: "prompt is empty".into(),
            });
        }

        let mut progress = self.progress.tracker(&request.task_id);
        progress.received("Request received");

        tracing::info!(
            request_id = %request.request_id,
            task_id = %request.task_id,
            max_iterations = self.config.max_iterations,
            "conversation started"
        );

        let result = self.run_loop(request, cancel, &mut progress).await;

        match &result {
            Ok(ConversationOutcome::Done { iterations, .. }) => {
                progress.completed("Completed");
                tracing::info!(request_id = %request.request_id, iterations, "conversation done");
            }
            Ok(ConversationOutcome::Incomplete {
                iterations,
                message,
                ..
            }) => {
                progress.failed(message);
                tracing::warn!(
                    request_id = %request.request_id,
                    iterations,
                    "conversation incomplete: {message}"
                );
            }
            Err(e) => {
                progress.failed(&e.to_string());
                tracing::warn!(request_id = %request.request_id, error = %e, "conversation failed");
            }
        }
        result
    }

    async fn run_loop(
        &self,
        request: &ConversationRequest,
        cancel: &CancellationToken,
        progress: &mut ProgressTracker,
    ) -> Result<ConversationOutcome, AgentError> {
        let max_iterations = self.config.max_iterations;
        let mut transcript = Transcript::new(&request.prompt);
        let mut last_text = String::new();
        let mut iteration: u32 = 0;

        loop {
            iteration += 1;
            if iteration > max_iterations {
                return Ok(ConversationOutcome::Incomplete {
                    text: last_text,
                    iterations: max_iterations,
                    last_percent: progress.last_percent(),
                    message: format!(
                        "Stopped after {max_iterations} model turns; the task may not have finished"
                    ),
                });
            }

            let percent = iteration_percent(iteration, max_iterations);
            progress.emit(
                stage::THINKING,
                ProgressStatus::InProgress,
                &format!("Model turn {iteration}"),
                percent,
            );

            // Catalogs may have filled since the previous turn
            let catalogs = self.gateway.catalogs();
            let tools: Vec<ToolDefinition> = self
                .prefilter
                .select(&request.prompt, &catalogs)
                .iter()
                .map(|t| t.to_tool_definition())
                .collect();
            let system_prompt = build_system_prompt(&catalogs);

            tracing::debug!(
                request_id = %request.request_id,
                round = iteration,
                tool_count = tools.len(),
                transcript_len = transcript.len(),
                "model turn"
            );

            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(request)),
                turn = self.model_turn(&system_prompt, &transcript, &tools) => turn?,
            };

            if turn.calls.is_empty() {
                return Ok(ConversationOutcome::Done {
                    text: turn.text,
                    iterations: iteration,
                });
            }

            for call in &turn.calls {
                let name = call.name();
                let (stage, percent) = if is_persistence_tool(name) {
                    (stage::SAVING_RESULTS, SAVING_PERCENT)
                } else {
                    (stage_for_tool(name), percent)
                };
                progress.emit(
                    stage,
                    ProgressStatus::InProgress,
                    &format!("Calling {name}"),
                    percent,
                );
            }

            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(request)),
                results = self.execute_tools(&turn.calls) => results,
            };

            if !turn.text.trim().is_empty() {
                last_text = turn.text.clone();
            }
            let calls = turn
                .calls
                .into_iter()
                .map(PlannedCall::into_transcript_call)
                .collect();
            transcript.push_model_turn(&turn.text, calls);
            transcript.push_tool_results(results);
        }
    }

    /// Ask the model for one turn and collect its fragments.
    ///
    /// A stream error ends the turn with whatever arrived before it. An
    /// unparsable tool call does not: it is kept and answered with an error.
    async fn model_turn(
        &self,
        system_prompt: &str,
        transcript: &Transcript,
        tools: &[ToolDefinition],
    ) -> Result<TurnOutput, AgentError> {
        let mut fragments = self.model.submit(system_prompt, transcript, tools).await?;
        let mut turn = TurnOutput::default();
        let mut seen_ids: HashSet<String> = HashSet::new();

        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(ModelFragment::Text(text)) => turn.text.push_str(&text),
                Ok(ModelFragment::ToolCall(call)) => {
                    push_call(&mut turn, &mut seen_ids, PlannedCall::Valid(call))
                }
                Ok(ModelFragment::InvalidToolCall(call)) => {
                    push_call(&mut turn, &mut seen_ids, PlannedCall::Invalid(call))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "model stream ended with an error");
                    break;
                }
            }
        }
        Ok(turn)
    }

    /// Execute every call of a turn, at most `max_parallel_tools` at a time.
    ///
    /// Results come back in call order.
    async fn execute_tools(&self, calls: &[PlannedCall]) -> Vec<ToolResult> {
        let parallelism = self.config.max_parallel_tools.max(1);
        // Futures are built up front: a mapping closure over `&self` would
        // make the conversation future lose `Send` for `tokio::spawn`.
        let pending: Vec<_> = calls.iter().map(|call| self.execute_tool(call)).collect();
        stream::iter(pending).buffered(parallelism).collect().await
    }

    async fn execute_tool(&self, planned: &PlannedCall) -> ToolResult {
        let call = match planned {
            PlannedCall::Valid(call) => call,
            PlannedCall::Invalid(bad) => {
                tracing::warn!(tool = %bad.name, reason = %bad.reason, "tool call not executed");
                return ToolResult {
                    call_id: bad.id.clone(),
                    name: bad.name.clone(),
                    content: truncate_result(format!(
                        "Error: invalid arguments for {}: {}. Arguments received: {}",
                        bad.name, bad.reason, bad.raw_arguments
                    )),
                    is_error: true,
                };
            }
        };

        let start = std::time::Instant::now();
        let outcome = self
            .gateway
            .invoke(&call.name, call.arguments.clone())
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (content, is_error) = match outcome {
            Ok(text) if text.is_empty() => (EMPTY_RESULT_TEXT.to_string(), false),
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, elapsed_ms, "tool call failed");
                (format!("Error: {e}"), true)
            }
        };
        if !is_error {
            tracing::info!(tool = %call.name, elapsed_ms, result_len = content.len(), "tool call ok");
        }

        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: truncate_result(content),
            is_error,
        }
    }
}

fn push_call(turn: &mut TurnOutput, seen_ids: &mut HashSet<String>, call: PlannedCall) {
    if seen_ids.insert(call.id().to_string()) {
        turn.calls.push(call);
    } else {
        tracing::debug!(call_id = %call.id(), "duplicate tool call id ignored");
    }
}

fn cancelled(request: &ConversationRequest) -> AgentError {
    AgentError::Cancelled {
        request_id: request.request_id.clone(),
    }
}

fn truncate_result(content: String) -> String {
    if content.len() <= MAX_TOOL_RESULT_CHARS {
        return content;
    }
    format!(
        "{}\n\n[truncated: showing {MAX_TOOL_RESULT_CHARS} of {} bytes]",
        truncate_utf8(&content, MAX_TOOL_RESULT_CHARS),
        content.len()
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::agent_core::progress::testing::RecordingSink;
    use crate::agent_core::progress::ProgressEvent;
    use crate::inference::client::FragmentStream;
    use crate::inference::types::InvalidToolCall;
    use crate::inference::InferenceError;
    use crate::mcp_client::{McpError, McpToolDefinition};

    // ── Fakes ───────────────────────────────────────────────────────────

    type TurnScript = dyn Fn(usize, &Transcript) -> Result<Vec<Result<ModelFragment, InferenceError>>, InferenceError>
        + Send
        + Sync;

    /// Model whose turns are produced by a closure of (turn index, transcript).
    struct FakeModel {
        script: Box<TurnScript>,
        turns: AtomicUsize,
        offered_tools: Mutex<Vec<Vec<String>>>,
        system_prompts: Mutex<Vec<String>>,
    }

    impl FakeModel {
        fn new(
            script: impl Fn(usize, &Transcript) -> Result<Vec<Result<ModelFragment, InferenceError>>, InferenceError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                turns: AtomicUsize::new(0),
                offered_tools: Mutex::new(Vec::new()),
                system_prompts: Mutex::new(Vec::new()),
            })
        }

        fn turns(&self) -> usize {
            self.turns.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelCapability for FakeModel {
        async fn submit(
            &self,
            system_prompt: &str,
            transcript: &Transcript,
            tools: &[ToolDefinition],
        ) -> Result<FragmentStream, InferenceError> {
            let turn = self.turns.fetch_add(1, Ordering::SeqCst);
            self.offered_tools
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.function.name.clone()).collect());
            self.system_prompts
                .lock()
                .unwrap()
                .push(system_prompt.to_string());
            let fragments = (self.script)(turn, transcript)?;
            Ok(stream::iter(fragments).boxed())
        }
    }

    /// Model whose stream never yields.
    struct HangingModel;

    #[async_trait]
    impl ModelCapability for HangingModel {
        async fn submit(
            &self,
            _system_prompt: &str,
            _transcript: &Transcript,
            _tools: &[ToolDefinition],
        ) -> Result<FragmentStream, InferenceError> {
            Ok(stream::pending::<Result<ModelFragment, InferenceError>>().boxed())
        }
    }

    /// Gateway with one `devmind` server; can be "crashed" mid-test.
    struct FakeGateway {
        crashed: AtomicBool,
        crash_after_calls: Option<usize>,
        invocations: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl FakeGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                crashed: AtomicBool::new(false),
                crash_after_calls: None,
                invocations: Mutex::new(Vec::new()),
            })
        }

        fn crashing_after(calls: usize) -> Arc<Self> {
            Arc::new(Self {
                crashed: AtomicBool::new(false),
                crash_after_calls: Some(calls),
                invocations: Mutex::new(Vec::new()),
            })
        }

        fn invocations(&self) -> Vec<(String, serde_json::Value)> {
            self.invocations.lock().unwrap().clone()
        }
    }

    fn tool(name: &str, description: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[async_trait]
    impl ToolGateway for FakeGateway {
        async fn invoke(
            &self,
            qualified_name: &str,
            arguments: serde_json::Value,
        ) -> Result<String, McpError> {
            let count = {
                let mut invocations = self.invocations.lock().unwrap();
                invocations.push((qualified_name.to_string(), arguments.clone()));
                invocations.len()
            };
            if self.crashed.load(Ordering::SeqCst) {
                return Err(McpError::UnknownServer {
                    name: "devmind".into(),
                });
            }
            if self.crash_after_calls == Some(count) {
                self.crashed.store(true, Ordering::SeqCst);
                return Err(McpError::ServerCrashed {
                    name: "devmind".into(),
                    reason: "process exited".into(),
                });
            }
            match qualified_name {
                "devmind__get_jira_issue" => {
                    let key = arguments["issue_key"].as_str().unwrap_or("?");
                    Ok(format!("{key}: Add login audit (In Progress)"))
                }
                "devmind__slow_lookup" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("slow".into())
                }
                "devmind__fast_lookup" => Ok("fast".into()),
                "devmind__timeout_lookup" => Ok(String::new()),
                "devmind__insert_jira_prompt" => Ok("saved".into()),
                other => Err(McpError::UnknownTool {
                    server: "devmind".into(),
                    tool: other.to_string(),
                }),
            }
        }

        fn catalogs(&self) -> Vec<ServerCatalog> {
            if self.crashed.load(Ordering::SeqCst) {
                return Vec::new();
            }
            vec![ServerCatalog::new(
                "devmind",
                vec![
                    tool("get_jira_issue", "Fetch a Jira issue by key"),
                    tool("insert_jira_prompt", "Save an analysis prompt"),
                    tool("search_knowledge", "Search the knowledge base"),
                    tool("get_svn_file", "Read a file from SVN"),
                ],
            )]
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> Result<ModelFragment, InferenceError> {
        Ok(ModelFragment::ToolCall(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }))
    }

    fn text(t: &str) -> Result<ModelFragment, InferenceError> {
        Ok(ModelFragment::Text(t.into()))
    }

    fn request(prompt: &str) -> ConversationRequest {
        ConversationRequest {
            request_id: "req-1".into(),
            task_id: "TASK-1".into(),
            prompt: prompt.into(),
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        sink: Arc<RecordingSink>,
        worker: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn new(
            model: Arc<dyn ModelCapability>,
            gateway: Arc<dyn ToolGateway>,
            config: LoopConfig,
        ) -> Self {
            let sink = Arc::new(RecordingSink::default());
            let (progress, worker) = ProgressBroadcaster::spawn(sink.clone());
            Self {
                orchestrator: Orchestrator::new(model, gateway, progress, config),
                sink,
                worker,
            }
        }

        /// Drop the orchestrator, drain the progress queue, return all events.
        async fn finish(self) -> Vec<ProgressEvent> {
            drop(self.orchestrator);
            self.worker.await.unwrap();
            self.sink.events()
        }
    }

    fn assert_progress_invariants(events: &[ProgressEvent]) {
        let percents: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert!(
            percents.windows(2).all(|w| w[0] <= w[1]),
            "percents must not decrease: {percents:?}"
        );
        let terminal = events.iter().filter(|e| e.status.is_terminal()).count();
        assert_eq!(terminal, 1, "exactly one terminal event: {events:?}");
        assert!(events.last().unwrap().status.is_terminal());
        assert_eq!(events[0].progress, 10);
        assert_eq!(events[0].stage, stage::RECEIVED);
    }

    // ── Termination ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_immediate_answer_is_done() {
        let model = FakeModel::new(|_, _| Ok(vec![text("Hello"), text(" there")]));
        let harness = Harness::new(model.clone(), FakeGateway::new(), LoopConfig::default());

        let outcome = harness
            .orchestrator
            .run(&request("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConversationOutcome::Done {
                text: "Hello there".into(),
                iterations: 1
            }
        );
        assert_eq!(model.turns(), 1);

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        let last = events.last().unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!(last.progress, 100);
    }

    #[tokio::test]
    async fn test_always_calling_model_stops_at_ceiling() {
        let model = FakeModel::new(|turn, _| {
            Ok(vec![
                text("Looking again"),
                call(
                    &format!("c{turn}"),
                    "devmind__get_jira_issue",
                    serde_json::json!({"issue_key": "CMU-1"}),
                ),
            ])
        });
        let gateway = FakeGateway::new();
        let config = LoopConfig {
            max_iterations: 3,
            max_parallel_tools: 2,
        };
        let harness = Harness::new(model.clone(), gateway.clone(), config);

        let outcome = harness
            .orchestrator
            .run(&request("check CMU-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(model.turns(), 3);
        assert_eq!(gateway.invocations().len(), 3);
        match &outcome {
            ConversationOutcome::Incomplete {
                text,
                iterations,
                last_percent,
                ..
            } => {
                assert_eq!(*iterations, 3);
                assert_eq!(text, "Looking again");
                assert!((10..90).contains(last_percent));
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        assert_eq!(events.last().unwrap().status, ProgressStatus::Error);
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_issue_status_scenario() {
        let model = FakeModel::new(|turn, transcript| match turn {
            0 => Ok(vec![call(
                "call-1",
                "devmind__get_jira_issue",
                serde_json::json!({"issue_key": "CMU-102"}),
            )]),
            _ => {
                let tool_text = transcript
                    .to_chat_messages("")
                    .last()
                    .and_then(|m| m.content.clone())
                    .unwrap_or_default();
                Ok(vec![text(&format!("Status of CMU-102: {tool_text}"))])
            }
        });
        let gateway = FakeGateway::new();
        let harness = Harness::new(model.clone(), gateway.clone(), LoopConfig::default());

        let outcome = harness
            .orchestrator
            .run(&request("What's the status of CMU-102?"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.iterations(), 2);
        assert!(outcome.text().contains("CMU-102"));
        assert!(outcome.text().contains("Add login audit"));
        assert_eq!(
            gateway.invocations(),
            vec![(
                "devmind__get_jira_issue".to_string(),
                serde_json::json!({"issue_key": "CMU-102"})
            )]
        );

        // The filter offered the jira tools, not the unrelated SVN one
        let offered = model.offered_tools.lock().unwrap()[0].clone();
        assert!(offered.contains(&"devmind__get_jira_issue".to_string()));
        assert!(!offered.contains(&"devmind__get_svn_file".to_string()));
        assert!(model.system_prompts.lock().unwrap()[0].contains("- devmind: get_jira_issue"));

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        let jira = events
            .iter()
            .find(|e| e.stage == stage::FETCHING_JIRA)
            .expect("fetching_jira event");
        assert!(jira.progress > 10 && jira.progress < 90, "{}", jira.progress);
        let last = events.last().unwrap();
        assert_eq!(
            (last.status, last.progress),
            (ProgressStatus::Completed, 100)
        );
    }

    #[tokio::test]
    async fn test_crashed_server_is_folded_into_transcript() {
        let model = FakeModel::new(|turn, transcript| {
            if turn < 3 {
                return Ok(vec![call(
                    &format!("c{turn}"),
                    "devmind__get_jira_issue",
                    serde_json::json!({"issue_key": "CMU-7"}),
                )]);
            }
            let errors = transcript
                .to_chat_messages("")
                .iter()
                .filter(|m| m.content.as_deref().is_some_and(|c| c.starts_with("Error:")))
                .count();
            Ok(vec![text(&format!("{errors} lookups failed"))])
        });
        let gateway = FakeGateway::crashing_after(2);
        let harness = Harness::new(model.clone(), gateway.clone(), LoopConfig::default());

        let outcome = harness
            .orchestrator
            .run(&request("status of CMU-7"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text(), "2 lookups failed");
        assert!(outcome.is_complete());
        // After the crash no tools are offered any more
        let offered = model.offered_tools.lock().unwrap().clone();
        assert!(!offered[0].is_empty());
        assert!(offered[3].is_empty());
        assert!(model.system_prompts.lock().unwrap()[3]
            .contains("No tool servers are currently available."));

        assert_progress_invariants(&harness.finish().await);
    }

    #[tokio::test]
    async fn test_results_keep_call_order_and_errors_are_text() {
        let model = FakeModel::new(|turn, transcript| match turn {
            0 => Ok(vec![
                text("Let me check."),
                call("a", "devmind__slow_lookup", serde_json::Value::Null),
                call("b", "devmind__fast_lookup", serde_json::Value::Null),
                call("a", "devmind__fast_lookup", serde_json::Value::Null),
                call("c", "devmind__missing", serde_json::Value::Null),
                call("d", "devmind__timeout_lookup", serde_json::Value::Null),
            ]),
            _ => {
                let results = match &transcript.messages()[2] {
                    crate::agent_core::types::TranscriptMessage::ToolResults { results } => {
                        results.clone()
                    }
                    other => panic!("unexpected message {other:?}"),
                };
                let summary: Vec<String> = results
                    .iter()
                    .map(|r| format!("{}={}:{}", r.call_id, r.is_error, r.content))
                    .collect();
                Ok(vec![text(&summary.join("|"))])
            }
        });
        let harness = Harness::new(model, FakeGateway::new(), LoopConfig::default());

        let outcome = harness
            .orchestrator
            .run(&request("look things up"), &CancellationToken::new())
            .await
            .unwrap();

        let parts: Vec<&str> = outcome.text().split('|').collect();
        assert_eq!(parts.len(), 4, "duplicate call id is dropped: {parts:?}");
        assert_eq!(parts[0], "a=false:slow");
        assert_eq!(parts[1], "b=false:fast");
        assert!(parts[2].starts_with("c=true:Error: unknown tool"));
        assert_eq!(parts[3], format!("d=false:{EMPTY_RESULT_TEXT}"));
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_persistence_tool_reports_saving_stage() {
        let model = FakeModel::new(|turn, _| match turn {
            0 => Ok(vec![call(
                "s1",
                "devmind__insert_jira_prompt",
                serde_json::json!({"jira_number": "CMU-5"}),
            )]),
            _ => Ok(vec![text("Saved.")]),
        });
        let harness = Harness::new(model, FakeGateway::new(), LoopConfig::default());
        harness
            .orchestrator
            .run(&request("save the prompt for CMU-5"), &CancellationToken::new())
            .await
            .unwrap();

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        let saving = events
            .iter()
            .find(|e| e.stage == stage::SAVING_RESULTS)
            .unwrap();
        assert_eq!(saving.progress, SAVING_PERCENT);
        // The following turn stays at 95 rather than dropping back
        assert!(events
            .iter()
            .skip_while(|e| e.stage != stage::SAVING_RESULTS)
            .all(|e| e.progress >= SAVING_PERCENT));
    }

    #[tokio::test]
    async fn test_unparsable_call_becomes_error_result_and_loop_continues() {
        let model = FakeModel::new(|turn, transcript| match turn {
            0 => Ok(vec![
                Ok(ModelFragment::InvalidToolCall(InvalidToolCall {
                    id: "a".into(),
                    name: "devmind__get_jira_issue".into(),
                    raw_arguments: "{oops".into(),
                    reason: "invalid JSON arguments".into(),
                })),
                call("b", "devmind__fast_lookup", serde_json::json!({})),
            ]),
            _ => {
                let results = match &transcript.messages()[2] {
                    crate::agent_core::types::TranscriptMessage::ToolResults { results } => {
                        results.clone()
                    }
                    other => panic!("unexpected message {other:?}"),
                };
                let summary: Vec<String> = results
                    .iter()
                    .map(|r| format!("{}={}:{}", r.call_id, r.is_error, r.content))
                    .collect();
                Ok(vec![text(&summary.join("|"))])
            }
        });
        let gateway = FakeGateway::new();
        let harness = Harness::new(model.clone(), gateway.clone(), LoopConfig::default());

        let outcome = harness
            .orchestrator
            .run(&request("look up CMU-9"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(model.turns(), 2, "the model gets a chance to retry");
        assert_eq!(
            gateway.invocations(),
            vec![("devmind__fast_lookup".to_string(), serde_json::json!({}))]
        );
        let parts: Vec<&str> = outcome.text().split('|').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("a=true:Error: invalid arguments for devmind__get_jira_issue"));
        assert!(parts[0].contains("{oops"));
        assert_eq!(parts[1], "b=false:fast");
        assert_progress_invariants(&harness.finish().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_is_spawnable_with_parallel_tools() {
        let model = FakeModel::new(|turn, _| match turn {
            0 => Ok(vec![
                call("a", "devmind__slow_lookup", serde_json::Value::Null),
                call("b", "devmind__fast_lookup", serde_json::Value::Null),
            ]),
            _ => Ok(vec![text("done")]),
        });
        let sink = Arc::new(RecordingSink::default());
        let (progress, worker) = ProgressBroadcaster::spawn(sink.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            model,
            FakeGateway::new(),
            progress,
            LoopConfig::default(),
        ));

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                let request = request("look things up");
                orchestrator.run(&request, &CancellationToken::new()).await
            }
        });
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.text(), "done");
        assert_eq!(outcome.iterations(), 2);

        drop(orchestrator);
        worker.await.unwrap();
        assert_progress_invariants(&sink.events());
    }

    // ── Failures ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_model_unavailable_fails_request() {
        let model = FakeModel::new(|_, _| {
            Err(InferenceError::AllModelsUnavailable {
                attempted: vec!["primary".into()],
            })
        });
        let harness = Harness::new(model, FakeGateway::new(), LoopConfig::default());
        let err = harness
            .orchestrator
            .run(&request("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        assert_eq!(events.last().unwrap().status, ProgressStatus::Error);
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial_turn() {
        let model = FakeModel::new(|_, _| {
            Ok(vec![
                text("Partial answer"),
                Err(InferenceError::StreamError {
                    reason: "connection reset".into(),
                }),
                text(" never seen"),
            ])
        });
        let harness = Harness::new(model, FakeGateway::new(), LoopConfig::default());
        let outcome = harness
            .orchestrator
            .run(&request("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text(), "Partial answer");
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_turn() {
        let harness = Harness::new(
            Arc::new(HangingModel),
            FakeGateway::new(),
            LoopConfig::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            harness.orchestrator.run(&request("hi"), &cancel),
        )
        .await
        .expect("cancel must end the run")
        .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled { .. }));

        let events = harness.finish().await;
        assert_progress_invariants(&events);
        assert_eq!(events.last().unwrap().status, ProgressStatus::Error);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_without_progress() {
        let model = FakeModel::new(|_, _| Ok(vec![]));
        let harness = Harness::new(model.clone(), FakeGateway::new(), LoopConfig::default());
        let err = harness
            .orchestrator
            .run(&request("   "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest { .. }));
        assert_eq!(model.turns(), 0);
        assert!(harness.finish().await.is_empty());
    }

    #[test]
    fn test_truncate_result() {
        let long = "é".repeat(MAX_TOOL_RESULT_CHARS);
        let truncated = truncate_result(long.clone());
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("[truncated: showing"));
        assert_eq!(truncate_result("short".into()), "short");
    }
}
