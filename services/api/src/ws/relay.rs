//! The per-connection voice session.
//!
//! A `VoiceSession` owns the session state, the active project, the ledger of
//! processed call ids and the streamed transcript used for interruption
//! rollback. Client intents and upstream events both enter through `&self`
//! methods that serialize on one lock. The lock is never held across a
//! network connect or a tool call.

use super::{
    client_link::ClientLink,
    dispatch::{FunctionDispatcher, Outcome},
    protocol::{ClientMessage, ServerMessage, StatusKind, TranscriptRole},
    upstream::{UpstreamConnector, UpstreamLink, UpstreamSetup},
};
use crate::{
    error::RelayError,
    models::{ArtifactEntry, SessionSnapshot, SessionState, SessionSummary, TranscriptEntry},
};
use chrono::{DateTime, Utc};
use gitvoice_core::{
    generic_types::{FunctionCall, UpstreamEvent},
    project::ProjectStatus,
    tools::{ToolCategory, ToolRegistry},
};
use serde_json::{Value, json};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, trace, warn};
use uuid::Uuid;

pub const INTERRUPTED_ENTRY: &str = "Interrupted by user";

/// What the dialogue model receives for a side-channel tool.
pub const SIDE_CHANNEL_ACK: &str = r#"{"status":"delivered_to_user"}"#;

/// Processed call ids are kept for the whole session. Past this size a
/// warning is logged once.
const CALL_LEDGER_WARN_THRESHOLD: usize = 10_000;

/// Per-session configuration handed down from the process config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base behavioral instructions for the dialogue model.
    pub instructions: String,
    /// Artifacts younger than this are discarded on interruption.
    pub rollback_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOrigin {
    /// Requested by the dialogue model on link `generation`; the result
    /// goes back upstream only while that link is still the live one.
    Upstream { generation: u64 },
    /// A client test invocation; nothing is sent upstream.
    Diagnostic,
}

struct Artifact {
    entry: ArtifactEntry,
    recorded: Instant,
}

struct SessionInner {
    state: SessionState,
    current_project: Option<String>,
    last_activity: DateTime<Utc>,
    processed_call_ids: HashSet<String>,
    /// Transcript length at the start of the turn in flight.
    processing_marker: Option<usize>,
    transcript: Vec<TranscriptEntry>,
    artifacts: Vec<Artifact>,
    upstream: Option<UpstreamLink>,
    upstream_task: Option<JoinHandle<()>>,
    /// Bumped on every successful connect.
    link_generation: u64,
    /// Responses requested upstream that have not reported `ResponseDone`.
    pending_responses: usize,
    /// Interrupted responses whose remaining output is dropped.
    discarded_responses: usize,
    /// Upstream function calls claimed but not yet answered.
    tools_in_flight: usize,
    audio_in_turn: bool,
    /// Current instructions, including the active repository once one is bound.
    instructions: String,
}

impl SessionInner {
    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!(from = %self.state, %to, "Session state transition");
            self.state = to;
        }
    }

    fn release_upstream(&mut self) {
        if let Some(link) = self.upstream.take() {
            link.close();
        }
        if let Some(task) = self.upstream_task.take() {
            task.abort();
        }
        self.pending_responses = 0;
        self.discarded_responses = 0;
        self.audio_in_turn = false;
    }

    /// Forgets the rollback marker once nothing of the turn is still running.
    fn settle_turn(&mut self) {
        if self.pending_responses == 0 && self.tools_in_flight == 0 {
            self.processing_marker = None;
        }
    }
}

pub struct VoiceSession {
    id: Uuid,
    client: ClientLink,
    dispatcher: Arc<FunctionDispatcher>,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
}

impl VoiceSession {
    pub fn new(
        client: ClientLink,
        dispatcher: Arc<FunctionDispatcher>,
        connector: Arc<dyn UpstreamConnector>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let inner = SessionInner {
            state: SessionState::Idle,
            current_project: None,
            last_activity: Utc::now(),
            processed_call_ids: HashSet::new(),
            processing_marker: None,
            transcript: Vec::new(),
            artifacts: Vec::new(),
            upstream: None,
            upstream_task: None,
            link_generation: 0,
            pending_responses: 0,
            discarded_responses: 0,
            tools_in_flight: 0,
            audio_in_turn: false,
            instructions: settings.instructions.clone(),
        };
        Arc::new(Self {
            id: Uuid::new_v4(),
            client,
            dispatcher,
            connector,
            settings,
            inner: Mutex::new(inner),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn current_project(&self) -> Option<String> {
        self.inner.lock().await.current_project.clone()
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            id: self.id,
            state: inner.state,
            current_project: inner.current_project.clone(),
            last_activity: inner.last_activity,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            id: self.id,
            state: inner.state,
            current_project: inner.current_project.clone(),
            last_activity: inner.last_activity,
            processed_calls: inner.processed_call_ids.len(),
            transcript: inner.transcript.clone(),
            artifacts: inner.artifacts.iter().map(|a| a.entry.clone()).collect(),
        }
    }

    /// Routes one decoded client intent.
    pub async fn handle_client_message(self: &Arc<Self>, msg: ClientMessage) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                debug!("Ignoring client message for a closed session.");
                return;
            }
            inner.last_activity = Utc::now();
        }
        match msg {
            ClientMessage::Audio { audio_data } => self.append_audio(audio_data).await,
            ClientMessage::StartRecording => self.start_recording().await,
            ClientMessage::StopRecording => self.stop_recording().await,
            ClientMessage::SelectProject { project } => {
                self.select_project(&project).await;
            }
            ClientMessage::TestFunction {
                project,
                function,
                args,
            } => self.test_function(project, function, args).await,
        }
    }

    /// Begins an utterance, rolling back any turn still in flight and
    /// connecting upstream if there is no live link.
    pub async fn start_recording(self: &Arc<Self>) {
        let setup = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Closed => return,
                SessionState::Connecting => {
                    debug!("Upstream connection already in progress.");
                    return;
                }
                _ => {}
            }
            self.rollback(&mut inner);

            if let Some(link) = inner.upstream.clone().filter(|link| !link.is_closed()) {
                if inner.pending_responses > 0 {
                    if let Err(e) = link.cancel_response() {
                        warn!(error = %e, "Failed to cancel the upstream response.");
                    }
                    inner.discarded_responses += inner.pending_responses;
                    inner.pending_responses = 0;
                }
                if let Err(e) = link.clear_audio() {
                    warn!(error = %e, "Failed to clear the upstream audio buffer.");
                }
                inner.audio_in_turn = false;
                inner.transition(SessionState::Recording);
                self.client
                    .send(ServerMessage::status(StatusKind::Recording, "Listening..."));
                return;
            }

            inner.release_upstream();
            inner.transition(SessionState::Connecting);
            self.client.send(ServerMessage::status(
                StatusKind::Connecting,
                "Connecting to voice service...",
            ));
            UpstreamSetup {
                instructions: inner.instructions.clone(),
                tools: ToolRegistry::global().all(),
            }
        };

        let result = self.connector.connect(setup).await;

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            if let Ok(connection) = result {
                connection.link.close();
            }
            return;
        }
        match result {
            Ok(connection) => {
                info!("Upstream session established.");
                inner.link_generation += 1;
                inner.upstream = Some(connection.link);
                inner.upstream_task = Some(self.spawn_upstream_loop(connection.events));
                inner.pending_responses = 0;
                inner.audio_in_turn = false;
                inner.transition(SessionState::Recording);
                self.client
                    .send(ServerMessage::status(StatusKind::Recording, "Listening..."));
            }
            Err(e) => {
                error!(error = %e, "Failed to connect upstream.");
                inner.transition(SessionState::Error);
                self.client
                    .send(ServerMessage::status(StatusKind::Error, e.to_string()));
            }
        }
    }

    pub async fn append_audio(&self, audio_base64: String) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Recording {
            trace!(state = %inner.state, "Dropping audio received outside of recording.");
            return;
        }
        let Some(link) = inner.upstream.as_ref() else {
            warn!("Audio received without an upstream link.");
            return;
        };
        match link.append_audio(audio_base64) {
            Ok(()) => inner.audio_in_turn = true,
            Err(e) => warn!(error = %e, "Failed to forward audio upstream."),
        }
    }

    /// Ends the utterance. An utterance without audio never reaches upstream.
    pub async fn stop_recording(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => return,
            SessionState::Recording => {}
            _ => {
                self.client
                    .send(ServerMessage::status(StatusKind::Error, "Not recording"));
                return;
            }
        }
        inner.transition(SessionState::Processing);
        self.client
            .send(ServerMessage::status(StatusKind::Processing, "Processing..."));

        if !inner.audio_in_turn {
            info!("Recording stopped without audio; nothing to commit.");
            inner.transition(SessionState::Idle);
            self.client
                .send(ServerMessage::status(StatusKind::Ready, "No audio captured"));
            return;
        }
        inner.audio_in_turn = false;

        let sent = match inner.upstream.as_ref() {
            Some(link) => link.commit_audio().and_then(|()| link.request_response()),
            None => Err(RelayError::Connection("upstream link is gone".to_string())),
        };
        match sent {
            Ok(()) => inner.pending_responses += 1,
            Err(e) => {
                error!(error = %e, "Failed to commit audio upstream.");
                inner.release_upstream();
                inner.transition(SessionState::Error);
                self.client
                    .send(ServerMessage::status(StatusKind::Error, e.to_string()));
            }
        }
    }

    /// Binds `name` as the active project. A failed selection leaves the
    /// current project untouched.
    pub async fn select_project(&self, name: &str) -> Outcome {
        let outcome = self.dispatcher.select_project(name).await;

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return outcome;
        }
        if outcome.success {
            self.bind_project(&mut inner, name, outcome.data.as_ref());
            self.client.send(ServerMessage::project_status(
                StatusKind::ProjectSelected,
                format!("Selected project {name}"),
                Some(name.to_string()),
            ));
        } else {
            let message = outcome
                .message
                .clone()
                .unwrap_or_else(|| format!("Could not select project {name}"));
            self.client
                .send(ServerMessage::status(StatusKind::Error, message));
        }
        outcome
    }

    /// Runs a tool directly, without the dialogue model. `project` scopes the
    /// call without changing the session's active project.
    pub async fn test_function(&self, project: Option<String>, function: String, args: Value) {
        let arguments = if args.is_null() { json!({}) } else { args };
        let call = FunctionCall {
            call_id: format!("test-{}", Uuid::new_v4()),
            name: function,
            arguments,
        };
        info!(function = %call.name, "Running diagnostic function call");
        self.run_function_call(call, project, CallOrigin::Diagnostic)
            .await;
    }

    /// Applies one event from the upstream link. Function calls run to
    /// completion before this returns.
    pub async fn handle_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::FunctionCall(call) => {
                if let Some(generation) = self.claim_call(&call.call_id).await {
                    self.run_function_call(call, None, CallOrigin::Upstream { generation })
                        .await;
                }
            }
            event => {
                let mut inner = self.inner.lock().await;
                if inner.state == SessionState::Closed {
                    return;
                }
                inner.last_activity = Utc::now();
                self.apply_stream_event(&mut inner, event);
            }
        }
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.transition(SessionState::Closed);
        inner.processing_marker = None;
        inner.release_upstream();
        info!(session_id = %self.id, "Voice session closed.");
    }

    fn spawn_upstream_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let Some(session) = weak.upgrade() else { break };
                    match event {
                        // Tools run on their own task so a reconnect, which
                        // aborts this loop, never cuts one short.
                        UpstreamEvent::FunctionCall(call) => {
                            let Some(generation) = session.claim_call(&call.call_id).await else {
                                continue;
                            };
                            tokio::spawn(
                                async move {
                                    let origin = CallOrigin::Upstream { generation };
                                    session.run_function_call(call, None, origin).await;
                                }
                                .instrument(tracing::Span::current()),
                            );
                        }
                        event => session.handle_upstream_event(event).await,
                    }
                }
                debug!("Upstream event loop finished.");
            }
            .instrument(tracing::Span::current()),
        )
    }

    fn apply_stream_event(&self, inner: &mut SessionInner, event: UpstreamEvent) {
        match event {
            UpstreamEvent::AudioDelta(_) | UpstreamEvent::TextDelta(_) | UpstreamEvent::TextDone(_)
                if inner.discarded_responses > 0 =>
            {
                trace!("Dropping output of an interrupted response.");
            }
            UpstreamEvent::ResponseDone if inner.discarded_responses > 0 => {
                inner.discarded_responses -= 1;
                debug!("Interrupted response finished.");
            }
            UpstreamEvent::SessionReady => debug!("Upstream session confirmed."),
            UpstreamEvent::AudioDelta(audio_data) => {
                self.client.send(ServerMessage::AudioResponse { audio_data });
            }
            UpstreamEvent::TextDelta(text) => {
                if inner.processing_marker.is_none() {
                    inner.processing_marker = Some(inner.transcript.len());
                }
                inner.transcript.push(TranscriptEntry {
                    text: text.clone(),
                    synthetic: false,
                });
                self.client.send(ServerMessage::Transcription {
                    text,
                    role: TranscriptRole::Assistant,
                    is_final: false,
                });
            }
            UpstreamEvent::TextDone(text) => {
                self.client.send(ServerMessage::Transcription {
                    text,
                    role: TranscriptRole::Assistant,
                    is_final: true,
                });
            }
            UpstreamEvent::InputTranscript(text) => {
                self.client.send(ServerMessage::Transcription {
                    text,
                    role: TranscriptRole::User,
                    is_final: true,
                });
            }
            UpstreamEvent::ResponseDone => {
                inner.pending_responses = inner.pending_responses.saturating_sub(1);
                inner.settle_turn();
                if inner.pending_responses == 0 && inner.state == SessionState::Processing {
                    inner.transition(SessionState::Idle);
                    self.client.send(ServerMessage::project_status(
                        StatusKind::Ready,
                        "Ready for next command",
                        inner.current_project.clone(),
                    ));
                }
            }
            UpstreamEvent::Error(message) => {
                error!(%message, "Upstream reported an error.");
                inner.pending_responses = 0;
                inner.transition(SessionState::Error);
                self.client
                    .send(ServerMessage::status(StatusKind::Error, message));
            }
            UpstreamEvent::ProtocolError(message) => {
                warn!(%message, "Upstream sent a message the relay cannot decode.");
                self.client
                    .send(ServerMessage::status(StatusKind::Error, message));
            }
            UpstreamEvent::Disconnected(reason) => {
                warn!(%reason, "Upstream link lost.");
                inner.release_upstream();
                inner.transition(SessionState::Error);
                self.client.send(ServerMessage::status(
                    StatusKind::Error,
                    format!("Voice connection lost: {reason}"),
                ));
            }
            UpstreamEvent::Unhandled { kind } => trace!(%kind, "Unhandled upstream event"),
            // Dispatched by `handle_upstream_event`.
            UpstreamEvent::FunctionCall(_) => {}
        }
    }

    /// Records `call_id` as processed and returns the live link generation.
    /// Returns `None` for a call id seen before.
    async fn claim_call(&self, call_id: &str) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return None;
        }
        if !inner.processed_call_ids.insert(call_id.to_string()) {
            debug!(call_id, "Ignoring duplicate function call.");
            return None;
        }
        if inner.processed_call_ids.len() == CALL_LEDGER_WARN_THRESHOLD {
            warn!(
                count = CALL_LEDGER_WARN_THRESHOLD,
                "Processed call ledger is growing large."
            );
        }
        inner.last_activity = Utc::now();
        if matches!(inner.state, SessionState::Processing | SessionState::Idle) {
            inner.transition(SessionState::Executing);
        }
        inner.tools_in_flight += 1;
        Some(inner.link_generation)
    }

    async fn run_function_call(&self, call: FunctionCall, scope: Option<String>, origin: CallOrigin) {
        let project = {
            let inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            scope.or_else(|| inner.current_project.clone())
        };
        self.client.send(ServerMessage::project_status(
            StatusKind::Executing,
            format!("Executing {}...", call.name),
            project.clone(),
        ));

        let outcome = self.dispatcher.dispatch(project.as_deref(), &call).await;

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            debug!(call_id = %call.call_id, "Session closed while a tool was running.");
            return;
        }
        if let Some(selected) = outcome.selected_project.as_deref() {
            self.bind_project(&mut inner, selected, outcome.data.as_ref());
        }
        inner.artifacts.push(Artifact {
            entry: ArtifactEntry {
                function: outcome.function.clone(),
                success: outcome.success,
                result: outcome.client_result(),
                recorded_at: Utc::now(),
            },
            recorded: Instant::now(),
        });
        self.emit_outcome(&outcome);
        if let CallOrigin::Upstream { generation } = origin {
            inner.tools_in_flight = inner.tools_in_flight.saturating_sub(1);
            if generation == inner.link_generation {
                self.reply_upstream(&mut inner, &call.call_id, &outcome);
            } else {
                warn!(call_id = %call.call_id, "Upstream link replaced while the tool ran; result not returned.");
            }
            inner.settle_turn();
        }

        let (kind, message) = if outcome.success {
            (StatusKind::Completed, format!("{} completed", outcome.function))
        } else {
            (
                StatusKind::Error,
                format!(
                    "{} failed: {}",
                    outcome.function,
                    outcome.message.as_deref().unwrap_or("unknown error")
                ),
            )
        };
        self.client.send(ServerMessage::project_status(
            kind,
            message,
            inner.current_project.clone(),
        ));
    }

    fn emit_outcome(&self, outcome: &Outcome) {
        self.client.send(ServerMessage::FunctionResult {
            function: outcome.function.clone(),
            result: outcome.client_result(),
            success: outcome.success,
        });
        if outcome.category != ToolCategory::SideChannel || !outcome.success {
            return;
        }
        if let Some(data) = &outcome.data {
            self.client.send(ServerMessage::Advice {
                question: data["question"].as_str().unwrap_or_default().to_string(),
                advice: data["advice"].as_str().unwrap_or_default().to_string(),
                repository: data["repository"].as_str().map(str::to_string),
            });
        }
    }

    /// Returns the tool output to the dialogue model. Standard results ask
    /// for exactly one further response; side-channel results only get an
    /// acknowledgment.
    fn reply_upstream(&self, inner: &mut SessionInner, call_id: &str, outcome: &Outcome) {
        let Some(link) = inner.upstream.clone() else {
            warn!(call_id, "Upstream link gone before the tool result could be returned.");
            return;
        };
        let sent = match outcome.category {
            ToolCategory::Standard => link
                .function_output(call_id, outcome.upstream_output())
                .and_then(|()| link.request_response()),
            ToolCategory::SideChannel => link.function_output(call_id, SIDE_CHANNEL_ACK.to_string()),
        };
        if let Err(e) = sent {
            error!(error = %e, call_id, "Failed to return the tool result upstream.");
            inner.release_upstream();
            inner.transition(SessionState::Error);
            self.client
                .send(ServerMessage::status(StatusKind::Error, e.to_string()));
            return;
        }
        match outcome.category {
            ToolCategory::Standard => {
                inner.pending_responses += 1;
                if inner.state == SessionState::Executing {
                    inner.transition(SessionState::Processing);
                }
            }
            ToolCategory::SideChannel => {
                if inner.state == SessionState::Executing {
                    inner.transition(SessionState::Idle);
                }
            }
        }
    }

    fn bind_project(&self, inner: &mut SessionInner, name: &str, status: Option<&Value>) {
        info!(project = %name, "Active project changed");
        inner.current_project = Some(name.to_string());
        inner.instructions = project_instructions(&self.settings.instructions, name, status);
        if let Some(link) = inner.upstream.as_ref() {
            if let Err(e) = link.update_instructions(inner.instructions.clone()) {
                warn!(error = %e, "Failed to refresh upstream instructions.");
            }
        }
    }

    /// Rolls back the turn in flight, if any. The artifact cut is
    /// time-based, so artifacts from just before the turn may also go.
    fn rollback(&self, inner: &mut SessionInner) {
        let Some(marker) = inner.processing_marker.take() else {
            return;
        };
        let window = self.settings.rollback_window;
        let before = inner.artifacts.len();
        inner.transcript.truncate(marker);
        inner.artifacts.retain(|a| a.recorded.elapsed() > window);
        inner.transcript.push(TranscriptEntry {
            text: INTERRUPTED_ENTRY.to_string(),
            synthetic: true,
        });
        info!(
            retained = marker,
            discarded_artifacts = before - inner.artifacts.len(),
            "Interrupted the turn in flight."
        );
        self.client
            .send(ServerMessage::Interrupted { retained: marker });
        self.client
            .send(ServerMessage::status(StatusKind::Interrupted, INTERRUPTED_ENTRY));
    }
}

/// Extends the base instructions with a description of the active repository.
fn project_instructions(base: &str, name: &str, status: Option<&Value>) -> String {
    let mut instructions = format!("{base}\n\n## Active repository\n- Name: {name}\n");
    let status = status.and_then(|v| serde_json::from_value::<ProjectStatus>(v.clone()).ok());
    if let Some(status) = status {
        if let Some(full_name) = &status.full_name {
            instructions.push_str(&format!("- Repository: {full_name}\n"));
        }
        if let Some(branch) = &status.branch {
            instructions.push_str(&format!("- Branch: {branch}\n"));
        }
        if let Some(url) = &status.url {
            instructions.push_str(&format!("- Remote: {url}\n"));
        }
    }
    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{
        dispatch::tests::{FakeAdvisor, status_of},
        upstream::{UpstreamCommand, UpstreamConnection},
    };
    use async_trait::async_trait;
    use gitvoice_core::{
        executor::{ToolExecutor, ToolResult},
        project::{ProjectError, ProjectManager},
    };
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };
    use tokio::sync::Notify;

    struct FakeProjects;

    #[async_trait]
    impl ProjectManager for FakeProjects {
        async fn list_projects(&self) -> Result<Vec<String>, ProjectError> {
            Ok(vec!["gadgets".to_string(), "widgets".to_string()])
        }

        async fn select_project(&self, name: &str) -> Result<(), ProjectError> {
            match name {
                "gadgets" | "widgets" => Ok(()),
                _ => Err(ProjectError::NotFound {
                    name: name.to_string(),
                    suggestion: None,
                }),
            }
        }

        async fn project_status(&self, name: &str) -> Result<ProjectStatus, ProjectError> {
            Ok(status_of(name))
        }
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
        /// When set, every call waits for `release`.
        hold: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn execute_function(&self, project: &str, name: &str, _args: &Value) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            tokio::task::yield_now().await;
            ToolResult::ok(json!({ "project": project, "function": name }))
        }
    }

    /// The provider side of one fake connection.
    struct ProviderEnd {
        commands: mpsc::UnboundedReceiver<UpstreamCommand>,
        events: mpsc::UnboundedSender<UpstreamEvent>,
        instructions: String,
    }

    #[derive(Default)]
    struct FakeConnector {
        fail: AtomicBool,
        connects: AtomicUsize,
        ends: StdMutex<Vec<ProviderEnd>>,
    }

    impl FakeConnector {
        /// Drains the commands sent on the most recent connection.
        fn commands(&self) -> Vec<UpstreamCommand> {
            let mut ends = self.ends.lock().unwrap();
            let mut commands = Vec::new();
            if let Some(end) = ends.last_mut() {
                while let Ok(command) = end.commands.try_recv() {
                    commands.push(command);
                }
            }
            commands
        }

        fn instructions(&self) -> String {
            self.ends.lock().unwrap().last().unwrap().instructions.clone()
        }

        /// Delivers `event` through the most recent connection's event loop.
        fn push(&self, event: UpstreamEvent) {
            self.ends.lock().unwrap().last().unwrap().events.send(event).unwrap();
        }

        /// Makes the most recent link look like its provider task went away.
        fn sever(&self) {
            self.ends.lock().unwrap().last_mut().unwrap().commands.close();
        }
    }

    #[async_trait]
    impl UpstreamConnector for FakeConnector {
        async fn connect(&self, setup: UpstreamSetup) -> Result<UpstreamConnection, RelayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RelayError::Connection("service unavailable".to_string()));
            }
            let (link, commands) = UpstreamLink::channel();
            let (event_tx, events) = mpsc::unbounded_channel();
            self.ends.lock().unwrap().push(ProviderEnd {
                commands,
                events: event_tx,
                instructions: setup.instructions,
            });
            Ok(UpstreamConnection { link, events })
        }
    }

    struct Harness {
        session: Arc<VoiceSession>,
        events: mpsc::UnboundedReceiver<ServerMessage>,
        connector: Arc<FakeConnector>,
        executor: Arc<CountingExecutor>,
        advisor: Arc<FakeAdvisor>,
    }

    impl Harness {
        fn new() -> Self {
            let (client, events) = ClientLink::channel();
            let connector = Arc::new(FakeConnector::default());
            let executor = Arc::new(CountingExecutor::default());
            let advisor = Arc::new(FakeAdvisor::default());
            let dispatcher = Arc::new(FunctionDispatcher::new(
                Arc::new(FakeProjects),
                executor.clone(),
                advisor.clone(),
            ));
            let session = VoiceSession::new(
                client,
                dispatcher,
                connector.clone(),
                SessionSettings {
                    instructions: "You are a voice assistant for git.".to_string(),
                    rollback_window: Duration::from_secs(5),
                },
            );
            Self {
                session,
                events,
                connector,
                executor,
                advisor,
            }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(msg) = self.events.try_recv() {
                messages.push(msg);
            }
            messages
        }

        /// Records one utterance with audio and clears all observed traffic.
        async fn record_turn(&mut self) {
            self.session.start_recording().await;
            self.session
                .handle_client_message(ClientMessage::Audio {
                    audio_data: "AAA=".to_string(),
                })
                .await;
            self.session.stop_recording().await;
            self.connector.commands();
            self.drain();
        }

        async fn transcript(&self) -> Vec<TranscriptEntry> {
            self.session.snapshot().await.transcript
        }
    }

    fn statuses(messages: &[ServerMessage]) -> Vec<StatusKind> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn function_results(messages: &[ServerMessage]) -> usize {
        messages
            .iter()
            .filter(|msg| matches!(msg, ServerMessage::FunctionResult { .. }))
            .count()
    }

    /// Lets spawned session tasks run.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn call(call_id: &str, name: &str, arguments: Value) -> UpstreamEvent {
        UpstreamEvent::FunctionCall(FunctionCall {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        })
    }

    #[tokio::test]
    async fn test_empty_utterance_never_reaches_upstream() {
        let mut h = Harness::new();
        h.session.start_recording().await;
        assert_eq!(h.session.state().await, SessionState::Recording);

        h.session.stop_recording().await;
        assert_eq!(h.session.state().await, SessionState::Idle);

        let messages = h.drain();
        assert_eq!(
            statuses(&messages),
            vec![
                StatusKind::Connecting,
                StatusKind::Recording,
                StatusKind::Processing,
                StatusKind::Ready
            ]
        );
        assert_eq!(function_results(&messages), 0);
        assert!(h.connector.commands().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_turn_commits_and_settles() {
        let mut h = Harness::new();
        h.session.start_recording().await;
        h.session
            .handle_client_message(ClientMessage::Audio {
                audio_data: "AAA=".to_string(),
            })
            .await;
        h.session.stop_recording().await;
        assert_eq!(
            h.connector.commands(),
            vec![
                UpstreamCommand::AppendAudio("AAA=".to_string()),
                UpstreamCommand::CommitAudio,
                UpstreamCommand::RequestResponse,
            ]
        );
        assert_eq!(h.session.state().await, SessionState::Processing);
        h.drain();

        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Done.".into()))
            .await;
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;
        assert_eq!(h.session.state().await, SessionState::Idle);

        let messages = h.drain();
        assert_eq!(
            messages[0],
            ServerMessage::Transcription {
                text: "Done.".into(),
                role: TranscriptRole::Assistant,
                is_final: false,
            }
        );
        assert_eq!(statuses(&messages), vec![StatusKind::Ready]);
    }

    #[tokio::test]
    async fn test_stop_without_recording_reports_error() {
        let mut h = Harness::new();
        h.session.stop_recording().await;
        assert_eq!(h.session.state().await, SessionState::Idle);
        assert_eq!(statuses(&h.drain()), vec![StatusKind::Error]);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_executes_once() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;

        let event = call("c1", "create_issue", json!({ "title": "Broken build" }));
        h.session.handle_upstream_event(event.clone()).await;
        h.session.handle_upstream_event(event).await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        let messages = h.drain();
        assert_eq!(function_results(&messages), 1);
        assert_eq!(
            statuses(&messages),
            vec![StatusKind::Executing, StatusKind::Completed]
        );

        let commands = h.connector.commands();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            &commands[0],
            UpstreamCommand::FunctionOutput { call_id, .. } if call_id == "c1"
        ));
        assert_eq!(commands[1], UpstreamCommand::RequestResponse);
        assert_eq!(h.session.state().await, SessionState::Processing);
        assert_eq!(h.session.snapshot().await.processed_calls, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_execute_once() {
        let h = Harness::new();
        h.session.select_project("widgets").await;
        let event = call("c7", "git_status", json!({}));
        tokio::join!(
            h.session.handle_upstream_event(event.clone()),
            h.session.handle_upstream_event(event),
        );
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tool_output_waits_for_its_own_response() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;

        h.session
            .handle_upstream_event(call("c1", "git_status", json!({})))
            .await;
        // The response that carried the call finishes first.
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;
        assert_eq!(h.session.state().await, SessionState::Processing);

        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;
        assert_eq!(h.session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_side_channel_result_skips_dialogue() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;

        h.session
            .handle_upstream_event(call(
                "c2",
                "ask_advisor",
                json!({ "question": "How should I split this module?" }),
            ))
            .await;

        assert_eq!(
            h.connector.commands(),
            vec![UpstreamCommand::FunctionOutput {
                call_id: "c2".to_string(),
                output: SIDE_CHANNEL_ACK.to_string(),
            }]
        );
        let messages = h.drain();
        assert!(messages.contains(&ServerMessage::Advice {
            question: "How should I split this module?".to_string(),
            advice: "Split it by responsibility.".to_string(),
            repository: Some("octo/widgets".to_string()),
        }));
        assert_eq!(function_results(&messages), 1);
        assert_eq!(h.advisor.questions.lock().unwrap().len(), 1);
        assert_eq!(h.session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_selection_keeps_current_project() {
        let mut h = Harness::new();
        assert!(h.session.select_project("widgets").await.success);
        h.drain();

        let outcome = h.session.select_project("ghost-repo").await;
        assert!(!outcome.success);
        assert_eq!(h.session.current_project().await.as_deref(), Some("widgets"));

        let messages = h.drain();
        assert!(matches!(
            &messages[..],
            [ServerMessage::Status { status: StatusKind::Error, message, .. }] if message.contains("ghost-repo")
        ));
    }

    #[tokio::test]
    async fn test_selection_refreshes_upstream_instructions() {
        let h = Harness::new();
        h.session.start_recording().await;
        h.session.select_project("widgets").await;

        let commands = h.connector.commands();
        let [UpstreamCommand::UpdateInstructions(instructions)] = &commands[..] else {
            panic!("expected one instructions update, got {commands:?}");
        };
        assert!(instructions.starts_with("You are a voice assistant for git."));
        assert!(instructions.contains("octo/widgets"));
    }

    #[tokio::test]
    async fn test_selection_before_connect_shapes_initial_instructions() {
        let h = Harness::new();
        h.session.select_project("gadgets").await;
        h.session.start_recording().await;
        assert!(h.connector.instructions().contains("- Branch: main"));
        assert!(h.connector.instructions().contains("octo/gadgets"));
    }

    #[tokio::test]
    async fn test_interruption_rolls_back_streamed_text() {
        let mut h = Harness::new();
        h.record_turn().await;
        for chunk in ["Creating ", "the ", "issue"] {
            h.session
                .handle_upstream_event(UpstreamEvent::TextDelta(chunk.into()))
                .await;
        }
        assert_eq!(h.transcript().await.len(), 3);
        h.drain();

        h.session.start_recording().await;

        assert_eq!(
            h.transcript().await,
            vec![TranscriptEntry {
                text: INTERRUPTED_ENTRY.to_string(),
                synthetic: true,
            }]
        );
        let messages = h.drain();
        assert_eq!(messages[0], ServerMessage::Interrupted { retained: 0 });
        assert_eq!(
            statuses(&messages),
            vec![StatusKind::Interrupted, StatusKind::Recording]
        );
        assert_eq!(
            h.connector.commands(),
            vec![UpstreamCommand::CancelResponse, UpstreamCommand::ClearAudio]
        );
        assert_eq!(h.session.state().await, SessionState::Recording);
    }

    #[tokio::test]
    async fn test_interrupted_response_output_is_dropped() {
        let mut h = Harness::new();
        h.record_turn().await;
        for chunk in ["a", "b", "c"] {
            h.session
                .handle_upstream_event(UpstreamEvent::TextDelta(chunk.into()))
                .await;
        }
        h.session.start_recording().await;
        h.drain();

        // The provider is still flushing the cancelled response.
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("late".into()))
            .await;
        h.session
            .handle_upstream_event(UpstreamEvent::AudioDelta("QUFB".into()))
            .await;
        h.session
            .handle_upstream_event(UpstreamEvent::TextDone("abclate".into()))
            .await;
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;

        assert_eq!(h.transcript().await.len(), 1);
        assert!(h.drain().is_empty());
        assert_eq!(h.session.state().await, SessionState::Recording);

        // The next turn streams normally again.
        h.session
            .handle_client_message(ClientMessage::Audio {
                audio_data: "AAA=".to_string(),
            })
            .await;
        h.session.stop_recording().await;
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Fresh".into()))
            .await;
        let transcript = h.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].text, "Fresh");
        assert!(h.drain().contains(&ServerMessage::Transcription {
            text: "Fresh".into(),
            role: TranscriptRole::Assistant,
            is_final: false,
        }));
    }

    #[tokio::test]
    async fn test_interruption_spans_tool_followup() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;

        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Let me check.".into()))
            .await;
        h.session
            .handle_upstream_event(call("c1", "git_status", json!({})))
            .await;
        // The preamble's response ends; the follow-up is still owed.
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;
        assert_eq!(h.session.state().await, SessionState::Processing);
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Three changes".into()))
            .await;

        h.session.start_recording().await;

        assert_eq!(
            h.transcript().await,
            vec![TranscriptEntry {
                text: INTERRUPTED_ENTRY.to_string(),
                synthetic: true,
            }]
        );
        assert!(h.drain().contains(&ServerMessage::Interrupted { retained: 0 }));
    }

    #[tokio::test]
    async fn test_interruption_keeps_completed_turns() {
        let mut h = Harness::new();
        h.record_turn().await;
        for chunk in ["First ", "answer"] {
            h.session
                .handle_upstream_event(UpstreamEvent::TextDelta(chunk.into()))
                .await;
        }
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;

        h.record_turn().await;
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Second".into()))
            .await;
        h.session.start_recording().await;

        let transcript = h.transcript().await;
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[1].text, "answer");
        assert!(transcript[2].synthetic);
        assert!(h.drain().contains(&ServerMessage::Interrupted { retained: 2 }));
    }

    #[tokio::test]
    async fn test_start_without_turn_in_flight_keeps_transcript() {
        let mut h = Harness::new();
        h.record_turn().await;
        for chunk in ["All ", "clean"] {
            h.session
                .handle_upstream_event(UpstreamEvent::TextDelta(chunk.into()))
                .await;
        }
        h.session.handle_upstream_event(UpstreamEvent::ResponseDone).await;
        let before = h.transcript().await;
        h.drain();

        h.session.start_recording().await;
        h.session.start_recording().await;

        assert_eq!(h.transcript().await, before);
        assert!(
            !h.drain()
                .iter()
                .any(|msg| matches!(msg, ServerMessage::Interrupted { .. }))
        );
    }

    #[tokio::test]
    async fn test_interruption_discards_recent_artifacts() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("Let me ask.".into()))
            .await;
        h.session
            .handle_upstream_event(call("c3", "ask_advisor", json!({ "question": "Why?" })))
            .await;
        assert_eq!(h.session.snapshot().await.artifacts.len(), 1);

        h.session.start_recording().await;
        assert!(h.session.snapshot().await.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_then_retry() {
        let mut h = Harness::new();
        h.connector.fail.store(true, Ordering::SeqCst);
        h.session.start_recording().await;
        assert_eq!(h.session.state().await, SessionState::Error);
        assert_eq!(
            statuses(&h.drain()),
            vec![StatusKind::Connecting, StatusKind::Error]
        );

        h.connector.fail.store(false, Ordering::SeqCst);
        h.session.start_recording().await;
        assert_eq!(h.session.state().await, SessionState::Recording);
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_forces_reconnect() {
        let mut h = Harness::new();
        h.record_turn().await;
        h.session
            .handle_upstream_event(UpstreamEvent::Disconnected("socket reset".into()))
            .await;
        assert_eq!(h.session.state().await, SessionState::Error);
        assert_eq!(statuses(&h.drain()), vec![StatusKind::Error]);

        h.session.start_recording().await;
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.session.state().await, SessionState::Recording);
    }

    #[tokio::test]
    async fn test_upstream_error_is_reported() {
        let mut h = Harness::new();
        h.record_turn().await;
        h.session
            .handle_upstream_event(UpstreamEvent::Error("rate limited".into()))
            .await;
        assert_eq!(h.session.state().await, SessionState::Error);
        assert_eq!(
            h.drain(),
            vec![ServerMessage::status(StatusKind::Error, "rate limited")]
        );
    }

    #[tokio::test]
    async fn test_undecodable_upstream_message_is_reported() {
        let mut h = Harness::new();
        h.record_turn().await;
        h.session
            .handle_upstream_event(UpstreamEvent::ProtocolError(
                "function call 'c9' has no name".into(),
            ))
            .await;
        assert_eq!(h.session.state().await, SessionState::Processing);
        assert_eq!(
            h.drain(),
            vec![ServerMessage::status(
                StatusKind::Error,
                "function call 'c9' has no name"
            )]
        );
    }

    #[tokio::test]
    async fn test_tool_finishes_across_reconnect() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;
        h.executor.hold.store(true, Ordering::SeqCst);

        h.connector.push(call("c4", "git_status", json!({})));
        settle().await;
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state().await, SessionState::Executing);

        // The provider goes away mid-tool and the user records again.
        h.connector.sever();
        h.session.start_recording().await;
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);

        h.executor.release.notify_one();
        settle().await;

        let messages = h.drain();
        assert_eq!(function_results(&messages), 1);
        assert_eq!(statuses(&messages).last(), Some(&StatusKind::Completed));
        assert_eq!(h.session.snapshot().await.artifacts.len(), 1);
        // The result belongs to the old conversation.
        assert!(h.connector.commands().is_empty());
        assert_eq!(h.session.state().await, SessionState::Recording);
    }

    #[tokio::test]
    async fn test_test_function_bypasses_upstream() {
        let mut h = Harness::new();
        h.session
            .handle_client_message(ClientMessage::TestFunction {
                project: Some("gadgets".into()),
                function: "git_status".into(),
                args: Value::Null,
            })
            .await;

        let messages = h.drain();
        assert_eq!(
            statuses(&messages),
            vec![StatusKind::Executing, StatusKind::Completed]
        );
        assert!(messages.contains(&ServerMessage::FunctionResult {
            function: "git_status".into(),
            result: json!({ "project": "gadgets", "function": "git_status" }),
            success: true,
        }));
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state().await, SessionState::Idle);
        assert_eq!(h.session.current_project().await, None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let mut h = Harness::new();
        h.session.select_project("widgets").await;
        h.record_turn().await;

        h.session.close().await;
        h.session.close().await;
        assert_eq!(h.session.state().await, SessionState::Closed);
        assert_eq!(h.connector.commands(), vec![UpstreamCommand::Close]);

        h.session
            .handle_client_message(ClientMessage::StartRecording)
            .await;
        h.session
            .handle_upstream_event(UpstreamEvent::TextDelta("late".into()))
            .await;
        h.session
            .handle_upstream_event(call("c9", "git_status", json!({})))
            .await;

        assert!(h.drain().is_empty());
        assert!(h.transcript().await.is_empty());
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state().await, SessionState::Closed);
    }

    #[test]
    fn test_project_instructions_without_status() {
        let instructions = project_instructions("Base.", "widgets", Some(&json!({ "name": "widgets" })));
        assert_eq!(instructions, "Base.\n\n## Active repository\n- Name: widgets\n");
    }
}
