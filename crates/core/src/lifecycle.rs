//! Lifecycle Controller
//!
//! Drives every session through its state machine:
//!
//! ```text
//! connect -> Provisioning --all models available--> Active --disconnect--> Closing -> Closed
//!                 |                                   |
//!                 +--provisioning failed--> Failed <--+--fatal stage error
//! ```
//!
//! Each active session is owned by a supervisor task that pumps inbound audio
//! into the pipeline head and tears the session down when the connection goes
//! away, inbound audio ends or a stage fails.

use crate::context::ConversationContext;
use crate::error::SessionError;
use crate::frame::{AudioChunk, Role, TurnMessage};
use crate::interruption::InterruptionController;
use crate::llm_client::LLMClient;
use crate::pipeline::link::FrameFilter;
use crate::pipeline::stages::{
    AssistantTurnAggregator, Inference, InputAdapter, OutputAdapter, SpeechRecognizer,
    SpeechSynthesizer, UserTurnAggregator, VoiceActivityGate,
};
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, Pipeline, Stage};
use crate::provisioner::{DEFAULT_PROVISION_TIMEOUT, ModelDependency, Provisioner};
use crate::session::{ActivePipeline, Session, SessionId, SessionState, SessionStatus};
use crate::speech::{SpeechToText, TextToSpeech};
use crate::transport::{ConnectionHandle, ConnectionId, OutboundSink, TransportEvent};
use crate::vad::{EnergyVad, VadConfig, VadMode};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// The remote services every session uses, and the models they must have loaded.
pub struct ServiceSet {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LLMClient>,
    pub tts: Arc<dyn TextToSpeech>,
    pub dependencies: Vec<ModelDependency>,
}

/// Per-session settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub system_instruction: String,
    /// Injected as a system turn once the pipeline is up, so the agent speaks first.
    pub greeting: Option<String>,
    pub provision_timeout: Duration,
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
    pub vad: VadConfig,
    pub vad_mode: VadMode,
    pub allow_interruptions: bool,
    /// Sample rate of inbound audio.
    pub sample_rate: u32,
    pub min_utterance: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            system_instruction: "You are a helpful voice assistant. Keep your answers short and \
                                 conversational; they will be spoken aloud."
                .to_string(),
            greeting: Some("Greet the user briefly and ask how you can help.".to_string()),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_timeout: Duration::from_secs(5),
            vad: VadConfig::default(),
            vad_mode: VadMode::Gate,
            allow_interruptions: true,
            sample_rate: 16000,
            min_utterance: Duration::from_millis(200),
        }
    }
}

/// What `on_connect` reports back to the transport.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    /// Follows the session until it reaches a terminal state.
    pub status: watch::Receiver<SessionStatus>,
}

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub state: SessionState,
}

struct SessionHandle {
    session_id: SessionId,
    status: watch::Receiver<SessionStatus>,
    close: CancellationToken,
}

#[derive(Clone)]
pub struct LifecycleController {
    provisioner: Provisioner,
    services: Arc<ServiceSet>,
    settings: Arc<SessionSettings>,
    sessions: Arc<DashMap<ConnectionId, SessionHandle>>,
}

impl LifecycleController {
    pub fn new(provisioner: Provisioner, services: ServiceSet, settings: SessionSettings) -> Self {
        Self {
            provisioner,
            services: Arc::new(services),
            settings: Arc::new(settings),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Starts a session for a new connection.
    ///
    /// Waits for the provisioning gate. On success the session is `Active` and
    /// supervised in the background when this returns. A provisioning failure is
    /// returned as an error and no pipeline is ever built. A disconnect during
    /// provisioning ends the session as `Closed`.
    pub async fn on_connect(&self, handle: ConnectionHandle) -> Result<SessionInfo, SessionError> {
        let ConnectionHandle {
            id: connection_id,
            inbound,
            outbound,
        } = handle;
        let session_id = Uuid::new_v4();
        let (status_tx, status_rx) =
            watch::channel(SessionStatus::new(SessionState::Provisioning));
        let close = CancellationToken::new();

        match self.sessions.entry(connection_id) {
            Entry::Occupied(_) => {
                warn!(%connection_id, "connection already has a live session");
                return Err(SessionError::AlreadyConnected(connection_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(SessionHandle {
                    session_id,
                    status: status_rx.clone(),
                    close: close.clone(),
                });
            }
        }

        let span = info_span!("session", %session_id, %connection_id);
        let info = SessionInfo {
            session_id,
            connection_id,
            status: status_rx,
        };
        let mut session = Session::new(
            session_id,
            connection_id,
            outbound.clone(),
            status_tx,
            self.settings.drain_timeout,
        );

        let gate = async {
            info!(
                dependencies = self.services.dependencies.len(),
                "provisioning session dependencies"
            );
            tokio::select! {
                _ = close.cancelled() => None,
                gate = self.provisioner.ensure_all(
                    &self.services.dependencies,
                    self.settings.provision_timeout,
                ) => Some(gate),
            }
        }
        .instrument(span.clone())
        .await;

        match gate {
            None => {
                async {
                    info!("disconnected during provisioning");
                    session.close().await;
                }
                .instrument(span)
                .await;
                self.forget(connection_id, session_id);
                return Ok(info);
            }
            Some(Err(e)) => {
                let failure = SessionError::from(e);
                session.fail(failure.clone()).instrument(span).await;
                self.forget(connection_id, session_id);
                return Err(failure);
            }
            Some(Ok(())) => {}
        }

        let active = self.build_pipeline(outbound);
        let head = active.pipeline.head();
        async {
            session.activate(active);
            if let Some(greeting) = self.settings.greeting.clone() {
                let directive = TurnMessage {
                    role: Role::System,
                    text: greeting,
                    turn_id: 0,
                };
                if let Err(e) = head.send(directive.into()).await {
                    warn!(error = %e, "failed to inject greeting directive");
                }
            }
        }
        .instrument(span.clone())
        .await;

        tokio::spawn(
            supervise(session, inbound, close, self.sessions.clone()).instrument(span),
        );
        Ok(info)
    }

    /// Ends the session of a connection and waits for it to reach a terminal
    /// state. `None` if the connection has no live session.
    pub async fn on_disconnect(&self, connection_id: ConnectionId) -> Option<SessionState> {
        let (session_id, mut status) = {
            let handle = self.sessions.get(&connection_id)?;
            handle.close.cancel();
            (handle.session_id, handle.status.clone())
        };
        info!(%connection_id, "transport disconnected");
        let waited = status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|status| status.state);
        let state = match waited {
            Ok(state) => state,
            Err(_) => status.borrow().state,
        };
        self.forget(connection_id, session_id);
        Some(state)
    }

    /// Consumes connection events until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            let controller = self.clone();
            match event {
                TransportEvent::Connected(handle) => {
                    tokio::spawn(async move {
                        let connection_id = handle.id;
                        if let Err(e) = controller.on_connect(handle).await {
                            error!(%connection_id, error = %e, "session start failed");
                        }
                    });
                }
                TransportEvent::Disconnected(connection_id) => {
                    tokio::spawn(async move {
                        controller.on_disconnect(connection_id).await;
                    });
                }
            }
        }
    }

    /// Closes every live session. Used on server shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| *e.key()).collect();
        futures::future::join_all(ids.into_iter().map(|id| self.on_disconnect(id))).await;
    }

    pub fn active_sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                connection_id: *entry.key(),
                session_id: entry.session_id,
                state: entry.status.borrow().state,
            })
            .collect()
    }

    pub fn session_state(&self, connection_id: ConnectionId) -> Option<SessionState> {
        self.sessions
            .get(&connection_id)
            .map(|handle| handle.status.borrow().state)
    }

    fn forget(&self, connection_id: ConnectionId, session_id: SessionId) {
        self.sessions
            .remove_if(&connection_id, |_, handle| handle.session_id == session_id);
    }

    fn build_pipeline(&self, outbound: Arc<dyn OutboundSink>) -> ActivePipeline {
        let settings = &self.settings;
        let context = ConversationContext::new(settings.system_instruction.clone()).shared();
        let interruption = Arc::new(InterruptionController::new(
            context.clone(),
            settings.allow_interruptions,
        ));

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(InputAdapter::new(settings.sample_rate)),
            Box::new(VoiceActivityGate::new(
                Box::new(EnergyVad::new(settings.vad)),
                settings.vad_mode,
                interruption.clone(),
                settings.vad.start_after * 2,
            )),
            Box::new(SpeechRecognizer::new(
                self.services.stt.clone(),
                settings.sample_rate,
                settings.min_utterance,
            )),
            Box::new(UserTurnAggregator::new(context.clone())),
            Box::new(Inference::new(
                self.services.llm.clone(),
                context.clone(),
                interruption.clone(),
            )),
            Box::new(AssistantTurnAggregator::new(context.clone())),
            Box::new(SpeechSynthesizer::new(
                self.services.tts.clone(),
                interruption.clone(),
            )),
            Box::new(OutputAdapter::new(outbound, interruption.clone())),
        ];

        let filter: Arc<dyn FrameFilter> = interruption.clone();
        ActivePipeline {
            pipeline: Pipeline::spawn(stages, settings.queue_capacity, Some(filter)),
            context,
            interruption,
        }
    }
}

async fn supervise(
    mut session: Session,
    mut inbound: mpsc::Receiver<AudioChunk>,
    close: CancellationToken,
    sessions: Arc<DashMap<ConnectionId, SessionHandle>>,
) {
    let Some(head) = session.head() else {
        return;
    };

    let failure = loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break None,
            failure = session.next_failure() => break failure,
            chunk = inbound.recv() => {
                let Some(chunk) = chunk else {
                    info!("inbound audio ended");
                    break None;
                };
                tokio::select! {
                    biased;
                    _ = close.cancelled() => break None,
                    sent = head.send(chunk.into()) => {
                        if sent.is_err() {
                            warn!("pipeline head closed");
                        }
                    }
                }
            }
        }
    };

    match failure {
        Some(failure) => {
            error!(stage = %failure.stage, error = %failure.error, "fatal stage error");
            session
                .fail(SessionError::Stage {
                    stage: failure.stage,
                    reason: failure.error.to_string(),
                })
                .await;
        }
        None => session.close().await,
    }

    let session_id = session.id();
    sessions.remove_if(&session.connection_id(), |_, handle| {
        handle.session_id == session_id
    });
}
