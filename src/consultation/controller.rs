//! # Session Controller
//!
//! Owns one live connection and wires the audio, transcript and tool
//! components to it.
//!
//! ## Task layout:
//! - `start()` runs on the caller's task. It acquires the microphone,
//!   connects, and waits for `setupComplete`. Every step races `stop()`.
//! - Once open, a single session task serializes capture chunks, typed
//!   replies and server messages through one `select!` loop, so handlers
//!   never run concurrently with each other.
//! - `stop()` signals the task, waits for it to finish, releases the
//!   microphone and reports `connected = false` if that has not happened yet.
//!
//! Errors never escape as `Err`: they are delivered through
//! [`SessionCallbacks::on_error`].

use super::{
    ConnectionState, Microphone, PlaybackAudio, SessionCallbacks, SessionSettings, SessionStats,
};
use crate::audio::{AudioCodec, AudioFramer, PlaybackScheduler};
use crate::error::ConsultationError;
use crate::live::{ClientMessage, FunctionCall, LiveConnector, LiveLink, ServerEvent, ServerMessage, Setup};
use crate::records::RecordStore;
use crate::tools::{tool_declarations, ToolDispatcher};
use crate::transcript::{Speaker, TranscriptAssembler, TranscriptMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Inbound = mpsc::Receiver<Result<ServerMessage, ConsultationError>>;
type Capture = mpsc::UnboundedReceiver<Vec<f32>>;

enum Control {
    Text(String),
}

#[derive(Default)]
struct StatCounters {
    frames_sent: AtomicU64,
    frames_muted: AtomicU64,
    audio_chunks_played: AtomicU64,
    audio_chunks_dropped: AtomicU64,
    tool_calls: AtomicU64,
    tool_failures: AtomicU64,
    audio_underruns: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_muted: self.frames_muted.load(Ordering::Relaxed),
            audio_chunks_played: self.audio_chunks_played.load(Ordering::Relaxed),
            audio_chunks_dropped: self.audio_chunks_dropped.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_failures: self.tool_failures.load(Ordering::Relaxed),
            audio_underruns: self.audio_underruns.load(Ordering::Relaxed),
        }
    }
}

/// State visible to both the controller and its session task.
struct Shared {
    session_id: String,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    muted: AtomicBool,
    disconnect_reported: AtomicBool,
    callbacks: Arc<dyn SessionCallbacks>,
    stats: StatCounters,
    transcript: Mutex<Vec<TranscriptMessage>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `to` only from one of `from`. Returns whether it moved.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!(session_id = %self.session_id, from = ?*state, to = ?to, "Session state change");
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// `connected = false` is reported at most once per session.
    fn report_disconnected(&self) {
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            self.callbacks.on_connection_change(false);
        }
    }

    fn fail(&self, error: ConsultationError) {
        error!(session_id = %self.session_id, error = %error, "Consultation session failed");
        self.transition(
            &[ConnectionState::Connecting, ConnectionState::Open],
            ConnectionState::Errored,
        );
        self.callbacks.on_error(&error);
        self.report_disconnected();
    }
}

/// The single public surface of a voice consultation.
pub struct SessionController {
    settings: SessionSettings,
    connector: Arc<dyn LiveConnector>,
    microphone: Arc<dyn Microphone>,
    dispatcher: Arc<ToolDispatcher>,
    shared: Arc<Shared>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        connector: Arc<dyn LiveConnector>,
        microphone: Arc<dyn Microphone>,
        records: Arc<dyn RecordStore>,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            settings,
            connector,
            microphone,
            dispatcher: Arc::new(ToolDispatcher::new(records)),
            shared: Arc::new(Shared {
                session_id: uuid::Uuid::new_v4().to_string(),
                state,
                shutdown,
                muted: AtomicBool::new(false),
                disconnect_reported: AtomicBool::new(false),
                callbacks,
                stats: StatCounters::default(),
                transcript: Mutex::new(Vec::new()),
            }),
            control: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Closed transcript turns, available once the session has ended.
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.shared
            .transcript
            .lock()
            .map(|transcript| transcript.clone())
            .unwrap_or_default()
    }

    /// Open the session. Only valid once, from `Idle`; failures are reported
    /// through the error callback.
    pub async fn start(&self) {
        if !self
            .shared
            .transition(&[ConnectionState::Idle], ConnectionState::Connecting)
        {
            warn!(session_id = %self.id(), state = ?self.state(), "start() ignored, session is not idle");
            return;
        }

        info!(
            session_id = %self.id(),
            model = %self.settings.model,
            voice = %self.settings.voice,
            "Starting consultation session"
        );

        let mut shutdown = self.shared.shutdown.subscribe();
        let opened = tokio::select! {
            opened = self.open() => opened,
            _ = shutdown.changed() => {
                debug!(session_id = %self.id(), "Start cancelled by stop()");
                return;
            }
        };

        let (link, capture) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                self.microphone.release().await;
                if !self.state().is_terminal() {
                    self.shared.fail(e);
                }
                return;
            }
        };

        if !self
            .shared
            .transition(&[ConnectionState::Connecting], ConnectionState::Open)
        {
            debug!(session_id = %self.id(), "Session stopped during handshake");
            self.microphone.release().await;
            return;
        }

        self.shared.callbacks.on_connection_change(true);
        info!(session_id = %self.id(), "Consultation session open");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if let Ok(mut control) = self.control.lock() {
            *control = Some(control_tx);
        }

        let session = SessionLoop {
            shared: Arc::clone(&self.shared),
            link,
            capture,
            capture_open: true,
            control: control_rx,
            microphone: Arc::clone(&self.microphone),
            dispatcher: Arc::clone(&self.dispatcher),
            framer: AudioFramer::new(self.settings.frame_size, self.settings.input_sample_rate),
            codec: AudioCodec::new(self.settings.input_sample_rate, self.settings.output_sample_rate),
            scheduler: PlaybackScheduler::new(),
            assembler: TranscriptAssembler::new(),
            clock: Instant::now(),
        };
        let handle = tokio::spawn(session.run());
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    async fn open(&self) -> Result<(LiveLink, Capture), ConsultationError> {
        let capture = self
            .microphone
            .acquire(self.settings.input_sample_rate)
            .await?;

        let setup = Setup::new(
            &self.settings.model,
            &self.settings.voice,
            &self.settings.system_instruction,
            tool_declarations(),
        );
        let mut link = self.connector.connect(setup).await?;

        let timeout = self.settings.handshake_timeout;
        match tokio::time::timeout(timeout, await_setup_complete(&mut link.inbound)).await {
            Ok(Ok(())) => Ok((link, capture)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConsultationError::Connection(format!(
                "no setupComplete within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Tear everything down. Safe to call repeatedly, before `start()` has
    /// resolved, and after a fatal error.
    pub async fn stop(&self) {
        let previous = self.state();
        self.shared.transition(
            &[
                ConnectionState::Idle,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ],
            ConnectionState::Closed,
        );
        self.shared.shutdown.send_replace(true);

        if let Ok(mut control) = self.control.lock() {
            control.take();
        }

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session_id = %self.id(), error = %e, "Session task ended abnormally");
            }
        }

        self.microphone.release().await;
        self.shared.report_disconnected();

        if !previous.is_terminal() {
            info!(session_id = %self.id(), stats = ?self.stats(), "Consultation session stopped");
        }
    }

    /// Gate captured frames. Capture and framing continue while muted.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
        debug!(session_id = %self.id(), muted, "Microphone mute changed");
    }

    /// Send a typed, already-final user turn. Returns `false` when there is
    /// no open session to deliver it to.
    pub fn send_text_response(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let sent = self
            .control
            .lock()
            .ok()
            .and_then(|control| {
                control
                    .as_ref()
                    .map(|tx| tx.send(Control::Text(text.to_string())).is_ok())
            })
            .unwrap_or(false);

        if !sent {
            warn!(session_id = %self.id(), "Text response dropped, session is not open");
        }
        sent
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn await_setup_complete(inbound: &mut Inbound) -> Result<(), ConsultationError> {
    while let Some(message) = inbound.recv().await {
        if message?.setup_complete.is_some() {
            return Ok(());
        }
        warn!("Ignoring server message received before setupComplete");
    }
    Err(ConsultationError::Connection(
        "connection closed during handshake".to_string(),
    ))
}

/// The open session. Runs on its own task until stop, error or disconnect.
struct SessionLoop {
    shared: Arc<Shared>,
    link: LiveLink,
    capture: Capture,
    capture_open: bool,
    control: mpsc::UnboundedReceiver<Control>,
    microphone: Arc<dyn Microphone>,
    dispatcher: Arc<ToolDispatcher>,
    framer: AudioFramer,
    codec: AudioCodec,
    scheduler: PlaybackScheduler,
    assembler: TranscriptAssembler,
    clock: Instant,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let stopped_early = *shutdown.borrow_and_update();

        while !stopped_early {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow_and_update() {
                        break;
                    }
                }
                Some(command) = self.control.recv() => self.handle_control(command),
                chunk = self.capture.recv(), if self.capture_open => match chunk {
                    Some(samples) => self.handle_capture(&samples),
                    None => {
                        warn!(session_id = %self.shared.session_id, "Microphone stream ended");
                        self.capture_open = false;
                    }
                },
                inbound = self.link.inbound.recv() => match inbound {
                    Some(Ok(message)) => self.handle_message(message).await,
                    Some(Err(e)) => {
                        self.shared.fail(e);
                        break;
                    }
                    None => {
                        if self.shared.transition(&[ConnectionState::Open], ConnectionState::Closed) {
                            warn!(session_id = %self.shared.session_id, "Live endpoint closed the connection");
                            self.shared.report_disconnected();
                        }
                        break;
                    }
                },
            }
        }

        self.finish().await;
    }

    fn handle_control(&mut self, command: Control) {
        match command {
            Control::Text(text) => {
                self.assembler.push_complete(Speaker::User, &text);
                self.send(ClientMessage::user_text(&text));
            }
        }
    }

    fn handle_capture(&mut self, samples: &[f32]) {
        for frame in self.framer.push(samples) {
            if self.shared.muted.load(Ordering::SeqCst) {
                StatCounters::bump(&self.shared.stats.frames_muted);
                continue;
            }
            let chunk = self.codec.encode(&frame.samples);
            if !self.send(ClientMessage::audio(chunk)) {
                return;
            }
            StatCounters::bump(&self.shared.stats.frames_sent);
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        for event in message.into_events() {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        let callbacks = Arc::clone(&self.shared.callbacks);

        match event {
            ServerEvent::SetupComplete => {
                debug!(session_id = %self.shared.session_id, "Duplicate setupComplete ignored");
            }

            ServerEvent::Interrupted => {
                self.scheduler.reset(self.clock.elapsed().as_secs_f64());
                self.assembler.finalize(Speaker::Assistant);
                callbacks.on_interrupted();
            }

            ServerEvent::InputTranscript(text) => {
                self.assembler.push(Speaker::User, &text, false);
                callbacks.on_user_text(&text);
            }

            ServerEvent::Audio { mime_type, data } => match self.codec.decode(&mime_type, &data) {
                Ok(frame) if frame.is_empty() => {}
                Ok(frame) => {
                    let now = self.clock.elapsed().as_secs_f64();
                    let schedule = self.scheduler.schedule(now, frame.duration_secs());
                    StatCounters::bump(&self.shared.stats.audio_chunks_played);
                    self.shared
                        .stats
                        .audio_underruns
                        .store(self.scheduler.underruns(), Ordering::Relaxed);
                    callbacks.on_audio(&PlaybackAudio { frame, schedule });
                }
                Err(e) => {
                    warn!(session_id = %self.shared.session_id, error = %e, "Dropping undecodable audio chunk");
                    StatCounters::bump(&self.shared.stats.audio_chunks_dropped);
                    callbacks.on_error(&e);
                }
            },

            ServerEvent::OutputTranscript { text, finished } => {
                self.assembler.push(Speaker::Assistant, &text, finished);
                callbacks.on_assistant_text(&text, finished);
            }

            ServerEvent::TurnComplete => {
                let assistant_open = self
                    .assembler
                    .open_message()
                    .is_some_and(|open| open.role == Speaker::Assistant);
                if assistant_open {
                    self.assembler.finalize(Speaker::Assistant);
                    callbacks.on_assistant_text("", true);
                }
            }

            ServerEvent::ToolCalls(calls) => {
                for call in calls {
                    self.resolve_tool_call(call).await;
                }
            }

            ServerEvent::ToolCallCancellation(ids) => {
                info!(session_id = %self.shared.session_id, ids = ?ids, "Server cancelled tool calls");
            }

            ServerEvent::GoAway(time_left) => {
                warn!(session_id = %self.shared.session_id, time_left = ?time_left, "Live endpoint will disconnect soon");
            }
        }
    }

    /// Completion fires before the acknowledgement is sent.
    async fn resolve_tool_call(&mut self, call: FunctionCall) {
        StatCounters::bump(&self.shared.stats.tool_calls);
        let outcome = self.dispatcher.dispatch(&call).await;
        if outcome.error.is_some() {
            StatCounters::bump(&self.shared.stats.tool_failures);
        }
        if let Some(result) = outcome.completion {
            self.shared.callbacks.on_complete(result);
        }
        if !self.send(ClientMessage::tool_response(&call.id, &call.name, outcome.response)) {
            warn!(session_id = %self.shared.session_id, call_id = %call.id, "Tool response could not be sent");
        }
    }

    fn send(&self, message: ClientMessage) -> bool {
        match self.link.outbound.send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id = %self.shared.session_id, kind = e.0.kind(), "Outbound channel closed");
                false
            }
        }
    }

    async fn finish(mut self) {
        let transcript = self.assembler.finish().to_vec();
        let turns = transcript.len();
        if let Ok(mut slot) = self.shared.transcript.lock() {
            *slot = transcript;
        }
        let frames = self.framer.frames_emitted();
        let discarded = self.framer.pending_len();
        self.framer.reset();
        self.microphone.release().await;
        debug!(
            session_id = %self.shared.session_id,
            turns,
            frames,
            discarded,
            "Session task finished"
        );
    }
}
