//! # Consultation WebSocket Bridge
//!
//! Connects a browser booking UI to one live voice consultation.
//! Clients connect to `/ws/consultation`; the upstream auth layer identifies
//! the signed-in user through the `X-Actor-Id` header (absent = anonymous).
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends `{"type":"start","sample_rate":16000}` once it
//!    has microphone access (`sample_rate` omitted = access denied)
//! 2. **Audio Streaming**: binary messages carry little-endian `f32` samples
//! 3. **Session Events**: server relays transcripts, assistant speech,
//!    interruptions, the booking result and errors as JSON
//! 4. **Teardown**: completion, a fatal error, `stop` or closing the socket
//!    ends the consultation
//!
//! ## Message Format:
//! - **Client → Server**: `start`, `mute`, `text`, `stop`, `pong` JSON; binary PCM
//! - **Server → Client**: `connection`, `assistant_text`, `user_text`,
//!   `audio`, `interrupted`, `completed`, `error`, `ping` JSON

use crate::audio::encode_pcm;
use crate::audio::framer::samples_from_le_bytes;
use crate::consultation::{
    PlaybackAudio, RelayMicrophone, SessionCallbacks, SessionController,
};
use crate::error::ConsultationError;
use crate::state::{AppState, SessionOutcome};
use crate::tools::ConsultationResult;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Header carrying the authenticated user id.
pub const ACTOR_HEADER: &str = "X-Actor-Id";

/// Messages sent by the browser.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Begin a consultation
    Start {
        /// Capture rate the browser records at; absent when access was denied
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    Mute {
        muted: bool,
    },
    /// Typed reply, e.g. a pet name the user would rather spell out
    Text {
        text: String,
    },
    Stop,
    Pong {
        timestamp: i64,
    },
}

/// Messages sent to the browser.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessage {
    Connection {
        connected: bool,
    },
    AssistantText {
        text: String,
        is_final: bool,
    },
    UserText {
        text: String,
    },
    /// Decoded assistant speech re-encoded as PCM, with its slot on the
    /// session's playback timeline (seconds)
    Audio {
        mime_type: String,
        data: String,
        start_at: f64,
        duration: f64,
    },
    Interrupted,
    Completed {
        result: ConsultationResult,
    },
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
    Ping {
        timestamp: i64,
    },
}

impl UiMessage {
    fn audio(audio: &PlaybackAudio) -> Self {
        let chunk = encode_pcm(&audio.frame.samples, audio.frame.sample_rate);
        UiMessage::Audio {
            mime_type: chunk.mime_type,
            data: chunk.data,
            start_at: audio.schedule.start_at,
            duration: audio.schedule.duration,
        }
    }

    fn error(code: &str, message: &str, fatal: bool) -> Self {
        UiMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            fatal,
        }
    }
}

/// A session callback forwarded to the socket actor.
///
/// `generation` identifies which of the socket's consultations raised it, so
/// late notices from an earlier session are discarded.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionNotice {
    generation: u64,
    event: NoticeKind,
}

enum NoticeKind {
    Ui(UiMessage),
    Connection(bool),
    Completed(ConsultationResult),
    Failed(ConsultationError),
}

/// `SessionCallbacks` implementation that posts to the socket actor.
struct SocketCallbacks {
    addr: Addr<ConsultationSocket>,
    generation: u64,
}

impl SocketCallbacks {
    fn notify(&self, event: NoticeKind) {
        self.addr.do_send(SessionNotice {
            generation: self.generation,
            event,
        });
    }
}

impl SessionCallbacks for SocketCallbacks {
    fn on_connection_change(&self, connected: bool) {
        self.notify(NoticeKind::Connection(connected));
    }

    fn on_assistant_text(&self, text: &str, is_final: bool) {
        self.notify(NoticeKind::Ui(UiMessage::AssistantText {
            text: text.to_string(),
            is_final,
        }));
    }

    fn on_user_text(&self, text: &str) {
        self.notify(NoticeKind::Ui(UiMessage::UserText {
            text: text.to_string(),
        }));
    }

    fn on_audio(&self, audio: &PlaybackAudio) {
        self.notify(NoticeKind::Ui(UiMessage::audio(audio)));
    }

    fn on_complete(&self, result: ConsultationResult) {
        self.notify(NoticeKind::Completed(result));
    }

    fn on_error(&self, error: &ConsultationError) {
        self.notify(NoticeKind::Failed(error.clone()));
    }

    fn on_interrupted(&self) {
        self.notify(NoticeKind::Ui(UiMessage::Interrupted));
    }
}

/// WebSocket actor owning at most one consultation at a time.
pub struct ConsultationSocket {
    state: web::Data<AppState>,

    /// Signed-in user, if any
    actor_id: Option<String>,

    session: Option<Arc<SessionController>>,

    /// Feeds browser capture into the running session
    microphone: Option<Arc<RelayMicrophone>>,

    /// Bumped on every `start`
    generation: u64,

    /// Whether the current session holds one of the server's session slots
    holds_slot: bool,

    /// Whether the current session ever reached the open state
    connected: bool,

    outcome: Option<SessionOutcome>,

    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl ConsultationSocket {
    pub fn new(state: web::Data<AppState>, actor_id: Option<String>) -> Self {
        let performance = state.get_config().performance;
        Self {
            state,
            actor_id,
            session: None,
            microphone: None,
            generation: 0,
            holds_slot: false,
            connected: false,
            outcome: None,
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &UiMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize UI message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str, fatal: bool) {
        warn!(code, message, fatal, "Consultation socket error");
        self.send(ctx, &UiMessage::error(code, message, fatal));
    }

    fn start_session(&mut self, sample_rate: Option<u32>, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        let begun = self.begin_session(sample_rate, |generation| -> Arc<dyn SessionCallbacks> {
            Arc::new(SocketCallbacks { addr, generation })
        });
        match begun {
            Ok(session) => {
                actix::spawn(async move {
                    session.start().await;
                });
            }
            Err(rejection) => self.send(ctx, &rejection),
        }
    }

    /// Reserve a slot and build the next session. The caller starts it.
    /// `callbacks` receives the new session's generation.
    fn begin_session(
        &mut self,
        sample_rate: Option<u32>,
        callbacks: impl FnOnce(u64) -> Arc<dyn SessionCallbacks>,
    ) -> Result<Arc<SessionController>, UiMessage> {
        if self.session.is_some() {
            warn!("Start ignored, a consultation is already running");
            return Err(UiMessage::error(
                "session_active",
                "A consultation is already running",
                false,
            ));
        }

        if !self.state.try_acquire_session_slot() {
            warn!("Consultation rejected, no session slot free");
            return Err(UiMessage::error(
                "capacity",
                "The assistant is busy right now. Please try again in a moment.",
                true,
            ));
        }

        self.generation += 1;
        self.holds_slot = true;
        self.connected = false;
        self.outcome = None;

        let config = self.state.get_config();
        let microphone = Arc::new(RelayMicrophone::new(sample_rate));
        let callbacks = callbacks(self.generation);
        let records = Arc::new(self.state.records.for_actor(self.actor_id.clone()));

        let session = Arc::new(SessionController::new(
            config.session_settings(),
            Arc::clone(&self.state.connector),
            microphone.clone(),
            records,
            callbacks,
        ));

        info!(
            session_id = %session.id(),
            authenticated = self.actor_id.is_some(),
            sample_rate = ?sample_rate,
            "Consultation requested"
        );

        self.session = Some(Arc::clone(&session));
        self.microphone = Some(microphone);
        Ok(session)
    }

    /// Apply one session notice and return what the browser should see.
    /// Notices from an earlier generation are dropped.
    fn apply_notice(&mut self, notice: SessionNotice) -> Vec<UiMessage> {
        if notice.generation != self.generation {
            debug!(
                generation = notice.generation,
                current = self.generation,
                "Stale session notice dropped"
            );
            return Vec::new();
        }

        match notice.event {
            NoticeKind::Ui(message) => vec![message],
            NoticeKind::Connection(true) => {
                self.connected = true;
                vec![UiMessage::Connection { connected: true }]
            }
            NoticeKind::Connection(false) => {
                let mut messages = vec![UiMessage::Connection { connected: false }];
                // The endpoint hung up on an open session without an error.
                if self.connected && self.session.is_some() && self.outcome.is_none() {
                    let lost = ConsultationError::Connection("remote closed".to_string());
                    warn!("Live endpoint closed an open consultation");
                    self.outcome = Some(SessionOutcome::Failed);
                    messages.push(UiMessage::error(lost.code(), lost.user_message(), true));
                }
                self.stop_session();
                messages
            }
            NoticeKind::Completed(result) => {
                info!(pet = %result.pet_name, "Consultation completed");
                self.outcome = Some(SessionOutcome::Completed);
                self.stop_session();
                vec![UiMessage::Completed { result }]
            }
            NoticeKind::Failed(error) => {
                let fatal = error.is_fatal();
                let message = if fatal && !self.connected {
                    "Failed to start AI service"
                } else {
                    error.user_message()
                };
                if fatal {
                    error!(error = %error, "Consultation failed");
                    if self.outcome.is_none() {
                        self.outcome = Some(SessionOutcome::Failed);
                    }
                    self.stop_session();
                } else {
                    warn!(error = %error, "Consultation problem");
                }
                vec![UiMessage::error(error.code(), message, fatal)]
            }
        }
    }

    /// Tear down the current session, if any. Metrics and the session slot
    /// are settled once the controller has fully stopped.
    fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.microphone = None;

        let state = self.state.clone();
        let holds_slot = std::mem::take(&mut self.holds_slot);
        let outcome = self.outcome.take().unwrap_or(SessionOutcome::Abandoned);

        actix::spawn(async move {
            session.stop().await;
            state.record_session_end(&session.stats(), outcome);
            if holds_slot {
                state.release_session_slot();
            }
            info!(
                session_id = %session.id(),
                outcome = ?outcome,
                turns = session.transcript().len(),
                "Consultation ended"
            );
        });
    }

    fn handle_client_event(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            ClientEvent::Start { sample_rate } => self.start_session(sample_rate, ctx),
            ClientEvent::Mute { muted } => match &self.session {
                Some(session) => session.set_muted(muted),
                None => debug!(muted, "Mute ignored, no consultation running"),
            },
            ClientEvent::Text { text } => {
                let delivered = self
                    .session
                    .as_ref()
                    .map(|session| session.send_text_response(&text))
                    .unwrap_or(false);
                if !delivered {
                    self.send_error(ctx, "not_connected", "The assistant is not listening yet", false);
                }
            }
            ClientEvent::Stop => self.stop_session(),
            ClientEvent::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
        }
    }

    fn handle_capture(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let samples = match samples_from_le_bytes(data) {
            Ok(samples) => samples,
            Err(e) => {
                self.send_error(ctx, "audio_error", &e, false);
                return;
            }
        };

        let delivered = self
            .microphone
            .as_ref()
            .map(|microphone| microphone.feed(samples))
            .unwrap_or(false);
        if !delivered {
            debug!(bytes = data.len(), "Capture dropped, microphone is not active");
        }
    }
}

impl Actor for ConsultationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(authenticated = self.actor_id.is_some(), "Consultation socket opened");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("Consultation socket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let ping = UiMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            act.send(ctx, &ping);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Consultation socket closed");
        self.stop_session();
    }
}

impl Handler<SessionNotice> for ConsultationSocket {
    type Result = ();

    fn handle(&mut self, notice: SessionNotice, ctx: &mut Self::Context) {
        for message in self.apply_notice(notice) {
            self.send(ctx, &message);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConsultationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => self.handle_client_event(event, ctx),
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err), false)
                }
            },
            Ok(ws::Message::Binary(data)) => self.handle_capture(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Consultation socket close requested");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/consultation` to a consultation socket.
pub async fn consultation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let actor_id = req
        .headers()
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    debug!(
        peer = ?req.connection_info().peer_addr(),
        authenticated = actor_id.is_some(),
        "Consultation socket upgrade requested"
    );

    ws::start(ConsultationSocket::new(app_state, actor_id), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, playback::ScheduledPlayback};
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use serde_json::json;
    use std::sync::Mutex;

    /// Collects a session's callbacks the way the socket's mailbox would.
    struct Mailbox {
        generation: u64,
        events: Mutex<Vec<NoticeKind>>,
    }

    impl Mailbox {
        fn push(&self, event: NoticeKind) {
            self.events.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<SessionNotice> {
            self.events
                .lock()
                .unwrap()
                .drain(..)
                .map(|event| SessionNotice {
                    generation: self.generation,
                    event,
                })
                .collect()
        }
    }

    impl SessionCallbacks for Mailbox {
        fn on_connection_change(&self, connected: bool) {
            self.push(NoticeKind::Connection(connected));
        }
        fn on_assistant_text(&self, text: &str, is_final: bool) {
            self.push(NoticeKind::Ui(UiMessage::AssistantText {
                text: text.to_string(),
                is_final,
            }));
        }
        fn on_user_text(&self, text: &str) {
            self.push(NoticeKind::Ui(UiMessage::UserText {
                text: text.to_string(),
            }));
        }
        fn on_audio(&self, audio: &PlaybackAudio) {
            self.push(NoticeKind::Ui(UiMessage::audio(audio)));
        }
        fn on_complete(&self, result: ConsultationResult) {
            self.push(NoticeKind::Completed(result));
        }
        fn on_error(&self, error: &ConsultationError) {
            self.push(NoticeKind::Failed(error.clone()));
        }
        fn on_interrupted(&self) {
            self.push(NoticeKind::Ui(UiMessage::Interrupted));
        }
    }

    fn socket_with_limit(max_concurrent_sessions: usize) -> (ConsultationSocket, web::Data<AppState>) {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_concurrent_sessions;
        let state = web::Data::new(test_state(config));
        let socket = ConsultationSocket::new(state.clone(), Some("user-1".to_string()));
        (socket, state)
    }

    fn begin(socket: &mut ConsultationSocket) -> (Arc<SessionController>, Arc<Mailbox>) {
        let mut mailbox = None;
        let session = socket
            .begin_session(Some(16_000), |generation| -> Arc<dyn SessionCallbacks> {
                let created = Arc::new(Mailbox {
                    generation,
                    events: Mutex::new(Vec::new()),
                });
                mailbox = Some(Arc::clone(&created));
                created
            })
            .unwrap();
        (session, mailbox.unwrap())
    }

    fn deliver(socket: &mut ConsultationSocket, event: NoticeKind) -> Vec<UiMessage> {
        let generation = socket.generation;
        socket.apply_notice(SessionNotice { generation, event })
    }

    fn replay(socket: &mut ConsultationSocket, mailbox: &Mailbox) -> Vec<UiMessage> {
        mailbox
            .take()
            .into_iter()
            .flat_map(|notice| socket.apply_notice(notice))
            .collect()
    }

    /// Teardown settles metrics and the slot on a spawned task.
    async fn wait_for_active_sessions(state: &AppState, expected: usize) {
        for _ in 0..400 {
            if state.get_metrics_snapshot().active_sessions == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session slot was never released");
    }

    fn booking() -> ConsultationResult {
        serde_json::from_value(json!({
            "petName": "Max",
            "petType": "dog",
            "summary": "Limping on the left hind leg"
        }))
        .unwrap()
    }

    #[test]
    fn test_client_events_parse() {
        let start: ClientEvent =
            serde_json::from_str(r#"{"type":"start","sample_rate":16000}"#).unwrap();
        assert_eq!(start, ClientEvent::Start { sample_rate: Some(16_000) });

        let denied: ClientEvent = serde_json::from_str(r#"{"type":"start"}"#).unwrap();
        assert_eq!(denied, ClientEvent::Start { sample_rate: None });

        let text: ClientEvent =
            serde_json::from_str(r#"{"type":"text","text":"Max"}"#).unwrap();
        assert_eq!(text, ClientEvent::Text { text: "Max".to_string() });

        let stop: ClientEvent = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, ClientEvent::Stop);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_ui_messages_are_tagged() {
        let text = serde_json::to_value(UiMessage::AssistantText {
            text: "Hello".to_string(),
            is_final: false,
        })
        .unwrap();
        assert_eq!(text, json!({"type": "assistant_text", "text": "Hello", "is_final": false}));

        let error = serde_json::to_value(UiMessage::error(
            "acquisition_error",
            "Failed to start AI service",
            true,
        ))
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["fatal"], true);

        let interrupted = serde_json::to_value(UiMessage::Interrupted).unwrap();
        assert_eq!(interrupted, json!({"type": "interrupted"}));
    }

    #[test]
    fn test_audio_message_carries_schedule() {
        let audio = PlaybackAudio {
            frame: AudioFrame::new(vec![0.0; 240], 24_000),
            schedule: ScheduledPlayback {
                start_at: 1.5,
                duration: 0.01,
            },
        };
        let value = serde_json::to_value(UiMessage::audio(&audio)).unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["mime_type"], "audio/pcm;rate=24000");
        assert_eq!(value["start_at"], 1.5);
        assert!(!value["data"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_completed_message_uses_booking_field_names() {
        let result: ConsultationResult = serde_json::from_value(json!({
            "petName": "Max",
            "petType": "dog",
            "summary": "Vomiting since yesterday"
        }))
        .unwrap();
        let value = serde_json::to_value(UiMessage::Completed { result }).unwrap();
        assert_eq!(value["type"], "completed");
        assert_eq!(value["result"]["petName"], "Max");
        assert!(value["result"].get("preferredDate").is_none());
    }

    #[actix_web::test]
    async fn test_start_over_capacity_is_rejected() {
        let (mut socket, state) = socket_with_limit(1);
        assert!(state.try_acquire_session_slot());

        let rejection = socket
            .begin_session(Some(16_000), |generation| -> Arc<dyn SessionCallbacks> {
                Arc::new(Mailbox {
                    generation,
                    events: Mutex::new(Vec::new()),
                })
            })
            .err().unwrap();
        assert_eq!(
            serde_json::to_value(&rejection).unwrap(),
            json!({
                "type": "error",
                "code": "capacity",
                "message": "The assistant is busy right now. Please try again in a moment.",
                "fatal": true
            })
        );

        assert!(socket.session.is_none());
        assert!(!socket.holds_slot);
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.consultations.rejected_at_capacity, 1);
    }

    #[actix_web::test]
    async fn test_second_start_while_running_is_rejected() {
        let (mut socket, state) = socket_with_limit(2);
        let _first = begin(&mut socket);

        let rejection = socket
            .begin_session(Some(16_000), |generation| -> Arc<dyn SessionCallbacks> {
                Arc::new(Mailbox {
                    generation,
                    events: Mutex::new(Vec::new()),
                })
            })
            .err().unwrap();
        let value = serde_json::to_value(&rejection).unwrap();
        assert_eq!(value["code"], "session_active");
        assert_eq!(value["fatal"], false);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);

        socket.stop_session();
        wait_for_active_sessions(&state, 0).await;
    }

    #[actix_web::test]
    async fn test_failed_start_releases_slot() {
        let (mut socket, state) = socket_with_limit(1);
        let (session, mailbox) = begin(&mut socket);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);

        // The test connector is offline, so opening the live link fails.
        session.start().await;
        let messages = replay(&mut socket, &mailbox);
        assert_eq!(
            messages,
            vec![
                UiMessage::error("connection_error", "Failed to start AI service", true),
                UiMessage::Connection { connected: false },
            ]
        );
        assert!(socket.session.is_none());

        wait_for_active_sessions(&state, 0).await;
        let consultations = state.get_metrics_snapshot().consultations;
        assert_eq!(consultations.failed, 1);
        assert_eq!(consultations.completed, 0);

        // The freed slot can be taken again.
        let _next = begin(&mut socket);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[actix_web::test]
    async fn test_completion_tears_down_session() {
        let (mut socket, state) = socket_with_limit(1);
        let (_session, mailbox) = begin(&mut socket);

        assert_eq!(
            deliver(&mut socket, NoticeKind::Connection(true)),
            vec![UiMessage::Connection { connected: true }]
        );
        let messages = deliver(&mut socket, NoticeKind::Completed(booking()));
        assert_eq!(messages, vec![UiMessage::Completed { result: booking() }]);
        assert!(socket.session.is_none());
        assert!(socket.microphone.is_none());

        wait_for_active_sessions(&state, 0).await;
        assert_eq!(state.get_metrics_snapshot().consultations.completed, 1);

        // Stopping reports the disconnect; it is not shown as an error.
        assert_eq!(
            replay(&mut socket, &mailbox),
            vec![UiMessage::Connection { connected: false }]
        );
        assert_eq!(state.get_metrics_snapshot().consultations.failed, 0);
    }

    #[actix_web::test]
    async fn test_remote_close_of_open_session_is_reported() {
        let (mut socket, state) = socket_with_limit(1);
        let _begun = begin(&mut socket);
        deliver(&mut socket, NoticeKind::Connection(true));

        let messages = deliver(&mut socket, NoticeKind::Connection(false));
        let lost = ConsultationError::Connection(String::new());
        assert_eq!(
            messages,
            vec![
                UiMessage::Connection { connected: false },
                UiMessage::error("connection_error", lost.user_message(), true),
            ]
        );
        assert!(socket.session.is_none());

        wait_for_active_sessions(&state, 0).await;
        assert_eq!(state.get_metrics_snapshot().consultations.failed, 1);
    }

    #[actix_web::test]
    async fn test_stale_generation_is_ignored() {
        let (mut socket, state) = socket_with_limit(2);
        let (_first, first_mailbox) = begin(&mut socket);
        deliver(&mut socket, NoticeKind::Completed(booking()));

        let (_second, _) = begin(&mut socket);
        assert_eq!(socket.generation, 2);

        let late = socket.apply_notice(SessionNotice {
            generation: 1,
            event: NoticeKind::Failed(ConsultationError::Connection("reset".to_string())),
        });
        assert!(late.is_empty());
        wait_for_active_sessions(&state, 1).await;
        assert!(replay(&mut socket, &first_mailbox).is_empty());

        assert!(socket.session.is_some());
        assert!(socket.outcome.is_none());
        assert_eq!(state.get_metrics_snapshot().consultations.failed, 0);

        socket.stop_session();
        wait_for_active_sessions(&state, 0).await;
    }
}
