//! Session lifecycle controller.
//!
//! Owns every resource of one call (microphone, output, scheduler, transport,
//! capture pipeline) and is the only writer of the [`SessionState`]. All
//! handlers check the `active` flag first, so anything arriving after teardown
//! began is ignored.

use crate::capture::{CapturePipeline, VolumeMeter};
use crate::codec::{self, AudioBuffer, PlaybackDecoder};
use crate::config::Config;
use crate::consent::Consent;
use crate::device::{AudioDevices, DeviceError, MicrophoneStream, OutputContext};
use crate::playback::{self, SharedScheduler};
use async_trait::async_trait;
use gemini_live::{
    AudioChunk, ConnectionError, Endpoint, InboundEvent, SessionSetup, Transport,
    protocol::DEFAULT_MODEL,
};
use octn_core::{
    Control,
    agent::AgentProfile,
    session_state::{SessionState, SessionStatus},
    tools::{ToolInvocation, ToolResponder},
};
use std::time::Duration;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_CAPTURE_POLL: Duration = Duration::from_millis(20);
/// How long teardown waits for the close frame to reach the server.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub volume: VolumeMeter,
    /// How often buffered microphone audio is framed and sent.
    pub capture_poll: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            volume: config.volume_meter(),
            capture_poll: DEFAULT_CAPTURE_POLL,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            volume: VolumeMeter::default(),
            capture_poll: DEFAULT_CAPTURE_POLL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to access audio device: {0}")]
    DeviceAccess(#[from] DeviceError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("failed to start capture: {0}")]
    Capture(String),
    #[error("failed to set up playback: {0}")]
    Playback(#[from] codec::DecodeError),
    #[error("session was already started")]
    AlreadyStarted,
}

/// Opens the live channel for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        setup: &SessionSetup,
    ) -> Result<(Transport, mpsc::Receiver<InboundEvent>), ConnectionError>;
}

pub struct GeminiConnector {
    endpoint: Endpoint,
    handshake_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(endpoint: Endpoint, handshake_timeout: Duration) -> Self {
        Self {
            endpoint,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Endpoint::new(config.live_url.clone(), config.gemini_api_key.clone()),
            config.setup_timeout,
        )
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
    ) -> Result<(Transport, mpsc::Receiver<InboundEvent>), ConnectionError> {
        Transport::open(&self.endpoint, setup, self.handshake_timeout).await
    }
}

pub struct Session {
    profile: AgentProfile,
    settings: SessionSettings,
    devices: Box<dyn AudioDevices>,
    connector: Box<dyn Connector>,
    responder: ToolResponder,
    state: SessionState,
    started: bool,
    active: bool,
    microphone: Option<Box<dyn MicrophoneStream>>,
    output: Option<Box<dyn OutputContext>>,
    scheduler: Option<SharedScheduler>,
    decoder: Option<PlaybackDecoder>,
    transport: Option<Transport>,
    closing: Option<Transport>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    capture: Option<CapturePipeline>,
    mic_buffer: Vec<f32>,
}

impl Session {
    pub fn new(
        profile: &AgentProfile,
        settings: SessionSettings,
        devices: Box<dyn AudioDevices>,
        connector: Box<dyn Connector>,
        responder: ToolResponder,
    ) -> Self {
        Self {
            profile: profile.clone(),
            settings,
            devices,
            connector,
            responder,
            state: SessionState::new(),
            started: false,
            active: false,
            microphone: None,
            output: None,
            scheduler: None,
            decoder: None,
            transport: None,
            closing: None,
            inbound: None,
            capture: None,
            mic_buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Acquires the devices, opens the channel and starts streaming.
    ///
    /// On failure the session ends in `Error` and everything acquired so far is
    /// released. A session can be started once.
    #[instrument(skip_all, fields(agent = %self.profile.kind))]
    pub async fn start(&mut self, _consent: Consent) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.started = true;
        self.active = true;
        self.state
            .transition(SessionStatus::Connecting, "Initializing connection...");

        match self.acquire_and_connect().await {
            Ok(()) => {
                self.state
                    .transition(SessionStatus::Connected, "Connected. Agent is speaking...");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start session");
                self.state.fail("Failed to access microphone or API.");
                self.active = false;
                self.release_all();
                Err(e)
            }
        }
    }

    async fn acquire_and_connect(&mut self) -> Result<(), SessionError> {
        let microphone = self.devices.acquire_microphone()?;
        let mic_rate = microphone.sample_rate();
        self.microphone = Some(microphone);

        let output = self.devices.open_output()?;
        self.scheduler = Some(output.scheduler());
        self.decoder = Some(PlaybackDecoder::new(output.sample_rate())?);
        self.output = Some(output);

        self.state
            .transition(SessionStatus::Connecting, "Connecting to Agent...");
        let setup = SessionSetup::for_profile(
            self.settings.model.clone(),
            &self.profile,
            self.responder.declarations(),
        );
        let (transport, inbound) = self.connector.connect(&setup).await?;
        self.transport = Some(transport);
        self.inbound = Some(inbound);

        let mut capture = CapturePipeline::start(mic_rate, self.settings.volume)
            .map_err(|e| SessionError::Capture(e.to_string()))?;
        capture.set_muted(self.state.muted);
        self.capture = Some(capture);
        if let Some(microphone) = self.microphone.as_mut() {
            microphone.resume()?;
        }
        Ok(())
    }

    /// Frames whatever the microphone captured since the last call and sends it.
    /// Returns the number of frames forwarded.
    pub fn pump_capture(&mut self) -> usize {
        if !self.active {
            return 0;
        }
        let (Some(microphone), Some(capture), Some(transport)) = (
            self.microphone.as_mut(),
            self.capture.as_mut(),
            self.transport.as_mut(),
        ) else {
            return 0;
        };
        self.mic_buffer.clear();
        microphone.drain_into(&mut self.mic_buffer);
        let forwarded = capture.process(&self.mic_buffer, transport);
        self.state.volume = capture.volume();
        forwarded
    }

    /// Applies one event from the transport. Returns `false` once the channel
    /// has ended and the session should stop.
    pub async fn handle_inbound(&mut self, event: InboundEvent) -> bool {
        if !self.active {
            return false;
        }
        match event {
            InboundEvent::SetupComplete => debug!("Duplicate setup acknowledgment ignored"),
            InboundEvent::Audio(chunk) => self.play(chunk),
            InboundEvent::Interrupted => {
                if let Some(decoder) = self.decoder.as_mut() {
                    decoder.reset();
                }
                if let Some(scheduler) = &self.scheduler {
                    playback::lock(scheduler).interrupt();
                }
            }
            InboundEvent::TurnComplete => {
                debug!("Agent turn complete");
                if let Some(decoder) = self.decoder.as_mut() {
                    let tail = decoder.flush();
                    self.enqueue(tail);
                }
            }
            InboundEvent::InputTranscription(text) => debug!(%text, "Candidate transcription"),
            InboundEvent::OutputTranscription(text) => debug!(%text, "Agent transcription"),
            InboundEvent::ToolCall(invocation) => self.answer_tool_call(invocation).await,
            InboundEvent::ToolCallCancelled(ids) => info!(?ids, "Agent cancelled tool calls"),
            InboundEvent::GoAway(time_left) => {
                warn!(?time_left, "Live service will end the session soon")
            }
            InboundEvent::Closed(reason) => {
                info!(?reason, "Live channel closed");
                self.state.close("Disconnected");
                return false;
            }
            InboundEvent::Errored(e) => {
                error!(error = %e, "Live channel failed");
                self.state.fail("Error connecting to AI service.");
                return false;
            }
        }
        true
    }

    fn play(&mut self, chunk: AudioChunk) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        match decoder.decode(&chunk.data, chunk.mime_type.as_deref()) {
            Ok(buffer) => self.enqueue(buffer),
            Err(e) => warn!(
                error = %e,
                bytes = chunk.data.len(),
                "Dropping undecodable audio chunk"
            ),
        }
    }

    fn enqueue(&self, buffer: AudioBuffer) {
        if buffer.is_empty() {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            playback::lock(scheduler).enqueue(buffer);
        }
    }

    async fn answer_tool_call(&mut self, invocation: ToolInvocation) {
        info!(id = %invocation.id, name = %invocation.name, "Tool invocation received");
        let Some(result) = self.responder.respond(&invocation).await else {
            warn!(name = %invocation.name, "Unrecognized tool; no result sent");
            return;
        };
        let sent = self
            .transport
            .as_ref()
            .is_some_and(|transport| transport.send_tool_result(&result));
        if sent && !result.is_error() {
            self.state.transcript_sent = true;
        }
    }

    /// Flips the mute flag. Takes effect from the next captured frame.
    pub fn toggle_mute(&mut self) -> bool {
        self.state.muted = !self.state.muted;
        if let Some(capture) = self.capture.as_mut() {
            capture.set_muted(self.state.muted);
        }
        info!(muted = self.state.muted, "Microphone mute toggled");
        self.state.muted
    }

    /// Tears the session down. Safe in any state and idempotent.
    #[instrument(skip_all, fields(agent = %self.profile.kind))]
    pub fn end(&mut self) {
        let was_active = std::mem::replace(&mut self.active, false);
        self.release_all();
        if !self.state.status.is_terminal() {
            self.state.close("Session ended.");
        }
        if was_active {
            info!(transcript_sent = self.state.transcript_sent, "Session ended");
        }
    }

    /// Releases resources in teardown order. Every step runs even if an
    /// earlier one failed.
    fn release_all(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.suspend() {
                warn!(error = %e, "Failed to suspend audio output");
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            playback::lock(&scheduler).interrupt();
        }
        self.decoder = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.closing = Some(transport);
        }
        self.inbound = None;
        if let Some(mut microphone) = self.microphone.take() {
            if let Err(e) = microphone.release() {
                warn!(error = %e, "Failed to release microphone");
            }
        }
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                warn!(error = %e, "Failed to close audio output");
            }
        }
    }

    /// Waits up to `grace` for a channel closed by [`end`](Self::end) to finish
    /// sending its close frame.
    pub async fn wait_closed(&mut self, grace: Duration) {
        if let Some(mut transport) = self.closing.take() {
            transport.wait_closed(grace).await;
        }
    }

    /// Drives a started session until it ends.
    ///
    /// Stops on [`Control::End`], when the control source goes away, or when the
    /// channel closes or fails. The session is torn down, and the channel's close
    /// handshake given [`CLOSE_GRACE`] to go out, before returning.
    pub async fn run(&mut self, mut controls: mpsc::Receiver<Control>) {
        let mut tick = tokio::time::interval(self.settings.capture_poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.active {
            tokio::select! {
                _ = tick.tick() => {
                    self.pump_capture();
                }
                event = recv_inbound(&mut self.inbound) => match event {
                    Some(event) => {
                        if !self.handle_inbound(event).await {
                            break;
                        }
                    }
                    None => {
                        warn!("Live channel went away without notice");
                        self.state.close("Disconnected");
                        break;
                    }
                },
                control = controls.recv() => match control {
                    Some(Control::ToggleMute) => {
                        self.toggle_mute();
                    }
                    Some(Control::End) | None => break,
                },
            }
        }
        self.end();
        self.wait_closed(CLOSE_GRACE).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.active = false;
        self.release_all();
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<InboundEvent>>) -> Option<InboundEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FRAME_SAMPLES;
    use crate::codec::PLAYBACK_SAMPLE_RATE;
    use gemini_live::transport::{Loopback, loopback};
    use gemini_live::types::ClientMessage;
    use octn_core::{
        agent::{AgentKind, AgentRegistry},
        tools::{DEFAULT_RECRUITER_EMAIL, LoggingMailer},
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<&'static str>>>);

    impl Journal {
        fn record(&self, entry: &'static str) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    type Feed = Arc<Mutex<Vec<f32>>>;

    struct FakeMicrophone {
        journal: Journal,
        feed: Feed,
    }

    impl MicrophoneStream for FakeMicrophone {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn resume(&mut self) -> Result<(), DeviceError> {
            self.journal.record("mic.resume");
            Ok(())
        }

        fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
            let mut feed = self.feed.lock().unwrap();
            let n = feed.len();
            out.append(&mut feed);
            n
        }

        fn release(&mut self) -> Result<(), DeviceError> {
            self.journal.record("mic.release");
            Ok(())
        }
    }

    struct FakeOutput {
        journal: Journal,
        scheduler: SharedScheduler,
    }

    impl OutputContext for FakeOutput {
        fn sample_rate(&self) -> u32 {
            playback::lock(&self.scheduler).sample_rate()
        }

        fn scheduler(&self) -> SharedScheduler {
            self.scheduler.clone()
        }

        fn suspend(&mut self) -> Result<(), DeviceError> {
            self.journal.record("output.suspend");
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.journal.record("output.close");
            // Failures must not stop teardown.
            Err(DeviceError::NoOutputDevice)
        }
    }

    struct FakeDevices {
        journal: Journal,
        feed: Feed,
        scheduler: SharedScheduler,
        microphone_denied: bool,
        output_missing: bool,
    }

    impl AudioDevices for FakeDevices {
        fn acquire_microphone(&mut self) -> Result<Box<dyn MicrophoneStream>, DeviceError> {
            self.journal.record("mic.acquire");
            if self.microphone_denied {
                return Err(DeviceError::NoInputDevice);
            }
            Ok(Box::new(FakeMicrophone {
                journal: self.journal.clone(),
                feed: self.feed.clone(),
            }))
        }

        fn open_output(&mut self) -> Result<Box<dyn OutputContext>, DeviceError> {
            self.journal.record("output.open");
            if self.output_missing {
                return Err(DeviceError::NoOutputDevice);
            }
            Ok(Box::new(FakeOutput {
                journal: self.journal.clone(),
                scheduler: self.scheduler.clone(),
            }))
        }
    }

    struct LoopbackConnector {
        journal: Journal,
        pending: Mutex<Option<(Transport, mpsc::Receiver<InboundEvent>)>>,
        setup: Arc<Mutex<Option<SessionSetup>>>,
        refuse: bool,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(
            &self,
            setup: &SessionSetup,
        ) -> Result<(Transport, mpsc::Receiver<InboundEvent>), ConnectionError> {
            self.journal.record("connect");
            *self.setup.lock().unwrap() = Some(setup.clone());
            if self.refuse {
                return Err(ConnectionError::Timeout(Duration::from_secs(10)));
            }
            self.pending
                .lock()
                .unwrap()
                .take()
                .ok_or(ConnectionError::ClosedDuringSetup)
        }
    }

    struct Harness {
        session: Session,
        journal: Journal,
        feed: Feed,
        scheduler: SharedScheduler,
        remote: Loopback,
        setup: Arc<Mutex<Option<SessionSetup>>>,
    }

    #[derive(Default)]
    struct Faults {
        microphone_denied: bool,
        output_missing: bool,
        refuse_connection: bool,
        output_rate: Option<u32>,
    }

    fn harness_with(faults: Faults) -> Harness {
        let journal = Journal::default();
        let feed: Feed = Arc::default();
        let scheduler = playback::shared(faults.output_rate.unwrap_or(PLAYBACK_SAMPLE_RATE));
        let (transport, inbound, remote) = loopback();
        remote.acknowledge();
        let setup = Arc::new(Mutex::new(None));

        let devices = FakeDevices {
            journal: journal.clone(),
            feed: feed.clone(),
            scheduler: scheduler.clone(),
            microphone_denied: faults.microphone_denied,
            output_missing: faults.output_missing,
        };
        let connector = LoopbackConnector {
            journal: journal.clone(),
            pending: Mutex::new(Some((transport, inbound))),
            setup: setup.clone(),
            refuse: faults.refuse_connection,
        };
        let registry = AgentRegistry::builtin();
        let profile = registry.get(AgentKind::Interviewer).unwrap();
        let responder = ToolResponder::new(
            Arc::new(LoggingMailer::new(DEFAULT_RECRUITER_EMAIL)),
            DEFAULT_RECRUITER_EMAIL,
        );
        let session = Session::new(
            profile,
            SessionSettings::default(),
            Box::new(devices),
            Box::new(connector),
            responder,
        );

        Harness {
            session,
            journal,
            feed,
            scheduler,
            remote,
            setup,
        }
    }

    fn harness() -> Harness {
        harness_with(Faults::default())
    }

    fn sent(remote: &mut Loopback) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = remote.outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    fn transcript_call(id: &str) -> InboundEvent {
        let args = json!({
            "candidateName": "Ada",
            "summary": "Strong systems background.",
            "recommendation": "Hire",
            "recipientEmail": DEFAULT_RECRUITER_EMAIL,
        });
        InboundEvent::ToolCall(ToolInvocation {
            id: id.to_string(),
            name: "sendTranscriptionEmail".to_string(),
            args: args.as_object().unwrap().clone(),
        })
    }

    #[tokio::test]
    async fn test_start_acquires_then_connects() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        assert_eq!(h.session.state().status, SessionStatus::Connected);
        assert_eq!(
            h.session.state().status_message,
            "Connected. Agent is speaking..."
        );
        assert_eq!(
            h.journal.entries(),
            vec!["mic.acquire", "output.open", "connect", "mic.resume"]
        );

        let setup = h.setup.lock().unwrap().clone().unwrap();
        assert_eq!(setup.voice, "Fenrir");
        assert_eq!(setup.model, DEFAULT_MODEL);
        assert_eq!(setup.tools.len(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        let err = h.session.start(Consent::pre_accepted()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted));
        assert!(h.session.state().is_connected());
    }

    #[tokio::test]
    async fn test_denied_microphone_fails_without_connecting() {
        let mut h = harness_with(Faults {
            microphone_denied: true,
            ..Faults::default()
        });

        let err = h.session.start(Consent::pre_accepted()).await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceAccess(_)));
        assert_eq!(h.session.state().status, SessionStatus::Error);
        assert_eq!(
            h.session.state().status_message,
            "Failed to access microphone or API."
        );
        assert_eq!(h.journal.entries(), vec!["mic.acquire"]);
        assert!(!h.session.is_active());
    }

    #[tokio::test]
    async fn test_partial_start_releases_microphone() {
        let mut h = harness_with(Faults {
            output_missing: true,
            ..Faults::default()
        });

        assert!(h.session.start(Consent::pre_accepted()).await.is_err());
        assert_eq!(
            h.journal.entries(),
            vec!["mic.acquire", "output.open", "mic.release"]
        );
    }

    #[tokio::test]
    async fn test_connection_failure_releases_everything() {
        let mut h = harness_with(Faults {
            refuse_connection: true,
            ..Faults::default()
        });

        let err = h.session.start(Consent::pre_accepted()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Connection(ConnectionError::Timeout(_))
        ));
        assert_eq!(h.session.state().status, SessionStatus::Error);
        assert_eq!(
            h.journal.entries(),
            vec![
                "mic.acquire",
                "output.open",
                "connect",
                "output.suspend",
                "mic.release",
                "output.close"
            ]
        );
    }

    #[tokio::test]
    async fn test_muted_frames_are_not_sent() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        assert!(h.session.toggle_mute());
        for _ in 0..3 {
            h.feed.lock().unwrap().extend([0.2; FRAME_SAMPLES]);
            assert_eq!(h.session.pump_capture(), 0);
        }
        assert!(sent(&mut h.remote).is_empty());
        assert!(h.session.state().volume > 0.0);

        assert!(!h.session.toggle_mute());
        h.feed.lock().unwrap().extend([0.2; FRAME_SAMPLES]);
        assert_eq!(h.session.pump_capture(), 1);
        let messages = sent(&mut h.remote);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ClientMessage::RealtimeInput(_)));
    }

    #[tokio::test]
    async fn test_audio_is_scheduled_and_bad_chunks_dropped() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        let chunk = AudioChunk {
            mime_type: Some("audio/pcm;rate=24000".to_string()),
            data: vec![0; 2 * 2400],
        };
        assert!(h.session.handle_inbound(InboundEvent::Audio(chunk)).await);
        let truncated = AudioChunk {
            mime_type: None,
            data: vec![0; 3],
        };
        assert!(h.session.handle_inbound(InboundEvent::Audio(truncated)).await);

        assert_eq!(playback::lock(&h.scheduler).live_units().len(), 1);
        assert!(h.session.state().is_connected());
    }

    #[tokio::test]
    async fn test_resampled_playback_has_no_seams() {
        let mut h = harness_with(Faults {
            output_rate: Some(48000),
            ..Faults::default()
        });
        h.session.start(Consent::pre_accepted()).await.unwrap();

        let chunk = AudioChunk {
            mime_type: Some("audio/pcm;rate=24000".to_string()),
            data: codec::encode(&[0.5; 2400]),
        };
        for _ in 0..2 {
            assert!(h.session.handle_inbound(InboundEvent::Audio(chunk.clone())).await);
        }
        assert!(h.session.handle_inbound(InboundEvent::TurnComplete).await);

        let mut rendered = vec![0.0; 9600];
        playback::lock(&h.scheduler).render(&mut rendered);
        for (i, sample) in rendered[64..9536].iter().enumerate() {
            assert!((sample - 0.5).abs() < 0.01, "sample {} is {sample}", i + 64);
        }
    }

    #[tokio::test]
    async fn test_interruption_flushes_playback() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();
        for _ in 0..3 {
            let chunk = AudioChunk {
                mime_type: None,
                data: vec![0; 4800],
            };
            h.session.handle_inbound(InboundEvent::Audio(chunk)).await;
        }

        assert!(h.session.handle_inbound(InboundEvent::Interrupted).await);
        let scheduler = playback::lock(&h.scheduler);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[tokio::test]
    async fn test_tool_call_gets_exactly_one_result() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        assert!(h.session.handle_inbound(transcript_call("fc-7")).await);

        let messages = sent(&mut h.remote);
        assert_eq!(messages.len(), 1);
        let ClientMessage::ToolResponse(response) = &messages[0] else {
            panic!("expected a tool response, got {:?}", messages[0]);
        };
        assert_eq!(response.function_responses.len(), 1);
        assert_eq!(response.function_responses[0].id, "fc-7");
        assert_eq!(
            response.function_responses[0].response,
            json!({ "result": "Email sent successfully to alex@octalent.net" })
        );
        assert!(h.session.state().transcript_sent);
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_no_result() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        let call = InboundEvent::ToolCall(ToolInvocation {
            id: "fc-1".to_string(),
            name: "bookMeeting".to_string(),
            args: Default::default(),
        });
        assert!(h.session.handle_inbound(call).await);
        assert!(sent(&mut h.remote).is_empty());
        assert!(!h.session.state().transcript_sent);
    }

    #[tokio::test]
    async fn test_end_releases_in_order_and_is_idempotent() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();
        h.session
            .handle_inbound(InboundEvent::Audio(AudioChunk {
                mime_type: None,
                data: vec![0; 4800],
            }))
            .await;

        h.session.end();
        h.session.end();
        h.session.wait_closed(CLOSE_GRACE).await;

        assert_eq!(
            h.journal.entries()[4..],
            ["output.suspend", "mic.release", "output.close"]
        );
        assert!(playback::lock(&h.scheduler).is_idle());
        assert_eq!(
            h.remote.transport_state(),
            gemini_live::TransportState::Closed
        );
        assert_eq!(h.session.state().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_handlers_are_inert_after_end() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();
        h.session.end();

        h.feed.lock().unwrap().extend([0.2; FRAME_SAMPLES]);
        assert_eq!(h.session.pump_capture(), 0);
        assert!(!h.session.handle_inbound(transcript_call("late")).await);
        assert!(!h.session.state().transcript_sent);
    }

    #[tokio::test]
    async fn test_end_before_start_is_safe() {
        let mut h = harness();
        h.session.end();

        assert!(h.journal.entries().is_empty());
        assert_eq!(h.session.state().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_channel_errors_mark_session_failed() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();

        let keep_going = h
            .session
            .handle_inbound(InboundEvent::Errored("connection reset".to_string()))
            .await;
        assert!(!keep_going);
        assert_eq!(
            h.session.state().status_message,
            "Error connecting to AI service."
        );

        h.session.end();
        assert_eq!(h.session.state().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_run_applies_controls_until_end() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();
        let (controls, rx) = mpsc::channel(4);

        let driver = async {
            controls.send(Control::ToggleMute).await.unwrap();
            controls.send(Control::End).await.unwrap();
        };
        tokio::join!(h.session.run(rx), driver);

        assert!(h.session.state().muted);
        assert!(!h.session.is_active());
        assert_eq!(h.session.state().status, SessionStatus::Closed);
        assert!(h.journal.entries().contains(&"mic.release"));
    }

    #[tokio::test]
    async fn test_run_stops_when_remote_hangs_up() {
        let mut h = harness();
        h.session.start(Consent::pre_accepted()).await.unwrap();
        let (_controls, rx) = mpsc::channel::<Control>(1);

        h.remote.hang_up(Some("session expired".to_string())).await;
        h.session.run(rx).await;

        assert_eq!(h.session.state().status, SessionStatus::Closed);
        assert_eq!(h.session.state().status_message, "Disconnected");
        assert!(h.journal.entries().contains(&"output.close"));
    }
}
