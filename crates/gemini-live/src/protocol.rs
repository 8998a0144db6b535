//! Translation between the client's session model and Gemini Live messages.

use crate::types::{
    AudioTranscriptionConfig, Blob, ClientMessage, Content, FunctionDeclaration, FunctionResponse, GenerationConfig, Part,
    PrebuiltVoiceConfig, RealtimeInput, ResponseModality, ServerMessage, Setup, SpeechConfig,
    Tool, ToolResponse, VoiceConfig,
};
use base64::Engine;
use octn_core::{
    agent::AgentProfile,
    tools::{ToolDeclaration, ToolInvocation, ToolResult},
};
use tracing::warn;

pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
/// MIME type of every outbound microphone frame.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed server message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server message is not valid UTF-8")]
    NotUtf8,
}

/// Behavioral configuration sent once when the channel opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
    /// Ask the server to transcribe both the candidate and the agent.
    pub transcribe: bool,
}

impl SessionSetup {
    pub fn for_profile(model: impl Into<String>, profile: &AgentProfile, tools: Vec<ToolDeclaration>) -> Self {
        Self {
            model: model.into(),
            voice: profile.voice().as_str().to_string(),
            system_instruction: profile.system_instruction.clone(),
            tools,
            transcribe: true,
        }
    }

    pub fn to_message(&self) -> ClientMessage {
        let tools = if self.tools.is_empty() {
            vec![]
        } else {
            vec![Tool {
                function_declarations: self
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters_json_schema: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };
        let transcription = self.transcribe.then(AudioTranscriptionConfig::default);
        ClientMessage::Setup(Setup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: self.system_instruction.clone(),
                }],
            },
            tools,
            input_audio_transcription: transcription.clone(),
            output_audio_transcription: transcription,
        })
    }
}

/// Wraps one encoded 16 kHz PCM frame for the realtime input stream.
pub fn realtime_audio(pcm: &[u8]) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        audio: Blob {
            mime_type: INPUT_MIME_TYPE.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(pcm),
        },
    })
}

pub fn tool_response(result: &ToolResult) -> ClientMessage {
    ClientMessage::ToolResponse(ToolResponse {
        function_responses: vec![FunctionResponse {
            id: result.id.clone(),
            name: result.name.clone(),
            response: result.result.clone(),
        }],
    })
}

/// A base64-decoded audio chunk from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// Everything the transport reports to the session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupComplete,
    Audio(AudioChunk),
    /// The candidate barged in; queued agent speech must be flushed.
    Interrupted,
    TurnComplete,
    InputTranscription(String),
    OutputTranscription(String),
    ToolCall(ToolInvocation),
    ToolCallCancelled(Vec<String>),
    GoAway(Option<String>),
    /// The channel ended cleanly, with the close reason if one was given.
    Closed(Option<String>),
    Errored(String),
}

/// Splits one server message into events.
///
/// Audio parts come first, then the interruption flag, so an interruption
/// arriving with a trailing chunk still flushes that chunk. Audio parts whose
/// payload is not valid base64 are dropped with a warning.
pub fn parse_server_message(text: &str) -> Result<Vec<InboundEvent>, ProtocolError> {
    let msg: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(InboundEvent::SetupComplete);
    }

    if let Some(content) = msg.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                        Ok(data) => events.push(InboundEvent::Audio(AudioChunk {
                            mime_type: blob.mime_type,
                            data,
                        })),
                        Err(e) => warn!(error = %e, "Dropping audio part with invalid base64"),
                    }
                }
            }
        }
        if content.interrupted == Some(true) {
            events.push(InboundEvent::Interrupted);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            events.push(InboundEvent::InputTranscription(text));
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            events.push(InboundEvent::OutputTranscription(text));
        }
        if content.turn_complete == Some(true) {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(call) = msg.tool_call {
        events.extend(call.function_calls.into_iter().map(|fc| {
            InboundEvent::ToolCall(ToolInvocation {
                id: fc.id,
                name: fc.name,
                args: fc.args,
            })
        }));
    }

    if let Some(cancel) = msg.tool_call_cancellation {
        events.push(InboundEvent::ToolCallCancelled(cancel.ids));
    }

    if let Some(go_away) = msg.go_away {
        events.push(InboundEvent::GoAway(go_away.time_left));
    }

    Ok(events)
}

/// Same as [`parse_server_message`] for binary WebSocket frames carrying JSON.
pub fn parse_server_bytes(bytes: &[u8]) -> Result<Vec<InboundEvent>, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
    parse_server_message(text)
}
