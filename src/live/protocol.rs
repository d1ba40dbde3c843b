//! # Live Protocol Messages
//!
//! Outbound messages are externally tagged JSON objects with one top-level
//! key (`setup`, `realtimeInput`, `clientContent`, `toolResponse`). Inbound
//! messages may carry several parts at once, so [`ServerMessage::into_events`]
//! flattens each one into an ordered list of [`ServerEvent`]s.

use crate::audio::AudioChunk;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn audio(chunk: AudioChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }

    /// A complete user turn typed instead of spoken.
    pub fn user_text(text: &str) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        })
    }

    pub fn tool_response(id: &str, name: &str, response: Value) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: id.to_string(),
                name: name.to_string(),
                response,
            }],
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::RealtimeInput(_) => "realtimeInput",
            ClientMessage::ClientContent(_) => "clientContent",
            ClientMessage::ToolResponse(_) => "toolResponse",
        }
    }
}

/// First message on the socket: model, persona, voice and tools.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<Value>,
    pub input_audio_transcription: Value,
    pub output_audio_transcription: Value,
}

impl Setup {
    /// Audio-only responses with transcription enabled in both directions.
    pub fn new(model: &str, voice: &str, system_instruction: &str, declarations: Value) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
            tools: vec![json!({ "functionDeclarations": declarations })],
            input_audio_transcription: json!({}),
            output_audio_transcription: json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<AudioChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<InboundPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// One function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// One thing the session has to react to, in processing order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Interrupted,
    InputTranscript(String),
    Audio { mime_type: String, data: String },
    OutputTranscript { text: String, finished: bool },
    TurnComplete,
    ToolCalls(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    GoAway(Option<String>),
}

impl ServerMessage {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Interruption is reported before any content of the same message so
    /// queued speech is discarded before new audio is scheduled. The user's
    /// transcript precedes the assistant's so barge-in closes the assistant
    /// message in the right order.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }

            if let Some(input) = content.input_transcription {
                if !input.text.is_empty() {
                    events.push(ServerEvent::InputTranscript(input.text));
                }
            }

            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(inline) = part.inline_data {
                        events.push(ServerEvent::Audio {
                            mime_type: inline.mime_type,
                            data: inline.data,
                        });
                    }
                }
            }

            if let Some(output) = content.output_transcription {
                if !output.text.is_empty() || output.finished {
                    events.push(ServerEvent::OutputTranscript {
                        text: output.text,
                        finished: output.finished,
                    });
                }
            }

            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(tool_call) = self.tool_call {
            if !tool_call.function_calls.is_empty() {
                events.push(ServerEvent::ToolCalls(tool_call.function_calls));
            }
        }

        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway(go_away.time_left));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_wire_shape() {
        let setup = Setup::new("models/test", "Kore", "Be kind.", json!([{ "name": "getMyPets" }]));
        let wire = serde_json::to_value(ClientMessage::Setup(setup)).unwrap();

        assert_eq!(wire["setup"]["model"], "models/test");
        assert_eq!(
            wire["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            wire["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(wire["setup"]["systemInstruction"]["parts"][0]["text"], "Be kind.");
        assert!(wire["setup"]["systemInstruction"].get("role").is_none());
        assert_eq!(
            wire["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "getMyPets"
        );
        assert_eq!(wire["setup"]["inputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_outbound_messages() {
        let audio = ClientMessage::audio(AudioChunk {
            mime_type: "audio/pcm;rate=16000".into(),
            data: "AAA=".into(),
        });
        assert_eq!(
            serde_json::to_value(audio).unwrap(),
            json!({ "realtimeInput": { "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAA=" }] } })
        );

        assert_eq!(
            serde_json::to_value(ClientMessage::user_text("Her name is Luna")).unwrap(),
            json!({ "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": "Her name is Luna" }] }],
                "turnComplete": true
            } })
        );

        assert_eq!(
            serde_json::to_value(ClientMessage::tool_response("c1", "getDoctors", json!({ "doctors": [] })))
                .unwrap(),
            json!({ "toolResponse": { "functionResponses": [
                { "id": "c1", "name": "getDoctors", "response": { "doctors": [] } }
            ] } })
        );
    }

    #[test]
    fn test_server_content_flattens_in_order() {
        let raw = json!({
            "serverContent": {
                "interrupted": true,
                "inputTranscription": { "text": "wait" },
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } },
                    { "text": "thinking" }
                ] },
                "outputTranscription": { "text": "Sure" },
                "turnComplete": true
            }
        });
        let message: ServerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message.into_events(),
            vec![
                ServerEvent::Interrupted,
                ServerEvent::InputTranscript("wait".into()),
                ServerEvent::Audio {
                    mime_type: "audio/pcm;rate=24000".into(),
                    data: "AAA=".into()
                },
                ServerEvent::OutputTranscript {
                    text: "Sure".into(),
                    finished: false
                },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_tool_call_and_control_messages() {
        let message = ServerMessage::from_slice(
            br#"{"toolCall":{"functionCalls":[
                {"id":"a","name":"checkAuthStatus"},
                {"id":"b","name":"getDoctors","args":{"query":"any"}}
            ]}}"#,
        )
        .unwrap();
        match message.into_events().as_slice() {
            [ServerEvent::ToolCalls(calls)] => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].args, Value::Null);
                assert_eq!(calls[1].args["query"], "any");
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let setup = ServerMessage::from_slice(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(setup.into_events(), vec![ServerEvent::SetupComplete]);

        let go_away = ServerMessage::from_slice(br#"{"goAway":{"timeLeft":"5s"}}"#).unwrap();
        assert_eq!(go_away.into_events(), vec![ServerEvent::GoAway(Some("5s".into()))]);

        let cancel = ServerMessage::from_slice(br#"{"toolCallCancellation":{"ids":["a"]}}"#).unwrap();
        assert_eq!(
            cancel.into_events(),
            vec![ServerEvent::ToolCallCancellation(vec!["a".into()])]
        );
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let message =
            ServerMessage::from_slice(br#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(message.into_events().is_empty());
    }
}
