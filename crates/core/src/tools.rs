//! Tool Invocations
//!
//! The remote agent can ask the client to perform out-of-band actions. This
//! module defines the invocation/result model, the declared capability schema
//! sent during the setup handshake, and the responder that turns every
//! invocation of a recognized capability into exactly one result.
//!
//! Actually delivering the transcript e-mail is delegated to a
//! [`TranscriptMailer`]; the default implementation only logs the request.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SEND_TRANSCRIPTION_EMAIL: &str = "sendTranscriptionEmail";
pub const DEFAULT_RECRUITER_EMAIL: &str = "alex@octalent.net";

/// An inbound request from the remote agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The answer to a [`ToolInvocation`], keyed by the same id.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: Value,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }
}

/// A capability declared to the remote agent at session setup.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the arguments object.
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unrecognized tool capability: {0}")]
    Unrecognized(String),
    #[error("invalid arguments for {name}: {source}")]
    InvalidArguments {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Capabilities this client knows how to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    SendTranscriptionEmail,
}

impl ToolCapability {
    pub fn from_name(name: &str) -> Result<Self, ToolError> {
        match name {
            SEND_TRANSCRIPTION_EMAIL => Ok(ToolCapability::SendTranscriptionEmail),
            other => Err(ToolError::Unrecognized(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCapability::SendTranscriptionEmail => SEND_TRANSCRIPTION_EMAIL,
        }
    }

    pub fn declaration(&self, recipient: &str) -> ToolDeclaration {
        match self {
            ToolCapability::SendTranscriptionEmail => ToolDeclaration {
                name: self.name().to_string(),
                description: format!(
                    "Sends the full conversation transcript and analysis to the recruiter email ({recipient}). Call this at the end of the interview or session."
                ),
                parameters: arguments_schema::<TranscriptEmailArgs>(),
            },
        }
    }
}

/// Arguments of the `sendTranscriptionEmail` capability.
#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEmailArgs {
    #[schemars(description = "Name of the candidate")]
    pub candidate_name: String,
    #[schemars(description = "Summary of the conversation")]
    pub summary: String,
    #[schemars(description = "FIT or NO-FIT recommendation")]
    pub recommendation: String,
    #[schemars(description = "Must be the recruiter address named in the tool description")]
    pub recipient_email: String,
}

/// Builds a bare arguments schema, without the meta-schema and title keys.
fn arguments_schema<T: JsonSchema>() -> Value {
    let mut value = schemars::schema_for!(T).to_value();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// External collaborator that delivers transcripts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptMailer: Send + Sync {
    /// Delivers the transcript and returns a confirmation for the remote agent.
    async fn send_transcript(&self, args: &TranscriptEmailArgs) -> Result<String, ToolError>;
}

/// Mailer that records the request in the log instead of sending anything.
pub struct LoggingMailer {
    recipient: String,
}

impl LoggingMailer {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl TranscriptMailer for LoggingMailer {
    async fn send_transcript(&self, args: &TranscriptEmailArgs) -> Result<String, ToolError> {
        info!(
            candidate = %args.candidate_name,
            recommendation = %args.recommendation,
            recipient = %args.recipient_email,
            summary_len = args.summary.len(),
            "Mocking transcript email send"
        );
        Ok(format!("Email sent successfully to {}", self.recipient))
    }
}

/// Answers tool invocations from the remote agent.
#[derive(Clone)]
pub struct ToolResponder {
    mailer: Arc<dyn TranscriptMailer>,
    recipient: String,
}

impl ToolResponder {
    pub fn new(mailer: Arc<dyn TranscriptMailer>, recipient: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: recipient.into(),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Capability schema sent with the setup handshake.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        vec![ToolCapability::SendTranscriptionEmail.declaration(&self.recipient)]
    }

    /// Produces the single result for `invocation`, or `None` for an unknown capability.
    ///
    /// Failures of a recognized capability are reported to the remote agent as an
    /// `{"error": ...}` result so that the invocation is still answered exactly once.
    pub async fn respond(&self, invocation: &ToolInvocation) -> Option<ToolResult> {
        let capability = match ToolCapability::from_name(&invocation.name) {
            Ok(capability) => capability,
            Err(e) => {
                debug!(id = %invocation.id, error = %e, "Ignoring tool invocation");
                return None;
            }
        };

        let outcome = match capability {
            ToolCapability::SendTranscriptionEmail => self.send_transcript(invocation).await,
        };

        let result = match outcome {
            Ok(text) => json!({ "result": text }),
            Err(e) => {
                warn!(id = %invocation.id, error = %e, "Tool invocation failed");
                json!({ "error": e.to_string() })
            }
        };

        Some(ToolResult {
            id: invocation.id.clone(),
            name: capability.name().to_string(),
            result,
        })
    }

    async fn send_transcript(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let args: TranscriptEmailArgs =
            serde_json::from_value(Value::Object(invocation.args.clone())).map_err(|source| {
                ToolError::InvalidArguments {
                    name: invocation.name.clone(),
                    source,
                }
            })?;
        if args.recipient_email != self.recipient {
            warn!(
                requested = %args.recipient_email,
                expected = %self.recipient,
                "Transcript requested for an unexpected recipient"
            );
        }
        self.mailer.send_transcript(&args).await
    }
}
