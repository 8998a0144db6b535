//! Agent Profiles
//!
//! This module defines the static registry of voice agents a candidate can talk
//! to. A profile carries the agent's identity, the behavioral instruction sent
//! to the remote model during the setup handshake, and the prebuilt voice the
//! model should speak with. Profiles are created once at startup and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, str::FromStr};
use tracing::info;

/// Identity of a voice agent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    Interviewer,
    Advisor,
}

impl AgentKind {
    /// Stable identifier used on the wire and in logs.
    pub fn id(&self) -> &'static str {
        match self {
            AgentKind::Interviewer => "INTERVIEWER",
            AgentKind::Advisor => "ADVISOR",
        }
    }

    /// The prebuilt voice the remote model speaks with for this agent.
    pub fn voice(&self) -> Voice {
        match self {
            AgentKind::Interviewer => Voice::Fenrir,
            _ => Voice::Kore,
        }
    }

    /// File stem looked up in the prompts directory for instruction overrides.
    fn prompt_stem(&self) -> &'static str {
        match self {
            AgentKind::Interviewer => "interviewer",
            AgentKind::Advisor => "advisor",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown agent '{0}', expected 'interviewer' or 'advisor'")]
pub struct ParseAgentKindError(String);

impl FromStr for AgentKind {
    type Err = ParseAgentKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interviewer" => Ok(AgentKind::Interviewer),
            "advisor" => Ok(AgentKind::Advisor),
            other => Err(ParseAgentKindError(other.to_string())),
        }
    }
}

/// Prebuilt voices offered by the remote speech model.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voice {
    Fenrir,
    Kore,
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Fenrir => "Fenrir",
            Voice::Kore => "Kore",
        }
    }
}

/// Immutable configuration of one voice agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub name: String,
    pub role: String,
    pub description: String,
    pub system_instruction: String,
}

impl AgentProfile {
    pub fn voice(&self) -> Voice {
        self.kind.voice()
    }
}

const INTERVIEWER_INSTRUCTION: &str = r#"You are "The Interview Agent" for Open Concept Talent Network (OCTN).
Your goal is to screen candidates for Architecture, Engineering, and Construction (AEC) roles.
1. Start by introducing yourself warmly and asking for the candidate's name.
2. Ask 3 distinct questions related to their experience in the AEC industry (e.g., "What specific CAD software have you used?", "Tell me about a project challenge you overcame.").
3. Listen carefully.
4. After the questions, determine if they are a "FIT" (good experience, articulate) or "NO-FIT".
5. Explain your recommendation to them politely.
6. If FIT: Tell them a human manager will contact them.
7. If NO-FIT: Suggest they speak to the Career Advisor Agent for help.
8. CRITICAL: Before saying goodbye, you MUST call the 'sendTranscriptionEmail' tool to log this interview.
Keep responses concise and professional."#;

const ADVISOR_INSTRUCTION: &str = r#"You are "The Career Advisor Agent" for Open Concept Talent Network.
Your goal is to support candidates who might not fit current roles or general job seekers.
1. Introduce yourself as a supportive coach.
2. Ask what they are struggling with (Resume? Skills? Interview confidence?).
3. Provide 2-3 actionable, concrete tips specifically for the Architecture/Engineering/Construction market.
4. Be empathetic but practical.
5. End by encouraging them to keep applying.
6. CRITICAL: Call the 'sendTranscriptionEmail' tool at the end to record the session for our records."#;

/// The set of agents available to a candidate.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    profiles: Vec<AgentProfile>,
}

impl AgentRegistry {
    /// Creates the registry with the built-in interviewer and advisor agents.
    pub fn builtin() -> Self {
        Self {
            profiles: vec![
                AgentProfile {
                    kind: AgentKind::Interviewer,
                    name: "The Interview Agent".to_string(),
                    role: "Recruiter Bot".to_string(),
                    description: "Conducts initial high-volume interviews for AEC roles. Assesses candidate fit immediately.".to_string(),
                    system_instruction: INTERVIEWER_INSTRUCTION.to_string(),
                },
                AgentProfile {
                    kind: AgentKind::Advisor,
                    name: "Career Advisor Agent".to_string(),
                    role: "Career Coach".to_string(),
                    description: "Provides personalized advice on resume building, skill gaps, and career transitions in AEC.".to_string(),
                    system_instruction: ADVISOR_INSTRUCTION.to_string(),
                },
            ],
        }
    }

    /// Replaces built-in instructions with `<prompts_path>/<agent>.md` where such a file exists.
    pub fn with_overrides(mut self, prompts_path: &Path) -> anyhow::Result<Self> {
        for profile in &mut self.profiles {
            let path = prompts_path.join(format!("{}.md", profile.kind.prompt_stem()));
            if path.is_file() {
                let content = fs::read_to_string(&path)?;
                info!(agent = %profile.kind, path = %path.display(), "Loaded instruction override");
                profile.system_instruction = content.trim().to_string();
            }
        }
        Ok(self)
    }

    pub fn get(&self, kind: AgentKind) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.profiles.iter()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
