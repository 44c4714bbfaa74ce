//! Record types for the Claude Code stream-json protocol.
//!
//! Workers run with `--input-format stream-json --output-format stream-json`,
//! so both directions carry one JSON object per line. Inbound records are
//! decoded leniently: anything that is an object but does not match a known
//! shape becomes [`WorkerRecord::Unrecognized`].

use serde::{Deserialize, Serialize};

/// A single entry of an assistant message's `content` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text segment.
    Text {
        /// The text.
        text: String,
    },
    /// Tool calls, thinking blocks and anything else we only pass through.
    #[serde(other)]
    Other,
}

/// Assistant message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Content blocks in order.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Text segments of this message, skipping non-text blocks.
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Other => None,
            })
            .collect()
    }
}

/// `system` record data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemRecord {
    /// Record subtype; `init` marks the session start.
    #[serde(default)]
    pub subtype: Option<String>,
    /// Session identifier, usable with `--resume`.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `result` record data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Final text of the turn.
    #[serde(default)]
    pub result: String,
    /// Wall time of the turn in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Whether the turn ended in an error.
    #[serde(default)]
    pub is_error: bool,
}

/// Raw record as it appears on the wire, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRecord {
    /// Session lifecycle record.
    System(SystemRecord),
    /// Assistant turn.
    Assistant {
        /// Message body.
        #[serde(default)]
        message: AssistantMessage,
    },
    /// Echoed user input or tool results.
    User {
        /// Message body, kept opaque.
        #[serde(default)]
        message: serde_json::Value,
    },
    /// End of a turn.
    Result(ResultRecord),
    /// Catch-all for unknown record types.
    #[serde(other)]
    Unknown,
}

/// Protocol event derived from an inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRecord {
    /// The process is initialized and has a session.
    Init {
        /// Session token for resumption.
        session_id: String,
    },
    /// The model is producing a turn.
    Assistant {
        /// Text segments in order.
        texts: Vec<String>,
    },
    /// The turn finished.
    Result(ResultRecord),
    /// Valid record with no lifecycle meaning.
    Unrecognized,
}

impl From<WireRecord> for WorkerRecord {
    fn from(record: WireRecord) -> Self {
        match record {
            WireRecord::System(SystemRecord {
                subtype: Some(subtype),
                session_id: Some(session_id),
            }) if subtype == "init" && !session_id.is_empty() => Self::Init { session_id },
            WireRecord::Assistant { message } => Self::Assistant {
                texts: message.texts(),
            },
            WireRecord::Result(result) => Self::Result(result),
            WireRecord::System(_) | WireRecord::User { .. } | WireRecord::Unknown => {
                Self::Unrecognized
            }
        }
    }
}

/// Build the outbound line for a user message, newline included.
///
/// # Errors
///
/// Returns an error if serialization fails, which only happens for
/// pathological inputs.
pub fn encode_user_message(message: &str) -> Result<String, serde_json::Error> {
    let record = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": message }],
        },
    });
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}
