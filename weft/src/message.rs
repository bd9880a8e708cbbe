//! Message types for agent-model communication.
//!
//! Messages follow chat-completion conventions: an ordered list of role-tagged
//! entries whose content is either plain text or a list of parts. Binary parts
//! (images, files) carry raw bytes only while a run is live; the persistence
//! boundary in [`crate::state`] replaces bytes with stored-file references so
//! that a state snapshot is text-only.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResultPart};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// String representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Where the payload of a binary content part lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BinarySource {
    /// Raw bytes, valid only in live messages.
    Bytes {
        /// The payload.
        data: Bytes,
    },
    /// A reference into the blob store, produced at persist time.
    Stored {
        /// Signed download URL, re-minted on load.
        url: String,
        /// Identifier of the stored file.
        storage_file_id: String,
        /// Filename recorded at upload time.
        storage_filename: String,
    },
}

impl BinarySource {
    /// Whether this source still carries raw bytes.
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        matches!(self, Self::Bytes { .. })
    }
}

/// One part of a multi-part message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// Image content.
    Image {
        /// Media type, e.g. `image/png`.
        media_type: String,
        /// Bytes or stored reference.
        source: BinarySource,
    },
    /// Arbitrary file content.
    File {
        /// Media type of the file.
        media_type: String,
        /// Original filename, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        /// Bytes or stored reference.
        source: BinarySource,
    },
    /// A tool invocation recorded on an assistant message.
    ToolCall {
        /// The call.
        tool_call: ToolCall,
    },
    /// A tool result recorded on a tool message.
    ToolResult {
        /// The result.
        tool_result: ToolResultPart,
    },
}

/// Content of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Multi-part content.
    Parts(Vec<ContentPart>),
}

/// An ordered conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who authored the entry.
    pub role: Role,
    /// The entry's content.
    pub content: MessageContent,
}

impl Message {
    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a plain-text assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create an assistant message recording text plus the step's tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(ContentPart::Text { text });
        }
        parts.extend(
            calls
                .into_iter()
                .map(|tool_call| ContentPart::ToolCall { tool_call }),
        );
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }

    /// Create a tool message carrying one or more tool results.
    #[must_use]
    pub fn tool_results(results: Vec<ToolResultPart>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(
                results
                    .into_iter()
                    .map(|tool_result| ContentPart::ToolResult { tool_result })
                    .collect(),
            ),
        }
    }

    /// Concatenated text content of the message, if any.
    #[must_use]
    pub fn text_content(&self) -> Option<String> {
        match &self.content {
            MessageContent::Text(text) => Some(text.clone()),
            MessageContent::Parts(parts) => {
                let text: String = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                (!text.is_empty()).then_some(text)
            }
        }
    }

    /// Tool calls recorded on this message.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall { tool_call } => Some(tool_call),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Whether any part of this message still carries raw bytes.
    #[must_use]
    pub fn has_raw_bytes(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts.iter().any(|p| match p {
                ContentPart::Image { source, .. } | ContentPart::File { source, .. } => {
                    source.is_raw()
                }
                _ => false,
            }),
        }
    }
}
