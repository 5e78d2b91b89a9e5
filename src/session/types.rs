use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::MediaAttachment;

/// Media `data` is only ever attached to the `User` variant, and only
/// at append time for the most recent inbound message — persisted
/// form never carries it (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnRecord {
    User {
        content: String,
        #[serde(default)]
        media_attachments: Vec<MediaAttachment>,
        at_ms: i64,
    },
    Assistant {
        content: String,
        at_ms: i64,
    },
    ToolCallRequest {
        call_id: String,
        tool_name: String,
        arguments: Value,
        at_ms: i64,
    },
    ToolCallResult {
        call_id: String,
        status: String,
        content: String,
        at_ms: i64,
    },
}

impl TurnRecord {
    pub fn at_ms(&self) -> i64 {
        match self {
            TurnRecord::User { at_ms, .. }
            | TurnRecord::Assistant { at_ms, .. }
            | TurnRecord::ToolCallRequest { at_ms, .. }
            | TurnRecord::ToolCallResult { at_ms, .. } => *at_ms,
        }
    }

    /// Strips any attached media before a record is written to disk.
    pub fn for_persistence(self) -> Self {
        match self {
            TurnRecord::User { content, at_ms, media_attachments } => TurnRecord::User {
                content,
                at_ms,
                media_attachments: media_attachments
                    .into_iter()
                    .map(|mut a| {
                        a.data = None;
                        a
                    })
                    .collect(),
            },
            other => other,
        }
    }
}

/// Every tool-call request must be followed, before end of turn, by
/// exactly one result sharing its `callId`.
pub fn tool_calls_are_balanced(records: &[TurnRecord]) -> bool {
    use std::collections::HashSet;
    let mut open: HashSet<&str> = HashSet::new();
    for record in records {
        match record {
            TurnRecord::ToolCallRequest { call_id, .. } => {
                open.insert(call_id);
            }
            TurnRecord::ToolCallResult { call_id, .. } => {
                if !open.remove(call_id.as_str()) {
                    return false;
                }
            }
            _ => {}
        }
    }
    open.is_empty()
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub owner_key: String,
    pub records: Vec<TurnRecord>,
}

impl Session {
    pub fn new(owner_key: impl Into<String>) -> Self {
        Self {
            owner_key: owner_key.into(),
            records: Vec::new(),
        }
    }

    pub fn created_at_ms(&self) -> Option<i64> {
        self.records.first().map(TurnRecord::at_ms)
    }

    pub fn last_used_at_ms(&self) -> Option<i64> {
        self.records.last().map(TurnRecord::at_ms)
    }
}
