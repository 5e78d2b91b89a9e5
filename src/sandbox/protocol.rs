use serde::{Deserialize, Serialize};

/// One line of the sandbox helper's request/response wire protocol.
/// Every request carries a monotonically increasing id; the client
/// rejects a response whose id does not match the outstanding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    ReadFile,
    WriteFile,
    ListDir,
    Exec,
}

/// A typed view of a sandbox operation before it is flattened into a
/// [`Request`]. Kept separate from the wire struct so callers build
/// operations without juggling which optional fields apply to which op.
#[derive(Debug, Clone)]
pub enum SandboxOperation {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: Vec<u8>,
    },
    ListDir {
        path: String,
    },
    Exec {
        command: String,
        timeout_secs: u64,
    },
}

impl SandboxOperation {
    pub fn into_request(self, id: u64) -> Request {
        match self {
            SandboxOperation::ReadFile { path } => Request {
                id,
                op: Op::ReadFile,
                path: Some(path),
                content: None,
                command: None,
                stdin: None,
                timeout_secs: None,
            },
            SandboxOperation::WriteFile { path, content } => Request {
                id,
                op: Op::WriteFile,
                path: Some(path),
                content: Some(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    content,
                )),
                command: None,
                stdin: None,
                timeout_secs: None,
            },
            SandboxOperation::ListDir { path } => Request {
                id,
                op: Op::ListDir,
                path: Some(path),
                content: None,
                command: None,
                stdin: None,
                timeout_secs: None,
            },
            SandboxOperation::Exec {
                command,
                timeout_secs,
            } => Request {
                id,
                op: Op::Exec,
                path: None,
                content: None,
                command: Some(command),
                stdin: None,
                timeout_secs: Some(timeout_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_base64_encodes_content() {
        let op = SandboxOperation::WriteFile {
            path: "notes.md".into(),
            content: b"hello".to_vec(),
        };
        let req = op.into_request(1);
        assert_eq!(req.content.as_deref(), Some("aGVsbG8="));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = SandboxOperation::Exec {
            command: "ls".into(),
            timeout_secs: 60,
        }
        .into_request(43);
        let line = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 43);
        assert_eq!(back.op, Op::Exec);
    }
}
