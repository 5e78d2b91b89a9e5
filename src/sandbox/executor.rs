use std::path::{Path, PathBuf};
use std::process::Stdio as StdStdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::errors::{ConductorError, Result};

use super::helper;
use super::protocol::{Request, Response, SandboxOperation, Status};
use super::rules::SandboxRules;

const MAX_RECOVERIES: usize = 2;
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SandboxResult {
    pub data: String,
    pub exit_code: Option<i32>,
}

enum Backend {
    Persistent(PersistentConn),
    OneShot { workspace: PathBuf, block_network: bool },
    Direct { workspace: PathBuf },
}

struct Connected {
    stream: BufReader<UnixStream>,
    child: Child,
}

struct PersistentConn {
    socket_path: PathBuf,
    workspace: PathBuf,
    block_network: bool,
    next_id: AtomicU64,
    conn: Mutex<Option<Connected>>,
}

/// Routes every filesystem and shell operation invoked by any tool
/// through one configured backend. No tool may bypass this and call
/// host file APIs directly.
pub struct SandboxExecutor {
    backend: Backend,
}

impl SandboxExecutor {
    pub fn direct(workspace: PathBuf) -> Self {
        Self {
            backend: Backend::Direct { workspace },
        }
    }

    pub fn one_shot(workspace: PathBuf, block_network: bool) -> Self {
        Self {
            backend: Backend::OneShot {
                workspace,
                block_network,
            },
        }
    }

    /// Spawns the helper (re-execing the current binary) and connects.
    /// Fails construction (`ConfigurationError`) if the current
    /// executable path cannot be determined.
    pub async fn persistent(workspace: PathBuf, block_network: bool) -> Result<Self> {
        let socket_path = std::env::temp_dir().join(format!(
            "conductor-sandbox-{}.sock",
            std::process::id()
        ));
        let conn = PersistentConn {
            socket_path,
            workspace,
            block_network,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        };
        let mut executor = Self {
            backend: Backend::Persistent(conn),
        };
        executor.ensure_connected().await?;
        Ok(executor)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        let Backend::Persistent(state) = &self.backend else {
            return Ok(());
        };
        let mut guard = state.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(spawn_and_connect(state).await?);
        Ok(())
    }

    pub async fn execute(&mut self, op: SandboxOperation) -> Result<SandboxResult> {
        match &self.backend {
            Backend::Direct { workspace } => execute_direct(op, workspace).await,
            Backend::OneShot {
                workspace,
                block_network,
            } => execute_one_shot(op, workspace, *block_network).await,
            Backend::Persistent(_) => self.execute_persistent(op).await,
        }
    }

    async fn execute_persistent(&mut self, op: SandboxOperation) -> Result<SandboxResult> {
        for attempt in 0..=MAX_RECOVERIES {
            self.ensure_connected().await?;
            match self.try_persistent_once(&op).await {
                Ok(result) => return Ok(result),
                Err(ConductorError::Transient(msg)) if attempt < MAX_RECOVERIES => {
                    tracing::warn!(attempt, error = %msg, "sandbox socket error, recovering");
                    self.recover().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ConductorError::FatalToTurn(
            "sandbox helper unrecoverable after retries".to_string(),
        ))
    }

    async fn try_persistent_once(&mut self, op: &SandboxOperation) -> Result<SandboxResult> {
        let Backend::Persistent(state) = &self.backend else {
            unreachable!()
        };
        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
        let request = op.clone().into_request(id);
        let mut guard = state.conn.lock().await;
        let connected = guard
            .as_mut()
            .ok_or_else(|| ConductorError::Transient("sandbox not connected".into()))?;

        let mut line = serde_json::to_string(&request).map_err(|e| ConductorError::Other(e.into()))?;
        line.push('\n');
        connected
            .stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConductorError::Transient(e.to_string()))?;

        let mut response_line = String::new();
        connected
            .stream
            .read_line(&mut response_line)
            .await
            .map_err(|e| ConductorError::Transient(e.to_string()))?;
        if response_line.is_empty() {
            return Err(ConductorError::Transient("sandbox socket closed".into()));
        }
        let response: Response = serde_json::from_str(response_line.trim_end())
            .map_err(|e| ConductorError::Transient(format!("malformed sandbox response: {e}")))?;
        if response.id != id {
            return Err(ConductorError::Transient(format!(
                "sandbox response id mismatch: expected {id}, got {}",
                response.id
            )));
        }
        match response.status {
            Status::Ok => Ok(SandboxResult {
                data: response.data.unwrap_or_default(),
                exit_code: response.exit_code,
            }),
            Status::Error => Err(ConductorError::FatalToTurn(
                response.error.unwrap_or_else(|| "sandbox error".into()),
            )),
        }
    }

    async fn recover(&mut self) -> Result<()> {
        let Backend::Persistent(state) = &self.backend else {
            return Ok(());
        };
        let mut guard = state.conn.lock().await;
        if let Some(mut connected) = guard.take() {
            let _ = connected.child.start_kill();
        }
        let _ = tokio::fs::remove_file(&state.socket_path).await;
        *guard = Some(spawn_and_connect(state).await?);
        Ok(())
    }
}

async fn spawn_and_connect(state: &PersistentConn) -> Result<Connected> {
    let exe = std::env::current_exe()
        .map_err(|e| ConductorError::configuration(format!("current_exe unavailable: {e}")))?;
    let args = helper::helper_args(&state.socket_path, &state.workspace, state.block_network);
    let child = Command::new(exe)
        .args(&args)
        .stdin(StdStdio::null())
        .stdout(StdStdio::null())
        .stderr(StdStdio::inherit())
        .spawn()
        .map_err(|e| ConductorError::Transient(format!("spawning sandbox helper: {e}")))?;

    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        if let Ok(stream) = UnixStream::connect(&state.socket_path).await {
            return Ok(Connected {
                stream: BufReader::new(stream),
                child,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ConductorError::Transient(
                "timed out waiting for sandbox helper socket".to_string(),
            ));
        }
        tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
    }
}

async fn execute_direct(op: SandboxOperation, workspace: &Path) -> Result<SandboxResult> {
    let workspace = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || direct_op(op, &workspace))
        .await
        .map_err(|e| ConductorError::Other(e.into()))?
}

fn read_file_at(path: &Path) -> Result<SandboxResult> {
    if is_env_path(path) {
        return Err(ConductorError::access_denied(".env access is always denied"));
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| ConductorError::Transient(e.to_string()))?;
    Ok(SandboxResult {
        data: content,
        exit_code: None,
    })
}

fn write_file_at(path: &Path, content: Vec<u8>) -> Result<SandboxResult> {
    if is_env_path(path) {
        return Err(ConductorError::access_denied(".env access is always denied"));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConductorError::Other(e.into()))?;
    }
    std::fs::write(path, content).map_err(|e| ConductorError::Other(e.into()))?;
    Ok(SandboxResult {
        data: String::new(),
        exit_code: None,
    })
}

fn list_dir_at(path: &Path) -> Result<SandboxResult> {
    let mut entries: Vec<String> = std::fs::read_dir(path)
        .map_err(|e| ConductorError::Other(e.into()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    Ok(SandboxResult {
        data: entries.join("\n"),
        exit_code: None,
    })
}

fn direct_op(op: SandboxOperation, workspace: &Path) -> Result<SandboxResult> {
    match op {
        SandboxOperation::ReadFile { path } => read_file_at(&resolve(workspace, &path)),
        SandboxOperation::WriteFile { path, content } => {
            write_file_at(&resolve(workspace, &path), content)
        }
        SandboxOperation::ListDir { path } => list_dir_at(&resolve(workspace, &path)),
        SandboxOperation::Exec {
            command,
            timeout_secs,
        } => {
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(&command).current_dir(workspace);
            let output = run_with_timeout(cmd, Duration::from_secs(timeout_secs))?;
            Ok(output)
        }
    }
}

async fn execute_one_shot(
    op: SandboxOperation,
    workspace: &Path,
    block_network: bool,
) -> Result<SandboxResult> {
    let workspace = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || match op {
        SandboxOperation::Exec {
            command,
            timeout_secs,
        } => {
            let rules = SandboxRules::for_workspace(&workspace, block_network);
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(&command).current_dir(&workspace);
            super::kernel::apply_to_command(&mut cmd, rules);
            run_with_timeout(cmd, Duration::from_secs(timeout_secs))
        }
        // File ops never reach a kernel-confined process in one-shot
        // mode (only `Exec` is wrapped per-invocation), so containment
        // is enforced here by canonicalizing against the workspace
        // root instead — a path (or symlink target) that resolves
        // outside it is rejected rather than touched.
        SandboxOperation::ReadFile { path } => read_file_at(&resolve_contained(&workspace, &path)?),
        SandboxOperation::WriteFile { path, content } => {
            write_file_at(&resolve_contained(&workspace, &path)?, content)
        }
        SandboxOperation::ListDir { path } => list_dir_at(&resolve_contained(&workspace, &path)?),
    })
    .await
    .map_err(|e| ConductorError::Other(e.into()))?
}

/// Resolves `raw` against `workspace` and verifies the canonicalized
/// result is a descendant of the canonicalized workspace root,
/// walking up to the nearest existing ancestor so a not-yet-created
/// write target still gets checked. Rejects anything that escapes
/// (`..` traversal, an absolute path elsewhere, or a symlink whose
/// target resolves outside the workspace) with `AccessDenied`.
fn resolve_contained(workspace: &Path, raw: &str) -> Result<PathBuf> {
    let resolved = resolve(workspace, raw);
    let workspace_canon = workspace
        .canonicalize()
        .map_err(|e| ConductorError::Other(e.into()))?;

    let mut ancestor = resolved.clone();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    let ancestor_canon = loop {
        match ancestor.canonicalize() {
            Ok(canon) => break canon,
            Err(_) => {
                let Some(name) = ancestor.file_name() else {
                    return Err(ConductorError::access_denied(
                        "path escapes the sandbox workspace",
                    ));
                };
                suffix.push(name.to_os_string());
                if !ancestor.pop() {
                    return Err(ConductorError::access_denied(
                        "path escapes the sandbox workspace",
                    ));
                }
            }
        }
    };

    let mut contained = ancestor_canon;
    for part in suffix.iter().rev() {
        contained.push(part);
    }
    if !contained.starts_with(&workspace_canon) {
        return Err(ConductorError::access_denied(
            "path escapes the sandbox workspace",
        ));
    }
    Ok(contained)
}

fn run_with_timeout(mut cmd: std::process::Command, timeout: Duration) -> Result<SandboxResult> {
    use std::io::Read;
    cmd.stdin(StdStdio::null())
        .stdout(StdStdio::piped())
        .stderr(StdStdio::piped());
    let mut child = cmd.spawn().map_err(|e| ConductorError::Other(e.into()))?;
    let start = std::time::Instant::now();
    loop {
        match child.try_wait().map_err(|e| ConductorError::Other(e.into()))? {
            Some(status) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_string(&mut stdout);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr);
                }
                let mut data = stdout;
                if !stderr.is_empty() {
                    data.push_str("\nSTDERR:\n");
                    data.push_str(&stderr);
                }
                if let Some(code) = status.code() {
                    if code != 0 {
                        data.push_str(&format!("\nExit code: {code}"));
                    }
                }
                return Ok(SandboxResult {
                    data,
                    exit_code: status.code(),
                });
            }
            None => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    return Err(ConductorError::FatalToTurn(format!(
                        "command timed out after {timeout:?}"
                    )));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    }
}

fn is_env_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == ".env")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_backend_denies_env_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::direct(dir.path().to_path_buf());
        let result = executor
            .execute(SandboxOperation::ReadFile {
                path: ".env".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ConductorError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn direct_backend_round_trips_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::direct(dir.path().to_path_buf());
        executor
            .execute(SandboxOperation::WriteFile {
                path: "notes.md".to_string(),
                content: b"TODO: buy milk".to_vec(),
            })
            .await
            .unwrap();
        let result = executor
            .execute(SandboxOperation::ReadFile {
                path: "notes.md".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result.data, "TODO: buy milk");
    }

    #[tokio::test]
    async fn direct_backend_lists_entries_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let mut executor = SandboxExecutor::direct(dir.path().to_path_buf());
        let result = executor
            .execute(SandboxOperation::ListDir {
                path: ".".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result.data, "a.txt\nb.txt");
    }

    #[tokio::test]
    async fn direct_backend_exec_runs_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::direct(dir.path().to_path_buf());
        let result = executor
            .execute(SandboxOperation::Exec {
                command: "echo hello".to_string(),
                timeout_secs: 5,
            })
            .await
            .unwrap();
        assert!(result.data.contains("hello"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn one_shot_backend_denies_absolute_path_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::one_shot(dir.path().to_path_buf(), true);
        let result = executor
            .execute(SandboxOperation::ReadFile {
                path: "/etc/passwd".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ConductorError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn one_shot_backend_denies_dot_dot_escape_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::one_shot(dir.path().to_path_buf(), true);
        let result = executor
            .execute(SandboxOperation::WriteFile {
                path: "../escaped.txt".to_string(),
                content: b"leaked".to_vec(),
            })
            .await;
        assert!(matches!(result, Err(ConductorError::AccessDenied(_))));
        assert!(!dir.path().parent().unwrap().join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn one_shot_backend_denies_symlink_escape_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "top secret").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
            .unwrap();

        let mut executor = SandboxExecutor::one_shot(dir.path().to_path_buf(), true);
        let result = executor
            .execute(SandboxOperation::ReadFile {
                path: "link.txt".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ConductorError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn one_shot_backend_round_trips_write_then_read_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = SandboxExecutor::one_shot(dir.path().to_path_buf(), true);
        executor
            .execute(SandboxOperation::WriteFile {
                path: "nested/notes.md".to_string(),
                content: b"hello".to_vec(),
            })
            .await
            .unwrap();
        let result = executor
            .execute(SandboxOperation::ReadFile {
                path: "nested/notes.md".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result.data, "hello");
    }
}
