//! The persistent sandbox helper. Spawned by re-executing the current
//! binary with a hidden `--sandbox-helper <socket>` argument (the
//! "arg0 trick") so no second binary needs to be shipped. The
//! accept loop below is synchronous and never returns; `main` checks
//! [`requested_socket_path`] before building a tokio runtime.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::kernel;
use super::protocol::{Op, Request, Response, Status};
use super::rules::SandboxRules;

const MAX_READ_BYTES: usize = 1024 * 1024;
const MAX_OUTPUT_BYTES: usize = 10 * 1024;
const KILL_GRACE: Duration = Duration::from_millis(500);

const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ", "TERM", "TMPDIR",
];

const HELPER_FLAG: &str = "--sandbox-helper";
const WORKSPACE_FLAG: &str = "--workspace";
const BLOCK_NETWORK_FLAG: &str = "--block-network";

/// Returns the socket path if this invocation is the re-exec'd helper.
/// Checked before the async runtime is built; must be cheap and
/// side-effect free.
pub fn requested_socket_path() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == HELPER_FLAG)
        .and_then(|i| args.get(i + 1).cloned())
}

fn requested_workspace() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == WORKSPACE_FLAG)
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn requested_block_network() -> bool {
    std::env::args().any(|a| a == BLOCK_NETWORK_FLAG)
}

/// Builds the argv used to re-exec this binary as the helper.
pub fn helper_args(socket_path: &Path, workspace: &Path, block_network: bool) -> Vec<String> {
    let mut args = vec![
        HELPER_FLAG.to_string(),
        socket_path.display().to_string(),
        WORKSPACE_FLAG.to_string(),
        workspace.display().to_string(),
    ];
    if block_network {
        args.push(BLOCK_NETWORK_FLAG.to_string());
    }
    args
}

/// Entry point run by `main` when `requested_socket_path` returns
/// `Some`. Applies the kernel sandbox to *this* process, then accepts
/// connections forever. Never returns on success.
pub fn run_helper_main(socket_path: &str) -> anyhow::Result<()> {
    let workspace = requested_workspace()
        .ok_or_else(|| anyhow::anyhow!("sandbox helper invoked without --workspace"))?;
    let rules = SandboxRules::for_workspace(&workspace, requested_block_network());
    kernel::apply(&rules)?;

    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    set_socket_permissions(socket_path)?;

    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_connection(stream, &workspace) {
                    tracing::warn!(error = %e, "sandbox helper connection error");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "sandbox helper accept error");
            }
        }
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

fn handle_connection(stream: UnixStream, workspace: &Path) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            return Ok(());
        }
        let request: Request = match serde_json::from_str(line.trim_end()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed sandbox request");
                continue;
            }
        };
        let response = dispatch(&request, workspace);
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes())?;
    }
}

fn dispatch(request: &Request, workspace: &Path) -> Response {
    let result = match request.op {
        Op::ReadFile => read_file(request, workspace),
        Op::WriteFile => write_file(request, workspace),
        Op::ListDir => list_dir(request, workspace),
        Op::Exec => exec(request, workspace),
    };
    match result {
        Ok((data, exit_code)) => Response {
            id: request.id,
            status: Status::Ok,
            data: Some(data),
            error: None,
            exit_code,
        },
        Err(message) => Response {
            id: request.id,
            status: Status::Error,
            data: None,
            error: Some(message),
            exit_code: None,
        },
    }
}

fn is_env_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == ".env")
        .unwrap_or(false)
}

fn resolve_in_workspace(workspace: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };
    Ok(absolute)
}

fn read_file(request: &Request, workspace: &Path) -> Result<(String, Option<i32>), String> {
    let raw_path = request.path.as_deref().ok_or("missing path")?;
    let path = resolve_in_workspace(workspace, raw_path)?;
    if is_env_file(&path) {
        return Err("access to .env files is always denied".to_string());
    }
    let metadata = std::fs::metadata(&path).map_err(|e| e.to_string())?;
    if metadata.len() as usize > MAX_READ_BYTES {
        return Err(format!(
            "file exceeds max size of {MAX_READ_BYTES} bytes"
        ));
    }
    let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
    Ok((content, None))
}

fn write_file(request: &Request, workspace: &Path) -> Result<(String, Option<i32>), String> {
    let raw_path = request.path.as_deref().ok_or("missing path")?;
    let path = resolve_in_workspace(workspace, raw_path)?;
    if is_env_file(&path) {
        return Err("access to .env files is always denied".to_string());
    }
    let encoded = request.content.as_deref().ok_or("missing content")?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|e| format!("invalid base64 content: {e}"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&path, bytes).map_err(|e| e.to_string())?;
    Ok((String::new(), None))
}

fn list_dir(request: &Request, workspace: &Path) -> Result<(String, Option<i32>), String> {
    let raw_path = request.path.as_deref().ok_or("missing path")?;
    let path = resolve_in_workspace(workspace, raw_path)?;
    let mut entries: Vec<String> = std::fs::read_dir(&path)
        .map_err(|e| e.to_string())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    Ok((entries.join("\n"), None))
}

fn exec(request: &Request, workspace: &Path) -> Result<(String, Option<i32>), String> {
    let command = request.command.as_deref().ok_or("missing command")?;
    let timeout = Duration::from_secs(request.timeout_secs.unwrap_or(60));

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(workspace);
    cmd.env_clear();
    for key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    let start = Instant::now();

    loop {
        match child.try_wait().map_err(|e| e.to_string())? {
            Some(status) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_string(&mut stdout);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr);
                }
                let stdout = truncate(&stdout);
                let stderr = truncate(&stderr);
                let mut data = stdout;
                if !stderr.is_empty() {
                    data.push_str("\nSTDERR:\n");
                    data.push_str(&stderr);
                }
                return Ok((data, status.code()));
            }
            None => {
                if start.elapsed() >= timeout {
                    terminate_with_grace(&mut child);
                    return Err(format!("command timed out after {timeout:?}"));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn terminate_with_grace(child: &mut std::process::Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    let _ = child.kill();
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_BYTES {
        return s.to_string();
    }
    let mut truncated = s.as_bytes()[..MAX_OUTPUT_BYTES].to_vec();
    while std::str::from_utf8(&truncated).is_err() {
        truncated.pop();
    }
    let mut out = String::from_utf8(truncated).unwrap_or_default();
    out.push_str(&format!("\n... (output truncated at {MAX_OUTPUT_BYTES} bytes)"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_basename_is_always_denied() {
        assert!(is_env_file(Path::new("/workspace/.env")));
        assert!(is_env_file(Path::new("/workspace/nested/.env")));
        assert!(!is_env_file(Path::new("/workspace/env.txt")));
    }

    #[test]
    fn truncate_appends_marker_when_over_cap() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let truncated = truncate(&big);
        assert!(truncated.contains("output truncated"));
        assert!(truncated.len() < big.len());
    }

    #[test]
    fn helper_args_include_socket_and_workspace() {
        let args = helper_args(Path::new("/tmp/s.sock"), Path::new("/tmp/ws"), true);
        assert_eq!(args[0], HELPER_FLAG);
        assert_eq!(args[1], "/tmp/s.sock");
        assert!(args.contains(&BLOCK_NETWORK_FLAG.to_string()));
    }
}
