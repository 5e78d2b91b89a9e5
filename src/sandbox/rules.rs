use std::path::{Path, PathBuf};

/// Read-only and read-write path sets applied by the in-helper kernel
/// sandbox. Independent of which backend (Landlock/Seatbelt/none)
/// actually enforces them.
#[derive(Debug, Clone)]
pub struct SandboxRules {
    pub read_only_paths: Vec<PathBuf>,
    pub read_write_paths: Vec<PathBuf>,
    pub block_network: bool,
}

impl SandboxRules {
    /// Default policy for the exec/filesystem tool surface: system
    /// binaries and libraries are visible read-only, the workspace
    /// (plus scratch space) is read-write, everything else invisible.
    pub fn for_workspace(workspace: &Path, block_network: bool) -> Self {
        let read_only_paths = ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"]
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();

        let read_write_paths = [
            workspace.to_path_buf(),
            PathBuf::from("/tmp"),
            PathBuf::from("/var/tmp"),
        ]
        .into_iter()
        .filter(|p| p.exists() || p == workspace)
        .collect();

        Self {
            read_only_paths,
            read_write_paths,
            block_network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_always_read_write_even_if_not_yet_created() {
        let workspace = PathBuf::from("/tmp/definitely-not-created-yet-12345");
        let rules = SandboxRules::for_workspace(&workspace, true);
        assert!(rules.read_write_paths.contains(&workspace));
    }
}
