//! Host-path validation for VM-backed container engines
//!
//! Some engine installations run the daemon inside a virtual machine. Only
//! host directories that have been shared into that VM can be bind-mounted,
//! so every host path is checked against the VM's mount table before it is
//! bound in.

use crate::error::{Result, StevedoreError};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Environment variable naming the engine's virtual machine, if any.
pub const MACHINE_NAME_VAR: &str = "DOCKER_MACHINE_NAME";

/// Registry of host directories known to be reachable from a VM-backed engine.
///
/// The mount list is computed once, under lock, on first use and cached for
/// the life of the registry. An empty list means "no VM indirection in play"
/// and validation is skipped entirely, not treated as "nothing is mounted".
///
/// Registries are owned values injected into the components that need them;
/// cloning shares the underlying cache.
#[derive(Debug, Clone)]
pub struct HostMountRegistry {
    /// VM name, taken from the environment at construction.
    machine: Option<String>,
    /// Lazily computed mount roots; `None` until first use.
    mounts: Arc<Mutex<Option<Vec<String>>>>,
}

impl HostMountRegistry {
    /// Create a registry for the VM named in the environment, if any.
    pub fn from_env() -> Self {
        Self {
            machine: std::env::var(MACHINE_NAME_VAR).ok(),
            mounts: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a registry with a preset mount list (used by tests).
    pub fn with_mounts(machine: &str, mounts: Vec<String>) -> Self {
        Self {
            machine: Some(machine.to_string()),
            mounts: Arc::new(Mutex::new(Some(mounts))),
        }
    }

    /// Create a registry that performs no validation.
    pub fn unrestricted() -> Self {
        Self {
            machine: None,
            mounts: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Return the cached mount roots, querying the VM on first use.
    fn mounts(&self) -> Result<Vec<String>> {
        let mut cached = self
            .mounts
            .lock()
            .map_err(|_| StevedoreError::Lock("Failed to acquire mount registry lock".to_string()))?;

        if let Some(mounts) = cached.as_ref() {
            return Ok(mounts.clone());
        }

        let mounts = match &self.machine {
            None => Vec::new(),
            Some(name) => query_vm_mounts(name)?,
        };
        debug!(?mounts, "Cached VM mount roots");
        *cached = Some(mounts.clone());
        Ok(mounts)
    }

    /// Check that `path` is reachable from inside the engine's VM.
    ///
    /// No-op when the registry is empty (no VM indirection). On mismatch the
    /// error names the unreachable path, the VM and the known mount roots so
    /// the operator can add the missing share.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let mounts = self.mounts()?;
        if mounts.is_empty() {
            return Ok(());
        }

        let candidate = normalize_case(&path.to_string_lossy());
        let found = mounts
            .iter()
            .any(|mount| candidate.starts_with(&normalize_case(mount)));

        if found {
            Ok(())
        } else {
            Err(StevedoreError::PathNotReachable {
                path: path.to_path_buf(),
                machine: self.machine.clone().unwrap_or_else(|| "???".to_string()),
                mounts,
            })
        }
    }

    /// Probe the uid/gid the engine's VM reports for the invoking user.
    ///
    /// Returns `(None, None)` when no VM is in play or the probe yields
    /// nothing useful.
    pub fn vm_identity(&self) -> (Option<u32>, Option<u32>) {
        let Some(name) = &self.machine else {
            return (None, None);
        };
        (probe_vm_id(name, "-u"), probe_vm_id(name, "-g"))
    }
}

/// Query the VM's shared-folder mount table.
///
/// Output lines start with the mounted device name; the mount root is that
/// name prefixed with '/'.
fn query_vm_mounts(machine: &str) -> Result<Vec<String>> {
    let output = Command::new("docker-machine")
        .args(["ssh", machine, "mount", "-t", "vboxsf"])
        .output()?;
    if !output.status.success() {
        // An unreachable machine means no restriction can be established.
        return Ok(Vec::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|device| format!("/{device}"))
        .collect())
}

fn probe_vm_id(machine: &str, flag: &str) -> Option<u32> {
    let output = Command::new("docker-machine")
        .args(["ssh", machine, "id", flag])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Fold case on platforms with case-insensitive filesystems.
fn normalize_case(path: &str) -> String {
    if cfg!(windows) {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}

/// Normalize a path for the engine command line.
///
/// The engine expects forward-slash paths even when the orchestrating host
/// uses back-slash paths; drive letters become a leading path component.
pub fn engine_path(path: &str) -> String {
    if !cfg!(windows) {
        return path.to_string();
    }
    let forward = path.replace('\\', "/");
    let mut parts = forward.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(drive), Some(rest)) if drive.len() == 1 && drive.chars().all(|c| c.is_ascii_alphabetic()) => {
            format!("/{drive}{rest}")
        }
        _ => forward,
    }
}

/// Resolve the effective user/group identity for the container.
///
/// The VM-reported identity wins; on non-Windows hosts the invoking user's
/// identity fills in whatever the probe left unset.
pub fn effective_identity(registry: &HostMountRegistry) -> (Option<u32>, Option<u32>) {
    let (mut euid, mut egid) = registry.vm_identity();
    #[cfg(unix)]
    {
        // SAFETY: geteuid/getegid have no preconditions and cannot fail.
        euid = euid.or_else(|| Some(unsafe { libc::geteuid() }));
        egid = egid.or_else(|| Some(unsafe { libc::getegid() }));
    }
    (euid, egid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_empty_registry_skips_validation() {
        let registry = HostMountRegistry::unrestricted();
        assert!(registry.validate(Path::new("/anywhere/at/all")).is_ok());
    }

    #[test]
    fn test_path_under_mount_root_passes() {
        let registry =
            HostMountRegistry::with_mounts("default", vec!["/Users".to_string(), "/data".to_string()]);
        assert!(registry.validate(Path::new("/data/job/input.txt")).is_ok());
    }

    #[test]
    fn test_unreachable_path_names_machine_and_mounts() {
        let registry = HostMountRegistry::with_mounts("default", vec!["/Users".to_string()]);
        let err = registry
            .validate(Path::new("/scratch/input.txt"))
            .unwrap_err();
        match err {
            StevedoreError::PathNotReachable {
                path,
                machine,
                mounts,
            } => {
                assert_eq!(path, PathBuf::from("/scratch/input.txt"));
                assert_eq!(machine, "default");
                assert_eq!(mounts, vec!["/Users".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_engine_path_is_identity_on_unix() {
        if !cfg!(windows) {
            assert_eq!(engine_path("/out/dir"), "/out/dir");
        }
    }

    #[test]
    fn test_host_identity_fallback_on_unix() {
        let registry = HostMountRegistry::unrestricted();
        let (euid, egid) = effective_identity(&registry);
        if cfg!(unix) {
            assert!(euid.is_some());
            assert!(egid.is_some());
        }
    }
}
