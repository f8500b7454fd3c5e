//! Volume mounting - exposing host data inside the job sandbox
//!
//! Each entry of the path-mapping table becomes one engine `--mount` token.
//! The choice between read-only binding, read-write binding, copy-then-bind
//! and synthetic-directory creation is a pure decision function over the
//! entry's shape; filesystem side effects (copies, directory creation) go
//! through the narrow [`MountFs`] interface so the decision logic is testable
//! without touching a real filesystem.

use crate::error::{Result, StevedoreError};
use crate::machine::{engine_path, HostMountRegistry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Marker prefix for a mapping entry with no backing host path yet.
pub const SYNTHETIC_PREFIX: &str = "_:";

/// Kind of filesystem object a mapping entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    File,
    Directory,
}

/// One row of the path-mapping table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    /// Resolved host path, or a `_:`-prefixed synthetic marker.
    pub resolved: String,
    /// Target path inside the sandbox.
    pub target: String,
    /// Kind of object being mapped.
    pub kind: MountKind,
    /// Whether the job may write through this mapping.
    #[serde(default)]
    pub writable: bool,
    /// Whether this entry is staged into the sandbox at all.
    #[serde(default = "default_staged")]
    pub staged: bool,
}

fn default_staged() -> bool {
    true
}

impl MountEntry {
    /// Read-only mapping of an existing host path.
    pub fn new(resolved: &str, target: &str, kind: MountKind) -> Self {
        Self {
            resolved: resolved.to_string(),
            target: target.to_string(),
            kind,
            writable: false,
            staged: true,
        }
    }

    /// Writable mapping of an existing host path.
    pub fn writable(resolved: &str, target: &str, kind: MountKind) -> Self {
        Self {
            writable: true,
            ..Self::new(resolved, target, kind)
        }
    }

    /// Writable synthetic directory, materialized before or during mounting.
    pub fn synthetic_directory(target: &str) -> Self {
        Self {
            resolved: format!("{SYNTHETIC_PREFIX}{target}"),
            target: target.to_string(),
            kind: MountKind::Directory,
            writable: true,
            staged: true,
        }
    }

    /// True when the entry has no backing host path yet.
    pub fn is_synthetic(&self) -> bool {
        self.resolved.starts_with(SYNTHETIC_PREFIX)
    }
}

/// The closed set of outcomes of the mount decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAction {
    /// Nothing to stage (synthetic entry with no writable directory to make).
    Skip,
    /// Bind the host path read-only.
    BindReadOnly,
    /// Bind the host path read-write in place.
    BindReadWrite,
    /// Copy into the already-mounted output directory; no extra token.
    CopyIntoHint,
    /// Copy into a fresh temp directory and bind the copy read-write.
    CopyThenBind,
    /// Create the directory in place under the output directory.
    CreateInHint,
    /// Create the directory under a fresh temp directory and bind read-write.
    CreateThenBind,
}

/// Decide how one mapping entry is exposed inside the sandbox.
///
/// Pure function of the entry's shape; all filesystem effects happen later,
/// when the chosen action is applied.
pub fn plan_mount(
    kind: MountKind,
    writable: bool,
    has_source: bool,
    has_hint: bool,
    inplace_allowed: bool,
) -> MountAction {
    if !writable {
        return if has_source {
            MountAction::BindReadOnly
        } else {
            MountAction::Skip
        };
    }
    if !has_source {
        // Only directories are materialized; a synthetic writable file has
        // nothing to copy and nothing to create.
        return match kind {
            MountKind::File => MountAction::Skip,
            MountKind::Directory => {
                if has_hint {
                    MountAction::CreateInHint
                } else {
                    MountAction::CreateThenBind
                }
            }
        };
    }
    if inplace_allowed {
        MountAction::BindReadWrite
    } else if has_hint {
        MountAction::CopyIntoHint
    } else {
        MountAction::CopyThenBind
    }
}

/// Encode fields as one comma-joined token with standard CSV quoting.
///
/// Fields containing commas or quotes are wrapped in double quotes with
/// inner quotes doubled, so any path survives as a single well-formed token.
pub fn encode_fields(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| {
            if field.contains(',') || field.contains('"') || field.contains('\n') {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a comma-joined token produced by [`encode_fields`].
pub fn decode_fields(token: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = token.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                '"' => quoted = true,
                ',' => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
    }
    fields.push(field);
    fields
}

/// Serialize one binding as a `--mount=` token.
pub fn mount_token(source: &str, target: &str, writable: bool) -> String {
    let mut fields = vec![
        "type=bind".to_string(),
        format!("source={source}"),
        format!("target={target}"),
    ];
    if !writable {
        fields.push("readonly".to_string());
    }
    format!("--mount={}", encode_fields(&fields))
}

/// Remove the read-only marker from a `--mount=` token.
///
/// The restricted user-space engine variant rejects the marker; underlying
/// filesystem permissions still apply. The token is decoded and re-encoded so
/// a quoted path containing the literal text `,readonly` is left intact.
pub fn strip_readonly(token: &str) -> String {
    let Some(body) = token.strip_prefix("--mount=") else {
        return token.to_string();
    };
    let fields: Vec<String> = decode_fields(body)
        .into_iter()
        .filter(|field| field != "readonly")
        .collect();
    format!("--mount={}", encode_fields(&fields))
}

/// Create a uniquely named temporary directory from a path-style prefix.
///
/// The prefix splits into a parent directory and a name stem, the way the
/// original temp-prefix option is interpreted; a bare stem lands in the
/// system temp directory. The directory persists for ordinary temp cleanup
/// to reclaim.
pub fn mkdtemp(tmpdir_prefix: &str) -> Result<PathBuf> {
    let prefix = Path::new(tmpdir_prefix);
    let parent = prefix
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let stem = prefix
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    fs::create_dir_all(&parent)?;
    let dir = tempfile::Builder::new()
        .prefix(&stem)
        .tempdir_in(parent)?
        .into_path();
    Ok(dir)
}

/// Narrow interface for the filesystem side effects of mounting.
pub trait MountFs {
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;
    /// Mark a file or directory tree user-writable without touching the source.
    fn make_writable(&self, path: &Path) -> Result<()>;
    fn mkdtemp(&self, prefix: &str) -> Result<PathBuf>;
}

/// [`MountFs`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl MountFs for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::copy(from, to)?;
        Ok(())
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        for entry in WalkDir::new(from) {
            let entry = entry.map_err(|e| {
                StevedoreError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }))
            })?;
            let rel = entry
                .path()
                .strip_prefix(from)
                .unwrap_or_else(|_| Path::new(""));
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    }

    fn make_writable(&self, path: &Path) -> Result<()> {
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(|e| {
                StevedoreError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }))
            })?;
            let mut perms = entry.metadata().map_err(|e| {
                StevedoreError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "metadata")
                }))
            })?.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(perms.mode() | 0o200);
            }
            #[cfg(not(unix))]
            {
                perms.set_readonly(false);
            }
            fs::set_permissions(entry.path(), perms)?;
        }
        Ok(())
    }

    fn mkdtemp(&self, prefix: &str) -> Result<PathBuf> {
        mkdtemp(prefix)
    }
}

/// Applies mount decisions for path-mapping entries, emitting tokens and
/// performing side effects.
pub struct VolumeMounter<'a> {
    registry: &'a HostMountRegistry,
    fs: &'a dyn MountFs,
    inplace_update: bool,
    tmpdir_prefix: &'a str,
}

impl<'a> VolumeMounter<'a> {
    /// Create a mounter that validates host paths against `registry` and
    /// performs side effects through `fs`.
    pub fn new(
        registry: &'a HostMountRegistry,
        fs: &'a dyn MountFs,
        inplace_update: bool,
        tmpdir_prefix: &'a str,
    ) -> Self {
        Self {
            registry,
            fs,
            inplace_update,
            tmpdir_prefix,
        }
    }

    /// Append one binding token, creating a missing source directory first.
    ///
    /// The engine's bind mode fails on a missing source, unlike the legacy
    /// volume mode.
    pub fn append_volume(
        &self,
        runtime: &mut Vec<String>,
        source: &str,
        target: &str,
        writable: bool,
    ) -> Result<()> {
        runtime.push(mount_token(source, target, writable));
        if !self.fs.exists(Path::new(source)) {
            self.fs.create_dir_all(Path::new(source))?;
        }
        Ok(())
    }

    /// Stage one path-mapping entry into the runtime argument list.
    ///
    /// `host_outdir_tgt` is the host-side location of the entry's target when
    /// the target already lives under the mounted output directory.
    pub fn add_volume(
        &self,
        runtime: &mut Vec<String>,
        entry: &MountEntry,
        host_outdir_tgt: Option<&Path>,
    ) -> Result<()> {
        let action = plan_mount(
            entry.kind,
            entry.writable,
            !entry.is_synthetic(),
            host_outdir_tgt.is_some(),
            self.inplace_update,
        );
        debug!(target = %entry.target, ?action, "Staging mapping entry");

        match action {
            MountAction::Skip => Ok(()),
            MountAction::BindReadOnly => {
                self.registry
                    .validate(Path::new(&engine_path(&entry.resolved)))?;
                self.append_volume(runtime, &entry.resolved, &entry.target, false)
            }
            MountAction::BindReadWrite => {
                self.registry
                    .validate(Path::new(&engine_path(&entry.resolved)))?;
                self.append_volume(runtime, &entry.resolved, &entry.target, true)
            }
            MountAction::CopyIntoHint => {
                let hint = host_outdir_tgt.ok_or_else(|| {
                    StevedoreError::InvalidConfig(
                        "copy-into-hint action without an output directory hint".to_string(),
                    )
                })?;
                self.copy_entry(entry, hint)?;
                self.fs.make_writable(hint)
            }
            MountAction::CopyThenBind => {
                let tmpdir = self.fs.mkdtemp(self.tmpdir_prefix)?;
                let copy = tmpdir.join(basename(&entry.resolved));
                self.copy_entry(entry, &copy)?;
                self.append_volume(runtime, &copy.to_string_lossy(), &entry.target, true)?;
                self.fs.make_writable(&copy)
            }
            MountAction::CreateInHint => {
                let hint = host_outdir_tgt.ok_or_else(|| {
                    StevedoreError::InvalidConfig(
                        "create-in-hint action without an output directory hint".to_string(),
                    )
                })?;
                if !self.fs.exists(hint) {
                    self.fs.create_dir_all(hint)?;
                }
                Ok(())
            }
            MountAction::CreateThenBind => {
                let new_dir = self.fs.mkdtemp(self.tmpdir_prefix)?.join(basename(&entry.target));
                // append_volume materializes the missing source directory.
                self.append_volume(runtime, &new_dir.to_string_lossy(), &entry.target, true)
            }
        }
    }

    fn copy_entry(&self, entry: &MountEntry, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !self.fs.exists(parent) {
                self.fs.create_dir_all(parent)?;
            }
        }
        let source = Path::new(&entry.resolved);
        match entry.kind {
            MountKind::File => self.fs.copy_file(source, dest),
            MountKind::Directory => self.fs.copy_tree(source, dest),
        }
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::HostMountRegistry;

    #[test]
    fn test_plan_mount_decision_table() {
        use MountAction::*;
        use MountKind::*;

        // read-only entries bind read-only when real, vanish when synthetic
        assert_eq!(plan_mount(File, false, true, false, false), BindReadOnly);
        assert_eq!(plan_mount(Directory, false, true, true, true), BindReadOnly);
        assert_eq!(plan_mount(File, false, false, false, false), Skip);

        // writable with real source
        assert_eq!(plan_mount(File, true, true, false, true), BindReadWrite);
        assert_eq!(plan_mount(Directory, true, true, true, true), BindReadWrite);
        assert_eq!(plan_mount(File, true, true, true, false), CopyIntoHint);
        assert_eq!(plan_mount(File, true, true, false, false), CopyThenBind);
        assert_eq!(plan_mount(Directory, true, true, false, false), CopyThenBind);

        // synthetic writable directory
        assert_eq!(plan_mount(Directory, true, false, true, false), CreateInHint);
        assert_eq!(plan_mount(Directory, true, false, false, true), CreateThenBind);

        // synthetic writable file has nothing to materialize
        assert_eq!(plan_mount(File, true, false, false, false), Skip);
    }

    #[test]
    fn test_field_codec_round_trip() {
        let paths = [
            "/plain/path",
            "/path with spaces/file",
            "/path,with,commas",
            "/path\"with\"quotes",
            "/mixed, \"odd\" path",
        ];
        for path in paths {
            let fields = vec![format!("source={path}"), format!("target={path}")];
            let decoded = decode_fields(&encode_fields(&fields));
            assert_eq!(decoded, fields, "round trip failed for {path}");
        }
    }

    #[test]
    fn test_mount_token_readonly_by_default() {
        let token = mount_token("/data/in", "/sandbox/in", false);
        assert_eq!(
            token,
            "--mount=type=bind,source=/data/in,target=/sandbox/in,readonly"
        );
        let token = mount_token("/data/out", "/sandbox/out", true);
        assert_eq!(token, "--mount=type=bind,source=/data/out,target=/sandbox/out");
    }

    #[test]
    fn test_strip_readonly_preserves_quoted_paths() {
        let token = mount_token("/spool,readonly/in", "/sandbox/in", false);
        let stripped = strip_readonly(&token);
        let fields = decode_fields(stripped.strip_prefix("--mount=").unwrap());
        assert_eq!(fields[1], "source=/spool,readonly/in");
        assert!(!fields.contains(&"readonly".to_string()));
    }

    #[test]
    fn test_synthetic_marker_detection() {
        let entry = MountEntry::synthetic_directory("/sandbox/work");
        assert!(entry.is_synthetic());
        assert!(entry.writable);
        let entry = MountEntry::new("/data/in", "/sandbox/in", MountKind::File);
        assert!(!entry.is_synthetic());
    }

    #[test]
    fn test_writable_file_copy_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "original contents").unwrap();
        let before = fs::metadata(&input).unwrap().permissions();

        let registry = HostMountRegistry::unrestricted();
        let fs_impl = RealFs;
        let prefix = dir.path().join("stage").to_string_lossy().into_owned();
        let mounter = VolumeMounter::new(&registry, &fs_impl, false, &prefix);

        let entry = MountEntry::writable(&input.to_string_lossy(), "/sandbox/input.txt", MountKind::File);
        let mut runtime = Vec::new();
        mounter.add_volume(&mut runtime, &entry, None).unwrap();

        assert_eq!(runtime.len(), 1);
        let fields = decode_fields(runtime[0].strip_prefix("--mount=").unwrap());
        let source = fields[1].strip_prefix("source=").unwrap();
        assert_ne!(source, input.to_string_lossy());
        assert_eq!(fs::read_to_string(source).unwrap(), "original contents");

        assert_eq!(fs::read_to_string(&input).unwrap(), "original contents");
        assert_eq!(fs::metadata(&input).unwrap().permissions(), before);
    }

    #[test]
    fn test_synthetic_directory_distinct_per_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HostMountRegistry::unrestricted();
        let fs_impl = RealFs;
        let prefix = dir.path().join("stage").to_string_lossy().into_owned();
        let mounter = VolumeMounter::new(&registry, &fs_impl, false, &prefix);

        let entry = MountEntry::synthetic_directory("/sandbox/work");
        let mut first = Vec::new();
        let mut second = Vec::new();
        mounter.add_volume(&mut first, &entry, None).unwrap();
        mounter.add_volume(&mut second, &entry, None).unwrap();

        let source_of = |runtime: &[String]| {
            decode_fields(runtime[0].strip_prefix("--mount=").unwrap())[1]
                .strip_prefix("source=")
                .unwrap()
                .to_string()
        };
        let first_dir = source_of(&first);
        let second_dir = source_of(&second);
        assert_ne!(first_dir, second_dir);
        // Both were materialized, freshly created and empty.
        for created in [&first_dir, &second_dir] {
            let path = Path::new(created);
            assert!(path.is_dir());
            assert_eq!(fs::read_dir(path).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_inplace_update_binds_source_directly() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.txt");
        fs::write(&input, "x").unwrap();

        let registry = HostMountRegistry::unrestricted();
        let fs_impl = RealFs;
        let mounter = VolumeMounter::new(&registry, &fs_impl, true, "tmp");

        let entry = MountEntry::writable(&input.to_string_lossy(), "/sandbox/data.txt", MountKind::File);
        let mut runtime = Vec::new();
        mounter.add_volume(&mut runtime, &entry, None).unwrap();

        let fields = decode_fields(runtime[0].strip_prefix("--mount=").unwrap());
        assert_eq!(
            fields[1].strip_prefix("source=").unwrap(),
            input.to_string_lossy()
        );
        assert!(!fields.contains(&"readonly".to_string()));
    }

    #[test]
    fn test_unreachable_source_fails_validation() {
        let registry = HostMountRegistry::with_mounts("default", vec!["/Users".to_string()]);
        let fs_impl = RealFs;
        let mounter = VolumeMounter::new(&registry, &fs_impl, false, "tmp");

        let entry = MountEntry::new("/scratch/in.txt", "/sandbox/in.txt", MountKind::File);
        let mut runtime = Vec::new();
        let err = mounter.add_volume(&mut runtime, &entry, None).unwrap_err();
        assert!(matches!(err, StevedoreError::PathNotReachable { .. }));
        assert!(runtime.is_empty());
    }
}
