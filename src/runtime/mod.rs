//! Runtime argument assembly - the full engine invocation for one job
//!
//! Drives the other components: the image is resolved separately, then every
//! entry of the path-mapping tables is staged through the volume mounter, and
//! finally the identity, network, resource and tracking flags are appended in
//! a fixed order. The engine reads later flags positionally relative to the
//! final image and job command, which the caller appends after this list.

use crate::error::{Result, StevedoreError};
use crate::machine::{effective_identity, engine_path, HostMountRegistry};
use crate::mount::{mkdtemp, strip_readonly, MountEntry, MountFs, VolumeMounter};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default engine command for the full flavor.
pub const DEFAULT_ENGINE: &str = "docker";

/// Temporary-directory path inside the sandbox.
pub const CONTAINER_TMPDIR: &str = "/tmp";

/// Operator-facing runtime options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Restricted user-space engine command, overriding the full engine.
    pub user_space_engine: Option<String>,
    /// Debug mode (keeps the user-space engine's diagnostics).
    pub debug: bool,
    /// Translate the job's memory allocation into an engine memory limit.
    pub strict_memory_limit: bool,
    /// Suppress the read-only sandbox root.
    pub no_read_only: bool,
    /// Custom network name substituted when a job declares network access.
    pub custom_net: Option<String>,
    /// Remove the container automatically after exit.
    pub rm_container: bool,
    /// Directory for container-id files; must pre-exist.
    pub cidfile_dir: Option<PathBuf>,
    /// Optional prefix for container-id file names.
    pub cidfile_prefix: Option<String>,
    /// Allow writable mappings to bind the original host path directly.
    pub inplace_update: bool,
    /// Skip matching the container identity to the invoking user.
    pub no_match_user: bool,
    /// Prefix for temporary directories (parent directory + name stem).
    pub tmpdir_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user_space_engine: None,
            debug: false,
            strict_memory_limit: false,
            no_read_only: false,
            custom_net: None,
            rm_container: false,
            cidfile_dir: None,
            cidfile_prefix: None,
            inplace_update: false,
            no_match_user: false,
            tmpdir_prefix: crate::image::DEFAULT_TMP_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a restricted user-space engine.
    pub fn user_space_engine(mut self, command: &str) -> Self {
        self.user_space_engine = Some(command.to_string());
        self
    }

    /// Enable debug mode.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Enforce the job's memory allocation.
    pub fn strict_memory_limit(mut self, strict: bool) -> Self {
        self.strict_memory_limit = strict;
        self
    }

    /// Set the container-id file directory.
    pub fn cidfile_dir(mut self, dir: PathBuf) -> Self {
        self.cidfile_dir = Some(dir);
        self
    }

    /// Set the container-id file name prefix.
    pub fn cidfile_prefix(mut self, prefix: &str) -> Self {
        self.cidfile_prefix = Some(prefix.to_string());
        self
    }

    /// Set the temporary-directory prefix.
    pub fn tmpdir_prefix(mut self, prefix: &str) -> Self {
        self.tmpdir_prefix = prefix.to_string();
        self
    }
}

/// Per-job inputs consumed from the surrounding scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSandbox {
    /// Job name, used in log messages.
    pub name: String,
    /// Host-side output directory, mounted read-write.
    pub host_outdir: PathBuf,
    /// Output directory path inside the sandbox.
    pub container_outdir: String,
    /// Host-side temporary directory, mounted read-write at `/tmp`.
    pub host_tmpdir: PathBuf,
    /// Primary path-mapping table.
    #[serde(default)]
    pub path_map: Vec<MountEntry>,
    /// Secondary ("generate") mapping table, if present.
    #[serde(default)]
    pub generate_map: Option<Vec<MountEntry>>,
    /// Whether the secondary table may map arbitrary host paths. The primary
    /// table always may; this asymmetry mirrors the looser generate-mapper
    /// contract.
    #[serde(default = "default_true")]
    pub generate_any_path: bool,
    /// Job-declared environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Whether job output is captured on standard output.
    #[serde(default)]
    pub stdout_captured: bool,
    /// Whether the job declares network access.
    #[serde(default)]
    pub network_access: bool,
    /// Declared/allocated memory in MiB, if any.
    #[serde(default)]
    pub memory_mib: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl JobSandbox {
    /// Create a job sandbox with empty mapping tables.
    pub fn new(name: &str, host_outdir: PathBuf, container_outdir: &str, host_tmpdir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            host_outdir,
            container_outdir: container_outdir.to_string(),
            host_tmpdir,
            path_map: Vec::new(),
            generate_map: None,
            generate_any_path: true,
            environment: HashMap::new(),
            stdout_captured: false,
            network_access: false,
            memory_mib: None,
        }
    }
}

/// The assembled engine invocation for one job.
///
/// Built incrementally by [`RuntimeBuilder::create_runtime`]; immutable once
/// returned. The caller appends the resolved image identifier and the job
/// command before spawning the engine.
#[derive(Debug, Clone)]
pub struct RunSpec {
    args: Vec<String>,
    cidfile: Option<PathBuf>,
}

impl RunSpec {
    /// Ordered invocation tokens, engine command first.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// File the engine will write the spawned container's identifier to.
    pub fn cidfile(&self) -> Option<&Path> {
        self.cidfile.as_deref()
    }

    /// Decompose into tokens and container-id file path.
    pub fn into_parts(self) -> (Vec<String>, Option<PathBuf>) {
        (self.args, self.cidfile)
    }
}

/// Assembles [`RunSpec`]s from runtime configuration and per-job inputs.
pub struct RuntimeBuilder<'a> {
    config: &'a RuntimeConfig,
    registry: &'a HostMountRegistry,
    fs: &'a dyn MountFs,
    engine_command: String,
}

impl<'a> RuntimeBuilder<'a> {
    /// Create a builder driving `engine_command` for the full-engine case.
    pub fn new(
        config: &'a RuntimeConfig,
        registry: &'a HostMountRegistry,
        fs: &'a dyn MountFs,
        engine_command: &str,
    ) -> Self {
        Self {
            config,
            registry,
            fs,
            engine_command: engine_command.to_string(),
        }
    }

    /// Assemble the invocation arguments and container-id file for one job.
    pub fn create_runtime(&self, job: &JobSandbox) -> Result<RunSpec> {
        let user_space = self.config.user_space_engine.as_deref();

        let mut runtime: Vec<String> = match user_space {
            // udocker chats on stdout unless silenced.
            Some(command) if command.contains("udocker") && !self.config.debug => {
                vec![command.to_string(), "--quiet".to_string(), "run".to_string()]
            }
            Some(command) => vec![command.to_string(), "run".to_string()],
            None => vec![
                self.engine_command.clone(),
                "run".to_string(),
                "-i".to_string(),
            ],
        };

        let mounter = VolumeMounter::new(
            self.registry,
            self.fs,
            self.config.inplace_update,
            &self.config.tmpdir_prefix,
        );

        // Output and temp directories are always mounted read-write.
        let host_outdir = job
            .host_outdir
            .canonicalize()
            .unwrap_or_else(|_| job.host_outdir.clone());
        mounter.append_volume(
            &mut runtime,
            &host_outdir.to_string_lossy(),
            &job.container_outdir,
            true,
        )?;
        let host_tmpdir = job
            .host_tmpdir
            .canonicalize()
            .unwrap_or_else(|_| job.host_tmpdir.clone());
        mounter.append_volume(
            &mut runtime,
            &host_tmpdir.to_string_lossy(),
            CONTAINER_TMPDIR,
            true,
        )?;

        self.add_volumes(&mounter, &mut runtime, &job.path_map, job, true)?;
        if let Some(generate_map) = &job.generate_map {
            self.add_volumes(&mounter, &mut runtime, generate_map, job, job.generate_any_path)?;
        }

        if user_space.is_some() {
            // The restricted variant rejects read-only markers; underlying
            // filesystem permissions still apply.
            runtime = runtime.iter().map(|token| strip_readonly(token)).collect();
        }

        runtime.push(format!("--workdir={}", engine_path(&job.container_outdir)));

        if user_space.is_none() {
            if !self.config.no_read_only {
                runtime.push("--read-only=true".to_string());
            }

            if job.network_access {
                if let Some(custom_net) = &self.config.custom_net {
                    runtime.push(format!("--net={custom_net}"));
                }
            } else {
                runtime.push("--net=none".to_string());
            }

            if job.stdout_captured {
                // The engine's logging driver would interleave with captured
                // output.
                runtime.push("--log-driver=none".to_string());
            }

            let (euid, egid) = effective_identity(self.registry);
            if !self.config.no_match_user {
                if let (Some(euid), Some(egid)) = (euid, egid) {
                    runtime.push(format!("--user={euid}:{egid}"));
                }
            }
        }

        if self.config.rm_container {
            runtime.push("--rm".to_string());
        }

        runtime.push(format!("--env=TMPDIR={CONTAINER_TMPDIR}"));
        runtime.push(format!("--env=HOME={}", job.container_outdir));

        let cidfile = if user_space.is_none() {
            let path = self.cidfile_path()?;
            runtime.push(format!("--cidfile={}", path.display()));
            Some(path)
        } else {
            None
        };

        let mut environment: Vec<_> = job.environment.iter().collect();
        environment.sort();
        for (key, value) in environment {
            runtime.push(format!("--env={key}={value}"));
        }

        if self.config.strict_memory_limit && user_space.is_none() {
            if let Some(memory_mib) = job.memory_mib {
                runtime.push(format!("--memory={memory_mib}m"));
            }
        } else if user_space.is_none() && job.memory_mib.is_some() {
            warn!(
                job = %job.name,
                "Skipping the engine memory limit despite a declared memory \
                 requirement. Enable strict memory enforcement for increased \
                 portability assurance."
            );
        }

        Ok(RunSpec {
            args: runtime,
            cidfile,
        })
    }

    /// Stage every staged entry of one mapping table.
    ///
    /// The host-side hint for an entry is its target re-rooted under the host
    /// output directory. Targets outside the sandbox output directory require
    /// `any_path_okay`.
    fn add_volumes(
        &self,
        mounter: &VolumeMounter<'_>,
        runtime: &mut Vec<String>,
        entries: &[MountEntry],
        job: &JobSandbox,
        any_path_okay: bool,
    ) -> Result<()> {
        let outdir_prefix = format!("{}/", job.container_outdir);
        for entry in entries.iter().filter(|entry| entry.staged) {
            let host_outdir_tgt = entry
                .target
                .strip_prefix(&outdir_prefix)
                .map(|rel| job.host_outdir.join(rel));
            if host_outdir_tgt.is_none() && !any_path_okay {
                return Err(StevedoreError::InvalidConfig(format!(
                    "target path {} is outside the designated output directory {}",
                    entry.target, job.container_outdir
                )));
            }
            mounter.add_volume(runtime, entry, host_outdir_tgt.as_deref())?;
        }
        Ok(())
    }

    /// Decide where the engine writes the container identifier.
    ///
    /// A configured directory must pre-exist and be a directory; otherwise a
    /// fresh prefixed temporary directory holds the file. The name is a
    /// timestamp-derived unique token, optionally prefixed.
    fn cidfile_path(&self) -> Result<PathBuf> {
        let dir = match &self.config.cidfile_dir {
            Some(dir) => {
                if !dir.exists() {
                    return Err(StevedoreError::InvalidConfig(format!(
                        "container-id file directory {} does not exist, create it first",
                        dir.display()
                    )));
                }
                if !dir.is_dir() {
                    return Err(StevedoreError::InvalidConfig(format!(
                        "container-id file path {} is not a directory",
                        dir.display()
                    )));
                }
                dir.clone()
            }
            None => mkdtemp(&self.config.tmpdir_prefix)?,
        };

        let token = Local::now().format("%Y%m%d%H%M%S-%6f");
        let name = match &self.config.cidfile_prefix {
            Some(prefix) => format!("{prefix}-{token}.cid"),
            None => format!("{token}.cid"),
        };
        Ok(dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{decode_fields, MountKind, RealFs};
    use regex::Regex;

    fn test_job(dir: &Path) -> JobSandbox {
        let outdir = dir.join("out");
        let tmpdir = dir.join("tmp");
        std::fs::create_dir_all(&outdir).unwrap();
        std::fs::create_dir_all(&tmpdir).unwrap();
        JobSandbox::new("job1", outdir, "/var/spool/job", tmpdir)
    }

    fn build(config: &RuntimeConfig, job: &JobSandbox) -> Result<RunSpec> {
        let registry = HostMountRegistry::unrestricted();
        let fs = RealFs;
        RuntimeBuilder::new(config, &registry, &fs, DEFAULT_ENGINE).create_runtime(job)
    }

    #[test]
    fn test_full_engine_base_invocation_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(dir.path());
        let config = RuntimeConfig::default();
        let spec = build(&config, &job).unwrap();
        let args = spec.args();

        assert_eq!(&args[..3], &["docker", "run", "-i"]);
        assert!(args.contains(&"--workdir=/var/spool/job".to_string()));
        assert!(args.contains(&"--read-only=true".to_string()));
        assert!(args.contains(&"--net=none".to_string()));
        assert!(args.contains(&"--env=TMPDIR=/tmp".to_string()));
        assert!(args.contains(&"--env=HOME=/var/spool/job".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--cidfile=")));
        if cfg!(unix) {
            assert!(args.iter().any(|a| a.starts_with("--user=")));
        }
        assert!(spec.cidfile().is_some());
    }

    #[test]
    fn test_outdir_and_tmpdir_always_mounted_writable() {
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(dir.path());
        let spec = build(&RuntimeConfig::default(), &job).unwrap();

        let mounts: Vec<_> = spec
            .args()
            .iter()
            .filter(|a| a.starts_with("--mount="))
            .collect();
        assert_eq!(mounts.len(), 2);
        for mount in mounts {
            let fields = decode_fields(mount.strip_prefix("--mount=").unwrap());
            assert!(!fields.contains(&"readonly".to_string()));
        }
        assert!(spec
            .args()
            .iter()
            .any(|a| a.starts_with("--mount=") && a.contains("target=/tmp")));
    }

    #[test]
    fn test_missing_cidfile_dir_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(dir.path());
        let missing = dir.path().join("no-such-dir");
        let config = RuntimeConfig::new().cidfile_dir(missing.clone());

        let err = build(&config, &job).unwrap_err();
        match err {
            StevedoreError::InvalidConfig(message) => {
                assert!(message.contains(&missing.display().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cidfile_name_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(dir.path());
        let cid_dir = dir.path().join("cids");
        std::fs::create_dir_all(&cid_dir).unwrap();
        let config = RuntimeConfig::new()
            .cidfile_dir(cid_dir.clone())
            .cidfile_prefix("job1");

        let spec = build(&config, &job).unwrap();
        let cidfile = spec.cidfile().unwrap();
        assert_eq!(cidfile.parent().unwrap(), cid_dir);
        let name = cidfile.file_name().unwrap().to_string_lossy();
        let pattern = Regex::new(r"^job1-\d{14}-\d{6}\.cid$").unwrap();
        assert!(pattern.is_match(&name), "bad cidfile name: {name}");
    }

    #[test]
    fn test_user_space_variant_narrows_flags() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "x").unwrap();

        let mut job = test_job(dir.path());
        job.path_map.push(MountEntry::new(
            &input.to_string_lossy(),
            "/data/input.txt",
            MountKind::File,
        ));
        let config = RuntimeConfig::new().user_space_engine("udocker");

        let spec = build(&config, &job).unwrap();
        let args = spec.args();

        assert_eq!(&args[..3], &["udocker", "--quiet", "run"]);
        assert!(spec.cidfile().is_none());
        assert!(!args.iter().any(|a| a.starts_with("--cidfile=")));
        assert!(!args.contains(&"--read-only=true".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--net=")));
        assert!(!args.iter().any(|a| a.starts_with("--user=")));
        // read-only markers stripped from every mount token
        assert!(!args.iter().any(|a| a.ends_with(",readonly")));
        assert!(args.iter().any(|a| a.contains("target=/data/input.txt")));
    }

    #[test]
    fn test_user_space_debug_keeps_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(dir.path());
        let config = RuntimeConfig::new().user_space_engine("udocker").debug(true);
        let spec = build(&config, &job).unwrap();
        assert_eq!(&spec.args()[..2], &["udocker", "run"]);
    }

    #[test]
    fn test_network_access_with_custom_net() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job(dir.path());
        job.network_access = true;
        let mut config = RuntimeConfig::default();
        config.custom_net = Some("jobnet".to_string());

        let spec = build(&config, &job).unwrap();
        assert!(spec.args().contains(&"--net=jobnet".to_string()));
        assert!(!spec.args().contains(&"--net=none".to_string()));
    }

    #[test]
    fn test_captured_stdout_disables_log_driver() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job(dir.path());
        job.stdout_captured = true;
        let spec = build(&RuntimeConfig::default(), &job).unwrap();
        assert!(spec.args().contains(&"--log-driver=none".to_string()));
    }

    #[test]
    fn test_job_environment_appended_after_fixed_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job(dir.path());
        job.environment
            .insert("ALPHA".to_string(), "1".to_string());
        job.environment
            .insert("BETA".to_string(), "two words".to_string());

        let spec = build(&RuntimeConfig::default(), &job).unwrap();
        let args = spec.args();
        let tmpdir_at = args.iter().position(|a| a == "--env=TMPDIR=/tmp").unwrap();
        let alpha_at = args.iter().position(|a| a == "--env=ALPHA=1").unwrap();
        let beta_at = args
            .iter()
            .position(|a| a == "--env=BETA=two words")
            .unwrap();
        assert!(tmpdir_at < alpha_at);
        assert!(alpha_at < beta_at);
    }

    #[test]
    fn test_strict_memory_limit_emits_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job(dir.path());
        job.memory_mib = Some(2048);
        let config = RuntimeConfig::new().strict_memory_limit(true);
        let spec = build(&config, &job).unwrap();
        assert!(spec.args().contains(&"--memory=2048m".to_string()));

        // Unenforced declarations run unconstrained.
        let spec = build(&RuntimeConfig::default(), &job).unwrap();
        assert!(!spec.args().iter().any(|a| a.starts_with("--memory=")));
    }

    #[test]
    fn test_generate_map_path_restriction() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("gen.txt");
        std::fs::write(&input, "x").unwrap();

        let mut job = test_job(dir.path());
        job.generate_any_path = false;
        job.generate_map = Some(vec![MountEntry::new(
            &input.to_string_lossy(),
            "/elsewhere/gen.txt",
            MountKind::File,
        )]);

        let err = build(&RuntimeConfig::default(), &job).unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidConfig(_)));

        // The primary table is never restricted.
        let mut job = test_job(dir.path());
        job.path_map.push(MountEntry::new(
            &input.to_string_lossy(),
            "/elsewhere/gen.txt",
            MountKind::File,
        ));
        assert!(build(&RuntimeConfig::default(), &job).is_ok());
    }

    #[test]
    fn test_unstaged_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job(dir.path());
        let mut entry =
            MountEntry::new("/nonexistent/input.txt", "/data/input.txt", MountKind::File);
        entry.staged = false;
        job.path_map.push(entry);

        let spec = build(&RuntimeConfig::default(), &job).unwrap();
        assert!(!spec
            .args()
            .iter()
            .any(|a| a.contains("target=/data/input.txt")));
    }
}
