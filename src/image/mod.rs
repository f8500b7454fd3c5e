//! Image resolution - locating, pulling, building, loading and importing images
//!
//! A job names the container image it needs through an [`ImageRequirement`].
//! The resolver first consults a shared cache of already-resolved identifiers,
//! then the engine's local image list, and only then acquires the image using
//! exactly one acquisition strategy, in fixed priority order:
//! pull > build > load > import.

use crate::error::{Result, StevedoreError};
use crate::mount::mkdtemp;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use regex::Regex;
use tracing::{debug, info};

/// Default prefix for temporary directories created during resolution.
pub const DEFAULT_TMP_PREFIX: &str = "tmp";

/// Engine flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFlavor {
    /// Full container engine (read-only root, networking, identity mapping).
    Full,
    /// Restricted user-space variant lacking some of those flags.
    UserSpace,
}

/// A located container engine binary.
#[derive(Debug, Clone)]
pub struct Engine {
    command: PathBuf,
    flavor: EngineFlavor,
}

impl Engine {
    /// Locate the engine binary on `PATH`.
    ///
    /// Checked once, prior to any resolution; a missing binary is a
    /// `ToolUnavailable` error.
    pub fn locate(name: &str, flavor: EngineFlavor) -> Result<Self> {
        let command = find_executable(name).ok_or_else(|| {
            StevedoreError::ToolUnavailable(format!("{name} executable is not available"))
        })?;
        Ok(Self { command, flavor })
    }

    /// Wrap an explicit binary path without a `PATH` search.
    pub fn with_command(command: impl Into<PathBuf>, flavor: EngineFlavor) -> Self {
        Self {
            command: command.into(),
            flavor,
        }
    }

    /// Engine flavor.
    pub fn flavor(&self) -> EngineFlavor {
        self.flavor
    }

    /// True for the restricted user-space variant.
    pub fn is_user_space(&self) -> bool {
        self.flavor == EngineFlavor::UserSpace
    }

    /// The command token that starts every invocation.
    pub fn command_name(&self) -> String {
        self.command.to_string_lossy().into_owned()
    }

    /// Start building an engine invocation.
    pub fn command(&self) -> Command {
        Command::new(&self.command)
    }

    /// Run an engine subcommand to completion, discarding its stdout so it
    /// cannot interleave with captured job output.
    fn run(&self, args: &[&str]) -> Result<()> {
        let display_command = format!("{} {}", self.command_name(), args.join(" "));
        info!(command = %display_command, "Running engine subcommand");
        let status = self.command().args(args).stdout(Stdio::null()).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(StevedoreError::Subprocess {
                command: display_command,
                status: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Search `PATH` for an executable, or accept an explicit path as-is.
fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// How a required image is to be acquired when it is not available locally.
///
/// One arm per strategy; `ImageRequirement::acquisition` yields the first
/// applicable arm in priority order. Exactly one strategy runs per resolution
/// attempt and any non-zero exit from it is fatal for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// Pull by reference from a registry.
    Pull(String),
    /// Build from inline Dockerfile contents in a fresh temporary directory.
    Build(String),
    /// Load an image archive from a local file or a streamed remote URL.
    Load(String),
    /// Import a filesystem tarball from a path or URL.
    Import(String),
}

/// The image requirement record consumed from the workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageRequirement {
    /// Pull reference (`repository[:tag]`).
    pub pull: Option<String>,
    /// Inline Dockerfile contents.
    pub dockerfile: Option<String>,
    /// Image archive: local file path or remote URL.
    pub load: Option<String>,
    /// Filesystem tarball: local file path or URL.
    pub import: Option<String>,
    /// Explicit image identifier; defaults to the pull reference.
    pub image_id: Option<String>,
}

impl ImageRequirement {
    /// Requirement that pulls `reference` and uses it as the identifier.
    pub fn from_pull(reference: &str) -> Self {
        Self {
            pull: Some(reference.to_string()),
            ..Self::default()
        }
    }

    /// The identifier the engine will know the image by.
    pub fn image_id(&self) -> Option<String> {
        self.image_id.clone().or_else(|| self.pull.clone())
    }

    /// The acquisition strategy for this requirement, in priority order.
    pub fn acquisition(&self) -> Option<Acquisition> {
        if let Some(reference) = &self.pull {
            Some(Acquisition::Pull(reference.clone()))
        } else if let Some(contents) = &self.dockerfile {
            Some(Acquisition::Build(contents.clone()))
        } else if let Some(source) = &self.load {
            Some(Acquisition::Load(source.clone()))
        } else {
            self.import.clone().map(Acquisition::Import)
        }
    }
}

/// Set of image identifiers known to be resolved.
///
/// Append-only for the life of the process and shared by all concurrent jobs
/// so the same image is never pulled or built twice. Owned state injected at
/// construction; cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct ImageCache {
    resolved: Arc<Mutex<HashSet<String>>>,
}

impl ImageCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `image_id` has already been resolved.
    pub fn contains(&self, image_id: &str) -> Result<bool> {
        let resolved = self
            .resolved
            .lock()
            .map_err(|_| StevedoreError::Lock("Failed to acquire image cache lock".to_string()))?;
        Ok(resolved.contains(image_id))
    }

    /// Record `image_id` as resolved.
    pub fn insert(&self, image_id: &str) -> Result<()> {
        let mut resolved = self
            .resolved
            .lock()
            .map_err(|_| StevedoreError::Lock("Failed to acquire image cache lock".to_string()))?;
        resolved.insert(image_id.to_string());
        Ok(())
    }
}

/// Resolves image requirements against a located engine and a shared cache.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    engine: Engine,
    cache: ImageCache,
}

impl ImageResolver {
    /// Create a resolver for `engine` sharing `cache` with other jobs.
    pub fn new(engine: Engine, cache: ImageCache) -> Self {
        Self { engine, cache }
    }

    /// The engine this resolver drives.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolve the requirement to an image identifier.
    ///
    /// Fast path: a cached identifier returns immediately with no engine
    /// query. Otherwise the engine's local image list is matched; if the
    /// image is absent (or `force_pull` is set) and fetching is permitted,
    /// exactly one acquisition strategy runs as a blocking subprocess.
    pub fn resolve(
        &self,
        requirement: &ImageRequirement,
        pull_allowed: bool,
        force_pull: bool,
        tmpdir_prefix: &str,
    ) -> Result<String> {
        let image_id = requirement.image_id().ok_or_else(|| {
            StevedoreError::ImageResolution(
                "requirement does not name an image identifier".to_string(),
            )
        })?;

        if self.cache.contains(&image_id)? {
            return Ok(image_id);
        }

        let mut found = self.find_local(&image_id)?;

        if (force_pull || !found) && pull_allowed {
            if let Some(acquisition) = requirement.acquisition() {
                self.acquire(&acquisition, &image_id, tmpdir_prefix)?;
                found = true;
            }
        }

        if found {
            self.cache.insert(&image_id)?;
            Ok(image_id)
        } else {
            Err(StevedoreError::ImageResolution(format!(
                "image {image_id} not found and no acquisition method succeeded"
            )))
        }
    }

    /// Match the identifier against the engine's local image list.
    fn find_local(&self, image_id: &str) -> Result<bool> {
        let display_command = format!("{} images --no-trunc --all", self.engine.command_name());
        let output = self
            .engine
            .command()
            .args(["images", "--no-trunc", "--all"])
            .output()?;
        if !output.status.success() {
            return Err(StevedoreError::Subprocess {
                command: display_command,
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(listing_matches(
            &String::from_utf8_lossy(&output.stdout),
            image_id,
        ))
    }

    /// Run one acquisition strategy to completion.
    fn acquire(&self, acquisition: &Acquisition, image_id: &str, tmpdir_prefix: &str) -> Result<()> {
        match acquisition {
            Acquisition::Pull(reference) => self.engine.run(&["pull", reference]),
            Acquisition::Build(contents) => {
                let build_dir = mkdtemp(tmpdir_prefix)?;
                fs::write(build_dir.join("Dockerfile"), contents)?;
                let tag = format!("--tag={image_id}");
                self.engine
                    .run(&["build", &tag, &build_dir.to_string_lossy()])
            }
            Acquisition::Load(source) => self.load(source),
            Acquisition::Import(source) => self.engine.run(&["import", source, image_id]),
        }
    }

    /// Stream an image archive into `<engine> load` stdin.
    ///
    /// A local file is fed directly; anything else is fetched over HTTP with
    /// a chunked body piped straight through. A non-zero exit from the load
    /// process is fatal even when the stream completed.
    fn load(&self, source: &str) -> Result<()> {
        let display_command = format!("{} load", self.engine.command_name());
        info!(command = %display_command, %source, "Loading image archive");

        let mut child = if Path::new(source).exists() {
            let archive = fs::File::open(source)?;
            self.engine
                .command()
                .arg("load")
                .stdin(Stdio::from(archive))
                .stdout(Stdio::null())
                .spawn()?
        } else {
            let mut child = self
                .engine
                .command()
                .arg("load")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .spawn()?;
            debug!(url = %source, "Sending GET request");
            let mut response = reqwest::blocking::get(source)?;
            if let Some(stdin) = child.stdin.take() {
                let mut stdin = stdin;
                let bytes = std::io::copy(&mut response, &mut stdin)?;
                debug!(bytes, "Streamed image archive into engine");
            }
            child
        };

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(StevedoreError::Subprocess {
                command: display_command,
                status: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Legal image tag syntax: a word character followed by up to 127 word
/// characters, dots or dashes.
fn legal_tag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid")
    })
}

/// Split an image identifier into repository and tag.
///
/// A plain split on ':' misparses identifiers whose repository contains a
/// colon (a registry `host:port`). Splitting yields up to three parts; when
/// the final part reads as a legal tag, the leading parts fold back into the
/// repository name.
pub fn split_repo_tag(image_id: &str) -> (String, String) {
    let parts: Vec<&str> = image_id.split(':').collect();
    match parts.as_slice() {
        [repo] => (repo.to_string(), "latest".to_string()),
        [repo, tag] => {
            if legal_tag().is_match(tag) {
                (repo.to_string(), tag.to_string())
            } else {
                (format!("{repo}:{tag}"), "latest".to_string())
            }
        }
        [host, port_repo, tag, ..] => {
            if legal_tag().is_match(tag) {
                (format!("{host}:{port_repo}"), tag.to_string())
            } else {
                (host.to_string(), port_repo.to_string())
            }
        }
        [] => (image_id.to_string(), "latest".to_string()),
    }
}

/// Match an identifier against the engine's line-oriented image listing.
///
/// Each line is `<image-id> <repository> <tag> ...`, parsed positionally;
/// a match is either repository:tag equality or a full image-id match.
fn listing_matches(listing: &str, image_id: &str) -> bool {
    let (want_repo, want_tag) = split_repo_tag(image_id);
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id), Some(repo), Some(tag)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if (repo == want_repo && tag == want_tag) || id == image_id {
            return true;
        }
    }
    false
}
