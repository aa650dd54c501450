//! Per-invocation job description.
//!
//! A [`PackJob`] is built once from the command line, validated before any
//! filesystem mutation, and then threaded immutably through the pipeline.
//! Platform handling follows the same rule: decided here, consumed
//! everywhere else, never re-detected at a branch point.

use crate::workspace::{self, MEMFS_ROOT};
use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Scratch directory name inside the cache, wiped on every run.
pub const WORK_DIR_NAME: &str = "__work_dir__";

/// Lock file name inside the cache, held by whichever phase mutates it.
pub const LOCK_FILE_NAME: &str = "nodec.lock";

/// Capture log name inside the cache, appended to by quiet runs.
pub const CAPTURE_LOG_NAME: &str = "nodec.log";

/// Platform family, for the few decisions that differ between the
/// POSIX toolchain (configure + make) and the Windows one (vcbuild).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }

    pub fn default_output_name(self) -> &'static str {
        match self {
            Platform::Posix => "a.out",
            Platform::Windows => "a.exe",
        }
    }
}

/// Auto-update endpoint baked into the produced executable. Both halves
/// are required: the URL to poll and the base string the runtime compares
/// release identifiers against.
#[derive(Debug, Clone)]
pub struct AutoUpdate {
    pub url: url::Url,
    pub base: String,
}

/// Raw invocation options, as collected by the CLI. `None` means the flag
/// was not given; defaulting happens in [`PackJob::new`].
#[derive(Debug, Default)]
pub struct PackRequest {
    pub entrance: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub npm: Option<String>,
    pub node_version: Option<String>,
    pub make_args: Option<String>,
    pub vcbuild_args: Option<String>,
    pub debug: bool,
    pub target_os: Option<String>,
    pub target_arch: Option<String>,
    pub auto_update_url: Option<String>,
    pub auto_update_base: Option<String>,
    pub skip_npm_install: bool,
    pub clean_cache: bool,
    pub keep_work_dir: bool,
    pub quiet: bool,
}

/// Everything one pack needs to know, validated up front.
#[derive(Debug)]
pub struct PackJob {
    pub entrance: Option<PathBuf>,
    pub project_root: Option<PathBuf>,
    pub output: PathBuf,
    pub cache_dir: PathBuf,
    pub npm: String,
    pub node_version: Option<String>,
    pub make_args: String,
    pub vcbuild_args: Option<String>,
    pub debug: bool,
    pub target_os: Option<String>,
    pub target_arch: Option<String>,
    pub auto_update: Option<AutoUpdate>,
    pub skip_npm_install: bool,
    pub clean_cache: bool,
    pub keep_work_dir: bool,
    pub quiet: bool,
    pub host: Platform,
}

/// Fixed locations inside the cache directory.
pub struct CacheLayout {
    pub work_dir: PathBuf,
    pub work_dir_inner: PathBuf,
    pub lock_file: PathBuf,
    pub capture_log: PathBuf,
}

impl PackJob {
    pub fn new(request: PackRequest, host: Platform) -> Result<PackJob> {
        let entrance = match request.entrance {
            Some(path) => Some(
                fs::canonicalize(&path)
                    .with_context(|| format!("entry script not found: {}", path.display()))?,
            ),
            None => None,
        };

        // Without an entry script there is no project to stage; the pack
        // produces a plain interpreter around an empty image.
        let project_root = match &entrance {
            Some(entrance) => Some(resolve_root(
                entrance,
                request.root.as_deref(),
                request.skip_npm_install,
            )?),
            None => None,
        };

        if let (Some(entrance), Some(root)) = (&entrance, &project_root) {
            if entrance.strip_prefix(root).is_err() {
                bail!(
                    "entry script {} is not inside the project root {}",
                    entrance.display(),
                    root.display()
                );
            }
        }

        let output = absolutize(
            request
                .output
                .unwrap_or_else(|| PathBuf::from(host.default_output_name())),
        )?;
        let cache_dir = resolve_cache_dir(request.cache_dir)?;

        // A plain substring test, stricter than a path-prefix check. The
        // scratch tree must never land inside the project, where the next
        // stage would recursively pack it.
        if let Some(root) = &project_root {
            let cache_str = cache_dir.to_string_lossy();
            let root_str = root.to_string_lossy();
            if cache_str.contains(root_str.as_ref()) {
                bail!(
                    "cache directory {} cannot reside inside the project {} (pass --tmpdir to move it)",
                    cache_dir.display(),
                    root.display()
                );
            }
        }

        let auto_update = match (request.auto_update_url, request.auto_update_base) {
            (Some(url), Some(base)) => {
                let url = url::Url::parse(&url)
                    .with_context(|| format!("invalid --auto-update-url `{}`", url))?;
                Some(AutoUpdate { url, base })
            }
            (None, None) => None,
            _ => bail!("--auto-update-url and --auto-update-base must be given together"),
        };

        Ok(PackJob {
            entrance,
            project_root,
            output,
            cache_dir,
            npm: request.npm.unwrap_or_else(|| "npm".to_string()),
            node_version: request.node_version,
            make_args: request.make_args.unwrap_or_else(|| "-j4".to_string()),
            vcbuild_args: request.vcbuild_args,
            debug: request.debug,
            target_os: request.target_os,
            target_arch: request.target_arch,
            auto_update,
            skip_npm_install: request.skip_npm_install,
            clean_cache: request.clean_cache,
            keep_work_dir: request.keep_work_dir,
            quiet: request.quiet,
            host,
        })
    }

    pub fn layout(&self) -> CacheLayout {
        let work_dir = self.cache_dir.join(WORK_DIR_NAME);
        let work_dir_inner = work_dir.join(&MEMFS_ROOT[1..]);
        CacheLayout {
            work_dir,
            work_dir_inner,
            lock_file: self.cache_dir.join(LOCK_FILE_NAME),
            capture_log: self.cache_dir.join(CAPTURE_LOG_NAME),
        }
    }

    /// The platform whose artifacts are produced. Differs from the host
    /// only when cross-building via `--os`.
    pub fn target(&self) -> Platform {
        match self.target_os.as_deref() {
            Some("win" | "win32" | "windows") => Platform::Windows,
            Some(_) => Platform::Posix,
            None => self.host,
        }
    }

    /// Where subprocess output goes while the run is quiet.
    pub fn capture(&self) -> Option<PathBuf> {
        if self.quiet {
            Some(self.layout().capture_log)
        } else {
            None
        }
    }

    /// Progress narration on stderr, silenced by `--quiet`.
    pub fn say(&self, line: &str) {
        if !self.quiet {
            eprintln!("-> {}", line);
        }
    }
}

fn resolve_root(entrance: &Path, explicit: Option<&Path>, skip_install: bool) -> Result<PathBuf> {
    match explicit {
        Some(root) => {
            let root = fs::canonicalize(root)
                .with_context(|| format!("project root not found: {}", root.display()))?;
            if !skip_install && !root.join("package.json").is_file() {
                bail!("no package.json in project root {}", root.display());
            }
            Ok(root)
        }
        None => {
            let start = entrance
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            workspace::resolve_project_root(&start)
        }
    }
}

/// The cache directory a request resolves to. Shared with the npm
/// package front-end, which needs the location before a job exists.
pub(crate) fn resolve_cache_dir(requested: Option<PathBuf>) -> Result<PathBuf> {
    absolutize(requested.unwrap_or_else(default_cache_dir))
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir().context("resolving the current directory")?;
        Ok(cwd.join(path))
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("nodec")
}
