//! Path and filesystem groundwork for packing.
//!
//! Owns the in-image path mapping (`mempath`), project root discovery,
//! and the announced filesystem operations the stages build on. Every
//! destructive operation prints a `-> ...` line to stderr first so a user
//! watching a pack can see exactly what is touched; `--quiet` silences
//! the narration but never the errors.

use crate::job::Platform;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Mount point of the embedded filesystem inside the produced executable.
/// The patched runtime recognizes exactly this prefix; it is part of the
/// binary contract with the vendored runtime sources.
pub const MEMFS_ROOT: &str = "/__enclose_io_memfs__";

/// Map an absolute path inside the project to its in-image path.
///
/// Defined only for lexical descendants of `root`. Both arguments are
/// expected post-canonicalization; a non-descendant argument is a packer
/// defect, not a user error, and panics.
pub fn mempath(path: &Path, root: &Path) -> String {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => panic!(
            "logic error in mempath: {} is outside {}",
            path.display(),
            root.display()
        ),
    };
    let mut out = String::from(MEMFS_ROOT);
    for part in rel.components() {
        out.push('/');
        out.push_str(&part.as_os_str().to_string_lossy());
    }
    out
}

/// Walk up from `start` until a directory containing `package.json` is
/// found. Reaching the filesystem root without one is a configuration
/// error naming where the search began.
pub fn resolve_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join("package.json").is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!(
                "cannot find a package.json in {} or any parent directory",
                start.display()
            );
        }
    }
}

/// The fields of `package.json` the packer itself cares about. Everything
/// else in the manifest belongs to npm and is carried opaquely inside the
/// image.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

pub fn read_manifest(root: &Path) -> Result<Manifest> {
    let path = root.join("package.json");
    let data =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let manifest: Manifest =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(manifest)
}

/// Render a path with forward slashes, as the generated C header and the
/// in-image paths require even when packing on Windows.
pub fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Filesystem operations that narrate what they do before doing it.
pub struct Workspace {
    quiet: bool,
}

impl Workspace {
    pub fn new(quiet: bool) -> Self {
        Workspace { quiet }
    }

    pub(crate) fn say(&self, line: String) {
        if !self.quiet {
            eprintln!("-> {}", line);
        }
    }

    /// Remove a directory tree if it exists.
    pub fn remove_tree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            self.say(format!("rm -rf {}", path.display()));
            fs::remove_dir_all(path)
                .with_context(|| format!("removing directory {}", path.display()))?;
        }
        Ok(())
    }

    /// Remove a single file if it exists. Symlinks are removed without
    /// following them.
    pub fn remove_file_if_present(&self, path: &Path) -> Result<()> {
        if path.symlink_metadata().is_ok() {
            self.say(format!("rm -f {}", path.display()));
            fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    pub fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.say(format!("mkdir -p {}", path.display()));
        fs::create_dir_all(path)
            .with_context(|| format!("creating directory {}", path.display()))?;
        Ok(())
    }

    /// Copy a directory tree preserving metadata. The native build relies
    /// on preserved mtimes to avoid rebuilding the whole runtime, so this
    /// delegates to the platform tool that keeps them: `cp -a` on POSIX,
    /// robocopy on Windows. `to` must not exist yet; the source directory
    /// is copied as `to`, not into it.
    pub fn copy_tree_preserving(&self, from: &Path, to: &Path, host: Platform) -> Result<()> {
        self.say(format!("cp -r {} {}", from.display(), to.display()));
        match host {
            Platform::Posix => {
                Cmd::new("cp")
                    .arg("-a")
                    .arg_path(from)
                    .arg_path(to)
                    .error_msg(&format!(
                        "copying {} to {}",
                        from.display(),
                        to.display()
                    ))
                    .run()?;
            }
            Platform::Windows => {
                // robocopy exit codes below 8 all mean success.
                let exec = Cmd::new("robocopy")
                    .arg_path(from)
                    .arg_path(to)
                    .args(["/E", "/COPY:DAT"])
                    .allow_fail()
                    .run()?;
                let code = exec.status.code().unwrap_or(99);
                if code >= 8 {
                    bail!(
                        "robocopy {} {} failed with exit code {}\n{}",
                        from.display(),
                        to.display(),
                        code,
                        exec.stdout.trim()
                    );
                }
            }
        }
        Ok(())
    }

    /// Copy a single file, replacing any existing destination and creating
    /// parent directories as needed.
    pub fn copy_file_overwriting(&self, from: &Path, to: &Path) -> Result<()> {
        self.say(format!("cp {} {}", from.display(), to.display()));
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        if to.symlink_metadata().is_ok() {
            fs::remove_file(to)
                .with_context(|| format!("replacing existing {}", to.display()))?;
        }
        fs::copy(from, to)
            .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
        Ok(())
    }
}
