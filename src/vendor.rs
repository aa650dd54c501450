//! Vendored Node.js runtime discovery and caching.
//!
//! Runtime source trees ship alongside the packer as `vendor/node-vX.Y.Z`
//! directories. The selected tree is copied into the cache directory once
//! and reused by every subsequent pack; the vendor tree itself is never
//! written to. Native builds are incremental inside the cached copy, which
//! is what makes repacking an app a minutes-long operation instead of a
//! full runtime build.

use crate::job::PackJob;
use crate::workspace::Workspace;
use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the vendor directory location (default: `vendor/` next to
/// the running executable).
pub const VENDOR_DIR_ENV: &str = "NODEC_VENDOR_DIR";

/// A runtime tree ready to build against, with the version peeked from
/// its sources.
#[derive(Debug)]
pub struct RuntimeTree {
    /// The cached copy under the cache directory, never the vendor tree.
    pub dir: PathBuf,
    /// Directory name, e.g. `node-v8.3.0`.
    pub tag: String,
    /// Version per `src/node_version.h`, e.g. `v8.3.0`.
    pub semver: String,
}

pub fn locate_vendor_root() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(VENDOR_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let exe = env::current_exe().context("locating the running executable")?;
    match exe.parent() {
        Some(dir) => Ok(dir.join("vendor")),
        None => bail!("executable path {} has no parent directory", exe.display()),
    }
}

/// Pick the runtime tree to use from the vendor directory.
///
/// With `requested` unset the vendor directory must contain exactly one
/// tree. Both `node-vX.Y.Z` and the bare `vX.Y.Z` spelling are accepted.
pub fn select_runtime(vendor_root: &Path, requested: Option<&str>) -> Result<PathBuf> {
    if !vendor_root.is_dir() {
        bail!(
            "vendor directory not found: {} (set {} to the directory holding the runtime trees)",
            vendor_root.display(),
            VENDOR_DIR_ENV
        );
    }

    let mut tags = Vec::new();
    for entry in fs::read_dir(vendor_root)
        .with_context(|| format!("reading vendor directory {}", vendor_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("node-v") {
                tags.push(name.to_string());
            }
        }
    }
    tags.sort();

    if tags.is_empty() {
        bail!(
            "no vendored runtime trees under {} (expected directories named node-vX.Y.Z)",
            vendor_root.display()
        );
    }

    match requested {
        Some(requested) => {
            let tag = if requested.starts_with("node-") {
                requested.to_string()
            } else {
                format!("node-{}", requested)
            };
            if !tags.iter().any(|t| *t == tag) {
                bail!(
                    "runtime {} is not vendored here, available: {}",
                    requested,
                    tags.join(", ")
                );
            }
            Ok(vendor_root.join(tag))
        }
        None => {
            if tags.len() > 1 {
                bail!(
                    "multiple vendored runtimes available ({}), choose one with --node-version",
                    tags.join(", ")
                );
            }
            Ok(vendor_root.join(&tags[0]))
        }
    }
}

/// Make sure the selected runtime tree has a copy inside the cache
/// directory and return it. The copy happens at most once per tag.
pub fn ensure(job: &PackJob, ws: &Workspace, vendor_root: &Path) -> Result<RuntimeTree> {
    let source = select_runtime(vendor_root, job.node_version.as_deref())?;
    let tag = source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_default();

    let cached = job.cache_dir.join(&tag);
    if !cached.exists() {
        job.say(&format!("caching runtime {} (first use)", tag));
        ws.copy_tree_preserving(&source, &cached, job.host)?;
    }

    let semver = peek_node_version(&cached)?;
    if tag != format!("node-{}", semver) {
        bail!(
            "cached runtime {} reports version {}; remove {} and retry",
            tag,
            semver,
            cached.display()
        );
    }

    Ok(RuntimeTree {
        dir: cached,
        tag,
        semver,
    })
}

/// Read the version out of the runtime sources without building anything.
pub fn peek_node_version(runtime_dir: &Path) -> Result<String> {
    let path = runtime_dir.join("src/node_version.h");
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading runtime version header {}", path.display()))?;

    let mut major: Option<u32> = None;
    let mut minor: Option<u32> = None;
    let mut patch: Option<u32> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#define NODE_MAJOR_VERSION ") {
            if let Ok(v) = rest.trim().parse() {
                major = Some(v);
            }
        } else if let Some(rest) = line.strip_prefix("#define NODE_MINOR_VERSION ") {
            if let Ok(v) = rest.trim().parse() {
                minor = Some(v);
            }
        } else if let Some(rest) = line.strip_prefix("#define NODE_PATCH_VERSION ") {
            if let Ok(v) = rest.trim().parse() {
                patch = Some(v);
            }
        }
    }

    match (major, minor, patch) {
        (Some(major), Some(minor), Some(patch)) => Ok(format!("v{}.{}.{}", major, minor, patch)),
        _ => bail!(
            "could not read NODE_MAJOR/MINOR/PATCH_VERSION from {}",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{PackRequest, Platform};

    fn fake_runtime(vendor_root: &Path, tag: &str, version: (u32, u32, u32)) {
        let tree = vendor_root.join(tag);
        fs::create_dir_all(tree.join("src")).unwrap();
        fs::write(
            tree.join("src/node_version.h"),
            format!(
                "#define NODE_MAJOR_VERSION {}\n#define NODE_MINOR_VERSION {}\n#define NODE_PATCH_VERSION {}\n",
                version.0, version.1, version.2
            ),
        )
        .unwrap();
    }

    fn job_with_cache(cache_dir: &Path, node_version: Option<&str>) -> PackJob {
        fs::create_dir_all(cache_dir).unwrap();
        let request = PackRequest {
            cache_dir: Some(cache_dir.to_path_buf()),
            node_version: node_version.map(str::to_string),
            quiet: true,
            ..Default::default()
        };
        PackJob::new(request, Platform::Posix).unwrap()
    }

    #[test]
    fn peek_reads_the_version_defines() {
        let dir = tempfile::tempdir().unwrap();
        fake_runtime(dir.path(), "node-v8.3.0", (8, 3, 0));
        let semver = peek_node_version(&dir.path().join("node-v8.3.0")).unwrap();
        assert_eq!(semver, "v8.3.0");
    }

    #[test]
    fn peek_fails_without_the_version_header() {
        let dir = tempfile::tempdir().unwrap();
        assert!(peek_node_version(dir.path()).is_err());
    }

    #[test]
    fn a_single_tree_is_selected_without_a_flag() {
        let dir = tempfile::tempdir().unwrap();
        fake_runtime(dir.path(), "node-v8.3.0", (8, 3, 0));
        let picked = select_runtime(dir.path(), None).unwrap();
        assert!(picked.ends_with("node-v8.3.0"));
    }

    #[test]
    fn multiple_trees_require_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        fake_runtime(dir.path(), "node-v8.3.0", (8, 3, 0));
        fake_runtime(dir.path(), "node-v12.0.0", (12, 0, 0));

        let err = select_runtime(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("--node-version"));

        let picked = select_runtime(dir.path(), Some("v12.0.0")).unwrap();
        assert!(picked.ends_with("node-v12.0.0"));
    }

    #[test]
    fn unknown_tag_lists_what_is_available() {
        let dir = tempfile::tempdir().unwrap();
        fake_runtime(dir.path(), "node-v8.3.0", (8, 3, 0));
        let err = select_runtime(dir.path(), Some("v9.9.9")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("v9.9.9"));
        assert!(message.contains("node-v8.3.0"));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_copies_once_and_reuses_the_cached_tree() {
        let dir = tempfile::tempdir().unwrap();
        let vendor = dir.path().join("vendor");
        fake_runtime(&vendor, "node-v8.3.0", (8, 3, 0));

        let cache = dir.path().join("cache");
        let job = job_with_cache(&cache, None);
        let ws = Workspace::new(true);

        let runtime = ensure(&job, &ws, &vendor).unwrap();
        assert_eq!(runtime.semver, "v8.3.0");
        assert!(runtime.dir.starts_with(&job.cache_dir));

        // A marker inside the cached copy must survive the second call.
        let marker = runtime.dir.join("incremental-build-state");
        fs::write(&marker, "keep me").unwrap();
        let again = ensure(&job, &ws, &vendor).unwrap();
        assert_eq!(again.dir, runtime.dir);
        assert!(marker.exists());

        // The vendor tree itself stays pristine.
        assert!(!vendor.join("node-v8.3.0/incremental-build-state").exists());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_rejects_a_tree_whose_sources_disagree_with_the_tag() {
        let dir = tempfile::tempdir().unwrap();
        let vendor = dir.path().join("vendor");
        // Directory says 8.3.0, sources say 8.4.0.
        fake_runtime(&vendor, "node-v8.3.0", (8, 4, 0));

        let cache = dir.path().join("cache");
        let job = job_with_cache(&cache, None);
        let ws = Workspace::new(true);

        let err = ensure(&job, &ws, &vendor).unwrap_err();
        assert!(err.to_string().contains("v8.4.0"));
    }
}
