//! The packing pipeline, start to finish.
//!
//! Strictly sequential: every stage's processes have exited and files are
//! flushed before the next stage reads them. State flows through explicit
//! arguments; nothing here is global or lazily re-detected. A failed run
//! leaves the cache and scratch tree in place for inspection, and the
//! next run starts by wiping the scratch tree anyway.

use crate::job::{CacheLayout, PackJob};
use crate::process::start_capture_log;
use crate::workspace::{read_manifest, Workspace};
use crate::{buildvars, compile, image, stage, vendor};
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// What a successful pack produced.
#[derive(Debug)]
pub struct PackReport {
    pub output: PathBuf,
    pub image_bytes: u64,
    pub elapsed: Duration,
}

/// Pack with the vendor trees found next to the executable (or wherever
/// `NODEC_VENDOR_DIR` points).
pub fn run(job: &PackJob) -> Result<PackReport> {
    let vendor_root = vendor::locate_vendor_root()?;
    run_with_vendor(job, &vendor_root)
}

/// The full pipeline against an explicit vendor directory.
pub fn run_with_vendor(job: &PackJob, vendor_root: &Path) -> Result<PackReport> {
    let started = Instant::now();
    let ws = Workspace::new(job.quiet);

    banner(job)?;

    ws.mkdir_p(&job.cache_dir)?;
    let layout = job.layout();
    let _lock = acquire_cache_lock(&layout.lock_file)?;
    if job.clean_cache {
        clean_cache_dir(&ws, job, &layout)?;
    }
    if job.quiet {
        start_capture_log(&layout.capture_log)?;
    }

    let runtime = vendor::ensure(job, &ws, vendor_root)?;
    job.say(&format!("using runtime {} at {}", runtime.semver, runtime.dir.display()));

    let staged = stage::stage(job, &ws)?;
    stage::install_dependencies(job, &staged)?;
    stage::sanitize(job, &ws, &staged)?;

    let padded = image::patch_zero_byte_files(&layout.work_dir, job.target())?;
    if padded > 0 {
        job.say(&format!("padded {} empty files for the target toolchain", padded));
    }

    let image_bytes = image::build_image(job, &ws, &runtime)?;
    job.say(&format!("filesystem image is {} bytes", image_bytes));
    image::embed_image(
        &runtime.dir.join(image::IMAGE_REL),
        &runtime.dir.join(image::SOURCE_REL),
    )?;
    image::compile_memfs_object(job, &runtime)?;

    buildvars::write_build_vars(job, &runtime)?;

    compile::compile(job, &ws, &runtime)?;

    if job.keep_work_dir {
        job.say(&format!("keeping scratch tree {}", layout.work_dir.display()));
    } else {
        ws.remove_tree(&layout.work_dir)?;
    }

    let report = PackReport {
        output: job.output.clone(),
        image_bytes,
        elapsed: started.elapsed(),
    };
    job.say(&format!(
        "produced {} in {}s",
        report.output.display(),
        report.elapsed.as_secs()
    ));
    Ok(report)
}

fn banner(job: &PackJob) -> Result<()> {
    match &job.project_root {
        Some(root) => {
            // A root without a manifest is legal when the install step
            // is skipped; job validation already rejected the
            // configurations that require one.
            if !root.join("package.json").is_file() {
                job.say(&format!("packing {}", root.display()));
                return Ok(());
            }
            let manifest = read_manifest(root)?;
            let name = manifest.name.as_deref().unwrap_or("unnamed project");
            match manifest.version.as_deref() {
                Some(version) => job.say(&format!("packing {} {}", name, version)),
                None => job.say(&format!("packing {}", name)),
            }
        }
        None => job.say("packing a bare runtime (no entry script)"),
    }
    Ok(())
}

/// Wipe the cache contents while the lock is held. The lock file itself
/// survives: unlinking it would hand a concurrent pack a fresh lock on
/// the same path. A project materialized inside the cache survives too;
/// it is this run's own input.
fn clean_cache_dir(ws: &Workspace, job: &PackJob, layout: &CacheLayout) -> Result<()> {
    let entries = fs::read_dir(&job.cache_dir)
        .with_context(|| format!("reading cache directory {}", job.cache_dir.display()))?;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("reading cache directory {}", job.cache_dir.display()))?;
        let path = entry.path();
        if path == layout.lock_file {
            continue;
        }
        // The project root is stored canonicalized; the entry may not
        // be. Scoped package names place the root a level deeper, so
        // ancestors of the root survive as well.
        let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if job
            .project_root
            .as_ref()
            .map_or(false, |root| root.starts_with(&canonical))
        {
            continue;
        }
        let kind = entry
            .file_type()
            .with_context(|| format!("inspecting {}", path.display()))?;
        if kind.is_dir() {
            ws.remove_tree(&path)?;
        } else {
            ws.remove_file_if_present(&path)?;
        }
    }
    Ok(())
}

/// Exclusive lock on the cache directory for the duration of the run.
/// Concurrent packs against one cache are refused, not serialized, since
/// a second run would wipe the scratch tree under the first.
#[derive(Debug)]
pub(crate) struct CacheLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(crate) fn acquire_cache_lock(lock_path: &Path) -> Result<CacheLock> {
    // Never unlink a "stale" lock file here: removing a file another
    // process still holds locked would let a third process lock a fresh
    // file at the same path.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("creating lock file {}", lock_path.display()))?;

    if file.try_lock_exclusive().is_err() {
        bail!(
            "cache {} is locked by another running pack",
            lock_path.display()
        );
    }

    Ok(CacheLock {
        _file: file,
        path: lock_path.to_path_buf(),
    })
}
