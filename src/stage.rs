//! Staging: the working copy of the project that becomes the image.
//!
//! The project is copied into the scratch tree, production dependencies
//! are installed inside the copy, and build droppings that must never end
//! up inside the executable are removed. The user's checkout is never
//! touched.

use crate::job::PackJob;
use crate::process::{run_stage_command, Cmd};
use crate::workspace::{Workspace, MEMFS_ROOT};
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Wipe and recreate the scratch tree, then materialize the project under
/// the in-image root name. Returns the staged project directory.
pub fn stage(job: &PackJob, ws: &Workspace) -> Result<PathBuf> {
    let layout = job.layout();
    ws.remove_tree(&layout.work_dir)?;
    ws.mkdir_p(&layout.work_dir)?;

    match &job.project_root {
        Some(root) => ws.copy_tree_preserving(root, &layout.work_dir_inner, job.host)?,
        // No project: the executable wraps a bare interpreter around an
        // empty image.
        None => ws.mkdir_p(&layout.work_dir_inner)?,
    }
    Ok(layout.work_dir_inner)
}

/// Run `<npm> install --production` inside the staged copy.
pub fn install_dependencies(job: &PackJob, staged: &Path) -> Result<()> {
    if job.entrance.is_none() || job.skip_npm_install {
        job.say("skipping dependency install");
        return Ok(());
    }

    let installer = resolve_installer(&job.npm)?;
    // Run the version check from inside the staged copy: a per-directory
    // npm configuration must apply to it and the install alike.
    let version = Cmd::new(installer.as_os_str())
        .arg("-v")
        .current_dir(staged)
        .error_msg(&format!("checking `{} -v`", job.npm))
        .run()?;
    job.say(&format!("{} {}", job.npm, version.stdout.trim()));

    let install = Cmd::new(installer.as_os_str())
        .args(["install", "--production"])
        .current_dir(staged)
        .error_msg("dependency install failed");
    run_stage_command(install, job.capture().as_deref())
}

pub(crate) fn resolve_installer(npm: &str) -> Result<PathBuf> {
    match which::which(npm) {
        Ok(path) => Ok(path),
        Err(_) => bail!(
            "installer `{}` not found (install: nodejs with npm, or pass --npm)",
            npm
        ),
    }
}

/// Remove what must not be packed: VCS metadata, stale pack outputs, and
/// leftovers of a previous nested pack. Exact names only, no heuristics.
pub fn sanitize(job: &PackJob, ws: &Workspace, staged: &Path) -> Result<()> {
    let git_dir = staged.join(".git");
    if git_dir.is_dir() {
        // Show what state the working copy was in before the metadata
        // goes away. Purely diagnostic, a missing git is fine.
        if let Ok(exec) = Cmd::new("git")
            .arg("status")
            .current_dir(staged)
            .allow_fail()
            .run()
        {
            if !job.quiet {
                eprint!("{}", exec.stdout);
            }
        }
        ws.remove_tree(&git_dir)?;
    }

    let mut strays = vec!["a.out".to_string(), "a.exe".to_string()];
    if let Some(name) = job.output.file_name().and_then(|n| n.to_str()) {
        strays.push(name.to_string());
    }
    strays.sort();
    strays.dedup();
    for name in &strays {
        ws.remove_file_if_present(&staged.join(name))?;
    }

    // A pack run from inside a previously packed tree leaves this behind.
    ws.remove_tree(&staged.join(&MEMFS_ROOT[1..]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{PackRequest, Platform};
    use std::fs;

    fn posix_job(dir: &Path, entrance: bool) -> PackJob {
        let root = dir.join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("package.json"), r#"{"name":"app"}"#).unwrap();
        let entry = root.join("index.js");
        fs::write(&entry, "module.exports = 1").unwrap();
        let cache = dir.join("cache");
        fs::create_dir_all(&cache).unwrap();

        let request = PackRequest {
            entrance: entrance.then_some(entry),
            cache_dir: Some(cache),
            quiet: true,
            ..Default::default()
        };
        PackJob::new(request, Platform::Posix).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn staging_twice_does_not_accumulate_state() {
        let dir = tempfile::tempdir().unwrap();
        let job = posix_job(dir.path(), true);
        let ws = Workspace::new(true);

        let staged = stage(&job, &ws).unwrap();
        assert!(staged.join("index.js").is_file());

        // Simulate debris from a previous run.
        fs::write(staged.join("leftover.tmp"), "x").unwrap();
        let staged = stage(&job, &ws).unwrap();
        assert!(staged.join("index.js").is_file());
        assert!(!staged.join("leftover.tmp").exists());
    }

    #[test]
    fn staging_without_a_project_creates_an_empty_image_root() {
        let dir = tempfile::tempdir().unwrap();
        let job = posix_job(dir.path(), false);
        let ws = Workspace::new(true);

        let staged = stage(&job, &ws).unwrap();
        assert!(staged.is_dir());
        assert_eq!(fs::read_dir(&staged).unwrap().count(), 0);
    }

    #[test]
    fn install_is_skipped_without_an_entrance() {
        let dir = tempfile::tempdir().unwrap();
        let job = posix_job(dir.path(), false);
        // The staged path is never touched on the skip path.
        install_dependencies(&job, &dir.path().join("never-created")).unwrap();
    }

    #[test]
    fn missing_installer_is_reported_with_a_hint() {
        let err = resolve_installer("nodec-missing-npm-xyzzy").unwrap_err();
        assert!(err.to_string().contains("--npm"));
    }

    #[cfg(unix)]
    #[test]
    fn install_runs_the_configured_installer_in_the_staged_copy() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut job = posix_job(dir.path(), true);
        let ws = Workspace::new(true);
        let staged = stage(&job, &ws).unwrap();

        let stub = dir.path().join("npm-stub");
        fs::write(
            &stub,
            "#!/bin/sh\nif [ \"$1\" = \"-v\" ]; then echo 5.0.0-stub; exit 0; fi\necho \"$@\" >> args.log\n",
        )
        .unwrap();
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
        job.npm = stub.to_string_lossy().into_owned();

        install_dependencies(&job, &staged).unwrap();
        let args = fs::read_to_string(staged.join("args.log")).unwrap();
        assert!(args.contains("install --production"));
    }

    #[cfg(unix)]
    #[test]
    fn version_check_runs_inside_the_staged_copy() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut job = posix_job(dir.path(), true);
        let ws = Workspace::new(true);
        let staged = stage(&job, &ws).unwrap();

        // The check's working directory is observable through a relative
        // write.
        let stub = dir.path().join("npm-stub");
        fs::write(
            &stub,
            "#!/bin/sh\nif [ \"$1\" = \"-v\" ]; then pwd > cwd.txt; echo 5.0.0; exit 0; fi\n",
        )
        .unwrap();
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
        job.npm = stub.to_string_lossy().into_owned();

        install_dependencies(&job, &staged).unwrap();
        let recorded = fs::read_to_string(staged.join("cwd.txt")).unwrap();
        assert_eq!(
            Path::new(recorded.trim()).canonicalize().unwrap(),
            staged.canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn quiet_install_routes_output_to_the_capture_log() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut job = posix_job(dir.path(), true);
        let ws = Workspace::new(true);
        let staged = stage(&job, &ws).unwrap();

        let stub = dir.path().join("npm-stub");
        fs::write(&stub, "#!/bin/sh\necho stub-output\n").unwrap();
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
        job.npm = stub.to_string_lossy().into_owned();

        install_dependencies(&job, &staged).unwrap();
        let log = fs::read_to_string(job.layout().capture_log).unwrap();
        assert!(log.contains("-> running"));
        assert!(log.contains("stub-output"));
    }

    #[test]
    fn sanitize_removes_exactly_the_known_debris() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = posix_job(dir.path(), true);
        job.output = dir.path().join("myapp");
        let ws = Workspace::new(true);

        let staged = dir.path().join("staged");
        fs::create_dir_all(staged.join(".git")).unwrap();
        fs::write(staged.join(".git/config"), "[core]").unwrap();
        fs::write(staged.join("a.out"), "old").unwrap();
        fs::write(staged.join("myapp"), "old").unwrap();
        fs::create_dir_all(staged.join("__enclose_io_memfs__")).unwrap();
        fs::write(staged.join("keep.js"), "keep").unwrap();
        // Similar names that must stay: only exact matches are removed.
        fs::write(staged.join("a.out.txt"), "keep").unwrap();

        sanitize(&job, &ws, &staged).unwrap();
        assert!(!staged.join(".git").exists());
        assert!(!staged.join("a.out").exists());
        assert!(!staged.join("myapp").exists());
        assert!(!staged.join("__enclose_io_memfs__").exists());
        assert!(staged.join("keep.js").exists());
        assert!(staged.join("a.out.txt").exists());
    }
}
