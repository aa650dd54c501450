//! Native compile drivers: configure/make on POSIX, vcbuild on Windows.
//!
//! The runtime tree's own build system does the heavy lifting; this
//! module assembles its command lines, sets the overlay environment, and
//! copies the produced binary to the requested output path. Builds are
//! incremental inside the cached runtime tree, so repacking after a
//! source-only change is quick.

use crate::job::{PackJob, Platform};
use crate::process::{ensure_exists, run_stage_command, Cmd};
use crate::vendor::RuntimeTree;
use crate::workspace::Workspace;
use anyhow::Result;
use std::env;

/// Set for every native build command; the patched runtime sources use it
/// to run their own build-time scripts under stock interpreter behavior.
const USE_ORIGINAL_NODE_ENV: &str = "ENCLOSE_IO_USE_ORIGINAL_NODE";

/// Extra arguments appended to configure and make, for users driving
/// unusual runtime builds without changes here.
const CONFIGURE_ARGS_ENV: &str = "ENCLOSE_IO_CONFIGURE_ARGS";
const MAKE_ARGS_ENV: &str = "ENCLOSE_IO_MAKE_ARGS";

/// Drive the native build and place the finished executable at the
/// job's output path, replacing whatever is there.
pub fn compile(job: &PackJob, ws: &Workspace, runtime: &RuntimeTree) -> Result<()> {
    match job.host {
        Platform::Posix => compile_posix(job, ws, runtime),
        Platform::Windows => compile_windows(job, ws, runtime),
    }
}

fn compile_posix(job: &PackJob, ws: &Workspace, runtime: &RuntimeTree) -> Result<()> {
    let extra = env::var(CONFIGURE_ARGS_ENV).ok();
    let configure = Cmd::new("./configure")
        .args(posix_configure_args(job, extra.as_deref()))
        .current_dir(&runtime.dir)
        .env(USE_ORIGINAL_NODE_ENV, "1")
        .error_msg("configure failed in the runtime tree");
    run_stage_command(configure, job.capture().as_deref())?;

    let extra = env::var(MAKE_ARGS_ENV).ok();
    let make = Cmd::new("make")
        .args(posix_make_args(&job.make_args, extra.as_deref()))
        .current_dir(&runtime.dir)
        .env(USE_ORIGINAL_NODE_ENV, "1")
        .error_msg("native build failed");
    run_stage_command(make, job.capture().as_deref())?;

    let built = runtime.dir.join("out/Release/node");
    ensure_exists(&built, "compiled runtime binary")?;
    ws.copy_file_overwriting(&built, &job.output)
}

fn compile_windows(job: &PackJob, ws: &Workspace, runtime: &RuntimeTree) -> Result<()> {
    let vcbuild = Cmd::new("cmd")
        .args(vcbuild_args(job))
        .current_dir(&runtime.dir)
        .env(USE_ORIGINAL_NODE_ENV, "1")
        .error_msg("vcbuild failed");
    run_stage_command(vcbuild, job.capture().as_deref())?;

    let built = runtime.dir.join("Release").join("node.exe");
    ensure_exists(&built, "compiled runtime binary")?;
    ws.copy_file_overwriting(&built, &job.output)
}

fn posix_configure_args(job: &PackJob, extra: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if job.debug {
        args.push("--debug".to_string());
    }
    if let Some(os) = &job.target_os {
        args.push(format!("--dest-os={}", os));
    }
    if let Some(arch) = &job.target_arch {
        args.push(format!("--dest-cpu={}", arch));
    }
    if let Some(extra) = extra {
        args.extend(split_args(extra));
    }
    args
}

fn posix_make_args(make_args: &str, extra: Option<&str>) -> Vec<String> {
    let mut args = split_args(make_args);
    if let Some(extra) = extra {
        args.extend(split_args(extra));
    }
    args
}

fn vcbuild_args(job: &PackJob) -> Vec<String> {
    let mut args: Vec<String> = ["/C", "call", "vcbuild.bat"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(if job.debug { "debug" } else { "release" }.to_string());
    args.push("nosign".to_string());
    if let Some(arch) = &job.target_arch {
        args.push(arch.clone());
    }
    if let Some(vcbuild) = &job.vcbuild_args {
        args.extend(split_args(vcbuild));
    }
    args
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
