//! Image construction: squash the staged tree, embed it as C source.
//!
//! The staged scratch tree is serialized with `mksquashfs` into a single
//! compressed image inside the runtime tree, then translated into a byte
//! array the native build links into the executable. The squashfs format
//! itself is opaque here; everything format-specific lives in the runtime's
//! embedded reader.

use crate::job::{PackJob, Platform};
use crate::process::{ensure_exists, run_stage_command, Cmd};
use crate::vendor::RuntimeTree;
use crate::workspace::{mempath, Workspace};
use anyhow::{bail, Context, Result};
use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Generated artifacts, relative to the runtime tree. The native build
/// references these exact names.
pub const IMAGE_REL: &str = "enclose_io/enclose_io_memfs.squashfs";
pub const SOURCE_REL: &str = "enclose_io/enclose_io_memfs.c";
pub const OBJECT_REL: &str = "enclose_io/enclose_io_memfs.o";
pub const MANIFEST_REL: &str = "enclose_io/enclose_io_manifest.txt";

fn archive_tool_hint(host: Platform) -> &'static str {
    match host {
        Platform::Posix => "install squashfs-tools from your package manager",
        Platform::Windows => {
            "download sqfs43-win32.zip from the squashfs-tools releases and add it to PATH"
        }
    }
}

/// Check for the archive tool before anything depends on it. A missing
/// mksquashfs is the most common environment failure, so it gets its own
/// remediation hint instead of a bare command error.
pub fn ensure_mksquashfs(host: Platform) -> Result<()> {
    if which::which("mksquashfs").is_err() {
        bail!("mksquashfs not found; {}", archive_tool_hint(host));
    }
    let check = Cmd::new("mksquashfs").arg("-version").allow_fail().run()?;
    if !check.success() {
        bail!(
            "`mksquashfs -version` failed; {}\n{}",
            archive_tool_hint(host),
            check.stderr.trim()
        );
    }
    Ok(())
}

/// Rewrite zero-length files to hold a single placeholder byte.
///
/// Only applied when the produced binary targets Windows: MSVC rejects
/// zero-length embedded resources (error C2466), other toolchains accept
/// them. Returns how many files were patched.
pub fn patch_zero_byte_files(work_dir: &Path, target: Platform) -> Result<usize> {
    if target != Platform::Windows {
        return Ok(0);
    }
    let mut patched = 0;
    for entry in WalkDir::new(work_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry
            .metadata()
            .with_context(|| format!("inspecting {}", entry.path().display()))?
            .len();
        if len == 0 {
            fs::write(entry.path(), " ")
                .with_context(|| format!("padding empty file {}", entry.path().display()))?;
            patched += 1;
        }
    }
    Ok(patched)
}

/// Serialize the scratch tree into the compressed image and return its
/// size in bytes. Stale artifacts from a previous pack are removed first
/// so a failed run can never leave a half-matching pair behind.
pub fn build_image(job: &PackJob, ws: &Workspace, runtime: &RuntimeTree) -> Result<u64> {
    let enclose_dir = runtime.dir.join("enclose_io");
    ws.mkdir_p(&enclose_dir)?;

    let image = runtime.dir.join(IMAGE_REL);
    ws.remove_file_if_present(&image)?;
    ws.remove_file_if_present(&runtime.dir.join(SOURCE_REL))?;

    ensure_mksquashfs(job.host)?;

    let layout = job.layout();
    let squash = Cmd::new("mksquashfs")
        .arg_path(&layout.work_dir)
        .arg_path(&image)
        .error_msg("mksquashfs failed to build the filesystem image");
    run_stage_command(squash, job.capture().as_deref())?;
    ensure_exists(&image, "filesystem image")?;

    write_pack_manifest(&layout.work_dir_inner, &runtime.dir.join(MANIFEST_REL))?;

    let bytes = fs::metadata(&image)
        .with_context(|| format!("reading size of {}", image.display()))?
        .len();
    Ok(bytes)
}

/// List every regular file that went into the image, by its in-image
/// path. Written next to the image for post-mortem inspection of what a
/// given executable actually carries.
pub fn write_pack_manifest(staged: &Path, destination: &Path) -> Result<()> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(staged) {
        let entry = entry?;
        if entry.file_type().is_file() {
            paths.push(mempath(entry.path(), staged));
        }
    }
    paths.sort();

    let mut body = paths.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    fs::write(destination, body)
        .with_context(|| format!("writing pack manifest {}", destination.display()))?;
    Ok(())
}

/// Translate the image into a C array definition the native build links
/// in, together with the live filesystem handle the runtime shim expects
/// in the same unit.
pub fn embed_image(image: &Path, out_c: &Path) -> Result<()> {
    let bytes =
        fs::read(image).with_context(|| format!("reading image {}", image.display()))?;
    if bytes.is_empty() {
        bail!("image {} is empty", image.display());
    }

    let file = File::create(out_c)
        .with_context(|| format!("creating embedded source {}", out_c.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "#include <stdint.h>")?;
    writeln!(out, "#include <stddef.h>")?;
    writeln!(out)?;
    writeln!(out, "struct sqfs;")?;
    writeln!(out, "struct sqfs *enclose_io_fs;")?;
    writeln!(
        out,
        "const uint8_t enclose_io_memfs[{}] = {{ {}",
        bytes.len(),
        bytes[0]
    )?;

    let mut emitted = 1usize;
    for chunk in bytes[1..].chunks(101) {
        let joined = chunk
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        writeln!(out, ",{}", joined)?;
        emitted += chunk.len();
    }
    writeln!(out, "}};")?;
    writeln!(out)?;
    out.flush()
        .with_context(|| format!("flushing embedded source {}", out_c.display()))?;

    // A mismatch here would corrupt every packed executable; it can only
    // come from a defect in this function, never from the environment.
    assert_eq!(
        emitted,
        bytes.len(),
        "embedded byte count diverged from the image size"
    );
    Ok(())
}

/// Pre-compile the embedded image on POSIX hosts so the runtime's make
/// step only has to link it. The Windows build compiles the source file
/// itself.
pub fn compile_memfs_object(job: &PackJob, runtime: &RuntimeTree) -> Result<()> {
    if job.host != Platform::Posix {
        return Ok(());
    }
    let compiler = env::var("CC").unwrap_or_else(|_| "cc".to_string());
    let mut cc = Cmd::new(compiler)
        .current_dir(&runtime.dir)
        .error_msg("compiling the embedded filesystem image failed");
    if cfg!(target_os = "macos") {
        cc = cc.arg("-mmacosx-version-min=10.7");
    }
    let cc = cc.args(["-c", SOURCE_REL, "-o", OBJECT_REL]);
    run_stage_command(cc, job.capture().as_deref())?;
    ensure_exists(&runtime.dir.join(OBJECT_REL), "embedded filesystem object")
}
