use anyhow::Result;
use clap::Parser;
use nodec::job::{PackJob, PackRequest, Platform};
use nodec::{npm_package, pipeline};
use std::path::PathBuf;

/// Compile a Node.js project into a single executable.
///
/// The entry script and everything reachable from its project root are
/// baked into the produced binary; running the binary runs the script.
#[derive(Parser)]
#[command(name = "nodec", version, about, long_about = None)]
struct Args {
    /// Entry script of the project, e.g. bin/coffee. Omit it to produce
    /// a plain Node.js interpreter with nothing baked in.
    #[arg(value_name = "ENTRANCE")]
    entrance: Option<PathBuf>,

    /// Project root directory (default: walk up from ENTRANCE to the
    /// nearest package.json)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Output file path (default: a.out, or a.exe on Windows)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Directory for the runtime cache and scratch files
    #[arg(long, value_name = "DIR")]
    tmpdir: Option<PathBuf>,

    /// Package installer command to run inside the staged project
    /// (default: npm)
    #[arg(long, value_name = "TOOL")]
    npm: Option<String>,

    /// Pack a published npm package instead of a local project. ENTRANCE
    /// then names a binary from the package's bin map; a package with a
    /// single binary needs none.
    #[arg(long, value_name = "NAME", conflicts_with = "root")]
    npm_package: Option<String>,

    /// Registry version of the package named by --npm-package
    /// (default: latest)
    #[arg(long, value_name = "VERSION", requires = "npm_package")]
    npm_package_version: Option<String>,

    /// Vendored runtime version to build against, e.g. v8.3.0. Required
    /// only when more than one runtime is vendored.
    #[arg(long, value_name = "VERSION")]
    node_version: Option<String>,

    /// Extra arguments for make (default: -j4)
    #[arg(long, value_name = "ARGS")]
    make_args: Option<String>,

    /// Extra arguments for vcbuild.bat on Windows
    #[arg(long, value_name = "ARGS")]
    vcbuild_args: Option<String>,

    /// Build a debug runtime instead of a release one
    #[arg(long)]
    debug: bool,

    /// Target operating system for cross-building, passed to configure
    /// as --dest-os
    #[arg(long, value_name = "OS")]
    os: Option<String>,

    /// Target CPU architecture, passed to configure as --dest-cpu
    #[arg(long, value_name = "ARCH")]
    arch: Option<String>,

    /// URL the produced executable polls for updates
    #[arg(long, value_name = "URL")]
    auto_update_url: Option<String>,

    /// Release identifier the produced executable compares against
    #[arg(long, value_name = "STRING")]
    auto_update_base: Option<String>,

    /// Do not run the package installer while staging
    #[arg(long)]
    skip_npm_install: bool,

    /// Wipe the cache directory before packing
    #[arg(long)]
    clean_tmpdir: bool,

    /// Keep the scratch directory after a successful pack
    #[arg(long)]
    keep_tmpdir: bool,

    /// Suppress progress output; subprocess output goes to a log file
    /// inside the cache directory
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn into_request(self) -> PackRequest {
        PackRequest {
            entrance: self.entrance,
            root: self.root,
            output: self.output,
            cache_dir: self.tmpdir,
            npm: self.npm,
            node_version: self.node_version,
            make_args: self.make_args,
            vcbuild_args: self.vcbuild_args,
            debug: self.debug,
            target_os: self.os,
            target_arch: self.arch,
            auto_update_url: self.auto_update_url,
            auto_update_base: self.auto_update_base,
            skip_npm_install: self.skip_npm_install,
            clean_cache: self.clean_tmpdir,
            keep_work_dir: self.keep_tmpdir,
            quiet: self.quiet,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let package = args.npm_package.clone();
    let package_version = args.npm_package_version.clone();
    let mut request = args.into_request();
    if let Some(name) = &package {
        // The positional argument selects from the package's bin map.
        let bin_name = request
            .entrance
            .take()
            .map(|p| p.to_string_lossy().into_owned());
        let fetched = npm_package::fetch(
            name,
            package_version.as_deref(),
            bin_name.as_deref(),
            &request,
        )?;
        request.root = Some(fetched.root);
        request.entrance = Some(fetched.entrance);
    }
    let job = PackJob::new(request, Platform::host())?;
    pipeline::run(&job)?;
    Ok(())
}
