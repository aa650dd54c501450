//! Compile a Node.js project into a single self-contained executable.
//!
//! The produced binary is a real `node` built from vendored runtime
//! sources, with the project baked in as an embedded SquashFS image and
//! the runtime's filesystem calls redirected into that image. Running it
//! is `node /__enclose_io_memfs__/<entry script>` with no files on disk.
//!
//! The crate splits the work into:
//!
//! - **Job model** - CLI options resolved into an absolute, validated plan
//! - **npm packages** - Published modules materialized into packable projects
//! - **Staging** - Project copy, `npm install --production`, debris removal
//! - **Image building** - mksquashfs wrapper and the C embedding of the image
//! - **Build vars** - The generated header wiring the runtime to the image
//! - **Compile drivers** - configure/make on POSIX, vcbuild.bat on Windows
//!
//! # Pipeline
//!
//! ```text
//! project root ──copy──> <cache>/__work_dir__/__enclose_io_memfs__/
//!                             │ npm install --production
//!                             │ sanitize (.git, stray outputs)
//!                             ▼
//!                        mksquashfs ──> enclose_io_memfs.squashfs
//!                             │ embed as const uint8_t[]
//!                             ▼
//! vendored node sources ──cp -a──> <cache>/node-vX.Y.Z/
//!                             │ enclose_io_memfs.c/.o, enclose_io.h
//!                             │ ./configure && make   (or vcbuild.bat)
//!                             ▼
//!                        out/Release/node ──copy──> ./a.out
//! ```
//!
//! Every stage runs to completion before the next starts, and a pack
//! holds an exclusive lock on its cache directory for the whole run.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodec::job::{PackJob, PackRequest, Platform};
//! use nodec::pipeline;
//!
//! let request = PackRequest {
//!     entrance: Some("bin/coffee".into()),
//!     output: Some("coffee".into()),
//!     ..Default::default()
//! };
//! let job = PackJob::new(request, Platform::host())?;
//! let report = pipeline::run(&job)?;
//! println!("packed {} bytes of image", report.image_bytes);
//! ```

pub mod buildvars;
pub mod compile;
pub mod image;
pub mod job;
pub mod npm_package;
pub mod pipeline;
pub mod process;
pub mod stage;
pub mod vendor;
pub mod workspace;

pub use job::{PackJob, PackRequest, Platform};
pub use pipeline::{run, PackReport};
pub use workspace::MEMFS_ROOT;
