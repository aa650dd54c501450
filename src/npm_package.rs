//! Packing a published npm package by name.
//!
//! With `--npm-package` there is no local checkout: a throwaway project
//! depending on the requested module is materialized inside the cache,
//! `npm install` populates it, and the module's `bin` map supplies the
//! entry script. The result feeds the ordinary pipeline exactly as if
//! the user had pointed at a checkout of their own.

use crate::job::{self, PackRequest};
use crate::pipeline::acquire_cache_lock;
use crate::process::{run_stage_command, start_capture_log, Cmd};
use crate::stage::resolve_installer;
use crate::workspace::Workspace;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

/// A module fetched from the registry, ready to pack.
#[derive(Debug)]
pub struct FetchedPackage {
    pub root: PathBuf,
    pub entrance: PathBuf,
}

/// Materialize `name` inside the cache and derive its entry script.
///
/// `bin_name` picks from the module's `bin` map; a module with a single
/// binary needs none. The request supplies the cache location, the
/// installer override, and quiet handling; its entrance and root are
/// what this function exists to produce.
pub fn fetch(
    name: &str,
    version: Option<&str>,
    bin_name: Option<&str>,
    request: &PackRequest,
) -> Result<FetchedPackage> {
    let ws = Workspace::new(request.quiet);
    let cache_dir = job::resolve_cache_dir(request.cache_dir.clone())?;
    ws.mkdir_p(&cache_dir)?;
    let _lock = acquire_cache_lock(&cache_dir.join(job::LOCK_FILE_NAME))?;
    let capture = if request.quiet {
        let log = cache_dir.join(job::CAPTURE_LOG_NAME);
        start_capture_log(&log)?;
        Some(log)
    } else {
        None
    };

    let pretty = match version {
        Some(version) => format!("{}@{}", name, version),
        None => name.to_string(),
    };
    ws.say(format!("fetching {} from the registry", pretty));

    let dir_name = match version {
        Some(version) => format!("{}-{}", name, version),
        None => name.to_string(),
    };
    let root = cache_dir.join(dir_name);
    ws.remove_tree(&root)?;
    ws.mkdir_p(&root)?;

    let manifest = json!({ "dependencies": { name: version.unwrap_or("*") } });
    let manifest_path = root.join("package.json");
    fs::write(&manifest_path, format!("{}\n", manifest))
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    let npm = request.npm.as_deref().unwrap_or("npm");
    let installer = resolve_installer(npm)?;
    let npm_version = Cmd::new(installer.as_os_str())
        .arg("-v")
        .current_dir(&root)
        .error_msg(&format!("checking `{} -v`", npm))
        .run()?;
    ws.say(format!("{} {}", npm, npm_version.stdout.trim()));

    let install = Cmd::new(installer.as_os_str())
        .arg("install")
        .current_dir(&root)
        .error_msg(&format!("npm install of {} failed", pretty));
    run_stage_command(install, capture.as_deref())?;

    let module_dir = root.join("node_modules").join(name);
    let module_manifest = module_dir.join("package.json");
    let data = fs::read_to_string(&module_manifest)
        .with_context(|| format!("npm install did not produce {}", module_manifest.display()))?;
    let parsed: Value = serde_json::from_str(&data)
        .with_context(|| format!("parsing {}", module_manifest.display()))?;

    let rel = select_bin(parsed.get("bin"), name, bin_name)?;
    let entrance = module_dir.join(&rel);
    if !entrance.is_file() {
        bail!("npm install did not generate {}", entrance.display());
    }
    ws.say(format!("using {} from {}", rel, name));

    Ok(FetchedPackage { root, entrance })
}

/// Pick one path out of a module's `bin` declaration, which is either a
/// single path or a name-to-path map.
fn select_bin(bin: Option<&Value>, package: &str, requested: Option<&str>) -> Result<String> {
    let bin = match bin {
        Some(bin) => bin,
        None => bail!("{} declares no binaries in its package.json", package),
    };
    match bin {
        // A lone path is a binary named after the package itself.
        Value::String(path) => match requested {
            None => Ok(path.clone()),
            Some(name) if name == package => Ok(path.clone()),
            Some(name) => bail!("no binary `{}` in {}, available: {}", name, package, package),
        },
        Value::Object(map) => {
            if map.is_empty() {
                bail!("{} declares no binaries in its package.json", package);
            }
            let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
            names.sort_unstable();
            match requested {
                Some(name) => match map.get(name).and_then(Value::as_str) {
                    Some(path) => Ok(path.to_string()),
                    None => bail!(
                        "no binary `{}` in {}, available: {}",
                        name,
                        package,
                        names.join(", ")
                    ),
                },
                None if names.len() == 1 => match map.values().next().and_then(Value::as_str) {
                    Some(path) => Ok(path.to_string()),
                    None => bail!("unsupported `bin` entry in {}'s package.json", package),
                },
                None => bail!(
                    "{} installs multiple binaries ({}), pass the one to pack as the entry argument",
                    package,
                    names.join(", ")
                ),
            }
        }
        _ => bail!("unsupported `bin` entry in {}'s package.json", package),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_lone_bin_path_is_the_default_choice() {
        let bin = json!("./bin/cli.js");
        assert_eq!(select_bin(Some(&bin), "demo", None).unwrap(), "./bin/cli.js");
        assert_eq!(
            select_bin(Some(&bin), "demo", Some("demo")).unwrap(),
            "./bin/cli.js"
        );
    }

    #[test]
    fn a_lone_bin_path_answers_only_to_the_package_name() {
        let bin = json!("./bin/cli.js");
        let err = select_bin(Some(&bin), "demo", Some("other")).unwrap_err();
        assert!(err.to_string().contains("available: demo"));
    }

    #[test]
    fn a_bin_map_honors_the_requested_name() {
        let bin = json!({"cake": "./bin/cake", "coffee": "./bin/coffee"});
        assert_eq!(
            select_bin(Some(&bin), "coffee-script", Some("coffee")).unwrap(),
            "./bin/coffee"
        );
    }

    #[test]
    fn an_unknown_bin_name_lists_the_choices() {
        let bin = json!({"cake": "./bin/cake", "coffee": "./bin/coffee"});
        let err = select_bin(Some(&bin), "coffee-script", Some("espresso")).unwrap_err();
        assert!(err.to_string().contains("available: cake, coffee"));
    }

    #[test]
    fn a_single_entry_map_needs_no_name() {
        let bin = json!({"serve": "bin/serve.js"});
        assert_eq!(select_bin(Some(&bin), "serve", None).unwrap(), "bin/serve.js");
    }

    #[test]
    fn multiple_binaries_require_a_choice() {
        let bin = json!({"cake": "./bin/cake", "coffee": "./bin/coffee"});
        let err = select_bin(Some(&bin), "coffee-script", None).unwrap_err();
        assert!(err.to_string().contains("multiple binaries"));
        assert!(err.to_string().contains("cake, coffee"));
    }

    #[test]
    fn a_module_without_binaries_is_an_error() {
        let err = select_bin(None, "left-pad", None).unwrap_err();
        assert!(err.to_string().contains("declares no binaries"));
    }

    #[cfg(unix)]
    #[test]
    fn fetch_materializes_the_module_and_derives_the_entrance() {
        use crate::job::{PackJob, Platform};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");

        // Stand-in registry: `install` drops the module tree it would
        // have downloaded into the current directory.
        let stub = dir.path().join("npm-stub");
        fs::write(
            &stub,
            "#!/bin/sh\n\
             if [ \"$1\" = \"-v\" ]; then echo 5.0.0; exit 0; fi\n\
             mkdir -p node_modules/demo-cli/bin\n\
             printf '{\"name\": \"demo-cli\", \"bin\": {\"demo\": \"bin/demo.js\"}}' \
             > node_modules/demo-cli/package.json\n\
             printf 'console.log(1)' > node_modules/demo-cli/bin/demo.js\n",
        )
        .unwrap();
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();

        let request = PackRequest {
            cache_dir: Some(cache.clone()),
            npm: Some(stub.to_string_lossy().into_owned()),
            quiet: true,
            ..Default::default()
        };

        let fetched = fetch("demo-cli", Some("2.0.0"), Some("demo"), &request).unwrap();
        assert_eq!(fetched.root, cache.join("demo-cli-2.0.0"));
        assert_eq!(
            fetched.entrance,
            fetched.root.join("node_modules/demo-cli/bin/demo.js")
        );
        let synthesized = fs::read_to_string(fetched.root.join("package.json")).unwrap();
        assert!(synthesized.contains("\"demo-cli\":\"2.0.0\""));

        // The result is a valid job input.
        let request = PackRequest {
            entrance: Some(fetched.entrance.clone()),
            root: Some(fetched.root.clone()),
            cache_dir: Some(cache.clone()),
            quiet: true,
            ..Default::default()
        };
        assert!(PackJob::new(request, Platform::Posix).is_ok());

        // Re-fetching starts from scratch.
        fs::write(fetched.root.join("stale.txt"), "x").unwrap();
        let request = PackRequest {
            cache_dir: Some(cache),
            npm: Some(stub.to_string_lossy().into_owned()),
            quiet: true,
            ..Default::default()
        };
        let refetched = fetch("demo-cli", Some("2.0.0"), Some("demo"), &request).unwrap();
        assert!(!refetched.root.join("stale.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn fetch_reports_a_module_the_installer_never_delivered() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // Installs nothing at all.
        let stub = dir.path().join("npm-stub");
        fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();

        let request = PackRequest {
            cache_dir: Some(dir.path().join("cache")),
            npm: Some(stub.to_string_lossy().into_owned()),
            quiet: true,
            ..Default::default()
        };
        let err = fetch("ghost", None, None, &request).unwrap_err();
        assert!(err.to_string().contains("did not produce"));
    }
}
