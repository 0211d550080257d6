//! Pipeline detection for `kiln-detector`.
//!
//! `detect(config)` reads `package.json` in the project root and proposes a
//! build command, a serve command and an output-directory name. Script names
//! are searched in a fixed priority order; framework conventions only ever
//! change the output-directory name, never a command found by name.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_core::config::DEFAULT_BUILD_DIR;
use kiln_core::{Config, PipelineSetting};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Script name tables
// ---------------------------------------------------------------------------

/// Build script names, checked in order; first match wins.
pub const BUILD_SCRIPTS_LIKELY: &[&str] = &["build-prod", "build", "dist", "build:browser"];

/// Recognized but non-standard build script names; used with a warning.
pub const BUILD_SCRIPTS_WARN: &[&str] = &["production"];

/// Serve script names, checked in order; first match wins.
pub const SERVE_SCRIPTS_LIKELY: &[&str] = &["serve", "server", "host"];

/// Framework conventions, most specific first: (dependency names, label,
/// output directory).
const FRAMEWORKS: &[(&[&str], &str, &str)] = &[
    (&["gatsby"], "Gatsby", "public"),
    (&["@angular/core"], "Angular", "dist"),
    (&["vite"], "Vite", "dist"),
    (&["vue"], "Vue", "dist"),
    (&["preact"], "Preact", "build"),
    (&["react", "react-scripts"], "React", "build"),
];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The script runner used to invoke `package.json` scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Infer from lockfiles in `root`; `npm` when nothing else matches.
    pub fn detect(root: &Path) -> Self {
        if root.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if root.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    /// Prefix that turns a script name into a shell command.
    pub fn run_prefix(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm run ",
            PackageManager::Yarn => "yarn run ",
            PackageManager::Pnpm => "pnpm run ",
        }
    }
}

/// The parts of `package.json` detection cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Script names declared under `scripts` with string bodies.
    pub scripts: HashSet<String>,
    /// Names from `dependencies`, `devDependencies` and `peerDependencies`.
    pub dependencies: HashSet<String>,
}

/// Errors from manifest loading. Never fatal to [`detect`].
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Detect the pipeline for the project described by `config`.
///
/// Returns `None` when no build command exists, neither as an override nor
/// in the manifest. That is a clean abort, not an error.
pub fn detect(config: &Config) -> Option<PipelineSetting> {
    let root = &config.project_root_full;
    let manifest = match load_manifest(root) {
        Ok(Some(manifest)) => Some(manifest),
        Ok(None) => {
            tracing::debug!(path = %root.display(), "no package.json, skipping script detection");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "package.json unusable, skipping script detection");
            None
        }
    };

    let mut found_build = None;
    let mut found_serve = None;
    let mut build_dir_name = DEFAULT_BUILD_DIR.to_string();
    let mut framework = None;

    if let Some(manifest) = &manifest {
        let prefix = PackageManager::detect(root).run_prefix();
        found_build = find_build_script(manifest).map(|name| format!("{prefix}{name}"));
        found_serve = find_serve_script(manifest).map(|name| format!("{prefix}{name}"));
        if let Some((label, dir)) = detect_framework(manifest) {
            framework = Some(label.to_string());
            build_dir_name = dir.to_string();
        }
    }

    let build_cmd = config.build_cmd.clone().or(found_build);
    let serve_cmd = config.serve_cmd.clone().or(found_serve);

    let Some(build_cmd) = build_cmd else {
        tracing::warn!(
            path = %root.display(),
            "no build command found; pass one explicitly or add a build script",
        );
        return None;
    };

    Some(PipelineSetting {
        build_cmd,
        serve_cmd,
        build_dir_name,
        has_manifest: manifest.is_some(),
        framework,
    })
}

/// Load and parse `<root>/package.json`. `Ok(None)` when the file is absent.
pub fn load_manifest(root: &Path) -> Result<Option<Manifest>, DetectError> {
    let file = root.join("package.json");
    let content = match fs::read_to_string(&file) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(DetectError::Io { path: file, source }),
    };

    let json: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        DetectError::ParseError { path: file.clone(), message: e.to_string() }
    })?;
    if !json.is_object() {
        return Err(DetectError::ParseError {
            path: file,
            message: "top-level value is not an object".to_string(),
        });
    }

    Ok(Some(Manifest {
        scripts: collect_scripts(&json),
        dependencies: collect_package_json_deps(&json),
    }))
}

/// First likely build script, else the first warn-tier one (logged).
pub fn find_build_script(manifest: &Manifest) -> Option<&'static str> {
    if let Some(name) = first_declared(manifest, BUILD_SCRIPTS_LIKELY) {
        return Some(name);
    }
    let name = first_declared(manifest, BUILD_SCRIPTS_WARN)?;
    tracing::warn!(script = name, "using non-standard build script");
    Some(name)
}

pub fn find_serve_script(manifest: &Manifest) -> Option<&'static str> {
    first_declared(manifest, SERVE_SCRIPTS_LIKELY)
}

/// (label, output dir) of the first matching framework convention.
pub fn detect_framework(manifest: &Manifest) -> Option<(&'static str, &'static str)> {
    FRAMEWORKS
        .iter()
        .find(|(deps, _, _)| deps.iter().any(|dep| manifest.dependencies.contains(*dep)))
        .map(|(_, label, dir)| (*label, *dir))
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn first_declared(manifest: &Manifest, names: &[&'static str]) -> Option<&'static str> {
    names.iter().copied().find(|name| manifest.scripts.contains(*name))
}

fn collect_scripts(json: &serde_json::Value) -> HashSet<String> {
    json.get("scripts")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter(|(_, body)| body.as_str().is_some_and(|s| !s.trim().is_empty()))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn collect_package_json_deps(json: &serde_json::Value) -> HashSet<String> {
    let mut deps = HashSet::new();
    for key in &["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(obj) = json.get(key).and_then(|v| v.as_object()) {
            for k in obj.keys() {
                deps.insert(k.clone());
            }
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(scripts: &[&str], deps: &[&str]) -> Manifest {
        Manifest {
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn likely_build_script_beats_warn_tier() {
        let m = manifest(&["production", "dist"], &[]);
        assert_eq!(find_build_script(&m), Some("dist"));
    }

    #[test]
    fn build_prod_has_highest_priority() {
        let m = manifest(&["build", "build-prod", "build:browser"], &[]);
        assert_eq!(find_build_script(&m), Some("build-prod"));
    }

    #[test]
    fn warn_tier_used_only_as_fallback() {
        let m = manifest(&["production", "start"], &[]);
        assert_eq!(find_build_script(&m), Some("production"));
    }

    #[test]
    fn serve_priority_order() {
        let m = manifest(&["host", "server"], &[]);
        assert_eq!(find_serve_script(&m), Some("server"));
        assert_eq!(find_serve_script(&manifest(&["start"], &[])), None);
    }

    #[test]
    fn framework_precedence_is_most_specific_first() {
        let m = manifest(&[], &["react", "gatsby"]);
        assert_eq!(detect_framework(&m), Some(("Gatsby", "public")));
        let m = manifest(&[], &["vue", "vite"]);
        assert_eq!(detect_framework(&m), Some(("Vite", "dist")));
    }

    #[test]
    fn non_string_and_blank_scripts_are_ignored() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"scripts": {"build": 1, "dist": "  ", "serve": "x"}}"#)
                .unwrap();
        let scripts = collect_scripts(&json);
        assert_eq!(scripts, HashSet::from(["serve".to_string()]));
    }
}
