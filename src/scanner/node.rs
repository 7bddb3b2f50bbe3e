use super::{read_json_object, run_build, AppDetector};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{Error, Result};

const DEFAULT_MAIN: &str = "server.js";

fn read_package_json(dir: &Path) -> Result<Option<Value>> {
    let path = dir.join("package.json");
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

fn build_script(pkg: &Value) -> Option<&str> {
    pkg.get("scripts")
        .and_then(|s| s.get("build"))
        .and_then(|v| v.as_str())
}

fn npm_run_build(dir: &Path) -> Result<()> {
    run_build(
        dir,
        Command::new("npm")
            .arg("--prefix")
            .arg(dir)
            .arg("run")
            .arg("build"),
        &format!("npm --prefix {} run build", dir.display()),
    )
}

// ─── create-react-app ─────────────────────────────────────────────

pub struct CreateReactApp;

impl AppDetector for CreateReactApp {
    fn name(&self) -> &'static str {
        "create-react-app"
    }

    fn detect(&self, dir: &Path) -> Result<bool> {
        Ok(read_package_json(dir)?
            .as_ref()
            .and_then(build_script)
            .is_some_and(|s| s == "react-scripts build"))
    }

    fn build(&self, dir: &Path) -> Result<Option<PathBuf>> {
        npm_run_build(dir)?;
        Ok(Some(dir.join("build")))
    }

    // Static web app, no main
    fn defaults(&self) -> Map<String, Value> {
        Map::new()
    }
}

// ─── Vite SPA ─────────────────────────────────────────────────────

pub struct ViteSpa;

impl AppDetector for ViteSpa {
    fn name(&self) -> &'static str {
        "vite-spa"
    }

    /// `vite build`, possibly after a type check (`tsc && vite build`)
    fn detect(&self, dir: &Path) -> Result<bool> {
        Ok(read_package_json(dir)?
            .as_ref()
            .and_then(build_script)
            .is_some_and(|s| s.contains("vite build")))
    }

    fn build(&self, dir: &Path) -> Result<Option<PathBuf>> {
        npm_run_build(dir)?;
        Ok(Some(dir.join("dist")))
    }

    fn defaults(&self) -> Map<String, Value> {
        Map::new()
    }
}

// ─── Node.js server ───────────────────────────────────────────────

pub struct NodeServer;

impl AppDetector for NodeServer {
    fn name(&self) -> &'static str {
        "node-server"
    }

    /// The descriptor's `main` when it names an existing `.js` file,
    /// otherwise the presence of `server.js`.
    fn detect(&self, dir: &Path) -> Result<bool> {
        let descriptor = read_json_object(&dir.join(crate::release::APP_DESCRIPTOR))?;
        match descriptor.get("main").and_then(|v| v.as_str()) {
            Some(main) => {
                let is_js = Path::new(main)
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("js"));
                Ok(is_js && dir.join(main).is_file())
            }
            None => Ok(dir.join(DEFAULT_MAIN).is_file()),
        }
    }

    fn build(&self, _dir: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn defaults(&self) -> Map<String, Value> {
        match json!({ "runtime": "node", "main": DEFAULT_MAIN }) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
