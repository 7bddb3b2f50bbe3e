pub mod node;
pub mod static_site;

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{Error, Result};
use crate::utils::name_from_dir;

/// Recognises one kind of app and knows how to build it.
pub trait AppDetector: Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, dir: &Path) -> Result<bool>;

    /// Build in place and return the directory holding the output.
    /// `None` means the app is released as is.
    fn build(&self, dir: &Path) -> Result<Option<PathBuf>>;

    /// Metadata every app of this kind starts from; `app.json` overrides it.
    fn defaults(&self) -> Map<String, Value>;
}

static DETECTORS: [&dyn AppDetector; 4] = [
    &node::CreateReactApp,
    &node::ViteSpa,
    &node::NodeServer,
    &static_site::StaticSite,
];

/// Every detector, in the order they are tried.
pub fn detectors() -> &'static [&'static dyn AppDetector] {
    &DETECTORS
}

/// Detectors that claim `dir`. More than one is an error for the caller.
pub fn detect(dir: &Path) -> Result<Vec<&'static dyn AppDetector>> {
    let mut matched = Vec::new();
    for detector in detectors() {
        if detector.detect(dir)? {
            matched.push(*detector);
        }
    }
    Ok(matched)
}

/// Read a JSON object; a missing file is an empty object.
pub fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Config(format!(
            "{} must contain a JSON object",
            path.display()
        ))),
        Err(e) => Err(Error::Config(format!(
            "Failed to parse {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Run a build command for the app in `dir`, keeping its output for the error.
pub fn run_build(dir: &Path, cmd: &mut Command, label: &str) -> Result<()> {
    o_debug!("   $ {}", label);
    let output = cmd.output().map_err(|e| Error::BuildFailed {
        app: name_from_dir(dir),
        message: format!("Failed to execute {}: {}", label, e),
    })?;
    if output.status.success() {
        return Ok(());
    }
    let mut message = format!("{} exited with {}", label, output.status);
    for stream in [&output.stdout, &output.stderr] {
        let text = String::from_utf8_lossy(stream);
        if !text.trim().is_empty() {
            message.push('\n');
            message.push_str(text.trim_end());
        }
    }
    Err(Error::BuildFailed {
        app: name_from_dir(dir),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detector_names_are_unique() {
        let names: Vec<_> = detectors().iter().map(|d| d.name()).collect();
        for (i, n) in names.iter().enumerate() {
            assert!(!names[i + 1..].contains(n));
        }
    }

    #[test]
    fn test_read_json_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.json");
        assert!(read_json_object(&path).unwrap().is_empty());

        fs::write(&path, r#"{"main": "index.js"}"#).unwrap();
        assert_eq!(read_json_object(&path).unwrap()["main"], "index.js");

        fs::write(&path, "[1, 2]").unwrap();
        assert!(read_json_object(&path).is_err());
    }

    #[test]
    fn test_run_build_failure_keeps_output() {
        let dir = TempDir::new().unwrap();
        let err = run_build(
            dir.path(),
            Command::new("sh").arg("-c").arg("echo broken >&2; exit 3"),
            "sh -c build",
        )
        .unwrap_err();
        match err {
            Error::BuildFailed { message, .. } => assert!(message.contains("broken")),
            other => panic!("unexpected error: {}", other),
        }
    }
}
