use super::AppDetector;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::errors::Result;

pub struct StaticSite;

impl AppDetector for StaticSite {
    fn name(&self) -> &'static str {
        "static-site"
    }

    fn detect(&self, dir: &Path) -> Result<bool> {
        if !dir.join("index.html").exists() {
            return Ok(false);
        }

        // Leave anything with a Node toolchain to the Node detectors
        Ok(!dir.join("package.json").exists() && !dir.join("server.js").exists())
    }

    fn build(&self, _dir: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn defaults(&self) -> Map<String, Value> {
        Map::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_static_site() {
        let dir = TempDir::new().unwrap();
        assert!(!StaticSite.detect(dir.path()).unwrap());

        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        assert!(StaticSite.detect(dir.path()).unwrap());

        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert!(!StaticSite.detect(dir.path()).unwrap());
    }
}
