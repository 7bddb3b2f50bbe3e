//! Release builder: finds the apps in a project, builds them and packages
//! the output into an immutable, numbered release directory.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use colored::Colorize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::errors::{Error, Result};
use crate::scanner::{self, AppDetector};
use crate::store::{ProjectState, Store};
use crate::utils::{copy_dir, name_from_dir, validate_name};

/// Optional per-app descriptor. Never copied into a release.
pub const APP_DESCRIPTOR: &str = "app.json";
/// Merged metadata written next to each app's release output.
pub const APP_META: &str = "appMeta.json";
/// Build output lives under `<release>/<app>/release/`.
pub const APP_RELEASE_SUBDIR: &str = "release";

const EXCLUDED_DIRS: [&str; 3] = ["node_modules", "bower_components", "__pycache__"];
const DEFAULT_BUILD_PATH: &str = "build";

pub struct DetectedApp {
    pub name: String,
    pub dir: PathBuf,
    pub detector: Option<&'static dyn AppDetector>,
}

impl DetectedApp {
    pub fn kind(&self) -> &'static str {
        self.detector.map(|d| d.name()).unwrap_or("custom")
    }
}

impl fmt::Debug for DetectedApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectedApp")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("kind", &self.kind())
            .finish()
    }
}

#[derive(Debug)]
pub struct BuiltApp {
    pub name: String,
    pub output_dir: PathBuf,
    /// The app directory itself is the output, so the descriptor must be left out.
    pub uses_source_dir: bool,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub number: u64,
    pub dir: PathBuf,
    pub apps: Vec<String>,
}

pub fn release_dir(releases: &Path, number: u64) -> PathBuf {
    releases.join(format!("release-{}", number))
}

fn skipped_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Walk `root` and return every app in it, ordered by path.
///
/// A directory claimed by exactly one detector, or holding an `app.json`,
/// is an app and is not descended into. Anything else is searched further.
pub fn detect_apps(root: &Path) -> Result<Vec<DetectedApp>> {
    let mut apps = Vec::new();
    let mut names = HashSet::new();

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if skipped_dir(&entry.file_name().to_string_lossy()) {
            walker.skip_current_dir();
            continue;
        }

        let dir = entry.path();
        let matched = scanner::detect(dir)?;
        if matched.len() > 1 {
            return Err(Error::AmbiguousAppType {
                dir: dir.to_path_buf(),
                detectors: matched.iter().map(|d| d.name()).collect(),
            });
        }
        let detector = matched.into_iter().next();
        if detector.is_none() && !dir.join(APP_DESCRIPTOR).is_file() {
            continue;
        }

        let name = validate_name("app", &name_from_dir(dir))?;
        if !names.insert(name.clone()) {
            return Err(Error::DuplicateAppName(name));
        }
        apps.push(DetectedApp {
            name,
            dir: dir.to_path_buf(),
            detector,
        });
        walker.skip_current_dir();
    }

    Ok(apps)
}

/// Detector defaults overridden by the app's descriptor, plus `isWebApp`.
pub fn app_meta(app: &DetectedApp) -> Result<Map<String, Value>> {
    let mut meta = app.detector.map(|d| d.defaults()).unwrap_or_default();
    meta.extend(scanner::read_json_object(&app.dir.join(APP_DESCRIPTOR))?);
    let is_web_app = !meta.contains_key("main");
    meta.insert("isWebApp".into(), Value::Bool(is_web_app));
    Ok(meta)
}

fn meta_str<'a>(meta: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Value::as_str)
}

/// Build one app. An explicit `buildCmd` wins over the detector's build,
/// and with neither the app is released as it is.
pub fn build(app: &DetectedApp) -> Result<BuiltApp> {
    let meta = app_meta(app)?;

    let (output_dir, uses_source_dir) = if let Some(cmd) = meta_str(&meta, "buildCmd") {
        scanner::run_build(
            &app.dir,
            Command::new("sh").arg("-c").arg(cmd).current_dir(&app.dir),
            cmd,
        )?;
        let path = meta_str(&meta, "buildPath").unwrap_or(DEFAULT_BUILD_PATH);
        (app.dir.join(path), false)
    } else if let Some(dir) = app.detector.map(|d| d.build(&app.dir)).transpose()?.flatten() {
        (dir, false)
    } else if let Some(path) = meta_str(&meta, "buildPath") {
        (app.dir.join(path), false)
    } else {
        (app.dir.clone(), true)
    };

    if !output_dir.is_dir() {
        return Err(Error::BuildFailed {
            app: app.name.clone(),
            message: format!("build output {} does not exist", output_dir.display()),
        });
    }

    Ok(BuiltApp {
        name: app.name.clone(),
        output_dir,
        uses_source_dir,
        meta,
    })
}

pub struct ReleaseBuilder {
    project_dir: PathBuf,
    releases: PathBuf,
    store: Arc<dyn Store<ProjectState>>,
}

impl ReleaseBuilder {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        releases: impl Into<PathBuf>,
        store: Arc<dyn Store<ProjectState>>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            releases: releases.into(),
            store,
        }
    }

    pub fn releases(&self) -> &Path {
        &self.releases
    }

    pub fn latest(&self) -> Result<u64> {
        Ok(self.store.load()?.latest_release_num)
    }

    pub fn detect_apps(&self) -> Result<Vec<DetectedApp>> {
        detect_apps(&self.project_dir)
    }

    /// Copy every built app into a staging tree, then promote it to the
    /// next release number. The counter moves only after the rename.
    pub fn package(&self, apps: &[BuiltApp]) -> Result<Release> {
        fs::create_dir_all(&self.releases)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.releases)?;

        for app in apps {
            let app_dir = staging.path().join(&app.name);
            let descriptor = [Path::new(APP_DESCRIPTOR)];
            let skip: &[&Path] = if app.uses_source_dir { &descriptor } else { &[] };
            copy_dir(&app.output_dir, &app_dir.join(APP_RELEASE_SUBDIR), skip)?;
            fs::write(
                app_dir.join(APP_META),
                serde_json::to_string_pretty(&app.meta)?,
            )?;
        }

        let number = self.latest()? + 1;
        let dir = release_dir(&self.releases, number);
        if dir.exists() {
            // left behind by a run that died before the counter was saved
            fs::remove_dir_all(&dir)?;
        }
        fs::rename(staging.path(), &dir)?;
        self.store.update(|state| state.latest_release_num = number)?;

        Ok(Release {
            number,
            dir,
            apps: apps.iter().map(|a| a.name.clone()).collect(),
        })
    }

    /// Detect, build and package. Nothing is promoted unless every app built.
    pub fn create(&self) -> Result<Release> {
        o_step!("{}", "🔍 Detecting apps...".cyan());
        let detected = self.detect_apps()?;
        if detected.is_empty() {
            return Err(Error::Config(format!(
                "No apps found under {}",
                self.project_dir.display()
            )));
        }
        for app in &detected {
            o_detail!("   {} ({})", app.name.green(), app.kind().dimmed());
        }

        o_step!("\n{}", "🔨 Building apps...".cyan());
        let mut built = Vec::with_capacity(detected.len());
        for app in &detected {
            o_detail!("   Building {}...", app.name);
            let result = build(app)?;
            o_debug!("   Built to {}", result.output_dir.display());
            built.push(result);
        }

        o_step!("\n{}", "📦 Packaging release...".cyan());
        let release = self.package(&built)?;
        o_success!(
            "   {} Release {} saved to {}",
            "✔".green(),
            release.number.to_string().green(),
            release.dir.display()
        );
        Ok(release)
    }

    /// The release to deploy: `number`, or the latest one.
    pub fn resolve(&self, number: Option<u64>) -> Result<(u64, PathBuf)> {
        let number = match number {
            Some(n) => n,
            None => self.latest()?,
        };
        if number == 0 {
            return Err(Error::Config(
                "No release has been created yet, run `appctl release` first".into(),
            ));
        }
        let dir = release_dir(&self.releases, number);
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "Release {} not found at {}",
                number,
                dir.display()
            )));
        }
        Ok((number, dir))
    }
}
