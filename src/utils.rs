// src/utils.rs

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::errors::{Error, Result};

/// Separates project and target in a deployment name on the control server.
pub const DEPLOYMENT_SEPARATOR: &str = "---";

/// Lower case, trimmed, whitespace runs replaced with a hyphen.
/// "My App" and "my-app" end up with the same name.
pub fn name_from_dir(dir: &Path) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    base.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Names of targets, apps and projects: `[a-z][-_a-z0-9]+`, never containing `---`.
pub fn validate_name(kind: &str, name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name.len() >= 2
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if !valid {
        return Err(Error::Config(format!(
            "Invalid {} name \"{}\": use lower case letters, digits, '-' and '_', starting with a letter",
            kind, name
        )));
    }
    if name.contains(DEPLOYMENT_SEPARATOR) {
        return Err(Error::Config(format!(
            "Invalid {} name \"{}\": must not contain \"{}\"",
            kind, name, DEPLOYMENT_SEPARATOR
        )));
    }
    Ok(name.to_string())
}

/// Stable identifier of one project's deployment to one target, e.g. `shop---production`.
pub fn deployment_name(project: &str, target: &str) -> Result<String> {
    for part in [project, target] {
        if part.contains(DEPLOYMENT_SEPARATOR) {
            return Err(Error::Config(format!(
                "\"{}\" must not contain \"{}\"",
                part, DEPLOYMENT_SEPARATOR
            )));
        }
    }
    Ok(format!("{}{}{}", project, DEPLOYMENT_SEPARATOR, target))
}

/// Single-quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./@:=+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Recursively copy `src` into `dest`, keeping symlinks as symlinks.
/// `skip` is checked against paths relative to `src`.
pub fn copy_dir(src: &Path, dest: &Path, skip: &[&Path]) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::Config(format!(
            "{} is not a directory",
            src.display()
        )));
    }
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Config(e.to_string()))?;
        if skip.iter().any(|s| rel == *s) {
            continue;
        }
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
