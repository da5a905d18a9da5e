//! Extension package discovery.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ExtensionLoadError;

/// Script file every extension directory must contain.
pub const EXTENSION_ENTRY_FILE_NAME: &str = "index.js";
/// Private per-extension directory used by the storage capabilities.
pub const EXTENSION_STORE_DIR_NAME: &str = ".store";

#[derive(Debug, Clone, PartialEq, Eq)]
/// One discovered extension directory. Inert until bootstrapped.
pub struct ExtensionPackage {
    dir_name: String,
    package_dir: PathBuf,
    entry_path: PathBuf,
}

impl ExtensionPackage {
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    pub fn store_dir(&self) -> PathBuf {
        self.package_dir.join(EXTENSION_STORE_DIR_NAME)
    }
}

/// Scans `root` and returns one package per extension directory, in
/// directory-listing order.
///
/// A missing root means "no extensions". Any directory without an
/// `index.js` fails the whole scan.
pub fn discover_extension_packages(
    root: &Path,
) -> Result<Vec<ExtensionPackage>, ExtensionLoadError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    if !root.is_dir() {
        return Err(ExtensionLoadError::RootNotDirectory {
            path: root.to_path_buf(),
        });
    }

    let read_error = |source| ExtensionLoadError::ReadDir {
        path: root.to_path_buf(),
        source,
    };
    let root = fs::canonicalize(root).map_err(read_error)?;

    let mut packages = Vec::new();
    for entry in fs::read_dir(&root).map_err(read_error)? {
        let entry = entry.map_err(read_error)?;
        let package_dir = entry.path();
        if !package_dir.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if dir_name.starts_with('.') {
            continue;
        }

        let entry_path = package_dir.join(EXTENSION_ENTRY_FILE_NAME);
        if !entry_path.is_file() {
            return Err(ExtensionLoadError::MissingEntry {
                dir: dir_name,
                entry: EXTENSION_ENTRY_FILE_NAME,
            });
        }

        packages.push(ExtensionPackage {
            dir_name,
            package_dir,
            entry_path,
        });
    }
    Ok(packages)
}

pub fn render_extension_package_report(root: &Path, packages: &[ExtensionPackage]) -> String {
    let mut lines = vec![format!(
        "extension list: root={} count={}",
        root.display(),
        packages.len()
    )];
    for package in packages {
        lines.push(format!(
            "extension: dir={} entry={}",
            package.dir_name(),
            package.entry_path().display()
        ));
    }
    lines.join("\n")
}
