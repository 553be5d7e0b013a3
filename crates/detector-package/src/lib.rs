//! Detector packages.
//!
//! A package is a zip archive named `<name>.package` holding a detector's files.
//! Its root must contain [`MANIFEST_FILE`], which names the detector variant the
//! package instantiates and the default settings handed to it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Manifest file name at the root of every package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// File extension of a package archive.
pub const PACKAGE_EXTENSION: &str = "package";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Missing {MANIFEST_FILE} in {0}")]
    MissingManifest(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Invalid package name: '{0}'")]
    InvalidName(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

pub type Result<T> = std::result::Result<T, PackageError>;

/// Contents of [`MANIFEST_FILE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Detector id the package provides.
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Built-in detector variant the package instantiates.
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default settings merged under the alert rule's own settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl PackageManifest {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PackageError::InvalidManifest("id must not be empty".to_string()));
        }
        if self.variant.trim().is_empty() {
            return Err(PackageError::InvalidManifest(
                "variant must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Path of the package for `detector_id` inside `packages_dir`.
pub fn package_path(packages_dir: &Path, detector_id: &str) -> PathBuf {
    packages_dir.join(format!("{detector_id}.{PACKAGE_EXTENSION}"))
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(PackageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Pack `source_dir` into `<output_dir>/<name>.package`.
///
/// The directory must contain a valid manifest. Returns the archive path.
pub fn create_package(source_dir: &Path, name: &str, output_dir: &Path) -> Result<PathBuf> {
    validate_name(name)?;
    if !source_dir.is_dir() {
        return Err(PackageError::NotADirectory(source_dir.to_path_buf()));
    }

    let manifest_path = source_dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(PackageError::MissingManifest(source_dir.to_path_buf()));
    }
    PackageManifest::from_slice(&std::fs::read(&manifest_path)?)?;

    let mut entries = Vec::new();
    collect_files(source_dir, source_dir, &mut entries)?;
    entries.sort();

    std::fs::create_dir_all(output_dir)?;
    let output_path = package_path(output_dir, name);
    let file = File::create(&output_path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (archive_name, path) in &entries {
        debug!("Adding to package: {} as {}", path.display(), archive_name);
        let mut buffer = Vec::new();
        File::open(path)?.read_to_end(&mut buffer)?;
        zip.start_file(archive_name.as_str(), options)?;
        zip.write_all(&buffer)?;
    }
    zip.finish()?;

    Ok(output_path)
}

/// Walk `dir`, collecting `(archive name, path)` pairs relative to `root`.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let archive_name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push((archive_name, path));
    }
    Ok(())
}

/// Read and validate the manifest of a package archive.
pub fn read_manifest(package: &Path) -> Result<PackageManifest> {
    let mut archive = ZipArchive::new(File::open(package)?)?;
    let mut entry = match archive.by_name(MANIFEST_FILE) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(PackageError::MissingManifest(package.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    PackageManifest::from_slice(&bytes)
}

/// Names of the files stored in a package, in archive order.
pub fn list_entries(package: &Path) -> Result<Vec<String>> {
    let archive = ZipArchive::new(File::open(package)?)?;
    Ok(archive.file_names().map(str::to_string).collect())
}
