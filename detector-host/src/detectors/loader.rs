//! Resolve a detector id to a runnable detector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use detector_package::{PackageError, package_path, read_manifest};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::builtin::BuiltinRegistry;
use super::traits::Detector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("detector not found: {0}")]
    NotFound(String),
    #[error("failed to load detector: {0}")]
    Load(String),
}

/// A loaded detector plus the settings its package ships with.
#[derive(Clone)]
pub struct DetectorHandle {
    pub detector: Arc<dyn Detector>,
    pub default_settings: Map<String, Value>,
}

impl DetectorHandle {
    /// Package defaults overlaid with `overrides`.
    pub fn merged_settings(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut settings = self.default_settings.clone();
        for (key, value) in overrides {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("id", &self.detector.id())
            .field("default_settings", &self.default_settings)
            .finish()
    }
}

pub trait DetectorLoader: Send + Sync {
    fn resolve(&self, detector_id: &str) -> Result<DetectorHandle, LoaderError>;
}

/// Looks for `<packages_dir>/<id>.package` first and falls back to a built-in
/// variant of the same name.
pub struct PackageLoader {
    packages_dir: PathBuf,
    registry: BuiltinRegistry,
}

impl PackageLoader {
    pub fn new(packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            registry: BuiltinRegistry::default(),
        }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    fn load_package(&self, detector_id: &str, path: &Path) -> Result<DetectorHandle, LoaderError> {
        let manifest = read_manifest(path).map_err(|e| match e {
            PackageError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                LoaderError::NotFound(detector_id.to_string())
            }
            other => LoaderError::Load(format!("{}: {other}", path.display())),
        })?;

        if manifest.id != detector_id {
            return Err(LoaderError::Load(format!(
                "package {} declares id '{}', expected '{detector_id}'",
                path.display(),
                manifest.id
            )));
        }

        debug!(
            detector_id,
            variant = %manifest.variant,
            version = ?manifest.version,
            "Loaded detector package"
        );

        // The package exists, so an unknown variant is a broken package.
        let detector = self
            .registry
            .create(&manifest.variant, detector_id, &manifest.settings)
            .map_err(|e| match e {
                LoaderError::NotFound(_) => LoaderError::Load(format!(
                    "package {} names unknown variant '{}'",
                    path.display(),
                    manifest.variant
                )),
                other => other,
            })?;
        Ok(DetectorHandle {
            detector,
            default_settings: manifest.settings,
        })
    }
}

impl DetectorLoader for PackageLoader {
    fn resolve(&self, detector_id: &str) -> Result<DetectorHandle, LoaderError> {
        let path = package_path(&self.packages_dir, detector_id);
        if path.is_file() {
            return self.load_package(detector_id, &path);
        }

        if self.registry.contains(detector_id) {
            let detector = self.registry.create(detector_id, detector_id, &Map::new())?;
            return Ok(DetectorHandle {
                detector,
                default_settings: Map::new(),
            });
        }

        Err(LoaderError::NotFound(detector_id.to_string()))
    }
}
