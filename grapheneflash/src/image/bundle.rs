//! Locating factory bundles on disk.
//!
//! Bundles are stored as `<root>/<codename>/<version>/`. Extracted factory
//! zips usually add one more level, `<codename>-install-<version>/`, which is
//! where the images actually live. Versions are `YYYYMMDDNN` build numbers,
//! so the lexicographically greatest directory name is the newest build.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::image::partition::PartitionPlan;

/// Resolves a device codename and build version to flashable images.
pub trait BuildManager {
    /// Make sure the bundle exists locally and return its image directory.
    ///
    /// With no `version`, the newest available build is used.
    fn ensure_bundle_available(&mut self, codename: &str, version: Option<&str>) -> Result<PathBuf>;

    /// Classify the images in `bundle_path` for `codename`.
    fn find_partition_files(&self, bundle_path: &Path, codename: &str) -> Result<PartitionPlan> {
        PartitionPlan::discover(bundle_path, codename)
    }
}

impl<B: BuildManager + ?Sized> BuildManager for &mut B {
    fn ensure_bundle_available(&mut self, codename: &str, version: Option<&str>) -> Result<PathBuf> {
        (**self).ensure_bundle_available(codename, version)
    }

    fn find_partition_files(&self, bundle_path: &Path, codename: &str) -> Result<PartitionPlan> {
        (**self).find_partition_files(bundle_path, codename)
    }
}

impl<B: BuildManager + ?Sized> BuildManager for Box<B> {
    fn ensure_bundle_available(&mut self, codename: &str, version: Option<&str>) -> Result<PathBuf> {
        (**self).ensure_bundle_available(codename, version)
    }

    fn find_partition_files(&self, bundle_path: &Path, codename: &str) -> Result<PartitionPlan> {
        (**self).find_partition_files(bundle_path, codename)
    }
}

/// Fetches a missing bundle into the local store.
///
/// Implementations download, verify and extract under `root` and return the
/// version directory they populated.
pub trait BundleDownloader {
    /// Fetch `codename` at `version` (newest when `None`).
    fn download(&mut self, root: &Path, codename: &str, version: Option<&str>) -> Result<PathBuf>;
}

impl<F> BundleDownloader for F
where
    F: FnMut(&Path, &str, Option<&str>) -> Result<PathBuf>,
{
    fn download(&mut self, root: &Path, codename: &str, version: Option<&str>) -> Result<PathBuf> {
        self(root, codename, version)
    }
}

/// One bundle present in the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BundleInfo {
    /// Device codename.
    pub codename: String,
    /// Build version.
    pub version: String,
    /// Directory holding the images.
    pub path: PathBuf,
}

/// [`BuildManager`] over a directory tree of extracted bundles.
pub struct LocalBuildManager {
    root: PathBuf,
    downloader: Option<Box<dyn BundleDownloader + Send>>,
}

impl LocalBuildManager {
    /// Use bundles stored under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloader: None,
        }
    }

    /// Fetch missing bundles through `downloader`.
    #[must_use]
    pub fn with_downloader(mut self, downloader: impl BundleDownloader + Send + 'static) -> Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image directory for a bundle already on disk.
    pub fn resolve(&self, codename: &str, version: Option<&str>) -> Result<Option<PathBuf>> {
        validate_component("codename", codename)?;
        let codename_dir = self.root.join(codename);

        let version = match version {
            Some(v) => {
                validate_component("version", v)?;
                v.to_string()
            },
            None => match latest_version(&codename_dir) {
                Some(v) => v,
                None => return Ok(None),
            },
        };

        let version_dir = codename_dir.join(&version);
        if !version_dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(find_install_dir(&version_dir)))
    }
}

impl BuildManager for LocalBuildManager {
    fn ensure_bundle_available(&mut self, codename: &str, version: Option<&str>) -> Result<PathBuf> {
        if let Some(path) = self.resolve(codename, version)? {
            info!("Using bundle {}", path.display());
            return Ok(path);
        }

        let wanted = version.unwrap_or("latest");
        let Some(downloader) = self.downloader.as_mut() else {
            return Err(Error::BundleResolutionFailed(format!(
                "no {codename} bundle ({wanted}) under {}",
                self.root.display()
            )));
        };

        info!("Bundle {codename} ({wanted}) not found locally, downloading");
        let version_dir = downloader.download(&self.root, codename, version)?;
        let path = find_install_dir(&version_dir);
        info!("Using bundle {}", path.display());
        Ok(path)
    }
}

/// Reject names that would escape the store root.
fn validate_component(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.contains("..");
    if bad {
        return Err(Error::BundleResolutionFailed(format!("invalid {what}: {value:?}")));
    }
    Ok(())
}

fn visible_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<_> = entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            (!name.starts_with('.')).then(|| (name, e.path()))
        })
        .collect();
    dirs.sort();
    dirs
}

/// Newest version directory under `codename_dir`, skipping hidden entries.
pub fn latest_version(codename_dir: &Path) -> Option<String> {
    visible_dirs(codename_dir).pop().map(|(name, _)| name)
}

/// Whether `dir` directly holds `boot.img` or a `bootloader-*.img`.
pub fn has_flashable_images(dir: &Path) -> bool {
    if dir.join("boot.img").is_file() {
        return true;
    }
    fs::read_dir(dir).is_ok_and(|entries| {
        entries.filter_map(std::result::Result::ok).any(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("bootloader-") && n.ends_with(".img"))
        })
    })
}

/// Directory inside a version directory that holds the images.
///
/// The version directory itself when it has images, else the first
/// `*-install-*` child that does, else the version directory.
pub fn find_install_dir(version_dir: &Path) -> PathBuf {
    if has_flashable_images(version_dir) {
        return version_dir.to_path_buf();
    }

    visible_dirs(version_dir)
        .into_iter()
        .filter(|(name, _)| name.contains("-install-"))
        .map(|(_, path)| path)
        .find(|path| has_flashable_images(path))
        .unwrap_or_else(|| version_dir.to_path_buf())
}

/// List every flashable bundle under `root`, newest first per codename.
///
/// A missing root is an empty store.
pub fn index_bundles(root: &Path) -> Vec<BundleInfo> {
    let mut bundles = Vec::new();

    for (codename, codename_dir) in visible_dirs(root) {
        let mut versions = visible_dirs(&codename_dir);
        versions.reverse();
        for (version, version_dir) in versions {
            let path = find_install_dir(&version_dir);
            if has_flashable_images(&path) {
                bundles.push(BundleInfo {
                    codename: codename.clone(),
                    version,
                    path,
                });
            } else {
                debug!("Skipping {}: no images", version_dir.display());
            }
        }
    }

    bundles
}
