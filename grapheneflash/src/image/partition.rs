//! Partition plan: which image file goes to which partition, in flash order.
//!
//! A factory bundle directory looks like:
//!
//! ```text
//! bootloader-<codename>-<version>.img   wildcard, first lexicographic match
//! radio-<codename>-<version>.img        wildcard, first lexicographic match
//! boot.img  init_boot.img  dtbo.img  vendor_kernel_boot.img
//! pvmfw.img  vendor_boot.img  vbmeta.img
//! super_1.img ... super_<n>.img         ordered by numeric suffix
//! system.img  product.img  vendor.img   only when there is no super split
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Partitions written from the bootloader with no reboot in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorePartition {
    /// Kernel and generic ramdisk.
    Boot,
    /// Generic ramdisk on devices launched with GKI.
    InitBoot,
    /// Device tree overlays.
    Dtbo,
    /// Vendor kernel on newer generations.
    VendorKernelBoot,
    /// Protected VM firmware.
    Pvmfw,
    /// Vendor ramdisk.
    VendorBoot,
    /// Verified boot metadata, always last.
    Vbmeta,
}

impl CorePartition {
    /// Protocol-mandated write order.
    pub const FLASH_ORDER: [Self; 7] = [
        Self::Boot,
        Self::InitBoot,
        Self::Dtbo,
        Self::VendorKernelBoot,
        Self::Pvmfw,
        Self::VendorBoot,
        Self::Vbmeta,
    ];

    /// Partition name as fastboot knows it.
    pub fn name(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::InitBoot => "init_boot",
            Self::Dtbo => "dtbo",
            Self::VendorKernelBoot => "vendor_kernel_boot",
            Self::Pvmfw => "pvmfw",
            Self::VendorBoot => "vendor_boot",
            Self::Vbmeta => "vbmeta",
        }
    }

    /// Image file name inside the bundle.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Boot => "boot.img",
            Self::InitBoot => "init_boot.img",
            Self::Dtbo => "dtbo.img",
            Self::VendorKernelBoot => "vendor_kernel_boot.img",
            Self::Pvmfw => "pvmfw.img",
            Self::VendorBoot => "vendor_boot.img",
            Self::Vbmeta => "vbmeta.img",
        }
    }

    /// Whether every supported device generation ships this image.
    pub fn is_required(self) -> bool {
        matches!(
            self,
            Self::Boot | Self::Dtbo | Self::VendorBoot | Self::Vbmeta
        )
    }
}

impl fmt::Display for CorePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical partitions flashed one by one when a bundle has no super split.
pub const LOGICAL_FALLBACK: [&str; 3] = ["system", "product", "vendor"];

/// Images written from userspace fastbootd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicImages {
    /// `super_<n>.img` chunks, ascending by `n`, all written to `super`.
    Super(Vec<PathBuf>),
    /// Individual `system`, `product`, `vendor` images.
    Logical(Vec<(&'static str, PathBuf)>),
}

impl DynamicImages {
    /// Number of flash commands needed.
    pub fn len(&self) -> usize {
        match self {
            Self::Super(images) => images.len(),
            Self::Logical(images) => images.len(),
        }
    }

    /// Whether there is nothing to flash.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(partition, image)` pairs in write order.
    pub fn iter(&self) -> Vec<(&str, &Path)> {
        match self {
            Self::Super(images) => images.iter().map(|p| ("super", p.as_path())).collect(),
            Self::Logical(images) => images.iter().map(|(n, p)| (*n, p.as_path())).collect(),
        }
    }
}

/// Classified contents of one bundle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Directory the images live in.
    pub dir: PathBuf,
    /// Bootloader image, if shipped.
    pub bootloader: Option<PathBuf>,
    /// Baseband image, if shipped.
    pub radio: Option<PathBuf>,
    /// Core partitions present, in [`CorePartition::FLASH_ORDER`].
    pub core: Vec<(CorePartition, PathBuf)>,
    /// fastbootd images.
    pub dynamic: DynamicImages,
}

impl PartitionPlan {
    /// Classify the images in `dir` for device `codename`.
    ///
    /// Fails with [`Error::BundleResolutionFailed`] unless the required core
    /// images and either a super split or the full logical fallback set are
    /// present.
    pub fn discover(dir: &Path, codename: &str) -> Result<Self> {
        let names = image_names(dir)?;
        let has = |name: &str| names.iter().any(|n| n == name);

        let bootloader = first_wildcard(&names, &format!("bootloader-{codename}-")).map(|n| dir.join(n));
        let radio = first_wildcard(&names, &format!("radio-{codename}-")).map(|n| dir.join(n));
        if bootloader.is_none() {
            warn!("No bootloader-{codename}-*.img in {}", dir.display());
        }
        if radio.is_none() {
            debug!("No radio-{codename}-*.img in {}", dir.display());
        }

        let mut missing = Vec::new();
        let mut core = Vec::new();
        for partition in CorePartition::FLASH_ORDER {
            if has(partition.file_name()) {
                core.push((partition, dir.join(partition.file_name())));
            } else if partition.is_required() {
                missing.push(partition.file_name().to_string());
            }
        }

        let supers = super_images(&names);
        let dynamic = if !supers.is_empty() {
            DynamicImages::Super(supers.into_iter().map(|n| dir.join(n)).collect())
        } else if LOGICAL_FALLBACK.iter().all(|p| has(&format!("{p}.img"))) {
            DynamicImages::Logical(
                LOGICAL_FALLBACK
                    .iter()
                    .map(|p| (*p, dir.join(format!("{p}.img"))))
                    .collect(),
            )
        } else {
            missing.push("super_*.img (or system.img, product.img, vendor.img)".to_string());
            DynamicImages::Super(Vec::new())
        };

        if !missing.is_empty() {
            return Err(Error::BundleResolutionFailed(format!(
                "{} is missing {}",
                dir.display(),
                missing.join(", ")
            )));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            bootloader,
            radio,
            core,
            dynamic,
        })
    }

    /// Image files for partition `name` (several for `super`).
    pub fn files(&self, name: &str) -> Vec<&Path> {
        self.entries()
            .into_iter()
            .filter(|(n, _)| *n == name)
            .flat_map(|(_, files)| files)
            .collect()
    }

    /// Partition name to image files, in the order they will be written.
    pub fn entries(&self) -> Vec<(&str, Vec<&Path>)> {
        let mut entries = Vec::new();
        if let Some(path) = &self.bootloader {
            entries.push(("bootloader", vec![path.as_path()]));
        }
        if let Some(path) = &self.radio {
            entries.push(("radio", vec![path.as_path()]));
        }
        for (partition, path) in &self.core {
            entries.push((partition.name(), vec![path.as_path()]));
        }
        match &self.dynamic {
            DynamicImages::Super(images) => {
                entries.push(("super", images.iter().map(PathBuf::as_path).collect()));
            },
            DynamicImages::Logical(images) => {
                for (name, path) in images {
                    entries.push((*name, vec![path.as_path()]));
                }
            },
        }
        entries
    }

    /// Total number of flash commands the plan needs.
    pub fn flash_count(&self) -> usize {
        usize::from(self.bootloader.is_some())
            + usize::from(self.radio.is_some())
            + self.core.len()
            + self.dynamic.len()
    }
}

fn image_names(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::BundleResolutionFailed(format!("cannot read {}: {e}", dir.display()))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn first_wildcard<'a>(names: &'a [String], prefix: &str) -> Option<&'a str> {
    // `names` is sorted, so the first hit is the lexicographic minimum.
    names
        .iter()
        .map(String::as_str)
        .find(|n| n.starts_with(prefix) && n.ends_with(".img"))
}

fn super_images(names: &[String]) -> Vec<&str> {
    let mut indexed: Vec<(u32, &str)> = names
        .iter()
        .filter_map(|name| {
            let index = name.strip_prefix("super_")?.strip_suffix(".img")?;
            match index.parse::<u32>() {
                Ok(index) => Some((index, name.as_str())),
                Err(_) => {
                    warn!("Ignoring {name}: suffix is not a number");
                    None
                },
            }
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, name)| name).collect()
}
