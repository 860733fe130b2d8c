//! Factory bundle handling.

pub mod bundle;
pub mod partition;

// Re-export common types
pub use bundle::{BuildManager, BundleDownloader, BundleInfo, LocalBuildManager, index_bundles};
pub use partition::{CorePartition, DynamicImages, PartitionPlan};
