//! # grapheneflash
//!
//! A library for installing GrapheneOS factory images over adb and fastboot.
//!
//! Flashing a phone is a sequence of reboots: the device leaves adb, shows up
//! in the bootloader, disconnects again after every bootloader/radio update,
//! and finally re-enumerates as userspace fastbootd for the dynamic
//! partitions. This crate drives that sequence as an explicit state machine:
//!
//! - [`FlashStateMachine`] runs the phases and reports progress
//! - [`Transport`] executes adb/fastboot commands against one device
//! - [`BuildManager`] turns a codename and version into a [`PartitionPlan`]
//!
//! ## Features
//!
//! - `native` (default): [`ProcessTransport`], spawning the host tools
//! - `serde`: Serialization support for events and listings
//!
//! ## Example
//!
//! ```rust,no_run
//! use grapheneflash::{
//!     FlashOptions, FlashRequest, FlashStateMachine, LocalBuildManager, NullObserver,
//!     ProcessTransport,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = ProcessTransport::new("adb", "fastboot").with_serial("28A1KXYZ");
//!     let builds = LocalBuildManager::new("bundles");
//!
//!     let mut fsm = FlashStateMachine::new(transport, builds)
//!         .with_options(FlashOptions::default().with_verify_codename(true));
//!
//!     let request = FlashRequest::new("panther").with_skip_unlock(true);
//!     fsm.execute_flash(&request, &mut NullObserver).into_result()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod flasher;
pub mod host;
pub mod image;
pub mod job;
pub mod port;
pub mod protocol;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::ProcessTransport;
pub use {
    device::{DetectedDevice, DeviceMode, discover_devices, identify_codename, known_codenames, model_name},
    error::{Error, Result},
    flasher::{
        ChannelObserver, FlashEvent, FlashObserver, FlashOptions, FlashOutcome, FlashProgress,
        FlashRequest, FlashState, FlashStateMachine, FlashTimeouts, LogLevel, NullObserver,
    },
    host::{check_tool, default_tool_path},
    image::{
        BuildManager, BundleDownloader, BundleInfo, CorePartition, DynamicImages,
        LocalBuildManager, PartitionPlan, index_bundles,
    },
    job::{CancelToken, FlashJob, InMemoryJobStore, JobId, JobObserver, JobStatus, JobStore},
    port::{CommandResult, PollConfig, PollOutcome, Transport},
};
