//! End-to-end runs of the flash state machine against a scripted transport.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use grapheneflash::{
    CancelToken, CommandResult, Error, FlashObserver, FlashOptions, FlashProgress, FlashRequest,
    FlashState, FlashStateMachine, FlashTimeouts, InMemoryJobStore, JobObserver, JobStatus,
    JobStore, LocalBuildManager, LogLevel, NullObserver, Result, Transport,
};
use tempfile::TempDir;

/// Transport that records every call and answers from a script.
///
/// Calls are recorded as `"<tool> <args...>"` where tool is `adb`,
/// `fastboot` or `fastbootd`. Unscripted commands succeed with no output.
#[derive(Default)]
struct ScriptedTransport {
    calls: Vec<String>,
    rules: Vec<(String, VecDeque<CommandResult>)>,
    fastboot_never_appears: bool,
    fastbootd_never_appears: bool,
    tools_missing: bool,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `results`, in order.
    /// The last result repeats.
    fn respond(mut self, prefix: &str, results: Vec<CommandResult>) -> Self {
        self.rules.push((prefix.to_string(), results.into()));
        self
    }

    fn fail(self, prefix: &str) -> Self {
        self.respond(prefix, vec![CommandResult::failed(1, "FAILED (remote: 'failure')")])
    }

    fn answer(&mut self, call: String) -> CommandResult {
        let result = self
            .rules
            .iter_mut()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            })
            .unwrap_or_else(|| CommandResult::ok(""));
        self.calls.push(call);
        result
    }

    fn calls_matching(&self, needle: &str) -> Vec<&str> {
        self.calls
            .iter()
            .map(String::as_str)
            .filter(|c| c.contains(needle))
            .collect()
    }

    /// Partition names passed to `flash`, in order.
    fn flashed(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| {
                let mut words = c.split_whitespace();
                let _tool = words.next()?;
                (words.next()? == "flash").then(|| {
                    let partition = words.next().unwrap_or_default();
                    let image = Path::new(words.next().unwrap_or_default());
                    format!(
                        "{partition}:{}",
                        image.file_name().unwrap().to_string_lossy()
                    )
                })
            })
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn serial(&self) -> Option<&str> {
        Some("28A1KXYZ")
    }

    fn check_tools(&mut self) -> Result<()> {
        if self.tools_missing {
            return Err(Error::ToolUnavailable {
                tool: "fastboot".into(),
                reason: "not found".into(),
            });
        }
        Ok(())
    }

    fn adb_command(&mut self, args: &[&str], _timeout: Duration) -> CommandResult {
        self.answer(format!("adb {}", args.join(" ")))
    }

    fn fastboot_command(&mut self, args: &[&str], _timeout: Duration) -> CommandResult {
        self.answer(format!("fastboot {}", args.join(" ")))
    }

    fn fastbootd_command(&mut self, args: &[&str], _timeout: Duration) -> CommandResult {
        self.answer(format!("fastbootd {}", args.join(" ")))
    }

    fn wait_for_fastboot(&mut self, _timeout: Duration) -> bool {
        self.calls.push("wait fastboot".into());
        !self.fastboot_never_appears
    }

    fn wait_for_fastbootd(&mut self, _timeout: Duration) -> bool {
        self.calls.push("wait fastbootd".into());
        !self.fastbootd_never_appears
    }
}

/// Records everything it is told.
#[derive(Default)]
struct RecordingObserver {
    progress: Vec<FlashProgress>,
    logs: Vec<(String, LogLevel)>,
    cancel_after_flashed: Option<(String, CancelToken)>,
}

impl FlashObserver for RecordingObserver {
    fn on_progress(&mut self, progress: &FlashProgress) {
        if let Some((partition, token)) = &self.cancel_after_flashed {
            if progress.message == format!("Flashed {partition}") {
                token.cancel();
            }
        }
        self.progress.push(progress.clone());
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        self.logs.push((message.to_string(), level));
    }
}

const PANTHER_IMAGES: &[&str] = &[
    "bootloader-panther-cloudripper-16.0-12345.img",
    "radio-panther-g5300q-250909.img",
    "boot.img",
    "vendor_boot.img",
    "dtbo.img",
    "vbmeta.img",
    "super_1.img",
    "super_2.img",
];

/// Store root with one panther bundle in the install-subdirectory layout.
fn bundle_store(images: &[&str]) -> (TempDir, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let install = root
        .path()
        .join("panther/2025020300/panther-install-2025020300");
    fs::create_dir_all(&install).unwrap();
    for image in images {
        File::create(install.join(image)).unwrap();
    }
    (root, install)
}

fn fast_options() -> FlashOptions {
    FlashOptions::default().with_timeouts(FlashTimeouts {
        unlock_confirm: Duration::from_millis(50),
        unlock_poll_interval: Duration::from_millis(1),
        reboot_settle: Duration::ZERO,
        ..FlashTimeouts::default()
    })
}

fn machine(
    transport: ScriptedTransport,
    root: &Path,
) -> FlashStateMachine<ScriptedTransport, LocalBuildManager> {
    FlashStateMachine::new(transport, LocalBuildManager::new(root)).with_options(fast_options())
}

fn skip_unlock() -> FlashRequest {
    FlashRequest::new("panther").with_skip_unlock(true)
}

#[test]
fn test_panther_end_to_end() {
    let (root, install) = bundle_store(PANTHER_IMAGES);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.final_state, FlashState::Done);
    assert_eq!(outcome.bundle_path.as_deref(), Some(install.as_path()));
    assert_eq!(
        fsm.history(),
        [
            FlashState::Init,
            FlashState::Fastboot,
            FlashState::FastbootFlash,
            FlashState::Fastbootd,
            FlashState::FastbootdFlash,
            FlashState::Final,
            FlashState::Done,
        ]
    );

    let transport = fsm.transport();
    let reboot_fastbootd = transport
        .calls
        .iter()
        .position(|c| c == "fastboot reboot fastboot")
        .expect("reboot fastboot issued");
    let reboots_before = transport.calls[..reboot_fastbootd]
        .iter()
        .filter(|c| *c == "fastboot reboot-bootloader")
        .count();
    assert_eq!(reboots_before, 2);

    assert_eq!(
        transport.flashed(),
        [
            "bootloader:bootloader-panther-cloudripper-16.0-12345.img",
            "radio:radio-panther-g5300q-250909.img",
            "boot:boot.img",
            "dtbo:dtbo.img",
            "vendor_boot:vendor_boot.img",
            "vbmeta:vbmeta.img",
            "super:super_1.img",
            "super:super_2.img",
        ]
    );
    assert!(transport.calls_matching("fastbootd flash super").len() == 2);
    assert_eq!(transport.calls.last().map(String::as_str), Some("fastbootd reboot"));
}

#[test]
fn test_no_reboot_between_core_partitions() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    assert!(fsm.execute_flash(&skip_unlock(), &mut NullObserver).success);

    let calls = &fsm.transport().calls;
    let boot = calls.iter().position(|c| c.starts_with("fastboot flash boot ")).unwrap();
    let vbmeta = calls.iter().position(|c| c.starts_with("fastboot flash vbmeta ")).unwrap();
    assert!(calls[boot..vbmeta].iter().all(|c| !c.contains("reboot")));
}

#[test]
fn test_skip_unlock_issues_no_unlock_commands() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    let transport = fsm.transport();
    assert!(transport.calls_matching("ro.boot.flash.locked").is_empty());
    assert!(transport.calls_matching("flashing unlock").is_empty());
    assert!(transport.calls_matching("getvar unlocked").is_empty());
    assert!(!fsm.history().contains(&FlashState::Adb));
}

#[test]
fn test_super_images_flashed_in_numeric_order() {
    let (root, _) = bundle_store(&[
        "boot.img",
        "vendor_boot.img",
        "dtbo.img",
        "vbmeta.img",
        "super_2.img",
        "super_1.img",
        "super_10.img",
    ]);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    assert!(fsm.execute_flash(&skip_unlock(), &mut NullObserver).success);

    let supers: Vec<_> = fsm
        .transport()
        .flashed()
        .into_iter()
        .filter(|f| f.starts_with("super:"))
        .collect();
    assert_eq!(supers, ["super:super_1.img", "super:super_2.img", "super:super_10.img"]);
}

#[test]
fn test_dtbo_failure_stops_core_sequence() {
    let mut images = PANTHER_IMAGES.to_vec();
    images.extend(["init_boot.img", "vendor_kernel_boot.img", "pvmfw.img"]);
    let (root, _) = bundle_store(&images);
    let transport = ScriptedTransport::new().fail("fastboot flash dtbo ");
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(!outcome.success);
    assert_eq!(outcome.final_state, FlashState::Error);
    assert!(matches!(
        outcome.error,
        Some(Error::CommandFailed { ref command, .. }) if command.starts_with("fastboot flash dtbo")
    ));

    let flashed = fsm.transport().flashed();
    for later in ["vendor_kernel_boot", "pvmfw", "vendor_boot", "vbmeta", "super"] {
        assert!(
            !flashed.iter().any(|f| f.starts_with(&format!("{later}:"))),
            "{later} must not be flashed after dtbo failed: {flashed:?}"
        );
    }
    assert_eq!(fsm.history().last(), Some(&FlashState::Error));
}

#[test]
fn test_fastboot_never_appears() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut transport = ScriptedTransport::new().fail("fastboot getvar product");
    transport.fastboot_never_appears = true;
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert_eq!(outcome.final_state, FlashState::Error);
    let message = outcome.error_message().unwrap();
    assert!(message.contains("fastboot mode"), "{message}");
    assert!(matches!(outcome.error, Some(Error::DeviceTimeout(_))));
    assert!(fsm.transport().flashed().is_empty());
    assert_eq!(fsm.transport().calls_matching("adb reboot bootloader").len(), 1);
}

#[test]
fn test_reconnect_timeout_after_bootloader_flash() {
    struct DropsAfterReboot(ScriptedTransport);

    impl Transport for DropsAfterReboot {
        fn serial(&self) -> Option<&str> {
            None
        }
        fn adb_command(&mut self, args: &[&str], t: Duration) -> CommandResult {
            self.0.adb_command(args, t)
        }
        fn fastboot_command(&mut self, args: &[&str], t: Duration) -> CommandResult {
            self.0.fastboot_command(args, t)
        }
        fn fastbootd_command(&mut self, args: &[&str], t: Duration) -> CommandResult {
            self.0.fastbootd_command(args, t)
        }
        fn wait_for_fastboot(&mut self, _: Duration) -> bool {
            false
        }
        fn wait_for_fastbootd(&mut self, _: Duration) -> bool {
            true
        }
    }

    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut fsm = FlashStateMachine::new(
        DropsAfterReboot(ScriptedTransport::new()),
        LocalBuildManager::new(root.path()),
    )
    .with_options(fast_options());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::DeviceTimeout(_))));
    assert_eq!(
        fsm.transport().0.flashed(),
        ["bootloader:bootloader-panther-cloudripper-16.0-12345.img"]
    );
}

#[test]
fn test_fastbootd_never_appears() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut transport = ScriptedTransport::new();
    transport.fastbootd_never_appears = true;
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::DeviceTimeout(ref m)) if m.contains("fastbootd")));
    assert!(fsm.transport().calls_matching("flash super").is_empty());
    assert_eq!(fsm.history().last(), Some(&FlashState::Error));
    assert!(fsm.history().contains(&FlashState::Fastbootd));
}

#[test]
fn test_unlock_flow_waits_for_confirmation() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1\n")])
        .respond(
            "fastboot getvar unlocked",
            vec![
                CommandResult::ok("").with_stderr("unlocked: no"),
                CommandResult::ok("").with_stderr("unlocked: no"),
                CommandResult::ok("").with_stderr("unlocked: yes"),
            ],
        );
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(fsm.history()[1], FlashState::Adb);
    let transport = fsm.transport();
    assert_eq!(transport.calls_matching("fastboot flashing unlock").len(), 1);
    assert_eq!(transport.calls_matching("getvar unlocked").len(), 3);
}

#[test]
fn test_already_unlocked_device_is_not_unlocked_again() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("0\n")]);
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(outcome.success);
    assert!(fsm.history().contains(&FlashState::Adb));
    assert!(fsm.transport().calls_matching("flashing unlock").is_empty());
}

#[test]
fn test_unlock_denied() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .fail("fastboot flashing unlock");
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::UnlockDenied(_))));
    assert_eq!(outcome.final_state, FlashState::Error);
    assert!(fsm.transport().flashed().is_empty());
}

#[test]
fn test_unlock_timeout_is_terminal() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond(
            "fastboot getvar unlocked",
            vec![CommandResult::ok("").with_stderr("unlocked: no")],
        );
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::UnlockTimeout(_))));
    assert!(fsm.transport().flashed().is_empty());
    assert_eq!(fsm.history(), [FlashState::Init, FlashState::Adb, FlashState::Error]);
}

#[test]
fn test_locked_device_in_adb_is_rebooted_before_unlock() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond("adb shell getprop sys.oem_unlock_allowed", vec![CommandResult::ok("1\n")])
        .respond(
            "fastboot getvar product",
            vec![
                CommandResult::failed(-1, "timed out"),
                CommandResult::ok("").with_stderr("product: panther"),
            ],
        )
        .respond(
            "fastboot getvar unlocked",
            vec![
                CommandResult::failed(-1, "timed out"),
                CommandResult::ok("").with_stderr("unlocked: yes"),
            ],
        );
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(outcome.success, "{:?}", outcome.error);
    let calls = &fsm.transport().calls;
    let reboot = calls.iter().position(|c| c == "adb reboot bootloader").unwrap();
    let unlock = calls.iter().position(|c| c == "fastboot flashing unlock").unwrap();
    assert!(reboot < unlock);
}

#[test]
fn test_oem_unlocking_disabled_stops_before_reboot() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond("adb shell getprop sys.oem_unlock_allowed", vec![CommandResult::ok("0\n")])
        .fail("fastboot getvar product");
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(
        matches!(outcome.error, Some(Error::UnlockDenied(ref m)) if m.contains("OEM unlocking is disabled")),
        "{:?}",
        outcome.error
    );
    let transport = fsm.transport();
    assert!(transport.calls_matching("adb reboot bootloader").is_empty());
    assert!(transport.calls_matching("flashing unlock").is_empty());
    assert_eq!(fsm.history(), [FlashState::Init, FlashState::Adb, FlashState::Error]);
}

#[test]
fn test_unreadable_oem_setting_only_warns() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .fail("adb shell getprop sys.oem_unlock_allowed")
        .respond(
            "fastboot getvar product",
            vec![
                CommandResult::failed(-1, "timed out"),
                CommandResult::ok("").with_stderr("product: panther"),
            ],
        )
        .respond(
            "fastboot getvar unlocked",
            vec![CommandResult::ok("").with_stderr("unlocked: yes")],
        );
    let mut fsm = machine(transport, root.path());
    let mut observer = RecordingObserver::default();

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut observer);

    assert!(outcome.success, "{:?}", outcome.error);
    assert!(observer.logs.iter().any(|(m, level)| {
        *level == LogLevel::Warning && m.contains("Could not read OEM unlocking setting")
    }));
    assert_eq!(fsm.transport().calls_matching("fastboot flashing unlock").len(), 1);
}

#[test]
fn test_bootloader_unlock_rejection_reports_oem_setting() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond(
            "fastboot flashing unlock",
            vec![CommandResult::failed(
                1,
                "FAILED (remote: 'Flashing Unlock is not allowed')\nfastboot: error: Command failed",
            )],
        );
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(
        matches!(outcome.error, Some(Error::UnlockDenied(ref m)) if m.contains("OEM unlocking is disabled")),
        "{:?}",
        outcome.error
    );
    assert!(fsm.transport().calls_matching("getvar unlocked").is_empty());
}

#[test]
fn test_codename_mismatch_is_caught_before_unlock() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond(
            "fastboot getvar product",
            vec![CommandResult::ok("").with_stderr("product: oriole")],
        );
    let mut fsm = FlashStateMachine::new(transport, LocalBuildManager::new(root.path()))
        .with_options(fast_options().with_verify_codename(true));

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);

    assert!(matches!(
        outcome.error,
        Some(Error::DeviceMismatch { ref actual, .. }) if actual == "oriole"
    ));
    assert!(fsm.transport().calls_matching("flashing unlock").is_empty());
    assert_eq!(fsm.history(), [FlashState::Init, FlashState::Adb, FlashState::Error]);
}

#[test]
fn test_codename_verified_once_across_unlock_and_bootloader() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .respond("adb shell getprop ro.boot.flash.locked", vec![CommandResult::ok("1")])
        .respond(
            "fastboot getvar product",
            vec![CommandResult::ok("").with_stderr("product: panther")],
        )
        .respond(
            "fastboot getvar unlocked",
            vec![CommandResult::ok("").with_stderr("unlocked: yes")],
        );
    let mut fsm = FlashStateMachine::new(transport, LocalBuildManager::new(root.path()))
        .with_options(fast_options().with_verify_codename(true));
    let mut observer = RecordingObserver::default();

    let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut observer);

    assert!(outcome.success, "{:?}", outcome.error);
    let checks = observer
        .logs
        .iter()
        .filter(|(m, _)| m == "Device reports panther")
        .count();
    assert_eq!(checks, 1);
    let calls = &fsm.transport().calls;
    let unlock = calls.iter().position(|c| c == "fastboot flashing unlock").unwrap();
    assert!(calls[..unlock].iter().filter(|c| *c == "fastboot getvar product").count() >= 2);
}

#[test]
fn test_codename_mismatch_refuses_to_flash() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new().respond(
        "fastboot getvar product",
        vec![CommandResult::ok("").with_stderr("product: oriole\nFinished. Total time: 0.001s")],
    );
    let mut fsm = FlashStateMachine::new(transport, LocalBuildManager::new(root.path()))
        .with_options(fast_options().with_verify_codename(true));

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    match outcome.error {
        Some(Error::DeviceMismatch { expected, actual }) => {
            assert_eq!(expected, "panther");
            assert_eq!(actual, "oriole");
        },
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(fsm.transport().flashed().is_empty());
}

#[test]
fn test_codename_match_proceeds() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new().respond(
        "fastboot getvar product",
        vec![CommandResult::ok("").with_stderr("product: panther")],
    );
    let mut fsm = FlashStateMachine::new(transport, LocalBuildManager::new(root.path()))
        .with_options(fast_options().with_verify_codename(true));

    assert!(fsm.execute_flash(&skip_unlock(), &mut NullObserver).success);
}

#[test]
fn test_cancel_between_partitions_finishes_current_write() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let cancel = CancelToken::new();
    let mut fsm = machine(ScriptedTransport::new(), root.path()).with_cancel_token(cancel.clone());
    let mut observer = RecordingObserver {
        cancel_after_flashed: Some(("boot".into(), cancel)),
        ..RecordingObserver::default()
    };

    let outcome = fsm.execute_flash(&skip_unlock(), &mut observer);

    assert!(matches!(outcome.error, Some(Error::Cancelled)));
    assert_eq!(outcome.final_state, FlashState::Error);
    let flashed = fsm.transport().flashed();
    assert_eq!(flashed.last().map(String::as_str), Some("boot:boot.img"));
    assert!(!flashed.iter().any(|f| f.starts_with("dtbo:")));
}

#[test]
fn test_missing_bundle_touches_no_device() {
    let root = tempfile::tempdir().unwrap();
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::BundleResolutionFailed(_))));
    assert!(outcome.bundle_path.is_none());
    assert!(fsm.transport().calls.is_empty());
    assert_eq!(fsm.history(), [FlashState::Init, FlashState::Error]);
}

#[test]
fn test_incomplete_bundle_touches_no_device() {
    let (root, _) = bundle_store(&["boot.img", "dtbo.img", "super_1.img"]);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::BundleResolutionFailed(_))));
    assert!(outcome.bundle_path.is_some());
    assert!(fsm.transport().calls.is_empty());
}

#[test]
fn test_missing_tools_fail_in_init() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut transport = ScriptedTransport::new();
    transport.tools_missing = true;
    let mut fsm = machine(transport, root.path());

    let outcome = fsm.execute_flash(&skip_unlock(), &mut NullObserver);

    assert!(matches!(outcome.error, Some(Error::ToolUnavailable { .. })));
    assert!(fsm.transport().calls.is_empty());
}

#[test]
fn test_lock_and_reboot_failures_are_warnings() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let transport = ScriptedTransport::new()
        .fail("fastbootd flashing lock")
        .fail("fastbootd reboot");
    let mut fsm = machine(transport, root.path());
    let mut observer = RecordingObserver::default();

    let outcome = fsm.execute_flash(&skip_unlock().with_lock_bootloader(true), &mut observer);

    assert!(outcome.success);
    assert_eq!(outcome.final_state, FlashState::Done);
    let warnings: Vec<_> = observer
        .logs
        .iter()
        .filter(|(_, level)| *level == LogLevel::Warning)
        .map(|(m, _)| m.as_str())
        .collect();
    assert!(warnings.iter().any(|m| m.contains("lock failed")));
    assert!(warnings.iter().any(|m| m.contains("Reboot failed")));
}

#[test]
fn test_logical_fallback_flashed_from_fastbootd() {
    let (root, _) = bundle_store(&[
        "boot.img",
        "vendor_boot.img",
        "dtbo.img",
        "vbmeta.img",
        "system.img",
        "product.img",
        "vendor.img",
    ]);
    let mut fsm = machine(ScriptedTransport::new(), root.path());

    assert!(fsm.execute_flash(&skip_unlock(), &mut NullObserver).success);

    let dynamic = fsm.transport().calls_matching("fastbootd flash");
    assert_eq!(dynamic.len(), 3);
    assert!(dynamic[0].starts_with("fastbootd flash system "));
    assert!(dynamic[1].starts_with("fastbootd flash product "));
    assert!(dynamic[2].starts_with("fastbootd flash vendor "));
}

#[test]
fn test_progress_events_bracket_every_flash() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut fsm = machine(ScriptedTransport::new(), root.path());
    let mut observer = RecordingObserver::default();

    assert!(fsm.execute_flash(&skip_unlock(), &mut observer).success);

    let flash_calls = fsm.transport().flashed().len();
    let partition_events = observer.progress.iter().filter(|p| p.partition.is_some()).count();
    assert_eq!(partition_events, flash_calls * 2);

    let states: Vec<_> = observer.progress.iter().map(|p| p.state).collect();
    assert!(states.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(states.last(), Some(&FlashState::Done));

    let percents: Vec<_> = observer.progress.iter().map(|p| p.progress_percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let last = observer.progress.last().unwrap();
    assert_eq!(last.log_lines.len(), observer.progress.len());

    let supers: Vec<_> = observer
        .progress
        .iter()
        .filter(|p| p.partition.as_deref() == Some("super"))
        .map(|p| (p.partition_index, p.total_partitions))
        .collect();
    assert_eq!(
        supers,
        [(Some(1), Some(2)), (Some(1), Some(2)), (Some(2), Some(2)), (Some(2), Some(2))]
    );

    // Every transport invocation is logged.
    let commands = observer.logs.iter().filter(|(m, _)| m.starts_with("$ ")).count();
    let invocations = fsm
        .transport()
        .calls
        .iter()
        .filter(|c| !c.starts_with("wait "))
        .count();
    assert_eq!(commands, invocations);
}

#[test]
fn test_every_phase_is_announced() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let mut fsm = machine(ScriptedTransport::new(), root.path());
    let mut observer = RecordingObserver::default();

    assert!(fsm.execute_flash(&skip_unlock(), &mut observer).success);

    for state in fsm.history().iter().filter(|s| **s != FlashState::Init && !s.is_terminal()) {
        let announced = observer
            .progress
            .iter()
            .filter(|p| p.state == *state && p.step_name == state.name())
            .count();
        assert_eq!(announced, 1, "{state}");
        let message = format!("Entering {state} phase");
        assert!(observer.logs.iter().any(|(m, _)| *m == message), "{message}");
    }
}

#[test]
fn test_job_store_tracks_run() {
    let (root, _) = bundle_store(PANTHER_IMAGES);
    let store = InMemoryJobStore::new();
    let job = store.claim("28A1KXYZ").unwrap();
    assert!(store.claim("28A1KXYZ").is_err());

    let mut fsm = machine(ScriptedTransport::new(), root.path()).with_cancel_token(job.cancel_token());
    let outcome = {
        let mut observer = JobObserver::new(&store, job.id(), NullObserver);
        fsm.execute_flash(&skip_unlock(), &mut observer)
    };
    store.finish(job.id(), &outcome);

    assert_eq!(store.status(job.id()), Some(JobStatus::Succeeded));
    assert_eq!(job.status(), JobStatus::Succeeded);
    assert_eq!(store.active_job("28A1KXYZ"), None);
    assert_eq!(store.prune_finished(), 1);
}
