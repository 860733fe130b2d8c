//! Process-backed transport using the host `adb` and `fastboot` binaries.
//!
//! Every invocation gets a hard deadline: the child is killed when it
//! outlives its timeout, so a wedged USB stack can never hang a job.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use wait_timeout::ChildExt;

use crate::error::Result;
use crate::host;
use crate::job::CancelToken;
use crate::port::poll::{PollConfig, poll_until};
use crate::port::{CommandResult, Transport};
use crate::protocol::fastboot;

/// Transport that shells out to adb/fastboot, optionally pinned to a serial.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    adb: PathBuf,
    fastboot: PathBuf,
    serial: Option<String>,
    poll: PollConfig,
    cancel: CancelToken,
}

impl ProcessTransport {
    /// Create a transport using the given tool paths.
    pub fn new(adb: impl Into<PathBuf>, fastboot: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            fastboot: fastboot.into(),
            serial: None,
            poll: PollConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Pin every command to `serial` (`-s <serial>`).
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Set presence polling timing.
    #[must_use]
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Stop waits early when `cancel` fires.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Configured adb path.
    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    /// Configured fastboot path.
    pub fn fastboot_path(&self) -> &Path {
        &self.fastboot
    }

    fn run(&self, program: &Path, args: &[&str], timeout: Duration) -> CommandResult {
        let mut cmd = Command::new(program);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);

        debug!("$ {} {}", program.display(), args.join(" "));

        match output_with_timeout(&mut cmd, timeout) {
            Ok(Some(output)) => {
                let result = CommandResult {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    return_code: output.status.code().unwrap_or(-1),
                };
                trace!(
                    "exit {} stdout={:?} stderr={:?}",
                    result.return_code, result.stdout, result.stderr
                );
                result
            },
            Ok(None) => CommandResult::failed(
                -1,
                format!(
                    "{} timed out after {}s",
                    program.display(),
                    timeout.as_secs()
                ),
            ),
            Err(e) => CommandResult::failed(-1, format!("failed to run {}: {e}", program.display())),
        }
    }
}

impl Transport for ProcessTransport {
    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn check_tools(&mut self) -> Result<()> {
        let adb = host::check_tool(&self.adb)?;
        debug!("adb: {adb}");
        let fastboot = host::check_tool(&self.fastboot)?;
        debug!("fastboot: {fastboot}");
        Ok(())
    }

    fn adb_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        self.run(&self.adb, args, timeout)
    }

    fn fastboot_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        self.run(&self.fastboot, args, timeout)
    }

    fn fastbootd_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        // Same binary; the device side decides which fastboot implementation answers.
        self.run(&self.fastboot, args, timeout)
    }

    fn wait_for_fastboot(&mut self, timeout: Duration) -> bool {
        debug!("Waiting up to {}s for fastboot mode", timeout.as_secs());
        let query_timeout = self.poll.query_timeout;
        // `fastboot devices` must not carry `-s`, so list unpinned and match here.
        let listing = Self {
            serial: None,
            ..self.clone()
        };
        let serial = self.serial.clone();

        poll_until(timeout, self.poll.interval, &self.cancel, || {
            let result = listing.run(&listing.fastboot, fastboot::DEVICES, query_timeout);
            result.success && fastboot::lists_fastboot_device(&result.stdout, serial.as_deref())
        })
        .is_ready()
    }

    fn wait_for_fastbootd(&mut self, timeout: Duration) -> bool {
        debug!("Waiting up to {}s for fastbootd", timeout.as_secs());
        let query_timeout = self.poll.query_timeout;

        poll_until(timeout, self.poll.interval, &self.cancel, || {
            let result = self.run(
                &self.fastboot,
                &fastboot::getvar_args(fastboot::VAR_IS_USERSPACE),
                query_timeout,
            );
            fastboot::reports_userspace(&result.output())
        })
        .is_ready()
    }
}

/// Run `cmd` with piped output, killing it after `timeout`.
///
/// Returns `Ok(None)` on timeout. On unix the child leads its own process
/// group, so a timeout also takes down anything it spawned. Output readers
/// are never awaited past the deadline (plus [`PIPE_GRACE`] once the child
/// has exited), even when a detached descendant still holds the pipes.
pub fn output_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<Option<Output>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(child.stdout.take(), Stream::Stdout, tx.clone());
    spawn_reader(child.stderr.take(), Stream::Stderr, tx);

    let Some(status) = child.wait_timeout(timeout)? else {
        kill_process_group(&child);
        let _ = child.kill();
        let _ = child.wait();
        return Ok(None);
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for _ in 0..2 {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .max(PIPE_GRACE);
        match rx.recv_timeout(wait) {
            Ok((Stream::Stdout, buf)) => stdout = buf,
            Ok((Stream::Stderr, buf)) => stderr = buf,
            Err(_) => {
                debug!("Output pipes still open after exit; returning partial output");
                break;
            },
        }
    }

    Ok(Some(Output {
        status,
        stdout,
        stderr,
    }))
}

/// How long to wait for pipe EOF after the child itself has exited.
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Option<R>,
    which: Stream,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        // Receiver is gone once the caller stopped waiting.
        let _ = tx.send((which, buf));
    });
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid targets the group
    // created by `process_group(0)`, whose id equals the child's pid.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        trace!("killpg({pgid}) failed: {}", io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}
