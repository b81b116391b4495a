//! Child-process helpers shared across the workspace.
//!
//! Download engines spawn long-running external tools. These helpers keep the
//! spawning conventions in one place (no console window on Windows, killed on
//! drop) and make sure a terminated process is actually reaped before callers
//! report back.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a `tokio::process::Command` for a supervised child.
///
/// The child gets no console window on Windows and is killed if its handle is
/// dropped before it was reaped, so an aborted task never leaks a process.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window().kill_on_drop(true);
    cmd
}

#[cfg(feature = "tokio")]
mod reap {
    use std::io;
    use std::process::ExitStatus;
    use std::time::Duration;

    use tokio::process::Child;
    use tracing::{debug, warn};

    /// Forcibly terminate `child` and wait up to `grace` for the OS to reap it.
    ///
    /// Returns `Ok(Some(status))` once the process is gone, or `Ok(None)` if it
    /// was still around after the grace period. A child that already exited is
    /// reaped without sending a signal.
    pub async fn kill_and_reap(
        child: &mut Child,
        grace: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        let pid = child.id();
        match child.start_kill() {
            Ok(()) => debug!(?pid, "sent kill to child process"),
            // Raced with a natural exit.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                warn!(?pid, grace = ?grace, "child process not reaped within grace period");
                Ok(None)
            }
        }
    }

    /// Human-readable description of an exit status for error messages.
    pub fn describe_exit(status: &ExitStatus) -> String {
        match status.code() {
            Some(code) => format!("exit code {code}"),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return format!("terminated by signal {signal}");
                    }
                }
                "terminated without exit code".to_string()
            }
        }
    }
}

#[cfg(feature = "tokio")]
pub use reap::{describe_exit, kill_and_reap};
