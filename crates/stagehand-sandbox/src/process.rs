//! Child process termination: SIGTERM, a grace period, then SIGKILL.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::debug;

/// Stop `child`, signalling its whole process group when `group` is set
/// (the child must then have been spawned as a group leader).
pub async fn terminate(child: &mut Child, grace: Duration, group: bool) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let Some(raw_pid) = child.id() else {
        return child.wait().await;
    };
    let pid = Pid::from_raw(raw_pid as i32);

    send(pid, Signal::SIGTERM, group)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // Reap stragglers left in the group by a shell that exited first.
            if group {
                send(pid, Signal::SIGKILL, true)?;
            }
            status
        }
        Err(_) => {
            debug!(pid = raw_pid, grace_ms = grace.as_millis() as u64, "grace period over, sending SIGKILL");
            send(pid, Signal::SIGKILL, group)?;
            child.wait().await
        }
    }
}

fn send(pid: Pid, signal: Signal, group: bool) -> io::Result<()> {
    let result = if group {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use anyhow::Result;
    use tokio::process::Command;

    use super::*;

    #[tokio::test]
    async fn sigterm_stops_a_cooperative_process() -> Result<()> {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let status = terminate(&mut child, Duration::from_secs(5), false).await?;
        assert!(!status.success());
        Ok(())
    }

    #[tokio::test]
    async fn sigkill_follows_when_sigterm_is_ignored() -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        let status = terminate(&mut child, Duration::from_millis(200), true).await?;
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn exited_children_are_left_alone() -> Result<()> {
        let mut child = Command::new("true").spawn()?;
        child.wait().await?;
        let status = terminate(&mut child, Duration::from_millis(10), false).await?;
        assert!(status.success());
        Ok(())
    }
}
