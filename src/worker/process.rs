//! Process-tree plumbing for worker sessions.
//!
//! Every worker is spawned as the leader of its own process group so the
//! whole tree (shells, test runners, sub-agents) can be signalled as a unit.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Interval between liveness probes while waiting for a tree to disappear.
const PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// Make the spawned process lead a new process group.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Option<nix::sys::signal::Signal>) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    // pgid 0 or 1 would address our own group or init
    if pid <= 1 {
        return false;
    }
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            debug!(pid, error = %e, "killpg failed");
            false
        }
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> bool {
    let pid_arg = pid.to_string();
    let mut args = vec!["/T"];
    if force {
        args.push("/F");
    }
    args.extend(["/PID", pid_arg.as_str()]);
    match std::process::Command::new("taskkill").args(&args).output() {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!(pid, error = %e, "taskkill failed");
            false
        }
    }
}

/// Ask the whole tree to exit.
pub fn request_tree_exit(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pid, Some(nix::sys::signal::Signal::SIGTERM))
    }
    #[cfg(windows)]
    {
        taskkill(pid, false)
    }
}

/// Kill the whole tree immediately. Safe to call on an already-dead tree.
pub fn kill_tree_now(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pid, Some(nix::sys::signal::Signal::SIGKILL))
    }
    #[cfg(windows)]
    {
        taskkill(pid, true)
    }
}

/// Whether any member of the tree can still be signalled.
pub fn tree_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_group(pid, None)
    }
    #[cfg(windows)]
    {
        let filter = format!("PID eq {}", pid);
        std::process::Command::new("tasklist")
            .args(["/FI", filter.as_str(), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

/// Terminate a worker and everything it spawned.
///
/// Graceful request first, then up to `grace` for the leader to exit, then a
/// forced kill of the tree. Returns once the leader has been reaped and the
/// group has stopped answering signals (bounded by `grace`).
pub async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) -> Option<ExitStatus> {
    request_tree_exit(pid);

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            debug!(pid, error = %e, "wait after SIGTERM failed");
            None
        }
        Err(_) => {
            debug!(pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, force killing");
            None
        }
    };

    // Descendants may outlive a leader that exited on SIGTERM
    kill_tree_now(pid);

    let status = match status {
        Some(status) => Some(status),
        None => child.wait().await.ok(),
    };

    wait_for_tree_exit(pid, grace).await;
    status
}

/// Reap lingering group members after the leader exited on its own.
pub async fn reap_tree(pid: u32, grace: Duration) {
    if kill_tree_now(pid) {
        debug!(pid, "killed leftover processes in worker group");
        wait_for_tree_exit(pid, grace).await;
    }
}

async fn wait_for_tree_exit(pid: u32, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while tree_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            // Zombies awaiting their new parent still answer signal 0
            debug!(pid, "process group still answering after kill");
            return;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn test_refuses_to_signal_own_group() {
        assert!(!kill_tree_now(0));
        assert!(!tree_alive(1));
    }

    #[tokio::test]
    async fn test_terminate_tree_kills_leader() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(tree_alive(pid));

        let status = terminate_tree(&mut child, pid, Duration::from_secs(2)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_tree_escalates_when_term_is_ignored() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap '' TERM; sleep 30 & wait"])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let status = terminate_tree(&mut child, pid, Duration::from_millis(300)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
