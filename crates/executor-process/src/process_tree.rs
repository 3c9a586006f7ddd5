//! Termination of a whole process tree.
//!
//! Every launched process leads its own process group, so signalling the
//! group reaches every descendant that did not detach into a new session.

use command_group::AsyncGroupChild;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// True while any member of the group still exists.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists.
    if unsafe { libc::killpg(pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Ask the tree to stop, then force it once `grace` runs out.
///
/// Returns true when everything exited within the grace period.
pub async fn terminate_tree(child: &mut AsyncGroupChild, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    let pgid = child.id();

    #[cfg(unix)]
    {
        use command_group::{Signal, UnixChildExt};
        if let Err(e) = child.signal(Signal::SIGTERM) {
            debug!(?pgid, error = %e, "SIGTERM to process group failed");
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        debug!(?pgid, error = %e, "Stopping process group failed");
    }

    let leader_exited = tokio::time::timeout_at(deadline, child.wait()).await.is_ok();
    let graceful = leader_exited && wait_for_group_exit(pgid, deadline).await;
    if graceful {
        return true;
    }

    warn!(?pgid, grace = ?grace, "Process tree ignored termination; killing");
    if let Err(e) = child.kill().await {
        debug!(?pgid, error = %e, "Killing process group failed");
    }
    false
}

async fn wait_for_group_exit(pgid: Option<u32>, deadline: Instant) -> bool {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        while group_alive(pgid) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
    #[cfg(not(unix))]
    let _ = (pgid, deadline);
    true
}
