//! The pinned-thread namespace entry capability.
//!
//! Namespace membership is a per-thread kernel attribute. Any code that
//! enters a VM namespace MUST run on a thread no other task can be scheduled
//! onto, and the original namespace MUST be restored on every exit path.
//! [`with_netns`] makes that rule unforgeable: the closure runs on a
//! dedicated OS thread spawned for the call, and a drop guard restores the
//! original namespace even when the closure panics.
//!
//! Namespace create/delete go through the link-operations capability (they
//! are plain `ip netns` commands in the host namespace); only *entry* needs
//! the setns machinery here.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};

use crate::error::{Error, Result};

const NETNS_DIR: &str = "/run/netns";

/// Path of a named namespace's bind-mount handle.
pub fn namespace_path(name: &str) -> PathBuf {
    Path::new(NETNS_DIR).join(name)
}

/// Whether a named namespace handle exists on this host.
pub fn namespace_exists(name: &str) -> bool {
    namespace_path(name).exists()
}

/// Restores the saved namespace when dropped, covering error and panic
/// paths alike.
struct NetnsRestoreGuard {
    original: File,
}

impl Drop for NetnsRestoreGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // The thread is dedicated and about to die, so a failed restore
            // cannot leak into other tasks, but it is still worth a trace.
            tracing::error!(error = %e, "failed to restore original network namespace");
        }
    }
}

fn open_current_netns() -> Result<File> {
    File::open("/proc/self/ns/net").map_err(|e| Error::Namespace {
        name: "host".to_string(),
        reason: format!("failed to open current namespace handle: {e}"),
    })
}

/// Run `f` on a dedicated OS thread for the duration of the call. The
/// thread is created for this call and joined before returning, so nothing
/// else can be scheduled onto it while the namespace is switched.
fn run_on_pinned_thread<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("metald-netns".to_string())
        .spawn(f)
        .map_err(|e| Error::Namespace {
            name: "host".to_string(),
            reason: format!("failed to spawn namespace thread: {e}"),
        })?;
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(Error::Namespace {
            name: "host".to_string(),
            reason: "namespace thread panicked".to_string(),
        }),
    }
}

/// Enter the named namespace on a pinned thread, run `f` there, and restore
/// the original namespace on every exit path.
pub fn with_netns<T, F>(name: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let name = name.to_string();
    run_on_pinned_thread(move || {
        let original = open_current_netns()?;
        let target = File::open(namespace_path(&name)).map_err(|e| Error::Namespace {
            name: name.clone(),
            reason: format!("failed to open namespace handle: {e}"),
        })?;

        let _guard = NetnsRestoreGuard { original };
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| Error::Namespace {
            name: name.clone(),
            reason: format!("setns failed: {e}"),
        })?;

        f()
    })
}

/// Async edge for [`with_netns`]: hops onto the blocking pool, which in turn
/// spawns the dedicated thread.
pub async fn with_netns_async<T, F>(name: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let name = name.to_string();
    tokio::task::spawn_blocking(move || with_netns(&name, f))
        .await
        .map_err(|e| Error::Namespace {
            name: "host".to_string(),
            reason: format!("namespace task join error: {e}"),
        })?
}
