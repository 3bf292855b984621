//! Scoped network namespace switch

use super::NetlinkError;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing::{debug, error};

/// Namespace of the calling thread, not the whole process
const CURRENT_NETNS: &str = "/proc/thread-self/ns/net";

/// Saves the calling thread's network namespace and switches back to it on drop
///
/// The switch is per OS thread. Everything done while the guard lives must
/// stay on the thread that created it, so callers drive it from a
/// current-thread runtime where every `await` resumes on the same thread.
pub struct NetnsGuard {
    original: Option<File>,
}

impl NetnsGuard {
    pub fn enter(target: &File) -> Result<Self, NetlinkError> {
        let original = File::open(CURRENT_NETNS).map_err(|source| NetlinkError::Netns {
            path: PathBuf::from(CURRENT_NETNS),
            source,
        })?;

        setns(target, CloneFlags::CLONE_NEWNET).map_err(|errno| NetlinkError::Netns {
            path: PathBuf::from(CURRENT_NETNS),
            source: io::Error::from(errno),
        })?;
        debug!("Entered target network namespace");

        Ok(Self {
            original: Some(original),
        })
    }

    /// A guard that restores nothing, for test doubles
    pub fn detached() -> Self {
        Self { original: None }
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            match setns(original, CloneFlags::CLONE_NEWNET) {
                Ok(()) => debug!("Restored original network namespace"),
                Err(e) => error!(error = %e, "Failed to restore original network namespace"),
            }
        }
    }
}
