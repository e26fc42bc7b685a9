//! Exposing the cgroup manager socket inside a container. The container gets
//! a small tmpfs at /sys/fs/cgroup with the host's daemon socket directory
//! bind-mounted into it, so in-container tools can talk to the same daemon.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::common::WrapIoResult;
use crate::error::CgroupError;

// A proxying daemon on the host exposes the real socket under .lower; prefer
// it so nested containers reach the outermost manager.
const LOWER_SOCKET_DIR: &str = "/sys/fs/cgroup/cgmanager.lower";
const UPPER_SOCKET_DIR: &str = "/sys/fs/cgroup/cgmanager";

const TMPFS_OPTIONS: &str = "size=10000,mode=755";

fn daemon_socket_dir() -> Option<&'static Path> {
    for dir in [LOWER_SOCKET_DIR, UPPER_SOCKET_DIR] {
        let path = Path::new(dir);
        if path.is_dir() {
            return Some(path);
        }
    }
    None
}

/// Bind-mounts the daemon's socket directory into the container root. The
/// caller got here through a live daemon connection, so a missing socket
/// directory is a hard error.
pub(crate) fn mount_daemon_socket(root: &Path) -> Result<(), CgroupError> {
    let source = daemon_socket_dir().ok_or_else(|| CgroupError::Mount {
        target: PathBuf::from(UPPER_SOCKET_DIR),
        err: nix::Error::ENOENT,
    })?;

    bind_socket_dir(root, source)
}

fn bind_socket_dir(root: &Path, source: &Path) -> Result<(), CgroupError> {
    // /sys is expected to be mounted in the container by now.
    let cgroup_dir = root.join("sys/fs/cgroup");
    if !cgroup_dir.is_dir() {
        return Err(CgroupError::Mount {
            target: cgroup_dir,
            err: nix::Error::ENOENT,
        });
    }

    // A tmpfs of our own, so the directory below can be created on an
    // otherwise read-only /sys.
    mount(
        Some("cgroup"),
        &cgroup_dir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(TMPFS_OPTIONS),
    )
    .map_err(|err| CgroupError::Mount {
        target: cgroup_dir.clone(),
        err,
    })?;

    let socket_dir = cgroup_dir.join("cgmanager");
    fs::create_dir(&socket_dir).wrap_create_dir(&socket_dir)?;

    mount(
        Some(source),
        &socket_dir,
        Some("none"),
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|err| CgroupError::Mount {
        target: socket_dir,
        err,
    })?;

    Ok(())
}
