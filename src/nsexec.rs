//! Running a short-lived helper as root of a freshly-made user namespace.
//! The daemon driver needs this for its chown handshake: the second
//! credential message only translates correctly when it is sent from inside
//! the container's namespace by an in-namespace root.

use std::fmt::Write as _;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, fork, ForkResult, Gid, Pid, Uid};

use crate::config::{IdMapKind, IdMapping};
use crate::error::CgroupError;

const SETUP_FAILED: i32 = 126;

/// Forks a helper, moves it into a new user namespace mapped according to
/// `id_map`, drops it to in-namespace root with cleared supplementary groups
/// and runs `body`. Returns the helper's exit code.
pub(crate) fn run_as_namespace_root<F>(id_map: &[IdMapping], body: F) -> Result<i32, CgroupError>
where
    F: FnOnce() -> i32,
{
    // One pipe per direction: the helper reports that its namespace exists,
    // the parent reports that the maps are in place.
    let (unshared_rx, unshared_tx) = unistd::pipe()?;
    let (mapped_rx, mapped_tx) = unistd::pipe()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(unshared_rx);
            drop(mapped_tx);

            let code = match enter_namespace(unshared_tx, mapped_rx) {
                Ok(()) => {
                    become_namespace_root();
                    body()
                }
                Err(err) => {
                    tracing::error!("user namespace helper setup failed: {err}");
                    SETUP_FAILED
                }
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(unshared_tx);
            drop(mapped_rx);

            let mut byte = [0u8; 1];
            if unistd::read(unshared_rx.as_raw_fd(), &mut byte)? != 1 {
                let _ = waitpid(child, None);
                return Err(CgroupError::NamespaceHelper);
            }

            // The helper reports whether its namespace exists; maps can only
            // be written into a namespace that does.
            if byte[0] == 1 {
                if let Err(err) = write_id_maps(child, id_map) {
                    tracing::error!("failed to write id maps for helper {child}: {err}");
                    // Release the helper anyway; it will fail and report.
                }
            }
            let _ = unistd::write(mapped_tx.as_fd(), &[1]);

            match waitpid(child, None)? {
                WaitStatus::Exited(_, code) => Ok(code),
                status => {
                    tracing::warn!("user namespace helper ended abnormally: {status:?}");
                    Err(CgroupError::NamespaceHelper)
                }
            }
        }
    }
}

fn enter_namespace(unshared_tx: OwnedFd, mapped_rx: OwnedFd) -> Result<(), nix::Error> {
    let unshared = unshare(CloneFlags::CLONE_NEWUSER);
    // Report either way, so the parent never waits on a namespace that will
    // not appear.
    let status = if unshared.is_ok() { 1 } else { 0 };
    let _ = unistd::write(unshared_tx.as_fd(), &[status]);
    unshared?;

    let mut byte = [0u8; 1];
    if unistd::read(mapped_rx.as_raw_fd(), &mut byte)? != 1 {
        return Err(nix::Error::EPIPE);
    }
    Ok(())
}

/// Takes on real, effective and saved uid/gid 0 and clears the supplementary
/// groups inherited from the host. Each step is attempted on its own;
/// a partially dropped identity still lets the handshake proceed and fail
/// with a daemon-side verdict instead.
fn become_namespace_root() {
    let root_gid = Gid::from_raw(0);
    if let Err(err) = unistd::setresgid(root_gid, root_gid, root_gid) {
        tracing::warn!("helper failed to setgid to 0: {err}");
    }
    let root_uid = Uid::from_raw(0);
    if let Err(err) = unistd::setresuid(root_uid, root_uid, root_uid) {
        tracing::warn!("helper failed to setuid to 0: {err}");
    }
    if let Err(err) = unistd::setgroups(&[]) {
        tracing::warn!("helper failed to clear groups: {err}");
    }
}

fn write_id_maps(child: Pid, id_map: &[IdMapping]) -> std::io::Result<()> {
    let uid_map = format_id_map(id_map, IdMapKind::Uid);
    if !uid_map.is_empty() {
        std::fs::write(format!("/proc/{child}/uid_map"), uid_map)?;
    }

    let gid_map = format_id_map(id_map, IdMapKind::Gid);
    if !gid_map.is_empty() {
        // Without the privilege to map arbitrary gids, the kernel only takes
        // a gid map once setgroups has been disabled for the namespace.
        if !unistd::geteuid().is_root() {
            std::fs::write(format!("/proc/{child}/setgroups"), "deny")?;
        }
        std::fs::write(format!("/proc/{child}/gid_map"), gid_map)?;
    }

    Ok(())
}

/// Renders the entries of one kind in the line format the map files take:
/// `<id inside the namespace> <id on the host> <range size>`.
fn format_id_map(id_map: &[IdMapping], kind: IdMapKind) -> String {
    let mut content = String::new();
    for mapping in id_map.iter().filter(|m| m.kind == kind) {
        let _ = writeln!(
            content,
            "{} {} {}",
            mapping.container_id, mapping.host_id, mapping.size
        );
    }
    content
}
