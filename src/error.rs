use std::path::PathBuf;

use crate::cgmanager::bus::BusError;
use crate::common::WrappedIoError;

/// Errors surfaced by the cgroup drivers.
///
/// `destroy` and `chown` are best-effort and report their aggregate outcome as
/// a boolean instead; everything else propagates one of these.
#[derive(thiserror::Error, Debug)]
pub enum CgroupError {
    #[error("no usable cgroup controllers found")]
    NoControllers,
    #[error("{attempts} cgroups named after '{base}' already exist")]
    NameExhausted { base: String, attempts: u32 },
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to read mount table: {0}")]
    MountTable(procfs::ProcError),
    #[error("cgroup manager connection lost")]
    Disconnected,
    #[error("failed to chown {controller}:{path} into the user namespace")]
    ChownFailed { controller: String, path: String },
    #[error("no controller prefix in cgroup key '{0}'")]
    UnknownKey(String),
    #[error("failed to apply cgroup setting {key} = {value}: {source}")]
    LimitFailed {
        key: String,
        value: String,
        #[source]
        source: Box<CgroupError>,
    },
    #[error("container has no cgroup")]
    NoCgroup,
    #[error("user namespace helper did not run to completion")]
    NamespaceHelper,
    #[error("failed to mount {target}: {err}")]
    Mount { target: PathBuf, err: nix::Error },
    #[error("cgroup manager call failed: {0}")]
    Bus(#[from] BusError),
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}
