use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use nix::unistd::Pid;

use crate::cgfs::FsDriver;
use crate::cgmanager::CgmDriver;
use crate::config::{CgroupConfig, DEFAULT_CGROUP_PATTERN};
use crate::error::CgroupError;
use crate::registry;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";
pub const CGROUP_CLONE_CHILDREN: &str = "cgroup.clone_children";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Looks up the relative cgroup path that a running container's monitor
/// recorded for a controller. The lookup mechanism (a command socket to the
/// monitor) lives outside this crate.
pub type MonitorLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
    #[error("failed to create directory {path}: {err}")]
    CreateDir { err: std::io::Error, path: PathBuf },
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_open(self, path: &Path) -> Result<Self::Target, WrappedIoError>;
    fn wrap_read(self, path: &Path) -> Result<Self::Target, WrappedIoError>;
    fn wrap_write<D: Into<String>>(self, path: &Path, data: D)
        -> Result<Self::Target, WrappedIoError>;
    fn wrap_create_dir(self, path: &Path) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_open(self, path: &Path) -> Result<T, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.to_path_buf(),
        })
    }

    fn wrap_read(self, path: &Path) -> Result<T, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Read {
            err,
            path: path.to_path_buf(),
        })
    }

    fn wrap_write<D: Into<String>>(self, path: &Path, data: D) -> Result<T, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Write {
            err,
            path: path.to_path_buf(),
            data: data.into(),
        })
    }

    fn wrap_create_dir(self, path: &Path) -> Result<T, WrappedIoError> {
        self.map_err(|err| WrappedIoError::CreateDir {
            err,
            path: path.to_path_buf(),
        })
    }
}

#[inline]
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<(), WrappedIoError> {
    let path = path.as_ref();

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .wrap_open(path)?
        .write_all(data.as_bytes())
        .wrap_write(path, data)?;

    Ok(())
}

#[inline]
pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    write_cgroup_file_str(path, &data.to_string())
}

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String, WrappedIoError> {
    let path = path.as_ref();
    fs::read_to_string(path).wrap_read(path)
}

/// Control files read through the drivers always carry a final newline, even
/// when the underlying source omits it.
pub(crate) fn ensure_trailing_newline(mut value: String) -> String {
    if !value.ends_with('\n') {
        value.push('\n');
    }
    value
}

/// Splits a qualified key such as `memory.limit_in_bytes` into its controller
/// prefix.
pub(crate) fn controller_of(key: &str) -> Result<&str, CgroupError> {
    match key.split_once('.') {
        Some((controller, _)) if !controller.is_empty() => Ok(controller),
        _ => Err(CgroupError::UnknownKey(key.into())),
    }
}

/// Locks a mutex, treating a poisoned lock as programmer error. A thread that
/// panicked while holding driver state leaves it in an unknown shape, so we
/// go down hard instead of limping on.
pub(crate) fn lock_or_abort<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| {
        tracing::error!("cgroup driver lock poisoned: {err}");
        std::process::abort();
    })
}

/// The per-container cgroup state. Allocated before the container starts,
/// populated by `create`, and referenced by every later cgroup operation.
#[derive(Debug)]
pub struct ContainerCgroup {
    name: String,
    pattern: String,
    path: Option<String>,
}

impl ContainerCgroup {
    pub fn new(name: &str, config: &CgroupConfig) -> Self {
        let pattern = if config.pattern.is_empty() {
            DEFAULT_CGROUP_PATTERN.into()
        } else {
            config.pattern.clone()
        };

        Self {
            name: name.into(),
            pattern,
            path: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The relative cgroup path, e.g. `lxc/c1-2`. `None` until `create`
    /// succeeded; immutable afterwards.
    pub fn relative_path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub(crate) fn set_relative_path(&mut self, path: String) {
        self.path = Some(path);
    }

    pub(crate) fn path_or_err(&self) -> Result<&str, CgroupError> {
        self.relative_path().ok_or(CgroupError::NoCgroup)
    }
}

/// The uniform contract both cgroup backends implement. One driver is chosen
/// at process start; all cgroup work is dispatched through it.
pub trait CgroupDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocates a cgroup path that is unused under every controller and
    /// creates it everywhere. Fills in the container cgroup's relative path.
    fn create(&self, cg: &mut ContainerCgroup) -> Result<(), CgroupError>;

    /// Moves a task into the container's cgroup under every controller.
    fn enter(&self, cg: &ContainerCgroup, pid: Pid) -> Result<(), CgroupError>;

    /// Hands the container's cgroups over to the root of its user namespace.
    /// Best-effort: failures are logged and folded into the returned flag.
    fn chown(&self, cg: &ContainerCgroup, config: &CgroupConfig) -> bool;

    /// Reads the control file `key` under the cgroup at `path` (relative, as
    /// recorded by the monitor).
    fn get(&self, path: &str, key: &str) -> Result<String, CgroupError>;

    /// Writes `value` to the control file `key` under the cgroup at `path`.
    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), CgroupError>;

    /// Number of tasks currently in the container's cgroup.
    fn nr_tasks(&self, cg: &ContainerCgroup) -> Result<usize, CgroupError>;

    /// Thaws every task in the container's freezer cgroup.
    fn unfreeze(&self, cg: &ContainerCgroup) -> Result<(), CgroupError>;

    /// Moves a task into the already-running container's cgroup at `path`.
    fn attach(&self, path: &str, pid: Pid) -> Result<(), CgroupError>;

    /// Removes the container's cgroups everywhere. Best-effort: keeps going
    /// past individual failures and reports the aggregate outcome.
    fn destroy(&self, cg: &ContainerCgroup) -> bool;

    /// Prepares `/sys/fs/cgroup` inside the container's root. Only the
    /// manager driver has work to do here; the fs driver relies on the
    /// configuration's mount entries.
    fn mount_cgroup(&self, root: &Path) -> Result<(), CgroupError> {
        let _ = root;
        Ok(())
    }

    /// Releases any process-wide connection the driver holds. Called from
    /// shutdown paths.
    fn disconnect(&self) {}
}

/// Instantiates the cgroup driver for this process: the cgroup manager daemon
/// when its socket answers a ping, the mounted hierarchies otherwise.
pub fn create_driver(config: &CgroupConfig) -> Result<Box<dyn CgroupDriver>, CgroupError> {
    match CgmDriver::new(config) {
        Ok(driver) => {
            tracing::info!("cgroup manager driver will be used");
            return Ok(Box::new(driver));
        }
        Err(err) => {
            tracing::debug!("cgroup manager not usable, falling back to fs driver: {err}");
        }
    }

    let driver = FsDriver::new(config)?;
    tracing::info!("cgroup fs driver will be used");
    Ok(Box::new(driver))
}

/// Reads a cgroup key of a running container, resolving its cgroup path
/// through the monitor.
pub fn get(
    driver: &dyn CgroupDriver,
    lookup: MonitorLookup,
    key: &str,
) -> Result<String, CgroupError> {
    let controller = controller_of(key)?;
    let path = lookup(controller).ok_or(CgroupError::NoCgroup)?;
    driver.get(&path, key)
}

/// Writes a cgroup key of a running container, resolving its cgroup path
/// through the monitor.
pub fn set(
    driver: &dyn CgroupDriver,
    lookup: MonitorLookup,
    key: &str,
    value: &str,
) -> Result<(), CgroupError> {
    let controller = controller_of(key)?;
    let path = lookup(controller).ok_or(CgroupError::NoCgroup)?;
    driver.set(&path, key, value)
}

/// Moves a task into a running container's cgroup. Creation keeps the cgroup
/// name identical across controllers, so the path is resolved through the
/// first one.
pub fn attach(
    driver: &dyn CgroupDriver,
    lookup: MonitorLookup,
    pid: Pid,
) -> Result<(), CgroupError> {
    let controllers = registry::enabled_controllers()?;
    let first = controllers.first().ok_or(CgroupError::NoControllers)?;
    let path = lookup(first).ok_or(CgroupError::NoCgroup)?;
    tracing::info!("joining pid {pid} to cgroup {path}");
    driver.attach(&path, pid)
}
