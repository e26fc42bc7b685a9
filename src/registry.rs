//! Discovery of the cgroup controllers the kernel advertises and, for the fs
//! driver, the hierarchies they are mounted on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use procfs::process::Process;

use crate::common::{lock_or_abort, WrapIoResult};
use crate::error::CgroupError;

const PROC_CGROUPS: &str = "/proc/cgroups";

/// A mounted cgroup tree. Several controllers can be co-mounted on one tree;
/// creating a directory in it creates the cgroup for all of them at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hierarchy {
    pub mount_point: PathBuf,
    pub controllers: Vec<String>,
}

impl Hierarchy {
    pub fn has_controller(&self, controller: &str) -> bool {
        self.controllers.iter().any(|c| c == controller)
    }
}

static ENABLED_CONTROLLERS: Lazy<Mutex<Option<Arc<Vec<String>>>>> =
    Lazy::new(|| Mutex::new(None));

/// The names of the cgroup controllers the kernel has enabled. Read from the
/// kernel once per process; `shutdown` drops the cache.
pub fn enabled_controllers() -> Result<Arc<Vec<String>>, CgroupError> {
    let mut cache = lock_or_abort(&ENABLED_CONTROLLERS);
    if let Some(controllers) = cache.as_ref() {
        return Ok(controllers.clone());
    }

    let path = Path::new(PROC_CGROUPS);
    let content = std::fs::read_to_string(path).wrap_read(path)?;
    let controllers = parse_proc_cgroups(&content);
    if controllers.is_empty() {
        return Err(CgroupError::NoControllers);
    }

    let controllers = Arc::new(controllers);
    *cache = Some(controllers.clone());
    Ok(controllers)
}

/// Drops the process-wide controller cache.
pub fn shutdown() {
    *lock_or_abort(&ENABLED_CONTROLLERS) = None;
}

/// Parses the kernel controller table. Comment lines (the column headings)
/// and blank lines are skipped; only rows whose enable flag is set survive.
fn parse_proc_cgroups(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?;
            let _hierarchy_id = fields.next()?;
            let _num_cgroups = fields.next()?;
            let enabled = fields.next()?;
            (enabled.trim() == "1").then(|| name.to_string())
        })
        .collect()
}

/// The mounted cgroup hierarchies, deduplicated by controller set: a
/// controller belongs to exactly one hierarchy, no matter how many places
/// that hierarchy is mounted.
pub fn hierarchies() -> Result<Vec<Hierarchy>, CgroupError> {
    let enabled = enabled_controllers()?;

    let mounts: Vec<(PathBuf, Vec<String>)> = Process::myself()
        .map_err(CgroupError::MountTable)?
        .mountinfo()
        .map_err(CgroupError::MountTable)?
        .into_iter()
        .filter(|m| m.fs_type == "cgroup")
        .map(|m| {
            let options = m.super_options.keys().cloned().collect();
            (m.mount_point, options)
        })
        .collect();

    Ok(hierarchies_from_mounts(mounts, &enabled))
}

fn hierarchies_from_mounts(
    mounts: Vec<(PathBuf, Vec<String>)>,
    enabled: &[String],
) -> Vec<Hierarchy> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut hierarchies = Vec::new();

    for (mount_point, options) in mounts {
        let controllers: Vec<String> = options
            .into_iter()
            .filter(|opt| enabled.iter().any(|c| c == opt))
            .collect();
        if controllers.is_empty() {
            continue;
        }

        // A second mount of the same tree shares its controllers; skip it.
        if controllers.iter().any(|c| visited.contains(c)) {
            continue;
        }

        visited.extend(controllers.iter().cloned());
        tracing::debug!("using cgroup hierarchy mounted at {:?}", mount_point);
        hierarchies.push(Hierarchy {
            mount_point,
            controllers,
        });
    }

    hierarchies
}
