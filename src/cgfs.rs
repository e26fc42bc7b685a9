//! Cgroup driver backed by the mounted cgroup hierarchies: directories are
//! created and removed directly and control files written through the
//! filesystem.

use std::fs;
use std::io::ErrorKind;
use std::os::linux::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::common::{
    self, controller_of, CgroupDriver, ContainerCgroup, WrappedIoError, CGROUP_CLONE_CHILDREN,
    CGROUP_TASKS,
};
use crate::config::CgroupConfig;
use crate::error::CgroupError;
use crate::planner::{self, Claim, PathBackend};
use crate::registry::{self, Hierarchy};

const FREEZER_STATE: &str = "freezer.state";
const FREEZER_THAWED: &str = "THAWED";

pub struct FsDriver {
    hierarchies: Vec<Hierarchy>,
    enclosing_group: String,
    name_retry_limit: u32,
}

impl FsDriver {
    pub fn new(config: &CgroupConfig) -> Result<Self, CgroupError> {
        let hierarchies = registry::hierarchies()?;
        if hierarchies.is_empty() {
            return Err(CgroupError::NoControllers);
        }

        Ok(Self::with_hierarchies(hierarchies, config))
    }

    pub(crate) fn with_hierarchies(hierarchies: Vec<Hierarchy>, config: &CgroupConfig) -> Self {
        Self {
            hierarchies,
            enclosing_group: config.enclosing_group.clone(),
            name_retry_limit: config.name_retry_limit,
        }
    }

    fn first_hierarchy(&self) -> Result<&Hierarchy, CgroupError> {
        self.hierarchies.first().ok_or(CgroupError::NoControllers)
    }

    fn hierarchy_for(&self, controller: &str) -> Option<&Hierarchy> {
        self.hierarchies.iter().find(|h| h.has_controller(controller))
    }

    /// Makes sure `<mount>/<group>` exists in every hierarchy. When the group
    /// directory is first created, the hierarchy root's clone_children knob
    /// is turned on so cpuset values propagate into the cgroups made below.
    fn ensure_enclosing_group(&self) -> Result<(), CgroupError> {
        for hierarchy in &self.hierarchies {
            let group_dir = hierarchy.mount_point.join(&self.enclosing_group);
            if group_dir.exists() {
                continue;
            }

            let clone_children = hierarchy.mount_point.join(CGROUP_CLONE_CHILDREN);
            if let Err(err) = common::write_cgroup_file_str(&clone_children, "1") {
                // Not all kernels have clone_children; carry on without it.
                tracing::warn!("could not set {:?}: {err}", clone_children);
            }

            match fs::create_dir(&group_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(WrappedIoError::CreateDir {
                        err,
                        path: group_dir,
                    }
                    .into())
                }
            }
        }

        Ok(())
    }

    fn enter_path(&self, relative_path: &str, pid: Pid) -> Result<(), CgroupError> {
        for hierarchy in &self.hierarchies {
            let tasks = hierarchy.mount_point.join(relative_path).join(CGROUP_TASKS);
            common::write_cgroup_file_str(&tasks, &format!("{pid}\n"))?;
        }

        Ok(())
    }

    fn control_file(&self, relative_path: &str, key: &str) -> Result<PathBuf, CgroupError> {
        let controller = controller_of(key)?;
        let hierarchy = self
            .hierarchy_for(controller)
            .ok_or_else(|| CgroupError::UnknownKey(key.into()))?;
        Ok(hierarchy.mount_point.join(relative_path).join(key))
    }
}

struct FsBackend<'a> {
    driver: &'a FsDriver,
}

impl FsBackend<'_> {
    fn rollback(&self, created: &[PathBuf]) {
        for dir in created {
            if let Err(err) = remove_cgroup_tree(dir) {
                tracing::warn!("failed to clean up cgroup {:?}: {err}", dir);
            }
        }
    }
}

impl PathBackend for FsBackend<'_> {
    fn claim(&self, candidate: &str) -> Result<Claim, CgroupError> {
        let mut created: Vec<PathBuf> = Vec::new();

        for hierarchy in &self.driver.hierarchies {
            let dir = hierarchy
                .mount_point
                .join(&self.driver.enclosing_group)
                .join(candidate);

            match fs::create_dir(&dir) {
                Ok(()) => created.push(dir),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    self.rollback(&created);
                    return Ok(Claim::Exists);
                }
                Err(err) => {
                    tracing::error!("error creating cgroup {:?}: {err}", dir);
                    self.rollback(&created);
                    return Err(WrappedIoError::CreateDir { err, path: dir }.into());
                }
            }
        }

        Ok(Claim::Created)
    }
}

impl CgroupDriver for FsDriver {
    fn name(&self) -> &'static str {
        "cgfs"
    }

    fn create(&self, cg: &mut ContainerCgroup) -> Result<(), CgroupError> {
        self.ensure_enclosing_group()?;

        let backend = FsBackend { driver: self };
        let candidate = planner::allocate(
            cg.pattern(),
            cg.name(),
            self.name_retry_limit,
            &backend,
        )?;

        cg.set_relative_path(format!("{}/{}", self.enclosing_group, candidate));
        Ok(())
    }

    fn enter(&self, cg: &ContainerCgroup, pid: Pid) -> Result<(), CgroupError> {
        self.enter_path(cg.path_or_err()?, pid)
    }

    fn chown(&self, _cg: &ContainerCgroup, _config: &CgroupConfig) -> bool {
        // Directly-managed cgroups stay owned by the host side; there is no
        // namespace boundary to hand them across.
        true
    }

    fn get(&self, path: &str, key: &str) -> Result<String, CgroupError> {
        let file = self.control_file(path, key)?;
        let value = common::read_cgroup_file(file)?;
        Ok(common::ensure_trailing_newline(value))
    }

    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), CgroupError> {
        let file = self.control_file(path, key)?;
        common::write_cgroup_file_str(file, value)?;
        Ok(())
    }

    fn nr_tasks(&self, cg: &ContainerCgroup) -> Result<usize, CgroupError> {
        let path = cg.path_or_err()?;
        let tasks = self
            .first_hierarchy()?
            .mount_point
            .join(path)
            .join(CGROUP_TASKS);
        let content = common::read_cgroup_file(tasks)?;
        Ok(content.split_whitespace().count())
    }

    fn unfreeze(&self, cg: &ContainerCgroup) -> Result<(), CgroupError> {
        let path = cg.path_or_err()?;
        let state = self
            .hierarchy_for("freezer")
            .ok_or_else(|| CgroupError::UnknownKey(FREEZER_STATE.into()))?
            .mount_point
            .join(path)
            .join(FREEZER_STATE);
        common::write_cgroup_file_str(state, FREEZER_THAWED)?;
        Ok(())
    }

    fn attach(&self, path: &str, pid: Pid) -> Result<(), CgroupError> {
        self.enter_path(path, pid)
    }

    fn destroy(&self, cg: &ContainerCgroup) -> bool {
        let Some(path) = cg.relative_path() else {
            // Never created, nothing to tear down.
            return true;
        };

        let mut ok = true;
        for hierarchy in &self.hierarchies {
            let dir = hierarchy.mount_point.join(path);
            if !dir.exists() {
                tracing::warn!("cgroup {:?} was already removed", dir);
                continue;
            }

            tracing::debug!("destroying cgroup {:?}", dir);
            if let Err(err) = remove_cgroup_tree(&dir) {
                tracing::warn!("failed to remove cgroup {:?}: {err}", dir);
                ok = false;
            }
        }

        ok
    }
}

/// Removes a cgroup directory and everything below it. Only directories are
/// descended into (the kernel owns the control files, they go away with their
/// directory), symlinks are never followed, and descent stays on the cgroup
/// filesystem so a bind mount inside the tree cannot lead elsewhere. Failures
/// below the root are skipped so one stuck child does not stop the sweep.
fn remove_cgroup_tree(dir: &Path) -> std::io::Result<()> {
    let root_dev = dir.symlink_metadata()?.st_dev();
    remove_tree_on_device(dir, root_dev)
}

fn remove_tree_on_device(dir: &Path, device: u64) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(metadata) = path.symlink_metadata() else {
            continue;
        };

        if metadata.is_dir() && metadata.st_dev() == device {
            let _ = remove_tree_on_device(&path, device);
        }
    }

    fs::remove_dir(dir)
}
