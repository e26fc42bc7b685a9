use serde::{Deserialize, Serialize};

/// Naming pattern used for container cgroups; `%n` expands to the container
/// name.
pub const DEFAULT_CGROUP_PATTERN: &str = "%n";

/// Administrative parent directory under which container cgroups are created
/// by the fs driver.
pub const DEFAULT_ENCLOSING_GROUP: &str = "lxc";

/// How many `name`, `name-1`, `name-2`, … candidates are tried before cgroup
/// creation gives up.
pub const DEFAULT_NAME_RETRY_LIMIT: u32 = 100;

/// A single resource-limit setting from the container configuration. The key
/// is qualified by its controller, e.g. `memory.limit_in_bytes`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSetting {
    pub key: String,
    pub value: String,
}

impl CgroupSetting {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdMapKind {
    Uid,
    Gid,
}

/// One entry of the container's id map: `size` ids starting at `container_id`
/// inside the user namespace correspond to ids starting at `host_id` on the
/// host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub kind: IdMapKind,
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Cgroup-related container configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Naming pattern for the container cgroup, `%n` substituted by the
    /// container name.
    pub pattern: String,
    /// Enclosing group the fs driver creates container cgroups under.
    pub enclosing_group: String,
    /// Upper bound on naming candidates tried during creation.
    pub name_retry_limit: u32,
    /// Ordered resource-limit settings.
    pub settings: Vec<CgroupSetting>,
    /// Id map of the container's user namespace. When empty, cgroups are not
    /// chowned into the container.
    pub id_map: Vec<IdMapping>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_CGROUP_PATTERN.into(),
            enclosing_group: DEFAULT_ENCLOSING_GROUP.into(),
            name_retry_limit: DEFAULT_NAME_RETRY_LIMIT,
            settings: Vec::new(),
            id_map: Vec::new(),
        }
    }
}

impl CgroupConfig {
    /// Translates a host uid into the container's user namespace. Returns 0
    /// when the uid is not covered by any mapping, which is what the helper
    /// running as in-namespace root claims for an unmapped caller.
    pub fn container_uid(&self, host_uid: u32) -> u32 {
        for mapping in self.id_map.iter().filter(|m| m.kind == IdMapKind::Uid) {
            if host_uid >= mapping.host_id && host_uid - mapping.host_id < mapping.size {
                return mapping.container_id + (host_uid - mapping.host_id);
            }
        }

        0
    }
}
