//! Selection of a container cgroup name that is free under every controller.

use crate::error::CgroupError;

/// Outcome of claiming a candidate name across all hierarchies/controllers.
pub(crate) enum Claim {
    /// The candidate was created everywhere.
    Created,
    /// The candidate already existed somewhere. The backend has rolled back
    /// whatever it created for this candidate before reporting this.
    Exists,
}

/// A driver-side primitive the planner drives: create `candidate` under every
/// controller, rolling back partial creations on collision or error.
pub(crate) trait PathBackend {
    fn claim(&self, candidate: &str) -> Result<Claim, CgroupError>;
}

/// Expands the naming pattern, substituting `%n` with the container name, and
/// strips any leading `/` so the result stays relative to the cgroup mounts.
pub(crate) fn expand_pattern(pattern: &str, name: &str) -> String {
    pattern.replace("%n", name).trim_start_matches('/').to_string()
}

/// Finds a cgroup name unused under every controller by trying `base`,
/// `base-1`, `base-2`, … until one can be created everywhere. Gives up after
/// `limit` collisions.
pub(crate) fn allocate(
    pattern: &str,
    name: &str,
    limit: u32,
    backend: &dyn PathBackend,
) -> Result<String, CgroupError> {
    let base = expand_pattern(pattern, name);

    for index in 0..limit {
        let candidate = if index == 0 {
            base.clone()
        } else {
            format!("{base}-{index}")
        };

        match backend.claim(&candidate)? {
            Claim::Created => return Ok(candidate),
            Claim::Exists => continue,
        }
    }

    tracing::error!("{limit} cgroups named after '{base}' already running");
    Err(CgroupError::NameExhausted {
        base,
        attempts: limit,
    })
}
