//! Application of the configured resource limits to a container's cgroups.

use crate::common::{controller_of, CgroupDriver, ContainerCgroup};
use crate::config::CgroupSetting;
use crate::error::CgroupError;

const DEVICES_CONTROLLER: &str = "devices";

/// Applies the configured settings in two passes: everything except the
/// device whitelist first, then the `devices.*` keys. Writing `devices.deny`
/// before the other controllers have been set up would narrow the whitelist
/// under us, so the device pass always goes last. Within a pass, settings are
/// applied in configuration order.
///
/// Settings already applied stay in place when a later one fails.
pub fn setup_limits(
    driver: &dyn CgroupDriver,
    cg: &ContainerCgroup,
    settings: &[CgroupSetting],
) -> Result<(), CgroupError> {
    if settings.is_empty() {
        return Ok(());
    }

    let path = cg.path_or_err()?;

    // Reject malformed keys before anything is written.
    for setting in settings {
        controller_of(&setting.key)?;
    }

    apply_pass(driver, path, settings, false)?;
    apply_pass(driver, path, settings, true)?;

    tracing::info!("cgroup limits have been set up");
    Ok(())
}

fn apply_pass(
    driver: &dyn CgroupDriver,
    path: &str,
    settings: &[CgroupSetting],
    devices: bool,
) -> Result<(), CgroupError> {
    for setting in settings {
        let controller = controller_of(&setting.key)?;
        if (controller == DEVICES_CONTROLLER) != devices {
            continue;
        }

        driver
            .set(path, &setting.key, &setting.value)
            .map_err(|err| CgroupError::LimitFailed {
                key: setting.key.clone(),
                value: setting.value.clone(),
                source: Box::new(err),
            })?;

        tracing::debug!("cgroup '{}' set to '{}'", setting.key, setting.value);
    }

    Ok(())
}
