//! Locating and loading settings, and applying command-line overrides.

use std::path::{Path, PathBuf};

use fleetlab_core::control::FleetFilter;
use fleetlab_core::error::SettingsError;
use fleetlab_core::types::config::Settings;

/// `--config`, then `$FLEETLAB_CONFIG`, then `~/.config/fleetlab/config.yaml`.
pub fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("FLEETLAB_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("fleetlab")
        .join("config.yaml")
}

pub fn load(flag: Option<&Path>) -> Result<Settings, SettingsError> {
    let path = resolve_config_path(flag);
    tracing::debug!(path = %path.display(), "loading settings");
    Settings::load(&path)
}

/// Flags that override the `cloud` section for one invocation.
#[derive(Debug, Clone, Default)]
pub struct CloudOverrides {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub instance_type: Option<String>,
    pub image: Option<String>,
}

impl CloudOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(owner) = &self.owner {
            settings.cloud.owner = owner.clone();
        }
        if let Some(group) = &self.group {
            settings.cloud.group = group.clone();
        }
        if let Some(t) = &self.instance_type {
            settings.cloud.instance_type = t.clone();
        }
        if let Some(image) = &self.image {
            settings.cloud.image_id = image.clone();
        }
    }
}

/// The machines this operator sees: their own, in their group.
pub fn fleet_filter(settings: &Settings) -> FleetFilter {
    FleetFilter {
        owner: Some(settings.cloud.owner.clone()),
        group: Some(settings.cloud.group.clone()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_everything() {
        let p = resolve_config_path(Some(Path::new("/etc/fleet.yaml")));
        assert_eq!(p, PathBuf::from("/etc/fleet.yaml"));
    }

    #[test]
    fn env_then_default() {
        let old = std::env::var("FLEETLAB_CONFIG").ok();
        std::env::set_var("FLEETLAB_CONFIG", "/tmp/fleetlab-test.yaml");
        assert_eq!(resolve_config_path(None), PathBuf::from("/tmp/fleetlab-test.yaml"));
        std::env::remove_var("FLEETLAB_CONFIG");
        assert!(resolve_config_path(None)
            .to_string_lossy()
            .ends_with(".config/fleetlab/config.yaml"));
        if let Some(v) = old {
            std::env::set_var("FLEETLAB_CONFIG", v);
        }
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load(Some(&dir.path().join("nope.yaml"))).unwrap();
        assert_eq!(settings.cloud.instance_type, "p2.xlarge");
    }

    #[test]
    fn overrides_and_filter() {
        let mut settings = Settings::default();
        CloudOverrides {
            owner: Some("jara".into()),
            image: Some("ami-42".into()),
            ..CloudOverrides::default()
        }
        .apply(&mut settings);
        assert_eq!(settings.cloud.image_id, "ami-42");
        let filter = fleet_filter(&settings);
        assert_eq!(filter.owner.as_deref(), Some("jara"));
        assert_eq!(filter.group.as_deref(), Some("default"));
    }
}
