//! Local cache of sidebar preferences.
//!
//! Preferences are stored in `sidebar-preferences.json` within the config
//! directory so the sidebar comes back the way it was left even before the
//! backend answers. Writes go to a temp file that is renamed into place.

use anyhow::{Context, Result};
use sidebar_core::UiPrefs;
use std::fs;
use std::path::{Path, PathBuf};

pub const PREFERENCES_FILE: &str = "sidebar-preferences.json";

/// Storage for locally cached preferences.
pub struct PrefsStorage {
    path: PathBuf,
}

impl PrefsStorage {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(PREFERENCES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached preferences. A missing file yields `None`; a corrupt one
    /// is logged and ignored.
    pub fn load(&self) -> Option<UiPrefs> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str::<UiPrefs>(&contents) {
            Ok(prefs) => Some(prefs.sanitized()),
            Err(e) => {
                tracing::warn!("Ignoring corrupt preferences cache {:?}: {}", self.path, e);
                None
            }
        }
    }

    pub fn save(&self, prefs: &UiPrefs) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(prefs)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move {:?} into place", tmp))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        assert!(PrefsStorage::new(dir.path()).load().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let storage = PrefsStorage::new(&dir.path().join("nested"));
        let prefs = UiPrefs {
            version: 3,
            updated_at: 42,
            pinned_session_ids: vec!["s_1".into(), " s_1 ".into(), "s_2".into()],
            recent_sessions_open: true,
            ..UiPrefs::default()
        };
        storage.save(&prefs).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.pinned_session_ids, vec!["s_1", "s_2"]);
        assert!(loaded.recent_sessions_open);
        assert!(!storage.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PREFERENCES_FILE), "not json").unwrap();
        assert!(PrefsStorage::new(dir.path()).load().is_none());
    }
}
