//! Small JSON preference file (0600). Holds nothing secret: UI hints and
//! runtime toggles only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use murmure_store::PinParams;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prefs {
    #[serde(default)]
    pub keep_transport_in_background: bool,
    /// Last published onion, shown while unreachable. Not authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_onion: Option<String>,
    /// PIN KDF parameters, present only while PIN mode is enabled. The key
    /// file stays the source of truth; this is the readable mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_kdf: Option<PinParams>,
}

#[derive(Debug)]
pub struct PrefStore {
    path: PathBuf,
}

impl PrefStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Prefs {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "unreadable prefs file, starting fresh");
                Prefs::default()
            }),
            Err(_) => Prefs::default(),
        }
    }

    pub fn save(&self, prefs: &Prefs) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(prefs)
            .map_err(|e| crate::error::NodeError::Other(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        set_private(&self.path)?;
        Ok(())
    }

    pub fn update(&self, mutate: impl FnOnce(&mut Prefs)) -> Result<Prefs> {
        let mut prefs = self.load();
        mutate(&mut prefs);
        self.save(&prefs)?;
        Ok(prefs)
    }
}

#[cfg(unix)]
fn set_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
