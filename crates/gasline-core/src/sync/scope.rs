//! Persistence of the selected agency across restarts.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{Config, ConfigError};

/// Where the selected scope id lives between sessions.
pub trait ScopeStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<String>, ConfigError>;
    fn save(&self, scope_id: Option<&str>) -> Result<(), ConfigError>;
}

/// Stores the selection in the `selected_agency_id` field of the config file,
/// leaving every other field untouched.
#[derive(Debug, Clone)]
pub struct ConfigScopeStore {
    path: PathBuf,
}

impl ConfigScopeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store backed by the default config file.
    pub fn from_default_path() -> Result<Self, ConfigError> {
        Ok(Self::new(Config::config_path()?))
    }
}

impl ScopeStore for ConfigScopeStore {
    fn load(&self) -> Result<Option<String>, ConfigError> {
        Ok(Config::load_from(&self.path)?.selected_agency_id)
    }

    fn save(&self, scope_id: Option<&str>) -> Result<(), ConfigError> {
        let mut config = Config::load_from(&self.path)?;
        if config.selected_agency_id.as_deref() == scope_id {
            return Ok(());
        }
        config.selected_agency_id = scope_id.map(str::to_string);
        config.save_to(&self.path)
    }
}

/// Process-local store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryScopeStore {
    selected: Arc<Mutex<Option<String>>>,
}

impl MemoryScopeStore {
    pub fn with_selection(scope_id: &str) -> Self {
        Self {
            selected: Arc::new(Mutex::new(Some(scope_id.to_string()))),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.selected
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ScopeStore for MemoryScopeStore {
    fn load(&self) -> Result<Option<String>, ConfigError> {
        Ok(self.current())
    }

    fn save(&self, scope_id: Option<&str>) -> Result<(), ConfigError> {
        let mut guard = self
            .selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = scope_id.map(str::to_string);
        Ok(())
    }
}
