use std::path::Path;

use serde::{Deserialize, Serialize};
use updraft_core::ClientConfig;

use crate::error::CliError;

/// The units this host manages, stored as `units.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitsFile {
    #[serde(default)]
    pub units: Vec<ClientConfig>,
}

impl UnitsFile {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let content = std::fs::read_to_string(path)
            .map_err(|error| CliError::io("failed to read units file", error))?;
        let file: Self = serde_json::from_str(&content).map_err(|source| CliError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.units.is_empty() {
            return Err(CliError::NoUnits(path.to_path_buf()));
        }
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| CliError::io("failed to create config directory", error))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| CliError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content)
            .map_err(|error| CliError::io("failed to write units file", error))
    }

    /// The selected unit, or every unit when `unit_id` is `None`.
    pub fn select(&self, unit_id: Option<&str>) -> Result<Vec<ClientConfig>, CliError> {
        match unit_id {
            None => Ok(self.units.clone()),
            Some(unit_id) => self
                .units
                .iter()
                .find(|unit| unit.unit_id == unit_id)
                .cloned()
                .map(|unit| vec![unit])
                .ok_or_else(|| CliError::UnknownUnit(unit_id.to_string())),
        }
    }
}
