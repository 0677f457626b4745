//! Module Control
//!
//! Read-mostly view of installed modules for one module WebUI, plus KPM
//! pass-through.

use log::warn;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::ModuleBackend;
use crate::error::{BridgeError, BridgeResult};

/// Module queries on behalf of the module living in `module_dir`
pub struct ModuleControl {
    backend: Arc<dyn ModuleBackend>,
    module_dir: PathBuf,
}

impl ModuleControl {
    pub fn new(backend: Arc<dyn ModuleBackend>, module_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            module_dir: module_dir.into(),
        }
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    /// The calling module's id: the last component of its directory
    pub fn module_id(&self) -> String {
        self.module_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Every installed module as reported by the backend
    pub async fn list(&self) -> BridgeResult<Vec<Map<String, Value>>> {
        let raw = self.backend.list_modules().await?;
        parse_module_list(&raw)
    }

    /// `moduleDir` plus every field of the matching module entry. Without a
    /// match, or when the listing fails, only `moduleDir` is returned.
    pub async fn module_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert(
            "moduleDir".to_string(),
            Value::String(self.module_dir.to_string_lossy().into_owned()),
        );

        let modules = match self.list().await {
            Ok(modules) => modules,
            Err(e) => {
                warn!("Module listing failed, returning directory only: {}", e);
                return info;
            }
        };

        let id = self.module_id();
        if let Some(module) = modules
            .into_iter()
            .find(|m| m.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            info.extend(module);
        }
        info
    }

    /// Every kernel patch module
    pub async fn list_all_kpm(&self) -> BridgeResult<Vec<Value>> {
        let raw = self.backend.list_kpm().await?;
        Ok(parse_kpm_list(&raw))
    }

    /// Control a KPM; the result code is passed through untouched
    pub async fn control_kpm(&self, name: &str, args: &str) -> BridgeResult<i32> {
        if name.trim().is_empty() {
            return Err(BridgeError::InvalidArguments("KPM name is empty".to_string()));
        }
        self.backend.control_kpm(name, args).await
    }
}

fn parse_module_list(raw: &str) -> BridgeResult<Vec<Map<String, Value>>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<Value> = serde_json::from_str(raw)
        .map_err(|e| BridgeError::ModuleQuery(format!("module list is not a JSON array: {}", e)))?;

    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

/// JSON arrays pass through; anything else is read as one name per line
fn parse_kpm_list(raw: &str) -> Vec<Value> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items;
    }

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Value::String(line.to_string()))
        .collect()
}
