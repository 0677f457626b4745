//! Bridge Configuration
//!
//! TOML-backed settings for the privileged shell, the executors and the
//! module backend. Every key is optional; missing keys take their defaults.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, BridgeResult};

const CONFIG_DIR_NAME: &str = "ksu-webui";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub shell: ShellConfig,
    pub exec: ExecConfig,
    pub modules: ModulesConfig,
    pub webui: WebUiConfig,
}

/// How privileged shells are launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Binary that yields a root shell
    pub program: String,
    /// Extra arguments passed before any flag-derived ones
    pub args: Vec<String>,
    /// Run in the global mount namespace (`--mount-master`)
    pub global_mount_namespace: bool,
    /// Probe `id -u` after opening and require uid 0
    pub verify_root: bool,
    /// Grace period for `exit` before the shell is killed
    pub close_timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "su".to_string(),
            args: Vec::new(),
            global_mount_namespace: true,
            verify_root: true,
            close_timeout_ms: 5000,
        }
    }
}

impl ShellConfig {
    /// Plain `sh` with no root probe. Used by tests and unprivileged dry runs.
    pub fn unprivileged() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            global_mount_namespace: false,
            verify_root: false,
            close_timeout_ms: 2000,
        }
    }

    /// Full argument vector for the shell program
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.global_mount_namespace {
            args.push("--mount-master".to_string());
        }
        args
    }
}

/// Executor settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Keep one idle shell around for synchronous calls
    pub reuse_session: bool,
    /// Synchronous call timeout in seconds, 0 disables it
    pub timeout_secs: u64,
}

/// Module backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub root: PathBuf,
    pub ksud: PathBuf,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/data/adb/modules"),
            ksud: PathBuf::from("/data/adb/ksud"),
        }
    }
}

impl ModulesConfig {
    /// Directory of an installed module
    pub fn module_dir(&self, module_id: &str) -> PathBuf {
        self.root.join(module_id)
    }
}

/// Host surface settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebUiConfig {
    /// Allow devtools in the module webview
    pub enable_web_debugging: bool,
    /// Listen address for the HTTP bridge
    pub bind: String,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            enable_web_debugging: false,
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> BridgeResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded bridge configuration from {}", path.display());
        Ok(config)
    }

    /// Default location, `<config_dir>/ksu-webui/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path` if given, else from the default location when it
    /// exists, else fall back to defaults.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}
