//! Command Builder
//!
//! Turns a base command, its arguments and the script-supplied options into a
//! single shell line.
//!
//! Nothing is quoted. Arguments, the working directory and environment values
//! reach the root shell exactly as the calling module wrote them; escaping is
//! the caller's job.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{BridgeError, BridgeResult};

/// Options accepted by `exec` and `spawn`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub cwd: Option<String>,
    /// Iterated in key order when building the line
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawOptions {
    #[serde(default)]
    cwd: Option<Value>,
    #[serde(default)]
    env: Option<BTreeMap<String, Value>>,
}

impl CommandOptions {
    /// Parse the options JSON. `None`, empty and `null` mean no options.
    pub fn from_json(json: Option<&str>) -> BridgeResult<Self> {
        let json = match json.map(str::trim) {
            None | Some("") | Some("null") => return Ok(Self::default()),
            Some(json) => json,
        };

        let raw: RawOptions = serde_json::from_str(json)
            .map_err(|e| BridgeError::InvalidArguments(format!("options: {}", e)))?;

        let cwd = raw.cwd.and_then(|v| match v {
            Value::Null => None,
            other => Some(stringify(other)),
        });
        let env = raw
            .env
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, stringify(v)))
            .collect();

        Ok(Self { cwd, env })
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

/// Positional arguments for `spawn`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentList(Vec<String>);

impl ArgumentList {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    /// Parse a JSON array. An empty string means no arguments.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }

        let values: Vec<Value> = serde_json::from_str(json)
            .map_err(|e| BridgeError::InvalidArguments(format!("args: {}", e)))?;
        Ok(Self(values.into_iter().map(stringify).collect()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for ArgumentList {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Build the final shell line: `cd <cwd>;` then one `export K=V;` per env
/// entry, then the command and its space-separated arguments.
pub fn build_command(base: &str, args: &[String], options: &CommandOptions) -> String {
    let mut line = String::new();

    if let Some(cwd) = options.cwd.as_deref().filter(|cwd| !cwd.is_empty()) {
        line.push_str("cd ");
        line.push_str(cwd);
        line.push(';');
    }

    for (name, value) in &options.env {
        line.push_str("export ");
        line.push_str(name);
        line.push('=');
        line.push_str(value);
        line.push(';');
    }

    line.push_str(base);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }

    line
}
