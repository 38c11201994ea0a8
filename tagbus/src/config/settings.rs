//! YAML configuration: where the bus listens and which tags a process
//! declares. Only the bus core's slice of the configuration is modelled
//! here; drivers and the web gateway read their own sections from the
//! same files.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::Value;
use crate::tags::{TagKind, TagMetadata, TagSpec};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("tag {0} declares no type")]
    MissingType(String),
    #[error("tag {0} has multi states and must be int")]
    MultiNotInt(String),
    #[error("tag {0} init value does not match its type")]
    InitMismatch(String),
    #[error("bad bus address: {0}")]
    BadAddress(#[from] std::net::AddrParseError),
    #[error("cannot read configuration: {0}")]
    Read(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// The `bus:` section. Loopback by default; TLS and authentication are
/// an external reverse proxy's job.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Transmit-unit size stated to every connection in the hello.
    #[serde(default = "default_tus")]
    pub tus: usize,
}

fn default_ip() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    1324
}

fn default_tus() -> usize {
    crate::protocol::DEFAULT_TUS
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings {
            ip: default_ip(),
            port: default_port(),
            tus: default_tus(),
        }
    }
}

impl BusSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, SettingsError> {
        Ok(format!("{}:{}", self.ip, self.port).parse()?)
    }
}

/// One entry of the `tags:` map.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TagDeclaration {
    #[serde(rename = "type")]
    pub kind: Option<TagKind>,
    pub desc: Option<String>,
    pub units: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub dp: Option<u32>,
    /// Ordered state labels; implies `type: int`.
    pub multi: Option<Vec<String>>,
    /// Initial value, applied before the bus connection exists.
    pub init: Option<serde_json::Value>,
    pub format: Option<String>,
}

impl TagDeclaration {
    /// Resolve the declaration into a registry spec, validating the
    /// multi/int rule and the init value's type.
    pub fn to_spec(&self, name: &str) -> Result<TagSpec, SettingsError> {
        let kind = match (self.kind, &self.multi) {
            (Some(TagKind::Int) | None, Some(_)) => TagKind::Int,
            (Some(_), Some(_)) => return Err(SettingsError::MultiNotInt(name.to_owned())),
            (Some(kind), None) => kind,
            (None, None) => return Err(SettingsError::MissingType(name.to_owned())),
        };

        let init = match &self.init {
            None => None,
            Some(raw) => Some(init_value(name, kind, raw)?),
        };

        Ok(TagSpec {
            kind,
            metadata: TagMetadata {
                desc: self.desc.clone(),
                units: self.units.clone(),
                min: self.min,
                max: self.max,
                dp: self.dp,
                multi: self.multi.clone(),
                format: self.format.clone(),
            },
            init,
        })
    }
}

fn init_value(name: &str, kind: TagKind, raw: &serde_json::Value) -> Result<Value, SettingsError> {
    let mismatch = || SettingsError::InitMismatch(name.to_owned());
    match kind {
        TagKind::Int => raw.as_i64().map(Value::Int).ok_or_else(mismatch),
        TagKind::Float => raw.as_f64().map(Value::Float).ok_or_else(mismatch),
        TagKind::Str => raw
            .as_str()
            .map(|s| Value::Text(s.to_owned()))
            .ok_or_else(mismatch),
        // Raw byte blobs cannot be written in YAML.
        TagKind::Bytes => Err(mismatch()),
        TagKind::Dict => {
            if raw.is_object() {
                Ok(Value::Json(raw.clone()))
            } else {
                Err(mismatch())
            }
        }
        TagKind::List => {
            if raw.is_array() {
                Ok(Value::Json(raw.clone()))
            } else {
                Err(mismatch())
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub tags: HashMap<String, TagDeclaration>,
}

impl Settings {
    /// Load from a YAML file. Tag names are case-sensitive identifiers
    /// on the bus, so the file's keys are taken exactly as written.
    pub fn load(config_path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(config_path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
