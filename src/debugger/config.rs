use crate::debugger::error::Error;
use crate::muted_error;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// Debugee CPU architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// Software breakpoint instruction.
    pub fn breakpoint_instruction(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => &[0xCC],
            // brk #0
            Arch::Aarch64 => &[0x00, 0x00, 0x20, 0xD4],
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DebuggerConfig {
    /// Blocking stop timeout, zero means wait forever.
    pub stop_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_patch_entries: u32,
    pub arch: Arch,
    pub interop: bool,
}

const PRESET: &str = include_str!("preset/config.toml");

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self::parse("").expect("should de")
    }
}

impl DebuggerConfig {
    const DEFAULT_PATH: &'static str = ".config/oopdbg/config.toml";

    /// Load configuration from `path` or from the default location in user home directory.
    /// Missing default file means default configuration.
    pub fn from_file(path: Option<&Path>) -> Result<Self, Error> {
        let data = match path {
            Some(path) => read_to_string(path)?,
            None => {
                let Some(path) = home::home_dir().map(|home| home.join(Self::DEFAULT_PATH))
                else {
                    return Ok(Self::default());
                };
                match muted_error!(read_to_string(path)) {
                    Some(data) => data,
                    None => return Ok(Self::default()),
                }
            }
        };
        Self::parse(&data)
    }

    /// Parse configuration, settings missing in `data` are taken from the preset.
    pub fn parse(data: &str) -> Result<Self, Error> {
        let mut table: toml::Table = toml::de::from_str(PRESET)?;
        let user: toml::Table = toml::de::from_str(data)?;
        table.extend(user);
        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        (self.stop_timeout_ms != 0).then(|| Duration::from_millis(self.stop_timeout_ms))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
