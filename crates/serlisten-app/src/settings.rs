use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    None,
    Lf,
    Cr,
    Crlf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Lf => b"\n",
            LineEnding::Cr => b"\r",
            LineEnding::Crlf => b"\r\n",
        }
    }
}

/// Values remembered between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub encoding: String,
    pub hex: bool,
    pub chunk_size: usize,
    pub line_ending: LineEnding,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9_600,
            encoding: "auto".to_string(),
            hex: false,
            chunk_size: serlisten_core::DEFAULT_CHUNK_SIZE,
            line_ending: LineEnding::None,
        }
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("serlisten").join("settings.json"))
}

impl Settings {
    /// Missing files give the defaults; unreadable ones are reported and
    /// ignored.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no settings at {}", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("cannot read {}: {e}", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("ignoring malformed settings in {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("settings saved to {}", path.display());
        Ok(())
    }
}
