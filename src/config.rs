//! Server configuration.
//!
//! A TOML file supplies the volume search roots, ROM images and defaults;
//! the binary's command-line flags layer on top of it.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One ROM image. `subtype` selects it for a specific link subtype; an
/// entry without one is the fallback.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RomConfig {
    pub subtype: Option<u8>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Folders scanned recursively for volume markers.
    pub folders: Vec<PathBuf>,
    /// Volume mounted when a session starts. First discovered otherwise.
    pub default_volume: Option<String>,
    pub roms: Vec<RomConfig>,
    /// Hex-dump every request and response at debug level.
    pub dump_packets: bool,
}

impl Config {
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// The ROM image path for a link subtype: an exact match, or the entry
    /// with no subtype.
    pub fn rom_path(&self, subtype: u8) -> Option<&PathBuf> {
        self.roms
            .iter()
            .find(|rom| rom.subtype == Some(subtype))
            .or_else(|| self.roms.iter().find(|rom| rom.subtype.is_none()))
            .map(|rom| &rom.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let config: Config = toml::from_str(
            r#"
            folders = ["/beeb/volumes", "/beeb/more"]
            default_volume = "Games"
            dump_packets = true

            [[roms]]
            path = "roms/beeblink.rom"

            [[roms]]
            subtype = 1
            path = "roms/beeblink_tube.rom"
            "#,
        )
        .unwrap();
        assert_eq!(config.folders.len(), 2);
        assert_eq!(config.default_volume.as_deref(), Some("Games"));
        assert!(config.dump_packets);
        assert_eq!(config.rom_path(1), Some(&PathBuf::from("roms/beeblink_tube.rom")));
        assert_eq!(config.rom_path(9), Some(&PathBuf::from("roms/beeblink.rom")));
    }

    #[test]
    fn defaults_are_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rom_path(0), None);
    }
}
