//! INF sidecar metadata files.
//!
//! Every stored BBC file `<host-path>` may have a sibling `<host-path>.inf`
//! whose first line is `NAME LOAD EXEC [ATTR|CRC=…]` with hexadecimal load
//! and exec addresses. A missing or empty sidecar implies defaults.

use std::path::{Path, PathBuf};

use std::io;

use tokio::fs;

/// Load/exec value given to files with no stored addresses.
pub const DEFAULT_LOAD: u32 = 0xffff_ffff;
pub const DEFAULT_EXEC: u32 = 0xffff_ffff;

/// Sentinel addresses that make *RUN refuse with "Won't".
pub const SHOULDNT_LOAD: u32 = 0xdead_dead;
pub const SHOULDNT_EXEC: u32 = 0xdead_dead;

/// BBC file attribute bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileAttributes(pub u8);

impl FileAttributes {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const LOCKED: u8 = 0x08;

    /// Readable and writable, not locked.
    pub fn default_set() -> Self {
        Self(Self::READ | Self::WRITE)
    }

    pub fn locked_set() -> Self {
        Self(Self::READ | Self::WRITE | Self::LOCKED)
    }

    pub fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self::default_set()
    }
}

/// Parsed contents of one INF first line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfData {
    pub name: String,
    pub load: u32,
    pub exec: u32,
    pub attr: FileAttributes,
    /// Raw `CRC=…` token, preserved verbatim on rewrite.
    pub crc: Option<String>,
}

impl InfData {
    pub fn with_defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            load: DEFAULT_LOAD,
            exec: DEFAULT_EXEC,
            attr: FileAttributes::default(),
            crc: None,
        }
    }
}

/// The sidecar path for a stored file.
pub fn inf_path(host_path: &Path) -> PathBuf {
    let mut name = host_path.file_name().unwrap_or_default().to_os_string();
    name.push(".inf");
    host_path.with_file_name(name)
}

/// Parses a hex address token. A 6-digit value starting `FF` is the 6502
/// second-processor quirk for a host address: it reads as `FFFFxxxx`.
fn parse_address(token: &str) -> Option<u32> {
    let value = u32::from_str_radix(token, 16).ok()?;
    if token.len() == 6 && token[..2].eq_ignore_ascii_case("ff") {
        Some(value | 0xff00_0000)
    } else {
        Some(value)
    }
}

/// Parses the first line of an INF file. `fallback_name` fills in when the
/// line is empty.
pub fn parse_line(line: &str, fallback_name: &str) -> io::Result<InfData> {
    let mut tokens = line.split_whitespace();

    let name = match tokens.next() {
        Some(name) => name.to_string(),
        None => return Ok(InfData::with_defaults(fallback_name)),
    };

    let mut data = InfData { name, ..InfData::with_defaults(fallback_name) };

    if let Some(token) = tokens.next() {
        data.load = parse_address(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad INF load address"))?;
    }
    if let Some(token) = tokens.next() {
        data.exec = parse_address(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad INF exec address"))?;
    }

    if let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("l") {
            data.attr = FileAttributes::locked_set();
        } else if token.len() >= 4 && token[..4].eq_ignore_ascii_case("crc=") {
            data.crc = Some(token.to_string());
        } else if let Ok(bits) = u8::from_str_radix(token, 16) {
            data.attr = FileAttributes(bits);
        } else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad INF attributes"));
        }
    }

    Ok(data)
}

/// Formats the first line for writing.
pub fn format_line(data: &InfData) -> String {
    let mut line = format!("{} {:08X} {:08X}", data.name, data.load, data.exec);
    if data.attr == FileAttributes::locked_set() {
        line.push_str(" L");
    } else if data.attr != FileAttributes::default_set() {
        line.push_str(&format!(" {:02X}", data.attr.0));
    } else if let Some(crc) = &data.crc {
        line.push(' ');
        line.push_str(crc);
    }
    line
}

/// Reads the sidecar for `host_path`. Missing or empty sidecars yield
/// defaults with `fallback_name`.
pub async fn read(host_path: &Path, fallback_name: &str) -> io::Result<InfData> {
    let contents = match fs::read(inf_path(host_path)).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(InfData::with_defaults(fallback_name));
        }
        Err(err) => return Err(err),
    };

    let text = String::from_utf8_lossy(&contents);
    parse_line(text.lines().next().unwrap_or(""), fallback_name)
}

/// Writes (or rewrites) the sidecar for `host_path`.
pub async fn write(host_path: &Path, data: &InfData) -> io::Result<()> {
    let line = format_line(data);
    fs::write(inf_path(host_path), format!("{line}\n")).await
}

/// Removes the sidecar for `host_path` if there is one.
pub async fn remove(host_path: &Path) -> io::Result<()> {
    match fs::remove_file(inf_path(host_path)).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
