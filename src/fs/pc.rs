//! The PC-like volume personality.
//!
//! A PC volume is a flat host directory served read-only: no drives, no
//! directory characters, names up to 31 printable characters. Files get the
//! default load/exec addresses and cannot be *RUN.

use std::io;
use std::path::PathBuf;

use tokio::fs;

use crate::error::{BbcError, BbcResult, ErrorCode};
use crate::inf;
use crate::wire::BNL;

use super::{afsp, BeebFile, Volume, VOLUME_MARKER};

/// Maximum length of a PC file name.
pub const MAX_NAME_LEN: usize = 31;

const CAT_CELL_WIDTH: usize = 20;
const CAT_CELLS_PER_LINE: usize = 2;

pub fn is_valid_name_char(c: u8, wildcards_ok: bool) -> bool {
    if !(0x21..=0x7e).contains(&c) {
        return false;
    }
    if matches!(c, b'"' | b'|' | b'/' | b'\\' | b':') {
        return false;
    }
    if !wildcards_ok && matches!(c, b'*' | b'#') {
        return false;
    }
    true
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|c| is_valid_name_char(c, false))
}

/// Parses a PC file spec: just a name, optionally preceded by a single `:`
/// or `/` when the spec comes from the middle of a command line.
pub fn parse_file_spec(raw: &[u8], mid_line: bool, wildcards_ok: bool) -> BbcResult<String> {
    let mut raw = raw;
    if mid_line {
        if let [b':' | b'/', rest @ ..] = raw {
            raw = rest;
        }
    }
    let name = std::str::from_utf8(raw).map_err(|_| BbcError::stock(ErrorCode::BadName))?;
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BbcError::stock(ErrorCode::BadName));
    }
    if !name.bytes().all(|c| is_valid_name_char(c, wildcards_ok)) {
        return Err(BbcError::stock(ErrorCode::BadName));
    }
    Ok(name.to_string())
}

pub fn host_path(volume: &Volume, name: &str) -> PathBuf {
    volume.path.join(name)
}

/// Lists every file in the volume.
pub async fn scan(volume: &Volume) -> io::Result<Vec<BeebFile>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(&volume.path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let host_name = entry.file_name();
        let host_name = host_name.to_string_lossy().into_owned();
        if host_name.starts_with('.')
            || host_name == VOLUME_MARKER
            || host_name.to_ascii_lowercase().ends_with(".inf")
        {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || !is_valid_name(&host_name) {
            continue;
        }
        let sidecar = inf::read(&entry.path(), &host_name).await?;
        files.push(BeebFile {
            host_path: entry.path(),
            drive: '0',
            dir: '$',
            name: host_name,
            load: sidecar.load,
            exec: sidecar.exec,
            attr: sidecar.attr,
            size: metadata.len(),
        });
    }
    files.sort_by_key(|f| f.name.to_ascii_lowercase());
    Ok(files)
}

pub async fn find_file(volume: &Volume, name: &str) -> io::Result<Option<BeebFile>> {
    let files = scan(volume).await?;
    Ok(files.into_iter().find(|f| f.name.eq_ignore_ascii_case(name)))
}

pub async fn find_matching(volume: &Volume, name_afsp: &str) -> BbcResult<Vec<BeebFile>> {
    let re = afsp::to_regex(name_afsp)?;
    let files = scan(volume).await?;
    Ok(files.into_iter().filter(|f| re.is_match(&f.name)).collect())
}

/// Formats the catalogue for a PC volume.
pub async fn cat_text(volume: &Volume) -> BbcResult<Vec<u8>> {
    let files = scan(volume).await?;

    let mut text = Vec::new();
    text.extend_from_slice(format!("Volume: {}", volume.name).as_bytes());
    text.extend_from_slice(BNL);
    text.extend_from_slice(BNL);

    for (i, file) in files.iter().enumerate() {
        let mut cell = format!("  {}", file.name);
        while cell.len() < CAT_CELL_WIDTH {
            cell.push(' ');
        }
        text.extend_from_slice(cell.as_bytes());
        if i % CAT_CELLS_PER_LINE == CAT_CELLS_PER_LINE - 1 {
            text.extend_from_slice(BNL);
        }
    }
    if files.len() % CAT_CELLS_PER_LINE != 0 {
        text.extend_from_slice(BNL);
    }

    Ok(text)
}

/// One *INFO/*EX line for a PC file.
pub fn info_line(file: &BeebFile) -> String {
    format!("{:<31} {:08X} {:08X} {:06X}", file.name, file.load, file.exec, file.size)
}
