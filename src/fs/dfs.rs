//! The DFS-like volume personality.
//!
//! A DFS volume is a directory with one subdirectory per drive (single
//! alphanumeric character). Files live directly in the drive directory as
//! `D.NAME`, where `D` is the BBC directory character, with an INF sidecar
//! each. Per-drive metadata lives in `.opt4` (boot option) and `.title`.

use std::io;
use std::path::PathBuf;

use tokio::fs;

use crate::error::{BbcError, BbcResult, ErrorCode};
use crate::inf;
use crate::wire::BNL;

use super::{afsp, BeebFile, DfsState, Volume};

/// Maximum length of a DFS file name.
pub const MAX_NAME_LEN: usize = 10;

/// Maximum length of a disc title.
pub const MAX_TITLE_LEN: usize = 39;

/// Boot option descriptions, indexed by the `*OPT 4` value.
pub const BOOT_DESCRIPTIONS: [&str; 4] = ["None", "LOAD", "RUN", "EXEC"];

/// Catalogue entries occupy fixed-width cells.
const CAT_CELL_WIDTH: usize = 20;
const CAT_CELLS_PER_LINE: usize = 2;

pub fn is_valid_drive_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
}

/// Characters acceptable in names and directory characters. Printable
/// ASCII, minus the separators the parser owns and anything unsafe in a
/// host file name.
pub fn is_valid_name_char(c: u8, wildcards_ok: bool) -> bool {
    if !(0x21..=0x7e).contains(&c) {
        return false;
    }
    if matches!(c, b'.' | b':' | b'"' | b'|' | b'/' | b'\\') {
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

/// Result of parsing a DFS file spec: drive, dir (with explicit flags) and
/// the name.
#[derive(Debug)]
pub struct ParsedName {
    pub drive: char,
    pub drive_explicit: bool,
    pub dir: char,
    pub dir_explicit: bool,
    pub name: String,
}

/// Parses `[:D[.]][X.]NAME`. Unspecified components come from `state`.
pub fn parse_file_spec(raw: &[u8], state: &DfsState, wildcards_ok: bool) -> BbcResult<ParsedName> {
    let (drive, drive_explicit, dir, dir_explicit, rest) = parse_prefix(raw, state, wildcards_ok)?;

    let name = std::str::from_utf8(rest)
        .map_err(|_| BbcError::stock(ErrorCode::BadName))?
        .to_string();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BbcError::stock(ErrorCode::BadName));
    }
    if !name.bytes().all(|c| is_valid_name_char(c, wildcards_ok)) {
        return Err(BbcError::stock(ErrorCode::BadName));
    }

    Ok(ParsedName { drive, drive_explicit, dir, dir_explicit, name })
}

/// Parses `[:D[.]][X]` as used by *DIR and *LIB.
pub fn parse_dir_spec(raw: &[u8], state: &DfsState) -> BbcResult<(char, bool, char, bool)> {
    let (drive, drive_explicit, mut dir, mut dir_explicit, rest) =
        parse_prefix(raw, state, false)?;

    match rest {
        [] => {}
        [c] if is_valid_name_char(*c, false) => {
            dir = *c as char;
            dir_explicit = true;
        }
        _ => return Err(BbcError::stock(ErrorCode::BadDir)),
    }
    Ok((drive, drive_explicit, dir, dir_explicit))
}

fn parse_prefix<'a>(
    raw: &'a [u8],
    state: &DfsState,
    wildcards_ok: bool,
) -> BbcResult<(char, bool, char, bool, &'a [u8])> {
    let mut i = 0;
    let mut drive = state.drive;
    let mut drive_explicit = false;
    let mut dir = state.dir;
    let mut dir_explicit = false;

    if raw.first() == Some(&b':') {
        i += 1;
        let d = *raw.get(i).ok_or_else(|| BbcError::stock(ErrorCode::BadDrive))?;
        if !is_valid_drive_char(d) {
            return Err(BbcError::stock(ErrorCode::BadDrive));
        }
        drive = d as char;
        drive_explicit = true;
        i += 1;
        if raw.get(i) == Some(&b'.') {
            i += 1;
        }
    }

    if i + 1 < raw.len() && raw[i + 1] == b'.' {
        let d = raw[i];
        if !is_valid_name_char(d, wildcards_ok) {
            return Err(BbcError::stock(ErrorCode::BadDir));
        }
        dir = d as char;
        dir_explicit = true;
        i += 2;
    }

    Ok((drive, drive_explicit, dir, dir_explicit, &raw[i..]))
}

/// The host directory holding one drive's files.
pub fn drive_path(volume: &Volume, drive: char) -> PathBuf {
    volume.path.join(drive.to_string())
}

/// The host name of a BBC file: directory character, dot, name.
pub fn host_file_name(dir: char, name: &str) -> String {
    format!("{dir}.{name}")
}

pub fn host_path(volume: &Volume, drive: char, dir: char, name: &str) -> PathBuf {
    drive_path(volume, drive).join(host_file_name(dir, name))
}

/// Splits a host file name back into (dir, name), or `None` if it is not a
/// stored BBC file.
fn split_host_name(host_name: &str) -> Option<(char, String)> {
    let bytes = host_name.as_bytes();
    if bytes.len() < 3 || bytes[1] != b'.' {
        return None;
    }
    if !is_valid_name_char(bytes[0], false) {
        return None;
    }
    let name = &host_name[2..];
    if !is_valid_name(name) {
        return None;
    }
    Some((bytes[0] as char, name.to_string()))
}

/// Lists the drives present in a volume.
pub async fn drives(volume: &Volume) -> io::Result<Vec<char>> {
    let mut drives = Vec::new();
    let mut entries = fs::read_dir(&volume.path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() == 1 && is_valid_drive_char(name.as_bytes()[0]) {
            drives.push(name.as_bytes()[0] as char);
        }
    }
    drives.sort_unstable();
    Ok(drives)
}

/// Lists every BBC file in one drive. A missing drive directory is an empty
/// drive.
pub async fn scan_drive(volume: &Volume, drive: char) -> io::Result<Vec<BeebFile>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(drive_path(volume, drive)).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err),
    };

    while let Some(entry) = entries.next_entry().await? {
        let host_name = entry.file_name();
        let host_name = host_name.to_string_lossy().into_owned();
        if host_name.starts_with('.') || host_name.to_ascii_lowercase().ends_with(".inf") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Some((dir, name)) = split_host_name(&host_name) else {
            continue;
        };

        let host_path = entry.path();
        let sidecar = inf::read(&host_path, &host_name).await?;
        files.push(BeebFile {
            host_path,
            drive,
            dir,
            name,
            load: sidecar.load,
            exec: sidecar.exec,
            attr: sidecar.attr,
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| {
        (a.dir.to_ascii_lowercase(), a.name.to_ascii_lowercase())
            .cmp(&(b.dir.to_ascii_lowercase(), b.name.to_ascii_lowercase()))
    });
    Ok(files)
}

/// Finds a single file by exact (case-insensitive) dir and name.
pub async fn find_file(
    volume: &Volume,
    drive: char,
    dir: char,
    name: &str,
) -> io::Result<Option<BeebFile>> {
    let files = scan_drive(volume, drive).await?;
    Ok(files.into_iter().find(|f| {
        f.dir.eq_ignore_ascii_case(&dir) && f.name.eq_ignore_ascii_case(name)
    }))
}

/// Finds the files matching an AFSP dir/name pair in one drive.
pub async fn find_matching(
    volume: &Volume,
    drive: char,
    dir: char,
    name_afsp: &str,
) -> BbcResult<Vec<BeebFile>> {
    let dir_re = afsp::to_regex(&dir.to_string())?;
    let name_re = afsp::to_regex(name_afsp)?;
    let files = scan_drive(volume, drive).await?;
    Ok(files
        .into_iter()
        .filter(|f| dir_re.is_match(&f.dir.to_string()) && name_re.is_match(&f.name))
        .collect())
}

pub async fn load_boot_option(volume: &Volume, drive: char) -> io::Result<u8> {
    match fs::read_to_string(drive_path(volume, drive).join(".opt4")).await {
        Ok(text) => Ok(text.trim().parse::<u8>().unwrap_or(0).min(3)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

pub async fn save_boot_option(volume: &Volume, drive: char, option: u8) -> io::Result<()> {
    let path = drive_path(volume, drive);
    fs::create_dir_all(&path).await?;
    fs::write(path.join(".opt4"), format!("{}\n", option & 3)).await
}

pub async fn load_title(volume: &Volume, drive: char) -> io::Result<String> {
    match fs::read_to_string(drive_path(volume, drive).join(".title")).await {
        Ok(text) => {
            let mut title = text.lines().next().unwrap_or("").to_string();
            title.truncate(MAX_TITLE_LEN);
            Ok(title)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

pub async fn save_title(volume: &Volume, drive: char, title: &str) -> io::Result<()> {
    let path = drive_path(volume, drive);
    fs::create_dir_all(&path).await?;
    fs::write(path.join(".title"), format!("{title}\n")).await
}

fn pad_cell(mut cell: String) -> String {
    while cell.len() < CAT_CELL_WIDTH {
        cell.push(' ');
    }
    cell
}

/// Formats the BBC-style catalogue for one drive.
pub async fn cat_text(volume: &Volume, drive: char, state: &DfsState) -> BbcResult<Vec<u8>> {
    let title = load_title(volume, drive).await?;
    let option = load_boot_option(volume, drive).await?;
    let mut files = scan_drive(volume, drive).await?;

    // current directory first, then dir, then name
    files.sort_by_key(|f| {
        (
            !f.dir.eq_ignore_ascii_case(&state.dir),
            f.dir.to_ascii_lowercase(),
            f.name.to_ascii_lowercase(),
        )
    });

    let mut text = Vec::new();
    text.extend_from_slice(title.as_bytes());
    text.extend_from_slice(BNL);
    text.extend_from_slice(format!("Volume: {}", volume.name).as_bytes());
    text.extend_from_slice(BNL);

    let option_desc = BOOT_DESCRIPTIONS[(option & 3) as usize];
    let drive_cell = pad_cell(format!("Drive {drive} ({option} - {option_desc})"));
    text.extend_from_slice(drive_cell.as_bytes());
    text.extend_from_slice(format!("Dir :{}.{}", state.drive, state.dir).as_bytes());
    text.extend_from_slice(BNL);
    text.extend_from_slice(pad_cell(String::new()).as_bytes());
    text.extend_from_slice(format!("Lib :{}.{}", state.lib_drive, state.lib_dir).as_bytes());
    text.extend_from_slice(BNL);
    text.extend_from_slice(BNL);

    for (i, file) in files.iter().enumerate() {
        let mut cell = format!("  {}.{}", file.dir, file.name);
        if file.attr.is_locked() {
            cell.push_str(" L");
        }
        text.extend_from_slice(pad_cell(cell).as_bytes());
        if i % CAT_CELLS_PER_LINE == CAT_CELLS_PER_LINE - 1 {
            text.extend_from_slice(BNL);
        }
    }
    if files.len() % CAT_CELLS_PER_LINE != 0 {
        text.extend_from_slice(BNL);
    }

    Ok(text)
}

/// One *INFO/*EX line for a file.
pub fn info_line(file: &BeebFile) -> String {
    format!(
        "{}.{:<10} {} {:08X} {:08X} {:06X}",
        file.dir,
        file.name,
        if file.attr.is_locked() { "L" } else { " " },
        file.load,
        file.exec,
        file.size,
    )
}

#[cfg(test)]
mod tests;
