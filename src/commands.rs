//! The star-command interpreter.
//!
//! Commands live in a fixed table tried in order. A command matches on its
//! full name, on any abbreviation `NAME[0..i].` (splitting the typed part at
//! the dot), or on the exact `BLFS_`-prefixed name as an escape hatch. A
//! handler raising a syntax error with no text has it rewritten to
//! `Syntax: NAME hint`. Anything that matches nothing falls through to
//! *RUN, with the library directory as a fallback.

use crate::error::{BbcError, BbcResult, ErrorCode};
use crate::gsread::CommandLine;
use crate::image::{adfs, dfs, DiskImageFlow, ImageFormat, ImageTarget};
use crate::session::Session;
use crate::speedtest::SpeedTest;
use crate::wire::{special_sub, Response, ResponseCode, BNL};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    Access,
    Delete,
    Dir,
    Drive,
    Dump,
    Info,
    Lib,
    Locate,
    Read,
    Rename,
    SelfUpdate,
    Speed,
    SrLoad,
    Title,
    Type,
    Vol,
    VolBrowser,
    Vols,
    Write,
}

struct StarCommand {
    name: &'static str,
    syntax: &'static str,
    kind: Kind,
}

const COMMANDS: &[StarCommand] = &[
    StarCommand { name: "ACCESS", syntax: "<afsp> (L)", kind: Kind::Access },
    StarCommand { name: "DELETE", syntax: "<fsp>", kind: Kind::Delete },
    StarCommand { name: "DIR", syntax: "(<dir>)", kind: Kind::Dir },
    StarCommand { name: "DRIVE", syntax: "(<drive>)", kind: Kind::Drive },
    StarCommand { name: "DUMP", syntax: "<fsp>", kind: Kind::Dump },
    StarCommand { name: "INFO", syntax: "<afsp>", kind: Kind::Info },
    StarCommand { name: "LIB", syntax: "(<dir>)", kind: Kind::Lib },
    StarCommand { name: "LOCATE", syntax: "<afsp>", kind: Kind::Locate },
    StarCommand { name: "READ", syntax: "<image> <drive> (<format>) (ALL)", kind: Kind::Read },
    StarCommand { name: "RENAME", syntax: "<old fsp> <new fsp>", kind: Kind::Rename },
    StarCommand { name: "SELFUPDATE", syntax: "", kind: Kind::SelfUpdate },
    StarCommand { name: "SPEED", syntax: "", kind: Kind::Speed },
    StarCommand { name: "SRLOAD", syntax: "<fsp> <bank>", kind: Kind::SrLoad },
    StarCommand { name: "TITLE", syntax: "<title>", kind: Kind::Title },
    StarCommand { name: "TYPE", syntax: "<fsp>", kind: Kind::Type },
    StarCommand { name: "VOL", syntax: "(<name>) (R)", kind: Kind::Vol },
    StarCommand { name: "VOLBROWSER", syntax: "", kind: Kind::VolBrowser },
    StarCommand { name: "VOLS", syntax: "(<afsp>)", kind: Kind::Vols },
    StarCommand { name: "WRITE", syntax: "<image> <drive> (<format>)", kind: Kind::Write },
];

/// The *HELP BLFS text.
pub fn help_text() -> Vec<u8> {
    let mut text = Vec::new();
    text.extend_from_slice(b"Commands:");
    text.extend_from_slice(BNL);
    for command in COMMANDS {
        let line = if command.syntax.is_empty() {
            format!("  {}", command.name)
        } else {
            format!("  {} {}", command.name, command.syntax)
        };
        text.extend_from_slice(line.as_bytes());
        text.extend_from_slice(BNL);
    }
    text
}

/// Runs one star command line.
pub async fn execute(session: &mut Session, raw: &[u8]) -> BbcResult<Response> {
    let line = CommandLine::parse(raw)?;
    let Some(first) = line.parts.first() else {
        return Ok(Response::yes());
    };

    match match_command(&line.parts) {
        Some((command, args)) => {
            match run(session, command, &args).await {
                Err(err) if err.code == ErrorCode::Syntax && err.message.is_empty() => {
                    Err(BbcError::new(
                        ErrorCode::Syntax,
                        format!("Syntax: {} {}", command.name, command.syntax)
                            .trim_end()
                            .to_string(),
                    ))
                }
                result => result,
            }
        }
        // fall through to *RUN; a token that is not even a file name is
        // just a bad command
        None => match session.run_file(first).await {
            Err(err)
                if matches!(
                    err.code,
                    ErrorCode::BadName | ErrorCode::BadDrive | ErrorCode::BadDir
                ) =>
            {
                Err(BbcError::stock(ErrorCode::BadCommand))
            }
            result => result,
        },
    }
}

/// Finds the command the first part names, returning the argument list with
/// any split-off remainder inserted as the new second part.
fn match_command(parts: &[Vec<u8>]) -> Option<(&'static StarCommand, Vec<Vec<u8>>)> {
    let typed = parts[0].to_ascii_uppercase();

    for command in COMMANDS {
        let name = command.name.as_bytes();

        if typed.strip_prefix(b"BLFS_".as_slice()) == Some(name) {
            return Some((command, parts[1..].to_vec()));
        }

        for i in 1..name.len() {
            if typed.len() > i && typed[..i] == name[..i] && typed[i] == b'.' {
                return Some((command, with_remainder(parts, i + 1)));
            }
        }

        if typed == name {
            return Some((command, parts[1..].to_vec()));
        }
        if typed.len() > name.len() && typed.starts_with(name) {
            let next = typed[name.len()];
            if !next.is_ascii_alphabetic() {
                let skip = if next == b'.' { name.len() + 1 } else { name.len() };
                return Some((command, with_remainder(parts, skip)));
            }
        }
    }
    None
}

fn with_remainder(parts: &[Vec<u8>], split_at: usize) -> Vec<Vec<u8>> {
    let remainder = &parts[0][split_at..];
    let mut args = Vec::with_capacity(parts.len());
    if !remainder.is_empty() {
        args.push(remainder.to_vec());
    }
    args.extend(parts[1..].iter().cloned());
    args
}

fn required(args: &[Vec<u8>], index: usize) -> BbcResult<&[u8]> {
    args.get(index).map(Vec::as_slice).ok_or_else(BbcError::empty_syntax)
}

fn special(sub: u8) -> Response {
    Response::new(ResponseCode::Special, vec![sub])
}

async fn run(
    session: &mut Session,
    command: &'static StarCommand,
    args: &[Vec<u8>],
) -> BbcResult<Response> {
    match command.kind {
        Kind::Access => {
            let spec = required(args, 0)?;
            let attr = args.get(1).map(|a| String::from_utf8_lossy(a).into_owned());
            session.fs.access(spec, attr.as_deref().unwrap_or("")).await?;
            Ok(Response::yes())
        }
        Kind::Delete => {
            session.fs.delete(required(args, 0)?).await?;
            Ok(Response::yes())
        }
        Kind::Dir => {
            session.fs.set_dir(args.first().map(Vec::as_slice))?;
            Ok(Response::yes())
        }
        Kind::Drive => {
            match args.first() {
                Some(spec) => session.fs.set_drive(spec)?,
                None => session.fs.set_drive(b"0")?,
            }
            Ok(Response::yes())
        }
        Kind::Dump => {
            let (_, data) = session.fs.read_file(required(args, 0)?).await?;
            session.set_text(dump_text(&data));
            Ok(Response::yes())
        }
        Kind::Info => {
            let text = session.fs.info_text(required(args, 0)?).await?;
            session.set_text(text);
            Ok(Response::yes())
        }
        Kind::Lib => {
            session.fs.set_lib(args.first().map(Vec::as_slice))?;
            Ok(Response::yes())
        }
        Kind::Locate => {
            let spec = String::from_utf8_lossy(required(args, 0)?).into_owned();
            let files = session.fs.locate(&spec).await?;
            if files.is_empty() {
                return Err(BbcError::stock(ErrorCode::FileNotFound));
            }
            let mut text = Vec::new();
            for file in files {
                text.extend_from_slice(
                    format!(":{}.{}.{}", file.drive, file.dir, file.name).as_bytes(),
                );
                text.extend_from_slice(BNL);
            }
            session.set_text(text);
            Ok(Response::yes())
        }
        Kind::Read => disk_image_read(session, args),
        Kind::Rename => {
            let old = required(args, 0)?.to_vec();
            let new = required(args, 1)?.to_vec();
            session.fs.rename(&old, &new).await?;
            Ok(Response::yes())
        }
        Kind::SelfUpdate => Ok(special(special_sub::SELF_UPDATE)),
        Kind::Speed => {
            session.speed = Some(SpeedTest::new());
            Ok(special(special_sub::SPEED_TEST))
        }
        Kind::SrLoad => {
            let spec = required(args, 0)?.to_vec();
            let bank_str = String::from_utf8_lossy(required(args, 1)?).into_owned();
            let bank =
                u8::from_str_radix(&bank_str, 16).map_err(|_| BbcError::empty_syntax())?;
            if bank > 15 {
                return Err(BbcError::empty_syntax());
            }
            let (_, data) = session.fs.read_file(&spec).await?;
            let mut payload = Vec::with_capacity(2 + data.len());
            payload.push(special_sub::SRLOAD);
            payload.push(bank);
            payload.extend_from_slice(&data);
            Ok(Response::new(ResponseCode::Special, payload))
        }
        Kind::Title => {
            let title = String::from_utf8_lossy(required(args, 0)?).into_owned();
            session.fs.set_title(&title).await?;
            Ok(Response::yes())
        }
        Kind::Type => {
            let (_, data) = session.fs.read_file(required(args, 0)?).await?;
            session.set_text(type_text(&data));
            Ok(Response::yes())
        }
        Kind::Vol => {
            match args.first() {
                None => {}
                Some(spec) => {
                    let name = String::from_utf8_lossy(spec).into_owned();
                    let read_only = args
                        .get(1)
                        .map(|flag| flag.eq_ignore_ascii_case(b"R"))
                        .unwrap_or(false);
                    session.fs.mount_by_name(&name, read_only).await?;
                }
            }
            let volume = session.fs.volume().clone();
            let mut text = Vec::new();
            text.extend_from_slice(format!("Volume: {}", volume.name).as_bytes());
            text.extend_from_slice(BNL);
            text.extend_from_slice(format!("Path: {}", volume.path.display()).as_bytes());
            text.extend_from_slice(BNL);
            session.set_text(text);
            Ok(Response::yes())
        }
        Kind::VolBrowser => Ok(special(special_sub::VOLUME_BROWSER)),
        Kind::Vols => {
            let spec = args
                .first()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .unwrap_or_else(|| "*".to_string());
            let re = crate::fs::afsp::to_regex(&spec)?;
            let mut text = Vec::new();
            text.extend_from_slice(b"Volumes:");
            text.extend_from_slice(BNL);
            for volume in session.fs.volumes() {
                if re.is_match(&volume.name) {
                    text.extend_from_slice(format!("  {}", volume.name).as_bytes());
                    text.extend_from_slice(BNL);
                }
            }
            session.set_text(text);
            Ok(Response::yes())
        }
        Kind::Write => disk_image_write(session, args).await,
    }
}

fn parse_image_drive(arg: &[u8], format: ImageFormat) -> BbcResult<u8> {
    let drive = match arg {
        &[d @ b'0'..=b'9'] => d - b'0',
        _ => return Err(BbcError::stock(ErrorCode::BadDrive)),
    };
    let max = match format {
        // a double-sided transfer claims the second-side drive too
        ImageFormat::DfsDsd => 1,
        ImageFormat::DfsSsd => 3,
        _ => 7,
    };
    if drive > max {
        return Err(BbcError::stock(ErrorCode::BadDrive));
    }
    Ok(drive)
}

fn format_from_token(token: &[u8]) -> Option<ImageFormat> {
    match token.to_ascii_uppercase().as_slice() {
        b"SSD" => Some(ImageFormat::DfsSsd),
        b"DSD" => Some(ImageFormat::DfsDsd),
        b"ADS" => Some(ImageFormat::AdfsS),
        b"ADM" => Some(ImageFormat::AdfsM),
        b"ADL" => Some(ImageFormat::AdfsL),
        _ => None,
    }
}

/// The image format, from an explicit format token or from the image name's
/// extension (DFS names cannot carry one; PC names can). Also collects the
/// ALL flag.
fn parse_image_args(
    name_spec: &[u8],
    extras: &[Vec<u8>],
) -> BbcResult<(ImageFormat, bool)> {
    let name = String::from_utf8_lossy(name_spec).into_owned();
    let mut format = ImageFormat::from_name(&name);
    let mut all_sectors = false;
    for extra in extras {
        if extra.eq_ignore_ascii_case(b"ALL") {
            all_sectors = true;
        } else if let Some(f) = format_from_token(extra) {
            format = Some(f);
        } else {
            return Err(BbcError::empty_syntax());
        }
    }
    let format = format.ok_or_else(BbcError::empty_syntax)?;
    Ok((format, all_sectors))
}

/// *READ: create a flow that reads a physical disc into a new image file in
/// the current volume.
fn disk_image_read(session: &mut Session, args: &[Vec<u8>]) -> BbcResult<Response> {
    let spec = required(args, 0)?.to_vec();
    let drive_arg = required(args, 1)?.to_vec();
    let (format, all_sectors) = parse_image_args(&spec, args.get(2..).unwrap_or(&[]))?;
    let drive = parse_image_drive(&drive_arg, format)?;
    let (host_path, inf_name) = session.fs.resolve_target(&spec)?;
    let target = ImageTarget { host_path, inf_name };

    let flow = match format {
        ImageFormat::DfsSsd => {
            DiskImageFlow::DfsRead(dfs::ReadFlow::new(drive, false, all_sectors, target))
        }
        ImageFormat::DfsDsd => {
            DiskImageFlow::DfsRead(dfs::ReadFlow::new(drive, true, all_sectors, target))
        }
        _ => DiskImageFlow::AdfsRead(adfs::ReadFlow::new(drive, target)),
    };
    session.flow = Some(flow);
    Ok(special(special_sub::DISK_IMAGE_FLOW))
}

/// *WRITE: create a flow that writes an image file from the current volume
/// onto a physical disc.
async fn disk_image_write(session: &mut Session, args: &[Vec<u8>]) -> BbcResult<Response> {
    let spec = required(args, 0)?.to_vec();
    let drive_arg = required(args, 1)?.to_vec();
    let (format, _) = parse_image_args(&spec, args.get(2..).unwrap_or(&[]))?;
    let drive = parse_image_drive(&drive_arg, format)?;
    let (_, image) = session.fs.read_file(&spec).await?;

    let flow = match format {
        ImageFormat::DfsSsd => DiskImageFlow::DfsWrite(dfs::WriteFlow::new(drive, false, image)?),
        ImageFormat::DfsDsd => DiskImageFlow::DfsWrite(dfs::WriteFlow::new(drive, true, image)?),
        _ => DiskImageFlow::AdfsWrite(adfs::WriteFlow::new(drive, image)?),
    };
    session.flow = Some(flow);
    Ok(special(special_sub::DISK_IMAGE_FLOW))
}

/// *DUMP output: offset, eight hex bytes, ASCII. Narrow enough for a
/// 40-column mode.
fn dump_text(data: &[u8]) -> Vec<u8> {
    let mut text = Vec::new();
    for (row, chunk) in data.chunks(8).enumerate() {
        let mut line = format!("{:06X}:", row * 8);
        for i in 0..8 {
            match chunk.get(i) {
                Some(b) => line.push_str(&format!(" {b:02X}")),
                None => line.push_str("   "),
            }
        }
        line.push(' ');
        for &b in chunk {
            line.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        text.extend_from_slice(line.as_bytes());
        text.extend_from_slice(BNL);
    }
    text
}

/// *TYPE output: high bit stripped, CR becomes a BBC newline.
fn type_text(data: &[u8]) -> Vec<u8> {
    let mut text = Vec::new();
    for &byte in data {
        match byte & 0x7f {
            0x0d => text.extend_from_slice(BNL),
            b => text.push(b),
        }
    }
    text
}
