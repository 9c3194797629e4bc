#![cfg(test)]

use std::sync::Arc;

use crate::fs::{DfsState, Volume, VolumeType};
use crate::inf::{FileAttributes, InfData};

use super::*;

fn state() -> DfsState {
    DfsState::default()
}

#[test]
fn plain_name_uses_current_drive_and_dir() {
    let parsed = parse_file_spec(b"FOO", &state(), false).unwrap();
    assert_eq!(parsed.drive, '0');
    assert!(!parsed.drive_explicit);
    assert_eq!(parsed.dir, '$');
    assert!(!parsed.dir_explicit);
    assert_eq!(parsed.name, "FOO");
}

#[test]
fn explicit_drive_and_dir() {
    let parsed = parse_file_spec(b":2.B.DATA", &state(), false).unwrap();
    assert_eq!(parsed.drive, '2');
    assert!(parsed.drive_explicit);
    assert_eq!(parsed.dir, 'B');
    assert!(parsed.dir_explicit);
    assert_eq!(parsed.name, "DATA");

    // the dot after the drive is optional
    let parsed = parse_file_spec(b":2B.DATA", &state(), false).unwrap();
    assert_eq!(parsed.drive, '2');
    assert_eq!(parsed.dir, 'B');

    let parsed = parse_file_spec(b"W.PROG", &state(), false).unwrap();
    assert_eq!(parsed.dir, 'W');
    assert!(parsed.dir_explicit);
    assert!(!parsed.drive_explicit);
}

#[test]
fn name_rejections() {
    use crate::error::ErrorCode;

    let err = |raw: &[u8]| parse_file_spec(raw, &state(), false).unwrap_err().code;
    assert_eq!(err(b""), ErrorCode::BadName);
    assert_eq!(err(b"TOOLONGNAME"), ErrorCode::BadName);
    assert_eq!(err(b"A.B.C"), ErrorCode::BadName);
    assert_eq!(err(b"SP CE"), ErrorCode::BadName);
    assert_eq!(err(b":$.FOO"), ErrorCode::BadDrive);
    assert_eq!(err(b":"), ErrorCode::BadDrive);
    assert_eq!(err(b"\x01.FOO"), ErrorCode::BadDir);
    // wildcards are only names when asked for
    assert_eq!(err(b"FO*"), ErrorCode::BadName);
    assert!(parse_file_spec(b"FO*", &state(), true).is_ok());
    assert!(parse_file_spec(b"#.FO#", &state(), true).is_ok());
}

#[test]
fn dir_spec_parsing() {
    let (drive, drive_explicit, dir, dir_explicit) = parse_dir_spec(b"B", &state()).unwrap();
    assert_eq!((drive, dir), ('0', 'B'));
    assert!(!drive_explicit);
    assert!(dir_explicit);

    let (drive, drive_explicit, dir, dir_explicit) = parse_dir_spec(b":3.W", &state()).unwrap();
    assert_eq!((drive, dir), ('3', 'W'));
    assert!(drive_explicit && dir_explicit);

    let (drive, drive_explicit, dir, dir_explicit) = parse_dir_spec(b":1", &state()).unwrap();
    assert_eq!((drive, dir), ('1', '$'));
    assert!(drive_explicit);
    assert!(!dir_explicit);

    assert!(parse_dir_spec(b"AB", &state()).is_err());
}

#[test]
fn host_names() {
    assert_eq!(host_file_name('$', "FOO"), "$.FOO");
    assert_eq!(split_host_name("$.FOO"), Some(('$', "FOO".to_string())));
    assert_eq!(split_host_name("W.Game10"), Some(('W', "Game10".to_string())));
    assert_eq!(split_host_name(".title"), None);
    assert_eq!(split_host_name("noprefix"), None);
    assert_eq!(split_host_name("$.WAYTOOLONGNAME"), None);
}

fn test_volume(path: &std::path::Path) -> Volume {
    Volume {
        name: "Test".to_string(),
        path: path.to_path_buf(),
        ty: VolumeType::Dfs,
        read_only: false,
    }
}

async fn put_file(volume: &Volume, drive: char, host_name: &str, data: &InfData, len: usize) {
    let dir = drive_path(volume, drive);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join(host_name);
    tokio::fs::write(&path, vec![0u8; len]).await.unwrap();
    crate::inf::write(&path, data).await.unwrap();
}

#[tokio::test]
async fn drive_scan_and_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let volume = test_volume(dir.path());

    let meta = |name: &str, locked: bool| InfData {
        name: name.to_string(),
        load: 0x1900,
        exec: 0x8023,
        attr: if locked { FileAttributes::locked_set() } else { FileAttributes::default_set() },
        crc: None,
    };
    put_file(&volume, '0', "$.ALPHA", &meta("$.ALPHA", false), 10).await;
    put_file(&volume, '0', "B.BETA", &meta("B.BETA", true), 300).await;
    put_file(&volume, '2', "$.OTHER", &meta("$.OTHER", false), 5).await;

    let files = scan_drive(&volume, '0').await.unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "ALPHA");
    assert_eq!(files[0].dir, '$');
    assert_eq!(files[0].size, 10);
    assert!(!files[0].attr.is_locked());
    assert!(files[1].attr.is_locked());

    let found = find_file(&volume, '0', 'b', "beta").await.unwrap().unwrap();
    assert_eq!(found.name, "BETA");
    assert!(find_file(&volume, '0', '$', "BETA").await.unwrap().is_none());

    let matched = find_matching(&volume, '0', '*', "*A").await.unwrap();
    assert_eq!(matched.len(), 2);

    assert_eq!(drives(&volume).await.unwrap(), vec!['0', '2']);
    assert!(scan_drive(&volume, '3').await.unwrap().is_empty());
}

#[tokio::test]
async fn drive_metadata_defaults_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let volume = test_volume(dir.path());

    assert_eq!(load_boot_option(&volume, '0').await.unwrap(), 0);
    assert_eq!(load_title(&volume, '0').await.unwrap(), "");

    save_boot_option(&volume, '0', 3).await.unwrap();
    save_title(&volume, '0', "My Discs").await.unwrap();
    assert_eq!(load_boot_option(&volume, '0').await.unwrap(), 3);
    assert_eq!(load_title(&volume, '0').await.unwrap(), "My Discs");
}

#[tokio::test]
async fn catalogue_layout() {
    let dir = tempfile::tempdir().unwrap();
    let volume = test_volume(dir.path());

    let meta = |name: &str, locked: bool| InfData {
        name: name.to_string(),
        load: 0,
        exec: 0,
        attr: if locked { FileAttributes::locked_set() } else { FileAttributes::default_set() },
        crc: None,
    };
    put_file(&volume, '0', "B.ZULU", &meta("B.ZULU", false), 1).await;
    put_file(&volume, '0', "$.MIKE", &meta("$.MIKE", true), 1).await;
    put_file(&volume, '0', "$.ECHO", &meta("$.ECHO", false), 1).await;
    save_title(&volume, '0', "TESTDISC").await.unwrap();
    save_boot_option(&volume, '0', 3).await.unwrap();

    let text = cat_text(&volume, '0', &DfsState::default()).await.unwrap();
    let text = String::from_utf8(text).unwrap();
    let lines: Vec<&str> = text.split("\r\n").collect();

    assert_eq!(lines[0], "TESTDISC");
    assert_eq!(lines[1], "Volume: Test");
    assert_eq!(lines[2], format!("{:<20}Dir :0.$", "Drive 0 (3 - EXEC)"));
    assert_eq!(lines[3], format!("{:<20}Lib :0.$", ""));
    assert_eq!(lines[4], "");
    // current dir first, then by dir and name; locked flag shown; two
    // 20-column cells per line
    assert_eq!(lines[5], format!("{:<20}{:<20}", "  $.ECHO", "  $.MIKE L"));
    assert_eq!(lines[6], format!("{:<20}", "  B.ZULU"));
}

#[test]
fn info_line_layout() {
    let file = BeebFile {
        host_path: "/x/0/$.FOO".into(),
        drive: '0',
        dir: '$',
        name: "FOO".to_string(),
        load: 0xffff1900,
        exec: 0xffff8023,
        attr: FileAttributes::locked_set(),
        size: 0x123,
    };
    assert_eq!(info_line(&file), "$.FOO        L FFFF1900 FFFF8023 000123");
}
