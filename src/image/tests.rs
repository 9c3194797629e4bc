#![cfg(test)]

use crate::error::ErrorCode;

use super::*;

#[test]
fn dfs_osword_block_layout() {
    let mut osword = OsWord::dfs(2, 0x53, 7, 0, 10);
    osword.fill_address(0xffff1900);

    assert_eq!(osword.reason, OSWORD_DFS);
    assert_eq!(osword.block.len(), 11);
    assert_eq!(osword.block[0], 2);
    assert_eq!(&osword.block[1..5], &[0x00, 0x19, 0xff, 0xff]);
    assert_eq!(osword.block[5], 3);
    assert_eq!(osword.block[6], 0x53);
    assert_eq!(osword.block[7], 7);
    assert_eq!(osword.block[8], 0);
    assert_eq!(osword.block[9], 0x2a);
    assert_eq!(osword.block[10], 0);

    assert_eq!(osword.transfer_size(), 2560);
    assert_eq!(osword.result_offset(), 10);
}

#[test]
fn adfs_osword_block_layout() {
    let mut osword = OsWord::adfs(1, 0x08, 0x012345, 32);
    osword.fill_address(0x3000);

    assert_eq!(osword.reason, OSWORD_ADFS);
    assert_eq!(osword.block.len(), 11);
    assert_eq!(osword.block[0], 0);
    assert_eq!(&osword.block[1..5], &[0x00, 0x30, 0x00, 0x00]);
    assert_eq!(osword.block[5], 0x08);
    // drive in the top bits, then the 24-bit sector big-endian
    assert_eq!(osword.block[6], (1 << 5) | 0x01);
    assert_eq!(osword.block[7], 0x23);
    assert_eq!(osword.block[8], 0x45);
    assert_eq!(osword.block[9], 32);

    assert_eq!(osword.transfer_size(), 32 * 256);
    assert_eq!(osword.result_offset(), 0);
}

#[test]
fn osword_result_classification() {
    assert!(check_osword_result(0).is_ok());
    assert_eq!(check_osword_result(0x0a).unwrap_err().code, ErrorCode::DataLost);
    assert_eq!(check_osword_result(0x18).unwrap_err().code, ErrorCode::DataLost);
    assert_eq!(check_osword_result(0x10).unwrap_err().code, ErrorCode::DiscFault);
}

#[test]
fn image_format_from_name() {
    assert_eq!(ImageFormat::from_name("games.ssd"), Some(ImageFormat::DfsSsd));
    assert_eq!(ImageFormat::from_name("GAMES.DSD"), Some(ImageFormat::DfsDsd));
    assert_eq!(ImageFormat::from_name("a.ads"), Some(ImageFormat::AdfsS));
    assert_eq!(ImageFormat::from_name("a.adm"), Some(ImageFormat::AdfsM));
    assert_eq!(ImageFormat::from_name("a.adl"), Some(ImageFormat::AdfsL));
    assert_eq!(ImageFormat::from_name("plain"), None);
    assert_eq!(ImageFormat::from_name("a.txt"), None);
}

#[test]
fn part_queue_sequencing() {
    let part = |track: u8| Part {
        message: format!("T{track}"),
        osword: OsWord::dfs(0, 0x53, track, 0, 10),
        image_runs: vec![(track as usize * 2560, 2560)],
    };
    let mut queue = PartQueue::new(vec![part(0), part(1)]);

    let first = queue.next(0x3000).unwrap().unwrap();
    assert_eq!(first.message, "T0");
    assert_eq!(&first.osword.block[1..5], &[0x00, 0x30, 0x00, 0x00]);

    // a second next() before the result arrives is a state error
    assert!(queue.next(0x3000).is_err());
    assert!(!queue.exhausted());

    queue.advance();
    assert!(queue.next(0x3000).unwrap().is_some());
    queue.advance();
    assert!(queue.next(0x3000).unwrap().is_none());
    assert!(queue.exhausted());
}

#[test]
fn progress_is_a_percentage_of_parts_done() {
    assert_eq!(progress(0, 10), 10.0);
    assert_eq!(progress(9, 10), 100.0);
    assert_eq!(progress(0, 0), 100.0);
}
