#![cfg(test)]

use crate::image::ImageTarget;

use super::*;

fn write_u24(dest: &mut [u8], value: u32) {
    dest[0] = value as u8;
    dest[1] = (value >> 8) as u8;
    dest[2] = (value >> 16) as u8;
}

/// Builds the two map sectors with valid checksums.
fn make_map(total: u32, free: &[(u32, u32)]) -> Vec<u8> {
    let mut cat = vec![0u8; CAT_SIZE];
    for (i, &(start, length)) in free.iter().enumerate() {
        write_u24(&mut cat[i * 3..], start);
        write_u24(&mut cat[SECTOR_SIZE + i * 3..], length);
    }
    write_u24(&mut cat[0xfc..], total);
    cat[0x1fe] = (free.len() * 3) as u8;
    cat[0xff] = checksum(&cat[..SECTOR_SIZE]);
    cat[0x1ff] = checksum(&cat[SECTOR_SIZE..]);
    cat
}

fn target(dir: &tempfile::TempDir, name: &str) -> ImageTarget {
    ImageTarget { host_path: dir.path().join(name), inf_name: name.to_string() }
}

#[test]
fn checksum_of_zeros() {
    assert_eq!(checksum(&[0u8; 256]), 255);
}

#[test]
fn checksum_carry_wraps() {
    let mut sector = [0u8; 256];
    sector[0] = 0x80;
    sector[1] = 0x90;
    // 255 + 0x90 = 0x18f -> carry to 0x90, + 0x80 = 0x110 -> 0x10
    assert_eq!(checksum(&sector), 0x10);
}

#[test]
fn map_round_trip() {
    let cat = make_map(640, &[(100, 50), (600, 40)]);
    let map = parse_map(&cat).unwrap();
    assert_eq!(map.total_sectors, 640);
    assert_eq!(map.free, vec![(100, 50), (600, 40)]);
    assert_eq!(used_ranges(&map), vec![(0, 100), (150, 450)]);
}

#[test]
fn any_corrupt_map_byte_fails_the_checksum() {
    for &index in &[0x05usize, 0x40, 0x130, 0x1f0] {
        let mut cat = make_map(640, &[(8, 632)]);
        cat[index] ^= 0x01;
        let err = parse_map(&cat).unwrap_err();
        assert_eq!(err.message, "Bad ADFS image (bad map)");
    }
}

#[test]
fn map_rejections() {
    assert!(parse_map(&[0u8; 100]).is_err());

    // free range running off the disc
    let cat = make_map(640, &[(639, 2)]);
    assert!(parse_map(&cat).is_err());

    // entry count not a multiple of three
    let mut cat = make_map(640, &[]);
    cat[0x1fe] = 4;
    cat[0x1ff] = checksum(&cat[SECTOR_SIZE..]);
    assert!(parse_map(&cat).is_err());
}

#[test]
fn logical_to_physical_mapping() {
    // single-sided formats are the identity
    assert_eq!(physical_offset(0, Geometry::S), 0);
    assert_eq!(physical_offset(100, Geometry::M), 100 * 256);

    // ADFS L interleaves 16-sector chunks of each side
    assert_eq!(physical_offset(0, Geometry::L), 0);
    assert_eq!(physical_offset(15, Geometry::L), 15 * 256);
    assert_eq!(physical_offset(16, Geometry::L), 32 * 256);
    // first sector of side 1 lands after track 0 side 0
    assert_eq!(physical_offset(80 * 16, Geometry::L), 16 * 256);
    assert_eq!(physical_offset(80 * 16 + 3, Geometry::L), 19 * 256);
}

#[test]
fn scatter_runs_split_at_track_chunks() {
    // 20 sectors from 8: 8..16 are contiguous, 16..28 land a chunk later
    let runs = scatter_runs(8, 20, Geometry::L);
    assert_eq!(runs, vec![(8 * 256, 8 * 256), (32 * 256, 12 * 256)]);

    let runs = scatter_runs(8, 20, Geometry::M);
    assert_eq!(runs, vec![(8 * 256, 20 * 256)]);
}

#[tokio::test]
async fn read_flow_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, target(&dir, "disc"));

    let start = flow.start(0x3000, 8192).unwrap();
    assert_eq!(start.fs, 8);
    assert_eq!(start.fs_command, "FADFS");
    assert_eq!(start.cat_oswords.len(), 1);
    assert_eq!(start.cat_oswords[0].transfer_size(), CAT_SIZE);

    flow.set_cat(&make_map(640, &[(8, 632)])).unwrap();
    assert!(flow.set_cat(&make_map(640, &[(8, 632)])).is_err());

    let part = flow.next_part().unwrap().expect("one part");
    assert_eq!(part.message, "Read sector 0 (100.0%)");
    assert_eq!(part.osword.transfer_size(), 8 * 256);

    let mut result = vec![0u8];
    result.extend_from_slice(&vec![0xaa; 8 * 256]);
    flow.set_last_osword_result(&result).unwrap();
    assert!(flow.next_part().unwrap().is_none());

    let finish = flow.finish().await.unwrap();
    assert_eq!(finish.fs, 0);

    let image = tokio::fs::read(dir.path().join("disc")).await.unwrap();
    assert_eq!(image.len(), 640 * 256);
    assert!(image[..8 * 256].iter().all(|&b| b == 0xaa));
    assert!(image[8 * 256..].iter().all(|&b| b == 0));
}

#[test]
fn parts_are_capped_by_buffer_and_limit() {
    let dir = tempfile::tempdir().unwrap();

    // 100 used sectors, 8 KiB buffer: 32+32+32+4
    let mut flow = ReadFlow::new(0, target(&dir, "disc"));
    flow.start(0x3000, 8192).unwrap();
    flow.set_cat(&make_map(640, &[(100, 540)])).unwrap();
    let mut sizes = Vec::new();
    while let Some(part) = flow.next_part().unwrap() {
        sizes.push(part.osword.transfer_size() / 256);
        let mut result = vec![0u8];
        result.extend_from_slice(&vec![0u8; part.osword.transfer_size()]);
        flow.set_last_osword_result(&result).unwrap();
    }
    assert_eq!(sizes, vec![32, 32, 32, 4]);

    // a 4 KiB buffer halves the cap
    let mut flow = ReadFlow::new(0, target(&dir, "disc2"));
    flow.start(0x3000, 4096).unwrap();
    flow.set_cat(&make_map(640, &[(40, 600)])).unwrap();
    let part = flow.next_part().unwrap().unwrap();
    assert_eq!(part.osword.transfer_size(), 16 * 256);
}

#[test]
fn unknown_disc_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, target(&dir, "disc"));
    flow.start(0x3000, 8192).unwrap();
    let err = flow.set_cat(&make_map(1000, &[])).unwrap_err();
    assert_eq!(err.message, "Unknown ADFS disc size");
}

#[test]
fn write_flow_round_trip() {
    let mut image = vec![0u8; 640 * 256];
    let map = make_map(640, &[(8, 632)]);
    image[..CAT_SIZE].copy_from_slice(&map);
    for (i, b) in image[CAT_SIZE..8 * 256].iter_mut().enumerate() {
        *b = i as u8;
    }

    let mut flow = WriteFlow::new(1, image.clone()).unwrap();
    flow.start(0x3000, 8192).unwrap();
    flow.set_cat(&make_map(640, &[(20, 620)])).unwrap();

    let part = flow.next_part().unwrap().expect("one part");
    assert_eq!(part.osword.block[5], 0x0a);
    assert_eq!(part.data, image[..8 * 256].to_vec());
    flow.set_last_osword_result(&[0]).unwrap();
    assert!(flow.next_part().unwrap().is_none());

    let finish = flow.finish().unwrap();
    assert_eq!(finish.fs, 8);
    assert_eq!(finish.fs_command, "FADFS");
}

#[test]
fn write_flow_rejects_mismatched_disc() {
    let mut image = vec![0u8; 640 * 256];
    image[..CAT_SIZE].copy_from_slice(&make_map(640, &[(8, 632)]));
    let mut flow = WriteFlow::new(0, image).unwrap();
    flow.start(0x3000, 8192).unwrap();
    assert!(flow.set_cat(&make_map(1280, &[(8, 1272)])).is_err());
}

#[test]
fn write_flow_rejects_bad_image() {
    // truncated
    assert!(WriteFlow::new(0, vec![0u8; 100]).is_err());

    // wrong length for the declared sector count
    let mut image = vec![0u8; 320 * 256];
    image[..CAT_SIZE].copy_from_slice(&make_map(640, &[(8, 632)]));
    assert!(WriteFlow::new(0, image).is_err());
}
