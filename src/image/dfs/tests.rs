#![cfg(test)]

use crate::image::ImageTarget;

use super::*;

/// Builds one side's catalogue: entry names are irrelevant here, only the
/// length/start-sector fields (with their high bits in the "busy" byte).
fn make_cat(sector_count: u32, files: &[(u32, u32)]) -> Vec<u8> {
    let mut cat = vec![0u8; CAT_SIZE];
    cat[0x105] = (files.len() * 8) as u8;
    cat[0x106] = ((sector_count >> 8) & 3) as u8;
    cat[0x107] = (sector_count & 0xff) as u8;
    for (i, &(start_sector, length)) in files.iter().enumerate() {
        let offset = 0x108 + i * 8;
        cat[offset + 4] = length as u8;
        cat[offset + 5] = (length >> 8) as u8;
        cat[offset + 6] = ((((length >> 16) & 3) << 4) | ((start_sector >> 8) & 3)) as u8;
        cat[offset + 7] = start_sector as u8;
    }
    cat
}

fn target(dir: &tempfile::TempDir, name: &str) -> ImageTarget {
    ImageTarget { host_path: dir.path().join(name), inf_name: name.to_string() }
}

#[test]
fn catalogue_basic_fields() {
    let cat = make_cat(400, &[(10, 0x100), (300, 0x900)]);
    let parsed = parse_catalogue(&cat).unwrap();
    assert_eq!(parsed.sector_count, 400);
    assert_eq!(parsed.file_count, 2);
    assert_eq!(parsed.total_tracks(), 40);
    // track 0 (the catalogue), the one-sector file, the nine-sector file
    assert_eq!(parsed.used_tracks, vec![0, 1, 30]);
}

#[test]
fn catalogue_keeps_the_historical_extra_track() {
    // sectors 10..=19 fit exactly in track 1, but the last-track sum lands
    // on track 2
    let cat = make_cat(400, &[(10, 0xa00)]);
    let parsed = parse_catalogue(&cat).unwrap();
    assert_eq!(parsed.used_tracks, vec![0, 1, 2]);
}

#[test]
fn catalogue_rejections() {
    assert!(parse_catalogue(&[0u8; 100]).is_err());

    let mut cat = make_cat(400, &[]);
    cat[0x105] = 9; // not a multiple of 8
    assert!(parse_catalogue(&cat).is_err());

    let cat = make_cat(1, &[]);
    assert!(parse_catalogue(&cat).is_err());
}

#[test]
fn track_ordering_partitions_by_side() {
    let mut addresses = vec![
        TrackAddress { side: 1, track: 0 },
        TrackAddress { side: 0, track: 7 },
        TrackAddress { side: 1, track: 3 },
        TrackAddress { side: 0, track: 2 },
    ];
    sort_track_addresses(&mut addresses);
    assert_eq!(addresses, vec![
        TrackAddress { side: 0, track: 2 },
        TrackAddress { side: 0, track: 7 },
        TrackAddress { side: 1, track: 0 },
        TrackAddress { side: 1, track: 3 },
    ]);

    // idempotent
    let again = addresses.clone();
    sort_track_addresses(&mut addresses);
    assert_eq!(addresses, again);
}

#[tokio::test]
async fn double_sided_read_flow() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, true, false, target(&dir, "disc"));

    let start = flow.start(0x3000, 4096).unwrap();
    assert_eq!(start.fs, 4);
    assert_eq!(start.fs_command, "DISC");
    assert_eq!(start.cat_oswords.len(), 2);
    assert_eq!(start.cat_oswords[0].block[0], 0);
    assert_eq!(start.cat_oswords[1].block[0], 2);
    assert_eq!(start.cat_oswords[0].transfer_size(), CAT_SIZE);

    // five used tracks per side: 0 plus a thirty-sector file over 1..=4
    let mut cats = make_cat(400, &[(10, 0x1e00)]);
    cats.extend_from_slice(&make_cat(400, &[(10, 0x1e00)]));
    flow.set_cat(&cats).unwrap();

    // a second setCat is invalid
    assert!(flow.set_cat(&cats).is_err());

    let mut sequence = Vec::new();
    let mut transferred = 0usize;
    for _ in 0..10 {
        let part = flow.next_part().unwrap().expect("part expected");
        assert!(part.data.is_empty());
        let drive = part.osword.block[0];
        let track = part.osword.block[7];
        sequence.push((drive / 2, track));

        let mut result = vec![0u8];
        result.extend(std::iter::repeat(track ^ (drive << 4)).take(TRACK_SIZE));
        transferred += part.osword.transfer_size();
        flow.set_last_osword_result(&result).unwrap();
    }
    assert!(flow.next_part().unwrap().is_none());

    // one side fully processed before the other, tracks ascending
    assert_eq!(sequence, vec![
        (0, 0), (0, 1), (0, 2), (0, 3), (0, 4),
        (1, 0), (1, 1), (1, 2), (1, 3), (1, 4),
    ]);
    assert_eq!(transferred, 10 * TRACK_SIZE);

    let finish = flow.finish().await.unwrap();
    assert_eq!(finish.fs, 0);

    let image = tokio::fs::read(dir.path().join("disc")).await.unwrap();
    assert_eq!(image.len(), 40 * 2 * TRACK_SIZE);
    // interleaved layout: offset (track*2 + side) * track size
    assert_eq!(image[(3 * 2) * TRACK_SIZE], 3);
    assert_eq!(image[(3 * 2 + 1) * TRACK_SIZE], 3 ^ (2 << 4));
    // untouched tracks stay zero
    assert_eq!(image[(7 * 2) * TRACK_SIZE], 0);

    assert!(tokio::fs::metadata(dir.path().join("disc.inf")).await.is_ok());
}

#[test]
fn read_flow_progress_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, false, false, target(&dir, "disc"));
    flow.start(0x3000, 2560).unwrap();
    flow.set_cat(&make_cat(400, &[])).unwrap();

    let part = flow.next_part().unwrap().unwrap();
    assert_eq!(part.message, "Read S0 T0 (100.0%)");
}

#[test]
fn read_flow_buffer_too_small() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, false, false, target(&dir, "disc"));
    assert!(flow.start(0x3000, 1024).is_err());
}

#[test]
fn read_flow_result_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, false, false, target(&dir, "disc"));
    flow.start(0x3000, 2560).unwrap();
    flow.set_cat(&make_cat(400, &[])).unwrap();
    flow.next_part().unwrap().unwrap();

    // data lost
    let mut result = vec![0x0au8];
    result.extend_from_slice(&[0u8; TRACK_SIZE]);
    let err = flow.set_last_osword_result(&result).unwrap_err();
    assert_eq!(err.code, crate::error::ErrorCode::DataLost);
}

#[test]
fn all_sectors_reads_every_track() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = ReadFlow::new(0, false, true, target(&dir, "disc"));
    flow.start(0x3000, 2560).unwrap();
    flow.set_cat(&make_cat(400, &[])).unwrap();

    let mut count = 0;
    while let Some(_part) = flow.next_part().unwrap() {
        let mut result = vec![0u8];
        result.extend_from_slice(&[0u8; TRACK_SIZE]);
        flow.set_last_osword_result(&result).unwrap();
        count += 1;
    }
    assert_eq!(count, 40);
}

#[tokio::test]
async fn write_flow_round_trip() {
    // single-sided image, five tracks, recognisable bytes per track
    let mut image = vec![0u8; 5 * TRACK_SIZE];
    let cat = make_cat(50, &[(10, 0x1e00)]);
    image[..CAT_SIZE].copy_from_slice(&cat);
    for track in 1..5 {
        for b in &mut image[track * TRACK_SIZE..(track + 1) * TRACK_SIZE] {
            *b = track as u8;
        }
    }

    let mut flow = WriteFlow::new(1, false, image.clone()).unwrap();
    let start = flow.start(0x3000, 2560).unwrap();
    assert_eq!(start.cat_oswords.len(), 1);
    assert_eq!(start.cat_oswords[0].block[0], 1);

    // the physical disc is bigger than the image: fine
    flow.set_cat(&make_cat(400, &[])).unwrap();

    let mut written = Vec::new();
    while let Some(part) = flow.next_part().unwrap() {
        assert_eq!(part.osword.block[6], 0x4b);
        assert_eq!(part.data.len(), TRACK_SIZE);
        written.push((part.osword.block[7], part.data[0]));
        flow.set_last_osword_result(&[0]).unwrap();
    }
    // tracks 0..=4 in order, carrying the right image slices
    assert_eq!(written, vec![(0, cat[0]), (1, 1), (2, 2), (3, 3), (4, 4)]);

    let finish = flow.finish().unwrap();
    assert_eq!(finish.fs, 4);
    assert_eq!(finish.fs_command, "DISC");
}

#[test]
fn write_flow_rejects_small_disc() {
    let mut image = vec![0u8; TRACK_SIZE];
    image[..CAT_SIZE].copy_from_slice(&make_cat(50, &[]));
    let mut flow = WriteFlow::new(0, false, image).unwrap();
    flow.start(0x3000, 2560).unwrap();
    assert!(flow.set_cat(&make_cat(40, &[])).is_err());
}
