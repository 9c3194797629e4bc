//! DFS disc-image flows: single-sided (.ssd) and double-sided (.dsd).
//!
//! Transfers move whole 10-sector tracks. A double-sided image interleaves
//! tracks from successive sides, and one side is fully processed before the
//! other so DFS 1.20 does not thrash the head-unload timer.

use tokio::fs;

use crate::error::{BbcError, BbcResult};
use crate::inf::{self, FileAttributes, InfData, DEFAULT_EXEC, DEFAULT_LOAD};

use super::{
    check_osword_result, invalid_state, progress, ImageTarget, OsWord, Part, PartOutput,
    PartQueue, StartOutput,
};

pub const SECTOR_SIZE: usize = 256;
pub const TRACK_SECTORS: usize = 10;
pub const TRACK_SIZE: usize = TRACK_SECTORS * SECTOR_SIZE;

/// Both catalogue sectors of one side.
pub const CAT_SIZE: usize = 2 * SECTOR_SIZE;

/// FDC commands used in OSWORD 0x7F blocks.
const CMD_READ: u8 = 0x53;
const CMD_WRITE: u8 = 0x4b;

/// The filing system the BBC selects for these transfers.
const FS_DFS: u8 = 4;

/// What the flow needs from one side's catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalogue {
    pub sector_count: u32,
    pub file_count: u8,
    pub used_tracks: Vec<u8>,
}

impl Catalogue {
    pub fn total_tracks(&self) -> u8 {
        (self.sector_count / TRACK_SECTORS as u32) as u8
    }
}

/// Parses one side's two catalogue sectors and derives the tracks holding
/// data. Track 0 always counts (it holds the catalogue itself). The
/// last-track computation keeps the historical off-by-one: a file's final
/// track index is `(start_sector + size_in_sectors) / 10`, not one less.
pub fn parse_catalogue(cat: &[u8]) -> BbcResult<Catalogue> {
    if cat.len() != CAT_SIZE {
        return Err(BbcError::disc_fault("Bad DFS catalogue"));
    }
    let entries_byte = cat[0x105];
    if entries_byte & 7 != 0 {
        return Err(BbcError::disc_fault("Bad DFS catalogue"));
    }
    let file_count = entries_byte >> 3;
    let sector_count = (((cat[0x106] & 3) as u32) << 8) | cat[0x107] as u32;
    if sector_count < 2 {
        return Err(BbcError::disc_fault("Bad DFS catalogue"));
    }

    let last_track = (sector_count as usize).div_ceil(TRACK_SECTORS).saturating_sub(1) as u8;
    let mut used = vec![false; last_track as usize + 1];
    used[0] = true;

    for i in 0..file_count as usize {
        let offset = 0x108 + i * 8;
        let busy = cat[offset + 6] as u32;
        let length = u16::from_le_bytes([cat[offset + 4], cat[offset + 5]]) as u32
            | ((busy << 12) & 0x30000);
        let start_sector = cat[offset + 7] as u32 | ((busy << 8) & 0x300);

        let sectors = length.div_ceil(SECTOR_SIZE as u32);
        let first = (start_sector / TRACK_SECTORS as u32).min(last_track as u32);
        let last = ((start_sector + sectors) / TRACK_SECTORS as u32).min(last_track as u32);
        for track in first..=last {
            used[track as usize] = true;
        }
    }

    let used_tracks =
        used.iter().enumerate().filter(|(_, &u)| u).map(|(t, _)| t as u8).collect();
    Ok(Catalogue { sector_count, file_count, used_tracks })
}

/// A (side, track) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackAddress {
    pub side: u8,
    pub track: u8,
}

/// Orders transfers so one side completes before the other begins, tracks
/// ascending within each side.
pub fn sort_track_addresses(addresses: &mut [TrackAddress]) {
    addresses.sort_unstable();
}

/// Offset of a track within the image file.
fn image_offset(track: u8, side: u8, double_sided: bool) -> usize {
    if double_sided {
        (track as usize * 2 + side as usize) * TRACK_SIZE
    } else {
        track as usize * TRACK_SIZE
    }
}

fn build_parts(
    drive: u8,
    double_sided: bool,
    addresses: &[TrackAddress],
    command: u8,
    verb: &str,
) -> Vec<Part> {
    let total = addresses.len();
    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| Part {
            message: format!(
                "{verb} S{} T{} ({:.1}%)",
                address.side,
                address.track,
                progress(i, total),
            ),
            osword: OsWord::dfs(
                drive + address.side * 2,
                command,
                address.track,
                0,
                TRACK_SECTORS as u8,
            ),
            image_runs: vec![(
                image_offset(address.track, address.side, double_sided),
                TRACK_SIZE,
            )],
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Stage {
    Created,
    Started,
    Transfer,
}

/// Reads a physical disc into a DFS image on the host.
#[derive(Debug)]
pub struct ReadFlow {
    drive: u8,
    double_sided: bool,
    all_sectors: bool,
    target: ImageTarget,
    stage: Stage,
    buffer_address: u32,
    image: Vec<u8>,
    queue: PartQueue,
}

impl ReadFlow {
    pub fn new(drive: u8, double_sided: bool, all_sectors: bool, target: ImageTarget) -> Self {
        Self {
            drive,
            double_sided,
            all_sectors,
            target,
            stage: Stage::Created,
            buffer_address: 0,
            image: Vec::new(),
            queue: PartQueue::default(),
        }
    }

    fn sides(&self) -> u8 {
        if self.double_sided {
            2
        } else {
            1
        }
    }

    pub fn start(&mut self, buffer_address: u32, buffer_size: u32) -> BbcResult<StartOutput> {
        if self.stage != Stage::Created {
            return Err(invalid_state());
        }
        if (buffer_size as usize) < TRACK_SIZE {
            return Err(BbcError::disc_fault("OSWORD buffer too small"));
        }
        self.buffer_address = buffer_address;
        self.stage = Stage::Started;

        let cat_oswords = (0..self.sides())
            .map(|side| OsWord::dfs(self.drive + side * 2, CMD_READ, 0, 0, 2))
            .collect();
        Ok(StartOutput {
            fs: FS_DFS,
            fs_command: "DISC".to_string(),
            init_command: String::new(),
            cat_oswords,
        })
    }

    pub fn set_cat(&mut self, bytes: &[u8]) -> BbcResult<()> {
        if self.stage != Stage::Started {
            return Err(invalid_state());
        }
        let sides = self.sides() as usize;
        if bytes.len() != CAT_SIZE * sides {
            return Err(BbcError::disc_fault("Bad DFS catalogue"));
        }

        let mut addresses = Vec::new();
        let mut track_count = 0u8;
        for side in 0..sides {
            let catalogue = parse_catalogue(&bytes[side * CAT_SIZE..(side + 1) * CAT_SIZE])?;
            track_count = track_count.max(catalogue.total_tracks());
            let tracks: Vec<u8> = if self.all_sectors {
                (0..catalogue.total_tracks()).collect()
            } else {
                catalogue.used_tracks.clone()
            };
            addresses
                .extend(tracks.into_iter().map(|track| TrackAddress { side: side as u8, track }));
        }
        sort_track_addresses(&mut addresses);

        self.image = vec![0u8; track_count as usize * sides * TRACK_SIZE];
        self.queue =
            PartQueue::new(build_parts(self.drive, self.double_sided, &addresses, CMD_READ, "Read"));
        self.stage = Stage::Transfer;
        Ok(())
    }

    pub fn next_part(&mut self) -> BbcResult<Option<PartOutput>> {
        if self.stage != Stage::Transfer {
            return Err(invalid_state());
        }
        self.queue.next(self.buffer_address)
    }

    pub fn set_last_osword_result(&mut self, bytes: &[u8]) -> BbcResult<()> {
        let part = self.queue.outstanding_part()?;
        let (&result, data) = bytes.split_first().ok_or_else(invalid_state)?;
        check_osword_result(result)?;
        if data.len() != part.transfer_size() {
            return Err(BbcError::disc_fault("Bad track data size"));
        }
        let mut taken = 0;
        for &(offset, len) in &part.image_runs {
            self.image[offset..offset + len].copy_from_slice(&data[taken..taken + len]);
            taken += len;
        }
        self.queue.advance();
        Ok(())
    }

    /// Persists the accumulated image. Leaves the BeebLink FS selected.
    pub async fn finish(self) -> BbcResult<super::FinishOutput> {
        if !self.queue.exhausted() || self.queue.len() == 0 {
            return Err(invalid_state());
        }
        if let Some(parent) = self.target.host_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.target.host_path, &self.image).await?;
        let data = InfData {
            name: self.target.inf_name.clone(),
            load: DEFAULT_LOAD,
            exec: DEFAULT_EXEC,
            attr: FileAttributes::default_set(),
            crc: None,
        };
        inf::write(&self.target.host_path, &data).await?;
        Ok(super::FinishOutput { fs: 0, fs_command: String::new(), init_command: String::new() })
    }
}

/// Writes a host DFS image onto a physical disc.
#[derive(Debug)]
pub struct WriteFlow {
    double_sided: bool,
    stage: Stage,
    buffer_address: u32,
    drive: u8,
    image: Vec<u8>,
    queue: PartQueue,
}

impl WriteFlow {
    /// Parses the image's own catalogue(s) to decide which tracks to write.
    pub fn new(drive: u8, double_sided: bool, image: Vec<u8>) -> BbcResult<Self> {
        let sides = if double_sided { 2 } else { 1 };
        let mut addresses = Vec::new();
        for side in 0..sides {
            let offset = image_offset(0, side, double_sided);
            if image.len() < offset + CAT_SIZE {
                return Err(BbcError::disc_fault("Bad DFS image"));
            }
            let catalogue = parse_catalogue(&image[offset..offset + CAT_SIZE])?;
            addresses.extend(
                catalogue.used_tracks.into_iter().map(|track| TrackAddress { side, track }),
            );
        }
        sort_track_addresses(&mut addresses);

        // every written track must be present in the image
        for address in &addresses {
            let offset = image_offset(address.track, address.side, double_sided);
            if image.len() < offset + TRACK_SIZE {
                return Err(BbcError::disc_fault("Bad DFS image"));
            }
        }

        let parts = build_parts(drive, double_sided, &addresses, CMD_WRITE, "Write");
        Ok(Self {
            double_sided,
            stage: Stage::Created,
            buffer_address: 0,
            drive,
            image,
            queue: PartQueue::new(parts),
        })
    }

    fn sides(&self) -> u8 {
        if self.double_sided {
            2
        } else {
            1
        }
    }

    pub fn start(&mut self, buffer_address: u32, buffer_size: u32) -> BbcResult<StartOutput> {
        if self.stage != Stage::Created {
            return Err(invalid_state());
        }
        if (buffer_size as usize) < TRACK_SIZE {
            return Err(BbcError::disc_fault("OSWORD buffer too small"));
        }
        self.buffer_address = buffer_address;
        self.stage = Stage::Started;

        let cat_oswords = (0..self.sides())
            .map(|side| OsWord::dfs(self.drive + side * 2, CMD_READ, 0, 0, 2))
            .collect();
        Ok(StartOutput {
            fs: FS_DFS,
            fs_command: "DISC".to_string(),
            init_command: String::new(),
            cat_oswords,
        })
    }

    /// Verifies the physical disc can hold the image.
    pub fn set_cat(&mut self, bytes: &[u8]) -> BbcResult<()> {
        if self.stage != Stage::Started {
            return Err(invalid_state());
        }
        let sides = self.sides() as usize;
        if bytes.len() != CAT_SIZE * sides {
            return Err(BbcError::disc_fault("Bad DFS catalogue"));
        }
        for side in 0..sides {
            let disc = parse_catalogue(&bytes[side * CAT_SIZE..(side + 1) * CAT_SIZE])?;
            let image_offset = image_offset(0, side as u8, self.double_sided);
            let image_cat = parse_catalogue(&self.image[image_offset..image_offset + CAT_SIZE])?;
            if disc.sector_count < image_cat.sector_count {
                return Err(BbcError::disc_fault("Disc too small for image"));
            }
        }
        self.stage = Stage::Transfer;
        Ok(())
    }

    pub fn next_part(&mut self) -> BbcResult<Option<PartOutput>> {
        if self.stage != Stage::Transfer {
            return Err(invalid_state());
        }
        let Some(mut output) = self.queue.next(self.buffer_address)? else {
            return Ok(None);
        };
        let part = self.queue.outstanding_part()?;
        for &(offset, len) in &part.image_runs {
            output.data.extend_from_slice(&self.image[offset..offset + len]);
        }
        Ok(Some(output))
    }

    pub fn set_last_osword_result(&mut self, bytes: &[u8]) -> BbcResult<()> {
        self.queue.outstanding_part()?;
        let &result = bytes.first().ok_or_else(invalid_state)?;
        check_osword_result(result)?;
        self.queue.advance();
        Ok(())
    }

    /// Re-selects DFS so the freshly written disc is usable immediately.
    pub fn finish(self) -> BbcResult<super::FinishOutput> {
        if !self.queue.exhausted() || self.queue.len() == 0 {
            return Err(invalid_state());
        }
        Ok(super::FinishOutput {
            fs: FS_DFS,
            fs_command: "DISC".to_string(),
            init_command: String::new(),
        })
    }
}

#[cfg(test)]
mod tests;
