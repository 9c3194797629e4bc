//! ADFS disc-image flows for the S, M and L formats.
//!
//! The free-space map in sectors 0 and 1 drives everything: it carries the
//! disc size, the free ranges (whose complement is what gets transferred)
//! and a checksum byte per sector. Transfers address logical sectors;
//! ADFS L images interleave the two sides per 16-sector track, so a logical
//! run scatters into the image file.

use tokio::fs;

use crate::error::{BbcError, BbcResult};
use crate::inf::{self, FileAttributes, InfData, DEFAULT_EXEC, DEFAULT_LOAD};

use super::{
    check_osword_result, invalid_state, progress, ImageTarget, OsWord, Part, PartOutput,
    PartQueue, StartOutput,
};

pub const SECTOR_SIZE: usize = 256;

/// Both map sectors.
pub const CAT_SIZE: usize = 2 * SECTOR_SIZE;

/// Largest transfer: 32 sectors, 8 KiB.
pub const MAX_PART_SECTORS: u32 = 32;

const CMD_READ: u8 = 0x08;
const CMD_WRITE: u8 = 0x0a;

/// The filing system the BBC selects for these transfers.
const FS_ADFS: u8 = 8;

const BAD_MAP: &str = "Bad ADFS image (bad map)";

/// Disc geometries, by total sector count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Geometry {
    S,
    M,
    L,
}

impl Geometry {
    pub fn from_total_sectors(total: u32) -> Option<Self> {
        match total {
            640 => Some(Geometry::S),
            1280 => Some(Geometry::M),
            2560 => Some(Geometry::L),
            _ => None,
        }
    }
}

/// The ADFS map sector checksum: a 255-byte running sum with end-around
/// carry, compared against byte 255.
pub fn checksum(sector: &[u8]) -> u8 {
    let mut sum: u32 = 255;
    for i in (0..255).rev() {
        if sum > 255 {
            sum = (sum + 1) & 0xff;
        }
        sum += sector[i] as u32;
    }
    (sum & 0xff) as u8
}

fn read_u24(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}

/// The parsed free-space map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceMap {
    pub total_sectors: u32,
    pub free: Vec<(u32, u32)>,
}

/// Parses and validates the two map sectors.
pub fn parse_map(cat: &[u8]) -> BbcResult<FreeSpaceMap> {
    if cat.len() != CAT_SIZE {
        return Err(BbcError::disc_fault(BAD_MAP));
    }
    let sector0 = &cat[..SECTOR_SIZE];
    let sector1 = &cat[SECTOR_SIZE..];
    if checksum(sector0) != sector0[255] || checksum(sector1) != sector1[255] {
        return Err(BbcError::disc_fault(BAD_MAP));
    }

    let end = sector1[0xfe];
    if end % 3 != 0 || end as usize > 0xf6 {
        return Err(BbcError::disc_fault(BAD_MAP));
    }
    let total_sectors = read_u24(&sector0[0xfc..0xff]);
    if total_sectors == 0 {
        return Err(BbcError::disc_fault(BAD_MAP));
    }

    let mut free = Vec::with_capacity(end as usize / 3);
    for i in (0..end as usize).step_by(3) {
        let start = read_u24(&sector0[i..i + 3]);
        let length = read_u24(&sector1[i..i + 3]);
        if start + length > total_sectors {
            return Err(BbcError::disc_fault(BAD_MAP));
        }
        free.push((start, length));
    }

    Ok(FreeSpaceMap { total_sectors, free })
}

/// The used sector ranges: the complement of the free list.
pub fn used_ranges(map: &FreeSpaceMap) -> Vec<(u32, u32)> {
    let mut free = map.free.clone();
    free.sort_unstable();

    let mut used = Vec::new();
    let mut next = 0u32;
    for &(start, length) in &free {
        if length == 0 {
            continue;
        }
        if start > next {
            used.push((next, start - next));
        }
        next = next.max(start + length);
    }
    if next < map.total_sectors {
        used.push((next, map.total_sectors - next));
    }
    used
}

/// Offset of a logical sector within the image file. ADFS L interleaves
/// 16-sector track chunks from alternating sides.
pub fn physical_offset(logical: u32, geometry: Geometry) -> usize {
    match geometry {
        Geometry::L => {
            let track = logical / 16;
            let side = track / 80;
            let track = track % 80;
            let sector = logical % 16;
            (((track * 2 + side) * 16 + sector) as usize) * SECTOR_SIZE
        }
        _ => logical as usize * SECTOR_SIZE,
    }
}

/// The scatter list for a run of logical sectors, with physically adjacent
/// sectors merged.
fn scatter_runs(start: u32, count: u32, geometry: Geometry) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for logical in start..start + count {
        let offset = physical_offset(logical, geometry);
        match runs.last_mut() {
            Some((last_offset, last_len)) if *last_offset + *last_len == offset => {
                *last_len += SECTOR_SIZE;
            }
            _ => runs.push((offset, SECTOR_SIZE)),
        }
    }
    runs
}

/// Splits used ranges into transfers of at most `cap` sectors.
fn build_parts(
    drive: u8,
    ranges: &[(u32, u32)],
    geometry: Geometry,
    cap: u32,
    command: u8,
    verb: &str,
) -> Vec<Part> {
    let mut pieces = Vec::new();
    for &(start, length) in ranges {
        let mut offset = 0;
        while offset < length {
            let count = cap.min(length - offset);
            pieces.push((start + offset, count));
            offset += count;
        }
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (start, count))| Part {
            message: format!("{verb} sector {start} ({:.1}%)", progress(i, total)),
            osword: OsWord::adfs(drive, command, start, count as u8),
            image_runs: scatter_runs(start, count, geometry),
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Stage {
    Created,
    Started,
    Transfer,
}

/// Reads a physical ADFS disc into a host image file.
#[derive(Debug)]
pub struct ReadFlow {
    drive: u8,
    target: ImageTarget,
    stage: Stage,
    buffer_address: u32,
    buffer_sectors: u32,
    image: Vec<u8>,
    queue: PartQueue,
}

impl ReadFlow {
    pub fn new(drive: u8, target: ImageTarget) -> Self {
        Self {
            drive,
            target,
            stage: Stage::Created,
            buffer_address: 0,
            buffer_sectors: 0,
            image: Vec::new(),
            queue: PartQueue::default(),
        }
    }

    pub fn start(&mut self, buffer_address: u32, buffer_size: u32) -> BbcResult<StartOutput> {
        if self.stage != Stage::Created {
            return Err(invalid_state());
        }
        if (buffer_size as usize) < CAT_SIZE {
            return Err(BbcError::disc_fault("OSWORD buffer too small"));
        }
        self.buffer_address = buffer_address;
        self.buffer_sectors = buffer_size / SECTOR_SIZE as u32;
        self.stage = Stage::Started;

        Ok(StartOutput {
            fs: FS_ADFS,
            fs_command: "FADFS".to_string(),
            init_command: String::new(),
            cat_oswords: vec![OsWord::adfs(self.drive, CMD_READ, 0, 2)],
        })
    }

    pub fn set_cat(&mut self, bytes: &[u8]) -> BbcResult<()> {
        if self.stage != Stage::Started {
            return Err(invalid_state());
        }
        let map = parse_map(bytes)?;
        let geometry = Geometry::from_total_sectors(map.total_sectors)
            .ok_or_else(|| BbcError::disc_fault("Unknown ADFS disc size"))?;

        let cap = MAX_PART_SECTORS.min(self.buffer_sectors);
        let ranges = used_ranges(&map);
        self.image = vec![0u8; map.total_sectors as usize * SECTOR_SIZE];
        self.queue =
            PartQueue::new(build_parts(self.drive, &ranges, geometry, cap, CMD_READ, "Read"));
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
            return Err(BbcError::disc_fault("Bad sector data size"));
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
        if self.stage != Stage::Transfer || !self.queue.exhausted() {
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

/// Writes a host ADFS image onto a physical disc.
#[derive(Debug)]
pub struct WriteFlow {
    drive: u8,
    stage: Stage,
    buffer_address: u32,
    geometry: Geometry,
    total_sectors: u32,
    ranges: Vec<(u32, u32)>,
    image: Vec<u8>,
    queue: PartQueue,
}

impl WriteFlow {
    /// Parses the image's own map to decide which sectors to write.
    pub fn new(drive: u8, image: Vec<u8>) -> BbcResult<Self> {
        if image.len() < CAT_SIZE {
            return Err(BbcError::disc_fault(BAD_MAP));
        }
        let map = parse_map(&image[..CAT_SIZE])?;
        let geometry = Geometry::from_total_sectors(map.total_sectors)
            .ok_or_else(|| BbcError::disc_fault("Unknown ADFS image size"))?;
        if image.len() != map.total_sectors as usize * SECTOR_SIZE {
            return Err(BbcError::disc_fault("Bad ADFS image"));
        }

        Ok(Self {
            drive,
            stage: Stage::Created,
            buffer_address: 0,
            geometry,
            total_sectors: map.total_sectors,
            ranges: used_ranges(&map),
            image,
            queue: PartQueue::default(),
        })
    }

    pub fn start(&mut self, buffer_address: u32, buffer_size: u32) -> BbcResult<StartOutput> {
        if self.stage != Stage::Created {
            return Err(invalid_state());
        }
        if (buffer_size as usize) < CAT_SIZE {
            return Err(BbcError::disc_fault("OSWORD buffer too small"));
        }
        self.buffer_address = buffer_address;
        let cap = MAX_PART_SECTORS.min(buffer_size / SECTOR_SIZE as u32);
        self.queue = PartQueue::new(build_parts(
            self.drive,
            &self.ranges,
            self.geometry,
            cap,
            CMD_WRITE,
            "Write",
        ));
        self.stage = Stage::Started;

        Ok(StartOutput {
            fs: FS_ADFS,
            fs_command: "FADFS".to_string(),
            init_command: String::new(),
            cat_oswords: vec![OsWord::adfs(self.drive, CMD_READ, 0, 2)],
        })
    }

    /// Verifies the physical disc matches the image's geometry.
    pub fn set_cat(&mut self, bytes: &[u8]) -> BbcResult<()> {
        if self.stage != Stage::Started {
            return Err(invalid_state());
        }
        let disc = parse_map(bytes)?;
        if disc.total_sectors != self.total_sectors {
            return Err(BbcError::disc_fault("Disc does not match image size"));
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

    /// Re-selects ADFS so the freshly written disc is usable immediately.
    pub fn finish(self) -> BbcResult<super::FinishOutput> {
        if self.stage != Stage::Transfer || !self.queue.exhausted() {
            return Err(invalid_state());
        }
        Ok(super::FinishOutput {
            fs: FS_ADFS,
            fs_command: "FADFS".to_string(),
            init_command: String::new(),
        })
    }
}

#[cfg(test)]
mod tests;
