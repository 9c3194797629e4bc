//! The BeebLink filing system.
//!
//! Volumes are host directories discovered by scanning configured search
//! roots. Each volume has one of two personalities: DFS-like (drives,
//! directory characters, 10-character names) or PC-like (flat, read-only).
//! A [`BeebFs`] owns one logical BBC session's filing state: the mounted
//! volume, the current drive/dir/library, and the open-file table.

pub mod afsp;
pub mod dfs;
pub mod pc;


use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tracing::warn;

use crate::changes::ChangeSender;
use crate::error::{BbcError, BbcResult, ErrorCode};
use crate::inf::{self, FileAttributes, InfData, DEFAULT_EXEC, DEFAULT_LOAD};
use crate::wire::primitive::write_pascal_string;
use crate::wire::BNL;

/// Marker file that declares a directory to be a volume root.
pub const VOLUME_MARKER: &str = ".beeblink-volume";

/// Largest file the server will store or serve.
pub const MAX_FILE_SIZE: u32 = 0x00ff_ffff;

/// Filing system identity byte returned by OSARGS A=0 Y=0.
pub const FS_NUMBER: u8 = 0x14;

/// Default handle range, until the ROM sets one.
pub const DEFAULT_FIRST_HANDLE: u8 = 0xa0;
pub const DEFAULT_LAST_HANDLE: u8 = 0xaf;

/// Volume personalities.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VolumeType {
    Dfs,
    Pc,
}

impl VolumeType {
    pub fn can_write(self) -> bool {
        match self {
            VolumeType::Dfs => true,
            VolumeType::Pc => false,
        }
    }
}

/// A discovered volume. Immutable once discovered; the read-only flag can
/// additionally be forced per-mount with `*VOL <name> R`.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub path: PathBuf,
    pub ty: VolumeType,
    pub read_only: bool,
}

/// Recursively scans the search roots for volume markers. Scanning stops
/// descending at each volume root. Duplicate names keep the first find.
pub async fn scan_volumes(roots: &[PathBuf]) -> io::Result<Vec<Arc<Volume>>> {
    let mut volumes: Vec<Arc<Volume>> = Vec::new();
    let mut stack: Vec<PathBuf> = roots.iter().rev().cloned().collect();

    while let Some(dir) = stack.pop() {
        match fs::read_to_string(dir.join(VOLUME_MARKER)).await {
            Ok(text) => {
                let Some(volume) = parse_marker(&dir, &text) else {
                    warn!(path = %dir.display(), "ignoring volume with unknown type");
                    continue;
                };
                if volumes.iter().any(|v| v.name.eq_ignore_ascii_case(&volume.name)) {
                    warn!(name = %volume.name, "ignoring duplicate volume name");
                    continue;
                }
                volumes.push(Arc::new(volume));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(path = %dir.display(), %err, "cannot scan folder");
                        continue;
                    }
                };
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        stack.push(entry.path());
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }

    volumes.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    Ok(volumes)
}

fn parse_marker(dir: &std::path::Path, text: &str) -> Option<Volume> {
    let mut tokens = text.lines().next().unwrap_or("").split_whitespace();
    let ty = match tokens.next() {
        None | Some("dfs") => VolumeType::Dfs,
        Some("pc") => VolumeType::Pc,
        Some(_) => return None,
    };
    let read_only = tokens.any(|t| t == "read-only");
    Some(Volume {
        name: dir.file_name()?.to_string_lossy().into_owned(),
        path: dir.to_path_buf(),
        ty,
        read_only,
    })
}

/// DFS session state: current drive and directory, and the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfsState {
    pub drive: char,
    pub dir: char,
    pub lib_drive: char,
    pub lib_dir: char,
}

impl Default for DfsState {
    fn default() -> Self {
        Self { drive: '0', dir: '$', lib_drive: '0', lib_dir: '$' }
    }
}

/// A fully-qualified name within the current volume. Each component records
/// whether the user typed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqn {
    pub drive: char,
    pub drive_explicit: bool,
    pub dir: char,
    pub dir_explicit: bool,
    pub name: String,
}

/// One stored BBC file, as found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeebFile {
    pub host_path: PathBuf,
    pub drive: char,
    pub dir: char,
    pub name: String,
    pub load: u32,
    pub exec: u32,
    pub attr: FileAttributes,
    pub size: u64,
}

/// The 16-byte OSFILE parameter block, minus the name pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OsfileBlock {
    pub load: u32,
    pub exec: u32,
    pub start: u32,
    pub end: u32,
}

impl OsfileBlock {
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let word = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Self { load: word(0), exec: word(4), start: word(8), end: word(12) }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.load.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.exec.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.start.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.end.to_le_bytes());
        bytes
    }
}

/// Result of an OSFILE operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsfileResult {
    pub file_type: u8,
    pub block: OsfileBlock,
    pub data: Option<Vec<u8>>,
}

/// Result of an OSGBPB operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsgbpbResult {
    pub carry: bool,
    pub residual: u32,
    pub ptr: u32,
    pub data: Vec<u8>,
}

/// One entry in the open-file table. Contents are buffered in memory and
/// flushed to the host on close or OSARGS flush.
#[derive(Debug)]
pub struct OpenFile {
    pub host_path: PathBuf,
    pub contents: Vec<u8>,
    pub ptr: usize,
    pub writable: bool,
    pub dirty: bool,
    eof_signalled: bool,
}

impl OpenFile {
    fn at_eof(&self) -> bool {
        self.ptr >= self.contents.len()
    }
}

/// The per-session open-file table. Handles form a contiguous range the ROM
/// sets at boot.
#[derive(Debug)]
pub struct OpenFileTable {
    first: u8,
    last: u8,
    slots: Vec<Option<OpenFile>>,
}

impl OpenFileTable {
    fn new() -> Self {
        Self::with_range(DEFAULT_FIRST_HANDLE, DEFAULT_LAST_HANDLE)
    }

    fn with_range(first: u8, last: u8) -> Self {
        let last = last.max(first);
        let count = usize::from(last - first) + 1;
        Self { first, last, slots: (0..count).map(|_| None).collect() }
    }

    fn allocate(&mut self) -> Option<u8> {
        let index = self.slots.iter().position(Option::is_none)?;
        Some(self.first + index as u8)
    }

    fn slot_mut(&mut self, handle: u8) -> Option<&mut Option<OpenFile>> {
        if handle < self.first || handle > self.last {
            return None;
        }
        self.slots.get_mut(usize::from(handle - self.first))
    }

    fn get_mut(&mut self, handle: u8) -> BbcResult<&mut OpenFile> {
        self.slot_mut(handle)
            .and_then(Option::as_mut)
            .ok_or_else(|| BbcError::stock(ErrorCode::Channel))
    }

    fn iter(&self) -> impl Iterator<Item = &OpenFile> {
        self.slots.iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut OpenFile> {
        self.slots.iter_mut().flatten()
    }

    fn drain(&mut self) -> Vec<OpenFile> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// The filing system instance owned by one session.
pub struct BeebFs {
    volumes: Arc<Vec<Arc<Volume>>>,
    volume: Arc<Volume>,
    forced_read_only: bool,
    state: DfsState,
    open_files: OpenFileTable,
    changes: Option<ChangeSender>,
}

impl BeebFs {
    pub fn new(
        volumes: Arc<Vec<Arc<Volume>>>,
        volume: Arc<Volume>,
        changes: Option<ChangeSender>,
    ) -> Self {
        Self {
            volumes,
            volume,
            forced_read_only: false,
            state: DfsState::default(),
            open_files: OpenFileTable::new(),
            changes,
        }
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    pub fn state(&self) -> DfsState {
        self.state
    }

    fn can_write(&self) -> bool {
        self.volume.ty.can_write() && !self.volume.read_only && !self.forced_read_only
    }

    fn ensure_writable(&self) -> BbcResult<()> {
        if self.can_write() {
            Ok(())
        } else {
            Err(BbcError::stock(ErrorCode::VolumeReadOnly))
        }
    }

    fn note_change(&self, path: &std::path::Path) {
        if let Some(changes) = &self.changes {
            changes.post(&self.volume.name, path);
        }
    }

    /// Mounts a volume, closing open files and resetting the DFS state.
    pub async fn mount(&mut self, volume: Arc<Volume>, forced_read_only: bool) -> BbcResult<()> {
        self.close_all().await?;
        self.volume = volume;
        self.forced_read_only = forced_read_only;
        self.state = DfsState::default();
        Ok(())
    }

    /// Finds a volume by (possibly ambiguous) name and mounts it.
    pub async fn mount_by_name(&mut self, spec: &str, forced_read_only: bool) -> BbcResult<()> {
        let re = afsp::to_regex(spec)?;
        let volume = self
            .volumes
            .iter()
            .find(|v| re.is_match(&v.name))
            .cloned()
            .ok_or_else(|| BbcError::new(ErrorCode::FileNotFound, "Volume not found"))?;
        self.mount(volume, forced_read_only).await
    }

    /// FS reset on REQUEST_RESET: closes all handles, restores defaults.
    pub async fn reset(&mut self) -> BbcResult<()> {
        self.close_all().await?;
        self.state = DfsState::default();
        Ok(())
    }

    /// Sets the handle range the ROM uses, closing anything open.
    pub async fn set_handle_range(&mut self, first: u8, last: u8) -> BbcResult<()> {
        self.close_all().await?;
        self.open_files = OpenFileTable::with_range(first, last);
        Ok(())
    }

    // ---- names ----

    /// Parses a file spec into an FQN for the current volume.
    pub fn parse_fqn(&self, raw: &[u8], wildcards_ok: bool, mid_line: bool) -> BbcResult<Fqn> {
        match self.volume.ty {
            VolumeType::Dfs => {
                let parsed = dfs::parse_file_spec(raw, &self.state, wildcards_ok)?;
                Ok(Fqn {
                    drive: parsed.drive,
                    drive_explicit: parsed.drive_explicit,
                    dir: parsed.dir,
                    dir_explicit: parsed.dir_explicit,
                    name: parsed.name,
                })
            }
            VolumeType::Pc => {
                let name = pc::parse_file_spec(raw, mid_line, wildcards_ok)?;
                Ok(Fqn {
                    drive: '0',
                    drive_explicit: false,
                    dir: '$',
                    dir_explicit: false,
                    name,
                })
            }
        }
    }

    /// The user-facing rendering of an FQN.
    pub fn display_fqn(&self, fqn: &Fqn) -> String {
        match self.volume.ty {
            VolumeType::Dfs => format!(":{}.{}.{}", fqn.drive, fqn.dir, fqn.name),
            VolumeType::Pc => fqn.name.clone(),
        }
    }

    fn reject_wildcards(&self, fqn: &Fqn) -> BbcResult<()> {
        if afsp::is_ambiguous(&fqn.name) || matches!(fqn.dir, '*' | '#') {
            Err(BbcError::stock(ErrorCode::BadName))
        } else {
            Ok(())
        }
    }

    // ---- lookup ----

    /// Finds the single file named by a non-wildcard FQN.
    pub async fn find_file(&self, fqn: &Fqn) -> BbcResult<Option<BeebFile>> {
        match self.volume.ty {
            VolumeType::Dfs => {
                Ok(dfs::find_file(&self.volume, fqn.drive, fqn.dir, &fqn.name).await?)
            }
            VolumeType::Pc => Ok(pc::find_file(&self.volume, &fqn.name).await?),
        }
    }

    /// Finds the files matching an FQN with wildcards, within its drive.
    pub async fn find_matching(&self, fqn: &Fqn) -> BbcResult<Vec<BeebFile>> {
        match self.volume.ty {
            VolumeType::Dfs => {
                dfs::find_matching(&self.volume, fqn.drive, fqn.dir, &fqn.name).await
            }
            VolumeType::Pc => pc::find_matching(&self.volume, &fqn.name).await,
        }
    }

    /// Finds files matching a name AFSP across every drive and directory of
    /// the volume.
    pub async fn locate(&self, name_afsp: &str) -> BbcResult<Vec<BeebFile>> {
        match self.volume.ty {
            VolumeType::Dfs => {
                let mut found = Vec::new();
                for drive in dfs::drives(&self.volume).await? {
                    found.extend(dfs::find_matching(&self.volume, drive, '*', name_afsp).await?);
                }
                Ok(found)
            }
            VolumeType::Pc => pc::find_matching(&self.volume, name_afsp).await,
        }
    }

    // ---- catalogues and info ----

    /// The *CAT text. The optional argument names a drive (DFS only).
    pub async fn cat(&self, arg: Option<&[u8]>) -> BbcResult<Vec<u8>> {
        match self.volume.ty {
            VolumeType::Dfs => {
                let drive = match arg {
                    None => self.state.drive,
                    Some(spec) => parse_drive_spec(spec)?,
                };
                dfs::cat_text(&self.volume, drive, &self.state).await
            }
            VolumeType::Pc => pc::cat_text(&self.volume).await,
        }
    }

    /// *INFO text: one line per file matching the AFSP.
    pub async fn info_text(&self, spec: &[u8]) -> BbcResult<Vec<u8>> {
        let fqn = self.parse_fqn(spec, true, true)?;
        let files = self.find_matching(&fqn).await?;
        if files.is_empty() {
            return Err(BbcError::stock(ErrorCode::FileNotFound));
        }
        Ok(self.info_lines(&files))
    }

    /// *EX text: one line per file in a directory.
    pub async fn ex_text(&self, spec: Option<&[u8]>) -> BbcResult<Vec<u8>> {
        let files = match self.volume.ty {
            VolumeType::Dfs => {
                let (drive, _, dir, _) = match spec {
                    Some(spec) => dfs::parse_dir_spec(spec, &self.state)?,
                    None => (self.state.drive, false, self.state.dir, false),
                };
                dfs::find_matching(&self.volume, drive, dir, "*").await?
            }
            VolumeType::Pc => pc::find_matching(&self.volume, "*").await?,
        };
        Ok(self.info_lines(&files))
    }

    fn info_lines(&self, files: &[BeebFile]) -> Vec<u8> {
        let mut text = Vec::new();
        for file in files {
            let line = match self.volume.ty {
                VolumeType::Dfs => dfs::info_line(file),
                VolumeType::Pc => pc::info_line(file),
            };
            text.extend_from_slice(line.as_bytes());
            text.extend_from_slice(BNL);
        }
        text
    }

    // ---- state commands ----

    pub fn set_drive(&mut self, spec: &[u8]) -> BbcResult<()> {
        self.require_dfs(ErrorCode::BadDrive)?;
        self.state.drive = parse_drive_spec(spec)?;
        Ok(())
    }

    pub fn set_dir(&mut self, spec: Option<&[u8]>) -> BbcResult<()> {
        self.require_dfs(ErrorCode::BadDir)?;
        match spec {
            None => self.state.dir = '$',
            Some(spec) => {
                let (drive, drive_explicit, dir, dir_explicit) =
                    dfs::parse_dir_spec(spec, &self.state)?;
                if drive_explicit {
                    self.state.drive = drive;
                }
                if dir_explicit {
                    self.state.dir = dir;
                }
            }
        }
        Ok(())
    }

    pub fn set_lib(&mut self, spec: Option<&[u8]>) -> BbcResult<()> {
        self.require_dfs(ErrorCode::BadDir)?;
        match spec {
            None => {
                self.state.lib_drive = '0';
                self.state.lib_dir = '$';
            }
            Some(spec) => {
                let (drive, drive_explicit, dir, dir_explicit) =
                    dfs::parse_dir_spec(spec, &self.state)?;
                if drive_explicit {
                    self.state.lib_drive = drive;
                }
                if dir_explicit {
                    self.state.lib_dir = dir;
                }
            }
        }
        Ok(())
    }

    fn require_dfs(&self, code: ErrorCode) -> BbcResult<()> {
        match self.volume.ty {
            VolumeType::Dfs => Ok(()),
            VolumeType::Pc => Err(BbcError::stock(code)),
        }
    }

    pub async fn set_title(&mut self, title: &str) -> BbcResult<()> {
        self.require_dfs(ErrorCode::VolumeReadOnly)?;
        self.ensure_writable()?;
        let mut title = title.to_string();
        title.truncate(dfs::MAX_TITLE_LEN);
        dfs::save_title(&self.volume, self.state.drive, &title).await?;
        self.note_change(&dfs::drive_path(&self.volume, self.state.drive).join(".title"));
        Ok(())
    }

    pub async fn boot_option(&self) -> BbcResult<u8> {
        match self.volume.ty {
            VolumeType::Dfs => Ok(dfs::load_boot_option(&self.volume, self.state.drive).await?),
            VolumeType::Pc => Ok(0),
        }
    }

    pub async fn set_boot_option(&mut self, option: u8) -> BbcResult<()> {
        self.require_dfs(ErrorCode::VolumeReadOnly)?;
        self.ensure_writable()?;
        dfs::save_boot_option(&self.volume, self.state.drive, option).await?;
        self.note_change(&dfs::drive_path(&self.volume, self.state.drive).join(".opt4"));
        Ok(())
    }

    /// *ACCESS: computes the new attributes for the personality and applies
    /// them to every matching file.
    pub async fn access(&mut self, spec: &[u8], attr_str: &str) -> BbcResult<()> {
        let attr = self
            .new_attributes(attr_str)
            .ok_or_else(|| BbcError::stock(ErrorCode::BadAttribute))?;
        self.ensure_writable()?;

        let fqn = self.parse_fqn(spec, true, true)?;
        let files = self.find_matching(&fqn).await?;
        if files.is_empty() {
            return Err(BbcError::stock(ErrorCode::FileNotFound));
        }
        for file in files {
            self.write_metadata(&file.host_path, &file, file.load, file.exec, attr).await?;
        }
        Ok(())
    }

    /// The personality's new-attribute rule: DFS accepts "" (defaults) and
    /// "L"/"l" (locked); PC rejects any change.
    fn new_attributes(&self, attr_str: &str) -> Option<FileAttributes> {
        match self.volume.ty {
            VolumeType::Dfs => match attr_str {
                "" => Some(FileAttributes::default_set()),
                "L" | "l" => Some(FileAttributes::locked_set()),
                _ => None,
            },
            VolumeType::Pc => None,
        }
    }

    /// Writes the INF sidecar for a stored file.
    async fn write_metadata(
        &self,
        host_path: &std::path::Path,
        file: &BeebFile,
        load: u32,
        exec: u32,
        attr: FileAttributes,
    ) -> BbcResult<()> {
        let name = match self.volume.ty {
            VolumeType::Dfs => dfs::host_file_name(file.dir, &file.name),
            VolumeType::Pc => file.name.clone(),
        };
        let data = InfData { name, load, exec, attr, crc: None };
        inf::write(host_path, &data).await?;
        self.note_change(&inf::inf_path(host_path));
        Ok(())
    }

    // ---- deletion and renaming ----

    pub async fn delete(&mut self, spec: &[u8]) -> BbcResult<()> {
        let fqn = self.parse_fqn(spec, false, true)?;
        self.reject_wildcards(&fqn)?;
        self.ensure_writable()?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        self.delete_file(&file).await
    }

    async fn delete_file(&self, file: &BeebFile) -> BbcResult<()> {
        if file.attr.is_locked() {
            return Err(BbcError::stock(ErrorCode::Locked));
        }
        fs::remove_file(&file.host_path).await?;
        inf::remove(&file.host_path).await?;
        self.note_change(&file.host_path);
        Ok(())
    }

    /// *RENAME within the volume. The destination must not exist, as data or
    /// as INF; metadata is rewritten and the source INF removed after the
    /// data rename.
    pub async fn rename(&mut self, old_spec: &[u8], new_spec: &[u8]) -> BbcResult<()> {
        self.require_dfs(ErrorCode::VolumeReadOnly)?;
        self.ensure_writable()?;

        let old_fqn = self.parse_fqn(old_spec, false, true)?;
        let new_fqn = self.parse_fqn(new_spec, false, true)?;
        self.reject_wildcards(&old_fqn)?;
        self.reject_wildcards(&new_fqn)?;

        let old = self
            .find_file(&old_fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        if old.attr.is_locked() {
            return Err(BbcError::stock(ErrorCode::Locked));
        }

        let new_path = dfs::host_path(&self.volume, new_fqn.drive, new_fqn.dir, &new_fqn.name);
        if self.find_file(&new_fqn).await?.is_some()
            || path_exists(&inf::inf_path(&new_path)).await
        {
            return Err(BbcError::stock(ErrorCode::Exists));
        }

        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let old_inf = inf::inf_path(&old.host_path);
        fs::rename(&old.host_path, &new_path).await?;

        let renamed = BeebFile { dir: new_fqn.dir, name: new_fqn.name.clone(), ..old.clone() };
        self.write_metadata(&new_path, &renamed, old.load, old.exec, old.attr).await?;
        match fs::remove_file(&old_inf).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        self.note_change(&old.host_path);
        self.note_change(&new_path);
        Ok(())
    }

    /// Resolves a spec to the host path a new file would occupy, plus its
    /// INF name. For flows that create files outside the OSFILE path.
    pub fn resolve_target(&self, spec: &[u8]) -> BbcResult<(PathBuf, String)> {
        let fqn = self.parse_fqn(spec, false, true)?;
        self.reject_wildcards(&fqn)?;
        self.ensure_writable()?;
        match self.volume.ty {
            VolumeType::Dfs => Ok((
                dfs::host_path(&self.volume, fqn.drive, fqn.dir, &fqn.name),
                dfs::host_file_name(fqn.dir, &fqn.name),
            )),
            VolumeType::Pc => Ok((pc::host_path(&self.volume, &fqn.name), fqn.name)),
        }
    }

    // ---- reading files whole ----

    /// Reads a single file and its contents; for *TYPE, *DUMP, *SRLOAD.
    pub async fn read_file(&self, spec: &[u8]) -> BbcResult<(BeebFile, Vec<u8>)> {
        let fqn = self.parse_fqn(spec, false, true)?;
        self.reject_wildcards(&fqn)?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        let data = fs::read(&file.host_path).await?;
        Ok((file, data))
    }

    /// Resolves a *RUN target: the named file, falling back to the library
    /// directory when the name has no explicit drive or dir. `None` means
    /// this personality cannot *RUN at all.
    pub async fn find_run_target(&self, spec: &[u8]) -> BbcResult<Option<(BeebFile, Vec<u8>)>> {
        if self.volume.ty == VolumeType::Pc {
            return Ok(None);
        }
        let fqn = self.parse_fqn(spec, false, true)?;
        self.reject_wildcards(&fqn)?;

        let mut found = self.find_file(&fqn).await?;
        if found.is_none() && !fqn.drive_explicit && !fqn.dir_explicit {
            found = dfs::find_file(
                &self.volume,
                self.state.lib_drive,
                self.state.lib_dir,
                &fqn.name,
            )
            .await?;
        }
        match found {
            Some(file) => {
                let data = fs::read(&file.host_path).await?;
                Ok(Some((file, data)))
            }
            None => Ok(None),
        }
    }

    // ---- OSFILE ----

    pub async fn osfile(
        &mut self,
        a: u8,
        block: OsfileBlock,
        name: &[u8],
        data: &[u8],
    ) -> BbcResult<OsfileResult> {
        match a {
            0 => self.osfile_save(block, name, data).await,
            1..=4 => self.osfile_write_info(a, block, name).await,
            5 => self.osfile_read_info(name).await,
            6 => self.osfile_delete(name).await,
            7 => self.osfile_create(block, name).await,
            0xff => self.osfile_load(block, name).await,
            _ => Ok(OsfileResult { file_type: 0, block, data: None }),
        }
    }

    async fn osfile_save(
        &mut self,
        block: OsfileBlock,
        name: &[u8],
        data: &[u8],
    ) -> BbcResult<OsfileResult> {
        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        self.ensure_writable()?;
        if data.len() > MAX_FILE_SIZE as usize {
            return Err(BbcError::stock(ErrorCode::TooBig));
        }
        if let Some(existing) = self.find_file(&fqn).await? {
            if existing.attr.is_locked() {
                return Err(BbcError::stock(ErrorCode::Locked));
            }
        }
        self.check_not_open_for_write(&fqn)?;

        let host_path = dfs::host_path(&self.volume, fqn.drive, fqn.dir, &fqn.name);
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&host_path, data).await?;

        let attr = FileAttributes::default_set();
        let file = BeebFile {
            host_path: host_path.clone(),
            drive: fqn.drive,
            dir: fqn.dir,
            name: fqn.name.clone(),
            load: block.load,
            exec: block.exec,
            attr,
            size: data.len() as u64,
        };
        self.write_metadata(&host_path, &file, block.load, block.exec, attr).await?;
        self.note_change(&host_path);

        Ok(OsfileResult {
            file_type: 1,
            block: OsfileBlock {
                load: block.load,
                exec: block.exec,
                start: data.len() as u32,
                end: attr.0 as u32,
            },
            data: None,
        })
    }

    async fn osfile_write_info(
        &mut self,
        a: u8,
        block: OsfileBlock,
        name: &[u8],
    ) -> BbcResult<OsfileResult> {
        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        self.ensure_writable()?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;

        let mut load = file.load;
        let mut exec = file.exec;
        let mut attr = file.attr;
        match a {
            1 => {
                load = block.load;
                exec = block.exec;
                attr = FileAttributes(block.end as u8);
            }
            2 => load = block.load,
            3 => exec = block.exec,
            4 => attr = FileAttributes(block.end as u8),
            _ => unreachable!(),
        }
        self.write_metadata(&file.host_path, &file, load, exec, attr).await?;

        Ok(OsfileResult {
            file_type: 1,
            block: OsfileBlock { load, exec, start: file.size as u32, end: attr.0 as u32 },
            data: None,
        })
    }

    async fn osfile_read_info(&mut self, name: &[u8]) -> BbcResult<OsfileResult> {
        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        Ok(OsfileResult {
            file_type: 1,
            block: OsfileBlock {
                load: file.load,
                exec: file.exec,
                start: file.size as u32,
                end: file.attr.0 as u32,
            },
            data: None,
        })
    }

    async fn osfile_delete(&mut self, name: &[u8]) -> BbcResult<OsfileResult> {
        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        self.ensure_writable()?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        self.delete_file(&file).await?;
        Ok(OsfileResult {
            file_type: 1,
            block: OsfileBlock {
                load: file.load,
                exec: file.exec,
                start: file.size as u32,
                end: file.attr.0 as u32,
            },
            data: None,
        })
    }

    async fn osfile_create(&mut self, block: OsfileBlock, name: &[u8]) -> BbcResult<OsfileResult> {
        let size = block.end.wrapping_sub(block.start);
        if size > MAX_FILE_SIZE {
            return Err(BbcError::stock(ErrorCode::TooBig));
        }
        let data = vec![0u8; size as usize];
        let mut result = self.osfile_save(block, name, &data).await?;
        result.block.start = size;
        Ok(result)
    }

    async fn osfile_load(&mut self, block: OsfileBlock, name: &[u8]) -> BbcResult<OsfileResult> {
        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        let file = self
            .find_file(&fqn)
            .await?
            .ok_or_else(|| BbcError::stock(ErrorCode::FileNotFound))?;
        let data = fs::read(&file.host_path).await?;

        // byte 6 of the block selects the address: zero means the file's own
        let effective_load = if block.to_bytes()[6] == 0 { file.load } else { block.load };

        Ok(OsfileResult {
            file_type: 1,
            block: OsfileBlock {
                load: effective_load,
                exec: file.exec,
                start: data.len() as u32,
                end: file.attr.0 as u32,
            },
            data: Some(data),
        })
    }

    // ---- OSFIND ----

    fn check_not_open_for_write(&self, fqn: &Fqn) -> BbcResult<()> {
        let host_path = match self.volume.ty {
            VolumeType::Dfs => dfs::host_path(&self.volume, fqn.drive, fqn.dir, &fqn.name),
            VolumeType::Pc => pc::host_path(&self.volume, &fqn.name),
        };
        if self.open_files.iter().any(|f| f.writable && f.host_path == host_path) {
            return Err(BbcError::stock(ErrorCode::Open));
        }
        Ok(())
    }

    /// OSFIND open. Returns the handle, or 0 when a read-open names a
    /// missing file.
    pub async fn osfind_open(&mut self, mode: u8, name: &[u8]) -> BbcResult<u8> {
        let for_write = match mode & 0xc0 {
            0x40 => false,
            0x80 | 0xc0 => true,
            _ => return Ok(0),
        };
        let create_empty = mode & 0xc0 == 0x80;

        let fqn = self.parse_fqn(name, false, false)?;
        self.reject_wildcards(&fqn)?;
        if for_write {
            self.ensure_writable()?;
        }

        let existing = self.find_file(&fqn).await?;
        if let Some(file) = &existing {
            if for_write && file.attr.is_locked() {
                return Err(BbcError::stock(ErrorCode::Locked));
            }
            // a file open for writing may not be opened again, and a file
            // open at all may not be opened for writing
            if self
                .open_files
                .iter()
                .any(|f| f.host_path == file.host_path && (f.writable || for_write))
            {
                return Err(BbcError::stock(ErrorCode::Open));
            }
        }

        let (host_path, contents) = match (&existing, for_write) {
            (None, false) => return Ok(0),
            (Some(file), _) => {
                let contents = if create_empty {
                    Vec::new()
                } else {
                    fs::read(&file.host_path).await?
                };
                (file.host_path.clone(), contents)
            }
            (None, true) => {
                // create the file now so it exists for the handle's lifetime
                let host_path = match self.volume.ty {
                    VolumeType::Dfs => {
                        dfs::host_path(&self.volume, fqn.drive, fqn.dir, &fqn.name)
                    }
                    VolumeType::Pc => pc::host_path(&self.volume, &fqn.name),
                };
                if let Some(parent) = host_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&host_path, b"").await?;
                let file = BeebFile {
                    host_path: host_path.clone(),
                    drive: fqn.drive,
                    dir: fqn.dir,
                    name: fqn.name.clone(),
                    load: DEFAULT_LOAD,
                    exec: DEFAULT_EXEC,
                    attr: FileAttributes::default_set(),
                    size: 0,
                };
                self.write_metadata(&host_path, &file, DEFAULT_LOAD, DEFAULT_EXEC, file.attr)
                    .await?;
                self.note_change(&host_path);
                (host_path, Vec::new())
            }
        };

        let Some(handle) = self.open_files.allocate() else {
            return Err(BbcError::stock(ErrorCode::TooManyOpen));
        };
        *self.open_files.slot_mut(handle).expect("allocated handle in range") = Some(OpenFile {
            host_path,
            contents,
            ptr: 0,
            writable: for_write,
            dirty: create_empty && existing.is_some(),
            eof_signalled: false,
        });
        Ok(handle)
    }

    /// OSFIND close; handle 0 closes everything.
    pub async fn osfind_close(&mut self, handle: u8) -> BbcResult<()> {
        if handle == 0 {
            return self.close_all().await;
        }
        let file = self
            .open_files
            .slot_mut(handle)
            .and_then(Option::take)
            .ok_or_else(|| BbcError::stock(ErrorCode::Channel))?;
        self.flush_file(file).await
    }

    async fn close_all(&mut self) -> BbcResult<()> {
        for file in self.open_files.drain() {
            self.flush_file(file).await?;
        }
        Ok(())
    }

    async fn flush_file(&self, file: OpenFile) -> BbcResult<()> {
        if file.dirty {
            fs::write(&file.host_path, &file.contents).await?;
            self.note_change(&file.host_path);
        }
        Ok(())
    }

    // ---- sequential access ----

    /// OSBGET. `None` is the first EOF indication; a second read at EOF is
    /// the hard error.
    pub fn osbget(&mut self, handle: u8) -> BbcResult<Option<u8>> {
        let file = self.open_files.get_mut(handle)?;
        if file.at_eof() {
            if file.eof_signalled {
                return Err(BbcError::stock(ErrorCode::Eof));
            }
            file.eof_signalled = true;
            return Ok(None);
        }
        let byte = file.contents[file.ptr];
        file.ptr += 1;
        file.eof_signalled = false;
        Ok(Some(byte))
    }

    /// OSBPUT: writes one byte at the sequential pointer, extending at EOF.
    pub fn osbput(&mut self, handle: u8, byte: u8) -> BbcResult<()> {
        let file = self.open_files.get_mut(handle)?;
        if !file.writable {
            return Err(BbcError::stock(ErrorCode::ReadOnly));
        }
        if file.ptr >= file.contents.len() {
            if file.contents.len() >= MAX_FILE_SIZE as usize {
                return Err(BbcError::stock(ErrorCode::TooBig));
            }
            file.contents.resize(file.ptr + 1, 0);
        }
        file.contents[file.ptr] = byte;
        file.ptr += 1;
        file.dirty = true;
        file.eof_signalled = false;
        Ok(())
    }

    /// EOF#: true when the pointer is at or past the length.
    pub fn eof(&mut self, handle: u8) -> BbcResult<bool> {
        Ok(self.open_files.get_mut(handle)?.at_eof())
    }

    // ---- OSARGS ----

    pub async fn osargs(&mut self, a: u8, handle: u8, value: u32) -> BbcResult<u32> {
        if handle == 0 {
            return match a {
                0 => Ok(FS_NUMBER as u32),
                0xff => {
                    self.flush_all_dirty().await?;
                    Ok(value)
                }
                _ => Ok(0),
            };
        }

        match a {
            0 => Ok(self.open_files.get_mut(handle)?.ptr as u32),
            1 => {
                let file = self.open_files.get_mut(handle)?;
                let new_ptr = value as usize;
                if new_ptr > file.contents.len() && file.writable {
                    if new_ptr > MAX_FILE_SIZE as usize {
                        return Err(BbcError::stock(ErrorCode::TooBig));
                    }
                    file.contents.resize(new_ptr, 0);
                    file.dirty = true;
                }
                file.ptr = new_ptr;
                file.eof_signalled = false;
                Ok(value)
            }
            2 => Ok(self.open_files.get_mut(handle)?.contents.len() as u32),
            3 => {
                let file = self.open_files.get_mut(handle)?;
                if !file.writable {
                    return Err(BbcError::stock(ErrorCode::ReadOnly));
                }
                if value > MAX_FILE_SIZE {
                    return Err(BbcError::stock(ErrorCode::TooBig));
                }
                file.contents.resize(value as usize, 0);
                file.ptr = file.ptr.min(file.contents.len());
                file.dirty = true;
                Ok(value)
            }
            0xff => {
                let file = self.open_files.get_mut(handle)?;
                if file.dirty {
                    let (path, contents) = (file.host_path.clone(), file.contents.clone());
                    file.dirty = false;
                    fs::write(&path, &contents).await?;
                    self.note_change(&path);
                }
                Ok(value)
            }
            _ => Ok(value),
        }
    }

    async fn flush_all_dirty(&mut self) -> BbcResult<()> {
        let mut pending = Vec::new();
        for file in self.open_files.iter_mut() {
            if file.dirty {
                file.dirty = false;
                pending.push((file.host_path.clone(), file.contents.clone()));
            }
        }
        for (path, contents) in pending {
            fs::write(&path, &contents).await?;
            self.note_change(&path);
        }
        Ok(())
    }

    // ---- OSGBPB ----

    pub async fn osgbpb(
        &mut self,
        a: u8,
        handle: u8,
        size: u32,
        ptr: u32,
        data: &[u8],
    ) -> BbcResult<OsgbpbResult> {
        match a {
            1 | 2 => {
                let file = self.open_files.get_mut(handle)?;
                if !file.writable {
                    return Err(BbcError::stock(ErrorCode::ReadOnly));
                }
                if a == 1 {
                    file.ptr = ptr as usize;
                }
                let end = file.ptr + data.len();
                if end > MAX_FILE_SIZE as usize {
                    return Err(BbcError::stock(ErrorCode::TooBig));
                }
                if end > file.contents.len() {
                    file.contents.resize(end, 0);
                }
                file.contents[file.ptr..end].copy_from_slice(data);
                file.ptr = end;
                file.dirty = true;
                file.eof_signalled = false;
                Ok(OsgbpbResult {
                    carry: false,
                    residual: 0,
                    ptr: file.ptr as u32,
                    data: Vec::new(),
                })
            }
            3 | 4 => {
                let file = self.open_files.get_mut(handle)?;
                if a == 3 {
                    file.ptr = ptr as usize;
                }
                let start = file.ptr.min(file.contents.len());
                let n = (size as usize).min(file.contents.len() - start);
                let out = file.contents[start..start + n].to_vec();
                file.ptr = start + n;
                Ok(OsgbpbResult {
                    carry: n < size as usize,
                    residual: size - n as u32,
                    ptr: file.ptr as u32,
                    data: out,
                })
            }
            5 => {
                let (title, option, drive) = match self.volume.ty {
                    VolumeType::Dfs => (
                        dfs::load_title(&self.volume, self.state.drive).await?,
                        dfs::load_boot_option(&self.volume, self.state.drive).await?,
                        self.state.drive,
                    ),
                    VolumeType::Pc => (self.volume.name.clone(), 0, '0'),
                };
                let mut out = Vec::new();
                write_pascal_string(&mut out, title.as_bytes())?;
                out.push(option);
                out.push(drive as u8);
                Ok(OsgbpbResult { carry: false, residual: 0, ptr, data: out })
            }
            6 => Ok(OsgbpbResult {
                carry: false,
                residual: 0,
                ptr,
                data: vec![1, self.state.drive as u8, 1, self.state.dir as u8],
            }),
            7 => Ok(OsgbpbResult {
                carry: false,
                residual: 0,
                ptr,
                data: vec![1, self.state.lib_drive as u8, 1, self.state.lib_dir as u8],
            }),
            8 => {
                let names: Vec<String> = match self.volume.ty {
                    VolumeType::Dfs => dfs::find_matching(
                        &self.volume,
                        self.state.drive,
                        self.state.dir,
                        "*",
                    )
                    .await?
                    .into_iter()
                    .map(|f| f.name)
                    .collect(),
                    VolumeType::Pc => pc::find_matching(&self.volume, "*")
                        .await?
                        .into_iter()
                        .map(|f| f.name)
                        .collect(),
                };
                let start = (ptr as usize).min(names.len());
                let n = (size as usize).min(names.len() - start);
                let mut out = Vec::new();
                for name in &names[start..start + n] {
                    write_pascal_string(&mut out, name.as_bytes())?;
                }
                Ok(OsgbpbResult {
                    carry: n < size as usize,
                    residual: size - n as u32,
                    ptr: (start + n) as u32,
                    data: out,
                })
            }
            _ => Err(BbcError::disc_fault("Bad OSGBPB operation")),
        }
    }
}

/// Parses a `*DRIVE`-style drive spec: a single drive character, with or
/// without a leading colon.
fn parse_drive_spec(spec: &[u8]) -> BbcResult<char> {
    let spec = match spec {
        [b':', rest @ ..] => rest,
        spec => spec,
    };
    match spec {
        [d] if dfs::is_valid_drive_char(*d) => Ok(*d as char),
        _ => Err(BbcError::stock(ErrorCode::BadDrive)),
    }
}

async fn path_exists(path: &std::path::Path) -> bool {
    fs::metadata(path).await.is_ok()
}
