//! Per-link sessions and request dispatch.
//!
//! A [`Session`] owns everything one logical BBC connection can see: the
//! filing system instance, the string output buffer, the active disk-image
//! flow, the volume browser, the speed test and the link subtype. The
//! dispatcher decodes each request's payload, invokes the right subsystem
//! and encodes the response; errors carrying a BBC code become ERROR
//! responses here.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use moka::sync::Cache;
use num_traits::FromPrimitive;
use tracing::{debug, info};

use crate::browser::{BrowserAction, VolumeBrowser};
use crate::changes::ChangeSender;
use crate::commands;
use crate::config::Config;
use crate::error::{BbcError, BbcResult, ErrorCode};
use crate::fs::{BeebFs, OsfileBlock, Volume};
use crate::gsread::CommandLine;
use crate::image::DiskImageFlow;
use crate::inf::{SHOULDNT_EXEC, SHOULDNT_LOAD};
use crate::speedtest::SpeedTest;
use crate::wire::primitive::{self, cr_string, cr_string_or_rest, hex_dump, rest, u32 as read_u32, u8 as read_u8};
use crate::wire::{
    browser_sub, is_fire_and_forget, request_name, response_name, Request, RequestCode, Response,
    ResponseCode,
};

/// Cached ROM images, shared by every session.
#[derive(Clone)]
pub struct RomStore {
    config: Arc<Config>,
    cache: Cache<PathBuf, Arc<Vec<u8>>>,
}

impl RomStore {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, cache: Cache::new(16) }
    }

    pub fn get(&self, subtype: u8) -> BbcResult<Arc<Vec<u8>>> {
        let path = self
            .config
            .rom_path(subtype)
            .ok_or_else(|| BbcError::disc_fault("No ROM configured"))?;
        let path = path.clone();
        self.cache
            .try_get_with(path.clone(), || std::fs::read(&path).map(Arc::new))
            .map_err(|err| BbcError::disc_fault(format!("Cannot read ROM: {err}")))
    }
}

/// State shared by every session of one server.
pub struct ServerContext {
    pub volumes: Arc<Vec<Arc<Volume>>>,
    pub config: Arc<Config>,
    pub roms: RomStore,
    pub changes: Option<ChangeSender>,
}

impl ServerContext {
    pub fn new(
        volumes: Arc<Vec<Arc<Volume>>>,
        config: Arc<Config>,
        changes: Option<ChangeSender>,
    ) -> Self {
        let roms = RomStore::new(config.clone());
        Self { volumes, config, roms, changes }
    }
}

/// The paginated string output buffer READ_STRING drains.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    pos: usize,
}

impl OutputBuffer {
    pub fn set(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.pos = 0;
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.remaining());
        let chunk = self.bytes[self.pos..self.pos + n].to_vec();
        self.pos += n;
        chunk
    }
}

/// One logical BBC connection's state.
pub struct Session {
    pub(crate) fs: BeebFs,
    pub(crate) text: OutputBuffer,
    pub(crate) flow: Option<DiskImageFlow>,
    pub(crate) browser: Option<VolumeBrowser>,
    pub(crate) speed: Option<SpeedTest>,
    pub(crate) link_subtype: u8,
    pub(crate) roms: RomStore,
    dump_packets: bool,
}

impl Session {
    /// Creates a session mounting the configured default volume, or the
    /// first discovered one. `None` when no volumes were found.
    pub fn new(ctx: &ServerContext) -> Option<Self> {
        let volume = match &ctx.config.default_volume {
            Some(name) => ctx
                .volumes
                .iter()
                .find(|v| v.name.eq_ignore_ascii_case(name))
                .or_else(|| ctx.volumes.first())?,
            None => ctx.volumes.first()?,
        };
        Some(Self {
            fs: BeebFs::new(ctx.volumes.clone(), volume.clone(), ctx.changes.clone()),
            text: OutputBuffer::default(),
            flow: None,
            browser: None,
            speed: None,
            link_subtype: 0,
            roms: ctx.roms.clone(),
            dump_packets: ctx.config.dump_packets,
        })
    }

    pub(crate) fn set_text(&mut self, bytes: Vec<u8>) {
        self.text.set(bytes);
    }

    /// Handles one request. `None` for fire-and-forget codes, which must
    /// not produce a response.
    pub async fn handle_request(&mut self, request: &Request) -> Option<Response> {
        let quiet = is_quiet(request.code);
        if self.dump_packets && !quiet {
            debug!(
                "request {} ({:#04x}), {} payload bytes\n{}",
                request_name(request.code),
                request.code,
                request.payload.len(),
                hex_dump(&request.payload),
            );
        }

        if is_fire_and_forget(request.code) {
            if let Err(err) = self.dispatch(request).await {
                debug!(%err, "fire-and-forget request failed");
            }
            return None;
        }

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, "request {} failed", request_name(request.code));
                Response::error(&err)
            }
        };

        if self.dump_packets && !quiet {
            debug!(
                "response {} ({:#04x}), {} payload bytes\n{}",
                response_name(response.code),
                response.code as u8,
                response.payload.len(),
                hex_dump(&response.payload),
            );
        }
        Some(response)
    }

    async fn dispatch(&mut self, request: &Request) -> BbcResult<Response> {
        let payload = request.payload.as_slice();
        let Some(code) = request.typed_code() else {
            return Err(BbcError::disc_fault(format!("Bad request {:#04x}", request.code)));
        };

        match code {
            RequestCode::GetRom => {
                let rom = self.roms.get(self.link_subtype)?;
                Ok(Response::new(ResponseCode::Data, rom.as_ref().clone()))
            }
            RequestCode::Reset => {
                let kind = payload.first().copied().unwrap_or(0);
                if let Some(&subtype) = payload.get(1) {
                    self.link_subtype = subtype;
                }
                if kind == 1 || kind == 2 {
                    self.flow = None;
                    self.browser = None;
                    self.speed = None;
                    self.fs.reset().await?;
                }
                Ok(Response::yes())
            }
            RequestCode::EchoData => Ok(Response::new(ResponseCode::Data, payload.to_vec())),
            RequestCode::ReadString | RequestCode::ReadStringVerbose => {
                let max = match payload.first().copied().unwrap_or(0) {
                    0 => 256,
                    n => n as usize,
                };
                if code == RequestCode::ReadStringVerbose {
                    info!(remaining = self.text.remaining(), "string buffer read");
                }
                if self.text.remaining() == 0 {
                    return Ok(Response::no());
                }
                Ok(Response::new(ResponseCode::Text, self.text.take(max)))
            }
            RequestCode::StarCat => {
                let line = CommandLine::parse(strip_cr(payload))?;
                let arg = line.parts.first().map(Vec::as_slice);
                let text = self.fs.cat(arg).await?;
                self.set_text(text);
                Ok(Response::yes())
            }
            RequestCode::StarCommand => commands::execute(self, strip_cr(payload)).await,
            RequestCode::StarRun => {
                let line = CommandLine::parse(strip_cr(payload))?;
                let name = line
                    .parts
                    .first()
                    .ok_or_else(|| BbcError::stock(ErrorCode::BadName))?
                    .clone();
                self.run_file(&name).await
            }
            RequestCode::HelpBlfs => {
                self.set_text(commands::help_text());
                Ok(Response::yes())
            }
            RequestCode::Osfile => {
                let mut src = Cursor::new(payload);
                let a = read_u8(&mut src)?;
                let mut block_bytes = [0u8; 16];
                std::io::Read::read_exact(&mut src, &mut block_bytes)?;
                let name = cr_string(&mut src)?;
                let data = rest(&mut src)?;

                let block = OsfileBlock::from_bytes(&block_bytes);
                let result = self.fs.osfile(a, block, &name, &data).await?;

                let mut out = Vec::with_capacity(17 + result.data.as_ref().map_or(0, Vec::len));
                out.push(result.file_type);
                out.extend_from_slice(&result.block.to_bytes());
                if let Some(data) = result.data {
                    out.extend_from_slice(&data);
                }
                Ok(Response::new(ResponseCode::Osfile, out))
            }
            RequestCode::OsfindOpen => {
                let mut src = Cursor::new(payload);
                let mode = read_u8(&mut src)?;
                let name = cr_string_or_rest(&mut src)?;
                let handle = self.fs.osfind_open(mode, &name).await?;
                Ok(Response::byte(ResponseCode::Osfind, handle))
            }
            RequestCode::OsfindClose => {
                let handle = payload.first().copied().unwrap_or(0);
                self.fs.osfind_close(handle).await?;
                Ok(Response::byte(ResponseCode::Osfind, 0))
            }
            RequestCode::Osargs => {
                let mut src = Cursor::new(payload);
                let a = read_u8(&mut src)?;
                let handle = read_u8(&mut src)?;
                let value = read_u32(&mut src)?;
                let result = self.fs.osargs(a, handle, value).await?;
                let mut out = Vec::with_capacity(4);
                primitive::write_u32(&mut out, result)?;
                Ok(Response::new(ResponseCode::Osargs, out))
            }
            RequestCode::Eof => {
                let handle = payload.first().copied().unwrap_or(0);
                let eof = self.fs.eof(handle)?;
                Ok(Response::byte(ResponseCode::Eof, if eof { 0xff } else { 0x00 }))
            }
            RequestCode::Osbget => {
                let handle = payload.first().copied().unwrap_or(0);
                match self.fs.osbget(handle)? {
                    Some(byte) => Ok(Response::byte(ResponseCode::Osbget, byte)),
                    None => Ok(Response::byte(ResponseCode::OsbgetEof, 254)),
                }
            }
            RequestCode::Osbput => {
                let mut src = Cursor::new(payload);
                let handle = read_u8(&mut src)?;
                let byte = read_u8(&mut src)?;
                self.fs.osbput(handle, byte)?;
                Ok(Response::byte(ResponseCode::Osbput, 0))
            }
            RequestCode::StarInfo => {
                let text = self.fs.info_text(strip_cr(payload)).await?;
                self.set_text(text);
                Ok(Response::yes())
            }
            RequestCode::StarEx => {
                let spec = strip_cr(payload);
                let spec = if spec.is_empty() { None } else { Some(spec) };
                let text = self.fs.ex_text(spec).await?;
                self.set_text(text);
                Ok(Response::yes())
            }
            RequestCode::Osgbpb => {
                let mut src = Cursor::new(payload);
                let a = read_u8(&mut src)?;
                let handle = read_u8(&mut src)?;
                let size = read_u32(&mut src)?;
                let ptr = read_u32(&mut src)?;
                let data = rest(&mut src)?;

                let result = self.fs.osgbpb(a, handle, size, ptr, &data).await?;
                let mut out = Vec::with_capacity(9 + result.data.len());
                out.push(u8::from(result.carry));
                primitive::write_u32(&mut out, result.residual)?;
                primitive::write_u32(&mut out, result.ptr)?;
                out.extend_from_slice(&result.data);
                Ok(Response::new(ResponseCode::Osgbpb, out))
            }
            RequestCode::Opt => {
                let mut src = Cursor::new(payload);
                let x = read_u8(&mut src)?;
                let y = read_u8(&mut src)?;
                if x == 4 {
                    if y > 3 {
                        return Err(BbcError::stock(ErrorCode::Syntax));
                    }
                    self.fs.set_boot_option(y).await?;
                }
                Ok(Response::yes())
            }
            RequestCode::BootOption => {
                let option = self.fs.boot_option().await?;
                Ok(Response::byte(ResponseCode::BootOption, option))
            }
            RequestCode::VolumeBrowser => self.volume_browser(payload).await,
            RequestCode::SpeedTest => self.speed_test(payload),
            RequestCode::SetFileHandleRange => {
                let mut src = Cursor::new(payload);
                let first = read_u8(&mut src)?;
                let last = read_u8(&mut src)?;
                self.fs.set_handle_range(first, last).await?;
                Ok(Response::yes())
            }
            RequestCode::StartDiskImageFlow => {
                let mut src = Cursor::new(payload);
                let address = read_u32(&mut src)?;
                let size = read_u32(&mut src)?;
                let flow = self.flow.as_mut().ok_or_else(no_flow)?;
                let start = flow.start(address, size)?;

                let mut out = Vec::new();
                out.push(start.fs);
                primitive::write_cr_string(&mut out, start.fs_command.as_bytes())?;
                primitive::write_cr_string(&mut out, start.init_command.as_bytes())?;
                out.push(start.cat_oswords.len() as u8);
                for mut osword in start.cat_oswords {
                    osword.fill_address(address);
                    out.push(osword.reason);
                    out.push(osword.block.len() as u8);
                    out.extend_from_slice(&osword.block);
                }
                Ok(Response::new(ResponseCode::Data, out))
            }
            RequestCode::SetDiskImageCat => {
                let flow = self.flow.as_mut().ok_or_else(no_flow)?;
                flow.set_cat(payload)?;
                Ok(Response::yes())
            }
            RequestCode::NextDiskImagePart => {
                let flow = self.flow.as_mut().ok_or_else(no_flow)?;
                match flow.next_part()? {
                    None => Ok(Response::no()),
                    Some(part) => {
                        let mut out = Vec::new();
                        out.push(1);
                        primitive::write_cr_string(&mut out, part.message.as_bytes())?;
                        out.push(part.osword.reason);
                        out.push(part.osword.block.len() as u8);
                        out.extend_from_slice(&part.osword.block);
                        out.extend_from_slice(&part.data);
                        Ok(Response::new(ResponseCode::Data, out))
                    }
                }
            }
            RequestCode::SetLastDiskImageOswordResult => {
                let flow = self.flow.as_mut().ok_or_else(no_flow)?;
                flow.set_last_osword_result(payload)?;
                Ok(Response::yes())
            }
            RequestCode::FinishDiskImageFlow => {
                let flow = self.flow.take().ok_or_else(no_flow)?;
                let finish = flow.finish().await?;
                let mut out = Vec::new();
                out.push(finish.fs);
                primitive::write_cr_string(&mut out, finish.fs_command.as_bytes())?;
                primitive::write_cr_string(&mut out, finish.init_command.as_bytes())?;
                Ok(Response::new(ResponseCode::Data, out))
            }
        }
    }

    /// Loads a file for execution: used by STAR_RUN and the star-command
    /// fallback.
    pub(crate) async fn run_file(&mut self, name: &[u8]) -> BbcResult<Response> {
        let target = self.fs.find_run_target(name).await?;
        let Some((file, data)) = target else {
            return Err(BbcError::stock(ErrorCode::BadCommand));
        };
        if file.load == SHOULDNT_LOAD || file.exec == SHOULDNT_EXEC {
            return Err(BbcError::stock(ErrorCode::Wont));
        }
        let mut out = Vec::with_capacity(8 + data.len());
        primitive::write_u32(&mut out, file.load)?;
        primitive::write_u32(&mut out, file.exec)?;
        out.extend_from_slice(&data);
        Ok(Response::new(ResponseCode::Run, out))
    }

    async fn volume_browser(&mut self, payload: &[u8]) -> BbcResult<Response> {
        let sub = payload.first().copied().unwrap_or(0);
        if sub == 0 {
            let columns = payload.get(1).copied().unwrap_or(40);
            let rows = payload.get(2).copied().unwrap_or(25);
            let names = self.fs.volumes().iter().map(|v| v.name.clone()).collect();
            let browser = VolumeBrowser::new(names, columns, rows);
            let screen = browser.initial_screen();
            self.browser = Some(browser);
            return Ok(browser_response(
                browser_sub::PRINT_STRING_AND_FLUSH_KEYBOARD_BUFFER,
                screen,
            ));
        }

        let key = payload.get(1).copied().unwrap_or(0);
        let shift = payload.get(2).copied().unwrap_or(0) != 0;
        let browser = self
            .browser
            .as_mut()
            .ok_or_else(|| BbcError::disc_fault("No volume browser"))?;

        match browser.handle_key(key, shift) {
            BrowserAction::Canceled => {
                self.browser = None;
                Ok(browser_response(browser_sub::CANCELED, Vec::new()))
            }
            BrowserAction::Mounted(name) => {
                self.browser = None;
                self.fs.mount_by_name(&name, false).await?;
                Ok(browser_response(browser_sub::MOUNTED, name.into_bytes()))
            }
            BrowserAction::Boot(name) => {
                self.browser = None;
                self.fs.mount_by_name(&name, false).await?;
                Ok(browser_response(browser_sub::BOOT, name.into_bytes()))
            }
            BrowserAction::Print(screen) => {
                Ok(browser_response(browser_sub::PRINT_STRING, screen))
            }
            BrowserAction::PrintAndFlushKeyboardBuffer(screen) => Ok(browser_response(
                browser_sub::PRINT_STRING_AND_FLUSH_KEYBOARD_BUFFER,
                screen,
            )),
            BrowserAction::KeyIgnored => {
                Ok(browser_response(browser_sub::KEY_IGNORED, Vec::new()))
            }
        }
    }

    fn speed_test(&mut self, payload: &[u8]) -> BbcResult<Response> {
        match payload.first().copied().unwrap_or(0) {
            0 => {
                self.speed = Some(SpeedTest::new());
                Ok(Response::yes())
            }
            1 => {
                let data = &payload[1..];
                let test = self
                    .speed
                    .as_mut()
                    .ok_or_else(|| BbcError::disc_fault("No speed test running"))?;
                test.note_parcel(data.len());
                Ok(Response::new(ResponseCode::Data, data.to_vec()))
            }
            2 => {
                let test = self
                    .speed
                    .take()
                    .ok_or_else(|| BbcError::disc_fault("No speed test running"))?;
                self.set_text(test.report().into_bytes());
                Ok(Response::yes())
            }
            _ => Err(BbcError::disc_fault("Bad speed test request")),
        }
    }
}

fn browser_response(sub: u8, mut payload: Vec<u8>) -> Response {
    payload.insert(0, sub);
    Response::new(ResponseCode::VolumeBrowser, payload)
}

fn no_flow() -> BbcError {
    BbcError::disc_fault("No disk image flow")
}

/// High-frequency requests stay out of the packet dump.
fn is_quiet(code: u8) -> bool {
    matches!(
        RequestCode::from_u8(code),
        Some(
            RequestCode::Osbget
                | RequestCode::Osbput
                | RequestCode::Eof
                | RequestCode::ReadString
        )
    )
}

/// Star-command payloads may arrive CR-terminated.
pub(crate) fn strip_cr(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((&last, rest)) if last == primitive::CR => rest,
        _ => payload,
    }
}
