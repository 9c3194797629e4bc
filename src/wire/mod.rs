//! BeebLink wire protocol: request/response codes, payload primitives and
//! the framed serial codec.

pub mod framing;
pub mod primitive;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// BBC newline: the CR LF pair used in text sent back to the BBC.
pub const BNL: &[u8] = b"\x0d\x0a";

/// Request codes, as sent by the ROM. These are 7-bit values; bit 7 on the
/// wire selects the variable-size frame form and is not part of the code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum RequestCode {
    GetRom = 0x01,
    Reset = 0x02,
    EchoData = 0x03,
    ReadString = 0x04,
    StarCat = 0x05,
    StarCommand = 0x06,
    StarRun = 0x07,
    HelpBlfs = 0x08,
    Osfile = 0x09,
    OsfindOpen = 0x0a,
    OsfindClose = 0x0b,
    Osargs = 0x0c,
    Eof = 0x0d,
    Osbget = 0x0e,
    Osbput = 0x0f,
    StarInfo = 0x10,
    StarEx = 0x11,
    Osgbpb = 0x12,
    Opt = 0x13,
    ReadStringVerbose = 0x14,
    BootOption = 0x15,
    VolumeBrowser = 0x16,
    SpeedTest = 0x17,
    SetFileHandleRange = 0x18,
    StartDiskImageFlow = 0x19,
    SetDiskImageCat = 0x1a,
    NextDiskImagePart = 0x1b,
    SetLastDiskImageOswordResult = 0x1c,
    FinishDiskImageFlow = 0x1d,
}

/// First code of the fire-and-forget request range.
pub const FNF_BEGIN: u8 = 0x60;
/// One past the last code of the fire-and-forget request range.
pub const FNF_END: u8 = 0x70;

/// True if requests with this code must not produce a response.
pub fn is_fire_and_forget(code: u8) -> bool {
    (FNF_BEGIN..FNF_END).contains(&code)
}

/// Response codes, as sent to the ROM.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Yes = 0x01,
    No = 0x02,
    Error = 0x03,
    Data = 0x04,
    Text = 0x05,
    Osfile = 0x06,
    Osfind = 0x07,
    Osargs = 0x08,
    Eof = 0x09,
    Osbget = 0x0a,
    OsbgetEof = 0x0b,
    Osbput = 0x0c,
    Osgbpb = 0x0d,
    BootOption = 0x0e,
    VolumeBrowser = 0x0f,
    Special = 0x10,
    Run = 0x11,
}

/// Volume browser response sub-codes (first payload byte).
pub mod browser_sub {
    pub const CANCELED: u8 = 0;
    pub const MOUNTED: u8 = 1;
    pub const BOOT: u8 = 2;
    pub const PRINT_STRING: u8 = 3;
    pub const PRINT_STRING_AND_FLUSH_KEYBOARD_BUFFER: u8 = 4;
    pub const KEY_IGNORED: u8 = 5;
}

/// RESPONSE_SPECIAL sub-codes (first payload byte).
pub mod special_sub {
    pub const SELF_UPDATE: u8 = 1;
    pub const SPEED_TEST: u8 = 2;
    pub const DISK_IMAGE_FLOW: u8 = 3;
    pub const SRLOAD: u8 = 4;
    pub const VOLUME_BROWSER: u8 = 5;
}

/// One framed request from the BBC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(code: u8, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// The typed request code, if this is one the server knows.
    pub fn typed_code(&self) -> Option<RequestCode> {
        RequestCode::from_u8(self.code)
    }
}

/// One framed response to the BBC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(code: ResponseCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// A response with a single payload byte.
    pub fn byte(code: ResponseCode, b: u8) -> Self {
        Self { code, payload: vec![b] }
    }

    pub fn yes() -> Self {
        Self::byte(ResponseCode::Yes, 0)
    }

    pub fn no() -> Self {
        Self::byte(ResponseCode::No, 0)
    }

    /// The `[0, code, message, 0]` error response shape.
    pub fn error(err: &crate::error::BbcError) -> Self {
        let mut payload = Vec::with_capacity(err.message.len() + 3);
        payload.push(0);
        payload.push(err.code as u8);
        payload.extend_from_slice(err.message.as_bytes());
        payload.push(0);
        Self { code: ResponseCode::Error, payload }
    }
}

/// Human-readable names for request codes, for packet dumps.
pub fn request_name(code: u8) -> &'static str {
    match RequestCode::from_u8(code) {
        Some(RequestCode::GetRom) => "GET_ROM",
        Some(RequestCode::Reset) => "RESET",
        Some(RequestCode::EchoData) => "ECHO_DATA",
        Some(RequestCode::ReadString) => "READ_STRING",
        Some(RequestCode::StarCat) => "STAR_CAT",
        Some(RequestCode::StarCommand) => "STAR_COMMAND",
        Some(RequestCode::StarRun) => "STAR_RUN",
        Some(RequestCode::HelpBlfs) => "HELP_BLFS",
        Some(RequestCode::Osfile) => "OSFILE",
        Some(RequestCode::OsfindOpen) => "OSFIND_OPEN",
        Some(RequestCode::OsfindClose) => "OSFIND_CLOSE",
        Some(RequestCode::Osargs) => "OSARGS",
        Some(RequestCode::Eof) => "EOF",
        Some(RequestCode::Osbget) => "OSBGET",
        Some(RequestCode::Osbput) => "OSBPUT",
        Some(RequestCode::StarInfo) => "STAR_INFO",
        Some(RequestCode::StarEx) => "STAR_EX",
        Some(RequestCode::Osgbpb) => "OSGBPB",
        Some(RequestCode::Opt) => "OPT",
        Some(RequestCode::ReadStringVerbose) => "READ_STRING_VERBOSE",
        Some(RequestCode::BootOption) => "BOOT_OPTION",
        Some(RequestCode::VolumeBrowser) => "VOLUME_BROWSER",
        Some(RequestCode::SpeedTest) => "SPEED_TEST",
        Some(RequestCode::SetFileHandleRange) => "SET_FILE_HANDLE_RANGE",
        Some(RequestCode::StartDiskImageFlow) => "START_DISK_IMAGE_FLOW",
        Some(RequestCode::SetDiskImageCat) => "SET_DISK_IMAGE_CAT",
        Some(RequestCode::NextDiskImagePart) => "NEXT_DISK_IMAGE_PART",
        Some(RequestCode::SetLastDiskImageOswordResult) => "SET_LAST_DISK_IMAGE_OSWORD_RESULT",
        Some(RequestCode::FinishDiskImageFlow) => "FINISH_DISK_IMAGE_FLOW",
        None => "?",
    }
}

/// Human-readable names for response codes, for packet dumps.
pub fn response_name(code: ResponseCode) -> &'static str {
    match code {
        ResponseCode::Yes => "YES",
        ResponseCode::No => "NO",
        ResponseCode::Error => "ERROR",
        ResponseCode::Data => "DATA",
        ResponseCode::Text => "TEXT",
        ResponseCode::Osfile => "OSFILE",
        ResponseCode::Osfind => "OSFIND",
        ResponseCode::Osargs => "OSARGS",
        ResponseCode::Eof => "EOF",
        ResponseCode::Osbget => "OSBGET",
        ResponseCode::OsbgetEof => "OSBGET_EOF",
        ResponseCode::Osbput => "OSBPUT",
        ResponseCode::Osgbpb => "OSGBPB",
        ResponseCode::BootOption => "BOOT_OPTION",
        ResponseCode::VolumeBrowser => "VOLUME_BROWSER",
        ResponseCode::Special => "SPECIAL",
        ResponseCode::Run => "RUN",
    }
}
