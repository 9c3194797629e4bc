//! BBC-visible error values.
//!
//! Every failure that reaches the BBC is reduced to a one-byte error number
//! plus a message, the way the 8-bit filing systems report errors. Host IO
//! failures are classified once, at the handler boundary.

use std::fmt;
use std::io;

/// Result alias used by everything that can fail with a BBC error.
pub type BbcResult<T> = std::result::Result<T, BbcError>;

/// BBC error numbers used by the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    // *RUN target carries the shouldn't-run sentinel addresses
    Wont = 0x93,
    // Open-file table full under strict open
    TooManyOpen = 192,
    // Update requested on a handle opened for read
    ReadOnly = 193,
    // File already open incompatibly
    Open = 194,
    // Destructive operation on a locked file
    Locked = 195,
    // Rename/create destination exists
    Exists = 196,
    // Operation would exceed MAX_FILE_SIZE
    TooBig = 198,
    // Host IO fault or generic internal error
    DiscFault = 199,
    // Write attempted in a read-only volume
    VolumeReadOnly = 201,
    // OSWORD result indicated data lost
    DataLost = 0xca,
    // Name/drive/dir/attribute parse rejections
    BadName = 204,
    BadDrive = 205,
    BadDir = 206,
    BadAttribute = 207,
    // Missing file
    FileNotFound = 214,
    // Command syntax; empty message is enriched by the dispatcher
    Syntax = 220,
    // Bad handle
    Channel = 222,
    // Read past EOF in strict mode
    Eof = 223,
    // Command-line escape error
    BadString = 253,
    // No star command matched and *RUN failed
    BadCommand = 254,
}

impl ErrorCode {
    /// The stock message for this error number.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Wont => "Won't",
            ErrorCode::TooManyOpen => "Too many open",
            ErrorCode::ReadOnly => "Read only",
            ErrorCode::Open => "Open",
            ErrorCode::Locked => "Locked",
            ErrorCode::Exists => "Exists",
            ErrorCode::TooBig => "Too big",
            ErrorCode::DiscFault => "Disc fault",
            ErrorCode::VolumeReadOnly => "Volume read only",
            ErrorCode::DataLost => "Data lost",
            ErrorCode::BadName => "Bad name",
            ErrorCode::BadDrive => "Bad drive",
            ErrorCode::BadDir => "Bad dir",
            ErrorCode::BadAttribute => "Bad attribute",
            ErrorCode::FileNotFound => "Not found",
            ErrorCode::Syntax => "Syntax",
            ErrorCode::Channel => "Channel",
            ErrorCode::Eof => "EOF",
            ErrorCode::BadString => "Bad string",
            ErrorCode::BadCommand => "Bad command",
        }
    }
}

/// An error as surfaced to the BBC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbcError {
    pub code: ErrorCode,
    pub message: String,
}

impl BbcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// An error carrying the stock message for its code.
    pub fn stock(code: ErrorCode) -> Self {
        Self { code, message: code.default_message().to_string() }
    }

    /// A syntax error with no text; the star-command dispatcher rewrites it
    /// to `Syntax: NAME hint` for the command being handled.
    pub fn empty_syntax() -> Self {
        Self { code: ErrorCode::Syntax, message: String::new() }
    }

    pub fn disc_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DiscFault, message)
    }
}

impl fmt::Display for BbcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code as u8)
    }
}

impl std::error::Error for BbcError {}

impl From<io::Error> for BbcError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return Self::stock(ErrorCode::FileNotFound);
        }
        match err.raw_os_error() {
            Some(code) => Self::disc_fault(format!("POSIX error: {code}")),
            None => Self::disc_fault(format!("Host error: {err}")),
        }
    }
}
