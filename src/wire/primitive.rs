//! Primitive payload data type reading and writing.
//!
//! BeebLink payloads are little-endian, matching the 6502 memory layout the
//! ROM reads and writes directly.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// The BBC string terminator used inside payloads.
pub const CR: u8 = 0x0d;

/// Parses a `u8` from the `Read` source.
pub fn u8(src: &mut impl Read) -> io::Result<u8> {
    src.read_u8()
}

/// Parses a `u16` from the `Read` source, in little-endian format.
#[allow(dead_code)]
pub fn u16(src: &mut impl Read) -> io::Result<u16> {
    src.read_u16::<LittleEndian>()
}

/// Parses a `u32` from the `Read` source, in little-endian format.
pub fn u32(src: &mut impl Read) -> io::Result<u32> {
    src.read_u32::<LittleEndian>()
}

/// Serializes a `u8`.
pub fn write_u8(dest: &mut dyn Write, n: u8) -> io::Result<()> {
    dest.write_u8(n)
}

/// Serializes a `u16` in little-endian order.
#[allow(dead_code)]
pub fn write_u16(dest: &mut dyn Write, n: u16) -> io::Result<()> {
    dest.write_u16::<LittleEndian>(n)
}

/// Serializes a `u32` in little-endian order.
pub fn write_u32(dest: &mut dyn Write, n: u32) -> io::Result<()> {
    dest.write_u32::<LittleEndian>(n)
}

/// Parses bytes up to and including a CR terminator. The CR is consumed and
/// not returned.
pub fn cr_string(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        match src.read_u8()? {
            CR => return Ok(bytes),
            b => bytes.push(b),
        }
    }
}

/// Parses bytes up to a CR terminator or end of input, whichever comes
/// first. Used for trailing string fields.
pub fn cr_string_or_rest(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        let mut buf = [0u8; 1];
        match src.read(&mut buf)? {
            0 => return Ok(bytes),
            _ if buf[0] == CR => return Ok(bytes),
            _ => bytes.push(buf[0]),
        }
    }
}

/// Reads every remaining byte of the source.
pub fn rest(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    src.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Serializes a string as bytes followed by a CR terminator.
pub fn write_cr_string(dest: &mut dyn Write, s: &[u8]) -> io::Result<()> {
    dest.write_all(s)?;
    dest.write_u8(CR)
}

/// Serializes a BBC pascal string: a length byte followed by the bytes.
/// Fails if the value is longer than 255 bytes.
pub fn write_pascal_string(dest: &mut dyn Write, s: &[u8]) -> io::Result<()> {
    let len: u8 = s
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pascal string too long"))?;
    dest.write_u8(len)?;
    dest.write_all(s)
}

/// Formats a buffer as an offset/hex/ASCII dump, one 16-byte row per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x} ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!(" {b:02x}")),
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_u32_round_trip() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x12345678).unwrap();
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u32(&mut Cursor::new(buf)).unwrap(), 0x12345678);
    }

    #[test]
    fn test_cr_string() {
        let mut src = Cursor::new(b"HELLO\rrest".to_vec());
        assert_eq!(cr_string(&mut src).unwrap(), b"HELLO");
        assert_eq!(rest(&mut src).unwrap(), b"rest");
    }

    #[test]
    fn test_cr_string_missing_terminator() {
        let mut src = Cursor::new(b"HELLO".to_vec());
        assert!(cr_string(&mut src).is_err());
        let mut src = Cursor::new(b"HELLO".to_vec());
        assert_eq!(cr_string_or_rest(&mut src).unwrap(), b"HELLO");
    }

    #[test]
    fn test_pascal_string() {
        let mut buf = Vec::new();
        write_pascal_string(&mut buf, b"DISC").unwrap();
        assert_eq!(buf, b"\x04DISC");
        assert!(write_pascal_string(&mut Vec::new(), &[0u8; 256]).is_err());
    }

    #[test]
    fn test_hex_dump_shape() {
        let dump = hex_dump(b"0123456789abcdef!");
        let mut lines = dump.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("00000000 "));
        assert!(first.ends_with("0123456789abcdef"));
        assert!(lines.next().unwrap().starts_with("00000010 "));
    }
}
