//! INTAP v1.1 frame codec.
//!
//! Fixed 36-byte header followed by `buf_len` bytes of payload. All
//! multi-byte integers are big-endian (network byte order). The signature
//! is always bit-identical to `b"INTAP11\0"` and doubles as a resync
//! sentinel at the start of any frame.

use crate::error::FrameError;
use crate::socketset::{read_fill_blocking, Source};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const SIGNATURE: [u8; 8] = *b"INTAP11\0";
pub const HEADER_LEN: usize = 36;
const IP_FIELD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum Command {
    Hello = 1,
    Byebye = 2,
    DbConnect = 3,
    CliConnect = 4,
    Echo = 5,
}

impl Command {
    fn from_u16(id: u16) -> Result<Command, FrameError> {
        match id {
            1 => Ok(Command::Hello),
            2 => Ok(Command::Byebye),
            3 => Ok(Command::DbConnect),
            4 => Ok(Command::CliConnect),
            5 => Ok(Command::Echo),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// The 36-byte INTAP header. `src_fd`/`dest_fd` carry dense flow ids
/// (see `flowid`), not raw OS descriptor numbers; `-1` means "unknown".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub id: Command,
    pub src_fd: i16,
    pub dest_fd: i16,
    pub port: u16,
    pub ip: [u8; IP_FIELD_LEN],
    pub buf_len: u32,
}

impl Header {
    pub fn new(id: Command, src_fd: i16, dest_fd: i16) -> Header {
        Header {
            id,
            src_fd,
            dest_fd,
            port: 0,
            ip: [0u8; IP_FIELD_LEN],
            buf_len: 0,
        }
    }

    pub fn with_ip(mut self, ip: &str, port: u16) -> Result<Header, FrameError> {
        self.ip = encode_ip(ip)?;
        self.port = port;
        Ok(self)
    }

    pub fn with_buf_len(mut self, buf_len: u32) -> Header {
        self.buf_len = buf_len;
        self
    }

    pub fn ip_str(&self) -> String {
        let end = self.ip.iter().position(|&b| b == 0).unwrap_or(self.ip.len());
        String::from_utf8_lossy(&self.ip[..end]).into_owned()
    }

    /// Writes the 36-byte header (but not the payload) to `writer`.
    pub fn encode<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&SIGNATURE)?;
        writer.write_u16::<BigEndian>(self.id as u16)?;
        writer.write_i16::<BigEndian>(self.src_fd)?;
        writer.write_i16::<BigEndian>(self.dest_fd)?;
        writer.write_u16::<BigEndian>(self.port)?;
        writer.write_all(&self.ip)?;
        writer.write_u32::<BigEndian>(self.buf_len)?;
        Ok(())
    }

    /// Reads exactly 36 bytes from `reader` and decodes them into a `Header`.
    /// Fails with `FrameError::ShortHeader` on EOF before 36 bytes, and
    /// `FrameError::BadSignature`/`UnknownCommand` on a malformed header.
    pub fn decode<R: Read>(mut reader: R) -> Result<Header, FrameError> {
        let mut raw = [0u8; HEADER_LEN];
        let got = read_fill(&mut reader, &mut raw)?;
        if got < HEADER_LEN {
            return Err(FrameError::ShortHeader { got });
        }

        let mut cursor = &raw[..];
        let mut sig = [0u8; 8];
        cursor.read_exact(&mut sig).map_err(|_| FrameError::ShortHeader { got })?;
        if sig != SIGNATURE {
            return Err(FrameError::BadSignature);
        }

        let id = Command::from_u16(cursor.read_u16::<BigEndian>().unwrap())?;
        let src_fd = cursor.read_i16::<BigEndian>().unwrap();
        let dest_fd = cursor.read_i16::<BigEndian>().unwrap();
        let port = cursor.read_u16::<BigEndian>().unwrap();
        let mut ip = [0u8; IP_FIELD_LEN];
        cursor.read_exact(&mut ip).unwrap();
        let buf_len = cursor.read_u32::<BigEndian>().unwrap();

        Ok(Header {
            id,
            src_fd,
            dest_fd,
            port,
            ip,
            buf_len,
        })
    }

    /// `true` iff the raw bytes begin with the INTAP signature. Used by the
    /// event loop to classify a freshly-accepted, unclassified socket.
    pub fn looks_like_intap(buf: &[u8]) -> bool {
        buf.len() >= SIGNATURE.len() && buf[..SIGNATURE.len()] == SIGNATURE
    }
}

/// A header parsed without validating signature or command, used by the
/// tunnel reader to stay byte-synchronized even when a frame turns out to
/// be malformed: `buf_len` sits at a fixed offset regardless of whether the
/// signature or command checks out, so the payload can still be read and
/// discarded before moving on to the next frame.
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub signature_ok: bool,
    pub command_raw: u16,
    pub src_fd: i16,
    pub dest_fd: i16,
    pub port: u16,
    pub ip: [u8; IP_FIELD_LEN],
    pub buf_len: u32,
}

impl RawHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> RawHeader {
        let mut sig = [0u8; 8];
        sig.copy_from_slice(&raw[..8]);

        let mut cursor = &raw[8..];
        let command_raw = cursor.read_u16::<BigEndian>().unwrap();
        let src_fd = cursor.read_i16::<BigEndian>().unwrap();
        let dest_fd = cursor.read_i16::<BigEndian>().unwrap();
        let port = cursor.read_u16::<BigEndian>().unwrap();
        let mut ip = [0u8; IP_FIELD_LEN];
        cursor.read_exact(&mut ip).unwrap();
        let buf_len = cursor.read_u32::<BigEndian>().unwrap();

        RawHeader {
            signature_ok: sig == SIGNATURE,
            command_raw,
            src_fd,
            dest_fd,
            port,
            ip,
            buf_len,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.command_raw).ok()
    }

    pub fn ip_str(&self) -> String {
        let end = self.ip.iter().position(|&b| b == 0).unwrap_or(self.ip.len());
        String::from_utf8_lossy(&self.ip[..end]).into_owned()
    }

    /// A well-formed `Header`, if both the signature and command checked out.
    pub fn to_header(&self) -> Option<Header> {
        self.command().map(|id| Header {
            id,
            src_fd: self.src_fd,
            dest_fd: self.dest_fd,
            port: self.port,
            ip: self.ip,
            buf_len: self.buf_len,
        })
    }
}

/// Reads exactly `header.buf_len` bytes of payload. Returns an empty vec
/// for `buf_len == 0` without touching `reader`.
pub fn read_payload<R: Read>(mut reader: R, header: &Header) -> Result<Vec<u8>, FrameError> {
    if header.buf_len == 0 {
        return Ok(Vec::new());
    }

    let expected = header.buf_len as usize;
    let mut buf = vec![0u8; expected];
    let got = read_fill(&mut reader, &mut buf)?;
    if got < expected {
        return Err(FrameError::ShortPayload { expected: header.buf_len, got });
    }
    Ok(buf)
}

/// Encodes `header` followed by `payload` into a single contiguous buffer,
/// suitable for one `write_all` call on the tunnel.
pub fn encode_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut out).expect("writing to a Vec never fails");
    out.extend_from_slice(payload);
    out
}

/// Reads one frame off a live tunnel socket: the 36-byte header (parsed
/// leniently, since a bad signature or unknown command must not desync the
/// reader) followed by exactly `buf_len` payload bytes. `Ok(None)` means the
/// peer closed mid-frame — the caller treats that as tunnel death, not a
/// single malformed frame.
pub fn read_tunnel_frame<S: Read + Source>(stream: &mut S) -> io::Result<Option<(RawHeader, Vec<u8>)>> {
    let mut raw = [0u8; HEADER_LEN];
    let got = read_fill_blocking(stream, &mut raw)?;
    if got < HEADER_LEN {
        return Ok(None);
    }

    let header = RawHeader::parse(&raw);
    if header.buf_len == 0 {
        return Ok(Some((header, Vec::new())));
    }

    let mut payload = vec![0u8; header.buf_len as usize];
    let got = read_fill_blocking(stream, &mut payload)?;
    if got < payload.len() {
        return Ok(None);
    }
    Ok(Some((header, payload)))
}

fn encode_ip(ip: &str) -> Result<[u8; IP_FIELD_LEN], FrameError> {
    let bytes = ip.as_bytes();
    if bytes.len() >= IP_FIELD_LEN {
        return Err(FrameError::IpTooLong);
    }
    let mut out = [0u8; IP_FIELD_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Reads into `buf` until it is full or EOF is reached, returning the
/// number of bytes actually read, without retrying forever on a genuinely
/// closed socket.
fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let h = Header::new(Command::Echo, 3, 7)
            .with_ip("10.0.0.5", 5432)
            .unwrap()
            .with_buf_len(128);

        let mut buf = Vec::new();
        h.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = Header::decode(Cursor::new(buf)).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn zero_len_payload_round_trips() {
        let h = Header::new(Command::Hello, 0, -1).with_ip("0.0.0.0", 0).unwrap();
        let framed = encode_frame(&h, &[]);
        let mut cursor = Cursor::new(framed);
        let decoded = Header::decode(&mut cursor).unwrap();
        assert_eq!(decoded.buf_len, 0);
        let payload = read_payload(&mut cursor, &decoded).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn payload_round_trips_at_buffer_capacity() {
        let payload: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        let h = Header::new(Command::Echo, 1, 2).with_buf_len(payload.len() as u32);
        let framed = encode_frame(&h, &payload);

        let mut cursor = Cursor::new(framed);
        let decoded = Header::decode(&mut cursor).unwrap();
        let out = read_payload(&mut cursor, &decoded).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn short_header_is_reported() {
        let buf = vec![0u8; 10];
        let err = Header::decode(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::ShortHeader { got: 10 }));
    }

    #[test]
    fn bad_signature_is_reported() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(b"NOTINTAP");
        let err = Header::decode(Cursor::new(raw)).unwrap_err();
        assert!(matches!(err, FrameError::BadSignature));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&SIGNATURE);
        raw[8] = 0;
        raw[9] = 99; // id = 99, big-endian u16
        let err = Header::decode(Cursor::new(raw)).unwrap_err();
        assert!(matches!(err, FrameError::UnknownCommand(99)));
    }

    #[test]
    fn short_payload_is_reported() {
        let h = Header::new(Command::Echo, 0, 1).with_buf_len(10);
        let err = read_payload(Cursor::new(vec![1, 2, 3]), &h).unwrap_err();
        assert!(matches!(err, FrameError::ShortPayload { expected: 10, got: 3 }));
    }

    #[test]
    fn ip_too_long_is_rejected() {
        let long_ip = "1".repeat(IP_FIELD_LEN);
        let err = Header::new(Command::Hello, 0, -1).with_ip(&long_ip, 0).unwrap_err();
        assert!(matches!(err, FrameError::IpTooLong));
    }

    #[test]
    fn dest_fd_unknown_round_trips_as_negative_one() {
        let h = Header::new(Command::DbConnect, 5, -1);
        let mut buf = Vec::new();
        h.encode(&mut buf).unwrap();
        let decoded = Header::decode(Cursor::new(buf)).unwrap();
        assert_eq!(decoded.dest_fd, -1);
    }

    #[test]
    fn raw_header_parses_fields_despite_bad_signature() {
        let h = Header::new(Command::Echo, 2, 9).with_buf_len(7);
        let mut buf = Vec::new();
        h.encode(&mut buf).unwrap();
        buf[0] = b'X'; // corrupt the signature only

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf);
        let parsed = RawHeader::parse(&raw);

        assert!(!parsed.signature_ok);
        assert_eq!(parsed.src_fd, 2);
        assert_eq!(parsed.buf_len, 7);
        assert!(parsed.to_header().is_none());
    }

    #[test]
    fn raw_header_reports_unknown_command_but_keeps_buf_len() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&SIGNATURE);
        raw[9] = 200; // id = 200, unknown
        raw[32..36].copy_from_slice(&42u32.to_be_bytes());

        let parsed = RawHeader::parse(&raw);
        assert!(parsed.signature_ok);
        assert!(parsed.command().is_none());
        assert_eq!(parsed.buf_len, 42);
    }

    #[test]
    fn looks_like_intap_detects_signature() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&SIGNATURE);
        assert!(Header::looks_like_intap(&raw));
        assert!(!Header::looks_like_intap(b"SELECT 1"));
        assert!(!Header::looks_like_intap(b"short"));
    }
}
