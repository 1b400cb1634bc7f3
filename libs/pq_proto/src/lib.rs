//! Front-end/back-end wire framing for the replication sub-protocol this
//! crate speaks: the simple-query handshake plus `CopyBoth` streaming.
//! All multi-byte integers on the wire are big-endian.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use utils::lsn::Lsn;

pub use postgres_ffi_types::TimestampTz;

/// Mirrors the handful of `postgres_ffi` scalar types this crate needs
/// without depending on `postgres_ffi` itself (which instead depends on
/// `pq_proto`'s sibling `postgres_backend` for nothing; kept separate to
/// avoid a dependency cycle between the two leaf crates).
mod postgres_ffi_types {
    pub type TimestampTz = i64;
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("message too short")]
    Short,
    #[error("unrecognized message tag {0:#x}")]
    UnknownTag(u8),
    #[error("malformed startup packet")]
    BadStartup,
    #[error("string is not valid utf-8")]
    BadUtf8(#[from] std::str::Utf8Error),
}

pub const PROTOCOL_VERSION_3: u32 = 0x0003_0000;

pub struct FeStartupPacket {
    pub version: u32,
    pub params: Vec<(String, String)>,
}

impl FeStartupPacket {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_replication(&self) -> bool {
        matches!(self.param("replication"), Some("true") | Some("database"))
    }
}

/// Parse a startup packet body (the bytes after the 4-byte length and the
/// 4-byte protocol version, which the caller has already consumed to learn
/// how much to read).
pub fn parse_startup_params(version: u32, mut body: &[u8]) -> Result<FeStartupPacket, ProtocolError> {
    let mut params = Vec::new();
    loop {
        let key = read_cstr(&mut body)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstr(&mut body)?;
        params.push((key, value));
    }
    Ok(FeStartupPacket { version, params })
}

fn read_cstr(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let nul = buf.iter().position(|&b| b == 0).ok_or(ProtocolError::BadStartup)?;
    let s = std::str::from_utf8(&buf[..nul])?.to_owned();
    *buf = &buf[nul + 1..];
    Ok(s)
}

/// A front-end message received after the startup handshake completed.
pub enum FeMessage {
    /// Simple query text, e.g. `IDENTIFY_SYSTEM` or `START_REPLICATION ...`.
    Query(String),
    CopyData(Bytes),
    CopyDone,
    CopyFail(String),
    Terminate,
}

pub const QUERY_TAG: u8 = b'Q';
pub const COPY_DATA_TAG: u8 = b'd';
pub const COPY_DONE_TAG: u8 = b'c';
pub const COPY_FAIL_TAG: u8 = b'f';
pub const TERMINATE_TAG: u8 = b'X';

impl FeMessage {
    /// Parse one message body given its leading tag byte. `body` excludes
    /// the tag and the 4-byte length prefix.
    pub fn parse(tag: u8, body: Bytes) -> Result<FeMessage, ProtocolError> {
        match tag {
            QUERY_TAG => {
                let s = cstr_from_bytes(&body)?;
                Ok(FeMessage::Query(s))
            }
            COPY_DATA_TAG => Ok(FeMessage::CopyData(body)),
            COPY_DONE_TAG => Ok(FeMessage::CopyDone),
            COPY_FAIL_TAG => {
                let s = cstr_from_bytes(&body)?;
                Ok(FeMessage::CopyFail(s))
            }
            TERMINATE_TAG => Ok(FeMessage::Terminate),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn cstr_from_bytes(body: &Bytes) -> Result<String, ProtocolError> {
    let bytes = if body.last() == Some(&0) {
        &body[..body.len() - 1]
    } else {
        &body[..]
    };
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

/// Feedback sent by the standby in a `CopyData` frame while streaming.
pub enum StandbyFeMessage {
    StandbyStatusUpdate(StandbyStatusUpdate),
    HotStandbyFeedback(HotStandbyFeedback),
}

pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';
pub const HOT_STANDBY_FEEDBACK_TAG: u8 = b'h';

#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
    pub timestamp: TimestampTz,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct HotStandbyFeedback {
    pub timestamp: TimestampTz,
    pub xmin: u32,
    pub xmin_epoch: u32,
    pub catalog_xmin: u32,
    pub catalog_xmin_epoch: u32,
}

impl StandbyFeMessage {
    pub fn parse(data: &Bytes) -> Result<StandbyFeMessage, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Short);
        }
        let tag = data[0];
        let mut b = &data[1..];
        match tag {
            STANDBY_STATUS_UPDATE_TAG => {
                if b.len() < 8 + 8 + 8 + 8 + 1 {
                    return Err(ProtocolError::Short);
                }
                let write_lsn = Lsn(b.get_u64());
                let flush_lsn = Lsn(b.get_u64());
                let apply_lsn = Lsn(b.get_u64());
                let timestamp = b.get_i64();
                let reply_requested = b.get_u8() != 0;
                Ok(StandbyFeMessage::StandbyStatusUpdate(StandbyStatusUpdate {
                    write_lsn,
                    flush_lsn,
                    apply_lsn,
                    timestamp,
                    reply_requested,
                }))
            }
            HOT_STANDBY_FEEDBACK_TAG => {
                if b.len() < 8 + 4 + 4 + 4 + 4 {
                    return Err(ProtocolError::Short);
                }
                let timestamp = b.get_i64();
                let xmin = b.get_u32();
                let xmin_epoch = b.get_u32();
                let catalog_xmin = b.get_u32();
                let catalog_xmin_epoch = b.get_u32();
                Ok(StandbyFeMessage::HotStandbyFeedback(HotStandbyFeedback {
                    timestamp,
                    xmin,
                    xmin_epoch,
                    catalog_xmin,
                    catalog_xmin_epoch,
                }))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// A single text column descriptor for `RowDescription`.
pub struct RowDescriptor {
    pub name: &'static str,
}

impl RowDescriptor {
    pub fn text_col(name: &'static str) -> RowDescriptor {
        RowDescriptor { name }
    }
}

/// The 24-byte header prefixing every `XLogData` payload.
#[derive(Debug, Clone, Copy)]
pub struct XLogDataBody {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub timestamp: TimestampTz,
}

#[derive(Debug, Clone, Copy)]
pub struct WalSndKeepAlive {
    pub wal_end: Lsn,
    pub timestamp: TimestampTz,
    pub request_reply: bool,
}

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';

/// A backend (server-to-client) message.
pub enum BeMessage<'a> {
    AuthenticationOk,
    ParameterStatus { name: &'static str, value: &'a str },
    ReadyForQuery,
    RowDescription(&'a [RowDescriptor]),
    DataRow(&'a [Option<&'a [u8]>]),
    CommandComplete(&'a [u8]),
    CopyBothResponse,
    /// `XLogData`'s header plus the WAL bytes that follow it, both wrapped
    /// in the enclosing `CopyData` frame.
    XLogData(XLogDataBody, &'a [u8]),
    KeepAlive(WalSndKeepAlive),
    ErrorResponse(&'a str),
    NoticeResponse(&'a str),
}

impl<'a> BeMessage<'a> {
    /// Serialize this message, including its 1-byte tag and 4-byte
    /// (big-endian) length prefix, appending to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            BeMessage::AuthenticationOk => {
                write_framed(buf, b'R', |b| b.put_i32(0));
            }
            BeMessage::ParameterStatus { name, value } => {
                write_framed(buf, b'S', |b| {
                    put_cstr(b, name);
                    put_cstr(b, value);
                });
            }
            BeMessage::ReadyForQuery => {
                write_framed(buf, b'Z', |b| b.put_u8(b'I'));
            }
            BeMessage::RowDescription(cols) => {
                write_framed(buf, b'T', |b| {
                    b.put_i16(cols.len() as i16);
                    for col in cols.iter() {
                        put_cstr(b, col.name);
                        b.put_i32(0); // table oid
                        b.put_i16(0); // column number
                        b.put_i32(25); // text
                        b.put_i16(-1); // typlen
                        b.put_i32(-1); // typmod
                        b.put_i16(0); // format: text
                    }
                });
            }
            BeMessage::DataRow(cols) => {
                write_framed(buf, b'D', |b| {
                    b.put_i16(cols.len() as i16);
                    for col in cols.iter() {
                        match col {
                            Some(bytes) => {
                                b.put_i32(bytes.len() as i32);
                                b.put_slice(bytes);
                            }
                            None => b.put_i32(-1),
                        }
                    }
                });
            }
            BeMessage::CommandComplete(tag) => {
                write_framed(buf, b'C', |b| {
                    b.put_slice(tag);
                    b.put_u8(0);
                });
            }
            BeMessage::CopyBothResponse => {
                write_framed(buf, b'W', |b| {
                    b.put_u8(0); // overall format: text/binary mixed not used, 0 = text
                    b.put_i16(0); // number of columns, none for streaming
                });
            }
            BeMessage::XLogData(hdr, data) => {
                write_framed(buf, b'd', |b| {
                    b.put_u8(XLOG_DATA_TAG);
                    b.put_u64(hdr.wal_start.0);
                    b.put_u64(hdr.wal_end.0);
                    b.put_i64(hdr.timestamp);
                    b.put_slice(data);
                });
            }
            BeMessage::KeepAlive(ka) => {
                write_framed(buf, b'd', |b| {
                    b.put_u8(KEEPALIVE_TAG);
                    b.put_u64(ka.wal_end.0);
                    b.put_i64(ka.timestamp);
                    b.put_u8(ka.request_reply as u8);
                });
            }
            BeMessage::ErrorResponse(msg) => {
                write_framed(buf, b'E', |b| {
                    b.put_u8(b'S');
                    put_cstr(b, "ERROR");
                    b.put_u8(b'M');
                    put_cstr(b, msg);
                    b.put_u8(0);
                });
            }
            BeMessage::NoticeResponse(msg) => {
                write_framed(buf, b'N', |b| {
                    b.put_u8(b'S');
                    put_cstr(b, "NOTICE");
                    b.put_u8(b'M');
                    put_cstr(b, msg);
                    b.put_u8(0);
                });
            }
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn write_framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0); // placeholder, patched below
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    BigEndian::write_i32(&mut buf[len_pos..len_pos + 4], len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlogdata_round_trip_shape() {
        let mut buf = BytesMut::new();
        let body = XLogDataBody {
            wal_start: Lsn(100),
            wal_end: Lsn(200),
            timestamp: 42,
        };
        BeMessage::XLogData(body, b"hello").write(&mut buf);
        assert_eq!(buf[0], b'd');
        let len = BigEndian::read_i32(&buf[1..5]) as usize;
        assert_eq!(len, 4 + 1 + 8 + 8 + 8 + 5);
        assert_eq!(buf[5], XLOG_DATA_TAG);
    }

    #[test]
    fn standby_status_update_parses() {
        let mut raw = BytesMut::new();
        raw.put_u8(STANDBY_STATUS_UPDATE_TAG);
        raw.put_u64(10);
        raw.put_u64(20);
        raw.put_u64(30);
        raw.put_i64(0);
        raw.put_u8(1);
        let parsed = StandbyFeMessage::parse(&raw.freeze()).unwrap();
        match parsed {
            StandbyFeMessage::StandbyStatusUpdate(u) => {
                assert_eq!(u.write_lsn, Lsn(10));
                assert_eq!(u.flush_lsn, Lsn(20));
                assert_eq!(u.apply_lsn, Lsn(30));
                assert!(u.reply_requested);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn startup_params_parse() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"user\0alice\0replication\0true\0\0");
        let pkt = parse_startup_params(PROTOCOL_VERSION_3, &raw).unwrap();
        assert_eq!(pkt.param("user"), Some("alice"));
        assert!(pkt.is_replication());
    }
}
