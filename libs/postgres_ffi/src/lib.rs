//! WAL geometry: segment/page sizing and naming, independent of WAL record
//! parsing (which is out of scope for this crate — see the streaming
//! sender's module docs).

use std::time::{SystemTime, UNIX_EPOCH};

use utils::lsn::Lsn;

/// Page size used to frame WAL data; a streamed chunk is never allowed to
/// straddle a page boundary mid-record.
pub const XLOG_BLCKSZ: u64 = 8192;

/// Default WAL segment size. Configurable at `initdb` time on a real
/// cluster; fixed here since this crate reads an existing WAL directory
/// rather than creating one.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Upper bound on a single outgoing chunk, matching real `walsender.c`'s
/// `MAX_SEND_SIZE` (16 pages).
pub const MAX_SEND_SIZE: u64 = XLOG_BLCKSZ * 16;

/// A WAL timeline identifier.
pub type TimeLineId = u32;

/// The only timeline this crate ever assumes when none is specified by the
/// handshake; callers that need multi-timeline awareness track it
/// elsewhere.
pub const PG_TLI: TimeLineId = 1;

/// A WAL segment number, i.e. an LSN divided by the segment size.
pub type XLogSegNo = u64;

/// Microseconds since 2000-01-01 00:00:00 UTC, matching Postgres's
/// `TimestampTz` wire representation used in `XLogData` and keepalive
/// messages.
pub type TimestampTz = i64;

const POSTGRES_EPOCH_JDATE_UNIX_SECS: i64 = 946_684_800; // 2000-01-01 relative to the Unix epoch

pub fn get_current_timestamp() -> TimestampTz {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_micros() as i64) - POSTGRES_EPOCH_JDATE_UNIX_SECS * 1_000_000
}

pub fn segno_offset_to_lsn(segno: XLogSegNo, offset: u64, seg_sz: u64) -> Lsn {
    Lsn(segno * seg_sz + offset)
}

/// Render a WAL segment's on-disk filename: `TTTTTTTTHHHHHHHHLLLLLLLL`, the
/// timeline id followed by the segment number split into the high/low
/// halves Postgres uses so segment files sort lexically within a timeline.
pub fn xlog_file_name(tli: TimeLineId, segno: XLogSegNo, seg_sz: u64) -> String {
    let segments_per_xlog_id = 0x1_0000_0000u64 / seg_sz;
    let hi = segno / segments_per_xlog_id;
    let lo = segno % segments_per_xlog_id;
    format!("{tli:08X}{hi:08X}{lo:08X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_matches_known_vector() {
        // first segment of timeline 1 at the start of WAL history
        assert_eq!(xlog_file_name(1, 0, WAL_SEGMENT_SIZE), "000000010000000000000000");
        assert_eq!(xlog_file_name(1, 1, WAL_SEGMENT_SIZE), "000000010000000000000001");
    }

    #[test]
    fn file_name_rolls_over_high_half() {
        let segments_per_xlog_id = 0x1_0000_0000u64 / WAL_SEGMENT_SIZE;
        assert_eq!(
            xlog_file_name(1, segments_per_xlog_id, WAL_SEGMENT_SIZE),
            "000000010000000100000000"
        );
    }

    #[test]
    fn segno_offset_roundtrip() {
        let lsn = segno_offset_to_lsn(3, 512, WAL_SEGMENT_SIZE);
        assert_eq!(lsn.segment_number(WAL_SEGMENT_SIZE), 3);
        assert_eq!(lsn.segment_offset(WAL_SEGMENT_SIZE), 512);
    }
}
