//! Log Sequence Number arithmetic, in the same `XXXXXXXX/XXXXXXXX` format
//! used on the wire by `IDENTIFY_SYSTEM` and `XLogData`.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An absolute position in the WAL stream, as a byte offset from the start
/// of WAL history.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Size of a "logid": the legacy 32-bit-split addressing scheme treats
    /// an LSN as `(logid: high 32 bits, recoff: low 32 bits)`, so a logid
    /// spans this many bytes of WAL.
    pub const LOGID_SIZE: u64 = 1 << 32;

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// The high 32 bits: which logid this LSN falls in.
    pub fn logid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The low 32 bits: the byte offset within this LSN's logid.
    pub fn recoff(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// The LSN one past the end of this LSN's logid, i.e. the start of the
    /// next one.
    pub fn next_logid_start(self) -> Lsn {
        Lsn(((self.logid() as u64) + 1) << 32)
    }

    /// Offset within the `seg_sz`-byte WAL segment that contains this LSN.
    pub fn segment_offset(self, seg_sz: u64) -> u64 {
        self.0 % seg_sz
    }

    /// Segment number containing this LSN, given the configured segment size.
    pub fn segment_number(self, seg_sz: u64) -> u64 {
        self.0 / seg_sz
    }

    /// Offset within the `XLOG_BLCKSZ`-byte page containing this LSN.
    pub fn block_offset(self, block_sz: u64) -> u64 {
        self.0 % block_sz
    }

    /// Round down to the start of the page containing this LSN.
    pub fn segment_lsn(self, seg_sz: u64) -> Lsn {
        Lsn(self.0 - self.segment_offset(seg_sz))
    }

    pub fn checked_add<T: Into<u64>>(self, offset: T) -> Option<Lsn> {
        self.0.checked_add(offset.into()).map(Lsn)
    }

    pub fn checked_sub<T: Into<u64>>(self, offset: T) -> Option<Lsn> {
        self.0.checked_sub(offset.into()).map(Lsn)
    }

    /// Align this LSN down to a multiple of `align`, which must be a power
    /// of two. Used to round a chunk boundary back to the last full page so
    /// a WAL record is never split across a send.
    pub fn align_down(self, align: u64) -> Lsn {
        Lsn(self.0 & !(align - 1))
    }

    pub fn remaining_in_segment(self, seg_sz: u64) -> u64 {
        seg_sz - self.segment_offset(seg_sz)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid LSN string: {0:?}")]
pub struct LsnParseError(String);

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;

    fn sub(self, rhs: Lsn) -> u64 {
        self.0.checked_sub(rhs.0).expect("Lsn subtraction underflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let lsn = Lsn(0x1234_5678_9abc_def0);
        let s = lsn.to_string();
        assert_eq!(s, "12345678/9ABCDEF0");
        assert_eq!(Lsn::from_str(&s).unwrap(), lsn);
    }

    #[test]
    fn align_down_rounds_to_page() {
        let lsn = Lsn(0x2000 + 123);
        assert_eq!(lsn.align_down(0x2000), Lsn(0x2000));
    }

    #[test]
    fn logid_boundary() {
        let lsn = Lsn(Lsn::LOGID_SIZE * 2 + 42);
        assert_eq!(lsn.logid(), 2);
        assert_eq!(lsn.recoff(), 42);
        assert_eq!(lsn.next_logid_start(), Lsn(Lsn::LOGID_SIZE * 3));
    }

    #[test]
    fn segment_math() {
        let seg_sz = 16 * 1024 * 1024u64;
        let lsn = Lsn(seg_sz * 3 + 42);
        assert_eq!(lsn.segment_number(seg_sz), 3);
        assert_eq!(lsn.segment_offset(seg_sz), 42);
        assert_eq!(lsn.remaining_in_segment(seg_sz), seg_sz - 42);
    }
}
