//! Reads already-flushed WAL bytes off disk for the streaming loop,
//! crossing segment-file boundaries transparently and reporting a
//! recycled/removed segment as a distinguishable error rather than a bare
//! I/O failure.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use postgres_ffi::{xlog_file_name, TimeLineId, WAL_SEGMENT_SIZE};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use utils::lsn::Lsn;

use crate::errors::SenderError;

/// The globally-visible watermark of the highest-numbered WAL byte this
/// primary has recycled or removed. A segment's file can still be present
/// on disk with its old name while its bytes have already been
/// overwritten, so file-presence alone cannot detect a recycled read; every
/// read is checked against this watermark after it completes.
#[derive(Clone, Default)]
pub struct RemovedWatermark(Arc<AtomicU64>);

impl RemovedWatermark {
    pub fn new() -> RemovedWatermark {
        RemovedWatermark(Arc::new(AtomicU64::new(0)))
    }

    /// Advance the watermark. A no-op if `lsn` is not ahead of the current
    /// value: like the flush pointer, this only ever moves forward.
    pub fn advance(&self, lsn: Lsn) {
        self.0.fetch_max(lsn.0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Lsn {
        Lsn(self.0.load(Ordering::SeqCst))
    }
}

pub struct WalReader {
    wal_dir: Utf8PathBuf,
    seg_sz: u64,
    tli: TimeLineId,
    removed: RemovedWatermark,
}

impl WalReader {
    pub fn new(wal_dir: Utf8PathBuf, tli: TimeLineId, removed: RemovedWatermark) -> WalReader {
        WalReader {
            wal_dir,
            seg_sz: WAL_SEGMENT_SIZE,
            tli,
            removed,
        }
    }

    pub fn seg_sz(&self) -> u64 {
        self.seg_sz
    }

    /// Fill `buf` starting at `start`, which must not exceed what has
    /// already been durably flushed. Reads spanning a segment boundary
    /// transparently continue into the next segment file. Checked against
    /// the removed-segment watermark both before starting and after the
    /// read completes, since the watermark can advance mid-read.
    pub async fn read(&self, start: Lsn, buf: &mut [u8]) -> Result<(), SenderError> {
        fail::fail_point!("wal-reader-segment-gone", |_| Err(SenderError::SegmentGone(start)));

        if start < self.removed.get() {
            return Err(SenderError::SegmentGone(start));
        }

        let mut pos = start;
        let mut filled = 0;
        while filled < buf.len() {
            let segno = pos.segment_number(self.seg_sz);
            let seg_offset = pos.segment_offset(self.seg_sz);
            let remaining_in_segment = (self.seg_sz - seg_offset) as usize;
            let want = (buf.len() - filled).min(remaining_in_segment);

            let path = self.wal_dir.join(xlog_file_name(self.tli, segno, self.seg_sz));
            let mut file = File::open(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SenderError::SegmentGone(pos)
                } else {
                    SenderError::Io(e)
                }
            })?;
            file.seek(SeekFrom::Start(seg_offset)).await?;
            file.read_exact(&mut buf[filled..filled + want]).await?;

            filled += want;
            pos = pos.checked_add(want as u64).expect("lsn overflow");
        }

        if start < self.removed.get() {
            return Err(SenderError::SegmentGone(start));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_segment(dir: &camino::Utf8Path, tli: TimeLineId, segno: u64, content: &[u8]) {
        let name = xlog_file_name(tli, segno, WAL_SEGMENT_SIZE);
        let mut data = vec![0u8; WAL_SEGMENT_SIZE as usize];
        data[..content.len()].copy_from_slice(content);
        fs::write(dir.join(name), data).unwrap();
    }

    #[tokio::test]
    async fn reads_within_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        write_segment(&wal_dir, 1, 0, b"hello world");

        let reader = WalReader::new(wal_dir, 1, RemovedWatermark::new());
        let mut buf = [0u8; 5];
        reader.read(Lsn(0), &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn crosses_segment_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let seg_sz = WAL_SEGMENT_SIZE;
        write_segment(&wal_dir, 1, 0, b"AAAA");
        write_segment(&wal_dir, 1, 1, b"BBBB");

        let reader = WalReader::new(wal_dir, 1, RemovedWatermark::new());
        let start = Lsn(seg_sz - 2);
        let mut buf = [0u8; 4];
        reader.read(start, &mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0, 0]); // tail padding of segment 0
        assert_eq!(&buf[2..], b"BB");
    }

    #[tokio::test]
    async fn missing_segment_is_segment_gone() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let reader = WalReader::new(wal_dir, 1, RemovedWatermark::new());
        let mut buf = [0u8; 8];
        let err = reader.read(Lsn(0), &mut buf).await.unwrap_err();
        assert!(matches!(err, SenderError::SegmentGone(_)));
    }

    #[tokio::test]
    async fn recycled_segment_is_segment_gone_even_though_file_is_present() {
        // The file exists (it was recycled, not deleted), but its bytes
        // have already been overwritten by a later logid; presence alone
        // must not be taken as proof the requested position is still good.
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        write_segment(&wal_dir, 1, 0, b"stale data");

        let watermark = RemovedWatermark::new();
        watermark.advance(Lsn(1024));
        let reader = WalReader::new(wal_dir, 1, watermark);

        let mut buf = [0u8; 8];
        let err = reader.read(Lsn(0), &mut buf).await.unwrap_err();
        assert!(matches!(err, SenderError::SegmentGone(_)));
    }

    #[tokio::test]
    async fn read_ahead_of_watermark_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        write_segment(&wal_dir, 1, 0, b"still good");

        let watermark = RemovedWatermark::new();
        watermark.advance(Lsn(4));
        let reader = WalReader::new(wal_dir, 1, watermark);

        let mut buf = [0u8; 4];
        reader.read(Lsn(6), &mut buf).await.unwrap();
        assert_eq!(&buf, b"good");
    }
}
