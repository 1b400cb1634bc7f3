//! The streaming loop itself: alternates between sending a page-aligned
//! chunk of already-flushed WAL and waiting for more to become available,
//! racing a concurrent reader of the standby's feedback stream exactly as
//! the teacher's `WalSender`/`ReplyReader` pair does.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use postgres_backend::{PostgresBackendReader, PostgresBackendWriter};
use postgres_ffi::{get_current_timestamp, MAX_SEND_SIZE, XLOG_BLCKSZ};
use pq_proto::{BeMessage, FeMessage, StandbyFeMessage, WalSndKeepAlive, XLogDataBody};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use utils::latch::Latch;
use utils::lsn::Lsn;

use crate::config::SenderConfig;
use crate::errors::SenderError;
use crate::signals::SignalFlags;
use crate::slot::{SenderState, SlotGuard};
use crate::wal_reader::WalReader;

pub struct StreamingContext {
    pub wal_reader: WalReader,
    pub flush_rx: watch::Receiver<Lsn>,
    pub slot: SlotGuard,
    pub signals: SignalFlags,
    pub shared_config: Arc<Mutex<SenderConfig>>,
    pub peer_addr: SocketAddr,
}

/// Run the streaming phase of a connection to completion. Returns the
/// reason the stream ended; the caller maps that to an exit code.
pub async fn run_streaming<IO: AsyncRead + AsyncWrite + Unpin>(
    reader: PostgresBackendReader<IO>,
    writer: PostgresBackendWriter<IO>,
    start_lsn: Lsn,
    mut ctx: StreamingContext,
) -> Result<(), SenderError> {
    ctx.slot.update(|info| {
        info.state = SenderState::Streaming;
        info.sent_lsn = start_lsn;
    });

    let latch = ctx.slot.latch();
    let wal_sender = run_wal_sender(writer, start_lsn, &ctx, latch);
    let reply_reader = run_reply_reader(reader, &ctx.slot);

    tokio::select! {
        res = wal_sender => res,
        res = reply_reader => res,
    }
}

async fn run_wal_sender<IO: AsyncWrite + Unpin>(
    mut writer: PostgresBackendWriter<IO>,
    start_lsn: Lsn,
    ctx: &StreamingContext,
    latch: Latch,
) -> Result<(), SenderError> {
    let mut start_pos = start_lsn;
    let mut flush_rx = ctx.flush_rx.clone();
    let mut send_buf = vec![0u8; MAX_SEND_SIZE as usize];
    let slot_label = ctx.slot.id().to_string();

    loop {
        if ctx.signals.reload_config.swap(false, Ordering::SeqCst) {
            if let Err(e) = ctx.shared_config.lock().reload_from_file() {
                tracing::warn!(error = %e, "config reload failed, keeping previous settings");
            }
        }

        let flush_lsn = *flush_rx.borrow();

        let chunk_end_pos = wal_chunk_end(start_pos, flush_lsn);
        if let Some(chunk_end_pos) = chunk_end_pos {
            crate::metrics::CAUGHT_UP.with_label_values(&[&slot_label]).set(0);
            let timer = crate::metrics::SEND_SECONDS.start_timer();
            let len = (chunk_end_pos - start_pos) as usize;
            ctx.wal_reader.read(start_pos, &mut send_buf[..len]).await?;

            let hdr = XLogDataBody {
                wal_start: start_pos,
                wal_end: flush_lsn,
                timestamp: get_current_timestamp(),
            };
            writer
                .write_message_noflush(&BeMessage::XLogData(hdr, &send_buf[..len]))
                .map_err(SenderError::Io)?;
            writer.flush().await.map_err(SenderError::Io)?;
            timer.observe_duration();

            crate::metrics::record_sent(len);
            start_pos = chunk_end_pos;
            ctx.slot.update(|info| info.sent_lsn = start_pos);
            let update_process_title = ctx.shared_config.lock().update_process_title;
            if update_process_title {
                crate::proctitle::set(ctx.peer_addr, "streaming", start_pos);
            }
            continue;
        }

        crate::metrics::CAUGHT_UP.with_label_values(&[&slot_label]).set(1);

        // Caught up: if a drain-and-stop was requested, this is the point
        // at which it is satisfied, so promote it to a full shutdown.
        if ctx.signals.ready_to_stop.load(Ordering::SeqCst) {
            ctx.signals.shutdown_requested.store(true, Ordering::SeqCst);
        }

        if ctx.signals.shutdown_requested.load(Ordering::SeqCst) {
            writer
                .write_message_noflush(&BeMessage::CommandComplete(b"COPY 0"))
                .map_err(SenderError::Io)?;
            writer.flush().await.map_err(SenderError::Io)?;
            return Ok(());
        }

        let wal_sender_timeout = ctx.shared_config.lock().wal_sender_timeout;
        tokio::select! {
            changed = flush_rx.changed() => {
                changed.map_err(|_| SenderError::SupervisorDead)?;
            }
            _ = latch.wait() => {
                if ctx.signals.shutdown_requested.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(wal_sender_timeout) => {
                writer
                    .write_message_noflush(&BeMessage::KeepAlive(WalSndKeepAlive {
                        wal_end: flush_lsn,
                        timestamp: get_current_timestamp(),
                        request_reply: true,
                    }))
                    .map_err(SenderError::Io)?;
                writer.flush().await.map_err(SenderError::Io)?;
            }
        }
    }
}

/// Compute the end of the next chunk to send, rounded down to a page
/// boundary unless it exactly reaches the current flush pointer (in which
/// case the exact position is already a valid stopping point: the flusher
/// never publishes a flush pointer mid-record). A chunk never spans two
/// logids: if the page-capped end would cross one, it is clamped back to
/// the start of the next logid instead. Returns `None` when there is
/// nothing new to send.
fn wal_chunk_end(start_pos: Lsn, flush_lsn: Lsn) -> Option<Lsn> {
    if start_pos >= flush_lsn {
        return None;
    }
    let capped = start_pos.checked_add(MAX_SEND_SIZE).unwrap_or(Lsn::MAX);
    let mut chunk_end = capped.min(flush_lsn);
    if chunk_end.logid() != start_pos.logid() {
        chunk_end = start_pos.next_logid_start();
    }
    if chunk_end != flush_lsn {
        chunk_end = chunk_end.align_down(XLOG_BLCKSZ);
    }
    if chunk_end <= start_pos {
        None
    } else {
        Some(chunk_end)
    }
}

async fn run_reply_reader<IO: AsyncRead + Unpin>(
    mut reader: PostgresBackendReader<IO>,
    slot: &SlotGuard,
) -> Result<(), SenderError> {
    loop {
        let msg = reader.read_message().await?;
        match msg {
            Some(FeMessage::CopyData(data)) => {
                handle_feedback(&data, slot)?;
            }
            Some(FeMessage::CopyDone) => return Ok(()),
            Some(FeMessage::Terminate) => return Ok(()),
            Some(_) => {
                return Err(SenderError::ProtocolViolation(
                    "unexpected message while streaming".into(),
                ))
            }
            None => return Err(SenderError::PeerClosed),
        }
    }
}

fn handle_feedback(data: &bytes::Bytes, slot: &SlotGuard) -> Result<(), SenderError> {
    let msg = StandbyFeMessage::parse(data).map_err(|e| SenderError::ProtocolViolation(e.to_string()))?;
    match msg {
        StandbyFeMessage::StandbyStatusUpdate(update) => {
            slot.update(|info| {
                info.write_lsn = update.write_lsn;
                info.flush_lsn = update.flush_lsn;
                info.apply_lsn = update.apply_lsn;
            });
        }
        StandbyFeMessage::HotStandbyFeedback(_) => {
            // Query conflict resolution is out of scope for this sender;
            // the feedback is parsed (so malformed ones are still caught)
            // but otherwise dropped.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_down_to_page_when_capped_by_send_size() {
        let start = Lsn(0);
        let flush = Lsn(MAX_SEND_SIZE * 3);
        let end = wal_chunk_end(start, flush).unwrap();
        assert_eq!(end, Lsn(MAX_SEND_SIZE));
        assert_eq!(end.0 % XLOG_BLCKSZ, 0);
    }

    #[test]
    fn sends_exact_flush_lsn_when_not_capped() {
        let start = Lsn(100);
        let flush = Lsn(100 + XLOG_BLCKSZ / 2);
        let end = wal_chunk_end(start, flush).unwrap();
        assert_eq!(end, flush);
    }

    #[test]
    fn no_chunk_when_caught_up() {
        let lsn = Lsn(1000);
        assert_eq!(wal_chunk_end(lsn, lsn), None);
    }

    #[test]
    fn never_spans_two_logids() {
        let start = Lsn(Lsn::LOGID_SIZE - 100);
        let flush = Lsn(Lsn::LOGID_SIZE + MAX_SEND_SIZE);
        let end = wal_chunk_end(start, flush).unwrap();
        assert_eq!(end, Lsn(Lsn::LOGID_SIZE));
        assert_eq!(end.logid(), start.logid());
    }

    #[test]
    fn no_chunk_when_less_than_one_page_and_capped() {
        // start_pos so close to the MAX_SEND_SIZE cap that rounding down
        // collapses the chunk to nothing; sender should wait instead of
        // sending a zero-length frame.
        let start = Lsn(MAX_SEND_SIZE - 10);
        let flush = Lsn(MAX_SEND_SIZE * 10);
        assert_eq!(wal_chunk_end(start, flush), None);
    }
}
