//! Per-connection lifecycle: register a slot, run the handshake, hand off
//! to the streaming loop, and guarantee the slot is released and the
//! outcome logged no matter which path the connection exits through.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use postgres_backend::PostgresBackend;
use pq_proto::BeMessage;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use utils::lsn::Lsn;

use crate::config::SenderConfig;
use crate::errors::{exit_code, SenderError};
use crate::handshake::{self, ReplicationCommand, SystemIdentity};
use crate::send_wal::{self, StreamingContext};
use crate::signals::SignalFlags;
use crate::slot::{SenderState, SlotInfo, SlotTable};
use crate::wal_reader::{RemovedWatermark, WalReader};

pub struct SenderServices {
    pub slot_table: Arc<SlotTable>,
    pub wal_dir: camino::Utf8PathBuf,
    pub flush_rx: watch::Receiver<Lsn>,
    pub signals: SignalFlags,
    pub shared_config: Arc<Mutex<SenderConfig>>,
    pub removed_watermark: RemovedWatermark,
    pub system_id: u64,
    pub timeline: u32,
}

/// Handle one accepted replication connection end to end. Never returns an
/// error: every failure path is logged and translated into a process exit
/// code by the caller via [`exit_code_for`].
pub async fn handle_connection<IO: AsyncRead + AsyncWrite + Unpin>(
    stream: IO,
    peer_addr: SocketAddr,
    services: Arc<SenderServices>,
) -> i32 {
    let span = info_span!("wal_sender", peer = %peer_addr);
    async move {
        let result = run_connection(stream, peer_addr, &services).await;
        match &result {
            Ok(()) => info!("sender disconnected cleanly"),
            Err(SenderError::PeerClosed) => info!("peer closed the connection"),
            Err(e) => warn!(error = %e, "sender terminated"),
        }
        result.as_ref().err().map(exit_code).unwrap_or(0)
    }
    .instrument(span)
    .await
}

async fn run_connection<IO: AsyncRead + AsyncWrite + Unpin>(
    stream: IO,
    peer_addr: SocketAddr,
    services: &Arc<SenderServices>,
) -> Result<(), SenderError> {
    if services.shared_config.lock().in_recovery {
        return Err(SenderError::StillInRecovery);
    }

    let slot = services.slot_table.register(peer_addr)?;

    let mut pgb = PostgresBackend::new(stream);
    pgb.handshake().await?;

    let system_id = services.system_id;
    let timeline = services.timeline;
    let identity = move || SystemIdentity { system_id, timeline };
    let wal_level = services.shared_config.lock().wal_level;

    let cmd = handshake::run(&mut pgb, identity, wal_level).await?;
    let ReplicationCommand::StartReplication { start_lsn, .. } = cmd;

    slot.update(|info| info.state = SenderState::Catchup);

    pgb.write_message(&BeMessage::CopyBothResponse).await?;

    let (reader, writer) = pgb.split();
    let ctx = StreamingContext {
        wal_reader: WalReader::new(
            services.wal_dir.clone(),
            postgres_ffi::PG_TLI,
            services.removed_watermark.clone(),
        ),
        flush_rx: services.flush_rx.clone(),
        slot,
        signals: services.signals.clone(),
        shared_config: Arc::clone(&services.shared_config),
        peer_addr,
    };

    send_wal::run_streaming(reader, writer, start_lsn, ctx).await
}

/// One row of the monitoring view's read contract: a point-in-time
/// snapshot of a single occupied slot.
#[derive(Serialize)]
pub struct SenderStatusRow {
    pub peer_addr: SocketAddr,
    pub state: &'static str,
    pub sent_lsn: String,
    pub write_lsn: String,
    pub flush_lsn: String,
    pub apply_lsn: String,
}

impl From<SlotInfo> for SenderStatusRow {
    fn from(info: SlotInfo) -> Self {
        SenderStatusRow {
            peer_addr: info.peer_addr,
            state: state_label(info.state),
            sent_lsn: info.sent_lsn.to_string(),
            write_lsn: info.write_lsn.to_string(),
            flush_lsn: info.flush_lsn.to_string(),
            apply_lsn: info.apply_lsn.to_string(),
        }
    }
}

fn state_label(state: SenderState) -> &'static str {
    match state {
        SenderState::Startup => "startup",
        SenderState::Backup => "backup",
        SenderState::Catchup => "catchup",
        SenderState::Streaming => "streaming",
    }
}

pub fn monitoring_rows(slot_table: &SlotTable) -> Vec<SenderStatusRow> {
    slot_table.get_all().into_iter().map(SenderStatusRow::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitoring_rows_reflect_occupied_slots() {
        let table = SlotTable::new(2);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let guard = table.register(addr).unwrap();
        guard.update(|i| i.sent_lsn = Lsn(42));
        let rows = monitoring_rows(&table);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sent_lsn, "0/2A");
    }
}
