//! Streams committed WAL to a single connected standby per connection.
//!
//! Scope: the command handshake (`IDENTIFY_SYSTEM`, `START_REPLICATION`),
//! the page-aligned streaming loop, the shared slot table, and the
//! signal/latch wait primitive that wakes a sender when more WAL is ready
//! or the process is asked to reconfigure or shut down. The WAL
//! writer/flusher that advances the flush pointer, WAL record parsing, and
//! synchronous-replication acknowledgement tracking are all out of scope;
//! see [`flush::FlushPointer`] for the boundary this crate reads through.

pub mod config;
pub mod errors;
pub mod flush;
pub mod handshake;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod proctitle;
pub mod send_wal;
pub mod signals;
pub mod slot;
pub mod wal_reader;

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::config::SenderConfig;
use crate::lifecycle::SenderServices;
use crate::slot::SlotTable;
use crate::wal_reader::RemovedWatermark;

/// Runs the replication listener and connection handlers.
pub static WAL_SERVICE_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("wal-service")
        .enable_all()
        .build()
        .expect("failed to build wal-service runtime")
});

/// Runs the monitoring HTTP endpoint, kept separate so a stall anywhere in
/// the WAL service never blocks a status read.
pub static HTTP_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("wal-http")
        .enable_all()
        .build()
        .expect("failed to build http runtime")
});

/// Accept connections on `config.listen_replication` forever, spawning one
/// task per connection. Each task's final exit code is logged; none of
/// them propagate a panic or error up to this loop.
pub async fn run_listener(config: SenderConfig, services: Arc<SenderServices>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_replication).await?;
    info!(addr = %config.listen_replication, "wal sender listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let services = Arc::clone(&services);
        tokio::spawn(async move {
            let code = lifecycle::handle_connection(stream, peer_addr, services).await;
            if code == 2 {
                warn!(%peer_addr, "connection ended with a fatal I/O condition");
            }
        });
    }
}

/// Build the process-wide services shared by every connection from an
/// already-sized slot table (the table is shared with the signal listener,
/// which wakes every occupied slot on a process-wide signal) and the
/// flush-pointer subscription every sender reads through. `config` is
/// wrapped in a shared mutex so a `SIGHUP` reload actually reaches every
/// already-running connection.
pub fn build_services(
    config: &SenderConfig,
    slot_table: Arc<SlotTable>,
    flush_rx: tokio::sync::watch::Receiver<utils::lsn::Lsn>,
    signals: signals::SignalFlags,
    removed_watermark: RemovedWatermark,
    system_id: u64,
) -> Arc<SenderServices> {
    Arc::new(SenderServices {
        slot_table,
        wal_dir: config.wal_dir.clone(),
        flush_rx,
        signals,
        shared_config: Arc::new(Mutex::new(config.clone())),
        removed_watermark,
        system_id,
        timeline: postgres_ffi::PG_TLI,
    })
}
