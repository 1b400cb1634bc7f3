//! Process entrypoint: parses configuration, wires up the slot table, the
//! signal listener, the flush-pointer source, and the replication and
//! monitoring listeners, and runs them on two separate runtimes so a
//! stall in one never blocks the other — the same split the teacher uses
//! between its WAL-service and HTTP runtimes.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use walsender::config::{Args, SenderConfig};
use walsender::flush::FlushPointer;
use walsender::slot::SlotTable;
use walsender::wal_reader::RemovedWatermark;
use walsender::{build_services, signals, HTTP_RUNTIME, WAL_SERVICE_RUNTIME};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = Args::parse();
    let config = SenderConfig::from(args);

    let slot_table = SlotTable::new(config.max_wal_senders);
    let signal_flags = signals::spawn(Arc::clone(&slot_table))?;

    // The WAL writer/flusher that would normally advance this pointer is
    // out of scope for this crate; a background scan of the WAL directory
    // stands in for it so the binary is runnable end to end against a
    // real `pg_wal`-style directory.
    let (flush_pointer, flush_rx) = FlushPointer::new(utils::lsn::Lsn::INVALID);
    let removed_watermark = RemovedWatermark::new();
    let system_id = system_identifier();

    let services = build_services(
        &config,
        slot_table,
        flush_rx,
        signal_flags.clone(),
        removed_watermark,
        system_id,
    );

    let wal_dir_for_scan = config.wal_dir.clone();
    WAL_SERVICE_RUNTIME.spawn(async move {
        scan_flush_pointer_forever(wal_dir_for_scan, flush_pointer).await;
    });

    {
        let config = config.clone();
        let services = Arc::clone(&services);
        WAL_SERVICE_RUNTIME.spawn(async move {
            if let Err(e) = walsender::run_listener(config, services).await {
                tracing::error!(error = %e, "replication listener exited");
            }
        });
    }

    let http_addr = config.listen_http;
    let http_slot_table = Arc::clone(&services.slot_table);
    HTTP_RUNTIME.spawn(async move {
        if let Err(e) = walsender::http::serve(http_addr, http_slot_table).await {
            tracing::error!(error = %e, "monitoring http endpoint exited");
        }
    });

    // Block the main thread on shutdown, mirroring the teacher's binaries
    // running their accept loops to completion rather than returning
    // immediately after spawning them.
    WAL_SERVICE_RUNTIME.block_on(async {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if signal_flags
                .shutdown_requested
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                tracing::info!("shutdown requested, exiting");
                break;
            }
        }
    });

    Ok(())
}

fn system_identifier() -> u64 {
    // A real primary derives this from its control file at initdb time;
    // this sender only reads WAL, so a process-local placeholder anchored
    // to the current time is sufficient for `IDENTIFY_SYSTEM` purposes.
    postgres_ffi::get_current_timestamp() as u64
}

async fn scan_flush_pointer_forever(wal_dir: camino::Utf8PathBuf, flush_pointer: FlushPointer) {
    loop {
        if let Ok(Some(lsn)) = scan_highest_flushed(&wal_dir).await {
            flush_pointer.advance(lsn);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Stand-in for the real flusher: picks the most recent WAL segment file
/// whose name sorts highest and treats its end as flushed. A real flusher
/// would instead track the exact flush position a `fsync` covers; this is
/// only precise to segment granularity; scanning should be replaced with
/// an external notification in any real deployment.
async fn scan_highest_flushed(wal_dir: &camino::Utf8Path) -> std::io::Result<Option<utils::lsn::Lsn>> {
    let mut entries = tokio::fs::read_dir(wal_dir).await?;
    let mut segnos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.len() == 24 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                let tli = &name[0..8];
                let hi = &name[8..16];
                let lo = &name[16..24];
                if let (Ok(_tli), Ok(hi), Ok(lo)) = (
                    u32::from_str_radix(tli, 16),
                    u64::from_str_radix(hi, 16),
                    u64::from_str_radix(lo, 16),
                ) {
                    let segments_per_xlog_id = 0x1_0000_0000u64 / postgres_ffi::WAL_SEGMENT_SIZE;
                    segnos.push(hi * segments_per_xlog_id + lo);
                }
            }
        }
    }
    segnos.sort_unstable();
    // The highest segment file may still be partway through being
    // written; treat only the one below it as durably complete.
    segnos.pop();
    Ok(segnos
        .pop()
        .map(|segno| postgres_ffi::segno_offset_to_lsn(segno + 1, 0, postgres_ffi::WAL_SEGMENT_SIZE)))
}
