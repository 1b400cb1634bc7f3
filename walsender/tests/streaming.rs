//! End-to-end exercise of the handshake -> `CopyBoth` -> streaming path
//! over a real loopback TCP socket, mirroring the shape of
//! `postgres_backend`'s own `simple_select` integration test.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use walsender::config::SenderConfig;
use walsender::flush::FlushPointer;
use walsender::lifecycle::{handle_connection, SenderServices};
use walsender::signals::SignalFlags;
use walsender::slot::SlotTable;
use walsender::wal_reader::RemovedWatermark;
use utils::lsn::Lsn;

async fn write_segment(dir: &camino::Utf8Path, segno: u64, content: &[u8]) {
    let name = postgres_ffi::xlog_file_name(postgres_ffi::PG_TLI, segno, postgres_ffi::WAL_SEGMENT_SIZE);
    let path = dir.join(name);
    let mut file = tokio::fs::File::create(&path).await.unwrap();
    let mut data = vec![0u8; postgres_ffi::WAL_SEGMENT_SIZE as usize];
    data[..content.len()].copy_from_slice(content);
    file.write_all(&data).await.unwrap();
    file.seek(SeekFrom::Start(0)).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> (u8, BytesMut) {
    let mut tag = [0u8; 1];
    stream.read_exact(&mut tag).await.unwrap();
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.unwrap();
    (tag[0], BytesMut::from(&body[..]))
}

fn write_query(buf: &mut BytesMut, text: &str) {
    buf.put_u8(b'Q');
    let mut body = text.as_bytes().to_vec();
    body.push(0);
    buf.put_u32((4 + body.len()) as u32);
    buf.put_slice(&body);
}

#[tokio::test]
async fn streams_wal_after_start_replication() {
    let dir = tempfile::tempdir().unwrap();
    let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
    let payload = b"hello from the wal sender integration test";
    write_segment(&wal_dir, 0, payload).await;

    let (flush_pointer, flush_rx) = FlushPointer::new(Lsn::INVALID);
    flush_pointer.advance(Lsn(payload.len() as u64));

    let config = SenderConfig {
        wal_dir: wal_dir.clone(),
        listen_replication: "127.0.0.1:0".parse().unwrap(),
        listen_http: "127.0.0.1:0".parse().unwrap(),
        max_wal_senders: 4,
        wal_sender_timeout: Duration::from_secs(30),
        update_process_title: false,
        wal_level: walsender::config::WalLevel::Replica,
        in_recovery: false,
        config_file: None,
    };

    let slot_table = SlotTable::new(4);
    let services = Arc::new(SenderServices {
        slot_table: Arc::clone(&slot_table),
        wal_dir,
        flush_rx,
        signals: SignalFlags::default(),
        shared_config: Arc::new(parking_lot::Mutex::new(config)),
        removed_watermark: RemovedWatermark::new(),
        system_id: 12345,
        timeline: postgres_ffi::PG_TLI,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        handle_connection(stream, peer, services).await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();

    let mut startup_body = BytesMut::new();
    startup_body.put_u32(pq_proto::PROTOCOL_VERSION_3);
    startup_body.put_slice(b"user\0replicator\0replication\0true\0\0");
    let mut framed = BytesMut::new();
    framed.put_u32((startup_body.len() + 4) as u32);
    framed.extend_from_slice(&startup_body);
    client.write_all(&framed).await.unwrap();

    // AuthenticationOk, ReadyForQuery
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'R');
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'Z');

    let mut query = BytesMut::new();
    write_query(&mut query, "START_REPLICATION PHYSICAL 0/0");
    client.write_all(&query).await.unwrap();

    // CopyBothResponse
    let (tag, _) = read_frame(&mut client).await;
    assert_eq!(tag, b'W');

    // XLogData
    let (tag, mut body) = read_frame(&mut client).await;
    assert_eq!(tag, b'd');
    let marker = body.get_u8();
    assert_eq!(marker, b'w');
    let wal_start = body.get_u64();
    let _wal_end = body.get_u64();
    let _timestamp = body.get_i64();
    let data = body.to_vec();
    assert_eq!(wal_start, 0);
    assert_eq!(&data[..payload.len()], payload);

    // end the stream from the client side
    let mut copy_done = BytesMut::new();
    copy_done.put_u8(b'c');
    copy_done.put_u32(4);
    client.write_all(&copy_done).await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server task should finish")
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(slot_table.get_all().len(), 0, "slot should be freed on disconnect");
}
