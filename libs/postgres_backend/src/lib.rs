//! A minimal driver for the front-end/back-end wire protocol: startup
//! handshake, simple-query framing, and the split read/write halves a
//! streaming loop needs to run concurrently with a feedback reader.

use std::io;

use bytes::{Bytes, BytesMut};
use pq_proto::{BeMessage, FeMessage, FeStartupPacket, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("connection closed by peer")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a copy-both stream ended, distinguishing "peer said goodbye
/// cleanly" from "the socket broke" so a caller can choose an exit code.
#[derive(thiserror::Error, Debug)]
pub enum CopyStreamHandlerEnd {
    #[error("terminated by client")]
    ClientTerminated,
    #[error("copy done")]
    CopyDone,
    #[error("shutdown requested")]
    ShutdownRequested,
    #[error("peer disconnected: {0}")]
    Disconnected(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct PostgresBackend<IO> {
    stream: IO,
    outbuf: BytesMut,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> PostgresBackend<IO> {
    pub fn new(stream: IO) -> Self {
        PostgresBackend {
            stream,
            outbuf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the startup packet and reply with a trust-auth handshake
    /// (`AuthenticationOk`, `ReadyForQuery`). Authentication methods other
    /// than trust are out of scope for a WAL sender reached over a
    /// loopback/unix-domain replication socket.
    pub async fn handshake(&mut self) -> Result<FeStartupPacket, QueryError> {
        let len = self.stream.read_u32().await? as usize;
        if len < 8 {
            return Err(ProtocolError::BadStartup.into());
        }
        let version = self.stream.read_u32().await?;
        let mut body = vec![0u8; len - 8];
        self.stream.read_exact(&mut body).await?;
        let pkt = pq_proto::parse_startup_params(version, &body)?;

        self.write_message_noflush(&BeMessage::AuthenticationOk)?;
        self.write_message_noflush(&BeMessage::ReadyForQuery)?;
        self.flush().await?;
        Ok(pkt)
    }

    pub fn write_message_noflush(&mut self, msg: &BeMessage<'_>) -> io::Result<&mut Self> {
        msg.write(&mut self.outbuf);
        Ok(self)
    }

    pub async fn write_message(&mut self, msg: &BeMessage<'_>) -> Result<(), QueryError> {
        self.write_message_noflush(msg)?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), QueryError> {
        if !self.outbuf.is_empty() {
            self.stream.write_all(&self.outbuf).await?;
            self.outbuf.clear();
        }
        Ok(())
    }

    /// Read one tagged message. Returns `None` on a clean EOF before any
    /// bytes of a new message arrived.
    pub async fn read_message(&mut self) -> Result<Option<FeMessage>, QueryError> {
        let mut tag_buf = [0u8; 1];
        match self.stream.read_exact(&mut tag_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = self.stream.read_u32().await? as usize;
        if len < 4 {
            return Err(ProtocolError::Short.into());
        }
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await?;
        let msg = FeMessage::parse(tag_buf[0], Bytes::from(body))?;
        Ok(Some(msg))
    }

    pub fn split(self) -> (PostgresBackendReader<IO>, PostgresBackendWriter<IO>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            PostgresBackendReader { stream: read_half },
            PostgresBackendWriter {
                stream: write_half,
                outbuf: self.outbuf,
            },
        )
    }

    pub fn unsplit(reader: PostgresBackendReader<IO>, writer: PostgresBackendWriter<IO>) -> Self {
        PostgresBackend {
            stream: reader.stream.unsplit(writer.stream),
            outbuf: writer.outbuf,
        }
    }
}

pub struct PostgresBackendReader<IO> {
    stream: ReadHalf<IO>,
}

impl<IO: AsyncRead + Unpin> PostgresBackendReader<IO> {
    pub async fn read_message(&mut self) -> Result<Option<FeMessage>, QueryError> {
        let mut tag_buf = [0u8; 1];
        match self.stream.read_exact(&mut tag_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = self.stream.read_u32().await? as usize;
        if len < 4 {
            return Err(ProtocolError::Short.into());
        }
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await?;
        let msg = FeMessage::parse(tag_buf[0], Bytes::from(body))?;
        Ok(Some(msg))
    }
}

pub struct PostgresBackendWriter<IO> {
    stream: WriteHalf<IO>,
    outbuf: BytesMut,
}

impl<IO: AsyncWrite + Unpin> PostgresBackendWriter<IO> {
    pub fn write_message_noflush(&mut self, msg: &BeMessage<'_>) -> io::Result<&mut Self> {
        msg.write(&mut self.outbuf);
        Ok(self)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.outbuf.is_empty() {
            self.stream.write_all(&self.outbuf).await?;
            self.outbuf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use pq_proto::RowDescriptor;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn handshake_then_query_row() {
        let (mut client, server) = make_tcp_pair().await;

        let server_task = tokio::spawn(async move {
            let mut pgb = PostgresBackend::new(server);
            let pkt = pgb.handshake().await.unwrap();
            assert_eq!(pkt.param("user"), Some("alice"));
            let msg = pgb.read_message().await.unwrap().unwrap();
            match msg {
                FeMessage::Query(q) => assert_eq!(q, "IDENTIFY_SYSTEM"),
                _ => panic!("expected query"),
            }
            pgb.write_message_noflush(&BeMessage::RowDescription(&[RowDescriptor::text_col(
                "systemid",
            )]))
            .unwrap();
            pgb.write_message_noflush(&BeMessage::DataRow(&[Some(b"123".as_slice())]))
                .unwrap();
            pgb.write_message(&BeMessage::CommandComplete(b"IDENTIFY_SYSTEM"))
                .await
                .unwrap();
        });

        // client side: hand-roll the startup packet and one query.
        let mut startup = BytesMut::new();
        startup.put_u32(pq_proto::PROTOCOL_VERSION_3);
        startup.put_slice(b"user\0alice\0\0");
        let mut framed = BytesMut::new();
        framed.put_u32((startup.len() + 4) as u32);
        framed.extend_from_slice(&startup);
        client.write_all(&framed).await.unwrap();

        let mut reply = [0u8; 1024];
        // AuthenticationOk + ReadyForQuery
        let n = client.read(&mut reply).await.unwrap();
        assert!(n > 0);

        let mut query = BytesMut::new();
        query.put_u8(b'Q');
        let body = b"IDENTIFY_SYSTEM\0";
        query.put_u32((4 + body.len()) as u32);
        query.put_slice(body);
        client.write_all(&query).await.unwrap();

        server_task.await.unwrap();
    }
}
