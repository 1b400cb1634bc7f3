//! Recognizes the three replication commands this sender accepts over the
//! simple-query sub-protocol and drives the pre-streaming request/response
//! exchange. `IDENTIFY_SYSTEM` is answered and the connection stays in the
//! simple-query state; `BASE_BACKUP` is dispatched to the external
//! base-backup component (out of scope here, see module docs) and also
//! keeps the connection in the simple-query state; `START_REPLICATION`
//! ends the handshake and hands control to the streaming loop, after
//! checking that this primary's `wal_level` is sufficient; anything else is
//! fatal.

use postgres_backend::{PostgresBackend, QueryError};
use pq_proto::{BeMessage, FeMessage, RowDescriptor};
use tokio::io::{AsyncRead, AsyncWrite};
use utils::lsn::Lsn;

use crate::config::WalLevel;
use crate::errors::SenderError;

pub struct SystemIdentity {
    pub system_id: u64,
    pub timeline: u32,
}

pub enum ReplicationCommand {
    StartReplication {
        start_lsn: Lsn,
        timeline: Option<u32>,
    },
}

/// Drive the handshake to completion, answering `IDENTIFY_SYSTEM` and
/// `BASE_BACKUP` queries inline and returning once a `START_REPLICATION`
/// command arrives. `START_REPLICATION` is refused fatally if `wal_level`
/// is below `WalLevel::Replica`.
pub async fn run<IO: AsyncRead + AsyncWrite + Unpin>(
    pgb: &mut PostgresBackend<IO>,
    identity: impl Fn() -> SystemIdentity,
    wal_level: WalLevel,
) -> Result<ReplicationCommand, SenderError> {
    loop {
        let msg = pgb.read_message().await?;
        let query = match msg {
            Some(FeMessage::Query(q)) => q,
            Some(FeMessage::Terminate) => return Err(SenderError::PeerClosed),
            Some(_) => {
                return Err(SenderError::ProtocolViolation(
                    "expected a simple query during handshake".into(),
                ))
            }
            None => return Err(SenderError::PeerClosed),
        };

        match parse_command(&query)? {
            ParsedCommand::IdentifySystem => {
                let id = identity();
                send_identify_system(pgb, &id).await?;
            }
            ParsedCommand::StartReplication { start_lsn, timeline } => {
                if wal_level < WalLevel::Replica {
                    return Err(SenderError::WrongWalLevel);
                }
                return Ok(ReplicationCommand::StartReplication { start_lsn, timeline });
            }
            ParsedCommand::BaseBackup => {
                run_base_backup(pgb).await?;
            }
        }
    }
}

/// Dispatch `BASE_BACKUP` to the external base-backup component. Streaming
/// the backup itself is that component's job; this sender's part is just
/// acknowledging the command and returning to the handshake loop.
async fn run_base_backup<IO: AsyncRead + AsyncWrite + Unpin>(
    pgb: &mut PostgresBackend<IO>,
) -> Result<(), QueryError> {
    pgb.write_message_noflush(&BeMessage::CommandComplete(b"BASE_BACKUP"))?;
    pgb.write_message(&BeMessage::ReadyForQuery).await
}

async fn send_identify_system<IO: AsyncRead + AsyncWrite + Unpin>(
    pgb: &mut PostgresBackend<IO>,
    id: &SystemIdentity,
) -> Result<(), QueryError> {
    let system_id = id.system_id.to_string();
    let timeline = id.timeline.to_string();

    pgb.write_message_noflush(&BeMessage::RowDescription(&[
        RowDescriptor::text_col("systemid"),
        RowDescriptor::text_col("timeline"),
    ]))?;
    pgb.write_message_noflush(&BeMessage::DataRow(&[
        Some(system_id.as_bytes()),
        Some(timeline.as_bytes()),
    ]))?;
    pgb.write_message_noflush(&BeMessage::CommandComplete(b"SELECT"))?;
    pgb.write_message(&BeMessage::ReadyForQuery).await
}

enum ParsedCommand {
    IdentifySystem,
    StartReplication { start_lsn: Lsn, timeline: Option<u32> },
    BaseBackup,
}

fn parse_command(query: &str) -> Result<ParsedCommand, SenderError> {
    let query = query.trim();
    let upper = query.to_ascii_uppercase();

    if upper == "IDENTIFY_SYSTEM" {
        return Ok(ParsedCommand::IdentifySystem);
    }
    if upper.starts_with("BASE_BACKUP") {
        return Ok(ParsedCommand::BaseBackup);
    }
    if let Some(rest) = upper.strip_prefix("START_REPLICATION") {
        // Expect: START_REPLICATION [PHYSICAL] <lsn> [TIMELINE <n>]
        let rest = rest.trim().strip_prefix("PHYSICAL").unwrap_or(rest.trim()).trim();
        let mut parts = rest.split_whitespace();
        let lsn_tok = parts
            .next()
            .ok_or_else(|| SenderError::ProtocolViolation("START_REPLICATION missing LSN".into()))?;
        let start_lsn: Lsn = lsn_tok
            .parse()
            .map_err(|_| SenderError::ProtocolViolation(format!("bad LSN {lsn_tok:?}")))?;

        let timeline = match parts.next() {
            Some("TIMELINE") => {
                let n = parts
                    .next()
                    .ok_or_else(|| SenderError::ProtocolViolation("TIMELINE missing id".into()))?;
                Some(
                    n.parse::<u32>()
                        .map_err(|_| SenderError::ProtocolViolation(format!("bad timeline {n:?}")))?,
                )
            }
            Some(_) | None => None,
        };
        return Ok(ParsedCommand::StartReplication { start_lsn, timeline });
    }

    Err(SenderError::ProtocolViolation(format!(
        "unrecognized command {query:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identify_system() {
        assert!(matches!(
            parse_command("IDENTIFY_SYSTEM").unwrap(),
            ParsedCommand::IdentifySystem
        ));
    }

    #[test]
    fn parses_start_replication_with_timeline() {
        match parse_command("START_REPLICATION PHYSICAL 0/16B3E50 TIMELINE 7").unwrap() {
            ParsedCommand::StartReplication { start_lsn, timeline } => {
                assert_eq!(start_lsn, Lsn(0x16B3E50));
                assert_eq!(timeline, Some(7));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_command("DROP TABLE foo").is_err());
    }

    #[test]
    fn base_backup_is_recognized() {
        assert!(matches!(
            parse_command("BASE_BACKUP LABEL 'x'").unwrap(),
            ParsedCommand::BaseBackup
        ));
    }
}
