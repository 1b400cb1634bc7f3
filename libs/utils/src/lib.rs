//! Small cross-cutting helpers shared by the WAL sender and its supporting
//! crates: LSN arithmetic and the latch wake primitive.

pub mod latch;
pub mod lsn;

pub use lsn::Lsn;
