//! The flush pointer itself is published by the WAL writer/flusher, which
//! is out of scope for this crate (see module docs). This wraps the
//! `watch` channel a sender subscribes to in order to learn when more WAL
//! has become safe to send, mirroring the `commit_lsn_watch_tx/rx` pair a
//! timeline publishes through in the streaming-replication teacher this
//! crate is built from.

use tokio::sync::watch;
use utils::lsn::Lsn;

pub struct FlushPointer {
    tx: watch::Sender<Lsn>,
}

impl FlushPointer {
    pub fn new(initial: Lsn) -> (FlushPointer, watch::Receiver<Lsn>) {
        let (tx, rx) = watch::channel(initial);
        (FlushPointer { tx }, rx)
    }

    /// Advance the published flush pointer. A no-op if `new_flush` is not
    /// ahead of the current value: the pointer only ever moves forward.
    pub fn advance(&self, new_flush: Lsn) {
        self.tx.send_if_modified(|cur| {
            if new_flush > *cur {
                *cur = new_flush;
                true
            } else {
                false
            }
        });
    }

    pub fn get(&self) -> Lsn {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let (fp, rx) = FlushPointer::new(Lsn(10));
        fp.advance(Lsn(20));
        assert_eq!(*rx.borrow(), Lsn(20));
        fp.advance(Lsn(5));
        assert_eq!(*rx.borrow(), Lsn(20));
    }
}
