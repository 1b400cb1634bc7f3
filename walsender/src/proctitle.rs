//! OS process title updates, gated behind `update_process_title`: each
//! successful send republishes the connection's state in the title so
//! `ps`/`top` show per-connection replication progress, mirroring
//! `SendBatch`'s final "update process title with the new position" step.
//!
//! Linux only (`prctl(PR_SET_NAME)` caps at 16 bytes, so the peer address
//! is abbreviated); a no-op everywhere else.

#[cfg(target_os = "linux")]
pub fn set(peer: std::net::SocketAddr, state: &str, sent_lsn: utils::lsn::Lsn) {
    use std::ffi::CString;

    let title = format!("wal snd: {peer} {state} {sent_lsn}");
    let truncated: String = title.chars().take(15).collect();
    let Ok(name) = CString::new(truncated) else {
        return;
    };
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set(_peer: std::net::SocketAddr, _state: &str, _sent_lsn: utils::lsn::Lsn) {}
