//! Ephemeral port allocation
//!
//! Best effort: another process may grab the port between release and use.

use std::net::{Ipv4Addr, TcpListener};

/// Bind `127.0.0.1:0`, read the assigned port and release it
pub fn pick_free_port() -> Option<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
    let port = listener.local_addr().ok()?.port();
    drop(listener);
    Some(port)
}
