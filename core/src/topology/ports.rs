use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a currently free TCP port by binding to port zero.
///
/// The listener is dropped before returning, so the port is only a strong
/// hint; generation allocates all ports in one pass to keep the race window
/// small.
pub(crate) fn free_port() -> Option<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}
