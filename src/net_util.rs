//! Small networking helpers shared by both server roles.

use std::net::UdpSocket;

use tracing::debug;

/// Discovers the address this host would use to reach the wider network.
///
/// Connects a UDP socket to a public address and reads the local socket
/// name; no packet is sent. The result is only meaningful on a LAN;
/// deployments behind NAT or inside containers should configure
/// `advertise_ip` instead.
pub fn discover_advertise_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    debug!("discovered local address {}", addr.ip());
    Some(addr.ip().to_string())
}
