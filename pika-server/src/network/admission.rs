use std::net::IpAddr;

/// Connection ceilings applied on the client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Soft ceiling for remote peers.
    pub maxconnection: usize,
    /// Extra slots reserved for the node's own address.
    pub root_connection_num: usize,
}

/// Decides whether one more client may be accepted.
///
/// `own_addrs` holds the addresses that count as this node besides loopback: the accepted
/// socket's local IP and the configured server IP.
#[must_use]
pub fn admit(current: usize, limits: AdmissionLimits, peer: IpAddr, own_addrs: &[IpAddr]) -> bool {
    if current >= limits.maxconnection.saturating_add(limits.root_connection_num) {
        return false;
    }
    if current >= limits.maxconnection {
        return peer.is_loopback() || own_addrs.contains(&peer);
    }
    true
}
