//! The 4-tuple identifying the protected stream, and its ingress-side mask.

use std::net::Ipv4Addr;

/// Flow key as reported by the client: `src` is the client's own socket,
/// `dst` is the remote peer it is streaming from.
///
/// `TcEngine` reinterprets this from the remote sender's point of view when
/// installing ingress rules - source and destination swap, since packets we
/// see on ingress were sent *by* the remote peer *to* the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowKey {
    pub src_ip: u32,
    pub src_port: u16,
    pub dst_ip: u32,
    pub dst_port: u16,
}

impl FlowKey {
    pub const ANY: FlowKey = FlowKey {
        src_ip: 0,
        src_port: 0,
        dst_ip: 0,
        dst_port: 0,
    };

    /// Parse a dotted-quad or empty string ("any") into a network-order u32.
    pub fn parse_ip(s: &str) -> Option<u32> {
        if s.is_empty() {
            return Some(0);
        }
        s.parse::<Ipv4Addr>().ok().map(|ip| u32::from(ip))
    }

    /// Mask for this field: all-ones unless the field is the "any" sentinel.
    pub fn ip_mask(ip: u32) -> u32 {
        if ip == 0 { 0 } else { 0xffff_ffff }
    }

    pub fn port_mask(port: u16) -> u16 {
        if port == 0 { 0 } else { 0xffff }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_ip_has_zero_mask() {
        assert_eq!(FlowKey::ip_mask(0), 0);
        assert_eq!(FlowKey::ip_mask(0x0100_007f), 0xffff_ffff);
    }

    #[test]
    fn any_port_has_zero_mask() {
        assert_eq!(FlowKey::port_mask(0), 0);
        assert_eq!(FlowKey::port_mask(80), 0xffff);
    }

    #[test]
    fn parse_ip_empty_is_any() {
        assert_eq!(FlowKey::parse_ip(""), Some(0));
    }

    #[test]
    fn parse_ip_dotted_quad() {
        let parsed = FlowKey::parse_ip("1.2.3.4").unwrap();
        assert_eq!(parsed, u32::from(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn parse_ip_rejects_garbage() {
        assert_eq!(FlowKey::parse_ip("not-an-ip"), None);
    }
}
