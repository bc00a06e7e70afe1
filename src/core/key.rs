//! Canonical flow keys
//!
//! A flow key is the direction-normalized 5-tuple, stored in wire order:
//! `srcIP ∥ dstIP ∥ proto ∥ srcPort ∥ dstPort`, 13 bytes for IPv4 and
//! 37 bytes for IPv6. Normalization orders the address pair byte-wise so
//! that both directions of a conversation map to the same key; the forward
//! bit records which half a physical packet belongs to.
//!
//! ICMP-family protocols never swap ports: their port bytes are zero and
//! the address swap alone keeps both directions on one key.

use std::net::IpAddr;

use super::packet::{IpProtocol, PacketMeta};

/// Encoded key length for IPv4 flows
pub const FLOW_KEY_V4_LEN: usize = 13;
/// Encoded key length for IPv6 flows
pub const FLOW_KEY_V6_LEN: usize = 37;

/// Direction-normalized 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKey {
    V4([u8; FLOW_KEY_V4_LEN]),
    V6([u8; FLOW_KEY_V6_LEN]),
}

impl FlowKey {
    /// Encoded wire-order bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FlowKey::V4(b) => b,
            FlowKey::V6(b) => b,
        }
    }

    /// Decode a key from its wire encoding
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            FLOW_KEY_V4_LEN => {
                let mut b = [0u8; FLOW_KEY_V4_LEN];
                b.copy_from_slice(bytes);
                Some(FlowKey::V4(b))
            }
            FLOW_KEY_V6_LEN => {
                let mut b = [0u8; FLOW_KEY_V6_LEN];
                b.copy_from_slice(bytes);
                Some(FlowKey::V6(b))
            }
            _ => None,
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        match self {
            FlowKey::V4(b) => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&b[0..4]);
                IpAddr::from(ip)
            }
            FlowKey::V6(b) => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&b[0..16]);
                IpAddr::from(ip)
            }
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            FlowKey::V4(b) => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&b[4..8]);
                IpAddr::from(ip)
            }
            FlowKey::V6(b) => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&b[16..32]);
                IpAddr::from(ip)
            }
        }
    }

    /// IANA protocol byte (zero for unknown transports)
    pub fn proto(&self) -> u8 {
        match self {
            FlowKey::V4(b) => b[8],
            FlowKey::V6(b) => b[32],
        }
    }

    pub fn src_port(&self) -> u16 {
        match self {
            FlowKey::V4(b) => u16::from_be_bytes([b[9], b[10]]),
            FlowKey::V6(b) => u16::from_be_bytes([b[33], b[34]]),
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self {
            FlowKey::V4(b) => u16::from_be_bytes([b[11], b[12]]),
            FlowKey::V6(b) => u16::from_be_bytes([b[35], b[36]]),
        }
    }

    /// FNV-1a hash of the encoded key, used for shard routing so that both
    /// directions of a flow land on the same worker.
    pub fn hash64(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = FNV_OFFSET;
        for &byte in self.as_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip(),
            self.src_port(),
            self.dst_ip(),
            self.dst_port(),
            IpProtocol::from(self.proto()),
        )
    }
}

/// Protocol byte as encoded in the key: IANA numbers for the transports the
/// decoder accepts, zero for anything else.
fn key_proto_byte(proto: IpProtocol) -> u8 {
    match proto {
        IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Icmp | IpProtocol::Icmpv6 => {
            proto.number()
        }
        IpProtocol::Other(_) => 0,
    }
}

/// Build the canonical 5-tuple key for a decoded packet.
///
/// Returns the key and the forward bit: `true` iff the packet's raw
/// (src, dst) matches the canonical orientation. Mixed address families
/// yield `None`.
pub fn five_tuple(meta: &PacketMeta) -> Option<(FlowKey, bool)> {
    let swap_ports = !meta.protocol.is_ip_control();
    let proto = key_proto_byte(meta.protocol);
    match (meta.src_ip, meta.dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let (mut src, mut dst) = (src.octets(), dst.octets());
            let (mut sp, mut dp) = (meta.src_port, meta.dst_port);
            let mut forward = true;
            if dst < src {
                forward = false;
                std::mem::swap(&mut src, &mut dst);
                if swap_ports {
                    std::mem::swap(&mut sp, &mut dp);
                }
            } else if dst == src && sp < dp {
                forward = false;
                if swap_ports {
                    std::mem::swap(&mut sp, &mut dp);
                }
            }
            let mut key = [0u8; FLOW_KEY_V4_LEN];
            key[0..4].copy_from_slice(&src);
            key[4..8].copy_from_slice(&dst);
            key[8] = proto;
            key[9..11].copy_from_slice(&sp.to_be_bytes());
            key[11..13].copy_from_slice(&dp.to_be_bytes());
            Some((FlowKey::V4(key), forward))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let (mut src, mut dst) = (src.octets(), dst.octets());
            let (mut sp, mut dp) = (meta.src_port, meta.dst_port);
            let mut forward = true;
            if dst < src {
                forward = false;
                std::mem::swap(&mut src, &mut dst);
                if swap_ports {
                    std::mem::swap(&mut sp, &mut dp);
                }
            } else if dst == src && sp < dp {
                forward = false;
                if swap_ports {
                    std::mem::swap(&mut sp, &mut dp);
                }
            }
            let mut key = [0u8; FLOW_KEY_V6_LEN];
            key[0..16].copy_from_slice(&src);
            key[16..32].copy_from_slice(&dst);
            key[32] = proto;
            key[33..35].copy_from_slice(&sp.to_be_bytes());
            key[35..37].copy_from_slice(&dp.to_be_bytes());
            Some((FlowKey::V6(key), forward))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn meta(
        src: IpAddr,
        sp: u16,
        dst: IpAddr,
        dp: u16,
        protocol: IpProtocol,
    ) -> PacketMeta {
        PacketMeta {
            src_ip: src,
            dst_ip: dst,
            protocol,
            src_port: sp,
            dst_port: dp,
            tcp_flags: None,
            icmp_type: None,
            icmp_code: None,
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_v4_key_layout() {
        let m = meta(v4(1, 2, 3, 4), 1000, v4(5, 6, 7, 8), 53, IpProtocol::Udp);
        let (key, forward) = five_tuple(&m).unwrap();
        assert!(forward);
        assert_eq!(
            key.as_bytes(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 17, 0x03, 0xe8, 0x00, 0x35]
        );
        assert_eq!(key.src_ip(), v4(1, 2, 3, 4));
        assert_eq!(key.dst_ip(), v4(5, 6, 7, 8));
        assert_eq!(key.proto(), 17);
        assert_eq!(key.src_port(), 1000);
        assert_eq!(key.dst_port(), 53);
    }

    #[test]
    fn test_normalization_swaps_addresses_and_ports() {
        // 9.0.0.1:1000 -> 1.0.0.1:2000 normalizes to 1.0.0.1:2000 -> 9.0.0.1:1000
        let m = meta(v4(9, 0, 0, 1), 1000, v4(1, 0, 0, 1), 2000, IpProtocol::Udp);
        let (key, forward) = five_tuple(&m).unwrap();
        assert!(!forward);
        assert_eq!(key.src_ip(), v4(1, 0, 0, 1));
        assert_eq!(key.src_port(), 2000);
        assert_eq!(key.dst_ip(), v4(9, 0, 0, 1));
        assert_eq!(key.dst_port(), 1000);

        let back = meta(v4(1, 0, 0, 1), 2000, v4(9, 0, 0, 1), 1000, IpProtocol::Udp);
        let (key2, forward2) = five_tuple(&back).unwrap();
        assert!(forward2);
        assert_eq!(key, key2);
    }

    #[test]
    fn test_equal_addresses_order_by_port() {
        let a = v4(10, 0, 0, 1);
        let m = meta(a, 100, a, 200, IpProtocol::Tcp);
        let (key, forward) = five_tuple(&m).unwrap();
        assert!(!forward);
        assert_eq!(key.src_port(), 200);
        assert_eq!(key.dst_port(), 100);

        let rev = meta(a, 200, a, 100, IpProtocol::Tcp);
        let (key2, forward2) = five_tuple(&rev).unwrap();
        assert!(forward2);
        assert_eq!(key, key2);
    }

    #[test]
    fn test_icmp_does_not_swap_ports() {
        // ICMP port bytes stay put when the address pair is swapped, so a
        // request/reply exchange maps to one key.
        let m = meta(v4(9, 0, 0, 1), 0, v4(1, 0, 0, 1), 0, IpProtocol::Icmp);
        let (key, forward) = five_tuple(&m).unwrap();
        assert!(!forward);
        assert_eq!(key.src_ip(), v4(1, 0, 0, 1));
        assert_eq!(key.src_port(), 0);
        assert_eq!(key.dst_port(), 0);

        let rev = meta(v4(1, 0, 0, 1), 0, v4(9, 0, 0, 1), 0, IpProtocol::Icmp);
        let (key2, forward2) = five_tuple(&rev).unwrap();
        assert!(forward2);
        assert_eq!(key, key2);
    }

    #[test]
    fn test_v6_key_roundtrip() {
        let src = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let dst = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2));
        let m = meta(src, 443, dst, 50000, IpProtocol::Tcp);
        let (key, _) = five_tuple(&m).unwrap();
        assert_eq!(key.as_bytes().len(), FLOW_KEY_V6_LEN);
        let decoded = FlowKey::from_bytes(key.as_bytes()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.proto(), 6);
    }

    #[test]
    fn test_mixed_families_rejected() {
        let src = v4(1, 2, 3, 4);
        let dst = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(five_tuple(&meta(src, 1, dst, 2, IpProtocol::Udp)).is_none());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(FlowKey::from_bytes(&[0u8; 12]).is_none());
        assert!(FlowKey::from_bytes(&[0u8; 38]).is_none());
    }

    #[test]
    fn test_unknown_transport_encodes_zero() {
        let m = meta(v4(1, 1, 1, 1), 5, v4(2, 2, 2, 2), 6, IpProtocol::Other(132));
        let (key, _) = five_tuple(&m).unwrap();
        assert_eq!(key.proto(), 0);
    }

    #[test]
    fn test_reversed_tuples_share_key_randomized() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let src = v4(rng.gen(), rng.gen(), rng.gen(), rng.gen());
            let dst = v4(rng.gen(), rng.gen(), rng.gen(), rng.gen());
            let sp: u16 = rng.gen();
            let dp: u16 = rng.gen();
            let proto = if rng.gen_bool(0.5) {
                IpProtocol::Tcp
            } else {
                IpProtocol::Udp
            };
            let (k1, f1) = five_tuple(&meta(src, sp, dst, dp, proto)).unwrap();
            let (k2, f2) = five_tuple(&meta(dst, dp, src, sp, proto)).unwrap();
            assert_eq!(k1, k2);
            if src != dst || sp != dp {
                assert_ne!(f1, f2);
            }
            assert_eq!(k1.hash64(), k2.hash64());
            assert_eq!(FlowKey::from_bytes(k1.as_bytes()).unwrap(), k1);
        }
    }
}
