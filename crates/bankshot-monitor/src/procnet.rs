//! `/proc/net/tcp{,6}` parsing.
//!
//! The kernel reports sockets as hex `local_address:port` pairs with a hex
//! state column; addresses are little-endian per 32-bit word in both
//! families. Only `LISTEN` (0x0A) rows are of interest here.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::event::Protocol;

/// TCP state code for LISTEN in `/proc/net/tcp`.
const STATE_LISTEN: u8 = 0x0A;

/// A socket observed in LISTEN state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSocket {
    pub port: u16,
    pub protocol: Protocol,
    /// Decoded textual bind address, e.g. `"0.0.0.0"` or `"::1"`.
    pub bind_addr: String,
}

/// All listening sockets on the host, v4 and v6.
///
/// A missing or unreadable file (non-Linux, hidepid) contributes nothing
/// rather than failing the whole snapshot.
pub fn listening_sockets() -> Vec<ListenerSocket> {
    let mut sockets = Vec::new();
    if let Ok(contents) = std::fs::read_to_string("/proc/net/tcp") {
        sockets.extend(parse_proc_net(&contents, Protocol::Tcp));
    }
    if let Ok(contents) = std::fs::read_to_string("/proc/net/tcp6") {
        sockets.extend(parse_proc_net(&contents, Protocol::Tcp6));
    }
    sockets
}

/// Listening sockets as seen from one process's network namespace.
///
/// Falls back to the system-wide files when the per-PID files are
/// unreadable (process exited, or no such namespace separation).
pub fn process_listening_sockets(pid: u32) -> Vec<ListenerSocket> {
    let mut sockets = Vec::new();
    for (path, fallback, protocol) in [
        (
            format!("/proc/{}/net/tcp", pid),
            "/proc/net/tcp",
            Protocol::Tcp,
        ),
        (
            format!("/proc/{}/net/tcp6", pid),
            "/proc/net/tcp6",
            Protocol::Tcp6,
        ),
    ] {
        let contents = std::fs::read_to_string(&path)
            .or_else(|_| std::fs::read_to_string(fallback));
        if let Ok(contents) = contents {
            sockets.extend(parse_proc_net(&contents, protocol));
        }
    }
    sockets
}

/// The set of listening port numbers, collapsed across protocols.
pub fn listening_port_set() -> HashSet<u16> {
    listening_sockets().iter().map(|s| s.port).collect()
}

/// Parse one `/proc/net/tcp{,6}` report, keeping LISTEN rows only.
pub fn parse_proc_net(contents: &str, protocol: Protocol) -> Vec<ListenerSocket> {
    let mut sockets = Vec::new();

    // First line is the column header.
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let Some((addr_hex, port_hex)) = fields[1].split_once(':') else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(fields[3], 16) else {
            continue;
        };
        if state != STATE_LISTEN {
            continue;
        }
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Some(bind_addr) = decode_hex_addr(addr_hex, protocol) else {
            continue;
        };

        sockets.push(ListenerSocket {
            port,
            protocol,
            bind_addr,
        });
    }

    sockets
}

/// Decode a hex-encoded kernel socket address.
///
/// IPv4: 8 hex chars, one little-endian 32-bit word.
/// IPv6: 32 hex chars, four little-endian 32-bit words.
pub fn decode_hex_addr(hex: &str, protocol: Protocol) -> Option<String> {
    let bytes = decode_hex(hex)?;
    match (protocol, bytes.len()) {
        (Protocol::Tcp, 4) => {
            let addr = Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]);
            Some(addr.to_string())
        }
        (Protocol::Tcp6, 16) => {
            let mut octets = [0u8; 16];
            for (word, chunk) in bytes.chunks_exact(4).enumerate() {
                let off = word * 4;
                octets[off] = chunk[3];
                octets[off + 1] = chunk[2];
                octets[off + 2] = chunk[1];
                octets[off + 3] = chunk[0];
            }
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Encode an address into the kernel's hex form, the inverse of
/// [`decode_hex_addr`].
pub fn encode_hex_addr(addr: &std::net::IpAddr) -> String {
    match addr {
        std::net::IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{:02X}{:02X}{:02X}{:02X}", o[3], o[2], o[1], o[0])
        }
        std::net::IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut out = String::with_capacity(32);
            for word in 0..4 {
                let off = word * 4;
                out.push_str(&format!(
                    "{:02X}{:02X}{:02X}{:02X}",
                    o[off + 3],
                    o[off + 2],
                    o[off + 1],
                    o[off]
                ));
            }
            out
        }
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    const TCP_FIXTURE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 100 0 0 10 0
   2: 0100007F:0016 0100007F:8AE6 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 100 0 0 10 0
";

    const TCP6_FIXTURE: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F91 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22345 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000001000000:1F92 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22346 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_listen_rows_only() {
        let sockets = parse_proc_net(TCP_FIXTURE, Protocol::Tcp);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].port, 0x1F90);
        assert_eq!(sockets[0].bind_addr, "0.0.0.0");
        assert_eq!(sockets[1].port, 3000);
        assert_eq!(sockets[1].bind_addr, "127.0.0.1");
    }

    #[test]
    fn parses_tcp6_addresses() {
        let sockets = parse_proc_net(TCP6_FIXTURE, Protocol::Tcp6);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].bind_addr, "::");
        assert_eq!(sockets[1].bind_addr, "::1");
    }

    #[test]
    fn ipv4_decode_known_values() {
        // 0100007F is 127.0.0.1 stored little-endian.
        assert_eq!(
            decode_hex_addr("0100007F", Protocol::Tcp).unwrap(),
            "127.0.0.1"
        );
        assert_eq!(
            decode_hex_addr("00000000", Protocol::Tcp).unwrap(),
            "0.0.0.0"
        );
        assert_eq!(
            decode_hex_addr("0101A8C0", Protocol::Tcp).unwrap(),
            "192.168.1.1"
        );
    }

    #[test]
    fn ipv6_decode_known_values() {
        assert_eq!(
            decode_hex_addr("00000000000000000000000001000000", Protocol::Tcp6).unwrap(),
            "::1"
        );
        assert_eq!(
            decode_hex_addr("00000000000000000000000000000000", Protocol::Tcp6).unwrap(),
            "::"
        );
    }

    #[test]
    fn decode_rejects_wrong_lengths() {
        assert!(decode_hex_addr("0100007F", Protocol::Tcp6).is_none());
        assert!(decode_hex_addr("00", Protocol::Tcp).is_none());
        assert!(decode_hex_addr("zzzzzzzz", Protocol::Tcp).is_none());
    }

    #[test]
    fn hex_addr_round_trips_v4() {
        for addr in ["0.0.0.0", "127.0.0.1", "10.1.2.3", "255.255.255.255"] {
            let ip: IpAddr = addr.parse().unwrap();
            let hex = encode_hex_addr(&ip);
            assert_eq!(decode_hex_addr(&hex, Protocol::Tcp).unwrap(), addr);
        }
    }

    #[test]
    fn hex_addr_round_trips_v6() {
        for addr in ["::", "::1", "fe80::1", "2001:db8::8a2e:370:7334"] {
            let ip: IpAddr = addr.parse().unwrap();
            let hex = encode_hex_addr(&ip);
            assert_eq!(decode_hex_addr(&hex, Protocol::Tcp6).unwrap(), addr);
        }
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let fixture = "header\ngarbage line\n   0: nonsense 0A\n";
        assert!(parse_proc_net(fixture, Protocol::Tcp).is_empty());
    }
}
