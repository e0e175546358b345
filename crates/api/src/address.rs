//! Endpoint identity and derived transport strings.
//!
//! An endpoint is a 32-bit IPv4 address plus a 16-bit local number, packed
//! into a single u64 serial (`local << 32 | ipv4`). Each endpoint derives
//! three transport addresses (request, publish, pull), each with an
//! in-process variant used between same-host peers in the local range and a
//! TCP variant used everywhere else.

use crate::{ElgaError, ElgaResult};

/// The three conceptual sockets an endpoint exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// The reply socket, answering requests.
    Request,
    /// The publish socket, broadcasting to subscribers.
    Publish,
    /// The pull socket, receiving fire-and-forget pushes.
    Pull,
}

/// TCP port layout for an ElGA cluster.
///
/// Every endpoint with local number `n` binds its request socket at
/// `start_port + n`, its publish socket at that plus `pub_offset`, and its
/// pull socket at that plus `pull_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    /// Base TCP port for request sockets.
    pub start_port: u16,
    /// Offset from the request port to the publish port.
    pub pub_offset: u16,
    /// Offset from the request port to the pull port.
    pub pull_offset: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            start_port: 17200,
            pub_offset: 1000,
            pull_offset: 2000,
        }
    }
}

/// An endpoint address: IPv4 plus local number.
///
/// The zero address (IPv4 0.0.0.0) is valid and means "unbound"; clients
/// and streamers use it since they only make outbound connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    ip: u32,
    local: u16,
}

impl Address {
    /// Create an address from a dotted IPv4 string and a local number.
    ///
    /// The parser accepts the classic `inet_aton` forms: one to four
    /// dot-separated components, each decimal, octal (leading `0`), or hex
    /// (leading `0x`), with a short final component filling the remaining
    /// low bytes. `"10.0xff"` is the address `10.0.0.255`.
    pub fn parse(addr: &str, local: u16) -> ElgaResult<Self> {
        let parts: Vec<&str> = addr.split('.').collect();
        if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(ElgaError::arg(format!("unable to parse IP address: {addr}")));
        }

        let mut vals = Vec::with_capacity(parts.len());
        for p in &parts {
            let v = if let Some(hex) = p.strip_prefix("0x").or_else(|| p.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16)
            } else if p.len() > 1 && p.starts_with('0') {
                u32::from_str_radix(p, 8)
            } else {
                p.parse::<u32>()
            }
            .map_err(|_| ElgaError::arg(format!("unable to parse IP address: {addr}")))?;
            vals.push(v);
        }

        // The final component fills all remaining bytes.
        let fill_bytes = 4 - (vals.len() - 1);
        let last = *vals.last().expect("nonempty");
        if fill_bytes < 4 && last >= 1u32 << (8 * fill_bytes) {
            return Err(ElgaError::arg(format!("unable to parse IP address: {addr}")));
        }
        let mut octets = [0u8; 4];
        for (i, v) in vals[..vals.len() - 1].iter().enumerate() {
            if *v > 0xff {
                return Err(ElgaError::arg(format!("unable to parse IP address: {addr}")));
            }
            octets[i] = *v as u8;
        }
        let last_bytes = last.to_be_bytes();
        octets[4 - fill_bytes..].copy_from_slice(&last_bytes[4 - fill_bytes..]);

        Ok(Self {
            ip: u32::from_le_bytes(octets),
            local,
        })
    }

    /// Create an address from its packed serial.
    pub fn from_serial(serial: u64) -> Self {
        Self {
            ip: serial as u32,
            local: (serial >> 32) as u16,
        }
    }

    /// Return the packed serial (`local << 32 | ipv4`).
    pub fn serial(&self) -> u64 {
        ((self.local as u64) << 32) | self.ip as u64
    }

    /// Return the raw IPv4 value.
    pub fn ip(&self) -> u32 {
        self.ip
    }

    /// Return the local number.
    pub fn local(&self) -> u16 {
        self.local
    }

    /// An address is zero iff its IPv4 part is zero.
    pub fn is_zero(&self) -> bool {
        self.ip == 0
    }

    /// Return the IPv4 octets in display order.
    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_le_bytes()
    }

    fn port(&self, kind: SocketKind, layout: &PortLayout) -> u16 {
        let base = layout.start_port.wrapping_add(self.local);
        match kind {
            SocketKind::Request => base,
            SocketKind::Publish => base.wrapping_add(layout.pub_offset),
            SocketKind::Pull => base.wrapping_add(layout.pull_offset),
        }
    }

    fn local_slot(&self, kind: SocketKind, layout: &PortLayout) -> u32 {
        let n = self.local as u32;
        match kind {
            SocketKind::Request => n,
            SocketKind::Publish => n + layout.pub_offset as u32,
            SocketKind::Pull => n + layout.pull_offset as u32,
        }
    }

    /// The TCP transport string for one of this endpoint's sockets.
    pub fn remote_str(&self, kind: SocketKind, layout: &PortLayout) -> String {
        let o = self.octets();
        format!(
            "tcp://{}.{}.{}.{}:{}",
            o[0],
            o[1],
            o[2],
            o[3],
            self.port(kind, layout)
        )
    }

    /// The in-process transport string for one of this endpoint's sockets.
    pub fn local_str(&self, kind: SocketKind, layout: &PortLayout) -> String {
        format!("inproc://{}", self.local_slot(kind, layout))
    }

    /// Whether `self` is reachable in-process from `myself`: same host and
    /// a local number inside the process's local range.
    pub fn is_in_process(&self, myself: &Address, local_base: u16, local_max: u16) -> bool {
        self.ip == myself.ip && self.local >= local_base && self.local < local_max
    }

    /// The best connection string for reaching this endpoint from `myself`.
    pub fn conn_str(
        &self,
        myself: &Address,
        local_base: u16,
        local_max: u16,
        kind: SocketKind,
        layout: &PortLayout,
    ) -> String {
        if self.is_in_process(myself, local_base, local_max) {
            self.local_str(kind, layout)
        } else {
            self.remote_str(kind, layout)
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.octets();
        write!(f, "{}.{}.{}.{}/{}", o[0], o[1], o[2], o[3], self.local)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LAYOUT: PortLayout = PortLayout {
        start_port: 17200,
        pub_offset: 1000,
        pull_offset: 2000,
    };

    #[test]
    fn parse_dotted_quad() {
        let a = Address::parse("1.2.3.4", 15).unwrap();
        assert_eq!([1, 2, 3, 4], a.octets());
        assert_eq!("tcp://1.2.3.4:17215", a.remote_str(SocketKind::Request, &LAYOUT));
        assert_eq!("inproc://15", a.local_str(SocketKind::Request, &LAYOUT));
    }

    #[test]
    fn parse_short_forms() {
        let a = Address::parse("10.0xff", 0).unwrap();
        assert_eq!([10, 0, 0, 255], a.octets());

        let a = Address::parse("127.1", 0).unwrap();
        assert_eq!([127, 0, 0, 1], a.octets());

        let a = Address::parse("0x7f000001", 0).unwrap();
        assert_eq!([127, 0, 0, 1], a.octets());

        let a = Address::parse("10.011.1", 0).unwrap();
        assert_eq!([10, 9, 0, 1], a.octets());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Address::parse("", 0).is_err());
        assert!(Address::parse("1.2.3.4.5", 0).is_err());
        assert!(Address::parse("256.1.1.1", 0).is_err());
        assert!(Address::parse("1.2.3.999", 0).is_err());
        assert!(Address::parse("bark", 0).is_err());
    }

    #[test]
    fn serial_round_trip() {
        let a = Address::parse("192.168.0.7", 42).unwrap();
        let b = Address::from_serial(a.serial());
        assert_eq!(a, b);
        assert_eq!(42, b.local());
    }

    #[test]
    fn zero_address() {
        assert!(Address::default().is_zero());
        assert!(Address::parse("0.0.0.0", 3).unwrap().is_zero());
        assert!(!Address::parse("127.0.0.1", 0).unwrap().is_zero());
    }

    #[test]
    fn pub_and_pull_ports() {
        let a = Address::parse("1.2.3.4", 15).unwrap();
        assert_eq!("tcp://1.2.3.4:18215", a.remote_str(SocketKind::Publish, &LAYOUT));
        assert_eq!("tcp://1.2.3.4:19215", a.remote_str(SocketKind::Pull, &LAYOUT));
        assert_eq!("inproc://1015", a.local_str(SocketKind::Publish, &LAYOUT));
        assert_eq!("inproc://2015", a.local_str(SocketKind::Pull, &LAYOUT));
    }

    #[test]
    fn in_process_resolution() {
        let me = Address::parse("10.0.0.1", 2).unwrap();
        let same_host = Address::parse("10.0.0.1", 5).unwrap();
        let other_host = Address::parse("10.0.0.2", 5).unwrap();

        assert_eq!(
            "inproc://5",
            same_host.conn_str(&me, 0, 8, SocketKind::Request, &LAYOUT)
        );
        // Same host but outside the local range goes over TCP.
        assert_eq!(
            "tcp://10.0.0.1:17205",
            same_host.conn_str(&me, 0, 4, SocketKind::Request, &LAYOUT)
        );
        assert_eq!(
            "tcp://10.0.0.2:17205",
            other_host.conn_str(&me, 0, 8, SocketKind::Request, &LAYOUT)
        );
    }
}
