use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// An IPv4 or IPv6 address with an optional port.
///
/// The null address (no family) is distinct from the zero address of either
/// family. Comparison orders null first, then IPv4, then IPv6, each by
/// address bytes and finally by port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SockAddr {
    ip: Option<IpAddr>,
    port: u16,
}

impl SockAddr {
    pub fn null() -> SockAddr {
        SockAddr::default()
    }

    pub fn ipv4(ip: u32, port: u16) -> SockAddr {
        SockAddr {
            ip: Some(IpAddr::V4(Ipv4Addr::from(ip))),
            port,
        }
    }

    pub fn ipv6(ip: [u8; 16], port: u16) -> SockAddr {
        SockAddr {
            ip: Some(IpAddr::V6(Ipv6Addr::from(ip))),
            port,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ip.is_none()
    }

    /// All-zero address of either family.
    pub fn is_zero(&self) -> bool {
        match self.ip {
            Some(IpAddr::V4(ip)) => u32::from(ip) == 0,
            Some(IpAddr::V6(ip)) => ip.octets() == [0; 16],
            None => true,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.ip, Some(IpAddr::V4(_)))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip, Some(IpAddr::V6(_)))
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.map_or(false, |ip| ip.is_loopback())
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn with_port(mut self, port: u16) -> SockAddr {
        self.port = port;
        self
    }

    /// Parse any accepted address form; see [`FromStr`].
    pub fn parse(s: &str) -> Result<SockAddr> {
        s.parse()
    }

    pub fn is_address(s: &str) -> bool {
        SockAddr::parse(s).is_ok()
    }

    fn parse_ipv4(s: &str) -> Option<SockAddr> {
        let (host, port) = match s.rfind(':') {
            Some(i) => (&s[..i], s[i + 1..].parse::<u16>().ok()?),
            None => (s, 0),
        };

        // A bare decimal number is a 32-bit host address.
        if !host.is_empty() && host.bytes().all(|b| b.is_ascii_digit()) {
            return host.parse::<u32>().ok().map(|ip| SockAddr::ipv4(ip, port));
        }

        Ipv4Addr::from_str(host)
            .ok()
            .map(|ip| SockAddr::ipv4(ip.into(), port))
    }

    fn parse_ipv6(s: &str) -> Option<SockAddr> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest.find(']')?;
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse::<u16>().ok()?,
                None if tail.is_empty() => 0,
                None => return None,
            };
            (host, port)
        } else {
            (s, 0)
        };

        // Zone identifiers are accepted and ignored.
        let host = host.split('%').next().unwrap_or(host);

        Ipv6Addr::from_str(host)
            .ok()
            .map(|ip| SockAddr::ipv6(ip.octets(), port))
    }

    /// Compare addresses; `with_ports` includes the port as a tie breaker.
    pub fn cmp_addr(&self, other: &SockAddr, with_ports: bool) -> Ordering {
        let order = match (self.ip, other.ip) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(IpAddr::V4(_)), Some(IpAddr::V6(_))) => Ordering::Less,
            (Some(IpAddr::V6(_)), Some(IpAddr::V4(_))) => Ordering::Greater,
            (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) => u32::from(a).cmp(&u32::from(b)),
            (Some(IpAddr::V6(a)), Some(IpAddr::V6(b))) => a.octets().cmp(&b.octets()),
        };

        if order == Ordering::Equal && with_ports {
            self.port.cmp(&other.port)
        } else {
            order
        }
    }

    /// Clamp the host bits beyond the first `bits` to all zeros or all
    /// ones.
    pub fn set_cidr_bits(&mut self, bits: u8, on: bool) -> Result<()> {
        match self.ip {
            Some(IpAddr::V4(ip)) => {
                let host = 32u8.saturating_sub(bits);
                let mask = if host >= 32 { u32::MAX } else { (1u64 << host) as u32 - 1 };
                let addr = u32::from(ip);
                let addr = if on { addr | mask } else { addr & !mask };
                self.ip = Some(IpAddr::V4(Ipv4Addr::from(addr)));
                Ok(())
            }
            Some(IpAddr::V6(ip)) => {
                let mut host = 128u16.saturating_sub(bits as u16);
                let mut octets = ip.octets();

                for i in (0..16).rev() {
                    if host == 0 {
                        break;
                    }
                    if 8 <= host {
                        octets[i] = if on { 0xff } else { 0 };
                        host -= 8;
                    } else {
                        let mask = (1u16 << host) as u8 - 1;
                        if on {
                            octets[i] |= mask;
                        } else {
                            octets[i] &= !mask;
                        }
                        break;
                    }
                }
                self.ip = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                Ok(())
            }
            None => Err(Error::Addr("cannot set CIDR bits on a null address".into())),
        }
    }

    /// Longest common prefix length such that `[self, other]` is exactly
    /// the CIDR block `self/n`; -1 when the pair is not aligned on a
    /// power-of-two boundary or the families differ.
    pub fn cidr_bits(&self, other: &SockAddr) -> i16 {
        let (s, e): (Vec<u8>, Vec<u8>) = match (self.ip, other.ip) {
            (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) => {
                (a.octets().to_vec(), b.octets().to_vec())
            }
            (Some(IpAddr::V6(a)), Some(IpAddr::V6(b))) => {
                (a.octets().to_vec(), b.octets().to_vec())
            }
            _ => return -1,
        };

        let mut in_mask = false;
        let mut prefix: i16 = 0;

        for i in 0..s.len() {
            for j in (0..8).rev() {
                let mask = 1u8 << j;

                if !in_mask {
                    if (s[i] & mask) == (e[i] & mask) {
                        prefix += 1;
                    } else {
                        in_mask = true;
                    }
                }

                if in_mask && ((s[i] & mask) != 0 || (e[i] & mask) == 0) {
                    return -1;
                }
            }
        }

        prefix
    }

    /// The address one below this one; `None` at zero.
    pub fn dec(&self) -> Option<SockAddr> {
        if self.is_zero() {
            return None;
        }
        match self.ip {
            Some(IpAddr::V4(ip)) => Some(SockAddr::ipv4(u32::from(ip) - 1, self.port)),
            Some(IpAddr::V6(ip)) => {
                let mut octets = ip.octets();
                for i in (0..16).rev() {
                    if octets[i] != 0 {
                        octets[i] -= 1;
                        break;
                    }
                    octets[i] = 0xff;
                }
                Some(SockAddr::ipv6(octets, self.port))
            }
            None => None,
        }
    }

    /// The address one above this one; `None` at the family maximum.
    pub fn inc(&self) -> Option<SockAddr> {
        match self.ip {
            Some(IpAddr::V4(ip)) => u32::from(ip)
                .checked_add(1)
                .map(|ip| SockAddr::ipv4(ip, self.port)),
            Some(IpAddr::V6(ip)) => {
                let mut octets = ip.octets();
                for i in (0..16).rev() {
                    if octets[i] != 0xff {
                        octets[i] += 1;
                        return Some(SockAddr::ipv6(octets, self.port));
                    }
                    octets[i] = 0;
                }
                None
            }
            None => None,
        }
    }

    /// True when the addresses differ by exactly one, ignoring ports.
    pub fn adjacent(&self, other: &SockAddr) -> bool {
        other
            .dec()
            .map_or(false, |d| self.cmp_addr(&d, false) == Ordering::Equal)
            || self
                .dec()
                .map_or(false, |d| d.cmp_addr(other, false) == Ordering::Equal)
    }

    pub(crate) fn to_raw(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        match self.ip {
            Some(IpAddr::V4(ip)) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = self.port.to_be();
                    (*sin).sin_addr.s_addr = u32::from(ip).to_be();
                }
                Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
            }
            Some(IpAddr::V6(ip)) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = self.port.to_be();
                    (*sin6).sin6_addr.s6_addr = ip.octets();
                }
                Ok((
                    storage,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                ))
            }
            None => Err(Error::Addr("cannot use a null address".into())),
        }
    }

    pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> SockAddr {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = storage as *const _ as *const libc::sockaddr_in;
                let (ip, port) = unsafe {
                    (
                        u32::from_be((*sin).sin_addr.s_addr),
                        u16::from_be((*sin).sin_port),
                    )
                };
                SockAddr::ipv4(ip, port)
            }
            libc::AF_INET6 => {
                let sin6 = storage as *const _ as *const libc::sockaddr_in6;
                let (ip, port) = unsafe {
                    ((*sin6).sin6_addr.s6_addr, u16::from_be((*sin6).sin6_port))
                };
                SockAddr::ipv6(ip, port)
            }
            _ => SockAddr::null(),
        }
    }
}

impl PartialOrd for SockAddr {
    fn partial_cmp(&self, other: &SockAddr) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SockAddr {
    fn cmp(&self, other: &SockAddr) -> Ordering {
        self.cmp_addr(other, true)
    }
}

impl FromStr for SockAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<SockAddr> {
        SockAddr::parse_ipv4(s)
            .or_else(|| SockAddr::parse_ipv6(s))
            .ok_or_else(|| Error::Addr(format!("invalid socket address '{}'", s)))
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(IpAddr::V4(ip)) => {
                if self.port != 0 {
                    write!(f, "{}:{}", ip, self.port)
                } else {
                    write!(f, "{}", ip)
                }
            }
            Some(IpAddr::V6(ip)) => {
                if self.port != 0 {
                    write!(f, "[{}]:{}", ip, self.port)
                } else {
                    write!(f, "{}", ip)
                }
            }
            None => f.write_str("<null>"),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> SockAddr {
        SockAddr {
            ip: Some(addr.ip()),
            port: addr.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_forms() {
        let a: SockAddr = "10.0.0.1".parse().unwrap();
        assert!(a.is_ipv4());
        assert_eq!(a.port(), 0);
        assert_eq!(a.to_string(), "10.0.0.1");

        let a: SockAddr = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(a.port(), 8080);

        // Bare decimal 32-bit host number.
        let a: SockAddr = "167772161".parse().unwrap();
        assert_eq!(a.to_string(), "10.0.0.1");
    }

    #[test]
    fn parse_ipv6_forms() {
        let a: SockAddr = "::1".parse().unwrap();
        assert!(a.is_ipv6());
        assert!(a.is_loopback());

        let a: SockAddr = "[fe80::1]:443".parse().unwrap();
        assert_eq!(a.port(), 443);
        assert_eq!(a.to_string(), "[fe80::1]:443");

        // Zone identifiers accepted and ignored.
        let a: SockAddr = "fe80::1%eth0".parse().unwrap();
        assert_eq!(a.to_string(), "fe80::1");
    }

    #[test]
    fn rejects_garbage() {
        assert!(SockAddr::parse("not an address").is_err());
        assert!(SockAddr::parse("10.0.0.256").is_err());
        assert!(SockAddr::parse("10.0.0.1:99999").is_err());
    }

    #[test]
    fn cidr_bits_aligned_and_not() {
        let s: SockAddr = "10.0.0.0".parse().unwrap();
        let e: SockAddr = "10.255.255.255".parse().unwrap();
        assert_eq!(s.cidr_bits(&e), 8);

        let e: SockAddr = "10.0.0.127".parse().unwrap();
        assert_eq!(s.cidr_bits(&e), 25);

        // Not a power-of-two block.
        let e: SockAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(s.cidr_bits(&e), -1);

        // Same address is a /32.
        assert_eq!(s.cidr_bits(&s), 32);

        // Mixed families never align.
        let v6: SockAddr = "::1".parse().unwrap();
        assert_eq!(s.cidr_bits(&v6), -1);
    }

    #[test]
    fn set_cidr_bits_clamps_host_bits() {
        let mut s: SockAddr = "10.20.30.40".parse().unwrap();
        s.set_cidr_bits(8, false).unwrap();
        assert_eq!(s.to_string(), "10.0.0.0");

        let mut e: SockAddr = "10.20.30.40".parse().unwrap();
        e.set_cidr_bits(8, true).unwrap();
        assert_eq!(e.to_string(), "10.255.255.255");

        let mut v6: SockAddr = "fe80::1234".parse().unwrap();
        v6.set_cidr_bits(64, false).unwrap();
        assert_eq!(v6.to_string(), "fe80::");
    }

    #[test]
    fn adjacency_steps_by_one() {
        let a: SockAddr = "10.0.0.1".parse().unwrap();
        let b: SockAddr = "10.0.0.2".parse().unwrap();
        let c: SockAddr = "10.0.0.3".parse().unwrap();

        assert!(a.adjacent(&b));
        assert!(b.adjacent(&a));
        assert!(!a.adjacent(&c));
        assert!(!a.adjacent(&a));

        // IPv6 carry across octets.
        let x: SockAddr = "::ff".parse().unwrap();
        let y: SockAddr = "::1:0".parse().unwrap();
        assert!(x.adjacent(&y));
    }

    #[test]
    fn ordering_families_then_bytes() {
        let null = SockAddr::null();
        let v4: SockAddr = "1.2.3.4".parse().unwrap();
        let v6: SockAddr = "::1".parse().unwrap();
        assert!(null < v4);
        assert!(v4 < v6);

        let a: SockAddr = "10.0.0.1".parse().unwrap();
        let b: SockAddr = "10.0.0.2".parse().unwrap();
        assert!(a < b);
    }
}
