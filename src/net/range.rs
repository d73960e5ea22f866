use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::net::SockAddr;

/// A closed interval of addresses of one family, ports ignored.
///
/// Parsed from `A` (single host), `A/N` (CIDR block) or `A-B` (explicit
/// interval).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRange {
    start: SockAddr,
    end: SockAddr,
}

impl AddressRange {
    pub fn new(start: SockAddr, end: SockAddr) -> AddressRange {
        let mut range = AddressRange::default();
        range.set(start, end);
        range
    }

    pub fn single(addr: SockAddr) -> AddressRange {
        AddressRange::new(addr, addr)
    }

    pub fn start(&self) -> &SockAddr {
        &self.start
    }

    pub fn end(&self) -> &SockAddr {
        &self.end
    }

    fn set(&mut self, start: SockAddr, end: SockAddr) {
        self.start = start.with_port(0);
        self.end = end.with_port(0);
        if self.end.cmp_addr(&self.start, false) == Ordering::Less {
            std::mem::swap(&mut self.start, &mut self.end);
        }
    }

    pub(crate) fn set_start(&mut self, start: SockAddr) {
        self.start = start.with_port(0);
    }

    pub(crate) fn set_end(&mut self, end: SockAddr) {
        self.end = end.with_port(0);
    }

    /// Where `addr` falls relative to this range: `Less` means below the
    /// start, `Greater` above the end, `Equal` inside.
    pub fn position(&self, addr: &SockAddr) -> Ordering {
        if addr.cmp_addr(&self.start, false) == Ordering::Less {
            Ordering::Less
        } else if self.end.cmp_addr(addr, false) == Ordering::Less {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    pub fn contains(&self, addr: &SockAddr) -> bool {
        self.position(addr) == Ordering::Equal
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.contains(&other.start) || self.contains(&other.end) || other.contains(&self.end)
    }

    /// True when the ranges touch without overlapping.
    pub fn adjacent(&self, other: &AddressRange) -> bool {
        other.end.adjacent(&self.start) || self.end.adjacent(&other.start)
    }

    /// Grow to cover `other`; the ranges must overlap or be adjacent.
    pub fn add(&mut self, other: &AddressRange) -> Result<()> {
        if !self.adjacent(other) && !self.overlaps(other) {
            return Err(Error::Addr(
                "ranges are not adjacent and do not overlap".into(),
            ));
        }

        if other.start.cmp_addr(&self.start, false) == Ordering::Less {
            self.start = other.start;
        }
        if self.end.cmp_addr(&other.end, false) == Ordering::Less {
            self.end = other.end;
        }
        Ok(())
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    fn from_str(spec: &str) -> Result<AddressRange> {
        let parse = |spec: &str| -> Result<AddressRange> {
            if let Some(dash) = spec.find('-') {
                let start = SockAddr::parse(&spec[..dash])?;
                let end = SockAddr::parse(&spec[dash + 1..])?;
                if start.is_ipv4() != end.is_ipv4() {
                    return Err(Error::Addr("range endpoints of mixed family".into()));
                }
                return Ok(AddressRange::new(start, end));
            }

            if let Some(slash) = spec.find('/') {
                let bits: u8 = spec[slash + 1..]
                    .parse()
                    .map_err(|_| Error::Addr("invalid prefix length".into()))?;
                let addr = SockAddr::parse(&spec[..slash])?;
                let limit = if addr.is_ipv4() { 32 } else { 128 };
                if limit < bits {
                    return Err(Error::Addr("prefix length too large".into()));
                }

                let mut start = addr.with_port(0);
                let mut end = addr.with_port(0);
                start.set_cidr_bits(bits, false)?;
                end.set_cidr_bits(bits, true)?;
                return Ok(AddressRange::new(start, end));
            }

            Ok(AddressRange::single(SockAddr::parse(spec)?))
        };

        parse(spec).map_err(|e| Error::Addr(format!("invalid address range '{}': {}", spec, e)))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            return write!(f, "{}", self.start);
        }

        let bits = self.start.cidr_bits(&self.end);
        if 0 <= bits {
            write!(f, "{}/{}", self.start, bits)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A sorted, coalesced set of address ranges.
///
/// Stored ranges are strictly ordered by start, never overlap and never
/// touch; inserting a range that overlaps or abuts existing ranges merges
/// them.
#[derive(Debug, Clone, Default)]
pub struct AddressRangeSet {
    ranges: Vec<AddressRange>,
}

impl AddressRangeSet {
    pub fn new() -> AddressRangeSet {
        AddressRangeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// Binary search for `addr`: whether it is inside a range, and the
    /// index of that range or of the insertion point.
    fn locate(&self, addr: &SockAddr) -> (bool, usize) {
        let mut lo = 0;
        let mut hi = self.ranges.len();
        let mut cmp = Ordering::Greater;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            cmp = self.ranges[mid].position(addr);

            match cmp {
                Ordering::Equal => return (true, mid),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }

        let _ = cmp;
        (false, lo)
    }

    pub fn contains(&self, addr: &SockAddr) -> bool {
        self.locate(addr).0
    }

    /// Insert one range, merging overlaps and closing single-address gaps.
    pub fn insert(&mut self, range: &AddressRange) {
        let s = *range.start();
        let e = *range.end();

        let (mut s_inside, mut s_pos) = self.locate(&s);
        let (mut e_inside, e_pos) = self.locate(&e);

        // A range that ends just before an existing one extends it; same
        // for one starting just past a predecessor's end.
        if !s_inside && 0 < s_pos && self.ranges[s_pos - 1].end().adjacent(&s) {
            s_inside = true;
            s_pos -= 1;
            self.ranges[s_pos].set_end(s);
        }

        if !e_inside && e_pos < self.ranges.len() && self.ranges[e_pos].start().adjacent(&e) {
            e_inside = true;
            self.ranges[e_pos].set_start(e);
        }

        if s_pos == e_pos && !s_inside && !e_inside {
            self.ranges.insert(s_pos, AddressRange::default());
        }

        let first = &mut self.ranges[s_pos];
        if first.start().is_null() || s.cmp_addr(first.start(), false) == Ordering::Less {
            first.set_start(s);
        }

        if !e_inside {
            self.ranges[s_pos].set_end(e);
        } else if s_pos != e_pos {
            let end = *self.ranges[e_pos].end();
            self.ranges[s_pos].set_end(end);
        }

        let remove_from = s_pos + 1;
        let remove_to = e_pos + usize::from(e_inside);
        if remove_from < remove_to {
            self.ranges.drain(remove_from..remove_to);
        }
    }

    pub fn insert_set(&mut self, other: &AddressRangeSet) {
        for range in &other.ranges {
            self.insert(range);
        }
    }

    /// Insert every whitespace/comma/semicolon-separated token of `spec`,
    /// returning the tokens that did not parse as ranges (typically host
    /// names the caller resolves asynchronously).
    pub fn insert_spec(&mut self, spec: &str) -> Vec<String> {
        let mut unresolved = Vec::new();

        for token in spec.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
            if token.is_empty() {
                continue;
            }
            match token.parse::<AddressRange>() {
                Ok(range) => self.insert(&range),
                Err(_) => unresolved.push(token.to_string()),
            }
        }

        unresolved
    }
}

impl fmt::Display for AddressRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> AddressRange {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> SockAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_forms() {
        let r = range("10.0.0.1");
        assert_eq!(r.start(), r.end());

        let r = range("10.0.0.0/24");
        assert_eq!(r.to_string(), "10.0.0.0/24");
        assert_eq!(r.end(), &addr("10.0.0.255"));

        let r = range("10.0.0.5-10.0.0.1");
        assert_eq!(r.start(), &addr("10.0.0.1"));
        assert_eq!(r.end(), &addr("10.0.0.5"));

        assert!("10.0.0.1-::1".parse::<AddressRange>().is_err());
        assert!("10.0.0.0/33".parse::<AddressRange>().is_err());
    }

    #[test]
    fn display_picks_shortest_form() {
        assert_eq!(range("10.1.2.3").to_string(), "10.1.2.3");
        assert_eq!(range("10.0.0.0/8").to_string(), "10.0.0.0/8");
        assert_eq!(
            range("10.0.0.1-10.0.0.5").to_string(),
            "10.0.0.1-10.0.0.5"
        );
    }

    #[test]
    fn contains_overlaps_adjacent() {
        let r = range("10.0.0.10-10.0.0.20");
        assert!(r.contains(&addr("10.0.0.10")));
        assert!(r.contains(&addr("10.0.0.20")));
        assert!(!r.contains(&addr("10.0.0.21")));

        assert!(r.overlaps(&range("10.0.0.20-10.0.0.30")));
        assert!(!r.overlaps(&range("10.0.0.21-10.0.0.30")));
        assert!(r.adjacent(&range("10.0.0.21-10.0.0.30")));
        assert!(!r.adjacent(&range("10.0.0.22-10.0.0.30")));
    }

    #[test]
    fn set_coalesces_overlaps_and_neighbors() {
        let mut set = AddressRangeSet::new();
        set.insert(&range("10.0.0.1-10.0.0.5"));
        set.insert(&range("10.0.0.20-10.0.0.30"));
        assert_eq!(set.len(), 2);

        // Overlap merges.
        set.insert(&range("10.0.0.4-10.0.0.10"));
        assert_eq!(set.len(), 2);
        assert!(set.contains(&addr("10.0.0.8")));

        // Adjacency merges.
        set.insert(&range("10.0.0.11-10.0.0.19"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_string(), "10.0.0.1-10.0.0.30");
    }

    #[test]
    fn set_insert_spanning_many() {
        let mut set = AddressRangeSet::new();
        for s in ["10.0.0.1", "10.0.0.5", "10.0.0.9", "10.0.1.0/24"] {
            set.insert(&range(s));
        }
        assert_eq!(set.len(), 4);

        set.insert(&range("10.0.0.0-10.0.2.0"));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&addr("10.0.1.128")));
    }

    #[test]
    fn set_invariants_hold() {
        let mut set = AddressRangeSet::new();
        for s in [
            "10.0.0.128",
            "10.0.0.1-10.0.0.3",
            "10.0.0.2-10.0.0.64",
            "10.0.0.65",
            "192.168.0.0/24",
            "10.0.0.100-10.0.0.127",
        ] {
            set.insert(&range(s));
        }

        let ranges = set.ranges();
        for pair in ranges.windows(2) {
            // Strictly ordered, non-overlapping, with a gap of at least one.
            assert_eq!(
                pair[0].end().cmp_addr(pair[1].start(), false),
                std::cmp::Ordering::Less
            );
            assert!(!pair[0].overlaps(&pair[1]));
            assert!(!pair[0].adjacent(&pair[1]));
        }

        // Union preserved.
        for s in ["10.0.0.1", "10.0.0.64", "10.0.0.65", "10.0.0.100", "10.0.0.128", "192.168.0.77"] {
            assert!(set.contains(&addr(s)), "{} missing", s);
        }
        assert!(!set.contains(&addr("10.0.0.66")));
        assert!(!set.contains(&addr("10.0.0.99")));
    }

    #[test]
    fn insert_spec_tokenizes_and_reports_names() {
        let mut set = AddressRangeSet::new();
        let unresolved = set.insert_spec("10.0.0.0/8, 192.168.1.1;example.com 172.16.0.1-172.16.0.9");
        assert_eq!(set.len(), 3);
        assert_eq!(unresolved, vec!["example.com".to_string()]);
    }
}
