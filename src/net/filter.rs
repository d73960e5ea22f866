use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::dns::{Dns, DnsRequest};
use crate::net::{AddressRange, AddressRangeSet, SockAddr};

/// Allow/deny lists of address ranges with DNS-deferred insertion.
///
/// The allow list wins: an address present in both lists is allowed.
/// Specs may mix ranges and host names; names resolve asynchronously and
/// their addresses join the set as single-host ranges.
pub struct AddressFilter {
    dns: Option<Rc<Dns>>,
    allow: Rc<RefCell<AddressRangeSet>>,
    deny: Rc<RefCell<AddressRangeSet>>,
    requests: Rc<RefCell<HashMap<String, DnsRequest>>>,
}

impl AddressFilter {
    pub fn new(dns: Option<Rc<Dns>>) -> AddressFilter {
        AddressFilter {
            dns,
            allow: Rc::new(RefCell::new(AddressRangeSet::new())),
            deny: Rc::new(RefCell::new(AddressRangeSet::new())),
            requests: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn allow(&self, spec: &str) {
        self.insert(true, spec);
    }

    pub fn deny(&self, spec: &str) {
        self.insert(false, spec);
    }

    pub fn is_allowed(&self, addr: &SockAddr) -> bool {
        if self.allow.borrow().contains(addr) {
            return true;
        }
        if self.deny.borrow().contains(addr) {
            return false;
        }
        true
    }

    fn insert(&self, allow: bool, spec: &str) {
        let set = if allow { &self.allow } else { &self.deny };
        let unresolved = set.borrow_mut().insert_spec(spec);

        for token in unresolved {
            let dns = match &self.dns {
                Some(dns) => dns,
                None => {
                    warn!("ignoring unparsable address spec '{}'", token);
                    continue;
                }
            };

            // Strip a trailing port; names resolve to bare hosts.
            let name = match token.rfind(':') {
                Some(i) if token[i + 1..].bytes().all(|b| b.is_ascii_digit()) => {
                    token[..i].to_string()
                }
                _ => token.clone(),
            };

            if self.requests.borrow().contains_key(&name) {
                continue;
            }

            let set = set.clone();
            let requests = self.requests.clone();
            let key = name.clone();
            let request = dns.resolve(&name, move |result| {
                match result {
                    Ok(addrs) => {
                        let mut set = set.borrow_mut();
                        for addr in addrs {
                            set.insert(&AddressRange::single(addr.with_port(0)));
                        }
                    }
                    Err(e) => debug!("address filter lookup of '{}' failed: {}", key, e),
                }
                requests.borrow_mut().remove(&key);
            });

            self.requests.borrow_mut().insert(name, request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SockAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allow_list_checked_first() {
        let filter = AddressFilter::new(None);
        filter.allow("10.0.0.0/8");
        filter.deny("10.0.0.5");

        // Allowed even though denied, because allow wins.
        assert!(filter.is_allowed(&addr("10.0.0.5")));
        assert!(filter.is_allowed(&addr("10.1.2.3")));
    }

    #[test]
    fn deny_applies_outside_allow() {
        let filter = AddressFilter::new(None);
        filter.allow("10.0.0.0/8");
        filter.deny("192.168.0.0/16");

        assert!(!filter.is_allowed(&addr("192.168.1.1")));
        // Neither list matches: permissive by default.
        assert!(filter.is_allowed(&addr("8.8.8.8")));
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = AddressFilter::new(None);
        assert!(filter.is_allowed(&addr("1.2.3.4")));
    }
}
