//! IP/CIDR value objects, IP-list parsing, and set membership.
//!
//! The plain Rust types are also used by the gateway whitelist; the
//! sandbox bindings at the bottom expose them to scripts through the
//! prelude's `IP`, `IPList`, and `IPSet` globals.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rquickjs::{Ctx, Exception, Function, Object};
use serde::Serialize;

/// A parsed address (`1.2.3.4`) or CIDR range (`10.0.0.0/8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpValue {
    addr: IpAddr,
    prefix: Option<u8>,
}

impl IpValue {
    pub fn parse(literal: &str) -> Result<Self, String> {
        let literal = literal.trim();
        let invalid = || format!("invalid IP address {literal:?}");
        let (addr_part, prefix_part) = match literal.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (literal, None),
        };
        let addr = addr_part.parse::<IpAddr>().map_err(|_| invalid())?;
        let prefix = match prefix_part {
            Some(raw) => {
                let prefix = raw.parse::<u8>().map_err(|_| invalid())?;
                if prefix > address_width(addr) {
                    return Err(invalid());
                }
                Some(prefix)
            }
            None => None,
        };
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn is_cidr(&self) -> bool {
        self.prefix.is_some()
    }

    pub fn version(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Prefix length; a plain address is a full-width range.
    pub fn prefix_len(&self) -> u8 {
        self.prefix.unwrap_or_else(|| address_width(self.addr))
    }

    pub fn network(&self) -> IpAddr {
        let width = address_width(self.addr);
        from_bits(to_bits(self.addr) & prefix_mask(self.prefix_len(), width), self.addr)
    }

    pub fn first(&self) -> IpAddr {
        self.network()
    }

    pub fn last(&self) -> IpAddr {
        let width = address_width(self.addr);
        let mask = prefix_mask(self.prefix_len(), width);
        from_bits(
            (to_bits(self.addr) & mask) | (!mask & full_mask(width)),
            self.addr,
        )
    }

    /// True when `other` (address or range) lies entirely within this range.
    pub fn contains(&self, other: &IpValue) -> bool {
        if self.version() != other.version() || other.prefix_len() < self.prefix_len() {
            return false;
        }
        let mask = prefix_mask(self.prefix_len(), address_width(self.addr));
        to_bits(other.addr) & mask == to_bits(self.addr) & mask
    }

    /// Same network and prefix length after masking host bits.
    pub fn same_range(&self, other: &IpValue) -> bool {
        self.version() == other.version()
            && self.prefix_len() == other.prefix_len()
            && self.network() == other.network()
    }

    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    pub fn is_private(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => v4.is_private(),
            IpAddr::V6(v6) => v6.segments()[0] & 0xfe00 == 0xfc00,
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }

    pub fn is_link_local_unicast(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
        }
    }

    pub fn is_link_local_multicast(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                octets[0] == 224 && octets[1] == 0 && octets[2] == 0
            }
            IpAddr::V6(v6) => v6.segments()[0] & 0xff0f == 0xff02,
        }
    }

    pub fn is_interface_local_multicast(&self) -> bool {
        match self.addr {
            IpAddr::V4(_) => false,
            IpAddr::V6(v6) => v6.segments()[0] & 0xff0f == 0xff01,
        }
    }

    pub fn is_global_unicast(&self) -> bool {
        let broadcast = matches!(self.addr, IpAddr::V4(v4) if v4 == Ipv4Addr::BROADCAST);
        !(broadcast
            || self.is_unspecified()
            || self.is_loopback()
            || self.is_multicast()
            || self.is_link_local_unicast())
    }

    /// Classful mask for IPv4; IPv6 has no default mask.
    pub fn default_mask(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(v4) => Some(match v4.octets()[0] {
                0..=127 => Ipv4Addr::new(255, 0, 0, 0),
                128..=191 => Ipv4Addr::new(255, 255, 0, 0),
                _ => Ipv4Addr::new(255, 255, 255, 0),
            }),
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for IpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "{}/{}", self.addr, prefix),
            None => write!(f, "{}", self.addr),
        }
    }
}

fn address_width(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_bits(bits: u128, family: IpAddr) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from((bits & u128::from(u32::MAX)) as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

fn full_mask(width: u8) -> u128 {
    if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

fn prefix_mask(prefix: u8, width: u8) -> u128 {
    let all = full_mask(width);
    all & !all.checked_shr(u32::from(prefix)).unwrap_or(0)
}

/// Parses newline-separated addresses/ranges, dropping blank lines and
/// `#` comments. The first invalid line fails the whole list.
pub fn parse_ip_list(text: &str) -> Result<Vec<String>, String> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(index) => &line[..index],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        IpValue::parse(line).map_err(|_| format!("invalid IP address {line:?}"))?;
        entries.push(line.to_string());
    }
    Ok(entries)
}

/// Membership set over addresses and CIDR ranges.
///
/// An address candidate matches a stored equal address or any stored range
/// containing it. A range candidate only matches an identical stored range.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    literals: Vec<String>,
    values: Vec<IpValue>,
}

impl IpSet {
    pub fn from_entries<I, S>(entries: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            set.values.push(IpValue::parse(entry)?);
            set.literals.push(entry.to_string());
        }
        Ok(set)
    }

    pub fn entries(&self) -> &[String] {
        &self.literals
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_value(&self, candidate: &IpValue) -> bool {
        if candidate.is_cidr() {
            self.values.iter().any(|stored| stored.same_range(candidate))
        } else {
            self.values.iter().any(|stored| stored.contains(candidate))
        }
    }

    /// Unparsable candidates are never members.
    pub fn contains(&self, candidate: &str) -> bool {
        IpValue::parse(candidate)
            .map(|candidate| self.contains_value(&candidate))
            .unwrap_or(false)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IpFacts {
    literal: String,
    version: u8,
    #[serde(rename = "isCIDR")]
    is_cidr: bool,
    prefix_length: u8,
    network: String,
    first: String,
    last: String,
    default_mask: Option<String>,
    is_loopback: bool,
    is_private: bool,
    is_multicast: bool,
    is_unspecified: bool,
    is_global_unicast: bool,
    is_link_local_unicast: bool,
    is_link_local_multicast: bool,
    is_interface_local_multicast: bool,
}

impl From<&IpValue> for IpFacts {
    fn from(value: &IpValue) -> Self {
        Self {
            literal: value.to_string(),
            version: value.version(),
            is_cidr: value.is_cidr(),
            prefix_length: value.prefix_len(),
            network: value.network().to_string(),
            first: value.first().to_string(),
            last: value.last().to_string(),
            default_mask: value.default_mask().map(|mask| mask.to_string()),
            is_loopback: value.is_loopback(),
            is_private: value.is_private(),
            is_multicast: value.is_multicast(),
            is_unspecified: value.is_unspecified(),
            is_global_unicast: value.is_global_unicast(),
            is_link_local_unicast: value.is_link_local_unicast(),
            is_link_local_multicast: value.is_link_local_multicast(),
            is_interface_local_multicast: value.is_interface_local_multicast(),
        }
    }
}

pub(crate) fn install<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "ipParse",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, literal: String| {
            let value = IpValue::parse(&literal)
                .map_err(|message| Exception::throw_type(&ctx, &message))?;
            serde_json::to_string(&IpFacts::from(&value))
                .map_err(|error| Exception::throw_internal(&ctx, &error.to_string()))
        })?,
    )?;

    host.set(
        "ipContains",
        Function::new(ctx.clone(), |outer: String, inner: String| {
            match (IpValue::parse(&outer), IpValue::parse(&inner)) {
                (Ok(outer), Ok(inner)) => outer.contains(&inner),
                _ => false,
            }
        })?,
    )?;

    host.set(
        "ipParseList",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| {
            parse_ip_list(&text).map_err(|message| Exception::throw_message(&ctx, &message))
        })?,
    )?;

    // Returns a native membership predicate closed over the parsed set.
    host.set(
        "ipSetBuild",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, entries: Vec<String>| {
            let set = IpSet::from_entries(&entries)
                .map_err(|message| Exception::throw_type(&ctx, &message))?;
            Function::new(ctx.clone(), move |candidate: String| set.contains(&candidate))
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::{parse_ip_list, IpSet, IpValue};

    #[test]
    fn unit_ip_set_matches_addresses_inside_stored_ranges() {
        let set = IpSet::from_entries(["10.0.0.0/8"]).expect("valid set");
        assert!(set.contains("10.1.2.3"));
        assert!(!set.contains("11.1.2.3"));

        let single = IpSet::from_entries(["1.2.3.4"]).expect("valid set");
        assert!(single.contains("1.2.3.4"));
        assert!(!single.contains("1.2.3.5"));
    }

    #[test]
    fn unit_ip_set_requires_exact_range_for_cidr_candidates() {
        let set = IpSet::from_entries(["10.0.0.0/8", "2001:db8::/32"]).expect("valid set");
        assert!(set.contains("10.0.0.0/8"));
        assert!(set.contains("10.1.0.0/8"));
        assert!(!set.contains("10.1.0.0/16"));
        assert!(set.contains("2001:db8::1"));
        assert!(!set.contains("2001:db9::1"));
    }

    #[test]
    fn regression_ip_set_treats_unparsable_candidates_as_absent() {
        let set = IpSet::from_entries(["0.0.0.0/0"]).expect("valid set");
        assert!(!set.contains("not-an-ip"));
        assert!(!set.contains("::1"));
        assert!(IpSet::from_entries(["bogus"]).is_err());
    }

    #[test]
    fn unit_parse_ip_list_strips_comments_and_blank_lines() {
        let entries =
            parse_ip_list("1.1.1.1\n# comment\n2.2.2.2/24\n\n").expect("valid list");
        assert_eq!(entries, vec!["1.1.1.1", "2.2.2.2/24"]);

        let inline = parse_ip_list("  3.3.3.3  # resolver\r\n").expect("valid list");
        assert_eq!(inline, vec!["3.3.3.3"]);
    }

    #[test]
    fn regression_parse_ip_list_names_the_offending_line() {
        let error = parse_ip_list("1.1.1.1\nnot-an-ip\n").expect_err("invalid line");
        assert_eq!(error, "invalid IP address \"not-an-ip\"");
    }

    #[test]
    fn unit_ip_value_reports_range_introspection() {
        let value = IpValue::parse("192.168.1.77/24").expect("valid cidr");
        assert!(value.is_cidr());
        assert!(value.is_private());
        assert_eq!(value.prefix_len(), 24);
        assert_eq!(value.network(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(value.last(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255)));
        assert_eq!(value.default_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(value.contains(&IpValue::parse("192.168.1.3").expect("address")));
        assert!(!value.contains(&IpValue::parse("192.168.0.0/16").expect("wider")));
    }

    #[test]
    fn unit_ip_value_classifies_ipv6_addresses() {
        let link_local = IpValue::parse("fe80::1").expect("valid v6");
        assert!(link_local.is_link_local_unicast());
        assert!(!link_local.is_global_unicast());
        assert_eq!(link_local.default_mask(), None);
        assert!(IpValue::parse("ff02::1").expect("valid v6").is_link_local_multicast());
        assert!(IpValue::parse("ff01::1")
            .expect("valid v6")
            .is_interface_local_multicast());
        assert!(IpValue::parse("2606:4700::1111").expect("valid v6").is_global_unicast());
    }

    #[test]
    fn regression_ip_value_rejects_oversized_prefix() {
        assert!(IpValue::parse("10.0.0.0/33").is_err());
        assert!(IpValue::parse("::/129").is_err());
        assert!(IpValue::parse("::/128").is_ok());
    }
}
