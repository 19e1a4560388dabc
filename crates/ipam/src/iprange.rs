//! IP range parsing and free-set arithmetic.
//!
//! Pool specs carry ranges as `a.b.c.d` or `a.b.c.d-a.b.c.e`. Expansion
//! yields ordered sets, so "the lowest free address" is always the first
//! element and ties cannot arise.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;

use crds::{IPV4, IPV6};

use crate::error::IpamError;

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(version: i64, value: u128) -> IpAddr {
    if version == IPV4 {
        IpAddr::V4((value as u32).into())
    } else {
        IpAddr::V6(value.into())
    }
}

fn family_of(ip: IpAddr) -> i64 {
    if ip.is_ipv4() {
        IPV4
    } else {
        IPV6
    }
}

fn parse_addr(version: i64, s: &str) -> Result<IpAddr, IpamError> {
    let ip = IpAddr::from_str(s.trim())
        .map_err(|_| IpamError::WrongInput(format!("invalid IP address {}", s)))?;
    if family_of(ip) != version {
        return Err(IpamError::WrongInput(format!(
            "IP address {} is not IPv{}",
            s, version
        )));
    }
    Ok(ip)
}

/// Expands one `a.b.c.d` or `a.b.c.d-a.b.c.e` range into its addresses.
pub fn parse_ip_range(version: i64, range: &str) -> Result<Vec<IpAddr>, IpamError> {
    match range.split_once('-') {
        None => Ok(vec![parse_addr(version, range)?]),
        Some((start, end)) => {
            let start = parse_addr(version, start)?;
            let end = parse_addr(version, end)?;
            let (lo, hi) = (ip_to_u128(start), ip_to_u128(end));
            if lo > hi {
                return Err(IpamError::WrongInput(format!(
                    "invalid IP range {}: start is greater than end",
                    range
                )));
            }
            Ok((lo..=hi).map(|v| u128_to_ip(version, v)).collect())
        }
    }
}

/// Expands a list of ranges into one ordered set.
pub fn expand_ranges(version: i64, ranges: &[String]) -> Result<BTreeSet<IpAddr>, IpamError> {
    let mut set = BTreeSet::new();
    for range in ranges {
        set.extend(parse_ip_range(version, range)?);
    }
    Ok(set)
}

/// Number of assignable addresses: `ips` minus `exclude_ips`.
pub fn assignable_count(
    version: i64,
    ips: &[String],
    exclude_ips: &[String],
) -> Result<i64, IpamError> {
    let mut set = expand_ranges(version, ips)?;
    for excluded in expand_ranges(version, exclude_ips)? {
        set.remove(&excluded);
    }
    Ok(set.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_address_range() {
        let ips = parse_ip_range(IPV4, "10.0.0.9").unwrap();
        assert_eq!(ips, vec![IpAddr::from_str("10.0.0.9").unwrap()]);
    }

    #[test]
    fn test_v4_range_expansion() {
        let ips = parse_ip_range(IPV4, "10.0.0.2-10.0.0.5").unwrap();
        assert_eq!(ips.len(), 4);
        assert_eq!(ips[0], IpAddr::from_str("10.0.0.2").unwrap());
        assert_eq!(ips[3], IpAddr::from_str("10.0.0.5").unwrap());
    }

    #[test]
    fn test_v6_range_expansion() {
        let ips = parse_ip_range(IPV6, "fd00::2-fd00::5").unwrap();
        assert_eq!(ips.len(), 4);
        assert_eq!(ips[0], IpAddr::from_str("fd00::2").unwrap());
    }

    #[test]
    fn test_family_mismatch_rejected() {
        assert!(parse_ip_range(IPV6, "10.0.0.2").is_err());
        assert!(parse_ip_range(IPV4, "fd00::2").is_err());
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!(parse_ip_range(IPV4, "10.0.0.5-10.0.0.2").is_err());
    }

    #[test]
    fn test_expansion_is_ordered_and_deduplicated() {
        let set = expand_ranges(
            IPV4,
            &["10.0.0.4".to_string(), "10.0.0.2-10.0.0.4".to_string()],
        )
        .unwrap();
        let ips: Vec<_> = set.into_iter().collect();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], IpAddr::from_str("10.0.0.2").unwrap());
    }

    #[test]
    fn test_assignable_count_subtracts_exclusions() {
        let count = assignable_count(
            IPV4,
            &["10.0.0.2-10.0.0.5".to_string()],
            &["10.0.0.3".to_string()],
        )
        .unwrap();
        assert_eq!(count, 3);
    }
}
