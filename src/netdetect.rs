use anyhow::{bail, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Host numbers sensors of this family conventionally sit on within a /24.
const CONVENTIONAL_SENSOR_HOSTS: &[u8] = &[201, 200, 199, 100];

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() {
                continue;
            }
            let cidr = ipv4_to_default_cidr(ip);
            set.insert(cidr);
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    // Sort for stable output
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// Candidate sensor addresses derived from the local subnets.
///
/// For each local /24, yields the conventional sensor host numbers
/// (`.201`, `.200`, `.199`, `.100`). Returns an empty list when no
/// non-loopback interface is up; that is a normal outcome.
pub fn sensor_host_candidates() -> Result<Vec<IpAddr>> {
    let cidrs = detect_local_cidrs()?;
    let mut out = Vec::new();
    for cidr in cidrs {
        out.extend(conventional_hosts_in(cidr));
    }
    Ok(out)
}

/// Conventional sensor host addresses within one network.
pub fn conventional_hosts_in(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => {
            let net = n4.network().octets();
            CONVENTIONAL_SENSOR_HOSTS
                .iter()
                .map(|&h| IpAddr::V4(Ipv4Addr::new(net[0], net[1], net[2], h)))
                .filter(|ip| match ip {
                    IpAddr::V4(v4) => n4.contains(v4),
                    IpAddr::V6(_) => false,
                })
                .collect()
        }
        IpNet::V6(_) => Vec::new(),
    }
}

/// Expand a CIDR into individual IP addresses suitable for a full sweep.
///
/// For IPv4, excludes the network and broadcast addresses.
/// IPv6 sensors are not supported and return an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    // Use inclusive range of numeric IPs, then skip network and broadcast.
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        // Too small to have host addresses
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Parse a candidate list into deduplicated IP addresses.
///
/// Supported formats per line (also accepted comma separated):
/// - single address: `192.168.1.201`
/// - CIDR, expanded to its hosts: `192.168.1.0/30`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_candidates_str(s: &str) -> Result<Vec<IpAddr>> {
    let mut out: Vec<IpAddr> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        // Strip comments and trim
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        for item in line.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if item.contains('/') {
                let net: IpNet = item
                    .parse()
                    .with_context(|| format!("line {line_no}: invalid CIDR: {item}"))?;
                for ip in expand_cidr_to_ips(net) {
                    if seen.insert(ip) {
                        out.push(ip);
                    }
                }
                continue;
            }

            let ip: IpAddr = item
                .parse()
                .with_context(|| format!("line {line_no}: invalid address: {item}"))?;
            if ip.is_unspecified() {
                bail!("line {line_no}: unspecified address is not a valid candidate");
            }
            if seen.insert(ip) {
                out.push(ip);
            }
        }
    }

    Ok(out)
}
