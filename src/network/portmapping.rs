// Container port mappings as iptables DNAT rules
//
// Key invariants:
// - setup either applies every mapping or leaves no rule and no allocated
//   port behind; rules that could not be reverted are reported, not dropped
// - host ranges map 1:N (one host port) or N:N, never M:N

use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::network::error::PortMappingError;
use crate::network::iptables::{self, IptablesRunner, NAT};
use crate::network::portmapper::PortMapper;
use crate::network::HYPER_CHAIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// udp when `proto` equal-folds "udp", tcp otherwise
    pub fn fold(proto: &str) -> Self {
        if proto.eq_ignore_ascii_case("udp") {
            Self::Udp
        } else {
            Self::Tcp
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortMappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(PortMappingError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Inclusive port range; `end == 0` means a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    /// Parse `"b"` or `"b-e"`.
    pub fn parse(spec: &str) -> Result<Self, PortMappingError> {
        let invalid = |e: std::num::ParseIntError| {
            PortMappingError::InvalidRange(format!("invalid port range {:?}: {}", spec, e))
        };
        let (begin, end) = match spec.split_once('-') {
            Some((b, e)) => (b.parse().map_err(invalid)?, e.parse().map_err(invalid)?),
            None => {
                let b = spec.parse().map_err(invalid)?;
                (b, b)
            }
        };
        Ok(Self { begin, end })
    }

    pub fn single(port: u16) -> Self {
        Self {
            begin: port,
            end: port,
        }
    }

    fn last(&self) -> u16 {
        if self.end == 0 {
            self.begin
        } else {
            self.end
        }
    }

    pub fn len(&self) -> usize {
        usize::from(self.last().saturating_sub(self.begin)) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last() < self.begin
    }

    /// iptables `--dport` form: `b` or `b:e`, None when reversed
    fn dport(&self) -> Option<String> {
        let last = self.last();
        if last == self.begin {
            Some(self.begin.to_string())
        } else if last > self.begin {
            Some(format!("{}:{}", self.begin, last))
        } else {
            None
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.last() == self.begin {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = PortMappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    /// Host side
    pub from: PortRange,
    /// Container side
    pub to: PortRange,
}

impl PortMapping {
    pub fn new(proto: &str, from: &str, to: &str) -> Result<Self, PortMappingError> {
        Ok(Self {
            protocol: proto.parse()?,
            from: PortRange::parse(from)?,
            to: PortRange::parse(to)?,
        })
    }

    fn host_ports(&self) -> impl Iterator<Item = u16> {
        self.from.begin..=self.from.last()
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The nat (DNAT) and filter (ACCEPT) rule bodies for one mapping.
pub fn generate_iptables_args(
    container_ip: &str,
    mapping: &PortMapping,
) -> Result<(Vec<String>, Vec<String>), PortMappingError> {
    let proto = mapping.protocol.as_str();
    let (from, to_range) = (mapping.from, mapping.to);

    let from_ports = from.dport().ok_or_else(|| {
        PortMappingError::InvalidRange(format!(
            "invalid from port range {}-{}",
            from.begin, from.end
        ))
    })?;
    let dport = to_range.dport().ok_or_else(|| {
        PortMappingError::InvalidRange(format!(
            "invalid to port range {}-{}",
            to_range.begin, to_range.end
        ))
    })?;
    let to = if to_range.last() == to_range.begin {
        join_host_port(container_ip, &dport)
    } else {
        join_host_port(
            container_ip,
            &format!("{}-{}", to_range.begin, to_range.last()),
        )
    };

    let host_span = from.last() - from.begin;
    let container_span = to_range.last() - to_range.begin;
    if host_span != 0 && host_span != container_span {
        return Err(PortMappingError::RangeMismatch {
            from: from_ports,
            to,
        });
    }

    let nat = [
        "-p",
        proto,
        "-m",
        proto,
        "--dport",
        from_ports.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        to.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let filter = [
        "-d",
        container_ip,
        "-p",
        proto,
        "-m",
        proto,
        "--dport",
        dport.as_str(),
        "-j",
        "ACCEPT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    Ok((nat, filter))
}

fn with_prefix(prefix: &[&str], rule: &[String]) -> Vec<String> {
    prefix
        .iter()
        .map(|s| s.to_string())
        .chain(rule.iter().cloned())
        .collect()
}

/// What a partial setup has done so far
#[derive(Debug, Default)]
struct Applied {
    revert_rules: Vec<Vec<String>>,
    ports: Vec<(Protocol, u16)>,
}

fn apply_port_maps(
    runner: &dyn IptablesRunner,
    mapper: &PortMapper,
    container_ip: &str,
    maps: &[PortMapping],
    applied: &mut Applied,
) -> Result<(), PortMappingError> {
    for m in maps {
        let (nat, filter) = generate_iptables_args(container_ip, m)?;

        if iptables::port_map_exists(runner, HYPER_CHAIN, &nat) {
            debug!(from = %m.from, proto = %m.protocol, "port mapping already exists");
            continue;
        }
        let proto = m.protocol.as_str();
        if iptables::port_map_used(runner, HYPER_CHAIN, proto, m.from.begin, m.from.last()) {
            return Err(PortMappingError::PortInUse(format!(
                "Host port {} has already been used",
                m.from
            )));
        }

        iptables::raw_on_chain(runner, HYPER_CHAIN, &with_prefix(&["-t", NAT, "-I", HYPER_CHAIN], &nat))
            .map_err(|e| {
                error!(error = %e, "Unable to setup NAT rule in HYPER chain");
                e
            })?;
        applied
            .revert_rules
            .push(with_prefix(&["-t", NAT, "-D", HYPER_CHAIN], &nat));

        iptables::raw_on_chain(runner, HYPER_CHAIN, &with_prefix(&["-I", HYPER_CHAIN], &filter))
            .map_err(|e| {
                error!(error = %e, "Unable to setup FILTER rule in HYPER chain");
                e
            })?;
        applied
            .revert_rules
            .push(with_prefix(&["-D", HYPER_CHAIN], &filter));

        for (offset, host_port) in m.host_ports().enumerate() {
            let container_port = m.to.begin.saturating_add(offset as u16);
            mapper.allocate_map(proto, host_port, container_ip, container_port)?;
            applied.ports.push((m.protocol, host_port));
        }
    }
    Ok(())
}

/// Install DNAT/ACCEPT rules for `maps` and claim their host ports. On
/// failure everything done by this call is rolled back.
pub fn setup_iptables_port_maps(
    runner: &dyn IptablesRunner,
    mapper: &PortMapper,
    container_ip: &str,
    maps: &[PortMapping],
) -> Result<(), PortMappingError> {
    let mut applied = Applied::default();
    let source = match apply_port_maps(runner, mapper, container_ip, maps, &mut applied) {
        Ok(()) => {
            info!(container_ip, mappings = maps.len(), "port mappings installed");
            return Ok(());
        }
        Err(e) => e,
    };

    warn!(container_ip, error = %source, "revert portmapping rules...");
    for (proto, port) in applied.ports.iter().rev() {
        let _ = mapper.release_map(proto.as_str(), *port);
    }
    let mut revert_failures = Vec::new();
    for rule in &applied.revert_rules {
        info!(rule = %rule.join(" "), "revert rule");
        if let Err(e) = iptables::raw_on_chain(runner, HYPER_CHAIN, rule) {
            error!(rule = %rule.join(" "), error = %e, "failed to revert rule");
            metrics::PORT_MAPPING_REVERT_FAILURES_TOTAL.inc();
            revert_failures.push(format!("{}: {}", rule.join(" "), e));
        }
    }
    Err(PortMappingError::Setup {
        source: Box::new(source),
        revert_failures,
    })
}

/// Free the host ports of `maps` and delete their rules. Problems are logged;
/// a mapping whose ports cannot be released keeps its rules.
pub fn release_iptables_port_maps(
    runner: &dyn IptablesRunner,
    mapper: &PortMapper,
    container_ip: &str,
    maps: &[PortMapping],
) -> Result<(), PortMappingError> {
    'maps: for m in maps {
        let proto = m.protocol.as_str();
        debug!(from = %m.from, proto, "release port map");
        for port in m.host_ports() {
            if mapper.release_map(proto, port).is_err() {
                continue 'maps;
            }
        }

        let Ok((nat, filter)) = generate_iptables_args(container_ip, m) else {
            continue;
        };
        if let Err(e) = iptables::raw_on_chain(
            runner,
            HYPER_CHAIN,
            &with_prefix(&["-t", NAT, "-D", HYPER_CHAIN], &nat),
        ) {
            warn!(error = %e, "Unable to remove network port map");
        }
        if let Err(e) =
            iptables::raw_on_chain(runner, HYPER_CHAIN, &with_prefix(&["-D", HYPER_CHAIN], &filter))
        {
            warn!(error = %e, "Unable to remove port filter rule");
        }
    }
    Ok(())
}
