// iptables plumbing
//
// Every command goes through an `IptablesRunner` so the rule logic can be
// exercised without touching the host firewall.
//
// Key invariants:
// - a modifying command succeeds only with a zero exit status AND empty output
// - the xtables lock message is never mistaken for rule output

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace};

use crate::network::error::IptablesError;

pub const NAT: &str = "nat";
pub const FILTER: &str = "filter";

const XTABLES_LOCK_NOISE: &str = "waiting for it to exit";
const BRIDGE_NF_CALL_IPTABLES: &str = "/proc/sys/net/bridge/bridge-nf-call-iptables";

pub trait IptablesRunner: Send + Sync {
    /// Run `iptables args` and return its combined output.
    fn run(&self, args: &[&str]) -> Result<String, IptablesError>;

    /// Load br_netfilter and make bridged traffic traverse iptables.
    fn enable_bridge_netfilter(&self) -> Result<(), IptablesError> {
        match Command::new("modprobe").arg("br_netfilter").output() {
            Ok(output) if output.status.success() => {}
            Ok(_) | Err(_) => debug!("modprobe br_netfilter failed"),
        }
        std::fs::write(BRIDGE_NF_CALL_IPTABLES, "1")?;
        Ok(())
    }
}

/// The host's iptables binary
#[derive(Debug, Clone)]
pub struct SystemIptables {
    path: PathBuf,
    supports_xlock: bool,
}

impl SystemIptables {
    /// Locate iptables on PATH and check for `--wait` support.
    pub fn new() -> Result<Self, IptablesError> {
        let paths = std::env::var_os("PATH").ok_or(IptablesError::NotFound)?;
        let path = std::env::split_paths(&paths)
            .map(|dir| dir.join("iptables"))
            .find(|candidate| candidate.is_file())
            .ok_or(IptablesError::NotFound)?;
        Ok(Self::with_path(path))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let supports_xlock = Command::new(&path)
            .args(["--wait", "-L", "-n"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        Self {
            path,
            supports_xlock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IptablesRunner for SystemIptables {
    fn run(&self, args: &[&str]) -> Result<String, IptablesError> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        if self.supports_xlock {
            full.push("--wait");
        }
        full.extend_from_slice(args);
        trace!(iptables = %self.path.display(), args = ?full, "iptables");

        let output = Command::new(&self.path).args(&full).output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(IptablesError::Command {
                args: full.join(" "),
                output: combined.trim().to_string(),
            });
        }
        if combined.contains(XTABLES_LOCK_NOISE) {
            combined.clear();
        }
        Ok(combined)
    }
}

/// Run a modifying command; any output means it went wrong.
pub fn raw_on_chain(
    runner: &dyn IptablesRunner,
    chain: &str,
    args: &[String],
) -> Result<(), IptablesError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner.run(&args)?;
    if !output.trim().is_empty() {
        return Err(IptablesError::Chain {
            chain: chain.to_string(),
            output: output.trim().to_string(),
        });
    }
    Ok(())
}

fn prefixed(prefix: &[&str], rule: &[String]) -> Vec<String> {
    prefix
        .iter()
        .map(|s| s.to_string())
        .chain(rule.iter().cloned())
        .collect()
}

/// Whether the exact DNAT rule is already in `chain`.
pub fn port_map_exists(runner: &dyn IptablesRunner, chain: &str, nat_args: &[String]) -> bool {
    let args = prefixed(&["-t", NAT, "-C", chain], nat_args);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    runner.run(&args).is_ok()
}

/// Parse `-p PROTO ... --dport B[:E]` out of an `iptables -S` line.
fn rule_ports(line: &str) -> Option<(&str, u16, u16)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let proto_at = tokens.iter().position(|t| *t == "-p")?;
    let proto = *tokens.get(proto_at + 1)?;
    if proto.len() != 3 || !proto.chars().all(|c| "cdtpu".contains(c)) {
        return None;
    }
    let dport_at = proto_at + tokens[proto_at..].iter().position(|t| *t == "--dport")?;
    let dport = *tokens.get(dport_at + 1)?;
    let (begin, end) = match dport.split_once(':') {
        Some((b, e)) => (b.parse().ok()?, e.parse().ok()?),
        None => {
            let p = dport.parse().ok()?;
            (p, p)
        }
    };
    Some((proto, begin, end))
}

/// Whether any rule in nat `chain` already claims a host port in
/// `begin..=end` for `proto`.
pub fn port_map_used(
    runner: &dyn IptablesRunner,
    chain: &str,
    proto: &str,
    begin: u16,
    end: u16,
) -> bool {
    let listing = match runner.run(&["-t", NAT, "-S", chain]) {
        Ok(listing) => listing,
        Err(e) => {
            debug!(chain, error = %e, "cannot list chain");
            return false;
        }
    };
    listing.lines().any(|line| match rule_ports(line) {
        Some((p, p1, p2)) if p == proto => {
            (begin >= p1 && begin <= p2) || (end >= p1 && end <= p2) || (begin < p1 && end > p2)
        }
        Some(_) => false,
        None => {
            trace!(rule = line, "pass short rule line");
            false
        }
    })
}

fn is_ipv4_cidr(token: &str) -> bool {
    let Some((addr, bits)) = token.split_once('/') else {
        return false;
    };
    let octets: Vec<&str> = addr.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| (1..=3).contains(&o.len()) && o.chars().all(|c| c.is_ascii_digit()))
        && (1..=2).contains(&bits.len())
        && bits.chars().all(|c| c.is_ascii_digit())
}

/// iptables rewrites addresses in `-S` output, so compare with CIDRs masked.
fn mask_cidrs(text: &str) -> String {
    text.split_whitespace()
        .map(|t| if is_ipv4_cidr(t) { "?" } else { t })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `rule` is in `table`/`chain`: `-C` first, then a textual match
/// against `-S`.
pub fn exists(runner: &dyn IptablesRunner, table: &str, chain: &str, rule: &[String]) -> bool {
    let table = if table.is_empty() { FILTER } else { table };
    let check = prefixed(&["-t", table, "-C", chain], rule);
    let check: Vec<&str> = check.iter().map(String::as_str).collect();
    if runner.run(&check).is_ok() {
        return true;
    }

    let listing = runner.run(&["-t", table, "-S", chain]).unwrap_or_default();
    let wanted = mask_cidrs(&rule.join(" "));
    listing.lines().any(|line| mask_cidrs(line).contains(&wanted))
}
