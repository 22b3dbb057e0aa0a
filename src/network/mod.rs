//! Host networking for pods
//!
//! Container ports are published through DNAT rules in a dedicated `HYPER`
//! chain, with the host port bookkeeping kept in a [`PortMapper`].

pub mod error;
pub mod iptables;
pub mod portmapper;
pub mod portmapping;

use tracing::{debug, error, trace};

pub use error::{IptablesError, PortMappingError};
pub use iptables::{IptablesRunner, SystemIptables};
pub use portmapper::PortMapper;
pub use portmapping::{
    generate_iptables_args, release_iptables_port_maps, setup_iptables_port_maps, PortMapping,
    PortRange, Protocol,
};

use iptables::{FILTER, NAT};

/// Chain holding the per-container rules, in both nat and filter tables
pub const HYPER_CHAIN: &str = "HYPER";

fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Insert `body` at the top of `table`/`chain` unless it is already there.
fn ensure_rule(
    runner: &dyn IptablesRunner,
    table: &str,
    chain: &str,
    body: &[String],
    what: &str,
) -> Result<(), IptablesError> {
    if iptables::exists(runner, table, chain, body) {
        return Ok(());
    }
    let mut args = rule(&["-t", table, "-I", chain]);
    args.extend_from_slice(body);
    iptables::raw_on_chain(runner, &format!("{} {}", chain, what), &args)
}

/// Prepare NAT and forwarding for the pod bridge. Does nothing when iptables
/// management is disabled.
pub fn setup_network(
    runner: &dyn IptablesRunner,
    bridge: &str,
    addr: &str,
    disable_iptables: bool,
) -> Result<(), IptablesError> {
    if disable_iptables {
        debug!("Iptables is disabled");
        return Ok(());
    }
    trace!(bridge, addr, "setting up iptables");

    let result = setup_iptables(runner, bridge, addr);
    if let Err(e) = &result {
        error!(error = %e, "failed to setup iptables");
    }
    result
}

fn setup_iptables(runner: &dyn IptablesRunner, bridge: &str, addr: &str) -> Result<(), IptablesError> {
    ensure_rule(
        runner,
        NAT,
        "POSTROUTING",
        &rule(&["-s", addr, "!", "-o", bridge, "-j", "MASQUERADE"]),
        "masquerade",
    )?;

    // fails harmlessly when the chain is already there
    let _ = runner.run(&["-N", HYPER_CHAIN]);

    ensure_rule(
        runner,
        FILTER,
        "FORWARD",
        &rule(&["-o", bridge, "-j", HYPER_CHAIN]),
        "goto HYPER",
    )?;
    ensure_rule(
        runner,
        FILTER,
        "FORWARD",
        &rule(&["-i", bridge, "-j", "ACCEPT"]),
        "outgoing",
    )?;
    ensure_rule(
        runner,
        FILTER,
        "FORWARD",
        &rule(&[
            "-o",
            bridge,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
        "incoming",
    )?;

    runner.enable_bridge_netfilter()?;

    let _ = runner.run(&["-t", NAT, "-N", HYPER_CHAIN]);
    ensure_rule(
        runner,
        NAT,
        "OUTPUT",
        &rule(&[
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "!",
            "-d",
            "127.0.0.1/8",
            "-j",
            HYPER_CHAIN,
        ]),
        "goto HYPER",
    )?;
    ensure_rule(
        runner,
        NAT,
        "PREROUTING",
        &rule(&["-m", "addrtype", "--dst-type", "LOCAL", "-j", HYPER_CHAIN]),
        "goto HYPER",
    )
}
