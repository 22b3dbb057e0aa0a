// Port mapping setup and rollback against an in-memory iptables

use hyperpod_orchestrator::network::iptables::{self, IptablesRunner, NAT};
use hyperpod_orchestrator::network::{
    release_iptables_port_maps, setup_iptables_port_maps, IptablesError, PortMapper,
    PortMapping, PortMappingError, HYPER_CHAIN,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Keeps rules per (table, chain) and understands -I, -A, -D, -C and -S.
#[derive(Default)]
struct FakeIptables {
    chains: Mutex<HashMap<(String, String), Vec<String>>>,
    /// Inserts whose rule contains this text print an error
    fail_insert: Option<&'static str>,
    fail_delete: bool,
}

impl FakeIptables {
    fn failing_insert(pattern: &'static str) -> Self {
        Self {
            fail_insert: Some(pattern),
            ..Default::default()
        }
    }

    fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.chains
            .lock()
            .unwrap()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn preload(&self, table: &str, chain: &str, rule: &str) {
        self.chains
            .lock()
            .unwrap()
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule.to_string());
    }
}

impl IptablesRunner for FakeIptables {
    fn run(&self, args: &[&str]) -> Result<String, IptablesError> {
        let mut table = "filter";
        let mut rest = args;
        if let ["-t", t, tail @ ..] = rest {
            table = *t;
            rest = tail;
        }
        let [op, chain, rule @ ..] = rest else {
            return Err(IptablesError::Command {
                args: args.join(" "),
                output: "bad arguments".into(),
            });
        };
        let rule = rule.join(" ");
        let key = (table.to_string(), chain.to_string());
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.entry(key).or_default();
        let missing = || IptablesError::Command {
            args: args.join(" "),
            output: "Bad rule (does a matching rule exist in that chain?).".into(),
        };

        match *op {
            "-I" | "-A" => {
                if self.fail_insert.is_some_and(|p| rule.contains(p)) {
                    return Ok("iptables: No chain/target/match by that name.".into());
                }
                if *op == "-I" {
                    rules.insert(0, rule);
                } else {
                    rules.push(rule);
                }
                Ok(String::new())
            }
            "-D" => {
                if self.fail_delete {
                    return Err(missing());
                }
                let at = rules.iter().position(|r| *r == rule).ok_or_else(missing)?;
                rules.remove(at);
                Ok(String::new())
            }
            "-C" => rules
                .contains(&rule)
                .then(String::new)
                .ok_or_else(missing),
            "-S" => {
                let mut out = format!("-N {}\n", chain);
                for r in rules.iter() {
                    out.push_str(&format!("-A {} {}\n", chain, r));
                }
                Ok(out)
            }
            _ => Err(missing()),
        }
    }

    fn enable_bridge_netfilter(&self) -> Result<(), IptablesError> {
        Ok(())
    }
}

fn tcp(from: &str, to: &str) -> PortMapping {
    PortMapping::new("tcp", from, to).unwrap()
}

fn udp(from: &str, to: &str) -> PortMapping {
    PortMapping::new("udp", from, to).unwrap()
}

#[test]
fn test_setup_and_release() {
    let runner = FakeIptables::default();
    let mapper = PortMapper::new();
    let maps = vec![tcp("8080", "80"), udp("5300-5301", "53-54")];

    setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &maps).unwrap();

    assert_eq!(runner.rules(NAT, HYPER_CHAIN).len(), 2);
    assert_eq!(runner.rules("filter", HYPER_CHAIN).len(), 2);
    assert_eq!(mapper.allocated("tcp"), 1);
    assert_eq!(mapper.allocated("udp"), 2);
    assert_eq!(mapper.lookup("udp", 5301).unwrap().container_port, 54);
    assert!(iptables::port_map_used(&runner, HYPER_CHAIN, "tcp", 8080, 8080));

    // running setup again finds the rules in place and changes nothing
    setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &maps).unwrap();
    assert_eq!(runner.rules(NAT, HYPER_CHAIN).len(), 2);

    release_iptables_port_maps(&runner, &mapper, "10.0.0.2", &maps).unwrap();
    assert!(runner.rules(NAT, HYPER_CHAIN).is_empty());
    assert!(runner.rules("filter", HYPER_CHAIN).is_empty());
    assert_eq!(mapper.allocated("tcp"), 0);
    assert_eq!(mapper.allocated("udp"), 0);
    assert!(!iptables::port_map_used(&runner, HYPER_CHAIN, "tcp", 8080, 8080));
}

#[test]
fn test_host_port_exclusion() {
    let runner = FakeIptables::default();
    let mapper = PortMapper::new();
    setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &[tcp("8080", "80")]).unwrap();

    let err = setup_iptables_port_maps(&runner, &mapper, "10.0.0.3", &[tcp("8080", "80")])
        .unwrap_err();
    assert!(matches!(err.root(), PortMappingError::PortInUse(_)));
    assert_eq!(
        mapper.lookup("tcp", 8080).unwrap().container_ip,
        "10.0.0.2"
    );

    // the same number over udp is a different port
    setup_iptables_port_maps(&runner, &mapper, "10.0.0.3", &[udp("8080", "80")]).unwrap();
    assert_eq!(mapper.allocated("udp"), 1);
    assert_eq!(mapper.allocated("tcp"), 1);
}

#[test]
fn test_range_overlap_with_foreign_rule() {
    let runner = FakeIptables::default();
    runner.preload(
        NAT,
        HYPER_CHAIN,
        "-p tcp -m tcp --dport 8000:8010 -j DNAT --to-destination 10.0.0.9:8000-8010",
    );
    let mapper = PortMapper::new();

    let err = setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &[tcp("8005", "80")])
        .unwrap_err();
    assert_eq!(err.to_string(), "Host port 8005 has already been used");
    assert_eq!(mapper.allocated("tcp"), 0);
    assert_eq!(runner.rules(NAT, HYPER_CHAIN).len(), 1);
}

#[test]
fn test_failed_setup_rolls_back() {
    // the third mapping's ACCEPT rule cannot be inserted
    let runner = FakeIptables::failing_insert("--dport 9090 -j ACCEPT");
    let mapper = PortMapper::new();
    let maps = vec![
        tcp("8080", "80"),
        udp("5353", "53"),
        tcp("9000", "9090"),
    ];

    let err = setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &maps).unwrap_err();
    match &err {
        PortMappingError::Setup {
            source,
            revert_failures,
        } => {
            assert!(matches!(
                **source,
                PortMappingError::Iptables(IptablesError::Chain { .. })
            ));
            assert!(revert_failures.is_empty());
        }
        other => panic!("expected Setup, got {:?}", other),
    }

    assert!(runner.rules(NAT, HYPER_CHAIN).is_empty());
    assert!(runner.rules("filter", HYPER_CHAIN).is_empty());
    assert_eq!(mapper.allocated("tcp"), 0);
    assert_eq!(mapper.allocated("udp"), 0);
    for (proto, port) in [("tcp", 8080), ("udp", 5353), ("tcp", 9000)] {
        assert!(!iptables::port_map_used(&runner, HYPER_CHAIN, proto, port, port));
    }
}

#[test]
fn test_revert_failures_are_reported() {
    let runner = FakeIptables {
        fail_insert: Some("--dport 9090 -j ACCEPT"),
        fail_delete: true,
        ..Default::default()
    };
    let mapper = PortMapper::new();
    let maps = vec![tcp("8080", "80"), tcp("9000", "9090")];

    let err = setup_iptables_port_maps(&runner, &mapper, "10.0.0.2", &maps).unwrap_err();
    let PortMappingError::Setup {
        revert_failures, ..
    } = &err
    else {
        panic!("expected Setup, got {:?}", err);
    };
    // nat + filter of the first mapping, nat of the second
    assert_eq!(revert_failures.len(), 3);
    assert!(revert_failures[0].starts_with("-t nat -D HYPER -p tcp -m tcp --dport 8080"));
    assert!(err.to_string().ends_with("(3 rules not reverted)"));

    // ports are released even when rules stay behind
    assert_eq!(mapper.allocated("tcp"), 0);
}

#[test]
fn test_release_of_unknown_mapping_is_harmless() {
    let runner = FakeIptables::default();
    let mapper = PortMapper::new();
    release_iptables_port_maps(&runner, &mapper, "10.0.0.2", &[tcp("8080", "80")]).unwrap();
    assert!(runner.rules(NAT, HYPER_CHAIN).is_empty());
}
