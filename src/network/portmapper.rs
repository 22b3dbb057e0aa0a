// Host port allocator
//
// Key invariants:
// - a host port is held by at most one (container ip, container port) per
//   protocol; tcp and udp never interfere
// - both maps live under one mutex, so a caller never sees one map updated
//   without the other

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

use crate::metrics;
use crate::network::error::PortMappingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    pub container_ip: String,
    pub container_port: u16,
}

#[derive(Debug, Default)]
struct PortSets {
    tcp: HashMap<u16, PortMap>,
    udp: HashMap<u16, PortMap>,
}

impl PortSets {
    fn select(&mut self, protocol: &str) -> (&'static str, &mut HashMap<u16, PortMap>) {
        if protocol.eq_ignore_ascii_case("udp") {
            ("udp", &mut self.udp)
        } else {
            ("tcp", &mut self.tcp)
        }
    }
}

#[derive(Debug, Default)]
pub struct PortMapper {
    sets: Mutex<PortSets>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `host_port`. `protocol` selects udp when it equal-folds "udp",
    /// tcp otherwise.
    pub fn allocate_map(
        &self,
        protocol: &str,
        host_port: u16,
        container_ip: &str,
        container_port: u16,
    ) -> Result<(), PortMappingError> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let (proto, set) = sets.select(protocol);
        if let Some(existing) = set.get(&host_port) {
            return Err(PortMappingError::PortInUse(format!(
                "Host port {} had already been used, {} {}",
                host_port, existing.container_ip, existing.container_port
            )));
        }
        set.insert(
            host_port,
            PortMap {
                container_ip: container_ip.to_string(),
                container_port,
            },
        );
        metrics::PORT_MAPPINGS_ACTIVE.with_label_values(&[proto]).inc();
        debug!(proto, host_port, container_ip, container_port, "host port allocated");
        Ok(())
    }

    /// Give `host_port` back. Releasing a free port is logged, not an error.
    pub fn release_map(&self, protocol: &str, host_port: u16) -> Result<(), PortMappingError> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let (proto, set) = sets.select(protocol);
        match set.remove(&host_port) {
            Some(_) => metrics::PORT_MAPPINGS_ACTIVE.with_label_values(&[proto]).dec(),
            None => error!(proto, host_port, "Host port has not been used"),
        }
        Ok(())
    }

    pub fn lookup(&self, protocol: &str, host_port: u16) -> Option<PortMap> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.select(protocol).1.get(&host_port).cloned()
    }

    /// Number of allocated host ports for `protocol`
    pub fn allocated(&self, protocol: &str) -> usize {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.select(protocol).1.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_double_allocation_rejected() {
        let mapper = PortMapper::new();
        mapper.allocate_map("tcp", 8080, "10.0.0.2", 80).unwrap();
        let err = mapper.allocate_map("TCP", 8080, "10.0.0.3", 81).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Host port 8080 had already been used, 10.0.0.2 80"
        );
        assert_eq!(
            mapper.lookup("tcp", 8080),
            Some(PortMap {
                container_ip: "10.0.0.2".into(),
                container_port: 80
            })
        );
    }

    #[test]
    fn test_tcp_and_udp_are_independent() {
        let mapper = PortMapper::new();
        mapper.allocate_map("tcp", 53, "10.0.0.2", 53).unwrap();
        mapper.allocate_map("UDP", 53, "10.0.0.2", 53).unwrap();
        assert_eq!(mapper.allocated("tcp"), 1);
        assert_eq!(mapper.allocated("udp"), 1);
    }

    #[test]
    fn test_unknown_protocol_uses_tcp() {
        let mapper = PortMapper::new();
        mapper.allocate_map("sctp", 9000, "10.0.0.2", 9000).unwrap();
        assert!(mapper.lookup("tcp", 9000).is_some());
    }

    #[test]
    fn test_release_free_port_is_ok() {
        let mapper = PortMapper::new();
        assert!(mapper.release_map("tcp", 1234).is_ok());
        mapper.allocate_map("tcp", 1234, "10.0.0.2", 1).unwrap();
        mapper.release_map("tcp", 1234).unwrap();
        mapper.allocate_map("tcp", 1234, "10.0.0.9", 2).unwrap();
    }

    proptest! {
        #[test]
        fn prop_second_allocation_fails_until_release(
            port in 1u16..,
            udp in any::<bool>(),
        ) {
            let proto = if udp { "udp" } else { "tcp" };
            let other = if udp { "tcp" } else { "udp" };
            let mapper = PortMapper::new();
            prop_assert!(mapper.allocate_map(proto, port, "10.0.0.2", 1).is_ok());
            prop_assert!(mapper.allocate_map(proto, port, "10.0.0.3", 2).is_err());
            prop_assert!(mapper.allocate_map(other, port, "10.0.0.3", 2).is_ok());
            mapper.release_map(proto, port).unwrap();
            prop_assert!(mapper.allocate_map(proto, port, "10.0.0.3", 2).is_ok());
        }
    }
}
