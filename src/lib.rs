//! Hyperpod Orchestrator Library
//!
//! Runs containers inside lightweight VMs. This library provides the
//! hypervisor drivers (QEMU over QMP, libvirt, Xen), the per-VM event hub,
//! and host port mapping through iptables.

pub mod config;
pub mod hypervisor;
pub mod libvirt;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod network;
pub mod qemu;
pub mod xen;
