//! Hypervisor abstraction
//!
//! The [`HypervisorDriver`] / [`DriverContext`] pair is implemented by the
//! QEMU, libvirt and Xen backends. A [`VmContext`] binds one driver context
//! to one VM and its event [`Hub`].

pub mod constants;
pub mod context;
pub mod disk;
pub mod driver;
pub mod error;
pub mod events;
pub mod loader;
pub mod persist;

pub use context::{BootConfig, VmContext};
pub use driver::{
    DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, PersistedMap,
};
pub use error::HypervisorError;
pub use events::{ErrorSender, EventSender, Hub, HubReceiver, InterfaceCreated, VmEvent};
pub use loader::probe;
pub use persist::PersistedState;
