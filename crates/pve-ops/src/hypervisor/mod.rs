//! Hypervisor abstraction and its Proxmox CLI implementation.

pub mod lock;
pub mod qm;
mod traits;

pub use lock::VmIdLock;
pub use qm::QmCli;
pub use traits::{
    Hypervisor, StorageKind, VmOption, VmSpec, VolumeLayout, BOOT_SLOT, CLOUDINIT_SLOT,
};
