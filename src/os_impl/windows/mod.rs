pub mod bindings;
pub mod hypervisor;
pub mod vcpu;
pub mod vm;

pub use hypervisor::Hypervisor;
pub use vcpu::Vcpu;
pub use vm::{Vm, VmBuilder};
