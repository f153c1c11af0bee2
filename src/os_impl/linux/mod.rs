pub mod hypervisor;
pub mod vcpu;
pub mod vm;

pub use hypervisor::Hypervisor;
pub use vm::{Vm, VmBuilder};
pub use vcpu::Vcpu;
