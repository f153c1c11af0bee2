//! This module provides the [`Backend`] trait through which a host code
//! generator consumes the micro-op IR, together with the [`CpuEnv`] contract
//! that execution engines use to reach guest CPU state and runtime helpers.

use crate::error::Error;
use crate::exception::Trap;
use crate::ir::{HelperId, Op};
use crate::memory::GuestMemory;
use crate::tb::TranslationBlock;

/// Host-intrinsic atomic operations a back-end can lower directly. The
/// translators query these at translation time and fall back to the
/// store-table locked sequence when an intrinsic is missing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackendCaps {
    pub atomic_fetch_add_i32: bool,
    pub atomic_fetch_add_i64: bool,
    pub atomic_cmpxchg_i32: bool,
    pub atomic_cmpxchg_i64: bool,
    pub atomic_cmpxchg_i128: bool,
}

impl BackendCaps {
    /// Capabilities of a back-end that lowers every atomic intrinsic.
    pub fn all() -> Self {
        Self {
            atomic_fetch_add_i32: true,
            atomic_fetch_add_i64: true,
            atomic_cmpxchg_i32: true,
            atomic_cmpxchg_i64: true,
            atomic_cmpxchg_i128: true,
        }
    }
}

/// A consumer of the micro-op IR. Implementations turn the op list of one
/// translation block into host code; the translation cache that owns the
/// blocks is likewise the implementation's concern.
pub trait Backend {
    /// The intrinsics this back-end lowers.
    fn caps(&self) -> BackendCaps {
        BackendCaps::default()
    }

    /// Consumes the finished op list for `tb`.
    fn compile(&mut self, tb: &TranslationBlock, ops: &[Op]) -> Result<(), Error>;
}

/// Guest CPU state as seen from generated code: global temporaries are read
/// and written through their stable per-architecture ids, and runtime
/// helpers dispatch through [`CpuEnv::call_helper`].
pub trait CpuEnv {
    fn read_global(&self, id: u16) -> u64;

    fn write_global(&mut self, id: u16, value: u64);

    /// Invokes a runtime helper. Returns the helper's value, if any, or the
    /// guest trap it raised.
    fn call_helper(
        &mut self,
        helper: HelperId,
        args: &[u64],
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<u64>, Trap>;
}

/// Why control returned from a translation block to the dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TbExit {
    /// Normal exit. `chain` names the `goto_tb` slot taken, if any; the
    /// dispatcher may patch a host-level chain for it.
    Exit { code: u64, chain: Option<u8> },
    /// Exit that must never be chained; the next block is re-resolved.
    NoChain { code: u64 },
    /// A guest trap unwound out of the block.
    Trap(Trap),
}
