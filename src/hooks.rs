//! This module provides the instrumentation state shared by the front-ends:
//! pre/post opcode hooks, GPR and stack access hooks, opcode counters, and
//! the profiler's stack-frame tracking.

/// Hook configuration and counters for one core. The masks are consulted at
/// translation time, so changing them requires the host to invalidate the
/// affected translation blocks.
#[derive(Debug, Default)]
pub struct HookState {
    /// Hook id to fire before each translated instruction, if any.
    pub pre_opcode_hook: Option<u32>,
    /// Hook id to fire after each translated instruction, if any.
    pub post_opcode_hook: Option<u32>,
    /// Bit per GPR index; the access hook fires after a write to a register
    /// whose bit is set.
    pub gpr_access_mask: u64,
    /// Fire the stack access hook on loads/stores through the stack pointer.
    pub stack_access_hook: bool,
    /// Count executed opcodes by their leading byte.
    pub count_opcodes: bool,
    /// Per-leading-byte execution counters; allocated when
    /// [`HookState::count_opcodes`] is first enabled.
    pub opcode_counts: Vec<u64>,
    /// Announce stack-frame changes to the profiler callback.
    pub guest_profiler: bool,
}

impl HookState {
    /// Enables per-opcode counting, allocating the counters on first use.
    pub fn enable_opcode_counting(&mut self) {
        self.count_opcodes = true;
        if self.opcode_counts.is_empty() {
            self.opcode_counts = vec![0; 256];
        }
    }

    pub fn record_opcode(&mut self, leading_byte: u8) {
        if self.count_opcodes {
            self.opcode_counts[leading_byte as usize] += 1;
        }
    }

    /// Whether a write to GPR `index` should fire the access hook.
    pub fn traces_gpr(&self, index: u32) -> bool {
        index < 64 && self.gpr_access_mask & (1 << index) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_mask_selects_registers() {
        let mut hooks = HookState::default();
        hooks.gpr_access_mask = 1 << 10 | 1 << 2;
        assert!(hooks.traces_gpr(2));
        assert!(hooks.traces_gpr(10));
        assert!(!hooks.traces_gpr(3));
    }

    #[test]
    fn opcode_counters_allocate_lazily() {
        let mut hooks = HookState::default();
        hooks.record_opcode(0x90);
        assert!(hooks.opcode_counts.is_empty());
        hooks.enable_opcode_counting();
        hooks.record_opcode(0x90);
        hooks.record_opcode(0x90);
        assert_eq!(hooks.opcode_counts[0x90], 2);
    }
}
