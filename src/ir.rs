//! This module provides the micro-op intermediate representation that sits
//! between the per-architecture decoders and the host code generator.
//!
//! The IR is an enum of operations over typed temporary handles. "Global"
//! temporaries alias guest CPU state through stable per-architecture ids and
//! survive the whole translation block; "local" temporaries come from the
//! per-block arena owned by [`IrBuilder`] and die with it. Back-ends consume
//! the finished op list through the [`crate::backend::Backend`] trait.

use crate::memory::AccessSize;

/// A handle to an IR temporary. Only valid within the [`IrBuilder`] that
/// created it; builders are constructed per translation block and discarded
/// at block end.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Temp(pub(crate) u32);

/// A branch target inside one translation block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Label(pub(crate) u32);

/// How a temporary is backed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TempKind {
    /// Aliases guest CPU state; the id is interpreted by the architecture
    /// that registered it (e.g. RISC-V GPR indices, the x86 `cc_op` slot).
    Global(u16),
    /// Scratch storage for the current block.
    Local,
}

/// Comparison conditions for `setcond` / `movcond` / `brcond`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Le,
    Gt,
    Ltu,
    Geu,
    Leu,
    Gtu,
}

impl Cond {
    /// The negated condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ltu => Cond::Geu,
            Cond::Geu => Cond::Ltu,
            Cond::Leu => Cond::Gtu,
            Cond::Gtu => Cond::Leu,
        }
    }

    /// Evaluates the condition on 64-bit operands.
    pub fn eval(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => (lhs as i64) < (rhs as i64),
            Cond::Ge => (lhs as i64) >= (rhs as i64),
            Cond::Le => (lhs as i64) <= (rhs as i64),
            Cond::Gt => (lhs as i64) > (rhs as i64),
            Cond::Ltu => lhs < rhs,
            Cond::Geu => lhs >= rhs,
            Cond::Leu => lhs <= rhs,
            Cond::Gtu => lhs > rhs,
        }
    }
}

/// Two-operand arithmetic and logic ops. All temporaries are 64 bits wide;
/// narrower guest widths are modelled with explicit extensions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Logical left shift; the count is taken modulo 64.
    Shl,
    /// Logical right shift; the count is taken modulo 64.
    Shr,
    /// Arithmetic right shift; the count is taken modulo 64.
    Sar,
    Mul,
    /// Signed division; the divisor must be non-zero and the quotient
    /// representable (front-ends guard per their ISA rules).
    Div,
    Divu,
    Rem,
    Remu,
    Rotl,
    Rotr,
    /// Carry-less multiply, low half (Zbc).
    Clmul,
    /// Carry-less multiply, high half (Zbc).
    Clmulh,
}

/// One-operand ops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnOp {
    Neg,
    Not,
    Ext8S,
    Ext8U,
    Ext16S,
    Ext16U,
    Ext32S,
    Ext32U,
    Bswap16,
    Bswap32,
    Bswap64,
    /// Leading zeros over 64 bits; 64 for a zero input.
    Clz,
    /// Trailing zeros over 64 bits; 64 for a zero input.
    Ctz,
    Popcnt,
}

/// Identifies a runtime helper callable from generated code. Helpers mutate
/// the owning core's CPU state and may raise guest traps; the argument and
/// return conventions are documented on each architecture's helper
/// dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HelperId {
    // Shared
    /// args: [cause]. Raises the architectural exception encoded by the
    /// current front-end; never returns normally.
    RaiseException,
    /// args: [cause, badaddr]. As above, also filling `mtval`/equivalent.
    RaiseExceptionBadAddr,

    // HST substrate
    /// args: [addr]. Publishes the current core id at `hash(addr)`.
    StoreTableSet,
    /// args: [addr]. Returns 1 iff the current core still owns `hash(addr)`.
    StoreTableCheck,
    /// args: [addr]. Spins until the entry's fine-grained lock is acquired.
    StoreTableLock,
    /// args: [addr].
    StoreTableUnlock,
    /// args: [addr_lo, addr_hi]; caller guarantees `addr_hi == addr_lo + 8`.
    StoreTableLock128,
    /// args: [addr_lo, addr_hi].
    StoreTableUnlock128,

    // RISC-V
    /// args: [addr]. LR: records the reservation.
    ReserveAddress,
    /// args: [addr]. SC probe: returns 0 when the reservation is still held.
    CheckAddressReservation,
    /// args: [addr]. Successful SC: invalidates other cores' reservations.
    RegisterAddressAccess,
    /// args: []. Drops the current core's reservation.
    CancelReservation,
    /// args: [csr]. Returns the CSR value; may trap.
    CsrRead,
    /// args: [csr, value].
    CsrWrite,
    /// args: []. Machine-mode trap return; updates pc/privilege.
    Mret,
    /// args: []. Supervisor-mode trap return.
    Sret,
    /// args: []. Wait-for-interrupt; a NOP in debug mode.
    Wfi,
    /// args: [rd, rs1, avl, vtype, rs1_is_imm]. Returns the new `vl`.
    Vsetvl,
    /// args: [vd, rs1, nf, eew, masked, fault_first].
    VLoadUnit,
    /// args: [vd, rs1, nf, eew, masked].
    VStoreUnit,
    /// args: [vd, rs1, rs2, nf, eew, masked].
    VLoadStride,
    /// args: [vd, rs1, rs2, nf, eew, masked].
    VStoreStride,
    /// args: [vd, rs1, vs2, nf, eew, masked].
    VLoadIndexed,
    /// args: [vd, rs1, vs2, nf, eew, masked].
    VStoreIndexed,
    /// args: [vd, rs1]. Moves `ceil(vl/8)` mask bytes.
    VLoadMask,
    /// args: [vs3, rs1].
    VStoreMask,
    /// args: [vd, rs1, nf]. Whole-register load; `nf` is a power of two.
    VLoadWhole,
    /// args: [vs3, rs1, nf].
    VStoreWhole,
    /// args: [funct6, vd, vs1, vs2, masked]. Vector-vector integer op.
    VOpIvv,
    /// args: [funct6, vd, rs1, vs2, masked]. Vector-scalar integer op.
    VOpIvx,
    /// args: [funct6, vd, imm, vs2, masked]. Vector-immediate integer op.
    VOpIvi,
    /// args: [id, opcode]. Host-registered custom instruction dispatch;
    /// returns nonzero when the callback handled the opcode.
    CustomInstruction,
    /// args: [pc, opcode].
    PreOpcodeHook,
    /// args: [pc, opcode].
    PostOpcodeHook,
    /// args: [reg, is_write].
    GprAccessHook,
    /// args: [addr, width, is_write].
    StackAccessHook,
    /// args: [new_sp]. Stack-frame announcement against the saved
    /// previous stack pointer.
    StackChange,

    // x86
    /// args: [cc_op]. Returns the condition-code portion of EFLAGS
    /// reconstructed from the lazy triplet.
    CcComputeAll,
    /// args: [cc_op]. Returns just CF.
    CcComputeC,
    /// args: []. Returns the full architectural EFLAGS word.
    ReadEflags,
    /// args: [value, mask]. Writes EFLAGS under an update mask.
    WriteEflags,
    /// args: [].
    Cli,
    /// args: [].
    Sti,
    /// args: [enable]. Sets or clears the one-instruction STI interrupt
    /// shadow.
    SetInhibitIrq,
    /// args: [port]. Port input, 8/16/32 bits.
    Inb,
    Inw,
    Inl,
    /// args: [port, value].
    Outb,
    Outw,
    Outl,
    /// args: [port, size]. CPL/IOPL permission check; raises `#GP(0)`.
    CheckIo,
    /// args: [next_eip]. Halts the core until the next interrupt.
    Hlt,
    /// args: []. Fills EAX/EBX/ECX/EDX from the feature set.
    Cpuid,
    /// args: [].
    Rdtsc,
    /// args: [].
    Rdtscp,
    /// args: []. ECX selects the MSR; EDX:EAX receive the value.
    Rdmsr,
    /// args: [].
    Wrmsr,
    /// args: [divisor]. 8-bit unsigned divide of AX; raises `#DE`.
    Divb,
    Divw,
    Divl,
    Divq,
    /// args: [divisor]. Signed counterparts.
    Idivb,
    Idivw,
    Idivl,
    Idivq,
    /// args: [vector, next_eip]. Software interrupt.
    IntN,
    /// args: [opcode]. Per-opcode execution counter.
    OpcodeCount,
    /// args: []. MONITOR address-range hint; no architectural effect here.
    Monitor,
    /// args: []. MWAIT treated as an architectural NOP.
    Mwait,
    /// args: [op]. SVM intercepts are checked by the decoder; the world
    /// switch itself belongs to an external collaborator.
    SvmDispatch,
    /// args: [seg, selector]. Loads a data segment register; descriptor
    /// walks in protected mode belong to the external collaborator.
    LoadSeg,
    /// args: [seg]. Returns the selector.
    SegSelector,
    /// args: [index]. Control-register read.
    ReadCr,
    /// args: [index, value]. Control-register write.
    WriteCr,
    /// args: [index]. Debug-register read.
    ReadDr,
    /// args: [index, value]. Debug-register write.
    WriteDr,
    /// args: [is_idt, base, limit]. LGDT/LIDT.
    LoadDtr,
    /// args: [is_idt]. Returns the descriptor-table base.
    DtrBase,
    /// args: [is_idt]. Returns the descriptor-table limit.
    DtrLimit,
    /// args: []. Swaps the GS base with the kernel GS base MSR.
    Swapgs,
    /// args: [next_eip]. Fast system call (long mode).
    Syscall,
    /// args: []. Fast system-call return.
    Sysret,
    /// args: [].
    Sysenter,
    /// args: [].
    Sysexit,
}

/// A single micro-op.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Marks the start of one guest instruction at `pc`.
    InsnStart { pc: u64 },
    Mov { dst: Temp, src: Temp },
    MovImm { dst: Temp, value: u64 },
    Binary { op: BinOp, dst: Temp, lhs: Temp, rhs: Temp },
    Unary { op: UnOp, dst: Temp, src: Temp },
    /// Full multiply: `(hi, lo) = lhs * rhs`, signed or unsigned.
    Mul2 { signed: bool, lo: Temp, hi: Temp, lhs: Temp, rhs: Temp },
    /// Insert the low `len` bits of `src` into `dst` at `pos`.
    Deposit { dst: Temp, src: Temp, pos: u8, len: u8 },
    /// Extract `len` bits of `src` at `pos` into `dst`.
    Extract { dst: Temp, src: Temp, pos: u8, len: u8, signed: bool },
    Setcond { cond: Cond, dst: Temp, lhs: Temp, rhs: Temp },
    Movcond { cond: Cond, dst: Temp, lhs: Temp, rhs: Temp, if_true: Temp, if_false: Temp },
    Brcond { cond: Cond, lhs: Temp, rhs: Temp, label: Label },
    Br { label: Label },
    SetLabel { label: Label },
    /// Guest load through the MMU index; zero- or sign-extends into `dst`.
    QemuLd { dst: Temp, addr: Temp, size: AccessSize, signed: bool, mem_idx: u8 },
    /// Guest store through the MMU index.
    QemuSt { src: Temp, addr: Temp, size: AccessSize, mem_idx: u8 },
    /// Chainable jump slot; the translation cache patches the slot once the
    /// target block exists.
    GotoTb { slot: u8 },
    /// Return to the dispatcher. `code` identifies the chaining slot (or
    /// carries a front-end-specific exit reason).
    ExitTb { code: u64 },
    /// Return to the dispatcher and never chain; the next block must be
    /// re-resolved (CSR writes, FENCE.I, mode changes).
    ExitTbNoChaining { code: u64 },
    /// Host-intrinsic atomic fetch-add; only emitted when the back-end
    /// advertises it.
    AtomicFetchAdd { size: AccessSize, dst: Temp, addr: Temp, value: Temp, mem_idx: u8 },
    /// Host-intrinsic compare-and-swap; `dst` receives the previous value.
    AtomicCmpxchg { size: AccessSize, dst: Temp, addr: Temp, expected: Temp, new_value: Temp, mem_idx: u8 },
    /// 128-bit compare-and-swap over (lo, hi) pairs.
    AtomicCmpxchg128 {
        dst: [Temp; 2],
        addr: Temp,
        expected: [Temp; 2],
        new_value: [Temp; 2],
        mem_idx: u8,
    },
    /// Call into a runtime helper.
    CallHelper { helper: HelperId, ret: Option<Temp>, args: Vec<Temp> },
    /// The value of the temporary becomes undefined.
    Discard { temp: Temp },
}

/// Builds the op list for one translation block. Constructed per block and
/// discarded at block end; the per-architecture register temporaries are
/// fields of the owning translator rather than process globals.
pub struct IrBuilder {
    ops: Vec<Op>,
    temps: Vec<TempKind>,
    labels: u32,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            temps: Vec::new(),
            labels: 0,
        }
    }

    /// Registers a global temporary aliasing guest CPU state.
    pub fn global(&mut self, id: u16) -> Temp {
        let temp = Temp(self.temps.len() as u32);
        self.temps.push(TempKind::Global(id));
        temp
    }

    /// Allocates a scratch temporary.
    pub fn temp_new(&mut self) -> Temp {
        let temp = Temp(self.temps.len() as u32);
        self.temps.push(TempKind::Local);
        temp
    }

    /// Allocates a scratch temporary holding a constant.
    pub fn constant(&mut self, value: u64) -> Temp {
        let temp = self.temp_new();
        self.push(Op::MovImm { dst: temp, value });
        temp
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    pub fn set_label(&mut self, label: Label) {
        self.push(Op::SetLabel { label });
    }

    pub fn temp_kind(&self, temp: Temp) -> TempKind {
        self.temps[temp.0 as usize]
    }

    pub fn temp_count(&self) -> usize {
        self.temps.len()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Consumes the builder, yielding the finished op list.
    pub fn finish(self) -> Vec<Op> {
        self.ops
    }

    fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn gen_insn_start(&mut self, pc: u64) {
        self.push(Op::InsnStart { pc });
    }

    pub fn gen_mov(&mut self, dst: Temp, src: Temp) {
        self.push(Op::Mov { dst, src });
    }

    pub fn gen_movi(&mut self, dst: Temp, value: u64) {
        self.push(Op::MovImm { dst, value });
    }

    pub fn gen_binary(&mut self, op: BinOp, dst: Temp, lhs: Temp, rhs: Temp) {
        self.push(Op::Binary { op, dst, lhs, rhs });
    }

    /// Two-operand form with an immediate right-hand side.
    pub fn gen_binary_imm(&mut self, op: BinOp, dst: Temp, lhs: Temp, value: u64) {
        let rhs = self.constant(value);
        self.push(Op::Binary { op, dst, lhs, rhs });
    }

    pub fn gen_add(&mut self, dst: Temp, lhs: Temp, rhs: Temp) {
        self.gen_binary(BinOp::Add, dst, lhs, rhs);
    }

    pub fn gen_addi(&mut self, dst: Temp, lhs: Temp, value: u64) {
        self.gen_binary_imm(BinOp::Add, dst, lhs, value);
    }

    pub fn gen_sub(&mut self, dst: Temp, lhs: Temp, rhs: Temp) {
        self.gen_binary(BinOp::Sub, dst, lhs, rhs);
    }

    pub fn gen_and(&mut self, dst: Temp, lhs: Temp, rhs: Temp) {
        self.gen_binary(BinOp::And, dst, lhs, rhs);
    }

    pub fn gen_andi(&mut self, dst: Temp, lhs: Temp, value: u64) {
        self.gen_binary_imm(BinOp::And, dst, lhs, value);
    }

    pub fn gen_or(&mut self, dst: Temp, lhs: Temp, rhs: Temp) {
        self.gen_binary(BinOp::Or, dst, lhs, rhs);
    }

    pub fn gen_ori(&mut self, dst: Temp, lhs: Temp, value: u64) {
        self.gen_binary_imm(BinOp::Or, dst, lhs, value);
    }

    pub fn gen_xor(&mut self, dst: Temp, lhs: Temp, rhs: Temp) {
        self.gen_binary(BinOp::Xor, dst, lhs, rhs);
    }

    pub fn gen_unary(&mut self, op: UnOp, dst: Temp, src: Temp) {
        self.push(Op::Unary { op, dst, src });
    }

    pub fn gen_ext32s(&mut self, dst: Temp, src: Temp) {
        self.gen_unary(UnOp::Ext32S, dst, src);
    }

    pub fn gen_ext32u(&mut self, dst: Temp, src: Temp) {
        self.gen_unary(UnOp::Ext32U, dst, src);
    }

    pub fn gen_mul2(&mut self, signed: bool, lo: Temp, hi: Temp, lhs: Temp, rhs: Temp) {
        self.push(Op::Mul2 { signed, lo, hi, lhs, rhs });
    }

    pub fn gen_deposit(&mut self, dst: Temp, src: Temp, pos: u8, len: u8) {
        self.push(Op::Deposit { dst, src, pos, len });
    }

    pub fn gen_extract(&mut self, dst: Temp, src: Temp, pos: u8, len: u8, signed: bool) {
        self.push(Op::Extract { dst, src, pos, len, signed });
    }

    pub fn gen_setcond(&mut self, cond: Cond, dst: Temp, lhs: Temp, rhs: Temp) {
        self.push(Op::Setcond { cond, dst, lhs, rhs });
    }

    pub fn gen_setcondi(&mut self, cond: Cond, dst: Temp, lhs: Temp, value: u64) {
        let rhs = self.constant(value);
        self.push(Op::Setcond { cond, dst, lhs, rhs });
    }

    pub fn gen_movcond(&mut self, cond: Cond, dst: Temp, lhs: Temp, rhs: Temp, if_true: Temp, if_false: Temp) {
        self.push(Op::Movcond { cond, dst, lhs, rhs, if_true, if_false });
    }

    pub fn gen_brcond(&mut self, cond: Cond, lhs: Temp, rhs: Temp, label: Label) {
        self.push(Op::Brcond { cond, lhs, rhs, label });
    }

    pub fn gen_brcondi(&mut self, cond: Cond, lhs: Temp, value: u64, label: Label) {
        let rhs = self.constant(value);
        self.push(Op::Brcond { cond, lhs, rhs, label });
    }

    pub fn gen_br(&mut self, label: Label) {
        self.push(Op::Br { label });
    }

    pub fn gen_qemu_ld(&mut self, dst: Temp, addr: Temp, size: AccessSize, signed: bool, mem_idx: u8) {
        self.push(Op::QemuLd { dst, addr, size, signed, mem_idx });
    }

    pub fn gen_qemu_st(&mut self, src: Temp, addr: Temp, size: AccessSize, mem_idx: u8) {
        self.push(Op::QemuSt { src, addr, size, mem_idx });
    }

    pub fn gen_goto_tb(&mut self, slot: u8) {
        self.push(Op::GotoTb { slot });
    }

    pub fn gen_exit_tb(&mut self, code: u64) {
        self.push(Op::ExitTb { code });
    }

    pub fn gen_exit_tb_no_chaining(&mut self, code: u64) {
        self.push(Op::ExitTbNoChaining { code });
    }

    pub fn gen_atomic_fetch_add(&mut self, size: AccessSize, dst: Temp, addr: Temp, value: Temp, mem_idx: u8) {
        self.push(Op::AtomicFetchAdd { size, dst, addr, value, mem_idx });
    }

    pub fn gen_atomic_cmpxchg(&mut self, size: AccessSize, dst: Temp, addr: Temp, expected: Temp, new_value: Temp, mem_idx: u8) {
        self.push(Op::AtomicCmpxchg { size, dst, addr, expected, new_value, mem_idx });
    }

    pub fn gen_atomic_cmpxchg_128(
        &mut self,
        dst: [Temp; 2],
        addr: Temp,
        expected: [Temp; 2],
        new_value: [Temp; 2],
        mem_idx: u8,
    ) {
        self.push(Op::AtomicCmpxchg128 { dst, addr, expected, new_value, mem_idx });
    }

    pub fn gen_helper(&mut self, helper: HelperId, ret: Option<Temp>, args: &[Temp]) {
        self.push(Op::CallHelper { helper, ret, args: args.to_vec() });
    }

    pub fn gen_discard(&mut self, temp: Temp) {
        self.push(Op::Discard { temp });
    }

    /// True when any emitted op calls the given helper. Used by tests to
    /// check that fast-path lowering avoided a slow helper.
    pub fn calls_helper(&self, helper: HelperId) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::CallHelper { helper: h, .. } if *h == helper))
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// True when any op in the list calls the given helper.
pub fn ops_call_helper(ops: &[Op], helper: HelperId) -> bool {
    ops.iter()
        .any(|op| matches!(op, Op::CallHelper { helper: h, .. } if *h == helper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_allocates_distinct_temps() {
        let mut ir = IrBuilder::new();
        let a = ir.global(3);
        let b = ir.temp_new();
        let c = ir.constant(7);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(ir.temp_kind(a), TempKind::Global(3));
        assert_eq!(ir.temp_kind(b), TempKind::Local);
        assert_eq!(ir.ops().len(), 1);
    }

    #[test]
    fn cond_inversion_round_trips() {
        for cond in [
            Cond::Eq,
            Cond::Ne,
            Cond::Lt,
            Cond::Ge,
            Cond::Le,
            Cond::Gt,
            Cond::Ltu,
            Cond::Geu,
            Cond::Leu,
            Cond::Gtu,
        ] {
            assert_eq!(cond.invert().invert(), cond);
            assert_ne!(cond.eval(1, 2), cond.invert().eval(1, 2));
        }
    }

    #[test]
    fn signed_and_unsigned_conditions_differ() {
        let minus_one = u64::MAX;
        assert!(Cond::Lt.eval(minus_one, 1));
        assert!(!Cond::Ltu.eval(minus_one, 1));
    }
}
