//! Abstract interpretation over the VM register file.
//!
//! Verification of one prototype is a fixed-point dataflow analysis: every
//! reachable instruction gets an entry state describing what is provable
//! about each register on every path that reaches it. Tracing an instruction
//! runs three phases - a one-time static validation of its operands against
//! the prototype's sizes, an abstract simulation producing its exit state,
//! and scheduling of its successors, merging the exit state into their entry
//! states. The merge is the lattice meet; whenever it narrows a state the
//! target is queued for re-tracing. The lattice is finite and the meet
//! monotone, so the worklist drains.

pub(crate) mod reg_state;

use reg_state::{Merge, RegWindow};
use tracing::{debug, trace};

use crate::decoder::{LuaType, MemoryGauge, Prototype, Unbounded};
use crate::error::{VerifyError, VerifyResult, ensure};
use crate::opcode::{ArgMode, Instruction, OpCode, OpMode};

/// Verify a decoded prototype tree.
///
/// Ok means every instruction reachable in the root prototype and all of its
/// children keeps the VM inside its invariants: no uninitialised register is
/// read, no index leaves its table, no jump leaves the instruction array, no
/// open upvalue loses its value.
pub fn verify(proto: &Prototype) -> VerifyResult<()> {
    verify_with(proto, &mut Unbounded)
}

/// [`verify`], with every allocation accounted against `gauge`.
pub fn verify_with(proto: &Prototype, gauge: &mut dyn MemoryGauge) -> VerifyResult<()> {
    // Children are verified iteratively so host stack depth never depends
    // on how deeply the chunk nests its prototypes.
    let mut pending = vec![proto];
    while let Some(p) = pending.pop() {
        Verifier::new(p, &mut *gauge)?.run()?;
        pending.extend(p.prototypes().iter());
    }
    debug!(
        instructions = proto.num_instructions(),
        children = proto.num_prototypes(),
        "prototype tree verified"
    );
    Ok(())
}

/// Per-instruction verification record.
struct InsState {
    /// Static validation has run for this instruction.
    seen: bool,
    /// The instruction is queued in the worklist.
    needs_tracing: bool,
    /// Merged entry state over all predecessors found so far; `None` until
    /// the instruction is first reached.
    regs: Option<RegWindow>,
}

struct Verifier<'a> {
    proto: &'a Prototype,
    gauge: &'a mut dyn MemoryGauge,
    ins: Vec<InsState>,
    /// Scratch exit state of the instruction currently being traced.
    next_regs: RegWindow,
    worklist: Vec<usize>,
}

/// Type of an RK operand: the constant's recorded type, or what the register
/// state can prove about the register.
fn rk_type(proto: &Prototype, regs: &RegWindow, rk: i32) -> LuaType {
    if Instruction::is_k(rk) {
        proto
            .constant_types
            .get(Instruction::rk_index(rk) as usize)
            .copied()
            .unwrap_or(LuaType::None)
    } else {
        let reg = rk as usize;
        if regs.is_number(reg) {
            LuaType::Number
        } else if regs.is_table(reg) {
            LuaType::Table
        } else {
            LuaType::None
        }
    }
}

/// Argument checks shared by CALL and TAILCALL: the callee and its arguments
/// must be known (up to the variable top when B is 0), and the call window
/// must not contain an open upvalue.
fn check_call_args(entry: &RegWindow, num_regs: usize, a: i32, b: i32) -> VerifyResult<()> {
    let base = a as usize;
    if b == 0 {
        ensure(entry.use_top(base + 1))?;
        ensure(entry.is_known(base))?;
    } else {
        ensure(entry.are_known(base, b as usize))?;
    }
    ensure(!entry.any_open(base, num_regs.saturating_sub(base)))
}

impl<'a> Verifier<'a> {
    fn new(proto: &'a Prototype, gauge: &'a mut dyn MemoryGauge) -> VerifyResult<Self> {
        ensure(proto.num_instructions() >= 1)?;
        ensure(proto.num_params() <= proto.num_regs())?;

        let count = proto.num_instructions();
        let num_regs = proto.num_regs() as usize;
        let record_bytes = count
            .checked_mul(std::mem::size_of::<InsState>())
            .ok_or(VerifyError::AllocationFailure)?;
        if !gauge.claim(record_bytes + 2 * (num_regs + std::mem::size_of::<RegWindow>())) {
            return Err(VerifyError::AllocationFailure);
        }

        let mut ins = Vec::new();
        ins.try_reserve_exact(count)
            .map_err(|_| VerifyError::AllocationFailure)?;
        ins.extend((0..count).map(|_| InsState {
            seen: false,
            needs_tracing: false,
            regs: None,
        }));

        // On entry only the parameters hold defined values.
        let mut entry = RegWindow::new(num_regs);
        for reg in 0..proto.num_params() as usize {
            entry.set_known(reg);
        }
        ins[0].regs = Some(entry);
        ins[0].needs_tracing = true;

        debug!(
            instructions = count,
            regs = num_regs,
            params = proto.num_params(),
            "verifying prototype"
        );
        Ok(Self {
            proto,
            gauge,
            ins,
            next_regs: RegWindow::new(num_regs),
            worklist: vec![0],
        })
    }

    fn run(&mut self) -> VerifyResult<()> {
        while let Some(pc) = self.worklist.pop() {
            self.step(pc)?;
        }
        Ok(())
    }

    fn step(&mut self, pc: usize) -> VerifyResult<()> {
        let (op, a, b, c) = self
            .proto
            .instruction(pc)
            .ok_or(VerifyError::VerificationRejected)?;
        trace!(pc, op = op.name(), "tracing");
        if !self.ins.get(pc).ok_or(VerifyError::Internal)?.seen {
            self.check_static(pc, op, a, b, c)?;
        }
        self.simulate(pc, op, a, b, c)?;
        self.schedule(pc, op, a, b, c)?;
        let ins = self.ins.get_mut(pc).ok_or(VerifyError::Internal)?;
        ins.seen = true;
        ins.needs_tracing = false;
        Ok(())
    }

    fn is_reg(&self, reg: i32) -> bool {
        reg >= 0 && (reg as usize) < self.proto.num_regs() as usize
    }

    fn is_const(&self, k: i32) -> bool {
        k >= 0 && (k as usize) < self.proto.num_constants()
    }

    fn is_upvalue(&self, upvalue: i32) -> bool {
        upvalue >= 0 && (upvalue as usize) < self.proto.num_upvalues()
    }

    /// If the instruction after `pc` exists and has the expected opcode,
    /// return its A (or Ax) field.
    fn next_op(&self, pc: usize, expected: OpCode) -> Option<i32> {
        let (op, a, _, _) = self.proto.instruction(pc + 1)?;
        (op == expected).then_some(a)
    }

    /// Validate an instruction's operands against the prototype's sizes.
    /// Runs once per instruction; register *state* is not consulted here.
    fn check_static(&self, pc: usize, op: OpCode, a: i32, b: i32, c: i32) -> VerifyResult<()> {
        use OpCode::*;

        if op.is_test() {
            ensure(self.next_op(pc, Jmp).is_some())?;
        }
        if op.sets_a() {
            ensure(self.is_reg(a))?;
        }
        match op.b_mode() {
            ArgMode::RegConst if op.mode() != OpMode::IABx => {
                if Instruction::is_k(b) {
                    ensure(self.is_const(Instruction::rk_index(b)))?;
                } else {
                    ensure(self.is_reg(b))?;
                }
            }
            ArgMode::Reg if op.mode() != OpMode::IAsBx => ensure(self.is_reg(b))?,
            _ => {}
        }
        match op.c_mode() {
            ArgMode::RegConst => {
                if Instruction::is_k(c) {
                    ensure(self.is_const(Instruction::rk_index(c)))?;
                } else {
                    ensure(self.is_reg(c))?;
                }
            }
            ArgMode::Reg => ensure(self.is_reg(c))?,
            _ => {}
        }

        match op {
            LoadK => {
                if b == 0 {
                    let k = self
                        .next_op(pc, ExtraArg)
                        .ok_or(VerifyError::VerificationRejected)?;
                    ensure(self.is_const(k))?;
                } else {
                    ensure(self.is_const(b - 1))?;
                }
            }
            LoadBool => ensure(b == 0 || b == 1)?,
            LoadNil => {
                ensure(self.is_reg(b))?;
                ensure(b >= a)?;
            }
            GetUpval | GetTabUp | SetUpval => ensure(self.is_upvalue(b))?,
            SetTabUp => ensure(self.is_upvalue(a))?,
            Self_ => {
                ensure(self.is_reg(a + 1))?;
                if Instruction::is_k(c) {
                    ensure(self.is_const(Instruction::rk_index(c)))?;
                } else {
                    ensure(self.is_reg(c))?;
                }
            }
            Concat => ensure(c > b)?,
            Call => {
                if c >= 3 {
                    ensure(self.is_reg(a + c - 2))?;
                }
                if b >= 2 {
                    ensure(self.is_reg(a + b - 1))?;
                }
            }
            TailCall => {
                if b >= 2 {
                    ensure(self.is_reg(a + b - 1))?;
                }
            }
            TForLoop => ensure(self.is_reg(a + 1))?,
            Return => {
                if b != 1 {
                    ensure(self.is_reg(a))?;
                }
                if b >= 3 {
                    ensure(self.is_reg(a + b - 2))?;
                }
            }
            Vararg => {
                ensure(self.proto.is_vararg())?;
                if b >= 3 {
                    ensure(self.is_reg(a + b - 2))?;
                }
            }
            TForCall => {
                ensure(self.is_reg(a + 2 + c))?;
                ensure(self.is_reg(a + 3))?;
            }
            ForLoop => ensure(self.is_reg(a + 3))?,
            ForPrep => ensure(self.is_reg(a + 2))?,
            SetList => {
                ensure(self.is_reg(a))?;
                if c == 0 {
                    ensure(self.next_op(pc, ExtraArg).is_some())?;
                }
            }
            Close => ensure(self.is_reg(a))?,
            // Neither is A-mode, but both simulate a read of R(A).
            Test | SetTable => ensure(self.is_reg(a))?,
            Closure => {
                ensure(b >= 0 && (b as usize) < self.proto.num_prototypes())?;
                let child = &self.proto.prototypes()[b as usize];
                for uv in child.upvalues() {
                    if uv.in_stack {
                        ensure(self.is_reg(uv.index as i32))?;
                    } else {
                        ensure(self.is_upvalue(uv.index as i32))?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Compute the exit state of the instruction into `next_regs`, failing
    /// on any read of a register not proven to hold a value.
    fn simulate(&mut self, pc: usize, op: OpCode, a: i32, b: i32, c: i32) -> VerifyResult<()> {
        use OpCode::*;

        // LOADK with Bx == 0 takes its constant index from the following
        // EXTRAARG; resolve it before register state is borrowed.
        let loadk_index = if op == LoadK && b == 0 {
            let k = self
                .next_op(pc, ExtraArg)
                .ok_or(VerifyError::VerificationRejected)?;
            ensure(self.is_const(k))?;
            k
        } else {
            b - 1
        };

        let proto = self.proto;
        let entry = self
            .ins
            .get(pc)
            .and_then(|i| i.regs.as_ref())
            .ok_or(VerifyError::Internal)?;
        let next = &mut self.next_regs;
        next.copy_from(entry);
        next.top_base = -1;

        // Common behaviour: an iABC operand naming a register is a read.
        if op.mode() == OpMode::IABC {
            let b_reads_reg = op.b_mode() == ArgMode::Reg
                || (op.b_mode() == ArgMode::RegConst && !Instruction::is_k(b));
            if b_reads_reg {
                ensure(entry.is_known(b as usize))?;
            }
            let c_reads_reg = op.c_mode() == ArgMode::Reg
                || (op.c_mode() == ArgMode::RegConst && !Instruction::is_k(c));
            if c_reads_reg {
                ensure(entry.is_known(c as usize))?;
            }
        }

        match op {
            Move => ensure(next.move_reg(a as usize, b as usize))?,

            LoadK => {
                let ty = proto
                    .constant_types
                    .get(loadk_index as usize)
                    .copied()
                    .ok_or(VerifyError::Internal)?;
                next.assignment(a as usize, ty);
            }

            LoadNil => {
                for reg in (a as usize)..=(b as usize) {
                    next.assignment(reg, LuaType::Nil);
                }
            }

            SetTable => ensure(entry.is_known(a as usize))?,

            NewTable => next.set_table(a as usize),

            Add | Sub | Mul | Div | Mod | Pow => {
                let dst = a as usize;
                next.set_known(dst);
                next.unset_table(dst);
                if rk_type(proto, entry, b) == LuaType::Number
                    && rk_type(proto, entry, c) == LuaType::Number
                {
                    next.set_number(dst);
                } else {
                    next.unset_number(dst);
                }
            }

            Unm => {
                let dst = a as usize;
                next.set_known(dst);
                next.unset_table(dst);
                if entry.is_number(b as usize) {
                    next.set_number(dst);
                } else {
                    next.unset_number(dst);
                }
            }

            Concat => {
                ensure(entry.are_known(b as usize, (c - b + 1) as usize))?;
                next.assignment(a as usize, LuaType::None);
            }

            Test => ensure(entry.is_known(a as usize))?,

            Call => {
                let base = a as usize;
                next.unset_known_from(base + 1);
                if c == 0 {
                    next.set_top(base);
                } else {
                    for reg in base..base + (c as usize - 1) {
                        next.assignment(reg, LuaType::None);
                    }
                }
                check_call_args(entry, proto.num_regs() as usize, a, b)?;
            }

            TailCall => {
                let base = a as usize;
                next.unset_known_from(base + 1);
                next.set_top(base);
                check_call_args(entry, proto.num_regs() as usize, a, b)?;
            }

            Return => {
                if b == 0 {
                    ensure(entry.use_top(a as usize))?;
                } else {
                    ensure(entry.are_known(a as usize, (b - 1) as usize))?;
                }
            }

            ForLoop => {
                ensure(entry.is_number(a as usize))?;
                ensure(entry.is_number(a as usize + 1))?;
                ensure(entry.is_number(a as usize + 2))?;
            }

            ForPrep => {
                for reg in (a as usize)..(a as usize + 3) {
                    ensure(entry.is_known(reg))?;
                    // FORPREP traps non-numeric loop state at runtime.
                    next.set_number(reg);
                }
            }

            TForCall => {
                let base = a as usize;
                next.unset_known_from(base + 4);
                let above = (proto.num_regs() as usize).saturating_sub(base + 3);
                ensure(!entry.any_open(base + 3, above))?;
                ensure(entry.are_known(base, 3))?;
                for reg in (base + 3)..=(base + 2 + c as usize) {
                    next.assignment(reg, LuaType::None);
                }
                // Shared with TFORLOOP: the iterator state must be defined.
                ensure(entry.is_known(base + 1))?;
            }

            TForLoop => ensure(entry.is_known(a as usize + 1))?,

            SetList => {
                ensure(entry.is_table(a as usize))?;
                if b == 0 {
                    ensure(entry.use_top(a as usize))?;
                }
                ensure(entry.are_known(a as usize + 1, b as usize))?;
            }

            Close => next.unset_open_from(a as usize),

            Closure => {
                let child = proto
                    .prototypes()
                    .get(b as usize)
                    .ok_or(VerifyError::Internal)?;
                next.assignment(a as usize, LuaType::Function);
                for uv in child.upvalues() {
                    if !uv.in_stack {
                        continue;
                    }
                    // The exit state is consulted, not the entry state: the
                    // closure may capture the register it was assigned to.
                    let reg = uv.index as usize;
                    ensure(next.is_known(reg))?;
                    next.set_open(reg);
                }
            }

            Vararg => {
                let base = a as usize;
                if b == 0 {
                    next.set_top(base);
                }
                for reg in base..base + (b as usize).saturating_sub(1) {
                    next.assignment(reg, LuaType::None);
                }
            }

            Self_ => {
                ensure(next.move_reg(a as usize + 1, b as usize))?;
                if !Instruction::is_k(c) {
                    ensure(next.is_known(c as usize))?;
                }
                next.assignment(a as usize, LuaType::None);
            }

            _ => {
                if op.sets_a() {
                    next.assignment(a as usize, LuaType::None);
                }
            }
        }

        Ok(())
    }

    /// Feed the exit state to every successor of the instruction.
    fn schedule(&mut self, pc: usize, op: OpCode, a: i32, b: i32, c: i32) -> VerifyResult<()> {
        use OpCode::*;
        match op {
            LoadBool => self.verify_next(pc, if c != 0 { 1 } else { 0 }),

            Return => Ok(()),

            TestSet => {
                self.verify_next(pc, 1)?;
                // The fall-through path is the one where the test passed and
                // R(B) was copied into R(A).
                ensure(self.next_regs.move_reg(a as usize, b as usize))?;
                self.verify_next(pc, 0)
            }

            ForLoop => {
                self.verify_next(pc, 0)?;
                // Into the loop body the control variable is refreshed.
                ensure(self.next_regs.move_reg(a as usize + 3, a as usize))?;
                self.default_successors(pc, op, b)
            }

            TForLoop => {
                self.verify_next(pc, 0)?;
                ensure(self.next_regs.move_reg(a as usize, a as usize + 1))?;
                self.default_successors(pc, op, b)
            }

            _ => self.default_successors(pc, op, b),
        }
    }

    fn default_successors(&mut self, pc: usize, op: OpCode, b: i32) -> VerifyResult<()> {
        if op.is_test() {
            self.verify_next(pc, 1)?;
        }
        let offset = if op.mode() == OpMode::IAsBx { b as i64 } else { 0 };
        self.verify_next(pc, offset)
    }

    /// Record `next_regs` as a predecessor contribution to the instruction
    /// `offset` past the next one, queueing it when its entry state is new
    /// or was narrowed by the merge.
    fn verify_next(&mut self, pc: usize, offset: i64) -> VerifyResult<()> {
        let target = pc as i64 + offset + 1;
        if target < 0 || target >= self.ins.len() as i64 {
            return Err(VerifyError::VerificationRejected);
        }
        let target = target as usize;

        if self.ins[target].regs.is_none() {
            let bytes = self.next_regs.len() + std::mem::size_of::<RegWindow>();
            if !self.gauge.claim(bytes) {
                return Err(VerifyError::AllocationFailure);
            }
            self.ins[target].regs = Some(self.next_regs.clone());
        } else {
            let regs = self.ins[target]
                .regs
                .as_mut()
                .ok_or(VerifyError::Internal)?;
            match regs.merge(&self.next_regs) {
                Merge::Incompatible => return Err(VerifyError::VerificationRejected),
                Merge::Unchanged => return Ok(()),
                Merge::Changed => trace!(target, "entry state narrowed, re-tracing"),
            }
        }

        if !self.ins[target].needs_tracing {
            self.ins[target].needs_tracing = true;
            self.worklist.push(target);
        }
        Ok(())
    }
}
