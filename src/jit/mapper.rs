//! Per-opcode translation from CIL to SPE instructions.
//!
//! The mapper owns the method being compiled and maintains the virtual
//! operand stack: stack slot `i` lives in register `LV0 + locals + args
//! + i`, local `i` in `LV0 + i`, and argument `i` (after the prologue
//! copy-in) in `LV0 + locals + i`. Scratch registers TMP0..TMP4 are free
//! within a single translation and never carry values across opcode
//! boundaries.
//!
//! Each opcode operation consumes the top stack slots produced by its
//! already-translated children, appends the implementing instruction
//! sequence, and pushes the result slot.

use super::codebuf::InstructionBuffer;
use super::compiler::{BranchFixup, CallFixup, CompileError, CompiledMethod};
use super::spu::{Reg, SpuAssembler};
use super::MAX_LV_REGISTERS;
use crate::ir::ValueType;

pub struct OpCodeMapper {
    method: CompiledMethod,
    locals: Vec<ValueType>,
    params: Vec<ValueType>,
    /// Virtual operand stack; the index is the slot, the element the
    /// cell type currently held there.
    stack: Vec<ValueType>,
    /// Quadword slots pushed to the memory frame so far.
    frame_depth: u32,
}

impl OpCodeMapper {
    pub fn new(name: &str, locals: Vec<ValueType>, params: Vec<ValueType>) -> Self {
        Self {
            method: CompiledMethod::new(name),
            locals,
            params,
            stack: Vec::new(),
            frame_depth: 0,
        }
    }

    /// Hand the finished method back to the compiler.
    pub fn finish(self) -> CompiledMethod {
        self.method
    }

    pub fn buf_mut(&mut self) -> &mut InstructionBuffer {
        &mut self.method.buf
    }

    /// Record that the IR instruction identified by `id` begins at the
    /// current buffer position.
    pub fn record_offset(&mut self, id: u32) {
        let at = self.method.buf.len();
        self.method.inst_offsets.insert(id, at);
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    // ==================== Depth accounting ====================

    fn permanent_slots(&self) -> usize {
        self.locals.len() + self.params.len()
    }

    fn total_depth(&self) -> usize {
        self.frame_depth as usize + self.stack.len()
    }

    fn note_depth(&mut self, depth: usize) {
        if depth as u32 > self.method.max_stack_depth {
            self.method.max_stack_depth = depth as u32;
        }
    }

    fn too_many_registers(&self) -> CompileError {
        CompileError::TooManyRegisters {
            method: self.method.name.clone(),
            locals: self.locals.len(),
            args: self.params.len(),
        }
    }

    // ==================== Virtual stack ====================

    /// The register materializing virtual stack slot `i`.
    fn stack_reg(&self, i: usize) -> Reg {
        Reg::lv(self.permanent_slots() + i)
    }

    /// Push a result slot of the given type and return its register.
    fn push_result(&mut self, ty: ValueType) -> Result<Reg, CompileError> {
        if self.stack.len() + 1 > MAX_LV_REGISTERS - self.permanent_slots() {
            return Err(self.too_many_registers());
        }
        let reg = self.stack_reg(self.stack.len());
        self.stack.push(ty);
        self.note_depth(self.total_depth());
        Ok(reg)
    }

    /// Pop the top slot; its register is free for reuse.
    fn pop_operand(&mut self) -> (Reg, ValueType) {
        let ty = self.stack.pop().expect("virtual operand stack underflow");
        (self.stack_reg(self.stack.len()), ty)
    }

    fn peek_operand(&self) -> (Reg, ValueType) {
        let top = *self.stack.last().expect("virtual operand stack underflow");
        (self.stack_reg(self.stack.len() - 1), top)
    }

    /// A transient register `k` slots above the stack top, for opcode
    /// translations that need more scratch than TMP0..TMP4. Covered by
    /// MaxStackDepth but never pushed.
    fn scratch_slot(&mut self, k: usize) -> Result<Reg, CompileError> {
        let index = self.stack.len() + k;
        if index + 1 > MAX_LV_REGISTERS - self.permanent_slots() {
            return Err(self.too_many_registers());
        }
        self.note_depth(self.frame_depth as usize + index + 1);
        Ok(self.stack_reg(index))
    }

    // ==================== Helper primitives ====================

    /// Store `reg` to the memory frame at the current stack depth and
    /// increment the depth.
    pub fn push_stack(&mut self, reg: Reg) {
        let depth = self.total_depth() as i32;
        SpuAssembler::new(&mut self.method.buf).stqd(reg, Reg::SP, depth);
        self.frame_depth += 1;
        self.note_depth(self.total_depth());
    }

    /// Reload `reg` from the memory frame, decrementing the depth.
    pub fn pop_stack(&mut self, reg: Reg) {
        self.frame_depth -= 1;
        let depth = self.total_depth() as i32;
        SpuAssembler::new(&mut self.method.buf).lqd(reg, Reg::SP, depth);
    }

    pub fn copy_register(&mut self, src: Reg, dst: Reg) {
        SpuAssembler::new(&mut self.method.buf).ori(dst, src, 0);
    }

    pub fn clear_register(&mut self, reg: Reg) {
        SpuAssembler::new(&mut self.method.buf).il(reg, 0);
    }

    /// The depth index the next virtual push would occupy.
    pub fn allocate_stack_slot(&self) -> usize {
        self.stack.len()
    }

    // ==================== Loads and constants ====================

    pub fn nop(&mut self) -> Result<(), CompileError> {
        SpuAssembler::new(&mut self.method.buf).nop();
        Ok(())
    }

    pub fn dup(&mut self) -> Result<(), CompileError> {
        let (src, ty) = self.peek_operand();
        let rt = self.push_result(ty)?;
        self.copy_register(src, rt);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<(), CompileError> {
        self.pop_operand();
        Ok(())
    }

    pub fn ldc_i4(&mut self, value: i32) -> Result<(), CompileError> {
        let rt = self.push_result(ValueType::Int32)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        if (i16::MIN as i32..=i16::MAX as i32).contains(&value) {
            asm.il(rt, value);
        } else {
            asm.ilhu(rt, (value >> 16) & 0xFFFF);
            asm.iohl(rt, value & 0xFFFF);
        }
        Ok(())
    }

    pub fn ldc_i8(&mut self, value: i64) -> Result<(), CompileError> {
        let rt = self.push_result(ValueType::Int64)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        if (i16::MIN as i64..=i16::MAX as i64).contains(&value) {
            asm.il(rt, value as i32);
        } else {
            // Build the high word, move it into place, or in the low word.
            let hi = (value >> 32) as i32;
            let lo = value as u32 as i32;
            asm.ilhu(rt, (hi >> 16) & 0xFFFF);
            asm.iohl(rt, hi & 0xFFFF);
            asm.shlqbyi(rt, rt, 4);
            asm.ilhu(Reg::TMP0, (lo >> 16) & 0xFFFF);
            asm.iohl(Reg::TMP0, lo & 0xFFFF);
            asm.or(rt, rt, Reg::TMP0);
        }
        Ok(())
    }

    pub fn ldloc(&mut self, index: u16) -> Result<(), CompileError> {
        let ty = self.locals[index as usize];
        let rt = self.push_result(ty)?;
        self.copy_register(Reg::lv(index as usize), rt);
        Ok(())
    }

    pub fn stloc(&mut self, index: u16) -> Result<(), CompileError> {
        let (src, _) = self.pop_operand();
        self.copy_register(src, Reg::lv(index as usize));
        Ok(())
    }

    pub fn ldarg(&mut self, index: u16) -> Result<(), CompileError> {
        let ty = self.params[index as usize];
        let rt = self.push_result(ty)?;
        self.copy_register(Reg::lv(self.locals.len() + index as usize), rt);
        Ok(())
    }

    pub fn starg(&mut self, index: u16) -> Result<(), CompileError> {
        let (src, _) = self.pop_operand();
        self.copy_register(src, Reg::lv(self.locals.len() + index as usize));
        Ok(())
    }

    // ==================== Arithmetic and logic ====================

    pub fn add(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let rt = self.push_result(at.widen(bt))?;
        SpuAssembler::new(&mut self.method.buf).a(rt, ra, rb);
        Ok(())
    }

    pub fn sub(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let rt = self.push_result(at.widen(bt))?;
        // sf computes rb - ra, so the subtrahend goes in ra.
        SpuAssembler::new(&mut self.method.buf).sf(rt, rb, ra);
        Ok(())
    }

    pub fn mul(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let ty = at.widen(bt);
        let rt = self.push_result(ty)?;
        match ty {
            ValueType::Int32 => {
                // The multiplier is 16x16; combine the three partial
                // products that land in the low 32 bits.
                let mut asm = SpuAssembler::new(&mut self.method.buf);
                asm.mpyh(Reg::TMP0, ra, rb);
                asm.mpyh(Reg::TMP1, rb, ra);
                asm.mpyu(rt, ra, rb);
                asm.a(Reg::TMP0, Reg::TMP0, Reg::TMP1);
                asm.a(rt, rt, Reg::TMP0);
            }
            ValueType::Int64 => self.mul_i64(ra, rb, rt)?,
        }
        Ok(())
    }

    /// 64x64 -> 64 multiply from four 16-bit lanes.
    ///
    /// With `a` split into halfwords `a0..a3` (`a3` low) and `b`
    /// likewise, the low 64 bits of the product are
    ///
    /// ```text
    /// a3*b3
    /// + (a3*b2 + a2*b3)                 << 16
    /// + (a3*b1 + a2*b2 + a1*b3)         << 32
    /// + (a2*b1 + a1*b2 + a3*b0 + a0*b3) << 48
    /// ```
    ///
    /// Carries out of bit 63 are discarded. The accumulator and one
    /// product temporary live in transient slots above the stack top;
    /// the slot directly above still holds the popped multiplier.
    fn mul_i64(&mut self, ra: Reg, rb: Reg, rt: Reg) -> Result<(), CompileError> {
        let acc = self.scratch_slot(1)?;
        let scr = self.scratch_slot(2)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);

        // a3*b3
        asm.mpyu(acc, ra, rb);

        // (a3*b2 + a2*b3) << 16
        asm.rotqmbyi(Reg::TMP0, ra, 2);
        asm.rotqmbyi(Reg::TMP1, rb, 2);
        asm.mpyu(Reg::TMP2, ra, Reg::TMP1);
        asm.mpyu(Reg::TMP3, Reg::TMP0, rb);
        asm.a(Reg::TMP2, Reg::TMP2, Reg::TMP3);
        asm.shlqbyi(Reg::TMP2, Reg::TMP2, 2);
        asm.a(acc, acc, Reg::TMP2);

        // (a3*b1 + a2*b2 + a1*b3) << 32
        asm.rotqmbyi(Reg::TMP2, ra, 4);
        asm.rotqmbyi(Reg::TMP3, rb, 4);
        asm.mpyu(Reg::TMP4, ra, Reg::TMP3);
        asm.mpyu(scr, Reg::TMP0, Reg::TMP1);
        asm.a(Reg::TMP4, Reg::TMP4, scr);
        asm.mpyu(scr, Reg::TMP2, rb);
        asm.a(Reg::TMP4, Reg::TMP4, scr);
        asm.shlqbyi(Reg::TMP4, Reg::TMP4, 4);
        asm.a(acc, acc, Reg::TMP4);

        // (a2*b1 + a1*b2 + a3*b0 + a0*b3) << 48
        asm.mpyu(Reg::TMP4, Reg::TMP0, Reg::TMP3);
        asm.mpyu(scr, Reg::TMP2, Reg::TMP1);
        asm.a(Reg::TMP4, Reg::TMP4, scr);
        asm.rotqmbyi(Reg::TMP0, rb, 6);
        asm.mpyu(Reg::TMP0, ra, Reg::TMP0);
        asm.a(Reg::TMP4, Reg::TMP4, Reg::TMP0);
        asm.rotqmbyi(Reg::TMP0, ra, 6);
        asm.mpyu(Reg::TMP0, Reg::TMP0, rb);
        asm.a(Reg::TMP4, Reg::TMP4, Reg::TMP0);
        asm.shlqbyi(Reg::TMP4, Reg::TMP4, 6);
        asm.a(acc, acc, Reg::TMP4);

        asm.ori(rt, acc, 0);
        Ok(())
    }

    pub fn neg(&mut self) -> Result<(), CompileError> {
        let (ra, ty) = self.pop_operand();
        let rt = self.push_result(ty)?;
        SpuAssembler::new(&mut self.method.buf).sfi(rt, ra, 0);
        Ok(())
    }

    pub fn not(&mut self) -> Result<(), CompileError> {
        let (ra, ty) = self.pop_operand();
        let rt = self.push_result(ty)?;
        SpuAssembler::new(&mut self.method.buf).nand(rt, ra, ra);
        Ok(())
    }

    pub fn and(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let rt = self.push_result(at.widen(bt))?;
        SpuAssembler::new(&mut self.method.buf).and(rt, ra, rb);
        Ok(())
    }

    pub fn or(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let rt = self.push_result(at.widen(bt))?;
        SpuAssembler::new(&mut self.method.buf).or(rt, ra, rb);
        Ok(())
    }

    pub fn xor(&mut self) -> Result<(), CompileError> {
        let (rb, bt) = self.pop_operand();
        let (ra, at) = self.pop_operand();
        let rt = self.push_result(at.widen(bt))?;
        SpuAssembler::new(&mut self.method.buf).xor(rt, ra, rb);
        Ok(())
    }

    pub fn shl(&mut self) -> Result<(), CompileError> {
        let (amount, _) = self.pop_operand();
        let (value, ty) = self.pop_operand();
        let rt = self.push_result(ty)?;
        SpuAssembler::new(&mut self.method.buf).shl(rt, value, amount);
        Ok(())
    }

    pub fn shr(&mut self) -> Result<(), CompileError> {
        let (amount, _) = self.pop_operand();
        let (value, ty) = self.pop_operand();
        let rt = self.push_result(ty)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        // rotma shifts right by the negated amount.
        asm.sfi(Reg::TMP0, amount, 0);
        asm.rotma(rt, value, Reg::TMP0);
        Ok(())
    }

    // ==================== Comparisons ====================

    pub fn ceq(&mut self) -> Result<(), CompileError> {
        let (rb, _) = self.pop_operand();
        let (ra, _) = self.pop_operand();
        let rt = self.push_result(ValueType::Int32)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        asm.ceq(rt, ra, rb);
        asm.andi(rt, rt, 1);
        Ok(())
    }

    pub fn cgt(&mut self) -> Result<(), CompileError> {
        let (rb, _) = self.pop_operand();
        let (ra, _) = self.pop_operand();
        let rt = self.push_result(ValueType::Int32)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        asm.cgt(rt, ra, rb);
        asm.andi(rt, rt, 1);
        Ok(())
    }

    pub fn clt(&mut self) -> Result<(), CompileError> {
        let (rb, _) = self.pop_operand();
        let (ra, _) = self.pop_operand();
        let rt = self.push_result(ValueType::Int32)?;
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        asm.cgt(rt, rb, ra);
        asm.andi(rt, rt, 1);
        Ok(())
    }

    // ==================== Conversions ====================

    pub fn conv_i4(&mut self) -> Result<(), CompileError> {
        let (ra, _) = self.pop_operand();
        let rt = self.push_result(ValueType::Int32)?;
        SpuAssembler::new(&mut self.method.buf).xswd(rt, ra);
        Ok(())
    }

    pub fn conv_i8(&mut self) -> Result<(), CompileError> {
        let (ra, _) = self.pop_operand();
        let rt = self.push_result(ValueType::Int64)?;
        SpuAssembler::new(&mut self.method.buf).xswd(rt, ra);
        Ok(())
    }

    // ==================== Branches ====================

    fn record_branch(&mut self, target: u32) {
        let site = self.method.buf.len();
        self.method.branch_fixups.push(BranchFixup { site, target });
    }

    pub fn br(&mut self, target: u32) -> Result<(), CompileError> {
        self.record_branch(target);
        SpuAssembler::new(&mut self.method.buf).br(0);
        Ok(())
    }

    pub fn brfalse(&mut self, target: u32) -> Result<(), CompileError> {
        let (ra, _) = self.pop_operand();
        self.record_branch(target);
        SpuAssembler::new(&mut self.method.buf).brz(ra, 0);
        Ok(())
    }

    pub fn brtrue(&mut self, target: u32) -> Result<(), CompileError> {
        let (ra, _) = self.pop_operand();
        self.record_branch(target);
        SpuAssembler::new(&mut self.method.buf).brnz(ra, 0);
        Ok(())
    }

    fn compare_branch(
        &mut self,
        target: u32,
        swap: bool,
        equal: bool,
        branch_on_set: bool,
    ) -> Result<(), CompileError> {
        let (rb, _) = self.pop_operand();
        let (ra, _) = self.pop_operand();
        let (x, y) = if swap { (rb, ra) } else { (ra, rb) };
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        if equal {
            asm.ceq(Reg::TMP0, x, y);
        } else {
            asm.cgt(Reg::TMP0, x, y);
        }
        self.record_branch(target);
        let mut asm = SpuAssembler::new(&mut self.method.buf);
        if branch_on_set {
            asm.brnz(Reg::TMP0, 0);
        } else {
            asm.brz(Reg::TMP0, 0);
        }
        Ok(())
    }

    pub fn beq(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, false, true, true)
    }

    pub fn bne(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, false, true, false)
    }

    pub fn blt(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, true, false, true)
    }

    pub fn ble(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, false, false, false)
    }

    pub fn bgt(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, false, false, true)
    }

    pub fn bge(&mut self, target: u32) -> Result<(), CompileError> {
        self.compare_branch(target, true, false, false)
    }

    // ==================== Calls and returns ====================

    /// Inter-method call: arguments move to the ABI registers, the
    /// branch goes to the call handler (patched by the linker), and the
    /// callee identity rides in the preceding register load.
    pub fn call(
        &mut self,
        callee: &str,
        args: u16,
        ret: Option<ValueType>,
    ) -> Result<(), CompileError> {
        let args = args as usize;
        assert!(args <= self.stack.len(), "call consumes more than the stack holds");
        let base = self.stack.len() - args;
        for i in 0..args {
            let src = self.stack_reg(base + i);
            self.copy_register(src, Reg::arg(i));
        }
        for _ in 0..args {
            self.pop_operand();
        }

        SpuAssembler::new(&mut self.method.buf).il(Reg::TMP0, 0);
        let site = self.method.buf.len();
        self.method.call_fixups.push(CallFixup {
            site,
            callee: callee.to_string(),
        });
        SpuAssembler::new(&mut self.method.buf).brsl(Reg::LR, 0);

        if let Some(ty) = ret {
            let rt = self.push_result(ty)?;
            self.copy_register(Reg::ARG0, rt);
        }
        Ok(())
    }

    /// Move the return value, if any, to the ABI return register.
    pub fn ret(&mut self) -> Result<(), CompileError> {
        if !self.stack.is_empty() {
            let (src, _) = self.pop_operand();
            self.copy_register(src, Reg::ARG0);
        }
        Ok(())
    }
}
