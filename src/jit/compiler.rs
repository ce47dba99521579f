//! Method compiler: drives translation of one IR method.
//!
//! Synthesizes the prologue and epilogue around the translated body,
//! preserves the callee-saved registers backing locals, arguments and
//! the virtual stack, walks the instruction trees in post-order, and
//! resolves intra-method branches once every target's native offset is
//! known. Frame-size immediates are patched last, when the peak stack
//! depth has been observed.

use super::mapper::OpCodeMapper;
use super::spu::{Reg, SpuAssembler};
use super::{codebuf::InstructionBuffer, MAX_LV_REGISTERS, REGISTER_SIZE};
use crate::ir::{CilOp, IrInstruction, IrMethod};
use std::collections::HashMap;

/// Branch target identity for `ret` instructions that are not in tail
/// position: they branch to the register-restoration sequence.
const EPILOGUE_TARGET: u32 = u32::MAX;

/// A pending intra-method branch patch.
#[derive(Debug, Clone)]
pub struct BranchFixup {
    /// Buffer index of the branch instruction.
    pub site: usize,
    /// IR identity (CIL offset) of the target instruction.
    pub target: u32,
}

/// A pending inter-method call patch, resolved by the linker.
#[derive(Debug, Clone)]
pub struct CallFixup {
    /// Buffer index of the branch-and-set-link instruction.
    pub site: usize,
    /// Callee identity.
    pub callee: String,
}

/// One translated method, ready for linking.
#[derive(Debug)]
pub struct CompiledMethod {
    pub name: String,
    pub buf: InstructionBuffer,
    /// IR identity -> index of the first SPE instruction emitted for it.
    pub inst_offsets: HashMap<u32, usize>,
    pub branch_fixups: Vec<BranchFixup>,
    pub call_fixups: Vec<CallFixup>,
    /// Peak stack depth in 16-byte slots, sizing the frame.
    pub max_stack_depth: u32,
}

impl CompiledMethod {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            buf: InstructionBuffer::new(),
            inst_offsets: HashMap::new(),
            branch_fixups: Vec::new(),
            call_fixups: Vec::new(),
            max_stack_depth: 0,
        }
    }
}

/// Errors aborting the compilation of one method. No partial output is
/// emitted: on error the method's buffer is discarded.
#[derive(Debug)]
pub enum CompileError {
    /// The translation table has no entry for the opcode.
    UnknownOpcode { opcode: &'static str },
    /// Locals plus arguments exceed the preserved-register window.
    TooManyRegisters {
        method: String,
        locals: usize,
        args: usize,
    },
    /// A branch displacement does not fit the 16-bit immediate.
    BranchOutOfRange { site: usize, target: usize },
    /// A branch names an IR offset that was never emitted.
    UnresolvedBranchTarget { target: u32 },
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnknownOpcode { opcode } => {
                write!(f, "unknown opcode: {}", opcode)
            }
            CompileError::TooManyRegisters {
                method,
                locals,
                args,
            } => write!(
                f,
                "method '{}' needs {} locals and {} arguments, exceeding the {} preserved registers",
                method, locals, args, MAX_LV_REGISTERS
            ),
            CompileError::BranchOutOfRange { site, target } => {
                write!(f, "branch displacement out of range: {} -> {}", site, target)
            }
            CompileError::UnresolvedBranchTarget { target } => {
                write!(f, "branch to unknown target offset {}", target)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Translates one IR method into a `CompiledMethod`.
pub struct MethodCompiler {
    trace: bool,
}

impl MethodCompiler {
    pub fn new() -> Self {
        Self { trace: false }
    }

    pub fn with_trace(trace: bool) -> Self {
        Self { trace }
    }

    pub fn compile(&self, method: &IrMethod) -> Result<CompiledMethod, CompileError> {
        let locals = method.locals.len();
        let args = method.params.len();
        if locals + args > MAX_LV_REGISTERS {
            return Err(CompileError::TooManyRegisters {
                method: method.name.clone(),
                locals,
                args,
            });
        }

        let mut mapper = OpCodeMapper::new(
            &method.name,
            method.locals.iter().map(|l| l.ty).collect(),
            method.params.iter().map(|p| p.ty).collect(),
        );

        // Prologue: save LR in the caller frame, store the back chain,
        // allocate the frame. The two frame-size immediates are patched
        // once the peak depth is known.
        {
            let mut asm = SpuAssembler::new(mapper.buf_mut());
            asm.stqd(Reg::LR, Reg::SP, 1);
            asm.stqd(Reg::SP, Reg::SP, 0);
            asm.ai(Reg::SP, Reg::SP, 0);
        }

        // Preserve the callee-saved slots backing locals and arguments.
        for i in 0..locals + args {
            mapper.push_stack(Reg::lv(i));
        }

        if method.init_locals {
            for i in 0..locals {
                mapper.clear_register(Reg::lv(i));
            }
        }

        // Arguments arrive in the volatile ABI registers; move them to
        // their permanent homes.
        for i in 0..args {
            mapper.copy_register(Reg::arg(i), Reg::lv(locals + i));
        }

        let last = method.body.len().saturating_sub(1);
        for (pos, inst) in method.body.iter().enumerate() {
            self.translate(&mut mapper, inst, pos == last)?;
        }

        // Restore the preserved registers in reverse order; early
        // returns branch here.
        mapper.record_offset(EPILOGUE_TARGET);
        for i in (0..locals + args).rev() {
            mapper.pop_stack(Reg::lv(i));
        }

        // Epilogue: release the frame, reload LR, return.
        let epilogue_ai = {
            let buf = mapper.buf_mut();
            let at = buf.len();
            let mut asm = SpuAssembler::new(buf);
            asm.ai(Reg::SP, Reg::SP, 0);
            asm.lqd(Reg::LR, Reg::SP, 1);
            asm.bi(Reg::LR);
            at
        };

        let mut compiled = mapper.finish();

        // Late stack-size patching, in 16-byte slots.
        let d = compiled.max_stack_depth as i32;
        compiled.buf.get_mut(1).imm = -(d * REGISTER_SIZE as i32 / 4);
        compiled.buf.get_mut(2).imm = -(d * REGISTER_SIZE as i32);
        compiled.buf.get_mut(epilogue_ai).imm = d * REGISTER_SIZE as i32 / 4;

        resolve_branches(&mut compiled)?;

        if self.trace {
            eprintln!(
                "[JIT] {}: {} instructions, max stack depth {}",
                compiled.name,
                compiled.buf.len(),
                compiled.max_stack_depth
            );
        }

        Ok(compiled)
    }

    /// Post-order translation: operand-producing children emit their
    /// code first, then the instruction's own native offset is recorded
    /// and its opcode dispatched.
    fn translate(
        &self,
        mapper: &mut OpCodeMapper,
        inst: &IrInstruction,
        tail: bool,
    ) -> Result<(), CompileError> {
        for child in &inst.children {
            self.translate(mapper, child, false)?;
        }
        mapper.record_offset(inst.offset);
        self.dispatch(mapper, inst, tail)
    }

    /// The opcode translation table.
    fn dispatch(
        &self,
        mapper: &mut OpCodeMapper,
        inst: &IrInstruction,
        tail: bool,
    ) -> Result<(), CompileError> {
        match &inst.op {
            CilOp::Nop => mapper.nop(),
            CilOp::Dup => mapper.dup(),
            CilOp::Pop => mapper.pop(),
            CilOp::LdcI4(v) => mapper.ldc_i4(*v),
            CilOp::LdcI8(v) => mapper.ldc_i8(*v),
            CilOp::Ldloc(i) => mapper.ldloc(*i),
            CilOp::Stloc(i) => mapper.stloc(*i),
            CilOp::Ldarg(i) => mapper.ldarg(*i),
            CilOp::Starg(i) => mapper.starg(*i),
            CilOp::Add => mapper.add(),
            CilOp::Sub => mapper.sub(),
            CilOp::Mul => mapper.mul(),
            CilOp::Neg => mapper.neg(),
            CilOp::Not => mapper.not(),
            CilOp::And => mapper.and(),
            CilOp::Or => mapper.or(),
            CilOp::Xor => mapper.xor(),
            CilOp::Shl => mapper.shl(),
            CilOp::Shr => mapper.shr(),
            CilOp::Ceq => mapper.ceq(),
            CilOp::Cgt => mapper.cgt(),
            CilOp::Clt => mapper.clt(),
            CilOp::ConvI4 => mapper.conv_i4(),
            CilOp::ConvI8 => mapper.conv_i8(),
            CilOp::Br(t) => mapper.br(*t),
            CilOp::Brfalse(t) => mapper.brfalse(*t),
            CilOp::Brtrue(t) => mapper.brtrue(*t),
            CilOp::Beq(t) => mapper.beq(*t),
            CilOp::Bne(t) => mapper.bne(*t),
            CilOp::Blt(t) => mapper.blt(*t),
            CilOp::Ble(t) => mapper.ble(*t),
            CilOp::Bgt(t) => mapper.bgt(*t),
            CilOp::Bge(t) => mapper.bge(*t),
            CilOp::Call { method, args, ret } => mapper.call(method, *args, *ret),
            CilOp::Ret => {
                mapper.ret()?;
                if !tail {
                    mapper.br(EPILOGUE_TARGET)?;
                }
                Ok(())
            }
            CilOp::Div | CilOp::Rem | CilOp::Ldstr(_) => Err(CompileError::UnknownOpcode {
                opcode: inst.op.mnemonic(),
            }),
        }
    }
}

impl Default for MethodCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve every pending branch to the recorded offset of its target,
/// writing the displacement in instruction units.
fn resolve_branches(method: &mut CompiledMethod) -> Result<(), CompileError> {
    for fixup in &method.branch_fixups {
        let target = *method
            .inst_offsets
            .get(&fixup.target)
            .ok_or(CompileError::UnresolvedBranchTarget {
                target: fixup.target,
            })?;
        let disp = target as i64 - fixup.site as i64;
        if disp < i16::MIN as i64 || disp > i16::MAX as i64 {
            return Err(CompileError::BranchOutOfRange {
                site: fixup.site,
                target,
            });
        }
        method.buf.get_mut(fixup.site).imm = disp as i32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LocalVar, Param, ValueType};
    use crate::jit::spu::Op;

    fn method(name: &str, body: Vec<IrInstruction>) -> IrMethod {
        IrMethod {
            name: name.to_string(),
            params: vec![],
            locals: vec![],
            init_locals: false,
            body,
        }
    }

    #[test]
    fn test_empty_method_shape() {
        let m = method("empty", vec![IrInstruction::new(0, CilOp::Ret)]);
        let compiled = MethodCompiler::new().compile(&m).unwrap();

        // Prologue and epilogue only.
        assert_eq!(compiled.buf.len(), 6);
        assert_eq!(compiled.max_stack_depth, 0);

        let insts = compiled.buf.as_slice();
        assert_eq!(insts[0].op, Op::Stqd);
        assert_eq!(insts[0].imm, 1);
        assert_eq!(insts[1].op, Op::Stqd);
        assert_eq!(insts[1].imm, 0);
        assert_eq!(insts[2].op, Op::Ai);
        assert_eq!(insts[2].imm, 0);
        assert_eq!(insts[3].op, Op::Ai);
        assert_eq!(insts[3].imm, 0);
        assert_eq!(insts[4].op, Op::Lqd);
        assert_eq!(insts[4].imm, 1);
        assert_eq!(insts[5].op, Op::Bi);
    }

    #[test]
    fn test_add_two_arguments() {
        let m = IrMethod {
            name: "add2".to_string(),
            params: vec![
                Param {
                    ty: ValueType::Int32,
                },
                Param {
                    ty: ValueType::Int32,
                },
            ],
            locals: vec![],
            init_locals: false,
            body: vec![
                IrInstruction::with_children(
                    4,
                    CilOp::Add,
                    vec![
                        IrInstruction::new(0, CilOp::Ldarg(0)),
                        IrInstruction::new(2, CilOp::Ldarg(1)),
                    ],
                ),
                IrInstruction::new(5, CilOp::Ret),
            ],
        };
        let compiled = MethodCompiler::new().compile(&m).unwrap();
        let insts = compiled.buf.as_slice();

        // Prologue, two preserves, two copy-ins, two ldarg moves, the
        // add, the return-value move, two restores, epilogue.
        assert_eq!(insts.len(), 16);
        assert_eq!(insts[3].op, Op::Stqd); // preserve $80
        assert_eq!(insts[4].op, Op::Stqd); // preserve $81
        assert_eq!(insts[5].op, Op::Ori); // $3 -> $80
        assert_eq!(insts[5].ra, Reg::arg(0));
        assert_eq!(insts[5].rt, Reg::lv(0));
        assert_eq!(insts[6].op, Op::Ori); // $4 -> $81
        assert_eq!(insts[9].op, Op::A);
        assert_eq!(insts[9].rt, Reg::lv(2));
        assert_eq!(insts[9].ra, Reg::lv(2));
        assert_eq!(insts[9].rb, Reg::lv(3));
        assert_eq!(insts[10].op, Op::Ori); // result -> $3
        assert_eq!(insts[10].rt, Reg::ARG0);
        assert_eq!(insts[11].op, Op::Lqd); // restore $81
        assert_eq!(insts[12].op, Op::Lqd); // restore $80

        // Two preserved slots plus two virtual slots at the peak.
        assert_eq!(compiled.max_stack_depth, 4);

        // Frame-size immediates per the late patch rules.
        assert_eq!(insts[1].imm, -(4 * 16 / 4));
        assert_eq!(insts[2].imm, -(4 * 16));
        assert_eq!(insts[insts.len() - 3].imm, 4 * 16 / 4);
    }

    #[test]
    fn test_locals_are_zero_initialized() {
        let m = IrMethod {
            name: "zi".to_string(),
            params: vec![],
            locals: vec![
                LocalVar {
                    ty: ValueType::Int32,
                },
                LocalVar {
                    ty: ValueType::Int32,
                },
            ],
            init_locals: true,
            body: vec![IrInstruction::new(0, CilOp::Ret)],
        };
        let compiled = MethodCompiler::new().compile(&m).unwrap();
        let insts = compiled.buf.as_slice();
        // After prologue and two preserves come the two clears.
        assert_eq!(insts[5].op, Op::Il);
        assert_eq!(insts[5].rt, Reg::lv(0));
        assert_eq!(insts[5].imm, 0);
        assert_eq!(insts[6].op, Op::Il);
        assert_eq!(insts[6].rt, Reg::lv(1));
    }

    #[test]
    fn test_too_many_registers() {
        let m = IrMethod {
            name: "big".to_string(),
            params: vec![],
            locals: vec![
                LocalVar {
                    ty: ValueType::Int32
                };
                48
            ],
            init_locals: false,
            body: vec![IrInstruction::new(0, CilOp::Ret)],
        };
        let err = MethodCompiler::new().compile(&m).unwrap_err();
        match err {
            CompileError::TooManyRegisters {
                method,
                locals,
                args,
            } => {
                assert_eq!(method, "big");
                assert_eq!(locals, 48);
                assert_eq!(args, 0);
            }
            other => panic!("expected TooManyRegisters, got {}", other),
        }
    }

    #[test]
    fn test_unknown_opcode() {
        let m = method(
            "bad",
            vec![
                IrInstruction::with_children(
                    8,
                    CilOp::Pop,
                    vec![IrInstruction::with_children(
                        4,
                        CilOp::Div,
                        vec![
                            IrInstruction::new(0, CilOp::LdcI4(6)),
                            IrInstruction::new(1, CilOp::LdcI4(3)),
                        ],
                    )],
                ),
                IrInstruction::new(9, CilOp::Ret),
            ],
        );
        let err = MethodCompiler::new().compile(&m).unwrap_err();
        match err {
            CompileError::UnknownOpcode { opcode } => assert_eq!(opcode, "div"),
            other => panic!("expected UnknownOpcode, got {}", other),
        }
    }

    #[test]
    fn test_branch_resolution() {
        // 0: ldc 1; 2: brtrue 7; 4: ldc 2; 5: pop; 7: ret.
        let m = method(
            "b",
            vec![
                IrInstruction::with_children(
                    2,
                    CilOp::Brtrue(7),
                    vec![IrInstruction::new(0, CilOp::LdcI4(1))],
                ),
                IrInstruction::with_children(
                    5,
                    CilOp::Pop,
                    vec![IrInstruction::new(4, CilOp::LdcI4(2))],
                ),
                IrInstruction::new(7, CilOp::Ret),
            ],
        );
        let compiled = MethodCompiler::new().compile(&m).unwrap();
        let site = compiled.branch_fixups[0].site;
        let target = compiled.inst_offsets[&7];
        assert_eq!(compiled.buf.get(site).op, Op::Brnz);
        assert_eq!(compiled.buf.get(site).imm, (target - site) as i32);
    }

    #[test]
    fn test_backward_branch_is_negative() {
        // 0: nop; 1: br 0.
        let m = method(
            "loopy",
            vec![
                IrInstruction::new(0, CilOp::Nop),
                IrInstruction::new(1, CilOp::Br(0)),
                IrInstruction::new(2, CilOp::Ret),
            ],
        );
        let compiled = MethodCompiler::new().compile(&m).unwrap();
        let site = compiled.branch_fixups[0].site;
        assert!(compiled.buf.get(site).imm < 0);
    }

    #[test]
    fn test_unresolved_branch_target() {
        let m = method(
            "dangling",
            vec![
                IrInstruction::new(0, CilOp::Br(999)),
                IrInstruction::new(1, CilOp::Ret),
            ],
        );
        let err = MethodCompiler::new().compile(&m).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnresolvedBranchTarget { target: 999 }
        ));
    }

    #[test]
    fn test_branch_out_of_range() {
        // A forward branch over ~40000 instructions overflows the
        // 16-bit displacement.
        let mut body = vec![IrInstruction::new(0, CilOp::Br(1_000_000))];
        for i in 0..40_000u32 {
            body.push(IrInstruction::new(1 + i, CilOp::Nop));
        }
        body.push(IrInstruction::new(1_000_000, CilOp::Ret));
        let m = method("far", body);
        let err = MethodCompiler::new().compile(&m).unwrap_err();
        assert!(matches!(err, CompileError::BranchOutOfRange { .. }));
    }

    #[test]
    fn test_early_ret_branches_to_restoration() {
        // 0: ldc 1; 2: brtrue 8; 4: ret; 8: ret.
        let m = method(
            "early",
            vec![
                IrInstruction::with_children(
                    2,
                    CilOp::Brtrue(8),
                    vec![IrInstruction::new(0, CilOp::LdcI4(1))],
                ),
                IrInstruction::new(4, CilOp::Ret),
                IrInstruction::new(8, CilOp::Ret),
            ],
        );
        let compiled = MethodCompiler::new().compile(&m).unwrap();
        // The early ret emitted a branch to the restoration point.
        let early_branch = compiled
            .branch_fixups
            .iter()
            .find(|fx| fx.target == u32::MAX)
            .expect("early ret records an epilogue branch");
        let disp = compiled.buf.get(early_branch.site).imm;
        assert!(disp > 0);
        assert_eq!(
            early_branch.site + disp as usize,
            compiled.inst_offsets[&u32::MAX]
        );
    }
}
