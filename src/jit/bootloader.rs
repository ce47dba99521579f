//! Handwritten bootloader and call-handler sequences.
//!
//! The bootloader heads every image. Its first four instruction slots
//! are reserved: slot 0 is a trap serving as null-pointer canary, slot 1
//! holds the argument count, slot 2 the local-store address of the
//! argument vector (both populated by the host before execution), and
//! slot 3 is padding. Execution starts at byte offset 16.
//!
//! The argument loop is self-modifying: one load instruction's target
//! register field is incremented between iterations so consecutive
//! 16-byte argument values land in consecutive argument registers. The
//! pristine quadword is saved before the loop and stored back before any
//! control-flow exit, so the bootloader is re-entrant.

use super::codebuf::InstructionBuffer;
use super::spu::{Inst, Reg, SpuAssembler};
use super::INITIAL_SP;

/// Reserved instruction slots at the head of the image.
pub const RESERVED_WORDS: usize = 4;

/// The patched entry branch sits this many slots before the bootloader
/// end; the linker's `+2` displacement adjustment accounts for it.
pub const ENTRY_BRANCH_FROM_END: usize = 2;

/// Word index of the self-modified load; must stay quadword-aligned so
/// the load-modify-store cycle touches exactly one quad.
const PATCH_WORD: usize = 16;

/// Build the bootloader sequence.
pub fn bootloader() -> InstructionBuffer {
    let mut buf = InstructionBuffer::with_capacity(30);

    {
        let mut asm = SpuAssembler::new(&mut buf);
        asm.stop(); // 0: null-pointer canary
    }
    buf.push(Inst::word(0)); // 1: argument count
    buf.push(Inst::word(0)); // 2: argument vector address
    buf.push(Inst::word(0)); // 3: padding

    let mut asm = SpuAssembler::new(&mut buf);

    // 4: establish the stack at the top of local store.
    asm.ilhu(Reg::SP, (INITIAL_SP >> 16) as i32);
    asm.iohl(Reg::SP, (INITIAL_SP & 0xFFFF) as i32);

    // 6: fetch the argument descriptor from the reserved header.
    asm.il(Reg::TMP0, 0);
    asm.lqd(Reg::TMP1, Reg::TMP0, 0);
    asm.rotqbyi(Reg::TMP2, Reg::TMP1, 4); // argument count
    asm.rotqbyi(Reg::TMP3, Reg::TMP1, 8); // argument vector address

    // 10: save a pristine copy of the quad holding the patched load.
    asm.il(Reg::TMP0, (PATCH_WORD * 4) as i32);
    asm.lqd(Reg::TMP4, Reg::TMP0, 0);

    // 12: no arguments, skip the loop (to the restore at word 26).
    asm.brz(Reg::TMP2, 14);
    asm.nop(); // 13: keep the patched quad aligned
    asm.nop();
    asm.nop();

    // 16: the self-modified load; its target register field advances by
    // one each iteration. The three trailing slots of the quad are nops
    // whose register fields absorb the same increment harmlessly.
    asm.lqd(Reg::ARG0, Reg::TMP3, 0);
    asm.nop();
    asm.nop();
    asm.nop();

    // 20: advance to the next argument and bump the load's target.
    asm.ai(Reg::TMP3, Reg::TMP3, 16);
    asm.ai(Reg::TMP2, Reg::TMP2, -1);
    asm.lqd(Reg::TMP1, Reg::TMP0, 0);
    asm.ai(Reg::TMP1, Reg::TMP1, 1);
    asm.stqd(Reg::TMP1, Reg::TMP0, 0);
    asm.brnz(Reg::TMP2, -9); // 25: loop (to word 16)

    // 26: restore the pristine quad before leaving the loop.
    asm.stqd(Reg::TMP4, Reg::TMP0, 0);
    asm.nop();

    // 28: enter the program; displacement patched by the linker.
    asm.brsl(Reg::LR, 0);
    asm.stop(); // 29: the entry method returned

    buf
}

/// Build the call-handler trampoline.
///
/// Every inter-method call branches here. Host-assisted resolution is
/// not implemented, so the handler is a single trap.
pub fn call_handler() -> InstructionBuffer {
    let mut buf = InstructionBuffer::with_capacity(1);
    SpuAssembler::new(&mut buf).stop();
    buf
}
