//! Whole-program linker and emitter.
//!
//! Lays the image out as bootloader, call handler, then every compiled
//! method in input order; records each method's base offset; patches the
//! bootloader's entry branch and every inter-method call site; and
//! serializes the result as a big-endian instruction stream, an optional
//! assembly listing, or an ELF executable.

use super::bootloader::{self, ENTRY_BRANCH_FROM_END};
use super::codebuf::InstructionBuffer;
use super::compiler::CompiledMethod;
use super::elf;
use super::BOOTLOADER_START_OFFSET;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

/// Errors aborting a link pass.
#[derive(Debug)]
pub enum LinkError {
    /// A call fixup references a method outside the input set.
    MissingCallee { caller: String, callee: String },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::MissingCallee { caller, callee } => {
                write!(f, "method '{}' calls unknown method '{}'", caller, callee)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// A linked, write-once program image.
#[derive(Debug)]
pub struct Image {
    buf: InstructionBuffer,
    /// Method base offsets in instruction units, in input order.
    pub method_offsets: Vec<(String, usize)>,
    /// Offset of the call-handler trampoline, in instruction units.
    pub callhandler_offset: usize,
    /// Offset of the entry method, in instruction units.
    pub entry_offset: usize,
}

impl Image {
    /// Total image length in instructions.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total image length in bytes, for host-side validation against
    /// the 256 KB local store.
    pub fn byte_len(&self) -> usize {
        self.buf.byte_len()
    }

    pub fn instructions(&self) -> &InstructionBuffer {
        &self.buf
    }

    /// Write the raw big-endian instruction stream.
    pub fn write_binary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.buf.serialize(w)
    }

    /// Write a textual listing, one mnemonic per line, with a
    /// `# Function entry` marker before each method's first instruction.
    pub fn write_asm<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let marks: HashSet<usize> = self.method_offsets.iter().map(|(_, at)| *at).collect();
        for (i, inst) in self.buf.iter().enumerate() {
            if marks.contains(&i) {
                writeln!(w, "# Function entry")?;
            }
            writeln!(w, "{}", inst)?;
        }
        Ok(())
    }

    /// Write the image framed as an SPE ELF executable.
    pub fn write_elf<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut blob = Vec::with_capacity(self.byte_len());
        self.buf.serialize(&mut blob)?;
        elf::write(w, &blob, BOOTLOADER_START_OFFSET as u32)
    }
}

/// Assembles compiled methods into a program image.
pub struct Linker {
    trace: bool,
}

impl Linker {
    pub fn new() -> Self {
        Self { trace: false }
    }

    pub fn with_trace(trace: bool) -> Self {
        Self { trace }
    }

    /// Link the methods, in input order; the first is the entry point.
    pub fn link(&self, mut methods: Vec<CompiledMethod>) -> Result<Image, LinkError> {
        let mut out = InstructionBuffer::new();

        out.extend_from(&bootloader::bootloader());

        let callhandler_offset = out.len();
        out.extend_from(&bootloader::call_handler());

        let entry_offset = out.len();

        // Patch the bootloader's entry branch. The patched slot sits
        // two instructions before the handler, hence the +2.
        let slot = callhandler_offset - ENTRY_BRANCH_FROM_END;
        out.get_mut(slot).imm = (entry_offset as i32 - callhandler_offset as i32) + 2;

        // Lay out the methods and build the identity table.
        let mut method_offsets = Vec::with_capacity(methods.len());
        let mut table: HashMap<String, usize> = HashMap::new();
        let mut base = entry_offset;
        for (index, method) in methods.iter().enumerate() {
            method_offsets.push((method.name.clone(), base));
            table.insert(method.name.clone(), index);
            base += method.buf.len();
        }

        // Resolve call fixups: the branch targets the call handler, and
        // the neighbouring register load carries the callee identity for
        // host-side resolution.
        for (index, method) in methods.iter_mut().enumerate() {
            let method_base = method_offsets[index].1;
            for fixup in &method.call_fixups {
                let callee_index = *table.get(&fixup.callee).ok_or_else(|| {
                    LinkError::MissingCallee {
                        caller: method.name.clone(),
                        callee: fixup.callee.clone(),
                    }
                })?;
                let site = method_base + fixup.site;
                method.buf.get_mut(fixup.site).imm =
                    callhandler_offset as i32 - site as i32;
                method.buf.get_mut(fixup.site - 1).imm = callee_index as i32;
            }
        }

        for method in &methods {
            out.extend_from(&method.buf);
        }

        if self.trace {
            eprintln!(
                "[JIT] linked {} methods: {} instructions ({} bytes), entry at byte {}",
                methods.len(),
                out.len(),
                out.byte_len(),
                BOOTLOADER_START_OFFSET
            );
        }

        Ok(Image {
            buf: out,
            method_offsets,
            callhandler_offset,
            entry_offset,
        })
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}
