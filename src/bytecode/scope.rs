use std::collections::HashMap;
use std::mem;

use log::trace;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{Instr, JumpCond, LoopTarget};
use crate::bytecode::table::SymbolTable;
use crate::lang::value::Value;

// =============================================================================
// SCOPE - Chunks of generated code, one per lexical scope
// =============================================================================
//
// Chunks live in an arena and refer to their parents by id, so the chain of
// scopes never forms an ownership cycle. Every address a chunk emits is
// relative to the chunk's own start; `merge` rebases absolute address pushes
// as the chunk is folded into its parent, which is what keeps jump targets
// intact when instruction regions are concatenated.

/// Handle to a chunk inside a [`ChunkArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkId(usize);

/// Deferred binding of a function name.
///
/// The variable slot is issued when the declaration is first seen; the entry
/// address is filled in once the body has been generated, so a body that
/// refers to its own name compiles before the address exists.
#[derive(Debug, Clone)]
pub struct ValueLink {
    pub addr: u16,
    pub entry: Option<u16>,
    pub arity: u8,
}

/// What a name resolves to when walking the scope chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A plain variable slot.
    Slot(u16),
    /// A function link: the slot holding the callable, plus the entry address
    /// when the body has already been laid out.
    Fn {
        addr: u16,
        entry: Option<u16>,
        arity: u8,
    },
}

impl Binding {
    pub fn addr(&self) -> u16 {
        match self {
            Binding::Slot(addr) => *addr,
            Binding::Fn { addr, .. } => *addr,
        }
    }
}

#[derive(Debug, Default)]
struct Chunk {
    parent: Option<ChunkId>,
    temporary: bool,
    code: Vec<Instr>,
    byte_len: usize,
    locals: HashMap<String, u16>,
    links: HashMap<String, ValueLink>,
}

impl Chunk {
    fn has_own(&self, name: &str) -> bool {
        self.locals.contains_key(name) || self.links.contains_key(name)
    }
}

/// Arena of scope chunks for one compilation unit.
#[derive(Debug, Default)]
pub struct ChunkArena {
    chunks: Vec<Chunk>,
}

impl ChunkArena {
    pub fn new() -> Self {
        ChunkArena::default()
    }

    /// Create a chunk. `parent` is the *logical* parent used for name lookups
    /// and duplicate checks; a temporary chunk may be merged into a different
    /// chunk than its parent.
    pub fn new_chunk(&mut self, parent: Option<ChunkId>, temporary: bool) -> ChunkId {
        let id = ChunkId(self.chunks.len());
        self.chunks.push(Chunk {
            parent,
            temporary,
            ..Chunk::default()
        });
        id
    }

    pub fn byte_len(&self, id: ChunkId) -> usize {
        self.chunks[id.0].byte_len
    }

    pub fn code(&self, id: ChunkId) -> &[Instr] {
        &self.chunks[id.0].code
    }

    pub fn emit(&mut self, id: ChunkId, instr: Instr) {
        let chunk = &mut self.chunks[id.0];
        chunk.byte_len += instr.encoded_len();
        chunk.code.push(instr);
    }

    // =========================================================================
    // Declarations and lookups
    // =========================================================================

    /// Declare a variable in `id`, issuing a fresh slot.
    ///
    /// Fails with `DuplicateIdentifier` when the name already exists in this
    /// chunk or - for a temporary chunk - in the logical parent's own maps:
    /// a temporary chunk's names will share the parent's namespace once the
    /// chunk is folded in.
    pub fn declare(
        &mut self,
        id: ChunkId,
        name: &str,
        init: Value,
        table: &mut SymbolTable,
    ) -> Result<u16, CompileError> {
        self.check_duplicate(id, name)?;

        let addr = table.declare_var(name, init)?;
        self.chunks[id.0].locals.insert(name.to_string(), addr);
        Ok(addr)
    }

    /// Declare a function name: a fresh slot plus a link whose entry address
    /// is filled in later via [`ChunkArena::set_link_entry`].
    pub fn declare_fn(
        &mut self,
        id: ChunkId,
        name: &str,
        arity: u8,
        table: &mut SymbolTable,
    ) -> Result<u16, CompileError> {
        self.check_duplicate(id, name)?;

        let addr = table.declare_var(name, Value::Null)?;
        self.chunks[id.0].links.insert(
            name.to_string(),
            ValueLink {
                addr,
                entry: None,
                arity,
            },
        );
        Ok(addr)
    }

    pub fn set_link_entry(
        &mut self,
        id: ChunkId,
        name: &str,
        entry: u16,
    ) -> Result<(), CompileError> {
        match self.chunks[id.0].links.get_mut(name) {
            Some(link) => {
                link.entry = Some(entry);
                Ok(())
            }
            None => Err(CompileError::internal(format!(
                "no link registered for '{}'",
                name
            ))),
        }
    }

    /// Return the existing binding reachable through the parent chain, or
    /// declare a new slot in `id`.
    pub fn declare_or_get(
        &mut self,
        id: ChunkId,
        name: &str,
        table: &mut SymbolTable,
    ) -> Result<u16, CompileError> {
        match self.lookup(id, name) {
            Ok(binding) => Ok(binding.addr()),
            Err(_) => self.declare(id, name, Value::Null, table),
        }
    }

    /// Walk the parent chain for `name`.
    pub fn lookup(&self, id: ChunkId, name: &str) -> Result<Binding, CompileError> {
        let mut cursor = Some(id);

        while let Some(cur) = cursor {
            let chunk = &self.chunks[cur.0];

            if let Some(link) = chunk.links.get(name) {
                return Ok(Binding::Fn {
                    addr: link.addr,
                    entry: link.entry,
                    arity: link.arity,
                });
            }
            if let Some(addr) = chunk.locals.get(name) {
                return Ok(Binding::Slot(*addr));
            }

            cursor = chunk.parent;
        }

        Err(CompileError::missing(name))
    }

    fn check_duplicate(&self, id: ChunkId, name: &str) -> Result<(), CompileError> {
        let chunk = &self.chunks[id.0];

        if chunk.has_own(name) {
            return Err(CompileError::duplicate(name));
        }
        if chunk.temporary {
            if let Some(parent) = chunk.parent {
                if self.chunks[parent.0].has_own(name) {
                    return Err(CompileError::duplicate(name));
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Append `child`'s instructions to `parent`, rebasing every absolute
    /// address push by `parent`'s current byte length.
    ///
    /// The child's addresses were computed against its own empty buffer;
    /// once its bytes land after `parent`'s existing bytes, only the
    /// `PushAddr` operands need correcting - relative jumps and function
    /// entry addresses (already absolute within the callable region) are
    /// copied unchanged. The child is left hollow.
    pub fn merge(&mut self, parent: ChunkId, child: ChunkId) -> Result<(), CompileError> {
        let child_code = mem::take(&mut self.chunks[child.0].code);
        self.chunks[child.0].byte_len = 0;

        let base = self.chunks[parent.0].byte_len;
        let mut rebased = 0usize;

        for mut instr in child_code {
            if let Instr::PushAddr(addr) = &mut instr {
                let target = *addr as usize + base;
                if target > u16::MAX as usize {
                    return Err(CompileError::too_large("jump target address"));
                }
                *addr = target as u16;
                rebased += 1;
            }

            let len = instr.encoded_len();
            let chunk = &mut self.chunks[parent.0];
            chunk.code.push(instr);
            chunk.byte_len += len;
        }

        trace!(
            "merge: chunk {} into {} at base {} ({} address pushes rebased)",
            child.0, parent.0, base, rebased
        );
        Ok(())
    }

    /// Like [`ChunkArena::merge`], but also fold the child's declared names
    /// and links into `parent`'s own namespace. Used for branch arms that
    /// were generated in isolation but belong to the enclosing scope.
    pub fn merge_temporary(&mut self, parent: ChunkId, child: ChunkId) -> Result<(), CompileError> {
        let locals = mem::take(&mut self.chunks[child.0].locals);
        let links = mem::take(&mut self.chunks[child.0].links);

        self.merge(parent, child)?;

        let chunk = &mut self.chunks[parent.0];
        for (name, addr) in locals {
            if chunk.has_own(&name) {
                return Err(CompileError::duplicate(name));
            }
            chunk.locals.insert(name, addr);
        }
        for (name, link) in links {
            if chunk.has_own(&name) {
                return Err(CompileError::duplicate(name));
            }
            chunk.links.insert(name, link);
        }

        Ok(())
    }

    // =========================================================================
    // Loop label resolution
    // =========================================================================

    /// Resolve symbolic loop jumps against the loop brackets present in this
    /// chunk's buffer.
    ///
    /// A single forward scan tracks, per loop-start marker, the offset just
    /// after the marker and the offset of its matching end marker. Each
    /// symbolic jump whose nearest enclosing bracket pair is complete is
    /// rewritten into a push-address plus stack-target jump of identical
    /// total byte length, so no other offset in the buffer shifts. Jumps
    /// whose enclosing loop is still open are left in place; they resolve on
    /// a later pass over an ancestor chunk.
    pub fn resolve_loop_labels(&mut self, id: ChunkId) -> Result<(), CompileError> {
        let code = mem::take(&mut self.chunks[id.0].code);

        let mut offsets = Vec::with_capacity(code.len());
        let mut off = 0usize;
        for instr in &code {
            offsets.push(off);
            off += instr.encoded_len();
        }

        // Match each start marker to its end marker's offset up front.
        let mut ends: HashMap<usize, usize> = HashMap::new();
        let mut open: Vec<usize> = Vec::new();
        for (i, instr) in code.iter().enumerate() {
            match instr {
                Instr::LoopStart => open.push(i),
                Instr::LoopEnd => {
                    if let Some(start) = open.pop() {
                        ends.insert(start, offsets[i]);
                    }
                }
                _ => {}
            }
        }

        let mut out = Vec::with_capacity(code.len());
        let mut frames: Vec<Option<(usize, usize)>> = Vec::new();
        let mut resolved = 0usize;

        for (i, instr) in code.into_iter().enumerate() {
            match instr {
                Instr::LoopStart => {
                    let frame = ends
                        .get(&i)
                        .map(|&end| (offsets[i] + Instr::LoopStart.encoded_len(), end));
                    frames.push(frame);
                    out.push(Instr::LoopStart);
                }
                Instr::LoopEnd => {
                    frames.pop();
                    out.push(Instr::LoopEnd);
                }
                Instr::LoopJump { to, when } => match frames.last().copied().flatten() {
                    Some((start, end)) => {
                        let target = match to {
                            LoopTarget::Start => start,
                            LoopTarget::End => end,
                        };
                        if target > u16::MAX as usize {
                            return Err(CompileError::too_large("loop jump target"));
                        }

                        out.push(Instr::PushAddr(target as u16));
                        out.push(match when {
                            JumpCond::Always => Instr::JumpTop,
                            JumpCond::IfFalse => Instr::JumpTopIfFalse,
                        });
                        resolved += 1;
                    }
                    None => out.push(Instr::LoopJump { to, when }),
                },
                other => out.push(other),
            }
        }

        trace!("resolve: chunk {} ({} loop jumps resolved)", id.0, resolved);
        self.chunks[id.0].code = out;
        Ok(())
    }

    /// True when the chunk still contains a symbolic loop jump. Checked by
    /// the generator after the final merge.
    pub fn has_symbolic_jumps(&self, id: ChunkId) -> bool {
        self.chunks[id.0]
            .code
            .iter()
            .any(|instr| matches!(instr, Instr::LoopJump { .. }))
    }

    /// Encode the chunk's instructions into the flat byte form.
    pub fn encode(&self, id: ChunkId) -> Vec<u8> {
        let chunk = &self.chunks[id.0];
        let mut bytes = Vec::with_capacity(chunk.byte_len);
        for instr in &chunk.code {
            instr.encode(&mut bytes);
        }
        bytes
    }
}
