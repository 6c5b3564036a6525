use log::debug;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{Instr, JumpCond, LoopTarget};
use crate::bytecode::scope::{Binding, ChunkArena, ChunkId};
use crate::bytecode::table::SymbolTable;
use crate::bytecode::unit::CompiledUnit;
use crate::lang::ast::{BinOp, Expr, Stmt, UnOp};
use crate::lang::value::Value;
use crate::runtime::native::NativeRegistry;

// =============================================================================
// COMPILE - AST walker emitting into scope chunks
// =============================================================================
//
// The generator walks the tree once, emitting into the chunk of the current
// lexical scope. Nested constructs get child chunks that are folded back
// with `merge`; branch arms get *temporary* chunks so their byte sizes are
// known before any jump offset is emitted. Function bodies are merged into a
// dedicated callable-region chunk that ends up at offset 0 of the final
// buffer, which is what lets entry addresses be absolute the moment a body
// is laid out.

/// Compile a program against a set of pre-registered native bindings.
pub fn compile(program: &[Stmt], natives: &NativeRegistry) -> Result<CompiledUnit, CompileError> {
    Compiler::new(natives).compile_program(program)
}

pub struct Compiler<'a> {
    natives: &'a NativeRegistry,
    table: SymbolTable,
    arena: ChunkArena,

    /// Side buffer for callable bodies, laid out contiguously ahead of the
    /// top-level stream.
    callables: ChunkId,

    /// Open loop count; `break`/`continue` are only legal above zero.
    loop_depth: usize,
    /// Function-body nesting; `return` is only legal above zero.
    fn_depth: usize,
    /// Counter for synthesized (hidden) variable names.
    synth: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(natives: &'a NativeRegistry) -> Self {
        let mut arena = ChunkArena::new();
        let callables = arena.new_chunk(None, false);

        Compiler {
            natives,
            table: SymbolTable::new(),
            arena,
            callables,
            loop_depth: 0,
            fn_depth: 0,
            synth: 0,
        }
    }

    pub fn compile_program(mut self, program: &[Stmt]) -> Result<CompiledUnit, CompileError> {
        let root = self.arena.new_chunk(None, false);

        // Native bindings become the outermost scope's first slots, so call
        // sites reach them through ordinary variable loads.
        for (idx, def) in self.natives.iter().enumerate() {
            self.arena
                .declare(root, &def.name, Value::Native(idx as u16), &mut self.table)?;
        }

        for stmt in program {
            self.gen_stmt(root, stmt)?;
        }
        self.arena.emit(root, Instr::Halt);

        let entry = u16::try_from(self.arena.byte_len(self.callables))
            .map_err(|_| CompileError::too_large("callable region"))?;
        self.arena.merge(self.callables, root)?;

        if self.arena.has_symbolic_jumps(self.callables) {
            return Err(CompileError::internal(
                "symbolic loop jump survived resolution",
            ));
        }
        let total = self.arena.byte_len(self.callables);
        if total > u16::MAX as usize {
            return Err(CompileError::too_large("instruction buffer"));
        }

        debug!(
            "compiled unit: {} bytes, entry {:04}, {} constant(s), {} variable slot(s)",
            total,
            entry,
            self.table.const_count(),
            self.table.var_count()
        );

        Ok(CompiledUnit {
            code: self.arena.encode(self.callables),
            entry,
            table: self.table,
        })
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn gen_stmt(&mut self, cur: ChunkId, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, value } => {
                self.gen_expr(cur, value)?;
                let addr = self.arena.declare(cur, name, Value::Null, &mut self.table)?;
                self.arena.emit(cur, Instr::StoreVar(addr));
            }

            Stmt::Assign { target, op, value } => {
                // Compound assignment desugars before emission.
                if let Some(op) = op {
                    let combined = Expr::Binary {
                        op: *op,
                        lhs: Box::new(target.clone()),
                        rhs: Box::new(value.clone()),
                    };
                    self.gen_assign(cur, target, &combined)?;
                } else {
                    self.gen_assign(cur, target, value)?;
                }
            }

            Stmt::Expr(expr) => {
                self.gen_expr(cur, expr)?;
                self.arena.emit(cur, Instr::Pop);
            }

            Stmt::Block(stmts) => {
                let child = self.arena.new_chunk(Some(cur), false);
                for s in stmts {
                    self.gen_stmt(child, s)?;
                }
                self.arena.merge(cur, child)?;
            }

            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.gen_expr(cur, cond)?;

                let then_c = self.arena.new_chunk(Some(cur), true);
                for s in then_body {
                    self.gen_stmt(then_c, s)?;
                }
                let else_c = self.arena.new_chunk(Some(cur), true);
                for s in else_body {
                    self.gen_stmt(else_c, s)?;
                }

                self.emit_branch(cur, then_c, else_c)?;
            }

            Stmt::While { cond, body } => {
                self.arena.emit(cur, Instr::LoopStart);
                self.gen_expr(cur, cond)?;
                self.arena.emit(
                    cur,
                    Instr::LoopJump {
                        to: LoopTarget::End,
                        when: JumpCond::IfFalse,
                    },
                );

                let body_c = self.arena.new_chunk(Some(cur), false);
                self.loop_depth += 1;
                let result: Result<(), CompileError> =
                    body.iter().try_for_each(|s| self.gen_stmt(body_c, s));
                self.loop_depth -= 1;
                result?;
                self.arena.merge(cur, body_c)?;

                self.arena.emit(
                    cur,
                    Instr::LoopJump {
                        to: LoopTarget::Start,
                        when: JumpCond::Always,
                    },
                );
                self.arena.emit(cur, Instr::LoopEnd);
                self.arena.resolve_loop_labels(cur)?;
            }

            Stmt::For {
                init,
                cond,
                step,
                body,
            } => self.gen_for(cur, init.as_deref(), cond.as_ref(), step.as_deref(), body)?,

            Stmt::ForEach { name, iter, body } => {
                let desugared = self.desugar_foreach(name, iter, body);
                self.gen_stmt(cur, &desugared)?;
            }

            Stmt::Fn { name, params, body } => {
                let arity = param_count(params)?;
                let addr = self.arena.declare_fn(cur, name, arity, &mut self.table)?;

                let entry = self.gen_fn_body(cur, params, body, arity)?;
                self.arena.set_link_entry(cur, name, entry)?;

                // Bind the callable at the declaration site so recursive and
                // later references through the slot see it.
                self.arena.emit(cur, Instr::PushFn { entry, arity });
                self.arena.emit(cur, Instr::StoreVar(addr));

                debug!("function '{}' at {:04} (arity {})", name, entry, arity);
            }

            Stmt::Return(value) => {
                if self.fn_depth == 0 {
                    return Err(CompileError::misplaced("return", "outside a function"));
                }
                match value {
                    Some(expr) => self.gen_expr(cur, expr)?,
                    None => self.arena.emit(cur, Instr::PushNull),
                }
                self.arena.emit(cur, Instr::Ret);
            }

            Stmt::Break => {
                if self.loop_depth == 0 {
                    return Err(CompileError::misplaced("break", "outside a loop"));
                }
                self.arena.emit(
                    cur,
                    Instr::LoopJump {
                        to: LoopTarget::End,
                        when: JumpCond::Always,
                    },
                );
            }

            Stmt::Continue => {
                if self.loop_depth == 0 {
                    return Err(CompileError::misplaced("continue", "outside a loop"));
                }
                self.arena.emit(
                    cur,
                    Instr::LoopJump {
                        to: LoopTarget::Start,
                        when: JumpCond::Always,
                    },
                );
            }
        }

        Ok(())
    }

    fn gen_assign(&mut self, cur: ChunkId, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        match target {
            Expr::Ident(name) => {
                self.gen_expr(cur, value)?;
                let addr = self.arena.declare_or_get(cur, name, &mut self.table)?;
                self.arena.emit(cur, Instr::StoreVar(addr));
                Ok(())
            }

            Expr::Index { target, index } => {
                self.gen_expr(cur, target)?;
                self.gen_expr(cur, index)?;
                self.gen_expr(cur, value)?;
                self.arena.emit(cur, Instr::StoreIndex);
                Ok(())
            }

            other => Err(CompileError::not_implemented(format!(
                "assignment to {}",
                expr_kind(other)
            ))),
        }
    }

    /// `for` layout. The step region is hoisted before the condition and
    /// skipped on entry, so a `continue` (jump-to-start) runs the step before
    /// re-testing:
    ///
    /// ```text
    ///   <init>
    ///   JUMP  over step          ; first iteration skips the step
    ///   LOOP_START
    ///   <step>
    ///   <cond>
    ///   LOOP_JUMP end if-false
    ///   <body>
    ///   LOOP_JUMP start
    ///   LOOP_END
    /// ```
    fn gen_for(
        &mut self,
        cur: ChunkId,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        // The init clause's declarations live in their own scope.
        let outer = self.arena.new_chunk(Some(cur), false);
        if let Some(init) = init {
            self.gen_stmt(outer, init)?;
        }

        // Generate the step in a temporary chunk first; the entry jump needs
        // its byte size before anything is emitted.
        let step_c = self.arena.new_chunk(Some(outer), true);
        if let Some(step) = step {
            self.gen_stmt(step_c, step)?;
        }

        let over_step =
            rel_offset(Instr::LoopStart.encoded_len() + self.arena.byte_len(step_c))?;
        self.arena.emit(outer, Instr::Jump(over_step));
        self.arena.emit(outer, Instr::LoopStart);
        self.arena.merge_temporary(outer, step_c)?;

        match cond {
            Some(cond) => self.gen_expr(outer, cond)?,
            None => self.arena.emit(outer, Instr::PushBool(true)),
        }
        self.arena.emit(
            outer,
            Instr::LoopJump {
                to: LoopTarget::End,
                when: JumpCond::IfFalse,
            },
        );

        let body_c = self.arena.new_chunk(Some(outer), false);
        self.loop_depth += 1;
        let result: Result<(), CompileError> =
            body.iter().try_for_each(|s| self.gen_stmt(body_c, s));
        self.loop_depth -= 1;
        result?;
        self.arena.merge(outer, body_c)?;

        self.arena.emit(
            outer,
            Instr::LoopJump {
                to: LoopTarget::Start,
                when: JumpCond::Always,
            },
        );
        self.arena.emit(outer, Instr::LoopEnd);
        self.arena.resolve_loop_labels(outer)?;

        self.arena.merge(cur, outer)
    }

    /// `foreach (x in e)` rewrites to an index-driven `for` over hidden
    /// variables. Hidden names contain `@`, which no user identifier can.
    fn desugar_foreach(&mut self, name: &str, iter: &Expr, body: &[Stmt]) -> Stmt {
        let it = self.synth_name("iter");
        let idx = self.synth_name("idx");

        let mut for_body = vec![Stmt::Let {
            name: name.to_string(),
            value: Expr::Index {
                target: Box::new(Expr::Ident(it.clone())),
                index: Box::new(Expr::Ident(idx.clone())),
            },
        }];
        for_body.extend(body.iter().cloned());

        Stmt::Block(vec![
            Stmt::Let {
                name: it.clone(),
                value: iter.clone(),
            },
            Stmt::For {
                init: Some(Box::new(Stmt::Let {
                    name: idx.clone(),
                    value: Expr::Int(0),
                })),
                cond: Some(Expr::Binary {
                    op: BinOp::Lt,
                    lhs: Box::new(Expr::Ident(idx.clone())),
                    rhs: Box::new(Expr::Unary {
                        op: UnOp::Len,
                        operand: Box::new(Expr::Ident(it)),
                    }),
                }),
                step: Some(Box::new(Stmt::Assign {
                    target: Expr::Ident(idx.clone()),
                    op: None,
                    value: Expr::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(Expr::Ident(idx)),
                        rhs: Box::new(Expr::Int(1)),
                    },
                })),
                body: for_body,
            },
        ])
    }

    fn synth_name(&mut self, kind: &str) -> String {
        let name = format!("@{}{}", kind, self.synth);
        self.synth += 1;
        name
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn gen_expr(&mut self, cur: ChunkId, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Int(n) => self.arena.emit(cur, Instr::PushInt(*n)),
            Expr::Float(n) => self.arena.emit(cur, Instr::PushFloat(*n)),
            Expr::Bool(b) => self.arena.emit(cur, Instr::PushBool(*b)),
            Expr::Null => self.arena.emit(cur, Instr::PushNull),

            Expr::Str(s) => {
                let idx = self.table.intern_const(Value::str(s.clone()))?;
                self.arena.emit(cur, Instr::PushConst(idx));
            }

            Expr::Array(items) => {
                let count = u16::try_from(items.len())
                    .map_err(|_| CompileError::too_large("array literal"))?;
                for item in items {
                    self.gen_expr(cur, item)?;
                }
                self.arena.emit(cur, Instr::MakeArray(count));
            }

            Expr::Ident(name) => {
                let binding = self.arena.lookup(cur, name)?;
                self.arena.emit(cur, Instr::LoadVar(binding.addr()));
            }

            Expr::Unary { op, operand } => {
                self.gen_expr(cur, operand)?;
                self.arena.emit(cur, Instr::Unary(*op));
            }

            Expr::Binary { op, lhs, rhs } => {
                self.gen_expr(cur, lhs)?;
                self.gen_expr(cur, rhs)?;
                self.arena.emit(cur, Instr::Binary(*op));
            }

            Expr::Ternary {
                cond,
                then_val,
                else_val,
            } => {
                self.gen_expr(cur, cond)?;

                let then_c = self.arena.new_chunk(Some(cur), true);
                self.gen_expr(then_c, then_val)?;
                let else_c = self.arena.new_chunk(Some(cur), true);
                self.gen_expr(else_c, else_val)?;

                self.emit_branch(cur, then_c, else_c)?;
            }

            Expr::Call { callee, args } => self.gen_call(cur, callee, args)?,

            Expr::Index { target, index } => {
                self.gen_expr(cur, target)?;
                self.gen_expr(cur, index)?;
                self.arena.emit(cur, Instr::Index);
            }

            Expr::Fn { params, body } => {
                let arity = param_count(params)?;
                let entry = self.gen_fn_body(cur, params, body, arity)?;
                self.arena.emit(cur, Instr::PushFn { entry, arity });
            }
        }

        Ok(())
    }

    /// Emit a two-armed branch whose arms were generated into temporary
    /// chunks, so both byte lengths are known:
    ///
    /// ```text
    ///   <condition already emitted>
    ///   JUMP_TRUE  +len(false arm)      ; false arm includes its exit jump
    ///   <false arm>
    ///   JUMP       +len(true arm)
    ///   <true arm>
    /// ```
    ///
    /// Either arm may be empty; an absent else still yields byte-correct
    /// offsets because the false arm is then just its exit jump.
    fn emit_branch(
        &mut self,
        cur: ChunkId,
        then_c: ChunkId,
        else_c: ChunkId,
    ) -> Result<(), CompileError> {
        let over_then = rel_offset(self.arena.byte_len(then_c))?;
        self.arena.emit(else_c, Instr::Jump(over_then));

        let over_else = rel_offset(self.arena.byte_len(else_c))?;
        self.arena.emit(cur, Instr::JumpIfTrue(over_else));

        self.arena.merge_temporary(cur, else_c)?;
        self.arena.merge_temporary(cur, then_c)
    }

    // =========================================================================
    // Calls and callables
    // =========================================================================

    fn gen_call(&mut self, cur: ChunkId, callee: &Expr, args: &[Expr]) -> Result<(), CompileError> {
        if args.len() > u8::MAX as usize {
            return Err(CompileError::too_large("argument list"));
        }

        for arg in args {
            self.gen_expr(cur, arg)?;
        }
        self.arena.emit(cur, Instr::PushInt(args.len() as i32));

        // A name that resolves to a completed function gets the static call;
        // everything else (natives, function values, a body referring to its
        // own still-open name) goes through the dynamic form.
        if let Expr::Ident(name) = callee {
            return match self.arena.lookup(cur, name)? {
                Binding::Fn {
                    entry: Some(entry), ..
                } => {
                    self.arena.emit(cur, Instr::CallAddr(entry));
                    Ok(())
                }
                Binding::Fn {
                    addr, entry: None, ..
                }
                | Binding::Slot(addr) => {
                    self.arena.emit(cur, Instr::LoadVar(addr));
                    self.arena.emit(cur, Instr::Call);
                    Ok(())
                }
            };
        }

        self.gen_expr(cur, callee)?;
        self.arena.emit(cur, Instr::Call);
        Ok(())
    }

    /// Generate a callable body into its own chunk and append it to the
    /// callable region. Returns the body's absolute entry address.
    fn gen_fn_body(
        &mut self,
        cur: ChunkId,
        params: &[String],
        body: &[Stmt],
        arity: u8,
    ) -> Result<u16, CompileError> {
        let body_c = self.arena.new_chunk(Some(cur), false);
        self.arena.emit(body_c, Instr::FnEntry(arity));

        // Arguments arrive on the operand stack in push order: bind the
        // parameter slots back to front.
        let mut addrs = Vec::with_capacity(params.len());
        for param in params {
            addrs.push(self.arena.declare(body_c, param, Value::Null, &mut self.table)?);
        }
        for addr in addrs.iter().rev() {
            self.arena.emit(body_c, Instr::StoreVar(*addr));
        }

        // A loop outside the function must not catch this body's breaks.
        let outer_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.fn_depth += 1;
        let result: Result<(), CompileError> =
            body.iter().try_for_each(|s| self.gen_stmt(body_c, s));
        self.fn_depth -= 1;
        self.loop_depth = outer_loops;
        result?;

        // Fallthrough return.
        self.arena.emit(body_c, Instr::PushNull);
        self.arena.emit(body_c, Instr::Ret);

        let entry = u16::try_from(self.arena.byte_len(self.callables))
            .map_err(|_| CompileError::too_large("callable region"))?;
        self.arena.merge(self.callables, body_c)?;
        Ok(entry)
    }
}

fn param_count(params: &[String]) -> Result<u8, CompileError> {
    u8::try_from(params.len()).map_err(|_| CompileError::too_large("parameter list"))
}

fn rel_offset(len: usize) -> Result<i16, CompileError> {
    i16::try_from(len).map_err(|_| CompileError::too_large("branch arm"))
}

/// Human-readable name for an expression shape, for error messages.
fn expr_kind(expr: &Expr) -> &'static str {
    match expr {
        Expr::Int(_) => "an integer literal",
        Expr::Float(_) => "a float literal",
        Expr::Bool(_) => "a bool literal",
        Expr::Str(_) => "a string literal",
        Expr::Null => "null",
        Expr::Array(_) => "an array literal",
        Expr::Ident(_) => "an identifier",
        Expr::Unary { .. } => "a unary expression",
        Expr::Binary { .. } => "a binary expression",
        Expr::Ternary { .. } => "a ternary expression",
        Expr::Call { .. } => "a call result",
        Expr::Index { .. } => "an index expression",
        Expr::Fn { .. } => "a function expression",
    }
}
