use crate::bytecode::op::{Instr, JumpCond, LoopTarget};
use crate::bytecode::table::SymbolTable;
use crate::bytecode::unit::CompiledUnit;
use crate::lang::value::Value;

// =============================================================================
// DISASM - Human-readable listing of a compiled unit
// =============================================================================

/// Render a compiled unit as a listing: byte offset, jump-target marker,
/// mnemonic, decoded operand, and the resolved constant or variable name.
pub fn disassemble(unit: &CompiledUnit) -> String {
    let mut out = String::new();
    let targets = collect_jump_targets(&unit.code);

    out.push_str("═══════════════════════════════════════\n");
    out.push_str(&format!(
        " compiled unit: {} bytes, entry {:04}\n",
        unit.code.len(),
        unit.entry
    ));
    out.push_str("═══════════════════════════════════════\n");

    let mut at = 0;
    while at < unit.code.len() {
        if at == unit.entry_pc() {
            out.push_str("─────────────── entry ─────────────────\n");
        }

        let marker = if targets.contains(&at) { "► " } else { "  " };

        match Instr::decode_at(&unit.code, at) {
            Some((instr, next)) => {
                out.push_str(&format!(
                    "{:04} {}{}\n",
                    at,
                    marker,
                    format_instr(&instr, next, &unit.table)
                ));
                at = next;
            }
            None => {
                // Undecodable byte: show it raw and resynchronize.
                out.push_str(&format!(
                    "{:04} {}.byte       0x{:02X}\n",
                    at, marker, unit.code[at]
                ));
                at += 1;
            }
        }
    }

    out
}

/// Byte offsets any instruction in the buffer can transfer control to.
fn collect_jump_targets(code: &[u8]) -> Vec<usize> {
    let mut targets = Vec::new();
    let mut push = |t: usize| {
        if !targets.contains(&t) {
            targets.push(t);
        }
    };

    let mut at = 0;
    while at < code.len() {
        let Some((instr, next)) = Instr::decode_at(code, at) else {
            at += 1;
            continue;
        };

        match instr {
            Instr::Jump(off) | Instr::JumpIfTrue(off) => {
                push((next as i64 + off as i64).max(0) as usize)
            }
            Instr::PushAddr(addr) => push(addr as usize),
            Instr::CallAddr(entry) => push(entry as usize),
            Instr::PushFn { entry, .. } => push(entry as usize),
            _ => {}
        }

        at = next;
    }

    targets
}

fn format_instr(instr: &Instr, next: usize, table: &SymbolTable) -> String {
    match instr {
        Instr::PushConst(idx) => format!(
            "PUSH_CONST  c{:<5} ; {}",
            idx,
            format_const(table, *idx)
        ),
        Instr::PushInt(n) => format!("PUSH_INT    {}", n),
        Instr::PushFloat(n) => format!("PUSH_FLOAT  {:?}", n),
        Instr::PushBool(b) => format!("PUSH_BOOL   {}", b),
        Instr::PushNull => "PUSH_NULL".to_string(),

        Instr::LoadVar(addr) => format!(
            "LOAD_VAR    v{:<5} ; {}",
            addr,
            format_var(table, *addr)
        ),
        Instr::StoreVar(addr) => format!(
            "STORE_VAR   v{:<5} ; {}",
            addr,
            format_var(table, *addr)
        ),
        Instr::Index => "INDEX       ; ( arr i -- arr[i] )".to_string(),
        Instr::StoreIndex => "STORE_INDEX ; ( arr i v -- )".to_string(),
        Instr::MakeArray(count) => format!("MAKE_ARRAY  {}", count),

        Instr::Binary(op) => format!("BINARY      {}", op.symbol()),
        Instr::Unary(op) => format!("UNARY       {}", op.symbol()),
        Instr::Pop => "POP".to_string(),

        Instr::Jump(off) => format!(
            "JUMP        {:+} (→ {:04})",
            off,
            next as i64 + *off as i64
        ),
        Instr::JumpIfTrue(off) => format!(
            "JUMP_TRUE   {:+} (→ {:04})",
            off,
            next as i64 + *off as i64
        ),
        Instr::PushAddr(addr) => format!("PUSH_ADDR   → {:04}", addr),
        Instr::JumpTop => "JUMP_TOP    ; ( addr -- )".to_string(),
        Instr::JumpTopIfFalse => "JUMP_TOP_F  ; ( cond addr -- )".to_string(),

        Instr::LoopStart => "LOOP_START".to_string(),
        Instr::LoopEnd => "LOOP_END".to_string(),
        Instr::LoopJump { to, when } => {
            let target = match to {
                LoopTarget::Start => "start",
                LoopTarget::End => "end",
            };
            let cond = match when {
                JumpCond::Always => "",
                JumpCond::IfFalse => " if-false",
            };
            format!("LOOP_JUMP   {}{} ; unresolved", target, cond)
        }

        Instr::FnEntry(arity) => format!("FN_ENTRY    arity {}", arity),
        Instr::PushFn { entry, arity } => {
            format!("PUSH_FN     → {:04} arity {}", entry, arity)
        }
        Instr::Call => "CALL        ; ( args.. n f -- result )".to_string(),
        Instr::CallAddr(entry) => format!("CALL_ADDR   → {:04}", entry),
        Instr::Ret => "RET".to_string(),

        Instr::Halt => "HALT".to_string(),
    }
}

fn format_const(table: &SymbolTable, idx: u16) -> String {
    match table.const_at(idx) {
        Ok(Value::Str(s)) => format!("{:?}", s),
        Ok(value) => value.to_string(),
        Err(_) => "<bad constant index>".to_string(),
    }
}

fn format_var(table: &SymbolTable, addr: u16) -> String {
    match table.var_name(addr) {
        Ok(name) => name.to_string(),
        Err(_) => "<bad variable address>".to_string(),
    }
}
