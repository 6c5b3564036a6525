use log::trace;

use crate::bytecode::op::OpCode;
use crate::bytecode::unit::CompiledUnit;
use crate::lang::ast::{BinOp, UnOp};
use crate::lang::value::Value;
use crate::runtime::native::NativeRegistry;
use crate::runtime::runtime_error::{
    RuntimeError, division_by_zero, index_out_of_bounds, invalid_argument_count, limit_exceeded,
    not_callable, out_of_range, stack_underflow, type_mismatch, unknown_opcode,
};

// =============================================================================
// VM - Stack-based interpreter over the flat instruction buffer
// =============================================================================
//
// One VM instance owns its operand stack, its call/return address stack and
// its variable slots; the compiled unit and the native registry are shared
// read-only. Execution is synchronous: `run` proceeds until `HALT`, a fault,
// or a configured safety limit.

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_steps: Option<usize>,
    pub max_stack: usize,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_steps: None,
            max_stack: 10_000,
            max_call_depth: 1_000,
        }
    }
}

pub struct Vm<'a> {
    unit: &'a CompiledUnit,
    natives: &'a NativeRegistry,
    config: VmConfig,

    pc: usize,
    stack: Vec<Value>,
    rets: Vec<usize>,
    slots: Vec<Value>,
    steps: usize,
}

impl<'a> Vm<'a> {
    pub fn new(unit: &'a CompiledUnit, natives: &'a NativeRegistry) -> Self {
        Vm::with_config(unit, natives, VmConfig::default())
    }

    pub fn with_config(
        unit: &'a CompiledUnit,
        natives: &'a NativeRegistry,
        config: VmConfig,
    ) -> Self {
        Vm {
            unit,
            natives,
            config,
            pc: unit.entry_pc(),
            stack: Vec::new(),
            rets: Vec::new(),
            slots: unit.table.initial_slots(),
            steps: 0,
        }
    }

    /// Operand stack contents, bottom to top.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Current contents of a variable slot.
    pub fn slot(&self, addr: u16) -> Option<&Value> {
        self.slots.get(addr as usize)
    }

    /// Execute from the unit's entry point until `HALT` or a fault. Yields
    /// the top of the operand stack (null when the stack is empty).
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        self.pc = self.unit.entry_pc();
        self.stack.clear();
        self.rets.clear();
        self.slots = self.unit.table.initial_slots();
        self.steps = 0;

        loop {
            let op_pc = self.pc;

            if op_pc >= self.unit.code.len() {
                return Err(unknown_opcode(
                    "program counter ran off the end of the instruction buffer",
                ));
            }

            self.check_limits()?;

            let byte = self.unit.code[op_pc];
            self.pc += 1;

            let result = match OpCode::from_byte(byte) {
                Some(op) => self.step(op),
                None => Err(unknown_opcode(format!(
                    "unknown opcode byte 0x{:02X}",
                    byte
                ))),
            };

            match result {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(mut err) => {
                    if err.pc.is_none() {
                        err = err.at(op_pc, byte);
                    }
                    trace!("fault: {}", err);
                    return Err(err);
                }
            }
        }
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(limit_exceeded("execution step", max));
            }
        }
        if self.stack.len() > self.config.max_stack {
            return Err(limit_exceeded("operand stack size", self.config.max_stack));
        }
        Ok(())
    }

    /// Execute one decoded opcode. Returns the program result on `HALT`.
    fn step(&mut self, op: OpCode) -> Result<Option<Value>, RuntimeError> {
        match op {
            // Literals
            OpCode::PushConst => {
                let idx = self.fetch_u16()?;
                let value = self
                    .unit
                    .table
                    .const_at(idx)
                    .map_err(|_| out_of_range("constant pool", idx as i64))?
                    .clone();
                self.stack.push(value);
            }
            OpCode::PushInt => {
                let n = self.fetch_i32()?;
                self.stack.push(Value::Int(n));
            }
            OpCode::PushFloat => {
                let n = self.fetch_f64()?;
                self.stack.push(Value::Float(n));
            }
            OpCode::PushBool => {
                let b = self.fetch_u8()? != 0;
                self.stack.push(Value::Bool(b));
            }
            OpCode::PushNull => self.stack.push(Value::Null),

            // Variables
            OpCode::LoadVar => {
                let addr = self.fetch_u16()?;
                let value = self
                    .slots
                    .get(addr as usize)
                    .ok_or_else(|| out_of_range("variable", addr as i64))?
                    .clone();
                self.stack.push(value);
            }
            OpCode::StoreVar => {
                let addr = self.fetch_u16()?;
                let value = self.pop()?;
                match self.slots.get_mut(addr as usize) {
                    Some(slot) => *slot = value,
                    None => return Err(out_of_range("variable", addr as i64)),
                }
            }

            // Arrays
            OpCode::Index => {
                let index = self.pop_int()?;
                let array = self.pop_array()?;
                let items = array.borrow();

                if index < 0 || index as usize >= items.len() {
                    return Err(index_out_of_bounds(index, items.len()));
                }
                let value = items[index as usize].clone();
                drop(items);
                self.stack.push(value);
            }
            OpCode::StoreIndex => {
                let value = self.pop()?;
                let index = self.pop_int()?;
                let array = self.pop_array()?;
                let mut items = array.borrow_mut();

                if index < 0 || index as usize >= items.len() {
                    return Err(index_out_of_bounds(index, items.len()));
                }
                items[index as usize] = value;
            }
            OpCode::MakeArray => {
                let count = self.fetch_u16()? as usize;
                if self.stack.len() < count {
                    return Err(stack_underflow("operand stack"));
                }
                let items = self.stack.split_off(self.stack.len() - count);
                self.stack.push(Value::array(items));
            }

            // Operators
            OpCode::Binary => {
                let byte = self.fetch_u8()?;
                let op = BinOp::from_byte(byte)
                    .ok_or_else(|| unknown_opcode(format!("bad binary operator byte {}", byte)))?;
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = binary_op(op, lhs, rhs)?;
                self.stack.push(result);
            }
            OpCode::Unary => {
                let byte = self.fetch_u8()?;
                let op = UnOp::from_byte(byte)
                    .ok_or_else(|| unknown_opcode(format!("bad unary operator byte {}", byte)))?;
                let operand = self.pop()?;
                let result = unary_op(op, operand)?;
                self.stack.push(result);
            }
            OpCode::Pop => {
                self.pop()?;
            }

            // Control flow
            OpCode::Jump => {
                let off = self.fetch_i16()?;
                self.rel_jump(off)?;
            }
            OpCode::JumpIfTrue => {
                let off = self.fetch_i16()?;
                if self.pop_bool()? {
                    self.rel_jump(off)?;
                }
            }
            OpCode::PushAddr => {
                let addr = self.fetch_u16()?;
                self.stack.push(Value::Int(addr as i32));
            }
            OpCode::JumpTop => {
                let target = self.pop_addr()?;
                self.jump_to(target)?;
            }
            OpCode::JumpTopIfFalse => {
                let target = self.pop_addr()?;
                if !self.pop_bool()? {
                    self.jump_to(target)?;
                }
            }

            // Loop brackets survive resolution as no-ops; a symbolic jump
            // reaching the VM means the resolver missed it.
            OpCode::LoopStart | OpCode::LoopEnd => {}
            OpCode::LoopJump => {
                return Err(unknown_opcode(
                    "unresolved loop jump reached the virtual machine",
                ));
            }

            // Callables
            OpCode::FnEntry => {
                self.fetch_u8()?;
            }
            OpCode::PushFn => {
                let entry = self.fetch_u16()?;
                let arity = self.fetch_u8()?;
                self.stack.push(Value::Fn { entry, arity });
            }
            OpCode::Call => {
                let callee = self.pop()?;
                let argc = self.pop_count()?;
                self.call_value(callee, argc)?;
            }
            OpCode::CallAddr => {
                let entry = self.fetch_u16()?;
                let argc = self.pop_count()?;
                let arity = self.read_arity(entry)?;
                self.enter_fn(entry as usize, arity, argc)?;
            }
            OpCode::Ret => {
                self.pc = self
                    .rets
                    .pop()
                    .ok_or_else(|| stack_underflow("call stack"))?;
            }

            OpCode::Halt => {
                return Ok(Some(self.stack.pop().unwrap_or(Value::Null)));
            }
        }

        Ok(None)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        match callee {
            Value::Native(idx) => {
                let def = self
                    .natives
                    .get(idx)
                    .ok_or_else(|| out_of_range("native binding", idx as i64))?;

                if argc != def.arity() {
                    return Err(invalid_argument_count(def.arity(), argc));
                }
                if self.stack.len() < argc {
                    return Err(stack_underflow("operand stack"));
                }

                let args = self.stack.split_off(self.stack.len() - argc);
                for (tag, arg) in def.params.iter().zip(&args) {
                    if !tag.matches(arg) {
                        return Err(type_mismatch(tag.name(), arg.type_name()));
                    }
                }

                let result = def.invoke(&args)?;
                self.stack.push(result);
                Ok(())
            }

            Value::Fn { entry, arity } => self.enter_fn(entry as usize, arity, argc),

            other => Err(not_callable(other.type_name())),
        }
    }

    /// Save the return pc and transfer to a callable body. The arguments
    /// stay on the operand stack in push order; the callee prologue drains
    /// them into its parameter slots.
    fn enter_fn(&mut self, entry: usize, arity: u8, argc: usize) -> Result<(), RuntimeError> {
        if argc != arity as usize {
            return Err(invalid_argument_count(arity as usize, argc));
        }
        if self.rets.len() >= self.config.max_call_depth {
            return Err(limit_exceeded("call depth", self.config.max_call_depth));
        }

        self.rets.push(self.pc);
        self.jump_to(entry)
    }

    /// Read the arity byte through a callable's prologue marker.
    fn read_arity(&self, entry: u16) -> Result<u8, RuntimeError> {
        let at = entry as usize;
        match self.unit.code.get(at) {
            Some(&byte) if byte == OpCode::FnEntry as u8 => self
                .unit
                .code
                .get(at + 1)
                .copied()
                .ok_or_else(|| unknown_opcode("truncated function prologue")),
            Some(_) => Err(not_callable("call target without a function prologue")),
            None => Err(out_of_range("function entry", entry as i64)),
        }
    }

    // =========================================================================
    // Jumps
    // =========================================================================

    fn jump_to(&mut self, target: usize) -> Result<(), RuntimeError> {
        if target > self.unit.code.len() {
            return Err(out_of_range("jump target", target as i64));
        }
        self.pc = target;
        Ok(())
    }

    fn rel_jump(&mut self, off: i16) -> Result<(), RuntimeError> {
        let target = self.pc as i64 + off as i64;
        if target < 0 || target as usize > self.unit.code.len() {
            return Err(out_of_range("jump target", target));
        }
        self.pc = target as usize;
        Ok(())
    }

    // =========================================================================
    // Operand fetch / stack helpers
    // =========================================================================

    fn fetch_bytes<const N: usize>(&mut self) -> Result<[u8; N], RuntimeError> {
        let code = &self.unit.code;
        let end = self.pc + N;
        if end > code.len() {
            return Err(unknown_opcode("truncated instruction operand"));
        }

        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&code[self.pc..end]);
        self.pc = end;
        Ok(bytes)
    }

    fn fetch_u8(&mut self) -> Result<u8, RuntimeError> {
        Ok(self.fetch_bytes::<1>()?[0])
    }

    fn fetch_u16(&mut self) -> Result<u16, RuntimeError> {
        Ok(u16::from_le_bytes(self.fetch_bytes()?))
    }

    fn fetch_i16(&mut self) -> Result<i16, RuntimeError> {
        Ok(i16::from_le_bytes(self.fetch_bytes()?))
    }

    fn fetch_i32(&mut self) -> Result<i32, RuntimeError> {
        Ok(i32::from_le_bytes(self.fetch_bytes()?))
    }

    fn fetch_f64(&mut self) -> Result<f64, RuntimeError> {
        Ok(f64::from_le_bytes(self.fetch_bytes()?))
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| stack_underflow("operand stack"))
    }

    fn pop_int(&mut self) -> Result<i32, RuntimeError> {
        match self.pop()? {
            Value::Int(n) => Ok(n),
            other => Err(type_mismatch("int", other.type_name())),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, RuntimeError> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            other => Err(type_mismatch("bool", other.type_name())),
        }
    }

    fn pop_array(&mut self) -> Result<std::rc::Rc<std::cell::RefCell<Vec<Value>>>, RuntimeError> {
        match self.pop()? {
            Value::Array(items) => Ok(items),
            other => Err(type_mismatch("array", other.type_name())),
        }
    }

    /// Pop an instruction address pushed by `PUSH_ADDR`.
    fn pop_addr(&mut self) -> Result<usize, RuntimeError> {
        let n = self.pop_int()?;
        if n < 0 {
            return Err(out_of_range("jump target", n as i64));
        }
        Ok(n as usize)
    }

    /// Pop the argument-count immediate emitted before a call.
    fn pop_count(&mut self) -> Result<usize, RuntimeError> {
        let n = self.pop_int()?;
        if n < 0 {
            return Err(type_mismatch("argument count", "negative int"));
        }
        Ok(n as usize)
    }
}

// =============================================================================
// Operator semantics
// =============================================================================

fn binary_op(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    use Value::{Float, Int};

    match op {
        BinOp::Add => match (&lhs, &rhs) {
            (Int(a), Int(b)) => Ok(Int(a + b)),
            (Float(a), Float(b)) => Ok(Float(a + b)),
            (Int(a), Float(b)) => Ok(Float(*a as f64 + b)),
            (Float(a), Int(b)) => Ok(Float(a + *b as f64)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{}{}", a, b))),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },
        BinOp::Sub => match (&lhs, &rhs) {
            (Int(a), Int(b)) => Ok(Int(a - b)),
            (Float(a), Float(b)) => Ok(Float(a - b)),
            (Int(a), Float(b)) => Ok(Float(*a as f64 - b)),
            (Float(a), Int(b)) => Ok(Float(a - *b as f64)),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },
        BinOp::Mul => match (&lhs, &rhs) {
            (Int(a), Int(b)) => Ok(Int(a * b)),
            (Float(a), Float(b)) => Ok(Float(a * b)),
            (Int(a), Float(b)) => Ok(Float(*a as f64 * b)),
            (Float(a), Int(b)) => Ok(Float(a * *b as f64)),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },
        BinOp::Div => match (&lhs, &rhs) {
            (Int(_), Int(0)) => Err(division_by_zero()),
            (Int(a), Int(b)) => Ok(Int(a / b)),
            (Float(a), Float(b)) => float_div(*a, *b),
            (Int(a), Float(b)) => float_div(*a as f64, *b),
            (Float(a), Int(b)) => float_div(*a, *b as f64),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },
        BinOp::Rem => match (&lhs, &rhs) {
            (Int(_), Int(0)) => Err(division_by_zero()),
            (Int(a), Int(b)) => Ok(Int(a % b)),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },

        BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => Ok(Value::Bool(lhs != rhs)),

        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (a, b) = match (&lhs, &rhs) {
                (Int(a), Int(b)) => (*a as f64, *b as f64),
                (Float(a), Float(b)) => (*a, *b),
                (Int(a), Float(b)) => (*a as f64, *b),
                (Float(a), Int(b)) => (*a, *b as f64),
                _ => return Err(mismatched(op, &lhs, &rhs)),
            };
            let result = match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            };
            Ok(Value::Bool(result))
        }

        // Eager on the bytecode path: both operands already evaluated.
        BinOp::And | BinOp::Or => match (&lhs, &rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinOp::And {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(mismatched(op, &lhs, &rhs)),
        },
    }
}

fn float_div(a: f64, b: f64) -> Result<Value, RuntimeError> {
    if b == 0.0 {
        return Err(division_by_zero());
    }
    Ok(Value::Float(a / b))
}

fn mismatched(op: BinOp, lhs: &Value, rhs: &Value) -> RuntimeError {
    type_mismatch(
        &format!("operands for '{}'", op.symbol()),
        &format!("{} and {}", lhs.type_name(), rhs.type_name()),
    )
}

fn unary_op(op: UnOp, operand: Value) -> Result<Value, RuntimeError> {
    match (op, operand) {
        (UnOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
        (UnOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::Len, Value::Array(items)) => Ok(Value::Int(items.borrow().len() as i32)),
        (UnOp::Len, Value::Str(s)) => Ok(Value::Int(s.len() as i32)),
        (op, other) => Err(type_mismatch(
            &format!("operand for '{}'", op.symbol()),
            other.type_name(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::bytecode::op::Instr;
    use crate::bytecode::table::SymbolTable;
    use crate::lang::ast::{Expr, Stmt};
    use crate::runtime::native::TypeTag;
    use crate::runtime::runtime_error::FaultKind;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // =========================================================================
    // Expression builders
    // =========================================================================

    fn int(n: i32) -> Expr {
        Expr::Int(n)
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn let_stmt(name: &str, value: Expr) -> Stmt {
        Stmt::Let {
            name: name.to_string(),
            value,
        }
    }

    fn assign(name: &str, value: Expr) -> Stmt {
        Stmt::Assign {
            target: ident(name),
            op: None,
            value,
        }
    }

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(ident(name)),
            args,
        }
    }

    // =========================================================================
    // Run helpers
    // =========================================================================

    fn run_program(stmts: Vec<Stmt>) -> (CompiledUnit, Result<Value, RuntimeError>) {
        let natives = NativeRegistry::new();
        run_with_natives(stmts, &natives)
    }

    fn run_with_natives(
        stmts: Vec<Stmt>,
        natives: &NativeRegistry,
    ) -> (CompiledUnit, Result<Value, RuntimeError>) {
        init_logs();
        let unit = compile(&stmts, natives).expect("compilation should succeed");
        let mut vm = Vm::new(&unit, natives);
        let result = vm.run();
        (unit, result)
    }

    /// Run and return the final contents of the named variable's slot.
    fn run_and_read(stmts: Vec<Stmt>, name: &str) -> Value {
        let natives = NativeRegistry::new();
        init_logs();
        let unit = compile(&stmts, &natives).expect("compilation should succeed");
        let mut vm = Vm::new(&unit, &natives);
        vm.run().expect("run should succeed");

        let addr = slot_of(&unit, name);
        vm.slot(addr).unwrap().clone()
    }

    fn slot_of(unit: &CompiledUnit, name: &str) -> u16 {
        (0..unit.table.var_count() as u16)
            .find(|&addr| unit.table.var_name(addr).unwrap() == name)
            .unwrap_or_else(|| panic!("no variable named '{}'", name))
    }

    /// Build a unit straight from instructions, bypassing the generator.
    fn manual_unit(instrs: &[Instr]) -> CompiledUnit {
        let mut code = Vec::new();
        for instr in instrs {
            instr.encode(&mut code);
        }
        CompiledUnit {
            code,
            entry: 0,
            table: SymbolTable::new(),
        }
    }

    fn run_manual(instrs: &[Instr]) -> Result<Value, RuntimeError> {
        let natives = NativeRegistry::new();
        let unit = manual_unit(instrs);
        Vm::new(&unit, &natives).run()
    }

    // =========================================================================
    // Basics
    // =========================================================================

    #[test]
    fn test_halt_on_empty_stack_yields_null() {
        let (_, result) = run_program(vec![let_stmt("x", int(1))]);
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[test]
    fn test_arithmetic_promotion() {
        assert_eq!(
            run_manual(&[Instr::PushInt(2), Instr::PushFloat(0.5), Instr::Binary(BinOp::Add), Instr::Halt])
                .unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            run_manual(&[Instr::PushInt(7), Instr::PushInt(2), Instr::Binary(BinOp::Div), Instr::Halt])
                .unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn test_string_concat() {
        let value = run_and_read(
            vec![
                let_stmt("a", Expr::Str("chart".to_string())),
                let_stmt(
                    "b",
                    bin(BinOp::Add, ident("a"), Expr::Str("build".to_string())),
                ),
            ],
            "b",
        );
        assert_eq!(value, Value::str("chartbuild"));
    }

    #[test]
    fn test_comparisons_promote_numerics() {
        let value = run_and_read(
            vec![let_stmt(
                "r",
                bin(BinOp::Lt, int(1), Expr::Float(1.5)),
            )],
            "r",
        );
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn test_statements_leave_stack_balanced() {
        let natives = NativeRegistry::new();
        let unit = compile(
            &[
                let_stmt("a", int(1)),
                Stmt::Expr(bin(BinOp::Add, int(2), int(3))),
                assign("a", int(9)),
                Stmt::Block(vec![let_stmt("b", int(4))]),
                Stmt::If {
                    cond: Expr::Bool(true),
                    then_body: vec![Stmt::Expr(int(5))],
                    else_body: vec![],
                },
            ],
            &natives,
        )
        .unwrap();

        let mut vm = Vm::new(&unit, &natives);
        vm.run().unwrap();
        assert!(vm.stack().is_empty());
    }

    // =========================================================================
    // Branches
    // =========================================================================

    #[test]
    fn test_ternary_true_arm() {
        let value = run_and_read(
            vec![let_stmt(
                "r",
                Expr::Ternary {
                    cond: Box::new(Expr::Bool(true)),
                    then_val: Box::new(int(10)),
                    else_val: Box::new(int(20)),
                },
            )],
            "r",
        );
        assert_eq!(value, Value::Int(10));
    }

    #[test]
    fn test_ternary_false_arm() {
        let value = run_and_read(
            vec![let_stmt(
                "r",
                Expr::Ternary {
                    cond: Box::new(Expr::Bool(false)),
                    then_val: Box::new(int(10)),
                    else_val: Box::new(int(20)),
                },
            )],
            "r",
        );
        assert_eq!(value, Value::Int(20));
    }

    #[test]
    fn test_ternary_leaves_exactly_one_value() {
        // Compiled without the statement wrapper: depth goes from 0 to 1.
        let natives = NativeRegistry::new();
        let unit = compile(
            &[Stmt::Let {
                name: "r".to_string(),
                value: Expr::Ternary {
                    cond: Box::new(Expr::Bool(false)),
                    then_val: Box::new(int(1)),
                    else_val: Box::new(int(2)),
                },
            }],
            &natives,
        )
        .unwrap();

        let mut vm = Vm::new(&unit, &natives);
        vm.run().unwrap();
        // the let consumed the single produced value
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn test_if_else_statement() {
        let value = run_and_read(
            vec![
                let_stmt("r", int(0)),
                Stmt::If {
                    cond: bin(BinOp::Gt, int(3), int(2)),
                    then_body: vec![assign("r", int(1))],
                    else_body: vec![assign("r", int(2))],
                },
            ],
            "r",
        );
        assert_eq!(value, Value::Int(1));
    }

    #[test]
    fn test_if_without_else() {
        let value = run_and_read(
            vec![
                let_stmt("r", int(7)),
                Stmt::If {
                    cond: Expr::Bool(false),
                    then_body: vec![assign("r", int(1))],
                    else_body: vec![],
                },
            ],
            "r",
        );
        assert_eq!(value, Value::Int(7));
    }

    #[test]
    fn test_branch_declarations_share_enclosing_namespace() {
        let value = run_and_read(
            vec![
                Stmt::If {
                    cond: Expr::Bool(false),
                    then_body: vec![],
                    else_body: vec![let_stmt("fromelse", int(42))],
                },
                let_stmt("r", ident("fromelse")),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(42));
    }

    // =========================================================================
    // Loops
    // =========================================================================

    #[test]
    fn test_while_counts_to_three() {
        let value = run_and_read(
            vec![
                let_stmt("i", int(0)),
                Stmt::While {
                    cond: bin(BinOp::Lt, ident("i"), int(3)),
                    body: vec![assign("i", bin(BinOp::Add, ident("i"), int(1)))],
                },
            ],
            "i",
        );
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_while_with_guarded_break() {
        let value = run_and_read(
            vec![
                let_stmt("i", int(0)),
                Stmt::While {
                    cond: bin(BinOp::Lt, ident("i"), int(3)),
                    body: vec![
                        assign("i", bin(BinOp::Add, ident("i"), int(1))),
                        Stmt::If {
                            cond: bin(BinOp::Eq, ident("i"), int(1)),
                            then_body: vec![Stmt::Break],
                            else_body: vec![],
                        },
                    ],
                },
            ],
            "i",
        );
        assert_eq!(value, Value::Int(1));
    }

    #[test]
    fn test_while_continue_reruns_condition() {
        // skip adding when i == 1: total = 2 + 3
        let value = run_and_read(
            vec![
                let_stmt("i", int(0)),
                let_stmt("total", int(0)),
                Stmt::While {
                    cond: bin(BinOp::Lt, ident("i"), int(3)),
                    body: vec![
                        assign("i", bin(BinOp::Add, ident("i"), int(1))),
                        Stmt::If {
                            cond: bin(BinOp::Eq, ident("i"), int(1)),
                            then_body: vec![Stmt::Continue],
                            else_body: vec![],
                        },
                        assign("total", bin(BinOp::Add, ident("total"), ident("i"))),
                    ],
                },
            ],
            "total",
        );
        assert_eq!(value, Value::Int(5));
    }

    fn counting_for(body_extra: Vec<Stmt>) -> Vec<Stmt> {
        let mut body = body_extra;
        body.push(assign("total", bin(BinOp::Add, ident("total"), ident("i"))));

        vec![
            let_stmt("total", int(0)),
            Stmt::For {
                init: Some(Box::new(let_stmt("i", int(0)))),
                cond: Some(bin(BinOp::Lt, ident("i"), int(5))),
                step: Some(Box::new(assign("i", bin(BinOp::Add, ident("i"), int(1))))),
                body,
            },
        ]
    }

    #[test]
    fn test_for_accumulates_ten() {
        let value = run_and_read(counting_for(vec![]), "total");
        assert_eq!(value, Value::Int(10));
    }

    #[test]
    fn test_for_continue_still_steps() {
        // skip even i: total = 1 + 3
        let value = run_and_read(
            counting_for(vec![Stmt::If {
                cond: bin(BinOp::Eq, bin(BinOp::Rem, ident("i"), int(2)), int(0)),
                then_body: vec![Stmt::Continue],
                else_body: vec![],
            }]),
            "total",
        );
        assert_eq!(value, Value::Int(4));
    }

    #[test]
    fn test_nested_loop_break_is_inner_only() {
        let value = run_and_read(
            vec![
                let_stmt("count", int(0)),
                Stmt::For {
                    init: Some(Box::new(let_stmt("i", int(0)))),
                    cond: Some(bin(BinOp::Lt, ident("i"), int(3))),
                    step: Some(Box::new(assign("i", bin(BinOp::Add, ident("i"), int(1))))),
                    body: vec![Stmt::While {
                        cond: Expr::Bool(true),
                        body: vec![
                            assign("count", bin(BinOp::Add, ident("count"), int(1))),
                            Stmt::Break,
                        ],
                    }],
                },
            ],
            "count",
        );
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_foreach_sums_array() {
        let value = run_and_read(
            vec![
                let_stmt("total", int(0)),
                Stmt::ForEach {
                    name: "item".to_string(),
                    iter: Expr::Array(vec![int(1), int(2), int(3), int(4)]),
                    body: vec![assign(
                        "total",
                        bin(BinOp::Add, ident("total"), ident("item")),
                    )],
                },
            ],
            "total",
        );
        assert_eq!(value, Value::Int(10));
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    #[test]
    fn test_array_index_read() {
        let value = run_and_read(
            vec![
                let_stmt("a", Expr::Array(vec![int(10), int(20), int(30)])),
                let_stmt(
                    "r",
                    Expr::Index {
                        target: Box::new(ident("a")),
                        index: Box::new(int(1)),
                    },
                ),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(20));
    }

    #[test]
    fn test_array_index_write_through_alias() {
        let value = run_and_read(
            vec![
                let_stmt("a", Expr::Array(vec![int(1), int(2)])),
                let_stmt("alias", ident("a")),
                Stmt::Assign {
                    target: Expr::Index {
                        target: Box::new(ident("alias")),
                        index: Box::new(int(0)),
                    },
                    op: None,
                    value: int(99),
                },
                let_stmt(
                    "r",
                    Expr::Index {
                        target: Box::new(ident("a")),
                        index: Box::new(int(0)),
                    },
                ),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(99));
    }

    #[test]
    fn test_index_out_of_bounds_is_recoverable() {
        let (_, result) = run_program(vec![Stmt::Expr(Expr::Index {
            target: Box::new(Expr::Array(vec![int(1)])),
            index: Box::new(int(5)),
        })]);

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::IndexOutOfBounds);
        assert!(err.is_recoverable());
    }

    // =========================================================================
    // Functions
    // =========================================================================

    #[test]
    fn test_function_call_and_return() {
        let value = run_and_read(
            vec![
                Stmt::Fn {
                    name: "add".to_string(),
                    params: vec!["a".to_string(), "b".to_string()],
                    body: vec![Stmt::Return(Some(bin(BinOp::Add, ident("a"), ident("b"))))],
                },
                let_stmt("r", call("add", vec![int(2), int(40)])),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn test_function_without_return_yields_null() {
        let value = run_and_read(
            vec![
                Stmt::Fn {
                    name: "noop".to_string(),
                    params: vec![],
                    body: vec![],
                },
                let_stmt("r", call("noop", vec![])),
            ],
            "r",
        );
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_recursive_factorial() {
        let value = run_and_read(
            vec![
                Stmt::Fn {
                    name: "fact".to_string(),
                    params: vec!["n".to_string()],
                    body: vec![
                        Stmt::If {
                            cond: bin(BinOp::Le, ident("n"), int(1)),
                            then_body: vec![Stmt::Return(Some(int(1)))],
                            else_body: vec![],
                        },
                        Stmt::Return(Some(bin(
                            BinOp::Mul,
                            ident("n"),
                            call("fact", vec![bin(BinOp::Sub, ident("n"), int(1))]),
                        ))),
                    ],
                },
                let_stmt("r", call("fact", vec![int(5)])),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(120));
    }

    #[test]
    fn test_function_value_called_dynamically() {
        let value = run_and_read(
            vec![
                Stmt::Fn {
                    name: "square".to_string(),
                    params: vec!["n".to_string()],
                    body: vec![Stmt::Return(Some(bin(BinOp::Mul, ident("n"), ident("n"))))],
                },
                let_stmt("f", ident("square")),
                let_stmt("r", call("f", vec![int(7)])),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(49));
    }

    #[test]
    fn test_anonymous_function_expression() {
        let value = run_and_read(
            vec![
                let_stmt(
                    "triple",
                    Expr::Fn {
                        params: vec!["n".to_string()],
                        body: vec![Stmt::Return(Some(bin(BinOp::Mul, ident("n"), int(3))))],
                    },
                ),
                let_stmt("r", call("triple", vec![int(4)])),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(12));
    }

    #[test]
    fn test_wrong_argument_count_is_recoverable() {
        let (_, result) = run_program(vec![
            Stmt::Fn {
                name: "one".to_string(),
                params: vec!["a".to_string()],
                body: vec![],
            },
            Stmt::Expr(call("one", vec![int(1), int(2)])),
        ]);

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::InvalidArgumentCount);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_call_depth_limit() {
        let natives = NativeRegistry::new();
        let unit = compile(
            &[
                Stmt::Fn {
                    name: "spin".to_string(),
                    params: vec![],
                    body: vec![Stmt::Expr(call("spin", vec![]))],
                },
                Stmt::Expr(call("spin", vec![])),
            ],
            &natives,
        )
        .unwrap();

        let mut vm = Vm::with_config(
            &unit,
            &natives,
            VmConfig {
                max_call_depth: 16,
                ..VmConfig::default()
            },
        );

        let err = vm.run().unwrap_err();
        assert_eq!(err.kind, FaultKind::LimitExceeded);
    }

    // =========================================================================
    // Natives
    // =========================================================================

    fn math_natives() -> NativeRegistry {
        let mut natives = NativeRegistry::new();
        natives.register("scale", vec![TypeTag::Int, TypeTag::Int], |args| {
            match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
                _ => unreachable!("type-checked by the VM"),
            }
        });
        natives
    }

    #[test]
    fn test_native_call() {
        let natives = math_natives();
        init_logs();
        let unit = compile(
            &[let_stmt("r", call("scale", vec![int(6), int(7)]))],
            &natives,
        )
        .unwrap();

        let mut vm = Vm::new(&unit, &natives);
        vm.run().unwrap();
        assert_eq!(vm.slot(slot_of(&unit, "r")).unwrap(), &Value::Int(42));
    }

    #[test]
    fn test_native_argument_count_is_recoverable() {
        let natives = math_natives();
        let (_, result) = run_with_natives(
            vec![Stmt::Expr(call("scale", vec![int(1)]))],
            &natives,
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::InvalidArgumentCount);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_native_argument_type_is_fatal() {
        let natives = math_natives();
        let (_, result) = run_with_natives(
            vec![Stmt::Expr(call("scale", vec![int(1), Expr::Bool(true)]))],
            &natives,
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::TypeMismatch);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_native_fault_propagates() {
        let mut natives = NativeRegistry::new();
        natives.register("always_fails", vec![], |_| Err(division_by_zero()));

        let (_, result) = run_with_natives(
            vec![Stmt::Expr(call("always_fails", vec![]))],
            &natives,
        );

        assert_eq!(result.unwrap_err().kind, FaultKind::DivideByZero);
    }

    // =========================================================================
    // Faults
    // =========================================================================

    #[test]
    fn test_divide_by_zero_is_recoverable() {
        let (_, result) = run_program(vec![Stmt::Expr(bin(BinOp::Div, int(1), int(0)))]);

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::DivideByZero);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_remainder_by_zero_is_recoverable() {
        let (_, result) = run_program(vec![Stmt::Expr(bin(BinOp::Rem, int(1), int(0)))]);
        assert_eq!(result.unwrap_err().kind, FaultKind::DivideByZero);
    }

    #[test]
    fn test_type_mismatch_is_fatal_and_located() {
        let (_, result) = run_program(vec![Stmt::Expr(bin(BinOp::Add, int(1), Expr::Bool(true)))]);

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::TypeMismatch);
        assert!(!err.is_recoverable());
        assert!(err.pc.is_some());
        assert_eq!(err.opcode, Some(OpCode::Binary as u8));
    }

    #[test]
    fn test_calling_a_non_callable_is_fatal() {
        let (_, result) = run_program(vec![
            let_stmt("x", int(3)),
            Stmt::Expr(call("x", vec![])),
        ]);

        let err = result.unwrap_err();
        assert_eq!(err.kind, FaultKind::NotCallable);
        assert!(err.pc.is_some());
    }

    #[test]
    fn test_stack_underflow_is_fatal() {
        let err = run_manual(&[Instr::Pop, Instr::Halt]).unwrap_err();

        assert_eq!(err.kind, FaultKind::StackUnderflow);
        assert_eq!(err.pc, Some(0));
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let natives = NativeRegistry::new();
        let unit = CompiledUnit {
            code: vec![0xFF],
            entry: 0,
            table: SymbolTable::new(),
        };

        let err = Vm::new(&unit, &natives).run().unwrap_err();
        assert_eq!(err.kind, FaultKind::UnknownOpcode);
        assert_eq!(err.opcode, Some(0xFF));
    }

    #[test]
    fn test_leaked_symbolic_jump_is_fatal() {
        use crate::bytecode::op::{JumpCond, LoopTarget};

        let err = run_manual(&[
            Instr::LoopJump {
                to: LoopTarget::End,
                when: JumpCond::Always,
            },
            Instr::Halt,
        ])
        .unwrap_err();

        assert_eq!(err.kind, FaultKind::UnknownOpcode);
        assert!(err.to_string().contains("unresolved loop jump"));
    }

    #[test]
    fn test_running_off_the_end_is_fatal() {
        let err = run_manual(&[Instr::PushNull]).unwrap_err();
        assert_eq!(err.kind, FaultKind::UnknownOpcode);
    }

    #[test]
    fn test_step_limit() {
        let natives = NativeRegistry::new();
        let unit = compile(
            &[Stmt::While {
                cond: Expr::Bool(true),
                body: vec![],
            }],
            &natives,
        )
        .unwrap();

        let mut vm = Vm::with_config(
            &unit,
            &natives,
            VmConfig {
                max_steps: Some(200),
                ..VmConfig::default()
            },
        );

        let err = vm.run().unwrap_err();
        assert_eq!(err.kind, FaultKind::LimitExceeded);
    }

    // =========================================================================
    // Merged-address behavior end to end
    // =========================================================================

    #[test]
    fn test_loop_inside_nested_block_jumps_correctly() {
        // The loop's resolved addresses go through two merges before they are
        // final; a rebase mistake would send the back jump somewhere wild.
        let value = run_and_read(
            vec![
                let_stmt("n", int(0)),
                Stmt::Block(vec![Stmt::Block(vec![Stmt::While {
                    cond: bin(BinOp::Lt, ident("n"), int(4)),
                    body: vec![assign("n", bin(BinOp::Add, ident("n"), int(1)))],
                }])]),
            ],
            "n",
        );
        assert_eq!(value, Value::Int(4));
    }

    #[test]
    fn test_loop_inside_function_body() {
        let value = run_and_read(
            vec![
                Stmt::Fn {
                    name: "sum_to".to_string(),
                    params: vec!["limit".to_string()],
                    body: vec![
                        let_stmt("acc", int(0)),
                        let_stmt("k", int(0)),
                        Stmt::While {
                            cond: bin(BinOp::Lt, ident("k"), ident("limit")),
                            body: vec![
                                assign("k", bin(BinOp::Add, ident("k"), int(1))),
                                assign("acc", bin(BinOp::Add, ident("acc"), ident("k"))),
                            ],
                        },
                        Stmt::Return(Some(ident("acc"))),
                    ],
                },
                let_stmt("r", call("sum_to", vec![int(4)])),
            ],
            "r",
        );
        assert_eq!(value, Value::Int(10));
    }
}
