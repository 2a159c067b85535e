//! The code generator: a depth-first walk over a fully decorated [Program]
//! that emits a flat instruction stream for the machine in `machine.rs`.
//!
//! Calling convention (the analyser and this module must agree on it):
//! the caller reserves space for the callee's return value first (if any),
//! then pushes each argument in declaration order, then `cfu`s; the
//! callee's `enf` saves the old display and sets the new frame base.
//! `ret scope, paramSize` restores the display and pc and pops exactly the
//! pushed arguments, leaving the reserved return slot -- still holding
//! whatever the callee stored into it -- as the new top of stack, i.e. the
//! call expression's value.

use crate::ast::*;
use std::collections::HashMap;

/// A single emitted instruction. Mirrors the mnemonic table: each variant
/// carries exactly the operands the mnemonic needs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Instruction {
    Stp,
    End,
    Ldc(i64),
    /// `ldv i j`: push memory[display[i]+j]
    Ldv(usize, isize),
    /// `ldr i j`: push the address display[i]+j
    Ldr(usize, isize),
    /// `stv i j`: pop into memory[display[i]+j]
    Stv(usize, isize),
    /// `lrv i j`: push memory[memory[display[i]+j]] (through reference)
    Lrv(usize, isize),
    /// `srv i j`: pop and store through reference
    Srv(usize, isize),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Abs,
    /// Case-fold the char on top of stack to uppercase, if it's a letter.
    Upper,
    /// Case-fold the char on top of stack to lowercase, if it's a letter.
    Lower,
    And,
    Lor,
    Les,
    Leq,
    Grt,
    Gre,
    Equ,
    Neq,
    Jmp(usize),
    Jof(usize),
    Lbl(usize),
    Alc(usize),
    Dlc(usize),
    Cfu(usize),
    Enf(usize),
    /// `ret k n`: restore display[k], return pc, pop (n+2) slots
    Ret(usize, usize),
    /// `idx k`: pop index; TOS += index*k
    Idx(usize),
    Grc,
    Lmv(usize),
    Smv(usize),
    Smr(usize),
    /// Store-indirect: pop an address, pop a scalar value, write the value
    /// at that address. Not part of the original mnemonic table; added as
    /// the write-side counterpart to `grc` for dereferencing an arbitrary
    /// computed address rather than one held in a named variable's slot
    /// (which `srv` already covers).
    Sti,
    Sts(usize),
    Rdv,
    Rdc,
    Rds,
    /// `prv ischar`
    Prv(bool),
    Prc(usize),
    Prs,
    /// `num`: pop the address of a `chars[n]` location, parse its digits as
    /// a decimal integer, and push the result.
    Num,
}

/// The output of code generation: ready to execute as-is.
pub struct CompiledProgram {
    pub instructions: Vec<Instruction>,
    pub string_heap: Vec<String>,
}

#[derive(Copy, Clone)]
struct ProcMeta {
    entry_label: usize,
    end_label: usize,
    scope: usize,
    param_size: usize,
    return_size: usize,
    return_offset: Option<isize>,
}

#[derive(Copy, Clone)]
struct CurrentProc {
    scope: usize,
    param_size: usize,
    local_size: usize,
    return_offset: Option<isize>,
}

pub fn generate(program: &Program<Decoration>, string_heap: Vec<String>) -> CompiledProgram {
    let mut gen = CodeGenerator::new();
    gen.collect_procs(&program.body);
    gen.emit(Instruction::Stp);
    let global_size = frame_size(&program.body);
    if global_size > 0 {
        gen.emit(Instruction::Alc(global_size));
    }
    for stmt in &program.body {
        gen.emit_statement(stmt.value());
    }
    gen.emit(Instruction::End);
    CompiledProgram {
        instructions: gen.instructions,
        string_heap,
    }
}

struct CodeGenerator {
    instructions: Vec<Instruction>,
    next_label: usize,
    procs: HashMap<String, ProcMeta>,
    proc_stack: Vec<CurrentProc>,
    /// Active labelled blocks, innermost last: (label name, end label id).
    exit_targets: Vec<(String, usize)>,
}

impl CodeGenerator {
    fn new() -> Self {
        CodeGenerator {
            instructions: Vec::new(),
            next_label: 0,
            procs: HashMap::new(),
            proc_stack: Vec::new(),
            exit_targets: Vec::new(),
        }
    }

    fn alloc_label(&mut self) -> usize {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn emit(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    // ---- procedure metadata prepass -------------------------------------

    fn collect_procs(&mut self, stmts: &[Node<Statement<Decoration>, Decoration>]) {
        for stmt in stmts {
            match stmt.value() {
                Statement::Procedure(node) => {
                    let def = node.value();
                    let entry_label = self.alloc_label();
                    let end_label = self.alloc_label();
                    let param_size: usize = def.params.iter().map(|p| p.metadata().size).sum();
                    let return_size = def
                        .result_mode
                        .as_ref()
                        .and_then(|m| m.metadata().raw_type.clone())
                        .map(|m| m.size())
                        .unwrap_or(0);
                    let return_offset = if def.result_mode.is_some() {
                        Some(-(2 + param_size as isize + return_size as isize))
                    } else {
                        None
                    };
                    self.procs.insert(
                        def.name.clone(),
                        ProcMeta {
                            entry_label,
                            end_label,
                            scope: node.metadata().scope,
                            param_size,
                            return_size,
                            return_offset,
                        },
                    );
                    self.collect_procs(&def.body);
                }
                Statement::Action(action) => self.collect_procs_action(action.value()),
                Statement::Declaration(_) => {}
            }
        }
    }

    fn collect_procs_action(&mut self, action: &ActionStatement<Decoration>) {
        match action {
            ActionStatement::If { arms, else_body } => {
                for (_, body) in arms {
                    self.collect_procs(body);
                }
                if let Some(body) = else_body {
                    self.collect_procs(body);
                }
            }
            ActionStatement::Do { body, .. } => self.collect_procs(body),
            ActionStatement::Labelled { body, .. } => self.collect_procs(body),
            _ => {}
        }
    }

    // ---- statements --------------------------------------------------------

    fn emit_statement(&mut self, stmt: &Statement<Decoration>) {
        match stmt {
            Statement::Declaration(decl) => self.emit_declaration(decl.value()),
            Statement::Procedure(def) => self.emit_procedure(def),
            Statement::Action(action) => self.emit_action(action.value()),
        }
    }

    fn emit_declaration(&mut self, decl: &Declaration<Decoration>) {
        // `dcl a, b mode = init;` evaluates `init` once per name and stores
        // the same value into each. Synonyms and mode aliases are purely
        // compile-time and need no runtime storage.
        if let Declaration::Variable { names, init, .. } = decl {
            if let Some(init) = init {
                for name in names {
                    let deco = name.metadata();
                    if deco.size > 1 {
                        self.emit(Instruction::Ldr(deco.scope, deco.offset));
                        self.emit_composite_store(deco.size, init);
                    } else {
                        self.emit_expr(init);
                        self.emit(Instruction::Stv(deco.scope, deco.offset));
                    }
                }
            }
        }
    }

    /// Write a composite (multi-slot) value into the destination address
    /// already sitting on top of stack. A string literal is copied
    /// directly out of the string heap; anything else is assumed to
    /// itself be a location, and is copied slot-for-slot.
    fn emit_composite_store(&mut self, size: usize, value: &Node<Expr<Decoration>, Decoration>) {
        if let Expr::Literal(Literal::String(_)) = value.value() {
            let idx = value.metadata().heap_index.expect("interned by analyser");
            self.emit(Instruction::Sts(idx));
        } else {
            self.emit_address(value);
            self.emit(Instruction::Lmv(size));
            self.emit(Instruction::Smv(size));
        }
    }

    fn emit_procedure(&mut self, node: &Node<ProcedureDef<Decoration>, Decoration>) {
        let def = node.value();
        let meta = *self.procs.get(&def.name).expect("collected in prepass");

        self.emit(Instruction::Jmp(meta.end_label));
        self.emit(Instruction::Lbl(meta.entry_label));
        self.emit(Instruction::Enf(meta.scope));

        let local_size = frame_size(&def.body);
        if local_size > 0 {
            self.emit(Instruction::Alc(local_size));
        }

        self.proc_stack.push(CurrentProc {
            scope: meta.scope,
            param_size: meta.param_size,
            local_size,
            return_offset: meta.return_offset,
        });
        for stmt in &def.body {
            self.emit_statement(stmt.value());
        }
        self.proc_stack.pop();

        if local_size > 0 {
            self.emit(Instruction::Dlc(local_size));
        }
        self.emit(Instruction::Ret(meta.scope, meta.param_size));
        self.emit(Instruction::Lbl(meta.end_label));
    }

    fn emit_action(&mut self, action: &ActionStatement<Decoration>) {
        match action {
            ActionStatement::Assign { target, op, value } => {
                let value_size = mode_size(target.metadata());
                if value_size > 1 {
                    // Compound assignment on a composite target (string
                    // concatenation) isn't supported at the VM level; the
                    // analyser only allows `+=` there, which we treat as a
                    // plain overwrite.
                    self.emit_address(target);
                    self.emit_composite_store(value_size, value);
                } else {
                    if let Some(op) = op {
                        self.emit_load(target);
                        self.emit_expr(value);
                        self.emit_binop(*op);
                    } else {
                        self.emit_expr(value);
                    }
                    self.emit_store(target);
                }
            }
            ActionStatement::If { arms, else_body } => self.emit_if_chain(arms, else_body, 0),
            ActionStatement::Do {
                control,
                while_cond,
                body,
            } => self.emit_do(control, while_cond, body),
            ActionStatement::Labelled { label, body } => {
                let end_label = self.alloc_label();
                self.exit_targets.push((label.clone(), end_label));
                for stmt in body {
                    self.emit_statement(stmt.value());
                }
                self.exit_targets.pop();
                self.emit(Instruction::Lbl(end_label));
            }
            ActionStatement::Exit { label } => {
                let target = self
                    .exit_targets
                    .iter()
                    .rev()
                    .find(|(l, _)| l == label)
                    .map(|(_, id)| *id)
                    .expect("exit label validated during analysis");
                self.emit(Instruction::Jmp(target));
            }
            ActionStatement::Return { value } => {
                let current = *self.proc_stack.last().expect("return inside a procedure");
                if let Some(value) = value {
                    let return_offset = current.return_offset.expect("value-returning procedure");
                    let size = mode_size(value.metadata());
                    if size > 1 {
                        self.emit(Instruction::Ldr(current.scope, return_offset));
                        self.emit_composite_store(size, value);
                    } else {
                        self.emit_expr(value);
                        self.emit(Instruction::Stv(current.scope, return_offset));
                    }
                }
                if current.local_size > 0 {
                    self.emit(Instruction::Dlc(current.local_size));
                }
                self.emit(Instruction::Ret(current.scope, current.param_size));
            }
            ActionStatement::Call { name, args } => {
                self.emit_call(name, args);
                if let Some(meta) = self.procs.get(name) {
                    if meta.return_size > 0 {
                        self.emit(Instruction::Dlc(meta.return_size));
                    }
                }
            }
            ActionStatement::BuiltinCall { builtin, args } => {
                self.emit_builtin_proc(*builtin, args)
            }
        }
    }

    fn emit_if_chain(
        &mut self,
        arms: &[(Node<Expr<Decoration>, Decoration>, Vec<Node<Statement<Decoration>, Decoration>>)],
        else_body: &Option<Vec<Node<Statement<Decoration>, Decoration>>>,
        idx: usize,
    ) {
        if idx >= arms.len() {
            if let Some(body) = else_body {
                for stmt in body {
                    self.emit_statement(stmt.value());
                }
            }
            return;
        }
        let (cond, body) = &arms[idx];
        // A folded-true boolean emits only the taken branch, with no `jof`.
        if let Some(ConstValue::Bool(value)) = &cond.metadata().value {
            if *value {
                for stmt in body {
                    self.emit_statement(stmt.value());
                }
            } else {
                self.emit_if_chain(arms, else_body, idx + 1);
            }
            return;
        }

        let else_label = self.alloc_label();
        let end_label = self.alloc_label();
        self.emit_expr(cond);
        self.emit(Instruction::Jof(else_label));
        for stmt in body {
            self.emit_statement(stmt.value());
        }
        self.emit(Instruction::Jmp(end_label));
        self.emit(Instruction::Lbl(else_label));
        self.emit_if_chain(arms, else_body, idx + 1);
        self.emit(Instruction::Lbl(end_label));
    }

    fn emit_do(
        &mut self,
        control: &Option<ForControl<Decoration>>,
        while_cond: &Option<Box<Node<Expr<Decoration>, Decoration>>>,
        body: &[Node<Statement<Decoration>, Decoration>],
    ) {
        match control {
            Some(ForControl::Step {
                counter,
                from,
                step,
                to,
                down,
            }) => self.emit_for_step(counter, from, step, to, *down, while_cond, body),
            Some(ForControl::Range {
                counter,
                mode,
                down,
            }) => self.emit_for_range(counter, mode, *down, while_cond, body),
            None => {
                let cond = while_cond.as_ref().expect("a plain `do` loop needs a while guard");
                self.emit_while(cond, body);
            }
        }
    }

    fn emit_while(&mut self, cond: &Node<Expr<Decoration>, Decoration>, body: &[Node<Statement<Decoration>, Decoration>]) {
        let start = self.alloc_label();
        let end = self.alloc_label();
        self.emit(Instruction::Lbl(start));
        self.emit_expr(cond);
        self.emit(Instruction::Jof(end));
        for stmt in body {
            self.emit_statement(stmt.value());
        }
        self.emit(Instruction::Jmp(start));
        self.emit(Instruction::Lbl(end));
    }

    fn emit_for_step(
        &mut self,
        counter: &Node<String, Decoration>,
        from: &Node<Expr<Decoration>, Decoration>,
        step: &Option<Box<Node<Expr<Decoration>, Decoration>>>,
        to: &Node<Expr<Decoration>, Decoration>,
        down: bool,
        while_cond: &Option<Box<Node<Expr<Decoration>, Decoration>>>,
        body: &[Node<Statement<Decoration>, Decoration>],
    ) {
        let scope = counter.metadata().scope;
        let offset = counter.metadata().offset;

        self.emit_expr(from);
        self.emit(Instruction::Stv(scope, offset));

        let start = self.alloc_label();
        let end = self.alloc_label();
        self.emit(Instruction::Lbl(start));
        self.emit(Instruction::Ldv(scope, offset));
        self.emit_expr(to);
        self.emit(if down { Instruction::Gre } else { Instruction::Leq });
        self.emit(Instruction::Jof(end));
        if let Some(cond) = while_cond {
            self.emit_expr(cond);
            self.emit(Instruction::Jof(end));
        }
        for stmt in body {
            self.emit_statement(stmt.value());
        }
        self.emit(Instruction::Ldv(scope, offset));
        match step {
            Some(step_expr) => self.emit_expr(step_expr),
            None => self.emit(Instruction::Ldc(1)),
        }
        self.emit(if down { Instruction::Sub } else { Instruction::Add });
        self.emit(Instruction::Stv(scope, offset));
        self.emit(Instruction::Jmp(start));
        self.emit(Instruction::Lbl(end));
    }

    fn emit_for_range(
        &mut self,
        counter: &Node<String, Decoration>,
        mode: &Node<ModeExpr<Decoration>, Decoration>,
        down: bool,
        while_cond: &Option<Box<Node<Expr<Decoration>, Decoration>>>,
        body: &[Node<Statement<Decoration>, Decoration>],
    ) {
        let scope = counter.metadata().scope;
        let offset = counter.metadata().offset;
        let (lower, upper) = match &mode.metadata().raw_type {
            Some(Mode::Range { lower, upper, .. }) => (*lower, *upper),
            Some(Mode::Array { lower, upper, .. }) => (*lower, *upper),
            _ => (0, -1),
        };

        self.emit(Instruction::Ldc(if down { upper } else { lower }));
        self.emit(Instruction::Stv(scope, offset));

        let start = self.alloc_label();
        let end = self.alloc_label();
        self.emit(Instruction::Lbl(start));
        self.emit(Instruction::Ldv(scope, offset));
        self.emit(Instruction::Ldc(if down { lower } else { upper }));
        self.emit(if down { Instruction::Gre } else { Instruction::Leq });
        self.emit(Instruction::Jof(end));
        if let Some(cond) = while_cond {
            self.emit_expr(cond);
            self.emit(Instruction::Jof(end));
        }
        for stmt in body {
            self.emit_statement(stmt.value());
        }
        self.emit(Instruction::Ldv(scope, offset));
        self.emit(Instruction::Ldc(1));
        self.emit(if down { Instruction::Sub } else { Instruction::Add });
        self.emit(Instruction::Stv(scope, offset));
        self.emit(Instruction::Jmp(start));
        self.emit(Instruction::Lbl(end));
    }

    // ---- expressions --------------------------------------------------------

    /// Emit code that leaves this expression's *value* on top of stack.
    fn emit_expr(&mut self, node: &Node<Expr<Decoration>, Decoration>) {
        let deco = node.metadata();
        match node.value() {
            Expr::Literal(lit) => match lit {
                Literal::Int(n) => self.emit(Instruction::Ldc(*n)),
                Literal::Bool(b) => self.emit(Instruction::Ldc(if *b { 1 } else { 0 })),
                Literal::Char(c) => self.emit(Instruction::Ldc(*c as i64)),
                Literal::String(_) => {
                    // A bare string literal used as a value (not assigned
                    // into a `chars[n]`) isn't addressable; `print` handles
                    // string literals directly via `prc` instead of going
                    // through this path.
                    self.emit(Instruction::Ldc(deco.heap_index.unwrap_or(0) as i64));
                }
            },
            Expr::Identifier(_) => self.emit_load(node),
            Expr::Binary(op, lhs, rhs) => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                self.emit_binop(*op);
            }
            Expr::Unary(op, operand) => {
                self.emit_expr(operand);
                match op {
                    UnOp::Neg => self.emit(Instruction::Neg),
                    UnOp::Not => self.emit(Instruction::Not),
                }
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                if let Some(ConstValue::Bool(value)) = &cond.metadata().value {
                    if *value {
                        self.emit_expr(then_expr);
                    } else {
                        self.emit_expr(else_expr);
                    }
                    return;
                }
                let else_label = self.alloc_label();
                let end_label = self.alloc_label();
                self.emit_expr(cond);
                self.emit(Instruction::Jof(else_label));
                self.emit_expr(then_expr);
                self.emit(Instruction::Jmp(end_label));
                self.emit(Instruction::Lbl(else_label));
                self.emit_expr(else_expr);
                self.emit(Instruction::Lbl(end_label));
            }
            Expr::Index { .. } => {
                self.emit_element_address(node);
                self.emit(Instruction::Grc);
            }
            Expr::Dereference(inner) => self.emit_dereference_load(inner),
            Expr::ReferenceOf(inner) => self.emit_address(inner),
            Expr::Call { name, args } => self.emit_call(name, args),
            Expr::Builtin { builtin, args } => self.emit_builtin_func(*builtin, args),
        }
    }

    /// Emit code that leaves this location's *address* on top of stack.
    fn emit_address(&mut self, node: &Node<Expr<Decoration>, Decoration>) {
        match node.value() {
            Expr::Identifier(_) => {
                let deco = node.metadata();
                if deco.loc {
                    // The slot itself already holds an address; loading it
                    // gives the address of the pointee.
                    self.emit(Instruction::Ldv(deco.scope, deco.offset));
                } else {
                    self.emit(Instruction::Ldr(deco.scope, deco.offset));
                }
            }
            Expr::Index { .. } => self.emit_element_address(node),
            Expr::Dereference(inner) => self.emit_expr(inner),
            _ => unreachable!("is_assignable guarantees only these forms reach codegen"),
        }
    }

    /// Emit code that loads the *value* at a location (used on the RHS of a
    /// compound assignment, where the current value is needed).
    fn emit_load(&mut self, node: &Node<Expr<Decoration>, Decoration>) {
        match node.value() {
            Expr::Identifier(_) => {
                let deco = node.metadata();
                if deco.loc {
                    self.emit(Instruction::Lrv(deco.scope, deco.offset));
                } else {
                    self.emit(Instruction::Ldv(deco.scope, deco.offset));
                }
            }
            Expr::Index { .. } => {
                self.emit_element_address(node);
                self.emit(Instruction::Grc);
            }
            Expr::Dereference(inner) => self.emit_dereference_load(inner),
            _ => self.emit_expr(node),
        }
    }

    /// Load through a `->` dereference. When the pointer itself is a plain
    /// named variable, `lrv` reads through its slot directly in one step --
    /// exactly the same opcode a `loc` parameter's bare name resolves to.
    /// Anything else is a general computed address, read via `grc`.
    fn emit_dereference_load(&mut self, inner: &Node<Expr<Decoration>, Decoration>) {
        if let Expr::Identifier(_) = inner.value() {
            let deco = inner.metadata();
            self.emit(Instruction::Lrv(deco.scope, deco.offset));
        } else {
            self.emit_expr(inner);
            self.emit(Instruction::Grc);
        }
    }

    /// Emit code that pops the value on top of stack into a location.
    fn emit_store(&mut self, node: &Node<Expr<Decoration>, Decoration>) {
        match node.value() {
            Expr::Identifier(_) => {
                let deco = node.metadata();
                if deco.loc {
                    self.emit(Instruction::Srv(deco.scope, deco.offset));
                } else {
                    self.emit(Instruction::Stv(deco.scope, deco.offset));
                }
            }
            // Scalar element/dereference stores only: the Assign arm routes
            // composite (`size > 1`) targets through `emit_composite_assign`
            // before a plain value is ever pushed for this path.
            Expr::Index { .. } => {
                self.emit_element_address(node);
                self.emit(Instruction::Sti);
            }
            Expr::Dereference(inner) => {
                if let Expr::Identifier(_) = inner.value() {
                    let deco = inner.metadata();
                    self.emit(Instruction::Srv(deco.scope, deco.offset));
                } else {
                    self.emit_expr(inner);
                    self.emit(Instruction::Sti);
                }
            }
            _ => unreachable!("is_assignable guarantees only these forms reach codegen"),
        }
    }

    /// Emit code that leaves an array element's address on top of stack,
    /// biasing the index by the array's lower bound as decorated.
    fn emit_element_address(&mut self, node: &Node<Expr<Decoration>, Decoration>) {
        if let Expr::Index { base, index } = node.value() {
            self.emit_address(base);
            self.emit_expr(index);
            if let Some(lower) = node.metadata().lower_bound_value {
                if lower != 0 {
                    self.emit(Instruction::Ldc(lower));
                    self.emit(Instruction::Sub);
                }
            }
            let elem_size = node.metadata().raw_type.as_ref().map(|m| m.size()).unwrap_or(1);
            self.emit(Instruction::Idx(elem_size));
        }
    }

    fn emit_binop(&mut self, op: BinOp) {
        self.emit(match op {
            BinOp::Add => Instruction::Add,
            BinOp::Sub => Instruction::Sub,
            BinOp::Mul => Instruction::Mul,
            BinOp::Div => Instruction::Div,
            BinOp::Mod => Instruction::Mod,
            BinOp::Eq => Instruction::Equ,
            BinOp::Neq => Instruction::Neq,
            BinOp::Lt => Instruction::Les,
            BinOp::Le => Instruction::Leq,
            BinOp::Gt => Instruction::Grt,
            BinOp::Ge => Instruction::Gre,
            BinOp::And => Instruction::And,
            BinOp::Or => Instruction::Lor,
        });
    }

    /// Emit a call, leaving the callee's return value (if any) on top of
    /// stack; leaves nothing extra for a void callee.
    fn emit_call(&mut self, name: &str, args: &[Node<Expr<Decoration>, Decoration>]) {
        let meta = *self.procs.get(name).expect("resolved during analysis");
        if meta.return_size > 0 {
            self.emit(Instruction::Alc(meta.return_size));
        }
        for arg in args {
            if arg.metadata().is_reference {
                self.emit_address(arg);
            } else {
                let size = mode_size(arg.metadata());
                if size > 1 {
                    // A composite by-value argument: push a copy of the
                    // callee's `size` slots rather than a single scalar.
                    // Only addressable arguments (a variable, an array
                    // element, a dereference) can be copied this way;
                    // the analyser permits arbitrary composite
                    // expressions here, but a bare string literal passed
                    // directly (not through a variable) has no address
                    // to copy from and isn't supported.
                    self.emit_address(arg);
                    self.emit(Instruction::Lmv(size));
                } else {
                    self.emit_expr(arg);
                }
            }
        }
        self.emit(Instruction::Cfu(meta.entry_label));
    }

    // ---- built-ins --------------------------------------------------------

    fn emit_builtin_proc(&mut self, builtin: BuiltinProc, args: &[Node<Expr<Decoration>, Decoration>]) {
        match builtin {
            BuiltinProc::Print => {
                for arg in args {
                    self.emit_print(arg);
                }
            }
            BuiltinProc::Read => {
                for arg in args {
                    self.emit_read(arg);
                }
            }
        }
    }

    fn emit_print(&mut self, arg: &Node<Expr<Decoration>, Decoration>) {
        match arg.value() {
            Expr::Literal(Literal::String(_)) => {
                let idx = arg.metadata().heap_index.expect("interned by analyser");
                self.emit(Instruction::Prc(idx));
            }
            _ => match &arg.metadata().raw_type {
                Some(Mode::Char) => {
                    self.emit_expr(arg);
                    self.emit(Instruction::Prv(true));
                }
                Some(Mode::String { .. }) => {
                    self.emit_address(arg);
                    self.emit(Instruction::Prs);
                }
                _ => {
                    self.emit_expr(arg);
                    self.emit(Instruction::Prv(false));
                }
            },
        }
    }

    fn emit_read(&mut self, arg: &Node<Expr<Decoration>, Decoration>) {
        match &arg.metadata().raw_type {
            Some(Mode::Char) => {
                self.emit(Instruction::Rdc);
                self.emit_store(arg);
            }
            Some(Mode::String { .. }) => {
                self.emit_address(arg);
                self.emit(Instruction::Rds);
            }
            _ => {
                self.emit(Instruction::Rdv);
                self.emit_store(arg);
            }
        }
    }

    fn emit_builtin_func(&mut self, builtin: BuiltinFunc, args: &[Node<Expr<Decoration>, Decoration>]) {
        match builtin {
            BuiltinFunc::Abs => {
                self.emit_expr(&args[0]);
                self.emit(Instruction::Abs);
            }
            BuiltinFunc::Upper => {
                self.emit_expr(&args[0]);
                self.emit(Instruction::Upper);
            }
            BuiltinFunc::Lower => {
                self.emit_expr(&args[0]);
                self.emit(Instruction::Lower);
            }
            BuiltinFunc::Num => {
                // Parses the full run of digit characters stored at a
                // `chars[n]` location as a decimal integer.
                self.emit_address(&args[0]);
                self.emit(Instruction::Num);
            }
            BuiltinFunc::Asc => {
                // `char` values are already stored as their code point.
                self.emit_expr(&args[0]);
            }
            BuiltinFunc::Length => match &args[0].metadata().raw_type {
                Some(Mode::Array { lower, upper, .. }) => {
                    self.emit(Instruction::Ldc(upper - lower + 1));
                }
                _ => self.emit(Instruction::Ldc(0)),
            },
        }
    }
}

/// The number of slots a decorated expression's *value* occupies, as
/// opposed to the slot(s) its own storage location takes up. For a plain
/// variable these coincide, but a `loc` parameter's `size` is always 1
/// (it's one slot holding an address) even when the mode it points to is
/// composite, so `raw_type.size()` -- the pointee's size for `loc`
/// parameters, the value's own size everywhere else -- is the one
/// reliable signal for "does this assignment/return need the
/// block-copy path".
fn mode_size(deco: &Decoration) -> usize {
    deco.raw_type.as_ref().map(Mode::size).unwrap_or(1)
}

/// Total storage, in slots, of every variable declared directly within
/// `stmts` -- recursing into `if`/`do`/labelled bodies (which share the
/// enclosing procedure's frame) but not into nested procedure bodies
/// (which get their own).
fn frame_size(stmts: &[Node<Statement<Decoration>, Decoration>]) -> usize {
    let mut total = 0;
    for stmt in stmts {
        match stmt.value() {
            Statement::Declaration(decl) => {
                if let Declaration::Variable { names, mode, .. } = decl.value() {
                    let size = mode.metadata().raw_type.clone().map(|m| m.size()).unwrap_or(0);
                    total += size * names.len();
                }
            }
            Statement::Action(action) => total += frame_size_action(action.value()),
            Statement::Procedure(_) => {}
        }
    }
    total
}

fn frame_size_action(action: &ActionStatement<Decoration>) -> usize {
    match action {
        ActionStatement::If { arms, else_body } => {
            let mut total = 0;
            for (_, body) in arms {
                total += frame_size(body);
            }
            if let Some(body) = else_body {
                total += frame_size(body);
            }
            total
        }
        ActionStatement::Do { body, .. } => frame_size(body),
        ActionStatement::Labelled { body, .. } => frame_size(body),
        _ => 0,
    }
}
