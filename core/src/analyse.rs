//! The semantic analyser: walks a freshly parsed AST exactly once, resolves
//! every identifier against the scope table, checks mode compatibility,
//! folds constant sub-expressions, interns string literals into the
//! string-literal heap, and decorates every node. Errors are accumulated
//! rather than raised immediately, so a single run can report more than
//! one mistake.

use crate::ast::*;
use crate::error::{CompileError, CompileErrors, SourceErrorWrapper};
use crate::scope::{Entity, Environment, ParamSpec, ProcedureContext};
use crate::util::Span;

/// The product of a successful analysis pass: the fully decorated program,
/// plus the string-literal heap the code generator will embed verbatim.
pub struct AnalysisOutput {
    pub program: Program<Decoration>,
    pub string_heap: Vec<String>,
}

/// Entry point: analyse a freshly parsed program. `source` is the original
/// source text, needed only to slice out the text spanned by each error.
pub fn analyse(program: Program<Span>, source: &str) -> Result<AnalysisOutput, CompileErrors> {
    let mut analyser = Analyser::new(source);
    let decorated = analyser.analyse_program(program);
    if analyser.errors.is_empty() {
        Ok(AnalysisOutput {
            program: decorated,
            string_heap: analyser.string_heap,
        })
    } else {
        Err(CompileErrors::new(analyser.errors, source.to_string()))
    }
}

struct Analyser<'src> {
    env: Environment,
    errors: Vec<SourceErrorWrapper<CompileError>>,
    source: &'src str,
    string_heap: Vec<String>,
    /// Stack of currently enclosing labelled-block names, innermost last.
    /// Used to validate `exit label;`.
    label_stack: Vec<String>,
}

impl<'src> Analyser<'src> {
    fn new(source: &'src str) -> Self {
        Analyser {
            env: Environment::new(),
            errors: Vec::new(),
            source,
            string_heap: Vec::new(),
            label_stack: Vec::new(),
        }
    }

    fn error(&mut self, err: CompileError, span: Span) {
        self.errors
            .push(SourceErrorWrapper::new(err, span, self.source));
    }

    fn decoration(&self, span: Span) -> Decoration {
        Decoration::new(span)
    }

    // ---- top level -----------------------------------------------------

    fn analyse_program(&mut self, program: Program<Span>) -> Program<Decoration> {
        let body = program
            .body
            .into_iter()
            .map(|stmt| self.analyse_statement(stmt))
            .collect();
        Program { body }
    }

    fn analyse_statement(&mut self, node: Node<Statement<Span>, Span>) -> Node<Statement<Decoration>, Decoration> {
        let span = *node.metadata();
        let deco = self.decoration(span);
        match node.0 {
            Statement::Declaration(decl) => {
                let decl = self.analyse_declaration(decl);
                Node(Statement::Declaration(decl), deco)
            }
            Statement::Procedure(proc) => {
                let proc = self.analyse_procedure(proc);
                Node(Statement::Procedure(proc), deco)
            }
            Statement::Action(action) => {
                let action = self.analyse_action(action);
                Node(Statement::Action(action), deco)
            }
        }
    }

    // ---- declarations ----------------------------------------------------

    fn analyse_declaration(
        &mut self,
        node: Node<Declaration<Span>, Span>,
    ) -> Node<Declaration<Decoration>, Decoration> {
        let span = *node.metadata();
        let deco = self.decoration(span);
        let decl = match node.0 {
            Declaration::Variable { names, mode, init } => {
                let mode_node = self.resolve_mode_node(mode);
                let resolved = mode_node.metadata().raw_type.clone().unwrap_or(Mode::Void);
                let size = resolved.size();

                let init = init.map(|init_expr| {
                    let init_expr = self.analyse_expr(init_expr);
                    let init_type = init_expr.metadata().raw_type.clone().unwrap_or(Mode::Void);
                    if !modes_match(&resolved, &init_type) {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "declaration init",
                                expected: fmt_mode(&resolved),
                                found: fmt_mode(&init_type),
                            },
                            *init_expr.metadata_span(),
                        );
                    }
                    init_expr
                });

                let mut names_out = Vec::with_capacity(names.len());
                for name in names {
                    let name_span = *name.metadata();
                    let name = name.0;
                    let offset = self.env.reserve_offset(size);
                    let scope = self.env.current_scope_id();

                    let mut name_deco = self.decoration(name_span);
                    name_deco.raw_type = Some(resolved.clone());
                    name_deco.dcl_type = Some(DclType::Var);
                    name_deco.size = size;
                    name_deco.scope = scope;
                    name_deco.offset = offset;

                    if self.env.lookup_local(&name).is_some() {
                        self.error(
                            CompileError::Redeclaration {
                                name: name.clone(),
                                original: name_span,
                            },
                            name_span,
                        );
                    } else {
                        self.env
                            .add_local(&name, Entity::var(resolved.clone(), false, size, offset, scope));
                    }
                    names_out.push(Node(name, name_deco));
                }

                Declaration::Variable {
                    names: names_out,
                    mode: mode_node,
                    init,
                }
            }
            Declaration::Synonym { bindings, mode } => {
                let declared_mode = mode.map(|m| self.resolve_mode_node(m));
                let mut out_bindings = Vec::with_capacity(bindings.len());
                for (name, expr) in bindings {
                    let expr = self.analyse_expr(expr);
                    let expr_type = expr.metadata().raw_type.clone().unwrap_or(Mode::Void);
                    if let Some(declared) = &declared_mode {
                        let declared_type =
                            declared.metadata().raw_type.clone().unwrap_or(Mode::Void);
                        if !modes_match(&declared_type, &expr_type) {
                            self.error(
                                CompileError::ModeMismatch {
                                    context: "synonym",
                                    expected: fmt_mode(&declared_type),
                                    found: fmt_mode(&expr_type),
                                },
                                *expr.metadata_span(),
                            );
                        }
                    }
                    let value = expr.metadata().value.clone();
                    if self.env.lookup_local(&name).is_some() {
                        self.error(
                            CompileError::Redeclaration {
                                name: name.clone(),
                                original: span,
                            },
                            span,
                        );
                    } else if let Some(value) = value.clone() {
                        let scope = self.env.current_scope_id();
                        self.env
                            .add_local(&name, Entity::synonym(expr_type.clone(), value, scope));
                    } else {
                        self.error(
                            CompileError::ConstantFoldError {
                                reason: format!("synonym `{}` is not a compile-time constant", name),
                            },
                            span,
                        );
                    }
                    out_bindings.push((name, expr));
                }
                Declaration::Synonym {
                    bindings: out_bindings,
                    mode: declared_mode,
                }
            }
            Declaration::NewMode { bindings } => {
                let mut out = Vec::with_capacity(bindings.len());
                for (name, mode_expr) in bindings {
                    let mode_node = self.resolve_mode_node(mode_expr);
                    out.push((name, mode_node));
                }
                Declaration::NewMode { bindings: out }
            }
        };
        Node(decl, deco)
    }

    /// Resolve a [ModeExpr] syntax node into its [Mode] meaning, recording
    /// the result on the node's own decoration.
    fn resolve_mode_node(
        &mut self,
        node: Node<ModeExpr<Span>, Span>,
    ) -> Node<ModeExpr<Decoration>, Decoration> {
        let span = *node.metadata();
        let (mode_expr, resolved) = match node.0 {
            ModeExpr::Int => (ModeExpr::Int, Mode::Int),
            ModeExpr::Bool => (ModeExpr::Bool, Mode::Bool),
            ModeExpr::Char => (ModeExpr::Char, Mode::Char),
            ModeExpr::String(len_expr) => {
                let len_expr = self.analyse_expr(len_expr);
                let max_len = match &len_expr.metadata().value {
                    Some(ConstValue::Int(n)) if *n >= 0 => *n as usize,
                    _ => {
                        self.error(
                            CompileError::ConstantFoldError {
                                reason: "string bound must be a non-negative constant integer"
                                    .to_string(),
                            },
                            span,
                        );
                        0
                    }
                };
                (ModeExpr::String(len_expr), Mode::String { max_len })
            }
            ModeExpr::Array {
                lower,
                upper,
                element,
            } => {
                let lower_node = self.analyse_expr(*lower);
                let upper_node = self.analyse_expr(*upper);
                let element_node = self.resolve_mode_node(*element);
                let lower_val = const_int(&lower_node).unwrap_or(0);
                let upper_val = const_int(&upper_node).unwrap_or(lower_val - 1);
                if upper_val < lower_val {
                    self.error(
                        CompileError::RangeError {
                            lower: lower_val,
                            upper: upper_val,
                        },
                        span,
                    );
                }
                let element_mode = element_node.metadata().raw_type.clone().unwrap_or(Mode::Void);
                let resolved = Mode::Array {
                    lower: lower_val,
                    upper: upper_val,
                    element: Box::new(element_mode),
                };
                (
                    ModeExpr::Array {
                        lower: Box::new(lower_node),
                        upper: Box::new(upper_node),
                        element: Box::new(element_node),
                    },
                    resolved,
                )
            }
            ModeExpr::Reference(inner) => {
                let inner_node = self.resolve_mode_node(*inner);
                let inner_mode = inner_node.metadata().raw_type.clone().unwrap_or(Mode::Void);
                (
                    ModeExpr::Reference(Box::new(inner_node)),
                    Mode::Reference(Box::new(inner_mode)),
                )
            }
            ModeExpr::Range { lower, upper } => {
                let lower_node = self.analyse_expr(*lower);
                let upper_node = self.analyse_expr(*upper);
                let base = discrete_base(&lower_node.metadata().raw_type.clone().unwrap_or(Mode::Int))
                    .unwrap_or(DiscreteBase::Int);
                let lower_val = const_int(&lower_node).unwrap_or(0);
                let upper_val = const_int(&upper_node).unwrap_or(lower_val - 1);
                if upper_val < lower_val {
                    self.error(
                        CompileError::RangeError {
                            lower: lower_val,
                            upper: upper_val,
                        },
                        span,
                    );
                }
                (
                    ModeExpr::Range {
                        lower: Box::new(lower_node),
                        upper: Box::new(upper_node),
                    },
                    Mode::Range {
                        base,
                        lower: lower_val,
                        upper: upper_val,
                    },
                )
            }
            ModeExpr::ModeName(name) => {
                let resolved = match self.env.lookup(&name) {
                    Some(entity) => entity.raw_type.clone(),
                    None => {
                        self.error(
                            CompileError::UndeclaredIdentifier { name: name.clone() },
                            span,
                        );
                        Mode::Void
                    }
                };
                (ModeExpr::ModeName(name), resolved)
            }
        };
        let mut deco = self.decoration(span);
        deco.raw_type = Some(resolved);
        deco.dcl_type = Some(DclType::ModeName);
        Node(mode_expr, deco)
    }

    // ---- procedures ------------------------------------------------------

    fn analyse_procedure(
        &mut self,
        node: Node<ProcedureDef<Span>, Span>,
    ) -> Node<ProcedureDef<Decoration>, Decoration> {
        let span = *node.metadata();
        let ProcedureDef {
            name,
            params,
            result_mode,
            body,
        } = node.0;

        // Resolve the signature in the *enclosing* scope, then bind the
        // procedure's own name there too (for recursion and for the
        // caller to see it), before opening the scope for its body.
        let result_mode = result_mode.map(|m| self.resolve_mode_node(m));
        let return_mode = result_mode
            .as_ref()
            .map(|m| m.metadata().raw_type.clone().unwrap_or(Mode::Void));

        if self.env.lookup_local(&name).is_some() {
            self.error(
                CompileError::Redeclaration {
                    name: name.clone(),
                    original: span,
                },
                span,
            );
        }

        self.env.push(&format!("PROCEDURE DECLARATION {}", name));
        let proc_scope = self.env.current_scope_id();

        // First pass: resolve each parameter's mode so we know the total
        // parameter footprint before assigning any offsets.
        let mut resolved_params = Vec::with_capacity(params.len());
        for param in params {
            let param_span = *param.metadata();
            let mode_node = self.resolve_mode_node(param.0.mode);
            let mode = mode_node.metadata().raw_type.clone().unwrap_or(Mode::Void);
            let size = if param.0.is_loc { 1 } else { mode.size() };
            resolved_params.push((param.0.name, mode_node, mode, param.0.is_loc, size, param_span));
        }
        let param_size: usize = resolved_params.iter().map(|p| p.4).sum();
        let return_size = return_mode.as_ref().map(|m| m.size()).unwrap_or(0);
        let return_offset = if return_mode.is_some() {
            Some(-(2 + param_size as isize + return_size as isize))
        } else {
            None
        };

        // Second pass: assign ascending negative offsets so the last
        // declared parameter ends exactly at -2.
        let mut running: isize = -(2 + param_size as isize);
        let mut params_out = Vec::with_capacity(resolved_params.len());
        let mut param_specs = Vec::with_capacity(resolved_params.len());
        for (pname, mode_node, mode, is_loc, size, param_span) in resolved_params {
            let offset = running;
            running += size as isize;

            let mut deco = self.decoration(param_span);
            deco.raw_type = Some(mode.clone());
            deco.dcl_type = Some(DclType::Var);
            deco.loc = is_loc;
            deco.size = size;
            deco.scope = proc_scope;
            deco.offset = offset;

            if self.env.lookup_local(&pname).is_some() {
                self.error(
                    CompileError::Redeclaration {
                        name: pname.clone(),
                        original: param_span,
                    },
                    param_span,
                );
            } else {
                self.env.add_local(
                    &pname,
                    Entity::var(mode.clone(), is_loc, size, offset, proc_scope),
                );
            }
            param_specs.push(ParamSpec {
                name: pname.clone(),
                mode: mode.clone(),
                is_loc,
                offset,
            });
            params_out.push(Node(
                FormalParam {
                    name: pname,
                    mode: mode_node,
                    is_loc,
                },
                deco,
            ));
        }

        // Bind the procedure's own name in the *enclosing* scope now, while
        // the new scope is on top -- this is exactly what `add_parent` is
        // for, and is what makes recursive calls resolve inside the body.
        self.env.add_parent(
            &name,
            Entity::procedure(param_specs, return_mode.clone(), return_offset, proc_scope),
        );

        self.env.push_procedure(ProcedureContext {
            expected_return: return_mode.clone(),
            proc_scope,
            parameter_space: param_size,
            has_returned: false,
        });

        let body = body
            .into_iter()
            .map(|stmt| self.analyse_statement(stmt))
            .collect::<Vec<_>>();

        let ctx = self.env.pop_procedure().expect("pushed above");
        if return_mode.is_some() && !ctx.has_returned {
            self.error(
                CompileError::MissingReturn { name: name.clone() },
                span,
            );
        }
        self.env.pop();

        let mut deco = self.decoration(span);
        deco.dcl_type = Some(DclType::Proc);
        deco.scope = proc_scope;
        Node(
            ProcedureDef {
                name,
                params: params_out,
                result_mode,
                body,
            },
            deco,
        )
    }

    // ---- action statements -------------------------------------------------

    fn analyse_action(
        &mut self,
        node: Node<ActionStatement<Span>, Span>,
    ) -> Node<ActionStatement<Decoration>, Decoration> {
        let span = *node.metadata();
        let deco = self.decoration(span);
        let action = match node.0 {
            ActionStatement::Assign { target, op, value } => {
                let target = Box::new(self.analyse_expr(*target));
                let value = Box::new(self.analyse_expr(*value));
                let target_type = target.metadata().raw_type.clone().unwrap_or(Mode::Void);
                let value_type = value.metadata().raw_type.clone().unwrap_or(Mode::Void);

                if !is_assignable(&target) {
                    self.error(
                        CompileError::InvalidLocation {
                            reason: "assignment target must be a variable or a loc-returning procedure",
                        },
                        span,
                    );
                }
                if let Some(op) = op {
                    if !mode_admits_closed_dyadic(&target_type, op) {
                        self.error(
                            CompileError::UnsupportedOperator {
                                op: op.as_str(),
                                mode: fmt_mode(&target_type),
                            },
                            span,
                        );
                    }
                }
                if !modes_match(&target_type, &value_type) {
                    self.error(
                        CompileError::ModeMismatch {
                            context: "assignment",
                            expected: fmt_mode(&target_type),
                            found: fmt_mode(&value_type),
                        },
                        span,
                    );
                }
                ActionStatement::Assign { target, op, value }
            }
            ActionStatement::If { arms, else_body } => {
                let arms = arms
                    .into_iter()
                    .map(|(cond, body)| {
                        let cond = self.analyse_expr(cond);
                        let cond_type = cond.metadata().raw_type.clone().unwrap_or(Mode::Void);
                        if !modes_match(&cond_type, &Mode::Bool) {
                            self.error(
                                CompileError::ModeMismatch {
                                    context: "conditional-branch",
                                    expected: "bool".to_string(),
                                    found: fmt_mode(&cond_type),
                                },
                                span,
                            );
                        }
                        let body = body
                            .into_iter()
                            .map(|s| self.analyse_statement(s))
                            .collect();
                        (cond, body)
                    })
                    .collect();
                let else_body = else_body.map(|body| {
                    body.into_iter()
                        .map(|s| self.analyse_statement(s))
                        .collect()
                });
                ActionStatement::If { arms, else_body }
            }
            ActionStatement::Do {
                control,
                while_cond,
                body,
            } => {
                let control = control.map(|c| self.analyse_for_control(c, span));
                let while_cond = while_cond.map(|cond| {
                    let cond = self.analyse_expr(*cond);
                    let cond_type = cond.metadata().raw_type.clone().unwrap_or(Mode::Void);
                    if !modes_match(&cond_type, &Mode::Bool) {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "loop condition",
                                expected: "bool".to_string(),
                                found: fmt_mode(&cond_type),
                            },
                            span,
                        );
                    }
                    Box::new(cond)
                });
                let body = body
                    .into_iter()
                    .map(|s| self.analyse_statement(s))
                    .collect();
                ActionStatement::Do {
                    control,
                    while_cond,
                    body,
                }
            }
            ActionStatement::Labelled { label, body } => {
                if self.env.lookup_local(&label).is_some() {
                    self.error(
                        CompileError::Redeclaration {
                            name: label.clone(),
                            original: span,
                        },
                        span,
                    );
                } else {
                    let scope = self.env.current_scope_id();
                    self.env.add_local(&label, Entity::label(scope));
                }
                self.label_stack.push(label.clone());
                let body = body
                    .into_iter()
                    .map(|s| self.analyse_statement(s))
                    .collect();
                self.label_stack.pop();
                ActionStatement::Labelled { label, body }
            }
            ActionStatement::Exit { label } => {
                if !self.label_stack.iter().any(|l| l == &label) {
                    self.error(
                        CompileError::UndeclaredLabel { name: label.clone() },
                        span,
                    );
                }
                ActionStatement::Exit { label }
            }
            ActionStatement::Return { value } => {
                let value = value.map(|v| self.analyse_expr(v));
                let expected = self
                    .env
                    .current_procedure()
                    .and_then(|ctx| ctx.expected_return.clone());
                match (&expected, &value) {
                    (Some(expected_mode), Some(value_node)) => {
                        let found = value_node.metadata().raw_type.clone().unwrap_or(Mode::Void);
                        if !modes_match(expected_mode, &found) {
                            self.error(
                                CompileError::ModeMismatch {
                                    context: "return",
                                    expected: fmt_mode(expected_mode),
                                    found: fmt_mode(&found),
                                },
                                span,
                            );
                        }
                    }
                    (Some(expected_mode), None) => {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "return",
                                expected: fmt_mode(expected_mode),
                                found: "void".to_string(),
                            },
                            span,
                        );
                    }
                    (None, Some(value_node)) => {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "return",
                                expected: "void".to_string(),
                                found: fmt_mode(&value_node.metadata().raw_type.clone().unwrap_or(Mode::Void)),
                            },
                            span,
                        );
                    }
                    (None, None) => {}
                }
                if let Some(ctx) = self.env.current_procedure_mut() {
                    ctx.has_returned = true;
                }
                ActionStatement::Return { value }
            }
            ActionStatement::Call { name, args } => {
                let args = self.analyse_call_args(&name, args, span);
                ActionStatement::Call { name, args }
            }
            ActionStatement::BuiltinCall { builtin, args } => {
                let args = args.into_iter().map(|a| self.analyse_expr(a)).collect();
                ActionStatement::BuiltinCall { builtin, args }
            }
        };
        Node(action, deco)
    }

    fn analyse_for_control(
        &mut self,
        control: ForControl<Span>,
        span: Span,
    ) -> ForControl<Decoration> {
        match control {
            ForControl::Step {
                counter,
                from,
                step,
                to,
                down,
            } => {
                let from = self.analyse_expr(*from);
                let step = step.map(|s| Box::new(self.analyse_expr(*s)));
                let to = self.analyse_expr(*to);
                let counter = self.resolve_counter(counter);
                ForControl::Step {
                    counter,
                    from: Box::new(from),
                    step,
                    to: Box::new(to),
                    down,
                }
            }
            ForControl::Range {
                counter,
                mode,
                down,
            } => {
                let mode = self.resolve_mode_node(*mode);
                let counter = self.resolve_counter(counter);
                ForControl::Range {
                    counter,
                    mode: Box::new(mode),
                    down,
                }
            }
        }
    }

    /// Resolve a loop counter name against the scope table, filling in its
    /// decoration the same way an [Expr::Identifier] would be.
    fn resolve_counter(&mut self, counter: Node<String, Span>) -> Node<String, Decoration> {
        let span = *counter.metadata();
        let name = counter.0;
        let mut deco = self.decoration(span);
        match self.env.lookup(&name) {
            Some(entity) if !entity.raw_type.is_discrete() => {
                self.error(
                    CompileError::ModeMismatch {
                        context: "loop counter",
                        expected: "a discrete mode".to_string(),
                        found: fmt_mode(&entity.raw_type),
                    },
                    span,
                );
                deco.raw_type = Some(entity.raw_type.clone());
                deco.scope = entity.scope;
                deco.offset = entity.offset;
            }
            Some(entity) => {
                deco.raw_type = Some(entity.raw_type.clone());
                deco.scope = entity.scope;
                deco.offset = entity.offset;
                deco.dcl_type = Some(DclType::Var);
            }
            None => {
                self.error(
                    CompileError::UndeclaredIdentifier { name: name.clone() },
                    span,
                );
                deco.raw_type = Some(Mode::Void);
            }
        }
        Node(name, deco)
    }

    fn analyse_call_args(
        &mut self,
        name: &str,
        args: Vec<Node<Expr<Span>, Span>>,
        span: Span,
    ) -> Vec<Node<Expr<Decoration>, Decoration>> {
        let entity = self.env.lookup(name);
        let params = entity.as_ref().and_then(|e| e.params.clone());
        if entity.is_none() {
            self.error(
                CompileError::UndeclaredIdentifier {
                    name: name.to_string(),
                },
                span,
            );
        } else if params.is_none() {
            self.error(
                CompileError::ModeMismatch {
                    context: "call",
                    expected: "a procedure".to_string(),
                    found: "a non-procedure identifier".to_string(),
                },
                span,
            );
        }

        if let Some(params) = &params {
            if params.len() != args.len() {
                self.error(
                    CompileError::ProcedureArity {
                        name: name.to_string(),
                        expected: params.len(),
                        found: args.len(),
                    },
                    span,
                );
            }
        }

        args.into_iter()
            .enumerate()
            .map(|(i, arg)| {
                let mut arg = self.analyse_expr(arg);
                if let Some(params) = &params {
                    if let Some(param) = params.get(i) {
                        if !modes_match(&param.mode, &arg.metadata().raw_type.clone().unwrap_or(Mode::Void)) {
                            self.error(
                                CompileError::ModeMismatch {
                                    context: "call argument",
                                    expected: fmt_mode(&param.mode),
                                    found: fmt_mode(&arg.metadata().raw_type.clone().unwrap_or(Mode::Void)),
                                },
                                *arg.metadata_span(),
                            );
                        }
                        if param.is_loc && !is_assignable(&arg) {
                            self.error(
                                CompileError::InvalidLocation {
                                    reason: "loc parameter requires an lvalue argument",
                                },
                                *arg.metadata_span(),
                            );
                        }
                        arg.metadata_mut().is_reference = param.is_loc;
                    }
                }
                arg
            })
            .collect()
    }

    // ---- expressions --------------------------------------------------------

    fn analyse_expr(&mut self, node: Node<Expr<Span>, Span>) -> Node<Expr<Decoration>, Decoration> {
        let span = *node.metadata();
        let mut deco = self.decoration(span);
        let expr = match node.0 {
            Expr::Literal(lit) => {
                deco.dcl_type = Some(DclType::Literal);
                match &lit {
                    Literal::Int(n) => {
                        deco.raw_type = Some(Mode::Int);
                        deco.value = Some(ConstValue::Int(*n));
                    }
                    Literal::Bool(b) => {
                        deco.raw_type = Some(Mode::Bool);
                        deco.value = Some(ConstValue::Bool(*b));
                    }
                    Literal::Char(c) => {
                        deco.raw_type = Some(Mode::Char);
                        deco.value = Some(ConstValue::Char(*c));
                    }
                    Literal::String(s) => {
                        deco.raw_type = Some(Mode::String { max_len: s.chars().count() });
                        deco.value = Some(ConstValue::String(s.clone()));
                        deco.heap_index = Some(self.intern_string(s.clone()));
                    }
                }
                Expr::Literal(lit)
            }
            Expr::Identifier(name) => {
                match self.env.lookup(&name) {
                    Some(entity) => {
                        deco.raw_type = Some(entity.raw_type.clone());
                        deco.size = entity.size;
                        deco.scope = entity.scope;
                        deco.offset = entity.offset;
                        deco.loc = entity.loc;
                        deco.lower_bound_value = entity.lower_bound_value;
                        deco.upper_bound_value = entity.upper_bound_value;
                        if entity.params.is_some() {
                            deco.dcl_type = Some(DclType::Proc);
                            deco.raw_type = entity.return_mode.clone();
                        } else if entity.value.is_some() {
                            deco.dcl_type = Some(DclType::Synonym);
                            deco.value = entity.value.clone();
                        } else {
                            deco.dcl_type = Some(DclType::Var);
                        }
                    }
                    None => {
                        self.error(
                            CompileError::UndeclaredIdentifier { name: name.clone() },
                            span,
                        );
                        deco.raw_type = Some(Mode::Void);
                    }
                }
                Expr::Identifier(name)
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.analyse_expr(*lhs);
                let rhs = self.analyse_expr(*rhs);
                let lhs_type = lhs.metadata().raw_type.clone().unwrap_or(Mode::Void);
                let rhs_type = rhs.metadata().raw_type.clone().unwrap_or(Mode::Void);
                if !modes_match(&lhs_type, &rhs_type) {
                    self.error(
                        CompileError::ModeMismatch {
                            context: "binary operand",
                            expected: fmt_mode(&lhs_type),
                            found: fmt_mode(&rhs_type),
                        },
                        span,
                    );
                } else if !mode_admits_binary(&lhs_type, op) {
                    self.error(
                        CompileError::UnsupportedOperator {
                            op: op.as_str(),
                            mode: fmt_mode(&lhs_type),
                        },
                        span,
                    );
                }
                deco.raw_type = Some(if op.is_relational() {
                    Mode::Bool
                } else {
                    lhs_type.clone()
                });
                deco.dcl_type = Some(DclType::Expression);
                deco.value = fold_binary(op, &lhs.metadata().value, &rhs.metadata().value)
                    .unwrap_or_else(|reason| {
                        if lhs.metadata().value.is_some() && rhs.metadata().value.is_some() {
                            self.error(CompileError::ConstantFoldError { reason }, span);
                        }
                        None
                    });
                Expr::Binary(op, Box::new(lhs), Box::new(rhs))
            }
            Expr::Unary(op, operand) => {
                let operand = self.analyse_expr(*operand);
                let operand_type = operand.metadata().raw_type.clone().unwrap_or(Mode::Void);
                if !mode_admits_unary(&operand_type, op) {
                    self.error(
                        CompileError::UnsupportedOperator {
                            op: op.as_str(),
                            mode: fmt_mode(&operand_type),
                        },
                        span,
                    );
                }
                deco.raw_type = Some(operand_type);
                deco.dcl_type = Some(DclType::Expression);
                deco.value = fold_unary(op, &operand.metadata().value);
                Expr::Unary(op, Box::new(operand))
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.analyse_expr(*cond);
                let then_expr = self.analyse_expr(*then_expr);
                let else_expr = self.analyse_expr(*else_expr);
                let cond_type = cond.metadata().raw_type.clone().unwrap_or(Mode::Void);
                if !modes_match(&cond_type, &Mode::Bool) {
                    self.error(
                        CompileError::ModeMismatch {
                            context: "conditional-branch",
                            expected: "bool".to_string(),
                            found: fmt_mode(&cond_type),
                        },
                        span,
                    );
                }
                let then_type = then_expr.metadata().raw_type.clone().unwrap_or(Mode::Void);
                let else_type = else_expr.metadata().raw_type.clone().unwrap_or(Mode::Void);
                if !modes_match(&then_type, &else_type) {
                    self.error(
                        CompileError::ModeMismatch {
                            context: "conditional-branch",
                            expected: fmt_mode(&then_type),
                            found: fmt_mode(&else_type),
                        },
                        span,
                    );
                }
                deco.raw_type = Some(then_type);
                deco.dcl_type = Some(DclType::Expression);
                deco.value = match &cond.metadata().value {
                    Some(ConstValue::Bool(true)) => then_expr.metadata().value.clone(),
                    Some(ConstValue::Bool(false)) => else_expr.metadata().value.clone(),
                    _ => None,
                };
                Expr::Conditional {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                }
            }
            Expr::Index { base, index } => {
                let base = self.analyse_expr(*base);
                let index = self.analyse_expr(*index);
                let index_type = index.metadata().raw_type.clone().unwrap_or(Mode::Void);
                if !modes_match(&index_type, &Mode::Int) {
                    self.error(
                        CompileError::ModeMismatch {
                            context: "array index",
                            expected: "int".to_string(),
                            found: fmt_mode(&index_type),
                        },
                        span,
                    );
                }
                match base.metadata().raw_type.clone() {
                    Some(Mode::Array {
                        lower,
                        upper,
                        element,
                    }) => {
                        deco.size = element.size();
                        deco.raw_type = Some(*element);
                        deco.lower_bound_value = Some(lower);
                        deco.upper_bound_value = Some(upper);
                    }
                    Some(other) => {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "array index base",
                                expected: "an array mode".to_string(),
                                found: fmt_mode(&other),
                            },
                            span,
                        );
                        deco.raw_type = Some(Mode::Void);
                    }
                    None => deco.raw_type = Some(Mode::Void),
                }
                deco.dcl_type = Some(DclType::Expression);
                Expr::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                }
            }
            Expr::Dereference(inner) => {
                let inner = self.analyse_expr(*inner);
                match inner.metadata().raw_type.clone() {
                    Some(Mode::Reference(target)) => {
                        deco.size = target.size();
                        deco.raw_type = Some(*target);
                    }
                    Some(other) => {
                        self.error(
                            CompileError::ModeMismatch {
                                context: "dereference",
                                expected: "a reference mode".to_string(),
                                found: fmt_mode(&other),
                            },
                            span,
                        );
                        deco.raw_type = Some(Mode::Void);
                    }
                    None => deco.raw_type = Some(Mode::Void),
                }
                deco.dcl_type = Some(DclType::Expression);
                Expr::Dereference(Box::new(inner))
            }
            Expr::ReferenceOf(inner) => {
                let inner = self.analyse_expr(*inner);
                if !is_assignable(&inner) {
                    self.error(
                        CompileError::InvalidLocation {
                            reason: "cannot take a reference to a non-location expression",
                        },
                        span,
                    );
                }
                let inner_type = inner.metadata().raw_type.clone().unwrap_or(Mode::Void);
                deco.raw_type = Some(Mode::Reference(Box::new(inner_type)));
                deco.dcl_type = Some(DclType::Expression);
                Expr::ReferenceOf(Box::new(inner))
            }
            Expr::Call { name, args } => {
                let entity = self.env.lookup(&name);
                let return_mode = entity.as_ref().and_then(|e| e.return_mode.clone());
                let args = self.analyse_call_args(&name, args, span);
                deco.raw_type = Some(return_mode.unwrap_or(Mode::Void));
                deco.dcl_type = Some(DclType::Expression);
                Expr::Call { name, args }
            }
            Expr::Builtin { builtin, args } => {
                let args: Vec<_> = args.into_iter().map(|a| self.analyse_expr(a)).collect();
                deco.raw_type = Some(match builtin {
                    BuiltinFunc::Abs => args
                        .get(0)
                        .and_then(|a| a.metadata().raw_type.clone())
                        .unwrap_or(Mode::Int),
                    BuiltinFunc::Num => Mode::Int,
                    BuiltinFunc::Asc => Mode::Int,
                    BuiltinFunc::Upper | BuiltinFunc::Lower => Mode::Char,
                    BuiltinFunc::Length => Mode::Int,
                });
                deco.dcl_type = Some(DclType::Expression);
                if builtin == BuiltinFunc::Length {
                    deco.value = args.get(0).and_then(|a| match &a.metadata().raw_type {
                        Some(Mode::Array { lower, upper, .. }) => {
                            Some(ConstValue::Int(upper - lower + 1))
                        }
                        _ => None,
                    });
                }
                Expr::Builtin { builtin, args }
            }
        };
        Node(expr, deco)
    }

    fn intern_string(&mut self, s: String) -> usize {
        if let Some(idx) = self.string_heap.iter().position(|existing| existing == &s) {
            idx
        } else {
            self.string_heap.push(s);
            self.string_heap.len() - 1
        }
    }
}

// ---- free helper functions ------------------------------------------------

trait SpanOf {
    fn metadata_span(&self) -> &Span;
}

impl SpanOf for Node<Expr<Decoration>, Decoration> {
    fn metadata_span(&self) -> &Span {
        &self.metadata().span
    }
}

fn const_int(node: &Node<Expr<Decoration>, Decoration>) -> Option<i64> {
    match node.metadata().value {
        Some(ConstValue::Int(n)) => Some(n),
        _ => None,
    }
}

/// Whether `expr` denotes a location an assignment (or a `loc` argument, or
/// `->`) can bind to: a variable, an array element, a dereferenced
/// reference, or a call to a procedure whose declared result is itself a
/// reference mode.
fn is_assignable(expr: &Node<Expr<Decoration>, Decoration>) -> bool {
    match expr.value() {
        Expr::Identifier(_) => matches!(expr.metadata().dcl_type, Some(DclType::Var)),
        Expr::Index { .. } | Expr::Dereference(_) => true,
        Expr::Call { .. } => matches!(expr.metadata().raw_type, Some(Mode::Reference(_))),
        _ => false,
    }
}

/// Collapse a mode to the shape used for operator-admissibility and
/// assignment-compatibility checks: a `Range` behaves exactly like its
/// base discrete mode.
fn normalize(mode: &Mode) -> Mode {
    match mode {
        Mode::Range { base, .. } => match base {
            DiscreteBase::Int => Mode::Int,
            DiscreteBase::Bool => Mode::Bool,
            DiscreteBase::Char => Mode::Char,
        },
        Mode::Array {
            lower,
            upper,
            element,
        } => Mode::Array {
            lower: *lower,
            upper: *upper,
            element: Box::new(normalize(element)),
        },
        Mode::Reference(inner) => Mode::Reference(Box::new(normalize(inner))),
        other => other.clone(),
    }
}

fn modes_match(a: &Mode, b: &Mode) -> bool {
    normalize(a) == normalize(b)
}

fn discrete_base(mode: &Mode) -> Option<DiscreteBase> {
    match normalize(mode) {
        Mode::Int => Some(DiscreteBase::Int),
        Mode::Bool => Some(DiscreteBase::Bool),
        Mode::Char => Some(DiscreteBase::Char),
        _ => None,
    }
}

pub fn fmt_mode(mode: &Mode) -> String {
    match mode {
        Mode::Int => "int".to_string(),
        Mode::Bool => "bool".to_string(),
        Mode::Char => "char".to_string(),
        Mode::Void => "void".to_string(),
        Mode::String { max_len } => format!("chars[{}]", max_len),
        Mode::Array {
            lower,
            upper,
            element,
        } => format!("${}[{}:{}]", fmt_mode(element), lower, upper),
        Mode::Reference(inner) => format!("&{}", fmt_mode(inner)),
        Mode::Range { base, lower, upper } => {
            let base = match base {
                DiscreteBase::Int => "int",
                DiscreteBase::Bool => "bool",
                DiscreteBase::Char => "char",
            };
            format!("{}[{}:{}]", base, lower, upper)
        }
    }
}

fn mode_admits_binary(mode: &Mode, op: BinOp) -> bool {
    use BinOp::*;
    match normalize(mode) {
        Mode::Int => matches!(op, Add | Sub | Mul | Div | Mod | Eq | Neq | Lt | Le | Gt | Ge),
        Mode::Bool => matches!(op, Eq | Neq | And | Or),
        Mode::Char => false,
        Mode::String { .. } => matches!(op, Add | Eq | Neq),
        _ => false,
    }
}

fn mode_admits_unary(mode: &Mode, op: UnOp) -> bool {
    match (normalize(mode), op) {
        (Mode::Int, UnOp::Neg) => true,
        (Mode::Bool, UnOp::Not) => true,
        _ => false,
    }
}

fn mode_admits_closed_dyadic(mode: &Mode, op: BinOp) -> bool {
    use BinOp::*;
    match normalize(mode) {
        Mode::Int => matches!(op, Add | Sub | Mul | Div | Mod),
        Mode::String { .. } => matches!(op, Add),
        _ => false,
    }
}

fn fold_binary(
    op: BinOp,
    lhs: &Option<ConstValue>,
    rhs: &Option<ConstValue>,
) -> Result<Option<ConstValue>, String> {
    let (lhs, rhs) = match (lhs, rhs) {
        (Some(l), Some(r)) => (l, r),
        _ => return Ok(None),
    };
    use BinOp::*;
    use ConstValue::*;
    let result = match (lhs, rhs) {
        (Int(l), Int(r)) => match op {
            Add => Int(l.wrapping_add(*r)),
            Sub => Int(l.wrapping_sub(*r)),
            Mul => Int(l.wrapping_mul(*r)),
            Div => {
                if *r == 0 {
                    return Err("division by zero in constant expression".to_string());
                }
                Int(l / r)
            }
            Mod => {
                if *r == 0 {
                    return Err("modulus by zero in constant expression".to_string());
                }
                Int(l % r)
            }
            Eq => Bool(l == r),
            Neq => Bool(l != r),
            Lt => Bool(l < r),
            Le => Bool(l <= r),
            Gt => Bool(l > r),
            Ge => Bool(l >= r),
            And | Or => return Err("boolean operator on int constants".to_string()),
        },
        (Bool(l), Bool(r)) => match op {
            Eq => Bool(l == r),
            Neq => Bool(l != r),
            And => Bool(*l && *r),
            Or => Bool(*l || *r),
            _ => return Err("arithmetic operator on bool constants".to_string()),
        },
        (Char(l), Char(r)) => match op {
            Eq => Bool(l == r),
            Neq => Bool(l != r),
            _ => return Err("unsupported operator on char constants".to_string()),
        },
        (String(l), String(r)) => match op {
            Add => String(format!("{}{}", l, r)),
            Eq => Bool(l == r),
            Neq => Bool(l != r),
            _ => return Err("unsupported operator on string constants".to_string()),
        },
        _ => return Err("mismatched constant types".to_string()),
    };
    Ok(Some(result))
}

fn fold_unary(op: UnOp, operand: &Option<ConstValue>) -> Option<ConstValue> {
    match (op, operand) {
        (UnOp::Neg, Some(ConstValue::Int(n))) => Some(ConstValue::Int(n.wrapping_neg())),
        (UnOp::Not, Some(ConstValue::Bool(b))) => Some(ConstValue::Bool(!b)),
        _ => None,
    }
}
