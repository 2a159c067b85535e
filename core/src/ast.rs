//! All the different types that can appear in the AST of an L program.
//! There is no functionality implemented here beyond a generic visitor
//! dispatch; this module just defines shape.
//!
//! Every AST node type is generic over a metadata type `M`, which is used
//! to carry extra data that isn't part of the syntax tree itself. Before
//! analysis `M` is [Span]; after analysis it's [Decoration].

use crate::util::Span;

/// The type of every runtime value that isn't a composite.
pub type LangValue = i64;

/// A generic AST node container. Holds the node's own data plus whatever
/// metadata `M` the current pipeline stage attaches to every node.
#[derive(Clone, Debug, PartialEq)]
pub struct Node<T, M>(pub T, pub M);

impl<T, M> Node<T, M> {
    /// Get the data for this node.
    pub fn value(&self) -> &T {
        &self.0
    }

    /// Get the metadata for this node.
    pub fn metadata(&self) -> &M {
        &self.1
    }

    /// Get the metadata for this node, mutably. Used by the analyser to
    /// fill in a node's [Decoration] in place.
    pub fn metadata_mut(&mut self) -> &mut M {
        &mut self.1
    }

    /// Create a new `Node` by mapping the data field. Metadata is kept.
    pub fn map<U>(self, mapper: impl FnOnce(T) -> U) -> Node<U, M> {
        Node(mapper(self.0), self.1)
    }

    /// Create a new `Node` by mapping the metadata, keeping the data.
    pub fn map_metadata<N>(self, mapper: impl FnOnce(M) -> N) -> Node<T, N> {
        Node(self.0, mapper(self.1))
    }
}

/// The node alias used by the parser, before any analysis has happened.
pub type SpanNode<T> = Node<T, Span>;

/// The node alias used from the analyser onward, once every node has been
/// decorated.
pub type DecoratedNode<T> = Node<T, Decoration>;

/// The base type that a discrete (ordinal) mode is built on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscreteBase {
    Int,
    Bool,
    Char,
}

/// A fully resolved mode (type), as produced by the analyser. This is
/// distinct from [ModeExpr], which is the *syntax* that denotes a mode;
/// `Mode` is the resolved meaning of that syntax.
#[derive(Clone, Debug, PartialEq)]
pub enum Mode {
    Int,
    Bool,
    Char,
    Void,
    /// `chars[n]`: a fixed-capacity character buffer with a length header.
    String { max_len: usize },
    /// `$T`, an inclusive-range-indexed array of `T`.
    Array {
        lower: i64,
        upper: i64,
        element: Box<Mode>,
    },
    /// `&T`, the address of a `T`.
    Reference(Box<Mode>),
    /// A discrete sub-range of `int`, `char`, or `bool`.
    Range {
        base: DiscreteBase,
        lower: i64,
        upper: i64,
    },
}

impl Mode {
    /// Number of memory slots this mode occupies when stored by value.
    /// References always occupy exactly one slot (an address), regardless
    /// of what they point to.
    pub fn size(&self) -> usize {
        match self {
            Mode::Int | Mode::Bool | Mode::Char | Mode::Range { .. } => 1,
            Mode::Void => 0,
            Mode::Reference(_) => 1,
            Mode::String { max_len } => max_len + 1,
            Mode::Array {
                lower,
                upper,
                element,
            } => ((upper - lower + 1).max(0) as usize) * element.size(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(
            self,
            Mode::Int | Mode::Bool | Mode::Char | Mode::Range { .. }
        )
    }
}

/// Declaration kind, tracked on every entity and every expression node
/// (`dcl_type` in the spec's decoration record).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DclType {
    Var,
    Synonym,
    ModeName,
    Label,
    Proc,
    Literal,
    Expression,
}

/// A folded compile-time value, attached to a node once its subtree is
/// known to be constant.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Char(char),
    String(String),
}

/// The full decoration record a node receives once the analyser has run.
/// Every field here corresponds to a decoration field named in the data
/// model: `raw_type`, `dcl_type`, `value`, `size`, `scope`, `offset`,
/// `loc`, `lower_bound_value`, `upper_bound_value`, `heap_index`,
/// `is_reference`.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoration {
    pub span: Span,
    pub raw_type: Option<Mode>,
    pub dcl_type: Option<DclType>,
    pub value: Option<ConstValue>,
    pub size: usize,
    pub scope: usize,
    pub offset: isize,
    /// True if this entity's storage slot holds an address rather than a
    /// value (i.e. it was declared with `loc`, or is a reference mode).
    pub loc: bool,
    pub lower_bound_value: Option<i64>,
    pub upper_bound_value: Option<i64>,
    pub heap_index: Option<usize>,
    /// On call arguments: whether this argument must be passed by address
    /// because the matching parameter is `loc`.
    pub is_reference: bool,
}

impl Decoration {
    /// A blank decoration anchored only by its source span; every other
    /// field is filled in as the analyser visits the node.
    pub fn new(span: Span) -> Self {
        Decoration {
            span,
            raw_type: None,
            dcl_type: None,
            value: None,
            size: 0,
            scope: 0,
            offset: 0,
            loc: false,
            lower_bound_value: None,
            upper_bound_value: None,
            heap_index: None,
            is_reference: false,
        }
    }
}

/// Binary operators shared by expressions and compound assignment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// The source-level operator text, used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

/// A built-in that produces a value and is used inside expressions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuiltinFunc {
    Abs,
    Num,
    Asc,
    Upper,
    Lower,
    Length,
}

impl BuiltinFunc {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinFunc::Abs => "abs",
            BuiltinFunc::Num => "num",
            BuiltinFunc::Asc => "asc",
            BuiltinFunc::Upper => "upper",
            BuiltinFunc::Lower => "lower",
            BuiltinFunc::Length => "length",
        }
    }
}

/// A built-in that performs I/O and is used as a statement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuiltinProc {
    Print,
    Read,
}

impl BuiltinProc {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinProc::Print => "print",
            BuiltinProc::Read => "read",
        }
    }
}

/// A literal value as written in source.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Bool(bool),
    Char(char),
    String(String),
}

/// A mode expression: the syntax that denotes a mode. Resolved by the
/// analyser into a [Mode].
#[derive(Clone, Debug, PartialEq)]
pub enum ModeExpr<M> {
    Int,
    Bool,
    Char,
    /// `chars[n]`
    String(Node<Expr<M>, M>),
    /// `$T`
    Array {
        lower: Box<Node<Expr<M>, M>>,
        upper: Box<Node<Expr<M>, M>>,
        element: Box<Node<ModeExpr<M>, M>>,
    },
    /// `&T`
    Reference(Box<Node<ModeExpr<M>, M>>),
    /// a literal discrete range, e.g. `1..10`
    Range {
        lower: Box<Node<Expr<M>, M>>,
        upper: Box<Node<Expr<M>, M>>,
    },
    /// reference to a mode declared via `newmode`/`mode` or a built-in
    /// alias
    ModeName(String),
}

/// An expression. Most expression variants double as *locations*: an
/// `Identifier`, `Index`, or `Dereference` node may appear on the
/// left-hand side of an assignment.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr<M> {
    Literal(Literal),
    /// Reference to a variable, synonym, or parameterless value-returning
    /// procedure call, by name.
    Identifier(String),
    Binary(BinOp, Box<Node<Expr<M>, M>>, Box<Node<Expr<M>, M>>),
    Unary(UnOp, Box<Node<Expr<M>, M>>),
    /// `cond -> then_expr, else_expr`
    Conditional {
        cond: Box<Node<Expr<M>, M>>,
        then_expr: Box<Node<Expr<M>, M>>,
        else_expr: Box<Node<Expr<M>, M>>,
    },
    /// `base[index]`
    Index {
        base: Box<Node<Expr<M>, M>>,
        index: Box<Node<Expr<M>, M>>,
    },
    /// `location->`: read through a reference
    Dereference(Box<Node<Expr<M>, M>>),
    /// `->location`: take the address of a location
    ReferenceOf(Box<Node<Expr<M>, M>>),
    /// Call to a user-defined, value-returning procedure.
    Call {
        name: String,
        args: Vec<Node<Expr<M>, M>>,
    },
    /// Call to one of the value-producing built-ins.
    Builtin {
        builtin: BuiltinFunc,
        args: Vec<Node<Expr<M>, M>>,
    },
}

/// A formal parameter in a procedure definition.
#[derive(Clone, Debug, PartialEq)]
pub struct FormalParam<M> {
    pub name: String,
    pub mode: Node<ModeExpr<M>, M>,
    /// True if declared `loc`: the argument is passed by address and
    /// writes through it are visible to the caller.
    pub is_loc: bool,
}

/// A procedure definition: `name: proc (params) result_mode; body end`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcedureDef<M> {
    pub name: String,
    pub params: Vec<Node<FormalParam<M>, M>>,
    pub result_mode: Option<Node<ModeExpr<M>, M>>,
    pub body: Vec<Node<Statement<M>, M>>,
}

/// A `dcl`, `syn`, or `newmode`/`mode` declaration statement. Each
/// declares one or more names at once (`dcl a, b int;`).
#[derive(Clone, Debug, PartialEq)]
pub enum Declaration<M> {
    /// `dcl name, ... mode [= init];`. Each name carries its own metadata
    /// so the code generator can address its storage slot directly.
    Variable {
        names: Vec<Node<String, M>>,
        mode: Node<ModeExpr<M>, M>,
        init: Option<Node<Expr<M>, M>>,
    },
    /// `syn name = expr, ...;` — each synonym may declare its own mode or
    /// have it inferred from its initialiser.
    Synonym {
        bindings: Vec<(String, Node<Expr<M>, M>)>,
        mode: Option<Node<ModeExpr<M>, M>>,
    },
    /// `newmode name = mode, ...;` — a mode alias.
    NewMode {
        bindings: Vec<(String, Node<ModeExpr<M>, M>)>,
    },
}

/// An iteration clause of a `do` loop.
#[derive(Clone, Debug, PartialEq)]
pub enum ForControl<M> {
    /// `for counter = from [by step] to/downto to_val`
    Step {
        counter: Node<String, M>,
        from: Box<Node<Expr<M>, M>>,
        step: Option<Box<Node<Expr<M>, M>>>,
        to: Box<Node<Expr<M>, M>>,
        down: bool,
    },
    /// `for counter in [down] mode`: iterate a discrete mode's values.
    Range {
        counter: Node<String, M>,
        mode: Box<Node<ModeExpr<M>, M>>,
        down: bool,
    },
}

/// One statement inside a block. Mirrors spec.md's categories directly:
/// declarations, procedure definitions, and action statements.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement<M> {
    Declaration(Node<Declaration<M>, M>),
    Procedure(Node<ProcedureDef<M>, M>),
    Action(Node<ActionStatement<M>, M>),
}

/// A statement that performs an action at runtime (as opposed to a
/// declaration, which only affects the scope table).
#[derive(Clone, Debug, PartialEq)]
pub enum ActionStatement<M> {
    /// `target = value;` or `target += value;` etc. `op` is `None` for a
    /// plain assignment, `Some(op)` for a closed-dyadic compound
    /// assignment.
    Assign {
        target: Box<Node<Expr<M>, M>>,
        op: Option<BinOp>,
        value: Box<Node<Expr<M>, M>>,
    },
    /// `if c1; b1 elsif c2; b2 ... else be fi`
    If {
        arms: Vec<(Node<Expr<M>, M>, Vec<Node<Statement<M>, M>>)>,
        else_body: Option<Vec<Node<Statement<M>, M>>>,
    },
    /// `do control_part; body od`
    Do {
        control: Option<ForControl<M>>,
        /// Present when the loop also carries a trailing `while` guard,
        /// checked once per iteration alongside (or instead of) a `for`.
        while_cond: Option<Box<Node<Expr<M>, M>>>,
        body: Vec<Node<Statement<M>, M>>,
    },
    /// `name: block end` — a labelled block, target of `exit name`.
    Labelled {
        label: String,
        body: Vec<Node<Statement<M>, M>>,
    },
    /// `exit name;`
    Exit { label: String },
    /// `return [value];`
    Return { value: Option<Node<Expr<M>, M>> },
    /// A call to a user-defined procedure made as a statement (its result,
    /// if any, is discarded).
    Call {
        name: String,
        args: Vec<Node<Expr<M>, M>>,
    },
    /// `print(...)` or `read(...)`.
    BuiltinCall {
        builtin: BuiltinProc,
        args: Vec<Node<Expr<M>, M>>,
    },
}

/// The root of a parsed program: an ordered sequence of top-level
/// statements.
#[derive(Clone, Debug, PartialEq)]
pub struct Program<M> {
    pub body: Vec<Node<Statement<M>, M>>,
}

/// Generic pre-order visitor. Implementors get a default recursive walk
/// for every statement/expression kind, and can override just the
/// variants they care about; unoverridden methods recurse into children.
pub trait Visitor<M> {
    fn visit_program(&mut self, program: &Program<M>) {
        for stmt in &program.body {
            self.visit_statement(stmt.value());
        }
    }

    fn visit_statement(&mut self, statement: &Statement<M>) {
        walk_statement(self, statement);
    }

    fn visit_action(&mut self, action: &ActionStatement<M>) {
        walk_action(self, action);
    }

    fn visit_expr(&mut self, expr: &Expr<M>) {
        walk_expr(self, expr);
    }
}

/// Default recursive walk for a [Statement]; called by
/// [Visitor::visit_statement]'s default implementation.
pub fn walk_statement<M, V: Visitor<M> + ?Sized>(visitor: &mut V, statement: &Statement<M>) {
    match statement {
        Statement::Declaration(_) => {}
        Statement::Procedure(node) => {
            for stmt in &node.value().body {
                visitor.visit_statement(stmt.value());
            }
        }
        Statement::Action(node) => visitor.visit_action(node.value()),
    }
}

/// Default recursive walk for an [ActionStatement].
pub fn walk_action<M, V: Visitor<M> + ?Sized>(visitor: &mut V, action: &ActionStatement<M>) {
    match action {
        ActionStatement::Assign { target, value, .. } => {
            visitor.visit_expr(target.value());
            visitor.visit_expr(value.value());
        }
        ActionStatement::If { arms, else_body } => {
            for (cond, body) in arms {
                visitor.visit_expr(cond.value());
                for stmt in body {
                    visitor.visit_statement(stmt.value());
                }
            }
            if let Some(body) = else_body {
                for stmt in body {
                    visitor.visit_statement(stmt.value());
                }
            }
        }
        ActionStatement::Do {
            while_cond, body, ..
        } => {
            if let Some(cond) = while_cond {
                visitor.visit_expr(cond.value());
            }
            for stmt in body {
                visitor.visit_statement(stmt.value());
            }
        }
        ActionStatement::Labelled { body, .. } => {
            for stmt in body {
                visitor.visit_statement(stmt.value());
            }
        }
        ActionStatement::Exit { .. } => {}
        ActionStatement::Return { value } => {
            if let Some(value) = value {
                visitor.visit_expr(value.value());
            }
        }
        ActionStatement::Call { args, .. } => {
            for arg in args {
                visitor.visit_expr(arg.value());
            }
        }
        ActionStatement::BuiltinCall { args, .. } => {
            for arg in args {
                visitor.visit_expr(arg.value());
            }
        }
    }
}

/// Default recursive walk for an [Expr].
pub fn walk_expr<M, V: Visitor<M> + ?Sized>(visitor: &mut V, expr: &Expr<M>) {
    match expr {
        Expr::Literal(_) | Expr::Identifier(_) => {}
        Expr::Binary(_, lhs, rhs) => {
            visitor.visit_expr(lhs.value());
            visitor.visit_expr(rhs.value());
        }
        Expr::Unary(_, operand) => visitor.visit_expr(operand.value()),
        Expr::Conditional {
            cond,
            then_expr,
            else_expr,
        } => {
            visitor.visit_expr(cond.value());
            visitor.visit_expr(then_expr.value());
            visitor.visit_expr(else_expr.value());
        }
        Expr::Index { base, index } => {
            visitor.visit_expr(base.value());
            visitor.visit_expr(index.value());
        }
        Expr::Dereference(inner) | Expr::ReferenceOf(inner) => visitor.visit_expr(inner.value()),
        Expr::Call { args, .. } | Expr::Builtin { args, .. } => {
            for arg in args {
                visitor.visit_expr(arg.value());
            }
        }
    }
}
