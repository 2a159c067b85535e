//! The parser: a hand-written recursive-descent grammar over `nom`, turning
//! source text into a [Program] of [SpanNode]s. Every production skips
//! leading whitespace and comments before matching, so the grammar functions
//! below never have to thread that through explicitly.

use crate::{
    ast::{
        ActionStatement, BinOp, BuiltinFunc, BuiltinProc, Declaration, Expr, ForControl,
        FormalParam, Literal, ModeExpr, Node, Program, ProcedureDef, SpanNode, Statement, UnOp,
    },
    error::{CompileError, CompileErrors, SourceErrorWrapper},
    util::Span,
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_until},
    character::complete::{alpha1, alphanumeric1, anychar, char, digit1, multispace1},
    combinator::{all_consuming, map, map_res, opt, recognize, verify},
    error::{ErrorKind, ParseError, VerboseError},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult, Offset, Slice,
};
use nom_locate::LocatedSpan;

type RawSpan<'a> = LocatedSpan<&'a str>;
type ParseResult<'a, T> = IResult<RawSpan<'a>, T, VerboseError<RawSpan<'a>>>;

const RESERVED: &[&str] = &[
    "array", "by", "chars", "dcl", "do", "down", "else", "elsif", "end", "exit", "fi", "for",
    "if", "in", "loc", "type", "od", "proc", "ref", "result", "return", "returns", "syn", "then",
    "to", "while", "abs", "asc", "bool", "char", "false", "int", "length", "lower", "null", "num",
    "print", "read", "true", "upper",
];

// ===== whitespace and tokens =====

fn ws0(input: RawSpan) -> ParseResult<'_, ()> {
    map(many0(alt((map(multispace1, |_| ()), comment))), |_| ())(input)
}

fn comment(input: RawSpan) -> ParseResult<'_, ()> {
    alt((
        map(
            nom::sequence::tuple((tag("/*"), take_until("*/"), tag("*/"))),
            |_| (),
        ),
        map(pair(tag("//"), many0(is_not("\r\n"))), |_| ()),
    ))(input)
}

fn raw_identifier(input: RawSpan) -> ParseResult<'_, RawSpan> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn fail<'a, O>(input: RawSpan<'a>) -> ParseResult<'a, O> {
    Err(nom::Err::Error(VerboseError::from_error_kind(
        input,
        ErrorKind::Tag,
    )))
}

/// A keyword match: an exact identifier-shaped token, not just a prefix of a
/// longer name (so `ifx` doesn't match `if`).
fn keyword<'a>(word: &'static str) -> impl Fn(RawSpan<'a>) -> ParseResult<'a, ()> {
    move |input: RawSpan<'a>| {
        let (input, _) = ws0(input)?;
        let (rest, id) = raw_identifier(input)?;
        if *id.fragment() == word {
            Ok((rest, ()))
        } else {
            fail(input)
        }
    }
}

/// A non-reserved identifier, used for names.
fn ident(input: RawSpan) -> ParseResult<'_, String> {
    let (input, _) = ws0(input)?;
    let (rest, id) = raw_identifier(input)?;
    let text = *id.fragment();
    if RESERVED.contains(&text) {
        fail(input)
    } else {
        Ok((rest, text.to_string()))
    }
}

fn sym<'a>(s: &'static str) -> impl Fn(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>> {
    move |input: RawSpan<'a>| preceded(ws0, tag(s))(input)
}

fn make_span(start: RawSpan, end: RawSpan) -> Span {
    let len = start.offset(&end);
    let raw = start.slice(..len);
    Span {
        offset: raw.location_offset(),
        length: raw.fragment().len(),
        start_line: raw.location_line() as usize,
        start_col: raw.get_column(),
        end_line: end.location_line() as usize,
        end_col: end.get_column(),
    }
}

/// Skips leading whitespace, runs `f`, then wraps the result with the [Span]
/// `f` consumed. Every grammar production that produces an AST node goes
/// through this, so spans never have to be computed by hand at each call
/// site.
fn spanned<'a, O>(
    f: impl Fn(RawSpan<'a>) -> ParseResult<'a, O>,
) -> impl Fn(RawSpan<'a>) -> ParseResult<'a, Node<O, Span>> {
    move |input: RawSpan<'a>| {
        let (input, _) = ws0(input)?;
        let (rest, value) = f(input)?;
        let span = make_span(input, rest);
        Ok((rest, Node(value, span)))
    }
}

/// One or more `item`s separated by `sep`, with no trailing separator.
fn sep_by1<'a, O>(
    sep: impl Fn(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>>,
    item: impl Fn(RawSpan<'a>) -> ParseResult<'a, O>,
) -> impl Fn(RawSpan<'a>) -> ParseResult<'a, Vec<O>> {
    move |input: RawSpan<'a>| {
        let (input, first) = item(input)?;
        let (input, rest) = many0(preceded(&sep, &item))(input)?;
        let mut items = vec![first];
        items.extend(rest);
        Ok((input, items))
    }
}

// ===== literals =====

fn int_literal_value(input: RawSpan) -> ParseResult<'_, i64> {
    let (input, _) = ws0(input)?;
    map_res(digit1, |s: RawSpan| s.fragment().parse::<i64>())(input)
}

fn escape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        '0' => '\0',
        other => other,
    }
}

fn char_literal_value(input: RawSpan) -> ParseResult<'_, char> {
    let (input, _) = ws0(input)?;
    delimited(
        char('\''),
        alt((
            map(preceded(char('\\'), anychar), escape_char),
            verify(anychar, |c: &char| *c != '\'' && *c != '\\' && *c != '\n'),
        )),
        char('\''),
    )(input)
}

fn string_literal_value(input: RawSpan) -> ParseResult<'_, String> {
    let (input, _) = ws0(input)?;
    delimited(
        char('"'),
        map(
            many0(alt((
                map(preceded(char('\\'), anychar), escape_char),
                verify(anychar, |c: &char| *c != '"' && *c != '\\' && *c != '\n'),
            ))),
            |chars: Vec<char>| chars.into_iter().collect(),
        ),
        char('"'),
    )(input)
}

fn literal_kind(input: RawSpan) -> ParseResult<'_, Expr<Span>> {
    alt((
        map(string_literal_value, |s| Expr::Literal(Literal::String(s))),
        map(char_literal_value, |c| Expr::Literal(Literal::Char(c))),
        map(keyword("true"), |_| Expr::Literal(Literal::Bool(true))),
        map(keyword("false"), |_| Expr::Literal(Literal::Bool(false))),
        map(int_literal_value, |n| Expr::Literal(Literal::Int(n))),
    ))(input)
}

// ===== modes =====

fn mode_expr_node(input: RawSpan) -> ParseResult<'_, SpanNode<ModeExpr<Span>>> {
    spanned(mode_expr_kind)(input)
}

fn mode_expr_kind(input: RawSpan) -> ParseResult<'_, ModeExpr<Span>> {
    alt((string_mode, array_mode, reference_mode, discrete_or_named_mode))(input)
}

fn string_mode(input: RawSpan) -> ParseResult<'_, ModeExpr<Span>> {
    map(
        preceded(keyword("chars"), delimited(sym("["), expr_node, sym("]"))),
        ModeExpr::String,
    )(input)
}

fn array_mode(input: RawSpan) -> ParseResult<'_, ModeExpr<Span>> {
    let (input, _) = keyword("array")(input)?;
    let (input, _) = sym("[")(input)?;
    // Only the `literal_range` form of `index_mode` is supported: array
    // modes indexed by an enumerated mode's own values, and multi-dimension
    // index lists, aren't part of this grammar.
    let (input, lower) = expr_node(input)?;
    let (input, _) = sym(":")(input)?;
    let (input, upper) = expr_node(input)?;
    let (input, _) = sym("]")(input)?;
    let (input, element) = mode_expr_node(input)?;
    Ok((
        input,
        ModeExpr::Array {
            lower: Box::new(lower),
            upper: Box::new(upper),
            element: Box::new(element),
        },
    ))
}

fn reference_mode(input: RawSpan) -> ParseResult<'_, ModeExpr<Span>> {
    map(preceded(keyword("ref"), mode_expr_node), |inner| {
        ModeExpr::Reference(Box::new(inner))
    })(input)
}

/// `int`/`bool`/`char`/a mode name, each optionally followed by a literal
/// range in parens (`int(1:10)`). The base named before the parens is only
/// used to disambiguate the grammar; like the rest of this pipeline, the
/// resolved range's base is taken from the lower bound's own type once
/// folded, not from this tag.
fn discrete_or_named_mode(input: RawSpan) -> ParseResult<'_, ModeExpr<Span>> {
    let (input, base) = alt((
        map(keyword("int"), |_| ModeExpr::Int),
        map(keyword("bool"), |_| ModeExpr::Bool),
        map(keyword("char"), |_| ModeExpr::Char),
        map(ident, ModeExpr::ModeName),
    ))(input)?;
    match sym("(")(input) {
        Ok((input, _)) => {
            let (input, lower) = expr_node(input)?;
            let (input, _) = sym(":")(input)?;
            let (input, upper) = expr_node(input)?;
            let (input, _) = sym(")")(input)?;
            Ok((
                input,
                ModeExpr::Range {
                    lower: Box::new(lower),
                    upper: Box::new(upper),
                },
            ))
        }
        Err(_) => Ok((input, base)),
    }
}

// ===== expressions =====

fn expr_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    spanned(expr_kind)(input)
}

fn expr_kind(input: RawSpan) -> ParseResult<'_, Expr<Span>> {
    map(alt((conditional_expr_node, operand0_node)), |node| node.0)(input)
}

/// Builds a left-associative chain of binary nodes: `first (op operand)*`,
/// with the accumulated node's span always running from the very start of
/// the chain to the end of whatever was just folded in.
fn fold_chain<'a>(
    original_start: RawSpan<'a>,
    mut input: RawSpan<'a>,
    mut acc: SpanNode<Expr<Span>>,
    op_parser: impl Fn(RawSpan<'a>) -> ParseResult<'a, BinOp>,
    operand_parser: impl Fn(RawSpan<'a>) -> ParseResult<'a, SpanNode<Expr<Span>>>,
) -> ParseResult<'a, SpanNode<Expr<Span>>> {
    loop {
        let attempt = op_parser(input)
            .and_then(|(rest, op)| operand_parser(rest).map(|(rest2, rhs)| (rest2, op, rhs)));
        match attempt {
            Ok((rest, op, rhs)) => {
                let span = make_span(original_start, rest);
                acc = Node(Expr::Binary(op, Box::new(acc), Box::new(rhs)), span);
                input = rest;
            }
            Err(_) => return Ok((input, acc)),
        }
    }
}

/// `&&`, `||`, and the relational operators, all at one (left-associative)
/// precedence level, exactly as the grammar this is grounded on groups them.
fn operand0_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    let start = input;
    let (input, first) = operand1_node(input)?;
    fold_chain(start, input, first, rel_operator, operand1_node)
}

fn rel_operator(input: RawSpan) -> ParseResult<'_, BinOp> {
    alt((
        map(sym("&&"), |_| BinOp::And),
        map(sym("||"), |_| BinOp::Or),
        map(sym("=="), |_| BinOp::Eq),
        map(sym("!="), |_| BinOp::Neq),
        map(sym("<="), |_| BinOp::Le),
        map(sym(">="), |_| BinOp::Ge),
        map(sym("<"), |_| BinOp::Lt),
        map(sym(">"), |_| BinOp::Gt),
    ))(input)
}

fn operand1_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    let start = input;
    let (input, first) = operand2_node(input)?;
    fold_chain(start, input, first, additive_operator, operand2_node)
}

fn additive_operator(input: RawSpan) -> ParseResult<'_, BinOp> {
    alt((map(sym("+"), |_| BinOp::Add), map(sym("-"), |_| BinOp::Sub)))(input)
}

fn operand2_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    let start = input;
    let (input, first) = operand3_node(input)?;
    fold_chain(start, input, first, multiplicative_operator, operand3_node)
}

fn multiplicative_operator(input: RawSpan) -> ParseResult<'_, BinOp> {
    alt((
        map(sym("*"), |_| BinOp::Mul),
        map(sym("/"), |_| BinOp::Div),
        map(sym("%"), |_| BinOp::Mod),
    ))(input)
}

/// A single optional leading `-`/`!`; the grammar this is grounded on
/// doesn't stack multiple unary operators (`!!x` isn't valid).
fn operand3_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    alt((
        spanned(|input| {
            let (input, op) = alt((map(sym("-"), |_| UnOp::Neg), map(sym("!"), |_| UnOp::Not)))(
                input,
            )?;
            let (input, operand) = operand4_node(input)?;
            Ok((input, Expr::Unary(op, Box::new(operand))))
        }),
        operand4_node,
    ))(input)
}

fn operand4_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    alt((
        spanned(|input| {
            let (input, _) = sym("->")(input)?;
            let (input, loc) = postfix_chain_node(input)?;
            Ok((input, Expr::ReferenceOf(Box::new(loc))))
        }),
        postfix_chain_node,
    ))(input)
}

/// A primary expression followed by any number of `[index]` or `->`
/// postfixes, covering array indexing and dereferencing uniformly whether
/// the base is a plain name, a call result, or a parenthesized expression.
/// Only a single index per `[...]` is accepted: multi-dimensional indexing
/// and slicing aren't part of this grammar.
fn postfix_chain_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    let original_start = input;
    let (mut input, mut acc) = primary_node(input)?;
    loop {
        if let Ok((rest, index)) = delimited(sym("["), expr_node, sym("]"))(input) {
            let span = make_span(original_start, rest);
            acc = Node(
                Expr::Index {
                    base: Box::new(acc),
                    index: Box::new(index),
                },
                span,
            );
            input = rest;
            continue;
        }
        if let Ok((rest, _)) = sym("->")(input) {
            let span = make_span(original_start, rest);
            acc = Node(Expr::Dereference(Box::new(acc)), span);
            input = rest;
            continue;
        }
        break;
    }
    Ok((input, acc))
}

fn primary_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    alt((
        paren_expr_node,
        spanned(literal_kind),
        builtin_func_call_node,
        call_or_identifier_node,
    ))(input)
}

fn paren_expr_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    spanned(|input| {
        let (input, _) = sym("(")(input)?;
        let (input, inner) = expr_node(input)?;
        let (input, _) = sym(")")(input)?;
        Ok((input, inner.0))
    })(input)
}

fn call_args(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Expr<Span>>>> {
    delimited(
        sym("("),
        map(opt(sep_by1(sym(","), expr_node)), |v| v.unwrap_or_default()),
        sym(")"),
    )(input)
}

fn builtin_func_call_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    spanned(|input| {
        let (input, builtin) = alt((
            map(keyword("abs"), |_| BuiltinFunc::Abs),
            map(keyword("asc"), |_| BuiltinFunc::Asc),
            map(keyword("num"), |_| BuiltinFunc::Num),
            map(keyword("upper"), |_| BuiltinFunc::Upper),
            map(keyword("lower"), |_| BuiltinFunc::Lower),
            map(keyword("length"), |_| BuiltinFunc::Length),
        ))(input)?;
        let (input, args) = call_args(input)?;
        Ok((input, Expr::Builtin { builtin, args }))
    })(input)
}

fn call_or_identifier_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    spanned(|input| {
        let (input, name) = ident(input)?;
        match call_args(input) {
            Ok((input, args)) => Ok((input, Expr::Call { name, args })),
            Err(_) => Ok((input, Expr::Identifier(name))),
        }
    })(input)
}

/// `if c then e1 [elsif c2 then e2]* else e3 fi`, desugared right-to-left
/// into nested [Expr::Conditional]s.
fn conditional_expr_node(input: RawSpan) -> ParseResult<'_, SpanNode<Expr<Span>>> {
    spanned(|input| {
        let (input, _) = keyword("if")(input)?;
        let (input, cond1) = expr_node(input)?;
        let (input, _) = keyword("then")(input)?;
        let (input, then1) = expr_node(input)?;
        let (input, elsifs) = many0(pair(
            preceded(keyword("elsif"), expr_node),
            preceded(keyword("then"), expr_node),
        ))(input)?;
        let (input, _) = keyword("else")(input)?;
        let (input, else_expr) = expr_node(input)?;
        let (input, _) = keyword("fi")(input)?;

        let mut acc = else_expr;
        for (cond, then_expr) in elsifs.into_iter().rev() {
            let span = *acc.metadata();
            acc = Node(
                Expr::Conditional {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(acc),
                },
                span,
            );
        }
        let top = Expr::Conditional {
            cond: Box::new(cond1),
            then_expr: Box::new(then1),
            else_expr: Box::new(acc),
        };
        Ok((input, top))
    })(input)
}

// ===== declarations =====

fn identifier_list(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<String>>> {
    sep_by1(sym(","), spanned(ident))(input)
}

fn declaration_node(input: RawSpan) -> ParseResult<'_, SpanNode<Declaration<Span>>> {
    spanned(|input| {
        let (input, names) = identifier_list(input)?;
        let (input, mode) = mode_expr_node(input)?;
        let (input, init) = opt(preceded(sym("="), expr_node))(input)?;
        Ok((input, Declaration::Variable { names, mode, init }))
    })(input)
}

fn declaration_statement(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    let (input, _) = keyword("dcl")(input)?;
    let (input, decls) = sep_by1(sym(","), declaration_node)(input)?;
    let (input, _) = sym(";")(input)?;
    let stmts = decls
        .into_iter()
        .map(|d| {
            let span = *d.metadata();
            Node(Statement::Declaration(d), span)
        })
        .collect();
    Ok((input, stmts))
}

/// `name[, name]* [mode] = expr`: every name named in one clause shares the
/// same folded value and (if given) the same mode.
fn synonym_definition_node(input: RawSpan) -> ParseResult<'_, SpanNode<Declaration<Span>>> {
    spanned(|input| {
        let (input, names) = identifier_list(input)?;
        let (input, mode) = opt(mode_expr_node)(input)?;
        let (input, _) = sym("=")(input)?;
        let (input, value) = expr_node(input)?;
        let bindings = names.into_iter().map(|n| (n.0, value.clone())).collect();
        Ok((input, Declaration::Synonym { bindings, mode }))
    })(input)
}

fn synonym_statement(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    let (input, _) = keyword("syn")(input)?;
    let (input, defs) = sep_by1(sym(","), synonym_definition_node)(input)?;
    let (input, _) = sym(";")(input)?;
    let stmts = defs
        .into_iter()
        .map(|d| {
            let span = *d.metadata();
            Node(Statement::Declaration(d), span)
        })
        .collect();
    Ok((input, stmts))
}

fn newmode_definition_node(input: RawSpan) -> ParseResult<'_, SpanNode<Declaration<Span>>> {
    spanned(|input| {
        let (input, names) = identifier_list(input)?;
        let (input, _) = sym("=")(input)?;
        let (input, mode) = mode_expr_node(input)?;
        let bindings = names.into_iter().map(|n| (n.0, mode.clone())).collect();
        Ok((input, Declaration::NewMode { bindings }))
    })(input)
}

fn newmode_statement(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    let (input, _) = keyword("type")(input)?;
    let (input, defs) = sep_by1(sym(","), newmode_definition_node)(input)?;
    let (input, _) = sym(";")(input)?;
    let stmts = defs
        .into_iter()
        .map(|d| {
            let span = *d.metadata();
            Node(Statement::Declaration(d), span)
        })
        .collect();
    Ok((input, stmts))
}

// ===== procedures =====

fn formal_parameter_group(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<FormalParam<Span>>>> {
    let (input, _) = ws0(input)?;
    let start = input;
    let (input, names) = identifier_list(input)?;
    let (input, mode) = mode_expr_node(input)?;
    let (input, is_loc) = map(opt(keyword("loc")), |o| o.is_some())(input)?;
    let span = make_span(start, input);
    let params = names
        .into_iter()
        .map(|name| {
            Node(
                FormalParam {
                    name: name.0,
                    mode: mode.clone(),
                    is_loc,
                },
                span,
            )
        })
        .collect();
    Ok((input, params))
}

fn parenthesis_params(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<FormalParam<Span>>>> {
    delimited(
        sym("("),
        map(opt(sep_by1(sym(","), formal_parameter_group)), |groups| {
            groups.unwrap_or_default().into_iter().flatten().collect()
        }),
        sym(")"),
    )(input)
}

/// `returns (mode [loc])`. The trailing `loc` is parsed and discarded: a
/// procedure's result is always returned by value in this pipeline.
fn result_spec(input: RawSpan) -> ParseResult<'_, SpanNode<ModeExpr<Span>>> {
    delimited(
        preceded(keyword("returns"), sym("(")),
        terminated(mode_expr_node, opt(keyword("loc"))),
        sym(")"),
    )(input)
}

fn procedure_definition<'a>(
    input: RawSpan<'a>,
    name: String,
) -> ParseResult<'a, ProcedureDef<Span>> {
    let (input, _) = keyword("proc")(input)?;
    let (input, params) = parenthesis_params(input)?;
    let (input, result_mode) = opt(result_spec)(input)?;
    let (input, _) = sym(";")(input)?;
    let (input, body) = statement_list(input)?;
    let (input, _) = keyword("end")(input)?;
    Ok((
        input,
        ProcedureDef {
            name,
            params,
            result_mode,
            body,
        },
    ))
}

fn procedure_statement(input: RawSpan) -> ParseResult<'_, SpanNode<Statement<Span>>> {
    spanned(|start_input: RawSpan| {
        let (input, name) = ident(start_input)?;
        let (input, _) = sym(":")(input)?;
        let (input, def) = procedure_definition(input, name)?;
        let (input, _) = sym(";")(input)?;
        let span = make_span(start_input, input);
        Ok((input, Statement::Procedure(Node(def, span))))
    })(input)
}

// ===== actions =====

fn action_node(input: RawSpan) -> ParseResult<'_, SpanNode<ActionStatement<Span>>> {
    spanned(action_kind)(input)
}

fn action_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    alt((
        if_action_kind,
        do_action_kind,
        return_action_kind,
        exit_action_kind,
        assignment_or_call_kind,
    ))(input)
}

fn action_statement_list(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    many0(action_statement)(input)
}

/// `[label:] action;`. A label attaches to whatever single action follows
/// (typically a `do`/`od` loop), and is wrapped as a one-statement
/// [ActionStatement::Labelled] body so `exit label;` has something to find.
fn action_statement(input: RawSpan) -> ParseResult<'_, SpanNode<Statement<Span>>> {
    spanned(|start_input: RawSpan| {
        let (input, label) = opt(terminated(ident, sym(":")))(start_input)?;
        let (input, action) = action_node(input)?;
        let (input, _) = sym(";")(input)?;
        let whole_span = make_span(start_input, input);
        let result = match label {
            Some(label) => {
                let span = *action.metadata();
                ActionStatement::Labelled {
                    label,
                    body: vec![Node(Statement::Action(action), span)],
                }
            }
            None => action.0,
        };
        Ok((input, Statement::Action(Node(result, whole_span))))
    })(input)
}

fn if_action_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    let (mut input, _) = keyword("if")(input)?;
    let mut arms = Vec::new();
    loop {
        let (next, cond) = expr_node(input)?;
        let (next, _) = keyword("then")(next)?;
        let (next, body) = action_statement_list(next)?;
        arms.push((cond, body));
        input = next;
        match keyword("elsif")(input) {
            Ok((next, _)) => {
                input = next;
                continue;
            }
            Err(_) => break,
        }
    }
    let (input, else_body) = opt(preceded(keyword("else"), action_statement_list))(input)?;
    let (input, _) = keyword("fi")(input)?;
    Ok((input, ActionStatement::If { arms, else_body }))
}

fn do_action_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    let (input, _) = keyword("do")(input)?;
    let (input, control) = opt(terminated(control_part, sym(";")))(input)?;
    let (control, while_cond) = match control {
        Some((c, w)) => (c, w),
        None => (None, None),
    };
    let (input, body) = action_statement_list(input)?;
    let (input, _) = keyword("od")(input)?;
    Ok((
        input,
        ActionStatement::Do {
            control,
            while_cond,
            body,
        },
    ))
}

type ControlPart = (Option<ForControl<Span>>, Option<Box<SpanNode<Expr<Span>>>>);

fn control_part(input: RawSpan) -> ParseResult<'_, ControlPart> {
    alt((
        map(
            pair(
                preceded(keyword("for"), for_control),
                opt(preceded(keyword("while"), expr_node)),
            ),
            |(fc, wc)| (Some(fc), wc.map(Box::new)),
        ),
        map(preceded(keyword("while"), expr_node), |wc| {
            (None, Some(Box::new(wc)))
        }),
    ))(input)
}

fn for_control(input: RawSpan) -> ParseResult<'_, ForControl<Span>> {
    let (input, counter) = spanned(ident)(input)?;
    alt((
        move |input| {
            let (input, down) = map(opt(keyword("down")), |o| o.is_some())(input)?;
            let (input, _) = keyword("in")(input)?;
            let (input, mode) = mode_expr_node(input)?;
            Ok((
                input,
                ForControl::Range {
                    counter: counter.clone(),
                    mode: Box::new(mode),
                    down,
                },
            ))
        },
        move |input| {
            let (input, _) = sym("=")(input)?;
            let (input, from) = expr_node(input)?;
            let (input, step) = opt(preceded(keyword("by"), expr_node))(input)?;
            let (input, down) = alt((
                map(pair(keyword("down"), keyword("to")), |_| true),
                map(keyword("to"), |_| false),
            ))(input)?;
            let (input, to) = expr_node(input)?;
            Ok((
                input,
                ForControl::Step {
                    counter: counter.clone(),
                    from: Box::new(from),
                    step: step.map(Box::new),
                    to: Box::new(to),
                    down,
                },
            ))
        },
    ))(input)
}

fn exit_action_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    map(preceded(keyword("exit"), ident), |label| {
        ActionStatement::Exit { label }
    })(input)
}

fn return_action_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    map(preceded(keyword("return"), opt(expr_node)), |value| {
        ActionStatement::Return { value }
    })(input)
}

fn builtin_proc_call_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    let (input, builtin) = alt((
        map(keyword("print"), |_| BuiltinProc::Print),
        map(keyword("read"), |_| BuiltinProc::Read),
    ))(input)?;
    let (input, args) = call_args(input)?;
    Ok((input, ActionStatement::BuiltinCall { builtin, args }))
}

/// `location assigning_operator expr` or `identifier(args)` used as a
/// statement (a call whose result, if any, is discarded).
fn assignment_or_call_kind(input: RawSpan) -> ParseResult<'_, ActionStatement<Span>> {
    alt((builtin_proc_call_kind, |input| {
        let (input, target) = postfix_chain_node(input)?;
        match assigning_operator(input) {
            Ok((input, op)) => {
                let (input, value) = expr_node(input)?;
                Ok((
                    input,
                    ActionStatement::Assign {
                        target: Box::new(target),
                        op,
                        value: Box::new(value),
                    },
                ))
            }
            Err(_) => match target.value() {
                Expr::Call { name, args } => Ok((
                    input,
                    ActionStatement::Call {
                        name: name.clone(),
                        args: args.clone(),
                    },
                )),
                _ => fail(input),
            },
        }
    }))(input)
}

fn assigning_operator(input: RawSpan) -> ParseResult<'_, Option<BinOp>> {
    alt((
        map(sym("+="), |_| Some(BinOp::Add)),
        map(sym("-="), |_| Some(BinOp::Sub)),
        map(sym("*="), |_| Some(BinOp::Mul)),
        map(sym("/="), |_| Some(BinOp::Div)),
        map(sym("%="), |_| Some(BinOp::Mod)),
        map(sym("="), |_| None),
    ))(input)
}

// ===== top level =====

fn statement(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    alt((
        declaration_statement,
        synonym_statement,
        newmode_statement,
        map(procedure_statement, |n| vec![n]),
        map(action_statement, |n| vec![n]),
    ))(input)
}

fn statement_list(input: RawSpan) -> ParseResult<'_, Vec<SpanNode<Statement<Span>>>> {
    map(many0(statement), |groups| groups.into_iter().flatten().collect())(input)
}

/// Parse a whole program. Never panics on malformed input; syntax errors
/// come back as a single [CompileError::ParseError].
pub fn parse(source: &str) -> Result<Program<Span>, CompileErrors> {
    let input = RawSpan::new(source);
    match all_consuming(delimited(ws0, statement_list, ws0))(input) {
        Ok((_, body)) => Ok(Program { body }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let (message, span) = match e.errors.first() {
                Some((at, kind)) => (format!("{:?} near here", kind), make_span(*at, *at)),
                None => ("could not parse program".to_string(), Span::dummy()),
            };
            Err(CompileErrors::new(
                vec![SourceErrorWrapper::new(
                    CompileError::ParseError(message),
                    span,
                    source,
                )],
                source.to_string(),
            ))
        }
        Err(nom::Err::Incomplete(_)) => unreachable!("nom::Err::Incomplete only occurs in streaming mode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::DclType;

    fn parse_ok(source: &str) -> Program<Span> {
        parse(source).unwrap_or_else(|e| panic!("parse failed: {}", e))
    }

    #[test]
    fn parses_a_declaration_with_init() {
        let program = parse_ok("dcl x int = 2;");
        assert_eq!(program.body.len(), 1);
        match program.body[0].value() {
            Statement::Declaration(decl) => match decl.value() {
                Declaration::Variable { names, mode, init } => {
                    assert_eq!(names.len(), 1);
                    assert_eq!(names[0].value(), "x");
                    assert_eq!(*mode.value(), ModeExpr::Int);
                    assert!(init.is_some());
                }
                _ => panic!("expected a variable declaration"),
            },
            _ => panic!("expected a declaration statement"),
        }
    }

    #[test]
    fn flattens_a_multi_group_declaration() {
        let program = parse_ok("dcl a, b int, c bool;");
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn respects_arithmetic_precedence() {
        let program = parse_ok("dcl x int = 1 + 2 * 3;");
        let init = match program.body[0].value() {
            Statement::Declaration(decl) => match decl.value() {
                Declaration::Variable { init, .. } => init.as_ref().unwrap(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        match init.value() {
            Expr::Binary(BinOp::Add, lhs, rhs) => {
                assert!(matches!(lhs.value(), Expr::Literal(Literal::Int(1))));
                assert!(matches!(rhs.value(), Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("expected a top-level addition, got {:?}", other),
        }
    }

    #[test]
    fn parses_array_indexing_and_assignment() {
        let program = parse_ok("v[0] = 1;");
        match program.body[0].value() {
            Statement::Action(action) => match action.value() {
                ActionStatement::Assign { target, op, .. } => {
                    assert!(op.is_none());
                    assert!(matches!(target.value(), Expr::Index { .. }));
                }
                other => panic!("expected an assignment, got {:?}", other),
            },
            other => panic!("expected an action statement, got {:?}", other),
        }
    }

    #[test]
    fn parses_a_while_loop() {
        let program = parse_ok("do while m <= n; s += m; od;");
        match program.body[0].value() {
            Statement::Action(action) => match action.value() {
                ActionStatement::Do {
                    control,
                    while_cond,
                    body,
                } => {
                    assert!(control.is_none());
                    assert!(while_cond.is_some());
                    assert_eq!(body.len(), 1);
                }
                other => panic!("expected a do loop, got {:?}", other),
            },
            _ => panic!("expected an action statement"),
        }
    }

    #[test]
    fn parses_a_for_step_loop() {
        let program = parse_ok("do for c = 0 to n - 1; print(c); od;");
        match program.body[0].value() {
            Statement::Action(action) => match action.value() {
                ActionStatement::Do { control, .. } => {
                    assert!(matches!(control, Some(ForControl::Step { .. })));
                }
                _ => panic!("expected a do loop"),
            },
            _ => panic!("expected an action statement"),
        }
    }

    #[test]
    fn parses_an_if_elsif_else() {
        let program = parse_ok("if a > b then x = 1; elsif a == b then x = 2; else x = 3; fi;");
        match program.body[0].value() {
            Statement::Action(action) => match action.value() {
                ActionStatement::If { arms, else_body } => {
                    assert_eq!(arms.len(), 2);
                    assert!(else_body.is_some());
                }
                _ => panic!("expected an if action"),
            },
            _ => panic!("expected an action statement"),
        }
    }

    #[test]
    fn parses_a_procedure_with_result() {
        let program = parse_ok("fact: proc (n int) returns (int); return n; end;");
        match program.body[0].value() {
            Statement::Procedure(def) => {
                assert_eq!(def.value().name, "fact");
                assert_eq!(def.value().params.len(), 1);
                assert!(def.value().result_mode.is_some());
            }
            _ => panic!("expected a procedure statement"),
        }
    }

    #[test]
    fn parses_a_labelled_loop_and_exit() {
        let program = parse_ok("outer: do exit outer; od;");
        match program.body[0].value() {
            Statement::Action(action) => match action.value() {
                ActionStatement::Labelled { label, body } => {
                    assert_eq!(label, "outer");
                    assert_eq!(body.len(), 1);
                }
                other => panic!("expected a labelled action, got {:?}", other),
            },
            _ => panic!("expected an action statement"),
        }
    }

    #[test]
    fn parses_a_conditional_expression() {
        let program = parse_ok("dcl x int = if a > 0 then 1 else -1 fi;");
        let init = match program.body[0].value() {
            Statement::Declaration(decl) => match decl.value() {
                Declaration::Variable { init, .. } => init.as_ref().unwrap(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert!(matches!(init.value(), Expr::Conditional { .. }));
    }

    #[test]
    fn parses_string_and_char_literals_with_escapes() {
        let program = parse_ok(r#"dcl s chars[10] = "a\nb"; dcl c char = '\'';"#);
        assert_eq!(program.body.len(), 2);
        match program.body[1].value() {
            Statement::Declaration(decl) => match decl.value() {
                Declaration::Variable { init, .. } => {
                    assert!(matches!(
                        init.as_ref().unwrap().value(),
                        Expr::Literal(Literal::Char('\''))
                    ));
                }
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_newmode_and_synonym() {
        let program = parse_ok("type celsius = int; syn freezing = 0;");
        assert_eq!(program.body.len(), 2);
        match program.body[0].value() {
            Statement::Declaration(decl) => {
                assert!(matches!(decl.value(), Declaration::NewMode { .. }));
            }
            _ => panic!("expected a newmode statement"),
        }
        match program.body[1].value() {
            Statement::Declaration(decl) => {
                assert!(matches!(decl.value(), Declaration::Synonym { .. }));
            }
            _ => panic!("expected a synonym statement"),
        }
    }

    #[test]
    fn skips_comments() {
        let program = parse_ok("// a line comment\ndcl x int = 1; /* a block\ncomment */");
        assert_eq!(program.body.len(), 1);
    }

    #[test]
    fn reports_a_parse_error_with_span() {
        let err = parse("dcl ;").unwrap_err();
        assert_eq!(err.errors().len(), 1);
    }

    #[test]
    fn span_covers_the_whole_declaration() {
        let program = parse_ok("  dcl x int;");
        let span = *program.body[0].metadata();
        assert_eq!(span.start_col, 3);
    }

    #[test]
    fn dcl_type_is_unset_until_analysis() {
        // parse.rs only produces spans; decoration (including dcl_type) is
        // filled in later by the analyser.
        let _ = DclType::Var;
    }
}
