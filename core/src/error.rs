//! All error-related types: the errors themselves, and the source-aware
//! wrappers used to display them.

use crate::util::{self, Span};
use failure::Fail;
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};

/// A trait for any error that originates in source code. [SourceError]s rely on
/// having source code present in order to display themselves.
pub trait SourceError: 'static + Send + Sync + Debug + Serialize {
    /// Format this error into a simple message. `spanned_src` is the slice of
    /// the source code that corresponds to this error's [Span]. This needs to
    /// be provided by the caller in order to create a proper error message.
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result;
}

/// An error found while resolving, type-checking, or folding a program. This
/// indicates a flaw in the user's program, not an interpreter bug. Compiler
/// bugs always panic instead.
#[derive(Debug, Serialize)]
pub enum CompileError {
    /// Failed to parse the program at all
    ParseError(String),
    /// A name was already bound somewhere visible in the current scope
    Redeclaration { name: String, original: Span },
    /// A name was used but never declared
    UndeclaredIdentifier { name: String },
    /// `exit`/`return` referenced a label that doesn't enclose it
    UndeclaredLabel { name: String },
    /// Two modes that should match don't, in some specific context
    ModeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },
    /// An operator was used on a mode that doesn't support it
    UnsupportedOperator { op: &'static str, mode: String },
    /// The left-hand side of an assignment (or the argument bound to a `loc`
    /// parameter) isn't a valid location
    InvalidLocation { reason: &'static str },
    /// A procedure call passed the wrong number of arguments
    ProcedureArity {
        name: String,
        expected: usize,
        found: usize,
    },
    /// A procedure with a declared result spec has a path that falls off the
    /// end without a `return`
    MissingReturn { name: String },
    /// A literal range's upper bound is less than its lower bound
    RangeError { lower: i64, upper: i64 },
    /// Constant folding failed, e.g. a folded division by zero, or an
    /// operation over operands of mismatched folded types
    ConstantFoldError { reason: String },
}

impl SourceError for CompileError {
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::ParseError(err) => write!(f, "Parse error: {}", err),
            Self::Redeclaration { name, original } => write!(
                f,
                "`{}` is already declared in this scope, originally on line {}",
                name, original.start_line
            ),
            Self::UndeclaredIdentifier { name } => {
                write!(f, "Undeclared identifier `{}`", name)
            }
            Self::UndeclaredLabel { name } => {
                write!(f, "Undeclared label `{}`", name)
            }
            Self::ModeMismatch {
                context,
                expected,
                found,
            } => write!(f, "Mismatched {} types {} and {}", context, expected, found),
            Self::UnsupportedOperator { op, mode } => {
                write!(f, "Operator `{}` is not supported on mode `{}`", op, mode)
            }
            Self::InvalidLocation { reason } => write!(f, "Invalid location: {}", reason),
            Self::ProcedureArity {
                name,
                expected,
                found,
            } => write!(
                f,
                "Procedure `{}` expects {} argument(s), found {}",
                name, expected, found
            ),
            Self::MissingReturn { name } => write!(
                f,
                "Procedure `{}` has a declared result but not every path returns a value",
                name
            ),
            Self::RangeError { lower, upper } => write!(
                f,
                "Range upper bound {} is less than lower bound {}",
                upper, lower
            ),
            Self::ConstantFoldError { reason } => {
                write!(f, "Cannot fold constant expression: {}", reason)
            }
        }?;
        let _ = spanned_src;
        Ok(())
    }
}

/// An error that occurs while the VM is executing a compiled program. This
/// indicates a flaw in the user's program or its input, not an interpreter
/// bug. Interpreter bugs always panic.
#[derive(Debug, Serialize)]
pub enum RuntimeError {
    /// Two `lbl` instructions claimed the same label id
    LabelError { label: usize },
    /// An input token couldn't be parsed as the expected primitive
    ValueError { expected: &'static str, found: String },
    /// The instruction stream referenced a mnemonic the VM doesn't know
    UnknownCall { mnemonic: String },
    /// `rdv`/`rdc`/`rds` ran with no more input tokens available
    EmptyInput,
    /// The program ran longer than the configured cycle budget
    TooManyCycles,
    /// A `div` or `mod` instruction's divisor was zero
    DivisionByZero,
}

impl SourceError for RuntimeError {
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::LabelError { label } => {
                write!(f, "LabelError: label {} declared more than once", label)
            }
            Self::ValueError { expected, found } => write!(
                f,
                "ValueError: expected a(n) {}, found `{}`",
                expected, found
            ),
            Self::UnknownCall { mnemonic } => {
                write!(f, "UnknownCall: `{}` is not a known instruction", mnemonic)
            }
            Self::EmptyInput => write!(f, "Read attempted while input is empty"),
            Self::TooManyCycles => write!(
                f,
                "Maximum number of cycles reached, cannot execute instruction `{}`",
                spanned_src
            ),
            Self::DivisionByZero => write!(f, "Division or modulus by zero"),
        }
    }
}

/// A wrapper around a [SourceError], that holds some extra data:
/// - The [Span] of the source code that caused the error
/// - The offending chunk of source code itself
///
/// This type on its own can be formatted, without any external data.
#[derive(Debug, Fail, Serialize)]
pub struct SourceErrorWrapper<E: SourceError> {
    error: E,
    span: Span,
    spanned_source: String,
}

impl<E: SourceError> SourceErrorWrapper<E> {
    pub fn new(error: E, span: Span, src: &str) -> Self {
        Self {
            error,
            span,
            spanned_source: span.get_source_slice(src).into(),
        }
    }

    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl<E: SourceError> Display for SourceErrorWrapper<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR (line {}): ", self.span.start_line)?;
        self.error.fmt_msg(f, &self.spanned_source)?;
        Ok(())
    }
}

/// A wrapper around a collection of errors. This holds the errors as well as
/// the source code, and can be used to render associated source code with
/// each error.
#[derive(Debug, Fail, Serialize)]
pub struct WithSource<E: SourceError> {
    errors: Vec<SourceErrorWrapper<E>>,
    #[serde(skip)]
    source: String,
}

impl<E: SourceError> WithSource<E> {
    /// Wrap a collection of errors with its source code.
    pub(crate) fn new(
        errors: impl IntoIterator<Item = SourceErrorWrapper<E>>,
        source: String,
    ) -> Self {
        Self {
            errors: errors.into_iter().collect(),
            source,
        }
    }

    /// Get a reference to the errors wrapped by this type.
    pub fn errors(&self) -> &[SourceErrorWrapper<E>] {
        &self.errors
    }
}

impl<E: SourceError> Display for WithSource<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Write each error, separated by a newline
        for (i, error) in self.errors.iter().enumerate() {
            // Prefix with a newline for all errors but the first
            if i > 0 {
                writeln!(f)?; // just a newline
            }

            write!(f, "{}", error)?;
            if f.alternate() {
                util::fmt_src_highlights(f, &error.span, &self.source)?;
            }
        }
        Ok(())
    }
}

pub type CompileErrors = WithSource<CompileError>;
pub type RuntimeErrors = WithSource<RuntimeError>;
