//! Small helpers shared across the compiler pipeline: source spans, the
//! debug-trace macro, and source-highlighting for error display.

use serde::Serialize;
use std::fmt;

/// Macro that can wrap any body, and only executes the body if we are running
/// in debug mode. Debug mode is enabled by setting the environment variable
/// DEBUG=true. This compiles away to nothing when --release is used.
///
/// Example:
/// ```
/// use bslk::debug;
/// debug!(println!("Hello!"));
/// ```
#[macro_export]
macro_rules! debug {
    ($arg:expr) => {
        #[cfg(debug_assertions)]
        {
            if let Ok(debug_val) = std::env::var("DEBUG") {
                if debug_val.to_lowercase().as_str() == "true" {
                    $arg
                }
            }
        }
    };
}

/// A region of source text. Carried on every AST node from the moment it's
/// parsed, and never cleared, per spec.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Span {
    pub offset: usize,
    pub length: usize,
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    /// A zero-width span, used for synthetic nodes that don't come from the
    /// parser (e.g. built-in synonyms).
    pub fn dummy() -> Self {
        Span {
            offset: 0,
            length: 0,
            start_line: 0,
            start_col: 0,
            end_line: 0,
            end_col: 0,
        }
    }

    /// Slice the original source down to just the text covered by this span.
    pub fn get_source_slice<'a>(&self, src: &'a str) -> &'a str {
        let end = (self.offset + self.length).min(src.len());
        &src[self.offset.min(src.len())..end]
    }
}

/// Writes the line of source containing `span`, followed by a `^^^` marker
/// under the offending region. Only used when alternate (`{:#}`) formatting
/// is requested, so plain error messages stay terse.
pub fn fmt_src_highlights(
    f: &mut fmt::Formatter<'_>,
    span: &Span,
    source: &str,
) -> fmt::Result {
    let line = source.lines().nth(span.start_line.saturating_sub(1));
    if let Some(line) = line {
        writeln!(f)?;
        writeln!(f, "{}", line)?;
        let mut marker = String::new();
        for _ in 1..span.start_col {
            marker.push(' ');
        }
        let width = if span.end_line == span.start_line {
            (span.end_col.max(span.start_col + 1)) - span.start_col
        } else {
            1
        };
        for _ in 0..width {
            marker.push('^');
        }
        write!(f, "{}", marker)?;
    }
    Ok(())
}
