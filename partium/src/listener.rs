//! Listener capabilities: diagnostics out, control decisions in.
//!
//! Both listeners are optional. The diagnostic listener observes; the
//! control listener steers, and every one of its hooks defaults to "yes,
//! process it", so an empty impl reproduces a classical preprocessor.

use crate::macro_def::Macro;
use crate::preprocessor::Preprocessor;
use crate::token::Token;

/// What just happened to the source stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceChangeEvent {
    /// A source was pushed and is now current.
    Push,
    /// The current source was popped.
    Pop,
    /// The current source was suspended by a push above it.
    Suspend,
    /// The source below a popped source is current again.
    Resume,
}

/// Which conditional directive a control decision is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfKind {
    /// `#if`
    If,
    /// `#ifdef`
    Ifdef,
    /// `#ifndef`
    Ifndef,
    /// `#elif`
    Elif,
}

/// Receives errors, warnings and structural events as they happen.
///
/// When no diagnostic listener is installed, errors are returned to the
/// caller of `token()` instead and processing of the current line stops.
pub trait DiagnosticListener {
    /// An error at `line:column` of `source` (a display name, if known).
    fn handle_error(&self, source: Option<&str>, line: u32, column: u32, msg: &str) {
        let _ = (source, line, column, msg);
    }

    /// A warning; escalated to [`handle_error`](Self::handle_error) when the
    /// `Error` warning flag is set.
    fn handle_warning(&self, source: Option<&str>, line: u32, column: u32, msg: &str) {
        let _ = (source, line, column, msg);
    }

    /// The source stack changed.
    fn handle_source_change(&self, source: Option<&str>, event: SourceChangeEvent) {
        let _ = (source, event);
    }

    /// A `#define` was accepted.
    fn handle_define(&self, m: &Macro, source: Option<&str>) {
        let _ = (m, source);
    }

    /// A `#undef` was accepted.
    fn handle_undefine(&self, m: &Macro, source: Option<&str>) {
        let _ = (m, source);
    }

    /// An include resolved; `text` is the spelled header name.
    fn handle_include(&self, text: &str, is_next: bool, from: Option<&str>, to: Option<&str>) {
        let _ = (text, is_next, from, to);
    }
}

/// Decides, directive by directive, whether the engine should process or
/// preserve. Declined directives are replayed verbatim into the output while
/// the engine keeps tracking conditional nesting.
pub trait ControlListener {
    /// Process this `#define`? Declining leaves the directive in the output
    /// and the macro table untouched.
    fn add_macro(&self, m: &Macro, source: Option<&str>) -> bool {
        let _ = (m, source);
        true
    }

    /// Process this `#undef`?
    fn remove_macro(&self, m: &Macro, source: Option<&str>) -> bool {
        let _ = (m, source);
        true
    }

    /// Process this `#include` / `#include_next`?
    fn include(&self, source: Option<&str>, line: u32, name: &str, quoted: bool, next: bool) -> bool {
        let _ = (source, line, name, quoted, next);
        true
    }

    /// Process this conditional? `tokens` is the captured directive line,
    /// directive word first. Declining keeps the directive in the output
    /// with its then-branch active.
    fn process_if(&self, tokens: &[Token], source: Option<&str>, kind: IfKind) -> bool {
        let _ = (tokens, source, kind);
        true
    }

    /// Expand this macro use? `in_conditional` is true inside `#if`/`#elif`
    /// conditions and argument pre-expansion.
    fn expand_macro(
        &self,
        m: &Macro,
        source: Option<&str>,
        line: u32,
        column: u32,
        in_conditional: bool,
    ) -> bool {
        let _ = (m, source, line, column, in_conditional);
        true
    }

    /// For a declined conditional, an optional rewrite of its condition.
    /// The returned text replaces the condition in the preserved directive;
    /// `pp` is available to expand macros inside it. `None` keeps the
    /// condition as spelled.
    fn partially_processed_condition(
        &self,
        condition: &[Token],
        source: Option<&str>,
        kind: IfKind,
        pp: &mut Preprocessor,
    ) -> Option<String> {
        let _ = (condition, source, kind, pp);
        None
    }
}
