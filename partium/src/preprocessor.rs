//! The driver: source-stack management, the token loop, and every directive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use log::debug;

use crate::config::{Feature, PreprocessorConfig, Warning};
use crate::date_time::{format_date, format_time};
use crate::error::PreprocessError;
use crate::expansion::{Argument, escape, substitute};
use crate::lexer::{LexSeverity, Lexer};
use crate::listener::{ControlListener, DiagnosticListener, IfKind, SourceChangeEvent};
use crate::macro_def::{Builtin, Macro};
use crate::numeric::NumericValue;
use crate::source::Source;
use crate::state::State;
use crate::token::{Token, TokenKind, TokenValue};
use crate::vfs::{DiskFileSystem, VirtualFile, VirtualFileSystem};

/// The directive words the dispatcher understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Directive {
    Define,
    Undef,
    Include,
    IncludeNext,
    If,
    Ifdef,
    Ifndef,
    Elif,
    Else,
    Endif,
    Line,
    Pragma,
    Error,
    Warning,
}

impl Directive {
    fn from_text(text: &str) -> Option<Directive> {
        match text {
            "define" => Some(Directive::Define),
            "undef" => Some(Directive::Undef),
            "include" => Some(Directive::Include),
            "include_next" => Some(Directive::IncludeNext),
            "if" => Some(Directive::If),
            "ifdef" => Some(Directive::Ifdef),
            "ifndef" => Some(Directive::Ifndef),
            "elif" => Some(Directive::Elif),
            "else" => Some(Directive::Else),
            "endif" => Some(Directive::Endif),
            "line" => Some(Directive::Line),
            "pragma" => Some(Directive::Pragma),
            "error" => Some(Directive::Error),
            "warning" => Some(Directive::Warning),
            _ => None,
        }
    }
}

/// A C preprocessor.
///
/// The preprocessor outputs a token stream which does not need re-lexing for
/// C or C++; alternatively the output text may be reconstructed by
/// concatenating the [`text`](Token::text) of the returned tokens. Behavior
/// is steered by [features](Feature), [warnings](Warning), and the optional
/// [diagnostic](DiagnosticListener) and [control](ControlListener) listeners.
pub struct Preprocessor {
    inputs: VecDeque<Source>,
    macros: HashMap<String, Macro>,
    states: Vec<State>,
    sources: Vec<Source>,
    counter: u32,
    once_seen: HashSet<String>,
    includes: Vec<String>,
    quote_include_path: Vec<String>,
    system_include_path: Vec<String>,
    frameworks_path: Vec<String>,
    features: HashSet<Feature>,
    warnings: HashSet<Warning>,
    filesystem: Rc<dyn VirtualFileSystem>,
    listener: Option<Rc<dyn DiagnosticListener>>,
    control: Option<Rc<dyn ControlListener>>,
    source_unget: Option<(Token, bool)>,
    expr_unget: Option<Token>,
    at_line_start: bool,
    token_line_start: bool,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    /// Create a preprocessor with no inputs and only the dynamic sentinels
    /// defined.
    #[must_use]
    pub fn new() -> Self {
        let mut macros = HashMap::new();
        for (name, builtin) in [
            ("__LINE__", Builtin::Line),
            ("__FILE__", Builtin::File),
            ("__COUNTER__", Builtin::Counter),
            ("__DATE__", Builtin::Date),
            ("__TIME__", Builtin::Time),
        ] {
            macros.insert(name.to_string(), Macro::sentinel(name, builtin));
        }
        Preprocessor {
            inputs: VecDeque::new(),
            macros,
            states: vec![State::sentinel()],
            sources: Vec::new(),
            counter: 0,
            once_seen: HashSet::new(),
            includes: Vec::new(),
            quote_include_path: Vec::new(),
            system_include_path: Vec::new(),
            frameworks_path: Vec::new(),
            features: HashSet::new(),
            warnings: HashSet::new(),
            filesystem: Rc::new(DiskFileSystem),
            listener: None,
            control: None,
            source_unget: None,
            expr_unget: None,
            at_line_start: true,
            token_line_start: true,
        }
    }

    /// Create a preprocessor and apply a configuration.
    #[must_use]
    pub fn with_config(config: &PreprocessorConfig) -> Self {
        let mut pp = Self::new();
        pp.apply_config(config);
        pp
    }

    /// Apply configuration: features, warnings, search paths and
    /// command-line macros.
    pub fn apply_config(&mut self, config: &PreprocessorConfig) {
        self.features.extend(config.features.iter().copied());
        self.warnings.extend(config.warnings.iter().copied());
        self.quote_include_path
            .extend(config.quote_include_path.iter().cloned());
        self.system_include_path
            .extend(config.system_include_path.iter().cloned());
        self.frameworks_path
            .extend(config.frameworks_path.iter().cloned());
        for (name, value) in &config.defines {
            self.define(name, value);
        }
        for name in &config.undefs {
            self.undef(name);
        }
    }

    /// Enable a feature.
    pub fn add_feature(&mut self, feature: Feature) {
        self.features.insert(feature);
    }

    /// True if the feature is enabled.
    #[must_use]
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Enable a warning class.
    pub fn add_warning(&mut self, warning: Warning) {
        self.warnings.insert(warning);
    }

    /// True if the warning class is enabled.
    #[must_use]
    pub fn has_warning(&self, warning: Warning) -> bool {
        self.warnings.contains(&warning)
    }

    /// Install the diagnostic listener. With one installed, errors are
    /// delivered to it and processing continues; without one, the first
    /// error ends the token stream.
    pub fn set_listener(&mut self, listener: Rc<dyn DiagnosticListener>) {
        self.listener = Some(listener);
    }

    /// Install the control listener that steers directive processing.
    pub fn set_control_listener(&mut self, control: Rc<dyn ControlListener>) {
        self.control = Some(control);
    }

    /// Replace the virtual filesystem used for include resolution.
    pub fn set_file_system(&mut self, filesystem: Rc<dyn VirtualFileSystem>) {
        self.filesystem = filesystem;
    }

    /// Set the search path for quoted includes.
    pub fn set_quote_include_path(&mut self, path: Vec<String>) {
        self.quote_include_path = path;
    }

    /// Set the search path for system includes.
    pub fn set_system_include_path(&mut self, path: Vec<String>) {
        self.system_include_path = path;
    }

    /// Set the search path for framework includes.
    pub fn set_frameworks_path(&mut self, path: Vec<String>) {
        self.frameworks_path = path;
    }

    /// Queue a string as input. Inputs are processed in the order added.
    pub fn add_input_str(&mut self, text: &str) {
        self.inputs.push_back(Source::string(text));
    }

    /// Queue a file as input, resolved through the virtual filesystem.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read.
    pub fn add_input_file(&mut self, path: &str) -> Result<(), PreprocessError> {
        let file = self.filesystem.get_file(path);
        let contents = file.read()?;
        self.inputs
            .push_back(Source::file(&contents, file.path(), file.path()));
        Ok(())
    }

    /// Define an object-like macro; the value is lexed into its replacement
    /// list. Defining `defined` is ignored with an error.
    pub fn define(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        let name = name.as_ref();
        if name == "defined" {
            return;
        }
        let mut m = Macro::new(name);
        let mut lexer = Lexer::new(value.as_ref(), None, None);
        loop {
            let tok = lexer.next_token();
            match tok.kind {
                TokenKind::Eof => break,
                TokenKind::NewLine => break,
                _ => m.add_token(tok),
            }
        }
        self.macros.insert(name.to_string(), m);
    }

    /// Define a macro with the value `1`.
    pub fn define_flag(&mut self, name: impl AsRef<str>) {
        self.define(name, "1");
    }

    /// Remove a macro definition.
    pub fn undef(&mut self, name: &str) {
        self.macros.remove(name);
    }

    /// True if the name is currently defined.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    /// The macro table.
    #[must_use]
    pub fn macros(&self) -> &HashMap<String, Macro> {
        &self.macros
    }

    /// The named macro, if defined.
    #[must_use]
    pub fn macro_def(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    /// Paths of every file included so far, in inclusion order.
    #[must_use]
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /* Errors and warnings */

    fn source_name(&self) -> Option<String> {
        self.sources
            .iter()
            .rev()
            .find_map(|s| s.name().map(str::to_string))
    }

    fn source_display_name(&self) -> String {
        self.source_name().unwrap_or_else(|| "<no file>".to_string())
    }

    fn current_line(&self) -> u32 {
        self.sources.iter().rev().find_map(Source::line).unwrap_or(0)
    }

    fn current_path(&self) -> Option<String> {
        self.sources
            .iter()
            .rev()
            .find_map(|s| s.path().map(str::to_string))
    }

    /// The spelling of a line in the nearest lexer-backed source, attached
    /// to escaping errors for context display.
    fn source_line_text(&self, line: u32) -> Option<String> {
        self.sources.iter().rev().find_map(|s| s.line_text(line))
    }

    pub(crate) fn report(&mut self, err: PreprocessError) -> Result<(), PreprocessError> {
        match &self.listener {
            Some(listener) => {
                listener.handle_error(
                    self.source_name().as_deref(),
                    err.line,
                    err.column.unwrap_or(0),
                    &err.message(),
                );
                Ok(())
            }
            None => Err(err),
        }
    }

    pub(crate) fn error(
        &mut self,
        line: u32,
        column: u32,
        msg: String,
    ) -> Result<(), PreprocessError> {
        let mut err =
            PreprocessError::other(self.source_display_name(), line, msg).with_column(column);
        if let Some(text) = self.source_line_text(line) {
            err = err.with_source_line(text);
        }
        self.report(err)
    }

    pub(crate) fn warning(
        &mut self,
        line: u32,
        column: u32,
        msg: String,
    ) -> Result<(), PreprocessError> {
        if self.warnings.contains(&Warning::Error) {
            return self.error(line, column, msg);
        }
        match &self.listener {
            Some(listener) => {
                listener.handle_warning(self.source_name().as_deref(), line, column, &msg);
                Ok(())
            }
            None => {
                let mut err = PreprocessError::other(
                    self.source_display_name(),
                    line,
                    format!("warning: {msg}"),
                )
                .with_column(column);
                if let Some(text) = self.source_line_text(line) {
                    err = err.with_source_line(text);
                }
                Err(err)
            }
        }
    }

    fn route_lex_diagnostics(&mut self) -> Result<(), PreprocessError> {
        let diags = match self.sources.last_mut() {
            Some(src) => src.take_diagnostics(),
            None => return Ok(()),
        };
        for diag in diags {
            match diag.severity {
                LexSeverity::Warning => self.warning(diag.line, diag.column, diag.message)?,
                LexSeverity::Error => {
                    let mut err = PreprocessError::lex(
                        self.source_display_name(),
                        diag.line,
                        diag.message,
                    )
                    .with_column(diag.column);
                    if let Some(text) = diag.source_line {
                        err = err.with_source_line(text);
                    }
                    self.report(err)?;
                }
            }
        }
        Ok(())
    }

    /* Conditional states */

    fn push_state(&mut self, tokens: Vec<Token>) {
        let top = self.states.last().cloned().unwrap_or_else(State::sentinel);
        self.states.push(State::nested(&top, tokens));
    }

    fn is_active(&self) -> bool {
        self.states
            .last()
            .is_some_and(|s| s.parent_active && s.active)
    }

    /// The current conditional nesting depth, sentinel excluded. Depth 0 at
    /// EOF means every `#if` was balanced.
    #[must_use]
    pub fn conditional_depth(&self) -> usize {
        self.states.len() - 1
    }

    /// The captured directive line of the innermost conditional group, in
    /// the spelling that would be replayed if the group is preserved.
    /// Empty outside any conditional.
    #[must_use]
    pub fn conditional_tokens(&self) -> &[Token] {
        self.states.last().map_or(&[], |s| s.tokens.as_slice())
    }

    /* The source stack */

    pub(crate) fn source_depth(&self) -> usize {
        self.sources.len()
    }

    pub(crate) fn push_source(&mut self, mut source: Source, autopop: bool) {
        source.autopop = autopop;
        if let Some(listener) = &self.listener {
            if !self.sources.is_empty() {
                listener.handle_source_change(self.source_name().as_deref(), SourceChangeEvent::Suspend);
            }
        }
        let starts_line = matches!(
            source.kind,
            crate::source::SourceKind::File(_) | crate::source::SourceKind::String(_)
        );
        self.sources.push(source);
        if starts_line {
            self.at_line_start = true;
        }
        if let Some(listener) = &self.listener {
            listener.handle_source_change(self.source_name().as_deref(), SourceChangeEvent::Push);
        }
    }

    /// Pop the top source. When linemarkers are enabled and the popped
    /// source contributed lines, the caller gets a `#line ... 2` token to
    /// emit for the return to the parent.
    pub(crate) fn pop_source(&mut self, linemarker: bool) -> Result<Option<Token>, PreprocessError> {
        if let Some(listener) = &self.listener {
            listener.handle_source_change(self.source_name().as_deref(), SourceChangeEvent::Pop);
        }
        let popped = self.sources.pop();
        if let Some(listener) = &self.listener {
            if !self.sources.is_empty() {
                listener.handle_source_change(self.source_name().as_deref(), SourceChangeEvent::Resume);
            }
        }
        let popped_numbered = popped.as_ref().is_some_and(Source::is_numbered);
        if linemarker
            && self.features.contains(&Feature::Linemarkers)
            && popped_numbered
            && !self.sources.is_empty()
        {
            let line = self.current_line();
            let name = self.source_name();
            return Ok(Some(self.line_token(line, name.as_deref(), " 2")));
        }
        Ok(None)
    }

    fn line_token(&self, line: u32, name: Option<&str>, flag: &str) -> Token {
        let name = name.unwrap_or("<no file>");
        let text = format!("#line {} \"{}\"{}\n", line, escape(name), flag);
        Token::new(TokenKind::LineMarker, line, 0, text)
    }

    /// Start the next queued input, producing its entry linemarker, or EOF
    /// when the queue is empty.
    fn next_source(&mut self) -> Token {
        match self.inputs.pop_front() {
            None => Token::eof(),
            Some(source) => {
                let line = source.line().unwrap_or(1);
                let name = source.name().map(str::to_string);
                self.push_source(source, true);
                self.line_token(line, name.as_deref(), " 1")
            }
        }
    }

    /// Pull the next raw token off the source stack, popping autopop sources
    /// at their EOF and starting queued inputs as needed.
    pub(crate) fn source_token(&mut self) -> Result<Token, PreprocessError> {
        if let Some((tok, line_start)) = self.source_unget.take() {
            self.token_line_start = line_start;
            return Ok(tok);
        }
        loop {
            if self.sources.is_empty() {
                let tok = self.next_source();
                if tok.kind == TokenKind::LineMarker
                    && !self.features.contains(&Feature::Linemarkers)
                {
                    continue;
                }
                self.token_line_start = true;
                self.at_line_start = true;
                return Ok(tok);
            }
            let tok = match self.sources.last_mut() {
                Some(src) => src.next_token(),
                None => Token::eof(),
            };
            self.route_lex_diagnostics()?;
            if tok.kind == TokenKind::Eof
                && self.sources.last().is_some_and(|s| s.autopop)
            {
                if let Some(mark) = self.pop_source(true)? {
                    self.token_line_start = self.at_line_start;
                    self.at_line_start = true;
                    return Ok(mark);
                }
                continue;
            }
            self.token_line_start = self.at_line_start;
            match tok.kind {
                TokenKind::NewLine | TokenKind::LineMarker => self.at_line_start = true,
                TokenKind::Whitespace
                | TokenKind::CComment
                | TokenKind::CppComment
                | TokenKind::Eof => {}
                _ => self.at_line_start = false,
            }
            return Ok(tok);
        }
    }

    fn source_untoken(&mut self, tok: Token) {
        debug_assert!(self.source_unget.is_none(), "cannot unget two source tokens");
        self.source_unget = Some((tok, self.token_line_start));
    }

    pub(crate) fn source_token_nonwhite(&mut self) -> Result<Token, PreprocessError> {
        loop {
            let tok = self.source_token()?;
            if !tok.is_white() {
                return Ok(tok);
            }
        }
    }

    /// Discard tokens to the end of the current line, optionally warning
    /// about anything that was not whitespace. Returns the newline.
    fn skip_line(&mut self, warn_nonwhite: bool) -> Result<Token, PreprocessError> {
        loop {
            let tok = match self.source_unget.take() {
                Some((tok, line_start)) => {
                    self.token_line_start = line_start;
                    tok
                }
                None => match self.sources.last_mut() {
                    Some(src) => {
                        let tok = src.next_token();
                        self.route_lex_diagnostics()?;
                        tok
                    }
                    None => return Ok(Token::eof()),
                },
            };
            match tok.kind {
                TokenKind::NewLine => {
                    self.at_line_start = true;
                    return Ok(tok);
                }
                TokenKind::Eof => {
                    if self.sources.last().is_some_and(|s| s.autopop) {
                        if let Some(mark) = self.pop_source(true)? {
                            self.at_line_start = true;
                            return Ok(mark);
                        }
                        self.at_line_start = true;
                    }
                    return Ok(tok);
                }
                _ => {
                    if warn_nonwhite && !tok.is_white() {
                        self.warning(
                            tok.line,
                            tok.column,
                            format!("unexpected token '{}' at end of directive", tok.text),
                        )?;
                    }
                }
            }
        }
    }

    /// Capture the rest of the directive line: the given first token plus
    /// everything up to (not including) the newline. Never expands, and
    /// never crosses out of the current source; an EOF here is handed back
    /// unconsumed so the regular pull deals with the autopop.
    fn capture_line(&mut self, first: Token) -> Result<(Vec<Token>, Token), PreprocessError> {
        let mut tokens = vec![first];
        loop {
            let tok = match self.source_unget.take() {
                Some((tok, line_start)) => {
                    self.token_line_start = line_start;
                    tok
                }
                None => match self.sources.last_mut() {
                    Some(src) => {
                        let tok = src.next_token();
                        self.route_lex_diagnostics()?;
                        tok
                    }
                    None => Token::eof(),
                },
            };
            match tok.kind {
                TokenKind::NewLine => {
                    self.at_line_start = true;
                    return Ok((tokens, tok));
                }
                TokenKind::Eof => return Ok((tokens, tok)),
                _ => {
                    if tok.text != "\r" {
                        tokens.push(tok);
                    }
                }
            }
        }
    }

    /// Replace a comment by whitespace that preserves the newlines it
    /// contained, or a single space when it had none.
    fn to_whitespace(tok: &Token) -> Token {
        let nls = tok.text.chars().filter(|&c| c == '\n').count();
        let text = if nls == 0 { " ".to_string() } else { "\n".repeat(nls) };
        Token::new(TokenKind::Whitespace, tok.line, tok.column, text)
    }

    fn comment_token(&self, tok: Token) -> Token {
        if self.features.contains(&Feature::KeepAllComments) {
            return tok;
        }
        if self.is_active() && self.features.contains(&Feature::KeepComments) {
            return tok;
        }
        Self::to_whitespace(&tok)
    }

    /* Macro expansion */

    fn is_expanding(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s.is_expanding(name))
    }

    fn control_allows_expansion(&self, m: &Macro, tok: &Token, in_conditional: bool) -> bool {
        match &self.control {
            Some(control) => control.expand_macro(
                m,
                self.source_name().as_deref(),
                tok.line,
                tok.column,
                in_conditional,
            ),
            None => true,
        }
    }

    /// Process a macro use. Returns false when the identifier turns out not
    /// to be an invocation (or the arguments were bad), in which case the
    /// identifier itself should be emitted.
    fn expand_macro_use(&mut self, m: &Macro, orig: &Token) -> Result<bool, PreprocessError> {
        let mut args: Vec<Argument> = Vec::new();
        if m.is_function_like() {
            // Peek across whitespace for the opening paren; without one this
            // is not an invocation.
            loop {
                let tok = self.source_token()?;
                match tok.kind {
                    TokenKind::Whitespace
                    | TokenKind::CComment
                    | TokenKind::CppComment
                    | TokenKind::NewLine => continue,
                    TokenKind::LParen => break,
                    _ => {
                        self.source_untoken(tok);
                        return Ok(false);
                    }
                }
            }

            let mut tok = self.source_token_nonwhite()?;
            // One empty argument and zero declared parameters are the same
            // invocation: M().
            if tok.kind != TokenKind::RParen || m.num_params() > 0 {
                let mut arg = Argument::new();
                let mut depth = 0u32;
                let mut space = false;
                loop {
                    match tok.kind {
                        TokenKind::Eof => {
                            self.error(tok.line, tok.column, "EOF in macro arguments".to_string())?;
                            return Ok(false);
                        }
                        TokenKind::Comma if depth == 0 => {
                            if m.is_variadic() && args.len() == m.num_params() - 1 {
                                // Everything from here on is __VA_ARGS__.
                                arg.add_token(tok);
                            } else {
                                args.push(arg);
                                arg = Argument::new();
                            }
                            space = false;
                        }
                        TokenKind::RParen => {
                            if depth == 0 {
                                args.push(arg);
                                break;
                            }
                            depth -= 1;
                            arg.add_token(tok);
                            space = false;
                        }
                        TokenKind::LParen => {
                            depth += 1;
                            arg.add_token(tok);
                            space = false;
                        }
                        TokenKind::Whitespace
                        | TokenKind::CComment
                        | TokenKind::CppComment
                        | TokenKind::NewLine => {
                            space = true;
                        }
                        _ => {
                            if space && !arg.is_empty() {
                                arg.add_token(Token::space());
                            }
                            arg.add_token(tok);
                            space = false;
                        }
                    }
                    tok = self.source_token()?;
                }

                if args.len() != m.num_params() {
                    if m.is_variadic() && args.len() == m.num_params() - 1 {
                        args.push(Argument::new());
                    } else if m.is_variadic() {
                        self.error(
                            tok.line,
                            tok.column,
                            format!(
                                "variadic macro {} has at least {} parameters but given {} arguments",
                                m.name(),
                                m.num_params() - 1,
                                args.len()
                            ),
                        )?;
                        return Ok(false);
                    } else {
                        self.error(
                            tok.line,
                            tok.column,
                            format!(
                                "macro {} has {} parameters but given {} arguments",
                                m.name(),
                                m.num_params(),
                                args.len()
                            ),
                        )?;
                        return Ok(false);
                    }
                }

                // Pre-expand each argument exactly once, before substitution.
                for arg in &mut args {
                    if !arg.is_expanded() {
                        let expanded = self.expand_token_list(arg.raw().to_vec())?;
                        arg.set_expansion(expanded);
                    }
                }
            }
        }

        match m.builtin() {
            Some(Builtin::Line) => {
                let text = orig.line.to_string();
                let tok = Token::with_value(
                    TokenKind::Number,
                    orig.line,
                    orig.column,
                    text.clone(),
                    TokenValue::Numeric(NumericValue::integer(10, text)),
                );
                self.push_source(Source::fixed(vec![tok]), true);
            }
            Some(Builtin::File) => {
                let name = self.source_display_name();
                let text = format!("\"{}\"", escape(&name));
                let tok = Token::with_value(
                    TokenKind::String,
                    orig.line,
                    orig.column,
                    text,
                    TokenValue::Text(name),
                );
                self.push_source(Source::fixed(vec![tok]), true);
            }
            Some(Builtin::Counter) => {
                let value = self.counter;
                self.counter += 1;
                let text = value.to_string();
                let tok = Token::with_value(
                    TokenKind::Number,
                    orig.line,
                    orig.column,
                    text.clone(),
                    TokenValue::Numeric(NumericValue::integer(10, text)),
                );
                self.push_source(Source::fixed(vec![tok]), true);
            }
            Some(Builtin::Date) => {
                let value = format_date();
                let tok = Token::with_value(
                    TokenKind::String,
                    orig.line,
                    orig.column,
                    format!("\"{value}\""),
                    TokenValue::Text(value),
                );
                self.push_source(Source::fixed(vec![tok]), true);
            }
            Some(Builtin::Time) => {
                let value = format_time();
                let tok = Token::with_value(
                    TokenKind::String,
                    orig.line,
                    orig.column,
                    format!("\"{value}\""),
                    TokenValue::Text(value),
                );
                self.push_source(Source::fixed(vec![tok]), true);
            }
            None => {
                let replacement = substitute(m, &args);
                self.push_source(Source::macro_expansion(m.name(), replacement), true);
            }
        }

        Ok(true)
    }

    /// The expansion stream: source tokens with macro uses replaced. Used by
    /// conditions and argument pre-expansion; bypasses directive handling.
    pub(crate) fn expanded_token(&mut self) -> Result<Token, PreprocessError> {
        loop {
            let tok = self.source_token()?;
            if tok.kind == TokenKind::Identifier
                && let Some(m) = self.macros.get(&tok.text)
            {
                if self.is_expanding(&tok.text) {
                    return Ok(tok);
                }
                let m = m.clone();
                if self.control_allows_expansion(&m, &tok, true) && self.expand_macro_use(&m, &tok)? {
                    continue;
                }
            }
            return Ok(tok);
        }
    }

    pub(crate) fn expanded_token_nonwhite(&mut self) -> Result<Token, PreprocessError> {
        loop {
            let tok = self.expanded_token()?;
            if !tok.is_white() {
                return Ok(tok);
            }
        }
    }

    /// Fully expand a token list in isolation, collapsing whitespace runs to
    /// single spaces. This is the one-shot argument pre-expansion.
    pub(crate) fn expand_token_list(
        &mut self,
        tokens: Vec<Token>,
    ) -> Result<Vec<Token>, PreprocessError> {
        let depth = self.source_depth();
        self.push_source(Source::fixed(tokens), false);
        let mut expansion: Vec<Token> = Vec::new();
        let mut space = false;
        loop {
            let tok = self.expanded_token()?;
            match tok.kind {
                TokenKind::Eof => break,
                TokenKind::Whitespace | TokenKind::CComment | TokenKind::CppComment => {
                    space = true;
                }
                _ => {
                    if space && !expansion.is_empty() {
                        expansion.push(Token::space());
                    }
                    expansion.push(tok);
                    space = false;
                }
            }
        }
        while self.source_depth() > depth {
            self.pop_source(false)?;
        }
        Ok(expansion)
    }

    /// Lex a string and expand every macro in it against the current macro
    /// table. Useful to control listeners rewriting conditions.
    ///
    /// # Errors
    /// Returns an error if expansion fails and no diagnostic listener is
    /// installed.
    pub fn expand(&mut self, text: &str) -> Result<Vec<Token>, PreprocessError> {
        let mut lexer = Lexer::new(text, None, None);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.kind == TokenKind::Eof {
                break;
            }
            tokens.push(tok);
        }
        self.expand_token_list(tokens)
    }

    /* Expression-evaluator plumbing (the evaluator itself lives in expr.rs) */

    pub(crate) fn clear_expr_unget(&mut self) {
        self.expr_unget = None;
    }

    pub(crate) fn take_expr_unget(&mut self) -> Option<Token> {
        self.expr_unget.take()
    }

    pub(crate) fn set_expr_unget(&mut self, tok: Token) {
        debug_assert!(self.expr_unget.is_none(), "cannot unget two expression tokens");
        self.expr_unget = Some(tok);
    }

    /* Includes */

    fn try_include(&mut self, file: &Rc<dyn VirtualFile>) -> Result<bool, PreprocessError> {
        if !file.is_file() {
            return Ok(false);
        }
        if self.features.contains(&Feature::Debug) {
            debug!("pp: including {}", file.path());
        }
        let contents = file.read()?;
        self.includes.push(file.path().to_string());
        self.push_source(Source::file(&contents, file.path(), file.path()), true);
        Ok(true)
    }

    fn include_from_path(
        &mut self,
        path: &[String],
        name: &str,
    ) -> Result<bool, PreprocessError> {
        for dir in path {
            let file = self.filesystem.get_file_in(dir, name);
            if self.try_include(&file)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve and push an included file per the search order: absolute
    /// paths as-is; quoted lookups relative to the including file, then the
    /// quote path; `<Framework/Header.h>` through the frameworks path; and
    /// finally the system path. `#include_next` resumes the system search
    /// after the directory that produced the current file.
    fn do_include(
        &mut self,
        parent: Option<&str>,
        line: u32,
        name: &str,
        quoted: bool,
        next: bool,
    ) -> Result<(), PreprocessError> {
        if name.starts_with('/') {
            let file = self.filesystem.get_file(name);
            if self.try_include(&file)? {
                return Ok(());
            }
            let mut err = PreprocessError::include_not_found(
                self.source_display_name(),
                line,
                format!("File not found: {name}"),
            );
            if let Some(text) = self.source_line_text(line) {
                err = err.with_source_line(text);
            }
            return self.report(err);
        }

        let mut searched = String::new();
        if quoted {
            if let Some(parent) = parent {
                let pfile = self.filesystem.get_file(parent);
                if let Some(pdir) = pfile.parent_file() {
                    searched.push_str(&format!(" .({})", pdir.path()));
                    let candidate = pdir.child_file(name);
                    if self.try_include(&candidate)? {
                        return Ok(());
                    }
                }
            }
            let quote_path = self.quote_include_path.clone();
            for dir in &quote_path {
                searched.push_str(&format!(" {dir}"));
            }
            if self.include_from_path(&quote_path, name)? {
                return Ok(());
            }
        } else if let Some(idx) = name.find('/') {
            let framework = &name[..idx];
            let header = &name[idx + 1..];
            let header_path = format!("{framework}.framework/Headers/{header}");
            let frameworks = self.frameworks_path.clone();
            if self.include_from_path(&frameworks, &header_path)? {
                return Ok(());
            }
        }

        let mut system_path = self.system_include_path.clone();
        if next {
            // Resume the search after the directory the current file came
            // from; with no such directory the whole path is searched.
            let current_dir = parent
                .map(|p| self.filesystem.get_file(p))
                .and_then(|f| f.parent_file())
                .map(|d| d.path().to_string());
            if let Some(current_dir) = current_dir
                && let Some(pos) = system_path.iter().position(|d| *d == current_dir)
            {
                system_path.drain(..=pos);
            }
        }
        for dir in &system_path {
            searched.push_str(&format!(" {dir}"));
        }
        if self.include_from_path(&system_path, name)? {
            return Ok(());
        }

        let mut err = PreprocessError::include_not_found(
            self.source_display_name(),
            line,
            format!("File not found: {name} in{searched}"),
        );
        if let Some(text) = self.source_line_text(line) {
            err = err.with_source_line(text);
        }
        self.report(err)
    }

    /* Directives */

    /// Handle one directive after its introducing `#`. Returns the token the
    /// driver should hand out (usually the directive's newline, or the `#`
    /// when the directive is preserved for the output), or None when the
    /// driver should just continue pulling.
    fn directive(&mut self, hash: Token) -> Result<Option<Token>, PreprocessError> {
        let tok = self.source_token_nonwhite()?;
        match tok.kind {
            TokenKind::NewLine => return Ok(None), // Null directive: some code has '#' alone.
            TokenKind::Identifier => {}
            _ => {
                self.error(
                    tok.line,
                    tok.column,
                    format!("preprocessor directive not a word: '{}'", tok.text),
                )?;
                return Ok(Some(self.skip_line(false)?));
            }
        }
        let Some(directive) = Directive::from_text(&tok.text) else {
            self.error(
                tok.line,
                tok.column,
                format!("unknown preprocessor directive '{}'", tok.text),
            )?;
            return Ok(Some(self.skip_line(false)?));
        };

        match directive {
            Directive::Define => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                self.define_directive(hash, tok).map(Some)
            }
            Directive::Undef => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                self.undef_directive(hash, tok).map(Some)
            }
            Directive::Include => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                self.include_directive(hash, tok, false).map(Some)
            }
            Directive::IncludeNext => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                if !self.features.contains(&Feature::IncludeNext) {
                    self.error(
                        tok.line,
                        tok.column,
                        "directive include_next not enabled".to_string(),
                    )?;
                    return Ok(Some(self.skip_line(false)?));
                }
                self.include_directive(hash, tok, true).map(Some)
            }
            Directive::Error | Directive::Warning => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                self.error_directive(tok, directive == Directive::Error)?;
                Ok(None)
            }
            Directive::If => self.if_directive(hash, tok).map(Some),
            Directive::Elif => self.elif_directive(hash, tok).map(Some),
            Directive::Else => self.else_directive(hash, tok).map(Some),
            Directive::Ifdef => self.ifdef_directive(hash, tok, true).map(Some),
            Directive::Ifndef => self.ifdef_directive(hash, tok, false).map(Some),
            Directive::Endif => self.endif_directive(hash, tok).map(Some),
            Directive::Line => {
                // Accepted and discarded; line counters do not change.
                Ok(Some(self.skip_line(false)?))
            }
            Directive::Pragma => {
                if !self.is_active() {
                    return Ok(Some(self.skip_line(false)?));
                }
                self.pragma_directive().map(Some)
            }
        }
    }

    /// Assemble the replay token list for a directive preserved in the
    /// output: the captured line plus its newline. The introducing `#` is
    /// returned to the consumer separately.
    fn replay_tokens(line: &[Token], nl: &Token) -> Vec<Token> {
        let mut tokens = line.to_vec();
        if nl.kind == TokenKind::NewLine {
            tokens.push(nl.clone());
        }
        tokens
    }

    /// Build the preserved directive line for a condition the control layer
    /// rewrote: the directive word, a separator, the re-lexed condition.
    fn rewritten_condition(line: &[Token], text: &str, nl: &Token) -> Vec<Token> {
        let mut lexer = Lexer::new(text, None, None);
        let mut lexed = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.kind == TokenKind::Eof {
                break;
            }
            lexed.push(tok);
        }
        let mut tokens: Vec<Token> = Vec::with_capacity(lexed.len() + 3);
        if lexed.first().is_some_and(|t| t.kind == TokenKind::Hash) {
            // The listener returned a whole directive of its own.
            tokens.extend(lexed.into_iter().skip(1));
        } else {
            tokens.push(line[0].clone());
            match line.get(1) {
                Some(t) if t.is_white() => tokens.push(t.clone()),
                _ => tokens.push(Token::space()),
            }
            tokens.extend(lexed);
        }
        if !tokens.last().is_some_and(|t| t.kind == TokenKind::NewLine) && nl.kind == TokenKind::NewLine
        {
            tokens.push(nl.clone());
        }
        tokens
    }

    /// Preserve a declined conditional: consult the listener for a rewritten
    /// condition, stash the final spelling in the state frame, and push the
    /// unprocessed replay.
    fn preserve_conditional(
        &mut self,
        line: Vec<Token>,
        nl: &Token,
        kind: IfKind,
        condition: &[Token],
    ) -> Result<(), PreprocessError> {
        let control = self.control.clone();
        let rewritten = match &control {
            Some(control) => {
                let name = self.source_name();
                control.partially_processed_condition(condition, name.as_deref(), kind, self)
            }
            None => None,
        };
        let tokens = match rewritten {
            None => Self::replay_tokens(&line, nl),
            Some(text) => Self::rewritten_condition(&line, &text, nl),
        };
        if let Some(state) = self.states.last_mut() {
            state.tokens = tokens.clone();
        }
        self.push_source(Source::unprocessed(tokens), true);
        Ok(())
    }

    fn if_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        self.push_state(line.clone());
        if !self.is_active() {
            return Ok(nl);
        }

        let process = match &self.control {
            Some(control) => control.process_if(&line, self.source_name().as_deref(), IfKind::If),
            None => true,
        };
        if let Some(state) = self.states.last_mut() {
            state.processed = process;
        }

        if !process {
            if let Some(state) = self.states.last_mut() {
                state.active = true;
            }
            self.preserve_conditional(line.clone(), &nl, IfKind::If, &line[1..])?;
            return Ok(hash);
        }

        let value = self.evaluate_condition(&line[1..])?;
        if let Some(state) = self.states.last_mut() {
            state.active = value != 0;
        }
        Ok(nl)
    }

    fn elif_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        if self.states.len() == 1 {
            self.error(line[0].line, line[0].column, "#elif without #if".to_string())?;
            return Ok(nl);
        }
        if let Some(state) = self.states.last_mut() {
            state.tokens = line.clone();
        }

        let state = self.states.last().cloned().unwrap_or_else(State::sentinel);
        if state.saw_else {
            self.error(line[0].line, line[0].column, "#elif after #else".to_string())?;
            return Ok(nl);
        }
        if !state.parent_active {
            // Nested in a skipped group.
            return Ok(nl);
        }
        if state.processed && state.active {
            // A previous branch fired; nothing further in this group may.
            if let Some(state) = self.states.last_mut() {
                state.parent_active = false;
                state.active = false;
            }
            return Ok(nl);
        }
        if !state.processed {
            self.preserve_conditional(line.clone(), &nl, IfKind::Elif, &line[1..])?;
            return Ok(hash);
        }

        let value = self.evaluate_condition(&line[1..])?;
        if let Some(state) = self.states.last_mut() {
            state.active = value != 0;
        }
        Ok(nl)
    }

    fn else_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        if self.states.len() == 1 {
            self.error(line[0].line, line[0].column, "#else without #if".to_string())?;
            return Ok(nl);
        }
        let saw_else = self.states.last().is_some_and(|s| s.saw_else);
        if saw_else {
            self.error(line[0].line, line[0].column, "#else after #else".to_string())?;
            return Ok(nl);
        }

        let mut process = true;
        if let Some(state) = self.states.last_mut() {
            state.saw_else = true;
            process = state.processed;
            state.active = !process || !state.active;
        }
        if !process {
            let tokens = Self::replay_tokens(&line, &nl);
            self.push_source(Source::unprocessed(tokens), true);
            return Ok(hash);
        }
        if self.warnings.contains(&Warning::EndifLabels) {
            self.warn_extra(&line[1..])?;
        }
        Ok(nl)
    }

    fn ifdef_directive(
        &mut self,
        hash: Token,
        word: Token,
        positive: bool,
    ) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        self.push_state(line.clone());
        if !self.is_active() {
            return Ok(nl);
        }

        let Some(name_tok) = line[1..].iter().find(|t| !t.is_white()).cloned() else {
            self.error(line[0].line, line[0].column, "expected identifier".to_string())?;
            return Ok(nl);
        };
        if name_tok.kind != TokenKind::Identifier {
            self.error(
                name_tok.line,
                name_tok.column,
                format!("expected identifier, not '{}'", name_tok.text),
            )?;
            return Ok(nl);
        }

        let exists = self.macros.contains_key(&name_tok.text);
        let kind = if positive { IfKind::Ifdef } else { IfKind::Ifndef };
        let process = match &self.control {
            Some(control) => control.process_if(&line, self.source_name().as_deref(), kind),
            None => true,
        };
        if let Some(state) = self.states.last_mut() {
            state.processed = process;
            state.active = !process || (exists == positive);
        }
        if !process {
            let condition = vec![name_tok];
            self.preserve_conditional(line.clone(), &nl, kind, &condition)?;
            return Ok(hash);
        }
        Ok(nl)
    }

    fn endif_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        let frame = self.states.pop().unwrap_or_else(State::sentinel);
        if self.states.is_empty() {
            // Never pop the sentinel; complain and put it back.
            self.states.push(frame);
            self.error(line[0].line, line[0].column, "#endif without #if".to_string())?;
            return Ok(nl);
        }
        if !frame.processed {
            let tokens = Self::replay_tokens(&line, &nl);
            self.push_source(Source::unprocessed(tokens), true);
            return Ok(hash);
        }
        if self.warnings.contains(&Warning::EndifLabels) {
            self.warn_extra(&line[1..])?;
        }
        Ok(nl)
    }

    fn warn_extra(&mut self, rest: &[Token]) -> Result<(), PreprocessError> {
        if let Some(tok) = rest.iter().find(|t| !t.is_white()) {
            self.warning(
                tok.line,
                tok.column,
                format!("unexpected token '{}' at end of directive", tok.text),
            )?;
        }
        Ok(())
    }

    fn define_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        let mut pos = 1;
        while line.get(pos).is_some_and(Token::is_white) {
            pos += 1;
        }
        let Some(name_tok) = line.get(pos).cloned() else {
            self.error(line[0].line, line[0].column, "expected identifier".to_string())?;
            return Ok(nl);
        };
        if name_tok.kind != TokenKind::Identifier {
            self.error(
                name_tok.line,
                name_tok.column,
                format!("expected identifier, not '{}'", name_tok.text),
            )?;
            return Ok(nl);
        }
        if name_tok.text == "defined" {
            self.error(
                name_tok.line,
                name_tok.column,
                "cannot redefine name 'defined'".to_string(),
            )?;
            return Ok(nl);
        }
        pos += 1;

        let mut m = Macro::with_source(name_tok.text.clone(), self.source_name());

        // A paren immediately after the name makes the macro function-like.
        if line.get(pos).is_some_and(|t| t.kind == TokenKind::LParen) {
            pos += 1;
            match self.parse_macro_params(&line, &mut pos, &mut m)? {
                Ok(()) => {}
                Err(()) => return Ok(nl),
            }
        }

        self.parse_macro_body(&line[pos..], &mut m);

        if self.features.contains(&Feature::Debug) {
            debug!("pp: defined macro {}", m);
        }

        let process = match &self.control {
            Some(control) => control.add_macro(&m, self.source_name().as_deref()),
            None => true,
        };
        if process {
            if let Some(listener) = &self.listener {
                listener.handle_define(&m, self.source_name().as_deref());
            }
            self.macros.insert(m.name().to_string(), m);
            Ok(nl)
        } else {
            let tokens = Self::replay_tokens(&line, &nl);
            self.push_source(Source::unprocessed(tokens), true);
            Ok(hash)
        }
    }

    /// Parse a function-like parameter list from the captured line. The
    /// outer Result is a hard failure; the inner one reports a diagnosed
    /// parse error after which the directive is abandoned.
    #[allow(clippy::result_unit_err)]
    fn parse_macro_params(
        &mut self,
        line: &[Token],
        pos: &mut usize,
        m: &mut Macro,
    ) -> Result<Result<(), ()>, PreprocessError> {
        let mut params: Vec<String> = Vec::new();
        let mut variadic = false;

        let next_nonwhite = |pos: &mut usize| -> Option<Token> {
            while line.get(*pos).is_some_and(Token::is_white) {
                *pos += 1;
            }
            let tok = line.get(*pos).cloned();
            *pos += 1;
            tok
        };

        let first = next_nonwhite(pos);
        if first.as_ref().is_some_and(|t| t.kind == TokenKind::RParen) {
            m.set_params(params);
            return Ok(Ok(()));
        }
        let mut tok = first;
        loop {
            match &tok {
                None => {
                    let at = line[0].clone();
                    self.error(at.line, at.column, "unterminated macro parameter list".to_string())?;
                    return Ok(Err(()));
                }
                Some(t) if t.kind == TokenKind::Identifier => params.push(t.text.clone()),
                Some(t) if t.kind == TokenKind::Ellipsis => {
                    params.push("__VA_ARGS__".to_string());
                    variadic = true;
                    match next_nonwhite(pos) {
                        Some(t) if t.kind == TokenKind::RParen => break,
                        other => {
                            let at = other.unwrap_or_else(|| line[0].clone());
                            self.error(at.line, at.column, "ellipsis must be on last argument".to_string())?;
                            return Ok(Err(()));
                        }
                    }
                }
                Some(t) => {
                    self.error(
                        t.line,
                        t.column,
                        format!("error in macro parameters: '{}'", t.text),
                    )?;
                    return Ok(Err(()));
                }
            }
            match next_nonwhite(pos) {
                Some(t) if t.kind == TokenKind::Comma => {}
                Some(t) if t.kind == TokenKind::Ellipsis => {
                    // GNU named variadic: the last named parameter takes the
                    // trailing arguments.
                    variadic = true;
                    match next_nonwhite(pos) {
                        Some(t) if t.kind == TokenKind::RParen => break,
                        other => {
                            let at = other.unwrap_or(t);
                            self.error(at.line, at.column, "ellipsis must be on last argument".to_string())?;
                            return Ok(Err(()));
                        }
                    }
                }
                Some(t) if t.kind == TokenKind::RParen => break,
                None => {
                    let at = line[0].clone();
                    self.error(at.line, at.column, "unterminated macro parameters".to_string())?;
                    return Ok(Err(()));
                }
                Some(t) => {
                    self.error(
                        t.line,
                        t.column,
                        format!("bad token in macro parameters: '{}'", t.text),
                    )?;
                    return Ok(Err(()));
                }
            }
            tok = next_nonwhite(pos);
        }

        m.set_params(params);
        m.set_variadic(variadic);
        Ok(Ok(()))
    }

    /// Record the replacement list, marking parameter references,
    /// stringifications and pastes, with leading/trailing space dropped and
    /// inner runs collapsed.
    fn parse_macro_body(&self, body: &[Token], m: &mut Macro) {
        let params: Vec<String> = m.params().map(<[String]>::to_vec).unwrap_or_default();
        let index_of = |text: &str| params.iter().position(|p| p == text);

        let mut space = false;
        let mut paste = false;
        // No space at the start of the replacement list.
        let mut i = 0;
        while body.get(i).is_some_and(Token::is_white) {
            i += 1;
        }
        while i < body.len() {
            let tok = &body[i];
            match tok.kind {
                TokenKind::Whitespace | TokenKind::CComment | TokenKind::CppComment => {
                    if !paste {
                        space = true;
                    }
                }
                TokenKind::Paste => {
                    space = false;
                    paste = true;
                    m.add_token(Token::new(TokenKind::MacroPaste, tok.line, tok.column, "##"));
                }
                TokenKind::Hash => {
                    if space {
                        m.add_token(Token::space());
                    }
                    space = false;
                    let mut j = i + 1;
                    while body.get(j).is_some_and(Token::is_white) {
                        j += 1;
                    }
                    if let Some(la) = body.get(j)
                        && la.kind == TokenKind::Identifier
                        && let Some(idx) = index_of(&la.text)
                    {
                        m.add_token(Token::with_value(
                            TokenKind::MacroString,
                            la.line,
                            la.column,
                            format!("#{}", la.text),
                            TokenValue::Arg(idx),
                        ));
                        i = j;
                    } else {
                        m.add_token(tok.clone());
                    }
                }
                TokenKind::Identifier => {
                    if space {
                        m.add_token(Token::space());
                    }
                    space = false;
                    paste = false;
                    match index_of(&tok.text) {
                        Some(idx) => m.add_token(Token::with_value(
                            TokenKind::MacroArg,
                            tok.line,
                            tok.column,
                            tok.text.clone(),
                            TokenValue::Arg(idx),
                        )),
                        None => m.add_token(tok.clone()),
                    }
                }
                _ => {
                    if space {
                        m.add_token(Token::space());
                    }
                    space = false;
                    paste = false;
                    m.add_token(tok.clone());
                }
            }
            i += 1;
        }
    }

    fn undef_directive(&mut self, hash: Token, word: Token) -> Result<Token, PreprocessError> {
        let (line, nl) = self.capture_line(word)?;
        let Some(name_tok) = line[1..].iter().find(|t| !t.is_white()).cloned() else {
            self.error(line[0].line, line[0].column, "expected identifier".to_string())?;
            return Ok(nl);
        };
        if name_tok.kind != TokenKind::Identifier {
            self.error(
                name_tok.line,
                name_tok.column,
                format!("expected identifier, not '{}'", name_tok.text),
            )?;
            return Ok(nl);
        }

        let m = self
            .macros
            .get(&name_tok.text)
            .cloned()
            .unwrap_or_else(|| Macro::new(name_tok.text.clone()));
        let existed = self.macros.contains_key(&name_tok.text);

        let process = match &self.control {
            Some(control) => control.remove_macro(&m, self.source_name().as_deref()),
            None => true,
        };
        if process {
            if let Some(listener) = &self.listener {
                listener.handle_undefine(&m, self.source_name().as_deref());
            }
            if existed {
                self.macros.remove(&name_tok.text);
            }
            Ok(nl)
        } else {
            let tokens = Self::replay_tokens(&line, &nl);
            self.push_source(Source::unprocessed(tokens), true);
            Ok(hash)
        }
    }

    fn include_directive(
        &mut self,
        hash: Token,
        word: Token,
        next: bool,
    ) -> Result<Token, PreprocessError> {
        if let Some(src) = self.sources.last_mut() {
            src.set_include_mode(true);
        }
        let captured = self.capture_line(word);
        if let Some(src) = self.sources.last_mut() {
            src.set_include_mode(false);
        }
        let (line, nl) = captured?;

        let Some(first) = line[1..].iter().find(|t| !t.is_white()).cloned() else {
            self.error(line[0].line, line[0].column, "expected string or header".to_string())?;
            return Ok(nl);
        };

        // A macro can spell the header; expand the captured line to find it.
        let resolved: Vec<Token> = if first.kind == TokenKind::Identifier {
            self.expand_token_list(line[1..].to_vec())?
        } else {
            line[1..].to_vec()
        };

        let Some((name, quoted)) = Self::header_name(&resolved) else {
            self.error(
                first.line,
                first.column,
                format!("expected string or header, not '{}'", first.text),
            )?;
            return Ok(nl);
        };

        let process = match &self.control {
            Some(control) => control.include(
                self.source_name().as_deref(),
                first.line,
                &name,
                quoted,
                next,
            ),
            None => true,
        };
        if !process {
            let tokens = Self::replay_tokens(&line, &nl);
            self.push_source(Source::unprocessed(tokens), true);
            return Ok(hash);
        }

        let from = self.source_name();
        let parent = self.current_path();
        self.do_include(parent.as_deref(), first.line, &name, quoted, next)?;
        if let Some(listener) = &self.listener {
            listener.handle_include(
                &first.text,
                next,
                from.as_deref(),
                self.source_name().as_deref(),
            );
        }

        if self.features.contains(&Feature::Linemarkers) {
            let name = self.source_name();
            return Ok(self.line_token(1, name.as_deref(), " 1"));
        }
        Ok(nl)
    }

    /// Extract the header name from the tokens of an include line: a header
    /// token, adjacent string literals, or a `<`...`>` run reassembled from
    /// a macro expansion.
    fn header_name(tokens: &[Token]) -> Option<(String, bool)> {
        let mut iter = tokens.iter().filter(|t| !t.is_white());
        let first = iter.next()?;
        match first.kind {
            TokenKind::Header => match &first.value {
                TokenValue::Text(name) => Some((name.clone(), false)),
                _ => None,
            },
            TokenKind::String => {
                let mut name = match &first.value {
                    TokenValue::Text(text) => text.clone(),
                    _ => return None,
                };
                for tok in iter {
                    match (&tok.kind, &tok.value) {
                        (TokenKind::String, TokenValue::Text(text)) => name.push_str(text),
                        (TokenKind::NewLine | TokenKind::Eof, _) => break,
                        _ => break,
                    }
                }
                Some((name, true))
            }
            TokenKind::Lt => {
                let mut name = String::new();
                for tok in iter {
                    if tok.kind == TokenKind::Gt {
                        return Some((name, false));
                    }
                    name.push_str(&tok.text);
                }
                None
            }
            _ => None,
        }
    }

    fn error_directive(&mut self, word: Token, is_error: bool) -> Result<(), PreprocessError> {
        let mut buf = format!("#{} ", word.text);
        let mut tok = self.source_token_nonwhite()?;
        loop {
            match tok.kind {
                TokenKind::NewLine | TokenKind::Eof => break,
                _ => buf.push_str(&tok.text),
            }
            tok = self.source_token()?;
        }
        if is_error {
            self.error(word.line, word.column, buf)
        } else {
            self.warning(word.line, word.column, buf)
        }
    }

    fn pragma_directive(&mut self) -> Result<Token, PreprocessError> {
        let name = loop {
            let tok = self.source_token()?;
            match tok.kind {
                TokenKind::Eof => {
                    self.warning(tok.line, tok.column, "end of file in #pragma".to_string())?;
                    return Ok(tok);
                }
                TokenKind::NewLine => {
                    self.warning(tok.line, tok.column, "empty #pragma".to_string())?;
                    return Ok(tok);
                }
                TokenKind::Whitespace | TokenKind::CComment | TokenKind::CppComment => {}
                TokenKind::Identifier => break tok,
                _ => {
                    self.warning(
                        tok.line,
                        tok.column,
                        format!("illegal #pragma '{}'", tok.text),
                    )?;
                    return self.skip_line(false);
                }
            }
        };

        let nl = loop {
            let tok = self.source_token()?;
            match tok.kind {
                TokenKind::Eof | TokenKind::NewLine => break tok,
                _ => {}
            }
        };

        if self.features.contains(&Feature::PragmaOnce) && name.text == "once" {
            self.pragma_once()?;
        } else {
            self.warning(name.line, name.column, format!("unknown #pragma: {}", name.text))?;
        }
        Ok(nl)
    }

    /// The second sighting of a path pops its source on the spot, so the
    /// repeat inclusion contributes nothing further.
    fn pragma_once(&mut self) -> Result<(), PreprocessError> {
        let Some(path) = self.current_path() else {
            return Ok(());
        };
        if !self.once_seen.insert(path) {
            if let Some(mark) = self.pop_source(true)? {
                self.push_source(Source::fixed(vec![mark]), true);
            }
        }
        Ok(())
    }

    /* The main loop */

    fn next_token(&mut self) -> Result<Token, PreprocessError> {
        loop {
            let tok;
            if !self.is_active() {
                // Quiet mode: whitespace and line structure survive, the
                // rest of the branch is discarded. Directives still steer
                // the state machine.
                if let Some(src) = self.sources.last_mut() {
                    src.set_quiet(true);
                }
                let pulled = self.source_token();
                if let Some(src) = self.sources.last_mut() {
                    src.set_quiet(false);
                }
                tok = pulled?;
                match tok.kind {
                    TokenKind::Hash if self.token_line_start => {}
                    TokenKind::NewLine | TokenKind::Eof => {}
                    TokenKind::Whitespace => return Ok(tok),
                    TokenKind::CComment | TokenKind::CppComment => {
                        return Ok(self.comment_token(tok));
                    }
                    _ => {
                        return self.skip_line(false);
                    }
                }
            } else {
                tok = self.source_token()?;
                if self.sources.last().is_some_and(Source::is_unprocessed) {
                    // Preserved directives replay untouched.
                    return Ok(tok);
                }
            }

            match tok.kind {
                TokenKind::Eof => return Ok(tok),
                TokenKind::Whitespace | TokenKind::NewLine => return Ok(tok),
                TokenKind::CComment | TokenKind::CppComment => {
                    return Ok(self.comment_token(tok));
                }
                TokenKind::Identifier => {
                    let Some(m) = self.macros.get(&tok.text) else {
                        return Ok(tok);
                    };
                    if self.is_expanding(&tok.text) {
                        return Ok(tok);
                    }
                    let m = m.clone();
                    if self.control_allows_expansion(&m, &tok, false)
                        && self.expand_macro_use(&m, &tok)?
                    {
                        continue;
                    }
                    return Ok(tok);
                }
                TokenKind::LineMarker => {
                    if self.features.contains(&Feature::Linemarkers) {
                        return Ok(tok);
                    }
                }
                TokenKind::Invalid => {
                    if self.features.contains(&Feature::CSyntax) {
                        let msg = match &tok.value {
                            TokenValue::Text(msg) => msg.clone(),
                            _ => "invalid token".to_string(),
                        };
                        let mut err = PreprocessError::lex(self.source_display_name(), tok.line, msg)
                            .with_column(tok.column);
                        if let Some(text) = self.source_line_text(tok.line) {
                            err = err.with_source_line(text);
                        }
                        self.report(err)?;
                    }
                    return Ok(tok);
                }
                TokenKind::Hash => {
                    if self.token_line_start {
                        if let Some(out) = self.directive(tok)? {
                            return Ok(out);
                        }
                        continue;
                    }
                    return Ok(tok);
                }
                _ => return Ok(tok),
            }
        }
    }

    /// Returns the next preprocessed token; EOF marks the end of all input.
    ///
    /// # Errors
    /// Without a diagnostic listener installed, the first error is returned
    /// here and the stream should be considered dead. With one, errors are
    /// routed to it and the stream recovers at the next line.
    pub fn token(&mut self) -> Result<Token, PreprocessError> {
        let tok = self.next_token()?;
        if self.features.contains(&Feature::Debug) {
            debug!("pp: returning {:?} '{}'", tok.kind, tok.text);
        }
        Ok(tok)
    }
}
