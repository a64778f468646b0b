use std::fmt;

use crate::token::Token;

/// The dynamic sentinels, recognized by tag rather than by name so a user
/// `#define` of the same spelling shadows them cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// `__LINE__`
    Line,
    /// `__FILE__`
    File,
    /// `__COUNTER__`
    Counter,
    /// `__DATE__`
    Date,
    /// `__TIME__`
    Time,
}

/// A preprocessor macro definition.
///
/// The replacement list is a token sequence in which parameter references
/// appear as `MacroArg` tokens, stringifications as `MacroString` and `##`
/// as `MacroPaste`.
#[derive(Clone, Debug)]
pub struct Macro {
    pub(crate) name: String,
    pub(crate) source_name: Option<String>,
    pub(crate) params: Option<Vec<String>>,
    pub(crate) variadic: bool,
    pub(crate) tokens: Vec<Token>,
    pub(crate) builtin: Option<Builtin>,
}

impl Macro {
    /// Create an empty object-like macro.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Macro {
            name: name.into(),
            source_name: None,
            params: None,
            variadic: false,
            tokens: Vec::new(),
            builtin: None,
        }
    }

    /// Create a macro recording the source it was defined in.
    #[must_use]
    pub fn with_source(name: impl Into<String>, source_name: Option<String>) -> Self {
        let mut m = Macro::new(name);
        m.source_name = source_name;
        m
    }

    pub(crate) fn sentinel(name: &str, builtin: Builtin) -> Self {
        let mut m = Macro::new(name);
        m.source_name = Some("<internal-data>".to_string());
        m.builtin = Some(builtin);
        m
    }

    /// The macro name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the source the definition came from, if any.
    #[must_use]
    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    /// True for a function-like macro, even one with zero parameters.
    #[must_use]
    pub fn is_function_like(&self) -> bool {
        self.params.is_some()
    }

    /// True when the parameter list ends in `...`.
    #[must_use]
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// The declared parameter count; for a variadic macro this includes the
    /// `__VA_ARGS__` slot.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.params.as_ref().map_or(0, Vec::len)
    }

    /// The declared parameter names.
    #[must_use]
    pub fn params(&self) -> Option<&[String]> {
        self.params.as_deref()
    }

    /// The replacement list.
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Which dynamic sentinel this entry is, if any.
    #[must_use]
    pub fn builtin(&self) -> Option<Builtin> {
        self.builtin
    }

    pub(crate) fn set_params(&mut self, params: Vec<String>) {
        self.params = Some(params);
    }

    pub(crate) fn set_variadic(&mut self, variadic: bool) {
        self.variadic = variadic;
    }

    pub(crate) fn add_token(&mut self, tok: Token) {
        self.tokens.push(tok);
    }

    /// The replacement list spelled back out, parameter names included.
    /// `MacroString` tokens carry `#name` as their text and `MacroPaste`
    /// carries `##`, so plain concatenation reproduces the definition.
    #[must_use]
    pub fn expansion_text(&self) -> String {
        self.tokens.iter().map(|t| t.text.as_str()).collect()
    }
}

impl fmt::Display for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(params) = &self.params {
            write!(f, "({}", params.join(", "))?;
            if self.variadic {
                f.write_str("...")?;
            }
            f.write_str(")")?;
        }
        write!(f, " = {}", self.expansion_text())
    }
}
