use std::collections::HashSet;

/// Optional engine behaviors, off by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Emit `#line N "file" F` tokens at source transitions.
    Linemarkers,
    /// Honor `#pragma once`.
    PragmaOnce,
    /// Allow the `#include_next` directive.
    IncludeNext,
    /// Treat characters no token rule matches as errors instead of
    /// passing them through as invalid tokens.
    CSyntax,
    /// Keep comments in active regions instead of collapsing them to
    /// whitespace.
    KeepComments,
    /// Keep comments everywhere, inactive conditional branches included.
    KeepAllComments,
    /// Log every returned token and macro definition.
    Debug,
}

/// Optional warning classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Warning {
    /// Escalate every warning to an error.
    Error,
    /// Warn when an undefined identifier is evaluated in a conditional.
    Undef,
    /// Warn about stray text after `#else` and `#endif`.
    EndifLabels,
}

/// Configuration applied to a preprocessor at construction.
#[derive(Clone, Debug, Default)]
pub struct PreprocessorConfig {
    /// Enabled features.
    pub features: HashSet<Feature>,
    /// Enabled warning classes.
    pub warnings: HashSet<Warning>,
    /// Directories searched for quoted includes after the including file's
    /// own directory (`-iquote`).
    pub quote_include_path: Vec<String>,
    /// Directories searched for system includes (`-I`).
    pub system_include_path: Vec<String>,
    /// Directories searched for `<Framework/Header.h>` lookups (`-F`).
    pub frameworks_path: Vec<String>,
    /// Macros defined before the first token, as `(name, value)` pairs.
    pub defines: Vec<(String, String)>,
    /// Macro names removed after `defines` are applied.
    pub undefs: Vec<String>,
}

impl PreprocessorConfig {
    /// An empty configuration: no features, no warnings, no search paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a feature.
    #[must_use]
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    /// Enable a warning class.
    #[must_use]
    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.insert(warning);
        self
    }

    /// Define a macro before processing starts.
    #[must_use]
    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    /// Append a quoted-include search directory.
    #[must_use]
    pub fn with_quote_include_dir(mut self, dir: impl Into<String>) -> Self {
        self.quote_include_path.push(dir.into());
        self
    }

    /// Append a system-include search directory.
    #[must_use]
    pub fn with_system_include_dir(mut self, dir: impl Into<String>) -> Self {
        self.system_include_path.push(dir.into());
        self
    }

    /// Append a frameworks search directory.
    #[must_use]
    pub fn with_frameworks_dir(mut self, dir: impl Into<String>) -> Self {
        self.frameworks_path.push(dir.into());
        self
    }
}
