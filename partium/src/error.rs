use std::fmt;

/// Semantic error kinds that can occur during preprocessing
#[derive(Debug)]
pub enum PreprocessErrorKind {
    /// Lexical error (unterminated literal, stray character, bad constant)
    Lex(String),
    /// Malformed or misplaced preprocessor directive
    Directive(String),
    /// Include file not found; carries a description of the search
    IncludeNotFound(String),
    /// Error in a conditional expression
    Expression(String),
    /// I/O error (e.g., file reading/writing)
    Io(std::io::Error),
    /// Other preprocessing error
    Other(String),
}

/// Errors that can occur during preprocessing, with location information
#[derive(Debug)]
pub struct PreprocessError {
    /// The specific kind of error that occurred
    pub kind: PreprocessErrorKind,
    /// Source name where the error occurred
    pub file: String,
    /// Line number where the error occurred
    pub line: u32,
    /// Optional column number for more precise location
    pub column: Option<u32>,
    /// Optional source line content for context display
    pub source_line: Option<String>,
}

impl PreprocessError {
    /// Create a lexical error
    #[inline]
    pub fn lex(file: String, line: u32, details: String) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::Lex(details),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Create a directive error
    #[inline]
    pub fn directive(file: String, line: u32, details: String) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::Directive(details),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Create an include not found error
    #[inline]
    pub fn include_not_found(file: String, line: u32, searched: String) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::IncludeNotFound(searched),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Create a conditional-expression error
    #[inline]
    pub fn expression(file: String, line: u32, details: String) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::Expression(details),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Create an I/O error
    #[inline]
    pub fn io_error(file: String, line: u32, error: std::io::Error) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::Io(error),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Create a generic other error
    #[inline]
    pub fn other(file: String, line: u32, message: String) -> Self {
        PreprocessError {
            kind: PreprocessErrorKind::Other(message),
            file,
            line,
            column: None,
            source_line: None,
        }
    }

    /// Set column information for more precise error location
    #[must_use]
    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    /// Set source line for context display
    #[must_use]
    pub fn with_source_line(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    /// The bare message, without the location prefix
    #[must_use]
    pub fn message(&self) -> String {
        match &self.kind {
            PreprocessErrorKind::Lex(details) => details.clone(),
            PreprocessErrorKind::Directive(details) => {
                format!("invalid directive: {}", details)
            }
            PreprocessErrorKind::IncludeNotFound(searched) => {
                format!("include not found: {}", searched)
            }
            PreprocessErrorKind::Expression(details) => {
                format!("error in expression: {}", details)
            }
            PreprocessErrorKind::Io(err) => {
                format!("I/O error: {}", err)
            }
            PreprocessErrorKind::Other(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();

        let loc = if let Some(col) = self.column {
            format!("{}:{}:{}", self.file, self.line, col)
        } else {
            format!("{}:{}", self.file, self.line)
        };
        write!(f, "{}: {}", loc, message)?;

        // Columns are 0-based, so the indent is the column itself.
        if let (Some(col), Some(source_line)) = (self.column, &self.source_line) {
            write!(f, "\n{}\n", source_line)?;
            let indent = " ".repeat(col as usize);
            write!(f, "{}^", indent)?;
        }

        Ok(())
    }
}

impl std::error::Error for PreprocessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PreprocessErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PreprocessError {
    fn from(err: std::io::Error) -> Self {
        // I/O failures with no better location get a synthetic one
        PreprocessError::io_error("<internal>".to_string(), 0, err)
    }
}
