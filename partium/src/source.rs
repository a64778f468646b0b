//! Token sources and the variants the driver stacks.
//!
//! A source is anything the driver can pull tokens from: a lexer over a file
//! or string, a fixed replay of pre-built tokens, a macro expansion, or an
//! unprocessed replay whose tokens bypass directive handling entirely. The
//! driver owns the stack; each pushed source remembers whether it should pop
//! itself at EOF.

use crate::lexer::{LexDiag, Lexer};
use crate::token::Token;

/// A pre-built token list replayed one token at a time.
#[derive(Debug)]
pub(crate) struct FixedTokens {
    tokens: Vec<Token>,
    idx: usize,
}

impl FixedTokens {
    fn new(tokens: Vec<Token>) -> Self {
        FixedTokens { tokens, idx: 0 }
    }

    fn next_token(&mut self) -> Token {
        match self.tokens.get(self.idx) {
            Some(tok) => {
                self.idx += 1;
                tok.clone()
            }
            None => Token::eof(),
        }
    }
}

pub(crate) enum SourceKind {
    /// A lexer over the contents of an included or top-level file.
    File(Lexer),
    /// A lexer over in-memory text.
    String(Lexer),
    /// Replay of a fixed token list (arguments, synthetic tokens).
    Fixed(FixedTokens),
    /// Replay driving one macro expansion; carries the macro identity for
    /// the self-recursion guard.
    Macro { name: String, replay: FixedTokens },
    /// Replay whose tokens the driver must pass through untouched, used when
    /// the control layer declines to process a directive.
    Unprocessed(FixedTokens),
}

pub(crate) struct Source {
    pub kind: SourceKind,
    pub autopop: bool,
}

impl Source {
    pub fn file(contents: &str, name: impl Into<String>, path: impl Into<String>) -> Self {
        let name = name.into();
        let path = path.into();
        Source {
            kind: SourceKind::File(Lexer::new(contents, Some(name), Some(path))),
            autopop: false,
        }
    }

    pub fn string(text: &str) -> Self {
        Source {
            kind: SourceKind::String(Lexer::new(text, None, None)),
            autopop: false,
        }
    }

    pub fn fixed(tokens: Vec<Token>) -> Self {
        Source {
            kind: SourceKind::Fixed(FixedTokens::new(tokens)),
            autopop: false,
        }
    }

    pub fn unprocessed(tokens: Vec<Token>) -> Self {
        Source {
            kind: SourceKind::Unprocessed(FixedTokens::new(tokens)),
            autopop: false,
        }
    }

    pub fn macro_expansion(name: impl Into<String>, tokens: Vec<Token>) -> Self {
        Source {
            kind: SourceKind::Macro {
                name: name.into(),
                replay: FixedTokens::new(tokens),
            },
            autopop: false,
        }
    }

    pub fn next_token(&mut self) -> Token {
        match &mut self.kind {
            SourceKind::File(lexer) | SourceKind::String(lexer) => lexer.next_token(),
            SourceKind::Fixed(replay) | SourceKind::Unprocessed(replay) => replay.next_token(),
            SourceKind::Macro { replay, .. } => replay.next_token(),
        }
    }

    /// True when this source is the expansion of the named macro.
    pub fn is_expanding(&self, name: &str) -> bool {
        matches!(&self.kind, SourceKind::Macro { name: n, .. } if n == name)
    }

    pub fn is_unprocessed(&self) -> bool {
        matches!(self.kind, SourceKind::Unprocessed(_))
    }

    fn lexer(&self) -> Option<&Lexer> {
        match &self.kind {
            SourceKind::File(lexer) | SourceKind::String(lexer) => Some(lexer),
            _ => None,
        }
    }

    fn lexer_mut(&mut self) -> Option<&mut Lexer> {
        match &mut self.kind {
            SourceKind::File(lexer) | SourceKind::String(lexer) => Some(lexer),
            _ => None,
        }
    }

    /// The display name, if this source has one of its own.
    pub fn name(&self) -> Option<&str> {
        self.lexer().and_then(Lexer::name)
    }

    /// The filesystem path quoted includes resolve against.
    pub fn path(&self) -> Option<&str> {
        self.lexer().and_then(Lexer::path)
    }

    /// The current line, for lexer-backed sources.
    pub fn line(&self) -> Option<u32> {
        self.lexer().map(Lexer::line)
    }

    /// The text of one physical line, for diagnostic context.
    pub fn line_text(&self, line: u32) -> Option<String> {
        self.lexer().and_then(|l| l.line_text(line))
    }

    /// Whether the source produced any newline, which gates the return
    /// linemarker on pop. Replays never count.
    pub fn is_numbered(&self) -> bool {
        self.lexer().is_some_and(Lexer::is_numbered)
    }

    pub fn set_include_mode(&mut self, on: bool) {
        if let Some(lexer) = self.lexer_mut() {
            lexer.set_include_mode(on);
        }
    }

    pub fn set_quiet(&mut self, on: bool) {
        if let Some(lexer) = self.lexer_mut() {
            lexer.set_quiet(on);
        }
    }

    pub fn take_diagnostics(&mut self) -> Vec<LexDiag> {
        match self.lexer_mut() {
            Some(lexer) => lexer.take_diagnostics(),
            None => Vec::new(),
        }
    }
}
