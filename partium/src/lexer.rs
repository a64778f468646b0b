//! The hand-written DFA that turns source text into [`Token`]s.
//!
//! The lexer owns the character buffer of one file or string. Trigraphs and
//! backslash-newline splices are resolved below the token layer, so every
//! rule here sees logical characters. Diagnostics are buffered on the lexer
//! and drained by the driver after each pull; the lexer itself never aborts.

use crate::numeric::NumericValue;
use crate::token::{Token, TokenKind, TokenValue, is_identifier_continue, is_identifier_start};

/// Severity of a buffered lexical diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LexSeverity {
    Warning,
    Error,
}

/// A diagnostic produced while lexing, waiting to be routed by the driver.
#[derive(Clone, Debug)]
pub(crate) struct LexDiag {
    pub line: u32,
    pub column: u32,
    pub severity: LexSeverity,
    pub message: String,
    pub source_line: Option<String>,
}

pub(crate) struct Lexer {
    name: Option<String>,
    path: Option<String>,
    chars: Vec<char>,
    pos: usize,
    pushback: Vec<(char, u32, u32)>,
    line: u32,
    column: u32,
    include_mode: bool,
    quiet: bool,
    saw_newline: bool,
    diagnostics: Vec<LexDiag>,
}

impl Lexer {
    pub fn new(text: &str, name: Option<String>, path: Option<String>) -> Self {
        Lexer {
            name,
            path,
            chars: text.chars().collect(),
            pos: 0,
            pushback: Vec::with_capacity(3),
            line: 1,
            column: 0,
            include_mode: false,
            quiet: false,
            saw_newline: false,
            diagnostics: Vec::new(),
        }
    }

    /// The display name, also used by `__FILE__` and linemarkers.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The resolution path, used by quoted-include lookup and `#pragma once`.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The line the next token will start on.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// True once any newline has been produced; approximates "this source
    /// contributed lines", which gates return linemarkers.
    pub fn is_numbered(&self) -> bool {
        self.saw_newline
    }

    /// In include mode `<...>` lexes as a header name instead of less-than.
    pub fn set_include_mode(&mut self, on: bool) {
        self.include_mode = on;
    }

    /// Quiet mode drops warnings; inactive conditional branches lex quietly.
    pub fn set_quiet(&mut self, on: bool) {
        self.quiet = on;
    }

    pub fn take_diagnostics(&mut self) -> Vec<LexDiag> {
        std::mem::take(&mut self.diagnostics)
    }

    /// The raw text of one physical line, for diagnostic context.
    pub fn line_text(&self, line: u32) -> Option<String> {
        let mut n = 1u32;
        let mut text = String::new();
        for &c in &self.chars {
            match c {
                '\n' => {
                    if n == line {
                        return Some(text);
                    }
                    n += 1;
                }
                '\r' => {}
                c => {
                    if n == line {
                        text.push(c);
                    }
                }
            }
        }
        (n == line && !text.is_empty()).then_some(text)
    }

    fn diag(&mut self, line: u32, column: u32, severity: LexSeverity, message: String) {
        if self.quiet && severity == LexSeverity::Warning {
            return;
        }
        let source_line = self.line_text(line);
        self.diagnostics.push(LexDiag {
            line,
            column,
            severity,
            message,
            source_line,
        });
    }

    fn warn(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.diag(line, column, LexSeverity::Warning, message.into());
    }

    /// Map the third character of a `??x` trigraph, if it is one.
    fn trigraph(c: char) -> Option<char> {
        match c {
            '(' => Some('['),
            ')' => Some(']'),
            '<' => Some('{'),
            '>' => Some('}'),
            '=' => Some('#'),
            '/' => Some('\\'),
            '\'' => Some('^'),
            '!' => Some('|'),
            '-' => Some('~'),
            _ => None,
        }
    }

    /// One logical character from the raw buffer: trigraphs decoded, CRLF and
    /// lone CR folded to `\n`. Does not resolve splices; `read` does.
    fn read_raw(&mut self) -> Option<(char, u32)> {
        let c = *self.chars.get(self.pos)?;
        if c == '?' && self.chars.get(self.pos + 1) == Some(&'?')
            && let Some(&t) = self.chars.get(self.pos + 2)
            && let Some(mapped) = Self::trigraph(t)
        {
            self.pos += 3;
            return Some((mapped, 3));
        }
        if c == '\r' {
            self.pos += 1;
            if self.chars.get(self.pos) == Some(&'\n') {
                self.pos += 1;
                return Some(('\n', 2));
            }
            return Some(('\n', 1));
        }
        self.pos += 1;
        Some((c, 1))
    }

    /// The next logical character with its position, after splicing.
    fn read(&mut self) -> Option<(char, u32, u32)> {
        if let Some(entry) = self.pushback.pop() {
            return Some(entry);
        }
        loop {
            let line = self.line;
            let column = self.column;
            let (c, width) = self.read_raw()?;
            if c == '\\' {
                // Backslash-newline vanishes, even mid-token.
                let mark = self.pos;
                if let Some(('\n', _)) = self.read_raw() {
                    self.line += 1;
                    self.column = 0;
                    continue;
                }
                self.pos = mark;
            }
            if c == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += width;
            }
            return Some((c, line, column));
        }
    }

    fn unread(&mut self, c: char, line: u32, column: u32) {
        debug_assert!(self.pushback.len() < 3, "pushback overflow");
        self.pushback.push((c, line, column));
    }

    fn peek(&mut self) -> Option<char> {
        let (c, l, col) = self.read()?;
        self.unread(c, l, col);
        Some(c)
    }

    /// If the next character is `want`, consume it and return `then`,
    /// otherwise return `other`.
    fn cond(&mut self, want: char, then: TokenKind, other: TokenKind, text: &mut String) -> TokenKind {
        match self.read() {
            Some((c, _, _)) if c == want => {
                text.push(c);
                then
            }
            Some((c, l, col)) => {
                self.unread(c, l, col);
                other
            }
            None => other,
        }
    }

    /// Pull the next token.
    pub fn next_token(&mut self) -> Token {
        let Some((c, line, column)) = self.read() else {
            return Token::new(TokenKind::Eof, self.line, self.column, "");
        };

        if c == '\n' {
            self.saw_newline = true;
            return Token::new(TokenKind::NewLine, line, column, "\n");
        }
        if c == ' ' || c == '\t' || c == '\u{b}' || c == '\u{c}' {
            return self.whitespace(c, line, column);
        }
        if is_identifier_start(c) {
            return self.identifier(c, line, column);
        }
        if c.is_ascii_digit() {
            return self.number(c, line, column);
        }

        let mut text = String::new();
        text.push(c);
        let kind = match c {
            '.' => {
                if self.peek().is_some_and(|d| d.is_ascii_digit()) {
                    return self.number('.', line, column);
                }
                match self.cond('.', TokenKind::Range, TokenKind::Dot, &mut text) {
                    TokenKind::Range => self.cond('.', TokenKind::Ellipsis, TokenKind::Range, &mut text),
                    k => k,
                }
            }
            '"' => return self.string(line, column),
            '\'' => return self.character(line, column),
            '/' => match self.peek() {
                Some('/') => return self.line_comment(line, column),
                Some('*') => return self.block_comment(line, column),
                _ => self.cond('=', TokenKind::SlashEq, TokenKind::Slash, &mut text),
            },
            '#' => self.cond('#', TokenKind::Paste, TokenKind::Hash, &mut text),
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semi,
            '?' => TokenKind::Question,
            '~' => TokenKind::Tilde,
            '@' => TokenKind::At,
            '`' => TokenKind::Backquote,
            '\\' => TokenKind::Backslash,
            '!' => self.cond('=', TokenKind::BangEq, TokenKind::Bang, &mut text),
            '=' => self.cond('=', TokenKind::EqEq, TokenKind::Assign, &mut text),
            '^' => self.cond('=', TokenKind::CaretEq, TokenKind::Caret, &mut text),
            ':' => self.cond('>', TokenKind::RBracket, TokenKind::Colon, &mut text),
            '+' => match self.cond('+', TokenKind::Inc, TokenKind::Plus, &mut text) {
                TokenKind::Plus => self.cond('=', TokenKind::PlusEq, TokenKind::Plus, &mut text),
                k => k,
            },
            '-' => match self.cond('-', TokenKind::Dec, TokenKind::Minus, &mut text) {
                TokenKind::Minus => match self.cond('=', TokenKind::MinusEq, TokenKind::Minus, &mut text) {
                    TokenKind::Minus => self.cond('>', TokenKind::Arrow, TokenKind::Minus, &mut text),
                    k => k,
                },
                k => k,
            },
            '*' => self.cond('=', TokenKind::StarEq, TokenKind::Star, &mut text),
            '&' => match self.cond('&', TokenKind::AmpAmp, TokenKind::Amp, &mut text) {
                TokenKind::Amp => self.cond('=', TokenKind::AmpEq, TokenKind::Amp, &mut text),
                k => k,
            },
            '|' => match self.cond('|', TokenKind::PipePipe, TokenKind::Pipe, &mut text) {
                TokenKind::Pipe => self.cond('=', TokenKind::PipeEq, TokenKind::Pipe, &mut text),
                k => k,
            },
            '%' => match self.cond('=', TokenKind::PercentEq, TokenKind::Percent, &mut text) {
                TokenKind::Percent => match self.cond('>', TokenKind::RBrace, TokenKind::Percent, &mut text) {
                    TokenKind::Percent => {
                        // %: is a digraph hash, %:%: a digraph paste.
                        match self.cond(':', TokenKind::Hash, TokenKind::Percent, &mut text) {
                            TokenKind::Hash => self.digraph_paste(&mut text),
                            k => k,
                        }
                    }
                    k => k,
                },
                k => k,
            },
            '<' => {
                if self.include_mode {
                    return self.header(line, column);
                }
                match self.cond('<', TokenKind::Lsh, TokenKind::Lt, &mut text) {
                    TokenKind::Lsh => self.cond('=', TokenKind::LshEq, TokenKind::Lsh, &mut text),
                    TokenKind::Lt => match self.cond('=', TokenKind::Le, TokenKind::Lt, &mut text) {
                        TokenKind::Lt => match self.cond('%', TokenKind::LBrace, TokenKind::Lt, &mut text) {
                            TokenKind::Lt => self.cond(':', TokenKind::LBracket, TokenKind::Lt, &mut text),
                            k => k,
                        },
                        k => k,
                    },
                    k => k,
                }
            }
            '>' => match self.cond('>', TokenKind::Rsh, TokenKind::Gt, &mut text) {
                TokenKind::Rsh => self.cond('=', TokenKind::RshEq, TokenKind::Rsh, &mut text),
                TokenKind::Gt => self.cond('=', TokenKind::Ge, TokenKind::Gt, &mut text),
                k => k,
            },
            _ => {
                let message = format!("stray character '{c}' in input");
                return Token::with_value(
                    TokenKind::Invalid,
                    line,
                    column,
                    text,
                    TokenValue::Text(message),
                );
            }
        };
        Token::new(kind, line, column, text)
    }

    /// `%:` already consumed; a following `%:` forms the digraph paste.
    fn digraph_paste(&mut self, text: &mut String) -> TokenKind {
        match self.read() {
            Some(('%', l1, c1)) => match self.read() {
                Some((':', _, _)) => {
                    text.push_str("%:");
                    TokenKind::Paste
                }
                Some((c, l, col)) => {
                    self.unread(c, l, col);
                    self.unread('%', l1, c1);
                    TokenKind::Hash
                }
                None => {
                    self.unread('%', l1, c1);
                    TokenKind::Hash
                }
            },
            Some((c, l, col)) => {
                self.unread(c, l, col);
                TokenKind::Hash
            }
            None => TokenKind::Hash,
        }
    }

    fn whitespace(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some((c, l, col)) = self.read() {
            if c == ' ' || c == '\t' || c == '\u{b}' || c == '\u{c}' {
                text.push(c);
            } else {
                self.unread(c, l, col);
                break;
            }
        }
        Token::new(TokenKind::Whitespace, line, column, text)
    }

    fn identifier(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some((c, l, col)) = self.read() {
            if is_identifier_continue(c) {
                text.push(c);
            } else {
                self.unread(c, l, col);
                break;
            }
        }
        Token::new(TokenKind::Identifier, line, column, text)
    }

    /// Scan a pp-number: digits, letters, `.`, and sign characters directly
    /// after an exponent letter. Interpretation is left to [`NumericValue`].
    fn number(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some((c, l, col)) = self.read() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                let exponent = matches!(c, 'e' | 'E' | 'p' | 'P');
                text.push(c);
                if exponent && matches!(self.peek(), Some('+' | '-')) {
                    let (sign, _, _) = self.read().unwrap_or(('+', l, col));
                    text.push(sign);
                }
            } else {
                self.unread(c, l, col);
                break;
            }
        }
        let (value, warning) = NumericValue::parse(&text);
        if let Some(message) = warning {
            self.warn(line, column, message);
        }
        Token::with_value(TokenKind::Number, line, column, text, TokenValue::Numeric(value))
    }

    /// Decode one escape sequence after the backslash, pushing the raw
    /// spelling onto `text` and returning the cooked character.
    fn escape(&mut self, text: &mut String) -> char {
        let Some((c, line, column)) = self.read() else {
            return '\\';
        };
        text.push(c);
        match c {
            'a' => '\u{7}',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\u{b}',
            '\\' | '\'' | '"' | '?' => c,
            '0'..='7' => {
                let mut value = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.read() {
                        Some((d, _, _)) if d.is_digit(8) => {
                            text.push(d);
                            value = value * 8 + d.to_digit(8).unwrap_or(0);
                        }
                        Some((d, l, col)) => {
                            self.unread(d, l, col);
                            break;
                        }
                        None => break,
                    }
                }
                char::from_u32(value).unwrap_or('\0')
            }
            'x' => {
                let mut value = 0u32;
                while let Some((d, l, col)) = self.read() {
                    if d.is_ascii_hexdigit() {
                        text.push(d);
                        value = value.wrapping_mul(16) + d.to_digit(16).unwrap_or(0);
                    } else {
                        self.unread(d, l, col);
                        break;
                    }
                }
                char::from_u32(value).unwrap_or('\0')
            }
            _ => {
                self.warn(line, column, format!("unknown escape sequence '\\{c}'"));
                c
            }
        }
    }

    fn string(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::from("\"");
        let mut cooked = String::new();
        loop {
            match self.read() {
                None => {
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "end of file in string literal".to_string(),
                    );
                    break;
                }
                Some(('\n', l, col)) => {
                    self.unread('\n', l, col);
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "unterminated string literal".to_string(),
                    );
                    break;
                }
                Some(('"', _, _)) => {
                    text.push('"');
                    break;
                }
                Some(('\\', _, _)) => {
                    text.push('\\');
                    cooked.push(self.escape(&mut text));
                }
                Some((c, _, _)) => {
                    text.push(c);
                    cooked.push(c);
                }
            }
        }
        Token::with_value(TokenKind::String, line, column, text, TokenValue::Text(cooked))
    }

    fn character(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::from("'");
        let mut value = '\0';
        let mut seen = false;
        loop {
            match self.read() {
                None => {
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "end of file in character literal".to_string(),
                    );
                    break;
                }
                Some(('\n', l, col)) => {
                    self.unread('\n', l, col);
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "unterminated character literal".to_string(),
                    );
                    break;
                }
                Some(('\'', _, _)) => {
                    text.push('\'');
                    if !seen {
                        self.warn(line, column, "empty character literal");
                    }
                    break;
                }
                Some(('\\', _, _)) => {
                    text.push('\\');
                    let c = self.escape(&mut text);
                    if !seen {
                        value = c;
                        seen = true;
                    }
                }
                Some((c, _, _)) => {
                    text.push(c);
                    if !seen {
                        value = c;
                        seen = true;
                    }
                }
            }
        }
        Token::with_value(TokenKind::Character, line, column, text, TokenValue::Char(value))
    }

    fn header(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::from("<");
        let mut name = String::new();
        loop {
            match self.read() {
                None => {
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "end of file in header name".to_string(),
                    );
                    break;
                }
                Some(('\n', l, col)) => {
                    self.unread('\n', l, col);
                    self.diag(
                        line,
                        column,
                        LexSeverity::Error,
                        "unterminated header name".to_string(),
                    );
                    break;
                }
                Some(('>', _, _)) => {
                    text.push('>');
                    break;
                }
                Some((c, _, _)) => {
                    text.push(c);
                    name.push(c);
                }
            }
        }
        Token::with_value(TokenKind::Header, line, column, text, TokenValue::Text(name))
    }

    fn line_comment(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::from("/");
        while let Some((c, l, col)) = self.read() {
            if c == '\n' {
                self.unread(c, l, col);
                break;
            }
            text.push(c);
        }
        Token::new(TokenKind::CppComment, line, column, text)
    }

    fn block_comment(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::from("/");
        // The '*' is still pending.
        if let Some((c, _, _)) = self.read() {
            text.push(c);
        }
        let mut star = false;
        loop {
            match self.read() {
                None => {
                    self.warn(line, column, "unterminated comment");
                    break;
                }
                Some((c, _, _)) => {
                    text.push(c);
                    if star && c == '/' {
                        break;
                    }
                    star = c == '*';
                }
            }
        }
        Token::new(TokenKind::CComment, line, column, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(text, None, None);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok);
        }
        out
    }

    fn kinds(text: &str) -> Vec<TokenKind> {
        lex(text).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn identifiers_and_numbers() {
        let toks = lex("foo 123 bar_2");
        assert_eq!(toks[0].kind, TokenKind::Identifier);
        assert_eq!(toks[0].text, "foo");
        assert_eq!(toks[2].kind, TokenKind::Number);
        assert_eq!(toks[4].text, "bar_2");
    }

    #[test]
    fn punctuators() {
        assert_eq!(
            kinds("-> ++ <<= ... ## %="),
            vec![
                TokenKind::Arrow,
                TokenKind::Whitespace,
                TokenKind::Inc,
                TokenKind::Whitespace,
                TokenKind::LshEq,
                TokenKind::Whitespace,
                TokenKind::Ellipsis,
                TokenKind::Whitespace,
                TokenKind::Paste,
                TokenKind::Whitespace,
                TokenKind::PercentEq,
            ]
        );
    }

    #[test]
    fn digraphs_map_to_primary_kinds() {
        assert_eq!(
            kinds("<% %> <: :> %:"),
            vec![
                TokenKind::LBrace,
                TokenKind::Whitespace,
                TokenKind::RBrace,
                TokenKind::Whitespace,
                TokenKind::LBracket,
                TokenKind::Whitespace,
                TokenKind::RBracket,
                TokenKind::Whitespace,
                TokenKind::Hash,
            ]
        );
        // Spelling is preserved.
        assert_eq!(lex("<%")[0].text, "<%");
    }

    #[test]
    fn string_value_is_cooked() {
        let toks = lex(r#""a\nb""#);
        assert_eq!(toks[0].kind, TokenKind::String);
        assert_eq!(toks[0].text, r#""a\nb""#);
        assert_eq!(toks[0].value, TokenValue::Text("a\nb".to_string()));
    }

    #[test]
    fn char_literal_value() {
        let toks = lex(r"'\x41'");
        assert_eq!(toks[0].kind, TokenKind::Character);
        assert_eq!(toks[0].value, TokenValue::Char('A'));
    }

    #[test]
    fn unterminated_string_reports_error() {
        let mut lexer = Lexer::new("\"abc\n", None, None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::String);
        let diags = lexer.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, LexSeverity::Error);
        assert_eq!(diags[0].source_line.as_deref(), Some("\"abc"));
        // The newline is still there for line accounting.
        assert_eq!(lexer.next_token().kind, TokenKind::NewLine);
    }

    #[test]
    fn header_only_in_include_mode() {
        assert_eq!(kinds("<stdio.h>")[0], TokenKind::Lt);
        let mut lexer = Lexer::new("<stdio.h>", None, None);
        lexer.set_include_mode(true);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Header);
        assert_eq!(tok.value, TokenValue::Text("stdio.h".to_string()));
        assert_eq!(tok.text, "<stdio.h>");
    }

    #[test]
    fn comments() {
        let toks = lex("a /* b */ c // d");
        assert_eq!(toks[2].kind, TokenKind::CComment);
        assert_eq!(toks[2].text, "/* b */");
        assert_eq!(toks[6].kind, TokenKind::CppComment);
        assert_eq!(toks[6].text, "// d");
    }

    #[test]
    fn line_continuation_splices_tokens() {
        let toks = lex("ab\\\ncd");
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text, "abcd");
    }

    #[test]
    fn trigraphs() {
        assert_eq!(kinds("??=")[0], TokenKind::Hash);
        assert_eq!(kinds("??(??)"), vec![TokenKind::LBracket, TokenKind::RBracket]);
        // ??/ is a backslash, which splices when a newline follows.
        let toks = lex("a??/\nb");
        assert_eq!(toks[0].text, "ab");
    }

    #[test]
    fn line_and_column_tracking() {
        let toks = lex("a\n  b");
        assert_eq!((toks[0].line, toks[0].column), (1, 0));
        assert_eq!(toks[1].kind, TokenKind::NewLine);
        assert_eq!((toks[2].line, toks[2].column), (2, 0));
        assert_eq!((toks[3].line, toks[3].column), (2, 2));
    }

    #[test]
    fn crlf_is_one_newline() {
        let toks = lex("a\r\nb");
        assert_eq!(toks[1].kind, TokenKind::NewLine);
        assert_eq!(toks[2].line, 2);
    }

    #[test]
    fn octal_literal_warns_on_bad_digit() {
        let mut lexer = Lexer::new("097", None, None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Number);
        let diags = lexer.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, LexSeverity::Warning);
    }

    #[test]
    fn quiet_mode_drops_warnings() {
        let mut lexer = Lexer::new("097", None, None);
        lexer.set_quiet(true);
        lexer.next_token();
        assert!(lexer.take_diagnostics().is_empty());
    }
}
