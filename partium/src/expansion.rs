//! Macro substitution: arguments, stringification and token pasting.
//!
//! The driver captures raw arguments, pre-expands each exactly once, then
//! [`substitute`] builds the replacement token stream that a macro source
//! replays. Recursive expansion of the result happens back in the driver,
//! where the expansion chain blocks self-recursion.

use crate::lexer::Lexer;
use crate::macro_def::Macro;
use crate::token::{Token, TokenKind, TokenValue};

/// One captured macro argument: the raw token spelling plus the result of
/// its one-shot pre-expansion.
#[derive(Clone, Debug, Default)]
pub(crate) struct Argument {
    tokens: Vec<Token>,
    expansion: Option<Vec<Token>>,
}

impl Argument {
    pub fn new() -> Self {
        Argument::default()
    }

    pub fn add_token(&mut self, tok: Token) {
        self.tokens.push(tok);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The argument exactly as spelled, used for `#` and `##` operands.
    pub fn raw(&self) -> &[Token] {
        &self.tokens
    }

    /// The pre-expanded argument, used everywhere else. Falls back to the
    /// raw spelling if expansion never ran.
    pub fn expansion(&self) -> &[Token] {
        self.expansion.as_deref().unwrap_or(&self.tokens)
    }

    pub fn is_expanded(&self) -> bool {
        self.expansion.is_some()
    }

    pub fn set_expansion(&mut self, tokens: Vec<Token>) {
        self.expansion = Some(tokens);
    }
}

/// Spell a raw token sequence back out as text.
fn spell(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

/// Escape a spelling for inclusion inside a string literal.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Build the `#param` string literal from a raw argument.
fn stringify(at: &Token, arg: &[Token]) -> Token {
    let spelled = spell(arg);
    let text = format!("\"{}\"", escape(&spelled));
    Token::with_value(
        TokenKind::String,
        at.line,
        at.column,
        text,
        TokenValue::Text(spelled),
    )
}

/// Re-lex the concatenation of two spellings into tokens. A paste that does
/// not form a single token yields every token the spelling lexes to, which
/// is what the output text needs either way.
fn paste(at: &Token, text: &str, out: &mut Vec<Token>) {
    let mut lexer = Lexer::new(text, None, None);
    lexer.set_quiet(true);
    loop {
        let tok = lexer.next_token();
        if tok.kind == TokenKind::Eof {
            break;
        }
        out.push(Token::with_value(
            tok.kind,
            at.line,
            at.column,
            tok.text,
            tok.value,
        ));
    }
}

/// True if the next significant replacement token is a recorded `##`,
/// which makes the current parameter a left paste operand.
fn precedes_paste(rest: &[Token]) -> bool {
    rest.iter()
        .find(|t| !t.is_white())
        .is_some_and(|t| t.kind == TokenKind::MacroPaste)
}

/// Substitute arguments into a macro's replacement list, resolving `#` and
/// `##`. The result is replayed by the macro source and re-scanned by the
/// driver.
pub(crate) fn substitute(m: &Macro, args: &[Argument]) -> Vec<Token> {
    let tokens = m.tokens();
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        match tok.kind {
            TokenKind::MacroArg => {
                let arg = &args[tok.arg_index()];
                if precedes_paste(&tokens[i + 1..]) {
                    out.extend_from_slice(arg.raw());
                } else {
                    out.extend_from_slice(arg.expansion());
                }
            }
            TokenKind::MacroString => {
                out.push(stringify(tok, args[tok.arg_index()].raw()));
            }
            TokenKind::MacroPaste => {
                while out.last().is_some_and(Token::is_white) {
                    out.pop();
                }
                let left = out.pop();
                // The right operand comes raw off the replacement list.
                let mut j = i + 1;
                while j < tokens.len() && tokens[j].is_white() {
                    j += 1;
                }
                let right: Vec<Token> = match tokens.get(j) {
                    Some(t) if t.kind == TokenKind::MacroArg => {
                        args[t.arg_index()].raw().to_vec()
                    }
                    Some(t) => vec![t.clone()],
                    None => Vec::new(),
                };
                match (left, right.split_first()) {
                    (Some(l), Some((first, rest))) => {
                        paste(tok, &format!("{}{}", l.text, first.text), &mut out);
                        out.extend_from_slice(rest);
                    }
                    (Some(l), None) => out.push(l),
                    (None, _) => out.extend_from_slice(&right),
                }
                i = j;
            }
            _ => out.push(tok.clone()),
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macro_def::Macro;

    fn ident(text: &str) -> Token {
        Token::new(TokenKind::Identifier, 1, 0, text)
    }

    fn arg_ref(idx: usize) -> Token {
        Token::with_value(TokenKind::MacroArg, 1, 0, "x", TokenValue::Arg(idx))
    }

    fn captured(texts: &[&str]) -> Argument {
        let mut arg = Argument::new();
        for t in texts {
            arg.add_token(ident(t));
        }
        arg
    }

    #[test]
    fn argument_prefers_expansion() {
        let mut arg = captured(&["A"]);
        assert_eq!(arg.expansion()[0].text, "A");
        arg.set_expansion(vec![ident("B")]);
        assert_eq!(arg.expansion()[0].text, "B");
        assert_eq!(arg.raw()[0].text, "A");
    }

    #[test]
    fn stringify_escapes() {
        let mut m = Macro::new("STR");
        m.set_params(vec!["x".to_string()]);
        m.add_token(Token::with_value(
            TokenKind::MacroString,
            1,
            0,
            "#x",
            TokenValue::Arg(0),
        ));
        let mut arg = Argument::new();
        arg.add_token(Token::new(TokenKind::String, 1, 0, "\"a\\b\""));
        let out = substitute(&m, std::slice::from_ref(&arg));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "\"\\\"a\\\\b\\\"\"");
    }

    #[test]
    fn paste_joins_identifiers() {
        let mut m = Macro::new("CAT");
        m.set_params(vec!["a".to_string(), "b".to_string()]);
        m.add_token(arg_ref(0));
        m.add_token(Token::new(TokenKind::MacroPaste, 1, 0, "##"));
        m.add_token(arg_ref(1));
        let out = substitute(&m, &[captured(&["foo"]), captured(&["bar"])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "foobar");
        assert_eq!(out[0].kind, TokenKind::Identifier);
    }

    #[test]
    fn paste_with_number_relexes() {
        let mut m = Macro::new("CAT");
        m.set_params(vec!["a".to_string(), "b".to_string()]);
        m.add_token(arg_ref(0));
        m.add_token(Token::new(TokenKind::MacroPaste, 1, 0, "##"));
        m.add_token(arg_ref(1));
        let mut num = Argument::new();
        num.add_token(Token::new(TokenKind::Number, 1, 0, "123"));
        let out = substitute(&m, &[captured(&["foo"]), num]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "foo123");
        assert_eq!(out[0].kind, TokenKind::Identifier);
    }

    #[test]
    fn paste_with_empty_operand_keeps_left() {
        let mut m = Macro::new("CAT");
        m.set_params(vec!["a".to_string(), "b".to_string()]);
        m.add_token(arg_ref(0));
        m.add_token(Token::new(TokenKind::MacroPaste, 1, 0, "##"));
        m.add_token(arg_ref(1));
        let out = substitute(&m, &[captured(&["left"]), Argument::new()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "left");
    }

    #[test]
    fn left_paste_operand_uses_raw_argument() {
        // a ## b where the raw spelling of a would expand if pre-expanded.
        let mut m = Macro::new("CAT");
        m.set_params(vec!["a".to_string(), "b".to_string()]);
        m.add_token(arg_ref(0));
        m.add_token(Token::new(TokenKind::Whitespace, 1, 0, " "));
        m.add_token(Token::new(TokenKind::MacroPaste, 1, 0, "##"));
        m.add_token(Token::new(TokenKind::Whitespace, 1, 0, " "));
        m.add_token(arg_ref(1));
        let mut a = captured(&["raw"]);
        a.set_expansion(vec![ident("expanded")]);
        let out = substitute(&m, &[a, captured(&["tail"])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "rawtail");
    }
}
