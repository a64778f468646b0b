//! Constant-expression evaluation for `#if` and `#elif`.
//!
//! A precedence-climbing parser over the expansion stream. All arithmetic is
//! signed 64-bit with wrapping semantics; `&&` and `||` evaluate both sides
//! (a deliberate simplification, so a division by zero on a dead branch is
//! still diagnosed). `defined` is resolved before expansion ever sees its
//! operand.

use crate::error::PreprocessError;
use crate::numeric::NumericValue;
use crate::preprocessor::Preprocessor;
use crate::source::Source;
use crate::token::{Token, TokenKind, TokenValue};

fn priority(kind: TokenKind) -> u8 {
    match kind {
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 11,
        TokenKind::Plus | TokenKind::Minus => 10,
        TokenKind::Lsh | TokenKind::Rsh => 9,
        TokenKind::Lt | TokenKind::Gt | TokenKind::Le | TokenKind::Ge => 8,
        TokenKind::EqEq | TokenKind::BangEq => 7,
        TokenKind::Amp => 6,
        TokenKind::Caret => 5,
        TokenKind::Pipe => 4,
        TokenKind::AmpAmp => 3,
        TokenKind::PipePipe => 2,
        TokenKind::Question => 1,
        _ => 0,
    }
}

fn number(la: &Token, value: i64) -> Token {
    Token::with_value(
        TokenKind::Number,
        la.line,
        la.column,
        value.to_string(),
        TokenValue::Numeric(NumericValue::integer(10, value.to_string())),
    )
}

impl Preprocessor {
    /// Evaluate one captured condition. The tokens are replayed through the
    /// expansion stream; leftovers after the expression are diagnosed and
    /// drained so the replay source always comes back off the stack.
    pub(crate) fn evaluate_condition(&mut self, condition: &[Token]) -> Result<i64, PreprocessError> {
        self.clear_expr_unget();
        let depth = self.source_depth();
        self.push_source(Source::fixed(condition.to_vec()), false);
        let result = self.expr(0);
        if result.is_ok() {
            let leftover = self.expr_token()?;
            if leftover.kind != TokenKind::Eof {
                self.warning(
                    leftover.line,
                    leftover.column,
                    format!("unexpected token '{}' in conditional expression", leftover.text),
                )?;
            }
        }
        self.clear_expr_unget();
        while self.source_depth() > depth {
            self.pop_source(false)?;
        }
        result
    }

    /// The expression stream: the expansion stream with a one-slot unget and
    /// `defined X` / `defined(X)` resolved to 1 or 0 without expanding `X`.
    pub(crate) fn expr_token(&mut self) -> Result<Token, PreprocessError> {
        if let Some(tok) = self.take_expr_unget() {
            return Ok(tok);
        }
        let tok = self.expanded_token_nonwhite()?;
        if tok.kind == TokenKind::Identifier && tok.text == "defined" {
            let mut la = self.source_token_nonwhite()?;
            let paren = la.kind == TokenKind::LParen;
            if paren {
                la = self.source_token_nonwhite()?;
            }

            let tok = if la.kind != TokenKind::Identifier {
                self.error(
                    la.line,
                    la.column,
                    format!("defined() needs an identifier, not '{}'", la.text),
                )?;
                number(&la, 0)
            } else if self.is_defined(&la.text) {
                number(&la, 1)
            } else {
                number(&la, 0)
            };

            if paren {
                let la = self.source_token_nonwhite()?;
                if la.kind != TokenKind::RParen {
                    self.expr_untoken(la.clone());
                    self.error(
                        la.line,
                        la.column,
                        format!("missing ) in defined(), got '{}'", la.text),
                    )?;
                }
            }
            return Ok(tok);
        }
        Ok(tok)
    }

    pub(crate) fn expr_untoken(&mut self, tok: Token) {
        self.set_expr_unget(tok);
    }

    fn expr_char(tok: &Token) -> i64 {
        match tok.value {
            TokenValue::Char(c) => i64::from(u32::from(c)),
            _ => 0,
        }
    }

    /// One precedence level of the expression grammar.
    pub(crate) fn expr(&mut self, min_priority: u8) -> Result<i64, PreprocessError> {
        let tok = self.expr_token()?;
        let mut lhs: i64;

        match tok.kind {
            TokenKind::LParen => {
                lhs = self.expr(0)?;
                let tok = self.expr_token()?;
                if tok.kind != TokenKind::RParen {
                    self.expr_untoken(tok.clone());
                    self.error(
                        tok.line,
                        tok.column,
                        format!("missing ) in expression, got '{}'", tok.text),
                    )?;
                    return Ok(0);
                }
            }
            TokenKind::Tilde => lhs = !self.expr(11)?,
            TokenKind::Bang => lhs = i64::from(self.expr(11)? == 0),
            TokenKind::Minus => lhs = self.expr(11)?.wrapping_neg(),
            TokenKind::Number => {
                lhs = match &tok.value {
                    TokenValue::Numeric(value) => value.long_value(),
                    _ => 0,
                };
            }
            TokenKind::Character => lhs = Self::expr_char(&tok),
            TokenKind::Identifier => {
                if self.has_warning(crate::config::Warning::Undef) {
                    self.warning(
                        tok.line,
                        tok.column,
                        format!("undefined token '{}' encountered in conditional", tok.text),
                    )?;
                }
                lhs = 0;
            }
            _ => {
                self.expr_untoken(tok);
                return Ok(0);
            }
        }

        loop {
            let op = self.expr_token()?;
            let pri = priority(op.kind);
            if pri == 0 || min_priority >= pri {
                self.expr_untoken(op);
                break;
            }
            let rhs = self.expr(pri)?;
            lhs = match op.kind {
                TokenKind::Slash => {
                    if rhs == 0 {
                        self.error(op.line, op.column, "division by zero".to_string())?;
                        0
                    } else {
                        lhs.wrapping_div(rhs)
                    }
                }
                TokenKind::Percent => {
                    if rhs == 0 {
                        self.error(op.line, op.column, "modulus by zero".to_string())?;
                        0
                    } else {
                        lhs.wrapping_rem(rhs)
                    }
                }
                TokenKind::Star => lhs.wrapping_mul(rhs),
                TokenKind::Plus => lhs.wrapping_add(rhs),
                TokenKind::Minus => lhs.wrapping_sub(rhs),
                TokenKind::Lt => i64::from(lhs < rhs),
                TokenKind::Gt => i64::from(lhs > rhs),
                TokenKind::Amp => lhs & rhs,
                TokenKind::Caret => lhs ^ rhs,
                TokenKind::Pipe => lhs | rhs,
                TokenKind::Lsh => lhs.wrapping_shl((rhs & 63) as u32),
                TokenKind::Rsh => lhs.wrapping_shr((rhs & 63) as u32),
                TokenKind::Le => i64::from(lhs <= rhs),
                TokenKind::Ge => i64::from(lhs >= rhs),
                TokenKind::EqEq => i64::from(lhs == rhs),
                TokenKind::BangEq => i64::from(lhs != rhs),
                TokenKind::AmpAmp => i64::from(lhs != 0 && rhs != 0),
                TokenKind::PipePipe => i64::from(lhs != 0 || rhs != 0),
                TokenKind::Question => {
                    let tok = self.expr_token()?;
                    if tok.kind != TokenKind::Colon {
                        self.expr_untoken(tok.clone());
                        self.error(
                            tok.line,
                            tok.column,
                            format!("missing : in conditional expression, got '{}'", tok.text),
                        )?;
                        return Ok(0);
                    }
                    let otherwise = self.expr(0)?;
                    if lhs != 0 { rhs } else { otherwise }
                }
                _ => {
                    self.error(op.line, op.column, format!("unexpected operator '{}'", op.text))?;
                    return Ok(0);
                }
            };
        }

        Ok(lhs)
    }
}
