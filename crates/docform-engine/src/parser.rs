//! Formula lexer and parser.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := cmp (("and" | "&&") cmp)*
//! cmp     := add (("=" | "==" | "!=" | "<>" | "<" | "<=" | ">" | ">=") add)*
//! add     := mul (("+" | "-") mul)*
//! mul     := unary (("*" | "/") unary)*
//! unary   := ("-" | "+" | "!" | "not") unary | primary
//! primary := number | string | "true" | "false" | "null" | "{{" field "}}"
//!          | function "(" [expr ("," expr)*] ")" | "(" expr ")"
//! ```

use docform_model::{FieldId, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp, UNARY_PRECEDENCE};
use crate::functions::Function;

/// Longest accepted formula text, in characters.
pub const MAX_FORMULA_CHARS: usize = 8_192;
/// Deepest accepted nesting of groups, calls, prefix operators and chained infix operators.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("formula is empty")]
    Empty,
    #[error("formula exceeds {max} characters")]
    TooLong { max: usize },
    #[error("unexpected character {ch:?} at {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string literal starting at {pos}")]
    UnterminatedString { pos: usize },
    #[error("unterminated field reference starting at {pos}")]
    UnterminatedReference { pos: usize },
    #[error("empty field reference at {pos}")]
    EmptyReference { pos: usize },
    #[error("invalid number {text:?} at {pos}")]
    InvalidNumber { text: String, pos: usize },
    #[error("unexpected {found} at {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unknown identifier {name:?} at {pos}; field references are written {{{{field}}}}")]
    UnknownIdentifier { name: String, pos: usize },
    #[error("unknown function {name:?} at {pos}")]
    UnknownFunction { name: String, pos: usize },
    #[error("{function}() takes {expected} argument(s), got {found}")]
    ArgumentCount {
        function: &'static str,
        expected: String,
        found: usize,
    },
    #[error("expression nesting exceeds {max} levels")]
    TooDeep { max: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    String(String),
    Field(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::String(s) => format!("string {s:?}"),
            TokenKind::Field(id) => format!("field reference {{{{{id}}}}}"),
            TokenKind::Ident(name) => format!("identifier {name:?}"),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::Eq => "'=='".to_string(),
            TokenKind::Ne => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Le => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::Ge => "'>='".to_string(),
            TokenKind::AndAnd => "'&&'".to_string(),
            TokenKind::OrOr => "'||'".to_string(),
            TokenKind::Bang => "'!'".to_string(),
            TokenKind::Eof => "end of formula".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            len: input.len(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map_or(self.len, |&(idx, _)| idx)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn consume_while<F>(&mut self, mut predicate: F) -> String
    where
        F: FnMut(char) -> bool,
    {
        let mut buf = String::new();
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            buf.push(ch);
            self.bump();
        }
        buf
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        self.consume_while(char::is_whitespace);
        let pos = self.pos();
        let Some(ch) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos,
            });
        };

        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            ',' => self.single(TokenKind::Comma),
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '*' => self.single(TokenKind::Star),
            '/' => self.single(TokenKind::Slash),
            '=' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                }
                TokenKind::Eq
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                self.bump();
                match self.peek() {
                    Some('=') => {
                        self.bump();
                        TokenKind::Le
                    }
                    Some('>') => {
                        self.bump();
                        TokenKind::Ne
                    }
                    _ => TokenKind::Lt,
                }
            }
            '>' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                self.bump();
                if self.peek() != Some('&') {
                    return Err(ParseError::UnexpectedChar { ch: '&', pos });
                }
                self.bump();
                TokenKind::AndAnd
            }
            '|' => {
                self.bump();
                if self.peek() != Some('|') {
                    return Err(ParseError::UnexpectedChar { ch: '|', pos });
                }
                self.bump();
                TokenKind::OrOr
            }
            '{' => self.field_reference(pos)?,
            '"' | '\'' => self.string_literal(ch, pos)?,
            c if c.is_ascii_digit() || c == '.' => self.number(pos)?,
            c if is_ident_start(c) => TokenKind::Ident(self.consume_while(is_ident_part)),
            other => return Err(ParseError::UnexpectedChar { ch: other, pos }),
        };

        Ok(Token { kind, pos })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn field_reference(&mut self, pos: usize) -> Result<TokenKind, ParseError> {
        self.bump();
        if self.peek() != Some('{') {
            return Err(ParseError::UnexpectedChar { ch: '{', pos });
        }
        self.bump();
        let mut raw = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseError::UnterminatedReference { pos }),
                Some('}') => {
                    if self.peek() != Some('}') {
                        return Err(ParseError::UnterminatedReference { pos });
                    }
                    self.bump();
                    break;
                }
                Some('{') => return Err(ParseError::UnexpectedChar { ch: '{', pos }),
                Some(c) => raw.push(c),
            }
        }
        let id = raw.trim();
        if id.is_empty() {
            return Err(ParseError::EmptyReference { pos });
        }
        Ok(TokenKind::Field(id.to_string()))
    }

    fn string_literal(&mut self, quote: char, pos: usize) -> Result<TokenKind, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseError::UnterminatedString { pos }),
                Some(c) if c == quote => {
                    // A doubled quote is an escaped literal quote.
                    if self.peek() == Some(quote) {
                        self.bump();
                        out.push(quote);
                        continue;
                    }
                    break;
                }
                Some(c) => out.push(c),
            }
        }
        Ok(TokenKind::String(out))
    }

    fn number(&mut self, pos: usize) -> Result<TokenKind, ParseError> {
        let mut text = self.consume_while(|c| c.is_ascii_digit() || c == '.');
        if matches!(self.peek(), Some('e' | 'E')) {
            if let Some(exp) = self.bump() {
                text.push(exp);
            }
            if matches!(self.peek(), Some('+' | '-')) {
                if let Some(sign) = self.bump() {
                    text.push(sign);
                }
            }
            let digits = self.consume_while(|c| c.is_ascii_digit());
            if digits.is_empty() {
                return Err(ParseError::InvalidNumber { text, pos });
            }
            text.push_str(&digits);
        }
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(TokenKind::Number(n)),
            _ => Err(ParseError::InvalidNumber { text, pos }),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Token,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(input);
        let lookahead = lexer.next_token()?;
        Ok(Self {
            lexer,
            lookahead,
            depth: 0,
        })
    }

    fn bump(&mut self) -> Result<Token, ParseError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.lookahead.kind == kind {
            self.bump()?;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> ParseError {
        ParseError::UnexpectedToken {
            found: self.lookahead.kind.describe(),
            pos: self.lookahead.pos,
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::TooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn parse(&mut self) -> Result<Expr, ParseError> {
        if self.lookahead.kind == TokenKind::Eof {
            return Err(ParseError::Empty);
        }
        let expr = self.parse_expr(0)?;
        if self.lookahead.kind != TokenKind::Eof {
            return Err(self.unexpected());
        }
        Ok(expr)
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_prefix()?;
        let mut chained = 0;
        while let Some(op) = self.infix_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.bump()?;
            // Every folded operator deepens the left spine of the tree by one level.
            self.enter()?;
            chained += 1;
            let right = self.parse_expr(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = self.depth.saturating_sub(chained);
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let op = match &self.lookahead.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Ident(name) if name.eq_ignore_ascii_case("not") => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.bump()?;
            self.enter()?;
            let expr = self.parse_expr(UNARY_PRECEDENCE)?;
            self.leave();
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }

        let token = self.bump()?;
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::String(s) => Ok(Expr::Literal(Value::Text(s))),
            TokenKind::Field(id) => Ok(Expr::Field(FieldId::new(id))),
            TokenKind::LParen => {
                self.enter()?;
                let expr = self.parse_expr(0)?;
                self.expect(TokenKind::RParen)?;
                self.leave();
                Ok(expr)
            }
            TokenKind::Ident(name) => self.parse_ident(name, token.pos),
            other => Err(ParseError::UnexpectedToken {
                found: other.describe(),
                pos: token.pos,
            }),
        }
    }

    fn parse_ident(&mut self, name: String, pos: usize) -> Result<Expr, ParseError> {
        if self.lookahead.kind != TokenKind::LParen {
            return match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Err(ParseError::UnknownIdentifier { name, pos }),
            };
        }

        let Some(function) = Function::from_name(&name) else {
            return Err(ParseError::UnknownFunction { name, pos });
        };

        self.bump()?; // '('
        self.enter()?;
        let mut args = Vec::new();
        if self.lookahead.kind != TokenKind::RParen {
            loop {
                args.push(self.parse_expr(0)?);
                if self.lookahead.kind == TokenKind::Comma {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.leave();

        let spec = function.spec();
        if !spec.accepts_arg_count(args.len()) {
            return Err(ParseError::ArgumentCount {
                function: spec.name,
                expected: spec.arity_description(),
                found: args.len(),
            });
        }
        Ok(Expr::Call { function, args })
    }

    fn infix_op(&self) -> Option<BinaryOp> {
        match &self.lookahead.kind {
            TokenKind::OrOr => Some(BinaryOp::Or),
            TokenKind::AndAnd => Some(BinaryOp::And),
            TokenKind::Ident(name) if name.eq_ignore_ascii_case("or") => Some(BinaryOp::Or),
            TokenKind::Ident(name) if name.eq_ignore_ascii_case("and") => Some(BinaryOp::And),
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            _ => None,
        }
    }
}

/// Parses formula text into an expression tree.
///
/// A leading `=` is accepted and ignored so formulas copied from document templates parse as-is.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    if input.chars().count() > MAX_FORMULA_CHARS {
        return Err(ParseError::TooLong {
            max: MAX_FORMULA_CHARS,
        });
    }
    let body = input.trim_start();
    let body = body.strip_prefix('=').unwrap_or(body);
    let offset = input.len() - body.len();
    Parser::new(body)
        .and_then(|mut parser| parser.parse())
        .map_err(|err| err.add_offset(offset))
}

impl ParseError {
    fn add_offset(self, delta: usize) -> Self {
        match self {
            ParseError::UnexpectedChar { ch, pos } => ParseError::UnexpectedChar {
                ch,
                pos: pos + delta,
            },
            ParseError::UnterminatedString { pos } => {
                ParseError::UnterminatedString { pos: pos + delta }
            }
            ParseError::UnterminatedReference { pos } => {
                ParseError::UnterminatedReference { pos: pos + delta }
            }
            ParseError::EmptyReference { pos } => ParseError::EmptyReference { pos: pos + delta },
            ParseError::InvalidNumber { text, pos } => ParseError::InvalidNumber {
                text,
                pos: pos + delta,
            },
            ParseError::UnexpectedToken { found, pos } => ParseError::UnexpectedToken {
                found,
                pos: pos + delta,
            },
            ParseError::UnknownIdentifier { name, pos } => ParseError::UnknownIdentifier {
                name,
                pos: pos + delta,
            },
            ParseError::UnknownFunction { name, pos } => ParseError::UnknownFunction {
                name,
                pos: pos + delta,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(id: &str) -> Expr {
        Expr::Field(FieldId::from(id))
    }

    fn num(n: f64) -> Expr {
        Expr::Literal(Value::Number(n))
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse("{{a}} + {{b}} * 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(field("a")),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(field("b")),
                    right: Box::new(num(2.0)),
                }),
            }
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        let expr = parse("10 - 3 - 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Sub,
                left: Box::new(Expr::Binary {
                    op: BinaryOp::Sub,
                    left: Box::new(num(10.0)),
                    right: Box::new(num(3.0)),
                }),
                right: Box::new(num(2.0)),
            }
        );
    }

    #[test]
    fn field_ids_are_trimmed_and_may_contain_punctuation() {
        let expr = parse("{{ client.name-1 }}").unwrap();
        assert_eq!(expr, field("client.name-1"));
    }

    #[test]
    fn leading_equals_sign_is_ignored() {
        assert_eq!(parse("= 1").unwrap(), num(1.0));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let expr = parse("TRUE AND NOT false OR Null").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(Expr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(Expr::Literal(Value::Bool(true))),
                    right: Box::new(Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(Expr::Literal(Value::Bool(false))),
                    }),
                }),
                right: Box::new(Expr::Literal(Value::Null)),
            }
        );
    }

    #[test]
    fn unknown_function_is_rejected_with_position() {
        assert_eq!(
            parse("1 + eval({{a}})").unwrap_err(),
            ParseError::UnknownFunction {
                name: "eval".to_string(),
                pos: 4
            }
        );
    }

    #[test]
    fn bare_identifiers_are_not_field_references() {
        assert!(matches!(
            parse("price * 2").unwrap_err(),
            ParseError::UnknownIdentifier { .. }
        ));
    }

    #[test]
    fn argument_counts_are_checked_at_parse_time() {
        let err = parse("pow(2)").unwrap_err();
        assert_eq!(
            err,
            ParseError::ArgumentCount {
                function: "pow",
                expected: "exactly 2".to_string(),
                found: 1,
            }
        );
        assert!(matches!(
            parse("sum()").unwrap_err(),
            ParseError::ArgumentCount { .. }
        ));
    }

    #[test]
    fn malformed_input_reports_specific_errors() {
        assert_eq!(parse("   ").unwrap_err(), ParseError::Empty);
        assert_eq!(
            parse("{{a} + 1").unwrap_err(),
            ParseError::UnterminatedReference { pos: 0 }
        );
        assert_eq!(parse("{{  }}").unwrap_err(), ParseError::EmptyReference { pos: 0 });
        assert_eq!(
            parse("\"abc").unwrap_err(),
            ParseError::UnterminatedString { pos: 0 }
        );
        assert!(matches!(
            parse("1e").unwrap_err(),
            ParseError::InvalidNumber { .. }
        ));
        assert!(matches!(
            parse("(1 + 2").unwrap_err(),
            ParseError::UnexpectedToken { .. }
        ));
        assert!(matches!(
            parse("1 2").unwrap_err(),
            ParseError::UnexpectedToken { .. }
        ));
        assert_eq!(
            parse("1 # 2").unwrap_err(),
            ParseError::UnexpectedChar { ch: '#', pos: 2 }
        );
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let n = MAX_NESTING_DEPTH + 1;
        let deep = format!("{}1{}", "(".repeat(n), ")".repeat(n));
        assert_eq!(
            parse(&deep).unwrap_err(),
            ParseError::TooDeep {
                max: MAX_NESTING_DEPTH
            }
        );
        let ok = format!("{}1{}", "(".repeat(MAX_NESTING_DEPTH), ")".repeat(MAX_NESTING_DEPTH));
        assert_eq!(parse(&ok).unwrap(), num(1.0));
    }

    #[test]
    fn long_operator_chains_count_towards_nesting() {
        let chain = vec!["{{a}}"; 1_300].join("+");
        assert!(chain.len() < MAX_FORMULA_CHARS);
        assert_eq!(
            parse(&chain).unwrap_err(),
            ParseError::TooDeep {
                max: MAX_NESTING_DEPTH
            }
        );

        let sum_all = format!("sum({})", vec!["{{a}}"; 1_300].join(","));
        assert!(parse(&sum_all).is_ok());

        let at_limit = vec!["{{a}}"; MAX_NESTING_DEPTH + 1].join(" + ");
        assert!(parse(&at_limit).is_ok());
        let over_limit = vec!["{{a}}"; MAX_NESTING_DEPTH + 2].join(" * ");
        assert!(matches!(parse(&over_limit), Err(ParseError::TooDeep { .. })));
    }

    #[test]
    fn overlong_formulas_are_rejected() {
        let long = "1+".repeat(MAX_FORMULA_CHARS / 2) + "1";
        assert_eq!(
            parse(&long).unwrap_err(),
            ParseError::TooLong {
                max: MAX_FORMULA_CHARS
            }
        );
    }
}
