//! expression parser
//!
//! Hand-rolled recursive descent over the body of a `(( ... ))` scalar.
//! Identifiers may contain `-` (YAML keys like `index-i` are referencable),
//! so binary `-` needs surrounding whitespace to be recognized as an
//! operator.

use super::{BinOp, Expr, MarkerExpr, MergeExpr, RefStep};
use crate::node::NodeFlags;

/// A parse failure with the byte offset into the expression body.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message} (at offset {offset})")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

/// Parser state: tracks position in the input string.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

/// Parse an expression body (the text between `((` and `))`).
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_ws();
    let expr = if parser.peek_char() == Some('&') {
        parser.parse_marker()?
    } else {
        parser.parse_expression()?
    };
    parser.skip_ws();
    if parser.pos < parser.input.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

impl<'a> Parser<'a> {
    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek_char(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn starts_with(&self, s: &str) -> bool {
        self.remaining().starts_with(s)
    }

    fn eat_char(&mut self, ch: char) -> bool {
        if self.peek_char() == Some(ch) {
            self.advance(ch.len_utf8());
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, ch: char) -> Result<(), ParseError> {
        if self.eat_char(ch) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{ch}'")))
        }
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance(ch.len_utf8());
            } else {
                break;
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: self.pos,
        }
    }

    // ── markers ─────────────────────────────────────────────────────

    fn parse_marker(&mut self) -> Result<Expr, ParseError> {
        let mut marker = MarkerExpr::default();
        while self.eat_char('&') {
            let name = self.parse_ident()?;
            match name.as_str() {
                "template" => marker.template = true,
                "temporary" => marker.flags |= NodeFlags::TEMPORARY,
                "local" => marker.flags |= NodeFlags::LOCAL,
                "state" => marker.flags |= NodeFlags::STATE,
                "default" => marker.flags |= NodeFlags::DEFAULT,
                "inject" => marker.flags |= NodeFlags::INJECT,
                "dynamic" => marker.flags |= NodeFlags::DYNAMIC,
                "tag" => {
                    self.expect_char(':')?;
                    let mut tag = String::new();
                    if self.eat_char('*') {
                        tag.push('*');
                    }
                    tag.push_str(&self.parse_ident()?);
                    marker.tag = Some(tag);
                }
                _ => return Err(self.error(format!("unknown marker '&{name}'"))),
            }
            self.skip_ws();
        }
        if self.pos < self.input.len() {
            marker.inner = Some(Box::new(self.parse_expression()?));
        }
        Ok(Expr::Marker(marker))
    }

    // ── expressions ─────────────────────────────────────────────────

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            self.skip_ws();
            if self.starts_with("||") {
                self.advance(2);
                self.skip_ws();
                let rhs = self.parse_additive()?;
                lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            self.skip_ws();
            let op = match self.peek_char() {
                Some('+') => BinOp::Add,
                Some('-') => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance(1);
            self.skip_ws();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_ws();
            let op = match self.peek_char() {
                Some('*') => BinOp::Mul,
                Some('/') => BinOp::Div,
                Some('%') => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance(1);
            self.skip_ws();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_char('-') {
            self.skip_ws();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_char() {
            Some('(') => {
                self.advance(1);
                self.skip_ws();
                let inner = self.parse_expression()?;
                self.skip_ws();
                self.expect_char(')')?;
                Ok(inner)
            }
            Some('[') => self.parse_list(),
            Some('"') => self.parse_string(),
            Some('*') => self.parse_substitution(),
            Some('~') => {
                if self.starts_with("~~") {
                    self.advance(2);
                    Ok(Expr::Undefined)
                } else {
                    Err(self.error("expected '~~'"))
                }
            }
            Some(ch) if ch.is_ascii_digit() => self.parse_number(),
            Some(ch) if is_ident_start(ch) => self.parse_named(),
            _ => Err(self.error("unexpected character in expression")),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        self.expect_char('[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.eat_char(']') {
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_expression()?);
            self.skip_ws();
            if self.eat_char(',') {
                self.skip_ws();
                continue;
            }
            self.expect_char(']')?;
            return Ok(Expr::List(items));
        }
    }

    fn parse_string(&mut self) -> Result<Expr, ParseError> {
        self.expect_char('"')?;
        let mut result = String::new();
        loop {
            match self.peek_char() {
                None => return Err(self.error("unterminated string literal")),
                Some('"') => {
                    self.advance(1);
                    return Ok(Expr::StringLit(result));
                }
                Some('\\') => {
                    self.advance(1);
                    match self.peek_char() {
                        Some('n') => result.push('\n'),
                        Some('t') => result.push('\t'),
                        Some('"') => result.push('"'),
                        Some('\\') => result.push('\\'),
                        _ => return Err(self.error("invalid escape sequence")),
                    }
                    self.advance(1);
                }
                Some(ch) => {
                    result.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                self.advance(1);
            } else {
                break;
            }
        }
        let mut decimal = false;
        if self.peek_char() == Some('.')
            && self
                .remaining()
                .chars()
                .nth(1)
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            decimal = true;
            self.advance(1);
            while let Some(ch) = self.peek_char() {
                if ch.is_ascii_digit() {
                    self.advance(1);
                } else {
                    break;
                }
            }
        }
        let text = &self.input[start..self.pos];
        if decimal {
            text.parse::<f64>()
                .map(Expr::Decimal)
                .map_err(|_| self.error(format!("invalid decimal literal '{text}'")))
        } else {
            text.parse::<i64>()
                .map(Expr::Integer)
                .map_err(|_| self.error(format!("integer literal '{text}' out of range")))
        }
    }

    fn parse_ident(&mut self) -> Result<String, ParseError> {
        match self.peek_char() {
            Some(ch) if is_ident_start(ch) => {}
            _ => return Err(self.error("expected identifier")),
        }
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if is_ident_char(ch) {
                self.advance(ch.len_utf8());
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_named(&mut self) -> Result<Expr, ParseError> {
        let name = self.parse_ident()?;
        match name.as_str() {
            "true" => return Ok(Expr::Boolean(true)),
            "false" => return Ok(Expr::Boolean(false)),
            "nil" => return Ok(Expr::Nil),
            "merge" => return self.parse_merge(),
            "prefer" => {
                self.skip_ws();
                let inner = self.parse_expression()?;
                return Ok(Expr::Prefer(Box::new(inner)));
            }
            _ => {}
        }
        if self.peek_char() == Some('(') {
            return self.parse_call(name);
        }
        let steps = self.parse_reference_steps(RefStep::Key(name))?;
        Ok(Expr::Reference(steps))
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ParseError> {
        self.expect_char('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.eat_char(')') {
            return Ok(Expr::Call { name, args });
        }
        loop {
            args.push(self.parse_expression()?);
            self.skip_ws();
            if self.eat_char(',') {
                self.skip_ws();
                continue;
            }
            self.expect_char(')')?;
            return Ok(Expr::Call { name, args });
        }
    }

    fn parse_reference_steps(&mut self, first: RefStep) -> Result<Vec<RefStep>, ParseError> {
        let mut steps = vec![first];
        loop {
            if self.eat_char('.') {
                if self.peek_char() == Some('[') {
                    steps.push(self.parse_index_step()?);
                } else {
                    steps.push(RefStep::Key(self.parse_ident()?));
                }
            } else if self.peek_char() == Some('[') {
                steps.push(self.parse_index_step()?);
            } else {
                return Ok(steps);
            }
        }
    }

    fn parse_index_step(&mut self) -> Result<RefStep, ParseError> {
        self.expect_char('[')?;
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                self.advance(1);
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        let index = text
            .parse::<usize>()
            .map_err(|_| self.error("expected list index"))?;
        self.expect_char(']')?;
        Ok(RefStep::Index(index))
    }

    fn parse_merge(&mut self) -> Result<Expr, ParseError> {
        let mut replace = false;
        let mut path = None;
        self.skip_ws();
        if self.peek_char().map(is_ident_start).unwrap_or(false) {
            let save = self.pos;
            let word = self.parse_ident()?;
            if word == "replace" {
                replace = true;
                self.skip_ws();
                if self.peek_char().map(is_ident_start).unwrap_or(false) {
                    path = Some(self.parse_dotted_path()?);
                }
            } else {
                self.pos = save;
                path = Some(self.parse_dotted_path()?);
            }
        }
        Ok(Expr::Merge(MergeExpr { path, replace }))
    }

    fn parse_dotted_path(&mut self) -> Result<Vec<String>, ParseError> {
        let mut path = vec![self.parse_ident()?];
        while self.eat_char('.') {
            path.push(self.parse_ident()?);
        }
        Ok(path)
    }

    fn parse_substitution(&mut self) -> Result<Expr, ParseError> {
        self.expect_char('*')?;
        let first = RefStep::Key(self.parse_ident()?);
        let steps = self.parse_reference_steps(first)?;
        let target = Box::new(Expr::Reference(steps));
        self.skip_ws();
        let mut scope = Vec::new();
        if self.eat_char('{') {
            self.skip_ws();
            if !self.eat_char('}') {
                loop {
                    let key = self.parse_ident()?;
                    self.skip_ws();
                    self.expect_char('=')?;
                    self.skip_ws();
                    let value = self.parse_expression()?;
                    scope.push((key, value));
                    self.skip_ws();
                    if self.eat_char(',') {
                        self.skip_ws();
                        continue;
                    }
                    self.expect_char('}')?;
                    break;
                }
            }
        }
        Ok(Expr::Substitution { target, scope })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn literals() {
        assert_eq!(parse("42"), Ok(Expr::Integer(42)));
        assert_eq!(parse("4.5"), Ok(Expr::Decimal(4.5)));
        assert_eq!(parse("true"), Ok(Expr::Boolean(true)));
        assert_eq!(parse("nil"), Ok(Expr::Nil));
        assert_eq!(parse("~~"), Ok(Expr::Undefined));
        assert_eq!(
            parse(r#""foo \"bar\"""#),
            Ok(Expr::StringLit("foo \"bar\"".to_string()))
        );
    }

    #[test]
    fn references_with_index_steps() {
        assert_eq!(
            parse("a.b.[0]"),
            Ok(Expr::Reference(vec![
                RefStep::Key("a".to_string()),
                RefStep::Key("b".to_string()),
                RefStep::Index(0),
            ]))
        );
        assert_eq!(
            parse("index-i"),
            Ok(Expr::Reference(vec![RefStep::Key("index-i".to_string())]))
        );
    }

    #[test]
    fn arithmetic_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Integer(1)),
                rhs: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(Expr::Integer(2)),
                    rhs: Box::new(Expr::Integer(3)),
                }),
            }
        );
    }

    #[test]
    fn alternatives_bind_loosest() {
        let expr = parse("merge || 1 + 2").unwrap();
        match expr {
            Expr::Or(lhs, _) => assert_eq!(
                *lhs,
                Expr::Merge(MergeExpr {
                    path: None,
                    replace: false
                })
            ),
            other => panic!("expected or expression, got {other:?}"),
        }
    }

    #[test]
    fn merge_forms() {
        assert_eq!(
            parse("merge"),
            Ok(Expr::Merge(MergeExpr {
                path: None,
                replace: false
            }))
        );
        assert_eq!(
            parse("merge foo.bar"),
            Ok(Expr::Merge(MergeExpr {
                path: Some(vec!["foo".to_string(), "bar".to_string()]),
                replace: false
            }))
        );
        assert_eq!(
            parse("merge replace foo"),
            Ok(Expr::Merge(MergeExpr {
                path: Some(vec!["foo".to_string()]),
                replace: true
            }))
        );
    }

    #[test]
    fn markers() {
        let expr = parse("&template &temporary").unwrap();
        match expr {
            Expr::Marker(marker) => {
                assert!(marker.template);
                assert!(marker.flags.temporary());
                assert!(marker.inner.is_none());
            }
            other => panic!("expected marker, got {other:?}"),
        }

        let expr = parse("&tag:*name (5)").unwrap();
        match expr {
            Expr::Marker(marker) => {
                assert_eq!(marker.tag.as_deref(), Some("*name"));
                assert_eq!(marker.inner, Some(Box::new(Expr::Integer(5))));
            }
            other => panic!("expected marker, got {other:?}"),
        }
    }

    #[test]
    fn substitution_with_scope() {
        let expr = parse("*t { a = 7, b = a }").unwrap();
        match expr {
            Expr::Substitution { target, scope } => {
                assert_eq!(
                    *target,
                    Expr::Reference(vec![RefStep::Key("t".to_string())])
                );
                assert_eq!(scope.len(), 2);
                assert_eq!(scope[0].0, "a");
                assert_eq!(scope[0].1, Expr::Integer(7));
            }
            other => panic!("expected substitution, got {other:?}"),
        }
    }

    #[test]
    fn calls() {
        let expr = parse("join(\", \", list)").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "join");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse("1 2").is_err());
        assert!(parse("&nonsense").is_err());
        assert!(parse("\"open").is_err());
    }
}
