//! Recursive-descent parser for the condition language.
//!
//! Precedence, low to high: `OR` < `AND` < `NOT` < comparison < primary.
//! `NOT` is right-associative; comparisons do not chain.

use serde_json::Value;

use crate::core::ast::{CompareOp, Expr};
use crate::core::error::{ExpressionError, ExpressionResult};
use crate::core::lexer::{Spanned, Token, tokenize};

/// Parser state over a token stream.
#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    source_len: usize,
}

impl Parser {
    /// Tokenize `source` and build a parser over it.
    pub fn new(source: &str) -> ExpressionResult<Self> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            source_len: source.len(),
        })
    }

    /// Parse a complete expression; trailing tokens are an error.
    pub fn parse(mut self) -> ExpressionResult<Expr> {
        if self.tokens.is_empty() {
            return Err(ExpressionError::parse(0, "expression", "end of input"));
        }
        let expr = self.parse_or()?;
        if let Some(extra) = self.peek() {
            return Err(ExpressionError::parse(
                extra.position,
                "end of input",
                extra.token.describe(),
            ));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ExpressionResult<Expr> {
        if self.eat(&Token::Not) {
            // Right-associative: NOT NOT x == NOT (NOT x)
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ExpressionResult<Expr> {
        let left = self.parse_primary()?;
        let Some(op) = self.peek_compare_op() else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> ExpressionResult<Expr> {
        let Some(spanned) = self.peek().cloned() else {
            return Err(ExpressionError::parse(
                self.source_len,
                "expression",
                "end of input",
            ));
        };
        self.pos += 1;

        match spanned.token {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::VarRef(path) => Ok(Expr::VarRef(path)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    let (position, got) = self.current_description();
                    return Err(ExpressionError::parse(position, "')'", got));
                }
                Ok(inner)
            }
            other => Err(ExpressionError::parse(
                spanned.position,
                "expression",
                other.describe(),
            )),
        }
    }

    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek_compare_op(&self) -> Option<CompareOp> {
        match self.peek()?.token {
            Token::Eq => Some(CompareOp::Eq),
            Token::Ne => Some(CompareOp::Ne),
            Token::Lt => Some(CompareOp::Lt),
            Token::Gt => Some(CompareOp::Gt),
            Token::Le => Some(CompareOp::Le),
            Token::Ge => Some(CompareOp::Ge),
            _ => None,
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|s| &s.token == token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn current_description(&self) -> (usize, String) {
        match self.peek() {
            Some(s) => (s.position, s.token.describe()),
            None => (self.source_len, "end of input".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(source: &str) -> Expr {
        Parser::new(source).unwrap().parse().unwrap()
    }

    #[test]
    fn precedence_or_below_and() {
        // a OR b AND c == a OR (b AND c)
        let expr = parse("${a} OR ${b} AND ${c}");
        match expr {
            Expr::Or(left, right) => {
                assert_eq!(*left, Expr::VarRef("a".into()));
                assert!(matches!(*right, Expr::And(_, _)));
            }
            other => panic!("expected Or at the root, got {other:?}"),
        }
    }

    #[test]
    fn not_binds_tighter_than_and() {
        // NOT a AND b == (NOT a) AND b
        let expr = parse("NOT ${a} AND ${b}");
        match expr {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Not(_))),
            other => panic!("expected And at the root, got {other:?}"),
        }
    }

    #[test]
    fn not_is_right_associative() {
        let expr = parse("NOT NOT true");
        match expr {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Not(_))),
            other => panic!("expected nested Not, got {other:?}"),
        }
    }

    #[test]
    fn comparison_below_not() {
        // NOT a == b parses as NOT (a == b)
        let expr = parse("NOT ${a} == ${b}");
        match expr {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Compare { .. })),
            other => panic!("expected Not at the root, got {other:?}"),
        }
    }

    #[test]
    fn parens_override_precedence() {
        let expr = parse("(${a} OR ${b}) AND ${c}");
        match expr {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Or(_, _))),
            other => panic!("expected And at the root, got {other:?}"),
        }
    }

    #[test]
    fn literals() {
        assert_eq!(parse("42"), Expr::Literal(json!(42)));
        assert_eq!(parse("-1.5"), Expr::Literal(json!(-1.5)));
        assert_eq!(parse("'hi'"), Expr::Literal(json!("hi")));
        assert_eq!(parse("TRUE"), Expr::Literal(json!(true)));
    }

    #[test]
    fn bare_identifier_is_varref_like() {
        assert_eq!(parse("ready"), Expr::Ident("ready".into()));
    }

    #[test]
    fn spec_dialect_examples() {
        parse("${a} == 10");
        parse("${login.status} == 200 AND ${login.body.success} == true");
        parse("(${a}==1 OR ${b}==2) AND NOT ${c}");
    }

    #[test]
    fn chained_comparison_rejected() {
        let err = Parser::new("1 == 2 == 3").unwrap().parse().unwrap_err();
        match err {
            ExpressionError::Parse { expected, .. } => assert_eq!(expected, "end of input"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_rejected() {
        assert!(Parser::new("").unwrap().parse().is_err());
        assert!(Parser::new("   ").unwrap().parse().is_err());
    }

    #[test]
    fn missing_rparen_rejected() {
        let err = Parser::new("(${a} == 1").unwrap().parse().unwrap_err();
        match err {
            ExpressionError::Parse { expected, .. } => assert_eq!(expected, "')'"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn dangling_operator_rejected() {
        assert!(Parser::new("${a} ==").unwrap().parse().is_err());
        assert!(Parser::new("${a} AND").unwrap().parse().is_err());
    }
}
