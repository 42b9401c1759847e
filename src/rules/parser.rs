//! Parser: recursive descent over condition tokens
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparison / `in`,
//! `+ -`, `* / %`, unary minus, primary.

use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{Lexer, Token, TokenKind};
use super::ExpressionError;

/// Bound on nested groups, prefix operators and binary chains along one path
/// of the tree
const MAX_DEPTH: usize = 128;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Parse condition source into an expression tree
    pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
        if input.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self { tokens, pos: 0, depth: 0 };
        let expr = parser.parse_or()?;
        parser.expect(TokenKind::Eof)?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while self.eat(TokenKind::Or) {
            self.descend()?;
            chained += 1;
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        self.ascend(chained);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        let mut chained = 0;
        while self.eat(TokenKind::And) {
            self.descend()?;
            chained += 1;
            let right = self.parse_not()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        self.ascend(chained);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(TokenKind::Not) {
            self.descend()?;
            let operand = self.parse_not()?;
            self.ascend(1);
            return Ok(Expr::unary(UnaryOp::Not, operand));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;

        // `not in`
        if self.peek().kind == TokenKind::Not && self.peek_at(1).kind == TokenKind::In {
            self.pos += 2;
            let right = self.parse_additive()?;
            return Ok(Expr::unary(
                UnaryOp::Not,
                Expr::binary(BinaryOp::In, left, right),
            ));
        }

        let op = match self.peek().kind {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::NotEq,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::LtEq => BinaryOp::LtEq,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::GtEq => BinaryOp::GtEq,
            TokenKind::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;

        // Comparisons do not chain: `a < b < c` is rejected
        if matches!(
            self.peek().kind,
            TokenKind::Eq
                | TokenKind::NotEq
                | TokenKind::Lt
                | TokenKind::LtEq
                | TokenKind::Gt
                | TokenKind::GtEq
                | TokenKind::In
        ) {
            let token = self.peek();
            return Err(ExpressionError::Syntax {
                col: token.col,
                message: format!("comparison operators cannot be chained ('{}')", token.text),
            });
        }

        Ok(Expr::binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        let mut chained = 0;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
        self.ascend(chained);
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        let mut chained = 0;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        self.ascend(chained);
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(TokenKind::Minus) {
            self.descend()?;
            let operand = self.parse_unary()?;
            self.ascend(1);
            return Ok(Expr::unary(UnaryOp::Neg, operand));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::NumberLiteral => parse_number(&token).map(Expr::Literal),
            TokenKind::StringLiteral => Ok(Expr::Literal(Value::String(token.text))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Identifier => {
                let mut segments = vec![token.text];
                while self.eat(TokenKind::Dot) {
                    let segment = self.advance();
                    match segment.kind {
                        TokenKind::Identifier | TokenKind::NumberLiteral => {
                            segments.push(segment.text)
                        }
                        _ => return Err(unexpected("path segment", &segment)),
                    }
                }
                Ok(Expr::Path(segments))
            }
            TokenKind::OpenParen => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(TokenKind::CloseParen)?;
                self.ascend(1);
                Ok(inner)
            }
            TokenKind::OpenBracket => {
                self.descend()?;
                let mut items = Vec::new();
                if !self.eat(TokenKind::CloseBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(TokenKind::Comma) {
                            continue;
                        }
                        self.expect(TokenKind::CloseBracket)?;
                        break;
                    }
                }
                self.ascend(1);
                Ok(Expr::List(items))
            }
            _ => Err(unexpected("expression", &token)),
        }
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::Syntax {
                col: self.peek().col,
                message: "expression nested too deeply".to_string(),
            });
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ExpressionError> {
        if self.peek().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(unexpected(&kind.to_string(), self.peek()))
        }
    }
}

fn parse_number(token: &Token) -> Result<Value, ExpressionError> {
    if let Ok(int) = token.text.parse::<i64>() {
        return Ok(Value::Number(int.into()));
    }
    token
        .text
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Syntax {
            col: token.col,
            message: format!("invalid number '{}'", token.text),
        })
}

fn unexpected(expected: &str, found: &Token) -> ExpressionError {
    if found.kind == TokenKind::Eof {
        return ExpressionError::UnexpectedEof(expected.to_string());
    }
    ExpressionError::UnexpectedToken {
        expected: expected.to_string(),
        found: found.text.clone(),
        col: found.col,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> Expr {
        Expr::Path(p.split('.').map(str::to_string).collect())
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = Parser::parse("a or b and c").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::Or,
                path("a"),
                Expr::binary(BinaryOp::And, path("b"), path("c"))
            )
        );
    }

    #[test]
    fn test_comparison_with_arithmetic() {
        let expr = Parser::parse("amount * 2 > 1000").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::Gt,
                Expr::binary(BinaryOp::Mul, path("amount"), Expr::Literal(json!(2))),
                Expr::Literal(json!(1000))
            )
        );
    }

    #[test]
    fn test_dotted_path_and_list() {
        let expr = Parser::parse("business.customer.tier in ['gold', 'platinum']").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::In,
                path("business.customer.tier"),
                Expr::List(vec![
                    Expr::Literal(json!("gold")),
                    Expr::Literal(json!("platinum"))
                ])
            )
        );
    }

    #[test]
    fn test_not_in() {
        let expr = Parser::parse("region not in [\"eu\"]").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_errors() {
        assert_eq!(Parser::parse("   "), Err(ExpressionError::Empty));
        assert!(matches!(
            Parser::parse("amount >"),
            Err(ExpressionError::UnexpectedEof(_))
        ));
        assert!(matches!(
            Parser::parse("(a == 1"),
            Err(ExpressionError::UnexpectedEof(_))
        ));
        assert!(matches!(
            Parser::parse("a == 1 2"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            Parser::parse("1 < a < 3"),
            Err(ExpressionError::Syntax { .. })
        ));
    }

    fn too_deep(result: Result<Expr, ExpressionError>) -> bool {
        matches!(result, Err(ExpressionError::Syntax { message, .. }) if message.contains("nested too deeply"))
    }

    #[test]
    fn test_deep_nesting_is_rejected_without_overflow() {
        let parens = format!("{}true{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(too_deep(Parser::parse(&parens)));

        let brackets = format!("a in {}1{}", "[".repeat(50_000), "]".repeat(50_000));
        assert!(too_deep(Parser::parse(&brackets)));

        assert!(too_deep(Parser::parse(&format!("{}true", "not ".repeat(100_000)))));
        assert!(too_deep(Parser::parse(&format!("{}1 > 0", "-".repeat(100_000)))));

        let chain = vec!["a == 1"; 10_000].join(" or ");
        assert!(too_deep(Parser::parse(&chain)));
        let sum = vec!["1"; 10_000].join(" + ");
        assert!(too_deep(Parser::parse(&format!("{sum} > 0"))));
    }

    #[test]
    fn test_moderate_nesting_still_parses() {
        let parens = format!("{}a > 1{}", "(".repeat(32), ")".repeat(32));
        assert_eq!(
            Parser::parse(&parens).unwrap(),
            Expr::binary(BinaryOp::Gt, path("a"), Expr::Literal(json!(1)))
        );
        let chain = vec!["a == 1"; 40].join(" or ");
        assert!(Parser::parse(&chain).is_ok());
    }
}
