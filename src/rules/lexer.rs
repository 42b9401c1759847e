//! Lexer: tokenizes rule condition expressions
//!
//! Conditions are single expressions such as
//! `amount > 1000 and business.customer.tier == "gold"`.

use super::ExpressionError;

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// The raw text of the token (unescaped for string literals)
    pub text: String,
    /// Column number (1-based)
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            col,
        }
    }
}

/// Token types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    And,
    Or,
    Not,
    In,
    True,
    False,
    Null,

    // Identifiers and literals
    Identifier,
    StringLiteral,
    NumberLiteral,

    // Operators
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Structural
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Comma,
    Dot,

    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::In => "in",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Identifier => "identifier",
            Self::StringLiteral => "string literal",
            Self::NumberLiteral => "number",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::OpenParen => "(",
            Self::CloseParen => ")",
            Self::OpenBracket => "[",
            Self::CloseBracket => "]",
            Self::Comma => ",",
            Self::Dot => ".",
            Self::Eof => "end of input",
        };
        f.write_str(text)
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, "", self.pos + 1));
                break;
            }

            tokens.push(self.next_token()?);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        let ch = self.input[self.pos];
        let col = self.pos + 1;

        let two = |kind: TokenKind, text: &str, lexer: &mut Self| -> Result<Token, ExpressionError> {
            lexer.pos += 2;
            Ok(Token::new(kind, text, col))
        };
        let one = |kind: TokenKind, lexer: &mut Self| -> Result<Token, ExpressionError> {
            lexer.pos += 1;
            Ok(Token::new(kind, ch.to_string(), col))
        };

        match ch {
            '=' if self.peek_at(1) == Some('=') => two(TokenKind::Eq, "==", self),
            '!' if self.peek_at(1) == Some('=') => two(TokenKind::NotEq, "!=", self),
            '<' if self.peek_at(1) == Some('=') => two(TokenKind::LtEq, "<=", self),
            '>' if self.peek_at(1) == Some('=') => two(TokenKind::GtEq, ">=", self),
            '&' if self.peek_at(1) == Some('&') => two(TokenKind::And, "&&", self),
            '|' if self.peek_at(1) == Some('|') => two(TokenKind::Or, "||", self),
            '!' => one(TokenKind::Not, self),
            '<' => one(TokenKind::Lt, self),
            '>' => one(TokenKind::Gt, self),
            '+' => one(TokenKind::Plus, self),
            '-' => one(TokenKind::Minus, self),
            '*' => one(TokenKind::Star, self),
            '/' => one(TokenKind::Slash, self),
            '%' => one(TokenKind::Percent, self),
            '(' => one(TokenKind::OpenParen, self),
            ')' => one(TokenKind::CloseParen, self),
            '[' => one(TokenKind::OpenBracket, self),
            ']' => one(TokenKind::CloseBracket, self),
            ',' => one(TokenKind::Comma, self),
            '.' => one(TokenKind::Dot, self),
            '"' | '\'' => self.read_string_literal(ch),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier_or_keyword()),
            _ => Err(ExpressionError::Syntax {
                col,
                message: format!("unexpected character '{ch}'"),
            }),
        }
    }

    fn read_string_literal(&mut self, quote: char) -> Result<Token, ExpressionError> {
        let col = self.pos + 1;
        self.pos += 1;

        let mut text = String::new();
        loop {
            match self.input.get(self.pos).copied() {
                None => {
                    return Err(ExpressionError::Syntax {
                        col,
                        message: "unterminated string literal".into(),
                    })
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => {
                    let escaped = match self.peek_at(1) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some(other) => other,
                        None => '\\',
                    };
                    text.push(escaped);
                    self.pos += 2;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        Ok(Token::new(TokenKind::StringLiteral, text, col))
    }

    fn read_number(&mut self) -> Result<Token, ExpressionError> {
        let col = self.pos + 1;
        let mut text = String::new();
        let mut seen_dot = false;

        while let Some(c) = self.input.get(self.pos).copied() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
            } else if c == '.'
                && !seen_dot
                && self.peek_at(1).is_some_and(|next| next.is_ascii_digit())
            {
                seen_dot = true;
                text.push(c);
            } else {
                break;
            }
            self.pos += 1;
        }

        if self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_alphabetic() || *c == '_')
        {
            return Err(ExpressionError::Syntax {
                col,
                message: format!("malformed number '{text}'"),
            });
        }

        Ok(Token::new(TokenKind::NumberLiteral, text, col))
    }

    fn read_identifier_or_keyword(&mut self) -> Token {
        let col = self.pos + 1;
        let mut text = String::new();

        while let Some(c) = self.input.get(self.pos).copied() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }

        let kind = match text.as_str() {
            "and" | "AND" => TokenKind::And,
            "or" | "OR" => TokenKind::Or,
            "not" | "NOT" => TokenKind::Not,
            "in" | "IN" => TokenKind::In,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Identifier,
        };

        Token::new(kind, text, col)
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_comparison_tokens() {
        assert_eq!(
            kinds("amount >= 1000"),
            vec![
                TokenKind::Identifier,
                TokenKind::GtEq,
                TokenKind::NumberLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_symbolic_and_keyword_logic() {
        assert_eq!(kinds("a && b"), kinds("a and b"));
        assert_eq!(kinds("!a"), kinds("not a"));
    }

    #[test]
    fn test_string_literal_escapes() {
        let tokens = Lexer::new(r#"name == 'O\'Brien'"#).tokenize().unwrap();
        assert_eq!(tokens[2].kind, TokenKind::StringLiteral);
        assert_eq!(tokens[2].text, "O'Brien");
    }

    #[test]
    fn test_decimal_number() {
        let tokens = Lexer::new("ratio < 0.75").tokenize().unwrap();
        assert_eq!(tokens[2].text, "0.75");
    }

    #[test]
    fn test_unterminated_string_reports_column() {
        let err = Lexer::new("status == \"open").tokenize().unwrap_err();
        assert_eq!(
            err,
            ExpressionError::Syntax {
                col: 11,
                message: "unterminated string literal".into()
            }
        );
    }

    #[test]
    fn test_unexpected_character() {
        assert!(Lexer::new("a ? b").tokenize().is_err());
    }
}
