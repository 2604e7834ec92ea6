//! SQL Lexer (Tokenizer)
//!
//! This module converts SQL strings into a stream of tokens.

use super::token::Token;
use crate::error::{Error, Result};

/// SQL Lexer
pub struct Lexer {
    /// Input characters
    input: Vec<char>,
    /// Current position in input
    position: usize,
}

impl Lexer {
    /// Create a new lexer for the given input
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    /// Get the next token from the input
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        self.skip_comments();
        self.skip_whitespace();

        if self.is_at_end() {
            return Ok(Token::Eof);
        }

        let ch = self.current_char();
        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            ';' => Some(Token::Semicolon),
            '*' => Some(Token::Asterisk),
            '=' => Some(Token::Eq),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '-' => {
                self.advance();
                if !self.is_at_end() && self.current_char().is_ascii_digit() {
                    return match self.read_number()? {
                        Token::IntegerLiteral(n) => Ok(Token::IntegerLiteral(-n)),
                        Token::NumberLiteral(n) => Ok(Token::NumberLiteral(format!("-{}", n))),
                        other => Ok(other),
                    };
                }
                Err(self.unexpected('-', self.position - 1))
            }
            '<' => {
                self.advance();
                match self.peek_current() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::Lte)
                    }
                    Some('>') => {
                        self.advance();
                        Ok(Token::Neq)
                    }
                    _ => Ok(Token::Lt),
                }
            }
            '>' => {
                self.advance();
                if self.peek_current() == Some('=') {
                    self.advance();
                    return Ok(Token::Gte);
                }
                Ok(Token::Gt)
            }
            '!' => {
                self.advance();
                if self.peek_current() == Some('=') {
                    self.advance();
                    return Ok(Token::Neq);
                }
                Err(self.unexpected('!', self.position - 1))
            }
            '\'' => self.read_string().map(Token::StringLiteral),
            '"' => self.read_quoted_identifier(),
            'x' | 'X' if self.peek_char() == Some('\'') => self.read_blob(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(),
            c => Err(self.unexpected(c, self.position)),
        }
    }

    fn unexpected(&self, ch: char, position: usize) -> Error {
        Error::Parse(format!("unexpected character '{}' at position {}", ch, position))
    }

    /// Check if we've reached the end of input
    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    /// Get the current character
    fn current_char(&self) -> char {
        self.input[self.position]
    }

    fn peek_current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    /// Peek at the next character
    fn peek_char(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    /// Advance to the next character
    fn advance(&mut self) {
        self.position += 1;
    }

    /// Skip whitespace characters
    fn skip_whitespace(&mut self) {
        while !self.is_at_end() && self.current_char().is_whitespace() {
            self.advance();
        }
    }

    /// Skip SQL comments (-- and /* */)
    fn skip_comments(&mut self) {
        if self.is_at_end() {
            return;
        }

        // Single line comment: --
        if self.current_char() == '-' && self.peek_char() == Some('-') {
            while !self.is_at_end() && self.current_char() != '\n' {
                self.advance();
            }
            self.skip_whitespace();
            self.skip_comments();
            return;
        }

        // Multi-line comment: /* */
        if self.current_char() == '/' && self.peek_char() == Some('*') {
            self.advance();
            self.advance();
            while !self.is_at_end() {
                if self.current_char() == '*' && self.peek_char() == Some('/') {
                    self.advance();
                    self.advance();
                    break;
                }
                self.advance();
            }
            self.skip_whitespace();
            self.skip_comments();
        }
    }

    /// Read a single-quoted string, `''` escaping a quote
    fn read_string(&mut self) -> Result<String> {
        let start_pos = self.position;
        self.advance();
        let mut value = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch == '\'' {
                if self.peek_char() == Some('\'') {
                    value.push('\'');
                    self.advance();
                    self.advance();
                } else {
                    self.advance();
                    return Ok(value);
                }
            } else {
                value.push(ch);
                self.advance();
            }
        }
        Err(Error::Parse(format!(
            "unterminated string starting at position {}",
            start_pos
        )))
    }

    /// Read `X'0A1B'`
    fn read_blob(&mut self) -> Result<Token> {
        let start_pos = self.position;
        self.advance();
        let digits = self.read_string()?;
        if digits.len() % 2 != 0 {
            return Err(Error::Parse(format!(
                "blob literal at position {} has an odd number of digits",
                start_pos
            )));
        }
        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| {
                Error::Parse(format!(
                    "blob literal at position {} is not hexadecimal",
                    start_pos
                ))
            })?;
        Ok(Token::BlobLiteral(bytes))
    }

    /// Read a quoted identifier (double-quoted)
    fn read_quoted_identifier(&mut self) -> Result<Token> {
        let start_pos = self.position;
        self.advance();
        let mut value = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch == '"' {
                if self.peek_char() == Some('"') {
                    value.push('"');
                    self.advance();
                    self.advance();
                } else {
                    self.advance();
                    return Ok(Token::Identifier(value));
                }
            } else {
                value.push(ch);
                self.advance();
            }
        }
        Err(Error::Parse(format!(
            "unterminated identifier starting at position {}",
            start_pos
        )))
    }

    /// Read a number (integer, or decimal/float kept as text)
    fn read_number(&mut self) -> Result<Token> {
        let start_pos = self.position;
        let mut value = String::new();
        let mut is_fraction = false;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() {
                value.push(ch);
                self.advance();
            } else if ch == '.' && !is_fraction && self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
                is_fraction = true;
                value.push(ch);
                self.advance();
            } else if (ch == 'e' || ch == 'E') && !value.is_empty() {
                is_fraction = true;
                value.push(ch);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek_current() {
                    value.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if is_fraction {
            value
                .parse::<f64>()
                .map_err(|_| Error::Parse(format!("invalid number at position {}", start_pos)))?;
            Ok(Token::NumberLiteral(value))
        } else {
            value
                .parse::<i64>()
                .map(Token::IntegerLiteral)
                .map_err(|_| Error::Parse(format!("invalid number at position {}", start_pos)))
        }
    }

    /// Read an identifier or keyword
    fn read_identifier(&mut self) -> Result<Token> {
        let mut value = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::from_keyword(&value).unwrap_or(Token::Identifier(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let mut lexer = Lexer::new("SELECT * FROM users");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::Asterisk,
                Token::From,
                Token::Identifier("users".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_select_with_where() {
        let mut lexer = Lexer::new("SELECT id, name FROM users WHERE id = -1");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::Identifier("id".to_string()),
                Token::Comma,
                Token::Identifier("name".to_string()),
                Token::From,
                Token::Identifier("users".to_string()),
                Token::Where,
                Token::Identifier("id".to_string()),
                Token::Eq,
                Token::IntegerLiteral(-1),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_escaped_string() {
        let mut lexer = Lexer::new("SELECT 'it''s a test'");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[1], Token::StringLiteral("it's a test".to_string()));
    }

    #[test]
    fn test_comparison_operators() {
        let mut lexer = Lexer::new("a < b <= c > d >= e <> f != g");
        let tokens = lexer.tokenize().unwrap();
        assert!(tokens.contains(&Token::Lt));
        assert!(tokens.contains(&Token::Lte));
        assert!(tokens.contains(&Token::Gt));
        assert!(tokens.contains(&Token::Gte));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Neq).count(), 2);
    }

    #[test]
    fn test_number_literals() {
        let mut lexer = Lexer::new("3.14 2.5e10 42 -0.5");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::NumberLiteral("3.14".to_string()));
        assert_eq!(tokens[1], Token::NumberLiteral("2.5e10".to_string()));
        assert_eq!(tokens[2], Token::IntegerLiteral(42));
        assert_eq!(tokens[3], Token::NumberLiteral("-0.5".to_string()));
    }

    #[test]
    fn test_blob_literal() {
        let mut lexer = Lexer::new("X'0A1b' x");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::BlobLiteral(vec![0x0A, 0x1B]));
        assert_eq!(tokens[1], Token::Identifier("x".to_string()));
        assert!(Lexer::new("X'ABC'").tokenize().is_err());
    }

    #[test]
    fn test_comments() {
        let mut lexer = Lexer::new("SELECT -- this is a comment\n* /* more */ FROM users");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::Asterisk,
                Token::From,
                Token::Identifier("users".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            Lexer::new("SELECT 'abc").tokenize(),
            Err(Error::Parse(_))
        ));
    }
}
