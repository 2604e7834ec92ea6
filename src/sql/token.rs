//! SQL Token definitions
//!
//! This module defines all tokens that can appear in SQL statements. Type
//! names are plain identifiers; the parser resolves them.

use std::fmt;

/// SQL Token types
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // ========== Keywords ==========
    // DDL Keywords
    Create,
    Drop,
    Table,
    Index,

    // DML Keywords
    Select,
    Insert,
    Update,
    Delete,
    Into,
    Values,
    Set,
    From,
    Where,

    // Clauses
    And,
    Or,
    Not,
    Is,
    On,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    Offset,

    // Recognised only to be rejected
    Join,
    Inner,
    Left,
    Right,
    Cross,
    Group,
    Having,

    // Constraints
    Primary,
    Key,
    Unique,
    Default,
    Null,
    If,
    Exists,

    // Boolean Literals
    True,
    False,

    // Utility statements
    Begin,
    Commit,
    Rollback,
    Transaction,
    Explain,
    Vacuum,
    Analyze,

    // ========== Literals ==========
    /// Integer literal
    IntegerLiteral(i64),
    /// Number with a fraction or exponent, kept as written
    NumberLiteral(String),
    /// String literal (single-quoted)
    StringLiteral(String),
    /// Blob literal (X'..')
    BlobLiteral(Vec<u8>),
    /// Identifier (table name, column name, etc.)
    Identifier(String),

    // ========== Operators ==========
    /// =
    Eq,
    /// <> or !=
    Neq,
    /// <
    Lt,
    /// >
    Gt,
    /// <=
    Lte,
    /// >=
    Gte,
    /// *
    Asterisk,

    // ========== Delimiters ==========
    /// (
    LParen,
    /// )
    RParen,
    /// ,
    Comma,
    /// .
    Dot,
    /// ;
    Semicolon,

    // ========== Special ==========
    /// End of input
    Eof,
}

impl Token {
    /// Try to parse a keyword from a string
    pub fn from_keyword(s: &str) -> Option<Token> {
        let token = match s.to_ascii_uppercase().as_str() {
            "CREATE" => Token::Create,
            "DROP" => Token::Drop,
            "TABLE" => Token::Table,
            "INDEX" => Token::Index,

            "SELECT" => Token::Select,
            "INSERT" => Token::Insert,
            "UPDATE" => Token::Update,
            "DELETE" => Token::Delete,
            "INTO" => Token::Into,
            "VALUES" => Token::Values,
            "SET" => Token::Set,
            "FROM" => Token::From,
            "WHERE" => Token::Where,

            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "IS" => Token::Is,
            "ON" => Token::On,
            "ORDER" => Token::Order,
            "BY" => Token::By,
            "ASC" => Token::Asc,
            "DESC" => Token::Desc,
            "LIMIT" => Token::Limit,
            "OFFSET" => Token::Offset,

            "JOIN" => Token::Join,
            "INNER" => Token::Inner,
            "LEFT" => Token::Left,
            "RIGHT" => Token::Right,
            "CROSS" => Token::Cross,
            "GROUP" => Token::Group,
            "HAVING" => Token::Having,

            "PRIMARY" => Token::Primary,
            "KEY" => Token::Key,
            "UNIQUE" => Token::Unique,
            "DEFAULT" => Token::Default,
            "NULL" => Token::Null,
            "IF" => Token::If,
            "EXISTS" => Token::Exists,

            "TRUE" => Token::True,
            "FALSE" => Token::False,

            "BEGIN" => Token::Begin,
            "COMMIT" => Token::Commit,
            "ROLLBACK" => Token::Rollback,
            "TRANSACTION" => Token::Transaction,
            "EXPLAIN" => Token::Explain,
            "VACUUM" => Token::Vacuum,
            "ANALYZE" => Token::Analyze,

            _ => return None,
        };
        Some(token)
    }

    /// Check if this token is a keyword
    pub fn is_keyword(&self) -> bool {
        !matches!(
            self,
            Token::IntegerLiteral(_)
                | Token::NumberLiteral(_)
                | Token::StringLiteral(_)
                | Token::BlobLiteral(_)
                | Token::Identifier(_)
                | Token::Eq
                | Token::Neq
                | Token::Lt
                | Token::Gt
                | Token::Lte
                | Token::Gte
                | Token::Asterisk
                | Token::LParen
                | Token::RParen
                | Token::Comma
                | Token::Dot
                | Token::Semicolon
                | Token::Eof
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Create => write!(f, "CREATE"),
            Token::Drop => write!(f, "DROP"),
            Token::Table => write!(f, "TABLE"),
            Token::Index => write!(f, "INDEX"),
            Token::Select => write!(f, "SELECT"),
            Token::Insert => write!(f, "INSERT"),
            Token::Update => write!(f, "UPDATE"),
            Token::Delete => write!(f, "DELETE"),
            Token::Into => write!(f, "INTO"),
            Token::Values => write!(f, "VALUES"),
            Token::Set => write!(f, "SET"),
            Token::From => write!(f, "FROM"),
            Token::Where => write!(f, "WHERE"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::Is => write!(f, "IS"),
            Token::On => write!(f, "ON"),
            Token::Order => write!(f, "ORDER"),
            Token::By => write!(f, "BY"),
            Token::Asc => write!(f, "ASC"),
            Token::Desc => write!(f, "DESC"),
            Token::Limit => write!(f, "LIMIT"),
            Token::Offset => write!(f, "OFFSET"),
            Token::Join => write!(f, "JOIN"),
            Token::Inner => write!(f, "INNER"),
            Token::Left => write!(f, "LEFT"),
            Token::Right => write!(f, "RIGHT"),
            Token::Cross => write!(f, "CROSS"),
            Token::Group => write!(f, "GROUP"),
            Token::Having => write!(f, "HAVING"),
            Token::Primary => write!(f, "PRIMARY"),
            Token::Key => write!(f, "KEY"),
            Token::Unique => write!(f, "UNIQUE"),
            Token::Default => write!(f, "DEFAULT"),
            Token::Null => write!(f, "NULL"),
            Token::If => write!(f, "IF"),
            Token::Exists => write!(f, "EXISTS"),
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
            Token::Begin => write!(f, "BEGIN"),
            Token::Commit => write!(f, "COMMIT"),
            Token::Rollback => write!(f, "ROLLBACK"),
            Token::Transaction => write!(f, "TRANSACTION"),
            Token::Explain => write!(f, "EXPLAIN"),
            Token::Vacuum => write!(f, "VACUUM"),
            Token::Analyze => write!(f, "ANALYZE"),
            Token::IntegerLiteral(n) => write!(f, "{}", n),
            Token::NumberLiteral(n) => write!(f, "{}", n),
            Token::StringLiteral(s) => write!(f, "'{}'", s),
            Token::BlobLiteral(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{:02X}", byte)?;
                }
                write!(f, "'")
            }
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "="),
            Token::Neq => write!(f, "<>"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Lte => write!(f, "<="),
            Token::Gte => write!(f, ">="),
            Token::Asterisk => write!(f, "*"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
            Token::Semicolon => write!(f, ";"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert_eq!(Token::from_keyword("select"), Some(Token::Select));
        assert_eq!(Token::from_keyword("Vacuum"), Some(Token::Vacuum));
        assert_eq!(Token::from_keyword("users"), None);
        assert!(Token::Select.is_keyword());
        assert!(!Token::Identifier("x".to_string()).is_keyword());
    }
}
