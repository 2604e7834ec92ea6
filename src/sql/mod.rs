//! SQL front end
//!
//! Tokenizer, parser and AST for the statement set the engine executes.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::Statement;
pub use lexer::Lexer;
pub use parser::{parse_statement, Parser};
pub use token::Token;
