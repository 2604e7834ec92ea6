//! SQL Parser
//!
//! This module parses SQL tokens into an AST. The grammar is deliberately
//! narrow: single-table statements, and WHERE predicates that compare a
//! column with a literal.

use super::ast::*;
use super::lexer::Lexer;
use super::token::Token;
use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::transaction::IsolationLevel;

/// SQL Parser
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

/// Parse exactly one statement.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let mut parser = Parser::new(sql)?;
    let stmt = parser.parse()?;
    if !parser.is_at_end() {
        return Err(parser.unexpected("end of statement"));
    }
    Ok(stmt)
}

impl Parser {
    /// Create a new parser from a SQL string
    pub fn new(sql: &str) -> Result<Self> {
        let mut lexer = Lexer::new(sql);
        let tokens = lexer.tokenize()?;

        Ok(Self {
            tokens,
            position: 0,
        })
    }

    /// Parse a single SQL statement
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.parse_statement()?;

        // Consume optional semicolon
        if self.check(&Token::Semicolon) {
            self.advance();
        }

        Ok(stmt)
    }

    /// Parse multiple SQL statements
    pub fn parse_all(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();

        while !self.is_at_end() {
            if self.check(&Token::Semicolon) {
                self.advance();
                continue;
            }
            statements.push(self.parse()?);
        }

        Ok(statements)
    }

    /// Parse a single statement
    fn parse_statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select => self.parse_select().map(Statement::Select),
            Token::Insert => self.parse_insert().map(Statement::Insert),
            Token::Update => self.parse_update().map(Statement::Update),
            Token::Delete => self.parse_delete().map(Statement::Delete),
            Token::Create => self.parse_create(),
            Token::Drop => self.parse_drop(),
            Token::Begin => self.parse_begin(),
            Token::Commit => {
                self.advance();
                self.skip_transaction_keyword();
                Ok(Statement::Commit)
            }
            Token::Rollback => {
                self.advance();
                self.skip_transaction_keyword();
                Ok(Statement::Rollback)
            }
            Token::Explain => {
                self.advance();
                let inner = self.parse_statement()?;
                if matches!(inner, Statement::Explain(_)) {
                    return Err(Error::Parse("EXPLAIN cannot be nested".to_string()));
                }
                Ok(Statement::Explain(Box::new(inner)))
            }
            Token::Vacuum => {
                self.advance();
                Ok(Statement::Vacuum(self.optional_identifier()))
            }
            Token::Analyze => {
                self.advance();
                Ok(Statement::Analyze(self.optional_identifier()))
            }
            _ => Err(self.unexpected(
                "SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, BEGIN, COMMIT, ROLLBACK, EXPLAIN, VACUUM, or ANALYZE",
            )),
        }
    }

    // ========== SELECT Statement ==========

    fn parse_select(&mut self) -> Result<SelectStatement> {
        self.expect(&Token::Select)?;

        // Select list
        let projection = if self.check(&Token::Asterisk) {
            self.advance();
            Projection::All
        } else {
            Projection::Columns(self.parse_identifier_list()?)
        };

        self.expect(&Token::From)?;
        let from = self.expect_identifier()?;
        self.reject_unsupported()?;

        // WHERE clause
        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.reject_unsupported()?;

        // ORDER BY clause
        let mut order_by = Vec::new();
        if self.check(&Token::Order) {
            self.advance();
            self.expect(&Token::By)?;
            order_by = self.parse_order_by_list()?;
        }

        // LIMIT / OFFSET clauses
        let mut limit = None;
        let mut offset = None;
        if self.check(&Token::Limit) {
            self.advance();
            limit = Some(self.expect_count("LIMIT")?);
        }
        if self.check(&Token::Offset) {
            self.advance();
            offset = Some(self.expect_count("OFFSET")?);
        }

        Ok(SelectStatement {
            projection,
            from,
            where_clause,
            order_by,
            limit,
            offset,
        })
    }

    /// Joins and grouping are recognised so they fail clearly.
    fn reject_unsupported(&self) -> Result<()> {
        match self.current() {
            Token::Join | Token::Inner | Token::Left | Token::Right | Token::Cross | Token::Comma => {
                Err(Error::Unsupported("JOIN".to_string()))
            }
            Token::Group => Err(Error::Unsupported("GROUP BY".to_string())),
            Token::Having => Err(Error::Unsupported("HAVING".to_string())),
            _ => Ok(()),
        }
    }

    fn parse_order_by_list(&mut self) -> Result<Vec<OrderByItem>> {
        let mut items = Vec::new();

        loop {
            let column = self.expect_identifier()?;
            let ascending = if self.check(&Token::Desc) {
                self.advance();
                false
            } else {
                if self.check(&Token::Asc) {
                    self.advance();
                }
                true
            };
            items.push(OrderByItem { column, ascending });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        Ok(items)
    }

    // ========== INSERT Statement ==========

    fn parse_insert(&mut self) -> Result<InsertStatement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;

        let table = self.expect_identifier()?;

        // Optional column list
        let columns = if self.check(&Token::LParen) {
            self.advance();
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Token::Values)?;

        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_literal()?);
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
            self.expect(&Token::RParen)?;
            rows.push(row);

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        Ok(InsertStatement {
            table,
            columns,
            rows,
        })
    }

    // ========== UPDATE Statement ==========

    fn parse_update(&mut self) -> Result<UpdateStatement> {
        self.expect(&Token::Update)?;

        let table = self.expect_identifier()?;

        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_literal()?;
            assignments.push(Assignment { column, value });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(UpdateStatement {
            table,
            assignments,
            where_clause,
        })
    }

    // ========== DELETE Statement ==========

    fn parse_delete(&mut self) -> Result<DeleteStatement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;

        let table = self.expect_identifier()?;

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(DeleteStatement {
            table,
            where_clause,
        })
    }

    // ========== CREATE Statement ==========

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(&Token::Create)?;

        match self.current() {
            Token::Table => self.parse_create_table().map(Statement::CreateTable),
            Token::Index => self.parse_create_index(false).map(Statement::CreateIndex),
            Token::Unique => {
                self.advance();
                self.parse_create_index(true).map(Statement::CreateIndex)
            }
            _ => Err(self.unexpected("TABLE, INDEX or UNIQUE INDEX")),
        }
    }

    fn parse_if_not_exists(&mut self) -> Result<bool> {
        if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Not)?;
            self.expect(&Token::Exists)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStatement> {
        self.expect(&Token::Table)?;

        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.expect_identifier()?;

        self.expect(&Token::LParen)?;

        let mut columns = Vec::new();
        let mut constraints = Vec::new();

        loop {
            if self.check(&Token::Primary) || self.check(&Token::Unique) {
                constraints.push(self.parse_table_constraint()?);
            } else {
                columns.push(self.parse_column_def()?);
            }

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        self.expect(&Token::RParen)?;

        Ok(CreateTableStatement {
            name,
            if_not_exists,
            columns,
            constraints,
        })
    }

    fn parse_create_index(&mut self, unique: bool) -> Result<CreateIndexStatement> {
        self.expect(&Token::Index)?;

        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.expect_identifier()?;

        self.expect(&Token::On)?;
        let table = self.expect_identifier()?;

        self.expect(&Token::LParen)?;
        let columns = self.parse_identifier_list()?;
        self.expect(&Token::RParen)?;

        Ok(CreateIndexStatement {
            name,
            table,
            columns,
            unique,
            if_not_exists,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_identifier()?;
        let data_type = self.parse_data_type()?;

        let mut col = ColumnDef {
            name,
            data_type,
            not_null: false,
            primary_key: false,
            unique: false,
            default: None,
        };

        // Column constraints
        loop {
            match self.current() {
                Token::Not => {
                    self.advance();
                    self.expect(&Token::Null)?;
                    col.not_null = true;
                }
                Token::Null => {
                    self.advance();
                }
                Token::Primary => {
                    self.advance();
                    self.expect(&Token::Key)?;
                    col.primary_key = true;
                }
                Token::Unique => {
                    self.advance();
                    col.unique = true;
                }
                Token::Default => {
                    self.advance();
                    col.default = Some(self.parse_literal()?);
                }
                _ => break,
            }
        }

        Ok(col)
    }

    /// Type names are identifiers; a length such as `VARCHAR(100)` is
    /// accepted and ignored.
    fn parse_data_type(&mut self) -> Result<DataType> {
        let name = self.expect_identifier()?;
        let data_type = DataType::from_sql_name(&name)?;
        if self.check(&Token::LParen) {
            self.advance();
            self.expect_count("type length")?;
            if self.check(&Token::Comma) {
                self.advance();
                self.expect_count("type scale")?;
            }
            self.expect(&Token::RParen)?;
        }
        Ok(data_type)
    }

    fn parse_table_constraint(&mut self) -> Result<TableConstraint> {
        let constraint = if self.check(&Token::Primary) {
            self.advance();
            self.expect(&Token::Key)?;
            self.expect(&Token::LParen)?;
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            TableConstraint::PrimaryKey(cols)
        } else {
            self.expect(&Token::Unique)?;
            self.expect(&Token::LParen)?;
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            TableConstraint::Unique(cols)
        };
        Ok(constraint)
    }

    // ========== DROP Statement ==========

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect(&Token::Drop)?;
        let index = if self.check(&Token::Index) {
            self.advance();
            true
        } else {
            self.expect(&Token::Table)?;
            false
        };

        let if_exists = if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };

        let name = self.expect_identifier()?;
        Ok(if index {
            Statement::DropIndex(DropIndexStatement { name, if_exists })
        } else {
            Statement::DropTable(DropTableStatement { name, if_exists })
        })
    }

    // ========== Transactions ==========

    fn parse_begin(&mut self) -> Result<Statement> {
        self.expect(&Token::Begin)?;
        self.skip_transaction_keyword();

        if !self.check_word("ISOLATION") {
            return Ok(Statement::Begin(None));
        }
        self.advance();
        self.expect_word("LEVEL")?;

        let level = if self.check_word("READ") {
            self.advance();
            self.expect_word("COMMITTED")?;
            IsolationLevel::ReadCommitted
        } else if self.check_word("REPEATABLE") {
            self.advance();
            self.expect_word("READ")?;
            IsolationLevel::RepeatableRead
        } else if self.check_word("SNAPSHOT") {
            self.advance();
            IsolationLevel::Snapshot
        } else if self.check_word("SERIALIZABLE") {
            self.advance();
            IsolationLevel::Serializable
        } else {
            return Err(self.unexpected("isolation level"));
        };
        Ok(Statement::Begin(Some(level)))
    }

    fn skip_transaction_keyword(&mut self) {
        if self.check(&Token::Transaction) {
            self.advance();
        }
    }

    // ========== Expressions ==========

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and_expr()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expr()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_not_expr()?;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_comparison_expr()
    }

    /// `col op literal`, `literal op col`, `col IS [NOT] NULL`, or a
    /// parenthesised predicate.
    fn parse_comparison_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::LParen) {
            self.advance();
            let expr = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(expr);
        }

        if self.is_literal_start() {
            let value = self.parse_literal()?;
            let op = self.parse_compare_op()?;
            let column = self.expect_identifier()?;
            return Ok(Expr::Compare {
                column,
                op: op.flip(),
                value,
            });
        }

        let column = self.expect_identifier()?;

        if self.check(&Token::Is) {
            self.advance();
            let negated = if self.check(&Token::Not) {
                self.advance();
                true
            } else {
                false
            };
            self.expect(&Token::Null)?;
            return Ok(Expr::IsNull { column, negated });
        }

        let op = self.parse_compare_op()?;
        if let Token::Identifier(_) = self.current() {
            if !self.is_literal_start() {
                return Err(Error::Unsupported(
                    "comparisons between two columns".to_string(),
                ));
            }
        }
        let value = self.parse_literal()?;
        Ok(Expr::Compare { column, op, value })
    }

    fn parse_compare_op(&mut self) -> Result<CompareOp> {
        let op = match self.current() {
            Token::Eq => CompareOp::Eq,
            Token::Neq => CompareOp::NotEq,
            Token::Lt => CompareOp::Lt,
            Token::Lte => CompareOp::LtEq,
            Token::Gt => CompareOp::Gt,
            Token::Gte => CompareOp::GtEq,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.advance();
        Ok(op)
    }

    fn is_literal_start(&self) -> bool {
        match self.current() {
            Token::IntegerLiteral(_)
            | Token::NumberLiteral(_)
            | Token::StringLiteral(_)
            | Token::BlobLiteral(_)
            | Token::Null
            | Token::True
            | Token::False => true,
            Token::Identifier(word) => {
                is_typed_literal_prefix(word) && matches!(self.peek(), Some(Token::StringLiteral(_)))
            }
            _ => false,
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let literal = match self.current().clone() {
            Token::IntegerLiteral(n) => Literal::Integer(n),
            Token::NumberLiteral(n) => Literal::Number(n),
            Token::StringLiteral(s) => Literal::String(s),
            Token::BlobLiteral(b) => Literal::Blob(b),
            Token::Null => Literal::Null,
            Token::True => Literal::Bool(true),
            Token::False => Literal::Bool(false),
            Token::Identifier(word) if is_typed_literal_prefix(&word) => {
                self.advance();
                let text = match self.current().clone() {
                    Token::StringLiteral(s) => s,
                    _ => return Err(self.unexpected("string after type name")),
                };
                match word.to_ascii_uppercase().as_str() {
                    "DATE" => Literal::Date(text),
                    "TIME" => Literal::Time(text),
                    _ => Literal::Timestamp(text),
                }
            }
            _ => return Err(self.unexpected("literal")),
        };
        self.advance();
        Ok(literal)
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.expect_identifier()?];

        while self.check(&Token::Comma) {
            self.advance();
            names.push(self.expect_identifier()?);
        }

        Ok(names)
    }

    // ========== Helper Methods ==========

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    /// Non-reserved word written as an identifier
    fn check_word(&self, word: &str) -> bool {
        matches!(self.current(), Token::Identifier(w) if w.eq_ignore_ascii_case(word))
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&token.to_string()))
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.check_word(word) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(word))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn optional_identifier(&mut self) -> Option<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Some(name)
            }
            _ => None,
        }
    }

    /// Non-negative integer (LIMIT, OFFSET, type length)
    fn expect_count(&mut self, what: &str) -> Result<u64> {
        match self.current() {
            Token::IntegerLiteral(n) if *n >= 0 => {
                let n = *n as u64;
                self.advance();
                Ok(n)
            }
            _ => Err(self.unexpected(&format!("non-negative integer for {}", what))),
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::Parse(format!("expected {}, found {}", expected, self.current()))
    }
}

fn is_typed_literal_prefix(word: &str) -> bool {
    ["DATE", "TIME", "TIMESTAMP"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Statement {
        parse_statement(sql).unwrap()
    }

    #[test]
    fn test_parse_simple_select() {
        match parse("SELECT * FROM users") {
            Statement::Select(s) => {
                assert_eq!(s.projection, Projection::All);
                assert_eq!(s.from, "users");
                assert!(s.where_clause.is_none());
            }
            _ => panic!("Expected SELECT statement"),
        }
    }

    #[test]
    fn test_parse_select_with_clauses() {
        let stmt = parse(
            "SELECT id, name FROM users WHERE age >= 30 AND age < 40 ORDER BY age DESC, id LIMIT 10 OFFSET 5",
        );
        match stmt {
            Statement::Select(s) => {
                assert_eq!(
                    s.projection,
                    Projection::Columns(vec!["id".into(), "name".into()])
                );
                assert!(matches!(s.where_clause, Some(Expr::And(_, _))));
                assert_eq!(s.order_by.len(), 2);
                assert!(!s.order_by[0].ascending);
                assert!(s.order_by[1].ascending);
                assert_eq!(s.limit, Some(10));
                assert_eq!(s.offset, Some(5));
            }
            _ => panic!("Expected SELECT statement"),
        }
    }

    #[test]
    fn test_literal_on_left_flips_operator() {
        match parse("SELECT * FROM t WHERE 5 < x") {
            Statement::Select(s) => assert_eq!(
                s.where_clause,
                Some(Expr::Compare {
                    column: "x".into(),
                    op: CompareOp::Gt,
                    value: Literal::Integer(5),
                })
            ),
            _ => panic!("Expected SELECT statement"),
        }
    }

    #[test]
    fn test_parse_predicates() {
        match parse("DELETE FROM t WHERE NOT (a IS NULL OR b IS NOT NULL) AND d = DATE '2024-01-02'") {
            Statement::Delete(d) => {
                let text = d.where_clause.unwrap().to_string();
                assert_eq!(
                    text,
                    "(NOT (a IS NULL OR b IS NOT NULL) AND d = DATE '2024-01-02')"
                );
            }
            _ => panic!("Expected DELETE statement"),
        }
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = parse(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name VARCHAR(100) NOT NULL,
                email VARCHAR(255) UNIQUE,
                age INTEGER DEFAULT -1,
                UNIQUE (name, age)
            )",
        );
        match stmt {
            Statement::CreateTable(ct) => {
                assert!(ct.if_not_exists);
                assert_eq!(ct.name, "users");
                assert_eq!(ct.columns.len(), 4);
                assert!(ct.columns[0].primary_key);
                assert!(ct.columns[1].not_null);
                assert!(ct.columns[2].unique);
                assert_eq!(ct.columns[3].default, Some(Literal::Integer(-1)));
                assert_eq!(
                    ct.constraints,
                    vec![TableConstraint::Unique(vec!["name".into(), "age".into()])]
                );
            }
            _ => panic!("Expected CREATE TABLE statement"),
        }
    }

    #[test]
    fn test_parse_composite_primary_key() {
        match parse("CREATE TABLE t (a INT, b TEXT, PRIMARY KEY (a, b))") {
            Statement::CreateTable(ct) => assert_eq!(
                ct.constraints,
                vec![TableConstraint::PrimaryKey(vec!["a".into(), "b".into()])]
            ),
            _ => panic!("Expected CREATE TABLE statement"),
        }
    }

    #[test]
    fn test_parse_create_index() {
        match parse("CREATE UNIQUE INDEX idx_age ON users (age, id)") {
            Statement::CreateIndex(ci) => {
                assert!(ci.unique);
                assert_eq!(ci.name, "idx_age");
                assert_eq!(ci.table, "users");
                assert_eq!(ci.columns, vec!["age".to_string(), "id".to_string()]);
            }
            _ => panic!("Expected CREATE INDEX statement"),
        }
    }

    #[test]
    fn test_parse_insert() {
        match parse("INSERT INTO users (id, name) VALUES (1, 'Alice'), (2, NULL)") {
            Statement::Insert(i) => {
                assert_eq!(i.table, "users");
                assert_eq!(i.columns.as_ref().map(|c| c.len()), Some(2));
                assert_eq!(i.rows.len(), 2);
                assert_eq!(i.rows[1][1], Literal::Null);
            }
            _ => panic!("Expected INSERT statement"),
        }
    }

    #[test]
    fn test_parse_update() {
        match parse("UPDATE users SET name = 'Bob', age = 31 WHERE id = 1") {
            Statement::Update(u) => {
                assert_eq!(u.table, "users");
                assert_eq!(u.assignments.len(), 2);
                assert!(u.where_clause.is_some());
            }
            _ => panic!("Expected UPDATE statement"),
        }
    }

    #[test]
    fn test_parse_utility_statements() {
        assert_eq!(parse("BEGIN"), Statement::Begin(None));
        assert_eq!(
            parse("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Statement::Begin(Some(IsolationLevel::RepeatableRead))
        );
        assert_eq!(
            parse("begin isolation level read committed;"),
            Statement::Begin(Some(IsolationLevel::ReadCommitted))
        );
        assert_eq!(parse("COMMIT"), Statement::Commit);
        assert_eq!(parse("ROLLBACK TRANSACTION"), Statement::Rollback);
        assert_eq!(parse("VACUUM"), Statement::Vacuum(None));
        assert_eq!(parse("ANALYZE users"), Statement::Analyze(Some("users".into())));
        assert_eq!(
            parse("DROP TABLE IF EXISTS users"),
            Statement::DropTable(DropTableStatement {
                name: "users".into(),
                if_exists: true
            })
        );
        assert_eq!(
            parse("DROP INDEX idx_age"),
            Statement::DropIndex(DropIndexStatement {
                name: "idx_age".into(),
                if_exists: false
            })
        );
        assert_eq!(
            parse("drop index if exists idx_age;"),
            Statement::DropIndex(DropIndexStatement {
                name: "idx_age".into(),
                if_exists: true
            })
        );
        assert!(matches!(parse("EXPLAIN SELECT * FROM t"), Statement::Explain(_)));
    }

    #[test]
    fn test_unsupported_and_invalid() {
        assert!(matches!(
            parse_statement("SELECT * FROM a JOIN b ON a.id = b.id"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            parse_statement("SELECT * FROM a, b"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            parse_statement("SELECT * FROM a GROUP BY x"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            parse_statement("SELECT * FROM a WHERE x = y"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(parse_statement("SELECT FROM"), Err(Error::Parse(_))));
        assert!(matches!(
            parse_statement("SELECT * FROM t LIMIT -1"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            parse_statement("SELECT * FROM t extra"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_parse_all() {
        let mut parser = Parser::new("BEGIN; INSERT INTO t VALUES (1);; COMMIT;").unwrap();
        let stmts = parser.parse_all().unwrap();
        assert_eq!(stmts.len(), 3);
    }
}
