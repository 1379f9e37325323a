//! SQL parser
//!
//! Recursive-descent parser from tokens to the statement tree. On a syntax
//! error the parse returns `Err`; the executor reports it and nothing else
//! happens.

use super::ast::*;
use super::lexer::Lexer;
use super::token::Token;
use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::storage::tuple::Value;

/// SQL parser
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    /// Create a new parser from a SQL string
    pub fn new(sql: &str) -> Result<Self> {
        let tokens = Lexer::new(sql).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    /// Parse a single SQL statement
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.parse_statement()?;
        if self.check(&Token::Semicolon) {
            self.advance();
        }
        Ok(stmt)
    }

    /// Parse every statement in the input
    pub fn parse_all(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.parse()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select => self.parse_select().map(Statement::Select),
            Token::Insert => self.parse_insert().map(Statement::Insert),
            Token::Update => self.parse_update().map(Statement::Update),
            Token::Delete => self.parse_delete().map(Statement::Delete),
            Token::Create => self.parse_create(),
            Token::Drop => self.parse_drop(),
            Token::Begin => self.parse_transaction_control(Statement::Begin),
            Token::Commit => self.parse_transaction_control(Statement::Commit),
            Token::Rollback => self.parse_transaction_control(Statement::Rollback),
            _ => Err(Error::UnexpectedToken {
                expected: "SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, BEGIN, COMMIT, or ROLLBACK"
                    .to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    // ========== SELECT ==========

    fn parse_select(&mut self) -> Result<SelectStatement> {
        self.expect(&Token::Select)?;

        let mut stmt = SelectStatement::default();

        if self.check(&Token::Distinct) {
            self.advance();
            stmt.distinct = true;
        } else if self.check(&Token::All) && self.peek() != Some(&Token::From) {
            // SELECT ALL is the default; bare ALL before FROM stays a column
            self.advance();
        }

        stmt.columns = self.parse_projection_list()?;

        self.expect(&Token::From)?;
        stmt.from = self.expect_identifier()?;

        if self.check(&Token::Where) {
            self.advance();
            stmt.where_clause = Some(self.parse_expr()?);
        }

        if self.check(&Token::Group) {
            self.advance();
            self.expect(&Token::By)?;
            stmt.group_by = self.parse_expr_list()?;
        }

        if self.check(&Token::Having) {
            self.advance();
            stmt.having = Some(self.parse_expr()?);
        }

        if self.check(&Token::Order) {
            self.advance();
            self.expect(&Token::By)?;
            stmt.order_by = self.parse_order_by_list()?;
        }

        if self.check(&Token::Limit) {
            self.advance();
            stmt.limit = Some(self.expect_unsigned()?);
        }

        if self.check(&Token::Offset) {
            self.advance();
            stmt.offset = Some(self.expect_unsigned()?);
        }

        Ok(stmt)
    }

    fn parse_projection_list(&mut self) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.check(&Token::Asterisk) {
                self.advance();
                items.push(Expr::Wildcard);
            } else {
                items.push(self.parse_expr()?);
            }
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    fn parse_order_by_list(&mut self) -> Result<Vec<OrderByItem>> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let ascending = if self.check(&Token::Desc) {
                self.advance();
                false
            } else {
                if self.check(&Token::Asc) {
                    self.advance();
                }
                true
            };
            items.push(OrderByItem { expr, ascending });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    // ========== INSERT ==========

    fn parse_insert(&mut self) -> Result<InsertStatement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;

        let table_name = self.expect_identifier()?;

        let columns = if self.check(&Token::LParen) {
            self.advance();
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Token::Values)?;

        let mut values = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let row = self.parse_expr_list()?;
            self.expect(&Token::RParen)?;
            values.push(row);

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        Ok(InsertStatement {
            table_name,
            columns,
            values,
        })
    }

    // ========== UPDATE ==========

    fn parse_update(&mut self) -> Result<UpdateStatement> {
        self.expect(&Token::Update)?;
        let table_name = self.expect_identifier()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_expr()?;
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
            table_name,
            assignments,
            where_clause,
        })
    }

    // ========== DELETE ==========

    fn parse_delete(&mut self) -> Result<DeleteStatement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;

        let table_name = self.expect_identifier()?;

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(DeleteStatement {
            table_name,
            where_clause,
        })
    }

    // ========== CREATE ==========

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(&Token::Create)?;
        match self.current() {
            Token::Table => self.parse_create_table().map(Statement::CreateTable),
            Token::Index | Token::Unique => self.parse_create_index().map(Statement::CreateIndex),
            _ => Err(Error::UnexpectedToken {
                expected: "TABLE or INDEX".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStatement> {
        self.expect(&Token::Table)?;

        let if_not_exists = if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Not)?;
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };

        let table_name = self.expect_identifier()?;
        self.expect(&Token::LParen)?;

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column_def()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(&Token::RParen)?;

        Ok(CreateTableStatement {
            table_name,
            columns,
            if_not_exists,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_identifier()?;
        let data_type = self.parse_data_type()?;

        let mut not_null = false;
        let mut primary_key = false;
        let mut unique = false;

        loop {
            if self.check(&Token::Not) {
                self.advance();
                self.expect(&Token::Null)?;
                not_null = true;
            } else if self.check(&Token::Null) {
                self.advance();
            } else if self.check(&Token::Primary) {
                self.advance();
                self.expect(&Token::Key)?;
                primary_key = true;
                not_null = true;
            } else if self.check(&Token::Unique) {
                self.advance();
                unique = true;
            } else {
                break;
            }
        }

        Ok(ColumnDef {
            name,
            data_type,
            not_null,
            primary_key,
            unique,
        })
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        let dt = match self.current() {
            Token::Int | Token::Integer => {
                self.advance();
                DataType::Int32
            }
            Token::BigInt => {
                self.advance();
                DataType::Int64
            }
            Token::Float | Token::Double => {
                self.advance();
                DataType::Float64
            }
            Token::Varchar => {
                self.advance();
                self.expect(&Token::LParen)?;
                let len = self.expect_unsigned()?;
                self.expect(&Token::RParen)?;
                DataType::Varchar(len as u32)
            }
            Token::Text => {
                self.advance();
                DataType::Text
            }
            Token::Boolean => {
                self.advance();
                DataType::Bool
            }
            Token::Blob => {
                self.advance();
                DataType::Bytes
            }
            Token::Date => {
                self.advance();
                DataType::Date
            }
            Token::Timestamp => {
                self.advance();
                DataType::Timestamp
            }
            _ => {
                return Err(Error::UnexpectedToken {
                    expected: "data type".to_string(),
                    found: format!("{}", self.current()),
                });
            }
        };
        Ok(dt)
    }

    fn parse_create_index(&mut self) -> Result<CreateIndexStatement> {
        let unique = if self.check(&Token::Unique) {
            self.advance();
            true
        } else {
            false
        };

        self.expect(&Token::Index)?;
        let index_name = self.expect_identifier()?;
        self.expect(&Token::On)?;
        let table_name = self.expect_identifier()?;

        self.expect(&Token::LParen)?;
        let columns = self.parse_identifier_list()?;
        self.expect(&Token::RParen)?;

        Ok(CreateIndexStatement {
            index_name,
            table_name,
            columns,
            unique,
        })
    }

    // ========== DROP ==========

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect(&Token::Drop)?;
        self.expect(&Token::Table)?;

        let if_exists = if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };

        let table_name = self.expect_identifier()?;
        Ok(Statement::DropTable(DropTableStatement {
            table_name,
            if_exists,
        }))
    }

    // ========== Transaction control ==========

    fn parse_transaction_control(&mut self, stmt: Statement) -> Result<Statement> {
        self.advance();
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(stmt)
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
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expr()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_not_expr()?;
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            })
        } else {
            self.parse_comparison_expr()
        }
    }

    fn parse_comparison_expr(&mut self) -> Result<Expr> {
        let left = self.parse_additive_expr()?;

        // IS [NOT] NULL
        if self.check(&Token::Is) {
            self.advance();
            let negated = if self.check(&Token::Not) {
                self.advance();
                true
            } else {
                false
            };
            self.expect(&Token::Null)?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        // [NOT] IN (list)
        if self.check(&Token::Not) {
            self.advance();
            self.expect(&Token::In)?;
            self.expect(&Token::LParen)?;
            let list = self.parse_expr_list()?;
            self.expect(&Token::RParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated: true,
            });
        }
        if self.check(&Token::In) {
            self.advance();
            self.expect(&Token::LParen)?;
            let list = self.parse_expr_list()?;
            self.expect(&Token::RParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated: false,
            });
        }

        let op = match self.current() {
            Token::Eq => Some(BinaryOp::Eq),
            Token::Neq => Some(BinaryOp::Neq),
            Token::Lt => Some(BinaryOp::Lt),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Lte => Some(BinaryOp::Lte),
            Token::Gte => Some(BinaryOp::Gte),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive_expr()?;
            Ok(Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            })
        } else {
            Ok(left)
        }
    }

    fn parse_additive_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative_expr()?;
        loop {
            let op = match self.current() {
                Token::Plus => Some(BinaryOp::Add),
                Token::Minus => Some(BinaryOp::Sub),
                Token::Concat => Some(BinaryOp::Concat),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let right = self.parse_multiplicative_expr()?;
                    left = Expr::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    };
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.current() {
                Token::Asterisk => Some(BinaryOp::Mul),
                Token::Slash => Some(BinaryOp::Div),
                Token::Percent => Some(BinaryOp::Mod),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let right = self.parse_unary_expr()?;
                    left = Expr::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    };
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        match self.current() {
            Token::Minus => {
                self.advance();
                let expr = self.parse_unary_expr()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Minus,
                    expr: Box::new(expr),
                })
            }
            Token::Plus => {
                self.advance();
                let expr = self.parse_unary_expr()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Plus,
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_primary_expr(),
        }
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        match self.current().clone() {
            Token::IntegerLiteral(n) => {
                self.advance();
                Ok(Expr::Constant(Value::Int64(n)))
            }
            Token::FloatLiteral(n) => {
                self.advance();
                Ok(Expr::Constant(Value::Float64(n)))
            }
            Token::StringLiteral(s) => {
                self.advance();
                Ok(Expr::Constant(Value::Text(s)))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Constant(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Constant(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Constant(Value::Null))
            }

            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Nested(Box::new(expr)))
            }

            // aggregate keywords are always function calls
            Token::Count | Token::Sum | Token::Avg | Token::Min | Token::Max => {
                self.parse_function()
            }

            Token::Identifier(name) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.position -= 1;
                    self.parse_function()
                } else if self.check(&Token::Dot) {
                    self.advance();
                    let column = self.expect_identifier()?;
                    Ok(Expr::Column {
                        table: Some(name),
                        name: column,
                    })
                } else {
                    Ok(Expr::column(name))
                }
            }

            // keywords that double as column names
            other => {
                if let Some(name) = other.as_soft_identifier() {
                    self.advance();
                    Ok(Expr::column(name))
                } else {
                    Err(Error::UnexpectedToken {
                        expected: "expression".to_string(),
                        found: format!("{}", self.current()),
                    })
                }
            }
        }
    }

    fn parse_function(&mut self) -> Result<Expr> {
        let name = match self.current().clone() {
            Token::Count => "COUNT".to_string(),
            Token::Sum => "SUM".to_string(),
            Token::Avg => "AVG".to_string(),
            Token::Min => "MIN".to_string(),
            Token::Max => "MAX".to_string(),
            Token::Identifier(n) => n,
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "function name".to_string(),
                    found: format!("{}", other),
                })
            }
        };
        self.advance();
        self.expect(&Token::LParen)?;

        let distinct = if self.check(&Token::Distinct) {
            self.advance();
            true
        } else {
            false
        };

        // COUNT(*) carries no argument
        let args = if self.check(&Token::Asterisk) {
            self.advance();
            Vec::new()
        } else if self.check(&Token::RParen) {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };

        self.expect(&Token::RParen)?;

        Ok(Expr::Function {
            name,
            args,
            distinct,
        })
    }

    // ========== Helpers ==========

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = Vec::new();
        loop {
            exprs.push(self.parse_expr()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(exprs)
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<String>> {
        let mut identifiers = Vec::new();
        loop {
            identifiers.push(self.expect_identifier()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(identifiers)
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(Error::UnexpectedToken {
                expected: format!("{}", token),
                found: format!("{}", self.current()),
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => match other.as_soft_identifier() {
                Some(name) => {
                    self.advance();
                    Ok(name.to_string())
                }
                None => Err(Error::UnexpectedToken {
                    expected: "identifier".to_string(),
                    found: format!("{}", other),
                }),
            },
        }
    }

    fn expect_unsigned(&mut self) -> Result<u64> {
        match self.current().clone() {
            Token::IntegerLiteral(n) if n >= 0 => {
                self.advance();
                Ok(n as u64)
            }
            other => Err(Error::UnexpectedToken {
                expected: "non-negative integer".to_string(),
                found: format!("{}", other),
            }),
        }
    }
}
