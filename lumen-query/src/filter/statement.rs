// Caller-supplied SQL statements and predicate injection.
//
// Statements are tokenized with `sqlparser` to find statement separators and
// drop trailing terminators and comments. Predicates are AND-ed into the
// parsed top-level selection; anything the parser cannot express as a single
// SELECT is wrapped as a subquery instead.

use lumen_core::{Error, Result, SqlDialect};
use sqlparser::ast::{BinaryOperator, Expr, SetExpr, Statement};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use tracing::{debug, warn};

fn parser_dialect(dialect: Option<SqlDialect>) -> Box<dyn Dialect> {
    match dialect {
        Some(SqlDialect::Postgres) => Box::new(PostgreSqlDialect {}),
        Some(SqlDialect::Mysql) => Box::new(MySqlDialect {}),
        Some(SqlDialect::Sqlite) => Box::new(SQLiteDialect {}),
        None => Box::new(GenericDialect {}),
    }
}

/// A single SQL statement as supplied by a chart or dataset
#[derive(Debug, Clone)]
pub struct SqlStatement {
    /// Statement text without trailing whitespace, comments or semicolons
    sql: String,
    dialect: Option<SqlDialect>,
    /// A `;` before the end, i.e. more than one statement
    separator: bool,
}

impl SqlStatement {
    /// Tokenize with the dialect-neutral rules
    pub fn parse(sql: &str) -> Result<Self> {
        Self::tokenize(None, sql)
    }

    pub fn parse_for(dialect: SqlDialect, sql: &str) -> Result<Self> {
        Self::tokenize(Some(dialect), sql)
    }

    fn tokenize(dialect: Option<SqlDialect>, sql: &str) -> Result<Self> {
        let rules = parser_dialect(dialect);
        let tokens = Tokenizer::new(rules.as_ref(), sql)
            .tokenize()
            .map_err(|e| Error::InvalidQuery(e.to_string()))?;

        // A trailing `--` comment is dropped with the terminators, so text
        // appended after the statement can never end up commented out
        let end = tokens
            .iter()
            .rposition(|token| !matches!(token, Token::Whitespace(_) | Token::SemiColon | Token::EOF))
            .map_or(0, |index| index + 1);
        let text = strip_trailing(sql, &tokens[end..]).ok_or_else(|| {
            Error::InvalidQuery("could not isolate the statement from its terminator".to_string())
        })?;

        Ok(Self {
            sql: text.to_string(),
            dialect,
            separator: tokens[..end].iter().any(|token| matches!(token, Token::SemiColon)),
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn has_multiple_statements(&self) -> bool {
        self.separator
    }

    /// `SELECT * FROM (<statement>) AS <alias> WHERE <predicate>`
    pub fn wrap(&self, alias: &str, predicate: &str) -> String {
        format!("SELECT * FROM ({}) AS {} WHERE {}", self.sql, alias, predicate)
    }

    /// Render the statement with `predicate` AND-ed into its top-level WHERE.
    ///
    /// An existing selection becomes `(predicate) AND (existing)`. Compound
    /// queries, multiple statements and SQL the parser rejects are wrapped
    /// as `SELECT * FROM (...) AS __filtered WHERE predicate`.
    pub fn with_predicate(&self, predicate: &str) -> String {
        let predicate = predicate.trim();
        if predicate.is_empty() {
            return self.sql.clone();
        }

        match self.rewrite_selection(predicate) {
            Some(sql) => sql,
            None => self.wrap("__filtered", predicate),
        }
    }

    fn rewrite_selection(&self, predicate: &str) -> Option<String> {
        if self.separator {
            warn!("Filtering a multi-statement query by wrapping it");
            return None;
        }

        let rules = parser_dialect(self.dialect);
        let mut statements = match Parser::parse_sql(rules.as_ref(), &self.sql) {
            Ok(statements) => statements,
            Err(e) => {
                debug!(error = %e, "Query not understood by the parser, wrapping it");
                return None;
            }
        };
        if statements.len() != 1 {
            return None;
        }

        let injected = match parse_predicate(rules.as_ref(), predicate) {
            Ok(expr) => expr,
            Err(e) => {
                warn!(error = %e, "Filter predicate not understood by the parser, wrapping the query");
                return None;
            }
        };

        let mut statement = statements.remove(0);
        let Statement::Query(query) = &mut statement else {
            return None;
        };
        // Set operations and VALUES have no single WHERE covering every row
        let SetExpr::Select(select) = query.body.as_mut() else {
            return None;
        };

        select.selection = Some(match select.selection.take() {
            Some(existing) => Expr::BinaryOp {
                left: Box::new(nested(injected)),
                op: BinaryOperator::And,
                right: Box::new(nested(existing)),
            },
            None => injected,
        });

        Some(statement.to_string())
    }
}

/// Cut the dropped trailing tokens off the original text.
///
/// Token rendering does not restore escaped quotes, so the kept statement is
/// always a slice of the input rather than re-rendered tokens.
fn strip_trailing<'a>(sql: &'a str, dropped: &[Token]) -> Option<&'a str> {
    let mut text = sql;
    for token in dropped.iter().rev() {
        text = match token {
            Token::SemiColon
            | Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                let rendered = token.to_string();
                text.trim_end().strip_suffix(rendered.trim_end())?
            }
            _ => text.trim_end(),
        };
    }
    Some(text.trim_end())
}

/// Parse a predicate, rejecting trailing input the expression does not cover
fn parse_predicate(dialect: &dyn Dialect, predicate: &str) -> Result<Expr> {
    let invalid = |e: sqlparser::parser::ParserError| Error::InvalidQuery(e.to_string());

    let mut parser = Parser::new(dialect).try_with_sql(predicate).map_err(invalid)?;
    let expr = parser.parse_expr().map_err(invalid)?;
    let next = parser.peek_token().token;
    if next != Token::EOF {
        return Err(Error::InvalidQuery(format!(
            "unexpected '{}' after predicate",
            next
        )));
    }
    Ok(expr)
}

fn nested(expr: Expr) -> Expr {
    match expr {
        Expr::Nested(_) => expr,
        other => Expr::Nested(Box::new(other)),
    }
}

/// Add a predicate to a query's top-level WHERE clause.
///
/// * existing WHERE: `WHERE (clause) AND (existing)`
/// * otherwise `WHERE clause`, rendered before GROUP BY / ORDER BY / LIMIT
/// * compound queries (UNION / INTERSECT / EXCEPT) are wrapped as a subquery
///
/// The rewritten query is rendered from the parsed statement, so keywords
/// come back upper-cased and comments are dropped.
pub fn inject_where_clause(sql: &str, where_clause: &str) -> String {
    inject_with(None, sql, where_clause)
}

pub(crate) fn inject_with(dialect: Option<SqlDialect>, sql: &str, where_clause: &str) -> String {
    match SqlStatement::tokenize(dialect, sql) {
        Ok(statement) => statement.with_predicate(where_clause),
        Err(e) => {
            warn!(error = %e, "Query could not be tokenized, wrapping it");
            let where_clause = where_clause.trim();
            if where_clause.is_empty() {
                return sql.trim().to_string();
            }
            format!(
                "SELECT * FROM (\n{}\n) AS __filtered WHERE {}",
                sql.trim(),
                where_clause
            )
        }
    }
}
