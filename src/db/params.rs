//! Named parameter compilation and binding.
//!
//! Requests carry named parameters (`@name` or `:name`). Each backend wants
//! positional placeholders instead, so statements are tokenized with the
//! backend's `sqlparser` dialect and only placeholder tokens are rewritten;
//! literals, quoted identifiers and comments come through byte for byte. The
//! same token stream splits multi-statement text on top-level semicolons.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Params, QueryParam};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use std::collections::HashMap;
use std::ops::Range;

/// A statement rewritten for one backend, with its arguments in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery<'p> {
    pub sql: String,
    pub args: Vec<&'p QueryParam>,
}

impl CompiledQuery<'_> {
    /// Whether the statement binds no arguments and can run unprepared.
    pub fn is_raw(&self) -> bool {
        self.args.is_empty()
    }
}

/// Rewrite named placeholders in `sql` into `db_type`'s positional form.
///
/// An empty parameter map leaves the text untouched. Otherwise every
/// placeholder must have a value in `params`; unused entries are ignored.
pub fn compile<'p>(
    sql: &str,
    params: &'p Params,
    db_type: DatabaseType,
) -> DbResult<CompiledQuery<'p>> {
    if params.is_empty() {
        return Ok(CompiledQuery {
            sql: sql.to_string(),
            args: Vec::new(),
        });
    }

    let tokens = lex(sql, db_type)?;
    let mut out = String::with_capacity(sql.len());
    let mut args: Vec<&'p QueryParam> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut copied_to = 0;

    for placeholder in placeholders(sql, &tokens) {
        let value = params.get(placeholder.name).ok_or_else(|| {
            DbError::invalid_input(format!(
                "Missing value for parameter '{}'",
                &sql[placeholder.span.clone()]
            ))
        })?;

        out.push_str(&sql[copied_to..placeholder.span.start]);
        copied_to = placeholder.span.end;

        match db_type {
            DatabaseType::PostgreSQL => {
                let idx = match positions.get(placeholder.name) {
                    Some(idx) => *idx,
                    None => {
                        args.push(value);
                        positions.insert(placeholder.name, args.len());
                        args.len()
                    }
                };
                out.push('$');
                out.push_str(&idx.to_string());
            }
            DatabaseType::MySQL | DatabaseType::SQLite => {
                args.push(value);
                out.push('?');
            }
        }
    }
    out.push_str(&sql[copied_to..]);

    Ok(CompiledQuery { sql: out, args })
}

/// Split `sql` into its statements on top-level semicolons.
///
/// Segments holding only whitespace or comments are dropped. Semicolons
/// inside literals, quoted identifiers, comments and dollar-quoted bodies do
/// not split.
pub fn split_statements(sql: &str, db_type: DatabaseType) -> DbResult<Vec<&str>> {
    let tokens = lex(sql, db_type)?;
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;

    for (token, span) in &tokens {
        match token {
            Token::SemiColon => {
                if has_code {
                    statements.push(sql[start..span.start].trim());
                }
                start = span.end;
                has_code = false;
            }
            // Comments are whitespace tokens
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_code = true,
        }
    }
    if has_code {
        statements.push(sql[start..].trim());
    }
    Ok(statements)
}

fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Tokenize `sql` and attach the byte range of each token.
fn lex(sql: &str, db_type: DatabaseType) -> DbResult<Vec<(Token, Range<usize>)>> {
    let dialect = get_dialect(db_type);
    let tokens = Tokenizer::new(dialect.as_ref(), sql)
        .tokenize_with_location()
        .map_err(|e| DbError::invalid_input(format!("Could not tokenize SQL: {}", e)))?;

    let offsets = ByteOffsets::new(sql);
    tokens
        .into_iter()
        .map(|t| {
            let start = offsets.get(t.span.start)?;
            let end = offsets.get(t.span.end)?;
            Ok((t.token, start..end))
        })
        .collect()
}

/// Maps the tokenizer's 1-based line/column locations, counted in chars, to
/// byte offsets into the source.
struct ByteOffsets {
    positions: Vec<((u64, u64), usize)>,
    len: usize,
}

impl ByteOffsets {
    fn new(sql: &str) -> Self {
        let mut positions = Vec::with_capacity(sql.len() + 1);
        let (mut line, mut column) = (1, 1);
        for (offset, ch) in sql.char_indices() {
            positions.push(((line, column), offset));
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        positions.push(((line, column), sql.len()));
        Self {
            positions,
            len: sql.len(),
        }
    }

    fn get(&self, location: Location) -> DbResult<usize> {
        // An empty location marks synthetic tokens such as EOF
        if location.line == 0 {
            return Ok(self.len);
        }
        self.positions
            .binary_search_by_key(&(location.line, location.column), |(key, _)| *key)
            .map(|idx| self.positions[idx].1)
            .map_err(|_| {
                DbError::internal(format!(
                    "Token location {}:{} is outside the statement",
                    location.line, location.column
                ))
            })
    }
}

/// One named placeholder in the source text.
#[derive(Debug, PartialEq)]
struct Placeholder<'a> {
    /// Byte range of the whole placeholder, prefix included
    span: Range<usize>,
    name: &'a str,
}

/// Find `@name` and `:name` placeholders in token order.
///
/// Depending on the dialect a placeholder arrives as one token (`@name` is a
/// word in MySQL) or as a prefix token directly followed by an unquoted word.
/// A prefix glued to the token before it (`a@v`, `arr[lo:hi]`) is an
/// operator, and `::type` casts and `@@system_var` references never match.
fn placeholders<'a>(sql: &'a str, tokens: &[(Token, Range<usize>)]) -> Vec<Placeholder<'a>> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let (token, span) = &tokens[i];
        let glued = i > 0 && is_glued_to_previous(&tokens[i - 1], span);
        match token {
            Token::Colon | Token::AtSign if !glued => {
                if let Some((Token::Word(word), next)) = tokens.get(i + 1) {
                    if word.quote_style.is_none() && next.start == span.end {
                        found.push(Placeholder {
                            span: span.start..next.end,
                            name: &sql[next.clone()],
                        });
                        i += 1;
                    }
                }
            }
            Token::Word(word) if !glued && word.quote_style.is_none() => {
                if is_prefixed_name(&word.value) {
                    found.push(Placeholder {
                        span: span.clone(),
                        name: &sql[span.start + 1..span.end],
                    });
                }
            }
            Token::Placeholder(text) if !glued => {
                if is_prefixed_name(text) {
                    found.push(Placeholder {
                        span: span.clone(),
                        name: &sql[span.start + 1..span.end],
                    });
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// `@name` or `:name` as a single token; `@@name` and `$1` do not qualify.
fn is_prefixed_name(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some('@' | ':'))
        && chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
}

fn is_glued_to_previous((previous, previous_span): &(Token, Range<usize>), span: &Range<usize>) -> bool {
    previous_span.end == span.start
        && matches!(
            previous,
            Token::Word(_)
                | Token::Number(..)
                | Token::Colon
                | Token::AtSign
                | Token::DoubleColon
                | Token::RBracket
                | Token::RParen
        )
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Timestamp(v) => query.bind(*v),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::params;

    #[test]
    fn test_compile_without_params_is_verbatim() {
        let empty = Params::new();
        let compiled = compile("SELECT @x, ':y'", &empty, DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.sql, "SELECT @x, ':y'");
        assert!(compiled.is_raw());
    }

    #[test]
    fn test_compile_question_mark_style() {
        let p = params([("n", QueryParam::from("S-1")), ("m", QueryParam::from("Ada"))]);
        let compiled = compile(
            "INSERT INTO students (StudentNumber, Name) VALUES (@n, @m)",
            &p,
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            "INSERT INTO students (StudentNumber, Name) VALUES (?, ?)"
        );
        assert_eq!(
            compiled.args,
            vec![&QueryParam::from("S-1"), &QueryParam::from("Ada")]
        );
    }

    #[test]
    fn test_compile_repeated_name() {
        let p = params([("id", 7)]);
        let mysql = compile("SELECT :id, :id", &p, DatabaseType::MySQL).unwrap();
        assert_eq!(mysql.sql, "SELECT ?, ?");
        assert_eq!(mysql.args.len(), 2);

        let pg = compile("SELECT :id, :id", &p, DatabaseType::PostgreSQL).unwrap();
        assert_eq!(pg.sql, "SELECT $1, $1");
        assert_eq!(pg.args.len(), 1);
    }

    #[test]
    fn test_compile_postgres_numbering_follows_first_use() {
        let p = params([("a", 1), ("b", 2)]);
        let pg = compile("SELECT @b + @a - @b", &p, DatabaseType::PostgreSQL).unwrap();
        assert_eq!(pg.sql, "SELECT $1 + $2 - $1");
        assert_eq!(pg.args, vec![&QueryParam::Int(2), &QueryParam::Int(1)]);
    }

    #[test]
    fn test_compile_skips_literals_and_comments() {
        let p = params([("id", 1)]);
        let sql = "SELECT '@id', \"@id\", x::int -- @id\n FROM t /* :id */ WHERE id = @id";
        let pg = compile(sql, &p, DatabaseType::PostgreSQL).unwrap();
        assert_eq!(
            pg.sql,
            "SELECT '@id', \"@id\", x::int -- @id\n FROM t /* :id */ WHERE id = $1"
        );
    }

    #[test]
    fn test_compile_skips_escaped_quotes() {
        let p = params([("v", "x")]);
        let sql = "SELECT 'it''s @v', @v";
        let compiled = compile(sql, &p, DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.sql, "SELECT 'it''s @v', ?");

        let mysql = compile("SELECT 'a\\'@v', @v", &p, DatabaseType::MySQL).unwrap();
        assert_eq!(mysql.sql, "SELECT 'a\\'@v', ?");
    }

    #[test]
    fn test_compile_skips_mysql_system_variables() {
        let p = params([("v", 1)]);
        let compiled = compile("SELECT @@version, @v", &p, DatabaseType::MySQL).unwrap();
        assert_eq!(compiled.sql, "SELECT @@version, ?");
    }

    #[test]
    fn test_compile_skips_dollar_quoted_bodies() {
        let p = params([("v", 1)]);
        let sql = "SELECT $body$ @v ; $body$, @v";
        let compiled = compile(sql, &p, DatabaseType::PostgreSQL).unwrap();
        assert_eq!(compiled.sql, "SELECT $body$ @v ; $body$, $1");
    }

    #[test]
    fn test_compile_ignores_embedded_at_sign() {
        let p = params([("v", 1)]);
        let compiled = compile("SELECT a@v, @v", &p, DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.sql, "SELECT a@v, ?");
    }

    #[test]
    fn test_compile_ignores_slices_and_bracketed_names() {
        let p = params([("hi", 3)]);
        let pg = compile("SELECT arr[lo:hi], :hi FROM t", &p, DatabaseType::PostgreSQL).unwrap();
        assert_eq!(pg.sql, "SELECT arr[lo:hi], $1 FROM t");

        let sqlite = compile("SELECT [@hi], @hi", &p, DatabaseType::SQLite).unwrap();
        assert_eq!(sqlite.sql, "SELECT [@hi], ?");
    }

    #[test]
    fn test_compile_multiline_offsets() {
        let p = params([("name", "Zoë")]);
        let sql = "SELECT 'é'\n\t, @name\r\n  FROM t\nWHERE x = :name";
        let compiled = compile(sql, &p, DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.sql, "SELECT 'é'\n\t, ?\r\n  FROM t\nWHERE x = ?");
        assert_eq!(compiled.args.len(), 2);
    }

    #[test]
    fn test_unterminated_literal_is_invalid_input() {
        let p = params([("v", 1)]);
        let err = compile("SELECT 'open, @v", &p, DatabaseType::PostgreSQL).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(split_statements("SELECT \"open", DatabaseType::SQLite).is_err());
    }

    #[test]
    fn test_compile_missing_parameter() {
        let p = params([("known", 1)]);
        let err = compile("SELECT @known, @unknown", &p, DatabaseType::SQLite).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(err.to_string().contains("@unknown"));
    }

    #[test]
    fn test_compile_preserves_unicode() {
        let p = params([("name", "Zoë")]);
        let compiled = compile("SELECT 'café', @name -- ünïcode", &p, DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.sql, "SELECT 'café', ? -- ünïcode");
    }

    #[test]
    fn test_split_statements() {
        let parts = split_statements(
            "SELECT 1; SELECT ';' AS semi;\n-- trailing comment\n",
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(parts, vec!["SELECT 1", "SELECT ';' AS semi"]);
    }

    #[test]
    fn test_split_statements_single() {
        assert_eq!(
            split_statements("SELECT 1", DatabaseType::PostgreSQL).unwrap(),
            vec!["SELECT 1"]
        );
        assert!(
            split_statements(" ; /* nothing */ ;", DatabaseType::PostgreSQL)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_split_statements_dollar_quoted() {
        let parts = split_statements(
            "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1; $$ LANGUAGE sql; SELECT f()",
            DatabaseType::PostgreSQL,
        )
        .unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("LANGUAGE sql"));
        assert_eq!(parts[1], "SELECT f()");
    }
}
