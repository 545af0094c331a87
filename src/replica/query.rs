use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;

use super::engine::EngineHandle;
use crate::core::{QueryResult, Result, Row, SyncError, Value};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Validates and double-quotes a table or column name.
pub fn quote_ident(name: &str) -> Result<String> {
    if IDENTIFIER.is_match(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(SyncError::Engine(format!("invalid identifier '{}'", name)))
    }
}

/// A parameterised SQL statement plus the tables it reads or writes.
///
/// `tables` drives live-query invalidation: a write with no tables listed
/// invalidates every live query.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    tables: BTreeSet<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            tables: BTreeSet::new(),
        }
    }

    pub fn raw<I, S>(sql: impl Into<String>, params: Vec<Value>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sql: sql.into(),
            params,
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn touching(mut self, table: &str) -> Self {
        self.tables.insert(table.to_string());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Gt(String, Value),
    IsNull(String),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    pub fn ne(column: &str, value: impl Into<Value>) -> Self {
        Self::Ne(column.to_string(), value.into())
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::Lt(column.to_string(), value.into())
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self::Gt(column.to_string(), value.into())
    }

    pub fn is_null(column: &str) -> Self {
        Self::IsNull(column.to_string())
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    fn render(&self, params: &mut Vec<Value>) -> Result<String> {
        Ok(match self {
            Self::Eq(col, value) => format!("{} = {}", quote_ident(col)?, placeholder(value, params)),
            Self::Ne(col, value) => format!("{} <> {}", quote_ident(col)?, placeholder(value, params)),
            Self::Lt(col, value) => format!("{} < {}", quote_ident(col)?, placeholder(value, params)),
            Self::Gt(col, value) => format!("{} > {}", quote_ident(col)?, placeholder(value, params)),
            Self::IsNull(col) => format!("{} IS NULL", quote_ident(col)?),
            Self::In(col, values) => {
                if values.is_empty() {
                    return Ok("0 = 1".to_string());
                }
                let column = quote_ident(col)?;
                let list: Vec<String> = values.iter().map(|v| placeholder(v, params)).collect();
                format!("{} IN ({})", column, list.join(", "))
            }
            Self::And(parts) => join_filters(parts, " AND ", "1 = 1", params)?,
            Self::Or(parts) => join_filters(parts, " OR ", "0 = 1", params)?,
        })
    }
}

fn placeholder(value: &Value, params: &mut Vec<Value>) -> String {
    params.push(value.clone());
    format!("?{}", params.len())
}

fn join_filters(
    parts: &[Filter],
    separator: &str,
    empty: &str,
    params: &mut Vec<Value>,
) -> Result<String> {
    if parts.is_empty() {
        return Ok(empty.to_string());
    }
    let rendered = parts
        .iter()
        .map(|part| part.render(params).map(|sql| format!("({})", sql)))
        .collect::<Result<Vec<_>>>()?;
    Ok(rendered.join(separator))
}

/// Query-building handle derived from a ready replica.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    engine: EngineHandle,
}

impl QueryBuilder {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn select(&self, table: &str) -> SelectBuilder {
        SelectBuilder {
            engine: self.engine.clone(),
            table: table.to_string(),
            columns: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub async fn query(&self, statement: Statement) -> Result<QueryResult> {
        self.engine.query(statement).await
    }
}

#[derive(Debug, Clone)]
pub struct SelectBuilder {
    engine: EngineHandle,
    table: String,
    columns: Vec<String>,
    filter: Option<Filter>,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
}

impl SelectBuilder {
    pub fn columns<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.columns = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    /// Adds a filter; repeated calls are combined with AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order_by.push((column.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(&self) -> Result<Statement> {
        let table = quote_ident(&self.table)?;
        let projection = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", projection, table);
        let mut params = Vec::new();

        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.render(&mut params)?);
        }

        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|(col, dir)| quote_ident(col).map(|c| format!("{} {}", c, dir.as_sql())))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        Ok(Statement::raw(sql, params, [self.table.clone()]))
    }

    pub async fn fetch_all(self) -> Result<Vec<Row>> {
        let statement = self.build()?;
        Ok(self.engine.query(statement).await?.into_rows())
    }

    pub async fn fetch_optional(self) -> Result<Option<Row>> {
        let select = self.limit(1);
        let statement = select.build()?;
        Ok(select.engine.query(statement).await?.into_rows().into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("chats").unwrap(), "\"chats\"");
        assert!(quote_ident("chats; DROP TABLE users").is_err());
        assert!(quote_ident("1abc").is_err());
    }

    #[test]
    fn test_filter_rendering_numbers_placeholders() {
        let filter = Filter::eq("user_id", "u1")
            .and(Filter::is_in("status", ["open", "pinned"]))
            .and(Filter::is_null("deleted_at"));
        let mut params = Vec::new();
        let sql = filter.render(&mut params).unwrap();

        assert_eq!(
            sql,
            "(\"user_id\" = ?1) AND (\"status\" IN (?2, ?3)) AND (\"deleted_at\" IS NULL)"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let mut params = Vec::new();
        let sql = Filter::is_in::<i64>("id", []).render(&mut params).unwrap();
        assert_eq!(sql, "0 = 1");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_all_and_optional() {
        let engine = EngineHandle::open(None).await.unwrap();
        engine
            .execute_batch(
                "CREATE TABLE chats (id TEXT PRIMARY KEY, title TEXT);\
                 INSERT INTO chats VALUES ('c1', 'Hello'), ('c2', 'World');",
            )
            .await
            .unwrap();
        let query = QueryBuilder::new(engine.clone());

        let rows = query
            .select("chats")
            .order_by("id", Direction::Desc)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("title"), Some("World"));

        let first = query
            .select("chats")
            .columns(&["title"])
            .order_by("id", Direction::Asc)
            .fetch_optional()
            .await
            .unwrap();
        assert_eq!(first.and_then(|row| row.get_str("title").map(str::to_string)), Some("Hello".to_string()));

        let missing = query
            .select("chats")
            .filter(Filter::eq("id", "nope"))
            .fetch_optional()
            .await
            .unwrap();
        assert!(missing.is_none());
        engine.close().await;
    }

    #[test]
    fn test_or_grouping() {
        let filter = Filter::lt("n", 1).or(Filter::gt("n", 9));
        let mut params = Vec::new();
        assert_eq!(filter.render(&mut params).unwrap(), "(\"n\" < ?1) OR (\"n\" > ?2)");
    }
}
