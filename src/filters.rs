//! Vote listing filters.
//!
//! A [`VoteFilter`] turns into both the SQL predicate and the cache-key
//! fragment, derived from the same canonical field order so identical
//! filters always hit the same cache entry.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tokio_postgres::types::ToSql;

use crate::models::VoteType;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

/// Raw query parameters as they arrive on listing endpoints. Invalid values
/// are dropped rather than rejected, matching how the dashboard probes
/// filters incrementally.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VoteFilterQuery {
    pub user_id: Option<String>,
    pub content_id: Option<String>,
    pub vote_type: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub q: Option<String>,
    pub limit: Option<i64>,
}

impl VoteFilterQuery {
    pub fn into_filter(self) -> (VoteFilter, i64) {
        let limit = match self.limit {
            Some(n) if n > 0 => n.min(MAX_LIST_LIMIT),
            _ => DEFAULT_LIST_LIMIT,
        };

        let filter = VoteFilter {
            user_id: non_empty(self.user_id),
            content_id: non_empty(self.content_id),
            vote_type: self.vote_type.as_deref().and_then(VoteType::parse),
            from: self.from.as_deref().and_then(parse_date_param),
            to: self.to.as_deref().and_then(parse_date_param),
            q: non_empty(self.q),
        };

        (filter, limit)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_date_param(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(instant.with_timezone(&Utc));
    }
    value
        .parse::<NaiveDate>()
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct VoteFilter {
    pub user_id: Option<String>,
    pub content_id: Option<String>,
    pub vote_type: Option<VoteType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub q: Option<String>,
}

impl VoteFilter {
    /// Canonical serialization for cache keys. Every field keeps its slot so
    /// the shape stays unambiguous when fields are absent.
    pub fn cache_key_fragment(&self) -> String {
        format!(
            "u={}&c={}&t={}&from={}&to={}&q={}",
            self.user_id.as_deref().unwrap_or(""),
            self.content_id.as_deref().unwrap_or(""),
            self.vote_type.map(VoteType::as_str).unwrap_or(""),
            self.from.map(|d| d.timestamp().to_string()).unwrap_or_default(),
            self.to.map(|d| d.timestamp().to_string()).unwrap_or_default(),
            self.q.as_deref().unwrap_or(""),
        )
    }

    /// Predicate over the `votes` table, with the same fields the cache key
    /// is built from.
    pub fn to_sql(&self) -> SqlFilter {
        let mut sql = SqlFilter::default();

        if let Some(user_id) = &self.user_id {
            sql.bind("user_id = $?", vec![Box::new(user_id.clone())]);
        }
        if let Some(content_id) = &self.content_id {
            sql.bind("content_id = $?", vec![Box::new(content_id.clone())]);
        }
        if let Some(vote_type) = self.vote_type {
            sql.bind("vote_type = $?", vec![Box::new(vote_type.as_str())]);
        }
        if let Some(from) = self.from {
            sql.bind("created_at >= $?", vec![Box::new(from)]);
        }
        if let Some(to) = self.to {
            sql.bind("created_at <= $?", vec![Box::new(to)]);
        }
        if let Some(q) = &self.q {
            let pattern = format!("%{q}%");
            sql.bind(
                "(content_id ILIKE $? OR page_url ILIKE $?)",
                vec![Box::new(pattern.clone()), Box::new(pattern)],
            );
        }

        sql
    }
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

#[derive(Default)]
pub struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<SqlParam>,
}

impl SqlFilter {
    /// Appends a clause, substituting each `$?` with the next placeholder
    /// number and binding the values in order.
    fn bind(&mut self, expr: &str, values: Vec<SqlParam>) {
        let mut clause = String::with_capacity(expr.len() + 4);
        let mut pieces = expr.split("$?");
        clause.push_str(pieces.next().unwrap_or_default());
        for (value, rest) in values.into_iter().zip(pieces) {
            self.params.push(value);
            clause.push_str(&format!("${}", self.params.len()));
            clause.push_str(rest);
        }
        self.clauses.push(clause);
    }

    /// Binds an extra query-specific parameter (limit, id list) and returns
    /// its placeholder number.
    pub fn add(&mut self, value: SqlParam) -> usize {
        self.params.push(value);
        self.params.len()
    }

    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// Clause joined with `AND`, for queries that already have a `WHERE`.
    pub fn and_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}
