//! # Postgres
//!
//! Relational store for votes, content rows, and transcript segments.
//!
//! All aggregation endpoints read through the cache layer before any query
//! here runs; nothing in this module caches on its own. Queries stay simple
//! group-by/count shapes so the bucket fold in [`crate::buckets`] owns the
//! merge rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};
use tracing::warn;

use crate::buckets::GroupedCount;
use crate::config::Config;
use crate::error::AppError;
use crate::filters::VoteFilter;
use crate::models::{
    AdminContentItem, ContentRow, CountedId, SavedVote, Segment, SegmentSpan, StatsTotals,
    VoteRow, VoteTotals, VoteType,
};

pub struct NewVote<'a> {
    pub user_id: &'a str,
    pub content_id: &'a str,
    pub time_seconds: i32,
    pub time_bucket: i32,
    pub vote_type: VoteType,
    pub page_url: Option<&'a str>,
    pub page_host: Option<&'a str>,
}

#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

impl Db {
    pub fn connect(config: &Config) -> Self {
        let pg_config = config
            .database_url
            .parse::<tokio_postgres::Config>()
            .expect("Database misconfigured!");

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(config.database_pool_size)
            .build()
            .expect("Database pool misconfigured!");

        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, AppError> {
        Ok(self.pool.get().await?)
    }

    // -----------------------------------------------------------------------
    // Votes

    pub async fn upsert_vote(&self, vote: NewVote<'_>) -> Result<SavedVote, AppError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO votes (user_id, content_id, time_seconds, time_bucket, vote_type, page_url, page_host)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (user_id, content_id, time_bucket)
                 DO UPDATE SET vote_type = EXCLUDED.vote_type,
                               time_seconds = EXCLUDED.time_seconds,
                               page_url = EXCLUDED.page_url,
                               page_host = EXCLUDED.page_host
                 RETURNING id, content_id, time_seconds, time_bucket, vote_type",
                &[
                    &vote.user_id,
                    &vote.content_id,
                    &vote.time_seconds,
                    &vote.time_bucket,
                    &vote.vote_type.as_str(),
                    &vote.page_url,
                    &vote.page_host,
                ],
            )
            .await?;

        Ok(SavedVote {
            id: row.get("id"),
            content_id: row.get("content_id"),
            time_seconds: row.get("time_seconds"),
            time_bucket: row.get("time_bucket"),
            vote_type: parse_vote_type(&row).unwrap_or(vote.vote_type),
        })
    }

    pub async fn grouped_by_bucket(&self, content_id: &str) -> Result<Vec<GroupedCount>, AppError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT time_bucket, vote_type, COUNT(*) AS n
                 FROM votes
                 WHERE content_id = $1
                 GROUP BY time_bucket, vote_type
                 ORDER BY time_bucket ASC",
                &[&content_id],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let vote_type = parse_vote_type(row)?;
                Some(GroupedCount {
                    time_bucket: row.get("time_bucket"),
                    vote_type,
                    count: row.get("n"),
                })
            })
            .collect())
    }

    pub async fn vote_totals(&self, content_id: &str) -> Result<VoteTotals, AppError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) AS total,
                        COUNT(*) FILTER (WHERE vote_type = 'UP') AS up,
                        COUNT(*) FILTER (WHERE vote_type = 'DOWN') AS down
                 FROM votes
                 WHERE content_id = $1",
                &[&content_id],
            )
            .await?;

        Ok(VoteTotals {
            up: row.get("up"),
            down: row.get("down"),
            total: row.get("total"),
        })
    }

    pub async fn max_vote_seconds(&self, content_id: &str) -> Result<Option<i32>, AppError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT MAX(time_seconds) AS max_seconds FROM votes WHERE content_id = $1",
                &[&content_id],
            )
            .await?;
        Ok(row.get("max_seconds"))
    }

    pub async fn votes_list(
        &self,
        filter: &VoteFilter,
        limit: i64,
    ) -> Result<(Vec<VoteRow>, i64), AppError> {
        let conn = self.conn().await?;

        let mut sql = filter.to_sql();
        let limit_param = sql.add(Box::new(limit));
        let query = format!(
            "SELECT id, user_id, content_id, time_seconds, vote_type, page_url, page_host, created_at
             FROM votes{}
             ORDER BY created_at DESC
             LIMIT ${limit_param}",
            sql.where_clause()
        );
        let rows = conn.query(&query, &sql.params()).await?;

        let votes = rows
            .iter()
            .filter_map(|row| {
                let vote_type = parse_vote_type(row)?;
                Some(VoteRow {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    content_id: row.get("content_id"),
                    time_seconds: row.get("time_seconds"),
                    vote_type,
                    page_url: row.get("page_url"),
                    page_host: row.get("page_host"),
                    created_at: row.get("created_at"),
                })
            })
            .collect();

        let count_sql = filter.to_sql();
        let count_query = format!("SELECT COUNT(*) AS n FROM votes{}", count_sql.where_clause());
        let total: i64 = conn
            .query_one(&count_query, &count_sql.params())
            .await?
            .get("n");

        Ok((votes, total))
    }

    /// Votes grouped per content and folded into activity rows, most active
    /// first, with the newest vote's page URL and timestamp attached.
    pub async fn content_activity(
        &self,
        filter: &VoteFilter,
        limit: i64,
    ) -> Result<Vec<AdminContentItem>, AppError> {
        let conn = self.conn().await?;

        let sql = filter.to_sql();
        let query = format!(
            "SELECT content_id, vote_type, COUNT(*) AS n
             FROM votes{}
             GROUP BY content_id, vote_type",
            sql.where_clause()
        );
        let rows = conn.query(&query, &sql.params()).await?;

        let mut by_content: HashMap<String, (i64, i64)> = HashMap::new();
        for row in &rows {
            let Some(vote_type) = parse_vote_type(row) else {
                continue;
            };
            let slot = by_content.entry(row.get("content_id")).or_default();
            match vote_type {
                VoteType::Up => slot.0 = row.get("n"),
                VoteType::Down => slot.1 = row.get("n"),
            }
        }

        let mut items: Vec<AdminContentItem> = by_content
            .into_iter()
            .map(|(content_id, (up, down))| AdminContentItem {
                content_id,
                up,
                down,
                total: up + down,
                page_url: None,
                last_voted_at: None,
            })
            .collect();
        items.sort_by(|a, b| {
            b.total
                .cmp(&a.total)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        items.truncate(limit.max(0) as usize);

        if items.is_empty() {
            return Ok(items);
        }

        let ids: Vec<String> = items.iter().map(|item| item.content_id.clone()).collect();
        let mut sample_sql = filter.to_sql();
        let ids_param = sample_sql.add(Box::new(ids));
        let sample_query = format!(
            "SELECT DISTINCT ON (content_id) content_id, page_url, created_at
             FROM votes
             WHERE content_id = ANY(${ids_param}){}
             ORDER BY content_id, created_at DESC",
            sample_sql.and_clause()
        );
        let sample_rows = conn.query(&sample_query, &sample_sql.params()).await?;

        let mut newest: HashMap<String, (Option<String>, DateTime<Utc>)> = HashMap::new();
        for row in &sample_rows {
            newest.insert(
                row.get("content_id"),
                (row.get("page_url"), row.get("created_at")),
            );
        }
        for item in &mut items {
            if let Some((page_url, last_voted_at)) = newest.get(&item.content_id) {
                item.page_url = page_url.clone();
                item.last_voted_at = Some(*last_voted_at);
            }
        }

        Ok(items)
    }

    pub async fn stats(
        &self,
    ) -> Result<(StatsTotals, Vec<CountedId>, Vec<CountedId>), AppError> {
        let conn = self.conn().await?;

        let totals_row = conn
            .query_one(
                "SELECT COUNT(*) AS total,
                        COUNT(*) FILTER (WHERE vote_type = 'UP') AS up,
                        COUNT(*) FILTER (WHERE vote_type = 'DOWN') AS down
                 FROM votes",
                &[],
            )
            .await?;
        let totals = StatsTotals {
            votes: totals_row.get("total"),
            upvotes: totals_row.get("up"),
            downvotes: totals_row.get("down"),
        };

        let top_content = conn
            .query(
                "SELECT content_id AS id, COUNT(*) AS n
                 FROM votes GROUP BY content_id ORDER BY n DESC LIMIT 10",
                &[],
            )
            .await?;
        let top_users = conn
            .query(
                "SELECT user_id AS id, COUNT(*) AS n
                 FROM votes GROUP BY user_id ORDER BY n DESC LIMIT 10",
                &[],
            )
            .await?;

        Ok((
            totals,
            top_content.iter().map(counted_id).collect(),
            top_users.iter().map(counted_id).collect(),
        ))
    }

    // -----------------------------------------------------------------------
    // Content and transcripts

    pub async fn content_get(&self, content_id: &str) -> Result<Option<ContentRow>, AppError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT content_id, source, title, channel_name, page_url, page_host,
                        caption_language, transcript_status, transcript_fetched_at, updated_at
                 FROM content
                 WHERE content_id = $1",
                &[&content_id],
            )
            .await?;
        Ok(row.map(|row| content_row(&row)))
    }

    pub async fn content_set_meta(
        &self,
        content_id: &str,
        title: Option<&str>,
        channel_name: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE content
             SET title = COALESCE($2, title),
                 channel_name = COALESCE($3, channel_name),
                 updated_at = now()
             WHERE content_id = $1",
            &[&content_id, &title, &channel_name],
        )
        .await?;
        Ok(())
    }

    pub async fn last_segment(&self, content_id: &str) -> Result<Option<SegmentSpan>, AppError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT start, dur FROM transcript_segments
                 WHERE content_id = $1
                 ORDER BY start DESC
                 LIMIT 1",
                &[&content_id],
            )
            .await?;
        Ok(row.map(|row| SegmentSpan {
            start: row.get("start"),
            dur: row.get("dur"),
        }))
    }

    pub async fn segments_between(
        &self,
        content_id: &str,
        lower: f64,
        upper: f64,
        fetch_cap: i64,
    ) -> Result<Vec<Segment>, AppError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT start, dur, text FROM transcript_segments
                 WHERE content_id = $1 AND start >= $2 AND start <= $3
                 ORDER BY start ASC
                 LIMIT $4",
                &[&content_id, &lower, &upper, &fetch_cap],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| Segment {
                start: row.get("start"),
                dur: row.get("dur"),
                text: row.get("text"),
            })
            .collect())
    }
}

fn parse_vote_type(row: &Row) -> Option<VoteType> {
    let raw: String = row.get("vote_type");
    let parsed = VoteType::parse(&raw);
    if parsed.is_none() {
        warn!("Skipping row with unexpected vote_type {raw:?}");
    }
    parsed
}

fn counted_id(row: &Row) -> CountedId {
    CountedId {
        id: row.get("id"),
        count: row.get("n"),
    }
}

fn content_row(row: &Row) -> ContentRow {
    ContentRow {
        content_id: row.get("content_id"),
        source: row.get("source"),
        title: row.get("title"),
        channel_name: row.get("channel_name"),
        page_url: row.get("page_url"),
        page_host: row.get("page_host"),
        caption_language: row.get("caption_language"),
        transcript_status: row.get("transcript_status"),
        transcript_fetched_at: row.get("transcript_fetched_at"),
        updated_at: row.get("updated_at"),
    }
}
