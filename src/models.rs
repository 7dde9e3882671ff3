use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteType {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

impl VoteType {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteType::Up => "UP",
            VoteType::Down => "DOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UP" => Some(VoteType::Up),
            "DOWN" => Some(VoteType::Down),
            _ => None,
        }
    }
}

/// One fixed-width slice of a content's timeline with its vote counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteBucket {
    pub time_bucket: i32,
    pub up: i64,
    pub down: i64,
    pub score: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTotals {
    pub up: i64,
    pub down: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRow {
    pub id: i64,
    pub user_id: String,
    pub content_id: String,
    pub time_seconds: i32,
    pub vote_type: VoteType,
    pub page_url: Option<String>,
    pub page_host: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSpan {
    pub start: f64,
    pub dur: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub dur: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRow {
    pub content_id: String,
    pub source: Option<String>,
    pub title: Option<String>,
    pub channel_name: Option<String>,
    pub page_url: Option<String>,
    pub page_host: Option<String>,
    pub caption_language: Option<String>,
    pub transcript_status: Option<String>,
    pub transcript_fetched_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Response payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    pub ok: bool,
    pub content_id: String,
    pub duration_seconds: f64,
    pub totals: VoteTotals,
    pub buckets: Vec<VoteBucket>,
    pub top_up: Vec<VoteBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetPayload {
    pub ok: bool,
    pub content_id: String,
    pub center: f64,
    pub window: i64,
    pub range: SnippetRange,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(flatten)]
    pub row: ContentRow,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDetailPayload {
    pub ok: bool,
    pub item: Option<ContentItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaItem {
    #[serde(flatten)]
    pub row: ContentRow,
    pub duration_seconds: Option<f64>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPayload {
    pub ok: bool,
    pub item: Option<MetaItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminContentItem {
    pub content_id: String,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub page_url: Option<String>,
    pub last_voted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminContentPayload {
    pub ok: bool,
    pub items: Vec<AdminContentItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotesListPayload {
    pub ok: bool,
    pub total: i64,
    pub votes: Vec<VoteRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountedId {
    pub id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsTotals {
    pub votes: i64,
    pub upvotes: i64,
    pub downvotes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub ok: bool,
    pub totals: StatsTotals,
    pub top_content: Vec<CountedId>,
    pub top_users: Vec<CountedId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePayload {
    pub ok: bool,
    pub content_id: String,
    pub totals: VoteTotals,
    pub duration_seconds: f64,
    pub timeline: Vec<VoteBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedVote {
    pub id: i64,
    pub content_id: String,
    pub time_seconds: i32,
    pub time_bucket: i32,
    pub vote_type: VoteType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSavedPayload {
    pub ok: bool,
    pub saved: SavedVote,
}
