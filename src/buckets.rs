//! Time-bucket vote aggregation.
//!
//! Votes carry a second-resolution timestamp; the timeline groups them into
//! fixed-width buckets so the dashboard can draw a density chart and pick
//! "top moments" without touching raw rows.

use std::collections::BTreeMap;

use crate::models::{SegmentSpan, VoteBucket, VoteType};

pub const DEFAULT_BUCKET_SIZE: i32 = 5;
pub const DEFAULT_TOP_LIMIT: i64 = 10;
pub const MAX_TOP_LIMIT: i64 = 50;

/// One `(time_bucket, vote_type)` group as counted by the store.
#[derive(Debug, Clone, Copy)]
pub struct GroupedCount {
    pub time_bucket: i32,
    pub vote_type: VoteType,
    pub count: i64,
}

/// Bucket key for a raw timestamp: `floor(seconds / size) * size`.
pub fn bucket_for(seconds: i32, bucket_size: i32) -> i32 {
    seconds.div_euclid(bucket_size) * bucket_size
}

/// Folds per-type groups into one row per bucket, zero-filling the side
/// with no votes. Output is ordered by bucket.
pub fn fold_buckets(groups: impl IntoIterator<Item = GroupedCount>) -> Vec<VoteBucket> {
    let mut by_bucket: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
    for group in groups {
        let slot = by_bucket.entry(group.time_bucket).or_default();
        match group.vote_type {
            VoteType::Up => slot.0 = group.count,
            VoteType::Down => slot.1 = group.count,
        }
    }

    by_bucket
        .into_iter()
        .map(|(time_bucket, (up, down))| VoteBucket {
            time_bucket,
            up,
            down,
            score: up - down,
            total: up + down,
        })
        .collect()
}

/// Buckets ranked by upvotes, ties broken by total activity.
pub fn top_moments(buckets: &[VoteBucket], limit: usize) -> Vec<VoteBucket> {
    let mut ranked = buckets.to_vec();
    ranked.sort_by(|a, b| b.up.cmp(&a.up).then(b.total.cmp(&a.total)));
    ranked.truncate(limit);
    ranked
}

/// Requested top-moment count, defaulted and capped.
pub fn clamp_top_limit(requested: Option<i64>) -> usize {
    match requested {
        Some(n) if n > 0 => n.min(MAX_TOP_LIMIT) as usize,
        _ => DEFAULT_TOP_LIMIT as usize,
    }
}

/// Timeline length in seconds: the end of the last transcript segment wins,
/// then the latest vote timestamp, then zero.
pub fn resolve_duration(last_segment: Option<SegmentSpan>, max_vote_seconds: Option<i32>) -> f64 {
    if let Some(segment) = last_segment {
        return (segment.start + segment.dur).max(0.0);
    }
    max_vote_seconds.map(f64::from).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(time_bucket: i32, count: i64) -> GroupedCount {
        GroupedCount {
            time_bucket,
            vote_type: VoteType::Up,
            count,
        }
    }

    fn down(time_bucket: i32, count: i64) -> GroupedCount {
        GroupedCount {
            time_bucket,
            vote_type: VoteType::Down,
            count,
        }
    }

    #[test]
    fn bucket_for_floors_to_bucket_width() {
        assert_eq!(bucket_for(3, 5), 0);
        assert_eq!(bucket_for(4, 5), 0);
        assert_eq!(bucket_for(7, 5), 5);
        assert_eq!(bucket_for(5, 5), 5);
        assert_eq!(bucket_for(0, 5), 0);
    }

    #[test]
    fn fold_zero_fills_missing_sides() {
        // Votes at t=3, t=4 (both UP) and t=7 (DOWN) with bucket size 5.
        let buckets = fold_buckets([up(0, 2), down(5, 1)]);

        assert_eq!(
            buckets,
            vec![
                VoteBucket {
                    time_bucket: 0,
                    up: 2,
                    down: 0,
                    score: 2,
                    total: 2
                },
                VoteBucket {
                    time_bucket: 5,
                    up: 0,
                    down: 1,
                    score: -1,
                    total: 1
                },
            ]
        );
    }

    #[test]
    fn fold_merges_both_sides_of_one_bucket() {
        let buckets = fold_buckets([up(10, 3), down(10, 5)]);

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].up, 3);
        assert_eq!(buckets[0].down, 5);
        assert_eq!(buckets[0].score, -2);
        assert_eq!(buckets[0].total, 8);
    }

    #[test]
    fn top_moments_breaks_up_ties_by_total() {
        let buckets = fold_buckets([up(0, 3), down(0, 2), up(5, 3)]);

        let top = top_moments(&buckets, 2);
        assert_eq!(top[0].time_bucket, 0); // up=3 total=5
        assert_eq!(top[1].time_bucket, 5); // up=3 total=3
    }

    #[test]
    fn top_moments_truncates_to_limit() {
        let buckets = fold_buckets([up(0, 5), up(5, 4), up(10, 3)]);
        assert_eq!(top_moments(&buckets, 2).len(), 2);
    }

    #[test]
    fn top_limit_defaults_and_caps() {
        assert_eq!(clamp_top_limit(None), 10);
        assert_eq!(clamp_top_limit(Some(25)), 25);
        assert_eq!(clamp_top_limit(Some(500)), 50);
        assert_eq!(clamp_top_limit(Some(0)), 10);
        assert_eq!(clamp_top_limit(Some(-3)), 10);
    }

    #[test]
    fn duration_prefers_transcript_over_votes() {
        let segment = SegmentSpan {
            start: 100.0,
            dur: 20.0,
        };
        assert_eq!(resolve_duration(Some(segment), Some(90)), 120.0);
        assert_eq!(resolve_duration(None, Some(90)), 90.0);
        assert_eq!(resolve_duration(None, None), 0.0);
    }
}
