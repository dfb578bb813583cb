//! Query predicates for batch fetches.

use crate::snapshot::{Snapshot, SnapshotStatus};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Closed set of predicates over snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotCriteria {
    All,
    Category { category: String },
    Tag { tag: String },
    /// Creation timestamp within `[from, to]` (open ends when None).
    TimeRange {
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    },
    Status { status: SnapshotStatus },
    And { criteria: Vec<SnapshotCriteria> },
    Or { criteria: Vec<SnapshotCriteria> },
    Not { criteria: Box<SnapshotCriteria> },
}

impl SnapshotCriteria {
    pub fn category(category: impl Into<String>) -> Self {
        SnapshotCriteria::Category {
            category: category.into(),
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        SnapshotCriteria::Tag { tag: tag.into() }
    }

    pub fn between(from: Timestamp, to: Timestamp) -> Self {
        SnapshotCriteria::TimeRange {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn status(status: SnapshotStatus) -> Self {
        SnapshotCriteria::Status { status }
    }

    pub fn and(self, other: SnapshotCriteria) -> Self {
        match self {
            SnapshotCriteria::And { mut criteria } => {
                criteria.push(other);
                SnapshotCriteria::And { criteria }
            }
            first => SnapshotCriteria::And {
                criteria: vec![first, other],
            },
        }
    }

    pub fn or(self, other: SnapshotCriteria) -> Self {
        match self {
            SnapshotCriteria::Or { mut criteria } => {
                criteria.push(other);
                SnapshotCriteria::Or { criteria }
            }
            first => SnapshotCriteria::Or {
                criteria: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        SnapshotCriteria::Not {
            criteria: Box::new(self),
        }
    }

    /// Evaluate against a snapshot, using `now` for expiration status.
    pub fn matches<T>(&self, snapshot: &Snapshot<T>, now: Timestamp) -> bool {
        match self {
            SnapshotCriteria::All => true,
            SnapshotCriteria::Category { category } => snapshot.category == *category,
            SnapshotCriteria::Tag { tag } => snapshot.has_tag(tag),
            SnapshotCriteria::TimeRange { from, to } => {
                from.map_or(true, |f| snapshot.timestamp >= f)
                    && to.map_or(true, |t| snapshot.timestamp <= t)
            }
            SnapshotCriteria::Status { status } => {
                let current = if snapshot.is_expired_at(now) {
                    SnapshotStatus::Expired
                } else {
                    SnapshotStatus::Active
                };
                current == *status
            }
            SnapshotCriteria::And { criteria } => criteria.iter().all(|c| c.matches(snapshot, now)),
            SnapshotCriteria::Or { criteria } => criteria.iter().any(|c| c.matches(snapshot, now)),
            SnapshotCriteria::Not { criteria } => !criteria.matches(snapshot, now),
        }
    }
}

impl Default for SnapshotCriteria {
    fn default() -> Self {
        SnapshotCriteria::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotInput;
    use std::time::Duration;

    fn snapshot(id: &str, category: &str, tags: &[&str], at: i64) -> Snapshot<u32> {
        SnapshotInput::new(id, category, 0u32)
            .with_tags(tags.iter().copied())
            .into_snapshot(Timestamp::from_millis(at))
    }

    #[test]
    fn test_simple_predicates() {
        let now = Timestamp::from_millis(1_000);
        let s = snapshot("s1", "orders", &["vip"], 100);

        assert!(SnapshotCriteria::All.matches(&s, now));
        assert!(SnapshotCriteria::category("orders").matches(&s, now));
        assert!(!SnapshotCriteria::category("billing").matches(&s, now));
        assert!(SnapshotCriteria::tag("vip").matches(&s, now));
        assert!(!SnapshotCriteria::tag("late").matches(&s, now));
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let now = Timestamp::from_millis(1_000);
        let s = snapshot("s1", "orders", &[], 100);

        assert!(SnapshotCriteria::between(Timestamp::from_millis(100), Timestamp::from_millis(100))
            .matches(&s, now));
        assert!(!SnapshotCriteria::TimeRange {
            from: Some(Timestamp::from_millis(101)),
            to: None
        }
        .matches(&s, now));
    }

    #[test]
    fn test_status_uses_given_clock() {
        let mut s = snapshot("s1", "orders", &[], 100);
        s.expiration_date = Some(Timestamp::from_millis(500));

        let before = Timestamp::from_millis(400);
        let after = Timestamp::from_millis(1_000).saturating_add(Duration::from_millis(1));

        assert!(SnapshotCriteria::status(SnapshotStatus::Active).matches(&s, before));
        assert!(SnapshotCriteria::status(SnapshotStatus::Expired).matches(&s, after));
    }

    #[test]
    fn test_combinators() {
        let now = Timestamp::from_millis(1_000);
        let s = snapshot("s1", "orders", &["vip"], 100);

        let both = SnapshotCriteria::category("orders").and(SnapshotCriteria::tag("vip"));
        assert!(both.matches(&s, now));

        let either = SnapshotCriteria::category("billing").or(SnapshotCriteria::tag("vip"));
        assert!(either.matches(&s, now));

        assert!(!SnapshotCriteria::tag("vip").negate().matches(&s, now));
    }

    #[test]
    fn test_criteria_from_json() {
        let criteria: SnapshotCriteria = serde_json::from_str(
            r#"{"kind": "and", "criteria": [{"kind": "category", "category": "orders"}, {"kind": "tag", "tag": "vip"}]}"#,
        )
        .unwrap();
        assert_eq!(
            criteria,
            SnapshotCriteria::category("orders").and(SnapshotCriteria::tag("vip"))
        );
    }
}
