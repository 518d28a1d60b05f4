//! Observational health scoring. No remediation, no data movement — the
//! score only ever feeds displays.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use time::OffsetDateTime;

use cloudfs_core::{clock, CloudfsError, CloudfsResult};
use cloudfs_index::{EncryptedStore, SqlExt};

#[derive(Debug, Clone)]
pub struct EntryHealth {
    pub entry_id: i64,
    pub entry_name: String,
    /// 0.0 (critical) ..= 1.0 (excellent).
    pub score: f64,
    pub replication_count: i64,
    pub last_verified: Option<OffsetDateTime>,
    pub verification_age_days: Option<i64>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OverallHealth {
    pub total_entries: i64,
    pub healthy_entries: i64,
    pub warning_entries: i64,
    pub critical_entries: i64,
    pub average_score: f64,
    pub unplaced_count: i64,
}

/// The fixed scoring formula: no placements 0.2; one placement −0.2; last
/// verification more than 30 days ago or never −0.3, 7..=30 days −0.1;
/// floored at zero.
pub fn score(replication_count: i64, last_verified: Option<OffsetDateTime>) -> f64 {
    if replication_count == 0 {
        return 0.2;
    }
    let mut score = 1.0;
    if replication_count < 2 {
        score -= 0.2;
    }
    match last_verified {
        None => score -= 0.3,
        Some(t) => {
            let days = clock::days_since(t);
            if days > 30 {
                score -= 0.3;
            } else if days >= 7 {
                score -= 0.1;
            }
        }
    }
    score.max(0.0)
}

pub fn describe(score: f64) -> &'static str {
    match score {
        s if s >= 0.9 => "excellent",
        s if s >= 0.8 => "good",
        s if s >= 0.6 => "fair",
        s if s >= 0.4 => "warning",
        _ => "critical",
    }
}

pub fn entry_health(store: &Arc<EncryptedStore>, entry_id: i64) -> CloudfsResult<EntryHealth> {
    let (entry_name, replication_count, last_verified) = store.with_conn(|conn| {
        let name: String = conn
            .query_row("SELECT name FROM entries WHERE id = ?1", [entry_id], |r| {
                r.get(0)
            })
            .optional()
            .sql()?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {entry_id}")))?;
        let count: i64 = conn
            .query_row(
                "SELECT count(p.id) FROM versions v
                 JOIN placements p ON v.id = p.version_id
                 WHERE v.entry_id = ?1 AND v.state = 'active'
                   AND p.state IN ('uploaded', 'verified')",
                [entry_id],
                |r| r.get(0),
            )
            .sql()?;
        let verified: Option<String> = conn
            .query_row(
                "SELECT MAX(p.verified_at) FROM versions v
                 JOIN placements p ON v.id = p.version_id
                 WHERE v.entry_id = ?1 AND v.state = 'active'",
                [entry_id],
                |r| r.get(0),
            )
            .optional()
            .sql()?
            .flatten();
        Ok((name, count, verified))
    })?;

    let last_verified = last_verified
        .as_deref()
        .map(clock::parse_rfc3339)
        .transpose()?;
    let verification_age_days = last_verified.map(clock::days_since);
    let score = score(replication_count, last_verified);

    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    if replication_count == 0 {
        issues.push("no provider placements".to_string());
        recommendations.push("run `cloudfs push` to upload".to_string());
    } else if replication_count < 2 {
        issues.push("single placement".to_string());
        recommendations.push("add a second provider for redundancy".to_string());
    }
    match verification_age_days {
        None if replication_count > 0 => {
            issues.push("never verified against provider".to_string());
            recommendations.push("run `cloudfs verify`".to_string());
        }
        Some(days) if days > 30 => {
            issues.push(format!("not verified in {days} days"));
            recommendations.push("run `cloudfs verify`".to_string());
        }
        _ => {}
    }

    Ok(EntryHealth {
        entry_id,
        entry_name,
        score,
        replication_count,
        last_verified,
        verification_age_days,
        issues,
        recommendations,
    })
}

pub fn overall_health(store: &Arc<EncryptedStore>) -> CloudfsResult<OverallHealth> {
    store.with_conn(|conn| {
        let mut health = OverallHealth::default();

        health.total_entries = conn
            .query_row(
                "SELECT count(*) FROM entries WHERE entry_kind = 'file'",
                [],
                |r| r.get(0),
            )
            .sql()?;

        let mut stmt = conn
            .prepare(
                "SELECT v.entry_id,
                        count(p.id),
                        MAX(p.verified_at)
                 FROM versions v
                 LEFT JOIN placements p
                   ON v.id = p.version_id AND p.state IN ('uploaded', 'verified')
                 WHERE v.state = 'active'
                 GROUP BY v.entry_id",
            )
            .sql()?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, i64>(1)?, r.get::<_, Option<String>>(2)?))
            })
            .sql()?
            .collect::<rusqlite::Result<Vec<_>>>()
            .sql()?;

        let mut sum = 0.0;
        let mut scored = 0i64;
        for (count, verified) in rows {
            let verified = verified.as_deref().map(clock::parse_rfc3339).transpose()?;
            let s = score(count, verified);
            sum += s;
            scored += 1;
            if count == 0 {
                health.unplaced_count += 1;
            }
            if s >= 0.8 {
                health.healthy_entries += 1;
            } else if s >= 0.5 {
                health.warning_entries += 1;
            } else {
                health.critical_entries += 1;
            }
        }
        health.average_score = if scored > 0 { sum / scored as f64 } else { 1.0 };
        Ok(health)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn no_placements_scores_fixed_floor() {
        assert_eq!(score(0, None), 0.2);
        assert_eq!(score(0, Some(clock::now())), 0.2);
    }

    #[test]
    fn single_unverified_placement() {
        // 1.0 - 0.2 (single) - 0.3 (never verified)
        let s = score(1, None);
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fresh_verification_keeps_full_score() {
        let s = score(2, Some(clock::now()));
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stale_verification_penalties() {
        let s = score(2, Some(clock::now() - Duration::days(10)));
        assert!((s - 0.9).abs() < 1e-9);
        let s = score(2, Some(clock::now() - Duration::days(45)));
        assert!((s - 0.7).abs() < 1e-9);
    }

    #[test]
    fn floor_at_zero() {
        let s = score(1, Some(clock::now() - Duration::days(400)));
        assert!(s >= 0.0);
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn descriptions() {
        assert_eq!(describe(1.0), "excellent");
        assert_eq!(describe(0.5), "warning");
        assert_eq!(describe(0.2), "critical");
    }
}
