// ABOUTME: Credit usage tracking with fixed 24-hour windows
// ABOUTME: Atomic consume returning an explicit Ok / Exhausted / Failure outcome

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::Result;

/// Points consumed by one code generation
pub const GENERATION_COST: i64 = 1;

const FREE_POINTS: i64 = 5;
const PRO_POINTS: i64 = 100;
const WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn points(&self) -> i64 {
        match self {
            Self::Free => FREE_POINTS,
            Self::Pro => PRO_POINTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaOutcome {
    Ok {
        remaining: i64,
        resets_at: DateTime<Utc>,
    },
    Exhausted {
        resets_at: DateTime<Utc>,
    },
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatus {
    pub consumed: i64,
    pub remaining: i64,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UsageStorage {
    pool: SqlitePool,
}

impl UsageStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Consume `cost` points for `user_id`, never surfacing storage errors as exhaustion
    pub async fn consume(&self, user_id: &str, plan: Plan, cost: i64) -> QuotaOutcome {
        match self.try_consume(user_id, plan, cost, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Usage check failed for user {}: {}", user_id, e);
                QuotaOutcome::Failure(e.to_string())
            }
        }
    }

    async fn try_consume(
        &self,
        user_id: &str,
        plan: Plan,
        cost: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaOutcome> {
        let now_ms = now.timestamp_millis();
        let window_end_ms = (now + window()).timestamp_millis();

        if cost > plan.points() {
            return Ok(QuotaOutcome::Exhausted {
                resets_at: millis_to_datetime(window_end_ms),
            });
        }

        // A single upsert keeps concurrent consumers from overdrawing the window
        let updated = sqlx::query(
            r#"
            INSERT INTO usage (key, points, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                points = CASE WHEN usage.expires_at <= ?4 THEN excluded.points
                              ELSE usage.points + excluded.points END,
                expires_at = CASE WHEN usage.expires_at <= ?4 THEN excluded.expires_at
                                  ELSE usage.expires_at END
            WHERE usage.expires_at <= ?4 OR usage.points + excluded.points <= ?5
            "#,
        )
        .bind(user_id)
        .bind(cost)
        .bind(window_end_ms)
        .bind(now_ms)
        .bind(plan.points())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = sqlx::query("SELECT points, expires_at FROM usage WHERE key = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        let points: i64 = row.try_get("points")?;
        let resets_at = millis_to_datetime(row.try_get("expires_at")?);

        if updated == 0 {
            debug!("User {} exhausted {} points", user_id, plan.points());
            return Ok(QuotaOutcome::Exhausted { resets_at });
        }

        Ok(QuotaOutcome::Ok {
            remaining: (plan.points() - points).max(0),
            resets_at,
        })
    }

    pub async fn status(&self, user_id: &str, plan: Plan) -> Result<UsageStatus> {
        let row = sqlx::query("SELECT points, expires_at FROM usage WHERE key = ? AND expires_at > ?")
            .bind(user_id)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => {
                let consumed: i64 = row.try_get("points")?;
                UsageStatus {
                    consumed,
                    remaining: (plan.points() - consumed).max(0),
                    resets_at: Some(millis_to_datetime(row.try_get("expires_at")?)),
                }
            }
            None => UsageStatus {
                consumed: 0,
                remaining: plan.points(),
                resets_at: None,
            },
        })
    }
}

fn window() -> Duration {
    Duration::hours(WINDOW_HOURS)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_in_memory;

    #[tokio::test]
    async fn test_window_expiry_resets_points() {
        let pool = open_in_memory().await.unwrap();
        let usage = UsageStorage::new(pool);
        let start = Utc::now();

        for _ in 0..FREE_POINTS {
            let outcome = usage.try_consume("u1", Plan::Free, 1, start).await.unwrap();
            assert!(matches!(outcome, QuotaOutcome::Ok { .. }));
        }
        let outcome = usage.try_consume("u1", Plan::Free, 1, start).await.unwrap();
        assert!(matches!(outcome, QuotaOutcome::Exhausted { .. }));

        let later = start + window() + Duration::seconds(1);
        let outcome = usage.try_consume("u1", Plan::Free, 1, later).await.unwrap();
        assert!(matches!(outcome, QuotaOutcome::Ok { remaining: 4, .. }));
    }

    #[tokio::test]
    async fn test_cost_above_plan_is_exhausted() {
        let pool = open_in_memory().await.unwrap();
        let usage = UsageStorage::new(pool);

        let outcome = usage.consume("u1", Plan::Free, FREE_POINTS + 1).await;
        assert!(matches!(outcome, QuotaOutcome::Exhausted { .. }));
    }
}
