use anyhow::Context;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::ReturnDocument;
use mongodb::Database;
use redis::aio::ConnectionManager;
use thiserror::Error;

use crate::metrics::{
    track_cache_operation, track_db_operation, ATTEMPTS_RATE_LIMITED_TOTAL,
    ATTEMPTS_RECORDED_TOTAL,
};
use crate::middlewares::auth::PlaySessionClaims;
use crate::middlewares::rate_limit::{
    check_rate_limit_with_window, env_limit, rate_limiting_disabled,
};
use crate::models::assignment::{Assignment, AssignmentStatus};
use crate::models::attempt::{Attempt, RecordAttemptRequest, RecordAttemptResponse};
use crate::utils::time::chrono_to_bson;

const ATTEMPT_RATE_LIMIT: u32 = 5; // attempts per window per email+assignment
const ATTEMPT_RATE_WINDOW_SECONDS: u64 = 300; // 5 minutes

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Too many attempts recorded, please slow down")]
    RateLimited,
    #[error("Assignment not found")]
    AssignmentNotFound,
    #[error("This session does not match the assignment")]
    Forbidden,
    #[error("Internal error")]
    Storage(#[from] anyhow::Error),
}

/// Client-reported duration, coerced into a finite non-negative number.
pub fn sanitize_duration(raw: Option<f64>) -> f64 {
    match raw {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        _ => 0.0,
    }
}

/// Score is nulled rather than clamped when unusable.
pub fn sanitize_score(raw: Option<f64>) -> Option<f64> {
    raw.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Per-game result payload: stored verbatim when it is a JSON object,
/// nulled for anything else.
pub fn sanitize_results(raw: Option<&serde_json::Value>) -> Option<Document> {
    raw.and_then(|value| match value {
        serde_json::Value::Object(_) => mongodb::bson::to_document(value).ok(),
        _ => None,
    })
}

/// Status the client should see after one more attempt landed. The stored
/// status may briefly lag this while the completed promotion runs.
pub fn status_after_increment(assignment: &Assignment) -> AssignmentStatus {
    if assignment.completed_count >= assignment.times_required {
        AssignmentStatus::Completed
    } else {
        assignment.status
    }
}

/// Records immutable attempts and keeps the assignment's completion counters
/// in step. The attempt insert is the source of truth; counter updates that
/// fail afterwards degrade to a `countersStale` warning instead of an error.
pub struct AttemptService {
    mongo: Database,
    redis: ConnectionManager,
}

impl AttemptService {
    pub fn new(mongo: Database, redis: ConnectionManager) -> Self {
        Self { mongo, redis }
    }

    pub async fn record(
        &self,
        claims: &PlaySessionClaims,
        req: &RecordAttemptRequest,
    ) -> Result<RecordAttemptResponse, RecordError> {
        let assignment_id = ObjectId::parse_str(&claims.assignment_id)
            .map_err(|_| RecordError::AssignmentNotFound)?;

        // Rejected attempts must leave no trace, so the limiter runs first.
        self.enforce_rate_limit(&claims.sub, &assignment_id).await?;

        let assignments = self.mongo.collection::<Assignment>("assignments");
        let assignment = track_db_operation("find_one", "assignments", async {
            assignments
                .find_one(doc! { "_id": assignment_id })
                .await
                .context("Failed to load assignment for attempt")
        })
        .await?
        .ok_or(RecordError::AssignmentNotFound)?;

        // Clients that echo their link token must echo the right one.
        if let Some(token) = req.token.as_deref() {
            let token = token.trim();
            if !token.is_empty() && token != assignment.link_token {
                tracing::warn!(
                    "Attempt token mismatch for assignment {}: write rejected",
                    claims.assignment_id
                );
                return Err(RecordError::Forbidden);
            }
        }

        let now = Utc::now();
        let attempt = Attempt {
            id: None,
            assignment_id,
            student_email: claims.sub.clone(),
            student_name: claims.name.clone(),
            duration: sanitize_duration(req.duration_seconds),
            score: sanitize_score(req.score),
            results: sanitize_results(req.results.as_ref()),
            identity: claims.provenance(),
            timestamp: now,
        };

        let attempts = self.mongo.collection::<Attempt>("attempts");
        let inserted = track_db_operation("insert_one", "attempts", async {
            attempts
                .insert_one(&attempt)
                .await
                .context("Failed to record attempt")
        })
        .await?;
        let attempt_id = inserted
            .inserted_id
            .as_object_id()
            .map(|id| id.to_hex())
            .unwrap_or_default();

        ATTEMPTS_RECORDED_TOTAL
            .with_label_values(&[attempt.identity.as_str()])
            .inc();
        tracing::info!(
            "Recorded attempt {} for assignment {} ({})",
            attempt_id,
            claims.assignment_id,
            attempt.identity.as_str()
        );

        // Counters are a projection over attempts; losing this update is
        // recoverable, losing the attempt would not be.
        match self.advance_counters(&assignment, assignment_id, now).await {
            Ok(updated) => Ok(RecordAttemptResponse {
                attempt_id,
                completed_count: updated.completed_count,
                times_required: updated.times_required,
                status: status_after_increment(&updated),
                counters_stale: false,
            }),
            Err(e) => {
                tracing::warn!(
                    "Attempt {} durable but assignment counters not updated: {}",
                    attempt_id,
                    e
                );
                Ok(RecordAttemptResponse {
                    attempt_id,
                    completed_count: assignment.completed_count,
                    times_required: assignment.times_required,
                    status: assignment.status,
                    counters_stale: true,
                })
            }
        }
    }

    /// Three-step counter update: start transition, atomic increment,
    /// completed promotion. `$inc` keeps concurrent recorders from losing
    /// increments to each other.
    async fn advance_counters(
        &self,
        before: &Assignment,
        assignment_id: ObjectId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Assignment> {
        let assignments = self.mongo.collection::<Assignment>("assignments");

        if before.status == AssignmentStatus::Assigned {
            track_db_operation("update_one", "assignments", async {
                assignments
                    .update_one(
                        doc! {
                            "_id": assignment_id,
                            "status": AssignmentStatus::Assigned.as_str(),
                        },
                        doc! { "$set": { "status": AssignmentStatus::Started.as_str() } },
                    )
                    .await
                    .context("Failed to mark assignment started")?;
                Ok(())
            })
            .await?;
        }

        let updated = track_db_operation("find_one_and_update", "assignments", async {
            assignments
                .find_one_and_update(
                    doc! { "_id": assignment_id },
                    doc! {
                        "$inc": { "completedCount": 1 },
                        "$set": { "lastCompletedAt": chrono_to_bson(now) },
                    },
                )
                .return_document(ReturnDocument::After)
                .await
                .context("Failed to increment completion counter")
        })
        .await?
        .context("Assignment disappeared while updating counters")?;

        if updated.completed_count >= updated.times_required
            && updated.status != AssignmentStatus::Completed
        {
            track_db_operation("update_one", "assignments", async {
                assignments
                    .update_one(
                        doc! {
                            "_id": assignment_id,
                            "completedCount": { "$gte": updated.times_required },
                            "status": { "$ne": AssignmentStatus::Completed.as_str() },
                        },
                        doc! { "$set": { "status": AssignmentStatus::Completed.as_str() } },
                    )
                    .await
                    .context("Failed to promote assignment to completed")?;
                Ok(())
            })
            .await?;
        }

        Ok(updated)
    }

    async fn enforce_rate_limit(
        &self,
        email: &str,
        assignment_id: &ObjectId,
    ) -> Result<(), RecordError> {
        if rate_limiting_disabled() {
            return Ok(());
        }

        let key = format!(
            "ratelimit:attempt:{}:{}",
            assignment_id.to_hex(),
            email.trim().to_lowercase()
        );
        let limit = env_limit("ATTEMPT_RATE_LIMIT", ATTEMPT_RATE_LIMIT);

        let allowed = track_cache_operation("rate_limit", async {
            check_rate_limit_with_window(&self.redis, &key, limit, ATTEMPT_RATE_WINDOW_SECONDS)
                .await
        })
        .await?;

        if !allowed {
            ATTEMPTS_RATE_LIMITED_TOTAL.inc();
            tracing::warn!("Attempt rate limit exceeded for {}", key);
            return Err(RecordError::RateLimited);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment(
        status: AssignmentStatus,
        completed_count: i32,
        times_required: i32,
    ) -> Assignment {
        Assignment {
            id: Some(ObjectId::new()),
            link_token: "aabbccddeeff00112233445566778899".to_string(),
            teacher_id: ObjectId::new(),
            student_email: "student@example.com".to_string(),
            student_name: "Student".to_string(),
            game_id: ObjectId::new(),
            game_type: "verse-scramble".to_string(),
            deadline: Utc::now(),
            times_required,
            completed_count,
            status,
            email_sent: true,
            created_at: Utc::now(),
            last_completed_at: None,
        }
    }

    #[test]
    fn duration_passes_through_when_sane() {
        assert_eq!(sanitize_duration(Some(12.5)), 12.5);
        assert_eq!(sanitize_duration(Some(0.0)), 0.0);
    }

    #[test]
    fn duration_coerces_garbage_to_zero() {
        assert_eq!(sanitize_duration(None), 0.0);
        assert_eq!(sanitize_duration(Some(f64::NAN)), 0.0);
        assert_eq!(sanitize_duration(Some(f64::INFINITY)), 0.0);
        assert_eq!(sanitize_duration(Some(f64::NEG_INFINITY)), 0.0);
        assert_eq!(sanitize_duration(Some(-5.0)), 0.0);
    }

    #[test]
    fn score_keeps_sane_values_including_zero() {
        assert_eq!(sanitize_score(Some(88.5)), Some(88.5));
        assert_eq!(sanitize_score(Some(0.0)), Some(0.0));
    }

    #[test]
    fn score_nulls_garbage() {
        assert_eq!(sanitize_score(None), None);
        assert_eq!(sanitize_score(Some(f64::NAN)), None);
        assert_eq!(sanitize_score(Some(f64::INFINITY)), None);
        assert_eq!(sanitize_score(Some(-1.0)), None);
    }

    #[test]
    fn results_object_is_stored_as_document() {
        let value = json!({ "rounds": [1, 2], "perfect": true });
        let doc = sanitize_results(Some(&value)).unwrap();
        assert!(doc.contains_key("rounds"));
        assert_eq!(doc.get_bool("perfect").unwrap(), true);
    }

    #[test]
    fn results_non_object_is_nulled() {
        assert!(sanitize_results(Some(&json!([1, 2, 3]))).is_none());
        assert!(sanitize_results(Some(&json!("text"))).is_none());
        assert!(sanitize_results(Some(&json!(42))).is_none());
        assert!(sanitize_results(None).is_none());
    }

    #[test]
    fn status_stays_below_requirement() {
        let a = assignment(AssignmentStatus::Started, 1, 3);
        assert_eq!(status_after_increment(&a), AssignmentStatus::Started);
    }

    #[test]
    fn status_completes_at_requirement() {
        let a = assignment(AssignmentStatus::Started, 3, 3);
        assert_eq!(status_after_increment(&a), AssignmentStatus::Completed);
    }

    #[test]
    fn status_completes_beyond_requirement() {
        let a = assignment(AssignmentStatus::Started, 5, 3);
        assert_eq!(status_after_increment(&a), AssignmentStatus::Completed);
    }

    #[test]
    fn completion_tracks_counter_over_a_whole_run() {
        // status must read completed exactly when count >= required
        let required = 3;
        for count in 0..=5 {
            let a = assignment(AssignmentStatus::Started, count, required);
            let status = status_after_increment(&a);
            if count >= required {
                assert_eq!(status, AssignmentStatus::Completed, "count={}", count);
            } else {
                assert_eq!(status, AssignmentStatus::Started, "count={}", count);
            }
        }
    }
}
