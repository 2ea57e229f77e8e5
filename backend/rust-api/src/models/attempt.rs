use chrono::{DateTime, Utc};
use mongodb::bson::{oid::ObjectId, Document};
use serde::{Deserialize, Serialize};

use super::assignment::bson_datetime_as_chrono;

/// Immutable attempt record stored in MongoDB "attempts" collection.
///
/// `score` and `results` are serialized even when `None` so the stored
/// document carries explicit BSON nulls and reads round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(rename = "assignmentId")]
    pub assignment_id: ObjectId,

    #[serde(rename = "studentEmail")]
    pub student_email: String,

    #[serde(rename = "studentName")]
    pub student_name: String,

    /// Seconds spent on the attempt, already sanitized (finite, >= 0).
    pub duration: f64,

    /// Sanitized score; null when the client sent nothing usable.
    pub score: Option<f64>,

    /// Opaque per-game payload; null when absent.
    pub results: Option<Document>,

    /// How the recording identity was established.
    pub identity: IdentityProvenance,

    #[serde(with = "bson_datetime_as_chrono")]
    pub timestamp: DateTime<Utc>,
}

/// Provenance of the identity a play session runs under.
///
/// `TrustedLink`: fabricated from the assignment itself (link possession
/// only). `Verified`: proven via the emailed one-time code. `Asserted`:
/// client-claimed through the bypass path, no proof at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityProvenance {
    TrustedLink,
    Verified,
    Asserted,
}

impl IdentityProvenance {
    pub fn as_str(&self) -> &str {
        match self {
            IdentityProvenance::TrustedLink => "trusted_link",
            IdentityProvenance::Verified => "verified",
            IdentityProvenance::Asserted => "asserted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trusted_link" => Some(IdentityProvenance::TrustedLink),
            "verified" => Some(IdentityProvenance::Verified),
            "asserted" => Some(IdentityProvenance::Asserted),
            _ => None,
        }
    }
}

/// Request body for recording an attempt.
#[derive(Debug, Deserialize)]
pub struct RecordAttemptRequest {
    /// Raw client-reported duration; sanitized before storage.
    #[serde(rename = "durationSeconds", default)]
    pub duration_seconds: Option<f64>,

    #[serde(default)]
    pub score: Option<f64>,

    #[serde(default)]
    pub results: Option<serde_json::Value>,

    /// Optional echo of the link token the client is playing under. When
    /// present it must match the session's assignment, otherwise the write
    /// is rejected.
    #[serde(default)]
    pub token: Option<String>,
}

/// Response after recording an attempt.
#[derive(Debug, Serialize)]
pub struct RecordAttemptResponse {
    #[serde(rename = "attemptId")]
    pub attempt_id: String,
    #[serde(rename = "completedCount")]
    pub completed_count: i32,
    #[serde(rename = "timesRequired")]
    pub times_required: i32,
    pub status: super::assignment::AssignmentStatus,
    /// True when the attempt is durable but the assignment counters could
    /// not be updated; the client may retry or just refresh later.
    #[serde(rename = "countersStale")]
    pub counters_stale: bool,
}

/// Gradebook row returned to the teacher.
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub id: String,
    #[serde(rename = "studentEmail")]
    pub student_email: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    pub duration: f64,
    pub score: Option<f64>,
    pub identity: IdentityProvenance,
    pub timestamp: DateTime<Utc>,
}

impl From<Attempt> for AttemptView {
    fn from(attempt: Attempt) -> Self {
        AttemptView {
            id: attempt.id.map(|id| id.to_hex()).unwrap_or_default(),
            student_email: attempt.student_email,
            student_name: attempt.student_name,
            duration: attempt.duration,
            score: attempt.score,
            identity: attempt.identity,
            timestamp: attempt.timestamp,
        }
    }
}
