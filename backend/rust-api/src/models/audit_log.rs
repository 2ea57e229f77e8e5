use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use super::assignment::bson_datetime_as_chrono;

/// Audit log entry for link-access and sign-in events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    /// Type of event (link resolved, sign-in sent, bypass used, etc.)
    pub event_type: AuditEventType,

    /// Assignment the event concerns (None when the link did not resolve)
    pub assignment_id: Option<String>,

    /// Email involved in the operation
    pub email: Option<String>,

    /// Whether the operation was successful
    pub success: bool,

    /// IP address of the client
    pub ip: Option<String>,

    /// Additional details about the event
    pub details: Option<String>,

    /// Error message if operation failed
    pub error_message: Option<String>,

    /// Timestamp of the event
    #[serde(rename = "createdAt", with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
}

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LinkResolved,
    LinkRejected,
    SignInChallengeSent,
    SignInMismatchWarned,
    SignInCompleted,
    SignInFailed,
    BypassUsed,
    AttemptRecorded,
    AttemptRateLimited,
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AuditEventType::LinkResolved => "link_resolved",
            AuditEventType::LinkRejected => "link_rejected",
            AuditEventType::SignInChallengeSent => "sign_in_challenge_sent",
            AuditEventType::SignInMismatchWarned => "sign_in_mismatch_warned",
            AuditEventType::SignInCompleted => "sign_in_completed",
            AuditEventType::SignInFailed => "sign_in_failed",
            AuditEventType::BypassUsed => "bypass_used",
            AuditEventType::AttemptRecorded => "attempt_recorded",
            AuditEventType::AttemptRateLimited => "attempt_rate_limited",
        }
    }
}
