use chrono::Utc;
use mongodb::Database;

use crate::models::audit_log::{AuditEventType, AuditLog};

/// Parameters for audit event logging
#[derive(Debug)]
pub struct AuditEventParams {
    pub event_type: AuditEventType,
    pub assignment_id: Option<String>,
    pub email: Option<String>,
    pub success: bool,
    pub ip: Option<String>,
    pub details: Option<String>,
    pub error_message: Option<String>,
}

/// Detail line for a resolved link. A blank callback address counts as
/// absent, so plain resolutions keep a single-field detail.
pub fn link_resolved_details(outcome: &str, callback_email: Option<&str>) -> String {
    match callback_email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(claimed) => format!("Resolution outcome: {}; callback email: {}", outcome, claimed),
        None => format!("Resolution outcome: {}", outcome),
    }
}

/// Append-only trail of link accesses, sign-in attempts and recordings.
/// Callers treat logging failures as non-fatal.
pub struct AuditService {
    mongo: Database,
}

impl AuditService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    pub async fn log_event(
        &self,
        params: AuditEventParams,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let audit_log = AuditLog {
            id: None,
            event_type: params.event_type,
            assignment_id: params.assignment_id,
            email: params.email,
            success: params.success,
            ip: params.ip,
            details: params.details,
            error_message: params.error_message,
            created_at: Utc::now(),
        };

        let collection = self.mongo.collection::<AuditLog>("audit_log");
        collection.insert_one(audit_log).await?;

        Ok(())
    }

    /// Log a link token that resolved to an assignment. Sign-in callbacks
    /// carry the address the code was mailed to; it goes into the detail so
    /// the trail shows which identity the callback claimed.
    pub async fn log_link_resolved(
        &self,
        assignment_id: &str,
        email: &str,
        outcome: &str,
        callback_email: Option<&str>,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::LinkResolved,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: true,
            ip,
            details: Some(link_resolved_details(outcome, callback_email)),
            error_message: None,
        })
        .await
    }

    /// Log a link token that did not resolve. Only a prefix of the token is
    /// kept, the trail must not become a token store.
    pub async fn log_link_rejected(
        &self,
        token: &str,
        reason: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let prefix: String = token.chars().take(8).collect();
        self.log_event(AuditEventParams {
            event_type: AuditEventType::LinkRejected,
            assignment_id: None,
            email: None,
            success: false,
            ip,
            details: Some(format!("Token prefix: {}", prefix)),
            error_message: Some(reason.to_string()),
        })
        .await
    }

    /// Log a sign-in challenge email going out
    pub async fn log_signin_challenge_sent(
        &self,
        assignment_id: &str,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::SignInChallengeSent,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: true,
            ip,
            details: None,
            error_message: None,
        })
        .await
    }

    /// Log a withheld challenge because the submitted email did not match
    pub async fn log_signin_mismatch_warned(
        &self,
        assignment_id: &str,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::SignInMismatchWarned,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: false,
            ip,
            details: Some("Submitted email does not match the assignment".to_string()),
            error_message: None,
        })
        .await
    }

    /// Log a completed code-for-session exchange
    pub async fn log_signin_completed(
        &self,
        assignment_id: &str,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::SignInCompleted,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: true,
            ip,
            details: None,
            error_message: None,
        })
        .await
    }

    /// Log a failed sign-in step (challenge or completion)
    pub async fn log_signin_failed(
        &self,
        assignment_id: Option<&str>,
        email: Option<&str>,
        ip: Option<String>,
        error: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::SignInFailed,
            assignment_id: assignment_id.map(|s| s.to_string()),
            email: email.map(|s| s.to_string()),
            success: false,
            ip,
            details: None,
            error_message: Some(error.to_string()),
        })
        .await
    }

    /// Log use of the degraded-trust bypass
    pub async fn log_bypass_used(
        &self,
        assignment_id: &str,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::BypassUsed,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: true,
            ip,
            details: Some("Session minted from client-asserted identity".to_string()),
            error_message: None,
        })
        .await
    }

    /// Log a recorded attempt
    pub async fn log_attempt_recorded(
        &self,
        assignment_id: &str,
        email: &str,
        attempt_id: &str,
        identity: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::AttemptRecorded,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: true,
            ip,
            details: Some(format!("Attempt {} ({})", attempt_id, identity)),
            error_message: None,
        })
        .await
    }

    /// Log an attempt rejected by the per-identity rate limit
    pub async fn log_attempt_rate_limited(
        &self,
        assignment_id: &str,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log_event(AuditEventParams {
            event_type: AuditEventType::AttemptRateLimited,
            assignment_id: Some(assignment_id.to_string()),
            email: Some(email.to_string()),
            success: false,
            ip,
            details: None,
            error_message: Some("Attempt rate limit exceeded".to_string()),
        })
        .await
    }
}
