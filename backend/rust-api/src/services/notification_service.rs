use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::Database;
use url::Url;

use crate::models::assignment::{Assignment, AssignmentStatus};
use crate::models::game::GameConfig;
use crate::services::email_service::EmailService;
use crate::utils::retry::{retry_async_with_config, RetryConfig};
use crate::utils::time::chrono_to_bson;

/// What to do about the creation email for a given assignment snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum CreationEmailAction {
    Send,
    AlreadySent,
    NoRecipient,
}

pub fn creation_email_action(assignment: &Assignment) -> CreationEmailAction {
    if assignment.email_sent {
        CreationEmailAction::AlreadySent
    } else if assignment.student_email.trim().is_empty() {
        CreationEmailAction::NoRecipient
    } else {
        CreationEmailAction::Send
    }
}

/// Reminder eligibility: deadline inside [now, now + 24h) and not completed.
/// Past-due assignments get no reminder, the deadline already speaks for itself.
pub fn needs_reminder(assignment: &Assignment, now: DateTime<Utc>) -> bool {
    let window_end = now + Duration::hours(24);
    assignment.status != AssignmentStatus::Completed
        && assignment.deadline >= now
        && assignment.deadline < window_end
}

/// Student-facing play link. `from_email=true` tags the visit so the resolver
/// can treat it as a trusted entry.
pub fn build_play_link(base_url: &str, link_token: &str, from_email: bool) -> String {
    match Url::parse(base_url) {
        Ok(mut url) => {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("token", link_token);
                if from_email {
                    pairs.append_pair("from", "email");
                }
            }
            url.to_string()
        }
        // Relative or otherwise unparseable base, fall back to plain formatting.
        Err(_) => {
            if from_email {
                format!("{}?token={}&from=email", base_url, link_token)
            } else {
                format!("{}?token={}", base_url, link_token)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ReminderRunSummary {
    pub examined: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Sends assignment emails and flips the `emailSent` flag afterwards, so an
/// assignment whose send failed stays visible to the unsent sweep.
pub struct NotificationService {
    mongo: Database,
    email: EmailService,
    play_base_url: String,
}

impl NotificationService {
    pub fn new(mongo: Database, email: EmailService, play_base_url: String) -> Self {
        Self {
            mongo,
            email,
            play_base_url,
        }
    }

    /// Post-issue hook: reload the assignment and send the invitation email.
    /// Runs detached from the issuing request, every failure is logged only.
    pub async fn on_assignment_created(&self, assignment_id: ObjectId) -> Result<()> {
        let collection = self.mongo.collection::<Assignment>("assignments");
        let assignment = collection
            .find_one(doc! { "_id": assignment_id })
            .await
            .context("Failed to reload assignment for notification")?;

        let Some(assignment) = assignment else {
            tracing::warn!(
                "Assignment {} vanished before its invitation email was sent",
                assignment_id.to_hex()
            );
            return Ok(());
        };

        match creation_email_action(&assignment) {
            CreationEmailAction::AlreadySent => {
                tracing::debug!(
                    "Invitation for assignment {} already sent, skipping",
                    assignment_id.to_hex()
                );
                Ok(())
            }
            CreationEmailAction::NoRecipient => {
                tracing::debug!(
                    "Assignment {} has no student email, skipping invitation",
                    assignment_id.to_hex()
                );
                Ok(())
            }
            CreationEmailAction::Send => self.deliver_invitation(&assignment).await,
        }
    }

    /// Catch-up pass over assignments whose invitation never went out.
    /// Returns how many invitations were sent this pass.
    pub async fn sweep_unsent(&self) -> Result<usize> {
        let collection = self.mongo.collection::<Assignment>("assignments");
        let cursor = collection
            .find(doc! { "emailSent": false })
            .sort(doc! { "createdAt": 1 })
            .await
            .context("Failed to query assignments with unsent emails")?;
        let pending: Vec<Assignment> = cursor
            .try_collect()
            .await
            .context("Failed to read assignments with unsent emails")?;

        let mut sent = 0usize;
        for assignment in pending {
            if creation_email_action(&assignment) != CreationEmailAction::Send {
                continue;
            }
            match self.deliver_invitation(&assignment).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    // One broken mailbox must not stall the rest of the sweep.
                    tracing::warn!(
                        "Failed to send invitation for assignment {}: {}",
                        assignment.id.map(|id| id.to_hex()).unwrap_or_default(),
                        e
                    );
                }
            }
        }

        if sent > 0 {
            tracing::info!("Unsent-email sweep delivered {} invitation(s)", sent);
        }
        Ok(sent)
    }

    /// Daily batch: remind every student whose deadline falls within the next
    /// 24 hours and whose assignment is not completed yet. Eligibility is
    /// re-derived per assignment right before sending, the initial query is
    /// only a candidate filter.
    pub async fn send_deadline_reminders(&self, now: DateTime<Utc>) -> Result<ReminderRunSummary> {
        let collection = self.mongo.collection::<Assignment>("assignments");
        let window_end = now + Duration::hours(24);
        let filter = doc! {
            "deadline": {
                "$gte": chrono_to_bson(now),
                "$lt": chrono_to_bson(window_end),
            },
            "status": { "$ne": AssignmentStatus::Completed.as_str() },
        };

        let cursor = collection
            .find(filter)
            .sort(doc! { "deadline": 1 })
            .await
            .context("Failed to query assignments due for reminders")?;
        let candidates: Vec<Assignment> = cursor
            .try_collect()
            .await
            .context("Failed to read assignments due for reminders")?;

        let mut summary = ReminderRunSummary::default();
        for candidate in candidates {
            summary.examined += 1;

            let Some(id) = candidate.id else { continue };
            // A student may have finished between the query and this point.
            let fresh = collection
                .find_one(doc! { "_id": id })
                .await
                .context("Failed to re-read assignment before reminder")?;
            let Some(assignment) = fresh else { continue };
            if !needs_reminder(&assignment, now) {
                continue;
            }

            let title = self.game_title(&assignment).await;
            let remaining =
                (assignment.times_required - assignment.completed_count).max(0);
            let play_link =
                build_play_link(&self.play_base_url, &assignment.link_token, true);

            match self
                .email
                .send_deadline_reminder(
                    &assignment.student_email,
                    &assignment.student_name,
                    &title,
                    assignment.deadline,
                    remaining,
                    &play_link,
                )
                .await
            {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        "Failed to send reminder for assignment {}: {}",
                        id.to_hex(),
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Reminder run: {} examined, {} sent, {} failed",
            summary.examined,
            summary.sent,
            summary.failed
        );
        Ok(summary)
    }

    async fn deliver_invitation(&self, assignment: &Assignment) -> Result<()> {
        let title = self.game_title(assignment).await;
        let play_link = build_play_link(&self.play_base_url, &assignment.link_token, true);

        self.email
            .send_assignment_invitation(
                &assignment.student_email,
                &assignment.student_name,
                &title,
                assignment.deadline,
                &play_link,
            )
            .await?;

        if let Some(id) = assignment.id {
            self.mark_email_sent(id).await;
        }
        Ok(())
    }

    /// Flag flip after a successful send. Conditional on `emailSent: false` so
    /// concurrent senders cannot double-flip; retried because losing the flip
    /// means the sweep re-sends the same invitation later.
    async fn mark_email_sent(&self, assignment_id: ObjectId) {
        let collection = self.mongo.collection::<Assignment>("assignments");
        let result = retry_async_with_config(RetryConfig::aggressive(), || async {
            collection
                .update_one(
                    doc! { "_id": assignment_id, "emailSent": false },
                    doc! { "$set": { "emailSent": true } },
                )
                .await
        })
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Could not mark email sent for assignment {} (duplicate email possible): {}",
                assignment_id.to_hex(),
                e
            );
        }
    }

    async fn game_title(&self, assignment: &Assignment) -> String {
        let games = self.mongo.collection::<GameConfig>("games");
        match games.find_one(doc! { "_id": assignment.game_id }).await {
            Ok(Some(game)) => game.title,
            // Fall back to the denormalized type name rather than dropping the email.
            _ => assignment.game_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(status: AssignmentStatus, deadline: DateTime<Utc>) -> Assignment {
        Assignment {
            id: Some(ObjectId::new()),
            link_token: "aabbccddeeff00112233445566778899".to_string(),
            teacher_id: ObjectId::new(),
            student_email: "student@example.com".to_string(),
            student_name: "Student".to_string(),
            game_id: ObjectId::new(),
            game_type: "verse-scramble".to_string(),
            deadline,
            times_required: 3,
            completed_count: 1,
            status,
            email_sent: false,
            created_at: Utc::now(),
            last_completed_at: None,
        }
    }

    #[test]
    fn creation_action_send_for_fresh_assignment() {
        let a = assignment(AssignmentStatus::Assigned, Utc::now());
        assert_eq!(creation_email_action(&a), CreationEmailAction::Send);
    }

    #[test]
    fn creation_action_skips_when_already_sent() {
        let mut a = assignment(AssignmentStatus::Assigned, Utc::now());
        a.email_sent = true;
        assert_eq!(creation_email_action(&a), CreationEmailAction::AlreadySent);
    }

    #[test]
    fn creation_action_skips_blank_recipient() {
        let mut a = assignment(AssignmentStatus::Assigned, Utc::now());
        a.student_email = "   ".to_string();
        assert_eq!(creation_email_action(&a), CreationEmailAction::NoRecipient);
    }

    #[test]
    fn reminder_covers_deadline_inside_window() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Started, now + Duration::hours(23));
        assert!(needs_reminder(&a, now));
    }

    #[test]
    fn reminder_includes_deadline_exactly_now() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Assigned, now);
        assert!(needs_reminder(&a, now));
    }

    #[test]
    fn reminder_excludes_deadline_beyond_window() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Assigned, now + Duration::hours(25));
        assert!(!needs_reminder(&a, now));
    }

    #[test]
    fn reminder_excludes_window_end_boundary() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Assigned, now + Duration::hours(24));
        assert!(!needs_reminder(&a, now));
    }

    #[test]
    fn reminder_excludes_past_due() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Started, now - Duration::hours(1));
        assert!(!needs_reminder(&a, now));
    }

    #[test]
    fn reminder_excludes_completed() {
        let now = Utc::now();
        let a = assignment(AssignmentStatus::Completed, now + Duration::hours(2));
        assert!(!needs_reminder(&a, now));
    }

    #[test]
    fn play_link_contains_token_and_email_marker() {
        let link = build_play_link(
            "https://verse.example.com/play",
            "aabbccddeeff00112233445566778899",
            true,
        );
        assert!(link.contains("token=aabbccddeeff00112233445566778899"));
        assert!(link.contains("from=email"));
    }

    #[test]
    fn play_link_omits_marker_when_not_from_email() {
        let link = build_play_link(
            "https://verse.example.com/play",
            "aabbccddeeff00112233445566778899",
            false,
        );
        assert!(link.contains("token="));
        assert!(!link.contains("from=email"));
    }

    #[test]
    fn play_link_survives_relative_base() {
        let link = build_play_link("/play", "deadbeef", true);
        assert_eq!(link, "/play?token=deadbeef&from=email");
    }
}
