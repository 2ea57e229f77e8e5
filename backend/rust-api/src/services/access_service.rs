use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::Database;
use thiserror::Error;

use crate::metrics::{track_db_operation, ACCESS_RESOLUTIONS_TOTAL};
use crate::models::assignment::Assignment;
use crate::models::game::GameConfig;

/// Resolution failure, deliberately terse: the display strings are what the
/// player sees, storage details stay inside the Storage variant.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("assignment link not found")]
    NotFound,
    #[error("the assigned game no longer exists")]
    ConfigurationMissing,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Successful resolution: the assignment, its game, and the two notices.
/// Both notices are informational, access is granted either way.
#[derive(Debug)]
pub struct ResolvedAccess {
    pub assignment: Assignment,
    pub game: GameConfig,
    pub past_due: bool,
    pub already_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags {
    pub past_due: bool,
    pub already_completed: bool,
}

/// Pure classification of an assignment at a point in time.
///
/// `past_due` is strict: a deadline of exactly `now` is still on time.
/// `already_completed` compares the counter against the requirement; replay
/// beyond it stays allowed, the flag only drives a notice.
pub fn classify(assignment: &Assignment, now: DateTime<Utc>) -> AccessFlags {
    AccessFlags {
        past_due: assignment.deadline < now,
        already_completed: assignment.completed_count >= assignment.times_required,
    }
}

pub fn outcome_label(flags: &AccessFlags) -> &'static str {
    match (flags.past_due, flags.already_completed) {
        (false, false) => "granted",
        (true, false) => "past_due",
        (false, true) => "already_completed",
        (true, true) => "past_due_already_completed",
    }
}

pub struct AccessService {
    mongo: Database,
}

impl AccessService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    /// Resolve a link token. Pure read: nothing is mutated here, whatever
    /// state the assignment is in.
    pub async fn resolve(&self, token: &str) -> Result<ResolvedAccess, ResolveError> {
        let assignments = self.mongo.collection::<Assignment>("assignments");
        let token = token.trim();

        let assignment = track_db_operation("find_one", "assignments", async {
            assignments
                .find_one(doc! { "linkToken": token })
                .await
                .context("Failed to query assignment by link token")
        })
        .await?;

        let assignment = match assignment {
            Some(a) => a,
            None => {
                tracing::debug!("Link token did not resolve");
                ACCESS_RESOLUTIONS_TOTAL
                    .with_label_values(&["not_found"])
                    .inc();
                return Err(ResolveError::NotFound);
            }
        };

        let games = self.mongo.collection::<GameConfig>("games");
        let game = track_db_operation("find_one", "games", async {
            games
                .find_one(doc! { "_id": assignment.game_id })
                .await
                .context("Failed to query game for assignment")
        })
        .await?;

        let game = match game {
            Some(g) => g,
            None => {
                tracing::warn!(
                    "Assignment {} references missing game {}",
                    assignment.id.map(|id| id.to_hex()).unwrap_or_default(),
                    assignment.game_id.to_hex()
                );
                ACCESS_RESOLUTIONS_TOTAL
                    .with_label_values(&["configuration_missing"])
                    .inc();
                return Err(ResolveError::ConfigurationMissing);
            }
        };

        let flags = classify(&assignment, Utc::now());
        ACCESS_RESOLUTIONS_TOTAL
            .with_label_values(&[outcome_label(&flags)])
            .inc();

        Ok(ResolvedAccess {
            assignment,
            game,
            past_due: flags.past_due,
            already_completed: flags.already_completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::assignment::AssignmentStatus;
    use chrono::Duration;
    use mongodb::bson::oid::ObjectId;

    fn assignment(deadline: DateTime<Utc>, completed: i32, required: i32) -> Assignment {
        Assignment {
            id: Some(ObjectId::new()),
            link_token: "a".repeat(32),
            teacher_id: ObjectId::new(),
            student_email: "student@example.com".to_string(),
            student_name: "Student".to_string(),
            game_id: ObjectId::new(),
            game_type: "verse".to_string(),
            deadline,
            times_required: required,
            completed_count: completed,
            status: AssignmentStatus::Assigned,
            email_sent: true,
            created_at: Utc::now(),
            last_completed_at: None,
        }
    }

    #[test]
    fn deadline_exactly_now_is_not_past_due() {
        let now = Utc::now();
        let flags = classify(&assignment(now, 0, 1), now);
        assert!(!flags.past_due);
    }

    #[test]
    fn deadline_one_second_ago_is_past_due() {
        let now = Utc::now();
        let flags = classify(&assignment(now - Duration::seconds(1), 0, 1), now);
        assert!(flags.past_due);
    }

    #[test]
    fn future_deadline_is_on_time() {
        let now = Utc::now();
        let flags = classify(&assignment(now + Duration::days(3), 0, 1), now);
        assert!(!flags.past_due);
        assert!(!flags.already_completed);
    }

    #[test]
    fn counter_at_requirement_marks_already_completed() {
        let now = Utc::now();
        let flags = classify(&assignment(now + Duration::days(1), 1, 1), now);
        assert!(flags.already_completed);
    }

    #[test]
    fn counter_beyond_requirement_stays_already_completed() {
        let now = Utc::now();
        let flags = classify(&assignment(now + Duration::days(1), 5, 2), now);
        assert!(flags.already_completed);
    }

    #[test]
    fn both_notices_can_be_set_at_once() {
        let now = Utc::now();
        let flags = classify(&assignment(now - Duration::days(1), 2, 2), now);
        assert!(flags.past_due);
        assert!(flags.already_completed);
        assert_eq!(outcome_label(&flags), "past_due_already_completed");
    }

    #[test]
    fn outcome_labels_cover_clean_grant() {
        let flags = AccessFlags {
            past_due: false,
            already_completed: false,
        };
        assert_eq!(outcome_label(&flags), "granted");
    }
}
