use anyhow::{Context, Result};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::Database;
use rand::RngCore;
use thiserror::Error;

use crate::metrics::ASSIGNMENTS_ISSUED_TOTAL;
use crate::models::assignment::{
    Assignment, AssignmentStatus, IssueAssignmentRequest, ListAssignmentsQuery,
};
use crate::models::attempt::Attempt;
use crate::models::game::GameConfig;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("game not found")]
    GameNotFound,
    #[error("game belongs to another teacher")]
    NotGameOwner,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Generate a new link token: 16 cryptographically random bytes, hex-encoded.
///
/// 128 bits of entropy is the whole uniqueness story; there is no
/// duplicate-check query against the collection.
pub fn generate_link_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct AssignmentService {
    mongo: Database,
}

impl AssignmentService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    /// Issue a new assignment for a student. Verifies the referenced game
    /// exists and belongs to the issuing teacher before writing anything.
    pub async fn issue(
        &self,
        teacher_id: &str,
        req: &IssueAssignmentRequest,
    ) -> Result<Assignment, IssueError> {
        let teacher_oid = ObjectId::parse_str(teacher_id)
            .context("Invalid teacher id in authenticated claims")?;
        let game_oid = match ObjectId::parse_str(&req.game_id) {
            Ok(oid) => oid,
            Err(_) => return Err(IssueError::GameNotFound),
        };

        let games = self.mongo.collection::<GameConfig>("games");
        let game = games
            .find_one(doc! { "_id": game_oid })
            .await
            .context("Failed to query game")?
            .ok_or(IssueError::GameNotFound)?;

        if game.teacher_id != teacher_oid {
            tracing::warn!(
                "Teacher {} tried to assign game {} owned by {}",
                teacher_id,
                req.game_id,
                game.teacher_id.to_hex()
            );
            return Err(IssueError::NotGameOwner);
        }

        let mut assignment = Assignment {
            id: None,
            link_token: generate_link_token(),
            teacher_id: teacher_oid,
            student_email: req.student_email.trim().to_string(),
            student_name: req.student_name.trim().to_string(),
            game_id: game_oid,
            game_type: game.game_type.clone(),
            deadline: req.deadline,
            times_required: req.times_required.unwrap_or(1),
            completed_count: 0,
            status: AssignmentStatus::Assigned,
            email_sent: false,
            created_at: Utc::now(),
            last_completed_at: None,
        };

        let collection = self.mongo.collection::<Assignment>("assignments");
        let insert = collection
            .insert_one(&assignment)
            .await
            .context("Failed to insert assignment")?;
        assignment.id = insert.inserted_id.as_object_id();

        ASSIGNMENTS_ISSUED_TOTAL
            .with_label_values(&[&game.game_type])
            .inc();

        tracing::info!(
            "Issued assignment {} for {} (game {}, due {})",
            assignment
                .id
                .map(|id| id.to_hex())
                .unwrap_or_default(),
            assignment.student_email,
            game.title,
            assignment.deadline
        );

        Ok(assignment)
    }

    /// List a teacher's assignments, newest first.
    pub async fn list(
        &self,
        teacher_id: &str,
        query: &ListAssignmentsQuery,
    ) -> Result<Vec<Assignment>> {
        let teacher_oid = ObjectId::parse_str(teacher_id)
            .context("Invalid teacher id in authenticated claims")?;

        let mut filter = doc! { "teacherId": teacher_oid };
        if let Some(game_id) = &query.game_id {
            if let Ok(game_oid) = ObjectId::parse_str(game_id) {
                filter.insert("gameId", game_oid);
            }
        }
        if let Some(email) = &query.student_email {
            filter.insert("studentEmail", email);
        }
        if let Some(status) = &query.status {
            filter.insert("status", status);
        }

        let limit = query.limit.unwrap_or(50).min(200) as i64;
        let skip = query.offset.unwrap_or(0) as u64;

        let collection = self.mongo.collection::<Assignment>("assignments");
        let cursor = collection
            .find(filter)
            .sort(doc! { "createdAt": -1 })
            .skip(skip)
            .limit(limit)
            .await
            .context("Failed to query assignments")?;

        cursor
            .try_collect()
            .await
            .context("Failed to read assignments cursor")
    }

    /// Load one assignment, scoped to its owner.
    pub async fn get(&self, teacher_id: &str, assignment_id: &str) -> Result<Option<Assignment>> {
        let teacher_oid = ObjectId::parse_str(teacher_id)
            .context("Invalid teacher id in authenticated claims")?;
        let assignment_oid = match ObjectId::parse_str(assignment_id) {
            Ok(oid) => oid,
            Err(_) => return Ok(None),
        };

        let collection = self.mongo.collection::<Assignment>("assignments");
        collection
            .find_one(doc! { "_id": assignment_oid, "teacherId": teacher_oid })
            .await
            .context("Failed to query assignment")
    }

    /// Gradebook view: all attempts recorded against one of the teacher's
    /// assignments, newest first. Returns None when the assignment does not
    /// exist or belongs to someone else.
    pub async fn list_attempts(
        &self,
        teacher_id: &str,
        assignment_id: &str,
    ) -> Result<Option<Vec<Attempt>>> {
        let assignment = match self.get(teacher_id, assignment_id).await? {
            Some(a) => a,
            None => return Ok(None),
        };

        let assignment_oid = match assignment.id {
            Some(oid) => oid,
            None => return Ok(Some(Vec::new())),
        };

        let collection = self.mongo.collection::<Attempt>("attempts");
        let cursor = collection
            .find(doc! { "assignmentId": assignment_oid })
            .sort(doc! { "timestamp": -1 })
            .await
            .context("Failed to query attempts")?;

        let attempts = cursor
            .try_collect()
            .await
            .context("Failed to read attempts cursor")?;
        Ok(Some(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn link_tokens_are_32_lowercase_hex_chars() {
        let token = generate_link_token();
        assert_eq!(token.len(), 32);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn link_tokens_do_not_repeat_across_a_large_sample() {
        let mut seen = HashSet::new();
        for _ in 0..512 {
            assert!(seen.insert(generate_link_token()), "duplicate token");
        }
    }
}
