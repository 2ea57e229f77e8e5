use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use super::assignment::{bson_datetime_as_chrono, bson_datetime_as_chrono_option};

/// One-time sign-in code stored in MongoDB "signin_tokens" collection.
///
/// Only the SHA-256 hash of the emailed code is stored; the plaintext code
/// exists solely inside the sign-in link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInToken {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(rename = "tokenHash")]
    pub token_hash: String,

    /// Email the code was sent to; becomes the verified session identity.
    pub email: String,

    #[serde(rename = "assignmentId")]
    pub assignment_id: ObjectId,

    #[serde(rename = "createdAt", with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "expiresAt", with = "bson_datetime_as_chrono")]
    pub expires_at: DateTime<Utc>,

    /// Set exactly once when the code is exchanged for a session.
    #[serde(
        rename = "consumedAt",
        default,
        skip_serializing_if = "Option::is_none",
        with = "bson_datetime_as_chrono_option"
    )]
    pub consumed_at: Option<DateTime<Utc>>,
}
