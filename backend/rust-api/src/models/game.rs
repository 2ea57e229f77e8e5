use chrono::{DateTime, Utc};
use mongodb::bson::{oid::ObjectId, Document};
use serde::{Deserialize, Serialize};

use super::assignment::bson_datetime_as_chrono;

/// Game definition stored in MongoDB "games" collection.
///
/// Owned by the teacher-facing game builder; this service only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(rename = "teacherId")]
    pub teacher_id: ObjectId,

    #[serde(rename = "gameType")]
    pub game_type: String,

    pub title: String,

    /// Opaque game payload (verses, word lists, puzzle setup) consumed by
    /// the player client as-is.
    #[serde(default)]
    pub config: Document,

    #[serde(rename = "createdAt", with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
}

/// Game fields exposed to the player client on resolve.
#[derive(Debug, Serialize)]
pub struct GameView {
    pub id: String,
    #[serde(rename = "gameType")]
    pub game_type: String,
    pub title: String,
    pub config: Document,
}

impl From<GameConfig> for GameView {
    fn from(game: GameConfig) -> Self {
        GameView {
            id: game.id.map(|id| id.to_hex()).unwrap_or_default(),
            game_type: game.game_type,
            title: game.title,
            config: game.config,
        }
    }
}
