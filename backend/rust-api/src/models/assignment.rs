use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Assignment model stored in MongoDB "assignments" collection.
///
/// The `link_token` doubles as the bearer credential for the whole play flow:
/// whoever holds the link can resolve the assignment and start playing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    /// 128-bit random token, hex-encoded (32 chars). Unique by entropy,
    /// not re-checked by query.
    #[serde(rename = "linkToken")]
    pub link_token: String,

    #[serde(rename = "teacherId")]
    pub teacher_id: ObjectId,

    #[serde(rename = "studentEmail")]
    pub student_email: String,

    #[serde(rename = "studentName")]
    pub student_name: String,

    #[serde(rename = "gameId")]
    pub game_id: ObjectId,

    /// Denormalized from the game at issue time (listing + metrics label).
    #[serde(rename = "gameType")]
    pub game_type: String,

    #[serde(with = "bson_datetime_as_chrono")]
    pub deadline: DateTime<Utc>,

    #[serde(rename = "timesRequired")]
    pub times_required: i32,

    #[serde(rename = "completedCount")]
    pub completed_count: i32,

    pub status: AssignmentStatus,

    /// Flipped false→true at most once by a conditional update.
    #[serde(rename = "emailSent", default)]
    pub email_sent: bool,

    #[serde(rename = "createdAt", with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,

    #[serde(
        rename = "lastCompletedAt",
        default,
        skip_serializing_if = "Option::is_none",
        with = "bson_datetime_as_chrono_option"
    )]
    pub last_completed_at: Option<DateTime<Utc>>,
}

// Serde converters for chrono::DateTime <-> mongodb::bson::DateTime
pub(super) mod bson_datetime_as_chrono {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bson_dt = bson::DateTime::from_millis(date.timestamp_millis());
        bson_dt.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bson_dt = bson::DateTime::deserialize(deserializer)?;
        Ok(DateTime::from_timestamp_millis(bson_dt.timestamp_millis()).unwrap())
    }
}

pub(super) mod bson_datetime_as_chrono_option {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let bson_dt = bson::DateTime::from_millis(d.timestamp_millis());
                serializer.serialize_some(&bson_dt)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt_bson_dt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt_bson_dt
            .map(|bson_dt| DateTime::from_timestamp_millis(bson_dt.timestamp_millis()).unwrap()))
    }
}

/// Forward-only lifecycle: assigned → started → completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    #[default]
    Assigned,
    Started,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Started => "started",
            AssignmentStatus::Completed => "completed",
        }
    }
}

/// Request to issue a new assignment (teacher-facing).
#[derive(Debug, Deserialize, Validate)]
pub struct IssueAssignmentRequest {
    #[serde(rename = "studentEmail")]
    #[validate(email(message = "Invalid student email"))]
    pub student_email: String,

    #[serde(rename = "studentName")]
    #[validate(length(
        min = 1,
        max = 100,
        message = "Student name must be between 1 and 100 characters"
    ))]
    pub student_name: String,

    #[serde(rename = "gameId")]
    pub game_id: String,

    pub deadline: DateTime<Utc>,

    /// How many recorded attempts complete the assignment (defaults to 1).
    #[serde(rename = "timesRequired")]
    #[validate(range(min = 1, max = 1000, message = "timesRequired must be at least 1"))]
    pub times_required: Option<i32>,
}

/// Assignment row returned to the teacher dashboard.
#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub id: String,
    #[serde(rename = "linkToken")]
    pub link_token: String,
    #[serde(rename = "studentEmail")]
    pub student_email: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    #[serde(rename = "gameId")]
    pub game_id: String,
    #[serde(rename = "gameType")]
    pub game_type: String,
    pub deadline: DateTime<Utc>,
    #[serde(rename = "timesRequired")]
    pub times_required: i32,
    #[serde(rename = "completedCount")]
    pub completed_count: i32,
    pub status: AssignmentStatus,
    #[serde(rename = "emailSent")]
    pub email_sent: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastCompletedAt")]
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl From<Assignment> for AssignmentResponse {
    fn from(a: Assignment) -> Self {
        AssignmentResponse {
            id: a.id.map(|id| id.to_hex()).unwrap_or_default(),
            link_token: a.link_token,
            student_email: a.student_email,
            student_name: a.student_name,
            game_id: a.game_id.to_hex(),
            game_type: a.game_type,
            deadline: a.deadline,
            times_required: a.times_required,
            completed_count: a.completed_count,
            status: a.status,
            email_sent: a.email_sent,
            last_completed_at: a.last_completed_at,
            created_at: a.created_at,
        }
    }
}

/// Response for a freshly issued assignment: the row plus the shareable link.
#[derive(Debug, Serialize)]
pub struct IssueAssignmentResponse {
    #[serde(flatten)]
    pub assignment: AssignmentResponse,
    #[serde(rename = "playUrl")]
    pub play_url: String,
}

/// Query params for listing a teacher's assignments.
#[derive(Debug, Deserialize)]
pub struct ListAssignmentsQuery {
    #[serde(rename = "gameId")]
    pub game_id: Option<String>,
    #[serde(rename = "studentEmail")]
    pub student_email: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
