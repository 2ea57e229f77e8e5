use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::assignment::{Assignment, AssignmentStatus};
use super::attempt::IdentityProvenance;
use super::game::GameView;

/// Query parameters of GET /api/v1/play/resolve. Everything except `token`
/// is optional: the entry signals plus the sign-in callback's mailed address.
#[derive(Debug, Deserialize)]
pub struct PlayResolveQuery {
    pub token: String,
    #[serde(rename = "directAccess")]
    pub direct_access: Option<String>,
    pub from: Option<String>,
    pub mode: Option<String>,
    #[serde(rename = "oobCode")]
    pub oob_code: Option<String>,
    /// Address the sign-in code was mailed to; recorded in the audit trail.
    pub email: Option<String>,
}

/// Assignment as shown on the play page. No link token (the page already
/// holds it) and no teacher id.
#[derive(Debug, Serialize)]
pub struct PlayAssignmentView {
    pub id: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    #[serde(rename = "studentEmail")]
    pub student_email: String,
    pub deadline: DateTime<Utc>,
    #[serde(rename = "timesRequired")]
    pub times_required: i32,
    #[serde(rename = "completedCount")]
    pub completed_count: i32,
    pub status: AssignmentStatus,
}

impl From<&Assignment> for PlayAssignmentView {
    fn from(a: &Assignment) -> Self {
        PlayAssignmentView {
            id: a.id.map(|id| id.to_hex()).unwrap_or_default(),
            student_name: a.student_name.clone(),
            student_email: a.student_email.clone(),
            deadline: a.deadline,
            times_required: a.times_required,
            completed_count: a.completed_count,
            status: a.status,
        }
    }
}

/// Play-session token block returned whenever a session is minted.
#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(rename = "sessionToken")]
    pub session_token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub provenance: IdentityProvenance,
    pub email: String,
    pub name: String,
}

/// Next step the play page has to take before attempts can be recorded.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Session attached, start playing.
    None,
    /// Ask the student for their email and POST /play/signin.
    EmailSignin,
    /// A sign-in link was clicked; POST the code to /play/signin/complete.
    SigninCallback,
}

/// Response of GET /api/v1/play/resolve.
#[derive(Debug, Serialize)]
pub struct ResolvePlayResponse {
    pub assignment: PlayAssignmentView,
    pub game: GameView,
    #[serde(rename = "pastDue")]
    pub past_due: bool,
    #[serde(rename = "alreadyCompleted")]
    pub already_completed: bool,
    pub challenge: ChallengeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
}

/// Body of POST /api/v1/play/signin.
#[derive(Debug, Deserialize, Validate)]
pub struct SignInRequest {
    pub token: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[serde(rename = "acknowledgeMismatch", default)]
    pub acknowledge_mismatch: bool,
}

/// Response of POST /api/v1/play/signin.
#[derive(Debug, Serialize)]
pub struct SignInChallengeResponse {
    /// "sent" or "mismatch"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of POST /api/v1/play/signin/complete.
#[derive(Debug, Deserialize)]
pub struct CompleteSignInRequest {
    pub token: String,
    #[serde(rename = "oobCode")]
    pub code: String,
}

/// Body of POST /api/v1/play/bypass.
#[derive(Debug, Deserialize)]
pub struct BypassRequest {
    pub token: String,
    pub email: Option<String>,
    pub name: Option<String>,
}
