use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use mongodb::bson::{doc, Bson};
use mongodb::Database;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::metrics::{track_db_operation, PLAY_SESSIONS_ISSUED_TOTAL, SIGNIN_CHALLENGES_TOTAL};
use crate::middlewares::auth::{JwtService, PlaySessionClaims};
use crate::models::assignment::Assignment;
use crate::models::attempt::IdentityProvenance;
use crate::models::signin_token::SignInToken;
use crate::services::email_service::EmailService;
use crate::utils::time::chrono_to_bson;

/// Query-string hints that tell the authenticator how the student arrived.
/// They only pick the authentication path; the access resolver never sees them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessSignals {
    pub direct_access: bool,
    pub from_email: bool,
    /// `mode=signIn` together with a non-empty `oobCode`.
    pub signin_callback: bool,
}

impl AccessSignals {
    pub fn from_query(
        direct_access: Option<&str>,
        from: Option<&str>,
        mode: Option<&str>,
        oob_code: Option<&str>,
    ) -> Self {
        let truthy = |v: Option<&str>| {
            v.map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        Self {
            direct_access: truthy(direct_access),
            from_email: from.map(|s| s.eq_ignore_ascii_case("email")).unwrap_or(false),
            signin_callback: mode.map(|s| s == "signIn").unwrap_or(false)
                && oob_code.map(|s| !s.trim().is_empty()).unwrap_or(false),
        }
    }
}

/// Which authentication path the entry signals select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    /// Link possession is accepted as identity, session minted immediately.
    TrustedLink,
    /// The sign-in email was clicked; the client must exchange the code.
    SignInCallback,
    /// No signal, the student has to pass (or bypass) the email challenge.
    ChallengeRequired,
}

/// Trusted signals win over a pending sign-in callback: the link already
/// grants entry, so an attached code just stays unconsumed.
pub fn classify_entry(signals: &AccessSignals) -> EntryDecision {
    if signals.direct_access || signals.from_email {
        EntryDecision::TrustedLink
    } else if signals.signin_callback {
        EntryDecision::SignInCallback
    } else {
        EntryDecision::ChallengeRequired
    }
}

#[derive(Debug, Error)]
pub enum SignInError {
    #[error("Assignment not found")]
    AssignmentNotFound,
    #[error("This sign-in link is not valid. Please request a new one.")]
    InvalidCode,
    #[error("This sign-in link has expired. Please request a new one.")]
    Expired,
    #[error("This sign-in link was already used. Please open the assignment from the original email.")]
    AlreadyUsed,
    #[error("Failed to send the sign-in email")]
    Mail(#[source] anyhow::Error),
    #[error("Internal error")]
    Storage(#[from] anyhow::Error),
}

/// A minted play session plus the identity baked into it.
#[derive(Debug)]
pub struct SessionGrant {
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub provenance: IdentityProvenance,
    pub email: String,
    pub name: String,
    pub assignment_id: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Sign-in link is on its way to the submitted address.
    Sent { assignment_id: String },
    /// Submitted email differs from the assignment's student; nothing sent.
    /// The caller may resubmit with the acknowledge flag to proceed anyway.
    MismatchWarning { assignment_id: String },
}

/// Lifecycle state of a stored sign-in code. Consumption is checked before
/// expiry so a reused old link gets the "already used" guidance instead of
/// the less helpful "expired" one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInTokenState {
    Valid,
    Expired,
    AlreadyUsed,
}

pub fn classify_signin_token(token: &SignInToken, now: DateTime<Utc>) -> SignInTokenState {
    if token.consumed_at.is_some() {
        SignInTokenState::AlreadyUsed
    } else if token.expires_at <= now {
        SignInTokenState::Expired
    } else {
        SignInTokenState::Valid
    }
}

pub fn email_matches(candidate: &str, expected: &str) -> bool {
    candidate.trim().eq_ignore_ascii_case(expected.trim())
}

/// SHA-256 hex digest of a token. Stored instead of the plaintext so a leaked
/// collection cannot be replayed.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sign-in callback link: the play page URL with the one-time code attached.
pub fn build_signin_link(base_url: &str, link_token: &str, code: &str, email: &str) -> String {
    match Url::parse(base_url) {
        Ok(mut url) => {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("token", link_token);
                pairs.append_pair("mode", "signIn");
                pairs.append_pair("oobCode", code);
                pairs.append_pair("email", email);
            }
            url.to_string()
        }
        Err(_) => format!(
            "{}?token={}&mode=signIn&oobCode={}&email={}",
            base_url, link_token, code, email
        ),
    }
}

/// Turns link possession, emailed one-time codes or an explicit bypass into
/// short-lived play-session JWTs, with the provenance recorded in the claims.
pub struct SessionAuthService {
    mongo: Database,
    email: EmailService,
    session: SessionConfig,
    play_base_url: String,
}

impl SessionAuthService {
    pub fn new(
        mongo: Database,
        email: EmailService,
        session: SessionConfig,
        play_base_url: String,
    ) -> Self {
        Self {
            mongo,
            email,
            session,
            play_base_url,
        }
    }

    /// Trusted-entry path: identity is copied from the assignment itself.
    pub fn trusted_grant(
        &self,
        jwt: &JwtService,
        assignment: &Assignment,
    ) -> Result<SessionGrant, SignInError> {
        self.mint_session(
            jwt,
            assignment,
            &assignment.student_email,
            &assignment.student_name,
            IdentityProvenance::TrustedLink,
        )
    }

    /// Starts the email challenge. A mismatching address only warns unless
    /// the caller explicitly acknowledged the mismatch.
    pub async fn begin_challenge(
        &self,
        link_token: &str,
        entered_email: &str,
        acknowledge_mismatch: bool,
    ) -> Result<ChallengeOutcome, SignInError> {
        let assignment = self.find_by_link_token(link_token).await?;
        let assignment_hex = assignment.id.map(|id| id.to_hex()).unwrap_or_default();
        let entered = entered_email.trim();

        if !email_matches(entered, &assignment.student_email) && !acknowledge_mismatch {
            tracing::info!(
                "Sign-in email mismatch for assignment {}: challenge withheld",
                assignment_hex
            );
            SIGNIN_CHALLENGES_TOTAL
                .with_label_values(&["mismatch_warned"])
                .inc();
            return Ok(ChallengeOutcome::MismatchWarning {
                assignment_id: assignment_hex,
            });
        }

        let code = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = SignInToken {
            id: None,
            token_hash: hash_token(&code),
            email: entered.to_string(),
            assignment_id: assignment.id.context("Assignment missing id")?,
            created_at: now,
            expires_at: now + Duration::minutes(self.session.signin_code_ttl_minutes),
            consumed_at: None,
        };

        let collection = self.mongo.collection::<SignInToken>("signin_tokens");
        track_db_operation("insert_one", "signin_tokens", async {
            collection
                .insert_one(&record)
                .await
                .context("Failed to store sign-in code")?;
            Ok(())
        })
        .await?;

        let signin_link = build_signin_link(&self.play_base_url, link_token, &code, entered);
        self.email
            .send_signin_link(entered, &assignment.student_name, &signin_link)
            .await
            .map_err(SignInError::Mail)?;

        SIGNIN_CHALLENGES_TOTAL.with_label_values(&["sent"]).inc();
        tracing::info!("Sign-in link sent for assignment {}", assignment_hex);
        Ok(ChallengeOutcome::Sent {
            assignment_id: assignment_hex,
        })
    }

    /// Exchanges an emailed one-time code for a `verified` session. The code
    /// is consumed with a conditional update, so two racing exchanges can
    /// never both succeed.
    pub async fn complete_challenge(
        &self,
        jwt: &JwtService,
        link_token: &str,
        code: &str,
    ) -> Result<SessionGrant, SignInError> {
        let assignment = self.find_by_link_token(link_token).await?;
        let assignment_id = assignment.id.context("Assignment missing id")?;

        let collection = self.mongo.collection::<SignInToken>("signin_tokens");
        let hash = hash_token(code.trim());
        let stored = track_db_operation("find_one", "signin_tokens", async {
            collection
                .find_one(doc! { "tokenHash": &hash, "assignmentId": assignment_id })
                .await
                .context("Failed to look up sign-in code")
        })
        .await?;

        let Some(stored) = stored else {
            SIGNIN_CHALLENGES_TOTAL
                .with_label_values(&["invalid_code"])
                .inc();
            return Err(SignInError::InvalidCode);
        };
        let stored_id = stored.id.context("Sign-in code missing id")?;

        let now = Utc::now();
        match classify_signin_token(&stored, now) {
            SignInTokenState::Expired => {
                SIGNIN_CHALLENGES_TOTAL.with_label_values(&["expired"]).inc();
                return Err(SignInError::Expired);
            }
            SignInTokenState::AlreadyUsed => {
                SIGNIN_CHALLENGES_TOTAL
                    .with_label_values(&["already_used"])
                    .inc();
                return Err(SignInError::AlreadyUsed);
            }
            SignInTokenState::Valid => {}
        }

        let consumed = track_db_operation("update_one", "signin_tokens", async {
            collection
                .update_one(
                    doc! { "_id": stored_id, "consumedAt": Bson::Null },
                    doc! { "$set": { "consumedAt": chrono_to_bson(now) } },
                )
                .await
                .context("Failed to consume sign-in code")
        })
        .await?;

        if consumed.modified_count == 0 {
            // Lost the race against a parallel exchange of the same code.
            SIGNIN_CHALLENGES_TOTAL
                .with_label_values(&["already_used"])
                .inc();
            return Err(SignInError::AlreadyUsed);
        }

        SIGNIN_CHALLENGES_TOTAL
            .with_label_values(&["completed"])
            .inc();
        self.mint_session(
            jwt,
            &assignment,
            &stored.email,
            &assignment.student_name,
            IdentityProvenance::Verified,
        )
    }

    /// Degraded-trust path: the client asserts who they are and we record it
    /// as such. Blank fields fall back to the assignment's own student.
    pub async fn bypass(
        &self,
        jwt: &JwtService,
        link_token: &str,
        claimed_email: Option<&str>,
        claimed_name: Option<&str>,
    ) -> Result<SessionGrant, SignInError> {
        let assignment = self.find_by_link_token(link_token).await?;

        let email = claimed_email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or(&assignment.student_email)
            .to_string();
        let name = claimed_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&assignment.student_name)
            .to_string();

        tracing::warn!(
            "Auth bypass used for assignment {} (asserted identity: {})",
            assignment.id.map(|id| id.to_hex()).unwrap_or_default(),
            email
        );

        self.mint_session(jwt, &assignment, &email, &name, IdentityProvenance::Asserted)
    }

    fn mint_session(
        &self,
        jwt: &JwtService,
        assignment: &Assignment,
        email: &str,
        name: &str,
        provenance: IdentityProvenance,
    ) -> Result<SessionGrant, SignInError> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.session.play_token_ttl_seconds);
        let assignment_hex = assignment.id.map(|id| id.to_hex()).unwrap_or_default();

        let claims = PlaySessionClaims {
            sub: email.to_string(),
            name: name.to_string(),
            assignment_id: assignment_hex.clone(),
            provenance: provenance.as_str().to_string(),
            exp: expires_at.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        let session_token = jwt
            .generate_play_token(claims)
            .map_err(|e| SignInError::Storage(anyhow::anyhow!("Failed to mint play session: {}", e)))?;

        PLAY_SESSIONS_ISSUED_TOTAL
            .with_label_values(&[provenance.as_str()])
            .inc();

        Ok(SessionGrant {
            session_token,
            expires_at,
            provenance,
            email: email.to_string(),
            name: name.to_string(),
            assignment_id: assignment_hex,
        })
    }

    async fn find_by_link_token(&self, link_token: &str) -> Result<Assignment, SignInError> {
        let collection = self.mongo.collection::<Assignment>("assignments");
        let assignment = track_db_operation("find_one", "assignments", async {
            collection
                .find_one(doc! { "linkToken": link_token })
                .await
                .context("Failed to load assignment by link token")
        })
        .await?;

        assignment.ok_or(SignInError::AssignmentNotFound)
    }
}
