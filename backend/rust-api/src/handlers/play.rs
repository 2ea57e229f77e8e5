use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::{
    extractors::AppJson,
    middlewares::auth::{JwtService, PlaySessionClaims},
    models::{
        game::GameView,
        play::{
            BypassRequest, ChallengeKind, CompleteSignInRequest, PlayAssignmentView,
            PlayResolveQuery, ResolvePlayResponse, SessionView, SignInChallengeResponse,
            SignInRequest,
        },
    },
    services::{
        access_service::{outcome_label, AccessFlags, AccessService, ResolveError},
        attempt_service::{AttemptService, RecordError},
        audit_service::AuditService,
        email_service::EmailService,
        session_auth_service::{
            classify_entry, AccessSignals, ChallengeOutcome, EntryDecision, SessionAuthService,
            SessionGrant, SignInError,
        },
        AppState,
    },
};

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
}

fn session_auth(state: &AppState) -> SessionAuthService {
    SessionAuthService::new(
        state.mongo.clone(),
        EmailService::new(state.config.mail.clone()),
        state.config.session.clone(),
        state.config.play_base_url.clone(),
    )
}

fn session_view(grant: SessionGrant) -> SessionView {
    SessionView {
        session_token: grant.session_token,
        expires_at: grant.expires_at,
        provenance: grant.provenance,
        email: grant.email,
        name: grant.name,
    }
}

fn signin_error_response(e: SignInError) -> (StatusCode, String) {
    let message = e.to_string();
    match e {
        SignInError::AssignmentNotFound => (StatusCode::NOT_FOUND, message),
        SignInError::InvalidCode => (StatusCode::BAD_REQUEST, message),
        SignInError::Expired => (StatusCode::GONE, message),
        SignInError::AlreadyUsed => (StatusCode::CONFLICT, message),
        SignInError::Mail(err) => {
            tracing::error!("Sign-in email failed: {}", err);
            (StatusCode::BAD_GATEWAY, message)
        }
        SignInError::Storage(err) => {
            tracing::error!("Sign-in storage error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

/// GET /api/v1/play/resolve - Resolve a link token into the playable
/// assignment. Entry signals pick the authentication path but never change
/// the resolution outcome.
pub async fn resolve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PlayResolveQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ip = client_ip(&headers);
    let audit = AuditService::new(state.mongo.clone());
    let access = AccessService::new(state.mongo.clone());

    let resolved = match access.resolve(&query.token).await {
        Ok(resolved) => resolved,
        Err(ResolveError::NotFound) => {
            let _ = audit
                .log_link_rejected(&query.token, "not_found", ip)
                .await;
            return Err((
                StatusCode::NOT_FOUND,
                "This assignment link is not valid".to_string(),
            ));
        }
        Err(ResolveError::ConfigurationMissing) => {
            let _ = audit
                .log_link_rejected(&query.token, "configuration_missing", ip)
                .await;
            return Err((
                StatusCode::NOT_FOUND,
                "This assignment's game is no longer available".to_string(),
            ));
        }
        Err(ResolveError::Storage(e)) => {
            tracing::error!("Failed to resolve link token: {}", e);
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to resolve assignment link".to_string(),
            ));
        }
    };

    let flags = AccessFlags {
        past_due: resolved.past_due,
        already_completed: resolved.already_completed,
    };
    let assignment_id = resolved
        .assignment
        .id
        .map(|id| id.to_hex())
        .unwrap_or_default();
    let _ = audit
        .log_link_resolved(
            &assignment_id,
            &resolved.assignment.student_email,
            outcome_label(&flags),
            query.email.as_deref(),
            ip,
        )
        .await;

    let signals = AccessSignals::from_query(
        query.direct_access.as_deref(),
        query.from.as_deref(),
        query.mode.as_deref(),
        query.oob_code.as_deref(),
    );

    let (challenge, session) = match classify_entry(&signals) {
        EntryDecision::TrustedLink => {
            let jwt_service = JwtService::new(&state.config.jwt_secret);
            let grant = session_auth(&state)
                .trusted_grant(&jwt_service, &resolved.assignment)
                .map_err(signin_error_response)?;
            (ChallengeKind::None, Some(session_view(grant)))
        }
        EntryDecision::SignInCallback => (ChallengeKind::SigninCallback, None),
        EntryDecision::ChallengeRequired => (ChallengeKind::EmailSignin, None),
    };

    Ok((
        StatusCode::OK,
        Json(ResolvePlayResponse {
            assignment: PlayAssignmentView::from(&resolved.assignment),
            game: GameView::from(resolved.game),
            past_due: resolved.past_due,
            already_completed: resolved.already_completed,
            challenge,
            session,
        }),
    ))
}

/// POST /api/v1/play/signin - Email a one-time sign-in link
pub async fn signin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(req): AppJson<SignInRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Validate request
    if let Err(e) = req.validate() {
        return Err((StatusCode::BAD_REQUEST, format!("Validation error: {}", e)));
    }

    let ip = client_ip(&headers);
    let audit = AuditService::new(state.mongo.clone());
    let auth = session_auth(&state);

    match auth
        .begin_challenge(&req.token, &req.email, req.acknowledge_mismatch)
        .await
    {
        Ok(ChallengeOutcome::Sent { assignment_id }) => {
            let _ = audit
                .log_signin_challenge_sent(&assignment_id, &req.email, ip)
                .await;
            Ok((
                StatusCode::OK,
                Json(SignInChallengeResponse {
                    status: "sent".to_string(),
                    message: None,
                }),
            ))
        }
        Ok(ChallengeOutcome::MismatchWarning { assignment_id }) => {
            let _ = audit
                .log_signin_mismatch_warned(&assignment_id, &req.email, ip)
                .await;
            Ok((
                StatusCode::OK,
                Json(SignInChallengeResponse {
                    status: "mismatch".to_string(),
                    message: Some(
                        "This email does not match the assignment. Resend with \
                         acknowledgeMismatch to sign in with it anyway."
                            .to_string(),
                    ),
                }),
            ))
        }
        Err(e) => {
            let _ = audit
                .log_signin_failed(None, Some(&req.email), ip, &e.to_string())
                .await;
            Err(signin_error_response(e))
        }
    }
}

/// POST /api/v1/play/signin/complete - Exchange the emailed code for a session
pub async fn complete_signin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(req): AppJson<CompleteSignInRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ip = client_ip(&headers);
    let audit = AuditService::new(state.mongo.clone());
    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let auth = session_auth(&state);

    match auth
        .complete_challenge(&jwt_service, &req.token, &req.code)
        .await
    {
        Ok(grant) => {
            let _ = audit
                .log_signin_completed(&grant.assignment_id, &grant.email, ip)
                .await;
            Ok((StatusCode::OK, Json(session_view(grant))))
        }
        Err(e) => {
            let _ = audit
                .log_signin_failed(None, None, ip, &e.to_string())
                .await;
            Err(signin_error_response(e))
        }
    }
}

/// POST /api/v1/play/bypass - Mint a degraded-trust session from
/// client-asserted identity
pub async fn bypass(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(req): AppJson<BypassRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ip = client_ip(&headers);
    let audit = AuditService::new(state.mongo.clone());
    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let auth = session_auth(&state);

    match auth
        .bypass(
            &jwt_service,
            &req.token,
            req.email.as_deref(),
            req.name.as_deref(),
        )
        .await
    {
        Ok(grant) => {
            let _ = audit
                .log_bypass_used(&grant.assignment_id, &grant.email, ip)
                .await;
            Ok((StatusCode::OK, Json(session_view(grant))))
        }
        Err(e) => Err(signin_error_response(e)),
    }
}

/// POST /api/v1/play/attempts - Record one attempt under the play session
pub async fn record_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<PlaySessionClaims>,
    headers: HeaderMap,
    AppJson(req): AppJson<crate::models::attempt::RecordAttemptRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ip = client_ip(&headers);
    let audit = AuditService::new(state.mongo.clone());
    let service = AttemptService::new(state.mongo.clone(), state.redis.clone());

    match service.record(&claims, &req).await {
        Ok(response) => {
            let _ = audit
                .log_attempt_recorded(
                    &claims.assignment_id,
                    &claims.sub,
                    &response.attempt_id,
                    claims.provenance().as_str(),
                    ip,
                )
                .await;
            Ok((StatusCode::OK, Json(response)))
        }
        Err(RecordError::RateLimited) => {
            let _ = audit
                .log_attempt_rate_limited(&claims.assignment_id, &claims.sub, ip)
                .await;
            Err((
                StatusCode::TOO_MANY_REQUESTS,
                "Too many attempts recorded, please slow down".to_string(),
            ))
        }
        Err(RecordError::AssignmentNotFound) => {
            Err((StatusCode::NOT_FOUND, "Assignment not found".to_string()))
        }
        Err(RecordError::Forbidden) => Err((
            StatusCode::FORBIDDEN,
            "This session does not match the assignment".to_string(),
        )),
        Err(RecordError::Storage(e)) => {
            tracing::error!("Failed to record attempt: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to record attempt".to_string(),
            ))
        }
    }
}
