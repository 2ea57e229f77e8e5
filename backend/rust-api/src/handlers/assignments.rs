use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::{
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::{
        assignment::{
            AssignmentResponse, IssueAssignmentRequest, IssueAssignmentResponse,
            ListAssignmentsQuery,
        },
        attempt::AttemptView,
    },
    services::{
        assignment_service::{AssignmentService, IssueError},
        email_service::EmailService,
        notification_service::{build_play_link, NotificationService},
        AppState,
    },
};

/// POST /api/v1/assignments - Issue an assignment and email the student
pub async fn issue_assignment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<IssueAssignmentRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Validate request
    if let Err(e) = req.validate() {
        return Err((StatusCode::BAD_REQUEST, format!("Validation error: {}", e)));
    }

    tracing::info!("Issuing assignment for student {}", req.student_email);

    let service = AssignmentService::new(state.mongo.clone());

    match service.issue(&claims.sub, &req).await {
        Ok(assignment) => {
            let play_url =
                build_play_link(&state.config.play_base_url, &assignment.link_token, false);

            // Invitation email runs detached so the teacher never waits on SMTP
            if let Some(id) = assignment.id {
                let notification = NotificationService::new(
                    state.mongo.clone(),
                    EmailService::new(state.config.mail.clone()),
                    state.config.play_base_url.clone(),
                );
                tokio::spawn(async move {
                    if let Err(e) = notification.on_assignment_created(id).await {
                        tracing::error!(
                            "Invitation email for assignment {} failed: {}",
                            id.to_hex(),
                            e
                        );
                    }
                });
            }

            Ok((
                StatusCode::CREATED,
                Json(IssueAssignmentResponse {
                    assignment: assignment.into(),
                    play_url,
                }),
            ))
        }
        Err(IssueError::GameNotFound) => {
            Err((StatusCode::NOT_FOUND, "Game not found".to_string()))
        }
        Err(IssueError::NotGameOwner) => Err((
            StatusCode::FORBIDDEN,
            "Game belongs to another teacher".to_string(),
        )),
        Err(IssueError::Storage(e)) => {
            tracing::error!("Failed to issue assignment: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to issue assignment".to_string(),
            ))
        }
    }
}

/// GET /api/v1/assignments - List the teacher's assignments
pub async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Query(query): Query<ListAssignmentsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let service = AssignmentService::new(state.mongo.clone());

    match service.list(&claims.sub, &query).await {
        Ok(assignments) => {
            let rows: Vec<AssignmentResponse> =
                assignments.into_iter().map(Into::into).collect();
            Ok((StatusCode::OK, Json(rows)))
        }
        Err(e) => {
            tracing::error!("Failed to list assignments: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list assignments".to_string(),
            ))
        }
    }
}

/// GET /api/v1/assignments/{id} - One assignment, scoped to the teacher
pub async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(assignment_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let service = AssignmentService::new(state.mongo.clone());

    match service.get(&claims.sub, &assignment_id).await {
        Ok(Some(assignment)) => Ok((
            StatusCode::OK,
            Json(AssignmentResponse::from(assignment)),
        )),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Assignment not found".to_string())),
        Err(e) => {
            tracing::error!("Failed to load assignment {}: {}", assignment_id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load assignment".to_string(),
            ))
        }
    }
}

/// GET /api/v1/assignments/{id}/attempts - Gradebook view for one assignment
pub async fn list_assignment_attempts(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(assignment_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let service = AssignmentService::new(state.mongo.clone());

    match service.list_attempts(&claims.sub, &assignment_id).await {
        Ok(Some(attempts)) => {
            let rows: Vec<AttemptView> = attempts.into_iter().map(Into::into).collect();
            Ok((StatusCode::OK, Json(rows)))
        }
        Ok(None) => Err((StatusCode::NOT_FOUND, "Assignment not found".to_string())),
        Err(e) => {
            tracing::error!(
                "Failed to list attempts for assignment {}: {}",
                assignment_id,
                e
            );
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list attempts".to_string(),
            ))
        }
    }
}
