use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::models::*;
use crate::{access, assignment, certificate, progress, quiz};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub secret: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // access window + checkpoints
        .route("/api/enrollments/:id/start", post(ensure_started))
        .route("/api/enrollments/:id/access", get(access_status))
        .route(
            "/api/enrollments/:id/checkpoint",
            put(save_checkpoint).get(get_checkpoint),
        )
        // content completion
        .route("/api/contents/:content_id/complete", post(complete_content))
        // quiz attempts
        .route("/api/quizzes/:quiz_id/attempts", post(start_attempt))
        .route("/api/quizzes/:quiz_id/attempts/finalize", post(finalize_attempt))
        // assignment review workflow
        .route("/api/contents/:content_id/submissions", post(submit_assignment))
        .route("/api/submissions/:id/claim", post(claim_review))
        .route("/api/submissions/:id/review", post(review_assignment))
        // aggregates
        .route("/api/progress", get(get_progress))
        .route("/api/certificates", get(get_or_issue_certificate))
        .with_state(state)
}

async fn ensure_started(
    State(state): State<AppState>,
    Path(enrollment_id): Path<Uuid>,
) -> Result<Json<Enrollment>> {
    Ok(Json(access::ensure_started(&state.db, enrollment_id).await?))
}

async fn access_status(
    State(state): State<AppState>,
    Path(enrollment_id): Path<Uuid>,
) -> Result<Json<AccessStatus>> {
    Ok(Json(access::access_status(&state.db, enrollment_id).await?))
}

async fn save_checkpoint(
    State(state): State<AppState>,
    Path(enrollment_id): Path<Uuid>,
    Json(req): Json<CheckpointReq>,
) -> Result<Json<serde_json::Value>> {
    access::save_checkpoint(&state.db, enrollment_id, &req).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_checkpoint(
    State(state): State<AppState>,
    Path(enrollment_id): Path<Uuid>,
) -> Result<Json<Option<Checkpoint>>> {
    Ok(Json(access::get_checkpoint(&state.db, enrollment_id).await?))
}

async fn complete_content(
    State(state): State<AppState>,
    Path(content_id): Path<Uuid>,
    Json(req): Json<LearnerReq>,
) -> Result<Json<serde_json::Value>> {
    let certificate_issued =
        progress::mark_content_complete(&state.db, req.learner_id, content_id).await?;
    Ok(Json(json!({ "ok": true, "certificate_issued": certificate_issued })))
}

async fn start_attempt(
    State(state): State<AppState>,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<LearnerReq>,
) -> Result<Json<StartAttemptResp>> {
    Ok(Json(
        quiz::start(&state.db, &state.secret, quiz_id, req.learner_id).await?,
    ))
}

async fn finalize_attempt(
    State(state): State<AppState>,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<FinalizeAttemptReq>,
) -> Result<Json<FinalizeAttemptResp>> {
    Ok(Json(
        quiz::finalize(&state.db, &state.secret, quiz_id, req).await?,
    ))
}

async fn submit_assignment(
    State(state): State<AppState>,
    Path(content_id): Path<Uuid>,
    Json(req): Json<SubmitAssignmentReq>,
) -> Result<Json<SubmitAssignmentResp>> {
    Ok(Json(assignment::submit(&state.db, content_id, &req).await?))
}

async fn claim_review(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
    Json(req): Json<ClaimReviewReq>,
) -> Result<Json<AssignmentSubmission>> {
    Ok(Json(
        assignment::claim(&state.db, submission_id, req.reviewer_id).await?,
    ))
}

async fn review_assignment(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
    Json(req): Json<ReviewReq>,
) -> Result<Json<AssignmentSubmission>> {
    Ok(Json(assignment::review(&state.db, submission_id, &req).await?))
}

async fn get_progress(
    State(state): State<AppState>,
    Query(q): Query<ProgressQuery>,
) -> Result<Json<ProgressSummary>> {
    Ok(Json(
        progress::compute(&state.db, q.course_id, q.learner_id).await?,
    ))
}

async fn get_or_issue_certificate(
    State(state): State<AppState>,
    Query(q): Query<ProgressQuery>,
) -> Result<Json<Certificate>> {
    Ok(Json(
        certificate::get_or_issue(&state.db, q.learner_id, q.course_id).await?,
    ))
}
