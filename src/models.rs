use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- closed status sets, mirrored as Postgres enum types in migrations ---

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "enrollment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Expired,
    Cancelled,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "content_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    Pdf,
    Link,
    Assignment,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "checkpoint_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Content,
    Quiz,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "attempt_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Passed,
    Failed,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "submission_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "submission_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    File,
    Url,
    Text,
}

// --- catalog read models (authored by the course-management app) ---

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    /// 0 means unlimited access.
    pub duration_hours: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Content {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub kind: ContentKind,
    pub passing_score: Option<i32>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub time_limit_minutes: i32,
    pub passing_score: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub prompt: String,
    pub multi: bool,
    pub position: i32,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct QuestionOption {
    pub id: Uuid,
    pub question_id: Uuid,
    pub label: String,
    pub is_correct: bool,
}

// --- engine state rows ---

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub course_id: Uuid,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub learning_started_at: Option<DateTime<Utc>>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoint_kind: Option<CheckpointKind>,
    pub checkpoint_item_id: Option<Uuid>,
    pub checkpoint_updated_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub learner_id: Uuid,
    pub attempt_session: i32,
    pub score: i32,
    pub status: AttemptStatus,
    pub time_taken_seconds: i32,
    pub late: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AssignmentSubmission {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub content_id: Uuid,
    pub submission_type: SubmissionType,
    pub payload: String,
    pub status: SubmissionStatus,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub reviewed_by: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Certificate {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub course_id: Uuid,
    pub enrollment_id: Uuid,
    pub certificate_number: String,
    pub issued_at: DateTime<Utc>,
}

// --- request / response shapes ---

#[derive(Serialize, Debug, Clone)]
pub struct AccessStatus {
    /// None when the course has no time limit.
    pub remaining_seconds: Option<i64>,
    pub unlimited: bool,
    pub expired: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointReq {
    pub kind: CheckpointKind,
    pub item_id: Uuid,
}

#[derive(Serialize, Debug, Clone)]
pub struct Checkpoint {
    pub kind: CheckpointKind,
    pub item_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LearnerReq {
    pub learner_id: Uuid,
}

#[derive(Serialize, Debug, Clone)]
pub struct QuestionView {
    pub id: Uuid,
    pub prompt: String,
    pub multi: bool,
    pub options: Vec<OptionView>,
}

/// Option as shown to the learner; correctness is withheld until scoring.
#[derive(Serialize, Debug, Clone)]
pub struct OptionView {
    pub id: Uuid,
    pub label: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct StartAttemptResp {
    pub attempt_session: i32,
    pub time_limit_minutes: i32,
    pub session_token: String,
    pub questions: Vec<QuestionView>,
}

/// Answers keyed by question id. Single-answer questions carry one option id;
/// multi-answer questions carry the selected set (client toggle semantics
/// collapse to "the ids still selected at submit time").
pub type AnswerMap = HashMap<Uuid, Vec<Uuid>>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FinalizeAttemptReq {
    pub learner_id: Uuid,
    pub attempt_session: i32,
    pub session_token: String,
    #[serde(default)]
    pub answers: AnswerMap,
    /// Advisory only; the deadline check derives elapsed time server-side.
    pub time_taken_seconds: i32,
}

#[derive(Serialize, Debug, Clone)]
pub struct FinalizeAttemptResp {
    pub attempt_session: i32,
    pub score: i32,
    pub status: AttemptStatus,
    pub late: bool,
    pub certificate_issued: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitAssignmentReq {
    pub learner_id: Uuid,
    pub file: Option<String>,
    pub url: Option<String>,
    pub text: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SubmitAssignmentResp {
    pub submission_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClaimReviewReq {
    pub reviewer_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReviewReq {
    pub reviewer_id: Uuid,
    pub status: SubmissionStatus,
    pub score: Option<i32>,
    pub feedback: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: i64,
    pub completed: i64,
    pub percent: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ProgressQuery {
    pub learner_id: Uuid,
    pub course_id: Uuid,
}
