//! Assignment submissions and the human-review workflow.
//!
//! Rejection is not terminal: a resubmission creates a new row so the review
//! timeline stays reconstructible. Approval is terminal for the
//! (learner, content) pair.

use uuid::Uuid;

use crate::access;
use crate::certificate;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{
    AssignmentSubmission, Content, ContentKind, ReviewReq, SubmissionStatus, SubmissionType,
    SubmitAssignmentReq, SubmitAssignmentResp,
};

const SUBMISSION_COLS: &str = "id, learner_id, content_id, submission_type, payload, status, \
     score, feedback, reviewed_by, submitted_at, reviewed_at";

/// Exactly one of the three payload forms must be present.
pub fn payload_of(req: &SubmitAssignmentReq) -> Result<(SubmissionType, &str)> {
    match (&req.file, &req.url, &req.text) {
        (Some(p), None, None) => Ok((SubmissionType::File, p)),
        (None, Some(p), None) => Ok((SubmissionType::Url, p)),
        (None, None, Some(p)) => Ok((SubmissionType::Text, p)),
        (None, None, None) => Err(Error::Validation(
            "a file, url, or text payload is required".into(),
        )),
        _ => Err(Error::Validation(
            "exactly one of file, url, or text may be provided".into(),
        )),
    }
}

/// The score/outcome constraint: approval needs a score at or above the
/// content's passing score, rejection one below it. Anything else fails
/// before any write happens.
pub fn validate_review(
    status: SubmissionStatus,
    score: Option<i32>,
    passing_score: i32,
) -> Result<i32> {
    let score = score.ok_or_else(|| Error::Validation("a review requires a score".into()))?;
    if !(0..=100).contains(&score) {
        return Err(Error::Validation("score must be between 0 and 100".into()));
    }
    match status {
        SubmissionStatus::Approved if score >= passing_score => Ok(score),
        SubmissionStatus::Approved => Err(Error::Validation(format!(
            "cannot approve with score {score} below the passing score {passing_score}"
        ))),
        SubmissionStatus::Rejected if score < passing_score => Ok(score),
        SubmissionStatus::Rejected => Err(Error::Validation(format!(
            "cannot reject with score {score} at or above the passing score {passing_score}"
        ))),
        _ => Err(Error::Validation(
            "a review outcome must be approved or rejected".into(),
        )),
    }
}

async fn fetch_assignment_content(db: &Db, content_id: Uuid) -> Result<Content> {
    let content = sqlx::query_as::<_, Content>(
        "SELECT id, course_id, title, kind, passing_score, position, created_at \
         FROM contents WHERE id = $1",
    )
    .bind(content_id)
    .fetch_optional(db)
    .await?
    .ok_or(Error::NotFound("content"))?;
    if content.kind != ContentKind::Assignment {
        return Err(Error::Validation(
            "content item is not an assignment".into(),
        ));
    }
    Ok(content)
}

pub async fn submit(
    db: &Db,
    content_id: Uuid,
    req: &SubmitAssignmentReq,
) -> Result<SubmitAssignmentResp> {
    let (submission_type, payload) = payload_of(req)?;
    let content = fetch_assignment_content(db, content_id).await?;
    access::check_access(db, req.learner_id, content.course_id).await?;

    let approved_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM assignment_submissions \
         WHERE learner_id = $1 AND content_id = $2 AND status = 'approved')",
    )
    .bind(req.learner_id)
    .bind(content_id)
    .fetch_one(db)
    .await?;
    if approved_exists {
        return Err(Error::PolicyViolation(
            "assignment is already approved; resubmission is not allowed".into(),
        ));
    }

    let submission_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO assignment_submissions (id, learner_id, content_id, submission_type, payload) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(submission_id)
    .bind(req.learner_id)
    .bind(content_id)
    .bind(submission_type)
    .bind(payload)
    .execute(db)
    .await?;

    tracing::info!(learner_id=%req.learner_id, content_id=%content_id,
        submission_id=%submission_id, "assignment submitted");
    Ok(SubmitAssignmentResp { submission_id })
}

/// Reviewer picks a submission up: submitted -> under_review. Re-claiming an
/// already-claimed submission reassigns the reviewer.
pub async fn claim(db: &Db, submission_id: Uuid, reviewer_id: Uuid) -> Result<AssignmentSubmission> {
    let sql = format!(
        "UPDATE assignment_submissions SET status = 'under_review', reviewed_by = $2 \
         WHERE id = $1 AND status IN ('submitted', 'under_review') \
         RETURNING {SUBMISSION_COLS}"
    );
    let updated = sqlx::query_as::<_, AssignmentSubmission>(&sql)
        .bind(submission_id)
        .bind(reviewer_id)
        .fetch_optional(db)
        .await?;
    match updated {
        Some(s) => Ok(s),
        None => {
            // distinguish missing from already-reviewed
            fetch_submission(db, submission_id).await?;
            Err(Error::PolicyViolation(
                "submission has already been reviewed".into(),
            ))
        }
    }
}

pub async fn review(db: &Db, submission_id: Uuid, req: &ReviewReq) -> Result<AssignmentSubmission> {
    let mut tx = db.begin().await?;

    let sql = format!(
        "SELECT {SUBMISSION_COLS} FROM assignment_submissions WHERE id = $1 FOR UPDATE"
    );
    let submission = sqlx::query_as::<_, AssignmentSubmission>(&sql)
        .bind(submission_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::NotFound("submission"))?;

    if matches!(
        submission.status,
        SubmissionStatus::Approved | SubmissionStatus::Rejected
    ) {
        return Err(Error::PolicyViolation(
            "submission has already been reviewed".into(),
        ));
    }

    let passing_score: Option<i32> =
        sqlx::query_scalar("SELECT passing_score FROM contents WHERE id = $1")
            .bind(submission.content_id)
            .fetch_one(&mut *tx)
            .await?;
    let passing_score = passing_score.ok_or_else(|| {
        Error::Validation("assignment has no passing score configured".into())
    })?;

    let score = validate_review(req.status, req.score, passing_score)?;

    let sql = format!(
        "UPDATE assignment_submissions \
         SET status = $2, score = $3, feedback = $4, reviewed_by = $5, reviewed_at = now() \
         WHERE id = $1 RETURNING {SUBMISSION_COLS}"
    );
    let reviewed = sqlx::query_as::<_, AssignmentSubmission>(&sql)
        .bind(submission_id)
        .bind(req.status)
        .bind(score)
        .bind(&req.feedback)
        .bind(req.reviewer_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(submission_id=%submission_id, reviewer_id=%req.reviewer_id,
        status=?req.status, score, "assignment reviewed");

    if reviewed.status == SubmissionStatus::Approved {
        let course_id: Uuid = sqlx::query_scalar("SELECT course_id FROM contents WHERE id = $1")
            .bind(reviewed.content_id)
            .fetch_one(db)
            .await?;
        certificate::on_item_completed(db, reviewed.learner_id, course_id).await?;
    }
    Ok(reviewed)
}

async fn fetch_submission(db: &Db, submission_id: Uuid) -> Result<AssignmentSubmission> {
    let sql = format!("SELECT {SUBMISSION_COLS} FROM assignment_submissions WHERE id = $1");
    sqlx::query_as::<_, AssignmentSubmission>(&sql)
        .bind(submission_id)
        .fetch_optional(db)
        .await?
        .ok_or(Error::NotFound("submission"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_req(
        file: Option<&str>,
        url: Option<&str>,
        text: Option<&str>,
    ) -> SubmitAssignmentReq {
        SubmitAssignmentReq {
            learner_id: Uuid::new_v4(),
            file: file.map(String::from),
            url: url.map(String::from),
            text: text.map(String::from),
        }
    }

    #[test]
    fn exactly_one_payload_required() {
        assert!(matches!(
            payload_of(&submit_req(None, None, None)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            payload_of(&submit_req(Some("f"), Some("u"), None)),
            Err(Error::Validation(_))
        ));
        let req = submit_req(None, Some("https://x"), None);
        let (ty, p) = payload_of(&req).unwrap();
        assert_eq!(ty, SubmissionType::Url);
        assert_eq!(p, "https://x");
        let req = submit_req(None, None, Some("answer"));
        let (ty, p) = payload_of(&req).unwrap();
        assert_eq!(ty, SubmissionType::Text);
        assert_eq!(p, "answer");
    }

    #[test]
    fn approve_below_passing_score_rejected() {
        let err = validate_review(SubmissionStatus::Approved, Some(60), 70);
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn approve_at_passing_score_allowed() {
        assert_eq!(validate_review(SubmissionStatus::Approved, Some(70), 70).unwrap(), 70);
        assert_eq!(validate_review(SubmissionStatus::Approved, Some(90), 70).unwrap(), 90);
    }

    #[test]
    fn reject_requires_score_below_threshold() {
        assert!(validate_review(SubmissionStatus::Rejected, Some(69), 70).is_ok());
        assert!(matches!(
            validate_review(SubmissionStatus::Rejected, Some(70), 70),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn review_without_score_rejected() {
        assert!(matches!(
            validate_review(SubmissionStatus::Approved, None, 70),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn review_outcome_must_be_terminal() {
        assert!(matches!(
            validate_review(SubmissionStatus::UnderReview, Some(80), 70),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_review(SubmissionStatus::Submitted, Some(80), 70),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn score_out_of_range_rejected() {
        assert!(matches!(
            validate_review(SubmissionStatus::Approved, Some(101), 70),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_review(SubmissionStatus::Rejected, Some(-1), 70),
            Err(Error::Validation(_))
        ));
    }
}
