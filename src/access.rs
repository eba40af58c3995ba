//! Access window control: the course-level time budget, the first-view
//! trigger, and the reset-on-expiry policy.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{
    AccessStatus, Checkpoint, CheckpointReq, Course, Enrollment, EnrollmentStatus,
};

const ENROLLMENT_COLS: &str = "id, learner_id, course_id, status, enrolled_at, \
     learning_started_at, access_expires_at, completed_at, \
     checkpoint_kind, checkpoint_item_id, checkpoint_updated_at";

/// Time left in the access window. `None` means the course is unlimited.
/// Clamped at zero once the deadline passes.
pub fn remaining(
    enrolled_at: DateTime<Utc>,
    learning_started_at: Option<DateTime<Utc>>,
    duration_hours: i32,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if duration_hours == 0 {
        return None;
    }
    let start = learning_started_at.unwrap_or(enrolled_at);
    let deadline = start + Duration::hours(duration_hours as i64);
    Some((deadline - now).max(Duration::zero()))
}

/// Whether the window has run out. A null `access_expires_at` does not mean
/// "not started": before the first content view the clock runs from
/// `enrolled_at`, so expiry must always be derived from the same math the
/// gate uses.
pub fn window_expired(
    enrolled_at: DateTime<Utc>,
    learning_started_at: Option<DateTime<Utc>>,
    duration_hours: i32,
    now: DateTime<Utc>,
) -> bool {
    matches!(
        remaining(enrolled_at, learning_started_at, duration_hours, now),
        Some(d) if d.is_zero()
    )
}

/// What the access gate should do for one enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Proceed,
    /// cancelled enrollments are refused outright
    Deny,
    /// active window has run out: reset progress, then refuse with the
    /// restart prompt
    ResetAndReject,
}

pub fn gate_action(status: EnrollmentStatus, expired: bool) -> GateAction {
    match status {
        EnrollmentStatus::Cancelled => GateAction::Deny,
        // a finished course is no longer subject to the window; a stale
        // client call after completion must never wipe certified progress
        EnrollmentStatus::Completed => GateAction::Proceed,
        _ if expired => GateAction::ResetAndReject,
        _ => GateAction::Proceed,
    }
}

pub async fn fetch_enrollment(db: &Db, enrollment_id: Uuid) -> Result<Enrollment> {
    let sql = format!("SELECT {ENROLLMENT_COLS} FROM enrollments WHERE id = $1");
    sqlx::query_as::<_, Enrollment>(&sql)
        .bind(enrollment_id)
        .fetch_optional(db)
        .await?
        .ok_or(Error::NotFound("enrollment"))
}

pub async fn fetch_enrollment_for(
    db: &Db,
    learner_id: Uuid,
    course_id: Uuid,
) -> Result<Enrollment> {
    let sql =
        format!("SELECT {ENROLLMENT_COLS} FROM enrollments WHERE learner_id = $1 AND course_id = $2");
    sqlx::query_as::<_, Enrollment>(&sql)
        .bind(learner_id)
        .bind(course_id)
        .fetch_optional(db)
        .await?
        .ok_or(Error::NotFound("enrollment"))
}

async fn fetch_course(db: &Db, course_id: Uuid) -> Result<Course> {
    sqlx::query_as::<_, Course>(
        "SELECT id, title, duration_hours, created_at FROM courses WHERE id = $1",
    )
    .bind(course_id)
    .fetch_optional(db)
    .await?
    .ok_or(Error::NotFound("course"))
}

/// First-content-view trigger: stamps `learning_started_at` and derives
/// `access_expires_at` from the course duration. A second call is a no-op;
/// the `WHERE learning_started_at IS NULL` guard keeps concurrent first
/// views from moving the clock.
pub async fn ensure_started(db: &Db, enrollment_id: Uuid) -> Result<Enrollment> {
    let enrollment = fetch_enrollment(db, enrollment_id).await?;
    if enrollment.learning_started_at.is_some() {
        return Ok(enrollment);
    }
    let course = fetch_course(db, enrollment.course_id).await?;
    let now = Utc::now();
    let expires_at = (course.duration_hours > 0)
        .then(|| now + Duration::hours(course.duration_hours as i64));

    sqlx::query(
        "UPDATE enrollments SET learning_started_at = $2, access_expires_at = $3 \
         WHERE id = $1 AND learning_started_at IS NULL",
    )
    .bind(enrollment_id)
    .bind(now)
    .bind(expires_at)
    .execute(db)
    .await?;

    tracing::info!(enrollment_id=%enrollment_id, "learning window started");
    fetch_enrollment(db, enrollment_id).await
}

pub async fn access_status(db: &Db, enrollment_id: Uuid) -> Result<AccessStatus> {
    let enrollment = fetch_enrollment(db, enrollment_id).await?;
    let course = fetch_course(db, enrollment.course_id).await?;
    let left = remaining(
        enrollment.enrolled_at,
        enrollment.learning_started_at,
        course.duration_hours,
        Utc::now(),
    );
    Ok(match left {
        None => AccessStatus {
            remaining_seconds: None,
            unlimited: true,
            expired: false,
        },
        Some(d) => AccessStatus {
            remaining_seconds: Some(d.num_seconds()),
            unlimited: false,
            expired: d.is_zero(),
        },
    })
}

/// Server-side gate in front of every content-serving and submission-accepting
/// operation. The client countdown is advisory; this re-derives the window
/// from stored timestamps. On expiry the reset policy runs first, then the
/// caller gets `AccessExpired` so the UI can show the restart prompt.
pub async fn check_access(db: &Db, learner_id: Uuid, course_id: Uuid) -> Result<Enrollment> {
    let enrollment = fetch_enrollment_for(db, learner_id, course_id).await?;
    let course = fetch_course(db, course_id).await?;
    let expired = window_expired(
        enrollment.enrolled_at,
        enrollment.learning_started_at,
        course.duration_hours,
        Utc::now(),
    );
    match gate_action(enrollment.status, expired) {
        GateAction::Proceed => Ok(enrollment),
        GateAction::Deny => Err(Error::PolicyViolation("enrollment is cancelled".into())),
        GateAction::ResetAndReject => {
            on_expiry(db, enrollment.id).await?;
            Err(Error::AccessExpired)
        }
    }
}

/// Reset-on-expiry: clears every progress source for the enrollment and
/// restarts the clock. Idempotent; the expiry condition is re-checked under a
/// row lock so two racing requests reset at most once. Retried once on a
/// transaction abort since replaying it is harmless.
pub async fn on_expiry(db: &Db, enrollment_id: Uuid) -> Result<Enrollment> {
    match try_reset(db, enrollment_id).await {
        Err(Error::Storage(e)) => {
            tracing::warn!(enrollment_id=%enrollment_id, error=%e, "window reset aborted, retrying");
            try_reset(db, enrollment_id).await
        }
        other => other,
    }
}

async fn try_reset(db: &Db, enrollment_id: Uuid) -> Result<Enrollment> {
    let mut tx = db.begin().await?;

    let sql = format!("SELECT {ENROLLMENT_COLS} FROM enrollments WHERE id = $1 FOR UPDATE");
    let enrollment = sqlx::query_as::<_, Enrollment>(&sql)
        .bind(enrollment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::NotFound("enrollment"))?;

    // Completed enrollments keep their progress and certificate; the window
    // only bounds in-flight work.
    if enrollment.status == EnrollmentStatus::Completed {
        tx.rollback().await?;
        return Ok(enrollment);
    }

    let course = sqlx::query_as::<_, Course>(
        "SELECT id, title, duration_hours, created_at FROM courses WHERE id = $1",
    )
    .bind(enrollment.course_id)
    .fetch_one(&mut *tx)
    .await?;

    let now = Utc::now();
    // Re-derive expiry with the same math the gate used, under the row lock.
    // A concurrent request may have reset the window while we waited; the
    // window also runs from enrolled_at when learning never started, so a
    // null access_expires_at must not make the reset a no-op.
    let still_expired = window_expired(
        enrollment.enrolled_at,
        enrollment.learning_started_at,
        course.duration_hours,
        now,
    );
    if !still_expired {
        tx.rollback().await?;
        return Ok(enrollment);
    }

    sqlx::query("DELETE FROM completion_records WHERE learner_id = $1 AND course_id = $2")
        .bind(enrollment.learner_id)
        .bind(enrollment.course_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM quiz_attempts WHERE learner_id = $1 \
         AND quiz_id IN (SELECT id FROM quizzes WHERE course_id = $2)",
    )
    .bind(enrollment.learner_id)
    .bind(enrollment.course_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM assignment_submissions WHERE learner_id = $1 \
         AND content_id IN (SELECT id FROM contents WHERE course_id = $2)",
    )
    .bind(enrollment.learner_id)
    .bind(enrollment.course_id)
    .execute(&mut *tx)
    .await?;

    let expires_at = now + Duration::hours(course.duration_hours as i64);
    let sql = format!(
        "UPDATE enrollments SET learning_started_at = $2, access_expires_at = $3, \
         checkpoint_kind = NULL, checkpoint_item_id = NULL, checkpoint_updated_at = NULL \
         WHERE id = $1 RETURNING {ENROLLMENT_COLS}"
    );
    let reset = sqlx::query_as::<_, Enrollment>(&sql)
        .bind(enrollment_id)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(enrollment_id=%enrollment_id, "access window expired, progress reset");
    Ok(reset)
}

pub async fn save_checkpoint(db: &Db, enrollment_id: Uuid, req: &CheckpointReq) -> Result<()> {
    let done = sqlx::query(
        "UPDATE enrollments SET checkpoint_kind = $2, checkpoint_item_id = $3, \
         checkpoint_updated_at = now() WHERE id = $1",
    )
    .bind(enrollment_id)
    .bind(req.kind)
    .bind(req.item_id)
    .execute(db)
    .await?;
    if done.rows_affected() == 0 {
        return Err(Error::NotFound("enrollment"));
    }
    Ok(())
}

pub async fn get_checkpoint(db: &Db, enrollment_id: Uuid) -> Result<Option<Checkpoint>> {
    let enrollment = fetch_enrollment(db, enrollment_id).await?;
    Ok(
        match (
            enrollment.checkpoint_kind,
            enrollment.checkpoint_item_id,
            enrollment.checkpoint_updated_at,
        ) {
            (Some(kind), Some(item_id), Some(updated_at)) => Some(Checkpoint {
                kind,
                item_id,
                updated_at,
            }),
            _ => None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn zero_duration_is_unlimited() {
        assert_eq!(remaining(t(0), None, 0, t(1_000_000)), None);
    }

    #[test]
    fn counts_down_from_learning_start() {
        let start = t(10_000);
        let left = remaining(t(0), Some(start), 2, start + Duration::minutes(30)).unwrap();
        assert_eq!(left, Duration::minutes(90));
    }

    #[test]
    fn falls_back_to_enrolled_at_before_first_view() {
        let left = remaining(t(0), None, 1, t(0) + Duration::minutes(15)).unwrap();
        assert_eq!(left, Duration::minutes(45));
    }

    #[test]
    fn clamps_to_zero_after_deadline() {
        let start = t(0);
        // one-hour course, checked at start + 61min
        let left = remaining(start, Some(start), 1, start + Duration::minutes(61)).unwrap();
        assert_eq!(left, Duration::zero());
    }

    #[test]
    fn exactly_at_deadline_is_expired() {
        let start = t(0);
        let left = remaining(start, Some(start), 1, start + Duration::hours(1)).unwrap();
        assert!(left.is_zero());
        assert!(window_expired(start, Some(start), 1, start + Duration::hours(1)));
    }

    #[test]
    fn window_can_expire_before_first_content_view() {
        // one-hour course, enrolled two hours ago, learning never started:
        // the clock ran from enrolled_at and the reset guard must agree
        let enrolled = t(0);
        let now = enrolled + Duration::hours(2);
        assert!(window_expired(enrolled, None, 1, now));
        assert!(!window_expired(enrolled, None, 1, enrolled + Duration::minutes(30)));
    }

    #[test]
    fn unlimited_course_never_expires() {
        assert!(!window_expired(t(0), None, 0, t(10_000_000_000)));
    }

    #[test]
    fn completed_enrollment_bypasses_expired_window() {
        // a stale call after completion must not trigger the reset path
        assert_eq!(
            gate_action(EnrollmentStatus::Completed, true),
            GateAction::Proceed
        );
        assert_eq!(
            gate_action(EnrollmentStatus::Completed, false),
            GateAction::Proceed
        );
    }

    #[test]
    fn cancelled_enrollment_is_denied() {
        assert_eq!(gate_action(EnrollmentStatus::Cancelled, false), GateAction::Deny);
        assert_eq!(gate_action(EnrollmentStatus::Cancelled, true), GateAction::Deny);
    }

    #[test]
    fn active_enrollment_follows_the_window() {
        assert_eq!(gate_action(EnrollmentStatus::Active, false), GateAction::Proceed);
        assert_eq!(
            gate_action(EnrollmentStatus::Active, true),
            GateAction::ResetAndReject
        );
        assert_eq!(
            gate_action(EnrollmentStatus::Expired, true),
            GateAction::ResetAndReject
        );
    }
}
