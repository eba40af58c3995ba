//! Completion aggregation across the three item sources: plain content,
//! assignments, and quizzes. Always computed from persisted state; the
//! sources change independently, so nothing here may be cached.

use std::collections::HashSet;

use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{ContentKind, ProgressSummary};

/// One countable learning item, with its own completion predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletableItem {
    /// video / pdf / link content, done when a CompletionRecord exists
    Content(Uuid),
    /// assignment content, done when the latest submission is approved
    Assignment(Uuid),
    /// quiz, done when any attempt passed
    Quiz(Uuid),
}

/// The learner's persisted completion state for one course.
#[derive(Debug, Default, Clone)]
pub struct LearnerState {
    pub completed_content: HashSet<Uuid>,
    pub approved_assignments: HashSet<Uuid>,
    pub passed_quizzes: HashSet<Uuid>,
}

impl CompletableItem {
    pub fn is_complete(&self, state: &LearnerState) -> bool {
        match self {
            CompletableItem::Content(id) => state.completed_content.contains(id),
            CompletableItem::Assignment(id) => state.approved_assignments.contains(id),
            CompletableItem::Quiz(id) => state.passed_quizzes.contains(id),
        }
    }
}

pub fn summarize(items: &[CompletableItem], state: &LearnerState) -> ProgressSummary {
    let total = items.len() as i64;
    let completed = items.iter().filter(|i| i.is_complete(state)).count() as i64;
    ProgressSummary {
        total,
        completed,
        percent: percent(total, completed),
    }
}

pub fn percent(total: i64, completed: i64) -> i32 {
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * completed as f64 / total as f64).round() as i32;
    pct.min(100)
}

/// Marks a plain content item (video/pdf/link) complete. Idempotent: the
/// (learner, content) primary key absorbs a double submit. Assignments and
/// quizzes complete through their own workflows, not this path.
pub async fn mark_content_complete(db: &Db, learner_id: Uuid, content_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid, ContentKind)> =
        sqlx::query_as("SELECT course_id, kind FROM contents WHERE id = $1")
            .bind(content_id)
            .fetch_optional(db)
            .await?;
    let (course_id, kind) = row.ok_or(Error::NotFound("content"))?;
    if kind == ContentKind::Assignment {
        return Err(Error::Validation(
            "assignments complete through review, not direct marking".into(),
        ));
    }
    crate::access::check_access(db, learner_id, course_id).await?;

    sqlx::query(
        "INSERT INTO completion_records (learner_id, course_id, content_id) \
         VALUES ($1, $2, $3) ON CONFLICT (learner_id, content_id) DO NOTHING",
    )
    .bind(learner_id)
    .bind(course_id)
    .bind(content_id)
    .execute(db)
    .await?;

    tracing::debug!(learner_id=%learner_id, content_id=%content_id, "content marked complete");
    crate::certificate::on_item_completed(db, learner_id, course_id).await
}

pub async fn compute(db: &Db, course_id: Uuid, learner_id: Uuid) -> Result<ProgressSummary> {
    let items = course_items(db, course_id).await?;
    let state = learner_state(db, course_id, learner_id).await?;
    Ok(summarize(&items, &state))
}

async fn course_items(db: &Db, course_id: Uuid) -> Result<Vec<CompletableItem>> {
    let contents: Vec<(Uuid, bool)> = sqlx::query_as(
        "SELECT id, kind = 'assignment' FROM contents WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(db)
    .await?;
    let quizzes: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM quizzes WHERE course_id = $1")
        .bind(course_id)
        .fetch_all(db)
        .await?;

    let mut items: Vec<CompletableItem> = contents
        .into_iter()
        .map(|(id, is_assignment)| {
            if is_assignment {
                CompletableItem::Assignment(id)
            } else {
                CompletableItem::Content(id)
            }
        })
        .collect();
    items.extend(quizzes.into_iter().map(|(id,)| CompletableItem::Quiz(id)));
    Ok(items)
}

async fn learner_state(db: &Db, course_id: Uuid, learner_id: Uuid) -> Result<LearnerState> {
    let completed: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT content_id FROM completion_records WHERE learner_id = $1 AND course_id = $2",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_all(db)
    .await?;

    // Approval is terminal for a (learner, content) pair, so the distinct set
    // of approved content ids is exactly "latest submission approved".
    let approved: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT s.content_id FROM assignment_submissions s \
         JOIN contents c ON c.id = s.content_id \
         WHERE s.learner_id = $1 AND c.course_id = $2 AND s.status = 'approved'",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_all(db)
    .await?;

    let passed: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT a.quiz_id FROM quiz_attempts a \
         JOIN quizzes q ON q.id = a.quiz_id \
         WHERE a.learner_id = $1 AND q.course_id = $2 AND a.status = 'passed'",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_all(db)
    .await?;

    Ok(LearnerState {
        completed_content: completed.into_iter().map(|(id,)| id).collect(),
        approved_assignments: approved.into_iter().map(|(id,)| id).collect(),
        passed_quizzes: passed.into_iter().map(|(id,)| id).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_course_is_zero_percent() {
        assert_eq!(percent(0, 0), 0);
        let s = summarize(&[], &LearnerState::default());
        assert_eq!(s, ProgressSummary { total: 0, completed: 0, percent: 0 });
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent(3, 1), 33);
        assert_eq!(percent(3, 2), 67);
        assert_eq!(percent(4, 4), 100);
        // defensive clamp even if completed somehow exceeds total
        assert_eq!(percent(2, 3), 100);
    }

    #[test]
    fn mixed_sources_aggregate() {
        let video = Uuid::new_v4();
        let pdf = Uuid::new_v4();
        let assignment = Uuid::new_v4();
        let quiz = Uuid::new_v4();
        let items = [
            CompletableItem::Content(video),
            CompletableItem::Content(pdf),
            CompletableItem::Assignment(assignment),
            CompletableItem::Quiz(quiz),
        ];

        let mut state = LearnerState::default();
        state.completed_content.insert(video);
        state.passed_quizzes.insert(quiz);

        let s = summarize(&items, &state);
        assert_eq!(s, ProgressSummary { total: 4, completed: 2, percent: 50 });

        state.approved_assignments.insert(assignment);
        state.completed_content.insert(pdf);
        assert_eq!(summarize(&items, &state).percent, 100);
    }

    #[test]
    fn assignment_needs_approval_not_just_submission() {
        let assignment = Uuid::new_v4();
        let item = CompletableItem::Assignment(assignment);
        let mut state = LearnerState::default();
        // a completion record for the same id does not satisfy an assignment
        state.completed_content.insert(assignment);
        assert!(!item.is_complete(&state));
        state.approved_assignments.insert(assignment);
        assert!(item.is_complete(&state));
    }
}
