//! Timed quiz attempts: entry gate, stateless session hand-off, scoring, and
//! exactly-once finalization.
//!
//! An in-progress attempt lives entirely in the client; only the terminal
//! transition is written, so an abandoned attempt never counts against the
//! attempt cap.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use uuid::Uuid;

use crate::access;
use crate::certificate;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{
    AnswerMap, AttemptStatus, FinalizeAttemptReq, FinalizeAttemptResp, OptionView, Question,
    QuestionOption, QuestionView, Quiz, QuizAttempt, StartAttemptResp,
};
use crate::token::{self, AttemptSession};

/// Slack on top of the advertised time limit before a finalize counts as a
/// late auto-submit. Covers network latency and client timer drift.
pub const GRACE_SECONDS: i64 = 30;

/// The correct-answer set for one question.
#[derive(Debug, Clone)]
pub struct AnswerKey {
    pub question_id: Uuid,
    pub correct: HashSet<Uuid>,
}

#[derive(Debug, Clone)]
pub struct QuestionResult {
    pub question_id: Uuid,
    pub selected: Vec<Uuid>,
    pub correct: bool,
}

/// Scores one attempt. A question is correct when the selected set exactly
/// equals the correct set; this covers both single-answer questions (one
/// correct id) and multi-answer ones. Missing or empty answers score as
/// incorrect, never as an error.
pub fn score_attempt(keys: &[AnswerKey], answers: &AnswerMap) -> (i32, Vec<QuestionResult>) {
    let empty: Vec<Uuid> = Vec::new();
    let mut results = Vec::with_capacity(keys.len());
    let mut correct_count = 0usize;

    for key in keys {
        let selected = answers.get(&key.question_id).unwrap_or(&empty);
        let selected_set: HashSet<Uuid> = selected.iter().copied().collect();
        let correct = !key.correct.is_empty() && selected_set == key.correct;
        if correct {
            correct_count += 1;
        }
        results.push(QuestionResult {
            question_id: key.question_id,
            selected: selected_set.into_iter().collect(),
            correct,
        });
    }

    let score = if keys.is_empty() {
        0
    } else {
        (100.0 * correct_count as f64 / keys.len() as f64).round() as i32
    };
    (score, results)
}

pub fn status_for(score: i32, passing_score: i32) -> AttemptStatus {
    if score >= passing_score {
        AttemptStatus::Passed
    } else {
        AttemptStatus::Failed
    }
}

async fn fetch_quiz(db: &Db, quiz_id: Uuid) -> Result<Quiz> {
    sqlx::query_as::<_, Quiz>(
        "SELECT id, course_id, title, time_limit_minutes, passing_score, max_attempts, \
         created_at FROM quizzes WHERE id = $1",
    )
    .bind(quiz_id)
    .fetch_optional(db)
    .await?
    .ok_or(Error::NotFound("quiz"))
}

/// Distinct finalized sessions for (learner, quiz). The uniqueness constraint
/// makes row count and distinct session count the same thing.
async fn finalized_sessions(db: &Db, learner_id: Uuid, quiz_id: Uuid) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM quiz_attempts WHERE learner_id = $1 AND quiz_id = $2",
    )
    .bind(learner_id)
    .bind(quiz_id)
    .fetch_one(db)
    .await?)
}

async fn load_questions(db: &Db, quiz_id: Uuid) -> Result<(Vec<Question>, Vec<QuestionOption>)> {
    let questions = sqlx::query_as::<_, Question>(
        "SELECT id, quiz_id, prompt, multi, position FROM questions \
         WHERE quiz_id = $1 ORDER BY position",
    )
    .bind(quiz_id)
    .fetch_all(db)
    .await?;
    let options = sqlx::query_as::<_, QuestionOption>(
        "SELECT o.id, o.question_id, o.label, o.is_correct FROM question_options o \
         JOIN questions q ON q.id = o.question_id WHERE q.quiz_id = $1",
    )
    .bind(quiz_id)
    .fetch_all(db)
    .await?;
    Ok((questions, options))
}

fn answer_keys(questions: &[Question], options: &[QuestionOption]) -> Vec<AnswerKey> {
    questions
        .iter()
        .map(|q| AnswerKey {
            question_id: q.id,
            correct: options
                .iter()
                .filter(|o| o.question_id == q.id && o.is_correct)
                .map(|o| o.id)
                .collect(),
        })
        .collect()
}

/// The session number depends only on how many attempts have finalized, so
/// restarting before a finalize re-issues the same number.
fn next_session(finalized: i64) -> i32 {
    finalized as i32 + 1
}

/// Opens an attempt session. The server keeps no record of the hand-out, so
/// a client that calls start again before finalizing receives a fresh clock
/// for the same session number; that stretches one attempt's deadline but
/// never grants an extra attempt, and repeated start log lines for one
/// (learner, quiz, session) make it visible to operators.
pub async fn start(
    db: &Db,
    secret: &str,
    quiz_id: Uuid,
    learner_id: Uuid,
) -> Result<StartAttemptResp> {
    let quiz = fetch_quiz(db, quiz_id).await?;
    access::check_access(db, learner_id, quiz.course_id).await?;

    let finalized = finalized_sessions(db, learner_id, quiz_id).await?;
    if finalized >= quiz.max_attempts as i64 {
        return Err(Error::PolicyViolation(format!(
            "attempt limit of {} reached for this quiz",
            quiz.max_attempts
        )));
    }
    let attempt_session = next_session(finalized);

    let (questions, options) = load_questions(db, quiz_id).await?;
    let mut by_question: HashMap<Uuid, Vec<OptionView>> = HashMap::new();
    for o in options {
        // correctness stays server-side
        by_question
            .entry(o.question_id)
            .or_default()
            .push(OptionView {
                id: o.id,
                label: o.label,
            });
    }
    let questions = questions
        .into_iter()
        .map(|q| QuestionView {
            options: by_question.remove(&q.id).unwrap_or_default(),
            id: q.id,
            prompt: q.prompt,
            multi: q.multi,
        })
        .collect();

    let session = AttemptSession {
        learner_id,
        quiz_id,
        attempt_session,
        started_at: Utc::now(),
    };
    tracing::info!(learner_id=%learner_id, quiz_id=%quiz_id, attempt_session,
        started_at=%session.started_at, "quiz attempt session issued");

    Ok(StartAttemptResp {
        attempt_session,
        time_limit_minutes: quiz.time_limit_minutes,
        session_token: token::sign(&session, secret),
        questions,
    })
}

pub async fn finalize(
    db: &Db,
    secret: &str,
    quiz_id: Uuid,
    req: FinalizeAttemptReq,
) -> Result<FinalizeAttemptResp> {
    let session = token::verify(&req.session_token, secret)?;
    if session.learner_id != req.learner_id
        || session.quiz_id != quiz_id
        || session.attempt_session != req.attempt_session
    {
        return Err(Error::Validation(
            "session token does not match this attempt".into(),
        ));
    }

    let quiz = fetch_quiz(db, quiz_id).await?;
    access::check_access(db, req.learner_id, quiz.course_id).await?;

    // Duplicate finalize (client retry) returns the already-persisted result.
    if let Some(existing) = fetch_attempt(db, req.learner_id, quiz_id, req.attempt_session).await? {
        tracing::info!(learner_id=%req.learner_id, quiz_id=%quiz_id,
            attempt_session=req.attempt_session, "duplicate finalize, returning original result");
        return respond(db, &quiz, existing).await;
    }

    let finalized = finalized_sessions(db, req.learner_id, quiz_id).await?;
    if finalized >= quiz.max_attempts as i64 {
        return Err(Error::PolicyViolation(format!(
            "attempt limit of {} reached for this quiz",
            quiz.max_attempts
        )));
    }
    if req.attempt_session != finalized as i32 + 1 {
        return Err(Error::Validation(format!(
            "expected attempt session {}, got {}",
            finalized + 1,
            req.attempt_session
        )));
    }

    // Authoritative timing from the signed start timestamp; the client-sent
    // time_taken_seconds is advisory. Past deadline + grace the attempt is
    // still finalized rather than thrown away, but flagged.
    let elapsed = (Utc::now() - session.started_at).num_seconds().max(0);
    let late = elapsed > quiz.time_limit_minutes as i64 * 60 + GRACE_SECONDS;
    if late {
        tracing::warn!(learner_id=%req.learner_id, quiz_id=%quiz_id,
            attempt_session=req.attempt_session, elapsed,
            "late auto-submit accepted past deadline");
    }

    let (questions, options) = load_questions(db, quiz_id).await?;
    let keys = answer_keys(&questions, &options);
    let (score, results) = score_attempt(&keys, &req.answers);
    let status = status_for(score, quiz.passing_score);

    let attempt = match persist(db, &quiz, &req, score, status, elapsed as i32, late, &results)
        .await
    {
        Ok(attempt) => attempt,
        // Two finalize calls raced past the duplicate check; first writer
        // wins, the loser reads that row back.
        Err(Error::Storage(sqlx::Error::Database(dbe))) if dbe.is_unique_violation() => {
            fetch_attempt(db, req.learner_id, quiz_id, req.attempt_session)
                .await?
                .ok_or_else(|| {
                    Error::ConcurrencyConflict("attempt row vanished mid-finalize".into())
                })?
        }
        Err(e) => return Err(e),
    };

    respond(db, &quiz, attempt).await
}

#[allow(clippy::too_many_arguments)]
async fn persist(
    db: &Db,
    quiz: &Quiz,
    req: &FinalizeAttemptReq,
    score: i32,
    status: AttemptStatus,
    time_taken_seconds: i32,
    late: bool,
    results: &[QuestionResult],
) -> Result<QuizAttempt> {
    let mut tx = db.begin().await?;

    let attempt = sqlx::query_as::<_, QuizAttempt>(
        "INSERT INTO quiz_attempts \
         (id, quiz_id, learner_id, attempt_session, score, status, time_taken_seconds, late) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING id, quiz_id, learner_id, attempt_session, score, status, \
                   time_taken_seconds, late, completed_at",
    )
    .bind(Uuid::new_v4())
    .bind(quiz.id)
    .bind(req.learner_id)
    .bind(req.attempt_session)
    .bind(score)
    .bind(status)
    .bind(time_taken_seconds)
    .bind(late)
    .fetch_one(&mut *tx)
    .await?;

    for r in results {
        sqlx::query(
            "INSERT INTO quiz_attempt_answers (attempt_id, question_id, selected_option_ids, is_correct) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(attempt.id)
        .bind(r.question_id)
        .bind(&r.selected)
        .bind(r.correct)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(learner_id=%req.learner_id, quiz_id=%quiz.id,
        attempt_session=req.attempt_session, score, status=?status, "quiz attempt finalized");
    Ok(attempt)
}

async fn respond(db: &Db, quiz: &Quiz, attempt: QuizAttempt) -> Result<FinalizeAttemptResp> {
    let certificate_issued = if attempt.status == AttemptStatus::Passed {
        certificate::on_item_completed(db, attempt.learner_id, quiz.course_id).await?
    } else {
        false
    };
    Ok(FinalizeAttemptResp {
        attempt_session: attempt.attempt_session,
        score: attempt.score,
        status: attempt.status,
        late: attempt.late,
        certificate_issued,
    })
}

async fn fetch_attempt(
    db: &Db,
    learner_id: Uuid,
    quiz_id: Uuid,
    attempt_session: i32,
) -> Result<Option<QuizAttempt>> {
    Ok(sqlx::query_as::<_, QuizAttempt>(
        "SELECT id, quiz_id, learner_id, attempt_session, score, status, \
         time_taken_seconds, late, completed_at FROM quiz_attempts \
         WHERE learner_id = $1 AND quiz_id = $2 AND attempt_session = $3",
    )
    .bind(learner_id)
    .bind(quiz_id)
    .bind(attempt_session)
    .fetch_optional(db)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(correct: &[Uuid]) -> AnswerKey {
        AnswerKey {
            question_id: Uuid::new_v4(),
            correct: correct.iter().copied().collect(),
        }
    }

    #[test]
    fn three_of_four_is_seventy_five() {
        let opts: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let keys: Vec<AnswerKey> = opts.iter().map(|o| key(&[*o])).collect();

        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![opts[0]]);
        answers.insert(keys[1].question_id, vec![opts[1]]);
        answers.insert(keys[2].question_id, vec![opts[2]]);
        answers.insert(keys[3].question_id, vec![Uuid::new_v4()]); // wrong

        let (score, results) = score_attempt(&keys, &answers);
        assert_eq!(score, 75);
        assert_eq!(results.iter().filter(|r| r.correct).count(), 3);
        assert_eq!(status_for(score, 70), AttemptStatus::Passed);
    }

    #[test]
    fn missing_answer_scores_incorrect() {
        let correct = Uuid::new_v4();
        let keys = vec![key(&[correct]), key(&[Uuid::new_v4()])];
        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![correct]);
        // second question unanswered
        let (score, results) = score_attempt(&keys, &answers);
        assert_eq!(score, 50);
        assert!(!results[1].correct);
    }

    #[test]
    fn multi_answer_requires_exact_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let keys = vec![key(&[a, b])];

        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![a]);
        assert_eq!(score_attempt(&keys, &answers).0, 0); // subset

        answers.insert(keys[0].question_id, vec![a, b, c]);
        assert_eq!(score_attempt(&keys, &answers).0, 0); // superset

        answers.insert(keys[0].question_id, vec![b, a]);
        assert_eq!(score_attempt(&keys, &answers).0, 100); // order-insensitive
    }

    #[test]
    fn single_answer_with_extra_selection_is_incorrect() {
        let correct = Uuid::new_v4();
        let keys = vec![key(&[correct])];
        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![correct, Uuid::new_v4()]);
        assert_eq!(score_attempt(&keys, &answers).0, 0);
    }

    #[test]
    fn duplicate_selections_collapse() {
        let correct = Uuid::new_v4();
        let keys = vec![key(&[correct])];
        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![correct, correct]);
        assert_eq!(score_attempt(&keys, &answers).0, 100);
    }

    #[test]
    fn empty_quiz_scores_zero() {
        let (score, results) = score_attempt(&[], &AnswerMap::new());
        assert_eq!(score, 0);
        assert!(results.is_empty());
    }

    #[test]
    fn question_without_correct_option_never_passes() {
        let keys = vec![key(&[])];
        let mut answers = AnswerMap::new();
        answers.insert(keys[0].question_id, vec![]);
        assert_eq!(score_attempt(&keys, &answers).0, 0);
    }

    #[test]
    fn restart_reissues_the_same_session_number() {
        // only a finalize advances the numbering; abandoning and restarting
        // never consumes an attempt
        assert_eq!(next_session(0), 1);
        assert_eq!(next_session(2), 3);
        assert_eq!(next_session(2), next_session(2));
    }

    #[test]
    fn pass_boundary_is_inclusive() {
        assert_eq!(status_for(70, 70), AttemptStatus::Passed);
        assert_eq!(status_for(69, 70), AttemptStatus::Failed);
    }
}
