//! Course completion orchestration: re-aggregate progress after any item
//! completes, and issue the one-and-only certificate at 100%.

use chrono::Utc;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::Certificate;
use crate::progress;

pub fn certificate_number() -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!(
        "CT-{}-{}",
        Utc::now().format("%Y%m%d"),
        tag[..8].to_uppercase()
    )
}

/// Hook run after a CompletionRecord is created, a quiz attempt finalizes, or
/// an assignment review lands. Returns whether a certificate exists once the
/// dust settles (true only at 100% completion).
pub async fn on_item_completed(db: &Db, learner_id: Uuid, course_id: Uuid) -> Result<bool> {
    let summary = progress::compute(db, course_id, learner_id).await?;
    if summary.percent < 100 {
        return Ok(false);
    }
    get_or_issue(db, learner_id, course_id).await?;
    Ok(true)
}

/// Idempotent fetch-or-create. Safe under concurrent completion triggers: the
/// (learner, course) uniqueness constraint picks one writer and everyone else
/// reads that row back. Retried once on a transaction abort.
pub async fn get_or_issue(db: &Db, learner_id: Uuid, course_id: Uuid) -> Result<Certificate> {
    match try_issue(db, learner_id, course_id).await {
        Err(Error::Storage(e)) => {
            tracing::warn!(learner_id=%learner_id, course_id=%course_id, error=%e,
                "certificate issuance aborted, retrying");
            try_issue(db, learner_id, course_id).await
        }
        other => other,
    }
}

async fn try_issue(db: &Db, learner_id: Uuid, course_id: Uuid) -> Result<Certificate> {
    if let Some(existing) = fetch(db, learner_id, course_id).await? {
        return Ok(existing);
    }

    let summary = progress::compute(db, course_id, learner_id).await?;
    if summary.percent < 100 {
        return Err(Error::PolicyViolation(format!(
            "course is {}% complete; a certificate requires 100%",
            summary.percent
        )));
    }

    let mut tx = db.begin().await?;

    let enrollment_id: Uuid = sqlx::query_scalar(
        "SELECT id FROM enrollments WHERE learner_id = $1 AND course_id = $2 FOR UPDATE",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(Error::NotFound("enrollment"))?;

    let inserted: Option<Certificate> = sqlx::query_as(
        "INSERT INTO certificates (id, learner_id, course_id, enrollment_id, certificate_number) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (learner_id, course_id) DO NOTHING \
         RETURNING id, learner_id, course_id, enrollment_id, certificate_number, issued_at",
    )
    .bind(Uuid::new_v4())
    .bind(learner_id)
    .bind(course_id)
    .bind(enrollment_id)
    .bind(certificate_number())
    .fetch_optional(&mut *tx)
    .await?;

    let certificate = match inserted {
        Some(cert) => {
            sqlx::query(
                "UPDATE enrollments SET status = 'completed', completed_at = now() \
                 WHERE id = $1 AND status != 'completed'",
            )
            .bind(enrollment_id)
            .execute(&mut *tx)
            .await?;
            tracing::info!(learner_id=%learner_id, course_id=%course_id,
                number=%cert.certificate_number, "certificate issued");
            cert
        }
        // lost the race to a concurrent completion trigger; their row wins
        None => fetch_in_tx(&mut tx, learner_id, course_id)
            .await?
            .ok_or_else(|| {
                Error::ConcurrencyConflict("certificate row vanished mid-issue".into())
            })?,
    };

    tx.commit().await?;
    Ok(certificate)
}

async fn fetch(db: &Db, learner_id: Uuid, course_id: Uuid) -> Result<Option<Certificate>> {
    Ok(sqlx::query_as(
        "SELECT id, learner_id, course_id, enrollment_id, certificate_number, issued_at \
         FROM certificates WHERE learner_id = $1 AND course_id = $2",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_optional(db)
    .await?)
}

async fn fetch_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    learner_id: Uuid,
    course_id: Uuid,
) -> Result<Option<Certificate>> {
    Ok(sqlx::query_as(
        "SELECT id, learner_id, course_id, enrollment_id, certificate_number, issued_at \
         FROM certificates WHERE learner_id = $1 AND course_id = $2",
    )
    .bind(learner_id)
    .bind(course_id)
    .fetch_optional(&mut **tx)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_number_shape() {
        let n = certificate_number();
        let parts: Vec<&str> = n.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "CT");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn certificate_numbers_are_distinct() {
        assert_ne!(certificate_number(), certificate_number());
    }
}
