use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, PgConnection, Postgres, Transaction};
use uuid::Uuid;

use super::{CertificateFilter, Store, StoreTx};
use crate::{
    db::Db,
    error::{AppError, AppResult},
    models::{Certificate, ContentItem, ContentProgress, Course, Enrollment, Learner},
};

const ENROLLMENT_COLUMNS: &str = "id, user_id, course_id, status, progress_percentage, enrolled_at, \
     started_at, completed_at, last_accessed_at, certificate_issued";
const PROGRESS_COLUMNS: &str = "id, enrollment_id, content_item_id, is_completed, progress_percentage, \
     time_spent_seconds, last_position, started_at, completed_at, updated_at";
const CERTIFICATE_COLUMNS: &str = "id, user_id, course_id, enrollment_id, certificate_number, \
     verification_code, title, description, issued_at, expires_at, is_revoked";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let tx = self.db.begin().await?;
        Ok(Box::new(PgTx { tx: Some(tx) }))
    }
}

pub struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> AppResult<&mut PgConnection> {
        self.tx
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| AppError::Invariant("transaction already committed".into()))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[async_trait]
impl StoreTx for PgTx {
    async fn find_learner(&mut self, id: Uuid) -> AppResult<Option<Learner>> {
        let row = query_as::<_, Learner>(
            "SELECT id, username, first_name, last_name, role FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(row)
    }

    async fn find_course(&mut self, id: Uuid) -> AppResult<Option<Course>> {
        let row = query_as::<_, Course>("SELECT id, title, created_at FROM courses WHERE id = $1")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn find_course_item(&mut self, course_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentItem>> {
        let row = query_as::<_, ContentItem>(
            r#"
            SELECT ci.id, ci.module_id, ci.title, ci.content_type, ci.order_index, ci.is_mandatory
            FROM content_items ci
            JOIN modules m ON m.id = ci.module_id
            WHERE ci.id = $1 AND m.course_id = $2
            "#,
        )
        .bind(item_id)
        .bind(course_id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(row)
    }

    async fn count_course_items(&mut self, course_id: Uuid) -> AppResult<i64> {
        let n = query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM content_items ci
            JOIN modules m ON m.id = ci.module_id
            WHERE m.course_id = $1
            "#,
        )
        .bind(course_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(n)
    }

    async fn find_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>> {
        let sql = format!("SELECT {} FROM enrollments WHERE id = $1", ENROLLMENT_COLUMNS);
        let row = query_as::<_, Enrollment>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn find_enrollment_for(&mut self, user_id: Uuid, course_id: Uuid) -> AppResult<Option<Enrollment>> {
        let sql = format!(
            "SELECT {} FROM enrollments WHERE user_id = $1 AND course_id = $2",
            ENROLLMENT_COLUMNS
        );
        let row = query_as::<_, Enrollment>(&sql)
            .bind(user_id)
            .bind(course_id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn lock_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>> {
        let sql = format!(
            "SELECT {} FROM enrollments WHERE id = $1 FOR UPDATE",
            ENROLLMENT_COLUMNS
        );
        let row = query_as::<_, Enrollment>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn list_enrollments(&mut self, user_id: Uuid) -> AppResult<Vec<Enrollment>> {
        let sql = format!(
            "SELECT {} FROM enrollments WHERE user_id = $1 ORDER BY enrolled_at DESC",
            ENROLLMENT_COLUMNS
        );
        let rows = query_as::<_, Enrollment>(&sql)
            .bind(user_id)
            .fetch_all(self.conn()?)
            .await?;
        Ok(rows)
    }

    async fn insert_enrollment(&mut self, e: &Enrollment) -> AppResult<()> {
        query(
            r#"
            INSERT INTO enrollments (id, user_id, course_id, status, progress_percentage, enrolled_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            "#,
        )
        .bind(e.id)
        .bind(e.user_id)
        .bind(e.course_id)
        .bind(e.status)
        .bind(&e.progress_percentage)
        .bind(e.enrolled_at)
        .execute(self.conn()?)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::Conflict("already enrolled in this course".into())
            } else {
                AppError::Database(err)
            }
        })?;
        Ok(())
    }

    async fn update_enrollment(&mut self, e: &Enrollment) -> AppResult<()> {
        query(
            r#"
            UPDATE enrollments
            SET status=$2, progress_percentage=$3, started_at=$4, completed_at=$5,
                last_accessed_at=$6, certificate_issued=$7
            WHERE id=$1
            "#,
        )
        .bind(e.id)
        .bind(e.status)
        .bind(&e.progress_percentage)
        .bind(e.started_at)
        .bind(e.completed_at)
        .bind(e.last_accessed_at)
        .bind(e.certificate_issued)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn lock_uncertified_completions(&mut self, course_id: Uuid) -> AppResult<Vec<Enrollment>> {
        let sql = format!(
            r#"
            SELECT {} FROM enrollments
            WHERE course_id = $1 AND status = 'completed' AND NOT certificate_issued
            ORDER BY completed_at
            FOR UPDATE
            "#,
            ENROLLMENT_COLUMNS
        );
        let rows = query_as::<_, Enrollment>(&sql)
            .bind(course_id)
            .fetch_all(self.conn()?)
            .await?;
        Ok(rows)
    }

    async fn find_progress(&mut self, enrollment_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentProgress>> {
        let sql = format!(
            "SELECT {} FROM content_progress WHERE enrollment_id = $1 AND content_item_id = $2",
            PROGRESS_COLUMNS
        );
        let row = query_as::<_, ContentProgress>(&sql)
            .bind(enrollment_id)
            .bind(item_id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn list_progress(&mut self, enrollment_id: Uuid) -> AppResult<Vec<ContentProgress>> {
        let sql = format!(
            "SELECT {} FROM content_progress WHERE enrollment_id = $1 ORDER BY started_at",
            PROGRESS_COLUMNS
        );
        let rows = query_as::<_, ContentProgress>(&sql)
            .bind(enrollment_id)
            .fetch_all(self.conn()?)
            .await?;
        Ok(rows)
    }

    async fn save_progress(&mut self, p: &ContentProgress) -> AppResult<()> {
        query(
            r#"
            INSERT INTO content_progress
                (id, enrollment_id, content_item_id, is_completed, progress_percentage,
                 time_spent_seconds, last_position, started_at, completed_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (enrollment_id, content_item_id)
            DO UPDATE SET is_completed=EXCLUDED.is_completed,
                          progress_percentage=EXCLUDED.progress_percentage,
                          time_spent_seconds=EXCLUDED.time_spent_seconds,
                          last_position=EXCLUDED.last_position,
                          completed_at=EXCLUDED.completed_at,
                          updated_at=EXCLUDED.updated_at
            "#,
        )
        .bind(p.id)
        .bind(p.enrollment_id)
        .bind(p.content_item_id)
        .bind(p.is_completed)
        .bind(&p.progress_percentage)
        .bind(p.time_spent_seconds)
        .bind(p.last_position)
        .bind(p.started_at)
        .bind(p.completed_at)
        .bind(p.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn count_completed_items(&mut self, enrollment_id: Uuid, course_id: Uuid) -> AppResult<i64> {
        let n = query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM content_progress cp
            JOIN content_items ci ON ci.id = cp.content_item_id
            JOIN modules m ON m.id = ci.module_id
            WHERE cp.enrollment_id = $1 AND cp.is_completed AND m.course_id = $2
            "#,
        )
        .bind(enrollment_id)
        .bind(course_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(n)
    }

    async fn sum_time_spent(&mut self, user_id: Uuid) -> AppResult<i64> {
        let n = query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(cp.time_spent_seconds), 0)::BIGINT FROM content_progress cp
            JOIN enrollments e ON e.id = cp.enrollment_id
            WHERE e.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(n)
    }

    async fn find_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>> {
        let sql = format!("SELECT {} FROM certificates WHERE id = $1", CERTIFICATE_COLUMNS);
        let row = query_as::<_, Certificate>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn find_live_certificate(&mut self, enrollment_id: Uuid) -> AppResult<Option<Certificate>> {
        let sql = format!(
            "SELECT {} FROM certificates WHERE enrollment_id = $1 AND NOT is_revoked",
            CERTIFICATE_COLUMNS
        );
        let row = query_as::<_, Certificate>(&sql)
            .bind(enrollment_id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn insert_certificate(&mut self, c: &Certificate) -> AppResult<bool> {
        // Any unique index conflict reports false. With the enrollment row
        // locked by the caller that means a number or code collision.
        let done = query(
            r#"
            INSERT INTO certificates
                (id, user_id, course_id, enrollment_id, certificate_number, verification_code,
                 title, description, issued_at, expires_at, is_revoked)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(c.id)
        .bind(c.user_id)
        .bind(c.course_id)
        .bind(c.enrollment_id)
        .bind(&c.certificate_number)
        .bind(&c.verification_code)
        .bind(&c.title)
        .bind(&c.description)
        .bind(c.issued_at)
        .bind(c.expires_at)
        .bind(c.is_revoked)
        .execute(self.conn()?)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn list_certificates(&mut self, f: &CertificateFilter) -> AppResult<Vec<Certificate>> {
        let sql = format!(
            r#"
            SELECT {} FROM certificates
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::uuid IS NULL OR course_id = $2)
              AND ($3 OR NOT is_revoked)
            ORDER BY issued_at DESC
            OFFSET $4 LIMIT $5
            "#,
            CERTIFICATE_COLUMNS
        );
        let rows = query_as::<_, Certificate>(&sql)
            .bind(f.user_id)
            .bind(f.course_id)
            .bind(f.include_revoked)
            .bind(f.offset)
            .bind(f.limit)
            .fetch_all(self.conn()?)
            .await?;
        Ok(rows)
    }

    async fn revoke_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>> {
        let sql = format!(
            "UPDATE certificates SET is_revoked = true WHERE id = $1 RETURNING {}",
            CERTIFICATE_COLUMNS
        );
        let row = query_as::<_, Certificate>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row)
    }

    async fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Invariant("transaction already committed".into()))?;
        tx.commit().await?;
        Ok(())
    }
}
