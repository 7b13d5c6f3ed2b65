use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    certificates,
    error::{AppError, AppResult},
    models::{
        CompletionSummary, ContentProgress, CourseProgress, Enrollment, EnrollmentSnapshot,
        EnrollmentStatus, OverallProgress, ProgressOutcome, ProgressReq,
    },
    progress::{self, ProgressPatch},
    store::{CertificateFilter, Store, StoreTx},
};

/// Enrollment, progress recording and automatic certificate issuance.
#[derive(Clone)]
pub struct ProgressEngine {
    store: Arc<dyn Store>,
    certificate_prefix: Arc<str>,
}

impl ProgressEngine {
    pub fn new(store: Arc<dyn Store>, certificate_prefix: &str) -> Self {
        Self {
            store,
            certificate_prefix: Arc::from(certificate_prefix),
        }
    }

    #[instrument(skip(self))]
    pub async fn enroll(&self, learner_id: Uuid, course_id: Uuid) -> AppResult<Enrollment> {
        let mut tx = self.store.begin().await?;
        if tx.find_course(course_id).await?.is_none() {
            return Err(AppError::NotFound("course"));
        }
        if tx.find_enrollment_for(learner_id, course_id).await?.is_some() {
            return Err(AppError::Conflict("already enrolled in this course".into()));
        }
        let enrollment = Enrollment::new(learner_id, course_id, Utc::now());
        tx.insert_enrollment(&enrollment).await?;
        tx.commit().await?;
        Ok(enrollment)
    }

    pub async fn my_enrollments(&self, learner_id: Uuid) -> AppResult<Vec<Enrollment>> {
        let mut tx = self.store.begin().await?;
        tx.list_enrollments(learner_id).await
    }

    pub async fn get_enrollment(&self, learner_id: Uuid, enrollment_id: Uuid) -> AppResult<Enrollment> {
        let mut tx = self.store.begin().await?;
        owned(tx.find_enrollment(enrollment_id).await?, learner_id)
    }

    pub async fn list_progress(&self, learner_id: Uuid, enrollment_id: Uuid) -> AppResult<Vec<ContentProgress>> {
        let mut tx = self.store.begin().await?;
        let enrollment = owned(tx.find_enrollment(enrollment_id).await?, learner_id)?;
        tx.list_progress(enrollment.id).await
    }

    /// Upserts one content item's progress and brings the enrollment in line.
    pub async fn record_progress(
        &self,
        learner_id: Uuid,
        enrollment_id: Uuid,
        req: ProgressReq,
    ) -> AppResult<ProgressOutcome> {
        let patch = ProgressPatch::from_req(&req)?;
        let (progress, enrollment) = self
            .write_progress(learner_id, enrollment_id, req.content_item_id, patch)
            .await?;
        Ok(ProgressOutcome {
            progress,
            enrollment: EnrollmentSnapshot::from(&enrollment),
        })
    }

    pub async fn mark_complete(
        &self,
        learner_id: Uuid,
        enrollment_id: Uuid,
        content_item_id: Uuid,
    ) -> AppResult<CompletionSummary> {
        let (_, enrollment) = self
            .write_progress(learner_id, enrollment_id, content_item_id, ProgressPatch::complete())
            .await?;
        Ok(CompletionSummary {
            content_item_id,
            enrollment_progress: enrollment.progress_percentage,
            enrollment_status: enrollment.status,
        })
    }

    #[instrument(skip(self, patch))]
    async fn write_progress(
        &self,
        learner_id: Uuid,
        enrollment_id: Uuid,
        content_item_id: Uuid,
        patch: ProgressPatch,
    ) -> AppResult<(ContentProgress, Enrollment)> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let enrollment = owned(tx.lock_enrollment(enrollment_id).await?, learner_id)?;
        let item = tx
            .find_course_item(enrollment.course_id, content_item_id)
            .await?
            .ok_or(AppError::NotFound("content item"))?;

        let current = tx.find_progress(enrollment.id, item.id).await?;
        let row = patch.merge(current.as_ref(), enrollment.id, item.id, now);
        tx.save_progress(&row).await?;

        let enrollment = self.settle(&mut *tx, &enrollment, now).await?;
        tx.commit().await?;
        Ok((row, enrollment))
    }

    /// Recomputes the percentage, applies the status transition and issues
    /// the certificate when this step completes the course. Runs inside the
    /// transaction holding the enrollment lock.
    async fn settle(
        &self,
        tx: &mut dyn StoreTx,
        current: &Enrollment,
        now: DateTime<Utc>,
    ) -> AppResult<Enrollment> {
        let total = tx.count_course_items(current.course_id).await?;
        let completed = tx.count_completed_items(current.id, current.course_id).await?;
        let pct = progress::completion_percentage(completed, total)?;

        let step = progress::transition(current, pct, now);
        if step.enrollment.status != current.status {
            debug!(
                enrollment_id = %current.id,
                from = ?current.status,
                to = ?step.enrollment.status,
                "enrollment status changed"
            );
        }

        let issue = step.should_issue_certificate();
        let mut next = step.enrollment;
        if issue {
            if tx.find_live_certificate(next.id).await?.is_none() {
                let course = tx
                    .find_course(next.course_id)
                    .await?
                    .ok_or(AppError::NotFound("course"))?;
                certificates::issue(tx, &next, &course, &self.certificate_prefix, now).await?;
            }
            next.certificate_issued = true;
        }
        tx.update_enrollment(&next).await?;
        Ok(next)
    }

    pub async fn course_progress(&self, learner_id: Uuid, course_id: Uuid) -> AppResult<CourseProgress> {
        let mut tx = self.store.begin().await?;
        let enrollment = tx
            .find_enrollment_for(learner_id, course_id)
            .await?
            .ok_or(AppError::NotFound("enrollment"))?;
        let total_items = tx.count_course_items(course_id).await?;
        let completed_items = tx.count_completed_items(enrollment.id, course_id).await?;
        let time_spent_seconds = tx
            .list_progress(enrollment.id)
            .await?
            .iter()
            .map(|p| i64::from(p.time_spent_seconds))
            .sum();

        Ok(CourseProgress {
            course_id,
            enrollment_id: enrollment.id,
            status: enrollment.status,
            progress_percentage: enrollment.progress_percentage,
            completed_items,
            total_items,
            time_spent_seconds,
            last_accessed_at: enrollment.last_accessed_at,
        })
    }

    pub async fn overall_progress(&self, learner_id: Uuid) -> AppResult<OverallProgress> {
        let mut tx = self.store.begin().await?;
        let enrollments = tx.list_enrollments(learner_id).await?;
        let total_time_spent_seconds = tx.sum_time_spent(learner_id).await?;
        let certificates_earned = tx
            .list_certificates(&CertificateFilter {
                user_id: Some(learner_id),
                include_revoked: false,
                offset: 0,
                limit: i64::MAX,
                ..CertificateFilter::default()
            })
            .await?
            .len() as i64;

        let count = |status| enrollments.iter().filter(|e| e.status == status).count() as i64;
        // truncated to two decimals
        let average_progress = if enrollments.is_empty() {
            BigDecimal::from(0).with_scale(2)
        } else {
            let sum = enrollments
                .iter()
                .fold(BigDecimal::from(0), |acc, e| acc + &e.progress_percentage);
            (sum / BigDecimal::from(enrollments.len() as i64)).with_scale(2)
        };

        Ok(OverallProgress {
            total_courses_enrolled: enrollments.len() as i64,
            courses_completed: count(EnrollmentStatus::Completed),
            courses_in_progress: count(EnrollmentStatus::InProgress),
            total_time_spent_seconds,
            average_progress,
            certificates_earned,
        })
    }
}

/// Enrollments belonging to someone else are reported as missing.
fn owned(enrollment: Option<Enrollment>, learner_id: Uuid) -> AppResult<Enrollment> {
    enrollment
        .filter(|e| e.user_id == learner_id)
        .ok_or(AppError::NotFound("enrollment"))
}
