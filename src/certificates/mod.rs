//! Certificate issuance and the certificate endpoints' operations.
//!
//! Automatic issuance (on course completion) and manual/bulk generation all
//! go through [`issue`], so they share the identifier contract in
//! [`codes`] and the one-live-certificate-per-enrollment rule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    auth::{Caller, ADMINS, STAFF},
    error::{AppError, AppResult},
    models::{
        BulkGenerateResult, Certificate, CertificateQuery, Course, Enrollment, EnrollmentStatus,
        Verification,
    },
    store::{CertificateFilter, Store, StoreTx},
};

pub mod codes;

const MAX_IDENTIFIER_ATTEMPTS: usize = 5;

/// Inserts a new certificate for `enrollment`. The caller must hold the
/// enrollment lock and must have checked that no live certificate exists.
pub(crate) async fn issue(
    tx: &mut dyn StoreTx,
    enrollment: &Enrollment,
    course: &Course,
    prefix: &str,
    now: DateTime<Utc>,
) -> AppResult<Certificate> {
    for _ in 0..MAX_IDENTIFIER_ATTEMPTS {
        let cert = codes::draft(enrollment, course, prefix, now);
        if tx.insert_certificate(&cert).await? {
            info!(
                enrollment_id = %enrollment.id,
                certificate_number = %cert.certificate_number,
                "certificate issued"
            );
            return Ok(cert);
        }
        tracing::warn!(enrollment_id = %enrollment.id, "certificate identifier collision, regenerating");
    }
    Err(AppError::Invariant(format!(
        "no free certificate identifier after {} attempts",
        MAX_IDENTIFIER_ATTEMPTS
    )))
}

#[derive(Clone)]
pub struct CertificateService {
    store: Arc<dyn Store>,
    prefix: Arc<str>,
}

impl CertificateService {
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Self {
        Self {
            store,
            prefix: Arc::from(prefix),
        }
    }

    /// Returns the enrollment's live certificate, creating one if needed.
    /// The flag is true when a certificate was created by this call.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn generate(&self, caller: &Caller, enrollment_id: Uuid) -> AppResult<(Certificate, bool)> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut enrollment = tx
            .lock_enrollment(enrollment_id)
            .await?
            .filter(|e| e.user_id == caller.user_id || caller.has_any(STAFF))
            .ok_or(AppError::NotFound("enrollment"))?;

        if enrollment.status != EnrollmentStatus::Completed {
            return Err(AppError::Validation(
                "enrollment must be completed to generate a certificate".into(),
            ));
        }
        if let Some(existing) = tx.find_live_certificate(enrollment.id).await? {
            return Ok((existing, false));
        }

        let course = tx
            .find_course(enrollment.course_id)
            .await?
            .ok_or(AppError::NotFound("course"))?;
        let cert = issue(&mut *tx, &enrollment, &course, &self.prefix, now).await?;
        enrollment.certificate_issued = true;
        tx.update_enrollment(&enrollment).await?;
        tx.commit().await?;
        Ok((cert, true))
    }

    /// Certificates for every completed, uncertified enrollment of a course.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn bulk_generate(&self, caller: &Caller, course_id: Uuid) -> AppResult<BulkGenerateResult> {
        caller.require(STAFF)?;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let course = tx
            .find_course(course_id)
            .await?
            .ok_or(AppError::NotFound("course"))?;

        let mut created = 0;
        for mut enrollment in tx.lock_uncertified_completions(course_id).await? {
            if tx.find_live_certificate(enrollment.id).await?.is_none() {
                issue(&mut *tx, &enrollment, &course, &self.prefix, now).await?;
                created += 1;
            }
            enrollment.certificate_issued = true;
            tx.update_enrollment(&enrollment).await?;
        }
        tx.commit().await?;

        Ok(BulkGenerateResult {
            message: format!("Generated {} certificates", created),
            course_id,
            certificates_created: created,
        })
    }

    pub async fn list(&self, caller: &Caller, q: CertificateQuery) -> AppResult<Vec<Certificate>> {
        caller.require(ADMINS)?;
        let filter = CertificateFilter {
            user_id: q.user_id,
            course_id: q.course_id,
            include_revoked: true,
            ..CertificateFilter::default()
        }
        .page(q.skip, q.limit);
        let mut tx = self.store.begin().await?;
        tx.list_certificates(&filter).await
    }

    pub async fn mine(&self, caller: &Caller) -> AppResult<Vec<Certificate>> {
        let filter = CertificateFilter {
            user_id: Some(caller.user_id),
            ..CertificateFilter::default()
        }
        .page(None, None);
        let mut tx = self.store.begin().await?;
        tx.list_certificates(&filter).await
    }

    pub async fn by_course(&self, caller: &Caller, course_id: Uuid) -> AppResult<Vec<Certificate>> {
        caller.require(STAFF)?;
        let filter = CertificateFilter {
            course_id: Some(course_id),
            include_revoked: true,
            ..CertificateFilter::default()
        }
        .page(None, None);
        let mut tx = self.store.begin().await?;
        tx.list_certificates(&filter).await
    }

    pub async fn get(&self, caller: &Caller, id: Uuid) -> AppResult<Certificate> {
        let mut tx = self.store.begin().await?;
        let cert = tx
            .find_certificate(id)
            .await?
            .ok_or(AppError::NotFound("certificate"))?;
        caller.require_owner_or(cert.user_id, ADMINS)?;
        Ok(cert)
    }

    /// Public check of a certificate id against its verification code.
    pub async fn verify(&self, id: Uuid, verification_code: &str) -> AppResult<Verification> {
        let mut tx = self.store.begin().await?;
        let cert = match tx.find_certificate(id).await? {
            Some(c) if c.verification_code == verification_code => c,
            _ => return Ok(invalid("Certificate not found or verification code is invalid")),
        };
        if cert.is_revoked {
            return Ok(invalid("This certificate has been revoked"));
        }
        if cert.expires_at.map(|exp| exp <= Utc::now()).unwrap_or(false) {
            return Ok(invalid("This certificate has expired"));
        }

        let learner = tx
            .find_learner(cert.user_id)
            .await?
            .ok_or(AppError::NotFound("learner"))?;
        let course = tx
            .find_course(cert.course_id)
            .await?
            .ok_or(AppError::NotFound("course"))?;

        Ok(Verification {
            valid: true,
            message: None,
            certificate_number: Some(cert.certificate_number),
            issued_to: Some(learner.display_name()),
            course_title: Some(course.title),
            issued_at: Some(cert.issued_at),
            expires_at: cert.expires_at,
        })
    }

    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn revoke(&self, caller: &Caller, id: Uuid) -> AppResult<Certificate> {
        caller.require(ADMINS)?;
        let mut tx = self.store.begin().await?;
        let cert = tx
            .revoke_certificate(id)
            .await?
            .ok_or(AppError::NotFound("certificate"))?;
        tx.commit().await?;
        info!(certificate_number = %cert.certificate_number, "certificate revoked");
        Ok(cert)
    }
}

fn invalid(message: &str) -> Verification {
    Verification {
        valid: false,
        message: Some(message.to_string()),
        ..Verification::default()
    }
}
