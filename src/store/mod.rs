//! Transactional storage behind the progress engine.
//!
//! Every engine operation runs inside one [`StoreTx`]. Writes become visible
//! only on [`StoreTx::commit`]; dropping a transaction discards them.
//! [`StoreTx::lock_enrollment`] holds the enrollment until the transaction
//! ends, which is what serializes concurrent progress writes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{Certificate, ContentItem, ContentProgress, Course, Enrollment, Learner},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const DEFAULT_PAGE: i64 = 100;
pub const MAX_PAGE: i64 = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CertificateFilter {
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub include_revoked: bool,
    pub offset: i64,
    pub limit: i64,
}

impl CertificateFilter {
    pub fn page(mut self, skip: Option<i64>, limit: Option<i64>) -> Self {
        self.offset = skip.unwrap_or(0).max(0);
        self.limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn find_learner(&mut self, id: Uuid) -> AppResult<Option<Learner>>;
    async fn find_course(&mut self, id: Uuid) -> AppResult<Option<Course>>;
    /// The content item, only if it belongs to a module of `course_id`.
    async fn find_course_item(&mut self, course_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentItem>>;
    async fn count_course_items(&mut self, course_id: Uuid) -> AppResult<i64>;

    async fn find_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>>;
    async fn find_enrollment_for(&mut self, user_id: Uuid, course_id: Uuid) -> AppResult<Option<Enrollment>>;
    /// Reads the enrollment and locks it for the rest of the transaction.
    async fn lock_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>>;
    async fn list_enrollments(&mut self, user_id: Uuid) -> AppResult<Vec<Enrollment>>;
    /// Fails with `Conflict` when the learner is already enrolled.
    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> AppResult<()>;
    async fn update_enrollment(&mut self, enrollment: &Enrollment) -> AppResult<()>;
    /// Completed enrollments of a course still flagged as uncertified, locked.
    async fn lock_uncertified_completions(&mut self, course_id: Uuid) -> AppResult<Vec<Enrollment>>;

    async fn find_progress(&mut self, enrollment_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentProgress>>;
    async fn list_progress(&mut self, enrollment_id: Uuid) -> AppResult<Vec<ContentProgress>>;
    /// Insert-or-update keyed on (enrollment, content item).
    async fn save_progress(&mut self, progress: &ContentProgress) -> AppResult<()>;
    /// Completed rows of the enrollment whose item belongs to `course_id`.
    async fn count_completed_items(&mut self, enrollment_id: Uuid, course_id: Uuid) -> AppResult<i64>;
    async fn sum_time_spent(&mut self, user_id: Uuid) -> AppResult<i64>;

    async fn find_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>>;
    async fn find_live_certificate(&mut self, enrollment_id: Uuid) -> AppResult<Option<Certificate>>;
    /// Returns false, writing nothing, when the number or verification code
    /// is already taken.
    async fn insert_certificate(&mut self, certificate: &Certificate) -> AppResult<bool>;
    async fn list_certificates(&mut self, filter: &CertificateFilter) -> AppResult<Vec<Certificate>>;
    async fn revoke_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>>;

    async fn commit(&mut self) -> AppResult<()>;
}
