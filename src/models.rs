use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Instructor,
    Learner,
    Manager,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    InProgress,
    Completed,
    Dropped,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "content_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Video,
    Document,
    Quiz,
    Assignment,
    Link,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Learner {
    pub id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
}

impl Learner {
    /// Name printed on certificates: full name when known, else the username.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            _ => self.username.clone(),
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Module {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub order_index: i32,
    pub is_locked: bool,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ContentItem {
    pub id: Uuid,
    pub module_id: Uuid,
    pub title: String,
    pub content_type: ContentType,
    pub order_index: i32,
    pub is_mandatory: bool,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: EnrollmentStatus,
    pub progress_percentage: BigDecimal,
    pub enrolled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub certificate_issued: bool,
}

impl Enrollment {
    pub fn new(user_id: Uuid, course_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            status: EnrollmentStatus::Enrolled,
            progress_percentage: BigDecimal::from(0),
            enrolled_at: now,
            started_at: None,
            completed_at: None,
            last_accessed_at: None,
            certificate_issued: false,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContentProgress {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub content_item_id: Uuid,
    pub is_completed: bool,
    pub progress_percentage: BigDecimal,
    pub time_spent_seconds: i32,
    pub last_position: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub enrollment_id: Uuid,
    pub certificate_number: String,
    pub verification_code: String,
    pub title: String,
    pub description: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_revoked: bool,
}

// --- request bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProgressReq {
    pub content_item_id: Uuid,
    pub is_completed: Option<bool>,
    pub progress_percentage: Option<BigDecimal>,
    pub time_spent_seconds: Option<i32>,
    pub last_position: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenerateCertificateReq {
    pub enrollment_id: Uuid,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BulkGenerateQuery {
    pub course_id: Uuid,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CertificateQuery {
    pub course_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct VerifyQuery {
    pub verification_code: String,
}

// --- response bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollmentSnapshot {
    pub id: Uuid,
    pub progress_percentage: BigDecimal,
    pub status: EnrollmentStatus,
}

impl From<&Enrollment> for EnrollmentSnapshot {
    fn from(e: &Enrollment) -> Self {
        Self {
            id: e.id,
            progress_percentage: e.progress_percentage.clone(),
            status: e.status,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressOutcome {
    pub progress: ContentProgress,
    pub enrollment: EnrollmentSnapshot,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompletionSummary {
    pub content_item_id: Uuid,
    pub enrollment_progress: BigDecimal,
    pub enrollment_status: EnrollmentStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CourseProgress {
    pub course_id: Uuid,
    pub enrollment_id: Uuid,
    pub status: EnrollmentStatus,
    pub progress_percentage: BigDecimal,
    pub completed_items: i64,
    pub total_items: i64,
    pub time_spent_seconds: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OverallProgress {
    pub total_courses_enrolled: i64,
    pub courses_completed: i64,
    pub courses_in_progress: i64,
    pub total_time_spent_seconds: i64,
    pub average_progress: BigDecimal,
    pub certificates_earned: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BulkGenerateResult {
    pub message: String,
    pub course_id: Uuid,
    pub certificates_created: usize,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Verification {
    pub valid: bool,
    pub message: Option<String>,
    pub certificate_number: Option<String>,
    pub issued_to: Option<String>,
    pub course_title: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}
