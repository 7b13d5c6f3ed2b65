use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{CertificateFilter, Store, StoreTx};
use crate::{
    error::{AppError, AppResult},
    models::{
        Certificate, ContentItem, ContentProgress, ContentType, Course, Enrollment,
        EnrollmentStatus, Learner, Module, Role,
    },
};

#[derive(Debug, Clone, Default)]
struct State {
    learners: HashMap<Uuid, Learner>,
    courses: HashMap<Uuid, Course>,
    modules: HashMap<Uuid, Module>,
    items: HashMap<Uuid, ContentItem>,
    enrollments: HashMap<Uuid, Enrollment>,
    progress: HashMap<(Uuid, Uuid), ContentProgress>,
    certificates: HashMap<Uuid, Certificate>,
}

impl State {
    fn course_of_item(&self, item_id: Uuid) -> Option<Uuid> {
        let item = self.items.get(&item_id)?;
        self.modules.get(&item.module_id).map(|m| m.course_id)
    }
}

/// Process-local store. Transactions run one at a time behind a single
/// async mutex and stage their writes on a copy of the state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_learner(&self, username: &str, role: Role) -> Uuid {
        let learner = Learner {
            id: Uuid::new_v4(),
            username: username.to_string(),
            first_name: None,
            last_name: None,
            role,
        };
        let id = learner.id;
        self.state.lock().await.learners.insert(id, learner);
        id
    }

    pub async fn set_learner_name(&self, id: Uuid, first: &str, last: &str) {
        if let Some(l) = self.state.lock().await.learners.get_mut(&id) {
            l.first_name = Some(first.to_string());
            l.last_name = Some(last.to_string());
        }
    }

    pub async fn add_course(&self, title: &str) -> Uuid {
        let course = Course {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        let id = course.id;
        self.state.lock().await.courses.insert(id, course);
        id
    }

    pub async fn add_module(&self, course_id: Uuid, is_locked: bool) -> Uuid {
        let mut state = self.state.lock().await;
        let order_index = state.modules.values().filter(|m| m.course_id == course_id).count() as i32;
        let module = Module {
            id: Uuid::new_v4(),
            course_id,
            title: format!("Module {}", order_index + 1),
            order_index,
            is_locked,
        };
        let id = module.id;
        state.modules.insert(id, module);
        id
    }

    pub async fn add_items(&self, module_id: Uuid, count: usize) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let base = state.items.values().filter(|i| i.module_id == module_id).count() as i32;
        (0..count as i32)
            .map(|n| {
                let item = ContentItem {
                    id: Uuid::new_v4(),
                    module_id,
                    title: format!("Item {}", base + n + 1),
                    content_type: ContentType::Video,
                    order_index: base + n,
                    is_mandatory: false,
                };
                let id = item.id;
                state.items.insert(id, item);
                id
            })
            .collect()
    }

    /// A course with one unlocked module holding `items` content items.
    pub async fn seed_course(&self, title: &str, items: usize) -> (Uuid, Vec<Uuid>) {
        let course_id = self.add_course(title).await;
        let module_id = self.add_module(course_id, false).await;
        let item_ids = self.add_items(module_id, items).await;
        (course_id, item_ids)
    }

    pub async fn certificate_count(&self, enrollment_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .certificates
            .values()
            .filter(|c| c.enrollment_id == enrollment_id)
            .count()
    }

    pub async fn progress_rows(&self, enrollment_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .progress
            .keys()
            .filter(|(e, _)| *e == enrollment_id)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_learner(&mut self, id: Uuid) -> AppResult<Option<Learner>> {
        Ok(self.staged.learners.get(&id).cloned())
    }

    async fn find_course(&mut self, id: Uuid) -> AppResult<Option<Course>> {
        Ok(self.staged.courses.get(&id).cloned())
    }

    async fn find_course_item(&mut self, course_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentItem>> {
        if self.staged.course_of_item(item_id) != Some(course_id) {
            return Ok(None);
        }
        Ok(self.staged.items.get(&item_id).cloned())
    }

    async fn count_course_items(&mut self, course_id: Uuid) -> AppResult<i64> {
        let s = &self.staged;
        Ok(s.items.keys().filter(|id| s.course_of_item(**id) == Some(course_id)).count() as i64)
    }

    async fn find_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>> {
        Ok(self.staged.enrollments.get(&id).cloned())
    }

    async fn find_enrollment_for(&mut self, user_id: Uuid, course_id: Uuid) -> AppResult<Option<Enrollment>> {
        Ok(self
            .staged
            .enrollments
            .values()
            .find(|e| e.user_id == user_id && e.course_id == course_id)
            .cloned())
    }

    async fn lock_enrollment(&mut self, id: Uuid) -> AppResult<Option<Enrollment>> {
        // the whole store is already held by this transaction
        self.find_enrollment(id).await
    }

    async fn list_enrollments(&mut self, user_id: Uuid) -> AppResult<Vec<Enrollment>> {
        let mut rows: Vec<Enrollment> = self
            .staged
            .enrollments
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        Ok(rows)
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> AppResult<()> {
        let duplicate = self
            .staged
            .enrollments
            .values()
            .any(|e| e.user_id == enrollment.user_id && e.course_id == enrollment.course_id);
        if duplicate {
            return Err(AppError::Conflict("already enrolled in this course".into()));
        }
        self.staged.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn update_enrollment(&mut self, enrollment: &Enrollment) -> AppResult<()> {
        self.staged.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn lock_uncertified_completions(&mut self, course_id: Uuid) -> AppResult<Vec<Enrollment>> {
        let mut rows: Vec<Enrollment> = self
            .staged
            .enrollments
            .values()
            .filter(|e| {
                e.course_id == course_id
                    && e.status == EnrollmentStatus::Completed
                    && !e.certificate_issued
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(rows)
    }

    async fn find_progress(&mut self, enrollment_id: Uuid, item_id: Uuid) -> AppResult<Option<ContentProgress>> {
        Ok(self.staged.progress.get(&(enrollment_id, item_id)).cloned())
    }

    async fn list_progress(&mut self, enrollment_id: Uuid) -> AppResult<Vec<ContentProgress>> {
        let mut rows: Vec<ContentProgress> = self
            .staged
            .progress
            .values()
            .filter(|p| p.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(rows)
    }

    async fn save_progress(&mut self, progress: &ContentProgress) -> AppResult<()> {
        let key = (progress.enrollment_id, progress.content_item_id);
        let mut row = progress.clone();
        if let Some(existing) = self.staged.progress.get(&key) {
            row.id = existing.id;
            row.started_at = existing.started_at;
        }
        self.staged.progress.insert(key, row);
        Ok(())
    }

    async fn count_completed_items(&mut self, enrollment_id: Uuid, course_id: Uuid) -> AppResult<i64> {
        let s = &self.staged;
        Ok(s
            .progress
            .values()
            .filter(|p| {
                p.enrollment_id == enrollment_id
                    && p.is_completed
                    && s.course_of_item(p.content_item_id) == Some(course_id)
            })
            .count() as i64)
    }

    async fn sum_time_spent(&mut self, user_id: Uuid) -> AppResult<i64> {
        let s = &self.staged;
        Ok(s
            .progress
            .values()
            .filter(|p| {
                s.enrollments
                    .get(&p.enrollment_id)
                    .map(|e| e.user_id == user_id)
                    .unwrap_or(false)
            })
            .map(|p| i64::from(p.time_spent_seconds))
            .sum())
    }

    async fn find_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>> {
        Ok(self.staged.certificates.get(&id).cloned())
    }

    async fn find_live_certificate(&mut self, enrollment_id: Uuid) -> AppResult<Option<Certificate>> {
        Ok(self
            .staged
            .certificates
            .values()
            .find(|c| c.enrollment_id == enrollment_id && !c.is_revoked)
            .cloned())
    }

    async fn insert_certificate(&mut self, certificate: &Certificate) -> AppResult<bool> {
        let taken = self.staged.certificates.values().any(|c| {
            c.certificate_number == certificate.certificate_number
                || c.verification_code == certificate.verification_code
        });
        if taken {
            return Ok(false);
        }
        let live = self
            .staged
            .certificates
            .values()
            .any(|c| c.enrollment_id == certificate.enrollment_id && !c.is_revoked);
        if live && !certificate.is_revoked {
            return Err(AppError::Invariant(format!(
                "second live certificate for enrollment {}",
                certificate.enrollment_id
            )));
        }
        self.staged.certificates.insert(certificate.id, certificate.clone());
        Ok(true)
    }

    async fn list_certificates(&mut self, f: &CertificateFilter) -> AppResult<Vec<Certificate>> {
        let mut rows: Vec<Certificate> = self
            .staged
            .certificates
            .values()
            .filter(|c| f.user_id.map_or(true, |u| c.user_id == u))
            .filter(|c| f.course_id.map_or(true, |id| c.course_id == id))
            .filter(|c| f.include_revoked || !c.is_revoked)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(rows
            .into_iter()
            .skip(f.offset as usize)
            .take(f.limit as usize)
            .collect())
    }

    async fn revoke_certificate(&mut self, id: Uuid) -> AppResult<Option<Certificate>> {
        Ok(self.staged.certificates.get_mut(&id).map(|c| {
            c.is_revoked = true;
            c.clone()
        }))
    }

    async fn commit(&mut self) -> AppResult<()> {
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
