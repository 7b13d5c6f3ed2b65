//! Pure progress rules: course percentage, enrollment status transitions,
//! and merging a progress write into a content-progress row.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ContentProgress, Enrollment, EnrollmentStatus, ProgressReq},
};

const FULL_BASIS_POINTS: i64 = 10_000;

/// Completion percentage of a course, two decimals, half-up.
///
/// An empty course is always 0%. A partial completion set never reports
/// 100% and a non-empty one never reports 0%, whatever the rounding.
pub fn completion_percentage(completed: i64, total: i64) -> AppResult<BigDecimal> {
    if completed < 0 || total < 0 || completed > total {
        return Err(AppError::Invariant(format!(
            "{} completed items out of {}",
            completed, total
        )));
    }
    if total == 0 {
        return Ok(basis_points(0));
    }

    let mut bp = (completed * FULL_BASIS_POINTS * 2 + total) / (total * 2);
    if completed < total {
        bp = bp.min(FULL_BASIS_POINTS - 1);
    }
    if completed > 0 {
        bp = bp.max(1);
    }
    Ok(basis_points(bp))
}

fn basis_points(bp: i64) -> BigDecimal {
    (BigDecimal::from(bp) / BigDecimal::from(100)).with_scale(2)
}

pub fn is_full(pct: &BigDecimal) -> bool {
    *pct >= BigDecimal::from(100)
}

/// Result of applying a fresh percentage to an enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub enrollment: Enrollment,
    /// `completed_at` was set by this step, not before.
    pub newly_completed: bool,
}

impl Transition {
    /// Whether this step is the one that owes the learner a certificate.
    pub fn should_issue_certificate(&self) -> bool {
        self.newly_completed && !self.enrollment.certificate_issued
    }
}

/// Moves an enrollment forward given its recomputed percentage.
///
/// Status only moves forward (`enrolled -> in_progress -> completed`);
/// `dropped` is left alone. `started_at` and `completed_at` are set once.
pub fn transition(current: &Enrollment, pct: BigDecimal, now: DateTime<Utc>) -> Transition {
    let mut next = current.clone();
    next.last_accessed_at = Some(now);
    let positive = pct > BigDecimal::from(0);
    let full = is_full(&pct);
    next.progress_percentage = pct;

    let mut newly_completed = false;
    match current.status {
        EnrollmentStatus::Dropped | EnrollmentStatus::Completed => {}
        EnrollmentStatus::Enrolled | EnrollmentStatus::InProgress => {
            if full {
                next.status = EnrollmentStatus::Completed;
                next.started_at.get_or_insert(now);
                if next.completed_at.is_none() {
                    next.completed_at = Some(now);
                    newly_completed = true;
                }
            } else if positive {
                next.status = EnrollmentStatus::InProgress;
                next.started_at.get_or_insert(now);
            }
        }
    }

    Transition {
        enrollment: next,
        newly_completed,
    }
}

/// A validated progress write for one content item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressPatch {
    pub is_completed: Option<bool>,
    pub progress_percentage: Option<BigDecimal>,
    pub time_spent_seconds: Option<i32>,
    pub last_position: Option<i32>,
}

impl ProgressPatch {
    pub fn complete() -> Self {
        Self {
            is_completed: Some(true),
            ..Self::default()
        }
    }

    pub fn from_req(req: &ProgressReq) -> AppResult<Self> {
        if let Some(pct) = &req.progress_percentage {
            if *pct < BigDecimal::from(0) || *pct > BigDecimal::from(100) {
                return Err(AppError::Validation(
                    "progress_percentage must be between 0 and 100".into(),
                ));
            }
        }
        if matches!(req.time_spent_seconds, Some(t) if t < 0) {
            return Err(AppError::Validation("time_spent_seconds must not be negative".into()));
        }
        if matches!(req.last_position, Some(p) if p < 0) {
            return Err(AppError::Validation("last_position must not be negative".into()));
        }
        Ok(Self {
            is_completed: req.is_completed,
            progress_percentage: req.progress_percentage.clone().map(|p| p.with_scale(2)),
            time_spent_seconds: req.time_spent_seconds,
            last_position: req.last_position,
        })
    }

    /// Merges this patch into `current` (or a fresh row) and returns the row
    /// to persist. `current` is never modified.
    pub fn merge(
        &self,
        current: Option<&ContentProgress>,
        enrollment_id: Uuid,
        content_item_id: Uuid,
        now: DateTime<Utc>,
    ) -> ContentProgress {
        let mut row = match current {
            Some(existing) => existing.clone(),
            None => ContentProgress {
                id: Uuid::new_v4(),
                enrollment_id,
                content_item_id,
                is_completed: false,
                progress_percentage: basis_points(0),
                time_spent_seconds: 0,
                last_position: None,
                started_at: now,
                completed_at: None,
                updated_at: now,
            },
        };

        if let Some(pct) = &self.progress_percentage {
            row.progress_percentage = pct.clone();
        }
        if let Some(seconds) = self.time_spent_seconds {
            row.time_spent_seconds = seconds;
        }
        if let Some(position) = self.last_position {
            row.last_position = Some(position);
        }
        match self.is_completed {
            Some(true) => {
                row.is_completed = true;
                row.progress_percentage = basis_points(FULL_BASIS_POINTS);
                row.completed_at.get_or_insert(now);
            }
            Some(false) => {
                row.is_completed = false;
                row.completed_at = None;
            }
            None => {}
        }
        row.updated_at = now;
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn enrollment() -> Enrollment {
        Enrollment::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn empty_course_is_zero() {
        assert_eq!(completion_percentage(0, 0).unwrap(), dec("0"));
    }

    #[test]
    fn percentage_rounds_to_hundredths() {
        assert_eq!(completion_percentage(1, 3).unwrap(), dec("33.33"));
        assert_eq!(completion_percentage(2, 3).unwrap(), dec("66.67"));
        assert_eq!(completion_percentage(1, 8).unwrap(), dec("12.5"));
        assert_eq!(completion_percentage(4, 4).unwrap(), dec("100"));
    }

    #[test]
    fn thresholds_are_never_crossed_by_rounding() {
        assert_eq!(completion_percentage(29_999, 30_000).unwrap(), dec("99.99"));
        assert_eq!(completion_percentage(1, 30_000).unwrap(), dec("0.01"));
    }

    #[test]
    fn more_completions_than_items_is_an_invariant_error() {
        assert!(matches!(
            completion_percentage(5, 4),
            Err(AppError::Invariant(_))
        ));
    }

    #[test]
    fn first_progress_starts_the_enrollment() {
        let now = Utc::now();
        let t = transition(&enrollment(), dec("25"), now);
        assert_eq!(t.enrollment.status, EnrollmentStatus::InProgress);
        assert_eq!(t.enrollment.started_at, Some(now));
        assert_eq!(t.enrollment.last_accessed_at, Some(now));
        assert!(!t.newly_completed);
    }

    #[test]
    fn zero_progress_keeps_enrolled_but_touches_access_time() {
        let now = Utc::now();
        let t = transition(&enrollment(), dec("0"), now);
        assert_eq!(t.enrollment.status, EnrollmentStatus::Enrolled);
        assert_eq!(t.enrollment.started_at, None);
        assert_eq!(t.enrollment.last_accessed_at, Some(now));
    }

    #[test]
    fn completion_is_recorded_once() {
        let start = Utc::now();
        let first = transition(&enrollment(), dec("100"), start);
        assert!(first.newly_completed);
        assert!(first.should_issue_certificate());
        assert_eq!(first.enrollment.completed_at, Some(start));

        let later = start + chrono::Duration::seconds(30);
        let again = transition(&first.enrollment, dec("100"), later);
        assert!(!again.newly_completed);
        assert_eq!(again.enrollment.completed_at, Some(start));
        assert_eq!(again.enrollment.last_accessed_at, Some(later));
    }

    #[test]
    fn completed_enrollment_never_moves_back() {
        let done = transition(&enrollment(), dec("100"), Utc::now()).enrollment;
        let t = transition(&done, dec("75"), Utc::now());
        assert_eq!(t.enrollment.status, EnrollmentStatus::Completed);
        assert!(t.enrollment.completed_at.is_some());
        assert_eq!(t.enrollment.progress_percentage, dec("75"));
    }

    #[test]
    fn dropped_enrollment_keeps_its_status() {
        let mut e = enrollment();
        e.status = EnrollmentStatus::Dropped;
        let t = transition(&e, dec("100"), Utc::now());
        assert_eq!(t.enrollment.status, EnrollmentStatus::Dropped);
        assert!(t.enrollment.completed_at.is_none());
        assert!(!t.should_issue_certificate());
    }

    #[test]
    fn issued_flag_blocks_a_second_certificate() {
        let mut e = enrollment();
        e.certificate_issued = true;
        let t = transition(&e, dec("100"), Utc::now());
        assert!(t.newly_completed);
        assert!(!t.should_issue_certificate());
    }

    #[test]
    fn partial_patch_does_not_complete() {
        let patch = ProgressPatch::from_req(&ProgressReq {
            progress_percentage: Some(dec("40")),
            time_spent_seconds: Some(120),
            last_position: Some(95),
            ..ProgressReq::default()
        })
        .unwrap();
        let row = patch.merge(None, Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        assert!(!row.is_completed);
        assert_eq!(row.progress_percentage, dec("40"));
        assert_eq!(row.time_spent_seconds, 120);
        assert_eq!(row.last_position, Some(95));
        assert!(row.completed_at.is_none());
    }

    #[test]
    fn merge_updates_in_place_and_keeps_identity() {
        let (enrollment_id, item_id) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();
        let first = ProgressPatch {
            time_spent_seconds: Some(30),
            ..ProgressPatch::default()
        }
        .merge(None, enrollment_id, item_id, t0);

        let t1 = t0 + chrono::Duration::seconds(10);
        let done = ProgressPatch::complete().merge(Some(&first), enrollment_id, item_id, t1);
        assert_eq!(done.id, first.id);
        assert_eq!(done.started_at, t0);
        assert_eq!(done.time_spent_seconds, 30);
        assert!(done.is_completed);
        assert_eq!(done.progress_percentage, dec("100"));
        assert_eq!(done.completed_at, Some(t1));

        let t2 = t1 + chrono::Duration::seconds(10);
        let again = ProgressPatch::complete().merge(Some(&done), enrollment_id, item_id, t2);
        assert_eq!(again.completed_at, Some(t1));
    }

    #[test]
    fn uncompleting_clears_the_timestamp() {
        let (enrollment_id, item_id) = (Uuid::new_v4(), Uuid::new_v4());
        let done = ProgressPatch::complete().merge(None, enrollment_id, item_id, Utc::now());
        let undone = ProgressPatch {
            is_completed: Some(false),
            ..ProgressPatch::default()
        }
        .merge(Some(&done), enrollment_id, item_id, Utc::now());
        assert!(!undone.is_completed);
        assert!(undone.completed_at.is_none());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let item = Uuid::new_v4();
        for req in [
            ProgressReq { content_item_id: item, progress_percentage: Some(dec("100.5")), ..Default::default() },
            ProgressReq { content_item_id: item, progress_percentage: Some(dec("-1")), ..Default::default() },
            ProgressReq { content_item_id: item, time_spent_seconds: Some(-5), ..Default::default() },
            ProgressReq { content_item_id: item, last_position: Some(-1), ..Default::default() },
        ] {
            assert!(matches!(ProgressPatch::from_req(&req), Err(AppError::Validation(_))));
        }
    }
}
