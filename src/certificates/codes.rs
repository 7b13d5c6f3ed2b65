use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::models::{Certificate, Course, Enrollment};

const NUMBER_SUFFIX_BYTES: usize = 6;
const VERIFICATION_CODE_BYTES: usize = 8;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode_upper(bytes)
}

/// `PREFIX-YYYYMMDD-XXXXXXXXXXXX`
pub fn certificate_number(prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        now.format("%Y%m%d"),
        random_hex(NUMBER_SUFFIX_BYTES)
    )
}

/// Independent of the certificate number.
pub fn verification_code() -> String {
    random_hex(VERIFICATION_CODE_BYTES)
}

pub fn title(course: &Course) -> String {
    format!("Certificate of Completion — {}", course.title)
}

pub fn description(course: &Course) -> String {
    format!(
        "This certifies that the holder has successfully completed {}",
        course.title
    )
}

/// A fresh, unsaved certificate for a completed enrollment.
pub fn draft(enrollment: &Enrollment, course: &Course, prefix: &str, now: DateTime<Utc>) -> Certificate {
    Certificate {
        id: Uuid::new_v4(),
        user_id: enrollment.user_id,
        course_id: enrollment.course_id,
        enrollment_id: enrollment.id,
        certificate_number: certificate_number(prefix, now),
        verification_code: verification_code(),
        title: title(course),
        description: Some(description(course)),
        issued_at: now,
        expires_at: None,
        is_revoked: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn number_carries_prefix_and_date() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        let n = certificate_number("CERT", at);
        let parts: Vec<&str> = n.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "CERT");
        assert_eq!(parts[1], "20240307");
        assert_eq!(parts[2].len(), NUMBER_SUFFIX_BYTES * 2);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn verification_code_is_uppercase_hex() {
        let code = verification_code();
        assert_eq!(code.len(), VERIFICATION_CODE_BYTES * 2);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn identifiers_do_not_collide() {
        let now = Utc::now();
        let mut numbers = HashSet::new();
        let mut codes = HashSet::new();
        for _ in 0..5_000 {
            assert!(numbers.insert(certificate_number("CERT", now)));
            assert!(codes.insert(verification_code()));
        }
    }

    #[test]
    fn draft_uses_course_title() {
        let course = Course {
            id: Uuid::new_v4(),
            title: "Rust Basics".into(),
            created_at: Utc::now(),
        };
        let enrollment = Enrollment::new(Uuid::new_v4(), course.id, Utc::now());
        let cert = draft(&enrollment, &course, "EDU", Utc::now());
        assert_eq!(cert.title, "Certificate of Completion — Rust Basics");
        assert_eq!(cert.enrollment_id, enrollment.id);
        assert_eq!(cert.user_id, enrollment.user_id);
        assert!(cert.certificate_number.starts_with("EDU-"));
        assert!(!cert.is_revoked);
    }
}
