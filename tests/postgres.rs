//! Engine runs against a real Postgres, where concurrent writers contend on
//! the enrollment row lock and the certificate unique indexes.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test --test postgres -- --ignored`

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::Utc;
use coursework_progress::{
    certificates::codes,
    engine::ProgressEngine,
    models::{Course, EnrollmentStatus},
    store::{PgStore, Store, StoreTx},
};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_learner(pool: &PgPool, username: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, username, role) VALUES ($1, $2, 'learner')")
        .bind(id)
        .bind(username)
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn seed_course(pool: &PgPool, title: &str, items: usize) -> (Uuid, Vec<Uuid>) {
    let course_id = Uuid::new_v4();
    sqlx::query("INSERT INTO courses (id, title) VALUES ($1, $2)")
        .bind(course_id)
        .bind(title)
        .execute(pool)
        .await
        .unwrap();
    let module_id = Uuid::new_v4();
    sqlx::query("INSERT INTO modules (id, course_id, title, order_index) VALUES ($1, $2, 'Module 1', 0)")
        .bind(module_id)
        .bind(course_id)
        .execute(pool)
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(items);
    for n in 0..items {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO content_items (id, module_id, title, content_type, order_index) \
             VALUES ($1, $2, $3, 'video', $4)",
        )
        .bind(id)
        .bind(module_id)
        .bind(format!("Item {}", n + 1))
        .bind(n as i32)
        .execute(pool)
        .await
        .unwrap();
        ids.push(id);
    }
    (course_id, ids)
}

async fn count(pool: &PgPool, sql: &str, enrollment_id: Uuid) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .bind(enrollment_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL and a local Postgres"]
async fn concurrent_completions_issue_one_certificate(pool: PgPool) {
    let engine = ProgressEngine::new(Arc::new(PgStore::new(pool.clone())), "CERT");
    let learner = seed_learner(&pool, "ada").await;
    let (course, items) = seed_course(&pool, "Race", 2).await;
    let enrollment = engine.enroll(learner, course).await.unwrap();

    // every item completed twice, all at once
    let tasks: Vec<_> = items
        .iter()
        .chain(items.iter())
        .map(|item| {
            let engine = engine.clone();
            let (id, item) = (enrollment.id, *item);
            tokio::spawn(async move { engine.mark_complete(learner, id, item).await })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    let certificates = count(
        &pool,
        "SELECT COUNT(*) FROM certificates WHERE enrollment_id = $1",
        enrollment.id,
    )
    .await;
    assert_eq!(certificates, 1);

    let rows = count(
        &pool,
        "SELECT COUNT(*) FROM content_progress WHERE enrollment_id = $1",
        enrollment.id,
    )
    .await;
    assert_eq!(rows, items.len() as i64);

    let done = engine.get_enrollment(learner, enrollment.id).await.unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.progress_percentage, BigDecimal::from(100));
    assert!(done.certificate_issued);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL and a local Postgres"]
async fn second_live_certificate_is_refused(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let engine = ProgressEngine::new(Arc::new(store.clone()), "CERT");
    let learner = seed_learner(&pool, "ada").await;
    let (course_id, items) = seed_course(&pool, "Once", 1).await;
    let enrollment = engine.enroll(learner, course_id).await.unwrap();
    engine.mark_complete(learner, enrollment.id, items[0]).await.unwrap();

    let course = Course {
        id: course_id,
        title: "Once".into(),
        created_at: Utc::now(),
    };
    let extra = codes::draft(&enrollment, &course, "CERT", Utc::now());
    let mut tx = store.begin().await.unwrap();
    assert!(!tx.insert_certificate(&extra).await.unwrap());
    tx.commit().await.unwrap();

    let certificates = count(
        &pool,
        "SELECT COUNT(*) FROM certificates WHERE enrollment_id = $1",
        enrollment.id,
    )
    .await;
    assert_eq!(certificates, 1);
}
