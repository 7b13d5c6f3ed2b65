use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequest, FromRequestParts, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    auth::Caller,
    certificates::CertificateService,
    config::Config,
    engine::ProgressEngine,
    error::{AppError, AppResult},
    models::*,
    store::Store,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: ProgressEngine,
    pub certificates: CertificateService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self {
            engine: ProgressEngine::new(store.clone(), &config.certificate_prefix),
            certificates: CertificateService::new(store, &config.certificate_prefix),
            config,
        }
    }
}

/// `Json` body whose rejections render through [`AppError`].
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct JsonBody<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(AppError))]
struct QueryParams<T>(T);

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // enrollments + progress
        .route("/api/v1/enrollments", post(enroll))
        .route("/api/v1/enrollments/my-courses", get(my_enrollments))
        .route("/api/v1/enrollments/:enrollment_id", get(get_enrollment))
        .route(
            "/api/v1/enrollments/:enrollment_id/progress",
            post(record_progress).get(list_progress),
        )
        .route(
            "/api/v1/enrollments/:enrollment_id/content/:content_item_id/complete",
            post(mark_complete),
        )
        .route("/api/v1/progress/courses/:course_id", get(course_progress))
        .route("/api/v1/progress/overall", get(overall_progress))
        // certificates
        .route("/api/v1/certificates", get(list_certificates))
        .route("/api/v1/certificates/generate", post(generate_certificate))
        .route("/api/v1/certificates/bulk-generate", post(bulk_generate))
        .route("/api/v1/certificates/my-certificates", get(my_certificates))
        .route("/api/v1/certificates/by-course/:course_id", get(course_certificates))
        .route("/api/v1/certificates/:certificate_id", get(get_certificate))
        .route("/api/v1/certificates/:certificate_id/verify", get(verify_certificate))
        .route("/api/v1/certificates/:certificate_id/revoke", post(revoke_certificate))
        .with_state(state)
}

async fn enroll(
    State(st): State<AppState>,
    caller: Caller,
    JsonBody(req): JsonBody<EnrollReq>,
) -> AppResult<(StatusCode, Json<Enrollment>)> {
    let enrollment = st.engine.enroll(caller.user_id, req.course_id).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn my_enrollments(State(st): State<AppState>, caller: Caller) -> AppResult<Json<Vec<Enrollment>>> {
    Ok(Json(st.engine.my_enrollments(caller.user_id).await?))
}

async fn get_enrollment(
    State(st): State<AppState>,
    caller: Caller,
    Path(enrollment_id): Path<Uuid>,
) -> AppResult<Json<Enrollment>> {
    Ok(Json(st.engine.get_enrollment(caller.user_id, enrollment_id).await?))
}

async fn record_progress(
    State(st): State<AppState>,
    caller: Caller,
    Path(enrollment_id): Path<Uuid>,
    JsonBody(req): JsonBody<ProgressReq>,
) -> AppResult<Json<ProgressOutcome>> {
    Ok(Json(st.engine.record_progress(caller.user_id, enrollment_id, req).await?))
}

async fn list_progress(
    State(st): State<AppState>,
    caller: Caller,
    Path(enrollment_id): Path<Uuid>,
) -> AppResult<Json<Vec<ContentProgress>>> {
    Ok(Json(st.engine.list_progress(caller.user_id, enrollment_id).await?))
}

async fn mark_complete(
    State(st): State<AppState>,
    caller: Caller,
    Path((enrollment_id, content_item_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<CompletionSummary>> {
    let summary = st
        .engine
        .mark_complete(caller.user_id, enrollment_id, content_item_id)
        .await?;
    Ok(Json(summary))
}

async fn course_progress(
    State(st): State<AppState>,
    caller: Caller,
    Path(course_id): Path<Uuid>,
) -> AppResult<Json<CourseProgress>> {
    Ok(Json(st.engine.course_progress(caller.user_id, course_id).await?))
}

async fn overall_progress(State(st): State<AppState>, caller: Caller) -> AppResult<Json<OverallProgress>> {
    Ok(Json(st.engine.overall_progress(caller.user_id).await?))
}

// --- certificates ---

async fn generate_certificate(
    State(st): State<AppState>,
    caller: Caller,
    JsonBody(req): JsonBody<GenerateCertificateReq>,
) -> AppResult<(StatusCode, Json<Certificate>)> {
    let (cert, created) = st.certificates.generate(&caller, req.enrollment_id).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(cert)))
}

async fn bulk_generate(
    State(st): State<AppState>,
    caller: Caller,
    QueryParams(q): QueryParams<BulkGenerateQuery>,
) -> AppResult<(StatusCode, Json<BulkGenerateResult>)> {
    let result = st.certificates.bulk_generate(&caller, q.course_id).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn list_certificates(
    State(st): State<AppState>,
    caller: Caller,
    QueryParams(q): QueryParams<CertificateQuery>,
) -> AppResult<Json<Vec<Certificate>>> {
    Ok(Json(st.certificates.list(&caller, q).await?))
}

async fn my_certificates(State(st): State<AppState>, caller: Caller) -> AppResult<Json<Vec<Certificate>>> {
    Ok(Json(st.certificates.mine(&caller).await?))
}

async fn course_certificates(
    State(st): State<AppState>,
    caller: Caller,
    Path(course_id): Path<Uuid>,
) -> AppResult<Json<Vec<Certificate>>> {
    Ok(Json(st.certificates.by_course(&caller, course_id).await?))
}

async fn get_certificate(
    State(st): State<AppState>,
    caller: Caller,
    Path(certificate_id): Path<Uuid>,
) -> AppResult<Json<Certificate>> {
    Ok(Json(st.certificates.get(&caller, certificate_id).await?))
}

// public: no Caller
async fn verify_certificate(
    State(st): State<AppState>,
    Path(certificate_id): Path<Uuid>,
    QueryParams(q): QueryParams<VerifyQuery>,
) -> AppResult<Json<Verification>> {
    Ok(Json(st.certificates.verify(certificate_id, &q.verification_code).await?))
}

async fn revoke_certificate(
    State(st): State<AppState>,
    caller: Caller,
    Path(certificate_id): Path<Uuid>,
) -> AppResult<Json<Certificate>> {
    Ok(Json(st.certificates.revoke(&caller, certificate_id).await?))
}
