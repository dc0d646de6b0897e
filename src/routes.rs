use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Form, FromRequest, Path, RequestParts};
use axum::handler::Handler;
use axum::headers::Cookie;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{async_trait, Extension, Json, Router, TypedHeader};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::err::{self, Error, Fine};
use crate::flash::{self, Flash, FlashKey};
use crate::models::{Session, SessionCounts, Student, StudentSummary};
use crate::programme::{self, Chapter};
use crate::sessions::{self, RemarkPolicy};
use crate::store::Store;
use crate::{directory, proceeds, Payload};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub flash: FlashKey,
    pub remarks: RemarkPolicy,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/ping", get(ping))
        .route("/students", get(students).post(create_student))
        .route("/archived_students", get(archived_students))
        .route("/archive_student/:student_id", post(archive_student))
        .route("/unarchive_student/:student_id", post(unarchive_student))
        .route("/delete_student/:student_id", post(delete_student))
        .route("/remarks/:student_id", get(remarks).post(add_remark))
        .route("/edit_remark/:student_id/:session_id", post(edit_remark))
        .route("/delete_remark/:student_id/:session_id", post(delete_remark))
        .route("/update_info/:student_id", post(update_info))
        .route("/save_selection/:student_id", post(save_selection))
        .route("/programme_maths/:student_id", get(programme_maths))
        .route("/save_programme_selections", post(save_programme_selections))
        .fallback(err::handler404.into_service())
        .layer(Extension(state))
}

type FlashCookie = Option<TypedHeader<Cookie>>;

/// Numeric path segments. A segment that does not parse is an unknown path, answered
/// like any other missing route.
pub struct Ids<T>(pub T);

#[async_trait]
impl<B, T> FromRequest<B> for Ids<T>
where
    B: Send,
    T: DeserializeOwned + Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request(req).await {
            Ok(Path(value)) => Ok(Ids(value)),
            Err(rejection) => {
                log::warn!("Rejected path {}: {}", req.uri(), rejection);
                Err(Error::not_found(format!("Invalid path: {}", req.uri())))
            }
        }
    }
}

/// A redirect that leaves a flash message for the next page.
pub struct FlashRedirect {
    to: String,
    cookie: Option<HeaderValue>,
}

impl IntoResponse for FlashRedirect {
    fn into_response(self) -> Response {
        let mut response = Redirect::to(&self.to).into_response();
        if let Some(cookie) = self.cookie {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        response
    }
}

/// A page view model, sent inside the success envelope.
pub struct Page<T> {
    view: T,
    consumed_flash: bool,
}

impl<T: Serialize> IntoResponse for Page<T> {
    fn into_response(self) -> Response {
        let mut response = Fine(self.view).into_response();
        if self.consumed_flash {
            response
                .headers_mut()
                .insert(SET_COOKIE, flash::clear_cookie());
        }
        response
    }
}

impl AppState {
    fn redirect(&self, to: impl Into<String>, flash: Flash) -> FlashRedirect {
        FlashRedirect {
            to: to.into(),
            cookie: self.flash.set_cookie(&flash),
        }
    }

    /// Turns the outcome of a form post into a redirect carrying a flash message.
    fn settle<T>(
        &self,
        outcome: err::Result<T>,
        success: impl FnOnce(T) -> (String, String),
        failure_to: impl Into<String>,
    ) -> FlashRedirect {
        match outcome {
            Ok(value) => {
                let (to, message) = success(value);
                self.redirect(to, Flash::success(message))
            }
            Err(err) => {
                let message = if err.is_recoverable() {
                    log::warn!("Rejected form submission: {}", err);
                    err.to_string()
                } else {
                    log::error!("Store failure while handling form: {}", err);
                    STORE_FAILURE.to_string()
                };
                self.redirect(failure_to, Flash::error(message))
            }
        }
    }

    fn page<T>(&self, view: impl FnOnce(Option<Flash>) -> T, cookie: &FlashCookie) -> Page<T> {
        let flash = self.flash.read(cookie.as_ref().map(|TypedHeader(c)| c));
        let consumed_flash = cookie
            .as_ref()
            .map_or(false, |TypedHeader(c)| c.get(flash::COOKIE_NAME).is_some());
        Page {
            view: view(flash),
            consumed_flash,
        }
    }
}

const STORE_FAILURE: &str = "The change could not be saved, please try again";

fn remarks_path(student_id: i64) -> String {
    format!("/remarks/{}", student_id)
}

async fn home() -> Redirect {
    Redirect::to("/students")
}

#[derive(Serialize)]
struct Message {
    message: String,
}

fn message<S: Into<String>>(message: S) -> Message {
    Message {
        message: message.into(),
    }
}

async fn ping(Extension(state): Extension<AppState>) -> Payload<Message> {
    state.store.ping().await.map_err(|err| {
        log::error!("Ping against {} store failed: {}", state.store.backend_tag(), err);
        err
    })?;
    proceeds(message("Database ping successful"))
}

#[derive(Serialize)]
struct StudentsView {
    flash: Option<Flash>,
    students: Vec<StudentSummary>,
}

async fn students(
    Extension(state): Extension<AppState>,
    cookie: FlashCookie,
) -> Result<Page<StudentsView>, Error> {
    let students = directory::list_active(state.store.as_ref()).await?;
    Ok(state.page(|flash| StudentsView { flash, students }, &cookie))
}

#[derive(Deserialize)]
struct NewStudent {
    #[serde(default)]
    name: String,
}

async fn create_student(
    Extension(state): Extension<AppState>,
    Form(form): Form<NewStudent>,
) -> FlashRedirect {
    let outcome = directory::create(state.store.as_ref(), &form.name).await;
    state.settle(
        outcome,
        |_| ("/students".into(), "Student added".into()),
        "/students",
    )
}

#[derive(Serialize)]
struct ArchivedView {
    flash: Option<Flash>,
    archived_students: Vec<Student>,
}

async fn archived_students(
    Extension(state): Extension<AppState>,
    cookie: FlashCookie,
) -> Result<Page<ArchivedView>, Error> {
    let archived_students = directory::list_archived(state.store.as_ref()).await?;
    Ok(state.page(
        |flash| ArchivedView {
            flash,
            archived_students,
        },
        &cookie,
    ))
}

async fn archive_student(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
) -> FlashRedirect {
    let outcome = directory::archive(state.store.as_ref(), student_id).await;
    state.settle(
        outcome,
        |student| {
            (
                remarks_path(student.id),
                format!("Student '{}' has been archived", student.name),
            )
        },
        "/students",
    )
}

async fn unarchive_student(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
) -> FlashRedirect {
    let outcome = directory::unarchive(state.store.as_ref(), student_id).await;
    state.settle(
        outcome,
        |student| {
            (
                "/archived_students".into(),
                format!("Student '{}' has been restored", student.name),
            )
        },
        "/archived_students",
    )
}

async fn delete_student(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
) -> FlashRedirect {
    let outcome = directory::delete(state.store.as_ref(), student_id).await;
    state.settle(
        outcome,
        |_| {
            (
                "/students".into(),
                "Student and related data permanently deleted".into(),
            )
        },
        "/students",
    )
}

#[derive(Serialize)]
struct RemarksView {
    flash: Option<Flash>,
    student: Student,
    sessions: Vec<Session>,
    selected_sessions: Vec<i64>,
    #[serde(flatten)]
    counts: SessionCounts,
}

async fn remarks(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
    cookie: FlashCookie,
) -> Result<Response, Error> {
    let student = match directory::get(state.store.as_ref(), student_id).await {
        Ok(student) => student,
        Err(err @ Error::NotFound { .. }) => {
            log::error!("Student {} not found", student_id);
            return Ok(state
                .redirect("/students", Flash::error(err.to_string()))
                .into_response());
        }
        Err(err) => return Err(err),
    };
    let sessions = sessions::list(state.store.as_ref(), student_id).await?;
    let counts = sessions::counts(&sessions);
    let selected_sessions: Vec<i64> = sessions
        .iter()
        .filter(|s| s.selected)
        .map(|s| s.id)
        .collect();
    Ok(state
        .page(
            |flash| RemarksView {
                flash,
                student,
                sessions,
                selected_sessions,
                counts,
            },
            &cookie,
        )
        .into_response())
}

#[derive(Deserialize)]
struct RemarkForm {
    #[serde(default)]
    remark: String,
}

async fn add_remark(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
    Form(form): Form<RemarkForm>,
) -> FlashRedirect {
    let outcome =
        sessions::append(state.store.as_ref(), state.remarks, student_id, &form.remark).await;
    let failure_to = match &outcome {
        Err(Error::NotFound { .. }) => "/students".to_string(),
        _ => remarks_path(student_id),
    };
    state.settle(
        outcome,
        |_| (remarks_path(student_id), "Session added".into()),
        failure_to,
    )
}

async fn edit_remark(
    Extension(state): Extension<AppState>,
    Ids((student_id, session_id)): Ids<(i64, i64)>,
    Form(form): Form<RemarkForm>,
) -> FlashRedirect {
    let outcome =
        sessions::edit_remark(state.store.as_ref(), student_id, session_id, &form.remark).await;
    state.settle(
        outcome,
        |_| (remarks_path(student_id), "Remark updated".into()),
        remarks_path(student_id),
    )
}

async fn delete_remark(
    Extension(state): Extension<AppState>,
    Ids((student_id, session_id)): Ids<(i64, i64)>,
) -> FlashRedirect {
    let outcome = sessions::delete(state.store.as_ref(), student_id, session_id).await;
    state.settle(
        outcome,
        |_| (remarks_path(student_id), "Session deleted".into()),
        remarks_path(student_id),
    )
}

#[derive(Deserialize)]
struct InfoForm {
    #[serde(default)]
    school_name: String,
    #[serde(default)]
    birth_date: String,
    #[serde(default)]
    phone_number: String,
}

async fn update_info(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
    Form(form): Form<InfoForm>,
) -> FlashRedirect {
    let outcome = directory::update_profile(
        state.store.as_ref(),
        student_id,
        directory::ProfileForm {
            school_name: &form.school_name,
            birth_date: &form.birth_date,
            phone_number: &form.phone_number,
        },
    )
    .await;
    let failure_to = match &outcome {
        Err(Error::NotFound { .. }) => "/students".to_string(),
        _ => remarks_path(student_id),
    };
    state.settle(
        outcome,
        |_| (remarks_path(student_id), "Information updated".into()),
        failure_to,
    )
}

/// Form body with any number of `selected_sessions` fields.
async fn save_selection(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
    body: Bytes,
) -> Payload<Message> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&body)
        .map_err(|err| Error::invalid_payload(format!("Malformed form body: {}", err)))?;
    let ids = sessions::parse_selection(
        pairs
            .iter()
            .filter(|(key, _)| key == "selected_sessions")
            .map(|(_, value)| value.as_str()),
    )?;
    sessions::save_selection(state.store.as_ref(), student_id, &ids)
        .await
        .map_err(log_api_error)?;
    proceeds(message("Selection updated"))
}

#[derive(Serialize)]
struct ProgrammeView {
    flash: Option<Flash>,
    student_id: i64,
    programme: Vec<Chapter>,
    selected_chapters: Vec<String>,
}

async fn programme_maths(
    Extension(state): Extension<AppState>,
    Ids(student_id): Ids<i64>,
    cookie: FlashCookie,
) -> Result<Response, Error> {
    let selected_chapters =
        match programme::selected_chapters(state.store.as_ref(), student_id).await {
            Ok(selected) => selected,
            Err(err @ Error::NotFound { .. }) => {
                return Ok(state
                    .redirect("/students", Flash::error(err.to_string()))
                    .into_response());
            }
            Err(err) => return Err(err),
        };
    Ok(state
        .page(
            |flash| ProgrammeView {
                flash,
                student_id,
                programme: programme::outline(),
                selected_chapters,
            },
            &cookie,
        )
        .into_response())
}

/// Student ids arrive as numbers or numeric strings depending on the client.
#[derive(Deserialize)]
#[serde(untagged)]
enum StudentRef {
    Id(i64),
    Text(String),
}

#[derive(Deserialize)]
struct ProgrammeSelections {
    student_id: Option<StudentRef>,
    #[serde(default)]
    selections: Vec<String>,
}

async fn save_programme_selections(
    Extension(state): Extension<AppState>,
    body: Result<Json<ProgrammeSelections>, JsonRejection>,
) -> Payload<Message> {
    let Json(body) = body.map_err(|rejection| match rejection {
        JsonRejection::MissingJsonContentType(_) => Error::UnsupportedMediaType {
            message: "Content-Type must be application/json".into(),
        },
        other => Error::invalid_payload(other.to_string()),
    })?;
    let student_id = match body.student_id {
        Some(StudentRef::Id(id)) => id,
        Some(StudentRef::Text(raw)) => raw
            .trim()
            .parse()
            .map_err(|_| Error::invalid_payload(format!("`{}` is not a student id", raw)))?,
        None => return Err(Error::invalid_payload("student_id is required")),
    };
    programme::replace_selections(state.store.as_ref(), student_id, &body.selections)
        .await
        .map_err(log_api_error)?;
    proceeds(message("Selections saved"))
}

fn log_api_error(err: Error) -> Error {
    if err.is_recoverable() {
        log::warn!("Rejected request: {}", err);
    } else {
        log::error!("Store failure: {}", err);
    }
    err
}
