use std::collections::BTreeMap;
use std::fmt::Display;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Build, Request, Rocket};
use serde::Serialize;
use serde_json::Value;
use crate::AppConfig;
use crate::util::tee_sqlx_error;

pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Body of every response: `{success, data?, message?, errors?, error?}`.
#[derive(Serialize, Debug)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FieldErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
impl<T> Envelope<T> {
    fn failure(message: String) -> Self {
        Self { success: false, data: None, message: Some(message), errors: None, error: None }
    }
}

pub struct Reply<T> {
    status: Status,
    envelope: Envelope<T>,
}
impl<T: Serialize> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self::with_status(Status::Ok, data)
    }
    pub fn created(data: T) -> Self {
        Self::with_status(Status::Created, data)
    }
    fn with_status(status: Status, data: T) -> Self {
        Self {
            status,
            envelope: Envelope { success: true, data: Some(data), message: None, errors: None, error: None },
        }
    }
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.envelope.message = Some(message.into());
        self
    }
}
impl<'r, T: Serialize> Responder<'r, 'static> for Reply<T> {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        Custom(self.status, Json(self.envelope)).respond_to(req)
    }
}

pub type ApiResult<T> = Result<Reply<T>, ApiError>;

/// Machine readable code and optional payload attached to a rejection.
#[derive(Debug, Default)]
pub struct Detail {
    pub code: Option<&'static str>,
    pub data: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { message: String, errors: FieldErrors, code: Option<&'static str> },
    #[error("{message}")]
    NotFound { message: String, detail: Detail },
    #[error("{message}")]
    Forbidden { message: String, detail: Detail },
    #[error("{message}")]
    Conflict { message: String, detail: Detail },
    #[error("{message}")]
    Precondition { message: String, detail: Detail },
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: impl Display) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.to_string()]);
        Self::Validation { message: format!("Invalid value for {field}"), errors, code: None }
    }
    pub fn invalid(errors: FieldErrors) -> Self {
        Self::Validation { message: String::from("Validation failed"), errors, code: None }
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into(), detail: Detail::default() }
    }
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden { message: message.into(), detail: Detail::default() }
    }
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into(), detail: Detail::default() }
    }
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition { message: message.into(), detail: Detail::default() }
    }
    pub fn code(mut self, code: &'static str) -> Self {
        match &mut self {
            ApiError::Validation { code: c, .. } => *c = Some(code),
            other => if let Some(detail) = other.detail_mut() {
                detail.code = Some(code);
            },
        }
        self
    }
    pub fn data(mut self, data: Value) -> Self {
        if let Some(detail) = self.detail_mut() {
            detail.data = Some(data);
        }
        self
    }
    fn detail_mut(&mut self) -> Option<&mut Detail> {
        match self {
            ApiError::NotFound { detail, .. }
            | ApiError::Forbidden { detail, .. }
            | ApiError::Conflict { detail, .. }
            | ApiError::Precondition { detail, .. } => Some(detail),
            ApiError::Validation { .. } | ApiError::Unhandled(_) => None,
        }
    }
    pub fn status(&self) -> Status {
        match self {
            ApiError::Validation { .. } => Status::UnprocessableEntity,
            ApiError::NotFound { .. } => Status::NotFound,
            ApiError::Forbidden { .. } => Status::Forbidden,
            ApiError::Conflict { .. } => Status::UnprocessableEntity,
            ApiError::Precondition { .. } => Status::BadRequest,
            ApiError::Unhandled(_) => Status::InternalServerError,
        }
    }
    fn into_envelope(self, expose_internal: bool) -> Envelope<Value> {
        match self {
            ApiError::Validation { message, errors, code } => Envelope {
                errors: Some(errors),
                error: code.map(String::from),
                ..Envelope::failure(message)
            },
            ApiError::NotFound { message, detail }
            | ApiError::Forbidden { message, detail }
            | ApiError::Conflict { message, detail }
            | ApiError::Precondition { message, detail } => Envelope {
                data: detail.data,
                error: detail.code.map(String::from),
                ..Envelope::failure(message)
            },
            ApiError::Unhandled(err) => Envelope {
                error: expose_internal.then(|| format!("{err:#}")),
                ..Envelope::failure(String::from("Internal server error"))
            },
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return ApiError::conflict("Record already exists").code("duplicate");
            }
        }
        ApiError::Unhandled(tee_sqlx_error(err))
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        match &self {
            ApiError::Unhandled(err) => error!("{} {} failed: {err:#}", req.method(), req.uri()),
            _ => debug!("{} {} rejected ({status}): {self}", req.method(), req.uri()),
        }
        let expose_internal = req.rocket().state::<AppConfig>()
            .map(|cfg| cfg.expose_internal_errors)
            .unwrap_or(false);
        Custom(status, Json(self.into_envelope(expose_internal))).respond_to(req)
    }
}

#[catch(default)]
fn default_catcher(status: Status, _req: &Request) -> Custom<Json<Envelope<()>>> {
    let message = match status.code {
        400 => "Bad request",
        403 => "Access denied",
        404 => "Resource not found",
        422 => "Invalid request payload",
        _ => "Internal server error",
    };
    Custom(status, Json(Envelope::failure(message.to_string())))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.register("/", catchers![default_catcher])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_code_and_payload() {
        let err = ApiError::forbidden("nope")
            .code("not_authorized_for_class")
            .data(serde_json::json!({"student_name": "Awa Diallo"}));
        assert_eq!(err.status(), Status::Forbidden);
        let env = err.into_envelope(false);
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("not_authorized_for_class"));
        assert_eq!(env.data.unwrap()["student_name"], "Awa Diallo");
    }

    #[test]
    fn unhandled_hides_text_unless_exposed() {
        let hidden = ApiError::Unhandled(anyhow::anyhow!("disk on fire")).into_envelope(false);
        assert_eq!(hidden.error, None);
        assert_eq!(hidden.message.as_deref(), Some("Internal server error"));
        let shown = ApiError::Unhandled(anyhow::anyhow!("disk on fire")).into_envelope(true);
        assert_eq!(shown.error.as_deref(), Some("disk on fire"));
    }

    #[test]
    fn conflicts_map_to_unprocessable() {
        assert_eq!(ApiError::conflict("dup").status(), Status::UnprocessableEntity);
        assert_eq!(ApiError::precondition("no year").status(), Status::BadRequest);
        assert_eq!(ApiError::validation("date", "bad").status(), Status::UnprocessableEntity);
    }
}
