use std::io::Cursor;
use base64::engine::general_purpose;
use base64::Engine;
use image::ImageFormat;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::api::{ApiError, ApiResult, FieldErrors, Reply};
use crate::auth::{ActingUser, Capability};
use crate::checkin::StudentQr;
use crate::db::DbPool;
use crate::structure::{load_series, require_class, ClassId, SeriesId};
use crate::util::generate_random_string;
use crate::years::{require_working_year, require_year, YearId};
use crate::AppConfig;

pub type StudentId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct StudentRecord {
    pub id: StudentId,
    pub matricule: String,
    pub first_name: String,
    pub last_name: String,
    pub class_id: ClassId,
    pub series_id: Option<SeriesId>,
    pub year_id: YearId,
}
impl StudentRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

const STUDENT_COLUMNS: &str = "id, matricule, first_name, last_name, class_id, series_id, year_id";

pub async fn load_student(student_id: StudentId, pool: &SqlitePool) -> sqlx::Result<Option<StudentRecord>> {
    sqlx::query_as(&format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id=?"))
        .bind(student_id)
        .fetch_optional(pool)
        .await
}

async fn require_student(student_id: StudentId, pool: &SqlitePool) -> Result<StudentRecord, ApiError> {
    load_student(student_id, pool).await?
        .ok_or_else(|| ApiError::not_found(format!("Student id={student_id} not found")))
}

fn render_qr_png(payload: &str, module_size: u32) -> anyhow::Result<String> {
    let code = qrcode::QrCode::new(payload.as_bytes())?;
    let image = code.render::<::image::LumaA<u8>>()
        .module_dimensions(module_size, module_size)
        .build();
    let mut buffer: Vec<u8> = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(&buffer))
}

#[derive(Deserialize, Debug)]
struct PostedStudent {
    first_name: String,
    last_name: String,
    school_class_id: ClassId,
    #[serde(default)]
    series_id: Option<SeriesId>,
    #[serde(default)]
    school_year_id: Option<YearId>,
    #[serde(default)]
    matricule: Option<String>,
}

#[post("/students", data = "<posted>")]
async fn post_student(posted: Json<PostedStudent>, user: ActingUser, db: &State<DbPool>) -> ApiResult<StudentRecord> {
    user.require(Capability::ManageStudents)?;
    let mut errors = FieldErrors::new();
    for (field, value) in [("first_name", &posted.first_name), ("last_name", &posted.last_name)] {
        if value.trim().is_empty() {
            errors.insert(field.to_string(), vec!["must not be empty".into()]);
        }
    }
    if !errors.is_empty() {
        return Err(ApiError::invalid(errors));
    }
    let class = require_class(posted.school_class_id, &db.0).await?;
    if let Some(series_id) = posted.series_id {
        match load_series(series_id, &db.0).await? {
            Some(series) if series.class_id == class.id => {}
            Some(series) => return Err(ApiError::validation("series_id", format!("series {} does not belong to class {}", series.name, class.name))),
            None => return Err(ApiError::not_found(format!("Series id={series_id} not found"))),
        }
    }
    let year = match posted.school_year_id {
        Some(year_id) => require_year(year_id, &db.0).await?,
        None => require_working_year(&user.0, &db.0).await?,
    };
    let matricule = posted.matricule.as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| generate_random_string(8));
    let student: StudentRecord = sqlx::query_as(&format!("INSERT INTO students (matricule, first_name, last_name, class_id, series_id, year_id)
                VALUES (?, ?, ?, ?, ?, ?) RETURNING {STUDENT_COLUMNS}"))
        .bind(&matricule)
        .bind(posted.first_name.trim())
        .bind(posted.last_name.trim())
        .bind(class.id)
        .bind(posted.series_id)
        .bind(year.id)
        .fetch_one(&db.0).await
        .map_err(|e| match ApiError::from(e) {
            ApiError::Conflict { .. } => ApiError::conflict(format!("Matricule {matricule} is already used")).code("duplicate_matricule"),
            other => other,
        })?;
    info!("Student created, id: {}, class: {}, year: {}", student.id, class.name, year.name);
    Ok(Reply::created(student).message("Student created"))
}

#[get("/students?<class_id>&<series_id>")]
async fn get_students(class_id: Option<ClassId>, series_id: Option<SeriesId>, user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<StudentRecord>> {
    let year = require_working_year(&user.0, &db.0).await?;
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {STUDENT_COLUMNS} FROM students WHERE year_id="));
    qb.push_bind(year.id);
    if let Some(class_id) = class_id {
        qb.push(" AND class_id=");
        qb.push_bind(class_id);
    }
    if let Some(series_id) = series_id {
        qb.push(" AND series_id=");
        qb.push_bind(series_id);
    }
    qb.push(" ORDER BY last_name, first_name");
    let students = qb.build_query_as::<StudentRecord>().fetch_all(&db.0).await?;
    Ok(Reply::ok(students))
}

#[get("/students/<student_id>")]
async fn get_student(student_id: StudentId, _user: ActingUser, db: &State<DbPool>) -> ApiResult<StudentRecord> {
    Ok(Reply::ok(require_student(student_id, &db.0).await?))
}

#[derive(Serialize, Debug)]
struct StudentQrCode {
    student_id: StudentId,
    payload: String,
    png_base64: String,
}

#[get("/students/<student_id>/qr")]
async fn get_student_qr(student_id: StudentId, _user: ActingUser, cfg: &State<AppConfig>, db: &State<DbPool>) -> ApiResult<StudentQrCode> {
    let student = require_student(student_id, &db.0).await?;
    let payload = StudentQr(student.id).to_string();
    let png_base64 = render_qr_png(&payload, cfg.qr_module_size)?;
    Ok(Reply::ok(StudentQrCode { student_id: student.id, payload, png_base64 }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_student,
            get_students,
            get_student,
            get_student_qr,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_png_is_base64_png() {
        let data = render_qr_png("STUDENT_ID_42", 4).unwrap();
        let bytes = general_purpose::STANDARD.decode(data).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
