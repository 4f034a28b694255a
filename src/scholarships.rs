use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::api::{ApiError, ApiResult, FieldErrors, Reply};
use crate::auth::{ActingUser, Capability};
use crate::batch::BatchOutcome;
use crate::clock::Now;
use crate::db::DbPool;
use crate::students::StudentId;
use crate::util::required_name;
use crate::years::{require_working_year, require_year, YearId};

pub type ScholarshipId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct Scholarship {
    pub id: ScholarshipId,
    pub name: String,
    pub amount: i64,
    pub year_id: YearId,
}

async fn require_scholarship(scholarship_id: ScholarshipId, pool: &SqlitePool) -> Result<Scholarship, ApiError> {
    sqlx::query_as("SELECT id, name, amount, year_id FROM scholarships WHERE id=?")
        .bind(scholarship_id)
        .fetch_optional(pool).await?
        .ok_or_else(|| ApiError::not_found(format!("Scholarship id={scholarship_id} not found")))
}

#[get("/scholarships?<year_id>")]
async fn get_scholarships(year_id: Option<YearId>, user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<Scholarship>> {
    user.require(Capability::ManageScholarships)?;
    let year = match year_id {
        Some(year_id) => require_year(year_id, &db.0).await?,
        None => require_working_year(&user.0, &db.0).await?,
    };
    let scholarships = sqlx::query_as("SELECT id, name, amount, year_id FROM scholarships WHERE year_id=? ORDER BY name")
        .bind(year.id)
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(scholarships))
}

#[derive(Deserialize, Debug)]
struct PostedScholarship {
    name: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    school_year_id: Option<YearId>,
}

#[post("/scholarships", data = "<posted>")]
async fn post_scholarship(posted: Json<PostedScholarship>, user: ActingUser, db: &State<DbPool>) -> ApiResult<Scholarship> {
    user.require(Capability::ManageScholarships)?;
    let mut errors = FieldErrors::new();
    let name = match required_name("name", &posted.name) {
        Ok(name) => name,
        Err(ApiError::Validation { errors: e, .. }) => {
            errors.extend(e);
            String::new()
        }
        Err(e) => return Err(e),
    };
    if posted.amount < 0 {
        errors.insert("amount".to_string(), vec!["must not be negative".into()]);
    }
    if !errors.is_empty() {
        return Err(ApiError::invalid(errors));
    }
    let year = match posted.school_year_id {
        Some(year_id) => require_year(year_id, &db.0).await?,
        None => require_working_year(&user.0, &db.0).await?,
    };
    let scholarship: Scholarship = sqlx::query_as("INSERT INTO scholarships (name, amount, year_id) VALUES (?, ?, ?)
                RETURNING id, name, amount, year_id")
        .bind(&name)
        .bind(posted.amount)
        .bind(year.id)
        .fetch_one(&db.0).await
        .map_err(|e| match ApiError::from(e) {
            ApiError::Conflict { .. } => ApiError::conflict(format!("Scholarship {name} already exists for {}", year.name)).code("duplicate_name"),
            other => other,
        })?;
    info!("Scholarship created, id: {}, year: {}", scholarship.id, year.id);
    Ok(Reply::created(scholarship).message("Scholarship created"))
}

#[derive(Deserialize, Debug)]
struct PostedStudents {
    student_ids: Vec<StudentId>,
}

#[post("/scholarships/<scholarship_id>/assign", data = "<posted>")]
async fn post_assign(scholarship_id: ScholarshipId, posted: Json<PostedStudents>, user: ActingUser, now: Now, db: &State<DbPool>) -> ApiResult<BatchOutcome<StudentId>> {
    user.require(Capability::ManageScholarships)?;
    let scholarship = require_scholarship(scholarship_id, &db.0).await?;
    let mut outcome = BatchOutcome::default();
    let mut txn = db.0.begin().await?;
    for &student_id in &posted.student_ids {
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM students WHERE id=?")
            .bind(student_id)
            .fetch_optional(&mut *txn).await?;
        if found.is_none() {
            outcome.failed(student_id, format!("Student id={student_id} not found"));
            continue;
        }
        let res = sqlx::query("INSERT INTO student_scholarships (student_id, scholarship_id, assigned_at) VALUES (?, ?, ?)")
            .bind(student_id)
            .bind(scholarship.id)
            .bind(now.0)
            .execute(&mut *txn).await;
        match res {
            Ok(_) => outcome.assigned(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                outcome.failed(student_id, format!("Student id={student_id} already holds {}", scholarship.name));
            }
            Err(e) => return Err(e.into()),
        }
    }
    txn.commit().await?;
    info!("Scholarship {} assigned, {}", scholarship.id, outcome.summary());
    let message = outcome.summary();
    Ok(Reply::ok(outcome).message(message))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_scholarships,
            post_scholarship,
            post_assign,
        ])
}
