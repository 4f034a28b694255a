use chrono::NaiveDate;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::api::{ApiError, ApiResult, FieldErrors, Reply};
use crate::auth::{ActingUser, Capability};
use crate::db::DbPool;
use crate::users::UserRecord;
use crate::util::{parse_date, required_name};

pub type YearId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
pub struct AcademicYear {
    pub id: YearId,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub is_active: bool,
}

const YEAR_COLUMNS: &str = "id, name, start_date, end_date, is_current, is_active";

pub async fn load_year(year_id: YearId, pool: &SqlitePool) -> sqlx::Result<Option<AcademicYear>> {
    sqlx::query_as(&format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE id=?"))
        .bind(year_id)
        .fetch_optional(pool)
        .await
}

pub async fn require_year(year_id: YearId, pool: &SqlitePool) -> Result<AcademicYear, ApiError> {
    load_year(year_id, pool).await?
        .ok_or_else(|| ApiError::not_found(format!("Academic year id={year_id} not found")))
}

pub async fn current_year(pool: &SqlitePool) -> sqlx::Result<Option<AcademicYear>> {
    sqlx::query_as(&format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE is_current=1"))
        .fetch_optional(pool)
        .await
}

async fn first_active_year(pool: &SqlitePool) -> sqlx::Result<Option<AcademicYear>> {
    sqlx::query_as(&format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE is_active=1 ORDER BY id LIMIT 1"))
        .fetch_optional(pool)
        .await
}

/// The system-wide active year used by attendance scans.
/// Several years may be flagged active, the current one wins, then the most recent start.
pub async fn active_year(pool: &SqlitePool) -> sqlx::Result<Option<AcademicYear>> {
    sqlx::query_as(&format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE is_active=1
                ORDER BY is_current DESC, start_date DESC, id DESC LIMIT 1"))
        .fetch_optional(pool)
        .await
}

// user preference (only when active), then current, then any active year
fn pick_working_year(preferred: Option<AcademicYear>, current: Option<AcademicYear>, any_active: Option<AcademicYear>) -> Option<AcademicYear> {
    preferred.filter(|y| y.is_active)
        .or(current)
        .or(any_active)
}

pub async fn resolve_working_year(user: &UserRecord, pool: &SqlitePool) -> sqlx::Result<Option<AcademicYear>> {
    let preferred = match user.working_year_id {
        Some(year_id) => load_year(year_id, pool).await?,
        None => None,
    };
    if preferred.as_ref().is_some_and(|y| y.is_active) {
        return Ok(preferred);
    }
    let current = current_year(pool).await?;
    let any_active = if current.is_none() { first_active_year(pool).await? } else { None };
    Ok(pick_working_year(preferred, current, any_active))
}

pub async fn require_working_year(user: &UserRecord, pool: &SqlitePool) -> Result<AcademicYear, ApiError> {
    resolve_working_year(user, pool).await?
        .ok_or_else(|| ApiError::precondition("No academic year is configured").code("no_working_year"))
}

/// Makes `year_id` the only current year, in one transaction.
pub async fn set_current_year(year_id: YearId, pool: &SqlitePool) -> Result<AcademicYear, ApiError> {
    let mut txn = pool.begin().await?;
    let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM academic_years WHERE id=?")
        .bind(year_id)
        .fetch_optional(&mut *txn).await?;
    if found.is_none() {
        return Err(ApiError::not_found(format!("Academic year id={year_id} not found")));
    }
    sqlx::query("UPDATE academic_years SET is_current=0 WHERE is_current=1 AND id<>?")
        .bind(year_id)
        .execute(&mut *txn).await?;
    sqlx::query("UPDATE academic_years SET is_current=1, is_active=1 WHERE id=?")
        .bind(year_id)
        .execute(&mut *txn).await?;
    txn.commit().await?;
    info!("Academic year {year_id} is now current");
    require_year(year_id, pool).await
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct PostedYear {
    name: String,
    start_date: String,
    end_date: String,
    #[serde(default = "default_true")]
    is_active: bool,
}
struct ValidYear {
    name: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    is_active: bool,
}
impl PostedYear {
    fn validate(&self) -> Result<ValidYear, ApiError> {
        let mut errors = FieldErrors::new();
        let mut collect = |field: &str, res: Result<NaiveDate, ApiError>| match res {
            Ok(d) => Some(d),
            Err(ApiError::Validation { errors: e, .. }) => {
                errors.extend(e);
                None
            }
            Err(_) => {
                errors.insert(field.to_string(), vec!["invalid".into()]);
                None
            }
        };
        let start_date = collect("start_date", parse_date("start_date", &self.start_date));
        let end_date = collect("end_date", parse_date("end_date", &self.end_date));
        let name = match required_name("name", &self.name) {
            Ok(name) => Some(name),
            Err(_) => {
                errors.insert("name".into(), vec!["must not be empty".into()]);
                None
            }
        };
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if end < start {
                errors.insert("end_date".into(), vec!["must not be before start_date".into()]);
            }
        }
        match (name, start_date, end_date) {
            (Some(name), Some(start_date), Some(end_date)) if errors.is_empty() => Ok(ValidYear {
                name,
                start_date,
                end_date,
                is_active: self.is_active,
            }),
            _ => Err(ApiError::invalid(errors)),
        }
    }
}

fn duplicate_name(err: sqlx::Error, name: &str) -> ApiError {
    match ApiError::from(err) {
        ApiError::Conflict { .. } => ApiError::conflict(format!("Academic year {name} already exists")).code("duplicate_year"),
        other => other,
    }
}

#[get("/years")]
async fn get_years(db: &State<DbPool>) -> ApiResult<Vec<AcademicYear>> {
    let years = sqlx::query_as(&format!("SELECT {YEAR_COLUMNS} FROM academic_years ORDER BY start_date DESC"))
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(years))
}

#[get("/years/current")]
async fn get_current_year(db: &State<DbPool>) -> ApiResult<AcademicYear> {
    let year = current_year(&db.0).await?
        .ok_or_else(|| ApiError::not_found("No current academic year"))?;
    Ok(Reply::ok(year))
}

#[post("/years", data = "<posted>")]
async fn post_year(posted: Json<PostedYear>, user: ActingUser, db: &State<DbPool>) -> ApiResult<AcademicYear> {
    user.require(Capability::ManageYears)?;
    let year = posted.validate()?;
    let created: AcademicYear = sqlx::query_as(&format!("INSERT INTO academic_years (name, start_date, end_date, is_active)
                VALUES (?, ?, ?, ?) RETURNING {YEAR_COLUMNS}"))
        .bind(&year.name)
        .bind(year.start_date)
        .bind(year.end_date)
        .bind(year.is_active)
        .fetch_one(&db.0)
        .await
        .map_err(|e| duplicate_name(e, &year.name))?;
    info!("Academic year created, id: {}, name: {}", created.id, created.name);
    Ok(Reply::created(created).message("Academic year created"))
}

#[put("/years/<year_id>", data = "<posted>")]
async fn put_year(year_id: YearId, posted: Json<PostedYear>, user: ActingUser, db: &State<DbPool>) -> ApiResult<AcademicYear> {
    user.require(Capability::ManageYears)?;
    let year = posted.validate()?;
    let existing = require_year(year_id, &db.0).await?;
    if existing.is_current && !year.is_active {
        return Err(ApiError::validation("is_active", "the current academic year cannot be deactivated"));
    }
    sqlx::query("UPDATE academic_years SET name=?, start_date=?, end_date=?, is_active=? WHERE id=?")
        .bind(&year.name)
        .bind(year.start_date)
        .bind(year.end_date)
        .bind(year.is_active)
        .bind(year_id)
        .execute(&db.0)
        .await
        .map_err(|e| duplicate_name(e, &year.name))?;
    Ok(Reply::ok(require_year(year_id, &db.0).await?).message("Academic year updated"))
}

#[post("/years/<year_id>/current")]
async fn post_year_current(year_id: YearId, user: ActingUser, db: &State<DbPool>) -> ApiResult<AcademicYear> {
    user.require(Capability::ManageYears)?;
    let year = set_current_year(year_id, &db.0).await?;
    Ok(Reply::ok(year).message("Current academic year changed"))
}

#[delete("/years/<year_id>")]
async fn delete_year(year_id: YearId, user: ActingUser, db: &State<DbPool>) -> ApiResult<YearId> {
    user.require(Capability::ManageYears)?;
    let year = require_year(year_id, &db.0).await?;
    if year.is_current {
        return Err(ApiError::conflict("The current academic year cannot be deleted").code("year_is_current"));
    }
    let (students,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM students WHERE year_id=?")
        .bind(year_id)
        .fetch_one(&db.0).await?;
    if students > 0 {
        return Err(ApiError::conflict(format!("Academic year {} still has {students} students", year.name)).code("year_in_use"));
    }
    sqlx::query("DELETE FROM academic_years WHERE id=?")
        .bind(year_id)
        .execute(&db.0).await?;
    Ok(Reply::ok(year_id).message("Academic year deleted"))
}

#[get("/me/working-year")]
async fn get_working_year(user: ActingUser, db: &State<DbPool>) -> ApiResult<AcademicYear> {
    let year = require_working_year(&user.0, &db.0).await?;
    Ok(Reply::ok(year))
}

#[derive(Deserialize, Debug)]
struct PostedWorkingYear {
    school_year_id: YearId,
}

#[put("/me/working-year", data = "<posted>")]
async fn put_working_year(posted: Json<PostedWorkingYear>, user: ActingUser, db: &State<DbPool>) -> ApiResult<AcademicYear> {
    let year = require_year(posted.school_year_id, &db.0).await?;
    if !year.is_active {
        return Err(ApiError::validation("school_year_id", format!("academic year {} is not active", year.name)));
    }
    sqlx::query("UPDATE users SET working_year_id=? WHERE id=?")
        .bind(year.id)
        .bind(user.0.id)
        .execute(&db.0).await?;
    Ok(Reply::ok(year).message("Working year changed"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_years,
            get_current_year,
            post_year,
            put_year,
            post_year_current,
            delete_year,
            get_working_year,
            put_working_year,
        ])
}
