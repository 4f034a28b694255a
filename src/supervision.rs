use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::api::{ApiError, ApiResult, Reply};
use crate::auth::{ActingUser, Capability, Role};
use crate::db::DbPool;
use crate::structure::{require_class, ClassId};
use crate::users::{require_user, UserId};
use crate::years::{require_year, YearId};

pub type AssignmentId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SupervisorAssignment {
    pub id: AssignmentId,
    pub supervisor_id: UserId,
    pub class_id: ClassId,
    pub year_id: YearId,
    pub is_active: bool,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AssignmentView {
    pub id: AssignmentId,
    pub supervisor_id: UserId,
    pub supervisor_name: String,
    pub class_id: ClassId,
    pub class_name: String,
    pub year_id: YearId,
    pub year_name: String,
    pub is_active: bool,
}

const VIEW_QUERY: &str = "SELECT a.id, a.supervisor_id, u.name AS supervisor_name, a.class_id, c.name AS class_name,
            a.year_id, y.name AS year_name, a.is_active
        FROM supervisor_assignments AS a
        JOIN users AS u ON u.id = a.supervisor_id
        JOIN school_classes AS c ON c.id = a.class_id
        JOIN academic_years AS y ON y.id = a.year_id";

pub async fn assign(supervisor_id: UserId, class_id: ClassId, year_id: YearId, pool: &SqlitePool) -> Result<SupervisorAssignment, ApiError> {
    let supervisor = require_user(supervisor_id, pool).await?;
    if supervisor.role != Role::Supervisor {
        return Err(ApiError::validation("supervisor_id", format!("user {} is not a supervisor", supervisor.name)));
    }
    let class = require_class(class_id, pool).await?;
    let year = require_year(year_id, pool).await?;
    let assignment: SupervisorAssignment = sqlx::query_as("INSERT INTO supervisor_assignments (supervisor_id, class_id, year_id, is_active)
                VALUES (?, ?, ?, 1) RETURNING id, supervisor_id, class_id, year_id, is_active")
        .bind(supervisor.id)
        .bind(class.id)
        .bind(year.id)
        .fetch_one(pool).await
        .map_err(|e| match ApiError::from(e) {
            ApiError::Conflict { .. } => ApiError::conflict(format!("{} is already assigned to {} for {}", supervisor.name, class.name, year.name))
                .code("duplicate_assignment"),
            other => other,
        })?;
    info!("Supervisor {} assigned to class {} for year {}", supervisor.id, class.id, year.id);
    Ok(assignment)
}

/// True iff an active assignment exists for exactly this tuple.
pub async fn is_authorized(supervisor_id: UserId, class_id: ClassId, year_id: YearId, pool: &SqlitePool) -> sqlx::Result<bool> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM supervisor_assignments
                WHERE supervisor_id=? AND class_id=? AND year_id=? AND is_active=1")
        .bind(supervisor_id)
        .bind(class_id)
        .bind(year_id)
        .fetch_one(pool).await?;
    Ok(count > 0)
}

pub async fn assigned_class_ids(supervisor_id: UserId, year_id: YearId, pool: &SqlitePool) -> sqlx::Result<Vec<ClassId>> {
    let rows: Vec<(ClassId,)> = sqlx::query_as("SELECT class_id FROM supervisor_assignments
                WHERE supervisor_id=? AND year_id=? AND is_active=1 ORDER BY class_id")
        .bind(supervisor_id)
        .bind(year_id)
        .fetch_all(pool).await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn list_for_supervisor(supervisor_id: UserId, pool: &SqlitePool) -> sqlx::Result<Vec<AssignmentView>> {
    sqlx::query_as(&format!("{VIEW_QUERY} WHERE a.supervisor_id=? ORDER BY y.start_date DESC, c.name"))
        .bind(supervisor_id)
        .fetch_all(pool).await
}

pub async fn list_all(pool: &SqlitePool) -> sqlx::Result<Vec<AssignmentView>> {
    sqlx::query_as(&format!("{VIEW_QUERY} ORDER BY y.start_date DESC, u.name, c.name"))
        .fetch_all(pool).await
}

pub async fn set_active(assignment_id: AssignmentId, is_active: bool, pool: &SqlitePool) -> Result<(), ApiError> {
    let res = sqlx::query("UPDATE supervisor_assignments SET is_active=? WHERE id=?")
        .bind(is_active)
        .bind(assignment_id)
        .execute(pool).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Assignment id={assignment_id} not found")));
    }
    Ok(())
}

pub async fn delete(assignment_id: AssignmentId, pool: &SqlitePool) -> Result<(), ApiError> {
    let res = sqlx::query("DELETE FROM supervisor_assignments WHERE id=?")
        .bind(assignment_id)
        .execute(pool).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Assignment id={assignment_id} not found")));
    }
    Ok(())
}

#[derive(Deserialize, Debug)]
struct PostedAssignment {
    supervisor_id: UserId,
    school_class_id: ClassId,
    school_year_id: YearId,
}

#[post("/supervisor/assign", data = "<posted>")]
async fn post_assign(posted: Json<PostedAssignment>, user: ActingUser, db: &State<DbPool>) -> ApiResult<SupervisorAssignment> {
    user.require(Capability::ManageSupervision)?;
    let assignment = assign(posted.supervisor_id, posted.school_class_id, posted.school_year_id, &db.0).await?;
    Ok(Reply::created(assignment).message("Supervisor assigned"))
}

#[get("/supervisor/assignments")]
async fn get_assignments(user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<AssignmentView>> {
    user.require(Capability::ManageSupervision)?;
    Ok(Reply::ok(list_all(&db.0).await?))
}

#[get("/supervisor/<supervisor_id>/assignments")]
async fn get_supervisor_assignments(supervisor_id: UserId, user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<AssignmentView>> {
    if user.0.id != supervisor_id {
        user.require(Capability::ManageSupervision)?;
    }
    Ok(Reply::ok(list_for_supervisor(supervisor_id, &db.0).await?))
}

#[post("/supervisor/assignments/<assignment_id>/deactivate")]
async fn post_deactivate(assignment_id: AssignmentId, user: ActingUser, db: &State<DbPool>) -> ApiResult<AssignmentId> {
    user.require(Capability::ManageSupervision)?;
    set_active(assignment_id, false, &db.0).await?;
    Ok(Reply::ok(assignment_id).message("Assignment deactivated"))
}

#[post("/supervisor/assignments/<assignment_id>/activate")]
async fn post_activate(assignment_id: AssignmentId, user: ActingUser, db: &State<DbPool>) -> ApiResult<AssignmentId> {
    user.require(Capability::ManageSupervision)?;
    set_active(assignment_id, true, &db.0).await?;
    Ok(Reply::ok(assignment_id).message("Assignment activated"))
}

#[delete("/supervisor/assignments/<assignment_id>")]
async fn delete_assignment(assignment_id: AssignmentId, user: ActingUser, db: &State<DbPool>) -> ApiResult<AssignmentId> {
    user.require(Capability::ManageSupervision)?;
    delete(assignment_id, &db.0).await?;
    Ok(Reply::ok(assignment_id).message("Assignment deleted"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_assign,
            get_assignments,
            get_supervisor_assignments,
            post_deactivate,
            post_activate,
            delete_assignment,
        ])
}
