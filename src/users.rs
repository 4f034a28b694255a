use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::api::{ApiError, ApiResult, FieldErrors, Reply};
use crate::auth::{ActingUser, Capability, Role};
use crate::db::DbPool;

pub type UserId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub working_year_id: Option<i64>,
}

pub async fn load_user(user_id: UserId, pool: &SqlitePool) -> sqlx::Result<Option<UserRecord>> {
    sqlx::query_as("SELECT id, name, email, role, working_year_id FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn require_user(user_id: UserId, pool: &SqlitePool) -> Result<UserRecord, ApiError> {
    load_user(user_id, pool).await?
        .ok_or_else(|| ApiError::not_found(format!("User id={user_id} not found")))
}

/// Creates the first admin account when the users table is empty.
pub async fn bootstrap_admin(name: &str, email: &str, pool: &SqlitePool) -> sqlx::Result<Option<UserRecord>> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool).await?;
    if count > 0 {
        return Ok(None);
    }
    let admin: UserRecord = sqlx::query_as("INSERT INTO users (name, email, role) VALUES (?, ?, ?)
                RETURNING id, name, email, role, working_year_id")
        .bind(name)
        .bind(email.trim().to_lowercase())
        .bind(Role::Admin)
        .fetch_one(pool).await?;
    info!("Bootstrap admin created, id: {}, email: {}", admin.id, admin.email);
    Ok(Some(admin))
}

#[derive(Deserialize, Debug)]
struct PostedUser {
    name: String,
    email: String,
    role: Role,
}
impl PostedUser {
    fn validate(&self) -> Result<(String, String), ApiError> {
        let mut errors = FieldErrors::new();
        let name = self.name.trim();
        if name.is_empty() {
            errors.entry("name".into()).or_default().push("must not be empty".into());
        }
        let email = self.email.trim().to_lowercase();
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            errors.entry("email".into()).or_default().push("must be an email address".into());
        }
        if errors.is_empty() {
            Ok((name.to_string(), email))
        } else {
            Err(ApiError::invalid(errors))
        }
    }
}

#[get("/users?<role>")]
async fn get_users(role: Option<&str>, user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<UserRecord>> {
    user.require(Capability::ManageUsers)?;
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, name, email, role, working_year_id FROM users");
    if let Some(role) = role {
        let role = role.parse::<Role>().map_err(|e| ApiError::validation("role", e))?;
        qb.push(" WHERE role=");
        qb.push_bind(role);
    }
    qb.push(" ORDER BY name");
    let users = qb.build_query_as::<UserRecord>().fetch_all(&db.0).await?;
    Ok(Reply::ok(users))
}

#[post("/users", data = "<posted>")]
async fn post_user(posted: Json<PostedUser>, user: ActingUser, db: &State<DbPool>) -> ApiResult<UserRecord> {
    user.require(Capability::ManageUsers)?;
    let (name, email) = posted.validate()?;
    let created: UserRecord = sqlx::query_as("INSERT INTO users (name, email, role) VALUES (?, ?, ?)
                RETURNING id, name, email, role, working_year_id")
        .bind(&name)
        .bind(&email)
        .bind(posted.role)
        .fetch_one(&db.0)
        .await
        .map_err(|e| match ApiError::from(e) {
            ApiError::Conflict { .. } => ApiError::conflict(format!("Email {email} is already registered")).code("duplicate_email"),
            other => other,
        })?;
    info!("User created, id: {}, role: {}", created.id, created.role);
    Ok(Reply::created(created).message("User created"))
}

#[derive(Deserialize, Debug)]
struct PostedRole {
    role: Role,
}

#[put("/users/<user_id>/role", data = "<posted>")]
async fn put_user_role(user_id: UserId, posted: Json<PostedRole>, user: ActingUser, db: &State<DbPool>) -> ApiResult<UserRecord> {
    user.require(Capability::ManageUsers)?;
    let res = sqlx::query("UPDATE users SET role=? WHERE id=?")
        .bind(posted.role)
        .bind(user_id)
        .execute(&db.0).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("User id={user_id} not found")));
    }
    Ok(Reply::ok(require_user(user_id, &db.0).await?).message("Role updated"))
}

#[delete("/users/<user_id>")]
async fn delete_user(user_id: UserId, user: ActingUser, db: &State<DbPool>) -> ApiResult<UserId> {
    user.require(Capability::ManageUsers)?;
    if user.0.id == user_id {
        return Err(ApiError::conflict("Users cannot delete themselves"));
    }
    let res = sqlx::query("DELETE FROM users WHERE id=?")
        .bind(user_id)
        .execute(&db.0).await?;
    if res.rows_affected() == 0 {
        Err(ApiError::not_found(format!("User id={user_id} not found")))
    } else {
        Ok(Reply::ok(user_id).message("User deleted"))
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_users,
            post_user,
            put_user_role,
            delete_user,
        ])
}
