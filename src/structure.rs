use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::api::{ApiError, ApiResult, Reply};
use crate::auth::{ActingUser, Capability};
use crate::db::DbPool;
use crate::util::required_name;

pub type SectionId = i64;
pub type LevelId = i64;
pub type ClassId = i64;
pub type SeriesId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SectionRecord {
    pub id: SectionId,
    pub name: String,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct LevelRecord {
    pub id: LevelId,
    pub section_id: SectionId,
    pub name: String,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ClassRecord {
    pub id: ClassId,
    pub level_id: LevelId,
    pub name: String,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SeriesRecord {
    pub id: SeriesId,
    pub class_id: ClassId,
    pub name: String,
}

pub async fn load_class(class_id: ClassId, pool: &SqlitePool) -> sqlx::Result<Option<ClassRecord>> {
    sqlx::query_as("SELECT id, level_id, name FROM school_classes WHERE id=?")
        .bind(class_id)
        .fetch_optional(pool)
        .await
}

pub async fn require_class(class_id: ClassId, pool: &SqlitePool) -> Result<ClassRecord, ApiError> {
    load_class(class_id, pool).await?
        .ok_or_else(|| ApiError::not_found(format!("Class id={class_id} not found")))
}

pub async fn load_series(series_id: SeriesId, pool: &SqlitePool) -> sqlx::Result<Option<SeriesRecord>> {
    sqlx::query_as("SELECT id, class_id, name FROM series WHERE id=?")
        .bind(series_id)
        .fetch_optional(pool)
        .await
}

async fn require_parent(table: &str, what: &str, id: i64, pool: &SqlitePool) -> Result<(), ApiError> {
    let found: Option<(i64,)> = sqlx::query_as(&format!("SELECT id FROM {table} WHERE id=?"))
        .bind(id)
        .fetch_optional(pool).await?;
    found.map(|_| ()).ok_or_else(|| ApiError::not_found(format!("{what} id={id} not found")))
}

fn duplicate(err: sqlx::Error, what: &str, name: &str) -> ApiError {
    match ApiError::from(err) {
        ApiError::Conflict { .. } => ApiError::conflict(format!("{what} {name} already exists")).code("duplicate_name"),
        other => other,
    }
}

// optional parent filter shared by the list endpoints
fn list_query<'a>(table: &str, parent_column: &str, parent_id: Option<i64>) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new(format!("SELECT * FROM {table}"));
    if let Some(parent_id) = parent_id {
        qb.push(format!(" WHERE {parent_column}="));
        qb.push_bind(parent_id);
    }
    qb.push(" ORDER BY name");
    qb
}

#[derive(Deserialize, Debug)]
struct PostedSection {
    name: String,
}

#[get("/sections")]
async fn get_sections(db: &State<DbPool>) -> ApiResult<Vec<SectionRecord>> {
    let sections = sqlx::query_as("SELECT id, name FROM sections ORDER BY name")
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(sections))
}

#[post("/sections", data = "<posted>")]
async fn post_section(posted: Json<PostedSection>, user: ActingUser, db: &State<DbPool>) -> ApiResult<SectionRecord> {
    user.require(Capability::ManageStructure)?;
    let name = required_name("name", &posted.name)?;
    let section: SectionRecord = sqlx::query_as("INSERT INTO sections (name) VALUES (?) RETURNING id, name")
        .bind(&name)
        .fetch_one(&db.0).await
        .map_err(|e| duplicate(e, "Section", &name))?;
    Ok(Reply::created(section).message("Section created"))
}

#[derive(Deserialize, Debug)]
struct PostedLevel {
    section_id: SectionId,
    name: String,
}

#[get("/levels?<section_id>")]
async fn get_levels(section_id: Option<SectionId>, db: &State<DbPool>) -> ApiResult<Vec<LevelRecord>> {
    let levels = list_query("levels", "section_id", section_id)
        .build_query_as::<LevelRecord>()
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(levels))
}

#[post("/levels", data = "<posted>")]
async fn post_level(posted: Json<PostedLevel>, user: ActingUser, db: &State<DbPool>) -> ApiResult<LevelRecord> {
    user.require(Capability::ManageStructure)?;
    let name = required_name("name", &posted.name)?;
    require_parent("sections", "Section", posted.section_id, &db.0).await?;
    let level: LevelRecord = sqlx::query_as("INSERT INTO levels (section_id, name) VALUES (?, ?) RETURNING id, section_id, name")
        .bind(posted.section_id)
        .bind(&name)
        .fetch_one(&db.0).await
        .map_err(|e| duplicate(e, "Level", &name))?;
    Ok(Reply::created(level).message("Level created"))
}

#[derive(Deserialize, Debug)]
struct PostedClass {
    level_id: LevelId,
    name: String,
}

#[get("/classes?<level_id>")]
async fn get_classes(level_id: Option<LevelId>, db: &State<DbPool>) -> ApiResult<Vec<ClassRecord>> {
    let classes = list_query("school_classes", "level_id", level_id)
        .build_query_as::<ClassRecord>()
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(classes))
}

#[post("/classes", data = "<posted>")]
async fn post_class(posted: Json<PostedClass>, user: ActingUser, db: &State<DbPool>) -> ApiResult<ClassRecord> {
    user.require(Capability::ManageStructure)?;
    let name = required_name("name", &posted.name)?;
    require_parent("levels", "Level", posted.level_id, &db.0).await?;
    let class: ClassRecord = sqlx::query_as("INSERT INTO school_classes (level_id, name) VALUES (?, ?) RETURNING id, level_id, name")
        .bind(posted.level_id)
        .bind(&name)
        .fetch_one(&db.0).await
        .map_err(|e| duplicate(e, "Class", &name))?;
    Ok(Reply::created(class).message("Class created"))
}

#[derive(Deserialize, Debug)]
struct PostedSeries {
    school_class_id: ClassId,
    name: String,
}

#[get("/series?<class_id>")]
async fn get_series(class_id: Option<ClassId>, db: &State<DbPool>) -> ApiResult<Vec<SeriesRecord>> {
    let series = list_query("series", "class_id", class_id)
        .build_query_as::<SeriesRecord>()
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(series))
}

#[post("/series", data = "<posted>")]
async fn post_series(posted: Json<PostedSeries>, user: ActingUser, db: &State<DbPool>) -> ApiResult<SeriesRecord> {
    user.require(Capability::ManageStructure)?;
    let name = required_name("name", &posted.name)?;
    require_class(posted.school_class_id, &db.0).await?;
    let series: SeriesRecord = sqlx::query_as("INSERT INTO series (class_id, name) VALUES (?, ?) RETURNING id, class_id, name")
        .bind(posted.school_class_id)
        .bind(&name)
        .fetch_one(&db.0).await
        .map_err(|e| duplicate(e, "Series", &name))?;
    Ok(Reply::created(series).message("Series created"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_sections,
            post_section,
            get_levels,
            post_level,
            get_classes,
            post_class,
            get_series,
            post_series,
        ])
}
