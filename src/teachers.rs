use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::api::{ApiError, ApiResult, Reply};
use crate::auth::{ActingUser, Capability, Role};
use crate::batch::BatchOutcome;
use crate::db::DbPool;
use crate::structure::ClassId;
use crate::users::{require_user, UserId};
use crate::years::{require_working_year, require_year, YearId};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct TeacherAssignment {
    pub id: i64,
    pub teacher_id: UserId,
    pub class_id: ClassId,
    pub class_name: String,
    pub subject: String,
    pub year_id: YearId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TeachingItem {
    pub school_class_id: ClassId,
    pub subject: String,
}

#[derive(Deserialize, Debug)]
struct PostedTeaching {
    #[serde(default)]
    school_year_id: Option<YearId>,
    items: Vec<TeachingItem>,
}

#[post("/teachers/<teacher_id>/assignments", data = "<posted>")]
async fn post_assignments(teacher_id: UserId, posted: Json<PostedTeaching>, user: ActingUser, db: &State<DbPool>) -> ApiResult<BatchOutcome<TeachingItem>> {
    user.require(Capability::ManageTeaching)?;
    let teacher = require_user(teacher_id, &db.0).await?;
    if teacher.role != Role::Teacher {
        return Err(ApiError::forbidden(format!("User {} is not a teacher", teacher.name)).code("not_a_teacher"));
    }
    let year = match posted.school_year_id {
        Some(year_id) => require_year(year_id, &db.0).await?,
        None => require_working_year(&user.0, &db.0).await?,
    };
    let mut outcome = BatchOutcome::default();
    let mut txn = db.0.begin().await?;
    for item in posted.into_inner().items {
        let subject = item.subject.trim().to_string();
        if subject.is_empty() {
            outcome.failed(item, "subject must not be empty");
            continue;
        }
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM school_classes WHERE id=?")
            .bind(item.school_class_id)
            .fetch_optional(&mut *txn).await?;
        if found.is_none() {
            let message = format!("Class id={} not found", item.school_class_id);
            outcome.failed(item, message);
            continue;
        }
        let res = sqlx::query("INSERT INTO teacher_assignments (teacher_id, class_id, subject, year_id) VALUES (?, ?, ?, ?)")
            .bind(teacher.id)
            .bind(item.school_class_id)
            .bind(&subject)
            .bind(year.id)
            .execute(&mut *txn).await;
        match res {
            Ok(_) => outcome.assigned(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let message = format!("{} already teaches {subject} in this class", teacher.name);
                outcome.failed(item, message);
            }
            Err(e) => return Err(e.into()),
        }
    }
    txn.commit().await?;
    info!("Teacher {} assignments for year {}: {}", teacher.id, year.id, outcome.summary());
    let message = outcome.summary();
    Ok(Reply::ok(outcome).message(message))
}

#[get("/teachers/<teacher_id>/assignments?<year_id>")]
async fn get_assignments(teacher_id: UserId, year_id: Option<YearId>, user: ActingUser, db: &State<DbPool>) -> ApiResult<Vec<TeacherAssignment>> {
    if user.0.id != teacher_id {
        user.require(Capability::ManageTeaching)?;
    }
    let year = match year_id {
        Some(year_id) => require_year(year_id, &db.0).await?,
        None => require_working_year(&user.0, &db.0).await?,
    };
    let assignments = sqlx::query_as("SELECT t.id, t.teacher_id, t.class_id, c.name AS class_name, t.subject, t.year_id
                FROM teacher_assignments AS t
                JOIN school_classes AS c ON c.id = t.class_id
                WHERE t.teacher_id=? AND t.year_id=?
                ORDER BY c.name, t.subject")
        .bind(teacher_id)
        .bind(year.id)
        .fetch_all(&db.0).await?;
    Ok(Reply::ok(assignments))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_assignments,
            get_assignments,
        ])
}
