//! QR check-in of students by supervisors.
//!
//! A scan goes through: decode the QR payload, resolve the student, resolve the
//! active year, check the supervisor's assignment to the student's class, check for
//! an earlier event of the same kind that day, then append to the ledger.
//! Any step may reject the scan with a [`Rejection`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use chrono::{NaiveDate, NaiveDateTime};
use log::{error, info, warn};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use crate::api::{ApiError, ApiResult, Reply};
use crate::attendance::{find_day_event, find_event, has_entry_today, record_entry, record_exit, AttendanceRecord, EventType, Scan};
use crate::clock::{display_date, hhmm, Now};
use crate::db::DbPool;
use crate::structure::{load_class, ClassRecord};
use crate::students::{load_student, StudentId, StudentRecord};
use crate::supervision::is_authorized;
use crate::users::UserId;
use crate::years::{active_year, AcademicYear, YearId};

const QR_PREFIX: &str = "STUDENT_ID_";

/// Payload printed on a student card: `STUDENT_ID_<id>`, a bare `<id>` is accepted too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StudentQr(pub StudentId);

impl FromStr for StudentQr {
    type Err = Rejection;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix(QR_PREFIX).unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Rejection::InvalidQrFormat);
        }
        digits.parse::<StudentId>()
            .map(StudentQr)
            .map_err(|_| Rejection::InvalidQrFormat)
    }
}

impl Display for StudentQr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{QR_PREFIX}{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    InvalidQrFormat,
    StudentNotFound { student_id: StudentId },
    NoActiveYear,
    NotAuthorizedForClass { student_name: String, class_name: String },
    AlreadyMarkedToday { student_name: String, arrival_time: String },
    NoEntryToday { student_name: String },
    AlreadyExitedToday { student_name: String, exit_time: String },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidQrFormat => "invalid_qr_format",
            Rejection::StudentNotFound { .. } => "student_not_found",
            Rejection::NoActiveYear => "no_active_year",
            Rejection::NotAuthorizedForClass { .. } => "not_authorized_for_class",
            Rejection::AlreadyMarkedToday { .. } => "already_marked_today",
            Rejection::NoEntryToday { .. } => "no_entry_today",
            Rejection::AlreadyExitedToday { .. } => "already_exited_today",
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        let code = rejection.code();
        let err = match rejection {
            Rejection::InvalidQrFormat => ApiError::validation("student_qr_code", "expected STUDENT_ID_<number> or <number>"),
            Rejection::StudentNotFound { student_id } => ApiError::not_found(format!("Student id={student_id} not found"))
                .data(json!({ "student_id": student_id })),
            Rejection::NoActiveYear => ApiError::precondition("No active academic year"),
            Rejection::NotAuthorizedForClass { student_name, class_name } => {
                ApiError::forbidden(format!("You are not assigned to class {class_name}"))
                    .data(json!({ "student_name": student_name, "class_name": class_name }))
            }
            Rejection::AlreadyMarkedToday { student_name, arrival_time } => {
                ApiError::conflict(format!("{student_name} was already marked present at {arrival_time}"))
                    .data(json!({ "student_name": student_name, "arrival_time": arrival_time }))
            }
            Rejection::NoEntryToday { student_name } => {
                ApiError::conflict(format!("{student_name} has no entry recorded today"))
                    .data(json!({ "student_name": student_name }))
            }
            Rejection::AlreadyExitedToday { student_name, exit_time } => {
                ApiError::conflict(format!("{student_name} already left at {exit_time}"))
                    .data(json!({ "student_name": student_name, "exit_time": exit_time }))
            }
        };
        err.code(code)
    }
}

#[derive(Debug)]
enum ScanError {
    Rejected(Rejection),
    Db(sqlx::Error),
}
impl From<Rejection> for ScanError {
    fn from(value: Rejection) -> Self {
        ScanError::Rejected(value)
    }
}
impl From<sqlx::Error> for ScanError {
    fn from(value: sqlx::Error) -> Self {
        ScanError::Db(value)
    }
}
impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Rejected(rejection) => rejection.into(),
            ScanError::Db(err) => err.into(),
        }
    }
}

/// Accepted scan returned to the scanning device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckIn {
    pub attendance_id: i64,
    pub student_id: StudentId,
    pub student_name: String,
    pub class_name: String,
    pub year_id: YearId,
    pub event_type: EventType,
    pub scanned_at: NaiveDateTime,
    pub time: String,
    pub date: String,
}
impl CheckIn {
    fn new(record: &AttendanceRecord, granted: &Granted) -> Self {
        Self {
            attendance_id: record.id,
            student_id: record.student_id,
            student_name: granted.student.display_name(),
            class_name: granted.class.name.clone(),
            year_id: record.year_id,
            event_type: record.event_type,
            scanned_at: record.scanned_at,
            time: hhmm(&record.scanned_at),
            date: display_date(&record.date),
        }
    }
}

struct Granted {
    student: StudentRecord,
    class: ClassRecord,
    year: AcademicYear,
    supervisor_id: UserId,
}
impl Granted {
    fn scan(&self, scanned_at: NaiveDateTime) -> Scan {
        Scan {
            student_id: self.student.id,
            supervisor_id: self.supervisor_id,
            class_id: self.student.class_id,
            year_id: self.year.id,
            scanned_at,
        }
    }
}

// decode, resolve student and year, check the supervisor's assignment
async fn authorize(qr_code: &str, supervisor_id: UserId, pool: &SqlitePool) -> Result<Granted, ScanError> {
    let StudentQr(student_id) = qr_code.parse::<StudentQr>()?;
    let student = load_student(student_id, pool).await?
        .ok_or(Rejection::StudentNotFound { student_id })?;
    // the global active year, not the supervisor's working year
    let year = active_year(pool).await?
        .ok_or(Rejection::NoActiveYear)?;
    let class = load_class(student.class_id, pool).await?
        .unwrap_or_else(|| ClassRecord { id: student.class_id, level_id: 0, name: String::new() });
    if !is_authorized(supervisor_id, student.class_id, year.id, pool).await? {
        return Err(Rejection::NotAuthorizedForClass {
            student_name: student.display_name(),
            class_name: class.name,
        }.into());
    }
    Ok(Granted { student, class, year, supervisor_id })
}

async fn earlier_event(granted: &Granted, date: NaiveDate, event_type: EventType, pool: &SqlitePool) -> sqlx::Result<Option<AttendanceRecord>> {
    find_event(granted.student.id, date, granted.year.id, event_type, pool).await
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

async fn check_in_entry(qr_code: &str, supervisor_id: UserId, now: NaiveDateTime, pool: &SqlitePool) -> Result<CheckIn, ScanError> {
    let granted = authorize(qr_code, supervisor_id, pool).await?;
    let already_marked = |record: AttendanceRecord| Rejection::AlreadyMarkedToday {
        student_name: granted.student.display_name(),
        arrival_time: hhmm(&record.scanned_at),
    };
    if let Some(record) = earlier_event(&granted, now.date(), EventType::Entry, pool).await? {
        return Err(already_marked(record).into());
    }
    let record = match record_entry(&granted.scan(now), pool).await {
        Ok(record) => record,
        // a concurrent scan, or a scan filed under another year, holds the day's key
        Err(err) if is_unique_violation(&err) => {
            let winner = find_day_event(granted.student.id, now.date(), EventType::Entry, pool).await?;
            return Err(match winner {
                Some(record) => already_marked(record).into(),
                None => err.into(),
            });
        }
        Err(err) => return Err(err.into()),
    };
    info!("Entry recorded, student: {}, class: {}, supervisor: {supervisor_id}", granted.student.id, granted.class.id);
    Ok(CheckIn::new(&record, &granted))
}

async fn check_out(qr_code: &str, supervisor_id: UserId, now: NaiveDateTime, pool: &SqlitePool) -> Result<CheckIn, ScanError> {
    let granted = authorize(qr_code, supervisor_id, pool).await?;
    let already_left = |record: AttendanceRecord| Rejection::AlreadyExitedToday {
        student_name: granted.student.display_name(),
        exit_time: hhmm(&record.scanned_at),
    };
    if !has_entry_today(granted.student.id, now.date(), granted.year.id, pool).await? {
        return Err(Rejection::NoEntryToday { student_name: granted.student.display_name() }.into());
    }
    if let Some(record) = earlier_event(&granted, now.date(), EventType::Exit, pool).await? {
        return Err(already_left(record).into());
    }
    let record = match record_exit(&granted.scan(now), pool).await {
        Ok(record) => record,
        Err(err) if is_unique_violation(&err) => {
            let winner = find_day_event(granted.student.id, now.date(), EventType::Exit, pool).await?;
            return Err(match winner {
                Some(record) => already_left(record).into(),
                None => err.into(),
            });
        }
        Err(err) => return Err(err.into()),
    };
    info!("Exit recorded, student: {}, class: {}, supervisor: {supervisor_id}", granted.student.id, granted.class.id);
    Ok(CheckIn::new(&record, &granted))
}

fn log_rejection(kind: &str, supervisor_id: UserId, err: &ScanError) {
    match err {
        ScanError::Rejected(rejection) => warn!("{kind} scan by supervisor {supervisor_id} rejected: {rejection:?}"),
        ScanError::Db(err) => error!("{kind} scan by supervisor {supervisor_id} failed: {err}"),
    }
}

#[derive(Deserialize, Debug)]
struct PostedScan {
    student_qr_code: String,
    supervisor_id: UserId,
}

#[post("/supervisor/scan", data = "<posted>")]
async fn post_scan(posted: Json<PostedScan>, now: Now, db: &State<DbPool>) -> ApiResult<CheckIn> {
    let check_in = check_in_entry(&posted.student_qr_code, posted.supervisor_id, now.0, &db.0).await
        .inspect_err(|e| log_rejection("entry", posted.supervisor_id, e))?;
    let message = format!("{} marked present at {}", check_in.student_name, check_in.time);
    Ok(Reply::ok(check_in).message(message))
}

#[post("/supervisor/scan-exit", data = "<posted>")]
async fn post_scan_exit(posted: Json<PostedScan>, now: Now, db: &State<DbPool>) -> ApiResult<CheckIn> {
    let check_in = check_out(&posted.student_qr_code, posted.supervisor_id, now.0, &db.0).await
        .inspect_err(|e| log_rejection("exit", posted.supervisor_id, e))?;
    let message = format!("{} left at {}", check_in.student_name, check_in.time);
    Ok(Reply::ok(check_in).message(message))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_scan,
            post_scan_exit,
        ])
}
