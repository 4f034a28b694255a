use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools;
use log::warn;
use rocket::http::ContentType;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::api::{ApiError, ApiResult, Reply};
use crate::auth::{ActingUser, Capability};
use crate::clock::Now;
use crate::db::DbPool;
use crate::impl_sqlx_text_type_encode_decode;
use crate::structure::{ClassId, SectionId, SeriesId};
use crate::students::StudentId;
use crate::supervision::assigned_class_ids;
use crate::users::UserId;
use crate::util::{parse_date, parse_opt_date};
use crate::years::{active_year, require_working_year, AcademicYear, YearId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Entry,
    Exit,
}
impl_sqlx_text_type_encode_decode!(EventType);

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Entry => f.write_str("entry"),
            EventType::Exit => f.write_str("exit"),
        }
    }
}
impl FromStr for EventType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(EventType::Entry),
            "exit" => Ok(EventType::Exit),
            _ => Err(anyhow!("Unknown attendance event type: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: StudentId,
    pub supervisor_id: UserId,
    pub class_id: ClassId,
    pub year_id: YearId,
    pub date: NaiveDate,
    pub event_type: EventType,
    pub scanned_at: NaiveDateTime,
    pub is_present: bool,
}

/// A ledger row joined with the names the front-end displays.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
pub struct AttendanceView {
    pub id: i64,
    pub student_id: StudentId,
    pub student_name: String,
    pub matricule: String,
    pub class_id: ClassId,
    pub class_name: String,
    pub supervisor_id: UserId,
    pub date: NaiveDate,
    pub event_type: EventType,
    pub scanned_at: NaiveDateTime,
    pub time: String,
}

const RECORD_COLUMNS: &str = "id, student_id, supervisor_id, class_id, year_id, date, event_type, scanned_at, is_present";
const VIEW_QUERY: &str = "SELECT r.id, r.student_id, s.first_name || ' ' || s.last_name AS student_name, s.matricule,
            r.class_id, c.name AS class_name, r.supervisor_id, r.date, r.event_type, r.scanned_at,
            strftime('%H:%M', r.scanned_at) AS time
        FROM attendance_records AS r
        JOIN students AS s ON s.id = r.student_id
        JOIN school_classes AS c ON c.id = r.class_id
        WHERE r.year_id=";

/// The scan that was accepted, as handed to the ledger.
#[derive(Clone, Copy, Debug)]
pub struct Scan {
    pub student_id: StudentId,
    pub supervisor_id: UserId,
    pub class_id: ClassId,
    pub year_id: YearId,
    pub scanned_at: NaiveDateTime,
}

pub async fn find_event(student_id: StudentId, date: NaiveDate, year_id: YearId, event_type: EventType, pool: &SqlitePool) -> sqlx::Result<Option<AttendanceRecord>> {
    sqlx::query_as(&format!("SELECT {RECORD_COLUMNS} FROM attendance_records
                WHERE student_id=? AND date=? AND year_id=? AND event_type=?"))
        .bind(student_id)
        .bind(date)
        .bind(year_id)
        .bind(event_type)
        .fetch_optional(pool).await
}

/// The event occupying the (student, date, event type) key, whatever its year.
pub async fn find_day_event(student_id: StudentId, date: NaiveDate, event_type: EventType, pool: &SqlitePool) -> sqlx::Result<Option<AttendanceRecord>> {
    sqlx::query_as(&format!("SELECT {RECORD_COLUMNS} FROM attendance_records
                WHERE student_id=? AND date=? AND event_type=?"))
        .bind(student_id)
        .bind(date)
        .bind(event_type)
        .fetch_optional(pool).await
}

pub async fn has_entry_today(student_id: StudentId, date: NaiveDate, year_id: YearId, pool: &SqlitePool) -> sqlx::Result<bool> {
    Ok(find_event(student_id, date, year_id, EventType::Entry, pool).await?.is_some())
}

/// Appends one event. The (student, date, event type) unique key rejects a concurrent duplicate.
async fn record_event(scan: &Scan, event_type: EventType, pool: &SqlitePool) -> sqlx::Result<AttendanceRecord> {
    sqlx::query_as(&format!("INSERT INTO attendance_records
                (student_id, supervisor_id, class_id, year_id, date, event_type, scanned_at, is_present)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1) RETURNING {RECORD_COLUMNS}"))
        .bind(scan.student_id)
        .bind(scan.supervisor_id)
        .bind(scan.class_id)
        .bind(scan.year_id)
        .bind(scan.scanned_at.date())
        .bind(event_type)
        .bind(scan.scanned_at)
        .fetch_one(pool).await
}

pub async fn record_entry(scan: &Scan, pool: &SqlitePool) -> sqlx::Result<AttendanceRecord> {
    record_event(scan, EventType::Entry, pool).await
}

pub async fn record_exit(scan: &Scan, pool: &SqlitePool) -> sqlx::Result<AttendanceRecord> {
    record_event(scan, EventType::Exit, pool).await
}

fn push_class_filter(qb: &mut QueryBuilder<'_, Sqlite>, classes: &[ClassId]) {
    qb.push(" AND r.class_id IN (");
    let mut separated = qb.separated(", ");
    for class_id in classes {
        separated.push_bind(*class_id);
    }
    separated.push_unseparated(")");
}

/// Events of one day, oldest first. `classes = None` means every class.
pub async fn query_by_date(date: NaiveDate, year_id: YearId, classes: Option<&[ClassId]>, pool: &SqlitePool) -> sqlx::Result<Vec<AttendanceView>> {
    if classes.is_some_and(|c| c.is_empty()) {
        return Ok(vec![]);
    }
    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_QUERY);
    qb.push_bind(year_id);
    qb.push(" AND r.date=");
    qb.push_bind(date);
    if let Some(classes) = classes {
        push_class_filter(&mut qb, classes);
    }
    qb.push(" ORDER BY r.scanned_at ASC, r.id ASC");
    qb.build_query_as::<AttendanceView>().fetch_all(pool).await
}

/// Events between two dates inclusive, newest first.
pub async fn query_by_range(start: NaiveDate, end: NaiveDate, year_id: YearId, classes: Option<&[ClassId]>, pool: &SqlitePool) -> sqlx::Result<Vec<AttendanceView>> {
    if classes.is_some_and(|c| c.is_empty()) {
        return Ok(vec![]);
    }
    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_QUERY);
    qb.push_bind(year_id);
    qb.push(" AND r.date BETWEEN ");
    qb.push_bind(start);
    qb.push(" AND ");
    qb.push_bind(end);
    if let Some(classes) = classes {
        push_class_filter(&mut qb, classes);
    }
    qb.push(" ORDER BY r.scanned_at DESC, r.id DESC");
    qb.build_query_as::<AttendanceView>().fetch_all(pool).await
}

pub async fn require_active_year(pool: &SqlitePool) -> Result<AcademicYear, ApiError> {
    active_year(pool).await?
        .ok_or_else(|| ApiError::precondition("No active academic year").code("no_active_year"))
}

// classes a supervisor may report on, narrowed by an optional class filter
async fn supervisor_scope(supervisor_id: UserId, class_id: Option<ClassId>, year_id: YearId, pool: &SqlitePool) -> Result<Vec<ClassId>, ApiError> {
    let assigned = assigned_class_ids(supervisor_id, year_id, pool).await?;
    match class_id {
        None => Ok(assigned),
        Some(class_id) if assigned.contains(&class_id) => Ok(vec![class_id]),
        Some(class_id) => {
            warn!("Supervisor {supervisor_id} asked for class {class_id}, assigned to: [{}]", assigned.iter().join(", "));
            Err(ApiError::forbidden(format!("Supervisor {supervisor_id} is not assigned to class {class_id}"))
                .code("not_authorized_for_class"))
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct DailyAttendance {
    pub date: NaiveDate,
    pub year_id: YearId,
    pub total: usize,
    pub records: Vec<AttendanceView>,
}

#[get("/supervisor/daily-attendance?<supervisor_id>&<date>&<class_id>")]
async fn get_daily_attendance(supervisor_id: UserId, date: Option<&str>, class_id: Option<ClassId>, now: Now, db: &State<DbPool>) -> ApiResult<DailyAttendance> {
    let date = parse_opt_date("date", date)?.unwrap_or(now.today());
    let year = require_active_year(&db.0).await?;
    let classes = supervisor_scope(supervisor_id, class_id, year.id, &db.0).await?;
    let records = query_by_date(date, year.id, Some(classes.as_slice()), &db.0).await?;
    Ok(Reply::ok(DailyAttendance { date, year_id: year.id, total: records.len(), records }))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RangeAttendance {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub year_id: YearId,
    pub total: usize,
    pub records: Vec<AttendanceView>,
}

#[get("/supervisor/attendance-range?<supervisor_id>&<start_date>&<end_date>&<class_id>")]
async fn get_attendance_range(supervisor_id: UserId, start_date: &str, end_date: &str, class_id: Option<ClassId>, db: &State<DbPool>) -> ApiResult<RangeAttendance> {
    let start = parse_date("start_date", start_date)?;
    let end = parse_date("end_date", end_date)?;
    if end < start {
        return Err(ApiError::validation("end_date", "must not be before start_date"));
    }
    let year = require_active_year(&db.0).await?;
    let classes = supervisor_scope(supervisor_id, class_id, year.id, &db.0).await?;
    let records = query_by_range(start, end, year.id, Some(classes.as_slice()), &db.0).await?;
    Ok(Reply::ok(RangeAttendance { start_date: start, end_date: end, year_id: year.id, total: records.len(), records }))
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
pub struct RosterRow {
    pub student_id: StudentId,
    pub matricule: String,
    pub student_name: String,
    pub class_id: ClassId,
    pub class_name: String,
    pub series_id: Option<SeriesId>,
    #[sqlx(default)]
    pub present: bool,
    pub arrival_time: Option<String>,
    pub exit_time: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct DailyRoster {
    pub date: NaiveDate,
    pub year_id: YearId,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub students: Vec<RosterRow>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RosterFilter {
    pub section_id: Option<SectionId>,
    pub class_id: Option<ClassId>,
    pub series_id: Option<SeriesId>,
}

/// Every student of the year matching `filter`, marked present when an entry exists that day.
pub async fn daily_roster(date: NaiveDate, year_id: YearId, filter: RosterFilter, pool: &SqlitePool) -> sqlx::Result<DailyRoster> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT s.id AS student_id, s.matricule, s.first_name || ' ' || s.last_name AS student_name,
            s.class_id, c.name AS class_name, s.series_id,
            strftime('%H:%M', en.scanned_at) AS arrival_time, strftime('%H:%M', ex.scanned_at) AS exit_time
        FROM students AS s
        JOIN school_classes AS c ON c.id = s.class_id
        JOIN levels AS l ON l.id = c.level_id
        LEFT JOIN attendance_records AS en ON en.student_id = s.id AND en.date=");
    qb.push_bind(date);
    qb.push(" AND en.event_type=");
    qb.push_bind(EventType::Entry);
    qb.push(" LEFT JOIN attendance_records AS ex ON ex.student_id = s.id AND ex.date=");
    qb.push_bind(date);
    qb.push(" AND ex.event_type=");
    qb.push_bind(EventType::Exit);
    qb.push(" WHERE s.year_id=");
    qb.push_bind(year_id);
    if let Some(section_id) = filter.section_id {
        qb.push(" AND l.section_id=");
        qb.push_bind(section_id);
    }
    if let Some(class_id) = filter.class_id {
        qb.push(" AND s.class_id=");
        qb.push_bind(class_id);
    }
    if let Some(series_id) = filter.series_id {
        qb.push(" AND s.series_id=");
        qb.push_bind(series_id);
    }
    qb.push(" ORDER BY c.name, s.last_name, s.first_name, s.id");
    let mut students = qb.build_query_as::<RosterRow>().fetch_all(pool).await?;
    for row in students.iter_mut() {
        row.present = row.arrival_time.is_some();
    }
    let present = students.iter().filter(|r| r.present).count();
    Ok(DailyRoster {
        date,
        year_id,
        total: students.len(),
        present,
        absent: students.len() - present,
        students,
    })
}

async fn roster_for_request(date: Option<&str>, filter: RosterFilter, now: Now, user: &ActingUser, pool: &SqlitePool) -> Result<DailyRoster, ApiError> {
    user.require(Capability::ViewAttendance)?;
    let date = parse_opt_date("date", date)?.unwrap_or(now.today());
    let year = require_working_year(&user.0, pool).await?;
    Ok(daily_roster(date, year.id, filter, pool).await?)
}

#[get("/attendance/daily?<date>&<section_id>&<class_id>&<series_id>")]
async fn get_daily_roster(date: Option<&str>, section_id: Option<SectionId>, class_id: Option<ClassId>, series_id: Option<SeriesId>, now: Now, user: ActingUser, db: &State<DbPool>) -> ApiResult<DailyRoster> {
    let filter = RosterFilter { section_id, class_id, series_id };
    Ok(Reply::ok(roster_for_request(date, filter, now, &user, &db.0).await?))
}

fn roster_csv(roster: &DailyRoster) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(vec![]);
    for row in &roster.students {
        writer.serialize(row)?;
    }
    writer.into_inner().map_err(|e| anyhow!("CSV export failed: {}", e.error()))
}

#[get("/attendance/daily.csv?<date>&<section_id>&<class_id>&<series_id>")]
async fn get_daily_roster_csv(date: Option<&str>, section_id: Option<SectionId>, class_id: Option<ClassId>, series_id: Option<SeriesId>, now: Now, user: ActingUser, db: &State<DbPool>) -> Result<(ContentType, Vec<u8>), ApiError> {
    let filter = RosterFilter { section_id, class_id, series_id };
    let roster = roster_for_request(date, filter, now, &user, &db.0).await?;
    Ok((ContentType::CSV, roster_csv(&roster)?))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_daily_attendance,
            get_attendance_range,
            get_daily_roster,
            get_daily_roster_csv,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_text() {
        assert_eq!(EventType::Entry.to_string(), "entry");
        assert_eq!("exit".parse::<EventType>().unwrap(), EventType::Exit);
        assert!("lunch".parse::<EventType>().is_err());
    }

    #[test]
    fn roster_csv_has_header_and_rows() {
        let roster = DailyRoster {
            date: NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(),
            year_id: 1,
            total: 1,
            present: 1,
            absent: 0,
            students: vec![RosterRow {
                student_id: 7,
                matricule: "AB12CD34".into(),
                student_name: "Awa Diallo".into(),
                class_id: 3,
                class_name: "6e A".into(),
                series_id: None,
                present: true,
                arrival_time: Some("08:00".into()),
                exit_time: None,
            }],
        };
        let csv = String::from_utf8(roster_csv(&roster).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("student_id,matricule,student_name,class_id,class_name,series_id,present,arrival_time,exit_time"));
        assert_eq!(lines.next(), Some("7,AB12CD34,Awa Diallo,3,6e A,,true,08:00,"));
    }
}
