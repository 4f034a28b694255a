use std::str::FromStr;
use chrono::NaiveDateTime;
use rocket::local::blocking::{Client, LocalResponse};
use rocket::figment::Figment;
use rocket::http::{ContentType, Header, Status};
use sqlx::SqlitePool;
use serde_json::{json, Value};
use crate::clock::Clock;
use crate::db::DbPool;

const ADMIN_ID: i64 = 1;

struct TestServer {
    client: Client,
    clock: Clock,
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::from_str(s).unwrap()
}

fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(("database_url", "sqlite::memory:"))
        .merge(("bootstrap_admin_email", "admin@school.test"))
        .merge(("bootstrap_admin_name", "Admin"))
        .merge(("log_level", "off"))
}

fn create_test_server() -> TestServer {
    let clock = Clock::fixed(at("2025-03-04T08:00:00"));
    let client = Client::tracked(super::build(test_figment(), clock.clone())).unwrap();
    TestServer { client, clock }
}

fn as_user(id: i64) -> Header<'static> {
    Header::new("x-user-id", id.to_string())
}

fn json_body(resp: LocalResponse) -> Value {
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    resp.into_json::<Value>().unwrap()
}

impl TestServer {
    fn post(&self, user: i64, uri: &str, payload: Value) -> (Status, Value) {
        let resp = self.client.post(uri.to_string())
            .header(as_user(user))
            .json(&payload)
            .dispatch();
        (resp.status(), json_body(resp))
    }
    fn put(&self, user: i64, uri: &str, payload: Value) -> (Status, Value) {
        let resp = self.client.put(uri.to_string())
            .header(as_user(user))
            .json(&payload)
            .dispatch();
        (resp.status(), json_body(resp))
    }
    fn get(&self, user: i64, uri: &str) -> (Status, Value) {
        let resp = self.client.get(uri.to_string())
            .header(as_user(user))
            .dispatch();
        (resp.status(), json_body(resp))
    }
    fn created_id(&self, uri: &str, payload: Value) -> i64 {
        let (status, body) = self.post(ADMIN_ID, uri, payload);
        assert_eq!(status, Status::Created, "POST {uri}: {body}");
        body["data"]["id"].as_i64().unwrap()
    }
    fn scan(&self, supervisor_id: i64, qr: &str) -> (Status, Value) {
        let resp = self.client.post("/supervisor/scan")
            .json(&json!({ "student_qr_code": qr, "supervisor_id": supervisor_id }))
            .dispatch();
        (resp.status(), json_body(resp))
    }
    fn scan_exit(&self, supervisor_id: i64, qr: &str) -> (Status, Value) {
        let resp = self.client.post("/supervisor/scan-exit")
            .json(&json!({ "student_qr_code": qr, "supervisor_id": supervisor_id }))
            .dispatch();
        (resp.status(), json_body(resp))
    }
}

struct School {
    year: i64,
    class_a: i64,
    class_b: i64,
    supervisor: i64,
    other_supervisor: i64,
    student: i64,
    student_b: i64,
}

fn create_school(server: &TestServer) -> School {
    let year = server.created_id("/years", json!({ "name": "2024-2025", "start_date": "2024-09-01", "end_date": "2025-07-31" }));
    let (status, _) = server.post(ADMIN_ID, &format!("/years/{year}/current"), json!({}));
    assert_eq!(status, Status::Ok);
    let section = server.created_id("/sections", json!({ "name": "Secondaire" }));
    let level = server.created_id("/levels", json!({ "section_id": section, "name": "6e" }));
    let class_a = server.created_id("/classes", json!({ "level_id": level, "name": "6e A" }));
    let class_b = server.created_id("/classes", json!({ "level_id": level, "name": "6e B" }));
    let supervisor = server.created_id("/users", json!({ "name": "Sam Supervisor", "email": "sam@school.test", "role": "supervisor" }));
    let other_supervisor = server.created_id("/users", json!({ "name": "Sia Supervisor", "email": "sia@school.test", "role": "supervisor" }));
    let (status, body) = server.post(ADMIN_ID, "/supervisor/assign", json!({ "supervisor_id": supervisor, "school_class_id": class_a, "school_year_id": year }));
    assert_eq!(status, Status::Created, "{body}");
    let student = server.created_id("/students", json!({ "first_name": "Awa", "last_name": "Diallo", "school_class_id": class_a }));
    let student_b = server.created_id("/students", json!({ "first_name": "Binta", "last_name": "Camara", "school_class_id": class_b }));
    School { year, class_a, class_b, supervisor, other_supervisor, student, student_b }
}

#[test]
fn check_in_once_per_day() {
    let server = create_test_server();
    let school = create_school(&server);

    let (status, body) = server.scan(school.supervisor, &format!("STUDENT_ID_{}", school.student));
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["student_name"], "Awa Diallo");
    assert_eq!(body["data"]["class_name"], "6e A");
    assert_eq!(body["data"]["time"], "08:00");
    assert_eq!(body["data"]["date"], "04/03/2025");
    assert_eq!(body["data"]["year_id"], school.year);

    server.clock.set(at("2025-03-04T08:05:00"));
    let (status, body) = server.scan(school.supervisor, &format!("STUDENT_ID_{}", school.student));
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "already_marked_today");
    assert_eq!(body["data"]["arrival_time"], "08:00");

    // next day is a fresh record
    server.clock.set(at("2025-03-05T07:50:00"));
    let (status, body) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["data"]["time"], "07:50");
}

#[test]
fn check_in_rejections() {
    let server = create_test_server();
    let school = create_school(&server);

    let (status, body) = server.scan(school.other_supervisor, &format!("STUDENT_ID_{}", school.student));
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["error"], "not_authorized_for_class");
    assert_eq!(body["data"]["student_name"], "Awa Diallo");
    assert_eq!(body["data"]["class_name"], "6e A");

    let (status, body) = server.scan(school.supervisor, &format!("STUDENT_ID_{}", school.student_b));
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["data"]["class_name"], "6e B");

    let (status, body) = server.scan(school.supervisor, "STUDENT_42");
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "invalid_qr_format");
    assert!(body["errors"]["student_qr_code"].is_array());

    let (status, body) = server.scan(school.supervisor, "STUDENT_ID_9999");
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["error"], "student_not_found");

    // no record was written by the rejected scans
    let (status, body) = server.get(ADMIN_ID, "/attendance/daily?date=2025-03-04");
    assert_eq!(status, Status::Ok);
    assert_eq!(body["data"]["present"], 0);
}

#[test]
fn deactivated_assignment_is_not_authorized() {
    let server = create_test_server();
    let school = create_school(&server);
    let (_, body) = server.get(ADMIN_ID, &format!("/supervisor/{}/assignments", school.supervisor));
    let assignment = body["data"][0]["id"].as_i64().unwrap();
    let (status, _) = server.post(ADMIN_ID, &format!("/supervisor/assignments/{assignment}/deactivate"), json!({}));
    assert_eq!(status, Status::Ok);
    let (status, _) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Forbidden);
}

#[test]
fn exit_requires_entry() {
    let server = create_test_server();
    let school = create_school(&server);
    let qr = format!("STUDENT_ID_{}", school.student);

    let (status, body) = server.scan_exit(school.supervisor, &qr);
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "no_entry_today");

    let (status, _) = server.scan(school.supervisor, &qr);
    assert_eq!(status, Status::Ok);
    server.clock.set(at("2025-03-04T16:30:00"));
    let (status, body) = server.scan_exit(school.supervisor, &qr);
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["data"]["event_type"], "exit");

    let (status, body) = server.scan_exit(school.supervisor, &qr);
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "already_exited_today");
    assert_eq!(body["data"]["exit_time"], "16:30");

    let (_, body) = server.get(ADMIN_ID, "/attendance/daily?date=2025-03-04");
    let row = body["data"]["students"].as_array().unwrap().iter()
        .find(|r| r["student_id"] == school.student)
        .cloned()
        .unwrap();
    assert_eq!(row["arrival_time"], "08:00");
    assert_eq!(row["exit_time"], "16:30");
}

#[test]
fn scan_without_active_year() {
    let server = create_test_server();
    let (status, body) = server.scan(ADMIN_ID, "STUDENT_ID_1");
    // the student lookup comes before the year lookup
    assert_eq!(status, Status::NotFound, "{body}");

    let year = server.created_id("/years", json!({ "name": "2019-2020", "start_date": "2019-09-01", "end_date": "2020-07-31", "is_active": false }));
    let section = server.created_id("/sections", json!({ "name": "Secondaire" }));
    let level = server.created_id("/levels", json!({ "section_id": section, "name": "6e" }));
    let class = server.created_id("/classes", json!({ "level_id": level, "name": "6e A" }));
    let supervisor = server.created_id("/users", json!({ "name": "Sam Supervisor", "email": "sam@school.test", "role": "supervisor" }));
    server.created_id("/supervisor/assign", json!({ "supervisor_id": supervisor, "school_class_id": class, "school_year_id": year }));
    let student = server.created_id("/students", json!({ "first_name": "Awa", "last_name": "Diallo", "school_class_id": class, "school_year_id": year }));

    let (status, body) = server.scan(supervisor, &student.to_string());
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "no_active_year");
}

#[test]
fn current_year_cannot_be_deactivated() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, body) = server.put(ADMIN_ID, &format!("/years/{}", school.year), json!({ "name": "2024-2025", "start_date": "2024-09-01", "end_date": "2025-07-31", "is_active": false }));
    assert_eq!(status, Status::UnprocessableEntity, "{body}");
    assert!(body["errors"]["is_active"].is_array());
}

#[test]
fn single_current_year() {
    let server = create_test_server();
    let y1 = server.created_id("/years", json!({ "name": "2023-2024", "start_date": "2023-09-01", "end_date": "2024-07-31" }));
    let y2 = server.created_id("/years", json!({ "name": "2024-2025", "start_date": "2024-09-01", "end_date": "2025-07-31" }));
    let (status, _) = server.get(ADMIN_ID, "/years/current");
    assert_eq!(status, Status::NotFound);

    for year in [y1, y2, y1] {
        let (status, _) = server.post(ADMIN_ID, &format!("/years/{year}/current"), json!({}));
        assert_eq!(status, Status::Ok);
        let (_, body) = server.get(ADMIN_ID, "/years");
        let current: Vec<i64> = body["data"].as_array().unwrap().iter()
            .filter(|y| y["is_current"] == true)
            .map(|y| y["id"].as_i64().unwrap())
            .collect();
        assert_eq!(current, vec![year]);
    }

    let resp = server.client.delete(format!("/years/{y1}")).header(as_user(ADMIN_ID)).dispatch();
    assert_eq!(resp.status(), Status::UnprocessableEntity);
    assert_eq!(json_body(resp)["error"], "year_is_current");

    let (status, body) = server.post(ADMIN_ID, "/years", json!({ "name": "2024-2025", "start_date": "2024-09-01", "end_date": "2025-07-31" }));
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "duplicate_year");

    let (status, body) = server.post(ADMIN_ID, "/years", json!({ "name": "Backwards", "start_date": "2025-09-01", "end_date": "2025-07-31" }));
    assert_eq!(status, Status::UnprocessableEntity);
    assert!(body["errors"]["end_date"].is_array());
}

#[test]
fn working_year_falls_back_from_inactive_preference() {
    let server = create_test_server();
    let y1 = server.created_id("/years", json!({ "name": "2023-2024", "start_date": "2023-09-01", "end_date": "2024-07-31" }));
    let y2 = server.created_id("/years", json!({ "name": "2024-2025", "start_date": "2024-09-01", "end_date": "2025-07-31" }));
    let (status, _) = server.get(ADMIN_ID, "/me/working-year");
    // active years exist, no current and no preference
    assert_eq!(status, Status::Ok);

    let (status, _) = server.post(ADMIN_ID, &format!("/years/{y2}/current"), json!({}));
    assert_eq!(status, Status::Ok);
    let (status, body) = server.put(ADMIN_ID, "/me/working-year", json!({ "school_year_id": y1 }));
    assert_eq!(status, Status::Ok, "{body}");
    let (_, body) = server.get(ADMIN_ID, "/me/working-year");
    assert_eq!(body["data"]["id"], y1);

    let (status, _) = server.put(ADMIN_ID, &format!("/years/{y1}"), json!({ "name": "2023-2024", "start_date": "2023-09-01", "end_date": "2024-07-31", "is_active": false }));
    assert_eq!(status, Status::Ok);
    let (_, body) = server.get(ADMIN_ID, "/me/working-year");
    assert_eq!(body["data"]["id"], y2);

    let (status, _) = server.put(ADMIN_ID, "/me/working-year", json!({ "school_year_id": y1 }));
    assert_eq!(status, Status::UnprocessableEntity);
    let (status, _) = server.put(ADMIN_ID, "/me/working-year", json!({ "school_year_id": 999 }));
    assert_eq!(status, Status::NotFound);
}

#[test]
fn no_working_year_configured() {
    let server = create_test_server();
    let (status, body) = server.get(ADMIN_ID, "/me/working-year");
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "no_working_year");
}

#[test]
fn supervisor_reports() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, _) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Ok);

    let uri = format!("/supervisor/daily-attendance?supervisor_id={}&date=2025-03-04", school.supervisor);
    let (status, first) = server.get(ADMIN_ID, &uri);
    assert_eq!(status, Status::Ok);
    let (_, second) = server.get(ADMIN_ID, &uri);
    assert_eq!(first, second);
    assert_eq!(first["data"]["total"], 1);
    assert_eq!(first["data"]["records"][0]["time"], "08:00");

    let (status, body) = server.get(ADMIN_ID, &format!("/supervisor/daily-attendance?supervisor_id={}&date=2025-03-04", school.other_supervisor));
    assert_eq!(status, Status::Ok);
    assert_eq!(body["data"]["total"], 0);

    let (status, body) = server.get(ADMIN_ID, &format!("{uri}&class_id={}", school.class_b));
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["error"], "not_authorized_for_class");

    let (status, body) = server.get(ADMIN_ID, &format!("/supervisor/attendance-range?supervisor_id={}&start_date=2025-03-01&end_date=2025-03-31&class_id={}", school.supervisor, school.class_a));
    assert_eq!(status, Status::Ok);
    assert_eq!(body["data"]["total"], 1);

    let (status, _) = server.get(ADMIN_ID, &format!("/supervisor/attendance-range?supervisor_id={}&start_date=2025-03-31&end_date=2025-03-01", school.supervisor));
    assert_eq!(status, Status::UnprocessableEntity);
}

#[test]
fn daily_roster_counts_absent_students() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, _) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Ok);

    let (status, body) = server.get(ADMIN_ID, "/attendance/daily?date=2025-03-04");
    assert_eq!(status, Status::Ok);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["present"], 1);
    assert_eq!(body["data"]["absent"], 1);

    let (_, body) = server.get(ADMIN_ID, &format!("/attendance/daily?date=2025-03-04&class_id={}", school.class_b));
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["students"][0]["present"], false);

    let resp = server.client.get("/attendance/daily.csv?date=2025-03-04")
        .header(as_user(ADMIN_ID))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::CSV));
    let csv = resp.into_string().unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("student_id,matricule,student_name"));
    assert_eq!(lines.count(), 2);

    // supervisors may read the roster but not change structure
    let (status, body) = server.get(school.supervisor, "/attendance/daily?date=2025-03-04");
    assert_eq!(status, Status::Ok, "{body}");
    let (status, body) = server.post(school.supervisor, "/sections", json!({ "name": "Primaire" }));
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["error"], "forbidden");
}

#[test]
fn duplicate_supervisor_assignment() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, body) = server.post(ADMIN_ID, "/supervisor/assign", json!({ "supervisor_id": school.supervisor, "school_class_id": school.class_a, "school_year_id": school.year }));
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "duplicate_assignment");

    let teacher = server.created_id("/users", json!({ "name": "Tom Teacher", "email": "tom@school.test", "role": "teacher" }));
    let (status, body) = server.post(ADMIN_ID, "/supervisor/assign", json!({ "supervisor_id": teacher, "school_class_id": school.class_a, "school_year_id": school.year }));
    assert_eq!(status, Status::UnprocessableEntity);
    assert!(body["errors"]["supervisor_id"].is_array());
}

#[test]
fn scholarship_batch_is_best_effort() {
    let server = create_test_server();
    let school = create_school(&server);
    let scholarship = server.created_id("/scholarships", json!({ "name": "Excellence", "amount": 50000 }));
    let (status, body) = server.post(ADMIN_ID, &format!("/scholarships/{scholarship}/assign"), json!({ "student_ids": [school.student] }));
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["data"]["assigned_count"], 1);

    let third = server.created_id("/students", json!({ "first_name": "Chérif", "last_name": "Bah", "school_class_id": school.class_a }));
    let (status, body) = server.post(ADMIN_ID, &format!("/scholarships/{scholarship}/assign"), json!({ "student_ids": [school.student, school.student_b, third] }));
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["data"]["assigned_count"], 2);
    let errors = body["data"]["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["item"], school.student);

    let (status, body) = server.post(ADMIN_ID, &format!("/scholarships/{scholarship}/assign"), json!({ "student_ids": [4242] }));
    assert_eq!(status, Status::Ok);
    assert_eq!(body["data"]["assigned_count"], 0);
    assert_eq!(body["data"]["errors"][0]["item"], 4242);

    let (status, _) = server.post(ADMIN_ID, "/scholarships", json!({ "name": "Negative", "amount": -1 }));
    assert_eq!(status, Status::UnprocessableEntity);
}

#[test]
fn teacher_batch_requires_teacher() {
    let server = create_test_server();
    let school = create_school(&server);
    let teacher = server.created_id("/users", json!({ "name": "Tom Teacher", "email": "tom@school.test", "role": "teacher" }));
    let items = json!({ "items": [
        { "school_class_id": school.class_a, "subject": "Maths" },
        { "school_class_id": school.class_a, "subject": "Maths" },
        { "school_class_id": 777, "subject": "Physics" },
        { "school_class_id": school.class_b, "subject": "Maths" },
    ] });
    let (status, body) = server.post(ADMIN_ID, &format!("/teachers/{teacher}/assignments"), items.clone());
    assert_eq!(status, Status::Ok, "{body}");
    assert_eq!(body["data"]["assigned_count"], 2);
    assert_eq!(body["data"]["errors"].as_array().unwrap().len(), 2);

    let (_, body) = server.get(teacher, &format!("/teachers/{teacher}/assignments"));
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, _) = server.post(ADMIN_ID, &format!("/teachers/{}/assignments", school.supervisor), items);
    assert_eq!(status, Status::Forbidden);
}

#[test]
fn student_qr_matches_scan_format() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, body) = server.get(ADMIN_ID, &format!("/students/{}/qr", school.student));
    assert_eq!(status, Status::Ok);
    let payload = body["data"]["payload"].as_str().unwrap().to_string();
    assert_eq!(payload, format!("STUDENT_ID_{}", school.student));
    let (status, _) = server.scan(school.supervisor, &payload);
    assert_eq!(status, Status::Ok);

    let resp = server.client.get(format!("/students/{}/qr", school.student)).dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
    let resp = server.client.get(format!("/students/{}", school.student)).dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
}

#[test]
fn unknown_acting_user_is_rejected() {
    let server = create_test_server();
    let (status, body) = server.get(4242, "/users");
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["success"], false);
    let resp = server.client.get("/users").dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
}

#[test]
fn second_supervisor_sees_first_arrival() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, body) = server.post(ADMIN_ID, "/supervisor/assign", json!({ "supervisor_id": school.other_supervisor, "school_class_id": school.class_a, "school_year_id": school.year }));
    assert_eq!(status, Status::Created, "{body}");

    let (status, _) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Ok);
    server.clock.set(at("2025-03-04T08:10:00"));
    let (status, body) = server.scan(school.other_supervisor, &school.student.to_string());
    assert_eq!(status, Status::UnprocessableEntity);
    assert_eq!(body["error"], "already_marked_today");
    assert_eq!(body["data"]["arrival_time"], "08:00");
}

#[test]
fn entry_from_previous_current_year_blocks_rescan() {
    let server = create_test_server();
    let school = create_school(&server);
    let (status, _) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::Ok);

    // a new year becomes current during the day
    let next_year = server.created_id("/years", json!({ "name": "2025-2026", "start_date": "2025-03-01", "end_date": "2026-07-31" }));
    let (status, _) = server.post(ADMIN_ID, &format!("/years/{next_year}/current"), json!({}));
    assert_eq!(status, Status::Ok);
    let (status, _) = server.post(ADMIN_ID, "/supervisor/assign", json!({ "supervisor_id": school.supervisor, "school_class_id": school.class_a, "school_year_id": next_year }));
    assert_eq!(status, Status::Created);

    server.clock.set(at("2025-03-04T08:05:00"));
    let (status, body) = server.scan(school.supervisor, &school.student.to_string());
    assert_eq!(status, Status::UnprocessableEntity, "{body}");
    assert_eq!(body["error"], "already_marked_today");
    assert_eq!(body["data"]["arrival_time"], "08:00");
}

#[test]
fn ledger_queries_are_ordered() {
    let server = create_test_server();
    let school = create_school(&server);
    let early = server.created_id("/students", json!({ "first_name": "Chérif", "last_name": "Bah", "school_class_id": school.class_a }));

    server.clock.set(at("2025-03-04T08:20:00"));
    assert_eq!(server.scan(school.supervisor, &school.student.to_string()).0, Status::Ok);
    server.clock.set(at("2025-03-04T07:55:00"));
    assert_eq!(server.scan(school.supervisor, &early.to_string()).0, Status::Ok);
    server.clock.set(at("2025-03-05T07:40:00"));
    assert_eq!(server.scan(school.supervisor, &school.student.to_string()).0, Status::Ok);

    let (_, body) = server.get(ADMIN_ID, &format!("/supervisor/daily-attendance?supervisor_id={}&date=2025-03-04", school.supervisor));
    let times: Vec<&str> = body["data"]["records"].as_array().unwrap().iter()
        .map(|r| r["time"].as_str().unwrap())
        .collect();
    assert_eq!(times, vec!["07:55", "08:20"]);

    let (_, body) = server.get(ADMIN_ID, &format!("/supervisor/attendance-range?supervisor_id={}&start_date=2025-03-01&end_date=2025-03-31", school.supervisor));
    let scans: Vec<(&str, &str)> = body["data"]["records"].as_array().unwrap().iter()
        .map(|r| (r["date"].as_str().unwrap(), r["time"].as_str().unwrap()))
        .collect();
    assert_eq!(scans, vec![("2025-03-05", "07:40"), ("2025-03-04", "08:20"), ("2025-03-04", "07:55")]);
}

mod collisions {
    use super::*;
    use rocket::local::asynchronous::Client;

    struct Seeded {
        supervisor: i64,
        student: i64,
        class: i64,
        previous_year: i64,
        current_year: i64,
    }

    async fn seed(pool: &SqlitePool) -> Seeded {
        let (previous_year,): (i64,) = sqlx::query_as("INSERT INTO academic_years (name, start_date, end_date, is_current, is_active)
                    VALUES ('2023-2024', '2023-09-01', '2024-07-31', 0, 1) RETURNING id")
            .fetch_one(pool).await.unwrap();
        let (current_year,): (i64,) = sqlx::query_as("INSERT INTO academic_years (name, start_date, end_date, is_current, is_active)
                    VALUES ('2024-2025', '2024-09-01', '2025-07-31', 1, 1) RETURNING id")
            .fetch_one(pool).await.unwrap();
        let (section,): (i64,) = sqlx::query_as("INSERT INTO sections (name) VALUES ('Secondaire') RETURNING id")
            .fetch_one(pool).await.unwrap();
        let (level,): (i64,) = sqlx::query_as("INSERT INTO levels (section_id, name) VALUES (?, '6e') RETURNING id")
            .bind(section)
            .fetch_one(pool).await.unwrap();
        let (class,): (i64,) = sqlx::query_as("INSERT INTO school_classes (level_id, name) VALUES (?, '6e A') RETURNING id")
            .bind(level)
            .fetch_one(pool).await.unwrap();
        let (supervisor,): (i64,) = sqlx::query_as("INSERT INTO users (name, email, role) VALUES ('Sam', 'sam@school.test', 'supervisor') RETURNING id")
            .fetch_one(pool).await.unwrap();
        sqlx::query("INSERT INTO supervisor_assignments (supervisor_id, class_id, year_id) VALUES (?, ?, ?)")
            .bind(supervisor)
            .bind(class)
            .bind(current_year)
            .execute(pool).await.unwrap();
        let (student,): (i64,) = sqlx::query_as("INSERT INTO students (matricule, first_name, last_name, class_id, year_id)
                    VALUES ('M0001', 'Awa', 'Diallo', ?, ?) RETURNING id")
            .bind(class)
            .bind(current_year)
            .fetch_one(pool).await.unwrap();
        Seeded { supervisor, student, class, previous_year, current_year }
    }

    async fn insert_event(pool: &SqlitePool, seeded: &Seeded, year_id: i64, event_type: &str, scanned_at: &str) {
        let scanned_at = at(scanned_at);
        sqlx::query("INSERT INTO attendance_records (student_id, supervisor_id, class_id, year_id, date, event_type, scanned_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)")
            .bind(seeded.student)
            .bind(seeded.supervisor)
            .bind(seeded.class)
            .bind(year_id)
            .bind(scanned_at.date())
            .bind(event_type)
            .bind(scanned_at)
            .execute(pool).await.unwrap();
    }

    async fn scan(client: &Client, uri: &str, seeded: &Seeded) -> (Status, Value) {
        let resp = client.post(uri.to_string())
            .json(&json!({ "student_qr_code": seeded.student.to_string(), "supervisor_id": seeded.supervisor }))
            .dispatch().await;
        (resp.status(), resp.into_json::<Value>().await.unwrap())
    }

    // rows keyed on (student, date, event type) that the year scoped lookups do not see
    #[rocket::async_test]
    async fn entry_insert_collision_reports_arrival() {
        let clock = Clock::fixed(at("2025-03-04T08:00:00"));
        let client = Client::tracked(crate::build(test_figment(), clock)).await.unwrap();
        let pool = client.rocket().state::<DbPool>().unwrap().0.clone();
        let seeded = seed(&pool).await;
        insert_event(&pool, &seeded, seeded.previous_year, "entry", "2025-03-04T07:45:00").await;

        let (status, body) = scan(&client, "/supervisor/scan", &seeded).await;
        assert_eq!(status, Status::UnprocessableEntity, "{body}");
        assert_eq!(body["error"], "already_marked_today");
        assert_eq!(body["data"]["arrival_time"], "07:45");
    }

    #[rocket::async_test]
    async fn exit_insert_collision_reports_exit_time() {
        let clock = Clock::fixed(at("2025-03-04T16:30:00"));
        let client = Client::tracked(crate::build(test_figment(), clock)).await.unwrap();
        let pool = client.rocket().state::<DbPool>().unwrap().0.clone();
        let seeded = seed(&pool).await;
        insert_event(&pool, &seeded, seeded.current_year, "entry", "2025-03-04T08:00:00").await;
        insert_event(&pool, &seeded, seeded.previous_year, "exit", "2025-03-04T16:00:00").await;

        let (status, body) = scan(&client, "/supervisor/scan-exit", &seeded).await;
        assert_eq!(status, Status::UnprocessableEntity, "{body}");
        assert_eq!(body["error"], "already_exited_today");
        assert_eq!(body["data"]["exit_time"], "16:00");
    }
}
