#[macro_use] extern crate rocket;

use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use serde::Deserialize;
use crate::clock::Clock;
use crate::db::{DbPool, DbPoolFairing};

#[cfg(test)]
mod tests;
mod api;
mod attendance;
mod auth;
mod batch;
mod checkin;
mod clock;
mod db;
mod scholarships;
mod structure;
mod students;
mod supervision;
mod teachers;
mod users;
mod util;
mod years;

fn default_database_url() -> String {
    String::from("sqlite://school.db")
}
fn default_qr_module_size() -> u32 {
    8
}

#[derive(Deserialize, Clone, Debug)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub expose_internal_errors: bool,
    #[serde(default = "default_qr_module_size")]
    pub qr_module_size: u32,
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub bootstrap_admin_email: Option<String>,
    #[serde(default)]
    pub bootstrap_admin_name: Option<String>,
}

async fn bootstrap_admin(rocket: Rocket<Build>) -> rocket::fairing::Result {
    let Ok(cfg) = rocket.figment().extract::<AppConfig>() else {
        return Err(rocket);
    };
    let Some(email) = cfg.bootstrap_admin_email else {
        return Ok(rocket);
    };
    let name = cfg.bootstrap_admin_name.unwrap_or_else(|| String::from("Administrator"));
    let Some(DbPool(pool)) = rocket.state::<DbPool>() else {
        error!("Database pool not available, cannot create bootstrap admin");
        return Err(rocket);
    };
    let created = users::bootstrap_admin(&name, &email, pool).await;
    match created {
        Ok(_) => Ok(rocket),
        Err(err) => {
            error!("Bootstrap admin creation error: {err}");
            Err(rocket)
        }
    }
}

pub fn build(figment: Figment, clock: Clock) -> Rocket<Build> {
    let rocket = rocket::custom(figment)
        .attach(DbPoolFairing())
        .attach(AdHoc::try_on_ignite("Bootstrap admin", bootstrap_admin))
        .attach(AdHoc::config::<AppConfig>())
        .manage(clock);

    let rocket = api::extend(rocket);
    let rocket = auth::extend(rocket);
    let rocket = users::extend(rocket);
    let rocket = years::extend(rocket);
    let rocket = structure::extend(rocket);
    let rocket = students::extend(rocket);
    let rocket = supervision::extend(rocket);
    let rocket = attendance::extend(rocket);
    let rocket = checkin::extend(rocket);
    let rocket = scholarships::extend(rocket);
    teachers::extend(rocket)
}

#[launch]
fn rocket() -> _ {
    build(rocket::Config::figment(), Clock::System)
}
