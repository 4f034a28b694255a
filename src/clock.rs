use std::sync::{Arc, Mutex, PoisonError};
use chrono::{FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use rocket::request::{FromRequest, Outcome};
use rocket::Request;
use crate::AppConfig;

/// Source of "now" for the service, switchable to a fixed instant.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(Arc<Mutex<NaiveDateTime>>),
}
impl Clock {
    pub fn fixed(at: NaiveDateTime) -> Self {
        Clock::Fixed(Arc::new(Mutex::new(at)))
    }
    pub fn set(&self, at: NaiveDateTime) {
        if let Clock::Fixed(current) = self {
            *current.lock().unwrap_or_else(PoisonError::into_inner) = at;
        }
    }
    pub fn local_now(&self, offset: FixedOffset) -> NaiveDateTime {
        match self {
            Clock::System => trimmed_to_sec(Utc::now().with_timezone(&offset).naive_local()),
            Clock::Fixed(at) => *at.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

pub fn trimmed_to_sec(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_nanosecond(0).unwrap_or(dt)
}

/// School-local wall clock time of the current request.
#[derive(Clone, Copy, Debug)]
pub struct Now(pub NaiveDateTime);
impl Now {
    pub fn today(&self) -> NaiveDate {
        self.0.date()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Now {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> Outcome<Now, ()> {
        let rocket = request.rocket();
        let offset_minutes = rocket.state::<AppConfig>().map(|cfg| cfg.timezone_offset_minutes).unwrap_or(0);
        let offset = school_offset(offset_minutes);
        let clock = rocket.state::<Clock>().cloned().unwrap_or_default();
        Outcome::Success(Now(clock.local_now(offset)))
    }
}

/// Offset east of UTC, out of range values fall back to UTC.
pub fn school_offset(minutes: i32) -> FixedOffset {
    minutes.checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or(Utc.fix())
}

pub fn hhmm(dt: &NaiveDateTime) -> String {
    dt.format("%H:%M").to_string()
}
pub fn display_date(date: &NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}
