use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::{Build, Request, Rocket};
use serde::{Deserialize, Serialize};
use crate::api::{ApiError, ApiResult, Reply};
use crate::db::DbPool;
use crate::impl_sqlx_text_type_encode_decode;
use crate::users::{load_user, UserRecord};

/// Header set by the authenticating gateway in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    GeneralSupervisor,
    Supervisor,
    Teacher,
    Accountant,
}
impl_sqlx_text_type_encode_decode!(Role);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ManageYears,
    ManageStructure,
    ManageUsers,
    ManageStudents,
    ManageSupervision,
    ViewAttendance,
    ManageScholarships,
    ManageTeaching,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Admin, Role::GeneralSupervisor, Role::Supervisor, Role::Teacher, Role::Accountant];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::GeneralSupervisor => "general_supervisor",
            Role::Supervisor => "supervisor",
            Role::Teacher => "teacher",
            Role::Accountant => "accountant",
        }
    }
    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Role::Admin => &[ManageYears, ManageStructure, ManageUsers, ManageStudents, ManageSupervision, ViewAttendance, ManageScholarships, ManageTeaching],
            Role::GeneralSupervisor => &[ManageStudents, ManageSupervision, ViewAttendance],
            Role::Supervisor | Role::Teacher => &[ViewAttendance],
            Role::Accountant => &[ManageScholarships],
        }
    }
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL.into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown role: {s}"))
    }
}

/// The authenticated user on whose behalf a request runs.
pub struct ActingUser(pub UserRecord);
impl ActingUser {
    pub fn require(&self, capability: Capability) -> Result<(), ApiError> {
        if self.0.role.can(capability) {
            Ok(())
        } else {
            warn!("user {} ({}) denied {:?}", self.0.id, self.0.role, capability);
            Err(ApiError::forbidden(format!("Role {} is not allowed to perform this action", self.0.role)).code("forbidden"))
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ActingUser {
    type Error = &'static str;
    async fn from_request(request: &'r Request<'_>) -> Outcome<ActingUser, &'static str> {
        let Some(user_id) = request.headers().get_one(USER_ID_HEADER).and_then(|v| v.trim().parse::<i64>().ok()) else {
            return Outcome::Error((Status::Forbidden, "missing or malformed user id header"));
        };
        let Some(db) = request.rocket().state::<DbPool>() else {
            return Outcome::Error((Status::InternalServerError, "database not available"));
        };
        match load_user(user_id, &db.0).await {
            Ok(Some(user)) => Outcome::Success(ActingUser(user)),
            Ok(None) => Outcome::Error((Status::Forbidden, "unknown user")),
            Err(err) => {
                error!("loading acting user {user_id} failed: {err}");
                Outcome::Error((Status::InternalServerError, "user lookup failed"))
            }
        }
    }
}

#[derive(Serialize, Debug)]
struct RoleInfo {
    role: Role,
    capabilities: &'static [Capability],
}

#[get("/roles")]
fn get_roles() -> ApiResult<Vec<RoleInfo>> {
    let roles = Role::ALL.into_iter()
        .map(|role| RoleInfo { role, capabilities: role.capabilities() })
        .collect();
    Ok(Reply::ok(roles))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_roles,
        ])
}
