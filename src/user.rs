/*!
Users, their roles, and what each role is allowed to do.

A `User` is the relational half of an account (identity, role, audit
timestamps; never the password digest). A `Profile` is the flat-file half.
*/
use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    Admin,
    Scientist,
    Client,
    Guest,
    SuperAdmin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let token = match self {
            Role::Admin      => "Admin",
            Role::Scientist  => "Scientist",
            Role::Client     => "Client",
            Role::Guest      => "Guest",
            Role::SuperAdmin => "SuperAdmin",
        };

        write!(f, "{}", token)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    /// Accepts the `Display` tokens as well as lower-case, snake-case and
    /// spaced spellings (`"super_admin"`, `"Super Admin"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let squashed: String = s.chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match squashed.as_str() {
            "admin"      => Ok(Role::Admin),
            "scientist"  => Ok(Role::Scientist),
            "client"     => Ok(Role::Client),
            "guest"      => Ok(Role::Guest),
            "superadmin" => Ok(Role::SuperAdmin),
            _ => Err(format!("{:?} is not a valid Role.", s)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<Role> for String {
    fn from(r: Role) -> String { r.to_string() }
}

/// Families of operations a role may be granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    /// Create, edit and delete accounts other than SuperAdmins.
    ManageUsers,
    /// Create, edit and delete SuperAdmin accounts.
    ManageSuperAdmins,
    /// Onboard client organizations, their sites and devices.
    ManageClients,
    ViewDatasets,
    MonitorTelemetry,
    RunAnalytics,
    UploadData,
    /// Raw record editing.
    EditRecords,
}

static ADMIN_CAPS: &[Capability] = &[
    Capability::ManageUsers,
    Capability::ManageClients,
    Capability::ViewDatasets,
    Capability::MonitorTelemetry,
    Capability::RunAnalytics,
    Capability::UploadData,
];

static SCIENTIST_CAPS: &[Capability] = &[
    Capability::ViewDatasets,
    Capability::MonitorTelemetry,
    Capability::RunAnalytics,
    Capability::UploadData,
];

static CLIENT_CAPS: &[Capability] = &[
    Capability::ViewDatasets,
    Capability::MonitorTelemetry,
    Capability::RunAnalytics,
];

static GUEST_CAPS: &[Capability] = &[
    Capability::ViewDatasets,
    Capability::UploadData,
];

static SUPER_ADMIN_CAPS: &[Capability] = &[
    Capability::ManageUsers,
    Capability::ManageSuperAdmins,
    Capability::ManageClients,
    Capability::ViewDatasets,
    Capability::MonitorTelemetry,
    Capability::RunAnalytics,
    Capability::UploadData,
    Capability::EditRecords,
];

/// Which data a user may see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DataScope {
    All,
    /// Only data belonging to this client organization.
    Organization(i64),
    /// Only data flagged as shared with guests.
    Shared,
    Nothing,
}

/// Form fields, for the purposes of the per-role requirement table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    FirstName,
    LastName,
    Email,
    Uname,
    Password,
    Phone,
    Designation,
    Department,
    Location,
    Organization,
}

impl Field {
    pub fn label(&self) -> &'static str {
        match self {
            Field::FirstName    => "First Name",
            Field::LastName     => "Last Name",
            Field::Email        => "Email",
            Field::Uname        => "Username",
            Field::Password     => "Password",
            Field::Phone        => "Phone",
            Field::Designation  => "Designation",
            Field::Department   => "Department",
            Field::Location     => "Location",
            Field::Organization => "Organization",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    Required,
    Optional,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Scientist,
        Role::Client,
        Role::Guest,
        Role::SuperAdmin,
    ];

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::Admin      => ADMIN_CAPS,
            Role::Scientist  => SCIENTIST_CAPS,
            Role::Client     => CLIENT_CAPS,
            Role::Guest      => GUEST_CAPS,
            Role::SuperAdmin => SUPER_ADMIN_CAPS,
        }
    }

    pub fn can(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }

    /// Whether a user with this role may create, edit or delete an account
    /// holding `target`.
    pub fn can_manage(&self, target: Role) -> bool {
        match target {
            Role::SuperAdmin => self.can(Capability::ManageSuperAdmins),
            _ => self.can(Capability::ManageUsers),
        }
    }

    pub fn requirement(&self, field: Field) -> Requirement {
        match (self, field) {
            (_, Field::FirstName)
            | (_, Field::LastName)
            | (_, Field::Email)
            | (_, Field::Uname)
            | (_, Field::Password) => Requirement::Required,
            (Role::Client, Field::Designation) => Requirement::Required,
            _ => Requirement::Optional,
        }
    }

    /// A Client's scope is their organization; a Client who hasn't been
    /// assigned one sees nothing.
    pub fn data_scope(&self, organization: Option<i64>) -> DataScope {
        match self {
            Role::Admin | Role::Scientist | Role::SuperAdmin => DataScope::All,
            Role::Client => match organization {
                Some(id) => DataScope::Organization(id),
                None => DataScope::Nothing,
            },
            Role::Guest => DataScope::Shared,
        }
    }
}

/// The relational half of an account.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    pub uname: String,
    pub email: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

/// The flat-file half of an account. `user_id` is the `User.id`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    pub user_id: i64,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default, alias = "client_id")]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<i64>,
    #[serde(with = "stamp", alias = "created_at")]
    pub created: OffsetDateTime,
    #[serde(with = "stamp", alias = "last_updated")]
    pub updated: OffsetDateTime,
}

/**
Profile timestamps are written as RFC 3339. Older profile files carry
offset-less ISO 8601 stamps (`2024-05-01T09:30:00.123456`); those are read
as UTC.
*/
mod stamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{
        format_description::well_known::{Iso8601, Rfc3339},
        OffsetDateTime, PrimitiveDateTime,
    };

    pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::serialize(t, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let s = String::deserialize(d)?;
        if let Ok(t) = OffsetDateTime::parse(&s, &Rfc3339) {
            return Ok(t);
        }
        PrimitiveDateTime::parse(&s, &Iso8601::DEFAULT)
            .map(|t| t.assume_utc())
            .map_err(|e| serde::de::Error::custom(
                format!("bad timestamp {:?}: {}", &s, &e)
            ))
    }
}

/// For patch fields where an explicit `null` means "clear it": a missing
/// key stays `None`, `null` becomes `Some(None)`.
fn present<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

impl Profile {
    pub fn from_data(
        user_id: i64,
        data: ProfileData,
        created_by: Option<i64>
    ) -> Profile {
        let now = OffsetDateTime::now_utc();
        Profile {
            user_id,
            first_name: data.first_name.trim().to_owned(),
            last_name: data.last_name.trim().to_owned(),
            phone: blank_means_none(data.phone.as_deref()).map(String::from),
            designation: blank_means_none(data.designation.as_deref()).map(String::from),
            department: blank_means_none(data.department.as_deref()).map(String::from),
            location_id: data.location_id,
            organization_id: data.organization_id,
            created_by,
            created: now,
            updated: now,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", &self.first_name, &self.last_name).trim().to_owned()
    }

    /// Apply the fields present in `patch`. A supplied blank string clears
    /// an optional text field.
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(s) = &patch.first_name {
            self.first_name = s.trim().to_owned();
        }
        if let Some(s) = &patch.last_name {
            self.last_name = s.trim().to_owned();
        }
        if let Some(s) = &patch.phone {
            self.phone = blank_means_none(Some(s.as_str())).map(String::from);
        }
        if let Some(s) = &patch.designation {
            self.designation = blank_means_none(Some(s.as_str())).map(String::from);
        }
        if let Some(s) = &patch.department {
            self.department = blank_means_none(Some(s.as_str())).map(String::from);
        }
        if let Some(n) = patch.location_id {
            self.location_id = n;
        }
        if let Some(n) = patch.organization_id {
            self.organization_id = n;
        }
        self.updated = OffsetDateTime::now_utc();
    }
}

/// Profile fields as they arrive from the "Add New User" form.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ProfileData {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub organization_id: Option<i64>,
}

/// Profile changes; absent fields are left alone.
///
/// Text fields are cleared with a blank string, ids with `null` (which is
/// `Some(None)` here).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub location_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Option<i64>>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self == &ProfilePatch::default()
    }
}

/// Everything needed to create an account.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewUser {
    pub uname: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub confirm_password: Option<String>,
    pub role: Role,
    #[serde(flatten)]
    pub profile: ProfileData,
}

/// Changes to an existing account. The username and id never change.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub confirm_password: Option<String>,
    #[serde(flatten)]
    pub profile: ProfilePatch,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserWithProfile {
    #[serde(flatten)]
    pub user: User,
    pub profile: Option<Profile>,
}

fn blank_means_none(s: Option<&str>) -> Option<&str> {
    match s {
        Some(s) => match s.trim() {
            "" => None,
            x => Some(x),
        },
        None => None,
    }
}

fn parse_opt_id(
    row: &csv::StringRecord,
    idx: usize,
    what: &str
) -> Result<Option<i64>, String> {
    match blank_means_none(row.get(idx)) {
        None => Ok(None),
        Some(s) => s.parse::<i64>()
            .map(Some)
            .map_err(|e| format!("bad {} {:?}: {}", what, s, &e)),
    }
}

impl NewUser {
    /**
    User .csv rows should look like this

    ```csv
    #uname, email,         password,    role,   first, last,  phone,        designation,    department, location, organization
    jdoe,   j@x.com,       hunter2hunter2, Client, Jane, Doe, 021 555 0199, Plant Engineer, Operations, 4,        2
    rsci,   r@lab.example, correct-horse,  Scientist, Ravi, Singh,,,,,
    ```

    Everything from `phone` on may be blank or missing.
    */
    pub fn from_csv_line(
        row: &csv::StringRecord
    ) -> Result<NewUser, String> {
        log::trace!("NewUser::from_csv_line( [ {} fields ] ) called.", row.len());

        let uname = match blank_means_none(row.get(0)) {
            Some(s) => s.to_owned(),
            None => { return Err("no uname".to_owned()); },
        };
        let email = match blank_means_none(row.get(1)) {
            Some(s) => s.to_owned(),
            None => { return Err("no email address".to_owned()); },
        };
        let password = match row.get(2) {
            Some(s) if !s.is_empty() => s.to_owned(),
            _ => { return Err("no password".to_owned()); },
        };
        let role: Role = match blank_means_none(row.get(3)) {
            Some(s) => s.parse()?,
            None => { return Err("no role".to_owned()); },
        };
        let first_name = match blank_means_none(row.get(4)) {
            Some(s) => s.to_owned(),
            None => { return Err("no first name".to_owned()); },
        };
        let last_name = match blank_means_none(row.get(5)) {
            Some(s) => s.to_owned(),
            None => { return Err("no last name".to_owned()); },
        };

        let profile = ProfileData {
            first_name,
            last_name,
            phone: blank_means_none(row.get(6)).map(String::from),
            designation: blank_means_none(row.get(7)).map(String::from),
            department: blank_means_none(row.get(8)).map(String::from),
            location_id: parse_opt_id(row, 9, "location id")?,
            organization_id: parse_opt_id(row, 10, "organization id")?,
        };

        Ok(NewUser {
            uname,
            email,
            password,
            confirm_password: None,
            role,
            profile,
        })
    }

    pub fn vec_from_csv_reader<R: Read>(r: R) -> Result<Vec<NewUser>, String> {
        log::trace!("NewUser::vec_from_csv_reader(...) called.");

        let mut csv_reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .has_headers(false)
            .from_reader(r);

        let mut users: Vec<NewUser> = Vec::new();

        for (n, res) in csv_reader.records().enumerate() {
            let record = res.map_err(|e| match e.position() {
                Some(p) => format!("Error on line {}: {}", p.line(), &e),
                None => format!("Error in CSV record {}: {}", &n, &e),
            })?;

            match NewUser::from_csv_line(&record) {
                Ok(u) => { users.push(u); },
                Err(e) => {
                    let estr = match record.position() {
                        Some(p) => format!("Error on line {}: {}", p.line(), &e),
                        None => format!("Error in CSV record {}: {}", &n, &e),
                    };
                    return Err(estr);
                },
            }
        }

        log::trace!(
            "NewUser::vec_from_csv_reader() returns {} NewUsers.",
            users.len()
        );
        Ok(users)
    }
}
