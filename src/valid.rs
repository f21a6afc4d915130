/*!
Form validation for new and updated accounts.

Every check runs; callers get the whole list of problems at once.
*/
use serde::Serialize;

use crate::user::{Field, NewUser, Profile, ProfileData, ProfilePatch, Requirement, Role, UserUpdate};

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MIN_UNAME_LENGTH: usize = 3;
pub const MAX_UNAME_LENGTH: usize = 50;
pub const MAX_EMAIL_LENGTH: usize = 255;
pub const MIN_PHONE_DIGITS: usize = 9;

const PASSWORD_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("{} is required", .0.label())]
    Missing(Field),
    #[error("password must be at least {} characters", MIN_PASSWORD_LENGTH)]
    PasswordTooShort,
    #[error("passwords do not match")]
    PasswordMismatch,
    #[error("username must be between {} and {} characters", MIN_UNAME_LENGTH, MAX_UNAME_LENGTH)]
    UnameLength,
    #[error("username may contain only letters, digits, '.', '_' and '-'")]
    UnameChars,
    #[error("invalid email address format")]
    EmailFormat,
    #[error("email address must be at most {} characters", MAX_EMAIL_LENGTH)]
    EmailTooLong,
    #[error("phone: {0}")]
    Phone(&'static str),
    #[error("designation is required for the {0} role")]
    DesignationRequired(Role),
}

/// Password strength, as shown next to the password field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Strength {
    /// 0 through 4.
    pub score: u8,
    pub feedback: &'static str,
}

pub fn password_strength(password: &str) -> Strength {
    let n_chars = password.chars().count();
    let mut score: u8 = 0;

    if n_chars >= MIN_PASSWORD_LENGTH { score += 1; }
    if n_chars >= 12 { score += 1; }
    if password.chars().any(|c| c.is_uppercase()) { score += 1; }
    if password.chars().any(|c| c.is_ascii_digit()) { score += 1; }
    if password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) { score += 1; }

    let feedback = match score {
        0 | 1 => "Very weak: add length and variety.",
        2 => "Weak: consider adding numbers or symbols.",
        3 => "Moderate: good password.",
        _ => "Strong password!",
    };

    Strength { score: score.min(4), feedback }
}

fn is_blank(s: &str) -> bool { s.trim().is_empty() }

fn opt_is_blank(s: Option<&str>) -> bool {
    match s {
        None => true,
        Some(s) => is_blank(s),
    }
}

pub fn check_password(
    password: &str,
    confirm: Option<&str>,
    errs: &mut Vec<FieldError>
) {
    if password.is_empty() {
        errs.push(FieldError::Missing(Field::Password));
        return;
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        errs.push(FieldError::PasswordTooShort);
    }
    if let Some(confirm) = confirm {
        if confirm != password {
            errs.push(FieldError::PasswordMismatch);
        }
    }
}

pub fn check_uname(uname: &str, errs: &mut Vec<FieldError>) {
    let uname = uname.trim();
    if uname.is_empty() {
        errs.push(FieldError::Missing(Field::Uname));
        return;
    }
    let n_chars = uname.chars().count();
    if n_chars < MIN_UNAME_LENGTH || n_chars > MAX_UNAME_LENGTH {
        errs.push(FieldError::UnameLength);
    }
    if !uname.chars().all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        errs.push(FieldError::UnameChars);
    }
}

pub fn check_email(email: &str, errs: &mut Vec<FieldError>) {
    let email = email.trim();
    if email.is_empty() {
        errs.push(FieldError::Missing(Field::Email));
        return;
    }
    if email.chars().count() > MAX_EMAIL_LENGTH {
        errs.push(FieldError::EmailTooLong);
    }
    match email.rsplit_once('@') {
        Some((local, domain)) => {
            let domain_ok = match domain.split_once('.') {
                Some((head, tail)) => !head.is_empty() && !tail.is_empty(),
                None => false,
            };
            if local.is_empty() || !domain_ok || email.contains(char::is_whitespace) {
                errs.push(FieldError::EmailFormat);
            }
        },
        None => { errs.push(FieldError::EmailFormat); },
    }
}

/// Phone numbers are optional; a present one must look like a New Zealand
/// number: `+64...` or `0...`, with at least `MIN_PHONE_DIGITS` digits.
pub fn check_phone(phone: &str) -> Result<(), &'static str> {
    let cleaned: String = phone.chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    let n_digits = cleaned.chars().filter(|c| c.is_ascii_digit()).count();
    if n_digits == 0 {
        return Err("must contain digits");
    }
    if !(cleaned.starts_with("+64") || cleaned.starts_with('0')) {
        return Err("must start with +64 or 0");
    }
    if n_digits < MIN_PHONE_DIGITS {
        return Err("number too short");
    }
    Ok(())
}

fn check_profile(role: Role, p: &ProfileData, errs: &mut Vec<FieldError>) {
    if is_blank(&p.first_name) {
        errs.push(FieldError::Missing(Field::FirstName));
    }
    if is_blank(&p.last_name) {
        errs.push(FieldError::Missing(Field::LastName));
    }
    if let Some(phone) = p.phone.as_deref() {
        if !is_blank(phone) {
            if let Err(e) = check_phone(phone) {
                errs.push(FieldError::Phone(e));
            }
        }
    }
    if role.requirement(Field::Designation) == Requirement::Required
        && opt_is_blank(p.designation.as_deref())
    {
        errs.push(FieldError::DesignationRequired(role));
    }
}

pub fn check_new_user(u: &NewUser) -> Result<(), Vec<FieldError>> {
    let mut errs: Vec<FieldError> = Vec::new();

    check_uname(&u.uname, &mut errs);
    check_email(&u.email, &mut errs);
    check_password(&u.password, u.confirm_password.as_deref(), &mut errs);
    check_profile(u.role, &u.profile, &mut errs);

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

/// Check the supplied parts of `upd` against an account currently holding
/// `role` with `current` profile.
///
/// The role-conditional requirements are checked against the profile as it
/// will be after the patch, under the role it will have after the update.
pub fn check_update(
    role: Role,
    current: Option<&Profile>,
    upd: &UserUpdate,
) -> Result<(), Vec<FieldError>> {
    let mut errs: Vec<FieldError> = Vec::new();

    if let Some(email) = upd.email.as_deref() {
        check_email(email, &mut errs);
    }
    if let Some(password) = upd.password.as_deref() {
        check_password(password, upd.confirm_password.as_deref(), &mut errs);
    }

    let new_role = upd.role.unwrap_or(role);
    let merged = merged_profile_data(current, &upd.profile);
    check_profile(new_role, &merged, &mut errs);

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

fn merged_profile_data(current: Option<&Profile>, patch: &ProfilePatch) -> ProfileData {
    let mut data = match current {
        Some(p) => ProfileData {
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            phone: p.phone.clone(),
            designation: p.designation.clone(),
            department: p.department.clone(),
            location_id: p.location_id,
            organization_id: p.organization_id,
        },
        None => ProfileData::default(),
    };

    if let Some(s) = &patch.first_name { data.first_name = s.clone(); }
    if let Some(s) = &patch.last_name { data.last_name = s.clone(); }
    if let Some(s) = &patch.phone { data.phone = Some(s.clone()); }
    if let Some(s) = &patch.designation { data.designation = Some(s.clone()); }
    if let Some(s) = &patch.department { data.department = Some(s.clone()); }
    if let Some(n) = patch.location_id { data.location_id = n; }
    if let Some(n) = patch.organization_id { data.organization_id = n; }

    data
}
