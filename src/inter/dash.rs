/*!
Actions available to every signed-in user, whatever their role.
*/
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::accounts::Accounts;
use crate::store::UserRepo;
use crate::user::User;
use crate::valid;
use super::*;

pub async fn whoami<R: UserRepo>(accounts: &Accounts<R>, actor: &User) -> Response {
    log::trace!("whoami( {:?} ) called.", &actor.uname);

    match accounts.whoami(actor).await {
        Ok(w) => respond_action(StatusCode::OK, "whoami", w),
        Err(e) => e.into_response(),
    }
}

/// Body is a location id; responds with the Client in charge of it, or
/// `null`.
pub async fn in_charge<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let location_id = match require_id(body) {
        Ok(id) => id,
        Err(r) => { return r; },
    };

    match accounts.in_charge_for_location(actor, location_id).await {
        Ok(found) => respond_action(StatusCode::OK, "in-charge", found),
        Err(e) => e.into_response(),
    }
}

/// Body is a candidate password; responds with its score (0 to 4) and a
/// line of feedback. Nothing is stored or compared.
pub async fn password_strength(body: Option<String>) -> Response {
    let password = match require_body(body, "a password") {
        Ok(p) => p,
        Err(r) => { return r; },
    };

    respond_action(
        StatusCode::OK,
        "password-strength",
        valid::password_strength(&password)
    )
}
