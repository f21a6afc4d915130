/*!
User-management actions, for Admin and SuperAdmin users.

Permission checks live in `Accounts`; these just translate bodies in and
results out.
*/
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::accounts::Accounts;
use crate::store::UserRepo;
use crate::user::{NewUser, Role, User, UserUpdate};
use super::*;

/// Body of an `update-user` request.
#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub id: i64,
    #[serde(flatten)]
    pub update: UserUpdate,
}

pub async fn populate_users<R: UserRepo>(accounts: &Accounts<R>, actor: &User) -> Response {
    log::trace!("populate_users( {:?} ) called.", &actor.uname);

    match accounts.list_users(actor).await {
        Ok(users) => respond_action(StatusCode::OK, "populate-users", users),
        Err(e) => e.into_response(),
    }
}

pub async fn populate_role<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let body = match require_body(body, "a role") {
        Ok(body) => body,
        Err(r) => { return r; },
    };
    let role: Role = match body.trim().parse() {
        Ok(role) => role,
        Err(e) => { return respond_bad_request(e); },
    };
    log::trace!("populate_role( {:?}, {} ) called.", &actor.uname, &role);

    match accounts.list_role(actor, role).await {
        Ok(users) => respond_action(StatusCode::OK, "populate-users", users),
        Err(e) => e.into_response(),
    }
}

pub async fn get_user<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let id = match require_id(body) {
        Ok(id) => id,
        Err(r) => { return r; },
    };

    match accounts.get_user(actor, id).await {
        Ok(uwp) => respond_action(StatusCode::OK, "get-user", uwp),
        Err(e) => e.into_response(),
    }
}

pub async fn add_user<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let body = match require_body(body, "a JSON") {
        Ok(body) => body,
        Err(r) => { return r; },
    };
    let new: NewUser = match serde_json::from_str(&body) {
        Ok(u) => u,
        Err(e) => {
            log::warn!("Error deserializing body as NewUser: {}", &e);
            return respond_bad_request(format!("Unable to read new user: {}", &e));
        },
    };

    match accounts.create_user(actor, new).await {
        Ok(uwp) => respond_action(StatusCode::CREATED, "add-user", uwp),
        Err(e) => e.into_response(),
    }
}

pub async fn update_user<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let body = match require_body(body, "a JSON") {
        Ok(body) => body,
        Err(r) => { return r; },
    };
    let req: UpdateRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            log::warn!("Error deserializing body as UpdateRequest: {}", &e);
            return respond_bad_request(format!("Unable to read user update: {}", &e));
        },
    };

    match accounts.update_user(actor, req.id, req.update).await {
        Ok(uwp) => respond_action(StatusCode::OK, "update-user", uwp),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_user<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let id = match require_id(body) {
        Ok(id) => id,
        Err(r) => { return r; },
    };

    match accounts.delete_user(actor, id).await {
        Ok(u) => respond_action(StatusCode::OK, "delete-user", u),
        Err(e) => e.into_response(),
    }
}

pub async fn search_profiles<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let query = body.unwrap_or_default();

    match accounts.search_profiles(actor, &query).await {
        Ok(profiles) => respond_action(StatusCode::OK, "search-profiles", profiles),
        Err(e) => e.into_response(),
    }
}

pub async fn upload_users<R: UserRepo>(
    accounts: &Accounts<R>,
    actor: &User,
    body: Option<String>
) -> Response {
    let body = match require_body(body, "a CSV") {
        Ok(body) => body,
        Err(r) => { return r; },
    };

    match accounts.import_csv(actor, body.as_bytes()).await {
        Ok(n) => respond_action(
            StatusCode::OK,
            "upload-users",
            serde_json::json!({ "created": n })
        ),
        Err(e) => e.into_response(),
    }
}

pub async fn reconcile<R: UserRepo>(accounts: &Accounts<R>, actor: &User) -> Response {
    match accounts.reconcile(actor).await {
        Ok(report) => respond_action(StatusCode::OK, "reconcile", report),
        Err(e) => e.into_response(),
    }
}
