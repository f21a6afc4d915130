/*!
Interoperation between the client (user) and server.

(Not the application and the storage; that's covered by `accounts`,
`store`, and `profile`.)

Every request is a `POST /api` carrying these headers:

  * `x-roster-request-id`: anything; echoed back on the response
  * `x-roster-uname`, `x-roster-password`: credentials, checked per request
  * `x-roster-action`: what to do; see `api()`
*/
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, State},
    http::{Request, StatusCode},
    http::header::{HeaderMap, HeaderName, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

use crate::accounts::{AccountError, Accounts};
use crate::auth::AuthResult;
use crate::store::UserRepo;
use crate::user::User;

pub mod admin;
pub mod dash;

static TEXT_500: &str = "An internal error occurred; details have been logged.";

pub const REQUEST_ID: &str = "x-roster-request-id";
pub const UNAME: &str = "x-roster-uname";
pub const PASSWORD: &str = "x-roster-password";
pub const ACTION: &str = "x-roster-action";

pub fn text_500(text: Option<String>) -> Response {
    match text {
        Some(text) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            text
        ).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            TEXT_500.to_owned()
        ).into_response()
    }
}

pub fn respond_bad_password() -> Response {
    log::trace!("respond_bad_password() called.");

    (
        StatusCode::UNAUTHORIZED,
        "Invalid username/password combination.".to_owned(),
    ).into_response()
}

pub fn respond_bad_request(msg: String) -> Response {
    log::trace!("respond_bad_request( {:?} ) called.", &msg);

    (
        StatusCode::BAD_REQUEST,
        msg
    ).into_response()
}

/// A successful JSON response tagged with the action that produced it.
pub fn respond_action<T: serde::Serialize>(
    code: StatusCode,
    action: &'static str,
    data: T
) -> Response {
    (
        code,
        [(
            HeaderName::from_static(ACTION),
            HeaderValue::from_static(action)
        )],
        Json(data),
    ).into_response()
}

impl IntoResponse for AccountError {
    fn into_response(self) -> Response {
        match self {
            AccountError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                msg
            ).into_response(),
            AccountError::SelfDelete => (
                StatusCode::FORBIDDEN,
                self.to_string()
            ).into_response(),
            AccountError::NoSuchUser(_) => (
                StatusCode::NOT_FOUND,
                self.to_string()
            ).into_response(),
            AccountError::DuplicateUname(_) | AccountError::DuplicateEmail(_) => (
                StatusCode::CONFLICT,
                self.to_string()
            ).into_response(),
            AccountError::Invalid(errs) => {
                let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
                (StatusCode::UNPROCESSABLE_ENTITY, Json(msgs)).into_response()
            },
            AccountError::Csv(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(vec![msg])
            ).into_response(),
            e => {
                log::error!("Error fielding request: {}", &e);
                text_500(None)
            },
        }
    }
}

/// Get the value of header `name` as a `&str`, or the 400 response to
/// return if it's missing or unreadable.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, Response> {
    match headers.get(name) {
        Some(val) => match val.to_str() {
            Ok(s) => Ok(s),
            Err(e) => {
                log::warn!("Failed converting {} value {:?} to &str: {}", name, val, &e);
                Err(respond_bad_request(format!("{} header unrecognizable.", name)))
            },
        },
        None => Err(respond_bad_request(
            format!("Request must have an {} header.", name)
        )),
    }
}

/// A non-blank request body, or the 400 response to return.
pub fn require_body(body: Option<String>, what: &str) -> Result<String, Response> {
    match body {
        Some(body) if !body.trim().is_empty() => Ok(body),
        _ => Err(respond_bad_request(format!("Request requires {} body.", what))),
    }
}

/// A request body holding a single integer id.
pub fn require_id(body: Option<String>) -> Result<i64, Response> {
    let body = require_body(body, "an id")?;
    body.trim().parse::<i64>().map_err(|e| respond_bad_request(
        format!("Unable to parse {:?} as an id: {}", body.trim(), &e)
    ))
}

/// Middleware function to ensure `x-roster-request-id` header is
/// maintained between request and response.
pub async fn request_identity(
    req: Request<Body>,
    next: Next<Body>
) -> Response {
    let id_header = match req.headers().get(REQUEST_ID) {
        Some(id) => id.to_owned(),
        None => {
            return respond_bad_request(
                format!("Request must have an {} header.", REQUEST_ID)
            );
        },
    };
    log::trace!("Request {:?}: {} {}", &id_header, req.method(), req.uri());

    let mut response = next.run(req).await;
    response.headers_mut().insert(REQUEST_ID, id_header);
    response
}

/// Middleware function to check the request's credentials and hand the
/// authenticated `User` on to the handler as an `Extension`.
pub async fn authenticate<R: UserRepo + 'static>(
    State(accounts): State<Arc<Accounts<R>>>,
    mut req: Request<Body>,
    next: Next<Body>,
) -> Response {
    let (uname, password) = {
        let headers = req.headers();
        let uname = match header_str(headers, UNAME) {
            Ok(s) => s.to_owned(),
            Err(r) => { return r; },
        };
        let password = match header_str(headers, PASSWORD) {
            Ok(s) => s.to_owned(),
            Err(r) => { return r; },
        };
        (uname, password)
    };

    match accounts.authenticate(&uname, &password).await {
        Err(e) => {
            log::error!("Error authenticating request: {}", &e);
            text_500(None)
        },
        Ok(AuthResult::Ok(u)) => {
            req.extensions_mut().insert(u);
            next.run(req).await
        },
        Ok(AuthResult::NoSuchUser) | Ok(AuthResult::BadPassword) => {
            respond_bad_password()
        },
    }
}

/// Dispatch on the `x-roster-action` header.
pub async fn api<R: UserRepo + 'static>(
    State(accounts): State<Arc<Accounts<R>>>,
    Extension(actor): Extension<User>,
    headers: HeaderMap,
    body: Option<String>,
) -> Response {
    let action = match header_str(&headers, ACTION) {
        Ok(s) => s,
        Err(r) => { return r; },
    };
    log::trace!("api: {:?} requests {:?}.", &actor.uname, action);

    let accounts = accounts.as_ref();
    match action {
        "whoami" => dash::whoami(accounts, &actor).await,
        "in-charge" => dash::in_charge(accounts, &actor, body).await,
        "password-strength" => dash::password_strength(body).await,
        "populate-users" => admin::populate_users(accounts, &actor).await,
        "populate-role" => admin::populate_role(accounts, &actor, body).await,
        "get-user" => admin::get_user(accounts, &actor, body).await,
        "add-user" => admin::add_user(accounts, &actor, body).await,
        "update-user" => admin::update_user(accounts, &actor, body).await,
        "delete-user" => admin::delete_user(accounts, &actor, body).await,
        "search-profiles" => admin::search_profiles(accounts, &actor, body).await,
        "upload-users" => admin::upload_users(accounts, &actor, body).await,
        "reconcile" => admin::reconcile(accounts, &actor).await,
        x => respond_bad_request(
            format!("{:?} is not a recognizable {} value.", x, ACTION)
        ),
    }
}

pub fn router<R: UserRepo + 'static>(accounts: Arc<Accounts<R>>) -> Router {
    Router::new()
        .route("/api", post(api::<R>))
        .layer(middleware::from_fn_with_state(accounts.clone(), authenticate::<R>))
        .layer(middleware::from_fn(request_identity))
        .with_state(accounts)
}
