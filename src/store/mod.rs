/*!
The relational half of the account store.

The Postgres database to which `Store` connects is meant to have this table:

```sql
CREATE TABLE users (
    id              BIGSERIAL PRIMARY KEY,
    uname           VARCHAR(50) NOT NULL,
    email           VARCHAR(255) NOT NULL,
    hashed_password VARCHAR(255) NOT NULL,
    role            TEXT NOT NULL,  /* one of the `user::Role` tokens */
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT users_uname_key UNIQUE (uname),
    CONSTRAINT users_email_key UNIQUE (email)
);
CREATE UNIQUE INDEX users_uname_lower_key ON users (lower(uname));
```

Usernames keep the case they were created with, but two may not differ
only in case. Emails are stored lowercased.

`MemStore` keeps the same table in memory and enforces the same rules.
*/
use std::fmt::Write;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};

use crate::user::{Role, User};

pub mod mem;
mod users;

pub use mem::MemStore;

static SCHEMA: &[(&str, &str, &str)] = &[
    (
        "SELECT FROM information_schema.tables WHERE table_name = 'users'",
        "CREATE TABLE users (
            id              BIGSERIAL PRIMARY KEY,
            uname           VARCHAR(50) NOT NULL,
            email           VARCHAR(255) NOT NULL,
            hashed_password VARCHAR(255) NOT NULL,
            role            TEXT NOT NULL CHECK (
                role IN ('Admin', 'Scientist', 'Client', 'Guest', 'SuperAdmin')
            ),
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT users_uname_key UNIQUE (uname),
            CONSTRAINT users_email_key UNIQUE (email)
        )",
        "DROP TABLE users",
    ),
    (
        "SELECT FROM pg_indexes WHERE indexname = 'users_uname_lower_key'",
        "CREATE UNIQUE INDEX users_uname_lower_key ON users (lower(uname))",
        "DROP INDEX users_uname_lower_key",
    ),
];

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct DbError(String);

impl DbError {
    /// Prepend some contextual `annotation` for the error.
    fn annotate(self, annotation: &str) -> Self {
        let s = format!("{}: {}", annotation, &self.0);
        Self(s)
    }

    pub fn display(&self) -> &str { &self.0 }
}

impl From<tokio_postgres::error::Error> for DbError {
    fn from(e: tokio_postgres::error::Error) -> DbError {
        let mut s = format!("Data DB: {}", &e);
        if let Some(dbe) = e.as_db_error() {
            let _ = write!(&mut s, "; {}", dbe);
        }
        DbError(s)
    }
}

impl From<String> for DbError {
    fn from(s: String) -> DbError { DbError(s) }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("username {0:?} is already taken")]
    DuplicateUname(String),
    #[error("email address {0:?} is already registered")]
    DuplicateEmail(String),
    #[error("there is no user with id {0}")]
    NoSuchUser(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<tokio_postgres::error::Error> for StoreError {
    fn from(e: tokio_postgres::error::Error) -> StoreError {
        StoreError::Db(DbError::from(e))
    }
}

/// A row to insert. `email` should already be normalized.
#[derive(Clone, Copy, Debug)]
pub struct NewAccount<'a> {
    pub uname: &'a str,
    pub email: &'a str,
    pub hashed_password: &'a str,
    pub role: Role,
}

/// Column changes; `None` leaves a column alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountChanges {
    pub email: Option<String>,
    pub role: Option<Role>,
    pub hashed_password: Option<String>,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        self == &AccountChanges::default()
    }
}

/// Storage for the `users` table.
///
/// Implementations guarantee `uname` (ignoring case) and `email` uniqueness
/// and report violations as `StoreError::DuplicateUname` / `DuplicateEmail`.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn insert_user(&self, new: NewAccount<'_>) -> Result<User, StoreError>;

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn get_user_by_uname(&self, uname: &str) -> Result<Option<User>, StoreError>;

    /// The user together with their stored password digest.
    async fn get_credentials(
        &self,
        uname: &str
    ) -> Result<Option<(User, String)>, StoreError>;

    /// Every user, in `id` order.
    async fn get_users(&self) -> Result<Vec<User>, StoreError>;

    /// Apply `changes` and bump `updated`. Returns the changed user.
    async fn update_user(
        &self,
        id: i64,
        changes: &AccountChanges
    ) -> Result<User, StoreError>;

    async fn delete_user(&self, id: i64) -> Result<(), StoreError>;
}

pub struct Store {
    connection_string: String,
}

impl Store {
    pub fn new(connection_string: String) -> Self {
        log::trace!("Store::new( {:?} ) called.", &connection_string);

        Self { connection_string }
    }

    async fn connect(&self) -> Result<Client, DbError> {
        log::trace!(
            "Store::connect() called w/connection string {:?}",
            &self.connection_string
        );

        match tokio_postgres::connect(&self.connection_string, NoTls).await {
            Ok((client, connection)) => {
                log::trace!("    ...connection successful.");
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        log::error!("Data DB connection error: {}", &e);
                    } else {
                        log::trace!("tokio connection runtime drops.");
                    }
                });
                Ok(client)
            },
            Err(e) => {
                let dberr = DbError::from(e);
                log::trace!("    ...connection failed: {:?}", &dberr);
                Err(dberr.annotate("Unable to connect"))
            }
        }
    }

    pub async fn ensure_db_schema(&self) -> Result<(), DbError> {
        log::trace!("Store::ensure_db_schema() called.");

        let mut client = self.connect().await?;
        let t = client.transaction().await
            .map_err(|e| DbError::from(e)
                .annotate("Data DB unable to begin transaction"))?;

        for (test_stmt, create_stmt, _) in SCHEMA.iter() {
            if t.query_opt(test_stmt.to_owned(), &[]).await?.is_none() {
                log::info!(
                    "{:?} returned no results; attempting to insert table.",
                    test_stmt
                );
                t.execute(create_stmt.to_owned(), &[]).await?;
            }
        }

        t.commit().await
            .map_err(|e| DbError::from(e)
                .annotate("Error committing transaction"))
    }

    /**
    Drop all database tables to fully reset database state.

    This is only meant for cleanup after testing. It is advisable to look at
    the ERROR level log output when testing to ensure this method did its job.
    */
    #[cfg(test)]
    pub async fn nuke_database(&self) -> Result<(), DbError> {
        log::trace!("Store::nuke_database() called.");

        let client = self.connect().await?;

        for (_, _, drop_stmt) in SCHEMA.iter().rev() {
            if let Err(e) = client.execute(drop_stmt.to_owned(), &[]).await {
                let err = DbError::from(e);
                log::error!("Error dropping: {:?}: {}", &drop_stmt, &err.display());
            }
        }

        log::trace!("    ....nuking complete.");
        Ok(())
    }
}
