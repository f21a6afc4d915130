/*!
`UserRepo` for the Postgres-backed `Store`.
*/
use async_trait::async_trait;
use tokio_postgres::{error::SqlState, Row, Transaction};

use super::{AccountChanges, DbError, NewAccount, Store, StoreError, UserRepo};
use crate::user::{Role, User};

const USER_COLUMNS: &str = "id, uname, email, role, created_at, updated_at";

fn user_from_row(row: &Row) -> Result<User, DbError> {
    log::trace!("user_from_row( {:?} ) called", row);

    let role_str: &str = row.try_get("role")
        .map_err(|e| DbError::from(e).annotate("Error reading role"))?;
    let role: Role = role_str.parse()?;
    let u = User {
        id: row.try_get("id")?,
        uname: row.try_get("uname")?,
        email: row.try_get("email")?,
        role,
        created: row.try_get("created_at")?,
        updated: row.try_get("updated_at")?,
    };

    Ok(u)
}

/// Turn a unique-constraint violation into the matching `StoreError`.
///
/// The explicit checks below give nice errors in the ordinary case; this
/// covers the race where two inserts pass their checks concurrently.
fn uniqueness_error(
    e: tokio_postgres::Error,
    uname: &str,
    email: &str
) -> StoreError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let constraint = e.as_db_error().and_then(|dbe| dbe.constraint());
        match constraint {
            Some("users_uname_key") | Some("users_uname_lower_key") => {
                return StoreError::DuplicateUname(uname.to_owned());
            },
            Some("users_email_key") => {
                return StoreError::DuplicateEmail(email.to_owned());
            },
            _ => {},
        }
    }
    StoreError::from(e)
}

/// Fail with the appropriate duplicate error if `uname` or `email` is
/// already used by some row other than `except_id`.
async fn check_existing_user(
    t: &Transaction<'_>,
    uname: Option<&str>,
    email: Option<&str>,
    except_id: Option<i64>,
) -> Result<(), StoreError> {
    log::trace!(
        "check_existing_user( T, {:?}, {:?}, {:?} ) called.",
        uname, email, except_id
    );

    let rows = t.query(
        "SELECT id, uname, email FROM users
            WHERE (lower(uname) = lower($1) OR email = $2) AND id <> $3",
        &[&uname, &email, &except_id.unwrap_or(-1)]
    ).await.map_err(|e|
        DbError::from(e).annotate("Error querying for preexisting uname/email")
    )?;

    for row in rows.iter() {
        let row_uname: &str = row.try_get("uname")?;
        if let Some(uname) = uname {
            if row_uname.to_lowercase() == uname.to_lowercase() {
                return Err(StoreError::DuplicateUname(uname.to_owned()));
            }
        }
        let row_email: &str = row.try_get("email")?;
        if Some(row_email) == email {
            return Err(StoreError::DuplicateEmail(row_email.to_owned()));
        }
    }

    Ok(())
}

#[async_trait]
impl UserRepo for Store {
    async fn insert_user(&self, new: NewAccount<'_>) -> Result<User, StoreError> {
        log::trace!(
            "Store::insert_user( {:?}, {:?}, {} ) called.",
            new.uname, new.email, &new.role
        );

        let mut client = self.connect().await?;
        let t = client.transaction().await?;

        check_existing_user(&t, Some(new.uname), Some(new.email), None).await?;

        let stmt = format!(
            "INSERT INTO users (uname, email, hashed_password, role)
                VALUES ($1, $2, $3, $4)
                RETURNING {}",
            USER_COLUMNS
        );
        let row = t.query_one(
            stmt.as_str(),
            &[&new.uname, &new.email, &new.hashed_password, &new.role.to_string()]
        ).await.map_err(|e| uniqueness_error(e, new.uname, new.email))?;
        let u = user_from_row(&row)?;

        t.commit().await
            .map_err(|e| uniqueness_error(e, new.uname, new.email))?;
        log::trace!("Inserted {} {:?} ({}) as id {}.", &u.role, &u.uname, &u.email, u.id);
        Ok(u)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        log::trace!("Store::get_user( {} ) called.", id);

        let client = self.connect().await?;
        let stmt = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        match client.query_opt(stmt.as_str(), &[&id]).await? {
            None => Ok(None),
            Some(row) => Ok(Some(user_from_row(&row)?)),
        }
    }

    async fn get_user_by_uname(&self, uname: &str) -> Result<Option<User>, StoreError> {
        log::trace!("Store::get_user_by_uname( {:?} ) called.", uname);

        let client = self.connect().await?;
        let stmt = format!("SELECT {} FROM users WHERE uname = $1", USER_COLUMNS);
        match client.query_opt(stmt.as_str(), &[&uname]).await? {
            None => Ok(None),
            Some(row) => Ok(Some(user_from_row(&row)?)),
        }
    }

    async fn get_credentials(
        &self,
        uname: &str
    ) -> Result<Option<(User, String)>, StoreError> {
        log::trace!("Store::get_credentials( {:?} ) called.", uname);

        let client = self.connect().await?;
        let stmt = format!(
            "SELECT {}, hashed_password FROM users WHERE uname = $1",
            USER_COLUMNS
        );
        match client.query_opt(stmt.as_str(), &[&uname]).await? {
            None => Ok(None),
            Some(row) => {
                let u = user_from_row(&row)?;
                let digest: String = row.try_get("hashed_password")?;
                Ok(Some((u, digest)))
            },
        }
    }

    async fn get_users(&self) -> Result<Vec<User>, StoreError> {
        log::trace!("Store::get_users() called.");

        let client = self.connect().await?;
        let stmt = format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS);
        let rows = client.query(stmt.as_str(), &[]).await?;

        let mut users: Vec<User> = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            users.push(user_from_row(row)?);
        }

        Ok(users)
    }

    async fn update_user(
        &self,
        id: i64,
        changes: &AccountChanges
    ) -> Result<User, StoreError> {
        log::trace!(
            "Store::update_user( {}, email {:?}, role {:?}, new password: {} ) called.",
            id, &changes.email, &changes.role, changes.hashed_password.is_some()
        );

        let mut client = self.connect().await?;
        let t = client.transaction().await?;

        if t.query_opt(
            "SELECT id FROM users WHERE id = $1 FOR UPDATE",
            &[&id]
        ).await?.is_none() {
            return Err(StoreError::NoSuchUser(id));
        }

        let email = changes.email.as_deref();
        if email.is_some() {
            check_existing_user(&t, None, email, Some(id)).await?;
        }

        let role = changes.role.map(|r| r.to_string());
        let stmt = format!(
            "UPDATE users SET
                email = COALESCE($2, email),
                role = COALESCE($3, role),
                hashed_password = COALESCE($4, hashed_password),
                updated_at = now()
            WHERE id = $1
            RETURNING {}",
            USER_COLUMNS
        );
        let row = t.query_one(
            stmt.as_str(),
            &[&id, &email, &role, &changes.hashed_password]
        ).await.map_err(|e| uniqueness_error(e, "", email.unwrap_or_default()))?;
        let u = user_from_row(&row)?;

        t.commit().await?;
        Ok(u)
    }

    async fn delete_user(&self, id: i64) -> Result<(), StoreError> {
        log::trace!("Store::delete_user( {} ) called.", id);

        let client = self.connect().await?;
        let n = client.execute("DELETE FROM users WHERE id = $1", &[&id]).await?;

        match n {
            0 => Err(StoreError::NoSuchUser(id)),
            1 => Ok(()),
            n => {
                log::warn!("Deleting single user {} affected {} rows.", id, &n);
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    use crate::tests::ensure_logging;
    use crate::store::tests::TEST_CONNECTION;

    static USERS: &[(&str, &str, Role)] = &[
        ("root", "root@plant.example", Role::SuperAdmin),
        ("thelma", "thelma@plant.example", Role::Admin),
        ("ravi", "ravi@lab.example", Role::Scientist),
        ("jdoe", "j@x.com", Role::Client),
        ("visitor", "visitor@plant.example", Role::Guest),
    ];

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn insert_users() {
        ensure_logging();

        let db = Store::new(TEST_CONNECTION.to_owned());
        db.ensure_db_schema().await.unwrap();

        for (uname, email, role) in USERS.iter() {
            db.insert_user(NewAccount {
                uname,
                email,
                hashed_password: "$2b$04$not.a.real.digest",
                role: *role,
            }).await.unwrap();
        }

        let dupe = db.insert_user(NewAccount {
            uname: "jdoe",
            email: "other@x.com",
            hashed_password: "x",
            role: Role::Client,
        }).await;
        assert_eq!(dupe, Err(StoreError::DuplicateUname("jdoe".to_owned())));

        let dupe = db.insert_user(NewAccount {
            uname: "JDoe",
            email: "jd@x.com",
            hashed_password: "x",
            role: Role::Client,
        }).await;
        assert_eq!(dupe, Err(StoreError::DuplicateUname("JDoe".to_owned())));

        let dupe = db.insert_user(NewAccount {
            uname: "jdoe2",
            email: "j@x.com",
            hashed_password: "x",
            role: Role::Client,
        }).await;
        assert_eq!(dupe, Err(StoreError::DuplicateEmail("j@x.com".to_owned())));

        let users = db.get_users().await.unwrap();
        assert_eq!(users.len(), USERS.len());
        for ((uname, email, role), u) in USERS.iter().zip(users.iter()) {
            assert_eq!(
                (*uname, *email, *role),
                (u.uname.as_str(), u.email.as_str(), u.role)
            );
        }

        let jdoe = db.get_user_by_uname("jdoe").await.unwrap().unwrap();
        let changed = db.update_user(jdoe.id, &AccountChanges {
            role: Some(Role::Guest),
            ..Default::default()
        }).await.unwrap();
        assert_eq!(changed.role, Role::Guest);
        assert_eq!(changed.email, "j@x.com");
        assert!(changed.updated >= jdoe.updated);

        let taken = db.update_user(jdoe.id, &AccountChanges {
            email: Some("ravi@lab.example".to_owned()),
            ..Default::default()
        }).await;
        assert_eq!(taken, Err(StoreError::DuplicateEmail("ravi@lab.example".to_owned())));

        let (_, digest) = db.get_credentials("jdoe").await.unwrap().unwrap();
        assert_eq!(digest, "$2b$04$not.a.real.digest");

        for u in users.iter() {
            db.delete_user(u.id).await.unwrap();
        }
        assert_eq!(db.delete_user(jdoe.id).await, Err(StoreError::NoSuchUser(jdoe.id)));
        assert!(db.get_user(jdoe.id).await.unwrap().is_none());

        db.nuke_database().await.unwrap();
    }
}
