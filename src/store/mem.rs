/*!
An in-process `UserRepo`, for tests and for trying things out without a
database.
*/
use std::collections::BTreeMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{AccountChanges, DbError, NewAccount, StoreError, UserRepo};
use crate::user::User;

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, (User, String)>,
    fail_next_delete: bool,
    /// Counts down on each `update_user()`; the call that finds 1 (or 0) fails.
    fail_update_countdown: Option<u32>,
}

fn simulated_outage() -> StoreError {
    StoreError::Db(DbError::from(
        "Unable to connect: simulated outage".to_owned()
    ))
}

#[derive(Default)]
pub struct MemStore {
    table: Mutex<Table>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// Make the next `delete_user()` call fail as if the database had gone
    /// away.
    #[cfg(test)]
    pub(crate) async fn fail_next_delete(&self) {
        self.table.lock().await.fail_next_delete = true;
    }

    /// Make the `n`th `update_user()` call from now fail the same way.
    #[cfg(test)]
    pub(crate) async fn fail_nth_update(&self, n: u32) {
        self.table.lock().await.fail_update_countdown = Some(n);
    }
}

#[async_trait]
impl UserRepo for MemStore {
    async fn insert_user(&self, new: NewAccount<'_>) -> Result<User, StoreError> {
        log::trace!(
            "MemStore::insert_user( {:?}, {:?}, {} ) called.",
            new.uname, new.email, &new.role
        );

        let mut table = self.table.lock().await;
        for (u, _) in table.rows.values() {
            if u.uname.to_lowercase() == new.uname.to_lowercase() {
                return Err(StoreError::DuplicateUname(new.uname.to_owned()));
            }
            if u.email == new.email {
                return Err(StoreError::DuplicateEmail(new.email.to_owned()));
            }
        }

        table.next_id += 1;
        let now = OffsetDateTime::now_utc();
        let u = User {
            id: table.next_id,
            uname: new.uname.to_owned(),
            email: new.email.to_owned(),
            role: new.role,
            created: now,
            updated: now,
        };
        table.rows.insert(u.id, (u.clone(), new.hashed_password.to_owned()));

        Ok(u)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.get(&id).map(|(u, _)| u.clone()))
    }

    async fn get_user_by_uname(&self, uname: &str) -> Result<Option<User>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.values()
            .find(|(u, _)| u.uname == uname)
            .map(|(u, _)| u.clone()))
    }

    async fn get_credentials(
        &self,
        uname: &str
    ) -> Result<Option<(User, String)>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.values()
            .find(|(u, _)| u.uname == uname)
            .cloned())
    }

    async fn get_users(&self) -> Result<Vec<User>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.values().map(|(u, _)| u.clone()).collect())
    }

    async fn update_user(
        &self,
        id: i64,
        changes: &AccountChanges
    ) -> Result<User, StoreError> {
        log::trace!("MemStore::update_user( {}, {:?} ) called.", id, &changes.role);

        let mut table = self.table.lock().await;
        match table.fail_update_countdown {
            Some(0) | Some(1) => {
                table.fail_update_countdown = None;
                return Err(simulated_outage());
            },
            Some(n) => { table.fail_update_countdown = Some(n - 1); },
            None => {},
        }
        if !table.rows.contains_key(&id) {
            return Err(StoreError::NoSuchUser(id));
        }
        if let Some(email) = &changes.email {
            let taken = table.rows.values()
                .any(|(u, _)| u.id != id && &u.email == email);
            if taken {
                return Err(StoreError::DuplicateEmail(email.clone()));
            }
        }

        let (u, digest) = table.rows.get_mut(&id)
            .ok_or(StoreError::NoSuchUser(id))?;
        if let Some(email) = &changes.email {
            u.email = email.clone();
        }
        if let Some(role) = changes.role {
            u.role = role;
        }
        if let Some(d) = &changes.hashed_password {
            *digest = d.clone();
        }
        u.updated = OffsetDateTime::now_utc();

        Ok(u.clone())
    }

    async fn delete_user(&self, id: i64) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        if table.fail_next_delete {
            table.fail_next_delete = false;
            return Err(simulated_outage());
        }
        match table.rows.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NoSuchUser(id)),
        }
    }
}
