/*!
Accounts: the `users` row and the profile file, handled as one thing.

Every write goes to the relational store first and the profile store second.
If the second write fails, the first is undone. If the undo also fails the
caller gets `AccountError::Inconsistent`, the details are logged at ERROR,
and `Accounts::reconcile()` is the way back to a clean state.
*/
use std::collections::{HashMap, HashSet};
use std::io::Read;

use serde::Serialize;

use crate::auth::{AuthResult, HashError, Hasher};
use crate::profile::{ProfileError, ProfileStore};
use crate::store::{AccountChanges, NewAccount, StoreError, UserRepo};
use crate::user::{
    Capability, DataScope, NewUser, Profile, ProfileData, Role, User,
    UserUpdate, UserWithProfile,
};
use crate::valid::{self, FieldError};

fn list_field_errors(errs: &[FieldError]) -> String {
    let strs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    strs.join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("{0}")]
    Forbidden(String),
    #[error("invalid input: {}", list_field_errors(.0))]
    Invalid(Vec<FieldError>),
    #[error("username {0:?} is already taken")]
    DuplicateUname(String),
    #[error("email address {0:?} is already registered")]
    DuplicateEmail(String),
    #[error("there is no user with id {0}")]
    NoSuchUser(i64),
    #[error("you cannot delete your own account")]
    SelfDelete,
    #[error("user {id} may be inconsistent between stores: {detail}")]
    Inconsistent { id: i64, detail: String },
    #[error("{0}")]
    Csv(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Hash(#[from] HashError),
}

impl From<StoreError> for AccountError {
    fn from(e: StoreError) -> AccountError {
        match e {
            StoreError::DuplicateUname(s) => AccountError::DuplicateUname(s),
            StoreError::DuplicateEmail(s) => AccountError::DuplicateEmail(s),
            StoreError::NoSuchUser(id) => AccountError::NoSuchUser(id),
            e => AccountError::Store(e),
        }
    }
}

/// What a signed-in user needs to know about themself.
#[derive(Debug, Serialize)]
pub struct Whoami {
    pub user: User,
    pub profile: Option<Profile>,
    pub capabilities: &'static [Capability],
    pub scope: DataScope,
}

/// The Client user responsible for a location, as shown on client
/// dashboards.
#[derive(Debug, PartialEq, Serialize)]
pub struct InCharge {
    pub name: String,
    #[serde(flatten)]
    pub profile: Profile,
    pub email: String,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Profile files that had no matching user, and were removed.
    pub removed_profiles: Vec<i64>,
    /// Users that have no profile file.
    pub users_without_profile: Vec<i64>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn require(actor: &User, cap: Capability) -> Result<(), AccountError> {
    if actor.role.can(cap) {
        Ok(())
    } else {
        Err(AccountError::Forbidden(format!(
            "{} users may not do that ({:?}).", &actor.role, &cap
        )))
    }
}

fn require_manage(actor: &User, target: Role) -> Result<(), AccountError> {
    if actor.role.can_manage(target) {
        Ok(())
    } else {
        Err(AccountError::Forbidden(format!(
            "{} users may not manage {} accounts.", &actor.role, &target
        )))
    }
}

pub struct Accounts<R> {
    repo: R,
    profiles: ProfileStore,
    hasher: Hasher,
}

impl<R: UserRepo> Accounts<R> {
    pub fn new(repo: R, profiles: ProfileStore, hasher: Hasher) -> Self {
        Self { repo, profiles, hasher }
    }

    pub fn repo(&self) -> &R { &self.repo }

    pub fn profiles(&self) -> &ProfileStore { &self.profiles }

    pub async fn authenticate(
        &self,
        uname: &str,
        password: &str
    ) -> Result<AuthResult, AccountError> {
        log::trace!("Accounts::authenticate( {:?}, [ password ] ) called.", uname);

        match self.repo.get_credentials(uname).await? {
            None => Ok(AuthResult::NoSuchUser),
            Some((u, digest)) => {
                if self.hasher.verify(password, &digest).await? {
                    Ok(AuthResult::Ok(u))
                } else {
                    Ok(AuthResult::BadPassword)
                }
            },
        }
    }

    /// Delete both halves of an account, for undoing a fresh insert.
    async fn remove_account(&self, id: i64) -> Result<(), AccountError> {
        self.profiles.delete(id).await?;
        self.repo.delete_user(id).await?;
        Ok(())
    }

    /// Validate, hash, insert the row, write the profile; delete the row
    /// again if the profile can't be written.
    async fn insert_with_profile(
        &self,
        new: NewUser,
        created_by: Option<i64>
    ) -> Result<UserWithProfile, AccountError> {
        valid::check_new_user(&new).map_err(AccountError::Invalid)?;

        let email = normalize_email(&new.email);
        let digest = self.hasher.hash(&new.password).await?;
        let u = self.repo.insert_user(NewAccount {
            uname: new.uname.trim(),
            email: &email,
            hashed_password: &digest,
            role: new.role,
        }).await?;

        let profile = Profile::from_data(u.id, new.profile, created_by);
        if let Err(e) = self.profiles.create(&profile).await {
            log::error!(
                "Error writing profile for new user {:?} (id {}): {}; removing user record.",
                &u.uname, u.id, &e
            );
            if let Err(undo_e) = self.repo.delete_user(u.id).await {
                log::error!(
                    "Unable to remove user record {} after failed profile write: {}",
                    u.id, &undo_e
                );
                return Err(AccountError::Inconsistent {
                    id: u.id,
                    detail: format!(
                        "profile write failed ({}) and the user record could not be removed ({})",
                        &e, &undo_e
                    ),
                });
            }
            return Err(e.into());
        }

        Ok(UserWithProfile { user: u, profile: Some(profile) })
    }

    pub async fn create_user(
        &self,
        actor: &User,
        new: NewUser
    ) -> Result<UserWithProfile, AccountError> {
        log::trace!(
            "Accounts::create_user( {:?}, {:?} ({}) ) called.",
            &actor.uname, &new.uname, &new.role
        );

        require_manage(actor, new.role)?;
        let uwp = self.insert_with_profile(new, Some(actor.id)).await?;

        log::info!(
            "{} {:?} created user {:?} ({}) with id {}.",
            &actor.role, &actor.uname, &uwp.user.uname, &uwp.user.role, uwp.user.id
        );
        Ok(uwp)
    }

    /// Managers may look anyone up; everyone else may only look at
    /// themself.
    pub async fn get_user(
        &self,
        actor: &User,
        id: i64
    ) -> Result<UserWithProfile, AccountError> {
        if actor.id != id {
            require(actor, Capability::ManageUsers)?;
        }

        let user = self.repo.get_user(id).await?
            .ok_or(AccountError::NoSuchUser(id))?;
        let profile = self.profiles.get(id).await?;
        Ok(UserWithProfile { user, profile })
    }

    pub async fn list_users(&self, actor: &User) -> Result<Vec<UserWithProfile>, AccountError> {
        log::trace!("Accounts::list_users( {:?} ) called.", &actor.uname);
        require(actor, Capability::ManageUsers)?;

        let users = self.repo.get_users().await?;
        let mut profiles: HashMap<i64, Profile> = self.profiles.all().await?
            .into_iter()
            .map(|p| (p.user_id, p))
            .collect();

        let uwps = users.into_iter()
            .map(|user| {
                let profile = profiles.remove(&user.id);
                UserWithProfile { user, profile }
            })
            .collect();
        Ok(uwps)
    }

    pub async fn list_role(
        &self,
        actor: &User,
        role: Role
    ) -> Result<Vec<UserWithProfile>, AccountError> {
        let mut uwps = self.list_users(actor).await?;
        uwps.retain(|uwp| uwp.user.role == role);
        Ok(uwps)
    }

    pub async fn update_user(
        &self,
        actor: &User,
        id: i64,
        upd: UserUpdate
    ) -> Result<UserWithProfile, AccountError> {
        log::trace!(
            "Accounts::update_user( {:?}, {}, [ update ] ) called.",
            &actor.uname, id
        );

        let current = self.repo.get_user(id).await?
            .ok_or(AccountError::NoSuchUser(id))?;
        require_manage(actor, current.role)?;
        if let Some(role) = upd.role {
            if role != current.role {
                require_manage(actor, role)?;
                if actor.id == id {
                    return Err(AccountError::Forbidden(
                        "You cannot change your own role.".to_owned()
                    ));
                }
            }
        }

        let old_profile = self.profiles.get(id).await?;
        valid::check_update(current.role, old_profile.as_ref(), &upd)
            .map_err(AccountError::Invalid)?;

        let mut changes = AccountChanges {
            email: upd.email.as_deref()
                .map(normalize_email)
                .filter(|e| e != &current.email),
            role: upd.role.filter(|r| *r != current.role),
            hashed_password: None,
        };
        let mut old_digest: Option<String> = None;
        if let Some(password) = upd.password.as_deref() {
            changes.hashed_password = Some(self.hasher.hash(password).await?);
            old_digest = self.repo.get_credentials(&current.uname).await?
                .map(|(_, digest)| digest);
        }

        let user = if changes.is_empty() {
            current.clone()
        } else {
            self.repo.update_user(id, &changes).await?
        };

        let profile_res = match old_profile {
            Some(old) => {
                if upd.profile.is_empty() {
                    Ok(old)
                } else {
                    self.profiles.update(id, &upd.profile).await
                }
            },
            None => {
                let patch = &upd.profile;
                let data = ProfileData {
                    first_name: patch.first_name.clone().unwrap_or_default(),
                    last_name: patch.last_name.clone().unwrap_or_default(),
                    phone: patch.phone.clone(),
                    designation: patch.designation.clone(),
                    department: patch.department.clone(),
                    location_id: patch.location_id.flatten(),
                    organization_id: patch.organization_id.flatten(),
                };
                let p = Profile::from_data(id, data, Some(actor.id));
                self.profiles.create(&p).await.map(|_| p)
            },
        };

        let profile = match profile_res {
            Ok(p) => p,
            Err(e) => {
                log::error!("Error updating profile for user {}: {}", id, &e);
                if !changes.is_empty() {
                    let restore = AccountChanges {
                        email: changes.email.as_ref().map(|_| current.email.clone()),
                        role: changes.role.map(|_| current.role),
                        hashed_password: old_digest,
                    };
                    if let Err(undo_e) = self.repo.update_user(id, &restore).await {
                        log::error!(
                            "Unable to restore user record {} after failed profile update: {}",
                            id, &undo_e
                        );
                        return Err(AccountError::Inconsistent {
                            id,
                            detail: format!(
                                "profile update failed ({}) and the user record could not be restored ({})",
                                &e, &undo_e
                            ),
                        });
                    }
                }
                return Err(e.into());
            },
        };

        log::info!(
            "{} {:?} updated user {:?} (id {}).",
            &actor.role, &actor.uname, &user.uname, id
        );
        Ok(UserWithProfile { user, profile: Some(profile) })
    }

    /// Remove both halves of an account. Returns the removed user.
    pub async fn delete_user(&self, actor: &User, id: i64) -> Result<User, AccountError> {
        log::trace!("Accounts::delete_user( {:?}, {} ) called.", &actor.uname, id);

        if actor.id == id {
            return Err(AccountError::SelfDelete);
        }
        let target = self.repo.get_user(id).await?
            .ok_or(AccountError::NoSuchUser(id))?;
        require_manage(actor, target.role)?;

        let snapshot = match self.profiles.get(id).await {
            Ok(p) => p,
            Err(ProfileError::Json { path, source }) => {
                log::warn!(
                    "Profile {} is malformed ({}); deleting it anyway.",
                    path.display(), &source
                );
                None
            },
            Err(e) => { return Err(e.into()); },
        };

        self.profiles.delete(id).await?;
        if let Err(e) = self.repo.delete_user(id).await {
            log::error!("Error deleting user record {}: {}", id, &e);
            if let Some(p) = &snapshot {
                if let Err(undo_e) = self.profiles.replace(p).await {
                    log::error!(
                        "Unable to restore profile {} after failed user delete: {}",
                        id, &undo_e
                    );
                    return Err(AccountError::Inconsistent {
                        id,
                        detail: format!(
                            "user delete failed ({}) and the profile could not be restored ({})",
                            &e, &undo_e
                        ),
                    });
                }
            }
            return Err(e.into());
        }

        log::warn!(
            "{} {:?} deleted user {:?} (id {}).",
            &actor.role, &actor.uname, &target.uname, id
        );
        Ok(target)
    }

    pub async fn search_profiles(
        &self,
        actor: &User,
        query: &str
    ) -> Result<Vec<Profile>, AccountError> {
        require(actor, Capability::ManageUsers)?;
        Ok(self.profiles.search(query).await?)
    }

    pub async fn data_scope(&self, user: &User) -> Result<DataScope, AccountError> {
        let organization = match user.role {
            Role::Client => self.profiles.get(user.id).await?
                .and_then(|p| p.organization_id),
            _ => None,
        };
        Ok(user.role.data_scope(organization))
    }

    pub async fn whoami(&self, actor: &User) -> Result<Whoami, AccountError> {
        let profile = self.profiles.get(actor.id).await?;
        let organization = profile.as_ref().and_then(|p| p.organization_id);
        Ok(Whoami {
            user: actor.clone(),
            profile,
            capabilities: actor.role.capabilities(),
            scope: actor.role.data_scope(organization),
        })
    }

    /// The first Client user assigned to `location_id`.
    ///
    /// Client actors only see in-charges from their own organization.
    pub async fn in_charge_for_location(
        &self,
        actor: &User,
        location_id: i64
    ) -> Result<Option<InCharge>, AccountError> {
        let scope = self.data_scope(actor).await?;
        match scope {
            DataScope::All | DataScope::Organization(_) => {},
            DataScope::Shared | DataScope::Nothing => {
                return Err(AccountError::Forbidden(format!(
                    "{} users may not view site contacts.", &actor.role
                )));
            },
        }

        for p in self.profiles.all().await?.into_iter() {
            if p.location_id != Some(location_id) {
                continue;
            }
            if let DataScope::Organization(org) = scope {
                if p.organization_id != Some(org) {
                    continue;
                }
            }
            match self.repo.get_user(p.user_id).await? {
                Some(u) if u.role == Role::Client => {
                    return Ok(Some(InCharge {
                        name: p.full_name(),
                        profile: p,
                        email: u.email,
                    }));
                },
                _ => {},
            }
        }

        Ok(None)
    }

    /// Remove profile files that have no user, and report users that have
    /// no profile file.
    pub async fn reconcile(&self, actor: &User) -> Result<ReconcileReport, AccountError> {
        log::trace!("Accounts::reconcile( {:?} ) called.", &actor.uname);
        require(actor, Capability::ManageUsers)?;

        // Profiles first. Creates write the row before the profile and
        // deletes remove the profile before the row, so every file listed
        // here has its row in the later snapshot unless it is mid-delete.
        let profile_ids: HashSet<i64> = self.profiles.ids().await?
            .into_iter()
            .collect();
        let user_ids: HashSet<i64> = self.repo.get_users().await?
            .iter()
            .map(|u| u.id)
            .collect();

        let mut report = ReconcileReport::default();
        for id in profile_ids.difference(&user_ids) {
            log::warn!("Removing orphaned profile {}.", id);
            self.profiles.delete(*id).await?;
            report.removed_profiles.push(*id);
        }
        for id in user_ids.difference(&profile_ids) {
            log::warn!("User {} has no profile.", id);
            report.users_without_profile.push(*id);
        }
        report.removed_profiles.sort_unstable();
        report.users_without_profile.sort_unstable();

        Ok(report)
    }

    /**
    Create every user described in the CSV text from `r` (see
    `NewUser::from_csv_line()` for the format).

    All rows are checked before anything is written. If a row fails while
    writing, the users already created from this batch are removed again.
    Returns the number of users created.
    */
    pub async fn import_csv<Rd: Read>(
        &self,
        actor: &User,
        r: Rd
    ) -> Result<usize, AccountError> {
        log::trace!("Accounts::import_csv( {:?}, ... ) called.", &actor.uname);

        let news = NewUser::vec_from_csv_reader(r).map_err(AccountError::Csv)?;

        let mut unames: HashSet<String> = HashSet::with_capacity(news.len());
        let mut emails: HashSet<String> = HashSet::with_capacity(news.len());
        for (n, u) in news.iter().enumerate() {
            require_manage(actor, u.role)?;
            if let Err(errs) = valid::check_new_user(u) {
                return Err(AccountError::Csv(format!(
                    "user {} ({:?}): {}", n + 1, &u.uname, list_field_errors(&errs)
                )));
            }
            if !unames.insert(u.uname.trim().to_lowercase()) {
                return Err(AccountError::Csv(format!(
                    "username {:?} appears more than once", &u.uname
                )));
            }
            if !emails.insert(normalize_email(&u.email)) {
                return Err(AccountError::Csv(format!(
                    "email address {:?} appears more than once", &u.email
                )));
            }
        }

        let mut created: Vec<i64> = Vec::with_capacity(news.len());
        for u in news.into_iter() {
            match self.insert_with_profile(u, Some(actor.id)).await {
                Ok(uwp) => { created.push(uwp.user.id); },
                Err(e) => {
                    log::error!(
                        "Error importing users: {}; removing {} user(s) already imported.",
                        &e, created.len()
                    );
                    for id in created.iter().rev() {
                        if let Err(undo_e) = self.remove_account(*id).await {
                            log::error!("Unable to remove imported user {}: {}", id, &undo_e);
                        }
                    }
                    return Err(e);
                },
            }
        }

        log::info!(
            "{} {:?} imported {} user(s).",
            &actor.role, &actor.uname, created.len()
        );
        Ok(created.len())
    }

    /// Make sure a SuperAdmin named `uname` exists, creating it (with a
    /// placeholder profile) if it doesn't.
    pub async fn ensure_default_admin(
        &self,
        uname: &str,
        email: &str,
        password: &str
    ) -> Result<User, AccountError> {
        log::trace!("Accounts::ensure_default_admin( {:?}, {:?} ) called.", uname, email);

        if let Some(u) = self.repo.get_user_by_uname(uname).await? {
            if u.role != Role::SuperAdmin {
                log::warn!("Default admin {:?} exists with role {}.", uname, &u.role);
            }
            match self.authenticate(uname, password).await? {
                AuthResult::Ok(_) => {
                    log::trace!("Default admin password check OK.");
                },
                _ => {
                    log::warn!("Default admin {:?} not using default password.", uname);
                },
            }
            return Ok(u);
        }

        log::info!("Default admin {:?} doesn't exist; inserting.", uname);
        let new = NewUser {
            uname: uname.to_owned(),
            email: email.to_owned(),
            password: password.to_owned(),
            confirm_password: None,
            role: Role::SuperAdmin,
            profile: ProfileData {
                first_name: "Default".to_owned(),
                last_name: "Administrator".to_owned(),
                ..Default::default()
            },
        };
        let uwp = self.insert_with_profile(new, None).await?;
        Ok(uwp.user)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{DbError, MemStore};
    use crate::tests::ensure_logging;
    use crate::user::ProfilePatch;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    pub(crate) async fn setup() -> (TempDir, Accounts<MemStore>, User) {
        ensure_logging();
        let dir = tempfile::tempdir().unwrap();
        let accounts = Accounts::new(
            MemStore::new(),
            ProfileStore::new(dir.path().join("user_profiles")),
            Hasher::new(4),
        );
        let root = accounts.ensure_default_admin(
            "root", "root@plant.example", "rootpassword"
        ).await.unwrap();
        (dir, accounts, root)
    }

    pub(crate) fn new_user(uname: &str, email: &str, role: Role) -> NewUser {
        NewUser {
            uname: uname.to_owned(),
            email: email.to_owned(),
            password: "hunter2hunter2".to_owned(),
            confirm_password: Some("hunter2hunter2".to_owned()),
            role,
            profile: ProfileData {
                first_name: "Test".to_owned(),
                last_name: uname.to_owned(),
                designation: match role {
                    Role::Client => Some("Plant Engineer".to_owned()),
                    _ => None,
                },
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn jdoe_then_duplicate() {
        let (_dir, accts, root) = setup().await;

        let mut jdoe = new_user("jdoe", "j@x.com", Role::Client);
        jdoe.profile.designation = Some("Plant Engineer".to_owned());
        let uwp = accts.create_user(&root, jdoe).await.unwrap();
        assert_eq!(uwp.user.uname, "jdoe");
        assert_eq!(uwp.user.email, "j@x.com");
        assert_eq!(uwp.user.role, Role::Client);
        let profile = uwp.profile.unwrap();
        assert_eq!(profile.user_id, uwp.user.id);
        assert_eq!(profile.designation.as_deref(), Some("Plant Engineer"));
        assert_eq!(profile.created_by, Some(root.id));
        assert_eq!(accts.profiles().get(uwp.user.id).await.unwrap(), Some(profile));

        let again = accts.create_user(&root, new_user("jdoe", "other@x.com", Role::Guest)).await;
        assert!(matches!(again, Err(AccountError::DuplicateUname(u)) if u == "jdoe"));
        assert_eq!(accts.repo().get_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_uname_ignores_case() {
        let (_dir, accts, root) = setup().await;

        accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Guest)).await.unwrap();
        let res = accts.create_user(&root, new_user("JDoe", "other@x.com", Role::Guest)).await;
        assert!(matches!(res, Err(AccountError::DuplicateUname(u)) if u == "JDoe"));
        assert_eq!(accts.repo().get_users().await.unwrap().len(), 2);

        let batch = "\
kdoe, k@x.com, hunter2hunter2, Guest, Kim, Doe
KDoe, l@x.com, hunter2hunter2, Guest, Lee, Doe
";
        assert!(matches!(accts.import_csv(&root, batch.as_bytes()).await, Err(AccountError::Csv(_))));
    }

    #[tokio::test]
    async fn duplicate_email_ignores_case() {
        let (_dir, accts, root) = setup().await;

        accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Guest)).await.unwrap();
        let res = accts.create_user(&root, new_user("kdoe", " J@X.com ", Role::Guest)).await;
        assert!(matches!(res, Err(AccountError::DuplicateEmail(e)) if e == "j@x.com"));
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let (_dir, accts, root) = setup().await;

        let mut short = new_user("jdoe", "j@x.com", Role::Guest);
        short.password = "seven77".to_owned();
        short.confirm_password = None;
        let res = accts.create_user(&root, short).await;
        assert!(matches!(
            res,
            Err(AccountError::Invalid(ref errs)) if errs == &vec![FieldError::PasswordTooShort]
        ));

        let mut no_title = new_user("jdoe", "j@x.com", Role::Client);
        no_title.profile.designation = None;
        let res = accts.create_user(&root, no_title).await;
        assert!(matches!(
            res,
            Err(AccountError::Invalid(ref errs)) if errs == &vec![FieldError::DesignationRequired(Role::Client)]
        ));

        assert!(accts.repo().get_user_by_uname("jdoe").await.unwrap().is_none());
        assert_eq!(accts.profiles().ids().await.unwrap(), vec![root.id]);
    }

    #[tokio::test]
    async fn who_may_create() {
        let (_dir, accts, root) = setup().await;

        let admin = accts.create_user(&root, new_user("thelma", "thelma@plant.example", Role::Admin))
            .await.unwrap().user;
        let sci = accts.create_user(&root, new_user("ravi", "ravi@lab.example", Role::Scientist))
            .await.unwrap().user;

        let res = accts.create_user(&sci, new_user("jdoe", "j@x.com", Role::Guest)).await;
        assert!(matches!(res, Err(AccountError::Forbidden(_))));

        let res = accts.create_user(&admin, new_user("boss", "boss@x.com", Role::SuperAdmin)).await;
        assert!(matches!(res, Err(AccountError::Forbidden(_))));

        accts.create_user(&admin, new_user("dan", "dan@plant.example", Role::Admin)).await.unwrap();
        accts.create_user(&root, new_user("boss", "boss@x.com", Role::SuperAdmin)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_profile_write_removes_user_row() {
        let (dir, accts, root) = setup().await;

        // The next id the store hands out is root.id + 1; occupy its file.
        let blocker = root.id + 1;
        std::fs::write(
            dir.path().join("user_profiles").join(format!("{}.json", blocker)),
            "{}"
        ).unwrap();

        let res = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Guest)).await;
        assert!(matches!(res, Err(AccountError::Profile(ProfileError::Exists(id))) if id == blocker));
        assert!(accts.repo().get_user_by_uname("jdoe").await.unwrap().is_none());
        assert!(accts.repo().get_user(blocker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unremovable_row_after_failed_create_is_inconsistent() {
        let (dir, accts, root) = setup().await;

        let blocker = root.id + 1;
        std::fs::write(
            dir.path().join("user_profiles").join(format!("{}.json", blocker)),
            "{}"
        ).unwrap();
        accts.repo().fail_next_delete().await;

        let res = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Guest)).await;
        assert!(matches!(res, Err(AccountError::Inconsistent { id, .. }) if id == blocker));
        let row = accts.repo().get_user(blocker).await.unwrap().unwrap();
        assert_eq!(row.uname, "jdoe");
    }

    #[tokio::test]
    async fn authentication() {
        let (_dir, accts, root) = setup().await;

        match accts.authenticate("root", "rootpassword").await.unwrap() {
            AuthResult::Ok(u) => { assert_eq!(u, root); },
            x => panic!("expected Ok, got {:?}", x),
        }
        assert_eq!(
            accts.authenticate("root", "wrong password").await.unwrap(),
            AuthResult::BadPassword
        );
        assert_eq!(
            accts.authenticate("nobody", "rootpassword").await.unwrap(),
            AuthResult::NoSuchUser
        );
    }

    #[tokio::test]
    async fn default_admin_is_idempotent() {
        let (_dir, accts, root) = setup().await;

        let again = accts.ensure_default_admin(
            "root", "root@plant.example", "a different password"
        ).await.unwrap();
        assert_eq!(again, root);
        assert_eq!(root.role, Role::SuperAdmin);
        assert_eq!(accts.repo().get_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn updating() {
        let (_dir, accts, root) = setup().await;

        let ravi = accts.create_user(&root, new_user("ravi", "ravi@lab.example", Role::Scientist))
            .await.unwrap().user;
        accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client)).await.unwrap();

        let res = accts.update_user(&root, ravi.id, UserUpdate {
            role: Some(Role::Client),
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::Invalid(_))));

        let uwp = accts.update_user(&root, ravi.id, UserUpdate {
            role: Some(Role::Client),
            password: Some("a brand new password".to_owned()),
            profile: ProfilePatch {
                designation: Some("Site Lead".to_owned()),
                organization_id: Some(Some(2)),
                ..Default::default()
            },
            ..Default::default()
        }).await.unwrap();
        assert_eq!(uwp.user.role, Role::Client);
        assert_eq!(uwp.user.uname, "ravi");
        let profile = uwp.profile.unwrap();
        assert_eq!(profile.designation.as_deref(), Some("Site Lead"));
        assert_eq!(profile.first_name, "Test");

        assert!(matches!(
            accts.authenticate("ravi", "a brand new password").await.unwrap(),
            AuthResult::Ok(_)
        ));
        assert_eq!(
            accts.authenticate("ravi", "hunter2hunter2").await.unwrap(),
            AuthResult::BadPassword
        );
        assert_eq!(accts.data_scope(&uwp.user).await.unwrap(), DataScope::Organization(2));

        let res = accts.update_user(&root, ravi.id, UserUpdate {
            email: Some("J@x.com".to_owned()),
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::DuplicateEmail(_))));

        let res = accts.update_user(&root, 999, UserUpdate::default()).await;
        assert!(matches!(res, Err(AccountError::NoSuchUser(999))));
    }

    #[tokio::test]
    async fn no_changing_your_own_role() {
        let (_dir, accts, root) = setup().await;

        let res = accts.update_user(&root, root.id, UserUpdate {
            role: Some(Role::Guest),
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::Forbidden(_))));

        // Other edits to yourself are fine.
        accts.update_user(&root, root.id, UserUpdate {
            profile: ProfilePatch {
                department: Some("IT".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }).await.unwrap();
    }

    #[tokio::test]
    async fn failed_profile_update_restores_user_row() {
        let (dir, accts, root) = setup().await;

        let ravi = accts.create_user(&root, new_user("ravi", "ravi@lab.example", Role::Scientist))
            .await.unwrap().user;

        // A directory where the temp file wants to go makes the write fail.
        std::fs::create_dir(
            dir.path().join("user_profiles").join(format!("{}.json.tmp", ravi.id))
        ).unwrap();

        let res = accts.update_user(&root, ravi.id, UserUpdate {
            role: Some(Role::Guest),
            email: Some("ravi@elsewhere.example".to_owned()),
            profile: ProfilePatch {
                department: Some("Research".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::Profile(ProfileError::Io { .. }))));

        let after = accts.repo().get_user(ravi.id).await.unwrap().unwrap();
        assert_eq!(after.role, Role::Scientist);
        assert_eq!(after.email, "ravi@lab.example");
    }

    #[tokio::test]
    async fn unrestorable_row_after_failed_update_is_inconsistent() {
        let (dir, accts, root) = setup().await;

        let ravi = accts.create_user(&root, new_user("ravi", "ravi@lab.example", Role::Scientist))
            .await.unwrap().user;
        std::fs::create_dir(
            dir.path().join("user_profiles").join(format!("{}.json.tmp", ravi.id))
        ).unwrap();
        // The change goes through; putting it back does not.
        accts.repo().fail_nth_update(2).await;

        let res = accts.update_user(&root, ravi.id, UserUpdate {
            role: Some(Role::Guest),
            email: Some("ravi@elsewhere.example".to_owned()),
            profile: ProfilePatch {
                department: Some("Research".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::Inconsistent { id, .. }) if id == ravi.id));

        let after = accts.repo().get_user(ravi.id).await.unwrap().unwrap();
        assert_eq!(after.role, Role::Guest);
        assert_eq!(after.email, "ravi@elsewhere.example");
        let p = accts.profiles().get(ravi.id).await.unwrap().unwrap();
        assert_eq!(p.department, None);
    }

    #[tokio::test]
    async fn updating_without_a_profile_file() {
        let (dir, accts, root) = setup().await;

        let admin = accts.create_user(&root, new_user("thelma", "thelma@plant.example", Role::Admin))
            .await.unwrap().user;
        let jdoe = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap().user;
        std::fs::remove_file(
            dir.path().join("user_profiles").join(format!("{}.json", jdoe.id))
        ).unwrap();

        // Nothing to merge with, so the names and designation must come
        // with the update.
        let res = accts.update_user(&admin, jdoe.id, UserUpdate {
            profile: ProfilePatch {
                department: Some("Operations".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }).await;
        assert!(matches!(res, Err(AccountError::Invalid(_))));
        assert_eq!(accts.profiles().get(jdoe.id).await.unwrap(), None);

        let uwp = accts.update_user(&admin, jdoe.id, UserUpdate {
            profile: ProfilePatch {
                first_name: Some("Jane".to_owned()),
                last_name: Some("Doe".to_owned()),
                designation: Some("Plant Engineer".to_owned()),
                location_id: Some(Some(4)),
                organization_id: Some(None),
                ..Default::default()
            },
            ..Default::default()
        }).await.unwrap();
        let p = uwp.profile.unwrap();
        assert_eq!(p.full_name(), "Jane Doe");
        assert_eq!(p.location_id, Some(4));
        assert_eq!(p.organization_id, None);
        assert_eq!(p.created_by, Some(admin.id));
        assert_eq!(accts.profiles().get(jdoe.id).await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn deleting() {
        let (_dir, accts, root) = setup().await;

        let admin = accts.create_user(&root, new_user("thelma", "thelma@plant.example", Role::Admin))
            .await.unwrap().user;
        let jdoe = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap().user;

        assert!(matches!(accts.delete_user(&root, root.id).await, Err(AccountError::SelfDelete)));
        assert!(matches!(accts.delete_user(&admin, root.id).await, Err(AccountError::Forbidden(_))));

        let gone = accts.delete_user(&admin, jdoe.id).await.unwrap();
        assert_eq!(gone.uname, "jdoe");
        assert!(accts.repo().get_user(jdoe.id).await.unwrap().is_none());
        assert_eq!(accts.profiles().get(jdoe.id).await.unwrap(), None);

        assert!(matches!(
            accts.delete_user(&admin, jdoe.id).await,
            Err(AccountError::NoSuchUser(_))
        ));
    }

    #[tokio::test]
    async fn failed_row_delete_restores_profile() {
        let (_dir, accts, root) = setup().await;

        let jdoe = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap();
        accts.repo().fail_next_delete().await;

        let res = accts.delete_user(&root, jdoe.user.id).await;
        assert!(matches!(res, Err(AccountError::Store(_))));
        assert_eq!(accts.profiles().get(jdoe.user.id).await.unwrap(), jdoe.profile);
        assert!(accts.repo().get_user(jdoe.user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unrestorable_profile_after_failed_delete_is_inconsistent() {
        let (dir, accts, root) = setup().await;

        let jdoe = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap().user;
        std::fs::create_dir(
            dir.path().join("user_profiles").join(format!("{}.json.tmp", jdoe.id))
        ).unwrap();
        accts.repo().fail_next_delete().await;

        let res = accts.delete_user(&root, jdoe.id).await;
        assert!(matches!(res, Err(AccountError::Inconsistent { id, .. }) if id == jdoe.id));
        assert!(accts.repo().get_user(jdoe.id).await.unwrap().is_some());
        assert_eq!(accts.profiles().get(jdoe.id).await.unwrap(), None);

        let report = accts.reconcile(&root).await.unwrap();
        assert_eq!(report.users_without_profile, vec![jdoe.id]);
    }

    #[tokio::test]
    async fn looking_people_up() {
        let (_dir, accts, root) = setup().await;

        let sci = accts.create_user(&root, new_user("ravi", "ravi@lab.example", Role::Scientist))
            .await.unwrap().user;
        accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client)).await.unwrap();

        let me = accts.get_user(&sci, sci.id).await.unwrap();
        assert_eq!(me.user, sci);
        assert!(matches!(accts.get_user(&sci, root.id).await, Err(AccountError::Forbidden(_))));
        assert!(matches!(accts.list_users(&sci).await, Err(AccountError::Forbidden(_))));

        let all = accts.list_users(&root).await.unwrap();
        let unames: Vec<&str> = all.iter().map(|u| u.user.uname.as_str()).collect();
        assert_eq!(unames, vec!["root", "ravi", "jdoe"]);
        assert!(all.iter().all(|u| u.profile.is_some()));

        let clients = accts.list_role(&root, Role::Client).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].user.uname, "jdoe");

        let found = accts.search_profiles(&root, "plant engineer").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].last_name, "jdoe");
    }

    #[tokio::test]
    async fn whoami_and_scope() {
        let (_dir, accts, root) = setup().await;

        let mut guest = new_user("visitor", "visitor@x.com", Role::Guest);
        guest.profile.organization_id = Some(9);
        let guest = accts.create_user(&root, guest).await.unwrap().user;

        let w = accts.whoami(&guest).await.unwrap();
        assert_eq!(w.scope, DataScope::Shared);
        assert!(w.capabilities.contains(&Capability::UploadData));
        assert_eq!(w.profile.unwrap().organization_id, Some(9));

        let w = accts.whoami(&root).await.unwrap();
        assert_eq!(w.scope, DataScope::All);

        let client = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap().user;
        assert_eq!(accts.data_scope(&client).await.unwrap(), DataScope::Nothing);
    }

    #[tokio::test]
    async fn in_charge() {
        let (_dir, accts, root) = setup().await;

        let mut sci = new_user("ravi", "ravi@lab.example", Role::Scientist);
        sci.profile.location_id = Some(4);
        accts.create_user(&root, sci).await.unwrap();

        let mut jdoe = new_user("jdoe", "j@x.com", Role::Client);
        jdoe.profile.location_id = Some(4);
        jdoe.profile.organization_id = Some(2);
        let jdoe = accts.create_user(&root, jdoe).await.unwrap().user;

        let mut other = new_user("kdoe", "k@x.com", Role::Client);
        other.profile.organization_id = Some(3);
        let other = accts.create_user(&root, other).await.unwrap().user;

        let found = accts.in_charge_for_location(&root, 4).await.unwrap().unwrap();
        assert_eq!(found.profile.user_id, jdoe.id);
        assert_eq!(found.name, "Test jdoe");
        assert_eq!(found.email, "j@x.com");

        assert!(accts.in_charge_for_location(&root, 5).await.unwrap().is_none());
        assert!(accts.in_charge_for_location(&jdoe, 4).await.unwrap().is_some());
        assert!(accts.in_charge_for_location(&other, 4).await.unwrap().is_none());

        let guest = accts.create_user(&root, new_user("visitor", "v@x.com", Role::Guest))
            .await.unwrap().user;
        assert!(matches!(
            accts.in_charge_for_location(&guest, 4).await,
            Err(AccountError::Forbidden(_))
        ));

        // A Client with no organization has nothing in scope.
        let loose = accts.create_user(&root, new_user("ldoe", "l@x.com", Role::Client))
            .await.unwrap().user;
        assert!(matches!(
            accts.in_charge_for_location(&loose, 4).await,
            Err(AccountError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn reconciling() {
        let (dir, accts, root) = setup().await;

        let jdoe = accts.create_user(&root, new_user("jdoe", "j@x.com", Role::Client))
            .await.unwrap().user;
        let profiles_dir = dir.path().join("user_profiles");
        std::fs::remove_file(profiles_dir.join(format!("{}.json", jdoe.id))).unwrap();
        std::fs::write(profiles_dir.join("99.json"), "{}").unwrap();

        let report = accts.reconcile(&root).await.unwrap();
        assert_eq!(report, ReconcileReport {
            removed_profiles: vec![99],
            users_without_profile: vec![jdoe.id],
        });
        assert!(!profiles_dir.join("99.json").exists());

        let report = accts.reconcile(&root).await.unwrap();
        assert!(report.removed_profiles.is_empty());
    }

    /// Takes its user list, then lets one more user (row and profile)
    /// arrive before handing the list back, the way a create running
    /// alongside a reconcile would.
    struct LateArrival {
        inner: MemStore,
        profiles: ProfileStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl UserRepo for LateArrival {
        async fn insert_user(&self, new: NewAccount<'_>) -> Result<User, StoreError> {
            self.inner.insert_user(new).await
        }

        async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
            self.inner.get_user(id).await
        }

        async fn get_user_by_uname(&self, uname: &str) -> Result<Option<User>, StoreError> {
            self.inner.get_user_by_uname(uname).await
        }

        async fn get_credentials(
            &self,
            uname: &str
        ) -> Result<Option<(User, String)>, StoreError> {
            self.inner.get_credentials(uname).await
        }

        async fn get_users(&self) -> Result<Vec<User>, StoreError> {
            let users = self.inner.get_users().await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let u = self.inner.insert_user(NewAccount {
                    uname: "late",
                    email: "late@x.com",
                    hashed_password: "x",
                    role: Role::Guest,
                }).await?;
                let p = Profile::from_data(u.id, ProfileData {
                    first_name: "Late".to_owned(),
                    last_name: "Comer".to_owned(),
                    ..Default::default()
                }, None);
                self.profiles.create(&p).await
                    .map_err(|e| StoreError::Db(DbError::from(e.to_string())))?;
            }
            Ok(users)
        }

        async fn update_user(
            &self,
            id: i64,
            changes: &AccountChanges
        ) -> Result<User, StoreError> {
            self.inner.update_user(id, changes).await
        }

        async fn delete_user(&self, id: i64) -> Result<(), StoreError> {
            self.inner.delete_user(id).await
        }
    }

    #[tokio::test]
    async fn reconcile_spares_users_created_meanwhile() {
        ensure_logging();
        let dir = tempfile::tempdir().unwrap();
        let profiles = ProfileStore::new(dir.path().join("user_profiles"));
        let repo = LateArrival {
            inner: MemStore::new(),
            profiles: profiles.clone(),
            armed: AtomicBool::new(false),
        };
        let accts = Accounts::new(repo, profiles, Hasher::new(4));
        let root = accts.ensure_default_admin(
            "root", "root@plant.example", "rootpassword"
        ).await.unwrap();

        accts.repo().armed.store(true, Ordering::SeqCst);
        let report = accts.reconcile(&root).await.unwrap();
        assert_eq!(report, ReconcileReport::default());

        let late = accts.repo().get_user_by_uname("late").await.unwrap().unwrap();
        assert!(accts.profiles().get(late.id).await.unwrap().is_some());

        let report = accts.reconcile(&root).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(accts.profiles().ids().await.unwrap(), vec![root.id, late.id]);
    }

    #[tokio::test]
    async fn importing() {
        let (_dir, accts, root) = setup().await;

        let good = "\
jdoe, j@x.com,       hunter2hunter2, Client,    Jane, Doe,   021 555 0199, Plant Engineer, Operations, 4, 2
ravi, r@lab.example, correct-horse,  Scientist, Ravi, Singh
";
        assert_eq!(accts.import_csv(&root, good.as_bytes()).await.unwrap(), 2);
        let jdoe = accts.repo().get_user_by_uname("jdoe").await.unwrap().unwrap();
        let p = accts.profiles().get(jdoe.id).await.unwrap().unwrap();
        assert_eq!(p.organization_id, Some(2));

        let twice = "\
kdoe, k@x.com, hunter2hunter2, Guest, Kim, Doe
kdoe, l@x.com, hunter2hunter2, Guest, Lee, Doe
";
        assert!(matches!(accts.import_csv(&root, twice.as_bytes()).await, Err(AccountError::Csv(_))));

        // The second row collides with an existing user, so the first row
        // is rolled back.
        let clash = "\
mdoe, m@x.com, hunter2hunter2, Guest, Mia, Doe
jdoe, n@x.com, hunter2hunter2, Guest, Ned, Doe
";
        assert!(matches!(
            accts.import_csv(&root, clash.as_bytes()).await,
            Err(AccountError::DuplicateUname(_))
        ));
        assert!(accts.repo().get_user_by_uname("mdoe").await.unwrap().is_none());
        assert_eq!(accts.repo().get_users().await.unwrap().len(), 3);

        let sci = accts.repo().get_user_by_uname("ravi").await.unwrap().unwrap();
        assert!(matches!(
            accts.import_csv(&sci, good.as_bytes()).await,
            Err(AccountError::Forbidden(_))
        ));
    }
}
