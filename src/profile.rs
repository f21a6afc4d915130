/*!
The flat-file half of the account store.

Each profile lives in `<dir>/<user id>.json`. Files are replaced whole: the
new contents go to `<user id>.json.tmp`, which is then renamed over the old
file, so a reader sees either the old profile or the new one.
*/
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::user::{Profile, ProfilePatch};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed profile {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("a profile already exists for user {0}")]
    Exists(i64),
    #[error("there is no profile for user {0}")]
    NotFound(i64),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ProfileError + '_ {
    move |source| ProfileError::Io { path: path.to_owned(), source }
}

#[derive(Clone, Debug)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_owned() }
    }

    pub fn path_for(&self, user_id: i64) -> PathBuf {
        self.dir.join(format!("{}.json", user_id))
    }

    pub async fn ensure_dir(&self) -> Result<(), ProfileError> {
        tokio::fs::create_dir_all(&self.dir).await
            .map_err(io_err(&self.dir))
    }

    async fn write(&self, p: &Profile) -> Result<(), ProfileError> {
        let path = self.path_for(p.user_id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", p.user_id));

        let bytes = serde_json::to_vec_pretty(p)
            .map_err(|source| ProfileError::Json { path: path.clone(), source })?;
        tokio::fs::write(&tmp_path, &bytes).await
            .map_err(io_err(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &path).await
            .map_err(io_err(&path))?;

        Ok(())
    }

    /// Write a new profile. Fails with `Exists` rather than overwrite.
    pub async fn create(&self, p: &Profile) -> Result<(), ProfileError> {
        log::trace!("ProfileStore::create( [ profile for {} ] ) called.", p.user_id);

        self.ensure_dir().await?;
        let path = self.path_for(p.user_id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => { return Err(ProfileError::Exists(p.user_id)); },
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => { return Err(io_err(&path)(e)); },
        }

        self.write(p).await?;
        log::info!("Created profile for user {}.", p.user_id);
        Ok(())
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<Profile>, ProfileError> {
        let path = self.path_for(user_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => { return Ok(None); },
            Err(e) => { return Err(io_err(&path)(e)); },
        };

        let p: Profile = serde_json::from_str(&text)
            .map_err(|source| ProfileError::Json { path, source })?;
        Ok(Some(p))
    }

    pub async fn update(
        &self,
        user_id: i64,
        patch: &ProfilePatch
    ) -> Result<Profile, ProfileError> {
        log::trace!("ProfileStore::update( {}, {:?} ) called.", user_id, patch);

        let mut p = self.get(user_id).await?
            .ok_or(ProfileError::NotFound(user_id))?;
        p.apply(patch);
        self.write(&p).await?;

        log::info!("Updated profile for user {}.", user_id);
        Ok(p)
    }

    /// Write `p` whether or not a profile already exists.
    pub async fn replace(&self, p: &Profile) -> Result<(), ProfileError> {
        self.ensure_dir().await?;
        self.write(p).await
    }

    /// Returns whether there was a file to remove.
    pub async fn delete(&self, user_id: i64) -> Result<bool, ProfileError> {
        let path = self.path_for(user_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::info!("Deleted profile for user {}.", user_id);
                Ok(true)
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("No profile to delete for user {}.", user_id);
                Ok(false)
            },
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// User ids of every profile file present, in order.
    ///
    /// Files that aren't named `<integer>.json` are ignored with a warning.
    pub async fn ids(&self) -> Result<Vec<i64>, ProfileError> {
        self.ensure_dir().await?;

        let mut entries = tokio::fs::read_dir(&self.dir).await
            .map_err(io_err(&self.dir))?;
        let mut ids: Vec<i64> = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<i64>) {
                Some(Ok(id)) => { ids.push(id); },
                _ => {
                    log::warn!("Invalid profile filename: {}", path.display());
                },
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Every readable profile. Unreadable ones are logged and skipped.
    pub async fn all(&self) -> Result<Vec<Profile>, ProfileError> {
        let ids = self.ids().await?;
        let mut profiles: Vec<Profile> = Vec::with_capacity(ids.len());

        for id in ids.into_iter() {
            match self.get(id).await {
                Ok(Some(p)) => { profiles.push(p); },
                Ok(None) => {},
                Err(e) => { log::error!("Skipping profile {}: {}", id, &e); },
            }
        }

        Ok(profiles)
    }

    /// Case-insensitive substring search over first name, last name,
    /// designation and department.
    pub async fn search(&self, query: &str) -> Result<Vec<Profile>, ProfileError> {
        let query = query.trim().to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&query);

        let profiles = self.all().await?
            .into_iter()
            .filter(|p| {
                hit(&p.first_name)
                    || hit(&p.last_name)
                    || p.designation.as_deref().map(hit).unwrap_or(false)
                    || p.department.as_deref().map(hit).unwrap_or(false)
            })
            .collect();

        Ok(profiles)
    }
}
