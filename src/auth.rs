/*!
Password digests and credential checks.

Digests are bcrypt strings, which carry their own salt. Hashing is slow on
purpose, so it happens on tokio's blocking pool.
*/
use crate::user::User;

pub const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("password hashing failed: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
    #[error("password hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, PartialEq)]
pub enum AuthResult {
    Ok(User),
    NoSuchUser,
    BadPassword,
}

#[derive(Clone, Copy, Debug)]
pub struct Hasher {
    cost: u32,
}

impl Default for Hasher {
    fn default() -> Self { Self { cost: DEFAULT_COST } }
}

impl Hasher {
    /// `cost` is clamped to what bcrypt accepts (4 through 31).
    pub fn new(cost: u32) -> Self {
        Self { cost: cost.clamp(4, 31) }
    }

    pub fn cost(&self) -> u32 { self.cost }

    pub async fn hash(&self, password: &str) -> Result<String, HashError> {
        let password = password.to_owned();
        let cost = self.cost;
        let digest = tokio::task::spawn_blocking(move || {
            bcrypt::hash(password, cost)
        }).await??;
        Ok(digest)
    }

    /// A malformed stored digest counts as a mismatch (and is logged), not
    /// as an error.
    pub async fn verify(&self, password: &str, digest: &str) -> Result<bool, HashError> {
        let password = password.to_owned();
        let digest = digest.to_owned();
        let res = tokio::task::spawn_blocking(move || {
            bcrypt::verify(password, &digest)
        }).await?;

        match res {
            Ok(b) => Ok(b),
            Err(e) => {
                log::warn!("Stored password digest unusable: {}", &e);
                Ok(false)
            },
        }
    }
}
