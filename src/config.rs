/*!
Structs to hold configuration data and global variables.
*/
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::{
    accounts::Accounts,
    auth::{Hasher, DEFAULT_COST},
    profile::ProfileStore,
    store::Store,
    user::User,
};

#[derive(Deserialize)]
struct ConfigFile {
    data_db_connect_string: Option<String>,
    profiles_dir: Option<PathBuf>,
    admin_uname: Option<String>,
    admin_password: Option<String>,
    admin_email: Option<String>,
    bcrypt_cost: Option<u32>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug)]
pub struct Cfg {
    pub data_db_connect_string: String,
    pub profiles_dir: PathBuf,
    pub default_admin_uname: String,
    pub default_admin_password: String,
    pub default_admin_email: String,
    pub bcrypt_cost: u32,
    pub addr: SocketAddr,
}

impl std::default::Default for Cfg {
    fn default() -> Self {
        Self {
            data_db_connect_string: "host=localhost user=roster_test password='roster_test' dbname=roster_store_test".to_owned(),
            profiles_dir: PathBuf::from("data/user_profiles"),
            default_admin_uname: "root".to_owned(),
            default_admin_password: "rootpassword".to_owned(),
            default_admin_email: "admin@roster.not.an.address".to_owned(),
            bcrypt_cost: DEFAULT_COST,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8001),
        }
    }
}

impl Cfg {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let cf: ConfigFile = toml::from_str(text)
            .map_err(|e| format!("Unable to deserialize config file: {}", &e))?;

        let mut c = Self::default();

        if let Some(s) = cf.data_db_connect_string {
            c.data_db_connect_string = s;
        }
        if let Some(p) = cf.profiles_dir {
            c.profiles_dir = p;
        }
        if let Some(s) = cf.admin_uname {
            c.default_admin_uname = s;
        }
        if let Some(s) = cf.admin_password {
            c.default_admin_password = s;
        }
        if let Some(s) = cf.admin_email {
            c.default_admin_email = s;
        }
        if let Some(n) = cf.bcrypt_cost {
            c.bcrypt_cost = n;
        }
        if let Some(s) = cf.host {
            c.addr.set_ip(
                s.parse().map_err(|e| format!(
                    "Error parsing {:?} as IP address: {}",
                    &s, &e
                ))?
            );
        }
        if let Some(n) = cf.port {
            c.addr.set_port(n);
        }

        Ok(c)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Unable to read config file {}: {}", path.display(), &e))?;
        Self::from_toml(&file_contents)
    }
}

/**
This guy hauls around the account service and the default admin, and gets
handed to whatever needs them.
*/
pub struct Glob {
    pub accounts: Arc<Accounts<Store>>,
    pub default_admin: User,
    pub addr: SocketAddr,
}

/// Loads system configuration and ensures the `users` table and profile
/// directory exist.
///
/// Also assures existence of default admin.
pub async fn load_configuration<P: AsRef<Path>>(path: P) -> Result<Glob, String> {
    let cfg = Cfg::from_file(path.as_ref())?;
    log::info!(
        "Configuration file read: data DB {:?}, profiles in {}, listening on {}",
        &cfg.data_db_connect_string, cfg.profiles_dir.display(), &cfg.addr
    );

    log::trace!("Checking state of data DB...");
    let data_db = Store::new(cfg.data_db_connect_string.clone());
    if let Err(e) = data_db.ensure_db_schema().await {
        let estr = format!("Unable to ensure state of data DB: {}", &e);
        return Err(estr);
    }
    log::trace!("...data DB okay.");

    log::trace!("Checking profile directory...");
    let profiles = ProfileStore::new(&cfg.profiles_dir);
    if let Err(e) = profiles.ensure_dir().await {
        let estr = format!("Unable to ensure profile directory: {}", &e);
        return Err(estr);
    }
    log::trace!("...profile directory okay.");

    let hasher = Hasher::new(cfg.bcrypt_cost);
    if hasher.cost() != cfg.bcrypt_cost {
        log::warn!(
            "bcrypt_cost {} is out of range; using {}.",
            cfg.bcrypt_cost, hasher.cost()
        );
    }
    let accounts = Accounts::new(data_db, profiles, hasher);

    log::trace!("Checking existence of default admin...");
    let default_admin = accounts.ensure_default_admin(
        &cfg.default_admin_uname,
        &cfg.default_admin_email,
        &cfg.default_admin_password,
    ).await.map_err(|e| format!(
        "Error ensuring default admin ({}): {}",
        &cfg.default_admin_uname, &e
    ))?;
    log::trace!("Default admin OK.");

    let glob = Glob {
        accounts: Arc::new(accounts),
        default_admin,
        addr: cfg.addr,
    };

    Ok(glob)
}
