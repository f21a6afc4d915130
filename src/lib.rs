/*!
User accounts split across two stores: credentials and roles in a Postgres
`users` table, extended profiles in one JSON file per user.

The `accounts` module ties the two together; `inter` puts an HTTP face on
it.
*/
pub mod accounts;
pub mod auth;
pub mod config;
pub mod inter;
pub mod profile;
pub mod store;
pub mod user;
pub mod valid;

pub fn log_level_from_env() -> simplelog::LevelFilter {
    use simplelog::LevelFilter;

    let mut level_string = match std::env::var("LOG_LEVEL") {
        Err(_) => { return LevelFilter::Warn; },
        Ok(s) => s,
    };

    level_string.make_ascii_lowercase();
    match level_string.as_str() {
        "max" => LevelFilter::max(),
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

/// Start terminal logging filtered to this crate.
///
/// Returns an error if a logger has already been installed.
pub fn init_logging() -> Result<(), String> {
    use simplelog::{ColorChoice, TermLogger, TerminalMode};

    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("roster")
        .build();
    TermLogger::init(
        log_level_from_env(),
        log_cfg,
        TerminalMode::Stdout,
        ColorChoice::Auto
    ).map_err(|e| format!("Unable to start logging: {}", &e))
}
