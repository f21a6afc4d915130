/*!
Bulk-load users from a CSV file, acting as the configured default admin.

```bash
roster-import config.toml users.csv
```

See `roster::user::NewUser::from_csv_line()` for the row format. Either
every row is imported or none are.
*/
use roster::config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), String> {
    roster::init_logging()?;

    let mut args = std::env::args().skip(1);
    let (cfg_path, csv_path) = match (args.next(), args.next()) {
        (Some(c), Some(u)) => (c, u),
        _ => {
            return Err("usage: roster-import <config.toml> <users.csv>".to_owned());
        },
    };

    let csv_text = std::fs::read_to_string(&csv_path)
        .map_err(|e| format!("Unable to read {:?}: {}", &csv_path, &e))?;

    let glob = config::load_configuration(&cfg_path).await?;

    let n = glob.accounts
        .import_csv(&glob.default_admin, csv_text.as_bytes())
        .await
        .map_err(|e| format!("Error importing users from {:?}: {}", &csv_path, &e))?;

    println!("Imported {} user(s) from {}.", n, &csv_path);
    Ok(())
}
