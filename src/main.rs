/*!
Here we go!

```bash
roster [config.toml]
```
*/
use roster::{config, inter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), String> {
    roster::init_logging()?;
    log::info!("Logging started.");

    let cfg_path = std::env::args().nth(1)
        .unwrap_or_else(|| "config.toml".to_owned());
    log::info!("Reading configuration from {:?}.", &cfg_path);

    let glob = config::load_configuration(&cfg_path).await
        .map_err(|e| {
            log::error!("Error loading configuration: {}", &e);
            e
        })?;

    let app = inter::router(glob.accounts.clone());

    log::info!("Listening on {}", &glob.addr);

    axum::Server::bind(&glob.addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| format!("Server error: {}", &e))
}
