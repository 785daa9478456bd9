use anyhow::Result;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let port = authn::cli::start()?;
    let config = Arc::new(authn::config::Config::from_env()?);
    authn::api::serve(port, config).await
}
