use sonami_sync::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;

    if std::env::args().any(|arg| arg == "--maintenance") {
        let report = sonami_sync::run_maintenance(config).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    sonami_sync::run(config).await?;
    Ok(())
}
