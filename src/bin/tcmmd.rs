use clap::Parser;
use tcmmd::config::Config;
use tcmmd::daemon;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cfg = Config::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    } else {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    log::info!("tcmmd starting");

    if let Err(err) = daemon::run(cfg).await {
        log::error!("fatal: {err:#}");
        std::process::exit(1);
    }

    log::info!("tcmmd exited cleanly");
}
