use std::fs;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use judged::cache::TaskCache;
use judged::config::CliArgs;
use judged::frontend::Frontend;
use judged::queue::JudgeQueue;
use judged::web_server::build_server;
use judged::worker::judge_worker;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();
    env_logger::init_from_env(
        env_logger::Env::new().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    );

    let settings = Arc::new(cli.load_settings().expect("Failed to load configuration"));
    fs::create_dir_all(&settings.run_dir).expect("Failed to create run directory");

    let cache = Arc::new(
        TaskCache::init(&settings.cache_dir).expect("Failed to initialize task info cache"),
    );
    let queue = Arc::new(JudgeQueue::new());
    let frontend = Frontend::new(settings.frontend_url.clone(), settings.secret_key.clone());
    let token = CancellationToken::new();

    let mut handles = Vec::new();
    handles.push(tokio::spawn(cache.clone().update_worker(
        frontend.clone(),
        queue.clone(),
        token.clone(),
    )));
    for id in 0..settings.workers {
        handles.push(tokio::spawn(judge_worker(
            id,
            settings.clone(),
            queue.clone(),
            frontend.clone(),
            token.clone(),
        )));
    }

    build_server(settings.clone(), cache.clone(), queue, frontend)
        .expect("Failed to start server")
        .await?;

    log::info!("waiting for all queued submissions to finish judging");
    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("worker task failed to join: {e}");
        }
    }

    if let Err(e) = cache.shutdown() {
        log::error!("failed to persist task info paths: {e:#}");
    }
    if let Err(e) = fs::remove_dir_all(&settings.run_dir) {
        log::warn!("failed to remove run directory: {e}");
    }

    Ok(())
}
