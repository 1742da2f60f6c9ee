//! Line-oriented inference worker: one JSON request per stdin line, one JSON
//! response per stdout line. Logs go to stderr.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use autotagger::TaggerError;
use autotagger::config::AppConfig;
use autotagger::dispatch::DispatchPool;
use autotagger::model::{self, Vocabulary};
use autotagger::protocol::{self, PoolHandler};

fn run() -> Result<(), TaggerError> {
    let config = AppConfig::load()?;
    let vocabulary = Arc::new(Vocabulary::load(&config.tags_path)?);
    let loader = model::build_loader(&config)?;
    let pool = DispatchPool::start(loader, vocabulary, config.gpu_parallelism)?;
    log::info!(
        "Worker ready: mode={}, replicas={}",
        pool.mode(),
        pool.replica_count()
    );

    let handler = PoolHandler::new(&pool);
    let summary = protocol::serve(io::stdin().lock(), io::stdout().lock(), &handler)?;
    log::info!(
        "Input closed after {} requests ({} failed)",
        summary.handled,
        summary.failed
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Worker stopped: {}", e.describe());
            ExitCode::FAILURE
        }
    }
}
