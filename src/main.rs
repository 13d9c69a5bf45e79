use std::sync::Arc;
use std::thread;

use anyhow::Result;
use log::{error, info};
use tokio::runtime::Builder;
use tokio::sync::broadcast;

use cyanopica::catalog::Catalog;
use cyanopica::config::AppConfig;
use cyanopica::storage::{FsObjectStore, ObjectStore};
use cyanopica::workflow::activities::PipelineContext;
use cyanopica::workflow::store::WorkflowStore;
use cyanopica::workflow::{Worker, WorkflowEngine};
use cyanopica::{AppContext, build_rocket};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    config.ensure_directories()?;

    // Everything is wired here; no component reaches for globals, so
    // teardown order is explicit at the bottom of this function.
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.storage_dir.clone()));
    let catalog = Arc::new(Catalog::open(config.catalog_db_path())?);
    let workflow_store = Arc::new(WorkflowStore::open(config.workflow_db_path())?);
    let pipeline = Arc::new(PipelineContext {
        store: store.clone(),
        catalog: catalog.clone(),
    });
    let engine = Arc::new(WorkflowEngine::new(workflow_store, pipeline));
    let worker = Worker::new(engine.clone(), config.worker_concurrency);

    let context = Arc::new(AppContext {
        config,
        store,
        catalog,
        engine,
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Worker gets its own runtime so CPU-heavy activities never starve the
    // HTTP acceptor. Tasks interrupted by shutdown stay leased in the store
    // and are re-claimed on the next start.
    let worker_handle = thread::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        move || {
            let runtime = Builder::new_multi_thread()
                .thread_name("pipeline-worker")
                .enable_all()
                .build()
                .expect("Failed to build worker runtime");
            runtime.block_on(worker.run(shutdown_rx));
        }
    });

    let rocket_runtime = Builder::new_multi_thread()
        .thread_name("rocket-io-worker")
        .enable_all()
        .build()
        .expect("Failed to build Rocket runtime");

    let result =
        rocket_runtime.block_on(async { build_rocket(context).ignite().await?.launch().await });

    // Rocket returned (ctrl-c or launch failure): stop the worker as well.
    let _ = shutdown_tx.send(());
    worker_handle.join().expect("Worker thread panicked");

    match result {
        Ok(_) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(err) => {
            error!("Rocket server failed: {err}");
            Err(anyhow::Error::from(err))
        }
    }
}
