use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use vmexec::compile::CompilationHandler;
use vmexec::config::{CliArgs, Config};
use vmexec::database as db;
use vmexec::pipeline::JobPipeline;
use vmexec::queue::Broker;
use vmexec::vm::{
    FilesystemPooler, FirecrackerBackend, ImageCopyProvisioner, VmLaunchManager, VmRole,
};
use vmexec::web_server::build_server;
use vmexec::worker::DispatchWorker;

const DEFAULT_BASE_IMAGES_DIR: &str = "/app/firecracker/images";

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        executor: executor_config,
        broker: broker_config,
        workers: workers_config,
        firecracker: firecracker_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let db_path = match broker_config.database_path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    let broker = Arc::new(db::SqliteBroker::new(
        db_pool.clone(),
        broker_config.poll_interval.map(|ms| ms.as_duration()),
    ));

    let filesystems_dir = match &executor_config.pool.filesystems_dir {
        Some(dir) => dir.clone(),
        None => db::get_data_dir()?.join("filesystems"),
    };
    let base_images_dir = executor_config
        .pool
        .base_images_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_IMAGES_DIR));
    let provisioner = Arc::new(ImageCopyProvisioner::build(base_images_dir, filesystems_dir)?);
    let backend = Arc::new(FirecrackerBackend::build(firecracker_config)?);

    let executor_config = Arc::new(executor_config);
    let pooler = Arc::new(FilesystemPooler::new(provisioner, &executor_config));
    let manager = VmLaunchManager::new(executor_config.clone(), backend, pooler.clone());
    let compiler = Arc::new(CompilationHandler::new(
        executor_config.clone(),
        manager.clone(),
    ));
    let pipeline = Arc::new(JobPipeline::new(
        executor_config.clone(),
        manager.clone(),
        compiler.clone(),
    ));

    let shutdown_token = CancellationToken::new();
    let audit_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    if let Err(e) = pooler.maintain().await {
        log::warn!("Initial filesystem staging failed: {e:#}");
    }

    let mut daemons = JoinSet::new();
    daemons.spawn(db::audit_terminations(
        db_pool,
        manager.subscribe(),
        audit_token.clone(),
    ));
    daemons.spawn(pooler.clone().run(shutdown_token.clone()));
    daemons.spawn(manager.clone().run(shutdown_token.clone()));
    {
        let compiler = compiler.clone();
        let manager = manager.clone();
        let executor_target = executor_config.cache_target(VmRole::Executor);
        daemons.spawn(async move {
            compiler.warm_up().await;
            manager.warm_up(VmRole::Executor, executor_target).await;
        });
    }

    let mut workers = JoinSet::new();
    for service in [workers_config.executor.clone(), workers_config.validator.clone()] {
        let worker = Arc::new(DispatchWorker::new(
            service,
            broker.clone() as Arc<dyn Broker>,
            pipeline.clone(),
            &workers_config,
        ));
        workers.spawn(worker.run(shutdown_token.clone()));
    }

    let server = build_server(
        server_config,
        pipeline,
        pooler.clone(),
        shutdown_token.clone(),
    )
    .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Stop consuming, let workers drain their in-flight jobs
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    // 3. Tear down every VM, then the staged filesystems
    manager.shutdown().await;
    pooler.shutdown().await;

    // 4. Flush the termination audit and stop the daemons
    audit_token.cancel();
    while let Some(res) = daemons.join_next().await {
        if let Err(e) = res {
            log::error!("Background task failed: {:?}", e);
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
