//! Phobos LRS daemon entry point, grounded on the teacher's service
//! binaries: parse CLI, resolve config, init tracing, wire the registry,
//! serve the socket until a signal asks us to stop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use fs2::FileExt;
use tracing::{error, info, warn};

use phobos_lrs::backend::mock::{MockDeviceAdapter, MockFilesystemAdapter, MockLibraryAdapter};
use phobos_lrs::backend::FamilyBackend;
use phobos_lrs::comm::CommServer;
use phobos_lrs::config::Opts;
use phobos_lrs::dss::etcd::EtcdDss;
use phobos_lrs::dss::memory::MemoryDss;
use phobos_lrs::dss::Dss;
use phobos_lrs::logging;
use phobos_lrs::registry::Registry;

fn main() {
    let opts = Opts::parse();
    let log_level = opts.log_level.clone();
    let config = match opts.resolve() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to resolve configuration: {err}");
            std::process::exit(1);
        }
    };

    logging::init(&log_level);

    info!(host = %config.host, family = %config.family, socket = %config.socket_path.display(), "starting phobosd");

    let _lock_file_guard = match acquire_singleton_lock(&config.lock_file) {
        Ok(file) => file,
        Err(err) => {
            error!(error = %err, path = %config.lock_file.display(), "another phobosd instance already owns this lock file");
            std::process::exit(1);
        }
    };

    let dss: Arc<dyn Dss> = match &config.dss_endpoint {
        Some(endpoint) => match EtcdDss::connect(endpoint) {
            Ok(dss) => Arc::new(dss),
            Err(err) => {
                error!(error = %err, "failed to connect to etcd DSS");
                std::process::exit(1);
            }
        },
        None => {
            warn!("no dss_endpoint configured, using the in-memory DSS (state does not survive a restart)");
            Arc::new(MemoryDss::new())
        }
    };

    // Real per-family device/library/filesystem adapters (SCSI changer
    // driver, LTFS bindings, ...) are an external collaborator this crate
    // only defines trait boundaries for (see `backend`); production
    // deployments plug in per-family crates implementing
    // `DeviceAdapter`/`LibraryAdapter`/`FilesystemAdapter` here.
    warn!("using mock device/library/filesystem adapters; wire real per-family back-ends for production use");
    let backend = FamilyBackend {
        device: Arc::new(MockDeviceAdapter::new()),
        library: Arc::new(MockLibraryAdapter::new()),
        filesystem: Arc::new(MockFilesystemAdapter::new()),
    };

    let config = Arc::new(config);
    let registry = Registry::new(config.clone(), dss, backend);
    if let Err(err) = registry.bootstrap() {
        error!(error = %err, "startup bootstrap failed");
        std::process::exit(1);
    }

    let server = match CommServer::bind(&config.socket_path, registry.clone()) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            error!(error = %err, "failed to bind comm socket");
            std::process::exit(1);
        }
    };

    spawn_signal_listener(registry.clone(), server.clone());

    server.serve();
    info!("phobosd exiting");
}

/// Takes an exclusive advisory lock on `path`, preventing two daemon
/// instances from managing the same host/family pair at once (spec §6
/// "Persistent state layout").
fn acquire_singleton_lock(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    let file = std::fs::OpenOptions::new().create(true).write(true).open(path)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

/// Runs `tokio::signal::unix::signal` on a dedicated thread with its own
/// single-threaded runtime, the same bridging shape `dss::etcd` uses to
/// drive async I/O from a daemon that is otherwise plain OS threads.
fn spawn_signal_listener(registry: Arc<Registry>, server: Arc<CommServer>) {
    std::thread::Builder::new()
        .name("phobos-signals".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to start signal-listener runtime");
            runtime.block_on(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
                tokio::select! {
                    _ = sigint.recv() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                info!("shutdown signal received, draining in-flight requests");
                registry.request_shutdown();
                server.shutdown_handle().store(true, Ordering::SeqCst);
            });
        })
        .expect("failed to start signal-listener thread");
}
