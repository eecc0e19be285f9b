//! `bn` executable: configuration, archive lifecycle, and the node runner.

use std::fs::{self, File};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use bn_archive::{genesis_block, Archive};
use bn_node::config::{self, Config, Subcommand};
use bn_node::node::FullNode;
use bn_node::p2p::PeerRegistry;
use bn_node::session;
use bn_storage::fjall::FjallStore;
use fs2::FileExt;

fn main() -> ExitCode {
    let config = match config::load(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    bn_log::init(config.log_config());

    let result = match config.subcommand {
        Subcommand::Help => {
            println!("{}", config::usage());
            Ok(())
        }
        Subcommand::Version => {
            println!("bn {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Subcommand::Settings => do_settings(&config),
        Subcommand::Hardware => {
            do_hardware();
            Ok(())
        }
        Subcommand::Initchain => do_initchain(&config),
        Subcommand::Newstore => do_newstore(&config),
        Subcommand::Backup => do_backup(&config),
        Subcommand::Restore => do_restore(&config),
        Subcommand::Run => do_run(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn do_settings(config: &Config) -> Result<(), String> {
    let rendered =
        serde_json::to_string_pretty(config).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}

fn do_hardware() {
    #[cfg(target_arch = "x86_64")]
    {
        println!("sse4.1: {}", std::arch::is_x86_feature_detected!("sse4.1"));
        println!("avx2: {}", std::arch::is_x86_feature_detected!("avx2"));
        println!("aes: {}", std::arch::is_x86_feature_detected!("aes"));
        println!("sha: {}", std::arch::is_x86_feature_detected!("sha"));
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        println!("architecture: {}", std::env::consts::ARCH);
    }
}

/// Create the archive directory and write the configured genesis block.
fn do_initchain(config: &Config) -> Result<(), String> {
    let dir = &config.database.dir;
    if dir.exists() {
        return Err(format!("directory {} already exists", dir.display()));
    }
    fs::create_dir_all(dir).map_err(|err| err.to_string())?;

    let params = config.chain_params()?;
    let store = Arc::new(FjallStore::open(dir).map_err(|err| err.to_string())?);
    let archive = Archive::new(store.clone(), params.consensus, config.database.filter);
    let genesis = genesis_block(archive.params());
    archive.initialize(&genesis).map_err(|err| err.to_string())?;
    store.persist().map_err(|err| err.to_string())?;
    bn_log::log_info!(
        "initialized {} chain in {}",
        config.bitcoin.network,
        dir.display()
    );
    Ok(())
}

fn do_newstore(config: &Config) -> Result<(), String> {
    let dir = &config.database.dir;
    if dir.exists() {
        return Err(format!("directory {} already exists", dir.display()));
    }
    fs::create_dir_all(dir).map_err(|err| err.to_string())?;
    let store = FjallStore::open(dir).map_err(|err| err.to_string())?;
    store.persist().map_err(|err| err.to_string())?;
    bn_log::log_info!("created empty archive in {}", dir.display());
    Ok(())
}

fn backup_dir(config: &Config) -> std::path::PathBuf {
    let mut backup = config.database.dir.clone().into_os_string();
    backup.push(".backup");
    backup.into()
}

fn do_backup(config: &Config) -> Result<(), String> {
    let source = &config.database.dir;
    if !source.exists() {
        return Err(format!("directory {} does not exist", source.display()));
    }
    let target = backup_dir(config);
    if target.exists() {
        fs::remove_dir_all(&target).map_err(|err| err.to_string())?;
    }
    copy_tree(source, &target)?;
    bn_log::log_info!("archived {} to {}", source.display(), target.display());
    Ok(())
}

fn do_restore(config: &Config) -> Result<(), String> {
    let source = backup_dir(config);
    if !source.exists() {
        return Err(format!("backup {} does not exist", source.display()));
    }
    let target = &config.database.dir;
    if target.exists() {
        fs::remove_dir_all(target).map_err(|err| err.to_string())?;
    }
    copy_tree(&source, target)?;
    bn_log::log_info!("restored {} from {}", target.display(), source.display());
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), String> {
    fs::create_dir_all(target).map_err(|err| err.to_string())?;
    for entry in fs::read_dir(source).map_err(|err| err.to_string())? {
        let entry = entry.map_err(|err| err.to_string())?;
        let kind = entry.file_type().map_err(|err| err.to_string())?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if kind.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|err| err.to_string())?;
        }
    }
    Ok(())
}

fn do_run(config: &Config) -> Result<(), String> {
    let dir = &config.database.dir;
    if !dir.exists() {
        return Err(format!(
            "chain is uninitialized: {} does not exist (run `bn initchain`)",
            dir.display()
        ));
    }

    // One process per archive directory.
    let lock_path = dir.join(".lock");
    let lock_file = File::create(&lock_path).map_err(|err| err.to_string())?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| format!("archive {} is locked by another process", dir.display()))?;

    let params = config.chain_params()?;
    let store = Arc::new(FjallStore::open(dir).map_err(|err| err.to_string())?);
    let archive = Arc::new(Archive::new(
        store.clone(),
        params.consensus.clone(),
        config.database.filter,
    ));
    if !archive.is_initialized().map_err(|err| err.to_string())? {
        return Err("chain is uninitialized (run `bn initchain`)".to_string());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| err.to_string())?;

    let mut node = FullNode::new(Arc::clone(&archive), config.clone());
    node.start()?;
    let handle = node.handle().ok_or("node not started")?;
    let registry = Arc::new(PeerRegistry::new());

    // Inbound listener.
    if let Some(bind) = config.network.bind {
        let handle = handle.clone();
        let registry = Arc::clone(&registry);
        let magic = params.message_start;
        runtime.spawn(async move {
            let listener = match tokio::net::TcpListener::bind(bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    bn_log::log_error!("cannot bind {bind}: {err}");
                    return;
                }
            };
            if let Err(err) = session::run_inbound(handle, listener, magic, registry).await {
                bn_log::log_error!("inbound session failed: {err}");
            }
        });
    }

    // Outbound connections, redialed with a fixed backoff.
    for connect in &config.network.connect {
        let target = connect.clone();
        let default_port = params.default_port;
        let handle = handle.clone();
        let registry = Arc::clone(&registry);
        let magic = params.message_start;
        runtime.spawn(async move {
            let mut stopping = handle.stopping();
            loop {
                if handle.closed() {
                    return;
                }
                let addr = match resolve_peer(&target, default_port) {
                    Some(addr) => addr,
                    None => {
                        bn_log::log_warn!("cannot resolve peer {target}");
                        return;
                    }
                };
                match session::run_outbound(handle.clone(), addr, magic, Arc::clone(&registry))
                    .await
                {
                    Ok(()) => return,
                    Err(err) => bn_log::log_session!("peer {target}: {err}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(5)) => {}
                    _ = stopping.changed() => return,
                }
            }
        });
    }

    // Block until a signal or an internal fault stops the node. The stop
    // latch collapses concurrent signal and fault paths to one.
    let inner = node.inner();
    runtime.block_on(async move {
        let mut stopping = inner.stopping();
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install signal handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    bn_log::log_info!("interrupt received, stopping");
                }
                _ = terminate.recv() => {
                    bn_log::log_info!("termination received, stopping");
                }
                _ = stopping.changed() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    bn_log::log_info!("interrupt received, stopping");
                }
                _ = stopping.changed() => {}
            }
        }
    });

    node.stop();
    let fault = node.close();
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    store.persist().map_err(|err| err.to_string())?;
    let _ = fs::remove_file(&lock_path);

    match fault {
        Some(code) if !code.is_shutdown() => Err(format!("node fault: {code}")),
        _ => Ok(()),
    }
}

fn resolve_peer(target: &str, default_port: u16) -> Option<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    if let Ok(addr) = target.parse() {
        return Some(addr);
    }
    let with_port = format!("{target}:{default_port}");
    with_port.to_socket_addrs().ok()?.next()
}
