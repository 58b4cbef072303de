use {
    anyhow::{Context, Error, anyhow, ensure},
    arguments::Arguments,
    bitcoin::{block, hashes::Hash},
    clap::Parser,
    config::CliConfigProvider,
    eventbus::TracingEventBus,
    peernet::{
        BlockchainStore, CHUNK_SIZE, ChainId, ConfigProvider, EventBus, HEADER_SIZE, HeaderBytes,
        HeaderRecord, Interface, NetworkSupervisor, PeerError, ProxyConfig, Result as PeerResult,
        ServerAddr,
    },
    settings::Settings,
    std::{
        collections::{BTreeMap, HashMap},
        env,
        path::{Path, PathBuf},
        process,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    },
    supervisor::CliSupervisor,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    tracing_subscriber::EnvFilter,
};

mod arguments;
mod chainstore;
mod config;
mod eventbus;
mod genesis;
mod options;
mod settings;
mod signal;
mod subcommand;
mod supervisor;

type Result<T = (), E = Error> = std::result::Result<T, E>;

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");

    let result = runtime.block_on(async {
        let cancel = signal::setup_signal_handler();
        args.run(cancel).await
    });

    match result {
        Err(err) => {
            error!("error: {err}");

            if env::var_os("RUST_BACKTRACE").map(|val| val == "1").unwrap_or_default() {
                error!("{}", err.backtrace());
            }
            process::exit(1);
        }
        Ok(()) => process::exit(0),
    }
}
