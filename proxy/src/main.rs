//! CLI entry point for the `clusterproxy` binary (spec §6). Everything that actually runs
//! the proxy lives in `proxy-core`; this crate only parses flags, wires up logging, performs
//! the one-time cluster bootstrap, and spawns the worker threads the listener dispatches to.

use clap::Parser;
use proxy_core::config::{Config, LogLevel, MultiplexMode, DEFAULT_BACKLOG};
use proxy_core::{cluster, listener, scheduler};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Reverse proxy for a slot-sharded key-value cluster.
#[derive(Parser, Debug)]
#[command(name = "clusterproxy", version, about)]
struct Cli {
    /// Seed node to bootstrap cluster topology from, as `host:port`.
    seed: String,

    /// Port the proxy listens on for client connections.
    #[arg(short = 'p', long, default_value_t = proxy_core::config::DEFAULT_PORT)]
    port: u16,

    /// Soft cap on concurrently connected clients.
    #[arg(long, default_value_t = proxy_core::config::DEFAULT_MAXCLIENTS)]
    maxclients: usize,

    /// Worker thread count, clamped to [1, 500].
    #[arg(long, default_value_t = proxy_core::config::DEFAULT_THREADS)]
    threads: usize,

    /// TCP keepalive interval, in seconds, for client and upstream sockets.
    #[arg(long, default_value_t = proxy_core::config::DEFAULT_TCPKEEPALIVE_SECS)]
    tcpkeepalive: u64,

    /// Fork into the background after a successful bootstrap and bind.
    #[arg(long, default_value_t = false)]
    daemonize: bool,

    /// Multiplexing policy: never, auto (default; disables itself under queue pressure), always.
    #[arg(long, default_value = "auto")]
    disable_multiplexing: String,

    /// Password to AUTH with against upstream nodes.
    #[arg(short = 'a', long)]
    auth: Option<String>,

    /// Disable ANSI colors in log output.
    #[arg(long, default_value_t = false)]
    disable_colors: bool,

    /// Minimum log severity: debug, info, success, warning, error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log every parsed client request.
    #[arg(long, default_value_t = false)]
    dump_queries: bool,

    /// Log raw buffer contents on protocol errors.
    #[arg(long, default_value_t = false)]
    dump_buffer: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let multiplex_mode = match cli.disable_multiplexing.parse::<MultiplexMode>() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("clusterproxy: {e}");
            return ExitCode::FAILURE;
        }
    };
    let log_level = match cli.log_level.parse::<LogLevel>() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("clusterproxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = Config {
        seed_addr: cli.seed,
        port: cli.port,
        maxclients: cli.maxclients,
        threads: Config::clamp_threads(cli.threads),
        tcpkeepalive: Duration::from_secs(cli.tcpkeepalive),
        daemonize: cli.daemonize,
        multiplex_mode,
        auth: cli.auth,
        disable_colors: cli.disable_colors,
        log_level,
        dump_queries: cli.dump_queries,
        dump_buffer: cli.dump_buffer,
    };

    if config.daemonize {
        daemonize();
    }

    proxy_core::logging::init(config.log_level, config.disable_colors);

    let slot_map = match cluster::bootstrap(&config.seed_addr) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(error = %e, seed = %config.seed_addr, "cluster bootstrap failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(shards = slot_map.len_shards(), "cluster topology loaded");

    let commands = Arc::new(proxy_core::commands::CommandTable::default_table());
    let slot_map = Arc::new(slot_map);
    let config = Arc::new(config);

    let mut workers = Vec::with_capacity(config.threads);
    for id in 0..config.threads {
        match scheduler::spawn_worker(id, slot_map.clone(), commands.clone(), config.clone()) {
            Ok((_join, handle)) => workers.push(handle),
            Err(e) => {
                tracing::error!(error = %e, worker = id, "failed to spawn worker thread");
                return ExitCode::FAILURE;
            }
        }
    }
    tracing::info!(threads = workers.len(), port = config.port, "workers ready");

    if let Err(e) = listener::run(config.port, DEFAULT_BACKLOG, workers) {
        tracing::error!(error = %e, "listener failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Standard double-fork daemonization: the first fork detaches from the parent's process
/// group via `setsid`, the second guarantees the daemon can never reacquire a controlling
/// terminal. Must run before any thread is spawned — `fork()` only carries the calling
/// thread into the child.
#[cfg(unix)]
fn daemonize() {
    use std::process;

    unsafe {
        match libc::fork() {
            -1 => {
                eprintln!("clusterproxy: fork failed, aborting daemonize");
                process::exit(1);
            }
            0 => {}
            _ => process::exit(0),
        }

        if libc::setsid() == -1 {
            eprintln!("clusterproxy: setsid failed, aborting daemonize");
            process::exit(1);
        }

        match libc::fork() {
            -1 => {
                eprintln!("clusterproxy: second fork failed, aborting daemonize");
                process::exit(1);
            }
            0 => {}
            _ => process::exit(0),
        }
    }
}

#[cfg(not(unix))]
fn daemonize() {
    eprintln!("clusterproxy: --daemonize is only supported on unix, ignoring");
}
