// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ferry_server::{config, migrate::MigrationTimeouts, server};

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{ConfigDropshot, HandlerTaskMode, HttpServerStarter};
use slog::info;

/// Threads to spawn for the tokio runtime running the API and migrations
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server moving instances and storage volumes between hosts
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the ferry server.
    Run {
        #[clap(action)]
        cfg: PathBuf,

        #[clap(name = "FERRY_IP:PORT", action)]
        ferry_addr: SocketAddr,

        /// Logging level for the server
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("Ferry Server API", semver::Version::new(0, 0, 1))
        .description(
            "API for migrating instances and storage volumes between hosts.",
        )
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn run_server(
    config_app: config::Config,
    config_dropshot: ConfigDropshot,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let api_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(API_RT_THREADS)
        .thread_name("tokio-rt-api")
        .enable_all()
        .build()?;
    let _guard = api_runtime.enter();

    let instances = api_runtime
        .block_on(config::build_instances(&log, &config_app))
        .context("setting up pools and instances")?;

    let context = server::ServerContext::new(
        log.new(slog::o!()),
        instances,
        MigrationTimeouts::from(&config_app.migration),
    );

    info!(log, "Starting server...");

    let server = HttpServerStarter::new(
        &config_dropshot,
        server::api(),
        Arc::new(context),
        &log,
    )
    .map_err(|error| anyhow!("Failed to start server: {}", error))?
    .start();

    api_runtime
        .block_on(server)
        .map_err(|e| anyhow!("Server exited with an error: {}", e))
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("ferry-server", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        slog::o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

fn main() -> anyhow::Result<()> {
    // Ensure proper setup of USDT probes
    usdt::register_probes().unwrap();

    // Command line arguments.
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { cfg, ferry_addr, log_level } => {
            let config_app = config::parse(&cfg)
                .with_context(|| format!("parsing {}", cfg.display()))?;

            // Dropshot configuration.
            let config_dropshot = ConfigDropshot {
                bind_address: ferry_addr,
                default_request_body_max_bytes: 1024 * 1024,
                default_handler_task_mode: HandlerTaskMode::Detached,
                log_headers: vec![],
            };

            let log = build_logger(log_level);

            run_server(config_app, config_dropshot, log)
        }
    }
}
