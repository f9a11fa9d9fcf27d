// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{EaselConfig, OnBusy};
use model_runtime::WorkerOptions;
use protocol::{ModelName, Stage};
use studio::{BusyPolicy, LifecycleSettings, SwitchPolicy};
use tracing::info;
use util::logging::LogFormat;

#[derive(Parser)]
#[command(name = "easel", version, about = "single-slot image model host")]
struct Cli {
    /// path to the TOML config file; a missing file means defaults
    #[arg(long, default_value = "easel.toml")]
    config: String,

    /// emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// serve the HTTP api until interrupted
    Serve(ServeOpts),

    /// list the models this host knows about
    Models,

    /// load and validate the config file, then exit
    CheckConfig,
}

#[derive(Parser, Debug)]
struct ServeOpts {
    /// address for the HTTP api (overrides [server].listen)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// address for the observe websocket (overrides [server].observe)
    #[arg(long)]
    observe_socket: Option<SocketAddr>,

    /// allowed CORS origin, repeatable (overrides [server].cors_origins)
    #[arg(long)]
    cors_origin: Vec<String>,
}

fn lifecycle_settings(config: &EaselConfig) -> LifecycleSettings {
    let lifecycle = &config.lifecycle;
    LifecycleSettings {
        load_timeout: lifecycle.load_timeout(),
        render_timeout: lifecycle.render_timeout(),
        drain_timeout: lifecycle.drain_timeout(),
        teardown_timeout: lifecycle.teardown_timeout(),
        busy_policy: match lifecycle.on_busy {
            OnBusy::FailFast => BusyPolicy::FailFast,
            OnBusy::Wait => BusyPolicy::Wait {
                timeout: lifecycle.busy_wait(),
                poll_interval: lifecycle.busy_poll(),
            },
        },
        switch_policy: if lifecycle.serialize_switches {
            SwitchPolicy::Serialized
        } else {
            SwitchPolicy::PerModel
        },
    }
}

fn load_config(path: &str) -> Result<EaselConfig> {
    config::load_from_file(path).with_context(|| format!("loading config from {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    util::logging::init_tracing(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });
    info!("starting easel: {:?}", cli.command);

    match cli.command {
        Commands::Serve(opts) => {
            let config = load_config(&cli.config)?;
            let models = config.models()?;
            let cors_origins = if opts.cors_origin.is_empty() {
                config.server.cors_origins.clone()
            } else {
                opts.cors_origin
            };

            let studio_config = studio::Config {
                api_socket: opts.listen.unwrap_or(config.server.listen),
                observe_socket: opts.observe_socket.or(config.server.observe),
                cors_origins,
                lifecycle: lifecycle_settings(&config),
                worker: WorkerOptions {
                    ready_poll_interval: config.worker.ready_poll(),
                    ready_timeout: config.worker.ready_timeout(),
                },
                models,
            };
            studio::run(studio_config).await?;
        }
        Commands::Models => {
            let config = load_config(&cli.config)?;
            let models = config.models()?;
            for model in ModelName::ALL {
                let configured = if models.contains_key(&model) {
                    "configured"
                } else {
                    "not configured"
                };
                let repo = if model.is_two_stage() {
                    format!(
                        "{} + {}",
                        model.repository(Stage::Base),
                        model.repository(Stage::Refiner)
                    )
                } else {
                    model.repository(Stage::Single).to_string()
                };
                println!("{:<14} {:<15} {}", model, configured, repo);
            }
        }
        Commands::CheckConfig => {
            let config = load_config(&cli.config)?;
            let models = config.models()?;
            println!(
                "{}: ok ({} model(s) configured, api on {})",
                cli.config,
                models.len(),
                config.server.listen
            );
        }
    }

    Ok(())
}
