use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loginguard::cancel::Cancellation;
use loginguard::cli::{self, Commands, ContextArgs};
use loginguard::config::{self, Config};
use loginguard::gate::ApprovalGate;
use loginguard::models::context::{challenge_text, ConnectionContext, HostInfo};
use loginguard::models::decision::Decision;
use loginguard::notification::telegram::TelegramNotifier;
use loginguard::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    // Any failure before a decision exits non-zero, which the host
    // framework treats as a reject.
    let cfg = match config::load(args.env_file.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let otel = match init_tracing(cfg.log_file.as_deref()) {
        Ok(otel) => otel,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(config = ?cfg, "configuration loaded");

    let command = args
        .command
        .unwrap_or_else(|| Commands::Authenticate(ContextArgs::default()));

    let result = match command {
        Commands::Authenticate(overrides) => authenticate(&cfg, overrides).await.map(|decision| {
            if decision.is_accept() {
                println!("Access granted.");
                ExitCode::SUCCESS
            } else {
                println!("Access denied.");
                ExitCode::from(1)
            }
        }),
        Commands::Ping => ping(&cfg).await.map(|_| ExitCode::SUCCESS),
        Commands::Context(overrides) => {
            print_context(&cfg, overrides);
            Ok(ExitCode::SUCCESS)
        }
    };

    if otel {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether an OpenTelemetry pipeline was installed.
fn init_tracing(log_file: Option<&str>) -> anyhow::Result<bool> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "loginguard"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };
    let otel = telemetry_layer.is_some();

    // Local debug log, appended across invocations.
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "loginguard=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(telemetry_layer)
        .init();

    Ok(otel)
}

fn telegram(cfg: &Config) -> anyhow::Result<TelegramNotifier> {
    let notifier = TelegramNotifier::new(cfg.telegram_token.as_str(), &cfg.chat_id)
        .context("invalid Telegram configuration")?
        .with_base_url(cfg.api_base_url.as_str())
        .with_parse_mode(cfg.parse_mode.clone());
    Ok(notifier)
}

async fn authenticate(cfg: &Config, overrides: ContextArgs) -> anyhow::Result<Decision> {
    let ctx = overrides.apply(ConnectionContext::from_pam_env());
    let gate = ApprovalGate::new(
        Arc::new(telegram(cfg)?),
        RateLimiter::new(cfg.bucket_capacity, cfg.bucket_fill_rate),
        cfg.gate_settings(HostInfo::discover()),
    );

    let (handle, cancel) = Cancellation::new();
    let cancel = match cfg.timeout {
        Some(timeout) => cancel.with_timeout(timeout),
        None => cancel,
    };
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("termination requested, abandoning approval");
        handle.cancel();
    });

    println!("Waiting for approval...");
    Ok(gate.authenticate(&ctx, &cancel).await)
}

async fn ping(cfg: &Config) -> anyhow::Result<()> {
    let notifier = telegram(cfg)?;
    let me = notifier
        .identity()
        .await
        .context("Telegram rejected the bot token")?;
    println!(
        "bot {} (@{}) ready, approver chat {}",
        me.first_name,
        me.username.as_deref().unwrap_or("-"),
        notifier.chat_id()
    );
    Ok(())
}

fn print_context(cfg: &Config, overrides: ContextArgs) {
    let ctx = overrides.apply(ConnectionContext::from_pam_env());
    let settings = cfg.gate_settings(HostInfo::discover());
    match settings.bypass.evaluate(&ctx) {
        Some(reason) => println!("approval would be bypassed ({:?})", reason),
        None => println!("{}", challenge_text(&ctx, &settings.host, Local::now())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
