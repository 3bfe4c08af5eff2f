use std::{net::SocketAddr, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use emb_core::{
    authz::ApiAuthorization,
    cache::ResponseCache,
    config::Config,
    domain::{ChatId, UserId},
    gateway::ChatGateway,
    messaging::{
        port::MessagingApi,
        throttled::{ThrottleConfig, ThrottledApi},
    },
    registry::JsonChatRegistry,
    webapp::{ChatListRequest, ChatMembersRequest, ErrorResponse, WebAppHandler},
};
use emb_telegram::TelegramApi;

#[derive(Parser)]
#[command(name = "emb")]
#[command(about = "Telegram chat-admin gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume bot updates and keep the chat registry current
    Serve,
    /// List the groups the credential's user owns
    Chats {
        init_data: String,
        #[arg(long)]
        refresh: bool,
    },
    /// List the administrators of a group
    Members {
        #[arg(allow_hyphen_values = true)]
        chat_id: i64,
        init_data: String,
        #[arg(long)]
        refresh: bool,
    },
    /// Check a WebApp credential and print its fields
    Verify { init_data: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = emb_core::logging::init("emb") {
        eprintln!("{e}");
    }

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "emb failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> anyhow::Result<ExitCode> {
    let cfg = Config::load()?;
    if cfg.webapp_secret_is_token {
        tracing::warn!("WebApp credentials are checked against the bot token");
    }

    match command {
        Commands::Serve => serve(cfg),
        Commands::Chats { init_data, refresh } => {
            let handler = webapp_handler(&cfg)?;
            let req = ChatListRequest {
                init_data,
                user_id: None,
                force_refresh: refresh,
            };
            respond(handler.chats(&req))
        }
        Commands::Members {
            chat_id,
            init_data,
            refresh,
        } => {
            let handler = webapp_handler(&cfg)?;
            let req = ChatMembersRequest {
                init_data,
                chat_id: ChatId(chat_id),
                user_id: None,
                force_refresh: refresh,
            };
            respond(handler.members(&req))
        }
        Commands::Verify { init_data } => {
            let verified = cfg
                .validator()
                .validate(&init_data)
                .map_err(emb_core::Error::from)
                .and_then(|principal| {
                    let user_id: UserId = principal.user_id()?;
                    Ok(serde_json::json!({
                        "valid": true,
                        "user_id": user_id,
                        "auth_date": principal.auth_date(),
                        "fields": principal.fields(),
                    }))
                });
            respond(verified)
        }
    }
}

fn serve(cfg: Config) -> anyhow::Result<ExitCode> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async move {
        if let Some(addr) = cfg.metrics_addr {
            install_metrics(addr)?;
        }
        let raw = TelegramApi::connect(teloxide::Bot::new(cfg.bot_token.clone()))
            .await
            .context("telegram getMe failed")?;
        let bot = raw.bot();
        let gateway = build_gateway(&cfg, Arc::new(raw))?;
        emb_telegram::events::run_polling(bot, gateway).await
    })?;

    Ok(ExitCode::SUCCESS)
}

fn install_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    emb_core::telemetry::describe();
    tracing::info!(address = %addr, "serving metrics");
    Ok(())
}

fn webapp_handler(cfg: &Config) -> anyhow::Result<WebAppHandler> {
    let api = TelegramApi::from_token(&cfg.bot_token).context("invalid BOT_TOKEN")?;
    let gateway = build_gateway(cfg, Arc::new(api))?;
    Ok(WebAppHandler::new(
        cfg.validator(),
        gateway,
        cfg.rate_limiter(),
        cfg.request_timeout,
    ))
}

fn build_gateway(cfg: &Config, raw: Arc<dyn MessagingApi>) -> anyhow::Result<Arc<ChatGateway>> {
    // Pace outbound calls; 429s that still happen are retried by the executor.
    let api: Arc<dyn MessagingApi> = Arc::new(ThrottledApi::new(raw, ThrottleConfig::default()));
    let policy = Arc::new(cfg.retry_policy()?);
    let registry = Arc::new(
        JsonChatRegistry::open(&cfg.chat_registry_file).with_context(|| {
            format!(
                "failed to open chat registry {}",
                cfg.chat_registry_file.display()
            )
        })?,
    );
    let authz = Arc::new(ApiAuthorization::new(api.clone(), policy.clone()));
    let cache = Arc::new(ResponseCache::with_capacity(cfg.cache_max_entries));

    Ok(Arc::new(ChatGateway::new(
        api,
        authz,
        registry,
        policy,
        cache,
        cfg.gateway_config(),
    )))
}

/// Print a success body, or the safe error body, as JSON on stdout.
fn respond<T: Serialize>(result: emb_core::Result<T>) -> anyhow::Result<ExitCode> {
    match result {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::warn!(error = %e, "request failed");
            println!(
                "{}",
                serde_json::to_string_pretty(&ErrorResponse::from_error(&e))?
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
