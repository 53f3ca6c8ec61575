//! `themedesk` binary: wires the store and controllers into the dispatch
//! framework and serves dev introspection channels until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use themedesk_core::ipc::{Handler, RouteOptions};
use themedesk_core::{Application, ApplicationOptions, ServiceInstance};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use themedesk_app::controllers::{ConfigController, ResourceController};
use themedesk_app::{AppPaths, ConfigStore};

const CONFIG_STORE: &str = "config-store";

#[derive(Debug, Parser)]
#[command(name = "themedesk", version, about = "Theme workspace service")]
struct Cli {
    /// Directory holding the config documents (defaults to the platform
    /// config dir).
    #[arg(long, env = "THEMEDESK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Allow controller reloads through `dev:reload`.
    #[arg(long)]
    hot_reload: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,themedesk={default_level},themedesk_app={default_level},themedesk_core={default_level}")));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn register_dev_channels(app: &Arc<Application>, hot_reload: bool) {
    let health_app = Arc::clone(app);
    app.ipc().handle(
        "dev:health",
        Handler::from_fn(move |_args| {
            let app = Arc::clone(&health_app);
            async move { Ok(app.health_check()) }
        }),
        RouteOptions::silent(),
    );

    let status_app = Arc::clone(app);
    app.ipc().handle(
        "dev:status",
        Handler::from_fn(move |_args| {
            let app = Arc::clone(&status_app);
            async move { Ok(app.get_status()) }
        }),
        RouteOptions::silent(),
    );

    let perf_app = Arc::clone(app);
    app.ipc().handle(
        "dev:performance",
        Handler::from_fn(move |_args| {
            let app = Arc::clone(&perf_app);
            async move { Ok(app.get_performance_info()) }
        }),
        RouteOptions::silent(),
    );

    let inspect_app = Arc::clone(app);
    app.ipc().handle(
        "dev:inspect",
        Handler::from_fn(move |args| {
            let app = Arc::clone(&inspect_app);
            async move {
                let kind = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("expected 'channel' or 'service'"))?;
                let name = args
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("expected a name to inspect"))?;
                let info = match kind {
                    "channel" => app.ipc().get_channel_info(name),
                    "service" => app.container().get_service_info(name),
                    other => anyhow::bail!("unknown inspect kind '{other}'"),
                };
                Ok(info.unwrap_or(Value::Null))
            }
        }),
        RouteOptions::silent(),
    );

    if !hot_reload {
        return;
    }
    let reload_app = Arc::clone(app);
    app.ipc().handle(
        "dev:reload",
        Handler::from_fn(move |args| {
            let app = Arc::clone(&reload_app);
            async move {
                let id = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("expected a controller id"))?
                    .to_string();
                app.controllers().reload(&id).await?;
                Ok(json!({"reloaded": id}))
            }
        }),
        RouteOptions {
            exclusive: true,
            ..RouteOptions::default()
        },
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let paths = AppPaths::resolve(cli.config_dir);
    info!(config_dir = %paths.config_dir.display(), "using config directory");
    let store = Arc::new(ConfigStore::new(paths));

    let app = Arc::new(Application::new(ApplicationOptions {
        name: "themedesk".to_string(),
        hot_reload: cli.hot_reload,
        ..ApplicationOptions::default()
    }));

    app.container()
        .register_instance(CONFIG_STORE, ServiceInstance::from_arc(Arc::clone(&store)))?;

    app.controllers().define(
        "config",
        Arc::new(|ctx| {
            let store = ctx.dependency_as::<ConfigStore>(CONFIG_STORE)?;
            Ok(Arc::new(ConfigController::new(store)) as _)
        }),
    );
    app.controllers().define(
        "resource",
        Arc::new(|ctx| {
            let store = ctx.dependency_as::<ConfigStore>(CONFIG_STORE)?;
            Ok(Arc::new(ResourceController::new(store)) as _)
        }),
    );

    register_dev_channels(&app, cli.hot_reload);
    app.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    app.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Arc<Application> {
        Arc::new(Application::new(ApplicationOptions {
            install_panic_hook: false,
            ..ApplicationOptions::default()
        }))
    }

    #[tokio::test]
    async fn reload_channel_is_gated_behind_the_flag() {
        let gated = app();
        register_dev_channels(&gated, false);
        assert!(gated.ipc().has_channel("dev:health"));
        assert!(!gated.ipc().has_channel("dev:reload"));

        let open = app();
        register_dev_channels(&open, true);
        assert!(open.ipc().has_channel("dev:reload"));
    }

    #[tokio::test]
    async fn inspect_reports_channels_and_services() {
        let app = app();
        register_dev_channels(&app, false);
        app.start().await.unwrap();

        let channel = app
            .ipc()
            .invoke("dev:inspect", vec![json!("channel"), json!("dev:health")])
            .await
            .unwrap();
        assert_eq!(channel["channel"], json!("dev:health"));
        assert_eq!(channel["exclusive"], json!(false));

        let service = app
            .ipc()
            .invoke("dev:inspect", vec![json!("service"), json!("event-bus")])
            .await
            .unwrap();
        assert_eq!(service["name"], json!("event-bus"));
        assert_eq!(service["has_instance"], json!(true));

        let absent = app
            .ipc()
            .invoke("dev:inspect", vec![json!("channel"), json!("ghost")])
            .await
            .unwrap();
        assert!(absent.is_null());
        app.stop().await;
    }
}
