//! Configuration channels: load, save, backup, and reset the persisted
//! documents.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use themedesk_core::ipc::{Handler, RouteOptions};
use themedesk_core::{Controller, ControllerContext, RouteDef};

use crate::store::{ConfigStore, ThemeManifest};

pub struct ConfigController {
    store: Arc<ConfigStore>,
}

impl ConfigController {
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Controller for ConfigController {
    fn name(&self) -> &str {
        "config"
    }

    async fn before_init(&self, _ctx: &ControllerContext) -> anyhow::Result<()> {
        self.store.ensure().await
    }

    fn routes(&self) -> Vec<RouteDef> {
        let store = Arc::clone(&self.store);
        let load = RouteDef::new(
            "config:load",
            Handler::from_fn(move |_args| {
                let store = Arc::clone(&store);
                async move { store.load_all().await }
            }),
        );

        let store = Arc::clone(&self.store);
        let save = RouteDef::new(
            "config:save",
            Handler::from_fn(move |args| {
                let store = Arc::clone(&store);
                async move { save_documents(&store, &args).await }
            }),
        )
        .with_options(RouteOptions {
            // Writes go one at a time; a torn save is worse than a queued one.
            exclusive: true,
            validate_args: Some(Arc::new(|args| {
                if args.first().is_some_and(Value::is_object) {
                    Ok(())
                } else {
                    Err("expected a config object".to_string())
                }
            })),
            ..RouteOptions::default()
        });

        let store = Arc::clone(&self.store);
        let backup = RouteDef::new(
            "config:backup",
            Handler::from_fn(move |_args| {
                let store = Arc::clone(&store);
                async move {
                    let backed_up: Vec<String> = store
                        .backup()
                        .await?
                        .into_iter()
                        .map(|p| p.display().to_string())
                        .collect();
                    Ok(json!({"backedUp": backed_up}))
                }
            }),
        )
        .with_options(RouteOptions {
            exclusive: true,
            ..RouteOptions::default()
        });

        let store = Arc::clone(&self.store);
        let reset = RouteDef::new(
            "config:reset",
            Handler::from_fn(move |_args| {
                let store = Arc::clone(&store);
                async move { store.reset().await }
            }),
        )
        .with_options(RouteOptions {
            exclusive: true,
            ..RouteOptions::default()
        });

        vec![load, save, backup, reset]
    }
}

/// Persist whichever documents the payload carries; ignores absent keys.
async fn save_documents(store: &ConfigStore, args: &[Value]) -> anyhow::Result<Value> {
    let payload = args
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("expected a config object"))?;

    let mut saved: Vec<&str> = Vec::new();
    if let Some(raw) = payload.get("manifest") {
        let manifest: ThemeManifest = serde_json::from_value(raw.clone())?;
        store.save_manifest(&manifest).await?;
        saved.push("manifest");
    }
    if let Some(raw) = payload.get("extraFolders") {
        let folders: Vec<String> = serde_json::from_value(raw.clone())?;
        store.save_extra_folders(&folders).await?;
        saved.push("extraFolders");
    }
    Ok(json!({"saved": saved}))
}

#[cfg(test)]
mod tests {
    use themedesk_core::{Application, ApplicationOptions};

    use super::*;
    use crate::paths::AppPaths;

    async fn app_with_controller(dir: &std::path::Path) -> Application {
        let store = Arc::new(ConfigStore::new(AppPaths::rooted(dir)));
        let app = Application::new(ApplicationOptions {
            install_panic_hook: false,
            ..ApplicationOptions::default()
        });
        app.controllers().define(
            "config",
            Arc::new(move |_ctx| Ok(Arc::new(ConfigController::new(Arc::clone(&store))) as _)),
        );
        app.start().await.unwrap();
        app
    }

    #[tokio::test]
    async fn load_returns_seeded_documents() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_controller(dir.path()).await;

        let all = app.ipc().invoke("config:load", vec![]).await.unwrap();
        assert!(all["manifest"]["necessary"]["logo.png"].is_string());
        app.stop().await;
    }

    #[tokio::test]
    async fn save_persists_only_provided_documents() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_controller(dir.path()).await;

        let result = app
            .ipc()
            .invoke(
                "config:save",
                vec![json!({"extraFolders": ["${theme}/assets/video"]})],
            )
            .await
            .unwrap();
        assert_eq!(result["saved"], json!(["extraFolders"]));

        let all = app.ipc().invoke("config:load", vec![]).await.unwrap();
        assert_eq!(all["extraFolders"], json!(["${theme}/assets/video"]));
        app.stop().await;
    }

    #[tokio::test]
    async fn save_rejects_non_object_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_controller(dir.path()).await;

        let err = app
            .ipc()
            .invoke("config:save", vec![json!("not an object")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGS");
        app.stop().await;
    }

    #[tokio::test]
    async fn backup_then_reset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_controller(dir.path()).await;

        app.ipc()
            .invoke(
                "config:save",
                vec![json!({"extraFolders": ["${theme}/custom"]})],
            )
            .await
            .unwrap();
        let backup = app.ipc().invoke("config:backup", vec![]).await.unwrap();
        assert_eq!(backup["backedUp"].as_array().map(Vec::len), Some(2));

        let defaults = app.ipc().invoke("config:reset", vec![]).await.unwrap();
        assert_ne!(defaults["extraFolders"], json!(["${theme}/custom"]));
        app.stop().await;
    }
}
