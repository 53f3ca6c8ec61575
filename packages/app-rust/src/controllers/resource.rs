//! Theme resource channels: design-export validation against the manifest,
//! resource copies into the project source tree, and file probes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use themedesk_core::ipc::{ArgsValidator, Handler, RouteOptions};
use themedesk_core::{Controller, ControllerContext, RouteDef};
use tracing::debug;

use crate::store::{ConfigStore, CUTOUT_DIR, THEME_PLACEHOLDER};

pub struct ResourceController {
    store: Arc<ConfigStore>,
}

impl ResourceController {
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

fn one_path_arg() -> ArgsValidator {
    Arc::new(|args| {
        if args.first().and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err("expected a path string".to_string())
        }
    })
}

fn copy_request_arg() -> ArgsValidator {
    Arc::new(|args| {
        let Some(payload) = args.first().and_then(Value::as_object) else {
            return Err("expected a copy request object".to_string());
        };
        for field in ["theme", "src", "destPath"] {
            if !payload.get(field).is_some_and(Value::is_string) {
                return Err(format!("missing string field '{field}'"));
            }
        }
        Ok(())
    })
}

fn path_route_options() -> RouteOptions {
    RouteOptions {
        validate_args: Some(one_path_arg()),
        ..RouteOptions::default()
    }
}

#[async_trait]
impl Controller for ResourceController {
    fn name(&self) -> &str {
        "resource"
    }

    async fn before_init(&self, _ctx: &ControllerContext) -> anyhow::Result<()> {
        self.store.ensure().await
    }

    fn routes(&self) -> Vec<RouteDef> {
        let store = Arc::clone(&self.store);
        let check = RouteDef::new(
            "resource:check",
            Handler::from_fn(move |args| {
                let store = Arc::clone(&store);
                async move { check_theme_resources(&store, &args).await }
            }),
        )
        .with_options(path_route_options());

        let store = Arc::clone(&self.store);
        let copy = RouteDef::new(
            "resource:copy",
            Handler::from_fn(move |args| {
                let store = Arc::clone(&store);
                async move { copy_theme_resources(&store, &args).await }
            }),
        )
        .with_options(RouteOptions {
            exclusive: true,
            validate_args: Some(copy_request_arg()),
            ..RouteOptions::default()
        });

        let exists = RouteDef::new(
            "file:exists",
            Handler::from_fn(|args| async move {
                let path = path_arg(&args)?;
                Ok(json!({"exists": tokio::fs::try_exists(&path).await.unwrap_or(false)}))
            }),
        )
        .with_options(path_route_options());

        let store = Arc::clone(&self.store);
        let get_configs = RouteDef::new(
            "file:getConfigs",
            Handler::from_fn(move |_args| {
                let store = Arc::clone(&store);
                async move {
                    let mut all = store.load_all().await?;
                    all["configDir"] = json!(store.paths().config_dir.display().to_string());
                    Ok(all)
                }
            }),
        );

        vec![check, copy, exists, get_configs]
    }
}

fn path_arg(args: &[Value]) -> anyhow::Result<PathBuf> {
    args.first()
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("expected a path string"))
}

/// Check every manifest entry under the workspace's design-export folder.
/// The report is valid when no necessary resource is missing; optional
/// entries are listed but never fail it.
async fn check_theme_resources(store: &ConfigStore, args: &[Value]) -> anyhow::Result<Value> {
    let workspace = path_arg(args)?;
    if !tokio::fs::try_exists(&workspace).await? {
        anyhow::bail!("path '{}' does not exist", workspace.display());
    }
    let manifest = store.load_manifest().await?;
    let cutout = workspace.join(CUTOUT_DIR);

    let mut found: Vec<Value> = Vec::new();
    let mut missing: Vec<Value> = Vec::new();
    let entries = manifest
        .necessary
        .keys()
        .map(|name| (name, true))
        .chain(manifest.optional.keys().map(|name| (name, false)));
    for (name, required) in entries {
        let path = cutout.join(name);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let entry = json!({
            "name": name,
            "path": path.display().to_string(),
            "required": required,
        });
        if exists {
            found.push(entry);
        } else {
            missing.push(entry);
        }
    }

    let valid = missing.iter().all(|entry| entry["required"] == json!(false));
    debug!(
        workspace = %workspace.display(),
        found = found.len(),
        missing = missing.len(),
        "theme resources checked"
    );
    Ok(json!({"valid": valid, "found": found, "missing": missing}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyRequest {
    theme: String,
    /// Root of the project source tree receiving the copies.
    src: String,
    /// Workspace holding the design-export folder.
    dest_path: String,
}

/// Create the extra folders under the source tree, then copy every manifest
/// resource from the workspace's design-export folder to its substituted
/// destination. Individual copy failures are collected, not fatal.
async fn copy_theme_resources(store: &ConfigStore, args: &[Value]) -> anyhow::Result<Value> {
    let request: CopyRequest = serde_json::from_value(
        args.first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("expected a copy request object"))?,
    )?;
    let src_root = PathBuf::from(&request.src);
    let cutout = Path::new(&request.dest_path).join(CUTOUT_DIR);
    let manifest = store.load_manifest().await?;

    let mut created: Vec<String> = Vec::new();
    for template in store.load_extra_folders().await? {
        let target = src_root.join(template.replace(THEME_PLACEHOLDER, &request.theme));
        if !target.starts_with(&src_root) {
            anyhow::bail!("template '{template}' escapes the source tree");
        }
        tokio::fs::create_dir_all(&target).await?;
        created.push(target.display().to_string());
    }

    let mut copied: Vec<Value> = Vec::new();
    let mut failed: Vec<Value> = Vec::new();
    for (name, template) in manifest.necessary.iter().chain(manifest.optional.iter()) {
        let source = cutout.join(name);
        let target = src_root.join(template.replace(THEME_PLACEHOLDER, &request.theme));
        if !target.starts_with(&src_root) {
            failed.push(json!({
                "path": source.display().to_string(),
                "error": format!("destination '{template}' escapes the source tree"),
            }));
            continue;
        }
        match copy_resource(&source, &target).await {
            Ok(()) => copied.push(json!({
                "from": source.display().to_string(),
                "to": target.display().to_string(),
            })),
            Err(err) => failed.push(json!({
                "path": source.display().to_string(),
                "error": err.to_string(),
            })),
        }
    }

    debug!(
        theme = %request.theme,
        created = created.len(),
        copied = copied.len(),
        failed = failed.len(),
        "theme resources copied"
    );
    Ok(json!({
        "created": created,
        "copied": copied,
        "failed": failed,
        "complete": failed.is_empty(),
    }))
}

async fn copy_resource(source: &Path, target: &Path) -> anyhow::Result<()> {
    if !tokio::fs::try_exists(source).await? {
        anyhow::bail!("resource '{}' not found", source.display());
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, target).await?;
    Ok(())
}
