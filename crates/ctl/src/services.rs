//! Supervised-unit configuration: a closed-schema `services.json` under the
//! data root, defaulting to just the execution control plane.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    /// Executable path. Relative paths resolve from the supervisor's cwd.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional HTTP health endpoint; liveness alone is used otherwise.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The built-in engine unit: this binary's `serve` subcommand.
pub fn engine_service(data_root: &Path) -> anyhow::Result<ServiceSpec> {
    let exe = std::env::current_exe()?;
    Ok(ServiceSpec {
        name: "engine".to_string(),
        command: exe.to_string_lossy().into_owned(),
        args: vec![
            "serve".to_string(),
            "--data-root".to_string(),
            data_root.to_string_lossy().into_owned(),
        ],
        health_url: None,
        enabled: true,
    })
}

/// Load `services.json` when present, falling back to the engine-only
/// default. Unknown keys are rejected at load time.
pub fn load_services(data_root: &Path) -> anyhow::Result<Vec<ServiceSpec>> {
    let path = data_root.join("services.json");
    if !path.exists() {
        return Ok(vec![engine_service(data_root)?]);
    }
    let raw = std::fs::read_to_string(&path)?;
    let services: Vec<ServiceSpec> = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("invalid services config {}: {err}", path.display()))?;
    if services.is_empty() {
        anyhow::bail!("services config {} lists no services", path.display());
    }
    Ok(services)
}

/// Filter by `--services` names; an unknown name is a usage error.
pub fn select(
    services: Vec<ServiceSpec>,
    filter: &[String],
) -> Result<Vec<ServiceSpec>, String> {
    if filter.is_empty() {
        return Ok(services);
    }
    for wanted in filter {
        if !services.iter().any(|s| &s.name == wanted) {
            return Err(format!("unknown service: {wanted}"));
        }
    }
    Ok(services
        .into_iter()
        .filter(|s| filter.iter().any(|w| w == &s.name))
        .collect())
}
