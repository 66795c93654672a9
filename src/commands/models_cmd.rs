use anyhow::{Result, bail};

use crate::config::{Config, ProviderKind, resolve_api_key};
use crate::llm::ProviderRegistry;

pub async fn run_models(cfg: &Config, kind: ProviderKind) -> Result<()> {
    let registry = ProviderRegistry::from_config(cfg)?;
    let models = registry.get(kind).list_available_models().await?;
    if models.is_empty() {
        println!("{kind} reports no models");
        return Ok(());
    }
    println!("Models for {kind}:");
    for m in &models {
        let mark = if kind == cfg.active_provider && *m == cfg.active_model { "*" } else { " " };
        println!("{mark} {m}");
    }
    Ok(())
}

/// Step-by-step health check of one provider.
pub async fn run_test(cfg: &Config, kind: ProviderKind) -> Result<()> {
    let profile = cfg.providers.get(kind);
    println!("== codemate test: {kind} ==");
    println!("base_url: {}", profile.base_url);

    reqwest::Url::parse(&profile.base_url).map_err(|e| anyhow::anyhow!("Invalid base_url: {e}"))?;
    println!("[ok] base_url is a valid URL");

    if kind.requires_api_key() {
        if resolve_api_key(profile).is_none() {
            bail!(
                "{kind} is configured but has no API key. Set {} or run `!set {kind} <api_key>` in chat",
                profile.api_key_env
            );
        }
        println!("[ok] API key resolved");
    }

    let registry = ProviderRegistry::from_config(cfg)?;
    match registry.get(kind).list_available_models().await {
        Ok(models) => {
            let preview: Vec<&str> = models.iter().take(5).map(String::as_str).collect();
            println!("[ok] {kind} available. Models: {}", preview.join(", "));
        }
        Err(err) => bail!("{kind} unavailable: {err}"),
    }
    println!("test finished: healthy");
    Ok(())
}
