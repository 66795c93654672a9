use anyhow::Result;

use crate::cli::ConfigCommand;
use crate::config::{Config, config_path, load_config_or_default};

pub fn handle_config(command: ConfigCommand) -> Result<()> {
    let path = config_path()?;
    match command {
        ConfigCommand::Init => {
            Config::default().save_to_path(&path)?;
            println!("Initialized config at {}", path.display());
        }
        ConfigCommand::Show => {
            let cfg = load_config_or_default()?;
            println!("{}", toml::to_string_pretty(&masked(cfg))?);
            println!("Config path: {}", path.display());
        }
        ConfigCommand::Path => println!("{}", path.display()),
    }
    Ok(())
}

/// Stored keys are printed as `(set)`.
fn masked(mut cfg: Config) -> Config {
    for kind in crate::config::ProviderKind::ALL {
        let p = cfg.providers.get_mut(kind);
        if p.api_key.as_ref().is_some_and(|k| !k.trim().is_empty()) {
            p.api_key = Some("(set)".to_string());
        }
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    #[test]
    fn show_never_prints_keys() {
        let mut cfg = Config::default();
        cfg.providers.get_mut(ProviderKind::Openai).api_key = Some("sk-secret".to_string());
        let text = toml::to_string_pretty(&masked(cfg)).unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(text.contains("(set)"));
    }
}
