//! Configuration scaffolding for `lilhal init`.
//!
//! Writes `~/.lilhal/` templates without overwriting existing local files.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[TemplateFile {
    relative_path: "config.toml",
    contents: include_str!("../../config-templates/config.toml"),
}];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path();
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        skipped: Vec::new(),
    };

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(_) => {
                report.skipped.push(target);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&target, template.contents)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("write config template {}: {e}", target.display())
                    })?;
                report.created.push(target);
            }
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "inspect config path {}: {err}",
                    target.display()
                ));
            }
        }
    }

    Ok(report)
}
