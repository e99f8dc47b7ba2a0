//! CLI configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use anyhow::Context;
use imagine_core::{Catalog, EngineConfig};

/// Process-level settings that are not part of the engine itself.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// `tracing` filter string used when `RUST_LOG` is unset.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Default artifact directory for `generate` (default: `"outputs"`).
    pub output_dir: PathBuf,
}

impl CliConfig {
    pub fn from_env() -> Self {
        Self {
            log_level: env_or("IMAGINE_LOG", "info"),
            log_json: std::env::var("IMAGINE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            output_dir: PathBuf::from(env_or("IMAGINE_OUTPUT_DIR", "outputs")),
        }
    }
}

/// Provider catalog plus engine tunables.
///
/// Without a file the built-in catalog and `IMAGINE_*` variables are used.
/// A catalog file may also carry an `[engine]` table, which then replaces
/// the environment as the engine's configuration source.
pub fn load_engine(path: Option<&PathBuf>) -> anyhow::Result<(Catalog, EngineConfig)> {
    match path {
        None => {
            let catalog = Catalog::builtin().context("built-in catalog is invalid")?;
            let engine = EngineConfig::from_env();
            engine.validate().context("invalid IMAGINE_* engine settings")?;
            Ok((catalog, engine))
        }
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read catalog {}", path.display()))?;
            let catalog = Catalog::from_toml_str(&source)
                .with_context(|| format!("invalid catalog {}", path.display()))?;
            let engine = EngineConfig::from_toml_str(&source)
                .with_context(|| format!("invalid [engine] table in {}", path.display()))?;
            Ok((catalog, engine))
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
