use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Watch-party session server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "watchparty-server", version, about = "Synchronized watch-party server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "WATCH_PORT", default_value = "3000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "WATCH_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./watchparty.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "WATCH_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Directory for uploaded and processed video files
    #[arg(long, env = "WATCH_UPLOADS_DIR", default_value = "./uploads")]
    pub uploads_dir: String,

    /// Directory of static frontend assets
    #[arg(long, env = "WATCH_PUBLIC_DIR", default_value = "./public")]
    pub public_dir: String,

    /// Comma-separated CORS origin allow-list; empty means permissive
    #[arg(long, env = "WATCH_ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,

    /// Public base URL used when building session links for the bot
    #[arg(long, env = "WATCH_PUBLIC_URL", default_value = "http://localhost:3000")]
    pub public_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: "0.0.0.0".to_string(),
            config: "./watchparty.toml".to_string(),
            json_logs: false,
            generate_config: false,
            uploads_dir: "./uploads".to_string(),
            public_dir: "./public".to_string(),
            allowed_origins: String::new(),
            public_url: "http://localhost:3000".to_string(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (WATCH_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("WATCH_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Parsed CORS origin allow-list. Empty vec means "allow any origin".
    pub fn origin_list(&self) -> Vec<String> {
        self.allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Watch-party server configuration
# Place this file at ./watchparty.toml or specify with --config <path>
# All settings can be overridden via environment variables (WATCH_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3000)
# port = 3000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Directory where uploads and processed videos are stored
# uploads_dir = "./uploads"

# Directory of static frontend assets served at /
# public_dir = "./public"

# Comma-separated CORS origin allow-list. Empty = permissive.
# allowed_origins = "https://watch.example.com"

# Public base URL used in session links handed to the Discord bot
# public_url = "http://localhost:3000"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_list_splits_and_trims() {
        let cfg = Config {
            allowed_origins: "https://a.example, https://b.example ,".to_string(),
            ..Config::default()
        };
        assert_eq!(
            cfg.origin_list(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn empty_origin_list_is_permissive() {
        let cfg = Config::default();
        assert!(cfg.origin_list().is_empty());
    }
}
