use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "judged", version = "0.1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', default_value = "config.json")]
    pub config_path: String,

    /// Number of judge workers (overridden by JUDGE_WORKERS)
    #[arg(short, long, default_value_t = 2)]
    pub workers: u32,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn read_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }

    /// Resolve file config, CLI flags, and environment switches.
    pub fn load_settings(&self) -> std::io::Result<Settings> {
        let config = self.read_config()?;
        Ok(Settings::resolve(config, self.workers))
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub secret_key: String,
    pub frontend_url: Option<String>,
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    pub test_cases_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub run_dir: Option<String>,
    /// Out-of-band test-data refresh command for /pull_test_cases.
    /// Absent means the endpoint is a no-op.
    pub pull_command: Option<Vec<String>>,
}

/// Fully resolved runtime settings shared across workers and handlers.
#[derive(Debug)]
pub struct Settings {
    pub secret_key: String,
    pub frontend_url: String,
    pub bind_address: String,
    pub bind_port: u16,
    pub test_cases_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub run_dir: PathBuf,
    pub pull_command: Option<Vec<String>>,
    pub workers: u32,
    pub debug: bool,
}

impl Settings {
    fn resolve(config: Config, cli_workers: u32) -> Self {
        let frontend_url = std::env::var("FRONTEND_URL")
            .ok()
            .or(config.frontend_url)
            .unwrap_or_else(|| "http://localhost:5000".to_string());
        let workers = std::env::var("JUDGE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cli_workers)
            .max(1);
        let debug = std::env::var("JUDGE_DEBUG").is_ok_and(|v| v != "0" && !v.is_empty());

        Settings {
            secret_key: config.secret_key,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            bind_address: config.bind_address.unwrap_or_else(|| "0.0.0.0".to_string()),
            bind_port: config.bind_port.unwrap_or(8000),
            test_cases_dir: PathBuf::from(
                config.test_cases_dir.unwrap_or_else(|| "test_cases".to_string()),
            ),
            cache_dir: PathBuf::from(
                config.cache_dir.unwrap_or_else(|| "task_info_cache".to_string()),
            ),
            run_dir: PathBuf::from(config.run_dir.unwrap_or_else(|| "run".to_string())),
            pull_command: config.pull_command,
            workers,
            debug,
        }
    }

    /// Settings for tests: no frontend, debug reporting, scratch dirs.
    pub fn for_tests(base: &std::path::Path, secret_key: &str) -> Self {
        Settings {
            secret_key: secret_key.to_string(),
            frontend_url: "http://localhost:0".to_string(),
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            test_cases_dir: base.join("test_cases"),
            cache_dir: base.join("task_info_cache"),
            run_dir: base.join("run"),
            pull_command: None,
            workers: 1,
            debug: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.secret_key, "judge-secret");
        assert_eq!(config.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(
            config.pull_command,
            Some(vec![
                "git".to_string(),
                "submodule".to_string(),
                "foreach".to_string(),
                "git".to_string(),
                "pull".to_string(),
                "origin".to_string(),
                "master".to_string(),
            ])
        );
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config {
            secret_key: "s".to_string(),
            frontend_url: Some("http://frontend:5000/".to_string()),
            bind_address: None,
            bind_port: None,
            test_cases_dir: None,
            cache_dir: None,
            run_dir: None,
            pull_command: None,
        };
        let settings = Settings::resolve(config, 4);
        assert_eq!(settings.bind_port, 8000);
        assert_eq!(settings.cache_dir, PathBuf::from("task_info_cache"));
        assert_eq!(settings.run_dir, PathBuf::from("run"));
        // trailing slash trimmed so URL joins stay clean
        assert_eq!(settings.frontend_url, "http://frontend:5000");
    }
}
