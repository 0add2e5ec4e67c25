//! Daemon configuration: defaults, an optional TOML file, then CLI flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use serde::Deserialize;

/// Flags of `labgridd serve`. Each one overrides the config file.
#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address the broker and API listen on.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Data directory for persistent state.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Namespace holding worker heartbeat leases.
    #[arg(long)]
    pub lease_namespace: Option<String>,

    /// Worker health evaluation period in milliseconds.
    #[arg(long)]
    pub worker_monitor_period_ms: Option<u64>,

    /// Metrics refresh interval in seconds.
    #[arg(long)]
    pub metrics_interval_secs: Option<u64>,

    /// Concurrent reconciles per controller.
    #[arg(long)]
    pub reconcile_workers: Option<usize>,

    /// Upper bound on draining in-flight requests at shutdown.
    #[arg(long)]
    pub shutdown_timeout_secs: Option<u64>,

    /// Environment driver the workers provision with.
    #[arg(long)]
    pub environment_driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub lease_namespace: String,
    pub worker_monitor_period_ms: u64,
    pub metrics_interval_secs: u64,
    pub reconcile_workers: usize,
    pub shutdown_timeout_secs: u64,
    pub environment_driver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8082)),
            data_dir: PathBuf::from("/var/lib/labgrid"),
            lease_namespace: labgrid_state::DEFAULT_LEASE_NAMESPACE.to_string(),
            worker_monitor_period_ms: 1000,
            metrics_interval_secs: 15,
            reconcile_workers: labgrid_reconcile::DEFAULT_WORKERS,
            shutdown_timeout_secs: 5,
            environment_driver: labgrid_drivers::NoopDriver::NAME.to_string(),
        }
    }
}

impl Config {
    /// Layer `args` over the file it names (if any) over the defaults.
    pub fn resolve(args: &ServeArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply(&mut self, args: &ServeArgs) {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(ns) = &args.lease_namespace {
            self.lease_namespace = ns.clone();
        }
        if let Some(ms) = args.worker_monitor_period_ms {
            self.worker_monitor_period_ms = ms;
        }
        if let Some(secs) = args.metrics_interval_secs {
            self.metrics_interval_secs = secs;
        }
        if let Some(n) = args.reconcile_workers {
            self.reconcile_workers = n;
        }
        if let Some(secs) = args.shutdown_timeout_secs {
            self.shutdown_timeout_secs = secs;
        }
        if let Some(driver) = &args.environment_driver {
            self.environment_driver = driver.clone();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.lease_namespace.is_empty() {
            bail!("lease_namespace must not be empty");
        }
        if self.worker_monitor_period_ms == 0 {
            bail!("worker_monitor_period_ms must be positive");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics_interval_secs must be positive");
        }
        if self.reconcile_workers == 0 {
            bail!("reconcile_workers must be at least 1");
        }
        Ok(())
    }

    pub fn worker_monitor_period(&self) -> Duration {
        Duration::from_millis(self.worker_monitor_period_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("labgrid.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn args(flags: &[&str]) -> ServeArgs {
        let argv = std::iter::once("labgridd").chain(flags.iter().copied());
        TestCli::try_parse_from(argv).unwrap().serve
    }

    #[test]
    fn defaults() {
        let config = Config::resolve(&ServeArgs::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8082".parse().unwrap());
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/labgrid"));
        assert_eq!(config.lease_namespace, "labgrid");
        assert_eq!(config.worker_monitor_period(), Duration::from_secs(1));
        assert_eq!(config.metrics_interval(), Duration::from_secs(15));
        assert_eq!(config.reconcile_workers, 4);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.environment_driver, "noop");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen = "127.0.0.1:9000"
            reconcile_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.reconcile_workers, 8);
        assert_eq!(config.metrics_interval_secs, 15);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("listen_port = 1").is_err());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labgrid.toml");
        std::fs::write(
            &path,
            concat!(
                "data_dir = \"/srv/labgrid\"\n",
                "lease_namespace = \"fleet\"\n",
                "shutdown_timeout_secs = 30\n",
            ),
        )
        .unwrap();

        let path_arg = path.to_str().unwrap();
        let config = Config::resolve(&args(&[
            "--config",
            path_arg,
            "--lease-namespace",
            "override",
            "--worker-monitor-period-ms",
            "250",
            "--environment-driver",
            "containerlab",
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/labgrid"));
        assert_eq!(config.lease_namespace, "override");
        assert_eq!(config.worker_monitor_period(), Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.db_path(), PathBuf::from("/srv/labgrid/labgrid.redb"));
        assert_eq!(config.environment_driver, "containerlab");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::resolve(&args(&["--config", "/nonexistent/labgrid.toml"])).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::resolve(&args(&["--reconcile-workers", "0"])).is_err());
        assert!(Config::resolve(&args(&["--metrics-interval-secs", "0"])).is_err());
        assert!(Config::resolve(&args(&["--lease-namespace", ""])).is_err());
    }
}
