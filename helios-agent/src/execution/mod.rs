//! OS-level command execution for the managed service
//!
//! Handles the fire-and-forget side of convergence:
//! - Service unit lifecycle (exists, enable, disable, import, clear)
//! - Archive extraction into the install root
//! - Lifecycle hook scripts (install, config)
//! - Routing status publication (`up` / `down`)
//!
//! Nothing here returns an error to the control loop. A failing command
//! yields an unsuccessful [`ExecutionResult`], which callers log and count.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::config::{PlatformConfig, RoutingConfig, UnitFlavor};
use crate::stats::ConvergenceStats;

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            exit_code: Some(0),
            execution_time_ms: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            exit_code: None,
            execution_time_ms: 0,
        }
    }

    /// Log and count a failure; the caller carries on either way
    pub fn tolerate(&self, what: &str, stats: &ConvergenceStats) -> bool {
        if !self.success {
            warn!(
                "{} failed (exit: {:?}): {}",
                what,
                self.exit_code,
                self.error.as_deref().unwrap_or(self.output.trim())
            );
            stats.record_failed_command();
        }
        self.success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStatus {
    Up,
    Down,
}

impl fmt::Display for RoutingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStatus::Up => f.write_str("up"),
            RoutingStatus::Down => f.write_str("down"),
        }
    }
}

/// OS operations the agent performs on the managed service
#[async_trait]
pub trait Platform: Send + Sync {
    async fn unit_exists(&self, service: &str) -> bool;

    async fn disable_unit(&self, service: &str) -> ExecutionResult;

    async fn enable_unit(&self, service: &str) -> ExecutionResult;

    /// Clear any fault/maintenance state of the unit
    async fn clear_unit(&self, service: &str) -> ExecutionResult;

    /// (Re)import the unit definition shipped with the installed version
    async fn import_unit(&self, service: &str, definition: &Path) -> ExecutionResult;

    async fn extract_archive(&self, archive: &Path, destination: &Path) -> ExecutionResult;

    async fn run_hook(&self, hook: &Path) -> ExecutionResult;

    async fn set_routing_status(&self, status: RoutingStatus) -> ExecutionResult;
}

/// Runs real commands: SMF (`svcs`/`svcadm`/`svccfg`) or systemd (`systemctl`)
pub struct SystemPlatform {
    flavor: UnitFlavor,
    unit_dir: PathBuf,
    routing_command: Option<String>,
}

impl SystemPlatform {
    pub fn new(platform: &PlatformConfig, routing: &RoutingConfig) -> Self {
        Self {
            flavor: platform.flavor,
            unit_dir: platform.unit_dir.clone(),
            routing_command: routing.status_command.clone(),
        }
    }

    async fn run<I, S>(program: &str, args: I) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let start_time = Instant::now();
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!("Executing {} {:?}", program, args);

        let output = AsyncCommand::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let execution_time_ms = start_time.elapsed().as_millis();
        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                ExecutionResult {
                    success: output.status.success(),
                    output: stdout,
                    error: if stderr.is_empty() { None } else { Some(stderr.to_string()) },
                    exit_code: output.status.code(),
                    execution_time_ms,
                }
            }
            Err(e) => ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(format!("failed to spawn {}: {}", program, e)),
                exit_code: None,
                execution_time_ms,
            },
        }
    }

    fn routing_argv(template: &str, status: RoutingStatus) -> Result<Vec<String>, String> {
        let line = template.replace("{status}", &status.to_string());
        let argv = shell_words::split(&line).map_err(|e| e.to_string())?;
        if argv.is_empty() {
            return Err("empty routing status command".to_string());
        }
        Ok(argv)
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn unit_exists(&self, service: &str) -> bool {
        match self.flavor {
            UnitFlavor::Smf => {
                let result = Self::run("svcs", ["-H", service]).await;
                result.success && !result.output.trim().is_empty()
            }
            UnitFlavor::Systemd => {
                Self::run("systemctl", ["cat", &format!("{}.service", service)]).await.success
            }
        }
    }

    async fn disable_unit(&self, service: &str) -> ExecutionResult {
        match self.flavor {
            UnitFlavor::Smf => Self::run("svcadm", ["disable", service]).await,
            UnitFlavor::Systemd => Self::run("systemctl", ["disable", "--now", service]).await,
        }
    }

    async fn enable_unit(&self, service: &str) -> ExecutionResult {
        match self.flavor {
            UnitFlavor::Smf => Self::run("svcadm", ["enable", service]).await,
            UnitFlavor::Systemd => Self::run("systemctl", ["enable", "--now", service]).await,
        }
    }

    async fn clear_unit(&self, service: &str) -> ExecutionResult {
        match self.flavor {
            UnitFlavor::Smf => Self::run("svcadm", ["clear", service]).await,
            UnitFlavor::Systemd => Self::run("systemctl", ["reset-failed", service]).await,
        }
    }

    async fn import_unit(&self, service: &str, definition: &Path) -> ExecutionResult {
        match self.flavor {
            UnitFlavor::Smf => Self::run("svccfg", [Path::new("import"), definition]).await,
            UnitFlavor::Systemd => {
                let unit_path = self.unit_dir.join(format!("{}.service", service));
                if let Err(e) = tokio::fs::copy(definition, &unit_path).await {
                    return ExecutionResult::failed(format!(
                        "copy {} -> {}: {}",
                        definition.display(),
                        unit_path.display(),
                        e
                    ));
                }
                Self::run("systemctl", ["daemon-reload"]).await
            }
        }
    }

    async fn extract_archive(&self, archive: &Path, destination: &Path) -> ExecutionResult {
        Self::run(
            "tar",
            [Path::new("-C"), destination, Path::new("-xf"), archive],
        )
        .await
    }

    async fn run_hook(&self, hook: &Path) -> ExecutionResult {
        Self::run(&hook.to_string_lossy(), std::iter::empty::<&str>()).await
    }

    async fn set_routing_status(&self, status: RoutingStatus) -> ExecutionResult {
        let Some(template) = &self.routing_command else {
            return ExecutionResult::ok("no routing status command configured");
        };
        match Self::routing_argv(template, status) {
            Ok(argv) => Self::run(&argv[0], &argv[1..]).await,
            Err(e) => ExecutionResult::failed(e),
        }
    }
}
