use crate::ApplianceArgs;
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use tracing::info;
use vjunos_core::ApplianceConfig;
use vjunos_vm::{
    HealthFile, LaunchOutcome, Launcher, QemuInstance, RunState, Supervisor, TelnetConnector,
    VjunosDirs, bootstrap_script,
};

pub async fn start(args: &ApplianceArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(args)?;
    let run_dir = resolve_run_dir(run_dir, &config.hostname)?;
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

    info!(
        hostname = %config.hostname,
        connection_mode = %config.connection_mode,
        "starting vJunos-switch"
    );

    let connector = TelnetConnector::new(config.console.host.clone(), config.console.port);
    let vm = QemuInstance::new(&config, &run_dir);
    let mut supervisor = Supervisor::install().context("Failed to install signal handlers")?;

    let mut launcher = Launcher::new(config, connector, vm, &run_dir);
    let outcome = launcher.run(supervisor.shutdown_requested()).await;
    supervisor.teardown();

    match outcome.context("Appliance launch failed")? {
        LaunchOutcome::Completed => info!("appliance stopped"),
        LaunchOutcome::Interrupted => info!("startup interrupted"),
    }

    Ok(())
}

/// Print the health status and return it as the process exit code.
pub fn health(hostname: &str, run_dir: Option<PathBuf>) -> Result<i32> {
    let run_dir = resolve_run_dir(run_dir, hostname)?;
    let health = HealthFile::new(run_dir.join("health"));

    match health.read() {
        Ok(status) => {
            println!("{}", status.message);
            Ok(status.code)
        }
        Err(e) => {
            println!("health file not readable: {e}");
            Ok(1)
        }
    }
}

pub fn status(hostname: &str, run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve_run_dir(run_dir, hostname)?;
    if !run_dir.join("state.json").exists() {
        bail!("Appliance '{hostname}' has no state file in {}", run_dir.display());
    }

    let state = RunState::load(&run_dir).context("Failed to load run state")?;
    println!("Hostname:   {}", state.hostname);
    println!("State:      {}", state.state.label());
    println!("Management: {}", state.management_address);
    println!("Startup:    {:.1}s", state.startup_secs);
    println!("Restarts:   {}", state.restarts);
    Ok(())
}

pub fn show_bootstrap(args: &ApplianceArgs) -> Result<()> {
    let config = load_config(args)?;
    let script = bootstrap_script(&config);

    for (stage, step) in script.steps() {
        let prompt = step
            .wait_for
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        println!("{:<28} {:<24} {}", stage.name, prompt, step.display_text());
    }
    Ok(())
}

fn load_config(args: &ApplianceArgs) -> Result<ApplianceConfig> {
    let mut config = match &args.config {
        Some(path) => ApplianceConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ApplianceConfig::default(),
    };

    if let Some(hostname) = &args.hostname {
        config.hostname.clone_from(hostname);
    }
    if let Some(username) = &args.username {
        config.credentials.username.clone_from(username);
    }
    if let Some(password) = &args.password {
        config.credentials.password.clone_from(password);
    }
    if let Some(mode) = args.connection_mode {
        config.connection_mode = mode;
    }
    if let Some(path) = &args.startup_config {
        config.startup_config.clone_from(path);
    }

    config.validate().context("Invalid appliance configuration")?;
    Ok(config)
}

fn resolve_run_dir(run_dir: Option<PathBuf>, hostname: &str) -> Result<PathBuf> {
    if let Some(dir) = run_dir {
        return Ok(dir);
    }
    let dirs = VjunosDirs::new().context("Failed to initialize directories")?;
    Ok(dirs.run_dir(hostname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vjunos_core::ConnectionMode;

    #[test]
    fn test_flags_override_defaults() {
        let args = ApplianceArgs {
            hostname: Some("sw1".into()),
            password: Some("s3cret-pass".into()),
            connection_mode: Some(ConnectionMode::Bridge),
            ..ApplianceArgs::default()
        };

        let config = load_config(&args).unwrap();
        assert_eq!(config.hostname, "sw1");
        assert_eq!(config.credentials.username, "vrnetlab");
        assert_eq!(config.credentials.password, "s3cret-pass");
        assert_eq!(config.connection_mode, ConnectionMode::Bridge);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = ApplianceArgs {
            username: Some(String::new()),
            ..ApplianceArgs::default()
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = ApplianceArgs {
            config: Some(PathBuf::from("/nonexistent/appliance.hcl")),
            ..ApplianceArgs::default()
        };
        let err = load_config(&args).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_explicit_run_dir_wins() {
        let dir = resolve_run_dir(Some(PathBuf::from("/run/sw1")), "ignored").unwrap();
        assert_eq!(dir, PathBuf::from("/run/sw1"));
    }
}
