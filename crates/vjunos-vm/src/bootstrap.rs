use crate::{ConsoleConnector, ExpectEngine, VmError};
use tracing::info;
use vjunos_core::{ApplianceConfig, CommandStep, Script};

/// Prompt printed by the root shell and by configuration mode.
pub const PRIVILEGED_PROMPT: &str = "#";
/// Prompt printed by operational mode.
pub const OPERATIONAL_PROMPT: &str = ">";
pub const DELETE_CONFIRM_PROMPT: &str = "Delete everything under this level? [yes,no] (no) ";
pub const NEW_PASSWORD_PROMPT: &str = "New password:";
pub const RETYPE_PASSWORD_PROMPT: &str = "Retype new password:";

/// Build the fixed bootstrap script that makes a factory-fresh appliance
/// reachable on its management interface.
///
/// The script starts from the root shell left behind by the login handshake
/// and ends back in operational mode. It wipes the configuration first, so
/// running it against an already bootstrapped appliance yields the same end
/// state.
#[must_use]
pub fn bootstrap_script(config: &ApplianceConfig) -> Script {
    let user = &config.credentials.username;
    let password = &config.credentials.password;
    let mgmt = &config.management;
    let commit_timeout = config.timeouts.commit;

    Script::new("bootstrap")
        .stage(
            "enter-cli",
            [CommandStep::after(PRIVILEGED_PROMPT, "cli")],
        )
        .stage(
            "disable-paging",
            [
                CommandStep::after(OPERATIONAL_PROMPT, "set cli screen-length 0"),
                CommandStep::after(OPERATIONAL_PROMPT, "set cli screen-width 511"),
            ],
        )
        .stage(
            "disable-complete-on-space",
            [CommandStep::after(
                OPERATIONAL_PROMPT,
                "set cli complete-on-space off",
            )],
        )
        .stage(
            "enter-configuration",
            [CommandStep::after(OPERATIONAL_PROMPT, "configure")],
        )
        .stage(
            "delete-configuration",
            [
                CommandStep::after(PRIVILEGED_PROMPT, "top delete"),
                CommandStep::after(DELETE_CONFIRM_PROMPT, "yes"),
            ],
        )
        .stage(
            "provision-user",
            password_steps(
                format!(
                    "set system login user {user} class super-user authentication plain-text-password"
                ),
                password,
            ),
        )
        .stage(
            "provision-root",
            password_steps(
                "set system root-authentication plain-text-password".into(),
                password,
            ),
        )
        .stage(
            "disable-auto-image-upgrade",
            [CommandStep::after(
                PRIVILEGED_PROMPT,
                "delete chassis auto-image-upgrade",
            )],
        )
        .stage(
            "commit-system",
            [CommandStep::after(PRIVILEGED_PROMPT, "commit").with_timeout(commit_timeout)],
        )
        .stage(
            "remove-inet6",
            [CommandStep::after(
                PRIVILEGED_PROMPT,
                "delete interfaces fxp0 unit 0 family inet6",
            )],
        )
        .stage(
            "management-address",
            [CommandStep::after(
                PRIVILEGED_PROMPT,
                format!("set interfaces fxp0 unit 0 family inet address {}", mgmt.cidr()),
            )],
        )
        .stage(
            "management-instance",
            [
                CommandStep::after(PRIVILEGED_PROMPT, "set system management-instance"),
                CommandStep::after(
                    PRIVILEGED_PROMPT,
                    format!(
                        "set routing-instances {} description management-instance",
                        mgmt.instance
                    ),
                ),
            ],
        )
        .stage(
            "management-default-route",
            [CommandStep::after(
                PRIVILEGED_PROMPT,
                format!(
                    "set routing-instances {} routing-options static route 0.0.0.0/0 next-hop {}",
                    mgmt.instance, mgmt.gateway
                ),
            )],
        )
        .stage(
            "commit-management",
            [CommandStep::after(PRIVILEGED_PROMPT, "commit").with_timeout(commit_timeout)],
        )
        .stage(
            "exit-configuration",
            [
                // The commit above may still be finishing when the first exit
                // arrives, in which case the appliance drops it.
                CommandStep::after(PRIVILEGED_PROMPT, "exit").with_timeout(commit_timeout),
                CommandStep::after(OPERATIONAL_PROMPT, "exit"),
            ],
        )
}

fn password_steps(command: String, password: &str) -> [CommandStep; 3] {
    [
        CommandStep::after(PRIVILEGED_PROMPT, command),
        CommandStep::after(NEW_PASSWORD_PROMPT, password).secret(),
        CommandStep::after(RETYPE_PASSWORD_PROMPT, password).secret(),
    ]
}

/// Apply the bootstrap script over the console.
///
/// # Errors
/// Returns the first step failure (typically `VmError::ExpectTimeout`); the
/// remaining steps are abandoned and nothing is rolled back.
pub async fn apply_bootstrap_config<K: ConsoleConnector>(
    engine: &mut ExpectEngine<K>,
    config: &ApplianceConfig,
) -> Result<(), VmError> {
    info!(hostname = %config.hostname, "applying bootstrap configuration");
    engine.run_script(&bootstrap_script(config)).await?;
    info!(hostname = %config.hostname, "completed bootstrap configuration");
    Ok(())
}
