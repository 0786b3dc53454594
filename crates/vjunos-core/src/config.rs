use crate::CoreError;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOSTNAME: &str = "vr-vjunosswitch";
pub const DEFAULT_USERNAME: &str = "vrnetlab";
pub const DEFAULT_PASSWORD: &str = "VR-netlab9";
pub const DEFAULT_STARTUP_CONFIG: &str = "/config/startup-config.cfg";
pub const DEFAULT_SPIN_LIMIT: u32 = 300;
pub const DEFAULT_CONSOLE_PORT: u16 = 5000;

/// Everything needed to bring one appliance from power-on to reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceConfig {
    pub hostname: String,
    pub credentials: Credentials,
    pub connection_mode: ConnectionMode,
    pub startup_config: PathBuf,
    pub boot: BootConfig,
    pub management: ManagementConfig,
    pub timeouts: TimeoutConfig,
    pub console: ConsoleConfig,
    pub qemu: QemuConfig,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// How data-plane NICs are attached on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Tap devices wired up by the `tc` ifup script.
    #[default]
    Tc,
    /// Tap devices enslaved to a host bridge.
    Bridge,
    /// QEMU socket listeners, one TCP port per NIC.
    Vrxcon,
}

impl ConnectionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Tc => "tc",
            ConnectionMode::Bridge => "bridge",
            ConnectionMode::Vrxcon => "vrxcon",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tc" => Ok(ConnectionMode::Tc),
            "bridge" => Ok(ConnectionMode::Bridge),
            "vrxcon" => Ok(ConnectionMode::Vrxcon),
            other => Err(CoreError::InvalidConfig(format!(
                "Unknown connection mode '{other}' (expected tc, bridge or vrxcon)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Silent poll cycles tolerated before the VM is restarted.
    pub spin_limit: u32,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    /// `None` restarts a stalled VM forever.
    pub max_restarts: Option<u32>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            spin_limit: DEFAULT_SPIN_LIMIT,
            poll_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    /// Name of the dedicated management routing instance.
    pub instance: String,
}

impl ManagementConfig {
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 15),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 0, 0, 2),
            instance: "mgmt_junos".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub default: Duration,
    /// Commits on a freshly booted appliance routinely take minutes.
    pub commit: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(60),
            commit: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_CONSOLE_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuConfig {
    /// Explicit disk image; when unset the first `*.qcow2` in `image_dir` is used.
    pub disk_image: Option<PathBuf>,
    pub image_dir: PathBuf,
    pub memory: u32,
    pub cpus: u32,
    pub nics: u32,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            disk_image: None,
            image_dir: PathBuf::from("/"),
            memory: 5120,
            cpus: 4,
            nics: 11,
        }
    }
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.into(),
            credentials: Credentials {
                username: DEFAULT_USERNAME.into(),
                password: DEFAULT_PASSWORD.into(),
            },
            connection_mode: ConnectionMode::default(),
            startup_config: PathBuf::from(DEFAULT_STARTUP_CONFIG),
            boot: BootConfig::default(),
            management: ManagementConfig::default(),
            timeouts: TimeoutConfig::default(),
            console: ConsoleConfig::default(),
            qemu: QemuConfig::default(),
        }
    }
}

impl ApplianceConfig {
    /// Parse an appliance definition from an HCL file path.
    ///
    /// # Errors
    /// Returns `CoreError` if the file cannot be read or the contents cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse an appliance definition from an HCL string.
    ///
    /// Attributes that are not set keep their defaults.
    ///
    /// # Errors
    /// Returns `CoreError` if the HCL is invalid or an attribute has the wrong type.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let body: hcl::Body =
            hcl::from_str(content).map_err(|e| CoreError::HclParse(e.to_string()))?;

        let block = body
            .blocks()
            .find(|b| b.identifier.as_str() == "appliance")
            .ok_or_else(|| CoreError::InvalidConfig("No appliance block found".into()))?;

        let mut config = ApplianceConfig::default();
        if let Some(label) = block.labels.first() {
            config.hostname = label.as_str().to_string();
        }

        for attr in block.body.attributes() {
            match attr.key.as_str() {
                "username" => config.credentials.username = extract_string(&attr.expr)?,
                "password" => config.credentials.password = extract_string(&attr.expr)?,
                "connection_mode" => {
                    config.connection_mode = extract_string(&attr.expr)?.parse()?;
                }
                "startup_config" => {
                    config.startup_config = PathBuf::from(extract_string(&attr.expr)?);
                }
                other => {
                    return Err(CoreError::InvalidConfig(format!(
                        "appliance block does not support attribute '{other}'"
                    )));
                }
            }
        }

        for inner in block.body.blocks() {
            match inner.identifier.as_str() {
                "boot" => parse_boot(inner, &mut config.boot)?,
                "management" => parse_management(inner, &mut config.management)?,
                "timeouts" => parse_timeouts(inner, &mut config.timeouts)?,
                "console" => parse_console(inner, &mut config.console)?,
                "qemu" => parse_qemu(inner, &mut config.qemu)?,
                other => {
                    return Err(CoreError::InvalidConfig(format!(
                        "Unknown block '{other}' in appliance"
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Check values that would make the bootstrap impossible.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.hostname.trim().is_empty() {
            return Err(CoreError::InvalidConfig("hostname must not be empty".into()));
        }
        if self.credentials.username.trim().is_empty() {
            return Err(CoreError::InvalidConfig("username must not be empty".into()));
        }
        if self.credentials.password.is_empty() {
            return Err(CoreError::InvalidConfig("password must not be empty".into()));
        }
        if self.boot.spin_limit == 0 {
            return Err(CoreError::InvalidConfig("spin_limit must be positive".into()));
        }
        if self.boot.poll_interval.is_zero() || self.boot.read_timeout.is_zero() {
            return Err(CoreError::InvalidConfig(
                "poll interval and read timeout must be positive".into(),
            ));
        }
        if self.management.prefix_len > 32 {
            return Err(CoreError::InvalidConfig(format!(
                "management prefix length {} exceeds 32",
                self.management.prefix_len
            )));
        }
        if self.management.instance.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "management instance name must not be empty".into(),
            ));
        }
        if self.qemu.nics == 0 {
            return Err(CoreError::InvalidConfig("at least one NIC is required".into()));
        }
        Ok(())
    }
}

/// Parse `a.b.c.d/len` into an address and prefix length.
///
/// # Errors
/// Returns `CoreError::InvalidConfig` for malformed input.
pub fn parse_cidr(value: &str) -> Result<(Ipv4Addr, u8), CoreError> {
    let (addr, len) = value
        .split_once('/')
        .ok_or_else(|| CoreError::InvalidConfig(format!("Expected a.b.c.d/len, got '{value}'")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| CoreError::InvalidConfig(format!("Invalid IPv4 address in '{value}'")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| CoreError::InvalidConfig(format!("Invalid prefix length in '{value}'")))?;
    if len > 32 {
        return Err(CoreError::InvalidConfig(format!(
            "Prefix length {len} exceeds 32 in '{value}'"
        )));
    }
    Ok((addr, len))
}

fn parse_boot(block: &hcl::Block, boot: &mut BootConfig) -> Result<(), CoreError> {
    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "spin_limit" => boot.spin_limit = extract_u32(&attr.expr)?,
            "poll_interval_secs" => {
                boot.poll_interval = Duration::from_secs(u64::from(extract_u32(&attr.expr)?));
            }
            "read_timeout_secs" => {
                boot.read_timeout = Duration::from_secs(u64::from(extract_u32(&attr.expr)?));
            }
            "max_restarts" => boot.max_restarts = Some(extract_u32(&attr.expr)?),
            other => return Err(unsupported_attr(block, other)),
        }
    }
    Ok(())
}

fn parse_management(block: &hcl::Block, mgmt: &mut ManagementConfig) -> Result<(), CoreError> {
    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "address" => {
                let (address, prefix_len) = parse_cidr(&extract_string(&attr.expr)?)?;
                mgmt.address = address;
                mgmt.prefix_len = prefix_len;
            }
            "gateway" => {
                let value = extract_string(&attr.expr)?;
                mgmt.gateway = value.parse().map_err(|_| {
                    CoreError::InvalidConfig(format!("Invalid gateway address '{value}'"))
                })?;
            }
            "instance" => mgmt.instance = extract_string(&attr.expr)?,
            other => return Err(unsupported_attr(block, other)),
        }
    }
    Ok(())
}

fn parse_timeouts(block: &hcl::Block, timeouts: &mut TimeoutConfig) -> Result<(), CoreError> {
    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "default_secs" => {
                timeouts.default = Duration::from_secs(u64::from(extract_u32(&attr.expr)?));
            }
            "commit_secs" => {
                timeouts.commit = Duration::from_secs(u64::from(extract_u32(&attr.expr)?));
            }
            other => return Err(unsupported_attr(block, other)),
        }
    }
    Ok(())
}

fn parse_console(block: &hcl::Block, console: &mut ConsoleConfig) -> Result<(), CoreError> {
    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "host" => console.host = extract_string(&attr.expr)?,
            "port" => console.port = extract_u16(&attr.expr)?,
            other => return Err(unsupported_attr(block, other)),
        }
    }
    Ok(())
}

fn parse_qemu(block: &hcl::Block, qemu: &mut QemuConfig) -> Result<(), CoreError> {
    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "disk_image" => qemu.disk_image = Some(PathBuf::from(extract_string(&attr.expr)?)),
            "image_dir" => qemu.image_dir = PathBuf::from(extract_string(&attr.expr)?),
            "memory" => qemu.memory = extract_u32(&attr.expr)?,
            "cpus" => qemu.cpus = extract_u32(&attr.expr)?,
            "nics" => qemu.nics = extract_u32(&attr.expr)?,
            other => return Err(unsupported_attr(block, other)),
        }
    }
    Ok(())
}

fn unsupported_attr(block: &hcl::Block, key: &str) -> CoreError {
    CoreError::InvalidConfig(format!(
        "{} block does not support attribute '{key}'",
        block.identifier
    ))
}

fn extract_string(expr: &hcl::Expression) -> Result<String, CoreError> {
    match expr {
        hcl::Expression::String(s) => Ok(s.clone()),
        hcl::Expression::TemplateExpr(t) => Ok(t.to_string().trim_matches('"').to_string()),
        _ => Err(CoreError::InvalidConfig(format!(
            "Expected string, got {expr:?}"
        ))),
    }
}

fn extract_u32(expr: &hcl::Expression) -> Result<u32, CoreError> {
    match expr {
        hcl::Expression::Number(n) => n
            .as_u64()
            .ok_or_else(|| CoreError::InvalidConfig("Invalid number".into()))
            .and_then(|v| {
                u32::try_from(v).map_err(|_| CoreError::InvalidConfig("Invalid number".into()))
            }),
        _ => Err(CoreError::InvalidConfig(format!(
            "Expected number, got {expr:?}"
        ))),
    }
}

fn extract_u16(expr: &hcl::Expression) -> Result<u16, CoreError> {
    let value = extract_u32(expr)?;
    u16::try_from(value).map_err(|_| CoreError::InvalidConfig("Invalid number".into()))
}
