use crate::{ApplianceLifecycle, VmError, path_to_str};
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use vjunos_core::{ApplianceConfig, ConnectionMode, ManagementConfig, QemuConfig};

const QEMU_BINARY: &str = "qemu-system-x86_64";
const CPU_MODEL: &str = "IvyBridge,vme=on,ss=on,vmx=on,f16c=on,rdrand=on,hypervisor=on,arat=on,tsc-adjust=on,umip=on,arch-capabilities=on,pdpe1gb=on,skip-l1dfl-vmentry=on,pschange-mc-no=on,bmi1=off,avx2=off,bmi2=off,erms=off,invpcid=off,rdseed=off,adx=off,smap=off,xsaveopt=off,abm=off,svm=off";
const MACHINE: &str = "pc-i440fx-focal,usb=off,dump-guest-core=off,accel=kvm";
const SMBIOS: &str = "type=1,product=VM-VEX";
const TC_IFUP_SCRIPT: &str = "/etc/tc-tap-ifup";
const BRIDGE_IFUP_SCRIPT: &str = "/etc/bridge-ifup";
const VRXCON_BASE_PORT: u32 = 10000;
const STOP_GRACE: Duration = Duration::from_secs(5);
const QMP_TIMEOUT: Duration = Duration::from_secs(2);

/// Management services forwarded from the host into the appliance as
/// (protocol, host port, guest port).
const MGMT_FORWARDS: [(&str, u16, u16); 3] = [
    ("tcp", 2022, 22),
    ("tcp", 2830, 830),
    ("udp", 2161, 161),
];

/// The vJunos-switch virtual machine.
pub struct QemuInstance {
    pub name: String,
    pub qemu: QemuConfig,
    pub management: ManagementConfig,
    pub connection_mode: ConnectionMode,
    pub console_port: u16,
    pub qmp_socket: PathBuf,
    pub pid_file: PathBuf,
    pub logs_dir: PathBuf,
    qmp_timeout: Duration,
    process: Option<Child>,
}

impl QemuInstance {
    #[must_use]
    pub fn new(config: &ApplianceConfig, run_dir: &Path) -> Self {
        Self {
            name: config.hostname.clone(),
            qemu: config.qemu.clone(),
            management: config.management.clone(),
            connection_mode: config.connection_mode,
            console_port: config.console.port,
            qmp_socket: run_dir.join("qmp.sock"),
            pid_file: run_dir.join("qemu.pid"),
            logs_dir: run_dir.to_path_buf(),
            qmp_timeout: QMP_TIMEOUT,
            process: None,
        }
    }

    /// The configured disk image, or the first `*.qcow2` in the image
    /// directory.
    ///
    /// # Errors
    /// Returns `VmError::Qemu` if no image can be found.
    pub fn disk_image(&self) -> Result<PathBuf, VmError> {
        if let Some(image) = &self.qemu.disk_image {
            return Ok(image.clone());
        }
        find_disk_image(&self.qemu.image_dir)
    }

    /// Full QEMU argument list for `disk`.
    ///
    /// # Errors
    /// Returns `VmError` if a path is not valid UTF-8 or too many NICs are
    /// requested.
    pub fn build_args(&self, disk: &Path) -> Result<Vec<String>, VmError> {
        let mut args: Vec<String> = vec!["-name".into(), self.name.clone()];

        self.apply_resource_args(&mut args);
        Self::apply_machine_args(&mut args);
        apply(&mut args, "-drive", format!("if=ide,file={},format=qcow2", path_to_str(disk)?));
        self.apply_console_args(&mut args);
        apply(
            &mut args,
            "-qmp",
            format!("unix:{},server,nowait", path_to_str(&self.qmp_socket)?),
        );
        self.apply_mgmt_args(&mut args)?;
        self.apply_data_nic_args(&mut args)?;

        Ok(args)
    }

    fn apply_resource_args(&self, args: &mut Vec<String>) {
        apply(args, "-m", self.qemu.memory.to_string());
        apply(
            args,
            "-smp",
            format!("{0},sockets=1,cores={0},threads=1", self.qemu.cpus),
        );
    }

    fn apply_machine_args(args: &mut Vec<String>) {
        apply(args, "-cpu", CPU_MODEL);
        apply(args, "-overcommit", "mem-lock=off");
        args.extend(
            ["-display", "none", "-no-user-config", "-nodefaults", "-boot", "strict=on"]
                .map(String::from),
        );
        apply(args, "-machine", MACHINE);
        apply(args, "-smbios", SMBIOS);
        apply(args, "-device", "piix3-usb-uhci,id=usb,bus=pci.0,addr=0x1.0x2");
    }

    fn apply_console_args(&self, args: &mut Vec<String>) {
        apply(
            args,
            "-serial",
            format!("telnet:0.0.0.0:{},server,nowait", self.console_port),
        );
    }

    fn apply_mgmt_args(&self, args: &mut Vec<String>) -> Result<(), VmError> {
        let guest = self.management.address;
        let mut netdev = format!(
            "user,id=mgmt,net={}/{}",
            network_address(guest, self.management.prefix_len),
            self.management.prefix_len
        );
        for (proto, host_port, guest_port) in MGMT_FORWARDS {
            netdev.push_str(&format!(",hostfwd={proto}::{host_port}-{guest}:{guest_port}"));
        }

        apply(args, "-netdev", netdev);
        apply(
            args,
            "-device",
            format!("virtio-net-pci,netdev=mgmt,mac={}", mac_address(0)?),
        );
        Ok(())
    }

    fn apply_data_nic_args(&self, args: &mut Vec<String>) -> Result<(), VmError> {
        for nic in 1..=self.qemu.nics {
            let netdev = match self.connection_mode {
                ConnectionMode::Tc => format!(
                    "tap,id=p{nic:02},ifname=tap{nic},script={TC_IFUP_SCRIPT},downscript=no"
                ),
                ConnectionMode::Bridge => format!(
                    "tap,id=p{nic:02},ifname=tap{nic},script={BRIDGE_IFUP_SCRIPT},downscript=no"
                ),
                ConnectionMode::Vrxcon => {
                    format!("socket,id=p{nic:02},listen=:{}", VRXCON_BASE_PORT + nic)
                }
            };
            apply(args, "-netdev", netdev);
            apply(
                args,
                "-device",
                format!("virtio-net-pci,netdev=p{nic:02},mac={}", mac_address(nic)?),
            );
        }
        Ok(())
    }

    /// Spawn the QEMU process.
    ///
    /// # Errors
    /// Returns `VmError` if the disk image is missing or QEMU fails to launch.
    pub fn launch(&mut self) -> Result<(), VmError> {
        if self.process.is_some() {
            return Err(VmError::Qemu(format!("VM '{}' is already running", self.name)));
        }

        std::fs::create_dir_all(&self.logs_dir)?;
        let disk = self.disk_image()?;
        let args = self.build_args(&disk)?;
        debug!(vm = %self.name, ?args, "launching QEMU");

        let mut cmd = Command::new(QEMU_BINARY);
        cmd.args(&args);
        self.redirect_qemu_output(&mut cmd)?;

        let child = cmd
            .spawn()
            .map_err(|e| VmError::Qemu(format!("Failed to start QEMU: {e}")))?;

        if let Err(e) = std::fs::write(&self.pid_file, child.id().to_string()) {
            return Err(VmError::Qemu(format!(
                "Failed to write QEMU PID file {}: {e}",
                self.pid_file.display()
            )));
        }

        info!(vm = %self.name, pid = child.id(), disk = %disk.display(), "VM started");
        self.process = Some(child);
        Ok(())
    }

    fn redirect_qemu_output(&self, cmd: &mut Command) -> Result<(), VmError> {
        let log_path = self.logs_dir.join("qemu.log");
        let open_failed =
            |e: std::io::Error| VmError::Qemu(format!("{}: {e}", log_path.display()));
        let stdout = File::create(&log_path).map_err(open_failed)?;
        let stderr = stdout.try_clone().map_err(open_failed)?;

        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        Ok(())
    }

    /// Ask QEMU to exit through its QMP socket.
    ///
    /// The whole exchange (greeting, capabilities, `quit`) must finish within
    /// the QMP timeout; a monitor that accepts but never answers is given up on.
    ///
    /// # Errors
    /// Returns `VmError::Qmp` if the socket is unreachable, QEMU rejects a
    /// command, or the exchange times out.
    pub async fn request_quit(&self) -> Result<(), VmError> {
        tokio::time::timeout(self.qmp_timeout, quit_over_qmp(&self.qmp_socket))
            .await
            .map_err(|_| {
                VmError::Qmp(format!("monitor silent for {:?}", self.qmp_timeout))
            })?
    }

    /// Ask QEMU to quit, then kill it if it is still around after a grace
    /// period.
    ///
    /// # Errors
    /// Never fails today; QMP and kill errors are logged and ignored.
    pub async fn shutdown(&mut self) -> Result<(), VmError> {
        if let Err(e) = self.request_quit().await {
            warn!(vm = %self.name, error = %e, "QMP quit failed, falling back to kill");
        }

        if let Some(mut child) = self.process.take() {
            let deadline = Instant::now() + STOP_GRACE;

            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            warn!(vm = %self.name, "QEMU did not exit, killing");
                            child.kill().ok();
                            child.wait().ok();
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(_) => {
                        child.kill().ok();
                        child.wait().ok();
                        break;
                    }
                }
            }
            info!(vm = %self.name, "VM stopped");
        }

        for path in [&self.qmp_socket, &self.pid_file] {
            if path.exists() {
                std::fs::remove_file(path).ok();
            }
        }

        Ok(())
    }
}

impl ApplianceLifecycle for QemuInstance {
    async fn start(&mut self) -> Result<(), VmError> {
        self.launch()
    }

    async fn stop(&mut self) -> Result<(), VmError> {
        self.shutdown().await
    }
}

impl Drop for QemuInstance {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            child.kill().ok();
        }

        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file).ok();
        }
    }
}

fn apply(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.into());
    args.push(value.into());
}

/// First `*.qcow2` file in `dir`, by name.
///
/// # Errors
/// Returns `VmError::Qemu` if the directory has no qcow2 image.
pub fn find_disk_image(dir: &Path) -> Result<PathBuf, VmError> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "qcow2"))
        .collect();
    images.sort();

    images
        .into_iter()
        .next()
        .ok_or_else(|| VmError::Qemu(format!("No qcow2 disk image found in {}", dir.display())))
}

/// Locally administered MAC for NIC `index` (0 is management).
///
/// # Errors
/// Returns `VmError::Qemu` if the index does not fit in one octet.
pub fn mac_address(index: u32) -> Result<String, VmError> {
    let last = u8::try_from(index)
        .map_err(|_| VmError::Qemu("Too many NICs to generate MAC addresses".into()))?;
    Ok(format!("0c:00:4a:53:00:{last:02x}"))
}

#[must_use]
pub fn network_address(address: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(u32::from(address) & mask)
}

async fn quit_over_qmp(socket: &Path) -> Result<(), VmError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| VmError::Qmp(format!("connect {}: {e}", socket.display())))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = BufReader::new(read_half).lines();

    next_qmp_reply(&mut replies, "QMP").await?;
    for command in ["qmp_capabilities", "quit"] {
        let request = format!("{}\n", serde_json::json!({ "execute": command }));
        write_half
            .write_all(request.as_bytes())
            .await
            .map_err(|e| VmError::Qmp(format!("send {command}: {e}")))?;
        next_qmp_reply(&mut replies, "return").await?;
    }
    Ok(())
}

/// Skip asynchronous events until a message carrying `key` arrives.
async fn next_qmp_reply<R: AsyncBufRead + Unpin>(
    replies: &mut Lines<R>,
    key: &str,
) -> Result<(), VmError> {
    while let Some(line) = replies
        .next_line()
        .await
        .map_err(|e| VmError::Qmp(format!("read: {e}")))?
    {
        let message: serde_json::Value = serde_json::from_str(&line)?;
        if message.get(key).is_some() {
            return Ok(());
        }
        if let Some(err) = message.get("error") {
            return Err(VmError::Qmp(err.to_string()));
        }
        if message.get("event").is_none() {
            return Err(VmError::Qmp(format!("unexpected reply {message}")));
        }
    }
    Err(VmError::Qmp(format!("monitor closed before '{key}'")))
}
