//! Platform configuration.
//!
//! Everything that used to be a global default in the provisioning scripts
//! lives here. The configuration is loaded once, never mutated afterwards,
//! and handed to every stage by reference.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};

/// Config file consulted when neither `--config` nor `PVE_OPS_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pve-ops/config.yaml";

/// Default storage pool for imported disks and the cloud-init drive.
pub const DEFAULT_STORAGE: &str = "proxmox_data";

/// Default network bridge.
pub const DEFAULT_BRIDGE: &str = "vmbr0";

/// Default gateway of the customer network.
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 3, 1);

/// Default base image (Debian 12 generic cloud image).
pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2";

/// Platform-wide defaults and host layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Storage pool for VM disks.
    pub storage: String,
    /// Bridge the VM NIC is attached to.
    pub bridge: String,
    /// Network gateway.
    pub gateway: Ipv4Addr,
    /// Prefix length of the customer network.
    pub subnet_prefix: u8,
    /// DNS servers handed to cloud-init, in order.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Guest timezone.
    pub timezone: String,
    /// Public key installed for cloud-init and root.
    pub ssh_public_key: PathBuf,
    /// Addresses that must never be assigned to a VM.
    pub reserved_addresses: Vec<Ipv4Addr>,
    /// Upstream URL of the base cloud image.
    pub image_url: String,
    /// File name of the cached image. Derived from `image_url` when empty.
    pub image_name: String,
    /// Directory the base image is cached in.
    pub image_cache_dir: PathBuf,
    /// Expected SHA-256 of the base image (hex). Not verified when unset.
    pub image_sha256: Option<String>,
    /// Host directory backing the snippet storage.
    pub snippets_dir: PathBuf,
    /// Storage id that exposes `snippets_dir` to the hypervisor.
    pub snippet_storage: String,
    /// Directory for the VM id allocation lock.
    pub lock_dir: PathBuf,
    /// Bastion and management hosts always allowed through the firewall.
    pub management_ips: Vec<Ipv4Addr>,
    /// Local subnet allowed through the firewall (CIDR).
    pub local_subnet: String,
    /// Public application ports opened on every new VM.
    pub app_ports: Vec<u16>,
    /// Packages installed on every new VM.
    pub packages: Vec<String>,
    /// Services enabled on every new VM.
    pub services: Vec<String>,
    /// Extra packages installed by the `app` role.
    pub app_packages: Vec<String>,
    /// How long to wait for SSH after start.
    pub ready_timeout_secs: u64,
    /// Interval between readiness probes.
    pub ready_poll_secs: u64,
    /// User for post-provision SSH sessions.
    pub ssh_user: String,
    /// SSH connect timeout.
    pub ssh_connect_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            storage: DEFAULT_STORAGE.to_string(),
            bridge: DEFAULT_BRIDGE.to_string(),
            gateway: DEFAULT_GATEWAY,
            subnet_prefix: 24,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            timezone: "Europe/Amsterdam".to_string(),
            ssh_public_key: PathBuf::from("/root/.ssh/id_rsa.pub"),
            reserved_addresses: vec![DEFAULT_GATEWAY, Ipv4Addr::new(192, 168, 3, 22)],
            image_url: DEFAULT_IMAGE_URL.to_string(),
            image_name: String::new(),
            image_cache_dir: PathBuf::from("/tmp"),
            image_sha256: None,
            snippets_dir: PathBuf::from("/var/lib/vz/snippets"),
            snippet_storage: "local".to_string(),
            lock_dir: PathBuf::from("/var/lock"),
            management_ips: vec![Ipv4Addr::new(192, 168, 3, 22)],
            local_subnet: "192.168.3.0/24".to_string(),
            app_ports: vec![8080],
            packages: [
                "curl",
                "git",
                "htop",
                "mosh",
                "nginx",
                "docker.io",
                "supervisor",
                "ufw",
                "fail2ban",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            services: ["ssh", "nginx", "docker", "supervisor", "fail2ban"]
                .into_iter()
                .map(String::from)
                .collect(),
            app_packages: ["build-essential", "make", "jq", "unzip"]
                .into_iter()
                .map(String::from)
                .collect(),
            ready_timeout_secs: 300,
            ready_poll_secs: 5,
            ssh_user: "root".to_string(),
            ssh_connect_timeout_secs: 10,
        }
    }
}

impl PlatformConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// used when present and built-in defaults otherwise.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or fails
    /// [`PlatformConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                debug!("No config file found, using built-in defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ProvisionError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            ProvisionError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded platform configuration");
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.subnet_prefix) {
            return Err(ProvisionError::Config(format!(
                "subnet_prefix must be between 1 and 32, got {}",
                self.subnet_prefix
            )));
        }
        if self.dns_servers.is_empty() {
            return Err(ProvisionError::Config(
                "at least one DNS server is required".into(),
            ));
        }
        if self.ready_poll_secs == 0 {
            return Err(ProvisionError::Config("ready_poll_secs must be > 0".into()));
        }
        if self.image_file_name().is_empty() {
            return Err(ProvisionError::Config(format!(
                "cannot derive an image file name from {}",
                self.image_url
            )));
        }
        Ok(())
    }

    /// File name of the cached base image.
    #[must_use]
    pub fn image_file_name(&self) -> String {
        if !self.image_name.is_empty() {
            return self.image_name.clone();
        }
        self.image_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Full path of the cached base image.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.image_cache_dir.join(self.image_file_name())
    }
}
