//! Parameter resolution for provisioning requests.
//!
//! Raw CLI input is kept as strings until [`resolve`] runs, so validation
//! happens in a fixed order and reports every problem found at each stage:
//!
//! 1. mandatory fields present
//! 2. numeric fields parse (and are positive where required)
//! 3. IPv4 literals are well formed and not reserved
//! 4. the SSH public key exists
//! 5. the VM name is DNS safe after sanitization and the user name is a
//!    valid POSIX login

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};

/// Default memory in MB.
pub const DEFAULT_MEMORY_MB: u32 = 2048;

/// Default vCPU count.
pub const DEFAULT_CPU_CORES: u32 = 2;

/// Default boot disk size in GB.
pub const DEFAULT_DISK_GB: u32 = 10;

/// Lowest VM id Proxmox accepts.
pub const MIN_VM_ID: u32 = 100;

/// Highest VM id Proxmox accepts.
pub const MAX_VM_ID: u32 = 999_999_999;

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})\.([0-9]{1,3})$")
        .expect("IPv4 pattern is valid")
});

static DNS_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").expect("DNS name pattern is valid"));

static USER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("user name pattern is valid"));

static TIMEZONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_+\-]*(/[A-Za-z0-9_+\-]+)*$").expect("timezone pattern is valid")
});

/// Unvalidated provisioning input, one field per CLI flag.
#[derive(Debug, Clone, Default)]
pub struct RawProvisionArgs {
    pub vm_name: Option<String>,
    pub ip: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub disk: Option<String>,
    pub vm_id: Option<String>,
    pub storage: Option<String>,
    pub bridge: Option<String>,
    pub gateway: Option<String>,
    pub subnet: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub timezone: Option<String>,
}

impl RawProvisionArgs {
    /// Fill mandatory fields that no flag set from positional arguments.
    ///
    /// Positionals are taken in order by the still-empty fields of
    /// `VM_NAME IP USER PASSWORD`, so `--vm-name web 10.0.0.5 admin pw`
    /// fills IP, user and password.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Validation`] if there are more positionals
    /// than empty fields.
    pub fn with_positionals(mut self, positionals: &[String]) -> Result<Self> {
        let mut it = positionals.iter().cloned();
        for slot in [
            &mut self.vm_name,
            &mut self.ip,
            &mut self.user,
            &mut self.password,
        ] {
            if slot.is_none() {
                match it.next() {
                    Some(value) => *slot = Some(value),
                    None => break,
                }
            }
        }

        let extra: Vec<String> = it.collect();
        if extra.is_empty() {
            Ok(self)
        } else {
            Err(ProvisionError::Validation {
                problems: vec![format!(
                    "unexpected positional arguments {} (already set by flags)",
                    extra.join(" ")
                )],
            })
        }
    }
}

/// A fully validated provisioning request.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// DNS-safe VM name.
    pub vm_name: String,
    /// Name exactly as the operator typed it.
    pub requested_name: String,
    pub ip_address: Ipv4Addr,
    pub ci_user: String,
    pub ci_password: String,
    pub memory_mb: u32,
    pub cpu_cores: u32,
    pub disk_gb: u32,
    /// Explicit VM id, or `None` to ask the cluster.
    pub vm_id: Option<u32>,
    pub storage_id: String,
    pub bridge: String,
    pub gateway: Ipv4Addr,
    pub subnet_prefix: u8,
    pub ssh_pubkey_path: PathBuf,
    pub timezone: String,
}

impl ProvisionRequest {
    /// Whether sanitization changed the requested name.
    #[must_use]
    pub fn name_was_sanitized(&self) -> bool {
        self.vm_name != self.requested_name
    }

    /// Address with prefix length, e.g. `192.168.3.50/24`.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip_address, self.subnet_prefix)
    }

    /// Cloud-init `ipconfig0` value.
    #[must_use]
    pub fn ip_config(&self) -> String {
        format!("ip={},gw={}", self.cidr(), self.gateway)
    }

    /// Name of the generated cloud-init snippet.
    #[must_use]
    pub fn snippet_file_name(&self) -> String {
        format!("custom-{}.sh", self.vm_name)
    }
}

// The password must never end up in logs.
impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("vm_name", &self.vm_name)
            .field("requested_name", &self.requested_name)
            .field("ip_address", &self.ip_address)
            .field("ci_user", &self.ci_user)
            .field("ci_password", &"********")
            .field("memory_mb", &self.memory_mb)
            .field("cpu_cores", &self.cpu_cores)
            .field("disk_gb", &self.disk_gb)
            .field("vm_id", &self.vm_id)
            .field("storage_id", &self.storage_id)
            .field("bridge", &self.bridge)
            .field("gateway", &self.gateway)
            .field("subnet_prefix", &self.subnet_prefix)
            .field("ssh_pubkey_path", &self.ssh_pubkey_path)
            .field("timezone", &self.timezone)
            .finish()
    }
}

impl fmt::Display for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  VM name:   {}", self.vm_name)?;
        writeln!(
            f,
            "  VM id:     {}",
            self.vm_id
                .map_or_else(|| "auto".to_string(), |id| id.to_string())
        )?;
        writeln!(f, "  IP:        {}", self.cidr())?;
        writeln!(f, "  Gateway:   {}", self.gateway)?;
        writeln!(f, "  User:      {}", self.ci_user)?;
        writeln!(f, "  Password:  ********")?;
        writeln!(f, "  Memory:    {} MB", self.memory_mb)?;
        writeln!(f, "  Cores:     {}", self.cpu_cores)?;
        writeln!(f, "  Disk:      {} GB", self.disk_gb)?;
        writeln!(f, "  Storage:   {}", self.storage_id)?;
        writeln!(f, "  Bridge:    {}", self.bridge)?;
        writeln!(f, "  SSH key:   {}", self.ssh_pubkey_path.display())?;
        write!(f, "  Timezone:  {}", self.timezone)
    }
}

/// Resolve raw input against platform defaults.
///
/// # Errors
/// Returns [`ProvisionError::Validation`] listing every problem of the first
/// failing stage.
pub fn resolve(raw: &RawProvisionArgs, config: &PlatformConfig) -> Result<ProvisionRequest> {
    // Stage 1: presence
    let mut problems = Vec::new();
    let vm_name = required(&raw.vm_name, "--vm-name", &mut problems);
    let ip = required(&raw.ip, "--ip", &mut problems);
    let user = required(&raw.user, "--user", &mut problems);
    let password = required(&raw.password, "--password", &mut problems);
    finish_stage(problems)?;

    // Stage 2: numbers
    let mut problems = Vec::new();
    let memory_mb = positive(&raw.memory, "--memory", DEFAULT_MEMORY_MB, &mut problems);
    let cpu_cores = positive(&raw.cpu, "--cpu", DEFAULT_CPU_CORES, &mut problems);
    let disk_gb = positive(&raw.disk, "--disk", DEFAULT_DISK_GB, &mut problems);
    let vm_id = match raw.vm_id.as_deref().map(str::trim) {
        None => None,
        Some(v) => match v.parse::<u32>() {
            Ok(id) if (MIN_VM_ID..=MAX_VM_ID).contains(&id) => Some(id),
            Ok(id) => {
                problems.push(format!(
                    "--vm-id must be between {MIN_VM_ID} and {MAX_VM_ID}, got {id}"
                ));
                None
            }
            Err(_) => {
                problems.push(format!("--vm-id must be an integer, got '{v}'"));
                None
            }
        },
    };
    let subnet_prefix = match raw.subnet.as_deref().map(str::trim) {
        None => config.subnet_prefix,
        Some(v) => match v.trim_start_matches('/').parse::<u8>() {
            Ok(p) if (1..=32).contains(&p) => p,
            _ => {
                problems.push(format!("--subnet must be a prefix length 1-32, got '{v}'"));
                config.subnet_prefix
            }
        },
    };
    finish_stage(problems)?;

    // Stage 3: addresses
    let mut problems = Vec::new();
    let ip_address = match parse_ipv4(&ip) {
        Some(addr) => Some(addr),
        None => {
            problems.push(format!("--ip '{ip}' is not a valid IPv4 address"));
            None
        }
    };
    let gateway = match raw.gateway.as_deref() {
        None => Some(config.gateway),
        Some(g) => parse_ipv4(g).or_else(|| {
            problems.push(format!("--gateway '{g}' is not a valid IPv4 address"));
            None
        }),
    };
    if let (Some(addr), Some(gw)) = (ip_address, gateway) {
        if addr == gw || config.reserved_addresses.contains(&addr) {
            problems.push(format!("--ip {addr} is a reserved address"));
        }
    }
    finish_stage(problems)?;
    let (Some(ip_address), Some(gateway)) = (ip_address, gateway) else {
        return Err(ProvisionError::invalid("invalid network addresses"));
    };

    // Stage 4: SSH key
    let ssh_pubkey_path = raw
        .ssh_key
        .clone()
        .unwrap_or_else(|| config.ssh_public_key.clone());
    if !ssh_pubkey_path.is_file() {
        return Err(ProvisionError::invalid(format!(
            "SSH public key not found: {}",
            ssh_pubkey_path.display()
        )));
    }

    // Stage 5: names
    let mut problems = Vec::new();
    let sanitized = sanitize_vm_name(&vm_name).unwrap_or_else(|reason| {
        problems.push(reason);
        String::new()
    });
    if !USER_NAME_RE.is_match(&user) {
        problems.push(format!(
            "--user '{user}' must be a POSIX login name: lowercase letters, digits, '_' or '-', \
             starting with a letter or '_', at most 32 characters"
        ));
    }
    finish_stage(problems)?;

    let timezone = raw
        .timezone
        .clone()
        .unwrap_or_else(|| config.timezone.clone());
    if !TIMEZONE_RE.is_match(&timezone) {
        return Err(ProvisionError::invalid(format!(
            "--timezone '{timezone}' is not an IANA zone name"
        )));
    }

    Ok(ProvisionRequest {
        vm_name: sanitized,
        requested_name: vm_name,
        ip_address,
        ci_user: user,
        ci_password: password,
        memory_mb,
        cpu_cores,
        disk_gb,
        vm_id,
        storage_id: raw.storage.clone().unwrap_or_else(|| config.storage.clone()),
        bridge: raw.bridge.clone().unwrap_or_else(|| config.bridge.clone()),
        gateway,
        subnet_prefix,
        ssh_pubkey_path,
        timezone,
    })
}

/// Turn a requested VM name into a DNS-safe host name.
///
/// Underscores become hyphens; anything else outside `[a-zA-Z0-9-]`, or a
/// leading/trailing hyphen, is rejected rather than rewritten.
///
/// # Errors
/// Returns a human-readable reason when the name cannot be made valid.
pub fn sanitize_vm_name(name: &str) -> std::result::Result<String, String> {
    let sanitized = name.trim().replace('_', "-");
    if sanitized.is_empty() {
        return Err("VM name is empty".to_string());
    }
    if !DNS_NAME_RE.is_match(&sanitized) {
        return Err(format!(
            "VM name '{name}' may only contain letters, digits, hyphens and underscores"
        ));
    }
    if sanitized.starts_with('-') || sanitized.ends_with('-') {
        return Err(format!(
            "VM name '{name}' must not start or end with a hyphen or underscore"
        ));
    }
    if sanitized.len() > 63 {
        return Err(format!("VM name '{name}' is longer than 63 characters"));
    }
    Ok(sanitized)
}

/// Parse a dotted-quad IPv4 literal (four decimal octets, each 0-255).
#[must_use]
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let caps = IPV4_RE.captures(s)?;
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = caps[i + 1].parse().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

fn required(value: &Option<String>, flag: &str, problems: &mut Vec<String>) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            problems.push(format!("missing required parameter {flag}"));
            String::new()
        }
    }
}

fn positive(value: &Option<String>, flag: &str, default: u32, problems: &mut Vec<String>) -> u32 {
    let Some(v) = value.as_deref().map(str::trim) else {
        return default;
    };
    match v.parse::<u32>() {
        Ok(0) => {
            problems.push(format!("{flag} must be greater than zero"));
            default
        }
        Ok(n) => n,
        Err(_) => {
            problems.push(format!("{flag} must be a positive integer, got '{v}'"));
            default
        }
    }
}

fn finish_stage(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::Validation { problems })
    }
}
