//! pve-ops CLI - VM provisioning and role configuration on a Proxmox host.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pve_ops::cloudinit::snippet;
use pve_ops::params::{self, parse_ipv4, sanitize_vm_name};
use pve_ops::ui::{print_error, print_info, print_progress_step, print_section, print_success, print_warning};
use pve_ops::{
    lifecycle, PlatformConfig, ProvisionError, Provisioner, ProxySite, QmCli, RawProvisionArgs,
    RolePlan, RoleProfile, SshSession, TemplateEngine,
};

/// pve-ops - Provision and configure VMs on a Proxmox VE host.
#[derive(Parser)]
#[command(name = "pve-ops")]
#[command(about = "Provision and configure VMs on a Proxmox VE host")]
#[command(version)]
struct Cli {
    /// Platform configuration file (or set `PVE_OPS_CONFIG` env var).
    #[arg(long, global = true, env = "PVE_OPS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, configure and start a new VM.
    Provision {
        #[command(flatten)]
        args: ProvisionArgs,

        /// Return as soon as the VM is started instead of waiting for SSH.
        #[arg(long, default_value = "false")]
        no_wait: bool,
    },

    /// Print the cloud-init script a provision would generate.
    Snippet {
        #[command(flatten)]
        args: ProvisionArgs,
    },

    /// Stop and purge a VM.
    Destroy {
        /// VM id.
        vm_id: u32,

        /// Also remove the VM's cloud-init snippet.
        #[arg(long)]
        vm_name: Option<String>,
    },

    /// Apply a role profile to a running VM over SSH.
    Restrict {
        /// VM IP address.
        ip: String,

        /// Role: `app` or `bastion`.
        role: String,

        /// CircleCI API key written into the app Makefile.
        circleci_api_key: Option<String>,
    },

    /// Install an Nginx reverse proxy site on a bastion.
    NginxProxy {
        /// Bastion IP address.
        bastion_ip: String,

        /// Parent domain (e.g., example.com).
        domain: String,

        /// Subdomain label (e.g., shop).
        subdomain: String,

        /// Application VM IP address.
        app_ip: String,

        /// Application port.
        app_port: String,

        /// Print the site configuration instead of installing it.
        #[arg(long, default_value = "false")]
        print: bool,
    },
}

/// Provisioning parameters. Positionals fill the fields no flag set.
#[derive(Args)]
struct ProvisionArgs {
    /// VM_NAME IP USER PASSWORD
    #[arg(num_args = 0..=4, value_name = "ARGS")]
    positionals: Vec<String>,

    /// VM name (underscores become hyphens).
    #[arg(short = 'n', long)]
    vm_name: Option<String>,

    /// VM IPv4 address.
    #[arg(short, long)]
    ip: Option<String>,

    /// Cloud-init user.
    #[arg(short, long)]
    user: Option<String>,

    /// Cloud-init password.
    #[arg(short, long)]
    password: Option<String>,

    /// Memory in MB [default: 2048].
    #[arg(short, long)]
    memory: Option<String>,

    /// vCPU cores [default: 2].
    #[arg(short, long)]
    cpu: Option<String>,

    /// Disk size in GB [default: 10].
    #[arg(short, long)]
    disk: Option<String>,

    /// Explicit VM id (allocated by the cluster when omitted).
    #[arg(long)]
    vm_id: Option<String>,

    /// Storage pool.
    #[arg(short, long)]
    storage: Option<String>,

    /// Network bridge.
    #[arg(short, long)]
    bridge: Option<String>,

    /// Gateway (or set `GATEWAY` env var).
    #[arg(short, long, env = "GATEWAY")]
    gateway: Option<String>,

    /// Subnet prefix length.
    #[arg(long)]
    subnet: Option<String>,

    /// SSH public key file.
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Guest timezone.
    #[arg(short, long)]
    timezone: Option<String>,
}

impl ProvisionArgs {
    fn into_raw(self) -> pve_ops::Result<RawProvisionArgs> {
        RawProvisionArgs {
            vm_name: self.vm_name,
            ip: self.ip,
            user: self.user,
            password: self.password,
            memory: self.memory,
            cpu: self.cpu,
            disk: self.disk,
            vm_id: self.vm_id,
            storage: self.storage,
            bridge: self.bridge,
            gateway: self.gateway,
            subnet: self.subnet,
            ssh_key: self.ssh_key,
            timezone: self.timezone,
        }
        .with_positionals(&self.positionals)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PlatformConfig::load(cli.config.as_deref())
        .context("Failed to load platform configuration")?;

    match cli.command {
        Commands::Provision { args, no_wait } => provision(args, no_wait, &config).await,
        Commands::Snippet { args } => {
            let request = params::resolve(&args.into_raw()?, &config)?;
            let engine = TemplateEngine::new()?;
            print!("{}", snippet::render(&request, &config, &engine)?);
            Ok(())
        }
        Commands::Destroy { vm_id, vm_name } => {
            let hypervisor = QmCli::default();
            lifecycle::destroy(&hypervisor, vm_id)
                .await
                .with_context(|| format!("Failed to destroy VM {vm_id}"))?;
            print_success(&format!("VM {vm_id} destroyed"));

            if let Some(name) = vm_name {
                let name = sanitize_vm_name(&name).map_err(ProvisionError::invalid)?;
                let file_name = format!("custom-{name}.sh");
                if snippet::remove(&config.snippets_dir, &file_name)? {
                    print_success(&format!("Removed snippet {file_name}"));
                } else {
                    print_info(&format!("No snippet {file_name} to remove"));
                }
            }
            Ok(())
        }
        Commands::Restrict {
            ip,
            role,
            circleci_api_key,
        } => {
            let ip = parse_ipv4(ip.trim())
                .ok_or_else(|| ProvisionError::invalid(format!("'{ip}' is not a valid IPv4 address")))?;
            let profile: RoleProfile = role.parse()?;
            let engine = TemplateEngine::new()?;
            let plan = RolePlan::build(profile, &config, &engine, circleci_api_key.as_deref())?;

            print_section(&format!("Applying role '{profile}' to {ip}"));
            let remote = SshSession::new(ip.to_string(), &config);
            plan.apply(&remote)
                .await
                .with_context(|| format!("Failed to apply role '{profile}' to {ip}"))?;
            print_success(&format!("{ip} restricted to role '{profile}'"));
            Ok(())
        }
        Commands::NginxProxy {
            bastion_ip,
            domain,
            subdomain,
            app_ip,
            app_port,
            print,
        } => {
            let site = ProxySite::new(&domain, &subdomain, &app_ip, &app_port)?;
            let engine = TemplateEngine::new()?;
            if print {
                print!("{}", site.render(&engine)?);
                return Ok(());
            }

            let bastion = parse_ipv4(bastion_ip.trim()).ok_or_else(|| {
                ProvisionError::invalid(format!("'{bastion_ip}' is not a valid IPv4 address"))
            })?;
            let remote = SshSession::new(bastion.to_string(), &config);
            site.install(&remote, &engine)
                .await
                .with_context(|| format!("Failed to install proxy site on {bastion}"))?;
            print_success(&format!("https://{} -> {}", site.fqdn, site.upstream));
            Ok(())
        }
    }
}

async fn provision(args: ProvisionArgs, no_wait: bool, config: &PlatformConfig) -> Result<()> {
    print_progress_step(1, 3, "Resolving parameters");
    let request = params::resolve(&args.into_raw()?, config)?;
    if request.name_was_sanitized() {
        print_warning(&format!(
            "VM name '{}' sanitized to '{}'",
            request.requested_name, request.vm_name
        ));
    }
    print_section("Configuration");
    println!("{request}");

    print_progress_step(2, 3, "Building VM");
    let hypervisor = QmCli::default();
    let engine = TemplateEngine::new()?;
    let provisioner = Provisioner::new(&hypervisor, config, &engine).wait_for_ssh(!no_wait);

    let outcome = match provisioner.provision(&request).await {
        Ok(outcome) => outcome,
        Err(e @ ProvisionError::ReadinessTimeout { .. }) => {
            print_warning("VM was started but is not reachable yet; it has been kept");
            return Err(e.into());
        }
        Err(e) => return Err(e).context(format!("Failed to provision {}", request.vm_name)),
    };

    print_progress_step(3, 3, "Done");
    print_success(&format!(
        "VM {} ({}) is running",
        outcome.connection.vm_name, outcome.vm_id
    ));
    if let Some(waited) = outcome.ready_after {
        print_info(&format!("SSH answered after {}s", waited.as_secs()));
    }
    print_info(&format!("Boot disk: {}", outcome.boot_volume));
    print_info(&format!("Snippet:   {}", outcome.snippet_path.display()));
    print_section("Connect");
    println!("{}", outcome.connection);
    Ok(())
}
