//! Post-provision role profiles.
//!
//! A role is turned into a [`RolePlan`], an ordered list of remote steps,
//! before anything touches the host. The plan is then executed step by step
//! and stops at the first failure.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use crate::cloudinit::FirewallPolicy;
use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};
use crate::remote::RemoteExecutor;
use crate::templates::{self, shell_quote, TemplateEngine};

/// Where the `app` role installs its Makefile.
pub const MAKEFILE_PATH: &str = "/opt/app/Makefile";

/// Where the `app` role installs the supervisor program template.
pub const SUPERVISOR_TEMPLATE_PATH: &str = "/etc/supervisor/conf.d/app.conf.template";

/// Written into the Makefile when no CircleCI API key is given.
pub const CIRCLECI_TOKEN_PLACEHOLDER: &str = "__CIRCLECI_TOKEN__";

const CIRCLECI_INSTALL: &str =
    "curl -fLSs https://raw.githubusercontent.com/CircleCI-Public/circleci-cli/main/install.sh | bash";

/// Role a running VM can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleProfile {
    /// Application host: no public web server, CI tooling installed.
    App,
    /// Bastion: reverse proxy only, no containers.
    Bastion,
}

impl FromStr for RoleProfile {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(Self::App),
            "bastion" => Ok(Self::Bastion),
            other => Err(ProvisionError::invalid(format!(
                "unknown role '{other}', expected 'app' or 'bastion'"
            ))),
        }
    }
}

impl fmt::Display for RoleProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App => write!(f, "app"),
            Self::Bastion => write!(f, "bastion"),
        }
    }
}

/// A single action on the remote host.
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteStep {
    /// Run a shell command.
    Run(String),
    /// Install a file, overwriting any existing one.
    Upload {
        contents: String,
        path: String,
        mode: u32,
    },
}

// Uploaded contents may carry an API key; only the target is shown.
impl fmt::Debug for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(command) => f.debug_tuple("Run").field(command).finish(),
            Self::Upload { path, mode, .. } => f
                .debug_struct("Upload")
                .field("path", path)
                .field("mode", &format_args!("{mode:o}"))
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(command) => write!(f, "{command}"),
            Self::Upload { path, mode, .. } => write!(f, "upload {path} (mode {mode:o})"),
        }
    }
}

#[derive(Serialize)]
struct MakefileContext<'a> {
    circleci_token: &'a str,
}

#[derive(Serialize)]
struct SupervisorContext<'a> {
    user: &'a str,
}

/// Ordered steps that apply a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePlan {
    pub profile: RoleProfile,
    pub steps: Vec<RemoteStep>,
}

impl RolePlan {
    /// Build the plan for `profile`.
    ///
    /// # Errors
    /// Fails if one of the uploaded files does not render.
    pub fn build(
        profile: RoleProfile,
        config: &PlatformConfig,
        engine: &TemplateEngine,
        circleci_api_key: Option<&str>,
    ) -> Result<Self> {
        let steps = match profile {
            RoleProfile::App => app_steps(config, engine, circleci_api_key)?,
            RoleProfile::Bastion => vec![RemoteStep::Run("systemctl disable --now docker".into())],
        };
        Ok(Self { profile, steps })
    }

    /// Execute every step in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the error of the first failing step.
    pub async fn apply(&self, remote: &dyn RemoteExecutor) -> Result<()> {
        let total = self.steps.len();
        info!(host = remote.host(), role = %self.profile, steps = total, "Applying role");

        for (i, step) in self.steps.iter().enumerate() {
            info!(host = remote.host(), "[{}/{total}] {step}", i + 1);
            match step {
                RemoteStep::Run(command) => {
                    remote.run(command).await?;
                }
                RemoteStep::Upload {
                    contents,
                    path,
                    mode,
                } => remote.upload(contents, path, *mode).await?,
            }
        }

        info!(host = remote.host(), role = %self.profile, "Role applied");
        Ok(())
    }
}

fn app_steps(
    config: &PlatformConfig,
    engine: &TemplateEngine,
    circleci_api_key: Option<&str>,
) -> Result<Vec<RemoteStep>> {
    let mut steps = vec![RemoteStep::Run("systemctl disable --now nginx".into())];

    steps.extend(
        FirewallPolicy::app_role(config)
            .commands()
            .into_iter()
            .map(RemoteStep::Run),
    );

    if !config.app_packages.is_empty() {
        let packages = config
            .app_packages
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");
        steps.push(RemoteStep::Run(format!(
            "DEBIAN_FRONTEND=noninteractive apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y {packages}"
        )));
    }

    steps.push(RemoteStep::Run(CIRCLECI_INSTALL.to_string()));

    let token = circleci_api_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .unwrap_or(CIRCLECI_TOKEN_PLACEHOLDER);
    steps.push(RemoteStep::Upload {
        contents: engine.render(
            templates::MAKEFILE,
            &MakefileContext {
                circleci_token: token,
            },
        )?,
        path: MAKEFILE_PATH.to_string(),
        mode: 0o600,
    });

    steps.push(RemoteStep::Upload {
        contents: engine.render(
            templates::SUPERVISOR,
            &SupervisorContext {
                user: &config.ssh_user,
            },
        )?,
        path: SUPERVISOR_TEMPLATE_PATH.to_string(),
        mode: 0o644,
    });

    Ok(steps)
}
