//! Nginx reverse proxy sites on a bastion.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::params::parse_ipv4;
use crate::remote::RemoteExecutor;
use crate::templates::{self, shell_quote, TemplateEngine};

const SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
const SITES_ENABLED: &str = "/etc/nginx/sites-enabled";

static DNS_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").expect("DNS label pattern is valid")
});

/// A proxied site: `<subdomain>.<domain>` forwarded to one upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySite {
    pub fqdn: String,
    pub upstream: String,
}

impl ProxySite {
    /// Validate operator input and build the site.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Validation`] listing every invalid argument.
    pub fn new(domain: &str, subdomain: &str, app_ip: &str, app_port: &str) -> Result<Self> {
        let mut problems = Vec::new();

        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() || !domain.split('.').all(|l| DNS_LABEL_RE.is_match(l)) {
            problems.push(format!("'{domain}' is not a valid domain name"));
        }
        let subdomain = subdomain.trim().to_ascii_lowercase();
        if !DNS_LABEL_RE.is_match(&subdomain) {
            problems.push(format!("'{subdomain}' is not a valid DNS label"));
        }
        let ip: Option<Ipv4Addr> = parse_ipv4(app_ip.trim());
        if ip.is_none() {
            problems.push(format!("app IP '{app_ip}' is not a valid IPv4 address"));
        }
        let port = match app_port.trim().parse::<u16>() {
            Ok(p) if p > 0 => Some(p),
            _ => {
                problems.push(format!("app port '{app_port}' must be between 1 and 65535"));
                None
            }
        };

        match (ip, port) {
            (Some(ip), Some(port)) if problems.is_empty() => Ok(Self {
                fqdn: format!("{subdomain}.{domain}"),
                upstream: format!("http://{ip}:{port}"),
            }),
            _ => Err(ProvisionError::Validation { problems }),
        }
    }

    /// Path of the site file on the bastion.
    #[must_use]
    pub fn available_path(&self) -> String {
        format!("{SITES_AVAILABLE}/{}", self.fqdn)
    }

    /// Path of the enabling symlink on the bastion.
    #[must_use]
    pub fn enabled_path(&self) -> String {
        format!("{SITES_ENABLED}/{}", self.fqdn)
    }

    /// Render the Nginx server block.
    ///
    /// # Errors
    /// Fails if the template does not render.
    pub fn render(&self, engine: &TemplateEngine) -> Result<String> {
        engine.render(templates::NGINX_PROXY, self)
    }

    /// Install, enable and load the site on the bastion.
    ///
    /// The configuration is checked with `nginx -t` before the reload, so a
    /// broken site never replaces a working one in the running server.
    ///
    /// # Errors
    /// Fails on the first remote step that fails.
    pub async fn install(&self, remote: &dyn RemoteExecutor, engine: &TemplateEngine) -> Result<()> {
        let site = self.render(engine)?;
        let available = self.available_path();

        info!(host = remote.host(), fqdn = %self.fqdn, upstream = %self.upstream, "Installing proxy site");
        remote.upload(&site, &available, 0o644).await?;
        remote
            .run(&format!(
                "ln -sf {} {}",
                shell_quote(&available),
                shell_quote(&self.enabled_path())
            ))
            .await?;
        remote.run("nginx -t").await?;
        remote.run("systemctl reload nginx").await?;
        info!(host = remote.host(), fqdn = %self.fqdn, "Proxy site enabled");
        Ok(())
    }
}
