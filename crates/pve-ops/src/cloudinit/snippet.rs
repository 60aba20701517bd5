//! Per-VM cloud-init user-data script.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use super::firewall::FirewallPolicy;
use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};
use crate::params::ProvisionRequest;
use crate::templates::{self, shell_quote, TemplateEngine};

/// Everything the cloud-init template needs.
#[derive(Debug, Serialize)]
pub struct SnippetContext {
    pub hostname: String,
    pub user: String,
    pub timezone: String,
    /// `root:<password>`, shell quoted.
    pub root_credentials: String,
    /// `<user>:<password>`, shell quoted.
    pub user_credentials: String,
    /// Public key line, shell quoted.
    pub ssh_public_key: String,
    pub dns_servers: Vec<String>,
    pub packages: Vec<String>,
    pub services: Vec<String>,
    pub nginx_default_site: String,
    pub firewall: Vec<String>,
}

#[derive(Serialize)]
struct NginxDefaultContext<'a> {
    hostname: &'a str,
}

impl SnippetContext {
    /// Build the context for a request.
    ///
    /// # Errors
    /// Fails if the SSH public key cannot be read or the Nginx site does not
    /// render.
    pub fn build(
        request: &ProvisionRequest,
        config: &PlatformConfig,
        engine: &TemplateEngine,
    ) -> Result<Self> {
        let key = std::fs::read_to_string(&request.ssh_pubkey_path)
            .map_err(|e| ProvisionError::io(&request.ssh_pubkey_path, e))?;
        let key = key.lines().find(|l| !l.trim().is_empty()).unwrap_or_default().trim();
        if key.is_empty() {
            return Err(ProvisionError::invalid(format!(
                "SSH public key {} is empty",
                request.ssh_pubkey_path.display()
            )));
        }

        let nginx_default_site = engine
            .render(
                templates::NGINX_DEFAULT,
                &NginxDefaultContext {
                    hostname: &request.vm_name,
                },
            )?
            .trim_end()
            .to_string();

        Ok(Self {
            hostname: request.vm_name.clone(),
            user: request.ci_user.clone(),
            timezone: request.timezone.clone(),
            root_credentials: shell_quote(&format!("root:{}", request.ci_password)),
            user_credentials: shell_quote(&format!(
                "{}:{}",
                request.ci_user, request.ci_password
            )),
            ssh_public_key: shell_quote(key),
            dns_servers: config.dns_servers.iter().map(ToString::to_string).collect(),
            packages: config.packages.clone(),
            services: config.services.clone(),
            nginx_default_site,
            firewall: FirewallPolicy::provisioning(config).commands(),
        })
    }
}

/// Render the cloud-init script for a request.
///
/// The output depends only on its inputs, so provisioning the same request
/// twice produces a byte-identical file.
///
/// # Errors
/// Fails if the context cannot be built or the template does not render.
pub fn render(
    request: &ProvisionRequest,
    config: &PlatformConfig,
    engine: &TemplateEngine,
) -> Result<String> {
    let context = SnippetContext::build(request, config, engine)?;
    engine.render(templates::CLOUD_INIT, &context)
}

/// Write a rendered script into the snippets directory.
///
/// The file is replaced atomically and is readable by root only, since it
/// carries the plaintext password.
///
/// # Errors
/// Fails on any filesystem error.
pub fn write(snippets_dir: &Path, file_name: &str, contents: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(snippets_dir).map_err(|e| ProvisionError::io(snippets_dir, e))?;

    let path = snippets_dir.join(file_name);
    let mut tmp = tempfile::Builder::new()
        .prefix(".pve-ops-")
        .tempfile_in(snippets_dir)
        .map_err(|e| ProvisionError::io(snippets_dir, e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| ProvisionError::io(tmp.path().to_path_buf(), e))?;
    set_mode(tmp.path(), 0o600)?;
    tmp.persist(&path)
        .map_err(|e| ProvisionError::io(&path, e.error))?;

    debug!(path = %path.display(), bytes = contents.len(), "Snippet written");
    info!(path = %path.display(), "Cloud-init snippet generated");
    Ok(path)
}

/// Delete a VM's snippet. Returns whether a file was removed.
///
/// # Errors
/// Fails on any filesystem error other than the file being absent.
pub fn remove(snippets_dir: &Path, file_name: &str) -> Result<bool> {
    let path = snippets_dir.join(file_name);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!(path = %path.display(), "Cloud-init snippet removed");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ProvisionError::io(&path, e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ProvisionError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Hypervisor reference to a snippet, e.g. `local:snippets/custom-web.sh`.
#[must_use]
pub fn volume_ref(snippet_storage: &str, file_name: &str) -> String {
    format!("{snippet_storage}:snippets/{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{resolve, RawProvisionArgs};

    fn request(dir: &Path, password: &str) -> ProvisionRequest {
        let key = dir.join("id_ed25519.pub");
        std::fs::write(&key, "ssh-ed25519 AAAAC3Nza test@laptop\n").unwrap();
        resolve(
            &RawProvisionArgs {
                vm_name: Some("test_app".into()),
                ip: Some("192.168.3.50".into()),
                user: Some("admin".into()),
                password: Some(password.into()),
                ssh_key: Some(key),
                ..RawProvisionArgs::default()
            },
            &PlatformConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_contents() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new().unwrap();
        let script = render(&request(dir.path(), "secret123"), &PlatformConfig::default(), &engine)
            .unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("hostnamectl set-hostname test-app"));
        assert!(script.contains("echo root:secret123 | chpasswd"));
        assert!(script.contains("echo admin:secret123 | chpasswd"));
        assert!(script.contains("echo 'ssh-ed25519 AAAAC3Nza test@laptop' >> /root/.ssh/authorized_keys"));
        assert!(script.contains("timedatectl set-timezone Europe/Amsterdam"));
        assert!(script.contains("DNS=1.1.1.1 8.8.8.8\n"));
        assert!(script.contains("apt-get install -y curl git"));
        assert!(script.contains("systemctl enable --now docker"));
        assert!(script.contains("server_name test-app;"));
        assert!(script.contains("ufw --force enable"));
        assert!(!script.contains("&#x"));
    }

    #[test]
    fn test_firewall_order_in_script() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new().unwrap();
        let script = render(&request(dir.path(), "pw"), &PlatformConfig::default(), &engine)
            .unwrap();

        let at = |needle: &str| script.find(needle).unwrap_or_else(|| panic!("{needle}"));
        assert!(at("ufw allow from 192.168.3.22") < at("ufw allow from 192.168.3.0/24"));
        assert!(at("ufw allow from 192.168.3.0/24") < at("ufw deny 22/tcp"));
        assert!(at("ufw deny 22/tcp") < at("ufw allow 80/tcp"));
        assert!(at("ufw allow 443/tcp") < at("ufw allow 60000:61000/udp"));
        assert!(at("ufw allow 60000:61000/udp") < at("ufw --force enable"));
    }

    #[test]
    fn test_password_is_shell_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new().unwrap();
        let script = render(
            &request(dir.path(), "it's $(reboot)"),
            &PlatformConfig::default(),
            &engine,
        )
        .unwrap();
        assert!(script.contains(r"echo 'root:it'\''s $(reboot)' | chpasswd"));
    }

    #[test]
    fn test_same_input_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new().unwrap();
        let req = request(dir.path(), "secret123");
        let config = PlatformConfig::default();

        let snippets = dir.path().join("snippets");
        let first = render(&req, &config, &engine).unwrap();
        let path = write(&snippets, &req.snippet_file_name(), &first).unwrap();
        let written_once = std::fs::read(&path).unwrap();

        let second = render(&req, &config, &engine).unwrap();
        write(&snippets, &req.snippet_file_name(), &second).unwrap();
        let written_twice = std::fs::read(&path).unwrap();

        assert_eq!(written_once, written_twice);
        assert_eq!(path, snippets.join("custom-test-app.sh"));
    }

    #[test]
    fn test_write_overwrites_and_restricts_mode() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "custom-x.sh", "old").unwrap();
        let path = write(dir.path(), "custom-x.sh", "new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".pve-ops-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "custom-x.sh", "x").unwrap();
        assert!(remove(dir.path(), "custom-x.sh").unwrap());
        assert!(!remove(dir.path(), "custom-x.sh").unwrap());
    }

    #[test]
    fn test_volume_ref() {
        assert_eq!(
            volume_ref("local", "custom-test-app.sh"),
            "local:snippets/custom-test-app.sh"
        );
    }
}
