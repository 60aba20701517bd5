//! Proxmox implementation of [`Hypervisor`] on top of the `qm` and `pvesh`
//! command line tools.
//!
//! The tool is expected to run on the hypervisor host itself, as root.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{Hypervisor, StorageKind, VmOption, VmSpec};
use crate::error::{ProvisionError, Result};

/// Storage description returned by `pvesh get /storage/<id>`.
#[derive(Debug, Deserialize)]
struct StorageDescription {
    #[serde(rename = "type")]
    kind: String,
}

/// `qm`/`pvesh` backed hypervisor.
#[derive(Debug, Clone)]
pub struct QmCli {
    qm: String,
    pvesh: String,
}

impl Default for QmCli {
    fn default() -> Self {
        Self::new("qm", "pvesh")
    }
}

impl QmCli {
    /// Create a hypervisor client using the given binaries.
    #[must_use]
    pub fn new(qm: impl Into<String>, pvesh: impl Into<String>) -> Self {
        Self {
            qm: qm.into(),
            pvesh: pvesh.into(),
        }
    }

    /// Run a command and return its stdout, failing on non-zero exit.
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program, args = %args.join(" "), "Executing hypervisor command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(ProvisionError::CommandFailed {
                program: program.to_string(),
                args: redact_args(args),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn qm(&self, args: Vec<String>) -> Result<String> {
        self.run(&self.qm, &args).await
    }
}

/// Arguments for `qm create`.
#[must_use]
pub fn create_args(spec: &VmSpec) -> Vec<String> {
    vec![
        "create".into(),
        spec.id.to_string(),
        "--name".into(),
        spec.name.clone(),
        "--memory".into(),
        spec.memory_mb.to_string(),
        "--cores".into(),
        spec.cores.to_string(),
        "--net0".into(),
        spec.net0(),
        "--scsihw".into(),
        "virtio-scsi-pci".into(),
        "--serial0".into(),
        "socket".into(),
        "--vga".into(),
        "serial0".into(),
        "--agent".into(),
        "enabled=1".into(),
        "--ostype".into(),
        "l26".into(),
    ]
}

/// Arguments for `qm set`.
#[must_use]
pub fn set_args(id: u32, options: &[VmOption]) -> Vec<String> {
    let mut args = vec!["set".to_string(), id.to_string()];
    for opt in options {
        args.push(format!("--{}", opt.key));
        args.push(opt.value.clone());
    }
    args
}

/// Replace secret option values before they reach an error message.
fn redact_args(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            redacted.push("********".to_string());
        } else {
            redacted.push(arg.clone());
        }
        hide_next = arg == "--cipassword";
    }
    redacted
}

/// Parse the output of `pvesh get /cluster/nextid`.
fn parse_next_id(stdout: &str) -> Result<u32> {
    let trimmed = stdout.trim().trim_matches('"');
    trimmed
        .parse()
        .map_err(|_| ProvisionError::NoVmId(format!("unexpected nextid output '{trimmed}'")))
}

#[async_trait]
impl Hypervisor for QmCli {
    async fn next_vm_id(&self) -> Result<u32> {
        let stdout = self
            .run(
                &self.pvesh,
                &[
                    "get".into(),
                    "/cluster/nextid".into(),
                    "--output-format".into(),
                    "json".into(),
                ],
            )
            .await
            .map_err(|e| ProvisionError::NoVmId(e.to_string()))?;
        let id = parse_next_id(&stdout)?;
        debug!(vm_id = id, "Cluster returned next free VM id");
        Ok(id)
    }

    async fn vm_exists(&self, id: u32) -> Result<bool> {
        match self.qm(vec!["status".into(), id.to_string()]).await {
            Ok(_) => Ok(true),
            Err(ProvisionError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        info!(vm_id = spec.id, name = %spec.name, "Creating VM");
        self.qm(create_args(spec)).await?;
        Ok(())
    }

    async fn import_disk(&self, id: u32, image: &Path, storage: &str) -> Result<()> {
        info!(vm_id = id, image = %image.display(), storage, "Importing disk image");
        let stdout = self
            .qm(vec![
                "importdisk".into(),
                id.to_string(),
                image.display().to_string(),
                storage.to_string(),
            ])
            .await?;
        debug!(vm_id = id, output = %stdout.trim(), "Disk import finished");
        Ok(())
    }

    async fn describe_storage(&self, storage: &str) -> Result<StorageKind> {
        let stdout = self
            .run(
                &self.pvesh,
                &[
                    "get".into(),
                    format!("/storage/{storage}"),
                    "--output-format".into(),
                    "json".into(),
                ],
            )
            .await?;
        let description: StorageDescription = serde_json::from_str(&stdout)?;
        Ok(StorageKind::from_type(&description.kind))
    }

    async fn set_options(&self, id: u32, options: &[VmOption]) -> Result<()> {
        self.qm(set_args(id, options)).await?;
        Ok(())
    }

    async fn resize_disk(&self, id: u32, slot: &str, size_gb: u32) -> Result<()> {
        info!(vm_id = id, slot, size_gb, "Resizing disk");
        self.qm(vec![
            "resize".into(),
            id.to_string(),
            slot.to_string(),
            format!("{size_gb}G"),
        ])
        .await?;
        Ok(())
    }

    async fn start_vm(&self, id: u32) -> Result<()> {
        info!(vm_id = id, "Starting VM");
        self.qm(vec!["start".into(), id.to_string()]).await?;
        Ok(())
    }

    async fn stop_vm(&self, id: u32) -> Result<()> {
        info!(vm_id = id, "Stopping VM");
        self.qm(vec!["stop".into(), id.to_string()]).await?;
        Ok(())
    }

    async fn destroy_vm(&self, id: u32) -> Result<()> {
        info!(vm_id = id, "Destroying VM");
        self.qm(vec!["destroy".into(), id.to_string(), "--purge".into()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let spec = VmSpec {
            id: 120,
            name: "test-app".into(),
            memory_mb: 2048,
            cores: 2,
            bridge: "vmbr0".into(),
            nic_model: "virtio".into(),
        };
        let args = create_args(&spec);
        assert_eq!(args[..2], ["create".to_string(), "120".to_string()]);
        let joined = args.join(" ");
        assert!(joined.contains("--name test-app"));
        assert!(joined.contains("--memory 2048"));
        assert!(joined.contains("--cores 2"));
        assert!(joined.contains("--net0 virtio,bridge=vmbr0"));
    }

    #[test]
    fn test_set_args_keep_values_whole() {
        let args = set_args(
            7,
            &[
                VmOption::new("nameserver", "1.1.1.1 8.8.8.8"),
                VmOption::new("boot", "order=scsi0"),
            ],
        );
        assert_eq!(
            args,
            vec!["set", "7", "--nameserver", "1.1.1.1 8.8.8.8", "--boot", "order=scsi0"]
        );
    }

    #[test]
    fn test_redact_password() {
        let args = set_args(
            7,
            &[
                VmOption::new("ciuser", "admin"),
                VmOption::new("cipassword", "secret123"),
            ],
        );
        let redacted = redact_args(&args);
        assert!(!redacted.contains(&"secret123".to_string()));
        assert!(redacted.contains(&"admin".to_string()));
    }

    #[test]
    fn test_parse_next_id() {
        assert_eq!(parse_next_id("\"105\"\n").unwrap(), 105);
        assert_eq!(parse_next_id("230").unwrap(), 230);
        assert!(matches!(
            parse_next_id("error"),
            Err(ProvisionError::NoVmId(_))
        ));
    }

    #[test]
    fn test_storage_description_parse() {
        let json = r#"{"storage":"local-zfs","type":"zfspool","pool":"rpool/data","content":"images,rootdir"}"#;
        let desc: StorageDescription = serde_json::from_str(json).unwrap();
        assert_eq!(StorageKind::from_type(&desc.kind), StorageKind::ZfsPool);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cli = QmCli::new("/nonexistent/qm", "/nonexistent/pvesh");
        let err = cli.start_vm(100).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failed() {
        // `false` ignores its arguments and exits 1.
        let cli = QmCli::new("false", "false");
        let err = cli.start_vm(100).await.unwrap_err();
        match err {
            ProvisionError::CommandFailed {
                program, exit_code, ..
            } => {
                assert_eq!(program, "false");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!cli.vm_exists(100).await.unwrap());
    }
}
