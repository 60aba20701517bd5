//! Provisioning workflow against an in-memory hypervisor.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use pve_ops::hypervisor::{Hypervisor, StorageKind, VmOption, VmSpec};
use pve_ops::{
    params, PlatformConfig, ProvisionError, ProvisionRequest, Provisioner, RawProvisionArgs,
    Result, TemplateEngine,
};

#[derive(Default)]
struct State {
    next_id: u32,
    vms: BTreeMap<u32, BTreeMap<String, String>>,
    calls: Vec<String>,
}

struct FakeHypervisor {
    storage_kind: StorageKind,
    fail_import: bool,
    fail_resize: bool,
    fail_start: bool,
    rejected_volumes: Vec<String>,
    state: Mutex<State>,
}

impl FakeHypervisor {
    fn new(storage_kind: StorageKind) -> Self {
        Self {
            storage_kind,
            fail_import: false,
            fail_resize: false,
            fail_start: false,
            rejected_volumes: Vec::new(),
            state: Mutex::new(State {
                next_id: 105,
                ..State::default()
            }),
        }
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn option(&self, id: u32, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(&id)
            .and_then(|opts| opts.get(key).cloned())
    }

    fn exists(&self, id: u32) -> bool {
        self.state.lock().unwrap().vms.contains_key(&id)
    }

    fn failure(program: &str, args: &[&str]) -> ProvisionError {
        ProvisionError::CommandFailed {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            exit_code: Some(255),
            stderr: "simulated failure".to_string(),
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn next_vm_id(&self) -> Result<u32> {
        self.record("nextid".into());
        Ok(self.state.lock().unwrap().next_id)
    }

    async fn vm_exists(&self, id: u32) -> Result<bool> {
        Ok(self.exists(id))
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        self.record(format!("create {}", spec.id));
        let mut opts = BTreeMap::new();
        opts.insert("name".to_string(), spec.name.clone());
        opts.insert("memory".to_string(), spec.memory_mb.to_string());
        opts.insert("cores".to_string(), spec.cores.to_string());
        opts.insert("net0".to_string(), spec.net0());
        self.state.lock().unwrap().vms.insert(spec.id, opts);
        Ok(())
    }

    async fn import_disk(&self, id: u32, _image: &Path, storage: &str) -> Result<()> {
        self.record(format!("importdisk {id} {storage}"));
        if self.fail_import {
            return Err(Self::failure("qm", &["importdisk"]));
        }
        Ok(())
    }

    async fn describe_storage(&self, storage: &str) -> Result<StorageKind> {
        self.record(format!("describe {storage}"));
        Ok(self.storage_kind.clone())
    }

    async fn set_options(&self, id: u32, options: &[VmOption]) -> Result<()> {
        for opt in options {
            if self.rejected_volumes.contains(&opt.value) {
                self.record(format!("set {id} --{} {} (rejected)", opt.key, opt.value));
                return Err(Self::failure("qm", &["set"]));
            }
        }
        let mut state = self.state.lock().unwrap();
        for opt in options {
            state
                .calls
                .push(format!("set {id} --{} {}", opt.key, opt.value));
        }
        let vm = state.vms.get_mut(&id).ok_or_else(|| Self::failure("qm", &["set"]))?;
        for opt in options {
            vm.insert(opt.key.clone(), opt.value.clone());
        }
        Ok(())
    }

    async fn resize_disk(&self, id: u32, slot: &str, size_gb: u32) -> Result<()> {
        self.record(format!("resize {id} {slot} {size_gb}G"));
        if self.fail_resize {
            return Err(Self::failure("qm", &["resize"]));
        }
        Ok(())
    }

    async fn start_vm(&self, id: u32) -> Result<()> {
        self.record(format!("start {id}"));
        if self.fail_start {
            return Err(Self::failure("qm", &["start"]));
        }
        Ok(())
    }

    async fn stop_vm(&self, id: u32) -> Result<()> {
        self.record(format!("stop {id}"));
        Ok(())
    }

    async fn destroy_vm(&self, id: u32) -> Result<()> {
        self.record(format!("destroy {id}"));
        self.state.lock().unwrap().vms.remove(&id);
        Ok(())
    }
}

/// Host layout rooted in a temporary directory, with the image cached.
struct Host {
    dir: TempDir,
    config: PlatformConfig,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = PlatformConfig {
            image_cache_dir: dir.path().join("cache"),
            snippets_dir: dir.path().join("snippets"),
            lock_dir: dir.path().join("lock"),
            ssh_public_key: dir.path().join("id_rsa.pub"),
            ..PlatformConfig::default()
        };
        std::fs::create_dir_all(&config.image_cache_dir).unwrap();
        std::fs::write(config.image_path(), b"qcow2").unwrap();
        std::fs::write(&config.ssh_public_key, "ssh-rsa AAAAB3Nza ops@bastion\n").unwrap();
        Self { dir, config }
    }

    fn request(&self) -> ProvisionRequest {
        let raw = RawProvisionArgs::default().with_positionals(&[
            "test_app".to_string(),
            "192.168.3.50".to_string(),
            "admin".to_string(),
            "secret123".to_string(),
        ])
        .unwrap();
        params::resolve(&raw, &self.config).unwrap()
    }
}

#[tokio::test]
async fn test_defaults_end_to_end() {
    let host = Host::new();
    let hv = FakeHypervisor::new(StorageKind::Dir);
    let engine = TemplateEngine::new().unwrap();
    let request = host.request();

    let outcome = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&request)
        .await
        .unwrap();

    assert_eq!(outcome.vm_id, 105);
    assert_eq!(outcome.boot_volume, "proxmox_data:105/vm-105-disk-0.raw");
    assert_eq!(outcome.snippet_path, host.dir.path().join("snippets/custom-test-app.sh"));
    assert!(outcome.ready_after.is_none());

    assert_eq!(hv.option(105, "name").as_deref(), Some("test-app"));
    assert_eq!(hv.option(105, "memory").as_deref(), Some("2048"));
    assert_eq!(hv.option(105, "cores").as_deref(), Some("2"));
    assert_eq!(hv.option(105, "net0").as_deref(), Some("virtio,bridge=vmbr0"));
    assert_eq!(hv.option(105, "boot").as_deref(), Some("order=scsi0"));
    assert_eq!(hv.option(105, "ide2").as_deref(), Some("proxmox_data:cloudinit"));
    assert_eq!(hv.option(105, "citype").as_deref(), Some("nocloud"));
    assert_eq!(
        hv.option(105, "ipconfig0").as_deref(),
        Some("ip=192.168.3.50/24,gw=192.168.3.1")
    );
    assert_eq!(hv.option(105, "nameserver").as_deref(), Some("1.1.1.1 8.8.8.8"));
    assert_eq!(
        hv.option(105, "cicustom").as_deref(),
        Some("user=local:snippets/custom-test-app.sh")
    );

    let calls = hv.calls();
    assert!(calls.contains(&"resize 105 scsi0 10G".to_string()));
    let pos = |c: &str| calls.iter().position(|x| x.starts_with(c)).unwrap();
    assert!(pos("create 105") < pos("importdisk 105"));
    assert!(pos("importdisk 105") < pos("set 105 --scsi0"));
    assert!(pos("set 105 --ide2") < pos("set 105 --citype"));
    assert!(pos("set 105 --cicustom") < pos("start 105"));

    let script = std::fs::read_to_string(&outcome.snippet_path).unwrap();
    assert!(script.contains("echo root:secret123 | chpasswd"));
    assert!(script.contains("hostnamectl set-hostname test-app"));
}

#[tokio::test]
async fn test_block_storage_volume_name() {
    let host = Host::new();
    let hv = FakeHypervisor::new(StorageKind::ZfsPool);
    let engine = TemplateEngine::new().unwrap();

    let outcome = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap();
    assert_eq!(outcome.boot_volume, "proxmox_data:vm-105-disk-0");
}

#[tokio::test]
async fn test_attach_retries_alternate_volume_name() {
    let host = Host::new();
    let mut hv = FakeHypervisor::new(StorageKind::Dir);
    hv.rejected_volumes = vec!["proxmox_data:105/vm-105-disk-0.raw".to_string()];
    let engine = TemplateEngine::new().unwrap();

    let outcome = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap();
    assert_eq!(outcome.boot_volume, "proxmox_data:vm-105-disk-0");
    assert_eq!(
        hv.option(105, "scsi0").as_deref(),
        Some("proxmox_data:vm-105-disk-0")
    );
}

#[tokio::test]
async fn test_both_volume_names_rejected_tears_down() {
    let host = Host::new();
    let mut hv = FakeHypervisor::new(StorageKind::Dir);
    hv.rejected_volumes = vec![
        "proxmox_data:105/vm-105-disk-0.raw".to_string(),
        "proxmox_data:vm-105-disk-0".to_string(),
    ];
    let engine = TemplateEngine::new().unwrap();

    let err = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::CommandFailed { .. }));
    assert!(!hv.exists(105));
}

#[tokio::test]
async fn test_failed_import_tears_down() {
    let host = Host::new();
    let mut hv = FakeHypervisor::new(StorageKind::Dir);
    hv.fail_import = true;
    let engine = TemplateEngine::new().unwrap();

    let err = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::CommandFailed { .. }));
    assert!(!hv.exists(105));
    assert!(hv.calls().contains(&"destroy 105".to_string()));
    assert!(!hv.calls().iter().any(|c| c.starts_with("start")));
}

#[tokio::test]
async fn test_failed_start_purges_vm_and_snippet() {
    let host = Host::new();
    let mut hv = FakeHypervisor::new(StorageKind::Dir);
    hv.fail_start = true;
    let engine = TemplateEngine::new().unwrap();

    let err = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::CommandFailed { .. }));
    assert!(!hv.exists(105));
    let calls = hv.calls();
    let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
    assert!(pos("start 105") < pos("destroy 105"));
    assert!(!host.config.snippets_dir.join("custom-test-app.sh").exists());
}

#[tokio::test]
async fn test_resize_failure_is_not_fatal() {
    let host = Host::new();
    let mut hv = FakeHypervisor::new(StorageKind::Dir);
    hv.fail_resize = true;
    let engine = TemplateEngine::new().unwrap();

    let outcome = Provisioner::new(&hv, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&host.request())
        .await
        .unwrap();

    assert!(hv.exists(outcome.vm_id));
    assert!(hv.calls().contains(&"start 105".to_string()));
}

#[tokio::test]
async fn test_explicit_vm_id_in_use_is_rejected() {
    let host = Host::new();
    let hv = FakeHypervisor::new(StorageKind::Dir);
    let engine = TemplateEngine::new().unwrap();
    let provisioner = Provisioner::new(&hv, &host.config, &engine).wait_for_ssh(false);

    let mut request = host.request();
    request.vm_id = Some(300);
    provisioner.provision(&request).await.unwrap();

    let err = provisioner.provision(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Validation { .. }));
    assert!(hv.exists(300));
    assert!(!hv.calls().iter().any(|c| c == "nextid"));
}

#[tokio::test]
async fn test_reprovision_overwrites_snippet_identically() {
    let host = Host::new();
    let engine = TemplateEngine::new().unwrap();
    let request = host.request();

    let first = FakeHypervisor::new(StorageKind::Dir);
    let outcome = Provisioner::new(&first, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&request)
        .await
        .unwrap();
    let before = std::fs::read(&outcome.snippet_path).unwrap();

    let second = FakeHypervisor::new(StorageKind::Dir);
    Provisioner::new(&second, &host.config, &engine)
        .wait_for_ssh(false)
        .provision(&request)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&outcome.snippet_path).unwrap(), before);
}
