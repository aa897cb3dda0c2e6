//! Reverse-proxy routing rules keyed by project identity
//!
//! Each identity owns exactly one rule block holding one nginx `server`
//! per service. Installing writes or replaces only that block, asks the
//! proxy to validate the whole configuration, and reloads only on success;
//! a rejected block is rolled back before anything reloads.

use crate::error::{DevgateError, Result};
use crate::hostnames::ProjectIdentity;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Marker on the first line of every generated block
pub const BLOCK_MARKER: &str = "# managed by devgate:";

/// One hostname routed to one local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VhostRecord {
    pub service: String,
    pub hostname: String,
    pub port: u16,
}

/// All routing rules of one project identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBlock {
    identity: ProjectIdentity,
    records: Vec<VhostRecord>,
}

impl RuleBlock {
    /// Pair every service's hostname with its concrete port
    pub fn new(
        identity: ProjectIdentity,
        hostnames: &BTreeMap<String, String>,
        ports: &BTreeMap<String, u16>,
    ) -> Result<Self> {
        let records = hostnames
            .iter()
            .map(|(service, hostname)| {
                let port = ports.get(service).copied().ok_or_else(|| {
                    DevgateError::invalid_service(service, "no port allocated for hostname")
                })?;
                Ok(VhostRecord {
                    service: service.clone(),
                    hostname: hostname.clone(),
                    port,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { identity, records })
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn records(&self) -> &[VhostRecord] {
        &self.records
    }

    /// Reject records the proxy could never accept, naming the service
    pub fn check(&self) -> Result<()> {
        for record in &self.records {
            let reason = if record.port == 0 {
                Some("upstream port 0".to_string())
            } else if !is_valid_hostname(&record.hostname) {
                Some(format!("invalid hostname '{}'", record.hostname))
            } else {
                None
            };

            if let Some(reason) = reason {
                return Err(DevgateError::ProxyValidation {
                    identity: self.identity.to_string(),
                    service: record.service.clone(),
                    output: reason,
                });
            }
        }
        Ok(())
    }

    /// Render the block as nginx configuration
    pub fn render(&self, listen_port: u16) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {}", BLOCK_MARKER, self.identity);

        for record in &self.records {
            let _ = writeln!(out);
            let _ = writeln!(out, "# service: {}", record.service);
            let _ = writeln!(out, "server {{");
            let _ = writeln!(out, "    listen {};", listen_port);
            let _ = writeln!(out, "    server_name {};", record.hostname);
            let _ = writeln!(out);
            let _ = writeln!(out, "    location / {{");
            let _ = writeln!(out, "        proxy_pass http://127.0.0.1:{};", record.port);
            let _ = writeln!(out, "        proxy_http_version 1.1;");
            let _ = writeln!(out, "        proxy_set_header Host $host;");
            let _ = writeln!(out, "        proxy_set_header Upgrade $http_upgrade;");
            let _ = writeln!(out, "        proxy_set_header Connection $http_connection;");
            let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
            let _ = writeln!(
                out,
                "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
            );
            let _ = writeln!(out, "        proxy_set_header X-Forwarded-Host $host;");
            let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
            let _ = writeln!(out, "    }}");
            let _ = writeln!(out, "}}");
        }

        out
    }

    /// Best guess at which service a proxy error refers to
    fn offending_service(&self, output: &str) -> String {
        self.records
            .iter()
            .find(|r| output.contains(&r.hostname))
            .or_else(|| {
                self.records
                    .iter()
                    .find(|r| output.contains(&format!("127.0.0.1:{}", r.port)))
            })
            .map(|r| r.service.clone())
            .unwrap_or_else(|| {
                self.records
                    .iter()
                    .map(|r| r.service.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
    }
}

fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Storage of rule blocks, replaced and removed one identity at a time
pub trait RuleStore {
    fn get(&self, identity: &ProjectIdentity) -> Result<Option<String>>;
    fn put(&mut self, identity: &ProjectIdentity, content: &str) -> Result<()>;
    /// Returns whether a block existed
    fn remove(&mut self, identity: &ProjectIdentity) -> Result<bool>;
    fn identities(&self) -> Result<Vec<String>>;
}

/// One `{identity}.conf` file per block in a directory the proxy includes
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    dir: PathBuf,
}

impl FileRuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &ProjectIdentity) -> PathBuf {
        self.dir.join(format!("{}.conf", identity))
    }
}

impl RuleStore for FileRuleStore {
    fn get(&self, identity: &ProjectIdentity) -> Result<Option<String>> {
        let path = self.path_for(identity);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DevgateError::io(path, e)),
        }
    }

    fn put(&mut self, identity: &ProjectIdentity, content: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| DevgateError::io(&self.dir, e))?;

        // Write aside and rename so the proxy never reads a half-written block
        let path = self.path_for(identity);
        let staging = self.dir.join(format!(".{}.conf.tmp", identity));
        fs::write(&staging, content).map_err(|e| DevgateError::io(&staging, e))?;
        fs::rename(&staging, &path).map_err(|e| DevgateError::io(&path, e))?;
        debug!(path = %path.display(), "Wrote rule block");
        Ok(())
    }

    fn remove(&mut self, identity: &ProjectIdentity) -> Result<bool> {
        let path = self.path_for(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DevgateError::io(path, e)),
        }
    }

    fn identities(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DevgateError::io(&self.dir, e)),
        };

        let mut identities: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    return None;
                }
                name.strip_suffix(".conf").map(String::from)
            })
            .collect();
        identities.sort();
        Ok(identities)
    }
}

/// In-process store, used when rules are consumed programmatically
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleStore {
    blocks: BTreeMap<String, String>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for MemoryRuleStore {
    fn get(&self, identity: &ProjectIdentity) -> Result<Option<String>> {
        Ok(self.blocks.get(identity.as_str()).cloned())
    }

    fn put(&mut self, identity: &ProjectIdentity, content: &str) -> Result<()> {
        self.blocks
            .insert(identity.as_str().to_string(), content.to_string());
        Ok(())
    }

    fn remove(&mut self, identity: &ProjectIdentity) -> Result<bool> {
        Ok(self.blocks.remove(identity.as_str()).is_some())
    }

    fn identities(&self) -> Result<Vec<String>> {
        Ok(self.blocks.keys().cloned().collect())
    }
}

/// Validation and reload hooks of the running proxy
#[allow(async_fn_in_trait)]
pub trait ProxyController {
    /// Check the full configuration; `Err` carries the proxy's output
    async fn validate(&self) -> std::result::Result<(), String>;
    async fn reload(&self) -> std::result::Result<(), String>;
}

/// Runs configured shell commands such as `nginx -t` and `nginx -s reload`
#[derive(Debug, Clone)]
pub struct CommandController {
    validate: Vec<String>,
    reload: Vec<String>,
}

impl CommandController {
    pub fn new(validate_command: &str, reload_command: &str) -> Result<Self> {
        let split = |field: &str, command: &str| -> Result<Vec<String>> {
            let words = shell_words::split(command)
                .map_err(|e| DevgateError::Config(format!("proxy.{}: {}", field, e)))?;
            if words.is_empty() {
                return Err(DevgateError::Config(format!("proxy.{} cannot be empty", field)));
            }
            Ok(words)
        };

        Ok(Self {
            validate: split("validate_command", validate_command)?,
            reload: split("reload_command", reload_command)?,
        })
    }

    async fn run(words: &[String]) -> std::result::Result<(), String> {
        let output = Command::new(&words[0])
            .args(&words[1..])
            .output()
            .await
            .map_err(|e| format!("failed to run '{}': {}", words.join(" "), e))?;

        if output.status.success() {
            Ok(())
        } else {
            let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(stdout.trim());
            }
            if text.is_empty() {
                text = format!("'{}' exited with {}", words.join(" "), output.status);
            }
            Err(text)
        }
    }
}

impl ProxyController for CommandController {
    async fn validate(&self) -> std::result::Result<(), String> {
        Self::run(&self.validate).await
    }

    async fn reload(&self) -> std::result::Result<(), String> {
        Self::run(&self.reload).await
    }
}

/// Installs and tears down rule blocks against a store and a proxy
#[derive(Debug)]
pub struct VhostManager<S, C> {
    store: S,
    controller: C,
    listen_port: u16,
}

impl<S: RuleStore, C: ProxyController> VhostManager<S, C> {
    pub fn new(store: S, controller: C, listen_port: u16) -> Self {
        Self {
            store,
            controller,
            listen_port,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Write or replace the identity's block, validate, then reload.
    ///
    /// Identical content is still validated and reloaded so a retry after a
    /// failed reload brings the routes live. When validation or reload fails
    /// the previous block (or its absence) is restored.
    pub async fn install(&mut self, block: &RuleBlock) -> Result<()> {
        block.check()?;

        let identity = block.identity();
        let rendered = block.render(self.listen_port);
        let previous = self.store.get(identity)?;

        self.store.put(identity, &rendered)?;

        if let Err(output) = self.controller.validate().await {
            self.restore(identity, previous.as_deref());
            return Err(DevgateError::ProxyValidation {
                identity: identity.to_string(),
                service: block.offending_service(&output),
                output,
            });
        }

        if let Err(output) = self.controller.reload().await {
            self.restore(identity, previous.as_deref());
            return Err(DevgateError::ProxyReload(output));
        }

        info!(
            identity = %identity,
            hosts = block.records().len(),
            replaced = previous.is_some(),
            unchanged = previous.as_deref() == Some(rendered.as_str()),
            "Routing rules installed"
        );
        Ok(())
    }

    /// Remove the identity's block and reload. Returns whether a block existed.
    ///
    /// A failed reload puts the block back, so the store keeps matching what
    /// the proxy serves and a retry reloads again.
    pub async fn teardown(&mut self, identity: &ProjectIdentity) -> Result<bool> {
        let Some(previous) = self.store.get(identity)? else {
            debug!(identity = %identity, "No routing rules to remove");
            return Ok(false);
        };

        self.store.remove(identity)?;
        if let Err(output) = self.controller.reload().await {
            self.restore(identity, Some(&previous));
            return Err(DevgateError::ProxyReload(output));
        }

        info!(identity = %identity, "Routing rules removed");
        Ok(true)
    }

    pub fn is_installed(&self, identity: &ProjectIdentity) -> Result<bool> {
        Ok(self.store.get(identity)?.is_some())
    }

    fn restore(&mut self, identity: &ProjectIdentity, previous: Option<&str>) {
        let restored = match previous {
            Some(content) => self.store.put(identity, content),
            None => self.store.remove(identity).map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(identity = %identity, error = %e, "Failed to restore previous routing rules");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    /// Controller that rejects validation with a canned output and can fail reloads
    struct FakeController {
        reject: RefCell<Option<String>>,
        failing_reloads: Cell<usize>,
        validations: Cell<usize>,
        reloads: Cell<usize>,
    }

    impl FakeController {
        fn accepting() -> Self {
            Self {
                reject: RefCell::new(None),
                failing_reloads: Cell::new(0),
                validations: Cell::new(0),
                reloads: Cell::new(0),
            }
        }

        fn rejecting(output: &str) -> Self {
            let controller = Self::accepting();
            *controller.reject.borrow_mut() = Some(output.to_string());
            controller
        }

        /// Fail the next `count` reloads
        fn failing_reloads(count: usize) -> Self {
            let controller = Self::accepting();
            controller.failing_reloads.set(count);
            controller
        }
    }

    impl ProxyController for FakeController {
        async fn validate(&self) -> std::result::Result<(), String> {
            self.validations.set(self.validations.get() + 1);
            match self.reject.borrow().as_ref() {
                Some(output) => Err(output.clone()),
                None => Ok(()),
            }
        }

        async fn reload(&self) -> std::result::Result<(), String> {
            let failing = self.failing_reloads.get();
            if failing > 0 {
                self.failing_reloads.set(failing - 1);
                return Err("nginx: [alert] kill(1234, 1) failed (3: No such process)".to_string());
            }
            self.reloads.set(self.reloads.get() + 1);
            Ok(())
        }
    }

    fn identity(name: &str) -> ProjectIdentity {
        ProjectIdentity::from_parts("w", name).unwrap()
    }

    fn block(name: &str, offset: u16) -> RuleBlock {
        let id = identity(name);
        let mut hostnames = BTreeMap::new();
        let mut ports = BTreeMap::new();
        for (service, base) in [("api", 8000), ("frontend", 3000)] {
            hostnames.insert(
                service.to_string(),
                format!("{}-{}.10.0.0.5.nip.io", id, service),
            );
            ports.insert(service.to_string(), base + offset);
        }
        RuleBlock::new(id, &hostnames, &ports).unwrap()
    }

    #[test]
    fn test_render_contains_forwarding_directives() {
        let rendered = block("proj-main", 22).render(80);

        assert!(rendered.starts_with("# managed by devgate: w-proj-main"));
        assert_eq!(rendered.matches("server {").count(), 2);
        assert!(rendered.contains("server_name w-proj-main-api.10.0.0.5.nip.io;"));
        assert!(rendered.contains("proxy_pass http://127.0.0.1:8022;"));
        assert!(rendered.contains("proxy_pass http://127.0.0.1:3022;"));
        assert!(rendered.contains("proxy_set_header Host $host;"));
        assert!(rendered.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(rendered.contains("proxy_set_header X-Forwarded-For"));
        assert!(rendered.contains("proxy_set_header X-Forwarded-Proto $scheme;"));
        assert!(rendered.contains("listen 80;"));
    }

    #[test]
    fn test_block_requires_port_for_every_hostname() {
        let mut hostnames = BTreeMap::new();
        hostnames.insert("api".to_string(), "x-api.10.0.0.5.nip.io".to_string());
        let err = RuleBlock::new(identity("x"), &hostnames, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("service 'api'"));
    }

    #[test]
    fn test_check_rejects_bad_hostname() {
        let mut hostnames = BTreeMap::new();
        hostnames.insert("api".to_string(), "bad host.nip.io".to_string());
        let mut ports = BTreeMap::new();
        ports.insert("api".to_string(), 8000);
        let block = RuleBlock::new(identity("x"), &hostnames, &ports).unwrap();

        match block.check().unwrap_err() {
            DevgateError::ProxyValidation { service, .. } => assert_eq!(service, "api"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_install_writes_and_reloads() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let block = block("proj-main", 22);

        manager.install(&block).await.unwrap();

        assert!(manager.is_installed(block.identity()).unwrap());
        assert_eq!(manager.controller().validations.get(), 1);
        assert_eq!(manager.controller().reloads.get(), 1);
    }

    #[tokio::test]
    async fn test_reinstall_identical_validates_and_reloads_again() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let block = block("proj-main", 22);

        manager.install(&block).await.unwrap();
        let stored = manager.store().get(block.identity()).unwrap();
        manager.install(&block).await.unwrap();

        assert_eq!(manager.store().get(block.identity()).unwrap(), stored);
        assert_eq!(manager.controller().validations.get(), 2);
        assert_eq!(manager.controller().reloads.get(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_rolls_back_and_retry_goes_live() {
        let mut manager =
            VhostManager::new(MemoryRuleStore::new(), FakeController::failing_reloads(1), 80);
        let block = block("proj-main", 22);

        let err = manager.install(&block).await.unwrap_err();
        assert!(matches!(err, DevgateError::ProxyReload(_)));
        assert!(!manager.is_installed(block.identity()).unwrap());
        assert_eq!(manager.controller().reloads.get(), 0);

        manager.install(&block).await.unwrap();
        assert!(manager.is_installed(block.identity()).unwrap());
        assert_eq!(manager.controller().reloads.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_block() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let original = block("proj-main", 22);
        manager.install(&original).await.unwrap();
        let before = manager.store().get(original.identity()).unwrap();

        manager.controller().failing_reloads.set(1);
        let err = manager.install(&block("proj-main", 40)).await.unwrap_err();

        assert!(matches!(err, DevgateError::ProxyReload(_)));
        assert_eq!(manager.store().get(original.identity()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_teardown_reload_keeps_block_for_retry() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let block = block("proj-main", 22);
        manager.install(&block).await.unwrap();

        manager.controller().failing_reloads.set(1);
        let err = manager.teardown(block.identity()).await.unwrap_err();
        assert!(matches!(err, DevgateError::ProxyReload(_)));
        assert!(manager.is_installed(block.identity()).unwrap());

        assert!(manager.teardown(block.identity()).await.unwrap());
        assert!(!manager.is_installed(block.identity()).unwrap());
        assert_eq!(manager.controller().reloads.get(), 2);
    }

    #[tokio::test]
    async fn test_failed_validation_restores_previous_block() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let original = block("proj-main", 22);
        manager.install(&original).await.unwrap();
        let before = manager.store().get(original.identity()).unwrap();

        *manager.controller().reject.borrow_mut() = Some(
            "nginx: [emerg] conflicting server name \"w-proj-main-frontend.10.0.0.5.nip.io\""
                .to_string(),
        );
        let err = manager.install(&block("proj-main", 40)).await.unwrap_err();

        match err {
            DevgateError::ProxyValidation { identity, service, .. } => {
                assert_eq!(identity, "w-proj-main");
                assert_eq!(service, "frontend");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.store().get(original.identity()).unwrap(), before);
        assert_eq!(manager.controller().reloads.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_install_leaves_no_block() {
        let mut manager =
            VhostManager::new(MemoryRuleStore::new(), FakeController::rejecting("syntax error"), 80);
        let block = block("proj-main", 22);

        let err = manager.install(&block).await.unwrap_err();

        match err {
            DevgateError::ProxyValidation { service, .. } => assert_eq!(service, "api, frontend"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.is_installed(block.identity()).unwrap());
        assert_eq!(manager.controller().reloads.get(), 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_only_own_block() {
        let mut manager = VhostManager::new(MemoryRuleStore::new(), FakeController::accepting(), 80);
        let main = block("proj-main", 22);
        let hotfix = block("proj-hotfix", 39);
        manager.install(&main).await.unwrap();
        manager.install(&hotfix).await.unwrap();

        assert!(manager.teardown(main.identity()).await.unwrap());
        assert!(!manager.teardown(main.identity()).await.unwrap());

        assert_eq!(manager.store().identities().unwrap(), vec!["w-proj-hotfix"]);
        assert_eq!(manager.controller().reloads.get(), 3);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileRuleStore::new(tmp.path().join("sites"));
        let id = identity("proj-main");

        assert_eq!(store.get(&id).unwrap(), None);
        assert!(store.identities().unwrap().is_empty());

        store.put(&id, "server {}\n").unwrap();
        assert_eq!(store.get(&id).unwrap().as_deref(), Some("server {}\n"));
        assert!(store.path_for(&id).ends_with("w-proj-main.conf"));
        assert_eq!(store.identities().unwrap(), vec!["w-proj-main"]);

        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
    }

    #[tokio::test]
    async fn test_command_controller_reports_failure_output() {
        let controller = CommandController::new("sh -c 'echo bad rule >&2; exit 1'", "true").unwrap();

        assert_eq!(controller.validate().await.unwrap_err(), "bad rule");
        assert!(controller.reload().await.is_ok());
    }

    #[test]
    fn test_command_controller_rejects_empty_command() {
        assert!(CommandController::new("", "nginx -s reload").is_err());
        assert!(CommandController::new("nginx -t", "'unterminated").is_err());
    }
}
