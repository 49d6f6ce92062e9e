//! Sandbox module - Per-job isolated environments
//!
//! This module provides:
//! - The `IsolationBackend` capability interface to the host primitive
//!   (plain processes, isolate, docker)
//! - The `Provisioner`, which bounds how many sandboxes exist at once
//! - `Sandbox`, an owned handle that is always torn down, explicitly or on drop
//!
//! The sandbox module does NOT:
//! - Classify outcomes (that's the executor's job)
//! - Know about job scheduling

pub mod capture;
pub mod docker;
pub mod isolate_box;
pub mod meta;
pub mod process;
pub mod procfs;

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, ServiceConfig};
use crate::core::{JobId, ResourceLimits};
use crate::error::ProvisionError;
use crate::languages::LanguageSpec;

pub use capture::CapturedOutput;
pub use docker::DockerBackend;
pub use isolate_box::IsolateBackend;
pub use process::ProcessBackend;

/// PATH given to sandboxed programs
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Backend-level handle of one environment
#[derive(Debug, Clone)]
pub struct Environment {
    /// Sandbox id, unique per job
    pub id: String,
    /// Host path of the sandbox filesystem root (the program's working directory)
    pub root: PathBuf,
    /// Slot number, used by backends with a fixed id space
    pub slot: u32,
    /// Toolbox image of the language
    pub image: String,
}

/// One command to run inside an environment
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a [String],
    pub stdin: Option<&'a [u8]>,
    pub limits: &'a ResourceLimits,
    /// Per-stream capture budget
    pub output_limit: usize,
    /// Time allowed for forced termination
    pub grace: Duration,
}

/// How a command stopped, before any policy is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    WallTimeout,
    CpuTimeout,
    MemoryExceeded,
    ProcessLimitExceeded,
    FileSizeExceeded,
    Cancelled,
}

impl Termination {
    pub fn from_exit_status(status: std::process::ExitStatus) -> Self {
        match status.signal() {
            Some(sig) => Self::from_signal(sig),
            None => Termination::Exited(status.code().unwrap_or(-1)),
        }
    }

    pub fn from_signal(sig: i32) -> Self {
        if sig == Signal::SIGXCPU as i32 {
            Termination::CpuTimeout
        } else if sig == Signal::SIGXFSZ as i32 {
            Termination::FileSizeExceeded
        } else {
            Termination::Signaled(sig)
        }
    }
}

/// Raw outcome of one command (no verdict interpretation)
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub termination: Termination,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Wall-clock time of the command
    pub elapsed: Duration,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
}

/// Capability interface to the host isolation primitive
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify the host can actually provide isolation
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Create an empty environment for one job
    async fn create(
        &self,
        id: &str,
        slot: u32,
        language: &LanguageSpec,
        limits: &ResourceLimits,
    ) -> Result<Environment>;

    /// Run one command inside the environment; must honour `cancel` and the
    /// wall-clock limit and return within `grace` of either
    async fn exec(
        &self,
        env: &Environment,
        request: ExecRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome>;

    /// Kill everything left in the environment and reclaim its storage.
    /// Must tolerate being called on a partially torn down environment.
    async fn destroy(&self, env: &Environment) -> Result<()>;
}

/// Returns the slot to the pool when dropped
struct SlotLease {
    slot: u32,
    slots: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.push(self.slot);
        }
    }
}

/// A provisioned environment bound to exactly one job
pub struct Sandbox {
    env: Environment,
    limits: ResourceLimits,
    alive: bool,
    backend: Arc<dyn IsolationBackend>,
    lease: Option<SlotLease>,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        &self.env.id
    }

    pub fn root(&self) -> &Path {
        &self.env.root
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Write a file into the sandbox root
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<()> {
        if !self.alive {
            anyhow::bail!("Sandbox {} already destroyed", self.env.id);
        }
        let path = self.env.root.join(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {:?}", path))
    }

    /// Run a command inside the sandbox
    pub async fn exec(&self, request: ExecRequest<'_>, cancel: &CancellationToken) -> Result<RawOutcome> {
        if !self.alive {
            anyhow::bail!("Sandbox {} already destroyed", self.env.id);
        }
        debug!("Sandbox {} exec {:?}", self.env.id, request.command);
        self.backend.exec(&self.env, request, cancel).await
    }

    /// Tear the sandbox down. Idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;

        let result = self.backend.destroy(&self.env).await;
        // The slot is only reusable once the backend is done with it
        self.lease.take();

        match &result {
            Ok(()) => debug!("Destroyed sandbox {}", self.env.id),
            Err(e) => warn!("Failed to destroy sandbox {}: {:#}", self.env.id, e),
        }
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;

        let backend = self.backend.clone();
        let env = self.env.clone();
        let lease = self.lease.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Sandbox {} dropped without destroy, tearing down in background", env.id);
                handle.spawn(async move {
                    if let Err(e) = backend.destroy(&env).await {
                        warn!("Background destroy of sandbox {} failed: {:#}", env.id, e);
                    }
                    drop(lease);
                });
            }
            Err(_) => warn!("Sandbox {} leaked: no runtime available for teardown", env.id),
        }
    }
}

/// Creates and bounds sandboxes
pub struct Provisioner {
    backend: Arc<dyn IsolationBackend>,
    capacity: Arc<Semaphore>,
    max_sandboxes: usize,
    slots: Arc<Mutex<Vec<u32>>>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn IsolationBackend>, max_sandboxes: usize) -> Self {
        Self {
            backend,
            capacity: Arc::new(Semaphore::new(max_sandboxes)),
            max_sandboxes,
            // Popped from the back, so low slots are used first
            slots: Arc::new(Mutex::new((0..max_sandboxes as u32).rev().collect())),
        }
    }

    /// Build the provisioner for the configured backend
    pub fn from_config(config: &ServiceConfig) -> Self {
        let backend: Arc<dyn IsolationBackend> = match config.backend {
            BackendKind::Process => Arc::new(
                ProcessBackend::new(&config.sandbox_root).with_shared_network(config.process_shared_network),
            ),
            BackendKind::Isolate => Arc::new(IsolateBackend::new(config.isolate_box_base)),
            BackendKind::Docker => Arc::new(DockerBackend::new(&config.sandbox_root)),
        };
        Self::new(backend, config.max_sandboxes)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }

    /// Number of sandboxes currently alive
    pub fn live_sandboxes(&self) -> usize {
        self.max_sandboxes - self.capacity.available_permits()
    }

    /// Create a sandbox for `job_id`. Fails fast when the host ceiling is reached.
    pub async fn provision(
        &self,
        job_id: JobId,
        language: &LanguageSpec,
        limits: &ResourceLimits,
    ) -> Result<Sandbox, ProvisionError> {
        let permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| ProvisionError::CapacityExhausted {
                limit: self.max_sandboxes,
            })?;

        let slot = self
            .slots
            .lock()
            .map_err(|_| ProvisionError::Setup(anyhow::anyhow!("Slot table poisoned")))?
            .pop()
            .ok_or_else(|| ProvisionError::Setup(anyhow::anyhow!("No free sandbox slot")))?;

        let lease = SlotLease {
            slot,
            slots: self.slots.clone(),
            _permit: permit,
        };

        let id = format!("cbx-{}", job_id.short());
        let env = self
            .backend
            .create(&id, slot, language, limits)
            .await
            .map_err(ProvisionError::Setup)?;

        info!(
            "Provisioned sandbox {} (backend={}, slot={}, root={:?})",
            env.id,
            self.backend.name(),
            slot,
            env.root
        );

        Ok(Sandbox {
            env,
            limits: limits.clone(),
            alive: true,
            backend: self.backend.clone(),
            lease: Some(lease),
        })
    }

    /// Destroy a sandbox. Idempotent.
    pub async fn destroy(&self, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.destroy().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backend doubles for scheduler and provisioner tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose `exec` panics, counting create/destroy calls
    #[derive(Default)]
    pub struct PanickingBackend {
        pub created: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    #[async_trait]
    impl IsolationBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn create(
            &self,
            id: &str,
            slot: u32,
            language: &LanguageSpec,
            _limits: &ResourceLimits,
        ) -> Result<Environment> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let root = std::env::temp_dir().join(id);
            tokio::fs::create_dir_all(&root).await?;
            Ok(Environment {
                id: id.to_string(),
                root,
                slot,
                image: language.image.clone(),
            })
        }

        async fn exec(
            &self,
            _env: &Environment,
            _request: ExecRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<RawOutcome> {
            panic!("backend exploded");
        }

        async fn destroy(&self, env: &Environment) -> Result<()> {
            let _ = tokio::fs::remove_dir_all(&env.root).await;
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::PanickingBackend;
    use super::*;
    use std::sync::atomic::Ordering;

    fn shell_language() -> LanguageSpec {
        LanguageSpec {
            id: "sh".into(),
            source_file: "main.sh".into(),
            compile_command: None,
            run_command: vec!["sh".into(), "main.sh".into()],
            image: "busybox".into(),
            compile_timeout: None,
            default_limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_termination_from_signal() {
        assert_eq!(Termination::from_signal(Signal::SIGXCPU as i32), Termination::CpuTimeout);
        assert_eq!(
            Termination::from_signal(Signal::SIGXFSZ as i32),
            Termination::FileSizeExceeded
        );
        assert_eq!(Termination::from_signal(8), Termination::Signaled(8));
    }

    #[tokio::test]
    async fn test_capacity_exhausted_and_released() {
        let backend = Arc::new(PanickingBackend::default());
        let provisioner = Provisioner::new(backend.clone(), 1);
        let lang = shell_language();
        let limits = ResourceLimits::default();

        let mut first = provisioner.provision(JobId::new(), &lang, &limits).await.unwrap();
        assert_eq!(provisioner.live_sandboxes(), 1);

        let err = provisioner.provision(JobId::new(), &lang, &limits).await.err().unwrap();
        assert!(matches!(err, ProvisionError::CapacityExhausted { limit: 1 }));

        provisioner.destroy(&mut first).await.unwrap();
        provisioner.destroy(&mut first).await.unwrap();
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.live_sandboxes(), 0);

        let second = provisioner.provision(JobId::new(), &lang, &limits).await.unwrap();
        assert!(second.is_alive());
        drop(second);
    }

    #[tokio::test]
    async fn test_dropped_sandbox_is_destroyed_in_background() {
        let backend = Arc::new(PanickingBackend::default());
        let provisioner = Provisioner::new(backend.clone(), 2);

        let sandbox = provisioner
            .provision(JobId::new(), &shell_language(), &ResourceLimits::default())
            .await
            .unwrap();
        drop(sandbox);

        for _ in 0..50 {
            if provisioner.live_sandboxes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.live_sandboxes(), 0);
    }
}
