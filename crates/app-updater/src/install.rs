//! Platform-specific install handoff.
//!
//! A strategy turns a verified artifact into an [`InstallHandoff`]: a
//! description of the process to run when the host quits. Running it is
//! left to a [`HandoffExecutor`] so the decision can be tested without
//! spawning installers.
//!
//! Callers must not assume every strategy reports downloaded files: the
//! macOS bundle strategy returns an empty list because the bundle swap
//! happens entirely at quit time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::download::VerifiedArtifact;
use crate::error::InstallError;
use crate::feed::ArtifactKind;
use crate::platform::{HostPlatform, Platform};

/// What a handoff does to the installed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallAction {
    /// Run a full installer executable
    RunInstaller,
    /// Apply a differential patch with the application's patcher
    ApplyPatch,
    /// Swap the application bundle at quit time
    ReplaceBundle,
    /// Unpack an archive over the install directory
    UnpackArchive,
}

impl InstallAction {
    /// Whether the executor waits for the process to exit.
    ///
    /// Installers outlive the host process; unpacking is done in place.
    pub fn waits_for_exit(&self) -> bool {
        matches!(self, Self::ReplaceBundle | Self::UnpackArchive)
    }
}

/// A prepared, not yet executed, install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallHandoff {
    pub action: InstallAction,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub requires_elevation: bool,
    /// The verified artifact the handoff consumes.
    pub artifact: PathBuf,
}

/// The three install strategy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyVariant {
    WindowsInstaller,
    MacBundle,
    GenericArchive,
}

impl fmt::Display for StrategyVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WindowsInstaller => "windows-installer",
            Self::MacBundle => "mac-bundle",
            Self::GenericArchive => "generic-archive",
        })
    }
}

/// Platform install capability, selected once per host.
#[async_trait]
pub trait PlatformInstallStrategy: Send + Sync {
    fn variant(&self) -> StrategyVariant;

    /// Files a completed download hands to the host.
    ///
    /// May be empty; see the module docs.
    fn downloaded_files(&self, artifact: &VerifiedArtifact) -> Vec<PathBuf>;

    /// Describe how to install `artifact`.
    async fn prepare_install(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<InstallHandoff, InstallError>;
}

/// Runs prepared handoffs.
#[async_trait]
pub trait HandoffExecutor: Send + Sync {
    async fn execute(&self, handoff: &InstallHandoff) -> Result<(), InstallError>;
}

/// Install options shared by the strategies.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Suppress installer UI (Windows `/S`)
    pub silent: bool,
    /// Run the handoff with elevated privileges
    pub elevate: bool,
    /// Target directory for bundles and archives
    pub install_dir: Option<PathBuf>,
}

/// Pick the strategy for `host`.
pub fn strategy_for(host: &HostPlatform, options: &InstallOptions) -> Box<dyn PlatformInstallStrategy> {
    let install_dir = options.install_dir.clone().unwrap_or_else(default_install_dir);
    debug!(host = %host, install_dir = %install_dir.display(), "Selecting install strategy");

    match host.platform {
        Platform::Win => Box::new(
            WindowsInstallerStrategy::new()
                .with_silent(options.silent)
                .with_elevate(options.elevate),
        ),
        Platform::Mac => Box::new(MacBundleStrategy::new(install_dir)),
        Platform::LinuxGeneric => {
            Box::new(GenericArchiveStrategy::new(install_dir).with_elevate(options.elevate))
        }
    }
}

/// Directory of the running executable, or the working directory.
fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn ensure_present(artifact: &VerifiedArtifact) -> Result<(), InstallError> {
    match tokio::fs::metadata(&artifact.path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(InstallError::ArtifactMissing(artifact.path.clone())),
    }
}

fn unsupported(variant: StrategyVariant, kind: ArtifactKind) -> InstallError {
    InstallError::UnsupportedArtifact {
        strategy: variant.to_string(),
        kind: kind.to_string(),
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Installer-executable strategy for Windows.
///
/// Full installers are launched directly. Differential patches are applied
/// by the application executable itself.
#[derive(Debug, Clone)]
pub struct WindowsInstallerStrategy {
    silent: bool,
    elevate: bool,
    /// Program that applies differential patches.
    patcher: Option<PathBuf>,
}

impl WindowsInstallerStrategy {
    pub fn new() -> Self {
        Self {
            silent: false,
            elevate: false,
            patcher: std::env::current_exe().ok(),
        }
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_elevate(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn with_patcher(mut self, patcher: PathBuf) -> Self {
        self.patcher = Some(patcher);
        self
    }

    fn installer_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.silent {
            args.push("/S".to_string());
        }
        args.push("--force-run".to_string());
        args.push("--updated".to_string());
        args
    }
}

impl Default for WindowsInstallerStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformInstallStrategy for WindowsInstallerStrategy {
    fn variant(&self) -> StrategyVariant {
        StrategyVariant::WindowsInstaller
    }

    fn downloaded_files(&self, artifact: &VerifiedArtifact) -> Vec<PathBuf> {
        vec![artifact.path.clone()]
    }

    async fn prepare_install(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<InstallHandoff, InstallError> {
        ensure_present(artifact).await?;

        let handoff = match artifact.descriptor.kind {
            ArtifactKind::Installer => InstallHandoff {
                action: InstallAction::RunInstaller,
                program: artifact.path.clone(),
                args: self.installer_args(),
                requires_elevation: self.elevate,
                artifact: artifact.path.clone(),
            },
            ArtifactKind::Differential => {
                let patcher = self
                    .patcher
                    .clone()
                    .ok_or_else(|| unsupported(self.variant(), ArtifactKind::Differential))?;
                let args = vec![
                    "--apply-patch".to_string(),
                    artifact.path.display().to_string(),
                    "--updated".to_string(),
                ];
                InstallHandoff {
                    action: InstallAction::ApplyPatch,
                    program: patcher,
                    args,
                    requires_elevation: self.elevate,
                    artifact: artifact.path.clone(),
                }
            }
            other => return Err(unsupported(self.variant(), other)),
        };

        info!(
            action = ?handoff.action,
            silent = self.silent,
            elevate = self.elevate,
            "Prepared Windows install handoff"
        );
        Ok(handoff)
    }
}

// ============================================================================
// macOS
// ============================================================================

/// Bundle-replacement strategy for macOS.
#[derive(Debug, Clone)]
pub struct MacBundleStrategy {
    /// Directory holding the `.app` bundle
    install_dir: PathBuf,
}

impl MacBundleStrategy {
    pub fn new(install_dir: PathBuf) -> Self {
        Self { install_dir }
    }
}

#[async_trait]
impl PlatformInstallStrategy for MacBundleStrategy {
    fn variant(&self) -> StrategyVariant {
        StrategyVariant::MacBundle
    }

    fn downloaded_files(&self, _artifact: &VerifiedArtifact) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn prepare_install(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<InstallHandoff, InstallError> {
        ensure_present(artifact).await?;

        match artifact.descriptor.kind {
            ArtifactKind::Bundle | ArtifactKind::Archive => {}
            other => return Err(unsupported(self.variant(), other)),
        }

        info!(bundle_dir = %self.install_dir.display(), "Bundle replacement scheduled for quit");
        Ok(InstallHandoff {
            action: InstallAction::ReplaceBundle,
            program: PathBuf::from("/usr/bin/ditto"),
            args: vec![
                "-x".to_string(),
                "-k".to_string(),
                artifact.path.display().to_string(),
                self.install_dir.display().to_string(),
            ],
            requires_elevation: false,
            artifact: artifact.path.clone(),
        })
    }
}

// ============================================================================
// Generic archive
// ============================================================================

/// Archive-unpacking strategy for other hosts.
#[derive(Debug, Clone)]
pub struct GenericArchiveStrategy {
    install_dir: PathBuf,
    elevate: bool,
}

impl GenericArchiveStrategy {
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            install_dir,
            elevate: false,
        }
    }

    pub fn with_elevate(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }
}

#[async_trait]
impl PlatformInstallStrategy for GenericArchiveStrategy {
    fn variant(&self) -> StrategyVariant {
        StrategyVariant::GenericArchive
    }

    fn downloaded_files(&self, artifact: &VerifiedArtifact) -> Vec<PathBuf> {
        vec![artifact.path.clone()]
    }

    async fn prepare_install(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<InstallHandoff, InstallError> {
        ensure_present(artifact).await?;

        if artifact.descriptor.kind != ArtifactKind::Archive {
            return Err(unsupported(self.variant(), artifact.descriptor.kind));
        }

        let archive = artifact.path.display().to_string();
        let target = self.install_dir.display().to_string();
        let is_zip = artifact
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);

        let (program, args) = if is_zip {
            ("unzip", vec!["-o".to_string(), archive, "-d".to_string(), target])
        } else {
            ("tar", vec!["-xf".to_string(), archive, "-C".to_string(), target])
        };

        Ok(InstallHandoff {
            action: InstallAction::UnpackArchive,
            program: PathBuf::from(program),
            args,
            requires_elevation: self.elevate,
            artifact: artifact.path.clone(),
        })
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Executes handoffs as OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn command(handoff: &InstallHandoff) -> Command {
        if !handoff.requires_elevation {
            let mut cmd = Command::new(&handoff.program);
            cmd.args(&handoff.args);
            return cmd;
        }

        if cfg!(target_os = "windows") {
            let mut cmd = Command::new("powershell");
            cmd.args(["-NoProfile", "-Command", "Start-Process", "-Verb", "RunAs", "-FilePath"])
                .arg(&handoff.program);
            if !handoff.args.is_empty() {
                cmd.arg("-ArgumentList").arg(handoff.args.join(" "));
            }
            cmd
        } else {
            let mut cmd = Command::new("pkexec");
            cmd.arg(&handoff.program).args(&handoff.args);
            cmd
        }
    }
}

#[async_trait]
impl HandoffExecutor for ProcessExecutor {
    async fn execute(&self, handoff: &InstallHandoff) -> Result<(), InstallError> {
        let launch_failed = |message: String| InstallError::LaunchFailed {
            program: handoff.program.clone(),
            message,
        };

        let mut cmd = Self::command(handoff);
        cmd.stdin(Stdio::null());

        info!(
            program = %handoff.program.display(),
            action = ?handoff.action,
            elevated = handoff.requires_elevation,
            "Launching install handoff"
        );

        if handoff.action.waits_for_exit() {
            let output = cmd.output().await.map_err(|e| launch_failed(e.to_string()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(status = %output.status, stderr = %stderr, "Install handoff failed");
                return Err(launch_failed(format!("exited with {}: {}", output.status, stderr.trim())));
            }
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            let child = cmd.spawn().map_err(|e| launch_failed(e.to_string()))?;
            debug!(pid = ?child.id(), "Installer detached");
        }
        Ok(())
    }
}
