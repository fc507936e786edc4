//! Host confinement profile toggling around the snapshot window.
//!
//! libvirt's per-VM AppArmor profile denies qemu access to the new overlay
//! files, so the profile is put in complain mode while the snapshot exists and
//! enforced again afterwards.

use crate::config::SecurityConfig;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

#[async_trait]
pub trait SecurityProfile: Send + Sync {
    /// Stop enforcing the profile named `label`.
    async fn disable(&self, label: &str) -> Result<()>;

    /// Enforce the profile named `label` again.
    async fn enable(&self, label: &str) -> Result<()>;
}

/// Build the profile toggle selected by the configuration.
pub fn from_config(config: &SecurityConfig) -> Box<dyn SecurityProfile> {
    if config.apparmor {
        Box::new(AppArmorProfile::new(config.profile_dir.clone()))
    } else {
        Box::new(NoopProfile)
    }
}

/// `aa-complain` / `aa-enforce` on `<profile_dir>/<label>`.
pub struct AppArmorProfile {
    profile_dir: PathBuf,
}

impl AppArmorProfile {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
        }
    }

    pub fn profile_path(&self, label: &str) -> PathBuf {
        self.profile_dir.join(label)
    }

    async fn run(&self, program: &str, label: &str) -> Result<()> {
        let profile = self.profile_path(label);
        let output = Command::new(program)
            .arg(&profile)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::Security(format!("cannot run {program}: {e}")))?;

        if !output.status.success() {
            return Err(BackupError::Security(format!(
                "{} {} failed: {}",
                program,
                profile.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(profile = %profile.display(), "{} applied", program);
        Ok(())
    }
}

#[async_trait]
impl SecurityProfile for AppArmorProfile {
    async fn disable(&self, label: &str) -> Result<()> {
        self.run("aa-complain", label).await
    }

    async fn enable(&self, label: &str) -> Result<()> {
        self.run("aa-enforce", label).await
    }
}

/// Used when profile toggling is switched off.
pub struct NoopProfile;

#[async_trait]
impl SecurityProfile for NoopProfile {
    async fn disable(&self, _label: &str) -> Result<()> {
        Ok(())
    }

    async fn enable(&self, _label: &str) -> Result<()> {
        Ok(())
    }
}

/// Records toggles; `disable` can be made to fail.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingProfile {
    events: std::sync::Mutex<Vec<String>>,
    fail_disable: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_disable(&self) {
        self.fail_disable
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// `disable:<label>` / `enable:<label>` in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl SecurityProfile for RecordingProfile {
    async fn disable(&self, label: &str) -> Result<()> {
        if self.fail_disable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BackupError::Security("aa-complain not found".into()));
        }
        self.events.lock().unwrap().push(format!("disable:{label}"));
        Ok(())
    }

    async fn enable(&self, label: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("enable:{label}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_path() {
        let profile = AppArmorProfile::new("/etc/apparmor.d/libvirt");
        assert_eq!(
            profile.profile_path("libvirt-1234"),
            PathBuf::from("/etc/apparmor.d/libvirt/libvirt-1234")
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_security_error() {
        let profile = AppArmorProfile::new("/etc/apparmor.d/libvirt");
        let result = profile.run("/nonexistent/aa-complain", "libvirt-1234").await;
        assert!(matches!(result, Err(BackupError::Security(_))));
    }

    #[tokio::test]
    async fn test_failing_tool_is_security_error() {
        let profile = AppArmorProfile::new("/etc/apparmor.d/libvirt");
        let result = profile.run("false", "libvirt-1234").await;
        match result {
            Err(BackupError::Security(msg)) => assert!(msg.contains("libvirt-1234")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noop_profile() {
        assert!(NoopProfile.disable("x").await.is_ok());
        assert!(NoopProfile.enable("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_config_builds_noop() {
        let config = SecurityConfig {
            apparmor: false,
            ..Default::default()
        };
        let profile = from_config(&config);
        assert!(profile.disable("anything").await.is_ok());
    }
}
