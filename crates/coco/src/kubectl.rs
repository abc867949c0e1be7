//! Cluster side effects through the `kubectl` binary.
//!
//! Uploads land in the KBS pod's repository directory via `kubectl cp`;
//! converted manifests go through `kubectl apply`. Both are behind
//! traits so the pipeline can run without a cluster.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::kbs::{self, KbsRepository, KbsTransport};

/// Where the KBS pod serves resources from.
pub const KBS_REPOSITORY_DIR: &str = "/opt/confidential-containers/kbs/repository";
/// Label selector identifying the KBS pod.
pub const KBS_POD_SELECTOR: &str = "app=kbs";
/// Upper bound for one kubectl invocation.
const KUBECTL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Applies rendered manifests to the cluster.
pub trait ApplyDriver {
    fn apply(&self, file: &Path, namespace: &str) -> impl Future<Output = Result<()>>;
}

/// A located `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
}

impl Kubectl {
    /// Find `kubectl` on `PATH`.
    pub fn locate() -> Result<Self> {
        let binary = which::which("kubectl").map_err(|e| {
            Error::config_invalid(format!(
                "kubectl not found ({e}); install kubectl or pass --skip-apply"
            ))
        })?;
        Ok(Self { binary })
    }

    #[cfg(test)]
    fn at(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one kubectl invocation, returning trimmed stdout. `target`
    /// names the destination for error reporting.
    async fn run(&self, target: &str, args: &[&str]) -> Result<String> {
        self.run_with_deadline(target, args, KUBECTL_TIMEOUT).await
    }

    async fn run_with_deadline(
        &self,
        target: &str,
        args: &[&str],
        deadline: std::time::Duration,
    ) -> Result<String> {
        debug!(binary = %self.binary.display(), ?args, "running kubectl");
        // Dropping the future on timeout must also stop the child.
        let invocation = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(deadline, invocation)
            .await
            .map_err(|_| Error::UploadFailed {
                target: target.to_string(),
                reason: format!("kubectl gave no answer within {}s", deadline.as_secs()),
            })?
            .map_err(|e| Error::UploadFailed {
                target: target.to_string(),
                reason: format!("failed to run '{}': {e}", self.binary.display()),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::UploadFailed {
                target: target.to_string(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            })
        }
    }
}

impl ApplyDriver for Kubectl {
    async fn apply(&self, file: &Path, namespace: &str) -> Result<()> {
        let file_arg = file.display().to_string();
        let target = format!("cluster ('{file_arg}')");
        self.run(
            &target,
            &["apply", "-f", &file_arg, "-n", namespace],
        )
        .await?;
        info!(file = %file.display(), %namespace, "applied manifest");
        Ok(())
    }
}

/// Delivers staged KBS resources with `kubectl cp`.
#[derive(Debug)]
pub struct KubectlKbsTransport {
    kubectl: Kubectl,
    trustee_url: String,
}

impl KubectlKbsTransport {
    pub fn new(kubectl: Kubectl, trustee_url: impl Into<String>) -> Self {
        Self {
            kubectl,
            trustee_url: trustee_url.into(),
        }
    }

    async fn find_pod(&self, namespace: &str) -> Result<String> {
        let target = format!("KBS in namespace '{namespace}'");
        let name = self
            .kubectl
            .run(
                &target,
                &[
                    "get",
                    "pods",
                    "-n",
                    namespace,
                    "-l",
                    KBS_POD_SELECTOR,
                    "-o",
                    "jsonpath={.items[0].metadata.name}",
                ],
            )
            .await?;
        if name.is_empty() {
            return Err(Error::UploadFailed {
                target,
                reason: format!("no pod matching selector '{KBS_POD_SELECTOR}'"),
            });
        }
        Ok(name)
    }
}

impl KbsTransport for KubectlKbsTransport {
    async fn wait_ready(&self) -> Result<()> {
        kbs::wait_for_endpoint(&self.trustee_url).await
    }

    async fn upload(&self, namespace: &str, repository: &KbsRepository) -> Result<()> {
        if repository.is_empty() {
            return Ok(());
        }
        let pod = self.find_pod(namespace).await?;
        let staged = kbs::stage(repository).await?;
        let source = format!("{}/.", staged.path().display());
        let dest = format!("{namespace}/{pod}:{KBS_REPOSITORY_DIR}");
        let outcome = self
            .kubectl
            .run(&format!("KBS pod '{namespace}/{pod}'"), &["cp", &source, &dest])
            .await;
        // Report the copy failure over a wipe failure when both happen.
        let wipe_outcome = kbs::wipe(staged).await;
        outcome?;
        wipe_outcome?;
        info!(%pod, files = repository.files().len(), "uploaded KBS resources");
        Ok(())
    }
}

/// Stand-in driver for invocations that never apply.
#[derive(Debug, Default)]
pub struct NoApply;

impl ApplyDriver for NoApply {
    async fn apply(&self, file: &Path, _namespace: &str) -> Result<()> {
        Err(Error::UploadFailed {
            target: format!("cluster ('{}')", file.display()),
            reason: "apply is disabled for this invocation".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn no_apply_refuses_with_a_plain_reason() {
        let err = NoApply
            .apply(Path::new("out.yaml"), "default")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UploadFailed);
        assert!(err.to_string().contains("disabled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_binary_surfaces_exit_status() {
        let kubectl = Kubectl::at("/bin/false");
        let err = kubectl
            .apply(Path::new("out.yaml"), "default")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UploadFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_invocation_kills_the_child() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = dir.path().join("slow-kubectl");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho started > {m}\nsleep 2\necho finished >> {m}\n",
                m = marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let kubectl = Kubectl::at(&script);
        let err = kubectl
            .run_with_deadline(
                "cluster",
                &["version"],
                std::time::Duration::from_millis(500),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UploadFailed);
        assert!(err.to_string().contains("no answer"));

        // Past the script's sleep: a surviving child would have appended.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "started");
    }

    #[tokio::test]
    async fn missing_binary_surfaces_spawn_failure() {
        let kubectl = Kubectl::at("/nonexistent/kubectl");
        let err = kubectl
            .apply(Path::new("out.yaml"), "default")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }
}
