use super::{ContainerRuntime, DockerError, ImageInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tracing::debug;

/// Grace window passed to `docker stop -t`.
const STOP_GRACE_SECS: u32 = 10;
/// Subprocess timeout for stop operations.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Subprocess timeout for everything except builds.
const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker CLI wrapper.
///
/// All `docker` subprocess invocations are constructed here, with consistent
/// timeout handling and structured [`DockerError`] returns. Image builds run
/// without a timeout; everything else is bounded.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        DockerCli
    }

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker").args(args).output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::spawn(cmd_str, e)),
            Err(_) => Err(DockerError::timed_out(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("docker {}", args.join(" "));
            Err(DockerError::from_output(cmd_str, &output))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        image_tag: &str,
    ) -> Result<(), DockerError> {
        let context_str = context.to_string_lossy();
        let dockerfile_str = dockerfile.to_string_lossy();
        let args = [
            "build",
            "-f",
            dockerfile_str.as_ref(),
            "-t",
            image_tag,
            context_str.as_ref(),
        ];
        let cmd_str = format!("docker {}", args.join(" "));
        debug!("Building image: {}", cmd_str);

        // Builds are unbounded: cold dependency downloads routinely exceed
        // any fixed limit worth enforcing here.
        let output = tokio::process::Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| DockerError::spawn(&cmd_str, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DockerError::from_output(cmd_str, &output))
        }
    }

    async fn run_container(
        &self,
        name: &str,
        image_tag: &str,
        host_port: u16,
        container_port: u16,
        env: &HashMap<String, String>,
    ) -> Result<String, DockerError> {
        let port_binding = format!("{}:{}", host_port, container_port);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-p".into(),
            port_binding,
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(image_tag.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_success(&arg_refs, OP_TIMEOUT).await?;
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(DockerError::Failed {
                command: "docker run".to_string(),
                exit_code: None,
                stderr: "docker run returned empty container id".to_string(),
            });
        }
        Ok(container_id)
    }

    async fn stop_container(&self, name: &str) -> Result<(), DockerError> {
        if name.trim().is_empty() {
            return Ok(());
        }

        let grace = STOP_GRACE_SECS.to_string();
        // A stop timeout is not fatal: the follow-up rm -f delivers SIGKILL.
        match self.run(&["stop", "-t", &grace, name], STOP_TIMEOUT).await {
            Ok(output) if !output.status.success() => {
                let err = DockerError::from_output("docker stop", &output);
                if !err.container_missing() {
                    debug!("docker stop {} failed: {}", name, err);
                }
            }
            Err(e) => debug!("docker stop {}: {}", name, e),
            _ => {}
        }

        let output = self.run(&["rm", "-f", name], OP_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        let err = DockerError::from_output("docker rm -f", &output);
        if err.container_missing() {
            return Ok(());
        }
        Err(err)
    }

    async fn rename_container(&self, old: &str, new: &str) -> Result<(), DockerError> {
        self.run_success(&["rename", old, new], OP_TIMEOUT).await?;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<String, DockerError> {
        if name.trim().is_empty() {
            return Ok("stopped".to_string());
        }
        let output = self
            .run(
                &["inspect", "--format", "{{.State.Status}}", name],
                OP_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            let err = DockerError::from_output("docker inspect", &output);
            if err.container_missing() {
                return Ok("stopped".to_string());
            }
            return Err(err);
        }
        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if status.is_empty() {
            "unknown".to_string()
        } else {
            status
        })
    }

    async fn container_exists(&self, name: &str) -> bool {
        match self
            .run(&["inspect", "--format", "{{.Id}}", name], OP_TIMEOUT)
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn mapped_host_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, DockerError> {
        let format_arg = format!(
            "{{{{with index .NetworkSettings.Ports \"{}/tcp\"}}}}{{{{(index . 0).HostPort}}}}{{{{end}}}}",
            container_port
        );
        let output = self
            .run(&["inspect", "--format", &format_arg, name], OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let err = DockerError::from_output("docker inspect", &output);
            if err.container_missing() {
                return Ok(None);
            }
            return Err(err);
        }
        let port_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(port_str.parse::<u16>().ok())
    }

    async fn list_images(&self, tag_prefix: &str) -> Result<Vec<ImageInfo>, DockerError> {
        let output = self
            .run_success(
                &[
                    "images",
                    "--format",
                    "{{.Repository}}:{{.Tag}}|{{.ID}}|{{.CreatedAt}}",
                ],
                OP_TIMEOUT,
            )
            .await?;

        let text = String::from_utf8_lossy(&output.stdout);
        let mut images = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, '|');
            let (Some(tag), Some(id), Some(created_at)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if !tag.starts_with(tag_prefix) {
                continue;
            }
            images.push(ImageInfo {
                tag: tag.to_string(),
                id: id.to_string(),
                created_at: created_at.to_string(),
            });
        }
        Ok(images)
    }

    async fn remove_image(&self, image_id: &str) -> Result<(), DockerError> {
        self.run_success(&["rmi", "-f", image_id], OP_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn follow_logs(
        &self,
        container: &str,
    ) -> Result<Option<tokio::process::Child>, DockerError> {
        let child = tokio::process::Command::new("docker")
            .args(["logs", "--follow", "--tail", "0", container])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| DockerError::spawn(format!("docker logs -f {}", container), e))?;
        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_of_missing_container_is_stopped_or_docker_absent() {
        // With Docker present this reports "stopped"; without Docker the
        // binary itself fails. Both are acceptable here.
        let cli = DockerCli::new();
        match cli.container_status("vigil-test-does-not-exist-9271").await {
            Ok(status) => assert_eq!(status, "stopped"),
            Err(DockerError::Spawn { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn empty_container_name_is_a_noop() {
        let cli = DockerCli::new();
        assert!(cli.stop_container("").await.is_ok());
        assert_eq!(cli.container_status("").await.unwrap(), "stopped");
    }
}
