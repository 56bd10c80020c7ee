use std::fmt;
use std::io;
use std::process::Output;
use std::time::Duration;

/// Error from a single `docker` invocation.
///
/// Carries the captured CLI output so callers can classify common conditions
/// through [`DockerError::container_missing`] instead of string-matching
/// stderr at every call site. Teardown-style operations (stop, rm, inspect
/// of a retired container) treat a missing container as success.
#[derive(Debug)]
pub enum DockerError {
    /// The command did not finish within its allotted time.
    Timeout { command: String, limit: Duration },

    /// The command ran and exited non-zero.
    Failed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The docker binary could not be spawned (not installed, not in PATH,
    /// permission denied).
    Spawn {
        command: String,
        source: io::Error,
    },
}

impl DockerError {
    pub fn timed_out(command: impl Into<String>, limit: Duration) -> Self {
        DockerError::Timeout {
            command: command.into(),
            limit,
        }
    }

    /// Build a `Failed` error from a non-zero exit, keeping the trimmed
    /// stderr for classification and display.
    pub fn from_output(command: impl Into<String>, output: &Output) -> Self {
        DockerError::Failed {
            command: command.into(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub fn spawn(command: impl Into<String>, source: io::Error) -> Self {
        DockerError::Spawn {
            command: command.into(),
            source,
        }
    }

    /// True when the failure means the target container is already gone:
    /// the daemon reported it missing, or stopped when a stop was asked for.
    pub fn container_missing(&self) -> bool {
        let DockerError::Failed { stderr, .. } = self else {
            return false;
        };
        let stderr = stderr.to_lowercase();
        stderr.contains("no such container")
            || stderr.contains("no such object")
            || stderr.contains("is not running")
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerError::Timeout { command, limit } => {
                write!(
                    f,
                    "docker command '{}' did not finish within {}s",
                    command,
                    limit.as_secs()
                )
            }
            DockerError::Failed {
                command,
                exit_code,
                stderr,
            } => match exit_code {
                Some(code) => write!(f, "'{}' exited with code {}: {}", command, code, stderr),
                None => write!(f, "'{}' was killed by a signal: {}", command, stderr),
            },
            DockerError::Spawn { command, source } => {
                write!(f, "could not run '{}': {}", command, source)
            }
        }
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DockerError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DockerError> for crate::error::Error {
    fn from(e: DockerError) -> Self {
        crate::error::Error::Docker(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> DockerError {
        DockerError::Failed {
            command: "docker rm -f x".to_string(),
            exit_code: Some(1),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn classifies_missing_container_messages() {
        assert!(failed("Error response from daemon: No such container: foo").container_missing());
        assert!(failed("Error: No such object: foo").container_missing());
        assert!(failed("Container foo is not running").container_missing());
        assert!(!failed("permission denied").container_missing());
    }

    #[test]
    fn only_failed_exits_classify_as_missing() {
        let timeout = DockerError::timed_out("docker stop x", Duration::from_secs(10));
        assert!(!timeout.container_missing());
        let spawn = DockerError::spawn(
            "docker ps",
            io::Error::new(io::ErrorKind::NotFound, "no docker"),
        );
        assert!(!spawn.container_missing());
    }

    #[test]
    fn display_includes_command_and_detail() {
        let err = failed("boom");
        let msg = err.to_string();
        assert!(msg.contains("docker rm -f x"));
        assert!(msg.contains("boom"));

        let timeout = DockerError::timed_out("docker stop x", Duration::from_secs(10));
        assert!(timeout.to_string().contains("10s"));
    }
}
