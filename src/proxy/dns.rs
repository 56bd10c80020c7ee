//! Local DNS for `.svc.internal` names via the hosts file.
//!
//! The agent owns a marker-delimited block inside the hosts file and rewrites
//! only that block, atomically (temp file + rename), on every sync. Anything
//! outside the markers is preserved byte-for-byte.

use crate::error::{Error, Result};
use std::path::PathBuf;

const MARKER_BEGIN: &str = "# BEGIN buildvigil services";
const MARKER_END: &str = "# END buildvigil services";

pub struct HostsDns {
    hosts_path: PathBuf,
}

impl Default for HostsDns {
    fn default() -> Self {
        Self::new("/etc/hosts")
    }
}

impl HostsDns {
    pub fn new(hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            hosts_path: hosts_path.into(),
        }
    }

    /// Rewrite the managed block to map each service name to loopback.
    pub fn update_services(&self, service_names: &[String]) -> Result<()> {
        let mut content = self.content_without_block()?;

        if !service_names.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(MARKER_BEGIN);
            content.push('\n');
            let mut names: Vec<&String> = service_names.iter().collect();
            names.sort();
            names.dedup();
            for name in names {
                content.push_str(&format!("127.0.0.1 {}.svc.internal\n", name));
            }
            content.push_str(MARKER_END);
            content.push('\n');
        }

        self.write_atomic(&content)
    }

    /// Remove the managed block entirely.
    pub fn cleanup(&self) -> Result<()> {
        let content = self.content_without_block()?;
        self.write_atomic(&content)
    }

    fn content_without_block(&self) -> Result<String> {
        let content = match std::fs::read_to_string(&self.hosts_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut out = String::with_capacity(content.len());
        let mut inside_block = false;
        for line in content.lines() {
            if line.trim() == MARKER_BEGIN {
                inside_block = true;
                continue;
            }
            if line.trim() == MARKER_END {
                inside_block = false;
                continue;
            }
            if !inside_block {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn write_atomic(&self, content: &str) -> Result<()> {
        let dir = self.hosts_path.parent().ok_or_else(|| {
            Error::Filesystem(format!("hosts path {:?} has no parent", self.hosts_path))
        })?;
        let tmp = dir.join(format!(
            "{}.tmp.{}",
            self.hosts_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "hosts".to_string()),
            std::process::id()
        ));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.hosts_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Filesystem(format!(
                "failed to replace {:?}: {}",
                self.hosts_path, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn hosts_in(dir: &Path) -> HostsDns {
        HostsDns::new(dir.join("hosts"))
    }

    #[test]
    fn adds_and_replaces_the_managed_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();
        let dns = hosts_in(dir.path());

        dns.update_services(&["api".to_string(), "worker".to_string()])
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        assert!(content.contains("127.0.0.1 api.svc.internal"));
        assert!(content.contains("127.0.0.1 worker.svc.internal"));

        // Second update replaces the block rather than appending.
        dns.update_services(&["api".to_string()]).unwrap();
        let content = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(content.contains("api.svc.internal"));
        assert!(!content.contains("worker.svc.internal"));
        assert_eq!(content.matches("BEGIN buildvigil").count(), 1);
    }

    #[test]
    fn cleanup_restores_the_original_file() {
        let dir = tempfile::tempdir().unwrap();
        let original = "127.0.0.1 localhost\n::1 localhost\n";
        std::fs::write(dir.path().join("hosts"), original).unwrap();
        let dns = hosts_in(dir.path());

        dns.update_services(&["api".to_string()]).unwrap();
        dns.cleanup().unwrap();
        let content = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert_eq!(content, original);
    }

    #[test]
    fn missing_hosts_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let dns = hosts_in(dir.path());
        dns.update_services(&["api".to_string()]).unwrap();
        assert!(dir.path().join("hosts").exists());
    }

    #[test]
    fn names_are_sorted_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let dns = hosts_in(dir.path());
        dns.update_services(&[
            "worker".to_string(),
            "api".to_string(),
            "api".to_string(),
        ])
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert_eq!(content.matches("api.svc.internal").count(), 1);
        let api = content.find("api.svc.internal").unwrap();
        let worker = content.find("worker.svc.internal").unwrap();
        assert!(api < worker);
    }
}
