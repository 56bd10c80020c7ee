//! Source fetching.
//!
//! Each service gets a working tree under `<data_dir>/repos/<service_id>`.
//! `clone_or_pull` converges the tree on the desired ref or pinned commit and
//! returns the commit hash actually checked out; the deployer compares that
//! hash against the persisted one to decide whether a redeploy is needed.

use crate::api::Service;
use crate::error::{Error, Result};
use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Seam over source control so the reconciler can be tested without a
/// network or a git daemon.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Ensure the service's repo exists and is at the desired ref/commit.
    /// Returns the resolved commit hash.
    async fn clone_or_pull(&self, service: &Service) -> Result<String>;

    /// Delete the service's working tree.
    async fn remove_repo(&self, service_id: &str) -> Result<()>;

    fn repo_path(&self, service_id: &str) -> PathBuf;
}

/// git2-backed fetcher with optional SSH key auth.
#[derive(Clone)]
pub struct GitFetcher {
    repos_dir: PathBuf,
    keys_dir: PathBuf,
}

impl GitFetcher {
    pub fn new(repos_dir: impl Into<PathBuf>, keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            keys_dir: keys_dir.into(),
        }
    }

    fn fetch_options(&self, git_url: &str, key_name: &str) -> FetchOptions<'static> {
        let mut callbacks = RemoteCallbacks::new();

        let key_path = self.keys_dir.join(key_name.trim());
        let use_key = !key_name.trim().is_empty() && is_ssh_url(git_url) && key_path.exists();
        if use_key {
            debug!("Using SSH key {:?} for {}", key_path, git_url);
            callbacks.credentials(move |_url, username_from_url, _allowed| {
                Cred::ssh_key(username_from_url.unwrap_or("git"), None, &key_path, None)
            });
        }

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options
    }

    /// Blocking body of `clone_or_pull`; runs on the blocking pool.
    fn sync_repo(&self, service: &Service) -> Result<String> {
        let repo_path = self.repos_dir.join(&service.id);

        let repo = if repo_path.join(".git").exists() {
            Repository::open(&repo_path)?
        } else {
            std::fs::create_dir_all(&self.repos_dir)?;
            debug!("Cloning {} into {:?}", service.git_url, repo_path);
            RepoBuilder::new()
                .fetch_options(self.fetch_options(&service.git_url, &service.git_ssh_key))
                .clone(&service.git_url, &repo_path)?
        };

        // Refresh remote refs; a fetch failure against an already-cloned repo
        // is tolerable when the desired commit is already present locally.
        if let Ok(mut remote) = repo.find_remote("origin") {
            let mut opts = self.fetch_options(&service.git_url, &service.git_ssh_key);
            if let Err(e) = remote.fetch(&[] as &[&str], Some(&mut opts), None) {
                warn!("Fetch failed for {}: {}", service.id, e);
            }
        }

        let commit = service.git_commit.trim();
        let oid = if !commit.is_empty() {
            repo.revparse_single(commit)?.peel_to_commit()?.id()
        } else {
            let git_ref = if service.git_ref.trim().is_empty() {
                "main"
            } else {
                service.git_ref.trim()
            };
            resolve_ref(&repo, git_ref)?
        };

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        let object = repo.find_object(oid, None)?;
        repo.checkout_tree(&object, Some(&mut checkout))?;
        repo.set_head_detached(oid)?;

        Ok(oid.to_string())
    }
}

/// Resolve a ref name to a commit: remote branch first, then local branch,
/// then tag.
fn resolve_ref(repo: &Repository, name: &str) -> Result<git2::Oid> {
    let candidates = [
        format!("refs/remotes/origin/{}", name),
        format!("refs/heads/{}", name),
        format!("refs/tags/{}", name),
    ];
    for candidate in &candidates {
        if let Ok(reference) = repo.find_reference(candidate) {
            let commit = reference.peel_to_commit()?;
            return Ok(commit.id());
        }
    }
    Err(Error::Git(git2::Error::from_str(&format!(
        "ref '{}' not found",
        name
    ))))
}

fn is_ssh_url(url: &str) -> bool {
    let trimmed = url.trim();
    trimmed.starts_with("git@")
        || trimmed.starts_with("ssh://")
        || trimmed.starts_with("git+ssh://")
}

#[async_trait]
impl Vcs for GitFetcher {
    async fn clone_or_pull(&self, service: &Service) -> Result<String> {
        let fetcher = self.clone();
        let service = service.clone();
        tokio::task::spawn_blocking(move || fetcher.sync_repo(&service))
            .await
            .map_err(|e| Error::Filesystem(format!("git task panicked: {}", e)))?
    }

    async fn remove_repo(&self, service_id: &str) -> Result<()> {
        let path = self.repo_path(service_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Filesystem(format!(
                "failed to remove repo {:?}: {}",
                path, e
            ))),
        }
    }

    fn repo_path(&self, service_id: &str) -> PathBuf {
        self.repos_dir.join(service_id)
    }
}
