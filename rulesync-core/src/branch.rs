//! Branch provisioning ahead of rule writes.

use tracing::{error, info};

use crate::contract::{AdapterError, GitStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Exists,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BranchError {
    #[error("could not check branch '{branch}': {source}")]
    Lookup { branch: String, source: AdapterError },
    #[error("default branch '{branch}' does not exist")]
    MissingDefault { branch: String },
    #[error("could not create branch '{branch}' from '{from}': {source}")]
    Create {
        branch: String,
        from: String,
        source: AdapterError,
    },
}

/// Makes sure `branch` exists, creating it from `default_branch` if needed.
///
/// Idempotent: an existing branch is left alone. Provider APIs reject writes
/// to a missing ref, so callers must not write before this returns `Ok`.
pub async fn ensure_branch<G>(store: &G, branch: &str, default_branch: &str) -> Result<BranchState, BranchError>
where
    G: GitStore + ?Sized,
{
    let exists = store.branch_exists(branch).await.map_err(|source| {
        error!(branch, error = %source, "[BRANCH] Existence check failed");
        BranchError::Lookup {
            branch: branch.to_string(),
            source,
        }
    })?;
    if exists {
        info!(branch, "[BRANCH] Branch already exists");
        return Ok(BranchState::Exists);
    }

    if branch == default_branch {
        error!(branch, "[BRANCH] Default branch is missing; nothing to branch from");
        return Err(BranchError::MissingDefault {
            branch: branch.to_string(),
        });
    }

    match store.create_branch(branch, default_branch).await {
        Ok(()) => {
            info!(branch, from = default_branch, "[BRANCH] Created branch");
            Ok(BranchState::Created)
        }
        Err(source) => {
            error!(branch, from = default_branch, error = %source, "[BRANCH] Branch creation failed");
            Err(BranchError::Create {
                branch: branch.to_string(),
                from: default_branch.to_string(),
                source,
            })
        }
    }
}
