//! In-process advisory leases on the targets a run writes to.
//!
//! A run leases the Git branch and the Kibana space it resolved to, both at
//! once, and holds them for its whole duration. Any other trigger that
//! resolves to either target is rejected instead of racing the first one's
//! deletion pass, whatever project environment it was started for.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use reqwest::Url;

use crate::config::SyncEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseKey {
    /// One branch of one repository.
    Branch { repository: String, branch: String },
    /// One space of one Kibana instance.
    Space { instance: String, space: String },
}

/// `scheme://host[:port]/path` without a trailing slash or `.git`.
fn target_name(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    format!("{}/{}", url.origin().ascii_serialization(), path)
        .trim_end_matches('/')
        .to_string()
}

impl LeaseKey {
    pub fn branch(repository: &Url, branch: &str) -> Self {
        LeaseKey::Branch {
            repository: target_name(repository),
            branch: branch.to_string(),
        }
    }

    pub fn space(instance: &Url, space: &str) -> Self {
        let space = if space.is_empty() { "default" } else { space };
        LeaseKey::Space {
            instance: target_name(instance),
            space: space.to_string(),
        }
    }

    /// Every target a run against `endpoint` may write to.
    pub fn for_endpoint(endpoint: &SyncEndpoint) -> Vec<LeaseKey> {
        vec![
            LeaseKey::branch(&endpoint.git.url, &endpoint.git.branch),
            LeaseKey::space(&endpoint.elastic.url, &endpoint.elastic.space),
        ]
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::Branch { repository, branch } => write!(f, "branch {branch} of {repository}"),
            LeaseKey::Space { instance, space } => write!(f, "space {space} of {instance}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    held: Arc<Mutex<HashSet<LeaseKey>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `key`, or `None` if someone else holds it.
    pub fn try_acquire(&self, key: LeaseKey) -> Option<Lease> {
        self.try_acquire_all(vec![key]).ok().and_then(|mut leases| leases.pop())
    }

    /// Takes every lease in `keys` or none of them. On failure returns the
    /// first key that is already held.
    pub fn try_acquire_all(&self, keys: Vec<LeaseKey>) -> Result<Vec<Lease>, LeaseKey> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(busy) = keys.iter().find(|k| held.contains(*k)) {
            return Err(busy.clone());
        }
        let mut leases = Vec::with_capacity(keys.len());
        for key in keys {
            if held.insert(key.clone()) {
                leases.push(Lease {
                    key,
                    table: Arc::clone(&self.held),
                });
            }
        }
        Ok(leases)
    }

    pub fn is_held(&self, key: &LeaseKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct Lease {
    key: LeaseKey,
    table: Arc<Mutex<HashSet<LeaseKey>>>,
}

impl Lease {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Url {
        Url::parse("https://gitlab.local/secops/detections").unwrap()
    }

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let table = LeaseTable::new();
        let key = LeaseKey::branch(&repo(), "main");

        let first = table.try_acquire(key.clone()).expect("first acquire succeeds");
        assert!(table.try_acquire(key.clone()).is_none());
        assert!(table.is_held(&key));

        drop(first);
        assert!(!table.is_held(&key));
        assert!(table.try_acquire(key).is_some());
    }

    #[test]
    fn clone_urls_and_web_urls_name_the_same_repository() {
        let clone = Url::parse("https://gitlab.local/secops/detections.git").unwrap();
        let web = Url::parse("https://GITLAB.local/secops/detections/").unwrap();
        assert_eq!(LeaseKey::branch(&clone, "main"), LeaseKey::branch(&web, "main"));
        assert_ne!(LeaseKey::branch(&clone, "main"), LeaseKey::branch(&clone, "test"));
    }

    #[test]
    fn empty_space_is_the_default_space() {
        let kibana = Url::parse("https://kibana.local:5601").unwrap();
        assert_eq!(LeaseKey::space(&kibana, ""), LeaseKey::space(&kibana, "default"));
    }

    #[test]
    fn acquiring_several_keys_is_all_or_nothing() {
        let table = LeaseTable::new();
        let kibana = Url::parse("https://kibana.local").unwrap();
        let branch = LeaseKey::branch(&repo(), "main");
        let space = LeaseKey::space(&kibana, "soc");
        let _held = table.try_acquire(space.clone()).unwrap();

        let busy = table.try_acquire_all(vec![branch.clone(), space.clone()]).unwrap_err();
        assert_eq!(busy, space);
        assert!(!table.is_held(&branch));

        let other = LeaseKey::space(&kibana, "soc-test");
        let leases = table.try_acquire_all(vec![branch.clone(), other.clone()]).unwrap();
        assert_eq!(leases.len(), 2);
        drop(leases);
        assert!(!table.is_held(&branch) && !table.is_held(&other));
    }
}
