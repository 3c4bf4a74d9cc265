//! Reconciliation: bring one system's rule set in line with the other's.
//!
//! Each leg takes a fresh snapshot of its source, a fresh snapshot of its
//! target, then runs two passes:
//!   - **upsert**: every stable id in the source is written to the target
//!     (create or update, skipped when the rendered content is identical and
//!     `skip_unchanged` is on)
//!   - **deletion**: every stable id in the target that is absent from the
//!     source is removed
//!
//! Deletion is a set difference on stable ids and nothing else. An entry that
//! was listed in the source but could not be read or parsed still counts as
//! present, so a corrupt file never causes the matching rule to be deleted.
//!
//! Per-rule failures are counted in the [`LegSummary`] and the pass carries
//! on. Only a failure to take a snapshot (or to provision the export branch)
//! aborts a leg, and even then the other leg of a bidirectional run still
//! runs.
//!
//! # Navigation
//! - Entrypoint: [`reconcile`]
//! - Legs: [`export_leg`] (Kibana → Git), [`import_leg`] (Git → Kibana)

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::branch::ensure_branch;
use crate::config::GitEndpoint;
use crate::contract::{AdapterError, FileWrite, GitFile, GitStore, RuleSource, WriteOutcome};
use crate::model::Direction;
use crate::rule::{self, content_digest, IdField, RuleRecord};

pub const AUTO_SYNC_PREFIX: &str = "[Auto-Sync] ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Export,
    Import,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    List,
    Branch,
    Read,
    Parse,
    Duplicate,
    Write,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleError {
    pub stable_id: Option<String>,
    pub action: RuleAction,
    pub message: String,
}

/// Outcome of one leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegSummary {
    pub leg: Leg,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub errors: Vec<RuleError>,
    /// Why the leg stopped before its passes, if it did.
    pub aborted: Option<String>,
}

impl LegSummary {
    pub fn new(leg: Leg) -> Self {
        LegSummary {
            leg,
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            errors: Vec::new(),
            aborted: None,
        }
    }

    /// Rules written to the target (created + updated).
    pub fn written(&self) -> usize {
        self.created + self.updated
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn record(&mut self, stable_id: Option<&str>, action: RuleAction, message: impl Into<String>) {
        let message = message.into();
        warn!(leg = ?self.leg, stable_id = ?stable_id, ?action, %message, "[SYNC] Rule error");
        self.errors.push(RuleError {
            stable_id: stable_id.map(str::to_string),
            action,
            message,
        });
    }

    fn abort(mut self, action: RuleAction, message: impl Into<String>) -> Self {
        let message = message.into();
        error!(leg = ?self.leg, ?action, %message, "[SYNC][ERROR] Leg aborted");
        self.errors.push(RuleError {
            stable_id: None,
            action,
            message: message.clone(),
        });
        self.aborted = Some(message);
        self
    }
}

/// Merged outcome of every leg a run executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncSummary {
    pub export: Option<LegSummary>,
    pub import: Option<LegSummary>,
}

impl SyncSummary {
    fn legs(&self) -> impl Iterator<Item = &LegSummary> {
        self.export.iter().chain(self.import.iter())
    }

    /// Rules written to Git.
    pub fn exported(&self) -> usize {
        self.export.as_ref().map_or(0, LegSummary::written)
    }

    /// Rules written to Kibana.
    pub fn imported(&self) -> usize {
        self.import.as_ref().map_or(0, LegSummary::written)
    }

    pub fn created(&self) -> usize {
        self.legs().map(|l| l.created).sum()
    }

    pub fn updated(&self) -> usize {
        self.legs().map(|l| l.updated).sum()
    }

    pub fn unchanged(&self) -> usize {
        self.legs().map(|l| l.unchanged).sum()
    }

    pub fn deleted(&self) -> usize {
        self.legs().map(|l| l.deleted).sum()
    }

    pub fn error_count(&self) -> usize {
        self.legs().map(LegSummary::error_count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub page_size: usize,
    pub skip_unchanged: bool,
    /// Prefix commit messages with [`AUTO_SYNC_PREFIX`].
    pub auto_sync: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            page_size: 10_000,
            skip_unchanged: true,
            auto_sync: false,
        }
    }
}

impl ReconcileOptions {
    pub fn commit_message(&self, verb: &str, subject: &str) -> String {
        let prefix = if self.auto_sync { AUTO_SYNC_PREFIX } else { "" };
        format!("{prefix}{verb} rule: {subject}")
    }
}

/// Runs the legs implied by `direction`: export first, then import.
pub async fn reconcile<R, G>(
    direction: Direction,
    rules: &R,
    git: &G,
    endpoint: &GitEndpoint,
    options: &ReconcileOptions,
) -> SyncSummary
where
    R: RuleSource + ?Sized,
    G: GitStore + ?Sized,
{
    let mut summary = SyncSummary::default();
    if direction.runs_export() {
        summary.export = Some(export_leg(rules, git, endpoint, options).await);
    }
    if direction.runs_import() {
        summary.import = Some(import_leg(git, rules, endpoint, options).await);
    }
    info!(
        %direction,
        created = summary.created(),
        updated = summary.updated(),
        unchanged = summary.unchanged(),
        deleted = summary.deleted(),
        errors = summary.error_count(),
        "[SYNC] Reconciliation finished"
    );
    summary
}

/// Kibana → Git.
pub async fn export_leg<R, G>(rules: &R, git: &G, endpoint: &GitEndpoint, options: &ReconcileOptions) -> LegSummary
where
    R: RuleSource + ?Sized,
    G: GitStore + ?Sized,
{
    let mut summary = LegSummary::new(Leg::Export);
    let branch = endpoint.branch.as_str();
    info!(branch, base_path = %endpoint.base_path, "[EXPORT] Starting export leg");

    let raw = match rules.list_rules(options.page_size).await {
        Ok(raw) => raw,
        Err(e) => return summary.abort(RuleAction::List, format!("could not list Kibana rules: {e}")),
    };
    let mut source: BTreeMap<String, RuleRecord> = BTreeMap::new();
    for value in raw {
        match RuleRecord::from_value(value) {
            Ok(rule) => {
                let id = rule.stable_id.clone();
                if source.insert(id.clone(), rule).is_some() {
                    summary.record(Some(id.as_str()), RuleAction::Duplicate, "stable id appears more than once; later entry wins");
                }
            }
            Err(e) => summary.record(None, RuleAction::Parse, e.to_string()),
        }
    }
    info!(rules = source.len(), "[EXPORT] Source snapshot taken");

    if let Err(e) = ensure_branch(git, branch, &endpoint.default_branch).await {
        return summary.abort(RuleAction::Branch, e.to_string());
    }

    let target: BTreeMap<String, GitFile> = match git.list_directory(branch, &endpoint.base_path).await {
        Ok(files) => files.into_iter().map(|f| (f.stable_id.clone(), f)).collect(),
        Err(e) => return summary.abort(RuleAction::List, format!("could not list rule files: {e}")),
    };
    info!(files = target.len(), "[EXPORT] Target snapshot taken");

    for (id, rule) in &source {
        let content = rule.render_file();
        let existing = target.get(id);

        if let (Some(file), true) = (existing, options.skip_unchanged) {
            match git.read_file(branch, &file.path).await {
                Ok(current) if same_file_content(id, &current, &content) => {
                    debug!(stable_id = %id, "[EXPORT] Unchanged, skipping write");
                    summary.unchanged += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(stable_id = %id, error = %e, "[EXPORT] Could not read current file; writing anyway"),
            }
        }

        let verb = if existing.is_some() { "Update" } else { "Add" };
        let write = FileWrite {
            branch: branch.to_string(),
            path: existing
                .map(|f| f.path.clone())
                .unwrap_or_else(|| rule::path_for(&endpoint.base_path, id)),
            content,
            message: options.commit_message(verb, &rule.display_name),
            existing_version: existing.and_then(|f| f.version.clone()),
            exists: existing.is_some(),
        };
        match git.write_file(write).await {
            Ok(WriteOutcome::Created) => {
                info!(stable_id = %id, "[EXPORT] Created rule file");
                summary.created += 1;
            }
            Ok(WriteOutcome::Updated) => {
                info!(stable_id = %id, "[EXPORT] Updated rule file");
                summary.updated += 1;
            }
            Err(e) => summary.record(Some(id.as_str()), RuleAction::Write, e.to_string()),
        }
    }

    for (id, file) in target.iter().filter(|(id, _)| !source.contains_key(*id)) {
        let message = options.commit_message("Delete", id);
        match git.delete_file(branch, file, &message).await {
            Ok(()) | Err(AdapterError::NotFound) => {
                info!(stable_id = %id, path = %file.path, "[EXPORT] Deleted rule file");
                summary.deleted += 1;
            }
            Err(e) => summary.record(Some(id.as_str()), RuleAction::Delete, e.to_string()),
        }
    }

    info!(
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        deleted = summary.deleted,
        errors = summary.error_count(),
        "[EXPORT] Export leg finished"
    );
    summary
}

/// Git → Kibana.
pub async fn import_leg<G, R>(git: &G, rules: &R, endpoint: &GitEndpoint, options: &ReconcileOptions) -> LegSummary
where
    G: GitStore + ?Sized,
    R: RuleSource + ?Sized,
{
    let mut summary = LegSummary::new(Leg::Import);
    let branch = endpoint.branch.as_str();
    info!(branch, base_path = %endpoint.base_path, "[IMPORT] Starting import leg");

    // A missing branch lists as an empty directory, which would delete every rule.
    match git.branch_exists(branch).await {
        Ok(true) => {}
        Ok(false) => return summary.abort(RuleAction::Branch, format!("branch '{branch}' does not exist")),
        Err(e) => return summary.abort(RuleAction::Branch, format!("could not check branch '{branch}': {e}")),
    }

    let listing = match git.list_directory(branch, &endpoint.base_path).await {
        Ok(files) => files,
        Err(e) => return summary.abort(RuleAction::List, format!("could not list rule files: {e}")),
    };
    let present: BTreeSet<String> = listing.iter().map(|f| f.stable_id.clone()).collect();
    let mut source: BTreeMap<String, RuleRecord> = BTreeMap::new();
    for file in &listing {
        let content = match git.read_file(branch, &file.path).await {
            Ok(content) => content,
            Err(e) => {
                summary.record(Some(file.stable_id.as_str()), RuleAction::Read, e.to_string());
                continue;
            }
        };
        match RuleRecord::from_file(&file.stable_id, &content) {
            Ok(rule) => {
                source.insert(file.stable_id.clone(), rule);
            }
            Err(e) => summary.record(Some(file.stable_id.as_str()), RuleAction::Parse, e.to_string()),
        }
    }
    info!(files = listing.len(), parsed = source.len(), "[IMPORT] Source snapshot taken");

    let raw = match rules.list_rules(options.page_size).await {
        Ok(raw) => raw,
        Err(e) => return summary.abort(RuleAction::List, format!("could not list Kibana rules: {e}")),
    };
    let mut target: BTreeMap<String, RuleRecord> = BTreeMap::new();
    for value in raw {
        match RuleRecord::from_value(value) {
            Ok(rule) => {
                target.insert(rule.stable_id.clone(), rule);
            }
            Err(e) => summary.record(None, RuleAction::Parse, format!("unidentifiable Kibana rule: {e}")),
        }
    }
    info!(rules = target.len(), "[IMPORT] Target snapshot taken");

    for (id, rule) in &source {
        let payload = rule.outbound_payload();
        match target.get(id) {
            Some(current) if options.skip_unchanged && current.outbound_payload() == payload => {
                debug!(stable_id = %id, "[IMPORT] Unchanged, skipping write");
                summary.unchanged += 1;
            }
            Some(_) => apply_update(rules, id, &payload, &mut summary).await,
            None => match rules.create_rule(&payload).await {
                Ok(()) => {
                    info!(stable_id = %id, "[IMPORT] Created rule");
                    summary.created += 1;
                }
                Err(AdapterError::Conflict(_)) => {
                    debug!(stable_id = %id, "[IMPORT] Create conflicted, falling back to update");
                    apply_update(rules, id, &payload, &mut summary).await;
                }
                Err(e) => summary.record(Some(id.as_str()), RuleAction::Write, e.to_string()),
            },
        }
    }

    for (id, rule) in target.iter().filter(|(id, _)| !present.contains(*id)) {
        let deleted = match rule.id_field {
            IdField::RuleId => rules.delete_rule(id).await,
            IdField::Id => rules.delete_rule_by_id(id).await,
        };
        match deleted {
            Ok(()) | Err(AdapterError::NotFound) => {
                info!(stable_id = %id, "[IMPORT] Deleted rule");
                summary.deleted += 1;
            }
            Err(e) => summary.record(Some(id.as_str()), RuleAction::Delete, e.to_string()),
        }
    }

    info!(
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        deleted = summary.deleted,
        errors = summary.error_count(),
        "[IMPORT] Import leg finished"
    );
    summary
}

async fn apply_update<R>(rules: &R, id: &str, payload: &Value, summary: &mut LegSummary)
where
    R: RuleSource + ?Sized,
{
    match rules.update_rule(payload).await {
        Ok(()) => {
            info!(stable_id = %id, "[IMPORT] Updated rule");
            summary.updated += 1;
        }
        Err(e) => summary.record(Some(id), RuleAction::Write, e.to_string()),
    }
}

/// Whether the file currently on the branch renders to the same bytes as `rendered`.
fn same_file_content(stable_id: &str, current: &[u8], rendered: &[u8]) -> bool {
    match RuleRecord::from_file(stable_id, current) {
        Ok(existing) => content_digest(&existing.render_file()) == content_digest(rendered),
        Err(_) => false,
    }
}
