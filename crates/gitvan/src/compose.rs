//! Pack composer: the orchestration layer between the resolver and the
//! applier.
//!
//! `compose` resolves the requested ids, refuses conflicted plans unless
//! told otherwise, and applies pack by pack in plan order under the target's
//! apply lock, aggregating per-pack statuses into OK/PARTIAL/ERROR.
//! `layer` is the overlay variant: explicit packs, explicit order, later
//! packs overwrite. `preview` and `validate` are read-only views over the
//! same resolution.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::apply::{Applier, ApplyRequest};
use crate::config::Runtime;
use crate::error::ErrorDetail;
use crate::fetch::Fetcher;
use crate::lock::ApplyLock;
use crate::receipt::ReceiptStore;
use crate::resolve::{Resolution, resolve};
use crate::template::TemplateRenderer;
use crate::types::{
    ApplyResult, ComposeOptions, ComposeOutcome, ConflictReport, PackRef, PreviewEntry, RunStatus,
};

/// Progress sink threaded through compose and daemon operations.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything; the default for library callers.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Validation outcome: resolve plus pairwise compatibility, no mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateReport {
    pub valid: bool,
    pub conflicts: Vec<ConflictReport>,
    pub cycles: Vec<Vec<String>>,
    pub order: Vec<String>,
}

/// Deterministic plan identity: a hash over the ordered `(id, version)`
/// sequence.
pub fn compute_plan_id(packs: &[PackRef]) -> String {
    let mut hasher = Sha256::new();
    for p in packs {
        hasher.update(p.id.as_bytes());
        hasher.update(b"@");
        hasher.update(p.version.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct Composer<'rt> {
    runtime: &'rt Runtime,
    fetcher: Fetcher<'rt>,
    renderer: TemplateRenderer,
}

impl<'rt> Composer<'rt> {
    pub fn new(runtime: &'rt Runtime, target_dir: &Path, cache_root: &Path) -> Result<Self> {
        Ok(Self {
            runtime,
            fetcher: Fetcher::new(runtime, target_dir, cache_root)?,
            renderer: TemplateRenderer::new(runtime.config.template.clone()),
        })
    }

    /// Resolve and apply the requested packs onto `target_dir`.
    pub fn compose(
        &self,
        ids: &[String],
        target_dir: &Path,
        opts: &ComposeOptions,
        receipts: Option<&ReceiptStore>,
        reporter: &mut dyn Reporter,
    ) -> Result<ComposeOutcome> {
        let resolution = resolve(&self.fetcher, ids, opts.allow_overlap)?;

        for cycle in &resolution.plan.cycles {
            reporter.warn(&format!("dependency cycle: {}", cycle.join(" -> ")));
        }

        if !resolution.plan.conflicts.is_empty() && !opts.ignore_conflicts {
            for c in &resolution.plan.conflicts {
                reporter.error(&format!("conflict between {} and {}: {}", c.a, c.b, c.reason));
            }
            return Ok(ComposeOutcome {
                status: RunStatus::Error,
                results: Vec::new(),
                conflicts: resolution.plan.conflicts,
            });
        }

        self.apply_in_order(&resolution, target_dir, opts, receipts, reporter)
    }

    /// Overlay mode: apply exactly the named packs, ordered by their
    /// explicit `compose.order` (ties by id), later packs overwriting. No
    /// dependency expansion and no conflict gate.
    pub fn layer(
        &self,
        ids: &[String],
        target_dir: &Path,
        opts: &ComposeOptions,
        receipts: Option<&ReceiptStore>,
        reporter: &mut dyn Reporter,
    ) -> Result<ComposeOutcome> {
        let mut entries = Vec::new();
        for id in ids {
            let resolved = self.fetcher.resolve(id)?;
            entries.push(crate::resolve::ResolvedEntry {
                pack: PackRef {
                    id: resolved.manifest.id.clone(),
                    version: resolved.manifest.version.clone(),
                    order: resolved.manifest.compose.effective_order(),
                    source_path: resolved.path.clone(),
                },
                manifest: resolved.manifest,
            });
        }
        entries.sort_by(|a, b| {
            a.pack
                .order
                .cmp(&b.pack.order)
                .then_with(|| a.pack.id.cmp(&b.pack.id))
        });

        let resolution = Resolution {
            plan: crate::types::Plan {
                order: entries.iter().map(|e| e.pack.id.clone()).collect(),
                packs: entries.iter().map(|e| e.pack.clone()).collect(),
                conflicts: Vec::new(),
                cycles: Vec::new(),
            },
            entries,
        };

        self.apply_in_order(&resolution, target_dir, opts, receipts, reporter)
    }

    /// Resolve only: the ordered timeline of what would apply, with
    /// artifact counts and conflict markers. Never mutates the target.
    pub fn preview(&self, ids: &[String]) -> Result<Vec<PreviewEntry>> {
        let resolution = resolve(&self.fetcher, ids, false)?;

        Ok(resolution
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let mut conflicts_with: Vec<String> = resolution
                    .plan
                    .conflicts
                    .iter()
                    .filter_map(|c| {
                        if c.a == entry.pack.id {
                            Some(c.b.clone())
                        } else if c.b == entry.pack.id {
                            Some(c.a.clone())
                        } else {
                            None
                        }
                    })
                    .collect();
                conflicts_with.sort();
                conflicts_with.dedup();

                PreviewEntry {
                    position,
                    id: entry.pack.id.clone(),
                    version: entry.pack.version.clone(),
                    order: entry.pack.order,
                    source_path: entry.pack.source_path.clone(),
                    templates: entry.manifest.provides.templates.len(),
                    files: entry.manifest.provides.files.len(),
                    jobs: entry.manifest.provides.jobs.len(),
                    conflicts_with,
                }
            })
            .collect())
    }

    /// Resolve plus pairwise compatibility; never touches the target.
    pub fn validate(&self, ids: &[String]) -> Result<ValidateReport> {
        let resolution = resolve(&self.fetcher, ids, false)?;
        Ok(ValidateReport {
            valid: resolution.plan.conflicts.is_empty() && resolution.plan.cycles.is_empty(),
            conflicts: resolution.plan.conflicts,
            cycles: resolution.plan.cycles,
            order: resolution.plan.order,
        })
    }

    fn apply_in_order(
        &self,
        resolution: &Resolution,
        target_dir: &Path,
        opts: &ComposeOptions,
        receipts: Option<&ReceiptStore>,
        reporter: &mut dyn Reporter,
    ) -> Result<ComposeOutcome> {
        let plan_id = compute_plan_id(&resolution.plan.packs);
        debug!(target: "gitvan::compose", plan_id = %plan_id, packs = resolution.plan.packs.len(), "applying plan");

        // Concurrent applies to the same target serialize here; the lock
        // spans every per-pack application in the plan and advances with it.
        let mut lock = if opts.dry_run {
            None
        } else {
            Some(ApplyLock::acquire(
                target_dir,
                &plan_id,
                resolution.entries.len(),
                self.runtime.config.apply.lock_timeout,
            )?)
        };

        let applier = Applier::new(&self.renderer);
        let global_inputs = opts.inputs.get("*").cloned().unwrap_or_default();
        let mut results: Vec<ApplyResult> = Vec::new();

        for entry in &resolution.entries {
            if let Some(lock) = lock.as_mut() {
                lock.advance(&entry.pack.id)?;
            }

            let mut inputs: Map<String, Value> = global_inputs.clone();
            if let Some(per_pack) = opts.inputs.get(&entry.pack.id) {
                for (k, v) in per_pack {
                    inputs.insert(k.clone(), v.clone());
                }
            }

            reporter.info(&format!(
                "applying {}@{} from {}",
                entry.pack.id,
                entry.pack.version,
                entry.pack.source_path.display()
            ));

            let outcome = applier.apply(&ApplyRequest {
                pack_path: &entry.pack.source_path,
                target_dir,
                inputs: &inputs,
                receipts,
                dry_run: opts.dry_run,
            });

            match outcome {
                Ok(result) => {
                    match result.status {
                        RunStatus::Ok => {
                            reporter.info(&format!("{}: applied {} items", entry.pack.id, result.applied.len()));
                        }
                        RunStatus::Skip => reporter.info(&format!("{}: already applied (skip)", entry.pack.id)),
                        RunStatus::Partial => reporter.warn(&format!(
                            "{}: partial ({} applied, {} failed)",
                            entry.pack.id,
                            result.applied.len(),
                            result.errors.len()
                        )),
                        RunStatus::Error => reporter.error(&format!("{}: failed", entry.pack.id)),
                    }
                    let failed = matches!(result.status, RunStatus::Error | RunStatus::Partial);
                    results.push(result);
                    if failed && !opts.continue_on_error {
                        break;
                    }
                }
                Err(err) => {
                    reporter.error(&format!("{}: {err:#}", entry.pack.id));
                    results.push(ApplyResult {
                        pack_id: entry.pack.id.clone(),
                        status: RunStatus::Error,
                        fingerprint: String::new(),
                        applied: Vec::new(),
                        errors: vec![ErrorDetail::from_error(&err)],
                    });
                    if !opts.continue_on_error {
                        break;
                    }
                }
            }
        }

        drop(lock);

        let statuses: Vec<RunStatus> = results.iter().map(|r| r.status).collect();
        Ok(ComposeOutcome {
            status: RunStatus::aggregate(&statuses),
            results,
            conflicts: resolution.plan.conflicts.clone(),
        })
    }
}

/// Test double collecting every reported line.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    pub lines: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push(format!("info: {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push(format!("warn: {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push(format!("error: {msg}"));
    }
}
