//! Dependency resolver: turns a set of requested pack ids into an ordered,
//! conflict-annotated plan.
//!
//! Resolution is a memoized depth-first walk. Revisiting a pack that is
//! still on the DFS stack records a cycle and cuts the edge; the pack set is
//! deduplicated by id keeping the first-encountered version, then sorted by
//! `(compose.order, id)` so the plan is a total order even when the graph
//! only imposes a partial one. Conflict detection runs pairwise over the
//! final plan, independently of the walk, so a conflict reachable only
//! through a dependency edge is still found.
//!
//! Cycles and conflicts are data in the returned [`Plan`]; the only hard
//! failures are a requested pack that cannot be found and a dependency
//! whose fetch fails.

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use semver::{Version, VersionReq};
use tracing::debug;

use crate::error::{ErrorKind, GitvanError};
use crate::fetch::{Fetcher, ResolvedPack};
use crate::manifest::PackManifest;
use crate::types::{ConflictReport, PackRef, Plan};

/// True when `version` satisfies `range`. Ranges use full semver semantics
/// (`^`, `~`, comparators, comma-AND) plus `||` unions; `*` and the empty
/// range match everything.
pub fn satisfies(version: &str, range: &str) -> Result<bool> {
    let version = Version::parse(version).map_err(|e| GitvanError::ManifestInvalid {
        reason: format!("version {version:?} is not semver: {e}"),
    })?;

    let trimmed = range.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(true);
    }

    for alternative in trimmed.split("||") {
        let req = VersionReq::parse(alternative.trim()).map_err(|e| {
            GitvanError::ManifestInvalid {
                reason: format!("range {alternative:?} is not a semver range: {e}"),
            }
        })?;
        if req.matches(&version) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Everything the resolver learned about one pack.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub pack: PackRef,
    pub manifest: PackManifest,
}

/// A resolved plan plus per-pack manifests for downstream stages.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub plan: Plan,
    pub entries: Vec<ResolvedEntry>,
}

struct Walk<'f, 'rt> {
    fetcher: &'f Fetcher<'rt>,
    /// First-encounter ordering, deduplicated by manifest id.
    found: Vec<ResolvedEntry>,
    seen: BTreeSet<String>,
    stack: Vec<String>,
    cycles: Vec<Vec<String>>,
    /// Requested ids whose manifest id differs (e.g. directory aliases).
    memo_misses: HashSet<String>,
}

impl Walk<'_, '_> {
    fn visit(&mut self, id: &str, requested: bool) -> Result<()> {
        // A revisit while the pack is still on the stack closes a cycle;
        // record it and cut the edge instead of recursing forever.
        if let Some(pos) = self.stack.iter().position(|s| s == id) {
            let mut cycle: Vec<String> = self.stack[pos..].to_vec();
            cycle.push(id.to_string());
            debug!(target: "gitvan::resolve", cycle = ?cycle, "cycle detected");
            self.cycles.push(cycle);
            return Ok(());
        }
        if self.seen.contains(id) || self.memo_misses.contains(id) {
            return Ok(());
        }

        let resolved: ResolvedPack = match self.fetcher.resolve(id) {
            Ok(r) => r,
            Err(err) if requested => return Err(err),
            Err(err) => {
                let parent = self.stack.last().cloned().unwrap_or_default();
                return Err(GitvanError::DependencyFailed {
                    pack_id: parent,
                    cause: format!("{err:#}"),
                }
                .into());
            }
        };

        let manifest_id = resolved.manifest.id.clone();
        if self.seen.contains(&manifest_id) {
            // Requested under an alias; the manifest id is already planned.
            self.memo_misses.insert(id.to_string());
            return Ok(());
        }

        self.stack.push(manifest_id.clone());
        if manifest_id != id {
            self.memo_misses.insert(id.to_string());
        }

        let deps: Vec<String> = resolved
            .manifest
            .compose
            .depends_on
            .iter()
            .cloned()
            .chain(resolved.manifest.compose.dependencies.keys().cloned())
            .collect();

        // First encounter wins for version and source path.
        self.seen.insert(manifest_id.clone());
        self.found.push(ResolvedEntry {
            pack: PackRef {
                id: manifest_id.clone(),
                version: resolved.manifest.version.clone(),
                order: resolved.manifest.compose.effective_order(),
                source_path: resolved.path.clone(),
            },
            manifest: resolved.manifest,
        });

        for dep in deps {
            self.visit(&dep, false)?;
        }

        self.stack.pop();
        Ok(())
    }
}

/// Resolve requested pack ids into a plan.
///
/// `allow_overlap` suppresses the capability-overlap conflict globally; a
/// pack can also opt out for itself via `compose.allowOverlap`.
pub fn resolve(fetcher: &Fetcher<'_>, requested: &[String], allow_overlap: bool) -> Result<Resolution> {
    let mut walk = Walk {
        fetcher,
        found: Vec::new(),
        seen: BTreeSet::new(),
        stack: Vec::new(),
        cycles: Vec::new(),
        memo_misses: HashSet::new(),
    };

    // Duplicate requests collapse before the walk.
    let mut requested_unique: Vec<&String> = Vec::new();
    let mut seen_req = HashSet::new();
    for id in requested {
        if seen_req.insert(id.as_str()) {
            requested_unique.push(id);
        }
    }

    for id in requested_unique {
        walk.visit(id, true)?;
    }

    let mut entries = walk.found;
    entries.sort_by(|a, b| {
        a.pack
            .order
            .cmp(&b.pack.order)
            .then_with(|| a.pack.id.cmp(&b.pack.id))
    });

    let conflicts = detect_conflicts(&entries, allow_overlap);
    let order: Vec<String> = entries.iter().map(|e| e.pack.id.clone()).collect();
    let packs: Vec<PackRef> = entries.iter().map(|e| e.pack.clone()).collect();

    Ok(Resolution {
        plan: Plan {
            packs,
            conflicts,
            cycles: walk.cycles,
            order,
        },
        entries,
    })
}

/// Pairwise compatibility over the final plan.
fn detect_conflicts(entries: &[ResolvedEntry], allow_overlap: bool) -> Vec<ConflictReport> {
    let mut conflicts = Vec::new();

    for (i, a) in entries.iter().enumerate() {
        for b in entries.iter().skip(i + 1) {
            conflicts.extend(pair_conflict(a, b, allow_overlap));
        }
    }
    conflicts
}

fn pair_conflict(a: &ResolvedEntry, b: &ResolvedEntry, allow_overlap: bool) -> Vec<ConflictReport> {
    let mut out = Vec::new();
    let report = |reason: String| ConflictReport {
        a: a.pack.id.clone(),
        b: b.pack.id.clone(),
        reason,
    };

    if a.manifest.compose.conflicts_with.contains(&b.pack.id)
        || b.manifest.compose.conflicts_with.contains(&a.pack.id)
    {
        out.push(report("Direct conflict declared".to_string()));
    }

    if !allow_overlap && !a.manifest.compose.allow_overlap && !b.manifest.compose.allow_overlap {
        let mut shared: Vec<&str> = a
            .manifest
            .capabilities
            .iter()
            .filter(|c| b.manifest.capabilities.contains(c))
            .map(String::as_str)
            .collect();
        shared.sort_unstable();
        if !shared.is_empty() {
            out.push(report(format!("Capability overlap: {}", shared.join(", "))));
        }
    }

    for (x, y) in [(a, b), (b, a)] {
        if let Some(range) = x.manifest.compose.dependencies.get(&y.pack.id) {
            match satisfies(&y.pack.version, range) {
                Ok(true) => {}
                Ok(false) => out.push(ConflictReport {
                    a: x.pack.id.clone(),
                    b: y.pack.id.clone(),
                    reason: format!(
                        "Requires {} {range}, found {}",
                        y.pack.id, y.pack.version
                    ),
                }),
                Err(err) => out.push(ConflictReport {
                    a: x.pack.id.clone(),
                    b: y.pack.id.clone(),
                    reason: format!("Unusable version range {range:?}: {err:#}"),
                }),
            }
        }

        for incompat in &x.manifest.compose.incompatible_with {
            if incompat.pack == y.pack.id
                && satisfies(&y.pack.version, &incompat.version_range).unwrap_or(true)
            {
                out.push(ConflictReport {
                    a: x.pack.id.clone(),
                    b: y.pack.id.clone(),
                    reason: format!(
                        "Incompatible with {} {}",
                        incompat.pack, incompat.version_range
                    ),
                });
            }
        }
    }

    out
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::testutil::seed_pack;
    use super::*;
    use crate::config::testutil::test_runtime;

    fn fixture(
        seed: impl FnOnce(&std::path::Path),
    ) -> (tempfile::TempDir, std::path::PathBuf) {
        let td = tempdir().expect("tempdir");
        let target = td.path().join("target");
        seed(&target);
        (td, target)
    }

    fn resolve_ids(
        td: &tempfile::TempDir,
        target: &std::path::Path,
        ids: &[&str],
    ) -> Result<Resolution> {
        let rt = test_runtime(td.path());
        let fetcher = Fetcher::new(&rt, target, &td.path().join("cache-root")).expect("fetcher");
        resolve(&fetcher, &ids.iter().map(|s| s.to_string()).collect::<Vec<_>>(), false)
    }

    #[test]
    fn satisfies_full_semver_semantics() {
        assert!(satisfies("1.2.3", "^1.0.0").unwrap());
        assert!(!satisfies("2.0.0", "^1.0.0").unwrap());
        assert!(satisfies("1.2.9", "~1.2.0").unwrap());
        assert!(!satisfies("1.3.0", "~1.2.0").unwrap());
        assert!(satisfies("1.5.0", ">=1.0.0, <2.0.0").unwrap());
        assert!(satisfies("3.0.0", "^1.0.0 || ^3.0.0").unwrap());
        assert!(!satisfies("2.0.0", "^1.0.0 || ^3.0.0").unwrap());
        assert!(satisfies("0.1.0", "*").unwrap());
        assert!(satisfies("0.1.0", "").unwrap());
        assert!(satisfies("1.0.0", "1").unwrap());
        assert!(satisfies("1.9.0", "1").unwrap());
    }

    #[test]
    fn satisfies_rejects_garbage() {
        assert!(satisfies("not-a-version", "^1.0.0").is_err());
        assert!(satisfies("1.0.0", "⊥⊥⊥").is_err());
    }

    #[test]
    fn empty_request_is_an_empty_valid_plan() {
        let (td, target) = fixture(|_| {});
        let resolution = resolve_ids(&td, &target, &[]).expect("resolve");
        assert!(resolution.plan.packs.is_empty());
        assert!(resolution.plan.is_valid());
        assert!(resolution.plan.cycles.is_empty());
    }

    #[test]
    fn unknown_id_is_pack_not_found() {
        let (td, target) = fixture(|_| {});
        let err = resolve_ids(&td, &target, &["ghost"]).expect_err("missing");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::PackNotFound);
    }

    #[test]
    fn duplicate_requests_are_deduplicated() {
        let (td, target) = fixture(|t| {
            seed_pack(t, "solo", "solo", json!({}));
        });
        let resolution = resolve_ids(&td, &target, &["solo", "solo"]).expect("resolve");
        assert_eq!(resolution.plan.order, vec!["solo"]);
    }

    #[test]
    fn admin_ecosystem_resolves_in_documented_order() {
        let (td, target) = fixture(|t| {
            seed_pack(t, "core/base", "core/base", json!({"compose": {"order": 1}}));
            seed_pack(
                t,
                "core/utils",
                "core/utils",
                json!({"compose": {"order": 2, "dependsOn": ["core/base"]}}),
            );
            seed_pack(
                t,
                "framework/express",
                "framework/express",
                json!({"compose": {"order": 10, "dependsOn": ["core/base", "core/utils"]}}),
            );
            seed_pack(
                t,
                "database/postgres",
                "database/postgres",
                json!({"compose": {"order": 20, "dependsOn": ["core/base"]}}),
            );
            seed_pack(
                t,
                "auth/jwt",
                "auth/jwt",
                json!({"compose": {"order": 30, "dependsOn": ["core/base"]}}),
            );
            seed_pack(
                t,
                "features/api",
                "features/api",
                json!({"compose": {
                    "order": 40,
                    "dependsOn": ["framework/express", "database/postgres", "auth/jwt"],
                }}),
            );
            seed_pack(
                t,
                "auth/oauth",
                "auth/oauth",
                json!({"compose": {"order": 45, "dependsOn": ["auth/jwt"]}}),
            );
            seed_pack(
                t,
                "admin-pack",
                "features/admin",
                json!({"compose": {
                    "order": 50,
                    "dependsOn": ["features/api", "auth/oauth"],
                }}),
            );
        });

        let resolution = resolve_ids(&td, &target, &["admin-pack"]).expect("resolve");
        assert_eq!(
            resolution.plan.order,
            vec![
                "core/base",
                "core/utils",
                "framework/express",
                "database/postgres",
                "auth/jwt",
                "features/api",
                "auth/oauth",
                "features/admin",
            ]
        );
        assert!(resolution.plan.conflicts.is_empty());

        // Every dependsOn predecessor appears earlier.
        for entry in &resolution.entries {
            let my_pos = resolution
                .plan
                .order
                .iter()
                .position(|id| id == &entry.pack.id)
                .unwrap();
            for dep in &entry.manifest.compose.depends_on {
                let dep_pos = resolution.plan.order.iter().position(|id| id == dep).unwrap();
                assert!(dep_pos < my_pos, "{dep} must precede {}", entry.pack.id);
            }
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let (td, target) = fixture(|t| {
            seed_pack(t, "b-pack", "b-pack", json!({}));
            seed_pack(t, "a-pack", "a-pack", json!({}));
            seed_pack(t, "c-pack", "c-pack", json!({}));
        });
        let first = resolve_ids(&td, &target, &["c-pack", "a-pack", "b-pack"]).expect("first");
        let second = resolve_ids(&td, &target, &["c-pack", "a-pack", "b-pack"]).expect("second");
        assert_eq!(first.plan, second.plan);
        // Default order ties break by id ascending.
        assert_eq!(first.plan.order, vec!["a-pack", "b-pack", "c-pack"]);
    }

    #[test]
    fn direct_conflict_is_reported() {
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "framework/express",
                "framework/express",
                json!({"compose": {"conflictsWith": ["framework/fastify"]}}),
            );
            seed_pack(t, "framework/fastify", "framework/fastify", json!({}));
        });

        let resolution =
            resolve_ids(&td, &target, &["framework/express", "framework/fastify"]).expect("resolve");
        assert!(!resolution.plan.is_valid());
        assert_eq!(resolution.plan.conflicts.len(), 1);
        let c = &resolution.plan.conflicts[0];
        assert_eq!(c.a, "framework/express");
        assert_eq!(c.b, "framework/fastify");
        assert_eq!(c.reason, "Direct conflict declared");
        // Both packs still appear in the plan for preview purposes.
        assert_eq!(resolution.plan.packs.len(), 2);
    }

    #[test]
    fn capability_overlap_conflicts_unless_allowed() {
        let seed = |t: &std::path::Path| {
            seed_pack(
                t,
                "log/a",
                "log/a",
                json!({"capabilities": ["logging", "metrics"]}),
            );
            seed_pack(t, "log/b", "log/b", json!({"capabilities": ["logging"]}));
        };

        let (td, target) = fixture(seed);
        let resolution = resolve_ids(&td, &target, &["log/a", "log/b"]).expect("resolve");
        assert_eq!(resolution.plan.conflicts.len(), 1);
        assert!(resolution.plan.conflicts[0].reason.contains("Capability overlap: logging"));

        // Global opt-out.
        let (td, target) = fixture(seed);
        let rt = test_runtime(td.path());
        let fetcher = Fetcher::new(&rt, &target, &td.path().join("cache-root")).expect("fetcher");
        let relaxed = resolve(
            &fetcher,
            &["log/a".to_string(), "log/b".to_string()],
            true,
        )
        .expect("resolve");
        assert!(relaxed.plan.conflicts.is_empty());

        // Per-pack opt-out.
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "log/a",
                "log/a",
                json!({"capabilities": ["logging"], "compose": {"allowOverlap": true}}),
            );
            seed_pack(t, "log/b", "log/b", json!({"capabilities": ["logging"]}));
        });
        let resolution = resolve_ids(&td, &target, &["log/a", "log/b"]).expect("resolve");
        assert!(resolution.plan.conflicts.is_empty());
    }

    #[test]
    fn version_constraints_check_the_planned_version() {
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "needs-new",
                "needs-new",
                json!({"compose": {"dependencies": {"dep/pack": "^2.0.0"}}}),
            );
            seed_pack(t, "dep/pack", "dep/pack", json!({}));
        });

        let resolution = resolve_ids(&td, &target, &["needs-new"]).expect("resolve");
        assert_eq!(resolution.plan.conflicts.len(), 1);
        assert!(
            resolution.plan.conflicts[0]
                .reason
                .contains("Requires dep/pack ^2.0.0")
        );
    }

    #[test]
    fn incompatible_with_matches_version_range() {
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "picky",
                "picky",
                json!({"compose": {"incompatibleWith": [
                    {"pack": "other", "versionRange": "^1.0.0"},
                ]}}),
            );
            seed_pack(t, "other", "other", json!({}));
        });
        let resolution = resolve_ids(&td, &target, &["picky", "other"]).expect("resolve");
        assert_eq!(resolution.plan.conflicts.len(), 1);
        assert!(resolution.plan.conflicts[0].reason.contains("Incompatible with other"));

        // A version outside the range is compatible.
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "picky",
                "picky",
                json!({"compose": {"incompatibleWith": [
                    {"pack": "other", "versionRange": "^2.0.0"},
                ]}}),
            );
            seed_pack(t, "other", "other", json!({}));
        });
        let resolution = resolve_ids(&td, &target, &["picky", "other"]).expect("resolve");
        assert!(resolution.plan.conflicts.is_empty());
    }

    #[test]
    fn self_dependency_reports_cycle_and_plans_once() {
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "selfish",
                "selfish",
                json!({"compose": {"dependsOn": ["selfish"]}}),
            );
        });
        let resolution = resolve_ids(&td, &target, &["selfish"]).expect("resolve");
        assert_eq!(resolution.plan.order, vec!["selfish"]);
        assert_eq!(resolution.plan.cycles.len(), 1);
        assert_eq!(
            resolution.plan.cycles[0],
            vec!["selfish".to_string(), "selfish".to_string()]
        );
    }

    #[test]
    fn mutual_cycle_is_reported_not_thrown() {
        let (td, target) = fixture(|t| {
            seed_pack(t, "ping", "ping", json!({"compose": {"dependsOn": ["pong"]}}));
            seed_pack(t, "pong", "pong", json!({"compose": {"dependsOn": ["ping"]}}));
        });
        let resolution = resolve_ids(&td, &target, &["ping"]).expect("resolve");
        assert_eq!(resolution.plan.order, vec!["ping", "pong"]);
        assert_eq!(resolution.plan.cycles.len(), 1);
    }

    #[test]
    fn missing_transitive_dependency_is_dependency_failed() {
        let (td, target) = fixture(|t| {
            seed_pack(
                t,
                "needy",
                "needy",
                json!({"compose": {"dependsOn": ["does-not-exist"]}}),
            );
        });
        let err = resolve_ids(&td, &target, &["needy"]).expect_err("missing dep");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::DependencyFailed);
        assert!(err.to_string().contains("needy"));
    }
}
