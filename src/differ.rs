use std::{collections::BTreeSet, path::Path, time::Duration};

use crate::model::{ConflictPolicy, FileRecord, Operation, ScanResult, SkipReason, SyncMode, SyncPlan};

/// Tolerance for the mtime side of the equality test (spec.md §4.4).
const MTIME_SKEW: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

fn allowed(mode: SyncMode, kind: OpKind) -> bool {
    match mode {
        SyncMode::Mirror | SyncMode::MirrorPriority => true,
        SyncMode::Upload => !matches!(kind, OpKind::Download | OpKind::DeleteRemote),
        SyncMode::Download => !matches!(kind, OpKind::Upload | OpKind::DeleteLocal),
    }
}

/// Consumes two `ScanResult`s and, given a sync mode and conflict policy,
/// emits an ordered plan of operations (spec.md §4.4). Pure: depends only
/// on its arguments, so calling it twice on the same inputs returns plans
/// with identical operation multisets (the Differ-purity testable
/// property in spec.md §8).
///
/// `baseline` is the previous run's `ScanResult`, used solely to tell a
/// genuine deletion apart from a path that has simply never existed on
/// the other side. Without one (first sync), deletes never fire — see
/// spec.md §8 "No data loss on first-sync".
///
/// Generalized from the teacher's `diff_actions` (`sync.rs`): the
/// union-of-paths walk and the per-path `match` survive unchanged in
/// shape, but the 3-way `SyncDirection` becomes the spec's 4-way
/// `SyncMode`, the single "newer wins" comparison becomes the full
/// equality/hash/conflict-policy pipeline, and baseline-gated deletes are
/// new (the teacher's bidirectional differ never deletes at all).
pub fn diff(
    local: &ScanResult,
    remote: &ScanResult,
    mode: SyncMode,
    policy: ConflictPolicy,
    baseline: Option<&ScanResult>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    let mut paths: BTreeSet<&str> = BTreeSet::new();
    paths.extend(local.files.keys().map(String::as_str));
    paths.extend(remote.files.keys().map(String::as_str));
    if let Some(baseline) = baseline {
        paths.extend(baseline.files.keys().map(String::as_str));
    }

    for path in paths {
        let l = local.files.get(path);
        let r = remote.files.get(path);
        let in_baseline = baseline
            .map(|baseline| baseline.files.contains_key(path))
            .unwrap_or(false);

        match (l, r) {
            (Some(l), Some(r)) => {
                push_both_present(&mut plan, path, l, r, mode, policy);
            }
            (Some(_), None) => {
                if in_baseline {
                    push_if_allowed(&mut plan, mode, OpKind::DeleteLocal, || {
                        Operation::DeleteLocal(path.to_string())
                    });
                } else {
                    push_if_allowed(&mut plan, mode, OpKind::Upload, || {
                        Operation::Upload(path.to_string())
                    });
                }
            }
            (None, Some(_)) => {
                if in_baseline {
                    push_if_allowed(&mut plan, mode, OpKind::DeleteRemote, || {
                        Operation::DeleteRemote(path.to_string())
                    });
                } else {
                    push_if_allowed(&mut plan, mode, OpKind::Download, || {
                        Operation::Download(path.to_string())
                    });
                }
            }
            (None, None) => {}
        }
    }

    plan
}

fn push_if_allowed(plan: &mut SyncPlan, mode: SyncMode, kind: OpKind, make: impl FnOnce() -> Operation) {
    if allowed(mode, kind) {
        plan.push(make());
    }
}

fn push_both_present(
    plan: &mut SyncPlan,
    path: &str,
    l: &FileRecord,
    r: &FileRecord,
    mode: SyncMode,
    policy: ConflictPolicy,
) {
    if is_equal(l, r) {
        plan.push(Operation::Skip {
            path: path.to_string(),
            reason: SkipReason::Equal,
        });
        return;
    }

    if let (Some(lh), Some(rh)) = (&l.hash, &r.hash) {
        if lh == rh {
            plan.push(Operation::Skip {
                path: path.to_string(),
                reason: SkipReason::Equal,
            });
            return;
        }
    }

    // MirrorPriority short-circuits the conflict policy: when both sides
    // changed, Local wins outright (spec.md §4.4).
    if mode == SyncMode::MirrorPriority {
        push_if_allowed(plan, mode, OpKind::Upload, || Operation::Upload(path.to_string()));
        return;
    }

    match policy {
        ConflictPolicy::Recent => {
            if l.modified > r.modified {
                push_if_allowed(plan, mode, OpKind::Upload, || Operation::Upload(path.to_string()));
            } else if r.modified > l.modified {
                push_if_allowed(plan, mode, OpKind::Download, || Operation::Download(path.to_string()));
            } else {
                plan.push(Operation::Skip {
                    path: path.to_string(),
                    reason: SkipReason::ConflictTie,
                });
            }
        }
        ConflictPolicy::Local => {
            push_if_allowed(plan, mode, OpKind::Upload, || Operation::Upload(path.to_string()));
        }
        ConflictPolicy::Remote => {
            push_if_allowed(plan, mode, OpKind::Download, || Operation::Download(path.to_string()));
        }
        ConflictPolicy::KeepBoth => {
            if allowed(mode, OpKind::Download) {
                plan.push(Operation::KeepBoth {
                    path: path.to_string(),
                    suffix: keep_both_suffix(path),
                });
            }
            plan.push(Operation::Skip {
                path: path.to_string(),
                reason: SkipReason::KeepBothOriginal,
            });
        }
        ConflictPolicy::Ask => {
            plan.push(Operation::Conflict(path.to_string()));
        }
    }
}

fn is_equal(l: &FileRecord, r: &FileRecord) -> bool {
    if l.size != r.size {
        return false;
    }
    let delta = if l.modified > r.modified {
        l.modified.duration_since(r.modified).unwrap_or_default()
    } else {
        r.modified.duration_since(l.modified).unwrap_or_default()
    };
    delta <= MTIME_SKEW
}

/// `<stem>.server<ext>` — the KeepBoth destination name (spec.md §4.4,
/// concrete scenario 3).
pub fn keep_both_suffix(path: &str) -> String {
    let as_path = Path::new(path);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{stem}.server{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, time::SystemTime};

    fn record(path: &str, size: u64, modified: SystemTime, hash: Option<&str>) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            modified,
            hash: hash.map(str::to_string),
        }
    }

    fn scan(files: Vec<FileRecord>) -> ScanResult {
        let mut map = BTreeMap::new();
        for file in files {
            map.insert(file.path.clone(), file);
        }
        ScanResult::new(map)
    }

    #[test]
    fn fresh_mirror_first_sync() {
        let now = SystemTime::now();
        let local = scan(vec![
            record("a.txt", 1, now, None),
            record("b.txt", 2, now, None),
        ]);
        let remote = scan(vec![
            record("b.txt", 2, now, None),
            record("c.txt", 3, now, None),
        ]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);

        assert_eq!(plan.counters.uploads, 1);
        assert_eq!(plan.counters.downloads, 1);
        assert_eq!(plan.counters.skips, 1);
        assert_eq!(plan.counters.deletes, 0);
        assert!(plan.operations.contains(&Operation::Upload("a.txt".into())));
        assert!(plan.operations.contains(&Operation::Download("c.txt".into())));
    }

    #[test]
    fn conflict_with_recent_policy_picks_newer_side() {
        let local_mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(10 * 3600);
        let remote_mtime = local_mtime + Duration::from_secs(5);
        let local = scan(vec![record("x.bin", 100, local_mtime, Some("aaa"))]);
        let remote = scan(vec![record("x.bin", 100, remote_mtime, Some("bbb"))]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);

        assert_eq!(plan.operations, vec![Operation::Download("x.bin".into())]);
    }

    #[test]
    fn keep_both_conflict_downloads_server_variant_and_skips_original() {
        let local_mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(10 * 3600);
        let remote_mtime = local_mtime + Duration::from_secs(5);
        let local = scan(vec![record("x.bin", 100, local_mtime, Some("aaa"))]);
        let remote = scan(vec![record("x.bin", 100, remote_mtime, Some("bbb"))]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::KeepBoth, None);

        assert!(plan.operations.contains(&Operation::KeepBoth {
            path: "x.bin".into(),
            suffix: "x.server.bin".into(),
        }));
        assert!(plan.operations.contains(&Operation::Skip {
            path: "x.bin".into(),
            reason: SkipReason::KeepBothOriginal,
        }));
    }

    #[test]
    fn rename_with_baseline_produces_upload_and_delete_remote() {
        let now = SystemTime::now();
        let baseline = scan(vec![record("foo.txt", 4, now, None)]);
        let local = scan(vec![record("bar.txt", 4, now, None)]);
        let remote = scan(vec![record("foo.txt", 4, now, None)]);

        let plan = diff(
            &local,
            &remote,
            SyncMode::Mirror,
            ConflictPolicy::Recent,
            Some(&baseline),
        );

        assert!(plan.operations.contains(&Operation::Upload("bar.txt".into())));
        assert!(plan.operations.contains(&Operation::DeleteRemote("foo.txt".into())));

        let phases = plan.phases();
        assert!(phases[0].iter().any(|op| matches!(op, Operation::DeleteRemote(_))));
        assert!(phases[1].iter().any(|op| matches!(op, Operation::Upload(_))));
    }

    #[test]
    fn no_baseline_never_deletes() {
        let now = SystemTime::now();
        let local = scan(vec![record("a.txt", 1, now, None)]);
        let remote = scan(vec![]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);

        assert_eq!(plan.counters.deletes, 0);
        assert_eq!(plan.operations, vec![Operation::Upload("a.txt".into())]);
    }

    #[test]
    fn upload_mode_drops_downloads_and_remote_deletes() {
        let now = SystemTime::now();
        let baseline = scan(vec![record("gone.txt", 1, now, None)]);
        let local = scan(vec![record("new.txt", 1, now, None)]);
        let remote = scan(vec![
            record("gone.txt", 1, now, None),
            record("remote_only.txt", 1, now, None),
        ]);

        let plan = diff(
            &local,
            &remote,
            SyncMode::Upload,
            ConflictPolicy::Recent,
            Some(&baseline),
        );

        assert!(plan.operations.contains(&Operation::Upload("new.txt".into())));
        assert!(!plan
            .operations
            .iter()
            .any(|op| matches!(op, Operation::Download(_) | Operation::DeleteRemote(_))));
    }

    #[test]
    fn mtime_skew_within_tolerance_with_equal_size_is_skip() {
        let local_mtime = SystemTime::now();
        let remote_mtime = local_mtime + Duration::from_millis(1500);
        let local = scan(vec![record("a.txt", 10, local_mtime, None)]);
        let remote = scan(vec![record("a.txt", 10, remote_mtime, None)]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);

        assert_eq!(
            plan.operations,
            vec![Operation::Skip {
                path: "a.txt".into(),
                reason: SkipReason::Equal
            }]
        );
    }

    #[test]
    fn mtime_skew_beyond_tolerance_falls_back_to_hash_equality() {
        let local_mtime = SystemTime::now();
        let remote_mtime = local_mtime + Duration::from_secs(30);
        let local = scan(vec![record("a.txt", 10, local_mtime, Some("same"))]);
        let remote = scan(vec![record("a.txt", 10, remote_mtime, Some("same"))]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Ask, None);

        assert_eq!(
            plan.operations,
            vec![Operation::Skip {
                path: "a.txt".into(),
                reason: SkipReason::Equal
            }]
        );
    }

    #[test]
    fn mtime_skew_beyond_tolerance_with_differing_hash_is_conflict() {
        let local_mtime = SystemTime::now();
        let remote_mtime = local_mtime + Duration::from_secs(30);
        let local = scan(vec![record("a.txt", 10, local_mtime, Some("aaa"))]);
        let remote = scan(vec![record("a.txt", 10, remote_mtime, Some("bbb"))]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Ask, None);

        assert_eq!(plan.operations, vec![Operation::Conflict("a.txt".into())]);
    }

    #[test]
    fn idempotent_on_unchanging_pair() {
        let now = SystemTime::now();
        let local = scan(vec![record("a.txt", 1, now, Some("h"))]);
        let remote = scan(vec![record("a.txt", 1, now, Some("h"))]);

        let plan = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, Some(&local));

        assert_eq!(plan.counters.uploads, 0);
        assert_eq!(plan.counters.downloads, 0);
        assert_eq!(plan.counters.deletes, 0);
    }

    #[test]
    fn differ_is_pure() {
        let now = SystemTime::now();
        let local = scan(vec![record("a.txt", 1, now, None)]);
        let remote = scan(vec![record("b.txt", 2, now, None)]);

        let first = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);
        let second = diff(&local, &remote, SyncMode::Mirror, ConflictPolicy::Recent, None);

        assert_eq!(first.operations, second.operations);
    }
}
