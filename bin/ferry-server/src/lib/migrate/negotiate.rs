// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agreement on what to send: the transfer format of each volume and, for
//! refreshes, which snapshots are worth sending at all.

use std::collections::BTreeMap;

use crate::migrate::MigrateError;
use crate::storage::{MigrationType, SnapshotInfo};

/// Picks the transfer format for one volume.
///
/// The first entry of `offered` (source preference order) whose format also
/// appears in `supported` wins. Its features are the ones both sides list.
pub fn negotiate_type(
    volume: &str,
    offered: &[MigrationType],
    supported: &[MigrationType],
) -> Result<MigrationType, MigrateError> {
    offered
        .iter()
        .find_map(|o| {
            supported.iter().find(|s| s.fs_type == o.fs_type).map(|s| {
                MigrationType {
                    fs_type: o.fs_type,
                    features: o
                        .features
                        .iter()
                        .filter(|f| s.features.contains(f))
                        .cloned()
                        .collect(),
                }
            })
        })
        .ok_or_else(|| MigrateError::NoCommonMigrationType(volume.to_string()))
}

/// What a refresh needs to do with snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotPlan {
    /// Source snapshots to send, oldest first.
    pub transfer: Vec<SnapshotInfo>,
    /// Target snapshots to drop once the refresh succeeded.
    pub delete: Vec<String>,
}

/// Compares the snapshots of a volume on both ends of a refresh.
///
/// A target snapshot is kept only if the source has a snapshot of the same
/// name and creation time. Every source snapshot not kept is sent, unless
/// `exclude_older` is set, in which case only the ones newer than the newest
/// kept snapshot are.
pub fn refresh_snapshot_plan(
    source: &[SnapshotInfo],
    target: &[SnapshotInfo],
    exclude_older: bool,
) -> SnapshotPlan {
    let on_source: BTreeMap<&str, &SnapshotInfo> =
        source.iter().map(|s| (s.name.as_str(), s)).collect();

    let (kept, delete): (Vec<&SnapshotInfo>, Vec<&SnapshotInfo>) =
        target.iter().partition(|t| {
            on_source
                .get(t.name.as_str())
                .map_or(false, |s| s.created_at == t.created_at)
        });

    let newest_kept = kept.iter().map(|k| k.created_at).max();
    let mut transfer: Vec<SnapshotInfo> = source
        .iter()
        .filter(|s| !kept.iter().any(|k| k.name == s.name))
        .filter(|s| match (exclude_older, newest_kept) {
            (true, Some(newest)) => s.created_at > newest,
            _ => true,
        })
        .cloned()
        .collect();
    transfer.sort_by_key(|s| s.created_at);

    SnapshotPlan {
        transfer,
        delete: delete.into_iter().map(|d| d.name.clone()).collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::{MigrationFsType, FEATURE_COMPRESS, FEATURE_DELETE};
    use chrono::{TimeZone, Utc};

    fn snap(name: &str, t: i64) -> SnapshotInfo {
        SnapshotInfo {
            name: name.to_string(),
            created_at: Utc.timestamp_opt(t, 0).unwrap(),
        }
    }

    fn names(snaps: &[SnapshotInfo]) -> Vec<&str> {
        snaps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn first_source_preference_present_on_sink_wins() {
        let a = MigrationType::new(MigrationFsType::Shared);
        let b = MigrationType::new(MigrationFsType::Memory);
        let c = MigrationType::new(MigrationFsType::Tar);

        let got = negotiate_type(
            "v",
            &[a.clone(), b.clone(), c.clone()],
            &[c.clone(), b.clone()],
        )
        .unwrap();
        assert_eq!(got, b);

        let err = negotiate_type("v", &[a, b], &[c]).unwrap_err();
        assert_eq!(err, MigrateError::NoCommonMigrationType("v".to_string()));
        assert_eq!(err.to_string(), "no common transfer type for volume v");
    }

    #[test]
    fn features_are_intersected() {
        let offered = MigrationType::with_features(
            MigrationFsType::Tar,
            &[FEATURE_COMPRESS, FEATURE_DELETE],
        );
        let delete_only = || {
            MigrationType::with_features(
                MigrationFsType::Tar,
                &[FEATURE_DELETE],
            )
        };
        let got = negotiate_type("v", &[offered], &[delete_only()]).unwrap();
        assert_eq!(got, delete_only());
    }

    #[test]
    fn refresh_sends_missing_and_deletes_stale() {
        let source = [snap("s1", 1), snap("s2", 2), snap("s3", 3)];
        // s2 was recreated on the source after the last refresh.
        let target = [snap("s1", 1), snap("s2", 20), snap("old", 0)];

        let plan = refresh_snapshot_plan(&source, &target, false);
        assert_eq!(names(&plan.transfer), ["s2", "s3"]);
        assert_eq!(plan.delete, ["s2", "old"]);
    }

    #[test]
    fn refresh_exclude_older_skips_history_before_newest_kept() {
        let source = [snap("s1", 1), snap("s2", 2), snap("s3", 3)];
        let target = [snap("s2", 2)];

        let plan = refresh_snapshot_plan(&source, &target, true);
        assert_eq!(names(&plan.transfer), ["s3"]);
        assert!(plan.delete.is_empty());

        let plan = refresh_snapshot_plan(&source, &target, false);
        assert_eq!(names(&plan.transfer), ["s1", "s3"]);
    }

    #[test]
    fn refresh_of_empty_target_sends_everything() {
        let source = [snap("s2", 2), snap("s1", 1)];
        let plan = refresh_snapshot_plan(&source, &[], true);
        assert_eq!(names(&plan.transfer), ["s1", "s2"]);
    }
}
