//! # Grouping
//!
//! Helpers to cluster timestamped records by an identifying key and a time window, as required by
//! sources that emit several files or rows for what is logically a single upload.
use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};

/// Format of the label naming each time window cluster.
pub const GROUP_LABEL_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Partition items by the key returned from `key`, preserving input order within each group.
pub fn group_by_key<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut grouped: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        grouped.entry(key(&item)).or_default().push(item);
    }
    grouped
}

/// Cluster items by timestamp.
///
/// Items are sorted ascending and a window is opened at the first one. Every item falling on or
/// before `window_start + window_minutes` joins the current cluster; the first item after it opens a
/// new window starting at its own timestamp. The window is never re-centered within a cluster, and a
/// window of zero minutes puts every distinct timestamp in its own window.
///
/// Clusters are labelled by their start formatted with `GROUP_LABEL_FORMAT`. Two windows starting in
/// the same minute therefore share a label and are merged.
pub fn group_by_window<T, F>(
    mut items: Vec<T>,
    window_minutes: u32,
    timestamp: F,
) -> BTreeMap<String, Vec<T>>
where
    F: Fn(&T) -> NaiveDateTime,
{
    let mut grouped: BTreeMap<String, Vec<T>> = BTreeMap::new();
    let Some(first) = items.iter().map(&timestamp).min() else {
        return grouped;
    };

    items.sort_by_key(|item| timestamp(item));

    let window = Duration::minutes(i64::from(window_minutes));
    let mut window_end = first + window;
    let mut label = first.format(GROUP_LABEL_FORMAT).to_string();

    for item in items {
        let ts = timestamp(&item);
        if ts > window_end {
            window_end = ts + window;
            label = ts.format(GROUP_LABEL_FORMAT).to_string();
        }
        grouped.entry(label.clone()).or_default().push(item);
    }

    grouped
}

/// Group by key first, then cluster each key's items by time window independently.
pub fn group_by_key_and_window<T, K, FK, FT>(
    items: impl IntoIterator<Item = T>,
    window_minutes: u32,
    key: FK,
    timestamp: FT,
) -> BTreeMap<K, BTreeMap<String, Vec<T>>>
where
    K: Ord,
    FK: Fn(&T) -> K,
    FT: Fn(&T) -> NaiveDateTime,
{
    group_by_key(items, key)
        .into_iter()
        .map(|(k, group)| (k, group_by_window(group, window_minutes, &timestamp)))
        .collect()
}

/// Drop every cluster whose most recent item is not at least `wait` older than `now`, so a cluster is
/// only released once no more items are expected to join it.
pub fn settled<T, F>(
    clusters: BTreeMap<String, Vec<T>>,
    wait: Duration,
    now: NaiveDateTime,
    timestamp: F,
) -> BTreeMap<String, Vec<T>>
where
    F: Fn(&T) -> NaiveDateTime,
{
    clusters
        .into_iter()
        .filter(|(_, items)| match items.iter().map(&timestamp).max() {
            Some(latest) => latest + wait <= now,
            None => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(minutes: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            + Duration::minutes(minutes)
    }

    fn minutes_of(cluster: &[NaiveDateTime]) -> Vec<i64> {
        cluster.iter().map(|t| (*t - at(0)).num_minutes()).collect()
    }

    #[test]
    fn test_gap_larger_than_window_starts_new_cluster() {
        let items = vec![at(12), at(0), at(13), at(2), at(1)];

        let grouped = group_by_window(items, 3, |t| *t);

        assert_eq!(grouped.len(), 2);
        assert_eq!(minutes_of(&grouped["2024-03-01-08-00"]), vec![0, 1, 2]);
        assert_eq!(minutes_of(&grouped["2024-03-01-08-12"]), vec![12, 13]);
    }

    #[test]
    fn test_window_is_anchored_at_cluster_start() {
        // 4 is within 0 + 5, 6 is not even though it is only 2 minutes after 4.
        let grouped = group_by_window(vec![at(0), at(4), at(6), at(10)], 5, |t| *t);

        assert_eq!(minutes_of(&grouped["2024-03-01-08-00"]), vec![0, 4]);
        assert_eq!(minutes_of(&grouped["2024-03-01-08-06"]), vec![6, 10]);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let grouped = group_by_window(vec![at(0), at(3), at(4)], 3, |t| *t);

        assert_eq!(minutes_of(&grouped["2024-03-01-08-00"]), vec![0, 3]);
        assert_eq!(minutes_of(&grouped["2024-03-01-08-04"]), vec![4]);
    }

    #[test]
    fn test_zero_window_gives_one_cluster_per_timestamp() {
        let grouped = group_by_window(vec![at(0), at(1), at(2), at(2)], 0, |t| *t);

        assert_eq!(grouped.len(), 3);
        assert_eq!(minutes_of(&grouped["2024-03-01-08-02"]), vec![2, 2]);
    }

    #[test]
    fn test_empty_input() {
        let grouped = group_by_window(Vec::<NaiveDateTime>::new(), 10, |t| *t);

        assert!(grouped.is_empty());
    }

    #[test]
    fn test_group_by_key_and_window() {
        let items = vec![
            ("sn1", at(0)),
            ("sn2", at(1)),
            ("sn1", at(2)),
            ("sn1", at(30)),
        ];

        let grouped = group_by_key_and_window(items, 20, |(sn, _)| *sn, |(_, t)| *t);

        assert_eq!(grouped["sn1"].len(), 2);
        assert_eq!(grouped["sn1"]["2024-03-01-08-00"].len(), 2);
        assert_eq!(grouped["sn1"]["2024-03-01-08-30"].len(), 1);
        assert_eq!(grouped["sn2"]["2024-03-01-08-01"].len(), 1);
    }

    #[test]
    fn test_settled_drops_recent_clusters() {
        let grouped = group_by_window(vec![at(0), at(2), at(40), at(45)], 10, |t| *t);

        let ready = settled(grouped, Duration::minutes(20), at(50), |t| *t);

        assert_eq!(ready.len(), 1);
        assert!(ready.contains_key("2024-03-01-08-00"));
    }

    #[test]
    fn test_settled_keeps_cluster_exactly_at_cutoff() {
        let grouped = group_by_window(vec![at(0)], 10, |t| *t);

        let ready = settled(grouped, Duration::minutes(20), at(20), |t| *t);

        assert_eq!(ready.len(), 1);
    }
}
