use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ReleaseRef;

/// Where a flight module came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Normalised module URL (`file://...` for local paths).
    #[serde(rename = "ref")]
    pub reference: String,
    /// SHA-256 hex of the module bytes.
    pub checksum: String,
}

/// Immutable snapshot metadata of one applied resource set.
///
/// The resource payload itself is loaded separately from the revision store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: u64,
    pub release: ReleaseRef,
    /// Name of the cluster object holding this revision.
    pub object_name: String,
    pub source: Source,
    pub created_at: DateTime<Utc>,
    pub active_at: DateTime<Utc>,
    pub resources: usize,
}

/// History of one release ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub release: ReleaseRef,
    pub revisions: Vec<Revision>,
}

impl History {
    pub fn new(release: ReleaseRef, mut revisions: Vec<Revision>) -> Self {
        revisions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self { release, revisions }
    }

    pub fn is_empty(&self) -> bool { self.revisions.is_empty() }

    /// Most recently activated revision; ties go to the higher id.
    pub fn active(&self) -> Option<&Revision> {
        self.revisions.iter().max_by(|a, b| a.active_at.cmp(&b.active_at).then(a.id.cmp(&b.id)))
    }

    pub fn get(&self, id: u64) -> Option<&Revision> { self.revisions.iter().find(|r| r.id == id) }

    /// Ids stay stable when older revisions are capped away.
    pub fn next_id(&self) -> u64 { self.revisions.iter().map(|r| r.id).max().unwrap_or(0) + 1 }

    /// Oldest revisions beyond `cap`, never including the active one.
    pub fn beyond_cap(&self, cap: usize) -> Vec<&Revision> {
        if cap == 0 || self.revisions.len() <= cap {
            return Vec::new();
        }
        let active = self.active().map(|r| r.id);
        let excess = self.revisions.len() - cap;
        self.revisions.iter().filter(|r| Some(r.id) != active).take(excess).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rev(id: u64, created: i64, active: i64) -> Revision {
        Revision {
            id,
            release: ReleaseRef::new("r", "ns"),
            object_name: format!("obj-{}", id),
            source: Source::default(),
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            active_at: Utc.timestamp_opt(active, 0).unwrap(),
            resources: 1,
        }
    }

    #[test]
    fn active_is_latest_activation() {
        let h = History::new(ReleaseRef::new("r", "ns"), vec![rev(2, 20, 20), rev(1, 10, 30)]);
        assert_eq!(h.revisions[0].id, 1);
        assert_eq!(h.active().unwrap().id, 1);
        assert_eq!(h.next_id(), 3);
        assert_eq!(h.get(2).unwrap().object_name, "obj-2");
    }

    #[test]
    fn cap_keeps_active_and_newest() {
        let h = History::new(ReleaseRef::new("r", "ns"), vec![rev(1, 1, 50), rev(2, 2, 2), rev(3, 3, 3), rev(4, 4, 4)]);
        let ids: Vec<_> = h.beyond_cap(2).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(h.beyond_cap(0).is_empty());
        assert!(h.beyond_cap(10).is_empty());
    }
}
