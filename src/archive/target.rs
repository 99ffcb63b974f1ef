//!
//! # 下载目标
//! The resolved, ordered list of storage objects a download includes.
//!

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored photo as it will appear inside the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveObject {
    pub id: u64,
    /// Entry name inside the archive
    pub name: String,
    pub storage_key: String,
    pub size: u64,
}

/// Which logical collection a download asks for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSelector {
    Gallery { gallery_id: u64 },
    Folder { gallery_id: u64, folder_id: u64 },
    Liked { gallery_id: u64, client_id: String },
    Favorited { gallery_id: u64, client_id: String },
}

impl DownloadSelector {
    pub fn gallery_id(&self) -> u64 {
        match self {
            DownloadSelector::Gallery { gallery_id }
            | DownloadSelector::Folder { gallery_id, .. }
            | DownloadSelector::Liked { gallery_id, .. }
            | DownloadSelector::Favorited { gallery_id, .. } => *gallery_id,
        }
    }
}

/// Objects sorted by id with unique entry names.
///
/// Ordering only depends on the object set, so a manifest and a later part
/// fetch computed from the same set agree on part boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadTarget {
    objects: Vec<ArchiveObject>,
}

impl DownloadTarget {
    pub fn new(mut objects: Vec<ArchiveObject>) -> Self {
        objects.sort_by_key(|object| object.id);
        dedupe_names(&mut objects);

        Self { objects }
    }

    pub fn objects(&self) -> &[ArchiveObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.objects
            .iter()
            .fold(0u64, |total, object| total.saturating_add(object.size))
    }
}

/// What the target resolver hands back for a selector
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub target: DownloadTarget,
    /// Archive file name without the `.zip` extension
    pub archive_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedTarget {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// `a.jpg`, `a.jpg` becomes `a.jpg`, `a (1).jpg`
fn dedupe_names(objects: &mut [ArchiveObject]) {
    let mut seen = HashSet::with_capacity(objects.len());

    for object in objects.iter_mut() {
        if seen.insert(object.name.clone()) {
            continue;
        }

        let (stem, ext) = match object.name.rfind('.') {
            Some(pos) if pos > 0 => object.name.split_at(pos),
            _ => (object.name.as_str(), ""),
        };

        let mut n = 1;
        let renamed = loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            if !seen.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };

        seen.insert(renamed.clone());
        object.name = renamed;
    }
}

#[cfg(test)]
pub(crate) fn object(id: u64, name: &str, size: u64) -> ArchiveObject {
    ArchiveObject {
        id,
        name: name.to_string(),
        storage_key: format!("photos/{}", id),
        size,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn should_sort_by_id() {
        let target = DownloadTarget::new(vec![
            object(3, "c.jpg", 1),
            object(1, "a.jpg", 1),
            object(2, "b.jpg", 1),
        ]);

        let ids: Vec<u64> = target.objects().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(target.total_size(), 3);
    }

    #[test]
    fn should_dedupe_entry_names() {
        let target = DownloadTarget::new(vec![
            object(1, "a.jpg", 1),
            object(2, "a.jpg", 1),
            object(3, "a (1).jpg", 1),
            object(4, "README", 1),
            object(5, "README", 1),
        ]);

        let names: Vec<&str> = target.objects().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "a (1).jpg", "a (1) (1).jpg", "README", "README (1)"]);
    }

    #[test]
    fn should_report_expiry() {
        let now = Utc::now();
        let mut resolved = ResolvedTarget {
            target: DownloadTarget::default(),
            archive_name: "g".into(),
            expires_at: None,
        };
        assert!(!resolved.is_expired(now));

        resolved.expires_at = Some(now - Duration::seconds(1));
        assert!(resolved.is_expired(now));

        resolved.expires_at = Some(now + Duration::hours(1));
        assert!(!resolved.is_expired(now));
    }

    #[test]
    fn should_saturate_total_size() {
        let target = DownloadTarget::new(vec![object(1, "a.jpg", u64::MAX), object(2, "b.jpg", 1)]);
        assert_eq!(target.total_size(), u64::MAX);
    }
}
