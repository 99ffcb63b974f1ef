//!
//! # 分卷模块
//! Splits a download target into size-bounded parts. Parts are never stored,
//! every request recomputes them from the same ordered target.
//!

use std::num::NonZeroU64;
use std::ops::Range;

use serde::Serialize;

use crate::archive::target::{ArchiveObject, DownloadTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivePart {
    /// 1-based
    pub index: usize,
    pub filename: String,
    /// Slice of the target's objects, in target order
    #[serde(skip)]
    pub range: Range<usize>,
    pub byte_size: u64,
    pub object_count: usize,
}

impl ArchivePart {
    pub fn objects<'a>(&self, target: &'a DownloadTarget) -> &'a [ArchiveObject] {
        &target.objects()[self.range.clone()]
    }
}

/// Walks the target once, closing a part whenever the next object would
/// overflow a non-empty part. An object larger than the threshold ends up
/// alone in its own part.
pub struct PartIterator<'a> {
    objects: &'a [ArchiveObject],
    chunk_size: u64,
    position: usize,
    iter_count: usize,
}

impl<'a> PartIterator<'a> {
    pub fn new(target: &'a DownloadTarget, chunk_size: NonZeroU64) -> Self {
        Self {
            objects: target.objects(),
            chunk_size: chunk_size.get(),
            position: 0,
            iter_count: 0,
        }
    }
}

impl Iterator for PartIterator<'_> {
    /// (index, range, byte size)
    type Item = (usize, Range<usize>, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.objects.len() {
            return None;
        }

        let start = self.position;
        let mut running = 0u64;

        // `running > 0` lets the first object in always, so a part is never empty
        while let Some(object) = self.objects.get(self.position) {
            if running > 0 && running.saturating_add(object.size) > self.chunk_size {
                break;
            }
            running = running.saturating_add(object.size);
            self.position += 1;
        }

        self.iter_count += 1;
        Some((self.iter_count, start..self.position, running))
    }
}

pub fn part_filename(base: &str, index: usize, count: usize) -> String {
    format!("{}-part-{}-of-{}.zip", base, index, count)
}

/// Every part of `target`, numbered from 1.
pub fn partition(target: &DownloadTarget, chunk_size: NonZeroU64, base_name: &str) -> Vec<ArchivePart> {
    let ranges: Vec<_> = PartIterator::new(target, chunk_size).collect();
    let count = ranges.len();

    ranges
        .into_iter()
        .map(|(index, range, byte_size)| ArchivePart {
            index,
            filename: part_filename(base_name, index, count),
            object_count: range.len(),
            range,
            byte_size,
        })
        .collect()
}

/// Recompute the partitioning and pick one part by its 1-based index
pub fn find_part(
    target: &DownloadTarget,
    chunk_size: NonZeroU64,
    base_name: &str,
    index: usize,
) -> Option<ArchivePart> {
    if index == 0 {
        return None;
    }

    partition(target, chunk_size, base_name).into_iter().nth(index - 1)
}
