//! Loading a whole book: chapters, their segments and the global index.

use crate::archive::{Archive, EpubFile};
use crate::content::load_blocks;
use crate::error::{BookError, Result};
use crate::navigation::{ChapterDescriptor, resolve_chapters};
use crate::segment::{self, MAX_SEGMENT_UNITS};
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

/// A chapter and the segments cut from its blocks, in reading order.
#[derive(Debug, Clone)]
pub struct Chapter {
    pub descriptor: ChapterDescriptor,
    pub blobs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Book {
    pub chapters: Vec<Chapter>,
}

impl Book {
    pub fn open(path: &Path) -> Result<Self> {
        let mut archive = EpubFile::open(path)?;
        let book = Self::from_archive(&mut archive)?;
        info!(
            path = %path.display(),
            chapters = book.chapters.len(),
            segments = book.total_segments(),
            "Loaded book"
        );
        Ok(book)
    }

    /// Resolve, normalize and split every chapter. Any failure aborts the
    /// load; there is no partially loaded book.
    pub fn from_archive<A: Archive + ?Sized>(archive: &mut A) -> Result<Self> {
        let descriptors = resolve_chapters(archive)?;
        let mut chapters = Vec::with_capacity(descriptors.len());
        let mut next_index = 0usize;

        for descriptor in descriptors {
            let mut blobs = Vec::new();
            for block in load_blocks(archive, &descriptor)? {
                blobs.extend(segment::split(&block)?);
            }
            for (offset, blob) in blobs.iter().enumerate() {
                let len = segment::code_units(blob);
                if len >= MAX_SEGMENT_UNITS {
                    return Err(BookError::OversizedSegment {
                        index: next_index + offset,
                        len,
                        limit: MAX_SEGMENT_UNITS,
                    });
                }
            }
            debug!(
                chapter = %descriptor.label,
                first_index = next_index,
                segments = blobs.len(),
                "Segmented chapter"
            );
            next_index += blobs.len();
            chapters.push(Chapter { descriptor, blobs });
        }

        Ok(Self { chapters })
    }

    pub fn total_segments(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.blobs.len()).sum()
    }

    /// All segments flattened; position in the vector is the global index.
    pub fn segments(&self) -> Vec<&str> {
        self.chapters
            .iter()
            .flat_map(|chapter| chapter.blobs.iter().map(String::as_str))
            .collect()
    }

    /// Global index range of each chapter, parallel to `chapters`.
    pub fn chapter_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.chapters
            .iter()
            .map(|chapter| {
                let range = start..start + chapter.blobs.len();
                start = range.end;
                range
            })
            .collect()
    }

    /// Hash of the segment list. Changes whenever any global index would
    /// map to different text.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for segment in self.segments() {
            hasher.update(segment.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
