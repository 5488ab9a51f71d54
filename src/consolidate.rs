//! Joining per-segment audio into one file per chapter.
//!
//! Runs only after the whole book has been transcribed. Each chapter's
//! `{index}.wav` files are appended into `chapter-{n:03}.wav`, and a
//! `chapter-{n:03}.txt` concat list naming the same files in order is
//! written next to it for external encoders.

use crate::error::ConsolidateError;
use crate::runner::{segment_file_name, segment_path};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, ConsolidateError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterAudio {
    /// 1-based chapter number used in the file names.
    pub number: usize,
    pub wav: PathBuf,
    pub concat_list: PathBuf,
    pub segments: usize,
}

pub fn chapter_wav_name(number: usize) -> String {
    format!("chapter-{number:03}.wav")
}

pub fn chapter_list_name(number: usize) -> String {
    format!("chapter-{number:03}.txt")
}

/// Join every chapter in `ranges` (global index ranges in chapter order).
/// Chapters without segments produce no files.
pub fn consolidate(destination: &Path, ranges: &[Range<usize>]) -> Result<Vec<ChapterAudio>> {
    let mut written = Vec::new();
    for (offset, range) in ranges.iter().enumerate() {
        let number = offset + 1;
        if range.is_empty() {
            debug!(number, "Skipping chapter without segments");
            continue;
        }
        written.push(join_chapter(destination, number, range.clone())?);
    }
    info!(
        destination = %destination.display(),
        chapters = written.len(),
        "Consolidated chapter audio"
    );
    Ok(written)
}

fn join_chapter(destination: &Path, number: usize, range: Range<usize>) -> Result<ChapterAudio> {
    let sources: Vec<PathBuf> = range
        .clone()
        .map(|index| segment_path(destination, index))
        .collect();
    if let Some(missing) = sources.iter().find(|path| !path.is_file()) {
        return Err(ConsolidateError::MissingSegment {
            path: missing.clone(),
        });
    }

    let wav = destination.join(chapter_wav_name(number));
    let temp = destination.join(format!(".{}.tmp", chapter_wav_name(number)));
    let spec = open_reader(&sources[0])?.spec();
    let mut writer = WavWriter::create(&temp, spec).map_err(|source| ConsolidateError::Wav {
        path: temp.clone(),
        source,
    })?;

    for path in &sources {
        let reader = open_reader(path)?;
        if reader.spec() != spec {
            drop(writer);
            let _ = fs::remove_file(&temp);
            return Err(ConsolidateError::SpecMismatch { path: path.clone() });
        }
        if let Err(err) = append_samples(reader, &mut writer, spec, path) {
            drop(writer);
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
    }
    writer.finalize().map_err(|source| ConsolidateError::Wav {
        path: temp.clone(),
        source,
    })?;
    fs::rename(&temp, &wav).map_err(|source| ConsolidateError::Io {
        path: wav.clone(),
        source,
    })?;

    let concat_list = destination.join(chapter_list_name(number));
    let listing: String = range
        .clone()
        .map(|index| format!("file '{}'\n", segment_file_name(index)))
        .collect();
    fs::write(&concat_list, listing).map_err(|source| ConsolidateError::Io {
        path: concat_list.clone(),
        source,
    })?;

    debug!(number, segments = sources.len(), wav = %wav.display(), "Joined chapter");
    Ok(ChapterAudio {
        number,
        wav,
        concat_list,
        segments: sources.len(),
    })
}

fn open_reader(path: &Path) -> Result<WavReader<std::io::BufReader<fs::File>>> {
    WavReader::open(path).map_err(|source| ConsolidateError::Wav {
        path: path.to_path_buf(),
        source,
    })
}

fn append_samples<R: std::io::Read, W: std::io::Write + std::io::Seek>(
    mut reader: WavReader<R>,
    writer: &mut WavWriter<W>,
    spec: WavSpec,
    path: &Path,
) -> Result<()> {
    let wav_err = |source| ConsolidateError::Wav {
        path: path.to_path_buf(),
        source,
    };
    match spec.sample_format {
        SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                writer.write_sample(sample.map_err(wav_err)?).map_err(wav_err)?;
            }
        }
        SampleFormat::Int => {
            for sample in reader.samples::<i32>() {
                writer.write_sample(sample.map_err(wav_err)?).map_err(wav_err)?;
            }
        }
    }
    Ok(())
}
