//! The random-access output abstraction and the piece list that drives the
//! write phase. Every piece knows its absolute file offset; emission seeks
//! and writes in ascending-offset order.

use crate::builder::CodePayload;
use crate::error::Context;
use crate::error::Result;
use std::borrow::Cow;
use std::fs::File;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Random-access sink the image is written to.
pub trait Output {
    fn seek(&mut self, offset: u64) -> Result;
    fn write_all(&mut self, data: &[u8]) -> Result;
    /// Path of the image; its basename becomes the SONAME.
    fn path(&self) -> &Path;
}

/// [`Output`] backed by a file on disk.
pub struct FileOutput {
    file: File,
    path: PathBuf,
}

impl FileOutput {
    pub fn create(path: impl Into<PathBuf>) -> Result<FileOutput> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("failed to create `{}`", path.display()))?;
        Ok(FileOutput { file, path })
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl Output for FileOutput {
    fn seek(&mut self, offset: u64) -> Result {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result {
        self.file.write_all(data)?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// One range of the output file.
pub(crate) enum FilePiece<'a> {
    /// Bytes already materialized in memory.
    Memory {
        name: Cow<'a, str>,
        offset: u64,
        data: Cow<'a, [u8]>,
    },
    /// The code payload streams `.rodata` and `.text` itself, in one
    /// contiguous write starting at `offset`.
    Payload { offset: u64, size: u64 },
}

impl FilePiece<'_> {
    fn name(&self) -> &str {
        match self {
            FilePiece::Memory { name, .. } => name,
            FilePiece::Payload { .. } => ".rodata",
        }
    }

    fn offset(&self) -> u64 {
        match self {
            FilePiece::Memory { offset, .. } | FilePiece::Payload { offset, .. } => *offset,
        }
    }

    fn size(&self) -> u64 {
        match self {
            FilePiece::Memory { data, .. } => data.len() as u64,
            FilePiece::Payload { size, .. } => *size,
        }
    }
}

/// Streams all pieces to `out`. A failure reports the piece that hit it and
/// leaves the partially-written file in place for the caller to discard.
pub(crate) fn write_pieces(
    out: &mut dyn Output,
    payload: &mut dyn CodePayload,
    mut pieces: Vec<FilePiece>,
) -> Result {
    pieces.sort_by_key(FilePiece::offset);

    if cfg!(debug_assertions) {
        let mut end = 0u64;
        let mut prev = "";
        for piece in pieces.iter().filter(|piece| piece.size() != 0) {
            assert!(
                piece.offset() >= end,
                "file piece {} overlaps {prev}",
                piece.name()
            );
            end = piece.offset() + piece.size();
            prev = piece.name();
        }
    }

    let path = out.path().to_owned();
    for piece in &pieces {
        out.seek(piece.offset()).with_context(|| {
            format!(
                "failed to seek to {} at offset {:#x} in `{}`",
                piece.name(),
                piece.offset(),
                path.display()
            )
        })?;
        match piece {
            FilePiece::Memory { name, data, .. } => {
                out.write_all(data)
                    .with_context(|| format!("failed to write {name} to `{}`", path.display()))?;
            }
            FilePiece::Payload { offset, .. } => {
                payload.set_code_offset(*offset);
                payload.write(out).with_context(|| {
                    format!("failed to write .rodata and .text to `{}`", path.display())
                })?;
            }
        }
    }
    Ok(())
}
