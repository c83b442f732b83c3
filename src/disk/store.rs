use std::{
    io::{Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
    sync::RwLock,
};
use super::{DiskError, Result};

// The torrent's files opened for writing, viewed as one contiguous byte
// range. Pieces land at their torrent offset, crossing file boundaries
// where they must.
#[derive(Debug)]
pub struct FileStore {
    files: Vec<FileSlot>,
}

#[derive(Debug)]
struct FileSlot {

    len: usize,

    // Offset from the start of the torrent.
    offset: usize,

    handle: RwLock<std::fs::File>,

}

impl FileSlot {
    fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.len)
    }
}

impl FileStore {

    pub fn new(files: &[(PathBuf, u64)], root: &Path) -> Result<Self> {

        if !root.is_dir() {
            std::fs::create_dir_all(root)?;
            tracing::info!("created output directory: {:?}", root);
        }

        let mut slots = Vec::with_capacity(files.len());
        let mut offset = 0;
        for (path, len) in files {
            if let Some(subdir) = path.parent() {
                if subdir != Path::new("") && !root.join(subdir).exists() {
                    std::fs::create_dir_all(root.join(subdir))?;
                }
            }
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(root.join(path))?;
            tracing::info!("opened file: {:?}", root.join(path));
            slots.push(FileSlot {
                len: *len as usize,
                offset,
                handle: RwLock::new(handle),
            });
            offset += *len as usize;
        }

        Ok(Self { files: slots })
    }

    // Writes a verified piece at its offset within the torrent. Called
    // exactly once per piece.
    pub fn write_piece(&self, piece_offset: usize, data: &[u8]) -> Result<()> {

        let range = self.intersecting(piece_offset, data.len())?;
        let mut total_offset = piece_offset;
        let mut written = 0;

        for slot in &self.files[range] {
            let file_offset = total_offset - slot.offset;
            let n = (data.len() - written).min(slot.len - file_offset);

            let mut f = slot.handle.write()?;
            f.seek(SeekFrom::Start(file_offset as u64))?;
            f.write_all(&data[written..written + n])?;

            written += n;
            total_offset += n;
        }

        if written != data.len() {
            return Err(DiskError::IoSize {
                expected: data.len(),
                actual: written,
            });
        }

        Ok(())
    }

    // Indices of the files a byte range overlaps.
    fn intersecting(&self, offset: usize, len: usize) -> Result<Range<usize>> {

        if self.files.len() == 1 {
            return Ok(0..1);
        }
        let end = offset + len - 1;

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .ok_or(DiskError::IoSize { expected: offset, actual: 0 })?;

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&end))
            .map(|i| start_file + i)
            .ok_or(DiskError::IoSize { expected: end, actual: 0 })?;

        Ok(start_file..(end_file + 1))
    }
}
