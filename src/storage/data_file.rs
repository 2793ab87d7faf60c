use crate::error::{TsdbError, TsdbResult};
use crate::storage::page::{PageOnDisk, HEADER_RECORD_SIZE};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Initial allocation of a fresh data file, in pages. Files double via
/// ftruncate + remap until they reach the configured page count.
const INITIAL_PAGES: usize = 64;

pub fn data_file_name(id: u32) -> String {
    format!("data.{id}")
}

pub fn header_file_name(id: u32) -> String {
    format!("header.{id}")
}

/// One `data.<N>` file of back-to-back pages plus its `header.<N>` sidecar
/// of fixed-size [`PageOnDisk`] records, both memory-mapped read-write.
pub struct PageFile {
    pub id: u32,
    data_path: PathBuf,
    data_file: File,
    header_file: File,
    data: MmapMut,
    header: MmapMut,
    page_size: usize,
    capacity_pages: usize,
    allocated_pages: usize,
    used_pages: usize,
}

impl PageFile {
    pub fn create(dir: &Path, id: u32, page_size: usize, capacity_pages: usize) -> TsdbResult<PageFile> {
        let data_path = dir.join(data_file_name(id));
        let header_path = dir.join(header_file_name(id));

        // truncate: a file left behind by a crash before its first
        // placement reached the meta log is unreferenced and safe to reuse
        let allocated_pages = INITIAL_PAGES.min(capacity_pages);
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        data_file.set_len((allocated_pages * page_size) as u64)?;

        let header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&header_path)?;
        header_file.set_len((capacity_pages * HEADER_RECORD_SIZE) as u64)?;

        let data = unsafe { MmapMut::map_mut(&data_file)? };
        let header = unsafe { MmapMut::map_mut(&header_file)? };

        debug!(file = %data_path.display(), allocated_pages, "created page file");

        Ok(PageFile {
            id,
            data_path,
            data_file,
            header_file,
            data,
            header,
            page_size,
            capacity_pages,
            allocated_pages,
            used_pages: 0,
        })
    }

    pub fn open(dir: &Path, id: u32, page_size: usize, capacity_pages: usize) -> TsdbResult<PageFile> {
        let data_path = dir.join(data_file_name(id));
        let header_path = dir.join(header_file_name(id));

        let data_file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let header_file = OpenOptions::new().read(true).write(true).open(&header_path)?;

        let data_len = data_file.metadata()?.len() as usize;
        if data_len % page_size != 0 {
            return Err(TsdbError::Fatal(format!(
                "{}: size {} is not a multiple of the page size",
                data_path.display(),
                data_len
            )));
        }
        let allocated_pages = data_len / page_size;

        let data = unsafe { MmapMut::map_mut(&data_file)? };
        let header = unsafe { MmapMut::map_mut(&header_file)? };

        // the highest flushed header slot bounds the used region
        let mut used_pages = 0;
        for index in 0..allocated_pages {
            let slot = &header[index * HEADER_RECORD_SIZE..(index + 1) * HEADER_RECORD_SIZE];
            if PageOnDisk::parse(slot).is_some() {
                used_pages = index + 1;
            }
        }

        Ok(PageFile {
            id,
            data_path,
            data_file,
            header_file,
            data,
            header,
            page_size,
            capacity_pages,
            allocated_pages,
            used_pages,
        })
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub fn is_full(&self) -> bool {
        self.used_pages >= self.capacity_pages
    }

    /// Allocate the next page slot. Returns the page index and whether the
    /// mapping moved (in which case the caller must rebase every open page
    /// of this file). `None` when the file is at capacity.
    pub fn alloc_page(&mut self) -> TsdbResult<Option<(u32, bool)>> {
        if self.is_full() {
            return Ok(None);
        }
        let mut remapped = false;
        if self.used_pages == self.allocated_pages {
            let grown = (self.allocated_pages * 2).min(self.capacity_pages);
            self.data_file.set_len((grown * self.page_size) as u64)?;
            self.data = unsafe { MmapMut::map_mut(&self.data_file)? };
            debug!(
                file = %self.data_path.display(),
                pages = grown,
                "grew page file"
            );
            self.allocated_pages = grown;
            remapped = true;
        }
        let index = self.used_pages as u32;
        self.used_pages += 1;
        Ok(Some((index, remapped)))
    }

    /// Claim a specific slot during replay, so allocation resumes after the
    /// highest placed page.
    pub fn note_used(&mut self, page_index: u32) {
        self.used_pages = self.used_pages.max(page_index as usize + 1);
    }

    pub fn page_ptr(&self, page_index: u32) -> *mut u8 {
        debug_assert!((page_index as usize) < self.allocated_pages);
        unsafe { self.data.as_ptr().add(page_index as usize * self.page_size) as *mut u8 }
    }

    pub fn header_slot_mut(&self, page_index: u32) -> &mut [u8] {
        let at = page_index as usize * HEADER_RECORD_SIZE;
        debug_assert!(at + HEADER_RECORD_SIZE <= self.header.len());
        unsafe {
            std::slice::from_raw_parts_mut(self.header.as_ptr().add(at) as *mut u8, HEADER_RECORD_SIZE)
        }
    }

    pub fn read_header(&self, page_index: u32) -> Option<PageOnDisk> {
        let at = page_index as usize * HEADER_RECORD_SIZE;
        PageOnDisk::parse(&self.header[at..at + HEADER_RECORD_SIZE])
    }

    /// msync both mappings.
    pub fn sync(&self) -> TsdbResult<()> {
        self.data.flush()?;
        self.header.flush()?;
        Ok(())
    }
}

/// Read-only view of a page file, used to serve queries from archived
/// buckets without re-opening them for writes.
pub struct PageFileReader {
    pub id: u32,
    data: Mmap,
    header: Mmap,
    page_size: usize,
}

impl PageFileReader {
    pub fn open(dir: &Path, id: u32, page_size: usize) -> TsdbResult<PageFileReader> {
        let data_file = File::open(dir.join(data_file_name(id)))?;
        let header_file = File::open(dir.join(header_file_name(id)))?;
        let data = unsafe { Mmap::map(&data_file)? };
        let header = unsafe { Mmap::map(&header_file)? };
        Ok(PageFileReader {
            id,
            data,
            header,
            page_size,
        })
    }

    pub fn read_header(&self, page_index: u32) -> Option<PageOnDisk> {
        let at = page_index as usize * HEADER_RECORD_SIZE;
        if at + HEADER_RECORD_SIZE > self.header.len() {
            return None;
        }
        PageOnDisk::parse(&self.header[at..at + HEADER_RECORD_SIZE])
    }

    pub fn page_ptr(&self, page_index: u32) -> *mut u8 {
        debug_assert!((page_index as usize + 1) * self.page_size <= self.data.len());
        unsafe { self.data.as_ptr().add(page_index as usize * self.page_size) as *mut u8 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compress::CompressorPosition;

    #[test]
    fn create_alloc_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = PageFile::create(dir.path(), 0, 512, 256).unwrap();

        let (first, remapped) = file.alloc_page().unwrap().unwrap();
        assert_eq!(first, 0);
        assert!(!remapped);

        // write something through the page pointer and flush a header
        unsafe { *file.page_ptr(first) = 0xAB };
        let header = PageOnDisk {
            series: 3,
            start_ts: 77,
            position: CompressorPosition { offset: 1, start: 0 },
            version: 0,
            is_ooo: false,
            is_full: false,
            dp_count: 1,
        };
        header.write(file.header_slot_mut(first));
        file.sync().unwrap();
        drop(file);

        let reopened = PageFile::open(dir.path(), 0, 512, 256).unwrap();
        assert_eq!(reopened.used_pages(), 1);
        assert_eq!(reopened.read_header(0), Some(header));
        assert_eq!(unsafe { *reopened.page_ptr(0) }, 0xAB);
    }

    #[test]
    fn growth_remaps_once_past_initial_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = PageFile::create(dir.path(), 1, 128, 256).unwrap();
        let mut saw_remap = false;
        for i in 0..(INITIAL_PAGES + 1) {
            let (index, remapped) = file.alloc_page().unwrap().unwrap();
            assert_eq!(index as usize, i);
            if remapped {
                saw_remap = true;
                assert_eq!(i, INITIAL_PAGES);
            }
        }
        assert!(saw_remap);
    }

    #[test]
    fn capacity_exhaustion_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = PageFile::create(dir.path(), 2, 128, 4).unwrap();
        for _ in 0..4 {
            assert!(file.alloc_page().unwrap().is_some());
        }
        assert!(file.alloc_page().unwrap().is_none());
        assert!(file.is_full());
    }
}
