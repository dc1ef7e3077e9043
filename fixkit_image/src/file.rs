use anyhow::{bail, Result};
use object::{Object, ObjectSection, SectionKind};

use crate::headers::{read_headers, PeHeaders};
use crate::scanner::{self, Pattern};

/// A section of a PE file as it sits on disk, addressed by its virtual address
#[derive(Debug)]
pub struct FileSection<'data> {
    pub name: String,
    pub address: usize,
    pub kind: SectionKind,
    pub data: &'data [u8],
}

impl FileSection<'_> {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address && address < self.address + self.data.len()
    }
}

/// An executable read from disk rather than mapped into a process. Used for checking
/// signatures against a game build offline.
#[derive(Debug)]
pub struct ImageFile<'data> {
    pub headers: PeHeaders,
    pub sections: Vec<FileSection<'data>>,
}

impl<'data> ImageFile<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let headers = read_headers(data)?;
        let object = object::File::parse(data)?;
        if !matches!(object, object::File::Pe64(_)) {
            bail!("not a PE32+ image");
        }

        let sections = object
            .sections()
            .map(|s| {
                Ok(FileSection {
                    name: s.name()?.to_string(),
                    address: s.address() as usize,
                    kind: s.kind(),
                    data: s.data()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { headers, sections })
    }
    pub fn image_base(&self) -> usize {
        self.headers.image_base as usize
    }
    pub fn timestamp(&self) -> u32 {
        self.headers.timestamp
    }
    pub fn rva(&self, address: usize) -> usize {
        address - self.image_base()
    }
    pub fn executable_sections(&self) -> impl Iterator<Item = &FileSection<'data>> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Text)
    }
    pub fn section_containing(&self, address: usize) -> Option<&FileSection<'data>> {
        self.sections.iter().find(|s| s.contains(address))
    }
    /// Every match of every pattern across the executable sections, as virtual addresses
    pub fn scan_all(&self, patterns: &[&Pattern]) -> Vec<Vec<usize>> {
        let mut results = vec![vec![]; patterns.len()];
        for section in self.executable_sections() {
            let found = scanner::scan_pattern(patterns, section.address, section.data);
            for (all, section_results) in results.iter_mut().zip(found) {
                all.extend(section_results);
            }
        }
        for r in &mut results {
            r.sort();
        }
        results
    }
}
