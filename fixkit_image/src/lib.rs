pub mod file;
pub mod headers;
pub mod process;

pub mod scanner {
    pub use fixkit_scanner::*;
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use headers::read_headers;
use scanner::Pattern;

/// A module mapped into the current process, e.g. the game executable.
///
/// The memory is owned by the host process and only observed here. It is assumed to stay
/// mapped (and unchanged apart from our own patches) for as long as the value lives.
pub struct ModuleImage<'data> {
    name: String,
    path: Option<PathBuf>,
    memory: &'data [u8],
    timestamp: u32,
}

impl std::fmt::Debug for ModuleImage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImage")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &format_args!("{:#x}", self.size()))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl<'data> ModuleImage<'data> {
    /// Build a module from a mapped PE image. Size and timestamp are read from the headers
    /// at the start of `memory`, which is then truncated to `SizeOfImage`.
    pub fn from_memory(name: impl Into<String>, memory: &'data [u8]) -> Result<Self> {
        let headers = read_headers(memory).context("failed to read module headers")?;
        let size = (headers.size_of_image as usize).min(memory.len());
        Ok(Self {
            name: name.into(),
            path: None,
            memory: &memory[..size],
            timestamp: headers.timestamp,
        })
    }
    /// Build a module without looking at its headers.
    pub fn from_parts(name: impl Into<String>, memory: &'data [u8], timestamp: u32) -> Self {
        Self {
            name: name.into(),
            path: None,
            memory,
            timestamp,
        }
    }
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }
    pub fn size(&self) -> usize {
        self.memory.len()
    }
    /// `TimeDateStamp` of the PE file header. Only used to identify game builds in logs.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    pub fn memory(&self) -> &'data [u8] {
        self.memory
    }
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.base() + self.size()
    }
    /// Module relative offset of `address`
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        self.contains(address).then(|| address - self.base())
    }
    /// Address of the first match of `pattern` within the module
    pub fn scan(&self, pattern: &Pattern) -> Option<usize> {
        scanner::scan_first(pattern, self.base(), self.memory)
    }
}
