use anyhow::{bail, Result};
use object::pe::{ImageDosHeader, ImageNtHeaders64, IMAGE_FILE_MACHINE_AMD64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

/// The handful of PE header fields we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeHeaders {
    pub machine: u16,
    pub timestamp: u32,
    pub image_base: u64,
    pub size_of_image: u32,
}

/// Read the DOS and NT headers at the start of `data`. Works for both a file on disk and a
/// mapped image since the headers are laid out identically.
pub fn read_headers(data: &[u8]) -> Result<PeHeaders> {
    let dos_header = ImageDosHeader::parse(data)?;
    let mut offset = dos_header.nt_headers_offset().into();
    let (nt_headers, _) = ImageNtHeaders64::parse(data, &mut offset)?;

    let file_header = nt_headers.file_header();
    let machine = file_header.machine.get(LE);
    if machine != IMAGE_FILE_MACHINE_AMD64 {
        bail!("unsupported machine type {machine:#x}");
    }
    let optional_header = nt_headers.optional_header();

    Ok(PeHeaders {
        machine,
        timestamp: file_header.time_date_stamp.get(LE),
        image_base: optional_header.image_base(),
        size_of_image: optional_header.size_of_image(),
    })
}
