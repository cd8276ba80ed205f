use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, SensorError};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u8 = 1;

const ELF32_EHDR_SIZE: usize = 52;
const ELF64_EHDR_SIZE: usize = 64;
const E_TYPE_OFFSET: usize = 16;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// ELF object kind, from the header's e_type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinKind {
    Executable,
    SharedObject,
    Other,
}

/// Properties of a file recognized as an ELF binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinProps {
    pub kind: BinKind,
}

impl BinProps {
    pub fn is_exe(&self) -> bool {
        self.kind == BinKind::Executable
    }

    pub fn is_so(&self) -> bool {
        self.kind == BinKind::SharedObject
    }
}

/// Classify a file by its ELF header.
///
/// Returns `Ok(None)` for anything that does not start with the ELF magic,
/// including files shorter than the magic itself. A file with the magic but
/// an unusable header is a `MalformedElf` error.
pub fn detect(path: &Path) -> Result<Option<BinProps>> {
    let mut file = File::open(path).map_err(|e| SensorError::io(path, e))?;

    let mut header = Vec::with_capacity(ELF64_EHDR_SIZE);
    (&mut file)
        .take(ELF64_EHDR_SIZE as u64)
        .read_to_end(&mut header)
        .map_err(|e| SensorError::io(path, e))?;

    parse_header(path, &header)
}

/// Classify an in-memory header prefix
pub fn parse_header(path: &Path, header: &[u8]) -> Result<Option<BinProps>> {
    if header.len() < ELF_MAGIC.len() || header[..ELF_MAGIC.len()] != ELF_MAGIC {
        return Ok(None);
    }

    let malformed = |reason: &str| SensorError::MalformedElf {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if header.len() <= EI_VERSION {
        return Err(malformed("truncated identification"));
    }

    let required = match header[EI_CLASS] {
        ELFCLASS32 => ELF32_EHDR_SIZE,
        ELFCLASS64 => ELF64_EHDR_SIZE,
        other => return Err(malformed(&format!("invalid class {}", other))),
    };

    let big_endian = match header[EI_DATA] {
        ELFDATA2LSB => false,
        ELFDATA2MSB => true,
        other => return Err(malformed(&format!("invalid data encoding {}", other))),
    };

    if header[EI_VERSION] != EV_CURRENT {
        return Err(malformed(&format!("invalid version {}", header[EI_VERSION])));
    }

    if header.len() < required {
        return Err(malformed(&format!(
            "header is {} bytes, expected {}",
            header.len(),
            required
        )));
    }

    let raw = [header[E_TYPE_OFFSET], header[E_TYPE_OFFSET + 1]];
    let e_type = if big_endian {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    };

    let kind = match e_type {
        ET_EXEC => BinKind::Executable,
        ET_DYN => BinKind::SharedObject,
        _ => BinKind::Other,
    };

    Ok(Some(BinProps { kind }))
}

/// Build a minimal ELF header for tests
#[cfg(test)]
pub(crate) fn elf_header(class64: bool, big_endian: bool, e_type: u16) -> Vec<u8> {
    use crate::constants::test::{ELF32_HEADER_SIZE, ELF64_HEADER_SIZE};

    let size = if class64 { ELF64_HEADER_SIZE } else { ELF32_HEADER_SIZE };
    let mut header = vec![0u8; size];
    header[..4].copy_from_slice(&ELF_MAGIC);
    header[EI_CLASS] = if class64 { ELFCLASS64 } else { ELFCLASS32 };
    header[EI_DATA] = if big_endian { ELFDATA2MSB } else { ELFDATA2LSB };
    header[EI_VERSION] = EV_CURRENT;
    let bytes = if big_endian {
        e_type.to_be_bytes()
    } else {
        e_type.to_le_bytes()
    };
    header[E_TYPE_OFFSET..E_TYPE_OFFSET + 2].copy_from_slice(&bytes);
    header
}
