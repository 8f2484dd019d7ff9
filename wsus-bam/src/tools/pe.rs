//! Minimal PE/COFF header reader.
//!
//! Reads just enough of an image to decide whether it is a well-formed
//! executable and to recover the CodeView (RSDS) record that keys its PDB on
//! a symbol server.

use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;

use super::traits::BinaryValidator;
use crate::utils::fs::io_error;
use crate::{Error, Result};

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const RSDS_SIGNATURE: &[u8; 4] = b"RSDS";

const COFF_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;
const DEBUG_ENTRY_LEN: usize = 28;

const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

const IMAGE_FILE_DLL: u16 = 0x2000;
const IMAGE_SUBSYSTEM_NATIVE: u16 = 1;
const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;

/// Largest PDB path accepted from a CodeView record.
const MAX_PDB_NAME: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Executable,
    Dll,
    Driver,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Executable => "exe",
            ImageKind::Dll => "dll",
            ImageKind::Driver => "driver",
        }
    }
}

/// CodeView RSDS debug record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeView {
    pub guid: [u8; 16],
    pub age: u32,
    /// PDB file name (directory components stripped).
    pub pdb_name: String,
}

impl CodeView {
    /// Symbol-server key: GUID in registry order, uppercase hex, then the age
    /// in hex without padding.
    pub fn signature(&self) -> String {
        let g = &self.guid;
        let data1 = u32::from_le_bytes([g[0], g[1], g[2], g[3]]);
        let data2 = u16::from_le_bytes([g[4], g[5]]);
        let data3 = u16::from_le_bytes([g[6], g[7]]);

        let mut sig = format!("{:08X}{:04X}{:04X}", data1, data2, data3);
        for b in &g[8..] {
            let _ = write!(sig, "{:02X}", b);
        }
        let _ = write!(sig, "{:X}", self.age);
        sig
    }
}

/// Header facts of a validated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeImage {
    pub machine: u16,
    pub timestamp: u32,
    pub characteristics: u16,
    pub kind: ImageKind,
    pub pe32_plus: bool,
    pub size_of_image: u32,
    pub codeview: Option<CodeView>,
}

impl PeImage {
    pub fn machine_name(&self) -> &'static str {
        match self.machine {
            0x014c => "x86",
            0x8664 => "x64",
            0x01c4 => "arm",
            0xaa64 => "arm64",
            0x0200 => "ia64",
            _ => "unknown",
        }
    }
}

/// Why a buffer is not a usable PE image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeError(pub String);

impl std::fmt::Display for PeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn malformed(msg: impl Into<String>) -> PeError {
    PeError(msg.into())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn slice(&self, offset: usize, len: usize) -> std::result::Result<&'a [u8], PeError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| malformed(format!("truncated at offset {:#x}", offset)))
    }

    fn u16(&self, offset: usize) -> std::result::Result<u16, PeError> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> std::result::Result<u32, PeError> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_pointer: u32,
}

fn rva_to_offset(sections: &[Section], rva: u32) -> Option<usize> {
    sections.iter().find_map(|s| {
        let span = s.virtual_size.max(s.raw_size);
        let end = s.virtual_address.checked_add(span)?;
        if rva >= s.virtual_address && rva < end {
            let delta = rva - s.virtual_address;
            if delta < s.raw_size {
                return Some(s.raw_pointer as usize + delta as usize);
            }
        }
        None
    })
}

/// Parse PE headers out of `bytes`.
pub fn parse(bytes: &[u8]) -> std::result::Result<PeImage, PeError> {
    let r = Reader { bytes };

    if r.slice(0, 2)? != DOS_MAGIC {
        return Err(malformed("missing MZ header"));
    }
    let pe_offset = r.u32(0x3c)? as usize;
    if r.slice(pe_offset, 4)? != PE_SIGNATURE {
        return Err(malformed("missing PE signature"));
    }

    let coff = pe_offset + 4;
    let machine = r.u16(coff)?;
    let section_count = r.u16(coff + 2)? as usize;
    let timestamp = r.u32(coff + 4)?;
    let optional_len = r.u16(coff + 16)? as usize;
    let characteristics = r.u16(coff + 18)?;

    let opt = coff + COFF_HEADER_LEN;
    let magic = r.u16(opt)?;
    let (pe32_plus, dirs_count_at, dirs_at) = match magic {
        PE32_MAGIC => (false, opt + 92, opt + 96),
        PE32_PLUS_MAGIC => (true, opt + 108, opt + 112),
        other => return Err(malformed(format!("unknown optional header magic {:#x}", other))),
    };
    let size_of_image = r.u32(opt + 56)?;
    let subsystem = r.u16(opt + 68)?;
    let dir_count = r.u32(dirs_count_at)? as usize;

    let sections_at = opt + optional_len;
    let mut sections = Vec::with_capacity(section_count);
    for i in 0..section_count {
        let s = sections_at + i * SECTION_HEADER_LEN;
        sections.push(Section {
            virtual_size: r.u32(s + 8)?,
            virtual_address: r.u32(s + 12)?,
            raw_size: r.u32(s + 16)?,
            raw_pointer: r.u32(s + 20)?,
        });
    }

    let kind = if characteristics & IMAGE_FILE_DLL != 0 {
        ImageKind::Dll
    } else if subsystem == IMAGE_SUBSYSTEM_NATIVE {
        ImageKind::Driver
    } else {
        ImageKind::Executable
    };

    let codeview = if dir_count > IMAGE_DIRECTORY_ENTRY_DEBUG {
        let entry = dirs_at + IMAGE_DIRECTORY_ENTRY_DEBUG * 8;
        let rva = r.u32(entry)?;
        let size = r.u32(entry + 4)? as usize;
        read_codeview(&r, &sections, rva, size)?
    } else {
        None
    };

    Ok(PeImage {
        machine,
        timestamp,
        characteristics,
        kind,
        pe32_plus,
        size_of_image,
        codeview,
    })
}

fn read_codeview(
    r: &Reader<'_>,
    sections: &[Section],
    rva: u32,
    size: usize,
) -> std::result::Result<Option<CodeView>, PeError> {
    if rva == 0 || size == 0 {
        return Ok(None);
    }
    let Some(dir) = rva_to_offset(sections, rva) else {
        return Err(malformed(format!("debug directory RVA {:#x} outside any section", rva)));
    };

    for i in 0..size / DEBUG_ENTRY_LEN {
        let e = dir + i * DEBUG_ENTRY_LEN;
        if r.u32(e + 12)? != IMAGE_DEBUG_TYPE_CODEVIEW {
            continue;
        }
        let data_len = r.u32(e + 16)? as usize;
        let data_at = r.u32(e + 24)? as usize;
        if data_len < 24 || r.slice(data_at, 4)? != RSDS_SIGNATURE {
            continue;
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(r.slice(data_at + 4, 16)?);
        let age = r.u32(data_at + 20)?;

        let name_len = (data_len - 24).min(MAX_PDB_NAME);
        let raw = r.slice(data_at + 24, name_len)?;
        let raw = raw.split(|b| *b == 0).next().unwrap_or_default();
        let full = String::from_utf8_lossy(raw);
        let pdb_name = full
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or_default()
            .to_string();
        if pdb_name.is_empty() {
            continue;
        }

        return Ok(Some(CodeView {
            guid,
            age,
            pdb_name,
        }));
    }
    Ok(None)
}

/// [`BinaryValidator`] that parses PE headers from disk.
#[derive(Debug, Clone, Default)]
pub struct PeValidator;

#[async_trait]
impl BinaryValidator for PeValidator {
    async fn validate(&self, path: &Path) -> Result<PeImage> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| io_error("reading binary", path, e))?;
        parse(&bytes).map_err(|e| Error::validation(path, e.0))
    }
}

/// Synthetic images for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures {
    /// Shape of a generated PE32+ image: one `.rdata` section holding the
    /// debug directory and, optionally, an RSDS record.
    #[derive(Debug, Clone)]
    pub struct PeFixture {
        pub machine: u16,
        pub timestamp: u32,
        pub dll: bool,
        pub codeview: Option<([u8; 16], u32, String)>,
    }

    impl Default for PeFixture {
        fn default() -> Self {
            Self {
                machine: 0x8664,
                timestamp: 0x5f00_0000,
                dll: true,
                codeview: Some((
                    [
                        0x78, 0x56, 0x34, 0x12, 0xbc, 0x9a, 0xf0, 0xde, 0x01, 0x23, 0x45, 0x67,
                        0x89, 0xab, 0xcd, 0xef,
                    ],
                    2,
                    "sample.pdb".to_string(),
                )),
            }
        }
    }

    impl PeFixture {
        pub fn with_pdb(pdb_name: &str) -> Self {
            let mut fixture = Self::default();
            if let Some(cv) = fixture.codeview.as_mut() {
                cv.2 = pdb_name.to_string();
            }
            fixture
        }

        pub fn build(&self) -> Vec<u8> {
            const PE_AT: usize = 0x80;
            const OPT_AT: usize = PE_AT + 24;
            const OPT_LEN: usize = 0xf0;
            const SECTIONS_AT: usize = OPT_AT + OPT_LEN;
            const RDATA_RAW: usize = 0x200;
            const RDATA_RVA: u32 = 0x1000;
            const RSDS_AT: usize = RDATA_RAW + 28;

            let mut b = vec![0u8; 0x400];
            let put16 = |b: &mut Vec<u8>, at: usize, v: u16| b[at..at + 2].copy_from_slice(&v.to_le_bytes());
            let put32 = |b: &mut Vec<u8>, at: usize, v: u32| b[at..at + 4].copy_from_slice(&v.to_le_bytes());

            b[0..2].copy_from_slice(b"MZ");
            put32(&mut b, 0x3c, PE_AT as u32);
            b[PE_AT..PE_AT + 4].copy_from_slice(b"PE\0\0");

            let coff = PE_AT + 4;
            put16(&mut b, coff, self.machine);
            put16(&mut b, coff + 2, 1);
            put32(&mut b, coff + 4, self.timestamp);
            put16(&mut b, coff + 16, OPT_LEN as u16);
            put16(&mut b, coff + 18, if self.dll { 0x2022 } else { 0x0022 });

            put16(&mut b, OPT_AT, 0x20b);
            put32(&mut b, OPT_AT + 56, 0x2000);
            put16(&mut b, OPT_AT + 68, 3);
            put32(&mut b, OPT_AT + 108, 16);

            b[SECTIONS_AT..SECTIONS_AT + 6].copy_from_slice(b".rdata");
            put32(&mut b, SECTIONS_AT + 8, 0x200);
            put32(&mut b, SECTIONS_AT + 12, RDATA_RVA);
            put32(&mut b, SECTIONS_AT + 16, 0x200);
            put32(&mut b, SECTIONS_AT + 20, RDATA_RAW as u32);

            if let Some((guid, age, name)) = &self.codeview {
                let debug_dir = OPT_AT + 112 + 6 * 8;
                put32(&mut b, debug_dir, RDATA_RVA);
                put32(&mut b, debug_dir + 4, 28);

                let data_len = 24 + name.len() + 1;
                put32(&mut b, RDATA_RAW + 12, 2);
                put32(&mut b, RDATA_RAW + 16, data_len as u32);
                put32(&mut b, RDATA_RAW + 20, RDATA_RVA + 28);
                put32(&mut b, RDATA_RAW + 24, RSDS_AT as u32);

                b[RSDS_AT..RSDS_AT + 4].copy_from_slice(b"RSDS");
                b[RSDS_AT + 4..RSDS_AT + 20].copy_from_slice(guid);
                put32(&mut b, RSDS_AT + 20, *age);
                let name_at = RSDS_AT + 24;
                b[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
            }
            b
        }
    }
}
