//! Minimal 64-bit Mach-O symbol table access.
//!
//! Just enough of the format to read a symbol table out of an object file
//! or linked image and to rewrite visibility bits in place: the header, the
//! `LC_SYMTAB` load command and the fixed-width `nlist_64` entries it points
//! at. Everything is plain byte slicing over little-endian fields; nothing
//! here needs `unsafe`.

use rustc_hash::FxHashSet;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MachError>;

const MH_MAGIC_64: u32 = 0xfeed_facf;
/// Universal binaries carry a big-endian fat header.
const FAT_MAGIC_BYTES: [u8; 4] = [0xca, 0xfe, 0xba, 0xbe];
const HEADER_SIZE: usize = 32;
const LC_SYMTAB: u32 = 0x2;
const NLIST_SIZE: usize = 16;

pub const N_STAB: u8 = 0xe0;
pub const N_PEXT: u8 = 0x10;
pub const N_SECT: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;
/// Written to `n_desc` when a symbol is promoted to global.
pub const N_GSYM: u16 = 0x20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachError {
    #[error("not a 64-bit Mach-O image")]
    BadMagic,
    #[error("truncated Mach-O image")]
    Truncated,
}

/// Offsets of the symbol and string tables inside one image. Holds no
/// borrow of the image so entries can be rewritten through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTable {
    symoff: usize,
    nsyms: usize,
    stroff: usize,
    strsize: usize,
}

impl SymbolTable {
    /// Locates the `LC_SYMTAB` command. An image without one parses as an
    /// empty table.
    pub fn parse(image: &[u8]) -> Result<Self> {
        if read_u32(image, 0).ok_or(MachError::Truncated)? != MH_MAGIC_64 {
            return Err(MachError::BadMagic);
        }
        let ncmds = read_u32(image, 16).ok_or(MachError::Truncated)? as usize;

        let mut offset = HEADER_SIZE;
        for _ in 0..ncmds {
            let cmd = read_u32(image, offset).ok_or(MachError::Truncated)?;
            let cmdsize = read_u32(image, offset + 4).ok_or(MachError::Truncated)? as usize;
            if cmdsize < 8 {
                return Err(MachError::Truncated);
            }
            if cmd == LC_SYMTAB {
                let table = Self {
                    symoff: read_u32(image, offset + 8).ok_or(MachError::Truncated)? as usize,
                    nsyms: read_u32(image, offset + 12).ok_or(MachError::Truncated)? as usize,
                    stroff: read_u32(image, offset + 16).ok_or(MachError::Truncated)? as usize,
                    strsize: read_u32(image, offset + 20).ok_or(MachError::Truncated)? as usize,
                };
                let syms_end = table
                    .symoff
                    .checked_add(table.nsyms.saturating_mul(NLIST_SIZE))
                    .ok_or(MachError::Truncated)?;
                let strs_end = table
                    .stroff
                    .checked_add(table.strsize)
                    .ok_or(MachError::Truncated)?;
                if syms_end > image.len() || strs_end > image.len() {
                    return Err(MachError::Truncated);
                }
                return Ok(table);
            }
            offset += cmdsize;
        }
        Ok(Self {
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        })
    }

    pub fn symbol_count(&self) -> usize {
        self.nsyms
    }

    /// The NUL-terminated name bytes of entry `index`, without the NUL.
    pub fn name<'a>(&self, image: &'a [u8], index: usize) -> Option<&'a [u8]> {
        let n_strx = read_u32(image, self.entry_offset(index)?)? as usize;
        let strings = image.get(self.stroff..self.stroff + self.strsize)?;
        let tail = strings.get(n_strx..)?;
        let nul = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..nul])
    }

    pub fn n_type(&self, image: &[u8], index: usize) -> Option<u8> {
        image.get(self.entry_offset(index)? + 4).copied()
    }

    pub fn n_desc(&self, image: &[u8], index: usize) -> Option<u16> {
        let offset = self.entry_offset(index)? + 6;
        Some(u16::from_le_bytes([
            *image.get(offset)?,
            *image.get(offset + 1)?,
        ]))
    }

    /// Rewrites entry `index` as an externally visible section symbol.
    pub fn set_global(&self, image: &mut [u8], index: usize) {
        let Some(offset) = self.entry_offset(index) else {
            return;
        };
        if let Some(n_type) = image.get_mut(offset + 4) {
            *n_type = N_SECT | N_EXT;
        }
        if image.len() >= offset + 8 {
            image[offset + 6..offset + 8].copy_from_slice(&N_GSYM.to_le_bytes());
        }
    }

    fn entry_offset(&self, index: usize) -> Option<usize> {
        if index >= self.nsyms {
            return None;
        }
        Some(self.symoff + index * NLIST_SIZE)
    }
}

/// First-bytes check matching what `file` calls a shared library: a thin
/// 64-bit image or a universal wrapper.
pub fn is_image_magic(magic: &[u8]) -> bool {
    magic.len() >= 4
        && (magic[..4] == MH_MAGIC_64.to_le_bytes() || magic[..4] == FAT_MAGIC_BYTES)
}

/// Whether `name` mangles a Swift default-argument generator: the suffix is
/// `A`, an optional ordinal, then a trailing underscore.
pub fn is_default_argument_symbol(name: &[u8]) -> bool {
    let Some(rest) = name.strip_suffix(b"_") else {
        return false;
    };
    let mut index = rest.len();
    while index > 0 && rest[index - 1].is_ascii_digit() {
        index -= 1;
    }
    index > 0 && rest[index - 1] == b'A'
}

/// Promotes hidden default-argument generators in `image` to global
/// visibility and returns how many entries were rewritten. `unhidden`
/// spans a whole scan: a symbol is exported from the first object file
/// that defines it and left alone everywhere else, so the export set
/// stays free of duplicates.
pub fn unhide_default_arguments(
    image: &mut [u8],
    unhidden: &mut FxHashSet<String>,
) -> Result<usize> {
    let table = SymbolTable::parse(image)?;
    let mut patched = 0;
    for index in 0..table.symbol_count() {
        let candidate = match table.name(image, index) {
            Some(name) if is_default_argument_symbol(name) => {
                String::from_utf8_lossy(name).into_owned()
            }
            _ => continue,
        };
        if !unhidden.insert(candidate) {
            continue;
        }
        let Some(n_type) = table.n_type(image, index) else {
            continue;
        };
        if n_type & N_PEXT != 0 {
            table.set_global(image, index);
            patched += 1;
        }
    }
    Ok(patched)
}

/// Names of the externally visible symbols in a linked image, for the
/// symbol drift check after a recompile.
pub fn global_symbol_names(image: &[u8]) -> Option<Vec<String>> {
    let table = SymbolTable::parse(image).ok()?;
    let mut names = Vec::new();
    for index in 0..table.symbol_count() {
        let n_type = table.n_type(image, index)?;
        if n_type & N_STAB != 0 || n_type & N_EXT == 0 {
            continue;
        }
        if let Some(bytes) = table.name(image, index) {
            if let Ok(name) = std::str::from_utf8(bytes) {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
    }
    Some(names)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Builds throwaway objects with a chosen symbol table.
#[cfg(test)]
pub(crate) mod testobj {
    use super::{HEADER_SIZE, LC_SYMTAB, MH_MAGIC_64, NLIST_SIZE};

    /// Assembles a minimal 64-bit object containing exactly the given
    /// `(name, n_type, n_desc)` symbols.
    pub fn build(symbols: &[(&str, u8, u16)]) -> Vec<u8> {
        const SYMTAB_CMD_SIZE: u32 = 24;
        let symoff = (HEADER_SIZE + SYMTAB_CMD_SIZE as usize) as u32;
        let stroff = symoff + (symbols.len() * NLIST_SIZE) as u32;

        // String table: index zero is the empty name.
        let mut strings = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in symbols {
            name_offsets.push(strings.len() as u32);
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }

        let mut image = Vec::new();
        image.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        image.extend_from_slice(&0x0100000cu32.to_le_bytes()); // cputype arm64
        image.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
        image.extend_from_slice(&1u32.to_le_bytes()); // MH_OBJECT
        image.extend_from_slice(&1u32.to_le_bytes()); // ncmds
        image.extend_from_slice(&SYMTAB_CMD_SIZE.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // flags
        image.extend_from_slice(&0u32.to_le_bytes()); // reserved

        image.extend_from_slice(&LC_SYMTAB.to_le_bytes());
        image.extend_from_slice(&SYMTAB_CMD_SIZE.to_le_bytes());
        image.extend_from_slice(&symoff.to_le_bytes());
        image.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
        image.extend_from_slice(&stroff.to_le_bytes());
        image.extend_from_slice(&(strings.len() as u32).to_le_bytes());

        for (index, (_, n_type, n_desc)) in symbols.iter().enumerate() {
            image.extend_from_slice(&name_offsets[index].to_le_bytes()); // n_strx
            image.push(*n_type);
            image.push(1); // n_sect
            image.extend_from_slice(&n_desc.to_le_bytes());
            image.extend_from_slice(&0u64.to_le_bytes()); // n_value
        }
        image.extend_from_slice(&strings);
        image
    }
}
