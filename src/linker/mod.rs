//! Minimal static linker for a single x86-64 relocatable object.
//!
//! Reads `.text`, `.symtab`, `.strtab` (plus optional `.bss` and
//! `.rela.text`), resolves symbols, applies `R_X86_64_PC32`/`R_X86_64_PLT32`
//! relocations, and writes a one-`PT_LOAD` statically-linked executable with
//! the entry set to the resolved address of `coatl_start`.
use std::{fs, path::Path};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PF_RWX: u32 = 7;

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;

const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;

/// Load base of the produced image; `.text` lands at file offset 0x1000 so
/// the first page covers the ELF header and the padded prefix.
const BASE: u64 = 0x400000;
const TEXT_OFF: u64 = 0x1000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Default entry symbol of linked executables.
pub const DEFAULT_ENTRY: &str = "coatl_start";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unsupported ELF object format")]
    BadObject,
    #[error("truncated object file")]
    Truncated,
    #[error("object missing required section {0}")]
    MissingSection(&'static str),
    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),
    #[error("unsupported symbol section index: {0}")]
    BadSymbolSection(u16),
    #[error("unsupported relocation type: {0}")]
    UnsupportedRelocation(u32),
    #[error("relocation overflow")]
    RelocationOverflow,
    #[error("relocation outside .text")]
    RelocationOutOfRange,
    #[error("entry symbol not found: {0}")]
    EntryNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn u16_at(data: &[u8], off: usize) -> Result<u16, LinkError> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(LinkError::Truncated)
}

fn u32_at(data: &[u8], off: usize) -> Result<u32, LinkError> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(LinkError::Truncated)
}

fn u64_at(data: &[u8], off: usize) -> Result<u64, LinkError> {
    data.get(off..off + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or(LinkError::Truncated)
}

fn i64_at(data: &[u8], off: usize) -> Result<i64, LinkError> {
    Ok(u64_at(data, off)? as i64)
}

/// NUL-terminated string at `off` in a string table.
fn cstr(table: &[u8], off: usize) -> String {
    let tail = table.get(off..).unwrap_or(&[]);
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy)]
struct Section {
    index: usize,
    name_off: usize,
    offset: usize,
    size: usize,
    entsize: usize,
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
    name_off: usize,
    shndx: u16,
    value: u64,
}

struct Object<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
    shstrtab: &'a [u8],
}

impl<'a> Object<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, LinkError> {
        if data.len() < EHDR_SIZE
            || data[..4] != ELF_MAGIC
            || data[4] != ELFCLASS64
            || data[5] != ELFDATA2LSB
        {
            return Err(LinkError::BadObject);
        }
        let e_shoff = u64_at(data, 40)? as usize;
        let e_shentsize = u16_at(data, 58)? as usize;
        let e_shnum = u16_at(data, 60)? as usize;
        let e_shstrndx = u16_at(data, 62)? as usize;

        let mut sections = vec![];
        for i in 0..e_shnum {
            let off = e_shoff + i * e_shentsize;
            sections.push(Section {
                index: i,
                name_off: u32_at(data, off)? as usize,
                offset: u64_at(data, off + 24)? as usize,
                size: u64_at(data, off + 32)? as usize,
                entsize: u64_at(data, off + 56)? as usize,
            });
        }

        let shstr = *sections.get(e_shstrndx).ok_or(LinkError::BadObject)?;
        let shstrtab = data
            .get(shstr.offset..shstr.offset + shstr.size)
            .ok_or(LinkError::Truncated)?;

        Ok(Object {
            data,
            sections,
            shstrtab,
        })
    }

    fn section(&self, name: &str) -> Option<Section> {
        self.sections
            .iter()
            .find(|s| cstr(self.shstrtab, s.name_off) == name)
            .copied()
    }

    fn contents(&self, section: Section) -> Result<&'a [u8], LinkError> {
        self.data
            .get(section.offset..section.offset + section.size)
            .ok_or(LinkError::Truncated)
    }
}

/// Link a single relocatable object into an executable image.
pub fn link(data: &[u8], entry_name: &str) -> Result<Vec<u8>, LinkError> {
    let obj = Object::parse(data)?;

    let text_sec = obj.section(".text").ok_or(LinkError::MissingSection(".text"))?;
    let sym_sec = obj
        .section(".symtab")
        .ok_or(LinkError::MissingSection(".symtab"))?;
    let str_sec = obj
        .section(".strtab")
        .ok_or(LinkError::MissingSection(".strtab"))?;

    let mut text = obj.contents(text_sec)?.to_vec();
    let strtab = obj.contents(str_sec)?;

    let bss_sec = obj.section(".bss");
    let bss_size = bss_sec.map(|s| s.size as u64).unwrap_or(0);

    let text_vaddr = BASE + TEXT_OFF;
    let bss_vaddr = align_up(text_vaddr + text.len() as u64, 16);
    let bss_end = bss_vaddr + bss_size;

    let sym_data = obj.contents(sym_sec)?;
    let entsize = if sym_sec.entsize != 0 { sym_sec.entsize } else { 24 };
    let mut syms = vec![];
    for i in 0..sym_sec.size / entsize {
        let off = i * entsize;
        syms.push(Symbol {
            name_off: u32_at(sym_data, off)? as usize,
            shndx: u16_at(sym_data, off + 6)?,
            value: u64_at(sym_data, off + 8)?,
        });
    }

    let sym_addr = |sym: &Symbol| -> Result<u64, LinkError> {
        if sym.shndx == SHN_UNDEF {
            return Err(LinkError::UndefinedSymbol(cstr(strtab, sym.name_off)));
        }
        if sym.shndx == SHN_ABS {
            return Ok(sym.value);
        }
        if sym.shndx as usize == text_sec.index {
            return Ok(text_vaddr + sym.value);
        }
        if let Some(bss) = bss_sec {
            if sym.shndx as usize == bss.index {
                return Ok(bss_vaddr + sym.value);
            }
        }
        Err(LinkError::BadSymbolSection(sym.shndx))
    };

    if let Some(rela_sec) = obj.section(".rela.text") {
        let rela_data = obj.contents(rela_sec)?;
        let entsize = if rela_sec.entsize != 0 { rela_sec.entsize } else { 24 };
        for i in 0..rela_sec.size / entsize {
            let off = i * entsize;
            let r_offset = u64_at(rela_data, off)? as usize;
            let r_info = u64_at(rela_data, off + 8)?;
            let r_addend = i64_at(rela_data, off + 16)?;

            let r_type = (r_info & 0xffff_ffff) as u32;
            let r_sym = (r_info >> 32) as usize;
            if r_type != R_X86_64_PC32 && r_type != R_X86_64_PLT32 {
                return Err(LinkError::UnsupportedRelocation(r_type));
            }

            let sym = syms.get(r_sym).ok_or(LinkError::Truncated)?;
            let s = sym_addr(sym)? as i128;
            let p = (text_vaddr + r_offset as u64) as i128;
            let value = s + r_addend as i128 - p;
            if !(-(1i128 << 31)..(1i128 << 31)).contains(&value) {
                return Err(LinkError::RelocationOverflow);
            }
            let patch = text
                .get_mut(r_offset..r_offset + 4)
                .ok_or(LinkError::RelocationOutOfRange)?;
            patch.copy_from_slice(&(value as i32).to_le_bytes());
        }
    }

    let mut entry_addr = None;
    for sym in &syms {
        if cstr(strtab, sym.name_off) == entry_name {
            entry_addr = Some(sym_addr(sym)?);
            break;
        }
    }
    let entry_addr = entry_addr.ok_or_else(|| LinkError::EntryNotFound(entry_name.to_owned()))?;

    Ok(write_image(&text, entry_addr, bss_end))
}

/// One ELF header, one RWX `PT_LOAD` covering the whole image, then the
/// text placed at file offset 0x1000.
fn write_image(text: &[u8], entry: u64, bss_end: u64) -> Vec<u8> {
    let filesz = TEXT_OFF + text.len() as u64;
    let memsz = bss_end - BASE;

    let mut out = vec![0u8; TEXT_OFF as usize + text.len()];

    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(&ELF_MAGIC);
    ident[4] = ELFCLASS64;
    ident[5] = ELFDATA2LSB;
    ident[6] = 1;

    out[..16].copy_from_slice(&ident);
    out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
    out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&entry.to_le_bytes());
    out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    // e_shoff, e_flags stay zero
    out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out[56..58].copy_from_slice(&1u16.to_le_bytes());

    let ph = EHDR_SIZE;
    out[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
    out[ph + 4..ph + 8].copy_from_slice(&PF_RWX.to_le_bytes());
    out[ph + 8..ph + 16].copy_from_slice(&0u64.to_le_bytes());
    out[ph + 16..ph + 24].copy_from_slice(&BASE.to_le_bytes());
    out[ph + 24..ph + 32].copy_from_slice(&BASE.to_le_bytes());
    out[ph + 32..ph + 40].copy_from_slice(&filesz.to_le_bytes());
    out[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
    out[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());

    out[TEXT_OFF as usize..].copy_from_slice(text);
    out
}

/// Link `input` into `output` and mark it executable.
pub fn link_file(input: &Path, output: &Path, entry_name: &str) -> Result<(), LinkError> {
    let data = fs::read(input)?;
    let image = link(&data, entry_name)?;
    fs::write(output, image)?;
    #[cfg(unix)]
    fs::set_permissions(output, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds a minimal relocatable object: .text with the given bytes,
    /// a symbol table, and optionally .bss and .rela.text.
    struct ObjBuilder {
        text: Vec<u8>,
        bss_size: u64,
        /// (name, shndx_kind, value); shndx_kind: 0 = text, 1 = bss, 2 = abs,
        /// 3 = undef
        symbols: Vec<(String, u8, u64)>,
        /// (r_offset, sym_index, r_type, addend)
        relas: Vec<(u64, u32, u32, i64)>,
    }

    impl ObjBuilder {
        fn new(text: &[u8]) -> Self {
            Self {
                text: text.to_vec(),
                bss_size: 0,
                symbols: vec![],
                relas: vec![],
            }
        }

        fn build(&self) -> Vec<u8> {
            // Section order: null, .text, .bss, .symtab, .strtab, .rela.text,
            // .shstrtab
            let shstrtab =
                b"\0.text\0.bss\0.symtab\0.strtab\0.rela.text\0.shstrtab\0".to_vec();
            let name_text = 1u32;
            let name_bss = 7u32;
            let name_symtab = 12u32;
            let name_strtab = 20u32;
            let name_rela = 28u32;
            let name_shstrtab = 39u32;

            let mut strtab = vec![0u8];
            let mut syms = vec![0u8; 24]; // null symbol
            for (name, kind, value) in &self.symbols {
                let name_off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                let shndx: u16 = match kind {
                    0 => 1,
                    1 => 2,
                    2 => SHN_ABS,
                    _ => SHN_UNDEF,
                };
                let mut sym = vec![];
                sym.extend_from_slice(&name_off.to_le_bytes());
                sym.push(0);
                sym.push(0);
                sym.extend_from_slice(&shndx.to_le_bytes());
                sym.extend_from_slice(&value.to_le_bytes());
                sym.extend_from_slice(&0u64.to_le_bytes());
                syms.extend_from_slice(&sym);
            }

            let mut relas = vec![];
            for (offset, sym, rtype, addend) in &self.relas {
                relas.extend_from_slice(&offset.to_le_bytes());
                let info = (u64::from(*sym) << 32) | u64::from(*rtype);
                relas.extend_from_slice(&info.to_le_bytes());
                relas.extend_from_slice(&addend.to_le_bytes());
            }

            let shnum = 7usize;
            let shoff = 64usize;
            let mut payload_off = shoff + shnum * 64;
            let mut headers = vec![0u8; 64]; // null section header

            let push_header = |name: u32, sh_type: u32, offset: usize, size: usize, entsize: u64| {
                let mut h = vec![];
                h.extend_from_slice(&name.to_le_bytes());
                h.extend_from_slice(&sh_type.to_le_bytes());
                h.extend_from_slice(&0u64.to_le_bytes()); // flags
                h.extend_from_slice(&0u64.to_le_bytes()); // addr
                h.extend_from_slice(&(offset as u64).to_le_bytes());
                h.extend_from_slice(&(size as u64).to_le_bytes());
                h.extend_from_slice(&0u32.to_le_bytes()); // link
                h.extend_from_slice(&0u32.to_le_bytes()); // info
                h.extend_from_slice(&0u64.to_le_bytes()); // addralign
                h.extend_from_slice(&entsize.to_le_bytes());
                h
            };

            let text_off = payload_off;
            payload_off += self.text.len();
            let sym_off = payload_off;
            payload_off += syms.len();
            let str_off = payload_off;
            payload_off += strtab.len();
            let rela_off = payload_off;
            payload_off += relas.len();
            let shstr_off = payload_off;

            headers.extend(push_header(name_text, 1, text_off, self.text.len(), 0));
            headers.extend(push_header(name_bss, 8, 0, self.bss_size as usize, 0));
            headers.extend(push_header(name_symtab, 2, sym_off, syms.len(), 24));
            headers.extend(push_header(name_strtab, 3, str_off, strtab.len(), 0));
            headers.extend(push_header(name_rela, 4, rela_off, relas.len(), 24));
            headers.extend(push_header(name_shstrtab, 3, shstr_off, shstrtab.len(), 0));

            let mut out = vec![0u8; 64];
            out[..4].copy_from_slice(&ELF_MAGIC);
            out[4] = ELFCLASS64;
            out[5] = ELFDATA2LSB;
            out[6] = 1;
            out[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
            out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
            out[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
            out[58..60].copy_from_slice(&64u16.to_le_bytes());
            out[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
            out[62..64].copy_from_slice(&6u16.to_le_bytes()); // .shstrtab index

            out.extend_from_slice(&headers);
            out.extend_from_slice(&self.text);
            out.extend_from_slice(&syms);
            out.extend_from_slice(&strtab);
            out.extend_from_slice(&relas);
            out.extend_from_slice(&shstrtab);
            out
        }
    }

    #[test]
    fn test_links_minimal_object() {
        // mov edi, 42 ; mov eax, 60 ; syscall
        let text = [0xbfu8, 42, 0, 0, 0, 0xb8, 60, 0, 0, 0, 0x0f, 0x05];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        let image = link(&builder.build(), DEFAULT_ENTRY).unwrap();

        assert_eq!(&image[..4], &ELF_MAGIC);
        assert_eq!(u16_at(&image, 16).unwrap(), ET_EXEC);
        assert_eq!(u16_at(&image, 18).unwrap(), EM_X86_64);
        // entry = text vaddr
        assert_eq!(u64_at(&image, 24).unwrap(), BASE + TEXT_OFF);
        // one program header, RWX, page aligned
        assert_eq!(u16_at(&image, 56).unwrap(), 1);
        assert_eq!(u32_at(&image, 64).unwrap(), PT_LOAD);
        assert_eq!(u32_at(&image, 68).unwrap(), PF_RWX);
        assert_eq!(u64_at(&image, 112).unwrap(), 0x1000);
        // text placed at 0x1000
        assert_eq!(&image[0x1000..0x1000 + text.len()], &text);
    }

    #[test]
    fn test_pc32_relocation_patch() {
        // call rel32 at offset 1 (e8 xx xx xx xx), target symbol at text+16.
        let mut text = vec![0x90u8; 32];
        text[0] = 0xe8;
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        builder.symbols.push(("callee".to_owned(), 0, 16));
        builder.relas.push((1, 2, R_X86_64_PLT32, -4));
        let image = link(&builder.build(), DEFAULT_ENTRY).unwrap();

        // S + A - P = (text+16) + (-4) - (text+1) = 11
        let patched = i32::from_le_bytes([
            image[0x1001],
            image[0x1002],
            image[0x1003],
            image[0x1004],
        ]);
        assert_eq!(patched, 11);
    }

    #[test]
    fn test_bss_symbol_resolution_and_memsz() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.bss_size = 1 << 20;
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        builder.symbols.push(("__coatl_mem".to_owned(), 1, 0));
        builder.relas.push((0, 2, R_X86_64_PC32, -4));
        let image = link(&builder.build(), DEFAULT_ENTRY).unwrap();

        let bss_vaddr = align_up(BASE + TEXT_OFF + text.len() as u64, 16);
        // patched value points at bss
        let patched = i32::from_le_bytes([image[0x1000], image[0x1001], image[0x1002], image[0x1003]]);
        assert_eq!(
            patched as i64,
            bss_vaddr as i64 - 4 - (BASE + TEXT_OFF) as i64
        );
        // memsz covers text + bss
        let memsz = u64_at(&image, 64 + 40).unwrap();
        assert_eq!(memsz, bss_vaddr + (1 << 20) - BASE);
        // filesz does not
        let filesz = u64_at(&image, 64 + 32).unwrap();
        assert_eq!(filesz, TEXT_OFF + text.len() as u64);
    }

    #[test]
    fn test_undefined_symbol_is_fatal() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        builder.symbols.push(("ghost".to_owned(), 3, 0));
        builder.relas.push((0, 2, R_X86_64_PC32, -4));
        let err = link(&builder.build(), DEFAULT_ENTRY).unwrap_err();
        assert!(matches!(err, LinkError::UndefinedSymbol(name) if name == "ghost"));
    }

    #[test]
    fn test_unsupported_relocation_type() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        builder.relas.push((0, 1, 11, 0)); // R_X86_64_32S
        let err = link(&builder.build(), DEFAULT_ENTRY).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedRelocation(11)));
    }

    #[test]
    fn test_relocation_overflow() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        builder.symbols.push(("far".to_owned(), 2, 0x7fff_ffff_ffff));
        builder.relas.push((0, 2, R_X86_64_PC32, 0));
        let err = link(&builder.build(), DEFAULT_ENTRY).unwrap_err();
        assert!(matches!(err, LinkError::RelocationOverflow));
    }

    #[test]
    fn test_missing_entry_symbol() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("not_the_entry".to_owned(), 0, 0));
        let err = link(&builder.build(), DEFAULT_ENTRY).unwrap_err();
        assert!(matches!(err, LinkError::EntryNotFound(_)));
    }

    #[test]
    fn test_entry_override() {
        let text = vec![0x90u8; 8];
        let mut builder = ObjBuilder::new(&text);
        builder.symbols.push(("alt_start".to_owned(), 0, 4));
        let image = link(&builder.build(), "alt_start").unwrap();
        assert_eq!(u64_at(&image, 24).unwrap(), BASE + TEXT_OFF + 4);
    }

    #[test]
    fn test_rejects_non_elf() {
        assert!(matches!(link(b"hello", DEFAULT_ENTRY), Err(LinkError::BadObject)));
    }

    #[test]
    fn test_link_file_writes_executable() {
        let dir = tempfile::tempdir().unwrap();
        let obj_path = dir.path().join("prog.o");
        let out_path = dir.path().join("prog");

        let mut builder = ObjBuilder::new(&[0x90u8; 4]);
        builder.symbols.push(("coatl_start".to_owned(), 0, 0));
        fs::write(&obj_path, builder.build()).unwrap();

        link_file(&obj_path, &out_path, DEFAULT_ENTRY).unwrap();

        let meta = fs::metadata(&out_path).unwrap();
        assert_eq!(meta.len(), TEXT_OFF + 4);
        #[cfg(unix)]
        assert_eq!(meta.permissions().mode() & 0o111, 0o111);
    }
}
