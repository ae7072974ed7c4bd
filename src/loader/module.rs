//! Module loading and the guest-visible `LDR_DATA_TABLE_ENTRY`/`PEB_LDR_DATA` structures
//! (§4.3, §4.3.1).

use crate::error::{LoaderError, LoaderResult};
use crate::loader::exports::{ExportLookup, ExportTable};
use crate::mem::PhysMem;
use crate::paging::{PagingContext, PteFlags};
use crate::pe::{PeImage, DIR_BASERELOC};
use crate::vfs::VfsJail;
use log::{info, warn};
use std::path::Path;

const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
const IMAGE_REL_BASED_HIGHLOW: u8 = 3;

/// Offsets within a guest `LDR_DATA_TABLE_ENTRY` (§4.3.1).
pub mod ldr_entry_offset {
    pub const IN_LOAD_ORDER_LINKS: u32 = 0x00;
    pub const IN_MEMORY_ORDER_LINKS: u32 = 0x08;
    pub const IN_INITIALIZATION_ORDER_LINKS: u32 = 0x10;
    pub const DLL_BASE: u32 = 0x18;
    pub const ENTRY_POINT: u32 = 0x1C;
    pub const SIZE_OF_IMAGE: u32 = 0x20;
    pub const FULL_DLL_NAME: u32 = 0x24;
    pub const BASE_DLL_NAME: u32 = 0x2C;
    pub const FLAGS: u32 = 0x34;
    pub const LOAD_COUNT: u32 = 0x38;
    pub const HASH_LINKS: u32 = 0x3C;
    pub const TIME_DATE_STAMP: u32 = 0x44;
    pub const SIZE: u32 = 0x50;
}

/// Offsets within `PEB_LDR_DATA` (relative to its own base, not `PEB`).
pub mod peb_ldr_data_offset {
    pub const LENGTH: u32 = 0x00;
    pub const INITIALIZED: u32 = 0x04;
    pub const IN_LOAD_ORDER_MODULE_LIST: u32 = 0x0C;
    pub const IN_MEMORY_ORDER_MODULE_LIST: u32 = 0x14;
    pub const IN_INITIALIZATION_ORDER_MODULE_LIST: u32 = 0x1C;
    pub const SIZE: u32 = 0x28;
}

/// A doubly-linked circular list head/link pair, both Flink and Blink guest VAs.
fn list_init_self(mem: &mut PhysMem, paging: &PagingContext, head_va: u32) {
    write_va(mem, paging, head_va, head_va);
    write_va(mem, paging, head_va + 4, head_va);
}

fn write_va(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u32) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write32(pa, value);
    }
}

fn read_va(mem: &PhysMem, paging: &PagingContext, va: u32) -> u32 {
    paging.translate(mem, va).map(|pa| mem.read32(pa)).unwrap_or(0)
}

/// Tail-inserts `entry_va` (pointing at the `LIST_ENTRY32` embedded at `link_offset` within the
/// entry) onto the circular list headed at `head_va`.
fn list_insert_tail(mem: &mut PhysMem, paging: &PagingContext, head_va: u32, entry_link_va: u32) {
    let tail = read_va(mem, paging, head_va + 4); // head.Blink
    write_va(mem, paging, entry_link_va, head_va); // entry.Flink = head
    write_va(mem, paging, entry_link_va + 4, tail); // entry.Blink = old tail
    write_va(mem, paging, tail, entry_link_va); // old tail.Flink = entry
    write_va(mem, paging, head_va + 4, entry_link_va); // head.Blink = entry
}

/// A loaded module, tracked host-side.
pub struct LoadedModule {
    pub name: String,
    pub base_va: u32,
    pub phys_base: u32,
    pub size: u32,
    pub entry_point: u32,
    pub ldr_entry_va: u32,
    pub exports: ExportTable,
    pub is_main_exe: bool,
    pub dll_main_called: bool,
    pub imports_resolved: bool,
    pub has_imports: bool,
    pub import_dir_rva: u32,
    pub import_dir_size: u32,
}

/// Owns the loader heap (a simple bump allocator inside guest VA) and the list of loaded
/// modules.
pub struct ModuleManager {
    pub modules: Vec<LoadedModule>,
    heap_va: u32,
    heap_phys: u32,
    heap_size: u32,
    heap_offset: u32,
    ldr_data_va: u32,
    ntdll_path: Option<std::path::PathBuf>,
}

impl ModuleManager {
    pub fn new(
        mem: &mut PhysMem,
        paging: &mut PagingContext,
        heap_va: u32,
        heap_size: u32,
        ldr_data_va: u32,
    ) -> LoaderResult<Self> {
        let heap_phys = paging.alloc_phys(mem, heap_size);
        if heap_phys == 0 {
            return Err(LoaderError::HeapExhausted { requested: heap_size, remaining: 0 });
        }
        paging.map_range(mem, heap_va, heap_phys, heap_size, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)?;

        Ok(Self {
            modules: Vec::new(),
            heap_va,
            heap_phys,
            heap_size,
            heap_offset: 0,
            ldr_data_va,
            ntdll_path: None,
        })
    }

    pub fn set_ntdll_path(&mut self, path: std::path::PathBuf) {
        self.ntdll_path = Some(path);
    }

    /// Bump-allocates `len` bytes of loader-heap VA, returning its VA.
    fn heap_alloc(&mut self, len: u32) -> LoaderResult<u32> {
        let aligned = (len + 7) & !7;
        if self.heap_offset + aligned > self.heap_size {
            return Err(LoaderError::HeapExhausted {
                requested: len,
                remaining: self.heap_size.saturating_sub(self.heap_offset),
            });
        }
        let va = self.heap_va + self.heap_offset;
        self.heap_offset += aligned;
        Ok(va)
    }

    /// Writes a UTF-16 string (no NUL) into the loader heap and returns its VA.
    fn heap_alloc_wide_string(&mut self, mem: &mut PhysMem, paging: &PagingContext, s: &str) -> LoaderResult<u32> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let byte_len = (units.len() * 2) as u32;
        let va = self.heap_alloc(byte_len.max(2))?;
        for (i, unit) in units.iter().enumerate() {
            write_va16(mem, paging, va + (i as u32) * 2, *unit);
        }
        Ok(va)
    }

    /// `PEB_LDR_DATA`'s three list heads are initialized to point to themselves (§4.3 step 2).
    pub fn init_peb_ldr_data(&mut self, mem: &mut PhysMem, paging: &PagingContext) {
        write_va(mem, paging, self.ldr_data_va + peb_ldr_data_offset::LENGTH, peb_ldr_data_offset::SIZE);
        if let Some(pa) = paging.translate(mem, self.ldr_data_va + peb_ldr_data_offset::INITIALIZED) {
            mem.write8(pa, 1);
        }
        for head_offset in [
            peb_ldr_data_offset::IN_LOAD_ORDER_MODULE_LIST,
            peb_ldr_data_offset::IN_MEMORY_ORDER_MODULE_LIST,
            peb_ldr_data_offset::IN_INITIALIZATION_ORDER_MODULE_LIST,
        ] {
            list_init_self(mem, paging, self.ldr_data_va + head_offset);
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Loads a PE image from `path` at `preferred_base` (0 meaning "use the image's own
    /// preferred base, or 0x00400000 if that is also 0"), copying headers and sections,
    /// applying base relocations, mapping the result into guest VA, and caching its exports.
    /// Returns the new module's index in [`Self::modules`].
    pub fn load_pe(
        &mut self,
        mem: &mut PhysMem,
        paging: &mut PagingContext,
        path: &Path,
        preferred_base: u32,
        is_main_exe: bool,
    ) -> LoaderResult<usize> {
        let file_data = std::fs::read(path)?;
        let pe = PeImage::parse(file_data)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let load_base = if preferred_base != 0 {
            preferred_base
        } else if pe.image_base != 0 {
            pe.image_base
        } else {
            0x0040_0000
        };

        let entry_point = if pe.entry_point_rva != 0 { load_base + pe.entry_point_rva } else { 0 };

        info!("loading {} at {:#010x}, entry point {:#010x}", name, load_base, entry_point);

        let image_phys = paging.alloc_phys(mem, pe.size_of_image);
        if image_phys == 0 {
            return Err(LoaderError::HeapExhausted { requested: pe.size_of_image, remaining: 0 });
        }

        let headers = pe.read_at_rva(0, pe.size_of_headers as usize);
        mem.write_bytes(image_phys, headers);

        for section in &pe.sections {
            let copy_size = section.raw_size.min(section.virtual_size.max(section.raw_size));
            let copy_size = if section.virtual_size != 0 { section.raw_size.min(section.virtual_size) } else { section.raw_size };
            let sec_phys = image_phys + section.virtual_address;
            let raw = pe.read_at_rva(section.raw_offset, copy_size as usize);
            mem.write_bytes(sec_phys, raw);
            if section.virtual_size > copy_size {
                mem.zero_range(sec_phys + copy_size, (section.virtual_size - copy_size) as usize);
            }
        }

        let reloc_dir = pe.data_dir(DIR_BASERELOC);
        let delta = load_base as i64 - pe.image_base as i64;
        if reloc_dir.size > 0 && delta != 0 {
            apply_base_relocations(mem, &pe, image_phys, reloc_dir.virtual_address, reloc_dir.size, delta);
        }

        paging.map_range(
            mem,
            load_base,
            image_phys,
            pe.size_of_image,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        )?;

        let exports = ExportTable::parse(&pe)?;
        let import_dir = pe.data_dir(crate::pe::DIR_IMPORT);
        let has_imports = import_dir.size > 0;

        let module = LoadedModule {
            name,
            base_va: load_base,
            phys_base: image_phys,
            size: pe.size_of_image,
            entry_point,
            ldr_entry_va: 0,
            exports,
            is_main_exe,
            dll_main_called: false,
            imports_resolved: false,
            has_imports,
            import_dir_rva: import_dir.virtual_address,
            import_dir_size: import_dir.size,
        };

        self.modules.push(module);
        Ok(self.modules.len() - 1)
    }

    /// Finds an already-loaded module by name, or loads it: `ntdll.dll`/`ntdll` from the
    /// configured path, everything else through the VFS jail (§4.3.2).
    pub fn load_by_name(
        &mut self,
        mem: &mut PhysMem,
        paging: &mut PagingContext,
        vfs: &VfsJail,
        dll_name: &str,
    ) -> LoaderResult<usize> {
        if let Some(idx) = self.find_by_name(dll_name) {
            return Ok(idx);
        }

        if dll_name.eq_ignore_ascii_case("ntdll.dll") || dll_name.eq_ignore_ascii_case("ntdll") {
            let path = self
                .ntdll_path
                .clone()
                .ok_or_else(|| LoaderError::DllNotFound(dll_name.to_string()))?;
            return self.load_pe(mem, paging, &path, 0x7C80_0000, false);
        }

        let nt_path = format!(r"C:\WINDOWS\system32\{}", dll_name);
        let host_path = vfs
            .resolve(&nt_path)
            .map_err(|_| LoaderError::DllNotFound(dll_name.to_string()))?;
        if !host_path.exists() {
            return Err(LoaderError::DllNotFound(dll_name.to_string()));
        }
        self.load_pe(mem, paging, &host_path, 0, false)
    }

    /// Writes a `LDR_DATA_TABLE_ENTRY` for `module_index` into the loader heap and links it
    /// onto the three `PEB_LDR_DATA` lists (§4.3.1). Tail-insertion on each list.
    pub fn create_ldr_entry(&mut self, mem: &mut PhysMem, paging: &PagingContext, module_index: usize) -> LoaderResult<()> {
        let entry_va = self.heap_alloc(ldr_entry_offset::SIZE)?;

        let (base_va, entry_point, size, name) = {
            let m = &self.modules[module_index];
            (m.base_va, m.entry_point, m.size, m.name.clone())
        };

        let full_name_buf = self.heap_alloc_wide_string(mem, paging, &name)?;
        let base_name_buf = full_name_buf;

        write_va(mem, paging, entry_va + ldr_entry_offset::DLL_BASE, base_va);
        write_va(mem, paging, entry_va + ldr_entry_offset::ENTRY_POINT, entry_point);
        write_va(mem, paging, entry_va + ldr_entry_offset::SIZE_OF_IMAGE, size);

        let name_bytes = (name.encode_utf16().count() * 2) as u16;
        write_unicode_string(mem, paging, entry_va + ldr_entry_offset::FULL_DLL_NAME, name_bytes, full_name_buf);
        write_unicode_string(mem, paging, entry_va + ldr_entry_offset::BASE_DLL_NAME, name_bytes, base_name_buf);

        write_va(mem, paging, entry_va + ldr_entry_offset::FLAGS, 0);
        write_va(mem, paging, entry_va + ldr_entry_offset::TIME_DATE_STAMP, 0);

        // InInitializationOrderLinks stays self-linked until DllMain succeeds (§4.3.1).
        list_init_self(mem, paging, entry_va + ldr_entry_offset::IN_INITIALIZATION_ORDER_LINKS);
        // HashLinks starts self-linked; linked into LdrpHashTable separately once ntdll loads.
        list_init_self(mem, paging, entry_va + ldr_entry_offset::HASH_LINKS);

        list_insert_tail(
            mem,
            paging,
            self.ldr_data_va + peb_ldr_data_offset::IN_LOAD_ORDER_MODULE_LIST,
            entry_va + ldr_entry_offset::IN_LOAD_ORDER_LINKS,
        );
        list_insert_tail(
            mem,
            paging,
            self.ldr_data_va + peb_ldr_data_offset::IN_MEMORY_ORDER_MODULE_LIST,
            entry_va + ldr_entry_offset::IN_MEMORY_ORDER_LINKS,
        );

        self.modules[module_index].ldr_entry_va = entry_va;
        Ok(())
    }

    /// Hashes every loaded module's base name into ntdll's `LdrpHashTable` (§4.3 step 6). The
    /// table is a fixed array of 32 list heads at `hash_table_va`.
    pub fn link_hash_table(&mut self, mem: &mut PhysMem, paging: &PagingContext, hash_table_va: u32, buckets: u32) {
        for bucket in 0..buckets {
            list_init_self(mem, paging, hash_table_va + bucket * 8);
        }
        for module in &self.modules {
            if module.ldr_entry_va == 0 {
                continue;
            }
            let hash = ldr_hash_name(&module.name) % buckets;
            let head_va = hash_table_va + hash * 8;
            list_insert_tail(mem, paging, head_va, module.ldr_entry_va + ldr_entry_offset::HASH_LINKS);
        }
    }

    /// Overwrites a loaded module's export entry point in place (§4.10): used to intercept
    /// `Rtl*Heap`/string-converter/`GetCommandLineA`/`GetCommandLineW` exports that guest code
    /// calls directly by address rather than through an IAT slot, so
    /// [`resolve_imports`](crate::loader::imports::resolve_imports)'s IAT patching never sees
    /// them. Returns `false` if the module or export doesn't exist, or the export is a forwarder
    /// (nothing to overwrite at).
    pub fn patch_export_bytes(&self, mem: &mut PhysMem, module_index: usize, name: &str, bytes: &[u8]) -> bool {
        let module = match self.modules.get(module_index) {
            Some(m) => m,
            None => return false,
        };
        let rva = match module.exports.lookup_by_name(name) {
            ExportLookup::Resolved { rva } => rva,
            _ => return false,
        };
        mem.write_bytes(module.phys_base + rva, bytes);
        true
    }
}

fn write_va16(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u16) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write16(pa, value);
    }
}

fn write_unicode_string(mem: &mut PhysMem, paging: &PagingContext, va: u32, byte_len: u16, buffer_va: u32) {
    write_va16(mem, paging, va, byte_len);
    write_va16(mem, paging, va + 2, byte_len + 2);
    write_va(mem, paging, va + 4, buffer_va);
}

/// Windows' case-insensitive LDR name hash (same algorithm `RtlHashUnicodeString` /
/// `LdrpHashTable` insertion uses: rotate-left-by-5 over uppercased UTF-16 units).
fn ldr_hash_name(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for unit in name.to_uppercase().encode_utf16() {
        hash = hash.rotate_left(5).wrapping_add(unit as u32);
    }
    hash
}

fn apply_base_relocations(mem: &mut PhysMem, pe: &PeImage, image_phys: u32, reloc_rva: u32, reloc_size: u32, delta: i64) {
    info!("applying relocations (delta={:#x})", delta);
    let mut offset = 0u32;
    while offset < reloc_size {
        let header = pe.read_at_rva(reloc_rva + offset, 8);
        if header.len() < 8 {
            break;
        }
        let block_rva = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let block_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if block_size < 8 {
            break;
        }

        let entry_count = (block_size - 8) / 2;
        for i in 0..entry_count {
            let entry_bytes = pe.read_at_rva(reloc_rva + offset + 8 + i * 2, 2);
            if entry_bytes.len() < 2 {
                continue;
            }
            let entry = u16::from_le_bytes([entry_bytes[0], entry_bytes[1]]);
            let reloc_type = (entry >> 12) as u8;
            let rel_offset = entry & 0xFFF;

            match reloc_type {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_HIGHLOW => {
                    let addr_phys = image_phys + block_rva + rel_offset as u32;
                    let val = mem.read32(addr_phys);
                    mem.write32(addr_phys, (val as i64 + delta) as u32);
                }
                other => warn!("skipping unsupported relocation type {}", other),
            }
        }

        offset += block_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ldr_hash_is_case_insensitive() {
        assert_eq!(ldr_hash_name("ntdll.dll"), ldr_hash_name("NTDLL.DLL"));
    }
}
