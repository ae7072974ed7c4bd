//! Stub code generator (§4.5): small hand-assembled x86 trampolines written into a dedicated
//! guest VA region, used for two purposes: redirecting a known ntdll/win32u import straight
//! into a syscall, and patching `Rtl*Heap`/string-converter/`GetCommandLine*` entry points
//! (§4.10) to do the same without an interpreter-level intercept table.

use crate::error::LoaderError;
use crate::mem::PhysMem;
use crate::paging::{PagingContext, PteFlags};
use std::collections::HashMap;

/// Each stub is padded out to a 16-byte slot regardless of how many bytes its encoding uses.
const STUB_SLOT_SIZE: u32 = 16;

/// What a stub does once control reaches it.
#[derive(Clone, Debug)]
pub enum StubKind {
    /// `mov eax, imm; mov edx, esp; sysenter; ret num_args*4`.
    Syscall { syscall_num: u32, num_args: u16 },
    /// `xor eax, eax; ret num_args*4`.
    ReturnZero { num_args: u16 },
    /// `mov eax, imm; ret num_args*4`.
    ReturnError { return_value: u32, num_args: u16 },
}

impl StubKind {
    /// Encodes this stub's bytes. `pub(crate)` beyond [`StubManager::generate`]'s own use: also
    /// reused by [`crate::loader::module::ModuleManager::patch_export_bytes`] to overwrite an
    /// export's entry point with the same trampoline bytes, rather than allocating a stub slot.
    pub(crate) fn encode(&self) -> Vec<u8> {
        match *self {
            StubKind::Syscall { syscall_num, num_args } => {
                let mut bytes = vec![0xB8];
                bytes.extend_from_slice(&syscall_num.to_le_bytes());
                bytes.extend_from_slice(&[0x89, 0xE2, 0x0F, 0x34, 0xC2]);
                bytes.extend_from_slice(&(num_args.wrapping_mul(4)).to_le_bytes());
                bytes
            }
            StubKind::ReturnZero { num_args } => {
                let mut bytes = vec![0x31, 0xC0, 0xC2];
                bytes.extend_from_slice(&(num_args.wrapping_mul(4)).to_le_bytes());
                bytes
            }
            StubKind::ReturnError { return_value, num_args } => {
                let mut bytes = vec![0xB8];
                bytes.extend_from_slice(&return_value.to_le_bytes());
                bytes.push(0xC2);
                bytes.extend_from_slice(&(num_args.wrapping_mul(4)).to_le_bytes());
                bytes
            }
        }
    }
}

/// Owns the stub code region and a name-keyed registry of stubs already emitted into it, so a
/// second request for the same name returns the first stub's VA (§4.5 final paragraph).
pub struct StubManager {
    region_va: u32,
    region_phys: u32,
    region_size: u32,
    alloc_offset: u32,
    registry: HashMap<String, u32>,
}

impl StubManager {
    /// Allocates and maps `region_size` bytes of guest VA starting at `region_va`, backed by a
    /// freshly bump-allocated physical region, filled with `int3` until stubs are emitted into
    /// it.
    pub fn new(
        mem: &mut PhysMem,
        paging: &mut PagingContext,
        region_va: u32,
        region_size: u32,
    ) -> Result<Self, LoaderError> {
        let region_phys = paging.alloc_phys(mem, region_size);
        if region_phys == 0 {
            return Err(LoaderError::StubRegionExhausted);
        }

        paging.map_range(mem, region_va, region_phys, region_size, PteFlags::PRESENT | PteFlags::USER)?;

        for i in 0..region_size {
            mem.write8(region_phys + i, 0xCC);
        }

        Ok(Self {
            region_va,
            region_phys,
            region_size,
            alloc_offset: 0,
            registry: HashMap::new(),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.registry.get(name).copied()
    }

    /// Emits a new stub for `name`. Fails if the region is exhausted.
    pub fn generate(&mut self, mem: &mut PhysMem, name: &str, kind: StubKind) -> Result<u32, LoaderError> {
        if self.alloc_offset + STUB_SLOT_SIZE > self.region_size {
            return Err(LoaderError::StubRegionExhausted);
        }

        let stub_va = self.region_va + self.alloc_offset;
        let stub_phys = self.region_phys + self.alloc_offset;

        let encoded = kind.encode();
        mem.write_bytes(stub_phys, &encoded);

        self.alloc_offset += STUB_SLOT_SIZE;
        self.registry.insert(name.to_string(), stub_va);
        Ok(stub_va)
    }

    /// Returns the existing stub for `name`, or generates one.
    pub fn get_or_create(&mut self, mem: &mut PhysMem, name: &str, kind: StubKind) -> Result<u32, LoaderError> {
        if let Some(va) = self.lookup(name) {
            return Ok(va);
        }
        self.generate(mem, name, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PhysMem, PagingContext, StubManager) {
        let mut mem = PhysMem::new(4 * 1024 * 1024);
        let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x200000)).unwrap();
        let mgr = StubManager::new(&mut mem, &mut paging, 0x7F00_0000, 0x1000).unwrap();
        (mem, paging, mgr)
    }

    #[test]
    fn syscall_stub_encodes_expected_bytes() {
        let (mut mem, mut paging, mut mgr) = setup();
        let va = mgr
            .generate(&mut mem, "NtClose", StubKind::Syscall { syscall_num: 0x19, num_args: 1 })
            .unwrap();
        let pa = paging.translate(&mem, va).unwrap();
        let bytes = mem.read_bytes(pa, 10);
        assert_eq!(bytes, vec![0xB8, 0x19, 0x00, 0x00, 0x00, 0x89, 0xE2, 0x0F, 0x34, 0xC2]);
    }

    #[test]
    fn second_request_for_same_name_returns_same_stub() {
        let (mut mem, _paging, mut mgr) = setup();
        let a = mgr
            .generate(&mut mem, "NtClose", StubKind::ReturnZero { num_args: 1 })
            .unwrap();
        let b = mgr.get_or_create(&mut mem, "NtClose", StubKind::ReturnZero { num_args: 1 }).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn return_error_stub_encodes_return_value() {
        let (mut mem, mut paging, mut mgr) = setup();
        let va = mgr
            .generate(&mut mem, "Fake", StubKind::ReturnError { return_value: 0xC000_0001, num_args: 2 })
            .unwrap();
        let pa = paging.translate(&mem, va).unwrap();
        let bytes = mem.read_bytes(pa, 8);
        assert_eq!(bytes, vec![0xB8, 0x01, 0x00, 0x00, 0xC0, 0xC2, 0x08, 0x00]);
    }
}
