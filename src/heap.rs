//! The process heap (§4.10): rather than emulating `RtlAllocateHeap`'s internal free
//! lists, the loader patches the first bytes of `Rtl*Heap`, the string converters, and
//! `GetCommandLineA/W` with syscall stubs (§4.5) and this module services the resulting
//! syscalls with a bump allocator over a dedicated guest VA region.

use crate::error::{HeapError, HeapResult};
use crate::mem::PhysMem;
use crate::paging::{PagingContext, PteFlags};
use bitflags::bitflags;
use log::warn;

bitflags! {
 /// `HEAP_*` flags accepted by `RtlAllocateHeap`/`RtlFreeHeap`. Only the bits this emulator
 /// inspects are modeled.
 pub struct HeapAllocFlags: u32 {
 const NO_SERIALIZE = 0x0000_0001;
 const GENERATE_EXCEPTIONS = 0x0000_0004;
 const ZERO_MEMORY = 0x0000_0008;
 const REALLOC_IN_PLACE_ONLY = 0x0000_0010;
 }
}

const MAGIC_LIVE: u32 = 0xABCD_1234;
const MAGIC_FREED: u32 = 0xDEAD_5678;
/// `{ magic: u32, size: u32, flags: u32 }`, matching the prior implementation's
/// `heap_alloc_header_t` (§4.10, §8 scenario 2 describes the result as "8-byte aligned after
/// the 12-byte header").
const HEADER_SIZE: u32 = 12;

/// A single process heap: a bump allocator over `[base_va, base_va + size)` of guest VA, with
/// an 8-byte-aligned, 12-byte allocation header in front of every block (§3).
pub struct HeapState {
 base_va: u32,
 base_phys: u32,
 size: u32,
 alloc_offset: u32,
 total_allocated: u64,
 total_freed: u64,
 num_allocations: u64,
}

impl HeapState {
 /// Allocates and maps `size` bytes of guest VA as the process heap.
 pub fn new(mem: &mut PhysMem, paging: &mut PagingContext, base_va: u32, size: u32) -> HeapResult<Self> {
 let base_phys = paging.alloc_phys(mem, size);
 if base_phys == 0 {
 return Err(HeapError::OutOfMemory);
 }
 paging
 .map_range(mem, base_va, base_phys, size, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
 .map_err(|_| HeapError::OutOfMemory)?;

 Ok(Self {
 base_va,
 base_phys,
 size,
 alloc_offset: 0,
 total_allocated: 0,
 total_freed: 0,
 num_allocations: 0,
 })
 }

 pub fn base_va(&self) -> u32 {
 self.base_va
 }

 fn contains(&self, va: u32) -> bool {
 va >= self.base_va && va < self.base_va + self.size
 }

 fn va_to_phys(&self, va: u32) -> u32 {
 self.base_phys + (va - self.base_va)
 }

 /// `RtlAllocateHeap`: bump-allocates `size` bytes plus a header, optionally zero-filling the
 /// user-visible payload when `HEAP_ZERO_MEMORY` is set. Returns 0 on exhaustion.
 ///
 /// The 12-byte header is not itself 8-byte aligned, but the data pointer handed back always
 /// is (§8 scenario 2): `data_offset` is rounded up so that `base_va + data_offset` lands on
 /// an 8-byte boundary regardless of where the previous block's end left `alloc_offset`,
 /// then the header is backdated from there.
 pub fn alloc(&mut self, mem: &mut PhysMem, flags: HeapAllocFlags, size: u32) -> u32 {
 let aligned_payload = (size + 7) & !7;
 let data_offset = (self.alloc_offset + HEADER_SIZE + 7) & !7;
 let header_offset = data_offset - HEADER_SIZE;
 let block_end = data_offset + aligned_payload;

 if block_end > self.size {
 warn!("heap: exhausted (requested {} bytes, {} remaining)", size, self.size - self.alloc_offset);
 return 0;
 }

 let header_va = self.base_va + header_offset;
 let header_pa = self.va_to_phys(header_va);
 mem.write32(header_pa, MAGIC_LIVE);
 mem.write32(header_pa + 4, size);
 mem.write32(header_pa + 8, flags.bits);

 let data_va = self.base_va + data_offset;
 if flags.contains(HeapAllocFlags::ZERO_MEMORY) {
 mem.zero_range(self.va_to_phys(data_va), aligned_payload as usize);
 }

 self.alloc_offset = block_end;
 self.total_allocated += size as u64;
 self.num_allocations += 1;
 data_va
 }

 /// `RtlFreeHeap`: validates the header immediately before `ptr`, flips its magic to
 /// `FREED`, and reports a double free rather than corrupting or crashing.
 pub fn free(&mut self, mem: &mut PhysMem, ptr: u32) -> HeapResult<()> {
 if ptr < self.base_va + HEADER_SIZE || !self.contains(ptr) {
 return Err(HeapError::OutOfRange(ptr));
 }
 let header_va = ptr - HEADER_SIZE;
 let header_pa = self.va_to_phys(header_va);
 let magic = mem.read32(header_pa);

 match magic {
 MAGIC_LIVE => {
 let size = mem.read32(header_pa + 4);
 mem.write32(header_pa, MAGIC_FREED);
 self.total_freed += size as u64;
 Ok(())
 }
 MAGIC_FREED => {
 warn!("heap: double free detected at {:#010x}", ptr);
 Err(HeapError::DoubleFree(ptr))
 }
 _ => Err(HeapError::BadMagic(header_va)),
 }
 }

 /// `RtlSizeHeap`: returns the originally requested size, or `u32::MAX` on a bad pointer.
 pub fn size_of(&self, mem: &PhysMem, ptr: u32) -> HeapResult<u32> {
 if ptr < self.base_va + HEADER_SIZE || !self.contains(ptr) {
 return Err(HeapError::OutOfRange(ptr));
 }
 let header_va = ptr - HEADER_SIZE;
 let header_pa = self.va_to_phys(header_va);
 match mem.read32(header_pa) {
 MAGIC_LIVE => Ok(mem.read32(header_pa + 4)),
 MAGIC_FREED => Err(HeapError::DoubleFree(ptr)),
 _ => Err(HeapError::BadMagic(header_va)),
 }
 }

 /// `RtlReAllocateHeap`: the backing store never reclaims, so a realloc is a fresh
 /// allocation plus a copy of `min(old_size, new_size)` bytes and a free of the original.
 pub fn realloc(&mut self, mem: &mut PhysMem, flags: HeapAllocFlags, ptr: u32, new_size: u32) -> HeapResult<u32> {
 let old_size = self.size_of(mem, ptr)?;
 let new_ptr = self.alloc(mem, flags, new_size);
 if new_ptr == 0 {
 return Err(HeapError::OutOfMemory);
 }
 let copy_len = old_size.min(new_size) as usize;
 let bytes = mem.read_bytes(self.va_to_phys(ptr), copy_len);
 mem.write_bytes(self.va_to_phys(new_ptr), &bytes);
 self.free(mem, ptr)?;
 Ok(new_ptr)
 }

 pub fn stats(&self) -> (u64, u64, u64) {
 (self.total_allocated, self.total_freed, self.num_allocations)
 }
}

#[cfg(test)]
mod tests {
 use super::*;

 fn setup() -> (PhysMem, PagingContext, HeapState) {
 let mut mem = PhysMem::new(8 * 1024 * 1024);
 let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x20000)).unwrap();
 let heap = HeapState::new(&mut mem, &mut paging, 0x1000_0000, 0x10_0000).unwrap();
 (mem, paging, heap)
 }

 #[test]
 fn alloc_zero_memory_reads_back_zero() {
 let (mut mem, _paging, mut heap) = setup();
 let ptr = heap.alloc(&mut mem, HeapAllocFlags::ZERO_MEMORY, 0x100);
 assert_ne!(ptr, 0);
 assert!(ptr >= 0x1000_0000 && ptr < 0x1010_0000);
 assert_eq!(mem.read_bytes(heap.va_to_phys(ptr), 0x100), vec![0u8; 0x100]);
 }

 #[test]
 fn free_then_double_free_is_rejected() {
 let (mut mem, _paging, mut heap) = setup();
 let ptr = heap.alloc(&mut mem, HeapAllocFlags::empty(), 0x40);
 assert!(heap.free(&mut mem, ptr).is_ok());
 assert!(matches!(heap.free(&mut mem, ptr), Err(HeapError::DoubleFree(_))));
 }

 #[test]
 fn free_outside_arena_is_rejected() {
 let (mut mem, _paging, mut heap) = setup();
 assert!(matches!(heap.free(&mut mem, 0x2000_0000), Err(HeapError::OutOfRange(_))));
 }

 #[test]
 fn successive_allocations_are_always_8_byte_aligned() {
 let (mut mem, _paging, mut heap) = setup();
 for size in [0x100, 1, 7, 13, 256, 3] {
 let ptr = heap.alloc(&mut mem, HeapAllocFlags::empty(), size);
 assert_ne!(ptr, 0);
 assert_eq!(ptr % 8, 0, "pointer for size {} was not 8-byte aligned", size);
 }
 }

 #[test]
 fn realloc_preserves_prefix_and_frees_original() {
 let (mut mem, _paging, mut heap) = setup();
 let ptr = heap.alloc(&mut mem, HeapAllocFlags::empty(), 4);
 mem.write32(heap.va_to_phys(ptr), 0x1122_3344);
 let new_ptr = heap.realloc(&mut mem, HeapAllocFlags::empty(), ptr, 8).unwrap();
 assert_eq!(mem.read32(heap.va_to_phys(new_ptr)), 0x1122_3344);
 assert!(matches!(heap.free(&mut mem, ptr), Err(HeapError::DoubleFree(_))));
 }
}
