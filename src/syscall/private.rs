//! The private patch range (§4.10): `0x2000`-`0x200B`. These numbers are never seen by real
//! Windows — they are what this emulator's loader rewrites `Rtl*Heap`, the ANSI/OEM/Unicode
//! string converters, and `GetCommandLine*` to inside ntdll/kernel32, since those entry points do
//! real work in-process on real Windows rather than reaching the kernel through `sysenter`.

use super::{arg, read32, write32};
use crate::arch::CpuModel;
use crate::heap::HeapAllocFlags;
use crate::ntstatus::NtStatus;
use crate::process::{peb_offset, rupp_offset, PEB_VA};
use crate::vmctx::VmContext;

pub(crate) fn dispatch<C: CpuModel>(ctx: &mut VmContext<C>, number: u32, edx: u32) -> u32 {
    match number {
        0x2000 => rtl_allocate_heap(ctx, edx),
        0x2001 => rtl_free_heap(ctx, edx),
        0x2002 => rtl_reallocate_heap(ctx, edx),
        0x2003 => rtl_size_heap(ctx, edx),
        0x2004 => rtl_multi_byte_to_unicode_n(ctx, edx),
        0x2005 => rtl_unicode_to_multi_byte_n(ctx, edx),
        0x2006 => rtl_multi_byte_to_unicode_size(ctx, edx),
        0x2007 => rtl_unicode_to_multi_byte_size(ctx, edx),
        0x2008 => rtl_multi_byte_to_unicode_n(ctx, edx), // RtlOemToUnicodeN: OEM treated as ANSI
        0x2009 => rtl_unicode_to_multi_byte_n(ctx, edx), // RtlUnicodeToOemN: ditto
        0x200A => get_command_line_a(ctx, edx),
        0x200B => get_command_line_w(ctx, edx),
        _ => NtStatus::NOT_IMPLEMENTED.as_u32(),
    }
}

fn rtl_allocate_heap<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let flags = arg(ctx, edx, 1);
    let size = arg(ctx, edx, 2);
    ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::from_bits_truncate(flags), size)
}

fn rtl_free_heap<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let ptr = arg(ctx, edx, 2);
    ctx.heap.free(&mut ctx.mem, ptr).is_ok() as u32
}

fn rtl_reallocate_heap<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let flags = arg(ctx, edx, 1);
    let ptr = arg(ctx, edx, 2);
    let size = arg(ctx, edx, 3);
    ctx.heap.realloc(&mut ctx.mem, HeapAllocFlags::from_bits_truncate(flags), ptr, size).unwrap_or(0)
}

fn rtl_size_heap<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let ptr = arg(ctx, edx, 2);
    ctx.heap.size_of(&mut ctx.mem, ptr).unwrap_or(0xFFFF_FFFF)
}

/// `RtlMultiByteToUnicodeN`/`RtlOemToUnicodeN` (§4.10): this emulator has no real code-page
/// tables, so every byte is widened as Latin-1 regardless of which entry point patched to here.
fn rtl_multi_byte_to_unicode_n<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let dest_va = arg(ctx, edx, 0);
    let max_bytes_dest = arg(ctx, edx, 1);
    let bytes_written_ptr = arg(ctx, edx, 2);
    let src_va = arg(ctx, edx, 3);
    let bytes_in_src = arg(ctx, edx, 4);

    let src = super::read_bytes_guest(ctx, src_va, bytes_in_src as usize);
    let max_units = (max_bytes_dest / 2) as usize;
    let n = src.len().min(max_units);
    for (i, &b) in src.iter().take(n).enumerate() {
        super::write16(ctx, dest_va + (i as u32) * 2, b as u16);
    }
    if bytes_written_ptr != 0 {
        write32(ctx, bytes_written_ptr, (n as u32) * 2);
    }
    NtStatus::SUCCESS.as_u32()
}

/// `RtlUnicodeToMultiByteN`/`RtlUnicodeToOemN` (§4.10): truncates each UTF-16 code unit to its
/// low byte, the Latin-1 counterpart of the widening above.
fn rtl_unicode_to_multi_byte_n<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let dest_va = arg(ctx, edx, 0);
    let max_bytes_dest = arg(ctx, edx, 1);
    let bytes_written_ptr = arg(ctx, edx, 2);
    let src_va = arg(ctx, edx, 3);
    let bytes_in_src = arg(ctx, edx, 4);

    let units = (bytes_in_src / 2) as usize;
    let max_units = max_bytes_dest as usize;
    let n = units.min(max_units);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(super::read16(ctx, src_va + (i as u32) * 2) as u8);
    }
    super::write_bytes_guest(ctx, dest_va, &out);
    if bytes_written_ptr != 0 {
        write32(ctx, bytes_written_ptr, n as u32);
    }
    NtStatus::SUCCESS.as_u32()
}

fn rtl_multi_byte_to_unicode_size<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let out_ptr = arg(ctx, edx, 0);
    let bytes_in_src = arg(ctx, edx, 2);
    write32(ctx, out_ptr, bytes_in_src * 2);
    NtStatus::SUCCESS.as_u32()
}

fn rtl_unicode_to_multi_byte_size<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let out_ptr = arg(ctx, edx, 0);
    let bytes_in_src = arg(ctx, edx, 2);
    write32(ctx, out_ptr, bytes_in_src / 2);
    NtStatus::SUCCESS.as_u32()
}

fn process_parameters_va<C: CpuModel>(ctx: &VmContext<C>) -> u32 {
    read32(ctx, PEB_VA + peb_offset::PROCESS_PARAMETERS)
}

fn get_command_line_w<C: CpuModel>(ctx: &mut VmContext<C>, _edx: u32) -> u32 {
    let params_va = process_parameters_va(ctx);
    if params_va == 0 {
        return 0;
    }
    read32(ctx, params_va + rupp_offset::COMMAND_LINE + 4) // UNICODE_STRING.Buffer
}

fn get_command_line_a<C: CpuModel>(ctx: &mut VmContext<C>, _edx: u32) -> u32 {
    let params_va = process_parameters_va(ctx);
    if params_va == 0 {
        return 0;
    }
    let command_line = super::read_unicode_string(ctx, params_va + rupp_offset::COMMAND_LINE);
    let mut bytes: Vec<u8> = command_line.chars().map(|c| c as u32 as u8).collect();
    bytes.push(0);
    let va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), bytes.len() as u32);
    if va != 0 {
        super::write_bytes_guest(ctx, va, &bytes);
    }
    va
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapAllocFlags;
    use crate::process::PROCESS_HEAP_VA;
    use crate::testutil::{booted_ctx, write_args};

    const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;

    /// Scenario 2 (spec.md §8): `RtlAllocateHeap(GetProcessHeap(), HEAP_ZERO_MEMORY, 0x100)`
    /// through a real `0x2000` `sysenter`, by way of [`dispatch`], returns a pointer inside the
    /// process heap arena whose contents read back zeroed.
    #[test]
    fn heap_allocate_and_free_round_trip() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 16);

        write_args(&mut ctx, edx, &[0, HEAP_ZERO_MEMORY, 0x100]);
        let ptr = dispatch(&mut ctx, 0x2000, edx);
        assert!(ptr >= PROCESS_HEAP_VA && ptr < PROCESS_HEAP_VA + crate::process::PROCESS_HEAP_SIZE);
        assert_eq!(ptr % 8, 0);
        for i in 0..0x100u32 {
            assert_eq!(read32(&ctx, ptr + i) & 0xFF, 0);
        }

        write_args(&mut ctx, edx, &[0, 0, ptr]);
        let freed = dispatch(&mut ctx, 0x2001, edx);
        assert_eq!(freed, 1);

        let second_free = dispatch(&mut ctx, 0x2001, edx);
        assert_eq!(second_free, 0, "a second free of the same pointer must be rejected");
    }

    #[test]
    fn heap_size_reflects_the_requested_allocation() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 16);
        write_args(&mut ctx, edx, &[0, 0, 0x40]);
        let ptr = dispatch(&mut ctx, 0x2000, edx);

        write_args(&mut ctx, edx, &[0, 0, ptr]);
        assert_eq!(dispatch(&mut ctx, 0x2003, edx), 0x40);
    }
}
