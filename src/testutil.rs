//! Shared test-only scaffolding: a [`NullCpu`] fake satisfying [`CpuModel`] without decoding any
//! actual x86, plus a minimal hand-built PE image. Used by every module's `#[cfg(test)]` block
//! that needs a booted [`crate::vmctx::VmContext`] to exercise syscall handlers, the loader, or
//! the USER subsystem without a real interpreter — the same role `hy-rs`'s test suite would give
//! a fake hypervisor backend.

#![cfg(test)]

use crate::arch::{
    ControlRegister, CpuExit, CpuModel, DescriptorTable, DescriptorTableRegister, Register, Segment,
    SegmentRegister,
};
use std::collections::HashMap;
use std::path::Path;

/// A [`CpuModel`] that tracks register writes in a map and never actually runs guest code:
/// [`run_slice`](CpuModel::run_slice) always reports [`CpuExit::SliceExhausted`] (or
/// [`CpuExit::ExitRequested`] once asked to stop). Enough to drive [`VmContext::boot`] and any
/// syscall handler invoked directly (bypassing `sysenter` decode, the same seam the external
/// interpreter hands control through).
pub(crate) struct NullCpu {
    registers: HashMap<&'static str, u32>,
    aborted: bool,
    exit_requested: bool,
}

impl NullCpu {
    pub(crate) fn new() -> Self {
        Self { registers: HashMap::new(), aborted: false, exit_requested: false }
    }

    fn key(reg: Register) -> &'static str {
        match reg {
            Register::Eax => "eax",
            Register::Ecx => "ecx",
            Register::Edx => "edx",
            Register::Ebx => "ebx",
            Register::Esp => "esp",
            Register::Ebp => "ebp",
            Register::Esi => "esi",
            Register::Edi => "edi",
            Register::Eip => "eip",
            Register::Eflags => "eflags",
        }
    }
}

impl CpuModel for NullCpu {
    fn get_registers(&self, registers: &[Register]) -> Vec<u32> {
        registers.iter().map(|r| *self.registers.get(Self::key(*r)).unwrap_or(&0)).collect()
    }
    fn set_registers(&mut self, registers: &[Register], values: &[u32]) {
        for (r, v) in registers.iter().zip(values) {
            self.registers.insert(Self::key(*r), *v);
        }
    }
    fn get_control_registers(&self, registers: &[ControlRegister]) -> Vec<u32> {
        vec![0; registers.len()]
    }
    fn set_control_registers(&mut self, _registers: &[ControlRegister], _values: &[u32]) {}
    fn get_msrs(&self, msrs: &[u32]) -> Vec<u32> {
        vec![0; msrs.len()]
    }
    fn set_msrs(&mut self, _msrs: &[u32], _values: &[u32]) {}
    fn get_segment_registers(&self, registers: &[SegmentRegister]) -> Vec<Segment> {
        registers.iter().map(|_| Segment::default()).collect()
    }
    fn set_segment_registers(&mut self, _registers: &[SegmentRegister], _values: &[Segment]) {}
    fn get_descriptor_tables(&self, registers: &[DescriptorTableRegister]) -> Vec<DescriptorTable> {
        registers.iter().map(|_| DescriptorTable { base: 0, limit: 0 }).collect()
    }
    fn set_descriptor_tables(&mut self, _registers: &[DescriptorTableRegister], _values: &[DescriptorTable]) {}
    fn run_slice(&mut self, _cycles: u32) -> CpuExit {
        if self.exit_requested {
            CpuExit::ExitRequested
        } else {
            CpuExit::SliceExhausted
        }
    }
    fn aborted(&self) -> bool {
        self.aborted
    }
    fn clear_abort(&mut self) {
        self.aborted = false;
    }
    fn request_exit(&mut self) {
        self.exit_requested = true;
    }
    fn clear_exit_request(&mut self) {
        self.exit_requested = false;
    }
    fn flush_mmu(&mut self) {}
}

/// A single-section PE32 image, `.text` at RVA `0x1000`, entry point RVA `0x1000`, image base
/// `0x0040_0000`: enough for [`crate::pe`] to parse and [`crate::loader::module`] to map without
/// needing real machine code behind the entry point (nothing ever executes it under
/// [`NullCpu`]).
pub(crate) fn minimal_exe() -> Vec<u8> {
    let mut buf = vec![0u8; 0x200];
    buf[0] = b'M';
    buf[1] = b'Z';
    buf[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());

    let pe = 0x80usize;
    buf[pe..pe + 4].copy_from_slice(b"PE\0\0");
    buf[pe + 4..pe + 6].copy_from_slice(&0x014Cu16.to_le_bytes()); // machine: i386
    buf[pe + 6..pe + 8].copy_from_slice(&1u16.to_le_bytes()); // number of sections
    buf[pe + 16..pe + 18].copy_from_slice(&96u16.to_le_bytes()); // size of optional header

    let opt = pe + 24;
    buf[opt..opt + 2].copy_from_slice(&0x010Bu16.to_le_bytes()); // magic
    buf[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes()); // entry point rva
    buf[opt + 28..opt + 32].copy_from_slice(&0x0040_0000u32.to_le_bytes()); // image base
    buf[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes()); // section alignment
    buf[opt + 36..opt + 40].copy_from_slice(&0x200u32.to_le_bytes()); // file alignment
    buf[opt + 56..opt + 60].copy_from_slice(&0x3000u32.to_le_bytes()); // size of image
    buf[opt + 60..opt + 64].copy_from_slice(&0x200u32.to_le_bytes()); // size of headers

    let sec = opt + 96;
    buf[sec..sec + 8].copy_from_slice(b".text\0\0\0");
    buf[sec + 8..sec + 12].copy_from_slice(&0x1000u32.to_le_bytes()); // virtual size
    buf[sec + 12..sec + 16].copy_from_slice(&0x1000u32.to_le_bytes()); // virtual address
    buf[sec + 16..sec + 20].copy_from_slice(&0x200u32.to_le_bytes()); // raw size
    buf[sec + 20..sec + 24].copy_from_slice(&0x200u32.to_le_bytes()); // raw offset

    buf
}

pub(crate) fn write_minimal_ntdll(dir: &Path) {
    std::fs::write(dir.join("ntdll.dll"), minimal_exe()).unwrap();
}

/// Sets up `<tmp>/windows/system32/ntdll.dll` and `<tmp>/hello.exe`, both the minimal image
/// above, and returns the temp dir alongside the guest EXE path ready for [`VmContext::boot`].
pub(crate) fn minimal_jail() -> (tempfile::TempDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("windows/system32")).unwrap();
    write_minimal_ntdll(&tmp.path().join("windows/system32"));
    let exe_path = tmp.path().join("hello.exe");
    std::fs::write(&exe_path, minimal_exe()).unwrap();
    (tmp, exe_path)
}

/// Boots a [`VmContext<NullCpu>`] over a fresh [`minimal_jail`], for tests that only need a live
/// context to call a syscall handler or loader/heap API directly against — no DLL init, no
/// running CPU.
pub(crate) fn booted_ctx() -> (tempfile::TempDir, crate::vmctx::VmContext<NullCpu>) {
    let (tmp, exe_path) = minimal_jail();
    let vfs = crate::vfs::VfsJail::new(exe_path.parent().unwrap()).unwrap();
    let ctx = crate::vmctx::VmContext::boot(NullCpu::new(), 64 * 1024 * 1024, vfs, &exe_path, "hello.exe").unwrap();
    (tmp, ctx)
}

/// Writes a stdcall argument frame at `edx` so that `arg(ctx, edx, i) == args[i]` for every
/// syscall handler test that calls a dispatch function directly (the same layout `sysenter`
/// leaves behind per §4.7: `[edx+4]` is argument 0).
pub(crate) fn write_args<C: CpuModel>(ctx: &mut crate::vmctx::VmContext<C>, edx: u32, args: &[u32]) {
    for (i, &value) in args.iter().enumerate() {
        crate::syscall::write32(ctx, edx + 4 + (i as u32) * 4, value);
    }
}

/// Writes a `UNICODE_STRING { Length, MaximumLength, Buffer }` at `va` pointing at `buffer_va`,
/// and the UTF-16 encoding of `s` (NUL-terminated) at `buffer_va`.
pub(crate) fn write_unicode_string<C: CpuModel>(
    ctx: &mut crate::vmctx::VmContext<C>,
    va: u32,
    buffer_va: u32,
    s: &str,
) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let length = (units.len() * 2) as u16;
    crate::syscall::write16(ctx, va, length);
    crate::syscall::write16(ctx, va + 2, length + 2);
    crate::syscall::write32(ctx, va + 4, buffer_va);
    crate::syscall::write_wide_cstr(ctx, buffer_va, s);
}

/// Writes an `OBJECT_ATTRIBUTES` at `va` whose `ObjectName` (offset 8) points at `name_va`, a
/// `UNICODE_STRING` naming `path` with its buffer at `name_buffer_va`.
pub(crate) fn write_object_attributes<C: CpuModel>(
    ctx: &mut crate::vmctx::VmContext<C>,
    va: u32,
    name_va: u32,
    name_buffer_va: u32,
    path: &str,
) {
    write_unicode_string(ctx, name_va, name_buffer_va, path);
    crate::syscall::write32(ctx, va + 8, name_va);
}
