//! Kernel-to-user callbacks (§4.13): the mechanism by which a syscall handler (e.g.
//! `NtUserCreateWindowEx`, the message dispatch loop) invokes a guest `WndProc` and gets control
//! back, implemented as a stack of saved register frames rather than a second interpreter.

use crate::arch::x86::{get_register, set_register, CpuModel, Register};
use crate::error::{CallbackError, CallbackResult};
use crate::mem::PhysMem;
use crate::paging::PagingContext;

/// Sentinel syscall numbers (§4.7, §4.13): issued by the tiny return stubs this emulator's stub
/// generator places in the stub region, never by guest code directly. The dispatcher must check
/// for these before consulting its normal syscall-number table.
pub const SENTINEL_DLL_INIT_RETURN: u32 = 0xFFFE;
pub const SENTINEL_WNDPROC_RETURN: u32 = 0xFFFD;

/// The maximum number of nested `WndProc` invocations (§4.13); guards against a guest `WndProc`
/// that calls back into the window manager in a way that would recurse forever.
pub const MAX_CALLBACK_DEPTH: usize = 16;

/// Registers saved across a callback invocation and restored when the guest returns via
/// [`SENTINEL_WNDPROC_RETURN`].
#[derive(Debug, Clone, Copy)]
struct SavedRegs {
 eip: u32,
 esp: u32,
 eax: u32,
 ebx: u32,
 ecx: u32,
 edx: u32,
 esi: u32,
 edi: u32,
 ebp: u32,
 eflags: u32,
}

fn save_regs<C: CpuModel + ?Sized>(cpu: &C) -> SavedRegs {
 SavedRegs {
 eip: get_register(cpu, Register::Eip),
 esp: get_register(cpu, Register::Esp),
 eax: get_register(cpu, Register::Eax),
 ebx: get_register(cpu, Register::Ebx),
 ecx: get_register(cpu, Register::Ecx),
 edx: get_register(cpu, Register::Edx),
 esi: get_register(cpu, Register::Esi),
 edi: get_register(cpu, Register::Edi),
 ebp: get_register(cpu, Register::Ebp),
 eflags: get_register(cpu, Register::Eflags),
 }
}

fn restore_regs<C: CpuModel + ?Sized>(cpu: &mut C, regs: &SavedRegs) {
 set_register(cpu, Register::Eip, regs.eip);
 set_register(cpu, Register::Esp, regs.esp);
 set_register(cpu, Register::Eax, regs.eax);
 set_register(cpu, Register::Ebx, regs.ebx);
 set_register(cpu, Register::Ecx, regs.ecx);
 set_register(cpu, Register::Edx, regs.edx);
 set_register(cpu, Register::Esi, regs.esi);
 set_register(cpu, Register::Edi, regs.edi);
 set_register(cpu, Register::Ebp, regs.ebp);
 set_register(cpu, Register::Eflags, regs.eflags);
}

/// Guest `CREATESTRUCTW` field offsets (§4.13); built fresh for every `WM_NCCREATE`/`WM_CREATE`
/// dispatch since `lpszName`/`lpszClass` must be rewritten per call (a string pointer for a
/// named class, the raw atom for an atom-registered one).
pub mod createstruct_offset {
 pub const LPCREATEPARAMS: u32 = 0x00;
 pub const HINSTANCE: u32 = 0x04;
 pub const HMENU: u32 = 0x08;
 pub const HWNDPARENT: u32 = 0x0C;
 pub const CY: u32 = 0x10;
 pub const CX: u32 = 0x14;
 pub const Y: u32 = 0x18;
 pub const X: u32 = 0x1C;
 pub const STYLE: u32 = 0x20;
 pub const LPSZNAME: u32 = 0x24;
 pub const LPSZCLASS: u32 = 0x28;
 pub const DWEXSTYLE: u32 = 0x2C;
 pub const SIZE: u32 = 0x30;
}

/// Parameters needed to fill a guest `CREATESTRUCTW` (§4.13).
#[allow(clippy::too_many_arguments)]
pub struct CreateStructParams {
 pub lp_create_params: u32,
 pub h_instance: u32,
 pub h_menu: u32,
 pub hwnd_parent: u32,
 pub cy: i32,
 pub cx: i32,
 pub y: i32,
 pub x: i32,
 pub style: u32,
 pub lpsz_name_va: u32,
 /// Either a class atom (low 16 bits, high 16 bits zero) or a guest string VA, per the
 /// `RegisterClassEx`-by-name-vs-by-atom convention (§4.11, §4.13).
 pub lpsz_class: u32,
 pub ex_style: u32,
}

fn write32(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u32) {
 if let Some(pa) = paging.translate(mem, va) {
 mem.write32(pa, value);
 }
}

/// Writes a `CREATESTRUCTW` at `va`, which the caller must have already allocated
/// (`createstruct_offset::SIZE` bytes, typically out of the loader heap).
pub fn write_createstruct(mem: &mut PhysMem, paging: &PagingContext, va: u32, params: &CreateStructParams) {
 write32(mem, paging, va + createstruct_offset::LPCREATEPARAMS, params.lp_create_params);
 write32(mem, paging, va + createstruct_offset::HINSTANCE, params.h_instance);
 write32(mem, paging, va + createstruct_offset::HMENU, params.h_menu);
 write32(mem, paging, va + createstruct_offset::HWNDPARENT, params.hwnd_parent);
 write32(mem, paging, va + createstruct_offset::CY, params.cy as u32);
 write32(mem, paging, va + createstruct_offset::CX, params.cx as u32);
 write32(mem, paging, va + createstruct_offset::Y, params.y as u32);
 write32(mem, paging, va + createstruct_offset::X, params.x as u32);
 write32(mem, paging, va + createstruct_offset::STYLE, params.style);
 write32(mem, paging, va + createstruct_offset::LPSZNAME, params.lpsz_name_va);
 write32(mem, paging, va + createstruct_offset::LPSZCLASS, params.lpsz_class);
 write32(mem, paging, va + createstruct_offset::DWEXSTYLE, params.ex_style);
}

/// The stack of in-flight callback invocations (§4.13). Only one thread ever runs at a
/// time (§5), so a single global-ish stack per process is sufficient; `vmctx` owns the instance.
#[derive(Default)]
pub struct CallbackStack {
 frames: Vec<SavedRegs>,
}

impl CallbackStack {
 pub fn new() -> Self {
 Self { frames: Vec::new() }
 }

 pub fn depth(&self) -> usize {
 self.frames.len()
 }

 pub fn is_active(&self) -> bool {
 !self.frames.is_empty()
 }
}

/// Invokes `wnd_proc_va` with the stdcall arguments `(hwnd, msg, w_param, l_param)` (§4.13): saves
/// the caller's register state, pushes a stdcall frame whose return address is
/// `return_stub_va` (a tiny trampoline that issues `sysenter` with
/// [`SENTINEL_WNDPROC_RETURN`]), and redirects `eip`/`esp` into the callee. The caller is
/// responsible for driving `run_slice` afterwards and routing a [`SENTINEL_WNDPROC_RETURN`]
/// `sysenter` back to [`callback_return`].
#[allow(clippy::too_many_arguments)]
pub fn call_wndproc<C: CpuModel + ?Sized>(
 cpu: &mut C,
 mem: &mut PhysMem,
 paging: &PagingContext,
 stack: &mut CallbackStack,
 wnd_proc_va: u32,
 return_stub_va: u32,
 hwnd: u32,
 msg: u32,
 w_param: u32,
 l_param: u32,
) -> CallbackResult<()> {
 if stack.frames.len() >= MAX_CALLBACK_DEPTH {
 return Err(CallbackError::TooDeep(MAX_CALLBACK_DEPTH));
 }

 stack.frames.push(save_regs(cpu));

 let mut esp = get_register(cpu, Register::Esp);
 let mut push = |cpu: &mut C, esp: &mut u32, value: u32| {
 *esp -= 4;
 write32(mem, paging, *esp, value);
 set_register(cpu, Register::Esp, *esp);
 };
 push(cpu, &mut esp, l_param);
 push(cpu, &mut esp, w_param);
 push(cpu, &mut esp, msg);
 push(cpu, &mut esp, hwnd);
 push(cpu, &mut esp, return_stub_va);

 set_register(cpu, Register::Eip, wnd_proc_va);
 Ok(())
}

/// Completes a callback invocation after the return stub's `sysenter` has been observed (§4.13
/// step 6): pops the saved frame, restores the caller's registers, and returns the `WndProc`'s
/// `eax` result (the guest stack was already popped by the stdcall callee itself).
pub fn callback_return<C: CpuModel + ?Sized>(cpu: &mut C, stack: &mut CallbackStack) -> Option<u32> {
 let result = get_register(cpu, Register::Eax);
 let saved = stack.frames.pop()?;
 restore_regs(cpu, &saved);
 Some(result)
}

#[cfg(test)]
mod tests {
 use super::*;
 use crate::arch::x86::{ControlRegister, DescriptorTable, DescriptorTableRegister, Segment, SegmentRegister};
 use crate::paging::PteFlags;

 struct FakeCpu {
 regs: [u32; 10],
 }

 impl FakeCpu {
 fn new() -> Self {
 Self { regs: [0; 10] }
 }
 fn slot(r: Register) -> usize {
 match r {
 Register::Eax => 0,
 Register::Ecx => 1,
 Register::Edx => 2,
 Register::Ebx => 3,
 Register::Esp => 4,
 Register::Ebp => 5,
 Register::Esi => 6,
 Register::Edi => 7,
 Register::Eip => 8,
 Register::Eflags => 9,
 }
 }
 }

 impl CpuModel for FakeCpu {
 fn get_registers(&self, registers: &[Register]) -> Vec<u32> {
 registers.iter().map(|r| self.regs[Self::slot(*r)]).collect()
 }
 fn set_registers(&mut self, registers: &[Register], values: &[u32]) {
 for (r, v) in registers.iter().zip(values) {
 self.regs[Self::slot(*r)] = *v;
 }
 }
 fn get_control_registers(&self, _: &[ControlRegister]) -> Vec<u32> {
 vec![]
 }
 fn set_control_registers(&mut self, _: &[ControlRegister], _: &[u32]) {}
 fn get_msrs(&self, _: &[u32]) -> Vec<u32> {
 vec![]
 }
 fn set_msrs(&mut self, _: &[u32], _: &[u32]) {}
 fn get_segment_registers(&self, _: &[SegmentRegister]) -> Vec<Segment> {
 vec![]
 }
 fn set_segment_registers(&mut self, _: &[SegmentRegister], _: &[Segment]) {}
 fn get_descriptor_tables(&self, _: &[DescriptorTableRegister]) -> Vec<DescriptorTable> {
 vec![]
 }
 fn set_descriptor_tables(&mut self, _: &[DescriptorTableRegister], _: &[DescriptorTable]) {}
 fn run_slice(&mut self, _: u32) -> crate::arch::x86::CpuExit {
 crate::arch::x86::CpuExit::SliceExhausted
 }
 fn aborted(&self) -> bool {
 false
 }
 fn clear_abort(&mut self) {}
 fn request_exit(&mut self) {}
 fn clear_exit_request(&mut self) {}
 fn flush_mmu(&mut self) {}
 }

 fn setup() -> (PhysMem, PagingContext, FakeCpu) {
 let mut mem = PhysMem::new(1024 * 1024);
 let paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x80000)).unwrap();
 (mem, paging, FakeCpu::new())
 }

 #[test]
 fn call_then_return_restores_caller_state() {
 let (mut mem, mut paging, mut cpu) = setup();
 paging.map_range(&mut mem, 0x7ffd0000, 0x20000, 0x1000, PteFlags::PRESENT | PteFlags::WRITABLE).unwrap();
 set_register(&mut cpu, Register::Eip, 0x0040_1000);
 set_register(&mut cpu, Register::Esp, 0x7ffd0ff0);

 let mut stack = CallbackStack::new();
 call_wndproc(&mut cpu, &mut mem, &paging, &mut stack, 0x0050_2000, 0x7f00_0010, 7, 0x0001, 0, 0).unwrap();

 assert_eq!(get_register(&cpu, Register::Eip), 0x0050_2000);
 assert_eq!(stack.depth(), 1);

 set_register(&mut cpu, Register::Eax, 0x1234);
 let result = callback_return(&mut cpu, &mut stack).unwrap();
 assert_eq!(result, 0x1234);
 assert_eq!(get_register(&cpu, Register::Eip), 0x0040_1000);
 assert_eq!(stack.depth(), 0);
 }

 #[test]
 fn depth_limit_is_enforced() {
 let (mut mem, paging, mut cpu) = setup();
 let mut stack = CallbackStack::new();
 for _ in 0..MAX_CALLBACK_DEPTH {
 stack.frames.push(save_regs(&cpu));
 }
 let err = call_wndproc(&mut cpu, &mut mem, &paging, &mut stack, 0, 0, 0, 0, 0, 0);
 assert!(matches!(err, Err(CallbackError::TooDeep(n)) if n == MAX_CALLBACK_DEPTH));
 }
}
