//! Types describing 32-bit x86 protected-mode CPU state, and the [`CpuModel`] trait that is
//! the entire surface this crate requires from an x86 interpreter.
//!
//! The interpreter core itself is an external collaborator: this crate only specifies the
//! contract in terms of [`Register`], [`SegmentRegister`], [`ControlRegister`] and the MSRs
//! below, the same way `hy-rs`'s `arch::x86_64` module describes register sets for a
//! hypervisor backend it does not implement either.

use crate::error::WboxError;

/// General-purpose 32-bit registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    Eip,
    Eflags,
}

/// Protected Mode Enable.
pub const CR0_PE: u32 = 1 << 0;
/// Paging.
pub const CR0_PG: u32 = 1 << 31;

/// Control registers relevant to a 32-bit protected-mode guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlRegister {
    /// CR0: protection/paging enable bits.
    Cr0,
    /// CR2: faulting linear address after a page fault.
    Cr2,
    /// CR3: physical address of the page directory.
    Cr3,
    /// CR4: extension enable bits (unused by this guest profile, kept for completeness).
    Cr4,
}

/// A segment descriptor, matching the fields a GDT entry or segment register cache holds.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pub base: u32,
    pub limit: u32,
    pub selector: u16,
    pub segment_type: u8,
    pub non_system_segment: bool,
    pub dpl: u8,
    pub present: bool,
    /// Whether the limit is interpreted as 4 KiB granules rather than bytes.
    pub granularity: bool,
    /// Whether the segment uses 32-bit (as opposed to 16-bit) default operand size.
    pub default_big: bool,
}

impl Segment {
    /// A flat, 4 GiB, byte-granular code or data segment such as the ones this crate installs
    /// for its Ring 0 / Ring 3 GDT entries (§4.6).
    pub fn flat(selector: u16, segment_type: u8, dpl: u8) -> Self {
        Self {
            base: 0,
            limit: 0xFFFF_F,
            selector,
            segment_type,
            non_system_segment: true,
            dpl,
            present: true,
            granularity: true,
            default_big: true,
        }
    }

    /// The TEB segment: a small segment based at the TEB's linear address, used so that
    /// `fs:[0]` resolves to the TEB without involving paging.
    pub fn teb(selector: u16, teb_base: u32) -> Self {
        Self {
            base: teb_base,
            limit: 0xFFF,
            selector,
            segment_type: 0x3,
            non_system_segment: true,
            dpl: 3,
            present: true,
            granularity: false,
            default_big: true,
        }
    }
}

/// Segment registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentRegister {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldt,
}

/// Descriptor table registers (GDTR/IDTR).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorTableRegister {
    Gdt,
    Idt,
}

/// A descriptor table base/limit pair.
#[derive(Clone, Debug)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// The code segment to load when issuing `sysenter`.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
/// The stack pointer to load when issuing `sysenter`.
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
/// The instruction pointer to load when issuing `sysenter`. Unused by this emulator: the
/// interpreter redirects `sysenter` straight to the host dispatcher (§4.6 step 4), so this MSR
/// is written for guest-visible consistency but never actually followed.
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;

/// Why [`CpuModel::run_slice`] returned control to the caller.
#[derive(Debug)]
pub enum CpuExit {
    /// The guest executed `sysenter`. The dispatcher should be invoked; `edx` holds the guest
    /// stack pointer the user-mode stub copied `esp` into (§4.7).
    Sysenter,
    /// The guest executed `hlt`.
    Halted,
    /// The CPU model's `abrt` flag was set by a fault the interpreter could not resolve on its
    /// own (page fault, GP fault, invalid opcode, ...).
    Fault,
    /// The slice's cycle budget was consumed with nothing noteworthy happening.
    SliceExhausted,
    /// `exit_requested` was observed set at the end of the slice.
    ExitRequested,
}

/// The entire contract this crate requires of an x86 protected-mode interpreter (§6.2).
///
/// Implementations own the actual instruction-level emulation; this crate only reads and
/// writes register/segment/MSR state and asks the model to advance by some number of cycles.
pub trait CpuModel {
    fn get_registers(&self, registers: &[Register]) -> Vec<u32>;
    fn set_registers(&mut self, registers: &[Register], values: &[u32]);

    fn get_control_registers(&self, registers: &[ControlRegister]) -> Vec<u32>;
    fn set_control_registers(&mut self, registers: &[ControlRegister], values: &[u32]);

    fn get_msrs(&self, msrs: &[u32]) -> Vec<u32>;
    fn set_msrs(&mut self, msrs: &[u32], values: &[u32]);

    fn get_segment_registers(&self, registers: &[SegmentRegister]) -> Vec<Segment>;
    fn set_segment_registers(&mut self, registers: &[SegmentRegister], values: &[Segment]);

    fn get_descriptor_tables(&self, registers: &[DescriptorTableRegister]) -> Vec<DescriptorTable>;
    fn set_descriptor_tables(&mut self, registers: &[DescriptorTableRegister], values: &[DescriptorTable]);

    /// Advances execution by approximately `cycles` instructions, returning why it stopped.
    fn run_slice(&mut self, cycles: u32) -> CpuExit;

    /// True once a fault the model could not service itself has been raised.
    fn aborted(&self) -> bool;

    /// Clears a previously observed abort, e.g. after the fault-dispatch routine has run.
    fn clear_abort(&mut self);

    /// Requests that the outer run loop stop at the next convenient point. Used by syscall
    /// handlers (`NtTerminateProcess`) to unwind out of `run_slice` from within the dispatcher.
    fn request_exit(&mut self);

    /// Clears a previously requested exit. Used when unwinding a kernel→user callback so the
    /// outer interpreter loop resumes normally (§4.13 step 6).
    fn clear_exit_request(&mut self);

    /// Informs the model that the translation caches for the given CR3 should be dropped,
    /// e.g. after `map_range` touches an already-active address space.
    fn flush_mmu(&mut self);
}

/// Convenience helper: reads a single register through the array-oriented trait methods.
pub fn get_register<C: CpuModel + ?Sized>(cpu: &C, reg: Register) -> u32 {
    cpu.get_registers(&[reg])[0]
}

/// Convenience helper: writes a single register through the array-oriented trait methods.
pub fn set_register<C: CpuModel + ?Sized>(cpu: &mut C, reg: Register, value: u32) {
    cpu.set_registers(&[reg], &[value]);
}

impl From<WboxError> for CpuExit {
    fn from(_: WboxError) -> Self {
        CpuExit::Fault
    }
}
