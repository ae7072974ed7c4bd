//! The VM context (§4.6, §4.9, §5): owns every piece of guest state, boots it into its Ring 3
//! entry point, and drives the host-side loops (DLL initialization, kernel→user callbacks) that
//! require running the interpreter in short slices between syscalls. [`VmContext`] is the
//! composition root: one guest process's CPU model plus every subsystem a syscall handler
//! might touch, all owned in one place.

use crate::arch::{
    CpuExit, CpuModel, DescriptorTable, DescriptorTableRegister, Register, Segment, SegmentRegister,
    CR0_PE, CR0_PG, MSR_IA32_SYSENTER_CS, MSR_IA32_SYSENTER_EIP, MSR_IA32_SYSENTER_ESP,
};
use crate::error::{LoaderError, WboxError, WboxResult};
use crate::handle::Handle;
use crate::heap::HeapState;
use crate::loader::imports::PRIVATE_PATCH_TARGETS;
use crate::loader::module::ModuleManager;
use crate::loader::stubs::{StubKind, StubManager};
use crate::loader::{resolve_imports, ExportLookup};
use crate::mem::PhysMem;
use crate::object::NtObjectTable;
use crate::paging::{PagingContext, PteFlags};
use crate::process;
use crate::sched::{Scheduler, ThreadId};
use crate::user::callback::{self, CallbackStack};
use crate::user::class;
use crate::user::UserState;
use crate::vfs::VfsJail;
use log::{info, warn};
use std::path::Path;

/// GDT selector constants (§4.6 step 3). Index 0 is the mandatory null descriptor; the rest
/// match the layout `ntdll`'s startup code and this emulator's SYSENTER MSRs both assume.
pub mod gdt {
    pub const NULL: u16 = 0x00;
    pub const R0_CODE: u16 = 0x08;
    pub const R0_DATA: u16 = 0x10;
    pub const R3_CODE: u16 = 0x1B;
    pub const R3_DATA: u16 = 0x23;
    pub const TEB: u16 = 0x3B;
    pub const ENTRY_COUNT: u32 = 8;
}

/// Where the GDT/IDT live in guest physical memory (§4.6 step 1). The IDT is left entirely
/// zeroed: `sysenter` never walks it, and this emulator raises no other interrupt.
pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
const GDT_SIZE: u32 = gdt::ENTRY_COUNT * 8;
const IDT_SIZE: u32 = 256 * 8;

/// The Ring 0 stack SYSENTER switches onto (§4.6 step 5). Nothing ever runs at Ring 0 in this
/// emulator - the dispatcher services `sysenter` entirely on the host side - so this only needs
/// to exist as a value the MSR can hold.
const KERNEL_STACK_TOP: u32 = 0x0009_0000;

/// Fixed guest VAs this module owns outright, chosen to avoid the address collision between
/// `PEB_VA + peb_offset::SIZE` and `TEB_VA` that a naive placement of these three blocks would
/// walk into (both real addresses are exactly one page apart; see [`crate::process::TEB_VA`]).
const PEB_LDR_DATA_VA: u32 = 0x7FFD_D000;
const PROCESS_PARAMS_VA: u32 = 0x7FFD_B000;
const PROCESS_PARAMS_STRINGS_VA: u32 = 0x7FFD_A000;

const MAIN_STACK_SIZE: u32 = 0x0001_0000;
const LOADER_HEAP_SIZE: u32 = 0x0002_0000;
const STUB_REGION_SIZE: u32 = 0x0000_4000;
const MAX_USER_HANDLES: u32 = 4096;
const LDR_HASH_BUCKETS: u32 = 32;

/// A one-page region per fixed-VA block this module maps directly (PEB, TEB, KUSD, the
/// activation-context stack, and the three loader-owned blocks above).
const SMALL_REGION_SIZE: u32 = 0x1000;

/// DLLs that must finish `DllMain` before the rest of the load order runs, in priority order
/// (§4.9). Everything else follows in reverse load order.
const DLL_INIT_PRIORITY: &[&str] = &["kernel32.dll", "msvcrt.dll", "advapi32.dll", "gdi32.dll", "user32.dll"];

/// Cycles run per slice while driving a `DllMain` call or a kernel→user callback (§4.9, §4.13).
const CALLBACK_SLICE_CYCLES: u32 = 4096;
/// Upper bound on slices run waiting for a single `DllMain`/callback invocation to return, past
/// which this emulator gives up rather than spin forever on a guest that never issues the
/// expected sentinel.
const MAX_CALLBACK_SLICES: u32 = 1_000_000;

/// How a slice-driven invocation (`DllMain` call or kernel→user callback) ended.
#[derive(Debug)]
enum InvokeOutcome {
    /// The guest hit the expected return sentinel; carries `eax` at that point.
    Returned(u32),
    /// The CPU model aborted on a fault it could not service.
    Faulted,
    /// [`MAX_CALLBACK_SLICES`] elapsed without the sentinel appearing.
    TimedOut,
}

/// Owns every piece of state for one emulated process (§1, §5): guest memory and paging, the
/// loaded modules and stub/heap allocators, the USER subsystem, the scheduler, and the VFS jail
/// syscall handlers resolve paths through. Generic over the CPU model so this crate never
/// depends on a concrete interpreter.
pub struct VmContext<C: CpuModel> {
    pub cpu: C,
    pub mem: PhysMem,
    pub paging: PagingContext,
    pub modules: ModuleManager,
    pub stubs: StubManager,
    pub heap: HeapState,
    pub user: UserState,
    pub sched: Scheduler,
    pub vfs: VfsJail,
    pub callbacks: CallbackStack,
    pub main_thread: ThreadId,
    pub exit_code: Option<u32>,
    pub nt_objects: NtObjectTable,
    /// Bump allocator cursor for `NtAllocateVirtualMemory`/`NtMapViewOfSection` (§4.9), distinct
    /// from the process heap: guest code that calls these directly expects an independent
    /// mapping, not a heap block.
    pub mmap_bump: u32,
}

fn map_page(mem: &mut PhysMem, paging: &mut PagingContext, va: u32, size: u32, flags: PteFlags) -> WboxResult<()> {
    let pa = paging.alloc_phys(mem, size);
    paging.map_range(mem, va, pa, size, flags)?;
    Ok(())
}

impl<C: CpuModel> VmContext<C> {
    /// Boots a fresh guest process: maps the fixed regions (§4.6), loads `exe_path` and every
    /// DLL it transitively imports, sets up the TEB/PEB/KUSD, and parks the CPU at the entry
    /// point with Ring 3 state ready to run. Does not itself run `DllMain`s; see
    /// [`run_dll_init`](Self::run_dll_init) for that.
    pub fn boot(mut cpu: C, phys_size: usize, vfs: VfsJail, exe_path: &Path, command_line: &str) -> WboxResult<Self> {
        let mut mem = PhysMem::new(phys_size);
        let pt_region = (process::PAGE_TABLES_BASE, process::PAGE_TABLES_BASE + 0x0008_0000);
        let alloc_region = (pt_region.1, phys_size as u32);
        let mut paging = PagingContext::new(&mut mem, pt_region, alloc_region)?;

        // §4.6 step 2: identity-map the low 1 MiB (real-mode-era BIOS/video memory this guest
        // profile never actually touches, but ntdll's startup path probes it).
        paging.map_range(&mut mem, 0, 0, 0x0010_0000, PteFlags::PRESENT | PteFlags::WRITABLE)?;

        cpu.set_control_registers(&[crate::arch::ControlRegister::Cr3], &[paging.page_directory()]);
        cpu.set_control_registers(&[crate::arch::ControlRegister::Cr0], &[CR0_PE | CR0_PG]);
        cpu.flush_mmu();

        mem.zero_range(GDT_BASE, GDT_SIZE as usize);
        mem.zero_range(IDT_BASE, IDT_SIZE as usize);
        cpu.set_descriptor_tables(
            &[DescriptorTableRegister::Gdt, DescriptorTableRegister::Idt],
            &[
                DescriptorTable { base: GDT_BASE, limit: (GDT_SIZE - 1) as u16 },
                DescriptorTable { base: IDT_BASE, limit: (IDT_SIZE - 1) as u16 },
            ],
        );

        cpu.set_msrs(
            &[MSR_IA32_SYSENTER_CS, MSR_IA32_SYSENTER_ESP, MSR_IA32_SYSENTER_EIP],
            &[gdt::R0_CODE as u32, KERNEL_STACK_TOP, 0],
        );

        // §4.6 step 5: Ring 3 segments, flat except FS (the TEB segment, used so `fs:[0]`
        // resolves without paging getting involved).
        let ring3_code = Segment::flat(gdt::R3_CODE, 0xA, 3);
        let ring3_data = Segment::flat(gdt::R3_DATA, 0x2, 3);
        let teb_segment = Segment::teb(gdt::TEB, process::TEB_VA);
        cpu.set_segment_registers(
            &[SegmentRegister::Cs, SegmentRegister::Ds, SegmentRegister::Es, SegmentRegister::Ss, SegmentRegister::Gs, SegmentRegister::Fs],
            &[ring3_code, ring3_data.clone(), ring3_data.clone(), ring3_data.clone(), ring3_data, teb_segment],
        );

        cpu.set_registers(
            &[Register::Eax, Register::Ebx, Register::Ecx, Register::Edx, Register::Esi, Register::Edi, Register::Ebp, Register::Eflags],
            &[0, 0, 0, 0, 0, 0, 0, 0x0000_0200],
        );

        let stack_base = process::USER_STACK_TOP;
        let stack_limit = stack_base - MAIN_STACK_SIZE;
        let stack_phys = paging.alloc_phys(&mut mem, MAIN_STACK_SIZE);
        paging.map_range(&mut mem, stack_limit, stack_phys, MAIN_STACK_SIZE, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)?;
        crate::arch::set_register(&mut cpu, Register::Esp, stack_base);

        for va in [
            process::PEB_VA,
            process::TEB_VA,
            process::ACTCTX_STACK_VA,
            process::KUSD_VA,
            PEB_LDR_DATA_VA,
            PROCESS_PARAMS_VA,
            PROCESS_PARAMS_STRINGS_VA,
        ] {
            map_page(&mut mem, &mut paging, va, SMALL_REGION_SIZE, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)?;
        }

        process::init_kusd_stubs(&mut mem, &paging);
        process::init_teb(&mut mem, &paging, stack_base, stack_limit, 1, 1);

        let image_path = format!(r"C:\{}", exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("a.exe"));
        process::init_process_parameters(&mut mem, &paging, PROCESS_PARAMS_VA, PROCESS_PARAMS_STRINGS_VA, &image_path, command_line);

        let mut modules = ModuleManager::new(&mut mem, &mut paging, process::LOADER_HEAP_VA, LOADER_HEAP_SIZE, PEB_LDR_DATA_VA)?;
        let ntdll_path = vfs.resolve(r"C:\WINDOWS\system32\ntdll.dll")?;
        modules.set_ntdll_path(ntdll_path);
        modules.init_peb_ldr_data(&mut mem, &paging);

        let main_index = modules.load_pe(&mut mem, &mut paging, exe_path, 0, true)?;
        let image_base = modules.modules[main_index].base_va;
        process::init_peb(&mut mem, &paging, image_base, PROCESS_PARAMS_VA);

        let stubs = StubManager::new(&mut mem, &mut paging, process::STUB_REGION_VA, STUB_REGION_SIZE)?;
        let heap = HeapState::new(&mut mem, &mut paging, process::PROCESS_HEAP_VA, process::PROCESS_HEAP_SIZE)?;
        let user = UserState::new(
            &mut mem,
            &mut paging,
            process::DESKTOP_HEAP_VA,
            process::DESKTOP_HEAP_SIZE,
            process::USER_HANDLE_TABLE_VA,
            MAX_USER_HANDLES,
            process::SERVERINFO_VA,
        );

        let mut sched = Scheduler::new();
        let main_thread = sched.create_thread();
        sched.schedule_next();

        let mut ctx = Self {
            cpu,
            mem,
            paging,
            modules,
            stubs,
            heap,
            user,
            sched,
            vfs,
            callbacks: CallbackStack::new(),
            main_thread,
            exit_code: None,
            nt_objects: NtObjectTable::new(),
            mmap_bump: process::MMAP_BASE_VA,
        };

        let entry_point = ctx.finish_loading(main_index)?;
        ctx.patch_private_ntdll_exports();
        ctx.register_default_system_classes(image_base)?;
        crate::arch::set_register(&mut ctx.cpu, Register::Eip, entry_point);

        Ok(ctx)
    }

    /// Overwrites ntdll's `Rtl*Heap`/string-converter/`GetCommandLine*` export entry points with
    /// syscall trampolines (§4.10): these are called directly by address, never through an IAT
    /// slot, so [`resolve_imports`] never sees them. A missing export (e.g. a stub-only ntdll in
    /// a test fixture) is simply skipped.
    fn patch_private_ntdll_exports(&mut self) {
        let ntdll_index = match self.modules.find_by_name("ntdll.dll") {
            Some(i) => i,
            None => return,
        };
        for (name, syscall_num, num_args) in PRIVATE_PATCH_TARGETS {
            let bytes = StubKind::Syscall { syscall_num: *syscall_num, num_args: *num_args }.encode();
            if !self.modules.patch_export_bytes(&mut self.mem, ntdll_index, name, &bytes) {
                warn!("ntdll export {} not found, leaving unpatched", name);
            }
        }
    }

    /// Resolves imports transitively (loading every dependent DLL along the way), then builds
    /// `LDR_DATA_TABLE_ENTRY`s and the hash table once every module is settled (§4.3-§4.5).
    /// Returns the main executable's entry point.
    fn finish_loading(&mut self, main_index: usize) -> WboxResult<u32> {
        loop {
            let pending: Vec<usize> = self
                .modules
                .modules
                .iter()
                .enumerate()
                .filter(|(_, m)| m.has_imports && !m.imports_resolved)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }
            for index in pending {
                let stats = resolve_imports(&mut self.mem, &mut self.paging, &mut self.modules, &self.vfs, &mut self.stubs, index)?;
                info!(
                    "resolved imports for {}: {} total, {} stubbed, {} direct, {} failed",
                    self.modules.modules[index].name, stats.total, stats.stubbed, stats.direct, stats.failed
                );
            }
        }

        let non_main: Vec<usize> = self.modules.modules.iter().enumerate().filter(|(_, m)| !m.is_main_exe).map(|(i, _)| i).collect();
        for index in non_main {
            self.modules.create_ldr_entry(&mut self.mem, &mut self.paging, index)?;
        }
        self.modules.link_hash_table(&mut self.mem, &mut self.paging, process::USER_HANDLE_TABLE_VA, LDR_HASH_BUCKETS);

        Ok(self.modules.modules[main_index].entry_point)
    }

    /// Registers the standard system window classes (§1) against a `DefWindowProc`-only stub so
    /// early `CreateWindowEx` calls against `"Button"`/`"Edit"`/`"Static"`/`"#32770"` succeed
    /// even before user32's own `RegisterClassEx` runs.
    fn register_default_system_classes(&mut self, image_base: u32) -> WboxResult<()> {
        let default_wnd_proc = self.stubs.get_or_create(&mut self.mem, "__wbox_DefWindowProc", StubKind::ReturnZero { num_args: 4 })?;
        self.user.classes.register_system_classes(&mut self.mem, &mut self.user.desktop_heap, default_wnd_proc, image_base)?;
        Ok(())
    }

    /// Runs the CPU in [`CALLBACK_SLICE_CYCLES`]-sized slices until `is_done` reports true,
    /// fast-forwarding the scheduler's clock whenever every thread has stalled on a wait (§4.9,
    /// §4.15, §9's loader-lock deadlock). Shared by [`run_dll_init`](Self::run_dll_init) and
    /// [`run_wndproc_callback`](Self::run_wndproc_callback): both are "run until a sentinel
    /// syscall shows up" loops that differ only in which sentinel they watch for.
    fn run_until(&mut self, mut is_done: impl FnMut(&mut Self) -> Option<u32>) -> InvokeOutcome {
        for _ in 0..MAX_CALLBACK_SLICES {
            if let Some(eax) = is_done(self) {
                return InvokeOutcome::Returned(eax);
            }
            match self.cpu.run_slice(CALLBACK_SLICE_CYCLES) {
                CpuExit::Fault => {
                    if self.sched.is_stalled() && self.sched.fast_forward() {
                        self.cpu.clear_abort();
                        continue;
                    }
                    return InvokeOutcome::Faulted;
                }
                CpuExit::Sysenter => {
                    if let Some(eax) = is_done(self) {
                        return InvokeOutcome::Returned(eax);
                    }
                    self.dispatch_pending_syscall();
                }
                CpuExit::Halted | CpuExit::SliceExhausted => {
                    if self.sched.is_stalled() {
                        self.sched.fast_forward();
                    }
                }
                CpuExit::ExitRequested => return InvokeOutcome::Returned(crate::arch::get_register(&self.cpu, Register::Eax)),
            }
        }
        InvokeOutcome::TimedOut
    }

    /// Dispatches whatever syscall the guest just issued through `sysenter`. Delegates to
    /// [`crate::syscall`]; kept as a thin forwarding call so [`run_until`](Self::run_until) does
    /// not need to know the dispatcher's signature.
    fn dispatch_pending_syscall(&mut self) {
        crate::syscall::dispatch(self);
    }

    /// Invokes a single DLL's entry point with `fdwReason = DLL_PROCESS_ATTACH` (§4.9): pushes
    /// the stdcall frame `(hinstDLL, fdwReason, lpvReserved)` plus the KUSD DLL-init return stub
    /// as the return address, sets `EIP`, and drives [`run_until`](Self::run_until) watching for
    /// [`callback::SENTINEL_DLL_INIT_RETURN`].
    fn invoke_dll_main(&mut self, module_index: usize) -> InvokeOutcome {
        let (entry_point, base_va) = {
            let m = &self.modules.modules[module_index];
            (m.entry_point, m.base_va)
        };
        if entry_point == 0 {
            return InvokeOutcome::Returned(1);
        }

        let saved_esp = crate::arch::get_register(&self.cpu, Register::Esp);
        let saved_eip = crate::arch::get_register(&self.cpu, Register::Eip);
        let mut esp = saved_esp;

        let mut push = |ctx: &mut Self, value: u32| {
            esp -= 4;
            if let Some(pa) = ctx.paging.translate(&ctx.mem, esp) {
                ctx.mem.write32(pa, value);
            }
        };
        push(self, 0); // lpvReserved
        push(self, 1); // fdwReason = DLL_PROCESS_ATTACH
        push(self, base_va); // hinstDLL
        push(self, process::KUSD_DLL_INIT_RETURN_STUB_VA);

        crate::arch::set_register(&mut self.cpu, Register::Esp, esp);
        crate::arch::set_register(&mut self.cpu, Register::Eip, entry_point);

        let outcome = self.run_until(|ctx| {
            let eip = crate::arch::get_register(&ctx.cpu, Register::Eip);
            if eip == process::KUSD_DLL_INIT_RETURN_STUB_VA + 7 {
                Some(crate::arch::get_register(&ctx.cpu, Register::Eax))
            } else {
                None
            }
        });

        crate::arch::set_register(&mut self.cpu, Register::Esp, saved_esp);
        crate::arch::set_register(&mut self.cpu, Register::Eip, saved_eip);
        outcome
    }

    /// Runs every loaded DLL's entry point once, in the order §4.9 prescribes: the priority
    /// bootstrap set first (kernel32, msvcrt, advapi32, gdi32, user32, in that order, skipping
    /// any not present), then every remaining non-main module in reverse load order. A DLL whose
    /// entry point never returns the expected sentinel is logged and skipped rather than aborting
    /// the boot.
    pub fn run_dll_init(&mut self) -> WboxResult<()> {
        let mut order: Vec<usize> = Vec::new();

        for name in DLL_INIT_PRIORITY {
            if let Some(index) = self.modules.find_by_name(name) {
                if !self.modules.modules[index].is_main_exe {
                    order.push(index);
                }
            }
        }

        let mut remaining: Vec<usize> = self
            .modules
            .modules
            .iter()
            .enumerate()
            .filter(|(i, m)| !m.is_main_exe && !order.contains(i))
            .map(|(i, _)| i)
            .collect();
        remaining.reverse();
        order.extend(remaining);

        for index in order {
            if self.modules.modules[index].dll_main_called {
                continue;
            }
            let name = self.modules.modules[index].name.clone();
            match self.invoke_dll_main(index) {
                InvokeOutcome::Returned(result) => {
                    self.modules.modules[index].dll_main_called = true;
                    if result == 0 {
                        warn!("DllMain for {} returned FALSE", name);
                    }
                }
                InvokeOutcome::Faulted => warn!("DllMain for {} faulted before returning", name),
                InvokeOutcome::TimedOut => warn!("DllMain for {} never returned within the slice budget", name),
            }
        }

        Ok(())
    }

    /// Drives a kernel→user callback to completion (§4.13): pushes the stdcall frame via
    /// [`callback::call_wndproc`] and runs slices until [`callback::callback_return`]'s sentinel
    /// appears, then restores caller state. Returns the `WndProc`'s result, or `None` if the
    /// callback faulted or timed out.
    pub fn run_wndproc_callback(&mut self, wnd_proc_va: u32, hwnd: Handle, msg: u32, w_param: u32, l_param: u32) -> Option<u32> {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let result = callback::call_wndproc(
            &mut self.cpu,
            &mut self.mem,
            &self.paging,
            &mut callbacks,
            wnd_proc_va,
            process::KUSD_WNDPROC_RETURN_STUB_VA,
            hwnd.0,
            msg,
            w_param,
            l_param,
        );
        self.callbacks = callbacks;

        if result.is_err() {
            warn!("kernel->user callback rejected: {:?}", result.err());
            return None;
        }

        let depth_before = self.callbacks.depth();
        let outcome = self.run_until(|ctx| {
            let eip = crate::arch::get_register(&ctx.cpu, Register::Eip);
            if eip == process::KUSD_WNDPROC_RETURN_STUB_VA + 9 && ctx.callbacks.depth() == depth_before {
                Some(crate::arch::get_register(&ctx.cpu, Register::Eax))
            } else {
                None
            }
        });

        match outcome {
            InvokeOutcome::Returned(_) => {
                let mut callbacks = std::mem::take(&mut self.callbacks);
                let value = callback::callback_return(&mut self.cpu, &mut callbacks);
                self.callbacks = callbacks;
                value
            }
            InvokeOutcome::Faulted | InvokeOutcome::TimedOut => None,
        }
    }

    /// Looks up a loaded module's export by name, for syscall handlers that need a DLL's VA
    /// without going through the import table (e.g. resolving `wndProc` from a class's stored
    /// module).
    pub fn find_export(&self, module_index: usize, name: &str) -> Option<u32> {
        let module = self.modules.modules.get(module_index)?;
        match module.exports.lookup_by_name(name) {
            ExportLookup::Resolved { rva } => Some(module.base_va + rva),
            _ => None,
        }
    }

    /// True once the message loop has posted `WM_QUIT` or a syscall requested the process exit
    /// (§4.15: the run loop's stopping condition).
    pub fn should_exit(&self) -> bool {
        self.exit_code.is_some() || self.user.messages.quit_posted
    }

    pub fn request_exit(&mut self, code: u32) {
        self.exit_code = Some(code);
        self.cpu.request_exit();
    }
}

impl From<LoaderError> for WboxError {
    fn from(e: LoaderError) -> Self {
        WboxError::Loader(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{minimal_jail, NullCpu};

    #[test]
    fn boot_parks_eip_at_the_entry_point_and_maps_the_peb() {
        let (_tmp, exe_path) = minimal_jail();
        let vfs = VfsJail::new(exe_path.parent().unwrap()).unwrap();
        let ctx = VmContext::boot(NullCpu::new(), 64 * 1024 * 1024, vfs, &exe_path, "hello.exe").unwrap();

        let eip = crate::arch::get_register(&ctx.cpu, Register::Eip);
        assert_eq!(eip, 0x0040_0000 + 0x1000);
        assert!(ctx.paging.translate(&ctx.mem, process::PEB_VA).is_some());
        assert!(ctx.paging.translate(&ctx.mem, process::TEB_VA).is_some());
    }

    #[test]
    fn peb_critical_sections_do_not_collide_with_the_teb_page() {
        let (_tmp, exe_path) = minimal_jail();
        let vfs = VfsJail::new(exe_path.parent().unwrap()).unwrap();
        let ctx = VmContext::boot(NullCpu::new(), 64 * 1024 * 1024, vfs, &exe_path, "hello.exe").unwrap();

        let teb_self_pa = ctx.paging.translate(&ctx.mem, process::TEB_VA + process::teb_offset::SELF).unwrap();
        assert_eq!(ctx.mem.read32(teb_self_pa), process::TEB_VA);
    }

    #[test]
    fn default_system_classes_are_registered_at_boot() {
        let (_tmp, exe_path) = minimal_jail();
        let vfs = VfsJail::new(exe_path.parent().unwrap()).unwrap();
        let ctx = VmContext::boot(NullCpu::new(), 64 * 1024 * 1024, vfs, &exe_path, "hello.exe").unwrap();
        assert!(ctx.user.classes.is_registered("Button"));
        assert!(ctx.user.classes.is_registered("#32770"));
    }
}
