//! Guest-visible process layout (§6.4): the TEB, PEB, `RTL_USER_PROCESS_PARAMETERS`, and
//! `KUSER_SHARED_DATA` field writers, plus the offset tables the prior implementation's
//! `process.h` pins for every field actually touched at runtime.

use crate::mem::PhysMem;
use crate::paging::PagingContext;

/// Fixed guest VAs (§4.6). All of these are load-bearing: ntdll and user32 read them as plain
/// memory, not through a syscall, so they must sit exactly here.
pub const PAGE_TABLES_BASE: u32 = 0x0010_0000;
pub const DEFAULT_EXE_BASE: u32 = 0x0040_0000;
pub const USER_STACK_TOP: u32 = 0x7FFE_FFF0;
pub const PEB_VA: u32 = 0x7FFD_E000;
pub const TEB_VA: u32 = 0x7FFD_F000;
pub const ACTCTX_STACK_VA: u32 = TEB_VA + 0x800;
pub const KUSD_VA: u32 = 0x7FFE_0000;
pub const STUB_REGION_VA: u32 = 0x7F00_0000;
pub const LOADER_HEAP_VA: u32 = 0x7F01_0000;
pub const SERVERINFO_VA: u32 = 0x7F02_0000;
pub const USER_HANDLE_TABLE_VA: u32 = 0x7F03_0000;
pub const DESKTOP_HEAP_VA: u32 = 0x0100_0000;
pub const DESKTOP_HEAP_SIZE: u32 = 1024 * 1024;
pub const PROCESS_HEAP_VA: u32 = 0x1000_0000;
pub const PROCESS_HEAP_SIZE: u32 = 16 * 1024 * 1024;

/// Base of the `NtAllocateVirtualMemory`/`NtMapViewOfSection` bump region (§4.9): well clear of
/// the process heap and the fixed loader/desktop regions below it, with room to grow up to the
/// shared region at [`STUB_REGION_VA`] without colliding with either.
pub const MMAP_BASE_VA: u32 = 0x2000_0000;
pub const MMAP_REGION_SIZE: u32 = 0x4000_0000 - MMAP_BASE_VA;

/// KUSD sub-addresses (§4.6 step 6, §6.4).
pub const KUSD_SYSTEM_CALL_PTR_OFFSET: u32 = 0x300;
pub const KUSD_SYSCALL_STUB_VA: u32 = KUSD_VA + 0x340;
pub const KUSD_DLL_INIT_RETURN_STUB_VA: u32 = KUSD_VA + 0x350;
pub const KUSD_WNDPROC_RETURN_STUB_VA: u32 = KUSD_VA + 0x360;

/// `PEB.CriticalSectionTimeout`: -1,500,000,000 (100 ns units), relative.
pub const CRITICAL_SECTION_TIMEOUT: i64 = -1_500_000_000;

pub mod teb_offset {
    pub const EXCEPTION_LIST: u32 = 0x00;
    pub const STACK_BASE: u32 = 0x04;
    pub const STACK_LIMIT: u32 = 0x08;
    pub const SELF: u32 = 0x18;
    pub const PROCESS_ID: u32 = 0x20;
    pub const THREAD_ID: u32 = 0x24;
    pub const TLS_POINTER: u32 = 0x2C;
    pub const PEB_POINTER: u32 = 0x30;
    pub const LAST_ERROR: u32 = 0x34;
    pub const WIN32_THREAD_INFO: u32 = 0x40;
    pub const ACTIVATION_CONTEXT_STACK_PTR: u32 = 0x1A8;
    pub const WIN32_CLIENT_INFO: u32 = 0x6CC;
    pub const SIZE: u32 = 0x1000;
}

/// Offsets inside `TEB.Win32ClientInfo` (a `CLIENTINFO`), relative to
/// [`teb_offset::WIN32_CLIENT_INFO`].
pub mod client_info_offset {
    pub const PDESKINFO: u32 = 0x18;
    pub const CALLBACKWND: u32 = 0x28;
    pub const CALLBACKWND_HWND: u32 = 0x28;
    pub const CALLBACKWND_PWND: u32 = 0x2C;
    pub const CALLBACKWND_PACTCTX: u32 = 0x30;
}

/// `DESKTOPINFO` field offsets, for the shadow structure pointed to by
/// `CLIENTINFO.pDeskInfo`.
pub mod desktop_info_offset {
    pub const PVDESKTOPBASE: u32 = 0x00;
    pub const PVDESKTOPLIMIT: u32 = 0x04;
    pub const SPWND: u32 = 0x08;
    pub const FSHOOKS: u32 = 0x0C;
    pub const APHKSTART: u32 = 0x10;
    /// `aphkStart` has 16 entries of 4 bytes each.
    pub const SIZE: u32 = 0x10 + 16 * 4;
}

pub mod peb_offset {
    pub const BEING_DEBUGGED: u32 = 0x02;
    pub const IMAGE_BASE_ADDRESS: u32 = 0x08;
    pub const LDR: u32 = 0x0C;
    pub const PROCESS_PARAMETERS: u32 = 0x10;
    pub const SUB_SYSTEM_DATA: u32 = 0x14;
    pub const PROCESS_HEAP: u32 = 0x18;
    pub const FAST_PEB_LOCK: u32 = 0x1C;
    pub const KERNEL_CALLBACK_TABLE: u32 = 0x2C;
    pub const TLS_EXPANSION_COUNTER: u32 = 0x3C;
    pub const TLS_BITMAP: u32 = 0x40;
    pub const TLS_BITMAP_BITS: u32 = 0x44;
    pub const ANSI_CODE_PAGE_DATA: u32 = 0x58;
    pub const OEM_CODE_PAGE_DATA: u32 = 0x5C;
    pub const UNICODE_CASE_TABLE: u32 = 0x60;
    pub const NUMBER_OF_PROCESSORS: u32 = 0x64;
    pub const NT_GLOBAL_FLAG: u32 = 0x68;
    pub const CRITICAL_SECTION_TIMEOUT: u32 = 0x70;
    pub const GDI_SHARED_HANDLE_TABLE: u32 = 0x94;
    pub const LOADER_LOCK: u32 = 0xA0;
    pub const OS_MAJOR_VERSION: u32 = 0xA4;
    pub const OS_MINOR_VERSION: u32 = 0xA8;
    pub const OS_BUILD_NUMBER: u32 = 0xAC;
    pub const OS_PLATFORM_ID: u32 = 0xB0;
    pub const IMAGE_SUBSYSTEM: u32 = 0xB4;
    pub const IMAGE_SUBSYSTEM_MAJOR: u32 = 0xB8;
    pub const IMAGE_SUBSYSTEM_MINOR: u32 = 0xBC;
    pub const SESSION_ID: u32 = 0x1D4;
    pub const SIZE: u32 = 0x1000;
    /// Where [`init_peb`] parks the unlocked `FastPebLock`/`LoaderLock` critical sections: well
    /// past every named field above, but short of [`SIZE`] so it stays inside the PEB's own page
    /// rather than spilling into whatever the next page over happens to be (on a real boot,
    /// [`TEB_VA`](super::TEB_VA) sits exactly one page above [`PEB_VA`](super::PEB_VA)).
    pub const CRITICAL_SECTIONS_BASE: u32 = 0x0200;
}

/// `RTL_USER_PROCESS_PARAMETERS` offsets.
pub mod rupp_offset {
    pub const STDIN_HANDLE: u32 = 0x18;
    pub const STDOUT_HANDLE: u32 = 0x1C;
    pub const STDERR_HANDLE: u32 = 0x20;
    pub const CURRENT_DIRECTORY: u32 = 0x24;
    pub const DLL_PATH: u32 = 0x30;
    pub const IMAGE_PATH_NAME: u32 = 0x38;
    pub const COMMAND_LINE: u32 = 0x40;
    pub const ENVIRONMENT: u32 = 0x48;
    pub const WINDOW_TITLE: u32 = 0x70;
    pub const SIZE: u32 = 0x200;
}

/// `RTL_CRITICAL_SECTION` offsets, used for `PEB.FastPebLock`/`LoaderLock` (both initialised as
/// unlocked).
pub mod critical_section_offset {
    pub const DEBUG_INFO: u32 = 0x00;
    pub const LOCK_COUNT: u32 = 0x04;
    pub const RECURSION_COUNT: u32 = 0x08;
    pub const OWNING_THREAD: u32 = 0x0C;
    pub const LOCK_SEMAPHORE: u32 = 0x10;
    pub const SPIN_COUNT: u32 = 0x14;
    pub const SIZE: u32 = 0x18;
}

/// NT stdio pseudo-handles, per §3. These never collide with a real NT handle since the handle
/// table's index space starts at 1 and these values alias no valid `(index, generation)` pair
/// the table could ever produce.
pub const STD_INPUT_HANDLE: u32 = 0xFFFF_FFF6;
pub const STD_OUTPUT_HANDLE: u32 = 0xFFFF_FFF5;
pub const STD_ERROR_HANDLE: u32 = 0xFFFF_FFF4;

fn w32(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u32) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write32(pa, value);
    }
}

fn w16(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u16) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write16(pa, value);
    }
}

fn w8(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u8) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write8(pa, value);
    }
}

/// Initialises the unlocked `RTL_CRITICAL_SECTION` at `va` (§6.4: `FastPebLock`/`LoaderLock`).
fn init_critical_section(mem: &mut PhysMem, paging: &PagingContext, va: u32) {
    w32(mem, paging, va + critical_section_offset::LOCK_COUNT, 0xFFFF_FFFF);
    w32(mem, paging, va + critical_section_offset::RECURSION_COUNT, 0);
    w32(mem, paging, va + critical_section_offset::OWNING_THREAD, 0);
    w32(mem, paging, va + critical_section_offset::SPIN_COUNT, 0);
}

/// Writes a UNICODE_STRING `{Length, MaximumLength, Buffer}` at `va`, where `buffer_va` already
/// holds `text` encoded as UTF-16 (no NUL) in guest memory.
fn write_unicode_string(mem: &mut PhysMem, paging: &PagingContext, va: u32, text_len_units: usize, buffer_va: u32) {
    let byte_len = (text_len_units * 2) as u16;
    w16(mem, paging, va, byte_len);
    w16(mem, paging, va + 2, byte_len.saturating_add(2));
    w32(mem, paging, va + 4, buffer_va);
}

/// Initialises the TEB at [`TEB_VA`] (§6.4). `stack_base`/`stack_limit` are the user stack's
/// high/low addresses.
pub fn init_teb(mem: &mut PhysMem, paging: &PagingContext, stack_base: u32, stack_limit: u32, pid: u32, tid: u32) {
    w32(mem, paging, TEB_VA + teb_offset::EXCEPTION_LIST, 0xFFFF_FFFF);
    w32(mem, paging, TEB_VA + teb_offset::STACK_BASE, stack_base);
    w32(mem, paging, TEB_VA + teb_offset::STACK_LIMIT, stack_limit);
    w32(mem, paging, TEB_VA + teb_offset::SELF, TEB_VA);
    w32(mem, paging, TEB_VA + teb_offset::PROCESS_ID, pid);
    w32(mem, paging, TEB_VA + teb_offset::THREAD_ID, tid);
    w32(mem, paging, TEB_VA + teb_offset::PEB_POINTER, PEB_VA);
    w32(mem, paging, TEB_VA + teb_offset::LAST_ERROR, 0);
    w32(mem, paging, TEB_VA + teb_offset::ACTIVATION_CONTEXT_STACK_PTR, ACTCTX_STACK_VA);
}

/// Initialises the PEB at [`PEB_VA`] (§6.4): version fields, heap pointer, TLS bitmap,
/// critical sections, and the `RTL_USER_PROCESS_PARAMETERS` block (written separately via
/// [`init_process_parameters`], whose VA is passed in here).
pub fn init_peb(mem: &mut PhysMem, paging: &PagingContext, image_base: u32, process_parameters_va: u32) {
    w8(mem, paging, PEB_VA + peb_offset::BEING_DEBUGGED, 0);
    w32(mem, paging, PEB_VA + peb_offset::IMAGE_BASE_ADDRESS, image_base);
    w32(mem, paging, PEB_VA + peb_offset::PROCESS_PARAMETERS, process_parameters_va);
    w32(mem, paging, PEB_VA + peb_offset::PROCESS_HEAP, PROCESS_HEAP_VA);
    w32(mem, paging, PEB_VA + peb_offset::KERNEL_CALLBACK_TABLE, 0);
    w32(mem, paging, PEB_VA + peb_offset::TLS_BITMAP, PEB_VA + peb_offset::TLS_BITMAP_BITS);
    w32(mem, paging, PEB_VA + peb_offset::TLS_BITMAP_BITS, 0);
    w32(mem, paging, PEB_VA + peb_offset::TLS_BITMAP_BITS + 4, 0);
    w32(mem, paging, PEB_VA + peb_offset::NUMBER_OF_PROCESSORS, 1);
    w32(mem, paging, PEB_VA + peb_offset::CRITICAL_SECTION_TIMEOUT, CRITICAL_SECTION_TIMEOUT as u32);
    w32(
        mem,
        paging,
        PEB_VA + peb_offset::CRITICAL_SECTION_TIMEOUT + 4,
        (CRITICAL_SECTION_TIMEOUT >> 32) as u32,
    );
    w32(mem, paging, PEB_VA + peb_offset::GDI_SHARED_HANDLE_TABLE, DESKTOP_HEAP_VA + DESKTOP_HEAP_SIZE);
    w32(mem, paging, PEB_VA + peb_offset::OS_MAJOR_VERSION, 5);
    w32(mem, paging, PEB_VA + peb_offset::OS_MINOR_VERSION, 1);
    w32(mem, paging, PEB_VA + peb_offset::OS_BUILD_NUMBER, 2600);
    w32(mem, paging, PEB_VA + peb_offset::OS_PLATFORM_ID, 2);
    w32(mem, paging, PEB_VA + peb_offset::IMAGE_SUBSYSTEM, 3);

    let fast_peb_lock_va = PEB_VA + peb_offset::CRITICAL_SECTIONS_BASE;
    let loader_lock_va = fast_peb_lock_va + critical_section_offset::SIZE;
    w32(mem, paging, PEB_VA + peb_offset::FAST_PEB_LOCK, fast_peb_lock_va);
    w32(mem, paging, PEB_VA + peb_offset::LOADER_LOCK, loader_lock_va);
    init_critical_section(mem, paging, fast_peb_lock_va);
    init_critical_section(mem, paging, loader_lock_va);
}

/// Writes `RTL_USER_PROCESS_PARAMETERS` at `va`, with the `StandardHandles` triple, current
/// directory, command line, and image path name required by ntdll/kernel32 startup code
/// (§6.4). Wide strings are placed immediately after the fixed-size block at `strings_va`,
/// which the caller must reserve at least `rupp_offset::SIZE` bytes beyond.
pub fn init_process_parameters(
    mem: &mut PhysMem,
    paging: &PagingContext,
    va: u32,
    strings_va: u32,
    image_path: &str,
    command_line: &str,
) -> u32 {
    w32(mem, paging, va + rupp_offset::STDIN_HANDLE, STD_INPUT_HANDLE);
    w32(mem, paging, va + rupp_offset::STDOUT_HANDLE, STD_OUTPUT_HANDLE);
    w32(mem, paging, va + rupp_offset::STDERR_HANDLE, STD_ERROR_HANDLE);

    let current_dir: Vec<u16> = r"C:\WINDOWS\system32\".encode_utf16().collect();
    let image_path_w: Vec<u16> = image_path.encode_utf16().collect();
    let command_line_w: Vec<u16> = command_line.encode_utf16().collect();

    let mut offset = strings_va;
    offset = write_wide_buffer(mem, paging, offset, &current_dir, va + rupp_offset::CURRENT_DIRECTORY);
    offset = write_wide_buffer(mem, paging, offset, &image_path_w, va + rupp_offset::IMAGE_PATH_NAME);
    write_wide_buffer(mem, paging, offset, &command_line_w, va + rupp_offset::COMMAND_LINE);

    va
}

fn write_wide_buffer(mem: &mut PhysMem, paging: &PagingContext, buffer_va: u32, units: &[u16], unicode_string_va: u32) -> u32 {
    for (i, unit) in units.iter().enumerate() {
        w16(mem, paging, buffer_va + (i as u32) * 2, *unit);
    }
    write_unicode_string(mem, paging, unicode_string_va, units.len(), buffer_va);
    buffer_va + (units.len() as u32) * 2 + 2
}

/// Writes the three KUSD stubs (§4.6 step 6, §6.4) and the `SystemCall` indirection pointer
/// ntdll reads at [`KUSD_SYSTEM_CALL_PTR_OFFSET`].
pub fn init_kusd_stubs(mem: &mut PhysMem, paging: &PagingContext) {
    w32(mem, paging, KUSD_VA + KUSD_SYSTEM_CALL_PTR_OFFSET, KUSD_SYSCALL_STUB_VA);

    // mov edx, esp; sysenter; ret
    write_code(mem, paging, KUSD_SYSCALL_STUB_VA, &[0x89, 0xE2, 0x0F, 0x34, 0xC3]);
    // mov eax, 0xFFFE; sysenter; int3
    write_code(
        mem,
        paging,
        KUSD_DLL_INIT_RETURN_STUB_VA,
        &[0xB8, 0xFE, 0xFF, 0x00, 0x00, 0x0F, 0x34, 0xCC],
    );
    // mov ecx, eax; mov eax, 0xFFFD; sysenter; int3
    write_code(
        mem,
        paging,
        KUSD_WNDPROC_RETURN_STUB_VA,
        &[0x89, 0xC1, 0xB8, 0xFD, 0xFF, 0x00, 0x00, 0x0F, 0x34, 0xCC],
    );
}

fn write_code(mem: &mut PhysMem, paging: &PagingContext, va: u32, bytes: &[u8]) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write_bytes(pa, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PteFlags;

    fn vm() -> (PhysMem, PagingContext) {
        let mut mem = PhysMem::new(32 * 1024 * 1024);
        let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x100000)).unwrap();
        paging
            .map_range(&mut mem, TEB_VA, 0x10000, 0x2000, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        paging
            .map_range(&mut mem, PEB_VA, 0x20000, 0x2000, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        paging
            .map_range(&mut mem, KUSD_VA, 0x30000, 0x1000, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        (mem, paging)
    }

    #[test]
    fn teb_self_points_to_its_own_va() {
        let (mut mem, paging) = vm();
        init_teb(&mut mem, &paging, 0x1000, 0x2000, 4, 8);
        let pa = paging.translate(&mem, TEB_VA + teb_offset::SELF).unwrap();
        assert_eq!(mem.read32(pa), TEB_VA);
    }

    #[test]
    fn peb_records_image_base_and_heap() {
        let (mut mem, paging) = vm();
        init_peb(&mut mem, &paging, 0x0040_0000, PEB_VA + peb_offset::SIZE + 2 * critical_section_offset::SIZE);
        let image_base_pa = paging.translate(&mem, PEB_VA + peb_offset::IMAGE_BASE_ADDRESS).unwrap();
        assert_eq!(mem.read32(image_base_pa), 0x0040_0000);
        let heap_pa = paging.translate(&mem, PEB_VA + peb_offset::PROCESS_HEAP).unwrap();
        assert_eq!(mem.read32(heap_pa), PROCESS_HEAP_VA);
    }

    #[test]
    fn kusd_syscall_pointer_is_installed() {
        let (mut mem, paging) = vm();
        init_kusd_stubs(&mut mem, &paging);
        let pa = paging.translate(&mem, KUSD_VA + KUSD_SYSTEM_CALL_PTR_OFFSET).unwrap();
        assert_eq!(mem.read32(pa), KUSD_SYSCALL_STUB_VA);
    }
}
