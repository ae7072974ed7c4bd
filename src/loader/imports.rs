//! Import resolution and stub dispatch (§4.5): walks a loaded module's import descriptors,
//! resolving every thunk to either a freshly generated syscall stub (for known ntdll.dll /
//! win32u.dll symbols) or the real export VA of the target DLL, recursing through forwarders,
//! and patching the IAT in guest physical memory.

use crate::error::LoaderError;
use crate::loader::exports::ExportLookup;
use crate::loader::module::ModuleManager;
use crate::loader::stubs::{StubKind, StubManager};
use crate::mem::PhysMem;
use crate::paging::PagingContext;
use crate::vfs::VfsJail;
use log::warn;

const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;

/// DLLs whose known imports are redirected straight to a syscall stub rather than resolved
/// against the DLL's real export table (§4.5 step 1).
const STUB_USING_DLLS: &[&str] = &["ntdll.dll", "win32u.dll"];

/// `(name, syscall number, stdcall arg count)`. The numbers are this emulator's own private
/// numbering (§6.5): nothing but our own dispatcher ever inspects them, so there is no need to
/// match a particular Windows build's real NT syscall numbers.
const KNOWN_SYSCALLS: &[(&str, u32, u16)] = &[
    ("NtClose", 0x0001, 1),
    ("NtCreateFile", 0x0002, 11),
    ("NtOpenFile", 0x0003, 6),
    ("NtReadFile", 0x0004, 9),
    ("NtWriteFile", 0x0005, 9),
    ("NtTerminateProcess", 0x0006, 2),
    ("NtTerminateThread", 0x0007, 2),
    ("NtAllocateVirtualMemory", 0x0008, 6),
    ("NtFreeVirtualMemory", 0x0009, 4),
    ("NtProtectVirtualMemory", 0x000A, 5),
    ("NtQueryVirtualMemory", 0x000B, 6),
    ("NtQueryInformationProcess", 0x000C, 5),
    ("NtQueryInformationThread", 0x000D, 5),
    ("NtQuerySystemInformation", 0x000E, 4),
    ("NtCreateEvent", 0x000F, 5),
    ("NtSetEvent", 0x0010, 2),
    ("NtClearEvent", 0x0011, 1),
    ("NtWaitForSingleObject", 0x0012, 3),
    ("NtWaitForMultipleObjects", 0x0013, 5),
    ("NtDelayExecution", 0x0014, 2),
    ("NtOpenKey", 0x0015, 3),
    ("NtCreateKey", 0x0016, 7),
    ("NtQueryValueKey", 0x0017, 6),
    ("NtSetValueKey", 0x0018, 6),
    ("NtCreateSection", 0x0019, 7),
    ("NtMapViewOfSection", 0x001A, 10),
    ("NtUnmapViewOfSection", 0x001B, 2),
    // win32u.dll / USER range (§4.11-§4.14, §6.5): same stub-redirection mechanism as the NT
    // range above, just a disjoint number space so the dispatcher can route by range.
    ("NtUserRegisterClassExWOW", 0x1000, 9),
    ("NtUserUnregisterClass", 0x1001, 3),
    ("NtUserCreateWindowEx", 0x1002, 15),
    ("NtUserDestroyWindow", 0x1003, 1),
    ("NtUserShowWindow", 0x1004, 2),
    ("NtUserGetWindowLong", 0x1005, 2),
    ("NtUserSetWindowLong", 0x1006, 3),
    ("NtUserPeekMessage", 0x1007, 5),
    ("NtUserGetMessage", 0x1008, 4),
    ("NtUserPostMessage", 0x1009, 4),
    ("NtUserPostThreadMessage", 0x100A, 4),
    ("NtUserPostQuitMessage", 0x100B, 1),
    ("NtUserTranslateMessage", 0x100C, 1),
    ("NtUserDispatchMessage", 0x100D, 1),
    ("NtUserDefWindowProc", 0x100E, 4),
    ("NtUserGetSystemMetrics", 0x100F, 1),
    ("NtUserGetMessageTime", 0x1010, 0),
    ("NtUserSetWindowText", 0x1011, 2),
];

/// `(export name, private syscall number, stdcall arg count)` for ntdll exports this emulator
/// patches in place (§4.10) rather than redirecting through the IAT: guest code calls these by
/// address taken directly from `GetProcAddress`/static linkage, so there is no import thunk to
/// repoint. [`crate::loader::module::ModuleManager::patch_export_bytes`] writes the same
/// [`StubKind::Syscall`] trampoline bytes [`resolve_imports`] uses for stub-using DLLs, just at
/// the export's own RVA instead of an IAT slot.
pub const PRIVATE_PATCH_TARGETS: &[(&str, u32, u16)] = &[
    ("RtlAllocateHeap", 0x2000, 3),
    ("RtlFreeHeap", 0x2001, 3),
    ("RtlReAllocateHeap", 0x2002, 4),
    ("RtlSizeHeap", 0x2003, 3),
    ("RtlMultiByteToUnicodeN", 0x2004, 6),
    ("RtlUnicodeToMultiByteN", 0x2005, 6),
    ("RtlMultiByteToUnicodeSize", 0x2006, 3),
    ("RtlUnicodeToMultiByteSize", 0x2007, 3),
    ("RtlOemToUnicodeN", 0x2008, 6),
    ("RtlUnicodeToOemN", 0x2009, 6),
    ("GetCommandLineA", 0x200A, 0),
    ("GetCommandLineW", 0x200B, 0),
];

fn lookup_known_syscall(name: &str) -> Option<(u32, u16)> {
    KNOWN_SYSCALLS.iter().find(|(n, _, _)| *n == name).map(|(_, num, args)| (*num, *args))
}

/// Totals returned from [`resolve_imports`] for logging; a failed lookup does not abort the
/// load (§4.5, §7 "load-time non-fatal").
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub total: u32,
    pub stubbed: u32,
    pub direct: u32,
    pub failed: u32,
}

fn read32(mem: &PhysMem, paging: &PagingContext, va: u32) -> u32 {
    paging.translate(mem, va).map(|pa| mem.read32(pa)).unwrap_or(0)
}

fn write32(mem: &mut PhysMem, paging: &PagingContext, va: u32, value: u32) {
    if let Some(pa) = paging.translate(mem, va) {
        mem.write32(pa, value);
    }
}

fn read_cstr(mem: &PhysMem, paging: &PagingContext, va: u32) -> String {
    let mut bytes = Vec::new();
    let mut cur = va;
    loop {
        let b = match paging.translate(mem, cur) {
            Some(pa) => mem.read_bytes(pa, 1)[0],
            None => 0,
        };
        if b == 0 || bytes.len() >= 512 {
            break;
        }
        bytes.push(b);
        cur += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The parsed right-hand side of a forwarder string (`"KERNEL32.GetCurrentThreadId"` or
/// `"NTDLL.#123"`).
enum ForwardTarget {
    Name(String),
    Ordinal(u32),
}

fn parse_forwarder(target: &str) -> Option<(String, ForwardTarget)> {
    let (dll, symbol) = target.split_once('.')?;
    let dll_name = format!("{}.dll", dll.to_lowercase());
    if let Some(ord) = symbol.strip_prefix('#') {
        Some((dll_name, ForwardTarget::Ordinal(ord.parse().ok()?)))
    } else {
        Some((dll_name, ForwardTarget::Name(symbol.to_string())))
    }
}

/// Resolves a single imported symbol to a VA, loading `dll_name` if it isn't already loaded
/// and recursing through forwarder chains (bounded to guard against a cycle between two
/// modules that forward to each other).
fn resolve_export(
    mem: &mut PhysMem,
    paging: &mut PagingContext,
    modules: &mut ModuleManager,
    vfs: &VfsJail,
    dll_name: &str,
    by_name: Option<&str>,
    by_ordinal: Option<u32>,
    depth: u32,
) -> Option<u32> {
    if depth > 16 {
        warn!("import: forwarder chain too deep resolving into {}", dll_name);
        return None;
    }

    let module_index = modules.load_by_name(mem, paging, vfs, dll_name).ok()?;

    let lookup = {
        let module = &modules.modules[module_index];
        match (by_name, by_ordinal) {
            (Some(name), _) => module.exports.lookup_by_name(name),
            (None, Some(ord)) => module.exports.lookup_by_ordinal(ord),
            (None, None) => return None,
        }
    };

    match lookup {
        ExportLookup::Resolved { rva } => Some(modules.modules[module_index].base_va + rva),
        ExportLookup::Forwarder(target) => {
            let (fwd_dll, fwd_symbol) = parse_forwarder(target)?;
            match fwd_symbol {
                ForwardTarget::Name(name) => resolve_export(mem, paging, modules, vfs, &fwd_dll, Some(&name), None, depth + 1),
                ForwardTarget::Ordinal(ord) => resolve_export(mem, paging, modules, vfs, &fwd_dll, None, Some(ord), depth + 1),
            }
        }
        ExportLookup::NotFound => None,
    }
}

/// Walks `module_index`'s import descriptors, resolving every thunk and patching the IAT in
/// guest physical memory (§4.5). Unresolved imports are left as zero and counted in
/// `ImportStats::failed`; they do not fail the load (§7, "load-time non-fatal").
pub fn resolve_imports(
    mem: &mut PhysMem,
    paging: &mut PagingContext,
    modules: &mut ModuleManager,
    vfs: &VfsJail,
    stubs: &mut StubManager,
    module_index: usize,
) -> Result<ImportStats, LoaderError> {
    let mut stats = ImportStats::default();

    let (base_va, import_dir_rva, import_dir_size) = {
        let module = &modules.modules[module_index];
        (module.base_va, module.import_dir_rva, module.import_dir_size)
    };
    if import_dir_rva == 0 || import_dir_size == 0 {
        return Ok(stats);
    }

    let mut descriptor_va = base_va + import_dir_rva;

    loop {
        let original_first_thunk = read32(mem, paging, descriptor_va);
        let name_rva = read32(mem, paging, descriptor_va + 12);
        let first_thunk = read32(mem, paging, descriptor_va + 16);

        if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
            break;
        }
        if name_rva == 0 || first_thunk == 0 {
            descriptor_va += 20;
            continue;
        }

        let dll_name = read_cstr(mem, paging, base_va + name_rva);
        let int_rva = if original_first_thunk != 0 { original_first_thunk } else { first_thunk };
        let stub_using = STUB_USING_DLLS.iter().any(|d| d.eq_ignore_ascii_case(&dll_name));

        let mut thunk_offset = 0u32;
        loop {
            let int_va = base_va + int_rva + thunk_offset;
            let iat_va = base_va + first_thunk + thunk_offset;
            let thunk = read32(mem, paging, int_va);
            if thunk == 0 {
                break;
            }
            stats.total += 1;

            let by_ordinal = if thunk & IMAGE_ORDINAL_FLAG32 != 0 { Some(thunk & 0xFFFF) } else { None };
            // IMAGE_IMPORT_BY_NAME: { Hint: u16, Name: cstr }; skip the hint field.
            let name = if by_ordinal.is_none() { Some(read_cstr(mem, paging, base_va + thunk + 2)) } else { None };

            let stub_hit = if stub_using { name.as_deref().and_then(lookup_known_syscall) } else { None };

            let resolved = if let Some((syscall_num, num_args)) = stub_hit {
                let stub_name = name.clone().unwrap();
                match stubs.get_or_create(mem, &stub_name, StubKind::Syscall { syscall_num, num_args }) {
                    Ok(va) => {
                        stats.stubbed += 1;
                        Some(va)
                    }
                    Err(e) => {
                        warn!("import: stub generation failed for {}: {}", stub_name, e);
                        None
                    }
                }
            } else {
                let va = resolve_export(mem, paging, modules, vfs, &dll_name, name.as_deref(), by_ordinal, 0);
                if va.is_some() {
                    stats.direct += 1;
                }
                va
            };

            match resolved {
                Some(va) => write32(mem, paging, iat_va, va),
                None => {
                    stats.failed += 1;
                    warn!("import: unresolved symbol {} in {}", name.as_deref().unwrap_or("(by ordinal)"), dll_name);
                }
            }

            thunk_offset += 4;
        }

        descriptor_va += 20;
    }

    modules.modules[module_index].imports_resolved = true;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ntdll_syscall_table_has_no_duplicate_names() {
        let mut seen = std::collections::HashSet::new();
        for (name, _, _) in KNOWN_SYSCALLS {
            assert!(seen.insert(*name), "duplicate syscall name {}", name);
        }
    }

    #[test]
    fn known_syscall_numbers_are_unique_and_in_range() {
        let mut seen = std::collections::HashSet::new();
        for (_, num, _) in KNOWN_SYSCALLS {
            assert!(seen.insert(*num), "duplicate syscall number {:#06x}", num);
            assert!(*num <= 0x1FFF, "syscall number {:#06x} outside the NT/USER range", num);
        }
    }

    #[test]
    fn private_patch_targets_have_no_duplicate_names_or_numbers() {
        let mut names = std::collections::HashSet::new();
        let mut nums = std::collections::HashSet::new();
        for (name, num, _) in PRIVATE_PATCH_TARGETS {
            assert!(names.insert(*name), "duplicate private patch target {}", name);
            assert!(nums.insert(*num), "duplicate private syscall number {:#06x}", num);
            assert!((0x2000..0x3000).contains(num), "private syscall number {:#06x} outside range", num);
        }
    }

    #[test]
    fn forwarder_by_name_parses_dll_and_symbol() {
        let (dll, target) = parse_forwarder("NTDLL.RtlGetCurrentThreadId").unwrap();
        assert_eq!(dll, "ntdll.dll");
        assert!(matches!(target, ForwardTarget::Name(ref n) if n == "RtlGetCurrentThreadId"));
    }

    #[test]
    fn forwarder_by_ordinal_parses_numeric_suffix() {
        let (dll, target) = parse_forwarder("NTDLL.#123").unwrap();
        assert_eq!(dll, "ntdll.dll");
        assert!(matches!(target, ForwardTarget::Ordinal(123)));
    }
}
