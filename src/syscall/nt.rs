//! NT syscall range (§6.5): `0x0001`-`0x001B`, the `Nt*` entry points ntdll's own stubs and the
//! patched `Rtl*` wrappers ultimately fall into.

use super::{
    arg, object_attributes_name, read_i64, read32, status_from_io, status_from_vfs, write32,
    write_i64, write_iosb,
};
use crate::arch::CpuModel;
use crate::ntstatus::NtStatus;
use crate::object::NtObject;
use crate::process::{MMAP_BASE_VA, MMAP_REGION_SIZE, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE};
use crate::vmctx::VmContext;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

mod disposition {
    pub const SUPERSEDE: u32 = 0;
    pub const OPEN: u32 = 1;
    pub const CREATE: u32 = 2;
    pub const OPEN_IF: u32 = 3;
    pub const OVERWRITE: u32 = 4;
    pub const OVERWRITE_IF: u32 = 5;
}

mod file_info {
    pub const SUPERSEDED: u32 = 0;
    pub const OPENED: u32 = 1;
    pub const CREATED: u32 = 2;
    pub const OVERWRITTEN: u32 = 3;
}

const GENERIC_WRITE: u32 = 0x4000_0000;
const FILE_WRITE_DATA: u32 = 0x0000_0002;

pub(crate) fn dispatch<C: CpuModel>(ctx: &mut VmContext<C>, number: u32, edx: u32) -> u32 {
    let status = match number {
        0x0001 => nt_close(ctx, edx),
        0x0002 => nt_create_file(ctx, edx),
        0x0003 => nt_open_file(ctx, edx),
        0x0004 => nt_read_file(ctx, edx),
        0x0005 => nt_write_file(ctx, edx),
        0x0006 => nt_terminate_process(ctx, edx),
        0x0007 => nt_terminate_thread(ctx, edx),
        0x0008 => nt_allocate_virtual_memory(ctx, edx),
        0x0009 => nt_free_virtual_memory(ctx, edx),
        0x000A => nt_protect_virtual_memory(ctx, edx),
        0x000B => nt_query_virtual_memory(ctx, edx),
        0x000C => nt_query_information_process(ctx, edx),
        0x000D => nt_query_information_thread(ctx, edx),
        0x000E => nt_query_system_information(ctx, edx),
        0x000F => nt_create_event(ctx, edx),
        0x0010 => nt_set_event(ctx, edx),
        0x0011 => nt_clear_event(ctx, edx),
        0x0012 => nt_wait_for_single_object(ctx, edx),
        0x0013 => nt_wait_for_multiple_objects(ctx, edx),
        0x0014 => nt_delay_execution(ctx, edx),
        0x0015 => nt_open_key(ctx, edx),
        0x0016 => nt_create_key(ctx, edx),
        0x0017 => nt_query_value_key(ctx, edx),
        0x0018 => nt_set_value_key(ctx, edx),
        0x0019 => nt_create_section(ctx, edx),
        0x001A => nt_map_view_of_section(ctx, edx),
        0x001B => nt_unmap_view_of_section(ctx, edx),
        _ => NtStatus::NOT_IMPLEMENTED,
    };
    status.as_u32()
}

fn nt_close<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    if ctx.nt_objects.close(handle) {
        NtStatus::SUCCESS
    } else {
        NtStatus::INVALID_HANDLE
    }
}

fn open_with_disposition(
    path: &std::path::Path,
    create_disposition: u32,
    desired_access: u32,
) -> std::io::Result<(std::fs::File, u32)> {
    let writable = desired_access & (GENERIC_WRITE | FILE_WRITE_DATA) != 0
        || matches!(
            create_disposition,
            disposition::SUPERSEDE | disposition::CREATE | disposition::OVERWRITE | disposition::OVERWRITE_IF
        );

    let existed = path.exists();
    let mut options = OpenOptions::new();
    options.read(true).write(writable);

    match create_disposition {
        disposition::CREATE => {
            options.create_new(true);
        }
        disposition::OPEN_IF => {
            options.create(true);
        }
        disposition::SUPERSEDE | disposition::OVERWRITE_IF => {
            options.create(true).truncate(true);
        }
        disposition::OVERWRITE => {
            options.truncate(true);
        }
        disposition::OPEN => {}
        _ => {}
    }

    let file = options.open(path)?;
    let info = match create_disposition {
        disposition::CREATE => file_info::CREATED,
        disposition::SUPERSEDE if existed => file_info::SUPERSEDED,
        disposition::SUPERSEDE => file_info::CREATED,
        disposition::OPEN_IF if existed => file_info::OPENED,
        disposition::OPEN_IF => file_info::CREATED,
        disposition::OVERWRITE | disposition::OVERWRITE_IF if existed => file_info::OVERWRITTEN,
        disposition::OVERWRITE_IF => file_info::CREATED,
        _ => file_info::OPENED,
    };
    Ok((file, info))
}

fn nt_create_file<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let desired_access = arg(ctx, edx, 1);
    let oa_va = arg(ctx, edx, 2);
    let iosb_va = arg(ctx, edx, 3);
    let create_disposition = arg(ctx, edx, 7);

    let nt_path = object_attributes_name(ctx, oa_va);
    let host_path = match ctx.vfs.resolve(&nt_path) {
        Ok(p) => p,
        Err(e) => {
            let status = status_from_vfs(e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            return status;
        }
    };

    match open_with_disposition(&host_path, create_disposition, desired_access) {
        Ok((file, info)) => {
            let writable = desired_access & (GENERIC_WRITE | FILE_WRITE_DATA) != 0;
            let handle = ctx.nt_objects.insert(NtObject::File { path: host_path, file, writable });
            write32(ctx, handle_out, handle.0);
            write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), info);
            NtStatus::SUCCESS
        }
        Err(e) => {
            let status = status_from_io(&e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            status
        }
    }
}

fn nt_open_file<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let desired_access = arg(ctx, edx, 1);
    let oa_va = arg(ctx, edx, 2);
    let iosb_va = arg(ctx, edx, 3);

    let nt_path = object_attributes_name(ctx, oa_va);
    let host_path = match ctx.vfs.resolve(&nt_path) {
        Ok(p) => p,
        Err(e) => {
            let status = status_from_vfs(e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            return status;
        }
    };

    match open_with_disposition(&host_path, disposition::OPEN, desired_access) {
        Ok((file, info)) => {
            let writable = desired_access & (GENERIC_WRITE | FILE_WRITE_DATA) != 0;
            let handle = ctx.nt_objects.insert(NtObject::File { path: host_path, file, writable });
            write32(ctx, handle_out, handle.0);
            write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), info);
            NtStatus::SUCCESS
        }
        Err(e) => {
            let status = status_from_io(&e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            status
        }
    }
}

fn seek_if_requested<C: CpuModel>(ctx: &VmContext<C>, file: &mut std::fs::File, byte_offset_va: u32) {
    if byte_offset_va == 0 {
        return;
    }
    let offset = read_i64(ctx, byte_offset_va);
    if offset >= 0 {
        let _ = file.seek(SeekFrom::Start(offset as u64));
    }
}

fn nt_read_file<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    let iosb_va = arg(ctx, edx, 4);
    let buffer_va = arg(ctx, edx, 5);
    let length = arg(ctx, edx, 6);
    let byte_offset_va = arg(ctx, edx, 7);

    if handle.0 == STD_INPUT_HANDLE {
        let mut buf = vec![0u8; length as usize];
        let n = std::io::stdin().read(&mut buf).unwrap_or(0);
        super::write_bytes_guest(ctx, buffer_va, &buf[..n]);
        write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), n as u32);
        return NtStatus::SUCCESS;
    }

    let object = match ctx.nt_objects.get_mut(handle) {
        Some(o) => o,
        None => {
            write_iosb(ctx, iosb_va, NtStatus::INVALID_HANDLE.as_u32(), 0);
            return NtStatus::INVALID_HANDLE;
        }
    };
    let file = match object {
        NtObject::File { file, .. } => file,
        _ => {
            write_iosb(ctx, iosb_va, NtStatus::INVALID_HANDLE.as_u32(), 0);
            return NtStatus::INVALID_HANDLE;
        }
    };

    seek_if_requested(ctx, file, byte_offset_va);
    let mut buf = vec![0u8; length as usize];
    match file.read(&mut buf) {
        Ok(0) if length > 0 => {
            write_iosb(ctx, iosb_va, NtStatus::END_OF_FILE.as_u32(), 0);
            NtStatus::END_OF_FILE
        }
        Ok(n) => {
            super::write_bytes_guest(ctx, buffer_va, &buf[..n]);
            write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), n as u32);
            NtStatus::SUCCESS
        }
        Err(e) => {
            let status = status_from_io(&e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            status
        }
    }
}

fn nt_write_file<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    let iosb_va = arg(ctx, edx, 4);
    let buffer_va = arg(ctx, edx, 5);
    let length = arg(ctx, edx, 6);
    let byte_offset_va = arg(ctx, edx, 7);

    let bytes = super::read_bytes_guest(ctx, buffer_va, length as usize);

    if handle.0 == STD_OUTPUT_HANDLE || handle.0 == STD_ERROR_HANDLE {
        let mut out: Box<dyn Write> =
            if handle.0 == STD_ERROR_HANDLE { Box::new(std::io::stderr()) } else { Box::new(std::io::stdout()) };
        let n = out.write(&bytes).unwrap_or(0);
        let _ = out.flush();
        write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), n as u32);
        return NtStatus::SUCCESS;
    }

    let object = match ctx.nt_objects.get_mut(handle) {
        Some(o) => o,
        None => {
            write_iosb(ctx, iosb_va, NtStatus::INVALID_HANDLE.as_u32(), 0);
            return NtStatus::INVALID_HANDLE;
        }
    };
    let (file, writable) = match object {
        NtObject::File { file, writable, .. } => (file, *writable),
        _ => {
            write_iosb(ctx, iosb_va, NtStatus::INVALID_HANDLE.as_u32(), 0);
            return NtStatus::INVALID_HANDLE;
        }
    };
    if !writable {
        write_iosb(ctx, iosb_va, NtStatus::ACCESS_DENIED.as_u32(), 0);
        return NtStatus::ACCESS_DENIED;
    }

    seek_if_requested(ctx, file, byte_offset_va);
    match file.write(&bytes) {
        Ok(n) => {
            write_iosb(ctx, iosb_va, NtStatus::SUCCESS.as_u32(), n as u32);
            NtStatus::SUCCESS
        }
        Err(e) => {
            let status = status_from_io(&e);
            write_iosb(ctx, iosb_va, status.as_u32(), 0);
            status
        }
    }
}

fn nt_terminate_process<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let exit_status = arg(ctx, edx, 1);
    ctx.request_exit(exit_status);
    NtStatus::SUCCESS
}

fn nt_terminate_thread<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let exit_status = arg(ctx, edx, 1);
    ctx.sched.terminate(ctx.main_thread);
    ctx.request_exit(exit_status);
    NtStatus::SUCCESS
}

fn nt_allocate_virtual_memory<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let base_ptr = arg(ctx, edx, 1);
    let size_ptr = arg(ctx, edx, 3);

    let requested_base = read32(ctx, base_ptr);
    let mut size = read32(ctx, size_ptr);
    if size == 0 {
        return NtStatus::INVALID_PARAMETER;
    }
    size = (size + 0xFFF) & !0xFFF;

    let base = if requested_base != 0 {
        requested_base
    } else {
        let base = ctx.mmap_bump;
        if base + size > MMAP_BASE_VA + MMAP_REGION_SIZE {
            return NtStatus::NO_MEMORY;
        }
        ctx.mmap_bump = base + size;
        base
    };

    let phys = ctx.paging.alloc_phys(&mut ctx.mem, size);
    if phys == 0 {
        return NtStatus::NO_MEMORY;
    }
    if ctx
        .paging
        .map_range(&mut ctx.mem, base, phys, size, crate::paging::PteFlags::PRESENT | crate::paging::PteFlags::WRITABLE | crate::paging::PteFlags::USER)
        .is_err()
    {
        return NtStatus::NO_MEMORY;
    }

    write32(ctx, base_ptr, base);
    write32(ctx, size_ptr, size);
    NtStatus::SUCCESS
}

fn nt_free_virtual_memory<C: CpuModel>(_ctx: &mut VmContext<C>, _edx: u32) -> NtStatus {
    NtStatus::SUCCESS
}

fn nt_protect_virtual_memory<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let old_protect_ptr = arg(ctx, edx, 4);
    if old_protect_ptr != 0 {
        write32(ctx, old_protect_ptr, 0x04); // PAGE_READWRITE
    }
    NtStatus::SUCCESS
}

fn nt_query_virtual_memory<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let base_address = arg(ctx, edx, 1);
    let buffer_va = arg(ctx, edx, 3);
    let return_length_ptr = arg(ctx, edx, 5);

    // MEMORY_BASIC_INFORMATION, trimmed to what anything in this emulator actually inspects.
    write32(ctx, buffer_va, base_address & !0xFFF); // BaseAddress
    write32(ctx, buffer_va + 4, base_address & !0xFFF); // AllocationBase
    write32(ctx, buffer_va + 8, 0x04); // AllocationProtect = PAGE_READWRITE
    write32(ctx, buffer_va + 12, 0x1000); // RegionSize
    write32(ctx, buffer_va + 16, 0x1000); // State = MEM_COMMIT
    write32(ctx, buffer_va + 20, 0x04); // Protect
    write32(ctx, buffer_va + 24, 0x20000); // Type = MEM_PRIVATE

    if return_length_ptr != 0 {
        write32(ctx, return_length_ptr, 28);
    }
    NtStatus::SUCCESS
}

fn nt_query_information_process<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let buffer_va = arg(ctx, edx, 2);
    let return_length_ptr = arg(ctx, edx, 4);

    write32(ctx, buffer_va, 0); // ExitStatus
    write32(ctx, buffer_va + 4, crate::process::PEB_VA); // PebBaseAddress
    write32(ctx, buffer_va + 8, 0); // AffinityMask
    write32(ctx, buffer_va + 12, 0); // BasePriority
    write32(ctx, buffer_va + 16, 1); // UniqueProcessId
    write32(ctx, buffer_va + 20, 0); // InheritedFromUniqueProcessId

    if return_length_ptr != 0 {
        write32(ctx, return_length_ptr, 24);
    }
    NtStatus::SUCCESS
}

fn nt_query_information_thread<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let buffer_va = arg(ctx, edx, 2);
    let return_length_ptr = arg(ctx, edx, 4);

    write32(ctx, buffer_va, 0); // ExitStatus
    write32(ctx, buffer_va + 4, crate::process::TEB_VA); // TebBaseAddress
    write32(ctx, buffer_va + 8, 1); // ClientId.UniqueProcess
    write32(ctx, buffer_va + 12, ctx.main_thread); // ClientId.UniqueThread
    write32(ctx, buffer_va + 16, 0); // AffinityMask
    write32(ctx, buffer_va + 20, 0); // Priority
    write32(ctx, buffer_va + 24, 0); // BasePriority

    if return_length_ptr != 0 {
        write32(ctx, return_length_ptr, 28);
    }
    NtStatus::SUCCESS
}

fn nt_query_system_information<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let buffer_va = arg(ctx, edx, 1);
    let length = arg(ctx, edx, 2);
    let return_length_ptr = arg(ctx, edx, 3);

    super::write_bytes_guest(ctx, buffer_va, &vec![0u8; length as usize]);
    if return_length_ptr != 0 {
        write32(ctx, return_length_ptr, length);
    }
    NtStatus::SUCCESS
}

fn nt_create_event<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let event_type = arg(ctx, edx, 3);
    let initial_state = arg(ctx, edx, 4);

    let manual_reset = event_type == 0; // NotificationEvent
    let handle = ctx.nt_objects.insert(NtObject::Event { signaled: initial_state != 0, manual_reset });
    write32(ctx, handle_out, handle.0);
    NtStatus::SUCCESS
}

fn nt_set_event<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    let previous_state_ptr = arg(ctx, edx, 1);
    match ctx.nt_objects.get_mut(handle) {
        Some(NtObject::Event { signaled, .. }) => {
            if previous_state_ptr != 0 {
                write32(ctx, previous_state_ptr, *signaled as u32);
            }
            *signaled = true;
            NtStatus::SUCCESS
        }
        Some(_) => NtStatus::INVALID_HANDLE,
        None => NtStatus::INVALID_HANDLE,
    }
}

fn nt_clear_event<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    match ctx.nt_objects.get_mut(handle) {
        Some(NtObject::Event { signaled, .. }) => {
            *signaled = false;
            NtStatus::SUCCESS
        }
        Some(_) => NtStatus::INVALID_HANDLE,
        None => NtStatus::INVALID_HANDLE,
    }
}

/// Relative `LARGE_INTEGER` timeouts are negative 100ns units; this emulator's scheduler ticks
/// are abstract, so the conversion just drops the sign and the 100ns scale factor.
fn relative_timeout_ticks(value: i64) -> u64 {
    if value >= 0 {
        value as u64
    } else {
        ((-value) as u64 / 10_000).max(1)
    }
}

/// Blocks the current (only) thread and breaks the resulting deadlock the way the scheduler's
/// own `fast_forward` is built for (§4.12): a finite timeout always elapses, an infinite wait on
/// an object nothing else in this single-threaded emulator will ever signal is released instead
/// of hanging forever.
fn simulate_wait<C: CpuModel>(ctx: &mut VmContext<C>, timeout_va: u32) -> NtStatus {
    if timeout_va == 0 {
        ctx.sched.block(ctx.main_thread, None);
        ctx.sched.fast_forward();
        return NtStatus::SUCCESS;
    }
    let raw = read_i64(ctx, timeout_va);
    let ticks = relative_timeout_ticks(raw);
    ctx.sched.block(ctx.main_thread, Some(ticks));
    ctx.sched.fast_forward();
    NtStatus::TIMEOUT
}

fn nt_wait_for_single_object<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    let timeout_va = arg(ctx, edx, 2);

    if let Some(NtObject::Event { signaled, manual_reset }) = ctx.nt_objects.get_mut(handle) {
        if *signaled {
            if !*manual_reset {
                *signaled = false;
            }
            return NtStatus::SUCCESS;
        }
    }
    simulate_wait(ctx, timeout_va)
}

fn nt_wait_for_multiple_objects<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let count = arg(ctx, edx, 0);
    let handles_va = arg(ctx, edx, 1);
    let timeout_va = arg(ctx, edx, 4);

    for i in 0..count {
        let h = crate::handle::Handle(read32(ctx, handles_va + i * 4));
        if let Some(NtObject::Event { signaled, manual_reset }) = ctx.nt_objects.get_mut(h) {
            if *signaled {
                if !*manual_reset {
                    *signaled = false;
                }
                return NtStatus(i);
            }
        }
    }
    simulate_wait(ctx, timeout_va)
}

fn nt_delay_execution<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let delay_va = arg(ctx, edx, 1);
    if delay_va == 0 {
        return NtStatus::SUCCESS;
    }
    let raw = read_i64(ctx, delay_va);
    let ticks = relative_timeout_ticks(raw);
    ctx.sched.block(ctx.main_thread, Some(ticks));
    ctx.sched.fast_forward();
    NtStatus::SUCCESS
}

fn nt_open_key<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let oa_va = arg(ctx, edx, 2);
    let path = object_attributes_name(ctx, oa_va);
    let handle = ctx.nt_objects.insert(NtObject::Key { path });
    write32(ctx, handle_out, handle.0);
    NtStatus::SUCCESS
}

fn nt_create_key<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let oa_va = arg(ctx, edx, 2);
    let disposition_ptr = arg(ctx, edx, 6);
    let path = object_attributes_name(ctx, oa_va);
    let handle = ctx.nt_objects.insert(NtObject::Key { path });
    write32(ctx, handle_out, handle.0);
    if disposition_ptr != 0 {
        write32(ctx, disposition_ptr, 2); // REG_CREATED_NEW_KEY
    }
    NtStatus::SUCCESS
}

fn nt_query_value_key<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    let return_length_ptr = arg(ctx, edx, 5);
    if ctx.nt_objects.get(handle).is_none() {
        return NtStatus::INVALID_HANDLE;
    }
    if return_length_ptr != 0 {
        write32(ctx, return_length_ptr, 0);
    }
    NtStatus::OBJECT_NAME_NOT_FOUND
}

fn nt_set_value_key<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle = crate::handle::Handle(arg(ctx, edx, 0));
    if ctx.nt_objects.get(handle).is_none() {
        return NtStatus::INVALID_HANDLE;
    }
    NtStatus::SUCCESS
}

fn nt_create_section<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let handle_out = arg(ctx, edx, 0);
    let max_size_ptr = arg(ctx, edx, 3);
    let size = if max_size_ptr != 0 { read_i64(ctx, max_size_ptr) as u32 } else { 0 };
    let handle = ctx.nt_objects.insert(NtObject::Section { size });
    write32(ctx, handle_out, handle.0);
    NtStatus::SUCCESS
}

fn nt_map_view_of_section<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> NtStatus {
    let section_handle = crate::handle::Handle(arg(ctx, edx, 0));
    let base_address_ptr = arg(ctx, edx, 2);
    let view_size_ptr = arg(ctx, edx, 6);

    let size = match ctx.nt_objects.get(section_handle) {
        Some(NtObject::Section { size }) => *size,
        Some(_) => return NtStatus::INVALID_HANDLE,
        None => return NtStatus::INVALID_HANDLE,
    };
    let size = if size == 0 { 0x1000 } else { (size + 0xFFF) & !0xFFF };

    let base = ctx.mmap_bump;
    if base + size > MMAP_BASE_VA + MMAP_REGION_SIZE {
        return NtStatus::NO_MEMORY;
    }
    ctx.mmap_bump = base + size;

    let phys = ctx.paging.alloc_phys(&mut ctx.mem, size);
    if phys == 0 {
        return NtStatus::NO_MEMORY;
    }
    if ctx
        .paging
        .map_range(&mut ctx.mem, base, phys, size, crate::paging::PteFlags::PRESENT | crate::paging::PteFlags::WRITABLE | crate::paging::PteFlags::USER)
        .is_err()
    {
        return NtStatus::NO_MEMORY;
    }

    write32(ctx, base_address_ptr, base);
    if view_size_ptr != 0 {
        write32(ctx, view_size_ptr, size);
    }
    NtStatus::SUCCESS
}

fn nt_unmap_view_of_section<C: CpuModel>(_ctx: &mut VmContext<C>, _edx: u32) -> NtStatus {
    NtStatus::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapAllocFlags;
    use crate::ntstatus::NtStatus;
    use crate::testutil::{booted_ctx, write_args, write_object_attributes};

    /// Scenario 3 (spec.md §8): `NtCreateFile` on a path that walks `..` out of the jail root
    /// must fail translation and never issue a handle.
    #[test]
    fn nt_create_file_rejects_a_jail_escape() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 32);
        let oa_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 16);
        let name_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 8);
        let name_buffer_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 256);
        let handle_out = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 4);
        let iosb_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 8);

        write_object_attributes(&mut ctx, oa_va, name_va, name_buffer_va, r"\??\C:\..\..\etc\passwd");
        write_args(&mut ctx, edx, &[handle_out, 0, oa_va, iosb_va, 0, 0, 0, disposition::OPEN]);

        let status = nt_create_file(&mut ctx, edx);
        assert_eq!(status, NtStatus::ACCESS_DENIED);
        assert_eq!(read32(&ctx, handle_out), 0);
    }

    #[test]
    fn nt_create_file_inside_the_jail_succeeds_and_returns_a_handle() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 32);
        let oa_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 16);
        let name_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 8);
        let name_buffer_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 256);
        let handle_out = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 4);
        let iosb_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 8);

        write_object_attributes(&mut ctx, oa_va, name_va, name_buffer_va, r"\??\C:\greeting.txt");
        write_args(&mut ctx, edx, &[handle_out, GENERIC_WRITE, oa_va, iosb_va, 0, 0, 0, disposition::CREATE]);

        let status = nt_create_file(&mut ctx, edx);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_ne!(read32(&ctx, handle_out), 0);
    }
}
