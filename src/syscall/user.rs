//! USER syscall range (§6.5): `0x1000`-`0x1011`, the `NtUser*` entry points win32u's stubs reach.
//!
//! Unlike the NT range, these return a direct Win32 value (`HWND`, `BOOL`, `LRESULT`) rather than
//! an `NTSTATUS` — that is the real `NtUser*` calling convention, since callers are Win32 APIs
//! that already expect `HWND`/`BOOL` back, not kernel code translating a status code itself.

use super::{arg, read32, read_wide_cstr, write32};
use crate::arch::CpuModel;
use crate::handle::Handle;
use crate::heap::HeapAllocFlags;
use crate::user::callback::{self, CreateStructParams};
use crate::user::class::ClassStyle;
use crate::user::message::wm;
use crate::user::window::{WindowStyle, WindowStyleEx};
use crate::vmctx::VmContext;

pub(crate) fn dispatch<C: CpuModel>(ctx: &mut VmContext<C>, number: u32, edx: u32) -> u32 {
    match number {
        0x1000 => nt_user_register_class_ex_wow(ctx, edx),
        0x1001 => nt_user_unregister_class(ctx, edx),
        0x1002 => nt_user_create_window_ex(ctx, edx),
        0x1003 => nt_user_destroy_window(ctx, edx),
        0x1004 => nt_user_show_window(ctx, edx),
        0x1005 => nt_user_get_window_long(ctx, edx),
        0x1006 => nt_user_set_window_long(ctx, edx),
        0x1007 => nt_user_peek_message(ctx, edx),
        0x1008 => nt_user_get_message(ctx, edx),
        0x1009 => nt_user_post_message(ctx, edx),
        0x100A => nt_user_post_thread_message(ctx, edx),
        0x100B => nt_user_post_quit_message(ctx, edx),
        0x100C => nt_user_translate_message(ctx, edx),
        0x100D => nt_user_dispatch_message(ctx, edx),
        0x100E => nt_user_def_window_proc(ctx, edx),
        0x100F => nt_user_get_system_metrics(ctx, edx),
        0x1010 => nt_user_get_message_time(ctx, edx),
        0x1011 => nt_user_set_window_text(ctx, edx),
        _ => 0,
    }
}

/// Reads a class-name argument that is either a raw atom (the low word non-zero, high word
/// zero, in the atom range) or a guest VA naming a NUL-terminated wide string (§4.11, §4.13).
fn read_class_name<C: CpuModel>(ctx: &VmContext<C>, value: u32) -> Option<String> {
    if value >= 0xC000 && value <= 0xFFFF {
        ctx.user.classes.find_by_atom(value as u16).map(|c| c.name.clone())
    } else if value != 0 {
        Some(read_wide_cstr(ctx, value))
    } else {
        None
    }
}

mod wndclassex_offset {
    pub const STYLE: u32 = 4;
    pub const LPFN_WND_PROC: u32 = 8;
    pub const CB_CLS_EXTRA: u32 = 12;
    pub const CB_WND_EXTRA: u32 = 16;
    pub const H_INSTANCE: u32 = 20;
    pub const H_ICON: u32 = 24;
    pub const H_CURSOR: u32 = 28;
    pub const HBR_BACKGROUND: u32 = 32;
    pub const LPSZ_CLASS_NAME: u32 = 40;
}

fn nt_user_register_class_ex_wow<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let wndclassex_va = arg(ctx, edx, 0);
    if wndclassex_va == 0 {
        return 0;
    }

    let style = read32(ctx, wndclassex_va + wndclassex_offset::STYLE);
    let wnd_proc = read32(ctx, wndclassex_va + wndclassex_offset::LPFN_WND_PROC);
    let cls_extra = read32(ctx, wndclassex_va + wndclassex_offset::CB_CLS_EXTRA) as u16;
    let wnd_extra = read32(ctx, wndclassex_va + wndclassex_offset::CB_WND_EXTRA) as u16;
    let h_instance = read32(ctx, wndclassex_va + wndclassex_offset::H_INSTANCE);
    let h_icon = read32(ctx, wndclassex_va + wndclassex_offset::H_ICON);
    let h_cursor = read32(ctx, wndclassex_va + wndclassex_offset::H_CURSOR);
    let h_background = read32(ctx, wndclassex_va + wndclassex_offset::HBR_BACKGROUND);
    let name_va = read32(ctx, wndclassex_va + wndclassex_offset::LPSZ_CLASS_NAME);
    let name = read_wide_cstr(ctx, name_va);
    if name.is_empty() {
        return 0;
    }

    match ctx.user.classes.register(
        &mut ctx.mem,
        &mut ctx.user.desktop_heap,
        &name,
        ClassStyle::from_bits_truncate(style),
        wnd_proc,
        cls_extra,
        wnd_extra,
        h_instance,
        h_icon,
        h_cursor,
        h_background,
    ) {
        Ok(atom) => atom as u32,
        Err(_) => 0,
    }
}

fn nt_user_unregister_class<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let class_ref = arg(ctx, edx, 0);
    let name = match read_class_name(ctx, class_ref) {
        Some(n) => n,
        None => return 0,
    };
    ctx.user.classes.unregister(&name).is_ok() as u32
}

fn nt_user_create_window_ex<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let ex_style = arg(ctx, edx, 0);
    let class_ref = arg(ctx, edx, 1);
    let window_name_va = arg(ctx, edx, 2);
    let style = arg(ctx, edx, 3);
    let x = arg(ctx, edx, 4) as i32;
    let y = arg(ctx, edx, 5) as i32;
    let cx = arg(ctx, edx, 6) as i32;
    let cy = arg(ctx, edx, 7) as i32;
    let hwnd_parent = Handle(arg(ctx, edx, 8));
    let h_menu = arg(ctx, edx, 9);
    let h_instance = arg(ctx, edx, 10);
    let lp_param = arg(ctx, edx, 11);

    let class_name = match read_class_name(ctx, class_ref) {
        Some(n) => n,
        None => return 0,
    };
    let (class_atom, wnd_proc) = match ctx.user.classes.find(&class_name) {
        Some(c) => (c.atom, c.wnd_proc),
        None => return 0,
    };

    let style_flags = WindowStyle::from_bits_truncate(style);
    let ex_style_flags = WindowStyleEx::from_bits_truncate(ex_style);
    let window_name = if window_name_va != 0 { read_wide_cstr(ctx, window_name_va) } else { String::new() };

    let (parent, owner) = if style_flags.contains(WindowStyle::CHILD) {
        (hwnd_parent, Handle::NULL)
    } else {
        (Handle::NULL, hwnd_parent)
    };

    let hwnd = match ctx.user.create_window(
        &mut ctx.mem,
        class_atom,
        &window_name,
        style_flags,
        ex_style_flags,
        x,
        y,
        cx,
        cy,
        parent,
        owner,
        h_instance,
        h_menu,
    ) {
        Some(h) => h,
        None => return 0,
    };

    if wnd_proc == 0 {
        return hwnd.0;
    }

    let createstruct_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), callback::createstruct_offset::SIZE);
    if createstruct_va != 0 {
        let name_va = if window_name.is_empty() {
            0
        } else {
            let va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), (window_name.encode_utf16().count() as u32 + 1) * 2);
            if va != 0 {
                super::write_wide_cstr(ctx, va, &window_name);
            }
            va
        };
        let params = CreateStructParams {
            lp_create_params: lp_param,
            h_instance,
            h_menu,
            hwnd_parent: hwnd_parent.0,
            cy,
            cx,
            y,
            x,
            style,
            lpsz_name_va: name_va,
            lpsz_class: class_atom as u32,
            ex_style,
        };
        callback::write_createstruct(&mut ctx.mem, &ctx.paging, createstruct_va, &params);

        if let Some(result) = ctx.run_wndproc_callback(wnd_proc, hwnd, wm::NCCREATE, 0, createstruct_va) {
            if result == 0 {
                ctx.user.destroy_window(&mut ctx.mem, hwnd);
                return 0;
            }
        }
        if let Some(result) = ctx.run_wndproc_callback(wnd_proc, hwnd, wm::CREATE, 0, createstruct_va) {
            if result as i32 == -1 {
                ctx.user.destroy_window(&mut ctx.mem, hwnd);
                return 0;
            }
        }
    }

    hwnd.0
}

fn nt_user_destroy_window<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let wnd_proc = ctx.user.windows.get(hwnd).map(|w| w.wnd_proc).unwrap_or(0);
    if wnd_proc != 0 {
        ctx.run_wndproc_callback(wnd_proc, hwnd, wm::DESTROY, 0, 0);
        ctx.run_wndproc_callback(wnd_proc, hwnd, wm::NCDESTROY, 0, 0);
    }
    ctx.user.destroy_window(&mut ctx.mem, hwnd) as u32
}

fn nt_user_show_window<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let cmd = arg(ctx, edx, 1) as i32;
    ctx.user.windows.show(&mut ctx.mem, &mut ctx.user.desktop_heap, hwnd, cmd) as u32
}

fn nt_user_get_window_long<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let index = arg(ctx, edx, 1) as i32;
    ctx.user.windows.get_long(hwnd, index)
}

fn nt_user_set_window_long<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let index = arg(ctx, edx, 1) as i32;
    let value = arg(ctx, edx, 2);
    ctx.user.windows.set_long(&mut ctx.mem, &mut ctx.user.desktop_heap, hwnd, index, value)
}

fn nt_user_set_window_text<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let text_va = arg(ctx, edx, 1);
    let text = read_wide_cstr(ctx, text_va);
    ctx.user.windows.set_text(&mut ctx.mem, &mut ctx.user.desktop_heap, hwnd, &text);
    1
}

fn nt_user_peek_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let msg_va = arg(ctx, edx, 0);
    let hwnd_filter = Handle(arg(ctx, edx, 1));
    let msg_min = arg(ctx, edx, 2);
    let msg_max = arg(ctx, edx, 3);
    let flags = arg(ctx, edx, 4);

    match ctx.user.messages.peek(hwnd_filter, msg_min, msg_max, flags) {
        Some(msg) => {
            ctx.user.messages.write_to_guest(&mut ctx.mem, &ctx.paging, &msg, msg_va);
            1
        }
        None => 0,
    }
}

fn nt_user_get_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let msg_va = arg(ctx, edx, 0);
    let hwnd_filter = Handle(arg(ctx, edx, 1));

    let msg = match ctx.user.messages.get(hwnd_filter) {
        Some(msg) => msg,
        None => {
            // Nothing will ever post to this queue without guest code running further, and
            // nothing else in this single-threaded emulator can signal it (§4.16's
            // deadlock-breaking rationale applies the same way here as to a kernel wait).
            ctx.user.messages.post_quit(0);
            match ctx.user.messages.get(hwnd_filter) {
                Some(msg) => msg,
                None => return 0,
            }
        }
    };

    ctx.user.messages.write_to_guest(&mut ctx.mem, &ctx.paging, &msg, msg_va);
    (msg.message != wm::QUIT) as u32
}

fn nt_user_post_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let message = arg(ctx, edx, 1);
    let w_param = arg(ctx, edx, 2);
    let l_param = arg(ctx, edx, 3);
    ctx.user.messages.post(hwnd, message, w_param, l_param) as u32
}

fn nt_user_post_thread_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let message = arg(ctx, edx, 1);
    let w_param = arg(ctx, edx, 2);
    let l_param = arg(ctx, edx, 3);
    ctx.user.messages.post(Handle::NULL, message, w_param, l_param) as u32
}

fn nt_user_post_quit_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let exit_code = arg(ctx, edx, 0);
    ctx.user.messages.post_quit(exit_code);
    0
}

fn nt_user_translate_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let msg_va = arg(ctx, edx, 0);
    let msg = ctx.user.messages.read_from_guest(&ctx.mem, &ctx.paging, msg_va);
    ctx.user.messages.translate(&msg);
    1
}

fn nt_user_dispatch_message<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let msg_va = arg(ctx, edx, 0);
    let msg = ctx.user.messages.read_from_guest(&ctx.mem, &ctx.paging, msg_va);

    let wnd_proc = ctx.user.windows.get(msg.hwnd).map(|w| w.wnd_proc).unwrap_or(0);
    if wnd_proc != 0 {
        if let Some(result) = ctx.run_wndproc_callback(wnd_proc, msg.hwnd, msg.message, msg.w_param, msg.l_param) {
            return result;
        }
    }
    ctx.user.messages.def_window_proc(msg.hwnd, msg.message, msg.w_param, msg.l_param)
}

fn nt_user_def_window_proc<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let hwnd = Handle(arg(ctx, edx, 0));
    let message = arg(ctx, edx, 1);
    let w_param = arg(ctx, edx, 2);
    let l_param = arg(ctx, edx, 3);
    ctx.user.messages.def_window_proc(hwnd, message, w_param, l_param)
}

fn nt_user_get_system_metrics<C: CpuModel>(ctx: &mut VmContext<C>, edx: u32) -> u32 {
    let index = arg(ctx, edx, 0) as usize;
    ctx.user.server_info.get_metric(&ctx.mem, index) as u32
}

fn nt_user_get_message_time<C: CpuModel>(ctx: &mut VmContext<C>, _edx: u32) -> u32 {
    ctx.user.messages.get_tick_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapAllocFlags;
    use crate::testutil::{booted_ctx, write_args};
    use crate::user::message::wm;

    /// Scenario 6 (spec.md §8): `PostQuitMessage(42)` followed by `GetMessage` returns 0 (the
    /// queue is done) with the fetched `MSG` carrying `WM_QUIT` and the exit code in `wParam`.
    #[test]
    fn post_quit_message_then_get_message_returns_zero_with_the_exit_code() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 16);

        write_args(&mut ctx, edx, &[42]);
        nt_user_post_quit_message(&mut ctx, edx);

        let msg_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 28);
        write_args(&mut ctx, edx, &[msg_va, 0]);
        let result = nt_user_get_message(&mut ctx, edx);

        assert_eq!(result, 0);
        assert_eq!(read32(&ctx, msg_va + 4), wm::QUIT);
        assert_eq!(read32(&ctx, msg_va + 8), 42);
    }

    #[test]
    fn peek_message_without_remove_leaves_the_message_queued() {
        let (_tmp, mut ctx) = booted_ctx();
        let edx = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 32);

        write_args(&mut ctx, edx, &[Handle::NULL.0, wm::USER, 0, 0]);
        assert_eq!(nt_user_post_message(&mut ctx, edx), 1);

        let msg_va = ctx.heap.alloc(&mut ctx.mem, HeapAllocFlags::empty(), 28);
        write_args(&mut ctx, edx, &[msg_va, Handle::NULL.0, 0, 0, crate::user::message::pm::NOREMOVE]);
        assert_eq!(nt_user_peek_message(&mut ctx, edx), 1);
        assert_eq!(read32(&ctx, msg_va + 4), wm::USER);

        write_args(&mut ctx, edx, &[msg_va, Handle::NULL.0, 0, 0, crate::user::message::pm::REMOVE]);
        assert_eq!(nt_user_peek_message(&mut ctx, edx), 1);
        assert_eq!(nt_user_peek_message(&mut ctx, edx), 0, "the message should have been removed by PM_REMOVE");
    }
}
