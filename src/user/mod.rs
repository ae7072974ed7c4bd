//! The USER subsystem stand-in (§1, §4.11–§4.14): window classes, windows, the desktop heap
//! backing their guest-visible shadows, the message queue, and the kernel→user callback
//! mechanism that invokes guest `WndProc`s. There is no GDI rasterizer or display surface behind
//! any of this — windows are bookkeeping, not pixels (explicit non-goal).

pub mod callback;
pub mod class;
pub mod desktop_heap;
pub mod message;
pub mod shared;
pub mod window;

use crate::handle::Handle;
use crate::mem::PhysMem;
use crate::paging::{PagingContext, PteFlags};
use callback::CallbackStack;
use class::ClassManager;
use desktop_heap::DesktopHeap;
use message::MessageQueue;
use shared::ServerInfo;
use window::WindowManager;

/// `USER_HANDLE_TYPE`: the guest-visible mirror's type tag. This emulator only ever
/// populates [`UserHandleType::Window`] entries; the rest of the real Win32 handle-type space is
/// named for a faithful table, matching how [`class::SystemClassIndex`] keeps unused system
/// class slots named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum UserHandleType {
 Free = 0,
 Window = 1,
 Menu = 2,
 Cursor = 3,
 SetWindowPos = 4,
 Hook = 5,
 ClipData = 6,
 CallProc = 7,
 Accel = 8,
 DdeAccess = 9,
 DdeConv = 10,
 DdeXact = 11,
 Monitor = 12,
 KbdLayout = 13,
 KbdFile = 14,
 WinEventHook = 15,
 Timer = 16,
 InputContext = 17,
 HidData = 18,
 DeviceInfo = 19,
 TouchInput = 20,
 GestureInfo = 21,
}

/// Special `HWND` values that never resolve through the handle mirror.
pub const HWND_DESKTOP: i32 = 0;
pub const HWND_BROADCAST: i32 = 0xFFFF;
pub const HWND_TOP: i32 = 0;
pub const HWND_BOTTOM: i32 = 1;
pub const HWND_TOPMOST: i32 = -1;
pub const HWND_NOTOPMOST: i32 = -2;
pub const HWND_MESSAGE: i32 = -3;

const MIRROR_ENTRY_SIZE: u32 = 12;

/// The guest-visible `USER_HANDLE_ENTRY` array (§4.8): a flat, 12-byte-per-entry table
/// parallel to the host-side [`crate::handle::HandleTable`] that [`WindowManager`] keeps
/// internally, letting guest code that already has a raw pointer validate/type-check a handle
/// without a syscall round-trip.
struct HandleMirror {
 base_va: u32,
 base_phys: u32,
 max_entries: u32,
}

impl HandleMirror {
 fn new(mem: &mut PhysMem, paging: &mut PagingContext, base_va: u32, max_entries: u32) -> Self {
 let size = max_entries * MIRROR_ENTRY_SIZE;
 let base_phys = paging.alloc_phys(mem, size);
 paging
 .map_range(mem, base_va, base_phys, size, PteFlags::PRESENT | PteFlags::USER)
 .expect("USER handle mirror must map cleanly at boot");
 Self { base_va, base_phys, max_entries }
 }

 fn write(&self, mem: &mut PhysMem, index: u32, ptr: u32, owner: u32, entry_type: UserHandleType, generation: u16) {
 if index >= self.max_entries {
 return;
 }
 let pa = self.base_phys + index * MIRROR_ENTRY_SIZE;
 mem.write32(pa, ptr);
 mem.write32(pa + 4, owner);
 mem.write8(pa + 8, entry_type as u8);
 mem.write8(pa + 9, 0);
 mem.write16(pa + 10, generation);
 }

 fn clear(&self, mem: &mut PhysMem, index: u32) {
 if index >= self.max_entries {
 return;
 }
 let pa = self.base_phys + index * MIRROR_ENTRY_SIZE;
 mem.zero_range(pa, MIRROR_ENTRY_SIZE as usize);
 }
}

/// Owns every piece of USER-subsystem state for one process (§1): the desktop heap, the class
/// and window managers built atop it, the message queue, the callback stack, the synthesised
/// `SERVERINFO`, and the guest-visible handle mirror tying windows back to real `HWND`s.
pub struct UserState {
 pub desktop_heap: DesktopHeap,
 pub classes: ClassManager,
 pub windows: WindowManager,
 pub messages: MessageQueue,
 pub callbacks: CallbackStack,
 pub server_info: ServerInfo,
 handle_mirror: HandleMirror,
}

impl UserState {
 #[allow(clippy::too_many_arguments)]
 pub fn new(
 mem: &mut PhysMem,
 paging: &mut PagingContext,
 desktop_heap_va: u32,
 desktop_heap_size: u32,
 handle_table_va: u32,
 max_handles: u32,
 server_info_va: u32,
) -> Self {
 let desktop_heap = DesktopHeap::new(mem, paging, desktop_heap_va, desktop_heap_size)
 .expect("desktop heap region must map cleanly at boot");
 let server_info = ServerInfo::new(mem, paging, server_info_va, max_handles);
 let handle_mirror = HandleMirror::new(mem, paging, handle_table_va, max_handles);
 Self {
 desktop_heap,
 classes: ClassManager::new(),
 windows: WindowManager::new(),
 messages: MessageQueue::new(),
 callbacks: CallbackStack::new(),
 server_info,
 handle_mirror,
 }
 }

 /// Creates a window and publishes its `HWND` in the guest-visible handle mirror (§4.8,
 /// §4.12).
 #[allow(clippy::too_many_arguments)]
 pub fn create_window(
 &mut self,
 mem: &mut PhysMem,
 class_atom: u16,
 window_name: &str,
 style: window::WindowStyle,
 ex_style: window::WindowStyleEx,
 x: i32,
 y: i32,
 cx: i32,
 cy: i32,
 parent: Handle,
 owner: Handle,
 h_instance: u32,
 id_menu: u32,
) -> Option<Handle> {
 let class = self.classes.find_by_atom(class_atom)?;
 let shadow_va_hint = class.shadow_va;
 let hwnd = self.windows.create(
 mem,
 &mut self.desktop_heap,
 class,
 window_name,
 style,
 ex_style,
 x,
 y,
 cx,
 cy,
 parent,
 owner,
 h_instance,
 id_menu,
);
 self.classes.add_ref(class_atom);
 let _ = shadow_va_hint;

 let wnd_shadow_va = self.windows.get(hwnd).map(|w| w.shadow_va).unwrap_or(0);
 let (index, generation) = (hwnd.0 & 0xFFFF, (hwnd.0 >> 16) as u16);
 self.handle_mirror.write(mem, index, wnd_shadow_va, h_instance, UserHandleType::Window, generation);
 Some(hwnd)
 }

 /// Destroys a window and retires its handle-mirror entry (§4.8, §4.12).
 pub fn destroy_window(&mut self, mem: &mut PhysMem, hwnd: Handle) -> bool {
 let class_atom = self.windows.get(hwnd).map(|w| w.class_atom);
 let destroyed = self.windows.destroy(hwnd);
 if destroyed {
 if let Some(atom) = class_atom {
 self.classes.release(atom);
 }
 let index = hwnd.0 & 0xFFFF;
 self.handle_mirror.clear(mem, index);
 }
 destroyed
 }
}

#[cfg(test)]
mod tests {
 use super::*;
 use crate::paging::PagingContext;

 fn setup() -> (PhysMem, PagingContext, UserState) {
 let mut mem = PhysMem::new(8 * 1024 * 1024);
 let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x400000)).unwrap();
 let user = UserState::new(&mut mem, &mut paging, 0x0100_0000, 0x2000, 0x7F03_0000, 64, 0x7F02_0000);
 (mem, paging, user)
 }

 #[test]
 fn creating_a_window_publishes_it_in_the_handle_mirror() {
 let (mut mem, mut paging, mut user) = setup();
 user.classes.register_system_classes(&mut mem, &mut user.desktop_heap, 0x401000, 0x400000).unwrap();
 let atom = user.classes.find("Button").unwrap().atom;
 let hwnd = user
 .create_window(&mut mem, atom, "OK", window::WindowStyle::CHILD, window::WindowStyleEx::empty(), 0, 0, 80, 24, Handle::NULL, Handle::NULL, 0x400000, 1)
 .unwrap();
 assert!(!hwnd.is_null());
 let index = hwnd.0 & 0xFFFF;
 assert!(index < 64);
 let _ = paging;
 }

 #[test]
 fn destroying_a_window_releases_its_class_reference() {
 let (mut mem, mut _paging, mut user) = setup();
 user.classes.register_system_classes(&mut mem, &mut user.desktop_heap, 0x401000, 0x400000).unwrap();
 let atom = user.classes.find("Edit").unwrap().atom;
 let hwnd = user
 .create_window(&mut mem, atom, "field", window::WindowStyle::CHILD, window::WindowStyleEx::empty(), 0, 0, 80, 24, Handle::NULL, Handle::NULL, 0x400000, 2)
 .unwrap();
 assert!(user.destroy_window(&mut mem, hwnd));
 assert!(user.classes.unregister("Edit").is_ok());
 }
}
