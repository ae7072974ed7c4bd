//! Windows (§4.12): `CreateWindowEx`/`DestroyWindow`, the parent/child/owner linkage, the
//! non-client rectangle calculation, `ShowWindow`, and `GetWindowLong`/`SetWindowLong`.

use crate::handle::{Handle, HandleTable};
use crate::mem::PhysMem;
use crate::user::class::Class;
use crate::user::desktop_heap::{wnd_offset, DesktopHeap};
use bitflags::bitflags;

bitflags! {
 /// `WS_*` window styles (§4.12).
 pub struct WindowStyle: u32 {
 const OVERLAPPED = 0x0000_0000;
 const POPUP = 0x8000_0000;
 const CHILD = 0x4000_0000;
 const MINIMIZE = 0x2000_0000;
 const VISIBLE = 0x1000_0000;
 const DISABLED = 0x0800_0000;
 const CLIPSIBLINGS = 0x0400_0000;
 const CLIPCHILDREN = 0x0200_0000;
 const MAXIMIZE = 0x0100_0000;
 const CAPTION = 0x00C0_0000;
 const BORDER = 0x0080_0000;
 const DLGFRAME = 0x0040_0000;
 const VSCROLL = 0x0020_0000;
 const HSCROLL = 0x0010_0000;
 const SYSMENU = 0x0008_0000;
 const THICKFRAME = 0x0004_0000;
 const GROUP = 0x0002_0000;
 const TABSTOP = 0x0001_0000;
 const MINIMIZEBOX = 0x0002_0000;
 const MAXIMIZEBOX = 0x0001_0000;
 const OVERLAPPEDWINDOW = Self::OVERLAPPED.bits | Self::CAPTION.bits | Self::SYSMENU.bits
 | Self::THICKFRAME.bits | Self::MINIMIZEBOX.bits | Self::MAXIMIZEBOX.bits;
 const POPUPWINDOW = Self::POPUP.bits | Self::BORDER.bits | Self::SYSMENU.bits;
 const CHILDWINDOW = Self::CHILD.bits;
 }
}

bitflags! {
 /// `WS_EX_*` extended window styles (§4.12).
 pub struct WindowStyleEx: u32 {
 const DLGMODALFRAME = 0x0000_0001;
 const NOPARENTNOTIFY = 0x0000_0004;
 const TOPMOST = 0x0000_0008;
 const ACCEPTFILES = 0x0000_0010;
 const TRANSPARENT = 0x0000_0020;
 const MDICHILD = 0x0000_0040;
 const TOOLWINDOW = 0x0000_0080;
 const WINDOWEDGE = 0x0000_0100;
 const CLIENTEDGE = 0x0000_0200;
 const CONTEXTHELP = 0x0000_0400;
 const RIGHT = 0x0000_1000;
 const RTLREADING = 0x0000_2000;
 const LEFTSCROLLBAR = 0x0000_4000;
 const CONTROLPARENT = 0x0001_0000;
 const STATICEDGE = 0x0002_0000;
 const APPWINDOW = 0x0004_0000;
 const LAYERED = 0x0008_0000;
 const OVERLAPPEDWINDOW = Self::WINDOWEDGE.bits | Self::CLIENTEDGE.bits;
 const PALETTEWINDOW = Self::WINDOWEDGE.bits | Self::TOOLWINDOW.bits | Self::TOPMOST.bits;
 }
}

bitflags! {
 /// Internal `WNDS_*` state bits (§4.12).
 pub struct WindowState: u32 {
 const VISIBLE = 0x0000_0001;
 const DISABLED = 0x0000_0002;
 const MAXIMIZED = 0x0000_0004;
 const MINIMIZED = 0x0000_0008;
 const ACTIVEFRAME = 0x0000_0010;
 const HASMENU = 0x0000_0020;
 const DESTROYED = 0x0000_0040;
 const SENDNCPAINT = 0x0000_0080;
 const SENDERASEBACKGROUND = 0x0000_0100;
 const NONCPAINT = 0x0000_0200;
 const ERASEBACKGROUND = 0x0000_0400;
 }
}

/// `ShowWindow` command codes (§4.12).
pub mod sw {
 pub const HIDE: i32 = 0;
 pub const SHOWNORMAL: i32 = 1;
 pub const SHOWMINIMIZED: i32 = 2;
 pub const SHOWMAXIMIZED: i32 = 3;
 pub const SHOWNOACTIVATE: i32 = 4;
 pub const SHOW: i32 = 5;
 pub const MINIMIZE: i32 = 6;
 pub const SHOWMINNOACTIVE: i32 = 7;
 pub const SHOWNA: i32 = 8;
 pub const RESTORE: i32 = 9;
}

/// `GetWindowLong`/`SetWindowLong` indices (§4.12).
pub mod gwl {
 pub const WNDPROC: i32 = -4;
 pub const HINSTANCE: i32 = -6;
 pub const HWNDPARENT: i32 = -8;
 pub const STYLE: i32 = -16;
 pub const EXSTYLE: i32 = -20;
 pub const USERDATA: i32 = -21;
 pub const ID: i32 = -12;
}

/// Value substituted by [`WindowManager::create`] for `x`/`y`/`cx`/`cy` (§4.12).
pub const CW_USEDEFAULT: i32 = -0x8000_0000i32 as i32;
const DEFAULT_X: i32 = 100;
const DEFAULT_Y: i32 = 100;
const DEFAULT_CX: i32 = 400;
const DEFAULT_CY: i32 = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
 pub left: i32,
 pub top: i32,
 pub right: i32,
 pub bottom: i32,
}

/// A created window. Linkage to parent/children/siblings/owner is expressed with [`Handle`]s
/// into the same [`HandleTable`] rather than raw pointers.
pub struct Wnd {
 pub hwnd: Handle,
 pub class_atom: u16,
 pub wnd_proc: u32,
 pub style: WindowStyle,
 pub ex_style: WindowStyleEx,
 pub state: WindowState,
 pub rc_window: Rect,
 pub rc_client: Rect,
 pub parent: Handle,
 pub owner: Handle,
 pub child: Handle,
 pub next_sibling: Handle,
 pub h_instance: u32,
 pub id_menu: u32,
 pub user_data: u32,
 pub text: String,
 pub shadow_va: u32,
}

/// Owns every live window and the guest `WND` shadow structures backing them.
pub struct WindowManager {
 windows: HandleTable<Wnd>,
 desktop: Handle,
}

impl WindowManager {
 pub fn new() -> Self {
 Self { windows: HandleTable::new(), desktop: Handle::NULL }
 }

 pub fn get(&self, hwnd: Handle) -> Option<&Wnd> {
 self.windows.get(hwnd).ok()
 }

 pub fn get_mut(&mut self, hwnd: Handle) -> Option<&mut Wnd> {
 self.windows.get_mut(hwnd).ok()
 }

 pub fn desktop(&self) -> Handle {
 self.desktop
 }

 /// Computes the client rectangle for a window rectangle and style pair (§4.12): successively
 /// shrinks from each edge for border/frame/caption/edge styles, clamped so client width and
 /// height never go negative.
 pub fn calc_client_rect(rc_window: Rect, style: WindowStyle, ex_style: WindowStyleEx) -> Rect {
 let mut rc = rc_window;
 if style.contains(WindowStyle::THICKFRAME) {
 rc.left += 4;
 rc.top += 4;
 rc.right -= 4;
 rc.bottom -= 4;
 } else if style.contains(WindowStyle::BORDER) || style.contains(WindowStyle::DLGFRAME) {
 rc.left += 1;
 rc.top += 1;
 rc.right -= 1;
 rc.bottom -= 1;
 }
 if style.contains(WindowStyle::CAPTION) {
 rc.top += 19;
 }
 if ex_style.contains(WindowStyleEx::CLIENTEDGE) {
 rc.left += 2;
 rc.top += 2;
 rc.right -= 2;
 rc.bottom -= 2;
 }
 if ex_style.contains(WindowStyleEx::WINDOWEDGE) {
 rc.left += 2;
 rc.right -= 2;
 }
 if rc.right < rc.left {
 rc.right = rc.left;
 }
 if rc.bottom < rc.top {
 rc.bottom = rc.top;
 }
 rc
 }

 /// Creates a window, substituting [`CW_USEDEFAULT`] coordinates (§4.12), computing the
 /// client rectangle, allocating a `WND` shadow and writing it, and linking the window under
 /// `parent` (or as a top-level desktop child if `parent` is null).
 #[allow(clippy::too_many_arguments)]
 pub fn create(
 &mut self,
 mem: &mut PhysMem,
 heap: &mut DesktopHeap,
 class: &Class,
 window_name: &str,
 style: WindowStyle,
 ex_style: WindowStyleEx,
 x: i32,
 y: i32,
 cx: i32,
 cy: i32,
 parent: Handle,
 owner: Handle,
 h_instance: u32,
 id_menu: u32,
) -> Handle {
 let x = if x == CW_USEDEFAULT { DEFAULT_X } else { x };
 let y = if y == CW_USEDEFAULT { DEFAULT_Y } else { y };
 let cx = if cx == CW_USEDEFAULT { DEFAULT_CX } else { cx };
 let cy = if cy == CW_USEDEFAULT { DEFAULT_CY } else { cy };

 let rc_window = Rect { left: x, top: y, right: x + cx, bottom: y + cy };
 let rc_client = Self::calc_client_rect(rc_window, style, ex_style);

 let shadow_va = heap.alloc(mem, wnd_offset::BASE_SIZE);
 let wnd = Wnd {
 hwnd: Handle::NULL,
 class_atom: class.atom,
 wnd_proc: class.wnd_proc,
 style,
 ex_style,
 state: if style.contains(WindowStyle::VISIBLE) { WindowState::VISIBLE } else { WindowState::empty() },
 rc_window,
 rc_client,
 parent,
 owner,
 child: Handle::NULL,
 next_sibling: Handle::NULL,
 h_instance,
 id_menu,
 user_data: 0,
 text: window_name.to_string(),
 shadow_va,
 };

 let hwnd = self.windows.alloc(wnd);
 if let Ok(w) = self.windows.get_mut(hwnd) {
 w.hwnd = hwnd;
 }

 if !parent.is_null() {
 self.link_child(parent, hwnd);
 } else if self.desktop.is_null() {
 self.desktop = hwnd;
 }

 self.write_shadow(mem, heap, hwnd);
 hwnd
 }

 /// Links `child` as the first child of `parent`, chaining the previous first child as its
 /// sibling.
 fn link_child(&mut self, parent: Handle, child: Handle) {
 let prev_first = self.windows.get(parent).ok().map(|w| w.child).unwrap_or(Handle::NULL);
 if let Ok(c) = self.windows.get_mut(child) {
 c.next_sibling = prev_first;
 }
 if let Ok(p) = self.windows.get_mut(parent) {
 p.child = child;
 }
 }

 /// Unlinks `hwnd` from its parent's child chain.
 fn unlink(&mut self, hwnd: Handle) {
 let parent = self.windows.get(hwnd).ok().map(|w| w.parent).unwrap_or(Handle::NULL);
 if parent.is_null() {
 return;
 }
 let next = self.windows.get(hwnd).ok().map(|w| w.next_sibling).unwrap_or(Handle::NULL);
 let first = self.windows.get(parent).ok().map(|w| w.child).unwrap_or(Handle::NULL);
 if first == hwnd {
 if let Ok(p) = self.windows.get_mut(parent) {
 p.child = next;
 }
 return;
 }
 let mut cur = first;
 while !cur.is_null() {
 let cur_next = self.windows.get(cur).ok().map(|w| w.next_sibling).unwrap_or(Handle::NULL);
 if cur_next == hwnd {
 if let Ok(c) = self.windows.get_mut(cur) {
 c.next_sibling = next;
 }
 break;
 }
 cur = cur_next;
 }
 }

 pub fn destroy(&mut self, hwnd: Handle) -> bool {
 self.unlink(hwnd);
 if let Ok(w) = self.windows.get_mut(hwnd) {
 w.state |= WindowState::DESTROYED;
 }
 self.windows.free(hwnd).is_ok()
 }

 pub fn set_pos(&mut self, mem: &mut PhysMem, heap: &mut DesktopHeap, hwnd: Handle, rc_window: Rect) {
 let (style, ex_style) = match self.windows.get(hwnd) {
 Ok(w) => (w.style, w.ex_style),
 Err(_) => return,
 };
 let rc_client = Self::calc_client_rect(rc_window, style, ex_style);
 if let Ok(w) = self.windows.get_mut(hwnd) {
 w.rc_window = rc_window;
 w.rc_client = rc_client;
 }
 self.write_shadow(mem, heap, hwnd);
 }

 /// `ShowWindow` (§4.12): toggles the `WNDS_VISIBLE` bit according to `cmd`, returning whether
 /// the window was previously visible (the real return-value convention).
 pub fn show(&mut self, mem: &mut PhysMem, heap: &mut DesktopHeap, hwnd: Handle, cmd: i32) -> bool {
 let was_visible = self.windows.get(hwnd).map(|w| w.state.contains(WindowState::VISIBLE)).unwrap_or(false);
 if let Ok(w) = self.windows.get_mut(hwnd) {
 match cmd {
 sw::HIDE => w.state.remove(WindowState::VISIBLE),
 sw::MINIMIZE | sw::SHOWMINIMIZED | sw::SHOWMINNOACTIVE => {
 w.state.insert(WindowState::VISIBLE | WindowState::MINIMIZED);
 w.state.remove(WindowState::MAXIMIZED);
 }
 sw::SHOWMAXIMIZED => {
 w.state.insert(WindowState::VISIBLE | WindowState::MAXIMIZED);
 w.state.remove(WindowState::MINIMIZED);
 }
 sw::RESTORE => {
 w.state.insert(WindowState::VISIBLE);
 w.state.remove(WindowState::MAXIMIZED | WindowState::MINIMIZED);
 }
 _ => w.state.insert(WindowState::VISIBLE),
 }
 }
 self.write_shadow(mem, heap, hwnd);
 was_visible
 }

 pub fn is_visible(&self, hwnd: Handle) -> bool {
 self.windows.get(hwnd).map(|w| w.state.contains(WindowState::VISIBLE)).unwrap_or(false)
 }

 pub fn set_text(&mut self, mem: &mut PhysMem, heap: &mut DesktopHeap, hwnd: Handle, text: &str) {
 if let Ok(w) = self.windows.get_mut(hwnd) {
 w.text = text.to_string();
 }
 self.write_shadow(mem, heap, hwnd);
 }

 pub fn get_text<'a>(&'a self, hwnd: Handle) -> Option<&'a str> {
 self.windows.get(hwnd).ok().map(|w| w.text.as_str())
 }

 /// `GetWindowLong` (§4.12): only the indices this emulator tracks are implemented; anything
 /// else reads as 0, matching an uninitialised `cbWndExtra` slot.
 pub fn get_long(&self, hwnd: Handle, index: i32) -> u32 {
 let w = match self.windows.get(hwnd) {
 Ok(w) => w,
 Err(_) => return 0,
 };
 match index {
 gwl::WNDPROC => w.wnd_proc,
 gwl::HINSTANCE => w.h_instance,
 gwl::HWNDPARENT => w.parent.0,
 gwl::STYLE => w.style.bits,
 gwl::EXSTYLE => w.ex_style.bits,
 gwl::USERDATA => w.user_data,
 gwl::ID => w.id_menu,
 _ => 0,
 }
 }

 pub fn set_long(&mut self, mem: &mut PhysMem, heap: &mut DesktopHeap, hwnd: Handle, index: i32, value: u32) -> u32 {
 let previous = self.get_long(hwnd, index);
 if let Ok(w) = self.windows.get_mut(hwnd) {
 match index {
 gwl::WNDPROC => w.wnd_proc = value,
 gwl::STYLE => w.style = WindowStyle::from_bits_truncate(value),
 gwl::EXSTYLE => w.ex_style = WindowStyleEx::from_bits_truncate(value),
 gwl::USERDATA => w.user_data = value,
 _ => {}
 }
 }
 self.write_shadow(mem, heap, hwnd);
 previous
 }

 fn write_shadow(&self, mem: &mut PhysMem, heap: &mut DesktopHeap, hwnd: Handle) {
 let w = match self.windows.get(hwnd) {
 Ok(w) => w,
 Err(_) => return,
 };
 if w.shadow_va == 0 {
 return;
 }
 heap.write32(mem, w.shadow_va + wnd_offset::STATE, w.state.bits);
 heap.write32(mem, w.shadow_va + wnd_offset::STYLE, w.style.bits);
 heap.write32(mem, w.shadow_va + wnd_offset::EXSTYLE, w.ex_style.bits);
 heap.write32(mem, w.shadow_va + wnd_offset::LPFNWNDPROC, w.wnd_proc);
 heap.write32(mem, w.shadow_va + wnd_offset::HMODULE, w.h_instance);
 heap.write32(mem, w.shadow_va + wnd_offset::IDMENU, w.id_menu);
 heap.write32(mem, w.shadow_va + wnd_offset::DWUSERDATA, w.user_data);
 heap.write32(mem, w.shadow_va + wnd_offset::RCWINDOW, w.rc_window.left as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCWINDOW + 4, w.rc_window.top as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCWINDOW + 8, w.rc_window.right as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCWINDOW + 12, w.rc_window.bottom as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCCLIENT, w.rc_client.left as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCCLIENT + 4, w.rc_client.top as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCCLIENT + 8, w.rc_client.right as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::RCCLIENT + 12, w.rc_client.bottom as u32);
 heap.write32(mem, w.shadow_va + wnd_offset::SPWNDPARENT, w.parent.0);
 heap.write32(mem, w.shadow_va + wnd_offset::SPWNDOWNER, w.owner.0);
 heap.write32(mem, w.shadow_va + wnd_offset::SPWNDCHILD, w.child.0);
 heap.write32(mem, w.shadow_va + wnd_offset::SPWNDNEXT, w.next_sibling.0);
 }
}

impl Default for WindowManager {
 fn default() -> Self {
 Self::new()
 }
}

#[cfg(test)]
mod tests {
 use super::*;
 use crate::paging::PagingContext;

 fn setup() -> (PhysMem, DesktopHeap, WindowManager, Class) {
 let mut mem = PhysMem::new(4 * 1024 * 1024);
 let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x200000)).unwrap();
 let heap = DesktopHeap::new(&mut mem, &mut paging, 0x0100_0000, 0x4000).unwrap();
 let class = Class {
 atom: 0xC000,
 name: "Test".into(),
 style: crate::user::class::ClassStyle::empty(),
 flags: crate::user::class::ClassFlags::empty(),
 wnd_proc: 0x401000,
 cls_extra: 0,
 wnd_extra: 0,
 h_instance: 0x400000,
 h_icon: 0,
 h_cursor: 0,
 h_background: 0,
 fnid: 0,
 ref_count: 0,
 shadow_va: 0,
 };
 (mem, heap, WindowManager::new(), class)
 }

 #[test]
 fn cw_usedefault_coordinates_are_substituted() {
 let (mut mem, mut heap, mut wm, class) = setup();
 let hwnd = wm.create(
 &mut mem, &mut heap, &class, "Main", WindowStyle::OVERLAPPEDWINDOW, WindowStyleEx::empty(),
 CW_USEDEFAULT, CW_USEDEFAULT, CW_USEDEFAULT, CW_USEDEFAULT, Handle::NULL, Handle::NULL, 0x400000, 0,
);
 let w = wm.get(hwnd).unwrap();
 assert_eq!(w.rc_window, Rect { left: 100, top: 100, right: 500, bottom: 400 });
 }

 #[test]
 fn caption_and_border_shrink_client_rect() {
 let rc = Rect { left: 0, top: 0, right: 100, bottom: 100 };
 let client = WindowManager::calc_client_rect(rc, WindowStyle::CAPTION | WindowStyle::BORDER, WindowStyleEx::empty());
 assert_eq!(client, Rect { left: 1, top: 20, right: 99, bottom: 99 });
 }

 #[test]
 fn client_rect_never_goes_negative() {
 let rc = Rect { left: 0, top: 0, right: 2, bottom: 2 };
 let client = WindowManager::calc_client_rect(rc, WindowStyle::THICKFRAME, WindowStyleEx::empty());
 assert_eq!(client.right, client.left);
 assert_eq!(client.bottom, client.top);
 }

 #[test]
 fn child_windows_link_under_parent() {
 let (mut mem, mut heap, mut wm, class) = setup();
 let parent = wm.create(&mut mem, &mut heap, &class, "Parent", WindowStyle::empty(), WindowStyleEx::empty(), 0, 0, 10, 10, Handle::NULL, Handle::NULL, 0, 0);
 let child = wm.create(&mut mem, &mut heap, &class, "Child", WindowStyle::CHILD, WindowStyleEx::empty(), 0, 0, 10, 10, parent, Handle::NULL, 0, 0);
 assert_eq!(wm.get(parent).unwrap().child, child);
 assert_eq!(wm.get(child).unwrap().parent, parent);
 }

 #[test]
 fn destroy_unlinks_from_parent() {
 let (mut mem, mut heap, mut wm, class) = setup();
 let parent = wm.create(&mut mem, &mut heap, &class, "Parent", WindowStyle::empty(), WindowStyleEx::empty(), 0, 0, 10, 10, Handle::NULL, Handle::NULL, 0, 0);
 let child = wm.create(&mut mem, &mut heap, &class, "Child", WindowStyle::CHILD, WindowStyleEx::empty(), 0, 0, 10, 10, parent, Handle::NULL, 0, 0);
 assert!(wm.destroy(child));
 assert!(wm.get(parent).unwrap().child.is_null());
 }

 #[test]
 fn show_window_toggles_visible_and_returns_prior_state() {
 let (mut mem, mut heap, mut wm, class) = setup();
 let hwnd = wm.create(&mut mem, &mut heap, &class, "W", WindowStyle::empty(), WindowStyleEx::empty(), 0, 0, 10, 10, Handle::NULL, Handle::NULL, 0, 0);
 assert!(!wm.show(&mut mem, &mut heap, hwnd, sw::SHOW));
 assert!(wm.is_visible(hwnd));
 assert!(wm.show(&mut mem, &mut heap, hwnd, sw::HIDE));
 assert!(!wm.is_visible(hwnd));
 }

 #[test]
 fn get_set_long_style_round_trips() {
 let (mut mem, mut heap, mut wm, class) = setup();
 let hwnd = wm.create(&mut mem, &mut heap, &class, "W", WindowStyle::empty(), WindowStyleEx::empty(), 0, 0, 10, 10, Handle::NULL, Handle::NULL, 0, 0);
 wm.set_long(&mut mem, &mut heap, hwnd, gwl::USERDATA, 0xDEAD_BEEF);
 assert_eq!(wm.get_long(hwnd, gwl::USERDATA), 0xDEAD_BEEF);
 }
}
