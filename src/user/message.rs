//! The message queue (§4.14): `PostMessage`/`PeekMessage`/`GetMessage` and the small
//! `DefWindowProc` switch this emulator synthesises for messages no guest `WndProc` handles.

use crate::handle::Handle;
use crate::mem::PhysMem;
use crate::paging::PagingContext;

/// `PeekMessage` flags (§4.14).
pub mod pm {
 pub const NOREMOVE: u32 = 0x0000;
 pub const REMOVE: u32 = 0x0001;
 pub const NOYIELD: u32 = 0x0002;
}

/// `WM_*` message identifiers actually referenced by this emulator's dispatch and
/// `DefWindowProc` logic (§4.14). The full Win32 table is much larger; only the subset this
/// emulator synthesises or special-cases is named.
pub mod wm {
 pub const NULL: u32 = 0x0000;
 pub const CREATE: u32 = 0x0001;
 pub const DESTROY: u32 = 0x0002;
 pub const MOVE: u32 = 0x0003;
 pub const SIZE: u32 = 0x0005;
 pub const ACTIVATE: u32 = 0x0006;
 pub const PAINT: u32 = 0x000F;
 pub const CLOSE: u32 = 0x0010;
 pub const QUIT: u32 = 0x0012;
 pub const ERASEBKGND: u32 = 0x0014;
 pub const SHOWWINDOW: u32 = 0x0018;
 pub const SETCURSOR: u32 = 0x0020;
 pub const MOUSEACTIVATE: u32 = 0x0021;
 pub const GETMINMAXINFO: u32 = 0x0024;
 pub const NCCREATE: u32 = 0x0081;
 pub const NCDESTROY: u32 = 0x0082;
 pub const NCHITTEST: u32 = 0x0084;
 pub const NCPAINT: u32 = 0x0085;
 pub const KEYDOWN: u32 = 0x0100;
 pub const KEYUP: u32 = 0x0101;
 pub const CHAR: u32 = 0x0102;
 pub const COMMAND: u32 = 0x0111;
 pub const TIMER: u32 = 0x0113;
 pub const MOUSEMOVE: u32 = 0x0200;
 pub const LBUTTONDOWN: u32 = 0x0201;
 pub const LBUTTONUP: u32 = 0x0202;
 pub const USER: u32 = 0x0400;
}

/// `DefWindowProc`'s `WM_NCHITTEST` result (§4.14).
pub const HT_CLIENT: u32 = 1;
/// `DefWindowProc`'s `WM_MOUSEACTIVATE` result (§4.14).
pub const MA_ACTIVATE: u32 = 1;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Msg {
 pub hwnd: Handle,
 pub message: u32,
 pub w_param: u32,
 pub l_param: u32,
 pub time: u32,
 pub pt_x: i32,
 pub pt_y: i32,
}

impl Msg {
 const WIRE_SIZE: u32 = 28;

 fn write(&self, mem: &mut PhysMem, paging: &PagingContext, va: u32) {
 let write32 = |mem: &mut PhysMem, offset: u32, value: u32| {
 if let Some(pa) = paging.translate(mem, va + offset) {
 mem.write32(pa, value);
 }
 };
 write32(mem, 0, self.hwnd.0);
 write32(mem, 4, self.message);
 write32(mem, 8, self.w_param);
 write32(mem, 12, self.l_param);
 write32(mem, 16, self.time);
 write32(mem, 20, self.pt_x as u32);
 write32(mem, 24, self.pt_y as u32);
 }
}

/// A thread's message queue: a 256-entry circular buffer plus the small bit of input/focus
/// state `DefWindowProc` and the dispatch loop consult (§4.14).
pub struct MessageQueue {
 messages: Vec<Msg>,
 head: usize,
 count: usize,
 tick: u32,
 pub hwnd_focus: Handle,
 pub hwnd_active: Handle,
 pub quit_posted: bool,
 pub exit_code: u32,
}

impl MessageQueue {
 pub fn new() -> Self {
 Self {
 messages: Vec::with_capacity(QUEUE_CAPACITY),
 head: 0,
 count: 0,
 tick: 0,
 hwnd_focus: Handle::NULL,
 hwnd_active: Handle::NULL,
 quit_posted: false,
 exit_code: 0,
 }
 }

 pub fn get_tick_count(&mut self) -> u32 {
 self.tick = self.tick.wrapping_add(1);
 self.tick
 }

 /// Posts a message, dropping it with a caller-visible `false` if the ring is full rather
 /// than blocking (no sender ever actually waits on queue space in this emulator).
 pub fn post(&mut self, hwnd: Handle, message: u32, w_param: u32, l_param: u32) -> bool {
 if self.count >= QUEUE_CAPACITY {
 return false;
 }
 let time = self.get_tick_count();
 let msg = Msg { hwnd, message, w_param, l_param, time, pt_x: 0, pt_y: 0 };
 let tail = (self.head + self.count) % QUEUE_CAPACITY;
 if self.messages.len() < QUEUE_CAPACITY {
 self.messages.push(msg);
 } else {
 self.messages[tail] = msg;
 }
 self.count += 1;
 true
 }

 pub fn post_quit(&mut self, exit_code: u32) {
 self.quit_posted = true;
 self.exit_code = exit_code;
 }

 pub fn has_messages(&self) -> bool {
 self.count > 0 || self.quit_posted
 }

 /// `PeekMessage` (§4.14): returns the oldest message matching `hwnd_filter` (0 = any) and
 /// the `[msg_filter_min, msg_filter_max]` range (both 0 = no filtering), removing it from
 /// the queue unless `PM_NOREMOVE` is set. `WM_QUIT` is synthesised once `post_quit` has been
 /// called and the real queue has drained.
 pub fn peek(&mut self, hwnd_filter: Handle, msg_filter_min: u32, msg_filter_max: u32, flags: u32) -> Option<Msg> {
 let matches = |m: &Msg| {
 let hwnd_ok = hwnd_filter.is_null() || m.hwnd == hwnd_filter;
 let range_ok = msg_filter_min == 0 && msg_filter_max == 0 || (m.message >= msg_filter_min && m.message <= msg_filter_max);
 hwnd_ok && range_ok
 };

 for i in 0..self.count {
 let index = (self.head + i) % self.messages.len().max(1);
 if self.messages.is_empty() {
 break;
 }
 if matches(&self.messages[index]) {
 let msg = self.messages[index];
 if flags & pm::REMOVE != 0 {
 // Shift everything after `i` down by one, keeping the ring logically dense.
 for j in i..self.count - 1 {
 let from = (self.head + j + 1) % self.messages.len();
 let to = (self.head + j) % self.messages.len();
 self.messages[to] = self.messages[from];
 }
 self.count -= 1;
 }
 return Some(msg);
 }
 }

 if self.count == 0 && self.quit_posted {
 if flags & pm::REMOVE != 0 {
 self.quit_posted = false;
 }
 return Some(Msg { hwnd: Handle::NULL, message: wm::QUIT, w_param: self.exit_code, l_param: 0, time: self.tick, pt_x: 0, pt_y: 0 });
 }

 None
 }

 /// `GetMessage` semantics differ from `PeekMessage` only in that the caller is meant to
 /// block until a message arrives; since this emulator's scheduler drives the whole queue
 /// synchronously, `get` is `peek` with `PM_REMOVE` forced on, returning `None` only when
 /// `WM_QUIT` itself was just retrieved (the real `GetMessage` returns 0 there).
 pub fn get(&mut self, hwnd_filter: Handle) -> Option<Msg> {
 self.peek(hwnd_filter, 0, 0, pm::REMOVE)
 }

 /// `TranslateMessage`: synthesises a `WM_CHAR` from a `WM_KEYDOWN`'s virtual-key code. No
 /// real keyboard layout is modeled, so the ASCII value of the low byte of `w_param` is used
 /// directly.
 pub fn translate(&mut self, msg: &Msg) {
 if msg.message == wm::KEYDOWN {
 self.post(msg.hwnd, wm::CHAR, msg.w_param & 0xFF, msg.l_param);
 }
 }

 pub fn write_to_guest(&self, mem: &mut PhysMem, paging: &PagingContext, msg: &Msg, va: u32) {
 msg.write(mem, paging, va);
 }

 pub fn read_from_guest(&self, mem: &PhysMem, paging: &PagingContext, va: u32) -> Msg {
 let read32 = |offset: u32| paging.translate(mem, va + offset).map(|pa| mem.read32(pa)).unwrap_or(0);
 Msg {
 hwnd: Handle(read32(0)),
 message: read32(4),
 w_param: read32(8),
 l_param: read32(12),
 time: read32(16),
 pt_x: read32(20) as i32,
 pt_y: read32(24) as i32,
 }
 }

 /// The default handling for a message no guest `WndProc` consumed (§4.14): posts
 /// `WM_DESTROY` on `WM_CLOSE`, answers `HTCLIENT`/`MA_ACTIVATE` for hit-testing and mouse
 /// activation, and otherwise returns 0.
 pub fn def_window_proc(&mut self, hwnd: Handle, message: u32, _w_param: u32, _l_param: u32) -> u32 {
 match message {
 wm::CLOSE => {
 self.post(hwnd, wm::DESTROY, 0, 0);
 0
 }
 wm::NCHITTEST => HT_CLIENT,
 wm::MOUSEACTIVATE => MA_ACTIVATE,
 _ => 0,
 }
 }
}

impl Default for MessageQueue {
 fn default() -> Self {
 Self::new()
 }
}

pub const MSG_WIRE_SIZE: u32 = Msg::WIRE_SIZE;

#[cfg(test)]
mod tests {
 use super::*;

 #[test]
 fn post_then_peek_remove_drains_the_queue() {
 let mut q = MessageQueue::new();
 q.post(Handle(1), wm::COMMAND, 7, 0);
 let msg = q.peek(Handle::NULL, 0, 0, pm::REMOVE).unwrap();
 assert_eq!(msg.message, wm::COMMAND);
 assert!(!q.has_messages());
 }

 #[test]
 fn peek_noremove_leaves_message_in_queue() {
 let mut q = MessageQueue::new();
 q.post(Handle(1), wm::PAINT, 0, 0);
 q.peek(Handle::NULL, 0, 0, pm::NOREMOVE);
 assert!(q.has_messages());
 let msg = q.peek(Handle::NULL, 0, 0, pm::REMOVE).unwrap();
 assert_eq!(msg.message, wm::PAINT);
 }

 #[test]
 fn quit_is_synthesised_once_the_real_queue_drains() {
 let mut q = MessageQueue::new();
 q.post(Handle(1), wm::PAINT, 0, 0);
 q.post_quit(42);
 assert_eq!(q.peek(Handle::NULL, 0, 0, pm::REMOVE).unwrap().message, wm::PAINT);
 let quit = q.peek(Handle::NULL, 0, 0, pm::REMOVE).unwrap();
 assert_eq!(quit.message, wm::QUIT);
 assert_eq!(quit.w_param, 42);
 }

 #[test]
 fn def_window_proc_close_posts_destroy() {
 let mut q = MessageQueue::new();
 q.def_window_proc(Handle(1), wm::CLOSE, 0, 0);
 let msg = q.peek(Handle::NULL, 0, 0, pm::REMOVE).unwrap();
 assert_eq!(msg.message, wm::DESTROY);
 }

 #[test]
 fn def_window_proc_nchittest_returns_htclient() {
 let mut q = MessageQueue::new();
 assert_eq!(q.def_window_proc(Handle(1), wm::NCHITTEST, 0, 0), HT_CLIENT);
 }

 #[test]
 fn hwnd_filter_skips_non_matching_messages() {
 let mut q = MessageQueue::new();
 q.post(Handle(1), wm::PAINT, 0, 0);
 q.post(Handle(2), wm::COMMAND, 0, 0);
 let msg = q.peek(Handle(2), 0, 0, pm::REMOVE).unwrap();
 assert_eq!(msg.message, wm::COMMAND);
 }
}
