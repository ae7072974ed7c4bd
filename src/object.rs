//! The NT object handle table (§4.8): the second of the two `HandleTable` instances this
//! emulator keeps — the first being `user::window::WindowManager`'s, for `HWND`s. NT and USER
//! handles are disjoint namespaces on real Windows too, so they get disjoint tables here rather
//! than one tagged union.

use crate::handle::{Handle, HandleTable};
use std::path::PathBuf;

/// A live NT object. Only the fields the specified scenarios' syscalls actually read are
/// modeled; richer object state (security descriptors, access masks, real registry persistence)
/// is out of scope (§1 non-goals).
pub enum NtObject {
 File {
 path: PathBuf,
 file: std::fs::File,
 writable: bool,
 },
 Event {
 signaled: bool,
 manual_reset: bool,
 },
 /// No registry persistence (§1 non-goal): a key is an in-process-memory name with no values
 /// that survive past this run, just enough for a guest that opens/creates/closes keys
 /// without crashing when nothing is actually backed by a hive.
 Key {
 path: String,
 },
 Section {
 size: u32,
 },
}

impl NtObject {
 pub fn is_event(&self) -> bool {
 matches!(self, NtObject::Event { .. })
 }

 pub fn is_file(&self) -> bool {
 matches!(self, NtObject::File { .. })
 }
}

/// Owns every live NT object for one process.
#[derive(Default)]
pub struct NtObjectTable {
 handles: HandleTable<NtObject>,
}

impl NtObjectTable {
 pub fn new() -> Self {
 Self::default()
 }

 pub fn insert(&mut self, object: NtObject) -> Handle {
 self.handles.alloc(object)
 }

 pub fn get(&self, handle: Handle) -> Option<&NtObject> {
 self.handles.get(handle).ok()
 }

 pub fn get_mut(&mut self, handle: Handle) -> Option<&mut NtObject> {
 self.handles.get_mut(handle).ok()
 }

 pub fn close(&mut self, handle: Handle) -> bool {
 self.handles.free(handle).is_ok()
 }
}

#[cfg(test)]
mod tests {
 use super::*;

 #[test]
 fn insert_then_close_invalidates_the_handle() {
 let mut table = NtObjectTable::new();
 let h = table.insert(NtObject::Event { signaled: false, manual_reset: true });
 assert!(table.get(h).is_some());
 assert!(table.close(h));
 assert!(table.get(h).is_none());
 }

 #[test]
 fn double_close_is_rejected() {
 let mut table = NtObjectTable::new();
 let h = table.insert(NtObject::Key { path: "HKCU\\Foo".into() });
 assert!(table.close(h));
 assert!(!table.close(h));
 }
}
