//! Window class registration (§4.11): `RegisterClassExW`/`UnregisterClass` and the small atom
//! table behind them, plus the fixed set of system classes user32 normally registers from its
//! `ClientThreadSetup`.

use crate::error::{LoaderError, LoaderResult};
use crate::mem::PhysMem;
use crate::user::desktop_heap::{cls_offset, DesktopHeap};
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// `CS_*` window class styles (§4.11).
    pub struct ClassStyle: u32 {
        const VREDRAW         = 0x0001;
        const HREDRAW         = 0x0002;
        const DBLCLKS         = 0x0008;
        const OWNDC           = 0x0020;
        const CLASSDC         = 0x0040;
        const PARENTDC        = 0x0080;
        const NOCLOSE         = 0x0200;
        const SAVEBITS        = 0x0800;
        const BYTEALIGNCLIENT = 0x1000;
        const BYTEALIGNWINDOW = 0x2000;
        const GLOBALCLASS     = 0x4000;
        const IME             = 0x00010000;
        const DROPSHADOW      = 0x00020000;
    }
}

bitflags! {
    /// Internal `CSF_*` flags, not guest-visible style bits but tracked alongside the class.
    pub struct ClassFlags: u32 {
        const ANSIPROC    = 0x0001;
        const SYSTEMCLASS = 0x0080;
        const SERVERSIDEPROC = 0x0008;
        const VERSIONCLASS  = 0x8000;
    }
}

/// Function IDs assigned to the small set of system classes this emulator actually instantiates
/// (§4.11, SUPPLEMENTED DETAIL); the unused `FNID_*`/`ICLS_*` entries below are kept as named
/// constants for a faithful table even though only a subset of classes is ever registered.
pub mod fnid {
    pub const FIRST: u16 = 0x029A;
    pub const BUTTON: u16 = 0x029A;
    pub const COMBOBOX: u16 = 0x029B;
    pub const LISTBOX: u16 = 0x029C;
    pub const MDICLIENT: u16 = 0x029D;
    pub const SCROLLBAR: u16 = 0x02A3;
    pub const STATIC: u16 = 0x02A4;
    pub const EDIT: u16 = 0x029E;
    pub const DIALOG: u16 = 0x02A6;
    pub const DESKTOP: u16 = 0x02A7;
    pub const LAST: u16 = 0x02B8;
}

/// Indices into the system class table (§4.11); only [`SystemClassIndex::Button`],
/// [`SystemClassIndex::Edit`], [`SystemClassIndex::Static`] and [`SystemClassIndex::Dialog`] are
/// ever actually registered by [`ClassManager::register_system_classes`] — the rest name slots a
/// full user32 would fill with IME/DDEML plumbing this emulator has no use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum SystemClassIndex {
    Button = 0,
    Edit = 1,
    Static = 2,
    ListBox = 3,
    ScrollBar = 4,
    ComboBox = 5,
    ComboListBox = 6,
    DDEMgr = 7,
    Desktop = 8,
    Dialog = 9,
    MenuClass = 10,
    MDIClient = 11,
    IconTitle = 12,
    Switch = 13,
    Tooltips = 14,
    MaxCount = 17,
}

/// First class atom handed out by [`ClassManager::register`] (§4.11).
const FIRST_CLASS_ATOM: u16 = 0xC000;

/// A registered window class, mirrored into a guest-visible `CLS` shadow on the desktop heap.
pub struct Class {
    pub atom: u16,
    pub name: String,
    pub style: ClassStyle,
    pub flags: ClassFlags,
    pub wnd_proc: u32,
    pub cls_extra: u16,
    pub wnd_extra: u16,
    pub h_instance: u32,
    pub h_icon: u32,
    pub h_cursor: u32,
    pub h_background: u32,
    pub fnid: u16,
    pub ref_count: u32,
    pub shadow_va: u32,
}

/// Owns the atom table and the guest `CLS` shadows backing it.
pub struct ClassManager {
    classes: Vec<Class>,
    by_name: HashMap<String, usize>,
    by_atom: HashMap<u16, usize>,
    next_atom: u16,
}

impl ClassManager {
    pub fn new() -> Self {
        Self { classes: Vec::new(), by_name: HashMap::new(), by_atom: HashMap::new(), next_atom: FIRST_CLASS_ATOM }
    }

    pub fn find(&self, name: &str) -> Option<&Class> {
        self.by_name.get(&name.to_uppercase()).map(|&i| &self.classes[i])
    }

    pub fn find_by_atom(&self, atom: u16) -> Option<&Class> {
        self.by_atom.get(&atom).map(|&i| &self.classes[i])
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_uppercase())
    }

    /// Registers a new window class. Returns its atom. Re-registering an existing name is an
    /// error the way `RegisterClassExW` reports `ERROR_CLASS_ALREADY_EXISTS` (§4.11).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        mem: &mut PhysMem,
        heap: &mut DesktopHeap,
        name: &str,
        style: ClassStyle,
        wnd_proc: u32,
        cls_extra: u16,
        wnd_extra: u16,
        h_instance: u32,
        h_icon: u32,
        h_cursor: u32,
        h_background: u32,
    ) -> LoaderResult<u16> {
        let key = name.to_uppercase();
        if self.by_name.contains_key(&key) {
            return Err(LoaderError::DllNotFound(format!("class '{}' already registered", name)));
        }

        let atom = self.next_atom;
        self.next_atom = self.next_atom.wrapping_add(1);

        let shadow_va = heap.alloc(mem, cls_offset::SIZE);
        let class = Class {
            atom,
            name: name.to_string(),
            style,
            flags: ClassFlags::empty(),
            wnd_proc,
            cls_extra,
            wnd_extra,
            h_instance,
            h_icon,
            h_cursor,
            h_background,
            fnid: 0,
            ref_count: 0,
            shadow_va,
        };
        self.write_shadow(mem, heap, &class);

        let index = self.classes.len();
        self.by_name.insert(key, index);
        self.by_atom.insert(atom, index);
        self.classes.push(class);
        Ok(atom)
    }

    /// Registers the handful of system classes this emulator instantiates at boot, mirroring
    /// user32's `RegisterControlClasses` bootstrap path (§4.11). `default_wnd_proc` is the
    /// emulator-synthesised default procedure shared by every system class (there is no real
    /// comctl32 loaded).
    pub fn register_system_classes(&mut self, mem: &mut PhysMem, heap: &mut DesktopHeap, default_wnd_proc: u32, h_instance: u32) -> LoaderResult<()> {
        let system = [("Button", fnid::BUTTON), ("Edit", fnid::EDIT), ("Static", fnid::STATIC), ("#32770", fnid::DIALOG)];
        for (name, fnid) in system {
            let atom = self.register(mem, heap, name, ClassStyle::empty(), default_wnd_proc, 0, 0, h_instance, 0, 0, 0)?;
            if let Some(&index) = self.by_atom.get(&atom) {
                self.classes[index].flags |= ClassFlags::SYSTEMCLASS;
                self.classes[index].fnid = fnid;
                self.write_shadow(mem, heap, &self.classes[index]);
            }
        }
        Ok(())
    }

    pub fn add_ref(&mut self, atom: u16) {
        if let Some(&index) = self.by_atom.get(&atom) {
            self.classes[index].ref_count += 1;
        }
    }

    pub fn release(&mut self, atom: u16) {
        if let Some(&index) = self.by_atom.get(&atom) {
            self.classes[index].ref_count = self.classes[index].ref_count.saturating_sub(1);
        }
    }

    /// Unregisters a class. Fails like `UnregisterClass` does if a window still references it.
    pub fn unregister(&mut self, name: &str) -> LoaderResult<()> {
        let key = name.to_uppercase();
        let index = *self.by_name.get(&key).ok_or_else(|| LoaderError::DllNotFound(format!("class '{}' not found", name)))?;
        if self.classes[index].ref_count > 0 {
            return Err(LoaderError::DllNotFound(format!("class '{}' still has live windows", name)));
        }
        let atom = self.classes[index].atom;
        self.by_name.remove(&key);
        self.by_atom.remove(&atom);
        Ok(())
    }

    fn write_shadow(&self, mem: &mut PhysMem, heap: &mut DesktopHeap, class: &Class) {
        if class.shadow_va == 0 {
            return;
        }
        heap.write16(mem, class.shadow_va + cls_offset::ATOMCLASSNAME, class.atom);
        heap.write32(mem, class.shadow_va + cls_offset::STYLE, class.style.bits());
        heap.write32(mem, class.shadow_va + cls_offset::LPFNWNDPROC, class.wnd_proc);
        heap.write32(mem, class.shadow_va + cls_offset::CBCLSEXTRA, class.cls_extra as u32);
        heap.write32(mem, class.shadow_va + cls_offset::CBWNDEXTRA, class.wnd_extra as u32);
        heap.write32(mem, class.shadow_va + cls_offset::HMODULE, class.h_instance);
        heap.write32(mem, class.shadow_va + cls_offset::HICON, class.h_icon);
        heap.write32(mem, class.shadow_va + cls_offset::HCURSOR, class.h_cursor);
        heap.write32(mem, class.shadow_va + cls_offset::HBRBACKGROUND, class.h_background);
        heap.write32(mem, class.shadow_va + cls_offset::FNID, class.fnid as u32);
        heap.write32(mem, class.shadow_va + cls_offset::CSF_FLAGS, class.flags.bits());
        heap.write32(mem, class.shadow_va + cls_offset::CWNDREFERENCECOUNT, class.ref_count);
    }
}

impl Default for ClassManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PagingContext;

    fn setup() -> (PhysMem, DesktopHeap, ClassManager) {
        let mut mem = PhysMem::new(4 * 1024 * 1024);
        let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x200000)).unwrap();
        let heap = DesktopHeap::new(&mut mem, &mut paging, 0x0100_0000, 0x4000).unwrap();
        (mem, heap, ClassManager::new())
    }

    #[test]
    fn first_registered_class_gets_atom_0xc000() {
        let (mut mem, mut heap, mut classes) = setup();
        let atom = classes.register(&mut mem, &mut heap, "MyWindowClass", ClassStyle::HREDRAW, 0x1000, 0, 0, 0, 0, 0, 0).unwrap();
        assert_eq!(atom, 0xC000);
        assert!(classes.is_registered("mywindowclass"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (mut mem, mut heap, mut classes) = setup();
        classes.register(&mut mem, &mut heap, "Dup", ClassStyle::empty(), 0, 0, 0, 0, 0, 0, 0).unwrap();
        let err = classes.register(&mut mem, &mut heap, "Dup", ClassStyle::empty(), 0, 0, 0, 0, 0, 0, 0);
        assert!(err.is_err());
    }

    #[test]
    fn unregister_fails_while_windows_reference_the_class() {
        let (mut mem, mut heap, mut classes) = setup();
        let atom = classes.register(&mut mem, &mut heap, "Ref", ClassStyle::empty(), 0, 0, 0, 0, 0, 0, 0).unwrap();
        classes.add_ref(atom);
        assert!(classes.unregister("Ref").is_err());
        classes.release(atom);
        assert!(classes.unregister("Ref").is_ok());
    }

    #[test]
    fn system_classes_register_with_expected_fnids() {
        let (mut mem, mut heap, mut classes) = setup();
        classes.register_system_classes(&mut mem, &mut heap, 0x2000, 0).unwrap();
        assert_eq!(classes.find("Button").unwrap().fnid, fnid::BUTTON);
        assert_eq!(classes.find("Edit").unwrap().fnid, fnid::EDIT);
    }
}
