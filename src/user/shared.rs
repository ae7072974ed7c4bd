//! The synthesised `SERVERINFO`/`SHAREDINFO` block (§1, §4.11): a small read-only region user32
//! normally maps shared with `win32k.sys` to avoid a syscall for system metrics and colors. This
//! emulator has no real win32k, so it fabricates a block with plausible defaults once at boot.

use crate::mem::PhysMem;
use crate::paging::{PagingContext, PteFlags};

/// `SM_*` system metric indices this emulator actually answers (§1); the rest of
/// `aiSysMet[WBOX_SM_CMETRICS]` stays zeroed, matching an unconfigured metric.
pub mod sm {
    pub const CXSCREEN: usize = 0;
    pub const CYSCREEN: usize = 1;
    pub const CXVSCROLL: usize = 2;
    pub const CYHSCROLL: usize = 3;
    pub const CYCAPTION: usize = 4;
    pub const CXBORDER: usize = 5;
    pub const CYBORDER: usize = 6;
    pub const CXFIXEDFRAME: usize = 7;
    pub const CYFIXEDFRAME: usize = 8;
    pub const CMETRICS: usize = 97;
}

/// `COLOR_*` system color indices (§1).
pub mod color {
    pub const SCROLLBAR: usize = 0;
    pub const BACKGROUND: usize = 1;
    pub const WINDOW: usize = 5;
    pub const WINDOWTEXT: usize = 8;
    pub const BTNFACE: usize = 15;
    pub const BTNTEXT: usize = 18;
    pub const NUM_SYSCOLORS: usize = 31;
}

const SERVERINFO_SIZE: u32 = 4 + 4 + (sm::CMETRICS as u32) * 4 + (color::NUM_SYSCOLORS as u32) * 4 * 2;

/// Writes and owns the `SERVERINFO` block at a fixed guest VA. Unlike [`super::desktop_heap`],
/// this region is written once at boot and then effectively read-only from the guest's point of
/// view, so there is no allocator here: only field offsets and a one-shot `init`.
pub struct ServerInfo {
    base_va: u32,
    base_phys: u32,
}

mod offset {
    pub const DW_SRVI_FLAGS: u32 = 0x00;
    pub const C_HANDLE_ENTRIES: u32 = 0x04;
    pub const AI_SYS_MET: u32 = 0x08;
    pub fn argb_system(cmetrics: u32) -> u32 {
        AI_SYS_MET + cmetrics * 4
    }
    pub fn ahbr_system(cmetrics: u32, num_syscolors: u32) -> u32 {
        argb_system(cmetrics) + num_syscolors * 4
    }
}

impl ServerInfo {
    /// Maps and zero-fills the `SERVERINFO` region at `base_va`, then fills in a minimal but
    /// self-consistent set of system metrics and colors (§1's "synthesised SERVERINFO").
    pub fn new(mem: &mut PhysMem, paging: &mut PagingContext, base_va: u32, max_handles: u32) -> Self {
        let base_phys = paging.alloc_phys(mem, SERVERINFO_SIZE);
        paging
            .map_range(mem, base_va, base_phys, SERVERINFO_SIZE, PteFlags::PRESENT | PteFlags::USER)
            .expect("SERVERINFO region must map cleanly at boot");

        let info = Self { base_va, base_phys };
        info.write_metric(mem, sm::CXSCREEN, 1024);
        info.write_metric(mem, sm::CYSCREEN, 768);
        info.write_metric(mem, sm::CXVSCROLL, 17);
        info.write_metric(mem, sm::CYHSCROLL, 17);
        info.write_metric(mem, sm::CYCAPTION, 19);
        info.write_metric(mem, sm::CXBORDER, 1);
        info.write_metric(mem, sm::CYBORDER, 1);
        info.write_metric(mem, sm::CXFIXEDFRAME, 3);
        info.write_metric(mem, sm::CYFIXEDFRAME, 3);

        info.write_color(mem, color::WINDOW, 0x00FF_FFFF);
        info.write_color(mem, color::WINDOWTEXT, 0x0000_0000);
        info.write_color(mem, color::BTNFACE, 0x00C0_C0C0);
        info.write_color(mem, color::BTNTEXT, 0x0000_0000);
        info.write_color(mem, color::BACKGROUND, 0x0080_0000);

        mem.write32(base_phys + offset::C_HANDLE_ENTRIES, max_handles);
        info
    }

    pub fn base_va(&self) -> u32 {
        self.base_va
    }

    fn write_metric(&self, mem: &mut PhysMem, index: usize, value: i32) {
        mem.write32(self.base_phys + offset::AI_SYS_MET + index as u32 * 4, value as u32);
    }

    pub fn get_metric(&self, mem: &PhysMem, index: usize) -> i32 {
        mem.read32(self.base_phys + offset::AI_SYS_MET + index as u32 * 4) as i32
    }

    fn write_color(&self, mem: &mut PhysMem, index: usize, argb: u32) {
        mem.write32(self.base_phys + offset::argb_system(sm::CMETRICS as u32) + index as u32 * 4, argb);
    }

    pub fn get_color(&self, mem: &PhysMem, index: usize) -> u32 {
        mem.read32(self.base_phys + offset::argb_system(sm::CMETRICS as u32) + index as u32 * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_screen_metrics_are_plausible() {
        let mut mem = PhysMem::new(2 * 1024 * 1024);
        let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x200000)).unwrap();
        let info = ServerInfo::new(&mut mem, &mut paging, 0x7F02_0000, 4096);
        assert_eq!(info.get_metric(&mem, sm::CXSCREEN), 1024);
        assert_eq!(info.get_metric(&mem, sm::CYSCREEN), 768);
    }

    #[test]
    fn window_background_color_is_white() {
        let mut mem = PhysMem::new(2 * 1024 * 1024);
        let mut paging = PagingContext::new(&mut mem, (0x1000, 0x10000), (0x10000, 0x200000)).unwrap();
        let info = ServerInfo::new(&mut mem, &mut paging, 0x7F02_0000, 4096);
        assert_eq!(info.get_color(&mem, color::WINDOW), 0x00FF_FFFF);
    }
}
