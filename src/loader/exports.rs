//! Export directory parsing and lookup (§4.4).

use crate::error::LoaderError;
use crate::pe::{PeImage, DIR_EXPORT};
use log::info;

const EXPORT_DIRECTORY_SIZE: usize = 40;

/// A single slot of a module's export address table.
#[derive(Clone, Debug, Default)]
pub struct ExportEntry {
    pub ordinal: u16,
    pub rva: u32,
    pub name: Option<String>,
    pub forwarder: Option<String>,
}

impl ExportEntry {
    pub fn is_forwarder(&self) -> bool {
        self.forwarder.is_some()
    }
}

/// The result of a successful or unsuccessful export lookup.
pub enum ExportLookup<'a> {
    NotFound,
    Forwarder(&'a str),
    Resolved { rva: u32 },
}

/// A parsed export directory: one entry per EAT slot, plus name/ordinal indices.
#[derive(Default)]
pub struct ExportTable {
    entries: Vec<ExportEntry>,
    ordinal_base: u32,
}

impl ExportTable {
    /// Parses the export directory reached through data-directory index 0. A module with no
    /// export directory (e.g. most executables) yields an empty table, which is not an error.
    pub fn parse(pe: &PeImage) -> Result<Self, LoaderError> {
        let dir = pe.data_dir(DIR_EXPORT);
        if dir.virtual_address == 0 {
            return Ok(Self::default());
        }

        let hdr = pe.read_at_rva(dir.virtual_address, EXPORT_DIRECTORY_SIZE);
        if hdr.len() < EXPORT_DIRECTORY_SIZE {
            return Ok(Self::default());
        }

        let u32_at = |off: usize| u32::from_le_bytes([hdr[off], hdr[off + 1], hdr[off + 2], hdr[off + 3]]);

        let name_rva = u32_at(12);
        let ordinal_base = u32_at(16);
        let number_of_functions = u32_at(20);
        let number_of_names = u32_at(24);
        let address_of_functions = u32_at(28);
        let address_of_names = u32_at(32);
        let address_of_name_ordinals = u32_at(36);

        if number_of_functions == 0 {
            return Ok(Self::default());
        }

        let dir_start = dir.virtual_address;
        let dir_end = dir.virtual_address + dir.size;

        let mut entries = Vec::with_capacity(number_of_functions as usize);
        for i in 0..number_of_functions {
            let func_rva_bytes = pe.read_at_rva(address_of_functions + i * 4, 4);
            let rva = if func_rva_bytes.len() == 4 {
                u32::from_le_bytes([func_rva_bytes[0], func_rva_bytes[1], func_rva_bytes[2], func_rva_bytes[3]])
            } else {
                0
            };

            let forwarder = if rva != 0 && rva >= dir_start && rva < dir_end {
                Some(pe.read_cstr_at_rva(rva))
            } else {
                None
            };

            entries.push(ExportEntry {
                ordinal: (ordinal_base + i) as u16,
                rva,
                name: None,
                forwarder,
            });
        }

        if address_of_names != 0 && address_of_name_ordinals != 0 {
            for i in 0..number_of_names {
                let name_ptr_bytes = pe.read_at_rva(address_of_names + i * 4, 4);
                let ord_bytes = pe.read_at_rva(address_of_name_ordinals + i * 2, 2);
                if name_ptr_bytes.len() != 4 || ord_bytes.len() != 2 {
                    continue;
                }
                let name_rva_entry =
                    u32::from_le_bytes([name_ptr_bytes[0], name_ptr_bytes[1], name_ptr_bytes[2], name_ptr_bytes[3]]);
                let ordinal_index = u16::from_le_bytes([ord_bytes[0], ord_bytes[1]]) as usize;
                if let Some(entry) = entries.get_mut(ordinal_index) {
                    entry.name = Some(pe.read_cstr_at_rva(name_rva_entry));
                }
            }
        }

        let dll_name = if name_rva != 0 { pe.read_cstr_at_rva(name_rva) } else { "unknown".to_string() };
        info!(
            "parsed exports for {}: {} functions, {} named, ordinal base {}",
            dll_name, number_of_functions, number_of_names, ordinal_base
        );

        Ok(Self { entries, ordinal_base })
    }

    pub fn lookup_by_name(&self, name: &str) -> ExportLookup<'_> {
        match self.entries.iter().find(|e| e.name.as_deref() == Some(name)) {
            Some(e) if e.is_forwarder() => ExportLookup::Forwarder(e.forwarder.as_deref().unwrap()),
            Some(e) => ExportLookup::Resolved { rva: e.rva },
            None => ExportLookup::NotFound,
        }
    }

    /// `ordinal` is the absolute ordinal (i.e. already includes the export directory's base);
    /// rejects out-of-range ordinals and zero-RVA (unused) slots.
    pub fn lookup_by_ordinal(&self, ordinal: u32) -> ExportLookup<'_> {
        if ordinal < self.ordinal_base {
            return ExportLookup::NotFound;
        }
        let index = (ordinal - self.ordinal_base) as usize;
        match self.entries.get(index) {
            Some(e) if e.rva == 0 => ExportLookup::NotFound,
            Some(e) if e.is_forwarder() => ExportLookup::Forwarder(e.forwarder.as_deref().unwrap()),
            Some(e) => ExportLookup::Resolved { rva: e.rva },
            None => ExportLookup::NotFound,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_reports_not_found() {
        let table = ExportTable::default();
        assert!(matches!(table.lookup_by_name("Foo"), ExportLookup::NotFound));
        assert!(matches!(table.lookup_by_ordinal(1), ExportLookup::NotFound));
    }
}
