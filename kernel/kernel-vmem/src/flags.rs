//! # Mapping Permission Flags

use crate::PageTableEntry;

bitflags::bitflags! {
    /// Permission flags of the public memory API.
    ///
    /// The numeric values are part of the export contract with the
    /// monolithic layer (`Read=1, Write=2, Exec=4, User=8`).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        const USER = 8;
    }
}

impl VmFlags {
    /// Flag set applied to kernel-internal allocations: writable data,
    /// supervisor only, no instruction fetch.
    pub const KERNEL_DATA: Self = Self::READ.union(Self::WRITE);

    /// Translate to leaf page-table entry bits:
    /// `Read → Present`, `Write → Writable`, `User → User`, `!Exec → NX`.
    #[must_use]
    pub fn to_leaf_entry(self) -> PageTableEntry {
        PageTableEntry::new()
            .with_present(self.contains(Self::READ))
            .with_writable(self.contains(Self::WRITE))
            .with_user(self.contains(Self::USER))
            .with_no_execute(!self.contains(Self::EXEC))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contract_values() {
        assert_eq!(VmFlags::READ.bits(), 1);
        assert_eq!(VmFlags::WRITE.bits(), 2);
        assert_eq!(VmFlags::EXEC.bits(), 4);
        assert_eq!(VmFlags::USER.bits(), 8);
    }

    #[test]
    fn leaf_translation() {
        let e = (VmFlags::READ | VmFlags::WRITE).to_leaf_entry();
        assert!(e.present() && e.writable() && !e.user() && e.no_execute());

        let e = (VmFlags::READ | VmFlags::EXEC | VmFlags::USER).to_leaf_entry();
        assert!(e.present() && !e.writable() && e.user() && !e.no_execute());
    }
}
