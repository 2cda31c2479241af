//! # CPU Discovery

use crate::SmpError;
use crate::lapic::LAPIC_DEFAULT_BASE;
use kernel_addr::PhysAddr;
use kernel_arch::CpuidResult;
use log::info;

/// Upper bound on tracked CPUs.
pub const MAX_CPUS: usize = 16;

/// CPUID seam; the boot implementation executes the instruction, test
/// doubles return canned leaves.
pub trait CpuIdent {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// CPUID via the real instruction.
pub struct BootCpuid;

impl CpuIdent for BootCpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        kernel_arch::cpuid(leaf, subleaf)
    }
}

/// One tracked processor.
#[derive(Debug, Copy, Clone)]
pub struct CpuInfo {
    /// Logical index, 0-based; the BSP is 0.
    pub id: u32,
    /// Local-APIC id used for directed IPIs.
    pub apic_id: u32,
    pub is_bsp: bool,
    /// Whether the CPU has been brought up.
    pub active: bool,
    /// Physical base of the CPU's local-APIC register window.
    pub lapic_base: PhysAddr,
}

/// The fixed CPU table populated at discovery.
#[derive(Debug)]
pub struct CpuTable {
    cpus: [Option<CpuInfo>; MAX_CPUS],
    count: usize,
}

impl CpuTable {
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&CpuInfo> {
        self.cpus.get(id as usize)?.as_ref()
    }

    #[must_use]
    pub fn bsp(&self) -> &CpuInfo {
        self.cpus[0].as_ref().expect("table always holds the BSP")
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuInfo> {
        self.cpus.iter().flatten()
    }

    /// Record a CPU as brought up (or halted again).
    ///
    /// # Errors
    /// [`SmpError::InvalidCpu`] for ids outside the table.
    pub fn set_active(&mut self, id: u32, active: bool) -> Result<(), SmpError> {
        let cpu = self
            .cpus
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(SmpError::InvalidCpu)?;
        cpu.active = active;
        Ok(())
    }
}

/// Discover the processor topology from CPUID leaf 1.
///
/// EDX bit 9 confirms the local APIC; EBX bits 23..16 give the logical
/// processor count and bits 31..24 the BSP's initial APIC id. Application
/// processors are entered inactive with sequentially assigned APIC ids (no
/// ACPI tables are consulted here).
///
/// # Errors
/// [`SmpError::NoApic`] when leaf 1 reports no local APIC.
pub fn discover<I: CpuIdent>(ident: &I) -> Result<CpuTable, SmpError> {
    let leaf1 = ident.cpuid(1, 0);
    if leaf1.edx & (1 << 9) == 0 {
        return Err(SmpError::NoApic);
    }

    let logical = ((leaf1.ebx >> 16) & 0xFF).clamp(1, MAX_CPUS as u32);
    let bsp_apic_id = leaf1.ebx >> 24;

    let mut cpus = [None; MAX_CPUS];
    let mut next_apic = 0_u32;
    for (id, slot) in cpus.iter_mut().take(logical as usize).enumerate() {
        let apic_id = if id == 0 {
            bsp_apic_id
        } else {
            // Skip over the BSP's id when handing out the rest.
            if next_apic == bsp_apic_id {
                next_apic += 1;
            }
            let assigned = next_apic;
            next_apic += 1;
            assigned
        };
        *slot = Some(CpuInfo {
            id: id as u32,
            apic_id,
            is_bsp: id == 0,
            active: id == 0,
            lapic_base: PhysAddr::new(LAPIC_DEFAULT_BASE),
        });
    }

    info!("smp: {logical} logical CPUs, BSP APIC id {bsp_apic_id}");
    Ok(CpuTable {
        cpus,
        count: logical as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedCpuid {
        edx: u32,
        ebx: u32,
    }

    impl CpuIdent for CannedCpuid {
        fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
            assert_eq!(leaf, 1);
            CpuidResult {
                eax: 0,
                ebx: self.ebx,
                ecx: 0,
                edx: self.edx,
            }
        }
    }

    #[test]
    fn discovers_four_cpus() {
        let ident = CannedCpuid {
            edx: 1 << 9,
            ebx: (2 << 24) | (4 << 16),
        };
        let table = discover(&ident).unwrap();
        assert_eq!(table.count(), 4);
        assert!(table.bsp().is_bsp);
        assert_eq!(table.bsp().apic_id, 2);
        assert!(table.bsp().active);
        // APs are inactive and never collide with the BSP's APIC id.
        for cpu in table.iter().skip(1) {
            assert!(!cpu.active);
            assert_ne!(cpu.apic_id, table.bsp().apic_id);
        }
    }

    #[test]
    fn missing_apic_is_an_error() {
        let ident = CannedCpuid { edx: 0, ebx: 0 };
        assert_eq!(discover(&ident).unwrap_err(), SmpError::NoApic);
    }

    #[test]
    fn zero_count_clamps_to_one() {
        let ident = CannedCpuid {
            edx: 1 << 9,
            ebx: 0,
        };
        let table = discover(&ident).unwrap();
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn set_active_bounds_checked() {
        let ident = CannedCpuid {
            edx: 1 << 9,
            ebx: 2 << 16,
        };
        let mut table = discover(&ident).unwrap();
        table.set_active(1, true).unwrap();
        assert!(table.get(1).unwrap().active);
        assert_eq!(table.set_active(9, true), Err(SmpError::InvalidCpu));
    }
}
