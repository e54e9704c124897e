use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use bitflags::bitflags;
use num_utils::{align_down, align_up, is_aligned};

/// Size of the smallest translation granule, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// A physical address, owned by the external physical allocator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(val: usize) -> Self {
        Self(val)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        is_aligned(self.0, PAGE_SIZE)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> PhysAddr {
        PhysAddr(self.0 + rhs)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual address within some address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(val: usize) -> Self {
        Self(val)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn align_down_page(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    pub const fn align_up_page(self) -> Self {
        Self(align_up(self.0, PAGE_SIZE))
    }

    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    pub const fn is_page_aligned(self) -> bool {
        is_aligned(self.0, PAGE_SIZE)
    }

    pub fn checked_add(self, rhs: usize) -> Option<Self> {
        self.0.checked_add(rhs).map(Self)
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: usize) -> VirtAddr {
        VirtAddr(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtAddr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, rhs: VirtAddr) -> usize {
        self.0 - rhs.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Access protection of a mapping, also used for page table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// The access kind that triggered a fault or acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    /// Returns whether an access of this type is permitted under `prot`.
    pub fn allowed_by(self, prot: Protection) -> bool {
        match self {
            AccessType::Read => prot.contains(Protection::READ),
            AccessType::Write => prot.contains(Protection::WRITE),
            AccessType::Execute => prot.contains(Protection::EXECUTE),
        }
    }
}

/// One contiguous run of physical memory handed out by a bundle fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub addr: PhysAddr,
    pub size: usize,
}

impl PhysRange {
    pub const fn new(addr: PhysAddr, size: usize) -> Self {
        Self { addr, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_page_math() {
        let addr = VirtAddr::new(0x1234);
        assert_eq!(addr.align_down_page(), VirtAddr::new(0x1000));
        assert_eq!(addr.align_up_page(), VirtAddr::new(0x2000));
        assert_eq!(addr.page_offset(), 0x234);
        assert!(!addr.is_page_aligned());
        assert!(VirtAddr::new(0x3000).is_page_aligned());
    }

    #[test]
    fn access_type_checks() {
        let rw = Protection::READ | Protection::WRITE;
        assert!(AccessType::Read.allowed_by(rw));
        assert!(AccessType::Write.allowed_by(rw));
        assert!(!AccessType::Execute.allowed_by(rw));
        assert!(!AccessType::Write.allowed_by(Protection::READ));
    }
}
