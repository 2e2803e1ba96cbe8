//! Physical memory layout
//!
//! qemu -machine virt is set up like this,
//! based on qemu's hw/riscv/virt.c:
//!
//! 00001000 -- boot ROM, provided by qemu
//! 02000000 -- CLINT
//! 0C000000 -- PLIC
//! 10000000 -- uart0
//! 10001000 -- virtio disk
//! 80000000 -- boot ROM jumps here in machine mode
//!             -kernel loads the kernel here
//!
//! the kernel uses physical memory thus:
//! 80000000 -- kernel text and data
//! end -- start of kernel page allocation area
//! PHYSTOP -- end RAM used by the kernel

use crate::vm::{MAXVA, PGSIZE};

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

/// virtio mmio interface
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

/// core local interruptor (CLINT), which contains the timer.
pub const CLINT: usize = 0x200_0000;

/// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0xc00_0000;

pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}

pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x201000 + hart * 0x2000
}

pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x201004 + hart * 0x2000
}

/// The kernel expects there to be RAM for use by the kernel and user pages
/// from physical address KERNBASE to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Map the trampoline page to the highest address, in both user and kernel
/// space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// User memory layout.
/// Address zero first:
///   text
///   original data and bss
///   expandable heap
///   ...
///   shared-memory mappings (SHAREDMEM_BASE)
///   ...
///   TRAPFRAME (p->trap_frame, used by the trampoline)
///   TRAMPOLINE (the same page as in the kernel)
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Named shared-memory segments are mapped upward from here.
pub const SHAREDMEM_BASE: usize = 0x30_0000_0000;

/// Map kernel stacks beneath the trampoline,
/// each surrounded by invalid guard pages.
pub const fn kstack(p: usize) -> usize {
    TRAMPOLINE - (p + 1) * 2 * PGSIZE
}
