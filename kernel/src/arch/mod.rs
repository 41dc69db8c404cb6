//! Machine access layer.
//!
//! Everything the kernel needs from the machine goes through this module:
//! port I/O, the paging control registers, the console, and the CPU
//! hand-off to another thread. On bare metal (`target_arch = "x86"`) these
//! are the real instructions; everywhere else they hit a hosted machine
//! model (`sim`) with simulated registers, a port bus with an ATA device
//! behind it, and a dispatch log, so the kernel can be exercised as an
//! ordinary library.

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use x86::*;

#[cfg(not(target_arch = "x86"))]
pub mod sim;
#[cfg(not(target_arch = "x86"))]
pub use sim::{
    console_write, inb, inw, outb, outw, read_cr0, read_cr2, read_cr3, switch_to, write_cr0,
    write_cr3,
};
