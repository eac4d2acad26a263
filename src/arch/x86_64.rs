/*
 * x86_64 Critical-Section Support
 *
 * The interrupt-mask half of the CPU port for bare-metal x86_64 targets:
 * enter saves the IF flag and executes cli, leave restores what was saved.
 * Context switching is board- and boot-protocol-specific, so the embedder
 * passes its own switch hooks in and gets a complete hook table back.
 */

use crate::port::CpuPort;

fn enter_critical() -> u32 {
    let enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    enabled as u32
}

fn leave_critical(mask: u32) {
    if mask != 0 {
        x86_64::instructions::interrupts::enable();
    }
}

/// Build a port hook table around this target's interrupt masking.
pub fn port(switch_context: fn(), load_root_thread: fn()) -> CpuPort {
    CpuPort {
        enter_critical,
        leave_critical,
        switch_context,
        load_root_thread,
    }
}
