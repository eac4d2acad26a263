/*
 * Architecture Support
 *
 * Reference pieces of the CPU port for targets this crate knows about.
 * A board port is free to ignore these and supply its own hook table.
 */

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
