/*
 * Kernel Test Suite
 *
 * Host-side tests driving the kernel through a no-op CPU port. Each test
 * serializes on a process-wide lock and reinitializes the kernel, so the
 * global state never leaks between cases.
 *
 * Blocked-side results are observed the way a resumed thread would observe
 * them: through the (state, error, datum) triple its context carries after
 * the unblock.
 */

pub(crate) mod support;

mod scenarios;
