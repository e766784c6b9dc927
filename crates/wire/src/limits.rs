// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payload and queue bounds shared by both executables.

/// Hard cap on a serialized inventory frame. Oversize inventories are
/// rejected with `error{code=invalid_message}`; the transport stays open.
pub const MAX_INVENTORY_BYTES: usize = 1024 * 1024;

/// Raw-byte cap per terminal output chunk. Base64 expands 4/3, so 48 KiB
/// raw keeps the framed payload under the 64 KiB wire limit.
pub const MAX_TERMINAL_RAW_CHUNK: usize = 48 * 1024;

/// Bound on each transport's write queue, in frames. Overflow closes the
/// transport with reason `backpressure`.
pub const WRITE_QUEUE_FRAMES: usize = 64;

/// Split a raw byte payload into terminal-frame-sized chunks.
pub fn terminal_chunks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(MAX_TERMINAL_RAW_CHUNK)
}
