//! Keyboard packet sink.
//!
//! Keystroke producers (the HID pipeline here; the PS/2 driver elsewhere)
//! emit fixed-size [`BasicKeyPacket`] records into a bounded queue. The
//! in-memory VFS exposes the queue as `/Devices/keyboard`; its reader
//! drains through [`KeyQueue::read_packets`].

use alloc::collections::VecDeque;

use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// Modifier and event flags carried by every packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u16 {
        const KEY_PRESSED = 1 << 0;
        const LEFT_SHIFT  = 1 << 1;
        const RIGHT_SHIFT = 1 << 2;
        const LEFT_CTRL   = 1 << 3;
        const RIGHT_CTRL  = 1 << 4;
        const LEFT_ALT    = 1 << 5;
        const RIGHT_ALT   = 1 << 6;
        const EXTENDED    = 1 << 7;
    }
}

/// One keystroke record: raw scancode, normalized keypoint, flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BasicKeyPacket {
    pub scancode: u16,
    pub keypoint: u16,
    pub flags: u16,
}

impl BasicKeyPacket {
    pub fn new(scancode: u16, keypoint: u16, flags: KeyFlags) -> Self {
        Self {
            scancode,
            keypoint,
            flags: flags.bits(),
        }
    }

    pub fn flags(&self) -> KeyFlags {
        KeyFlags::from_bits_truncate(self.flags)
    }
}

/// Queue depth; producers drop the oldest packet on overflow rather than
/// stalling an ISR-adjacent path.
const QUEUE_DEPTH: usize = 256;

/// Bounded keystroke queue.
pub struct KeyQueue {
    inner: Mutex<VecDeque<BasicKeyPacket>>,
}

impl KeyQueue {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Emit one packet into the stream. Producers run in ISR context;
    /// consumers hold the lock with interrupts off, so this never spins on
    /// an interrupted holder.
    pub fn push_packet(&self, packet: BasicKeyPacket) {
        let mut queue = self.inner.lock();
        if queue.len() >= QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(packet);
    }

    /// Drain up to `out.len()` packets; returns how many were written.
    /// This is the `read` surface the VFS device node wraps.
    pub fn read_packets(&self, out: &mut [BasicKeyPacket]) -> usize {
        crate::interrupts::without_interrupts(|| {
            let mut queue = self.inner.lock();
            let mut written = 0;
            while written < out.len() {
                match queue.pop_front() {
                    Some(packet) => {
                        out[written] = packet;
                        written += 1;
                    }
                    None => break,
                }
            }
            written
        })
    }

    /// Packets currently queued.
    pub fn pending(&self) -> usize {
        crate::interrupts::without_interrupts(|| self.inner.lock().len())
    }
}

impl Default for KeyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The system keyboard stream backing `/Devices/keyboard`.
pub static KEYBOARD: KeyQueue = KeyQueue::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_order() {
        let queue = KeyQueue::new();
        queue.push_packet(BasicKeyPacket::new(1, 10, KeyFlags::KEY_PRESSED));
        queue.push_packet(BasicKeyPacket::new(2, 20, KeyFlags::empty()));
        assert_eq!(queue.pending(), 2);

        let mut out = [BasicKeyPacket::new(0, 0, KeyFlags::empty()); 4];
        let n = queue.read_packets(&mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0].keypoint, 10);
        assert!(out[0].flags().contains(KeyFlags::KEY_PRESSED));
        assert_eq!(out[1].keypoint, 20);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = KeyQueue::new();
        for i in 0..(QUEUE_DEPTH + 3) as u16 {
            queue.push_packet(BasicKeyPacket::new(i, i, KeyFlags::empty()));
        }
        assert_eq!(queue.pending(), QUEUE_DEPTH);
        let mut out = [BasicKeyPacket::new(0, 0, KeyFlags::empty()); 1];
        queue.read_packets(&mut out);
        assert_eq!(out[0].scancode, 3, "oldest three were dropped");
    }
}
