use pnet::util::MacAddr;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::config::{Ipv4Range, Ipv6Range, MacRange};
use crate::error::Error;

/// Galois feedback masks for maximal-period LFSRs, indexed by register
/// width minus one. Each mask encodes a primitive polynomial (Xilinx
/// XAPP 052 tap table), so a width-w register visits every non-zero
/// w-bit value exactly once per cycle.
const LFSR_MASKS: [u64; 64] = [
    0x1,
    0x3,
    0x6,
    0xC,
    0x14,
    0x30,
    0x60,
    0xB8,
    0x110,
    0x240,
    0x500,
    0x829,
    0x100D,
    0x2015,
    0x6000,
    0xD008,
    0x12000,
    0x20400,
    0x40023,
    0x90000,
    0x140000,
    0x300000,
    0x420000,
    0xE10000,
    0x1200000,
    0x2000023,
    0x4000013,
    0x9000000,
    0x14000000,
    0x20000029,
    0x48000000,
    0x80200003,
    0x100080000,
    0x204000003,
    0x500000000,
    0x801000000,
    0x100000001E,
    0x2000000031,
    0x4400000000,
    0xA000140000,
    0x12000000000,
    0x300000C0000,
    0x63000000000,
    0xC0000030000,
    0x1B0000000000,
    0x300003000000,
    0x420000000000,
    0xC00000180000,
    0x1008000000000,
    0x3000000C00000,
    0x6000C00000000,
    0x9000000000000,
    0x18003000000000,
    0x30000000030000,
    0x40000040000000,
    0xC0000600000000,
    0x102000000000000,
    0x200004000000000,
    0x600003000000000,
    0xC00000000000000,
    0x1800300000000000,
    0x3000000000000030,
    0x6000000000000000,
    0xD800000000000000,
];

/// A maximal-period pseudorandom sequence over `[0, 2^width)`. Emits the
/// all-zero offset once, then every non-zero offset exactly once, so the
/// full range is covered with no repeat before exhaustion.
#[derive(Debug, Clone)]
struct Lfsr {
    width: u8,
    mask: u64,
    state: u64,
    emitted: u128,
    capacity: u128,
}

impl Lfsr {
    /// `seed` selects the starting point in the cycle; any seed yields the
    /// same set of offsets, in a rotated order.
    fn new(width: u8, seed: u64) -> Self {
        debug_assert!(width <= 64);
        let capacity = 1u128 << width;
        let (mask, state) = if width == 0 {
            (0, 0)
        } else {
            let period = capacity - 1;
            let state = (u128::from(seed) % period) as u64 + 1;
            (LFSR_MASKS[usize::from(width) - 1], state)
        };
        Lfsr {
            width,
            mask,
            state,
            emitted: 0,
            capacity,
        }
    }

    fn next_offset(&mut self) -> Option<u64> {
        if self.emitted == self.capacity {
            return None;
        }
        self.emitted += 1;
        if self.emitted == 1 {
            return Some(0);
        }
        let out = self.state;
        let lsb = self.state & 1;
        self.state >>= 1;
        if lsb == 1 {
            self.state ^= self.mask;
        }
        Some(out)
    }

    fn capacity(&self) -> u128 {
        self.capacity
    }

    fn remaining(&self) -> u128 {
        self.capacity - self.emitted
    }
}

/// Collision-free MAC addresses inside a configured prefix.
#[derive(Debug, Clone)]
pub struct MacGenerator {
    range: MacRange,
    lfsr: Lfsr,
}

impl MacGenerator {
    pub fn new(range: MacRange, seed: u64) -> Self {
        MacGenerator {
            range,
            lfsr: Lfsr::new(range.free_bits(), seed),
        }
    }

    pub fn next(&mut self) -> Result<MacAddr, Error> {
        let offset = self.lfsr.next_offset().ok_or(Error::AddressSpaceExhausted {
            kind: "MAC",
            range: format!("{}/{}", mac_from_u64(self.range.base), self.range.prefix_len),
            capacity: self.lfsr.capacity() as u64,
        })?;
        Ok(mac_from_u64(self.range.base | offset))
    }

    pub fn remaining(&self) -> u128 {
        self.lfsr.remaining()
    }
}

/// Collision-free IPv4 addresses inside a configured prefix.
#[derive(Debug, Clone)]
pub struct Ipv4Generator {
    range: Ipv4Range,
    lfsr: Lfsr,
}

impl Ipv4Generator {
    pub fn new(range: Ipv4Range, seed: u64) -> Self {
        Ipv4Generator {
            range,
            lfsr: Lfsr::new(range.free_bits(), seed),
        }
    }

    pub fn next(&mut self) -> Result<Ipv4Addr, Error> {
        let offset = self.lfsr.next_offset().ok_or(Error::AddressSpaceExhausted {
            kind: "IPv4",
            range: format!("{}/{}", self.range.base, self.range.prefix_len),
            capacity: self.lfsr.capacity() as u64,
        })?;
        Ok(Ipv4Addr::from(u32::from(self.range.base) | offset as u32))
    }

    pub fn remaining(&self) -> u128 {
        self.lfsr.remaining()
    }
}

/// Collision-free IPv6 addresses inside a configured prefix. The host part
/// is at most 64 bits wide (enforced by configuration validation).
#[derive(Debug, Clone)]
pub struct Ipv6Generator {
    range: Ipv6Range,
    lfsr: Lfsr,
}

impl Ipv6Generator {
    pub fn new(range: Ipv6Range, seed: u64) -> Self {
        Ipv6Generator {
            range,
            lfsr: Lfsr::new(range.free_bits(), seed),
        }
    }

    pub fn next(&mut self) -> Result<Ipv6Addr, Error> {
        let offset = self.lfsr.next_offset().ok_or(Error::AddressSpaceExhausted {
            kind: "IPv6",
            range: format!("{}/{}", self.range.base, self.range.prefix_len),
            capacity: u64::MAX,
        })?;
        Ok(Ipv6Addr::from(
            u128::from(self.range.base) | u128::from(offset),
        ))
    }

    pub fn remaining(&self) -> u128 {
        self.lfsr.remaining()
    }
}

fn mac_from_u64(v: u64) -> MacAddr {
    MacAddr::new(
        (v >> 40) as u8,
        (v >> 32) as u8,
        (v >> 24) as u8,
        (v >> 16) as u8,
        (v >> 8) as u8,
        v as u8,
    )
}
