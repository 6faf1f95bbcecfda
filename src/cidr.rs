//! Range-to-CIDR decomposition.
//!
//! Backends without native range support (ipset hash:net, iptables,
//! firewalld rich rules) receive one entry per CIDR block. The walk is
//! deterministic: the same interval always yields the same blocks, so the
//! delete path can reproduce exactly what the add path installed.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr};

/// Decompose the inclusive IPv4 interval `[from, to]` into the minimal
/// ordered list of aligned CIDR blocks.
///
/// Returns an empty list when `from > to`.
///
/// ```
/// use edgeacl::cidr::range_to_cidrs;
/// use std::net::Ipv4Addr;
///
/// let blocks = range_to_cidrs(
///     u32::from(Ipv4Addr::new(10, 0, 0, 0)),
///     u32::from(Ipv4Addr::new(10, 0, 0, 255)),
/// );
/// assert_eq!(blocks.len(), 1);
/// assert_eq!(blocks[0].to_string(), "10.0.0.0/24");
/// ```
pub fn range_to_cidrs(from: u32, to: u32) -> Vec<Ipv4Net> {
    walk(from, to, 32).0
}

/// Like [`range_to_cidrs`], but blocks with a prefix longer than
/// `max_prefix_len` are skipped.
///
/// Returns the kept blocks and the number of skipped ones. This bounds the
/// number of kernel entries a single range can produce, at the cost of not
/// covering the small fragments at the edges of an unaligned range.
pub fn range_to_cidrs_with_floor(from: u32, to: u32, max_prefix_len: u8) -> (Vec<Ipv4Net>, usize) {
    walk(from, to, max_prefix_len.min(32))
}

fn walk(from: u32, to: u32, max_prefix_len: u8) -> (Vec<Ipv4Net>, usize) {
    let mut blocks = Vec::new();
    let mut skipped = 0usize;
    if from > to {
        return (blocks, skipped);
    }

    // u64 so that advancing past 255.255.255.255 does not wrap
    let mut start = from as u64;
    let end = to as u64;

    while start <= end {
        // Largest block aligned to `start`
        let align_bits = if start == 0 { 32 } else { start.trailing_zeros().min(32) };
        // Largest block that fits in the remaining span
        let span = end - start + 1;
        let span_bits = 63 - span.leading_zeros();
        let bits = align_bits.min(span_bits);
        let prefix_len = (32 - bits) as u8;

        if prefix_len <= max_prefix_len {
            // prefix_len is always <= 32
            if let Ok(net) = Ipv4Net::new(Ipv4Addr::from(start as u32), prefix_len) {
                blocks.push(net);
            }
        } else {
            skipped += 1;
        }
        start += 1u64 << bits;
    }

    (blocks, skipped)
}

/// Decompose an address pair into CIDR blocks.
///
/// IPv4 pairs are decomposed with [`range_to_cidrs`]. IPv6 is only supported
/// for exact addresses (`from == to`, a single /128). Mixed families, IPv6
/// ranges and inverted bounds yield an empty list.
pub fn decompose(from: IpAddr, to: IpAddr) -> Vec<IpNet> {
    decompose_with_floor(from, to, 32).0
}

/// [`decompose`] with a block-size floor for IPv4 ranges.
pub fn decompose_with_floor(from: IpAddr, to: IpAddr, max_prefix_len: u8) -> (Vec<IpNet>, usize) {
    match (from, to) {
        (IpAddr::V4(f), IpAddr::V4(t)) => {
            let (blocks, skipped) =
                range_to_cidrs_with_floor(u32::from(f), u32::from(t), max_prefix_len);
            (blocks.into_iter().map(IpNet::V4).collect(), skipped)
        }
        (IpAddr::V6(f), IpAddr::V6(t)) if f == t => match Ipv6Net::new(f, 128) {
            Ok(net) => (vec![IpNet::V6(net)], 0),
            Err(_) => (Vec::new(), 0),
        },
        _ => (Vec::new(), 0),
    }
}

/// Reassemble an ordered, contiguous list of blocks into its interval.
///
/// Returns `None` for an empty list or when the blocks leave a gap.
pub fn cidrs_to_range(blocks: &[Ipv4Net]) -> Option<(u32, u32)> {
    let first = blocks.first()?;
    let from = u32::from(first.network());
    let mut to = u32::from(first.broadcast());

    for block in &blocks[1..] {
        let start = u32::from(block.network());
        if to.checked_add(1) != Some(start) {
            return None;
        }
        to = u32::from(block.broadcast());
    }

    Some((from, to))
}

/// Calculate the total number of individual IPs covered by a list of CIDRs.
///
/// Uses saturating arithmetic to prevent overflow on large prefixes like /0.
pub fn count_ips(nets: &[IpNet]) -> u128 {
    nets.iter()
        .map(|net| {
            let shift = net.max_prefix_len() - net.prefix_len();
            if shift >= 128 {
                u128::MAX
            } else {
                1u128 << shift
            }
        })
        .fold(0u128, |acc, count| acc.saturating_add(count))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn interval() -> impl Strategy<Value = (u32, u32)> {
        prop_oneof![
            (any::<u32>(), any::<u32>()).prop_map(|(a, b)| (a.min(b), a.max(b))),
            // Small spans exercise the unaligned edges
            (any::<u32>(), 0u32..70_000).prop_map(|(a, len)| (a, a.saturating_add(len))),
        ]
    }

    proptest! {
        /// The blocks cover exactly the interval, in order and without gaps
        #[test]
        fn prop_union_equals_interval((from, to) in interval()) {
            let blocks = range_to_cidrs(from, to);
            prop_assert_eq!(cidrs_to_range(&blocks), Some((from, to)));
        }

        /// Every block is a power of two aligned to its own size
        #[test]
        fn prop_blocks_are_aligned((from, to) in interval()) {
            for block in range_to_cidrs(from, to) {
                let size = 1u64 << (32 - block.prefix_len());
                prop_assert_eq!(u64::from(u32::from(block.network())) % size, 0);
                prop_assert_eq!(block.network(), block.addr());
            }
        }

        /// No two neighbouring blocks could be merged into a larger aligned block
        #[test]
        fn prop_decomposition_is_minimal((from, to) in interval()) {
            let blocks = range_to_cidrs(from, to);
            let merged = Ipv4Net::aggregate(&blocks);
            prop_assert_eq!(merged.len(), blocks.len());
        }

        /// Same input, same output
        #[test]
        fn prop_deterministic((from, to) in interval()) {
            prop_assert_eq!(range_to_cidrs(from, to), range_to_cidrs(from, to));
        }

        /// The floor only removes blocks, and only blocks longer than the floor
        #[test]
        fn prop_floor_is_subset((from, to) in interval(), floor in 0u8..=32) {
            let full = range_to_cidrs(from, to);
            let (kept, skipped) = range_to_cidrs_with_floor(from, to, floor);
            prop_assert_eq!(kept.len() + skipped, full.len());
            for block in &kept {
                prop_assert!(block.prefix_len() <= floor);
                prop_assert!(full.contains(block));
            }
        }
    }
}
