use crate::types::AddressFamily;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Draws random host addresses out of CIDR subnets, never handing out the
/// same address twice over its lifetime.
pub struct AddressSampler {
    issued: HashSet<IpAddr>,
    rng: StdRng,
}

impl AddressSampler {
    pub fn new() -> Self {
        Self {
            issued: HashSet::new(),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            issued: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of distinct addresses returned so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }

    /// Pick one random host of `subnet`.
    ///
    /// Returns `None` when the subnet is too small (two addresses or fewer),
    /// belongs to the other family, or the drawn address was already issued.
    /// A `None` is not an error; the caller simply tries another subnet.
    pub fn next(&mut self, subnet: &IpNet, family: AddressFamily) -> Option<IpAddr> {
        let addr = match (subnet, family) {
            (IpNet::V4(net), AddressFamily::V4) => self.pick_v4(net).map(IpAddr::V4)?,
            (IpNet::V6(net), AddressFamily::V6) => self.pick_v6(net).map(IpAddr::V6)?,
            _ => {
                tracing::debug!(%subnet, %family, "Subnet does not match address family");
                return None;
            }
        };

        if self.issued.insert(addr) {
            Some(addr)
        } else {
            tracing::trace!(%addr, "Address already issued");
            None
        }
    }

    fn pick_v4(&mut self, net: &Ipv4Net) -> Option<Ipv4Addr> {
        let size = 1u64 << (32 - u32::from(net.prefix_len()));
        if size <= 2 {
            return None;
        }
        // 跳过网络地址和广播地址
        let offset = self.rng.gen_range(1..=size - 2);
        let base = u64::from(u32::from(net.network()));
        Some(Ipv4Addr::from((base + offset) as u32))
    }

    fn pick_v6(&mut self, net: &Ipv6Net) -> Option<Ipv6Addr> {
        let host_bits = 128 - u32::from(net.prefix_len());
        let base = u128::from(net.network());

        if host_bits >= 64 {
            // The prefix leaves a whole interface identifier: pick a random /64
            // inside the prefix, then a random non-zero lower 64 bits.
            let subnet_bits = host_bits - 64;
            let routing: u64 = if subnet_bits == 0 {
                0
            } else {
                self.rng.gen::<u64>() >> (64 - subnet_bits)
            };
            let suffix: u64 = self.rng.gen_range(1..=u64::MAX);
            let addr = base | (u128::from(routing) << 64) | u128::from(suffix);
            return Some(Ipv6Addr::from(addr));
        }

        let size = 1u128 << host_bits;
        if size <= 2 {
            return None;
        }
        let offset = self.rng.gen_range(1..size);
        Some(Ipv6Addr::from(base + offset))
    }
}

impl Default for AddressSampler {
    fn default() -> Self {
        Self::new()
    }
}
