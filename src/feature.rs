use crate::*;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ordered_float::NotNan;

/// A label carried together with its precomputed cost so that repeated
/// `cost` calls are never needed on hot paths.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLabel<L> {
    pub cost: Cost,
    pub label: L,
}

impl<L: fmt::Display> fmt::Display for CostLabel<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{},{}}}", self.cost, self.label)
    }
}

/// True when the two costs are closer than the shared comparison tolerance.
pub fn within_tolerance(a: Cost, b: Cost) -> bool {
    (a.into_inner() - b.into_inner()).abs() < EPSILON_ALLOWANCE
}

/// The ordering used by every distance-driven queue in the pipeline:
/// ascending distance, with near-ties broken toward the cheaper joined label.
pub fn cmp_by_distance(d1: Cost, c1: Cost, d2: Cost, c2: Cost) -> Ordering {
    if within_tolerance(d1, d2) {
        c1.cmp(&c2)
    } else {
        d1.cmp(&d2)
    }
}

/// A bounded join-semilattice of labels with a monotone size measure.
///
/// `join` is the least upper bound and must be total; `meet` is the greatest
/// lower bound and returns `None` when the two labels share no element.
/// `subset(a, b)` holds exactly when `join(a, b) == b`.
pub trait Feature: Sync {
    type Label: Clone + PartialEq + Send + Sync;

    fn join(&self, a: &Self::Label, b: &Self::Label) -> Self::Label;

    fn meet(&self, a: &Self::Label, b: &Self::Label) -> Option<Self::Label>;

    fn cost(&self, label: &Self::Label) -> Cost;

    fn top(&self) -> Self::Label;

    fn cjoin(&self, a: &Self::Label, b: &Self::Label) -> CostLabel<Self::Label> {
        let joined = self.join(a, b);
        CostLabel {
            cost: self.cost(&joined),
            label: joined,
        }
    }

    fn subset(&self, a: &Self::Label, b: &Self::Label) -> bool {
        self.join(a, b) == *b
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Prefix {
    pub addr: u32,
    pub len: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: u32, len: u8) -> Self {
        debug_assert!(len <= 32);
        Ipv4Prefix { addr, len }
    }

    pub fn begin(&self) -> u32 {
        self.addr
    }

    pub fn end(&self) -> u32 {
        (u64::from(self.addr) + self.network_size() - 1) as u32
    }

    pub fn network_size(&self) -> u64 {
        1u64 << (32 - self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let (quad, len) = s
            .split_once('/')
            .ok_or_else(|| format!("missing '/' in prefix '{s}'"))?;
        let len: u8 = len
            .parse()
            .map_err(|e| format!("invalid prefix length in '{s}': {e}"))?;
        if len > 32 {
            return Err(format!("prefix length {len} out of range in '{s}'"));
        }
        let octets: Vec<&str> = quad.split('.').collect();
        if octets.len() != 4 {
            return Err(format!("expected four octets in '{s}'"));
        }
        let mut addr = 0u32;
        for octet in octets {
            let octet: u8 = octet
                .parse()
                .map_err(|e| format!("invalid octet '{octet}' in '{s}': {e}"))?;
            addr = (addr << 8) | u32::from(octet);
        }
        Ok(Ipv4Prefix { addr, len })
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}/{}",
            self.addr >> 24,
            (self.addr >> 16) & 0xff,
            (self.addr >> 8) & 0xff,
            self.addr & 0xff,
            self.len
        )
    }
}

pub struct Ipv4PrefixFeature;

impl Feature for Ipv4PrefixFeature {
    type Label = Ipv4Prefix;

    fn join(&self, a: &Ipv4Prefix, b: &Ipv4Prefix) -> Ipv4Prefix {
        let common = (a.addr ^ b.addr).leading_zeros() as u8;
        let len = a.len.min(b.len).min(common);
        if len == 0 {
            return Ipv4Prefix::new(0, 0);
        }
        let mask = !((1u32 << (32 - len)) - 1);
        Ipv4Prefix::new(a.addr & mask, len)
    }

    fn meet(&self, a: &Ipv4Prefix, b: &Ipv4Prefix) -> Option<Ipv4Prefix> {
        if a.begin() > b.end() || b.begin() > a.end() {
            None
        } else if a.len < b.len {
            // Overlapping prefixes nest, so the intersection is the longer one.
            Some(*b)
        } else {
            Some(*a)
        }
    }

    fn cost(&self, l: &Ipv4Prefix) -> Cost {
        NotNan::new(l.network_size() as f64).unwrap()
    }

    fn top(&self) -> Ipv4Prefix {
        Ipv4Prefix::new(0, 0)
    }
}

/// An inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub begin: u32,
    pub end: u32,
}

impl IpRange {
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end);
        IpRange { begin, end }
    }
}

impl From<Ipv4Prefix> for IpRange {
    fn from(p: Ipv4Prefix) -> Self {
        IpRange::new(p.begin(), p.end())
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

pub struct IpRangeFeature;

impl Feature for IpRangeFeature {
    type Label = IpRange;

    fn join(&self, a: &IpRange, b: &IpRange) -> IpRange {
        IpRange::new(a.begin.min(b.begin), a.end.max(b.end))
    }

    fn meet(&self, a: &IpRange, b: &IpRange) -> Option<IpRange> {
        if a.end < b.begin || b.end < a.begin {
            None
        } else {
            Some(IpRange::new(a.begin.max(b.begin), a.end.min(b.end)))
        }
    }

    fn cost(&self, l: &IpRange) -> Cost {
        NotNan::new((u64::from(l.end) - u64::from(l.begin) + 1) as f64).unwrap()
    }

    fn top(&self) -> IpRange {
        IpRange::new(0, u32::MAX)
    }
}

/// Feature over labels drawn from a loaded [`LabelHierarchy`].
pub struct DagFeature<'a> {
    hierarchy: &'a LabelHierarchy,
}

impl<'a> DagFeature<'a> {
    pub fn new(hierarchy: &'a LabelHierarchy) -> Self {
        DagFeature { hierarchy }
    }
}

impl Feature for DagFeature<'_> {
    type Label = LabelId;

    fn join(&self, a: &LabelId, b: &LabelId) -> LabelId {
        self.hierarchy.join(*a, *b)
    }

    fn meet(&self, a: &LabelId, b: &LabelId) -> Option<LabelId> {
        self.hierarchy.meet(*a, *b)
    }

    fn cost(&self, l: &LabelId) -> Cost {
        self.hierarchy.cost(*l)
    }

    fn top(&self) -> LabelId {
        self.hierarchy.top()
    }
}

// Componentwise lifting: a tuple of features over a tuple of labels, with
// the product of the component costs as the combined cost.
macro_rules! impl_tuple_feature {
    ($(($F:ident, $idx:tt)),+) => {
        impl<$($F: Feature),+> Feature for ($($F,)+) {
            type Label = ($($F::Label,)+);

            fn join(&self, a: &Self::Label, b: &Self::Label) -> Self::Label {
                ($(self.$idx.join(&a.$idx, &b.$idx),)+)
            }

            fn meet(&self, a: &Self::Label, b: &Self::Label) -> Option<Self::Label> {
                Some(($(self.$idx.meet(&a.$idx, &b.$idx)?,)+))
            }

            fn cost(&self, l: &Self::Label) -> Cost {
                let mut cost = NotNan::new(1.0).unwrap();
                $(cost = cost * self.$idx.cost(&l.$idx);)+
                cost
            }

            fn top(&self) -> Self::Label {
                ($(self.$idx.top(),)+)
            }
        }
    };
}

impl_tuple_feature!((A, 0), (B, 1));
impl_tuple_feature!((A, 0), (B, 1), (C, 2));
impl_tuple_feature!((A, 0), (B, 1), (C, 2), (D, 3));
