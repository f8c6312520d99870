//! Resource vectors and aggregate requirements
//!
//! A [`Resources`] is a named vector of scalar quantities. The required keys
//! are `cpu`, `mem`, and `disk` (memory and disk in bytes); feature keys such
//! as `gpu` are optional. Comparison is a dominance partial order: `a`
//! satisfies `b` iff every quantity in `b` is present in `a` at least as
//! large.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// CPU count key.
pub const CPU: &str = "cpu";
/// Memory-in-bytes key.
pub const MEM: &str = "mem";
/// Disk-in-bytes key.
pub const DISK: &str = "disk";
/// GPU count key (optional feature dimension).
pub const GPU: &str = "gpu";

/// A named vector of resource quantities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common cpu/mem pair.
    pub fn cpu_mem(cpu: f64, mem: f64) -> Self {
        Self::from([(CPU, cpu), (MEM, mem)])
    }

    pub fn get(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.set(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether all quantities are zero (an empty vector is zero).
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| *v <= 0.0)
    }

    /// Dominance: `self` can accommodate `need`. Keys absent from `self`
    /// count as zero, so a vector with a `gpu` requirement is only
    /// satisfied by vectors that carry `gpu`.
    pub fn available(&self, need: &Resources) -> bool {
        need.0.iter().all(|(k, v)| self.get(k) >= *v)
    }

    pub fn add(&mut self, other: &Resources) {
        for (k, v) in &other.0 {
            *self.0.entry(k.clone()).or_insert(0.0) += v;
        }
    }

    /// Subtract, saturating each quantity at zero.
    pub fn sub(&mut self, other: &Resources) {
        for (k, v) in &other.0 {
            let e = self.0.entry(k.clone()).or_insert(0.0);
            *e = (*e - v).max(0.0);
        }
    }

    pub fn scaled(&self, factor: f64) -> Resources {
        Resources(self.0.iter().map(|(k, v)| (k.clone(), v * factor)).collect())
    }

    /// Element-wise maximum.
    pub fn max_with(&mut self, other: &Resources) {
        for (k, v) in &other.0 {
            let e = self.0.entry(k.clone()).or_insert(0.0);
            if *v > *e {
                *e = *v;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Total order used for size tie-breaks: cpu, then mem, then disk, then
    /// gpu, then any remaining keys lexicographically. This makes packing
    /// and "smallest fit" selection deterministic.
    pub fn cmp_size(&self, other: &Resources) -> Ordering {
        for key in [CPU, MEM, DISK, GPU] {
            match self.get(key).partial_cmp(&other.get(key)) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        let keys: std::collections::BTreeSet<&String> =
            self.0.keys().chain(other.0.keys()).collect();
        for key in keys {
            if matches!(key.as_str(), CPU | MEM | DISK | GPU) {
                continue;
            }
            match self.get(key).partial_cmp(&other.get(key)) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        Ordering::Equal
    }
}

impl<const N: usize> From<[(&str, f64); N]> for Resources {
    fn from(entries: [(&str, f64); N]) -> Self {
        Resources(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match k.as_str() {
                MEM | DISK => write!(f, "{k}:{}", bytes_string(*v))?,
                _ => write!(f, "{k}:{v}")?,
            }
        }
        write!(f, "}}")
    }
}

fn bytes_string(v: f64) -> String {
    const UNITS: [(&str, f64); 4] = [
        ("TiB", (1u64 << 40) as f64),
        ("GiB", (1u64 << 30) as f64),
        ("MiB", (1u64 << 20) as f64),
        ("KiB", (1u64 << 10) as f64),
    ];
    for (unit, size) in UNITS {
        if v >= size {
            return format!("{:.1}{unit}", v / size);
        }
    }
    format!("{v:.0}B")
}

/// Aggregate demand: the minimum acceptable resource vector plus a width.
///
/// `width` is the approximate number of `min`-sized slices the cluster
/// should be able to serve concurrently; it is always at least 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub min: Resources,
    pub width: usize,
}

impl Requirements {
    pub fn new(min: Resources, width: usize) -> Self {
        Self { min, width: width.max(1) }
    }

    /// A narrow requirement: exactly one `min`-sized slice.
    pub fn narrow(min: Resources) -> Self {
        Self::new(min, 1)
    }

    /// The aggregate `width x min` vector.
    pub fn total(&self) -> Resources {
        self.min.scaled(self.width as f64)
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.min, self.width)
    }
}
