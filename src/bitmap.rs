//! CPU and NUMA-node sets in Linux cpu-list notation (`0-3,6,8-9`).

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::str::FromStr;

/// An ordered set of CPU or node indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    bits: BTreeSet<usize>,
}

impl Bitmap {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set containing `0..count`.
    pub fn with_range(count: usize) -> Self {
        Self {
            bits: (0..count).collect(),
        }
    }

    /// Parse a cpu-list string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut bits = BTreeSet::new();
        for part in s.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_index(lo, s)?;
                    let hi = parse_index(hi, s)?;
                    if lo > hi {
                        return Err(Error::invalid_argument(format!(
                            "invalid range '{}' in cpu list '{}'",
                            part, s
                        )));
                    }
                    bits.extend(lo..=hi);
                }
                None => {
                    bits.insert(parse_index(part, s)?);
                }
            }
        }
        Ok(Self { bits })
    }

    /// Add an index.
    pub fn set(&mut self, bit: usize) {
        self.bits.insert(bit);
    }

    /// Check membership.
    pub fn is_set(&self, bit: usize) -> bool {
        self.bits.contains(&bit)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.len()
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Iterate set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().copied()
    }

    /// Highest set bit.
    pub fn last(&self) -> Option<usize> {
        self.bits.iter().next_back().copied()
    }

    /// Union with another set.
    pub fn union(&self, other: &Bitmap) -> Bitmap {
        Bitmap {
            bits: self.bits.union(&other.bits).copied().collect(),
        }
    }

    /// Format as a compact cpu-list string.
    pub fn format(&self) -> String {
        let mut out = Vec::new();
        let mut iter = self.bits.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                out.push(start.to_string());
            } else {
                out.push(format!("{}-{}", start, end));
            }
        }
        out.join(",")
    }

    /// Convert to a `nix` CPU set for `sched_setaffinity`.
    pub fn to_cpu_set(&self) -> Result<nix::sched::CpuSet> {
        let mut set = nix::sched::CpuSet::new();
        for cpu in self.iter() {
            set.set(cpu)
                .map_err(|e| Error::invalid_argument(format!("cpu {} out of range: {}", cpu, e)))?;
        }
        Ok(set)
    }
}

fn parse_index(raw: &str, whole: &str) -> Result<usize> {
    raw.trim().parse::<usize>().map_err(|_| {
        Error::invalid_argument(format!("invalid cpu list '{}'", whole))
    })
}

impl FromStr for Bitmap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Bitmap::parse(s)
    }
}

impl std::fmt::Display for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromIterator<usize> for Bitmap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.format())
    }
}

impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Bitmap::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges_and_singles() {
        let map = Bitmap::parse("0-3,6,8-9").unwrap();
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6, 8, 9]);
        assert_eq!(map.count(), 7);
        assert_eq!(map.last(), Some(9));
    }

    #[test]
    fn test_parse_sysfs_trailing_newline() {
        let map = Bitmap::parse("0-7\n").unwrap();
        assert_eq!(map.count(), 8);
    }

    #[test]
    fn test_parse_empty() {
        assert!(Bitmap::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["a", "3-1", "1-", "0,,x"] {
            let err = Bitmap::parse(bad).unwrap_err();
            assert!(err.to_string().contains("cpu list") || err.to_string().contains("range"));
        }
    }

    #[test]
    fn test_format_compacts_runs() {
        let map: Bitmap = [0, 1, 2, 5, 7, 8].into_iter().collect();
        assert_eq!(map.format(), "0-2,5,7-8");
        assert_eq!(Bitmap::with_range(1).format(), "0");
    }

    #[test]
    fn test_serde_as_string() {
        let map = Bitmap::parse("1,3").unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "\"1,3\"");
        let back: Bitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_union() {
        let a = Bitmap::parse("0-1").unwrap();
        let b = Bitmap::parse("4").unwrap();
        assert_eq!(a.union(&b).format(), "0-1,4");
    }
}
