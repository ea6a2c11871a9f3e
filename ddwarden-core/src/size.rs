use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i)(\d+)([MG])$").expect("static regex is valid"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    Mebibytes,
    Gibibytes,
}

/// Size of a virtual disk, as typed by the operator (`500M`, `1G`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskSize {
    value: u64,
    unit: SizeUnit,
}

impl DiskSize {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = || Error::InvalidSize(input.to_string());

        let caps = SIZE_RE.captures(input).ok_or_else(invalid)?;
        let value: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = if caps[2].eq_ignore_ascii_case("G") {
            SizeUnit::Gibibytes
        } else {
            SizeUnit::Mebibytes
        };

        let size = Self { value, unit };
        if value == 0 || size.checked_bytes().is_none() {
            return Err(invalid());
        }
        Ok(size)
    }

    fn checked_bytes(&self) -> Option<u64> {
        let multiplier: u64 = match self.unit {
            SizeUnit::Mebibytes => 1 << 20,
            SizeUnit::Gibibytes => 1 << 30,
        };
        self.value.checked_mul(multiplier)
    }

    pub fn bytes(&self) -> u64 {
        self.checked_bytes().unwrap_or(u64::MAX)
    }
}

impl FromStr for DiskSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Renders the form `dd seek=` understands.
impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.unit {
            SizeUnit::Mebibytes => "M",
            SizeUnit::Gibibytes => "G",
        };
        write!(f, "{}{}", self.value, suffix)
    }
}
