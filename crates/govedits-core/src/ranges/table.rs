//! Immutable interval index over the range database
//!
//! Ranges are kept per family, sorted by start, alongside a running maximum
//! of their end bounds. A lookup binary-searches for the last range that
//! starts at or before the address and walks left only while some earlier
//! range could still reach it, which keeps overlapping data correct without
//! giving up the logarithmic case for the common non-overlapping table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::address::{AddressFamily, Ordinal, normalize};
use crate::error::{Error, Result};

/// Filter tier applied at query time
///
/// Tiers nest: every Congress range is Federal and every Federal range is
/// in All.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Any government range
    All,
    /// Federal ranges only
    #[default]
    Federal,
    /// Legislative-branch ranges only
    Congress,
}

impl Tier {
    /// Whether a range is visible under this tier
    pub fn admits(self, range: &AddressRange) -> bool {
        match self {
            Self::All => true,
            Self::Federal => range.is_federal,
            Self::Congress => range.is_congress && range.is_federal,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Federal => "federal",
            Self::Congress => "congress",
        };
        f.write_str(name)
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "federal" => Ok(Self::Federal),
            "congress" => Ok(Self::Congress),
            other => Err(Error::config(format!(
                "Unknown tier '{}' (expected all, federal or congress)",
                other
            ))),
        }
    }
}

/// One contiguous block of addresses owned by an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address (inclusive)
    pub start: Ordinal,
    /// Last address (inclusive)
    pub end: Ordinal,
    /// Owning organization
    pub organization: String,
    /// Federal government network
    pub is_federal: bool,
    /// Legislative-branch network
    pub is_congress: bool,
}

impl AddressRange {
    /// Build a range, rejecting mixed families and inverted bounds
    pub fn new(
        start: Ordinal,
        end: Ordinal,
        organization: impl Into<String>,
        is_federal: bool,
        is_congress: bool,
    ) -> Result<Self> {
        if start.family != end.family {
            return Err(Error::range_load(format!(
                "range {} - {} mixes address families",
                start, end
            )));
        }
        if start.value > end.value {
            return Err(Error::range_load(format!(
                "range {} - {} starts after it ends",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            organization: organization.into(),
            is_federal: is_federal || is_congress,
            is_congress,
        })
    }

    /// Address family of both bounds
    pub fn family(&self) -> AddressFamily {
        self.start.family
    }

    /// Whether `ordinal` lies within the range
    pub fn contains(&self, ordinal: Ordinal) -> bool {
        ordinal.family == self.family()
            && self.start.value <= ordinal.value
            && ordinal.value <= self.end.value
    }
}

#[derive(Debug, Default)]
struct FamilyIndex {
    ranges: Vec<AddressRange>,
    max_end: Vec<u128>,
}

impl FamilyIndex {
    fn build(mut ranges: Vec<(usize, AddressRange)>) -> Self {
        // Equal starts: the earlier row must be met first when walking left
        ranges.sort_by(|(ia, a), (ib, b)| a.start.value.cmp(&b.start.value).then(ib.cmp(ia)));

        let mut max_end = Vec::with_capacity(ranges.len());
        let mut running = 0u128;
        for (_, range) in &ranges {
            running = running.max(range.end.value);
            max_end.push(running);
        }

        Self {
            ranges: ranges.into_iter().map(|(_, r)| r).collect(),
            max_end,
        }
    }

    fn query(&self, value: u128, tier: Tier) -> Option<&AddressRange> {
        let upper = self.ranges.partition_point(|r| r.start.value <= value);
        (0..upper)
            .rev()
            .take_while(|&i| self.max_end[i] >= value)
            .map(|i| &self.ranges[i])
            .find(|r| r.end.value >= value && tier.admits(r))
    }
}

/// Loaded-once, read-only range database
#[derive(Debug, Default)]
pub struct RangeTable {
    v4: FamilyIndex,
    v6: FamilyIndex,
}

impl RangeTable {
    /// Build a table from already validated ranges, in load order
    pub fn from_ranges(ranges: impl IntoIterator<Item = AddressRange>) -> Self {
        let (v4, v6): (Vec<_>, Vec<_>) = ranges
            .into_iter()
            .enumerate()
            .partition(|(_, r)| r.family() == AddressFamily::V4);

        Self {
            v4: FamilyIndex::build(v4),
            v6: FamilyIndex::build(v6),
        }
    }

    /// Load the range database from a CSV file
    pub fn load_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::range_load(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::load(file)
    }

    /// Load the range database from CSV text with a header row
    ///
    /// Bad rows are logged and skipped; a missing required column or an
    /// empty result fails the load.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv
            .headers()
            .map_err(|e| Error::range_load(format!("cannot read header row: {}", e)))?
            .clone();
        let columns = Columns::locate(&headers)?;

        let mut ranges = Vec::new();
        let mut skipped = 0usize;

        for (row, record) in csv.records().enumerate() {
            // header is line 1
            let line = row + 2;
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(line, error = %e, "Skipping unreadable range row");
                    skipped += 1;
                    continue;
                }
            };

            match columns.parse_row(&record) {
                Ok(range) => ranges.push(range),
                Err(reason) => {
                    warn!(line, %reason, "Skipping range row");
                    skipped += 1;
                }
            }
        }

        let table = Self::from_ranges(ranges);
        if table.is_empty() {
            return Err(Error::range_load("range table contains no usable rows"));
        }

        info!(
            ipv4 = table.count(AddressFamily::V4),
            ipv6 = table.count(AddressFamily::V6),
            federal = table.count_tier(Tier::Federal),
            congress = table.count_tier(Tier::Congress),
            skipped,
            "Range table loaded"
        );
        Ok(table)
    }

    /// Containing range for `ordinal` under `tier`
    ///
    /// With overlaps the range with the greatest start wins, ties going to
    /// the earlier row.
    pub fn query(&self, ordinal: Ordinal, tier: Tier) -> Option<&AddressRange> {
        self.index(ordinal.family).query(ordinal.value, tier)
    }

    /// Total number of ranges
    pub fn len(&self) -> usize {
        self.v4.ranges.len() + self.v6.ranges.len()
    }

    /// Whether the table holds no ranges
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ranges in one family
    pub fn count(&self, family: AddressFamily) -> usize {
        self.index(family).ranges.len()
    }

    /// Number of ranges visible under a tier
    pub fn count_tier(&self, tier: Tier) -> usize {
        self.v4
            .ranges
            .iter()
            .chain(&self.v6.ranges)
            .filter(|r| tier.admits(r))
            .count()
    }

    fn index(&self, family: AddressFamily) -> &FamilyIndex {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }
}

/// Header positions of the columns we read
struct Columns {
    organization: usize,
    start: usize,
    end: usize,
    federal: usize,
    congress: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self> {
        let find = |aliases: &[&str]| {
            headers
                .iter()
                .position(|h| aliases.iter().any(|a| h.eq_ignore_ascii_case(a)))
        };
        let require = |name: &str, aliases: &[&str]| {
            find(aliases).ok_or_else(|| {
                Error::range_load(format!("missing required column '{}'", name))
            })
        };

        Ok(Self {
            organization: require("organization", &["organization", "org", "org name"])?,
            start: require("start_ip", &["start_ip", "start"])?,
            end: require("end_ip", &["end_ip", "end"])?,
            federal: require("is_federal", &["is_federal", "federal"])?,
            congress: find(&["is_congress", "congress"]),
        })
    }

    fn parse_row(&self, record: &csv::StringRecord) -> std::result::Result<AddressRange, String> {
        let field = |i: usize| record.get(i).unwrap_or("");

        let organization = field(self.organization);
        if organization.is_empty() {
            return Err("missing organization".to_string());
        }

        let start = normalize(field(self.start)).map_err(|e| format!("start: {}", e))?;
        let end = normalize(field(self.end)).map_err(|e| format!("end: {}", e))?;

        let is_federal = parse_flag(field(self.federal))
            .ok_or_else(|| format!("unrecognized federal flag {:?}", field(self.federal)))?;
        let is_congress = match self.congress.map(field).filter(|v| !v.is_empty()) {
            Some(raw) => {
                parse_flag(raw).ok_or_else(|| format!("unrecognized congress flag {:?}", raw))?
            }
            None => is_legislative(organization),
        };

        AddressRange::new(start, end, organization, is_federal, is_congress)
            .map_err(|e| e.to_string())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Legacy naming heuristic for legislative networks
fn is_legislative(organization: &str) -> bool {
    let org = organization.trim().to_lowercase();
    org.contains("u.s. senate")
        || org.contains("u.s. house of representatives")
        || org == "senate"
        || org == "house of representatives"
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
start_ip,end_ip,organization,is_federal
203.0.113.0,203.0.113.255,Example Gov,yes
198.51.100.0,198.51.100.127,City of Exampleton,no
192.0.2.0,192.0.2.63,U.S. Senate,yes
2001:db8::,2001:db8::ffff,Example Gov IPv6,yes
";

    fn ip(text: &str) -> Ordinal {
        normalize(text).unwrap()
    }

    #[test]
    fn loads_and_counts() {
        let table = RangeTable::load(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.count(AddressFamily::V4), 3);
        assert_eq!(table.count(AddressFamily::V6), 1);
        assert_eq!(table.count_tier(Tier::Federal), 3);
        assert_eq!(table.count_tier(Tier::Congress), 1);
    }

    #[test]
    fn containment_and_bounds() {
        let table = RangeTable::load(SAMPLE.as_bytes()).unwrap();
        let gov = |t: &str| table.query(ip(t), Tier::All).map(|r| r.organization.as_str());

        assert_eq!(gov("203.0.113.0"), Some("Example Gov"));
        assert_eq!(gov("203.0.113.255"), Some("Example Gov"));
        assert_eq!(gov("203.0.114.0"), None);
        assert_eq!(gov("203.0.112.255"), None);
        assert_eq!(gov("2001:db8::42"), Some("Example Gov IPv6"));
        assert_eq!(gov("2001:db8::1:0"), None);
        assert_eq!(gov("8.8.8.8"), None);
    }

    #[test]
    fn tiers_nest() {
        let table = RangeTable::load(SAMPLE.as_bytes()).unwrap();
        let city = ip("198.51.100.5");
        let senate = ip("192.0.2.10");
        let gov = ip("203.0.113.5");

        assert!(table.query(city, Tier::All).is_some());
        assert!(table.query(city, Tier::Federal).is_none());
        assert!(table.query(gov, Tier::Federal).is_some());
        assert!(table.query(gov, Tier::Congress).is_none());
        for tier in [Tier::All, Tier::Federal, Tier::Congress] {
            assert!(table.query(senate, tier).is_some(), "senate under {tier}");
        }
    }

    #[test]
    fn explicit_congress_column_wins_over_name() {
        let csv = "\
Organization,Start,End,Federal,Congress
U.S. Senate,10.0.0.0,10.0.0.255,yes,no
Library Annex,10.0.1.0,10.0.1.255,no,yes
Other Office,10.0.2.0,10.0.2.255,yes,
";
        let table = RangeTable::load(csv.as_bytes()).unwrap();
        assert!(table.query(ip("10.0.0.1"), Tier::Congress).is_none());

        // congress implies federal
        let annex = table.query(ip("10.0.1.1"), Tier::Congress).unwrap();
        assert!(annex.is_federal);

        assert!(table.query(ip("10.0.2.1"), Tier::Congress).is_none());
    }

    #[test]
    fn bad_rows_are_skipped() {
        let csv = "\
start_ip,end_ip,organization,is_federal
203.0.113.0,203.0.113.255,Example Gov,yes
not-an-ip,203.0.113.255,Broken,yes
10.0.0.9,10.0.0.1,Inverted,yes
10.0.0.0,2001:db8::1,Mixed,yes
10.0.0.0,10.0.0.255,,yes
10.0.0.0,10.0.0.255,Odd Flag,maybe
";
        let table = RangeTable::load(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fatal_load_errors() {
        let missing_column = "start_ip,end_ip,organization\n1.1.1.1,1.1.1.2,X\n";
        assert!(matches!(
            RangeTable::load(missing_column.as_bytes()),
            Err(Error::RangeLoad(_))
        ));

        let only_bad = "start_ip,end_ip,organization,is_federal\nx,y,Z,yes\n";
        assert!(matches!(RangeTable::load(only_bad.as_bytes()), Err(Error::RangeLoad(_))));

        assert!(matches!(
            RangeTable::load_path("/nonexistent/ranges.csv"),
            Err(Error::RangeLoad(_))
        ));
    }

    #[test]
    fn overlapping_ranges_pick_nearest_start() {
        let table = RangeTable::from_ranges(vec![
            AddressRange::new(ip("10.0.0.0"), ip("10.255.255.255"), "Agency", true, false).unwrap(),
            AddressRange::new(ip("10.1.0.0"), ip("10.1.0.255"), "Bureau", false, false).unwrap(),
            AddressRange::new(ip("10.2.0.0"), ip("10.2.0.9"), "Office", true, false).unwrap(),
        ]);

        let org = |t: &str, tier| table.query(ip(t), tier).map(|r| r.organization.clone());
        assert_eq!(org("10.1.0.7", Tier::All).as_deref(), Some("Bureau"));
        // the nearer range fails the tier, so the enclosing one answers
        assert_eq!(org("10.1.0.7", Tier::Federal).as_deref(), Some("Agency"));
        // past the inner ranges the outer one still covers it
        assert_eq!(org("10.3.0.0", Tier::All).as_deref(), Some("Agency"));
        assert_eq!(org("10.2.0.5", Tier::All).as_deref(), Some("Office"));
    }

    #[test]
    fn equal_starts_prefer_earlier_row() {
        let table = RangeTable::from_ranges(vec![
            AddressRange::new(ip("10.0.0.0"), ip("10.0.0.255"), "First", false, false).unwrap(),
            AddressRange::new(ip("10.0.0.0"), ip("10.0.0.127"), "Second", false, false).unwrap(),
        ]);
        let hit = table.query(ip("10.0.0.1"), Tier::All).unwrap();
        assert_eq!(hit.organization, "First");
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("Federal".parse::<Tier>().unwrap(), Tier::Federal);
        assert!("state".parse::<Tier>().is_err());
        assert_eq!(Tier::Congress.to_string(), "congress");
    }
}
