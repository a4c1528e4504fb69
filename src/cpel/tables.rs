//! In-memory tables built from the whole event stream before anything is
//! written.

use std::collections::{BTreeMap, HashMap};

use super::{FORMAT_STRING, STRING_TABLE_NAME};
use crate::error::CpelError;
use crate::records::SchedEvent;

/// Every distinct string of the trace, stored once, NUL-terminated, in
/// first-insertion order.
#[derive(Debug, Clone)]
pub struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    /// A table holding only the table name (offset 0) and `"%s"` (offset 11).
    pub fn new() -> Self {
        let mut table = StringTable {
            bytes: Vec::new(),
            offsets: HashMap::new(),
        };
        for seed in [STRING_TABLE_NAME, FORMAT_STRING] {
            let offset = table.bytes.len() as u32;
            table.bytes.extend_from_slice(seed.as_bytes());
            table.bytes.push(0);
            table.offsets.insert(seed.to_string(), offset);
        }
        table
    }

    /// Offset of `s`, adding it if it is not in the table yet.
    pub fn insert(&mut self, s: &str) -> Result<u32, CpelError> {
        if let Some(&offset) = self.offsets.get(s) {
            return Ok(offset);
        }
        if s.as_bytes().contains(&0) {
            return Err(CpelError::InteriorNul(s.to_string()));
        }
        let offset = u32::try_from(self.bytes.len()).map_err(|_| CpelError::TooLarge {
            what: "string table offset",
        })?;
        if self.bytes.len() + s.len() + 1 > u32::MAX as usize - 3 {
            return Err(CpelError::TooLarge {
                what: "string table",
            });
        }
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), offset);
        Ok(offset)
    }

    pub fn offset(&self, s: &str) -> Option<u32> {
        self.offsets.get(s).copied()
    }

    /// Number of distinct strings, seeds included.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Length of the section payload, padding included.
    pub fn padded_len(&self) -> usize {
        self.bytes.len().next_multiple_of(4)
    }

    /// Table bytes NUL-padded to a multiple of 4.
    pub fn padded_bytes(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        bytes.resize(self.padded_len(), 0);
        bytes
    }
}

/// Names mapped to numeric codes in first-seen order.
///
/// Iteration is by name, which is the order the tables are written in.
#[derive(Debug, Clone, Default)]
pub struct CodeTable {
    codes: BTreeMap<String, u32>,
}

/// Event type name -> event code.
pub type EventTypeTable = CodeTable;
/// Track name -> track id.
pub type TrackTable = CodeTable;

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code of `name`, assigning the next free code on first sight.
    pub fn code(&mut self, name: &str) -> Result<u32, CpelError> {
        if let Some(&code) = self.codes.get(name) {
            return Ok(code);
        }
        let code = u32::try_from(self.codes.len()).map_err(|_| CpelError::TooLarge {
            what: "code table",
        })?;
        self.codes.insert(name.to_string(), code);
        Ok(code)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.codes.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// `(name, code)` pairs sorted by name.
    pub fn sorted_by_name(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.codes.iter().map(|(name, &code)| (name.as_str(), code))
    }
}

/// One entry of the events section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub time: u64,
    pub track: u32,
    pub event_code: u32,
    pub datum: u32,
}

impl EventRecord {
    pub fn time_hi(&self) -> u32 {
        (self.time >> 32) as u32
    }

    pub fn time_lo(&self) -> u32 {
        (self.time & u64::from(u32::MAX)) as u32
    }
}

/// All tables of one trace.
#[derive(Debug, Clone, Default)]
pub struct TraceTables {
    pub strings: StringTable,
    pub event_types: EventTypeTable,
    pub tracks: TrackTable,
    pub events: Vec<EventRecord>,
}

impl TraceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<I>(events: I) -> Result<Self, CpelError>
    where
        I: IntoIterator<Item = SchedEvent>,
    {
        let mut tables = TraceTables::new();
        for event in events {
            tables.push(&event)?;
        }
        Ok(tables)
    }

    pub fn push(&mut self, event: &SchedEvent) -> Result<(), CpelError> {
        let datum = self.strings.insert(&event.datum)?;
        self.strings.insert(&event.track)?;
        self.strings.insert(&event.event_type)?;
        let event_code = self.event_types.code(&event.event_type)?;
        let track = self.tracks.code(&event.track)?;
        if self.events.len() >= u32::MAX as usize {
            return Err(CpelError::TooLarge {
                what: "event count",
            });
        }
        self.events.push(EventRecord {
            time: event.time,
            track,
            event_code,
            datum,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_offsets() {
        let strings = StringTable::new();
        assert_eq!(strings.offset("FileStrtab"), Some(0));
        assert_eq!(strings.offset("%s"), Some(11));
        assert_eq!(strings.padded_len(), 16);
    }

    #[test]
    fn test_strings_stored_once() {
        let mut strings = StringTable::new();
        assert_eq!(strings.insert("cpu 0").unwrap(), 14);
        assert_eq!(strings.insert("ab").unwrap(), 20);
        assert_eq!(strings.insert("cpu 0").unwrap(), 14);
        assert_eq!(strings.insert("%s").unwrap(), 11);
        assert_eq!(strings.len(), 4);
        let bytes = strings.padded_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[14..23], b"cpu 0\0ab\0");
        assert_eq!(bytes[23], 0);
    }

    #[test]
    fn test_interior_nul_rejected() {
        let mut strings = StringTable::new();
        assert!(matches!(
            strings.insert("bad\0name"),
            Err(CpelError::InteriorNul(_))
        ));
        assert_eq!(strings.len(), 2);
    }

    #[test]
    fn test_codes_first_seen_iteration_by_name() {
        let mut tracks = TrackTable::new();
        assert_eq!(tracks.code("cpu 2").unwrap(), 0);
        assert_eq!(tracks.code("cpu 0").unwrap(), 1);
        assert_eq!(tracks.code("cpu 2").unwrap(), 0);
        assert_eq!(
            tracks.sorted_by_name().collect::<Vec<_>>(),
            vec![("cpu 0", 1), ("cpu 2", 0)]
        );
    }

    #[test]
    fn test_time_split() {
        let record = EventRecord {
            time: 0x1_0000_0002,
            track: 0,
            event_code: 0,
            datum: 0,
        };
        assert_eq!(record.time_hi(), 1);
        assert_eq!(record.time_lo(), 2);
    }
}
