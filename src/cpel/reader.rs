//! Reading CPEL files back, for validation.

use super::tables::EventRecord;
use super::{
    EVENT_ENTRY_LEN, EVENT_TYPE_ENTRY_LEN, FILE_HEADER_LEN, SECTION_EVENTS, SECTION_EVENT_TYPES,
    SECTION_STRINGS, SECTION_TRACKS, TABLE_NAME_LEN, TRACK_ENTRY_LEN,
};
use crate::error::CpelError;
use crate::records::SchedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeEntry {
    pub code: u32,
    pub name_offset: u32,
    pub format_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEntry {
    pub id: u32,
    pub name_offset: u32,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CpelError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| CpelError::Invalid(format!("truncated {}", what)))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self, what: &str) -> Result<u32, CpelError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// A parsed big-endian CPEL file.
#[derive(Debug, Clone, Default)]
pub struct CpelFile {
    pub version: u8,
    pub section_count: u16,
    pub created_at: u32,
    pub strings: Vec<u8>,
    pub event_types: Vec<EventTypeEntry>,
    pub tracks: Vec<TrackEntry>,
    pub events: Vec<EventRecord>,
    pub ticks_per_us: u32,
}

/// Parse a table header and return its entry count.
fn table_header(section: &mut Cursor<'_>, what: &str) -> Result<u32, CpelError> {
    section.take(TABLE_NAME_LEN, what)?;
    section.u32(what)
}

fn check_entries(section: &Cursor<'_>, count: u32, entry_len: usize, what: &str) -> Result<(), CpelError> {
    let expected = (count as usize).checked_mul(entry_len);
    if expected != Some(section.buf.len() - section.pos) {
        return Err(CpelError::Invalid(format!(
            "{} section length does not match {} entries",
            what, count
        )));
    }
    Ok(())
}

impl CpelFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, CpelError> {
        let mut cursor = Cursor { buf: bytes, pos: 0 };
        let header = cursor.take(FILE_HEADER_LEN, "file header")?;
        if header[0] & 0x80 != 0 {
            return Err(CpelError::Invalid("little-endian files are not supported".to_string()));
        }
        let mut file = CpelFile {
            version: header[0] & 0x7f,
            section_count: u16::from_be_bytes([header[2], header[3]]),
            created_at: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            ..CpelFile::default()
        };

        for _ in 0..file.section_count {
            let id = cursor.u32("section header")?;
            let len = cursor.u32("section header")? as usize;
            let mut section = Cursor {
                buf: cursor.take(len, "section")?,
                pos: 0,
            };
            match id {
                SECTION_STRINGS => file.strings = section.buf.to_vec(),
                SECTION_EVENT_TYPES => {
                    let count = table_header(&mut section, "event type table")?;
                    check_entries(&section, count, EVENT_TYPE_ENTRY_LEN, "event type")?;
                    while !section.is_empty() {
                        file.event_types.push(EventTypeEntry {
                            code: section.u32("event type")?,
                            name_offset: section.u32("event type")?,
                            format_offset: section.u32("event type")?,
                        });
                    }
                }
                SECTION_TRACKS => {
                    let count = table_header(&mut section, "track table")?;
                    check_entries(&section, count, TRACK_ENTRY_LEN, "track")?;
                    while !section.is_empty() {
                        file.tracks.push(TrackEntry {
                            id: section.u32("track")?,
                            name_offset: section.u32("track")?,
                        });
                    }
                }
                SECTION_EVENTS => {
                    let count = table_header(&mut section, "event table")?;
                    file.ticks_per_us = section.u32("event table")?;
                    check_entries(&section, count, EVENT_ENTRY_LEN, "event")?;
                    while !section.is_empty() {
                        let hi = section.u32("event")?;
                        let lo = section.u32("event")?;
                        file.events.push(EventRecord {
                            time: (u64::from(hi) << 32) | u64::from(lo),
                            track: section.u32("event")?,
                            event_code: section.u32("event")?,
                            datum: section.u32("event")?,
                        });
                    }
                }
                other => tracing::debug!("Skipping unknown CPEL section {}", other),
            }
        }
        if !cursor.is_empty() {
            return Err(CpelError::Invalid("trailing bytes after last section".to_string()));
        }
        Ok(file)
    }

    /// The NUL-terminated string starting at `offset` in the string table.
    pub fn string_at(&self, offset: u32) -> Option<&str> {
        let rest = self.strings.get(offset as usize..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&rest[..end]).ok()
    }

    /// All strings of the table in storage order, padding excluded.
    pub fn strings(&self) -> Vec<&str> {
        let used = self
            .strings
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        self.strings[..used]
            .split(|&b| b == 0)
            .filter_map(|s| std::str::from_utf8(s).ok())
            .collect()
    }

    fn track_name(&self, id: u32) -> Option<&str> {
        let track = self.tracks.iter().find(|t| t.id == id)?;
        self.string_at(track.name_offset)
    }

    fn event_type_name(&self, code: u32) -> Option<&str> {
        let entry = self.event_types.iter().find(|t| t.code == code)?;
        self.string_at(entry.name_offset)
    }

    /// Rebuild the scheduling events, resolving every reference.
    pub fn sched_events(&self) -> Result<Vec<SchedEvent>, CpelError> {
        self.events
            .iter()
            .map(|event| -> Result<SchedEvent, CpelError> {
                let missing = |what: &str| CpelError::Invalid(format!("dangling {} reference", what));
                Ok(SchedEvent {
                    datum: self.string_at(event.datum).ok_or_else(|| missing("datum"))?.to_string(),
                    track: self.track_name(event.track).ok_or_else(|| missing("track"))?.to_string(),
                    time: event.time,
                    event_type: self
                        .event_type_name(event.event_code)
                        .ok_or_else(|| missing("event type"))?
                        .to_string(),
                })
            })
            .collect()
    }
}
