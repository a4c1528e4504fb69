use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use tempfile::NamedTempFile;

use super::tables::TraceTables;
use super::{
    ENDIAN_BIT, EVENT_ENTRY_LEN, EVENT_TABLE_HEADER_LEN, EVENT_TYPE_ENTRY_LEN, FILE_VERSION,
    FORMAT_STRING, SECTION_COUNT, SECTION_EVENTS, SECTION_EVENT_TYPES, SECTION_STRINGS,
    SECTION_TRACKS, STRING_TABLE_NAME, TABLE_HEADER_LEN, TABLE_NAME_LEN, TICKS_PER_US,
    TRACK_ENTRY_LEN,
};
use crate::error::CpelError;
use crate::records::SchedEvent;

/// What ended up in a written trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpelSummary {
    pub events: usize,
    pub event_types: usize,
    pub tracks: usize,
    pub strings: usize,
    pub bytes: u64,
}

impl CpelSummary {
    fn new(tables: &TraceTables, bytes: u64) -> Self {
        CpelSummary {
            events: tables.events.len(),
            event_types: tables.event_types.len(),
            tracks: tables.tracks.len(),
            strings: tables.strings.len(),
            bytes,
        }
    }
}

/// Writes scheduling events as a CPEL trace.
///
/// The creation time stored in the header is fixed when the writer is made,
/// so one writer always produces the same bytes for the same events.
#[derive(Debug, Clone, Copy)]
pub struct CpelWriter {
    created_at: u32,
}

impl Default for CpelWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn section_len(what: &'static str, header: usize, entries: usize, entry_len: usize) -> Result<u32, CpelError> {
    entries
        .checked_mul(entry_len)
        .and_then(|len| len.checked_add(header))
        .and_then(|len| u32::try_from(len).ok())
        .ok_or(CpelError::TooLarge { what })
}

fn count(what: &'static str, n: usize) -> Result<u32, CpelError> {
    u32::try_from(n).map_err(|_| CpelError::TooLarge { what })
}

fn write_table_header<W: Write>(out: &mut W, entries: u32) -> Result<(), CpelError> {
    let mut name = [0u8; TABLE_NAME_LEN];
    name[..STRING_TABLE_NAME.len()].copy_from_slice(STRING_TABLE_NAME.as_bytes());
    out.write_all(&name)?;
    out.write_all(&entries.to_be_bytes())?;
    Ok(())
}

impl CpelWriter {
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        CpelWriter {
            created_at: u32::try_from(now).unwrap_or(u32::MAX),
        }
    }

    /// A writer stamping files with `created_at` seconds since the epoch.
    pub fn with_timestamp(created_at: u32) -> Self {
        CpelWriter { created_at }
    }

    pub fn created_at(&self) -> u32 {
        self.created_at
    }

    /// Encode `tables` to `out`. Nothing is buffered here; wrap `out` as needed.
    pub fn encode<W: Write>(&self, tables: &TraceTables, out: &mut W) -> Result<(), CpelError> {
        // Compute everything fallible up front.
        let strings = tables.strings.padded_bytes();
        let strings_len = count("string table", strings.len())?;
        let types_len = section_len(
            "event type section",
            TABLE_HEADER_LEN,
            tables.event_types.len(),
            EVENT_TYPE_ENTRY_LEN,
        )?;
        let tracks_len = section_len(
            "track section",
            TABLE_HEADER_LEN,
            tables.tracks.len(),
            TRACK_ENTRY_LEN,
        )?;
        let events_len = section_len(
            "event section",
            EVENT_TABLE_HEADER_LEN,
            tables.events.len(),
            EVENT_ENTRY_LEN,
        )?;
        let format = tables
            .strings
            .offset(FORMAT_STRING)
            .ok_or_else(|| CpelError::Invalid("format string missing".to_string()))?;

        out.write_all(&[(ENDIAN_BIT << 7) | FILE_VERSION, 0])?;
        out.write_all(&SECTION_COUNT.to_be_bytes())?;
        out.write_all(&self.created_at.to_be_bytes())?;

        out.write_all(&SECTION_STRINGS.to_be_bytes())?;
        out.write_all(&strings_len.to_be_bytes())?;
        out.write_all(&strings)?;

        out.write_all(&SECTION_EVENT_TYPES.to_be_bytes())?;
        out.write_all(&types_len.to_be_bytes())?;
        write_table_header(out, count("event types", tables.event_types.len())?)?;
        for (name, code) in tables.event_types.sorted_by_name() {
            let name = tables
                .strings
                .offset(name)
                .ok_or_else(|| CpelError::Invalid(format!("event type {:?} has no string", name)))?;
            out.write_all(&code.to_be_bytes())?;
            out.write_all(&name.to_be_bytes())?;
            out.write_all(&format.to_be_bytes())?;
        }

        out.write_all(&SECTION_TRACKS.to_be_bytes())?;
        out.write_all(&tracks_len.to_be_bytes())?;
        write_table_header(out, count("tracks", tables.tracks.len())?)?;
        for (name, id) in tables.tracks.sorted_by_name() {
            let name = tables
                .strings
                .offset(name)
                .ok_or_else(|| CpelError::Invalid(format!("track {:?} has no string", name)))?;
            out.write_all(&id.to_be_bytes())?;
            out.write_all(&name.to_be_bytes())?;
        }

        out.write_all(&SECTION_EVENTS.to_be_bytes())?;
        out.write_all(&events_len.to_be_bytes())?;
        write_table_header(out, count("events", tables.events.len())?)?;
        out.write_all(&TICKS_PER_US.to_be_bytes())?;
        for event in &tables.events {
            out.write_all(&event.time_hi().to_be_bytes())?;
            out.write_all(&event.time_lo().to_be_bytes())?;
            out.write_all(&event.track.to_be_bytes())?;
            out.write_all(&event.event_code.to_be_bytes())?;
            out.write_all(&event.datum.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes<I>(&self, events: I) -> Result<Vec<u8>, CpelError>
    where
        I: IntoIterator<Item = SchedEvent>,
    {
        let tables = TraceTables::from_events(events)?;
        let mut bytes = Vec::new();
        self.encode(&tables, &mut bytes)?;
        Ok(bytes)
    }

    /// Consume `events` and write them to `path`.
    ///
    /// The trace is written to a temporary file next to `path` and only moved
    /// into place once complete; on error nothing appears at `path`.
    pub fn write<I>(&self, events: I, path: &Path) -> Result<CpelSummary, CpelError>
    where
        I: IntoIterator<Item = SchedEvent>,
    {
        let tables = TraceTables::from_events(events)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            self.encode(&tables, &mut out)?;
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| CpelError::Io(err.error))?;

        let bytes = fs::metadata(path)?.len();
        tracing::debug!(
            "Wrote {} events on {} tracks to {} ({} bytes)",
            tables.events.len(),
            tables.tracks.len(),
            path.display(),
            bytes
        );
        Ok(CpelSummary::new(&tables, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpel::CpelFile;

    fn event(datum: &str, track: &str, time: u64, event_type: &str) -> SchedEvent {
        SchedEvent {
            datum: datum.to_string(),
            track: track.to_string(),
            time,
            event_type: event_type.to_string(),
        }
    }

    fn be32(bytes: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn sample() -> Vec<SchedEvent> {
        vec![
            event("test_name (pid: 1234)", "cpu 2", 11112221, "event_type"),
            event("test_name2 (pid: 1234)", "cpu 1", 11112222, "event_type"),
        ]
    }

    #[test]
    fn test_two_event_layout() {
        let bytes = CpelWriter::with_timestamp(0x5b00_0000).to_bytes(sample()).unwrap();

        assert_eq!(&bytes[..8], &[0x01, 0x00, 0x00, 0x04, 0x5b, 0x00, 0x00, 0x00]);

        // "FileStrtab\0%s\0" + two data + "cpu 2\0" + "event_type\0" + "cpu 1\0"
        let strings_len = be32(&bytes, 12) as usize;
        assert_eq!(be32(&bytes, 8), 1);
        assert_eq!(strings_len % 4, 0);
        let raw: usize = 14 + 22 + 6 + 11 + 23 + 6;
        assert_eq!(strings_len, raw.next_multiple_of(4));
        let strings = &bytes[16..16 + strings_len];
        assert_eq!(&strings[..14], b"FileStrtab\0%s\0");
        assert_eq!(&strings[14..36], b"test_name (pid: 1234)\0");

        let types = 16 + strings_len;
        assert_eq!(be32(&bytes, types), 3);
        assert_eq!(be32(&bytes, types + 4), 68 + 12);
        assert_eq!(&bytes[types + 8..types + 18], b"FileStrtab");
        assert!(bytes[types + 18..types + 72].iter().all(|&b| b == 0));
        assert_eq!(be32(&bytes, types + 72), 1);
        // {code 0, "event_type" offset, "%s" offset}
        assert_eq!(be32(&bytes, types + 76), 0);
        assert_eq!(be32(&bytes, types + 80), 42);
        assert_eq!(be32(&bytes, types + 84), 11);

        let tracks = types + 8 + 68 + 12;
        assert_eq!(be32(&bytes, tracks), 4);
        assert_eq!(be32(&bytes, tracks + 4), 68 + 16);
        assert_eq!(be32(&bytes, tracks + 72), 2);
        // sorted by name: "cpu 1" (id 1) before "cpu 2" (id 0)
        assert_eq!(be32(&bytes, tracks + 76), 1);
        assert_eq!(be32(&bytes, tracks + 80), 76);
        assert_eq!(be32(&bytes, tracks + 84), 0);
        assert_eq!(be32(&bytes, tracks + 88), 36);

        let events = tracks + 8 + 68 + 16;
        assert_eq!(be32(&bytes, events), 5);
        assert_eq!(be32(&bytes, events + 4), 72 + 40);
        assert_eq!(be32(&bytes, events + 72), 2);
        assert_eq!(be32(&bytes, events + 76), 1_000_000);
        let first = events + 80;
        assert_eq!(be32(&bytes, first), 0);
        assert_eq!(be32(&bytes, first + 4), 11112221);
        assert_eq!(be32(&bytes, first + 8), 0);
        assert_eq!(be32(&bytes, first + 12), 0);
        assert_eq!(be32(&bytes, first + 16), 14);
        let second = first + 20;
        assert_eq!(be32(&bytes, second + 8), 1);
        assert_eq!(be32(&bytes, second + 16), 53);
        assert_eq!(bytes.len(), second + 20);
    }

    #[test]
    fn test_output_is_deterministic() {
        let writer = CpelWriter::with_timestamp(42);
        assert_eq!(
            writer.to_bytes(sample()).unwrap(),
            writer.to_bytes(sample()).unwrap()
        );
    }

    #[test]
    fn test_types_sorted_by_name_codes_by_first_sight() {
        let events = vec![
            event("a", "cpu 0", 1, "sched:sched_wakeup"),
            event("b", "cpu 0", 2, "sched:sched_switch"),
        ];
        let bytes = CpelWriter::with_timestamp(0).to_bytes(events).unwrap();
        let file = CpelFile::parse(&bytes).unwrap();
        let names: Vec<_> = file
            .event_types
            .iter()
            .map(|t| (file.string_at(t.name_offset).unwrap(), t.code))
            .collect();
        assert_eq!(
            names,
            vec![("sched:sched_switch", 1), ("sched:sched_wakeup", 0)]
        );
        assert_eq!(file.events[0].event_code, 0);
        assert_eq!(file.events[1].event_code, 1);
    }

    #[test]
    fn test_wide_timestamps_split() {
        let events = vec![event("a", "cpu 0", 0x0000_0003_0000_0007, "x")];
        let bytes = CpelWriter::with_timestamp(0).to_bytes(events).unwrap();
        let file = CpelFile::parse(&bytes).unwrap();
        assert_eq!(file.events[0].time, 0x0000_0003_0000_0007);
    }

    #[test]
    fn test_empty_trace() {
        let bytes = CpelWriter::with_timestamp(0).to_bytes(Vec::new()).unwrap();
        let file = CpelFile::parse(&bytes).unwrap();
        assert!(file.events.is_empty());
        assert!(file.tracks.is_empty());
        assert_eq!(file.ticks_per_us, TICKS_PER_US);
    }

    #[test]
    fn test_write_persists_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.cpel");
        let writer = CpelWriter::with_timestamp(7);
        let summary = writer.write(sample(), &path).unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.tracks, 2);
        assert_eq!(summary.event_types, 1);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(summary.bytes, on_disk.len() as u64);
        assert_eq!(on_disk, writer.to_bytes(sample()).unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_nul_in_datum_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.cpel");
        let events = vec![event("bad\0datum", "cpu 0", 1, "x")];
        let err = CpelWriter::new().write(events, &path).unwrap_err();
        assert!(matches!(err, CpelError::InteriorNul(_)));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("trace.cpel");
        let err = CpelWriter::new().write(sample(), &path).unwrap_err();
        assert!(matches!(err, CpelError::Io(_)));
        assert!(!path.exists());
    }
}
