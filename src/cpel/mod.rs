//! CPEL trace files.
//!
//! A CPEL file is an 8-byte header followed by four sections, all big-endian:
//!
//! | id | section      | payload                                                   |
//! |----|--------------|-----------------------------------------------------------|
//! | 1  | strings      | NUL-terminated strings, padded to a multiple of 4         |
//! | 3  | event types  | table name, count, `{code, name, format}` sorted by name  |
//! | 4  | tracks       | table name, count, `{id, name}` sorted by name            |
//! | 5  | events       | table name, count, ticks/µs, `{time hi, time lo, track, code, datum}` |
//!
//! Every section starts with its id and the byte length of its payload.
//! Names and data are offsets into the string table.

pub mod reader;
pub mod tables;
pub mod writer;

pub use reader::CpelFile;
pub use tables::{CodeTable, EventRecord, EventTypeTable, StringTable, TraceTables, TrackTable};
pub use writer::{CpelSummary, CpelWriter};

/// 0 for big-endian.
pub const ENDIAN_BIT: u8 = 0;
pub const FILE_VERSION: u8 = 1;
pub const SECTION_COUNT: u16 = 4;

pub const STRING_TABLE_NAME: &str = "FileStrtab";
/// Width of the NUL-padded table name field in section headers.
pub const TABLE_NAME_LEN: usize = 64;
/// Format string shared by every event type.
pub const FORMAT_STRING: &str = "%s";
pub const TICKS_PER_US: u32 = 1_000_000;

pub const SECTION_STRINGS: u32 = 1;
pub const SECTION_EVENT_TYPES: u32 = 3;
pub const SECTION_TRACKS: u32 = 4;
pub const SECTION_EVENTS: u32 = 5;

pub const FILE_HEADER_LEN: usize = 8;
pub const EVENT_TYPE_ENTRY_LEN: usize = 12;
pub const TRACK_ENTRY_LEN: usize = 8;
pub const EVENT_ENTRY_LEN: usize = 20;
/// Table name and entry count.
pub const TABLE_HEADER_LEN: usize = TABLE_NAME_LEN + 4;
/// Table name, entry count and ticks per microsecond.
pub const EVENT_TABLE_HEADER_LEN: usize = TABLE_HEADER_LEN + 4;
