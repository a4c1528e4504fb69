//! Allocation call stacks through bcc's `mallocstacks.py`.
//!
//! `mallocstacks.py -f <secs>` prints folded stacks, one per line:
//! `<bytes>;<comm>;<frame>;<frame>...`, outermost frame first. Frame text is
//! kept verbatim, spaces and punctuation included.

use super::{skip_line, whole_seconds, CollectContext, DataSource, COMPLETION_SLACK};
use crate::diagnostics::SharedSink;
use crate::error::CollectError;
use crate::records::{RecordStream, StackDatum};
use crate::supervisor::Expectation;
use crate::utils::OwnedLines;

pub const FIELD_SEPARATOR: char = ';';

pub fn parse_folded_line(line: &str) -> Option<StackDatum> {
    let mut fields = line.split(FIELD_SEPARATOR);
    let weight = fields.next()?.trim().parse().ok()?;
    let frames: Vec<String> = fields.map(str::to_string).collect();
    if frames.is_empty() {
        return None;
    }
    Some(StackDatum {
        time: weight,
        frames,
    })
}

#[derive(Debug, Default, Clone)]
pub struct MallocStacks;

impl MallocStacks {
    pub fn new() -> Self {
        MallocStacks
    }
}

impl DataSource for MallocStacks {
    type Raw = String;
    type Record = StackDatum;

    fn name(&self) -> &'static str {
        "malloc stacks"
    }

    fn min_kernel(&self) -> &'static str {
        "4.6.0"
    }

    fn gather(&self, ctx: &CollectContext) -> Result<String, CollectError> {
        let mallocstacks = &ctx.tools.mallocstacks;
        let invocation = mallocstacks
            .invocation(Expectation::completes())
            .args(["-f".to_string(), whole_seconds(ctx.duration).to_string()]);
        ctx.supervisor
            .run(&invocation, ctx.duration + COMPLETION_SLACK)?
            .into_stdout(mallocstacks.program())
    }

    fn transform(&self, raw: String, diagnostics: SharedSink) -> RecordStream<StackDatum> {
        Box::new(OwnedLines::new(raw).filter_map(move |line| {
            if line.trim().is_empty() {
                return None;
            }
            let datum = parse_folded_line(&line);
            if datum.is_none() {
                skip_line(diagnostics.as_ref(), "mallocstacks", &line);
            }
            datum
        }))
    }
}
