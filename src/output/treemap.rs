//! Semicolon separated stack rows for the treemap view.
//!
//! ```text
//! value;1;2;3
//! 5;firefox;[unknown];libxul.so
//! ```
//!
//! The header numbers one column per frame of the deepest stack.

use std::io::{self, Write};

use crate::records::StackDatum;

pub const SEPARATOR: &str = ";";

pub fn write_treemap<W: Write>(mut out: W, stacks: &[StackDatum]) -> io::Result<usize> {
    let depth = stacks.iter().map(|s| s.frames.len()).max().unwrap_or(0);
    let mut header = String::from("value");
    for column in 1..=depth {
        header.push_str(SEPARATOR);
        header.push_str(&column.to_string());
    }
    writeln!(out, "{}", header)?;

    for stack in stacks {
        write!(out, "{}", stack.time)?;
        for frame in &stack.frames {
            write!(out, "{}{}", SEPARATOR, frame)?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(stacks.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(time: u64, frames: &[&str]) -> StackDatum {
        StackDatum {
            time,
            frames: frames.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_header_follows_deepest_stack() {
        let stacks = vec![
            stack(5, &["firefox", "[unknown]", "libxul.so"]),
            stack(2, &["bash", "main"]),
        ];
        let mut out = Vec::new();
        assert_eq!(write_treemap(&mut out, &stacks).unwrap(), 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "value;1;2;3\n5;firefox;[unknown];libxul.so\n2;bash;main\n"
        );
    }

    #[test]
    fn test_no_stacks() {
        let mut out = Vec::new();
        write_treemap(&mut out, &[]).unwrap();
        assert_eq!(out, b"value\n");
    }
}
