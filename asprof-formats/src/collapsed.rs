//! Collapsed-stack text output: one line per distinct stack, frames joined
//! with `;` from root to leaf, followed by a space and the sample weight.
//! The format is accepted by most flame graph tooling.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

pub struct CollapsedWriter<W: Write> {
    out: W,
}

impl<W: Write> CollapsedWriter<W> {
    pub fn new(out: W) -> Self {
        CollapsedWriter { out }
    }

    /// Writes one stack, frames ordered root first.
    pub fn write_stack(&mut self, frames: &[&str], weight: u64) -> io::Result<()> {
        if weight == 0 {
            return Ok(());
        }
        let mut first = true;
        for frame in frames {
            if !first {
                self.out.write_all(b";")?;
            }
            self.out.write_all(frame.as_bytes())?;
            first = false;
        }
        writeln!(self.out, " {weight}")
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Parses collapsed-stack text back into a stack → weight map. Repeated
/// stacks are summed. Lines without a trailing weight are rejected.
pub fn parse_collapsed<R: BufRead>(input: R) -> io::Result<BTreeMap<Vec<String>, u64>> {
    let mut stacks = BTreeMap::new();
    for line in input.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (stack, weight) = line
            .rsplit_once(' ')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing weight"))?;
        let weight: u64 = weight
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let frames: Vec<String> = stack.split(';').map(str::to_owned).collect();
        *stacks.entry(frames).or_insert(0) += weight;
    }
    Ok(stacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut writer = CollapsedWriter::new(Vec::new());
        writer.write_stack(&["main", "run", "work"], 42).unwrap();
        writer.write_stack(&["main", "idle"], 7).unwrap();
        writer.write_stack(&["main", "run", "work"], 3).unwrap();
        let bytes = writer.finish().unwrap();

        let parsed = parse_collapsed(&bytes[..]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[&vec!["main".to_owned(), "run".to_owned(), "work".to_owned()]],
            45
        );
        assert_eq!(parsed[&vec!["main".to_owned(), "idle".to_owned()]], 7);
    }

    #[test]
    fn zero_weight_stacks_are_skipped() {
        let mut writer = CollapsedWriter::new(Vec::new());
        writer.write_stack(&["main"], 0).unwrap();
        let bytes = writer.finish().unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn rejects_line_without_weight() {
        assert!(parse_collapsed(&b"main;run\n"[..]).is_err());
    }
}
