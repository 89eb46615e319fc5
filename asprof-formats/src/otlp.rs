//! OTLP profile output: the pprof `Profile` message assembled through
//! [`ProtoBuffer`], optionally gzip-compressed (`.pb.gz`).

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexSet;
use rustc_hash::FxHashMap;

use crate::protobuf::ProtoBuffer;

// Field numbers of the pprof Profile message.
mod field {
    pub const SAMPLE_TYPE: u32 = 1;
    pub const SAMPLE: u32 = 2;
    pub const LOCATION: u32 = 4;
    pub const FUNCTION: u32 = 5;
    pub const STRING_TABLE: u32 = 6;
    pub const TIME_NANOS: u32 = 9;
    pub const DURATION_NANOS: u32 = 10;
    pub const PERIOD_TYPE: u32 = 11;
    pub const PERIOD: u32 = 12;

    pub const VALUE_TYPE_TYPE: u32 = 1;
    pub const VALUE_TYPE_UNIT: u32 = 2;

    pub const SAMPLE_LOCATION_ID: u32 = 1;
    pub const SAMPLE_VALUE: u32 = 2;

    pub const LOCATION_ID: u32 = 1;
    pub const LOCATION_LINE: u32 = 4;
    pub const LINE_FUNCTION_ID: u32 = 1;

    pub const FUNCTION_ID: u32 = 1;
    pub const FUNCTION_NAME: u32 = 2;
}

/// Accumulates samples keyed by rendered frame names and emits one pprof
/// profile. Location and function tables are deduplicated per name; string
/// table index 0 is the empty string as the format requires.
pub struct OtlpProfile {
    strings: IndexSet<String>,
    // frame name string index -> (location id, function id); ids are 1-based.
    locations: FxHashMap<u32, u64>,
    location_order: Vec<u32>,
    samples: Vec<(Vec<u64>, i64)>,
    sample_type: (u32, u32),
    period_type: (u32, u32),
    period: i64,
    time_nanos: i64,
    duration_nanos: i64,
}

impl OtlpProfile {
    /// `sample_type`/`unit` name the aggregated value, e.g. ("cpu", "nanoseconds")
    /// or ("alloc", "bytes").
    pub fn new(sample_type: &str, unit: &str, period: i64, time_nanos: i64, duration_nanos: i64) -> Self {
        let mut strings = IndexSet::new();
        strings.insert(String::new());
        let type_index = Self::intern_into(&mut strings, sample_type);
        let unit_index = Self::intern_into(&mut strings, unit);
        OtlpProfile {
            strings,
            locations: FxHashMap::default(),
            location_order: Vec::new(),
            samples: Vec::new(),
            sample_type: (type_index, unit_index),
            period_type: (type_index, unit_index),
            period,
            time_nanos,
            duration_nanos,
        }
    }

    fn intern_into(strings: &mut IndexSet<String>, s: &str) -> u32 {
        match strings.get_index_of(s) {
            Some(index) => index as u32,
            None => strings.insert_full(s.to_owned()).0 as u32,
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        Self::intern_into(&mut self.strings, s)
    }

    fn location_id(&mut self, frame: &str) -> u64 {
        let name_index = self.intern(frame);
        if let Some(&id) = self.locations.get(&name_index) {
            return id;
        }
        let id = self.location_order.len() as u64 + 1;
        self.locations.insert(name_index, id);
        self.location_order.push(name_index);
        id
    }

    /// Adds one sample; frames ordered leaf first, per the pprof convention.
    pub fn add_sample(&mut self, frames_leaf_first: &[&str], value: i64) {
        let location_ids = frames_leaf_first
            .iter()
            .map(|frame| self.location_id(frame))
            .collect();
        self.samples.push((location_ids, value));
    }

    fn encode(&self) -> ProtoBuffer {
        let mut buf = ProtoBuffer::with_capacity(4096);

        let mark = buf.start_message(field::SAMPLE_TYPE);
        buf.field_u32(field::VALUE_TYPE_TYPE, self.sample_type.0);
        buf.field_u32(field::VALUE_TYPE_UNIT, self.sample_type.1);
        buf.commit_message(mark);

        for (location_ids, value) in &self.samples {
            let mark = buf.start_message(field::SAMPLE);
            buf.field_packed_u64(field::SAMPLE_LOCATION_ID, location_ids);
            buf.field_packed_i64(field::SAMPLE_VALUE, &[*value]);
            buf.commit_message(mark);
        }

        for (i, &name_index) in self.location_order.iter().enumerate() {
            let id = i as u64 + 1;
            let mark = buf.start_message(field::LOCATION);
            buf.field_u64(field::LOCATION_ID, id);
            let line = buf.start_message(field::LOCATION_LINE);
            buf.field_u64(field::LINE_FUNCTION_ID, id);
            buf.commit_message(line);
            buf.commit_message(mark);

            // One function per location; both share the id space.
            let mark = buf.start_message(field::FUNCTION);
            buf.field_u64(field::FUNCTION_ID, id);
            buf.field_u32(field::FUNCTION_NAME, name_index);
            buf.commit_message(mark);
        }

        for s in &self.strings {
            buf.field_str(field::STRING_TABLE, s);
        }

        buf.field_i64(field::TIME_NANOS, self.time_nanos);
        buf.field_i64(field::DURATION_NANOS, self.duration_nanos);
        let mark = buf.start_message(field::PERIOD_TYPE);
        buf.field_u32(field::VALUE_TYPE_TYPE, self.period_type.0);
        buf.field_u32(field::VALUE_TYPE_UNIT, self.period_type.1);
        buf.commit_message(mark);
        buf.field_i64(field::PERIOD, self.period);

        buf
    }

    /// Writes the raw protobuf message.
    pub fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.encode().data())
    }

    /// Writes the gzip-compressed message (`.pb.gz`).
    pub fn write_gzipped<W: Write>(&self, out: W) -> io::Result<()> {
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder.write_all(self.encode().data())?;
        encoder.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn string_table_starts_empty() {
        let profile = OtlpProfile::new("cpu", "nanoseconds", 10_000_000, 0, 0);
        assert_eq!(profile.strings.get_index(0).unwrap(), "");
    }

    #[test]
    fn locations_are_deduplicated() {
        let mut profile = OtlpProfile::new("alloc", "bytes", 0, 0, 0);
        profile.add_sample(&["leaf", "root"], 100);
        profile.add_sample(&["leaf", "root"], 200);
        profile.add_sample(&["other", "root"], 1);
        assert_eq!(profile.location_order.len(), 3);
        assert_eq!(profile.samples.len(), 3);
        assert_eq!(profile.samples[0].0, profile.samples[1].0);
    }

    #[test]
    fn gzip_output_decompresses_to_raw_message() {
        let mut profile = OtlpProfile::new("cpu", "nanoseconds", 10_000_000, 1, 2);
        profile.add_sample(&["work", "main"], 42);

        let mut raw = Vec::new();
        profile.write(&mut raw).unwrap();

        let mut gz = Vec::new();
        profile.write_gzipped(&mut gz).unwrap();

        let mut decompressed = Vec::new();
        GzDecoder::new(&gz[..]).read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, raw);
        // The string table carries the frame names.
        let text = String::from_utf8_lossy(&raw).into_owned();
        assert!(text.contains("work") && text.contains("main"));
    }
}
