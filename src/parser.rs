//! Line-oriented record parser.
//!
//! The firmware emits `<time_ms>,<value>\r\n`. Serial noise can inject stray
//! bytes anywhere, so each complete segment is reduced to digits and commas
//! before it is split. A segment that still does not look like a record is
//! dropped and reported in [`ParsedChunk::dropped`]; it never fails the batch.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{DaqError, RecordError, Result};
use crate::protocol::LINE_DELIMITER;
use crate::series::Sample;

/// Full-scale ADC code of the 10-bit converter.
const ADC_FULL_SCALE: f64 = 1023.0;

/// Reference voltage the ADC code is scaled to.
const ADC_REFERENCE_V: f64 = 5.0;

/// Absorbance is sent as fixed-point thousandths.
const ABSORBANCE_SCALE: f64 = 1000.0;

/// Turns the second field of a record into a physical value.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueDecoder {
    /// 0-1023 ADC code scaled linearly to 0-5 V.
    #[default]
    Voltage,
    /// Absorbance in thousandths.
    Absorbance,
    /// Caller-supplied conversion. Not available from configuration files.
    #[serde(skip)]
    Custom(Arc<dyn Fn(&str) -> Option<f64> + Send + Sync>),
}

impl fmt::Debug for ValueDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueDecoder::Voltage => f.write_str("Voltage"),
            ValueDecoder::Absorbance => f.write_str("Absorbance"),
            ValueDecoder::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ValueDecoder {
    pub fn custom<F>(decode: F) -> Self
    where
        F: Fn(&str) -> Option<f64> + Send + Sync + 'static,
    {
        ValueDecoder::Custom(Arc::new(decode))
    }

    /// Decode a digits-only field.
    pub fn decode(&self, field: &str) -> Option<f64> {
        match self {
            ValueDecoder::Voltage => field
                .parse::<u64>()
                .ok()
                .map(|code| code as f64 * ADC_REFERENCE_V / ADC_FULL_SCALE),
            ValueDecoder::Absorbance => field.parse::<f64>().ok().map(|a| a / ABSORBANCE_SCALE),
            ValueDecoder::Custom(decode) => decode(field),
        }
    }

    /// Unit label for display.
    pub fn unit(&self) -> &'static str {
        match self {
            ValueDecoder::Voltage => "V",
            ValueDecoder::Absorbance => "A",
            ValueDecoder::Custom(_) => "",
        }
    }
}

/// Result of parsing one raw chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChunk {
    /// Well-formed records, in arrival order.
    pub samples: Vec<Sample>,
    /// Bytes after the last delimiter, verbatim. Prefix them to the next read.
    pub remainder: Vec<u8>,
    /// Complete segments that were not valid records.
    pub dropped: Vec<RecordError>,
}

impl ParsedChunk {
    /// No complete segment was present at all.
    pub fn is_pending(&self) -> bool {
        self.samples.is_empty() && self.dropped.is_empty()
    }
}

/// Parse every delimiter-terminated record in `raw`.
pub fn parse(raw: &[u8], decoder: &ValueDecoder) -> ParsedChunk {
    let mut segments = split_segments(raw);
    // The final segment was not followed by a delimiter, so it may be cut short.
    let remainder = segments.pop().unwrap_or_default().to_vec();

    let mut chunk = ParsedChunk {
        samples: Vec::with_capacity(segments.len()),
        remainder,
        dropped: Vec::new(),
    };
    for segment in segments {
        match parse_record(segment, decoder) {
            Ok(sample) => chunk.samples.push(sample),
            Err(e) => chunk.dropped.push(e),
        }
    }
    chunk
}

/// Parse one record after discarding everything but digits and commas.
pub fn parse_record(segment: &[u8], decoder: &ValueDecoder) -> std::result::Result<Sample, RecordError> {
    let cleaned: String = segment
        .iter()
        .filter(|b| b.is_ascii_digit() || **b == b',')
        .map(|&b| b as char)
        .collect();

    let fields: Vec<&str> = cleaned.split(',').collect();
    let [time, value] = fields.as_slice() else {
        return Err(RecordError::FieldCount(fields.len()));
    };

    let timestamp_ms = time
        .parse::<u64>()
        .map_err(|_| RecordError::Timestamp(time.to_string()))?;
    let value = decoder
        .decode(value)
        .ok_or_else(|| RecordError::Value(value.to_string()))?;

    Ok(Sample::new(timestamp_ms, value))
}

/// Parse the single line the firmware sends back for a sample request.
pub fn parse_reply(line: &[u8], decoder: &ValueDecoder) -> Result<Sample> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_end_matches(['\r', '\n']);
    parse_record(trimmed.as_bytes(), decoder)
        .map_err(|e| DaqError::MalformedReply(format!("{trimmed:?}: {e}")))
}

fn split_segments(raw: &[u8]) -> Vec<&[u8]> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + LINE_DELIMITER.len() <= raw.len() {
        if raw[i..].starts_with(LINE_DELIMITER) {
            segments.push(&raw[start..i]);
            i += LINE_DELIMITER.len();
            start = i;
        } else {
            i += 1;
        }
    }
    segments.push(&raw[start..]);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volts(code: u32) -> f64 {
        code as f64 * 5.0 / 1023.0
    }

    fn stream(n: u64) -> Vec<u8> {
        (0..n)
            .flat_map(|i| format!("{},{}\r\n", 1000 + 20 * i, (i * 37) % 1024).into_bytes())
            .collect()
    }

    #[test]
    fn parses_complete_records_and_keeps_tail() {
        let chunk = parse(b"100,512\r\n200,1023\r\n30", &ValueDecoder::Voltage);
        assert_eq!(
            chunk.samples,
            vec![Sample::new(100, volts(512)), Sample::new(200, volts(1023))]
        );
        assert!((chunk.samples[1].value - 5.0).abs() < 1e-12);
        assert_eq!(chunk.remainder, b"30");
        assert!(chunk.dropped.is_empty());
    }

    #[test]
    fn empty_input_yields_nothing() {
        let chunk = parse(b"", &ValueDecoder::Voltage);
        assert!(chunk.samples.is_empty());
        assert!(chunk.remainder.is_empty());
        assert!(chunk.is_pending());
    }

    #[test]
    fn boundary_aligned_input_leaves_no_remainder() {
        for n in 1..6 {
            let chunk = parse(&stream(n), &ValueDecoder::Voltage);
            assert_eq!(chunk.samples.len(), n as usize);
            assert!(chunk.remainder.is_empty());
        }
    }

    #[test]
    fn malformed_segment_does_not_affect_siblings() {
        let chunk = parse(b"12,34\r\nbad,34\r\n13,35\r\n", &ValueDecoder::Voltage);
        let times: Vec<u64> = chunk.samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(times, vec![12, 13]);
        assert_eq!(chunk.dropped, vec![RecordError::Timestamp(String::new())]);
    }

    #[test]
    fn line_noise_is_stripped_before_splitting() {
        let chunk = parse(b"\x0012,3\xff4\r\n", &ValueDecoder::Voltage);
        assert_eq!(chunk.samples, vec![Sample::new(12, volts(34))]);
    }

    #[test]
    fn wrong_field_count_is_dropped() {
        let chunk = parse(b"1,2,3\r\n\r\n7\r\n", &ValueDecoder::Voltage);
        assert!(chunk.samples.is_empty());
        assert_eq!(
            chunk.dropped,
            vec![
                RecordError::FieldCount(3),
                RecordError::FieldCount(1),
                RecordError::FieldCount(1),
            ]
        );
    }

    #[test]
    fn splitting_anywhere_gives_the_same_samples() {
        let raw = stream(6);
        let whole = parse(&raw, &ValueDecoder::Voltage);

        for split in 0..=raw.len() {
            let (raw1, raw2) = raw.split_at(split);
            let first = parse(raw1, &ValueDecoder::Voltage);
            let mut carried = first.remainder.clone();
            carried.extend_from_slice(raw2);
            let second = parse(&carried, &ValueDecoder::Voltage);

            let mut samples = first.samples;
            samples.extend(second.samples);
            assert_eq!(samples, whole.samples, "split at {split}");
            assert_eq!(second.remainder, whole.remainder, "split at {split}");
        }
    }

    #[test]
    fn absorbance_is_thousandths() {
        let chunk = parse(b"5,1250\r\n", &ValueDecoder::Absorbance);
        assert_eq!(chunk.samples, vec![Sample::new(5, 1.25)]);
    }

    #[test]
    fn custom_decoder_is_used() {
        let raw_counts = ValueDecoder::custom(|f| f.parse::<f64>().ok());
        let chunk = parse(b"5,77\r\n", &raw_counts);
        assert_eq!(chunk.samples, vec![Sample::new(5, 77.0)]);
    }

    #[test]
    fn reply_parsing_reports_malformed_lines() {
        let sample = parse_reply(b"42,1000\r\n", &ValueDecoder::Absorbance).unwrap();
        assert_eq!(sample, Sample::new(42, 1.0));

        let err = parse_reply(b"oops\r\n", &ValueDecoder::Voltage).unwrap_err();
        assert!(matches!(err, DaqError::MalformedReply(_)));
    }
}
