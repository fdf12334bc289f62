use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::ser::Formatter;
use std::io::{self, Write};

/// Reported for a channel with no applicable data.
pub const PLACEHOLDER: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelValue {
    pub name: String,
    pub value: String,
}

/// One tick's aggregated output. Serializes as a flat object: `timestamp` first,
/// then one string field per channel in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp_ms: i64,
    pub channels: Vec<ChannelValue>,
}

impl Snapshot {
    #[cfg(test)]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|channel| channel.name == name)
            .map(|channel| channel.value.as_str())
    }

    /// Writes the snapshot as a single line and flushes, so a consumer reading the
    /// stream sees each tick as soon as it is processed.
    pub fn write_line<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut ser = serde_json::Serializer::with_formatter(&mut *out, LineFormatter);
        self.serialize(&mut ser).map_err(io::Error::from)?;
        out.write_all(b"\n")?;
        out.flush()
    }

    #[cfg(test)]
    pub fn to_line(&self) -> String {
        let mut buf = Vec::new();
        self.write_line(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.channels.len() + 1))?;
        map.serialize_entry("timestamp", &self.timestamp_ms)?;
        for channel in &self.channels {
            map.serialize_entry(&channel.name, &channel.value)?;
        }
        map.end()
    }
}

/// Compact JSON with a space after `:` and `,`, the layout downstream consumers
/// already parse.
struct LineFormatter;

impl Formatter for LineFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(values: &[(&str, &str)]) -> Snapshot {
        Snapshot {
            timestamp_ms: 1_699_999_999_123,
            channels: values
                .iter()
                .map(|(name, value)| ChannelValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn renders_observed_line_layout() {
        let snap = snapshot(&[("out1", "42.0"), ("out2", PLACEHOLDER), ("out3", "3.5")]);
        assert_eq!(
            snap.to_line(),
            "{\"timestamp\": 1699999999123, \"out1\": \"42.0\", \"out2\": \"--\", \"out3\": \"3.5\"}\n"
        );
    }

    #[test]
    fn escapes_hostile_stream_text() {
        let snap = snapshot(&[("out1", "4\"2")]);
        let line = snap.to_line();
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["out1"], "4\"2");
        assert_eq!(parsed["timestamp"], 1_699_999_999_123i64);
    }

    #[test]
    fn value_lookup_by_name() {
        let snap = snapshot(&[("out1", "1"), ("out3", "3")]);
        assert_eq!(snap.value("out3"), Some("3"));
        assert_eq!(snap.value("out2"), None);
    }

    #[test]
    fn write_line_emits_exactly_one_line() {
        let snap = snapshot(&[("out1", "1")]);
        let mut out = Vec::new();
        snap.write_line(&mut out).unwrap();
        snap.write_line(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
