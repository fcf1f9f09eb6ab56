//! Canonical JSON encoding used for block hashing.
//!
//! Every node must produce the same bytes for the same block, so object keys
//! are sorted recursively, separators are `", "` and `": "`, and everything
//! outside printable ASCII is written as a lowercase `\uXXXX` escape. Floats
//! use the shortest round-trip digits laid out like Python's `repr`. This
//! matches `json.dumps(value, sort_keys=True)` byte for byte.

use std::io;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::ser::Formatter;
use serde_json::Value;

/// Encodes a JSON value into its canonical byte form
pub fn encode(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    Sorted(value).serialize(&mut serializer)?;
    Ok(buf)
}

/// Serializes a value with object keys in ascending order, whatever the
/// underlying map preserves
struct Sorted<'a>(&'a Value);

impl Serialize for Sorted<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));

                let mut state = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    state.serialize_entry(key, &Sorted(value))?;
                }
                state.end()
            }
            Value::Array(items) => {
                let mut state = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    state.serialize_element(&Sorted(item))?;
                }
                state.end()
            }
            other => other.serialize(serializer),
        }
    }
}

struct CanonicalFormatter;

impl CanonicalFormatter {
    fn separator<W>(writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }
}

impl Formatter for CanonicalFormatter {
    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(float_repr(value).as_bytes())
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        Self::separator(writer, first)
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        Self::separator(writer, first)
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        // Quotes, backslashes and control characters never reach a fragment
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Formats a finite float the way Python's `repr` does
///
/// Plain notation while the decimal exponent is in `-4..16`, otherwise
/// `d.ddde+XX` with a signed exponent of at least two digits. Integral
/// values keep a trailing `.0`.
fn float_repr(value: f64) -> String {
    // `{:e}` yields the shortest round-trip digits, e.g. `-1.25e-7`
    let scientific = format!("{:e}", value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if !(-4..16).contains(&exponent) {
        let (lead, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() { String::new() } else { format!(".{}", rest) };
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}{}{}e{}{:02}", sign, lead, fraction, exp_sign, exponent.abs());
    }

    if exponent < 0 {
        let zeros = "0".repeat((-exponent - 1) as usize);
        return format!("{}0.{}{}", sign, zeros, digits);
    }

    let int_len = exponent as usize + 1;
    if digits.len() <= int_len {
        let padding = "0".repeat(int_len - digits.len());
        format!("{}{}{}.0", sign, digits, padding)
    } else {
        let (int_part, fraction) = digits.split_at(int_len);
        format!("{}{}.{}", sign, int_part, fraction)
    }
}
