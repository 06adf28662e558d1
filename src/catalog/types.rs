use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::CoercionError;

/// Database-agnostic type vocabulary used in SCHEMA messages and coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortableType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Time,
    Binary,
    Decimal { precision: u8, scale: u8 },
    Array(Box<PortableType>),
    Object(Vec<(String, PortableType)>),
}

impl PortableType {
    /// Whether values of this type can serve as an incremental bookmark.
    pub fn is_cursor_capable(&self) -> bool {
        matches!(
            self,
            PortableType::Integer
                | PortableType::Decimal { .. }
                | PortableType::String
                | PortableType::Date
                | PortableType::Time
                | PortableType::Timestamp
        )
    }

    /// JSON Schema fragment for this type.
    pub fn json_schema(&self, nullable: bool) -> serde_json::Value {
        let kind = |name: &str| {
            if nullable {
                json!([name, "null"])
            } else {
                json!([name])
            }
        };

        match self {
            PortableType::String => json!({ "type": kind("string") }),
            PortableType::Integer => json!({ "type": kind("integer") }),
            PortableType::Float => json!({ "type": kind("number") }),
            PortableType::Boolean => json!({ "type": kind("boolean") }),
            PortableType::Timestamp => json!({ "type": kind("string"), "format": "date-time" }),
            PortableType::Date => json!({ "type": kind("string"), "format": "date" }),
            PortableType::Time => json!({ "type": kind("string"), "format": "time" }),
            PortableType::Binary => json!({ "type": kind("string"), "contentEncoding": "base64" }),
            // Kept as a string so no consumer parses it through a binary float
            PortableType::Decimal { precision, scale } => json!({
                "type": kind("string"),
                "format": "decimal",
                "precision": precision,
                "scale": scale,
            }),
            PortableType::Array(item) => json!({
                "type": kind("array"),
                "items": item.json_schema(true),
            }),
            PortableType::Object(fields) => {
                let properties: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.json_schema(true)))
                    .collect();
                json!({ "type": kind("object"), "properties": properties })
            }
        }
    }
}

impl fmt::Display for PortableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortableType::String => f.write_str("string"),
            PortableType::Integer => f.write_str("integer"),
            PortableType::Float => f.write_str("float"),
            PortableType::Boolean => f.write_str("boolean"),
            PortableType::Timestamp => f.write_str("timestamp"),
            PortableType::Date => f.write_str("date"),
            PortableType::Time => f.write_str("time"),
            PortableType::Binary => f.write_str("binary"),
            PortableType::Decimal { precision, scale } => write!(f, "decimal({},{})", precision, scale),
            PortableType::Array(item) => write!(f, "array<{}>", item),
            PortableType::Object(fields) => {
                f.write_str("object{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", name, ty)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Exact decimal number of at most [`Decimal::MAX_PRECISION`] digits.
///
/// Stored as an unscaled 128-bit integer and a scale, so `12.50` is
/// `(1250, 2)`. Equality and ordering are numeric: `1.5 == 1.50`.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    unscaled: i128,
    scale: u8,
}

impl Decimal {
    /// Largest precision DuckDB supports for DECIMAL columns.
    pub const MAX_PRECISION: u8 = 38;

    pub fn new(unscaled: i128, scale: u8) -> Result<Self, CoercionError> {
        if scale > Self::MAX_PRECISION {
            return Err(CoercionError::new(
                unscaled.to_string(),
                "decimal",
                format!("scale {} exceeds {}", scale, Self::MAX_PRECISION),
            ));
        }
        let decimal = Self { unscaled, scale };
        if decimal.digits() > u32::from(Self::MAX_PRECISION) {
            return Err(CoercionError::new(
                unscaled.to_string(),
                "decimal",
                format!("more than {} significant digits", Self::MAX_PRECISION),
            ));
        }
        Ok(decimal)
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Number of digits in the unscaled value (zero counts as one digit).
    pub fn digits(&self) -> u32 {
        let abs = self.unscaled.unsigned_abs();
        if abs == 0 {
            1
        } else {
            abs.ilog10() + 1
        }
    }

    /// Re-expresses the value at `scale` without losing information.
    ///
    /// Returns `None` when narrowing would drop non-zero fractional digits or
    /// widening would overflow.
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        if scale > Self::MAX_PRECISION {
            return None;
        }
        let unscaled = match scale.cmp(&self.scale) {
            Ordering::Equal => self.unscaled,
            Ordering::Greater => {
                let factor = 10i128.checked_pow(u32::from(scale - self.scale))?;
                self.unscaled.checked_mul(factor)?
            }
            Ordering::Less => {
                let factor = 10i128.pow(u32::from(self.scale - scale));
                if self.unscaled % factor != 0 {
                    return None;
                }
                self.unscaled / factor
            }
        };
        Decimal::new(unscaled, scale).ok()
    }

    /// Integer part magnitude and the fraction widened to 38 digits.
    fn parts(&self) -> (u128, u128) {
        let abs = self.unscaled.unsigned_abs();
        let divisor = 10u128.pow(u32::from(self.scale));
        let widen = 10u128.pow(u32::from(Self::MAX_PRECISION - self.scale));
        (abs / divisor, (abs % divisor) * widen)
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let sign = self.unscaled.signum().cmp(&other.unscaled.signum());
        if sign != Ordering::Equal {
            return sign;
        }
        let magnitude = self.parts().cmp(&other.parts());
        if self.unscaled < 0 {
            magnitude.reverse()
        } else {
            magnitude
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.unscaled.unsigned_abs();
        let sign = if self.unscaled < 0 { "-" } else { "" };
        if self.scale == 0 {
            return write!(f, "{}{}", sign, abs);
        }
        let divisor = 10u128.pow(u32::from(self.scale));
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / divisor,
            abs % divisor,
            width = usize::from(self.scale)
        )
    }
}

impl FromStr for Decimal {
    type Err = CoercionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoercionError::new(s, "decimal", reason);
        let text = s.trim();
        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("no digits"));
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid("not a decimal literal"));
        }
        let scale = u8::try_from(frac_part.len())
            .ok()
            .filter(|scale| *scale <= Decimal::MAX_PRECISION)
            .ok_or_else(|| invalid("too many fractional digits"))?;

        let mut unscaled: i128 = 0;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|v| v.checked_add(i128::from(b - b'0')))
                .ok_or_else(|| invalid("too many digits"))?;
        }
        if negative {
            unscaled = -unscaled;
        }
        Decimal::new(unscaled, scale)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A portable value, the unit of data inside a RECORD.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i128),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

pub(crate) fn format_time(time: &NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => match i64::try_from(*i) {
                Ok(small) => serializer.serialize_i64(small),
                Err(_) => serializer.serialize_i128(*i),
            },
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Decimal(d) => d.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            Value::Time(t) => serializer.serialize_str(&format_time(t)),
            Value::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
            Value::Binary(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(fields) => serialize_fields(fields, serializer),
        }
    }
}

fn serialize_fields<S: Serializer>(fields: &[(String, Value)], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(fields.len()))?;
    for (name, value) in fields {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

/// One extracted row, column order preserved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: Vec<(String, Value)>,
}

impl Record {
    pub fn new(values: Vec<(String, Value)>) -> Self {
        Self { values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_fields(&self.values, serializer)
    }
}
