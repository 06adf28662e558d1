//! Native DuckDB type strings to portable types and value coercers.
//!
//! [`map`] is total: every string the driver can print maps to something.
//! Types without a faithful portable counterpart fall back to
//! [`PortableType::String`] and carry a warning, so one odd column never
//! fails a discovery pass.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use super::types::{format_time, format_timestamp, Decimal, PortableType, Value};
use crate::error::CoercionError;
use crate::source::RawValue;

/// DuckDB's precision and scale for a bare `DECIMAL`.
const DEFAULT_DECIMAL: (u8, u8) = (18, 3);

/// Result of mapping one native type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMapping {
    pub portable: PortableType,
    pub coercer: Coercer,
    /// Set when the native type fell back to a lossy representation.
    pub warning: Option<String>,
}

impl TypeMapping {
    fn exact(portable: PortableType, coercer: Coercer) -> Self {
        Self {
            portable,
            coercer,
            warning: None,
        }
    }

    fn fallback(native: &str) -> Self {
        Self {
            portable: PortableType::String,
            coercer: Coercer::Fallback,
            warning: Some(format!(
                "native type '{}' is not supported; values are emitted as strings and lose their typed precision",
                native
            )),
        }
    }
}

/// Value conversion chosen at mapping time.
#[derive(Debug, Clone, PartialEq)]
pub enum Coercer {
    Boolean,
    /// Integer constrained to the native width.
    Integer { min: i128, max: i128 },
    /// `single` rejects values outside the `f32` range.
    Float { single: bool },
    Decimal { precision: u8, scale: u8 },
    /// Lossless text rendering of scalar values.
    String,
    Binary,
    Date,
    Time,
    Timestamp,
    Array(Box<Coercer>),
    Object(Vec<(String, Coercer)>),
    /// Any value, rendered as text.
    Fallback,
}

/// Maps a native type string such as `DECIMAL(10,2)` or `INTEGER[]`.
pub fn map(native: &str) -> TypeMapping {
    let native = native.trim();

    if let Some(inner) = strip_array_suffix(native) {
        return array_of(map(inner));
    }

    let (head, args) = split_head(native);
    let int = |min: i128, max: i128| {
        TypeMapping::exact(PortableType::Integer, Coercer::Integer { min, max })
    };

    match head.as_str() {
        "BOOLEAN" | "BOOL" | "LOGICAL" => TypeMapping::exact(PortableType::Boolean, Coercer::Boolean),
        "TINYINT" | "INT1" => int(i8::MIN.into(), i8::MAX.into()),
        "SMALLINT" | "INT2" | "SHORT" => int(i16::MIN.into(), i16::MAX.into()),
        "INTEGER" | "INT4" | "INT" | "SIGNED" => int(i32::MIN.into(), i32::MAX.into()),
        "BIGINT" | "INT8" | "LONG" => int(i64::MIN.into(), i64::MAX.into()),
        "HUGEINT" | "INT128" => int(i128::MIN, i128::MAX),
        "UTINYINT" => int(0, u8::MAX.into()),
        "USMALLINT" => int(0, u16::MAX.into()),
        "UINTEGER" => int(0, u32::MAX.into()),
        "UBIGINT" => int(0, u64::MAX.into()),
        // Wider than any portable integer; digits survive as text
        "UHUGEINT" => TypeMapping::exact(PortableType::String, Coercer::String),
        "REAL" | "FLOAT4" | "FLOAT" => {
            TypeMapping::exact(PortableType::Float, Coercer::Float { single: true })
        }
        "DOUBLE" | "FLOAT8" => TypeMapping::exact(PortableType::Float, Coercer::Float { single: false }),
        "DECIMAL" | "NUMERIC" => match parse_decimal_args(args) {
            Some((precision, scale)) => TypeMapping::exact(
                PortableType::Decimal { precision, scale },
                Coercer::Decimal { precision, scale },
            ),
            None => TypeMapping::fallback(native),
        },
        "VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING" | "NVARCHAR" | "UUID" | "JSON" | "ENUM" => {
            TypeMapping::exact(PortableType::String, Coercer::String)
        }
        "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => {
            TypeMapping::exact(PortableType::Binary, Coercer::Binary)
        }
        "DATE" => TypeMapping::exact(PortableType::Date, Coercer::Date),
        "TIME" => TypeMapping::exact(PortableType::Time, Coercer::Time),
        "TIMESTAMP" | "DATETIME" | "TIMESTAMP_US" | "TIMESTAMP_MS" | "TIMESTAMP_S" | "TIMESTAMP_NS"
        | "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => {
            TypeMapping::exact(PortableType::Timestamp, Coercer::Timestamp)
        }
        "LIST" => match args {
            Some(inner) => array_of(map(inner)),
            None => TypeMapping::fallback(native),
        },
        "STRUCT" => match args.and_then(parse_struct_fields) {
            Some(fields) => object_of(fields),
            None => TypeMapping::fallback(native),
        },
        _ => TypeMapping::fallback(native),
    }
}

/// Whether the source sorts `native` values the way their mapped portable
/// values compare. UHUGEINT sorts numerically but maps to text, and ENUM
/// sorts by declaration position.
pub fn preserves_order(native: &str) -> bool {
    let (head, _) = split_head(native.trim());
    !matches!(head.as_str(), "UHUGEINT" | "ENUM")
}

fn array_of(item: TypeMapping) -> TypeMapping {
    TypeMapping {
        portable: PortableType::Array(Box::new(item.portable)),
        coercer: Coercer::Array(Box::new(item.coercer)),
        warning: item.warning,
    }
}

fn object_of(fields: Vec<(String, TypeMapping)>) -> TypeMapping {
    let warnings: Vec<String> = fields
        .iter()
        .filter_map(|(name, m)| m.warning.as_ref().map(|w| format!("field '{}': {}", name, w)))
        .collect();

    TypeMapping {
        portable: PortableType::Object(
            fields.iter().map(|(n, m)| (n.clone(), m.portable.clone())).collect(),
        ),
        coercer: Coercer::Object(fields.into_iter().map(|(n, m)| (n, m.coercer)).collect()),
        warning: if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        },
    }
}

/// `INTEGER[]` and `INTEGER[3]` both name arrays.
fn strip_array_suffix(native: &str) -> Option<&str> {
    let body = native.strip_suffix(']')?;
    let open = body.rfind('[')?;
    if body[open + 1..].bytes().all(|b| b.is_ascii_digit()) {
        Some(body[..open].trim())
    } else {
        None
    }
}

/// Splits `DECIMAL(10,2)` into `("DECIMAL", Some("10,2"))`.
fn split_head(native: &str) -> (String, Option<&str>) {
    match native.find('(') {
        Some(open) if native.ends_with(')') => (
            native[..open].trim().to_ascii_uppercase(),
            Some(&native[open + 1..native.len() - 1]),
        ),
        _ => (native.to_ascii_uppercase(), None),
    }
}

fn parse_decimal_args(args: Option<&str>) -> Option<(u8, u8)> {
    let Some(args) = args else {
        return Some(DEFAULT_DECIMAL);
    };
    let mut parts = args.split(',').map(|p| p.trim().parse::<u8>());
    let precision = parts.next()?.ok()?;
    let scale = match parts.next() {
        Some(scale) => scale.ok()?,
        None => 0,
    };
    if parts.next().is_some()
        || precision == 0
        || precision > Decimal::MAX_PRECISION
        || scale > precision
    {
        return None;
    }
    Some((precision, scale))
}

/// Parses `a INTEGER, "b c" VARCHAR[]` into named field mappings.
fn parse_struct_fields(args: &str) -> Option<Vec<(String, TypeMapping)>> {
    let mut fields = Vec::new();
    for part in split_top_level(args) {
        let part = part.trim();
        let (name, rest) = if let Some(quoted) = part.strip_prefix('"') {
            let end = quoted.find('"')?;
            (quoted[..end].to_string(), &quoted[end + 1..])
        } else {
            let end = part.find(char::is_whitespace)?;
            (part[..end].to_string(), &part[end..])
        };
        let rest = rest.trim();
        if name.is_empty() || rest.is_empty() {
            return None;
        }
        fields.push((name, map(rest)));
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Splits on commas that are not nested in parentheses, brackets or quotes.
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' | '[' if !in_quotes => depth += 1,
            ')' | ']' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

impl Coercer {
    /// Converts one raw value. Nulls pass through; nullability is enforced
    /// per column by the caller.
    pub fn coerce(&self, raw: RawValue) -> Result<Value, CoercionError> {
        if let RawValue::Null = raw {
            return Ok(Value::Null);
        }
        match self {
            Coercer::Boolean => coerce_bool(raw),
            Coercer::Integer { min, max } => coerce_integer(raw, *min, *max),
            Coercer::Float { single } => coerce_float(raw, *single),
            Coercer::Decimal { precision, scale } => coerce_decimal(raw, *precision, *scale),
            Coercer::String => coerce_string(raw),
            Coercer::Binary => match raw {
                RawValue::Blob(bytes) => Ok(Value::Binary(bytes)),
                RawValue::Text(text) => Ok(Value::Binary(text.into_bytes())),
                other => Err(mismatch(&other, "binary")),
            },
            Coercer::Date => coerce_date(raw),
            Coercer::Time => coerce_time(raw),
            Coercer::Timestamp => coerce_timestamp(raw),
            Coercer::Array(item) => match raw {
                RawValue::List(items) => items
                    .into_iter()
                    .map(|v| item.coerce(v))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                other => Err(mismatch(&other, "array")),
            },
            Coercer::Object(fields) => coerce_object(raw, fields),
            Coercer::Fallback => Ok(Value::String(render_text(raw))),
        }
    }
}

fn mismatch(raw: &RawValue, target: &str) -> CoercionError {
    CoercionError::new(raw.describe(), target, "incompatible source value")
}

fn coerce_bool(raw: RawValue) -> Result<Value, CoercionError> {
    match raw {
        RawValue::Bool(b) => Ok(Value::Boolean(b)),
        RawValue::Int(0) => Ok(Value::Boolean(false)),
        RawValue::Int(1) => Ok(Value::Boolean(true)),
        RawValue::Text(ref s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Value::Boolean(true)),
            "false" | "f" | "0" => Ok(Value::Boolean(false)),
            _ => Err(mismatch(&raw, "boolean")),
        },
        other => Err(mismatch(&other, "boolean")),
    }
}

fn coerce_integer(raw: RawValue, min: i128, max: i128) -> Result<Value, CoercionError> {
    let value = match &raw {
        RawValue::Int(i) => *i,
        RawValue::Text(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|_| CoercionError::new(raw.describe(), "integer", "not an integer literal"))?,
        RawValue::Decimal(d) => d
            .rescale(0)
            .map(|d| d.unscaled())
            .ok_or_else(|| CoercionError::new(raw.describe(), "integer", "has a fractional part"))?,
        RawValue::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 2f64.powi(53) => *f as i128,
        other => return Err(mismatch(other, "integer")),
    };
    if value < min || value > max {
        return Err(CoercionError::new(
            raw.describe(),
            "integer",
            format!("out of range [{}, {}]", min, max),
        ));
    }
    Ok(Value::Integer(value))
}

fn coerce_float(raw: RawValue, single: bool) -> Result<Value, CoercionError> {
    let value = match &raw {
        RawValue::Float(f) => *f,
        RawValue::Int(i) => {
            if i.unsigned_abs() > 1u128 << f64::MANTISSA_DIGITS {
                return Err(CoercionError::new(raw.describe(), "float", "not exactly representable"));
            }
            *i as f64
        }
        RawValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map_err(|_| mismatch(&raw, "float"))?,
        RawValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CoercionError::new(raw.describe(), "float", "not a number"))?,
        other => return Err(mismatch(other, "float")),
    };
    if !value.is_finite() {
        return Err(CoercionError::new(raw.describe(), "float", "NaN and infinity have no JSON form"));
    }
    if single && value.abs() > f64::from(f32::MAX) {
        return Err(CoercionError::new(raw.describe(), "float", "outside single precision range"));
    }
    Ok(Value::Float(value))
}

fn coerce_decimal(raw: RawValue, precision: u8, scale: u8) -> Result<Value, CoercionError> {
    let target = format!("decimal({},{})", precision, scale);
    let decimal = match &raw {
        RawValue::Decimal(d) => *d,
        RawValue::Int(i) => Decimal::new(*i, 0).map_err(|e| CoercionError { target: target.clone(), ..e })?,
        RawValue::Text(s) => s.parse::<Decimal>().map_err(|e| CoercionError { target: target.clone(), ..e })?,
        // Shortest round-trip rendering of the float
        RawValue::Float(f) if f.is_finite() => f
            .to_string()
            .parse::<Decimal>()
            .map_err(|e| CoercionError { target: target.clone(), ..e })?,
        other => return Err(mismatch(other, &target)),
    };
    let rescaled = decimal.rescale(scale).ok_or_else(|| {
        CoercionError::new(
            raw.describe(),
            target.clone(),
            format!("more than {} fractional digits", scale),
        )
    })?;
    if rescaled.digits() > u32::from(precision) {
        return Err(CoercionError::new(
            raw.describe(),
            target,
            format!("more than {} significant digits", precision),
        ));
    }
    Ok(Value::Decimal(rescaled))
}

fn coerce_string(raw: RawValue) -> Result<Value, CoercionError> {
    match raw {
        RawValue::Text(s) => Ok(Value::String(s)),
        RawValue::Blob(bytes) => String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|e| CoercionError::new(format!("<{} bytes>", e.as_bytes().len()), "string", "not valid UTF-8")),
        RawValue::List(_) | RawValue::Struct(_) => Err(CoercionError::new(
            raw.describe(),
            "string",
            "nested value where a scalar was declared",
        )),
        scalar => Ok(Value::String(render_text(scalar))),
    }
}

fn coerce_date(raw: RawValue) -> Result<Value, CoercionError> {
    match &raw {
        RawValue::Date(d) => Ok(Value::Date(*d)),
        RawValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| CoercionError::new(raw.describe(), "date", e.to_string())),
        other => Err(mismatch(other, "date")),
    }
}

fn coerce_time(raw: RawValue) -> Result<Value, CoercionError> {
    match &raw {
        RawValue::Time(t) => Ok(Value::Time(*t)),
        RawValue::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
            .map(Value::Time)
            .map_err(|e| CoercionError::new(raw.describe(), "time", e.to_string())),
        other => Err(mismatch(other, "time")),
    }
}

fn coerce_timestamp(raw: RawValue) -> Result<Value, CoercionError> {
    match &raw {
        RawValue::Timestamp(ts) => Ok(Value::Timestamp(Utc.from_utc_datetime(ts))),
        RawValue::Date(d) => Ok(Value::Timestamp(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))),
        RawValue::Text(s) => parse_timestamp(s.trim())
            .map(Value::Timestamp)
            .ok_or_else(|| CoercionError::new(raw.describe(), "timestamp", "unrecognized timestamp format")),
        other => Err(mismatch(other, "timestamp")),
    }
}

/// Accepts RFC 3339, `2024-01-01 10:00:00[.ffffff]` and the `+00` offsets
/// DuckDB prints for `TIMESTAMPTZ`.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    None
}

fn coerce_object(raw: RawValue, fields: &[(String, Coercer)]) -> Result<Value, CoercionError> {
    let mut entries = match raw {
        RawValue::Struct(entries) => entries,
        other => return Err(mismatch(&other, "object")),
    };
    if let Some((unknown, _)) = entries
        .iter()
        .find(|(name, _)| !fields.iter().any(|(declared, _)| declared == name))
    {
        return Err(CoercionError::new(
            format!("<struct with field '{}'>", unknown),
            "object",
            "field is not declared by the column type",
        ));
    }

    let mut out = Vec::with_capacity(fields.len());
    for (name, coercer) in fields {
        let value = match entries.iter().position(|(n, _)| n == name) {
            Some(idx) => coercer.coerce(entries.swap_remove(idx).1)?,
            None => Value::Null,
        };
        out.push((name.clone(), value));
    }
    Ok(Value::Object(out))
}

/// Text form used by the string and fallback coercers.
fn render_text(raw: RawValue) -> String {
    match raw {
        RawValue::Null => String::new(),
        RawValue::Bool(b) => b.to_string(),
        RawValue::Int(i) => i.to_string(),
        RawValue::Float(f) => f.to_string(),
        RawValue::Decimal(d) => d.to_string(),
        RawValue::Text(s) => s,
        RawValue::Blob(bytes) => BASE64.encode(bytes),
        RawValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        RawValue::Time(t) => format_time(&t),
        RawValue::Timestamp(ts) => format_timestamp(&Utc.from_utc_datetime(&ts)),
        nested @ (RawValue::List(_) | RawValue::Struct(_)) => render_json(nested).to_string(),
    }
}

fn render_json(raw: RawValue) -> serde_json::Value {
    match raw {
        RawValue::Null => serde_json::Value::Null,
        RawValue::Bool(b) => serde_json::Value::Bool(b),
        RawValue::List(items) => serde_json::Value::Array(items.into_iter().map(render_json).collect()),
        RawValue::Struct(fields) => serde_json::Value::Object(
            fields.into_iter().map(|(k, v)| (k, render_json(v))).collect(),
        ),
        RawValue::Int(i) => match i64::try_from(i) {
            Ok(small) => serde_json::Value::from(small),
            Err(_) => serde_json::Value::String(i.to_string()),
        },
        scalar => serde_json::Value::String(render_text(scalar)),
    }
}
