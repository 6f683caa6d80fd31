//! Self-describing structured values, as handed over by a transport.
//!
//! pvAccess transfers every value as a structure: a type identifier tag (e.g.
//! `epics:nt/NTScalar:1.0`) and an ordered list of named fields. Each field is one of
//! a small set of shapes, modelled here by [`PvField`]:
//! - [`PvField::Scalar`] - a single [`ScalarValue`] of one of the twelve
//!   [`ScalarType`]s.
//! - [`PvField::ScalarArray`] - a [`ScalarArray`], one typed vector per scalar type.
//! - [`PvField::Structure`] - a nested [`PvStructure`].
//! - [`PvField::StructureArray`] - an array of structures. This is carried so that it
//!   can be reported, but nothing in this crate reads values out of it.
//!
//! The "normative types" that most IOCs serve are built with [`nt_scalar`],
//! [`nt_scalar_array`] and [`nt_enum`]. All three carry `alarm` and `timeStamp`
//! sub-structures; the numeric ones also carry `display.units`.
//!
//! Numeric conversion between types goes through [`NumCast`], so a value that cannot
//! be represented in the target type is an error rather than being wrapped or
//! truncated into a different number.
use num::NumCast;
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub const NT_SCALAR_ID: &str = "epics:nt/NTScalar:1.0";
pub const NT_SCALAR_ARRAY_ID: &str = "epics:nt/NTScalarArray:1.0";
pub const NT_ENUM_ID: &str = "epics:nt/NTEnum:1.0";
pub const ENUM_ID: &str = "enum_t";
const NT_PREFIX: &str = "epics:nt/";

/// Element types of scalars and scalar arrays
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UByte,
    UShort,
    UInt,
    ULong,
    Float,
    Double,
    String,
}

impl ScalarType {
    /// The pvData name of this type
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Byte => "byte",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::UByte => "ubyte",
            ScalarType::UShort => "ushort",
            ScalarType::UInt => "uint",
            ScalarType::ULong => "ulong",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::String => "string",
        }
    }
    /// Booleans are treated as text, like strings
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ScalarType::Boolean | ScalarType::String)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors converting between value representations
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("'{0}' cannot be parsed as {1}")]
    CannotParse(String, ScalarType),
    #[error("{0} is not representable as {1}")]
    OutOfRange(f64, ScalarType),
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse text as a number of a specific type.
///
/// Integers are tried directly first so that 64-bit values keep full precision, then
/// as a float (so that "3.0" is accepted for an int).
fn parse_number<T: NumCast + std::str::FromStr>(
    text: &str,
    kind: ScalarType,
) -> Result<T, ConvertError> {
    let trimmed = text.trim();
    if let Ok(value) = trimmed.parse::<T>() {
        return Ok(value);
    }
    let as_float: f64 = trimmed
        .parse()
        .map_err(|_| ConvertError::CannotParse(text.to_string(), kind))?;
    NumCast::from(as_float).ok_or(ConvertError::OutOfRange(as_float, kind))
}

fn cast_number<T: NumCast>(value: f64, kind: ScalarType) -> Result<T, ConvertError> {
    NumCast::from(value).ok_or(ConvertError::OutOfRange(value, kind))
}

/// A single element of data
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Boolean(_) => ScalarType::Boolean,
            ScalarValue::Byte(_) => ScalarType::Byte,
            ScalarValue::Short(_) => ScalarType::Short,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Long(_) => ScalarType::Long,
            ScalarValue::UByte(_) => ScalarType::UByte,
            ScalarValue::UShort(_) => ScalarType::UShort,
            ScalarValue::UInt(_) => ScalarType::UInt,
            ScalarValue::ULong(_) => ScalarType::ULong,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Double(_) => ScalarType::Double,
            ScalarValue::String(_) => ScalarType::String,
        }
    }

    /// The numeric value, or None for text types
    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            ScalarValue::Byte(v) => *v as f64,
            ScalarValue::Short(v) => *v as f64,
            ScalarValue::Int(v) => *v as f64,
            ScalarValue::Long(v) => *v as f64,
            ScalarValue::UByte(v) => *v as f64,
            ScalarValue::UShort(v) => *v as f64,
            ScalarValue::UInt(v) => *v as f64,
            ScalarValue::ULong(v) => *v as f64,
            ScalarValue::Float(v) => *v as f64,
            ScalarValue::Double(v) => *v,
            ScalarValue::Boolean(_) | ScalarValue::String(_) => return None,
        })
    }

    pub fn to_text(&self) -> String {
        match self {
            ScalarValue::Boolean(v) => v.to_string(),
            ScalarValue::String(v) => v.clone(),
            other => other.as_f64().map(|v| v.to_string()).unwrap_or_default(),
        }
    }

    /// Build a value of a specific type from a double
    pub fn from_f64(kind: ScalarType, value: f64) -> Result<ScalarValue, ConvertError> {
        Ok(match kind {
            ScalarType::Boolean => ScalarValue::Boolean(value != 0.0),
            ScalarType::Byte => ScalarValue::Byte(cast_number(value, kind)?),
            ScalarType::Short => ScalarValue::Short(cast_number(value, kind)?),
            ScalarType::Int => ScalarValue::Int(cast_number(value, kind)?),
            ScalarType::Long => ScalarValue::Long(cast_number(value, kind)?),
            ScalarType::UByte => ScalarValue::UByte(cast_number(value, kind)?),
            ScalarType::UShort => ScalarValue::UShort(cast_number(value, kind)?),
            ScalarType::UInt => ScalarValue::UInt(cast_number(value, kind)?),
            ScalarType::ULong => ScalarValue::ULong(cast_number(value, kind)?),
            ScalarType::Float => ScalarValue::Float(cast_number(value, kind)?),
            ScalarType::Double => ScalarValue::Double(value),
            ScalarType::String => ScalarValue::String(value.to_string()),
        })
    }

    /// Parse text into a value of a specific type
    pub fn parse_as(kind: ScalarType, text: &str) -> Result<ScalarValue, ConvertError> {
        Ok(match kind {
            ScalarType::Boolean => ScalarValue::Boolean(
                parse_bool(text).ok_or_else(|| ConvertError::CannotParse(text.to_string(), kind))?,
            ),
            ScalarType::Byte => ScalarValue::Byte(parse_number(text, kind)?),
            ScalarType::Short => ScalarValue::Short(parse_number(text, kind)?),
            ScalarType::Int => ScalarValue::Int(parse_number(text, kind)?),
            ScalarType::Long => ScalarValue::Long(parse_number(text, kind)?),
            ScalarType::UByte => ScalarValue::UByte(parse_number(text, kind)?),
            ScalarType::UShort => ScalarValue::UShort(parse_number(text, kind)?),
            ScalarType::UInt => ScalarValue::UInt(parse_number(text, kind)?),
            ScalarType::ULong => ScalarValue::ULong(parse_number(text, kind)?),
            ScalarType::Float => ScalarValue::Float(parse_number(text, kind)?),
            ScalarType::Double => ScalarValue::Double(parse_number(text, kind)?),
            ScalarType::String => ScalarValue::String(text.to_string()),
        })
    }
}

/// A typed vector of elements
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarArray {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    UByte(Vec<u8>),
    UShort(Vec<u16>),
    UInt(Vec<u32>),
    ULong(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

impl ScalarArray {
    pub fn len(&self) -> usize {
        match self {
            ScalarArray::Boolean(v) => v.len(),
            ScalarArray::Byte(v) => v.len(),
            ScalarArray::Short(v) => v.len(),
            ScalarArray::Int(v) => v.len(),
            ScalarArray::Long(v) => v.len(),
            ScalarArray::UByte(v) => v.len(),
            ScalarArray::UShort(v) => v.len(),
            ScalarArray::UInt(v) => v.len(),
            ScalarArray::ULong(v) => v.len(),
            ScalarArray::Float(v) => v.len(),
            ScalarArray::Double(v) => v.len(),
            ScalarArray::String(v) => v.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarArray::Boolean(_) => ScalarType::Boolean,
            ScalarArray::Byte(_) => ScalarType::Byte,
            ScalarArray::Short(_) => ScalarType::Short,
            ScalarArray::Int(_) => ScalarType::Int,
            ScalarArray::Long(_) => ScalarType::Long,
            ScalarArray::UByte(_) => ScalarType::UByte,
            ScalarArray::UShort(_) => ScalarType::UShort,
            ScalarArray::UInt(_) => ScalarType::UInt,
            ScalarArray::ULong(_) => ScalarType::ULong,
            ScalarArray::Float(_) => ScalarType::Float,
            ScalarArray::Double(_) => ScalarType::Double,
            ScalarArray::String(_) => ScalarType::String,
        }
    }

    /// Replace the contents of `out` with this array as doubles.
    ///
    /// Returns false (leaving `out` empty) if this is a text array.
    pub fn copy_numeric_into(&self, out: &mut Vec<f64>) -> bool {
        /// Utility function so that we don't have to repeat the extend per variant
        fn _extend<T: Copy + Into<f64>>(from: &[T], out: &mut Vec<f64>) {
            out.extend(from.iter().map(|v| (*v).into()));
        }
        out.clear();
        match self {
            ScalarArray::Byte(v) => _extend(v, out),
            ScalarArray::Short(v) => _extend(v, out),
            ScalarArray::Int(v) => _extend(v, out),
            ScalarArray::Long(v) => out.extend(v.iter().map(|v| *v as f64)),
            ScalarArray::UByte(v) => _extend(v, out),
            ScalarArray::UShort(v) => _extend(v, out),
            ScalarArray::UInt(v) => _extend(v, out),
            ScalarArray::ULong(v) => out.extend(v.iter().map(|v| *v as f64)),
            ScalarArray::Float(v) => _extend(v, out),
            ScalarArray::Double(v) => out.extend_from_slice(v),
            ScalarArray::Boolean(_) | ScalarArray::String(_) => return false,
        }
        true
    }

    /// Replace the contents of `out` with this array as text
    pub fn copy_text_into(&self, out: &mut Vec<String>) {
        out.clear();
        match self {
            ScalarArray::String(v) => out.extend(v.iter().cloned()),
            ScalarArray::Boolean(v) => out.extend(v.iter().map(|b| b.to_string())),
            other => {
                let mut numbers = Vec::with_capacity(other.len());
                other.copy_numeric_into(&mut numbers);
                out.extend(numbers.iter().map(|v| v.to_string()));
            }
        }
    }

    /// Build an array of a specific type from doubles
    pub fn from_f64s(kind: ScalarType, values: &[f64]) -> Result<ScalarArray, ConvertError> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<U: NumCast>(
            from: &[f64],
            kind: ScalarType,
        ) -> Result<Vec<U>, ConvertError> {
            from.iter().map(|n| cast_number(*n, kind)).collect()
        }
        Ok(match kind {
            ScalarType::Boolean => ScalarArray::Boolean(values.iter().map(|v| *v != 0.0).collect()),
            ScalarType::Byte => ScalarArray::Byte(_try_convert_vec(values, kind)?),
            ScalarType::Short => ScalarArray::Short(_try_convert_vec(values, kind)?),
            ScalarType::Int => ScalarArray::Int(_try_convert_vec(values, kind)?),
            ScalarType::Long => ScalarArray::Long(_try_convert_vec(values, kind)?),
            ScalarType::UByte => ScalarArray::UByte(_try_convert_vec(values, kind)?),
            ScalarType::UShort => ScalarArray::UShort(_try_convert_vec(values, kind)?),
            ScalarType::UInt => ScalarArray::UInt(_try_convert_vec(values, kind)?),
            ScalarType::ULong => ScalarArray::ULong(_try_convert_vec(values, kind)?),
            ScalarType::Float => ScalarArray::Float(_try_convert_vec(values, kind)?),
            ScalarType::Double => ScalarArray::Double(values.to_vec()),
            ScalarType::String => ScalarArray::String(values.iter().map(|v| v.to_string()).collect()),
        })
    }

    /// Convert a list of strings to an array of a specific type by parsing each item
    pub fn parse_into(kind: ScalarType, values: &[String]) -> Result<ScalarArray, ConvertError> {
        fn _parse_vec<U: NumCast + std::str::FromStr>(
            from: &[String],
            kind: ScalarType,
        ) -> Result<Vec<U>, ConvertError> {
            from.iter().map(|s| parse_number(s, kind)).collect()
        }
        Ok(match kind {
            ScalarType::Boolean => ScalarArray::Boolean(
                values
                    .iter()
                    .map(|s| parse_bool(s).ok_or_else(|| ConvertError::CannotParse(s.clone(), kind)))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            ScalarType::Byte => ScalarArray::Byte(_parse_vec(values, kind)?),
            ScalarType::Short => ScalarArray::Short(_parse_vec(values, kind)?),
            ScalarType::Int => ScalarArray::Int(_parse_vec(values, kind)?),
            ScalarType::Long => ScalarArray::Long(_parse_vec(values, kind)?),
            ScalarType::UByte => ScalarArray::UByte(_parse_vec(values, kind)?),
            ScalarType::UShort => ScalarArray::UShort(_parse_vec(values, kind)?),
            ScalarType::UInt => ScalarArray::UInt(_parse_vec(values, kind)?),
            ScalarType::ULong => ScalarArray::ULong(_parse_vec(values, kind)?),
            ScalarType::Float => ScalarArray::Float(_parse_vec(values, kind)?),
            ScalarType::Double => ScalarArray::Double(_parse_vec(values, kind)?),
            ScalarType::String => ScalarArray::String(values.to_vec()),
        })
    }
}

/// Implement From<vec of type> and From<single value> for a specific variant
macro_rules! impl_pvdata_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for ScalarArray {
            fn from(value: Vec<$typ>) -> Self {
                ScalarArray::$variant(value)
            }
        }
        impl From<$typ> for ScalarValue {
            fn from(value: $typ) -> Self {
                ScalarValue::$variant(value)
            }
        }
    };
}
impl_pvdata_conversions_between!(Boolean, bool);
impl_pvdata_conversions_between!(Byte, i8);
impl_pvdata_conversions_between!(Short, i16);
impl_pvdata_conversions_between!(Int, i32);
impl_pvdata_conversions_between!(Long, i64);
impl_pvdata_conversions_between!(UByte, u8);
impl_pvdata_conversions_between!(UShort, u16);
impl_pvdata_conversions_between!(UInt, u32);
impl_pvdata_conversions_between!(ULong, u64);
impl_pvdata_conversions_between!(Float, f32);
impl_pvdata_conversions_between!(Double, f64);
impl_pvdata_conversions_between!(String, String);

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

/// One field of a structure
#[derive(Clone, Debug, PartialEq)]
pub enum PvField {
    Scalar(ScalarValue),
    ScalarArray(ScalarArray),
    Structure(PvStructure),
    StructureArray(Vec<PvStructure>),
}

impl PvField {
    /// The pvData introspection name of this field's shape
    pub fn type_name(&self) -> &'static str {
        match self {
            PvField::Scalar(_) => "scalar",
            PvField::ScalarArray(_) => "scalarArray",
            PvField::Structure(_) => "structure",
            PvField::StructureArray(_) => "structureArray",
        }
    }

    /// Whether another field could be stored in place of this one
    pub fn same_type_as(&self, other: &PvField) -> bool {
        match (self, other) {
            (PvField::Scalar(a), PvField::Scalar(b)) => a.scalar_type() == b.scalar_type(),
            (PvField::ScalarArray(a), PvField::ScalarArray(b)) => a.scalar_type() == b.scalar_type(),
            (PvField::Structure(a), PvField::Structure(b)) => a.id == b.id,
            (PvField::StructureArray(_), PvField::StructureArray(_)) => true,
            _ => false,
        }
    }
}

impl From<ScalarValue> for PvField {
    fn from(value: ScalarValue) -> Self {
        PvField::Scalar(value)
    }
}
impl From<ScalarArray> for PvField {
    fn from(value: ScalarArray) -> Self {
        PvField::ScalarArray(value)
    }
}
impl From<PvStructure> for PvField {
    fn from(value: PvStructure) -> Self {
        PvField::Structure(value)
    }
}

/// Returned when a dotted field path does not resolve
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("No field '{0}'")]
pub struct NoSuchField(pub String);

/// A named, ordered collection of fields with a type identifier
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PvStructure {
    pub id: String,
    pub fields: Vec<(String, PvField)>,
}

impl PvStructure {
    pub fn new(id: &str) -> Self {
        PvStructure {
            id: id.to_string(),
            fields: Vec::new(),
        }
    }
    /// Append a field, builder-style
    pub fn with_field(mut self, name: &str, field: impl Into<PvField>) -> Self {
        self.fields.push((name.to_string(), field.into()));
        self
    }
    pub fn field(&self, name: &str) -> Option<&PvField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }
    pub fn field_mut(&mut self, name: &str) -> Option<&mut PvField> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, f)| f)
    }
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.clone()).collect()
    }
    pub fn is_normative(&self) -> bool {
        self.id.starts_with(NT_PREFIX)
    }

    /// Look up a field by a dotted path e.g. `alarm.severity`
    pub fn get_path(&self, path: &str) -> Option<&PvField> {
        let mut parts = path.split('.');
        let mut field = self.field(parts.next()?)?;
        for part in parts {
            let PvField::Structure(inner) = field else {
                return None;
            };
            field = inner.field(part)?;
        }
        Some(field)
    }

    /// Look up a structure by dotted path. The empty path is this structure.
    pub fn get_structure(&self, path: &str) -> Option<&PvStructure> {
        if path.is_empty() {
            return Some(self);
        }
        match self.get_path(path)? {
            PvField::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// Replace a field at a dotted path, returning the previous value
    pub fn set_path(&mut self, path: &str, value: PvField) -> Result<PvField, NoSuchField> {
        let missing = || NoSuchField(path.to_string());
        let (parent, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (Some(parent), name),
            None => (None, path),
        };
        let mut target = self;
        if let Some(parent) = parent {
            for part in parent.split('.') {
                match target.field_mut(part) {
                    Some(PvField::Structure(inner)) => target = inner,
                    _ => return Err(missing()),
                }
            }
        }
        let slot = target.field_mut(name).ok_or_else(missing)?;
        Ok(std::mem::replace(slot, value))
    }

    /// A copy holding only the chain of fields leading to `path`.
    ///
    /// This is what a server hands back for a request on a named sub-field: the
    /// top-level structure, pruned to the requested field.
    pub fn restrict(&self, path: &str) -> Option<PvStructure> {
        let (head, tail) = match path.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (path, None),
        };
        let field = self.field(head)?;
        let kept = match (tail, field) {
            (None, field) => field.clone(),
            (Some(tail), PvField::Structure(inner)) => PvField::Structure(inner.restrict(tail)?),
            (Some(_), _) => return None,
        };
        Some(PvStructure {
            id: self.id.clone(),
            fields: vec![(head.to_string(), kept)],
        })
    }

    /// `alarm.severity`, if this structure carries an alarm
    pub fn alarm_severity(&self) -> Option<i32> {
        match self.get_path("alarm.severity")? {
            PvField::Scalar(ScalarValue::Int(severity)) => Some(*severity),
            PvField::Scalar(other) => other.as_f64().map(|v| v as i32),
            _ => None,
        }
    }

    /// `display.units`, if this structure carries display information
    pub fn units(&self) -> Option<&str> {
        match self.get_path("display.units")? {
            PvField::Scalar(ScalarValue::String(units)) => Some(units),
            _ => None,
        }
    }

    /// The `timeStamp` of this structure, as a [`SystemTime`]
    pub fn timestamp(&self) -> Option<SystemTime> {
        let seconds = match self.get_path("timeStamp.secondsPastEpoch")? {
            PvField::Scalar(v) => v.as_f64()?,
            _ => return None,
        };
        let nanos = match self.get_path("timeStamp.nanoseconds") {
            Some(PvField::Scalar(v)) => v.as_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        if seconds < 0.0 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::new(seconds as u64, nanos as u32))
    }

    /// Set `display.units`, adding a display structure if needed
    pub fn with_units(mut self, units: &str) -> Self {
        let units = PvField::Scalar(units.into());
        if self.set_path("display.units", units.clone()).is_err() {
            if let Some(PvField::Structure(display)) = self.field_mut("display") {
                display.fields.push(("units".to_string(), units));
            } else {
                self.fields.push((
                    "display".to_string(),
                    PvStructure::new("display_t").with_field("units", units).into(),
                ));
            }
        }
        self
    }

    /// Set `alarm.severity`, if this structure carries an alarm
    pub fn set_alarm_severity(&mut self, severity: i32) -> Result<(), NoSuchField> {
        self.set_path("alarm.severity", PvField::Scalar(ScalarValue::Int(severity)))
            .map(|_| ())
    }
}

fn alarm_structure() -> PvStructure {
    PvStructure::new("alarm_t")
        .with_field("severity", ScalarValue::Int(0))
        .with_field("status", ScalarValue::Int(0))
        .with_field("message", ScalarValue::String(String::new()))
}

fn time_structure(at: SystemTime) -> PvStructure {
    let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    PvStructure::new("time_t")
        .with_field("secondsPastEpoch", ScalarValue::Long(since_epoch.as_secs() as i64))
        .with_field("nanoseconds", ScalarValue::Int(since_epoch.subsec_nanos() as i32))
        .with_field("userTag", ScalarValue::Int(0))
}

fn display_structure() -> PvStructure {
    PvStructure::new("display_t").with_field("units", ScalarValue::String(String::new()))
}

/// Build an `enum_t` structure holding an index and its choices
pub fn enum_structure(index: i32, choices: Vec<String>) -> PvStructure {
    PvStructure::new(ENUM_ID)
        .with_field("index", ScalarValue::Int(index))
        .with_field("choices", ScalarArray::String(choices))
}

/// Build an `NTScalar` holding a single value
pub fn nt_scalar(value: impl Into<ScalarValue>) -> PvStructure {
    PvStructure::new(NT_SCALAR_ID)
        .with_field("value", value.into())
        .with_field("alarm", alarm_structure())
        .with_field("timeStamp", time_structure(SystemTime::now()))
        .with_field("display", display_structure())
}

/// Build an `NTScalarArray` holding a vector of values
pub fn nt_scalar_array(value: impl Into<ScalarArray>) -> PvStructure {
    PvStructure::new(NT_SCALAR_ARRAY_ID)
        .with_field("value", value.into())
        .with_field("alarm", alarm_structure())
        .with_field("timeStamp", time_structure(SystemTime::now()))
        .with_field("display", display_structure())
}

/// Build an `NTEnum` selecting `index` out of `choices`
pub fn nt_enum(index: i32, choices: &[&str]) -> PvStructure {
    PvStructure::new(NT_ENUM_ID)
        .with_field(
            "value",
            enum_structure(index, choices.iter().map(|c| c.to_string()).collect()),
        )
        .with_field("alarm", alarm_structure())
        .with_field("timeStamp", time_structure(SystemTime::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        assert_eq!(
            ScalarValue::from_f64(ScalarType::Int, 42.0).unwrap(),
            ScalarValue::Int(42)
        );
        assert!(ScalarValue::from_f64(ScalarType::UByte, 300.0).is_err());
        assert!(ScalarValue::from_f64(ScalarType::UInt, -1.0).is_err());
        assert_eq!(
            ScalarValue::parse_as(ScalarType::Short, "3.0").unwrap(),
            ScalarValue::Short(3)
        );
        assert_eq!(
            ScalarValue::parse_as(ScalarType::ULong, "18446744073709551615").unwrap(),
            ScalarValue::ULong(u64::MAX)
        );
        assert!(ScalarValue::parse_as(ScalarType::Double, "fish").is_err());
        assert_eq!(
            ScalarValue::parse_as(ScalarType::Boolean, "TRUE").unwrap(),
            ScalarValue::Boolean(true)
        );
    }

    #[test]
    fn array_copy_reuses_buffer() {
        let array: ScalarArray = vec![1i16, 2, 3].into();
        let mut out = vec![9.0; 10];
        assert!(array.copy_numeric_into(&mut out));
        assert_eq!(out, vec![1.0, 2.0, 3.0]);

        let text: ScalarArray = vec!["a".to_string()].into();
        assert!(!text.copy_numeric_into(&mut out));
        assert!(out.is_empty());

        let mut labels = Vec::new();
        ScalarArray::Boolean(vec![true, false]).copy_text_into(&mut labels);
        assert_eq!(labels, vec!["true", "false"]);
    }

    #[test]
    fn array_from_text() {
        let parsed =
            ScalarArray::parse_into(ScalarType::Int, &["1".to_string(), " 2 ".to_string()])
                .unwrap();
        assert_eq!(parsed, ScalarArray::Int(vec![1, 2]));
        assert!(ScalarArray::parse_into(ScalarType::Int, &["x".to_string()]).is_err());
        assert_eq!(
            ScalarArray::from_f64s(ScalarType::Float, &[0.5, 1.5]).unwrap(),
            ScalarArray::Float(vec![0.5, 1.5])
        );
    }

    #[test]
    fn paths() {
        let mut s = nt_scalar(1.5f64).with_units("mm");
        assert_eq!(s.units(), Some("mm"));
        assert_eq!(s.alarm_severity(), Some(0));
        assert!(s.timestamp().is_some());
        assert_eq!(
            s.get_path("value"),
            Some(&PvField::Scalar(ScalarValue::Double(1.5)))
        );
        s.set_path("value", ScalarValue::Double(2.5).into()).unwrap();
        assert_eq!(
            s.get_path("value"),
            Some(&PvField::Scalar(ScalarValue::Double(2.5)))
        );
        assert!(s.set_path("nothing.here", ScalarValue::Int(0).into()).is_err());
        s.set_alarm_severity(2).unwrap();
        assert_eq!(s.alarm_severity(), Some(2));

        let e = nt_enum(1, &["Off", "On"]);
        let restricted = e.restrict("value.index").unwrap();
        assert_eq!(restricted.field_names(), vec!["value"]);
        assert_eq!(
            restricted.get_path("value.index"),
            Some(&PvField::Scalar(ScalarValue::Int(1)))
        );
        assert!(restricted.get_path("value.choices").is_none());
        assert!(e.restrict("nope").is_none());
        assert_eq!(e.get_structure("value").map(|s| s.id.as_str()), Some(ENUM_ID));
    }
}
