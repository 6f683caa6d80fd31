//! Classify wire structures into shapes, and move values between shapes and Readings.
//!
//! A PV's shape is worked out once, from the first structure received for it, and then
//! cached on its entry as a [`Shape`]. The shape records where in the structure the
//! value lives, so subsequent extraction and injection never need to re-inspect the
//! structure layout.
//!
//! Classification walks down from the requested node:
//! - a scalar or scalar array field is the value;
//! - an `enum_t` structure (or one holding `index` and `choices`) is enumerated;
//! - a normative type (`epics:nt/...`) descends into its `value` field;
//! - any other structure with a single field descends into that field;
//! - a structure with several fields cannot be resolved without a sub-field, and is
//!   reported rather than guessed at.

use crate::{
    error::PvError,
    pvdata::{ConvertError, ENUM_ID, PvField, PvStructure, ScalarArray, ScalarType, ScalarValue},
    reading::Reading,
};

/// Where and how a PV's value is held in its wire structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Shape {
    #[default]
    Unclassified,
    Scalar {
        path: String,
        scalar_type: ScalarType,
    },
    ScalarArray {
        path: String,
        scalar_type: ScalarType,
    },
    /// `path` leads to the `enum_t` structure; empty if it is the top level
    Enumerated { path: String },
}

impl Shape {
    pub fn is_classified(&self) -> bool {
        !matches!(self, Shape::Unclassified)
    }
    pub fn class_name(&self) -> &'static str {
        match self {
            Shape::Unclassified => "unclassified",
            Shape::Scalar { .. } => "scalar",
            Shape::ScalarArray { .. } => "scalarArray",
            Shape::Enumerated { .. } => "enumerated",
        }
    }
    /// The introspection type name of the value field
    pub fn field_type_name(&self) -> Option<&'static str> {
        match self {
            Shape::Unclassified => None,
            Shape::Scalar { .. } => Some("scalar"),
            Shape::ScalarArray { .. } => Some("scalarArray"),
            Shape::Enumerated { .. } => Some("structure"),
        }
    }
    pub fn element_scalar_type(&self) -> Option<ScalarType> {
        match self {
            Shape::Scalar { scalar_type, .. } | Shape::ScalarArray { scalar_type, .. } => {
                Some(*scalar_type)
            }
            Shape::Enumerated { .. } => Some(ScalarType::Int),
            Shape::Unclassified => None,
        }
    }
    pub fn is_numeric(&self) -> bool {
        match self {
            Shape::Scalar { scalar_type, .. } | Shape::ScalarArray { scalar_type, .. } => {
                scalar_type.is_numeric()
            }
            Shape::Enumerated { .. } => true,
            Shape::Unclassified => false,
        }
    }
    pub fn is_text(&self) -> bool {
        match self {
            Shape::Scalar { scalar_type, .. } | Shape::ScalarArray { scalar_type, .. } => {
                !scalar_type.is_numeric()
            }
            Shape::Enumerated { .. } => true,
            Shape::Unclassified => false,
        }
    }
    pub fn value_path(&self) -> Option<&str> {
        match self {
            Shape::Scalar { path, .. }
            | Shape::ScalarArray { path, .. }
            | Shape::Enumerated { path } => Some(path),
            Shape::Unclassified => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum DispatchError {
    #[error("structure has several fields ({}); name one as a sub-field", .0.join(", "))]
    Ambiguous(Vec<String>),
    #[error("unsupported {kind} at '{path}'")]
    Unsupported { path: String, kind: &'static str },
    #[error("no field '{0}'")]
    MissingField(String),
    #[error("expected {expected} at '{path}', found {found}")]
    ShapeChanged {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("shape has not been resolved")]
    Unclassified,
    #[error("no value to write")]
    EmptyValue,
    #[error("{0} values given for a scalar")]
    TooManyValues(usize),
    #[error("{0}")]
    Convert(#[from] ConvertError),
    #[error("'{0}' is not one of the choices")]
    UnknownChoice(String),
    #[error("choice index {index} is out of range for {count} choices")]
    ChoiceOutOfRange { index: f64, count: usize },
}

impl DispatchError {
    /// Attach the PV name, sorting into the public error taxonomy
    pub(crate) fn for_pv(self, name: &str) -> PvError {
        let reason = self.to_string();
        let name = name.to_string();
        match self {
            DispatchError::Unsupported { .. }
            | DispatchError::MissingField(_)
            | DispatchError::ShapeChanged { .. } => PvError::ProtocolIntrospection { name, reason },
            _ => PvError::ShapeMismatch { name, reason },
        }
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn is_enum_structure(s: &PvStructure) -> bool {
    s.id == ENUM_ID
        || (matches!(s.field("index"), Some(PvField::Scalar(_)))
            && matches!(
                s.field("choices"),
                Some(PvField::ScalarArray(ScalarArray::String(_)))
            ))
}

/// Work out the shape of a PV from a received structure
pub(crate) fn classify(
    structure: &PvStructure,
    sub_field: Option<&str>,
) -> Result<Shape, DispatchError> {
    match sub_field {
        None => classify_structure(String::new(), structure),
        Some(sub_field) => {
            let field = structure
                .get_path(sub_field)
                .ok_or_else(|| DispatchError::MissingField(sub_field.to_string()))?;
            classify_field(sub_field.to_string(), field)
        }
    }
}

fn classify_field(path: String, field: &PvField) -> Result<Shape, DispatchError> {
    match field {
        PvField::Scalar(value) => Ok(Shape::Scalar {
            path,
            scalar_type: value.scalar_type(),
        }),
        PvField::ScalarArray(array) => Ok(Shape::ScalarArray {
            path,
            scalar_type: array.scalar_type(),
        }),
        PvField::Structure(inner) => classify_structure(path, inner),
        PvField::StructureArray(_) => Err(DispatchError::Unsupported {
            path,
            kind: "structureArray",
        }),
    }
}

fn classify_structure(path: String, structure: &PvStructure) -> Result<Shape, DispatchError> {
    if is_enum_structure(structure) {
        return Ok(Shape::Enumerated { path });
    }
    if structure.is_normative()
        && let Some(value) = structure.field("value")
    {
        return classify_field(join_path(&path, "value"), value);
    }
    match structure.fields.as_slice() {
        [] => Err(DispatchError::Unsupported {
            path,
            kind: "empty structure",
        }),
        [(name, field)] => classify_field(join_path(&path, name), field),
        _ => Err(DispatchError::Ambiguous(structure.field_names())),
    }
}

fn lookup<'a>(structure: &'a PvStructure, path: &str) -> Result<&'a PvField, DispatchError> {
    structure
        .get_path(path)
        .ok_or_else(|| DispatchError::MissingField(path.to_string()))
}

/// The index and choice list of an enumerated value
fn enum_parts<'a>(
    structure: &'a PvStructure,
    path: &str,
) -> Result<(f64, &'a [String]), DispatchError> {
    let node = structure
        .get_structure(path)
        .ok_or_else(|| DispatchError::MissingField(path.to_string()))?;
    let index = match node.field("index") {
        Some(PvField::Scalar(value)) => value.as_f64(),
        _ => None,
    }
    .ok_or_else(|| DispatchError::MissingField(join_path(path, "index")))?;
    let choices = match node.field("choices") {
        Some(PvField::ScalarArray(ScalarArray::String(choices))) => choices.as_slice(),
        _ => &[],
    };
    Ok((index, choices))
}

/// The live choice labels of an enumerated PV
pub(crate) fn enum_choices(structure: &PvStructure, shape: &Shape) -> Vec<String> {
    match shape {
        Shape::Enumerated { path } => enum_parts(structure, path)
            .map(|(_, choices)| choices.to_vec())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Extract a structure's value into an existing Reading, reusing its buffers
pub(crate) fn extract_into(
    structure: &PvStructure,
    shape: &Shape,
    reading: &mut Reading,
) -> Result<(), DispatchError> {
    match shape {
        Shape::Unclassified => return Err(DispatchError::Unclassified),
        Shape::Scalar { path, .. } => match lookup(structure, path)? {
            PvField::Scalar(value) => match value.as_f64() {
                Some(number) => reading.fill_numeric(|values| {
                    values.clear();
                    values.push(number);
                }),
                None => reading.fill_text(|texts| {
                    texts.clear();
                    texts.push(value.to_text());
                }),
            },
            other => {
                return Err(DispatchError::ShapeChanged {
                    path: path.clone(),
                    expected: "scalar",
                    found: other.type_name(),
                });
            }
        },
        Shape::ScalarArray { path, .. } => match lookup(structure, path)? {
            PvField::ScalarArray(array) => {
                if array.scalar_type().is_numeric() {
                    reading.fill_numeric(|values| {
                        array.copy_numeric_into(values);
                    });
                } else {
                    reading.fill_text(|texts| array.copy_text_into(texts));
                }
            }
            other => {
                return Err(DispatchError::ShapeChanged {
                    path: path.clone(),
                    expected: "scalarArray",
                    found: other.type_name(),
                });
            }
        },
        Shape::Enumerated { path } => {
            let (index, choices) = enum_parts(structure, path)?;
            let index = index as i64;
            // An index outside the choice list has no label; show the number instead
            match usize::try_from(index).ok().and_then(|i| choices.get(i)) {
                Some(label) => reading.fill_choice(index, label),
                None => reading.fill_choice(index, &index.to_string()),
            }
        }
    }
    Ok(())
}

/// Extract a structure's value into a new Reading
pub(crate) fn extract(structure: &PvStructure, shape: &Shape) -> Result<Reading, DispatchError> {
    let mut reading = Reading::default();
    extract_into(structure, shape, &mut reading)?;
    Ok(reading)
}

/// Build the write for a Reading: the field path to write and the wire value.
///
/// `choices` is the live choice list of an enumerated PV, and is ignored otherwise.
pub(crate) fn inject(
    shape: &Shape,
    reading: &Reading,
    choices: &[String],
) -> Result<(String, PvField), DispatchError> {
    match shape {
        Shape::Unclassified => Err(DispatchError::Unclassified),
        Shape::Scalar { path, scalar_type } => {
            if reading.len() > 1 {
                return Err(DispatchError::TooManyValues(reading.len()));
            }
            let value = match (reading.first_text(), reading.first_value()) {
                (Some(text), _) => ScalarValue::parse_as(*scalar_type, text)?,
                (None, Some(number)) => ScalarValue::from_f64(*scalar_type, number)?,
                (None, None) => return Err(DispatchError::EmptyValue),
            };
            Ok((path.clone(), PvField::Scalar(value)))
        }
        Shape::ScalarArray { path, scalar_type } => {
            let array = if reading.is_text() {
                ScalarArray::parse_into(*scalar_type, reading.text_values())?
            } else {
                ScalarArray::from_f64s(*scalar_type, reading.values())?
            };
            Ok((path.clone(), PvField::ScalarArray(array)))
        }
        Shape::Enumerated { path } => {
            let index = choice_index(reading, choices)?;
            Ok((
                join_path(path, "index"),
                PvField::Scalar(ScalarValue::Int(index as i32)),
            ))
        }
    }
}

/// Resolve a Reading to a validated choice index
fn choice_index(reading: &Reading, choices: &[String]) -> Result<usize, DispatchError> {
    let number = match (reading.first_text(), reading.first_value()) {
        (Some(label), _) => {
            if let Some(index) = choices.iter().position(|c| c == label) {
                return Ok(index);
            }
            // Not a label, but may still be a number written as text
            label
                .trim()
                .parse::<f64>()
                .map_err(|_| DispatchError::UnknownChoice(label.to_string()))?
        }
        (None, Some(number)) => number,
        (None, None) => return Err(DispatchError::EmptyValue),
    };
    if number < 0.0 || number.fract() != 0.0 || number >= choices.len() as f64 {
        return Err(DispatchError::ChoiceOutOfRange {
            index: number,
            count: choices.len(),
        });
    }
    Ok(number as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::{nt_enum, nt_scalar, nt_scalar_array};

    fn choices() -> Vec<String> {
        vec!["Off".to_string(), "On".to_string()]
    }

    #[test]
    fn classify_normative_types() {
        assert_eq!(
            classify(&nt_scalar(1.0f64), None).unwrap(),
            Shape::Scalar {
                path: "value".into(),
                scalar_type: ScalarType::Double
            }
        );
        assert_eq!(
            classify(&nt_scalar_array(vec![1i32, 2]), None).unwrap(),
            Shape::ScalarArray {
                path: "value".into(),
                scalar_type: ScalarType::Int
            }
        );
        let shape = classify(&nt_enum(0, &["Off", "On"]), None).unwrap();
        assert_eq!(
            shape,
            Shape::Enumerated {
                path: "value".into()
            }
        );
        assert!(shape.is_numeric() && shape.is_text());
    }

    #[test]
    fn classify_generic_structures() {
        // Single fields are followed all the way down
        let nested = PvStructure::new("outer").with_field(
            "inner",
            PvStructure::new("middle").with_field("x", ScalarValue::String("hi".into())),
        );
        let shape = classify(&nested, None).unwrap();
        assert_eq!(shape.value_path(), Some("inner.x"));
        assert!(shape.is_text() && !shape.is_numeric());

        let wide = PvStructure::new("wide")
            .with_field("a", ScalarValue::Double(1.0))
            .with_field("b", nt_scalar(2.0f64));
        assert_eq!(
            classify(&wide, None),
            Err(DispatchError::Ambiguous(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            classify(&wide, Some("b")).unwrap().value_path(),
            Some("b.value")
        );
        assert_eq!(
            classify(&wide, Some("c")),
            Err(DispatchError::MissingField("c".into()))
        );

        let unsupported = PvStructure::new("table").with_field("rows", PvField::StructureArray(vec![]));
        assert!(matches!(
            classify(&unsupported, None),
            Err(DispatchError::Unsupported { .. })
        ));
        assert!(matches!(
            classify(&unsupported, None).unwrap_err().for_pv("T"),
            PvError::ProtocolIntrospection { .. }
        ));
    }

    #[test]
    fn extract_shapes() {
        let s = nt_scalar(1.0f32);
        let shape = classify(&s, None).unwrap();
        assert_eq!(extract(&s, &shape).unwrap().values(), &[1.0]);

        let b = nt_scalar(true);
        let shape = classify(&b, None).unwrap();
        assert_eq!(extract(&b, &shape).unwrap().text_values(), &["true"]);

        let e = nt_enum(1, &["Off", "On"]);
        let shape = classify(&e, None).unwrap();
        assert_eq!(extract(&e, &shape).unwrap(), Reading::choice(1, "On"));

        // Indices without a label keep their raw number, negative ones included
        for index in [-1, 2] {
            let e = nt_enum(index, &["Off", "On"]);
            let reading = extract(&e, &shape).unwrap();
            assert_eq!(reading.values(), &[index as f64]);
            assert_eq!(reading.text_values(), &[index.to_string()]);
        }

        // Array lengths can change between readings, into the same buffer
        let shape = classify(&nt_scalar_array(vec![1.0f64, 2.0, 3.0]), None).unwrap();
        let mut reading = Reading::default();
        extract_into(&nt_scalar_array(vec![1.0f64, 2.0, 3.0]), &shape, &mut reading).unwrap();
        assert_eq!(reading.len(), 3);
        extract_into(&nt_scalar_array(vec![5.0f64]), &shape, &mut reading).unwrap();
        assert_eq!(reading.values(), &[5.0]);

        // A structure that no longer matches its cached shape is reported
        assert!(matches!(
            extract(&nt_scalar(1.0f64), &shape),
            Err(DispatchError::ShapeChanged { .. })
        ));
    }

    #[test]
    fn inject_enum_label_or_index() {
        let shape = Shape::Enumerated {
            path: "value".into(),
        };
        let by_label = inject(&shape, &"On".into(), &choices()).unwrap();
        let by_index = inject(&shape, &1.0.into(), &choices()).unwrap();
        let by_text_index = inject(&shape, &"1".into(), &choices()).unwrap();
        assert_eq!(by_label, by_index);
        assert_eq!(by_label, by_text_index);
        assert_eq!(by_label.0, "value.index");

        assert!(matches!(
            inject(&shape, &2.0.into(), &choices()),
            Err(DispatchError::ChoiceOutOfRange { count: 2, .. })
        ));
        assert!(matches!(
            inject(&shape, &"Maybe".into(), &choices()),
            Err(DispatchError::UnknownChoice(_))
        ));
        assert!(matches!(
            inject(&shape, &0.5.into(), &choices()),
            Err(DispatchError::ChoiceOutOfRange { .. })
        ));
    }

    #[test]
    fn inject_scalars_and_arrays() {
        let shape = Shape::Scalar {
            path: "value".into(),
            scalar_type: ScalarType::Int,
        };
        assert_eq!(
            inject(&shape, &"42".into(), &[]).unwrap(),
            ("value".into(), PvField::Scalar(ScalarValue::Int(42)))
        );
        assert!(matches!(
            inject(&shape, &"forty".into(), &[]),
            Err(DispatchError::Convert(_))
        ));
        assert!(matches!(
            inject(&shape, &vec![1.0, 2.0].into(), &[]),
            Err(DispatchError::TooManyValues(2))
        ));
        assert!(matches!(
            inject(&shape, &Reading::numeric(vec![]), &[]),
            Err(DispatchError::EmptyValue)
        ));

        let shape = Shape::ScalarArray {
            path: "value".into(),
            scalar_type: ScalarType::UShort,
        };
        assert_eq!(
            inject(&shape, &vec!["1", "2"].into(), &[]).unwrap().1,
            PvField::ScalarArray(ScalarArray::UShort(vec![1, 2]))
        );
        assert!(inject(&shape, &vec![-1.0].into(), &[]).is_err());
        assert!(matches!(
            inject(&Shape::Unclassified, &1.0.into(), &[])
                .unwrap_err()
                .for_pv("X"),
            PvError::ShapeMismatch { .. }
        ));
    }
}
