//! The uniform in-memory value model.
//!
//! Whatever shape a PV has on the wire, one sample of it is held as a [`Reading`]: a
//! sequence of doubles, a sequence of strings, or (for enumerated PVs only) both a
//! single index and its label.

use std::fmt;

/// One sampled value of a PV
///
/// A Reading is exclusively owned by the buffer holding it. The constructors enforce
/// that exactly one of [`Reading::values`] and [`Reading::text_values`] is populated,
/// except for [`Reading::choice`] where both are.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reading {
    values: Vec<f64>,
    text_values: Vec<String>,
}

impl Reading {
    pub fn numeric(values: Vec<f64>) -> Self {
        Reading {
            values,
            text_values: Vec::new(),
        }
    }
    pub fn text(text_values: Vec<String>) -> Self {
        Reading {
            values: Vec::new(),
            text_values,
        }
    }
    /// An enumerated reading: the choice index and its label
    pub fn choice(index: i64, label: impl Into<String>) -> Self {
        Reading {
            values: vec![index as f64],
            text_values: vec![label.into()],
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
    pub fn text_values(&self) -> &[String] {
        &self.text_values
    }

    /// Number of elements in this reading
    pub fn len(&self) -> usize {
        self.values.len().max(self.text_values.len())
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_numeric(&self) -> bool {
        !self.values.is_empty() || self.text_values.is_empty()
    }
    pub fn is_text(&self) -> bool {
        !self.text_values.is_empty()
    }
    pub fn is_choice(&self) -> bool {
        self.values.len() == 1 && self.text_values.len() == 1
    }

    /// The first numeric element, if any
    pub fn first_value(&self) -> Option<f64> {
        self.values.first().copied()
    }
    /// The first text element, if any
    pub fn first_text(&self) -> Option<&str> {
        self.text_values.first().map(String::as_str)
    }

    /// Overwrite in place with numeric data, reusing the existing allocation
    pub(crate) fn fill_numeric(&mut self, fill: impl FnOnce(&mut Vec<f64>)) {
        self.text_values.clear();
        fill(&mut self.values);
    }

    /// Overwrite in place with text data, reusing the existing allocation
    pub(crate) fn fill_text(&mut self, fill: impl FnOnce(&mut Vec<String>)) {
        self.values.clear();
        fill(&mut self.text_values);
    }

    pub(crate) fn fill_choice(&mut self, index: i64, label: &str) {
        self.values.clear();
        self.values.push(index as f64);
        self.text_values.clear();
        self.text_values.push(label.to_string());
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_choice() {
            return write!(f, "{}", self.text_values[0]);
        }
        if !self.text_values.is_empty() {
            return write!(f, "{}", self.text_values.join(" "));
        }
        let display = self
            .values
            .iter()
            .map(|v| format!("{v}"))
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{display}")
    }
}

/// Implement From<numeric> conversions into a numeric reading
macro_rules! impl_reading_numeric_conversions {
    ($($typ:ty),*) => {
        $(
            impl From<$typ> for Reading {
                fn from(value: $typ) -> Self {
                    Reading::numeric(vec![value as f64])
                }
            }
            impl From<Vec<$typ>> for Reading {
                fn from(value: Vec<$typ>) -> Self {
                    Reading::numeric(value.into_iter().map(|v| v as f64).collect())
                }
            }
        )*
    };
}
impl_reading_numeric_conversions!(i16, i32, i64, u16, u32, f32, f64);

impl From<&str> for Reading {
    fn from(value: &str) -> Self {
        Reading::text(vec![value.to_string()])
    }
}
impl From<String> for Reading {
    fn from(value: String) -> Self {
        Reading::text(vec![value])
    }
}
impl From<Vec<String>> for Reading {
    fn from(value: Vec<String>) -> Self {
        Reading::text(value)
    }
}
impl From<Vec<&str>> for Reading {
    fn from(value: Vec<&str>) -> Self {
        Reading::text(value.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_populated() {
        let n: Reading = vec![1.0, 2.0].into();
        assert_eq!(n.values(), &[1.0, 2.0]);
        assert!(n.text_values().is_empty());
        assert!(n.is_numeric() && !n.is_text());

        let t: Reading = "On".into();
        assert!(t.values().is_empty());
        assert!(t.is_text() && !t.is_numeric());

        let c = Reading::choice(1, "On");
        assert!(c.is_numeric() && c.is_text() && c.is_choice());
        assert_eq!(c.len(), 1);
        assert_eq!(c.to_string(), "On");
    }

    #[test]
    fn fill_switches_kind() {
        let mut r = Reading::text(vec!["a".into(), "b".into()]);
        r.fill_numeric(|v| v.extend([1.0, 2.0, 3.0]));
        assert_eq!(r.len(), 3);
        assert!(r.text_values().is_empty());
        assert_eq!(r.to_string(), "1 2 3");
        r.fill_choice(0, "Off");
        assert_eq!(r, Reading::choice(0, "Off"));
    }
}
