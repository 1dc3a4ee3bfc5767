//! Packing projection rows
//!
//! A [`ResultPacker`] knows the aliases and types of a projection and turns
//! each raw row into the value a caller asked for: the lone column, an
//! array, an alias-keyed map, or a user type implementing [`ResultTarget`].

use crate::filters;
use stead_core::{FieldValue, SteadError, SteadResult, TypeCode};

/// What a packed row becomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackTarget {
    /// The single column itself
    Scalar,
    /// `FieldValue::Array` of the columns
    Array,
    /// `FieldValue::Map` keyed by alias
    Map,
}

/// A user type rows can be packed into.
///
/// Aliases are matched against [`ResultTarget::properties`] ignoring ASCII
/// case. Aliases without a matching property go to [`ResultTarget::put`].
pub trait ResultTarget: Default {
    /// Settable property names
    fn properties() -> &'static [&'static str];

    /// Store `value` in `property`, one of [`ResultTarget::properties`]
    fn set_property(&mut self, property: &str, value: FieldValue) -> SteadResult<()>;

    /// Fallback for aliases that match no property
    fn put(&mut self, alias: &str, _value: FieldValue) -> SteadResult<()> {
        Err(SteadError::user(format!(
            "no property matches result alias '{}'",
            alias
        )))
    }
}

/// Packs projection rows into results
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPacker {
    columns: Vec<(String, TypeCode)>,
    target: PackTarget,
}

impl ResultPacker {
    /// Packer for `columns` as `(alias, type)` pairs.
    ///
    /// # Errors
    ///
    /// A scalar packer needs exactly one column; map aliases must be unique
    /// ignoring case.
    pub fn new(columns: Vec<(String, TypeCode)>, target: PackTarget) -> SteadResult<Self> {
        if target == PackTarget::Scalar && columns.len() != 1 {
            return Err(SteadError::user(format!(
                "a scalar result needs one column, not {}",
                columns.len()
            )));
        }
        if target == PackTarget::Map {
            for (i, (alias, _)) in columns.iter().enumerate() {
                if columns[..i].iter().any(|(a, _)| a.eq_ignore_ascii_case(alias)) {
                    return Err(SteadError::user(format!("duplicate result alias '{}'", alias)));
                }
            }
        }
        Ok(ResultPacker { columns, target })
    }

    /// Packer returning the single column of type `type_code`
    pub fn scalar(type_code: TypeCode) -> Self {
        ResultPacker {
            columns: vec![(String::new(), type_code)],
            target: PackTarget::Scalar,
        }
    }

    /// Packer returning an array of columns of `types`
    pub fn array(types: Vec<TypeCode>) -> Self {
        ResultPacker {
            columns: types
                .into_iter()
                .enumerate()
                .map(|(i, t)| (i.to_string(), t))
                .collect(),
            target: PackTarget::Array,
        }
    }

    /// Number of columns per row
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Packing target
    pub fn target(&self) -> PackTarget {
        self.target
    }

    /// Column aliases in order
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(a, _)| a.as_str())
    }

    fn converted(&self, row: &[FieldValue]) -> SteadResult<Vec<FieldValue>> {
        if row.len() != self.columns.len() {
            return Err(SteadError::user(format!(
                "row has {} columns but the projection has {}",
                row.len(),
                self.columns.len()
            )));
        }
        row.iter()
            .zip(&self.columns)
            .map(|(value, (_, code))| filters::convert(value, *code))
            .collect()
    }

    /// Pack one row
    pub fn pack(&self, row: &[FieldValue]) -> SteadResult<FieldValue> {
        let mut values = self.converted(row)?;
        Ok(match self.target {
            PackTarget::Scalar => values.pop().unwrap_or(FieldValue::Null),
            PackTarget::Array => FieldValue::Array(values),
            PackTarget::Map => FieldValue::Map(
                self.columns
                    .iter()
                    .map(|(alias, _)| FieldValue::String(alias.clone()))
                    .zip(values)
                    .collect(),
            ),
        })
    }

    /// Pack every row
    pub fn pack_all(&self, rows: &[Vec<FieldValue>]) -> SteadResult<Vec<FieldValue>> {
        rows.iter().map(|row| self.pack(row)).collect()
    }

    /// Pack one row into a fresh `T`
    pub fn pack_into<T: ResultTarget>(&self, row: &[FieldValue]) -> SteadResult<T> {
        let values = self.converted(row)?;
        let mut target = T::default();
        for ((alias, _), value) in self.columns.iter().zip(values) {
            match T::properties()
                .iter()
                .find(|p| p.eq_ignore_ascii_case(alias))
            {
                Some(property) => target.set_property(property, value)?,
                None => target.put(alias, value)?,
            }
        }
        Ok(target)
    }
}
