//! Nested result shapes
//!
//! A [`ResultShape`] is a tree: leaves are primitive columns, inner nodes
//! group their children into an array or a map. Packing walks the tree
//! left to right, consuming one column of a flat projection row per leaf.

use crate::filters;
use stead_core::{FieldValue, SteadError, SteadResult, TypeCode};

/// What a shape node produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// One column converted to the given type
    Primitive(TypeCode),
    /// Children packed positionally
    Array,
    /// Children packed by alias
    Map,
}

/// Node of a result shape tree
#[derive(Debug, Clone, PartialEq)]
pub struct ResultShape {
    alias: Option<String>,
    kind: ShapeKind,
    children: Vec<ResultShape>,
}

impl ResultShape {
    /// Leaf consuming one column of type `type_code`
    pub fn primitive(type_code: TypeCode) -> Self {
        ResultShape {
            alias: None,
            kind: ShapeKind::Primitive(type_code),
            children: Vec::new(),
        }
    }

    /// Compound node packing `children` into an array
    pub fn array(children: Vec<ResultShape>) -> Self {
        ResultShape {
            alias: None,
            kind: ShapeKind::Array,
            children,
        }
    }

    /// Compound node packing `children` into a map keyed by alias
    pub fn map(children: Vec<ResultShape>) -> Self {
        ResultShape {
            alias: None,
            kind: ShapeKind::Map,
            children,
        }
    }

    /// Name this node within its parent
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Append a child.
    ///
    /// # Errors
    ///
    /// Primitive nodes take no children.
    pub fn nest(&mut self, child: ResultShape) -> SteadResult<()> {
        if self.is_primitive() {
            return Err(SteadError::user("cannot nest a shape under a primitive"));
        }
        self.children.push(child);
        Ok(())
    }

    /// Alias within the parent
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Node kind
    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    /// Child nodes in column order
    pub fn children(&self) -> &[ResultShape] {
        &self.children
    }

    /// Whether this is a leaf
    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, ShapeKind::Primitive(_))
    }

    /// Whether any child is itself compound
    pub fn is_nested(&self) -> bool {
        self.children.iter().any(|c| !c.is_primitive())
    }

    /// Number of row columns this shape consumes
    pub fn width(&self) -> usize {
        match self.kind {
            ShapeKind::Primitive(_) => 1,
            _ => self.children.iter().map(ResultShape::width).sum(),
        }
    }

    /// Leaf types in column order
    pub fn column_types(&self) -> Vec<TypeCode> {
        let mut out = Vec::with_capacity(self.width());
        self.collect_types(&mut out);
        out
    }

    fn collect_types(&self, out: &mut Vec<TypeCode>) {
        match self.kind {
            ShapeKind::Primitive(code) => out.push(code),
            _ => self.children.iter().for_each(|c| c.collect_types(out)),
        }
    }

    /// Turn a flat row into the nested structure this shape describes.
    ///
    /// # Errors
    ///
    /// Fails when the row width does not match or a column cannot be
    /// converted to its leaf type.
    pub fn pack(&self, row: &[FieldValue]) -> SteadResult<FieldValue> {
        if row.len() != self.width() {
            return Err(SteadError::user(format!(
                "row has {} columns but the shape expects {}",
                row.len(),
                self.width()
            )));
        }
        let mut pos = 0;
        self.pack_from(row, &mut pos)
    }

    fn pack_from(&self, row: &[FieldValue], pos: &mut usize) -> SteadResult<FieldValue> {
        match self.kind {
            ShapeKind::Primitive(code) => {
                let value = &row[*pos];
                *pos += 1;
                filters::convert(value, code)
            }
            ShapeKind::Array => {
                let items = self
                    .children
                    .iter()
                    .map(|c| c.pack_from(row, pos))
                    .collect::<SteadResult<Vec<_>>>()?;
                Ok(FieldValue::Array(items))
            }
            ShapeKind::Map => {
                let mut entries = Vec::with_capacity(self.children.len());
                for (i, child) in self.children.iter().enumerate() {
                    let key = child.alias.clone().unwrap_or_else(|| i.to_string());
                    entries.push((FieldValue::String(key), child.pack_from(row, pos)?));
                }
                Ok(FieldValue::Map(entries))
            }
        }
    }
}
