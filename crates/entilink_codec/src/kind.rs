//! Type descriptors and metadata type-expression resolution.

use crate::error::{CodecError, CodecResult};
use std::collections::BTreeMap;
use std::fmt;

/// Primitive kinds understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `Edm.Boolean`
    Boolean,
    /// `Edm.Byte` (unsigned 8-bit)
    Byte,
    /// `Edm.SByte` (signed 8-bit)
    SByte,
    /// `Edm.Int16`
    Int16,
    /// `Edm.Int32`
    Int32,
    /// `Edm.Int64`
    Int64,
    /// `Edm.Single`
    Single,
    /// `Edm.Double`
    Double,
    /// `Edm.Decimal`
    Decimal,
    /// `Edm.String`
    String,
    /// `Edm.Binary`
    Binary,
    /// `Edm.Guid`
    Guid,
    /// `Edm.Date`
    Date,
    /// `Edm.DateTimeOffset`
    DateTimeOffset,
    /// `Edm.TimeOfDay`
    TimeOfDay,
    /// `Edm.Duration`
    Duration,
}

impl PrimitiveKind {
    const ALL: [PrimitiveKind; 16] = [
        PrimitiveKind::Boolean,
        PrimitiveKind::Byte,
        PrimitiveKind::SByte,
        PrimitiveKind::Int16,
        PrimitiveKind::Int32,
        PrimitiveKind::Int64,
        PrimitiveKind::Single,
        PrimitiveKind::Double,
        PrimitiveKind::Decimal,
        PrimitiveKind::String,
        PrimitiveKind::Binary,
        PrimitiveKind::Guid,
        PrimitiveKind::Date,
        PrimitiveKind::DateTimeOffset,
        PrimitiveKind::TimeOfDay,
        PrimitiveKind::Duration,
    ];

    /// Returns the qualified metadata name, e.g. `Edm.Int32`.
    pub fn edm_name(self) -> &'static str {
        match self {
            PrimitiveKind::Boolean => "Edm.Boolean",
            PrimitiveKind::Byte => "Edm.Byte",
            PrimitiveKind::SByte => "Edm.SByte",
            PrimitiveKind::Int16 => "Edm.Int16",
            PrimitiveKind::Int32 => "Edm.Int32",
            PrimitiveKind::Int64 => "Edm.Int64",
            PrimitiveKind::Single => "Edm.Single",
            PrimitiveKind::Double => "Edm.Double",
            PrimitiveKind::Decimal => "Edm.Decimal",
            PrimitiveKind::String => "Edm.String",
            PrimitiveKind::Binary => "Edm.Binary",
            PrimitiveKind::Guid => "Edm.Guid",
            PrimitiveKind::Date => "Edm.Date",
            PrimitiveKind::DateTimeOffset => "Edm.DateTimeOffset",
            PrimitiveKind::TimeOfDay => "Edm.TimeOfDay",
            PrimitiveKind::Duration => "Edm.Duration",
        }
    }

    /// Looks up a kind by its qualified metadata name.
    pub fn from_edm_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.edm_name() == name)
    }

    /// Inclusive integral range, for the integral kinds.
    pub fn integral_range(self) -> Option<(i64, i64)> {
        match self {
            PrimitiveKind::Byte => Some((0, i64::from(u8::MAX))),
            PrimitiveKind::SByte => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            PrimitiveKind::Int16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            PrimitiveKind::Int32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            PrimitiveKind::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Kinds carried as ISO text on the wire.
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            PrimitiveKind::String
                | PrimitiveKind::Date
                | PrimitiveKind::DateTimeOffset
                | PrimitiveKind::TimeOfDay
                | PrimitiveKind::Duration
        )
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.edm_name())
    }
}

/// A structured type with named fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexType {
    /// Qualified type name.
    pub name: String,
    /// Field name to field type.
    pub fields: BTreeMap<String, TypeDescriptor>,
}

impl ComplexType {
    /// Creates a complex type without fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }
}

/// Declared type of a structural property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    /// A primitive value.
    Primitive(PrimitiveKind),
    /// A complex value.
    Complex(ComplexType),
    /// A collection of values of the element type.
    Collection(Box<TypeDescriptor>),
}

impl TypeDescriptor {
    /// Parses a type expression naming only primitive types,
    /// e.g. `Edm.String` or `Collection(Edm.Int32)`.
    pub fn parse(expression: &str) -> CodecResult<Self> {
        Self::parse_with(expression, |_| None)
    }

    /// Parses a type expression, resolving non-primitive names through
    /// `resolve_complex`.
    pub fn parse_with<F>(expression: &str, resolve_complex: F) -> CodecResult<Self>
    where
        F: Fn(&str) -> Option<ComplexType>,
    {
        Self::parse_inner(expression.trim(), &resolve_complex)
    }

    fn parse_inner<F>(expression: &str, resolve_complex: &F) -> CodecResult<Self>
    where
        F: Fn(&str) -> Option<ComplexType>,
    {
        if let Some(inner) = expression
            .strip_prefix("Collection(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let element = Self::parse_inner(inner.trim(), resolve_complex)?;
            return Ok(TypeDescriptor::Collection(Box::new(element)));
        }

        if let Some(kind) = PrimitiveKind::from_edm_name(expression) {
            return Ok(TypeDescriptor::Primitive(kind));
        }

        resolve_complex(expression)
            .map(TypeDescriptor::Complex)
            .ok_or_else(|| CodecError::unknown_type(expression))
    }

    /// Renders the type back to its expression form.
    pub fn expression(&self) -> String {
        match self {
            TypeDescriptor::Primitive(kind) => kind.edm_name().to_string(),
            TypeDescriptor::Complex(complex) => complex.name.clone(),
            TypeDescriptor::Collection(element) => format!("Collection({})", element.expression()),
        }
    }
}

impl From<PrimitiveKind> for TypeDescriptor {
    fn from(kind: PrimitiveKind) -> Self {
        TypeDescriptor::Primitive(kind)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}
