use crate::event::FieldType;
use crate::{Error, Result};

/// What a catalog type maps to. Unknown types are only an error once a
/// replicated column actually uses one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeMapping {
    Known(FieldType),
    NotImplemented(String),
}

impl TypeMapping {
    pub fn from_type_name(type_name: &str) -> Self {
        // Array types are named after their element type with a leading underscore.
        if let Some(element) = type_name.strip_prefix('_') {
            return match scalar_type(element).and_then(FieldType::array_of) {
                Some(array) => TypeMapping::Known(array),
                None => TypeMapping::NotImplemented(type_name.to_string()),
            };
        }

        match scalar_type(type_name) {
            Some(field_type) => TypeMapping::Known(field_type),
            None => TypeMapping::NotImplemented(type_name.to_string()),
        }
    }

    pub fn field_type(&self) -> Result<FieldType> {
        match self {
            TypeMapping::Known(field_type) => Ok(*field_type),
            TypeMapping::NotImplemented(name) => Err(Error::NotImplemented(format!(
                "the type '{}' is not yet implemented",
                name
            ))),
        }
    }
}

fn scalar_type(type_name: &str) -> Option<FieldType> {
    let field_type = match type_name {
        "int2" => FieldType::Int16,
        "int4" => FieldType::Int32,
        "int8" => FieldType::Int64,
        "float4" => FieldType::Float,
        "float8" => FieldType::Double,
        "bool" | "boolean" => FieldType::Boolean,
        "json" => FieldType::Json,
        "jsonb" => FieldType::Jsonb,
        "varchar" | "text" => FieldType::Text,
        "uuid" => FieldType::Uuid,
        "bpchar" => FieldType::Char,
        "bytea" => FieldType::Bytes,
        "date" => FieldType::Date,
        "time" => FieldType::Time,
        "timestamp" => FieldType::Timestamp,
        "timestamptz" => FieldType::TimestampTz,
        _ => return None,
    };
    Some(field_type)
}
