//! Transport-neutral change events.
//!
//! A [`Transaction`] envelope is what a collector hands to a [`Sink`](crate::sink::Sink)
//! and what a processor replays. Everything here derives serde so an
//! external transport can ship envelopes as JSON.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Semantic type of a replicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// Placeholder for a value that was sent as SQL NULL.
    Null,
    Float,
    Double,
    Boolean,
    Text,
    Json,
    Jsonb,
    Uuid,
    Char,
    Int16,
    Int32,
    Int64,
    Bytes,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    FloatArray,
    DoubleArray,
    BooleanArray,
    TextArray,
    JsonArray,
    JsonbArray,
    UuidArray,
    CharArray,
    Int16Array,
    Int32Array,
    Int64Array,
    BytesArray,
    DateArray,
    TimeArray,
    TimestampArray,
    TimestampTzArray,
}

impl FieldType {
    pub fn is_array(&self) -> bool {
        self.element_type().is_some()
    }

    /// The scalar type of an array type's elements.
    pub fn element_type(&self) -> Option<FieldType> {
        let element = match self {
            FieldType::FloatArray => FieldType::Float,
            FieldType::DoubleArray => FieldType::Double,
            FieldType::BooleanArray => FieldType::Boolean,
            FieldType::TextArray => FieldType::Text,
            FieldType::JsonArray => FieldType::Json,
            FieldType::JsonbArray => FieldType::Jsonb,
            FieldType::UuidArray => FieldType::Uuid,
            FieldType::CharArray => FieldType::Char,
            FieldType::Int16Array => FieldType::Int16,
            FieldType::Int32Array => FieldType::Int32,
            FieldType::Int64Array => FieldType::Int64,
            FieldType::BytesArray => FieldType::Bytes,
            FieldType::DateArray => FieldType::Date,
            FieldType::TimeArray => FieldType::Time,
            FieldType::TimestampArray => FieldType::Timestamp,
            FieldType::TimestampTzArray => FieldType::TimestampTz,
            _ => return None,
        };
        Some(element)
    }

    /// The array type whose elements are `self`. Arrays of arrays do not exist.
    pub fn array_of(self) -> Option<FieldType> {
        let array = match self {
            FieldType::Float => FieldType::FloatArray,
            FieldType::Double => FieldType::DoubleArray,
            FieldType::Boolean => FieldType::BooleanArray,
            FieldType::Text => FieldType::TextArray,
            FieldType::Json => FieldType::JsonArray,
            FieldType::Jsonb => FieldType::JsonbArray,
            FieldType::Uuid => FieldType::UuidArray,
            FieldType::Char => FieldType::CharArray,
            FieldType::Int16 => FieldType::Int16Array,
            FieldType::Int32 => FieldType::Int32Array,
            FieldType::Int64 => FieldType::Int64Array,
            FieldType::Bytes => FieldType::BytesArray,
            FieldType::Date => FieldType::DateArray,
            FieldType::Time => FieldType::TimeArray,
            FieldType::Timestamp => FieldType::TimestampArray,
            FieldType::TimestampTz => FieldType::TimestampTzArray,
            _ => return None,
        };
        Some(array)
    }
}

/// A typed column value. The variant doubles as the value's [`FieldType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldValue {
    Null,
    Float(#[serde(with = "float_text")] f32),
    Double(#[serde(with = "float_text")] f64),
    Boolean(bool),
    Text(String),
    /// Raw JSON text, kept verbatim so `json` columns keep their formatting.
    Json(String),
    Jsonb(String),
    Uuid(Uuid),
    Char(String),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    FloatArray(#[serde(with = "float_text::vec")] Vec<f32>),
    DoubleArray(#[serde(with = "float_text::vec")] Vec<f64>),
    BooleanArray(Vec<bool>),
    TextArray(Vec<String>),
    JsonArray(Vec<String>),
    JsonbArray(Vec<String>),
    UuidArray(Vec<Uuid>),
    CharArray(Vec<String>),
    Int16Array(Vec<i16>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    BytesArray(#[serde(with = "base64_bytes_vec")] Vec<Vec<u8>>),
    DateArray(Vec<NaiveDate>),
    TimeArray(Vec<NaiveTime>),
    TimestampArray(Vec<NaiveDateTime>),
    TimestampTzArray(Vec<DateTime<FixedOffset>>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Null => FieldType::Null,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Json(_) => FieldType::Json,
            FieldValue::Jsonb(_) => FieldType::Jsonb,
            FieldValue::Uuid(_) => FieldType::Uuid,
            FieldValue::Char(_) => FieldType::Char,
            FieldValue::Int16(_) => FieldType::Int16,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Bytes(_) => FieldType::Bytes,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Time(_) => FieldType::Time,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
            FieldValue::TimestampTz(_) => FieldType::TimestampTz,
            FieldValue::FloatArray(_) => FieldType::FloatArray,
            FieldValue::DoubleArray(_) => FieldType::DoubleArray,
            FieldValue::BooleanArray(_) => FieldType::BooleanArray,
            FieldValue::TextArray(_) => FieldType::TextArray,
            FieldValue::JsonArray(_) => FieldType::JsonArray,
            FieldValue::JsonbArray(_) => FieldType::JsonbArray,
            FieldValue::UuidArray(_) => FieldType::UuidArray,
            FieldValue::CharArray(_) => FieldType::CharArray,
            FieldValue::Int16Array(_) => FieldType::Int16Array,
            FieldValue::Int32Array(_) => FieldType::Int32Array,
            FieldValue::Int64Array(_) => FieldType::Int64Array,
            FieldValue::BytesArray(_) => FieldType::BytesArray,
            FieldValue::DateArray(_) => FieldType::DateArray,
            FieldValue::TimeArray(_) => FieldType::TimeArray,
            FieldValue::TimestampArray(_) => FieldType::TimestampArray,
            FieldValue::TimestampTzArray(_) => FieldType::TimestampTzArray,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// One named column value of a row image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, FieldValue::Null)
    }

    pub fn field_type(&self) -> FieldType {
        self.value.field_type()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertEvent {
    pub id: Uuid,
    pub namespace: String,
    pub table: String,
    pub transaction_id: u32,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub id: Uuid,
    pub namespace: String,
    pub table: String,
    pub transaction_id: u32,
    /// Fields locating the row on the destination.
    pub identifying_fields: Vec<Field>,
    /// Fields to write.
    pub updated_fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub id: Uuid,
    pub namespace: String,
    pub table: String,
    pub transaction_id: u32,
    pub identifying_fields: Vec<Field>,
}

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DataChangeEvent {
    Insert(InsertEvent),
    Update(UpdateEvent),
    Delete(DeleteEvent),
}

impl DataChangeEvent {
    pub fn id(&self) -> Uuid {
        match self {
            DataChangeEvent::Insert(e) => e.id,
            DataChangeEvent::Update(e) => e.id,
            DataChangeEvent::Delete(e) => e.id,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            DataChangeEvent::Insert(e) => &e.namespace,
            DataChangeEvent::Update(e) => &e.namespace,
            DataChangeEvent::Delete(e) => &e.namespace,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            DataChangeEvent::Insert(e) => &e.table,
            DataChangeEvent::Update(e) => &e.table,
            DataChangeEvent::Delete(e) => &e.table,
        }
    }

    /// Source transaction id (xid) the change was committed in.
    pub fn transaction_id(&self) -> u32 {
        match self {
            DataChangeEvent::Insert(e) => e.transaction_id,
            DataChangeEvent::Update(e) => e.transaction_id,
            DataChangeEvent::Delete(e) => e.transaction_id,
        }
    }

    /// `schema.table`, the key used for per-table configuration.
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.namespace(), self.table())
    }
}

/// The envelope handed across the transport boundary: all row changes of
/// one source transaction, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub source_name: String,
    pub events: Vec<DataChangeEvent>,
    pub committed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        source_name: impl Into<String>,
        events: Vec<DataChangeEvent>,
        committed_at: DateTime<Utc>,
    ) -> Self {
        // Clock skew between the database and this host must not produce
        // an envelope created before its commit.
        let created_at = Utc::now().max(committed_at);

        Self {
            id: Uuid::new_v4(),
            source_name: source_name.into(),
            events,
            committed_at,
            created_at,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_vec {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| STANDARD.encode(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// JSON has no NaN or infinities, so those travel as the strings Postgres
/// itself prints for them.
mod float_text {
    use serde::de::{DeserializeOwned, Error};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub trait Float: Copy + Serialize + DeserializeOwned {
        const NAN: Self;
        const INFINITY: Self;
        const NEG_INFINITY: Self;

        fn is_finite(self) -> bool;
        fn is_nan(self) -> bool;
        fn is_sign_positive(self) -> bool;
    }

    macro_rules! impl_float {
        ($t:ty) => {
            impl Float for $t {
                const NAN: Self = <$t>::NAN;
                const INFINITY: Self = <$t>::INFINITY;
                const NEG_INFINITY: Self = <$t>::NEG_INFINITY;

                fn is_finite(self) -> bool {
                    <$t>::is_finite(self)
                }

                fn is_nan(self) -> bool {
                    <$t>::is_nan(self)
                }

                fn is_sign_positive(self) -> bool {
                    <$t>::is_sign_positive(self)
                }
            }
        };
    }

    impl_float!(f32);
    impl_float!(f64);

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        Number(T),
        Special(String),
    }

    fn to_repr<T: Float>(value: T) -> Repr<T> {
        if value.is_finite() {
            Repr::Number(value)
        } else if value.is_nan() {
            Repr::Special("NaN".to_string())
        } else if value.is_sign_positive() {
            Repr::Special("Infinity".to_string())
        } else {
            Repr::Special("-Infinity".to_string())
        }
    }

    fn from_repr<T: Float, E: Error>(repr: Repr<T>) -> Result<T, E> {
        match repr {
            Repr::Number(value) => Ok(value),
            Repr::Special(text) => match text.as_str() {
                "NaN" => Ok(T::NAN),
                "Infinity" => Ok(T::INFINITY),
                "-Infinity" => Ok(T::NEG_INFINITY),
                other => Err(E::custom(format!("invalid floating point value '{}'", other))),
            },
        }
    }

    pub fn serialize<T: Float, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        to_repr(*value).serialize(serializer)
    }

    pub fn deserialize<'de, T: Float, D: Deserializer<'de>>(deserializer: D) -> Result<T, D::Error> {
        from_repr(Repr::<T>::deserialize(deserializer)?)
    }

    pub mod vec {
        use super::{from_repr, to_repr, Float, Repr};
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ptr_arg)]
        pub fn serialize<T: Float, S: Serializer>(
            values: &Vec<T>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(values.iter().map(|v| to_repr(*v)))
        }

        pub fn deserialize<'de, T: Float, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<T>, D::Error> {
            Vec::<Repr<T>>::deserialize(deserializer)?
                .into_iter()
                .map(from_repr)
                .collect()
        }
    }
}
