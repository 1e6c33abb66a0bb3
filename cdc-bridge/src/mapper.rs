//! Transformation of change events into the records handed to the pipeline.
use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::cdc_types::{ChangeEvent, ColumnValue, RowImage, SourceMetadata};
use crate::error::MappingError;

/// Pure transformation of a [`ChangeEvent`] into a caller-chosen output type.
///
/// Implementations must not perform I/O or keep references to the event.
pub trait RecordMapper: Send + Sync {
    type Output: Send;

    fn map(&self, event: &ChangeEvent) -> Result<Self::Output, MappingError>;
}

/// Maps events to the JSON document
/// `{"metadata": {...}, "before": {"fields": {...}} | null, "after": {"fields": {...}} | null}`
/// rendered as a string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordMapper;

impl RecordMapper for JsonRecordMapper {
    type Output = String;

    fn map(&self, event: &ChangeEvent) -> Result<String, MappingError> {
        // Serialized straight from the struct so the key order is kept.
        serde_json::to_string(&document(event)?)
            .map_err(|e| MappingError::new(event.offset_record(), e.to_string()))
    }
}

/// Same document as [`JsonRecordMapper`], kept as a [`serde_json::Value`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValueMapper;

impl RecordMapper for JsonValueMapper {
    type Output = Value;

    fn map(&self, event: &ChangeEvent) -> Result<Value, MappingError> {
        to_json(event)
    }
}

/// Wraps a closure as a [`RecordMapper`].
pub fn map_fn<F, T>(f: F) -> FnMapper<F>
where
    F: Fn(&ChangeEvent) -> Result<T, MappingError> + Send + Sync,
    T: Send,
{
    FnMapper(f)
}

pub struct FnMapper<F>(F);

impl<F, T> RecordMapper for FnMapper<F>
where
    F: Fn(&ChangeEvent) -> Result<T, MappingError> + Send + Sync,
    T: Send,
{
    type Output = T;

    fn map(&self, event: &ChangeEvent) -> Result<T, MappingError> {
        (self.0)(event)
    }
}

#[derive(Serialize)]
struct Document<'a> {
    metadata: &'a SourceMetadata,
    before: Option<Value>,
    after: Option<Value>,
}

/// Builds the reference JSON document of an event.
pub fn to_json(event: &ChangeEvent) -> Result<Value, MappingError> {
    serde_json::to_value(document(event)?)
        .map_err(|e| MappingError::new(event.offset_record(), e.to_string()))
}

fn document(event: &ChangeEvent) -> Result<Document<'_>, MappingError> {
    let image = |image: Option<&RowImage>| -> Result<Option<Value>, MappingError> {
        image
            .map(|image| image_to_json(image).map(|fields| json!({ "fields": fields })))
            .transpose()
            .map_err(|reason| MappingError::new(event.offset_record(), reason))
    };

    Ok(Document {
        metadata: event.metadata(),
        before: image(event.before())?,
        after: image(event.after())?,
    })
}

fn image_to_json(image: &RowImage) -> Result<Value, String> {
    let mut fields = Map::new();
    for (name, value) in image.fields() {
        fields.insert(name.to_string(), column_to_json(name, value)?);
    }
    Ok(Value::Object(fields))
}

fn column_to_json(name: &str, value: &ColumnValue) -> Result<Value, String> {
    Ok(match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Bool(b) => Value::Bool(*b),
        ColumnValue::Int(i) => Value::from(*i),
        ColumnValue::UInt(u) => Value::from(*u),
        ColumnValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| format!("column {name} holds a non-finite number {f}"))?,
        ColumnValue::Decimal(d) | ColumnValue::Text(d) => Value::String(d.clone()),
        ColumnValue::Bytes(bytes) => Value::String(hex::encode(bytes)),
        ColumnValue::Json(json) => json.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc_types::{SourceOffset, SourcePartition};

    fn metadata() -> SourceMetadata {
        SourceMetadata {
            connector: "mysql".to_string(),
            version: "1.7.0.Final".to_string(),
            name: "dbserver1".to_string(),
            database: "inventory".to_string(),
            schema: "mysql-bin.000003".to_string(),
            table: "addresses".to_string(),
        }
    }

    fn address() -> RowImage {
        RowImage::new()
            .with("zip", "76036")
            .with("city", "Euless")
            .with("street", "3183 Moore Avenue")
            .with("id", 10)
            .with("state", "Texas")
            .with("customer_id", 1001)
            .with("type", "SHIPPING")
    }

    fn offset() -> SourceOffset {
        SourceOffset::new().with("file", "mysql-bin.000003").with("pos", 154u64)
    }

    #[test]
    fn maps_insert_to_reference_document() {
        let event = ChangeEvent::read(
            SourcePartition::new("server=dbserver1"),
            offset(),
            metadata(),
            address(),
        );

        let mapped = JsonRecordMapper.map(&event).unwrap();
        let parsed: Value = serde_json::from_str(&mapped).unwrap();

        assert_eq!(
            parsed,
            json!({
                "metadata": {
                    "connector": "mysql",
                    "version": "1.7.0.Final",
                    "name": "dbserver1",
                    "database": "inventory",
                    "schema": "mysql-bin.000003",
                    "table": "addresses"
                },
                "before": null,
                "after": {"fields": {
                    "zip": "76036",
                    "city": "Euless",
                    "street": "3183 Moore Avenue",
                    "id": 10,
                    "state": "Texas",
                    "customer_id": 1001,
                    "type": "SHIPPING"
                }}
            })
        );
    }

    #[test]
    fn update_images_survive_reparsing() {
        let before = address();
        let after = address().with("city", "Dallas").with("zip", ColumnValue::Null);
        let event = ChangeEvent::update(
            SourcePartition::new("server=dbserver1"),
            offset(),
            metadata(),
            before.clone(),
            after.clone(),
        );

        let parsed: Value = serde_json::from_str(&JsonRecordMapper.map(&event).unwrap()).unwrap();

        for (image, key) in [(&before, "before"), (&after, "after")] {
            let fields = parsed[key]["fields"].as_object().unwrap();
            assert_eq!(fields.len(), image.len());
            for (name, value) in image.fields() {
                assert_eq!(fields[name], column_to_json(name, value).unwrap());
            }
        }
    }

    #[test]
    fn metadata_fields_keep_their_order() {
        let event = ChangeEvent::delete(
            SourcePartition::new("server=dbserver1"),
            offset(),
            metadata(),
            address(),
        );
        let mapped = JsonRecordMapper.map(&event).unwrap();
        assert!(mapped.starts_with(
            r#"{"metadata":{"connector":"mysql","version":"1.7.0.Final","name":"dbserver1","database":"inventory","schema":"mysql-bin.000003","table":"addresses"},"before":{"fields":"#
        ));
        assert!(mapped.ends_with(r#""after":null}"#));
    }

    #[test]
    fn non_finite_numbers_fail_mapping() {
        let event = ChangeEvent::insert(
            SourcePartition::new("server=dbserver1"),
            offset(),
            metadata(),
            RowImage::new().with("ratio", f64::NAN),
        );

        let err = JsonValueMapper.map(&event).unwrap_err();
        assert!(err.reason.contains("ratio"));
        assert!(err.offset.contains("pos=154"));
    }

    #[test]
    fn bytes_are_hex_encoded() {
        let event = ChangeEvent::insert(
            SourcePartition::new("p"),
            offset(),
            metadata(),
            RowImage::new().with("blob", ColumnValue::Bytes(vec![0xde, 0xad])),
        );
        let value = JsonValueMapper.map(&event).unwrap();
        assert_eq!(value["after"]["fields"]["blob"], json!("dead"));
    }

    #[test]
    fn closures_as_mappers() {
        let mapper = map_fn(|event: &ChangeEvent| Ok(event.metadata().table.clone()));
        let event = ChangeEvent::insert(SourcePartition::new("p"), offset(), metadata(), address());
        assert_eq!(mapper.map(&event).unwrap(), "addresses");
    }
}
