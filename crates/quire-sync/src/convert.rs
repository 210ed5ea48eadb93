//! Feed record to store op translation

use crate::feed::FeedRecord;
use quire_common::{Error, KeyRange, Result, Topic};
use quire_store::DocOp;
use quire_store::namespace::validate_key;
use serde_json::{Map, Value};

/// Translate one feed record into a topic write.
///
/// Returns `Ok(None)` for records that do not belong to the topic entity
/// (outside `range`, or reserved `_`-prefixed ids). Records that belong to it
/// but cannot be stored fail with [`Error::Conversion`] carrying the id and
/// raw payload.
pub fn translate(record: &FeedRecord, range: &KeyRange) -> Result<Option<DocOp<Topic>>> {
    let id = record.id.as_str();
    if id.starts_with('_') || !range.contains(id) {
        return Ok(None);
    }
    let payload = || {
        record
            .doc
            .as_ref()
            .map_or_else(|| "null".to_string(), Value::to_string)
    };
    if let Err(e) = validate_key(id) {
        return Err(Error::conversion(id, payload(), e.to_string()));
    }

    let tombstone = record.deleted
        || record
            .doc
            .as_ref()
            .and_then(|doc| doc.get("_deleted"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
    if tombstone {
        return Ok(Some(DocOp::del(id)));
    }

    let Some(doc) = &record.doc else {
        return Err(Error::conversion(id, payload(), "missing document body"));
    };
    let Value::Object(fields) = doc else {
        return Err(Error::conversion(id, payload(), "document is not an object"));
    };
    let body: Map<String, Value> = fields
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let topic: Topic = serde_json::from_value(Value::Object(body))
        .map_err(|e| Error::conversion(id, payload(), e.to_string()))?;
    Ok(Some(DocOp::put(id, topic)))
}
