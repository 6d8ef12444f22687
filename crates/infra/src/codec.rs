//! Decoding of stored records into generic values and jobs.
//!
//! The policy is a plain value handed to each store at construction. It decides
//! how nested BSON (arrays, embedded documents, driver scalar types) is turned
//! into `serde_json::Value` before typed deserialization, so decoded data never
//! leaks driver-specific wrappers to callers.

use bson::{doc, Bson, Document};
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use workflows_core::{DomainError, Job, JobId};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record has no _id")]
    MissingId,

    #[error("unsupported _id type: {0}")]
    UnsupportedId(String),

    #[error("invalid record identity: {0}")]
    InvalidId(#[from] DomainError),

    #[error("malformed job record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// How stored records are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Arrays become ordered sequences, embedded documents keyed maps, and
    /// ObjectIds and dates their canonical text.
    #[default]
    Generic,
    /// MongoDB relaxed extended JSON (`{"$oid": ...}`, `{"$date": ...}`).
    Relaxed,
}

impl DecodePolicy {
    pub fn to_generic(&self, value: &Bson) -> JsonValue {
        match self {
            Self::Relaxed => value.clone().into_relaxed_extjson(),
            Self::Generic => generic(value),
        }
    }

    pub fn document_to_generic(&self, doc: &Document) -> Map<String, JsonValue> {
        doc.iter()
            .map(|(key, value)| (key.clone(), self.to_generic(value)))
            .collect()
    }

    /// Decode a stored job record. `_id` becomes the job identity.
    pub fn decode_job(&self, doc: &Document) -> Result<Job, DecodeError> {
        let id = match doc.get("_id") {
            Some(Bson::ObjectId(oid)) => oid.to_hex(),
            Some(Bson::String(s)) => s.clone(),
            Some(other) => return Err(DecodeError::UnsupportedId(format!("{:?}", other.element_type()))),
            None => return Err(DecodeError::MissingId),
        };

        let mut body = self.document_to_generic(doc);
        body.remove("_id");
        body.remove("id");

        let mut job: Job = serde_json::from_value(JsonValue::Object(body))?;
        job.assign_id(JobId::new(id)?);
        Ok(job)
    }
}

/// Stored form of a job: only the structural fields, parameters re-materialized.
pub fn encode_job(job: &Job) -> Document {
    let params: Vec<Bson> = job
        .normalized_parameters()
        .into_iter()
        .map(|p| Bson::Document(doc! { "name": p.name, "value": p.value }))
        .collect();

    doc! {
        "workflow_name": job.workflow_name.as_str(),
        "input_parameters": params,
    }
}

fn generic(value: &Bson) -> JsonValue {
    match value {
        Bson::Null | Bson::Undefined => JsonValue::Null,
        Bson::Boolean(b) => JsonValue::Bool(*b),
        Bson::String(s) | Bson::Symbol(s) => JsonValue::String(s.clone()),
        Bson::Int32(i) => JsonValue::from(*i),
        Bson::Int64(i) => JsonValue::from(*i),
        Bson::Double(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Bson::Array(items) => JsonValue::Array(items.iter().map(generic).collect()),
        Bson::Document(doc) => JsonValue::Object(
            doc.iter()
                .map(|(key, value)| (key.clone(), generic(value)))
                .collect(),
        ),
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::DateTime(dt) => JsonValue::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        other => other.clone().into_relaxed_extjson(),
    }
}
