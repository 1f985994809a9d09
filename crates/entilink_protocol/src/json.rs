//! OData JSON encodings of the wire model.
//!
//! These back the HTTP adapter only; the change-tracking core works on the
//! typed structures directly.

use crate::entity::{MediaInfo, WireEntity, WireLink};
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{BatchRequest, BatchResponse, OperationResponse};
use crate::operation::{Cardinality, Payload, WireRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value as Json};

const CHANGESET: &str = "changeset";

impl WireEntity {
    /// Reads an entity from its JSON representation.
    ///
    /// Every non-annotation member lands in `properties`; expanded
    /// navigation properties are separated later with
    /// [`WireEntity::promote_inline_links`].
    pub fn from_json(json: &Json) -> ProtocolResult<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_structure("entity must be a JSON object"))?;

        let text = |key: &str| object.get(key).and_then(Json::as_str).map(str::to_string);

        let mut entity = WireEntity {
            type_name: text("@odata.type").map(|t| t.trim_start_matches('#').to_string()),
            id: text("@odata.editLink").or_else(|| text("@odata.id")),
            etag: text("@odata.etag"),
            ..WireEntity::default()
        };

        let read_link = text("@odata.mediaReadLink");
        let content_type = text("@odata.mediaContentType");
        if read_link.is_some() || content_type.is_some() {
            entity.media = Some(MediaInfo {
                read_link,
                content_type,
                etag: text("@odata.mediaEtag"),
            });
        }

        for (key, value) in object {
            if key.starts_with('@') {
                continue;
            }
            if let Some((name, annotation)) = key.split_once("@odata.") {
                match (annotation, value.as_str()) {
                    ("navigationLink", Some(uri)) => {
                        entity
                            .links
                            .entry(name.to_string())
                            .or_insert_with(|| WireLink::Deferred(uri.to_string()));
                    }
                    ("mediaReadLink", Some(uri)) => {
                        entity.stream_links.insert(name.to_string(), uri.to_string());
                    }
                    _ => {}
                }
                continue;
            }
            entity.properties.insert(key.clone(), value.clone());
        }

        Ok(entity)
    }
}

/// Reads a collection payload (`{"value": [...]}`).
pub fn entities_from_json(json: &Json) -> ProtocolResult<Vec<WireEntity>> {
    json.get("value")
        .and_then(Json::as_array)
        .ok_or_else(|| ProtocolError::invalid_structure("collection payload must carry a value array"))?
        .iter()
        .map(WireEntity::from_json)
        .collect()
}

impl WireRecord {
    /// Writes the record as a create/update body.
    pub fn to_json(&self) -> Json {
        let mut body = Map::new();
        body.insert("@odata.type".into(), Json::String(format!("#{}", self.type_name)));
        for (name, value) in &self.properties {
            body.insert(name.clone(), value.clone());
        }
        for (name, binding) in &self.bindings {
            let key = format!("{name}@odata.bind");
            let rendered = match binding.cardinality {
                Cardinality::Single => binding
                    .targets
                    .first()
                    .map_or(Json::Null, |t| Json::String(t.render())),
                Cardinality::Collection => Json::Array(
                    binding
                        .targets
                        .iter()
                        .map(|t| Json::String(t.render()))
                        .collect(),
                ),
            };
            body.insert(key, rendered);
        }
        Json::Object(body)
    }
}

impl BatchRequest {
    /// Writes the batch as a JSON `$batch` body with one atomicity group.
    pub fn to_json(&self) -> Json {
        let requests: Vec<Json> = self
            .operations
            .iter()
            .map(|op| {
                let mut request = Map::new();
                request.insert("id".into(), Json::String(op.position.to_string()));
                request.insert("atomicityGroup".into(), Json::String(CHANGESET.into()));
                request.insert("method".into(), Json::String(op.kind.method().into()));
                request.insert("url".into(), Json::String(op.url()));

                let depends: Vec<Json> = op
                    .referenced_positions()
                    .into_iter()
                    .map(|p| Json::String(p.to_string()))
                    .collect();
                if !depends.is_empty() {
                    request.insert("dependsOn".into(), Json::Array(depends));
                }

                let mut headers = Map::new();
                if let Some(etag) = &op.if_match {
                    headers.insert("if-match".into(), Json::String(etag.clone()));
                }
                match &op.payload {
                    Payload::Empty => {}
                    Payload::Record(record) => {
                        headers.insert("content-type".into(), json!("application/json"));
                        request.insert("body".into(), record.to_json());
                    }
                    Payload::Binary(content) => {
                        let content_type = content
                            .content_type
                            .clone()
                            .unwrap_or_else(|| "application/octet-stream".into());
                        headers.insert("content-type".into(), Json::String(content_type));
                        request.insert("body".into(), Json::String(STANDARD.encode(&content.bytes)));
                    }
                }
                request.insert("headers".into(), Json::Object(headers));
                Json::Object(request)
            })
            .collect();
        json!({ "requests": requests })
    }
}

impl OperationResponse {
    /// Builds a response from the parts of a single HTTP exchange.
    pub fn from_parts(
        position: u32,
        status: u16,
        location: Option<String>,
        etag: Option<String>,
        body: Option<&Json>,
    ) -> ProtocolResult<Self> {
        let success = (200..300).contains(&status);
        let entity = match body {
            Some(body @ Json::Object(_)) if success => Some(WireEntity::from_json(body)?),
            _ => None,
        };
        let error = if success {
            None
        } else {
            Some(
                body.and_then(|b| b.pointer("/error/message"))
                    .and_then(Json::as_str)
                    .map_or_else(|| format!("status {status}"), str::to_string),
            )
        };
        Ok(Self {
            position,
            status,
            etag: etag.or_else(|| entity.as_ref().and_then(|e| e.etag.clone())),
            location,
            entity,
            error,
        })
    }
}

impl BatchResponse {
    /// Reads a JSON `$batch` response body.
    pub fn from_json(status: u16, json: &Json) -> ProtocolResult<Self> {
        let responses = json
            .get("responses")
            .and_then(Json::as_array)
            .ok_or_else(|| ProtocolError::invalid_structure("batch response must carry responses"))?;

        let mut items = Vec::with_capacity(responses.len());
        for response in responses {
            let position = response
                .get("id")
                .and_then(Json::as_str)
                .and_then(|id| id.parse::<u32>().ok())
                .ok_or_else(|| ProtocolError::invalid_structure("batch item without numeric id"))?;
            let item_status = response
                .get("status")
                .and_then(Json::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .ok_or_else(|| ProtocolError::invalid_structure("batch item without status"))?;
            let header = |name: &str| {
                response
                    .get("headers")
                    .and_then(|h| h.get(name))
                    .and_then(Json::as_str)
                    .map(str::to_string)
            };
            items.push(OperationResponse::from_parts(
                position,
                item_status,
                header("location").or_else(|| header("odata-entityid")),
                header("etag"),
                response.get("body"),
            )?);
        }

        let error = items
            .iter()
            .find(|item| !item.is_success())
            .and_then(|item| item.error.clone());
        Ok(Self {
            status,
            items,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{LinkTarget, Operation, StreamPayload, Target};

    #[test]
    fn entity_from_json_reads_annotations() {
        let entity = WireEntity::from_json(&json!({
            "@odata.type": "#Docs.File",
            "@odata.id": "Files(7)",
            "@odata.etag": "W/\"3\"",
            "@odata.mediaReadLink": "Files(7)/$value",
            "@odata.mediaContentType": "text/plain",
            "Id": 7,
            "Name": "notes.txt",
            "Parent@odata.navigationLink": "Files(7)/Parent",
            "Thumbnail@odata.mediaReadLink": "Files(7)/Thumbnail"
        }))
        .unwrap();

        assert_eq!(entity.type_name.as_deref(), Some("Docs.File"));
        assert_eq!(entity.id.as_deref(), Some("Files(7)"));
        assert_eq!(entity.etag.as_deref(), Some("W/\"3\""));
        assert_eq!(entity.properties.len(), 2);
        assert_eq!(
            entity.link("Parent"),
            Some(&WireLink::Deferred("Files(7)/Parent".into()))
        );
        assert_eq!(entity.stream_links["Thumbnail"], "Files(7)/Thumbnail");
        assert_eq!(
            entity.media.and_then(|m| m.content_type).as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn record_to_json_renders_bindings() {
        let mut record = WireRecord::new("Docs.File");
        record.properties.insert("Name".into(), json!("notes.txt"));
        record.bind("Parent", Cardinality::Single, Some(LinkTarget::Position(1)));
        record.bind("Owner", Cardinality::Single, None);
        record.bind(
            "Tags",
            Cardinality::Collection,
            Some(LinkTarget::Address("Tags(2)".into())),
        );

        assert_eq!(
            record.to_json(),
            json!({
                "@odata.type": "#Docs.File",
                "Name": "notes.txt",
                "Parent@odata.bind": "$1",
                "Owner@odata.bind": null,
                "Tags@odata.bind": ["Tags(2)"]
            })
        );
    }

    #[test]
    fn batch_request_json_shape() {
        let folder = Operation::create(1, "Folders", WireRecord::new("Docs.Folder"));
        let mut file_record = WireRecord::new("Docs.File");
        file_record.bind("Parent", Cardinality::Single, Some(LinkTarget::Position(1)));
        let file = Operation::create(2, "Files", file_record);
        let media = Operation::update_media(
            3,
            Target::Position(2),
            StreamPayload::new("text/plain", b"hi".to_vec()),
        )
        .with_if_match(Some("*".into()));

        let body = BatchRequest::new(vec![folder, file, media]).to_json();
        let requests = body["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1]["dependsOn"], json!(["1"]));
        assert_eq!(requests[2]["url"], json!("$2/$value"));
        assert_eq!(requests[2]["body"], json!("aGk="));
        assert_eq!(requests[2]["headers"]["if-match"], json!("*"));
        assert!(requests
            .iter()
            .all(|r| r["atomicityGroup"] == json!("changeset")));
    }

    #[test]
    fn batch_response_from_json() {
        let response = BatchResponse::from_json(
            200,
            &json!({
                "responses": [
                    {"id": "1", "status": 201, "headers": {"location": "Folders(1)"},
                     "body": {"@odata.id": "Folders(1)", "Id": 1}},
                    {"id": "2", "status": 400,
                     "body": {"error": {"code": "", "message": "Name required"}}}
                ]
            }),
        )
        .unwrap();

        assert_eq!(response.items[0].address(), Some("Folders(1)"));
        assert_eq!(response.error.as_deref(), Some("Name required"));
        assert!(!response.is_accepted());
    }

    #[test]
    fn collection_payload() {
        let entities =
            entities_from_json(&json!({"value": [{"Id": 1}, {"Id": 2}]})).unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities_from_json(&json!([])).is_err());
    }
}
