//! HubSpot CRM target.
//!
//! Objects go through the v3 object API (search, create, PATCH, batch
//! create); associations through the v4 association API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::auth::{with_token_refresh, TokenProvider};
use crate::core::{AssociationEdge, BatchItemError, BatchResponse, TargetConnector, TargetRecord};
use crate::error::{Result, SyncError};

const ASSOCIATION_CATEGORY: &str = "HUBSPOT_DEFINED";

#[derive(Debug, Serialize)]
struct SearchRequest {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<FilterGroup>,
    properties: Vec<String>,
    limit: u32,
}

#[derive(Debug, Serialize)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize)]
struct Filter {
    #[serde(rename = "propertyName")]
    property_name: String,
    operator: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<HubspotObject>,
}

#[derive(Debug, Deserialize, Clone)]
struct HubspotObject {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

impl HubspotObject {
    fn into_record(self, object_type: &str) -> TargetRecord {
        TargetRecord {
            id: self.id,
            object_type: object_type.to_string(),
            properties: self.properties,
        }
    }
}

#[derive(Debug, Serialize)]
struct PropertiesBody<'a> {
    properties: &'a Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct BatchInputs<T> {
    inputs: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BatchResult<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    errors: Vec<BatchError>,
}

#[derive(Debug, Deserialize)]
struct BatchError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: HashMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
struct AssociationType {
    #[serde(rename = "associationCategory")]
    association_category: &'static str,
    #[serde(rename = "associationTypeId")]
    association_type_id: u32,
}

#[derive(Debug, Serialize)]
struct ObjectId {
    id: String,
}

#[derive(Debug, Serialize)]
struct AssociationInput {
    from: ObjectId,
    to: ObjectId,
    types: Vec<AssociationType>,
}

#[derive(Debug, Deserialize)]
struct AssociationResult {
    #[serde(rename = "fromObjectId")]
    from_object_id: Value,
    #[serde(rename = "toObjectId")]
    to_object_id: Value,
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Target connector for the HubSpot CRM API.
pub struct HubSpotTarget {
    client: Client,
    api_base: String,
    tokens: Arc<TokenProvider>,
}

impl HubSpotTarget {
    pub fn new(client: Client, api_base: impl Into<String>, tokens: Arc<TokenProvider>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Send a JSON request with the current token, refreshing it once on 401.
    ///
    /// Returns `None` for empty response bodies.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let url = format!("{}{}", self.api_base, path);
        with_token_refresh(&self.tokens, |token| {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(token.value());
            if let Some(body) = body {
                req = req.json(body);
            }
            async move {
                let resp = req.send().await.map_err(SyncError::from_reqwest)?;
                let status = resp.status();
                let text = resp.text().await.map_err(SyncError::from_reqwest)?;
                if !status.is_success() {
                    return Err(SyncError::from_status(status.as_u16(), text));
                }
                if text.trim().is_empty() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_str::<Value>(&text)?))
            }
        })
        .await
    }

    async fn send_expecting<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T> {
        let value = self
            .send(method, path, Some(body))
            .await?
            .ok_or_else(|| SyncError::Validation(format!("empty response from {}", path)))?;
        Ok(serde_json::from_value(value)?)
    }
}

fn search_body(property: &str, value: &str) -> SearchRequest {
    SearchRequest {
        filter_groups: vec![FilterGroup {
            filters: vec![Filter {
                property_name: property.to_string(),
                operator: "EQ".to_string(),
                value: value.to_string(),
            }],
        }],
        properties: vec![property.to_string()],
        limit: 1,
    }
}

fn association_types(edge: &AssociationEdge) -> Vec<AssociationType> {
    vec![AssociationType {
        association_category: ASSOCIATION_CATEGORY,
        association_type_id: edge.association_type_id,
    }]
}

fn association_inputs(edges: &[AssociationEdge]) -> BatchInputs<AssociationInput> {
    BatchInputs {
        inputs: edges
            .iter()
            .map(|edge| AssociationInput {
                from: ObjectId {
                    id: edge.from_id.clone(),
                },
                to: ObjectId {
                    id: edge.to_id.clone(),
                },
                types: association_types(edge),
            })
            .collect(),
    }
}

/// Attribute batch association results and errors back to the input edges.
fn association_response(
    edges: &[AssociationEdge],
    body: BatchResult<AssociationResult>,
) -> BatchResponse<AssociationEdge> {
    let mut response = BatchResponse::default();
    for result in body.results {
        let from = id_string(&result.from_object_id);
        let to = id_string(&result.to_object_id);
        if let Some(edge) = edges.iter().find(|e| e.from_id == from && e.to_id == to) {
            if !response.results.contains(edge) {
                response.results.push(edge.clone());
            }
        }
    }
    for error in body.errors {
        let key = error
            .context
            .get("fromObjectId")
            .and_then(|ids| ids.first())
            .cloned();
        let index = key
            .as_deref()
            .and_then(|k| edges.iter().position(|e| e.from_id == k));
        response.errors.push(BatchItemError {
            index,
            key,
            message: error.message,
        });
    }
    response
}

#[async_trait]
impl TargetConnector for HubSpotTarget {
    #[instrument(level = "debug", skip(self))]
    async fn find(
        &self,
        object_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<TargetRecord>> {
        let body = serde_json::to_value(search_body(property, value))?;
        let path = format!("/crm/v3/objects/{}/search", object_type);
        let found: SearchResponse = self.send_expecting(Method::POST, &path, &body).await?;
        Ok(found
            .results
            .into_iter()
            .next()
            .map(|o| o.into_record(object_type)))
    }

    #[instrument(level = "debug", skip(self, properties))]
    async fn create(
        &self,
        object_type: &str,
        properties: &Map<String, Value>,
    ) -> Result<TargetRecord> {
        let body = serde_json::to_value(PropertiesBody { properties })?;
        let path = format!("/crm/v3/objects/{}", object_type);
        let created: HubspotObject = self.send_expecting(Method::POST, &path, &body).await?;
        Ok(created.into_record(object_type))
    }

    #[instrument(level = "debug", skip(self, properties))]
    async fn update(
        &self,
        object_type: &str,
        id: &str,
        properties: &Map<String, Value>,
    ) -> Result<TargetRecord> {
        let body = serde_json::to_value(PropertiesBody { properties })?;
        let path = format!("/crm/v3/objects/{}/{}", object_type, id);
        let updated: HubspotObject = self.send_expecting(Method::PATCH, &path, &body).await?;
        Ok(updated.into_record(object_type))
    }

    #[instrument(level = "debug", skip(self, records), fields(count = records.len()))]
    async fn batch_create(
        &self,
        object_type: &str,
        records: &[Map<String, Value>],
    ) -> Result<BatchResponse<TargetRecord>> {
        let body = serde_json::to_value(BatchInputs {
            inputs: records
                .iter()
                .map(|properties| PropertiesBody { properties })
                .collect(),
        })?;
        let path = format!("/crm/v3/objects/{}/batch/create", object_type);
        let result: BatchResult<HubspotObject> =
            self.send_expecting(Method::POST, &path, &body).await?;
        debug!(
            "batch create {}: {} created, {} errors",
            object_type,
            result.results.len(),
            result.errors.len()
        );
        Ok(BatchResponse {
            results: result
                .results
                .into_iter()
                .map(|o| o.into_record(object_type))
                .collect(),
            errors: result
                .errors
                .into_iter()
                .map(|e| BatchItemError {
                    index: None,
                    key: None,
                    message: e.message,
                })
                .collect(),
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn create_association(&self, edge: &AssociationEdge) -> Result<()> {
        let body = serde_json::to_value(association_types(edge))?;
        let path = format!(
            "/crm/v4/objects/{}/{}/associations/{}/{}",
            edge.from_type, edge.from_id, edge.to_type, edge.to_id
        );
        self.send(Method::PUT, &path, Some(&body)).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, edges), fields(count = edges.len()))]
    async fn batch_create_associations(
        &self,
        edges: &[AssociationEdge],
    ) -> Result<BatchResponse<AssociationEdge>> {
        let Some(first) = edges.first() else {
            return Ok(BatchResponse::default());
        };
        if edges
            .iter()
            .any(|e| e.from_type != first.from_type || e.to_type != first.to_type)
        {
            return Err(SyncError::Validation(
                "association batch mixes object-type pairs".into(),
            ));
        }
        let body = serde_json::to_value(association_inputs(edges))?;
        let path = format!(
            "/crm/v4/associations/{}/{}/batch/create",
            first.from_type, first.to_type
        );
        let result: BatchResult<AssociationResult> =
            self.send_expecting(Method::POST, &path, &body).await?;
        Ok(association_response(edges, result))
    }

    fn name(&self) -> &str {
        "hubspot"
    }
}
