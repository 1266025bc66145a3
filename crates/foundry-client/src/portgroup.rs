// Port-group resource manager.
//
// Thin CRUD glue over `Client::json_request`: build a path, serialize
// filters, unwrap the result. Port groups bond several physical ports of a
// managed node into one logical interface; their semantics live entirely on
// the server.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::{Client, location_path};
use crate::error::Error;

/// Attributes the API accepts on creation.
const CREATION_ATTRIBUTES: &[&str] = &["node_uuid", "name", "address", "extra"];

/// A port group, as returned by the server.
///
/// Fields use `#[serde(default)]` liberally because the visible field set
/// depends on the request's `fields` selection and detail mode; anything
/// not modeled explicitly lands in `other`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portgroup {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub node_uuid: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

/// Filters for [`PortgroupManager::list`].
#[derive(Debug, Clone, Default)]
pub struct PortgroupListParams {
    /// UUID or name of a node, to get the port groups for that node.
    pub node: Option<String>,
    /// MAC address of a member port.
    pub address: Option<String>,
    /// Maximum number of port groups to return; `None` leaves the page
    /// size to the server, `Some` follows `next` links up to the limit.
    pub limit: Option<u32>,
    /// UUID of the last port group from a previous result set.
    pub marker: Option<String>,
    pub sort_key: Option<String>,
    /// `"asc"` (the server default) or `"desc"`.
    pub sort_dir: Option<String>,
    /// Return full objects instead of the summary view. Cannot be combined
    /// with `fields`.
    pub detail: bool,
    /// Subset of fields to return.
    pub fields: Option<Vec<String>>,
}

/// Manager for `/v1/portgroups`.
pub struct PortgroupManager<'a> {
    client: &'a Client,
}

impl<'a> PortgroupManager<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    fn path(ident: Option<&str>) -> String {
        match ident {
            Some(ident) => format!("/v1/portgroups/{ident}"),
            None => "/v1/portgroups".to_owned(),
        }
    }

    /// Retrieve a list of port groups, optionally filtered.
    pub async fn list(&self, params: &PortgroupListParams) -> Result<Vec<Portgroup>, Error> {
        if params.detail && params.fields.is_some() {
            return Err(Error::InvalidAttribute(
                "cannot fetch a subset of fields with detail set".to_owned(),
            ));
        }

        let mut filters = Vec::new();
        if let Some(marker) = &params.marker {
            filters.push(format!("marker={marker}"));
        }
        if let Some(limit) = params.limit {
            filters.push(format!("limit={limit}"));
        }
        if let Some(sort_key) = &params.sort_key {
            filters.push(format!("sort_key={sort_key}"));
        }
        if let Some(sort_dir) = &params.sort_dir {
            filters.push(format!("sort_dir={sort_dir}"));
        }
        if let Some(fields) = &params.fields {
            filters.push(format!("fields={}", fields.join(",")));
        }
        if let Some(node) = &params.node {
            filters.push(format!("node={node}"));
        }
        if let Some(address) = &params.address {
            filters.push(format!("address={address}"));
        }

        let mut path = Self::path(None);
        if params.detail {
            path.push_str("/detail");
        }
        if !filters.is_empty() {
            path.push('?');
            path.push_str(&filters.join("&"));
        }

        // Without a limit the server's own page cap applies and a single
        // page is returned; with one, `next` links are followed until the
        // limit is reached or the listing ends.
        let mut portgroups: Vec<Portgroup> = Vec::new();
        let mut next = Some(path);
        while let Some(path) = next.take() {
            let (_, body) = self
                .client
                .json_request(Method::GET, &path, None, None)
                .await?;
            let page: Vec<Portgroup> = parse(body.get("portgroups").cloned().unwrap_or_default(), &body)?;
            debug!("listed {} port groups", page.len());
            portgroups.extend(page);

            let Some(limit) = params.limit else { break };
            let limit = limit as usize;
            if portgroups.len() >= limit {
                portgroups.truncate(limit);
                break;
            }
            next = body
                .get("next")
                .and_then(Value::as_str)
                .map(location_path);
        }
        Ok(portgroups)
    }

    /// Fetch one port group by UUID or name.
    pub async fn get(&self, ident: &str, fields: Option<&[&str]>) -> Result<Portgroup, Error> {
        let mut path = Self::path(Some(ident));
        if let Some(fields) = fields {
            path.push_str("?fields=");
            path.push_str(&fields.join(","));
        }
        let (_, body) = self
            .client
            .json_request(Method::GET, &path, None, None)
            .await?;
        parse(body.clone(), &body)
    }

    /// Fetch the port group holding the given MAC address, if any.
    ///
    /// Filtering by address yields a collection of at most one; anything
    /// else resolves to `None`.
    pub async fn get_by_address(
        &self,
        address: &str,
        fields: Option<&[&str]>,
    ) -> Result<Option<Portgroup>, Error> {
        let params = PortgroupListParams {
            address: Some(address.to_owned()),
            detail: fields.is_none(),
            fields: fields.map(|fields| fields.iter().map(|&f| f.to_owned()).collect()),
            ..PortgroupListParams::default()
        };
        let mut portgroups = self.list(&params).await?;
        if portgroups.len() == 1 {
            Ok(portgroups.pop())
        } else {
            Ok(None)
        }
    }

    /// Create a port group. `attrs` must be a JSON object using only the
    /// attributes the API accepts on creation.
    pub async fn create(&self, attrs: &Value) -> Result<Portgroup, Error> {
        let Some(object) = attrs.as_object() else {
            return Err(Error::InvalidAttribute(
                "port group attributes must be a JSON object".to_owned(),
            ));
        };
        for key in object.keys() {
            if !CREATION_ATTRIBUTES.contains(&key.as_str()) {
                return Err(Error::InvalidAttribute(key.clone()));
            }
        }
        let (_, body) = self
            .client
            .json_request(Method::POST, &Self::path(None), None, Some(attrs))
            .await?;
        parse(body.clone(), &body)
    }

    /// Apply a JSON patch to a port group.
    pub async fn update(&self, ident: &str, patch: &Value) -> Result<Portgroup, Error> {
        let (_, body) = self
            .client
            .json_request(Method::PATCH, &Self::path(Some(ident)), None, Some(patch))
            .await?;
        parse(body.clone(), &body)
    }

    /// Delete a port group by UUID or name.
    pub async fn delete(&self, ident: &str) -> Result<(), Error> {
        self.client
            .json_request(Method::DELETE, &Self::path(Some(ident)), None, None)
            .await?;
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value, body: &Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: body.to_string(),
    })
}
