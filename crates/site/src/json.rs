//! Configurable JSON site adapter
//!
//! Most retailer stock endpoints return one JSON document per product with a
//! listing-level stock flag and a list (or map) of variants. `JsonAdapter`
//! locates those parts with RFC 6901 JSON pointers taken from configuration,
//! so a new retailer only needs a `[sites.json]` table, not new code.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{AvailabilityMap, ErrorKind, Listing, ProductInfo, SiteAdapter};

/// Placeholder replaced by the product identifier in `url_template`.
pub const PRODUCT_PLACEHOLDER: &str = "{product}";

/// Where each piece of the listing lives inside the response document.
///
/// Listing-level flags (`in_stock`, `salable`) are optional; when configured,
/// a missing or false value classifies the poll as `OutOfStock`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonPointers {
    pub in_stock: Option<String>,
    pub salable: Option<String>,
    /// Pointer to the variant array or object
    pub variants: String,
    /// Field holding the variant key inside each variant entry. For object
    /// variants the map key is used when this field is absent.
    pub variant_key: String,
    /// Field holding the variant stock flag inside each variant entry
    pub variant_in_stock: String,
    /// String value meaning "in stock" when the flag is textual (e.g. "IN STOCK")
    pub in_stock_value: Option<String>,
    /// Field holding the site's option id inside each variant entry. The
    /// restock server addresses variants by this id.
    pub variant_id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub price: Option<String>,
    pub image: Option<String>,
}

impl Default for JsonPointers {
    fn default() -> Self {
        Self {
            in_stock: None,
            salable: None,
            variants: "/variants".into(),
            variant_key: "key".into(),
            variant_in_stock: "in_stock".into(),
            in_stock_value: None,
            variant_id: None,
            name: Some("/name".into()),
            url: Some("/url".into()),
            price: Some("/price".into()),
            image: Some("/image".into()),
        }
    }
}

/// Site adapter driven by JSON pointers.
#[derive(Debug, Clone)]
pub struct JsonAdapter {
    id: String,
    name: String,
    url_template: String,
    pointers: JsonPointers,
}

impl JsonAdapter {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url_template: impl Into<String>,
        pointers: JsonPointers,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url_template: url_template.into(),
            pointers,
        }
    }

    fn flag(&self, doc: &Value, pointer: &Option<String>) -> bool {
        match pointer {
            Some(p) => doc.pointer(p).is_some_and(|v| self.truthy(v)),
            None => true,
        }
    }

    fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n > 0.0),
            Value::String(s) => match &self.pointers.in_stock_value {
                Some(expected) => s.eq_ignore_ascii_case(expected),
                None => s.eq_ignore_ascii_case("true"),
            },
            _ => false,
        }
    }

    fn info(&self, doc: &Value) -> ProductInfo {
        let lookup = |pointer: &Option<String>| {
            pointer
                .as_deref()
                .and_then(|p| doc.pointer(p))
                .and_then(text)
        };
        ProductInfo {
            name: lookup(&self.pointers.name),
            url: lookup(&self.pointers.url),
            price: lookup(&self.pointers.price),
            image: lookup(&self.pointers.image),
        }
    }

    fn variants(&self, node: &Value) -> (AvailabilityMap, HashMap<String, String>) {
        let key_field = self.pointers.variant_key.as_str();
        let mut map = AvailabilityMap::new();
        let mut ids = HashMap::new();

        match node {
            Value::Array(entries) => {
                for entry in entries {
                    let Some(key) = entry.get(key_field).and_then(text) else {
                        continue;
                    };
                    self.variant(key, entry, &mut map, &mut ids);
                }
            }
            Value::Object(entries) => {
                for (map_key, entry) in entries {
                    let key = entry
                        .get(key_field)
                        .and_then(text)
                        .unwrap_or_else(|| map_key.clone());
                    self.variant(key, entry, &mut map, &mut ids);
                }
            }
            _ => {}
        }
        (map, ids)
    }

    fn variant(
        &self,
        key: String,
        entry: &Value,
        map: &mut AvailabilityMap,
        ids: &mut HashMap<String, String>,
    ) {
        let in_stock = entry
            .get(&self.pointers.variant_in_stock)
            .is_some_and(|v| self.truthy(v));
        if let Some(id) = self
            .pointers
            .variant_id
            .as_deref()
            .and_then(|field| entry.get(field))
            .and_then(text)
        {
            ids.insert(key.clone(), id);
        }
        map.insert(key, in_stock);
    }
}

impl SiteAdapter for JsonAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn product_url(&self, product: &str) -> String {
        self.url_template.replace(PRODUCT_PLACEHOLDER, product)
    }

    fn parse(&self, product: &str, body: &[u8]) -> Result<Listing, ErrorKind> {
        let doc: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(site = %self.id, product, error = %e, "product response is not valid JSON");
                return Err(ErrorKind::Unknown(200));
            }
        };

        if !self.flag(&doc, &self.pointers.in_stock) || !self.flag(&doc, &self.pointers.salable) {
            return Err(ErrorKind::OutOfStock);
        }

        let (availability, variant_ids) = doc
            .pointer(&self.pointers.variants)
            .map(|node| self.variants(node))
            .unwrap_or_default();
        if availability.is_empty() {
            return Err(ErrorKind::NoVariants);
        }

        Ok(Listing {
            info: self.info(&doc),
            availability,
            variant_ids,
        })
    }
}

/// Render a scalar JSON value as display text.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
