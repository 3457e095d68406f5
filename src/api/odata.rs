use serde_json::Value;

use crate::error::ApiError;

/// OData query options carried on every paginated request.
#[derive(Debug, Clone, Default)]
pub struct ODataQuery {
    pub top: Option<i64>,
    pub skip: Option<i64>,
    pub filter: Option<String>,
    pub orderby: Option<String>,
}

impl ODataQuery {
    /// Render into `$`-prefixed query pairs; reqwest handles the URL encoding.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(top) = self.top {
            pairs.push(("$top", top.to_string()));
        }
        if let Some(skip) = self.skip {
            pairs.push(("$skip", skip.to_string()));
        }
        if let Some(filter) = &self.filter {
            pairs.push(("$filter", filter.clone()));
        }
        if let Some(orderby) = &self.orderby {
            pairs.push(("$orderby", orderby.clone()));
        }
        pairs
    }

    /// Compose an additional filter clause with any existing one via
    /// conjunction.
    pub fn and_filter(mut self, clause: &str) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => format!("({existing}) and ({clause})"),
            None => clause.to_string(),
        });
        self
    }
}

/// One page of an OData collection.
#[derive(Debug, Clone)]
pub struct Page {
    /// Zero-based page index within this fetch.
    pub index: u64,
    pub items: Vec<Value>,
    /// Server-reported total count, when present (`@odata.count`).
    pub total_count: Option<i64>,
    /// Explicit continuation link, when present.
    pub next_link: Option<String>,
}

/// How to treat response bodies that match none of the known shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Unknown shape is a `Validation` error.
    Strict,
    /// Unknown shape is logged and treated as an empty page.
    Lax,
}

/// Contents of one parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBody {
    pub items: Vec<Value>,
    pub total_count: Option<i64>,
    pub next_link: Option<String>,
}

/// Parse one of the three tolerated response shapes:
/// `{value: [...]}` (OData), `{items: [...]}` (vendor), or a bare array.
pub fn parse_page_body(body: Value, mode: ParseMode) -> Result<PageBody, ApiError> {
    match body {
        Value::Array(items) => Ok(PageBody {
            items,
            total_count: None,
            next_link: None,
        }),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("value") {
                return Ok(PageBody {
                    items: items.clone(),
                    total_count: map.get("@odata.count").and_then(Value::as_i64),
                    next_link: map
                        .get("@odata.nextLink")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }

            if let Some(Value::Array(items)) = map.get("items") {
                return Ok(PageBody {
                    items: items.clone(),
                    total_count: map.get("totalCount").and_then(Value::as_i64),
                    next_link: map
                        .get("nextPageLink")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }

            let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
            match mode {
                ParseMode::Strict => Err(ApiError::Validation(format!(
                    "response object has no value/items array (keys: {keys:?})"
                ))),
                ParseMode::Lax => {
                    tracing::warn! {
                        ?keys,
                        "Response matched no known collection shape, treating as empty page."
                    };
                    Ok(PageBody {
                        items: Vec::new(),
                        total_count: None,
                        next_link: None,
                    })
                }
            }
        }
        _ => match mode {
            ParseMode::Strict => Err(ApiError::Validation(
                "response body is neither an object nor an array".to_string(),
            )),
            ParseMode::Lax => {
                tracing::warn! { "Non-collection response body, treating as empty page." };
                Ok(PageBody {
                    items: Vec::new(),
                    total_count: None,
                    next_link: None,
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_odata_value_shape() {
        let body = json!({
            "value": [{"id": "1"}, {"id": "2"}],
            "@odata.count": 42,
            "@odata.nextLink": "https://x.example.com/studies?$skip=2"
        });

        let page = parse_page_body(body, ParseMode::Strict).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_count, Some(42));
        assert_eq!(
            page.next_link.as_deref(),
            Some("https://x.example.com/studies?$skip=2")
        );
    }

    #[test]
    fn parses_vendor_items_shape() {
        let body = json!({"items": [{"id": "a"}], "nextPageLink": "next"});

        let page = parse_page_body(body, ParseMode::Strict).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_link.as_deref(), Some("next"));
    }

    #[test]
    fn parses_bare_array_shape() {
        let page = parse_page_body(json!([{"id": 1}, {"id": 2}, {"id": 3}]), ParseMode::Strict)
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total_count, None);
        assert_eq!(page.next_link, None);
    }

    #[test]
    fn unknown_shape_fails_strict_but_is_empty_in_lax() {
        let body = json!({"error": "nope"});

        assert!(matches!(
            parse_page_body(body.clone(), ParseMode::Strict),
            Err(ApiError::Validation(_))
        ));

        let page = parse_page_body(body, ParseMode::Lax).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn filter_conjunction_preserves_both_clauses() {
        let query = ODataQuery {
            filter: Some("status eq 'Active'".to_string()),
            ..Default::default()
        }
        .and_filter("lastUpdatedOn gt 2024-01-01T00:00:00.000Z");

        assert_eq!(
            query.filter.as_deref(),
            Some("(status eq 'Active') and (lastUpdatedOn gt 2024-01-01T00:00:00.000Z)")
        );

        let fresh = ODataQuery::default().and_filter("a eq 1");
        assert_eq!(fresh.filter.as_deref(), Some("a eq 1"));
    }

    #[test]
    fn query_pairs_use_dollar_prefixed_keys() {
        let query = ODataQuery {
            top: Some(100),
            skip: Some(200),
            filter: Some("x gt 1".to_string()),
            orderby: Some("id".to_string()),
        };

        let pairs = query.query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("$top", "100".to_string()),
                ("$skip", "200".to_string()),
                ("$filter", "x gt 1".to_string()),
                ("$orderby", "id".to_string()),
            ]
        );
    }
}
