//! Listing payload handling
//!
//! Turns raw list responses into item payloads: locates the items, flattens
//! aggregated responses and adds derived fields the table columns read.

use super::value::json_path;
use serde_json::{Map, Value};

/// Extract items from a response using the response path.
///
/// An object at the path (a "get" style endpoint) is treated as one item.
pub fn extract_items(response: &Value, path: &str, aggregated: bool) -> Vec<Value> {
    let Some(found) = json_path(response, path) else {
        return Vec::new();
    };

    let raw_items = if aggregated {
        flatten_aggregated(found)
    } else {
        match found {
            Value::Array(arr) => arr.clone(),
            Value::Object(_) => vec![found.clone()],
            _ => Vec::new(),
        }
    };

    raw_items.into_iter().map(post_process_item).collect()
}

/// Flatten the `items` of an aggregated API response.
/// Aggregated responses have format: { "zones/us-central1-a": { "instances": [...] }, ... }
fn flatten_aggregated(items: &Value) -> Vec<Value> {
    let Some(items) = items.as_object() else {
        return Vec::new();
    };

    let mut all_items = Vec::new();
    for zone_data in items.values() {
        let Some(obj) = zone_data.as_object() else {
            continue;
        };
        for (key, value) in obj {
            // Zones with nothing in them only carry a warning
            if key == "warning" {
                continue;
            }
            if let Some(arr) = value.as_array() {
                all_items.extend(arr.iter().cloned());
            }
        }
    }
    all_items
}

/// Add computed/derived fields to a listed item
pub fn post_process_item(mut item: Value) -> Value {
    if let Value::Object(ref mut map) = item {
        for field in ["zone", "region", "machineType", "type", "network", "location"] {
            add_short_name(map, field);
        }

        if let Some(users) = map.get("users").and_then(|v| v.as_array()) {
            let count = users.len();
            map.insert("users_count".to_string(), Value::from(count));
        }

        if let Some(subnets) = map.get("subnetworks").and_then(|v| v.as_array()) {
            let count = subnets.len();
            map.insert("subnetworks_count".to_string(), Value::from(count));
        }
    }
    item
}

fn add_short_name(map: &mut Map<String, Value>, field: &str) {
    if let Some(url) = map.get(field).and_then(|v| v.as_str()) {
        let short = extract_short_name(url);
        map.insert(format!("{}_short", field), Value::String(short));
    }
}

/// Extract short name from GCP resource URL
/// e.g., "https://www.googleapis.com/compute/v1/projects/my-project/zones/us-central1-a" -> "us-central1-a"
pub fn extract_short_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// Provider-assigned identity of a listed item, as text
pub fn item_identity(item: &Value, id_field: &str) -> Option<String> {
    match json_path(item, id_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Continuation token of a list response, if another page exists
pub fn next_page_token(response: &Value) -> Option<String> {
    response
        .get("nextPageToken")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_aggregated_skips_warnings() {
        let response = json!({
            "items": {
                "zones/us-central1-a": {"instances": [{"id": "1", "zone": "https://x/zones/us-central1-a"}]},
                "zones/us-east1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}},
                "zones/europe-west1-d": {"instances": [{"id": "2"}]}
            }
        });
        let items = extract_items(&response, "items", true);
        assert_eq!(items.len(), 2);
        let first = items.iter().find(|i| i["id"] == "1").unwrap();
        assert_eq!(first["zone_short"], "us-central1-a");
    }

    #[test]
    fn test_single_object_is_one_item() {
        let response = json!({"projectId": "alpha-project", "lifecycleState": "ACTIVE"});
        assert_eq!(extract_items(&response, "", false).len(), 1);
    }

    #[test]
    fn test_missing_path_is_empty() {
        assert!(extract_items(&json!({"kind": "x"}), "items", false).is_empty());
    }

    #[test]
    fn test_item_identity() {
        assert_eq!(item_identity(&json!({"id": "42"}), "id"), Some("42".to_string()));
        assert_eq!(item_identity(&json!({"id": 42}), "id"), Some("42".to_string()));
        assert_eq!(item_identity(&json!({"id": ""}), "id"), None);
        assert_eq!(item_identity(&json!({}), "id"), None);
    }

    #[test]
    fn test_next_page_token() {
        assert_eq!(next_page_token(&json!({"nextPageToken": "p2"})), Some("p2".into()));
        assert_eq!(next_page_token(&json!({"nextPageToken": ""})), None);
        assert_eq!(next_page_token(&json!({})), None);
    }

    #[test]
    fn test_counts() {
        let item = post_process_item(json!({"users": ["a", "b"]}));
        assert_eq!(item["users_count"], 2);
    }
}
