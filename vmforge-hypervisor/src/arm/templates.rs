//! Static deployment documents.

use serde_json::Value;

use crate::error::{HypervisorError, Result};

/// Deployment document for a Linux VM with SSH key login, a public IP and an
/// optional empty data disk.
pub const LINUX_TEMPLATE: &str = include_str!("linux.json");

/// [`LINUX_TEMPLATE`] as a JSON value.
pub fn linux_template() -> Result<Value> {
    serde_json::from_str(LINUX_TEMPLATE)
        .map_err(|e| HypervisorError::Internal(format!("invalid linux deployment template: {}", e)))
}

/// Names of the parameters a document declares.
pub fn parameter_names(template: &Value) -> Vec<String> {
    template
        .get("parameters")
        .and_then(Value::as_object)
        .map(|params| params.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_template_parses() {
        let template = linux_template().unwrap();
        assert_eq!(parameter_names(&template).len(), 19);
        assert_eq!(template["resources"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_parameters_have_no_defaults() {
        let template = linux_template().unwrap();
        for (name, param) in template["parameters"].as_object().unwrap() {
            assert!(param.get("defaultValue").is_none(), "{} has a default", name);
        }
    }
}
