//! Coordination path layout
//!
//! `/kite-rpc/<interface><group><version>/<host>:<port>`

use kite_core::{Endpoint, ServiceKey};

/// Root under which every service is registered
pub const ROOT_PATH: &str = "/kite-rpc";

/// `/kite-rpc/<service key>`
#[must_use]
pub fn service_path(key: &ServiceKey) -> String {
    format!("{ROOT_PATH}/{key}")
}

/// `/kite-rpc/<service key>/<host:port>`
#[must_use]
pub fn endpoint_path(key: &ServiceKey, endpoint: &Endpoint) -> String {
    format!("{ROOT_PATH}/{key}/{endpoint}")
}

/// Parent of an absolute path; `None` for the root itself
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}

/// Last segment of an absolute path
#[must_use]
pub fn name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Every ancestor of `path` below `/`, outermost first, followed by `path`
pub fn lineage(path: &str) -> Vec<&str> {
    let mut chain = vec![path.trim_end_matches('/')];
    let mut current = chain[0];
    while let Some(p) = parent(current) {
        if p == "/" {
            break;
        }
        chain.push(p);
        current = p;
    }
    chain.reverse();
    chain
}

/// Validate an absolute, non-root path
pub fn validate(path: &str) -> kite_core::Result<()> {
    if !path.starts_with('/') || path.trim_end_matches('/').is_empty() || path.contains("//") {
        return Err(kite_core::Error::Coordination(format!(
            "Invalid coordination path '{path}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let key = ServiceKey::new("demo.Greeter", "", "v1");
        let endpoint = Endpoint::new("10.0.0.5", 9000);

        assert_eq!(service_path(&key), "/kite-rpc/demo.Greeterv1");
        assert_eq!(endpoint_path(&key, &endpoint), "/kite-rpc/demo.Greeterv1/10.0.0.5:9000");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000"), Some("/kite-rpc/demo.Greeterv1"));
        assert_eq!(parent("/kite-rpc"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/kite-rpc/demo.Greeterv1/10.0.0.5:9000"), "10.0.0.5:9000");
        assert_eq!(name("/kite-rpc"), "kite-rpc");
    }

    #[test]
    fn test_lineage() {
        assert_eq!(
            lineage("/kite-rpc/demo.Greeterv1/10.0.0.5:9000"),
            vec![
                "/kite-rpc",
                "/kite-rpc/demo.Greeterv1",
                "/kite-rpc/demo.Greeterv1/10.0.0.5:9000"
            ]
        );
        assert_eq!(lineage("/kite-rpc"), vec!["/kite-rpc"]);
    }

    #[test]
    fn test_validate() {
        assert!(validate("/kite-rpc/x").is_ok());
        assert!(validate("kite-rpc/x").is_err());
        assert!(validate("/").is_err());
        assert!(validate("/kite-rpc//x").is_err());
    }
}
