//! Custom-attribute routing hints.
//!
//! Invocations may carry a header such as
//! `X-Amzn-SageMaker-Custom-Attributes: tfs-model-name=cifar,tfs-method=classify`.
//! Keys starting with the configured prefix are routing hints; everything else
//! is kept as opaque context for hooks and the backend.

use vassago_core::Endpoint;

/// Default header carrying custom attributes.
pub const DEFAULT_HEADER: &str = "X-Amzn-SageMaker-Custom-Attributes";

/// Default prefix of recognized keys.
pub const DEFAULT_PREFIX: &str = "tfs-";

/// Backend method used when none is requested.
pub const DEFAULT_METHOD: &str = "predict";

/// Parsed custom attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomAttributes {
    /// `<prefix>model-name`.
    pub model_name: Option<String>,
    /// `<prefix>model-version`.
    pub model_version: Option<String>,
    /// `<prefix>method`.
    pub method: Option<String>,
    /// Every other `key=value` pair, in header order.
    pub passthrough: Vec<(String, String)>,
    /// The header exactly as received.
    pub raw: Option<String>,
}

impl CustomAttributes {
    /// Parses a header value. Malformed segments are kept as pass-through
    /// context with an empty value.
    #[must_use]
    pub fn parse(header: &str, prefix: &str) -> Self {
        let mut attrs = Self {
            raw: Some(header.to_string()),
            ..Self::default()
        };

        for segment in header.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match segment.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (segment, ""),
            };
            let recognized = key
                .strip_prefix(prefix)
                .filter(|_| !value.is_empty());
            match recognized {
                Some("model-name") => attrs.model_name = Some(value.to_string()),
                Some("model-version") => attrs.model_version = Some(value.to_string()),
                Some("method") => attrs.method = Some(value.to_string()),
                _ => attrs.passthrough.push((key.to_string(), value.to_string())),
            }
        }
        attrs
    }

    /// The backend method, falling back to `predict`.
    #[must_use]
    pub fn method_or_default(&self) -> &str {
        self.method.as_deref().unwrap_or(DEFAULT_METHOD)
    }
}

/// REST URI of `model` on `endpoint`:
/// `http://host:port/v1/models/<model>[/versions/<v>]:<method>`.
#[must_use]
pub fn backend_uri(endpoint: &Endpoint, model: &str, version: Option<&str>, method: &str) -> String {
    let mut uri = format!("{}/v1/models/{model}", endpoint.rest_base_url());
    if let Some(version) = version {
        uri.push_str("/versions/");
        uri.push_str(version);
    }
    uri.push(':');
    uri.push_str(method);
    uri
}

#[cfg(test)]
mod tests {
    use vassago_core::PortPair;

    use super::*;

    #[test]
    fn test_parse_recognized_and_passthrough() {
        let attrs = CustomAttributes::parse(
            "tfs-model-name=cifar, tfs-method=classify,trace-id=abc,tfs-model-version=2",
            DEFAULT_PREFIX,
        );
        assert_eq!(attrs.model_name.as_deref(), Some("cifar"));
        assert_eq!(attrs.model_version.as_deref(), Some("2"));
        assert_eq!(attrs.method_or_default(), "classify");
        assert_eq!(
            attrs.passthrough,
            vec![("trace-id".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn test_unknown_prefixed_keys_pass_through() {
        let attrs = CustomAttributes::parse("tfs-shadow=1,garbage,,", DEFAULT_PREFIX);
        assert!(attrs.model_name.is_none());
        assert_eq!(attrs.method_or_default(), DEFAULT_METHOD);
        assert_eq!(attrs.passthrough.len(), 2);
        assert_eq!(attrs.raw.as_deref(), Some("tfs-shadow=1,garbage,,"));
    }

    #[test]
    fn test_custom_prefix() {
        let attrs = CustomAttributes::parse("x-model-name=a,tfs-model-name=b", "x-");
        assert_eq!(attrs.model_name.as_deref(), Some("a"));
        assert_eq!(attrs.passthrough[0].0, "tfs-model-name");
    }

    #[test]
    fn test_backend_uri() {
        let ep = Endpoint::localhost(PortPair::new(9001, 9501));
        assert_eq!(
            backend_uri(&ep, "half_plus_three", None, DEFAULT_METHOD),
            "http://127.0.0.1:9001/v1/models/half_plus_three:predict"
        );
        assert_eq!(
            backend_uri(&ep, "cifar", Some("2"), "classify"),
            "http://127.0.0.1:9001/v1/models/cifar/versions/2:classify"
        );
    }
}
