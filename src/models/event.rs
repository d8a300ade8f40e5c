use serde::{Deserialize, Serialize};

/// A user connecting from an address, as reported by the hosting framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// One line of input accepted by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Connect(ConnectEvent),
    Lookup { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_request() {
        let line = r#"{"type":"connect","id":"u1","name":"Alice","address":"1.2.3.4"}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        assert_eq!(
            request,
            Request::Connect(ConnectEvent {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                address: "1.2.3.4".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_lookup_request() {
        let request: Request = serde_json::from_str(r#"{"type":"lookup","name":"alice"}"#).unwrap();
        assert_eq!(request, Request::Lookup { name: "alice".to_string() });
    }

    #[test]
    fn test_unknown_request_type_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"kick","name":"x"}"#).is_err());
    }
}
