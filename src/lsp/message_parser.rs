use crate::lsp::error::TransportError;
use crate::lsp::types::{Message, Notification, Request, Response};
use serde_json::Value;

fn parse_error(e: serde_json::Error) -> TransportError {
    TransportError::Parse(e.to_string())
}

/// Classify a decoded envelope: `id` + `method` is a request, `method` alone is a
/// notification, `id` alone (possibly `null`) is a response.
pub fn parse_message(json: Value) -> Result<Message, TransportError> {
    if !json.is_object() {
        return Err(TransportError::Parse(
            "JSON-RPC message must be an object".to_string(),
        ));
    }
    let has_method = json.get("method").is_some();
    let has_id = json.get("id").is_some_and(|id| !id.is_null());

    match (has_method, has_id) {
        (true, true) => {
            let request: Request = serde_json::from_value(json).map_err(parse_error)?;
            Ok(Message::Request(request))
        }
        (true, false) => {
            let notification: Notification = serde_json::from_value(json).map_err(parse_error)?;
            Ok(Message::Notification(notification))
        }
        (false, _) if json.get("id").is_some() => {
            if json.get("result").is_none() && json.get("error").is_none() {
                return Err(TransportError::Parse(
                    "response carries neither result nor error".to_string(),
                ));
            }
            let response: Response = serde_json::from_value(json).map_err(parse_error)?;
            Ok(Message::Response(response))
        }
        _ => Err(TransportError::Parse(
            "message has neither method nor id".to_string(),
        )),
    }
}

/// Parse a full JSON payload (bytes) into a `Message`.
pub fn parse_message_from_slice(s: &[u8]) -> Result<Message, TransportError> {
    let json: Value = serde_json::from_slice(s).map_err(parse_error)?;
    parse_message(json)
}

pub fn parse_message_from_str(s: &str) -> Result<Message, TransportError> {
    parse_message_from_slice(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::types::RequestId;

    #[test]
    fn test_request_has_id_and_method() {
        let message =
            parse_message_from_str(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
                .unwrap();
        match message {
            Message::Request(request) => {
                assert_eq!(request.id, RequestId::Number(1));
                assert_eq!(request.method, "initialize");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_notification_has_method_only() {
        let message = parse_message_from_str(r#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
        assert!(matches!(message, Message::Notification(n) if n.method == "initialized"));
    }

    #[test]
    fn test_response_with_string_id_and_error() {
        let message = parse_message_from_str(
            r#"{"jsonrpc":"2.0","id":"a1","error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        match message {
            Message::Response(response) => {
                assert_eq!(response.id, Some(RequestId::from("a1")));
                assert_eq!(response.error.unwrap().code, -32601);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_response_with_null_result() {
        let message = parse_message_from_str(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        match message {
            Message::Response(response) => {
                assert_eq!(response.into_result(), Ok(Value::Null));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_rejects_non_object_and_garbage() {
        assert!(parse_message_from_str("[1,2]").is_err());
        assert!(parse_message_from_str("{not json").is_err());
        assert!(parse_message_from_str(r#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(parse_message_from_str(r#"{"jsonrpc":"2.0","id":2}"#).is_err());
    }
}
