//! Plain JSON-RPC 2.0-ish wire types, generalized from the teacher's
//! stratum-specific `Message`/`Id` (which carries a `reject-reason` field
//! this protocol has no use for).

use super::*;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Clone)]
#[serde(untagged)]
pub enum Id {
    Null,
    Number(u64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Value,
    },
    Response {
        id: Id,
        result: Option<Value>,
        error: Option<JsonRpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let is_response = value.get("result").is_some() || value.get("error").is_some();
        let is_notification = value.get("method").is_some()
            && (value.get("id").is_none() || value.get("id") == Some(&Value::Null));
        let is_request = value.get("method").is_some() && value.get("id").is_some();

        if is_response {
            #[derive(Deserialize)]
            struct Resp {
                id: Id,
                result: Option<Value>,
                error: Option<JsonRpcError>,
            }
            let r: Resp = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Message::Response {
                id: r.id,
                result: r.result,
                error: r.error,
            })
        } else if is_notification {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::missing_field("method"))?
                .to_string();
            let params = value
                .get("params")
                .cloned()
                .ok_or_else(|| de::Error::missing_field("params"))?;
            Ok(Message::Notification { method, params })
        } else if is_request {
            #[derive(Deserialize)]
            struct Req {
                id: Id,
                method: String,
                params: Value,
            }
            let r: Req = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Message::Request {
                id: r.id,
                method: r.method,
                params: r.params,
            })
        } else {
            Err(de::Error::custom("unknown message format"))
        }
    }
}

impl Message {
    pub fn request(id: Id, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[track_caller]
    fn case(s: &str, expected: Message) {
        let actual = serde_json::from_str::<Message>(s).unwrap();
        assert_eq!(actual, expected);

        let serialized = serde_json::to_string(&actual).unwrap();
        let round_trip = serde_json::from_str::<Message>(&serialized).unwrap();
        assert_eq!(round_trip, expected);
    }

    #[test]
    fn request() {
        case(
            r#"{"id":1,"method":"server.version","params":["peernet/0.1","1.4"]}"#,
            Message::Request {
                id: Id::Number(1),
                method: "server.version".into(),
                params: json!(["peernet/0.1", "1.4"]),
            },
        );
    }

    #[test]
    fn notification_without_id() {
        case(
            r#"{"method":"blockchain.headers.subscribe","params":[{"height":1,"hex":"00"}]}"#,
            Message::Notification {
                method: "blockchain.headers.subscribe".into(),
                params: json!([{"height":1,"hex":"00"}]),
            },
        );
    }

    #[test]
    fn response_with_error() {
        case(
            r#"{"id":10,"result":null,"error":{"code":1,"message":"excessive resource usage"}}"#,
            Message::Response {
                id: Id::Number(10),
                result: None,
                error: Some(JsonRpcError {
                    code: 1,
                    message: "excessive resource usage".into(),
                }),
            },
        );
    }

    #[test]
    fn response_with_result() {
        case(
            r#"{"id":2,"result":["peer/1.0","1.4"],"error":null}"#,
            Message::Response {
                id: Id::Number(2),
                result: Some(json!(["peer/1.0", "1.4"])),
                error: None,
            },
        );
    }
}
