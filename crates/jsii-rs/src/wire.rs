//! Wire protocol types and framing.
//!
//! The kernel speaks line-delimited UTF-8 JSON over its stdio: every request
//! and every response is exactly one JSON object on one line, terminated by
//! `\n`. Requests serialize with the request name as their single top-level
//! key (`{"invoke": {...}}`); responses carry exactly one of `hello`, `ok`,
//! `error`, or `callback`.

use crate::config::WireConfig;
use crate::error::{JsiiError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire form of an object reference.
///
/// Serializes as the tagged `{"$jsii.byref": <handle>}` object. Kernel
/// traffic occasionally carries the bare handle string instead, so
/// deserialization accepts both forms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireObjRef {
    #[serde(rename = "$jsii.byref")]
    pub handle: String,
    #[serde(rename = "$jsii.interfaces", skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<String>>,
}

impl WireObjRef {
    /// Reference a handle with no interface annotations.
    pub fn bare(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            interfaces: None,
        }
    }
}

impl<'de> Deserialize<'de> for WireObjRef {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "$jsii.byref")]
            handle: String,
            #[serde(rename = "$jsii.interfaces", default)]
            interfaces: Option<Vec<String>>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Form {
            Bare(String),
            Tagged(Tagged),
        }

        Ok(match Form::deserialize(deserializer)? {
            Form::Bare(handle) => WireObjRef {
                handle,
                interfaces: None,
            },
            Form::Tagged(tagged) => WireObjRef {
                handle: tagged.handle,
                interfaces: tagged.interfaces,
            },
        })
    }
}

/// A member override registered at `create` time.
///
/// Overridden members are dispatched back to the host as callbacks; the
/// cookie is echoed verbatim in the callback descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl Override {
    pub fn method(name: impl Into<String>) -> Self {
        Self {
            method: Some(name.into()),
            property: None,
            cookie: None,
        }
    }

    pub fn property(name: impl Into<String>) -> Self {
        Self {
            method: None,
            property: Some(name.into()),
            cookie: None,
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }
}

/// Payload of a `create` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub fqn: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<Override>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
}

/// A request to the kernel.
///
/// Externally tagged on purpose: serde then emits the request name as the
/// single top-level key, which is exactly the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Request {
    Load {
        name: String,
        version: String,
        tarball: String,
    },
    Create(CreateRequest),
    Del {
        objref: WireObjRef,
    },
    Invoke {
        objref: WireObjRef,
        method: String,
        #[serde(default)]
        args: Vec<JsonValue>,
    },
    Sinvoke {
        fqn: String,
        method: String,
        #[serde(default)]
        args: Vec<JsonValue>,
    },
    Get {
        objref: WireObjRef,
        property: String,
    },
    Sget {
        fqn: String,
        property: String,
    },
    Set {
        objref: WireObjRef,
        property: String,
        value: JsonValue,
    },
    Sset {
        fqn: String,
        property: String,
        value: JsonValue,
    },
    Begin {
        objref: WireObjRef,
        method: String,
        #[serde(default)]
        args: Vec<JsonValue>,
    },
    End {
        promiseid: String,
    },
    Callbacks {},
    Complete {
        cbid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
    Naming {
        assembly: String,
    },
    Stats {},
}

/// Body of a callback asking the host to invoke a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeCallback {
    pub objref: WireObjRef,
    pub method: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

/// Body of a callback asking the host to read a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCallback {
    pub objref: WireObjRef,
    pub property: String,
}

/// Body of a callback asking the host to write a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCallback {
    pub objref: WireObjRef,
    pub property: String,
    pub value: JsonValue,
}

/// A callback descriptor embedded in a response frame.
///
/// Exactly one of `invoke`, `get`, `set` is expected to be present; the
/// completion must echo `cbid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub cbid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke: Option<InvokeCallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<GetCallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<SetCallback>,
}

/// A response from the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Version announcement; must be the first line the kernel emits.
    Hello { version: String },
    /// Terminal success. `null` denotes void or undefined.
    Ok(JsonValue),
    /// Terminal failure for the request in flight.
    Error {
        message: String,
        stack: Option<String>,
    },
    /// Non-terminal interruption: the kernel needs the host to run a member.
    Callback(Callback),
}

impl Response {
    /// Classifies one decoded line.
    ///
    /// `error` takes precedence over `callback` over `hello` over `ok`, which
    /// also resolves malformed frames carrying more than one discriminator.
    pub fn parse(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut fields) = value else {
            return Err(JsiiError::protocol("response line is not a JSON object"));
        };

        if let Some(error) = fields.remove("error") {
            let message = match error {
                JsonValue::String(message) => message,
                other => other.to_string(),
            };
            let stack = fields
                .remove("stack")
                .and_then(|s| s.as_str().map(str::to_string));
            return Ok(Response::Error { message, stack });
        }

        if let Some(callback) = fields.remove("callback") {
            let callback = serde_json::from_value(callback).map_err(|e| {
                JsiiError::protocol(format!("malformed callback descriptor: {}", e))
            })?;
            return Ok(Response::Callback(callback));
        }

        if let Some(hello) = fields.remove("hello") {
            let version = hello
                .as_str()
                .ok_or_else(|| JsiiError::protocol("'hello' version is not a string"))?
                .to_string();
            return Ok(Response::Hello { version });
        }

        if let Some(ok) = fields.remove("ok") {
            return Ok(Response::Ok(ok));
        }

        Err(JsiiError::protocol(
            "response carries none of 'hello', 'ok', 'error', 'callback'",
        ))
    }
}

/// Writes one request as compact JSON on a single line and flushes.
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(request)
        .map_err(|e| JsiiError::protocol(format!("failed to encode request: {}", e)))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and classifies the next response line.
///
/// Returns `None` on EOF so the caller can distinguish kernel death from a
/// malformed frame. Lines longer than
/// [`WireConfig::MAX_RESPONSE_LINE_BYTES`] are a protocol violation.
pub async fn read_response<R>(reader: &mut R) -> Result<Option<Response>>
where
    R: AsyncBufRead + Unpin,
{
    let max = WireConfig::MAX_RESPONSE_LINE_BYTES;
    let mut line = Vec::new();

    let mut limited = (&mut *reader).take(max as u64 + 1);
    let read = limited.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.len() > max {
        return Err(JsiiError::protocol(format!(
            "response line exceeds {} bytes",
            max
        )));
    }

    let value: JsonValue = serde_json::from_slice(&line)
        .map_err(|e| JsiiError::protocol(format!("failed to parse response line: {}", e)))?;
    Response::parse(value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_serializes_with_single_top_level_key() {
        let request = Request::Invoke {
            objref: WireObjRef::bare("Calc@1"),
            method: "add".into(),
            args: vec![json!(1), json!(2)],
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"invoke":{"objref":{"$jsii.byref":"Calc@1"},"method":"add","args":[1,2]}}"#
        );
    }

    #[test]
    fn test_complete_serializes_exactly_one_outcome_field() {
        let success = Request::Complete {
            cbid: "cb1".into(),
            result: Some(json!(7)),
            err: None,
        };
        assert_eq!(
            serde_json::to_string(&success).unwrap(),
            r#"{"complete":{"cbid":"cb1","result":7}}"#
        );

        let failure = Request::Complete {
            cbid: "cb1".into(),
            result: None,
            err: Some("boom".into()),
        };
        assert_eq!(
            serde_json::to_string(&failure).unwrap(),
            r#"{"complete":{"cbid":"cb1","err":"boom"}}"#
        );

        let void = Request::Complete {
            cbid: "cb1".into(),
            result: None,
            err: None,
        };
        assert_eq!(
            serde_json::to_string(&void).unwrap(),
            r#"{"complete":{"cbid":"cb1"}}"#
        );
    }

    #[test]
    fn test_empty_payload_requests_keep_object_shape() {
        assert_eq!(
            serde_json::to_string(&Request::Stats {}).unwrap(),
            r#"{"stats":{}}"#
        );
        assert_eq!(
            serde_json::to_string(&Request::Callbacks {}).unwrap(),
            r#"{"callbacks":{}}"#
        );
    }

    #[test]
    fn test_request_roundtrip_through_serde() {
        let request = Request::Create(CreateRequest {
            fqn: "acme.Calculator".into(),
            args: vec![json!({"precision": 2})],
            overrides: vec![Override::method("onChange").with_cookie("c1")],
            interfaces: vec![],
        });
        let line = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_parse_hello() {
        let resp = Response::parse(json!({"hello": "1.2.3+abc"})).unwrap();
        assert_eq!(
            resp,
            Response::Hello {
                version: "1.2.3+abc".into()
            }
        );
    }

    #[test]
    fn test_parse_ok_null_is_void() {
        let resp = Response::parse(json!({"ok": null})).unwrap();
        assert_eq!(resp, Response::Ok(JsonValue::Null));
    }

    #[test]
    fn test_parse_error_with_stack() {
        let resp =
            Response::parse(json!({"error": "divide by zero", "stack": "at Calc.div"})).unwrap();
        assert_eq!(
            resp,
            Response::Error {
                message: "divide by zero".into(),
                stack: Some("at Calc.div".into()),
            }
        );
    }

    #[test]
    fn test_parse_callback_accepts_bare_objref() {
        let resp = Response::parse(json!({
            "callback": {
                "cbid": "cb1",
                "invoke": {"objref": "H@1", "method": "g", "args": []}
            }
        }))
        .unwrap();
        let Response::Callback(callback) = resp else {
            panic!("expected callback");
        };
        assert_eq!(callback.cbid, "cb1");
        let invoke = callback.invoke.unwrap();
        assert_eq!(invoke.objref.handle, "H@1");
        assert_eq!(invoke.method, "g");
    }

    #[test]
    fn test_parse_callback_accepts_tagged_objref() {
        let resp = Response::parse(json!({
            "callback": {
                "cbid": "cb2",
                "get": {
                    "objref": {"$jsii.byref": "jsii@1", "$jsii.interfaces": ["acme.IThing"]},
                    "property": "name"
                }
            }
        }))
        .unwrap();
        let Response::Callback(callback) = resp else {
            panic!("expected callback");
        };
        let get = callback.get.unwrap();
        assert_eq!(get.objref.handle, "jsii@1");
        assert_eq!(get.objref.interfaces, Some(vec!["acme.IThing".into()]));
    }

    #[test]
    fn test_parse_rejects_unknown_shape() {
        let err = Response::parse(json!({"pong": true})).unwrap_err();
        assert!(err.to_string().contains("protocol violation"));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(Response::parse(json!([1, 2, 3])).is_err());
    }

    #[tokio::test]
    async fn test_codec_roundtrip() {
        let mut buf = Vec::new();
        let request = Request::Get {
            objref: WireObjRef::bare("Obj@1"),
            property: "value".into(),
        };
        write_request(&mut buf, &request).await.unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let mut data: &[u8] = b"{\"ok\":{\"value\":42}}\n";
        let resp = read_response(&mut data).await.unwrap().unwrap();
        assert_eq!(resp, Response::Ok(json!({"value": 42})));
    }

    #[tokio::test]
    async fn test_read_eof_returns_none() {
        let mut data: &[u8] = b"";
        assert_eq!(read_response(&mut data).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_line() {
        let mut line = Vec::new();
        line.extend_from_slice(b"{\"ok\":\"");
        line.resize(WireConfig::MAX_RESPONSE_LINE_BYTES + 8, b'a');
        line.extend_from_slice(b"\"}\n");
        let mut data: &[u8] = &line;
        let err = read_response(&mut data).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_read_rejects_garbage() {
        let mut data: &[u8] = b"not json at all\n";
        assert!(read_response(&mut data).await.is_err());
    }
}
