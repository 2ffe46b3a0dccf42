//! Value marshaling across the type-system boundary.
//!
//! Translation is driven by a [`TypeDesc`]: the static descriptor guides
//! both directions, and for `any` the wire shape alone discriminates via the
//! `$jsii.*` tags. Tagged forms are part of the wire contract and must be
//! produced bit-exactly.

use crate::error::{JsiiError, Result};
use crate::registry::ObjectRegistry;
use crate::types::{TypeCache, TypeDesc};
use crate::value::{StructValue, Value};
use crate::wire::WireObjRef;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tag for a by-reference object.
pub const TAG_BYREF: &str = "$jsii.byref";
/// Tag listing the interfaces of a by-reference object.
pub const TAG_INTERFACES: &str = "$jsii.interfaces";
/// Tag for a by-value struct.
pub const TAG_STRUCT: &str = "$jsii.struct";
/// Tag for an enum member.
pub const TAG_ENUM: &str = "$jsii.enum";
/// Tag for a date.
pub const TAG_DATE: &str = "$jsii.date";

/// Translates between host values and wire values.
#[derive(Clone)]
pub struct Marshaler {
    registry: Arc<ObjectRegistry>,
    types: Arc<TypeCache>,
}

impl Marshaler {
    pub fn new(registry: Arc<ObjectRegistry>, types: Arc<TypeCache>) -> Self {
        Self { registry, types }
    }

    /// Translates a host value to its wire form under a descriptor.
    pub fn to_wire(&self, value: &Value, desc: &TypeDesc) -> Result<JsonValue> {
        if let TypeDesc::Optional(inner) = desc {
            return if value.is_null() {
                Ok(JsonValue::Null)
            } else {
                self.to_wire(value, inner)
            };
        }
        // null is equivalent to absent and legal under every descriptor.
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        if let TypeDesc::Union(candidates) = desc {
            for candidate in candidates {
                if accepts_value(value, candidate) {
                    return self.to_wire(value, candidate);
                }
            }
            return Err(JsiiError::marshal(format!(
                "no union case accepts {} value",
                kind_name(value)
            )));
        }

        match value {
            Value::Bool(b) => match desc {
                TypeDesc::Bool | TypeDesc::Any => Ok(JsonValue::Bool(*b)),
                _ => Err(mismatch(value, desc)),
            },
            Value::Number(n) => match desc {
                TypeDesc::Number | TypeDesc::Any => number_to_wire(*n),
                _ => Err(mismatch(value, desc)),
            },
            Value::String(s) => match desc {
                TypeDesc::String | TypeDesc::Any => Ok(JsonValue::String(s.clone())),
                _ => Err(mismatch(value, desc)),
            },
            Value::Date(date) => match desc {
                TypeDesc::Date | TypeDesc::Any => Ok(date_to_wire(date)),
                _ => Err(mismatch(value, desc)),
            },
            Value::EnumValue { fqn, member } => match desc {
                TypeDesc::Enum(expected) if expected != fqn => Err(JsiiError::marshal(format!(
                    "enum value {}/{} does not belong to {}",
                    fqn, member, expected
                ))),
                TypeDesc::Enum(_) | TypeDesc::Any => {
                    let mut tagged = JsonMap::new();
                    tagged.insert(TAG_ENUM.into(), format!("{}/{}", fqn, member).into());
                    Ok(JsonValue::Object(tagged))
                }
                _ => Err(mismatch(value, desc)),
            },
            Value::Ref(objref) => match desc {
                TypeDesc::Class(_) | TypeDesc::Any => {
                    // Interfaces are announced only for host-originated
                    // handles; the kernel already knows its own objects.
                    let interfaces: &[String] = if objref.is_host() {
                        objref.interfaces()
                    } else {
                        &[]
                    };
                    Ok(byref_to_wire(objref.handle(), interfaces))
                }
                _ => Err(mismatch(value, desc)),
            },
            Value::Host(object) => {
                // Host-originated object crossing the boundary for the first
                // time: register it and send the synthetic handle.
                let interfaces: Vec<String> = match desc {
                    TypeDesc::Class(fqn) => vec![fqn.clone()],
                    TypeDesc::Any => Vec::new(),
                    _ => return Err(mismatch(value, desc)),
                };
                let objref = self.registry.track(object.clone(), &interfaces);
                Ok(byref_to_wire(objref.handle(), objref.interfaces()))
            }
            Value::Struct(sv) => match desc {
                TypeDesc::Struct(expected) if expected != &sv.fqn => {
                    Err(JsiiError::marshal(format!(
                        "struct {} passed where {} was expected",
                        sv.fqn, expected
                    )))
                }
                TypeDesc::Struct(_) | TypeDesc::Any => self.struct_to_wire(sv),
                _ => Err(mismatch(value, desc)),
            },
            Value::List(items) => {
                let element = match desc {
                    TypeDesc::List(element) => element.as_ref().clone(),
                    TypeDesc::Any => TypeDesc::Any,
                    _ => return Err(mismatch(value, desc)),
                };
                let wire: Result<Vec<JsonValue>> =
                    items.iter().map(|item| self.to_wire(item, &element)).collect();
                Ok(JsonValue::Array(wire?))
            }
            Value::Map(entries) => {
                let element = match desc {
                    TypeDesc::Map(element) => element.as_ref().clone(),
                    TypeDesc::Any => TypeDesc::Any,
                    _ => return Err(mismatch(value, desc)),
                };
                let mut wire = JsonMap::new();
                for (key, entry) in entries {
                    wire.insert(key.clone(), self.to_wire(entry, &element)?);
                }
                Ok(JsonValue::Object(wire))
            }
            Value::Null => unreachable!("null handled above"),
        }
    }

    /// Translates a wire value to its host form under a descriptor.
    pub fn from_wire(&self, wire: &JsonValue, desc: &TypeDesc) -> Result<Value> {
        if let TypeDesc::Optional(inner) = desc {
            return if wire.is_null() {
                Ok(Value::Null)
            } else {
                self.from_wire(wire, inner)
            };
        }
        if wire.is_null() {
            return Ok(Value::Null);
        }

        match desc {
            TypeDesc::Any => self.any_from_wire(wire),
            TypeDesc::Bool => wire
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| wire_mismatch(wire, desc)),
            TypeDesc::Number => wire
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| wire_mismatch(wire, desc)),
            TypeDesc::String => wire
                .as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| wire_mismatch(wire, desc)),
            TypeDesc::Date => {
                let tagged = tag_payload(wire, TAG_DATE).ok_or_else(|| wire_mismatch(wire, desc))?;
                let text = tagged.as_str().ok_or_else(|| wire_mismatch(wire, desc))?;
                Ok(Value::Date(date_from_wire(text)?))
            }
            TypeDesc::Enum(expected) => {
                let (fqn, member) = self.enum_from_wire(wire)?;
                if &fqn != expected {
                    return Err(JsiiError::marshal(format!(
                        "enum value {}/{} does not belong to {}",
                        fqn, member, expected
                    )));
                }
                Ok(Value::EnumValue { fqn, member })
            }
            TypeDesc::Class(fqn) => {
                if tag_payload(wire, TAG_BYREF).is_none() {
                    return Err(wire_mismatch(wire, desc));
                }
                self.byref_from_wire(wire, Some(fqn.as_str()))
            }
            TypeDesc::Struct(fqn) => self.struct_from_wire(wire, fqn),
            TypeDesc::List(element) => {
                let items = wire.as_array().ok_or_else(|| wire_mismatch(wire, desc))?;
                let values: Result<Vec<Value>> = items
                    .iter()
                    .map(|item| self.from_wire(item, element))
                    .collect();
                Ok(Value::List(values?))
            }
            TypeDesc::Map(element) => {
                let entries = wire.as_object().ok_or_else(|| wire_mismatch(wire, desc))?;
                let mut values = BTreeMap::new();
                for (key, entry) in entries {
                    values.insert(key.clone(), self.from_wire(entry, element)?);
                }
                Ok(Value::Map(values))
            }
            TypeDesc::Union(candidates) => {
                for candidate in candidates {
                    if accepts_wire(wire, candidate) {
                        return self.from_wire(wire, candidate);
                    }
                }
                Err(JsiiError::marshal(format!(
                    "no union case accepts wire value {}",
                    wire
                )))
            }
            TypeDesc::Optional(_) => unreachable!("optional handled above"),
        }
    }

    /// Discriminates a wire value by shape alone.
    fn any_from_wire(&self, wire: &JsonValue) -> Result<Value> {
        match wire {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| JsiiError::marshal(format!("unrepresentable number {}", n))),
            JsonValue::String(s) => Ok(Value::String(s.clone())),
            JsonValue::Array(items) => {
                let values: Result<Vec<Value>> = items
                    .iter()
                    .map(|item| self.from_wire(item, &TypeDesc::Any))
                    .collect();
                Ok(Value::List(values?))
            }
            JsonValue::Object(fields) => {
                if fields.contains_key(TAG_BYREF) {
                    return self.byref_from_wire(wire, None);
                }
                if fields.contains_key(TAG_ENUM) {
                    let (fqn, member) = self.enum_from_wire(wire)?;
                    return Ok(Value::EnumValue { fqn, member });
                }
                if let Some(tagged) = fields.get(TAG_DATE) {
                    let text = tagged
                        .as_str()
                        .ok_or_else(|| JsiiError::marshal("date tag is not a string"))?;
                    return Ok(Value::Date(date_from_wire(text)?));
                }
                if fields.contains_key(TAG_STRUCT) {
                    return self.wrapped_struct_from_wire(wire);
                }
                if let Some(tag) = fields.keys().find(|k| k.starts_with("$jsii.")) {
                    return Err(JsiiError::marshal(format!("unknown tagged shape '{}'", tag)));
                }
                let mut values = BTreeMap::new();
                for (key, entry) in fields {
                    values.insert(key.clone(), self.from_wire(entry, &TypeDesc::Any)?);
                }
                Ok(Value::Map(values))
            }
        }
    }

    fn byref_from_wire(&self, wire: &JsonValue, static_fqn: Option<&str>) -> Result<Value> {
        let objref: WireObjRef = serde_json::from_value(wire.clone())
            .map_err(|e| JsiiError::marshal(format!("malformed object reference: {}", e)))?;

        // A synthetic handle coming back from the kernel refers to an object
        // the host registered earlier; return the original, not a proxy.
        if let Some(object) = self.registry.host_object(&objref.handle) {
            return Ok(Value::Host(object));
        }

        let interfaces = match (&objref.interfaces, static_fqn) {
            (Some(interfaces), _) => interfaces.clone(),
            (None, Some(fqn)) => vec![fqn.to_string()],
            (None, None) => Vec::new(),
        };
        Ok(Value::Ref(self.registry.resolve(&objref.handle, &interfaces)))
    }

    fn enum_from_wire(&self, wire: &JsonValue) -> Result<(String, String)> {
        let tagged = tag_payload(wire, TAG_ENUM)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| JsiiError::marshal(format!("expected an enum tag, got {}", wire)))?;
        let (fqn, member) = tagged
            .split_once('/')
            .ok_or_else(|| JsiiError::marshal(format!("malformed enum value '{}'", tagged)))?;
        Ok((fqn.to_string(), member.to_string()))
    }

    fn struct_to_wire(&self, sv: &StructValue) -> Result<JsonValue> {
        let descriptor = self.types.struct_descriptor(&sv.fqn);
        let mut data = JsonMap::new();
        for (name, field) in &sv.fields {
            // Optional fields are omitted rather than sent as null.
            if field.is_null() {
                continue;
            }
            let kind = descriptor
                .as_ref()
                .and_then(|d| d.fields.get(name).cloned())
                .unwrap_or(TypeDesc::Any);
            data.insert(name.clone(), self.to_wire(field, &kind)?);
        }

        let mut wrapper = JsonMap::new();
        wrapper.insert("fqn".into(), sv.fqn.clone().into());
        wrapper.insert("data".into(), JsonValue::Object(data));
        let mut tagged = JsonMap::new();
        tagged.insert(TAG_STRUCT.into(), JsonValue::Object(wrapper));
        Ok(JsonValue::Object(tagged))
    }

    fn struct_from_wire(&self, wire: &JsonValue, fqn: &str) -> Result<Value> {
        if tag_payload(wire, TAG_STRUCT).is_some() {
            return self.wrapped_struct_from_wire(wire);
        }
        // Older flows inline the fields; the descriptor is the out-of-band
        // type information.
        let fields = wire
            .as_object()
            .filter(|fields| !fields.keys().any(|k| k.starts_with("$jsii.")))
            .ok_or_else(|| wire_mismatch(wire, &TypeDesc::Struct(fqn.to_string())))?;
        self.struct_fields_from_wire(fqn, fields)
    }

    fn wrapped_struct_from_wire(&self, wire: &JsonValue) -> Result<Value> {
        let wrapper = tag_payload(wire, TAG_STRUCT)
            .and_then(JsonValue::as_object)
            .ok_or_else(|| JsiiError::marshal("malformed struct wrapper"))?;
        let fqn = wrapper
            .get("fqn")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| JsiiError::marshal("struct wrapper is missing its fqn"))?;
        let data = wrapper
            .get("data")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| JsiiError::marshal("struct wrapper is missing its data"))?;
        self.struct_fields_from_wire(fqn, data)
    }

    fn struct_fields_from_wire(&self, fqn: &str, data: &JsonMap<String, JsonValue>) -> Result<Value> {
        let descriptor = self.types.struct_descriptor(fqn);
        let mut fields = BTreeMap::new();
        for (name, entry) in data {
            let kind = descriptor
                .as_ref()
                .and_then(|d| d.fields.get(name).cloned())
                .unwrap_or(TypeDesc::Any);
            fields.insert(name.clone(), self.from_wire(entry, &kind)?);
        }
        Ok(Value::Struct(StructValue {
            fqn: fqn.to_string(),
            fields,
        }))
    }
}

fn byref_to_wire(handle: &str, interfaces: &[String]) -> JsonValue {
    let mut tagged = JsonMap::new();
    tagged.insert(TAG_BYREF.into(), handle.into());
    if !interfaces.is_empty() {
        tagged.insert(
            TAG_INTERFACES.into(),
            JsonValue::Array(interfaces.iter().map(|i| i.clone().into()).collect()),
        );
    }
    JsonValue::Object(tagged)
}

fn date_to_wire(date: &DateTime<Utc>) -> JsonValue {
    let mut tagged = JsonMap::new();
    tagged.insert(
        TAG_DATE.into(),
        date.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
    );
    JsonValue::Object(tagged)
}

fn date_from_wire(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| JsiiError::marshal(format!("invalid ISO-8601 date '{}': {}", text, e)))
}

fn number_to_wire(n: f64) -> Result<JsonValue> {
    if !n.is_finite() {
        return Err(JsiiError::marshal(format!(
            "cannot marshal non-finite number {}",
            n
        )));
    }
    // Whole numbers travel as JSON integers.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(JsonValue::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .ok_or_else(|| JsiiError::marshal(format!("unrepresentable number {}", n)))
}

fn tag_payload<'a>(wire: &'a JsonValue, tag: &str) -> Option<&'a JsonValue> {
    wire.as_object()?.get(tag)
}

fn untagged_object(wire: &JsonValue) -> bool {
    wire.as_object()
        .map(|fields| !fields.keys().any(|k| k.starts_with("$jsii.")))
        .unwrap_or(false)
}

/// Structural acceptance of a wire value, used for union resolution.
fn accepts_wire(wire: &JsonValue, desc: &TypeDesc) -> bool {
    match desc {
        TypeDesc::Any => true,
        TypeDesc::Optional(inner) => wire.is_null() || accepts_wire(wire, inner),
        TypeDesc::Bool => wire.is_boolean(),
        TypeDesc::Number => wire.is_number(),
        TypeDesc::String => wire.is_string(),
        TypeDesc::Date => tag_payload(wire, TAG_DATE).is_some(),
        TypeDesc::Enum(fqn) => tag_payload(wire, TAG_ENUM)
            .and_then(JsonValue::as_str)
            .map(|tagged| tagged.starts_with(&format!("{}/", fqn)))
            .unwrap_or(false),
        TypeDesc::Class(_) => tag_payload(wire, TAG_BYREF).is_some(),
        TypeDesc::Struct(fqn) => {
            let wrapped = tag_payload(wire, TAG_STRUCT)
                .and_then(|w| w.get("fqn"))
                .and_then(JsonValue::as_str)
                .map(|wrapped_fqn| wrapped_fqn == fqn)
                .unwrap_or(false);
            wrapped || untagged_object(wire)
        }
        TypeDesc::List(element) => wire
            .as_array()
            .map(|items| items.iter().all(|item| accepts_wire(item, element)))
            .unwrap_or(false),
        TypeDesc::Map(element) => {
            untagged_object(wire)
                && wire
                    .as_object()
                    .map(|entries| entries.values().all(|entry| accepts_wire(entry, element)))
                    .unwrap_or(false)
        }
        TypeDesc::Union(candidates) => candidates.iter().any(|c| accepts_wire(wire, c)),
    }
}

/// Structural acceptance of a host value, used for union resolution.
fn accepts_value(value: &Value, desc: &TypeDesc) -> bool {
    match desc {
        TypeDesc::Any => true,
        TypeDesc::Optional(inner) => value.is_null() || accepts_value(value, inner),
        TypeDesc::Bool => matches!(value, Value::Bool(_)),
        TypeDesc::Number => matches!(value, Value::Number(_)),
        TypeDesc::String => matches!(value, Value::String(_)),
        TypeDesc::Date => matches!(value, Value::Date(_)),
        TypeDesc::Enum(fqn) => matches!(value, Value::EnumValue { fqn: f, .. } if f == fqn),
        TypeDesc::Class(_) => matches!(value, Value::Ref(_) | Value::Host(_)),
        TypeDesc::Struct(fqn) => matches!(value, Value::Struct(sv) if &sv.fqn == fqn),
        TypeDesc::List(element) => match value {
            Value::List(items) => items.iter().all(|item| accepts_value(item, element)),
            _ => false,
        },
        TypeDesc::Map(element) => match value {
            Value::Map(entries) => entries.values().all(|entry| accepts_value(entry, element)),
            _ => false,
        },
        TypeDesc::Union(candidates) => candidates.iter().any(|c| accepts_value(value, c)),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Date(_) => "date",
        Value::EnumValue { .. } => "enum",
        Value::Ref(_) => "object reference",
        Value::Host(_) => "host object",
        Value::Struct(_) => "struct",
        Value::List(_) => "list",
        Value::Map(_) => "map",
    }
}

fn mismatch(value: &Value, desc: &TypeDesc) -> JsiiError {
    JsiiError::marshal(format!(
        "cannot marshal {} value as {:?}",
        kind_name(value),
        desc
    ))
}

fn wire_mismatch(wire: &JsonValue, desc: &TypeDesc) -> JsiiError {
    JsiiError::marshal(format!("wire value {} does not match {:?}", wire, desc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostObject;
    use crate::types::StructDescriptor;
    use chrono::TimeZone;
    use serde_json::json;

    fn marshaler() -> Marshaler {
        let registry = Arc::new(ObjectRegistry::new());
        let types = Arc::new(TypeCache::new());
        Marshaler::new(registry, types)
    }

    fn roundtrip(m: &Marshaler, value: Value, desc: &TypeDesc) {
        let wire = m.to_wire(&value, desc).unwrap();
        let back = m.from_wire(&wire, desc).unwrap();
        assert_eq!(back, value);
        let wire_again = m.to_wire(&back, desc).unwrap();
        assert_eq!(wire_again, wire);
    }

    #[test]
    fn test_primitive_roundtrips() {
        let m = marshaler();
        roundtrip(&m, Value::Bool(true), &TypeDesc::Bool);
        roundtrip(&m, Value::Number(2.5), &TypeDesc::Number);
        roundtrip(&m, Value::String("hi".into()), &TypeDesc::String);
        roundtrip(&m, Value::Null, &TypeDesc::optional(TypeDesc::Number));
    }

    #[test]
    fn test_whole_numbers_travel_as_integers() {
        let m = marshaler();
        assert_eq!(m.to_wire(&Value::Number(3.0), &TypeDesc::Number).unwrap(), json!(3));
        assert_eq!(
            m.to_wire(&Value::Number(2.5), &TypeDesc::Number).unwrap(),
            json!(2.5)
        );
    }

    #[test]
    fn test_non_finite_numbers_are_rejected() {
        let m = marshaler();
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = m.to_wire(&Value::Number(n), &TypeDesc::Number).unwrap_err();
            assert!(matches!(err, JsiiError::Marshal { .. }));
        }
    }

    #[test]
    fn test_date_tag_is_bit_exact() {
        let m = marshaler();
        let date = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        let wire = m.to_wire(&Value::Date(date), &TypeDesc::Date).unwrap();
        assert_eq!(wire, json!({"$jsii.date": "2024-05-17T09:30:00.000Z"}));
        roundtrip(&m, Value::Date(date), &TypeDesc::Date);
    }

    #[test]
    fn test_enum_tag_and_fqn_check() {
        let m = marshaler();
        let value = Value::EnumValue {
            fqn: "acme.Color".into(),
            member: "RED".into(),
        };
        let desc = TypeDesc::Enum("acme.Color".into());
        let wire = m.to_wire(&value, &desc).unwrap();
        assert_eq!(wire, json!({"$jsii.enum": "acme.Color/RED"}));
        roundtrip(&m, value.clone(), &desc);

        let err = m
            .to_wire(&value, &TypeDesc::Enum("acme.Shade".into()))
            .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn test_byref_resolves_through_registry_with_identity() {
        let m = marshaler();
        let desc = TypeDesc::Class("acme.Calculator".into());
        let wire = json!({"$jsii.byref": "Calculator@10001"});
        let a = m.from_wire(&wire, &desc).unwrap();
        let b = m.from_wire(&wire, &desc).unwrap();
        assert_eq!(a, b);

        let Value::Ref(objref) = &a else {
            panic!("expected an object reference")
        };
        assert_eq!(objref.interfaces(), ["acme.Calculator".to_string()]);
        assert_eq!(m.to_wire(&a, &desc).unwrap(), wire);
    }

    #[test]
    fn test_byref_keeps_announced_interfaces() {
        let m = marshaler();
        let wire = json!({
            "$jsii.byref": "Obj@1",
            "$jsii.interfaces": ["acme.IOne", "acme.ITwo"]
        });
        let value = m.from_wire(&wire, &TypeDesc::Any).unwrap();
        let Value::Ref(objref) = &value else {
            panic!("expected an object reference")
        };
        assert_eq!(objref.interfaces().len(), 2);

        // Kernel-owned handles go back as the bare reference.
        assert_eq!(
            m.to_wire(&value, &TypeDesc::Any).unwrap(),
            json!({"$jsii.byref": "Obj@1"})
        );
    }

    struct Probe;

    #[async_trait::async_trait]
    impl HostObject for Probe {}

    #[test]
    fn test_host_object_is_tracked_on_marshal() {
        let m = marshaler();
        let object: Arc<dyn HostObject> = Arc::new(Probe);
        let desc = TypeDesc::Class("acme.IProbe".into());

        let wire = m.to_wire(&Value::Host(object.clone()), &desc).unwrap();
        assert_eq!(
            wire,
            json!({"$jsii.byref": "jsii@10001", "$jsii.interfaces": ["acme.IProbe"]})
        );

        // Marshaling again reuses the handle.
        let wire_again = m.to_wire(&Value::Host(object.clone()), &desc).unwrap();
        assert_eq!(wire_again, wire);

        // Coming back from the kernel, the original object is returned.
        let back = m.from_wire(&wire, &TypeDesc::Any).unwrap();
        let Value::Host(found) = back else {
            panic!("expected the tracked host object")
        };
        assert!(Arc::ptr_eq(&found, &object));
    }

    #[test]
    fn test_struct_wrapper_roundtrip() {
        let registry = Arc::new(ObjectRegistry::new());
        let types = Arc::new(TypeCache::new());
        types.register_struct(
            StructDescriptor::new("acme.CalcProps")
                .with_field("precision", TypeDesc::Number)
                .with_field("label", TypeDesc::String),
        );
        let m = Marshaler::new(registry, types);

        let props = Value::Struct(
            StructValue::new("acme.CalcProps")
                .with_field("precision", 2)
                .with_field("label", "main"),
        );
        let desc = TypeDesc::Struct("acme.CalcProps".into());
        let wire = m.to_wire(&props, &desc).unwrap();
        assert_eq!(
            wire,
            json!({"$jsii.struct": {"fqn": "acme.CalcProps", "data": {"label": "main", "precision": 2}}})
        );
        roundtrip(&m, props, &desc);
    }

    #[test]
    fn test_struct_accepts_inlined_object() {
        let m = marshaler();
        let desc = TypeDesc::Struct("acme.CalcProps".into());
        let value = m
            .from_wire(&json!({"precision": 2}), &desc)
            .unwrap();
        let Value::Struct(sv) = value else {
            panic!("expected a struct")
        };
        assert_eq!(sv.fqn, "acme.CalcProps");
        assert_eq!(sv.fields["precision"], Value::Number(2.0));
    }

    #[test]
    fn test_struct_null_fields_are_omitted() {
        let m = marshaler();
        let props = Value::Struct(
            StructValue::new("acme.CalcProps").with_field("label", Value::Null),
        );
        let wire = m
            .to_wire(&props, &TypeDesc::Struct("acme.CalcProps".into()))
            .unwrap();
        assert_eq!(
            wire,
            json!({"$jsii.struct": {"fqn": "acme.CalcProps", "data": {}}})
        );
    }

    #[test]
    fn test_collections_roundtrip() {
        let m = marshaler();
        let list = Value::List(vec![Value::Number(1.0), Value::Number(2.0)]);
        roundtrip(&m, list, &TypeDesc::list_of(TypeDesc::Number));

        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), Value::String("x".into()));
        entries.insert("b".to_string(), Value::String("y".into()));
        roundtrip(&m, Value::Map(entries), &TypeDesc::map_of(TypeDesc::String));
    }

    #[test]
    fn test_union_resolution_is_ordered() {
        let m = marshaler();
        let desc = TypeDesc::Union(vec![TypeDesc::Number, TypeDesc::String]);
        assert_eq!(
            m.from_wire(&json!(7), &desc).unwrap(),
            Value::Number(7.0)
        );
        assert_eq!(
            m.from_wire(&json!("seven"), &desc).unwrap(),
            Value::String("seven".into())
        );
        assert!(m.from_wire(&json!(true), &desc).is_err());

        // Struct beats map when both could accept the object, because it is
        // declared first.
        let ordered = TypeDesc::Union(vec![
            TypeDesc::Struct("acme.Props".into()),
            TypeDesc::map_of(TypeDesc::Any),
        ]);
        let value = m.from_wire(&json!({"x": 1}), &ordered).unwrap();
        assert!(matches!(value, Value::Struct(_)));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let m = marshaler();
        let err = m
            .from_wire(&json!({"$jsii.mystery": 1}), &TypeDesc::Any)
            .unwrap_err();
        assert!(err.to_string().contains("unknown tagged shape"));
    }

    #[test]
    fn test_any_discrimination_by_shape() {
        let m = marshaler();
        assert_eq!(
            m.from_wire(&json!([1, "two"]), &TypeDesc::Any).unwrap(),
            Value::List(vec![Value::Number(1.0), Value::String("two".into())])
        );
        let value = m
            .from_wire(&json!({"$jsii.enum": "acme.Color/RED"}), &TypeDesc::Any)
            .unwrap();
        assert_eq!(
            value,
            Value::EnumValue {
                fqn: "acme.Color".into(),
                member: "RED".into()
            }
        );
    }

    #[test]
    fn test_descriptor_mismatch_is_rejected() {
        let m = marshaler();
        assert!(m.to_wire(&Value::Bool(true), &TypeDesc::Number).is_err());
        assert!(m.from_wire(&json!("text"), &TypeDesc::Number).is_err());
        assert!(m
            .from_wire(&json!({"$jsii.byref": "Obj@1"}), &TypeDesc::Number)
            .is_err());
    }
}
