//! SOAP envelope encoding and response decoding.
//!
//! Requests are assembled from [`SoapValue`] trees with `format!`-style
//! writing and explicit escaping. Responses are parsed with `quick-xml` into a
//! small element tree and then converted to `serde_json::Value`:
//!
//! - a managed-object reference becomes `{"type": .., "value": ..}`
//! - `xsd:boolean` / `xsd:int` / `xsd:long` values become JSON bools / numbers
//! - `ArrayOf*` typed elements become arrays
//! - repeated child elements become arrays, in document order
//! - objects carrying `xsi:type` get a `_type` key

use crate::error::{from_fault, from_xml};
use crate::types::MoRef;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::str;
use vsops_core::{VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Request values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A value placed in a SOAP request body.
#[derive(Debug, Clone, PartialEq)]
pub enum SoapValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Ref(MoRef),
    /// Reference in an `anyType` slot, such as `ArrayUpdateSpec.removeKey`.
    AnyRef(MoRef),
    /// Primitive with an explicit `xsi:type`, for `anyType` slots.
    Typed { xsi_type: String, text: String },
    Obj(SoapObject),
    /// Encoded as the element repeated once per item.
    List(Vec<SoapValue>),
}

/// A complex value with ordered fields. vim25 is schema-ordered, so field
/// order here is wire order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SoapObject {
    pub xsi_type: Option<String>,
    pub fields: Vec<(String, SoapValue)>,
}

impl SoapObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn typed(xsi_type: impl Into<String>) -> Self {
        Self {
            xsi_type: Some(xsi_type.into()),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<SoapValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Add the field only when `value` is `Some`.
    pub fn opt(self, name: impl Into<String>, value: Option<impl Into<SoapValue>>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }
}

impl From<SoapObject> for SoapValue {
    fn from(o: SoapObject) -> Self {
        Self::Obj(o)
    }
}

impl From<&str> for SoapValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for SoapValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for SoapValue {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<i64> for SoapValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for SoapValue {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<bool> for SoapValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<MoRef> for SoapValue {
    fn from(r: MoRef) -> Self {
        Self::Ref(r)
    }
}

impl From<&MoRef> for SoapValue {
    fn from(r: &MoRef) -> Self {
        Self::Ref(r.clone())
    }
}

impl<T: Into<SoapValue>> From<Vec<T>> for SoapValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Append `<name>value</name>` to `out`.
pub fn write_element(out: &mut String, name: &str, value: &SoapValue) {
    match value {
        SoapValue::Str(s) => out.push_str(&format!("<{name}>{}</{name}>", xml_escape(s))),
        SoapValue::Int(n) => out.push_str(&format!("<{name}>{n}</{name}>")),
        SoapValue::Bool(b) => out.push_str(&format!("<{name}>{b}</{name}>")),
        SoapValue::Ref(r) => out.push_str(&format!(
            "<{name} type=\"{}\">{}</{name}>",
            xml_escape(&r.kind),
            xml_escape(&r.value)
        )),
        SoapValue::AnyRef(r) => out.push_str(&format!(
            "<{name} xsi:type=\"ManagedObjectReference\" type=\"{}\">{}</{name}>",
            xml_escape(&r.kind),
            xml_escape(&r.value)
        )),
        SoapValue::Typed { xsi_type, text } => out.push_str(&format!(
            "<{name} xsi:type=\"{}\">{}</{name}>",
            xml_escape(xsi_type),
            xml_escape(text)
        )),
        SoapValue::Obj(obj) => {
            match &obj.xsi_type {
                Some(t) => out.push_str(&format!("<{name} xsi:type=\"{}\">", xml_escape(t))),
                None => out.push_str(&format!("<{name}>")),
            }
            for (field, v) in &obj.fields {
                write_element(out, field, v);
            }
            out.push_str(&format!("</{name}>"));
        }
        SoapValue::List(items) => {
            for item in items {
                write_element(out, name, item);
            }
        }
    }
}

/// Full request envelope for `method` on `this`.
pub fn request_envelope(
    namespace: &str,
    method: &str,
    this: &MoRef,
    args: &[(&str, SoapValue)],
) -> String {
    let mut body = String::with_capacity(512);
    body.push_str(&format!("<{method} xmlns=\"{namespace}\">"));
    write_element(&mut body, "_this", &SoapValue::Ref(this.clone()));
    for (name, value) in args {
        write_element(&mut body, name, value);
    }
    body.push_str(&format!("</{method}>"));

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"#
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct Node {
    name: String,
    /// Unprefixed `type` attribute (managed-object references).
    ref_type: Option<String>,
    /// `xsi:type`, prefix stripped.
    xsi_type: Option<String>,
    text: String,
    children: Vec<Node>,
}

fn local(name: &[u8]) -> VsResult<String> {
    let s = str::from_utf8(name).map_err(from_xml)?;
    Ok(s.rsplit(':').next().unwrap_or(s).to_string())
}

fn open_node(e: &BytesStart) -> VsResult<Node> {
    let mut node = Node {
        name: local(e.local_name().as_ref())?,
        ..Node::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(from_xml)?;
        let key = str::from_utf8(attr.key.as_ref()).map_err(from_xml)?;
        let val = attr.unescape_value().map_err(from_xml)?;
        if key == "type" {
            node.ref_type = Some(val.to_string());
        } else if key.ends_with(":type") {
            node.xsi_type = Some(val.rsplit(':').next().unwrap_or(&val).to_string());
        }
    }
    Ok(node)
}

fn parse_tree(xml: &str) -> VsResult<Node> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Node> = vec![Node::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(open_node(e)?),
            Ok(Event::Empty(ref e)) => {
                let node = open_node(e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(from_xml)?;
                if let Some(cur) = stack.last_mut() {
                    cur.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(cur) = stack.last_mut() {
                    cur.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| VsError::protocol("unbalanced XML"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(VsError::protocol("unbalanced XML")),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(VsError::protocol(format!(
                    "XML error at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }
    if stack.len() != 1 {
        return Err(VsError::protocol("truncated XML document"));
    }
    stack
        .pop()
        .ok_or_else(|| VsError::protocol("empty XML document"))
}

fn to_value(node: &Node) -> Value {
    if let Some(kind) = &node.ref_type {
        if node.children.is_empty() {
            return MoRef::new(kind.clone(), node.text.clone()).to_value();
        }
    }
    let xsi = node.xsi_type.as_deref();
    if xsi.map(|t| t.starts_with("ArrayOf")).unwrap_or(false) {
        return Value::Array(node.children.iter().map(to_value).collect());
    }
    if node.children.is_empty() {
        return match xsi {
            Some("boolean") => Value::Bool(node.text == "true" || node.text == "1"),
            Some("int" | "long" | "short" | "byte") => node
                .text
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .unwrap_or_else(|_| Value::String(node.text.clone())),
            Some("float" | "double") => node
                .text
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(node.text.clone())),
            _ => Value::String(node.text.clone()),
        };
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for child in &node.children {
        *counts.entry(child.name.as_str()).or_default() += 1;
    }
    let mut map = Map::new();
    if let Some(t) = xsi {
        map.insert("_type".into(), Value::String(t.to_string()));
    }
    for child in &node.children {
        let value = to_value(child);
        if counts.get(child.name.as_str()).copied().unwrap_or(0) > 1 {
            let slot = map
                .entry(child.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = slot {
                items.push(value);
            }
        } else {
            map.insert(child.name.clone(), value);
        }
    }
    Value::Object(map)
}

fn find<'a>(node: &'a Node, name: &str) -> Option<&'a Node> {
    node.children.iter().find(|c| c.name == name)
}

/// A decoded SOAP fault.
#[derive(Debug, Clone, PartialEq)]
pub struct SoapFault {
    /// vim fault type, e.g. `InvalidLogin`
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl SoapFault {
    pub fn into_error(self) -> VsError {
        from_fault(&self.code, &self.message, self.details)
    }
}

fn decode_fault(fault: &Node) -> SoapFault {
    let message = find(fault, "faultstring")
        .map(|n| n.text.clone())
        .unwrap_or_default();
    let detail = find(fault, "detail").and_then(|d| d.children.first());
    let code = detail
        .map(|d| {
            d.xsi_type
                .clone()
                .unwrap_or_else(|| d.name.trim_end_matches("Fault").to_string())
        })
        .or_else(|| find(fault, "faultcode").map(|n| local_text(&n.text)))
        .unwrap_or_else(|| "ServerFault".to_string());
    SoapFault {
        code,
        message,
        details: detail.filter(|d| !d.children.is_empty()).map(to_value),
    }
}

fn local_text(s: &str) -> String {
    s.rsplit(':').next().unwrap_or(s).to_string()
}

/// Decode a response envelope.
///
/// Returns the `returnval` payload: `null` for void methods, a single value,
/// or an array when the server returned several `returnval` elements.
pub fn decode_response(xml: &str) -> VsResult<Result<Value, SoapFault>> {
    let root = parse_tree(xml)?;
    let envelope = find(&root, "Envelope")
        .ok_or_else(|| VsError::protocol("response is not a SOAP envelope"))?;
    let body = find(envelope, "Body")
        .ok_or_else(|| VsError::protocol("SOAP envelope has no Body"))?;
    let first = match body.children.first() {
        Some(n) => n,
        None => return Ok(Ok(Value::Null)),
    };
    if first.name == "Fault" {
        return Ok(Err(decode_fault(first)));
    }
    let returns: Vec<Value> = first
        .children
        .iter()
        .filter(|c| c.name == "returnval")
        .map(to_value)
        .collect();
    Ok(Ok(match returns.len() {
        0 => Value::Null,
        1 => returns.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Array(returns),
    }))
}
