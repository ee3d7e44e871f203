// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Affinity key extraction from structured messages.
//!
//! A method's affinity configuration names the key field with a dotted path
//! (e.g. `"transaction.session"`). Extraction walks the message one segment
//! at a time through the [`KeyedMessage`] lookup seam and returns the
//! string leaf, if the whole path resolves.

/// A borrowed view of one set message field.
pub enum FieldValue<'a> {
    /// String leaf.
    Text(&'a str),
    /// Nested message.
    Nested(&'a dyn KeyedMessage),
    /// Present, but neither a string nor a message.
    Other,
}

/// Field-by-name lookup over a structured message.
///
/// Implementations return only fields that are set on the message; an
/// unset field and a missing field are both `None`. The pool does not care
/// about the in-memory representation behind the lookup.
pub trait KeyedMessage {
    fn field(&self, name: &str) -> Option<FieldValue<'_>>;
}

/// Walks `message` along the dotted `path` and returns the string leaf.
///
/// Missing segments, unset fields, non-string leaves and non-message
/// intermediate fields all yield `None`. An empty string leaf counts as
/// absent as well, so callers can treat `None` as "no key".
pub fn affinity_key(message: &dyn KeyedMessage, path: &str) -> Option<String> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    match message.field(head)? {
        FieldValue::Text(value) if rest.is_none() && !value.is_empty() => Some(value.to_owned()),
        FieldValue::Nested(nested) => affinity_key(nested, rest?),
        _ => None,
    }
}

impl KeyedMessage for prost_types::Struct {
    fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        use prost_types::value::Kind;

        match self.fields.get(name)?.kind.as_ref()? {
            Kind::StringValue(value) => Some(FieldValue::Text(value)),
            Kind::StructValue(nested) => Some(FieldValue::Nested(nested)),
            _ => Some(FieldValue::Other),
        }
    }
}
