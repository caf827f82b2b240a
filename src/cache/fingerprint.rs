//! Value-based fingerprints for cached calls.
//!
//! Arguments are serialized with serde and rendered as one type-tagged
//! segment each; the concatenation is hashed with [`string_hash`]. Two calls
//! with structurally equal arguments always share a fingerprint, no matter
//! where the values live in memory.

use serde::Serialize;
use serde_json::Value;

use super::hash::{hash_segment, string_hash};

/// Arguments of a cached call.
///
/// Implemented for `()` and tuples of up to six serializable values; each
/// tuple element becomes its own segment. Single-argument calls use a
/// one-element tuple: `(chat_id,)`.
pub trait CacheArgs {
    fn to_values(&self) -> Result<Vec<Value>, serde_json::Error>;
}

impl CacheArgs for () {
    fn to_values(&self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(Vec::new())
    }
}

macro_rules! impl_cache_args {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> CacheArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn to_values(&self) -> Result<Vec<Value>, serde_json::Error> {
                let ($($name,)+) = self;
                Ok(vec![$(serde_json::to_value($name)?),+])
            }
        }
    };
}

impl_cache_args!(A);
impl_cache_args!(A, B);
impl_cache_args!(A, B, C);
impl_cache_args!(A, B, C, D);
impl_cache_args!(A, B, C, D, E);
impl_cache_args!(A, B, C, D, E, F);

/// Type-tagged text form of one argument.
///
/// Numbers and booleans use their literal form and `null` (unit, `None`)
/// reads as `undefined`. Strings are kept verbatim and arrays/objects use
/// canonical JSON (object keys sorted); both carry their byte length so a
/// payload can never be read as a segment boundary.
pub fn tagged_segment(value: &Value) -> String {
    match value {
        Value::Null => "undefined:undefined".to_string(),
        Value::Bool(b) => format!("boolean:{b}"),
        Value::Number(n) => format!("number:{n}"),
        Value::String(s) => format!("string:{}:{s}", s.len()),
        Value::Array(_) | Value::Object(_) => {
            let json = value.to_string();
            format!("object:{}:{json}", json.len())
        }
    }
}

/// Fingerprint of a whole argument list.
pub fn argument_fingerprint<A: CacheArgs + ?Sized>(args: &A) -> Result<String, serde_json::Error> {
    let text: String = args
        .to_values()?
        .iter()
        .map(|value| {
            let mut segment = tagged_segment(value);
            segment.push(';');
            segment
        })
        .collect();
    Ok(string_hash(&text).to_string())
}

/// Fingerprint of a function identity string.
pub fn function_fingerprint(identity: &str) -> String {
    hash_segment(identity)
}
