//! Canonical cache-key derivation.
//!
//! A key is the ordered tuple `(namespace, operation, prefix, endpoint,
//! canonical-arguments)`. The endpoint slot holds a fixed wildcard when the
//! caller asked for endpoint-independent caching, so otherwise-identical
//! calls against different endpoints collide on purpose (e.g. sharing cached
//! tokenization across equivalent models).

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::call::CallArgs;
use crate::error::{Error, Result};

/// Namespace slot shared by every key this crate derives.
pub const KEY_NAMESPACE: &str = "tollgate";

/// Stands in for the endpoint identity when it is excluded from the key.
pub const ENDPOINT_WILDCARD: &str = "*";

lazy_static! {
    // Matches renderings like `<pkg.Mod.Class at 0xDEAD>` and
    // `<Foo object at 0x120f36b10>`: a value whose textual form embeds a
    // memory address can never reproduce on a repeat call.
    static ref TRANSIENT_OBJECT_RE: Regex =
        Regex::new(r"<[^>]* at 0x[0-9A-Fa-f]+>").expect("transient-object pattern is valid");
}

fn is_transient_repr(s: &str) -> bool {
    TRANSIENT_OBJECT_RE.is_match(s)
}

/// Canonical textual form of one key component.
///
/// Strings render bare (no quotes) so that the same logical text always
/// yields the same bytes; everything else renders as compact JSON, which is
/// deterministic because JSON object keys are kept sorted.
fn canonical_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A derived cache key. Holds the full component tuple for display and
/// comparison; [`encode`](CacheKey::encode) produces the store-level byte key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    operation: String,
    prefix: String,
    endpoint: String,
    canonical_args: String,
}

impl CacheKey {
    /// Derive the key for one call.
    ///
    /// `args` must already carry every argument bound by name; the record's
    /// insertion order never affects the result. Fails with
    /// [`Error::UnstableCacheKey`] if any component's canonical form embeds
    /// a transient object representation.
    pub fn derive(
        operation: &str,
        args: &CallArgs,
        prefix: Option<&str>,
        endpoint: Option<&str>,
        include_endpoint: bool,
    ) -> Result<Self> {
        let endpoint_slot = if include_endpoint {
            endpoint.unwrap_or(ENDPOINT_WILDCARD).to_string()
        } else {
            ENDPOINT_WILDCARD.to_string()
        };

        let mut canonical_args = String::new();
        for (name, value) in args.canonical_entries() {
            let rendered = canonical_component(value);
            if is_transient_repr(&rendered) {
                return Err(Error::UnstableCacheKey(format!("{name}={rendered}")));
            }
            canonical_args.push_str(name);
            canonical_args.push('=');
            canonical_args.push_str(&rendered);
            canonical_args.push('\u{1f}');
        }

        let key = Self {
            operation: operation.to_string(),
            prefix: prefix.unwrap_or("").to_string(),
            endpoint: endpoint_slot,
            canonical_args,
        };
        for component in [&key.operation, &key.prefix, &key.endpoint] {
            if is_transient_repr(component) {
                return Err(Error::UnstableCacheKey(component.clone()));
            }
        }
        Ok(key)
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Byte key handed to the persistent store. The header carries the
    /// discriminating slots verbatim; the argument text is digested so the
    /// encoded key stays within the backend's key-size bound.
    pub fn encode(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_args.as_bytes());
        let digest = hasher.finalize();

        let header = format!(
            "{KEY_NAMESPACE}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}",
            self.operation, self.prefix, self.endpoint
        );
        let mut encoded = header.into_bytes();
        encoded.extend_from_slice(&digest);
        encoded
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({KEY_NAMESPACE}, {}, {}, {})",
            self.operation, self.prefix, self.endpoint
        )
    }
}
