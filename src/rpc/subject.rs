//! Request subject derivation and the subject key cache

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

/// Deterministic subject for `service#method`
///
/// `Warehouse::ShipmentService` + `Create` gives
/// `rpc.warehouse.shipment_service.create`; a non-empty `prefix` is
/// prepended as its own leading tokens.
pub fn subscription_key(prefix: &str, service: &str, method: &str) -> String {
    let service_path = service
        .split("::")
        .filter(|segment| !segment.is_empty())
        .map(underscore)
        .collect::<Vec<_>>()
        .join(".");

    let key = format!("rpc.{}.{}", service_path, underscore(method));
    if prefix.is_empty() {
        key
    } else {
        format!("{}.{}", prefix.trim_end_matches('.'), key)
    }
}

fn underscore(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 4);
    let mut prev: Option<char> = None;
    let mut chars = word.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_uppercase() {
            let next_is_lower = chars.peek().is_some_and(|n| n.is_ascii_lowercase());
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next_is_lower,
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

/// Cache of (prefix, service, method) → request subject
///
/// Each pair is derived once and then only read.
#[derive(Default)]
pub struct SubjectKeyCache {
    keys: DashMap<(String, String, String), Arc<str>>,
}

impl SubjectKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache, created on first use
    pub fn global() -> Arc<SubjectKeyCache> {
        static CACHE: OnceLock<Arc<SubjectKeyCache>> = OnceLock::new();
        Arc::clone(CACHE.get_or_init(|| Arc::new(SubjectKeyCache::new())))
    }

    /// Subject for `service#method`, deriving it on first lookup
    pub fn subject_for(&self, prefix: &str, service: &str, method: &str) -> Arc<str> {
        let key = (prefix.to_string(), service.to_string(), method.to_string());
        if let Some(subject) = self.keys.get(&key) {
            return Arc::clone(subject.value());
        }
        let entry = self
            .keys
            .entry(key)
            .or_insert_with(|| Arc::from(subscription_key(prefix, service, method)));
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
