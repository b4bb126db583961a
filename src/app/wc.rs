//! Word count: the canonical MapReduce pair.

use std::path::Path;

use crate::KeyValue;

pub fn map(_filename: &Path, contents: &str) -> Vec<KeyValue> {
    contents
        .split_whitespace()
        .map(|w| KeyValue {
            key: w.to_owned(),
            value: "1".to_owned(),
        })
        .collect()
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}
