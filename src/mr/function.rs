//! Built-in map and reduce applications, used by the worker binary and the
//! tests. Anything matching the worker's function signatures will do.

use crate::mr::worker::KeyValue;

/// Word Count application
pub mod wc {
    use super::KeyValue;

    /// Emit `("word", "1")` for every whitespace-separated word in the split
    pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
        contents
            .split_whitespace()
            .map(|word| KeyValue {
                key: word.to_string(),
                value: "1".to_string(),
            })
            .collect()
    }

    /// The count is simply how many times the word was emitted
    pub fn reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }
}
