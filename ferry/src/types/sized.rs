use serde_json::Value;

/// Reports an approximate in-memory size in bytes.
pub trait SizeHint {
    /// Returns the approximate size in bytes for this value.
    fn size_hint(&self) -> usize;
}

impl<T, E> SizeHint for Result<T, E>
where
    T: SizeHint,
{
    fn size_hint(&self) -> usize {
        match self {
            Ok(value) => value.size_hint(),
            Err(_) => 0,
        }
    }
}

impl<T> SizeHint for Option<T>
where
    T: SizeHint,
{
    fn size_hint(&self) -> usize {
        match self {
            Some(value) => value.size_hint(),
            None => 0,
        }
    }
}

impl SizeHint for String {
    fn size_hint(&self) -> usize {
        self.len()
    }
}

/// Approximates the serialized JSON size of a value without serializing it.
impl SizeHint for Value {
    fn size_hint(&self) -> usize {
        match self {
            Value::Null => 4,
            Value::Bool(value) => {
                if *value {
                    4
                } else {
                    5
                }
            }
            // Numbers are bounded by the width of an `f64` or `i64` rendering.
            Value::Number(_) => 8,
            Value::String(value) => value.len() + 2,
            Value::Array(values) => 2 + values.iter().map(|v| v.size_hint() + 1).sum::<usize>(),
            Value::Object(map) => map.size_hint(),
        }
    }
}

impl SizeHint for serde_json::Map<String, Value> {
    fn size_hint(&self) -> usize {
        2 + self
            .iter()
            .map(|(key, value)| key.len() + 4 + value.size_hint())
            .sum::<usize>()
    }
}
