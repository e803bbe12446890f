//! Test macros for common testing patterns

/// Macro to assert an error contains a specific substring
#[macro_export]
macro_rules! assert_error_contains {
    ($result:expr, $expected:expr) => {{
        match $result {
            Ok(_) => panic!("Expected error containing '{}', but got Ok", $expected),
            Err(e) => {
                let error_str = format!("{}", e);
                if !error_str.contains($expected) {
                    panic!("Expected error to contain '{}', but got '{}'", $expected, error_str);
                }
            }
        }
    }};
}

/// Assert that a list of items is sorted by the given key
#[macro_export]
macro_rules! assert_sorted_by_key {
    ($items:expr, $key:expr) => {{
        let keys: Vec<_> = $items.iter().map($key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "items are not sorted by key");
    }};
}
