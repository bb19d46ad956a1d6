use std::collections::HashMap;

/// Extract a parameter as f64 with a default value, ignoring non-finite input
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

/// Extract a parameter as usize, rounded, with a minimum value
pub fn get_param_usize_at_least(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
) -> usize {
    let raw = get_param_f64(params, key, default as f64);
    raw.round().max(min as f64) as usize
}

/// Flags are stored as numbers; anything >= 0.5 is on
pub fn get_param_bool(params: &HashMap<String, f64>, key: &str, default: bool) -> bool {
    match params.get(key).copied().filter(|value| value.is_finite()) {
        Some(value) => value >= 0.5,
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_on_missing_or_non_finite() {
        let mut params = HashMap::new();
        params.insert("a".to_string(), f64::NAN);
        params.insert("b".to_string(), 2.6);
        assert_eq!(get_param_f64(&params, "a", 1.0), 1.0);
        assert_eq!(get_param_f64(&params, "missing", 3.0), 3.0);
        assert_eq!(get_param_usize_at_least(&params, "b", 1, 1), 3);
        assert_eq!(get_param_usize_at_least(&params, "missing", 0, 1), 1);
    }

    #[test]
    fn bool_threshold() {
        let mut params = HashMap::new();
        params.insert("flag".to_string(), 0.0);
        assert!(!get_param_bool(&params, "flag", true));
        params.insert("flag".to_string(), 1.0);
        assert!(get_param_bool(&params, "flag", false));
        assert!(get_param_bool(&params, "other", true));
    }
}
