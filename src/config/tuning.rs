/// Typed environment parsing helpers. Every knob surfaces a descriptive
/// error naming the variable rather than panicking.

pub fn parse_env_usize(name: &str, default: usize) -> Result<usize, String> {
    std::env::var(name).map_or(Ok(default), |v| {
        v.parse::<usize>()
            .map_err(|e| format!("invalid {name}: {e}"))
    })
}

pub fn parse_env_u64(name: &str, default: u64) -> Result<u64, String> {
    std::env::var(name)
        .map_or(Ok(default), |v| v.parse::<u64>().map_err(|e| format!("invalid {name}: {e}")))
}

pub fn parse_env_u32(name: &str, default: u32) -> Result<u32, String> {
    std::env::var(name)
        .map_or(Ok(default), |v| v.parse::<u32>().map_err(|e| format!("invalid {name}: {e}")))
}

pub fn parse_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn parse_optional_env_u16(name: &str) -> Result<Option<u16>, String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse::<u16>()
            .map(Some)
            .map_err(|e| format!("invalid {name}: {e}")),
        _ => Ok(None),
    }
}

/// Comma-separated list of values; empty entries are skipped.
pub fn parse_env_list<T: std::str::FromStr>(name: &str) -> Result<Vec<T>, String>
where
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<T>()
                .map_err(|e| format!("invalid {name} entry '{entry}': {e}"))
        })
        .collect()
}

/// JSON array of strings, e.g. `MIRROR_FATAL_PATTERNS=["gone forever"]`.
pub fn parse_env_json_strings(name: &str) -> Result<Vec<String>, String> {
    let val = match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => return Ok(Vec::new()),
    };
    serde_json::from_str::<Vec<String>>(&val).map_err(|e| format!("invalid {name} JSON: {e}"))
}
