/// Interpret a string value such as "1" or "no" as a boolean.
///
/// Unrecognized values are treated as `false`.
pub fn str_as_bool(s: &str) -> bool {
    match s {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => {
            tracing::warn!(value = s, "unrecognized boolean value");
            false
        }
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .as_ref()
        .map(|s| str_as_bool(s))
        .unwrap_or(default)
}
