use std::sync::LazyLock;

/// Defines the application version.
///
/// Release builds inject the commit through `GIT_COMMIT`; local builds fall
/// back to the bare crate version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    match option_env!("GIT_COMMIT") {
        Some(commit) => format!("{}+{commit}", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
});
