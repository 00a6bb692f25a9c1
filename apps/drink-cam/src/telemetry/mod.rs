//! Process-wide diagnostics setup.

pub mod logging;

/// `1`, `true`, `yes` or any other non-empty value except `0`/`false` turn a switch on.
fn env_flag(var: &str) -> bool {
    match std::env::var(var) {
        Ok(value) => {
            let value = value.trim();
            !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
        }
        Err(_) => false,
    }
}
