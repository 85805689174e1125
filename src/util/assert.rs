const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs and panics with an internal assertion message.
///
/// Reserved for broken invariants: callers never catch or retry these.
pub fn fail(message: impl AsRef<str>) -> ! {
    let message = assertion_error(message);
    log::error!(target: "firestore", "{message}");
    panic!("{message}");
}

/// Calls [`fail`] when `condition` does not hold.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Builds the text used for internal assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({SDK_VERSION}) INTERNAL ASSERT FAILED: {}",
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, "should panic");
    }

    #[test]
    fn hard_assert_passes_on_true() {
        hard_assert(true, "fine");
    }

    #[test]
    fn assertion_error_formats_message() {
        let err = assertion_error("boom");
        assert!(err.starts_with("FIRESTORE ("));
        assert!(err.ends_with("boom"));
    }
}
