//! Size budgets for promise inlining.

/// Environment variable overriding [`InlinerConfig::max_unit_size`].
pub const MAX_SIZE_VAR: &str = "THUNK_PROMISE_INLINER_MAX_SIZE";

/// Admission gates for promise inlining. They decide whether inlining is
/// attempted, never whether it is correct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InlinerConfig {
    /// A unit larger than this is *huge*: only tiny promises are inlined
    /// into it.
    pub max_unit_size: usize,
    /// Largest promise body (exclusive) inlined into a huge unit.
    pub huge_unit_promise_limit: usize,
}

impl Default for InlinerConfig {
    fn default() -> Self {
        Self {
            max_unit_size: 3000,
            huge_unit_promise_limit: 10,
        }
    }
}

impl InlinerConfig {
    /// Defaults, with `max_unit_size` taken from the process environment
    /// when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// A value that does not parse is logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(MAX_SIZE_VAR) {
            match raw.trim().parse::<usize>() {
                Ok(size) => config.max_unit_size = size,
                Err(err) => tracing::warn!(
                    var = MAX_SIZE_VAR,
                    value = %raw,
                    %err,
                    "ignoring unparsable inliner size, keeping default"
                ),
            }
        }
        config
    }

    /// Is a unit of `size` instructions too big for unrestricted inlining?
    pub fn is_huge(&self, size: usize) -> bool {
        size > self.max_unit_size
    }

    /// May a promise of `promise_size` be inlined into a unit of `unit_size`?
    pub fn admits(&self, unit_size: usize, promise_size: usize) -> bool {
        !self.is_huge(unit_size) || promise_size < self.huge_unit_promise_limit
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{InlinerConfig, MAX_SIZE_VAR};

    #[test]
    fn defaults() {
        let config = InlinerConfig::default();
        assert_eq!(config.max_unit_size, 3000);
        assert_eq!(config.huge_unit_promise_limit, 10);
    }

    #[test]
    fn lookup_overrides_max_size() {
        let config =
            InlinerConfig::from_lookup(|k| (k == MAX_SIZE_VAR).then(|| " 120 ".to_string()));
        assert_eq!(config.max_unit_size, 120);
        assert_eq!(config.huge_unit_promise_limit, 10);
    }

    #[test]
    fn bad_value_keeps_default() {
        let config = InlinerConfig::from_lookup(|_| Some("lots".to_string()));
        assert_eq!(config, InlinerConfig::default());
    }

    #[test]
    fn huge_units_only_take_tiny_promises() {
        let config = InlinerConfig {
            max_unit_size: 100,
            huge_unit_promise_limit: 10,
        };
        assert!(config.admits(100, 500));
        assert!(!config.is_huge(100));
        assert!(config.admits(101, 9));
        assert!(!config.admits(101, 10));
    }
}
