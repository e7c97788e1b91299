use std::collections::BTreeSet;
use strum::{Display, EnumString};

//
// Public Interface
//

/// Translation and solving options shared by every stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of times each loop body is duplicated, 0 rejects loops.
    pub unroll_bound: u32,
    pub bounds_checking: bool,
    pub call_policy: CallPolicy,
    pub solver_timeout_ms: u64,
    /// External functions known not to write memory.
    pub pure_functions: BTreeSet<String>,
    /// Fail the whole module if any function fails.
    pub atomic: bool,
    pub inline_depth: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopPolicy {
    Reject,
    Unroll(u32),
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum CallPolicy {
    Inline,
    Uninterpreted,
}

/// Capability of a callee with respect to memory.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum CallEffect {
    Pure,
    Effectful,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unroll_bound: 0,
            bounds_checking: false,
            call_policy: CallPolicy::Uninterpreted,
            solver_timeout_ms: 10_000,
            pure_functions: BTreeSet::new(),
            atomic: false,
            inline_depth: 8,
        }
    }
}

impl Config {
    pub fn loop_policy(&self) -> LoopPolicy {
        match self.unroll_bound {
            0 => LoopPolicy::Reject,
            n => LoopPolicy::Unroll(n),
        }
    }

    pub fn with_unroll_bound(mut self, bound: u32) -> Self {
        self.unroll_bound = bound;
        self
    }

    pub fn with_bounds_checking(mut self, enabled: bool) -> Self {
        self.bounds_checking = enabled;
        self
    }

    pub fn with_call_policy(mut self, policy: CallPolicy) -> Self {
        self.call_policy = policy;
        self
    }

    pub fn with_pure_function(mut self, name: &str) -> Self {
        self.pure_functions.insert(name.to_string());
        self
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.solver_timeout_ms = timeout;
        self
    }

    /// Classifies a callee from its declared memory attributes. Listed
    /// pure functions are trusted, anything not annotated is effectful.
    pub fn call_effect(&self, callee: &str, attributes: &[String]) -> CallEffect {
        if self.pure_functions.contains(callee) {
            return CallEffect::Pure;
        }
        let pure = attributes.iter().any(|a| match a.as_str() {
            "readnone" | "readonly" => true,
            memory if memory.starts_with("memory(") => !memory.contains("write"),
            _ => false,
        });
        let writes = attributes
            .iter()
            .any(|a| a == "writeonly" || (a.starts_with("memory(") && a.contains("write")));
        if pure && !writes {
            CallEffect::Pure
        } else {
            CallEffect::Effectful
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn zero_unroll_bound_rejects_loops() {
        assert_eq!(Config::default().loop_policy(), LoopPolicy::Reject);
        assert_eq!(
            Config::default().with_unroll_bound(3).loop_policy(),
            LoopPolicy::Unroll(3)
        );
    }

    #[test]
    fn call_policy_parses_from_cli_spelling() {
        assert_eq!(CallPolicy::from_str("inline"), Ok(CallPolicy::Inline));
        assert_eq!(CallPolicy::Uninterpreted.to_string(), "uninterpreted");
        assert!(CallPolicy::from_str("magic").is_err());
    }

    #[test]
    fn purity_follows_memory_attributes_not_names() {
        let config = Config::default().with_pure_function("strlen");
        let attrs = |list: &[&str]| list.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        assert_eq!(config.call_effect("strlen", &[]), CallEffect::Pure);
        assert_eq!(config.call_effect("getpure", &[]), CallEffect::Effectful);
        assert_eq!(
            config.call_effect("f", &attrs(&["nounwind", "memory(none)"])),
            CallEffect::Pure
        );
        assert_eq!(
            config.call_effect("g", &attrs(&["memory(argmem: read)"])),
            CallEffect::Pure
        );
        assert_eq!(
            config.call_effect("h", &attrs(&["memory(argmem: readwrite)"])),
            CallEffect::Effectful
        );
        assert_eq!(config.call_effect("k", &attrs(&["readonly"])), CallEffect::Pure);
    }
}
