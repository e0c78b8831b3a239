//! Registry of the experiments a session can build.
//!
//! The experiments themselves live outside the engine; here we only keep
//! the names, versions and input requirements the session needs to hand a
//! builder to its caller.

use crate::core::errors::EngineError;

/// Whether an experiment consumes measurement inputs (URLs mostly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPolicy {
    None,
    Optional,
    Required,
}

#[derive(Debug)]
struct ExperimentSpec {
    name: &'static str,
    test_version: &'static str,
    input_policy: InputPolicy,
}

const REGISTRY: &[ExperimentSpec] = &[
    ExperimentSpec {
        name: "dash",
        test_version: "0.13.0",
        input_policy: InputPolicy::None,
    },
    ExperimentSpec {
        name: "facebook_messenger",
        test_version: "0.2.0",
        input_policy: InputPolicy::None,
    },
    ExperimentSpec {
        name: "http_header_field_manipulation",
        test_version: "0.2.0",
        input_policy: InputPolicy::None,
    },
    ExperimentSpec {
        name: "ndt",
        test_version: "0.9.0",
        input_policy: InputPolicy::None,
    },
    ExperimentSpec {
        name: "telegram",
        test_version: "0.3.0",
        input_policy: InputPolicy::None,
    },
    ExperimentSpec {
        name: "web_connectivity",
        test_version: "0.4.1",
        input_policy: InputPolicy::Required,
    },
    ExperimentSpec {
        name: "whatsapp",
        test_version: "0.11.0",
        input_policy: InputPolicy::None,
    },
];

/// Handle for configuring and (outside the engine) running one experiment.
#[derive(Debug)]
pub struct ExperimentBuilder {
    spec: &'static ExperimentSpec,
}

impl ExperimentBuilder {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn test_version(&self) -> &'static str {
        self.spec.test_version
    }

    pub fn input_policy(&self) -> InputPolicy {
        self.spec.input_policy
    }

    pub fn needs_input(&self) -> bool {
        self.spec.input_policy == InputPolicy::Required
    }
}

/// Experiment names tolerate the mixed-case spellings seen in the wild
/// ("WebConnectivity"); canonical form is lowercase with underscores.
fn canonicalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (index, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn new_experiment_builder(name: &str) -> Result<ExperimentBuilder, EngineError> {
    let canonical = canonicalize(name);
    REGISTRY
        .iter()
        .find(|spec| spec.name == canonical)
        .map(|spec| ExperimentBuilder { spec })
        .ok_or_else(|| EngineError::UnknownExperiment(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_experiments_build() {
        let builder = new_experiment_builder("web_connectivity").unwrap();
        assert_eq!(builder.name(), "web_connectivity");
        assert!(builder.needs_input());

        let builder = new_experiment_builder("whatsapp").unwrap();
        assert_eq!(builder.input_policy(), InputPolicy::None);
    }

    #[test]
    fn mixed_case_names_are_canonicalized() {
        let builder = new_experiment_builder("WebConnectivity").unwrap();
        assert_eq!(builder.name(), "web_connectivity");
    }

    #[test]
    fn unknown_experiment_is_an_error() {
        let err = new_experiment_builder("antani").unwrap_err();
        assert!(matches!(err, EngineError::UnknownExperiment(name) if name == "antani"));
    }
}
