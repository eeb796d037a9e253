//! Automatic answers to pending VM questions.

use regex::Regex;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::vsphere::mo::{self, ElementDescription};
use crate::vsphere::VsphereVm;

/// Resolve `answer` against the offered choices.
///
/// Returns the key of the choice whose summary equals `answer` ignoring
/// case (or `answer` itself when none does), plus a readable list of the
/// valid choices.
pub fn resolve_answer_and_options(choices: &[ElementDescription], answer: &str) -> (String, String) {
    let mut resolved = answer.to_string();
    let mut options = Vec::with_capacity(choices.len());
    for choice in choices {
        options.push(format!("({}) {}", choice.key, choice.summary));
        if choice.summary.eq_ignore_ascii_case(answer) {
            resolved = choice.key.clone();
        }
    }
    (resolved, options.join(" "))
}

impl VsphereVm {
    /// Answer the VM's pending question using the configured responses.
    ///
    /// Every rule whose pattern matches the question text is applied, in
    /// order. No pending question, or no matching rule, is not an error.
    #[instrument(skip(self, vm), fields(vm_name = %vm.name))]
    pub async fn answer_question(&self, vm: &mo::VirtualMachine) -> Result<()> {
        let Some(question) = vm.pending_question() else {
            return Ok(());
        };
        debug!(question = %question.text, "VM has a pending question");

        for rule in &self.spec.question_responses {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                HypervisorError::InvalidConfig(format!(
                    "error while parsing automated responses: {}",
                    e
                ))
            })?;
            if !pattern.is_match(&question.text) {
                continue;
            }

            let (answer, options) = resolve_answer_and_options(&question.choice.choice_info, &rule.answer);
            info!(pattern = %rule.pattern, answer = %answer, "Answering VM question");

            self.client()
                .answer_vm(&vm.reference, &question.id, &answer)
                .await
                .map_err(|e| {
                    HypervisorError::Backend(format!(
                        "error with answer {:?} to question {:?}: {}. Valid answers: {}",
                        answer, question.text, e, options
                    ))
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(key: &str, summary: &str) -> ElementDescription {
        ElementDescription {
            key: key.to_string(),
            label: summary.to_string(),
            summary: summary.to_string(),
        }
    }

    #[test]
    fn test_answer_resolves_to_choice_key() {
        let choices = vec![choice("0", "Cancel"), choice("1", "Retry")];
        let (answer, options) = resolve_answer_and_options(&choices, "retry");
        assert_eq!(answer, "1");
        assert_eq!(options, "(0) Cancel (1) Retry");
    }

    #[test]
    fn test_unknown_answer_is_passed_through() {
        let choices = vec![choice("0", "Cancel")];
        let (answer, _) = resolve_answer_and_options(&choices, "2");
        assert_eq!(answer, "2");
    }
}
