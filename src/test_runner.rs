use std::fmt::Write;

use indexmap::IndexMap;
use tracing::info;

use crate::error::{Fault, RuntimeErrorKind};

/// Ledger of test-case completion, keyed `"set:case"` in discovery order.
/// Shared by a VM and every child VM it spawns to run cases.
#[derive(Debug, Default)]
pub struct TestRunner {
    current_set: Option<String>,
    results: IndexMap<String, bool>,
}

impl TestRunner {
    pub fn new() -> Self {
        TestRunner::default()
    }

    pub fn reset(&mut self) {
        self.current_set = None;
        self.results.clear();
    }

    pub fn start_set(&mut self, name: &str) {
        self.current_set = Some(name.to_string());
    }

    pub fn end_set(&mut self) {
        self.current_set = None;
    }

    fn key(&self, case: &str) -> String {
        format!("{}:{}", self.current_set.as_deref().unwrap_or_default(), case)
    }

    pub fn start_case(&mut self, case: &str) -> Result<(), Fault> {
        let key = self.key(case);
        if self.results.contains_key(&key) {
            return Err(Fault::new(
                RuntimeErrorKind::Internal,
                format!("Test case '{}' has already been started.", key),
            ));
        }
        self.results.insert(key, false);
        Ok(())
    }

    pub fn end_case(&mut self, case: &str) -> Result<(), Fault> {
        let key = self.key(case);
        match self.results.get_mut(&key) {
            Some(completed) => {
                *completed = true;
                info!(test = %key, "completed");
                Ok(())
            }
            None => Err(Fault::new(
                RuntimeErrorKind::Internal,
                format!("Test case '{}' ended without being started.", key),
            )),
        }
    }

    pub fn tests_found(&self) -> usize {
        self.results.len()
    }

    pub fn all_passed(&self) -> bool {
        self.results.values().all(|completed| *completed)
    }

    pub fn results(&self) -> impl Iterator<Item = (&str, bool)> {
        self.results.iter().map(|(key, completed)| (key.as_str(), *completed))
    }

    pub fn generate_dump(&self) -> String {
        let mut out = String::new();
        for (key, completed) in &self.results {
            let status = if *completed { "Completed" } else { "Incomplete" };
            let _ = writeln!(out, "\"{}\" {}", key, status);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_tracks_completion() {
        let mut runner = TestRunner::new();
        runner.start_set("T");
        runner.start_case("ok").unwrap();
        runner.end_case("ok").unwrap();
        runner.start_case("bad").unwrap();
        runner.end_set();

        assert_eq!(runner.tests_found(), 2);
        assert!(!runner.all_passed());
        pretty_assertions::assert_eq!(runner.generate_dump(), "\"T:ok\" Completed\n\"T:bad\" Incomplete\n");
    }

    #[test]
    fn test_duplicate_start_is_error() {
        let mut runner = TestRunner::new();
        runner.start_set("T");
        runner.start_case("a").unwrap();
        assert!(runner.start_case("a").is_err());
    }

    #[test]
    fn test_empty_runner_passes() {
        let runner = TestRunner::new();
        assert_eq!(runner.tests_found(), 0);
        assert!(runner.all_passed());
    }
}
