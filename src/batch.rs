use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchItemError<K> {
    pub item: K,
    pub message: String,
}

/// Result of a best-effort batch, failed items do not roll back the others.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchOutcome<K> {
    pub assigned_count: usize,
    pub errors: Vec<BatchItemError<K>>,
}
impl<K> Default for BatchOutcome<K> {
    fn default() -> Self {
        Self { assigned_count: 0, errors: Vec::new() }
    }
}
impl<K> BatchOutcome<K> {
    pub fn assigned(&mut self) {
        self.assigned_count += 1;
    }
    pub fn failed(&mut self, item: K, message: impl Into<String>) {
        self.errors.push(BatchItemError { item, message: message.into() });
    }
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            format!("{} assigned", self.assigned_count)
        } else {
            format!("{} assigned, {} failed", self.assigned_count, self.errors.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_failures() {
        let mut outcome = BatchOutcome::default();
        outcome.assigned();
        outcome.assigned();
        assert_eq!(outcome.summary(), "2 assigned");
        outcome.failed(7, "already holds it");
        assert_eq!(outcome.summary(), "2 assigned, 1 failed");
        assert_eq!(outcome.errors[0], BatchItemError { item: 7, message: "already holds it".to_string() });
    }
}
