use crate::errors::InferenceError;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Index of the active model, shared between the table listener that
/// changes it and the detectors that read it.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    active: Arc<AtomicUsize>,
    count: usize,
}

impl ModelSelector {
    pub fn new(count: usize) -> Result<Self, InferenceError> {
        if count == 0 {
            return Err(InferenceError::NoModels);
        }
        Ok(Self {
            active: Arc::new(AtomicUsize::new(0)),
            count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Detectors call this once per cycle and keep the value for the whole
    /// cycle.
    pub fn current(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn set(&self, index: i64) -> Result<(), InferenceError> {
        let valid = usize::try_from(index).ok().filter(|&i| i < self.count);
        let Some(index) = valid else {
            return Err(InferenceError::ModelIndexOutOfRange {
                index,
                count: self.count,
            });
        };

        let previous = self.active.swap(index, Ordering::Release);
        if previous != index {
            tracing::info!(previous, index, "Active model changed");
        }
        Ok(())
    }

    /// Apply a table value. Only integral values are accepted.
    pub fn set_from_value(&self, value: f64) -> Result<(), InferenceError> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(InferenceError::ModelIndexOutOfRange {
                index: if value.is_finite() { value as i64 } else { -1 },
                count: self.count,
            });
        }
        self.set(value as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_first_model() {
        let selector = ModelSelector::new(3).unwrap();
        assert_eq!(selector.current(), 0);
        assert_eq!(selector.count(), 3);
    }

    #[test]
    fn test_requires_a_model() {
        assert_eq!(ModelSelector::new(0).unwrap_err(), InferenceError::NoModels);
    }

    #[test]
    fn test_set_is_visible_to_clones() {
        let selector = ModelSelector::new(2).unwrap();
        let reader = selector.clone();
        selector.set(1).unwrap();
        assert_eq!(reader.current(), 1);
    }

    #[test]
    fn test_out_of_range_is_rejected_and_ignored() {
        let selector = ModelSelector::new(2).unwrap();
        selector.set(1).unwrap();

        assert_eq!(
            selector.set(2),
            Err(InferenceError::ModelIndexOutOfRange { index: 2, count: 2 })
        );
        assert!(selector.set(-1).is_err());
        assert_eq!(selector.current(), 1, "Rejected values leave the selection alone");
    }

    #[test]
    fn test_set_from_table_value() {
        let selector = ModelSelector::new(3).unwrap();
        selector.set_from_value(2.0).unwrap();
        assert_eq!(selector.current(), 2);

        assert!(selector.set_from_value(1.5).is_err());
        assert!(selector.set_from_value(f64::NAN).is_err());
        assert_eq!(selector.current(), 2);
    }
}
