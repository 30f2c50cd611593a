//! Key/value telemetry table shared with the robot controller.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Table connection unavailable: {0}")]
    Disconnected(String),

    #[error("Outbound queue full, {entries} entries dropped")]
    QueueFull { entries: usize },

    #[error("Failed to encode {key}: {reason}")]
    Encode { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    NumberArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl TableValue {
    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            TableValue::NumberArray(v) => Some(v),
            TableValue::StringArray(_) => None,
        }
    }
}

/// Called with `(key, new_value)` whenever a watched key changes.
pub type EntryListener = Arc<dyn Fn(&str, &TableValue) + Send + Sync>;

pub trait TelemetryTable: Send + Sync {
    fn put(&self, key: &str, value: TableValue) -> Result<(), TableError>;

    fn get(&self, key: &str) -> Option<TableValue>;

    /// Register `listener` for `key`. If the key already holds a value the
    /// listener is invoked immediately with it.
    fn add_entry_listener(&self, key: &str, listener: EntryListener) -> Result<(), TableError>;

    /// Write several entries as one unit.
    fn publish_batch(&self, entries: Vec<(String, TableValue)>) -> Result<(), TableError> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }

    fn put_number_array(&self, key: &str, values: Vec<f64>) -> Result<(), TableError> {
        self.put(key, TableValue::NumberArray(values))
    }

    fn put_string_array(&self, key: &str, values: Vec<String>) -> Result<(), TableError> {
        self.put(key, TableValue::StringArray(values))
    }

    fn get_number_array(&self, key: &str) -> Option<Vec<f64>> {
        match self.get(key)? {
            TableValue::NumberArray(v) => Some(v),
            TableValue::StringArray(_) => None,
        }
    }
}

/// In-process table. Used when no broker is configured and in tests.
#[derive(Default)]
pub struct MemoryTable {
    values: RwLock<HashMap<String, TableValue>>,
    listeners: Mutex<HashMap<String, Vec<EntryListener>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn listeners_for(&self, key: &str) -> Vec<EntryListener> {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    // Runs with no lock held so listeners may call back into the table.
    fn notify(&self, changed: &[(String, TableValue)]) {
        for (key, value) in changed {
            for listener in self.listeners_for(key) {
                listener(key, value);
            }
        }
    }
}

impl TelemetryTable for MemoryTable {
    fn put(&self, key: &str, value: TableValue) -> Result<(), TableError> {
        self.publish_batch(vec![(key.to_string(), value)])
    }

    fn get(&self, key: &str) -> Option<TableValue> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn add_entry_listener(&self, key: &str, listener: EntryListener) -> Result<(), TableError> {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .push(Arc::clone(&listener));

        if let Some(current) = self.get(key) {
            listener(key, &current);
        }
        Ok(())
    }

    fn publish_batch(&self, entries: Vec<(String, TableValue)>) -> Result<(), TableError> {
        {
            let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
            for (key, value) in &entries {
                values.insert(key.clone(), value.clone());
            }
        }
        self.notify(&entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_put_and_get() {
        let table = MemoryTable::new();
        table.put_number_array("robot_position", vec![1.0, 2.0, 0.5]).unwrap();
        table
            .put_string_array("detected_classes", vec!["note".into()])
            .unwrap();

        assert_eq!(
            table.get_number_array("robot_position"),
            Some(vec![1.0, 2.0, 0.5])
        );
        assert_eq!(
            table.get_number_array("detected_classes"),
            None,
            "String arrays are not number arrays"
        );
        assert_eq!(table.get_number_array("missing"), None);
    }

    #[test]
    fn test_listener_fires_on_change() {
        let table = MemoryTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        table
            .add_entry_listener(
                "active_model",
                Arc::new(move |_, value| {
                    if let Some(v) = value.as_numbers() {
                        sink.lock().unwrap().push(v[0]);
                    }
                }),
            )
            .unwrap();

        table.put_number_array("active_model", vec![1.0]).unwrap();
        table.put_number_array("other_key", vec![5.0]).unwrap();
        table.put_number_array("active_model", vec![0.0]).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_listener_notified_immediately_for_existing_value() {
        let table = MemoryTable::new();
        table.put_number_array("active_model", vec![2.0]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        table
            .add_entry_listener(
                "active_model",
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_read_table_without_deadlock() {
        let table = Arc::new(MemoryTable::new());
        let observed = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&table);
        let sink = Arc::clone(&observed);
        table
            .add_entry_listener(
                "a",
                Arc::new(move |_, _| {
                    *sink.lock().unwrap() = inner.get_number_array("a");
                }),
            )
            .unwrap();
        table.put_number_array("a", vec![7.0]).unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(vec![7.0]));
    }

    #[test]
    fn test_batch_is_visible_as_a_whole() {
        let table = MemoryTable::new();
        table
            .publish_batch(vec![
                ("x_yaw_angles".into(), TableValue::NumberArray(vec![1.0])),
                ("x_confidences".into(), TableValue::NumberArray(vec![0.9])),
            ])
            .unwrap();
        assert_eq!(table.keys(), vec!["x_confidences", "x_yaw_angles"]);
    }
}
