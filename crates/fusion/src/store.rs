use crate::detection::Detection;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Camera registered twice: {0}")]
    DuplicateCamera(String),
}

/// Latest detection list per camera.
///
/// Every slot is written by exactly one detector and read by the fusion
/// thread. Writers swap in a complete list, so a reader always sees either
/// the previous or the current list, never a mix.
#[derive(Debug)]
pub struct DetectionStore {
    order: Vec<String>,
    slots: HashMap<String, Mutex<Arc<[Detection]>>>,
}

impl DetectionStore {
    pub fn new<I, S>(camera_names: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut order = Vec::new();
        let mut slots = HashMap::new();

        for name in camera_names {
            let name = name.into();
            if slots
                .insert(name.clone(), Mutex::new(Arc::<[Detection]>::from(Vec::new())))
                .is_some()
            {
                return Err(StoreError::DuplicateCamera(name));
            }
            order.push(name);
        }

        Ok(Self { order, slots })
    }

    fn slot(&self, camera: &str) -> Result<&Mutex<Arc<[Detection]>>, StoreError> {
        self.slots
            .get(camera)
            .ok_or_else(|| StoreError::UnknownCamera(camera.to_string()))
    }

    /// Replace a camera's list wholesale.
    pub fn replace(&self, camera: &str, detections: Vec<Detection>) -> Result<(), StoreError> {
        let slot = self.slot(camera)?;
        // Allocate before locking so the critical section is a pointer swap.
        let fresh: Arc<[Detection]> = Arc::from(detections);
        let previous = {
            let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *guard, fresh)
        };
        drop(previous);
        Ok(())
    }

    pub fn clear(&self, camera: &str) -> Result<(), StoreError> {
        self.replace(camera, Vec::new())
    }

    pub fn snapshot(&self, camera: &str) -> Result<Arc<[Detection]>, StoreError> {
        let slot = self.slot(camera)?;
        let guard = slot.lock().unwrap_or_else(|p| p.into_inner());
        Ok(Arc::clone(&guard))
    }

    /// Snapshot every camera in registration order. Each slot is locked only
    /// long enough to clone its `Arc`.
    pub fn snapshot_all(&self) -> Vec<(&str, Arc<[Detection]>)> {
        self.order
            .iter()
            .filter_map(|name| {
                let slot = self.slots.get(name)?;
                let guard = slot.lock().unwrap_or_else(|p| p.into_inner());
                Some((name.as_str(), Arc::clone(&guard)))
            })
            .collect()
    }

    pub fn cameras(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Vec2};

    fn detection(class: &str, distance: f64) -> Detection {
        Detection {
            class_name: class.to_string(),
            confidence: 0.9,
            bbox: BoundingBox::default(),
            bearing_deg: 0.0,
            local_position: Vec2::new(distance, 0.0),
            distance,
        }
    }

    #[test]
    fn test_starts_empty() {
        let store = DetectionStore::new(["front", "back"]).unwrap();
        assert!(store.snapshot("front").unwrap().is_empty());
        assert_eq!(store.cameras(), &["front".to_string(), "back".to_string()]);
    }

    #[test]
    fn test_replace_is_not_merge() {
        let store = DetectionStore::new(["front"]).unwrap();
        store
            .replace("front", vec![detection("note", 1.0), detection("note", 2.0)])
            .unwrap();
        store.replace("front", vec![detection("cone", 3.0)]).unwrap();

        let snap = store.snapshot("front").unwrap();
        assert_eq!(snap.len(), 1, "Second write must replace the first");
        assert_eq!(snap[0].class_name, "cone");
    }

    #[test]
    fn test_snapshot_survives_later_writes() {
        let store = DetectionStore::new(["front"]).unwrap();
        store.replace("front", vec![detection("note", 1.0)]).unwrap();
        let before = store.snapshot("front").unwrap();
        store.clear("front").unwrap();

        assert_eq!(before.len(), 1, "Old snapshot is unaffected by the swap");
        assert!(store.snapshot("front").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_camera_is_an_error() {
        let store = DetectionStore::new(["front"]).unwrap();
        assert_eq!(
            store.replace("side", Vec::new()),
            Err(StoreError::UnknownCamera("side".into()))
        );
        assert!(store.snapshot("side").is_err());
    }

    #[test]
    fn test_duplicate_camera_names_rejected() {
        let err = DetectionStore::new(["front", "front"]).unwrap_err();
        assert_eq!(err, StoreError::DuplicateCamera("front".into()));
    }

    #[test]
    fn test_snapshot_all_keeps_registration_order() {
        let store = DetectionStore::new(["c", "a", "b"]).unwrap();
        store.replace("a", vec![detection("note", 1.0)]).unwrap();
        let names: Vec<&str> = store.snapshot_all().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
