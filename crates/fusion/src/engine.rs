use crate::{
    detection::{Detection, FusedGroup, RobotPose, Vec2},
    geometry::convert_to_global_position,
    pacing::CyclePacing,
    store::DetectionStore,
    table::{TableError, TableValue, TelemetryTable},
};
use common::span_debug;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

pub const DETECTED_CLASSES_KEY: &str = "detected_classes";

#[derive(Debug, Clone)]
pub struct FusionSettings {
    /// Detections of one class closer than this (metres) are one object.
    pub combine_threshold: f64,
    /// Table key holding `[x, y, heading]` of the robot.
    pub robot_pose_key: String,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            combine_threshold: 0.25,
            robot_pose_key: "robot_position".to_string(),
        }
    }
}

/// Outcome of a single fusion cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub detections_in: usize,
    pub objects_out: usize,
    pub duplicates_removed: usize,
    pub classes_published: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FusionStats {
    pub cycles: u64,
    pub publish_failures: u64,
    pub overruns: u64,
}

struct FusionMetrics {
    cycle_duration: Histogram<f64>,
    cycles: Counter<u64>,
    duplicates_removed: Counter<u64>,
}

impl FusionMetrics {
    fn init() -> Self {
        let meter = global::meter("fusion");
        let latency_buckets = [
            0.0001, 0.0002, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1,
        ];
        Self {
            cycle_duration: meter
                .f64_histogram("fusion_cycle_duration_seconds")
                .with_description("Time to collect, deduplicate and publish one cycle")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            cycles: meter
                .u64_counter("fusion_cycles_total")
                .with_description("Total fusion cycles completed")
                .build(),
            duplicates_removed: meter
                .u64_counter("fusion_duplicates_removed_total")
                .with_description("Detections merged into a closer detection of the same class")
                .build(),
        }
    }
}

/// Bucket detections by class label. Within a bucket, order follows the
/// iteration order of `snapshots`.
pub fn group_by_class<'a, I>(snapshots: I) -> BTreeMap<String, Vec<Detection>>
where
    I: IntoIterator<Item = &'a [Detection]>,
{
    let mut buckets: BTreeMap<String, Vec<Detection>> = BTreeMap::new();
    for detections in snapshots {
        for detection in detections {
            buckets
                .entry(detection.class_name.clone())
                .or_default()
                .push(detection.clone());
        }
    }
    buckets
}

/// Greedy nearest-wins clustering of one class.
///
/// Sorts by distance (stable, so ties keep collection order). Then, for each
/// position `i` below the starting length minus one, the first later entry
/// within `threshold` of entry `i` is absorbed into it and the scan for that
/// `i` stops. An anchor absorbs at most one neighbour per pass, so a
/// tight chain of three leaves two survivors.
pub fn deduplicate(mut detections: Vec<Detection>, threshold: f64) -> Vec<FusedGroup> {
    let _s = span_debug!("deduplicate");
    detections.sort_by(|a, b| a.distance.total_cmp(&b.distance));

    let mut groups: Vec<FusedGroup> = detections
        .into_iter()
        .map(|representative| FusedGroup {
            representative,
            members: 1,
        })
        .collect();

    let passes = groups.len().saturating_sub(1);
    for i in 0..passes {
        let neighbour = (i + 1..groups.len()).find(|&j| {
            groups[i]
                .representative
                .local_position
                .distance(groups[j].representative.local_position)
                < threshold
        });
        if let Some(j) = neighbour {
            let absorbed = groups.remove(j);
            groups[i].members += absorbed.members;
        }
    }

    groups
}

fn flatten_positions(points: impl Iterator<Item = Vec2>) -> Vec<f64> {
    points.flat_map(|p| [p.x, p.y]).collect()
}

/// Collects per-camera detections, merges duplicates and publishes the
/// result for every class seen since startup.
pub struct FusionEngine {
    store: Arc<DetectionStore>,
    table: Arc<dyn TelemetryTable>,
    settings: FusionSettings,
    known_classes: BTreeSet<String>,
    metrics: FusionMetrics,
}

impl FusionEngine {
    pub fn new(
        store: Arc<DetectionStore>,
        table: Arc<dyn TelemetryTable>,
        settings: FusionSettings,
    ) -> Self {
        Self {
            store,
            table,
            settings,
            known_classes: BTreeSet::new(),
            metrics: FusionMetrics::init(),
        }
    }

    pub fn known_classes(&self) -> impl Iterator<Item = &str> {
        self.known_classes.iter().map(String::as_str)
    }

    fn robot_pose(&self) -> RobotPose {
        self.table
            .get_number_array(&self.settings.robot_pose_key)
            .map(|values| RobotPose::from_array(&values))
            .unwrap_or_default()
    }

    /// Run one collect / group / sort / deduplicate / publish pass.
    pub fn run_cycle(&mut self) -> Result<CycleReport, TableError> {
        let snapshots = self.store.snapshot_all();
        let buckets = group_by_class(snapshots.iter().map(|(_, d)| &d[..]));
        drop(snapshots);

        let pose = self.robot_pose();
        let mut report = CycleReport::default();
        let mut fused: BTreeMap<String, Vec<FusedGroup>> = BTreeMap::new();

        for (class_name, detections) in buckets {
            let count = detections.len();
            let groups = deduplicate(detections, self.settings.combine_threshold);
            report.detections_in += count;
            report.objects_out += groups.len();
            report.duplicates_removed += count - groups.len();
            self.known_classes.insert(class_name.clone());
            fused.insert(class_name, groups);
        }

        let mut entries = Vec::with_capacity(self.known_classes.len() * 4 + 1);
        for class_name in &self.known_classes {
            let groups = fused.get(class_name).map(Vec::as_slice).unwrap_or_default();
            let reps = || groups.iter().map(|g| &g.representative);

            entries.push((
                format!("{class_name}_yaw_angles"),
                TableValue::NumberArray(reps().map(|d| d.bearing_deg).collect()),
            ));
            entries.push((
                format!("{class_name}_local_positions"),
                TableValue::NumberArray(flatten_positions(reps().map(|d| d.local_position))),
            ));
            entries.push((
                format!("{class_name}_global_positions"),
                TableValue::NumberArray(flatten_positions(
                    reps().map(|d| convert_to_global_position(d.local_position, &pose)),
                )),
            ));
            entries.push((
                format!("{class_name}_confidences"),
                TableValue::NumberArray(reps().map(|d| d.confidence as f64).collect()),
            ));
        }
        entries.push((
            DETECTED_CLASSES_KEY.to_string(),
            TableValue::StringArray(self.known_classes.iter().cloned().collect()),
        ));

        report.classes_published = self.known_classes.len();
        self.table.publish_batch(entries)?;
        Ok(report)
    }

    /// Run cycles at `interval` until `shutdown` is set.
    pub fn run(mut self, shutdown: &AtomicBool, interval: Duration) -> FusionStats {
        tracing::info!(
            cameras = self.store.cameras().len(),
            interval_ms = interval.as_millis() as u64,
            combine_threshold = self.settings.combine_threshold,
            "Fusion loop starting"
        );

        let mut pacing = CyclePacing::new(interval);
        let mut stats = FusionStats::default();

        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            let span = tracing::info_span!("fusion_cycle", cycle = stats.cycles);
            let _enter = span.enter();

            match self.run_cycle() {
                Ok(report) => {
                    self.metrics
                        .cycle_duration
                        .record(started.elapsed().as_secs_f64(), &[]);
                    self.metrics.cycles.add(1, &[]);
                    self.metrics
                        .duplicates_removed
                        .add(report.duplicates_removed as u64, &[]);

                    if stats.cycles.is_multiple_of(100) {
                        tracing::debug!(
                            cycles = stats.cycles,
                            detections = report.detections_in,
                            objects = report.objects_out,
                            duplicates = report.duplicates_removed,
                            classes = report.classes_published,
                            "Fusion status"
                        );
                    }
                }
                Err(e) => {
                    stats.publish_failures += 1;
                    tracing::warn!(error = %e, "Failed to publish fusion results");
                }
            }
            stats.cycles += 1;

            drop(_enter);
            pacing.wait(started);
        }

        stats.overruns = pacing.overruns();
        tracing::info!(
            cycles = stats.cycles,
            publish_failures = stats.publish_failures,
            overruns = stats.overruns,
            "Fusion loop stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Vec2};
    use crate::table::MemoryTable;

    fn det(class: &str, x: f64, y: f64) -> Detection {
        let local_position = Vec2::new(x, y);
        Detection {
            class_name: class.to_string(),
            confidence: 0.8,
            bbox: BoundingBox::default(),
            bearing_deg: -y.atan2(x).to_degrees(),
            local_position,
            distance: local_position.norm(),
        }
    }

    fn engine(cameras: &[&str]) -> (FusionEngine, Arc<DetectionStore>, Arc<MemoryTable>) {
        let store = Arc::new(DetectionStore::new(cameras.iter().copied()).unwrap());
        let table = Arc::new(MemoryTable::new());
        let engine = FusionEngine::new(
            Arc::clone(&store),
            table.clone(),
            FusionSettings::default(),
        );
        (engine, store, table)
    }

    #[test]
    fn test_dedup_keeps_closest_of_a_pair() {
        let groups = deduplicate(vec![det("note", 2.1, 0.0), det("note", 2.0, 0.0)], 0.25);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].representative.local_position, Vec2::new(2.0, 0.0));
        assert_eq!(groups[0].members, 2);
    }

    #[test]
    fn test_dedup_single_detection_passes_through() {
        let d = det("note", 1.0, 1.0);
        let groups = deduplicate(vec![d.clone()], 0.25);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].representative, d);
    }

    #[test]
    fn test_dedup_output_sorted_and_separated() {
        let input = vec![
            det("note", 5.0, 0.0),
            det("note", 1.0, 0.0),
            det("note", 3.0, 0.1),
            det("note", 1.1, 0.0),
            det("note", 3.0, 0.0),
        ];
        let groups = deduplicate(input, 0.25);

        let distances: Vec<f64> = groups.iter().map(|g| g.representative.distance).collect();
        assert!(
            distances.windows(2).all(|w| w[0] <= w[1]),
            "Output must be ascending by distance: {:?}",
            distances
        );
        for (a, ga) in groups.iter().enumerate() {
            for gb in &groups[a + 1..] {
                let d = ga
                    .representative
                    .local_position
                    .distance(gb.representative.local_position);
                assert!(d >= 0.25, "Survivors {} apart should have merged", d);
            }
        }
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.iter().map(|g| g.members).sum::<usize>(), 5);
    }

    #[test]
    fn test_dedup_is_not_transitive() {
        // A~B and B~C but A and C are 0.4 apart
        let a = det("note", 1.0, 0.0);
        let b = det("note", 1.2, 0.0);
        let c = det("note", 1.4, 0.0);
        let groups = deduplicate(vec![c.clone(), b, a.clone()], 0.25);

        let survivors: Vec<&Detection> = groups.iter().map(|g| &g.representative).collect();
        assert_eq!(survivors, vec![&a, &c]);
    }

    #[test]
    fn test_dedup_tight_chain_absorbs_one_neighbour_per_anchor() {
        let groups = deduplicate(
            vec![
                det("note", 1.1, 0.0),
                det("note", 1.0, 0.0),
                det("note", 1.05, 0.0),
            ],
            0.25,
        );

        let survivors: Vec<Vec2> = groups
            .iter()
            .map(|g| g.representative.local_position)
            .collect();
        assert_eq!(survivors, vec![Vec2::new(1.0, 0.0), Vec2::new(1.1, 0.0)]);
        assert_eq!(groups[0].members, 2);
        assert_eq!(groups[1].members, 1);
    }

    #[test]
    fn test_dedup_later_anchor_takes_leftover_neighbour() {
        // Sorted: A 1.0, C 1.005, D 1.051, B 1.1. A takes C, then D takes B
        let groups = deduplicate(
            vec![
                det("note", 1.0, 0.0),
                det("note", 1.1, 0.0),
                det("note", 1.0, 0.1),
                det("note", 1.05, -0.05),
            ],
            0.25,
        );

        let survivors: Vec<Vec2> = groups
            .iter()
            .map(|g| g.representative.local_position)
            .collect();
        assert_eq!(survivors, vec![Vec2::new(1.0, 0.0), Vec2::new(1.05, -0.05)]);
        assert_eq!(groups.iter().map(|g| g.members).collect::<Vec<_>>(), vec![2, 2]);
    }

    #[test]
    fn test_dedup_merges_pair_five_centimetres_apart() {
        let groups = deduplicate(vec![det("note", 0.05, 0.0), det("note", 0.0, 0.0)], 0.25);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].representative.local_position, Vec2::new(0.0, 0.0));
        assert_eq!(groups[0].members, 2);
    }

    #[test]
    fn test_dedup_leaves_disjoint_detections_untouched() {
        let input = vec![
            det("note", 4.0, 0.0),
            det("note", 1.0, 0.0),
            det("note", 0.0, 2.5),
            det("note", 1.0, 1.0),
            det("note", -3.0, 0.0),
        ];
        for (a, da) in input.iter().enumerate() {
            for db in &input[a + 1..] {
                assert!(da.local_position.distance(db.local_position) >= 0.25);
            }
        }

        let mut expected = input.clone();
        expected.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let groups = deduplicate(input, 0.25);
        let survivors: Vec<Detection> = groups.iter().map(|g| g.representative.clone()).collect();
        assert_eq!(survivors, expected);
        assert!(groups.iter().all(|g| g.members == 1));
    }

    #[test]
    fn test_dedup_equal_distances_keep_input_order() {
        let first = det("note", 2.0, 0.0);
        let second = Detection {
            distance: first.distance,
            ..det("note", 2.1, 0.0)
        };

        let groups = deduplicate(vec![first.clone(), second.clone()], 0.25);
        assert_eq!(groups[0].representative, first);

        let groups = deduplicate(vec![second.clone(), first], 0.25);
        assert_eq!(groups[0].representative, second, "Ties resolve by input order");
    }

    #[test]
    fn test_group_by_class_across_cameras() {
        let front = vec![det("note", 1.0, 0.0), det("robot", 3.0, 0.0)];
        let back = vec![det("note", -1.0, 0.0)];
        let buckets = group_by_class([&front[..], &back[..]]);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets["note"].len(), 2);
        assert_eq!(buckets["robot"].len(), 1);
    }

    #[test]
    fn test_cycle_merges_cameras_and_publishes() {
        let (mut engine, store, table) = engine(&["left", "right"]);
        store.replace("left", vec![det("note", 2.0, 0.05)]).unwrap();
        store.replace("right", vec![det("note", 2.05, 0.0)]).unwrap();

        let report = engine.run_cycle().unwrap();
        assert_eq!(report.detections_in, 2);
        assert_eq!(report.objects_out, 1);
        assert_eq!(report.duplicates_removed, 1);

        let local = table.get_number_array("note_local_positions").unwrap();
        assert_eq!(local, vec![2.0, 0.05], "Closest detection represents the group");
        assert_eq!(table.get_number_array("note_yaw_angles").unwrap().len(), 1);
        assert_eq!(table.get_number_array("note_confidences").unwrap(), vec![0.8f32 as f64]);
        assert_eq!(
            table.get("detected_classes"),
            Some(TableValue::StringArray(vec!["note".into()]))
        );
    }

    #[test]
    fn test_global_positions_follow_robot_pose() {
        let (mut engine, store, table) = engine(&["front"]);
        table
            .put_number_array("robot_position", vec![1.0, 2.0, std::f64::consts::FRAC_PI_2])
            .unwrap();
        store.replace("front", vec![det("note", 3.0, 0.0)]).unwrap();

        engine.run_cycle().unwrap();

        let global = table.get_number_array("note_global_positions").unwrap();
        assert!((global[0] - 1.0).abs() < 1e-9, "x = {}", global[0]);
        assert!((global[1] - 5.0).abs() < 1e-9, "y = {}", global[1]);
    }

    #[test]
    fn test_vanished_class_is_published_empty() {
        let (mut engine, store, table) = engine(&["front"]);
        store
            .replace("front", vec![det("note", 1.0, 0.0), det("cone", 2.0, 0.0)])
            .unwrap();
        engine.run_cycle().unwrap();
        assert_eq!(table.get_number_array("note_yaw_angles").unwrap().len(), 1);

        store.replace("front", vec![det("cone", 2.0, 0.0)]).unwrap();
        engine.run_cycle().unwrap();

        for suffix in ["yaw_angles", "local_positions", "global_positions", "confidences"] {
            assert_eq!(
                table.get_number_array(&format!("note_{suffix}")),
                Some(vec![]),
                "note_{suffix} must be cleared, not left stale"
            );
        }
        assert_eq!(table.get_number_array("cone_yaw_angles").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_store_publishes_nothing_stale() {
        let (mut engine, store, table) = engine(&["front"]);
        let report = engine.run_cycle().unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(
            table.get("detected_classes"),
            Some(TableValue::StringArray(vec![]))
        );

        store.replace("front", vec![det("note", 1.0, 0.0)]).unwrap();
        engine.run_cycle().unwrap();
        store.clear("front").unwrap();
        let report = engine.run_cycle().unwrap();

        assert_eq!(report.classes_published, 1);
        assert_eq!(table.get_number_array("note_local_positions"), Some(vec![]));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let (engine, _store, _table) = engine(&["front"]);
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || engine.run(&flag, Duration::from_millis(5)));

        std::thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::Relaxed);
        let stats = handle.join().unwrap();

        assert!(stats.cycles >= 1, "Expected at least one cycle");
        assert_eq!(stats.publish_failures, 0);
    }
}
