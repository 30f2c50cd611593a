use crate::backend::{InferenceParams, RawDetection};
use crate::errors::InferenceError;
use crate::processing::pre::Letterbox;
use fusion::BoundingBox;
use ndarray::{ArrayViewD, Axis};

/// Decode a YOLO detection head into boxes in original frame pixels.
///
/// Accepts `[1, 4 + classes, anchors]` (the exported layout) as well as the
/// transposed `[1, anchors, 4 + classes]`. Boxes arrive as cxcywh in model
/// input pixels.
#[tracing::instrument(level = "debug", skip_all)]
pub fn decode_yolo(
    output: &ArrayViewD<f32>,
    letterbox: &Letterbox,
    params: &InferenceParams,
) -> Result<Vec<RawDetection>, InferenceError> {
    let shape = output.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(InferenceError::UnexpectedOutputShape(shape));
    }

    let view = output.index_axis(Axis(0), 0);
    let rows = if shape[1] <= shape[2] {
        view
    } else {
        view.reversed_axes()
    };

    let channels = rows.shape()[0];
    if channels <= 4 {
        return Err(InferenceError::UnexpectedOutputShape(shape));
    }

    let mut candidates = Vec::new();
    for anchor in rows.axis_iter(Axis(1)) {
        let (class_id, confidence) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (id, score)| {
                if score > best.1 { (id, score) } else { best }
            });

        if confidence < params.confidence_threshold {
            continue;
        }

        let (x1, y1, x2, y2) = cxcywh_to_xyxy(anchor[0], anchor[1], anchor[2], anchor[3]);
        candidates.push(RawDetection {
            class_id,
            confidence,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        });
    }

    let kept = non_max_suppression(candidates, params.iou_threshold);

    tracing::trace!(kept = kept.len(), "Decoded detections");

    Ok(kept
        .into_iter()
        .map(|det| RawDetection {
            bbox: letterbox.to_original(det.bbox),
            ..det
        })
        .collect())
}

/// Greedy per-class suppression: highest confidence first, drop anything that
/// overlaps a kept box of the same class by more than `iou_threshold`.
pub fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[inline]
fn cxcywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
    (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
}
