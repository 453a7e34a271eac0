use serde::Serialize;

/// Axis-aligned detection box in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Left edge.
    pub xmin: f32,
    /// Top edge.
    pub ymin: f32,
    /// Right edge.
    pub xmax: f32,
    /// Bottom edge.
    pub ymax: f32,
    /// Score of the winning class.
    pub confidence: f32,
    /// Index of the winning class.
    pub class: u32,
}

impl BoundingBox {
    /// Width of the box, zero for degenerate boxes.
    pub fn width(&self) -> f32 {
        (self.xmax - self.xmin).max(0.)
    }

    /// Height of the box, zero for degenerate boxes.
    pub fn height(&self) -> f32 {
        (self.ymax - self.ymin).max(0.)
    }

    /// Area of the box.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Restrict the box to a `width` x `height` frame.
    pub fn clamp(self, width: f32, height: f32) -> Self {
        Self {
            xmin: self.xmin.clamp(0., width),
            ymin: self.ymin.clamp(0., height),
            xmax: self.xmax.clamp(0., width),
            ymax: self.ymax.clamp(0., height),
            ..self
        }
    }
}

/// Intersection over union of two boxes, using inclusive pixel extents.
pub fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let b1_area = (b1.xmax - b1.xmin + 1.) * (b1.ymax - b1.ymin + 1.);
    let b2_area = (b2.xmax - b2.xmin + 1.) * (b2.ymax - b2.ymin + 1.);
    let i_w = (b1.xmax.min(b2.xmax) - b1.xmin.max(b2.xmin) + 1.).max(0.);
    let i_h = (b1.ymax.min(b2.ymax) - b1.ymin.max(b2.ymin) + 1.).max(0.);
    let i_area = i_w * i_h;
    i_area / (b1_area + b2_area - i_area)
}

/// Per-class non-maximum suppression.
///
/// Each inner vector holds the candidates of one class. On return it holds
/// the kept boxes sorted by descending confidence; a box is dropped when its
/// IoU with an already kept box is above `threshold`.
pub fn non_maximum_suppression(bboxes: &mut [Vec<BoundingBox>], threshold: f32) {
    for bboxes_for_class in bboxes.iter_mut() {
        bboxes_for_class.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        let mut kept = 0;
        for index in 0..bboxes_for_class.len() {
            let candidate = bboxes_for_class[index];
            let overlaps = bboxes_for_class[..kept]
                .iter()
                .any(|prev| iou(prev, &candidate) > threshold);
            if !overlaps {
                bboxes_for_class.swap(kept, index);
                kept += 1;
            }
        }
        bboxes_for_class.truncate(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(xmin: f32, ymin: f32, xmax: f32, ymax: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence,
            class: 0,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0., 0., 9., 9., 1.);
        assert_eq!(iou(&a, &a), 1.0);

        let far = bbox(100., 100., 109., 109., 1.);
        assert_eq!(iou(&a, &far), 0.0);

        // 10x10 boxes sharing a 5x10 strip: 50 / 150
        let half = bbox(5., 0., 14., 9., 1.);
        assert!((iou(&a, &half) - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_non_maximum_suppression() {
        let mut bboxes = vec![vec![
            bbox(0., 0., 1., 1., 0.5),
            bbox(0., 0., 1., 1., 0.5),
        ]];

        non_maximum_suppression(&mut bboxes, 0.5);

        assert_eq!(bboxes[0].len(), 1);
        assert_eq!(bboxes[0][0].confidence, 0.5);
    }

    #[test]
    fn test_non_maximum_suppression_keeps_disjoint_and_orders() {
        let mut bboxes = vec![
            vec![
                bbox(0., 0., 10., 10., 0.6),
                bbox(50., 50., 60., 60., 0.9),
                bbox(1., 1., 10., 10., 0.8),
            ],
            vec![],
        ];

        non_maximum_suppression(&mut bboxes, 0.45);

        let confidences: Vec<f32> = bboxes[0].iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8]);
        assert!(bboxes[1].is_empty());
    }

    #[test]
    fn test_non_maximum_suppression_nan_does_not_panic() {
        let mut bboxes = vec![vec![
            bbox(0., 0., 1., 1., f32::NAN),
            bbox(5., 5., 6., 6., 0.3),
        ]];
        non_maximum_suppression(&mut bboxes, 0.5);
        assert_eq!(bboxes[0].len(), 2);
    }

    #[test]
    fn test_clamp_and_area() {
        let b = bbox(-5., -5., 20., 30., 0.7).clamp(10., 10.);
        assert_eq!((b.xmin, b.ymin, b.xmax, b.ymax), (0., 0., 10., 10.));
        assert_eq!(b.area(), 100.);
        assert_eq!(bbox(5., 5., 1., 1., 0.).area(), 0.);
    }
}
