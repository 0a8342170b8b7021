#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelColor {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl LabelColor {
    pub const BLACK: LabelColor = LabelColor {
        red: 0,
        green: 0,
        blue: 0,
    };
}

/// One box reported by the detector for a single frame, in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub class_id: usize,
    pub class_label: String,
    pub confidence: f32,
    pub color: LabelColor,
}

impl Detection {
    pub fn caption(&self) -> String {
        format!("{}: {:.2}", self.class_label, self.confidence)
    }
}

pub fn retain_confident(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

/// Highest confidence wins; equal scores keep the detector's order.
pub fn primary_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.confidence >= d.confidence => Some(b),
        _ => Some(d),
    })
}

#[cfg(test)]
pub(crate) fn detection(label: &str, confidence: f32) -> Detection {
    Detection {
        x1: 10,
        y1: 20,
        x2: 100,
        y2: 150,
        class_id: 0,
        class_label: label.to_string(),
        confidence,
        color: LabelColor {
            red: 0,
            green: 255,
            blue: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_confident_drops_low_scores() {
        let detections = vec![
            detection("person", 0.95),
            detection("cat", 0.49),
            detection("dog", 0.5),
        ];

        let retained = retain_confident(detections, 0.5);
        let labels: Vec<_> = retained.iter().map(|d| d.class_label.as_str()).collect();

        assert_eq!(labels, vec!["person", "dog"]);
    }

    #[test]
    fn test_primary_detection_prefers_confidence_then_order() {
        let detections = vec![
            detection("cat", 0.6),
            detection("person", 0.9),
            detection("dog", 0.9),
        ];

        let primary = primary_detection(&detections).unwrap();
        assert_eq!(primary.class_label, "person");
        assert!(primary_detection(&[]).is_none());
    }

    #[test]
    fn test_caption_format() {
        assert_eq!(detection("cat", 0.876).caption(), "cat: 0.88");
    }
}
