use crate::detection::LabelColor;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ColorLabel {
    pub label: String,
    pub color: LabelColor,
}

/// Reads one `label, red, green, blue` line per class id.
pub fn load_yolov8_labels(filepath: &Path) -> io::Result<Vec<ColorLabel>> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels(reader: impl BufRead) -> io::Result<Vec<ColorLabel>> {
    let mut color_labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() != 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }

        let label = parts[0].trim().to_string();
        // Labels end up verbatim in a multipart header line.
        if label.contains(['\r', '\n']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Label contains a line break: {:?}", label),
            ));
        }

        let channel = |value: &str, name: &str| -> io::Result<u32> {
            value.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Invalid {} value", name))
            })
        };

        color_labels.push(ColorLabel {
            label,
            color: LabelColor {
                red: channel(parts[1], "red")?,
                green: channel(parts[2], "green")?,
                blue: channel(parts[3], "blue")?,
            },
        });
    }

    Ok(color_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_labels() {
        let input = "person, 255, 0, 0\ncat,0,255,0\n\n";
        let labels = parse_labels(Cursor::new(input)).unwrap();

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, "person");
        assert_eq!(
            labels[1].color,
            LabelColor {
                red: 0,
                green: 255,
                blue: 0
            }
        );
    }

    #[test]
    fn test_parse_labels_rejects_bad_lines() {
        assert!(parse_labels(Cursor::new("person, 255, 0\n")).is_err());
        assert!(parse_labels(Cursor::new("person, red, 0, 0\n")).is_err());
    }

    #[test]
    fn test_shipped_coco_labels() {
        let labels = load_yolov8_labels(Path::new("models/coco_labels.txt")).unwrap();

        assert_eq!(labels.len(), 80);
        assert_eq!(labels[15].label, "cat");
    }
}
