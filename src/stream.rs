use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const LABEL_HEADER: &str = "X-Detected-Label";

#[derive(Error, Debug, PartialEq)]
pub enum StreamError {
    #[error("Label {0:?} contains a line break and cannot be sent as a header")]
    InvalidLabel(String),
}

/// Wraps one JPEG in a multipart part carrying the detected label as a header.
///
/// The part has no `Content-Length`; clients split on the boundary.
pub fn encode_chunk(label: &str, jpeg: &[u8]) -> Result<Bytes, StreamError> {
    if label.contains(['\r', '\n']) {
        return Err(StreamError::InvalidLabel(label.to_string()));
    }

    let part_header = format!(
        "--{}\r\n{}: {}\r\nContent-Type: image/jpeg\r\n\r\n",
        FRAME_BOUNDARY, LABEL_HEADER, label
    );
    let mut body = BytesMut::with_capacity(part_header.len() + jpeg.len() + 2);
    body.put_slice(part_header.as_bytes());
    body.put_slice(jpeg);
    body.put_slice(b"\r\n");
    Ok(body.freeze())
}

#[cfg(test)]
pub(crate) fn parse_chunk(chunk: &[u8]) -> Option<(String, Vec<u8>)> {
    let rest = chunk.strip_prefix(format!("--{}\r\n", FRAME_BOUNDARY).as_bytes())?;
    let header_end = rest.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&rest[..header_end]).ok()?;
    let payload = rest[header_end + 4..].strip_suffix(b"\r\n")?;

    let label = headers.split("\r\n").find_map(|line| {
        line.strip_prefix(LABEL_HEADER)
            .and_then(|value| value.strip_prefix(": "))
    })?;
    Some((label.to_string(), payload.to_vec()))
}
