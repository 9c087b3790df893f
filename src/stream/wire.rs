use crate::models::SseFrame;

/// Encode a frame in `text/event-stream` form.
///
/// The event name is the frame type; the data line is the whole frame as
/// single-line JSON.
pub fn encode_frame(frame: &SseFrame) -> String {
    let data = serde_json::to_string(frame).unwrap_or_else(|e| {
        serde_json::json!({
            "type": "ERROR",
            "data": { "message": format!("frame encoding failed: {}", e), "recoverable": false },
            "timestamp": frame.timestamp,
        })
        .to_string()
    });
    format!("event: {}\ndata: {}\n\n", frame.frame_type.as_str(), data)
}
