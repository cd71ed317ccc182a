//! Server-sent event text framing. One-way: nothing is ever parsed back.

use crate::events::SseEvent;

/// The comment line sent as a liveness keepalive.
pub(crate) const KEEPALIVE: &[u8] = b": ping\n\n";

/// Formats one event: optional `event:`/`id:`/`retry:` fields, one `data:`
/// line per newline-separated piece of the payload, blank-line terminator.
pub(crate) fn format_event(event: &SseEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.data.len() + 32);
    if let Some(name) = &event.event {
        out.extend_from_slice(b"event:");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    for line in event.data.split('\n') {
        out.extend_from_slice(b"data:");
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    if let Some(id) = &event.id {
        out.extend_from_slice(b"id:");
        out.extend_from_slice(id.as_bytes());
        out.push(b'\n');
    }
    if let Some(retry) = event.retry {
        out.extend_from_slice(b"retry:");
        out.extend_from_slice(retry.to_string().as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out
}

#[cfg(test)]
mod format {
    use super::*;

    fn text(event: &SseEvent) -> String {
        String::from_utf8(format_event(event)).unwrap()
    }

    #[test]
    fn data_only() {
        assert_eq!(text(&SseEvent::data("A")), "data:A\n\n");
    }

    #[test]
    fn all_fields() {
        let event = SseEvent {
            event: Some("tick".into()),
            data: "42".into(),
            id: Some("7".into()),
            retry: Some(1500),
        };
        assert_eq!(text(&event), "event:tick\ndata:42\nid:7\nretry:1500\n\n");
    }

    #[test]
    fn multiline_data_splits() {
        assert_eq!(
            text(&SseEvent::data("one\ntwo\nthree")),
            "data:one\ndata:two\ndata:three\n\n"
        );
    }

    #[test]
    fn empty_data_still_terminates() {
        assert_eq!(text(&SseEvent::data("")), "data:\n\n");
    }

    #[test]
    fn stream_concatenation() {
        let wire: Vec<u8> = ["A", "B", "C"]
            .into_iter()
            .flat_map(|d| format_event(&SseEvent::data(d)))
            .collect();
        assert_eq!(wire, b"data:A\n\ndata:B\n\ndata:C\n\n");
    }
}
