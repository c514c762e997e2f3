//! Server-Sent Events for streamed replies

use crate::conversation::Message;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// One event of a streamed turn
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A fragment of assistant text
    Chunk { content: String },
    /// The turn finished; carries the complete reply
    Done { message: Message },
    Error { message: String },
}

/// Turn a channel of turn events into an SSE response that ends with the turn
pub fn reply_stream(
    events: mpsc::UnboundedReceiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(events).map(|event| Ok(to_sse_event(event)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse_event(event: StreamEvent) -> Event {
    let (event_type, data) = match event {
        StreamEvent::Chunk { content } => (
            "chunk",
            json!({
                "type": "chunk",
                "content": content
            }),
        ),
        StreamEvent::Done { message } => (
            "done",
            json!({
                "type": "done",
                "message": message
            }),
        ),
        StreamEvent::Error { message } => (
            "error",
            json!({
                "type": "error",
                "message": message
            }),
        ),
    };

    Event::default().event(event_type).data(data.to_string())
}

