//! Subscribers that plug components into the bus.
//!
//! Event handlers subscribe directly. Processors and outputs are wrapped:
//! a processor takes `input_received` events and streams its result to each
//! output on a stream of its own, announced by a `stream_started` event
//! targeted at that output. An output reads each announced stream on a
//! task of its own, so a slow or blocked stream never holds up the others,
//! or takes `agent_response` events whole.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use woodwork_common::constants::{TOPIC_AGENT_RESPONSE, TOPIC_STREAM_STARTED};
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::StreamId;

use super::event::Event;
use super::stream::{FanOutWriter, StreamReader};
use super::{BusHandle, Subscriber};
use crate::component::{Component, EventHandler, OutputSink, Payload, Processor};
use crate::context::panic_message;

fn follow_up(cause: &Event, topic: &str, payload: Payload, source: &str) -> Event {
    let event = Event::new(topic, payload).with_source(source);
    match &cause.session_id {
        Some(session) => event.with_session(session.clone()),
        None => event,
    }
}

fn missing_role(component: &str, role: &str) -> WoodworkError {
    WoodworkError::component(component, format!("does not implement {role}"))
}

/// Delivers events to a component's own [`EventHandler`].
pub struct HandlerSubscriber {
    name: String,
    component: Arc<dyn Component>,
}

impl HandlerSubscriber {
    /// Wraps the handler of `component`.
    #[must_use]
    pub fn new(name: impl Into<String>, component: Arc<dyn Component>) -> Self {
        Self {
            name: name.into(),
            component,
        }
    }

    fn handler(&self) -> Result<&dyn EventHandler> {
        self.component
            .as_event_handler()
            .ok_or_else(|| missing_role(&self.name, "an event handler"))
    }
}

#[async_trait]
impl Subscriber for HandlerSubscriber {
    async fn deliver(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        self.handler()?.handle(event, bus).await
    }
}

/// Runs a processor for each `input_received` event.
pub struct ProcessorAdapter {
    name: String,
    component: Arc<dyn Component>,
    outputs: Vec<String>,
}

impl ProcessorAdapter {
    /// Wraps `component`, streaming its results to `outputs`. With no
    /// outputs the complete result is published as `agent_response`.
    #[must_use]
    pub fn new(name: impl Into<String>, component: Arc<dyn Component>, outputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            component,
            outputs,
        }
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Processor) -> Result<T> + Send + 'static,
    {
        let component = Arc::clone(&self.component);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let processor = component
                .as_processor()
                .ok_or_else(|| missing_role(&name, "a processor"))?;
            work(processor)
        })
        .await
        .map_err(|e| {
            let message = if e.is_panic() {
                format!("panicked: {}", panic_message(e.into_panic().as_ref()))
            } else {
                e.to_string()
            };
            WoodworkError::component(&self.name, message)
        })?
    }
}

#[async_trait]
impl Subscriber for ProcessorAdapter {
    async fn deliver(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        let input = event
            .payload
            .get("input")
            .cloned()
            .unwrap_or_else(|| event.payload.clone());

        if self.outputs.is_empty() {
            let output = self.run_blocking(move |p| p.process(input)).await?;
            let _ = bus
                .emit(follow_up(event, TOPIC_AGENT_RESPONSE, output, &self.name))
                .await?;
            return Ok(());
        }

        let mut writers = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let writer = bus.open_stream();
            let announce = follow_up(
                event,
                TOPIC_STREAM_STARTED,
                json!({ "stream_id": writer.id(), "source": self.name }),
                &self.name,
            )
            .with_target(output);
            let _ = bus.emit(announce).await?;
            writers.push(writer);
        }
        tracing::debug!(processor = %self.name, streams = writers.len(), "streaming result");
        self.run_blocking(move |p| {
            let mut fan_out = FanOutWriter::new(writers);
            p.process_streaming(input, &mut fan_out)
        })
        .await
    }
}

/// Feeds streamed and whole results into an output sink.
#[derive(Clone)]
pub struct OutputAdapter {
    name: String,
    component: Arc<dyn Component>,
}

impl OutputAdapter {
    /// Wraps the sink of `component`.
    #[must_use]
    pub fn new(name: impl Into<String>, component: Arc<dyn Component>) -> Self {
        Self {
            name: name.into(),
            component,
        }
    }

    fn sink(&self) -> Result<&dyn OutputSink> {
        self.component
            .as_output()
            .ok_or_else(|| missing_role(&self.name, "an output"))
    }

    /// Claims the announced stream and hands it to a tracked task.
    fn consume_stream(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        let id = event
            .payload
            .get("stream_id")
            .and_then(serde_json::Value::as_str)
            .map(StreamId::new)
            .ok_or_else(|| WoodworkError::component(&self.name, "stream_started event without stream_id"))?;
        let reader = bus.receive_chunks(&id)?;
        let adapter = self.clone();
        bus.spawn_tracked(async move { adapter.drain(reader).await });
        Ok(())
    }

    async fn drain(self, mut reader: StreamReader) {
        let id = reader.id().clone();
        if let Err(e) = self.read_into_sink(&mut reader).await {
            tracing::warn!(output = %self.name, stream = %id, error = %e, "stream delivery failed");
        }
    }

    async fn read_into_sink(&self, reader: &mut StreamReader) -> Result<()> {
        let sink = self.sink()?;
        let streaming = sink.as_streaming();

        let mut collected = Vec::new();
        while let Some(next) = reader.next_chunk().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(output = %self.name, stream = %reader.id(), error = %e, "discarding partial result");
                    return Ok(());
                }
            };
            if let Some(streaming) = streaming {
                streaming.deliver_chunk(&chunk.stream, chunk.data, chunk.is_final)?;
            } else {
                collected.push(chunk.data);
                if chunk.is_final {
                    sink.deliver(assemble(std::mem::take(&mut collected)))?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for OutputAdapter {
    async fn deliver(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        if event.topic == TOPIC_STREAM_STARTED {
            self.consume_stream(event, bus)
        } else {
            self.sink()?.deliver(event.payload.clone())
        }
    }
}

/// Joins the chunks of a stream into one payload: text chunks are
/// concatenated, a single chunk is kept as is, anything else becomes a list.
#[must_use]
pub fn assemble(mut chunks: Vec<Payload>) -> Payload {
    if chunks.len() == 1 {
        return chunks.remove(0);
    }
    if chunks.iter().all(Payload::is_string) {
        let text: String = chunks.iter().filter_map(Payload::as_str).collect();
        return Payload::String(text);
    }
    Payload::Array(chunks)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use woodwork_common::config::BusConfig;
    use woodwork_common::constants::TOPIC_INPUT_RECEIVED;

    use super::*;
    use crate::bus::MessageBus;
    use crate::component::{ChunkWriter, StreamingSink};

    struct Upper;

    impl Component for Upper {
        fn as_processor(&self) -> Option<&dyn Processor> {
            Some(self)
        }
    }

    impl Processor for Upper {
        fn process(&self, input: Payload) -> Result<Payload> {
            Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
        }

        fn process_streaming(&self, input: Payload, writer: &mut dyn ChunkWriter) -> Result<()> {
            let text = input.as_str().unwrap_or_default().to_uppercase();
            let words: Vec<&str> = text.split(' ').collect();
            for (i, word) in words.iter().enumerate() {
                let piece = if i + 1 < words.len() { format!("{word} ") } else { (*word).to_string() };
                writer.write_chunk(json!(piece), i + 1 == words.len())?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Sink {
        whole: Mutex<Vec<Payload>>,
        chunks: Mutex<Vec<(Payload, bool)>>,
        streaming: bool,
    }

    impl Component for Sink {
        fn as_output(&self) -> Option<&dyn OutputSink> {
            Some(self)
        }
    }

    impl OutputSink for Sink {
        fn deliver(&self, payload: Payload) -> Result<()> {
            self.whole.lock().unwrap().push(payload);
            Ok(())
        }

        fn as_streaming(&self) -> Option<&dyn StreamingSink> {
            self.streaming.then_some(self as &dyn StreamingSink)
        }
    }

    impl StreamingSink for Sink {
        fn deliver_chunk(&self, _stream: &StreamId, chunk: Payload, is_final: bool) -> Result<()> {
            self.chunks.lock().unwrap().push((chunk, is_final));
            Ok(())
        }
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    async fn settle(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processor_streams_to_each_output() {
        let whole = Arc::new(Sink::default());
        let live = Arc::new(Sink {
            streaming: true,
            ..Sink::default()
        });
        let mut bus = MessageBus::new(BusConfig::default());
        bus.subscribe(
            "upper",
            &topics(&[TOPIC_INPUT_RECEIVED]),
            Arc::new(ProcessorAdapter::new("upper", Arc::new(Upper), vec!["whole".into(), "live".into()])),
        )
        .expect("processor");
        for (name, sink) in [("whole", &whole), ("live", &live)] {
            let component: Arc<dyn Component> = Arc::clone(sink) as Arc<dyn Component>;
            bus.subscribe(
                name,
                &topics(&[TOPIC_STREAM_STARTED, TOPIC_AGENT_RESPONSE]),
                Arc::new(OutputAdapter::new(name, component)),
            )
            .expect("output");
        }
        bus.start();
        let handle = bus.handle();
        let _ = handle
            .emit(Event::new(TOPIC_INPUT_RECEIVED, json!({ "input": "hello big world" })))
            .await
            .expect("emit");

        settle(|| !whole.whole.lock().unwrap().is_empty() && live.chunks.lock().unwrap().len() == 3).await;
        let report = bus.shutdown().await;
        assert_eq!(report.stats.dead_lettered, 0);

        assert_eq!(*whole.whole.lock().unwrap(), vec![json!("HELLO BIG WORLD")]);
        let chunks = live.chunks.lock().unwrap().clone();
        assert_eq!(
            chunks,
            vec![
                (json!("HELLO "), false),
                (json!("BIG "), false),
                (json!("WORLD"), true)
            ]
        );
    }

    /// Streams `count` copies of `letter`, one per chunk.
    struct Letters {
        letter: &'static str,
        count: usize,
    }

    impl Component for Letters {
        fn as_processor(&self) -> Option<&dyn Processor> {
            Some(self)
        }
    }

    impl Processor for Letters {
        fn process(&self, _input: Payload) -> Result<Payload> {
            Ok(json!(self.letter.repeat(self.count)))
        }

        fn process_streaming(&self, _input: Payload, writer: &mut dyn ChunkWriter) -> Result<()> {
            for i in 0..self.count {
                writer.write_chunk(json!(self.letter), i + 1 == self.count)?;
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crossed_streams_beyond_capacity_all_complete() {
        let count = 40;
        let config = BusConfig {
            stream_capacity: 2,
            ..BusConfig::default()
        };
        let sinks = [Arc::new(Sink::default()), Arc::new(Sink::default())];
        let mut bus = MessageBus::new(config);
        for (name, letter, outputs) in [("px", "x", ["o1", "o2"]), ("py", "y", ["o2", "o1"])] {
            let processor = Arc::new(Letters { letter, count });
            bus.subscribe(
                name,
                &topics(&[TOPIC_INPUT_RECEIVED]),
                Arc::new(ProcessorAdapter::new(name, processor, outputs.map(String::from).to_vec())),
            )
            .expect("processor");
        }
        for (name, sink) in ["o1", "o2"].into_iter().zip(&sinks) {
            bus.subscribe(
                name,
                &topics(&[TOPIC_STREAM_STARTED, TOPIC_AGENT_RESPONSE]),
                Arc::new(OutputAdapter::new(name, Arc::clone(sink) as Arc<dyn Component>)),
            )
            .expect("output");
        }
        bus.start();
        let _ = bus
            .handle()
            .emit(Event::new(TOPIC_INPUT_RECEIVED, json!({ "input": "go" })))
            .await
            .expect("emit");

        settle(|| sinks.iter().all(|s| s.whole.lock().unwrap().len() == 2)).await;
        let report = bus.shutdown().await;
        assert_eq!(report.streams_truncated, 0);
        assert_eq!(report.stats.dead_lettered, 0);

        let expected = vec![json!("x".repeat(count)), json!("y".repeat(count))];
        for sink in &sinks {
            let mut got = sink.whole.lock().unwrap().clone();
            got.sort_by_key(ToString::to_string);
            assert_eq!(got, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processor_without_outputs_publishes_response() {
        let sink = Arc::new(Sink::default());
        let mut bus = MessageBus::new(BusConfig::default());
        bus.subscribe(
            "upper",
            &topics(&[TOPIC_INPUT_RECEIVED]),
            Arc::new(ProcessorAdapter::new("upper", Arc::new(Upper), Vec::new())),
        )
        .expect("processor");
        bus.subscribe(
            "listener",
            &topics(&[TOPIC_AGENT_RESPONSE]),
            Arc::new(OutputAdapter::new("listener", Arc::clone(&sink) as Arc<dyn Component>)),
        )
        .expect("listener");
        bus.start();
        let _ = bus
            .handle()
            .emit(Event::new(TOPIC_INPUT_RECEIVED, json!({ "input": "hi" })))
            .await
            .expect("emit");
        settle(|| !sink.whole.lock().unwrap().is_empty()).await;
        let _ = bus.shutdown().await;
        assert_eq!(*sink.whole.lock().unwrap(), vec![json!("HI")]);
    }

    #[test]
    fn assemble_joins_text_and_keeps_other_shapes() {
        assert_eq!(assemble(vec![json!("a"), json!("b")]), json!("ab"));
        assert_eq!(assemble(vec![json!({"k": 1})]), json!({"k": 1}));
        assert_eq!(assemble(vec![json!(1), json!("b")]), json!([1, "b"]));
    }
}
