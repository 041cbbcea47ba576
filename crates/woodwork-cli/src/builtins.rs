//! Built-in components available to `woodwork run`.
//!
//! | kind        | type      | role                                       |
//! |-------------|-----------|--------------------------------------------|
//! | `input`     | `console` | reads lines from stdin                     |
//! | `output`    | `console` | prints results, chunk by chunk if streamed |
//! | `llm`       | `echo`    | echoes the input back, word by word        |
//! | `processor` | `echo`    | same as `llm echo`                         |
//! | `handler`   | `log`     | logs every event it subscribes to          |

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::StreamId;
use woodwork_runtime::bus::BusHandle;
use woodwork_runtime::bus::event::Event;
use woodwork_runtime::component::{
    ChunkWriter, Component, EventHandler, InputSource, OutputSink, Payload, Processor, Pulled,
    StreamingSink,
};
use woodwork_runtime::config::ComponentConfig;
use woodwork_runtime::factory::FactoryRegistry;

/// Registry with every built-in component.
pub fn registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    let _ = registry
        .register("input", "console", |config| Ok(Arc::new(ConsoleInput::from_config(config)?) as Arc<dyn Component>))
        .register("output", "console", |config| Ok(Arc::new(ConsoleOutput::from_config(config)?) as Arc<dyn Component>))
        .register("llm", "echo", |config| Ok(Arc::new(Echo::from_config(config)?) as Arc<dyn Component>))
        .register("processor", "echo", |config| Ok(Arc::new(Echo::from_config(config)?) as Arc<dyn Component>))
        .register("handler", "log", |config| Ok(Arc::new(LogHandler::from_config(config)) as Arc<dyn Component>));
    registry
}

/// Line reader over stdin.
struct ConsoleInput {
    name: String,
    prompt: String,
}

impl ConsoleInput {
    fn from_config(config: &ComponentConfig) -> Result<Self> {
        Ok(Self {
            name: config.name().to_string(),
            prompt: config.str_or("prompt", "> ")?.to_string(),
        })
    }
}

impl Component for ConsoleInput {
    fn as_input(&self) -> Option<&dyn InputSource> {
        Some(self)
    }
}

impl InputSource for ConsoleInput {
    fn pull_input(&self) -> Result<Pulled> {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}", self.prompt);
        let _ = stderr.flush();

        let mut line = String::new();
        let read = std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| WoodworkError::component(&self.name, e))?;
        if read == 0 {
            return Ok(Pulled::Exit);
        }
        Ok(Pulled::Value(json!(line.trim_end_matches(['\r', '\n']))))
    }
}

/// Prints payloads on stdout.
struct ConsoleOutput {
    name: String,
    prefix: String,
    /// Streams that already printed their prefix.
    open: Mutex<Vec<StreamId>>,
}

impl ConsoleOutput {
    fn from_config(config: &ComponentConfig) -> Result<Self> {
        Ok(Self {
            name: config.name().to_string(),
            prefix: config.str_or("prefix", "")?.to_string(),
            open: Mutex::new(Vec::new()),
        })
    }

    fn write(&self, text: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|e| WoodworkError::component(&self.name, e))
    }
}

fn render(payload: &Payload) -> String {
    match payload {
        Payload::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl Component for ConsoleOutput {
    fn as_output(&self) -> Option<&dyn OutputSink> {
        Some(self)
    }
}

impl OutputSink for ConsoleOutput {
    fn deliver(&self, payload: Payload) -> Result<()> {
        self.write(&format!("{}{}\n", self.prefix, render(&payload)))
    }

    fn as_streaming(&self) -> Option<&dyn StreamingSink> {
        Some(self)
    }
}

impl StreamingSink for ConsoleOutput {
    fn deliver_chunk(&self, stream: &StreamId, chunk: Payload, is_final: bool) -> Result<()> {
        let first = {
            let mut open = self.open.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let first = !open.contains(stream);
            if first {
                open.push(stream.clone());
            }
            if is_final {
                open.retain(|s| s != stream);
            }
            first
        };
        let mut text = String::new();
        if first {
            text.push_str(&self.prefix);
        }
        text.push_str(&render(&chunk));
        if is_final {
            text.push('\n');
        }
        self.write(&text)
    }
}

/// Returns its input, optionally prefixed.
struct Echo {
    name: String,
    prefix: String,
}

impl Echo {
    fn from_config(config: &ComponentConfig) -> Result<Self> {
        Ok(Self {
            name: config.name().to_string(),
            prefix: config.str_or("prefix", "")?.to_string(),
        })
    }

    fn text(&self, input: &Payload) -> Result<String> {
        match input {
            Payload::String(text) => Ok(format!("{}{text}", self.prefix)),
            Payload::Null => Err(WoodworkError::component(&self.name, "nothing to echo")),
            other => Ok(format!("{}{other}", self.prefix)),
        }
    }
}

impl Component for Echo {
    fn as_processor(&self) -> Option<&dyn Processor> {
        Some(self)
    }
}

impl Processor for Echo {
    fn process(&self, input: Payload) -> Result<Payload> {
        Ok(json!(self.text(&input)?))
    }

    fn process_streaming(&self, input: Payload, writer: &mut dyn ChunkWriter) -> Result<()> {
        let text = self.text(&input)?;
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        let Some((last, rest)) = words.split_last() else {
            return writer.write_chunk(json!(""), true);
        };
        for word in rest {
            writer.write_chunk(json!(word), false)?;
        }
        writer.write_chunk(json!(last), true)
    }
}

/// Logs every event delivered to it.
struct LogHandler {
    name: String,
}

impl LogHandler {
    fn from_config(config: &ComponentConfig) -> Self {
        Self {
            name: config.name().to_string(),
        }
    }
}

impl Component for LogHandler {
    fn as_event_handler(&self) -> Option<&dyn EventHandler> {
        Some(self)
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: &Event, _bus: &BusHandle) -> Result<()> {
        tracing::info!(
            handler = %self.name,
            topic = %event.topic,
            id = %event.id,
            source = event.source.as_deref().unwrap_or("-"),
            payload = %event.payload,
            "event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use woodwork_compose::value::{ConfigMap, ConfigValue};

    use super::*;

    #[derive(Default)]
    struct Chunks(Vec<(Payload, bool)>);

    impl ChunkWriter for Chunks {
        fn write_chunk(&mut self, chunk: Payload, is_final: bool) -> Result<()> {
            self.0.push((chunk, is_final));
            Ok(())
        }
    }

    fn config(pairs: &[(&str, &str)]) -> ComponentConfig {
        let values: ConfigMap = pairs
            .iter()
            .map(|(k, v)| (*k, ConfigValue::String((*v).to_string())))
            .collect();
        ComponentConfig::new("test", values)
    }

    #[test]
    fn every_builtin_is_registered() {
        let registry = registry();
        for (kind, ty) in [
            ("input", "console"),
            ("output", "console"),
            ("llm", "echo"),
            ("processor", "echo"),
            ("handler", "log"),
        ] {
            assert!(registry.contains(kind, ty), "{kind} {ty}");
        }
    }

    #[test]
    fn echo_prefixes_text() {
        let echo = Echo::from_config(&config(&[("prefix", "bot: ")])).expect("echo");
        assert_eq!(echo.process(json!("hi")).expect("process"), json!("bot: hi"));
        assert_eq!(echo.process(json!(3)).expect("process"), json!("bot: 3"));
        assert!(echo.process(Payload::Null).is_err());
    }

    #[test]
    fn echo_streams_word_chunks_ending_in_final() {
        let echo = Echo::from_config(&config(&[])).expect("echo");
        let mut chunks = Chunks::default();
        echo.process_streaming(json!("one two three"), &mut chunks).expect("stream");
        assert_eq!(
            chunks.0,
            vec![
                (json!("one "), false),
                (json!("two "), false),
                (json!("three"), true)
            ]
        );
    }

    #[test]
    fn echo_streams_empty_input_as_single_final_chunk() {
        let echo = Echo::from_config(&config(&[])).expect("echo");
        let mut chunks = Chunks::default();
        echo.process_streaming(json!(""), &mut chunks).expect("stream");
        assert_eq!(chunks.0, vec![(json!(""), true)]);
    }

    #[test]
    fn wrong_typed_prefix_is_rejected() {
        let values: ConfigMap = [("prefix", ConfigValue::Bool(true))].into_iter().collect();
        assert!(Echo::from_config(&ComponentConfig::new("echo", values)).is_err());
    }

    #[test]
    fn console_output_tracks_stream_prefix() {
        let out = ConsoleOutput::from_config(&config(&[])).expect("output");
        let id = StreamId::new("s1");
        out.deliver_chunk(&id, json!("a"), false).expect("chunk");
        assert_eq!(out.open.lock().unwrap().len(), 1);
        out.deliver_chunk(&id, json!("b"), true).expect("final");
        assert!(out.open.lock().unwrap().is_empty());
    }
}
