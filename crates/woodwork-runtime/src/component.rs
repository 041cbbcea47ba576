//! Component capability model.
//!
//! A component is any `Arc<dyn Component>`. It opts into roles by returning
//! `Some(self)` from the matching accessor; everything defaults to `None`.
//! [`Capabilities::detect`] reads the accessors once when the component is
//! registered so the driver and the backends dispatch on flags.

use std::fmt;

use async_trait::async_trait;
use woodwork_common::error::Result;
use woodwork_common::types::StreamId;

use crate::bus::BusHandle;
use crate::bus::event::Event;
use crate::config::ComponentConfig;
use crate::progress::ProgressReporter;

/// Value flowing between inputs, processors and outputs.
pub type Payload = serde_json::Value;

/// A live component built from one declaration.
pub trait Component: Send + Sync {
    /// Init work that must run in the orchestrating lane.
    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }

    /// Init work that may run on a blocking worker.
    fn as_parallel_initializable(&self) -> Option<&dyn ParallelInitializable> {
        None
    }

    /// Start work that must run in the orchestrating lane.
    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    /// Start work that may run on a blocking worker.
    fn as_parallel_startable(&self) -> Option<&dyn ParallelStartable> {
        None
    }

    /// Source of user input for the main loop.
    fn as_input(&self) -> Option<&dyn InputSource> {
        None
    }

    /// Transforms input into output.
    fn as_processor(&self) -> Option<&dyn Processor> {
        None
    }

    /// Terminal sink for results.
    fn as_output(&self) -> Option<&dyn OutputSink> {
        None
    }

    /// Subscriber on the message bus.
    fn as_event_handler(&self) -> Option<&dyn EventHandler> {
        None
    }

    /// Releases resources held by the component.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource could not be released.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sequential init phase.
pub trait Initializable: Send + Sync {
    /// Runs the init work.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the component failed.
    fn init(&self, progress: &ProgressReporter, config: &ComponentConfig) -> Result<()>;
}

/// Init phase safe to run concurrently with other components.
pub trait ParallelInitializable: Send + Sync {
    /// Runs the init work on a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the component failed.
    fn parallel_init(&self, progress: &ProgressReporter, config: &ComponentConfig) -> Result<()>;
}

/// Sequential start phase.
pub trait Startable: Send + Sync {
    /// Runs the start work.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the component failed.
    fn start(&self, progress: &ProgressReporter, config: &ComponentConfig) -> Result<()>;
}

/// Start phase safe to run concurrently with other components.
pub trait ParallelStartable: Send + Sync {
    /// Runs the start work on a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the component failed.
    fn parallel_start(&self, progress: &ProgressReporter, config: &ComponentConfig) -> Result<()>;
}

/// Result of one input pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    /// A value to feed through the pipeline.
    Value(Payload),
    /// The source is exhausted.
    Exit,
}

/// Produces input values. Called from a blocking worker, so it may block.
pub trait InputSource: Send + Sync {
    /// Pulls the next input.
    ///
    /// # Errors
    ///
    /// Returns an error if the source failed; the main loop ends.
    fn pull_input(&self) -> Result<Pulled>;
}

/// Receives the chunks of a streamed result.
pub trait ChunkWriter: Send {
    /// Writes one chunk. `is_final` ends the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    fn write_chunk(&mut self, chunk: Payload, is_final: bool) -> Result<()>;
}

/// Transforms a payload. Called from a blocking worker.
pub trait Processor: Send + Sync {
    /// Produces a complete result.
    ///
    /// # Errors
    ///
    /// Returns an error if processing failed.
    fn process(&self, input: Payload) -> Result<Payload>;

    /// Produces a result as chunks. Defaults to one final chunk holding
    /// [`Processor::process`]'s output.
    ///
    /// # Errors
    ///
    /// Returns an error if processing or writing failed.
    fn process_streaming(&self, input: Payload, writer: &mut dyn ChunkWriter) -> Result<()> {
        let output = self.process(input)?;
        writer.write_chunk(output, true)
    }
}

/// Consumes complete results.
pub trait OutputSink: Send + Sync {
    /// Delivers one result.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed.
    fn deliver(&self, payload: Payload) -> Result<()>;

    /// Chunk-level delivery, if supported.
    fn as_streaming(&self) -> Option<&dyn StreamingSink> {
        None
    }
}

/// Consumes results chunk by chunk as they are produced.
pub trait StreamingSink: Send + Sync {
    /// Delivers one chunk of `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed.
    fn deliver_chunk(&self, stream: &StreamId, chunk: Payload, is_final: bool) -> Result<()>;
}

/// Message bus subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Topics the handler subscribes to, in addition to the `subscribe`
    /// list of its declaration.
    async fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handles one event. An error schedules a retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be handled.
    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()>;
}

/// One optional role a component can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Sequential init.
    Init,
    /// Parallel init.
    ParallelInit,
    /// Sequential start.
    Start,
    /// Parallel start.
    ParallelStart,
    /// Input source.
    Input,
    /// Processor.
    Processor,
    /// Output sink.
    Output,
    /// Streaming output sink.
    StreamingOutput,
    /// Bus event handler.
    EventHandler,
}

impl Capability {
    /// Every capability, in detection order.
    pub const ALL: [Self; 9] = [
        Self::Init,
        Self::ParallelInit,
        Self::Start,
        Self::ParallelStart,
        Self::Input,
        Self::Processor,
        Self::Output,
        Self::StreamingOutput,
        Self::EventHandler,
    ];

    const fn bit(self) -> u16 {
        1 << self as u16
    }

    /// Short name used in plans and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ParallelInit => "parallel-init",
            Self::Start => "start",
            Self::ParallelStart => "parallel-start",
            Self::Input => "input",
            Self::Processor => "processor",
            Self::Output => "output",
            Self::StreamingOutput => "streaming-output",
            Self::EventHandler => "event-handler",
        }
    }
}

/// Flag set of the capabilities a component implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u16);

impl Capabilities {
    /// Queries every accessor of `component` once.
    #[must_use]
    pub fn detect(component: &dyn Component) -> Self {
        let mut caps = Self::default();
        let checks = [
            (Capability::Init, component.as_initializable().is_some()),
            (Capability::ParallelInit, component.as_parallel_initializable().is_some()),
            (Capability::Start, component.as_startable().is_some()),
            (Capability::ParallelStart, component.as_parallel_startable().is_some()),
            (Capability::Input, component.as_input().is_some()),
            (Capability::Processor, component.as_processor().is_some()),
            (Capability::Output, component.as_output().is_some()),
            (
                Capability::StreamingOutput,
                component.as_output().and_then(OutputSink::as_streaming).is_some(),
            ),
            (Capability::EventHandler, component.as_event_handler().is_some()),
        ];
        for (capability, present) in checks {
            if present {
                caps.insert(capability);
            }
        }
        caps
    }

    /// Adds `capability` to the set.
    pub const fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    /// Returns `true` if `capability` is in the set.
    #[must_use]
    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Returns `true` if no capability is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Capabilities in the set, in detection order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter().map(Capability::as_str).collect();
        write!(f, "{}", names.join(", "))
    }
}
