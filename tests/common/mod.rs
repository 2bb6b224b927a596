#![allow(dead_code)]

use blockflow::{
    Block, BlockContext, BlockError, BlockRole, Config, Inputs, Outputs, Socket, WorkItem,
};
use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, thread};

pub const FRAME: &str = "frame";

/// Image-like payload; the heap buffer address tells clones from originals.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pixels: Box<[u8]>,
    pub mp: f32,
}

impl Frame {
    pub fn new(seed: u8) -> Self {
        Self {
            pixels: vec![seed; 16].into(),
            mp: 0.25,
        }
    }

    pub fn addr(&self) -> usize {
        self.pixels.as_ptr() as usize
    }
}

impl WorkItem for Frame {
    fn size_mp(&self) -> f32 {
        self.mp
    }
}

#[derive(Debug)]
pub struct TestConfig;

impl Config for TestConfig {
    type Item = Frame;
    type Block = TestBlock;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started(String),
    Finished(String),
    Received {
        block: String,
        sockets: Vec<(String, Vec<usize>)>,
    },
    Produced {
        block: String,
        addrs: Vec<usize>,
    },
}

/// Shared log of block invocations.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Number of invocations of `name`.
    pub fn calls(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Started(block) if block == name))
            .count()
    }

    /// Names in invocation order.
    pub fn start_order(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Started(block) => Some(block.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events.lock().iter().position(|candidate| candidate == event)
    }

    /// Inputs seen by every invocation of `name`, per socket.
    pub fn received(&self, name: &str) -> Vec<Vec<(String, Vec<usize>)>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Received { block, sockets } if block == name => Some(sockets.clone()),
                _ => None,
            })
            .collect()
    }

    /// Items handed over to `name` across all invocations.
    pub fn received_items(&self, name: &str) -> usize {
        self.received(name)
            .iter()
            .flatten()
            .map(|(_, addrs)| addrs.len())
            .sum()
    }

    /// Buffer addresses produced by every invocation of `name`.
    pub fn produced(&self, name: &str) -> Vec<Vec<usize>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Produced { block, addrs } if block == name => Some(addrs.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of blocks observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    fn enter<'a>(&'a self, name: &'a str, inputs: &Inputs<Frame>) -> Running<'a> {
        self.push(Event::Started(name.to_owned()));
        self.push(Event::Received {
            block: name.to_owned(),
            sockets: inputs
                .iter()
                .map(|(socket, items)| {
                    (
                        socket.as_str().to_owned(),
                        items.iter().map(Frame::addr).collect(),
                    )
                })
                .collect(),
        });
        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(running, Ordering::AcqRel);
        Running {
            recorder: self,
            name,
        }
    }
}

struct Running<'a> {
    recorder: &'a Recorder,
    name: &'a str,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.recorder.running.fetch_sub(1, Ordering::AcqRel);
        self.recorder.push(Event::Finished(self.name.to_owned()));
    }
}

#[derive(Debug)]
pub enum Behavior {
    /// Emit `n` fresh frames on every output socket.
    Emit(usize),
    /// Forward every input frame to every output socket.
    Pass,
    /// Return an error.
    Fail,
    /// Panic with "boom".
    Panic,
    /// Source batches; an exhausted source emits nothing.
    Batches(Mutex<VecDeque<usize>>),
    /// Poll for cancellation until it arrives.
    WaitForCancel,
    /// Sleep, then forward.
    Sleep(Duration),
}

#[derive(Debug)]
pub struct TestBlock {
    name: String,
    inputs: Vec<Socket>,
    outputs: Vec<Socket>,
    role: BlockRole,
    behavior: Behavior,
    recorder: Arc<Recorder>,
}

fn sockets(names: &[&str]) -> Vec<Socket> {
    names.iter().map(|&name| Socket::new(name, FRAME)).collect()
}

impl TestBlock {
    pub fn new(
        name: impl Into<String>,
        recorder: &Arc<Recorder>,
        inputs: &[&str],
        outputs: &[&str],
        behavior: Behavior,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: sockets(inputs),
            outputs: sockets(outputs),
            role: BlockRole::Transform,
            behavior,
            recorder: Arc::clone(recorder),
        }
    }

    /// Root emitting `items` frames on `out`.
    pub fn root(name: &str, recorder: &Arc<Recorder>, items: usize) -> Self {
        Self::new(name, recorder, &[], &["out"], Behavior::Emit(items))
    }

    /// Forwarding block with the given inputs and a single `out`.
    pub fn pass(name: &str, recorder: &Arc<Recorder>, inputs: &[&str]) -> Self {
        Self::new(name, recorder, inputs, &["out"], Behavior::Pass)
    }

    /// Terminal block without outputs.
    pub fn sink(name: &str, recorder: &Arc<Recorder>, inputs: &[&str]) -> Self {
        Self::new(name, recorder, inputs, &[], Behavior::Pass).with_role(BlockRole::Sink)
    }

    /// Shipment source emitting the given batch sizes, one per cycle.
    pub fn source(
        name: &str,
        recorder: &Arc<Recorder>,
        batches: &[usize],
        max_shipment_size: Option<usize>,
    ) -> Self {
        Self::new(
            name,
            recorder,
            &[],
            &["out"],
            Behavior::Batches(Mutex::new(batches.iter().copied().collect())),
        )
        .with_role(BlockRole::Source {
            max_shipment_size: max_shipment_size.and_then(NonZeroUsize::new),
        })
    }

    #[must_use]
    pub fn with_role(mut self, role: BlockRole) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<Socket>) -> Self {
        self.inputs = inputs;
        self
    }

    #[must_use]
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn emit(&self, count: usize) -> Outputs<Frame> {
        self.outputs
            .iter()
            .map(|socket| {
                let frames = (0..count)
                    .map(|idx| Frame::new(u8::try_from(idx % 256).unwrap()))
                    .collect();
                (socket.id.clone(), frames)
            })
            .collect()
    }

    fn forward(&self, inputs: Inputs<Frame>) -> Outputs<Frame> {
        let items: Vec<Frame> = inputs.into_values().flatten().collect();
        let mut outputs = Outputs::default();
        if let Some((last, rest)) = self.outputs.split_last() {
            for socket in rest {
                outputs.insert(socket.id.clone(), items.clone());
            }
            outputs.insert(last.id.clone(), items);
        }
        outputs
    }

    fn run(&self, inputs: Inputs<Frame>, ctx: &BlockContext<'_>) -> Result<Outputs<Frame>, BlockError> {
        match &self.behavior {
            Behavior::Emit(count) => Ok(self.emit(*count)),
            Behavior::Pass => Ok(self.forward(inputs)),
            Behavior::Fail => Err(BlockError::failed(format!("{} refused", self.name))),
            Behavior::Panic => panic!("boom"),
            Behavior::Batches(batches) => {
                let batch = batches.lock().pop_front().unwrap_or(0);
                let max = ctx.max_shipment_size().expect("sources get a limit");
                assert!(batch <= max.get(), "batch exceeds shipment size");
                Ok(self.emit(batch))
            }
            Behavior::WaitForCancel => loop {
                ctx.check_cancelled()?;
                thread::sleep(Duration::from_millis(2));
            },
            Behavior::Sleep(duration) => {
                thread::sleep(*duration);
                Ok(self.forward(inputs))
            }
        }
    }
}

impl Block<TestConfig> for TestBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[Socket] {
        &self.inputs
    }

    fn outputs(&self) -> &[Socket] {
        &self.outputs
    }

    fn role(&self) -> BlockRole {
        self.role
    }

    fn execute(
        &self,
        inputs: Inputs<Frame>,
        ctx: &BlockContext<'_>,
    ) -> Result<Outputs<Frame>, BlockError> {
        let _running = self.recorder.enter(&self.name, &inputs);
        let outputs = self.run(inputs, ctx)?;
        self.recorder.push(Event::Produced {
            block: self.name.clone(),
            addrs: outputs.values().flatten().map(Frame::addr).collect(),
        });
        Ok(outputs)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
