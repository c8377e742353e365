//! Scripted hardware decoder and decode client for unit tests. The decoder
//! never fires callbacks on its own; tests drive `CodecEvents` by hand to
//! pick the interleaving they want.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use imagegraph::SampleId;

use crate::{
    CodecEvents, DecodeClient, DecodeError, DecoderFactory, HardwareDecoder, InputFormat,
    OutputSurface,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Configure { mime: &'static str, surface: u64 },
    Start,
    SetSurface { surface: u64 },
    Write { index: usize, len: usize },
    Queue { index: usize, size: usize, pts: u64 },
    ReleaseOutput { index: usize, render: bool },
    Stop,
    Release,
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    events: Option<CodecEvents>,
    created: usize,
    fail_configure: bool,
    rejected_surfaces: HashSet<u64>,
    input_on_stop: Option<usize>,
}

#[derive(Default, Clone)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn queued_inputs(&self) -> Vec<(usize, usize, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Queue { index, size, pts } => Some((index, size, pts)),
                _ => None,
            })
            .collect()
    }

    /// Events handle of the most recently started decoder.
    pub fn events(&self) -> CodecEvents {
        self.script
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("decoder was never started")
    }

    pub fn created(&self) -> usize {
        self.script.lock().unwrap().created
    }

    pub fn fail_configure(&self, fail: bool) {
        self.script.lock().unwrap().fail_configure = fail;
    }

    pub fn reject_surface(&self, surface: u64) {
        self.script.lock().unwrap().rejected_surfaces.insert(surface);
    }

    /// Makes `stop` report a free input buffer from inside the call, the way
    /// some platform codecs flush their callbacks.
    pub fn offer_input_on_stop(&self, index: usize) {
        self.script.lock().unwrap().input_on_stop = Some(index);
    }
}

impl DecoderFactory for ScriptedFactory {
    fn create(&self, _format: &InputFormat) -> Result<Box<dyn HardwareDecoder>, DecodeError> {
        self.script.lock().unwrap().created += 1;
        Ok(Box::new(ScriptedDecoder {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedDecoder {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDecoder {
    fn record(&self, call: Call) {
        self.script.lock().unwrap().calls.push(call);
    }
}

impl HardwareDecoder for ScriptedDecoder {
    fn configure(
        &mut self,
        format: &InputFormat,
        surface: &Arc<OutputSurface>,
    ) -> Result<(), DecodeError> {
        self.record(Call::Configure {
            mime: format.mime,
            surface: surface.id(),
        });
        if self.script.lock().unwrap().fail_configure {
            return Err(DecodeError::Hardware("configure rejected".into()));
        }
        Ok(())
    }

    fn start(&mut self, events: CodecEvents) -> Result<(), DecodeError> {
        self.record(Call::Start);
        self.script.lock().unwrap().events = Some(events);
        Ok(())
    }

    fn set_output_surface(&mut self, surface: &Arc<OutputSurface>) -> Result<(), DecodeError> {
        self.record(Call::SetSurface {
            surface: surface.id(),
        });
        if self
            .script
            .lock()
            .unwrap()
            .rejected_surfaces
            .contains(&surface.id())
        {
            return Err(DecodeError::Hardware("surface rejected".into()));
        }
        Ok(())
    }

    fn write_input(&mut self, index: usize, data: &[u8]) -> Result<(), DecodeError> {
        self.record(Call::Write {
            index,
            len: data.len(),
        });
        Ok(())
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        pts: u64,
    ) -> Result<(), DecodeError> {
        self.record(Call::Queue { index, size, pts });
        Ok(())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), DecodeError> {
        self.record(Call::ReleaseOutput { index, render });
        Ok(())
    }

    fn stop(&mut self) {
        self.record(Call::Stop);
        let pending = {
            let script = self.script.lock().unwrap();
            script.input_on_stop.zip(script.events.clone())
        };
        if let Some((index, events)) = pending {
            events.input_available(index);
        }
    }

    fn release(&mut self) {
        self.record(Call::Release);
    }
}

pub struct FakeClient {
    surface: Option<Arc<OutputSurface>>,
    data: Vec<u8>,
    fail_reads: AtomicBool,
    ready: AtomicUsize,
    available: AtomicBool,
    requested: Mutex<Vec<Option<SampleId>>>,
}

impl FakeClient {
    pub fn with_surface(data: Vec<u8>) -> Arc<Self> {
        Self::build(Some(OutputSurface::new()), data)
    }

    pub fn without_surface() -> Arc<Self> {
        Self::build(None, Vec::new())
    }

    fn build(surface: Option<Arc<OutputSurface>>, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            surface,
            data,
            fail_reads: AtomicBool::new(false),
            ready: AtomicUsize::new(0),
            available: AtomicBool::new(false),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn surface(&self) -> Arc<OutputSurface> {
        self.surface.clone().expect("client has no surface")
    }

    pub fn surface_id(&self) -> u64 {
        self.surface().id()
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn requested_samples(&self) -> Vec<Option<SampleId>> {
        self.requested.lock().unwrap().clone()
    }
}

impl DecodeClient for FakeClient {
    fn output_surface(&self) -> Option<Arc<OutputSurface>> {
        self.surface.clone()
    }

    fn input_data(&self, sample: Option<SampleId>) -> Result<Vec<u8>, DecodeError> {
        self.requested.lock().unwrap().push(sample);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DecodeError::Hardware("read failed".into()));
        }
        Ok(self.data.clone())
    }

    fn notify_decode_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}
