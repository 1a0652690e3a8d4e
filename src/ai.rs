//! Asynchronous AI processing boundary.
//!
//! Requests are queued to a single worker thread over `mpsc` and never block
//! the caller. Results, progress and failures come back on a second channel
//! and are drained whenever the client is polled. Cancelling only drops the
//! local bookkeeping and raises a flag the backend may check; anything the
//! worker sends for a cancelled task afterwards is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AiError;
use crate::params::ParamMap;
use crate::pixel::{PixelBuffer, box_blur_plane};

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Segmentation,
    Inpainting,
    Upscaling,
    StyleTransfer,
    ColorHarmonization,
    Relighting,
    Denoising,
    FaceRestoration,
    TextRecognition,
    ContentAware,
}

impl ServiceType {
    pub fn all() -> &'static [ServiceType] {
        &[
            ServiceType::Segmentation,
            ServiceType::Inpainting,
            ServiceType::Upscaling,
            ServiceType::StyleTransfer,
            ServiceType::ColorHarmonization,
            ServiceType::Relighting,
            ServiceType::Denoising,
            ServiceType::FaceRestoration,
            ServiceType::TextRecognition,
            ServiceType::ContentAware,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceType::Segmentation => "Segmentation",
            ServiceType::Inpainting => "Inpainting",
            ServiceType::Upscaling => "Upscaling",
            ServiceType::StyleTransfer => "Style Transfer",
            ServiceType::ColorHarmonization => "Color Harmonization",
            ServiceType::Relighting => "Relighting",
            ServiceType::Denoising => "Denoising",
            ServiceType::FaceRestoration => "Face Restoration",
            ServiceType::TextRecognition => "Text Recognition",
            ServiceType::ContentAware => "Content-Aware",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// In-process backend only.
    Local,
    /// Remote backend only.
    Remote,
    /// Remote when it handles the service, local otherwise.
    Hybrid,
    /// Every submission is rejected.
    #[default]
    Offline,
}

impl ProcessingMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "local" => Some(ProcessingMode::Local),
            "remote" => Some(ProcessingMode::Remote),
            "hybrid" => Some(ProcessingMode::Hybrid),
            "offline" => Some(ProcessingMode::Offline),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessingMode::Local => "local",
            ProcessingMode::Remote => "remote",
            ProcessingMode::Hybrid => "hybrid",
            ProcessingMode::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed(String),
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub service: ServiceType,
    pub state: TaskState,
    /// 0..=1
    pub progress: f32,
    pub elapsed: Duration,
}

/// Asynchronous image service. No method blocks on the backend.
pub trait AiService {
    fn submit(&mut self, service: ServiceType, input: PixelBuffer, params: ParamMap) -> Result<TaskId, AiError>;
    fn poll(&mut self, id: TaskId) -> Option<TaskStatus>;
    fn cancel(&mut self, id: TaskId) -> bool;
    /// Hand over a finished result. The task is forgotten afterwards.
    fn take_result(&mut self, id: TaskId) -> Option<PixelBuffer>;
}

/// Something that actually runs a service. Called on the worker thread.
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, service: ServiceType) -> bool;

    /// Process `input`. `progress` takes values in 0..=1. Implementations
    /// should give up early once `cancelled` is set.
    fn process(
        &self,
        service: ServiceType,
        input: &PixelBuffer,
        params: &ParamMap,
        progress: &dyn Fn(f32),
        cancelled: &AtomicBool,
    ) -> Result<PixelBuffer, AiError>;
}

// ============================================================================
// LOCAL BACKEND — CPU implementations of the simple services
// ============================================================================

/// Denoising (box blur mixed by `strength`), bilinear upscaling by `scale`
/// and background/foreground segmentation against the border colour.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

fn cancelled_error() -> AiError {
    AiError::Backend("cancelled".to_string())
}

impl LocalBackend {
    fn denoise(
        input: &PixelBuffer,
        params: &ParamMap,
        progress: &dyn Fn(f32),
        cancelled: &AtomicBool,
    ) -> Result<PixelBuffer, AiError> {
        let radius = params.i64_or("radius", 1).clamp(1, 16) as usize;
        let strength = params.f32_or("strength", 1.0).clamp(0.0, 1.0);
        let (w, h) = (input.width() as usize, input.height() as usize);
        let src = input.pixels();
        let mut out = input.clone();
        for c in 0..4 {
            if cancelled.load(Ordering::Relaxed) {
                return Err(cancelled_error());
            }
            let mut plane: Vec<f32> = src.iter().skip(c).step_by(4).map(|&v| v as f32).collect();
            box_blur_plane(&mut plane, w, h, radius, 2);
            for (i, px) in out.pixels_mut().chunks_exact_mut(4).enumerate() {
                let orig = src[i * 4 + c] as f32;
                px[c] = (orig + (plane[i] - orig) * strength).round().clamp(0.0, 255.0) as u8;
            }
            progress((c + 1) as f32 / 4.0);
        }
        // Keep premultiplied colour under alpha
        for px in out.pixels_mut().chunks_exact_mut(4) {
            let a = px[3];
            px[0] = px[0].min(a);
            px[1] = px[1].min(a);
            px[2] = px[2].min(a);
        }
        Ok(out)
    }

    fn upscale(
        input: &PixelBuffer,
        params: &ParamMap,
        progress: &dyn Fn(f32),
        cancelled: &AtomicBool,
    ) -> Result<PixelBuffer, AiError> {
        let scale = params.i64_or("scale", 2).clamp(1, 4) as u32;
        let (sw, sh) = (input.width(), input.height());
        let mut out = PixelBuffer::new(sw * scale, sh * scale);
        if out.is_empty() {
            return Ok(out);
        }
        let stride = out.stride();
        let src = input.pixels();
        let src_stride = input.stride();
        let inv = 1.0 / scale as f32;
        let sample = |x: usize, y: usize, c: usize| src[y * src_stride + x * 4 + c] as f32;

        let rows_per_band = 64usize;
        for (band_idx, band) in out.pixels_mut().chunks_mut(stride * rows_per_band).enumerate() {
            if cancelled.load(Ordering::Relaxed) {
                return Err(cancelled_error());
            }
            band.par_chunks_mut(stride).enumerate().for_each(|(row, out_row)| {
                let y = band_idx * rows_per_band + row;
                let fy = ((y as f32 + 0.5) * inv - 0.5).clamp(0.0, (sh - 1) as f32);
                let (y0, ty) = (fy.floor() as usize, fy.fract());
                let y1 = (y0 + 1).min(sh as usize - 1);
                for x in 0..(sw * scale) as usize {
                    let fx = ((x as f32 + 0.5) * inv - 0.5).clamp(0.0, (sw - 1) as f32);
                    let (x0, tx) = (fx.floor() as usize, fx.fract());
                    let x1 = (x0 + 1).min(sw as usize - 1);
                    for c in 0..4 {
                        let top = sample(x0, y0, c) + (sample(x1, y0, c) - sample(x0, y0, c)) * tx;
                        let bot = sample(x0, y1, c) + (sample(x1, y1, c) - sample(x0, y1, c)) * tx;
                        out_row[x * 4 + c] = (top + (bot - top) * ty).round().clamp(0.0, 255.0) as u8;
                    }
                }
            });
            let done = ((band_idx + 1) * rows_per_band).min((sh * scale) as usize);
            progress(done as f32 / (sh * scale) as f32);
        }
        Ok(out)
    }

    /// Opaque white where a pixel differs from the average border colour by
    /// more than `threshold` (0..1 of the RGB diagonal), opaque black
    /// elsewhere. Transparent pixels are background.
    fn segment(
        input: &PixelBuffer,
        params: &ParamMap,
        progress: &dyn Fn(f32),
        cancelled: &AtomicBool,
    ) -> Result<PixelBuffer, AiError> {
        let threshold = params.f32_or("threshold", 0.15).clamp(0.0, 1.0) * 441.673;
        let (w, h) = (input.width() as i32, input.height() as i32);
        let mut out = PixelBuffer::new(input.width(), input.height());
        if out.is_empty() {
            return Ok(out);
        }

        let mut sum = [0.0f64; 3];
        let mut n = 0usize;
        for y in 0..h {
            for x in 0..w {
                if x != 0 && y != 0 && x != w - 1 && y != h - 1 {
                    continue;
                }
                if let Some(p) = input.get(x, y) {
                    let p = p.unpremultiply();
                    sum[0] += p.r() as f64;
                    sum[1] += p.g() as f64;
                    sum[2] += p.b() as f64;
                    n += 1;
                }
            }
        }
        let bg = sum.map(|s| (s / n.max(1) as f64) as f32);
        progress(0.2);
        if cancelled.load(Ordering::Relaxed) {
            return Err(cancelled_error());
        }

        let stride = out.stride();
        let src = input.pixels();
        out.pixels_mut().par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let i = y * stride + x * 4;
                let a = src[i + 3];
                let fg = a > 0 && {
                    let un = crate::pixel::Rgba([src[i], src[i + 1], src[i + 2], a]).unpremultiply();
                    let dr = un.r() as f32 - bg[0];
                    let dg = un.g() as f32 - bg[1];
                    let db = un.b() as f32 - bg[2];
                    (dr * dr + dg * dg + db * db).sqrt() > threshold
                };
                let v = if fg { 255 } else { 0 };
                px.copy_from_slice(&[v, v, v, 255]);
            }
        });
        progress(1.0);
        Ok(out)
    }
}

impl AiBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn supports(&self, service: ServiceType) -> bool {
        matches!(
            service,
            ServiceType::Denoising | ServiceType::Upscaling | ServiceType::Segmentation
        )
    }

    fn process(
        &self,
        service: ServiceType,
        input: &PixelBuffer,
        params: &ParamMap,
        progress: &dyn Fn(f32),
        cancelled: &AtomicBool,
    ) -> Result<PixelBuffer, AiError> {
        match service {
            ServiceType::Denoising => Self::denoise(input, params, progress, cancelled),
            ServiceType::Upscaling => Self::upscale(input, params, progress, cancelled),
            ServiceType::Segmentation => Self::segment(input, params, progress, cancelled),
            other => Err(AiError::Unsupported(other.name().to_string())),
        }
    }
}

// ============================================================================
// CLIENT — worker thread + task bookkeeping
// ============================================================================

enum Job {
    Run {
        id: TaskId,
        service: ServiceType,
        input: PixelBuffer,
        params: ParamMap,
        attempt: u32,
        backend: Arc<dyn AiBackend>,
        cancelled: Arc<AtomicBool>,
    },
}

struct WorkerMessage {
    id: TaskId,
    attempt: u32,
    update: Update,
}

enum Update {
    Started,
    Progress(f32),
    Completed(PixelBuffer),
    Failed(AiError),
}

struct TaskEntry {
    service: ServiceType,
    state: TaskState,
    progress: f32,
    started: Instant,
    cancelled: Arc<AtomicBool>,
    /// Bumped by `retry`; messages from earlier runs are ignored.
    attempt: u32,
    result: Option<PixelBuffer>,
    /// Kept so the request can be retried under the same id.
    request: (PixelBuffer, ParamMap),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiClientConfig {
    pub mode: ProcessingMode,
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Offline,
            max_concurrent: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct AiClient {
    config: AiClientConfig,
    local: Arc<dyn AiBackend>,
    remote: Option<Arc<dyn AiBackend>>,
    jobs: Option<Sender<Job>>,
    events: Receiver<WorkerMessage>,
    worker: Option<JoinHandle<()>>,
    tasks: HashMap<TaskId, TaskEntry>,
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("config", &self.config)
            .field("local", &self.local.name())
            .field("remote", &self.remote.as_ref().map(|r| r.name().to_string()))
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl AiClient {
    pub fn new(config: AiClientConfig) -> Self {
        Self::with_backends(config, Arc::new(LocalBackend), None)
    }

    pub fn with_backends(
        config: AiClientConfig,
        local: Arc<dyn AiBackend>,
        remote: Option<Arc<dyn AiBackend>>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (event_tx, event_rx) = mpsc::channel::<WorkerMessage>();
        let worker = std::thread::Builder::new()
            .name("layerforge-ai".to_string())
            .spawn(move || worker_loop(job_rx, event_tx));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not start AI worker thread");
                None
            }
        };
        info!(mode = config.mode.name(), max_concurrent = config.max_concurrent, "AI client ready");
        Self {
            config,
            local,
            remote,
            jobs: worker.as_ref().map(|_| job_tx),
            events: event_rx,
            worker,
            tasks: HashMap::new(),
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: ProcessingMode) {
        self.config.mode = mode;
    }

    pub fn is_available(&self) -> bool {
        self.config.mode != ProcessingMode::Offline && self.jobs.is_some()
    }

    pub fn set_max_concurrent(&mut self, max: usize) {
        self.config.max_concurrent = max.max(1);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn active_tasks(&mut self) -> usize {
        self.drain_events();
        self.tasks.values().filter(|t| t.state.is_active()).count()
    }

    fn pick_backend(&self, service: ServiceType) -> Result<Arc<dyn AiBackend>, AiError> {
        let remote = self.remote.as_ref().filter(|r| r.supports(service));
        let local = Some(&self.local).filter(|l| l.supports(service));
        let chosen = match self.config.mode {
            ProcessingMode::Offline => return Err(AiError::Offline),
            ProcessingMode::Local => local,
            ProcessingMode::Remote => {
                if self.remote.is_none() {
                    return Err(AiError::Offline);
                }
                remote
            }
            ProcessingMode::Hybrid => remote.or(local),
        };
        chosen
            .cloned()
            .ok_or_else(|| AiError::Unsupported(service.name().to_string()))
    }

    fn dispatch(&mut self, id: TaskId) -> Result<(), AiError> {
        let entry = self.tasks.get(&id).ok_or_else(|| AiError::UnknownTask(id.to_string()))?;
        let backend = self.pick_backend(entry.service)?;
        let jobs = self.jobs.as_ref().ok_or(AiError::WorkerGone)?;
        let job = Job::Run {
            id,
            service: entry.service,
            input: entry.request.0.clone(),
            params: entry.request.1.clone(),
            attempt: entry.attempt,
            backend,
            cancelled: Arc::clone(&entry.cancelled),
        };
        jobs.send(job).map_err(|_| AiError::WorkerGone)
    }

    /// Run a finished, failed or cancelled task again under the same id.
    pub fn retry(&mut self, id: TaskId) -> Result<(), AiError> {
        self.drain_events();
        let active = self.tasks.values().filter(|t| t.state.is_active()).count();
        let entry = self.tasks.get_mut(&id).ok_or_else(|| AiError::UnknownTask(id.to_string()))?;
        if entry.state.is_active() {
            return Err(AiError::AlreadyRunning(id.to_string()));
        }
        if active >= self.config.max_concurrent {
            return Err(AiError::Busy(self.config.max_concurrent));
        }
        entry.state = TaskState::Queued;
        entry.progress = 0.0;
        entry.started = Instant::now();
        entry.result = None;
        entry.cancelled = Arc::new(AtomicBool::new(false));
        entry.attempt += 1;
        if let Err(e) = self.dispatch(id) {
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.state = TaskState::Failed(e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }

    fn drain_events(&mut self) {
        while let Ok(WorkerMessage { id, attempt, update }) = self.events.try_recv() {
            // Late messages for cancelled, timed out, retried or forgotten
            // tasks are dropped
            let Some(entry) = self
                .tasks
                .get_mut(&id)
                .filter(|e| e.state.is_active() && e.attempt == attempt)
            else {
                continue;
            };
            match update {
                Update::Started => entry.state = TaskState::Running,
                Update::Progress(p) => entry.progress = p.clamp(0.0, 1.0),
                Update::Completed(result) => {
                    debug!(task = %id, elapsed_ms = entry.started.elapsed().as_millis() as u64, "AI task completed");
                    entry.state = TaskState::Completed;
                    entry.progress = 1.0;
                    entry.result = Some(result);
                }
                Update::Failed(e) => {
                    warn!(task = %id, error = %e, "AI task failed");
                    entry.state = TaskState::Failed(e.to_string());
                }
            }
        }

        let timeout = self.config.timeout;
        for (id, entry) in self.tasks.iter_mut() {
            if entry.state.is_active() && entry.started.elapsed() > timeout {
                warn!(task = %id, timeout_ms = timeout.as_millis() as u64, "AI task timed out");
                entry.cancelled.store(true, Ordering::Relaxed);
                entry.state = TaskState::TimedOut;
            }
        }
    }
}

impl AiService for AiClient {
    fn submit(&mut self, service: ServiceType, input: PixelBuffer, params: ParamMap) -> Result<TaskId, AiError> {
        if self.config.mode == ProcessingMode::Offline {
            return Err(AiError::Offline);
        }
        // Reject before queueing anything
        self.pick_backend(service)?;
        if self.active_tasks() >= self.config.max_concurrent {
            return Err(AiError::Busy(self.config.max_concurrent));
        }
        let id = Uuid::new_v4();
        self.tasks.insert(
            id,
            TaskEntry {
                service,
                state: TaskState::Queued,
                progress: 0.0,
                started: Instant::now(),
                cancelled: Arc::new(AtomicBool::new(false)),
                attempt: 0,
                result: None,
                request: (input, params),
            },
        );
        if let Err(e) = self.dispatch(id) {
            self.tasks.remove(&id);
            return Err(e);
        }
        debug!(task = %id, service = service.name(), "AI task submitted");
        Ok(id)
    }

    fn poll(&mut self, id: TaskId) -> Option<TaskStatus> {
        self.drain_events();
        self.tasks.get(&id).map(|t| TaskStatus {
            service: t.service,
            state: t.state.clone(),
            progress: t.progress,
            elapsed: t.started.elapsed(),
        })
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        self.drain_events();
        match self.tasks.get_mut(&id) {
            Some(entry) if entry.state.is_active() => {
                entry.cancelled.store(true, Ordering::Relaxed);
                entry.state = TaskState::Cancelled;
                entry.result = None;
                debug!(task = %id, "AI task cancelled");
                true
            }
            _ => false,
        }
    }

    fn take_result(&mut self, id: TaskId) -> Option<PixelBuffer> {
        self.drain_events();
        if self.tasks.get(&id)?.state != TaskState::Completed {
            return None;
        }
        self.tasks.remove(&id).and_then(|t| t.result)
    }
}

impl Drop for AiClient {
    fn drop(&mut self) {
        for entry in self.tasks.values() {
            entry.cancelled.store(true, Ordering::Relaxed);
        }
        // Closing the job channel ends the worker loop
        self.jobs = None;
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            warn!("AI worker thread panicked");
        }
    }
}

fn worker_loop(jobs: Receiver<Job>, events: Sender<WorkerMessage>) {
    while let Ok(job) = jobs.recv() {
        let Job::Run {
            id,
            service,
            input,
            params,
            attempt,
            backend,
            cancelled,
        } = job;
        if cancelled.load(Ordering::Relaxed) {
            continue;
        }
        let message = |update| WorkerMessage { id, attempt, update };
        let _ = events.send(message(Update::Started));
        let progress_tx = events.clone();
        let progress = move |p: f32| {
            let _ = progress_tx.send(WorkerMessage {
                id,
                attempt,
                update: Update::Progress(p),
            });
        };
        let update = match backend.process(service, &input, &params, &progress, &cancelled) {
            Ok(result) => Update::Completed(result),
            Err(e) => Update::Failed(e),
        };
        if events.send(message(update)).is_err() {
            break;
        }
    }
}
