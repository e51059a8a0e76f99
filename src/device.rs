//! V4L2 driver implementation using the v4l crate.
//!
//! V4L2 has no driver-managed ring of user buffers, so the slots live in a
//! [`CaptureSequence`]. A capture thread streams mmap frames and copies each
//! one into the active slot, which signals the frame-ready event.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::sequence::CaptureSequence;
use crate::traits::{
    ActiveSlot, AntiFlickerMode, CameraError, CameraHandle, CameraSdk, ColorFormat,
    HardwareGains, ImageFormatInfo, MemoryHandle, RegionOfInterest, Result, SlotId, WaitOutcome,
};

/// Kernel buffers queued by the capture thread.
const STREAM_BUFFERS: u32 = 4;

/// Poll timeout of the capture thread, bounds how long `stop_capture` blocks.
const STREAM_POLL: Duration = Duration::from_millis(500);

const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L2_CID_RED_BALANCE: u32 = 0x0098_090e;
const V4L2_CID_BLUE_BALANCE: u32 = 0x0098_090f;
const V4L2_CID_POWER_LINE_FREQUENCY: u32 = 0x0098_0918;
const V4L2_CID_SHARPNESS: u32 = 0x0098_091b;

struct CaptureWorker {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CaptureWorker {
    /// Signal the thread to finish and join it.
    fn stop(self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        join_worker(self.thread)?;
        debug!("Capture thread stopped");
        Ok(())
    }
}

fn join_worker(thread: JoinHandle<()>) -> Result<()> {
    thread.join().map_err(|_| {
        warn!("Capture thread panicked");
        CameraError::StreamError("capture thread panicked".to_owned())
    })
}

struct OpenDevice {
    handle: CameraHandle,
    device: Arc<Device>,
    controls: BTreeSet<u32>,
    formats: Vec<ImageFormatInfo>,
    worker: Option<CaptureWorker>,
}

impl OpenDevice {
    /// Write an integer control. Returns `false` when the device lacks it.
    fn set_control(&self, id: u32, name: &'static str, value: i64) -> Result<bool> {
        if !self.controls.contains(&id) {
            debug!("Control {name} not supported; skipped");
            return Ok(false);
        }
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| CameraError::Control {
                control: name,
                reason: err.to_string(),
            })?;
        debug!("{name} = {value}");
        Ok(true)
    }

    fn set_format(&self, width: u32, height: u32, format: ColorFormat) -> Result<v4l::Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = format.fourcc().into();
        self.device
            .set_format(&fmt)
            .map_err(|err| CameraError::StreamError(err.to_string()))
    }
}

/// V4L2 driver. One camera may be open at a time.
pub struct V4l2Sdk {
    open: Mutex<Option<OpenDevice>>,
    sequence: Arc<CaptureSequence>,
}

impl Default for V4l2Sdk {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Sdk {
    /// Driver with no camera open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: Mutex::new(None),
            sequence: Arc::new(CaptureSequence::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenDevice>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<T, F>(&self, handle: CameraHandle, f: F) -> Result<T>
    where
        F: FnOnce(&mut OpenDevice) -> Result<T>,
    {
        let mut open = self.lock();
        match open.as_mut() {
            Some(device) if device.handle == handle => f(device),
            _ => Err(CameraError::InvalidHandle(handle)),
        }
    }

    fn check(&self, handle: CameraHandle) -> Result<()> {
        self.with_device(handle, |_| Ok(()))
    }

    /// Frames written into the slots since the driver was created.
    pub fn frames_completed(&self) -> u64 {
        self.sequence.frames_completed()
    }
}

impl CameraSdk for V4l2Sdk {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    /// `camera_id` is the `/dev/videoN` index.
    fn device_init(&self, camera_id: u32) -> Result<CameraHandle> {
        let mut open = self.lock();
        if open.is_some() {
            return Err(CameraError::DeviceInit {
                camera_id,
                reason: "a camera is already open".to_owned(),
            });
        }

        let init_error = |err: std::io::Error| CameraError::DeviceInit {
            camera_id,
            reason: err.to_string(),
        };
        let device = Device::new(camera_id as usize).map_err(init_error)?;
        let caps = device.query_caps().map_err(init_error)?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE | v4l::capability::Flags::STREAMING)
        {
            return Err(CameraError::DeviceInit {
                camera_id,
                reason: format!("{} cannot stream video capture", caps.card),
            });
        }

        let controls = device
            .query_controls()
            .map(|descriptions| descriptions.into_iter().map(|desc| desc.id).collect())
            .unwrap_or_else(|err| {
                warn!("Could not enumerate controls: {err}");
                BTreeSet::new()
            });

        info!(
            "Opened /dev/video{camera_id}: {} ({})",
            caps.card, caps.driver
        );
        let handle = CameraHandle(camera_id);
        *open = Some(OpenDevice {
            handle,
            device: Arc::new(device),
            controls,
            formats: Vec::new(),
            worker: None,
        });
        Ok(handle)
    }

    /// The camera is closed even when its capture thread fails to stop;
    /// that failure is reported afterwards.
    fn device_exit(&self, handle: CameraHandle) -> Result<()> {
        let open = {
            let mut open = self.lock();
            match open.take() {
                Some(device) if device.handle == handle => device,
                other => {
                    *open = other;
                    return Err(CameraError::InvalidHandle(handle));
                }
            }
        };
        self.sequence.set_event_enabled(false);
        let stopped = open.worker.map_or(Ok(()), CaptureWorker::stop);
        debug!("Closed camera {handle:?}");
        stopped
    }

    fn query_format_list(&self, handle: CameraHandle) -> Result<Vec<ImageFormatInfo>> {
        self.with_device(handle, |open| {
            let sizes = open
                .device
                .enum_framesizes(ColorFormat::Uyvy.fourcc().into())
                .map_err(|err| CameraError::StreamError(err.to_string()))?;

            let formats: Vec<ImageFormatInfo> = sizes
                .into_iter()
                .filter_map(|size| match size.size {
                    FrameSizeEnum::Discrete(discrete) => Some((discrete.width, discrete.height)),
                    FrameSizeEnum::Stepwise(stepwise) => {
                        Some((stepwise.max_width, stepwise.max_height))
                    }
                })
                .zip(1..)
                .map(|((width, height), format_id)| ImageFormatInfo {
                    width,
                    height,
                    format_id,
                })
                .collect();

            open.formats.clone_from(&formats);
            Ok(formats)
        })
    }

    fn set_image_format(&self, handle: CameraHandle, format_id: u32) -> Result<()> {
        self.with_device(handle, |open| {
            let format = open
                .formats
                .iter()
                .find(|format| format.format_id == format_id)
                .copied()
                .ok_or_else(|| {
                    CameraError::StreamError(format!("Unknown image format id {format_id}"))
                })?;
            open.set_format(format.width, format.height, ColorFormat::Uyvy)?;
            Ok(())
        })
    }

    fn set_region_of_interest(&self, handle: CameraHandle, roi: RegionOfInterest) -> Result<()> {
        self.with_device(handle, |open| {
            if roi.x != 0 || roi.y != 0 {
                warn!(
                    "Offsets {},{} not supported by V4L2 capture; using 0,0",
                    roi.x, roi.y
                );
            }
            let fmt = open.set_format(roi.width, roi.height, ColorFormat::Uyvy)?;
            if (fmt.width, fmt.height) != (roi.width, roi.height) {
                warn!(
                    "Device selected {}x{} instead of {}x{}; slots keep the requested size",
                    fmt.width, fmt.height, roi.width, roi.height
                );
            }
            Ok(())
        })
    }

    fn allocate_buffer(
        &self,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bit_depth: u32,
    ) -> Result<(MemoryHandle, u32)> {
        self.check(handle)?;
        let size = width as usize * height as usize * (bit_depth as usize).div_ceil(8);
        Ok(self.sequence.allocate(size))
    }

    fn register_buffer(
        &self,
        handle: CameraHandle,
        memory: MemoryHandle,
        slot: SlotId,
    ) -> Result<()> {
        self.check(handle)?;
        self.sequence.register(memory, slot)
    }

    fn clear_sequence(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        self.sequence.clear();
        Ok(())
    }

    fn free_buffer(&self, handle: CameraHandle, memory: MemoryHandle, _raw_slot: u32) -> Result<()> {
        self.check(handle)?;
        self.sequence.free(memory)
    }

    fn set_exposure(&self, handle: CameraHandle, exposure_ms: f64) -> Result<()> {
        // V4L2 exposure is in units of 100 µs
        #[allow(clippy::cast_possible_truncation)]
        let units = (exposure_ms * 10.0).round() as i64;
        self.with_device(handle, |open| {
            open.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, "exposure", units)
                .map(drop)
        })
    }

    fn set_gains(&self, handle: CameraHandle, gains: HardwareGains) -> Result<()> {
        self.with_device(handle, |open| {
            open.set_control(V4L2_CID_GAIN, "master gain", i64::from(gains.master))?;
            open.set_control(V4L2_CID_RED_BALANCE, "red gain", i64::from(gains.red))?;
            open.set_control(V4L2_CID_BLUE_BALANCE, "blue gain", i64::from(gains.blue))?;
            if gains.green != 0 {
                debug!("No V4L2 green gain control; {} ignored", gains.green);
            }
            Ok(())
        })
    }

    fn set_anti_flicker(&self, handle: CameraHandle, mode: AntiFlickerMode) -> Result<()> {
        let value = match mode {
            AntiFlickerMode::Off => 0,
            AntiFlickerMode::Fixed50Hz => 1,
            AntiFlickerMode::Fixed60Hz => 2,
        };
        self.with_device(handle, |open| {
            open.set_control(V4L2_CID_POWER_LINE_FREQUENCY, "anti-flicker", value)
                .map(drop)
        })
    }

    fn set_color_mode(&self, handle: CameraHandle, format: ColorFormat) -> Result<()> {
        self.with_device(handle, |open| {
            let current = open
                .device
                .format()
                .map_err(|err| CameraError::StreamError(err.to_string()))?;
            let fmt = open.set_format(current.width, current.height, format)?;
            let selected = crate::traits::FourCC::from(fmt.fourcc);
            if selected != format.fourcc() {
                return Err(CameraError::Control {
                    control: "color mode",
                    reason: format!("device selected {selected} instead of {format}"),
                });
            }
            Ok(())
        })
    }

    fn set_frame_rate(&self, handle: CameraHandle, fps: f64) -> Result<f64> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let requested = fps.round().max(1.0) as u32;
        self.with_device(handle, |open| {
            let params = open
                .device
                .set_params(&Parameters::with_fps(requested))
                .map_err(|err| CameraError::Control {
                    control: "frame rate",
                    reason: err.to_string(),
                })?;
            let interval = params.interval;
            if interval.numerator == 0 {
                return Ok(fps);
            }
            Ok(f64::from(interval.denominator) / f64::from(interval.numerator))
        })
    }

    fn enable_frame_event(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        self.sequence.set_event_enabled(true);
        Ok(())
    }

    fn start_continuous_capture(&self, handle: CameraHandle) -> Result<()> {
        self.with_device(handle, |open| {
            if open.worker.is_some() {
                return Err(CameraError::AlreadyCapturing);
            }

            let running = Arc::new(AtomicBool::new(true));
            let (ready_tx, ready_rx) = mpsc::channel();
            let device = Arc::clone(&open.device);
            let sequence = Arc::clone(&self.sequence);
            let flag = Arc::clone(&running);

            let thread = std::thread::Builder::new()
                .name("v4l2-capture".to_owned())
                .spawn(move || capture_loop(&device, &sequence, &flag, &ready_tx))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    open.worker = Some(CaptureWorker { running, thread });
                    debug!("Capture thread started");
                    Ok(())
                }
                Ok(Err(reason)) => {
                    join_worker(thread)?;
                    Err(CameraError::StreamError(reason))
                }
                Err(_) => {
                    join_worker(thread)?;
                    Err(CameraError::StreamError(
                        "capture thread exited during start".to_owned(),
                    ))
                }
            }
        })
    }

    fn stop_capture(&self, handle: CameraHandle) -> Result<()> {
        let worker = self.with_device(handle, |open| Ok(open.worker.take()))?;
        self.sequence.set_event_enabled(false);
        worker.map_or(Ok(()), CaptureWorker::stop)
    }

    fn active_slot(&self, handle: CameraHandle) -> Result<ActiveSlot> {
        self.check(handle)?;
        self.sequence.active_slot()
    }

    fn wait_for_frame_event(
        &self,
        handle: CameraHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        self.check(handle)?;
        self.sequence.wait_event(timeout)
    }

    fn slot_data(&self, handle: CameraHandle, memory: MemoryHandle) -> Result<Arc<[u8]>> {
        self.check(handle)?;
        self.sequence.data(memory)
    }

    fn set_edge_enhancement(&self, handle: CameraHandle, level: u32) -> Result<()> {
        self.with_device(handle, |open| {
            if open.set_control(V4L2_CID_SHARPNESS, "edge enhancement", i64::from(level))? {
                Ok(())
            } else {
                Err(CameraError::Control {
                    control: "edge enhancement",
                    reason: "no sharpness control".to_owned(),
                })
            }
        })
    }
}

type StartReport = std::result::Result<(), String>;

/// Tell `start_continuous_capture` how stream setup went. Returns `false`
/// when nobody is listening any more.
fn report_start(ready: &mpsc::Sender<StartReport>, report: StartReport) -> bool {
    if ready.send(report).is_err() {
        warn!("Capture start was abandoned before the stream came up");
        return false;
    }
    true
}

fn capture_loop(
    device: &Device,
    sequence: &CaptureSequence,
    running: &AtomicBool,
    ready: &mpsc::Sender<StartReport>,
) {
    let mut stream = match Stream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(err) => {
            report_start(ready, Err(err.to_string()));
            return;
        }
    };
    stream.set_timeout(STREAM_POLL);
    if !report_start(ready, Ok(())) {
        return;
    }

    while running.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                let bytes = if used == 0 { buf } else { buf.get(..used).unwrap_or(buf) };
                if !sequence.complete_frame(bytes) {
                    warn!("Frame {} dropped: no slots registered", meta.sequence);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!("Capture stream failed: {err}");
                sequence.fail(&format!("capture stream failed: {err}"));
                break;
            }
        }
    }
}
