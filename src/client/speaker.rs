//! Active speaker detection from an audio analyser.

use futures_util::stream::{self, Stream, StreamExt};
use log::debug;
use parking_lot::Mutex;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Summed byte magnitudes above this count as speech.
pub const SPEAKING_THRESHOLD: u32 = 3000;
pub const FFT_SIZE: usize = 512;
/// One animation frame at 60 Hz.
pub const TICK: Duration = Duration::from_millis(16);

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

/// Source of byte frequency data, one bin per frequency band.
pub trait FrequencyAnalyser: Send + 'static {
    /// Current frame, or `None` once the analysed stream has ended.
    fn frequency_data(&mut self) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SpeakerDetector {
    threshold: u32,
    interval: Duration,
}

impl Default for SpeakerDetector {
    fn default() -> Self {
        Self::new(SPEAKING_THRESHOLD, TICK)
    }
}

impl SpeakerDetector {
    pub fn new(threshold: u32, interval: Duration) -> Self {
        Self { threshold, interval }
    }

    pub fn is_active(&self, bins: &[u8]) -> bool {
        bins.iter().map(|&b| u32::from(b)).sum::<u32>() > self.threshold
    }

    /// Polls the analyser once per interval. Consumes the analyser, so a
    /// finished observation cannot be restarted.
    pub fn observe<A: FrequencyAnalyser>(&self, analyser: A) -> impl Stream<Item = bool> + Send {
        let detector = *self;
        stream::unfold(analyser, move |mut analyser| async move {
            tokio::time::sleep(detector.interval).await;
            let bins = analyser.frequency_data()?;
            Some((detector.is_active(&bins), analyser))
        })
    }

    /// Publishes `speaker_id` as the active speaker whenever the analyser
    /// is loud. The previous speaker stays until someone else speaks.
    pub fn spawn<A: FrequencyAnalyser>(
        &self,
        speaker_id: impl Into<String>,
        analyser: A,
        active_speaker: watch::Sender<Option<String>>,
    ) -> SpeakerTask {
        let speaker_id = speaker_id.into();
        let observations = self.observe(analyser);
        let handle = tokio::spawn(async move {
            futures_util::pin_mut!(observations);
            while let Some(active) = observations.next().await {
                if !active {
                    continue;
                }
                active_speaker.send_if_modified(|current| {
                    if current.as_deref() == Some(speaker_id.as_str()) {
                        return false;
                    }
                    debug!("Active speaker is now {}", speaker_id);
                    *current = Some(speaker_id.clone());
                    true
                });
            }
        });
        SpeakerTask { handle }
    }
}

/// Running detection. Dropping it stops the task.
pub struct SpeakerTask {
    handle: JoinHandle<()>,
}

impl SpeakerTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SpeakerTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct SampleWindow {
    samples: VecDeque<f32>,
    smoothed: Vec<f32>,
    finished: bool,
}

/// Analyser over raw PCM. Keeps the last [`FFT_SIZE`] samples and turns
/// them into 0..=255 magnitudes per bin on request.
pub struct SampleAnalyser {
    window: Arc<Mutex<SampleWindow>>,
    fft: Arc<dyn Fft<f32>>,
}

/// Producer half of a [`SampleAnalyser`]. The analysed stream ends when
/// `finish` is called or every feed is dropped.
#[derive(Clone)]
pub struct SampleFeed {
    window: Arc<Mutex<SampleWindow>>,
}

impl SampleAnalyser {
    pub fn channel() -> (SampleFeed, SampleAnalyser) {
        let window = Arc::new(Mutex::new(SampleWindow {
            samples: VecDeque::with_capacity(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
            finished: false,
        }));
        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        (SampleFeed { window: window.clone() }, SampleAnalyser { window, fft })
    }
}

impl SampleFeed {
    pub fn push(&self, pcm: &[i16]) {
        let mut window = self.window.lock();
        for &sample in pcm {
            if window.samples.len() == FFT_SIZE {
                window.samples.pop_front();
            }
            window.samples.push_back(f32::from(sample) / 32768.0);
        }
    }

    pub fn finish(&self) {
        self.window.lock().finished = true;
    }
}

impl FrequencyAnalyser for SampleAnalyser {
    fn frequency_data(&mut self) -> Option<Vec<u8>> {
        if Arc::strong_count(&self.window) == 1 {
            return None;
        }
        let mut window = self.window.lock();
        if window.finished {
            return None;
        }

        let padding = FFT_SIZE - window.samples.len();
        let mut buffer: Vec<Complex32> = std::iter::repeat(0.0)
            .take(padding)
            .chain(window.samples.iter().copied())
            .enumerate()
            .map(|(n, x)| Complex32::new(x * blackman(n), 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let mut bins = Vec::with_capacity(FFT_SIZE / 2);
        for (k, bin) in buffer.iter().take(FFT_SIZE / 2).enumerate() {
            let magnitude = bin.norm() / FFT_SIZE as f32;
            let smoothed = SMOOTHING * window.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            window.smoothed[k] = smoothed;
            bins.push(to_byte(smoothed));
        }
        Some(bins)
    }
}

fn blackman(n: usize) -> f32 {
    let x = 2.0 * PI * n as f32 / FFT_SIZE as f32;
    0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}
