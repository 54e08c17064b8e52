// src/pipeline/interval.rs
//
// Drives one video through its measurement intervals:
// sample -> letterbox -> segment -> extract calipers -> stability gate ->
// overlay -> encode, then reduces the accepted per-frame means.

use super::metrics::PipelineMetrics;
use super::stats::{aggregate_interval, output_file_name};
use crate::encoder::{EncoderSettings, FfmpegEncoder};
use crate::error::PipelineError;
use crate::line_extractor::{LineExtractor, LineParams};
use crate::preprocessing::{map_region_to_letterbox, Letterboxer, ResizeBackend};
use crate::sampler::sample_frame_indices;
use crate::segmentation::{SegmentationResult, Segmenter};
use crate::stability::{StabilityConfig, StabilityFilter};
use crate::types::{mean_length_mm, Config, DecoderKind, Interval, IntervalStat, LineSegment, Rect};
use crate::video::{open_source, read_frames, FrameSource, VideoProperties};
use crate::visualizer::{draw_lines, VisualizationParams};
use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Assumed when the container reports no frame rate.
const FALLBACK_FPS: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub pixel_size_mm: f64,
    pub conf_threshold: f32,
    pub batch_size: usize,
    /// Letterbox canvas (width, height); also the encoded frame size.
    pub target_size: (u32, u32),
    pub line: LineParams,
    /// `None` accepts every measured frame.
    pub stability: Option<StabilityConfig>,
    pub visualization: VisualizationParams,
    pub draw_overlay: bool,
    pub save_video: bool,
    pub resize_backend: ResizeBackend,
    pub prefetch_frames: usize,
    pub encoder: EncoderSettings,
    pub decoder: DecoderKind,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ProcessorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pixel_size_mm: cfg.video.pixel_size_mm,
            conf_threshold: cfg.inference.confidence_threshold,
            batch_size: cfg.inference.batch_size,
            target_size: (cfg.inference.target_width, cfg.inference.target_height),
            line: cfg.line.clone(),
            stability: Some(cfg.stability.clone()),
            visualization: cfg.visualization.clone(),
            draw_overlay: cfg.video.draw_overlay,
            save_video: cfg.video.save_video,
            resize_backend: cfg.inference.resize_backend,
            prefetch_frames: cfg.video.prefetch_frames,
            encoder: cfg.encoder.clone(),
            decoder: cfg.video.decoder,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::invalid("batch_size must be > 0"));
        }
        if !(self.pixel_size_mm > 0.0) {
            return Err(PipelineError::invalid("pixel_size_mm must be > 0"));
        }
        if self.target_size.0 == 0 || self.target_size.1 == 0 {
            return Err(PipelineError::invalid("target size must be non-zero"));
        }
        self.line.validate()?;
        if let Some(stability) = &self.stability {
            stability.validate()?;
        }
        Ok(())
    }
}

/// Result of one interval. Encoder failures stay local to their interval.
#[derive(Debug)]
pub struct IntervalOutcome {
    /// 1-based position in the requested interval list.
    pub index: usize,
    pub interval: Interval,
    pub result: Result<IntervalStat>,
}

/// Still-image measurement, in letterboxed coordinates.
#[derive(Debug, Clone)]
pub struct ImageMeasurement {
    pub lines: Vec<LineSegment>,
    pub mean_mm: Option<f64>,
    pub confidence: Option<f32>,
    pub bbox: Option<[f32; 4]>,
    /// Letterboxed frame, annotated when overlays are enabled.
    pub image: RgbImage,
}

struct VideoContext {
    stem: String,
    props: VideoProperties,
    src_fps: f64,
    target_fps: f64,
    output_dir: PathBuf,
    region: Option<Rect>,
}

struct IntervalState {
    batch: Vec<(usize, RgbImage)>,
    filter: Option<StabilityFilter>,
    encoder: Option<FfmpegEncoder>,
    frame_means: Vec<(usize, f64)>,
    processed: usize,
}

pub struct IntervalProcessor<S: Segmenter> {
    segmenter: S,
    options: ProcessorOptions,
    letterboxer: Letterboxer,
    abort: Arc<AtomicBool>,
    metrics: PipelineMetrics,
}

impl<S: Segmenter> IntervalProcessor<S> {
    pub fn new(segmenter: S, options: ProcessorOptions) -> Result<Self> {
        options.validate()?;
        let letterboxer = Letterboxer::new(options.target_size, options.resize_backend);
        Ok(Self {
            segmenter,
            options,
            letterboxer,
            abort: Arc::new(AtomicBool::new(false)),
            metrics: PipelineMetrics::new(),
        })
    }

    /// Shares an external cancellation flag, checked between frames.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Opens `path` and processes every interval. Failing to open the
    /// source is fatal; encoder failures only fail their own interval.
    pub fn process_video(
        &mut self,
        path: &Path,
        intervals: &[Interval],
        target_fps: f64,
        output_dir: &Path,
        region: Option<Rect>,
    ) -> Result<Vec<IntervalOutcome>> {
        let mut source = open_source(path, self.options.decoder, &self.options.encoder.ffmpeg_bin)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        self.process_source(source.as_mut(), &stem, intervals, target_fps, output_dir, region)
    }

    /// Same as `process_video` over an already opened source.
    pub fn process_source(
        &mut self,
        source: &mut dyn FrameSource,
        stem: &str,
        intervals: &[Interval],
        target_fps: f64,
        output_dir: &Path,
        region: Option<Rect>,
    ) -> Result<Vec<IntervalOutcome>> {
        if self.options.save_video {
            std::fs::create_dir_all(output_dir)
                .with_context(|| format!("creating output dir {}", output_dir.display()))?;
        }

        let props = source.properties();
        let src_fps = if props.fps > 0.0 {
            props.fps
        } else {
            warn!("Source reports no frame rate, assuming {} fps", FALLBACK_FPS);
            FALLBACK_FPS
        };

        let region = region.map(|r| {
            let geom = self.letterboxer.geometry(props.width, props.height);
            let mapped = map_region_to_letterbox(r, &geom);
            if mapped.is_empty() {
                warn!("Region {:?} falls outside the frame, no calipers will be drawn", r);
            }
            debug!("Region {:?} -> letterbox {:?}", r, mapped);
            mapped
        });

        let ctx = VideoContext {
            stem: stem.to_string(),
            props,
            src_fps,
            target_fps,
            output_dir: output_dir.to_path_buf(),
            region,
        };

        let mut outcomes = Vec::with_capacity(intervals.len());
        for (i, interval) in intervals.iter().enumerate() {
            if self.abort.load(Ordering::Relaxed) {
                warn!("Abort requested, skipping {} remaining interval(s)", intervals.len() - i);
                break;
            }

            let k = i + 1;
            match self.run_interval(source, &ctx, k, interval) {
                Ok(stat) => {
                    info!(
                        "✓ Interval {} [{:.1}s-{:.1}s]: {}/{} frames accepted, mean {:.3} mm, max {:.3} mm",
                        k,
                        stat.start_s,
                        stat.end_s,
                        stat.accepted_frames,
                        stat.processed_frames,
                        stat.mean_of_means_mm,
                        stat.max_of_means_mm
                    );
                    outcomes.push(IntervalOutcome {
                        index: k,
                        interval: *interval,
                        result: Ok(stat),
                    });
                }
                Err(e) if is_interval_local(&e) => {
                    error!("❌ Interval {} failed: {:#}", k, e);
                    outcomes.push(IntervalOutcome {
                        index: k,
                        interval: *interval,
                        result: Err(e),
                    });
                }
                Err(e) => return Err(e.context(format!("processing interval {}", k))),
            }
        }

        Ok(outcomes)
    }

    /// Letterboxes, segments and measures still images in batches.
    /// No stability filter is applied.
    pub fn process_images(&mut self, images: &[RgbImage], region: Option<Rect>) -> Result<Vec<ImageMeasurement>> {
        let Some(first) = images.first() else {
            return Ok(Vec::new());
        };
        let region = region.map(|r| {
            map_region_to_letterbox(r, &self.letterboxer.geometry(first.width(), first.height()))
        });

        let mut results = Vec::with_capacity(images.len());
        for chunk in images.chunks(self.options.batch_size) {
            for (image, pred) in self.infer(chunk)? {
                let lines = self.measure(&image, pred.as_ref(), region)?;
                let mean_mm = mean_length_mm(&lines, self.options.pixel_size_mm);
                let image = if self.options.draw_overlay {
                    draw_lines(&image, &lines, self.options.pixel_size_mm, &self.options.visualization)
                } else {
                    image
                };
                results.push(ImageMeasurement {
                    confidence: pred.as_ref().map(|p| p.confidence),
                    bbox: pred.as_ref().map(|p| p.bbox),
                    lines,
                    mean_mm,
                    image,
                });
            }
        }

        info!(
            "Measured {} image(s), {} with calipers",
            results.len(),
            results.iter().filter(|r| r.mean_mm.is_some()).count()
        );
        Ok(results)
    }

    fn run_interval(
        &mut self,
        source: &mut dyn FrameSource,
        ctx: &VideoContext,
        k: usize,
        interval: &Interval,
    ) -> Result<IntervalStat> {
        let (start_f, end_f) = interval.frame_range(ctx.src_fps, ctx.props.total_frames);
        let sampled = sample_frame_indices(start_f, end_f, ctx.src_fps, ctx.target_fps);
        let out_fps = if ctx.target_fps > 0.0 {
            ctx.target_fps
        } else {
            ctx.src_fps
        };
        let out_path = ctx
            .output_dir
            .join(output_file_name(&ctx.stem, k, interval, out_fps));

        info!(
            "▶ Interval {} [{:.1}s-{:.1}s]: frames {}..={}, {} sampled",
            k,
            interval.start_s,
            interval.end_s,
            start_f,
            end_f,
            sampled.len()
        );

        let encoder = if self.options.save_video {
            let (tw, th) = self.options.target_size;
            Some(FfmpegEncoder::spawn(&out_path, tw, th, out_fps, &self.options.encoder)?)
        } else {
            None
        };

        let mut state = IntervalState {
            batch: Vec::with_capacity(self.options.batch_size),
            filter: self.options.stability.clone().map(StabilityFilter::new),
            encoder,
            frame_means: Vec::new(),
            processed: 0,
        };

        if !sampled.is_empty() && ctx.props.total_frames > 0 {
            source.seek(start_f)?;

            let abort = Arc::clone(&self.abort);
            let mut wanted = sampled.iter().copied().peekable();
            let mut cur = start_f;
            let span = end_f - start_f + 1;

            read_frames(source, span, self.options.prefetch_frames, |frame| {
                if abort.load(Ordering::Relaxed) {
                    return Ok(false);
                }
                if wanted.peek() == Some(&cur) {
                    wanted.next();
                    state.batch.push((cur, frame));
                    if state.batch.len() >= self.options.batch_size {
                        self.flush_batch(&mut state, ctx.region)?;
                    }
                }
                cur += 1;

                let stopped = state.filter.as_ref().is_some_and(|f| f.is_stopped());
                Ok(!stopped && wanted.peek().is_some())
            })?;
        }

        self.flush_batch(&mut state, ctx.region)?;

        let output_path = match state.encoder.take() {
            Some(encoder) => {
                encoder.close()?;
                Some(out_path)
            }
            None => None,
        };

        let stopped = state.filter.as_ref().is_some_and(|f| f.is_stopped());
        if stopped {
            warn!("⚠️  Interval {} stopped early after repeated implausible measurements", k);
        }

        let agg = aggregate_interval(&state.frame_means, ctx.src_fps);
        Ok(IntervalStat {
            start_s: interval.start_s,
            end_s: interval.end_s,
            frame_count: sampled.len(),
            processed_frames: state.processed,
            accepted_frames: state.frame_means.len(),
            stopped_early: stopped || self.abort.load(Ordering::Relaxed),
            mean_of_means_mm: agg.mean_of_means_mm,
            max_of_means_mm: agg.max_of_means_mm,
            max_at_s: agg.max_at_s,
            output_path,
        })
    }

    fn flush_batch(&mut self, state: &mut IntervalState, region: Option<Rect>) -> Result<()> {
        if state.batch.is_empty() {
            return Ok(());
        }
        let (indices, frames): (Vec<usize>, Vec<RgbImage>) = state.batch.drain(..).unzip();
        debug!("Flushing batch of {} frames starting at {}", frames.len(), indices[0]);

        let outputs = self.infer(&frames)?;
        for (idx, (image, pred)) in indices.into_iter().zip(outputs) {
            let t0 = Instant::now();
            let (mean, frame_out) = self.postprocess(image, pred, region, state.filter.as_mut())?;
            self.metrics.add_time(&self.metrics.postprocess_time_us, t0.elapsed());

            state.processed += 1;
            if let Some(mean) = mean {
                state.frame_means.push((idx, mean));
            }
            if let Some(encoder) = state.encoder.as_mut() {
                encoder.write_frame(&frame_out)?;
            }
        }
        Ok(())
    }

    /// Letterbox + segmentation for one batch, order preserved.
    fn infer(&mut self, frames: &[RgbImage]) -> Result<Vec<(RgbImage, Option<SegmentationResult>)>> {
        let t0 = Instant::now();
        let boxed: Vec<RgbImage> = self
            .letterboxer
            .resize_batch(frames)
            .into_iter()
            .map(|r| r.image)
            .collect();
        self.metrics.add_time(&self.metrics.letterbox_time_us, t0.elapsed());

        let t0 = Instant::now();
        let preds = self.segmenter.predict(&boxed, self.options.conf_threshold)?;
        self.metrics.add_time(&self.metrics.inference_time_us, t0.elapsed());
        self.metrics.inc(&self.metrics.batches);

        if preds.len() != boxed.len() {
            return Err(PipelineError::Segmentation(format!(
                "segmenter returned {} results for {} images",
                preds.len(),
                boxed.len()
            ))
            .into());
        }
        Ok(boxed.into_iter().zip(preds).collect())
    }

    fn measure(
        &self,
        frame: &RgbImage,
        pred: Option<&SegmentationResult>,
        region: Option<Rect>,
    ) -> Result<Vec<LineSegment>> {
        let Some(mask) = pred.and_then(|p| p.mask.as_ref()) else {
            return Ok(Vec::new());
        };
        self.metrics.inc(&self.metrics.frames_with_mask);

        let lines = LineExtractor::extract(frame, mask, &self.options.line, region)?;
        if !lines.is_empty() {
            self.metrics.inc(&self.metrics.frames_with_lines);
        }
        Ok(lines)
    }

    /// Returns the accepted frame mean and the frame to encode. Rejected
    /// frames are passed through without overlay.
    fn postprocess(
        &self,
        frame: RgbImage,
        pred: Option<SegmentationResult>,
        region: Option<Rect>,
        filter: Option<&mut StabilityFilter>,
    ) -> Result<(Option<f64>, RgbImage)> {
        self.metrics.inc(&self.metrics.frames_processed);

        let lines = self.measure(&frame, pred.as_ref(), region)?;
        let Some(mean) = mean_length_mm(&lines, self.options.pixel_size_mm) else {
            return Ok((None, frame));
        };

        if let Some(filter) = filter {
            if !filter.add(mean) {
                self.metrics.inc(&self.metrics.frames_rejected);
                return Ok((None, frame));
            }
        }
        self.metrics.inc(&self.metrics.frames_accepted);

        let out = if self.options.draw_overlay {
            draw_lines(&frame, &lines, self.options.pixel_size_mm, &self.options.visualization)
        } else {
            frame
        };
        Ok((Some(mean), out))
    }
}

fn is_interval_local(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::EncoderSpawn { .. } | PipelineError::Encoder(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::Mask;
    use crate::types::NO_DATA;
    use crate::video::MemorySource;
    use approx::assert_relative_eq;
    use image::Rgb;

    /// Segments every pixel brighter than mid-gray.
    struct ThresholdSegmenter {
        calls: usize,
        abort_on_first_call: Option<Arc<AtomicBool>>,
        mask_size: Option<(u32, u32)>,
    }

    impl ThresholdSegmenter {
        fn new() -> Self {
            Self {
                calls: 0,
                abort_on_first_call: None,
                mask_size: None,
            }
        }
    }

    impl Segmenter for ThresholdSegmenter {
        fn predict(
            &mut self,
            images: &[RgbImage],
            _conf_threshold: f32,
        ) -> Result<Vec<Option<SegmentationResult>>> {
            self.calls += 1;
            if let Some(flag) = &self.abort_on_first_call {
                flag.store(true, Ordering::Relaxed);
            }
            Ok(images
                .iter()
                .map(|img| {
                    let (w, h) = self.mask_size.unwrap_or(img.dimensions());
                    let bright = |x: u32, y: u32| {
                        x < img.width() && y < img.height() && img.get_pixel(x, y).0[0] > 127
                    };
                    let mask = Mask::from_fn(w, h, bright);
                    if mask.binarize().is_empty() {
                        return None;
                    }
                    Some(SegmentationResult {
                        bbox: [0.0, 0.0, w as f32, h as f32],
                        confidence: 0.9,
                        mask: Some(mask),
                    })
                })
                .collect())
        }
    }

    /// White band over rows 20..=bottom, columns 8..56.
    fn band_frame(bottom: u32) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if (8..56).contains(&x) && y >= 20 && y <= bottom {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn source_with(frames: Vec<RgbImage>) -> MemorySource {
        MemorySource::new(frames, 10.0).unwrap()
    }

    fn options() -> ProcessorOptions {
        ProcessorOptions {
            pixel_size_mm: 0.1,
            batch_size: 4,
            target_size: (64, 64),
            save_video: false,
            ..Default::default()
        }
    }

    fn run(
        processor: &mut IntervalProcessor<ThresholdSegmenter>,
        source: &mut MemorySource,
        intervals: &[Interval],
        target_fps: f64,
    ) -> Result<Vec<IntervalOutcome>> {
        let dir = tempfile::tempdir().unwrap();
        processor.process_source(source, "clip", intervals, target_fps, dir.path(), None)
    }

    #[test]
    fn test_steady_band_measures_every_frame() {
        let mut source = source_with(vec![band_frame(44); 30]);
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), options()).unwrap();
        let intervals = [Interval::new(0.0, 1.0).unwrap()];

        let outcomes = run(&mut processor, &mut source, &intervals, 10.0).unwrap();
        assert_eq!(outcomes.len(), 1);
        let stat = outcomes[0].result.as_ref().unwrap();
        assert_eq!(stat.frame_count, 11);
        assert_eq!(stat.processed_frames, 11);
        assert_eq!(stat.accepted_frames, 11);
        assert!(!stat.stopped_early);
        assert_relative_eq!(stat.mean_of_means_mm, 2.4, epsilon = 1e-9);
        assert_relative_eq!(stat.max_of_means_mm, 2.4, epsilon = 1e-9);
        assert_eq!(stat.max_at_s, Some(0.0));
        assert!(stat.output_path.is_none());
        // 11 frames in batches of 4
        assert_eq!(processor.segmenter.calls, 3);
    }

    #[test]
    fn test_downsampled_interval() {
        let mut source = source_with(vec![band_frame(44); 30]);
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), options()).unwrap();
        let intervals = [Interval::new(0.0, 1.0).unwrap()];

        let outcomes = run(&mut processor, &mut source, &intervals, 5.0).unwrap();
        let stat = outcomes[0].result.as_ref().unwrap();
        assert_eq!(stat.frame_count, 5);
        assert_eq!(stat.processed_frames, 5);
    }

    #[test]
    fn test_blank_video_reports_sentinel() {
        let mut source = source_with(vec![RgbImage::new(64, 64); 20]);
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), options()).unwrap();
        let intervals = [Interval::new(0.0, 1.0).unwrap()];

        let outcomes = run(&mut processor, &mut source, &intervals, 10.0).unwrap();
        let stat = outcomes[0].result.as_ref().unwrap();
        assert_eq!(stat.processed_frames, 11);
        assert!(!stat.has_data());
        assert_eq!(stat.mean_of_means_mm, NO_DATA);
        assert_eq!(stat.max_of_means_mm, NO_DATA);
        assert!(stat.max_at_s.is_none());
    }

    #[test]
    fn test_implausible_jump_stops_interval() {
        let frames: Vec<RgbImage> = (0..30).map(|i| band_frame(if i % 2 == 0 { 44 } else { 50 })).collect();
        let mut source = source_with(frames);
        let opts = ProcessorOptions {
            batch_size: 1,
            stability: Some(StabilityConfig {
                require_baseline: false,
                roc_abs_max: 0.0,
                consec_bad_stop: 1,
                ..Default::default()
            }),
            ..options()
        };
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), opts).unwrap();
        let intervals = [Interval::new(0.0, 1.0).unwrap()];

        let outcomes = run(&mut processor, &mut source, &intervals, 10.0).unwrap();
        let stat = outcomes[0].result.as_ref().unwrap();
        assert!(stat.stopped_early);
        assert_eq!(stat.processed_frames, 2);
        assert_eq!(stat.accepted_frames, 1);
        assert_eq!(stat.frame_count, 11);
    }

    #[test]
    fn test_abort_flag_stops_processing() {
        let flag = Arc::new(AtomicBool::new(false));
        let segmenter = ThresholdSegmenter {
            abort_on_first_call: Some(Arc::clone(&flag)),
            ..ThresholdSegmenter::new()
        };
        let opts = ProcessorOptions {
            batch_size: 2,
            ..options()
        };
        let mut processor = IntervalProcessor::new(segmenter, opts)
            .unwrap()
            .with_abort_flag(flag);
        let mut source = source_with(vec![band_frame(44); 30]);
        let intervals = [
            Interval::new(0.0, 1.0).unwrap(),
            Interval::new(1.0, 2.0).unwrap(),
        ];

        let outcomes = run(&mut processor, &mut source, &intervals, 10.0).unwrap();
        assert_eq!(outcomes.len(), 1);
        let stat = outcomes[0].result.as_ref().unwrap();
        assert!(stat.stopped_early);
        assert_eq!(stat.processed_frames, 2);
    }

    #[test]
    fn test_encoder_failure_is_isolated_per_interval() {
        let mut opts = options();
        opts.save_video = true;
        opts.encoder.ffmpeg_bin = "definitely-not-ffmpeg-binary".to_string();
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), opts).unwrap();
        let mut source = source_with(vec![band_frame(44); 30]);
        let intervals = [
            Interval::new(0.0, 1.0).unwrap(),
            Interval::new(1.0, 2.0).unwrap(),
        ];

        let outcomes = run(&mut processor, &mut source, &intervals, 10.0).unwrap();
        assert_eq!(outcomes.len(), 2);
        for o in &outcomes {
            let err = o.result.as_ref().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::EncoderSpawn { .. })
            ));
        }
        assert_eq!(outcomes[1].index, 2);
    }

    #[test]
    fn test_misaligned_mask_propagates() {
        let segmenter = ThresholdSegmenter {
            mask_size: Some((32, 32)),
            ..ThresholdSegmenter::new()
        };
        let mut processor = IntervalProcessor::new(segmenter, options()).unwrap();
        let mut source = source_with(vec![band_frame(44); 30]);
        let intervals = [Interval::new(0.0, 1.0).unwrap()];

        let err = run(&mut processor, &mut source, &intervals, 10.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_process_images() {
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), options()).unwrap();
        let images = vec![band_frame(44), RgbImage::new(64, 64)];

        let results = processor.process_images(&images, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_relative_eq!(results[0].mean_mm.unwrap(), 2.4, epsilon = 1e-9);
        assert_eq!(results[0].confidence, Some(0.9));
        assert!(!results[0].lines.is_empty());
        assert!(results[1].mean_mm.is_none());
        assert!(results[1].bbox.is_none());
    }

    fn has_x264() -> bool {
        std::process::Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains("libx264"))
            .unwrap_or(false)
    }

    #[test]
    fn test_interval_video_is_written() {
        if !has_x264() {
            eprintln!("ffmpeg with libx264 not available, skipping");
            return;
        }
        let mut source = MemorySource::new(vec![band_frame(44); 40], 30.0).unwrap();
        let opts = ProcessorOptions {
            pixel_size_mm: 1.0,
            save_video: true,
            ..options()
        };
        let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), opts).unwrap();
        let intervals = [Interval::new(0.0, 1.0).unwrap()];
        let dir = tempfile::tempdir().unwrap();

        let outcomes = processor
            .process_source(&mut source, "clip", &intervals, 30.0, dir.path(), None)
            .unwrap();
        let stat = outcomes[0].result.as_ref().unwrap();
        assert_eq!(stat.processed_frames, 31);
        assert_relative_eq!(stat.mean_of_means_mm, 24.0, epsilon = 1e-9);

        let path = stat.output_path.as_ref().unwrap();
        assert_eq!(path, &dir.path().join("clip_seg_1_0-1_30fps.mp4"));
        assert!(std::fs::metadata(path).unwrap().len() > 0);
    }

    #[test]
    fn test_prefetch_gives_same_stats() {
        let frames: Vec<RgbImage> = (0..30).map(|i| band_frame(40 + (i % 3))).collect();
        let intervals = [
            Interval::new(0.0, 1.0).unwrap(),
            Interval::new(1.5, 2.5).unwrap(),
        ];

        let stats_with = |prefetch_frames: usize| {
            let opts = ProcessorOptions {
                prefetch_frames,
                batch_size: 3,
                ..options()
            };
            let mut processor = IntervalProcessor::new(ThresholdSegmenter::new(), opts).unwrap();
            let mut source = source_with(frames.clone());
            run(&mut processor, &mut source, &intervals, 5.0)
                .unwrap()
                .into_iter()
                .map(|o| o.result.unwrap())
                .collect::<Vec<_>>()
        };

        let inline = stats_with(0);
        let prefetched = stats_with(4);
        assert_eq!(inline.len(), 2);
        assert!(inline.iter().all(|s| s.processed_frames > 0 && s.has_data()));
        assert_eq!(inline, prefetched);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let opts = ProcessorOptions {
            batch_size: 0,
            ..options()
        };
        assert!(IntervalProcessor::new(ThresholdSegmenter::new(), opts).is_err());
    }
}
